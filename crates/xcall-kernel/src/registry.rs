//! Class registry and method tables
//!
//! Classes are registered all-or-nothing: method ids are computed and checked
//! for collisions across both tables before the name is claimed, so a rejected
//! registration leaves no trace. Descriptors are immutable after registration
//! apart from their liveness refcount and lifecycle state, so lookups made
//! from inside a running handler need no locking beyond the map shard read.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::debug;
use rustc_hash::FxHashMap;
use xcall_sdk::{
    method_id, ClassDef, ClassId, Handler, KernelError, KernelResult, MethodDef, MethodId,
    MethodKind,
};

// ============================================================================
// Methods
// ============================================================================

/// A registered method
#[derive(Clone)]
pub struct MethodDescriptor {
    /// Method name
    pub name: String,
    /// Identifier derived from the name
    pub id: MethodId,
    /// Table this method lives in
    pub kind: MethodKind,
    handler: Handler,
}

impl MethodDescriptor {
    /// Get the handler
    pub fn handler(&self) -> &Handler {
        &self.handler
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Per-class table of one method kind, keyed by id
///
/// Registration order is kept for introspection.
#[derive(Debug)]
pub struct MethodTable {
    kind: MethodKind,
    order: Vec<MethodId>,
    methods: FxHashMap<MethodId, MethodDescriptor>,
}

impl MethodTable {
    fn new(kind: MethodKind) -> Self {
        Self {
            kind,
            order: Vec::new(),
            methods: FxHashMap::default(),
        }
    }

    /// Table kind
    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    /// Resolve a method id
    pub fn get(&self, id: MethodId) -> Option<&MethodDescriptor> {
        self.methods.get(&id)
    }

    /// Check if a method id is present
    pub fn contains(&self, id: MethodId) -> bool {
        self.methods.contains_key(&id)
    }

    /// Methods in registration order
    pub fn iter(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.order.iter().filter_map(|id| self.methods.get(id))
    }

    /// Get the number of methods
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Build both method tables, rejecting any id collision across them
fn build_tables(
    class: &str,
    class_methods: Vec<MethodDef>,
    instance_methods: Vec<MethodDef>,
) -> KernelResult<(MethodTable, MethodTable)> {
    let mut seen: FxHashMap<MethodId, String> = FxHashMap::default();
    let mut class_table = MethodTable::new(MethodKind::Class);
    let mut instance_table = MethodTable::new(MethodKind::Instance);

    let defs = class_methods
        .into_iter()
        .map(|def| (MethodKind::Class, def))
        .chain(instance_methods.into_iter().map(|def| (MethodKind::Instance, def)));

    for (kind, def) in defs {
        let id = method_id(&def.name);
        if let Some(first) = seen.get(&id) {
            return Err(KernelError::MethodIdCollision {
                class: class.to_string(),
                first: first.clone(),
                second: def.name,
                id,
            });
        }
        seen.insert(id, def.name.clone());

        let table = match kind {
            MethodKind::Class => &mut class_table,
            MethodKind::Instance => &mut instance_table,
        };
        table.order.push(id);
        table.methods.insert(
            id,
            MethodDescriptor {
                name: def.name,
                id,
                kind,
                handler: def.handler,
            },
        );
    }

    Ok((class_table, instance_table))
}

// ============================================================================
// Classes
// ============================================================================

/// Lifecycle state of a class
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassState {
    /// Visible to lookups
    Registered = 0,
    /// Unregister requested; removal waits for the last reference
    Unregistering = 1,
    /// Gone from the registry
    Removed = 2,
}

impl ClassState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ClassState::Registered,
            1 => ClassState::Unregistering,
            _ => ClassState::Removed,
        }
    }
}

/// Registered definition of a class
pub struct ClassDescriptor {
    name: String,
    id: ClassId,
    epoch: u64,
    class_methods: MethodTable,
    instance_methods: MethodTable,
    /// Live ClassHandles plus Instances referencing this class
    refcount: AtomicUsize,
    state: AtomicU8,
}

impl ClassDescriptor {
    /// Class name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Class id
    pub fn id(&self) -> ClassId {
        self.id
    }

    /// Registry epoch at which this class was registered
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Class-level methods
    pub fn class_methods(&self) -> &MethodTable {
        &self.class_methods
    }

    /// Instance methods
    pub fn instance_methods(&self) -> &MethodTable {
        &self.instance_methods
    }

    /// Number of handles and instances keeping this class alive
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    /// Current lifecycle state
    pub fn state(&self) -> ClassState {
        ClassState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Resolve a method for the given dispatch kind
    ///
    /// An id present only in the other table is a dispatch-kind mismatch,
    /// reported before anything is invoked.
    pub fn resolve(&self, kind: MethodKind, id: MethodId) -> KernelResult<&MethodDescriptor> {
        let (table, other) = match kind {
            MethodKind::Class => (&self.class_methods, &self.instance_methods),
            MethodKind::Instance => (&self.instance_methods, &self.class_methods),
        };
        if let Some(method) = table.get(id) {
            return Ok(method);
        }
        match other.get(id) {
            Some(method) => Err(KernelError::WrongDispatchKind(format!(
                "'{}' on '{}' is a {}, called as a {}",
                method.name, self.name, method.kind, kind
            ))),
            None => Err(KernelError::UnknownMethod {
                class: self.id,
                method: id,
            }),
        }
    }

    pub(crate) fn retain_ref(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop a liveness reference; true if a deferred unregister is now due
    pub(crate) fn release_ref(&self) -> bool {
        let previous = self.refcount.fetch_sub(1, Ordering::SeqCst);
        if previous == 0 {
            log::error!("class '{}' liveness refcount underflow", self.name);
            panic!("refcount underflow on class '{}'", self.name);
        }
        previous == 1 && self.state() == ClassState::Unregistering
    }
}

impl fmt::Debug for ClassDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDescriptor")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("class_methods", &self.class_methods.len())
            .field("instance_methods", &self.instance_methods.len())
            .field("refcount", &self.refcount())
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Class registry for a kernel
///
/// Thread-safe; every kernel owns its own registry.
pub struct ClassRegistry {
    by_name: DashMap<String, Arc<ClassDescriptor>>,
    by_id: DashMap<ClassId, Arc<ClassDescriptor>>,
    next_id: AtomicU32,
    epoch: AtomicU64,
}

impl ClassRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            by_id: DashMap::new(),
            next_id: AtomicU32::new(1),
            epoch: AtomicU64::new(0),
        }
    }

    /// Register a class
    ///
    /// Fails with `DuplicateClass` if the name is taken and with
    /// `MethodIdCollision` if two methods share an id; either way the
    /// registry is left unchanged.
    pub fn register(&self, def: ClassDef) -> KernelResult<Arc<ClassDescriptor>> {
        let ClassDef {
            name,
            class_methods,
            instance_methods,
        } = def;
        let (class_methods, instance_methods) =
            build_tables(&name, class_methods, instance_methods)?;

        let descriptor = match self.by_name.entry(name) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                return Err(KernelError::DuplicateClass(entry.key().clone()));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let descriptor = Arc::new(ClassDescriptor {
                    name: entry.key().clone(),
                    id: ClassId(self.next_id.fetch_add(1, Ordering::Relaxed)),
                    epoch: self.epoch.fetch_add(1, Ordering::Relaxed) + 1,
                    class_methods,
                    instance_methods,
                    refcount: AtomicUsize::new(0),
                    state: AtomicU8::new(ClassState::Registered as u8),
                });
                // Publish by id before the name entry becomes visible.
                self.by_id.insert(descriptor.id, Arc::clone(&descriptor));
                entry.insert(Arc::clone(&descriptor));
                descriptor
            }
        };

        debug!(
            "registered class '{}' as {} ({} class methods, {} instance methods, epoch {})",
            descriptor.name,
            descriptor.id,
            descriptor.class_methods.len(),
            descriptor.instance_methods.len(),
            descriptor.epoch
        );
        Ok(descriptor)
    }

    /// Find a registered class by name
    pub fn lookup(&self, name: &str) -> KernelResult<Arc<ClassDescriptor>> {
        self.by_name
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|class| class.state() == ClassState::Registered)
            .ok_or_else(|| KernelError::NotFound(name.to_string()))
    }

    /// Find a registered class by id
    pub fn get(&self, id: ClassId) -> KernelResult<Arc<ClassDescriptor>> {
        self.by_id
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|class| class.state() == ClassState::Registered)
            .ok_or_else(|| KernelError::NotFound(id.to_string()))
    }

    /// Request removal of a class
    ///
    /// Returns `true` if the class was removed immediately and `false` if
    /// removal is deferred until the last handle or instance is released.
    pub fn unregister(&self, id: ClassId) -> KernelResult<bool> {
        let class = self
            .by_id
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| KernelError::NotFound(id.to_string()))?;

        match class.state.compare_exchange(
            ClassState::Registered as u8,
            ClassState::Unregistering as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(state) if ClassState::from_u8(state) == ClassState::Unregistering => {
                return Ok(false)
            }
            Err(_) => return Err(KernelError::NotFound(id.to_string())),
        }

        if class.refcount() == 0 && self.finish_unregister(&class) {
            return Ok(true);
        }
        debug!(
            "deferred unregister of class '{}' ({} live references)",
            class.name,
            class.refcount()
        );
        Ok(false)
    }

    /// Remove a class whose unregister was pending
    ///
    /// Exactly one caller wins the state transition and removes the entries.
    pub(crate) fn finish_unregister(&self, class: &Arc<ClassDescriptor>) -> bool {
        if class
            .state
            .compare_exchange(
                ClassState::Unregistering as u8,
                ClassState::Removed as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return false;
        }
        self.by_name
            .remove_if(&class.name, |_, entry| Arc::ptr_eq(entry, class));
        self.by_id.remove(&class.id);
        debug!("unregistered class '{}' ({})", class.name, class.id);
        true
    }

    /// Drop a liveness reference, completing a deferred unregister if due
    pub(crate) fn release_class_ref(&self, class: &Arc<ClassDescriptor>) {
        if class.release_ref() {
            self.finish_unregister(class);
        }
    }

    /// Remove every class immediately
    pub(crate) fn clear(&self) {
        for entry in self.by_id.iter() {
            entry
                .value()
                .state
                .store(ClassState::Removed as u8, Ordering::SeqCst);
        }
        self.by_name.clear();
        self.by_id.clear();
    }

    /// Monotonic count of successful registrations
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Get the number of registered classes
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Names of all registered classes
    pub fn class_names(&self) -> Vec<String> {
        self.by_name.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}
