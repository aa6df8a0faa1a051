//! Object model: Instances and ClassHandles
//!
//! Both kinds of object are refcounted cells in a generational slab. The
//! thread that takes a count from one to zero owns destruction: it moves the
//! object out of `Live`, runs the host finalizer exactly once with no kernel
//! lock held, reclaims the slot, and drops the object's reference on its
//! class. The last such reference completes a deferred unregister.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, error, trace};
use parking_lot::Mutex;
use xcall_sdk::{
    ClassFinalizer, ClassHandleId, ClassId, InstanceFinalizer, InstanceId, KernelError,
    KernelResult, Payload, Receiver,
};

use crate::refcount::RefCount;
use crate::registry::{ClassDescriptor, ClassRegistry};
use crate::slab::Slab;
use crate::stats::KernelCounters;

/// Lifecycle of an Instance
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Dispatchable
    Live = 0,
    /// Refcount reached zero; the finalizer is running
    Finalizing = 1,
    /// Finalized and reclaimed
    Destroyed = 2,
}

impl InstanceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => InstanceState::Live,
            1 => InstanceState::Finalizing,
            _ => InstanceState::Destroyed,
        }
    }
}

pub(crate) struct InstanceCell {
    id: InstanceId,
    class: Arc<ClassDescriptor>,
    payload: Payload,
    refcount: RefCount,
    state: AtomicU8,
    finalizer: Mutex<Option<InstanceFinalizer>>,
}

impl InstanceCell {
    pub(crate) fn class(&self) -> &Arc<ClassDescriptor> {
        &self.class
    }

    pub(crate) fn receiver(&self) -> Receiver {
        Receiver {
            instance: self.id,
            class: self.class.id(),
            payload: Arc::clone(&self.payload),
        }
    }
}

pub(crate) struct ClassHandleCell {
    id: ClassHandleId,
    class: Arc<ClassDescriptor>,
    refcount: RefCount,
    finalizer: Mutex<Option<ClassFinalizer>>,
}

impl ClassHandleCell {
    pub(crate) fn class(&self) -> &Arc<ClassDescriptor> {
        &self.class
    }
}

/// Reference on an Instance held for the duration of a call
pub(crate) struct InstancePin<'a> {
    objects: &'a ObjectModel,
    cell: Arc<InstanceCell>,
}

impl InstancePin<'_> {
    pub(crate) fn cell(&self) -> &InstanceCell {
        &self.cell
    }
}

impl Drop for InstancePin<'_> {
    fn drop(&mut self) {
        if self.cell.refcount.release(self.cell.id) {
            self.objects.destroy_instance(&self.cell);
        }
    }
}

/// Reference on a ClassHandle held for the duration of a call
pub(crate) struct ClassPin<'a> {
    objects: &'a ObjectModel,
    cell: Arc<ClassHandleCell>,
}

impl ClassPin<'_> {
    pub(crate) fn cell(&self) -> &ClassHandleCell {
        &self.cell
    }
}

impl Drop for ClassPin<'_> {
    fn drop(&mut self) {
        if self.cell.refcount.release(self.cell.id) {
            self.objects.destroy_class_handle(&self.cell);
        }
    }
}

/// Owner of every Instance and ClassHandle of a kernel
pub struct ObjectModel {
    instances: Slab<InstanceCell>,
    class_handles: Slab<ClassHandleCell>,
    registry: Arc<ClassRegistry>,
    counters: Arc<KernelCounters>,
}

impl ObjectModel {
    /// Create an empty object model
    pub fn new(
        registry: Arc<ClassRegistry>,
        counters: Arc<KernelCounters>,
        max_instances: Option<usize>,
    ) -> Self {
        Self {
            instances: Slab::with_limit(max_instances),
            class_handles: Slab::new(),
            registry,
            counters,
        }
    }

    // ========================================================================
    // Instances
    // ========================================================================

    fn instance(&self, id: InstanceId) -> KernelResult<Arc<InstanceCell>> {
        self.instances
            .get(id.raw())
            .ok_or_else(|| KernelError::UseAfterFree(format!("{} has been destroyed", id)))
    }

    /// Wrap a constructor payload in a new Live Instance with refcount one
    pub fn create_instance(
        &self,
        class: &Arc<ClassDescriptor>,
        payload: Payload,
        finalizer: Option<InstanceFinalizer>,
    ) -> KernelResult<InstanceId> {
        let inserted = self.instances.insert_with(|raw| InstanceCell {
            id: InstanceId::from_raw(raw),
            class: Arc::clone(class),
            payload,
            refcount: RefCount::new(),
            state: AtomicU8::new(InstanceState::Live as u8),
            finalizer: Mutex::new(finalizer),
        });
        let (raw, _) = inserted.ok_or_else(|| {
            KernelError::OutOfMemory(format!(
                "instance limit reached constructing '{}'",
                class.name()
            ))
        })?;

        class.retain_ref();
        self.counters.increment_instances();
        let id = InstanceId::from_raw(raw);
        trace!("created {} of '{}'", id, class.name());
        Ok(id)
    }

    /// Add a reference to a Live Instance
    pub fn retain_instance(&self, id: InstanceId) -> KernelResult<()> {
        let cell = self.instance(id)?;
        if cell.refcount.try_retain() {
            Ok(())
        } else {
            Err(KernelError::UseAfterFree(format!("{} is being finalized", id)))
        }
    }

    /// Drop a reference; the zero transition finalizes the Instance
    pub fn release_instance(&self, id: InstanceId) -> KernelResult<()> {
        let cell = self.instance(id)?;
        if cell.refcount.release(id) {
            self.destroy_instance(&cell);
        }
        Ok(())
    }

    /// Hold a Live Instance for the duration of a call
    pub(crate) fn pin_instance(&self, id: InstanceId) -> KernelResult<InstancePin<'_>> {
        let cell = self.instance(id)?;
        if !cell.refcount.try_retain() {
            return Err(KernelError::UseAfterFree(format!("{} is being finalized", id)));
        }
        Ok(InstancePin { objects: self, cell })
    }

    fn destroy_instance(&self, cell: &Arc<InstanceCell>) {
        if cell
            .state
            .compare_exchange(
                InstanceState::Live as u8,
                InstanceState::Finalizing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        let finalizer = cell.finalizer.lock().take();
        if let Some(finalizer) = finalizer {
            let id = cell.id;
            let payload = Arc::clone(&cell.payload);
            if catch_unwind(AssertUnwindSafe(move || finalizer(id, payload))).is_err() {
                error!("finalizer for {} panicked", id);
            }
            self.counters.record_finalizer();
        }

        cell.state
            .store(InstanceState::Destroyed as u8, Ordering::Release);
        self.instances.remove(cell.id.raw());
        self.counters.decrement_instances();
        trace!("destroyed {}", cell.id);
        self.registry.release_class_ref(&cell.class);
    }

    /// Lifecycle state; reclaimed or never-issued handles read as Destroyed
    pub fn instance_state(&self, id: InstanceId) -> InstanceState {
        self.instances
            .get(id.raw())
            .map_or(InstanceState::Destroyed, |cell| {
                InstanceState::from_u8(cell.state.load(Ordering::Acquire))
            })
    }

    /// Current refcount of an Instance
    pub fn instance_refcount(&self, id: InstanceId) -> KernelResult<usize> {
        Ok(self.instance(id)?.refcount.get())
    }

    /// Class an Instance was constructed from
    pub fn instance_class(&self, id: InstanceId) -> KernelResult<ClassId> {
        Ok(self.instance(id)?.class.id())
    }

    /// Number of Instances still occupying a slot
    pub fn live_instances(&self) -> usize {
        self.instances.len()
    }

    // ========================================================================
    // Class Handles
    // ========================================================================

    fn class_handle(&self, id: ClassHandleId) -> KernelResult<Arc<ClassHandleCell>> {
        self.class_handles
            .get(id.raw())
            .ok_or_else(|| KernelError::UseAfterFree(format!("{} has been finalized", id)))
    }

    /// Borrow a registered class
    ///
    /// Fails with `NotFound` once an unregister has been requested.
    pub fn borrow_class(
        &self,
        class: ClassId,
        finalizer: Option<ClassFinalizer>,
    ) -> KernelResult<ClassHandleId> {
        let descriptor = self.registry.get(class)?;
        descriptor.retain_ref();
        // Unregister may have started between the lookup and the retain.
        if descriptor.state() != crate::registry::ClassState::Registered {
            self.registry.release_class_ref(&descriptor);
            return Err(KernelError::NotFound(class.to_string()));
        }

        let inserted = self.class_handles.insert_with(|raw| ClassHandleCell {
            id: ClassHandleId::from_raw(raw),
            class: Arc::clone(&descriptor),
            refcount: RefCount::new(),
            finalizer: Mutex::new(finalizer),
        });
        let (raw, _) = match inserted {
            Some(inserted) => inserted,
            None => {
                self.registry.release_class_ref(&descriptor);
                return Err(KernelError::OutOfMemory(
                    "class handle table is full".to_string(),
                ));
            }
        };

        self.counters.increment_class_handles();
        let id = ClassHandleId::from_raw(raw);
        debug!("borrowed '{}' as {}", descriptor.name(), id);
        Ok(id)
    }

    /// Add a reference to a ClassHandle
    pub fn retain_class(&self, id: ClassHandleId) -> KernelResult<()> {
        let cell = self.class_handle(id)?;
        if cell.refcount.try_retain() {
            Ok(())
        } else {
            Err(KernelError::UseAfterFree(format!("{} is being finalized", id)))
        }
    }

    /// Drop a reference; the zero transition runs the class finalizer
    pub fn release_class(&self, id: ClassHandleId) -> KernelResult<()> {
        let cell = self.class_handle(id)?;
        if cell.refcount.release(id) {
            self.destroy_class_handle(&cell);
        }
        Ok(())
    }

    /// Hold a ClassHandle for the duration of a call
    pub(crate) fn pin_class(&self, id: ClassHandleId) -> KernelResult<ClassPin<'_>> {
        let cell = self.class_handle(id)?;
        if !cell.refcount.try_retain() {
            return Err(KernelError::UseAfterFree(format!("{} is being finalized", id)));
        }
        Ok(ClassPin { objects: self, cell })
    }

    fn destroy_class_handle(&self, cell: &Arc<ClassHandleCell>) {
        let finalizer = cell.finalizer.lock().take();
        if let Some(finalizer) = finalizer {
            let class = cell.class.id();
            if catch_unwind(AssertUnwindSafe(move || finalizer(class))).is_err() {
                error!("class finalizer for {} panicked", cell.id);
            }
            self.counters.record_finalizer();
        }

        if self.class_handles.remove(cell.id.raw()).is_some() {
            self.counters.decrement_class_handles();
            debug!("finalized {} of '{}'", cell.id, cell.class.name());
            self.registry.release_class_ref(&cell.class);
        }
    }

    /// Class a handle refers to
    pub fn class_of(&self, id: ClassHandleId) -> KernelResult<Arc<ClassDescriptor>> {
        Ok(Arc::clone(&self.class_handle(id)?.class))
    }

    /// Current refcount of a ClassHandle
    pub fn class_handle_refcount(&self, id: ClassHandleId) -> KernelResult<usize> {
        Ok(self.class_handle(id)?.refcount.get())
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Finalize every remaining object regardless of refcount
    ///
    /// Instances go first so that their class references drain before the
    /// handles do. Returns the number of objects finalized.
    pub(crate) fn finalize_all(&self) -> usize {
        let mut finalized = 0;

        for raw in self.instances.handles() {
            if let Some(cell) = self.instances.get(raw) {
                if cell.refcount.clear() > 0 {
                    self.destroy_instance(&cell);
                    finalized += 1;
                }
            }
        }

        for raw in self.class_handles.handles() {
            if let Some(cell) = self.class_handles.get(raw) {
                if cell.refcount.clear() > 0 {
                    self.destroy_class_handle(&cell);
                    finalized += 1;
                }
            }
        }

        finalized
    }
}
