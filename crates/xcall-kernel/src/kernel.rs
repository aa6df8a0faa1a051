//! The kernel: one process-local instance of the call machinery
//!
//! A `Kernel` owns a class registry, the object model and a message arena.
//! Hosts and handlers talk to it through [`KernelContext`]; administrative
//! operations (registration, inspection, teardown) are inherent methods.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};
use xcall_sdk::{
    method_id, CallOutcome, ClassDef, ClassFinalizer, ClassHandleId, ClassId, Handle,
    InstanceFinalizer, InstanceId, KernelContext, KernelResult, MessageId, MessageView, MethodDef,
    MethodId,
};

use crate::arena::MessageArena;
use crate::config::KernelOptions;
use crate::dispatch::Dispatcher;
use crate::object::{InstanceState, ObjectModel};
use crate::registry::{ClassDescriptor, ClassRegistry};
use crate::stats::{KernelCounters, KernelStats};

/// Process-local call kernel
pub struct Kernel {
    options: KernelOptions,
    counters: Arc<KernelCounters>,
    registry: Arc<ClassRegistry>,
    objects: ObjectModel,
    arena: MessageArena,
    shut_down: AtomicBool,
}

impl Kernel {
    /// Create a kernel with default options
    pub fn new() -> Self {
        Self::init(KernelOptions::default())
    }

    /// Create a kernel
    pub fn init(options: KernelOptions) -> Self {
        let counters = Arc::new(KernelCounters::new());
        let registry = Arc::new(ClassRegistry::new());
        let objects = ObjectModel::new(
            Arc::clone(&registry),
            Arc::clone(&counters),
            options.limits.max_instances,
        );
        let arena = MessageArena::new(&options, Arc::clone(&counters));
        debug!(
            "kernel initialized (segment size {}, limits {:?})",
            options.segment_size, options.limits
        );

        Self {
            options,
            counters,
            registry,
            objects,
            arena,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Finalize everything still alive and return the final counters
    ///
    /// Every remaining Instance and ClassHandle finalizer runs exactly once,
    /// regardless of outstanding references.
    pub fn teardown(self) -> KernelStats {
        self.shutdown();
        self.counters.snapshot()
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let finalized = self.objects.finalize_all();
        let freed = self.arena.free_all();
        self.registry.clear();
        info!(
            "kernel shut down: {} objects finalized, {} messages freed",
            finalized, freed
        );
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a class definition
    pub fn register(&self, def: ClassDef) -> KernelResult<ClassId> {
        Ok(self.registry.register(def)?.id())
    }

    /// Register a class from its name and method lists
    pub fn register_class(
        &self,
        name: impl Into<String>,
        class_methods: Vec<MethodDef>,
        instance_methods: Vec<MethodDef>,
    ) -> KernelResult<ClassId> {
        self.register(ClassDef {
            name: name.into(),
            class_methods,
            instance_methods,
        })
    }

    /// Request removal of a class
    ///
    /// Returns `true` if it was removed now and `false` if removal waits for
    /// its outstanding handles and instances.
    pub fn unregister(&self, class: ClassId) -> KernelResult<bool> {
        self.registry.unregister(class)
    }

    /// Find a registered class by name
    pub fn lookup(&self, name: &str) -> KernelResult<ClassId> {
        Ok(self.registry.lookup(name)?.id())
    }

    /// Descriptor of a registered class
    pub fn class_descriptor(&self, class: ClassId) -> KernelResult<Arc<ClassDescriptor>> {
        self.registry.get(class)
    }

    /// Identifier a method name dispatches under
    pub fn method_id(name: &str) -> MethodId {
        method_id(name)
    }

    /// Registration epoch
    pub fn epoch(&self) -> u64 {
        self.registry.epoch()
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Current refcount of any live handle
    pub fn refcount(&self, handle: Handle) -> KernelResult<usize> {
        match handle {
            Handle::Instance(id) => self.objects.instance_refcount(id),
            Handle::Class(id) => self.objects.class_handle_refcount(id),
            Handle::Message(id) => self.arena.refcount(id),
        }
    }

    /// Lifecycle state of an Instance
    pub fn instance_state(&self, instance: InstanceId) -> InstanceState {
        self.objects.instance_state(instance)
    }

    /// Class an Instance was constructed from
    pub fn instance_class(&self, instance: InstanceId) -> KernelResult<ClassId> {
        self.objects.instance_class(instance)
    }

    /// Whether a live message has been sealed
    pub fn is_sealed(&self, message: MessageId) -> KernelResult<bool> {
        self.arena.is_sealed(message)
    }

    /// Number of segments backing a sealed message
    pub fn segment_count(&self, message: MessageId) -> KernelResult<usize> {
        self.arena.segment_count(message)
    }

    /// Snapshot of the resource counters
    pub fn stats(&self) -> KernelStats {
        self.counters.snapshot()
    }

    /// Options the kernel was created with
    pub fn options(&self) -> &KernelOptions {
        &self.options
    }

    pub(crate) fn counters(&self) -> &KernelCounters {
        &self.counters
    }

    pub(crate) fn objects(&self) -> &ObjectModel {
        &self.objects
    }

    pub(crate) fn arena(&self) -> &MessageArena {
        &self.arena
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl KernelContext for Kernel {
    fn begin_build(&self) -> KernelResult<MessageId> {
        self.arena.begin_build()
    }

    fn grow(&self, message: MessageId, bytes: &[u8]) -> KernelResult<usize> {
        self.arena.grow(message, bytes)
    }

    fn allocate(&self, message: MessageId, len: usize) -> KernelResult<usize> {
        self.arena.allocate(message, len)
    }

    fn write(&self, message: MessageId, offset: usize, bytes: &[u8]) -> KernelResult<()> {
        self.arena.write(message, offset, bytes)
    }

    fn seal(&self, message: MessageId) -> KernelResult<MessageId> {
        self.arena.seal(message)?;
        Ok(message)
    }

    fn read(
        &self,
        message: MessageId,
        offset: usize,
        length: usize,
    ) -> KernelResult<MessageView> {
        self.arena.read(message, offset, length)
    }

    fn message_len(&self, message: MessageId) -> KernelResult<usize> {
        self.arena.len(message)
    }

    fn retain(&self, handle: Handle) -> KernelResult<()> {
        match handle {
            Handle::Instance(id) => self.objects.retain_instance(id),
            Handle::Class(id) => self.objects.retain_class(id),
            Handle::Message(id) => self.arena.retain(id),
        }
    }

    fn release(&self, handle: Handle) -> KernelResult<()> {
        match handle {
            Handle::Instance(id) => self.objects.release_instance(id),
            Handle::Class(id) => self.objects.release_class(id),
            Handle::Message(id) => self.arena.release(id),
        }
    }

    fn lookup_class(&self, name: &str) -> KernelResult<ClassId> {
        self.lookup(name)
    }

    fn borrow_class_until_finalized(
        &self,
        class: ClassId,
        finalizer: Option<ClassFinalizer>,
    ) -> KernelResult<ClassHandleId> {
        self.objects.borrow_class(class, finalizer)
    }

    fn call_class_constructor(
        &self,
        class: ClassHandleId,
        method: MethodId,
        finalizer: Option<InstanceFinalizer>,
        args: MessageId,
    ) -> KernelResult<InstanceId> {
        Dispatcher::new(self).construct(class, method, finalizer, args)
    }

    fn call_class_method(
        &self,
        class: ClassHandleId,
        method: MethodId,
        args: MessageId,
    ) -> KernelResult<CallOutcome> {
        Dispatcher::new(self).call_class(class, method, args)
    }

    fn call_instance_method(
        &self,
        instance: InstanceId,
        method: MethodId,
        args: MessageId,
    ) -> KernelResult<MessageId> {
        Dispatcher::new(self).call_instance(instance, method, args)
    }
}
