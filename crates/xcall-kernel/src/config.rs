//! Kernel configuration

/// Default capacity of a freshly allocated message segment
pub const DEFAULT_SEGMENT_SIZE: usize = 8 * 1024;

/// Default maximum reentrant call depth per thread
pub const DEFAULT_MAX_CALL_DEPTH: usize = 256;

/// Resource limits for a kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelLimits {
    /// Maximum segment bytes of a single message (None = unlimited)
    pub max_message_bytes: Option<usize>,

    /// Maximum segment bytes across all live messages (None = unlimited)
    pub max_arena_bytes: Option<usize>,

    /// Maximum number of live Instances (None = unlimited)
    pub max_instances: Option<usize>,

    /// Maximum nesting of reentrant calls on one thread (None = unlimited)
    pub max_call_depth: Option<usize>,
}

impl Default for KernelLimits {
    fn default() -> Self {
        Self {
            max_message_bytes: None,
            max_arena_bytes: None,
            max_instances: None,
            max_call_depth: Some(DEFAULT_MAX_CALL_DEPTH),
        }
    }
}

impl KernelLimits {
    /// Create limits with nothing bounded, not even call depth
    pub fn unlimited() -> Self {
        Self {
            max_call_depth: None,
            ..Default::default()
        }
    }

    /// Create limits with a per-message size cap
    pub fn with_message_limit(max_message_bytes: usize) -> Self {
        Self {
            max_message_bytes: Some(max_message_bytes),
            ..Default::default()
        }
    }

    /// Create limits with an arena-wide size cap
    pub fn with_arena_limit(max_arena_bytes: usize) -> Self {
        Self {
            max_arena_bytes: Some(max_arena_bytes),
            ..Default::default()
        }
    }

    /// Create limits with an Instance count cap
    pub fn with_instance_limit(max_instances: usize) -> Self {
        Self {
            max_instances: Some(max_instances),
            ..Default::default()
        }
    }

    /// Create limits with a call depth cap
    pub fn with_call_depth(max_call_depth: usize) -> Self {
        Self {
            max_call_depth: Some(max_call_depth),
            ..Default::default()
        }
    }
}

/// Options for creating a Kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelOptions {
    /// Resource limits
    pub limits: KernelLimits,

    /// Capacity of each new message segment in bytes
    pub segment_size: usize,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            limits: KernelLimits::default(),
            segment_size: DEFAULT_SEGMENT_SIZE,
        }
    }
}

impl KernelOptions {
    /// Replace the resource limits
    pub fn limits(mut self, limits: KernelLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Replace the segment size; zero is bumped to one byte
    pub fn segment_size(mut self, bytes: usize) -> Self {
        self.segment_size = bytes.max(1);
        self
    }
}
