//! Kernel-wide error types.
//!
//! `KernelError` is the currency returned by every fallible kernel API.
//! Contract violations -- callers raising IRQL incorrectly, invariant breaks
//! that indicate a kernel bug rather than a resource condition -- bypass
//! this type entirely and go straight to `panic!`/`fatal_error`, the same
//! split the teacher's original error module drew between recoverable
//! conditions (this enum) and programming errors (`assert!`/`panic!`).

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory management errors (PFN map, pool, VMM).
    Memory(MmError),
    /// IRQL discipline violations detected at runtime (not via `assert!`).
    Irql(IrqlError),
    /// Scheduler-related errors.
    Scheduler(SchedError),
    ThreadNotFound {
        tid: u64,
    },
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    HardwareError {
        device: &'static str,
        code: u32,
    },
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    OperationNotSupported {
        operation: &'static str,
    },
    ResourceExhausted {
        resource: &'static str,
    },
    PermissionDenied {
        operation: &'static str,
    },
    AlreadyExists {
        resource: &'static str,
        id: u64,
    },
    NotFound {
        resource: &'static str,
        id: u64,
    },
    Timeout {
        operation: &'static str,
        duration_ms: u64,
    },
    NotImplemented {
        feature: &'static str,
    },
    WouldBlock,
    BrokenPipe,
    NotInitialized {
        subsystem: &'static str,
    },
    /// Legacy string error for gradual migration from &'static str patterns.
    LegacyError {
        message: &'static str,
    },
}

/// Memory-management specific errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    OutOfMemory { requested: usize, available: usize },
    InvalidAddress { addr: usize },
    UnmappedMemory { addr: usize },
    AlreadyMapped { addr: usize },
    NotAligned { addr: usize, align: usize },
    PoolCorruption { reason: &'static str },
    TagExhausted,
}

/// IRQL discipline errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqlError {
    TooHigh { current: u8, required: u8 },
    TooLow { current: u8, required: u8 },
    NotOwner,
}

/// Scheduler-specific errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    InvalidPriority { priority: u8 },
    InvalidCpuId { cpu: usize },
    TaskNotFound { id: u64 },
    CpuOffline { cpu: usize },
    InvalidAffinity,
    QueueEmpty,
    AlreadyScheduled,
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory(e) => write!(f, "memory error: {:?}", e),
            Self::Irql(e) => write!(f, "IRQL error: {:?}", e),
            Self::Scheduler(e) => write!(f, "scheduler error: {:?}", e),
            Self::ThreadNotFound { tid } => write!(f, "thread {} not found", tid),
            Self::InvalidState { expected, actual } => {
                write!(f, "invalid state: expected {}, got {}", expected, actual)
            }
            Self::HardwareError { device, code } => {
                write!(f, "hardware error on {}: code 0x{:x}", device, code)
            }
            Self::InvalidArgument { name, value } => {
                write!(f, "invalid argument '{}': {}", name, value)
            }
            Self::OperationNotSupported { operation } => {
                write!(f, "operation not supported: {}", operation)
            }
            Self::ResourceExhausted { resource } => write!(f, "resource exhausted: {}", resource),
            Self::PermissionDenied { operation } => {
                write!(f, "permission denied for operation: {}", operation)
            }
            Self::AlreadyExists { resource, id } => {
                write!(f, "{} with id {} already exists", resource, id)
            }
            Self::NotFound { resource, id } => write!(f, "{} with id {} not found", resource, id),
            Self::Timeout { operation, duration_ms } => {
                write!(f, "timeout during {}: {} ms", operation, duration_ms)
            }
            Self::NotImplemented { feature } => write!(f, "feature not implemented: {}", feature),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::BrokenPipe => write!(f, "broken pipe"),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
            Self::LegacyError { message } => write!(f, "{}", message),
        }
    }
}

impl From<MmError> for KernelError {
    fn from(err: MmError) -> Self {
        Self::Memory(err)
    }
}

impl From<IrqlError> for KernelError {
    fn from(err: IrqlError) -> Self {
        Self::Irql(err)
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::Scheduler(err)
    }
}

/// Conversion from legacy &'static str errors to KernelError, for gradual
/// migration of call sites that still return `Result<T, &'static str>`.
impl From<&'static str> for KernelError {
    fn from(msg: &'static str) -> Self {
        Self::LegacyError { message: msg }
    }
}

#[macro_export]
macro_rules! kernel_error {
    (OutOfMemory { requested: $req:expr, available: $avail:expr }) => {
        $crate::error::KernelError::Memory($crate::error::MmError::OutOfMemory {
            requested: $req,
            available: $avail,
        })
    };
    (InvalidArgument { $name:expr => $value:expr }) => {
        $crate::error::KernelError::InvalidArgument {
            name: $name,
            value: $value,
        }
    };
    ($variant:ident) => {
        $crate::error::KernelError::$variant
    };
}
