use thiserror::Error;

/// Why an operation trapped. The caller gets the trap, the system stays usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TrapCause {
    #[error("address is outside of the address space")]
    OutOfAddressSpace,
    #[error("address is not covered by any segment")]
    NotInSegment,
    #[error("access kind is not permitted by the segment")]
    AccessViolation,
    #[error("segment start is not page aligned")]
    Misaligned,
    #[error("segment size is zero or too large")]
    InvalidSize,
    #[error("segment overlaps an existing segment")]
    Overlap,
    #[error("segment table is full")]
    SegmentTableFull,
    #[error("no segment starts at this address")]
    NoSuchSegment,
    #[error("segment content is shorter than the segment")]
    ContentTooShort,
    #[error("no such process")]
    NoSuchProcess,
    #[error("no shared segment with this name")]
    UnknownSharedSegment,
    #[error("process is not connected to this shared segment")]
    NotConnected,
    #[error("too many shared segments")]
    SharedSegmentLimit,
    #[error("transfer crosses a page boundary")]
    PageBoundary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VMError {
    /// The page is not resident. Call `page_fault` and retry.
    #[error("page fault")]
    PageFault,
    #[error("trap: {0}")]
    Trap(#[from] TrapCause),
}

pub type VMResult<T> = Result<T, VMError>;

/// Three-valued outcome as seen by a caller that only cares about the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    PageFault,
    Trap,
}

impl<T> From<&VMResult<T>> for Status {
    fn from(value: &VMResult<T>) -> Self {
        match value {
            Ok(_) => Status::Ok,
            Err(VMError::PageFault) => Status::PageFault,
            Err(VMError::Trap(_)) => Status::Trap,
        }
    }
}

impl<T> From<VMResult<T>> for Status {
    fn from(value: VMResult<T>) -> Self {
        Status::from(&value)
    }
}

/// Rejected system configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("user pool needs at least one frame")]
    EmptyUserPool,
    #[error("pool with {0} frames exceeds the addressable frame count")]
    TooManyFrames(usize),
    #[error("swap device holds no cluster")]
    NoSwapClusters,
    #[error("kernel pool needs {required} frames but only has {available}")]
    KernelPoolTooSmall { required: usize, available: usize },
}
