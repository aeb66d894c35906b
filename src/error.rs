use thiserror_no_std::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("Transparent mode is already enabled")]
    TransparentModeAlreadyEnabled,
    #[error("Transparent mode is already disabled")]
    TransparentModeAlreadyDisabled,
    #[error("Port is outside the range covered by the I/O bitmaps")]
    InvalidIoPort,
    #[error("Failed to allocate memory")]
    MemoryAllocationFailed,
}
