use std::{
    error::Error,
    fmt::{self, Display},
};
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a virtling-related operation.
pub type VirtlingResult<T> = Result<T, VirtlingError>;

/// An error that occurred while compiling or supervising a virtual machine.
#[derive(Debug, Error)]
pub enum VirtlingError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// A structural error in the configuration document.
    #[error("configuration decode error: {0}")]
    ConfigDecode(#[from] serde_json::Error),

    /// An error that occurred when an invalid machine configuration was used.
    #[error("invalid machine configuration: {0}")]
    InvalidMachineConfig(InvalidMachineConfigError),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred when the restore-image download failed.
    #[error("restore image download failed: {0}")]
    RestoreImageDownloadFailed(String),

    /// A restore image is required by the configuration but none was resolved.
    #[error("restore image is required but none was resolved")]
    MissingRestoreImage,

    /// An error that occurred when an invalid MAC address string was used.
    #[error("invalid MAC address: {0}")]
    InvalidMacAddress(String),

    /// The configuration requires a capability the engine does not expose.
    #[error("unsupported capability: {0}")]
    UnsupportedCapability(String),

    /// An error that occurred when two pipes were registered under one tag.
    #[error("duplicate pipe tag: {0}")]
    DuplicatePipeTag(String),

    /// An error that occurred when no pipe was registered under a tag.
    #[error("no pipe registered under tag: {0}")]
    UnknownPipeTag(String),

    /// An operation needed the machine handle before `create()` succeeded.
    #[error("machine has not been created")]
    MachineNotCreated,
}

/// An error that occurred when an invalid machine configuration was used.
#[derive(Debug, Error)]
pub enum InvalidMachineConfigError {
    /// The CPU core count is zero.
    #[error("cpu core count is zero")]
    CpuCountIsZero,

    /// The memory size is zero.
    #[error("memory size is zero")]
    MemorySizeIsZero,
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VirtlingError {
    /// Creates a new `VirtlingError` from an arbitrary error.
    pub fn custom(error: impl Into<anyhow::Error>) -> VirtlingError {
        VirtlingError::Custom(AnyError {
            error: error.into(),
        })
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
