//! Error types for vmfixture.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using vmfixture's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// How the harness should treat an error that reached the test boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The test cannot run as configured; abort it.
    Fatal,
    /// The test does not apply to this host; mark it not-applicable.
    Skip,
    /// An operation failed; the test fails.
    Failure,
}

/// Errors that can occur while pre- or post-processing a test.
#[derive(Error, Debug)]
pub enum Error {
    // Test verdicts
    /// The test configuration is unusable (missing VM, missing kernel entry...).
    #[error("test error: {0}")]
    TestError(String),

    /// The test does not apply to this host.
    #[error("test skipped: {0}")]
    Skip(String),

    // VM errors
    /// A VM operation failed.
    #[error("vm {name}: {message}")]
    Vm {
        /// VM name.
        name: String,
        /// Error message.
        message: String,
    },

    /// VM not found.
    #[error("vm not found: {0}")]
    VmNotFound(String),

    /// A monitor command failed.
    #[error("monitor error: {0}")]
    Monitor(String),

    /// The VM implementation does not offer the requested capability.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Login into the guest failed.
    #[error("login failed: {0}")]
    Login(String),

    /// The serial console did not produce the expected output.
    #[error("serial console: {0}")]
    Serial(String),

    /// A VM screen has not changed for longer than the configured threshold.
    #[error("{vm} screen is inactive for more than {seconds} s ({} min)", seconds / 60)]
    ScreenInactive {
        /// VM name.
        vm: String,
        /// Seconds since the last distinct frame.
        seconds: u64,
    },

    // Image errors
    /// An image backend operation failed.
    #[error("image {image}: {message}")]
    Image {
        /// Image name.
        image: String,
        /// Error message.
        message: String,
    },

    /// An image integrity check failed.
    #[error("image check failed for {image}: {message}")]
    ImageCheck {
        /// Image name.
        image: String,
        /// Checker output.
        message: String,
    },

    /// Image file does not exist.
    #[error("image not found: {}", path.display())]
    ImageNotFound {
        /// Path to the image.
        path: PathBuf,
    },

    // Host errors
    /// A host setup or cleanup provider failed.
    #[error("host setup: {0}")]
    Host(String),

    /// Generic storage device error (iSCSI, LVM, NFS).
    #[error("storage error: {0}")]
    Storage(String),

    /// Guest disk could not be read or patched.
    #[error("guest disk: {0}")]
    GuestDisk(String),

    /// A frame could not be decoded or encoded.
    #[error("image codec: {0}")]
    Codec(String),

    /// Generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to load configuration.
    #[error("failed to load params: {0}")]
    ConfigLoad(String),

    // Command execution errors
    /// External command failed.
    #[error("command failed: {command}: {message}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Error message.
        message: String,
    },

    /// An operation did not finish in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Aggregated failures of independent cleanup steps.
    #[error("failures occurred while postprocess:{0}")]
    Postprocess(String),

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a fatal test error with a message.
    pub fn test_error(msg: impl Into<String>) -> Self {
        Self::TestError(msg.into())
    }

    /// Create a skip verdict with a reason.
    pub fn skip(msg: impl Into<String>) -> Self {
        Self::Skip(msg.into())
    }

    /// Create a VM error.
    pub fn vm(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Vm {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create an image error.
    pub fn image(image: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Image {
            image: image.into(),
            message: message.into(),
        }
    }

    /// Create a host setup error.
    pub fn host(msg: impl Into<String>) -> Self {
        Self::Host(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a command failed error.
    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Classify the error for the harness.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::TestError(_) => ErrorClass::Fatal,
            Error::Skip(_) => ErrorClass::Skip,
            _ => ErrorClass::Failure,
        }
    }

    /// Whether this is an image check failure caused only by leaked clusters.
    pub fn is_cluster_leak(&self) -> bool {
        matches!(self, Error::ImageCheck { message, .. } if message.contains("Leaked clusters"))
    }
}
