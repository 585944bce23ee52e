//! VM handles and their pre/post-test lifecycle.
//!
//! This module provides the abstractions the fixture drives VMs through:
//! - [`Vm`]: Trait for controlling one VM instance
//! - [`VmFactory`]: Trait for creating VM handles of a given [`VmType`]
//! - [`lifecycle`]: Bringing a VM into its target state and tearing it down
//! - [`cmdline`]: Verifying the guest kernel command line over serial

pub mod cmdline;
pub mod lifecycle;
pub mod state;

use crate::config::Params;
use crate::error::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub use state::{ProcessStatus, VmStatus, VmType};

/// Default libvirt connection URI.
pub const DEFAULT_CONNECT_URI: &str = "qemu:///system";

/// Default time allowed for a guest login.
pub const LOGIN_WAIT_TIMEOUT: Duration = Duration::from_secs(240);

/// How a VM process should be (re)created.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateMode {
    /// Create from the given name and parameters.
    Fresh {
        /// VM name.
        name: String,
        /// Scoped VM parameters.
        params: Params,
        /// Test bindir.
        basedir: PathBuf,
    },
    /// Recreate with the configuration used last time.
    ReusePrevious,
}

/// Arguments for [`Vm::create`].
#[derive(Debug, Clone, PartialEq)]
pub struct CreateRequest {
    /// Configuration source.
    pub mode: CreateMode,
    /// Time allowed for the process to come up.
    pub timeout: Duration,
    /// Incoming migration protocol, if this VM is a migration destination.
    pub migration_mode: Option<String>,
    /// File descriptor for fd-based migration.
    pub migration_fd: Option<String>,
    /// Command for exec-based migration on the destination.
    pub migration_exec_cmd: Option<String>,
}

/// Handle to a VM instance.
///
/// Implementations use interior mutability; handles are shared between the
/// orchestration thread and background pollers.
pub trait Vm: Send + Sync {
    /// VM name.
    fn name(&self) -> &str;

    /// Instance identifier; changes when the VM id is regenerated.
    fn instance(&self) -> String;

    /// Current process status.
    fn status(&self) -> VmStatus;

    /// Whether the VM process is alive.
    fn is_alive(&self) -> bool {
        self.status().is_alive()
    }

    /// Whether the VM process is dead.
    fn is_dead(&self) -> bool {
        !self.is_alive()
    }

    /// Whether the VM is paused.
    fn is_paused(&self) -> bool {
        self.status() == VmStatus::Paused
    }

    /// Whether the VM definition exists (libvirt domains).
    fn exists(&self) -> bool {
        true
    }

    /// Process ID of the VM, if alive.
    fn pid(&self) -> Option<u32>;

    /// Connection URI this handle talks to (libvirt only).
    fn connect_uri(&self) -> Option<String> {
        None
    }

    /// Create (or recreate) the VM process.
    fn create(&self, request: &CreateRequest) -> Result<()>;

    /// Start an externally defined VM.
    fn start(&self) -> Result<()>;

    /// Pause guest execution.
    fn pause(&self) -> Result<()>;

    /// Resume guest execution.
    fn resume(&self) -> Result<()>;

    /// Destroy the VM process, gracefully (guest shutdown first) or not.
    fn destroy(&self, gracefully: bool) -> Result<()>;

    /// Remove the VM definition.
    fn remove(&self) -> Result<()>;

    /// Whether the running process no longer matches `params`.
    fn needs_restart(&self, name: &str, params: &Params, basedir: &Path) -> bool;

    /// Replace the recorded parameters and forget cached devices.
    fn set_params(&self, params: &Params);

    /// Generate a new instance id.
    fn update_vm_id(&self);

    /// Regenerate NIC identities (MAC addresses...) from `params`.
    fn regenerate_virtnet(&self, params: &Params);

    /// Number of configured network interfaces.
    fn nic_count(&self) -> usize;

    /// Time allowed for a guest login.
    fn login_timeout(&self) -> Duration {
        LOGIN_WAIT_TIMEOUT
    }

    /// Log into the guest over the network.
    fn wait_for_login(&self, timeout: Duration) -> Result<Box<dyn Session>>;

    /// Log into the guest over the serial console.
    fn wait_for_serial_login(&self, timeout: Duration) -> Result<Box<dyn Session>>;

    /// The attached serial console, if any.
    fn serial_console(&self) -> Option<Arc<dyn SerialConsole>>;

    /// Attach the serial console.
    fn create_serial_console(&self) -> Result<()>;

    /// Close the serial console.
    fn cleanup_serial_console(&self);

    /// Detach all open remote sessions.
    fn take_remote_sessions(&self) -> Vec<Box<dyn Session>>;

    /// Re-attach a session that could not be closed.
    fn keep_remote_session(&self, session: Box<dyn Session>);

    /// Open monitor connections.
    fn monitors(&self) -> Vec<Arc<dyn Monitor>>;

    /// Write a screen capture to `path`.
    fn screendump(&self, path: &Path) -> Result<()>;

    /// Query CPU register state through the monitor.
    fn query_registers(&self) -> Result<String>;
}

/// Remote shell session into a guest.
pub trait Session: Send {
    /// Close the session.
    fn close(&mut self) -> Result<()>;
}

/// Monitor connection of a VM.
pub trait Monitor: Send + Sync {
    /// Monitor name.
    fn name(&self) -> &str;

    /// Close the connection.
    fn close(&self) -> Result<()>;
}

/// Serial console of a VM.
pub trait SerialConsole: Send + Sync {
    /// Read output until one of `patterns` matches or `timeout` elapses.
    ///
    /// Returns all output read so far.
    fn read_until_output_matches(&self, patterns: &[&str], timeout: Duration) -> Result<String>;
}

/// Factory for VM handles.
pub trait VmFactory: Send + Sync {
    /// Create a handle for `name`.
    fn create_vm(
        &self,
        vm_type: &VmType,
        target: Option<&str>,
        name: &str,
        params: &Params,
        basedir: &Path,
    ) -> Result<Arc<dyn Vm>>;
}

/// Normalize a libvirt connection URI; absent or `default` means the system URI.
pub fn normalize_connect_uri(uri: Option<&str>) -> String {
    match uri.map(str::trim) {
        None | Some("") | Some("default") => DEFAULT_CONNECT_URI.to_string(),
        Some(uri) => uri.to_string(),
    }
}
