//! VM status and type classification.

use std::fmt;

/// Observed status of a VM handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    /// VM process is running guest code.
    Running,
    /// VM process is alive but paused.
    Paused,
    /// VM process is not running.
    Dead,
}

impl VmStatus {
    /// Check if the VM process is alive (running or paused).
    pub fn is_alive(&self) -> bool {
        matches!(self, VmStatus::Running | VmStatus::Paused)
    }

    /// Get the status name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            VmStatus::Running => "running",
            VmStatus::Paused => "paused",
            VmStatus::Dead => "dead",
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// VM process status handed to image processing.
///
/// Image checks behave differently while the owning VM still holds the image
/// open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// The owning VM process exists.
    Running,
    /// No VM, or the VM is dead.
    Dead,
}

/// Kind of VM handle, from the `vm_type` parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmType {
    /// QEMU driven directly.
    Qemu,
    /// libvirt domain.
    Libvirt,
    /// virt-v2v conversion guest.
    V2v,
    /// Any other backend.
    Other(String),
}

impl VmType {
    /// Parse the `vm_type` value; absent means QEMU.
    pub fn from_param(value: Option<&str>) -> Self {
        match value.unwrap_or("qemu") {
            "qemu" => VmType::Qemu,
            "libvirt" => VmType::Libvirt,
            "v2v" => VmType::V2v,
            other => VmType::Other(other.to_string()),
        }
    }

    /// Get the type name as a string.
    pub fn as_str(&self) -> &str {
        match self {
            VmType::Qemu => "qemu",
            VmType::Libvirt => "libvirt",
            VmType::V2v => "v2v",
            VmType::Other(name) => name,
        }
    }

    /// Whether the type keeps the VM definition outside the harness.
    ///
    /// These VMs are restarted only when dead, never because their
    /// configuration changed.
    pub fn is_managed_externally(&self) -> bool {
        matches!(self, VmType::Libvirt | VmType::V2v)
    }
}

impl fmt::Display for VmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
