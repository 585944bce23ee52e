//! Host-side environment setup.
//!
//! [`HostSetup`] is the seam to everything on the host a test may need
//! configured: private network bridges, memory tuning, the entropy daemon,
//! libvirt polkit rules and daemon restarts, and the final kernel log check.
//! Probes that only read host state live in [`probe`]; hook commands run
//! through [`command`].

pub mod command;
pub mod probe;

use crate::config::Params;
use crate::error::Result;

/// Default private bridge name.
pub const DEFAULT_PRIVATE_BRIDGE: &str = "atbr0";

/// Flavor of a private bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeKind {
    /// Linux kernel bridge.
    LinuxBridge,
    /// Open vSwitch bridge.
    OpenVswitch,
}

/// A private bridge to set up for the test NICs.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// Bridge flavor.
    pub kind: BridgeKind,
    /// Bridge name.
    pub name: String,
    /// Parameters of the NIC that requested the bridge.
    pub params: Params,
}

impl BridgeConfig {
    /// Build the bridge configuration from a NIC's scoped parameters.
    pub fn from_nic_params(params: &Params) -> Self {
        let kind = match params.get("priv_br_type") {
            Some("openvswitch") => BridgeKind::OpenVswitch,
            _ => BridgeKind::LinuxBridge,
        };
        Self {
            kind,
            name: params.get_or("priv_brname", DEFAULT_PRIVATE_BRIDGE).to_string(),
            params: params.clone(),
        }
    }
}

/// Host tuning steps, in the order they are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tuning {
    /// Static huge pages.
    HugePages,
    /// Transparent huge pages.
    TransparentHugePages,
    /// Kernel samepage merging.
    Ksm,
    /// Entropy gathering daemon.
    Egd,
    /// Libvirt polkit rules.
    Polkit,
}

impl Tuning {
    /// Tuning steps in application order.
    pub const ALL: [Tuning; 5] = [
        Tuning::HugePages,
        Tuning::TransparentHugePages,
        Tuning::Ksm,
        Tuning::Egd,
        Tuning::Polkit,
    ];

    /// Parameter requesting this step.
    pub fn param(&self) -> &'static str {
        match self {
            Tuning::HugePages => "setup_hugepages",
            Tuning::TransparentHugePages => "setup_thp",
            Tuning::Ksm => "setup_ksm",
            Tuning::Egd => "setup_egd",
            Tuning::Polkit => "setup_libvirt_polkit",
        }
    }

    /// Label used in cleanup error reports.
    pub fn label(&self) -> &'static str {
        match self {
            Tuning::HugePages => "HP",
            Tuning::TransparentHugePages => "THP",
            Tuning::Ksm => "KSM",
            Tuning::Egd => "egd.pl",
            Tuning::Polkit => "Polkit",
        }
    }

    /// Whether `params` requests this step.
    pub fn requested(&self, params: &Params) -> bool {
        params.is_yes(self.param())
    }
}

/// Host environment provider.
pub trait HostSetup: Send + Sync {
    /// Create a private bridge.
    fn setup_bridge(&self, bridge: &BridgeConfig) -> Result<()>;

    /// Remove a private bridge.
    fn cleanup_bridge(&self, bridge: &BridgeConfig) -> Result<()>;

    /// Apply a tuning step.
    ///
    /// Huge page setup may return a suggested guest memory size in MB.
    fn setup_tuning(&self, tuning: Tuning, params: &Params) -> Result<Option<u64>>;

    /// Revert a tuning step.
    fn cleanup_tuning(&self, tuning: Tuning, params: &Params) -> Result<()>;

    /// Restart the libvirt daemon.
    fn restart_libvirtd(&self) -> Result<()>;

    /// Best CPU model the host hypervisor supports.
    fn best_cpu_model(&self, params: &Params) -> Result<String>;

    /// Fail when the host kernel log shows problems.
    fn verify_host_dmesg(&self) -> Result<()>;

    /// Stop auxiliary output watchers left over from the test.
    fn kill_tail_threads(&self);
}
