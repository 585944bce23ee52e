//! Host info command implementation.

use clap::Args;
use vmfixture::host::probe;
use vmfixture::{Params, Result};

/// Show host facts probed before a test.
#[derive(Args, Debug)]
pub struct HostInfoCmd {
    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl HostInfoCmd {
    /// Execute the host-info command.
    pub fn run(&self, params: &Params) -> Result<()> {
        let kernel = probe::kernel_release().unwrap_or_else(|| probe::UNKNOWN_VERSION.to_string());
        let kvm = probe::kvm_version(params);
        let userspace = probe::kvm_userspace_version(params);
        let missing: Vec<String> = params
            .objects("cmds_installed_host")
            .into_iter()
            .filter(|cmd| probe::find_command(cmd).is_none())
            .collect();

        if self.json {
            let info = serde_json::json!({
                "root": probe::is_root(),
                "kernel_release": kernel,
                "kvm_version": kvm,
                "kvm_userspace_version": userspace,
                "images_base_dir": params.images_base_dir(),
                "missing_commands": missing,
            });
            let json = serde_json::to_string_pretty(&info)
                .map_err(|e| vmfixture::Error::config(e.to_string()))?;
            println!("{}", json);
            return Ok(());
        }

        println!("Host Information:");
        println!("  Root: {}", if probe::is_root() { "yes" } else { "no" });
        println!("  Kernel release: {}", kernel);
        println!("  KVM version: {}", kvm);
        println!("  KVM userspace version: {}", userspace);
        println!("  Images base dir: {}", params.images_base_dir().display());
        if missing.is_empty() {
            println!("  Required commands: all found");
        } else {
            println!("  Missing commands: {}", missing.join(", "));
        }
        Ok(())
    }
}
