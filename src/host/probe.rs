//! Read-only host probes: privileges, installed commands, hypervisor versions.

use crate::config::Params;
use crate::error::{Error, Result};
use regex::Regex;
use std::ffi::CStr;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Version reported when a probe fails.
pub const UNKNOWN_VERSION: &str = "Unknown";

/// Directories searched for commands in addition to `PATH`.
const EXTRA_COMMAND_DIRS: &[&str] = &["/usr/local/sbin", "/usr/sbin", "/sbin"];

const DEV_KVM: &str = "/dev/kvm";
const KVM_MODULE_VERSION: &str = "/sys/module/kvm/version";

/// Whether the process runs with root privileges.
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Fail with [`Error::Skip`] unless running as root.
pub fn verify_running_as_root() -> Result<()> {
    if is_root() {
        Ok(())
    } else {
        Err(Error::skip("This test requires root privileges"))
    }
}

/// Locate `command` in `PATH` and the usual sbin directories.
pub fn find_command(command: &str) -> Option<PathBuf> {
    if let Ok(path) = which::which(command) {
        return Some(path);
    }
    let extra = std::env::join_paths(EXTRA_COMMAND_DIRS).ok()?;
    which::which_in(command, Some(extra), "/").ok()
}

/// Kernel release as reported by `uname`.
pub fn kernel_release() -> Option<String> {
    // SAFETY: utsname is plain data; uname fills it on success.
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return None;
    }
    // SAFETY: uname NUL-terminates every field.
    let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) };
    Some(release.to_string_lossy().into_owned())
}

/// Run a shell command and return its trimmed stdout.
pub fn run_shell(command: &str) -> Result<String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .map_err(|e| Error::command_failed(command, e.to_string()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::command_failed(
            command,
            format!("{}: {}", output.status, stderr.trim()),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Hypervisor kernel module version.
///
/// Uses `kvm_ver_cmd` when set; otherwise the module version from sysfs,
/// falling back to the kernel release.
pub fn kvm_version(params: &Params) -> String {
    kvm_version_at(params, Path::new(DEV_KVM), Path::new(KVM_MODULE_VERSION))
}

fn kvm_version_at(params: &Params, dev_kvm: &Path, module_version: &Path) -> String {
    if let Some(cmd) = params.get("kvm_ver_cmd").filter(|c| !c.is_empty()) {
        return run_shell(cmd).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "kvm version command failed");
            UNKNOWN_VERSION.to_string()
        });
    }

    if !dev_kvm.exists() {
        tracing::warn!("KVM module not loaded");
        return UNKNOWN_VERSION.to_string();
    }

    match std::fs::read_to_string(module_version) {
        Ok(version) => version.trim().to_string(),
        Err(_) => kernel_release().unwrap_or_else(|| UNKNOWN_VERSION.to_string()),
    }
}

/// Hypervisor userspace version.
///
/// Uses `kvm_userspace_ver_cmd` when set; otherwise parses the first line of
/// `<qemu_binary> -help`.
pub fn kvm_userspace_version(params: &Params) -> String {
    if let Some(cmd) = params.get("kvm_userspace_ver_cmd").filter(|c| !c.is_empty()) {
        return run_shell(cmd).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "kvm userspace version command failed");
            UNKNOWN_VERSION.to_string()
        });
    }

    let qemu = params.get_or("qemu_binary", "qemu-kvm");
    let first_line = run_shell(&format!("{} -help | head -n 1", qemu)).unwrap_or_default();
    parse_userspace_version(&first_line).unwrap_or_else(|| UNKNOWN_VERSION.to_string())
}

/// Extract the version from a `QEMU emulator version X.Y.Z, ...` banner.
pub fn parse_userspace_version(line: &str) -> Option<String> {
    let re = Regex::new(r"[Vv]ersion .*?,").ok()?;
    let found = re.find(line)?.as_str();
    let version = found
        .split_whitespace()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    Some(version.trim_matches(',').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_userspace_version() {
        assert_eq!(
            parse_userspace_version("QEMU emulator version 8.2.2 (qemu-8.2.2-1.fc40), Copyright"),
            Some("8.2.2 (qemu-8.2.2-1.fc40)".to_string())
        );
        assert_eq!(parse_userspace_version("usage: qemu [options]"), None);
    }

    #[test]
    fn test_kvm_version_probes() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dir.path().join("kvm");
        let version = dir.path().join("version");

        assert_eq!(kvm_version_at(&Params::new(), &dev, &version), UNKNOWN_VERSION);

        std::fs::write(&dev, b"").unwrap();
        std::fs::write(&version, b"kvm-104\n").unwrap();
        assert_eq!(kvm_version_at(&Params::new(), &dev, &version), "kvm-104");

        std::fs::remove_file(&version).unwrap();
        assert_eq!(
            kvm_version_at(&Params::new(), &dev, &version),
            kernel_release().unwrap()
        );
    }

    #[test]
    fn test_version_command_override() {
        let params: Params = [("kvm_ver_cmd", "echo ' 6.9-custom '")].into_iter().collect();
        assert_eq!(kvm_version(&params), "6.9-custom");

        let failing: Params = [("kvm_userspace_ver_cmd", "exit 3")].into_iter().collect();
        assert_eq!(kvm_userspace_version(&failing), UNKNOWN_VERSION);
    }

    #[test]
    fn test_find_command() {
        assert!(find_command("sh").is_some());
        assert!(find_command("definitely-not-a-command-4711").is_none());
        assert!(find_command("/nonexistent/bin/tool").is_none());
    }

    #[test]
    fn test_find_command_needs_exec_bit() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("tool");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        let tool_str = tool.to_str().unwrap();

        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(find_command(tool_str).is_none());

        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(find_command(tool_str).is_some());
    }
}
