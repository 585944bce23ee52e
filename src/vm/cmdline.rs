//! Guest kernel command line verification over the serial console.

use super::Vm;
use crate::config::Params;
use crate::error::{Error, Result};
use regex::Regex;
use std::time::Duration;

/// Default marker preceding the kernel command line in boot output.
pub const DEFAULT_CMDLINE_MARKER: &str = "Command line:";

/// Time allowed for the marker to show up.
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of a kernel command line verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmdlineCheck {
    /// The command line matched the expectations.
    Verified(String),
    /// The command line could not be read; nothing was checked.
    Skipped(String),
}

/// Verify the kernel command line the guest booted with.
///
/// Reads serial output until `kernel_cmd_line_str` shows up, then requires
/// every token of `kernel_options_exist` to be present and every token of
/// `kernel_options_not_exist` to be absent. A mismatch is a
/// [`Error::TestError`]; a paused or dead VM, a missing console, or a failed
/// read skips the check with a warning.
pub fn verify_kernel_cmdline(vm: &dyn Vm, params: &Params) -> Result<CmdlineCheck> {
    let reason = if vm.is_paused() {
        Some("VM is paused.")
    } else if !vm.is_alive() {
        Some("VM is not alive.")
    } else {
        None
    };

    let console = match (reason, vm.serial_console()) {
        (Some(reason), _) => return Ok(skipped(vm, reason.to_string())),
        (None, None) => {
            return Ok(skipped(vm, "There is no serial console in VM.".to_string()))
        }
        (None, Some(console)) => console,
    };

    let marker = params.get_or("kernel_cmd_line_str", DEFAULT_CMDLINE_MARKER);
    let output = match console.read_until_output_matches(&[marker], SERIAL_READ_TIMEOUT) {
        Ok(output) => output,
        Err(e) => return Ok(skipped(vm, format!("Error is {}", e))),
    };

    let Some(cmdline) = extract_cmdline(marker, &output) else {
        return Ok(skipped(
            vm,
            format!("'{}' not found in serial output", marker),
        ));
    };

    let mut problems = String::new();
    for option in params.objects("kernel_options_exist") {
        if !cmdline.contains(&option) {
            problems.push_str(&format!("{} not in kernel command line as expect.", option));
        }
    }
    for option in params.objects("kernel_options_not_exist") {
        if cmdline.contains(&option) {
            problems.push_str(&format!("{} exist in kernel command line.", option));
        }
    }

    if !problems.is_empty() {
        return Err(Error::test_error(format!(
            "{} Kernel command line get from serial output is {}",
            problems, cmdline
        )));
    }

    tracing::info!(vm = %vm.name(), "kernel command line from serial port is as expected");
    Ok(CmdlineCheck::Verified(cmdline))
}

/// The rest of the first line of `output` starting at the literal `marker`.
fn extract_cmdline(marker: &str, output: &str) -> Option<String> {
    let pattern = Regex::new(&format!("{}.*", regex::escape(marker))).ok()?;
    pattern.find(output).map(|m| m.as_str().trim_end().to_string())
}

fn skipped(vm: &dyn Vm, reason: String) -> CmdlineCheck {
    tracing::warn!(
        vm = %vm.name(),
        reason = %reason,
        "could not read the kernel command line from serial output, skipping the check"
    );
    CmdlineCheck::Skipped(reason)
}
