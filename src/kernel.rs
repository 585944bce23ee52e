//! Guest kernel command line patching.
//!
//! Before a test, extra kernel parameters can be added to or removed from
//! the boot entry inside the guest image. The original entry is remembered
//! as a [`KernelPatch`] so it can be put back verbatim after the test.

use crate::config::Params;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::storage::image_filename;
use regex::Regex;
use std::path::{Path, PathBuf};

/// Default boot configuration file inside the guest.
pub const DEFAULT_GRUB_FILE: &str = "/boot/grub2/grub.cfg";

/// Default pattern locating the kernel entry in the boot configuration.
pub const DEFAULT_KERNEL_CFG_POS_REG: &str = r".*vmlinuz-\d+.*";

const PCI_NOMSI: &str = "pci=nomsi";

/// Read/write access to files inside a guest image.
pub trait GuestDiskEditor {
    /// Read a file from the guest filesystem.
    fn read_file(&mut self, path: &str) -> Result<String>;

    /// Replace a file in the guest filesystem.
    fn write_file(&mut self, path: &str, content: &str) -> Result<()>;
}

/// Opens guest images for editing.
pub trait GuestDiskOpener: Send + Sync {
    /// Open the image at `image`.
    fn open(&self, image: &Path) -> Result<Box<dyn GuestDiskEditor>>;
}

/// A boot entry change waiting to be reverted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelPatch {
    /// Guest image holding the boot configuration.
    pub image: PathBuf,
    /// Boot configuration file inside the guest.
    pub grub_file: String,
    /// Pattern locating the kernel entry.
    pub pattern: String,
    /// Kernel entry before the patch.
    pub original: String,
}

/// Requested kernel parameter changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelChanges {
    /// Parameters to add, space separated.
    pub add: String,
    /// Parameters to remove, space separated.
    pub remove: String,
}

impl KernelChanges {
    /// Read `kernel_extra_params_add`/`kernel_extra_params_remove`, folding
    /// in `disable_pci_msi`.
    ///
    /// `disable_pci_msi=yes` turns any `pci=` addition into `pci=nomsi` (or
    /// adds it) and sets `ker_remove_similar_pci=yes`; any other value
    /// removes `pci=nomsi`.
    pub fn from_params(params: &mut Params) -> Self {
        let mut add = params.get_or("kernel_extra_params_add", "").to_string();
        let mut remove = params.get_or("kernel_extra_params_remove", "").to_string();

        let disable = params.get("disable_pci_msi").map(str::to_string);
        if let Some(disable) = disable.filter(|v| !v.is_empty()) {
            if disable == "yes" {
                add = force_pci_nomsi(&add);
                params.set("ker_remove_similar_pci", "yes");
            } else {
                remove.push(' ');
                remove.push_str(PCI_NOMSI);
            }
        }

        Self {
            add: add.trim().to_string(),
            remove: remove.trim().to_string(),
        }
    }

    /// Whether anything needs to change.
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }

    /// Apply the changes to a kernel entry.
    ///
    /// Similar parameters are dropped before an addition when
    /// `ker_remove_similar` is set for the parameter key.
    pub fn apply(&self, entry: &str, params: &Params) -> String {
        let mut result = entry.to_string();
        for param in self.add.split_whitespace() {
            let key = param.split('=').next().unwrap_or(param);
            let remove_similar = params.object_params(key).is_yes("ker_remove_similar");
            result = add_kernel_param(&result, param, remove_similar);
        }
        for param in self.remove.split_whitespace() {
            result = remove_kernel_param(&result, param);
        }
        result
    }
}

fn force_pci_nomsi(add: &str) -> String {
    let mut replaced = false;
    let mut tokens: Vec<&str> = add
        .split_whitespace()
        .map(|token| {
            if token.starts_with("pci=") {
                replaced = true;
                PCI_NOMSI
            } else {
                token
            }
        })
        .collect();
    if !replaced {
        tokens.push(PCI_NOMSI);
    }
    tokens.join(" ")
}

/// Split a boot entry into leading indentation and the command.
fn split_indent(entry: &str) -> (&str, &str) {
    let body = entry.trim_start();
    (&entry[..entry.len() - body.len()], body.trim_end())
}

/// Add `param` to a kernel entry unless it is already there.
///
/// With `remove_similar`, tokens sharing the parameter key (`key=...`) are
/// dropped first.
pub fn add_kernel_param(entry: &str, param: &str, remove_similar: bool) -> String {
    let param = param.trim();
    let (indent, body) = split_indent(entry);

    if body.split_whitespace().any(|token| token == param) {
        tracing::debug!(param, "parameter already in kernel command line");
        return format!("{}{}", indent, body);
    }

    let mut body = body.to_string();
    if remove_similar {
        if let Some((key, _)) = param.split_once('=') {
            let prefix = format!("{}=", key);
            if body.split_whitespace().any(|token| token.starts_with(&prefix)) {
                body = body
                    .split_whitespace()
                    .filter(|token| !token.starts_with(&prefix))
                    .collect::<Vec<_>>()
                    .join(" ");
            }
        }
    }

    format!("{}{} {}", indent, body, param)
}

/// Remove every `param` token from a kernel entry.
pub fn remove_kernel_param(entry: &str, param: &str) -> String {
    let param = param.trim();
    let (indent, body) = split_indent(entry);

    if !body.split_whitespace().any(|token| token == param) {
        return format!("{}{}", indent, body);
    }

    let body = body
        .split_whitespace()
        .filter(|token| *token != param)
        .collect::<Vec<_>>()
        .join(" ");
    format!("{}{}", indent, body)
}

/// First match of `pattern` in `config`.
pub fn locate_entry(config: &str, pattern: &str) -> Result<String> {
    let re = Regex::new(pattern)
        .map_err(|e| Error::config(format!("invalid kernel_cfg_pos_reg '{}': {}", pattern, e)))?;
    re.find(config)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            Error::test_error(format!("Cannot find the kernel config, reg is {}", pattern))
        })
}

/// Replace the first occurrence of `old` with `new` in a guest file.
fn replace_in_file(editor: &mut dyn GuestDiskEditor, path: &str, old: &str, new: &str) -> Result<()> {
    let content = editor.read_file(path)?;
    if !content.contains(old) {
        return Err(Error::GuestDisk(format!("'{}' not found in {}", old, path)));
    }
    editor.write_file(path, &content.replacen(old, new, 1))
}

/// Destroy every registered VM, optionally dropping it from the registry.
fn destroy_all_vms(env: &Environment, unregister: bool) {
    for vm in env.get_all_vms() {
        if let Err(e) = vm.destroy(true) {
            tracing::warn!(vm = %vm.name(), error = %e, "failed to destroy vm");
        }
        if unregister {
            env.unregister_vm(vm.name());
        }
    }
}

/// Patch the guest kernel entry as requested by `params`.
///
/// Returns the pending patch when the entry was rewritten. When any change
/// is requested, the VM is marked for a serial console check of the new
/// command line, even if the entry already matched.
pub fn apply_kernel_patch(
    opener: &dyn GuestDiskOpener,
    params: &mut Params,
    env: &Environment,
) -> Result<Option<KernelPatch>> {
    let changes = KernelChanges::from_params(params);
    if changes.is_empty() {
        return Ok(None);
    }

    let image = image_filename(params, &params.images_base_dir());
    let grub_file = params.get_or("grub_file", DEFAULT_GRUB_FILE).to_string();
    let pattern = params
        .get_or("kernel_cfg_pos_reg", DEFAULT_KERNEL_CFG_POS_REG)
        .to_string();

    let mut editor = opener.open(&image)?;
    let config = editor.read_file(&grub_file)?;
    let original = locate_entry(&config, &pattern)?;
    let patched = changes.apply(&original, params);

    tracing::debug!(
        added = %changes.add,
        removed = %changes.remove,
        "guest cmdline extra params setting"
    );

    let patch = if patched.trim() != original.trim() {
        destroy_all_vms(env, true);
        replace_in_file(editor.as_mut(), &grub_file, &original, &patched)?;
        tracing::info!(image = %image.display(), entry = %patched.trim(), "patched guest kernel entry");
        Some(KernelPatch {
            image,
            grub_file,
            pattern,
            original,
        })
    } else {
        None
    };

    params.set("check_kernel_cmd_line_from_serial", "yes");
    if !changes.add.is_empty() {
        params.set("kernel_options_exist", changes.add.as_str());
    }
    if !changes.remove.is_empty() {
        params.set("kernel_options_not_exist", changes.remove.as_str());
    }

    Ok(patch)
}

/// Put the original kernel entry back.
pub fn restore_kernel_patch(
    opener: &dyn GuestDiskOpener,
    patch: &KernelPatch,
    env: &Environment,
) -> Result<()> {
    destroy_all_vms(env, false);

    let mut editor = opener.open(&patch.image)?;
    let config = editor.read_file(&patch.grub_file)?;
    let current = locate_entry(&config, &patch.pattern)?;
    replace_in_file(editor.as_mut(), &patch.grub_file, &current, &patch.original)?;

    tracing::debug!(image = %patch.image.display(), "restored guest kernel command line");
    Ok(())
}
