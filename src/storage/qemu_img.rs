//! File-backed image backend driven by `qemu-img`.
//!
//! Images live as plain files under the base directory. Backups are sibling
//! files with a `.backup` suffix; master clones are copies named
//! `<image_name>_<vm>.<format>`.

use super::{BackupAction, ImageBackend, ImageSpec, DEFAULT_IMAGE_FORMAT};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Default size for new images.
pub const DEFAULT_IMAGE_SIZE: &str = "10G";

/// Backup file suffix.
const BACKUP_SUFFIX: &str = "backup";

/// Image backend that shells out to `qemu-img`.
#[derive(Debug, Clone)]
pub struct QemuImgBackend {
    /// Path to the qemu-img binary.
    binary: PathBuf,
}

impl Default for QemuImgBackend {
    fn default() -> Self {
        Self::new("qemu-img")
    }
}

impl QemuImgBackend {
    /// Create a backend using the given qemu-img binary.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Create a backend honoring the `qemu_img_binary` parameter.
    pub fn from_params(params: &crate::config::Params) -> Self {
        Self::new(params.get_or("qemu_img_binary", "qemu-img"))
    }

    fn run(&self, subcommand: &str, args: &[&str]) -> Result<std::process::Output> {
        tracing::debug!(binary = %self.binary.display(), subcommand, ?args, "running qemu-img");
        Command::new(&self.binary)
            .arg(subcommand)
            .args(args)
            .output()
            .map_err(|e| Error::command_failed(format!("qemu-img {}", subcommand), e.to_string()))
    }

    fn format(image: &ImageSpec) -> &str {
        match image.params.get_or("image_format", DEFAULT_IMAGE_FORMAT) {
            "" => "raw",
            format => format,
        }
    }
}

/// Path of the backup for `filename`.
pub fn backup_path(filename: &Path) -> PathBuf {
    let mut name = filename.as_os_str().to_owned();
    name.push(".");
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

impl ImageBackend for QemuImgBackend {
    fn prepare_backend(&self, image: &ImageSpec) -> Result<()> {
        if let Some(parent) = self.filename(image).parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn create(&self, image: &ImageSpec) -> Result<()> {
        let filename = self.filename(image);
        let path = filename.to_string_lossy();
        let size = image.params.get_or("image_size", DEFAULT_IMAGE_SIZE);
        let output = self.run("create", &["-f", Self::format(image), &*path, size])?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::image(
                &image.name,
                format!("failed to create {}: {}", path, stderr.trim()),
            ));
        }

        tracing::debug!(image = %image.name, path = %path, size, "created image");
        Ok(())
    }

    fn backup(&self, image: &ImageSpec, action: BackupAction, skip_existing: bool) -> Result<()> {
        let filename = self.filename(image);
        let backup = backup_path(&filename);

        let (src, dst) = match action {
            BackupAction::Backup => {
                if skip_existing && backup.exists() {
                    tracing::debug!(image = %image.name, backup = %backup.display(), "backup exists, not overwriting");
                    return Ok(());
                }
                (filename, backup)
            }
            BackupAction::Restore => (backup, filename),
        };

        if !src.exists() {
            return Err(Error::ImageNotFound { path: src });
        }

        tracing::info!(
            image = %image.name,
            action = action.as_str(),
            from = %src.display(),
            to = %dst.display(),
            "copying image"
        );
        std::fs::copy(&src, &dst)?;
        Ok(())
    }

    fn check(&self, image: &ImageSpec) -> Result<()> {
        let filename = self.filename(image);
        if !filename.exists() {
            tracing::debug!(image = %image.name, "image file does not exist, nothing to check");
            return Ok(());
        }

        let path = filename.to_string_lossy();
        let output = self.run("check", &["-f", Self::format(image), &*path])?;

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ImageCheck {
                image: image.name.clone(),
                message: format!("{}{}", stdout.trim(), stderr.trim()),
            });
        }
        Ok(())
    }

    fn info(&self, image: &ImageSpec) -> Result<Option<String>> {
        let filename = self.filename(image);
        if !filename.exists() {
            return Ok(None);
        }

        let path = filename.to_string_lossy();
        let output = self.run("info", &[&*path])?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
    }

    fn remove(&self, image: &ImageSpec) -> Result<()> {
        let filename = self.filename(image);
        if filename.exists() {
            tracing::debug!(image = %image.name, path = %filename.display(), "removing image file");
            std::fs::remove_file(&filename)?;
        }
        Ok(())
    }

    fn clone_image(&self, image: &ImageSpec, vm_name: &str) -> Result<()> {
        let master = self.filename(image);
        if !master.exists() {
            return Err(Error::ImageNotFound { path: master });
        }

        let mut clone_params = image.params.clone();
        let image_name = image.params.get_or("image_name", super::DEFAULT_IMAGE_NAME);
        clone_params.set("image_name", format!("{}_{}", image_name, vm_name));
        let clone = ImageSpec::new(&image.name, clone_params, &image.base_dir).filename();

        tracing::info!(
            image = %image.name,
            vm = %vm_name,
            clone = %clone.display(),
            "cloning master image"
        );
        std::fs::copy(&master, &clone)?;
        Ok(())
    }
}
