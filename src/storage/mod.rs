//! Disk image storage.
//!
//! This module defines the collaborators image preparation talks to and the
//! per-image lifecycle built on top of them.
//!
//! # Collaborators
//!
//! - [`ImageBackend`]: create/check/backup/restore/remove/clone one image
//! - [`StorageProvider`]: iSCSI, LVM and NFS backed storage devices
//!
//! # Lifecycle
//!
//! - [`image::prepare_image`]: before the test, decide whether to back up and
//!   (re)create an image
//! - [`image::postprocess_image`]: after the test, check, back up, restore or
//!   remove it

pub mod image;
pub mod qemu_img;

use crate::config::Params;
use crate::error::Result;
use std::path::{Path, PathBuf};

/// Default image name when `image_name` is unset.
pub const DEFAULT_IMAGE_NAME: &str = "image";

/// Default image format when `image_format` is unset.
pub const DEFAULT_IMAGE_FORMAT: &str = "qcow2";

/// One image: its logical name, scoped parameters, and base directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSpec {
    /// Logical image name (`image1`, `stg`...).
    pub name: String,
    /// Parameters scoped to this image.
    pub params: Params,
    /// Directory relative image paths resolve against.
    pub base_dir: PathBuf,
}

impl ImageSpec {
    /// Create an image spec.
    pub fn new(name: impl Into<String>, params: Params, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            params,
            base_dir: base_dir.into(),
        }
    }

    /// Create an image spec resolving the base directory from `params`.
    pub fn from_params(name: impl Into<String>, params: Params) -> Self {
        let base_dir = params.images_base_dir();
        Self::new(name, params, base_dir)
    }

    /// Path of the image file.
    pub fn filename(&self) -> PathBuf {
        image_filename(&self.params, &self.base_dir)
    }

    /// Whether this image is listed in `master_images_clone`.
    pub fn in_clone_set(&self) -> bool {
        self.params
            .objects("master_images_clone")
            .iter()
            .any(|image| image == &self.name)
    }
}

/// Compute the image file path for `params`.
///
/// Raw devices use `image_name` verbatim; otherwise the format is appended as
/// an extension and relative names are resolved against `base_dir`.
pub fn image_filename(params: &Params, base_dir: &Path) -> PathBuf {
    let image_name = params.get_or("image_name", DEFAULT_IMAGE_NAME);
    if params.is_yes("image_raw_device") {
        return PathBuf::from(image_name);
    }
    let file = match params.get_or("image_format", DEFAULT_IMAGE_FORMAT) {
        "" => image_name.to_string(),
        format => format!("{}.{}", image_name, format),
    };
    base_dir.join(file)
}

/// Direction of a backup operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupAction {
    /// Copy the image to its backup.
    Backup,
    /// Copy the backup over the image.
    Restore,
}

impl BackupAction {
    /// Get the action name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupAction::Backup => "backup",
            BackupAction::Restore => "restore",
        }
    }
}

/// Image backend operations.
pub trait ImageBackend: Send + Sync {
    /// Make backend-specific preconditions hold (pools, directories...).
    fn prepare_backend(&self, image: &ImageSpec) -> Result<()>;

    /// Path of the image file.
    fn filename(&self, image: &ImageSpec) -> PathBuf {
        image.filename()
    }

    /// Whether `path` exists on this backend.
    fn file_exists(&self, _image: &ImageSpec, path: &Path) -> bool {
        path.exists()
    }

    /// Delete `path` on this backend.
    fn file_remove(&self, _image: &ImageSpec, path: &Path) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    /// Create the image.
    fn create(&self, image: &ImageSpec) -> Result<()>;

    /// Back the image up or restore it from its backup.
    ///
    /// With `skip_existing`, a backup is not overwritten.
    fn backup(&self, image: &ImageSpec, action: BackupAction, skip_existing: bool) -> Result<()>;

    /// Check image integrity.
    ///
    /// Failures are reported as [`crate::Error::ImageCheck`].
    fn check(&self, image: &ImageSpec) -> Result<()>;

    /// Human-readable image information (`key: value` lines), if available.
    fn info(&self, image: &ImageSpec) -> Result<Option<String>>;

    /// Remove the image.
    fn remove(&self, image: &ImageSpec) -> Result<()>;

    /// Clone a master image for `vm_name`.
    fn clone_image(&self, image: &ImageSpec, vm_name: &str) -> Result<()>;

    /// Storage type name for logging.
    fn storage_type(&self, image: &ImageSpec) -> String {
        image.params.get_or("storage_type", "filesystem").to_string()
    }
}

/// Host storage backing the test images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// iSCSI target exported as a local block device.
    Iscsi,
    /// LVM logical volume.
    Lvm,
    /// NFS mount.
    Nfs,
}

impl StorageKind {
    /// Parse `storage_type`; other values need no host setup.
    pub fn from_params(params: &Params) -> Option<Self> {
        match params.get("storage_type")? {
            "iscsi" => Some(StorageKind::Iscsi),
            "lvm" => Some(StorageKind::Lvm),
            "nfs" => Some(StorageKind::Nfs),
            _ => None,
        }
    }

    /// Label used in cleanup error reports.
    pub fn label(&self) -> &'static str {
        match self {
            StorageKind::Iscsi => "iscsi",
            StorageKind::Lvm => "LVM",
            StorageKind::Nfs => "nfs",
        }
    }
}

/// A host storage device set up for the test.
pub trait StorageDevice: Send {
    /// Set the device up.
    ///
    /// Returns the device path (iSCSI, LVM) or the mount directory (NFS).
    fn setup(&mut self) -> Result<String>;

    /// Tear the device down.
    fn cleanup(&mut self) -> Result<()>;
}

/// Factory for host storage devices.
pub trait StorageProvider: Send + Sync {
    /// Build the device for `kind` from the test parameters.
    fn device(&self, kind: StorageKind, params: &Params, base_dir: &Path) -> Result<Box<dyn StorageDevice>>;
}
