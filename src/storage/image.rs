//! Per-image pre- and post-test actions.

use super::{BackupAction, ImageBackend, ImageSpec};
use crate::error::Result;
use crate::vm::ProcessStatus;

/// Which images a lifecycle action may touch under `clone_master`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloneScope {
    /// No clone master configured: every image is in scope.
    All,
    /// `clone_master=yes` and the image is a clone.
    Clone,
    /// `clone_master=yes` and the image is not a clone.
    Excluded,
    /// `clone_master` has another value: the image is not checked or removed.
    Unchecked,
}

impl CloneScope {
    fn of(image: &ImageSpec) -> Self {
        match image.params.get("clone_master") {
            None => CloneScope::All,
            Some("yes") if image.in_clone_set() => CloneScope::Clone,
            Some("yes") => CloneScope::Excluded,
            Some(_) => CloneScope::Unchecked,
        }
    }

    fn allows_check(&self) -> bool {
        matches!(self, CloneScope::All | CloneScope::Clone)
    }
}

/// Prepare one image before the test.
///
/// Backend preparation failures are logged, not raised. The image is created
/// when `force_create_image=yes`, or when `create_image=yes` and no file
/// exists yet; an existing file is removed first since some backends cannot
/// overwrite in place. `backup_image_before_testing=yes` snapshots the image
/// before any creation.
pub fn prepare_image(backend: &dyn ImageBackend, image: &ImageSpec) -> Result<()> {
    let params = &image.params;

    if let Err(e) = backend.prepare_backend(image) {
        tracing::error!(image = %image.name, error = %e, "backend can't be prepared correctly");
    }

    let filename = backend.filename(image);

    let create = if params.is_yes("force_create_image") {
        true
    } else {
        params.is_yes("create_image") && !backend.file_exists(image, &filename)
    };

    if params.is_yes("backup_image_before_testing") {
        backend.backup(image, BackupAction::Backup, true)?;
    }

    if create {
        if backend.file_exists(image, &filename) {
            backend.file_remove(image, &filename)?;
        }
        tracing::info!(
            image = %image.name,
            storage = %backend.storage_type(image),
            path = %filename.display(),
            "creating image"
        );
        backend.create(image)?;
    }

    Ok(())
}

/// Reconcile one image after the test.
///
/// `status` is the state of the VM owning the image, if any.
pub fn postprocess_image(
    backend: &dyn ImageBackend,
    image: &ImageSpec,
    status: Option<ProcessStatus>,
) -> Result<()> {
    let params = &image.params;
    let scope = CloneScope::of(image);

    if scope == CloneScope::Excluded {
        tracing::debug!(image = %image.name, "image is not a master clone, leaving it alone");
        return Ok(());
    }

    let mut restored = false;
    let mut check = params.is_yes("check_image");

    if check && status == Some(ProcessStatus::Running) {
        check = live_check_allowed(backend, image);
    }

    if check {
        match check_and_snapshot(backend, image, scope) {
            Ok(did_restore) => restored = did_restore,
            Err(e) => {
                if params.is_yes("restore_image_on_check_error") {
                    if let Err(re) = backend.backup(image, BackupAction::Restore, false) {
                        tracing::warn!(image = %image.name, error = %re, "restore after failed check failed");
                    }
                }
                if params.is_yes("remove_image_on_check_error") && image.in_clone_set() {
                    if let Err(re) = backend.remove(image) {
                        tracing::warn!(image = %image.name, error = %re, "remove after failed check failed");
                    }
                }
                if params.is_yes("skip_cluster_leak_warn") && e.is_cluster_leak() {
                    tracing::warn!(image = %image.name, error = %e, "ignoring leaked clusters");
                } else {
                    return Err(e);
                }
            }
        }
    }

    if !restored && params.is_yes("restore_image_after_testing") {
        backend.backup(image, BackupAction::Restore, false)?;
    }

    if params.is_yes("remove_image") && scope.allows_check() {
        tracing::info!(image = %image.name, storage = %backend.storage_type(image), "removing image");
        backend.remove(image)?;
    }

    Ok(())
}

/// Decide whether an image may be checked while its VM is still running.
fn live_check_allowed(backend: &dyn ImageBackend, image: &ImageSpec) -> bool {
    if image.params.is_yes("skip_image_check_during_running") {
        tracing::debug!(image = %image.name, "guest is still running, skip the image check");
        return false;
    }

    let info = match backend.info(image) {
        Ok(Some(info)) => info,
        Ok(None) => {
            tracing::debug!(image = %image.name, "no image info available, skip the image check");
            return false;
        }
        Err(e) => {
            tracing::warn!(image = %image.name, error = %e, "failed to query image info, skip the image check");
            return false;
        }
    };

    if has_lazy_refcounts(&info) {
        tracing::debug!(
            image = %image.name,
            "image uses lazy refcounts, it must not be checked while the guest is alive"
        );
        return false;
    }
    true
}

/// Run the check, then apply `backup_image` or `restore_image`.
///
/// Returns whether the image was restored (or re-based on a new backup).
fn check_and_snapshot(backend: &dyn ImageBackend, image: &ImageSpec, scope: CloneScope) -> Result<bool> {
    if scope.allows_check() {
        backend.check(image)?;
    }

    if image.params.is_yes("backup_image") {
        backend.backup(image, BackupAction::Backup, false)?;
        Ok(true)
    } else if image.params.is_yes("restore_image") {
        backend.backup(image, BackupAction::Restore, false)?;
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Whether image info reports `lazy refcounts: true`.
fn has_lazy_refcounts(info: &str) -> bool {
    info.lines().any(|line| {
        let parts: Vec<&str> = line.split(':').collect();
        parts.len() == 2 && parts[0].trim() == "lazy refcounts" && parts[1].trim() == "true"
    })
}
