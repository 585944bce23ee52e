//! Image commands.
//!
//! Drive the image lifecycle for every image in `images` using the
//! `qemu-img` backend, as if no VM used them.

use clap::{Args, Subcommand};
use vmfixture::scheduler::process_images;
use vmfixture::storage::image::{postprocess_image, prepare_image};
use vmfixture::storage::qemu_img::QemuImgBackend;
use vmfixture::storage::ImageSpec;
use vmfixture::{Params, Result};

/// Image commands
#[derive(Subcommand, Debug)]
pub enum ImagesCmd {
    /// Create or back up images before a test.
    Prepare(PrepareCmd),

    /// Check, restore or remove images after a test.
    Cleanup(CleanupCmd),
}

impl ImagesCmd {
    pub fn run(self, params: &Params) -> Result<()> {
        match self {
            ImagesCmd::Prepare(cmd) => cmd.run(params),
            ImagesCmd::Cleanup(cmd) => cmd.run(params),
        }
    }
}

// ============================================================================
// Prepare Command
// ============================================================================

/// Create or back up images before a test
#[derive(Args, Debug)]
pub struct PrepareCmd {
    /// Recreate images even if they exist.
    #[arg(long)]
    pub force: bool,
}

impl PrepareCmd {
    pub fn run(self, params: &Params) -> Result<()> {
        let mut params = params.clone();
        if self.force {
            params.set("force_create_image", "yes");
        }

        let backend = QemuImgBackend::from_params(&params);
        process_images(&params, None, |name, image_params, _| {
            prepare_image(&backend, &ImageSpec::from_params(name, image_params.clone()))
        })?;

        println!("Prepared {} image(s)", params.objects("images").len());
        Ok(())
    }
}

// ============================================================================
// Cleanup Command
// ============================================================================

/// Check, restore or remove images after a test
#[derive(Args, Debug)]
pub struct CleanupCmd {
    /// Remove the images after processing.
    #[arg(long)]
    pub remove: bool,
}

impl CleanupCmd {
    pub fn run(self, params: &Params) -> Result<()> {
        let mut params = params.clone();
        if self.remove {
            params.set("remove_image", "yes");
        }

        let backend = QemuImgBackend::from_params(&params);
        process_images(&params, None, |name, image_params, status| {
            postprocess_image(&backend, &ImageSpec::from_params(name, image_params.clone()), status)
        })?;

        println!("Processed {} image(s)", params.objects("images").len());
        Ok(())
    }
}
