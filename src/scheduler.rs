//! Serial or parallel processing of a set of images.
//!
//! Small image sets run on the calling thread in declared order. Sets larger
//! than [`PARALLEL_THRESHOLD`] are split round-robin across a bounded number
//! of worker threads. A failing worker raises the shared exit flag so the
//! other workers stop after their current image; the scheduler returns the
//! error of the lowest-numbered failing worker once every worker has
//! finished.

use crate::config::Params;
use crate::error::Result;
use crate::vm::ProcessStatus;
use std::sync::atomic::{AtomicBool, Ordering};

/// Image count above which images are processed in parallel.
pub const PARALLEL_THRESHOLD: usize = 20;

/// Images per worker when sizing the pool.
const IMAGES_PER_WORKER: usize = 5;

/// Number of workers for `images` images on a host with `cores` cores.
pub fn worker_count(images: usize, cores: usize) -> usize {
    (images / IMAGES_PER_WORKER).min(2 * cores).max(1)
}

/// Split `images` into worker partitions, or `None` for serial processing.
///
/// Partition `i` holds every `workers`-th image starting at `i`, keeping the
/// declared relative order.
pub fn plan_partitions(images: &[String], cores: usize) -> Option<Vec<Vec<String>>> {
    if images.len() <= PARALLEL_THRESHOLD {
        return None;
    }

    let workers = worker_count(images.len(), cores);
    let mut partitions = vec![Vec::new(); workers];
    for (index, image) in images.iter().enumerate() {
        partitions[index % workers].push(image.clone());
    }
    Some(partitions)
}

/// Host core count.
pub fn host_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Run `action` for every image listed in `params.images`.
///
/// Each call receives the image name, its scoped parameters, and `status`.
pub fn process_images<F>(params: &Params, status: Option<ProcessStatus>, action: F) -> Result<()>
where
    F: Fn(&str, &Params, Option<ProcessStatus>) -> Result<()> + Sync,
{
    let images = params.objects("images");
    match plan_partitions(&images, host_cores()) {
        None => process_serial(&images, params, status, None, &action),
        Some(partitions) => process_parallel(partitions, params, status, &action),
    }
}

/// Process `images` in order on the calling thread.
///
/// With an exit flag, processing stops after the current image once the flag
/// is raised.
pub fn process_serial<F>(
    images: &[String],
    params: &Params,
    status: Option<ProcessStatus>,
    exit: Option<&AtomicBool>,
    action: &F,
) -> Result<()>
where
    F: Fn(&str, &Params, Option<ProcessStatus>) -> Result<()>,
{
    for image in images {
        let image_params = params.object_params(image);
        action(image, &image_params, status)?;

        if exit.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            tracing::error!("received exit request, stop processing of images");
            break;
        }
    }
    Ok(())
}

/// Process partitions on scoped worker threads.
fn process_parallel<F>(
    partitions: Vec<Vec<String>>,
    params: &Params,
    status: Option<ProcessStatus>,
    action: &F,
) -> Result<()>
where
    F: Fn(&str, &Params, Option<ProcessStatus>) -> Result<()> + Sync,
{
    let exit = AtomicBool::new(false);
    tracing::debug!(workers = partitions.len(), "processing images in parallel");

    let results: Vec<Result<()>> = std::thread::scope(|scope| {
        let handles: Vec<_> = partitions
            .iter()
            .map(|images| {
                let exit = &exit;
                scope.spawn(move || {
                    let result = process_serial(images, params, status, Some(exit), action);
                    if result.is_err() {
                        exit.store(true, Ordering::SeqCst);
                    }
                    result
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(payload) => std::panic::resume_unwind(payload),
            })
            .collect()
    });

    if exit.load(Ordering::SeqCst) {
        tracing::error!("image processing failed");
    }
    results.into_iter().collect()
}
