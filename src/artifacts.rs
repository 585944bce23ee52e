//! Post-test handling of screen capture artifacts.

use crate::codec::{ImageCodec, VideoEncoder};
use crate::config::Params;
use crate::poller::screendump::scratch_dir;
use crate::testrun::TestRun;
use regex::Regex;
use std::path::{Path, PathBuf};

/// Prefix of per-VM frame directories.
pub const SCREENDUMP_DIR_PREFIX: &str = "screendumps_";

const VIDEO_EXTENSIONS: &[&str] = &["ogg", "webm"];

/// Sorted entries of `dir`; unreadable directories yield nothing.
fn list_dir(dir: &Path) -> Vec<PathBuf> {
    let mut entries: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(|e| e.ok().map(|e| e.path())).collect(),
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "cannot list directory");
            Vec::new()
        }
    };
    entries.sort();
    entries
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn remove_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "cannot remove file");
    }
}

/// Whether `name` is a scratch capture of iteration `iteration`
/// (`*_iter<N>.ppm` or `*-iter<N>.ppm`).
fn is_scratch_frame(name: &str, iteration: u32) -> bool {
    name.strip_suffix(&format!("iter{}.ppm", iteration))
        .is_some_and(|stem| stem.ends_with('_') || stem.ends_with('-'))
}

/// First frame directory of this iteration.
pub fn find_screendump_dir(test: &TestRun) -> Option<PathBuf> {
    let pattern = Regex::new(&format!(r"^screendump\S*_[0-9]+_iter{}$", test.iteration())).ok()?;
    list_dir(test.debugdir())
        .into_iter()
        .find(|path| path.is_dir() && pattern.is_match(&file_name(path)))
}

/// Encode this iteration's frames into `<frame dir>.webm` (or `.ogg`).
///
/// Returns the video written. Failures are logged.
pub fn encode_video(test: &TestRun, encoder: &dyn VideoEncoder) -> Option<PathBuf> {
    let dir = find_screendump_dir(test)?;
    if list_dir(&dir).is_empty() {
        return None;
    }

    let extension = if encoder.supports_webm() { "webm" } else { "ogg" };
    let video = test
        .debugdir()
        .join(format!("{}.{}", file_name(&dir), extension));

    tracing::debug!(video = %video.display(), "encoding video file");
    match encoder.encode(&dir, &video) {
        Ok(()) => Some(video),
        Err(e) => {
            tracing::info!(dir = %dir.display(), error = %e, "video creation failed");
            None
        }
    }
}

/// Handle capture artifacts according to the retention parameters.
///
/// - `encode_video_files` (default yes): encode a video from the frames
/// - leftover `*_iter<N>.ppm` scratch files: corrupt ones are reported,
///   `convert_ppm_files_to_png=yes` converts valid ones, and they are removed
///   unless `keep_ppm_files=yes`
/// - frame directories are removed unless `keep_screendumps=yes`
/// - videos are removed when `keep_video_files=no`
pub fn harvest_screendumps(
    params: &Params,
    test: &TestRun,
    codec: &dyn ImageCodec,
    video: Option<&dyn VideoEncoder>,
) {
    if params.is_yes_or("encode_video_files", true) {
        if let Some(encoder) = video {
            encode_video(test, encoder);
        }
    }

    let leftovers: Vec<PathBuf> = list_dir(&scratch_dir(params, test))
        .into_iter()
        .filter(|path| path.is_file() && is_scratch_frame(&file_name(path), test.iteration()))
        .collect();

    for ppm in &leftovers {
        if !codec.verify_frame(ppm) {
            tracing::warn!(path = %ppm.display(), "found corrupt PPM file");
        }
    }

    if params.is_yes("convert_ppm_files_to_png") {
        for ppm in leftovers.iter().filter(|ppm| codec.verify_frame(ppm)) {
            let png = ppm.with_extension("png");
            if let Err(e) = codec.convert_png(ppm, &png) {
                tracing::warn!(path = %ppm.display(), error = %e, "PNG conversion failed");
            }
        }
    }

    if !params.is_yes("keep_ppm_files") {
        leftovers.iter().for_each(|ppm| remove_file(ppm));
    }

    if !params.is_yes("keep_screendumps") {
        for dir in list_dir(test.debugdir()) {
            let is_real_dir = dir
                .symlink_metadata()
                .map(|m| m.is_dir())
                .unwrap_or(false);
            if is_real_dir && file_name(&dir).starts_with(SCREENDUMP_DIR_PREFIX) {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    tracing::warn!(dir = %dir.display(), error = %e, "cannot remove screendump dir");
                }
            }
        }
    }

    if !params.is_yes_or("keep_video_files", true) {
        for video in list_dir(test.debugdir()) {
            let is_video = video
                .extension()
                .is_some_and(|ext| VIDEO_EXTENSIONS.iter().any(|v| ext == *v));
            if is_video && video.is_file() {
                remove_file(&video);
            }
        }
    }
}
