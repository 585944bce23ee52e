//! Periodic screen captures.
//!
//! Every pass captures each live VM's screen into a scratch file, validates
//! it, and stores it as the next JPEG frame of
//! `<debugdir>/screendumps_<vm>_<pid>_iter<N>/`. Frames identical to one seen
//! before are hard-linked to the earlier rendering instead of being encoded
//! again; a screen that keeps producing known frames for longer than the
//! inactivity threshold is reported.

use super::{BackgroundTask, StopSignal};
use crate::codec::{fingerprint, ImageCodec};
use crate::config::Params;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::testrun::TestRun;
use crate::vm::Vm;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Thread name of the screendump poller.
pub const TASK_NAME: &str = "screendump";

/// What to do when a screen stays unchanged too long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InactivityWatcher {
    /// Log at debug level.
    Log,
    /// Queue a [`Error::ScreenInactive`] on the test run.
    Error,
    /// Do nothing.
    Ignore,
}

impl InactivityWatcher {
    fn from_param(value: &str) -> Self {
        match value {
            "log" => InactivityWatcher::Log,
            "error" => InactivityWatcher::Error,
            _ => InactivityWatcher::Ignore,
        }
    }
}

/// Screendump poller settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreendumpConfig {
    /// Delay between passes.
    pub delay: Duration,
    /// JPEG quality.
    pub quality: u8,
    /// Unchanged-screen time that counts as inactivity.
    pub inactivity_threshold: Duration,
    /// Inactivity policy.
    pub watcher: InactivityWatcher,
    /// Directory of the scratch capture file.
    pub scratch_dir: PathBuf,
}

impl ScreendumpConfig {
    /// Read `screendump_delay`, `screendump_quality`, `inactivity_treshold`,
    /// `inactivity_watcher` and `screendump_temp_dir`.
    pub fn from_params(params: &Params, test: &TestRun) -> Result<Self> {
        Ok(Self {
            delay: params.get_secs("screendump_delay", 5.0)?,
            quality: params.get_parsed("screendump_quality", 30)?,
            inactivity_threshold: params.get_secs("inactivity_treshold", 1800.0)?,
            watcher: InactivityWatcher::from_param(params.get_or("inactivity_watcher", "log")),
            scratch_dir: scratch_dir(params, test),
        })
    }
}

/// Directory scratch captures are written to.
///
/// `screendump_temp_dir` is resolved against the test bindir; without it the
/// debug directory is used.
pub fn scratch_dir(params: &Params, test: &TestRun) -> PathBuf {
    match params.get("screendump_temp_dir").filter(|d| !d.is_empty()) {
        Some(dir) => test.bindir().join(dir),
        None => test.debugdir().to_path_buf(),
    }
}

/// Removes the scratch capture when dropped.
struct ScratchGuard<'a>(&'a Path);

impl Drop for ScratchGuard<'_> {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(self.0);
    }
}

/// Screen capture state for one poller run.
pub struct ScreendumpPoller {
    config: ScreendumpConfig,
    test: Arc<TestRun>,
    env: Arc<Environment>,
    codec: Arc<dyn ImageCodec>,
    scratch: PathBuf,
    /// Rendered frame by fingerprint.
    cache: HashMap<String, PathBuf>,
    /// Last frame number by VM instance.
    counters: HashMap<String, u32>,
    /// Time of the last distinct frame by VM instance.
    last_change: HashMap<String, Instant>,
}

impl ScreendumpPoller {
    /// Create a poller; the scratch directory is created if needed.
    pub fn new(
        config: ScreendumpConfig,
        test: Arc<TestRun>,
        env: Arc<Environment>,
        codec: Arc<dyn ImageCodec>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.scratch_dir)?;
        // Only the unique name is kept; the placeholder is removed on drop.
        let scratch = tempfile::Builder::new()
            .prefix("scrdump-")
            .suffix(&format!("-iter{}.ppm", test.iteration()))
            .rand_bytes(6)
            .tempfile_in(&config.scratch_dir)?
            .path()
            .to_path_buf();
        Ok(Self {
            config,
            test,
            env,
            codec,
            scratch,
            cache: HashMap::new(),
            counters: HashMap::new(),
            last_change: HashMap::new(),
        })
    }

    /// Scratch capture path.
    pub fn scratch_path(&self) -> &Path {
        &self.scratch
    }

    /// Capture every VM once.
    pub fn capture_once(&mut self) {
        self.capture_pass(Instant::now());
    }

    fn capture_pass(&mut self, now: Instant) {
        for vm in self.env.get_all_vms() {
            self.capture_vm(vm.as_ref(), now);
        }
    }

    /// Capture one VM. Returns the frame written, if any.
    fn capture_vm(&mut self, vm: &dyn Vm, now: Instant) -> Option<PathBuf> {
        let instance = vm.instance();
        self.counters.entry(instance.clone()).or_insert(0);
        self.last_change.entry(instance.clone()).or_insert(now);

        if !vm.is_alive() {
            return None;
        }
        let pid = vm
            .pid()
            .map_or_else(|| "unknown".to_string(), |pid| pid.to_string());

        let scratch = self.scratch.clone();
        let _guard = ScratchGuard(&scratch);

        if let Err(e) = vm.screendump(&scratch) {
            tracing::warn!(vm = %vm.name(), error = %e, "screendump failed");
            return None;
        }
        if !scratch.exists() {
            tracing::warn!(vm = %vm.name(), "vm failed to produce a screendump");
            return None;
        }
        if !self.codec.verify_frame(&scratch) {
            tracing::warn!(vm = %vm.name(), "vm produced an invalid screendump");
            return None;
        }

        let dir = self.test.debugdir().join(format!(
            "screendumps_{}_{}_iter{}",
            vm.name(),
            pid,
            self.test.iteration()
        ));
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(vm = %vm.name(), dir = %dir.display(), error = %e, "cannot create screendump dir");
            return None;
        }

        let hash = match fingerprint(&scratch) {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!(vm = %vm.name(), error = %e, "cannot fingerprint screendump");
                return None;
            }
        };

        let counter = self.counters.entry(instance.clone()).or_insert(0);
        *counter += 1;
        let slot = dir.join(format!("{:04}.jpg", *counter));

        if let Some(cached) = self.cache.get(&hash).cloned() {
            self.check_inactivity(vm, &instance, now);
            if let Err(e) = std::fs::hard_link(&cached, &slot) {
                tracing::debug!(vm = %vm.name(), error = %e, "cannot link duplicate frame");
            }
            return Some(slot);
        }

        self.last_change.insert(instance.clone(), now);
        match self.codec.encode_jpeg(&scratch, &slot, self.config.quality) {
            Ok(()) => {
                self.cache.insert(hash, slot.clone());
                Some(slot)
            }
            Err(e) => {
                tracing::warn!(vm = %vm.name(), error = %e, "vm failed to produce a screendump");
                if let Some(counter) = self.counters.get_mut(&instance) {
                    *counter -= 1;
                }
                None
            }
        }
    }

    fn check_inactivity(&mut self, vm: &dyn Vm, instance: &str, now: Instant) {
        let since = self.last_change.get(instance).copied().unwrap_or(now);
        let inactive = now.saturating_duration_since(since);
        if inactive <= self.config.inactivity_threshold {
            return;
        }

        let err = Error::ScreenInactive {
            vm: vm.name().to_string(),
            seconds: inactive.as_secs(),
        };
        match self.config.watcher {
            InactivityWatcher::Error => {
                tracing::error!(vm = %vm.name(), "{}", err);
                self.test.push_background_error(err);
            }
            InactivityWatcher::Log => tracing::debug!(vm = %vm.name(), "{}", err),
            InactivityWatcher::Ignore => return,
        }
        self.last_change.insert(instance.to_string(), now);
    }

    /// Capture until `signal` asks to stop.
    pub fn run(mut self, signal: Arc<StopSignal>) {
        loop {
            self.capture_once();
            if signal.should_exit(self.config.delay) {
                break;
            }
        }
        tracing::debug!("screendump poller stopped");
    }
}

/// Start the screendump poller on a background thread.
pub fn spawn(
    params: &Params,
    test: Arc<TestRun>,
    env: Arc<Environment>,
    codec: Arc<dyn ImageCodec>,
) -> Result<BackgroundTask> {
    let config = ScreendumpConfig::from_params(params, &test)?;
    let poller = ScreendumpPoller::new(config, test, env, codec)?;
    Ok(BackgroundTask::spawn(TASK_NAME, move |signal| poller.run(signal))?)
}
