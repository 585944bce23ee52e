//! In-memory collaborators for unit tests.

use crate::codec::{ImageCodec, VideoEncoder};
use crate::config::Params;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::fixture::{Collaborators, Fixture};
use crate::host::{BridgeConfig, HostSetup, Tuning};
use crate::kernel::{GuestDiskEditor, GuestDiskOpener};
use crate::storage::{
    BackupAction, ImageBackend, ImageSpec, StorageDevice, StorageKind, StorageProvider,
};
use crate::testrun::TestRun;
use crate::vm::{
    normalize_connect_uri, CreateMode, CreateRequest, Monitor, SerialConsole, Session, Vm,
    VmFactory, VmStatus, VmType,
};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_PID: AtomicU32 = AtomicU32::new(4000);

// ---------------------------------------------------------------------------
// VMs
// ---------------------------------------------------------------------------

#[derive(Default)]
struct VmState {
    status: Option<VmStatus>,
    exists: bool,
    generation: u32,
    params: Params,
    connect_uri: Option<String>,
    needs_restart: bool,
    create_requests: Vec<CreateRequest>,
    destroy_calls: Vec<bool>,
    start_calls: usize,
    pause_calls: usize,
    serial_output: String,
    console: bool,
    sessions: Vec<Box<dyn Session>>,
    frame: Option<Vec<u8>>,
    registers: Option<String>,
    fail_login: bool,
    login_calls: Vec<&'static str>,
}

/// Scriptable VM handle.
pub struct FakeVm {
    name: String,
    pid: u32,
    state: Mutex<VmState>,
    monitor_closes: Arc<AtomicUsize>,
}

impl FakeVm {
    /// A running VM.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pid: NEXT_PID.fetch_add(1, Ordering::SeqCst),
            state: Mutex::new(VmState {
                status: Some(VmStatus::Running),
                exists: true,
                ..Default::default()
            }),
            monitor_closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_status(&self, status: VmStatus) {
        self.state.lock().status = Some(status);
    }

    pub fn set_needs_restart(&self, needs_restart: bool) {
        self.state.lock().needs_restart = needs_restart;
    }

    /// Attach a serial console that has printed `output`.
    pub fn set_serial_output(&self, output: &str) {
        let mut state = self.state.lock();
        state.serial_output = output.to_string();
        state.console = true;
    }

    /// Screen content returned by `screendump`; `None` makes it fail.
    pub fn set_frame(&self, frame: Option<Vec<u8>>) {
        self.state.lock().frame = frame;
    }

    /// Register dump returned by `query_registers`.
    pub fn set_registers(&self, registers: &str) {
        self.state.lock().registers = Some(registers.to_string());
    }

    pub fn set_fail_login(&self, fail: bool) {
        self.state.lock().fail_login = fail;
    }

    pub fn create_requests(&self) -> Vec<CreateRequest> {
        self.state.lock().create_requests.clone()
    }

    pub fn destroy_calls(&self) -> Vec<bool> {
        self.state.lock().destroy_calls.clone()
    }

    pub fn start_calls(&self) -> usize {
        self.state.lock().start_calls
    }

    pub fn pause_calls(&self) -> usize {
        self.state.lock().pause_calls
    }

    /// Login paths tried, `"network"` or `"serial"`.
    pub fn login_calls(&self) -> Vec<&'static str> {
        self.state.lock().login_calls.clone()
    }

    pub fn monitor_closes(&self) -> usize {
        self.monitor_closes.load(Ordering::SeqCst)
    }

    /// Parameters last recorded on the handle.
    pub fn params(&self) -> Params {
        self.state.lock().params.clone()
    }

    fn login(&self, path: &'static str) -> Result<Box<dyn Session>> {
        let mut state = self.state.lock();
        state.login_calls.push(path);
        if state.fail_login {
            return Err(Error::Login(format!("{}: no response on {} login", self.name, path)));
        }
        Ok(Box::new(FakeSession::default()))
    }
}

impl Vm for FakeVm {
    fn name(&self) -> &str {
        &self.name
    }

    fn instance(&self) -> String {
        format!("{}-{}-{}", self.name, self.pid, self.state.lock().generation)
    }

    fn status(&self) -> VmStatus {
        self.state.lock().status.unwrap_or(VmStatus::Dead)
    }

    fn exists(&self) -> bool {
        self.state.lock().exists
    }

    fn pid(&self) -> Option<u32> {
        self.is_alive().then_some(self.pid)
    }

    fn connect_uri(&self) -> Option<String> {
        self.state.lock().connect_uri.clone()
    }

    fn create(&self, request: &CreateRequest) -> Result<()> {
        let mut state = self.state.lock();
        if let CreateMode::Fresh { params, .. } = &request.mode {
            state.params = params.clone();
        }
        state.create_requests.push(request.clone());
        state.status = Some(VmStatus::Running);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.start_calls += 1;
        state.status = Some(VmStatus::Running);
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.pause_calls += 1;
        state.status = Some(VmStatus::Paused);
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        self.state.lock().status = Some(VmStatus::Running);
        Ok(())
    }

    fn destroy(&self, gracefully: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.destroy_calls.push(gracefully);
        state.status = Some(VmStatus::Dead);
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        Ok(())
    }

    fn needs_restart(&self, _name: &str, _params: &Params, _basedir: &Path) -> bool {
        self.state.lock().needs_restart
    }

    fn set_params(&self, params: &Params) {
        self.state.lock().params = params.clone();
    }

    fn update_vm_id(&self) {
        self.state.lock().generation += 1;
    }

    fn regenerate_virtnet(&self, _params: &Params) {}

    fn nic_count(&self) -> usize {
        self.state.lock().params.objects("nics").len()
    }

    fn login_timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn wait_for_login(&self, _timeout: Duration) -> Result<Box<dyn Session>> {
        self.login("network")
    }

    fn wait_for_serial_login(&self, _timeout: Duration) -> Result<Box<dyn Session>> {
        self.login("serial")
    }

    fn serial_console(&self) -> Option<Arc<dyn SerialConsole>> {
        let state = self.state.lock();
        state.console.then(|| {
            Arc::new(FakeSerial {
                output: state.serial_output.clone(),
            }) as Arc<dyn SerialConsole>
        })
    }

    fn create_serial_console(&self) -> Result<()> {
        self.state.lock().console = true;
        Ok(())
    }

    fn cleanup_serial_console(&self) {
        self.state.lock().console = false;
    }

    fn take_remote_sessions(&self) -> Vec<Box<dyn Session>> {
        std::mem::take(&mut self.state.lock().sessions)
    }

    fn keep_remote_session(&self, session: Box<dyn Session>) {
        self.state.lock().sessions.push(session);
    }

    fn monitors(&self) -> Vec<Arc<dyn Monitor>> {
        vec![Arc::new(FakeMonitor {
            closes: Arc::clone(&self.monitor_closes),
        })]
    }

    fn screendump(&self, path: &Path) -> Result<()> {
        match &self.state.lock().frame {
            Some(frame) => Ok(std::fs::write(path, frame)?),
            None => Err(Error::Monitor("screendump: device not ready".to_string())),
        }
    }

    fn query_registers(&self) -> Result<String> {
        self.state
            .lock()
            .registers
            .clone()
            .ok_or_else(|| Error::Monitor("info registers: no monitor".to_string()))
    }
}

/// Session whose `close` succeeds or fails.
#[derive(Default)]
pub struct FakeSession {
    fail: bool,
}

impl FakeSession {
    pub fn failing() -> Self {
        Self { fail: true }
    }
}

impl Session for FakeSession {
    fn close(&mut self) -> Result<()> {
        if self.fail {
            Err(Error::Login("session is stuck".to_string()))
        } else {
            Ok(())
        }
    }
}

struct FakeMonitor {
    closes: Arc<AtomicUsize>,
}

impl Monitor for FakeMonitor {
    fn name(&self) -> &str {
        "qmpmonitor1"
    }

    fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeSerial {
    output: String,
}

impl SerialConsole for FakeSerial {
    fn read_until_output_matches(&self, patterns: &[&str], timeout: Duration) -> Result<String> {
        if patterns.iter().any(|p| self.output.contains(p)) {
            Ok(self.output.clone())
        } else {
            Err(Error::Timeout(format!("no match for {:?} within {:?}", patterns, timeout)))
        }
    }
}

/// Factory handing out [`FakeVm`]s, created dead.
#[derive(Default)]
pub struct FakeVmFactory {
    vms: Mutex<Vec<Arc<FakeVm>>>,
    missing: AtomicBool,
}

impl FakeVmFactory {
    /// Most recent handle created for `name`.
    pub fn vm(&self, name: &str) -> Option<Arc<FakeVm>> {
        self.vms.lock().iter().rev().find(|vm| vm.name == name).cloned()
    }

    /// Create and register a QEMU handle for `name`.
    pub fn vm_for(&self, env: &Environment, name: &str) -> Arc<FakeVm> {
        env.create_vm(&VmType::Qemu, None, name, &Params::new(), Path::new("/tmp"))
            .unwrap();
        self.vm(name).unwrap()
    }

    /// Names of all handles created, in order.
    pub fn created(&self) -> Vec<String> {
        self.vms.lock().iter().map(|vm| vm.name.clone()).collect()
    }

    /// Whether later handles report an existing definition.
    pub fn set_exists(&self, exists: bool) {
        self.missing.store(!exists, Ordering::SeqCst);
    }
}

impl VmFactory for FakeVmFactory {
    fn create_vm(
        &self,
        vm_type: &VmType,
        _target: Option<&str>,
        name: &str,
        params: &Params,
        _basedir: &Path,
    ) -> Result<Arc<dyn Vm>> {
        let vm = Arc::new(FakeVm::new(name));
        {
            let mut state = vm.state.lock();
            state.status = Some(VmStatus::Dead);
            state.exists = !self.missing.load(Ordering::SeqCst);
            state.params = params.clone();
            if *vm_type == VmType::Libvirt {
                state.connect_uri = Some(normalize_connect_uri(params.get("connect_uri")));
            }
        }
        self.vms.lock().push(Arc::clone(&vm));
        Ok(vm)
    }
}

// ---------------------------------------------------------------------------
// Images and storage
// ---------------------------------------------------------------------------

/// Image backend recording every call; `create` writes an empty file.
#[derive(Default)]
pub struct FakeImageBackend {
    calls: Mutex<Vec<String>>,
    fail_prepare: AtomicBool,
    fail_create: AtomicBool,
    check_failure: Mutex<Option<String>>,
    info: Mutex<Option<String>>,
}

impl FakeImageBackend {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    pub fn fail_prepare(&self) {
        self.fail_prepare.store(true, Ordering::SeqCst);
    }

    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    /// Make `check` fail with `output`.
    pub fn fail_check(&self, output: &str) {
        *self.check_failure.lock() = Some(output.to_string());
    }

    pub fn set_info(&self, info: &str) {
        *self.info.lock() = Some(info.to_string());
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

impl ImageBackend for FakeImageBackend {
    fn prepare_backend(&self, image: &ImageSpec) -> Result<()> {
        self.record(format!("prepare {}", image.name));
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(Error::image(&image.name, "storage pool unavailable"));
        }
        Ok(())
    }

    fn file_remove(&self, image: &ImageSpec, path: &Path) -> Result<()> {
        self.record(format!("file_remove {}", image.name));
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn create(&self, image: &ImageSpec) -> Result<()> {
        self.record(format!("create {}", image.name));
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::image(&image.name, "no space left on device"));
        }
        let filename = image.filename();
        if let Some(parent) = filename.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(filename, b"")?;
        Ok(())
    }

    fn backup(&self, image: &ImageSpec, action: BackupAction, skip_existing: bool) -> Result<()> {
        let mut call = format!("{} {}", action.as_str(), image.name);
        if skip_existing {
            call.push_str(" skip_existing");
        }
        self.record(call);
        Ok(())
    }

    fn check(&self, image: &ImageSpec) -> Result<()> {
        self.record(format!("check {}", image.name));
        match self.check_failure.lock().clone() {
            Some(message) => Err(Error::ImageCheck {
                image: image.name.clone(),
                message,
            }),
            None => Ok(()),
        }
    }

    fn info(&self, image: &ImageSpec) -> Result<Option<String>> {
        self.record(format!("info {}", image.name));
        Ok(self.info.lock().clone())
    }

    fn remove(&self, image: &ImageSpec) -> Result<()> {
        self.record(format!("remove {}", image.name));
        let _ = std::fs::remove_file(image.filename());
        Ok(())
    }

    fn clone_image(&self, image: &ImageSpec, vm_name: &str) -> Result<()> {
        self.record(format!("clone {} {}", image.name, vm_name));
        Ok(())
    }
}

/// Storage device logging `setup`/`cleanup`.
pub struct FakeDevice {
    target: String,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl FakeDevice {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn log(&self) -> Arc<Mutex<Vec<&'static str>>> {
        Arc::clone(&self.log)
    }
}

impl StorageDevice for FakeDevice {
    fn setup(&mut self) -> Result<String> {
        self.log.lock().push("setup");
        Ok(self.target.clone())
    }

    fn cleanup(&mut self) -> Result<()> {
        self.log.lock().push("cleanup");
        Ok(())
    }
}

/// Provider whose devices share one log.
pub struct FakeStorageProvider {
    target: Mutex<String>,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl Default for FakeStorageProvider {
    fn default() -> Self {
        Self {
            target: Mutex::new("/dev/fake/target".to_string()),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl FakeStorageProvider {
    /// Device path or mount directory returned by `setup`.
    pub fn set_target(&self, target: &str) {
        *self.target.lock() = target.to_string();
    }

    pub fn log(&self) -> Arc<Mutex<Vec<&'static str>>> {
        Arc::clone(&self.log)
    }
}

impl StorageProvider for FakeStorageProvider {
    fn device(&self, _kind: StorageKind, _params: &Params, _base_dir: &Path) -> Result<Box<dyn StorageDevice>> {
        Ok(Box::new(FakeDevice {
            target: self.target.lock().clone(),
            log: Arc::clone(&self.log),
        }))
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// Host provider recording every call.
#[derive(Default)]
pub struct FakeHost {
    calls: Mutex<Vec<String>>,
    failing_setup: Mutex<Vec<Tuning>>,
    failing_cleanup: Mutex<Vec<Tuning>>,
    suggested_mem: Mutex<Option<u64>>,
    dmesg_fails: AtomicBool,
}

impl FakeHost {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn fail_setup(&self, tuning: Tuning) {
        self.failing_setup.lock().push(tuning);
    }

    pub fn fail_cleanup(&self, tuning: Tuning) {
        self.failing_cleanup.lock().push(tuning);
    }

    /// Guest memory suggested by huge page setup.
    pub fn set_suggested_mem(&self, mem: Option<u64>) {
        *self.suggested_mem.lock() = mem;
    }

    pub fn fail_dmesg(&self) {
        self.dmesg_fails.store(true, Ordering::SeqCst);
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

impl HostSetup for FakeHost {
    fn setup_bridge(&self, bridge: &BridgeConfig) -> Result<()> {
        self.record(format!("setup_bridge {}", bridge.name));
        Ok(())
    }

    fn cleanup_bridge(&self, bridge: &BridgeConfig) -> Result<()> {
        self.record(format!("cleanup_bridge {}", bridge.name));
        Ok(())
    }

    fn setup_tuning(&self, tuning: Tuning, _params: &Params) -> Result<Option<u64>> {
        self.record(format!("setup {}", tuning.label()));
        if self.failing_setup.lock().contains(&tuning) {
            return Err(Error::host(format!("{} setup failed", tuning.label())));
        }
        Ok(match tuning {
            Tuning::HugePages => *self.suggested_mem.lock(),
            _ => None,
        })
    }

    fn cleanup_tuning(&self, tuning: Tuning, _params: &Params) -> Result<()> {
        self.record(format!("cleanup {}", tuning.label()));
        if self.failing_cleanup.lock().contains(&tuning) {
            return Err(Error::host(format!("{} cleanup failed", tuning.label())));
        }
        Ok(())
    }

    fn restart_libvirtd(&self) -> Result<()> {
        self.record("restart_libvirtd".to_string());
        Ok(())
    }

    fn best_cpu_model(&self, _params: &Params) -> Result<String> {
        self.record("best_cpu_model".to_string());
        Ok("Skylake-Server".to_string())
    }

    fn verify_host_dmesg(&self) -> Result<()> {
        self.record("verify_host_dmesg".to_string());
        if self.dmesg_fails.load(Ordering::SeqCst) {
            return Err(Error::host("call trace found in host dmesg"));
        }
        Ok(())
    }

    fn kill_tail_threads(&self) {
        self.record("kill_tail_threads".to_string());
    }
}

// ---------------------------------------------------------------------------
// Guest disks
// ---------------------------------------------------------------------------

/// Guest image holding a single boot configuration file.
pub struct FakeDiskOpener {
    content: Arc<Mutex<String>>,
    opened: AtomicUsize,
    writes: Arc<AtomicUsize>,
}

impl FakeDiskOpener {
    pub fn new(content: &str) -> Self {
        Self {
            content: Arc::new(Mutex::new(content.to_string())),
            opened: AtomicUsize::new(0),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn content(&self) -> String {
        self.content.lock().clone()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

struct FakeDisk {
    content: Arc<Mutex<String>>,
    writes: Arc<AtomicUsize>,
}

impl GuestDiskEditor for FakeDisk {
    fn read_file(&mut self, _path: &str) -> Result<String> {
        Ok(self.content.lock().clone())
    }

    fn write_file(&mut self, _path: &str, content: &str) -> Result<()> {
        *self.content.lock() = content.to_string();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl GuestDiskOpener for FakeDiskOpener {
    fn open(&self, _image: &Path) -> Result<Box<dyn GuestDiskEditor>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeDisk {
            content: Arc::clone(&self.content),
            writes: Arc::clone(&self.writes),
        }))
    }
}

// ---------------------------------------------------------------------------
// Codecs
// ---------------------------------------------------------------------------

/// Codec that copies frames instead of re-encoding them.
#[derive(Default)]
pub struct FakeCodec {
    encodes: AtomicUsize,
    fail_encode: AtomicBool,
}

impl FakeCodec {
    pub fn encodes(&self) -> usize {
        self.encodes.load(Ordering::SeqCst)
    }

    pub fn set_fail_encode(&self, fail: bool) {
        self.fail_encode.store(fail, Ordering::SeqCst);
    }
}

impl ImageCodec for FakeCodec {
    fn encode_jpeg(&self, src: &Path, dst: &Path, _quality: u8) -> Result<()> {
        if self.fail_encode.load(Ordering::SeqCst) {
            return Err(Error::command_failed("jpeg", "encoder crashed"));
        }
        std::fs::copy(src, dst)?;
        self.encodes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn convert_png(&self, src: &Path, dst: &Path) -> Result<()> {
        std::fs::copy(src, dst)?;
        Ok(())
    }
}

/// Video encoder writing a placeholder file.
pub struct FakeVideo {
    webm: bool,
    encoded: AtomicUsize,
}

impl FakeVideo {
    pub fn new(webm: bool) -> Self {
        Self {
            webm,
            encoded: AtomicUsize::new(0),
        }
    }

    pub fn encoded(&self) -> usize {
        self.encoded.load(Ordering::SeqCst)
    }
}

impl VideoEncoder for FakeVideo {
    fn supports_webm(&self) -> bool {
        self.webm
    }

    fn encode(&self, _frames_dir: &Path, output: &Path) -> Result<()> {
        std::fs::write(output, b"video")?;
        self.encoded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

/// A [`Fixture`] wired to fakes in a scratch directory.
pub struct FixtureRig {
    dir: tempfile::TempDir,
    pub env: Arc<Environment>,
    pub factory: Arc<FakeVmFactory>,
    pub images: Arc<FakeImageBackend>,
    pub storage: Arc<FakeStorageProvider>,
    pub host: Arc<FakeHost>,
    pub disks: Arc<FakeDiskOpener>,
    pub fixture: Fixture,
}

impl FixtureRig {
    /// Rig whose guest boot configuration is `grub`.
    pub fn new(grub: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let test = Arc::new(TestRun::new(dir.path(), dir.path().join("debug"), 1));
        let factory = Arc::new(FakeVmFactory::default());
        let env = Arc::new(Environment::new(factory.clone()));
        let images = Arc::new(FakeImageBackend::default());
        let storage = Arc::new(FakeStorageProvider::default());
        let host = Arc::new(FakeHost::default());
        let disks = Arc::new(FakeDiskOpener::new(grub));

        let services = Collaborators {
            images: images.clone(),
            storage: storage.clone(),
            host: host.clone(),
            disks: disks.clone(),
            codec: Arc::new(FakeCodec::default()),
            video: Some(Arc::new(FakeVideo::new(true)) as Arc<dyn VideoEncoder>),
        };
        let fixture = Fixture::new(test, env.clone(), services);

        Self {
            dir,
            env,
            factory,
            images,
            storage,
            host,
            disks,
            fixture,
        }
    }

    /// Parameters rooted in the rig directory, with fixed version probes.
    pub fn params(&self, pairs: &[(&str, &str)]) -> Params {
        let base_dir = self.dir.path().to_string_lossy().into_owned();
        let mut params: Params = [
            ("images_base_dir", base_dir.as_str()),
            ("kvm_ver_cmd", "echo 6.8.5"),
            ("kvm_userspace_ver_cmd", "echo 8.2.0"),
        ]
        .into_iter()
        .collect();
        for (key, value) in pairs {
            params.set(*key, *value);
        }
        params
    }

    /// Path inside the rig directory.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}
