//! Environment registry.
//!
//! One [`Environment`] lives for a whole test run. It maps VM names to live
//! handles, keeps auxiliary storage devices that must outlive preprocessing,
//! and stores a few ambient values (selected CPU model, connection URI).

use crate::config::Params;
use crate::error::Result;
use crate::storage::StorageDevice;
use crate::vm::{Vm, VmFactory, VmType};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

/// Background packet capture on the host.
pub trait PacketCapture: Send + Sync {
    /// Start capturing if not already running.
    fn start(&self, params: &Params) -> Result<()>;

    /// Stop capturing.
    fn stop(&self);
}

/// Capture hook that does nothing.
#[derive(Debug, Default)]
pub struct NoCapture;

impl PacketCapture for NoCapture {
    fn start(&self, _params: &Params) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {}
}

/// Registry of live VM and device handles for one test run.
pub struct Environment {
    /// Factory for new VM handles.
    factory: Arc<dyn VmFactory>,
    /// VM handles in registration order.
    vms: RwLock<Vec<(String, Arc<dyn Vm>)>>,
    /// LVM devices by key.
    lvm_devices: Mutex<HashMap<String, Box<dyn StorageDevice>>>,
    /// Ambient values.
    values: RwLock<BTreeMap<String, String>>,
    /// Host packet capture.
    capture: Arc<dyn PacketCapture>,
}

impl Environment {
    /// Create an empty environment.
    pub fn new(factory: Arc<dyn VmFactory>) -> Self {
        Self::with_capture(factory, Arc::new(NoCapture))
    }

    /// Create an empty environment with a packet capture hook.
    pub fn with_capture(factory: Arc<dyn VmFactory>, capture: Arc<dyn PacketCapture>) -> Self {
        Self {
            factory,
            vms: RwLock::new(Vec::new()),
            lvm_devices: Mutex::new(HashMap::new()),
            values: RwLock::new(BTreeMap::new()),
            capture,
        }
    }

    /// Get a VM handle by name.
    pub fn get_vm(&self, name: &str) -> Option<Arc<dyn Vm>> {
        self.vms
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, vm)| Arc::clone(vm))
    }

    /// Create a VM handle through the factory and register it, replacing any
    /// handle of the same name.
    pub fn create_vm(
        &self,
        vm_type: &VmType,
        target: Option<&str>,
        name: &str,
        params: &Params,
        basedir: &Path,
    ) -> Result<Arc<dyn Vm>> {
        let vm = self
            .factory
            .create_vm(vm_type, target, name, params, basedir)?;
        self.register_vm(name, Arc::clone(&vm));
        tracing::debug!(vm = %name, vm_type = %vm_type, "registered new vm");
        Ok(vm)
    }

    /// Register a VM handle under `name`.
    pub fn register_vm(&self, name: &str, vm: Arc<dyn Vm>) {
        let mut vms = self.vms.write();
        if let Some(slot) = vms.iter_mut().find(|(n, _)| n == name) {
            slot.1 = vm;
        } else {
            vms.push((name.to_string(), vm));
        }
    }

    /// Remove a VM handle from the registry.
    pub fn unregister_vm(&self, name: &str) -> Option<Arc<dyn Vm>> {
        let mut vms = self.vms.write();
        let index = vms.iter().position(|(n, _)| n == name)?;
        Some(vms.remove(index).1)
    }

    /// All registered VM handles in registration order.
    pub fn get_all_vms(&self) -> Vec<Arc<dyn Vm>> {
        self.vms.read().iter().map(|(_, vm)| Arc::clone(vm)).collect()
    }

    /// Names of all registered VMs.
    pub fn vm_names(&self) -> Vec<String> {
        self.vms.read().iter().map(|(n, _)| n.clone()).collect()
    }

    /// Keep an LVM device until postprocessing.
    pub fn register_lvmdev(&self, key: &str, device: Box<dyn StorageDevice>) {
        self.lvm_devices.lock().insert(key.to_string(), device);
    }

    /// Run `f` against a registered LVM device.
    pub fn with_lvmdev<R>(&self, key: &str, f: impl FnOnce(&mut dyn StorageDevice) -> R) -> Option<R> {
        let mut devices = self.lvm_devices.lock();
        devices.get_mut(key).map(|dev| f(dev.as_mut()))
    }

    /// Drop a registered LVM device.
    pub fn unregister_lvmdev(&self, key: &str) -> Option<Box<dyn StorageDevice>> {
        self.lvm_devices.lock().remove(key)
    }

    /// Start host packet capture.
    pub fn start_tcpdump(&self, params: &Params) -> Result<()> {
        self.capture.start(params)
    }

    /// Stop host packet capture.
    pub fn stop_tcpdump(&self) {
        self.capture.stop();
    }

    /// Get an ambient value.
    pub fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    /// Set an ambient value.
    pub fn set(&self, key: &str, value: impl Into<String>) {
        self.values.write().insert(key.to_string(), value.into());
    }

    /// Keys of all ambient values.
    pub fn keys(&self) -> Vec<String> {
        self.values.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("vms", &self.vm_names())
            .field("values", &*self.values.read())
            .finish()
    }
}
