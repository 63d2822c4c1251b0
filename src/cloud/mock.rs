//! In-memory cloud provider for tests.
//!
//! Keeps the whole fleet's resources in one mutex, records an ordered op
//! log, and can inject failures per operation name. An optional per-call
//! delay widens race windows for the serialization tests.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{Address, CloudError, CloudProvider, Instance, InstanceSpec, Volume};

#[derive(Debug, Default)]
struct MockInstance {
    running: bool,
    attached: BTreeSet<String>,
    tags: Vec<String>,
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct MockState {
    addresses: BTreeMap<String, String>,
    dns: BTreeMap<String, (u32, String)>,
    volumes: BTreeMap<String, Volume>,
    instances: BTreeMap<String, MockInstance>,
    ops: Vec<String>,
    fail_ops: HashSet<String>,
    next_ip: u8,
}

#[derive(Default)]
pub struct MockCloud {
    state: Mutex<MockState>,
    delay: Mutex<Option<Duration>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call matching `op` fail with a generic API error
    pub fn fail_op(&self, op: &str) {
        self.state.lock().unwrap().fail_ops.insert(op.to_string());
    }

    /// Sleep this long inside every call (for concurrency tests)
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Ordered log of all operations, `"op name"` per entry
    pub fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn op_count(&self, op: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter(|entry| entry.starts_with(op))
            .count()
    }

    /// Largest number of calls ever in flight at once
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn has_address(&self, name: &str) -> bool {
        self.state.lock().unwrap().addresses.contains_key(name)
    }

    pub fn has_dns_record(&self, name: &str) -> bool {
        self.state.lock().unwrap().dns.contains_key(name)
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.state.lock().unwrap().volumes.contains_key(name)
    }

    pub fn has_instance(&self, name: &str) -> bool {
        self.state.lock().unwrap().instances.contains_key(name)
    }

    pub fn instance_running(&self, name: &str) -> Option<bool> {
        self.state
            .lock()
            .unwrap()
            .instances
            .get(name)
            .map(|i| i.running)
    }

    fn track(&self, op: &str, name: &str) -> Result<(), CloudError> {
        let count = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(count, Ordering::SeqCst);
        if let Some(delay) = *self.delay.lock().unwrap() {
            std::thread::sleep(delay);
        }
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("{op} {name}"));
        if state.fail_ops.contains(op) {
            return Err(CloudError::Api {
                status: 500,
                message: format!("injected failure for {op}"),
            });
        }
        Ok(())
    }

    fn done(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn run<T>(
        &self,
        op: &str,
        name: &str,
        f: impl FnOnce(&mut MockState) -> Result<T, CloudError>,
    ) -> Result<T, CloudError> {
        let tracked = self.track(op, name);
        let result = tracked.and_then(|()| f(&mut self.state.lock().unwrap()));
        self.done();
        result
    }
}

impl CloudProvider for MockCloud {
    fn get_address(&self, _region: &str, name: &str) -> Result<Address, CloudError> {
        self.run("get_address", name, |state| {
            let ip = state.addresses.get(name).ok_or(CloudError::NotFound)?;
            Ok(Address {
                name: name.to_string(),
                address: ip.clone(),
            })
        })
    }

    fn create_address(&self, _region: &str, name: &str) -> Result<Address, CloudError> {
        self.run("create_address", name, |state| {
            if state.addresses.contains_key(name) {
                return Err(CloudError::AlreadyExists);
            }
            state.next_ip += 1;
            let ip = format!("10.0.0.{}", state.next_ip);
            state.addresses.insert(name.to_string(), ip.clone());
            Ok(Address {
                name: name.to_string(),
                address: ip,
            })
        })
    }

    fn delete_address(&self, _region: &str, name: &str) -> Result<(), CloudError> {
        self.run("delete_address", name, |state| {
            state
                .addresses
                .remove(name)
                .map(|_| ())
                .ok_or(CloudError::NotFound)
        })
    }

    fn create_dns_record(
        &self,
        _zone: &str,
        name: &str,
        ttl: u32,
        ip: &str,
    ) -> Result<(), CloudError> {
        self.run("create_dns_record", name, |state| {
            if state.dns.contains_key(name) {
                return Err(CloudError::AlreadyExists);
            }
            state.dns.insert(name.to_string(), (ttl, ip.to_string()));
            Ok(())
        })
    }

    fn delete_dns_record(&self, _zone: &str, name: &str) -> Result<(), CloudError> {
        self.run("delete_dns_record", name, |state| {
            state.dns.remove(name).map(|_| ()).ok_or(CloudError::NotFound)
        })
    }

    fn get_volume(&self, _zone: &str, name: &str) -> Result<Volume, CloudError> {
        self.run("get_volume", name, |state| {
            state.volumes.get(name).cloned().ok_or(CloudError::NotFound)
        })
    }

    fn create_volume(
        &self,
        _zone: &str,
        name: &str,
        size_gb: u64,
        ssd: bool,
    ) -> Result<Volume, CloudError> {
        self.run("create_volume", name, |state| {
            if state.volumes.contains_key(name) {
                return Err(CloudError::AlreadyExists);
            }
            let volume = Volume {
                name: name.to_string(),
                size_gb,
                ssd,
            };
            state.volumes.insert(name.to_string(), volume.clone());
            Ok(volume)
        })
    }

    fn delete_volume(&self, _zone: &str, name: &str) -> Result<(), CloudError> {
        self.run("delete_volume", name, |state| {
            state
                .volumes
                .remove(name)
                .map(|_| ())
                .ok_or(CloudError::NotFound)
        })
    }

    fn get_instance(&self, _zone: &str, name: &str) -> Result<Instance, CloudError> {
        self.run("get_instance", name, |state| {
            let instance = state.instances.get(name).ok_or(CloudError::NotFound)?;
            Ok(Instance {
                name: name.to_string(),
                running: instance.running,
            })
        })
    }

    fn create_instance(&self, _zone: &str, spec: &InstanceSpec) -> Result<Instance, CloudError> {
        self.run("create_instance", &spec.name, |state| {
            if state.instances.contains_key(&spec.name) {
                return Err(CloudError::AlreadyExists);
            }
            state
                .instances
                .insert(spec.name.clone(), MockInstance::default());
            Ok(Instance {
                name: spec.name.clone(),
                running: false,
            })
        })
    }

    fn delete_instance(&self, _zone: &str, name: &str) -> Result<(), CloudError> {
        self.run("delete_instance", name, |state| {
            state
                .instances
                .remove(name)
                .map(|_| ())
                .ok_or(CloudError::NotFound)
        })
    }

    fn attach_volume(&self, _zone: &str, instance: &str, volume: &str) -> Result<(), CloudError> {
        self.run("attach_volume", instance, |state| {
            if !state.volumes.contains_key(volume) {
                return Err(CloudError::NotFound);
            }
            let entry = state.instances.get_mut(instance).ok_or(CloudError::NotFound)?;
            if !entry.attached.insert(volume.to_string()) {
                return Err(CloudError::InUse);
            }
            Ok(())
        })
    }

    fn set_tags(&self, _zone: &str, instance: &str, tags: &[String]) -> Result<(), CloudError> {
        self.run("set_tags", instance, |state| {
            let entry = state.instances.get_mut(instance).ok_or(CloudError::NotFound)?;
            entry.tags = tags.to_vec();
            Ok(())
        })
    }

    fn set_metadata(
        &self,
        _zone: &str,
        instance: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), CloudError> {
        self.run("set_metadata", instance, |state| {
            let entry = state.instances.get_mut(instance).ok_or(CloudError::NotFound)?;
            entry.metadata = metadata.clone();
            Ok(())
        })
    }

    fn start_instance(&self, _zone: &str, name: &str) -> Result<(), CloudError> {
        self.run("start_instance", name, |state| {
            let entry = state.instances.get_mut(name).ok_or(CloudError::NotFound)?;
            entry.running = true;
            Ok(())
        })
    }

    fn stop_instance(&self, _zone: &str, name: &str) -> Result<(), CloudError> {
        self.run("stop_instance", name, |state| {
            let entry = state.instances.get_mut(name).ok_or(CloudError::NotFound)?;
            entry.running = false;
            Ok(())
        })
    }
}
