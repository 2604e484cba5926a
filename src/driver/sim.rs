//! In-memory simulated hypervisor.
//!
//! Mirrors the observable behaviour of a libvirt host closely enough to
//! exercise the orchestration core: domains have states, snapshots and
//! devices; pools own volumes. Faults, latency and blocking gates can be
//! injected per operation.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{DomainInfo, Driver, DriverError, DriverOp, DriverResult};
use crate::vm::{DiskDevice, NetworkInterface, VirtualMachine, VmId, VmMetrics, VmState};

/// A simulated domain.
#[derive(Debug)]
struct SimDomain {
    state: VmState,
    started_at: Option<Instant>,
    snapshots: Vec<SimSnapshot>,
    disks: Vec<String>,
    nics: Vec<String>,
}

/// Device lists captured by a simulated snapshot.
#[derive(Debug)]
struct SimSnapshot {
    name: String,
    disks: Vec<String>,
    nics: Vec<String>,
}

impl SimDomain {
    fn snapshot(&self, name: &str) -> Option<&SimSnapshot> {
        self.snapshots.iter().find(|s| s.name == name)
    }
}

#[derive(Default)]
struct SimInner {
    domains: HashMap<VmId, SimDomain>,
    pools: HashMap<String, String>,
    volumes: HashSet<(String, String)>,
    faults: HashMap<DriverOp, VecDeque<String>>,
    gates: HashMap<DriverOp, Arc<Gate>>,
    calls: Vec<DriverOp>,
}

/// Blocks a driver operation until released. Lets tests hold an operation
/// "in flight" deterministically.
pub struct Gate {
    state: Mutex<GateState>,
    cv: Condvar,
}

#[derive(Default)]
struct GateState {
    entered: bool,
    released: bool,
}

impl Gate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            cv: Condvar::new(),
        }
    }

    fn pass(&self) {
        let mut state = self.state.lock();
        state.entered = true;
        self.cv.notify_all();
        while !state.released {
            self.cv.wait(&mut state);
        }
    }

    /// Block until a caller has reached the gate.
    pub fn wait_entered(&self) {
        let mut state = self.state.lock();
        while !state.entered {
            self.cv.wait(&mut state);
        }
    }

    /// Let every blocked and future caller through.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.released = true;
        self.cv.notify_all();
    }
}

/// Simulated hypervisor driver.
pub struct SimDriver {
    inner: Mutex<SimInner>,
    latency: Mutex<Option<Duration>>,
    hot_attach: AtomicBool,
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDriver {
    /// Create an empty simulated host with hot-attach enabled.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SimInner::default()),
            latency: Mutex::new(None),
            hot_attach: AtomicBool::new(true),
        }
    }

    /// Make the next call of `op` fail with `message`. Faults queue up.
    pub fn fail_next(&self, op: DriverOp, message: impl Into<String>) {
        self.inner
            .lock()
            .faults
            .entry(op)
            .or_default()
            .push_back(message.into());
    }

    /// Add an artificial delay to every call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Enable or disable hot-attach of devices to running domains.
    pub fn set_hot_attach(&self, enabled: bool) {
        self.hot_attach.store(enabled, Ordering::SeqCst);
    }

    /// Block every call of `op` until the returned gate is released.
    pub fn block(&self, op: DriverOp) -> Arc<Gate> {
        let gate = Arc::new(Gate::new());
        self.inner.lock().gates.insert(op, gate.clone());
        gate
    }

    /// Simulate a guest crash.
    pub fn crash(&self, id: &VmId) {
        if let Some(domain) = self.inner.lock().domains.get_mut(id) {
            domain.state = VmState::Crashed;
            domain.started_at = None;
        }
    }

    /// Current state of a simulated domain, if defined.
    pub fn domain_state(&self, id: &VmId) -> Option<VmState> {
        self.inner.lock().domains.get(id).map(|d| d.state)
    }

    /// Snapshot names known for a simulated domain.
    pub fn snapshot_names(&self, id: &VmId) -> Vec<String> {
        self.inner
            .lock()
            .domains
            .get(id)
            .map(|d| d.snapshots.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of calls made for `op`.
    pub fn call_count(&self, op: DriverOp) -> usize {
        self.inner.lock().calls.iter().filter(|c| **c == op).count()
    }

    /// Check whether a volume exists on the simulated host.
    pub fn has_volume(&self, pool: &str, name: &str) -> bool {
        self.inner
            .lock()
            .volumes
            .contains(&(pool.to_string(), name.to_string()))
    }

    /// Common entry: record the call, apply injected faults, gates and latency.
    /// No lock is held while blocking.
    fn enter(&self, op: DriverOp) -> DriverResult<()> {
        let (fault, gate) = {
            let mut inner = self.inner.lock();
            inner.calls.push(op);
            let fault = inner.faults.get_mut(&op).and_then(|q| q.pop_front());
            (fault, inner.gates.get(&op).cloned())
        };

        if let Some(gate) = gate {
            gate.pass();
        }
        if let Some(latency) = *self.latency.lock() {
            std::thread::sleep(latency);
        }
        if let Some(message) = fault {
            tracing::debug!(op = %op, message = %message, "injected driver fault");
            return Err(DriverError::new(message));
        }
        Ok(())
    }

    fn with_domain<T>(
        &self,
        id: &VmId,
        f: impl FnOnce(&mut SimDomain) -> DriverResult<T>,
    ) -> DriverResult<T> {
        let mut inner = self.inner.lock();
        let domain = inner
            .domains
            .get_mut(id)
            .ok_or_else(|| DriverError::new(format!("Domain not found: no domain with matching uuid '{}'", id)))?;
        f(domain)
    }

    fn check_live(&self, live: bool) -> DriverResult<()> {
        if live && !self.hot_attach.load(Ordering::SeqCst) {
            return Err(DriverError::new(
                "Operation not supported: live device hot-plug is not supported by this domain",
            ));
        }
        Ok(())
    }
}

fn transition(
    domain: &mut SimDomain,
    from: &[VmState],
    to: VmState,
    what: &str,
) -> DriverResult<()> {
    if !from.contains(&domain.state) {
        return Err(DriverError::new(format!(
            "Requested operation is not valid: cannot {} domain in state {}",
            what, domain.state
        )));
    }
    if to.is_running() && !domain.state.is_running() && domain.state != VmState::Paused {
        domain.started_at = Some(Instant::now());
    }
    if !matches!(to, VmState::Running | VmState::Paused) {
        domain.started_at = None;
    }
    domain.state = to;
    Ok(())
}

impl Driver for SimDriver {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn define(&self, vm: &VirtualMachine) -> DriverResult<()> {
        self.enter(DriverOp::Define)?;
        let mut inner = self.inner.lock();
        if inner.domains.contains_key(&vm.id) {
            return Err(DriverError::new(format!(
                "operation failed: domain '{}' already exists with uuid {}",
                vm.name, vm.id
            )));
        }
        inner.domains.insert(
            vm.id,
            SimDomain {
                state: VmState::ShutOff,
                started_at: None,
                snapshots: Vec::new(),
                disks: vm.disks.iter().map(|d| d.target_dev.clone()).collect(),
                nics: vm.nics.iter().map(|n| n.mac.clone()).collect(),
            },
        );
        Ok(())
    }

    fn start(&self, id: &VmId) -> DriverResult<()> {
        self.enter(DriverOp::Start)?;
        self.with_domain(id, |d| {
            transition(d, &[VmState::ShutOff, VmState::Crashed], VmState::Running, "start")
        })
    }

    fn stop(&self, id: &VmId) -> DriverResult<()> {
        self.enter(DriverOp::Stop)?;
        self.with_domain(id, |d| transition(d, &[VmState::Running], VmState::ShutOff, "stop"))
    }

    fn reboot(&self, id: &VmId) -> DriverResult<()> {
        self.enter(DriverOp::Reboot)?;
        self.with_domain(id, |d| {
            transition(d, &[VmState::Running], VmState::Running, "reboot")?;
            d.started_at = Some(Instant::now());
            Ok(())
        })
    }

    fn pause(&self, id: &VmId) -> DriverResult<()> {
        self.enter(DriverOp::Pause)?;
        self.with_domain(id, |d| transition(d, &[VmState::Running], VmState::Paused, "pause"))
    }

    fn resume(&self, id: &VmId) -> DriverResult<()> {
        self.enter(DriverOp::Resume)?;
        self.with_domain(id, |d| transition(d, &[VmState::Paused], VmState::Running, "resume"))
    }

    fn delete(&self, id: &VmId) -> DriverResult<()> {
        self.enter(DriverOp::Delete)?;
        let mut inner = self.inner.lock();
        match inner.domains.get(id) {
            None => Err(DriverError::new(format!("Domain not found: {}", id))),
            Some(d) if !d.snapshots.is_empty() => Err(DriverError::new(format!(
                "Requested operation is not valid: cannot undefine domain with {} snapshots",
                d.snapshots.len()
            ))),
            Some(_) => {
                inner.domains.remove(id);
                Ok(())
            }
        }
    }

    fn domain_info(&self, id: &VmId) -> DriverResult<DomainInfo> {
        self.enter(DriverOp::DomainInfo)?;
        self.with_domain(id, |d| {
            let running = d.state.is_running();
            let ip_addresses = if running {
                d.nics
                    .iter()
                    .filter_map(|mac| mac.rsplit(':').next())
                    .filter_map(|octet| u8::from_str_radix(octet, 16).ok())
                    .map(|octet| format!("192.168.122.{}", octet.max(2)))
                    .collect()
            } else {
                Vec::new()
            };
            Ok(DomainInfo {
                state: d.state,
                metrics: VmMetrics {
                    cpu_percent: 0.0,
                    uptime_sec: d.started_at.map(|t| t.elapsed().as_secs()).unwrap_or(0),
                    ip_addresses,
                },
            })
        })
    }

    fn snapshot_create(&self, id: &VmId, name: &str, _description: &str) -> DriverResult<()> {
        self.enter(DriverOp::SnapshotCreate)?;
        self.with_domain(id, |d| {
            if d.snapshot(name).is_some() {
                return Err(DriverError::new(format!(
                    "operation failed: domain snapshot '{}' already exists",
                    name
                )));
            }
            let snapshot = SimSnapshot {
                name: name.to_string(),
                disks: d.disks.clone(),
                nics: d.nics.clone(),
            };
            d.snapshots.push(snapshot);
            Ok(())
        })
    }

    fn snapshot_revert(&self, id: &VmId, name: &str) -> DriverResult<()> {
        self.enter(DriverOp::SnapshotRevert)?;
        self.with_domain(id, |d| {
            let (disks, nics) = match d.snapshot(name) {
                Some(s) => (s.disks.clone(), s.nics.clone()),
                None => {
                    return Err(DriverError::new(format!(
                        "Domain snapshot not found: no domain snapshot with matching name '{}'",
                        name
                    )))
                }
            };
            d.disks = disks;
            d.nics = nics;
            Ok(())
        })
    }

    fn snapshot_delete(&self, id: &VmId, name: &str) -> DriverResult<()> {
        self.enter(DriverOp::SnapshotDelete)?;
        self.with_domain(id, |d| {
            let before = d.snapshots.len();
            d.snapshots.retain(|s| s.name != name);
            if d.snapshots.len() == before {
                return Err(DriverError::new(format!(
                    "Domain snapshot not found: no domain snapshot with matching name '{}'",
                    name
                )));
            }
            Ok(())
        })
    }

    fn attach_disk(&self, id: &VmId, disk: &DiskDevice, live: bool) -> DriverResult<()> {
        self.enter(DriverOp::AttachDisk)?;
        self.check_live(live)?;
        self.with_domain(id, |d| {
            if d.disks.contains(&disk.target_dev) {
                return Err(DriverError::new(format!(
                    "operation failed: target {} already exists",
                    disk.target_dev
                )));
            }
            d.disks.push(disk.target_dev.clone());
            Ok(())
        })
    }

    fn detach_disk(&self, id: &VmId, disk: &DiskDevice, live: bool) -> DriverResult<()> {
        self.enter(DriverOp::DetachDisk)?;
        self.check_live(live)?;
        self.with_domain(id, |d| {
            d.disks.retain(|t| t != &disk.target_dev);
            Ok(())
        })
    }

    fn attach_network(&self, id: &VmId, nic: &NetworkInterface, live: bool) -> DriverResult<()> {
        self.enter(DriverOp::AttachNetwork)?;
        self.check_live(live)?;
        self.with_domain(id, |d| {
            d.nics.push(nic.mac.clone());
            Ok(())
        })
    }

    fn detach_network(&self, id: &VmId, nic: &NetworkInterface, live: bool) -> DriverResult<()> {
        self.enter(DriverOp::DetachNetwork)?;
        self.check_live(live)?;
        self.with_domain(id, |d| {
            d.nics.retain(|m| !m.eq_ignore_ascii_case(&nic.mac));
            Ok(())
        })
    }

    fn pool_create(&self, name: &str, path: &str) -> DriverResult<()> {
        self.enter(DriverOp::PoolCreate)?;
        let mut inner = self.inner.lock();
        if inner.pools.contains_key(name) {
            return Err(DriverError::new(format!(
                "operation failed: pool '{}' already exists",
                name
            )));
        }
        inner.pools.insert(name.to_string(), path.to_string());
        Ok(())
    }

    fn pool_delete(&self, name: &str) -> DriverResult<()> {
        self.enter(DriverOp::PoolDelete)?;
        let mut inner = self.inner.lock();
        if inner.volumes.iter().any(|(p, _)| p == name) {
            return Err(DriverError::new(format!(
                "Requested operation is not valid: storage pool '{}' is not empty",
                name
            )));
        }
        inner
            .pools
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| DriverError::new(format!("Storage pool not found: {}", name)))
    }

    fn volume_create(&self, pool: &str, name: &str, _capacity_b: u64) -> DriverResult<String> {
        self.enter(DriverOp::VolumeCreate)?;
        let mut inner = self.inner.lock();
        let pool_path = inner
            .pools
            .get(pool)
            .cloned()
            .ok_or_else(|| DriverError::new(format!("Storage pool not found: {}", pool)))?;
        if !inner.volumes.insert((pool.to_string(), name.to_string())) {
            return Err(DriverError::new(format!(
                "storage volume name '{}' already in use",
                name
            )));
        }
        Ok(format!("{}/{}", pool_path.trim_end_matches('/'), name))
    }

    fn volume_delete(&self, pool: &str, name: &str) -> DriverResult<()> {
        self.enter(DriverOp::VolumeDelete)?;
        let mut inner = self.inner.lock();
        if inner.volumes.remove(&(pool.to_string(), name.to_string())) {
            Ok(())
        } else {
            Err(DriverError::new(format!(
                "Storage volume not found: no storage vol with matching name '{}'",
                name
            )))
        }
    }
}
