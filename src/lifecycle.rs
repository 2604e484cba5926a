//! VM lifecycle controller.
//!
//! Every mutating operation follows the same shape: claim the VM's
//! in-flight marker, check the precondition against the recorded state,
//! call the driver with no record lock held, then compare-and-swap the new
//! state into the registry. A driver failure leaves the last-known-good
//! state in place.

use std::sync::Arc;

use crate::driver::{Driver, DriverOp};
use crate::error::{Error, Result};
use crate::registry::{Operation, Registry, VmSlot};
use crate::vm::{LifecycleAction, VirtualMachine, VmSpec};

/// Enforces the VM state machine and serializes operations per VM.
pub struct LifecycleController {
    registry: Arc<Registry>,
    driver: Arc<dyn Driver>,
}

impl LifecycleController {
    /// Create a controller over a registry and driver.
    pub fn new(registry: Arc<Registry>, driver: Arc<dyn Driver>) -> Self {
        Self { registry, driver }
    }

    /// Define a new VM. It starts out shut off with no devices.
    pub fn create(&self, spec: &VmSpec) -> Result<VirtualMachine> {
        spec.validate()?;
        let reservation = self.registry.reserve_vm_name(&spec.name)?;

        let vm = VirtualMachine::from_spec(spec);
        self.driver
            .define(&vm)
            .map_err(|e| DriverOp::Define.fail(e))?;

        self.registry.insert_vm(reservation, vm.clone());
        tracing::info!(vm = %vm.id, name = %vm.name, "vm created");
        Ok(vm)
    }

    /// Start a shut-off or crashed VM.
    pub fn start(&self, id: &str) -> Result<VirtualMachine> {
        self.apply(id, LifecycleAction::Start)
    }

    /// Gracefully stop a running VM.
    pub fn stop(&self, id: &str) -> Result<VirtualMachine> {
        self.apply(id, LifecycleAction::Stop)
    }

    /// Reboot a running VM.
    pub fn reboot(&self, id: &str) -> Result<VirtualMachine> {
        self.apply(id, LifecycleAction::Reboot)
    }

    /// Suspend a running VM.
    pub fn pause(&self, id: &str) -> Result<VirtualMachine> {
        self.apply(id, LifecycleAction::Pause)
    }

    /// Resume a paused VM.
    pub fn resume(&self, id: &str) -> Result<VirtualMachine> {
        self.apply(id, LifecycleAction::Resume)
    }

    /// Run a lifecycle action against a VM.
    pub fn apply(&self, id: &str, action: LifecycleAction) -> Result<VirtualMachine> {
        let slot = self.registry.vm(id)?;
        let claim = slot.begin(Operation::from(action))?;

        let from = slot.state();
        if !action.allowed_from(from) {
            return Err(Error::InvalidState {
                expected: action.expected_states().to_string(),
                actual: from.to_string(),
            });
        }

        let vm_id = slot.id();
        let (op, result) = match action {
            LifecycleAction::Start => (DriverOp::Start, self.driver.start(&vm_id)),
            LifecycleAction::Stop => (DriverOp::Stop, self.driver.stop(&vm_id)),
            LifecycleAction::Reboot => (DriverOp::Reboot, self.driver.reboot(&vm_id)),
            LifecycleAction::Pause => (DriverOp::Pause, self.driver.pause(&vm_id)),
            LifecycleAction::Resume => (DriverOp::Resume, self.driver.resume(&vm_id)),
        };
        if let Err(e) = result {
            tracing::warn!(vm = %vm_id, action = %action, error = %e, "lifecycle action failed");
            return Err(op.fail(e));
        }

        let vm = self
            .registry
            .transition_vm(&slot, &claim, from, action.target_state())?;
        tracing::info!(vm = %vm_id, action = %action, state = %vm.state, "lifecycle action completed");
        Ok(vm)
    }

    /// Delete a VM, its snapshots and its domain definition. Backing volumes
    /// are kept.
    ///
    /// Snapshots are deleted one at a time; a driver failure stops the
    /// cascade and leaves the VM with the snapshots not yet deleted.
    pub fn delete(&self, id: &str) -> Result<VirtualMachine> {
        let slot = self.registry.vm(id)?;
        let claim = slot.begin(Operation::Delete)?;
        let vm_id = slot.id();

        let snapshots: Vec<String> = slot.read(|r| r.snapshots.iter().map(|s| s.name.clone()).collect());
        for name in &snapshots {
            self.driver
                .snapshot_delete(&vm_id, name)
                .map_err(|e| DriverOp::SnapshotDelete.fail(e))?;
            self.registry.update_vm(&slot, &claim, |record| {
                record.snapshots.retain(|s| &s.name != name);
                Ok(())
            })?;
            tracing::debug!(vm = %vm_id, snapshot = %name, "snapshot deleted during vm delete");
        }

        self.driver
            .delete(&vm_id)
            .map_err(|e| DriverOp::Delete.fail(e))?;

        let vm = slot.vm();
        self.registry.remove_vm(&slot, &claim);
        tracing::info!(vm = %vm_id, name = %vm.name, snapshots = snapshots.len(), "vm deleted");
        Ok(vm)
    }

    /// Refresh a VM's state and metrics from the driver.
    ///
    /// VMs with an operation in flight are skipped; returns `Ok(None)` when
    /// nothing was recorded.
    pub fn reconcile(&self, id: &str) -> Result<Option<VirtualMachine>> {
        let slot = self.registry.vm(id)?;
        self.reconcile_slot(&slot)
    }

    /// Reconcile every VM. Returns the number of VMs refreshed.
    pub fn reconcile_all(&self) -> usize {
        let mut refreshed = 0;
        for slot in self.registry.vm_slots() {
            match self.reconcile_slot(&slot) {
                Ok(Some(_)) => refreshed += 1,
                Ok(None) => {}
                Err(e) => tracing::warn!(vm = %slot.id(), error = %e, "reconcile failed"),
            }
        }
        refreshed
    }

    fn reconcile_slot(&self, slot: &VmSlot) -> Result<Option<VirtualMachine>> {
        if slot.in_flight().is_some() {
            return Ok(None);
        }
        let generation = slot.generation();
        let observed = slot.state();
        let info = self
            .driver
            .domain_info(&slot.id())
            .map_err(|e| DriverOp::DomainInfo.fail(e))?;

        let updated = self.registry.observe_vm(slot, generation, |record| {
            record.vm.state = info.state;
            record.vm.metrics = info.metrics;
        })?;
        if let Some(vm) = &updated {
            if vm.state != observed {
                tracing::info!(
                    vm = %vm.id,
                    from = %observed,
                    to = %vm.state,
                    "vm state changed outside vmdeck"
                );
            }
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SimDriver;
    use crate::error::ErrorKind;
    use crate::vm::VmState;

    fn controller() -> (LifecycleController, Arc<Registry>, Arc<SimDriver>) {
        let registry = Arc::new(Registry::in_memory());
        let driver = Arc::new(SimDriver::new());
        let lifecycle = LifecycleController::new(registry.clone(), driver.clone());
        (lifecycle, registry, driver)
    }

    #[test]
    fn test_create_registers_shut_off_vm() {
        let (lifecycle, registry, driver) = controller();
        let vm = lifecycle.create(&VmSpec::builder("vm-1").vcpus(2).build()).unwrap();
        assert_eq!(vm.state, VmState::ShutOff);
        assert_eq!(driver.domain_state(&vm.id), Some(VmState::ShutOff));
        assert_eq!(registry.list_vms().len(), 1);

        let err = lifecycle.create(&VmSpec::builder("vm-1").build()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_create_rejects_invalid_spec() {
        let (lifecycle, _registry, driver) = controller();
        let err = lifecycle.create(&VmSpec::builder("vm-1").vcpus(0).build()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(driver.call_count(DriverOp::Define), 0);
    }

    #[test]
    fn test_failed_define_frees_the_name() {
        let (lifecycle, registry, driver) = controller();
        driver.fail_next(DriverOp::Define, "internal error: cannot create domain");
        let err = lifecycle.create(&VmSpec::builder("vm-1").build()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Driver);
        assert!(registry.list_vms().is_empty());
        assert!(lifecycle.create(&VmSpec::builder("vm-1").build()).is_ok());
    }

    #[test]
    fn test_start_stop_cycle() {
        let (lifecycle, _registry, _driver) = controller();
        lifecycle.create(&VmSpec::builder("vm-1").build()).unwrap();

        assert_eq!(lifecycle.start("vm-1").unwrap().state, VmState::Running);
        assert_eq!(lifecycle.pause("vm-1").unwrap().state, VmState::Paused);
        assert_eq!(lifecycle.resume("vm-1").unwrap().state, VmState::Running);
        assert_eq!(lifecycle.reboot("vm-1").unwrap().state, VmState::Running);
        assert_eq!(lifecycle.stop("vm-1").unwrap().state, VmState::ShutOff);
    }

    #[test]
    fn test_illegal_transition_is_precondition() {
        let (lifecycle, _registry, driver) = controller();
        lifecycle.create(&VmSpec::builder("vm-1").build()).unwrap();

        let err = lifecycle.stop("vm-1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert_eq!(driver.call_count(DriverOp::Stop), 0);

        let err = lifecycle.resume("vm-1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn test_driver_failure_keeps_last_known_state() {
        let (lifecycle, registry, driver) = controller();
        lifecycle.create(&VmSpec::builder("vm-1").build()).unwrap();

        driver.fail_next(DriverOp::Start, "internal error: qemu unexpectedly closed the monitor");
        let err = lifecycle.start("vm-1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Driver);
        assert!(err.to_string().contains("qemu unexpectedly closed the monitor"));
        assert_eq!(registry.vm("vm-1").unwrap().state(), VmState::ShutOff);

        lifecycle.start("vm-1").unwrap();
        driver.fail_next(DriverOp::Stop, "operation timed out");
        assert!(lifecycle.stop("vm-1").is_err());
        assert_eq!(registry.vm("vm-1").unwrap().state(), VmState::Running);
    }

    #[test]
    fn test_concurrent_action_conflicts_and_reads_do_not_block() {
        let (lifecycle, registry, driver) = controller();
        lifecycle.create(&VmSpec::builder("vm-1").build()).unwrap();
        let lifecycle = Arc::new(lifecycle);

        let gate = driver.block(DriverOp::Start);
        let worker = {
            let lifecycle = lifecycle.clone();
            std::thread::spawn(move || lifecycle.start("vm-1"))
        };
        gate.wait_entered();

        let err = lifecycle.stop("vm-1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("start in progress"));

        // Reads answer while the driver call is in flight.
        assert_eq!(registry.vm("vm-1").unwrap().state(), VmState::ShutOff);
        assert_eq!(registry.list_vms().len(), 1);

        gate.release();
        assert_eq!(worker.join().unwrap().unwrap().state, VmState::Running);
    }

    #[test]
    fn test_operations_on_different_vms_proceed_in_parallel() {
        let (lifecycle, _registry, driver) = controller();
        lifecycle.create(&VmSpec::builder("vm-1").build()).unwrap();
        lifecycle.create(&VmSpec::builder("vm-2").build()).unwrap();
        let lifecycle = Arc::new(lifecycle);

        let gate = driver.block(DriverOp::Start);
        let worker = {
            let lifecycle = lifecycle.clone();
            std::thread::spawn(move || lifecycle.start("vm-1"))
        };
        gate.wait_entered();

        // vm-2 is not blocked by vm-1's in-flight start.
        assert_eq!(lifecycle.pause("vm-2").unwrap_err().kind(), ErrorKind::Precondition);

        gate.release();
        worker.join().unwrap().unwrap();
        lifecycle.start("vm-2").unwrap();
    }

    #[test]
    fn test_delete_cascades_to_snapshots() {
        let (lifecycle, registry, driver) = controller();
        let vm = lifecycle.create(&VmSpec::builder("vm-1").build()).unwrap();
        let snapshots = crate::snapshot::SnapshotManager::new(registry.clone(), driver.clone());
        snapshots.create("vm-1", "s1", None).unwrap();
        snapshots.create("vm-1", "s2", None).unwrap();

        driver.fail_next(DriverOp::SnapshotDelete, "snapshot is locked");
        assert_eq!(lifecycle.delete("vm-1").unwrap_err().kind(), ErrorKind::Driver);
        assert_eq!(snapshots.list("vm-1").unwrap().len(), 2);

        let deleted = lifecycle.delete("vm-1").unwrap();
        assert_eq!(deleted.id, vm.id);
        assert!(driver.snapshot_names(&vm.id).is_empty());
        assert_eq!(driver.domain_state(&vm.id), None);
        assert_eq!(registry.vm("vm-1").err().unwrap().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_reconcile_records_external_changes() {
        let (lifecycle, registry, driver) = controller();
        let vm = lifecycle.create(&VmSpec::builder("vm-1").build()).unwrap();
        lifecycle.start("vm-1").unwrap();

        driver.crash(&vm.id);
        let updated = lifecycle.reconcile("vm-1").unwrap().unwrap();
        assert_eq!(updated.state, VmState::Crashed);
        assert_eq!(registry.vm("vm-1").unwrap().state(), VmState::Crashed);

        // Crashed VMs may be started again.
        assert_eq!(lifecycle.start("vm-1").unwrap().state, VmState::Running);
        assert_eq!(lifecycle.reconcile_all(), 1);
    }

    #[test]
    fn test_reconcile_discards_reads_overtaken_by_operations() {
        let (lifecycle, registry, driver) = controller();
        lifecycle.create(&VmSpec::builder("vm-1").build()).unwrap();
        let lifecycle = Arc::new(lifecycle);

        let gate = driver.block(DriverOp::DomainInfo);
        let worker = {
            let lifecycle = lifecycle.clone();
            std::thread::spawn(move || lifecycle.reconcile("vm-1"))
        };
        gate.wait_entered();

        // A full cycle lands while the driver is being queried.
        lifecycle.start("vm-1").unwrap();
        lifecycle.stop("vm-1").unwrap();

        gate.release();
        assert!(worker.join().unwrap().unwrap().is_none());
        assert_eq!(registry.vm("vm-1").unwrap().state(), VmState::ShutOff);

        // A fresh pass records normally.
        assert!(lifecycle.reconcile("vm-1").unwrap().is_some());
    }
}
