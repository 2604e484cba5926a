//! libvirt integration through the `virsh` command-line tool.
//!
//! Every driver call maps to one or two `virsh` invocations. Domains are
//! addressed by UUID so renames on the host cannot confuse the registry.

use std::ffi::OsStr;
use std::io::Write;
use std::process::Command;

use super::{DomainInfo, Driver, DriverError, DriverOp, DriverResult};
use crate::error::{Error, Result};
use crate::vm::{DiskDevice, NetworkInterface, VirtualMachine, VmId, VmMetrics, VmState};

/// Driver backed by `virsh`.
pub struct VirshDriver {
    /// Connection URI (e.g. `qemu:///system`); `None` uses virsh's default.
    uri: Option<String>,
}

impl VirshDriver {
    /// Create a driver for the given connection URI.
    pub fn new(uri: Option<String>) -> Self {
        Self { uri }
    }

    /// Check that `virsh` is installed and the connection works.
    pub fn check_available(&self) -> Result<()> {
        self.run(DriverOp::DomainInfo, ["version"])
            .map(|_| ())
            .map_err(|e| Error::Config(format!("virsh is not usable: {}", e)))
    }

    /// Build a virsh command with the connection URI applied.
    fn command(&self) -> Command {
        let mut cmd = Command::new("virsh");
        cmd.arg("-q");
        if let Some(uri) = &self.uri {
            cmd.args(["-c", uri]);
        }
        cmd
    }

    /// Run virsh and return trimmed stdout, or stderr as the driver error.
    fn run<I, S>(&self, op: DriverOp, args: I) -> DriverResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command();
        cmd.args(args);
        tracing::debug!(op = %op, command = ?cmd, "running virsh");

        let output = cmd
            .output()
            .map_err(|e| DriverError::new(format!("failed to run virsh: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DriverError::new(clean_virsh_error(&stderr)));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn domain_action(&self, op: DriverOp, verb: &str, id: &VmId) -> DriverResult<()> {
        let domain = id.to_string();
        self.run(op, [verb, domain.as_str()]).map(|_| ())
    }
}

/// Strip virsh's `error:` prefixes and join the remaining lines.
fn clean_virsh_error(stderr: &str) -> String {
    let message = stderr
        .lines()
        .map(|l| l.trim().trim_start_matches("error:").trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(": ");
    if message.is_empty() {
        "virsh exited with an error".to_string()
    } else {
        message
    }
}

/// Map `virsh domstate` output to a VmState.
fn parse_domstate(output: &str) -> DriverResult<VmState> {
    match output.lines().next().unwrap_or("").trim() {
        "running" | "in shutdown" | "blocked" | "idle" => Ok(VmState::Running),
        "shut off" => Ok(VmState::ShutOff),
        "paused" | "pmsuspended" => Ok(VmState::Paused),
        "crashed" => Ok(VmState::Crashed),
        other => Err(DriverError::new(format!("unknown domain state '{}'", other))),
    }
}

/// Extract IPv4/IPv6 addresses from `virsh domifaddr` output.
fn parse_domifaddr(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            // vnet0  52:54:00:aa:bb:cc  ipv4  192.168.122.15/24
            let cols: Vec<&str> = line.split_whitespace().collect();
            match cols.as_slice() {
                [_, _, proto, addr] if proto.starts_with("ipv") => {
                    Some(addr.split('/').next().unwrap_or(addr).to_string())
                }
                _ => None,
            }
        })
        .collect()
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

/// Render the domain XML used by `virsh define`.
fn domain_xml(vm: &VirtualMachine) -> String {
    let mut xml = String::new();
    xml.push_str("<domain type='kvm'>\n");
    xml.push_str(&format!("  <name>{}</name>\n", xml_escape(&vm.name)));
    xml.push_str(&format!("  <uuid>{}</uuid>\n", vm.id));
    xml.push_str(&format!(
        "  <memory unit='KiB'>{}</memory>\n",
        vm.resources.max_memory_kb
    ));
    xml.push_str(&format!(
        "  <currentMemory unit='KiB'>{}</currentMemory>\n",
        vm.resources.memory_kb
    ));
    xml.push_str(&format!("  <vcpu>{}</vcpu>\n", vm.resources.vcpus));
    xml.push_str("  <os>\n    <type machine='q35'>hvm</type>\n    <boot dev='hd'/>\n  </os>\n");
    xml.push_str("  <devices>\n");
    for disk in &vm.disks {
        xml.push_str(&format!(
            "    <disk type='file' device='disk'>\n      <source file='{}'/>\n      <target dev='{}' bus='{}'/>\n    </disk>\n",
            xml_escape(&disk.volume_path),
            xml_escape(&disk.target_dev),
            disk.bus
        ));
    }
    for nic in &vm.nics {
        xml.push_str(&format!(
            "    <interface type='network'>\n      <source network='{}'/>\n      <mac address='{}'/>\n      <model type='{}'/>\n    </interface>\n",
            xml_escape(&nic.network),
            nic.mac,
            nic.model
        ));
    }
    xml.push_str("    <console type='pty'/>\n");
    xml.push_str("  </devices>\n</domain>\n");
    xml
}

/// `--config` always, `--live` only when the domain is running.
fn scope_flags(live: bool) -> Vec<&'static str> {
    if live {
        vec!["--config", "--live"]
    } else {
        vec!["--config"]
    }
}

impl Driver for VirshDriver {
    fn name(&self) -> &'static str {
        "virsh"
    }

    fn define(&self, vm: &VirtualMachine) -> DriverResult<()> {
        let mut file = tempfile::Builder::new()
            .prefix("vmdeck-domain-")
            .suffix(".xml")
            .tempfile()
            .map_err(|e| DriverError::new(format!("failed to create domain xml: {}", e)))?;
        file.write_all(domain_xml(vm).as_bytes())
            .map_err(|e| DriverError::new(format!("failed to write domain xml: {}", e)))?;

        tracing::info!(vm = %vm.name, id = %vm.id, "defining domain");
        self.run(DriverOp::Define, [OsStr::new("define"), file.path().as_os_str()])
            .map(|_| ())
    }

    fn start(&self, id: &VmId) -> DriverResult<()> {
        self.domain_action(DriverOp::Start, "start", id)
    }

    fn stop(&self, id: &VmId) -> DriverResult<()> {
        self.domain_action(DriverOp::Stop, "shutdown", id)
    }

    fn reboot(&self, id: &VmId) -> DriverResult<()> {
        self.domain_action(DriverOp::Reboot, "reboot", id)
    }

    fn pause(&self, id: &VmId) -> DriverResult<()> {
        self.domain_action(DriverOp::Pause, "suspend", id)
    }

    fn resume(&self, id: &VmId) -> DriverResult<()> {
        self.domain_action(DriverOp::Resume, "resume", id)
    }

    fn delete(&self, id: &VmId) -> DriverResult<()> {
        let domain = id.to_string();
        // A running domain must be destroyed before it can be undefined.
        if let Ok(VmState::Running | VmState::Paused) = self
            .run(DriverOp::DomainInfo, ["domstate", domain.as_str()])
            .and_then(|out| parse_domstate(&out))
        {
            self.run(DriverOp::Delete, ["destroy", domain.as_str()])?;
        }
        self.run(DriverOp::Delete, ["undefine", domain.as_str()])
            .map(|_| ())
    }

    fn domain_info(&self, id: &VmId) -> DriverResult<DomainInfo> {
        let domain = id.to_string();
        let state = parse_domstate(&self.run(DriverOp::DomainInfo, ["domstate", domain.as_str()])?)?;

        let ip_addresses = if state.is_running() {
            match self.run(DriverOp::DomainInfo, ["domifaddr", domain.as_str()]) {
                Ok(out) => parse_domifaddr(&out),
                Err(e) => {
                    tracing::debug!(vm = %id, error = %e, "domifaddr failed");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        Ok(DomainInfo {
            state,
            metrics: VmMetrics {
                ip_addresses,
                ..Default::default()
            },
        })
    }

    fn snapshot_create(&self, id: &VmId, name: &str, description: &str) -> DriverResult<()> {
        let domain = id.to_string();
        let mut args = vec!["snapshot-create-as", domain.as_str(), "--name", name];
        if !description.is_empty() {
            args.extend(["--description", description]);
        }
        self.run(DriverOp::SnapshotCreate, args).map(|_| ())
    }

    fn snapshot_revert(&self, id: &VmId, name: &str) -> DriverResult<()> {
        let domain = id.to_string();
        self.run(
            DriverOp::SnapshotRevert,
            ["snapshot-revert", domain.as_str(), "--snapshotname", name],
        )
        .map(|_| ())
    }

    fn snapshot_delete(&self, id: &VmId, name: &str) -> DriverResult<()> {
        let domain = id.to_string();
        self.run(
            DriverOp::SnapshotDelete,
            ["snapshot-delete", domain.as_str(), "--snapshotname", name],
        )
        .map(|_| ())
    }

    fn attach_disk(&self, id: &VmId, disk: &DiskDevice, live: bool) -> DriverResult<()> {
        let domain = id.to_string();
        let mut args = vec![
            "attach-disk",
            domain.as_str(),
            disk.volume_path.as_str(),
            disk.target_dev.as_str(),
            "--targetbus",
            disk.bus.name(),
        ];
        args.extend(scope_flags(live));
        self.run(DriverOp::AttachDisk, args).map(|_| ())
    }

    fn detach_disk(&self, id: &VmId, disk: &DiskDevice, live: bool) -> DriverResult<()> {
        let domain = id.to_string();
        let mut args = vec!["detach-disk", domain.as_str(), disk.target_dev.as_str()];
        args.extend(scope_flags(live));
        self.run(DriverOp::DetachDisk, args).map(|_| ())
    }

    fn attach_network(&self, id: &VmId, nic: &NetworkInterface, live: bool) -> DriverResult<()> {
        let domain = id.to_string();
        let mut args = vec![
            "attach-interface",
            domain.as_str(),
            "--type",
            "network",
            "--source",
            nic.network.as_str(),
            "--model",
            nic.model.name(),
            "--mac",
            nic.mac.as_str(),
        ];
        args.extend(scope_flags(live));
        self.run(DriverOp::AttachNetwork, args).map(|_| ())
    }

    fn detach_network(&self, id: &VmId, nic: &NetworkInterface, live: bool) -> DriverResult<()> {
        let domain = id.to_string();
        let mut args = vec![
            "detach-interface",
            domain.as_str(),
            "--type",
            "network",
            "--mac",
            nic.mac.as_str(),
        ];
        args.extend(scope_flags(live));
        self.run(DriverOp::DetachNetwork, args).map(|_| ())
    }

    fn pool_create(&self, name: &str, path: &str) -> DriverResult<()> {
        self.run(
            DriverOp::PoolCreate,
            ["pool-define-as", name, "dir", "--target", path],
        )?;
        self.run(DriverOp::PoolCreate, ["pool-build", name])?;
        self.run(DriverOp::PoolCreate, ["pool-start", name])?;
        if let Err(e) = self.run(DriverOp::PoolCreate, ["pool-autostart", name]) {
            tracing::warn!(pool = %name, error = %e, "failed to mark pool autostart");
        }
        Ok(())
    }

    fn pool_delete(&self, name: &str) -> DriverResult<()> {
        if let Err(e) = self.run(DriverOp::PoolDelete, ["pool-destroy", name]) {
            tracing::debug!(pool = %name, error = %e, "pool-destroy failed, pool may be inactive");
        }
        self.run(DriverOp::PoolDelete, ["pool-undefine", name])
            .map(|_| ())
    }

    fn volume_create(&self, pool: &str, name: &str, capacity_b: u64) -> DriverResult<String> {
        let capacity = capacity_b.to_string();
        self.run(
            DriverOp::VolumeCreate,
            ["vol-create-as", pool, name, capacity.as_str(), "--format", "qcow2"],
        )?;
        self.run(DriverOp::VolumeCreate, ["vol-path", "--pool", pool, name])
    }

    fn volume_delete(&self, pool: &str, name: &str) -> DriverResult<()> {
        self.run(DriverOp::VolumeDelete, ["vol-delete", "--pool", pool, name])
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{DiskBus, NicModel, VmSpec};

    #[test]
    fn test_parse_domstate() {
        assert_eq!(parse_domstate("running\n").unwrap(), VmState::Running);
        assert_eq!(parse_domstate("shut off").unwrap(), VmState::ShutOff);
        assert_eq!(parse_domstate("paused").unwrap(), VmState::Paused);
        assert_eq!(parse_domstate("crashed").unwrap(), VmState::Crashed);
        assert!(parse_domstate("dying").is_err());
    }

    #[test]
    fn test_parse_domifaddr() {
        let out = "vnet0      52:54:00:aa:bb:cc    ipv4         192.168.122.15/24\n\
                   vnet1      52:54:00:aa:bb:cd    ipv6         fe80::1/64";
        assert_eq!(parse_domifaddr(out), vec!["192.168.122.15", "fe80::1"]);
        assert!(parse_domifaddr("").is_empty());
    }

    #[test]
    fn test_clean_virsh_error() {
        let stderr = "error: Failed to start domain 'web'\nerror: Requested operation is not valid: domain is already active\n";
        assert_eq!(
            clean_virsh_error(stderr),
            "Failed to start domain 'web': Requested operation is not valid: domain is already active"
        );
        assert_eq!(clean_virsh_error(""), "virsh exited with an error");
    }

    #[test]
    fn test_domain_xml_includes_devices() {
        let mut vm = VirtualMachine::from_spec(&VmSpec::builder("web").vcpus(2).memory_kb(2048).build());
        vm.disks.push(DiskDevice {
            target_dev: "vda".into(),
            volume_path: "/pools/default/web.qcow2".into(),
            bus: DiskBus::Virtio,
        });
        vm.nics.push(NetworkInterface {
            model: NicModel::E1000,
            network: "default".into(),
            mac: "52:54:00:00:00:01".into(),
        });

        let xml = domain_xml(&vm);
        assert!(xml.contains("<name>web</name>"));
        assert!(xml.contains(&format!("<uuid>{}</uuid>", vm.id)));
        assert!(xml.contains("<vcpu>2</vcpu>"));
        assert!(xml.contains("<target dev='vda' bus='virtio'/>"));
        assert!(xml.contains("<model type='e1000'/>"));
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape("a<b>&'\""), "a&lt;b&gt;&amp;&apos;&quot;");
    }
}
