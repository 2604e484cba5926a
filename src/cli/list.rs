//! List command implementation.

use clap::Args;
use vmdeck::config::VmdeckConfig;
use vmdeck::db::VmdeckDb;

/// List VMs and storage pools from the local registry database.
#[derive(Args, Debug)]
pub struct ListCmd {
    /// Show devices and snapshots for each VM.
    #[arg(short, long)]
    pub verbose: bool,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl ListCmd {
    /// Execute the list command.
    pub fn run(&self, config: &VmdeckConfig) -> vmdeck::Result<()> {
        let path = config.db_path()?;
        // redb holds an exclusive lock, so a running server keeps us out.
        let db = VmdeckDb::open(&path).map_err(|e| {
            vmdeck::Error::Config(format!(
                "cannot open {} ({}); if `vmdeck serve` is running, query GET /api/v1/vms instead",
                path.display(),
                e
            ))
        })?;

        let mut vms = db.load_vms()?;
        vms.sort_by_key(|r| r.vm.created_at);
        let mut pools = db.load_pools()?;
        pools.sort_by(|a, b| a.name.cmp(&b.name));

        if self.json {
            let json = serde_json::json!({
                "vms": vms.iter().map(|r| &r.vm).collect::<Vec<_>>(),
                "pools": pools.iter().map(|p| p.to_pool()).collect::<Vec<_>>(),
            });
            let text = serde_json::to_string_pretty(&json)
                .map_err(|e| vmdeck::Error::Config(format!("serialize list output: {}", e)))?;
            println!("{}", text);
            return Ok(());
        }

        if vms.is_empty() {
            println!("No VMs found");
        } else {
            println!(
                "{:<20} {:<10} {:<6} {:<12} {:<6} {:<5}",
                "NAME", "STATE", "VCPUS", "MEMORY", "DISKS", "NICS"
            );
            println!("{}", "-".repeat(64));

            for record in &vms {
                let vm = &record.vm;
                println!(
                    "{:<20} {:<10} {:<6} {:<12} {:<6} {:<5}",
                    truncate(&vm.name, 18),
                    vm.state.name(),
                    vm.resources.vcpus,
                    format!("{} MiB", vm.resources.memory_kb / 1024),
                    vm.disks.len(),
                    vm.nics.len(),
                );

                if self.verbose {
                    println!("  ID: {}", vm.id);
                    for disk in &vm.disks {
                        println!("  Disk {} ({}): {}", disk.target_dev, disk.bus, disk.volume_path);
                    }
                    for nic in &vm.nics {
                        println!("  NIC {} ({}): {}", nic.mac, nic.model, nic.network);
                    }
                    for snapshot in &record.snapshots {
                        println!("  Snapshot {} at {}", snapshot.name, snapshot.created_at);
                    }
                    println!("  Created: {}", vm.created_at);
                    println!();
                }
            }
        }

        if !pools.is_empty() {
            println!();
            println!(
                "{:<20} {:<10} {:<12} {:<12} {:<8}",
                "POOL", "STATE", "CAPACITY", "ALLOCATED", "VOLUMES"
            );
            println!("{}", "-".repeat(64));
            for pool in &pools {
                println!(
                    "{:<20} {:<10} {:<12} {:<12} {:<8}",
                    truncate(&pool.name, 18),
                    pool.state.name(),
                    format_gib(pool.capacity_b),
                    format_gib(pool.allocation_b()),
                    pool.volumes.len(),
                );
            }
        }

        Ok(())
    }
}

/// Truncate a string to max length, adding "..." if needed.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max - 3).collect();
        format!("{}...", head)
    }
}

fn format_gib(bytes: u64) -> String {
    format!("{} GiB", bytes / vmdeck::util::GIB)
}
