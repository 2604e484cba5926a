//! HTTP API server command.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use vmdeck::api::state::ApiState;
use vmdeck::config::{DriverKind, VmdeckConfig};
use vmdeck::Result;

/// Start the HTTP API server.
#[derive(Parser, Debug)]
#[command(about = "Start the HTTP API server for VM, snapshot and storage management")]
#[command(after_long_help = "\
VMs are owned by the hypervisor - they keep running when the server stops.

API ENDPOINTS:
  GET    /health                                   Health check
  GET    /api/v1/events                            Registry change stream (SSE)
  GET    /api/v1/vms                               List VMs
  POST   /api/v1/vms                               Create VM
  GET    /api/v1/vms/:id                           Get VM
  POST   /api/v1/vms/:id/action                    start|stop|reboot|pause|resume
  DELETE /api/v1/vms/:id                           Delete VM and its snapshots
  GET    /api/v1/vms/:id/snapshots                 List snapshots
  POST   /api/v1/vms/:id/snapshots                 Create snapshot
  POST   /api/v1/vms/:id/snapshots/:name/revert    Revert to snapshot
  DELETE /api/v1/vms/:id/snapshots/:name           Delete snapshot
  POST   /api/v1/vms/:id/attach-disk               Attach volume
  POST   /api/v1/vms/:id/attach-network            Attach NIC
  DELETE /api/v1/vms/:id/disks/:target             Detach disk
  DELETE /api/v1/vms/:id/nics/:mac                 Detach NIC
  GET    /api/v1/storage-pools                     List pools
  POST   /api/v1/storage-pools                     Create pool
  POST   /api/v1/storage-pools/:name/volumes       Create volume
  GET    /api/v1/images                            List images
  GET    /swagger-ui                               Interactive API docs

EXAMPLES:
  vmdeck serve                         Listen on 127.0.0.1:8080 (default)
  vmdeck serve -l 0.0.0.0:9000         Listen on all interfaces, port 9000
  vmdeck serve --driver virsh          Manage libvirt domains via virsh")]
pub struct ServeCmd {
    /// Address and port to listen on (overrides the config file)
    #[arg(short, long, value_name = "ADDR:PORT")]
    listen: Option<String>,

    /// Hypervisor driver (overrides the config file)
    #[arg(short, long, value_enum)]
    driver: Option<DriverKind>,

    /// Directory for the registry database and default pools
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Config file (defaults to the user config directory)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

impl ServeCmd {
    /// Run the serve command.
    pub fn run(self) -> Result<()> {
        let config = self.load_config()?;

        // Parse listen address
        let addr: SocketAddr = config.listen.parse().map_err(|e| {
            vmdeck::Error::Config(format!("invalid listen address '{}': {}", config.listen, e))
        })?;

        // Create the runtime with signal handling enabled
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(vmdeck::Error::Io)?;

        runtime.block_on(run_server(config, addr))
    }

    /// Load the config file and apply command-line overrides.
    fn load_config(&self) -> Result<VmdeckConfig> {
        let mut config = match &self.config {
            Some(path) => VmdeckConfig::load_from(path)?,
            None => VmdeckConfig::load()?,
        };
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(driver) = self.driver {
            config.driver = driver;
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = Some(dir.clone());
        }
        Ok(config)
    }
}

async fn run_server(config: VmdeckConfig, addr: SocketAddr) -> Result<()> {
    // Security warning if binding to all interfaces
    if addr.ip().is_unspecified() {
        eprintln!(
            "WARNING: Server is listening on all interfaces ({}).",
            addr.ip()
        );
        eprintln!("         The API has no authentication - any network client can control this host.");
        eprintln!("         Consider using --listen 127.0.0.1:8080 for local-only access.");
    }

    // Open the registry database and the hypervisor driver
    let state = Arc::new(ApiState::open(config)?);
    let failed = state.seed_pools();
    if !failed.is_empty() {
        eprintln!(
            "WARNING: could not create configured pool(s): {}",
            failed.join(", ")
        );
    }

    // Pick up anything that changed while the server was down
    let reconcile_state = state.clone();
    let changed = tokio::task::spawn_blocking(move || reconcile_state.lifecycle.reconcile_all())
        .await
        .map_err(|e| vmdeck::Error::Config(format!("initial reconcile failed: {}", e)))?;
    let vms = state.registry.list_vms().len();
    if vms > 0 {
        println!("Loaded {} VM(s), {} reconciled with the driver", vms, changed);
    }

    // Create shutdown channel for supervisor
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Spawn supervisor task
    let supervisor_state = state.clone();
    let supervisor_handle = tokio::spawn(async move {
        let supervisor = vmdeck::api::supervisor::Supervisor::new(supervisor_state, shutdown_rx);
        supervisor.run().await;
    });

    // Create router
    let app = vmdeck::api::create_router(state);

    // Create listener
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(vmdeck::Error::Io)?;

    tracing::info!(address = %addr, "starting HTTP API server");
    println!("vmdeck API server listening on http://{}", addr);

    // Run the server with graceful shutdown (VMs keep running independently)
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(vmdeck::Error::Io)?;

    // Signal supervisor to stop
    let _ = shutdown_tx.send(true);

    // Wait for supervisor to finish (with timeout)
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), supervisor_handle).await;

    Ok(())
}

/// Wait for shutdown signal.
/// Note: VMs are NOT stopped on server shutdown - they belong to the hypervisor.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
    eprintln!("\nShutting down server (VMs continue running)...");
}
