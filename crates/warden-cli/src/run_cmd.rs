//! `warden run`: build the project, supervise the fleet, serve the control API.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use warden_core::directory::PgDeviceDirectory;
use warden_core::harness::XcodebuildHarness;
use warden_core::project::{NoopBuilder, ProjectBuilder, XcodebuildBuilder};
use warden_core::sink::{FileLogSink, LineFilter};
use warden_core::supervisor::{Supervisor, SupervisorConfig};

use crate::api::{self, AppState};
use crate::config::WardenConfig;

pub struct RunOptions {
    pub bind: String,
    pub port: u16,
    /// Run `build-for-testing` before supervising.
    pub build: bool,
}

/// Run the supervisor until Ctrl+C.
pub async fn run(config: &WardenConfig, pool: PgPool, options: &RunOptions) -> Result<()> {
    let project = config.harness.project();
    let harness = XcodebuildHarness::new(
        project.clone(),
        &config.root_path,
        config.harness_timeout,
    );
    let sink = FileLogSink::new(
        &config.log_dir,
        LineFilter::new(config.harness.filter_markers.iter().cloned()),
    );
    let supervisor = Arc::new(Supervisor::new(
        SupervisorConfig::new(&config.root_path, config.harness_timeout),
        Arc::new(harness),
        Arc::new(sink),
    ));

    let builder: Box<dyn ProjectBuilder> = if options.build {
        Box::new(XcodebuildBuilder::new(project).strict_stderr(true))
    } else {
        Box::new(NoopBuilder)
    };

    println!(
        "Supervising devices from {} (timeout {}s, logs in {})",
        config.root_path.display(),
        config.harness_timeout.as_secs(),
        config.log_dir.display()
    );
    supervisor
        .start(builder.as_ref(), &PgDeviceDirectory::new(pool.clone()))
        .await
        .context("failed to start supervisor")?;

    // First signal shuts down gracefully, second force-exits.
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_signal.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nStopping all devices (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    let state = AppState {
        supervisor: Arc::clone(&supervisor),
        pool,
    };
    let served = api::serve(state, &options.bind, options.port, cancel).await;

    supervisor.shutdown().await;
    println!("All devices stopped.");
    served
}
