use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tagwatch::config;
use tagwatch::controller::UpdateCoordinator;
use tagwatch::engine::EngineClient;
use tagwatch::oci_registry::RegistryResolver;
use tagwatch::state::StateStore;
use tagwatch::webserver;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            v == "1" || v == "true" || v == "yes"
        })
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting tagwatch {}", env!("CARGO_PKG_VERSION"));

    let config_path = env::args()
        .nth(1)
        .or_else(|| env::var("CONFIG_FILE").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let state_path = env::var("STATE_FILE").unwrap_or_else(|_| "state.json".to_string());
    let dry_run = env_flag("DRY_RUN");
    let daemon = env_flag("DAEMON");

    let config = config::load_config(&config_path)?;
    info!("Tracking {} image(s)", config.images.len());
    if dry_run {
        info!("Dry run mode, no changes will be made");
    }

    let coordinator = Arc::new(UpdateCoordinator::new(
        EngineClient::new(),
        RegistryResolver::new()?,
        StateStore::new(&state_path),
        dry_run,
    ));

    if !daemon {
        coordinator.run_cycle(&config.images, None).await;
        return Ok(());
    }

    let schedule = env::var("CHECK_SCHEDULE").unwrap_or_else(|_| "0 0 * * * *".to_string());
    info!("Running as daemon with schedule {}", schedule);

    let targets = Arc::new(config.images);
    let mut scheduler = JobScheduler::new().await?;

    let job_coordinator = coordinator.clone();
    let job_targets = targets.clone();
    let job = Job::new_async(schedule.as_str(), move |_uuid, _l| {
        let coordinator = job_coordinator.clone();
        let targets = job_targets.clone();
        Box::pin(async move {
            info!("Scheduled check cycle starting");
            let events = coordinator.run_cycle(&targets, None).await;
            info!("Check cycle finished with {} event(s)", events.len());
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;

    // One immediate cycle so a fresh daemon does not idle until the first
    // scheduled tick.
    coordinator.run_cycle(&targets, None).await;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    let port: u16 = env::var("WEBSERVER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let app = webserver::create_app();
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    scheduler.shutdown().await?;
    info!("Stopped");
    Ok(())
}
