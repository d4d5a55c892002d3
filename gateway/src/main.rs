use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use skyblock_common::constants::STARTUP_LOCK_KEY;
use skyblock_gateway::api::ApiBuilder;
use skyblock_gateway::args::Args;
use skyblock_gateway::bus::{forward_events, ClientRegistry, EventBus, RedisBus};
use skyblock_gateway::dal::{AdmissionQueue, Sqlite};
use skyblock_gateway::driver::{HypervisorDriver, LxdDriver};
use skyblock_gateway::reconcile::reconcile_island_states;
use skyblock_gateway::service::{FleetSettings, IslandService};
use skyblock_gateway::updater::UpdateWorker;
use skyblock_gateway::admission::AdmissionWorker;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,hyper=warn")),
        )
        .init();

    let dal = Sqlite::new(&args.database_url).await?;

    let driver: Arc<dyn HypervisorDriver> = Arc::new(LxdDriver::new(
        args.lxd_socket_path.clone(),
        args.lxd_project.clone(),
        Duration::from_secs(args.lxd_operation_timeout),
    ));

    let bus: Arc<dyn EventBus> = Arc::new(RedisBus::connect(&args.redis_url, &args.redis_channel).await?);

    let registry = ClientRegistry::default();
    tokio::spawn(forward_events(Arc::clone(&bus), registry.clone()));

    let settings = FleetSettings::from_args(&args);
    let service = IslandService::new(dal, driver, Arc::clone(&bus), settings);

    // One process per fleet runs the startup pass and the queue workers;
    // the lock expires on its own if that process dies mid-way.
    let leader = bus
        .set_if_not_exists(STARTUP_LOCK_KEY, "1", Duration::from_secs(60))
        .await?;

    if leader {
        info!("elected startup leader");
        reconcile_island_states(&service).await;

        tokio::spawn(AdmissionWorker::new(service.clone(), AdmissionQueue::Creation).start());
        tokio::spawn(AdmissionWorker::new(service.clone(), AdmissionQueue::Start).start());
        tokio::spawn(UpdateWorker::new(service.clone()).start());
    } else {
        info!("another process won the startup election, skipping startup tasks");
    }

    let router = ApiBuilder::new()
        .with_service(service)
        .with_registry(registry)
        .with_admin_key(args.admin_key.clone())
        .into_router();

    info!(address = %args.address, "serving fleet API");
    axum::Server::bind(&args.address)
        .serve(router.into_make_service())
        .await?;

    Ok(())
}
