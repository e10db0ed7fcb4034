use docktopus::bollard::Docker;
use hostwing_pipeline::DeploymentPipeline;
use hostwing_runtime::RuntimeClient;
use hostwing_server::AppState;
use hostwing_store::{DeploymentStore, StateStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("Starting hostwing agent...");

    let port: u16 = std::env::var("HOSTWING_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let key = std::env::var("HOSTWING_KEY").unwrap_or_else(|_| "development".to_string());
    let storage_root: PathBuf = std::env::var("HOSTWING_STORAGE_ROOT")
        .unwrap_or_else(|_| "/var/lib/hostwing".to_string())
        .into();

    // `connect_with_local_defaults` honors `DOCKER_HOST` itself, falling back
    // to the platform's default local socket when unset.
    let docker = Docker::connect_with_local_defaults()?;
    let runtime = Arc::new(RuntimeClient::new(Arc::new(docker)));
    runtime.negotiate_version().await;
    runtime.ping().await?;

    tokio::fs::create_dir_all(storage_root.join("storage")).await?;
    tokio::fs::create_dir_all(storage_root.join("volumes")).await?;

    let state_store = Arc::new(StateStore::new(&storage_root));
    let deployment_store = Arc::new(DeploymentStore::new(&storage_root));
    let pipeline = Arc::new(DeploymentPipeline::new(
        runtime.clone(),
        state_store.clone(),
        deployment_store,
        storage_root.clone(),
    ));

    let app_state = Arc::new(AppState::new(
        runtime,
        state_store,
        pipeline,
        key,
        storage_root,
    ));
    let app = hostwing_server::create_app(app_state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "hostwing agent listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
