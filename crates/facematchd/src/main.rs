use anyhow::{Context, Result};
use facematch_core::{DistancePolicy, FaceAnalyzer, RecordStore, SearchEngine, EMBEDDING_DIM};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod images;
mod store;

use config::{BusKind, Config};
use dbus_interface::FaceMatchService;
use images::ImageStore;
use store::SqliteStore;

const BUS_NAME: &str = "org.facematch.FaceMatch1";
const OBJECT_PATH: &str = "/org/facematch/FaceMatch1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facematchd starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        uploads = %config.upload_dir.display(),
        models = %config.model_dir.display(),
        threshold = config.match_threshold,
        bus = ?config.bus,
        "configuration loaded"
    );

    let store: Arc<dyn RecordStore> =
        Arc::new(SqliteStore::open(&config.db_path, EMBEDDING_DIM).context("failed to open face database")?);
    let images = Arc::new(ImageStore::from_config(&config).context("failed to prepare upload directory")?);

    // Load models synchronously (fail-fast)
    let analyzer = FaceAnalyzer::load(&config.scrfd_model_path(), &config.arcface_model_path())
        .context("failed to load face models")?;

    let engine = engine::spawn_engine(
        analyzer,
        config.face_order,
        store.clone(),
        images.clone(),
        config.adapter_timeout(),
    )
    .context("failed to spawn engine thread")?;

    let service = FaceMatchService::new(
        engine,
        store,
        images,
        SearchEngine::new(DistancePolicy::new(config.match_threshold)),
        config.default_top_k,
        config.face_order,
        FaceAnalyzer::info(),
    );

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("failed to register {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "facematchd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("facematchd shutting down");

    Ok(())
}
