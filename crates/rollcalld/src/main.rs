use anyhow::{Context, Result};
use rollcall_core::{BackendKind, EmbeddingBackend, SessionController, SystemClock};
use rollcall_hw::V4l2Opener;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod store;

use config::{BusKind, Config};
use dbus_interface::{KioskService, RecentLog};
use store::SqliteStore;

const BUS_NAME: &str = "org.rollcall.Kiosk1";
const OBJECT_PATH: &str = "/org/rollcall/Kiosk1";

fn load_backend(config: &Config) -> Result<Box<dyn EmbeddingBackend>> {
    let scales = config.detection_scales();
    let backend: Box<dyn EmbeddingBackend> = match config.backend {
        BackendKind::ArcFace => {
            let det = config.scrfd_model_path();
            let rec = config.arcface_model_path();
            let backend = rollcall_core::recognizer::load(&det, &rec, scales, config.min_face_px)
                .with_context(|| {
                    format!("loading ArcFace backend from {}", config.model_dir.display())
                })?;
            tracing::info!(
                detector = %det.display(),
                recognizer = %rec.display(),
                "ArcFace backend loaded"
            );
            Box::new(backend)
        }
        BackendKind::Pixel => {
            let model = config.seeta_model_path();
            let backend = rollcall_core::pixel::load(&model, scales, config.min_face_px)
                .with_context(|| format!("loading pixel backend from {}", model.display()))?;
            tracing::info!(model = %model.display(), "pixel backend loaded");
            Box::new(backend)
        }
    };
    Ok(backend)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Arc::new(Config::load()?);
    tracing::info!(
        backend = %config.backend,
        camera = %config.camera_device,
        db = %config.db_path.display(),
        sample_every = config.sample_every,
        cooldown_secs = config.cooldown_secs,
        "configuration loaded"
    );

    // Fail fast: models and database must be usable before we take the bus name.
    let store = Arc::new(SqliteStore::open(&config.db_path, config.cooldown()?)?);
    let backend = load_backend(&config)?;

    let controller = SessionController::new(
        backend,
        store.clone(),
        Arc::new(V4l2Opener::new(config.capture_config())),
        Arc::new(SystemClock),
        config.pipeline_settings()?,
    );
    let controller = Arc::new(Mutex::new(controller));

    let service = KioskService {
        controller: Arc::clone(&controller),
        store,
        recent: Arc::new(RecentLog::default()),
        config: Arc::clone(&config),
    };

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(
        bus = ?config.bus,
        name = BUS_NAME,
        path = OBJECT_PATH,
        "rollcalld ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    if controller.lock().await.stop().await {
        tracing::info!("active session stopped");
    }

    Ok(())
}
