//! lot_watch - parking lot vehicle counter service
//!
//! This daemon:
//! 1. Loads configuration (optional JSON file + environment)
//! 2. Resolves a detection model once (custom, pretrained, or none)
//! 3. Serves the upload page and `/detect` until Ctrl-C

use anyhow::Result;
use std::sync::{mpsc, Arc};

use lot_watch::{ApiServer, DetectionPipeline, ModelResolver, ServiceConfig};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServiceConfig::load()?;
    log::info!("lot_watch {} starting", env!("CARGO_PKG_VERSION"));

    let resolution = ModelResolver::new(config.model.clone()).resolve();
    let capability = resolution.capability;
    match &resolution.source {
        Some(path) => log::info!("detection backend: {} ({})", capability, path.display()),
        None if config.pipeline.simulate_on_missing_backend => log::warn!(
            "detection backend: {}; serving {} simulations",
            capability,
            config.pipeline.simulation.as_str()
        ),
        None => log::warn!(
            "detection backend: {}; simulation disabled, /detect will return 503",
            capability
        ),
    }

    let pipeline = Arc::new(DetectionPipeline::new(resolution, config.pipeline.clone()));
    let api_handle = ApiServer::new(config.api_config(), pipeline).spawn()?;
    log::info!("detection api listening on http://{}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("lot_watch waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
