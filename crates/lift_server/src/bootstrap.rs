use std::sync::atomic::AtomicBool;

use lift::{load_template_catalog, resolve_app_paths, CatalogError, StartupError, ZoneConfigError};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{load_config_from_env, ConfigError};
use crate::server::{self, LiftServer};
use crate::transport::LineTransport;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error("failed to load template catalog: {0}")]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid staging zone settings: {0}")]
    Zone(#[from] ZoneConfigError),
    #[error("failed to bind control port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

pub(crate) fn run_server() -> Result<(), ServerError> {
    init_tracing();
    info!("=== Lift Startup ===");

    let paths = resolve_app_paths()?;
    let catalog = load_template_catalog(&paths.templates_dir)?;
    info!(
        root = %paths.root.display(),
        avatar_templates = catalog.avatar_count(),
        world_templates = catalog.world_count(),
        "template_catalog_loaded"
    );

    let config = load_config_from_env()?;
    let settings = config.resolve(&catalog)?;
    let mut server = LiftServer::new(settings, catalog, config.loader_latency_ticks)?;
    let mut transport = LineTransport::bind_localhost(config.port).map_err(|source| {
        ServerError::Bind {
            port: config.port,
            source,
        }
    })?;

    let shutdown = AtomicBool::new(false);
    server::run(&mut server, &mut transport, &shutdown);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();
}
