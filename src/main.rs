use std::path::PathBuf;
use std::sync::Arc;

use dqt::config::Settings;
use dqt::interface::QueryInterface;
use dqt::memory::{Dataset, MemoryBackend, MemoryQueryStore};
use dqt::project::BaseUrlLinks;
use dqt::server::router;
use dqt::services::Services;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // dqt [settings file]
    let settings_file = std::env::args().nth(1).map(PathBuf::from);
    let settings = Settings::load(settings_file.as_deref())?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let dataset = match &settings.dataset {
        Some(path) => Dataset::load(path)?,
        None => {
            warn!("no dataset configured, serving an empty study");
            Dataset::default()
        }
    };
    let backend = Arc::new(MemoryBackend::new(dataset));
    let services = Services {
        dictionary: backend.clone(),
        matcher: backend.clone(),
        documents: backend.clone(),
        catalog: backend,
        queries: Arc::new(MemoryQueryStore::new()),
        links: Arc::new(BaseUrlLinks::new(&settings.base_url)?),
    };
    let interface = Arc::new(QueryInterface::open(services).await?);

    let listener = tokio::net::TcpListener::bind(&settings.bind).await?;
    info!(bind = %settings.bind, base_url = %settings.base_url, "dqt listening");
    axum::serve(listener, router(interface)).await?;
    Ok(())
}
