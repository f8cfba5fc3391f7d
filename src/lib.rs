pub mod cache;
pub mod clock;
pub mod config;
pub mod congestion;
pub mod coordinator;
pub mod errors;
pub mod frequency;
pub mod frequent;
pub mod lock;
pub mod monitoring;
pub mod places;
pub mod retry;
pub mod store;
pub mod sync;

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use cache::{CacheStats, PlaceCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AppConfig, PublicAppConfig};
pub use congestion::{
    CongestionApi, CongestionCache, CongestionObservation, CongestionQuery, CongestionRecord,
    HttpCongestionClient,
};
pub use coordinator::{Coordinator, CoordinatorStats};
pub use errors::{AppError, AppResult};
pub use frequent::{derive_frequent, RecomputeOutcome};
pub use places::{
    FrequentPlace, Place, PlaceDetail, SearchHit, VariableSnapshot, VariableUpdate, Weather,
};
pub use retry::{Backoff, RetryPolicy};
pub use store::{keys, BlobStore, FsBlobStore, LatencyStore, MemoryBlobStore};
pub use sync::SyncOutcome;

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,placewatch=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}

pub async fn run(config: AppConfig) -> AppResult<()> {
    let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&config.data_dir)?);
    let congestion_api = HttpCongestionClient::from_config(&config)?
        .map(|client| Arc::new(client) as Arc<dyn CongestionApi>);

    let coordinator =
        Coordinator::initialize(config, store, Arc::new(SystemClock), congestion_api).await?;
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    coordinator.shutdown().await;
    Ok(())
}
