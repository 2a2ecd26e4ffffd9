use std::sync::Arc;

use color_eyre::eyre;

use scribe_service::ScribeService;
use scribe_storage::{db::Db, memory::MemoryStore, pg::PgStore, store::RunStore};

#[derive(Clone)]
pub struct AppState {
	pub service: Arc<ScribeService>,
}
impl AppState {
	pub async fn new(config: scribe_config::Config) -> color_eyre::Result<Self> {
		let store: Arc<dyn RunStore> = match config.storage.backend.as_str() {
			"postgres" => {
				let postgres = config
					.storage
					.postgres
					.as_ref()
					.ok_or_else(|| eyre::eyre!("storage.postgres is required for the postgres backend."))?;
				let db = Db::connect(postgres).await?;

				db.ensure_schema().await?;

				Arc::new(PgStore::new(db))
			},
			"memory" => {
				tracing::warn!("Using the in-memory store; runs are lost on restart.");

				Arc::new(MemoryStore::new())
			},
			other => return Err(eyre::eyre!("Unknown storage backend {other}.")),
		};

		Ok(Self::from_service(ScribeService::new(config, store)))
	}

	pub fn from_service(service: ScribeService) -> Self {
		Self { service: Arc::new(service) }
	}
}
