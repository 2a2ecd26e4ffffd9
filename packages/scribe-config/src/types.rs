use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	pub service: Service,
	pub storage: Storage,
	pub providers: Providers,
	#[serde(default)]
	pub agent: Agent,
	pub organization: Option<Organization>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Service {
	pub http_bind: String,
	pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Storage {
	/// Either "postgres" or "memory". The memory backend loses all runs on restart.
	pub backend: String,
	pub postgres: Option<Postgres>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Postgres {
	pub dsn: String,
	pub pool_max_conns: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Providers {
	pub reasoner: LlmProviderConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub temperature: f32,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Agent {
	/// Upper bound on reasoning calls made for a single run, across resumes.
	pub max_iterations: u32,
	pub call_timeout_ms: u64,
	pub max_clarifications: u32,
	pub undo_depth: u32,
	pub poll_interval_ms: u64,
	pub system_preamble: Option<String>,
}
impl Default for Agent {
	fn default() -> Self {
		Self {
			max_iterations: 12,
			call_timeout_ms: 45_000,
			max_clarifications: 5,
			undo_depth: 10,
			poll_interval_ms: 1_500,
			system_preamble: None,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct Organization {
	pub name: String,
	pub specialty: Option<String>,
}
