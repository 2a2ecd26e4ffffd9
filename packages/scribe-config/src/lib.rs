mod error;
mod types;

pub use error::{Error, Result};
pub use types::{Agent, Config, LlmProviderConfig, Organization, Postgres, Providers, Service, Storage};

use std::{fs, path::Path};

pub const MAX_ITERATIONS_CEILING: u32 = 50;

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;

	parse(&raw).map_err(|err| match err {
		Error::ParseConfig { source, .. } =>
			Error::ParseConfig { path: path.to_path_buf(), source },
		other => other,
	})
}

pub fn parse(raw: &str) -> Result<Config> {
	let mut cfg: Config = toml::from_str(raw)
		.map_err(|err| Error::ParseConfig { path: Default::default(), source: err })?;

	normalize(&mut cfg);

	validate(&cfg)?;

	Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
	if cfg.service.http_bind.trim().is_empty() {
		return Err(Error::Validation {
			message: "service.http_bind must be non-empty.".to_string(),
		});
	}

	match cfg.storage.backend.as_str() {
		"postgres" =>
			if cfg.storage.postgres.is_none() {
				return Err(Error::Validation {
					message: "storage.postgres is required when storage.backend is postgres."
						.to_string(),
				});
			},
		"memory" => {},
		_ => {
			return Err(Error::Validation {
				message: "storage.backend must be one of postgres or memory.".to_string(),
			});
		},
	}

	if let Some(postgres) = cfg.storage.postgres.as_ref() {
		if postgres.dsn.trim().is_empty() {
			return Err(Error::Validation {
				message: "storage.postgres.dsn must be non-empty.".to_string(),
			});
		}
		if postgres.pool_max_conns == 0 {
			return Err(Error::Validation {
				message: "storage.postgres.pool_max_conns must be greater than zero.".to_string(),
			});
		}
	}

	let reasoner = &cfg.providers.reasoner;

	if reasoner.api_key.trim().is_empty() {
		return Err(Error::Validation {
			message: "Provider reasoner api_key must be non-empty.".to_string(),
		});
	}
	if !reasoner.temperature.is_finite() || !(0.0..=2.0).contains(&reasoner.temperature) {
		return Err(Error::Validation {
			message: "providers.reasoner.temperature must be in the range 0.0-2.0.".to_string(),
		});
	}
	if reasoner.timeout_ms == 0 {
		return Err(Error::Validation {
			message: "providers.reasoner.timeout_ms must be greater than zero.".to_string(),
		});
	}
	if cfg.agent.max_iterations == 0 || cfg.agent.max_iterations > MAX_ITERATIONS_CEILING {
		return Err(Error::Validation {
			message: format!("agent.max_iterations must be in the range 1-{MAX_ITERATIONS_CEILING}."),
		});
	}
	if cfg.agent.call_timeout_ms == 0 {
		return Err(Error::Validation {
			message: "agent.call_timeout_ms must be greater than zero.".to_string(),
		});
	}
	if cfg.agent.max_clarifications == 0 {
		return Err(Error::Validation {
			message: "agent.max_clarifications must be greater than zero.".to_string(),
		});
	}
	if cfg.agent.undo_depth == 0 {
		return Err(Error::Validation {
			message: "agent.undo_depth must be greater than zero.".to_string(),
		});
	}

	if let Some(org) = cfg.organization.as_ref()
		&& org.name.trim().is_empty()
	{
		return Err(Error::Validation {
			message: "organization.name must be non-empty when organization is set.".to_string(),
		});
	}

	Ok(())
}

fn normalize(cfg: &mut Config) {
	if cfg.agent.system_preamble.as_deref().map(|text| text.trim().is_empty()).unwrap_or(false) {
		cfg.agent.system_preamble = None;
	}
	if let Some(org) = cfg.organization.as_mut()
		&& org.specialty.as_deref().map(|text| text.trim().is_empty()).unwrap_or(false)
	{
		org.specialty = None;
	}
}
