use std::collections::BTreeSet;

use super::*;

/// Upper bound for request, connect and drain timeouts
pub const MAX_TIMEOUT_MS: u64 = 60 * 60 * 1000;

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &BenchConfig) -> ConfigResult<()> {
        Self::validate_services(config)?;
        Self::validate_pipeline(config)?;
        Self::validate_inputs(config)?;
        Self::validate_run_settings(config)?;
        Self::validate_pacing(&config.pacing)?;
        Self::validate_metrics(config)?;
        Self::validate_log(&config.log)?;
        Ok(())
    }

    fn validate_services(config: &BenchConfig) -> ConfigResult<()> {
        if config.services.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "services".to_string(),
            });
        }
        for (name, addresses) in &config.services {
            if name.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "services".to_string(),
                    value: String::new(),
                    reason: "Service name cannot be empty".to_string(),
                });
            }
            if addresses.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("services.{}", name),
                    value: "[]".to_string(),
                    reason: "At least one address is required".to_string(),
                });
            }
            if let Some(blank) = addresses.iter().find(|a| a.trim().is_empty()) {
                return Err(ConfigError::InvalidValue {
                    field: format!("services.{}", name),
                    value: blank.clone(),
                    reason: "Address cannot be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    fn validate_pipeline(config: &BenchConfig) -> ConfigResult<()> {
        if config.pipeline.entries.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "pipeline.entries".to_string(),
            });
        }
        let graph = config
            .stage_graph()
            .map_err(|e| ConfigError::ValidationFailed {
                reason: e.to_string(),
            })?;
        let mut unknown: Vec<&str> = graph
            .services()
            .into_iter()
            .filter(|s| !config.services.contains_key(*s))
            .collect();
        unknown.sort_unstable();
        if !unknown.is_empty() {
            return Err(ConfigError::IncompatibleConfig {
                reason: format!(
                    "Pipeline uses services with no configured addresses: {}",
                    unknown.join(", ")
                ),
            });
        }
        Ok(())
    }

    fn validate_inputs(config: &BenchConfig) -> ConfigResult<()> {
        let entries: BTreeSet<&str> = config
            .pipeline
            .entries
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        for entry in &entries {
            match config.inputs.sizes.get(*entry) {
                None => {
                    return Err(ConfigError::MissingRequired {
                        field: format!("inputs.sizes.{}", entry),
                    });
                }
                Some(0) => {
                    return Err(ConfigError::InvalidValue {
                        field: format!("inputs.sizes.{}", entry),
                        value: "0".to_string(),
                        reason: "Input length must be > 0".to_string(),
                    });
                }
                Some(_) => {}
            }
        }
        if let Some(extra) = config
            .inputs
            .sizes
            .keys()
            .find(|k| !entries.contains(k.as_str()))
        {
            return Err(ConfigError::IncompatibleConfig {
                reason: format!("inputs.sizes names {}, which is not an entry stage", extra),
            });
        }
        if config.inputs.pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "inputs.pool_size".to_string(),
                value: "0".to_string(),
                reason: "Must be > 0".to_string(),
            });
        }
        Ok(())
    }

    fn validate_run_settings(config: &BenchConfig) -> ConfigResult<()> {
        let positive = [
            ("trial_length", config.trial_length as u64),
            ("num_trials", config.num_trials as u64),
            ("num_clients", config.num_clients as u64),
            ("request_timeout_ms", config.request_timeout_ms),
            ("connect_timeout_ms", config.connect_timeout_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.to_string(),
                    reason: "Must be > 0".to_string(),
                });
            }
        }
        let timeouts = [
            ("request_timeout_ms", config.request_timeout_ms),
            ("connect_timeout_ms", config.connect_timeout_ms),
            ("drain_timeout_ms", config.drain_timeout_ms),
        ];
        for (field, value) in timeouts {
            if value > MAX_TIMEOUT_MS {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.to_string(),
                    reason: format!("Must be at most {}", MAX_TIMEOUT_MS),
                });
            }
        }
        if config.duration_secs == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "duration_secs".to_string(),
                value: "0".to_string(),
                reason: "Must be > 0 when set".to_string(),
            });
        }
        if config.slo_millis == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "slo_millis".to_string(),
                value: "0".to_string(),
                reason: "Must be > 0 when set".to_string(),
            });
        }
        Ok(())
    }

    fn validate_pacing(pacing: &PacingConfig) -> ConfigResult<()> {
        if let PacingConfig::Trace { path } = pacing
            && path.trim().is_empty()
        {
            return Err(ConfigError::MissingRequired {
                field: "pacing.path".to_string(),
            });
        }
        Ok(())
    }

    fn validate_metrics(config: &BenchConfig) -> ConfigResult<()> {
        if let Some(url) = &config.metrics_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            return Err(ConfigError::InvalidValue {
                field: "metrics_url".to_string(),
                value: url.clone(),
                reason: "Must be an http:// or https:// URL".to_string(),
            });
        }
        Ok(())
    }

    fn validate_log(log: &LogSettings) -> ConfigResult<()> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&log.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "log.level".to_string(),
                value: log.level.clone(),
                reason: format!("Must be one of {}", LEVELS.join(", ")),
            });
        }
        Ok(())
    }
}
