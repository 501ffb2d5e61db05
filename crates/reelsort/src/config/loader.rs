use std::path::{Path, PathBuf};

use crate::config::schema::{Config, MAX_DURATION_SECS};
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

/// Default location of the configuration file (`<config dir>/reelsort/config.json`).
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("reelsort").join("config.json"))
        .ok_or(ConfigError::NoConfigDir)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    let roots = config.watched_roots();
    for (i, (root_a, dir_a)) in roots.iter().enumerate() {
        for (root_b, dir_b) in roots.iter().skip(i + 1) {
            if dir_a == dir_b {
                return Err(ConfigError::Validation {
                    message: format!(
                        "{} and {} roots share the directory '{}'",
                        root_a,
                        root_b,
                        dir_a.display()
                    ),
                });
            }
        }
    }

    // Placing files inside a watched root would feed them back in as new jobs
    let library = config.library_path();
    for (root, dir) in &roots {
        if library.starts_with(dir) {
            return Err(ConfigError::Validation {
                message: format!(
                    "library directory '{}' lies inside the {} root",
                    library.display(),
                    root
                ),
            });
        }
    }

    if let Some(sub) = &config.catch_all_subfolder {
        let sub_path = Path::new(sub);
        if sub.trim().is_empty() || sub_path.is_absolute() || sub.contains("..") {
            return Err(ConfigError::Validation {
                message: format!("catch_all_subfolder must be a relative folder: '{}'", sub),
            });
        }
    }

    for pattern in &config.watch.ignore_patterns {
        if let Err(e) = glob::Pattern::new(pattern) {
            return Err(ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            });
        }
    }

    let durations = [
        ("stall_threshold_secs", config.stall_threshold_secs),
        ("missing_grace_secs", config.missing_grace_secs),
        ("completed_grace_secs", config.completed_grace_secs),
    ];
    for (name, secs) in durations {
        if secs > MAX_DURATION_SECS {
            return Err(ConfigError::Validation {
                message: format!("{} must not exceed {} seconds", name, MAX_DURATION_SECS),
            });
        }
    }

    if config.tick_interval_ms == 0 || config.watch.poll_interval_secs == 0 {
        return Err(ConfigError::Validation {
            message: "tick and poll intervals must be positive".to_string(),
        });
    }

    Ok(())
}
