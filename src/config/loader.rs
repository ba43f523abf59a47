//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into a [`TunerConfig`], and run the
//! validation pass before returning. This is the entry point for loading the
//! tuner configuration at startup.
//!
//! ## Guarantees
//! - A successfully loaded config has always been through [`validation::validate`]
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message
//! - Validation findings never fail the load; they are returned and logged
//!
//! ## NOT Responsible For
//! - Defining the config schema (that belongs to `mod.rs`)
//! - Acting on findings (the optimizer disables defective coefficients)

use std::path::Path;

use tracing::warn;

use super::validation::{self, ConfigError, ConfigWarning};
use super::TunerConfig;

/// A parsed config together with the validation findings it produced.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The parsed configuration.
    pub config: TunerConfig,
    /// Every non-fatal finding, already logged at warn level.
    pub warnings: Vec<ConfigWarning>,
}

/// Load a [`TunerConfig`] from a TOML file.
///
/// # Arguments
///
/// * `path`: Path to the TOML configuration file.
///
/// # Returns
///
/// - `Ok(LoadedConfig)` if the file is readable and well-formed.
/// - `Err(ConfigError::Io)` if the file cannot be read.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```rust,ignore
/// use shooter_tuner::config::loader::load_from_file;
/// use std::path::Path;
///
/// let loaded = load_from_file(Path::new("tuner.toml"))?;
/// println!("{} coefficients", loaded.config.coefficients.len());
/// ```
pub fn load_from_file(path: &Path) -> Result<LoadedConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load a [`TunerConfig`] from a TOML string.
///
/// Useful for testing or embedding configs without file I/O.
///
/// # Arguments
///
/// * `content`: TOML content as a string.
/// * `source_name`: Identifier for the source (used in error messages).
///
/// # Errors
///
/// Returns `ConfigError::Parse` if the TOML is malformed.
///
/// # Panics
///
/// This function never panics.
pub fn load_from_str(content: &str, source_name: &str) -> Result<LoadedConfig, ConfigError> {
    let config: TunerConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    let warnings = validation::validate(&config);
    for w in &warnings {
        warn!(source = source_name, field = %w.field, value = %w.value, reason = %w.reason, "config warning");
    }

    Ok(LoadedConfig { config, warnings })
}
