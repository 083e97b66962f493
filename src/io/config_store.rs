//! Run-config persistence (YAML or JSON by file extension)

use crate::config::RunConfig;
use crate::error::{Error, Result};
use std::path::Path;

/// File name of the persisted config inside the run directory
pub const CONFIG_FILE: &str = "config.yaml";

/// Text formats a run config can be stored in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// Detect format from file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            _ => None,
        }
    }

    fn from_path(path: &Path) -> Result<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
            .ok_or_else(|| {
                Error::config(format!(
                    "unsupported config file '{}' (expected .yaml, .yml or .json)",
                    path.display()
                ))
            })
    }
}

/// Read a run config; a malformed file is a configuration error
pub fn load_run_config(path: impl AsRef<Path>) -> Result<RunConfig> {
    let path = path.as_ref();
    let format = ConfigFormat::from_path(path)?;
    let text = std::fs::read_to_string(path)?;
    match format {
        ConfigFormat::Json => serde_json::from_str(&text)
            .map_err(|e| Error::config(format!("{}: {e}", path.display()))),
        ConfigFormat::Yaml => serde_yaml::from_str(&text)
            .map_err(|e| Error::config(format!("{}: {e}", path.display()))),
    }
}

/// Write a run config, creating parent directories
pub fn save_run_config(config: &RunConfig, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let text = match ConfigFormat::from_path(path)? {
        ConfigFormat::Json => serde_json::to_string_pretty(config)
            .map_err(|e| Error::Serialization(format!("JSON serialization failed: {e}")))?,
        ConfigFormat::Yaml => serde_yaml::to_string(config)
            .map_err(|e| Error::Serialization(format!("YAML serialization failed: {e}")))?,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, text)?;
    Ok(())
}

/// Pretty JSON dump of a config for the log stream
pub fn config_dump(config: &RunConfig) -> Result<String> {
    serde_json::to_string_pretty(config)
        .map_err(|e| Error::Serialization(format!("JSON serialization failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::resolve;

    fn config() -> RunConfig {
        let mut config = RunConfig::new("biased_mnist", "/data", "/runs", "store");
        config.random_seed = Some(42);
        resolve(&config).unwrap()
    }

    #[test]
    fn test_yaml_and_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["run.yaml", "run.yml", "run.json"] {
            let path = dir.path().join("nested").join(name);
            save_run_config(&config(), &path).unwrap();
            assert_eq!(load_run_config(&path).unwrap(), config(), "{name}");
        }
    }

    #[test]
    fn test_unknown_extension() {
        let err = save_run_config(&config(), "/tmp/run.toml").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(ConfigFormat::from_extension("YML"), Some(ConfigFormat::Yaml));
    }

    #[test]
    fn test_malformed_file_is_configuration_error() {
        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        std::fs::write(file.path(), "dataset_name: [unterminated").unwrap();
        assert!(matches!(
            load_run_config(file.path()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_dump_contains_fields() {
        let dump = config_dump(&config()).unwrap();
        assert!(dump.contains("\"bias_predictor_in_layer\": \"pooled2\""));
    }
}
