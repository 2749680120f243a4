use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{
    DEFAULT_CONFIG_FILE, DEFAULT_CUSTOMERS_PATH, DEFAULT_PRODUCTS_PATH, DEFAULT_SALES_PATH,
    DEFAULT_STORE_PATH,
};
use crate::error::{EtlError, Result};

/// Run configuration. Every section is optional in the TOML file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub inputs: InputConfig,
    pub store: StoreConfig,
    pub date_dimension: DateDimensionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub customers: PathBuf,
    pub products: PathBuf,
    pub sales: PathBuf,
    /// Field delimiter shared by all three files
    pub delimiter: char,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            customers: PathBuf::from(DEFAULT_CUSTOMERS_PATH),
            products: PathBuf::from(DEFAULT_PRODUCTS_PATH),
            sales: PathBuf::from(DEFAULT_SALES_PATH),
            delimiter: ',',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Where the JSON run report goes. Defaults to `<store stem>_report.json`
    /// next to the store.
    pub report: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_STORE_PATH),
            report: None,
        }
    }
}

/// Bounds of the date dimension. Missing bounds come from the loaded sales.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DateDimensionConfig {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl PipelineConfig {
    /// Load from `explicit` if given, otherwise from `keylime.toml` in the
    /// working directory when present, otherwise built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)
                } else {
                    debug!("No config file found, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            EtlError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `KEYLIME_*` overrides from the process environment.
    pub fn with_env(self) -> Self {
        self.with_env_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty()).map(PathBuf::from);
        if let Some(path) = var("KEYLIME_CUSTOMERS") {
            self.inputs.customers = path;
        }
        if let Some(path) = var("KEYLIME_PRODUCTS") {
            self.inputs.products = path;
        }
        if let Some(path) = var("KEYLIME_SALES") {
            self.inputs.sales = path;
        }
        if let Some(path) = var("KEYLIME_STORE") {
            self.store.path = path;
        }
        if let Some(path) = var("KEYLIME_REPORT") {
            self.store.report = Some(path);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.inputs.delimiter.is_ascii() {
            return Err(EtlError::Config(format!(
                "delimiter must be a single ASCII character, got '{}'",
                self.inputs.delimiter
            )));
        }
        if self.store.path.as_os_str().is_empty() {
            return Err(EtlError::Config("store path is empty".to_string()));
        }
        if let (Some(start), Some(end)) = (self.date_dimension.start, self.date_dimension.end) {
            if start > end {
                return Err(EtlError::Config(format!(
                    "date_dimension start {start} is after end {end}"
                )));
            }
        }
        Ok(())
    }

    pub fn delimiter(&self) -> u8 {
        self.inputs.delimiter as u8
    }

    pub fn report_path(&self) -> PathBuf {
        if let Some(report) = &self.store.report {
            return report.clone();
        }
        let stem = self
            .store
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "keylime".to_string());
        self.store.path.with_file_name(format!("{stem}_report.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.inputs.sales, PathBuf::from("data/raw/sales.csv"));
        assert_eq!(config.store.path, PathBuf::from("data/dw/keylime_sales.db"));
        assert_eq!(config.report_path(), PathBuf::from("data/dw/keylime_sales_report.json"));
        assert_eq!(config.delimiter(), b',');
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [store]
            path = "out/dw.db"

            [date_dimension]
            start = "2024-01-01"
            "#,
        )
        .unwrap();
        assert_eq!(config.store.path, PathBuf::from("out/dw.db"));
        assert_eq!(config.inputs.customers, PathBuf::from("data/raw/customers.csv"));
        assert_eq!(config.date_dimension.start, NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(config.date_dimension.end, None);
        assert_eq!(config.report_path(), PathBuf::from("out/dw_report.json"));
    }

    #[test]
    fn test_malformed_toml_is_config_invalid() {
        let err = PipelineConfig::from_toml_str("[store\npath = 1").unwrap_err();
        assert_eq!(err.code(), "CONFIG_INVALID");
    }

    #[test]
    fn test_missing_explicit_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = PipelineConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, EtlError::Config(_)));
    }

    #[test]
    fn test_env_overrides_file_values() {
        let env: HashMap<&str, &str> = [("KEYLIME_SALES", "elsewhere/sales.csv"), ("KEYLIME_STORE", "  ")]
            .into_iter()
            .collect();
        let config = PipelineConfig::default().with_env_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.inputs.sales, PathBuf::from("elsewhere/sales.csv"));
        // Blank values are ignored
        assert_eq!(config.store.path, PathBuf::from(DEFAULT_STORE_PATH));
    }

    #[test]
    fn test_validate_rejects_inverted_range_and_wide_delimiter() {
        let mut config = PipelineConfig::default();
        config.date_dimension.start = NaiveDate::from_ymd_opt(2024, 2, 1);
        config.date_dimension.end = NaiveDate::from_ymd_opt(2024, 1, 1);
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.inputs.delimiter = '§';
        assert!(config.validate().is_err());
    }
}
