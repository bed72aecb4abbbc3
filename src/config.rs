use std::path::Path;

use chrono::{DateTime, Utc};
use config::{Config, Environment, File as ConfigFile};
use serde::Deserialize;

use crate::error::Result;
use crate::filter::FilterOptions;

/// Engine settings, read from an optional `covstore.toml` and `COVSTORE_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Probability in `[0, 1]` that a loaded report runs the accelerated
    /// analyzer alongside the reference computation.
    pub analyzer_sample_rate: f64,
    pub use_session_totals: bool,
    pub session_totals_cutover: Option<DateTime<Utc>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            analyzer_sample_rate: 0.0,
            use_session_totals: false,
            session_totals_cutover: None,
        }
    }
}

impl EngineConfig {
    /// Load settings. An explicit `path` must exist; otherwise `covstore.*`
    /// in the working directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<EngineConfig> {
        let file = match path {
            Some(path) => ConfigFile::from(path).required(true),
            None => ConfigFile::with_name("covstore").required(false),
        };
        let config = Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix("COVSTORE").try_parsing(true))
            .build()?;
        Ok(config.try_deserialize::<EngineConfig>()?)
    }

    pub fn filter_options(&self) -> FilterOptions {
        FilterOptions {
            use_session_totals: self.use_session_totals,
            session_totals_cutover: self.session_totals_cutover,
        }
    }
}
