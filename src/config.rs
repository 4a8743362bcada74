//! Server settings.
//!
//! Layered in this order, later layers winning: built-in defaults, a settings
//! file (the given path, or `dqt.toml` in the working directory when present),
//! then `DQT_*` environment variables (`DQT_BIND`, `DQT_BASE_URL`, `DQT_DATASET`,
//! `DQT_LOG`).

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::Result;

pub const ENV_PREFIX: &str = "DQT";
pub const DEFAULT_FILE: &str = "dqt.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    /// Address the HTTP server listens on.
    pub bind: String,
    /// Base url that file links are built under.
    pub base_url: String,
    /// JSON dataset served by the in-memory backend. Without one the study is empty.
    pub dataset: Option<PathBuf>,
    /// Default log filter, used when `RUST_LOG` is not set.
    pub log: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_owned(),
            base_url: "http://localhost/".to_owned(),
            dataset: None,
            log: "info".to_owned(),
        }
    }
}

impl Settings {
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let defaults = Settings::default();
        let mut builder = Config::builder()
            .set_default("bind", defaults.bind)?
            .set_default("base_url", defaults.base_url)?
            .set_default("log", defaults.log)?;
        builder = match file {
            Some(file) => builder.add_source(File::from(file)),
            None => builder.add_source(File::with_name(DEFAULT_FILE).required(false)),
        };
        let settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }
}
