//! Configuration loading and XDG path helpers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::progress::TrickleConfig;

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub archive: ArchiveConfig,
    pub engine: EngineConfig,
    pub ingest: IngestConfig,
    pub thumbnails: ThumbnailConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Idle subscriber streams are closed after this many seconds without
    /// an event.
    pub subscribe_idle_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    pub base_url: String,
    pub index: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    pub max_concurrent_jobs: usize,
    pub trickle_initial_delay_ms: u64,
    pub trickle_delay_increment_ms: u64,
}

impl IngestConfig {
    pub fn trickle(&self) -> TrickleConfig {
        TrickleConfig {
            initial_delay: Duration::from_millis(self.trickle_initial_delay_ms),
            delay_increment: Duration::from_millis(self.trickle_delay_increment_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ThumbnailConfig {
    pub dir: PathBuf,
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    load_from(&settings_path()?)
}

fn load_from(settings: &Path) -> Result<AppConfig, AppConfigError> {
    let default_thumbs = default_thumbnail_dir()?;
    let builder = Config::builder()
        .set_default("server.listen_addr", "127.0.0.1:8080")?
        .set_default("server.subscribe_idle_secs", 120_i64)?
        .set_default("archive.base_url", "http://localhost:8042/dicom-web")?
        .set_default("archive.timeout_secs", 30_i64)?
        .set_default("engine.base_url", "http://localhost:9200")?
        .set_default("engine.index", "studies")?
        .set_default("engine.timeout_secs", 30_i64)?
        .set_default("ingest.max_concurrent_jobs", 4_i64)?
        .set_default("ingest.trickle_initial_delay_ms", 500_i64)?
        .set_default("ingest.trickle_delay_increment_ms", 250_i64)?
        .set_default(
            "thumbnails.dir",
            default_thumbs.to_string_lossy().to_string(),
        )?
        .add_source(File::from(settings).required(false))
        .add_source(Environment::with_prefix("AKTINA").separator("__"));

    let cfg = builder.build()?.try_deserialize()?;
    Ok(cfg)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("dev", "aktina", "aktina").ok_or(AppConfigError::MissingProjectDirs)
}

/// Optional settings file, anchored under the XDG config directory rather
/// than the process working directory. Any extension the `config` crate
/// understands is picked up.
pub fn settings_path() -> Result<PathBuf, AppConfigError> {
    Ok(project_dirs()?.config_dir().join("settings"))
}

fn default_thumbnail_dir() -> Result<PathBuf, AppConfigError> {
    Ok(project_dirs()?.cache_dir().join("thumbnails"))
}
