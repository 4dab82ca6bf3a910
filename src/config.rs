use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::core::ConfigError;

// ---------- Recorder ----------
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RecorderConfig {
    pub url: String,
    pub recordings_dir: PathBuf,
    pub chunk_duration_secs: u64,
    pub connect_timeout_secs: u64,
    pub session_timeout_secs: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            recordings_dir: PathBuf::from("recordings"),
            chunk_duration_secs: 8,
            connect_timeout_secs: 10,
            session_timeout_secs: 60,
        }
    }
}

impl RecorderConfig {
    pub fn chunk_duration(&self) -> Duration {
        Duration::from_secs(self.chunk_duration_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.url.trim().is_empty() {
            bail!("recorder.url must not be empty");
        }
        let parsed = url::Url::parse(&self.url)
            .with_context(|| format!("recorder.url '{}' is not a valid url", self.url))?;
        if parsed.scheme() != "rtsp" {
            bail!("recorder.url must use the rtsp scheme, got '{}'", parsed.scheme());
        }
        if self.recordings_dir.as_os_str().is_empty() {
            bail!("recorder.recordings_dir must not be empty");
        }
        if self.chunk_duration_secs == 0 {
            bail!("recorder.chunk_duration_secs must be > 0");
        }
        if self.connect_timeout_secs == 0 {
            bail!("recorder.connect_timeout_secs must be > 0");
        }
        if self.session_timeout_secs < 2 {
            bail!("recorder.session_timeout_secs must be >= 2");
        }
        Ok(())
    }
}

// ---------- Storer ----------
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct StorerConfig {
    pub size_limit_bytes: u64,
    pub check_period_secs: u64,
    pub backup_dir: Option<PathBuf>,
}

impl Default for StorerConfig {
    fn default() -> Self {
        Self {
            size_limit_bytes: 10 * 1024 * 1024 * 1024,
            check_period_secs: 60,
            backup_dir: None,
        }
    }
}

impl StorerConfig {
    pub fn check_period(&self) -> Duration {
        Duration::from_secs(self.check_period_secs)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.size_limit_bytes == 0 {
            bail!("storer.size_limit_bytes must be > 0");
        }
        if self.check_period_secs == 0 {
            bail!("storer.check_period_secs must be > 0");
        }
        if let Some(ref dir) = self.backup_dir {
            if dir.as_os_str().is_empty() {
                bail!("storer.backup_dir must not be empty when set");
            }
        }
        Ok(())
    }
}

// ---------- Recognizer ----------
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RecognizerConfig {
    pub enabled: bool,
    pub thumbs_dir: PathBuf,
    pub context_label: String,
    pub every_nth: u32,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            thumbs_dir: PathBuf::from("thumbs"),
            context_label: "keyframe".to_string(),
            every_nth: 25,
        }
    }
}

impl RecognizerConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.thumbs_dir.as_os_str().is_empty() {
            bail!("recognizer.thumbs_dir must not be empty");
        }
        if self.context_label.trim().is_empty() {
            bail!("recognizer.context_label must not be empty");
        }
        if self.every_nth == 0 {
            bail!("recognizer.every_nth must be > 0");
        }
        Ok(())
    }
}

// ---------- Indexer ----------
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct IndexerConfig {
    pub index_path: PathBuf,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            index_path: PathBuf::from("index.jsonl"),
        }
    }
}

// ---------- Channels ----------
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ChannelConfig {
    pub segment: usize,
    pub frames: usize,
    pub recognition: usize,
    pub cleaned: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            segment: 5,
            frames: 10,
            recognition: 5,
            cleaned: 5,
        }
    }
}

impl ChannelConfig {
    fn validate(&self) -> anyhow::Result<()> {
        for (name, cap) in [
            ("segment", self.segment),
            ("frames", self.frames),
            ("recognition", self.recognition),
            ("cleaned", self.cleaned),
        ] {
            if cap == 0 {
                bail!("channels.{} must be > 0", name);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub storer: StorerConfig,
    #[serde(default)]
    pub recognizer: RecognizerConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub channels: ChannelConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ConfigError::with_context(format!("read config {}", path.display()), e)
        })?;
        Self::parse(&content)
            .with_context(|| format!("load config {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ConfigError::with_context("parse toml", e))?;
        config.validate().context("config validation failed")?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.recorder.validate()?;
        self.storer.validate()?;
        self.recognizer.validate()?;
        if self.indexer.index_path.as_os_str().is_empty() {
            bail!("indexer.index_path must not be empty");
        }
        self.channels.validate()?;

        if let Some(ref backup) = self.storer.backup_dir {
            if backup == &self.recorder.recordings_dir {
                bail!("storer.backup_dir must differ from recorder.recordings_dir");
            }
        }
        Ok(())
    }
}
