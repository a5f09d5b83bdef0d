//! Configuration document and component factories.
//!
//! The config file is a JSON document enumerating sources, filters,
//! recorders and the recognition endpoint. Variant selection is an
//! internally tagged enum per section, so an unknown `type` tag fails
//! deserialization instead of silently building the wrong thing.
//!
//! Runtime mutation goes through `ConfigStore`: the in-memory document is
//! edited under a lock and written back to disk with an explicit
//! `persist()` call, rather than re-reading the file on every change.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::detect::AlprClient;
use crate::filter::{mask::parse_shape, FilterHandle, FilterSpec};
use crate::ingest::{CaptureSource, SourceOrigin};
use crate::record::file::{FilePlateRecorder, DEFAULT_RETAIN_DAYS};
use crate::record::mqtt::{MqttPlateRecorder, MqttRecorderConfig};
use crate::record::sqlite::SqlitePlateRecorder;
use crate::record::PlateRecorder;

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_DB_FILE: &str = "plates.db";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
    #[serde(default)]
    pub recorders: Vec<RecorderConfig>,
    pub alpr: AlprConfig,
}

impl Config {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    File {
        name: String,
        capture_interval: f64,
        file: String,
        #[serde(default)]
        pre_input_args: Vec<String>,
        #[serde(default)]
        pre_output_args: Vec<String>,
        #[serde(default)]
        always_restart: bool,
    },
    Rtsp {
        name: String,
        capture_interval: f64,
        url: String,
        #[serde(default)]
        pre_input_args: Vec<String>,
        #[serde(default)]
        pre_output_args: Vec<String>,
        #[serde(default)]
        always_restart: bool,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FilterConfig {
    Motion {
        #[serde(default)]
        debug: bool,
    },
    Mask {
        #[serde(default)]
        debug: bool,
        #[serde(default)]
        shapes: Vec<String>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RecorderConfig {
    Sqlite {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        db_path: Option<PathBuf>,
    },
    Mqtt {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_topic: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    File {
        pattern: String,
        #[serde(default = "default_retain_days")]
        retain_days: u32,
    },
}

fn default_retain_days() -> u32 {
    DEFAULT_RETAIN_DAYS
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AlprConfig {
    pub url: String,
    #[serde(default = "default_country_code")]
    pub country_code: String,
}

fn default_country_code() -> String {
    "us".to_string()
}

/// Build a capture source from its config variant.
pub fn build_source(config: &SourceConfig) -> Result<CaptureSource> {
    match config {
        SourceConfig::File {
            name,
            capture_interval,
            file,
            pre_input_args,
            pre_output_args,
            always_restart,
        } => Ok(CaptureSource::new(
            name,
            *capture_interval,
            SourceOrigin::File { path: file.clone() },
        )?
        .with_pre_input_args(pre_input_args.clone())
        .with_pre_output_args(pre_output_args.clone())
        .with_always_restart(*always_restart)),
        SourceConfig::Rtsp {
            name,
            capture_interval,
            url,
            pre_input_args,
            pre_output_args,
            always_restart,
        } => {
            let url = url::Url::parse(url).with_context(|| format!("source {} url", name))?;
            Ok(
                CaptureSource::new(name, *capture_interval, SourceOrigin::Rtsp { url })?
                    .with_pre_input_args(pre_input_args.clone())
                    .with_pre_output_args(pre_output_args.clone())
                    .with_always_restart(*always_restart),
            )
        }
    }
}

/// Build a registry filter handle from its config variant.
pub fn build_filter(config: &FilterConfig) -> Result<FilterHandle> {
    match config {
        FilterConfig::Motion { debug } => Ok(FilterHandle::new(FilterSpec::Motion, *debug)),
        FilterConfig::Mask { debug, shapes } => {
            let shapes = shapes
                .iter()
                .map(|shape| parse_shape(shape))
                .collect::<Result<Vec<_>>>()?;
            Ok(FilterHandle::new(FilterSpec::Mask { shapes }, *debug))
        }
    }
}

/// Build a recorder sink from its config variant.
pub fn build_recorder(config: &RecorderConfig, data_dir: &Path) -> Result<Arc<dyn PlateRecorder>> {
    match config {
        RecorderConfig::Sqlite { db_path } => {
            let path = db_path
                .clone()
                .unwrap_or_else(|| data_dir.join(DEFAULT_DB_FILE));
            Ok(Arc::new(SqlitePlateRecorder::open(&path)?))
        }
        RecorderConfig::Mqtt {
            url,
            base_topic,
            client_id,
            username,
            password,
        } => {
            let mut mqtt = MqttRecorderConfig::new(url);
            if let Some(base_topic) = base_topic {
                mqtt.base_topic = base_topic.clone();
            }
            if let Some(client_id) = client_id {
                mqtt.client_id = client_id.clone();
            }
            mqtt.username = username.clone();
            mqtt.password = password.clone();
            Ok(Arc::new(MqttPlateRecorder::new(mqtt)?))
        }
        RecorderConfig::File {
            pattern,
            retain_days,
        } => Ok(Arc::new(FilePlateRecorder::new(
            data_dir,
            pattern,
            *retain_days,
        )?)),
    }
}

/// Build the recognition client.
pub fn build_detector(config: &AlprConfig) -> Result<AlprClient> {
    let url = url::Url::parse(&config.url).context("alpr url")?;
    Ok(AlprClient::new(url).with_country_code(&config.country_code))
}

/// In-memory configuration with explicit persistence back to its file.
pub struct ConfigStore {
    path: PathBuf,
    document: Mutex<Config>,
}

impl ConfigStore {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let document: Config = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            document: Mutex::new(document),
        })
    }

    pub fn snapshot(&self) -> Config {
        self.document.lock().expect("config lock").clone()
    }

    /// Edit the in-memory document. Call `persist()` to write it back.
    pub fn update(&self, edit: impl FnOnce(&mut Config)) {
        edit(&mut self.document.lock().expect("config lock"));
    }

    pub fn persist(&self) -> Result<()> {
        let document = self.snapshot();
        let raw = serde_json::to_string_pretty(&document)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("write config file {}", self.path.display()))?;
        Ok(())
    }
}
