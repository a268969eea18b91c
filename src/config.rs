use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub model: ModelConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_max_upload_bytes() -> usize {
    16 * 1024 * 1024
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub model_dir: PathBuf,
    pub onnx_file: String,
    #[serde(default = "default_model_instances")]
    pub num_instances: usize,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
}

fn default_model_instances() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_input_size() -> u32 {
    640
}

fn default_iou_threshold() -> f32 {
    0.7
}

impl ModelConfig {
    pub fn get_path(&self) -> PathBuf {
        self.model_dir.join(&self.onnx_file)
    }
}

/// What the pipeline keeps from the raw model output and how it is rendered.
#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default)]
    pub target_class_id: usize,
    #[serde(default = "default_target_class_label")]
    pub target_class_label: String,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_confidence_threshold() -> f32 {
    0.5
}

fn default_target_class_label() -> String {
    "person".to_string()
}

fn default_jpeg_quality() -> u8 {
    95
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            target_class_id: 0,
            target_class_label: default_target_class_label(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArtifactsConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub retention: RetentionConfig,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("static/outputs")
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            retention: RetentionConfig::default(),
        }
    }
}

/// Pruning policy for persisted artifacts. With both limits unset nothing is
/// ever deleted.
#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    #[serde(default)]
    pub max_artifacts: Option<usize>,
    #[serde(default)]
    pub max_age_secs: Option<u64>,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_artifacts: None,
            max_age_secs: None,
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl RetentionConfig {
    pub fn is_enabled(&self) -> bool {
        self.max_artifacts.is_some() || self.max_age_secs.is_some()
    }
}

pub trait Validatable {
    fn validate(&self) -> Result<(), String>;
}

impl Validatable for ModelConfig {
    fn validate(&self) -> Result<(), String> {
        if !self.get_path().exists() {
            return Err(format!("Model file not found: {:?}", self.get_path()));
        }
        if self.num_instances == 0 {
            return Err("model.num_instances must be at least 1".to_string());
        }
        Ok(())
    }
}

impl Validatable for DetectionConfig {
    fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(format!(
                "detection.confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(format!(
                "detection.jpeg_quality must be within [1, 100], got {}",
                self.jpeg_quality
            ));
        }
        Ok(())
    }
}

impl Validatable for RetentionConfig {
    fn validate(&self) -> Result<(), String> {
        if self.is_enabled() && self.sweep_interval_secs == 0 {
            return Err("artifacts.retention.sweep_interval_secs must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("current directory: {}", e)))?;

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    load_configuration(&base_path.join("configuration"), &environment)
}

pub fn load_configuration(
    configuration_directory: &Path,
    environment: &Environment,
) -> Result<Config, config::ConfigError> {
    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    config
        .detection
        .validate()
        .and_then(|_| config.artifacts.retention.validate())
        .map_err(config::ConfigError::Message)?;

    Ok(config)
}
