use crate::error::{Error, Result};
use crate::model::ScoreKind;
use crate::onnx::ProviderChoice;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Local,
    Remote,
}

impl ExecutionMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" | "onnx" => Some(Self::Local),
            "remote" | "server" => Some(Self::Remote),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifyConfig {
    pub model_path: PathBuf,
    pub labels_path: PathBuf,
    pub input_size: u32,
    pub top_k: usize,
    pub score_kind: ScoreKind,
    pub mode: ExecutionMode,
    pub remote_url: String,
    pub remote_timeout_secs: u64,
    pub provider: ProviderChoice,
    pub device_id: Option<u32>,
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/simple_mobilenet_classifier/model.onnx"),
            labels_path: PathBuf::from("models/simple_mobilenet_classifier/labels.json"),
            input_size: 224,
            top_k: 3,
            score_kind: ScoreKind::Logits,
            mode: ExecutionMode::Local,
            remote_url: crate::remote::DEFAULT_SERVICE_URL.to_string(),
            remote_timeout_secs: 30,
            provider: ProviderChoice::Auto,
            device_id: None,
        }
    }
}

impl IdentifyConfig {
    /// Reads a JSON config file. Missing fields keep their defaults; relative
    /// resource paths are taken relative to the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        let mut config: Self = serde_json::from_str(&data)?;
        if let Some(root) = path.parent() {
            config = config.with_resource_root(root);
        }
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then `config_file` if given, then `PLANT_ID_*` environment overrides.
    pub fn discover(config_file: Option<&Path>) -> Result<Self> {
        let mut config = match config_file {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup("PLANT_ID_MODE") {
            match ExecutionMode::parse(&mode) {
                Some(parsed) => self.mode = parsed,
                None => log::warn!("Ignoring unknown PLANT_ID_MODE value: {mode}"),
            }
        }
        if let Some(path) = lookup("PLANT_ID_MODEL") {
            self.model_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("PLANT_ID_LABELS") {
            self.labels_path = PathBuf::from(path);
        }
        if let Some(url) = lookup("PLANT_ID_REMOTE_URL") {
            self.remote_url = url;
        }
        if let Some(k) = lookup("PLANT_ID_TOP_K") {
            match k.trim().parse::<usize>() {
                Ok(k) => self.top_k = k,
                Err(_) => log::warn!("Ignoring non-numeric PLANT_ID_TOP_K value: {k}"),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 {
            return Err(Error::Config("input_size must be positive".into()));
        }
        if self.top_k == 0 {
            return Err(Error::Config("top_k must be positive".into()));
        }
        if self.remote_url.trim().is_empty() {
            return Err(Error::Config("remote_url must not be empty".into()));
        }
        Ok(())
    }

    fn with_resource_root(mut self, root: &Path) -> Self {
        self.model_path = resolve_resource(root, &self.model_path);
        self.labels_path = resolve_resource(root, &self.labels_path);
        self
    }
}

fn resolve_resource(root: &Path, name: &Path) -> PathBuf {
    if name.is_absolute() {
        name.to_path_buf()
    } else {
        root.join(name)
    }
}
