use crate::config::IdentifyConfig;
use crate::error::{Error, Result};
use crate::labels::LabelVocabulary;
use crate::model::{ClassifierModel, ModelContract, ModelHandle, ModelSource, ScoreKind};
use crate::tensor::{OutputTensor, PreprocessedTensor, RawOutput};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex};

use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;

#[cfg(target_os = "windows")]
use ort::execution_providers::{DirectMLExecutionProvider, ExecutionProvider};
#[cfg(target_os = "windows")]
use std::path::PathBuf;

const SCORE_KIND_KEY: &str = "score_kind";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InferenceProvider {
    Cpu,
    DirectML { device_id: u32 },
}

impl InferenceProvider {
    pub fn label(self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::DirectML { .. } => "GPU (DirectML)",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderChoice {
    Auto,
    #[serde(alias = "cpuonly")]
    Cpu,
    #[serde(alias = "directmlonly")]
    DirectML,
}

#[derive(Debug, Clone, Copy)]
pub struct OrtRuntimeConfig {
    pub provider: ProviderChoice,
    pub device_id: Option<u32>,
}

#[cfg(target_os = "windows")]
fn resolve_ort_dylib_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("ORT_DYLIB_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }
    let exe = std::env::current_exe().ok()?;
    let candidate = exe.parent()?.join("onnxruntime").join("onnxruntime.dll");
    candidate.exists().then_some(candidate)
}

#[cfg(target_os = "windows")]
fn set_ort_dylib_path(dll_path: &Path) {
    std::env::set_var("ORT_DYLIB_PATH", dll_path);
    if let Some(dir) = dll_path.parent() {
        let mut paths = std::ffi::OsString::from(dir);
        paths.push(";");
        paths.push(std::env::var_os("PATH").unwrap_or_default());
        std::env::set_var("PATH", paths);
    }
}

fn locate_runtime() -> Result<()> {
    #[cfg(target_os = "windows")]
    {
        let dll_path = resolve_ort_dylib_path().ok_or_else(|| {
            Error::ResourceLoad("onnxruntime.dll not found; set ORT_DYLIB_PATH".into())
        })?;
        set_ort_dylib_path(&dll_path);
    }
    Ok(())
}

// With `load-dynamic` a missing runtime library surfaces as a panic.
fn guarded<T>(stage: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(res) => res,
        Err(_) => Err(Error::ResourceLoad(format!(
            "ONNX Runtime failed while {stage}; is the runtime library installed?"
        ))),
    }
}

fn load_error(err: impl std::fmt::Display) -> Error {
    Error::ResourceLoad(err.to_string())
}

fn ensure_environment() -> Result<()> {
    let committed = ort::init()
        .with_name("plant-identify")
        .commit()
        .map_err(|e| Error::ResourceLoad(format!("Failed to init ORT environment: {e}")))?;
    if committed {
        if let Ok(env) = ort::environment::get_environment() {
            env.set_log_level(ort::logging::LogLevel::Warning);
        }
    }
    Ok(())
}

fn open_session(model_path: &Path, directml: Option<u32>) -> Result<Session> {
    #[allow(unused_mut)]
    let mut builder = Session::builder()
        .map_err(load_error)?
        .with_optimization_level(GraphOptimizationLevel::Level1)
        .map_err(load_error)?
        .with_parallel_execution(false)
        .map_err(load_error)?;
    #[cfg(target_os = "windows")]
    if let Some(device_id) = directml {
        let ep = DirectMLExecutionProvider::default()
            .with_device_id(device_id as i32)
            .build();
        builder = builder
            .with_memory_pattern(false)
            .map_err(load_error)?
            .with_execution_providers([ep])
            .map_err(load_error)?;
    }
    #[cfg(not(target_os = "windows"))]
    let _ = directml;
    builder.commit_from_file(model_path).map_err(load_error)
}

#[cfg(target_os = "windows")]
fn directml_available() -> bool {
    catch_unwind(|| DirectMLExecutionProvider::default().is_available())
        .map(|res| matches!(res, Ok(true)))
        .unwrap_or(false)
}

#[cfg(not(target_os = "windows"))]
fn directml_available() -> bool {
    false
}

pub fn build_session(
    model_path: &Path,
    cfg: OrtRuntimeConfig,
) -> Result<(Session, InferenceProvider)> {
    if !model_path.exists() {
        return Err(Error::ResourceLoad(format!(
            "Model not found: {}",
            model_path.display()
        )));
    }
    locate_runtime()?;
    guarded("initialising the environment", ensure_environment)?;

    let device_id = cfg.device_id.unwrap_or(0);
    if cfg.provider != ProviderChoice::Cpu {
        if directml_available() {
            match guarded("building a DirectML session", || {
                open_session(model_path, Some(device_id))
            }) {
                Ok(session) => return Ok((session, InferenceProvider::DirectML { device_id })),
                Err(e) => log::warn!("DirectML session failed ({e}); retrying on CPU"),
            }
        } else {
            log::warn!("DirectML unavailable on this host; using CPU (device {device_id} ignored)");
        }
    }
    let session = guarded("building a CPU session", || open_session(model_path, None))?;
    Ok((session, InferenceProvider::Cpu))
}

pub fn ort_runtime_version() -> Option<String> {
    locate_runtime().ok()?;
    let info = catch_unwind(ort::info).ok()?;
    let version = match info.find("git-branch=rel-") {
        Some(start) => {
            let tail = &info[start + "git-branch=rel-".len()..];
            tail.split(',').next().unwrap_or(tail).to_string()
        }
        None => format!("1.{}.x", ort::MINOR_VERSION),
    };
    Some(version)
}

fn declared_score_kind(declared: Option<&str>, configured: ScoreKind) -> Result<ScoreKind> {
    let Some(value) = declared else {
        log::warn!("Model has no '{SCORE_KIND_KEY}' metadata; assuming {configured:?}");
        return Ok(configured);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "logits" => Ok(ScoreKind::Logits),
        "probabilities" | "softmax" => Ok(ScoreKind::Probabilities),
        other => Err(Error::ResourceLoad(format!(
            "Unrecognised '{SCORE_KIND_KEY}' metadata value '{other}'"
        ))),
    }
}

/// Accepts `[1|?, S|?, S|?, 3]`; unknown dimensions are reported as `<= 0`.
fn check_input_layout(dims: &[i64], size: u32) -> Result<()> {
    let size = size as i64;
    let matches = |dim: i64, want: i64| dim <= 0 || dim == want;
    if dims.len() != 4 {
        return Err(Error::ResourceLoad(format!(
            "Model input must be rank 4, got {dims:?}"
        )));
    }
    if dims[1] == 3 && dims[3] != 3 {
        return Err(Error::ResourceLoad(format!(
            "Model expects channels-first input {dims:?}; the pipeline produces [1, S, S, 3]"
        )));
    }
    if !matches(dims[0], 1) || !matches(dims[1], size) || !matches(dims[2], size) || !matches(dims[3], 3)
    {
        return Err(Error::ResourceLoad(format!(
            "Model input {dims:?} is incompatible with [1, {size}, {size}, 3]"
        )));
    }
    Ok(())
}

fn declared_classes(dims: &[i64]) -> Option<usize> {
    match dims {
        [n] | [_, n] if *n > 0 => Some(*n as usize),
        _ => None,
    }
}

pub struct OnnxClassifier {
    session: Mutex<Session>,
    input_name: String,
    output_names: Vec<String>,
    contract: ModelContract,
}

impl OnnxClassifier {
    pub fn load(
        model_path: &Path,
        input_size: u32,
        configured: ScoreKind,
        runtime: OrtRuntimeConfig,
    ) -> Result<Self> {
        log::info!("Loading classifier from {}", model_path.display());
        let (session, provider) = build_session(model_path, runtime)?;
        let input = session
            .inputs
            .first()
            .ok_or_else(|| Error::ResourceLoad("Model declares no inputs".into()))?;
        let input_name = input.name.clone();
        match input.input_type.tensor_shape() {
            Some(shape) => {
                let dims: Vec<i64> = shape.iter().copied().collect();
                check_input_layout(&dims, input_size)?;
            }
            None => log::warn!("Model input '{input_name}' has no tensor shape; skipping layout check"),
        }
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        if output_names.is_empty() {
            return Err(Error::ResourceLoad("Model declares no outputs".into()));
        }
        let classes = session
            .outputs
            .first()
            .and_then(|o| o.output_type.tensor_shape())
            .and_then(|shape| declared_classes(&shape.iter().copied().collect::<Vec<i64>>()));
        let metadata_kind = session
            .metadata()
            .ok()
            .and_then(|meta| meta.custom(SCORE_KIND_KEY).ok().flatten());
        let score_kind = declared_score_kind(metadata_kind.as_deref(), configured)?;
        log::info!(
            "Loaded classifier {} on {} ({} output(s), {} classes, {score_kind:?})",
            model_path.display(),
            provider.label(),
            output_names.len(),
            classes.map(|n| n.to_string()).unwrap_or_else(|| "unknown".into())
        );
        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_names,
            contract: ModelContract {
                input_size,
                score_kind,
                classes,
            },
        })
    }
}

impl ClassifierModel for OnnxClassifier {
    fn contract(&self) -> &ModelContract {
        &self.contract
    }

    fn run(&self, input: &PreprocessedTensor) -> Result<RawOutput> {
        let input_shape = input.shape();
        let tensor = TensorRef::from_array_view(input.view()).map_err(|e| {
            Error::Inference(format!("Failed to convert input tensor {input_shape:?}: {e}"))
        })?;
        let mut session = self
            .session
            .lock()
            .map_err(|_| Error::Inference("Session lock poisoned".into()))?;
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .map_err(|e| Error::Inference(format!("Forward pass failed: {e}")))?;

        let mut tensors = Vec::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let (shape, data) = outputs[name.as_str()]
                .try_extract_tensor::<f32>()
                .map_err(|e| Error::Inference(format!("Output '{name}' is not f32: {e}")))?;
            tensors.push(OutputTensor::new(shape.iter().copied().collect(), data.to_vec()));
        }
        if tensors.len() == 1 {
            if let Some(single) = tensors.pop() {
                return Ok(RawOutput::Single(single));
            }
        }
        Ok(RawOutput::Multi(tensors))
    }
}

pub struct OnnxSource {
    config: IdentifyConfig,
}

impl OnnxSource {
    pub fn new(config: IdentifyConfig) -> Self {
        Self { config }
    }

    pub fn expected_contract(&self) -> ModelContract {
        ModelContract {
            input_size: self.config.input_size,
            score_kind: self.config.score_kind,
            classes: None,
        }
    }
}

impl ModelSource for OnnxSource {
    fn load_model(&self) -> Result<ModelHandle> {
        let runtime = OrtRuntimeConfig {
            provider: self.config.provider,
            device_id: self.config.device_id,
        };
        let model = OnnxClassifier::load(
            &self.config.model_path,
            self.config.input_size,
            self.config.score_kind,
            runtime,
        )?;
        Ok(Arc::new(model))
    }

    fn load_labels(&self) -> Result<LabelVocabulary> {
        LabelVocabulary::load(&self.config.labels_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nhwc_layouts_with_dynamic_dims_are_accepted() {
        assert!(check_input_layout(&[1, 224, 224, 3], 224).is_ok());
        assert!(check_input_layout(&[-1, 224, 224, 3], 224).is_ok());
        assert!(check_input_layout(&[-1, -1, -1, 3], 224).is_ok());
    }

    #[test]
    fn incompatible_layouts_are_rejected() {
        assert!(check_input_layout(&[1, 3, 224, 224], 224).is_err());
        assert!(check_input_layout(&[1, 160, 160, 3], 224).is_err());
        assert!(check_input_layout(&[1, 224, 224], 224).is_err());
        assert!(check_input_layout(&[4, 224, 224, 3], 224).is_err());
    }

    #[test]
    fn class_count_comes_from_last_dim() {
        assert_eq!(declared_classes(&[1, 80]), Some(80));
        assert_eq!(declared_classes(&[80]), Some(80));
        assert_eq!(declared_classes(&[-1, -1]), None);
        assert_eq!(declared_classes(&[1, 7, 7, 80]), None);
    }

    #[test]
    fn score_kind_metadata_overrides_config() {
        assert_eq!(
            declared_score_kind(Some("Probabilities"), ScoreKind::Logits).unwrap(),
            ScoreKind::Probabilities
        );
        assert_eq!(
            declared_score_kind(Some(" logits "), ScoreKind::Probabilities).unwrap(),
            ScoreKind::Logits
        );
        assert_eq!(
            declared_score_kind(None, ScoreKind::Probabilities).unwrap(),
            ScoreKind::Probabilities
        );
        assert!(matches!(
            declared_score_kind(Some("sigmoid"), ScoreKind::Logits),
            Err(Error::ResourceLoad(_))
        ));
    }

    #[test]
    fn missing_model_is_a_load_error() {
        let source = OnnxSource::new(IdentifyConfig {
            model_path: std::env::temp_dir().join("plant_identify_missing.onnx"),
            ..IdentifyConfig::default()
        });
        assert!(matches!(source.load_model(), Err(Error::ResourceLoad(_))));
    }

    #[test]
    fn unloadable_model_is_a_load_error_not_a_panic() {
        let path = std::env::temp_dir().join("plant_identify_not_a_graph.onnx");
        std::fs::write(&path, b"definitely not protobuf").unwrap();
        let cfg = OrtRuntimeConfig {
            provider: ProviderChoice::Cpu,
            device_id: None,
        };
        let result = build_session(&path, cfg);
        let _ = std::fs::remove_file(&path);
        assert!(matches!(result, Err(Error::ResourceLoad(_))));
    }

    #[test]
    fn runtime_version_never_panics() {
        if let Some(version) = ort_runtime_version() {
            assert!(!version.is_empty());
        }
    }

    #[test]
    fn provider_choice_parses_from_config() {
        let choice: ProviderChoice = serde_json::from_str("\"directml\"").unwrap();
        assert_eq!(choice, ProviderChoice::DirectML);
        let choice: ProviderChoice = serde_json::from_str("\"cpu\"").unwrap();
        assert_eq!(choice, ProviderChoice::Cpu);
    }
}
