//! Model loading: hub artifacts, ONNX Runtime session, tokenizer.

use crate::cache::CacheLocation;
use crate::error::{Error, Result};
use crate::generate::{
    DEFAULT_SAMPLE_RATE, ModelInputs, SpeechModel, TextProcessor, Waveform, first_waveform,
};
use crate::hub::{HubConfig, RepoSnapshot, safe_file_name};
use once_cell::sync::OnceCell;
use ort::{
    ep::{self, ExecutionProvider},
    inputs,
    session::{Session, builder::GraphOptimizationLevel},
    value::Tensor,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

pub const DEFAULT_REPO_ID: &str = "FabioSarracino/VibeVoice-Large-Q8";
const DEFAULT_DOWNLOAD_GB: f32 = 11.6;
const CONFIG_FILE: &str = "config.json";
const MODEL_TYPE: &str = "ONNX";

static ORT_INIT: OnceCell<()> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Bf16,
    Fp16,
    Fp32,
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bf16 => "bf16",
            Self::Fp16 => "fp16",
            Self::Fp32 => "fp32",
        })
    }
}

/// Options for a single load. Device placement is always automatic: CUDA
/// when the execution provider is usable, ORT's CPU kernels otherwise.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub repo_id: String,
    pub revision: String,
    /// Permit loading the native custom-op library shipped by the repository.
    pub trust_remote_code: bool,
    pub precision: Precision,
}

impl LoadOptions {
    /// The fixed configuration the CLI loads with.
    pub fn pinned(repo_id: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
            revision: revision.into(),
            trust_remote_code: true,
            precision: Precision::Bf16,
        }
    }

    /// Repository name without the owner, used for the cache presence check.
    pub fn model_name(&self) -> &str {
        self.repo_id
            .rsplit_once('/')
            .map_or(self.repo_id.as_str(), |(_, name)| name)
    }

    fn download_notice(&self) -> String {
        if self.repo_id == DEFAULT_REPO_ID {
            format!(
                "Model not in cache - downloading ~{DEFAULT_DOWNLOAD_GB} GB (this may take several minutes)..."
            )
        } else {
            "Model not in cache - downloading model files (this may take several minutes)..."
                .to_string()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrtRuntimeConfig {
    pub ort_lib: Option<PathBuf>,
    pub cuda_lib_dir: Option<PathBuf>,
    pub cudnn_lib_dir: Option<PathBuf>,
}

/// Repository manifest (`config.json`) describing the exported graph.
#[derive(Debug, Deserialize)]
pub struct ModelConfig {
    #[serde(rename = "type")]
    model_type: String,
    model_files: BTreeMap<Precision, String>,
    #[serde(default)]
    external_data: Vec<String>,
    tokenizer: String,
    custom_ops: Option<String>,
    #[serde(default = "default_sample_rate")]
    sample_rate: u32,
    audio_output: Option<String>,
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

impl ModelConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("failed reading config at {}", path.display()), e))?;
        Self::parse(path, &raw)
    }

    fn parse(path: &Path, raw: &str) -> Result<Self> {
        let invalid = |message: String| Error::Config {
            path: path.to_path_buf(),
            message,
        };
        let config: Self = serde_json::from_str(raw).map_err(|e| invalid(e.to_string()))?;

        if config.model_type != MODEL_TYPE {
            return Err(invalid(format!(
                "unsupported model type '{}': expected {MODEL_TYPE}",
                config.model_type
            )));
        }
        if config.sample_rate == 0 {
            return Err(invalid("sample_rate must be positive".to_string()));
        }
        for name in config
            .model_files
            .values()
            .chain(&config.external_data)
            .chain(std::iter::once(&config.tokenizer))
            .chain(&config.custom_ops)
        {
            safe_file_name(name)?;
        }
        Ok(config)
    }

    pub fn model_file(&self, precision: Precision) -> Result<&str> {
        self.model_files
            .get(&precision)
            .map(String::as_str)
            .ok_or_else(|| Error::Config {
                path: PathBuf::from(CONFIG_FILE),
                message: format!("no {precision} graph listed in model_files"),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cuda(i32),
    Cpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cuda(id) => write!(f, "cuda:{id}"),
            Self::Cpu => f.write_str("cpu"),
        }
    }
}

/// ONNX Runtime session wrapping the exported speech model.
pub struct OnnxSpeechModel {
    session: Session,
    device: Device,
    sample_rate: u32,
    audio_output: Option<String>,
}

impl OnnxSpeechModel {
    fn load(model_path: &Path, custom_ops: Option<&Path>, config: &ModelConfig) -> Result<Self> {
        let (session, device) = with_cpu_fallback(select_device(), |device| {
            build_session(model_path, custom_ops, device)
        })?;

        Ok(Self {
            session,
            device,
            sample_rate: config.sample_rate,
            audio_output: config.audio_output.clone(),
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }
}

impl SpeechModel for OnnxSpeechModel {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn generate(&mut self, prompt: &ModelInputs) -> Result<Waveform> {
        let len = prompt.input_ids.len();
        let input_ids =
            Tensor::from_array(([1usize, len], prompt.input_ids.clone())).map_err(runtime_err)?;
        let attention_mask = Tensor::from_array(([1usize, len], prompt.attention_mask.clone()))
            .map_err(runtime_err)?;

        let outputs = self
            .session
            .run(inputs![
                "input_ids" => input_ids,
                "attention_mask" => attention_mask
            ])
            .map_err(runtime_err)?;

        let audio = match &self.audio_output {
            Some(name) => outputs.get(name.as_str()).ok_or(Error::MissingAudio)?,
            None => {
                if outputs.len() == 0 {
                    return Err(Error::MissingAudio);
                }
                &outputs[0]
            }
        };
        let (shape, data) = audio.try_extract_tensor::<f32>().map_err(runtime_err)?;
        first_waveform(shape, data)
    }
}

/// Hub `tokenizer.json` acting as the processor.
pub struct HubTokenizer {
    tokenizer: Tokenizer,
}

impl HubTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            Error::Tokenizer(format!("failed loading {}: {e}", path.display()))
        })?;
        Ok(Self { tokenizer })
    }
}

impl TextProcessor for HubTokenizer {
    fn process(&self, text: &str) -> Result<ModelInputs> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        if encoding.get_ids().is_empty() {
            return Err(Error::Tokenizer(format!("no tokens produced for '{text}'")));
        }
        Ok(ModelInputs {
            input_ids: encoding.get_ids().iter().map(|&id| i64::from(id)).collect(),
            attention_mask: encoding
                .get_attention_mask()
                .iter()
                .map(|&m| i64::from(m))
                .collect(),
        })
    }
}

/// Fetch (or reuse) the repository artifacts under `cache` and build the
/// model/processor pair.
pub fn load_model(
    cache: &CacheLocation,
    options: &LoadOptions,
    hub: HubConfig,
    runtime: &OrtRuntimeConfig,
) -> Result<(OnnxSpeechModel, HubTokenizer)> {
    println!("Loading {} model...", options.repo_id);

    if cache.contains_model(options.model_name()) {
        println!("Model found in cache - loading from disk...");
    } else {
        println!("{}", options.download_notice());
    }

    let artifacts = fetch_artifacts(cache, options, hub)?;
    init_ort(runtime)?;
    let model = OnnxSpeechModel::load(
        &artifacts.model_path,
        artifacts.custom_ops.as_deref(),
        &artifacts.config,
    )?;
    let processor = HubTokenizer::from_file(&artifacts.tokenizer_path)?;

    println!("Model loaded successfully on device: {}", model.device());
    Ok((model, processor))
}

#[derive(Debug)]
struct ModelArtifacts {
    config: ModelConfig,
    model_path: PathBuf,
    tokenizer_path: PathBuf,
    custom_ops: Option<PathBuf>,
}

fn fetch_artifacts(
    cache: &CacheLocation,
    options: &LoadOptions,
    hub: HubConfig,
) -> Result<ModelArtifacts> {
    let mut snapshot =
        RepoSnapshot::open(&cache.hub_dir(), &options.repo_id, &options.revision, hub)?;
    tracing::debug!(snapshot = %snapshot.dir().display(), "resolved snapshot directory");

    let config_path = snapshot.fetch(CONFIG_FILE)?;
    let config = ModelConfig::from_file(&config_path)?;

    let custom_ops = match &config.custom_ops {
        Some(lib) if !options.trust_remote_code => {
            return Err(Error::UntrustedRemoteCode(lib.clone()));
        }
        Some(lib) => Some(snapshot.fetch(lib)?),
        None => None,
    };
    let model_path = snapshot.fetch(config.model_file(options.precision)?)?;
    for data_file in &config.external_data {
        snapshot.fetch(data_file)?;
    }
    let tokenizer_path = snapshot.fetch(&config.tokenizer)?;
    snapshot.finish()?;

    Ok(ModelArtifacts {
        config,
        model_path,
        tokenizer_path,
        custom_ops,
    })
}

fn build_session(
    model_path: &Path,
    custom_ops: Option<&Path>,
    device: Device,
) -> Result<Session> {
    let mut builder = Session::builder()
        .map_err(runtime_err)?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(runtime_err)?;
    if let Device::Cuda(device_id) = device {
        let cuda_ep = ep::CUDA::default()
            .with_device_id(device_id)
            .with_conv_algorithm_search(ep::cuda::ConvAlgorithmSearch::Heuristic)
            .build()
            .error_on_failure();
        builder = builder.with_execution_providers([cuda_ep]).map_err(|e| {
            Error::Runtime(format!("failed enabling CUDA execution provider: {e}"))
        })?;
    }
    if let Some(lib) = custom_ops {
        tracing::info!(library = %lib.display(), "registering repository custom operators");
        builder = builder.with_operator_library(lib).map_err(runtime_err)?;
    }

    builder.commit_from_file(model_path).map_err(|e| {
        Error::Runtime(format!(
            "failed to load onnx model from {} on {device}: {e}",
            model_path.display()
        ))
    })
}

/// Run `build` on `preferred`; a failed CUDA build is retried once on the CPU.
///
/// Returns the device the result was actually built for.
fn with_cpu_fallback<T>(
    preferred: Device,
    mut build: impl FnMut(Device) -> Result<T>,
) -> Result<(T, Device)> {
    match build(preferred) {
        Ok(value) => Ok((value, preferred)),
        Err(e) if preferred != Device::Cpu => {
            tracing::warn!(error = %e, device = %preferred, "falling back to CPU");
            build(Device::Cpu).map(|value| (value, Device::Cpu))
        }
        Err(e) => Err(e),
    }
}

fn select_device() -> Device {
    match ep::CUDA::default().is_available() {
        Ok(true) => Device::Cuda(0),
        Ok(false) => {
            tracing::warn!("CUDA execution provider unavailable; running on CPU");
            Device::Cpu
        }
        Err(e) => {
            tracing::warn!(error = %e, "could not query CUDA execution provider; running on CPU");
            Device::Cpu
        }
    }
}

fn init_ort(config: &OrtRuntimeConfig) -> Result<()> {
    ORT_INIT.get_or_try_init(|| -> Result<()> {
        if config.cuda_lib_dir.is_some() || config.cudnn_lib_dir.is_some() {
            ep::cuda::preload_dylibs(
                config.cuda_lib_dir.as_deref(),
                config.cudnn_lib_dir.as_deref(),
            )
            .map_err(|e| {
                Error::Runtime(format!("failed preloading CUDA/cuDNN shared libraries: {e}"))
            })?;
        }

        let ort_lib = config
            .ort_lib
            .clone()
            .or_else(|| std::env::var_os("ORT_DYLIB_PATH").map(PathBuf::from))
            .unwrap_or_else(|| {
                #[cfg(target_os = "windows")]
                let lib = "onnxruntime.dll";
                #[cfg(any(target_os = "linux", target_os = "android"))]
                let lib = "libonnxruntime.so";
                #[cfg(any(target_os = "macos", target_os = "ios"))]
                let lib = "libonnxruntime.dylib";
                PathBuf::from(lib)
            });
        tracing::debug!(path = %ort_lib.display(), "loading ONNX Runtime");

        let _ = ort::init_from(&ort_lib)
            .map_err(|e| {
                Error::Runtime(format!(
                    "failed loading ONNX Runtime shared library from {}: {e}",
                    ort_lib.display()
                ))
            })?
            .with_name("vibevoice-tts")
            .commit();

        Ok(())
    })?;
    Ok(())
}

fn runtime_err(e: impl fmt::Display) -> Error {
    Error::Runtime(e.to_string())
}
