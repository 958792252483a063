mod cache;
mod error;
mod generate;
mod gpu;
mod hub;
mod model;

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::Parser;
use generate::{SpeechModel, TextProcessor, WavEncoding, generate_speech};
use hub::{DEFAULT_REVISION, HubConfig};
use model::{DEFAULT_REPO_ID, LoadOptions, OrtRuntimeConfig, load_model};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const DEFAULT_TEXT: &str =
    "Hello, this is VibeVoice speaking. I'm a text-to-speech model running on a powerful GPU.";
const OUTPUT_DIR: &str = "outputs";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Parser)]
#[command(name = "vibevoice-tts")]
#[command(about = "Generate speech with VibeVoice-Large-Q8 on an NVIDIA GPU")]
struct Cli {
    #[arg(long, default_value = DEFAULT_TEXT, help = "Text to convert to speech")]
    text: String,
    #[arg(long, help = "Output file path (default: outputs/output_<timestamp>.wav)")]
    output: Option<PathBuf>,
    #[arg(long, help = "Text file with one prompt per line")]
    batch: Option<PathBuf>,
    #[arg(
        long,
        help = "Cache directory for model files (default: $HF_HOME or ~/.cache/huggingface)"
    )]
    cache_dir: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_REPO_ID)]
    repo_id: String,
    #[arg(long, default_value = DEFAULT_REVISION)]
    revision: String,
    #[arg(long, value_enum, default_value_t = WavEncoding::Float32)]
    wav_encoding: WavEncoding,
    #[arg(
        long,
        help = "In batch mode, skip lines that fail and report them at the end"
    )]
    keep_going: bool,
    #[arg(long, help = "Path to the ONNX Runtime shared library (or set ORT_DYLIB_PATH)")]
    ort_lib: Option<PathBuf>,
    #[arg(long)]
    cuda_lib_dir: Option<PathBuf>,
    #[arg(long)]
    cudnn_lib_dir: Option<PathBuf>,
    #[arg(short, long, help = "Enable debug logging")]
    verbose: bool,
}

impl Cli {
    fn runtime_config(&self) -> OrtRuntimeConfig {
        OrtRuntimeConfig {
            ort_lib: self.ort_lib.clone(),
            cuda_lib_dir: self.cuda_lib_dir.clone(),
            cudnn_lib_dir: self.cudnn_lib_dir.clone(),
        }
    }

    fn batch_policy(&self) -> BatchPolicy {
        if self.keep_going {
            BatchPolicy::KeepGoing
        } else {
            BatchPolicy::AbortAll
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchPolicy {
    AbortAll,
    KeepGoing,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let Some(gpu) = gpu::detect() else {
        println!("WARNING: CUDA not available. This model requires an NVIDIA GPU!");
        return Ok(());
    };
    println!("{gpu}");
    println!();

    let cache = cache::resolve_from_env(cli.cache_dir.as_deref());
    println!("{cache}");
    tracing::debug!(root = %cache.root().display(), source = ?cache.source(), "cache resolved");
    cache.export_env();

    let options = LoadOptions::pinned(cli.repo_id.as_str(), cli.revision.as_str());
    let (mut model, processor) = load_model(
        &cache,
        &options,
        HubConfig::from_env(),
        &cli.runtime_config(),
    )
    .with_context(|| format!("failed loading model {}", options.repo_id))?;

    let output_dir = Path::new(OUTPUT_DIR);
    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed creating {}", output_dir.display()))?;

    if let Some(batch_file) = &cli.batch {
        println!("{}", batch_banner(batch_file));
        let prompts = read_batch_lines(batch_file)?;
        tracing::debug!(count = prompts.len(), "batch lines loaded");
        run_batch(
            &mut model,
            &processor,
            &prompts,
            output_dir,
            timestamp,
            cli.wav_encoding,
            cli.batch_policy(),
        )?;
    } else {
        let output = match &cli.output {
            Some(path) => path.clone(),
            None => unique_path(single_output_path(output_dir, &timestamp())),
        };
        generate_speech(&mut model, &processor, &cli.text, &output, cli.wav_encoding)
            .with_context(|| format!("failed generating {}", output.display()))?;
    }

    println!("\nDone!");
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

fn batch_banner(path: &Path) -> String {
    format!("Processing batch file: {}", path.display())
}

/// Non-blank lines of `path`, trimmed.
fn read_batch_lines(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading batch file {}", path.display()))?;
    Ok(parse_batch(&raw))
}

fn parse_batch(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn batch_output_path(dir: &Path, index: usize, stamp: &str) -> PathBuf {
    dir.join(format!("output_{index}_{stamp}.wav"))
}

fn single_output_path(dir: &Path, stamp: &str) -> PathBuf {
    dir.join(format!("output_{stamp}.wav"))
}

/// `path` if free, otherwise the first free `<stem>_<n>.<ext>`.
fn unique_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (1..)
        .map(|n| path.with_file_name(format!("{stem}_{n}{ext}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(path)
}

fn run_batch<M, P>(
    model: &mut M,
    processor: &P,
    prompts: &[String],
    dir: &Path,
    mut stamp: impl FnMut() -> String,
    encoding: WavEncoding,
    policy: BatchPolicy,
) -> Result<Vec<PathBuf>>
where
    M: SpeechModel + ?Sized,
    P: TextProcessor + ?Sized,
{
    let mut written = Vec::with_capacity(prompts.len());
    let mut failed = Vec::new();

    for (idx, text) in prompts.iter().enumerate() {
        let output = unique_path(batch_output_path(dir, idx + 1, &stamp()));
        match generate_speech(model, processor, text, &output, encoding) {
            Ok(path) => written.push(path),
            Err(err) if policy == BatchPolicy::KeepGoing => {
                tracing::error!(line = idx + 1, error = %err, "skipping batch line");
                failed.push(idx + 1);
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("batch line {} failed ({})", idx + 1, output.display())
                });
            }
        }
    }

    if !failed.is_empty() {
        bail!(
            "{} of {} batch lines failed: {:?}",
            failed.len(),
            prompts.len(),
            failed
        );
    }
    Ok(written)
}
