//! GPT-2 (124M) text generation with a wgpu matrix backend and a CPU fallback.
//!
//! The pipeline is:
//! - [`WeightLoader`] fetches the raw weight blob (or reads it from the cache) and rebuilds a
//!   [`ParameterSet`],
//! - [`Transformer`] runs the forward pass, dispatching large products through [`MatrixEngine`],
//! - [`Generator`] samples tokens one at a time with a [`TopKSampler`],
//! - [`Tokenizer`] converts between text and token ids.

mod compute;
mod configuration;
mod engine;
mod error;
mod generation;
pub mod layers;
mod loader;
mod sampler;
mod tensor;
mod tokenizer;
mod transformer;

use anyhow::{Context, Result};
use log::{debug, info};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub use compute::{ComputeContext, GpuDevice, GpuDeviceInfo, KernelTemplate, WORKGROUP_SIZE};
pub use configuration::HyperParams;
pub use engine::{Backend, GPU_MIN_OUTPUT_ELEMENTS, MatmulKernel, MatrixEngine};
pub use error::Error;
pub use generation::{
    DEFAULT_CONTEXT_LIMIT, GeneratedToken, GenerationObserver, GenerationSession, Generator, StopHandle,
    generate_next_token,
};
pub use gpt2_weights::{
    BlobStore, DEFAULT_WEIGHTS_URL, FileBlobStore, HttpWeightSource, InMemoryStore, WeightSource, WeightsError,
};
pub use loader::{WeightLoader, block_order, deserialize};
pub use sampler::{Candidate, DEFAULT_TEMPERATURE, DEFAULT_TOP_K, TopKSampler};
pub use tensor::{Matrix, cpu_matmul};
pub use tokenizer::{ByteSymbolTable, Tokenizer, parse_merges};
pub use transformer::{ParameterSet, Transformer};

/// Weight loader used by the command-line tools.
pub type CachedWeightLoader = WeightLoader<HttpWeightSource, FileBlobStore>;

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub encoder_path: PathBuf,
    pub merges_path: PathBuf,
    pub prompt: String,
    pub weights_url: String,
    pub cache_dir: PathBuf,
    pub temperature: f32,
    pub top_k: usize,
    pub context_limit: usize,
    pub max_tokens: Option<usize>,
    pub seed: u64,
    pub force_cpu: bool,
}

impl InferenceConfig {
    pub fn builder() -> InferenceConfigBuilder {
        InferenceConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct InferenceConfigBuilder {
    encoder_path: Option<PathBuf>,
    merges_path: Option<PathBuf>,
    prompt: Option<String>,
    weights_url: Option<String>,
    cache_dir: Option<PathBuf>,
    temperature: Option<f32>,
    top_k: Option<usize>,
    context_limit: Option<usize>,
    max_tokens: Option<usize>,
    seed: Option<u64>,
    force_cpu: Option<bool>,
}

impl InferenceConfigBuilder {
    pub fn encoder_path(mut self, path: Option<&String>) -> Self {
        self.encoder_path = path.map(PathBuf::from);
        self
    }
    pub fn merges_path(mut self, path: Option<&String>) -> Self {
        self.merges_path = path.map(PathBuf::from);
        self
    }
    pub fn prompt(mut self, prompt: Option<&String>) -> Self {
        self.prompt = prompt.cloned();
        self
    }
    pub fn weights_url(mut self, url: Option<&String>) -> Self {
        self.weights_url = url.cloned();
        self
    }
    pub fn cache_dir(mut self, dir: Option<&String>) -> Self {
        self.cache_dir = dir.map(PathBuf::from);
        self
    }
    pub fn temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
    pub fn top_k(mut self, top_k: Option<usize>) -> Self {
        self.top_k = top_k;
        self
    }
    pub fn context_limit(mut self, context_limit: Option<usize>) -> Self {
        self.context_limit = context_limit;
        self
    }
    pub fn max_tokens(mut self, max_tokens: Option<usize>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
    pub fn force_cpu(mut self, force_cpu: Option<bool>) -> Self {
        self.force_cpu = force_cpu;
        self
    }
    pub fn build(self) -> Result<InferenceConfig, String> {
        Ok(InferenceConfig {
            encoder_path: self.encoder_path.ok_or("encoder_path is required")?,
            merges_path: self.merges_path.ok_or("merges_path is required")?,
            prompt: self.prompt.unwrap_or_default(),
            weights_url: self.weights_url.unwrap_or_else(|| DEFAULT_WEIGHTS_URL.to_string()),
            cache_dir: self.cache_dir.unwrap_or_else(default_cache_dir),
            temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            top_k: self.top_k.unwrap_or(DEFAULT_TOP_K),
            context_limit: self.context_limit.unwrap_or(DEFAULT_CONTEXT_LIMIT),
            max_tokens: self.max_tokens,
            seed: self.seed.unwrap_or_else(|| {
                SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
            }),
            force_cpu: self.force_cpu.unwrap_or(false),
        })
    }
}

/// `$XDG_CACHE_HOME/gpt2-rs`, else `$HOME/.cache/gpt2-rs`, else a directory under the system temp dir.
pub fn default_cache_dir() -> PathBuf {
    let non_empty = |name: &str| std::env::var_os(name).filter(|value| !value.is_empty()).map(PathBuf::from);

    non_empty("XDG_CACHE_HOME")
        .or_else(|| non_empty("HOME").map(|home| home.join(".cache")))
        .unwrap_or_else(std::env::temp_dir)
        .join("gpt2-rs")
}

/// Loader that downloads from `weights_url` and caches under `cache_dir`.
pub fn open_weight_loader(weights_url: &str, cache_dir: &Path) -> Result<CachedWeightLoader> {
    let source = HttpWeightSource::new(weights_url).context("Failed to create HTTP client")?;
    Ok(WeightLoader::new(source, FileBlobStore::new(cache_dir), HyperParams::GPT2_124M))
}

/// Prints download progress to stderr on a single line.
pub fn print_progress(percent: u8) {
    eprint!("\r⬇️  Downloading weights: {percent:>3}%");
    if percent >= 100 {
        eprintln!();
    }
}

/// Logs per-layer progress and sampling candidates at debug level.
#[derive(Debug, Default)]
pub struct LoggingObserver;

impl GenerationObserver for LoggingObserver {
    fn on_layer_done(&mut self, layer: usize) {
        debug!("Layer {layer} done");
    }

    fn on_top_k(&mut self, candidates: &[Candidate]) {
        debug!("Top candidates: {candidates:?}");
    }
}

/// Runs inference until `max_tokens` is reached or `stop` is raised.
pub fn run_inference(inference_config: InferenceConfig, stop: StopHandle) -> Result<()> {
    debug!("{inference_config:#?}");

    let hparams = HyperParams::GPT2_124M;

    let mut tokenizer = Tokenizer::from_files(&inference_config.encoder_path, &inference_config.merges_path)
        .context("Failed to load tokenizer")?;
    debug!("{tokenizer:#?}");

    let compute = if inference_config.force_cpu { ComputeContext::cpu_only() } else { ComputeContext::acquire() };

    let mut loader = open_weight_loader(&inference_config.weights_url, &inference_config.cache_dir)?;
    let params = loader.load(&mut print_progress).context("Failed to load model weights")?;

    let transformer = Transformer::new(params, hparams, MatrixEngine::new(compute))?;
    debug!("{transformer:#?}");

    let sampler = TopKSampler::new(inference_config.top_k, inference_config.temperature, inference_config.seed)?;

    let generator = Generator::new(
        &transformer,
        &mut tokenizer,
        sampler,
        &inference_config.prompt,
        inference_config.context_limit,
    )?
    .with_observer(LoggingObserver)
    .with_max_tokens(inference_config.max_tokens)
    .with_stop_handle(stop.clone());

    info!("🚀 Generating");
    print!("{}", inference_config.prompt);
    io::stdout().flush()?;

    for token in generator {
        let token = token?;
        print!("{}", token.text);
        io::stdout().flush()?;
    }

    println!();
    if stop.is_stopped() {
        info!("🛑 Generation stopped");
    }
    Ok(())
}
