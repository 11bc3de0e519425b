use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use gpt2_inference::{
    DEFAULT_WEIGHTS_URL, InferenceConfigBuilder, StopHandle, default_cache_dir, open_weight_loader,
    print_progress, run_inference,
};
use log::{error, info};

fn cache_dir_arg() -> Arg {
    Arg::new("cache-dir")
        .long("cache-dir")
        .value_name("DIR")
        .help("Directory holding the cached weights [default: $XDG_CACHE_HOME/gpt2-rs]")
}

fn url_arg() -> Arg {
    Arg::new("url")
        .long("url")
        .value_name("URL")
        .help("Location of the raw weight blob")
        .default_value(DEFAULT_WEIGHTS_URL)
}

/// Define the generate subcommand.
fn generate_subcommand() -> Command {
    Command::new("generate")
        .about("Generate a continuation of a prompt with GPT-2 124M")
        .arg(Arg::new("PROMPT").help("Text to continue").required(true).index(1))
        .arg(
            Arg::new("encoder")
                .short('e')
                .long("encoder")
                .value_name("FILE")
                .help("Path to encoder.json (token to id)")
                .required(true),
        )
        .arg(
            Arg::new("merges")
                .short('m')
                .long("merges")
                .value_name("FILE")
                .help("Path to vocab.bpe (ranked merge pairs)")
                .required(true),
        )
        .arg(
            Arg::new("temperature")
                .short('t')
                .long("temperature")
                .value_name("FLOAT")
                .help("Temperature for sampling in [0, inf], 0 is greedy")
                .default_value("0.7")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("top-k")
                .short('k')
                .long("top-k")
                .value_name("INT")
                .help("Number of candidates to sample from")
                .default_value("5")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("context")
                .short('c')
                .long("context")
                .value_name("INT")
                .help("Number of most recent tokens fed to the model")
                .default_value("50")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("max-tokens")
                .short('n')
                .long("max-tokens")
                .value_name("INT")
                .help("Stop after this many tokens [default: run until interrupted]")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("Random seed")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(cache_dir_arg())
        .arg(url_arg())
        .arg(Arg::new("cpu").long("cpu").help("Never use the GPU").action(ArgAction::SetTrue))
}

/// Define the cache subcommand.
fn cache_subcommand() -> Command {
    Command::new("cache")
        .about("Inspect or clear the local weight cache")
        .arg(
            Arg::new("ACTION")
                .help("status | clear")
                .required(true)
                .index(1)
                .value_parser(["status", "clear"]),
        )
        .arg(cache_dir_arg())
}

/// Define the download subcommand.
fn download_subcommand() -> Command {
    Command::new("download").about("Download the weights into the local cache").arg(cache_dir_arg()).arg(url_arg())
}

fn cache_dir(matches: &ArgMatches) -> PathBuf {
    matches.get_one::<String>("cache-dir").map(PathBuf::from).unwrap_or_else(default_cache_dir)
}

/// Run the generate command with the provided arguments
fn run_generate_command(matches: &ArgMatches) -> Result<()> {
    let config = InferenceConfigBuilder::default()
        .prompt(matches.get_one::<String>("PROMPT"))
        .encoder_path(matches.get_one::<String>("encoder"))
        .merges_path(matches.get_one::<String>("merges"))
        .temperature(matches.get_one::<f32>("temperature").copied())
        .top_k(matches.get_one::<usize>("top-k").copied())
        .context_limit(matches.get_one::<usize>("context").copied())
        .max_tokens(matches.get_one::<usize>("max-tokens").copied())
        .seed(matches.get_one::<u64>("seed").copied())
        .cache_dir(matches.get_one::<String>("cache-dir"))
        .weights_url(matches.get_one::<String>("url"))
        .force_cpu(Some(matches.get_flag("cpu")))
        .build()
        .map_err(|e| anyhow::anyhow!(e))?;

    // First Ctrl-C finishes the current token and stops, a second one exits immediately.
    let stop = StopHandle::default();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        if handler_stop.is_stopped() {
            std::process::exit(130);
        }
        handler_stop.stop();
    })
    .context("Failed to install Ctrl-C handler")?;

    run_inference(config, stop).map_err(|e| anyhow::anyhow!("Inference failed: {e:#}"))?;

    Ok(())
}

/// Run the cache command with the provided arguments
fn run_cache_command(matches: &ArgMatches) -> Result<()> {
    let cache_dir = cache_dir(matches);
    let mut loader = open_weight_loader(DEFAULT_WEIGHTS_URL, &cache_dir)?;
    let path = loader.store().path().to_path_buf();

    match matches.get_one::<String>("ACTION").map(String::as_str) {
        Some("status") => {
            if loader.exists()? {
                let size = std::fs::metadata(&path)?.len();
                info!("📂 Cached weights: {} ({:.1} MiB)", path.display(), size as f64 / (1024.0 * 1024.0));
            } else {
                info!("📭 No cached weights at {}", path.display());
            }
        }
        Some("clear") => {
            loader.clear()?;
            info!("🧹 Cache cleared");
        }
        _ => anyhow::bail!("Unknown cache action"),
    }

    Ok(())
}

/// Run the download command with the provided arguments
fn run_download_command(matches: &ArgMatches) -> Result<()> {
    let cache_dir = cache_dir(matches);
    let url = matches.get_one::<String>("url").map(String::as_str).unwrap_or(DEFAULT_WEIGHTS_URL);
    let mut loader = open_weight_loader(url, &cache_dir)?;

    if loader.exists()? {
        info!("📂 Weights already cached at {}", loader.store().path().display());
        return Ok(());
    }

    let values = loader.load_raw(&mut print_progress)?;
    if !loader.exists()? {
        anyhow::bail!("Downloaded {} weights but could not cache them", values.len());
    }
    info!("✅ Cached {} weights at {}", values.len(), loader.store().path().display());

    Ok(())
}

fn execute_commands() -> Result<()> {
    // Initialize logger with clean format (no timestamp/module prefix)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();

    let matches = Command::new("gpt2")
        .about("GPT-2 CLI: text generation with GPT-2 124M on the GPU or CPU")
        .subcommand(generate_subcommand())
        .subcommand(cache_subcommand())
        .subcommand(download_subcommand())
        .get_matches();

    match matches.subcommand() {
        Some(("generate", matches)) => run_generate_command(matches),
        Some(("cache", matches)) => run_cache_command(matches),
        Some(("download", matches)) => run_download_command(matches),
        _ => anyhow::bail!("No subcommand specified. Use -h to print help information."),
    }
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}
