pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod decoder;
pub mod embeddings;
pub mod encoder;
pub mod error;
pub mod feed_forward;
pub mod generation;
pub mod hub;
pub mod inference;
pub mod layer_norm;
pub mod metrics;
pub mod multi_head_attention;
pub mod precision;
pub mod projection_layer;
pub mod residual_connection;
pub mod tokenizer_helper;
pub mod train;
pub mod transformer;
pub mod utils;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::Config;
use inference::Translator;
use tracing::{debug, info};
use tracing_subscriber::{filter::LevelFilter, EnvFilter, FmtSubscriber};
use train::fine_tune;
use utils::device;

/// Fine-tune a T5 checkpoint on a parallel corpus and translate with the result.
///
/// Without a subcommand, trains and then translates the sample sentence.
#[derive(Parser)]
#[command(author, version, about, long_about = None, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(flatten)]
    globals: Globals,

    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct Globals {
    /// More log output (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Run on the CPU even when a GPU is available
    #[arg(long, global = true)]
    cpu: bool,

    /// Source language code
    #[arg(long, env = "SRC_LANG", global = true)]
    src_lang: Option<String>,

    /// Target language code
    #[arg(long, env = "TGT_LANG", global = true)]
    tgt_lang: Option<String>,

    /// Where the fine-tuned model is written and read back from
    #[arg(long, value_name = "DIR", env = "OUTPUT_DIR", global = true)]
    output_dir: Option<PathBuf>,
}

impl Globals {
    fn apply(&self, config: &mut Config) {
        config.cpu = self.cpu;
        if let Some(src_lang) = &self.src_lang {
            config.src_lang = src_lang.clone();
        }
        if let Some(tgt_lang) = &self.tgt_lang {
            config.tgt_lang = tgt_lang.clone();
        }
        if let Some(output_dir) = &self.output_dir {
            config.training.output_dir = output_dir.clone();
        }
    }
}

#[derive(Args)]
struct TrainOpts {
    /// Parallel corpus, CSV (id, source, target) or parquet
    #[arg(long, value_name = "FILE", env = "DATA_PATH")]
    data: Option<PathBuf>,

    /// The CSV has no header row
    #[arg(long)]
    no_header: bool,

    /// Base checkpoint, a hub model id or a local directory
    #[arg(long, env = "BASE_CHECKPOINT")]
    checkpoint: Option<String>,

    /// Hub repository to push to; defaults to the output directory name
    #[arg(long, env = "HUB_MODEL_ID")]
    hub_model_id: Option<String>,

    /// Skip uploading to the hub
    #[arg(long)]
    no_push: bool,

    /// Train in f32 even on CUDA
    #[arg(long)]
    no_fp16: bool,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    /// Maximum tokenized length of sources and targets
    #[arg(long)]
    max_length: Option<usize>,

    /// Fraction of the corpus held out for evaluation
    #[arg(long)]
    test_size: Option<f64>,

    /// Seed for the per-epoch shuffle of the training set
    #[arg(long)]
    seed: Option<u64>,

    /// Seed for the train/test split; random when unset
    #[arg(long)]
    split_seed: Option<u64>,
}

impl TrainOpts {
    fn apply(&self, config: &mut Config) {
        let training = &mut config.training;
        if let Some(data) = &self.data {
            config.data_path = data.clone();
        }
        config.has_header = !self.no_header;
        if let Some(checkpoint) = &self.checkpoint {
            config.checkpoint = checkpoint.clone();
        }
        if self.hub_model_id.is_some() {
            training.hub_model_id = self.hub_model_id.clone();
        }
        training.push_to_hub &= !self.no_push;
        training.fp16 &= !self.no_fp16;
        if let Some(epochs) = self.epochs {
            training.num_train_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            training.per_device_train_batch_size = batch_size;
            training.per_device_eval_batch_size = batch_size;
        }
        if let Some(learning_rate) = self.learning_rate {
            training.learning_rate = learning_rate;
        }
        if let Some(seed) = self.seed {
            training.seed = seed;
        }
        if let Some(max_length) = self.max_length {
            config.max_length = max_length;
        }
        if let Some(test_size) = self.test_size {
            config.test_size = test_size;
        }
        if self.split_seed.is_some() {
            config.split_seed = self.split_seed;
        }
    }
}

#[derive(Args)]
struct TranslateOpts {
    /// Sentence to translate
    #[arg(long)]
    text: Option<String>,

    #[arg(long)]
    max_new_tokens: Option<usize>,

    #[arg(long)]
    top_k: Option<usize>,

    #[arg(long)]
    top_p: Option<f64>,

    /// Fixes the sampling seed; sampling is non-deterministic otherwise
    #[arg(long)]
    sample_seed: Option<u64>,
}

impl TranslateOpts {
    fn apply(&self, config: &mut Config) {
        let inference = &mut config.inference;
        if let Some(text) = &self.text {
            config.sample_text = text.clone();
        }
        if let Some(max_new_tokens) = self.max_new_tokens {
            inference.max_new_tokens = max_new_tokens;
        }
        if let Some(top_k) = self.top_k {
            inference.top_k = top_k;
        }
        if let Some(top_p) = self.top_p {
            inference.top_p = top_p;
        }
        if self.sample_seed.is_some() {
            inference.seed = self.sample_seed;
        }
    }
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    train: TrainOpts,

    #[command(flatten)]
    translate: TranslateOpts,
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-tune the base checkpoint and save (and push) the result
    Train(TrainOpts),

    /// Translate a sentence with a fine-tuned model; the result goes to stdout
    Translate(TranslateOpts),
}

fn init_tracing(verbose: u8) -> Result<()> {
    let default_directive = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_directive.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to set subscriber")
}

fn train(config: &Config) -> Result<()> {
    let output = fine_tune(config).context("fine-tuning failed")?;
    info!(
        steps = output.global_step,
        loss = output.training_loss,
        output_dir = %config.training.output_dir.display(),
        "done"
    );
    Ok(())
}

fn translate(config: &Config) -> Result<()> {
    let device = device(config.cpu)?;
    let output_dir = &config.training.output_dir;
    let translator = Translator::from_pretrained(output_dir, &config.prefix(), &device)
        .with_context(|| format!("loading {}", config.training.output_dir.display()))?;
    let translation = translator.translate(&config.sample_text, &config.inference)?;
    debug!(source = %config.sample_text, "translated");
    println!("{translation}");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.globals.verbose)?;

    let mut config = Config::default();
    cli.globals.apply(&mut config);

    match cli.command {
        Some(Commands::Train(opts)) => {
            opts.apply(&mut config);
            train(&config)
        }
        Some(Commands::Translate(opts)) => {
            opts.apply(&mut config);
            translate(&config)
        }
        None => {
            cli.run.train.apply(&mut config);
            cli.run.translate.apply(&mut config);
            train(&config)?;
            translate(&config)
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_run_keeps_defaults() {
        let cli = Cli::parse_from(["t5-translation-finetune-rs", "--no-push", "--epochs", "1"]);
        assert!(cli.command.is_none());
        let mut config = Config::default();
        cli.globals.apply(&mut config);
        cli.run.train.apply(&mut config);
        assert!(!config.training.push_to_hub);
        assert_eq!(config.training.num_train_epochs, 1);
        assert_eq!(config.training.per_device_train_batch_size, 16);
        assert_eq!(config.checkpoint, "google-t5/t5-small");
        assert_eq!(config.training.seed, 42);
        assert_eq!(config.split_seed, None);
    }

    #[test]
    fn test_seed_flags_are_separate() {
        let cli = Cli::parse_from([
            "t5-translation-finetune-rs",
            "train",
            "--seed",
            "7",
            "--split-seed",
            "11",
        ]);
        let mut config = Config::default();
        let Some(Commands::Train(opts)) = cli.command else {
            panic!("expected train");
        };
        opts.apply(&mut config);
        assert_eq!(config.training.seed, 7);
        assert_eq!(config.split_seed, Some(11));
    }

    #[test]
    fn test_translate_subcommand() {
        let cli = Cli::parse_from([
            "t5-translation-finetune-rs",
            "translate",
            "--text",
            "안녕하세요",
            "--top-k",
            "10",
            "--output-dir",
            "model",
        ]);
        let mut config = Config::default();
        cli.globals.apply(&mut config);
        let Some(Commands::Translate(opts)) = cli.command else {
            panic!("expected translate");
        };
        opts.apply(&mut config);
        assert_eq!(config.sample_text, "안녕하세요");
        assert_eq!(config.inference.top_k, 10);
        assert_eq!(config.training.output_dir, PathBuf::from("model"));
    }
}
