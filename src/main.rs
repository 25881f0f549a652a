use std::ffi::CString;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use libc::{dlopen, RTLD_LAZY};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tch::Device;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use seq2seq_translate::batch::make_batches;
use seq2seq_translate::checkpoint::CheckpointManager;
use seq2seq_translate::config::TrainConfig;
use seq2seq_translate::preprocess::{encode_corpus, Vocab};
use seq2seq_translate::tokenize::{Language, Tokenizer};
use seq2seq_translate::train::Trainer;
use seq2seq_translate::translate::{sample_translation, Translator};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Shared object to preload so libtorch can find its CUDA kernels.
    #[arg(long, global = true)]
    cuda_location: Option<String>,

    /// Run on the CPU even if CUDA is available.
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train on a line-aligned English/Chinese corpus.
    Train(TrainArgs),
    /// Translate an English sentence with a saved checkpoint.
    Translate(TranslateArgs),
}

#[derive(clap::Args, Debug)]
struct TrainArgs {
    #[arg(long, default_value = "./dataset/translation/news-commentary-v12.zh-en.en")]
    en_path: PathBuf,

    #[arg(long, default_value = "./dataset/translation/news-commentary-v12.zh-en.zh")]
    zh_path: PathBuf,

    /// Read only the first N lines of each corpus.
    #[arg(long)]
    limit: Option<usize>,

    #[arg(long, default_value_t = 50_000)]
    max_words: usize,

    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    #[arg(long, default_value_t = 200)]
    epochs: usize,

    #[arg(long, default_value_t = 50)]
    embed_size: i64,

    #[arg(long, default_value_t = 100)]
    enc_hidden_size: i64,

    #[arg(long, default_value_t = 200)]
    dec_hidden_size: i64,

    #[arg(long, default_value_t = 0.2)]
    dropout: f64,

    #[arg(long, default_value_t = 0.001)]
    learning_rate: f64,

    #[arg(long, default_value_t = 5.0)]
    clip_norm: f64,

    #[arg(long, default_value_t = 50)]
    log_every: usize,

    #[arg(long, default_value_t = 100)]
    eval_every: usize,

    #[arg(long, default_value_t = 10)]
    holdout_every: usize,

    #[arg(long, default_value_t = 123)]
    seed: u64,

    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Corpus sentence shown as a sample translation after training.
    #[arg(long, default_value_t = 0)]
    sample: usize,

    #[arg(long, default_value_t = 10)]
    max_length: i64,
}

impl From<&TrainArgs> for TrainConfig {
    fn from(a: &TrainArgs) -> Self {
        TrainConfig {
            en_path: a.en_path.clone(),
            zh_path: a.zh_path.clone(),
            limit: a.limit,
            max_words: a.max_words,
            batch_size: a.batch_size,
            epochs: a.epochs,
            embed_size: a.embed_size,
            enc_hidden_size: a.enc_hidden_size,
            dec_hidden_size: a.dec_hidden_size,
            dropout: a.dropout,
            learning_rate: a.learning_rate,
            clip_norm: a.clip_norm,
            log_every: a.log_every,
            eval_every: a.eval_every,
            holdout_every: a.holdout_every,
            seed: a.seed,
            checkpoint_dir: a.checkpoint_dir.clone(),
        }
    }
}

#[derive(clap::Args, Debug)]
struct TranslateArgs {
    #[arg(long)]
    checkpoint_dir: PathBuf,

    #[arg(long)]
    sentence: String,

    #[arg(long, default_value_t = 10)]
    max_length: i64,
}

fn preload_cuda(location: &str) -> Result<()> {
    let path = CString::new(location).context("cuda location contains a NUL byte")?;
    let handle = unsafe { dlopen(path.as_ptr(), RTLD_LAZY) };
    if handle.is_null() {
        warn!(location, "could not preload CUDA library");
    }
    Ok(())
}

fn select_device(force_cpu: bool) -> Device {
    info!(
        cuda = tch::Cuda::is_available(),
        cudnn = tch::Cuda::cudnn_is_available(),
        "torch backends"
    );
    if !force_cpu && tch::Cuda::is_available() {
        info!("Using GPU (CUDA).");
        Device::Cuda(0)
    } else {
        info!("Using CPU.");
        Device::Cpu
    }
}

fn train(args: &TrainArgs, device: Device) -> Result<()> {
    let cfg = TrainConfig::from(args);
    cfg.validate()?;
    tch::manual_seed(cfg.seed as i64);
    let mut rng = StdRng::seed_from_u64(cfg.seed);

    let tokenizer = Tokenizer::new();
    let en = tokenizer.load_corpus(&cfg.en_path, Language::English, cfg.limit)?;
    let zh = tokenizer.load_corpus(&cfg.zh_path, Language::Chinese, cfg.limit)?;

    let en_vocab = Vocab::build(&en, cfg.max_words);
    let zh_vocab = Vocab::build(&zh, cfg.max_words);
    info!(
        "Source vocab size: {}, Target vocab size: {}",
        en_vocab.len(),
        zh_vocab.len()
    );

    let data = encode_corpus(&en, &zh, &en_vocab, &zh_vocab, true)?;
    let batches = make_batches(&data, cfg.batch_size, &mut rng, true);
    info!(batches = batches.len(), batch_size = cfg.batch_size, "batches ready");

    let model_cfg = cfg.model_config(en_vocab.len(), zh_vocab.len());
    let checkpoints = cfg.checkpoint_dir.clone().map(CheckpointManager::new);
    if let Some(manager) = &checkpoints {
        manager.save_metadata(&cfg, &model_cfg, &en_vocab, &zh_vocab)?;
    }

    let mut trainer = Trainer::new(cfg, &model_cfg, device)?;
    trainer.fit(batches, |trainer, epoch| {
        if let Some(manager) = &checkpoints {
            manager.save_weights(&trainer.vs)?;
            info!(epoch, dir = %manager.dir().display(), "checkpoint written");
        }
        Ok(())
    })?;

    if let (Some(src), Some(trg)) = (data.src.get(args.sample), data.trg.get(args.sample)) {
        let sample = sample_translation(
            &trainer.model,
            &en_vocab,
            &zh_vocab,
            src,
            trg,
            args.max_length,
        )?;
        println!("{}", sample.source);
        println!("{}", sample.reference);
        println!("{}", sample.hypothesis);
    }
    Ok(())
}

fn translate(args: &TranslateArgs, device: Device) -> Result<()> {
    let translator = Translator::from_checkpoint(&args.checkpoint_dir, device)
        .with_context(|| format!("loading checkpoint from {}", args.checkpoint_dir.display()))?;
    let words = translator.translate(&args.sentence, args.max_length)?;
    println!("{}", words.join(" "));
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("seq2seq_translate=info")),
        )
        .init();

    let args = Args::parse();
    if let Some(location) = &args.cuda_location {
        preload_cuda(location)?;
    }
    let device = select_device(args.cpu);

    match &args.command {
        Command::Train(train_args) => train(train_args, device),
        Command::Translate(translate_args) => translate(translate_args, device),
    }
}
