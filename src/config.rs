use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TranslateError};
use crate::model::ModelConfig;

/// Hyper-parameters of a training run. Persisted next to the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub en_path: PathBuf,
    pub zh_path: PathBuf,
    /// Read at most this many lines of each corpus.
    pub limit: Option<usize>,
    pub max_words: usize,
    pub batch_size: usize,
    pub epochs: usize,
    pub embed_size: i64,
    pub enc_hidden_size: i64,
    pub dec_hidden_size: i64,
    pub dropout: f64,
    pub learning_rate: f64,
    pub clip_norm: f64,
    pub log_every: usize,
    pub eval_every: usize,
    /// Every n-th batch is held out for evaluation.
    pub holdout_every: usize,
    pub seed: u64,
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            en_path: PathBuf::from("./dataset/translation/news-commentary-v12.zh-en.en"),
            zh_path: PathBuf::from("./dataset/translation/news-commentary-v12.zh-en.zh"),
            limit: None,
            max_words: 50_000,
            batch_size: 8,
            epochs: 200,
            embed_size: 50,
            enc_hidden_size: 100,
            dec_hidden_size: 200,
            dropout: 0.2,
            learning_rate: 1e-3,
            clip_norm: 5.0,
            log_every: 50,
            eval_every: 100,
            holdout_every: 10,
            seed: 123,
            checkpoint_dir: None,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_words", self.max_words),
            ("batch_size", self.batch_size),
            ("log_every", self.log_every),
            ("eval_every", self.eval_every),
            ("holdout_every", self.holdout_every),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(TranslateError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        let sizes = [
            ("embed_size", self.embed_size),
            ("enc_hidden_size", self.enc_hidden_size),
            ("dec_hidden_size", self.dec_hidden_size),
        ];
        for (name, value) in sizes {
            if value <= 0 {
                return Err(TranslateError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(TranslateError::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.learning_rate <= 0.0 || self.clip_norm <= 0.0 {
            return Err(TranslateError::InvalidConfig(
                "learning_rate and clip_norm must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn model_config(&self, src_vocab_size: usize, trg_vocab_size: usize) -> ModelConfig {
        ModelConfig {
            src_vocab_size: src_vocab_size as i64,
            trg_vocab_size: trg_vocab_size as i64,
            embed_size: self.embed_size,
            enc_hidden_size: self.enc_hidden_size,
            dec_hidden_size: self.dec_hidden_size,
            dropout: self.dropout,
        }
    }
}
