//! Weights, vocabularies and model shape stored side by side in one
//! directory:
//!
//! ```text
//! <dir>/model.ot        VarStore weights
//! <dir>/model.json      ModelConfig
//! <dir>/train.json      TrainConfig of the run
//! <dir>/en_vocab.json
//! <dir>/zh_vocab.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tch::{nn, Device};
use tracing::info;

use crate::config::TrainConfig;
use crate::error::{Result, TranslateError};
use crate::model::{ModelConfig, Seq2Seq};
use crate::preprocess::Vocab;

const WEIGHTS_FILE: &str = "model.ot";
const MODEL_FILE: &str = "model.json";
const TRAIN_FILE: &str = "train.json";
const EN_VOCAB_FILE: &str = "en_vocab.json";
const ZH_VOCAB_FILE: &str = "zh_vocab.json";

pub struct CheckpointManager {
    dir: PathBuf,
}

/// A model restored from disk, ready for inference.
pub struct LoadedModel {
    pub vs: nn::VarStore,
    pub model: Seq2Seq,
    pub model_config: ModelConfig,
    pub en_vocab: Vocab,
    pub zh_vocab: Vocab,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CheckpointManager { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Vocabularies and configs only change once per run.
    pub fn save_metadata(
        &self,
        train_config: &TrainConfig,
        model_config: &ModelConfig,
        en_vocab: &Vocab,
        zh_vocab: &Vocab,
    ) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| TranslateError::io(&self.dir, e))?;
        self.write_json(TRAIN_FILE, train_config)?;
        self.write_json(MODEL_FILE, model_config)?;
        self.write_json(EN_VOCAB_FILE, en_vocab)?;
        self.write_json(ZH_VOCAB_FILE, zh_vocab)?;
        Ok(())
    }

    pub fn save_weights(&self, vs: &nn::VarStore) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| TranslateError::io(&self.dir, e))?;
        let path = self.dir.join(WEIGHTS_FILE);
        vs.save(&path)?;
        info!(path = %path.display(), "weights saved");
        Ok(())
    }

    pub fn load(&self, device: Device) -> Result<LoadedModel> {
        let model_config: ModelConfig = self.read_json(MODEL_FILE)?;
        let en_vocab: Vocab = self.read_json(EN_VOCAB_FILE)?;
        let zh_vocab: Vocab = self.read_json(ZH_VOCAB_FILE)?;

        let weights = self.dir.join(WEIGHTS_FILE);
        if !weights.exists() {
            return Err(TranslateError::MissingCheckpoint(weights));
        }

        let mut vs = nn::VarStore::new(device);
        let model = Seq2Seq::build(&vs.root(), &model_config);
        vs.load(&weights)?;
        info!(path = %weights.display(), "weights loaded");

        Ok(LoadedModel {
            vs,
            model,
            model_config,
            en_vocab,
            zh_vocab,
        })
    }

    pub fn load_train_config(&self) -> Result<TrainConfig> {
        self.read_json(TRAIN_FILE)
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(name);
        let json = serde_json::to_string_pretty(value)?;
        fs::write(&path, json).map_err(|e| TranslateError::io(&path, e))
    }

    fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Err(TranslateError::MissingCheckpoint(path));
        }
        let json = fs::read_to_string(&path).map_err(|e| TranslateError::io(&path, e))?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Tensor;

    fn vocab(words: &str) -> Vocab {
        let sentence: Vec<String> = words.split_whitespace().map(str::to_string).collect();
        Vocab::build(&[sentence], 100)
    }

    #[test]
    fn weights_and_vocab_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("ckpt"));

        let en_vocab = vocab("BOS a b c EOS");
        let zh_vocab = vocab("BOS 一 二 EOS");
        let model_config = ModelConfig {
            src_vocab_size: en_vocab.len() as i64,
            trg_vocab_size: zh_vocab.len() as i64,
            embed_size: 4,
            enc_hidden_size: 3,
            dec_hidden_size: 5,
            dropout: 0.0,
        };

        let vs = nn::VarStore::new(Device::Cpu);
        let model = Seq2Seq::build(&vs.root(), &model_config);
        manager
            .save_metadata(&TrainConfig::default(), &model_config, &en_vocab, &zh_vocab)
            .unwrap();
        manager.save_weights(&vs).unwrap();

        let loaded = manager.load(Device::Cpu).unwrap();
        assert_eq!(loaded.model_config, model_config);
        assert_eq!(loaded.en_vocab, en_vocab);
        assert_eq!(loaded.zh_vocab, zh_vocab);
        assert_eq!(manager.load_train_config().unwrap(), TrainConfig::default());

        let src = Tensor::from_slice(&[2i64, 3, 4, 5]).view([1, 4]);
        let trg = Tensor::from_slice(&[2i64, 3]).view([1, 2]);
        let before = model.forward_t(&src, &[4], &trg, &[2], false);
        let after = loaded.model.forward_t(&src, &[4], &trg, &[2], false);
        let diff = (before - after).abs().max().double_value(&[]);
        assert!(diff < 1e-6);
        assert_eq!(loaded.vs.variables().len(), vs.variables().len());
    }

    #[test]
    fn missing_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let err = manager.load(Device::Cpu).err().unwrap();
        assert!(matches!(err, TranslateError::MissingCheckpoint(_)));
    }
}
