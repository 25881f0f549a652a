use std::path::Path;

use tch::{Device, Tensor};
use tracing::{debug, info};

use crate::checkpoint::{CheckpointManager, LoadedModel};
use crate::error::Result;
use crate::model::Seq2Seq;
use crate::preprocess::Vocab;
use crate::tokenize::{Language, Tokenizer};

/// Greedy translation of one encoded source sentence. The result stops
/// before the first `EOS`.
pub fn greedy_translate(
    model: &Seq2Seq,
    zh_vocab: &Vocab,
    src_ids: &[i64],
    max_length: i64,
) -> Result<Vec<i64>> {
    let src = Tensor::from_slice(src_ids)
        .view([1, src_ids.len() as i64])
        .to_device(model.device);
    let eos = zh_vocab.eos_id();
    let ids = model.translate(&src, &[src_ids.len() as i64], zh_vocab.bos_id(), eos, max_length);
    let ids = Vec::<i64>::try_from(&ids.reshape([-1]))?;
    Ok(ids.into_iter().take_while(|&id| id != eos).collect())
}

/// Source, reference and model output for one corpus pair.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleTranslation {
    pub source: String,
    pub reference: String,
    pub hypothesis: String,
}

pub fn sample_translation(
    model: &Seq2Seq,
    en_vocab: &Vocab,
    zh_vocab: &Vocab,
    src_ids: &[i64],
    trg_ids: &[i64],
    max_length: i64,
) -> Result<SampleTranslation> {
    let hypothesis = greedy_translate(model, zh_vocab, src_ids, max_length)?;
    Ok(SampleTranslation {
        source: en_vocab.decode(src_ids).join(" "),
        reference: zh_vocab.decode(trg_ids).join(" "),
        hypothesis: zh_vocab.decode(&hypothesis).join(" "),
    })
}

/// English to Chinese translation from a saved checkpoint.
pub struct Translator {
    tokenizer: Tokenizer,
    loaded: LoadedModel,
}

impl Translator {
    pub fn new(loaded: LoadedModel) -> Self {
        Translator {
            tokenizer: Tokenizer::new(),
            loaded,
        }
    }

    pub fn from_checkpoint(dir: &Path, device: Device) -> Result<Self> {
        let manager = CheckpointManager::new(dir);
        let run = manager.load_train_config()?;
        info!(
            epochs = run.epochs,
            max_words = run.max_words,
            corpus = %run.en_path.display(),
            "checkpoint trained"
        );
        Ok(Translator::new(manager.load(device)?))
    }

    pub fn translate(&self, sentence: &str, max_length: i64) -> Result<Vec<String>> {
        let tokens = self.tokenizer.tokenize(sentence, Language::English);
        let src_ids = self.loaded.en_vocab.encode(&tokens);
        debug!(?tokens, ?src_ids, "source encoded");

        let ids = greedy_translate(&self.loaded.model, &self.loaded.zh_vocab, &src_ids, max_length)?;
        Ok(self.loaded.zh_vocab.decode(&ids))
    }
}
