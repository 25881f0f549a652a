use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TranslateError};
use crate::tokenize::{BOS_TOKEN, EOS_TOKEN};

pub const PAD_TOKEN: &str = "PAD";
pub const UNK_TOKEN: &str = "UNK";
pub const PAD_ID: i64 = 0;
pub const UNK_ID: i64 = 1;

/// Frequency ranked vocabulary. `PAD` is 0, `UNK` is 1 and corpus words
/// follow from 2 in decreasing frequency.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vocab {
    pub token_to_id: HashMap<String, i64>,
    pub id_to_token: Vec<String>,
}

impl Vocab {
    /// Keep the `max_words` most frequent tokens. Ties keep the order in
    /// which the tokens were first seen. Literal `PAD`/`UNK` tokens in the
    /// corpus map to the reserved ids.
    pub fn build(sentences: &[Vec<String>], max_words: usize) -> Self {
        let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
        for token in sentences.iter().flatten() {
            let first_seen = counts.len();
            counts.entry(token.as_str()).or_insert((0, first_seen)).0 += 1;
        }

        let mut ranked: Vec<(&str, usize, usize)> = counts
            .into_iter()
            .filter(|(token, _)| *token != PAD_TOKEN && *token != UNK_TOKEN)
            .map(|(token, (count, first_seen))| (token, count, first_seen))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
        ranked.truncate(max_words);

        let mut id_to_token = Vec::with_capacity(ranked.len() + 2);
        id_to_token.push(PAD_TOKEN.to_string());
        id_to_token.push(UNK_TOKEN.to_string());
        id_to_token.extend(ranked.into_iter().map(|(token, _, _)| token.to_string()));

        let token_to_id = id_to_token
            .iter()
            .enumerate()
            .map(|(id, token)| (token.clone(), id as i64))
            .collect();

        Vocab {
            token_to_id,
            id_to_token,
        }
    }

    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    pub fn index(&self, token: &str) -> i64 {
        self.token_to_id.get(token).copied().unwrap_or(UNK_ID)
    }

    pub fn word(&self, id: i64) -> Option<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|id| self.id_to_token.get(id))
            .map(String::as_str)
    }

    pub fn pad_id(&self) -> i64 {
        PAD_ID
    }

    pub fn unk_id(&self) -> i64 {
        UNK_ID
    }

    pub fn bos_id(&self) -> i64 {
        self.index(BOS_TOKEN)
    }

    pub fn eos_id(&self) -> i64 {
        self.index(EOS_TOKEN)
    }

    pub fn encode(&self, sentence: &[String]) -> Vec<i64> {
        sentence.iter().map(|token| self.index(token)).collect()
    }

    /// Out-of-range ids decode as `UNK`.
    pub fn decode(&self, ids: &[i64]) -> Vec<String> {
        ids.iter()
            .map(|&id| self.word(id).unwrap_or(UNK_TOKEN).to_string())
            .collect()
    }
}

/// Index-encoded parallel corpus.
pub struct TranslationData {
    pub src: Vec<Vec<i64>>,
    pub trg: Vec<Vec<i64>>,
}

impl TranslationData {
    pub fn len(&self) -> usize {
        self.src.len()
    }

    pub fn is_empty(&self) -> bool {
        self.src.is_empty()
    }
}

/// Encode both sides of the corpus. With `sort_by_len` the pairs are
/// reordered by source length so that batches of neighbours need little
/// padding.
pub fn encode_corpus(
    en: &[Vec<String>],
    zh: &[Vec<String>],
    en_vocab: &Vocab,
    zh_vocab: &Vocab,
    sort_by_len: bool,
) -> Result<TranslationData> {
    if en.len() != zh.len() {
        return Err(TranslateError::MisalignedCorpus {
            english: en.len(),
            chinese: zh.len(),
        });
    }

    let mut src: Vec<Vec<i64>> = en.iter().map(|s| en_vocab.encode(s)).collect();
    let mut trg: Vec<Vec<i64>> = zh.iter().map(|s| zh_vocab.encode(s)).collect();

    if sort_by_len {
        let mut order: Vec<usize> = (0..src.len()).collect();
        order.sort_by_key(|&i| src[i].len());
        src = order.iter().map(|&i| std::mem::take(&mut src[i])).collect();
        trg = order.iter().map(|&i| std::mem::take(&mut trg[i])).collect();
    }

    info!(pairs = src.len(), sort_by_len, "corpus encoded");
    Ok(TranslationData { src, trg })
}
