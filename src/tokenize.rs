use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use jieba_rs::Jieba;
use regex::Regex;
use tracing::{debug, info};

use crate::error::{Result, TranslateError};

pub const BOS_TOKEN: &str = "BOS";
pub const EOS_TOKEN: &str = "EOS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    English,
    Chinese,
}

/// Word-level tokenizer for both sides of the corpus.
///
/// English is lower-cased and split into words, numbers, clitics and single
/// punctuation marks. Chinese goes through jieba's precise mode with HMM
/// enabled for out-of-dictionary words.
pub struct Tokenizer {
    jieba: Jieba,
    english: Regex,
}

impl Tokenizer {
    pub fn new() -> Self {
        let english = Regex::new(r"\d+(?:[.,]\d+)*|[\p{L}\p{M}]+(?:['-][\p{L}\p{M}]+)*|[^\s\p{L}\p{M}\d]")
            .expect("english token pattern is valid");

        Tokenizer {
            jieba: Jieba::new(),
            english,
        }
    }

    /// Tokenize one line and frame it with `BOS`/`EOS`.
    pub fn tokenize(&self, line: &str, language: Language) -> Vec<String> {
        let line = line.trim();
        let mut tokens = vec![BOS_TOKEN.to_string()];
        match language {
            Language::English => {
                let lowered = line.to_lowercase();
                for m in self.english.find_iter(&lowered) {
                    let (stem, clitic) = split_clitic(m.as_str());
                    tokens.push(stem.to_string());
                    if let Some(clitic) = clitic {
                        tokens.push(clitic.to_string());
                    }
                }
            }
            Language::Chinese => {
                tokens.extend(
                    self.jieba
                        .cut(line, true)
                        .into_iter()
                        .map(str::trim)
                        .filter(|w| !w.is_empty())
                        .map(str::to_string),
                );
            }
        }
        tokens.push(EOS_TOKEN.to_string());
        tokens
    }

    /// Read a UTF-8 corpus, one sentence per line. Line alignment is kept:
    /// empty lines become `[BOS, EOS]`.
    pub fn load_corpus(
        &self,
        path: &Path,
        language: Language,
        limit: Option<usize>,
    ) -> Result<Vec<Vec<String>>> {
        let file = File::open(path).map_err(|e| TranslateError::io(path, e))?;
        let reader = BufReader::new(file);

        let mut sentences = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            if limit.is_some_and(|limit| i >= limit) {
                break;
            }
            let line = line.map_err(|e| TranslateError::io(path, e))?;
            sentences.push(self.tokenize(&line, language));
        }

        if sentences.is_empty() {
            return Err(TranslateError::EmptyCorpus(path.to_path_buf()));
        }
        info!(
            path = %path.display(),
            ?language,
            sentences = sentences.len(),
            "corpus loaded"
        );
        debug!(first = ?sentences.first(), "first tokenized sentence");
        Ok(sentences)
    }
}

const CLITICS: [&str; 6] = ["'s", "'re", "'ll", "'ve", "'m", "'d"];

/// Split a trailing English clitic off a word: "don't" -> ("do", "n't"),
/// "it's" -> ("it", "'s").
fn split_clitic(word: &str) -> (&str, Option<&str>) {
    if word.len() > 3 && word.ends_with("n't") {
        let at = word.len() - 3;
        return (&word[..at], Some(&word[at..]));
    }
    for clitic in CLITICS {
        if word.len() > clitic.len() && word.ends_with(clitic) {
            let at = word.len() - clitic.len();
            return (&word[..at], Some(&word[at..]));
        }
    }
    (word, None)
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}
