use rand::seq::SliceRandom;
use rand::Rng;
use tch::{Device, Kind, Tensor};

use crate::preprocess::{TranslationData, PAD_ID};

/// Host-side batch: row-major padded ids plus the true length of every row.
#[derive(Debug, Clone, PartialEq)]
pub struct PaddedBatch {
    pub src: Vec<i64>,
    pub src_lengths: Vec<i64>,
    pub src_max_len: i64,
    pub trg: Vec<i64>,
    pub trg_lengths: Vec<i64>,
    pub trg_max_len: i64,
}

impl PaddedBatch {
    pub fn size(&self) -> usize {
        self.src_lengths.len()
    }

    pub fn to_tensors(&self, device: Device) -> TranslationBatch {
        let rows = self.size() as i64;
        let src = Tensor::from_slice(self.src.as_slice())
            .view([rows, self.src_max_len])
            .to_device(device);
        let trg = Tensor::from_slice(self.trg.as_slice())
            .view([rows, self.trg_max_len])
            .to_device(device);

        let (decoder_input, targets, target_lengths) = shift_targets(&trg, &self.trg_lengths);

        TranslationBatch {
            src,
            src_lengths: self.src_lengths.clone(),
            decoder_input,
            targets,
            target_lengths,
        }
    }
}

/// Device-side batch ready for a teacher forced forward pass.
///
/// The decoder reads `[BOS, w1, .., wn]` and is scored against
/// `[w1, .., wn, EOS]`.
pub struct TranslationBatch {
    pub src: Tensor,
    pub src_lengths: Vec<i64>,
    pub decoder_input: Tensor,
    pub targets: Tensor,
    pub target_lengths: Vec<i64>,
}

impl TranslationBatch {
    /// Number of target tokens that take part in the loss.
    pub fn num_words(&self) -> i64 {
        self.target_lengths.iter().sum()
    }

    pub fn target_mask(&self) -> Tensor {
        length_mask(&self.target_lengths, self.targets.size()[1], self.targets.device())
    }
}

/// Split `trg[B, T]` into decoder input `trg[:, :-1]` and targets
/// `trg[:, 1:]`. Lengths drop by one and never go below 1.
pub fn shift_targets(trg: &Tensor, lengths: &[i64]) -> (Tensor, Tensor, Vec<i64>) {
    let steps = (trg.size()[1] - 1).max(1);
    let decoder_input = trg.narrow(1, 0, steps);
    let targets = if trg.size()[1] > 1 {
        trg.narrow(1, 1, steps)
    } else {
        trg.zeros_like()
    };
    let shifted = lengths.iter().map(|&len| (len - 1).max(1)).collect();
    (decoder_input, targets, shifted)
}

/// `[B, max_len]` boolean mask, true where `t < lengths[b]`.
pub fn length_mask(lengths: &[i64], max_len: i64, device: Device) -> Tensor {
    let lengths = Tensor::from_slice(lengths).to_device(device);
    Tensor::arange(max_len, (Kind::Int64, device))
        .unsqueeze(0)
        .lt_tensor(&lengths.unsqueeze(1))
}

/// Row ranges of consecutive sentences, `batch_size` each (the last one may
/// be shorter). The order of the batches is shuffled on request.
pub fn batch_ranges<R: Rng>(
    num_sentences: usize,
    batch_size: usize,
    rng: &mut R,
    shuffle: bool,
) -> Vec<std::ops::Range<usize>> {
    let batch_size = batch_size.max(1);
    let mut firsts: Vec<usize> = (0..num_sentences).step_by(batch_size).collect();
    if shuffle {
        firsts.shuffle(rng);
    }
    firsts
        .into_iter()
        .map(|first| first..(first + batch_size).min(num_sentences))
        .collect()
}

/// Right-pad every sentence with `PAD` to the longest one.
pub fn pad_batch(sentences: &[&[i64]]) -> (Vec<i64>, Vec<i64>, i64) {
    let lengths: Vec<i64> = sentences.iter().map(|s| s.len() as i64).collect();
    let max_len = lengths.iter().copied().max().unwrap_or(0);

    let mut data = Vec::with_capacity(sentences.len() * max_len as usize);
    for sentence in sentences {
        data.extend_from_slice(sentence);
        data.extend(std::iter::repeat(PAD_ID).take(max_len as usize - sentence.len()));
    }
    (data, lengths, max_len)
}

pub fn make_batches<R: Rng>(
    data: &TranslationData,
    batch_size: usize,
    rng: &mut R,
    shuffle: bool,
) -> Vec<PaddedBatch> {
    batch_ranges(data.len(), batch_size, rng, shuffle)
        .into_iter()
        .map(|range| {
            let src: Vec<&[i64]> = data.src[range.clone()].iter().map(Vec::as_slice).collect();
            let trg: Vec<&[i64]> = data.trg[range].iter().map(Vec::as_slice).collect();
            let (src, src_lengths, src_max_len) = pad_batch(&src);
            let (trg, trg_lengths, trg_max_len) = pad_batch(&trg);
            PaddedBatch {
                src,
                src_lengths,
                src_max_len,
                trg,
                trg_lengths,
                trg_max_len,
            }
        })
        .collect()
}
