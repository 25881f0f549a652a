use serde::{Deserialize, Serialize};
use tch::nn::{Embedding, Linear, RNNConfig, GRU};
use tch::{nn, Device, Kind, Tensor};

use crate::batch::length_mask;
use crate::packing::{reverse_padded, PackedOrder};

/// Score given to padded source positions before the softmax.
const MASKED_SCORE: f64 = -1e9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub src_vocab_size: i64,
    pub trg_vocab_size: i64,
    pub embed_size: i64,
    pub enc_hidden_size: i64,
    pub dec_hidden_size: i64,
    pub dropout: f64,
}

impl ModelConfig {
    pub fn new(src_vocab_size: i64, trg_vocab_size: i64) -> Self {
        ModelConfig {
            src_vocab_size,
            trg_vocab_size,
            embed_size: 50,
            enc_hidden_size: 100,
            dec_hidden_size: 200,
            dropout: 0.2,
        }
    }
}

fn embedding(vs: &nn::Path, vocab_size: i64, embed_size: i64) -> Embedding {
    let embed_cfg = nn::EmbeddingConfig {
        padding_idx: 0,
        ..Default::default()
    };
    nn::embedding(vs, vocab_size, embed_size, embed_cfg)
}

fn gru(vs: &nn::Path, input_size: i64, hidden_size: i64) -> GRU {
    let gru_cfg = RNNConfig {
        batch_first: true,
        ..Default::default()
    };
    nn::gru(vs, input_size, hidden_size, gru_cfg)
}

/// Bidirectional GRU encoder.
pub struct Encoder {
    pub embedding: Embedding,
    pub gru_fwd: GRU,
    pub gru_bwd: GRU,
    pub fc: Linear,
    pub hidden_size: i64,
    pub dropout: f64,
}

impl Encoder {
    pub fn new(vs: &nn::Path, cfg: &ModelConfig) -> Self {
        Encoder {
            embedding: embedding(&(vs / "embedding"), cfg.src_vocab_size, cfg.embed_size),
            gru_fwd: gru(&(vs / "gru_fwd"), cfg.embed_size, cfg.enc_hidden_size),
            gru_bwd: gru(&(vs / "gru_bwd"), cfg.embed_size, cfg.enc_hidden_size),
            fc: nn::linear(
                vs / "fc",
                cfg.enc_hidden_size * 2,
                cfg.dec_hidden_size,
                Default::default(),
            ),
            hidden_size: cfg.enc_hidden_size,
            dropout: cfg.dropout,
        }
    }

    /// `src [B, Tx]` → `(outputs [B, Tx, 2*enc], hidden [B, dec])`.
    ///
    /// The hidden state concatenates the last forward and backward states of
    /// every row and squeezes them through `tanh(fc(.))` to seed the decoder.
    pub fn forward_t(&self, src: &Tensor, lengths: &[i64], train: bool) -> (Tensor, Tensor) {
        let packed = PackedOrder::new(lengths);
        let embedded = packed
            .sort(src, 0)
            .apply(&self.embedding)
            .dropout(self.dropout, train);

        let batch_size = embedded.size()[0];
        let h0 = Tensor::zeros(
            [batch_size, self.hidden_size],
            (Kind::Float, embedded.device()),
        );

        let (fwd_out, fwd_h) = packed.run_gru(&self.gru_fwd, &embedded, &h0);
        let reversed = reverse_padded(&embedded, packed.sorted_lengths());
        let (bwd_out, bwd_h) = packed.run_gru(&self.gru_bwd, &reversed, &h0);
        let bwd_out = reverse_padded(&bwd_out, packed.sorted_lengths());

        let outputs = Tensor::cat(&[fwd_out, bwd_out], 2);
        let hidden = Tensor::cat(&[fwd_h, bwd_h], 1).apply(&self.fc).tanh();

        (packed.restore(&outputs, 0), packed.restore(&hidden, 0))
    }
}

/// `true` wherever the target step or the source position is padding.
pub fn attention_mask(
    src_lengths: &[i64],
    trg_lengths: &[i64],
    src_max_len: i64,
    trg_max_len: i64,
    device: Device,
) -> Tensor {
    let src_mask = length_mask(src_lengths, src_max_len, device);
    let trg_mask = length_mask(trg_lengths, trg_max_len, device);
    trg_mask
        .unsqueeze(2)
        .logical_and(&src_mask.unsqueeze(1))
        .logical_not()
}

/// Attention of decoder outputs over encoder outputs.
pub struct Attention {
    pub linear_in: Linear,
    pub linear_out: Linear,
}

impl Attention {
    pub fn new(vs: &nn::Path, enc_hidden_size: i64, dec_hidden_size: i64) -> Self {
        let no_bias = nn::LinearConfig {
            bias: false,
            ..Default::default()
        };
        Attention {
            linear_in: nn::linear(vs / "linear_in", enc_hidden_size * 2, dec_hidden_size, no_bias),
            linear_out: nn::linear(
                vs / "linear_out",
                enc_hidden_size * 2 + dec_hidden_size,
                dec_hidden_size,
                Default::default(),
            ),
        }
    }

    /// `output [B, Ty, dec]`, `context [B, Tx, 2*enc]`, `mask [B, Ty, Tx]`
    /// → `(attended [B, Ty, dec], weights [B, Ty, Tx])`.
    pub fn forward(&self, output: &Tensor, context: &Tensor, mask: &Tensor) -> (Tensor, Tensor) {
        let keys = context.apply(&self.linear_in);
        let weights = output
            .bmm(&keys.transpose(1, 2))
            .masked_fill(mask, MASKED_SCORE)
            .softmax(2, Kind::Float);

        let attended = weights.bmm(context);
        let combined = Tensor::cat(&[&attended, output], 2)
            .apply(&self.linear_out)
            .tanh();
        (combined, weights)
    }
}

pub struct DecoderOutput {
    /// `[B, Ty, V]` log-probabilities.
    pub log_probs: Tensor,
    /// `[B, dec]` state after the last valid target step of every row.
    pub hidden: Tensor,
}

pub struct Decoder {
    pub embedding: Embedding,
    pub attention: Attention,
    pub gru: GRU,
    pub fc_out: Linear,
    pub dropout: f64,
}

impl Decoder {
    pub fn new(vs: &nn::Path, cfg: &ModelConfig) -> Self {
        Decoder {
            embedding: embedding(&(vs / "embedding"), cfg.trg_vocab_size, cfg.embed_size),
            attention: Attention::new(
                &(vs / "attention"),
                cfg.enc_hidden_size,
                cfg.dec_hidden_size,
            ),
            gru: gru(&(vs / "gru"), cfg.embed_size, cfg.dec_hidden_size),
            fc_out: nn::linear(
                vs / "fc_out",
                cfg.dec_hidden_size,
                cfg.trg_vocab_size,
                Default::default(),
            ),
            dropout: cfg.dropout,
        }
    }

    /// Run the GRU over `trg [B, Ty]` from `hidden`, attend over
    /// `encoder_out` and project to the target vocabulary.
    pub fn forward_t(
        &self,
        encoder_out: &Tensor,
        src_lengths: &[i64],
        trg: &Tensor,
        trg_lengths: &[i64],
        hidden: &Tensor,
        train: bool,
    ) -> DecoderOutput {
        let packed = PackedOrder::new(trg_lengths);
        let embedded = packed
            .sort(trg, 0)
            .apply(&self.embedding)
            .dropout(self.dropout, train);

        let (outputs, hidden) = packed.run_gru(&self.gru, &embedded, &packed.sort(hidden, 0));
        let outputs = packed.restore(&outputs, 0);
        let hidden = packed.restore(&hidden, 0);

        let mask = attention_mask(
            src_lengths,
            trg_lengths,
            encoder_out.size()[1],
            outputs.size()[1],
            outputs.device(),
        );
        let (attended, _) = self.attention.forward(&outputs, encoder_out, &mask);
        let log_probs = attended.apply(&self.fc_out).log_softmax(-1, Kind::Float);

        DecoderOutput { log_probs, hidden }
    }
}

pub struct Seq2Seq {
    pub encoder: Encoder,
    pub decoder: Decoder,
    pub device: Device,
}

impl Seq2Seq {
    pub fn new(encoder: Encoder, decoder: Decoder, device: Device) -> Self {
        Seq2Seq {
            encoder,
            decoder,
            device,
        }
    }

    /// Build both halves under `vs/encoder` and `vs/decoder`.
    pub fn build(vs: &nn::Path, cfg: &ModelConfig) -> Self {
        let encoder = Encoder::new(&(vs / "encoder"), cfg);
        let decoder = Decoder::new(&(vs / "decoder"), cfg);
        Seq2Seq::new(encoder, decoder, vs.device())
    }

    /// Teacher forced pass, returns `[B, Ty, V]` log-probabilities.
    pub fn forward_t(
        &self,
        src: &Tensor,
        src_lengths: &[i64],
        trg: &Tensor,
        trg_lengths: &[i64],
        train: bool,
    ) -> Tensor {
        let (encoder_out, hidden) = self.encoder.forward_t(src, src_lengths, train);
        self.decoder
            .forward_t(&encoder_out, src_lengths, trg, trg_lengths, &hidden, train)
            .log_probs
    }

    /// Greedy decoding. Every step feeds back the previous prediction,
    /// starting from `bos`, and carries the decoder state. Stops after
    /// `max_length` steps or once every row has emitted `eos`.
    ///
    /// Returns `[B, steps]` token ids.
    pub fn translate(
        &self,
        src: &Tensor,
        src_lengths: &[i64],
        bos: i64,
        eos: i64,
        max_length: i64,
    ) -> Tensor {
        tch::no_grad(|| {
            let (encoder_out, mut hidden) = self.encoder.forward_t(src, src_lengths, false);
            let batch_size = src.size()[0];
            let step_lengths = vec![1i64; batch_size as usize];

            let mut input = Tensor::full([batch_size, 1], bos, (Kind::Int64, self.device));
            let mut finished = Tensor::zeros([batch_size], (Kind::Bool, self.device));
            let mut predictions = Vec::with_capacity(max_length.max(0) as usize);

            for _ in 0..max_length {
                let step = self.decoder.forward_t(
                    &encoder_out,
                    src_lengths,
                    &input,
                    &step_lengths,
                    &hidden,
                    false,
                );
                hidden = step.hidden;
                input = step.log_probs.argmax(-1, false);
                predictions.push(input.shallow_clone());

                finished = finished.logical_or(&input.squeeze_dim(1).eq(eos));
                if finished.all().to_kind(Kind::Int64).int64_value(&[]) != 0 {
                    break;
                }
            }

            if predictions.is_empty() {
                Tensor::zeros([batch_size, 0], (Kind::Int64, self.device))
            } else {
                Tensor::cat(&predictions, 1)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            src_vocab_size: 12,
            trg_vocab_size: 9,
            embed_size: 4,
            enc_hidden_size: 3,
            dec_hidden_size: 5,
            dropout: 0.2,
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f64 {
        (a - b).abs().max().double_value(&[])
    }

    #[test]
    fn encoder_shapes() {
        let vs = nn::VarStore::new(Device::Cpu);
        let cfg = tiny_config();
        let encoder = Encoder::new(&vs.root(), &cfg);
        let src = Tensor::from_slice(&[2i64, 5, 6, 3, 2, 7, 3, 0]).view([2, 4]);
        let (out, hidden) = encoder.forward_t(&src, &[4, 3], false);
        assert_eq!(out.size(), vec![2, 4, 6]);
        assert_eq!(hidden.size(), vec![2, 5]);
    }

    #[test]
    fn encoder_ignores_row_order_and_padding() {
        tch::manual_seed(1);
        let vs = nn::VarStore::new(Device::Cpu);
        let encoder = Encoder::new(&vs.root(), &tiny_config());

        let src = Tensor::from_slice(&[2i64, 3, 0, 0, 2, 5, 6, 3]).view([2, 4]);
        let (out, hidden) = encoder.forward_t(&src, &[2, 4], false);

        // swap rows and fill the padding with real tokens
        let swapped = Tensor::from_slice(&[2i64, 5, 6, 3, 2, 3, 9, 9]).view([2, 4]);
        let (out_s, hidden_s) = encoder.forward_t(&swapped, &[4, 2], false);

        assert!(max_abs_diff(&hidden.get(0), &hidden_s.get(1)) < 1e-6);
        assert!(max_abs_diff(&hidden.get(1), &hidden_s.get(0)) < 1e-6);
        assert!(max_abs_diff(&out.get(1), &out_s.get(0)) < 1e-6);
        assert!(max_abs_diff(&out.get(0).narrow(0, 0, 2), &out_s.get(1).narrow(0, 0, 2)) < 1e-6);
    }

    #[test]
    fn attention_mask_covers_padding() {
        let mask = attention_mask(&[2, 3], &[1, 2], 3, 2, Device::Cpu);
        assert_eq!(mask.size(), vec![2, 2, 3]);
        let flat = Vec::<i64>::try_from(&mask.to_kind(Kind::Int64).view([-1])).unwrap();
        assert_eq!(flat, vec![0, 0, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn attention_weights_skip_padded_sources() {
        let vs = nn::VarStore::new(Device::Cpu);
        let attention = Attention::new(&vs.root(), 3, 5);
        let output = Tensor::randn([2, 2, 5], (Kind::Float, Device::Cpu));
        let context = Tensor::randn([2, 4, 6], (Kind::Float, Device::Cpu));
        let mask = attention_mask(&[2, 4], &[2, 2], 4, 2, Device::Cpu);

        let (attended, weights) = attention.forward(&output, &context, &mask);
        assert_eq!(attended.size(), vec![2, 2, 5]);
        assert_eq!(weights.size(), vec![2, 2, 4]);

        let sums = weights.sum_dim_intlist(&[2i64][..], false, Kind::Float);
        assert!(max_abs_diff(&sums, &sums.ones_like()) < 1e-5);
        let padded = weights.get(0).narrow(1, 2, 2).abs().max().double_value(&[]);
        assert!(padded < 1e-6);
    }

    #[test]
    fn decoder_emits_log_probabilities() {
        let vs = nn::VarStore::new(Device::Cpu);
        let cfg = tiny_config();
        let model = Seq2Seq::build(&vs.root(), &cfg);

        let src = Tensor::from_slice(&[2i64, 5, 6, 3, 2, 7, 3, 0]).view([2, 4]);
        let trg = Tensor::from_slice(&[2i64, 4, 5, 2, 6, 0]).view([2, 3]);
        let log_probs = model.forward_t(&src, &[4, 3], &trg, &[3, 2], true);
        assert_eq!(log_probs.size(), vec![2, 3, 9]);

        let total = log_probs.exp().sum_dim_intlist(&[-1i64][..], false, Kind::Float);
        assert!(max_abs_diff(&total, &total.ones_like()) < 1e-5);
    }

    #[test]
    fn translate_is_bounded_by_max_length() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = Seq2Seq::build(&vs.root(), &tiny_config());
        let src = Tensor::from_slice(&[2i64, 5, 6, 3, 2, 7, 3, 0]).view([2, 4]);

        let ids = model.translate(&src, &[4, 3], 2, 3, 6);
        let size = ids.size();
        assert_eq!(size[0], 2);
        assert!(size[1] >= 1 && size[1] <= 6);
        assert_eq!(ids.kind(), Kind::Int64);

        let none = model.translate(&src, &[4, 3], 2, 3, 0);
        assert_eq!(none.size(), vec![2, 0]);
    }

    #[test]
    fn translate_stops_once_every_row_emits_eos() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = Seq2Seq::build(&vs.root(), &tiny_config());
        let eos = 3;
        tch::no_grad(|| {
            let mut bias = model.decoder.fc_out.bs.as_ref().unwrap().shallow_clone();
            let _ = bias.fill_(-1e4);
            let _ = bias.get(eos).fill_(1e4);
        });

        let src = Tensor::from_slice(&[2i64, 5, 6, 3, 2, 7, 3, 0]).view([2, 4]);
        let ids = model.translate(&src, &[4, 3], 2, eos, 6);
        assert_eq!(ids.size(), vec![2, 1]);
        assert_eq!(Vec::<i64>::try_from(&ids.reshape([-1])).unwrap(), vec![eos, eos]);
    }

    #[test]
    fn translate_feeds_back_predictions_and_state() {
        tch::manual_seed(3);
        let vs = nn::VarStore::new(Device::Cpu);
        let model = Seq2Seq::build(&vs.root(), &tiny_config());
        let src = Tensor::from_slice(&[2i64, 5, 6, 3, 2, 7, 3, 0, 2, 4, 0, 0]).view([3, 4]);
        let src_lengths = [4i64, 3, 2];
        let steps = 5;

        // eos = -1 never matches, so all steps are decoded
        let ids = model.translate(&src, &src_lengths, 2, -1, steps);
        assert_eq!(ids.size(), vec![3, steps]);

        let expected = tch::no_grad(|| {
            let (encoder_out, mut hidden) = model.encoder.forward_t(&src, &src_lengths, false);
            let mut input = Tensor::full([3, 1], 2, (Kind::Int64, Device::Cpu));
            let mut columns = Vec::new();
            for _ in 0..steps {
                let step = model.decoder.forward_t(
                    &encoder_out,
                    &src_lengths,
                    &input,
                    &[1, 1, 1],
                    &hidden,
                    false,
                );
                hidden = step.hidden;
                input = step.log_probs.argmax(-1, false);
                columns.push(input.shallow_clone());
            }
            Tensor::cat(&columns, 1)
        });

        assert_eq!(
            Vec::<i64>::try_from(&ids.reshape([-1])).unwrap(),
            Vec::<i64>::try_from(&expected.reshape([-1])).unwrap()
        );
    }
}
