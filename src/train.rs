use tch::nn::{self, OptimizerConfig};
use tch::Device;
use tracing::{debug, info};

use crate::batch::{PaddedBatch, TranslationBatch};
use crate::config::TrainConfig;
use crate::error::Result;
use crate::loss::masked_nll;
use crate::model::{ModelConfig, Seq2Seq};

/// Word-weighted loss over a set of batches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossStats {
    pub loss: f64,
    pub words: i64,
}

impl LossStats {
    pub fn perplexity(&self) -> f64 {
        self.loss.exp()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LossAccumulator {
    total: f64,
    words: i64,
}

impl LossAccumulator {
    fn add(&mut self, loss: f64, words: i64) {
        self.total += loss * words as f64;
        self.words += words;
    }

    fn finish(self) -> Option<LossStats> {
        (self.words > 0).then(|| LossStats {
            loss: self.total / self.words as f64,
            words: self.words,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TrainReport {
    pub epoch_losses: Vec<LossStats>,
    pub evaluations: Vec<(usize, LossStats)>,
    pub held_out_batches: usize,
}

/// Move every `every`-th batch out of the training set. Training batches
/// keep their position in the full batch list.
pub fn split_holdout(
    batches: Vec<PaddedBatch>,
    every: usize,
) -> (Vec<(usize, PaddedBatch)>, Vec<PaddedBatch>) {
    let every = every.max(1);
    let (held_out, train): (Vec<_>, Vec<_>) = batches
        .into_iter()
        .enumerate()
        .partition(|(i, _)| i % every == 0);
    (train, held_out.into_iter().map(|(_, b)| b).collect())
}

pub struct Trainer {
    pub vs: nn::VarStore,
    pub model: Seq2Seq,
    opt: nn::Optimizer,
    cfg: TrainConfig,
}

impl Trainer {
    pub fn new(cfg: TrainConfig, model_cfg: &ModelConfig, device: Device) -> Result<Self> {
        cfg.validate()?;
        let vs = nn::VarStore::new(device);
        let model = Seq2Seq::build(&vs.root(), model_cfg);
        let opt = nn::Adam::default().build(&vs, cfg.learning_rate)?;
        info!(
            parameters = vs.trainable_variables().iter().map(|t| t.numel()).sum::<usize>(),
            ?device,
            "model initialized"
        );
        Ok(Trainer {
            vs,
            model,
            opt,
            cfg,
        })
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    /// One optimizer update on a teacher forced batch. Returns the loss.
    pub fn train_step(&mut self, batch: &TranslationBatch) -> f64 {
        let log_probs = self.model.forward_t(
            &batch.src,
            &batch.src_lengths,
            &batch.decoder_input,
            &batch.target_lengths,
            true,
        );
        let loss = masked_nll(&log_probs, &batch.targets, &batch.target_mask());
        self.opt.backward_step_clip_norm(&loss, self.cfg.clip_norm);
        loss.double_value(&[])
    }

    /// Loss without dropout or gradients; `None` when there is nothing to
    /// score.
    pub fn evaluate(&self, batches: &[PaddedBatch]) -> Option<LossStats> {
        let device = self.device();
        let mut acc = LossAccumulator::default();
        tch::no_grad(|| {
            for batch in batches {
                let batch = batch.to_tensors(device);
                let log_probs = self.model.forward_t(
                    &batch.src,
                    &batch.src_lengths,
                    &batch.decoder_input,
                    &batch.target_lengths,
                    false,
                );
                let loss = masked_nll(&log_probs, &batch.targets, &batch.target_mask());
                acc.add(loss.double_value(&[]), batch.num_words());
            }
        });
        acc.finish()
    }

    /// Train for `cfg.epochs` epochs. Every `holdout_every`-th batch is kept
    /// aside and scored every `eval_every` epochs; `on_eval` runs after each
    /// evaluation and once more when training ends.
    pub fn fit<F>(&mut self, batches: Vec<PaddedBatch>, mut on_eval: F) -> Result<TrainReport>
    where
        F: FnMut(&Trainer, usize) -> Result<()>,
    {
        let (train, held_out) = split_holdout(batches, self.cfg.holdout_every);
        info!(train = train.len(), held_out = held_out.len(), "batches split");

        let device = self.device();
        let epochs = self.cfg.epochs;
        let mut report = TrainReport {
            epoch_losses: Vec::with_capacity(epochs),
            evaluations: Vec::new(),
            held_out_batches: held_out.len(),
        };

        for epoch in 0..epochs {
            let mut acc = LossAccumulator::default();
            for (it, batch) in &train {
                let batch = batch.to_tensors(device);
                let loss = self.train_step(&batch);
                acc.add(loss, batch.num_words());

                if *it % self.cfg.log_every == 0 {
                    info!("Epoch {} / {}, Iteration: {}, Train Loss: {:.4}", epoch, epochs, it, loss);
                }
            }

            match acc.finish() {
                Some(stats) => {
                    info!("Epoch {} / {}, Train Loss: {:.4}", epoch, epochs, stats.loss);
                    report.epoch_losses.push(stats);
                }
                None => debug!(epoch, "no training batches"),
            }

            if epoch != 0 && epoch % self.cfg.eval_every == 0 {
                if let Some(stats) = self.evaluate(&held_out) {
                    info!(
                        "Test Loss: {:.4}, Perplexity: {:.4}",
                        stats.loss,
                        stats.perplexity()
                    );
                    report.evaluations.push((epoch, stats));
                }
                on_eval(self, epoch)?;
            }
        }

        on_eval(self, epochs)?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::make_batches;
    use crate::preprocess::TranslationData;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tch::{Kind, Tensor};

    fn toy_data() -> TranslationData {
        // BOS = 2, EOS = 3 on both sides
        TranslationData {
            src: vec![
                vec![2, 4, 3],
                vec![2, 5, 3],
                vec![2, 4, 5, 3],
                vec![2, 5, 4, 3],
                vec![2, 6, 3],
                vec![2, 6, 4, 3],
            ],
            trg: vec![
                vec![2, 4, 3],
                vec![2, 5, 3],
                vec![2, 4, 5, 3],
                vec![2, 5, 4, 3],
                vec![2, 6, 3],
                vec![2, 6, 4, 3],
            ],
        }
    }

    fn tiny(epochs: usize) -> (TrainConfig, ModelConfig) {
        let cfg = TrainConfig {
            epochs,
            batch_size: 2,
            embed_size: 8,
            enc_hidden_size: 8,
            dec_hidden_size: 16,
            dropout: 0.0,
            learning_rate: 1e-2,
            log_every: 1,
            eval_every: 1,
            holdout_every: 3,
            ..Default::default()
        };
        let model_cfg = cfg.model_config(7, 7);
        (cfg, model_cfg)
    }

    #[test]
    fn holdout_takes_every_nth_batch() {
        let data = toy_data();
        let mut rng = StdRng::seed_from_u64(0);
        let batches = make_batches(&data, 1, &mut rng, false);
        let (train, held_out) = split_holdout(batches.clone(), 3);
        assert_eq!(held_out, vec![batches[0].clone(), batches[3].clone()]);
        assert_eq!(train.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 2, 4, 5]);
        assert!(train.iter().all(|(i, b)| *b == batches[*i]));
    }

    #[test]
    fn loss_goes_down_on_a_memorisable_corpus() {
        tch::manual_seed(123);
        let (cfg, model_cfg) = tiny(1);
        let mut trainer = Trainer::new(cfg, &model_cfg, Device::Cpu).unwrap();

        let data = toy_data();
        let mut rng = StdRng::seed_from_u64(0);
        let batches = make_batches(&data, 6, &mut rng, false);
        let batch = batches[0].to_tensors(Device::Cpu);

        let first = trainer.train_step(&batch);
        let mut last = first;
        for _ in 0..50 {
            last = trainer.train_step(&batch);
        }
        assert!(last < first * 0.5, "loss {first} -> {last}");
    }

    #[test]
    fn fit_reports_epochs_and_evaluations() {
        tch::manual_seed(7);
        let (cfg, model_cfg) = tiny(3);
        let mut trainer = Trainer::new(cfg, &model_cfg, Device::Cpu).unwrap();

        let data = toy_data();
        let mut rng = StdRng::seed_from_u64(0);
        let batches = make_batches(&data, 1, &mut rng, false);

        let mut calls = Vec::new();
        let report = trainer
            .fit(batches, |_, epoch| {
                calls.push(epoch);
                Ok(())
            })
            .unwrap();

        assert_eq!(report.held_out_batches, 2);
        assert_eq!(report.epoch_losses.len(), 3);
        assert_eq!(
            report.evaluations.iter().map(|(e, _)| *e).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(calls, vec![1, 2, 3]);
        assert!(report.evaluations.iter().all(|(_, s)| s.loss.is_finite()));
    }

    #[test]
    fn evaluate_ignores_dropout() {
        tch::manual_seed(11);
        let (mut cfg, _) = tiny(1);
        cfg.dropout = 0.5;
        let model_cfg = cfg.model_config(7, 7);
        let trainer = Trainer::new(cfg, &model_cfg, Device::Cpu).unwrap();

        let mut rng = StdRng::seed_from_u64(0);
        let batches = make_batches(&toy_data(), 2, &mut rng, false);
        let first = trainer.evaluate(&batches).unwrap();
        let second = trainer.evaluate(&batches).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.words, 15);
    }

    fn total_update(before: &[Tensor], trainer: &Trainer) -> f64 {
        trainer
            .vs
            .trainable_variables()
            .iter()
            .zip(before)
            .map(|(after, before)| (after - before).abs().sum(Kind::Float).double_value(&[]))
            .sum()
    }

    #[test]
    fn train_step_clips_the_gradient_norm() {
        let data = toy_data();
        let mut rng = StdRng::seed_from_u64(0);
        let batch = make_batches(&data, 6, &mut rng, false)[0].to_tensors(Device::Cpu);

        let mut updates = Vec::new();
        for clip_norm in [5.0, 1e-12] {
            tch::manual_seed(5);
            let (mut cfg, model_cfg) = tiny(1);
            cfg.clip_norm = clip_norm;
            let mut trainer = Trainer::new(cfg, &model_cfg, Device::Cpu).unwrap();
            let before: Vec<Tensor> = trainer
                .vs
                .trainable_variables()
                .iter()
                .map(|t| t.detach().copy())
                .collect();
            trainer.train_step(&batch);
            updates.push(total_update(&before, &trainer));
        }
        // a vanishing clip norm leaves Adam's epsilon dominating the step
        assert!(updates[0] > 0.0);
        assert!(updates[1] < updates[0] * 1e-2, "updates {updates:?}");
    }

    #[test]
    fn evaluate_on_nothing_is_none() {
        let (cfg, model_cfg) = tiny(1);
        let trainer = Trainer::new(cfg, &model_cfg, Device::Cpu).unwrap();
        assert!(trainer.evaluate(&[]).is_none());
    }
}
