use tch::{Kind, Tensor};

/// Mean negative log-likelihood of `targets [B, T]` under
/// `log_probs [B, T, V]`, counting only positions where `mask [B, T]` is set.
pub fn masked_nll(log_probs: &Tensor, targets: &Tensor, mask: &Tensor) -> Tensor {
    let vocab_size = log_probs.size()[2];
    let log_probs = log_probs.reshape([-1, vocab_size]);
    let targets = targets.reshape([-1, 1]);
    let mask = mask.reshape([-1, 1]).to_kind(Kind::Float);

    let picked = log_probs.gather(1, &targets, false);
    -(picked * &mask).sum(Kind::Float) / mask.sum(Kind::Float)
}
