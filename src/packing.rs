//! Variable-length recurrence over padded batches.
//!
//! Rows are sorted by length, longest first, so that at time step `t` the
//! rows still inside their sentence form a prefix of the batch. The GRU is
//! stepped over that prefix only; finished rows keep their last state and
//! emit zeros. Results are put back in the caller's row order afterwards.

use tch::nn::{GRUState, RNN, GRU};
use tch::{Kind, Tensor};

#[derive(Debug, Clone, PartialEq)]
pub struct PackedOrder {
    /// `order[i]` is the original row placed at sorted position `i`.
    order: Vec<i64>,
    /// `restore[r]` is the sorted position of original row `r`.
    restore: Vec<i64>,
    sorted_lengths: Vec<i64>,
    /// Number of active rows at every time step.
    batch_sizes: Vec<i64>,
}

impl PackedOrder {
    pub fn new(lengths: &[i64]) -> Self {
        let mut order: Vec<i64> = (0..lengths.len() as i64).collect();
        order.sort_by(|&a, &b| lengths[b as usize].cmp(&lengths[a as usize]));

        let mut restore = vec![0i64; lengths.len()];
        for (pos, &row) in order.iter().enumerate() {
            restore[row as usize] = pos as i64;
        }

        let sorted_lengths: Vec<i64> = order.iter().map(|&row| lengths[row as usize]).collect();
        let max_len = sorted_lengths.first().copied().unwrap_or(0).max(0);
        let batch_sizes = (0..max_len)
            .map(|t| sorted_lengths.iter().filter(|&&len| len > t).count() as i64)
            .collect();

        PackedOrder {
            order,
            restore,
            sorted_lengths,
            batch_sizes,
        }
    }

    pub fn sorted_lengths(&self) -> &[i64] {
        &self.sorted_lengths
    }

    pub fn batch_sizes(&self) -> &[i64] {
        &self.batch_sizes
    }

    /// Reorder `dim` into sorted order.
    pub fn sort(&self, tensor: &Tensor, dim: i64) -> Tensor {
        let index = Tensor::from_slice(self.order.as_slice()).to_device(tensor.device());
        tensor.index_select(dim, &index)
    }

    /// Undo [`PackedOrder::sort`].
    pub fn restore(&self, tensor: &Tensor, dim: i64) -> Tensor {
        let index = Tensor::from_slice(self.restore.as_slice()).to_device(tensor.device());
        tensor.index_select(dim, &index)
    }

    /// Step `gru` over sorted `inputs [B, T, E]` starting from sorted
    /// `h0 [B, H]`. Returns zero-padded `outputs [B, T, H]` and the state of
    /// every row after its last valid token, both still in sorted order.
    pub fn run_gru(&self, gru: &GRU, inputs: &Tensor, h0: &Tensor) -> (Tensor, Tensor) {
        let (batch, steps) = (inputs.size()[0], inputs.size()[1]);
        let hidden_size = h0.size()[1];

        let mut hidden = h0.shallow_clone();
        let mut outputs = Vec::with_capacity(steps as usize);
        for (t, &active) in self.batch_sizes.iter().enumerate().take(steps as usize) {
            let x = inputs.narrow(0, 0, active).select(1, t as i64);
            let h = hidden.narrow(0, 0, active).unsqueeze(0);
            let GRUState(next) = gru.step(&x, &GRUState(h));
            let next = next.squeeze_dim(0);

            if active < batch {
                let idle = hidden.narrow(0, active, batch - active);
                outputs.push(Tensor::cat(&[&next, &idle.zeros_like()], 0));
                hidden = Tensor::cat(&[&next, &idle], 0);
            } else {
                outputs.push(next.shallow_clone());
                hidden = next;
            }
        }

        let done = outputs.len() as i64;
        let out = if done == 0 {
            Tensor::zeros([batch, steps, hidden_size], (Kind::Float, inputs.device()))
        } else if done < steps {
            let tail = Tensor::zeros(
                [batch, steps - done, hidden_size],
                (Kind::Float, inputs.device()),
            );
            Tensor::cat(&[Tensor::stack(&outputs, 1), tail], 1)
        } else {
            Tensor::stack(&outputs, 1)
        };
        (out, hidden)
    }
}

/// Reverse every row of `tensor [B, T, F]` within its first `lengths[b]`
/// steps; padding stays at the end.
pub fn reverse_padded(tensor: &Tensor, lengths: &[i64]) -> Tensor {
    let size = tensor.size();
    let (batch, steps) = (size[0], size[1]);

    let mut index = Vec::with_capacity((batch * steps) as usize);
    for &len in lengths {
        let len = len.min(steps);
        index.extend((0..steps).map(|t| if t < len { len - 1 - t } else { t }));
    }

    let index = Tensor::from_slice(index.as_slice())
        .view([batch, steps, 1])
        .to_device(tensor.device())
        .expand(size.as_slice(), false);
    tensor.gather(1, &index, false)
}
