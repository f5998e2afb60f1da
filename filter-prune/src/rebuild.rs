//! Replacement layers with a subset of channels removed.
//!
//! The rebuilt layers copy the surviving slices in their original relative
//! order, so they compute exactly what the original layer computes on the
//! surviving channels.

use crate::common::*;

/// The channels that survive the removal of a set of channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepIndex {
    keep: Vec<i64>,
}

impl KeepIndex {
    pub fn new(total: usize, remove: &[usize]) -> PruneResult<Self> {
        if remove.is_empty() {
            return Err(PruneError::InvalidPruneTarget(
                "the removal set is empty".into(),
            ));
        }
        if let Some(&index) = remove.iter().find(|&&index| index >= total) {
            return Err(PruneError::InvalidPruneTarget(format!(
                "channel {} is out of range 0..{}",
                index, total
            )));
        }

        let remove: BTreeSet<usize> = remove.iter().copied().collect();
        if remove.len() >= total {
            return Err(PruneError::InvalidPruneTarget(format!(
                "removing all {} channels",
                total
            )));
        }

        let keep = (0..total)
            .filter(|index| !remove.contains(index))
            .map(|index| index as i64)
            .collect();
        Ok(Self { keep })
    }

    pub fn remaining(&self) -> usize {
        self.keep.len()
    }

    pub fn keep(&self) -> &[i64] {
        &self.keep
    }

    fn select(&self, tensor: &Tensor, dim: i64) -> PruneResult<Tensor> {
        let index = Tensor::of_slice(&self.keep).to_device(tensor.device());
        let selected = tch::no_grad(|| tensor.f_index_select(dim, &index))?;
        Ok(selected)
    }
}

fn ensure_ungrouped(conv: &Conv2D) -> PruneResult<()> {
    if conv.groups() != 1 {
        return Err(PruneError::InvalidPruneTarget(format!(
            "grouped convolution with {} groups cannot be pruned by filter",
            conv.groups()
        )));
    }
    Ok(())
}

/// Removes the output filters `remove` along with their bias entries.
pub fn shrink_output_channels(conv: &Conv2D, remove: &[usize]) -> PruneResult<Conv2D> {
    ensure_ungrouped(conv)?;
    let keep = KeepIndex::new(conv.out_channels(), remove)?;

    let weight = keep.select(conv.weight(), 0)?;
    let bias = conv.bias().map(|bias| keep.select(bias, 0)).transpose()?;
    conv.with_parameters(weight, bias)
        .map_err(|err| PruneError::InvalidPruneTarget(format!("{:#}", err)))
}

/// Removes the input channels `remove` from every filter.
pub fn shrink_input_channels(conv: &Conv2D, remove: &[usize]) -> PruneResult<Conv2D> {
    ensure_ungrouped(conv)?;
    let keep = KeepIndex::new(conv.in_channels(), remove)?;

    let weight = keep.select(conv.weight(), 1)?;
    let bias = conv.bias().map(Tensor::copy);
    conv.with_parameters(weight, bias)
        .map_err(|err| PruneError::InvalidPruneTarget(format!("{:#}", err)))
}

/// Removes the channels `remove` from the affine parameters and running statistics.
pub fn shrink_normalization(norm: &BatchNorm2D, remove: &[usize]) -> PruneResult<BatchNorm2D> {
    let keep = KeepIndex::new(norm.channels(), remove)?;
    let BatchNormParams {
        ws,
        bs,
        running_mean,
        running_var,
    } = norm.params();

    let params = BatchNormParams {
        ws: ws.map(|ws| keep.select(&ws, 0)).transpose()?,
        bs: bs.map(|bs| keep.select(&bs, 0)).transpose()?,
        running_mean: keep.select(&running_mean, 0)?,
        running_var: keep.select(&running_var, 0)?,
    };
    norm.with_params(params)
        .map_err(|err| PruneError::InvalidPruneTarget(format!("{:#}", err)))
}
