//! Filter importance by normalized L1 norm.

use crate::{common::*, ratio::CutRatio};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterRank {
    pub index: usize,
    pub score: R64,
}

/// Scores every output filter of a `[out, in, kh, kw]` weight.
///
/// The score of a filter is its L1 norm divided by the L1 norm of the whole
/// weight. An all-zero weight scores every filter zero.
pub fn filter_scores(weight: &Tensor) -> PruneResult<Vec<FilterRank>> {
    let (out_c, _, _, _) = weight.size4().map_err(|_| {
        PruneError::InvalidPruneTarget(format!(
            "expect a 4D convolution weight, but get shape {:?}",
            weight.size()
        ))
    })?;

    let norms = tch::no_grad(|| -> Result<Tensor, TchError> {
        weight
            .to_device(Device::Cpu)
            .f_abs()?
            .f_sum_dim_intlist(&[1, 2, 3], false, Kind::Double)
    })?;
    let norms = Vec::<f64>::from(&norms);
    debug_assert_eq!(norms.len(), out_c as usize);

    let total: f64 = norms.iter().sum();
    norms
        .into_iter()
        .enumerate()
        .map(|(index, norm)| {
            let score = if total > 0.0 { norm / total } else { 0.0 };
            let score = R64::try_new(score).ok_or_else(|| {
                PruneError::InvalidPruneTarget(format!("filter {} has a non-finite score", index))
            })?;
            Ok(FilterRank { index, score })
        })
        .collect()
}

/// Returns the `k` lowest scored filters in ascending score order.
///
/// Equal scores are ordered by filter index, so the lower index is selected
/// first.
pub fn lowest_filters(weight: &Tensor, k: usize) -> PruneResult<Vec<FilterRank>> {
    if k == 0 {
        return Ok(vec![]);
    }

    // max-heap holding the k smallest (score, index) pairs seen so far
    let mut heap = BinaryHeap::with_capacity(k + 1);
    for FilterRank { index, score } in filter_scores(weight)? {
        if heap.len() < k {
            heap.push((score, index));
        } else if let Some(&top) = heap.peek() {
            if (score, index) < top {
                heap.pop();
                heap.push((score, index));
            }
        }
    }

    let ranks = heap
        .into_sorted_vec()
        .into_iter()
        .map(|(score, index)| FilterRank { index, score })
        .collect();
    Ok(ranks)
}

/// Selects the filters to remove from a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterRanker {
    pub cut_ratio: CutRatio,
}

impl FilterRanker {
    pub fn new(cut_ratio: CutRatio) -> Self {
        Self { cut_ratio }
    }

    pub fn num_filters(&self, conv: &Conv2D) -> usize {
        self.cut_ratio.num_filters(conv.out_channels())
    }

    pub fn select(&self, conv: &Conv2D) -> PruneResult<Vec<FilterRank>> {
        lowest_filters(conv.weight(), self.num_filters(conv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tch::kind::FLOAT_CPU;

    /// A weight whose filter `i` has L1 norm `norms[i] * 4`.
    fn weight_with_norms(norms: &[f32]) -> Tensor {
        Tensor::of_slice(norms)
            .view([-1, 1, 1, 1])
            .expand(&[norms.len() as i64, 1, 2, 2], false)
            .contiguous()
    }

    #[test]
    fn scores_are_normalized() -> Result<()> {
        let weight = Tensor::randn(&[16, 8, 3, 3], FLOAT_CPU);
        let ranks = filter_scores(&weight)?;
        assert_eq!(ranks.len(), 16);

        let total: f64 = ranks.iter().map(|rank| rank.score.raw()).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-9);
        assert!(ranks.iter().enumerate().all(|(i, rank)| rank.index == i));
        Ok(())
    }

    #[test]
    fn lowest_filters_prefers_lower_index_on_ties() -> Result<()> {
        let weight = weight_with_norms(&[3.0, -1.0, 2.0, 1.0, 5.0, 1.0, 0.5]);
        let ranks = lowest_filters(&weight, 3)?;
        let indices: Vec<_> = ranks.iter().map(|rank| rank.index).collect();
        assert_eq!(indices, [6, 1, 3]);
        assert!(ranks.windows(2).all(|pair| pair[0].score <= pair[1].score));
        Ok(())
    }

    #[test]
    fn ranking_is_idempotent() -> Result<()> {
        let weight = Tensor::randn(&[32, 4, 3, 3], FLOAT_CPU);
        let first = lowest_filters(&weight, 6)?;
        let second = lowest_filters(&weight, 6)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn zero_weight_scores_zero() -> Result<()> {
        let weight = Tensor::zeros(&[4, 2, 1, 1], FLOAT_CPU);
        let ranks = lowest_filters(&weight, 2)?;
        assert_eq!(ranks.iter().map(|rank| rank.index).collect::<Vec<_>>(), [0, 1]);
        assert!(ranks.iter().all(|rank| rank.score.raw() == 0.0));
        Ok(())
    }

    #[test]
    fn non_4d_weight_is_rejected() {
        let weight = Tensor::zeros(&[4, 2], FLOAT_CPU);
        assert!(matches!(
            filter_scores(&weight),
            Err(PruneError::InvalidPruneTarget(_))
        ));
    }
}
