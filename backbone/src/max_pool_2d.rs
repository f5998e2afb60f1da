use crate::common::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MaxPool2D {
    pub k: usize,
    pub s: usize,
    pub p: usize,
    pub d: usize,
    pub ceil_mode: bool,
}

impl MaxPool2D {
    pub fn new(k: usize, s: usize) -> Self {
        Self {
            k,
            s,
            p: k / 2,
            d: 1,
            ceil_mode: false,
        }
    }

    pub fn forward(&self, xs: &Tensor) -> Tensor {
        let Self {
            k,
            s,
            p,
            d,
            ceil_mode,
        } = *self;
        let (k, s, p, d) = (k as i64, s as i64, p as i64, d as i64);
        xs.max_pool2d(&[k, k], &[s, s], &[p, p], &[d, d], ceil_mode)
    }
}

/// A channel-preserving operation defined outside this crate.
///
/// The pruning engine cannot see through it, so it never plans a channel
/// change across it. It forwards its input unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Opaque {
    pub name: String,
    pub channels: usize,
}

impl Opaque {
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_, c, _, _) = xs.size4()?;
        ensure!(
            c as usize == self.channels,
            "'{}' expects {} channels, but get {}",
            self.name,
            self.channels,
            c
        );
        Ok(xs.shallow_clone())
    }
}
