use crate::common::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchNorm2DInit {
    pub cudnn_enabled: bool,
    pub eps: R64,
    pub momentum: R64,
    pub affine: bool,
}

impl Default for BatchNorm2DInit {
    fn default() -> Self {
        Self {
            cudnn_enabled: true,
            eps: r64(1e-5),
            momentum: r64(0.1),
            affine: true,
        }
    }
}

impl BatchNorm2DInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>, channels: usize) -> BatchNorm2D {
        let path = path.borrow();
        let Self {
            cudnn_enabled,
            eps,
            momentum,
            affine,
        } = self;
        let channels = channels as i64;

        let (ws, bs) = if affine {
            let ws = path.var("weight", &[channels], nn::Init::Const(1.0));
            let bs = path.var("bias", &[channels], nn::Init::Const(0.0));
            (Some(ws), Some(bs))
        } else {
            (None, None)
        };

        BatchNorm2D {
            running_mean: path.zeros_no_train("running_mean", &[channels]),
            running_var: path.ones_no_train("running_var", &[channels]),
            ws,
            bs,
            cudnn_enabled,
            eps: eps.raw(),
            momentum: momentum.raw(),
        }
    }
}

/// Per-channel statistics and affine parameters of a batch normalization layer.
#[derive(Debug)]
pub struct BatchNormParams {
    pub ws: Option<Tensor>,
    pub bs: Option<Tensor>,
    pub running_mean: Tensor,
    pub running_var: Tensor,
}

#[derive(Debug)]
pub struct BatchNorm2D {
    pub(crate) running_mean: Tensor,
    pub(crate) running_var: Tensor,
    pub(crate) ws: Option<Tensor>,
    pub(crate) bs: Option<Tensor>,
    cudnn_enabled: bool,
    eps: f64,
    momentum: f64,
}

impl nn::ModuleT for BatchNorm2D {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        let Self {
            ref running_mean,
            ref running_var,
            ref ws,
            ref bs,
            momentum,
            eps,
            cudnn_enabled,
        } = *self;

        Tensor::batch_norm(
            input,
            ws.as_ref(),
            bs.as_ref(),
            Some(running_mean),
            Some(running_var),
            train,
            momentum,
            eps,
            cudnn_enabled,
        )
    }
}

impl BatchNorm2D {
    pub fn channels(&self) -> usize {
        self.running_mean.size()[0] as usize
    }

    pub fn params(&self) -> BatchNormParams {
        let Self {
            ws,
            bs,
            running_mean,
            running_var,
            ..
        } = self;

        BatchNormParams {
            ws: ws.as_ref().map(Tensor::shallow_clone),
            bs: bs.as_ref().map(Tensor::shallow_clone),
            running_mean: running_mean.shallow_clone(),
            running_var: running_var.shallow_clone(),
        }
    }

    /// Builds a normalization layer with the same options but new per-channel tensors.
    pub fn with_params(&self, params: BatchNormParams) -> Result<Self> {
        let BatchNormParams {
            ws,
            bs,
            running_mean,
            running_var,
        } = params;

        let channels = running_mean
            .size1()
            .map_err(|_| format_err!("running_mean must be a 1D tensor"))?;
        ensure!(
            ws.is_some() == self.ws.is_some() && bs.is_some() == self.bs.is_some(),
            "affine parameters must not be added or dropped"
        );
        let shapes_agree = iter_params(&ws, &bs, &running_var).all(|t| t.size() == [channels]);
        ensure!(
            shapes_agree,
            "every per-channel tensor must have {} entries",
            channels
        );

        Ok(Self {
            running_mean,
            running_var,
            ws,
            bs,
            ..*self
        })
    }

    pub fn init(&self) -> BatchNorm2DInit {
        BatchNorm2DInit {
            cudnn_enabled: self.cudnn_enabled,
            eps: r64(self.eps),
            momentum: r64(self.momentum),
            affine: self.ws.is_some(),
        }
    }

    pub fn has_nan(&self) -> bool {
        let Self {
            ws,
            bs,
            running_mean,
            running_var,
            ..
        } = self;

        iter_params(ws, bs, running_mean)
            .chain([running_var])
            .any(|t| bool::from(t.isnan().any()))
    }

    pub fn shallow_clone(&self) -> Self {
        self.map_tensors(Tensor::shallow_clone)
    }

    pub fn to_device(&self, device: Device) -> Self {
        self.map_tensors(|t| t.to_device(device))
    }

    fn map_tensors(&self, f: impl Fn(&Tensor) -> Tensor) -> Self {
        Self {
            running_mean: f(&self.running_mean),
            running_var: f(&self.running_var),
            ws: self.ws.as_ref().map(&f),
            bs: self.bs.as_ref().map(&f),
            ..*self
        }
    }
}

fn iter_params<'a>(
    ws: &'a Option<Tensor>,
    bs: &'a Option<Tensor>,
    stat: &'a Tensor,
) -> impl Iterator<Item = &'a Tensor> {
    ws.iter().chain(bs.iter()).chain([stat])
}
