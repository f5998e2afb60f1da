use crate::common::*;

pub use conv_2d_::*;
pub use conv_init::*;

mod conv_init {
    use super::*;

    /// Hyperparameters of a 2D convolution.
    ///
    /// It doubles as the serialized form of a convolution in the architecture
    /// description, so it always reflects the actual channel counts of the
    /// layer it was taken from.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Conv2DInit {
        pub in_c: usize,
        pub out_c: usize,
        pub k: [usize; 2],
        pub s: [usize; 2],
        pub p: [usize; 2],
        pub d: [usize; 2],
        pub g: usize,
        pub bias: bool,
        #[serde(skip, default = "default_ws_init")]
        pub ws_init: nn::Init,
        #[serde(skip, default = "default_bs_init")]
        pub bs_init: nn::Init,
    }

    impl Conv2DInit {
        pub fn new(in_c: usize, out_c: usize, k: usize) -> Self {
            Self {
                in_c,
                out_c,
                k: [k; 2],
                s: [1; 2],
                p: [k / 2; 2],
                d: [1; 2],
                g: 1,
                bias: true,
                ws_init: default_ws_init(),
                bs_init: default_bs_init(),
            }
        }

        pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>) -> Result<Conv2D> {
            let path = path.borrow();
            let Self {
                in_c,
                out_c,
                k,
                s,
                p,
                d,
                g,
                bias,
                ws_init,
                bs_init,
            } = self;

            ensure!(
                g > 0 && in_c % g == 0 && out_c % g == 0,
                "in_c and out_c must be multiples of groups, but get in_c={}, out_c={}, groups={}",
                in_c,
                out_c,
                g
            );
            ensure!(in_c > 0 && out_c > 0, "zero-sized convolution is not allowed");

            let weight = path.var(
                "weight",
                &[
                    out_c as i64,
                    (in_c / g) as i64,
                    k[0] as i64,
                    k[1] as i64,
                ],
                ws_init,
            );
            let bias = bias.then(|| path.var("bias", &[out_c as i64], bs_init));

            Conv2D::from_parts(weight, bias, s, p, d, g)
        }
    }

    fn default_ws_init() -> nn::Init {
        nn::Init::KaimingUniform
    }

    fn default_bs_init() -> nn::Init {
        nn::Init::Const(0.0)
    }
}

mod conv_2d_ {
    use super::*;

    /// A 2D convolution that owns its parameters.
    ///
    /// Channel counts and kernel size are read from the weight tensor of shape
    /// `[out_c, in_c / groups, kh, kw]`.
    #[derive(Debug)]
    pub struct Conv2D {
        pub(crate) weight: Tensor,
        pub(crate) bias: Option<Tensor>,
        stride: [i64; 2],
        padding: [i64; 2],
        dilation: [i64; 2],
        groups: i64,
    }

    impl Conv2D {
        pub fn from_parts(
            weight: Tensor,
            bias: Option<Tensor>,
            stride: [usize; 2],
            padding: [usize; 2],
            dilation: [usize; 2],
            groups: usize,
        ) -> Result<Self> {
            let (out_c, _, _, _) = weight
                .size4()
                .map_err(|_| format_err!("convolution weight must be a 4D tensor"))?;
            ensure!(
                groups > 0 && out_c % groups as i64 == 0,
                "out_c={} is not a multiple of groups={}",
                out_c,
                groups
            );
            if let Some(bias) = &bias {
                ensure!(
                    bias.size() == [out_c],
                    "bias shape {:?} does not match out_c={}",
                    bias.size(),
                    out_c
                );
            }

            let to_i64 = |[a, b]: [usize; 2]| [a as i64, b as i64];

            Ok(Self {
                weight,
                bias,
                stride: to_i64(stride),
                padding: to_i64(padding),
                dilation: to_i64(dilation),
                groups: groups as i64,
            })
        }

        /// Builds a convolution with the same hyperparameters but new parameters.
        pub fn with_parameters(&self, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
            let [_, _, kh, kw] = self.weight_shape();
            let (_, _, new_kh, new_kw) = weight
                .size4()
                .map_err(|_| format_err!("convolution weight must be a 4D tensor"))?;
            ensure!(
                (kh, kw) == (new_kh as usize, new_kw as usize),
                "kernel size changed from {}x{} to {}x{}",
                kh,
                kw,
                new_kh,
                new_kw
            );
            ensure!(
                bias.is_some() == self.bias.is_some(),
                "bias presence must not change"
            );

            Self::from_parts(
                weight,
                bias,
                self.stride(),
                self.padding(),
                self.dilation(),
                self.groups(),
            )
        }

        fn weight_shape(&self) -> [usize; 4] {
            let size = self.weight.size();
            [
                size[0] as usize,
                size[1] as usize,
                size[2] as usize,
                size[3] as usize,
            ]
        }

        pub fn out_channels(&self) -> usize {
            self.weight_shape()[0]
        }

        pub fn in_channels(&self) -> usize {
            self.weight_shape()[1] * self.groups()
        }

        pub fn ksize(&self) -> [usize; 2] {
            let [_, _, kh, kw] = self.weight_shape();
            [kh, kw]
        }

        pub fn stride(&self) -> [usize; 2] {
            let [a, b] = self.stride;
            [a as usize, b as usize]
        }

        pub fn padding(&self) -> [usize; 2] {
            let [a, b] = self.padding;
            [a as usize, b as usize]
        }

        pub fn dilation(&self) -> [usize; 2] {
            let [a, b] = self.dilation;
            [a as usize, b as usize]
        }

        pub fn groups(&self) -> usize {
            self.groups as usize
        }

        pub fn weight(&self) -> &Tensor {
            &self.weight
        }

        pub fn bias(&self) -> Option<&Tensor> {
            self.bias.as_ref()
        }

        pub fn init(&self) -> Conv2DInit {
            Conv2DInit {
                in_c: self.in_channels(),
                out_c: self.out_channels(),
                k: self.ksize(),
                s: self.stride(),
                p: self.padding(),
                d: self.dilation(),
                g: self.groups(),
                bias: self.bias.is_some(),
                ..Conv2DInit::new(1, 1, 1)
            }
        }

        pub fn forward(&self, input: &Tensor) -> Tensor {
            let Self {
                ref stride,
                ref padding,
                ref dilation,
                groups,
                ref weight,
                ref bias,
            } = *self;

            input.convolution(
                weight,
                bias.as_ref(),
                stride,
                padding,
                dilation,
                false,
                &[0, 0],
                groups,
            )
        }

        pub fn shallow_clone(&self) -> Self {
            Self {
                weight: self.weight.shallow_clone(),
                bias: self.bias.as_ref().map(Tensor::shallow_clone),
                ..*self
            }
        }

        pub fn to_device(&self, device: Device) -> Self {
            Self {
                weight: self.weight.to_device(device),
                bias: self.bias.as_ref().map(|bias| bias.to_device(device)),
                ..*self
            }
        }
    }
}
