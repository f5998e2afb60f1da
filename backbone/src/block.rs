//! Residual units of the backbone.

use crate::{
    activation::Activation,
    batch_norm_2d::{BatchNorm2D, BatchNorm2DInit},
    common::*,
    conv_2d::{Conv2D, Conv2DInit},
    node::Slot,
};

pub use basic::*;
pub use bottleneck::*;
pub use downsample::*;

mod downsample {
    use super::*;

    /// The projection skip path: a strided 1x1 convolution followed by normalization.
    #[derive(Debug)]
    pub struct Downsample {
        pub(crate) conv: Conv2D,
        pub(crate) bn: BatchNorm2D,
    }

    impl Downsample {
        pub fn new<'p>(
            path: impl Borrow<nn::Path<'p>>,
            in_c: usize,
            out_c: usize,
            stride: usize,
            bn: BatchNorm2DInit,
        ) -> Result<Self> {
            let path = path.borrow();
            let conv = Conv2DInit {
                s: [stride; 2],
                bias: false,
                ..Conv2DInit::new(in_c, out_c, 1)
            }
            .build(path / "0")?;
            let bn = bn.build(path / "1", out_c);
            Ok(Self { conv, bn })
        }

        pub fn conv(&self) -> &Conv2D {
            &self.conv
        }

        pub fn bn(&self) -> &BatchNorm2D {
            &self.bn
        }

        pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
            self.bn.forward_t(&self.conv.forward(xs), train)
        }

        pub fn shallow_clone(&self) -> Self {
            Self {
                conv: self.conv.shallow_clone(),
                bn: self.bn.shallow_clone(),
            }
        }

        pub fn to_device(&self, device: Device) -> Self {
            Self {
                conv: self.conv.to_device(device),
                bn: self.bn.to_device(device),
            }
        }
    }
}

mod basic {
    use super::*;

    /// Two 3x3 convolutions with an identity or projection skip.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct BasicBlockInit {
        pub in_c: usize,
        /// Output width of the first convolution.
        pub mid_c: usize,
        pub out_c: usize,
        pub stride: usize,
        pub downsample: bool,
        pub activation: Activation,
        pub bn: BatchNorm2DInit,
    }

    impl BasicBlockInit {
        pub fn new(in_c: usize, out_c: usize, stride: usize) -> Self {
            Self {
                in_c,
                mid_c: out_c,
                out_c,
                stride,
                downsample: stride != 1 || in_c != out_c,
                activation: Activation::Relu,
                bn: Default::default(),
            }
        }

        pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>) -> Result<BasicBlock> {
            let path = path.borrow();
            let Self {
                in_c,
                mid_c,
                out_c,
                stride,
                downsample,
                activation,
                bn,
            } = self;

            ensure!(
                downsample || (stride == 1 && in_c == out_c),
                "identity skip requires stride 1 and in_c == out_c"
            );

            let conv1 = Conv2DInit {
                s: [stride; 2],
                bias: false,
                ..Conv2DInit::new(in_c, mid_c, 3)
            }
            .build(path / "conv1")?;
            let bn1 = bn.clone().build(path / "bn1", mid_c);
            let conv2 = Conv2DInit {
                bias: false,
                ..Conv2DInit::new(mid_c, out_c, 3)
            }
            .build(path / "conv2")?;
            let bn2 = bn.clone().build(path / "bn2", out_c);
            let downsample = downsample
                .then(|| Downsample::new(path / "downsample", in_c, out_c, stride, bn))
                .transpose()?;

            Ok(BasicBlock {
                conv1,
                bn1,
                conv2,
                bn2,
                downsample,
                activation,
            })
        }
    }

    #[derive(Debug)]
    pub struct BasicBlock {
        pub(crate) conv1: Conv2D,
        pub(crate) bn1: BatchNorm2D,
        pub(crate) conv2: Conv2D,
        pub(crate) bn2: BatchNorm2D,
        pub(crate) downsample: Option<Downsample>,
        pub(crate) activation: Activation,
    }

    impl BasicBlock {
        pub fn conv1(&self) -> &Conv2D {
            &self.conv1
        }

        pub fn bn1(&self) -> &BatchNorm2D {
            &self.bn1
        }

        pub fn conv2(&self) -> &Conv2D {
            &self.conv2
        }

        pub fn bn2(&self) -> &BatchNorm2D {
            &self.bn2
        }

        pub fn downsample(&self) -> Option<&Downsample> {
            self.downsample.as_ref()
        }

        pub fn in_channels(&self) -> usize {
            self.conv1.in_channels()
        }

        pub fn out_channels(&self) -> usize {
            self.conv2.out_channels()
        }

        pub fn init(&self) -> BasicBlockInit {
            BasicBlockInit {
                in_c: self.in_channels(),
                mid_c: self.conv1.out_channels(),
                out_c: self.out_channels(),
                stride: self.conv1.stride()[0],
                downsample: self.downsample.is_some(),
                activation: self.activation,
                bn: self.bn1.init(),
            }
        }

        pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
            let Self {
                conv1,
                bn1,
                conv2,
                bn2,
                downsample,
                activation,
            } = self;

            let identity = match downsample {
                Some(downsample) => downsample.forward_t(xs, train),
                None => xs.shallow_clone(),
            };
            let out = activation.forward(&bn1.forward_t(&conv1.forward(xs), train));
            let out = bn2.forward_t(&conv2.forward(&out), train);
            activation.forward(&(out + identity))
        }

        /// Checks the channel agreement of the residual and skip paths.
        pub fn check(&self) -> Result<()> {
            let links = [
                ("conv1 -> bn1", self.conv1.out_channels(), self.bn1.channels()),
                ("bn1 -> conv2", self.bn1.channels(), self.conv2.in_channels()),
                ("conv2 -> bn2", self.conv2.out_channels(), self.bn2.channels()),
            ];
            check_links(&links)?;
            check_skip(self.in_channels(), self.out_channels(), &self.downsample)
        }

        pub fn conv(&self, slot: Slot) -> Option<&Conv2D> {
            match slot {
                Slot::Conv1 => Some(&self.conv1),
                Slot::Conv2 => Some(&self.conv2),
                Slot::DownsampleConv => self.downsample.as_ref().map(|ds| &ds.conv),
                _ => None,
            }
        }

        pub fn conv_mut(&mut self, slot: Slot) -> Option<&mut Conv2D> {
            match slot {
                Slot::Conv1 => Some(&mut self.conv1),
                Slot::Conv2 => Some(&mut self.conv2),
                Slot::DownsampleConv => self.downsample.as_mut().map(|ds| &mut ds.conv),
                _ => None,
            }
        }

        pub fn norm(&self, slot: Slot) -> Option<&BatchNorm2D> {
            match slot {
                Slot::Bn1 => Some(&self.bn1),
                Slot::Bn2 => Some(&self.bn2),
                Slot::DownsampleBn => self.downsample.as_ref().map(|ds| &ds.bn),
                _ => None,
            }
        }

        pub fn norm_mut(&mut self, slot: Slot) -> Option<&mut BatchNorm2D> {
            match slot {
                Slot::Bn1 => Some(&mut self.bn1),
                Slot::Bn2 => Some(&mut self.bn2),
                Slot::DownsampleBn => self.downsample.as_mut().map(|ds| &mut ds.bn),
                _ => None,
            }
        }

        pub fn shallow_clone(&self) -> Self {
            Self {
                conv1: self.conv1.shallow_clone(),
                bn1: self.bn1.shallow_clone(),
                conv2: self.conv2.shallow_clone(),
                bn2: self.bn2.shallow_clone(),
                downsample: self.downsample.as_ref().map(Downsample::shallow_clone),
                activation: self.activation,
            }
        }

        pub fn to_device(&self, device: Device) -> Self {
            Self {
                conv1: self.conv1.to_device(device),
                bn1: self.bn1.to_device(device),
                conv2: self.conv2.to_device(device),
                bn2: self.bn2.to_device(device),
                downsample: self.downsample.as_ref().map(|ds| ds.to_device(device)),
                activation: self.activation,
            }
        }
    }
}

mod bottleneck {
    use super::*;

    /// 1x1 reduce, 3x3 and 1x1 expand convolutions with an identity or projection skip.
    ///
    /// The stride sits on the 3x3 convolution.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct BottleneckInit {
        pub in_c: usize,
        /// Output width of the 1x1 reduce convolution.
        pub reduce_c: usize,
        /// Output width of the 3x3 convolution.
        pub mid_c: usize,
        pub out_c: usize,
        pub stride: usize,
        pub downsample: bool,
        pub activation: Activation,
        pub bn: BatchNorm2DInit,
    }

    impl BottleneckInit {
        pub const EXPANSION: usize = 4;

        /// Creates a bottleneck of `planes` inner width expanding to `planes * 4`.
        pub fn new(in_c: usize, planes: usize, stride: usize) -> Self {
            let out_c = planes * Self::EXPANSION;
            Self {
                in_c,
                reduce_c: planes,
                mid_c: planes,
                out_c,
                stride,
                downsample: stride != 1 || in_c != out_c,
                activation: Activation::Relu,
                bn: Default::default(),
            }
        }

        pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>) -> Result<Bottleneck> {
            let path = path.borrow();
            let Self {
                in_c,
                reduce_c,
                mid_c,
                out_c,
                stride,
                downsample,
                activation,
                bn,
            } = self;

            ensure!(
                downsample || (stride == 1 && in_c == out_c),
                "identity skip requires stride 1 and in_c == out_c"
            );

            let conv1 = Conv2DInit {
                bias: false,
                ..Conv2DInit::new(in_c, reduce_c, 1)
            }
            .build(path / "conv1")?;
            let bn1 = bn.clone().build(path / "bn1", reduce_c);
            let conv2 = Conv2DInit {
                s: [stride; 2],
                bias: false,
                ..Conv2DInit::new(reduce_c, mid_c, 3)
            }
            .build(path / "conv2")?;
            let bn2 = bn.clone().build(path / "bn2", mid_c);
            let conv3 = Conv2DInit {
                bias: false,
                ..Conv2DInit::new(mid_c, out_c, 1)
            }
            .build(path / "conv3")?;
            let bn3 = bn.clone().build(path / "bn3", out_c);
            let downsample = downsample
                .then(|| Downsample::new(path / "downsample", in_c, out_c, stride, bn))
                .transpose()?;

            Ok(Bottleneck {
                conv1,
                bn1,
                conv2,
                bn2,
                conv3,
                bn3,
                downsample,
                activation,
            })
        }
    }

    #[derive(Debug)]
    pub struct Bottleneck {
        pub(crate) conv1: Conv2D,
        pub(crate) bn1: BatchNorm2D,
        pub(crate) conv2: Conv2D,
        pub(crate) bn2: BatchNorm2D,
        pub(crate) conv3: Conv2D,
        pub(crate) bn3: BatchNorm2D,
        pub(crate) downsample: Option<Downsample>,
        pub(crate) activation: Activation,
    }

    impl Bottleneck {
        pub fn conv1(&self) -> &Conv2D {
            &self.conv1
        }

        pub fn bn1(&self) -> &BatchNorm2D {
            &self.bn1
        }

        pub fn conv2(&self) -> &Conv2D {
            &self.conv2
        }

        pub fn bn2(&self) -> &BatchNorm2D {
            &self.bn2
        }

        pub fn conv3(&self) -> &Conv2D {
            &self.conv3
        }

        pub fn bn3(&self) -> &BatchNorm2D {
            &self.bn3
        }

        pub fn downsample(&self) -> Option<&Downsample> {
            self.downsample.as_ref()
        }

        pub fn in_channels(&self) -> usize {
            self.conv1.in_channels()
        }

        pub fn out_channels(&self) -> usize {
            self.conv3.out_channels()
        }

        pub fn init(&self) -> BottleneckInit {
            BottleneckInit {
                in_c: self.in_channels(),
                reduce_c: self.conv1.out_channels(),
                mid_c: self.conv2.out_channels(),
                out_c: self.out_channels(),
                stride: self.conv2.stride()[0],
                downsample: self.downsample.is_some(),
                activation: self.activation,
                bn: self.bn1.init(),
            }
        }

        pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
            let Self {
                conv1,
                bn1,
                conv2,
                bn2,
                conv3,
                bn3,
                downsample,
                activation,
            } = self;

            let identity = match downsample {
                Some(downsample) => downsample.forward_t(xs, train),
                None => xs.shallow_clone(),
            };
            let out = activation.forward(&bn1.forward_t(&conv1.forward(xs), train));
            let out = activation.forward(&bn2.forward_t(&conv2.forward(&out), train));
            let out = bn3.forward_t(&conv3.forward(&out), train);
            activation.forward(&(out + identity))
        }

        /// Checks the channel agreement of the residual and skip paths.
        pub fn check(&self) -> Result<()> {
            let links = [
                ("conv1 -> bn1", self.conv1.out_channels(), self.bn1.channels()),
                ("bn1 -> conv2", self.bn1.channels(), self.conv2.in_channels()),
                ("conv2 -> bn2", self.conv2.out_channels(), self.bn2.channels()),
                ("bn2 -> conv3", self.bn2.channels(), self.conv3.in_channels()),
                ("conv3 -> bn3", self.conv3.out_channels(), self.bn3.channels()),
            ];
            check_links(&links)?;
            check_skip(self.in_channels(), self.out_channels(), &self.downsample)
        }

        pub fn conv(&self, slot: Slot) -> Option<&Conv2D> {
            match slot {
                Slot::Conv1 => Some(&self.conv1),
                Slot::Conv2 => Some(&self.conv2),
                Slot::Conv3 => Some(&self.conv3),
                Slot::DownsampleConv => self.downsample.as_ref().map(|ds| &ds.conv),
                _ => None,
            }
        }

        pub fn conv_mut(&mut self, slot: Slot) -> Option<&mut Conv2D> {
            match slot {
                Slot::Conv1 => Some(&mut self.conv1),
                Slot::Conv2 => Some(&mut self.conv2),
                Slot::Conv3 => Some(&mut self.conv3),
                Slot::DownsampleConv => self.downsample.as_mut().map(|ds| &mut ds.conv),
                _ => None,
            }
        }

        pub fn norm(&self, slot: Slot) -> Option<&BatchNorm2D> {
            match slot {
                Slot::Bn1 => Some(&self.bn1),
                Slot::Bn2 => Some(&self.bn2),
                Slot::Bn3 => Some(&self.bn3),
                Slot::DownsampleBn => self.downsample.as_ref().map(|ds| &ds.bn),
                _ => None,
            }
        }

        pub fn norm_mut(&mut self, slot: Slot) -> Option<&mut BatchNorm2D> {
            match slot {
                Slot::Bn1 => Some(&mut self.bn1),
                Slot::Bn2 => Some(&mut self.bn2),
                Slot::Bn3 => Some(&mut self.bn3),
                Slot::DownsampleBn => self.downsample.as_mut().map(|ds| &mut ds.bn),
                _ => None,
            }
        }

        pub fn shallow_clone(&self) -> Self {
            Self {
                conv1: self.conv1.shallow_clone(),
                bn1: self.bn1.shallow_clone(),
                conv2: self.conv2.shallow_clone(),
                bn2: self.bn2.shallow_clone(),
                conv3: self.conv3.shallow_clone(),
                bn3: self.bn3.shallow_clone(),
                downsample: self.downsample.as_ref().map(Downsample::shallow_clone),
                activation: self.activation,
            }
        }

        pub fn to_device(&self, device: Device) -> Self {
            Self {
                conv1: self.conv1.to_device(device),
                bn1: self.bn1.to_device(device),
                conv2: self.conv2.to_device(device),
                bn2: self.bn2.to_device(device),
                conv3: self.conv3.to_device(device),
                bn3: self.bn3.to_device(device),
                downsample: self.downsample.as_ref().map(|ds| ds.to_device(device)),
                activation: self.activation,
            }
        }
    }
}

fn check_links(links: &[(&str, usize, usize)]) -> Result<()> {
    for &(name, lhs, rhs) in links {
        ensure!(lhs == rhs, "{}: {} channels feed {} channels", name, lhs, rhs);
    }
    Ok(())
}

fn check_skip(in_c: usize, out_c: usize, downsample: &Option<Downsample>) -> Result<()> {
    match downsample {
        Some(Downsample { conv, bn }) => {
            ensure!(
                conv.in_channels() == in_c,
                "projection skip takes {} channels, but the block input has {}",
                conv.in_channels(),
                in_c
            );
            ensure!(
                conv.out_channels() == bn.channels() && bn.channels() == out_c,
                "projection skip produces {} channels, but the residual path produces {}",
                bn.channels(),
                out_c
            );
        }
        None => {
            ensure!(
                in_c == out_c,
                "identity skip carries {} channels, but the residual path produces {}",
                in_c,
                out_c
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::kind::FLOAT_CPU;

    #[test]
    fn bottleneck_forward_keeps_block_width() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let block = BottleneckInit::new(32, 16, 2).build(&vs.root())?;
        block.check()?;
        assert_eq!(block.out_channels(), 64);
        assert!(block.downsample().is_some());

        let output = block.forward_t(&Tensor::randn(&[2, 32, 8, 8], FLOAT_CPU), false);
        assert_eq!(output.size(), [2, 64, 4, 4]);
        Ok(())
    }

    #[test]
    fn basic_block_with_identity_skip() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let block = BasicBlockInit::new(16, 16, 1).build(&vs.root())?;
        block.check()?;
        assert!(block.downsample().is_none());

        let output = block.forward_t(&Tensor::randn(&[1, 16, 6, 6], FLOAT_CPU), false);
        assert_eq!(output.size(), [1, 16, 6, 6]);
        Ok(())
    }

    #[test]
    fn identity_skip_requires_matching_width() {
        let vs = nn::VarStore::new(Device::Cpu);
        let result = BasicBlockInit {
            downsample: false,
            ..BasicBlockInit::new(8, 16, 1)
        }
        .build(&vs.root());
        assert!(result.is_err());
    }
}
