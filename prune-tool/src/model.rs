//! Builds the backbone to prune from a model source.

use crate::{
    common::*,
    config::{ArchConfig, ModelSource},
};
use backbone::{read_checkpoint, strip_prefixes};

/// Loads the backbone on CPU.
pub fn load_backbone(source: &ModelSource) -> Result<Backbone> {
    let backbone = match source {
        ModelSource::Checkpoint {
            arch,
            file,
            strip_prefixes: prefixes,
        } => {
            let vs = nn::VarStore::new(Device::Cpu);
            let mut backbone = build_arch(arch, &vs.root())?;
            let entries = read_checkpoint(file)?;
            backbone
                .load_parameters(entries, strip_prefixes(prefixes.clone()))
                .with_context(|| {
                    format!("unable to load parameters from '{}'", file.display())
                })?;
            backbone
        }
        ModelSource::Pruned { file } => Backbone::load_pruned(file, Device::Cpu)?,
    };

    info!(
        "loaded backbone with {} nodes and {} parameters",
        backbone.len(),
        backbone
            .named_parameters()
            .iter()
            .map(|(_, tensor)| tensor.numel())
            .sum::<usize>()
    );
    Ok(backbone)
}

fn build_arch(arch: &ArchConfig, path: &nn::Path) -> Result<Backbone> {
    let backbone = match arch {
        ArchConfig::ResNet18 => ResNetInit::resnet18().build(path)?,
        ArchConfig::ResNet34 => ResNetInit::resnet34().build(path)?,
        ArchConfig::ResNet50 => ResNetInit::resnet50().build(path)?,
        ArchConfig::ResNet101 => ResNetInit::resnet101().build(path)?,
        ArchConfig::ResNet(init) => init.clone().build(path)?,
        ArchConfig::File { file } => {
            let config = BackboneConfig::load(file)?;
            Backbone::from_config(path, &config)?
        }
    };
    Ok(backbone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Tensor;

    #[test]
    fn checkpoint_with_wrapper_prefix_loads() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("ssd.ot");

        let vs = nn::VarStore::new(Device::Cpu);
        let trained = ResNetInit::resnet18().build(&vs.root())?;
        let entries: Vec<_> = trained
            .named_parameters()
            .into_iter()
            .map(|(key, tensor)| (format!("module.resnet.{}", key), tensor))
            .chain([(
                "module.loc.0.weight".to_string(),
                Tensor::zeros(&[4], tch::kind::FLOAT_CPU),
            )])
            .collect();
        Tensor::save_multi(&entries, &file)?;

        let source = ModelSource::Checkpoint {
            arch: ArchConfig::ResNet18,
            file,
            strip_prefixes: vec!["module.".into(), "resnet.".into()],
        };
        let loaded = load_backbone(&source)?;

        for ((lkey, lhs), (rkey, rhs)) in trained
            .named_parameters()
            .iter()
            .zip_eq(loaded.named_parameters().iter())
        {
            assert_eq!(lkey, rkey);
            assert!(lhs.equal(rhs));
        }
        Ok(())
    }
}
