//! Named parameters in the torch state-dict layout.

use crate::{
    backbone::Backbone,
    batch_norm_2d::BatchNorm2D,
    common::*,
    conv_2d::Conv2D,
    node::{LayerRef, Slot},
};

/// Returns a key normalizer that removes each of `prefixes` in order when present.
///
/// `strip_prefixes(["module."])` maps checkpoints saved from a replicated
/// training wrapper back to plain layer paths.
pub fn strip_prefixes<I, S>(prefixes: I) -> impl Fn(&str) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let prefixes: Vec<String> = prefixes
        .into_iter()
        .map(|prefix| prefix.as_ref().to_string())
        .collect();

    move |key: &str| {
        let stripped = prefixes
            .iter()
            .fold(key, |key, prefix| key.strip_prefix(prefix.as_str()).unwrap_or(key));
        Some(stripped.to_string())
    }
}

impl Backbone {
    /// Lists every parameter and running statistic with its torch-style key,
    /// e.g. `4.conv1.weight` or `4.downsample.1.running_var`.
    ///
    /// The returned tensors share storage with the backbone.
    pub fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut entries = vec![];
        for layer in self.layer_refs() {
            let prefix = layer.to_string();

            if let Some(conv) = self.conv(layer) {
                conv_tensors(conv, |name, tensor| {
                    entries.push((format!("{}.{}", prefix, name), tensor.shallow_clone()))
                });
            }
            if let Some(norm) = self.norm(layer) {
                norm_tensors(norm, |name, tensor| {
                    entries.push((format!("{}.{}", prefix, name), tensor.shallow_clone()))
                });
            }
        }
        entries
    }

    /// Copies values from a checkpoint into the backbone.
    ///
    /// Each key is passed through `normalize` first, and keys that it maps to
    /// `None` are dropped. Every backbone parameter must be present with the
    /// same shape. Keys that belong to no backbone parameter are ignored.
    pub fn load_parameters<I, F>(&mut self, entries: I, normalize: F) -> Result<()>
    where
        I: IntoIterator<Item = (String, Tensor)>,
        F: Fn(&str) -> Option<String>,
    {
        let mut source: HashMap<String, Tensor> = entries
            .into_iter()
            .filter_map(|(key, tensor)| Some((normalize(&key)?, tensor)))
            .collect();

        let targets = self.named_parameters();

        let missing: Vec<_> = targets
            .iter()
            .filter(|(key, _)| !source.contains_key(key))
            .map(|(key, _)| key.as_str())
            .collect();
        ensure!(
            missing.is_empty(),
            "checkpoint lacks {} backbone parameters: {}",
            missing.len(),
            missing.iter().join(", ")
        );

        for (key, target) in &targets {
            let value = &source[key];
            ensure!(
                value.size() == target.size(),
                "shape mismatch for '{}': checkpoint has {:?}, backbone has {:?}",
                key,
                value.size(),
                target.size()
            );
        }

        tch::no_grad(|| {
            for (key, mut target) in targets {
                if let Some(value) = source.remove(&key) {
                    target.copy_(&value);
                }
            }
        });

        source
            .keys()
            .sorted()
            .for_each(|key| debug!("ignore checkpoint entry '{}'", key));

        Ok(())
    }

    /// Registers every tensor in `path` so that the backbone can be trained
    /// with an optimizer built from the var store.
    ///
    /// Weights and biases become trainable variables. Running statistics are
    /// registered as non-trainable.
    pub fn attach<'p>(&mut self, path: impl Borrow<nn::Path<'p>>) {
        let path = path.borrow();

        for layer in self.layer_refs() {
            let layer_path = sub_path(path, &layer.to_string());

            if let Some(conv) = self
                .nodes_mut()
                .get_mut(layer.position)
                .and_then(|node| node.conv_mut(layer.slot))
            {
                conv.weight = layer_path.var_copy("weight", &conv.weight);
                if let Some(bias) = &conv.bias {
                    conv.bias = Some(layer_path.var_copy("bias", bias));
                }
            }

            if let Some(norm) = self
                .nodes_mut()
                .get_mut(layer.position)
                .and_then(|node| node.norm_mut(layer.slot))
            {
                if let Some(ws) = &norm.ws {
                    norm.ws = Some(layer_path.var_copy("weight", ws));
                }
                if let Some(bs) = &norm.bs {
                    norm.bs = Some(layer_path.var_copy("bias", bs));
                }
                norm.running_mean = copy_no_train(&layer_path, "running_mean", &norm.running_mean);
                norm.running_var = copy_no_train(&layer_path, "running_var", &norm.running_var);
            }
        }
    }

    fn layer_refs(&self) -> Vec<LayerRef> {
        (0..self.len())
            .cartesian_product(Slot::ALL)
            .map(|(position, slot)| LayerRef::block(position, slot))
            .filter(|&layer| self.conv(layer).is_some() || self.norm(layer).is_some())
            .collect()
    }
}

fn conv_tensors(conv: &Conv2D, mut f: impl FnMut(&str, &Tensor)) {
    f("weight", &conv.weight);
    if let Some(bias) = &conv.bias {
        f("bias", bias);
    }
}

fn norm_tensors(norm: &BatchNorm2D, mut f: impl FnMut(&str, &Tensor)) {
    if let Some(ws) = &norm.ws {
        f("weight", ws);
    }
    if let Some(bs) = &norm.bs {
        f("bias", bs);
    }
    f("running_mean", &norm.running_mean);
    f("running_var", &norm.running_var);
}

fn sub_path<'p>(path: &nn::Path<'p>, key: &str) -> nn::Path<'p> {
    let (head, tail) = key.split_once('.').unwrap_or((key, ""));
    tail.split('.')
        .filter(|seg| !seg.is_empty())
        .fold(path.sub(head), |path, seg| path.sub(seg))
}

fn copy_no_train(path: &nn::Path, name: &str, tensor: &Tensor) -> Tensor {
    let mut var = path.zeros_no_train(name, &tensor.size());
    tch::no_grad(|| var.copy_(tensor));
    var
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        batch_norm_2d::BatchNorm2DInit,
        block::BottleneckInit,
        conv_2d::Conv2DInit,
        resnet::ResNetInit,
    };

    #[test]
    fn parameter_keys_follow_state_dict_layout() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let backbone = Backbone::new(vec![
            Conv2DInit::new(3, 64, 3).build(&root / 0)?.into(),
            BatchNorm2DInit::default().build(&root / 1, 64).into(),
            BottleneckInit::new(64, 16, 1).build(&root / 2)?.into(),
        ])?;

        let keys: HashSet<_> = backbone
            .named_parameters()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        for key in [
            "0.weight",
            "0.bias",
            "1.weight",
            "1.running_var",
            "2.conv1.weight",
            "2.bn3.running_mean",
            "2.downsample.0.weight",
            "2.downsample.1.bias",
        ] {
            assert!(keys.contains(key), "missing {}", key);
        }
        assert!(!keys.contains("2.conv1.bias"));
        Ok(())
    }

    #[test]
    fn load_parameters_strips_wrapper_prefix() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let source = ResNetInit::resnet18().build(&vs.root())?;

        let mut entries: Vec<_> = source
            .named_parameters()
            .into_iter()
            .map(|(key, tensor)| (format!("module.{}", key), tensor.copy()))
            .collect();
        entries.push(("module.fc.weight".into(), Tensor::zeros(&[10, 512], tch::kind::FLOAT_CPU)));

        let vs = nn::VarStore::new(Device::Cpu);
        let mut target = ResNetInit::resnet18().build(&vs.root())?;
        target.load_parameters(entries, strip_prefixes(["module."]))?;

        for ((lkey, lhs), (rkey, rhs)) in source
            .named_parameters()
            .into_iter()
            .zip_eq(target.named_parameters())
        {
            assert_eq!(lkey, rkey);
            assert!(lhs.equal(&rhs), "'{}' differs", lkey);
        }
        Ok(())
    }

    #[test]
    fn load_parameters_is_strict() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut backbone = ResNetInit::resnet18().build(&vs.root())?;

        let mut entries = backbone.named_parameters();
        entries.retain(|(key, _)| key != "0.weight");
        assert!(backbone
            .load_parameters(entries, |key| Some(key.to_string()))
            .is_err());

        let entries: Vec<_> = backbone
            .named_parameters()
            .into_iter()
            .map(|(key, tensor)| {
                if key == "0.weight" {
                    (key, tensor.narrow(0, 0, 8))
                } else {
                    (key, tensor)
                }
            })
            .collect();
        assert!(backbone
            .load_parameters(entries, |key| Some(key.to_string()))
            .is_err());
        Ok(())
    }

    #[test]
    fn attach_registers_trainable_weights() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut backbone = ResNetInit::resnet18().build(&vs.root())?;
        let before = backbone.named_parameters();

        let fresh = nn::VarStore::new(Device::Cpu);
        backbone.attach(&fresh.root());

        let variables = fresh.variables();
        assert_eq!(variables.len(), before.len());
        assert_eq!(fresh.trainable_variables().len(), before.len() - 2 * 20);
        for (key, tensor) in &before {
            assert!(variables[key].equal(tensor), "'{}' differs", key);
        }
        Ok(())
    }
}
