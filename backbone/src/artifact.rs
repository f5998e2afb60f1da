//! Checkpoint reading and the self-describing pruned artifact.

use crate::{backbone::Backbone, common::*, config::BackboneConfig};

/// The reserved entry holding the json architecture of a pruned artifact.
pub const ARCHITECTURE_KEY: &str = "__architecture__";

/// Reads every named tensor of a checkpoint file.
///
/// Files with the `npz` extension are read as numpy archives, others as
/// torch tensor archives.
pub fn read_checkpoint(path: impl AsRef<Path>) -> Result<Vec<(String, Tensor)>> {
    let path = path.as_ref();
    let is_npz = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("npz"))
        .unwrap_or(false);

    let entries = if is_npz {
        Tensor::read_npz(path)
    } else {
        Tensor::load_multi(path)
    }
    .with_context(|| format!("unable to read checkpoint '{}'", path.display()))?;

    debug!(
        "read {} entries from checkpoint '{}'",
        entries.len(),
        path.display()
    );
    Ok(entries)
}

impl Backbone {
    /// Saves the architecture and parameters into one file.
    pub fn save_pruned(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let architecture = self.config().to_json()?;

        let mut entries: Vec<(String, Tensor)> = self
            .named_parameters()
            .into_iter()
            .map(|(key, tensor)| (key, tensor.to_device(Device::Cpu)))
            .collect();
        entries.push((
            ARCHITECTURE_KEY.to_string(),
            Tensor::of_slice(architecture.as_bytes()),
        ));

        Tensor::save_multi(&entries, path)
            .with_context(|| format!("unable to save '{}'", path.display()))?;
        Ok(())
    }

    /// Restores a backbone written by [Backbone::save_pruned] without
    /// any external architecture definition.
    pub fn load_pruned(path: impl AsRef<Path>, device: Device) -> Result<Self> {
        let path = path.as_ref();
        let mut entries = Tensor::load_multi(path)
            .with_context(|| format!("unable to read '{}'", path.display()))?;

        let index = entries
            .iter()
            .position(|(key, _)| key == ARCHITECTURE_KEY)
            .ok_or_else(|| {
                format_err!(
                    "'{}' is not a pruned artifact, the '{}' entry is missing",
                    path.display(),
                    ARCHITECTURE_KEY
                )
            })?;
        let (_, architecture) = entries.swap_remove(index);
        let architecture = String::from_utf8(Vec::<u8>::from(&architecture))
            .context("the architecture entry is not valid utf-8")?;
        let config = BackboneConfig::from_json(&architecture)?;

        let vs = nn::VarStore::new(Device::Cpu);
        let mut backbone = Backbone::from_config(&vs.root(), &config)?;
        backbone.load_parameters(entries, |key: &str| Some(key.to_string()))?;

        Ok(backbone.to_device(device))
    }
}
