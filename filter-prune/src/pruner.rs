use crate::{
    common::*,
    rank::FilterRanker,
    rebuild::{shrink_input_channels, shrink_normalization, shrink_output_channels},
    resolve::{Consumer, Junction, Resolver},
};

/// The outcome of pruning one junction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JunctionReport {
    pub producer: LayerRef,
    /// Removed filter indices, lowest score first.
    pub removed: Vec<usize>,
    pub old_width: usize,
    pub new_width: usize,
}

/// The outcome of pruning one backbone position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub position: usize,
    pub kind: BlockKind,
    pub junctions: Vec<JunctionReport>,
}

impl PruneReport {
    pub fn num_removed(&self) -> usize {
        self.junctions.iter().map(|j| j.removed.len()).sum()
    }

    pub fn is_noop(&self) -> bool {
        self.num_removed() == 0
    }
}

/// Prunes the filters of one backbone position at a time.
///
/// Each call either installs every rebuilt layer of the position or leaves
/// the backbone untouched.
#[derive(Debug, Clone)]
pub struct BlockPruner {
    ranker: FilterRanker,
    fork_points: BTreeSet<usize>,
}

impl BlockPruner {
    pub fn new(ranker: FilterRanker, fork_points: impl IntoIterator<Item = usize>) -> Self {
        Self {
            ranker,
            fork_points: fork_points.into_iter().collect(),
        }
    }

    pub fn ranker(&self) -> &FilterRanker {
        &self.ranker
    }

    pub fn fork_points(&self) -> &BTreeSet<usize> {
        &self.fork_points
    }

    pub fn is_fork_point(&self, position: usize) -> bool {
        self.fork_points.contains(&position)
    }

    /// Prunes the node at `position` according to its kind.
    pub fn prune_position(
        &self,
        backbone: &mut Backbone,
        position: usize,
    ) -> PruneResult<PruneReport> {
        if self.is_fork_point(position) {
            return Err(PruneError::ForkPointProtected { position });
        }
        let node = backbone.node(position).ok_or_else(|| {
            PruneError::InvalidPruneTarget(format!(
                "position {} is out of range 0..{}",
                position,
                backbone.len()
            ))
        })?;

        match node.block_kind() {
            BlockKind::PlainConv => self.prune_plain_conv(backbone, position),
            BlockKind::BasicBlock => self.prune_basic_block(backbone, position),
            BlockKind::Bottleneck => self.prune_bottleneck(backbone, position),
            BlockKind::ChannelPreserving | BlockKind::Other => {
                Err(PruneError::UnsupportedBlockKind {
                    position,
                    kind: node.kind().as_ref().to_string(),
                })
            }
        }
    }

    /// Prunes a plain convolution together with the normalization layers
    /// after it and the input channels of its consumers.
    pub fn prune_plain_conv(
        &self,
        backbone: &mut Backbone,
        position: usize,
    ) -> PruneResult<PruneReport> {
        let junction = Resolver::new(backbone, &self.fork_points).plain_conv(position)?;
        self.prune_junctions(backbone, position, BlockKind::PlainConv, &[junction])
    }

    /// Prunes the first convolution of a basic block. The skip path and the
    /// block output width are not changed.
    pub fn prune_basic_block(
        &self,
        backbone: &mut Backbone,
        position: usize,
    ) -> PruneResult<PruneReport> {
        let junction = Resolver::new(backbone, &self.fork_points).basic_block(position)?;
        self.prune_junctions(backbone, position, BlockKind::BasicBlock, &[junction])
    }

    /// Prunes the first two convolutions of a bottleneck block. The second
    /// one is ranked after its input channels are pruned.
    pub fn prune_bottleneck(
        &self,
        backbone: &mut Backbone,
        position: usize,
    ) -> PruneResult<PruneReport> {
        let junctions = Resolver::new(backbone, &self.fork_points).bottleneck(position)?;
        self.prune_junctions(backbone, position, BlockKind::Bottleneck, &junctions)
    }

    fn prune_junctions(
        &self,
        backbone: &mut Backbone,
        position: usize,
        kind: BlockKind,
        junctions: &[Junction],
    ) -> PruneResult<PruneReport> {
        let mut staging = Staging::default();

        let reports: Vec<_> = junctions
            .iter()
            .map(|junction| staging.apply(backbone, junction, &self.ranker))
            .try_collect()?;
        junctions
            .iter()
            .try_for_each(|junction| staging.check(backbone, junction))?;
        staging.commit(backbone)?;

        for report in &reports {
            debug!(
                "{}: {} -> {} filters, removed {:?}",
                report.producer, report.old_width, report.new_width, report.removed
            );
        }

        Ok(PruneReport {
            position,
            kind,
            junctions: reports,
        })
    }
}

/// Rebuilt layers waiting to be installed. Lookups see staged layers first.
#[derive(Debug, Default)]
struct Staging {
    convs: HashMap<LayerRef, Conv2D>,
    norms: HashMap<LayerRef, BatchNorm2D>,
}

impl Staging {
    fn conv<'a>(&'a self, backbone: &'a Backbone, layer: LayerRef) -> PruneResult<&'a Conv2D> {
        self.convs
            .get(&layer)
            .or_else(|| backbone.conv(layer))
            .ok_or_else(|| PruneError::InvalidPruneTarget(format!("no convolution at {}", layer)))
    }

    fn norm<'a>(
        &'a self,
        backbone: &'a Backbone,
        layer: LayerRef,
    ) -> PruneResult<&'a BatchNorm2D> {
        self.norms
            .get(&layer)
            .or_else(|| backbone.norm(layer))
            .ok_or_else(|| {
                PruneError::InvalidPruneTarget(format!("no normalization at {}", layer))
            })
    }

    fn apply(
        &mut self,
        backbone: &Backbone,
        junction: &Junction,
        ranker: &FilterRanker,
    ) -> PruneResult<JunctionReport> {
        let Junction {
            producer,
            norms,
            consumers,
        } = junction;

        let producer_conv = self.conv(backbone, *producer)?;
        let old_width = producer_conv.out_channels();
        let removed: Vec<usize> = ranker
            .select(producer_conv)?
            .into_iter()
            .map(|rank| rank.index)
            .collect();

        if removed.is_empty() {
            return Ok(JunctionReport {
                producer: *producer,
                removed,
                old_width,
                new_width: old_width,
            });
        }
        let new_width = old_width - removed.len();

        for consumer in consumers {
            if let Consumer::Fixed { name, channels } = consumer {
                return Err(PruneError::ChannelMismatch {
                    layer: name.clone(),
                    expect: *channels,
                    actual: new_width,
                });
            }
        }

        let new_producer = shrink_output_channels(producer_conv, &removed)?;
        let new_norms: Vec<_> = norms
            .iter()
            .map(|&layer| {
                let norm = shrink_normalization(self.norm(backbone, layer)?, &removed)?;
                Ok((layer, norm))
            })
            .collect::<PruneResult<_>>()?;
        let new_consumers: Vec<_> = consumers
            .iter()
            .filter_map(|consumer| match consumer {
                Consumer::Conv(layer) => Some(*layer),
                Consumer::Fixed { .. } => None,
            })
            .map(|layer| {
                let conv = shrink_input_channels(self.conv(backbone, layer)?, &removed)?;
                Ok((layer, conv))
            })
            .collect::<PruneResult<_>>()?;

        self.convs.insert(*producer, new_producer);
        self.norms.extend(new_norms);
        self.convs.extend(new_consumers);

        Ok(JunctionReport {
            producer: *producer,
            removed,
            old_width,
            new_width,
        })
    }

    /// Verifies that the producer, its normalization layers and its consumers
    /// agree on the channel count after staging.
    fn check(&self, backbone: &Backbone, junction: &Junction) -> PruneResult<()> {
        let width = self.conv(backbone, junction.producer)?.out_channels();

        for &layer in &junction.norms {
            let channels = self.norm(backbone, layer)?.channels();
            if channels != width {
                return Err(PruneError::ChannelMismatch {
                    layer: layer.to_string(),
                    expect: width,
                    actual: channels,
                });
            }
        }

        for consumer in &junction.consumers {
            let (layer, channels) = match consumer {
                Consumer::Conv(layer) => {
                    (layer.to_string(), self.conv(backbone, *layer)?.in_channels())
                }
                Consumer::Fixed { name, channels } => (name.clone(), *channels),
            };
            if channels != width {
                return Err(PruneError::ChannelMismatch {
                    layer,
                    expect: channels,
                    actual: width,
                });
            }
        }

        Ok(())
    }

    fn commit(self, backbone: &mut Backbone) -> PruneResult<()> {
        let Self { convs, norms } = self;

        // every staged layer was looked up on this backbone
        for (layer, conv) in convs {
            backbone
                .set_conv(layer, conv)
                .map_err(|err| PruneError::InvalidPruneTarget(format!("{:#}", err)))?;
        }
        for (layer, norm) in norms {
            backbone
                .set_norm(layer, norm)
                .map_err(|err| PruneError::InvalidPruneTarget(format!("{:#}", err)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratio::CutRatio;
    use backbone::{BottleneckInit, Conv2DInit};
    use tch::nn;

    #[test]
    fn zero_ratio_is_a_noop() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let mut backbone = Backbone::new(vec![
            Conv2DInit::new(3, 64, 3).build(&root / 0)?.into(),
            BottleneckInit::new(64, 16, 1).build(&root / 1)?.into(),
        ])?;
        let before = backbone.named_parameters();

        let pruner = BlockPruner::new(FilterRanker::new(CutRatio::try_from(0.0)?), []);
        let report = pruner.prune_position(&mut backbone, 0)?;
        assert!(report.is_noop());
        let report = pruner.prune_position(&mut backbone, 1)?;
        assert!(report.is_noop());
        assert_eq!(report.junctions.len(), 2);

        for ((_, lhs), (_, rhs)) in before.iter().zip_eq(backbone.named_parameters()) {
            assert!(lhs.equal(&rhs));
        }
        Ok(())
    }

    #[test]
    fn fixed_consumer_rejects_before_installing() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let mut backbone = Backbone::new(vec![
            Conv2DInit::new(3, 64, 3).build(&root / 0)?.into(),
            BottleneckInit::new(64, 16, 1).build(&root / 1)?.into(),
            Conv2DInit::new(64, 32, 3).build(&root / 2)?.into(),
        ])?;

        let pruner = BlockPruner::new(FilterRanker::new(CutRatio::try_from(0.5)?), []);
        let result = pruner.prune_position(&mut backbone, 2);
        assert!(matches!(result, Err(PruneError::ChannelMismatch { .. })));
        assert!(!result.unwrap_err().is_fatal());
        assert_eq!(backbone.out_channels_at(2), Some(32));
        backbone.check_connectivity()?;
        Ok(())
    }
}
