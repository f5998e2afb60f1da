use anyhow::Result;
use backbone::{
    Activation, Backbone, BasicBlockInit, BatchNorm2DInit, BlockKind, BottleneckInit, Conv2DInit,
    LayerRef, ResNetInit, Slot,
};
use filter_prune::{
    lowest_filters, shrink_input_channels, BlockPruner, CutRatio, FilterRanker, PruneError,
};
use tch::{kind::FLOAT_CPU, nn, Device, Tensor};

fn pruner(ratio: f64, fork_points: &[usize]) -> Result<BlockPruner> {
    let ranker = FilterRanker::new(CutRatio::try_from(ratio)?);
    Ok(BlockPruner::new(ranker, fork_points.iter().copied()))
}

fn snapshot(backbone: &Backbone) -> Vec<(String, Tensor)> {
    backbone
        .named_parameters()
        .into_iter()
        .map(|(key, tensor)| (key, tensor.copy()))
        .collect()
}

fn assert_unchanged(before: &[(String, Tensor)], backbone: &Backbone) {
    let after = backbone.named_parameters();
    assert_eq!(before.len(), after.len());
    for ((lkey, lhs), (rkey, rhs)) in before.iter().zip(after.iter()) {
        assert_eq!(lkey, rkey);
        assert!(lhs.equal(rhs), "'{}' changed", lkey);
    }
}

#[test]
fn bottleneck_inner_branch_shrinks() -> Result<()> {
    let vs = nn::VarStore::new(Device::Cpu);
    let mut backbone = Backbone::new(vec![BottleneckInit::new(64, 64, 1)
        .build(&vs.root() / 0)?
        .into()])?;
    let original_conv2 = backbone
        .conv(LayerRef::block(0, Slot::Conv2))
        .unwrap()
        .shallow_clone();

    let report = pruner(0.25, &[])?.prune_bottleneck(&mut backbone, 0)?;
    assert_eq!(report.kind, BlockKind::Bottleneck);
    assert_eq!(report.junctions.len(), 2);

    let conv = |slot| backbone.conv(LayerRef::block(0, slot)).unwrap();
    let norm = |slot| backbone.norm(LayerRef::block(0, slot)).unwrap();
    assert_eq!(conv(Slot::Conv1).out_channels(), 48);
    assert_eq!(norm(Slot::Bn1).channels(), 48);
    assert_eq!(conv(Slot::Conv2).in_channels(), 48);
    assert_eq!(conv(Slot::Conv2).out_channels(), 48);
    assert_eq!(norm(Slot::Bn2).channels(), 48);
    assert_eq!(conv(Slot::Conv3).in_channels(), 48);
    assert_eq!(conv(Slot::Conv3).out_channels(), 256);
    assert_eq!(norm(Slot::Bn3).channels(), 256);
    assert_eq!(conv(Slot::DownsampleConv).in_channels(), 64);
    assert_eq!(conv(Slot::DownsampleConv).out_channels(), 256);
    backbone.check_connectivity()?;

    // the second junction is ranked on conv2 after its inputs shrink
    let staged_conv2 = shrink_input_channels(&original_conv2, &report.junctions[0].removed)?;
    let expect: Vec<_> = lowest_filters(staged_conv2.weight(), 16)?
        .into_iter()
        .map(|rank| rank.index)
        .collect();
    assert_eq!(report.junctions[1].removed, expect);

    let output = backbone.forward_t(&Tensor::randn(&[2, 64, 8, 8], FLOAT_CPU), false)?;
    assert_eq!(output.size(), [2, 256, 8, 8]);
    Ok(())
}

#[test]
fn basic_block_keeps_skip_and_output() -> Result<()> {
    let vs = nn::VarStore::new(Device::Cpu);
    let mut backbone = Backbone::new(vec![BasicBlockInit::new(16, 32, 2)
        .build(&vs.root() / 0)?
        .into()])?;
    let original_conv1 = backbone
        .conv(LayerRef::block(0, Slot::Conv1))
        .unwrap()
        .shallow_clone();

    let report = pruner(0.25, &[])?.prune_basic_block(&mut backbone, 0)?;
    assert_eq!(report.kind, BlockKind::BasicBlock);
    assert_eq!(report.junctions.len(), 1);
    assert_eq!(report.junctions[0].producer, LayerRef::block(0, Slot::Conv1));
    assert_eq!(report.junctions[0].old_width, 32);
    assert_eq!(report.junctions[0].new_width, 24);

    let expect: Vec<_> = lowest_filters(original_conv1.weight(), 8)?
        .into_iter()
        .map(|rank| rank.index)
        .collect();
    assert_eq!(report.junctions[0].removed, expect);

    let conv = |slot| backbone.conv(LayerRef::block(0, slot)).unwrap();
    let norm = |slot| backbone.norm(LayerRef::block(0, slot)).unwrap();
    assert_eq!(conv(Slot::Conv1).in_channels(), 16);
    assert_eq!(conv(Slot::Conv1).out_channels(), 24);
    assert_eq!(norm(Slot::Bn1).channels(), 24);
    assert_eq!(conv(Slot::Conv2).in_channels(), 24);
    assert_eq!(conv(Slot::Conv2).out_channels(), 32);
    assert_eq!(norm(Slot::Bn2).channels(), 32);
    assert_eq!(conv(Slot::DownsampleConv).in_channels(), 16);
    assert_eq!(conv(Slot::DownsampleConv).out_channels(), 32);
    backbone.check_connectivity()?;

    let output = backbone.forward_t(&Tensor::randn(&[2, 16, 16, 16], FLOAT_CPU), false)?;
    assert_eq!(output.size(), [2, 32, 8, 8]);
    Ok(())
}

#[test]
fn plain_conv_matches_hand_built_network() -> Result<()> {
    let vs = nn::VarStore::new(Device::Cpu);
    let root = vs.root();
    let mut backbone = Backbone::new(vec![
        Conv2DInit::new(3, 128, 3).build(&root / 0)?.into(),
        BatchNorm2DInit::default().build(&root / 1, 128).into(),
        Activation::Relu.into(),
        Conv2DInit::new(128, 64, 3).build(&root / 3)?.into(),
    ])?;
    let original = snapshot(&backbone);

    let report = pruner(0.2, &[])?.prune_position(&mut backbone, 0)?;
    let removed = &report.junctions[0].removed;
    assert_eq!(removed.len(), 25);
    assert_eq!(backbone.out_channels_at(0), Some(103));
    assert_eq!(backbone.norm(LayerRef::node(1)).unwrap().channels(), 103);
    assert_eq!(backbone.conv(LayerRef::node(3)).unwrap().in_channels(), 103);
    assert_eq!(backbone.out_channels_at(3), Some(64));
    backbone.check_connectivity()?;

    let keep: Vec<i64> = (0..128)
        .filter(|index| !removed.contains(index))
        .map(|index| index as i64)
        .collect();
    let keep = Tensor::of_slice(&keep);
    let entries: Vec<_> = original
        .into_iter()
        .map(|(key, tensor)| {
            let tensor = match key.as_str() {
                "3.weight" => tensor.index_select(1, &keep),
                "3.bias" => tensor,
                _ => tensor.index_select(0, &keep),
            };
            (key, tensor)
        })
        .collect();

    let hand_vs = nn::VarStore::new(Device::Cpu);
    let hand_root = hand_vs.root();
    let mut hand_built = Backbone::new(vec![
        Conv2DInit::new(3, 103, 3).build(&hand_root / 0)?.into(),
        BatchNorm2DInit::default().build(&hand_root / 1, 103).into(),
        Activation::Relu.into(),
        Conv2DInit::new(103, 64, 3).build(&hand_root / 3)?.into(),
    ])?;
    hand_built.load_parameters(entries, |key| Some(key.to_string()))?;

    let input = Tensor::randn(&[2, 3, 16, 16], FLOAT_CPU);
    let expect = hand_built.forward_t(&input, false)?;
    let actual = backbone.forward_t(&input, false)?;
    assert!(actual.allclose(&expect, 1e-5, 1e-6, false));
    Ok(())
}

#[test]
fn fork_points_reject_every_operation() -> Result<()> {
    let vs = nn::VarStore::new(Device::Cpu);
    let mut backbone = ResNetInit {
        base_width: 8,
        ..ResNetInit::resnet50()
    }
    .build(&vs.root())?;
    let before = snapshot(&backbone);
    let pruner = pruner(0.5, &[0, 10, 19])?;

    for position in [0, 10, 19] {
        let results = [
            pruner.prune_position(&mut backbone, position),
            pruner.prune_plain_conv(&mut backbone, position),
            pruner.prune_basic_block(&mut backbone, position),
            pruner.prune_bottleneck(&mut backbone, position),
        ];
        for result in results {
            match result {
                Err(err @ PruneError::ForkPointProtected { .. }) => assert!(err.is_fatal()),
                other => panic!("expect ForkPointProtected, but get {:?}", other),
            }
        }
    }
    assert_unchanged(&before, &backbone);
    Ok(())
}

#[test]
fn fork_point_between_conv_and_consumer_is_protected() -> Result<()> {
    let vs = nn::VarStore::new(Device::Cpu);
    let mut backbone = ResNetInit {
        base_width: 8,
        ..ResNetInit::resnet18()
    }
    .build(&vs.root())?;
    let before = snapshot(&backbone);

    let result = pruner(0.5, &[2])?.prune_plain_conv(&mut backbone, 0);
    assert!(matches!(
        result,
        Err(PruneError::ForkPointProtected { position: 2 })
    ));
    assert_unchanged(&before, &backbone);
    Ok(())
}

#[test]
fn single_pass_over_resnet50_keeps_taps() -> Result<()> {
    let vs = nn::VarStore::new(Device::Cpu);
    let init = ResNetInit {
        base_width: 8,
        ..ResNetInit::resnet50()
    };
    let mut backbone = init.build(&vs.root())?;
    let input = Tensor::randn(&[1, 3, 64, 64], FLOAT_CPU);
    let taps_before = backbone.forward_taps(&input, false, &[10, 19])?;

    let pruner = pruner(0.2, &[10, 19])?;
    let mut removed = 0;
    for position in 0..backbone.len() {
        let kind = backbone.nodes()[position].block_kind();
        if pruner.is_fork_point(position) || kind == BlockKind::ChannelPreserving {
            continue;
        }
        removed += pruner.prune_position(&mut backbone, position)?.num_removed();
    }
    assert!(removed > 0);
    backbone.check_connectivity()?;

    let taps_after = backbone.forward_taps(&input, false, &[10, 19])?;
    for (before, after) in taps_before.iter().zip(&taps_after) {
        assert_eq!(before.size(), after.size());
    }
    assert_eq!(backbone.out_channels_at(10), Some(64));
    assert_eq!(backbone.out_channels_at(19), Some(256));
    Ok(())
}

#[test]
fn single_pass_over_resnet18_keeps_taps() -> Result<()> {
    let vs = nn::VarStore::new(Device::Cpu);
    let init = ResNetInit {
        base_width: 8,
        ..ResNetInit::resnet18()
    };
    let mut backbone = init.build(&vs.root())?;
    let input = Tensor::randn(&[1, 3, 64, 64], FLOAT_CPU);
    let taps_before = backbone.forward_taps(&input, false, &[7, 11])?;

    let pruner = pruner(0.2, &[7, 11])?;
    let mut pruned = vec![];
    let mut rejected = vec![];
    for position in 0..backbone.len() {
        let kind = backbone.nodes()[position].block_kind();
        if pruner.is_fork_point(position) || kind == BlockKind::ChannelPreserving {
            continue;
        }
        match pruner.prune_position(&mut backbone, position) {
            Ok(report) => pruned.push((position, report.num_removed())),
            Err(err) => {
                assert!(!err.is_fatal(), "unexpected error {:?}", err);
                rejected.push(position);
            }
        }
    }

    // the stem feeds an identity skip
    assert_eq!(rejected, [0]);
    assert_eq!(
        pruned.iter().map(|&(position, _)| position).collect::<Vec<_>>(),
        [4, 5, 6, 8, 9, 10]
    );
    assert!(pruned.iter().all(|&(_, removed)| removed > 0));
    backbone.check_connectivity()?;

    let taps_after = backbone.forward_taps(&input, false, &[7, 11])?;
    for (before, after) in taps_before.iter().zip(&taps_after) {
        assert_eq!(before.size(), after.size());
    }
    assert_eq!(backbone.out_channels_at(7), Some(16));
    assert_eq!(backbone.out_channels_at(11), Some(64));
    Ok(())
}

#[test]
fn near_one_ratio_keeps_one_filter() -> Result<()> {
    let vs = nn::VarStore::new(Device::Cpu);
    let root = vs.root();
    let mut backbone = Backbone::new(vec![
        Conv2DInit::new(3, 16, 3).build(&root / 0)?.into(),
        Conv2DInit::new(16, 8, 3).build(&root / 1)?.into(),
    ])?;

    let report = pruner(0.9999, &[])?.prune_position(&mut backbone, 0)?;
    assert_eq!(report.junctions[0].new_width, 1);
    assert_eq!(backbone.conv(LayerRef::node(1)).unwrap().in_channels(), 1);
    Ok(())
}
