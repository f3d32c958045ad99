//! Model-wide operations on low-rank layers

use super::{Model, NodeId};
use crate::error::Result;
use crate::lowrank::{LayerCommand, LowRankConfig, LowRankConv2d, LowRankLinear};
use crate::nn::Layer;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

/// The last factorizable node met during replacement, with its dense layer
#[derive(Debug, Clone)]
pub struct LastEligible {
    pub node: NodeId,
    pub path: String,
    pub dense: Layer,
}

/// Outcome of [`replace_linear_layers`]
#[derive(Debug, Clone, Default)]
pub struct ReplacementReport {
    pub replaced: usize,
    pub last: Option<LastEligible>,
}

/// Rebuild `model` with every dense linear/conv node factorized
///
/// The source model is left untouched. Nodes are visited depth-first in
/// pre-order; the new arena keeps the same structure and names. Factor
/// initialization draws from a generator seeded with `config.seed`.
pub fn replace_linear_layers(
    model: &Model,
    config: &LowRankConfig,
) -> Result<(Model, ReplacementReport)> {
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut report = ReplacementReport::default();
    let paths = model.paths();

    let root = model.root();
    let mut rebuilt = Model::new(
        model.node(root).name().to_string(),
        factorize(model.layer(root), &paths[root.0], config, &mut rng, &mut report)?,
    );
    let new_root = rebuilt.root();
    // a factorizable root is the only node replaced so far
    if let Some(last) = report.last.as_mut() {
        last.node = new_root;
    }
    rebuild_children(model, root, &mut rebuilt, new_root, &paths, config, &mut rng, &mut report)?;

    info!(
        replaced = report.replaced,
        last = report.last.as_ref().map(|l| l.path.as_str()).unwrap_or("-"),
        "Replaced dense layers with low-rank layers"
    );
    Ok((rebuilt, report))
}

#[allow(clippy::too_many_arguments)]
fn rebuild_children(
    source: &Model,
    source_id: NodeId,
    target: &mut Model,
    target_id: NodeId,
    paths: &[String],
    config: &LowRankConfig,
    rng: &mut StdRng,
    report: &mut ReplacementReport,
) -> Result<()> {
    let mut children = Vec::new();
    for (name, child) in source.children(source_id) {
        let before = report.replaced;
        let layer = factorize(source.layer(child), &paths[child.0], config, rng, report)?;
        let new_id = target.alloc(name.to_string(), layer);
        if report.replaced > before {
            if let Some(last) = report.last.as_mut() {
                last.node = new_id;
            }
        }
        rebuild_children(source, child, target, new_id, paths, config, rng, report)?;
        children.push(new_id);
    }
    target.set_children(target_id, children);
    Ok(())
}

/// Low-rank counterpart of a dense layer, or a copy of anything else
fn factorize(
    layer: &Layer,
    path: &str,
    config: &LowRankConfig,
    rng: &mut StdRng,
    report: &mut ReplacementReport,
) -> Result<Layer> {
    let replaced = match layer {
        Layer::Linear(dense) => Layer::LowRankLinear(LowRankLinear::from_dense(path, dense, config, rng)?),
        Layer::Conv2d(dense) => Layer::LowRankConv2d(LowRankConv2d::from_dense(path, dense, config, rng)?),
        other => return Ok(other.clone()),
    };
    debug!(layer = path, kind = layer.kind(), "Factorized layer");
    report.replaced += 1;
    report.last = Some(LastEligible {
        // patched by the caller once the node is allocated
        node: NodeId(usize::MAX),
        path: path.to_string(),
        dense: layer.clone(),
    });
    Ok(replaced)
}

/// Put the original dense layer back at the node recorded in `report`
///
/// Identity is the node id, so layers sharing a name are unaffected.
pub fn reset_last_layer_to_dense(mut model: Model, report: &ReplacementReport) -> Model {
    if let Some(last) = &report.last {
        if last.node.0 < model.len() {
            model.replace_layer(last.node, last.dense.clone());
            info!(layer = last.path.as_str(), "Reset last layer to dense");
        }
    }
    model
}

/// Apply `command` to every low-rank node, at any depth
///
/// Other nodes are skipped. Returns how many units were visited.
pub fn broadcast(model: &mut Model, command: &LayerCommand) -> Result<usize> {
    let mut visited = 0;
    for unit in model.low_rank_units_mut() {
        unit.apply(command)?;
        visited += 1;
    }
    Ok(visited)
}

/// Rank of every low-rank node as a fraction of `min(n_in, n_out)`, in pre-order
pub fn get_all_ranks(model: &Model) -> Vec<f32> {
    model
        .low_rank_units()
        .into_iter()
        .map(|unit| unit.rank_fraction())
        .collect()
}
