//! Arena model graph

use crate::autograd::{add, Context};
use crate::error::{Error, Result};
use crate::lowrank::LowRankUnit;
use crate::nn::Layer;
use crate::Tensor;
use nalgebra::DMatrix;

/// Index of a node in its model's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A named layer and its children
#[derive(Debug, Clone)]
pub struct Node {
    name: String,
    layer: Layer,
    children: Vec<NodeId>,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

/// Tree of layers stored in an arena
#[derive(Debug, Clone)]
pub struct Model {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Model {
    /// Model with a single root node
    pub fn new(name: impl Into<String>, layer: Layer) -> Self {
        Self {
            nodes: vec![Node {
                name: name.into(),
                layer,
                children: Vec::new(),
            }],
            root: NodeId(0),
        }
    }

    /// Model whose root is an empty `Sequential` named `"model"`
    pub fn sequential() -> Self {
        Self::new("model", Layer::Sequential)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append a child to a container node
    pub fn push(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        layer: impl Into<Layer>,
    ) -> Result<NodeId> {
        let parent_node = self
            .nodes
            .get(parent.0)
            .ok_or_else(|| Error::ConfigError(format!("Unknown node {}", parent.0)))?;
        if !parent_node.layer.is_container() {
            return Err(Error::ConfigError(format!(
                "Node '{}' is a {} layer and cannot hold children",
                parent_node.name,
                parent_node.layer.kind()
            )));
        }
        let id = self.alloc(name.into(), layer.into());
        self.nodes[parent.0].children.push(id);
        Ok(id)
    }

    pub(crate) fn alloc(&mut self, name: String, layer: Layer) -> NodeId {
        self.nodes.push(Node {
            name,
            layer,
            children: Vec::new(),
        });
        NodeId(self.nodes.len() - 1)
    }

    pub(crate) fn set_children(&mut self, id: NodeId, children: Vec<NodeId>) {
        self.nodes[id.0].children = children;
    }

    pub(crate) fn replace_layer(&mut self, id: NodeId, layer: Layer) -> Layer {
        std::mem::replace(&mut self.nodes[id.0].layer, layer)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn layer(&self, id: NodeId) -> &Layer {
        &self.nodes[id.0].layer
    }

    /// Named children of a node
    pub fn children(&self, id: NodeId) -> impl Iterator<Item = (&str, NodeId)> + '_ {
        self.nodes[id.0]
            .children
            .iter()
            .map(move |&child| (self.nodes[child.0].name.as_str(), child))
    }

    /// Depth-first pre-order from the root
    pub fn pre_order(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id.0].children.iter().rev().copied());
        }
        order
    }

    /// Dotted path of every node, indexed by arena position
    pub fn paths(&self) -> Vec<String> {
        let mut paths = vec![String::new(); self.nodes.len()];
        let mut stack = vec![(self.root, self.nodes[self.root.0].name.clone())];
        while let Some((id, path)) = stack.pop() {
            for &child in &self.nodes[id.0].children {
                stack.push((child, format!("{path}.{}", self.nodes[child.0].name)));
            }
            paths[id.0] = path;
        }
        paths
    }

    /// Layers in pre-order, mutably
    fn layers_mut(&mut self) -> Vec<&mut Layer> {
        let order = self.pre_order();
        let mut slots: Vec<Option<&mut Layer>> =
            self.nodes.iter_mut().map(|n| Some(&mut n.layer)).collect();
        order
            .into_iter()
            .filter_map(|id| slots[id.0].take())
            .collect()
    }

    /// Low-rank layers in pre-order
    pub fn low_rank_units(&self) -> Vec<&dyn LowRankUnit> {
        self.pre_order()
            .into_iter()
            .filter_map(|id| self.nodes[id.0].layer.as_low_rank())
            .collect()
    }

    pub fn low_rank_units_mut(&mut self) -> Vec<&mut dyn LowRankUnit> {
        self.layers_mut()
            .into_iter()
            .filter_map(|layer| layer.as_low_rank_mut())
            .collect()
    }

    /// Trainable tensors in pre-order
    pub fn parameters(&self) -> Vec<&Tensor> {
        self.pre_order()
            .into_iter()
            .flat_map(|id| self.nodes[id.0].layer.parameters())
            .collect()
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        self.layers_mut()
            .into_iter()
            .flat_map(|layer| layer.parameters_mut())
            .collect()
    }

    /// Orthonormal `U`/`V` buffers of every low-rank layer, in pre-order
    pub fn buffers_mut(&mut self) -> Vec<&mut DMatrix<f32>> {
        self.low_rank_units_mut()
            .into_iter()
            .flat_map(|unit| unit.core_mut().buffers_mut())
            .collect()
    }

    pub fn zero_grad(&self) {
        for param in self.parameters() {
            param.zero_grad();
        }
    }

    pub fn forward(&self, x: &Tensor, ctx: &Context) -> Result<Tensor> {
        self.forward_node(self.root, x, ctx)
    }

    fn forward_node(&self, id: NodeId, x: &Tensor, ctx: &Context) -> Result<Tensor> {
        let node = &self.nodes[id.0];
        match node.layer {
            Layer::Sequential => self.forward_children(node, x, ctx),
            Layer::Residual => {
                let y = self.forward_children(node, x, ctx)?;
                if y.shape() != x.shape() {
                    return Err(Error::ShapeMismatch {
                        expected: x.shape().to_vec(),
                        got: y.shape().to_vec(),
                    });
                }
                Ok(add(&y, x))
            }
            _ => node.layer.forward(x, ctx),
        }
    }

    fn forward_children(&self, node: &Node, x: &Tensor, ctx: &Context) -> Result<Tensor> {
        node.children
            .iter()
            .try_fold(x.clone(), |h, &child| self.forward_node(child, &h, ctx))
    }
}
