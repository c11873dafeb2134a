//! JSON graph descriptions and the importer that turns them into graph nodes.
//!
//! A description lists nodes in definition order; every operand refers to an
//! earlier node by name:
//!
//! ```json
//! {
//!   "name": "mlp",
//!   "nodes": [
//!     {"op": "input", "name": "x"},
//!     {"op": "constant", "name": "w", "dims": [4, 2], "values": [0, 1, 2, 3, 4, 5, 6, 7]},
//!     {"op": "constant", "name": "b", "dims": [2], "values": [0, 0]},
//!     {"op": "fully_connected", "name": "fc", "input": "x", "weights": "w", "bias": "b"},
//!     {"op": "softmax", "name": "probs", "input": "fc"}
//!   ],
//!   "outputs": [{"name": "y", "node": "probs"}]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use nnaot::graph::{Function, NodeId, Window};
use nnaot::import::{ImportedModel, ModelImporter};
use nnaot::{CompileError, Result, Tensor, Type};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelDescription {
    #[serde(default = "default_name")]
    pub name: String,
    pub nodes: Vec<NodeSpec>,
    pub outputs: Vec<OutputSpec>,
}

fn default_name() -> String {
    "main".to_string()
}

/// A network output: a public variable `name` receiving the value of `node`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    pub node: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum NodeSpec {
    /// Public variable typed by the tensor bound under the same name.
    Input { name: String },
    Constant {
        name: String,
        dims: Vec<usize>,
        values: Vec<f32>,
    },
    Splat {
        name: String,
        dims: Vec<usize>,
        value: f32,
    },
    Add(Binary),
    Sub(Binary),
    Mul(Binary),
    Div(Binary),
    Max(Binary),
    Min(Binary),
    #[serde(rename = "matmul")]
    MatMul(Binary),
    Relu(Unary),
    Sigmoid(Unary),
    Tanh(Unary),
    Softmax(Unary),
    FullyConnected(FullyConnected),
    Convolution(Convolution),
    MaxPool(Pooling),
    AvgPool(Pooling),
    Transpose {
        name: String,
        input: String,
        shuffle: Vec<usize>,
    },
    Reshape {
        name: String,
        input: String,
        dims: Vec<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Binary {
    pub name: String,
    pub lhs: String,
    pub rhs: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Unary {
    pub name: String,
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FullyConnected {
    pub name: String,
    pub input: String,
    pub weights: String,
    pub bias: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Convolution {
    pub name: String,
    pub input: String,
    pub filter: String,
    pub bias: String,
    pub kernel: usize,
    #[serde(default = "one")]
    pub stride: usize,
    #[serde(default)]
    pub pad: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Pooling {
    pub name: String,
    pub input: String,
    pub kernel: usize,
    #[serde(default = "one")]
    pub stride: usize,
    #[serde(default)]
    pub pad: usize,
}

fn one() -> usize {
    1
}

impl NodeSpec {
    pub fn name(&self) -> &str {
        match self {
            NodeSpec::Input { name }
            | NodeSpec::Constant { name, .. }
            | NodeSpec::Splat { name, .. }
            | NodeSpec::Transpose { name, .. }
            | NodeSpec::Reshape { name, .. } => name,
            NodeSpec::Add(b)
            | NodeSpec::Sub(b)
            | NodeSpec::Mul(b)
            | NodeSpec::Div(b)
            | NodeSpec::Max(b)
            | NodeSpec::Min(b)
            | NodeSpec::MatMul(b) => &b.name,
            NodeSpec::Relu(u) | NodeSpec::Sigmoid(u) | NodeSpec::Tanh(u) | NodeSpec::Softmax(u) => {
                &u.name
            }
            NodeSpec::FullyConnected(fc) => &fc.name,
            NodeSpec::Convolution(conv) => &conv.name,
            NodeSpec::MaxPool(pool) | NodeSpec::AvgPool(pool) => &pool.name,
        }
    }
}

impl ModelDescription {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| CompileError::io(path, err))?;
        Self::from_json_str(&text)
    }

    /// Names of the declared inputs, in definition order.
    pub fn input_names(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                NodeSpec::Input { name } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Builds graph nodes from a [`ModelDescription`].
pub struct JsonImporter {
    model: ModelDescription,
}

impl JsonImporter {
    pub fn new(model: ModelDescription) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &ModelDescription {
        &self.model
    }

    fn binary(
        function: &mut Function,
        op: &Binary,
        create: fn(&mut Function, &str, NodeId, NodeId) -> Result<NodeId>,
    ) -> Result<NodeId> {
        let lhs = function.node_by_name(&op.lhs)?;
        let rhs = function.node_by_name(&op.rhs)?;
        create(function, &op.name, lhs, rhs)
    }

    fn unary(
        function: &mut Function,
        op: &Unary,
        create: fn(&mut Function, &str, NodeId) -> Result<NodeId>,
    ) -> Result<NodeId> {
        let input = function.node_by_name(&op.input)?;
        create(function, &op.name, input)
    }

    fn add_node(
        function: &mut Function,
        node: &NodeSpec,
        inputs: &[(&str, &Tensor)],
    ) -> Result<NodeId> {
        match node {
            NodeSpec::Input { name } => {
                let (_, tensor) = inputs
                    .iter()
                    .find(|(bound, _)| *bound == name.as_str())
                    .ok_or_else(|| CompileError::NotFound(format!("tensor for input `{name}`")))?;
                function.create_input(name, tensor.ty().clone())
            }
            NodeSpec::Constant { name, dims, values } => {
                let payload = Tensor::from_f32(dims.clone(), values.clone())?;
                function.create_constant(name, payload)
            }
            NodeSpec::Splat { name, dims, value } => {
                function.create_splat(name, Type::f32(dims.clone()), *value)
            }
            NodeSpec::Add(b) => Self::binary(function, b, Function::create_add),
            NodeSpec::Sub(b) => Self::binary(function, b, Function::create_sub),
            NodeSpec::Mul(b) => Self::binary(function, b, Function::create_mul),
            NodeSpec::Div(b) => Self::binary(function, b, Function::create_div),
            NodeSpec::Max(b) => Self::binary(function, b, Function::create_max),
            NodeSpec::Min(b) => Self::binary(function, b, Function::create_min),
            NodeSpec::MatMul(b) => Self::binary(function, b, Function::create_matmul),
            NodeSpec::Relu(u) => Self::unary(function, u, Function::create_relu),
            NodeSpec::Sigmoid(u) => Self::unary(function, u, Function::create_sigmoid),
            NodeSpec::Tanh(u) => Self::unary(function, u, Function::create_tanh),
            NodeSpec::Softmax(u) => Self::unary(function, u, Function::create_softmax),
            NodeSpec::FullyConnected(fc) => {
                let input = function.node_by_name(&fc.input)?;
                let weights = function.node_by_name(&fc.weights)?;
                let bias = function.node_by_name(&fc.bias)?;
                function.create_fully_connected(&fc.name, input, weights, bias)
            }
            NodeSpec::Convolution(conv) => {
                let input = function.node_by_name(&conv.input)?;
                let filter = function.node_by_name(&conv.filter)?;
                let bias = function.node_by_name(&conv.bias)?;
                let window = Window::new(conv.kernel, conv.stride, conv.pad);
                function.create_convolution(&conv.name, input, filter, bias, window)
            }
            NodeSpec::MaxPool(pool) => {
                let input = function.node_by_name(&pool.input)?;
                let window = Window::new(pool.kernel, pool.stride, pool.pad);
                function.create_max_pool(&pool.name, input, window)
            }
            NodeSpec::AvgPool(pool) => {
                let input = function.node_by_name(&pool.input)?;
                let window = Window::new(pool.kernel, pool.stride, pool.pad);
                function.create_avg_pool(&pool.name, input, window)
            }
            NodeSpec::Transpose {
                name,
                input,
                shuffle,
            } => {
                let input = function.node_by_name(input)?;
                function.create_transpose(name, input, shuffle.clone())
            }
            NodeSpec::Reshape { name, input, dims } => {
                let input = function.node_by_name(input)?;
                function.create_reshape(name, input, dims.clone())
            }
        }
    }
}

impl ModelImporter for JsonImporter {
    fn import(&self, function: &mut Function, inputs: &[(&str, &Tensor)]) -> Result<ImportedModel> {
        let mut declared = BTreeMap::new();
        for node in &self.model.nodes {
            let id = Self::add_node(function, node, inputs)?;
            if matches!(node, NodeSpec::Input { .. }) {
                declared.insert(node.name().to_string(), id);
            }
        }
        // A bound tensor the model never declares would be silently ignored.
        for (name, _) in inputs {
            if !declared.contains_key(*name) {
                return Err(CompileError::NotFound(format!(
                    "input `{name}` in model `{}`",
                    self.model.name
                )));
            }
        }

        let mut outputs = Vec::with_capacity(self.model.outputs.len());
        for output in &self.model.outputs {
            let value = function.node_by_name(&output.node)?;
            outputs.push(function.create_save(&output.name, value)?);
        }
        log::debug!(
            "imported `{}`: {} nodes, {} inputs, {} outputs",
            self.model.name,
            function.len(),
            declared.len(),
            outputs.len()
        );
        Ok(ImportedModel {
            outputs,
            inputs: declared,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strides_and_padding_have_defaults() {
        let model = ModelDescription::from_json_str(
            r#"{"nodes": [
                {"op": "input", "name": "x"},
                {"op": "max_pool", "name": "p", "input": "x", "kernel": 2}
            ], "outputs": []}"#,
        )
        .unwrap();
        assert_eq!(model.name, "main");
        assert_eq!(
            model.nodes[1],
            NodeSpec::MaxPool(Pooling {
                name: "p".to_string(),
                input: "x".to_string(),
                kernel: 2,
                stride: 1,
                pad: 0,
            })
        );
        assert_eq!(model.input_names(), vec!["x"]);
    }

    #[test]
    fn unknown_operators_are_rejected() {
        let err = ModelDescription::from_json_str(
            r#"{"nodes": [{"op": "gelu", "name": "g", "input": "x"}], "outputs": []}"#,
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::Serialization(_)), "{err}");
    }
}
