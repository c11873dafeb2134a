use super::function::Function;
use super::node::{NodeId, NodeKind, Visibility, Window};
use crate::error::{CompileError, Result};
use crate::tensor::{Tensor, Type};

/// Typed constructors. Each one infers the output type from its operands and
/// reports incompatible operands as a type mismatch naming the new node.
impl Function {
    pub fn create_variable(
        &mut self,
        name: &str,
        visibility: Visibility,
        payload: Tensor,
    ) -> Result<NodeId> {
        self.create_node(
            name,
            NodeKind::Variable {
                visibility,
                payload,
            },
            &[],
            None,
        )
    }

    /// Public, externally bound input initialised with zeros.
    pub fn create_input(&mut self, name: &str, ty: Type) -> Result<NodeId> {
        self.create_variable(name, Visibility::Public, Tensor::zeros(ty))
    }

    /// Private constant weight.
    pub fn create_constant(&mut self, name: &str, payload: Tensor) -> Result<NodeId> {
        self.create_variable(name, Visibility::Private, payload)
    }

    /// Returns the named variable, creating a public one of type `ty` if absent.
    pub fn get_or_create_variable(&mut self, name: &str, ty: &Type) -> Result<NodeId> {
        if let Ok(id) = self.node_by_name(name) {
            let node = self.node(id)?;
            if !node.kind().is_variable() {
                return Err(CompileError::structural(name, "name is bound to an operator"));
            }
            if node.ty() != Some(ty) {
                return Err(CompileError::type_mismatch(
                    name,
                    format!("existing variable has a different type than {ty}"),
                ));
            }
            return Ok(id);
        }
        self.create_input(name, ty.clone())
    }

    /// Marks `input` as a network output. Creates a public output variable
    /// named `name` and returns the save node.
    ///
    /// Results are fetched by name, so `name` must not already be taken.
    pub fn create_save(&mut self, name: &str, input: NodeId) -> Result<NodeId> {
        if self.has_node(name) {
            return Err(CompileError::structural(
                name,
                "output name is already taken by another node",
            ));
        }
        let ty = self.output_type(input)?.clone();
        let dest = self.create_variable(name, Visibility::Public, Tensor::zeros(ty))?;
        self.create_node(&format!("{name}_save"), NodeKind::Save, &[input, dest], None)
    }

    pub fn create_add(&mut self, name: &str, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.create_node(name, NodeKind::Add, &[lhs, rhs], None)
    }

    pub fn create_sub(&mut self, name: &str, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.create_node(name, NodeKind::Sub, &[lhs, rhs], None)
    }

    pub fn create_mul(&mut self, name: &str, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.create_node(name, NodeKind::Mul, &[lhs, rhs], None)
    }

    pub fn create_div(&mut self, name: &str, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.create_node(name, NodeKind::Div, &[lhs, rhs], None)
    }

    pub fn create_max(&mut self, name: &str, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.create_node(name, NodeKind::Max, &[lhs, rhs], None)
    }

    pub fn create_min(&mut self, name: &str, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.create_node(name, NodeKind::Min, &[lhs, rhs], None)
    }

    pub fn create_relu(&mut self, name: &str, input: NodeId) -> Result<NodeId> {
        self.create_node(name, NodeKind::Relu, &[input], None)
    }

    pub fn create_sigmoid(&mut self, name: &str, input: NodeId) -> Result<NodeId> {
        self.create_node(name, NodeKind::Sigmoid, &[input], None)
    }

    pub fn create_tanh(&mut self, name: &str, input: NodeId) -> Result<NodeId> {
        self.create_node(name, NodeKind::Tanh, &[input], None)
    }

    pub fn create_matmul(&mut self, name: &str, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.create_node(name, NodeKind::MatMul, &[lhs, rhs], None)
    }

    pub fn create_fully_connected(
        &mut self,
        name: &str,
        input: NodeId,
        weights: NodeId,
        bias: NodeId,
    ) -> Result<NodeId> {
        self.create_node(name, NodeKind::FullyConnected, &[input, weights, bias], None)
    }

    pub fn create_transpose(
        &mut self,
        name: &str,
        input: NodeId,
        shuffle: impl Into<Vec<usize>>,
    ) -> Result<NodeId> {
        self.create_node(
            name,
            NodeKind::Transpose {
                shuffle: shuffle.into(),
            },
            &[input],
            None,
        )
    }

    pub fn create_reshape(
        &mut self,
        name: &str,
        input: NodeId,
        dims: impl Into<Vec<usize>>,
    ) -> Result<NodeId> {
        self.create_node(name, NodeKind::Reshape { dims: dims.into() }, &[input], None)
    }

    pub fn create_softmax(&mut self, name: &str, input: NodeId) -> Result<NodeId> {
        self.create_node(name, NodeKind::Softmax, &[input], None)
    }

    pub fn create_splat(&mut self, name: &str, ty: Type, value: f32) -> Result<NodeId> {
        self.create_node(name, NodeKind::Splat { value }, &[], Some(ty))
    }

    pub fn create_convolution(
        &mut self,
        name: &str,
        input: NodeId,
        filter: NodeId,
        bias: NodeId,
        window: Window,
    ) -> Result<NodeId> {
        self.create_node(
            name,
            NodeKind::Convolution { window },
            &[input, filter, bias],
            None,
        )
    }

    pub fn create_max_pool(&mut self, name: &str, input: NodeId, window: Window) -> Result<NodeId> {
        self.create_node(name, NodeKind::MaxPool { window }, &[input], None)
    }

    pub fn create_avg_pool(&mut self, name: &str, input: NodeId, window: Window) -> Result<NodeId> {
        self.create_node(name, NodeKind::AvgPool { window }, &[input], None)
    }

    pub fn create_quantize(&mut self, name: &str, input: NodeId, ty: Type) -> Result<NodeId> {
        self.create_node(name, NodeKind::Quantize, &[input], Some(ty))
    }

    pub fn create_dequantize(&mut self, name: &str, input: NodeId) -> Result<NodeId> {
        self.create_node(name, NodeKind::Dequantize, &[input], None)
    }

    pub fn create_rescale_quantized(
        &mut self,
        name: &str,
        input: NodeId,
        ty: Type,
    ) -> Result<NodeId> {
        self.create_node(name, NodeKind::RescaleQuantized, &[input], Some(ty))
    }
}
