use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use smallvec::SmallVec;

use super::node::{Node, NodeId, NodeKind};
use super::types;
use crate::error::{CompileError, Result};
use crate::tensor::{Tensor, Type};

/// The named, mutable container of nodes for one compiled unit.
///
/// Nodes live in an arena indexed by [`NodeId`]; edges are stored as handles
/// on the consumer side, and a reverse index keeps one entry per input slot so
/// that use replacement is a rewrite over consumer lists.
#[derive(Debug, Clone)]
pub struct Function {
    name: String,
    nodes: Vec<Option<Node>>,
    users: Vec<SmallVec<[NodeId; 4]>>,
    names: HashMap<String, NodeId>,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            users: Vec::new(),
            names: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live node handles in creation order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_some())
            .map(|(idx, _)| NodeId(idx as u32))
            .collect()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.try_node(id).is_some()
    }

    pub fn try_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(|n| n.as_ref())
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.try_node(id)
            .ok_or_else(|| CompileError::structural(id.to_string(), "dangling node handle"))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.index())
            .and_then(|n| n.as_mut())
            .ok_or_else(|| CompileError::structural(id.to_string(), "dangling node handle"))
    }

    pub fn node_by_name(&self, name: &str) -> Result<NodeId> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| CompileError::NotFound(name.to_string()))
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn name_of(&self, id: NodeId) -> String {
        self.try_node(id)
            .map(|n| n.name().to_string())
            .unwrap_or_else(|| id.to_string())
    }

    /// One entry per input slot that reads `id`.
    pub fn users(&self, id: NodeId) -> &[NodeId] {
        self.users.get(id.index()).map(|u| u.as_slice()).unwrap_or(&[])
    }

    pub fn has_users(&self, id: NodeId) -> bool {
        !self.users(id).is_empty()
    }

    /// Output type of a value-producing node.
    pub fn output_type(&self, id: NodeId) -> Result<&Type> {
        let node = self.node(id)?;
        node.ty()
            .ok_or_else(|| CompileError::structural(node.name(), "sink node has no output value"))
    }

    fn unique_name(&self, base: &str) -> String {
        let base = if base.is_empty() { "node" } else { base };
        if !self.names.contains_key(base) {
            return base.to_string();
        }
        let mut suffix = 1usize;
        loop {
            let candidate = format!("{base}__{suffix}");
            if !self.names.contains_key(&candidate) {
                return candidate;
            }
            suffix += 1;
        }
    }

    /// Adds a node. Inputs must already be present; the output type is
    /// inferred when `ty` is `None` and checked against the operands otherwise.
    ///
    /// A taken `name` is suffixed deterministically (`name__1`, ...).
    pub fn create_node(
        &mut self,
        name: &str,
        kind: NodeKind,
        inputs: &[NodeId],
        ty: Option<Type>,
    ) -> Result<NodeId> {
        let mut operand_types = Vec::with_capacity(inputs.len());
        for (slot, &input) in inputs.iter().enumerate() {
            let Some(node) = self.try_node(input) else {
                return Err(CompileError::structural(
                    name,
                    format!("operand #{slot} refers to missing node {input}"),
                ));
            };
            let Some(ty) = node.ty() else {
                return Err(CompileError::structural(
                    name,
                    format!("operand #{slot} refers to sink `{}`", node.name()),
                ));
            };
            operand_types.push(ty);
        }
        if matches!(kind, NodeKind::Save | NodeKind::QuantizationProfile) {
            if let Some(&dest) = inputs.get(1) {
                if !self.node(dest)?.kind().is_variable() {
                    return Err(CompileError::structural(
                        name,
                        format!("destination `{}` is not a variable", self.name_of(dest)),
                    ));
                }
            }
        }
        let ty = match ty {
            Some(ty) => {
                types::check_type(&kind, &operand_types, Some(&ty))
                    .map_err(|msg| CompileError::type_mismatch(name, msg))?;
                Some(ty)
            }
            None => types::infer_type(&kind, &operand_types)
                .map_err(|msg| CompileError::type_mismatch(name, msg))?,
        };

        let id = NodeId(self.nodes.len() as u32);
        let name = self.unique_name(name);
        for &input in inputs {
            self.users[input.index()].push(id);
        }
        self.names.insert(name.clone(), id);
        self.nodes.push(Some(Node {
            name,
            kind,
            inputs: inputs.iter().copied().collect(),
            ty,
        }));
        self.users.push(SmallVec::new());
        Ok(id)
    }

    /// Every node `id` transitively reads, including itself.
    fn dependencies(&self, id: NodeId) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(node) = self.try_node(current) {
                stack.extend(node.inputs().iter().copied());
            }
        }
        seen
    }

    /// Points every consumer of `old` at `new` and returns the number of
    /// rewritten input slots.
    ///
    /// Fails without mutating anything when the types disagree or when a
    /// consumer of `old` is itself a dependency of `new`.
    pub fn replace_all_uses_with(&mut self, old: NodeId, new: NodeId) -> Result<usize> {
        if old == new {
            return Ok(0);
        }
        let old_node = self.node(old)?;
        let new_node = self.node(new)?;
        let (Some(old_ty), Some(new_ty)) = (old_node.ty(), new_node.ty()) else {
            return Err(CompileError::structural(
                old_node.name(),
                "cannot replace uses of or with a sink",
            ));
        };
        if !old_ty.same_storage_shape(new_ty) {
            return Err(CompileError::type_mismatch(
                old_node.name(),
                format!(
                    "replacement `{}` has type {new_ty}, expected {old_ty}",
                    new_node.name()
                ),
            ));
        }
        let deps = self.dependencies(new);
        if let Some(user) = self.users(old).iter().find(|u| deps.contains(u)) {
            return Err(CompileError::structural(
                self.name_of(old),
                format!(
                    "replacing with `{}` would create a cycle through `{}`",
                    self.name_of(new),
                    self.name_of(*user)
                ),
            ));
        }

        let users = std::mem::take(&mut self.users[old.index()]);
        let mut rewritten = 0usize;
        let mut visited = HashSet::new();
        for user in users {
            if !visited.insert(user) {
                continue;
            }
            let node = self.node_mut(user)?;
            for input in node.inputs.iter_mut() {
                if *input == old {
                    *input = new;
                    rewritten += 1;
                }
            }
        }
        for user in visited {
            let count = self.node(user)?.inputs().iter().filter(|i| **i == new).count();
            let existing = self.users[new.index()].iter().filter(|u| **u == user).count();
            for _ in existing..count {
                self.users[new.index()].push(user);
            }
        }
        Ok(rewritten)
    }

    /// Rewires a single operand slot of `user`.
    pub fn set_input(&mut self, user: NodeId, slot: usize, value: NodeId) -> Result<()> {
        let node = self.node(user)?;
        let Some(previous) = node.input(slot) else {
            return Err(CompileError::structural(
                node.name(),
                format!("operand slot {slot} does not exist"),
            ));
        };
        if previous == value {
            return Ok(());
        }
        let prev_ty = self.output_type(previous)?;
        let value_ty = self.output_type(value)?;
        if !prev_ty.same_storage_shape(value_ty) {
            return Err(CompileError::type_mismatch(
                self.name_of(user),
                format!("operand {slot} cannot change from {prev_ty} to {value_ty}"),
            ));
        }
        if self.dependencies(value).contains(&user) {
            return Err(CompileError::structural(
                self.name_of(user),
                format!("reading `{}` would create a cycle", self.name_of(value)),
            ));
        }
        self.node_mut(user)?.inputs[slot] = value;
        remove_one(&mut self.users[previous.index()], user);
        self.users[value.index()].push(user);
        Ok(())
    }

    /// Rewrites a node in place with a new kind and operand list. The output
    /// type is kept and must remain valid for the new operands.
    pub fn mutate_node(&mut self, id: NodeId, kind: NodeKind, inputs: &[NodeId]) -> Result<()> {
        let node = self.node(id)?;
        let name = node.name().to_string();
        let ty = node.ty().cloned();
        let mut operand_types = Vec::with_capacity(inputs.len());
        for &input in inputs {
            if input == id || self.dependencies(input).contains(&id) {
                return Err(CompileError::structural(
                    &name,
                    format!("reading `{}` would create a cycle", self.name_of(input)),
                ));
            }
            operand_types.push(self.output_type(input)?);
        }
        types::check_type(&kind, &operand_types, ty.as_ref())
            .map_err(|msg| CompileError::type_mismatch(&name, msg))?;

        let previous: Vec<NodeId> = self.node(id)?.inputs().to_vec();
        for input in previous {
            remove_one(&mut self.users[input.index()], id);
        }
        for &input in inputs {
            self.users[input.index()].push(id);
        }
        let node = self.node_mut(id)?;
        node.kind = kind;
        node.inputs = inputs.iter().copied().collect();
        Ok(())
    }

    /// Removes an unreferenced node and returns it.
    pub fn erase_node(&mut self, id: NodeId) -> Result<Node> {
        let node = self.node(id)?;
        if self.has_users(id) {
            let mut names: Vec<String> = self.users(id).iter().map(|u| self.name_of(*u)).collect();
            names.dedup();
            return Err(CompileError::structural(
                node.name(),
                format!("still referenced by {}", names.join(", ")),
            ));
        }
        let node = self.nodes[id.index()]
            .take()
            .ok_or_else(|| CompileError::structural(id.to_string(), "dangling node handle"))?;
        for input in node.inputs() {
            remove_one(&mut self.users[input.index()], id);
        }
        self.names.remove(node.name());
        Ok(node)
    }

    /// Node handles in a deterministic topological order: among ready nodes
    /// the oldest handle comes first.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let mut pending: Vec<usize> = vec![0; self.nodes.len()];
        let mut ready = BinaryHeap::new();
        for id in self.node_ids() {
            let node = self.node(id)?;
            pending[id.index()] = node.inputs().len();
            if node.inputs().is_empty() {
                ready.push(Reverse(id));
            }
        }
        let mut order = Vec::with_capacity(pending.len());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            for user in self.users(id) {
                let slot = &mut pending[user.index()];
                *slot -= 1;
                if *slot == 0 {
                    ready.push(Reverse(*user));
                }
            }
        }
        let live = self.len();
        if order.len() != live {
            let placed: HashSet<NodeId> = order.iter().copied().collect();
            let stuck = self
                .node_ids()
                .into_iter()
                .find(|id| !placed.contains(id))
                .map(|id| self.name_of(id))
                .unwrap_or_default();
            return Err(CompileError::structural(stuck, "graph contains a cycle"));
        }
        Ok(order)
    }

    /// Checks referential integrity, reverse-index consistency, acyclicity and
    /// per-node typing.
    pub fn verify(&self) -> Result<()> {
        let mut expected: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for id in self.node_ids() {
            let node = self.node(id)?;
            let mut operand_types = Vec::with_capacity(node.inputs().len());
            for (slot, input) in node.inputs().iter().enumerate() {
                let Some(producer) = self.try_node(*input) else {
                    return Err(CompileError::structural(
                        node.name(),
                        format!("operand #{slot} refers to missing node {input}"),
                    ));
                };
                let ty = producer.ty().ok_or_else(|| {
                    CompileError::structural(node.name(), format!("operand #{slot} is a sink"))
                })?;
                operand_types.push(ty);
                expected.entry(*input).or_default().push(id);
            }
            types::check_type(node.kind(), &operand_types, node.ty())
                .map_err(|msg| CompileError::type_mismatch(node.name(), msg))?;
            if self.names.get(node.name()) != Some(&id) {
                return Err(CompileError::structural(node.name(), "name index is stale"));
            }
        }
        for id in self.node_ids() {
            let mut actual = self.users(id).to_vec();
            let mut want = expected.remove(&id).unwrap_or_default();
            actual.sort();
            want.sort();
            if actual != want {
                return Err(CompileError::structural(
                    self.name_of(id),
                    "user index is inconsistent with operand lists",
                ));
            }
        }
        self.topological_order().map(|_| ())
    }

    pub fn variables(&self) -> Vec<NodeId> {
        self.node_ids()
            .into_iter()
            .filter(|id| self.try_node(*id).is_some_and(|n| n.kind().is_variable()))
            .collect()
    }

    pub fn saves(&self) -> Vec<NodeId> {
        self.node_ids()
            .into_iter()
            .filter(|id| matches!(self.try_node(*id).map(|n| n.kind()), Some(NodeKind::Save)))
            .collect()
    }

    /// Output variable written by a save node.
    pub fn save_output(&self, save: NodeId) -> Result<NodeId> {
        let node = self.node(save)?;
        match (node.kind(), node.input(1)) {
            (NodeKind::Save, Some(dest)) => Ok(dest),
            _ => Err(CompileError::structural(node.name(), "not a save node")),
        }
    }

    pub fn variable_payload(&self, id: NodeId) -> Result<&Tensor> {
        let node = self.node(id)?;
        match node.kind() {
            NodeKind::Variable { payload, .. } => Ok(payload),
            _ => Err(CompileError::structural(node.name(), "not a variable")),
        }
    }

    /// Explicit rebind of a variable's tensor; the type must not change.
    pub fn set_variable_payload(&mut self, id: NodeId, tensor: Tensor) -> Result<()> {
        let node = self.node_mut(id)?;
        let name = node.name.clone();
        match &mut node.kind {
            NodeKind::Variable { payload, .. } => {
                if payload.ty() != tensor.ty() {
                    return Err(CompileError::type_mismatch(
                        name,
                        format!("cannot rebind {} to {}", payload.ty(), tensor.ty()),
                    ));
                }
                *payload = tensor;
                Ok(())
            }
            _ => Err(CompileError::structural(name, "not a variable")),
        }
    }
}

fn remove_one(list: &mut SmallVec<[NodeId; 4]>, id: NodeId) {
    if let Some(pos) = list.iter().position(|u| *u == id) {
        list.remove(pos);
    }
}
