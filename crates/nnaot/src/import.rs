//! Contract for model-description importers.
//!
//! Importers populate a [`Function`] and report which nodes matter to the
//! caller. Format parsing lives outside this crate.

use std::collections::BTreeMap;

use crate::error::{CompileError, Result};
use crate::graph::{Function, NodeId};
use crate::tensor::Tensor;

/// Nodes an importer created that the caller needs afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedModel {
    /// Save nodes marking the model outputs, in declaration order.
    pub outputs: Vec<NodeId>,
    /// Public variables, one per requested input name.
    pub inputs: BTreeMap<String, NodeId>,
}

impl ImportedModel {
    /// The first declared output.
    pub fn root(&self) -> Option<NodeId> {
        self.outputs.first().copied()
    }

    /// Checks the 1:1 correspondence between requested input names and the
    /// public variables of `function`.
    pub fn check_inputs(&self, function: &Function, requested: &[&str]) -> Result<()> {
        for name in requested {
            let id = self
                .inputs
                .get(*name)
                .ok_or_else(|| CompileError::NotFound((*name).to_string()))?;
            if !function.node(*id)?.is_public_variable() {
                return Err(CompileError::structural(
                    *name,
                    "declared input is not a public variable",
                ));
            }
        }
        if self.inputs.len() != requested.len() {
            let extra: Vec<&str> = self
                .inputs
                .keys()
                .map(String::as_str)
                .filter(|name| !requested.contains(name))
                .collect();
            return Err(CompileError::structural(
                function.name(),
                format!("importer declared unrequested inputs: {}", extra.join(", ")),
            ));
        }
        Ok(())
    }
}

/// Builds graph nodes from a model description.
///
/// `inputs` maps each declared input name to an example tensor whose type
/// fixes the type of the created public variable.
pub trait ModelImporter {
    fn import(&self, function: &mut Function, inputs: &[(&str, &Tensor)]) -> Result<ImportedModel>;
}
