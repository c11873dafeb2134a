//! High-level operator graph.

mod builder;
mod function;
mod node;
mod types;

pub use function::Function;
pub use node::{Node, NodeId, NodeKind, Visibility, Window};
