use super::replace_value;
use crate::error::Result;
use crate::graph::{Function, NodeKind};
use crate::optimizer::{FunctionPass, OptimizeContext, PassResult};

fn is_identity_perm(perm: &[usize]) -> bool {
    perm.iter().copied().eq(0..perm.len())
}

/// Applying `first` and then `second` equals a single transpose by the result.
fn compose_perms(first: &[usize], second: &[usize]) -> Option<Vec<usize>> {
    if first.len() != second.len() {
        return None;
    }
    let mut result = Vec::with_capacity(first.len());
    for &axis in second {
        if axis >= first.len() {
            return None;
        }
        result.push(first[axis]);
    }
    Some(result)
}

/// Removes identity transposes and folds transpose chains, dropping both
/// transposes when the composition is the identity.
#[derive(Default)]
pub struct TransposeCanonicalizationPass;

impl TransposeCanonicalizationPass {
    const NAME: &'static str = "transpose-canonicalize";
}

impl FunctionPass for TransposeCanonicalizationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, function: &mut Function, _cx: &mut OptimizeContext) -> Result<PassResult> {
        let mut stats = PassResult::default();
        for id in function.topological_order()? {
            let Some(node) = function.try_node(id) else {
                continue;
            };
            let NodeKind::Transpose { shuffle } = node.kind() else {
                continue;
            };
            stats.iterations += 1;
            let shuffle = shuffle.clone();
            let src = node.inputs()[0];

            if is_identity_perm(&shuffle) {
                replace_value(function, id, src, &mut stats)?;
                continue;
            }

            let inner = function.node(src)?;
            let NodeKind::Transpose {
                shuffle: inner_shuffle,
            } = inner.kind()
            else {
                continue;
            };
            let base = inner.inputs()[0];
            let Some(composed) = compose_perms(inner_shuffle, &shuffle) else {
                continue;
            };
            if is_identity_perm(&composed) {
                replace_value(function, id, base, &mut stats)?;
            } else {
                function.mutate_node(id, NodeKind::Transpose { shuffle: composed }, &[base])?;
                stats.changed = true;
                stats.rewrites_applied += 1;
            }
            if function.contains(src) && !function.has_users(src) {
                function.erase_node(src)?;
                stats.erased_nodes += 1;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composition_applies_first_then_second() {
        assert_eq!(compose_perms(&[1, 0], &[1, 0]), Some(vec![0, 1]));
        assert_eq!(compose_perms(&[1, 2, 0], &[1, 2, 0]), Some(vec![2, 0, 1]));
        assert_eq!(compose_perms(&[0, 1], &[0]), None);
        assert!(is_identity_perm(&[0, 1, 2]));
        assert!(!is_identity_perm(&[0, 2, 1]));
    }
}
