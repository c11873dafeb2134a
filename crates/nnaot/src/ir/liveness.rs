use std::collections::BTreeMap;

use super::{BufferId, BufferKind, InstrKind, IrFunction, LiveRange};

/// Live range of every activation in instruction positions.
///
/// A range starts at the activation's allocation and ends at the last
/// instruction touching it directly or through a view. Deallocations do not
/// count as uses.
pub fn compute_live_ranges(function: &IrFunction) -> BTreeMap<BufferId, LiveRange> {
    let mut ranges: BTreeMap<BufferId, LiveRange> = BTreeMap::new();
    for (pos, instr) in function.instructions().iter().enumerate() {
        if matches!(instr.kind, InstrKind::DeallocActivation { .. }) {
            continue;
        }
        for (operand, _) in instr.operands() {
            let root = function.root(operand);
            if !matches!(function.buffer(root).kind, BufferKind::Activation) {
                continue;
            }
            ranges
                .entry(root)
                .and_modify(|range| range.last_use = range.last_use.max(pos))
                .or_insert(LiveRange {
                    first_def: pos,
                    last_use: pos,
                });
        }
    }
    ranges
}
