use std::collections::BTreeMap;

use super::{BufferId, IrFunction, LiveRange, MemoryPlan, Segment};

/// Alignment of every activation segment and of the arena itself.
pub const ARENA_ALIGNMENT: usize = 64;

fn aligned_size(bytes: usize) -> usize {
    bytes.max(1).div_ceil(ARENA_ALIGNMENT) * ARENA_ALIGNMENT
}

/// Assigns arena offsets first-fit, in order of first definition.
///
/// Activations whose live ranges are disjoint may share bytes; weights are
/// never placed in the arena.
pub fn plan_memory(function: &IrFunction, live_ranges: BTreeMap<BufferId, LiveRange>) -> MemoryPlan {
    let mut order: Vec<(BufferId, LiveRange)> =
        live_ranges.iter().map(|(id, range)| (*id, *range)).collect();
    order.sort_by_key(|(id, range)| (range.first_def, *id));

    let mut live: Vec<(Segment, LiveRange)> = Vec::new();
    let mut segments = BTreeMap::new();
    let mut high_water = 0usize;

    for (id, range) in order {
        live.retain(|(_, other)| other.last_use >= range.first_def);
        live.sort_by_key(|(segment, _)| segment.offset);

        let size = aligned_size(function.buffer(id).ty.byte_len());
        let mut offset = 0usize;
        for (segment, _) in &live {
            if segment.offset >= offset + size {
                break;
            }
            offset = offset.max(segment.end());
        }
        let segment = Segment { offset, size };
        high_water = high_water.max(segment.end());
        segments.insert(id, segment);
        live.push((segment, range));
    }

    MemoryPlan {
        activation_bytes: high_water,
        segments,
        live_ranges,
    }
}
