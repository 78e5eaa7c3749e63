//! Slot-count planning.
//!
//! Pure functions: they take slot and key counts already read from the
//! cluster and return how many slots should move where. Nothing here talks
//! to a node.

use crate::slots::divide;

/// Move `count` slots from `from` to `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer<K> {
    pub from: K,
    pub to: K,
    pub count: usize,
}

/// Plans transfers that even out slot counts across primaries.
///
/// `counts` pairs each primary with the slots it owns now; `total` is the
/// number of slots being shared out. Targets come from [`divide`], so after
/// the plan is applied counts differ by at most one. The sweep pairs the
/// most overloaded primary with the most underloaded one and moves
/// `min(surplus, deficit)`, advancing whichever side is satisfied.
///
/// Primaries with equal counts keep their input order in the sort, so the
/// surplus side gives in input order and the deficit side, walked from the
/// back, receives in reverse input order.
pub fn slot_balance<K: Clone>(counts: &[(K, usize)], total: usize) -> Vec<Transfer<K>> {
    let mut nodes: Vec<(K, usize)> = counts.to_vec();
    nodes.sort_by(|a, b| b.1.cmp(&a.1));
    let targets = divide(total, nodes.len());

    let mut plan = Vec::new();
    if nodes.is_empty() {
        return plan;
    }

    let (mut i, mut j) = (0, nodes.len() - 1);
    while i < j {
        let surplus = nodes[i].1.saturating_sub(targets[i]);
        if surplus == 0 {
            i += 1;
            continue;
        }
        let deficit = targets[j].saturating_sub(nodes[j].1);
        if deficit == 0 {
            j -= 1;
            continue;
        }

        let moved = surplus.min(deficit);
        plan.push(Transfer {
            from: nodes[i].0.clone(),
            to: nodes[j].0.clone(),
            count: moved,
        });
        nodes[i].1 -= moved;
        nodes[j].1 += moved;

        if moved == deficit {
            j -= 1;
        }
        if moved == surplus {
            i += 1;
        }
    }
    plan
}

/// Picks the `count` slots holding the fewest keys. Ties keep input order.
pub fn pick_cheapest_slots(key_counts: &[(u16, u64)], count: usize) -> Vec<u16> {
    let mut sorted = key_counts.to_vec();
    sorted.sort_by_key(|&(_, keys)| keys);
    sorted.into_iter().take(count).map(|(slot, _)| slot).collect()
}

/// Splits the slots moving off (or onto) one primary across the others.
///
/// `others` pairs each remaining primary with its slot count. When
/// draining, the least loaded primaries are first in line and take the
/// larger shares; when `income` is set the node is pulling slots in and the
/// most loaded primaries give first. Entries with a zero share are dropped.
pub fn plan_node_drain<K: Clone>(count: usize, others: &[(K, usize)], income: bool) -> Vec<(K, usize)> {
    let mut ordered = others.to_vec();
    if income {
        ordered.sort_by(|a, b| b.1.cmp(&a.1));
    } else {
        ordered.sort_by_key(|(_, slots)| *slots);
    }

    ordered
        .into_iter()
        .zip(divide(count, others.len()))
        .filter(|(_, share)| *share > 0)
        .map(|((node, _), share)| (node, share))
        .collect()
}
