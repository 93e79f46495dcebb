// This file is part of Gear.
//
// Copyright (C) 2025 Gear Technologies Inc.
// SPDX-License-Identifier: GPL-3.0-or-later WITH Classpath-exception-2.0
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Staged intake of network messages.
//!
//! Stage one admits raw payloads into a bounded per-peer FIFO with
//! seen-hash deduplication. Stage two pops bounded batches, decodes them and
//! hands them to batched verification. Decoding happens off the network
//! thread.

use crate::{hash::hash, network::NodeId};
use parity_scale_codec::{Decode, Encode};
use parking_lot::Mutex;
use primitive_types::H256;
use rand::{Rng, seq::SliceRandom};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued(H256),
    AlreadySeen(H256),
    /// Peer exhausted its quota.
    Dropped(H256),
}

impl PushOutcome {
    pub fn hash(&self) -> H256 {
        match self {
            Self::Queued(hash) | Self::AlreadySeen(hash) | Self::Dropped(hash) => *hash,
        }
    }
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<(NodeId, Vec<u8>)>,
    per_node: HashMap<NodeId, usize>,
    seen: HashSet<H256>,
}

/// Pending raw messages of one kind.
///
/// The per-peer quota counts every admitted message until [`PendingMessages::clear`],
/// popping does not refund it.
pub struct PendingMessages {
    max_per_node: usize,
    inner: Mutex<Inner>,
}

impl PendingMessages {
    pub fn new(max_per_node: usize) -> Self {
        Self {
            max_per_node,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn push(&self, from: NodeId, payload: Vec<u8>) -> PushOutcome {
        let hash = hash(&payload);
        let mut inner = self.inner.lock();

        let count = inner.per_node.entry(from).or_default();
        if *count >= self.max_per_node {
            tracing::trace!(peer = from, %hash, "too many pending messages from peer");
            return PushOutcome::Dropped(hash);
        }
        *count += 1;

        if !inner.seen.insert(hash) {
            tracing::trace!(peer = from, %hash, "message already seen");
            return PushOutcome::AlreadySeen(hash);
        }

        inner.queue.push_back((from, payload));
        PushOutcome::Queued(hash)
    }

    pub fn push_message<M: Encode>(&self, from: NodeId, message: &M) -> PushOutcome {
        self.push(from, message.encode())
    }

    pub fn pop(&self, max_count: usize) -> Vec<(NodeId, Vec<u8>)> {
        let mut inner = self.inner.lock();
        let count = max_count.min(inner.queue.len());
        inner.queue.drain(..count).collect()
    }

    /// Pops up to `max_count` messages; `None` marks a payload that failed to decode.
    pub fn pop_and_decode<M: Decode>(&self, max_count: usize) -> Vec<(NodeId, Option<M>)> {
        self.pop(max_count)
            .into_iter()
            .map(|(from, payload)| (from, M::decode(&mut payload.as_slice()).ok()))
            .collect()
    }

    pub fn has_seen(&self, hash: &H256) -> bool {
        self.inner.lock().seen.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    pub fn clear(&self) {
        *self.inner.lock() = Inner::default();
    }
}

/// Visits nodes in random round-robin order while `cont` holds. A node
/// leaves the rotation once `callback` returns false for it.
pub fn iterate_nodes_random<V, R: Rng + ?Sized>(
    nodes: &mut HashMap<NodeId, V>,
    mut cont: impl FnMut() -> bool,
    mut callback: impl FnMut(NodeId, &mut V) -> bool,
    rng: &mut R,
) {
    let mut order: Vec<NodeId> = nodes.keys().copied().collect();
    order.shuffle(rng);

    let mut idx = 0;
    while !order.is_empty() && cont() {
        let node = order[idx];
        let keep = nodes
            .get_mut(&node)
            .is_some_and(|state| callback(node, state));

        if keep {
            idx = (idx + 1) % order.len();
        } else {
            order.remove(idx);
            if order.is_empty() {
                break;
            }
            idx %= order.len();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    #[test]
    fn quota_and_dedup() {
        let pending = PendingMessages::new(2);

        assert!(matches!(pending.push(1, vec![1]), PushOutcome::Queued(_)));
        assert!(matches!(pending.push(1, vec![1]), PushOutcome::AlreadySeen(_)));
        assert!(matches!(pending.push(1, vec![2]), PushOutcome::Dropped(_)));
        assert!(matches!(pending.push(2, vec![2]), PushOutcome::Queued(_)));

        assert!(pending.has_seen(&hash(&[1])));
        assert_eq!(pending.pop(10), vec![(1, vec![1]), (2, vec![2])]);

        // quota is not refunded by popping
        assert!(matches!(pending.push(1, vec![3]), PushOutcome::Dropped(_)));

        pending.clear();
        assert!(!pending.has_seen(&hash(&[1])));
        assert!(matches!(pending.push(1, vec![3]), PushOutcome::Queued(_)));
    }

    #[test]
    fn undecodable_payload_pops_as_none() {
        let pending = PendingMessages::new(4);
        pending.push_message(1, &7u32);
        pending.push(2, vec![1]);

        let popped = pending.pop_and_decode::<u32>(8);
        assert_eq!(popped, vec![(1, Some(7)), (2, None)]);
        assert!(pending.is_empty());
    }

    #[test]
    fn round_robin_visits_until_exhausted() {
        let mut nodes: HashMap<NodeId, Vec<u32>> =
            HashMap::from([(1, vec![1, 2, 3]), (2, vec![4]), (3, vec![])]);
        let mut rng = StdRng::seed_from_u64(41);
        let mut taken = Vec::new();

        iterate_nodes_random(
            &mut nodes,
            || true,
            |_, queue| match queue.pop() {
                Some(item) => {
                    taken.push(item);
                    true
                }
                None => false,
            },
            &mut rng,
        );

        taken.sort_unstable();
        assert_eq!(taken, vec![1, 2, 3, 4]);
        assert!(nodes.values().all(Vec::is_empty));
    }
}
