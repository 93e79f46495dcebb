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

//! Batched BLS signature verification.
//!
//! All pushed messages are first checked with one aggregated pairing check.
//! When that fails, every source is re-checked on its own and failing sources
//! are reported, so one bad peer does not spoil the others.

use crate::bls::{BlsPublicKey, BlsSignature};
use primitive_types::H256;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    hash::Hash,
};

struct PendingSig {
    msg_hash: H256,
    sig: BlsSignature,
    pub_key: BlsPublicKey,
}

pub struct BatchVerifier<S, M> {
    per_message_fallback: bool,
    messages: HashMap<M, PendingSig>,
    by_source: BTreeMap<S, Vec<M>>,
    pub bad_sources: HashSet<S>,
    pub bad_messages: HashSet<M>,
}

impl<S, M> BatchVerifier<S, M>
where
    S: Copy + Ord + Hash,
    M: Copy + Eq + Hash,
{
    /// With `per_message_fallback`, messages of bad sources are also checked
    /// one by one and reported in `bad_messages`.
    pub fn new(per_message_fallback: bool) -> Self {
        Self {
            per_message_fallback,
            messages: HashMap::new(),
            by_source: BTreeMap::new(),
            bad_sources: HashSet::new(),
            bad_messages: HashSet::new(),
        }
    }

    pub fn push_message(
        &mut self,
        source: S,
        msg_id: M,
        msg_hash: H256,
        sig: BlsSignature,
        pub_key: BlsPublicKey,
    ) {
        if self.messages.contains_key(&msg_id) {
            return;
        }
        self.messages.insert(
            msg_id,
            PendingSig {
                msg_hash,
                sig,
                pub_key,
            },
        );
        self.by_source.entry(source).or_default().push(msg_id);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn verify(&mut self) {
        let all: Vec<M> = self.messages.keys().copied().collect();
        if self.verify_batch(&all) {
            return;
        }

        let single_source = self.by_source.len() == 1;
        let mut bad_sources = HashSet::new();
        let mut bad_messages = HashSet::new();
        for (source, ids) in &self.by_source {
            // nothing new to learn from re-checking the only source
            let valid = !single_source && self.verify_batch(ids);
            if valid {
                continue;
            }

            bad_sources.insert(*source);
            if self.per_message_fallback {
                bad_messages.extend(ids.iter().copied().filter(|id| {
                    self.messages
                        .get(id)
                        .is_some_and(|msg| !msg.sig.verify_insecure(&msg.pub_key, &msg.msg_hash))
                }));
            }
        }

        self.bad_sources.extend(bad_sources);
        self.bad_messages.extend(bad_messages);
    }

    /// Messages over the same hash are checked against the sum of their keys.
    fn verify_batch(&self, ids: &[M]) -> bool {
        let mut by_hash: BTreeMap<H256, Vec<&PendingSig>> = BTreeMap::new();
        for id in ids {
            if let Some(msg) = self.messages.get(id) {
                by_hash.entry(msg.msg_hash).or_default().push(msg);
            }
        }
        if by_hash.is_empty() {
            return true;
        }

        let mut sigs = Vec::with_capacity(ids.len());
        let mut keys = Vec::with_capacity(by_hash.len());
        let mut hashes = Vec::with_capacity(by_hash.len());
        for (hash, msgs) in by_hash {
            let msg_keys: Vec<_> = msgs.iter().map(|msg| msg.pub_key).collect();
            if msg_keys.iter().any(|key| !key.is_valid()) {
                return false;
            }
            sigs.extend(msgs.iter().map(|msg| msg.sig));
            keys.push(BlsPublicKey::aggregate(&msg_keys));
            hashes.push(hash);
        }

        BlsSignature::aggregate_insecure(&sigs).verify_insecure_aggregated(&keys, &hashes)
    }
}
