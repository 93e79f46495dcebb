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

//! In-memory fakes of the external collaborators.

use crate::{
    bls::BlsSecretKey,
    chain::{BlockIndex, ChainState, ChainStateLock},
    commitment::{CommitmentProvider, FinalCommitment},
    hash::serialize_hash,
    masternode::{ActiveMasternode, MasternodeEntry, MasternodeListProvider, SporkProvider},
    network::{Inv, NodeId, PeerManager},
    time::Clock,
};
use parking_lot::{Mutex, RwLock};
use primitive_types::H256;
use rand::{SeedableRng, rngs::StdRng};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicI64, Ordering},
};

/// Hash of the active-chain block at `height`.
pub fn block_hash(height: u32) -> H256 {
    serialize_hash(&(b"block", height))
}

pub struct MockChain {
    lock: ChainStateLock,
    active: RwLock<Vec<BlockIndex>>,
    side: RwLock<HashMap<H256, BlockIndex>>,
}

impl MockChain {
    pub fn new(height: u32) -> Self {
        let chain = Self {
            lock: ChainStateLock::new(),
            active: RwLock::new(Vec::new()),
            side: RwLock::new(HashMap::new()),
        };
        chain.extend_to(height);
        chain
    }

    pub fn extend_to(&self, height: u32) {
        let mut active = self.active.write();
        for h in active.len() as u32..=height {
            active.push(BlockIndex {
                hash: block_hash(h),
                height: h,
                valid_scripts: true,
            });
        }
    }

    /// Known block that is not part of the active chain.
    pub fn add_side_block(&self, block: BlockIndex) {
        self.side.write().insert(block.hash, block);
    }

    pub fn set_valid(&self, height: u32, valid: bool) {
        if let Some(block) = self.active.write().get_mut(height as usize) {
            block.valid_scripts = valid;
        }
    }
}

impl ChainState for MockChain {
    fn lock(&self) -> &ChainStateLock {
        &self.lock
    }

    fn tip(&self) -> Option<BlockIndex> {
        self.active.read().last().copied()
    }

    fn block_at(&self, height: u32) -> Option<BlockIndex> {
        self.active.read().get(height as usize).copied()
    }

    fn lookup_block(&self, hash: &H256) -> Option<BlockIndex> {
        self.active
            .read()
            .iter()
            .find(|block| block.hash == *hash)
            .copied()
            .or_else(|| self.side.read().get(hash).copied())
    }

    fn ancestor(&self, block: &BlockIndex, height: u32) -> Option<BlockIndex> {
        if height > block.height || !self.contains(block) {
            return None;
        }
        self.block_at(height)
    }
}

/// Fixed set of masternodes; every quorum is made of all of them.
pub struct MockMasternodes {
    nodes: Vec<(MasternodeEntry, BlsSecretKey)>,
}

impl MockMasternodes {
    pub fn new(count: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let nodes = (0..count)
            .map(|idx| {
                let key = BlsSecretKey::random(&mut rng);
                let entry = MasternodeEntry {
                    pro_tx_hash: serialize_hash(&(b"protx", idx as u32)),
                    pub_key_operator: key.public_key(),
                };
                (entry, key)
            })
            .collect();
        Self { nodes }
    }

    pub fn entries(&self) -> Vec<MasternodeEntry> {
        self.nodes.iter().map(|(entry, _)| entry.clone()).collect()
    }

    pub fn active(&self, idx: usize) -> Option<ActiveMasternode> {
        self.nodes
            .get(idx)
            .map(|(entry, key)| ActiveMasternode::new(entry.pro_tx_hash, *key))
    }
}

impl MasternodeListProvider for MockMasternodes {
    fn quorum_members(&self, _base_block: &BlockIndex) -> Vec<MasternodeEntry> {
        self.entries()
    }
}

#[derive(Default)]
pub struct MockPeers {
    pub misbehaving: Mutex<Vec<(NodeId, u32, String)>>,
    pub known: Mutex<Vec<(NodeId, H256)>>,
    pub forgotten: Mutex<Vec<(NodeId, H256)>>,
    pub watchers: Mutex<Vec<NodeId>>,
    pub relayed: Mutex<Vec<Inv>>,
    pub connected: Mutex<HashMap<H256, u32>>,
}

impl MockPeers {
    pub fn connect_all(&self, members: &[MasternodeEntry], proto_version: u32) {
        let mut connected = self.connected.lock();
        for member in members {
            connected.insert(member.pro_tx_hash, proto_version);
        }
    }

    pub fn score_of(&self, peer: NodeId) -> u32 {
        self.misbehaving
            .lock()
            .iter()
            .filter(|(node, _, _)| *node == peer)
            .map(|(_, score, _)| score)
            .sum()
    }
}

impl PeerManager for MockPeers {
    fn misbehaving(&self, peer: NodeId, score: u32, reason: &str) {
        self.misbehaving.lock().push((peer, score, reason.to_string()));
    }

    fn add_known_tx(&self, peer: NodeId, hash: &H256) {
        self.known.lock().push((peer, *hash));
    }

    fn forget_tx_hash(&self, peer: NodeId, hash: &H256) {
        self.forgotten.lock().push((peer, *hash));
    }

    fn set_watcher(&self, peer: NodeId) {
        self.watchers.lock().push(peer);
    }

    fn relay_inv(&self, inv: Inv) {
        self.relayed.lock().push(inv);
    }

    fn relay_inv_to_participants(&self, inv: Inv, _members: &[H256]) {
        self.relayed.lock().push(inv);
    }

    fn connected_masternodes(&self) -> HashMap<H256, u32> {
        self.connected.lock().clone()
    }
}

#[derive(Default)]
pub struct MockCommitments {
    pub mined: RwLock<HashMap<H256, (FinalCommitment, H256)>>,
    pub mineable: Mutex<Vec<FinalCommitment>>,
}

impl MockCommitments {
    pub fn mine(&self, commitment: FinalCommitment, block_hash: H256) {
        self.mined
            .write()
            .insert(commitment.quorum_hash, (commitment, block_hash));
    }
}

impl CommitmentProvider for MockCommitments {
    fn mined_commitment(&self, quorum_hash: &H256) -> Option<(FinalCommitment, H256)> {
        self.mined.read().get(quorum_hash).cloned()
    }

    fn add_mineable_commitment(&self, commitment: FinalCommitment) {
        self.mineable.lock().push(commitment);
    }
}

pub struct MockSporks(pub AtomicBool);

impl Default for MockSporks {
    fn default() -> Self {
        Self(AtomicBool::new(true))
    }
}

impl SporkProvider for MockSporks {
    fn is_quorum_dkg_enabled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Manually driven clock, starting at an arbitrary fixed time.
pub struct MockClock(AtomicI64);

impl MockClock {
    pub fn new(now_secs: i64) -> Self {
        Self(AtomicI64::new(now_secs * 1000))
    }

    pub fn set(&self, now_secs: i64) {
        self.0.store(now_secs * 1000, Ordering::SeqCst);
    }

    pub fn advance_millis(&self, millis: i64) {
        self.0.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(1_700_000_000)
    }
}

impl Clock for MockClock {
    fn now_millis(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}
