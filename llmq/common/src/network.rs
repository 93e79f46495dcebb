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

//! Peer-to-peer collaborator: discipline and inventory relay.

use parity_scale_codec::{Decode, Encode};
use primitive_types::H256;
use std::collections::HashMap;

pub type NodeId = i64;

/// Source id used for messages the local node produced itself.
pub const LOCAL_NODE: NodeId = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Encode, Decode)]
pub enum InvKind {
    QuorumContribution,
    QuorumComplaint,
    QuorumJustification,
    QuorumPrematureCommitment,
    QuorumRecoveredSig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Encode, Decode)]
pub struct Inv {
    pub kind: InvKind,
    pub hash: H256,
}

impl Inv {
    pub fn new(kind: InvKind, hash: H256) -> Self {
        Self { kind, hash }
    }
}

#[auto_impl::auto_impl(&, Box, Arc)]
pub trait PeerManager: Send + Sync {
    /// Raises the misbehavior score of `peer`.
    fn misbehaving(&self, peer: NodeId, score: u32, reason: &str);

    /// Marks `hash` as known by `peer`, so it is not announced back.
    fn add_known_tx(&self, peer: NodeId, hash: &H256);

    /// Drops `hash` from the peer's requested set once processed.
    fn forget_tx_hash(&self, peer: NodeId, hash: &H256);

    /// Marks `peer` as a quorum watcher.
    fn set_watcher(&self, peer: NodeId);

    /// Announces `inv` to every peer.
    fn relay_inv(&self, inv: Inv);

    /// Announces `inv` to connected quorum members and watchers.
    fn relay_inv_to_participants(&self, inv: Inv, members: &[H256]);

    /// Connected masternodes by registration hash, with their protocol version.
    fn connected_masternodes(&self) -> HashMap<H256, u32>;
}
