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

//! Masternode list and spork collaborators.

use crate::{
    bls::{BlsPublicKey, BlsSecretKey},
    chain::BlockIndex,
};
use primitive_types::H256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasternodeEntry {
    pub pro_tx_hash: H256,
    pub pub_key_operator: BlsPublicKey,
}

/// Deterministic quorum selection from the masternode list.
#[auto_impl::auto_impl(&, Box, Arc)]
pub trait MasternodeListProvider: Send + Sync {
    /// Ordered members of the quorum based at `base_block`.
    fn quorum_members(&self, base_block: &BlockIndex) -> Vec<MasternodeEntry>;
}

/// Identity of the local masternode.
#[derive(Clone, Debug)]
pub struct ActiveMasternode {
    pub pro_tx_hash: H256,
    pub operator_key: BlsSecretKey,
}

impl ActiveMasternode {
    pub fn new(pro_tx_hash: H256, operator_key: BlsSecretKey) -> Self {
        Self {
            pro_tx_hash,
            operator_key,
        }
    }
}

#[auto_impl::auto_impl(&, Box, Arc)]
pub trait SporkProvider: Send + Sync {
    fn is_quorum_dkg_enabled(&self) -> bool;
}
