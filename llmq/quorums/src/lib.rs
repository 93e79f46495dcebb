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

//! Quorums mined on-chain and the manager building them from commitments.

mod manager;
mod quorum;

use llmq_common::{BlockIndex, H256};
use llmq_db::KVDatabase;
use std::sync::Arc;

pub use manager::QuorumManager;
pub use quorum::Quorum;

/// Quorums kept in memory, and the default bound of the contribution caches.
pub const QUORUM_CACHE_SIZE: usize = 10;

/// Backing stores of the quorum verification vector and secret key share
/// caches.
pub struct QuorumStores {
    pub vvecs: Box<dyn KVDatabase>,
    pub sk_shares: Box<dyn KVDatabase>,
    /// Entries each cache keeps in memory before flushing.
    pub cache_size: usize,
}

impl QuorumStores {
    pub fn new(vvecs: Box<dyn KVDatabase>, sk_shares: Box<dyn KVDatabase>) -> Self {
        Self {
            vvecs,
            sk_shares,
            cache_size: QUORUM_CACHE_SIZE,
        }
    }
}

/// Read access to mined quorums.
#[auto_impl::auto_impl(&, Box, Arc)]
pub trait QuorumProvider: Send + Sync {
    /// Quorum based at block `quorum_hash`, if its commitment was mined.
    fn get_quorum(&self, quorum_hash: &H256) -> Option<Arc<Quorum>>;

    /// Up to `count` most recent quorums as of `start`, newest first.
    fn scan_quorums(&self, start: &BlockIndex, count: usize) -> Vec<Arc<Quorum>>;
}
