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

/// Consensus constants of a long-living masternode quorum type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LlmqParams {
    pub name: &'static str,
    /// Number of members selected into a quorum.
    pub size: usize,
    /// Minimum number of valid members for a DKG to succeed.
    pub min_size: usize,
    /// Signature shares needed to recover a quorum signature.
    pub threshold: usize,
    /// Blocks between two DKG rounds.
    pub dkg_interval: u32,
    /// Blocks per DKG phase.
    pub dkg_phase_blocks: u32,
    pub dkg_mining_window_start: u32,
    pub dkg_mining_window_end: u32,
    /// Complaint votes that mark a member bad.
    pub dkg_bad_votes_threshold: usize,
    pub signing_active_quorum_count: usize,
    pub keep_old_connections: usize,
    pub recovery_members: usize,
}

impl LlmqParams {
    /// Small quorums for tests and regtest networks.
    pub const fn llmq_test() -> Self {
        Self {
            name: "llmq_test",
            size: 3,
            min_size: 2,
            threshold: 2,
            dkg_interval: 24,
            dkg_phase_blocks: 2,
            dkg_mining_window_start: 10,
            dkg_mining_window_end: 18,
            dkg_bad_votes_threshold: 2,
            signing_active_quorum_count: 4,
            keep_old_connections: 5,
            recovery_members: 3,
        }
    }

    pub const fn llmq_400_60() -> Self {
        Self {
            name: "llmq_400_60",
            size: 400,
            min_size: 300,
            threshold: 240,
            dkg_interval: 24 * 12,
            dkg_phase_blocks: 4,
            dkg_mining_window_start: 20,
            dkg_mining_window_end: 28,
            dkg_bad_votes_threshold: 300,
            signing_active_quorum_count: 4,
            keep_old_connections: 5,
            recovery_members: 100,
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        [Self::llmq_test(), Self::llmq_400_60()]
            .into_iter()
            .find(|params| params.name == name)
    }

    /// Depth in blocks for which verified contributions are kept.
    pub fn max_store_depth(&self) -> u32 {
        self.signing_active_quorum_count as u32 * self.dkg_interval
    }
}
