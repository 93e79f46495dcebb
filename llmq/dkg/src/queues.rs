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

use llmq_common::{
    H256, LlmqParams,
    messages::{DkgMessage, DkgMessageKind},
    network::LOCAL_NODE,
    pipeline::PendingMessages,
};

/// Pending raw messages of the four DKG phases.
pub struct PendingQueues {
    contributions: PendingMessages,
    complaints: PendingMessages,
    justifications: PendingMessages,
    premature_commitments: PendingMessages,
}

impl PendingQueues {
    /// Every peer may queue up to two messages per member and phase.
    pub fn new(params: &LlmqParams) -> Self {
        let max_per_node = params.size * 2;
        Self {
            contributions: PendingMessages::new(max_per_node),
            complaints: PendingMessages::new(max_per_node),
            justifications: PendingMessages::new(max_per_node),
            premature_commitments: PendingMessages::new(max_per_node),
        }
    }

    pub fn get(&self, kind: DkgMessageKind) -> &PendingMessages {
        match kind {
            DkgMessageKind::Contribution => &self.contributions,
            DkgMessageKind::Complaint => &self.complaints,
            DkgMessageKind::Justification => &self.justifications,
            DkgMessageKind::PrematureCommitment => &self.premature_commitments,
        }
    }

    /// Queues a message the local member produced, it goes through the
    /// same checks as messages from peers.
    pub fn push_local<M: DkgMessage>(&self, message: &M) {
        self.get(M::KIND).push_message(LOCAL_NODE, message);
    }

    pub fn has_seen(&self, hash: &H256) -> bool {
        DkgMessageKind::ALL
            .into_iter()
            .any(|kind| self.get(kind).has_seen(hash))
    }

    pub fn clear(&self) {
        for kind in DkgMessageKind::ALL {
            self.get(kind).clear();
        }
    }
}
