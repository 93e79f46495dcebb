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

//! Distributed key generation of LLMQ quorums.
//!
//! A [`DkgSession`] holds the state of one DKG round, a [`DkgSessionHandler`]
//! drives it through its phases from block tips, and the
//! [`DkgSessionManager`] routes network messages and owns the store of
//! verified contributions.

pub mod contributions;
mod error;
pub mod handler;
pub mod manager;
pub mod queues;
pub mod session;

use llmq_common::{
    ChainState, Clock, CommitmentProvider, MasternodeListProvider, PeerManager, SporkProvider,
};
use std::sync::Arc;

pub use contributions::{DkgContributions, VerifiedContributions};
pub use error::{DkgError, DkgErrorKind, SimulatedErrors};
pub use handler::{DkgSessionHandler, FinalCommitmentPolicy, QuorumPhase};
pub use manager::DkgSessionManager;
pub use queues::PendingQueues;
pub use session::{DkgMember, DkgSession, Rejected, SessionMessage};

/// Quorum members connected with an older protocol version are considered
/// to have a bad connection.
pub const MIN_MASTERNODE_PROTO_VERSION: u32 = 70_218;

/// External collaborators of the DKG.
#[derive(Clone)]
pub struct DkgContext {
    pub chain: Arc<dyn ChainState>,
    pub masternodes: Arc<dyn MasternodeListProvider>,
    pub peers: Arc<dyn PeerManager>,
    pub commitments: Arc<dyn CommitmentProvider>,
    pub sporks: Arc<dyn SporkProvider>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DkgConfig {
    /// Follow DKG rounds of quorums we are not a member of.
    pub watch_quorums: bool,
    /// Mark members we are not connected to as bad.
    pub all_members_connected: bool,
    pub final_commitment_policy: FinalCommitmentPolicy,
}
