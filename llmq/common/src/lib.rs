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

//! Common types of the LLMQ quorum core: hashes, BLS primitives, protocol
//! messages and the narrow interfaces of external collaborators.

pub mod batch;
pub mod bitset;
pub mod bls;
pub mod chain;
pub mod commitment;
pub mod hash;
pub mod ies;
pub mod masternode;
pub mod messages;
pub mod network;
pub mod params;
pub mod pipeline;
pub mod recsig;
pub mod time;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use bitset::BitSet;
pub use chain::{BlockIndex, CacheMutex, ChainState, ChainStateGuard, ChainStateLock};
pub use commitment::{CommitmentProvider, FinalCommitment, build_commitment_hash};
pub use hash::{hash, serialize_hash};
pub use masternode::{ActiveMasternode, MasternodeEntry, MasternodeListProvider, SporkProvider};
pub use network::{Inv, InvKind, NodeId, PeerManager};
pub use params::LlmqParams;
pub use primitive_types::H256;
pub use recsig::{RecoveredSig, build_sign_hash};
pub use time::{Clock, SystemClock};
