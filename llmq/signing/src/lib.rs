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

//! Recovered threshold signatures.
//!
//! [`SigningManager`] accepts recovered signatures from peers and from other
//! local subsystems, verifies them in batches against the quorum public key,
//! stores them and notifies listeners. It also starts local signing sessions
//! through a [`SigSharesBroadcaster`].

mod manager;
mod selection;

use llmq_common::{H256, RecoveredSig};
use llmq_db::DbError;
use llmq_quorums::Quorum;
use std::sync::Arc;
use thiserror::Error;

pub use manager::SigningManager;
pub use selection::{is_quorum_active, select_quorum_for_signing, verify_recovered_sig};

/// Default age after which recovered signatures and votes are dropped, one
/// week in seconds.
pub const DEFAULT_MAX_RECOVERED_SIGS_AGE: i64 = 60 * 60 * 24 * 7;

/// Recovered signatures are only accepted for blocks at multiples of this
/// height.
pub const SIGN_HEIGHT_LOOKBACK: u32 = 5;

/// Quorums are selected this many blocks below the signing height.
pub const SIGN_HEIGHT_OFFSET: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SigningConfig {
    /// Seconds.
    pub max_recovered_sigs_age: i64,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            max_recovered_sigs_age: DEFAULT_MAX_RECOVERED_SIGS_AGE,
        }
    }
}

#[derive(Debug, Error)]
pub enum SigningError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("failed to spawn signing worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Why a recovered signature was dropped before verification.
///
/// Neither case is punished, a stale quorum is not a sign of malice.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    #[error("quorum {0} not found")]
    UnknownQuorum(H256),
    #[error("quorum {0} is not active")]
    InactiveQuorum(H256),
}

/// Consumer of newly accepted recovered signatures, e.g. chain locks.
#[auto_impl::auto_impl(&, Box, Arc)]
pub trait RecoveredSigsListener: Send + Sync {
    fn handle_new_recovered_sig(&self, rec_sig: &RecoveredSig);
}

/// Signs shares and gossips them to the quorum. Recovering the signature
/// out of the shares happens there too.
#[auto_impl::auto_impl(&, Box, Arc)]
pub trait SigSharesBroadcaster: Send + Sync {
    fn async_sign(&self, quorum: &Arc<Quorum>, id: &H256, msg_hash: &H256);

    /// Re-announces every known share of the session.
    fn force_re_announcement(&self, quorum: &Arc<Quorum>, id: &H256, msg_hash: &H256);
}
