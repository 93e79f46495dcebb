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

use llmq_common::{ChainState, H256, LlmqParams, bls::BlsSignature, build_sign_hash, serialize_hash};
use llmq_quorums::{Quorum, QuorumProvider};
use std::sync::Arc;

/// Picks the quorum that signs `selection_hash`.
///
/// The pool is made of the `signing_active_quorum_count` most recent quorums
/// as of `sign_height - sign_offset`, where `sign_height` defaults to the
/// active height. The quorum whose `hash(quorum_hash, selection_hash)` is
/// the smallest wins, so every node with the same chain agrees on it.
pub fn select_quorum_for_signing(
    chain: &dyn ChainState,
    quorums: &dyn QuorumProvider,
    params: &LlmqParams,
    selection_hash: &H256,
    sign_height: Option<u32>,
    sign_offset: u32,
) -> Option<Arc<Quorum>> {
    let start = {
        let _chain = chain.lock().lock();
        let active_height = chain.active_height();
        let start_height = sign_height
            .unwrap_or(active_height)
            .checked_sub(sign_offset)
            .filter(|height| *height <= active_height)?;
        chain.block_at(start_height)?
    };

    quorums
        .scan_quorums(&start, params.signing_active_quorum_count)
        .into_iter()
        .min_by_key(|quorum| serialize_hash(&(quorum.quorum_hash(), selection_hash)))
}

/// Checks `sig` against the quorum selected for `id` at `sign_height`.
#[allow(clippy::too_many_arguments)]
pub fn verify_recovered_sig(
    chain: &dyn ChainState,
    quorums: &dyn QuorumProvider,
    params: &LlmqParams,
    sign_height: Option<u32>,
    id: &H256,
    msg_hash: &H256,
    sig: &BlsSignature,
    sign_offset: u32,
) -> bool {
    let Some(quorum) = select_quorum_for_signing(chain, quorums, params, id, sign_height, sign_offset) else {
        return false;
    };
    let sign_hash = build_sign_hash(&quorum.quorum_hash(), id, msg_hash);
    sig.verify_insecure(&quorum.public_key(), &sign_hash)
}

/// A quorum is active while it is among the `signing_active_quorum_count + 1`
/// most recent ones. The extra quorum covers the switch to a new quorum.
pub fn is_quorum_active(
    chain: &dyn ChainState,
    quorums: &dyn QuorumProvider,
    params: &LlmqParams,
    quorum_hash: &H256,
) -> bool {
    let tip = {
        let _chain = chain.lock().lock();
        chain.tip()
    };
    let Some(tip) = tip else {
        return false;
    };
    quorums
        .scan_quorums(&tip, params.signing_active_quorum_count + 1)
        .iter()
        .any(|quorum| quorum.quorum_hash() == *quorum_hash)
}
