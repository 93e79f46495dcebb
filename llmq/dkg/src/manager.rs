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

use crate::{
    DkgConfig, DkgContext, DkgContributions, DkgError, DkgSessionHandler, QuorumPhase,
    VerifiedContributions,
};
use llmq_common::{
    ActiveMasternode, BitSet, BlockIndex, H256, Inv, InvKind, LlmqParams, NodeId,
    bls::{BlsSecretKey, VerificationVector},
    messages::{
        Complaint, Contribution, DkgMessageKind, Justification, PrematureCommitment, QWATCH,
    },
};
use llmq_db::DkgContributionsDb;
use std::sync::Arc;

/// Entry point of the DKG for the rest of the node.
///
/// Filters and routes network messages, serves phase messages to peers while
/// their phase is relevant, and owns the store of verified contributions.
#[derive(derive_more::Debug)]
pub struct DkgSessionManager {
    #[debug(skip)]
    context: DkgContext,
    config: DkgConfig,
    active: bool,
    contributions: Arc<DkgContributions>,
    handler: Arc<DkgSessionHandler>,
}

impl DkgSessionManager {
    pub fn new(
        params: LlmqParams,
        config: DkgConfig,
        active: Option<ActiveMasternode>,
        context: DkgContext,
        db: DkgContributionsDb,
    ) -> Self {
        let contributions = Arc::new(DkgContributions::new(
            db,
            context.masternodes.clone(),
            context.clock.clone(),
        ));
        let is_active = active.is_some();
        let handler = Arc::new(DkgSessionHandler::new(
            params,
            config,
            active,
            context.clone(),
            contributions.clone(),
        ));

        Self {
            context,
            config,
            active: is_active,
            contributions,
            handler,
        }
    }

    pub fn handler(&self) -> &Arc<DkgSessionHandler> {
        &self.handler
    }

    pub fn contributions(&self) -> &Arc<DkgContributions> {
        &self.contributions
    }

    fn is_enabled(&self) -> bool {
        self.context.sporks.is_quorum_dkg_enabled()
    }

    /// Starts the handler thread when this node is a masternode or watches
    /// quorums.
    pub fn start_threads(&self) -> Result<(), DkgError> {
        if !self.active && !self.config.watch_quorums {
            return Ok(());
        }
        self.handler.start_thread()
    }

    pub fn stop_threads(&self) {
        self.handler.stop_thread();
    }

    pub fn updated_block_tip(&self, block: &BlockIndex, initial_download: bool) {
        self.contributions.cleanup_cache();

        if initial_download || !self.is_enabled() {
            return;
        }
        self.handler.updated_block_tip(block);
    }

    pub fn process_message(&self, peer: NodeId, command: &str, payload: Vec<u8>) {
        if !self.is_enabled() {
            return;
        }

        let kind = DkgMessageKind::from_command(command);
        if kind.is_none() && command != QWATCH {
            return;
        }

        if command == QWATCH {
            if self.active {
                self.context.peers.set_watcher(peer);
            } else {
                self.context
                    .peers
                    .misbehaving(peer, 10, "quorum watch sent to a non-masternode");
            }
            return;
        }

        if !self.active && !self.config.watch_quorums {
            self.context
                .peers
                .misbehaving(peer, 10, "DKG message sent to a non-masternode");
            return;
        }

        if payload.is_empty() {
            self.context.peers.misbehaving(peer, 100, "empty DKG message");
            return;
        }

        if let Some(kind) = kind {
            self.handler.process_message(peer, kind, payload);
        }
    }

    pub fn already_have(&self, inv: &Inv) -> bool {
        if !self.is_enabled() {
            return false;
        }

        match inv.kind {
            InvKind::QuorumContribution
            | InvKind::QuorumComplaint
            | InvKind::QuorumJustification
            | InvKind::QuorumPrematureCommitment => self.handler.already_have(&inv.hash),
            InvKind::QuorumRecoveredSig => false,
        }
    }

    /// Runs `f` on the session when the handler is in one of `phases`.
    fn in_phases<R>(
        &self,
        phases: std::ops::RangeInclusive<QuorumPhase>,
        f: impl FnOnce(&crate::DkgSession) -> Option<R>,
    ) -> Option<R> {
        if !self.is_enabled() {
            return None;
        }
        let (phase, _) = self.handler.phase_and_quorum_hash();
        if !phases.contains(&phase) {
            return None;
        }
        self.handler.with_session(f).flatten()
    }

    pub fn get_contribution(&self, hash: &H256) -> Option<Contribution> {
        self.in_phases(QuorumPhase::Initialized..=QuorumPhase::Contribute, |session| {
            session.get_contribution(hash).cloned()
        })
    }

    pub fn get_complaint(&self, hash: &H256) -> Option<Complaint> {
        self.in_phases(QuorumPhase::Contribute..=QuorumPhase::Complain, |session| {
            session.get_complaint(hash).cloned()
        })
    }

    pub fn get_justification(&self, hash: &H256) -> Option<Justification> {
        self.in_phases(QuorumPhase::Complain..=QuorumPhase::Justify, |session| {
            session.get_justification(hash).cloned()
        })
    }

    pub fn get_premature_commitment(&self, hash: &H256) -> Option<PrematureCommitment> {
        self.in_phases(QuorumPhase::Justify..=QuorumPhase::Commit, |session| {
            session.get_premature_commitment(hash).cloned()
        })
    }

    pub fn write_verified_vvec_contribution(
        &self,
        quorum_hash: &H256,
        pro_tx_hash: &H256,
        vvec: &VerificationVector,
    ) -> Result<(), DkgError> {
        self.contributions
            .write_verified_vvec_contribution(quorum_hash, pro_tx_hash, vvec)
    }

    pub fn write_verified_sk_contribution(
        &self,
        quorum_hash: &H256,
        pro_tx_hash: &H256,
        sk_contribution: &BlsSecretKey,
    ) -> Result<(), DkgError> {
        self.contributions
            .write_verified_sk_contribution(quorum_hash, pro_tx_hash, sk_contribution)
    }

    pub fn get_verified_contributions(
        &self,
        base_block: &BlockIndex,
        valid_members: &BitSet,
    ) -> Result<Option<VerifiedContributions>, DkgError> {
        self.contributions
            .get_verified_contributions(base_block, valid_members)
    }

    pub fn cleanup_old_contributions(&self) -> Result<usize, DkgError> {
        self.contributions
            .cleanup_old_contributions(&*self.context.chain, self.handler.params())
    }

    /// Drops every stored contribution, used when rebuilding the databases.
    pub fn wipe_contributions(&self) -> Result<(), DkgError> {
        self.contributions.wipe()
    }
}
