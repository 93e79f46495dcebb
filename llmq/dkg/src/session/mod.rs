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

//! State of one DKG round.
//!
//! Phase actions live in the submodules, one per phase. Incoming messages go
//! through [`SessionMessage::pre_verify`] (cheap structural checks), then the
//! caller verifies their operator signatures in a batch, then
//! [`SessionMessage::receive`] applies them.

mod commit;
mod complain;
mod contribute;
mod finalize;
mod justify;

#[cfg(test)]
mod tests;

use crate::{DkgConfig, DkgContributions, DkgError, DkgErrorKind, PendingQueues, SimulatedErrors};
use llmq_common::{
    ActiveMasternode, BlockIndex, H256, Inv, LlmqParams, MasternodeEntry, PeerManager,
    bls::{BlsId, BlsSecretKey, VerificationVector},
    messages::{Complaint, Contribution, DkgMessage, DkgMessageKind, Justification, PrematureCommitment},
};
use rand::{SeedableRng, rngs::StdRng};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
};
use thiserror::Error;

/// Verify pending contribution shares once this many are queued.
const MAX_PENDING_CONTRIBUTION_VERIFICATIONS: usize = 32;

/// Why a message failed pre-verification.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("{reason}")]
pub struct Rejected {
    pub reason: &'static str,
    /// The sending peer must be punished.
    pub ban: bool,
}

impl Rejected {
    pub(crate) fn ban(reason: &'static str) -> Self {
        Self { reason, ban: true }
    }

    pub(crate) fn drop(reason: &'static str) -> Self {
        Self { reason, ban: false }
    }
}

/// A phase message as seen by the session.
pub trait SessionMessage: DkgMessage {
    fn pre_verify(&self, session: &DkgSession) -> Result<(), Rejected>;

    /// Applies a message that passed pre-verification and signature checks.
    fn receive(self, session: &mut DkgSession, hash: H256) -> Result<(), DkgError>;
}

#[derive(Debug)]
pub struct DkgMember {
    pub entry: MasternodeEntry,
    pub idx: usize,
    pub id: BlsId,

    pub contributions: BTreeSet<H256>,
    pub complaints: BTreeSet<H256>,
    pub justifications: BTreeSet<H256>,
    pub premature_commitments: BTreeSet<H256>,

    /// Members whose complaint names this one as bad.
    pub bad_member_votes: HashSet<H256>,
    /// Members complaining about the share this one sent them.
    pub complaints_from_others: HashSet<H256>,

    pub bad: bool,
    pub bad_connection: bool,
    /// The share this member sent us did not verify.
    pub we_complain: bool,
    pub someone_complain: bool,
}

impl DkgMember {
    fn new(entry: MasternodeEntry, idx: usize) -> Self {
        let id = BlsId::from_hash(&entry.pro_tx_hash);
        Self {
            entry,
            idx,
            id,
            contributions: BTreeSet::new(),
            complaints: BTreeSet::new(),
            justifications: BTreeSet::new(),
            premature_commitments: BTreeSet::new(),
            bad_member_votes: HashSet::new(),
            complaints_from_others: HashSet::new(),
            bad: false,
            bad_connection: false,
            we_complain: false,
            someone_complain: false,
        }
    }

    pub fn pro_tx_hash(&self) -> H256 {
        self.entry.pro_tx_hash
    }
}

#[derive(derive_more::Debug)]
pub struct DkgSession {
    params: LlmqParams,
    config: DkgConfig,
    base_block: Option<BlockIndex>,
    members: Vec<DkgMember>,
    members_map: HashMap<H256, usize>,
    /// Index and keys of the local member, when we are one.
    my: Option<(usize, ActiveMasternode)>,

    vvec_contribution: VerificationVector,
    sk_contributions: Vec<BlsSecretKey>,
    received_vvecs: Vec<Option<VerificationVector>>,
    received_sk_contributions: Vec<BlsSecretKey>,
    pending_contribution_verifications: Vec<usize>,

    contributions: BTreeMap<H256, Contribution>,
    complaints: BTreeMap<H256, Complaint>,
    justifications: BTreeMap<H256, Justification>,
    premature_commitments: BTreeMap<H256, PrematureCommitment>,
    valid_commitments: HashSet<H256>,

    #[debug(skip)]
    store: Arc<DkgContributions>,
    #[debug(skip)]
    peers: Arc<dyn PeerManager>,
    #[debug(skip)]
    queues: Arc<PendingQueues>,
    errors: SimulatedErrors,
    #[debug(skip)]
    rng: StdRng,
    #[debug(skip)]
    span: tracing::Span,
}

impl DkgSession {
    pub fn new(
        params: LlmqParams,
        config: DkgConfig,
        store: Arc<DkgContributions>,
        peers: Arc<dyn PeerManager>,
        queues: Arc<PendingQueues>,
    ) -> Self {
        Self {
            params,
            config,
            base_block: None,
            members: Vec::new(),
            members_map: HashMap::new(),
            my: None,
            vvec_contribution: VerificationVector::new(),
            sk_contributions: Vec::new(),
            received_vvecs: Vec::new(),
            received_sk_contributions: Vec::new(),
            pending_contribution_verifications: Vec::new(),
            contributions: BTreeMap::new(),
            complaints: BTreeMap::new(),
            justifications: BTreeMap::new(),
            premature_commitments: BTreeMap::new(),
            valid_commitments: HashSet::new(),
            store,
            peers,
            queues,
            errors: SimulatedErrors::default(),
            rng: StdRng::from_entropy(),
            span: tracing::Span::none(),
        }
    }

    pub fn with_simulated_errors(mut self, errors: SimulatedErrors) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    /// Sets up the member list of the quorum based at `base_block`.
    ///
    /// `members` must be in quorum order. `active` is the local masternode,
    /// if any; we take part as a member only when it is in the list.
    pub fn init(
        &mut self,
        base_block: BlockIndex,
        members: Vec<MasternodeEntry>,
        active: Option<&ActiveMasternode>,
    ) -> Result<(), DkgError> {
        if members.len() < self.params.min_size {
            return Err(DkgError::NotEnoughMembers {
                count: members.len(),
                min: self.params.min_size,
            });
        }

        self.members = members
            .into_iter()
            .enumerate()
            .map(|(idx, entry)| DkgMember::new(entry, idx))
            .collect();
        self.members_map = self
            .members
            .iter()
            .map(|member| (member.pro_tx_hash(), member.idx))
            .collect();
        self.my = active.and_then(|active| {
            self.members_map
                .get(&active.pro_tx_hash)
                .map(|idx| (*idx, active.clone()))
        });

        let count = self.members.len();
        self.received_vvecs = vec![None; count];
        self.received_sk_contributions = vec![BlsSecretKey::default(); count];
        self.base_block = Some(base_block);

        self.span = tracing::debug_span!(
            "dkg",
            llmq = self.params.name,
            quorum = %base_block.hash,
            member = self.my.as_ref().map(|(idx, _)| *idx),
        );
        self.span.in_scope(|| {
            tracing::debug!(
                height = base_block.height,
                count,
                member = self.my.is_some(),
                "initialized DKG session"
            );
        });

        Ok(())
    }

    pub fn params(&self) -> &LlmqParams {
        &self.params
    }

    /// Hash of the quorum base block, zero before [`Self::init`].
    pub fn quorum_hash(&self) -> H256 {
        self.base_block
            .map(|block| block.hash)
            .unwrap_or_default()
    }

    pub fn base_block(&self) -> Option<BlockIndex> {
        self.base_block
    }

    pub fn members(&self) -> &[DkgMember] {
        &self.members
    }

    pub fn member(&self, pro_tx_hash: &H256) -> Option<&DkgMember> {
        self.members_map
            .get(pro_tx_hash)
            .map(|idx| &self.members[*idx])
    }

    pub fn are_we_member(&self) -> bool {
        self.my.is_some()
    }

    pub fn my_member_index(&self) -> Option<usize> {
        self.my.as_ref().map(|(idx, _)| *idx)
    }

    pub fn get_contribution(&self, hash: &H256) -> Option<&Contribution> {
        self.contributions.get(hash)
    }

    pub fn get_complaint(&self, hash: &H256) -> Option<&Complaint> {
        self.complaints.get(hash)
    }

    pub fn get_justification(&self, hash: &H256) -> Option<&Justification> {
        self.justifications.get(hash)
    }

    /// Only premature commitments that passed full verification are served.
    pub fn get_premature_commitment(&self, hash: &H256) -> Option<&PrematureCommitment> {
        self.valid_commitments
            .contains(hash)
            .then(|| self.premature_commitments.get(hash))
            .flatten()
    }

    pub fn mark_bad_member(&mut self, idx: usize) {
        let Some(member) = self.members.get_mut(idx) else {
            return;
        };
        if member.bad {
            return;
        }

        let _span = self.span.clone().entered();
        tracing::debug!(bad = %member.entry.pro_tx_hash, idx, "marking member as bad");
        member.bad = true;
    }

    /// Common part of every pre-verification: the message is for this
    /// quorum and comes from one of its members.
    fn sender<M: DkgMessage>(&self, message: &M) -> Result<&DkgMember, Rejected> {
        if message.quorum_hash() != self.quorum_hash() {
            return Err(Rejected::drop("message for a different quorum"));
        }
        self.member(&message.pro_tx_hash())
            .ok_or(Rejected::ban("sender is not a quorum member"))
    }

    fn relay(&self, kind: DkgMessageKind, hash: H256) {
        let members: Vec<_> = self.members.iter().map(DkgMember::pro_tx_hash).collect();
        self.peers
            .relay_inv_to_participants(Inv::new(kind.inv_kind(), hash), &members);
    }

    fn simulate(&mut self, kind: DkgErrorKind) -> bool {
        let simulate = self.errors.should_simulate(kind, &mut self.rng);
        if simulate {
            let _span = self.span.clone().entered();
            tracing::debug!(%kind, "simulating DKG error");
        }
        simulate
    }

    fn received_count(&self, messages: impl Fn(&DkgMember) -> &BTreeSet<H256>) -> usize {
        self.members
            .iter()
            .filter(|member| !messages(member).is_empty())
            .count()
    }
}
