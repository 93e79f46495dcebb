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

use super::{DkgSession, Rejected, SessionMessage};
use crate::{DkgError, DkgErrorKind};
use llmq_common::{
    H256,
    bls::{self, BlsSecretKey},
    messages::{DkgMessage, Justification, JustifiedShare},
};
use std::collections::{BTreeSet, HashSet};

impl DkgSession {
    /// Marks members with too many bad votes or conflicting complaints and
    /// answers every complaint about our own shares.
    pub fn verify_and_justify(&mut self) -> Result<(), DkgError> {
        let Some(my_idx) = self.my_member_index() else {
            return Ok(());
        };
        let _span = self.span.clone().entered();

        let mut justify_for = HashSet::new();
        for idx in 0..self.members.len() {
            let member = &self.members[idx];
            if member.bad {
                continue;
            }
            if member.bad_member_votes.len() >= self.params.dkg_bad_votes_threshold {
                tracing::debug!(idx, votes = member.bad_member_votes.len(), "member voted bad by others");
                self.mark_bad_member(idx);
                continue;
            }

            let complaint = match member.complaints.len() {
                0 => continue,
                1 => member
                    .complaints
                    .first()
                    .and_then(|hash| self.complaints.get(hash)),
                _ => {
                    tracing::debug!(idx, "member sent multiple complaints");
                    self.mark_bad_member(idx);
                    continue;
                }
            };
            if let Some(complaint) = complaint.filter(|c| c.complain_for_members.get(my_idx)) {
                justify_for.insert(complaint.pro_tx_hash);
            }
        }

        if justify_for.is_empty() {
            return Ok(());
        }
        self.send_justification(&justify_for)
    }

    pub fn send_justification(&mut self, for_members: &HashSet<H256>) -> Result<(), DkgError> {
        let Some((my_idx, active)) = self.my.clone() else {
            return Ok(());
        };

        let targets: Vec<usize> = self
            .members
            .iter()
            .filter(|member| for_members.contains(&member.entry.pro_tx_hash))
            .map(|member| member.idx)
            .collect();

        let mut contributions = Vec::with_capacity(targets.len());
        for idx in targets {
            let mut key = self.sk_contributions.get(idx).copied().unwrap_or_default();
            if idx != my_idx && self.simulate(DkgErrorKind::JustifyLie) {
                key = BlsSecretKey::random(&mut self.rng);
            }
            tracing::debug!(idx, "justifying for member");
            contributions.push(JustifiedShare {
                index: idx as u32,
                key,
            });
        }

        if self.simulate(DkgErrorKind::JustifyOmit) {
            return Ok(());
        }

        let mut message = Justification {
            quorum_hash: self.quorum_hash(),
            pro_tx_hash: active.pro_tx_hash,
            contributions,
            ..Default::default()
        };
        message.sig = active.operator_key.sign(&message.sign_hash())?;
        self.queues.push_local(&message);
        Ok(())
    }

    pub fn pre_verify_justification(&self, message: &Justification) -> Result<(), Rejected> {
        let member = self.sender(message)?;

        if message.contributions.is_empty() {
            return Err(Rejected::ban("empty justification"));
        }

        let mut indexes = BTreeSet::new();
        for share in &message.contributions {
            if share.index as usize >= self.members.len() {
                return Err(Rejected::ban("invalid justification index"));
            }
            if !indexes.insert(share.index) {
                return Err(Rejected::ban("duplicate justification index"));
            }
            if !share.key.is_valid() {
                return Err(Rejected::ban("invalid justified share"));
            }
        }

        if member.justifications.len() >= 2 {
            return Err(Rejected::drop("too many justifications from member"));
        }

        Ok(())
    }

    pub fn receive_justification(&mut self, message: Justification, hash: H256) -> Result<(), DkgError> {
        let Some(idx) = self.members_map.get(&message.pro_tx_hash).copied() else {
            return Ok(());
        };
        let _span = self.span.clone().entered();

        if self.members[idx].justifications.len() >= 2 {
            return Ok(());
        }
        self.members[idx].justifications.insert(hash);
        let shares = message.contributions.clone();
        self.justifications.insert(hash, message);
        self.relay(Justification::KIND, hash);

        if self.members[idx].justifications.len() > 1 {
            tracing::debug!(from = idx, "member sent multiple justifications");
            self.mark_bad_member(idx);
            return Ok(());
        }
        if self.members[idx].bad {
            tracing::debug!(from = idx, "justification from bad member");
            return Ok(());
        }

        // only complaints about the sender may be answered
        let unasked = shares.iter().any(|share| {
            self.members
                .get(share.index as usize)
                .is_none_or(|complainer| {
                    !self.members[idx]
                        .complaints_from_others
                        .contains(&complainer.pro_tx_hash())
                })
        });
        if unasked {
            tracing::debug!(from = idx, "justification without a complaint");
            self.mark_bad_member(idx);
            return Ok(());
        }

        let my_idx = self.my_member_index();
        let quorum_hash = self.quorum_hash();
        let sender = self.members[idx].pro_tx_hash();
        for share in shares {
            let target = share.index as usize;
            let Some(complainer_id) = self.members.get(target).map(|member| member.id) else {
                continue;
            };
            let valid = self.received_vvecs[idx]
                .as_ref()
                .is_some_and(|vvec| bls::verify_contribution_share(&complainer_id, vvec, &share.key));

            if !valid {
                tracing::debug!(from = idx, to = target, "invalid justification");
                self.mark_bad_member(idx);
                continue;
            }

            tracing::debug!(from = idx, to = target, "member justified");
            if my_idx == Some(target) {
                self.received_sk_contributions[idx] = share.key;
                self.members[idx].we_complain = false;
                self.store
                    .write_verified_sk_contribution(&quorum_hash, &sender, &share.key)?;
            }
            let complainer = self.members[target].pro_tx_hash();
            self.members[idx].complaints_from_others.remove(&complainer);
        }

        tracing::debug!(
            received = self.received_count(|member| &member.justifications),
            total = self.members.len(),
            "received and relayed justification"
        );
        Ok(())
    }
}

impl SessionMessage for Justification {
    fn pre_verify(&self, session: &DkgSession) -> Result<(), Rejected> {
        session.pre_verify_justification(self)
    }

    fn receive(self, session: &mut DkgSession, hash: H256) -> Result<(), DkgError> {
        session.receive_justification(self, hash)
    }
}
