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
    BitSet, H256, build_commitment_hash,
    bls::{self, BlsSecretKey, VerificationVector},
    messages::{DkgMessage, PrematureCommitment},
    serialize_hash,
};
use rand::Rng;

impl DkgSession {
    pub fn verify_and_commit(&mut self) -> Result<(), DkgError> {
        if !self.are_we_member() {
            return Ok(());
        }
        let _span = self.span.clone().entered();

        let open_complaints: Vec<usize> = self
            .members
            .iter()
            .filter(|member| !member.bad && !member.complaints_from_others.is_empty())
            .map(|member| member.idx)
            .collect();
        for idx in &open_complaints {
            self.mark_bad_member(*idx);
        }

        let bad: Vec<usize> = self
            .members
            .iter()
            .filter(|member| member.bad)
            .map(|member| member.idx)
            .collect();
        tracing::debug!(?bad, ?open_complaints, "verification result");

        self.send_commitment()
    }

    pub fn send_commitment(&mut self) -> Result<(), DkgError> {
        let Some((_, active)) = self.my.clone() else {
            return Ok(());
        };
        let Some(base_block) = self.base_block else {
            return Ok(());
        };
        let _span = self.span.clone().entered();

        let mut valid_members = BitSet::new(self.params.size);
        for member in self.members.iter().filter(|member| !member.bad) {
            valid_members.set(member.idx, true);
        }
        if valid_members.count_ones() < self.params.min_size {
            tracing::debug!(
                count = valid_members.count_ones(),
                "not enough valid members, not sending commitment"
            );
            return Ok(());
        }

        if self.simulate(DkgErrorKind::CommitOmit) {
            return Ok(());
        }

        let Some(verified) = self
            .store
            .get_verified_contributions(&base_block, &valid_members)?
        else {
            tracing::debug!("failed to get verified contributions");
            return Ok(());
        };
        let Some(vvec) = verified.quorum_verification_vector() else {
            tracing::debug!("failed to build quorum verification vector");
            return Ok(());
        };
        let sk_share = bls::aggregate_secret_keys(&verified.sk_contributions);
        if !sk_share.is_valid() {
            tracing::debug!("failed to build own secret key share");
            return Ok(());
        }

        let mut message = PrematureCommitment {
            quorum_hash: self.quorum_hash(),
            pro_tx_hash: active.pro_tx_hash,
            valid_members,
            quorum_public_key: vvec[0],
            quorum_vvec_hash: serialize_hash(&vvec),
            ..Default::default()
        };

        let lie_type = self
            .simulate(DkgErrorKind::CommitLie)
            .then(|| self.rng.gen_range(0..5));
        if let Some(lie_type) = lie_type {
            tracing::debug!(lie_type, "lying on commitment");
        }
        match lie_type {
            Some(0) => message.quorum_public_key = BlsSecretKey::random(&mut self.rng).public_key(),
            Some(1) => bump(&mut message.quorum_vvec_hash),
            _ => {}
        }

        let mut commitment_hash = build_commitment_hash(
            &message.quorum_hash,
            &message.valid_members,
            &message.quorum_public_key,
            &message.quorum_vvec_hash,
        );
        if lie_type == Some(2) {
            bump(&mut commitment_hash);
        }

        let mut wrong_hash = commitment_hash;
        bump(&mut wrong_hash);
        let sig_hash = if lie_type == Some(3) { wrong_hash } else { commitment_hash };
        let quorum_sig_hash = if lie_type == Some(4) { wrong_hash } else { commitment_hash };
        message.sig = active.operator_key.sign(&sig_hash)?;
        message.quorum_sig = sk_share.sign(&quorum_sig_hash)?;

        tracing::debug!(
            valid_members = message.count_valid_members(),
            quorum_public_key = ?message.quorum_public_key,
            "built premature commitment"
        );
        self.queues.push_local(&message);
        Ok(())
    }

    pub fn pre_verify_premature_commitment(&self, message: &PrematureCommitment) -> Result<(), Rejected> {
        let member = self.sender(message)?;

        if message.valid_members.len() != self.params.size {
            return Err(Rejected::ban("invalid valid members bitset size"));
        }
        if message.count_valid_members() < self.params.min_size {
            return Err(Rejected::ban("too few valid members"));
        }
        if !message.sig.is_valid() {
            return Err(Rejected::ban("invalid member signature"));
        }
        if !message.quorum_sig.is_valid() {
            return Err(Rejected::ban("invalid quorum signature share"));
        }
        if message.valid_members.ones().any(|idx| idx >= self.members.len()) {
            return Err(Rejected::ban("valid member bit set past the member count"));
        }
        if member.premature_commitments.len() >= 2 {
            return Err(Rejected::drop("too many premature commitments from member"));
        }

        Ok(())
    }

    /// Stores the commitment and, when every contribution it names is known,
    /// checks it against them. Only commitments that pass, or that could not
    /// be checked, are relayed.
    pub fn receive_premature_commitment(
        &mut self,
        message: PrematureCommitment,
        hash: H256,
    ) -> Result<(), DkgError> {
        let Some(idx) = self.members_map.get(&message.pro_tx_hash).copied() else {
            return Ok(());
        };
        let Some(base_block) = self.base_block else {
            return Ok(());
        };
        let _span = self.span.clone().entered();

        self.members[idx].premature_commitments.insert(hash);
        self.premature_commitments.insert(hash, message.clone());

        let quorum_vvec: Option<VerificationVector> = self
            .store
            .get_verified_contributions(&base_block, &message.valid_members)?
            .and_then(|verified| verified.quorum_verification_vector());

        match quorum_vvec {
            None => {
                // we might just miss some contributions, others can verify it
                tracing::debug!(from = idx, "no quorum verification vector, skipping full verification");
            }
            Some(vvec) => {
                if message.quorum_public_key != vvec[0] {
                    tracing::debug!(from = idx, "quorum public key does not match");
                    return Ok(());
                }
                if message.quorum_vvec_hash != serialize_hash(&vvec) {
                    tracing::debug!(from = idx, "quorum verification vector hash does not match");
                    return Ok(());
                }
                let share = bls::public_key_share(&vvec, &self.members[idx].id);
                if !share.is_valid() {
                    tracing::debug!(from = idx, "failed to compute public key share");
                    return Ok(());
                }
                if !message.quorum_sig.verify_insecure(&share, &message.sign_hash()) {
                    tracing::debug!(from = idx, "invalid quorum signature share");
                    return Ok(());
                }
            }
        }

        self.valid_commitments.insert(hash);
        self.relay(PrematureCommitment::KIND, hash);
        tracing::debug!(
            from = idx,
            received = self.received_count(|member| &member.premature_commitments),
            total = self.members.len(),
            "received and relayed premature commitment"
        );
        Ok(())
    }
}

fn bump(hash: &mut H256) {
    hash.0[0] = hash.0[0].wrapping_add(1);
}

impl SessionMessage for PrematureCommitment {
    fn pre_verify(&self, session: &DkgSession) -> Result<(), Rejected> {
        session.pre_verify_premature_commitment(self)
    }

    fn receive(self, session: &mut DkgSession, hash: H256) -> Result<(), DkgError> {
        session.receive_premature_commitment(self, hash)
    }
}
