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

use super::{DkgSession, MAX_PENDING_CONTRIBUTION_VERIFICATIONS, Rejected, SessionMessage};
use crate::{DkgError, DkgErrorKind};
use llmq_common::{
    H256,
    bls::{self, BlsId, BlsPublicKey, BlsSecretKey, VerificationVector},
    ies::EncryptedShares,
    messages::{Contribution, DkgMessage},
};

impl DkgSession {
    /// Generates our secret polynomial and sends the shares to every member.
    pub fn contribute(&mut self) -> Result<(), DkgError> {
        if !self.are_we_member() {
            return Ok(());
        }

        let _span = self.span.clone().entered();
        let ids: Vec<BlsId> = self.members.iter().map(|member| member.id).collect();
        let (vvec, shares) =
            bls::generate_contributions(self.params.threshold, &ids, &mut self.rng)?;
        self.vvec_contribution = vvec;
        self.sk_contributions = shares;

        self.send_contributions()
    }

    pub fn send_contributions(&mut self) -> Result<(), DkgError> {
        let Some((my_idx, active)) = self.my.clone() else {
            return Ok(());
        };

        let _span = self.span.clone().entered();
        if self.simulate(DkgErrorKind::ContributionOmit) {
            return Ok(());
        }

        let mut shares = self.sk_contributions.clone();
        for (idx, share) in shares.iter_mut().enumerate() {
            if idx != my_idx && self.simulate(DkgErrorKind::ContributionLie) {
                *share = BlsSecretKey::random(&mut self.rng);
            }
        }

        let recipients: Vec<BlsPublicKey> = self
            .members
            .iter()
            .map(|member| member.entry.pub_key_operator)
            .collect();
        let contributions = EncryptedShares::encrypt(&recipients, &shares, &mut self.rng)?;

        let mut message = Contribution {
            quorum_hash: self.quorum_hash(),
            pro_tx_hash: active.pro_tx_hash,
            vvec: self.vvec_contribution.clone(),
            contributions,
            ..Default::default()
        };
        message.sig = active.operator_key.sign(&message.sign_hash())?;

        tracing::debug!("sending contributions");
        self.queues.push_local(&message);
        Ok(())
    }

    pub fn pre_verify_contribution(&self, message: &Contribution) -> Result<(), Rejected> {
        let member = self.sender(message)?;

        if message.contributions.len() != self.members.len() {
            return Err(Rejected::ban("invalid contributions count"));
        }
        if message.vvec.len() != self.params.threshold {
            return Err(Rejected::ban("invalid verification vector length"));
        }
        if !bls::verify_verification_vector(&message.vvec) {
            return Err(Rejected::ban("invalid verification vector"));
        }
        if member.contributions.len() >= 2 {
            return Err(Rejected::drop("too many contributions from member"));
        }

        Ok(())
    }

    pub fn receive_contribution(&mut self, message: Contribution, hash: H256) -> Result<(), DkgError> {
        let Some(idx) = self.members_map.get(&message.pro_tx_hash).copied() else {
            return Ok(());
        };
        let _span = self.span.clone().entered();

        // two are enough to let everyone know about the conflict
        if self.members[idx].contributions.len() >= 2 {
            return Ok(());
        }
        self.members[idx].contributions.insert(hash);
        let vvec = message.vvec.clone();
        let encrypted = message.contributions.clone();
        self.contributions.insert(hash, message);
        self.relay(Contribution::KIND, hash);

        // no expensive work for a member that already sent another one
        if self.members[idx].contributions.len() > 1 {
            tracing::debug!(from = idx, "member sent multiple contributions");
            self.mark_bad_member(idx);
            return Ok(());
        }

        let pro_tx_hash = self.members[idx].pro_tx_hash();
        self.store
            .write_verified_vvec_contribution(&self.quorum_hash(), &pro_tx_hash, &vvec)?;
        self.received_vvecs[idx] = Some(vvec);
        tracing::debug!(
            from = idx,
            received = self.received_count(|member| &member.contributions),
            total = self.members.len(),
            "received and relayed contribution"
        );

        let Some((my_idx, active)) = self.my.clone() else {
            return Ok(());
        };

        let share = match encrypted.decrypt(my_idx, &active.operator_key) {
            Ok(share) if idx == my_idx || !self.simulate(DkgErrorKind::ComplainLie) => share,
            Ok(_) => {
                self.members[idx].we_complain = true;
                return Ok(());
            }
            Err(err) => {
                tracing::debug!(from = idx, %err, "contribution could not be decrypted");
                self.members[idx].we_complain = true;
                return Ok(());
            }
        };

        self.received_sk_contributions[idx] = share;
        self.pending_contribution_verifications.push(idx);
        if self.pending_contribution_verifications.len() >= MAX_PENDING_CONTRIBUTION_VERIFICATIONS {
            self.verify_pending_contributions()?;
        }

        Ok(())
    }

    /// Checks the decrypted shares against the senders' verification vectors.
    pub fn verify_pending_contributions(&mut self) -> Result<(), DkgError> {
        let Some(my_idx) = self.my_member_index() else {
            self.pending_contribution_verifications.clear();
            return Ok(());
        };
        let my_id = self.members[my_idx].id;
        let quorum_hash = self.quorum_hash();

        let pending = std::mem::take(&mut self.pending_contribution_verifications);
        let mut checked = Vec::with_capacity(pending.len());
        for idx in pending {
            let member = &self.members[idx];
            if member.bad || member.we_complain {
                continue;
            }
            if let Some(vvec) = &self.received_vvecs[idx] {
                checked.push((idx, vvec, self.received_sk_contributions[idx]));
            }
        }

        let results = verify_contribution_shares(&my_id, &checked);
        let outcome: Vec<(usize, BlsSecretKey, bool)> = checked
            .iter()
            .zip(results)
            .map(|((idx, _, share), valid)| (*idx, *share, valid))
            .collect();

        for (idx, share, valid) in outcome {
            if !valid {
                tracing::debug!(from = idx, "invalid contribution share");
                self.members[idx].we_complain = true;
                continue;
            }
            let pro_tx_hash = self.members[idx].pro_tx_hash();
            self.store
                .write_verified_sk_contribution(&quorum_hash, &pro_tx_hash, &share)?;
        }

        Ok(())
    }
}

/// Checks all shares with one comparison of aggregated keys first, then one
/// by one when the aggregate does not match.
fn verify_contribution_shares(
    id: &BlsId,
    items: &[(usize, &VerificationVector, BlsSecretKey)],
) -> Vec<bool> {
    if items.is_empty() {
        return Vec::new();
    }

    let expected: Vec<BlsPublicKey> = items
        .iter()
        .map(|(_, vvec, _)| bls::public_key_share(vvec, id))
        .collect();
    let shares: Vec<BlsSecretKey> = items.iter().map(|(_, _, share)| *share).collect();
    if shares.iter().all(BlsSecretKey::is_valid)
        && BlsPublicKey::aggregate(&expected) == bls::aggregate_secret_keys(&shares).public_key()
    {
        return vec![true; items.len()];
    }

    items
        .iter()
        .map(|(_, vvec, share)| bls::verify_contribution_share(id, vvec, share))
        .collect()
}

impl SessionMessage for Contribution {
    fn pre_verify(&self, session: &DkgSession) -> Result<(), Rejected> {
        session.pre_verify_contribution(self)
    }

    fn receive(self, session: &mut DkgSession, hash: H256) -> Result<(), DkgError> {
        session.receive_contribution(self, hash)
    }
}
