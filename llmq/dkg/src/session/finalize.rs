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

use super::DkgSession;
use llmq_common::{
    BitSet, FinalCommitment, MasternodeEntry,
    bls::{BlsId, BlsSignature},
    messages::PrematureCommitment,
};
use std::collections::BTreeMap;

impl DkgSession {
    /// Builds one final commitment per set of valid members that at least
    /// `min_size` members agreed on.
    pub fn finalize_commitments(&self) -> Vec<FinalCommitment> {
        if !self.are_we_member() {
            return Vec::new();
        }
        let _span = self.span.clone().entered();

        let mut groups: BTreeMap<&BitSet, Vec<&PrematureCommitment>> = BTreeMap::new();
        for (hash, commitment) in &self.premature_commitments {
            if !self.valid_commitments.contains(hash) {
                continue;
            }
            groups
                .entry(&commitment.valid_members)
                .or_default()
                .push(commitment);
        }

        let entries: Vec<MasternodeEntry> = self
            .members
            .iter()
            .map(|member| member.entry.clone())
            .collect();

        let mut result = Vec::new();
        for commitments in groups.into_values() {
            // signed by a minority
            if commitments.len() < self.params.min_size {
                continue;
            }
            if let Some(commitment) = self.build_final_commitment(&commitments, &entries) {
                tracing::info!(
                    valid_members = commitment.count_valid_members(),
                    signers = commitment.count_signers(),
                    quorum_public_key = ?commitment.quorum_public_key,
                    "final commitment"
                );
                result.push(commitment);
            }
        }

        result
    }

    fn build_final_commitment(
        &self,
        commitments: &[&PrematureCommitment],
        entries: &[MasternodeEntry],
    ) -> Option<FinalCommitment> {
        let first = commitments.first()?;

        let mut commitment = FinalCommitment::new(first.quorum_hash, &self.params);
        commitment.valid_members = first.valid_members.clone();
        commitment.quorum_public_key = first.quorum_public_key;
        commitment.quorum_vvec_hash = first.quorum_vvec_hash;

        let mut member_sigs = Vec::with_capacity(commitments.len());
        let mut member_keys = Vec::with_capacity(commitments.len());
        let mut signer_ids: Vec<BlsId> = Vec::with_capacity(commitments.len());
        let mut threshold_sigs = Vec::with_capacity(commitments.len());
        for premature in commitments {
            if premature.quorum_public_key != first.quorum_public_key
                || premature.quorum_vvec_hash != first.quorum_vvec_hash
            {
                tracing::debug!("quorum public key or vvec hash does not match, skipping");
                continue;
            }
            let Some(member) = self.member(&premature.pro_tx_hash) else {
                continue;
            };

            commitment.signers.set(member.idx, true);
            member_sigs.push(premature.sig);
            member_keys.push(member.entry.pub_key_operator);
            signer_ids.push(member.id);
            threshold_sigs.push(premature.quorum_sig);
        }

        commitment.members_sig = BlsSignature::aggregate_secure(&member_sigs, &member_keys)
            .inspect_err(|err| tracing::debug!(%err, "failed to aggregate member signatures"))
            .ok()?;
        commitment.quorum_sig = BlsSignature::recover(&threshold_sigs, &signer_ids)
            .inspect_err(|err| tracing::debug!(%err, "failed to recover quorum signature"))
            .ok()?;

        if !commitment.verify(&self.params, entries, true) {
            tracing::debug!("failed to verify final commitment");
            return None;
        }

        Some(commitment)
    }
}
