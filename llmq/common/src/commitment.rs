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

//! Final quorum commitment, the aggregate of premature commitments that
//! gets mined on-chain.

use crate::{
    bitset::BitSet,
    bls::{BlsPublicKey, BlsSignature},
    hash::serialize_hash,
    masternode::MasternodeEntry,
    params::LlmqParams,
};
use parity_scale_codec::{Decode, Encode};
use primitive_types::H256;

/// Hash signed by both the member operator keys and the quorum threshold key.
pub fn build_commitment_hash(
    quorum_hash: &H256,
    valid_members: &BitSet,
    public_key: &BlsPublicKey,
    vvec_hash: &H256,
) -> H256 {
    serialize_hash(&(quorum_hash, valid_members, public_key, vvec_hash))
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct FinalCommitment {
    pub version: u16,
    pub quorum_hash: H256,
    pub signers: BitSet,
    pub valid_members: BitSet,
    pub quorum_public_key: BlsPublicKey,
    pub quorum_vvec_hash: H256,
    /// Recovered threshold signature over the commitment hash.
    pub quorum_sig: BlsSignature,
    /// Secure aggregate of the signers' operator signatures.
    pub members_sig: BlsSignature,
}

impl FinalCommitment {
    pub const LEGACY_VERSION: u16 = 1;
    pub const BASIC_VERSION: u16 = 3;
    pub const CURRENT_VERSION: u16 = Self::BASIC_VERSION;

    pub fn new(quorum_hash: H256, params: &LlmqParams) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            quorum_hash,
            signers: BitSet::new(params.size),
            valid_members: BitSet::new(params.size),
            ..Default::default()
        }
    }

    pub fn count_signers(&self) -> usize {
        self.signers.count_ones()
    }

    pub fn count_valid_members(&self) -> usize {
        self.valid_members.count_ones()
    }

    pub fn commitment_hash(&self) -> H256 {
        build_commitment_hash(
            &self.quorum_hash,
            &self.valid_members,
            &self.quorum_public_key,
            &self.quorum_vvec_hash,
        )
    }

    pub fn is_null(&self) -> bool {
        self.count_signers() == 0
            && self.count_valid_members() == 0
            && !self.quorum_public_key.is_valid()
            && self.quorum_vvec_hash.is_zero()
            && !self.members_sig.is_valid()
            && !self.quorum_sig.is_valid()
    }

    pub fn verify_sizes(&self, params: &LlmqParams) -> bool {
        if self.signers.len() != params.size {
            tracing::debug!(size = self.signers.len(), "invalid signers size");
            return false;
        }
        if self.valid_members.len() != params.size {
            tracing::debug!(size = self.valid_members.len(), "invalid valid members size");
            return false;
        }
        true
    }

    pub fn verify_null(&self, params: &LlmqParams) -> bool {
        self.is_null() && self.verify_sizes(params)
    }

    /// Checks the commitment against the quorum members selected at its base
    /// block. Signatures are only checked when `check_sigs` is set.
    pub fn verify(&self, params: &LlmqParams, members: &[MasternodeEntry], check_sigs: bool) -> bool {
        let quorum = self.quorum_hash;

        if self.version != Self::CURRENT_VERSION {
            tracing::debug!(%quorum, version = self.version, "invalid commitment version");
            return false;
        }
        if !self.verify_sizes(params) {
            return false;
        }
        if self.count_valid_members() < params.min_size {
            tracing::debug!(%quorum, count = self.count_valid_members(), "too few valid members");
            return false;
        }
        if self.count_signers() < params.min_size {
            tracing::debug!(%quorum, count = self.count_signers(), "too few signers");
            return false;
        }
        if !self.quorum_public_key.is_valid() || self.quorum_vvec_hash.is_zero() {
            tracing::debug!(%quorum, "invalid quorum public key or vvec hash");
            return false;
        }
        if !self.members_sig.is_valid() || !self.quorum_sig.is_valid() {
            tracing::debug!(%quorum, "invalid commitment signatures");
            return false;
        }

        for idx in members.len()..params.size {
            if self.valid_members.get(idx) || self.signers.get(idx) {
                tracing::debug!(%quorum, idx, "bit set past the member count");
                return false;
            }
        }

        if check_sigs {
            let hash = self.commitment_hash();
            let signer_keys: Vec<_> = self
                .signers
                .ones()
                .filter_map(|idx| members.get(idx))
                .map(|member| member.pub_key_operator)
                .collect();

            if !self.members_sig.verify_secure_aggregated(&signer_keys, &hash) {
                tracing::debug!(%quorum, "invalid aggregated members signature");
                return false;
            }
            if !self.quorum_sig.verify_insecure(&self.quorum_public_key, &hash) {
                tracing::debug!(%quorum, "invalid quorum signature");
                return false;
            }
        }

        true
    }
}

/// Block processor side of commitments: what got mined and where new ones go.
#[auto_impl::auto_impl(&, Box, Arc)]
pub trait CommitmentProvider: Send + Sync {
    /// The mined commitment for `quorum_hash` and the hash of the block mining it.
    fn mined_commitment(&self, quorum_hash: &H256) -> Option<(FinalCommitment, H256)>;

    fn has_mined_commitment(&self, quorum_hash: &H256) -> bool {
        self.mined_commitment(quorum_hash).is_some()
    }

    fn add_mineable_commitment(&self, commitment: FinalCommitment);
}
