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

//! DKG phase messages.
//!
//! Every message is keyed by `(quorum_hash, pro_tx_hash)` and signed by the
//! sender's operator key over its sign hash, which is the hash of the
//! message with a null signature.

use crate::{
    bitset::BitSet,
    bls::{BlsPublicKey, BlsSecretKey, BlsSignature, VerificationVector},
    commitment::build_commitment_hash,
    hash::serialize_hash,
    ies::EncryptedShares,
    network::InvKind,
};
use parity_scale_codec::{Decode, Encode};
use primitive_types::H256;

pub const QCONTRIB: &str = "qcontrib";
pub const QCOMPLAINT: &str = "qcomplaint";
pub const QJUSTIFICATION: &str = "qjustify";
pub const QPCOMMITMENT: &str = "qpcommit";
pub const QWATCH: &str = "qwatch";
pub const QSIGREC: &str = "qsigrec";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DkgMessageKind {
    Contribution,
    Complaint,
    Justification,
    PrematureCommitment,
}

impl DkgMessageKind {
    pub const ALL: [DkgMessageKind; 4] = [
        DkgMessageKind::Contribution,
        DkgMessageKind::Complaint,
        DkgMessageKind::Justification,
        DkgMessageKind::PrematureCommitment,
    ];

    pub fn command(self) -> &'static str {
        match self {
            Self::Contribution => QCONTRIB,
            Self::Complaint => QCOMPLAINT,
            Self::Justification => QJUSTIFICATION,
            Self::PrematureCommitment => QPCOMMITMENT,
        }
    }

    pub fn from_command(command: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.command() == command)
    }

    pub fn inv_kind(self) -> InvKind {
        match self {
            Self::Contribution => InvKind::QuorumContribution,
            Self::Complaint => InvKind::QuorumComplaint,
            Self::Justification => InvKind::QuorumJustification,
            Self::PrematureCommitment => InvKind::QuorumPrematureCommitment,
        }
    }
}

/// Shared surface of the four phase messages.
pub trait DkgMessage: Encode + Decode + Clone + Send + Sync + 'static {
    const KIND: DkgMessageKind;

    fn quorum_hash(&self) -> H256;

    fn pro_tx_hash(&self) -> H256;

    fn sig(&self) -> &BlsSignature;

    fn sign_hash(&self) -> H256;
}

/// Phase 1: verification vector plus one encrypted share per member.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct Contribution {
    pub quorum_hash: H256,
    pub pro_tx_hash: H256,
    pub vvec: VerificationVector,
    pub contributions: EncryptedShares,
    pub sig: BlsSignature,
}

impl DkgMessage for Contribution {
    const KIND: DkgMessageKind = DkgMessageKind::Contribution;

    fn quorum_hash(&self) -> H256 {
        self.quorum_hash
    }

    fn pro_tx_hash(&self) -> H256 {
        self.pro_tx_hash
    }

    fn sig(&self) -> &BlsSignature {
        &self.sig
    }

    fn sign_hash(&self) -> H256 {
        serialize_hash(&(
            &self.quorum_hash,
            &self.pro_tx_hash,
            &self.vvec,
            &self.contributions,
            &BlsSignature::default(),
        ))
    }
}

/// Phase 2: `bad_members` names members we consider bad, `complain_for_members`
/// names members whose share to us did not verify.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct Complaint {
    pub quorum_hash: H256,
    pub pro_tx_hash: H256,
    pub bad_members: BitSet,
    pub complain_for_members: BitSet,
    pub sig: BlsSignature,
}

impl Complaint {
    pub fn new(quorum_hash: H256, pro_tx_hash: H256, size: usize) -> Self {
        Self {
            quorum_hash,
            pro_tx_hash,
            bad_members: BitSet::new(size),
            complain_for_members: BitSet::new(size),
            sig: BlsSignature::default(),
        }
    }
}

impl DkgMessage for Complaint {
    const KIND: DkgMessageKind = DkgMessageKind::Complaint;

    fn quorum_hash(&self) -> H256 {
        self.quorum_hash
    }

    fn pro_tx_hash(&self) -> H256 {
        self.pro_tx_hash
    }

    fn sig(&self) -> &BlsSignature {
        &self.sig
    }

    fn sign_hash(&self) -> H256 {
        serialize_hash(&(
            &self.quorum_hash,
            &self.pro_tx_hash,
            &self.bad_members,
            &self.complain_for_members,
            &BlsSignature::default(),
        ))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub struct JustifiedShare {
    /// Index of the complaining member the share is for.
    pub index: u32,
    pub key: BlsSecretKey,
}

/// Phase 3: shares revealed in answer to complaints.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct Justification {
    pub quorum_hash: H256,
    pub pro_tx_hash: H256,
    pub contributions: Vec<JustifiedShare>,
    pub sig: BlsSignature,
}

impl DkgMessage for Justification {
    const KIND: DkgMessageKind = DkgMessageKind::Justification;

    fn quorum_hash(&self) -> H256 {
        self.quorum_hash
    }

    fn pro_tx_hash(&self) -> H256 {
        self.pro_tx_hash
    }

    fn sig(&self) -> &BlsSignature {
        &self.sig
    }

    fn sign_hash(&self) -> H256 {
        serialize_hash(&(
            &self.quorum_hash,
            &self.pro_tx_hash,
            &self.contributions,
            &BlsSignature::default(),
        ))
    }
}

/// Phase 4: a member's view of the final quorum.
///
/// `quorum_sig` is a threshold signature share, `sig` the member's operator
/// signature, both over the commitment hash.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct PrematureCommitment {
    pub quorum_hash: H256,
    pub pro_tx_hash: H256,
    pub valid_members: BitSet,
    pub quorum_public_key: BlsPublicKey,
    pub quorum_vvec_hash: H256,
    pub quorum_sig: BlsSignature,
    pub sig: BlsSignature,
}

impl PrematureCommitment {
    pub fn count_valid_members(&self) -> usize {
        self.valid_members.count_ones()
    }
}

impl DkgMessage for PrematureCommitment {
    const KIND: DkgMessageKind = DkgMessageKind::PrematureCommitment;

    fn quorum_hash(&self) -> H256 {
        self.quorum_hash
    }

    fn pro_tx_hash(&self) -> H256 {
        self.pro_tx_hash
    }

    fn sig(&self) -> &BlsSignature {
        &self.sig
    }

    fn sign_hash(&self) -> H256 {
        build_commitment_hash(
            &self.quorum_hash,
            &self.valid_members,
            &self.quorum_public_key,
            &self.quorum_vvec_hash,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bls::BlsSecretKey;
    use rand::{SeedableRng, rngs::StdRng};

    #[test]
    fn sign_hash_ignores_signature() {
        let mut rng = StdRng::seed_from_u64(21);
        let sk = BlsSecretKey::random(&mut rng);

        let mut complaint = Complaint::new(H256::repeat_byte(1), H256::repeat_byte(2), 3);
        complaint.bad_members.set(1, true);
        let unsigned = complaint.sign_hash();

        complaint.sig = sk.sign(&unsigned).expect("sign");
        assert_eq!(complaint.sign_hash(), unsigned);

        let mut nulled = complaint.clone();
        nulled.sig = BlsSignature::default();
        assert_eq!(serialize_hash(&nulled), unsigned);
    }

    #[test]
    fn commands_map_to_kinds() {
        for kind in DkgMessageKind::ALL {
            assert_eq!(DkgMessageKind::from_command(kind.command()), Some(kind));
        }
        assert_eq!(DkgMessageKind::from_command(QWATCH), None);
        assert_eq!(DkgMessageKind::from_command(QSIGREC), None);
    }

    #[test]
    fn justification_decodes_back() {
        let mut rng = StdRng::seed_from_u64(22);
        let justification = Justification {
            quorum_hash: H256::repeat_byte(3),
            pro_tx_hash: H256::repeat_byte(4),
            contributions: vec![JustifiedShare {
                index: 2,
                key: BlsSecretKey::random(&mut rng),
            }],
            sig: BlsSignature::default(),
        };

        let decoded = Justification::decode(&mut &justification.encode()[..]).expect("decode");
        assert_eq!(decoded, justification);
    }
}
