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

use llmq_common::{
    BlockIndex, FinalCommitment, H256, MasternodeEntry, serialize_hash,
    bls::{BlsId, BlsPublicKey, BlsSecretKey, VerificationVector, public_key_share},
};
use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, sync::Arc};

#[derive(Debug, Default)]
struct Keys {
    vvec: Option<Arc<VerificationVector>>,
    sk_share: Option<BlsSecretKey>,
}

/// A quorum whose final commitment was mined.
///
/// The verification vector and the secret key share are only known when we
/// took part in the DKG or watched it.
#[derive(derive_more::Debug)]
pub struct Quorum {
    pub commitment: FinalCommitment,
    pub base_block: BlockIndex,
    pub mined_block_hash: H256,
    pub members: Vec<MasternodeEntry>,
    keys: RwLock<Keys>,
    #[debug(skip)]
    pub_key_shares: Mutex<HashMap<usize, BlsPublicKey>>,
}

impl Quorum {
    pub fn new(
        commitment: FinalCommitment,
        base_block: BlockIndex,
        mined_block_hash: H256,
        members: Vec<MasternodeEntry>,
    ) -> Self {
        Self {
            commitment,
            base_block,
            mined_block_hash,
            members,
            keys: RwLock::new(Keys::default()),
            pub_key_shares: Mutex::new(HashMap::new()),
        }
    }

    pub fn quorum_hash(&self) -> H256 {
        self.commitment.quorum_hash
    }

    pub fn public_key(&self) -> BlsPublicKey {
        self.commitment.quorum_public_key
    }

    /// Key of the stored contributions: the quorum hash and its member list.
    pub fn cache_key(&self) -> H256 {
        let members: Vec<_> = self.members.iter().map(|member| member.pro_tx_hash).collect();
        serialize_hash(&(self.commitment.quorum_hash, members))
    }

    pub fn member_index(&self, pro_tx_hash: &H256) -> Option<usize> {
        self.members
            .iter()
            .position(|member| member.pro_tx_hash == *pro_tx_hash)
    }

    pub fn is_member(&self, pro_tx_hash: &H256) -> bool {
        self.member_index(pro_tx_hash).is_some()
    }

    pub fn is_valid_member(&self, pro_tx_hash: &H256) -> bool {
        self.member_index(pro_tx_hash)
            .is_some_and(|idx| self.commitment.valid_members.get(idx))
    }

    pub fn has_verification_vector(&self) -> bool {
        self.keys.read().vvec.is_some()
    }

    pub fn verification_vector(&self) -> Option<Arc<VerificationVector>> {
        self.keys.read().vvec.clone()
    }

    pub(crate) fn set_verification_vector(&self, vvec: VerificationVector) {
        self.keys.write().vvec = Some(Arc::new(vvec));
        self.pub_key_shares.lock().clear();
    }

    /// Public key share of a valid member, derived from the verification
    /// vector and cached.
    pub fn pub_key_share(&self, idx: usize) -> Option<BlsPublicKey> {
        let vvec = self.verification_vector()?;
        let member = self.members.get(idx)?;
        if !self.commitment.valid_members.get(idx) {
            return None;
        }

        let mut shares = self.pub_key_shares.lock();
        let share = shares
            .entry(idx)
            .or_insert_with(|| public_key_share(&vvec, &BlsId::from_hash(&member.pro_tx_hash)));
        Some(*share)
    }

    pub fn sk_share(&self) -> Option<BlsSecretKey> {
        self.keys.read().sk_share
    }

    /// Accepts `sk_share` only when it matches the public key share of
    /// member `pro_tx_hash`.
    pub fn set_secret_key_share(&self, sk_share: BlsSecretKey, pro_tx_hash: &H256) -> bool {
        if !sk_share.is_valid() {
            return false;
        }
        let expected = self
            .member_index(pro_tx_hash)
            .and_then(|idx| self.pub_key_share(idx));
        if expected != Some(sk_share.public_key()) {
            return false;
        }

        self.keys.write().sk_share = Some(sk_share);
        true
    }

    pub(crate) fn restore_sk_share(&self, sk_share: BlsSecretKey) {
        self.keys.write().sk_share = Some(sk_share);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmq_common::{
        LlmqParams,
        bls::generate_contributions,
        test_utils::MockMasternodes,
    };
    use rand::{SeedableRng, rngs::StdRng};

    fn quorum() -> Quorum {
        let params = LlmqParams::llmq_test();
        let members = MockMasternodes::new(params.size, 3).entries();
        let mut commitment = FinalCommitment::new(H256::repeat_byte(1), &params);
        commitment.valid_members.set(0, true);
        commitment.valid_members.set(1, true);
        let base_block = BlockIndex {
            hash: H256::repeat_byte(1),
            height: 24,
            valid_scripts: true,
        };
        Quorum::new(commitment, base_block, H256::repeat_byte(2), members)
    }

    #[test]
    fn membership() {
        let quorum = quorum();
        let first = quorum.members[0].pro_tx_hash;
        let last = quorum.members[2].pro_tx_hash;

        assert_eq!(quorum.member_index(&last), Some(2));
        assert!(quorum.is_member(&last));
        assert!(!quorum.is_valid_member(&last));
        assert!(quorum.is_valid_member(&first));
        assert!(!quorum.is_member(&H256::zero()));
    }

    #[test]
    fn secret_key_share_must_match() {
        let quorum = quorum();
        let ids: Vec<_> = quorum
            .members
            .iter()
            .map(|member| BlsId::from_hash(&member.pro_tx_hash))
            .collect();
        let mut rng = StdRng::seed_from_u64(4);
        let (vvec, shares) = generate_contributions(2, &ids, &mut rng).unwrap();

        let me = quorum.members[0].pro_tx_hash;
        assert!(!quorum.set_secret_key_share(shares[0], &me));

        quorum.set_verification_vector(vvec);
        assert_eq!(quorum.pub_key_share(0), Some(shares[0].public_key()));
        assert_eq!(quorum.pub_key_share(2), None);
        assert!(!quorum.set_secret_key_share(shares[1], &me));
        assert!(quorum.set_secret_key_share(shares[0], &me));
        assert_eq!(quorum.sk_share(), Some(shares[0]));
    }

    #[test]
    fn cache_key_covers_members() {
        let full = quorum();
        let mut other = quorum();
        other.members.pop();
        assert_ne!(full.cache_key(), other.cache_key());
    }
}
