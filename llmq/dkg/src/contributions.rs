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

//! Durable store of verified DKG contributions and the short-lived cache in
//! front of it.

use crate::DkgError;
use llmq_common::{
    BitSet, BlockIndex, CacheMutex, ChainState, Clock, H256, LlmqParams, MasternodeListProvider,
    bls::{self, BlsPublicKey, BlsSecretKey, VerificationVector},
};
use llmq_db::DkgContributionsDb;
use std::{collections::HashMap, sync::Arc};

/// Cache entries older than this are dropped by [`DkgContributions::cleanup_cache`].
pub const MAX_CONTRIBUTION_CACHE_TIME_MS: i64 = 60_000;

struct CacheEntry {
    entry_time: i64,
    vvec: Arc<VerificationVector>,
    sk_contribution: BlsSecretKey,
}

/// Contributions of the valid members of a quorum, in member order.
#[derive(Clone, Debug, Default)]
pub struct VerifiedContributions {
    pub member_indexes: Vec<usize>,
    pub vvecs: Vec<Arc<VerificationVector>>,
    /// Null where no secret key share for the local member is known.
    pub sk_contributions: Vec<BlsSecretKey>,
}

impl VerifiedContributions {
    /// Element-wise sum of the members' verification vectors.
    pub fn quorum_verification_vector(&self) -> Option<VerificationVector> {
        let vvecs: Vec<&[BlsPublicKey]> = self.vvecs.iter().map(|vvec| vvec.as_slice()).collect();
        bls::build_quorum_verification_vector(&vvecs)
    }
}

#[derive(derive_more::Debug)]
#[debug("DkgContributions")]
pub struct DkgContributions {
    db: DkgContributionsDb,
    masternodes: Arc<dyn MasternodeListProvider>,
    clock: Arc<dyn Clock>,
    cache: CacheMutex<HashMap<(H256, H256), CacheEntry>>,
}

impl DkgContributions {
    pub fn new(
        db: DkgContributionsDb,
        masternodes: Arc<dyn MasternodeListProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            masternodes,
            clock,
            cache: CacheMutex::new(HashMap::new()),
        }
    }

    pub fn write_verified_vvec_contribution(
        &self,
        quorum_hash: &H256,
        pro_tx_hash: &H256,
        vvec: &VerificationVector,
    ) -> Result<(), DkgError> {
        self.db.write_vvec(quorum_hash, pro_tx_hash, vvec)?;
        Ok(())
    }

    pub fn write_verified_sk_contribution(
        &self,
        quorum_hash: &H256,
        pro_tx_hash: &H256,
        sk_contribution: &BlsSecretKey,
    ) -> Result<(), DkgError> {
        self.db
            .write_sk_contribution(quorum_hash, pro_tx_hash, sk_contribution)?;
        Ok(())
    }

    /// Collects the contributions of every member flagged in `valid_members`.
    ///
    /// Returns `None` when the verification vector of any of them is unknown.
    /// A missing secret key share is not an error, observers never have one.
    pub fn get_verified_contributions(
        &self,
        base_block: &BlockIndex,
        valid_members: &BitSet,
    ) -> Result<Option<VerifiedContributions>, DkgError> {
        let members = self.masternodes.quorum_members(base_block);
        let quorum_hash = base_block.hash;
        let now = self.clock.now_millis();

        let mut result = VerifiedContributions::default();
        let mut cache = self.cache.lock();
        for (idx, member) in members.iter().enumerate() {
            if !valid_members.get(idx) {
                continue;
            }

            let key = (quorum_hash, member.pro_tx_hash);
            if !cache.contains_key(&key) {
                let Some(vvec) = self.db.read_vvec(&quorum_hash, &member.pro_tx_hash)? else {
                    return Ok(None);
                };
                let sk_contribution = self
                    .db
                    .read_sk_contribution(&quorum_hash, &member.pro_tx_hash)?
                    .unwrap_or_default();

                cache.insert(
                    key,
                    CacheEntry {
                        entry_time: now,
                        vvec: Arc::new(vvec),
                        sk_contribution,
                    },
                );
            }

            if let Some(entry) = cache.get(&key) {
                result.member_indexes.push(idx);
                result.vvecs.push(entry.vvec.clone());
                result.sk_contributions.push(entry.sk_contribution);
            }
        }

        Ok(Some(result))
    }

    /// Drops cache entries older than [`MAX_CONTRIBUTION_CACHE_TIME_MS`].
    pub fn cleanup_cache(&self) {
        let now = self.clock.now_millis();
        self.cache
            .lock()
            .retain(|_, entry| now - entry.entry_time <= MAX_CONTRIBUTION_CACHE_TIME_MS);
    }

    /// Erases contributions of quorums that are unknown or deeper than
    /// [`LlmqParams::max_store_depth`] below the active tip.
    pub fn cleanup_old_contributions(
        &self,
        chain: &dyn ChainState,
        params: &LlmqParams,
    ) -> Result<usize, DkgError> {
        if self.db.is_empty() {
            return Ok(0);
        }

        let _chain_guard = chain.lock().lock();
        let active_height = chain.active_height();
        let max_depth = params.max_store_depth();

        let removed = self.db.erase_where(|quorum_hash| {
            chain
                .lookup_block(quorum_hash)
                .is_none_or(|block| active_height.saturating_sub(block.height) > max_depth)
        })?;

        tracing::debug!(llmq = params.name, removed, "cleaned old contributions");
        Ok(removed)
    }

    pub(crate) fn wipe(&self) -> Result<(), DkgError> {
        self.cache.lock().clear();
        self.db.wipe()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmq_common::{
        bls::BlsId,
        test_utils::{MockChain, MockClock, MockMasternodes},
    };
    use llmq_db::{KVDatabase, MemDb};
    use rand::{SeedableRng, rngs::StdRng};

    struct Setup {
        contributions: DkgContributions,
        chain: MockChain,
        clock: Arc<MockClock>,
        members: Vec<H256>,
        vvec: VerificationVector,
        share: BlsSecretKey,
    }

    fn setup() -> Setup {
        let mut rng = StdRng::seed_from_u64(3);
        let masternodes = Arc::new(MockMasternodes::new(3, 3));
        let members: Vec<_> = masternodes
            .entries()
            .into_iter()
            .map(|entry| entry.pro_tx_hash)
            .collect();
        let ids: Vec<_> = members.iter().map(BlsId::from_hash).collect();
        let (vvec, shares) = bls::generate_contributions(2, &ids, &mut rng).unwrap();

        let clock = Arc::new(MockClock::default());
        let contributions = DkgContributions::new(
            DkgContributionsDb::new(MemDb::new().clone_boxed()),
            masternodes,
            clock.clone(),
        );

        Setup {
            contributions,
            chain: MockChain::new(100),
            clock,
            members,
            vvec,
            share: shares[0],
        }
    }

    #[test]
    fn missing_vvec_fails_and_missing_share_does_not() {
        let Setup {
            contributions,
            chain,
            members,
            vvec,
            share,
            ..
        } = setup();
        let base = chain.block_at(24).unwrap();
        let mut valid = BitSet::new(3);
        valid.set(0, true);
        valid.set(2, true);

        contributions
            .write_verified_vvec_contribution(&base.hash, &members[0], &vvec)
            .unwrap();
        contributions
            .write_verified_sk_contribution(&base.hash, &members[0], &share)
            .unwrap();
        assert!(
            contributions
                .get_verified_contributions(&base, &valid)
                .unwrap()
                .is_none()
        );

        contributions
            .write_verified_vvec_contribution(&base.hash, &members[2], &vvec)
            .unwrap();
        let verified = contributions
            .get_verified_contributions(&base, &valid)
            .unwrap()
            .unwrap();
        assert_eq!(verified.member_indexes, vec![0, 2]);
        assert_eq!(verified.sk_contributions[0], share);
        assert!(!verified.sk_contributions[1].is_valid());
    }

    #[test]
    fn cache_entries_expire() {
        let Setup {
            contributions,
            chain,
            clock,
            members,
            vvec,
            ..
        } = setup();
        let base = chain.block_at(24).unwrap();
        let mut valid = BitSet::new(3);
        valid.set(1, true);

        contributions
            .write_verified_vvec_contribution(&base.hash, &members[1], &vvec)
            .unwrap();
        contributions
            .get_verified_contributions(&base, &valid)
            .unwrap()
            .unwrap();
        assert_eq!(contributions.cache.lock().len(), 1);

        clock.advance_millis(MAX_CONTRIBUTION_CACHE_TIME_MS);
        contributions.cleanup_cache();
        assert_eq!(contributions.cache.lock().len(), 1);

        clock.advance_millis(1);
        contributions.cleanup_cache();
        assert!(contributions.cache.lock().is_empty());
    }

    #[test]
    fn old_and_unknown_quorums_are_pruned() {
        let Setup {
            contributions,
            chain,
            members,
            vvec,
            ..
        } = setup();
        let params = LlmqParams::llmq_test();
        // tip is at 100 and the store depth is 96
        let old = chain.block_at(2).unwrap().hash;
        let recent = chain.block_at(24).unwrap().hash;
        let unknown = H256::repeat_byte(0xee);

        for quorum in [old, recent, unknown] {
            contributions
                .write_verified_vvec_contribution(&quorum, &members[0], &vvec)
                .unwrap();
        }

        assert_eq!(
            contributions
                .cleanup_old_contributions(&chain, &params)
                .unwrap(),
            2
        );
        assert!(contributions.db.read_vvec(&recent, &members[0]).unwrap().is_some());
        assert!(contributions.db.read_vvec(&old, &members[0]).unwrap().is_none());
    }
}
