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

//! Builds [`Quorum`] objects from mined commitments.
//!
//! The quorum verification vector and our secret key share are rebuilt from
//! verified DKG contributions once and then kept in two write-back caches,
//! keyed by [`Quorum::cache_key`].

use crate::{QUORUM_CACHE_SIZE, Quorum, QuorumProvider, QuorumStores};
use llmq_common::{
    BlockIndex, CacheMutex, ChainState, CommitmentProvider, H256, LlmqParams,
    MasternodeListProvider,
    bls::{BlsSecretKey, VerificationVector, aggregate_secret_keys},
};
use llmq_db::{DbError, EvoDb};
use llmq_dkg::DkgContributions;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Instant,
};

#[derive(derive_more::Debug)]
pub struct QuorumManager {
    params: LlmqParams,
    /// Registration hash of the local masternode.
    my_pro_tx_hash: Option<H256>,
    #[debug(skip)]
    chain: Arc<dyn ChainState>,
    #[debug(skip)]
    masternodes: Arc<dyn MasternodeListProvider>,
    #[debug(skip)]
    commitments: Arc<dyn CommitmentProvider>,
    #[debug(skip)]
    contributions: Arc<DkgContributions>,
    #[debug(skip)]
    vvecs: EvoDb<H256, VerificationVector>,
    #[debug(skip)]
    sk_shares: EvoDb<H256, BlsSecretKey>,
    /// Most recently built quorums, oldest first.
    #[debug(skip)]
    quorums: CacheMutex<VecDeque<Arc<Quorum>>>,
    interrupt: Arc<AtomicBool>,
    #[debug(skip)]
    populators: Mutex<Vec<JoinHandle<()>>>,
}

impl QuorumManager {
    pub fn new(
        params: LlmqParams,
        my_pro_tx_hash: Option<H256>,
        chain: Arc<dyn ChainState>,
        masternodes: Arc<dyn MasternodeListProvider>,
        commitments: Arc<dyn CommitmentProvider>,
        contributions: Arc<DkgContributions>,
        stores: QuorumStores,
    ) -> Self {
        Self {
            params,
            my_pro_tx_hash,
            chain,
            masternodes,
            commitments,
            contributions,
            vvecs: EvoDb::new("quorum-vvecs", stores.vvecs, stores.cache_size),
            sk_shares: EvoDb::new("quorum-sk-shares", stores.sk_shares, stores.cache_size),
            quorums: CacheMutex::new(VecDeque::with_capacity(QUORUM_CACHE_SIZE)),
            interrupt: Arc::new(AtomicBool::new(false)),
            populators: Mutex::new(Vec::new()),
        }
    }

    pub fn params(&self) -> &LlmqParams {
        &self.params
    }

    pub fn start(&self) {
        self.interrupt.store(false, Ordering::SeqCst);
    }

    /// Interrupts the public key share populators and waits for them.
    pub fn stop(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
        let handles: Vec<_> = self.populators.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("public key share populator panicked");
            }
        }
    }

    pub fn has_quorum(&self, quorum_hash: &H256) -> bool {
        self.commitments.has_mined_commitment(quorum_hash)
    }

    pub fn get_quorum(&self, quorum_hash: &H256) -> Option<Arc<Quorum>> {
        let Some(base_block) = self.chain.lookup_block(quorum_hash) else {
            tracing::debug!(quorum = %quorum_hash, "quorum base block not found");
            return None;
        };
        self.get_quorum_by_block(&base_block)
    }

    pub fn get_quorum_by_block(&self, base_block: &BlockIndex) -> Option<Arc<Quorum>> {
        // a reorg may have dropped the commitment of a cached quorum
        if !self.has_quorum(&base_block.hash) {
            return None;
        }

        let cached = self
            .quorums
            .lock()
            .iter()
            .find(|quorum| quorum.base_block.hash == base_block.hash)
            .cloned();
        cached.or_else(|| self.build_quorum_from_commitment(base_block))
    }

    /// Up to `count` quorums, newest first, walking back from the DKG
    /// interval boundary at or below `start`.
    pub fn scan_quorums(&self, start: &BlockIndex, count: usize) -> Vec<Arc<Quorum>> {
        let interval = self.params.dkg_interval;
        let mut result = Vec::with_capacity(count);
        if count == 0 {
            return result;
        }

        let mut block = self
            .chain
            .ancestor(start, start.height - start.height % interval);
        while let Some(current) = block {
            if result.len() >= count {
                break;
            }
            if let Some(quorum) = self.get_quorum_by_block(&current) {
                result.push(quorum);
            }
            block = current
                .height
                .checked_sub(interval)
                .and_then(|height| self.chain.ancestor(&current, height));
        }

        result
    }

    pub fn scan_quorums_from_tip(&self, count: usize) -> Vec<Arc<Quorum>> {
        let tip = {
            let _chain = self.chain.lock().lock();
            self.chain.tip()
        };
        tip.map(|tip| self.scan_quorums(&tip, count))
            .unwrap_or_default()
    }

    fn build_quorum_from_commitment(&self, base_block: &BlockIndex) -> Option<Arc<Quorum>> {
        let Some((commitment, mined_block_hash)) =
            self.commitments.mined_commitment(&base_block.hash)
        else {
            tracing::debug!(height = base_block.height, quorum = %base_block.hash, "no mined commitment");
            return None;
        };

        let members = self.masternodes.quorum_members(base_block);
        let quorum = Arc::new(Quorum::new(commitment, *base_block, mined_block_hash, members));

        let has_vvec = match self.read_contributions(&quorum) {
            Ok(true) => true,
            Ok(false) => {
                let built = self.build_quorum_contributions(&quorum);
                if built {
                    self.write_contributions(&quorum);
                } else {
                    tracing::debug!(quorum = %quorum.quorum_hash(), "no quorum verification vector");
                }
                built
            }
            Err(err) => {
                tracing::error!(quorum = %quorum.quorum_hash(), "failed to read quorum contributions: {err}");
                false
            }
        };

        if has_vvec {
            self.start_cache_populator(quorum.clone());
        }

        let mut quorums = self.quorums.lock();
        if let Some(built) = quorums
            .iter()
            .find(|cached| cached.base_block.hash == base_block.hash)
        {
            return Some(built.clone());
        }
        if quorums.len() >= QUORUM_CACHE_SIZE {
            quorums.pop_front();
        }
        quorums.push_back(quorum.clone());

        Some(quorum)
    }

    fn build_quorum_contributions(&self, quorum: &Quorum) -> bool {
        let started = Instant::now();
        let verified = match self
            .contributions
            .get_verified_contributions(&quorum.base_block, &quorum.commitment.valid_members)
        {
            Ok(Some(verified)) => verified,
            Ok(None) => return false,
            Err(err) => {
                tracing::error!(quorum = %quorum.quorum_hash(), "failed to read verified contributions: {err}");
                return false;
            }
        };

        let Some(vvec) = verified.quorum_verification_vector() else {
            tracing::debug!(quorum = %quorum.quorum_hash(), "failed to build quorum verification vector");
            return false;
        };
        quorum.set_verification_vector(vvec);

        // without a share we still verify through the quorum public key
        let sk_share = aggregate_secret_keys(&verified.sk_contributions);
        let accepted = self
            .my_pro_tx_hash
            .is_some_and(|me| quorum.set_secret_key_share(sk_share, &me));
        if !accepted && self.my_pro_tx_hash.is_some_and(|me| quorum.is_member(&me)) {
            tracing::debug!(quorum = %quorum.quorum_hash(), "failed to build secret key share");
        }

        tracing::debug!(
            quorum = %quorum.quorum_hash(),
            elapsed = ?started.elapsed(),
            sk_share = accepted,
            "built quorum verification vector"
        );
        true
    }

    fn read_contributions(&self, quorum: &Quorum) -> Result<bool, DbError> {
        let key = quorum.cache_key();
        let Some(vvec) = self.vvecs.read_cache(&key)? else {
            return Ok(false);
        };
        quorum.set_verification_vector(vvec);

        // observers have no share
        if let Some(sk_share) = self.sk_shares.read_cache(&key)? {
            quorum.restore_sk_share(sk_share);
        }
        Ok(true)
    }

    fn write_contributions(&self, quorum: &Quorum) {
        let key = quorum.cache_key();
        if let Some(vvec) = quorum.verification_vector() {
            self.vvecs.write_cache(key, vvec.as_ref().clone());
        }
        if let Some(sk_share) = quorum.sk_share() {
            self.sk_shares.write_cache(key, sk_share);
        }
    }

    /// Derives every valid member's public key share in the background, so
    /// the first signing sessions do not pay for it.
    fn start_cache_populator(&self, quorum: Arc<Quorum>) {
        let interrupt = self.interrupt.clone();
        let spawned = thread::Builder::new()
            .name(format!("llmq-pubkeys-{}", self.params.name))
            .spawn(move || {
                let started = Instant::now();
                for idx in 0..quorum.members.len() {
                    if interrupt.load(Ordering::SeqCst) {
                        break;
                    }
                    quorum.pub_key_share(idx);
                }
                tracing::debug!(quorum = %quorum.quorum_hash(), elapsed = ?started.elapsed(), "populated public key shares");
            });

        match spawned {
            Ok(handle) => {
                let mut populators = self.populators.lock();
                populators.retain(|handle| !handle.is_finished());
                populators.push(handle);
            }
            Err(err) => tracing::warn!("failed to spawn public key share populator: {err}"),
        }
    }

    /// Wipes the store of a full contribution cache and keeps its pending
    /// entries, which bounds the on-disk size.
    pub fn do_maintenance(&self) -> Result<(), DbError> {
        if self.vvecs.is_cache_full() {
            self.vvecs.rebuild()?;
            tracing::info!("quorum verification vector store wiped and recreated");
        }
        if self.sk_shares.is_cache_full() {
            self.sk_shares.rebuild()?;
            tracing::info!("quorum secret key share store wiped and recreated");
        }
        Ok(())
    }

    pub fn flush_cache_to_disk(&self) -> Result<(), DbError> {
        self.do_maintenance()?;
        self.vvecs.flush_cache_to_disk()?;
        self.sk_shares.flush_cache_to_disk()
    }

    /// Wipes both contribution stores and forgets built quorums.
    pub fn rebuild(&self) -> Result<(), DbError> {
        self.vvecs.rebuild()?;
        self.sk_shares.rebuild()?;
        self.quorums.lock().clear();
        Ok(())
    }

    pub fn cached_quorums(&self) -> usize {
        self.quorums.lock().len()
    }
}

impl QuorumProvider for QuorumManager {
    fn get_quorum(&self, quorum_hash: &H256) -> Option<Arc<Quorum>> {
        QuorumManager::get_quorum(self, quorum_hash)
    }

    fn scan_quorums(&self, start: &BlockIndex, count: usize) -> Vec<Arc<Quorum>> {
        QuorumManager::scan_quorums(self, start, count)
    }
}

impl Drop for QuorumManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmq_common::{
        FinalCommitment,
        bls::{BlsId, build_quorum_verification_vector, generate_contributions},
        test_utils::{MockChain, MockClock, MockCommitments, MockMasternodes, block_hash},
    };
    use llmq_db::{DkgContributionsDb, KVDatabase, MemDb};
    use rand::{SeedableRng, rngs::StdRng};

    struct Setup {
        chain: Arc<MockChain>,
        masternodes: Arc<MockMasternodes>,
        commitments: Arc<MockCommitments>,
        contributions: Arc<DkgContributions>,
        vvec_db: MemDb,
        sk_db: MemDb,
    }

    impl Setup {
        fn new() -> Self {
            let masternodes = Arc::new(MockMasternodes::new(3, 7));
            let contributions = Arc::new(DkgContributions::new(
                DkgContributionsDb::new(MemDb::new().clone_boxed()),
                masternodes.clone(),
                Arc::new(MockClock::default()),
            ));
            Self {
                chain: Arc::new(MockChain::new(300)),
                masternodes,
                commitments: Arc::new(MockCommitments::default()),
                contributions,
                vvec_db: MemDb::new(),
                sk_db: MemDb::new(),
            }
        }

        fn manager(&self, contributions: Arc<DkgContributions>) -> QuorumManager {
            QuorumManager::new(
                LlmqParams::llmq_test(),
                self.masternodes.active(0).map(|active| active.pro_tx_hash),
                self.chain.clone(),
                self.masternodes.clone(),
                self.commitments.clone(),
                contributions,
                QuorumStores::new(self.vvec_db.clone_boxed(), self.sk_db.clone_boxed()),
            )
        }

        /// Mines a commitment for the quorum at `height`, optionally storing
        /// the DKG contributions member 0 would have verified.
        fn mine(&self, height: u32, with_contributions: bool) -> H256 {
            let params = LlmqParams::llmq_test();
            let quorum_hash = block_hash(height);
            let entries = self.masternodes.entries();
            let mut commitment = FinalCommitment::new(quorum_hash, &params);
            for idx in 0..entries.len() {
                commitment.valid_members.set(idx, true);
                commitment.signers.set(idx, true);
            }

            if with_contributions {
                let ids: Vec<_> = entries
                    .iter()
                    .map(|entry| BlsId::from_hash(&entry.pro_tx_hash))
                    .collect();
                let mut rng = StdRng::seed_from_u64(height as u64);
                let mut vvecs = Vec::new();
                for entry in &entries {
                    let (vvec, shares) =
                        generate_contributions(params.threshold, &ids, &mut rng).unwrap();
                    self.contributions
                        .write_verified_vvec_contribution(&quorum_hash, &entry.pro_tx_hash, &vvec)
                        .unwrap();
                    self.contributions
                        .write_verified_sk_contribution(&quorum_hash, &entry.pro_tx_hash, &shares[0])
                        .unwrap();
                    vvecs.push(vvec);
                }
                commitment.quorum_public_key = build_quorum_verification_vector(&vvecs).unwrap()[0];
            }

            self.commitments.mine(commitment, block_hash(height + 10));
            quorum_hash
        }
    }

    #[test]
    fn builds_quorum_from_verified_contributions() {
        let setup = Setup::new();
        let manager = setup.manager(setup.contributions.clone());
        let quorum_hash = setup.mine(24, true);

        let quorum = manager.get_quorum(&quorum_hash).unwrap();
        assert_eq!(quorum.quorum_hash(), quorum_hash);
        assert_eq!(quorum.mined_block_hash, block_hash(34));
        assert!(quorum.has_verification_vector());

        let sk_share = quorum.sk_share().unwrap();
        assert_eq!(quorum.pub_key_share(0), Some(sk_share.public_key()));
        assert_eq!(quorum.verification_vector().unwrap()[0], quorum.public_key());

        let again = manager.get_quorum(&quorum_hash).unwrap();
        assert!(Arc::ptr_eq(&quorum, &again));

        assert!(manager.get_quorum(&block_hash(48)).is_none());
        assert!(manager.get_quorum(&H256::repeat_byte(0xee)).is_none());
    }

    #[test]
    fn quorum_without_contributions_is_usable_as_observer() {
        let setup = Setup::new();
        let manager = setup.manager(setup.contributions.clone());
        let quorum_hash = setup.mine(24, false);

        let quorum = manager.get_quorum(&quorum_hash).unwrap();
        assert!(!quorum.has_verification_vector());
        assert!(quorum.sk_share().is_none());
        assert_eq!(quorum.pub_key_share(0), None);
    }

    #[test]
    fn contributions_survive_in_the_stores() {
        let setup = Setup::new();
        let quorum_hash = setup.mine(24, true);
        let sk_share = {
            let manager = setup.manager(setup.contributions.clone());
            let quorum = manager.get_quorum(&quorum_hash).unwrap();
            manager.flush_cache_to_disk().unwrap();
            quorum.sk_share().unwrap()
        };

        let empty = Arc::new(DkgContributions::new(
            DkgContributionsDb::new(MemDb::new().clone_boxed()),
            setup.masternodes.clone(),
            Arc::new(MockClock::default()),
        ));
        let manager = setup.manager(empty);
        let quorum = manager.get_quorum(&quorum_hash).unwrap();
        assert!(quorum.has_verification_vector());
        assert_eq!(quorum.sk_share(), Some(sk_share));
    }

    #[test]
    fn scan_walks_back_by_interval() {
        let setup = Setup::new();
        let manager = setup.manager(setup.contributions.clone());
        for height in [24, 48, 72] {
            setup.mine(height, false);
        }

        let heights = |start: u32, count: usize| -> Vec<u32> {
            let start = setup.chain.block_at(start).unwrap();
            manager
                .scan_quorums(&start, count)
                .iter()
                .map(|quorum| quorum.base_block.height)
                .collect()
        };

        assert_eq!(heights(100, 5), vec![72, 48, 24]);
        assert_eq!(heights(100, 2), vec![72, 48]);
        assert_eq!(heights(71, 5), vec![48, 24]);
        assert_eq!(heights(23, 5), Vec::<u32>::new());
        assert!(heights(100, 0).is_empty());
        assert_eq!(manager.scan_quorums_from_tip(1).len(), 1);
    }

    #[test]
    fn quorum_cache_is_bounded() {
        let setup = Setup::new();
        let manager = setup.manager(setup.contributions.clone());

        for round in 1..=12 {
            let quorum_hash = setup.mine(round * 24, false);
            assert!(manager.get_quorum(&quorum_hash).is_some());
        }
        assert_eq!(manager.cached_quorums(), QUORUM_CACHE_SIZE);

        manager.rebuild().unwrap();
        assert_eq!(manager.cached_quorums(), 0);
    }
}
