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

use crate::{
    Rejected, RecoveredSigsListener, SIGN_HEIGHT_LOOKBACK, SIGN_HEIGHT_OFFSET, SigSharesBroadcaster,
    SigningConfig, SigningError, selection,
};
use llmq_common::{
    BlockIndex, ChainState, Clock, H256, Inv, InvKind, LlmqParams, NodeId, PeerManager, RecoveredSig,
    batch::BatchVerifier,
    bls::BlsSignature,
    messages::QSIGREC,
    network::LOCAL_NODE,
    pipeline::iterate_nodes_random,
};
use llmq_db::{KVDatabase, RecoveredSigsDb};
use llmq_quorums::{Quorum, QuorumProvider};
use parity_scale_codec::Decode;
use parking_lot::Mutex;
use rand::{SeedableRng, rngs::StdRng};
use std::{
    cell::Cell,
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Unique sessions verified per batch.
const MAX_BATCH_SIZE: usize = 32;
const CLEANUP_INTERVAL_MS: i64 = 5_000;
const IDLE_SLEEP: Duration = Duration::from_millis(100);

type PendingByNode = HashMap<NodeId, VecDeque<Arc<RecoveredSig>>>;

struct Pending {
    /// Received from peers, not verified yet.
    recovered: PendingByNode,
    /// Reconstructed locally from other messages, known to be valid.
    reconstructed: HashMap<H256, Arc<RecoveredSig>>,
    rng: StdRng,
}

#[derive(derive_more::Debug)]
pub struct SigningManager {
    params: LlmqParams,
    config: SigningConfig,
    /// Registration hash of the local masternode, in masternode mode.
    my_pro_tx_hash: Option<H256>,
    db: RecoveredSigsDb,
    #[debug(skip)]
    chain: Arc<dyn ChainState>,
    #[debug(skip)]
    quorums: Arc<dyn QuorumProvider>,
    #[debug(skip)]
    peers: Arc<dyn PeerManager>,
    #[debug(skip)]
    sig_shares: Arc<dyn SigSharesBroadcaster>,
    #[debug(skip)]
    clock: Arc<dyn Clock>,
    #[debug(skip)]
    pending: Mutex<Pending>,
    /// Serializes the vote check and write of `async_sign_if_member`.
    #[debug(skip)]
    votes: Mutex<()>,
    #[debug(skip)]
    listeners: Mutex<Vec<Arc<dyn RecoveredSigsListener>>>,
    last_cleanup: Mutex<i64>,
    stop: AtomicBool,
    #[debug(skip)]
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SigningManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: LlmqParams,
        config: SigningConfig,
        my_pro_tx_hash: Option<H256>,
        db: Box<dyn KVDatabase>,
        chain: Arc<dyn ChainState>,
        quorums: Arc<dyn QuorumProvider>,
        peers: Arc<dyn PeerManager>,
        sig_shares: Arc<dyn SigSharesBroadcaster>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            params,
            config,
            my_pro_tx_hash,
            db: RecoveredSigsDb::new(db, clock.clone()),
            chain,
            quorums,
            peers,
            sig_shares,
            clock,
            pending: Mutex::new(Pending {
                recovered: HashMap::new(),
                reconstructed: HashMap::new(),
                rng: StdRng::from_entropy(),
            }),
            votes: Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
            last_cleanup: Mutex::new(0),
            stop: AtomicBool::new(false),
            thread: Mutex::new(None),
        }
    }

    fn punish(&self, node: NodeId, score: u32, reason: &str) {
        if node != LOCAL_NODE {
            self.peers.misbehaving(node, score, reason);
        }
    }

    fn forget(&self, node: NodeId, hash: &H256) {
        if node != LOCAL_NODE {
            self.peers.forget_tx_hash(node, hash);
        }
    }

    pub fn already_have(&self, hash: &H256) -> bool {
        if self.pending.lock().reconstructed.contains_key(hash) {
            return true;
        }
        self.db.has_recovered_sig_for_hash(hash)
    }

    /// Signatures of inactive quorums are not served to peers.
    pub fn get_recovered_sig_for_get_data(&self, hash: &H256) -> Result<Option<RecoveredSig>, SigningError> {
        let rec_sig = self.db.get_recovered_sig_by_hash(hash)?;
        Ok(rec_sig.filter(|rec_sig| self.is_quorum_active(rec_sig.quorum_hash())))
    }

    pub fn process_message(&self, peer: NodeId, command: &str, payload: &[u8]) {
        if command != QSIGREC {
            return;
        }
        match RecoveredSig::decode(&mut &payload[..]) {
            Ok(rec_sig) => self.process_message_recovered_sig(peer, rec_sig),
            Err(err) => {
                tracing::debug!(peer, "malformed recovered sig: {err}");
                self.punish(peer, 100, "malformed recovered sig");
            }
        }
    }

    pub fn process_message_recovered_sig(&self, peer: NodeId, rec_sig: RecoveredSig) {
        let hash = *rec_sig.hash();
        self.peers.add_known_tx(peer, &hash);

        if let Err(rejected) = self.pre_verify_recovered_sig(&rec_sig) {
            tracing::trace!(peer, %hash, "dropping recovered sig: {rejected}");
            return;
        }

        // only skip signatures already known to be valid
        if self.db.has_recovered_sig_for_hash(&hash) {
            self.forget(peer, &hash);
            return;
        }

        tracing::debug!(
            peer,
            sign_hash = %rec_sig.sign_hash(),
            id = %rec_sig.id(),
            msg_hash = %rec_sig.msg_hash(),
            "received recovered sig"
        );

        {
            let mut pending = self.pending.lock();
            if pending.reconstructed.contains_key(&hash) {
                tracing::debug!(peer, %hash, "already pending as reconstructed sig");
            } else {
                pending
                    .recovered
                    .entry(peer)
                    .or_default()
                    .push_back(Arc::new(rec_sig));
            }
        }
        self.forget(peer, &hash);
    }

    /// The quorum must exist and be active.
    pub fn pre_verify_recovered_sig(&self, rec_sig: &RecoveredSig) -> Result<Arc<Quorum>, Rejected> {
        let quorum_hash = *rec_sig.quorum_hash();
        let quorum = self
            .quorums
            .get_quorum(&quorum_hash)
            .ok_or(Rejected::UnknownQuorum(quorum_hash))?;
        if !self.is_quorum_active(&quorum_hash) {
            return Err(Rejected::InactiveQuorum(quorum_hash));
        }
        Ok(quorum)
    }

    /// Takes pending signatures round robin across peers until
    /// `max_unique_sessions` sessions are collected, along with the quorums
    /// that are still active for them.
    pub fn collect_pending_recovered_sigs_to_verify(
        &self,
        max_unique_sessions: usize,
    ) -> (HashMap<NodeId, Vec<Arc<RecoveredSig>>>, HashMap<H256, Arc<Quorum>>) {
        let mut by_node: HashMap<NodeId, Vec<Arc<RecoveredSig>>> = HashMap::new();
        {
            let mut pending = self.pending.lock();
            if pending.recovered.is_empty() {
                return Default::default();
            }

            let Pending { recovered, rng, .. } = &mut *pending;
            let mut sessions = HashSet::new();
            let unique = Cell::new(0);
            iterate_nodes_random(
                recovered,
                || unique.get() < max_unique_sessions,
                |node, queue| {
                    let Some(rec_sig) = queue.pop_front() else {
                        return false;
                    };
                    if !self.db.has_recovered_sig_for_hash(rec_sig.hash()) {
                        sessions.insert((node, rec_sig.sign_hash()));
                        unique.set(sessions.len());
                        by_node.entry(node).or_default().push(rec_sig);
                    }
                    !queue.is_empty()
                },
                rng,
            );
            recovered.retain(|_, queue| !queue.is_empty());
        }

        let mut quorums: HashMap<H256, Arc<Quorum>> = HashMap::new();
        for (node, rec_sigs) in &mut by_node {
            rec_sigs.retain(|rec_sig| {
                let quorum_hash = *rec_sig.quorum_hash();
                if quorums.contains_key(&quorum_hash) {
                    return true;
                }
                match self.pre_verify_recovered_sig(rec_sig) {
                    Ok(quorum) => {
                        quorums.insert(quorum_hash, quorum);
                        true
                    }
                    Err(rejected) => {
                        tracing::debug!(node, "dropping pending recovered sig: {rejected}");
                        false
                    }
                }
            });
        }
        by_node.retain(|_, rec_sigs| !rec_sigs.is_empty());

        (by_node, quorums)
    }

    pub fn process_pending_reconstructed_recovered_sigs(&self) {
        let reconstructed = std::mem::take(&mut self.pending.lock().reconstructed);
        for rec_sig in reconstructed.into_values() {
            self.process_recovered_sig(LOCAL_NODE, &rec_sig);
        }
    }

    /// Verifies one batch of pending signatures. Returns true when the batch
    /// was full and more work is likely waiting.
    pub fn process_pending_recovered_sigs(&self) -> bool {
        self.process_pending_reconstructed_recovered_sigs();

        let (by_node, quorums) = self.collect_pending_recovered_sigs_to_verify(MAX_BATCH_SIZE);
        if by_node.is_empty() {
            return false;
        }

        // insecure aggregation is fine, quorum keys cannot be crafted by a single party
        let mut verifier = BatchVerifier::<NodeId, H256>::new(false);
        let mut count = 0;
        for (node, rec_sigs) in &by_node {
            for rec_sig in rec_sigs {
                if !rec_sig.sig().is_valid() {
                    verifier.bad_sources.insert(*node);
                    break;
                }
                let Some(quorum) = quorums.get(rec_sig.quorum_hash()) else {
                    continue;
                };
                verifier.push_message(
                    *node,
                    *rec_sig.hash(),
                    rec_sig.sign_hash(),
                    *rec_sig.sig(),
                    quorum.public_key(),
                );
                count += 1;
            }
        }

        let started = Instant::now();
        verifier.verify();
        tracing::debug!(
            count,
            nodes = by_node.len(),
            elapsed = ?started.elapsed(),
            "verified recovered sigs"
        );

        let mut processed = HashSet::new();
        for (node, rec_sigs) in &by_node {
            if verifier.bad_sources.contains(node) {
                tracing::warn!(node, "invalid recovered sig from peer");
                self.punish(*node, 100, "invalid recovered sig");
                continue;
            }
            for rec_sig in rec_sigs {
                if processed.insert(*rec_sig.hash()) {
                    self.process_recovered_sig(*node, rec_sig);
                }
            }
        }

        by_node.len() >= MAX_BATCH_SIZE
    }

    /// Block of a recovered sig: known, at a signing height, in the active
    /// chain and fully validated.
    fn check_signed_block(&self, rec_sig: &RecoveredSig) -> Result<BlockIndex, &'static str> {
        let _chain = self.chain.lock().lock();
        let block = self
            .chain
            .lookup_block(rec_sig.msg_hash())
            .ok_or("block of recovered sig does not exist")?;
        if block.height % SIGN_HEIGHT_LOOKBACK != 0 {
            return Err("invalid recovered sig block height");
        }
        if !self.chain.contains(&block) || !block.valid_scripts {
            return Err("recovered sig of unconfirmed block");
        }
        Ok(block)
    }

    /// Accepts a signature whose BLS signature was already verified.
    ///
    /// The quorum is checked for activity again, since it may have rotated
    /// out while the signature waited for verification.
    pub fn process_recovered_sig(&self, node: NodeId, rec_sig: &RecoveredSig) {
        let hash = *rec_sig.hash();
        if node != LOCAL_NODE {
            self.peers.add_known_tx(node, &hash);
        }

        {
            let _chain = self.chain.lock().lock();
            if let Err(reason) = self.check_signed_block(rec_sig) {
                tracing::warn!(node, id = %rec_sig.id(), msg_hash = %rec_sig.msg_hash(), "{reason}");
                self.forget(node, &hash);
                self.punish(node, 10, reason);
                return;
            }
            if !self.is_quorum_active(rec_sig.quorum_hash()) {
                tracing::debug!(node, quorum = %rec_sig.quorum_hash(), %hash, "quorum no longer active");
                self.forget(node, &hash);
                return;
            }
        }

        if self.db.has_recovered_sig_for_hash(&hash) {
            self.forget(node, &hash);
            return;
        }

        let sign_hash = rec_sig.sign_hash();
        tracing::debug!(%sign_hash, id = %rec_sig.id(), msg_hash = %rec_sig.msg_hash(), "valid recovered sig");

        // the store refuses a second signature for an id on its own
        let written = match self.db.write_recovered_sig(rec_sig) {
            Ok(written) => written,
            Err(err) => {
                tracing::error!(%hash, "failed to store recovered sig: {err}");
                false
            }
        };
        self.pending.lock().reconstructed.remove(&hash);

        if !written {
            // the first signature for an id stays authoritative
            match self.db.get_recovered_sig_by_id(rec_sig.id()) {
                Ok(Some(existing)) if existing.sign_hash() != sign_hash => {
                    tracing::warn!(
                        %sign_hash,
                        id = %rec_sig.id(),
                        msg_hash = %rec_sig.msg_hash(),
                        other_sign_hash = %existing.sign_hash(),
                        "conflicting recovered sig"
                    );
                }
                Ok(_) => {}
                Err(err) => tracing::error!(id = %rec_sig.id(), "failed to read recovered sig: {err}"),
            }
            self.forget(node, &hash);
            return;
        }

        if self.my_pro_tx_hash.is_some() {
            self.peers
                .relay_inv(Inv::new(InvKind::QuorumRecoveredSig, hash));
        }
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.handle_new_recovered_sig(rec_sig);
        }
        self.forget(node, &hash);
    }

    /// Queues a signature reconstructed from another message, e.g. a chain
    /// lock. It skips the BLS verification.
    pub fn push_reconstructed_recovered_sig(&self, rec_sig: RecoveredSig) {
        self.pending
            .lock()
            .reconstructed
            .insert(*rec_sig.hash(), Arc::new(rec_sig));
    }

    /// Drops the signature payload of `id` once another mechanism prevents
    /// conflicts. Its hash stays known.
    pub fn truncate_recovered_sig(&self, id: &H256) -> Result<(), SigningError> {
        self.db.truncate_recovered_sig(id)?;
        Ok(())
    }

    /// Drops old signatures and votes, at most once per five seconds.
    pub fn cleanup(&self) -> Result<(), SigningError> {
        let now = self.clock.now_millis();
        {
            let last = self.last_cleanup.lock();
            if now - *last < CLEANUP_INTERVAL_MS {
                return Ok(());
            }
        }

        let max_age = self.config.max_recovered_sigs_age;
        self.db.cleanup_old_recovered_sigs(max_age)?;
        self.db.cleanup_old_votes(max_age)?;

        *self.last_cleanup.lock() = self.clock.now_millis();
        Ok(())
    }

    /// Drops every signature and vote written before the current second.
    pub fn clear(&self) -> Result<(), SigningError> {
        self.db.cleanup_old_recovered_sigs(0)?;
        self.db.cleanup_old_votes(0)?;
        Ok(())
    }

    pub fn register_recovered_sigs_listener(&self, listener: Arc<dyn RecoveredSigsListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn unregister_recovered_sigs_listener(&self, listener: &Arc<dyn RecoveredSigsListener>) {
        self.listeners
            .lock()
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }

    /// Starts signing `msg_hash` for `id` when we are a valid member of the
    /// quorum, which is selected from `id` unless `quorum_hash` pins one.
    ///
    /// Only one `msg_hash` is ever voted for an id. Voting again for the
    /// same one needs `allow_re_sign`.
    pub fn async_sign_if_member(
        &self,
        id: &H256,
        msg_hash: &H256,
        quorum_hash: Option<&H256>,
        allow_re_sign: bool,
    ) -> Result<bool, SigningError> {
        let Some(me) = self.my_pro_tx_hash else {
            return Ok(false);
        };

        let quorum = match quorum_hash {
            Some(quorum_hash) => self.quorums.get_quorum(quorum_hash),
            // members on the brink of a new quorum may pick different ones
            None => self.select_quorum_for_signing(id, None, SIGN_HEIGHT_OFFSET),
        };
        let Some(quorum) = quorum else {
            tracing::debug!(%id, %msg_hash, "failed to select quorum");
            return Ok(false);
        };
        if !quorum.is_valid_member(&me) {
            return Ok(false);
        }

        {
            let _votes = self.votes.lock();

            let voted = self.db.get_vote_for_id(id)?;
            if let Some(voted) = voted {
                if voted != *msg_hash {
                    tracing::warn!(%id, %voted, conflicting = %msg_hash, "not voting on conflicting msg hash");
                    return Ok(false);
                }
                if !allow_re_sign {
                    tracing::debug!(%id, %voted, "already voted");
                    return Ok(false);
                }
                tracing::debug!(%id, %voted, "already voted, signing again");
            }

            // no need to sign once recovered
            if self.db.has_recovered_sig_for_id(id) {
                return Ok(true);
            }
            if voted.is_none() {
                self.db.write_vote_for_id(id, msg_hash)?;
            }
        }

        if allow_re_sign {
            // peers may have timed out on our shares
            self.sig_shares.force_re_announcement(&quorum, id, msg_hash);
        }
        self.sig_shares.async_sign(&quorum, id, msg_hash);
        Ok(true)
    }

    pub fn has_recovered_sig(&self, id: &H256, msg_hash: &H256) -> bool {
        self.db.has_recovered_sig(id, msg_hash)
    }

    pub fn has_recovered_sig_for_id(&self, id: &H256) -> bool {
        self.db.has_recovered_sig_for_id(id)
    }

    pub fn has_recovered_sig_for_session(&self, sign_hash: &H256) -> bool {
        self.db.has_recovered_sig_for_session(sign_hash)
    }

    pub fn get_recovered_sig_for_id(&self, id: &H256) -> Result<Option<RecoveredSig>, SigningError> {
        Ok(self.db.get_recovered_sig_by_id(id)?)
    }

    /// A signature exists for `id`, but not over `msg_hash`.
    pub fn is_conflicting(&self, id: &H256, msg_hash: &H256) -> bool {
        self.db.has_recovered_sig_for_id(id) && !self.db.has_recovered_sig(id, msg_hash)
    }

    pub fn has_voted_on_id(&self, id: &H256) -> bool {
        self.db.has_voted_on_id(id)
    }

    pub fn get_vote_for_id(&self, id: &H256) -> Result<Option<H256>, SigningError> {
        Ok(self.db.get_vote_for_id(id)?)
    }

    pub fn select_quorum_for_signing(
        &self,
        selection_hash: &H256,
        sign_height: Option<u32>,
        sign_offset: u32,
    ) -> Option<Arc<Quorum>> {
        selection::select_quorum_for_signing(
            &*self.chain,
            &*self.quorums,
            &self.params,
            selection_hash,
            sign_height,
            sign_offset,
        )
    }

    pub fn verify_recovered_sig(
        &self,
        sign_height: Option<u32>,
        id: &H256,
        msg_hash: &H256,
        sig: &BlsSignature,
        sign_offset: u32,
    ) -> bool {
        selection::verify_recovered_sig(
            &*self.chain,
            &*self.quorums,
            &self.params,
            sign_height,
            id,
            msg_hash,
            sig,
            sign_offset,
        )
    }

    pub fn is_quorum_active(&self, quorum_hash: &H256) -> bool {
        selection::is_quorum_active(&*self.chain, &*self.quorums, &self.params, quorum_hash)
    }

    pub fn start_worker_thread(self: &Arc<Self>) -> Result<(), SigningError> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }

        self.stop.store(false, Ordering::SeqCst);
        let manager = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("llmq-sigs".into())
            .spawn(move || manager.work())?;
        *thread = Some(handle);
        Ok(())
    }

    /// Asks the worker to stop after its current batch.
    pub fn interrupt_worker_thread(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_worker_thread(&self) {
        self.interrupt_worker_thread();
        let handle = self.thread.lock().take();
        if handle.is_some_and(|handle| handle.join().is_err()) {
            tracing::error!("signing worker panicked");
        }
    }

    fn work(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            let more_work = self.process_pending_recovered_sigs();
            if let Err(err) = self.cleanup() {
                tracing::error!("recovered sigs cleanup failed: {err}");
            }
            if !more_work {
                thread::sleep(IDLE_SLEEP);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmq_common::{
        FinalCommitment,
        bls::BlsSecretKey,
        serialize_hash,
        test_utils::{MockChain, MockClock, MockCommitments, MockMasternodes, MockPeers, block_hash},
    };
    use llmq_db::{DkgContributionsDb, KVDatabase, MemDb};
    use llmq_dkg::DkgContributions;
    use llmq_quorums::{QuorumManager, QuorumStores};
    use parity_scale_codec::Encode;

    #[derive(Default)]
    struct RecordingBroadcaster {
        signed: Mutex<Vec<(H256, H256, H256)>>,
        re_announced: Mutex<Vec<(H256, H256)>>,
    }

    impl SigSharesBroadcaster for RecordingBroadcaster {
        fn async_sign(&self, quorum: &Arc<Quorum>, id: &H256, msg_hash: &H256) {
            self.signed.lock().push((quorum.quorum_hash(), *id, *msg_hash));
        }

        fn force_re_announcement(&self, _quorum: &Arc<Quorum>, id: &H256, msg_hash: &H256) {
            self.re_announced.lock().push((*id, *msg_hash));
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<RecoveredSig>>);

    impl RecoveredSigsListener for Collect {
        fn handle_new_recovered_sig(&self, rec_sig: &RecoveredSig) {
            self.0.lock().push(rec_sig.clone());
        }
    }

    /// Quorums every 24 blocks from 168 to 288 on a chain of 300 blocks.
    /// The one at 168 is no longer active.
    struct Setup {
        params: LlmqParams,
        masternodes: Arc<MockMasternodes>,
        chain: Arc<MockChain>,
        peers: Arc<MockPeers>,
        clock: Arc<MockClock>,
        broadcaster: Arc<RecordingBroadcaster>,
        quorums: Arc<QuorumManager>,
        keys: HashMap<H256, BlsSecretKey>,
    }

    impl Setup {
        fn new() -> Self {
            let params = LlmqParams::llmq_test();
            let masternodes = Arc::new(MockMasternodes::new(3, 11));
            let chain = Arc::new(MockChain::new(300));
            let commitments = Arc::new(MockCommitments::default());
            let clock = Arc::new(MockClock::default());
            let contributions = Arc::new(DkgContributions::new(
                DkgContributionsDb::new(MemDb::new().clone_boxed()),
                masternodes.clone(),
                clock.clone(),
            ));
            let quorums = Arc::new(QuorumManager::new(
                params,
                masternodes.active(0).map(|active| active.pro_tx_hash),
                chain.clone(),
                masternodes.clone(),
                commitments.clone(),
                contributions,
                QuorumStores::new(MemDb::new().clone_boxed(), MemDb::new().clone_boxed()),
            ));

            let mut rng = StdRng::seed_from_u64(5);
            let mut keys = HashMap::new();
            for height in (168..=288).step_by(24) {
                let sk = BlsSecretKey::random(&mut rng);
                let quorum_hash = block_hash(height);
                let mut commitment = FinalCommitment::new(quorum_hash, &params);
                for idx in 0..params.size {
                    commitment.valid_members.set(idx, true);
                    commitment.signers.set(idx, true);
                }
                commitment.quorum_public_key = sk.public_key();
                commitments.mine(commitment, block_hash(height + 10));
                keys.insert(quorum_hash, sk);
            }

            Self {
                params,
                masternodes,
                chain,
                peers: Arc::new(MockPeers::default()),
                clock,
                broadcaster: Arc::new(RecordingBroadcaster::default()),
                quorums,
                keys,
            }
        }

        fn manager_with(&self, config: SigningConfig, masternode: bool) -> Arc<SigningManager> {
            self.manager_on(&MemDb::new(), config, masternode)
        }

        fn manager_on(&self, db: &MemDb, config: SigningConfig, masternode: bool) -> Arc<SigningManager> {
            let my_pro_tx_hash = masternode
                .then(|| self.masternodes.active(0))
                .flatten()
                .map(|active| active.pro_tx_hash);
            Arc::new(SigningManager::new(
                self.params,
                config,
                my_pro_tx_hash,
                db.clone_boxed(),
                self.chain.clone(),
                self.quorums.clone(),
                self.peers.clone(),
                self.broadcaster.clone(),
                self.clock.clone(),
            ))
        }

        fn manager(&self) -> Arc<SigningManager> {
            self.manager_with(SigningConfig::default(), true)
        }

        fn sign(&self, quorum_height: u32, id: H256, msg_hash: H256) -> RecoveredSig {
            let quorum_hash = block_hash(quorum_height);
            let sign_hash = llmq_common::build_sign_hash(&quorum_hash, &id, &msg_hash);
            let sig = self.keys[&quorum_hash].sign(&sign_hash).unwrap();
            RecoveredSig::new(quorum_hash, id, msg_hash, sig)
        }
    }

    fn id(n: u8) -> H256 {
        H256::repeat_byte(n)
    }

    #[test]
    fn selection_is_deterministic() {
        let setup = Setup::new();
        let manager = setup.manager();
        let other = setup.manager_with(SigningConfig::default(), false);

        for n in 1..20 {
            let selected = manager
                .select_quorum_for_signing(&id(n), None, SIGN_HEIGHT_OFFSET)
                .unwrap();
            let expected = [288, 264, 240, 216]
                .into_iter()
                .map(block_hash)
                .min_by_key(|quorum_hash| serialize_hash(&(quorum_hash, &id(n))))
                .unwrap();
            assert_eq!(selected.quorum_hash(), expected);

            let again = other
                .select_quorum_for_signing(&id(n), None, SIGN_HEIGHT_OFFSET)
                .unwrap();
            assert_eq!(again.quorum_hash(), selected.quorum_hash());
        }

        // the pool moves back with the signing height
        let older = manager
            .select_quorum_for_signing(&id(1), Some(250), SIGN_HEIGHT_OFFSET)
            .unwrap();
        assert!([240, 216, 192, 168].map(block_hash).contains(&older.quorum_hash()));

        assert!(manager.select_quorum_for_signing(&id(1), Some(400), SIGN_HEIGHT_OFFSET).is_none());
        assert!(manager.select_quorum_for_signing(&id(1), Some(5), SIGN_HEIGHT_OFFSET).is_none());
    }

    #[test]
    fn recovered_sig_verifies_against_selected_quorum() {
        let setup = Setup::new();
        let manager = setup.manager();
        let msg_hash = block_hash(295);

        let selected = manager
            .select_quorum_for_signing(&id(3), None, SIGN_HEIGHT_OFFSET)
            .unwrap();
        let height = selected.base_block.height;
        let good = setup.sign(height, id(3), msg_hash);
        assert!(manager.verify_recovered_sig(None, &id(3), &msg_hash, good.sig(), SIGN_HEIGHT_OFFSET));

        let other_height = if height == 288 { 264 } else { 288 };
        let bad = setup.sign(other_height, id(3), msg_hash);
        assert!(!manager.verify_recovered_sig(None, &id(3), &msg_hash, bad.sig(), SIGN_HEIGHT_OFFSET));
        assert!(!manager.verify_recovered_sig(None, &id(3), &id(9), good.sig(), SIGN_HEIGHT_OFFSET));
    }

    #[test]
    fn one_extra_quorum_stays_active() {
        let setup = Setup::new();
        let manager = setup.manager();

        for height in [288, 264, 240, 216, 192] {
            assert!(manager.is_quorum_active(&block_hash(height)), "{height}");
        }
        assert!(!manager.is_quorum_active(&block_hash(168)));
        assert!(!manager.is_quorum_active(&H256::repeat_byte(0xee)));
    }

    #[test]
    fn valid_recovered_sig_is_stored_relayed_and_announced() {
        let setup = Setup::new();
        let manager = setup.manager();
        let listener = Arc::new(Collect::default());
        manager.register_recovered_sigs_listener(listener.clone());

        let rec_sig = setup.sign(288, id(1), block_hash(295));
        manager.process_message(7, QSIGREC, &rec_sig.encode());
        assert!(!manager.has_recovered_sig(&id(1), &block_hash(295)));

        assert!(!manager.process_pending_recovered_sigs());
        assert!(manager.has_recovered_sig(&id(1), &block_hash(295)));
        assert!(manager.has_recovered_sig_for_session(&rec_sig.sign_hash()));
        assert!(manager.already_have(rec_sig.hash()));
        assert_eq!(manager.get_recovered_sig_for_id(&id(1)).unwrap(), Some(rec_sig.clone()));
        assert_eq!(
            manager.get_recovered_sig_for_get_data(rec_sig.hash()).unwrap(),
            Some(rec_sig.clone())
        );

        assert_eq!(*listener.0.lock(), vec![rec_sig.clone()]);
        assert_eq!(
            *setup.peers.relayed.lock(),
            vec![Inv::new(InvKind::QuorumRecoveredSig, *rec_sig.hash())]
        );
        assert_eq!(setup.peers.score_of(7), 0);
        assert!(setup.peers.forgotten.lock().contains(&(7, *rec_sig.hash())));

        let as_listener: Arc<dyn RecoveredSigsListener> = listener.clone();
        manager.unregister_recovered_sigs_listener(&as_listener);
        let next = setup.sign(264, id(2), block_hash(295));
        manager.process_message_recovered_sig(7, next);
        manager.process_pending_recovered_sigs();
        assert_eq!(listener.0.lock().len(), 1);
    }

    #[test]
    fn non_masternodes_do_not_relay() {
        let setup = Setup::new();
        let manager = setup.manager_with(SigningConfig::default(), false);

        manager.process_message_recovered_sig(7, setup.sign(288, id(1), block_hash(295)));
        manager.process_pending_recovered_sigs();

        assert!(manager.has_recovered_sig_for_id(&id(1)));
        assert!(setup.peers.relayed.lock().is_empty());
    }

    #[test]
    fn invalid_signature_bans_only_its_sender() {
        let setup = Setup::new();
        let manager = setup.manager();

        let good = setup.sign(288, id(1), block_hash(295));
        let forged = {
            let signed_by_other = setup.sign(264, id(2), block_hash(295));
            RecoveredSig::new(block_hash(288), id(2), block_hash(295), *signed_by_other.sig())
        };
        manager.process_message_recovered_sig(1, good);
        manager.process_message_recovered_sig(2, forged);
        manager.process_pending_recovered_sigs();

        assert_eq!(setup.peers.score_of(1), 0);
        assert_eq!(setup.peers.score_of(2), 100);
        assert!(manager.has_recovered_sig_for_id(&id(1)));
        assert!(!manager.has_recovered_sig_for_id(&id(2)));
    }

    #[test]
    fn signed_block_must_be_confirmed_at_signing_height() {
        let setup = Setup::new();
        let manager = setup.manager();

        // not a multiple of the lookback
        manager.process_recovered_sig(1, &setup.sign(288, id(1), block_hash(296)));
        assert_eq!(setup.peers.score_of(1), 10);

        // unknown block
        manager.process_recovered_sig(2, &setup.sign(288, id(2), H256::repeat_byte(0xab)));
        assert_eq!(setup.peers.score_of(2), 10);

        // known but not in the active chain
        let side = BlockIndex {
            hash: H256::repeat_byte(0xcd),
            height: 295,
            valid_scripts: true,
        };
        setup.chain.add_side_block(side);
        manager.process_recovered_sig(3, &setup.sign(288, id(3), side.hash));
        assert_eq!(setup.peers.score_of(3), 10);

        setup.chain.set_valid(290, false);
        manager.process_recovered_sig(4, &setup.sign(288, id(4), block_hash(290)));
        assert_eq!(setup.peers.score_of(4), 10);

        for n in 1..=4 {
            assert!(!manager.has_recovered_sig_for_id(&id(n)));
        }

        manager.process_recovered_sig(5, &setup.sign(288, id(5), block_hash(285)));
        assert_eq!(setup.peers.score_of(5), 0);
        assert!(manager.has_recovered_sig_for_id(&id(5)));
    }

    #[test]
    fn first_recovered_sig_for_an_id_wins() {
        let setup = Setup::new();
        let manager = setup.manager();
        let listener = Arc::new(Collect::default());
        manager.register_recovered_sigs_listener(listener.clone());

        manager.process_recovered_sig(1, &setup.sign(288, id(1), block_hash(295)));
        manager.process_recovered_sig(2, &setup.sign(288, id(1), block_hash(290)));

        assert!(manager.has_recovered_sig(&id(1), &block_hash(295)));
        assert!(!manager.has_recovered_sig(&id(1), &block_hash(290)));
        assert!(manager.is_conflicting(&id(1), &block_hash(290)));
        assert!(!manager.is_conflicting(&id(1), &block_hash(295)));
        assert!(!manager.is_conflicting(&id(2), &block_hash(295)));

        assert_eq!(listener.0.lock().len(), 1);
        assert_eq!(setup.peers.score_of(2), 0);
    }

    #[test]
    fn reconstructed_sigs_are_trusted() {
        let setup = Setup::new();
        let manager = setup.manager();
        let rec_sig = setup.sign(288, id(1), block_hash(295));

        manager.push_reconstructed_recovered_sig(rec_sig.clone());
        assert!(manager.already_have(rec_sig.hash()));

        // the same signature arriving from a peer is not queued again
        manager.process_message_recovered_sig(3, rec_sig.clone());
        assert!(manager.collect_pending_recovered_sigs_to_verify(32).0.is_empty());

        manager.process_pending_recovered_sigs();
        assert!(manager.has_recovered_sig(&id(1), &block_hash(295)));
        assert!(setup.peers.misbehaving.lock().is_empty());
    }

    #[test]
    fn stale_quorums_are_dropped_without_penalty() {
        let setup = Setup::new();
        let manager = setup.manager();

        let inactive = setup.sign(168, id(1), block_hash(295));
        assert_eq!(
            manager.pre_verify_recovered_sig(&inactive).err(),
            Some(Rejected::InactiveQuorum(block_hash(168)))
        );
        let unknown = RecoveredSig::new(H256::repeat_byte(0xee), id(2), block_hash(295), *inactive.sig());
        assert_eq!(
            manager.pre_verify_recovered_sig(&unknown).err(),
            Some(Rejected::UnknownQuorum(H256::repeat_byte(0xee)))
        );

        manager.process_message(1, QSIGREC, &inactive.encode());
        manager.process_message(1, QSIGREC, &unknown.encode());
        manager.process_pending_recovered_sigs();

        assert!(!manager.has_recovered_sig_for_id(&id(1)));
        assert!(!manager.has_recovered_sig_for_id(&id(2)));
        assert_eq!(setup.peers.score_of(1), 0);
    }

    #[test]
    fn quorum_activity_is_checked_again_on_acceptance() {
        let setup = Setup::new();
        let manager = setup.manager();
        let listener = Arc::new(Collect::default());
        manager.register_recovered_sigs_listener(listener.clone());

        // verified while its quorum was active, accepted after it rotated out
        let rec_sig = setup.sign(168, id(1), block_hash(295));
        assert!(!manager.is_quorum_active(&block_hash(168)));
        manager.process_recovered_sig(1, &rec_sig);

        assert!(!manager.has_recovered_sig_for_id(&id(1)));
        assert!(!manager.already_have(rec_sig.hash()));
        assert_eq!(setup.peers.score_of(1), 0);
        assert!(setup.peers.forgotten.lock().contains(&(1, *rec_sig.hash())));
        assert!(setup.peers.relayed.lock().is_empty());
        assert!(listener.0.lock().is_empty());
    }

    #[test]
    fn activity_check_waits_for_chain_lock() {
        let setup = Setup::new();
        let manager = setup.manager();
        let (tx, rx) = std::sync::mpsc::channel();

        let chain = ChainState::lock(&*setup.chain).lock();
        let checker = {
            let manager = manager.clone();
            thread::spawn(move || tx.send(manager.is_quorum_active(&block_hash(288))))
        };
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        drop(chain);
        assert!(rx.recv_timeout(Duration::from_secs(10)).unwrap());
        checker.join().unwrap().unwrap();
    }

    #[test]
    fn failed_store_lets_peers_resend() {
        let setup = Setup::new();
        let db = MemDb::new();
        let manager = setup.manager_on(&db, SigningConfig::default(), true);
        let rec_sig = setup.sign(288, id(1), block_hash(295));

        db.set_fail_writes(true);
        manager.process_message_recovered_sig(7, rec_sig.clone());
        setup.peers.forgotten.lock().clear();
        manager.process_pending_recovered_sigs();
        assert!(!manager.has_recovered_sig_for_id(&id(1)));
        assert!(!manager.already_have(rec_sig.hash()));
        assert!(setup.peers.forgotten.lock().contains(&(7, *rec_sig.hash())));
        assert!(setup.peers.relayed.lock().is_empty());

        // a reconstructed copy does not linger either
        manager.push_reconstructed_recovered_sig(rec_sig.clone());
        manager.process_recovered_sig(LOCAL_NODE, &rec_sig);
        assert!(!manager.already_have(rec_sig.hash()));

        db.set_fail_writes(false);
        manager.process_message_recovered_sig(7, rec_sig.clone());
        manager.process_pending_recovered_sigs();
        assert!(manager.has_recovered_sig(&id(1), &block_hash(295)));
        assert_eq!(setup.peers.score_of(7), 0);
    }

    #[test]
    fn storage_runs_outside_the_intake_lock() {
        let setup = Setup::new();
        let manager = setup.manager();
        let rec_sig = setup.sign(288, id(2), block_hash(295));

        let pending = manager.pending.lock();
        thread::scope(|scope| {
            let voter = scope.spawn(|| manager.async_sign_if_member(&id(1), &block_hash(295), None, false));
            assert!(voter.join().unwrap().unwrap());
            assert!(manager.has_voted_on_id(&id(1)));

            let acceptor = scope.spawn(|| manager.process_recovered_sig(1, &rec_sig));
            let deadline = Instant::now() + Duration::from_secs(10);
            while !manager.has_recovered_sig_for_id(&id(2)) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
            assert!(manager.has_recovered_sig_for_id(&id(2)));

            drop(pending);
            acceptor.join().unwrap();
        });
        assert!(setup.peers.relayed.lock().contains(&Inv::new(InvKind::QuorumRecoveredSig, *rec_sig.hash())));
    }

    #[test]
    fn malformed_payload_is_punished() {
        let setup = Setup::new();
        let manager = setup.manager();

        manager.process_message(4, QSIGREC, &[1, 2, 3]);
        assert_eq!(setup.peers.score_of(4), 100);

        manager.process_message(4, "qcontrib", &[1, 2, 3]);
        assert_eq!(setup.peers.score_of(4), 100);
    }

    #[test]
    fn batches_are_bounded() {
        let setup = Setup::new();
        let manager = setup.manager();

        for n in 0..40u8 {
            let rec_sig = setup.sign(288, id(n), block_hash(295));
            manager.process_message_recovered_sig(i64::from(n % 4), rec_sig);
        }

        let (by_node, quorums) = manager.collect_pending_recovered_sigs_to_verify(32);
        assert_eq!(by_node.values().map(Vec::len).sum::<usize>(), 32);
        assert_eq!(quorums.len(), 1);

        let (rest, _) = manager.collect_pending_recovered_sigs_to_verify(32);
        assert_eq!(rest.values().map(Vec::len).sum::<usize>(), 8);
    }

    #[test]
    fn votes_once_per_id() {
        let setup = Setup::new();
        let manager = setup.manager();
        let msg_a = block_hash(295);
        let msg_b = block_hash(290);

        assert!(manager.async_sign_if_member(&id(1), &msg_a, None, false).unwrap());
        assert_eq!(manager.get_vote_for_id(&id(1)).unwrap(), Some(msg_a));
        assert_eq!(setup.broadcaster.signed.lock().len(), 1);

        // conflicting vote
        assert!(!manager.async_sign_if_member(&id(1), &msg_b, None, true).unwrap());
        assert_eq!(manager.get_vote_for_id(&id(1)).unwrap(), Some(msg_a));

        // same vote again
        assert!(!manager.async_sign_if_member(&id(1), &msg_a, None, false).unwrap());
        assert!(manager.async_sign_if_member(&id(1), &msg_a, None, true).unwrap());
        assert_eq!(setup.broadcaster.signed.lock().len(), 2);
        assert_eq!(*setup.broadcaster.re_announced.lock(), vec![(id(1), msg_a)]);

        // pinned quorum
        assert!(
            manager
                .async_sign_if_member(&id(2), &msg_a, Some(&block_hash(168)), false)
                .unwrap()
        );
        assert_eq!(setup.broadcaster.signed.lock()[2], (block_hash(168), id(2), msg_a));

        assert!(
            !manager
                .async_sign_if_member(&id(3), &msg_a, Some(&H256::repeat_byte(0xee)), false)
                .unwrap()
        );
        assert!(!manager.has_voted_on_id(&id(3)));
    }

    #[test]
    fn recovered_sig_makes_signing_unnecessary() {
        let setup = Setup::new();
        let manager = setup.manager();
        manager.process_recovered_sig(1, &setup.sign(288, id(1), block_hash(295)));

        assert!(manager.async_sign_if_member(&id(1), &block_hash(295), None, false).unwrap());
        assert!(setup.broadcaster.signed.lock().is_empty());
    }

    #[test]
    fn only_masternodes_sign() {
        let setup = Setup::new();
        let manager = setup.manager_with(SigningConfig::default(), false);

        assert!(!manager.async_sign_if_member(&id(1), &block_hash(295), None, false).unwrap());
        assert!(!manager.has_voted_on_id(&id(1)));
        assert!(setup.broadcaster.signed.lock().is_empty());
    }

    #[test]
    fn cleanup_is_rate_limited() {
        let setup = Setup::new();
        let manager = setup.manager_with(
            SigningConfig {
                max_recovered_sigs_age: 2,
            },
            true,
        );

        manager.process_recovered_sig(1, &setup.sign(288, id(1), block_hash(295)));
        manager.async_sign_if_member(&id(9), &block_hash(295), None, false).unwrap();
        setup.clock.advance_millis(3_000);
        manager.cleanup().unwrap();
        assert!(!manager.has_recovered_sig_for_id(&id(1)));
        assert!(!manager.has_voted_on_id(&id(9)));

        manager.process_recovered_sig(1, &setup.sign(288, id(2), block_hash(295)));
        setup.clock.advance_millis(3_000);
        manager.cleanup().unwrap();
        assert!(manager.has_recovered_sig_for_id(&id(2)));

        setup.clock.advance_millis(3_000);
        manager.cleanup().unwrap();
        assert!(!manager.has_recovered_sig_for_id(&id(2)));
    }

    #[test]
    fn truncated_sig_stays_known() {
        let setup = Setup::new();
        let manager = setup.manager();
        let rec_sig = setup.sign(288, id(1), block_hash(295));
        manager.process_recovered_sig(1, &rec_sig);

        manager.truncate_recovered_sig(&id(1)).unwrap();
        assert!(manager.already_have(rec_sig.hash()));
        assert_eq!(manager.get_recovered_sig_for_id(&id(1)).unwrap(), None);
    }

    #[test]
    fn worker_processes_queued_sigs() {
        let setup = Setup::new();
        let manager = setup.manager();
        manager.start_worker_thread().unwrap();
        let manager = scopeguard::guard(manager, |manager| manager.stop_worker_thread());

        manager.process_message_recovered_sig(1, setup.sign(288, id(1), block_hash(295)));

        let deadline = Instant::now() + Duration::from_secs(10);
        while !manager.has_recovered_sig_for_id(&id(1)) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(manager.has_recovered_sig_for_id(&id(1)));
    }
}
