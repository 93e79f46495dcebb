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

//! Drives DKG sessions through their phases.
//!
//! The phase is derived from the block height alone: a round starts at every
//! multiple of `dkg_interval` and every phase lasts `dkg_phase_blocks`
//! blocks. One worker thread runs the rounds. It executes the local action of
//! each phase, then processes pending messages in small batches until the
//! chain moves to the next phase.

use crate::{
    DkgConfig, DkgContext, DkgContributions, DkgError, PendingQueues, SessionMessage, SimulatedErrors,
    session::DkgSession,
};
use llmq_common::{
    ActiveMasternode, BlockIndex, FinalCommitment, H256, LlmqParams, NodeId,
    batch::BatchVerifier,
    messages::{Complaint, Contribution, DkgMessageKind, Justification, PrematureCommitment},
    network::LOCAL_NODE,
    serialize_hash,
};
use parking_lot::Mutex;
use std::{
    fmt,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// Messages taken from a queue per batch.
const PENDING_BATCH_SIZE: usize = 8;
const IDLE_SLEEP: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QuorumPhase {
    Initialized = 1,
    Contribute,
    Complain,
    Justify,
    Commit,
    Finalize,
    Idle,
}

impl QuorumPhase {
    const ALL: [QuorumPhase; 7] = [
        QuorumPhase::Initialized,
        QuorumPhase::Contribute,
        QuorumPhase::Complain,
        QuorumPhase::Justify,
        QuorumPhase::Commit,
        QuorumPhase::Finalize,
        QuorumPhase::Idle,
    ];

    fn from_index(index: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|phase| *phase as u32 == index)
    }
}

/// Order in which final commitment candidates are handed to the miner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, derive_more::Display)]
pub enum FinalCommitmentPolicy {
    /// All candidates, most signers first.
    #[default]
    #[display("most-signers")]
    MostSigners,
    /// Only the candidate with the most signers.
    #[display("best-only")]
    BestOnly,
}

impl FinalCommitmentPolicy {
    /// Sorts by signer count, then valid member count, both descending, then
    /// by commitment hash.
    pub fn select(self, mut candidates: Vec<FinalCommitment>) -> Vec<FinalCommitment> {
        candidates.sort_by_cached_key(|commitment| {
            (
                std::cmp::Reverse(commitment.count_signers()),
                std::cmp::Reverse(commitment.count_valid_members()),
                commitment.commitment_hash(),
            )
        });
        if self == Self::BestOnly {
            candidates.truncate(1);
        }
        candidates
    }
}

impl FromStr for FinalCommitmentPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::MostSigners, Self::BestOnly]
            .into_iter()
            .find(|policy| policy.to_string() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown final commitment policy: {s}"))
    }
}

#[derive(Clone, Copy, Debug)]
struct PhaseState {
    height: u32,
    phase: QuorumPhase,
    quorum_hash: H256,
}

pub struct DkgSessionHandler {
    params: LlmqParams,
    config: DkgConfig,
    active: Option<ActiveMasternode>,
    context: DkgContext,
    contributions: Arc<DkgContributions>,
    queues: Arc<PendingQueues>,

    state: Mutex<PhaseState>,
    /// Phase the worker is executing.
    worker_phase: Mutex<Option<QuorumPhase>>,
    session: Mutex<Option<DkgSession>>,
    simulated_errors: Mutex<SimulatedErrors>,

    stop: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for DkgSessionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = *self.state.lock();
        f.debug_struct("DkgSessionHandler")
            .field("llmq", &self.params.name)
            .field("height", &state.height)
            .field("phase", &state.phase)
            .finish()
    }
}

impl DkgSessionHandler {
    pub fn new(
        params: LlmqParams,
        config: DkgConfig,
        active: Option<ActiveMasternode>,
        context: DkgContext,
        contributions: Arc<DkgContributions>,
    ) -> Self {
        Self {
            queues: Arc::new(PendingQueues::new(&params)),
            params,
            config,
            active,
            context,
            contributions,
            state: Mutex::new(PhaseState {
                height: 0,
                phase: QuorumPhase::Idle,
                quorum_hash: H256::zero(),
            }),
            worker_phase: Mutex::new(None),
            session: Mutex::new(None),
            simulated_errors: Mutex::new(SimulatedErrors::default()),
            stop: AtomicBool::new(false),
            thread: Mutex::new(None),
        }
    }

    pub fn params(&self) -> &LlmqParams {
        &self.params
    }

    pub fn set_simulated_errors(&self, errors: SimulatedErrors) {
        *self.simulated_errors.lock() = errors;
    }

    pub fn updated_block_tip(&self, block: &BlockIndex) {
        let stage = block.height % self.params.dkg_interval;
        let Some(base) = self.context.chain.ancestor(block, block.height - stage) else {
            tracing::warn!(height = block.height, "quorum base block not found");
            return;
        };

        let mut state = self.state.lock();
        state.height = block.height;
        state.quorum_hash = base.hash;

        let phase = (stage % self.params.dkg_phase_blocks == 0)
            .then(|| QuorumPhase::from_index(stage / self.params.dkg_phase_blocks + 1))
            .flatten();
        if let Some(phase) = phase {
            state.phase = phase;
        }

        tracing::debug!(
            llmq = self.params.name,
            height = block.height,
            phase = ?state.phase,
            quorum = %state.quorum_hash,
            "DKG block tip"
        );
    }

    pub fn phase_and_quorum_hash(&self) -> (QuorumPhase, H256) {
        let state = self.state.lock();
        (state.phase, state.quorum_hash)
    }

    pub fn worker_phase(&self) -> Option<QuorumPhase> {
        *self.worker_phase.lock()
    }

    /// Queues a raw message received from `peer`. Nothing is decoded here.
    pub fn process_message(&self, peer: NodeId, kind: DkgMessageKind, payload: Vec<u8>) {
        let outcome = self.queues.get(kind).push(peer, payload);
        if peer != LOCAL_NODE {
            self.context.peers.forget_tx_hash(peer, &outcome.hash());
        }
    }

    pub fn already_have(&self, hash: &H256) -> bool {
        self.queues.has_seen(hash)
    }

    /// Runs `f` on the current session, if there is one.
    pub fn with_session<R>(&self, f: impl FnOnce(&DkgSession) -> R) -> Option<R> {
        self.session.lock().as_ref().map(f)
    }

    #[cfg(test)]
    pub(crate) fn with_session_mut<R>(&self, f: impl FnOnce(&mut DkgSession) -> R) -> Option<R> {
        self.session.lock().as_mut().map(f)
    }

    pub fn start_thread(self: &Arc<Self>) -> Result<(), DkgError> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }

        self.stop.store(false, Ordering::SeqCst);
        let handler = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("llmq-dkg-{}", self.params.name))
            .spawn(move || handler.run())?;
        *thread = Some(handle);
        Ok(())
    }

    pub fn stop_thread(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let handle = self.thread.lock().take();
        if handle.is_some_and(|handle| handle.join().is_err()) {
            tracing::error!(llmq = self.params.name, "DKG thread panicked");
        }
    }

    fn run(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            if let Err(err) = self.handle_dkg_round() {
                tracing::debug!(llmq = self.params.name, %err, "DKG round aborted");
            }
        }
    }

    fn handle_dkg_round(&self) -> Result<(), DkgError> {
        *self.worker_phase.lock() = None;
        self.wait_for_next_phase(None, QuorumPhase::Initialized, H256::zero(), || false)?;

        self.queues.clear();
        let quorum_hash = self.state.lock().quorum_hash;
        if let Err(err) = self.init_new_quorum(&quorum_hash) {
            tracing::warn!(llmq = self.params.name, quorum = %quorum_hash, %err, "quorum initialization failed");
            self.wait_for_new_quorum(&quorum_hash)?;
            return Err(DkgError::Aborted("quorum initialization failed"));
        }
        *self.worker_phase.lock() = Some(QuorumPhase::Initialized);

        self.wait_for_next_phase(
            Some(QuorumPhase::Initialized),
            QuorumPhase::Contribute,
            quorum_hash,
            || false,
        )?;

        self.handle_phase(
            QuorumPhase::Contribute,
            QuorumPhase::Complain,
            quorum_hash,
            DkgSession::contribute,
            || self.process_pending_batch::<Contribution>(),
        )?;
        self.handle_phase(
            QuorumPhase::Complain,
            QuorumPhase::Justify,
            quorum_hash,
            DkgSession::verify_and_complain,
            || self.process_pending_batch::<Complaint>(),
        )?;
        self.handle_phase(
            QuorumPhase::Justify,
            QuorumPhase::Commit,
            quorum_hash,
            DkgSession::verify_and_justify,
            || self.process_pending_batch::<Justification>(),
        )?;
        self.handle_phase(
            QuorumPhase::Commit,
            QuorumPhase::Finalize,
            quorum_hash,
            DkgSession::verify_and_commit,
            || self.process_pending_batch::<PrematureCommitment>(),
        )?;

        *self.worker_phase.lock() = Some(QuorumPhase::Finalize);
        let candidates = self
            .with_session(DkgSession::finalize_commitments)
            .unwrap_or_default();
        for commitment in self.config.final_commitment_policy.select(candidates) {
            self.context.commitments.add_mineable_commitment(commitment);
        }

        Ok(())
    }

    pub(crate) fn init_new_quorum(&self, quorum_hash: &H256) -> Result<(), DkgError> {
        let base_block = self
            .context
            .chain
            .lookup_block(quorum_hash)
            .ok_or(DkgError::Aborted("unknown quorum base block"))?;
        let members = self.context.masternodes.quorum_members(&base_block);

        let mut session = DkgSession::new(
            self.params,
            self.config,
            self.contributions.clone(),
            self.context.peers.clone(),
            self.queues.clone(),
        )
        .with_simulated_errors(*self.simulated_errors.lock());
        session.init(base_block, members, self.active.as_ref())?;

        *self.session.lock() = Some(session);
        Ok(())
    }

    fn handle_phase(
        &self,
        phase: QuorumPhase,
        next: QuorumPhase,
        quorum_hash: H256,
        start: impl FnOnce(&mut DkgSession) -> Result<(), DkgError>,
        work: impl FnMut() -> bool,
    ) -> Result<(), DkgError> {
        *self.worker_phase.lock() = Some(phase);
        if let Some(session) = self.session.lock().as_mut() {
            start(session)?;
        }
        self.wait_for_next_phase(Some(phase), next, quorum_hash, work)
    }

    /// Returns once the chain reaches `next`, running `work` meanwhile.
    ///
    /// Aborts on stop, on a new quorum, or when the chain leaves `current`
    /// for anything but `next`.
    fn wait_for_next_phase(
        &self,
        current: Option<QuorumPhase>,
        next: QuorumPhase,
        expected_quorum_hash: H256,
        mut work: impl FnMut() -> bool,
    ) -> Result<(), DkgError> {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Err(DkgError::Aborted("stop requested"));
            }

            let (phase, quorum_hash) = self.phase_and_quorum_hash();
            if !expected_quorum_hash.is_zero() && quorum_hash != expected_quorum_hash {
                return Err(DkgError::Aborted("quorum hash changed"));
            }
            if phase == next {
                return Ok(());
            }
            if current.is_some_and(|current| current != phase) {
                return Err(DkgError::Aborted("unexpected phase"));
            }

            if !work() {
                thread::sleep(IDLE_SLEEP);
            }
        }
    }

    fn wait_for_new_quorum(&self, old_quorum_hash: &H256) -> Result<(), DkgError> {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Err(DkgError::Aborted("stop requested"));
            }
            if self.state.lock().quorum_hash != *old_quorum_hash {
                return Ok(());
            }
            thread::sleep(IDLE_SLEEP);
        }
    }

    /// Processes one batch of pending messages of kind `M`. Returns false
    /// when the queue was empty.
    pub fn process_pending_batch<M: SessionMessage>(&self) -> bool {
        let messages = self
            .queues
            .get(M::KIND)
            .pop_and_decode::<M>(PENDING_BATCH_SIZE);
        if messages.is_empty() {
            return false;
        }

        let peers = &self.context.peers;
        let mut guard = self.session.lock();
        let Some(session) = guard.as_mut() else {
            return true;
        };

        let mut verified = Vec::with_capacity(messages.len());
        let mut verifier = BatchVerifier::<NodeId, usize>::new(true);
        for (idx, (peer, message)) in messages.into_iter().enumerate() {
            let Some(message) = message else {
                tracing::debug!(peer, kind = ?M::KIND, "failed to decode message");
                peers.misbehaving(peer, 100, "undecodable DKG message");
                continue;
            };

            let hash = serialize_hash(&message);
            if peer != LOCAL_NODE {
                peers.forget_tx_hash(peer, &hash);
            }

            if let Err(rejected) = message.pre_verify(session) {
                tracing::trace!(peer, %hash, %rejected, "message failed pre-verification");
                if rejected.ban && peer != LOCAL_NODE {
                    peers.misbehaving(peer, 100, rejected.reason);
                }
                continue;
            }

            let Some(member) = session.member(&message.pro_tx_hash()) else {
                continue;
            };
            verifier.push_message(
                peer,
                idx,
                message.sign_hash(),
                *message.sig(),
                member.entry.pub_key_operator,
            );
            verified.push((peer, hash, message));
        }

        verifier.verify();
        for peer in &verifier.bad_sources {
            tracing::debug!(peer, kind = ?M::KIND, "invalid DKG message signature");
            if *peer != LOCAL_NODE {
                peers.misbehaving(*peer, 100, "invalid DKG message signature");
            }
        }
        for idx in &verifier.bad_messages {
            tracing::trace!(idx, "bad message in batch");
        }

        for (peer, hash, message) in verified {
            if verifier.bad_sources.contains(&peer) {
                continue;
            }
            if let Err(err) = message.receive(session, hash) {
                tracing::error!(%hash, %err, "failed to process DKG message");
            }
        }

        true
    }
}
