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

use crate::config::QuorumConfig;
use anyhow::{Context as _, Result};
use llmq_common::{BlockIndex, ChainState, Inv, InvKind, NodeId, messages::QSIGREC};
use llmq_db::{DkgContributionsDb, KVDatabase, MemDb};
use llmq_dkg::{DkgContext, DkgSessionManager};
use llmq_quorums::{QuorumManager, QuorumStores};
use llmq_signing::{SigSharesBroadcaster, SigningManager};
use std::sync::Arc;

/// Backing stores of the quorum core.
pub struct QuorumStorage {
    pub dkg_contributions: Box<dyn KVDatabase>,
    pub quorum_vvecs: Box<dyn KVDatabase>,
    pub quorum_sk_shares: Box<dyn KVDatabase>,
    pub recovered_sigs: Box<dyn KVDatabase>,
}

impl QuorumStorage {
    /// Separate in-memory stores.
    pub fn in_memory() -> Self {
        Self {
            dkg_contributions: MemDb::new().clone_boxed(),
            quorum_vvecs: MemDb::new().clone_boxed(),
            quorum_sk_shares: MemDb::new().clone_boxed(),
            recovered_sigs: MemDb::new().clone_boxed(),
        }
    }
}

/// Owns the managers of the quorum core and their worker threads.
pub struct QuorumContext {
    config: QuorumConfig,
    chain: Arc<dyn ChainState>,
    dkg: DkgSessionManager,
    quorums: Arc<QuorumManager>,
    signing: Arc<SigningManager>,
}

impl QuorumContext {
    pub fn new(
        config: QuorumConfig,
        context: DkgContext,
        storage: QuorumStorage,
        sig_shares: Arc<dyn SigSharesBroadcaster>,
    ) -> Self {
        let params = config.params;
        let my_pro_tx_hash = config.active.as_ref().map(|active| active.pro_tx_hash);

        let dkg = DkgSessionManager::new(
            params,
            config.dkg,
            config.active.clone(),
            context.clone(),
            DkgContributionsDb::new(storage.dkg_contributions),
        );
        let quorums = Arc::new(QuorumManager::new(
            params,
            my_pro_tx_hash,
            context.chain.clone(),
            context.masternodes.clone(),
            context.commitments.clone(),
            dkg.contributions().clone(),
            QuorumStores {
                vvecs: storage.quorum_vvecs,
                sk_shares: storage.quorum_sk_shares,
                cache_size: config.evodb_cache_size,
            },
        ));
        let signing = Arc::new(SigningManager::new(
            params,
            config.signing,
            my_pro_tx_hash,
            storage.recovered_sigs,
            context.chain.clone(),
            quorums.clone(),
            context.peers.clone(),
            sig_shares,
            context.clock.clone(),
        ));

        Self {
            config,
            chain: context.chain,
            dkg,
            quorums,
            signing,
        }
    }

    pub fn config(&self) -> &QuorumConfig {
        &self.config
    }

    pub fn dkg(&self) -> &DkgSessionManager {
        &self.dkg
    }

    pub fn quorums(&self) -> &Arc<QuorumManager> {
        &self.quorums
    }

    pub fn signing(&self) -> &Arc<SigningManager> {
        &self.signing
    }

    /// Prunes stale contributions and starts the worker threads.
    pub fn start(&self) -> Result<()> {
        let pruned = self
            .dkg
            .cleanup_old_contributions()
            .with_context(|| "failed to prune old DKG contributions")?;
        tracing::debug!(pruned, "pruned old DKG contributions");

        self.quorums.start();
        self.dkg
            .start_threads()
            .with_context(|| "failed to start DKG thread")?;
        self.signing
            .start_worker_thread()
            .with_context(|| "failed to start signing worker")?;

        tracing::info!(
            llmq_type = self.config.params.name,
            masternode = self.config.active.is_some(),
            "quorum core started"
        );
        Ok(())
    }

    /// Asks the signing worker to stop after its current batch.
    pub fn interrupt(&self) {
        self.signing.interrupt_worker_thread();
    }

    /// Joins every thread and flushes the quorum caches.
    pub fn stop(&self) {
        self.interrupt();
        self.dkg.stop_threads();
        self.signing.stop_worker_thread();
        self.quorums.stop();

        if let Err(err) = self.quorums.flush_cache_to_disk() {
            tracing::error!("failed to flush quorum caches: {err}");
        }
    }

    pub fn updated_block_tip(&self, block: &BlockIndex, initial_download: bool) {
        self.dkg.updated_block_tip(block, initial_download);
    }

    pub fn process_message(&self, peer: NodeId, command: &str, payload: Vec<u8>) {
        if command == QSIGREC {
            self.signing.process_message(peer, command, &payload);
        } else {
            self.dkg.process_message(peer, command, payload);
        }
    }

    pub fn already_have(&self, inv: &Inv) -> bool {
        match inv.kind {
            InvKind::QuorumRecoveredSig => self.signing.already_have(&inv.hash),
            _ => self.dkg.already_have(inv),
        }
    }

    /// Wipes the quorum contribution stores keeping their pending entries,
    /// forgets built quorums and drops recovered signatures and votes, all
    /// under the chain lock.
    pub fn rebuild_quorum_state(&self) -> Result<()> {
        let _chain = self.chain.lock().lock();

        self.quorums
            .rebuild()
            .with_context(|| "failed to rebuild quorum caches")?;
        self.signing
            .clear()
            .with_context(|| "failed to clear recovered signatures")?;

        tracing::info!("quorum state rebuilt");
        Ok(())
    }
}

impl Drop for QuorumContext {
    fn drop(&mut self) {
        self.stop();
    }
}
