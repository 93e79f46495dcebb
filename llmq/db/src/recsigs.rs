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

//! Persistent store of recovered signatures and local signing votes.
//!
//! One ordered store holds several logical indices, see [`Key`]:
//! by request id, by `(id, msg_hash)`, by object hash, by sign hash and by
//! insertion time. Votes have their own id and time indices.

use crate::{DbError, KVDatabase, Key, KeyTag, WriteBatch};
use llmq_common::{Clock, H256, RecoveredSig};
use lru::LruCache;
use parity_scale_codec::{Decode, Encode};
use parking_lot::Mutex;
use std::{num::NonZeroUsize, sync::Arc};

pub const RECOVERED_SIGS_CACHE_SIZE: usize = 30_000;

/// Deletion batches are flushed once they carry this many bytes.
const MAX_BATCH_SIZE: usize = 1 << 24;

/// Expired entries loaded per cleanup pass.
pub const CLEANUP_PASS_SIZE: usize = 10_000;

struct ExistenceCaches {
    for_id: LruCache<(H256, H256), bool>,
    for_session: LruCache<H256, bool>,
    for_hash: LruCache<H256, bool>,
}

impl ExistenceCaches {
    fn new() -> Self {
        let cap = NonZeroUsize::new(RECOVERED_SIGS_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            for_id: LruCache::new(cap),
            for_session: LruCache::new(cap),
            for_hash: LruCache::new(cap),
        }
    }
}

#[derive(derive_more::Debug)]
#[debug("RecoveredSigsDb")]
pub struct RecoveredSigsDb {
    db: Box<dyn KVDatabase>,
    clock: Arc<dyn Clock>,
    /// Serializes writers and guards the existence caches.
    caches: Mutex<ExistenceCaches>,
    pass_size: usize,
}

impl RecoveredSigsDb {
    pub fn new(db: Box<dyn KVDatabase>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            caches: Mutex::new(ExistenceCaches::new()),
            pass_size: CLEANUP_PASS_SIZE,
        }
    }

    /// Bounds how many expired entries a cleanup holds in memory at once.
    pub fn with_cleanup_pass_size(mut self, pass_size: usize) -> Self {
        self.pass_size = pass_size.max(1);
        self
    }

    pub fn has_recovered_sig(&self, id: &H256, msg_hash: &H256) -> bool {
        let mut caches = self.caches.lock();
        if let Some(&known) = caches.for_id.get(&(*id, *msg_hash)) {
            return known;
        }

        let exists = self.db.contains(&Key::RecoveredSigForMsg(*id, *msg_hash).to_bytes());
        caches.for_id.put((*id, *msg_hash), exists);
        exists
    }

    pub fn has_recovered_sig_for_id(&self, id: &H256) -> bool {
        self.db.contains(&Key::RecoveredSig(*id).to_bytes())
    }

    pub fn has_recovered_sig_for_session(&self, sign_hash: &H256) -> bool {
        let mut caches = self.caches.lock();
        if let Some(&known) = caches.for_session.get(sign_hash) {
            return known;
        }

        let exists = self.db.contains(&Key::RecoveredSigBySession(*sign_hash).to_bytes());
        caches.for_session.put(*sign_hash, exists);
        exists
    }

    /// Stays true after [`Self::truncate_recovered_sig`].
    pub fn has_recovered_sig_for_hash(&self, hash: &H256) -> bool {
        let mut caches = self.caches.lock();
        if let Some(&known) = caches.for_hash.get(hash) {
            return known;
        }

        let exists = self.db.contains(&Key::RecoveredSigIdByHash(*hash).to_bytes());
        caches.for_hash.put(*hash, exists);
        exists
    }

    pub fn get_recovered_sig_by_id(&self, id: &H256) -> Result<Option<RecoveredSig>, DbError> {
        self.read(&Key::RecoveredSig(*id))
    }

    pub fn get_recovered_sig_by_hash(&self, hash: &H256) -> Result<Option<RecoveredSig>, DbError> {
        match self.read::<H256>(&Key::RecoveredSigIdByHash(*hash))? {
            Some(id) => self.get_recovered_sig_by_id(&id),
            None => Ok(None),
        }
    }

    /// Commits all indices of `rec_sig` in one batch.
    ///
    /// Returns `false` without writing when the id already has a signature,
    /// so the first signature for an id stays authoritative.
    pub fn write_recovered_sig(&self, rec_sig: &RecoveredSig) -> Result<bool, DbError> {
        let mut caches = self.caches.lock();

        let id = *rec_sig.id();
        let msg_hash = *rec_sig.msg_hash();
        let sign_hash = rec_sig.sign_hash();
        if self.has_recovered_sig_for_id(&id) {
            tracing::debug!(%id, "recovered sig for id already stored");
            return Ok(false);
        }

        let now = self.now();
        let mut batch = WriteBatch::new();
        batch.write(&Key::RecoveredSig(id), rec_sig);
        batch.write(&Key::RecoveredSigForMsg(id, msg_hash), &now);
        batch.write(&Key::RecoveredSigIdByHash(*rec_sig.hash()), &id);
        batch.write(&Key::RecoveredSigBySession(sign_hash), &1u8);
        batch.write(&Key::RecoveredSigByTime(now, id), &1u8);
        self.db.write_batch(batch, false)?;

        caches.for_id.put((id, msg_hash), true);
        caches.for_session.put(sign_hash, true);
        caches.for_hash.put(*rec_sig.hash(), true);
        Ok(true)
    }

    /// Drops the signature payload but keeps the hash index, so the
    /// signature is still recognized as known.
    pub fn truncate_recovered_sig(&self, id: &H256) -> Result<(), DbError> {
        let mut caches = self.caches.lock();
        let mut batch = WriteBatch::new();
        self.remove(&mut batch, &mut caches, id, false, false)?;
        self.db.write_batch(batch, false)
    }

    /// Drops every index of the signature stored for `id`.
    pub fn remove_recovered_sig(&self, id: &H256) -> Result<(), DbError> {
        let mut caches = self.caches.lock();
        let mut batch = WriteBatch::new();
        self.remove(&mut batch, &mut caches, id, true, true)?;
        self.db.write_batch(batch, false)
    }

    /// Removes signatures written more than `max_age` seconds ago.
    ///
    /// Works in passes of at most `pass_size` entries, each committed before
    /// the next one is loaded.
    pub fn cleanup_old_recovered_sigs(&self, max_age: i64) -> Result<usize, DbError> {
        let mut caches = self.caches.lock();
        let end_time = self.clock.now() - max_age;

        let mut total = 0;
        loop {
            let expired = self.time_index(KeyTag::RecoveredSigByTime, end_time);
            if expired.is_empty() {
                break;
            }

            let mut batch = WriteBatch::new();
            for (_, id) in &expired {
                self.remove(&mut batch, &mut caches, id, true, false)?;
                if batch.size_estimate() >= MAX_BATCH_SIZE {
                    self.db.write_batch(std::mem::take(&mut batch), false)?;
                }
            }
            for (time, id) in &expired {
                batch.erase(&Key::RecoveredSigByTime(*time, *id));
            }
            self.db.write_batch(batch, false)?;

            total += expired.len();
            if expired.len() < self.pass_size {
                break;
            }
        }

        if total > 0 {
            tracing::debug!(count = total, "removed old recovered sigs");
        }
        Ok(total)
    }

    pub fn has_voted_on_id(&self, id: &H256) -> bool {
        self.db.contains(&Key::Vote(*id).to_bytes())
    }

    pub fn get_vote_for_id(&self, id: &H256) -> Result<Option<H256>, DbError> {
        self.read(&Key::Vote(*id))
    }

    pub fn write_vote_for_id(&self, id: &H256, msg_hash: &H256) -> Result<(), DbError> {
        let _guard = self.caches.lock();
        let mut batch = WriteBatch::new();
        batch.write(&Key::Vote(*id), msg_hash);
        batch.write(&Key::VoteByTime(self.now(), *id), &1u8);
        self.db.write_batch(batch, false)
    }

    /// Removes votes cast more than `max_age` seconds ago.
    pub fn cleanup_old_votes(&self, max_age: i64) -> Result<usize, DbError> {
        let _guard = self.caches.lock();
        let end_time = self.clock.now() - max_age;

        let mut total = 0;
        loop {
            let expired = self.time_index(KeyTag::VoteByTime, end_time);
            if expired.is_empty() {
                break;
            }

            let mut batch = WriteBatch::new();
            for (time, id) in &expired {
                batch.erase(&Key::VoteByTime(*time, *id));
                batch.erase(&Key::Vote(*id));
                if batch.size_estimate() >= MAX_BATCH_SIZE {
                    self.db.write_batch(std::mem::take(&mut batch), false)?;
                }
            }
            self.db.write_batch(batch, false)?;

            total += expired.len();
            if expired.len() < self.pass_size {
                break;
            }
        }

        if total > 0 {
            tracing::debug!(count = total, "removed old votes");
        }
        Ok(total)
    }

    fn remove(
        &self,
        batch: &mut WriteBatch,
        caches: &mut ExistenceCaches,
        id: &H256,
        delete_hash_key: bool,
        delete_time_key: bool,
    ) -> Result<(), DbError> {
        let Some(rec_sig) = self.get_recovered_sig_by_id(id)? else {
            return Ok(());
        };

        let msg_hash = *rec_sig.msg_hash();
        let sign_hash = rec_sig.sign_hash();
        let write_time: Option<u32> = if delete_time_key {
            self.read(&Key::RecoveredSigForMsg(*id, msg_hash))?
        } else {
            None
        };

        batch.erase(&Key::RecoveredSig(*id));
        batch.erase(&Key::RecoveredSigForMsg(*id, msg_hash));
        batch.erase(&Key::RecoveredSigBySession(sign_hash));
        if delete_hash_key {
            batch.erase(&Key::RecoveredSigIdByHash(*rec_sig.hash()));
        }
        if let Some(time) = write_time {
            batch.erase(&Key::RecoveredSigByTime(time, *id));
        }

        caches.for_id.pop(&(*id, msg_hash));
        caches.for_session.pop(&sign_hash);
        if delete_hash_key {
            caches.for_hash.pop(rec_sig.hash());
        }
        Ok(())
    }

    /// Up to `pass_size` entries of a time index older than `end_time`,
    /// oldest first.
    fn time_index(&self, tag: KeyTag, end_time: i64) -> Vec<(u32, H256)> {
        let prefix = tag.prefix();
        self.db
            .iter_prefix(&prefix)
            .map_while(|(raw, _)| match Key::from_bytes(&raw)? {
                Key::RecoveredSigByTime(time, id) | Key::VoteByTime(time, id) => Some((time, id)),
                _ => None,
            })
            .take_while(|(time, _)| i64::from(*time) < end_time)
            .take(self.pass_size)
            .collect()
    }

    fn read<V: Decode>(&self, key: &Key) -> Result<Option<V>, DbError> {
        self.db
            .get(&key.to_bytes())
            .map(|raw| {
                V::decode(&mut raw.as_slice()).map_err(|source| DbError::Corrupted {
                    key: key.to_string(),
                    source,
                })
            })
            .transpose()
    }

    fn now(&self) -> u32 {
        u32::try_from(self.clock.now().max(0)).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemDb;
    use llmq_common::{bls::BlsSignature, test_utils::MockClock};

    fn setup() -> (RecoveredSigsDb, Arc<MockClock>, MemDb) {
        let mem = MemDb::new();
        let clock = Arc::new(MockClock::new(1_000_000));
        let db = RecoveredSigsDb::new(mem.clone_boxed(), clock.clone());
        (db, clock, mem)
    }

    fn rec_sig(id: u8, msg: u8) -> RecoveredSig {
        RecoveredSig::new(
            H256::repeat_byte(0xaa),
            H256::repeat_byte(id),
            H256::repeat_byte(msg),
            BlsSignature::default(),
        )
    }

    #[test]
    fn first_signature_for_id_wins() {
        let (db, _, _) = setup();
        let first = rec_sig(1, 10);
        let conflicting = rec_sig(1, 11);

        assert!(db.write_recovered_sig(&first).unwrap());
        assert!(!db.write_recovered_sig(&conflicting).unwrap());
        assert!(!db.write_recovered_sig(&first).unwrap());

        let id = H256::repeat_byte(1);
        assert_eq!(db.get_recovered_sig_by_id(&id).unwrap(), Some(first.clone()));
        assert!(db.has_recovered_sig(&id, first.msg_hash()));
        assert!(!db.has_recovered_sig(&id, conflicting.msg_hash()));
        assert!(!db.has_recovered_sig_for_hash(conflicting.hash()));
        assert!(!db.has_recovered_sig_for_session(&conflicting.sign_hash()));
    }

    #[test]
    fn indices_are_written_together() {
        let (db, _, _) = setup();
        let sig = rec_sig(2, 20);
        db.write_recovered_sig(&sig).unwrap();

        assert!(db.has_recovered_sig_for_id(sig.id()));
        assert!(db.has_recovered_sig_for_session(&sig.sign_hash()));
        assert!(db.has_recovered_sig_for_hash(sig.hash()));
        assert_eq!(db.get_recovered_sig_by_hash(sig.hash()).unwrap(), Some(sig));
    }

    #[test]
    fn truncate_keeps_hash_index() {
        let (db, _, _) = setup();
        let sig = rec_sig(3, 30);
        db.write_recovered_sig(&sig).unwrap();

        db.truncate_recovered_sig(sig.id()).unwrap();

        assert!(db.has_recovered_sig_for_hash(sig.hash()));
        assert_eq!(db.get_recovered_sig_by_id(sig.id()).unwrap(), None);
        assert!(!db.has_recovered_sig(sig.id(), sig.msg_hash()));
        assert!(!db.has_recovered_sig_for_session(&sig.sign_hash()));
    }

    #[test]
    fn remove_drops_every_index() {
        let (db, _, mem) = setup();
        let sig = rec_sig(4, 40);
        db.write_recovered_sig(&sig).unwrap();
        assert!(db.has_recovered_sig_for_hash(sig.hash()));

        db.remove_recovered_sig(sig.id()).unwrap();

        assert!(!db.has_recovered_sig_for_hash(sig.hash()));
        assert!(!db.has_recovered_sig_for_id(sig.id()));
        assert!(mem.is_empty());
    }

    #[test]
    fn cleanup_stops_at_first_fresh_entry() {
        let (db, clock, _) = setup();
        let sigs = [rec_sig(5, 50), rec_sig(6, 60), rec_sig(7, 70)];

        for (offset, sig) in sigs.iter().enumerate() {
            clock.set(1_000_000 + 100 * offset as i64);
            db.write_recovered_sig(sig).unwrap();
        }

        // now - max_age lands between the first and the second write
        clock.set(1_000_500);
        assert_eq!(db.cleanup_old_recovered_sigs(450).unwrap(), 1);

        assert_eq!(db.get_recovered_sig_by_id(sigs[0].id()).unwrap(), None);
        assert!(!db.has_recovered_sig_for_hash(sigs[0].hash()));
        for sig in &sigs[1..] {
            assert_eq!(db.get_recovered_sig_by_id(sig.id()).unwrap().as_ref(), Some(sig));
        }
    }

    #[test]
    fn cleanup_skips_truncated_payloads() {
        let (db, clock, _) = setup();
        let sig = rec_sig(8, 80);
        db.write_recovered_sig(&sig).unwrap();
        db.truncate_recovered_sig(sig.id()).unwrap();

        clock.set(2_000_000);
        assert_eq!(db.cleanup_old_recovered_sigs(10).unwrap(), 1);
        assert_eq!(db.cleanup_old_recovered_sigs(10).unwrap(), 0);
    }

    #[test]
    fn large_cleanup_completes_over_several_passes() {
        let (db, clock, mem) = setup();
        let db = db.with_cleanup_pass_size(3);

        let expired: Vec<_> = (10..18).map(|id| rec_sig(id, id)).collect();
        for (offset, sig) in expired.iter().enumerate() {
            clock.set(1_000_000 + offset as i64);
            db.write_recovered_sig(sig).unwrap();
            db.write_vote_for_id(sig.id(), sig.msg_hash()).unwrap();
        }
        clock.set(1_000_100);
        let fresh = rec_sig(30, 30);
        db.write_recovered_sig(&fresh).unwrap();

        clock.set(1_000_150);
        assert_eq!(db.cleanup_old_recovered_sigs(100).unwrap(), expired.len());
        assert_eq!(db.cleanup_old_votes(100).unwrap(), expired.len());

        for sig in &expired {
            assert!(!db.has_recovered_sig_for_id(sig.id()));
            assert!(!db.has_recovered_sig_for_hash(sig.hash()));
            assert!(!db.has_voted_on_id(sig.id()));
        }
        assert!(db.has_recovered_sig_for_id(fresh.id()));
        assert_eq!(db.cleanup_old_recovered_sigs(100).unwrap(), 0);

        // id, msg, hash, session and time keys of the fresh signature
        assert_eq!(mem.len(), 5);
    }

    #[test]
    fn votes_are_cleaned_by_age() {
        let (db, clock, _) = setup();
        let (old, fresh) = (H256::repeat_byte(1), H256::repeat_byte(2));

        db.write_vote_for_id(&old, &H256::repeat_byte(10)).unwrap();
        clock.set(1_000_100);
        db.write_vote_for_id(&fresh, &H256::repeat_byte(20)).unwrap();

        assert!(db.has_voted_on_id(&old));
        assert_eq!(db.get_vote_for_id(&fresh).unwrap(), Some(H256::repeat_byte(20)));

        assert_eq!(db.cleanup_old_votes(50).unwrap(), 1);
        assert!(!db.has_voted_on_id(&old));
        assert!(db.has_voted_on_id(&fresh));
    }

    #[test]
    fn failed_write_leaves_caches_cold() {
        let (db, _, mem) = setup();
        let sig = rec_sig(9, 90);

        mem.set_fail_writes(true);
        assert!(db.write_recovered_sig(&sig).is_err());
        mem.set_fail_writes(false);

        assert!(!db.has_recovered_sig_for_hash(sig.hash()));
        assert!(db.write_recovered_sig(&sig).unwrap());
    }
}
