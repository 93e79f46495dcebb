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

//! Bounded write-back cache over a [`KVDatabase`].
//!
//! Writes and erasures stay in memory until [`EvoDb::flush_cache_to_disk`]
//! commits them as one synced batch. The cache is an admission cache: once
//! more than `max_cache_size` entries are held, the oldest write is dropped
//! without being persisted. Callers needing durability flush explicitly.

use crate::{DbError, KVDatabase, WriteBatch};
use lru::LruCache;
use parity_scale_codec::{Decode, Encode};
use parking_lot::Mutex;
use std::{collections::HashSet, hash::Hash, num::NonZeroUsize};

struct State<K: Hash + Eq, V> {
    db: Box<dyn KVDatabase>,
    /// Pending writes. Reads use `peek`, so the order is insertion order.
    cache: LruCache<K, V>,
    erase: HashSet<K>,
    flush_before_read: bool,
}

#[derive(derive_more::Debug)]
#[debug("EvoDb({name})")]
pub struct EvoDb<K, V>
where
    K: Encode + Hash + Eq + Clone,
    V: Encode + Decode + Clone,
{
    name: &'static str,
    max_cache_size: usize,
    state: Mutex<State<K, V>>,
}

impl<K, V> EvoDb<K, V>
where
    K: Encode + Hash + Eq + Clone,
    V: Encode + Decode + Clone,
{
    /// `max_cache_size == 0` leaves the cache unbounded.
    pub fn new(name: &'static str, db: Box<dyn KVDatabase>, max_cache_size: usize) -> Self {
        let cache = match NonZeroUsize::new(max_cache_size) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };

        Self {
            name,
            max_cache_size,
            state: Mutex::new(State {
                db,
                cache,
                erase: HashSet::new(),
                flush_before_read: false,
            }),
        }
    }

    pub fn read_cache(&self, key: &K) -> Result<Option<V>, DbError> {
        let mut state = self.state.lock();
        self.flush_if_requested(&mut state)?;

        if let Some(value) = state.cache.peek(key) {
            return Ok(Some(value.clone()));
        }

        let raw_key = key.encode();
        state
            .db
            .get(&raw_key)
            .map(|raw| {
                V::decode(&mut raw.as_slice()).map_err(|source| DbError::Corrupted {
                    key: hex::encode(&raw_key),
                    source,
                })
            })
            .transpose()
    }

    pub fn write_cache(&self, key: K, value: V) {
        let mut state = self.state.lock();
        state.erase.remove(&key);

        if let Some((evicted, _)) = state.cache.push(key.clone(), value) {
            if evicted != key {
                tracing::trace!(db = self.name, "evicted unflushed cache entry");
            }
        }
    }

    pub fn erase_cache(&self, key: &K) {
        let mut state = self.state.lock();
        state.flush_before_read = true;
        state.cache.pop(key);
        state.erase.insert(key.clone());
    }

    pub fn exists_cache(&self, key: &K) -> Result<bool, DbError> {
        let mut state = self.state.lock();
        self.flush_if_requested(&mut state)?;

        Ok(state.cache.contains(key) || state.db.contains(&key.encode()))
    }

    /// Commits every pending write and erasure in one synced batch.
    ///
    /// Pending state is only dropped once the store accepted the batch.
    pub fn flush_cache_to_disk(&self) -> Result<(), DbError> {
        let mut state = self.state.lock();
        self.flush(&mut state)
    }

    pub fn is_cache_full(&self) -> bool {
        let state = self.state.lock();
        self.max_cache_size != 0 && state.cache.len() + state.erase.len() >= self.max_cache_size
    }

    /// Pending writes, oldest first.
    pub fn map_cache_copy(&self) -> Result<Vec<(K, V)>, DbError> {
        let mut state = self.state.lock();
        self.flush_if_requested(&mut state)?;
        Ok(Self::snapshot(&state))
    }

    pub fn erase_cache_copy(&self) -> HashSet<K> {
        self.state.lock().erase.clone()
    }

    /// Re-applies a snapshot taken with [`Self::map_cache_copy`] and
    /// [`Self::erase_cache_copy`].
    pub fn restore_caches(&self, map: Vec<(K, V)>, erase: HashSet<K>) {
        let mut state = self.state.lock();
        Self::restore(&mut state, map, erase);
    }

    /// Wipes the backing store and keeps the pending in-memory state.
    pub fn rebuild(&self) -> Result<(), DbError> {
        let mut state = self.state.lock();
        let map = Self::snapshot(&state);
        let erase = state.erase.clone();

        state.db.wipe()?;
        state.cache.clear();
        Self::restore(&mut state, map, erase);

        tracing::debug!(db = self.name, pending = state.cache.len(), "rebuilt cache store");
        Ok(())
    }

    pub fn cache_len(&self) -> usize {
        self.state.lock().cache.len()
    }

    pub fn erase_len(&self) -> usize {
        self.state.lock().erase.len()
    }

    fn snapshot(state: &State<K, V>) -> Vec<(K, V)> {
        state
            .cache
            .iter()
            .rev()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn restore(state: &mut State<K, V>, map: Vec<(K, V)>, erase: HashSet<K>) {
        for (key, value) in map {
            state.cache.push(key, value);
        }
        state.erase = erase;
    }

    fn flush_if_requested(&self, state: &mut State<K, V>) -> Result<(), DbError> {
        if !state.flush_before_read {
            return Ok(());
        }
        self.flush(state)
    }

    fn flush(&self, state: &mut State<K, V>) -> Result<(), DbError> {
        if state.cache.is_empty() && state.erase.is_empty() {
            state.flush_before_read = false;
            return Ok(());
        }

        let mut batch = WriteBatch::new();
        for (key, value) in state.cache.iter().rev() {
            batch.put_raw(key.encode(), value.encode());
        }
        for key in &state.erase {
            batch.erase_raw(key.encode());
        }

        let (writes, erasures) = (state.cache.len(), state.erase.len());
        if let Err(err) = state.db.write_batch(batch, true) {
            tracing::error!(db = self.name, writes, erasures, "cache flush failed: {err}");
            return Err(err);
        }

        state.cache.clear();
        state.erase.clear();
        state.flush_before_read = false;
        tracing::trace!(db = self.name, writes, erasures, "flushed cache");
        Ok(())
    }
}

impl<K, V> Drop for EvoDb<K, V>
where
    K: Encode + Hash + Eq + Clone,
    V: Encode + Decode + Clone,
{
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Err(err) = self.flush(&mut state) {
            tracing::error!(db = self.name, "dropping cache with unflushed entries: {err}");
        }
    }
}
