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
    DbError, KVDatabase, WriteBatch,
    batch::BatchOp,
};
use parking_lot::RwLock;
use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// Ordered in-memory store.
#[derive(Debug, Default, Clone)]
pub struct MemDb {
    inner: Arc<RwLock<Map>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following batch write fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }
}

/// Cursor that re-reads the map on every step, so writers are never blocked
/// for the lifetime of an iteration.
struct MemDbIter<'a> {
    db: &'a MemDb,
    cursor: Bound<Vec<u8>>,
}

impl Iterator for MemDbIter<'_> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let map = self.db.inner.read();
        let (key, value) = map
            .range::<Vec<u8>, _>((self.cursor.clone(), Bound::Unbounded))
            .next()?;
        self.cursor = Bound::Excluded(key.clone());
        Some((key.clone(), value.clone()))
    }
}

impl KVDatabase for MemDb {
    fn clone_boxed(&self) -> Box<dyn KVDatabase> {
        Box::new(self.clone())
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.read().get(key).cloned()
    }

    fn contains(&self, key: &[u8]) -> bool {
        self.inner.read().contains_key(key)
    }

    fn iter_from<'a>(&'a self, start: &[u8]) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        Box::new(MemDbIter {
            db: self,
            cursor: Bound::Included(start.to_vec()),
        })
    }

    fn write_batch(&self, batch: WriteBatch, _sync: bool) -> Result<(), DbError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DbError::WriteFailed { ops: batch.len() });
        }

        let mut map = self.inner.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(key, value) => {
                    map.insert(key, value);
                }
                BatchOp::Erase(key) => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn wipe(&self) -> Result<(), DbError> {
        self.inner.write().clear();
        Ok(())
    }
}
