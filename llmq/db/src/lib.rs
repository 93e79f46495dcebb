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

//! Storage layer of the quorum core.
//!
//! Everything sits on top of [`KVDatabase`], an ordered byte-string store
//! with atomic batched writes. [`EvoDb`] adds a bounded write-back cache,
//! [`RecoveredSigsDb`] and [`DkgContributionsDb`] keep their rows under
//! the typed key schema of [`Key`].

use parity_scale_codec::Error as CodecError;

mod batch;
mod dkg;
mod evo;
mod key;
mod mem;
mod recsigs;

pub use batch::WriteBatch;
pub use dkg::DkgContributionsDb;
pub use evo::EvoDb;
pub use key::{Key, KeyTag};
pub use mem::MemDb;
pub use recsigs::{RECOVERED_SIGS_CACHE_SIZE, RecoveredSigsDb};

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("store rejected a batch of {ops} operations")]
    WriteFailed { ops: usize },
    #[error("corrupted value under {key}: {source}")]
    Corrupted {
        key: String,
        #[source]
        source: CodecError,
    },
}

/// Ordered key-value database.
pub trait KVDatabase: Send + Sync {
    /// Clone ref to key-value database instance.
    fn clone_boxed(&self) -> Box<dyn KVDatabase>;

    /// Get value by key.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Check if data exists by key.
    fn contains(&self, key: &[u8]) -> bool;

    /// Iterates entries in key order, starting at the first key `>= start`.
    fn iter_from<'a>(&'a self, start: &[u8]) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

    /// Applies every operation of `batch` or none of them.
    fn write_batch(&self, batch: WriteBatch, sync: bool) -> Result<(), DbError>;

    /// Drops every entry.
    fn wipe(&self) -> Result<(), DbError>;

    fn iter_prefix<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        Box::new(
            self.iter_from(prefix)
                .take_while(move |(key, _)| key.starts_with(prefix)),
        )
    }

    /// Put (insert) value by key.
    fn put(&self, key: &[u8], data: Vec<u8>) -> Result<(), DbError> {
        let mut batch = WriteBatch::new();
        batch.put_raw(key.to_vec(), data);
        self.write_batch(batch, false)
    }

    fn erase(&self, key: &[u8]) -> Result<(), DbError> {
        let mut batch = WriteBatch::new();
        batch.erase_raw(key.to_vec());
        self.write_batch(batch, false)
    }

    fn is_empty(&self) -> bool {
        self.iter_from(&[]).next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use crate::{KVDatabase, WriteBatch};
    use std::{collections::BTreeSet, thread};

    fn to_big_vec(x: u32) -> Vec<u8> {
        let bytes = x.to_le_bytes();
        bytes
            .iter()
            .cycle()
            .take(1024 * 1024)
            .copied()
            .collect::<Vec<_>>()
    }

    pub fn is_clonable<DB: Clone>(db: DB) {
        let _ = db.clone();
    }

    pub fn kv_read_write<DB: KVDatabase>(db: DB) {
        let key = b"key";
        let data = b"value".to_vec();
        db.put(key, data.clone()).unwrap();
        assert_eq!(db.get(key.as_slice()), Some(data));
        assert!(db.contains(key));

        db.erase(key).unwrap();
        assert_eq!(db.get(key.as_slice()), None);
        assert!(db.is_empty());
    }

    pub fn kv_iter_prefix<DB: KVDatabase>(db: DB) {
        let testcase = |prefix: &str, expectations: &[(&str, &str)]| {
            let actual: BTreeSet<_> = db.iter_prefix(prefix.as_bytes()).collect();
            let expected: BTreeSet<_> = expectations
                .iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
                .collect();
            assert_eq!(actual, expected);
        };

        db.put(b"prefix_foo", b"hello".to_vec()).unwrap();
        db.put(b"prefix_bar", b"world".to_vec()).unwrap();

        testcase(
            "prefix_",
            &[("prefix_foo", "hello"), ("prefix_bar", "world")],
        );

        testcase("", &[("prefix_foo", "hello"), ("prefix_bar", "world")]);

        testcase("0", &[]);

        testcase("prefix_foobar", &[]);

        testcase("prefix_foo", &[("prefix_foo", "hello")]);

        testcase("prefix_bar", &[("prefix_bar", "world")]);
    }

    pub fn kv_iter_from_is_ordered<DB: KVDatabase>(db: DB) {
        for key in [b"c", b"a", b"d", b"b"] {
            db.put(key, key.to_vec()).unwrap();
        }

        let keys: Vec<_> = db.iter_from(b"b").map(|(key, _)| key).collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);

        // entries removed behind the cursor do not disturb it
        let mut iter = db.iter_from(b"a");
        assert_eq!(iter.next().map(|(key, _)| key), Some(b"a".to_vec()));
        db.erase(b"a").unwrap();
        assert_eq!(iter.next().map(|(key, _)| key), Some(b"b".to_vec()));
    }

    pub fn kv_write_batch<DB: KVDatabase>(db: DB) {
        db.put(b"gone", b"1".to_vec()).unwrap();

        let mut batch = WriteBatch::new();
        batch.put_raw(b"kept".to_vec(), b"2".to_vec());
        batch.erase_raw(b"gone".to_vec());
        batch.put_raw(b"overwritten".to_vec(), b"3".to_vec());
        batch.put_raw(b"overwritten".to_vec(), b"4".to_vec());
        assert_eq!(batch.len(), 4);
        db.write_batch(batch, true).unwrap();

        assert_eq!(db.get(b"kept"), Some(b"2".to_vec()));
        assert_eq!(db.get(b"gone"), None);
        assert_eq!(db.get(b"overwritten"), Some(b"4".to_vec()));

        db.wipe().unwrap();
        assert!(db.is_empty());
    }

    pub fn kv_multi_thread<DB: KVDatabase>(db: DB) {
        let amount = 10;

        let db_clone = KVDatabase::clone_boxed(&db);
        let handler1 = thread::spawn(move || {
            for x in 0u32..amount {
                db_clone
                    .put(x.to_le_bytes().as_slice(), to_big_vec(x))
                    .unwrap();
            }
        });

        let db_clone = KVDatabase::clone_boxed(&db);
        let handler2 = thread::spawn(move || {
            for x in amount..amount * 2 {
                db_clone
                    .put(x.to_le_bytes().as_slice(), to_big_vec(x))
                    .unwrap();
            }
        });

        handler1.join().unwrap();
        handler2.join().unwrap();

        for x in 0u32..amount * 2 {
            let expected = to_big_vec(x);
            let data = db.get(x.to_le_bytes().as_slice());
            assert_eq!(data, Some(expected));
        }
    }
}
