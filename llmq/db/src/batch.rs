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

use crate::key::Key;
use parity_scale_codec::Encode;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Erase(Vec<u8>),
}

/// Ordered list of writes and erasures committed atomically by
/// [`KVDatabase::write_batch`](crate::KVDatabase::write_batch).
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
    size: usize,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_raw(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.size += key.len() + value.len();
        self.ops.push(BatchOp::Put(key, value));
    }

    pub fn erase_raw(&mut self, key: Vec<u8>) {
        self.size += key.len();
        self.ops.push(BatchOp::Erase(key));
    }

    pub fn write<V: Encode + ?Sized>(&mut self, key: &Key, value: &V) {
        self.put_raw(key.to_bytes(), value.encode());
    }

    pub fn erase(&mut self, key: &Key) {
        self.erase_raw(key.to_bytes());
    }

    pub fn clear(&mut self) {
        self.ops.clear();
        self.size = 0;
    }

    /// Approximate number of bytes the batch carries.
    pub fn size_estimate(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitive_types::H256;

    #[test]
    fn size_estimate_grows_and_resets() {
        let mut batch = WriteBatch::new();
        assert_eq!(batch.size_estimate(), 0);

        batch.write(&Key::Vote(H256::zero()), &H256::zero());
        batch.erase(&Key::RecoveredSigIdByHash(H256::zero()));
        assert_eq!(batch.len(), 2);
        assert!(batch.size_estimate() > 64);

        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.size_estimate(), 0);
    }
}
