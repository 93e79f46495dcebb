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

use crate::{DbError, KVDatabase, Key, KeyTag, WriteBatch};
use llmq_common::{
    H256,
    bls::{BlsSecretKey, VerificationVector},
};
use parity_scale_codec::Decode;

/// Verified DKG contributions keyed by `(quorum_hash, pro_tx_hash)`.
#[derive(derive_more::Debug)]
#[debug("DkgContributionsDb")]
pub struct DkgContributionsDb {
    db: Box<dyn KVDatabase>,
}

impl DkgContributionsDb {
    pub fn new(db: Box<dyn KVDatabase>) -> Self {
        Self { db }
    }

    pub fn write_vvec(
        &self,
        quorum_hash: &H256,
        pro_tx_hash: &H256,
        vvec: &VerificationVector,
    ) -> Result<(), DbError> {
        let mut batch = WriteBatch::new();
        batch.write(&Key::DkgVvec(*quorum_hash, *pro_tx_hash), vvec);
        self.db.write_batch(batch, false)
    }

    pub fn write_sk_contribution(
        &self,
        quorum_hash: &H256,
        pro_tx_hash: &H256,
        sk: &BlsSecretKey,
    ) -> Result<(), DbError> {
        let mut batch = WriteBatch::new();
        batch.write(&Key::DkgSkContribution(*quorum_hash, *pro_tx_hash), sk);
        self.db.write_batch(batch, false)
    }

    pub fn read_vvec(
        &self,
        quorum_hash: &H256,
        pro_tx_hash: &H256,
    ) -> Result<Option<VerificationVector>, DbError> {
        self.read(&Key::DkgVvec(*quorum_hash, *pro_tx_hash))
    }

    pub fn read_sk_contribution(
        &self,
        quorum_hash: &H256,
        pro_tx_hash: &H256,
    ) -> Result<Option<BlsSecretKey>, DbError> {
        self.read(&Key::DkgSkContribution(*quorum_hash, *pro_tx_hash))
    }

    pub fn is_empty(&self) -> bool {
        [KeyTag::DkgVvec, KeyTag::DkgSkContribution]
            .into_iter()
            .all(|tag| self.db.iter_prefix(&tag.prefix()).next().is_none())
    }

    /// Erases both kinds of contributions of every quorum for which
    /// `is_expired` holds. Returns the number of erased rows.
    pub fn erase_where(&self, mut is_expired: impl FnMut(&H256) -> bool) -> Result<usize, DbError> {
        let mut batch = WriteBatch::new();
        for tag in [KeyTag::DkgVvec, KeyTag::DkgSkContribution] {
            let prefix = tag.prefix();
            let expired = self
                .db
                .iter_prefix(&prefix)
                .filter_map(|(raw, _)| Key::from_bytes(&raw))
                .filter(|key| match key {
                    Key::DkgVvec(quorum_hash, _) | Key::DkgSkContribution(quorum_hash, _) => {
                        is_expired(quorum_hash)
                    }
                    _ => false,
                });
            for key in expired {
                batch.erase(&key);
            }
        }

        let count = batch.len();
        if count != 0 {
            self.db.write_batch(batch, true)?;
        }
        Ok(count)
    }

    pub fn wipe(&self) -> Result<(), DbError> {
        self.db.wipe()
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
}
