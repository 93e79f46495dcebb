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

//! Typed key schema.
//!
//! Every row lives under a string tag that acts as a table namespace. A key
//! is the SCALE encoded tag followed by its fixed-size fields, so all rows of
//! one tag are contiguous and time-indexed rows sort by time.

use parity_scale_codec::{Decode, Encode};
use primitive_types::H256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyTag {
    RecoveredSig,
    RecoveredSigByHash,
    RecoveredSigBySession,
    RecoveredSigByTime,
    Vote,
    VoteByTime,
    DkgVvec,
    DkgSkContribution,
}

impl KeyTag {
    pub const ALL: [KeyTag; 8] = [
        KeyTag::RecoveredSig,
        KeyTag::RecoveredSigByHash,
        KeyTag::RecoveredSigBySession,
        KeyTag::RecoveredSigByTime,
        KeyTag::Vote,
        KeyTag::VoteByTime,
        KeyTag::DkgVvec,
        KeyTag::DkgSkContribution,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RecoveredSig => "rs_r",
            Self::RecoveredSigByHash => "rs_h",
            Self::RecoveredSigBySession => "rs_s",
            Self::RecoveredSigByTime => "rs_t",
            Self::Vote => "rs_v",
            Self::VoteByTime => "rs_vt",
            Self::DkgVvec => "qdkg_V",
            Self::DkgSkContribution => "qdkg_S",
        }
    }

    /// Byte prefix shared by every key of this tag.
    pub fn prefix(self) -> Vec<u8> {
        self.as_str().encode()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    /// Recovered signature by request id.
    RecoveredSig(H256),
    /// Marks that `(id, msg_hash)` has a recovered signature; holds the write time.
    RecoveredSigForMsg(H256, H256),
    /// Recovered signature hash to request id.
    RecoveredSigIdByHash(H256),
    RecoveredSigBySession(H256),
    /// Insertion time index over request ids.
    RecoveredSigByTime(u32, H256),
    /// Local vote for a request id.
    Vote(H256),
    VoteByTime(u32, H256),
    /// Verified verification vector of `(quorum_hash, pro_tx_hash)`.
    DkgVvec(H256, H256),
    /// Verified secret key share of `(quorum_hash, pro_tx_hash)` for the local member.
    DkgSkContribution(H256, H256),
}

impl Key {
    pub fn tag(&self) -> KeyTag {
        match self {
            Self::RecoveredSig(_) | Self::RecoveredSigForMsg(..) => KeyTag::RecoveredSig,
            Self::RecoveredSigIdByHash(_) => KeyTag::RecoveredSigByHash,
            Self::RecoveredSigBySession(_) => KeyTag::RecoveredSigBySession,
            Self::RecoveredSigByTime(..) => KeyTag::RecoveredSigByTime,
            Self::Vote(_) => KeyTag::Vote,
            Self::VoteByTime(..) => KeyTag::VoteByTime,
            Self::DkgVvec(..) => KeyTag::DkgVvec,
            Self::DkgSkContribution(..) => KeyTag::DkgSkContribution,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let prefix = self.tag().prefix();
        match self {
            Self::RecoveredSig(hash)
            | Self::RecoveredSigIdByHash(hash)
            | Self::RecoveredSigBySession(hash)
            | Self::Vote(hash) => [prefix.as_ref(), hash.as_bytes()].concat(),

            Self::RecoveredSigForMsg(first, second)
            | Self::DkgVvec(first, second)
            | Self::DkgSkContribution(first, second) => {
                [prefix.as_ref(), first.as_bytes(), second.as_bytes()].concat()
            }

            // big endian so that the store orders rows by time
            Self::RecoveredSigByTime(time, id) | Self::VoteByTime(time, id) => {
                [prefix.as_ref(), time.to_be_bytes().as_ref(), id.as_bytes()].concat()
            }
        }
    }

    /// Parses a raw store key back. Returns `None` for foreign keys.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let mut input = bytes;
        let tag = String::decode(&mut input).ok()?;
        let tag = KeyTag::ALL.into_iter().find(|known| known.as_str() == tag)?;

        let hash_at = |offset: usize| {
            input
                .get(offset..offset + 32)
                .map(H256::from_slice)
        };
        let time = || {
            input
                .get(..4)
                .and_then(|raw| <[u8; 4]>::try_from(raw).ok())
                .map(u32::from_be_bytes)
        };

        let key = match (tag, input.len()) {
            (KeyTag::RecoveredSig, 32) => Self::RecoveredSig(hash_at(0)?),
            (KeyTag::RecoveredSig, 64) => Self::RecoveredSigForMsg(hash_at(0)?, hash_at(32)?),
            (KeyTag::RecoveredSigByHash, 32) => Self::RecoveredSigIdByHash(hash_at(0)?),
            (KeyTag::RecoveredSigBySession, 32) => Self::RecoveredSigBySession(hash_at(0)?),
            (KeyTag::RecoveredSigByTime, 36) => Self::RecoveredSigByTime(time()?, hash_at(4)?),
            (KeyTag::Vote, 32) => Self::Vote(hash_at(0)?),
            (KeyTag::VoteByTime, 36) => Self::VoteByTime(time()?, hash_at(4)?),
            (KeyTag::DkgVvec, 64) => Self::DkgVvec(hash_at(0)?, hash_at(32)?),
            (KeyTag::DkgSkContribution, 64) => Self::DkgSkContribution(hash_at(0)?, hash_at(32)?),
            _ => return None,
        };
        Some(key)
    }
}

impl core::fmt::Display for Key {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.tag().as_str(), hex::encode(&self.to_bytes()[self.tag().prefix().len()..]))
    }
}
