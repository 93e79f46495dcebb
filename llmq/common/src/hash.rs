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

//! Object hashing.
//!
//! Every object identity in the quorum core (message hashes, sign hashes,
//! commitment hashes) is a double SHA-256 over the SCALE encoding of the
//! object.

use parity_scale_codec::Encode;
use primitive_types::H256;
use sha2::{Digest, Sha256};

/// Double SHA-256 of raw bytes.
pub fn hash(data: &[u8]) -> H256 {
    let first = Sha256::digest(data);
    H256(Sha256::digest(first).into())
}

/// Hash of the canonical encoding of `value`.
pub fn serialize_hash<T: Encode + ?Sized>(value: &T) -> H256 {
    value.using_encoded(hash)
}

/// Single SHA-256, used for key derivation.
pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}
