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

use crate::{bls::BlsSignature, hash::serialize_hash};
use parity_scale_codec::{Decode, Encode, Error as CodecError, Input, Output};
use primitive_types::H256;

/// Hash a quorum signs for request `id` over `msg_hash`.
pub fn build_sign_hash(quorum_hash: &H256, id: &H256, msg_hash: &H256) -> H256 {
    serialize_hash(&(quorum_hash, id, msg_hash))
}

/// Completed threshold signature of a quorum.
///
/// The object hash is computed once on construction and on decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveredSig {
    quorum_hash: H256,
    id: H256,
    msg_hash: H256,
    sig: BlsSignature,
    hash: H256,
}

impl RecoveredSig {
    pub fn new(quorum_hash: H256, id: H256, msg_hash: H256, sig: BlsSignature) -> Self {
        let hash = serialize_hash(&(&quorum_hash, &id, &msg_hash, &sig));
        Self {
            quorum_hash,
            id,
            msg_hash,
            sig,
            hash,
        }
    }

    pub fn quorum_hash(&self) -> &H256 {
        &self.quorum_hash
    }

    pub fn id(&self) -> &H256 {
        &self.id
    }

    pub fn msg_hash(&self) -> &H256 {
        &self.msg_hash
    }

    pub fn sig(&self) -> &BlsSignature {
        &self.sig
    }

    pub fn hash(&self) -> &H256 {
        &self.hash
    }

    pub fn sign_hash(&self) -> H256 {
        build_sign_hash(&self.quorum_hash, &self.id, &self.msg_hash)
    }
}

impl Encode for RecoveredSig {
    fn size_hint(&self) -> usize {
        3 * 32 + self.sig.size_hint()
    }

    fn encode_to<T: Output + ?Sized>(&self, dest: &mut T) {
        self.quorum_hash.encode_to(dest);
        self.id.encode_to(dest);
        self.msg_hash.encode_to(dest);
        self.sig.encode_to(dest);
    }
}

impl Decode for RecoveredSig {
    fn decode<I: Input>(input: &mut I) -> Result<Self, CodecError> {
        let quorum_hash = H256::decode(input)?;
        let id = H256::decode(input)?;
        let msg_hash = H256::decode(input)?;
        let sig = BlsSignature::decode(input)?;
        Ok(Self::new(quorum_hash, id, msg_hash, sig))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_over_encoding() {
        let rec_sig = RecoveredSig::new(
            H256::repeat_byte(1),
            H256::repeat_byte(2),
            H256::repeat_byte(3),
            BlsSignature::default(),
        );

        assert_eq!(*rec_sig.hash(), serialize_hash(&rec_sig));

        let decoded = RecoveredSig::decode(&mut &rec_sig.encode()[..]).expect("decode");
        assert_eq!(decoded.hash(), rec_sig.hash());
        assert_ne!(decoded.sign_hash(), *decoded.hash());
    }
}
