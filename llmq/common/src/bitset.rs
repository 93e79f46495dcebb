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

//! Dynamic bitset used for member vectors (`validMembers`, `signers`,
//! complaint vectors).

use parity_scale_codec::{Compact, Decode, Encode, Error as CodecError, Input, Output};

/// Upper bound on the number of bits accepted from the wire.
pub const MAX_BITSET_LEN: usize = 4096;

/// Ordered vector of bits, one per quorum member.
///
/// Encoded as a compact bit count followed by the bits packed LSB-first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BitSet(Vec<bool>);

impl BitSet {
    pub fn new(len: usize) -> Self {
        Self(vec![false; len])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bit at `idx`; bits past the end read as unset.
    pub fn get(&self, idx: usize) -> bool {
        self.0.get(idx).copied().unwrap_or(false)
    }

    /// Sets bit `idx`, growing the set if needed.
    pub fn set(&mut self, idx: usize, value: bool) {
        if idx >= self.0.len() {
            self.0.resize(idx + 1, false);
        }
        self.0[idx] = value;
    }

    pub fn count_ones(&self) -> usize {
        self.0.iter().filter(|bit| **bit).count()
    }

    /// Indices of set bits.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(idx, bit)| bit.then_some(idx))
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.0
    }

    fn packed(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.0.len().div_ceil(8)];
        for idx in self.ones() {
            bytes[idx / 8] |= 1 << (idx % 8);
        }
        bytes
    }

    /// Hex of the packed representation, as shown by status queries.
    pub fn to_hex(&self) -> String {
        hex::encode(self.packed())
    }
}

impl From<Vec<bool>> for BitSet {
    fn from(bits: Vec<bool>) -> Self {
        Self(bits)
    }
}

impl Encode for BitSet {
    fn size_hint(&self) -> usize {
        Compact(self.0.len() as u32).size_hint() + self.0.len().div_ceil(8)
    }

    fn encode_to<T: Output + ?Sized>(&self, dest: &mut T) {
        Compact(self.0.len() as u32).encode_to(dest);
        dest.write(&self.packed());
    }
}

impl Decode for BitSet {
    fn decode<I: Input>(input: &mut I) -> Result<Self, CodecError> {
        let len = Compact::<u32>::decode(input)?.0 as usize;
        if len > MAX_BITSET_LEN {
            return Err("bitset is too large".into());
        }

        let mut bytes = vec![0u8; len.div_ceil(8)];
        input.read(&mut bytes)?;

        let bits: Vec<bool> = (0..len)
            .map(|idx| bytes[idx / 8] & (1 << (idx % 8)) != 0)
            .collect();

        // padding bits must be zero, otherwise two encodings share one value
        if len % 8 != 0 && bytes[len / 8] >> (len % 8) != 0 {
            return Err("bitset padding is not zero".into());
        }

        Ok(Self(bits))
    }
}
