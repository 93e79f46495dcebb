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

//! Multi-recipient encryption of secret key shares.
//!
//! One ephemeral key is used for all recipients. Recipient `i` derives the
//! symmetric key from the Diffie-Hellman point, the shared IV seed and its own
//! index, so blobs cannot be swapped between recipients.

use crate::{
    bls::{BlsError, BlsPublicKey, BlsSecretKey},
    hash::sha256,
};
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};
use parity_scale_codec::{Decode, Encode};
use primitive_types::H256;
use rand::Rng;

const NONCE_SIZE: usize = 12;

#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct EncryptedShares {
    pub ephemeral_pub_key: BlsPublicKey,
    pub iv_seed: H256,
    pub blobs: Vec<Vec<u8>>,
}

impl EncryptedShares {
    /// Encrypts `shares[i]` to `recipients[i]`.
    pub fn encrypt<R: Rng + ?Sized>(
        recipients: &[BlsPublicKey],
        shares: &[BlsSecretKey],
        rng: &mut R,
    ) -> Result<Self, BlsError> {
        if recipients.len() != shares.len() {
            return Err(BlsError::LengthMismatch);
        }

        let ephemeral = BlsSecretKey::random(rng);
        let iv_seed = H256(rng.r#gen());

        let blobs = recipients
            .iter()
            .zip(shares)
            .enumerate()
            .map(|(idx, (recipient, share))| {
                let cipher = cipher(&ephemeral, recipient, &iv_seed, idx);
                cipher
                    .encrypt(&nonce(&iv_seed, idx), share.to_bytes().as_slice())
                    .map_err(|_| BlsError::Encryption)
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            ephemeral_pub_key: ephemeral.public_key(),
            iv_seed,
            blobs,
        })
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Decrypts the blob addressed to recipient `idx` holding `secret`.
    pub fn decrypt(&self, idx: usize, secret: &BlsSecretKey) -> Result<BlsSecretKey, BlsError> {
        let blob = self.blobs.get(idx).ok_or(BlsError::Decryption)?;
        if !self.ephemeral_pub_key.is_valid() {
            return Err(BlsError::Decryption);
        }

        let cipher = cipher(secret, &self.ephemeral_pub_key, &self.iv_seed, idx);
        let plain = cipher
            .decrypt(&nonce(&self.iv_seed, idx), blob.as_slice())
            .map_err(|_| BlsError::Decryption)?;

        let share = BlsSecretKey::from_bytes(&plain).map_err(|_| BlsError::Decryption)?;
        share.is_valid().then_some(share).ok_or(BlsError::Decryption)
    }
}

fn cipher(secret: &BlsSecretKey, public: &BlsPublicKey, iv_seed: &H256, idx: usize) -> ChaCha20Poly1305 {
    let shared = secret.shared_point(public);
    let key = sha256(&[&shared, iv_seed.as_bytes(), &(idx as u32).to_le_bytes()]);
    ChaCha20Poly1305::new((&key).into())
}

fn nonce(iv_seed: &H256, idx: usize) -> Nonce {
    let digest = sha256(&[iv_seed.as_bytes(), &(idx as u32).to_le_bytes()]);
    *Nonce::from_slice(&digest[..NONCE_SIZE])
}
