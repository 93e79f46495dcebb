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

//! BLS12-381 threshold primitives.
//!
//! Public keys live in G1 (48 bytes compressed), signatures in G2 (96 bytes
//! compressed), secret keys and member ids are scalars. The identity element
//! is the "null" value of keys and signatures: it decodes fine but is never
//! valid for signing or verification.
//!
//! Threshold sharing is plain Shamir over the scalar field. A verification
//! vector holds the G1 commitments to the polynomial coefficients, so the
//! public key share of a member is the vector evaluated at the member id.

use crate::hash::sha256;
use ark_bls12_381::{Bls12_381, Fr, G1Affine, G1Projective, G2Affine, G2Projective};
use ark_ec::{
    AffineRepr, CurveGroup,
    bls12::Bls12Config,
    hashing::{HashToCurve, curve_maps::wb, map_to_curve_hasher::MapToCurveBasedHasher},
    pairing::Pairing,
};
use ark_ff::{Field, PrimeField, fields::field_hashers::DefaultFieldHasher};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::{One, UniformRand, Zero};
use parity_scale_codec::{Decode, Encode, Error as CodecError, Input, Output};
use primitive_types::H256;
use rand::Rng;
use sha2::Sha256;
use std::{
    collections::HashSet,
    fmt,
    hash::{Hash, Hasher},
};
use thiserror::Error;

pub const SECRET_KEY_SIZE: usize = 32;
pub const PUBLIC_KEY_SIZE: usize = 48;
pub const SIGNATURE_SIZE: usize = 96;

/// Domain separation tag of the basic signature scheme.
const DST_G2: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

type WBMap = wb::WBMap<<ark_bls12_381::Config as Bls12Config>::G2Config>;
type G2Hasher = MapToCurveBasedHasher<G2Projective, DefaultFieldHasher<Sha256, 128>, WBMap>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BlsError {
    #[error("invalid point or scalar encoding")]
    Encoding,
    #[error("failed to map message to G2")]
    HashToCurve,
    #[error("duplicate or zero member id")]
    InvalidId,
    #[error("input lengths do not match")]
    LengthMismatch,
    #[error("empty input")]
    Empty,
    #[error("failed to encrypt secret share")]
    Encryption,
    #[error("failed to decrypt secret share")]
    Decryption,
}

/// Writes the compressed form of `value` into a fixed-size array.
fn compressed<T: CanonicalSerialize, const N: usize>(value: &T) -> [u8; N] {
    let mut out = [0u8; N];
    // a slice of exactly `compressed_size()` bytes always fits
    let _ = value.serialize_compressed(&mut out[..]);
    out
}

macro_rules! impl_fixed_codec {
    ($ty:ident, $size:expr) => {
        impl Encode for $ty {
            fn size_hint(&self) -> usize {
                $size
            }

            fn encode_to<T: Output + ?Sized>(&self, dest: &mut T) {
                dest.write(&self.to_bytes());
            }
        }

        impl Decode for $ty {
            fn decode<I: Input>(input: &mut I) -> Result<Self, CodecError> {
                let mut bytes = [0u8; $size];
                input.read(&mut bytes)?;
                Self::from_bytes(&bytes)
                    .map_err(|_| CodecError::from(concat!("invalid ", stringify!($ty))))
            }
        }

        impl Hash for $ty {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.to_bytes().hash(state);
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.to_bytes()))
            }
        }
    };
}

/// Member identity inside a quorum, derived from the member's registration hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlsId(Fr);

impl BlsId {
    pub fn from_hash(hash: &H256) -> Self {
        Self(Fr::from_le_bytes_mod_order(hash.as_bytes()))
    }
}

/// Secret key or secret key share.
#[derive(Clone, Copy, PartialEq, Eq, Default, derive_more::Debug)]
#[debug("BlsSecretKey(<hidden>)")]
pub struct BlsSecretKey(Fr);

impl BlsSecretKey {
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        loop {
            let scalar = Fr::rand(rng);
            if !scalar.is_zero() {
                return Self(scalar);
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_zero()
    }

    pub fn public_key(&self) -> BlsPublicKey {
        BlsPublicKey((G1Affine::generator() * self.0).into_affine())
    }

    pub fn sign(&self, hash: &H256) -> Result<BlsSignature, BlsError> {
        let point = hash_to_g2(hash)?;
        Ok(BlsSignature((point * self.0).into_affine()))
    }

    /// Scalar multiplication with a public key, the Diffie-Hellman step of share encryption.
    pub(crate) fn shared_point(&self, public: &BlsPublicKey) -> [u8; PUBLIC_KEY_SIZE] {
        compressed(&(public.0 * self.0).into_affine())
    }

    pub fn to_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        compressed(&self.0)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlsError> {
        Fr::deserialize_compressed(bytes)
            .map(Self)
            .map_err(|_| BlsError::Encoding)
    }
}

impl Encode for BlsSecretKey {
    fn size_hint(&self) -> usize {
        SECRET_KEY_SIZE
    }

    fn encode_to<T: Output + ?Sized>(&self, dest: &mut T) {
        dest.write(&self.to_bytes());
    }
}

impl Decode for BlsSecretKey {
    fn decode<I: Input>(input: &mut I) -> Result<Self, CodecError> {
        let mut bytes = [0u8; SECRET_KEY_SIZE];
        input.read(&mut bytes)?;
        Self::from_bytes(&bytes).map_err(|_| "invalid BlsSecretKey".into())
    }
}

/// Public key in G1.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlsPublicKey(G1Affine);

impl Default for BlsPublicKey {
    fn default() -> Self {
        Self(G1Affine::zero())
    }
}

impl fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsPublicKey({self})")
    }
}

impl BlsPublicKey {
    pub fn is_valid(&self) -> bool {
        !self.0.is_zero()
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        compressed(&self.0)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlsError> {
        G1Affine::deserialize_compressed(bytes)
            .map(Self)
            .map_err(|_| BlsError::Encoding)
    }

    /// Plain sum of public keys.
    pub fn aggregate(keys: &[BlsPublicKey]) -> BlsPublicKey {
        let sum = keys
            .iter()
            .fold(G1Projective::zero(), |acc, key| acc + key.0);
        BlsPublicKey(sum.into_affine())
    }
}

impl_fixed_codec!(BlsPublicKey, PUBLIC_KEY_SIZE);

/// Signature in G2.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlsSignature(G2Affine);

impl Default for BlsSignature {
    fn default() -> Self {
        Self(G2Affine::zero())
    }
}

impl fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsSignature({self})")
    }
}

impl BlsSignature {
    pub fn is_valid(&self) -> bool {
        !self.0.is_zero()
    }

    pub fn to_bytes(&self) -> [u8; SIGNATURE_SIZE] {
        compressed(&self.0)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlsError> {
        G2Affine::deserialize_compressed(bytes)
            .map(Self)
            .map_err(|_| BlsError::Encoding)
    }

    /// Verifies a single signature. "Insecure" means no proof of possession is
    /// assumed for `key`; only use with keys an attacker cannot choose freely.
    pub fn verify_insecure(&self, key: &BlsPublicKey, hash: &H256) -> bool {
        if !self.is_valid() || !key.is_valid() {
            return false;
        }
        let Ok(point) = hash_to_g2(hash) else {
            return false;
        };

        Bls12_381::pairing(key.0, point) == Bls12_381::pairing(G1Affine::generator(), self.0)
    }

    /// Verifies an aggregate of signatures made by `keys[i]` over `hashes[i]`.
    pub fn verify_insecure_aggregated(&self, keys: &[BlsPublicKey], hashes: &[H256]) -> bool {
        if keys.is_empty() || keys.len() != hashes.len() || !self.is_valid() {
            return false;
        }
        if keys.iter().any(|key| !key.is_valid()) {
            return false;
        }

        let mut points = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let Ok(point) = hash_to_g2(hash) else {
                return false;
            };
            points.push(point);
        }

        let lhs = Bls12_381::multi_pairing(keys.iter().map(|key| key.0), points);
        lhs == Bls12_381::pairing(G1Affine::generator(), self.0)
    }

    /// Plain sum of signatures.
    pub fn aggregate_insecure(signatures: &[BlsSignature]) -> BlsSignature {
        let sum = signatures
            .iter()
            .fold(G2Projective::zero(), |acc, sig| acc + sig.0);
        BlsSignature(sum.into_affine())
    }

    /// Aggregates signatures over one message with rogue-key resistant
    /// coefficients. Pair with [`BlsSignature::verify_secure_aggregated`].
    pub fn aggregate_secure(
        signatures: &[BlsSignature],
        keys: &[BlsPublicKey],
    ) -> Result<BlsSignature, BlsError> {
        if signatures.is_empty() {
            return Err(BlsError::Empty);
        }
        if signatures.len() != keys.len() {
            return Err(BlsError::LengthMismatch);
        }

        let coefficients = secure_coefficients(keys);
        let sum = signatures
            .iter()
            .zip(coefficients)
            .fold(G2Projective::zero(), |acc, (sig, coeff)| acc + sig.0 * coeff);
        Ok(BlsSignature(sum.into_affine()))
    }

    pub fn verify_secure_aggregated(&self, keys: &[BlsPublicKey], hash: &H256) -> bool {
        if keys.is_empty() {
            return false;
        }

        let coefficients = secure_coefficients(keys);
        let aggregated = keys
            .iter()
            .zip(coefficients)
            .fold(G1Projective::zero(), |acc, (key, coeff)| acc + key.0 * coeff);

        self.verify_insecure(&BlsPublicKey(aggregated.into_affine()), hash)
    }

    /// Lagrange interpolation at zero of threshold signature shares.
    pub fn recover(shares: &[BlsSignature], ids: &[BlsId]) -> Result<BlsSignature, BlsError> {
        if shares.is_empty() {
            return Err(BlsError::Empty);
        }
        if shares.len() != ids.len() {
            return Err(BlsError::LengthMismatch);
        }

        let coefficients = lagrange_at_zero(ids)?;
        let sum = shares
            .iter()
            .zip(coefficients)
            .fold(G2Projective::zero(), |acc, (share, coeff)| acc + share.0 * coeff);
        Ok(BlsSignature(sum.into_affine()))
    }
}

impl_fixed_codec!(BlsSignature, SIGNATURE_SIZE);

pub fn hash_to_g2(hash: &H256) -> Result<G2Affine, BlsError> {
    let mapper = G2Hasher::new(DST_G2).map_err(|_| BlsError::HashToCurve)?;
    mapper
        .hash(hash.as_bytes())
        .map_err(|_| BlsError::HashToCurve)
}

fn secure_coefficients(keys: &[BlsPublicKey]) -> Vec<Fr> {
    let mut sorted: Vec<[u8; PUBLIC_KEY_SIZE]> = keys.iter().map(BlsPublicKey::to_bytes).collect();
    sorted.sort_unstable();
    let parts: Vec<&[u8]> = sorted.iter().map(|bytes| bytes.as_slice()).collect();
    let keys_hash = sha256(&parts);

    keys.iter()
        .map(|key| Fr::from_le_bytes_mod_order(&sha256(&[&key.to_bytes(), &keys_hash])))
        .collect()
}

fn lagrange_at_zero(ids: &[BlsId]) -> Result<Vec<Fr>, BlsError> {
    let mut coefficients = Vec::with_capacity(ids.len());
    for (j, id_j) in ids.iter().enumerate() {
        let mut numerator = Fr::one();
        let mut denominator = Fr::one();
        for (m, id_m) in ids.iter().enumerate() {
            if m == j {
                continue;
            }
            numerator *= id_m.0;
            denominator *= id_m.0 - id_j.0;
        }
        let inverse = denominator.inverse().ok_or(BlsError::InvalidId)?;
        if numerator.is_zero() {
            return Err(BlsError::InvalidId);
        }
        coefficients.push(numerator * inverse);
    }
    Ok(coefficients)
}

/// Commitments to the coefficients of a member's secret polynomial.
pub type VerificationVector = Vec<BlsPublicKey>;

/// Generates a random polynomial of degree `threshold - 1` and evaluates it
/// for every member id.
pub fn generate_contributions<R: Rng + ?Sized>(
    threshold: usize,
    ids: &[BlsId],
    rng: &mut R,
) -> Result<(VerificationVector, Vec<BlsSecretKey>), BlsError> {
    if threshold == 0 || ids.is_empty() {
        return Err(BlsError::Empty);
    }

    let coefficients: Vec<Fr> = (0..threshold)
        .map(|_| BlsSecretKey::random(rng).0)
        .collect();

    let vvec = coefficients
        .iter()
        .map(|coeff| BlsSecretKey(*coeff).public_key())
        .collect();
    let shares = ids
        .iter()
        .map(|id| {
            let value = coefficients
                .iter()
                .rev()
                .fold(Fr::zero(), |acc, coeff| acc * id.0 + coeff);
            BlsSecretKey(value)
        })
        .collect();

    Ok((vvec, shares))
}

/// Evaluates `vvec` at `id`.
pub fn public_key_share(vvec: &[BlsPublicKey], id: &BlsId) -> BlsPublicKey {
    let value = vvec
        .iter()
        .rev()
        .fold(G1Projective::zero(), |acc, coeff| acc * id.0 + coeff.0);
    BlsPublicKey(value.into_affine())
}

/// Checks that `share` is the evaluation of the polynomial committed in `vvec`.
pub fn verify_contribution_share(id: &BlsId, vvec: &[BlsPublicKey], share: &BlsSecretKey) -> bool {
    share.is_valid() && !vvec.is_empty() && public_key_share(vvec, id) == share.public_key()
}

/// A verification vector must be non-empty, free of null keys and of duplicates.
pub fn verify_verification_vector(vvec: &[BlsPublicKey]) -> bool {
    if vvec.is_empty() {
        return false;
    }
    let mut seen = HashSet::with_capacity(vvec.len());
    vvec.iter().all(|key| key.is_valid() && seen.insert(key.to_bytes()))
}

/// Element-wise sum of member verification vectors.
pub fn build_quorum_verification_vector<V: AsRef<[BlsPublicKey]>>(
    vvecs: &[V],
) -> Option<VerificationVector> {
    let first = vvecs.first()?.as_ref();
    if first.is_empty() || vvecs.iter().any(|vvec| vvec.as_ref().len() != first.len()) {
        return None;
    }

    let mut sums = vec![G1Projective::zero(); first.len()];
    for vvec in vvecs {
        for (sum, key) in sums.iter_mut().zip(vvec.as_ref()) {
            *sum += key.0;
        }
    }

    let result: VerificationVector = G1Projective::normalize_batch(&sums)
        .into_iter()
        .map(BlsPublicKey)
        .collect();
    result.iter().all(BlsPublicKey::is_valid).then_some(result)
}

/// Sum of secret key contributions, the member's share of the quorum key.
pub fn aggregate_secret_keys(keys: &[BlsSecretKey]) -> BlsSecretKey {
    BlsSecretKey(keys.iter().fold(Fr::zero(), |acc, key| acc + key.0))
}
