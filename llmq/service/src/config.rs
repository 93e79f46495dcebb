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

//! Quorum configuration, from command line flags or a TOML file.

use anyhow::{Context as _, Result, ensure};
use clap::Parser;
use llmq_common::{ActiveMasternode, H256, LlmqParams, bls::BlsSecretKey};
use llmq_dkg::{DkgConfig, FinalCommitmentPolicy};
use llmq_quorums::QUORUM_CACHE_SIZE;
use llmq_signing::{DEFAULT_MAX_RECOVERED_SIGS_AGE, SigningConfig};
use serde::Deserialize;
use std::num::NonZero;

/// Quorum type used when none is configured.
pub const DEFAULT_LLMQ_TYPE: &str = "llmq_400_60";

#[derive(Clone, Debug, Default, Deserialize, Parser)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct QuorumParams {
    /// Quorum type, `llmq_test` or `llmq_400_60`.
    #[arg(long)]
    pub llmq_type: Option<String>,

    /// Registration hash of the local masternode, if the node runs as one.
    #[arg(long)]
    pub masternode: Option<String>,

    /// Operator BLS secret key of the local masternode, hex encoded.
    #[arg(long)]
    pub operator_key: Option<String>,

    /// Follow DKG rounds of quorums this node is not a member of.
    #[arg(long)]
    #[serde(default)]
    pub watch_quorums: bool,

    /// Treat quorum members we are not connected to as bad.
    #[arg(long)]
    #[serde(default)]
    pub all_members_connected: bool,

    /// Seconds recovered signatures and votes are kept.
    #[arg(long = "max-recsigs-age")]
    #[serde(rename = "max-recsigs-age")]
    pub max_recovered_sigs_age: Option<NonZero<u32>>,

    /// Entries kept in memory by each quorum contribution cache.
    #[arg(long)]
    pub evodb_cache_size: Option<NonZero<usize>>,

    /// Which final commitments are handed to the miner, `most-signers` or
    /// `best-only`.
    #[arg(long)]
    pub final_commitment_policy: Option<String>,
}

/// Validated quorum configuration.
#[derive(Clone, Debug)]
pub struct QuorumConfig {
    pub params: LlmqParams,
    /// Set when the node runs as a masternode.
    pub active: Option<ActiveMasternode>,
    pub dkg: DkgConfig,
    pub signing: SigningConfig,
    pub evodb_cache_size: usize,
}

impl QuorumParams {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| "invalid quorum configuration file")
    }

    /// Values set in `self` win over the ones in `with`.
    pub fn merge(self, with: Self) -> Self {
        Self {
            llmq_type: self.llmq_type.or(with.llmq_type),
            masternode: self.masternode.or(with.masternode),
            operator_key: self.operator_key.or(with.operator_key),
            watch_quorums: self.watch_quorums || with.watch_quorums,
            all_members_connected: self.all_members_connected || with.all_members_connected,
            max_recovered_sigs_age: self.max_recovered_sigs_age.or(with.max_recovered_sigs_age),
            evodb_cache_size: self.evodb_cache_size.or(with.evodb_cache_size),
            final_commitment_policy: self
                .final_commitment_policy
                .or(with.final_commitment_policy),
        }
    }

    pub fn into_config(self) -> Result<QuorumConfig> {
        ensure!(
            self.masternode.is_some() == self.operator_key.is_some(),
            "`masternode` and `operator-key` must be both set or both unset"
        );

        let llmq_type = self.llmq_type.as_deref().unwrap_or(DEFAULT_LLMQ_TYPE);
        let params = LlmqParams::by_name(llmq_type)
            .with_context(|| format!("unknown llmq type `{llmq_type}`"))?;

        let active = match (self.masternode, self.operator_key) {
            (Some(pro_tx_hash), Some(operator_key)) => Some(ActiveMasternode::new(
                parse_hash(&pro_tx_hash).with_context(|| "invalid `masternode` hash")?,
                parse_secret_key(&operator_key).with_context(|| "invalid `operator-key`")?,
            )),
            _ => None,
        };

        let final_commitment_policy = self
            .final_commitment_policy
            .as_deref()
            .map(str::parse::<FinalCommitmentPolicy>)
            .transpose()?
            .unwrap_or_default();

        Ok(QuorumConfig {
            params,
            active,
            dkg: DkgConfig {
                watch_quorums: self.watch_quorums,
                all_members_connected: self.all_members_connected,
                final_commitment_policy,
            },
            signing: SigningConfig {
                max_recovered_sigs_age: self
                    .max_recovered_sigs_age
                    .map(|age| i64::from(age.get()))
                    .unwrap_or(DEFAULT_MAX_RECOVERED_SIGS_AGE),
            },
            evodb_cache_size: self
                .evodb_cache_size
                .map(NonZero::get)
                .unwrap_or(QUORUM_CACHE_SIZE),
        })
    }
}

fn decode_hex(value: &str) -> Result<Vec<u8>> {
    let value = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(value).with_context(|| "not a hex string")
}

fn parse_hash(value: &str) -> Result<H256> {
    let bytes = decode_hex(value)?;
    ensure!(bytes.len() == 32, "expected 32 bytes, got {}", bytes.len());
    Ok(H256::from_slice(&bytes))
}

fn parse_secret_key(value: &str) -> Result<BlsSecretKey> {
    let bytes = decode_hex(value)?;
    Ok(BlsSecretKey::from_bytes(&bytes)?)
}
