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

use llmq_common::bls::BlsError;
use llmq_db::DbError;
use rand::Rng;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DkgError {
    #[error("quorum has {count} members, at least {min} required")]
    NotEnoughMembers { count: usize, min: usize },
    #[error("DKG round aborted: {0}")]
    Aborted(&'static str),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Bls(#[from] BlsError),
    #[error("failed to spawn DKG thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Misbehavior a session can be told to simulate, for testing the
/// protocol's handling of faulty members.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DkgErrorKind {
    #[error("complain-lie")]
    ComplainLie,
    #[error("commit-omit")]
    CommitOmit,
    #[error("commit-lie")]
    CommitLie,
    #[error("contribution-omit")]
    ContributionOmit,
    #[error("contribution-lie")]
    ContributionLie,
    #[error("justify-omit")]
    JustifyOmit,
    #[error("justify-lie")]
    JustifyLie,
}

impl DkgErrorKind {
    pub const ALL: [DkgErrorKind; 7] = [
        DkgErrorKind::ComplainLie,
        DkgErrorKind::CommitOmit,
        DkgErrorKind::CommitLie,
        DkgErrorKind::ContributionOmit,
        DkgErrorKind::ContributionLie,
        DkgErrorKind::JustifyOmit,
        DkgErrorKind::JustifyLie,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl FromStr for DkgErrorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.to_string() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown DKG error kind: {s}"))
    }
}

/// Probabilities of simulated misbehavior, all zero by default.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SimulatedErrors {
    rates: [f64; DkgErrorKind::ALL.len()],
}

impl SimulatedErrors {
    pub fn set_rate(&mut self, kind: DkgErrorKind, rate: f64) {
        self.rates[kind.index()] = rate.clamp(0.0, 1.0);
    }

    pub fn rate(&self, kind: DkgErrorKind) -> f64 {
        self.rates[kind.index()]
    }

    pub(crate) fn should_simulate<R: Rng + ?Sized>(&self, kind: DkgErrorKind, rng: &mut R) -> bool {
        let rate = self.rate(kind);
        rate > 0.0 && rng.gen_bool(rate)
    }
}
