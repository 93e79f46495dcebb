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

use super::{DkgSession, Rejected, SessionMessage};
use crate::{DkgError, MIN_MASTERNODE_PROTO_VERSION};
use llmq_common::{
    H256,
    messages::{Complaint, DkgMessage},
};

impl DkgSession {
    pub fn verify_and_complain(&mut self) -> Result<(), DkgError> {
        if !self.are_we_member() {
            return Ok(());
        }

        self.verify_pending_contributions()?;

        let missing: Vec<usize> = self
            .members
            .iter()
            .filter(|member| !member.bad && member.contributions.is_empty())
            .map(|member| member.idx)
            .collect();
        for idx in missing {
            self.mark_bad_member(idx);
        }

        self.verify_connection_and_min_proto_versions();
        self.send_complaint()
    }

    /// Flags members we are not connected to, or connected with a too old
    /// protocol version.
    pub fn verify_connection_and_min_proto_versions(&mut self) {
        let Some(my_idx) = self.my_member_index() else {
            return;
        };

        let _span = self.span.clone().entered();
        let connected = self.peers.connected_masternodes();
        let all_members_connected = self.config.all_members_connected;
        for member in self.members.iter_mut().filter(|member| member.idx != my_idx) {
            match connected.get(&member.entry.pro_tx_hash) {
                None => {
                    member.bad_connection = all_members_connected;
                    tracing::trace!(idx = member.idx, "member not connected");
                }
                Some(version) if *version < MIN_MASTERNODE_PROTO_VERSION => {
                    member.bad_connection = true;
                    tracing::debug!(idx = member.idx, version, "member has an old protocol version");
                }
                Some(_) => {}
            }
        }
    }

    pub fn send_complaint(&mut self) -> Result<(), DkgError> {
        let Some((_, active)) = self.my.clone() else {
            return Ok(());
        };

        let mut message = Complaint::new(self.quorum_hash(), active.pro_tx_hash, self.params.size);
        let (mut bad_count, mut complaint_count) = (0, 0);
        for member in &self.members {
            if member.bad || member.bad_connection {
                message.bad_members.set(member.idx, true);
                bad_count += 1;
            } else if member.we_complain {
                message.complain_for_members.set(member.idx, true);
                complaint_count += 1;
            }
        }

        if bad_count == 0 && complaint_count == 0 {
            return Ok(());
        }

        let _span = self.span.clone().entered();
        tracing::debug!(bad_count, complaint_count, "sending complaint");
        message.sig = active.operator_key.sign(&message.sign_hash())?;
        self.queues.push_local(&message);
        Ok(())
    }

    pub fn pre_verify_complaint(&self, message: &Complaint) -> Result<(), Rejected> {
        let member = self.sender(message)?;

        if message.bad_members.len() != self.params.size {
            return Err(Rejected::ban("invalid bad members bitset size"));
        }
        if message.complain_for_members.len() != self.params.size {
            return Err(Rejected::ban("invalid complain for members bitset size"));
        }
        if member.complaints.len() >= 2 {
            return Err(Rejected::drop("too many complaints from member"));
        }

        Ok(())
    }

    pub fn receive_complaint(&mut self, message: Complaint, hash: H256) -> Result<(), DkgError> {
        let Some(idx) = self.members_map.get(&message.pro_tx_hash).copied() else {
            return Ok(());
        };
        let _span = self.span.clone().entered();

        if self.members[idx].complaints.len() >= 2 {
            return Ok(());
        }
        self.members[idx].complaints.insert(hash);
        self.relay(Complaint::KIND, hash);

        if self.members[idx].complaints.len() > 1 {
            tracing::debug!(from = idx, "member sent multiple complaints");
            self.mark_bad_member(idx);
            self.complaints.insert(hash, message);
            return Ok(());
        }

        let sender = message.pro_tx_hash;
        let my_idx = self.my_member_index();
        for member in &mut self.members {
            if message.bad_members.get(member.idx) {
                tracing::trace!(from = idx, bad = member.idx, "member voted for another to be bad");
                member.bad_member_votes.insert(sender);
                if my_idx == Some(member.idx) {
                    tracing::debug!(from = idx, "member voted for us to be bad");
                }
            }
            if message.complain_for_members.get(member.idx) {
                member.complaints_from_others.insert(sender);
                member.someone_complain = true;
                if my_idx == Some(member.idx) {
                    tracing::debug!(from = idx, "member complained about us");
                }
            }
        }
        self.complaints.insert(hash, message);

        tracing::debug!(
            from = idx,
            received = self.received_count(|member| &member.complaints),
            total = self.members.len(),
            "received and relayed complaint"
        );
        Ok(())
    }
}

impl SessionMessage for Complaint {
    fn pre_verify(&self, session: &DkgSession) -> Result<(), Rejected> {
        session.pre_verify_complaint(self)
    }

    fn receive(self, session: &mut DkgSession, hash: H256) -> Result<(), DkgError> {
        session.receive_complaint(self, hash)
    }
}
