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

use super::*;
use crate::MIN_MASTERNODE_PROTO_VERSION;
use llmq_common::{
    ChainState, FinalCommitment, InvKind, bls,
    messages::JustifiedShare,
    serialize_hash,
    test_utils::{MockChain, MockClock, MockMasternodes, MockPeers},
};
use llmq_db::{DkgContributionsDb, KVDatabase, MemDb};
use parity_scale_codec::Decode;

struct Net {
    params: LlmqParams,
    masternodes: Arc<MockMasternodes>,
    peers: Arc<MockPeers>,
    sessions: Vec<DkgSession>,
    queues: Vec<Arc<PendingQueues>>,
}

impl Net {
    fn new(errors: &[(usize, DkgErrorKind)]) -> Self {
        let params = LlmqParams::llmq_test();
        let chain = MockChain::new(30);
        let base = chain.block_at(24).unwrap();
        let masternodes = Arc::new(MockMasternodes::new(params.size, 11));
        let peers = Arc::new(MockPeers::default());

        let mut sessions = Vec::new();
        let mut queues = Vec::new();
        for idx in 0..params.size {
            let store = Arc::new(DkgContributions::new(
                DkgContributionsDb::new(MemDb::new().clone_boxed()),
                masternodes.clone(),
                Arc::new(MockClock::default()),
            ));
            let pending = Arc::new(PendingQueues::new(&params));

            let mut simulated = SimulatedErrors::default();
            for (_, kind) in errors.iter().filter(|(member, _)| *member == idx) {
                simulated.set_rate(*kind, 1.0);
            }

            let mut session = DkgSession::new(
                params,
                DkgConfig::default(),
                store,
                peers.clone(),
                pending.clone(),
            )
            .with_simulated_errors(simulated)
            .with_rng(StdRng::seed_from_u64(idx as u64));
            session
                .init(base, masternodes.entries(), masternodes.active(idx).as_ref())
                .unwrap();

            sessions.push(session);
            queues.push(pending);
        }

        Self {
            params,
            masternodes,
            peers,
            sessions,
            queues,
        }
    }

    fn outgoing<M: SessionMessage>(&self) -> Vec<M> {
        self.queues
            .iter()
            .flat_map(|queues| queues.get(M::KIND).pop(usize::MAX))
            .map(|(_, payload)| M::decode(&mut payload.as_slice()).unwrap())
            .collect()
    }

    /// Hands every message to every session, the way the phase handler does
    /// after batch verification.
    fn deliver<M: SessionMessage>(&mut self, messages: Vec<M>) -> Vec<Result<(), Rejected>> {
        let mut results = Vec::new();
        for message in messages {
            let hash = serialize_hash(&message);
            for session in &mut self.sessions {
                let checked = message.pre_verify(session).and_then(|()| {
                    let key = session
                        .member(&message.pro_tx_hash())
                        .map(|member| member.entry.pub_key_operator)
                        .unwrap_or_default();
                    if message.sig().verify_insecure(&key, &message.sign_hash()) {
                        Ok(())
                    } else {
                        Err(Rejected::ban("invalid signature"))
                    }
                });
                if checked.is_ok() {
                    message.clone().receive(session, hash).unwrap();
                }
                results.push(checked);
            }
        }
        results
    }

    fn exchange<M: SessionMessage>(&mut self) {
        let messages = self.outgoing::<M>();
        self.deliver(messages);
    }

    fn contribute(&mut self) {
        for session in &mut self.sessions {
            session.contribute().unwrap();
        }
    }

    /// Runs every phase after the contributions went out.
    fn finish_round(&mut self) -> Vec<Vec<FinalCommitment>> {
        for session in &mut self.sessions {
            session.verify_and_complain().unwrap();
        }
        self.exchange::<Complaint>();

        for session in &mut self.sessions {
            session.verify_and_justify().unwrap();
        }
        self.exchange::<Justification>();

        for session in &mut self.sessions {
            session.verify_and_commit().unwrap();
        }
        self.exchange::<PrematureCommitment>();

        self.sessions
            .iter()
            .map(DkgSession::finalize_commitments)
            .collect()
    }

    fn run_round(&mut self) -> Vec<Vec<FinalCommitment>> {
        self.contribute();
        self.exchange::<Contribution>();
        self.finish_round()
    }

    fn is_bad(&self, session: usize, member: usize) -> bool {
        self.sessions[session].members()[member].bad
    }

    /// Re-signs a contribution with the operator key of member \`idx\`.
    fn sign_as(&self, idx: usize, message: &mut Contribution) {
        let key = self.masternodes.active(idx).unwrap().operator_key;
        message.sig = key.sign(&message.sign_hash()).unwrap();
    }
}

fn assert_excluded(
    commitments: &[Vec<FinalCommitment>],
    member: usize,
    members: &[MasternodeEntry],
    params: &LlmqParams,
) {
    let produced: Vec<_> = commitments.iter().flatten().collect();
    assert!(!produced.is_empty());
    for commitment in produced {
        assert!(!commitment.valid_members.get(member));
        assert!(commitment.verify(params, members, true));
    }
}

#[test]
fn honest_round_agrees_on_one_commitment() {
    let mut net = Net::new(&[]);
    let commitments = net.run_round();

    let members = net.masternodes.entries();
    let first = &commitments[0][0];
    for produced in &commitments {
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0], *first);
    }
    assert_eq!(first.count_valid_members(), 3);
    assert_eq!(first.count_signers(), 3);
    assert!(first.verify(&net.params, &members, true));

    let relayed = net.peers.relayed.lock();
    assert!(relayed.iter().any(|inv| inv.kind == InvKind::QuorumContribution));
    assert!(relayed.iter().any(|inv| inv.kind == InvKind::QuorumPrematureCommitment));
    assert!(!relayed.iter().any(|inv| inv.kind == InvKind::QuorumComplaint));
}

#[test]
fn conflicting_contribution_marks_sender_bad() {
    let mut net = Net::new(&[]);
    net.contribute();
    let mut contributions = net.outgoing::<Contribution>();

    let liar = 2;
    let mut forged = contributions[liar].clone();
    let ids: Vec<_> = net.sessions[0].members().iter().map(|member| member.id).collect();
    let (vvec, _) = bls::generate_contributions(2, &ids, &mut StdRng::seed_from_u64(99)).unwrap();
    forged.vvec = vvec;
    net.sign_as(liar, &mut forged);
    contributions.push(forged);

    let results = net.deliver(contributions);
    assert!(results.iter().all(Result::is_ok));
    for session in 0..net.params.size {
        assert!(net.is_bad(session, liar));
        assert!(!net.is_bad(session, 0));
    }

    let commitments = net.finish_round();
    let members = net.masternodes.entries();
    assert_excluded(&commitments, liar, &members, &net.params);
}

#[test]
fn malformed_contribution_is_banned_and_excluded() {
    let mut net = Net::new(&[]);
    net.contribute();
    let mut contributions = net.outgoing::<Contribution>();

    let liar = 1;
    contributions[liar].vvec.truncate(1);
    let mut forged = contributions.remove(liar);
    net.sign_as(liar, &mut forged);

    let results = net.deliver(vec![forged]);
    assert!(results.iter().all(|result| result.is_err_and(|rejected| rejected.ban)));
    net.deliver(contributions);

    let commitments = net.finish_round();
    for session in [0, 2] {
        assert!(net.is_bad(session, liar));
    }
    let members = net.masternodes.entries();
    assert_excluded(&commitments, liar, &members, &net.params);
}

#[test]
fn wrong_shares_are_resolved_by_justification() {
    let liar = 0;
    let mut net = Net::new(&[(liar, DkgErrorKind::ContributionLie)]);
    net.contribute();
    net.exchange::<Contribution>();

    for session in &mut net.sessions {
        session.verify_and_complain().unwrap();
    }
    assert!(net.sessions[1].members()[liar].we_complain);
    net.exchange::<Complaint>();
    assert_eq!(net.sessions[2].members()[liar].complaints_from_others.len(), 2);

    for session in &mut net.sessions {
        session.verify_and_justify().unwrap();
    }
    net.exchange::<Justification>();
    for session in 1..net.params.size {
        let member = &net.sessions[session].members()[liar];
        assert!(!member.bad);
        assert!(!member.we_complain);
        assert!(member.complaints_from_others.is_empty());
    }

    for session in &mut net.sessions {
        session.verify_and_commit().unwrap();
    }
    net.exchange::<PrematureCommitment>();
    let commitment = net.sessions[1].finalize_commitments().remove(0);
    assert_eq!(commitment.count_valid_members(), 3);
}

#[test]
fn lying_justification_marks_sender_bad() {
    let liar = 1;
    let mut net = Net::new(&[
        (liar, DkgErrorKind::ContributionLie),
        (liar, DkgErrorKind::JustifyLie),
    ]);
    let commitments = net.run_round();

    for session in [0, 2] {
        assert!(net.is_bad(session, liar));
    }
    let members = net.masternodes.entries();
    assert_excluded(&commitments, liar, &members, &net.params);
}

#[test]
fn members_with_old_protocol_are_voted_out() {
    let mut net = Net::new(&[]);
    let members = net.masternodes.entries();
    net.peers.connect_all(&members, MIN_MASTERNODE_PROTO_VERSION);
    let outdated = 2;
    net.peers
        .connected
        .lock()
        .insert(members[outdated].pro_tx_hash, MIN_MASTERNODE_PROTO_VERSION - 1);

    let commitments = net.run_round();
    for session in 0..net.params.size {
        assert!(net.sessions[session].members()[outdated].bad_member_votes.len() >= 2);
        assert!(net.is_bad(session, outdated));
    }
    assert_excluded(&commitments, outdated, &members, &net.params);
}

#[test]
fn omitted_commitment_still_reaches_threshold() {
    let mut net = Net::new(&[(2, DkgErrorKind::CommitOmit)]);
    let commitments = net.run_round();

    assert!(commitments[2].is_empty() || commitments[2][0].count_signers() == 2);
    let commitment = &commitments[0][0];
    assert_eq!(commitment.count_valid_members(), 3);
    assert_eq!(commitment.count_signers(), 2);
    assert!(!commitment.signers.get(2));
}

#[test]
fn pre_verification_rules() {
    let mut net = Net::new(&[]);
    net.contribute();
    let contributions = net.outgoing::<Contribution>();
    let session = &net.sessions[0];

    let mut foreign = contributions[1].clone();
    foreign.quorum_hash = H256::repeat_byte(7);
    assert_eq!(
        session.pre_verify_contribution(&foreign),
        Err(Rejected::drop("message for a different quorum"))
    );

    let mut stranger = contributions[1].clone();
    stranger.pro_tx_hash = H256::repeat_byte(8);
    assert!(session.pre_verify_contribution(&stranger).unwrap_err().ban);

    let mut complaint = Complaint::new(session.quorum_hash(), contributions[1].pro_tx_hash, 2);
    assert!(session.pre_verify_complaint(&complaint).unwrap_err().ban);
    complaint = Complaint::new(session.quorum_hash(), contributions[1].pro_tx_hash, 3);
    assert_eq!(session.pre_verify_complaint(&complaint), Ok(()));

    let justification = Justification {
        quorum_hash: session.quorum_hash(),
        pro_tx_hash: contributions[1].pro_tx_hash,
        contributions: vec![
            JustifiedShare {
                index: 0,
                key: BlsSecretKey::random(&mut StdRng::seed_from_u64(1)),
            },
            JustifiedShare {
                index: 0,
                key: BlsSecretKey::random(&mut StdRng::seed_from_u64(2)),
            },
        ],
        ..Default::default()
    };
    assert_eq!(
        session.pre_verify_justification(&justification),
        Err(Rejected::ban("duplicate justification index"))
    );
}
