use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Instant;

use tessera_core::{NonInclusionVote, PBlock, ValidatorId};
use tracing::debug;

use crate::error::ConsensusError;

/// Number of validators needed for a majority of `n`
pub fn quorum(n: usize) -> usize {
    n / 2 + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    PendingBlocks,
    NonInclusionCheck,
    Finalizing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::PendingBlocks => write!(f, "pending-blocks"),
            Phase::NonInclusionCheck => write!(f, "non-inclusion-check"),
            Phase::Finalizing => write!(f, "finalizing"),
        }
    }
}

/// What to do when the pending-blocks timer fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingTimeout {
    /// The timer belongs to an earlier phase
    Stale,
    Finalize,
    /// Quorum reached but incomplete; these validators are missing
    StartNonInclusion(BTreeSet<ValidatorId>),
    /// Below quorum, wait again
    Rearm,
}

/// A validator the majority considers reachable but whose pBlock is missing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingPBlock {
    pub validator: ValidatorId,
    /// Peers that supplied a pBlock this round and did not mark `validator`
    /// unreachable
    pub candidates: Vec<ValidatorId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    Finalize,
    Missing(Vec<MissingPBlock>),
}

/// Round state for one block number
#[derive(Debug)]
pub struct PendingBlock {
    block_number: u64,
    phase: Phase,
    generation: u64,
    own_validator: ValidatorId,
    validator_set: BTreeSet<ValidatorId>,
    received: BTreeMap<ValidatorId, PBlock>,
    own_unreachable: BTreeSet<ValidatorId>,
    votes: BTreeMap<ValidatorId, BTreeSet<ValidatorId>>,
    reconciliation_attempts: u32,
    started_at: Instant,
}

impl PendingBlock {
    pub fn new(
        block_number: u64,
        own_validator: ValidatorId,
        validator_set: impl IntoIterator<Item = ValidatorId>,
    ) -> Self {
        PendingBlock {
            block_number,
            phase: Phase::PendingBlocks,
            generation: 0,
            own_validator,
            validator_set: validator_set.into_iter().collect(),
            received: BTreeMap::new(),
            own_unreachable: BTreeSet::new(),
            votes: BTreeMap::new(),
            reconciliation_attempts: 0,
            started_at: Instant::now(),
        }
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Bumped on every phase change so pending timers can detect staleness
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn validator_set(&self) -> &BTreeSet<ValidatorId> {
        &self.validator_set
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() == self.validator_set.len()
    }

    pub fn has_quorum(&self) -> bool {
        self.received.len() >= quorum(self.validator_set.len())
    }

    pub fn own_unreachable(&self) -> &BTreeSet<ValidatorId> {
        &self.own_unreachable
    }

    pub fn reconciliation_attempts(&self) -> u32 {
        self.reconciliation_attempts
    }

    /// Count a non-inclusion timeout that ended without finalizing
    pub fn record_check_timeout(&mut self) -> u32 {
        self.reconciliation_attempts += 1;
        self.reconciliation_attempts
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.started_at.elapsed().as_millis()
    }

    fn enter(&mut self, phase: Phase) {
        debug!(
            "Round {} {} -> {} after {}ms",
            self.block_number,
            self.phase,
            phase,
            self.elapsed_ms()
        );
        self.phase = phase;
        self.generation += 1;
    }

    fn expect_phase(&self, phase: Phase) -> Result<(), ConsensusError> {
        if self.phase != phase {
            return Err(ConsensusError::WrongPhase {
                block_number: self.block_number,
                phase: self.phase.to_string(),
            });
        }
        Ok(())
    }

    fn check_pblock(&self, pblock: &PBlock) -> Result<(), ConsensusError> {
        if pblock.block_number != self.block_number {
            return Err(ConsensusError::InvalidPBlock(format!(
                "pBlock for block {} fed to round {}",
                pblock.block_number, self.block_number
            )));
        }
        if !self.validator_set.contains(&pblock.proposing_validator) {
            return Err(ConsensusError::UnknownValidator(
                pblock.proposing_validator.to_hex(),
            ));
        }
        if self.received.contains_key(&pblock.proposing_validator) {
            return Err(ConsensusError::DuplicatePBlock(
                pblock.proposing_validator.to_hex(),
            ));
        }
        Ok(())
    }

    /// Accept one validator's pBlock. Returns true once every validator of
    /// the round has contributed, at which point the round is finalizing.
    pub fn add_pblock(&mut self, pblock: PBlock) -> Result<bool, ConsensusError> {
        self.expect_phase(Phase::PendingBlocks)?;
        self.check_pblock(&pblock)?;

        self.received.insert(pblock.proposing_validator, pblock);
        if self.is_complete() {
            self.enter(Phase::Finalizing);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn on_pending_timeout(&mut self, generation: u64) -> PendingTimeout {
        if generation != self.generation || self.phase != Phase::PendingBlocks {
            return PendingTimeout::Stale;
        }
        if self.is_complete() {
            self.enter(Phase::Finalizing);
            return PendingTimeout::Finalize;
        }
        if !self.has_quorum() {
            return PendingTimeout::Rearm;
        }

        self.own_unreachable = self
            .validator_set
            .iter()
            .filter(|v| !self.received.contains_key(v))
            .copied()
            .collect();
        self.enter(Phase::NonInclusionCheck);
        PendingTimeout::StartNonInclusion(self.own_unreachable.clone())
    }

    /// Whether a non-inclusion timer armed at `generation` is still current
    pub fn is_current_check(&self, generation: u64) -> bool {
        self.phase == Phase::NonInclusionCheck && self.generation == generation
    }

    /// This validator's non-inclusion vote
    pub fn own_vote(&self) -> NonInclusionVote {
        NonInclusionVote {
            validator: self.own_validator,
            block_number: self.block_number,
            unreachable_validators: self.own_unreachable.iter().copied().collect(),
        }
    }

    pub fn add_vote(&mut self, vote: &NonInclusionVote) -> Result<(), ConsensusError> {
        self.expect_phase(Phase::NonInclusionCheck)?;
        if vote.block_number != self.block_number {
            return Err(ConsensusError::UnknownRound(vote.block_number));
        }
        if vote.validator == self.own_validator || !self.validator_set.contains(&vote.validator) {
            return Err(ConsensusError::UnknownValidator(vote.validator.to_hex()));
        }
        if self.votes.contains_key(&vote.validator) {
            return Err(ConsensusError::DuplicateVote(vote.validator.to_hex()));
        }

        self.votes.insert(
            vote.validator,
            vote.unreachable_validators.iter().copied().collect(),
        );
        Ok(())
    }

    /// The unreachable set shared by a majority of the votes cast, if any.
    ///
    /// Votes are grouped by their set of validator ids, ignoring order; the
    /// own vote counts like any other. The threshold is taken over the votes
    /// received so far, not the validator set, so a round whose unreachable
    /// peers never vote can still agree.
    pub fn majority(&self) -> Option<BTreeSet<ValidatorId>> {
        if self.phase != Phase::NonInclusionCheck {
            return None;
        }

        let mut groups: BTreeMap<&BTreeSet<ValidatorId>, usize> = BTreeMap::new();
        *groups.entry(&self.own_unreachable).or_default() += 1;
        for unreachable in self.votes.values() {
            *groups.entry(unreachable).or_default() += 1;
        }

        let threshold = quorum(self.votes.len() + 1);
        groups
            .into_iter()
            .find(|(_, count)| *count >= threshold)
            .map(|(set, _)| set.clone())
    }

    /// Align the received pBlocks with the majority view.
    ///
    /// pBlocks of validators the majority marks unreachable are dropped.
    /// Validators the majority considers reachable but whose pBlock is
    /// missing are returned together with the peers to ask for them.
    pub fn reconcile(
        &mut self,
        majority: &BTreeSet<ValidatorId>,
    ) -> Result<Reconciliation, ConsensusError> {
        self.expect_phase(Phase::NonInclusionCheck)?;

        self.received.retain(|v, _| !majority.contains(v));

        let missing: Vec<MissingPBlock> = self
            .validator_set
            .iter()
            .filter(|v| !majority.contains(v) && !self.received.contains_key(v))
            .map(|&validator| MissingPBlock {
                validator,
                candidates: self
                    .received
                    .keys()
                    .filter(|&&peer| peer != self.own_validator)
                    .filter(|peer| {
                        self.votes
                            .get(*peer)
                            .map(|unreachable| !unreachable.contains(&validator))
                            .unwrap_or(true)
                    })
                    .copied()
                    .collect(),
            })
            .collect();

        if missing.is_empty() {
            self.enter(Phase::Finalizing);
            return Ok(Reconciliation::Finalize);
        }

        Ok(Reconciliation::Missing(missing))
    }

    /// Add a pBlock obtained during reconciliation
    pub fn fill_gap(&mut self, pblock: PBlock) -> Result<(), ConsensusError> {
        self.expect_phase(Phase::NonInclusionCheck)?;
        self.check_pblock(&pblock)?;
        self.received.insert(pblock.proposing_validator, pblock);
        Ok(())
    }

    /// Finalize with whatever has been received, returning the validators
    /// left out
    pub fn force_finalize(&mut self) -> BTreeSet<ValidatorId> {
        self.enter(Phase::Finalizing);
        self.excluded_validators()
    }

    pub fn excluded_validators(&self) -> BTreeSet<ValidatorId> {
        self.validator_set
            .iter()
            .filter(|v| !self.received.contains_key(v))
            .copied()
            .collect()
    }

    /// pBlocks that make it into the block, empty ones included
    pub fn included_pblocks(&self) -> Vec<PBlock> {
        self.received.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::{BlockInfo, Command, KeyPair};

    fn validators(n: usize) -> Vec<KeyPair> {
        (0..n).map(|_| KeyPair::generate()).collect()
    }

    fn pblock(kp: &KeyPair) -> PBlock {
        let cmd = Command::safe("main", "kv", "put", json!({ "key": kp.public.to_hex() }));
        PBlock::new_signed(kp, vec![cmd], &BlockInfo::genesis()).unwrap()
    }

    fn round(keys: &[KeyPair]) -> PendingBlock {
        PendingBlock::new(1, keys[0].public, keys.iter().map(|k| k.public))
    }

    fn vote(kp: &KeyPair, unreachable: &[&KeyPair]) -> NonInclusionVote {
        NonInclusionVote {
            validator: kp.public,
            block_number: 1,
            unreachable_validators: unreachable.iter().map(|k| k.public).collect(),
        }
    }

    #[test]
    fn test_quorum() {
        assert_eq!(quorum(1), 1);
        assert_eq!(quorum(3), 2);
        assert_eq!(quorum(4), 3);
        assert_eq!(quorum(5), 3);
    }

    #[test]
    fn test_finalizes_immediately_when_complete() {
        let keys = validators(3);
        let mut round = round(&keys);

        assert!(!round.add_pblock(pblock(&keys[0])).unwrap());
        assert!(!round.add_pblock(pblock(&keys[1])).unwrap());
        assert!(round.add_pblock(pblock(&keys[2])).unwrap());
        assert_eq!(round.phase(), Phase::Finalizing);
        assert_eq!(round.included_pblocks().len(), 3);
    }

    #[test]
    fn test_rejects_duplicate_and_unknown_proposers() {
        let keys = validators(3);
        let mut round = round(&keys);

        round.add_pblock(pblock(&keys[0])).unwrap();
        assert!(matches!(
            round.add_pblock(pblock(&keys[0])),
            Err(ConsensusError::DuplicatePBlock(_))
        ));
        assert!(matches!(
            round.add_pblock(pblock(&KeyPair::generate())),
            Err(ConsensusError::UnknownValidator(_))
        ));
    }

    #[test]
    fn test_timeout_below_quorum_rearms() {
        let keys = validators(5);
        let mut round = round(&keys);
        round.add_pblock(pblock(&keys[0])).unwrap();
        round.add_pblock(pblock(&keys[1])).unwrap();

        let generation = round.generation();
        assert_eq!(round.on_pending_timeout(generation), PendingTimeout::Rearm);
        assert_eq!(round.phase(), Phase::PendingBlocks);
    }

    #[test]
    fn test_timeout_with_quorum_starts_non_inclusion_check() {
        let keys = validators(3);
        let mut round = round(&keys);
        round.add_pblock(pblock(&keys[0])).unwrap();
        round.add_pblock(pblock(&keys[1])).unwrap();

        let generation = round.generation();
        let expected: BTreeSet<_> = [keys[2].public].into_iter().collect();
        assert_eq!(
            round.on_pending_timeout(generation),
            PendingTimeout::StartNonInclusion(expected.clone())
        );
        assert_eq!(round.phase(), Phase::NonInclusionCheck);
        assert_eq!(round.own_unreachable(), &expected);
        assert_eq!(round.own_vote().unreachable_validators, vec![keys[2].public]);

        // The old timer is now stale
        assert_eq!(round.on_pending_timeout(generation), PendingTimeout::Stale);
        // Late pBlocks are rejected outside the pending phase
        assert!(matches!(
            round.add_pblock(pblock(&keys[2])),
            Err(ConsensusError::WrongPhase { .. })
        ));
    }

    #[test]
    fn test_votes_only_in_non_inclusion_phase() {
        let keys = validators(3);
        let mut round = round(&keys);
        assert!(matches!(
            round.add_vote(&vote(&keys[1], &[&keys[2]])),
            Err(ConsensusError::WrongPhase { .. })
        ));

        round.add_pblock(pblock(&keys[0])).unwrap();
        round.add_pblock(pblock(&keys[1])).unwrap();
        round.on_pending_timeout(round.generation());

        round.add_vote(&vote(&keys[1], &[&keys[2]])).unwrap();
        assert!(matches!(
            round.add_vote(&vote(&keys[1], &[&keys[2]])),
            Err(ConsensusError::DuplicateVote(_))
        ));
    }

    #[test]
    fn test_majority_matching_own_view_finalizes() {
        let keys = validators(3);
        let mut round = round(&keys);
        round.add_pblock(pblock(&keys[0])).unwrap();
        round.add_pblock(pblock(&keys[1])).unwrap();
        round.on_pending_timeout(round.generation());

        round.add_vote(&vote(&keys[1], &[&keys[2]])).unwrap();
        let majority = round.majority().unwrap();
        assert_eq!(
            round.reconcile(&majority).unwrap(),
            Reconciliation::Finalize
        );
        assert_eq!(round.phase(), Phase::Finalizing);

        let excluded: BTreeSet<_> = [keys[2].public].into_iter().collect();
        assert_eq!(round.excluded_validators(), excluded);
    }

    #[test]
    fn test_majority_reconciliation_five_validators() {
        // Self (0) received 0, 1, 2, 4 but not 3; everyone else received 3
        // and is missing 4.
        let keys = validators(5);
        let mut round = round(&keys);
        for i in [0, 1, 2, 4] {
            round.add_pblock(pblock(&keys[i])).unwrap();
        }
        round.on_pending_timeout(round.generation());
        assert_eq!(round.own_vote().unreachable_validators, vec![keys[3].public]);

        for i in [1, 2, 3] {
            round.add_vote(&vote(&keys[i], &[&keys[4]])).unwrap();
        }

        let majority = round.majority().unwrap();
        let expected: BTreeSet<_> = [keys[4].public].into_iter().collect();
        assert_eq!(majority, expected);

        let Reconciliation::Missing(missing) = round.reconcile(&majority).unwrap() else {
            panic!("validator 3 should be missing");
        };
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].validator, keys[3].public);
        let mut candidates = missing[0].candidates.clone();
        candidates.sort();
        let mut expected_candidates = vec![keys[1].public, keys[2].public];
        expected_candidates.sort();
        assert_eq!(candidates, expected_candidates);

        round.fill_gap(pblock(&keys[3])).unwrap();
        assert_eq!(
            round.reconcile(&majority).unwrap(),
            Reconciliation::Finalize
        );

        let included: BTreeSet<_> = round
            .included_pblocks()
            .iter()
            .map(|p| p.proposing_validator)
            .collect();
        let expected_included: BTreeSet<_> =
            [0, 1, 2, 3].iter().map(|&i| keys[i].public).collect();
        assert_eq!(included, expected_included);
    }

    #[test]
    fn test_majority_counts_votes_cast() {
        // Validators 3 and 4 never vote; two matching votes out of two agree
        let keys = validators(5);
        let mut round = round(&keys);
        for i in [0, 1, 2] {
            round.add_pblock(pblock(&keys[i])).unwrap();
        }
        round.on_pending_timeout(round.generation());
        round.add_vote(&vote(&keys[1], &[&keys[3], &keys[4]])).unwrap();

        let expected: BTreeSet<_> = [keys[3].public, keys[4].public].into_iter().collect();
        assert_eq!(round.majority(), Some(expected));
    }

    #[test]
    fn test_split_votes_have_no_majority() {
        let keys = validators(5);
        let mut round = round(&keys);
        for i in [0, 1, 2] {
            round.add_pblock(pblock(&keys[i])).unwrap();
        }
        round.on_pending_timeout(round.generation());

        round.add_vote(&vote(&keys[1], &[&keys[4]])).unwrap();
        assert_eq!(round.majority(), None);

        // A third vote breaks the tie
        round.add_vote(&vote(&keys[2], &[&keys[4]])).unwrap();
        let expected: BTreeSet<_> = [keys[4].public].into_iter().collect();
        assert_eq!(round.majority(), Some(expected));
    }

    #[test]
    fn test_vote_order_does_not_matter() {
        let keys = validators(5);
        let mut round = round(&keys);
        for i in [0, 1, 2] {
            round.add_pblock(pblock(&keys[i])).unwrap();
        }
        round.on_pending_timeout(round.generation());

        round.add_vote(&vote(&keys[1], &[&keys[4], &keys[3]])).unwrap();
        round.add_vote(&vote(&keys[2], &[&keys[3], &keys[4]])).unwrap();

        let expected: BTreeSet<_> = [keys[3].public, keys[4].public].into_iter().collect();
        assert_eq!(round.majority(), Some(expected));
    }

    #[test]
    fn test_force_finalize_reports_exclusions() {
        let keys = validators(3);
        let mut round = round(&keys);
        round.add_pblock(pblock(&keys[0])).unwrap();
        round.add_pblock(pblock(&keys[1])).unwrap();
        round.on_pending_timeout(round.generation());
        assert_eq!(round.record_check_timeout(), 1);
        assert_eq!(round.record_check_timeout(), 2);

        let excluded = round.force_finalize();
        assert_eq!(excluded.len(), 1);
        assert!(excluded.contains(&keys[2].public));
        assert_eq!(round.phase(), Phase::Finalizing);
    }
}
