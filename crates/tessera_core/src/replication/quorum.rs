//! Leader-side follower progress and isolation tracking.

use crate::types::{LogIndex, MemberName};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// What the leader knows about one follower.
#[derive(Debug, Clone)]
pub(crate) struct FollowerProgress {
    /// Highest index known to be stored on the follower.
    pub match_index: LogIndex,
    /// Next index to send.
    pub next_index: LogIndex,
    /// Last time the follower answered.
    pub last_contact: Instant,
    /// Whether a request to the follower is outstanding.
    pub in_flight: bool,
}

/// Replication progress of every follower of one leader term.
#[derive(Debug)]
pub(crate) struct QuorumTracker {
    followers: BTreeMap<MemberName, FollowerProgress>,
    quorum: usize,
    min_peers: usize,
}

impl QuorumTracker {
    /// Starts tracking `followers`, granting each a full check interval of
    /// grace from `now`.
    pub fn new(
        followers: impl IntoIterator<Item = MemberName>,
        leader_last: LogIndex,
        now: Instant,
        quorum: usize,
        min_peers: usize,
    ) -> Self {
        let followers = followers
            .into_iter()
            .map(|member| {
                let progress = FollowerProgress {
                    match_index: LogIndex::ZERO,
                    next_index: leader_last.next(),
                    last_contact: now,
                    in_flight: false,
                };
                (member, progress)
            })
            .collect();
        Self {
            followers,
            quorum,
            min_peers,
        }
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberName> {
        self.followers.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.followers.is_empty()
    }

    pub fn get(&self, member: &MemberName) -> Option<&FollowerProgress> {
        self.followers.get(member)
    }

    pub fn get_mut(&mut self, member: &MemberName) -> Option<&mut FollowerProgress> {
        self.followers.get_mut(member)
    }

    /// Records a successful append on `member`.
    pub fn record_success(&mut self, member: &MemberName, match_index: LogIndex, now: Instant) {
        if let Some(progress) = self.followers.get_mut(member) {
            progress.match_index = progress.match_index.max(match_index);
            progress.next_index = progress.match_index.next();
            progress.last_contact = now;
            progress.in_flight = false;
        }
    }

    /// Records that `member` refused an append because its log ends at
    /// `follower_last`.
    pub fn record_rejection(&mut self, member: &MemberName, follower_last: LogIndex, now: Instant) {
        if let Some(progress) = self.followers.get_mut(member) {
            progress.next_index = follower_last.next().max(progress.match_index.next());
            progress.last_contact = now;
            progress.in_flight = false;
        }
    }

    /// Records that a request to `member` failed without an answer.
    pub fn record_failure(&mut self, member: &MemberName) {
        if let Some(progress) = self.followers.get_mut(member) {
            progress.in_flight = false;
        }
    }

    /// Highest index stored on a quorum of voters, the leader holding
    /// everything up to `leader_last`.
    pub fn quorum_index(&self, leader_last: LogIndex) -> LogIndex {
        let mut matches: Vec<LogIndex> = self
            .followers
            .values()
            .map(|p| p.match_index)
            .chain(std::iter::once(leader_last))
            .collect();
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let position = self.quorum.clamp(1, matches.len()) - 1;
        matches[position]
    }

    /// Followers that answered within `threshold` of `now`.
    pub fn reachable(&self, now: Instant, threshold: Duration) -> usize {
        self.followers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_contact) <= threshold)
            .count()
    }

    /// Returns true if too few followers answered recently to form a quorum.
    pub fn is_isolated(&self, now: Instant, threshold: Duration) -> bool {
        self.reachable(now, threshold) < self.min_peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(names: &[&str]) -> Vec<MemberName> {
        names.iter().map(MemberName::new).collect()
    }

    #[test]
    fn quorum_index_is_majority_match() {
        let now = Instant::now();
        let mut tracker = QuorumTracker::new(members(&["b", "c"]), LogIndex::new(5), now, 2, 1);
        assert_eq!(tracker.quorum_index(LogIndex::new(7)), LogIndex::ZERO);

        tracker.record_success(&MemberName::new("b"), LogIndex::new(6), now);
        assert_eq!(tracker.quorum_index(LogIndex::new(7)), LogIndex::new(6));

        tracker.record_success(&MemberName::new("c"), LogIndex::new(7), now);
        assert_eq!(tracker.quorum_index(LogIndex::new(7)), LogIndex::new(7));
    }

    #[test]
    fn sole_voter_commits_alone() {
        let tracker = QuorumTracker::new(Vec::new(), LogIndex::ZERO, Instant::now(), 1, 0);
        assert_eq!(tracker.quorum_index(LogIndex::new(3)), LogIndex::new(3));
        assert!(!tracker.is_isolated(Instant::now(), Duration::ZERO));
    }

    #[test]
    fn rejection_rewinds_next_index() {
        let now = Instant::now();
        let b = MemberName::new("b");
        let mut tracker = QuorumTracker::new(vec![b.clone()], LogIndex::new(10), now, 2, 1);
        assert_eq!(tracker.get(&b).unwrap().next_index, LogIndex::new(11));

        tracker.record_rejection(&b, LogIndex::new(4), now);
        assert_eq!(tracker.get(&b).unwrap().next_index, LogIndex::new(5));
    }

    #[tokio::test(start_paused = true)]
    async fn isolation_follows_contact_age() {
        let start = Instant::now();
        let b = MemberName::new("b");
        let c = MemberName::new("c");
        let mut tracker =
            QuorumTracker::new(vec![b.clone(), c.clone()], LogIndex::ZERO, start, 2, 1);
        let threshold = Duration::from_secs(1);

        assert!(!tracker.is_isolated(start, threshold));

        tokio::time::advance(Duration::from_secs(2)).await;
        let later = Instant::now();
        assert!(tracker.is_isolated(later, threshold));

        tracker.record_success(&c, LogIndex::ZERO, later);
        assert_eq!(tracker.reachable(later, threshold), 1);
        assert!(!tracker.is_isolated(later, threshold));
    }
}
