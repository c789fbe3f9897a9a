//! Log shipping between a partition leader and its followers.

use super::actor::PartitionActor;
use super::command::Event;
use super::state::StateMachine;
use super::ShardRole;
use crate::error::DatastoreError;
use crate::journal::JournalRecord;
use crate::replication::quorum::QuorumTracker;
use crate::replication::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
};
use crate::types::{LogIndex, MemberName, Term};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Upper bound on entries per append request.
const MAX_ENTRIES_PER_REQUEST: usize = 256;

impl PartitionActor {
    /// Sends pending entries (or a heartbeat) to every idle follower.
    pub(super) fn broadcast(&mut self) {
        let Some(tracker) = &self.tracker else {
            return;
        };
        let followers: Vec<MemberName> = tracker.members().cloned().collect();
        for follower in followers {
            self.replicate_to(&follower);
        }
    }

    fn replicate_to(&mut self, follower: &MemberName) {
        let next_index = {
            let Some(progress) = self.tracker.as_mut().and_then(|t| t.get_mut(follower)) else {
                return;
            };
            if progress.in_flight {
                return;
            }
            progress.in_flight = true;
            progress.next_index
        };

        let term = self.term;
        let transport = Arc::clone(&self.transport);
        let events = self.events_tx.clone();
        let timeout = self.config.operation_timeout;
        let follower = follower.clone();

        if next_index <= self.log.snapshot_index() {
            let index = self.log.last_applied();
            let snapshot_term = self
                .log
                .term_at(index)
                .unwrap_or_else(|| self.log.snapshot_term());
            let request = InstallSnapshotRequest {
                term,
                leader: self.member.clone(),
                snapshot: self.state.snapshot(&self.shard, index, snapshot_term),
            };
            debug!(shard = %self.shard, %follower, %index, "sending snapshot to lagging follower");
            tokio::spawn(async move {
                let result = tokio::time::timeout(timeout, transport.install_snapshot(&follower, request))
                    .await
                    .unwrap_or_else(|_| Err(DatastoreError::timeout("install_snapshot timed out")));
                let _ = events.send(Event::InstallSnapshotResult {
                    follower,
                    term,
                    result,
                });
            });
            return;
        }

        let prev_index = LogIndex::new(next_index.as_u64() - 1);
        let prev_term = self
            .log
            .term_at(prev_index)
            .unwrap_or_else(|| self.log.snapshot_term());
        let entries = self
            .log
            .entries_from(next_index, MAX_ENTRIES_PER_REQUEST)
            .unwrap_or_default();
        let request = AppendEntriesRequest {
            shard: self.shard.clone(),
            term,
            leader: self.member.clone(),
            prev_index,
            prev_term,
            entries,
            leader_commit: self.log.commit_index(),
        };
        tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, transport.append_entries(&follower, request))
                .await
                .unwrap_or_else(|_| Err(DatastoreError::timeout("append_entries timed out")));
            let _ = events.send(Event::AppendEntriesResult {
                follower,
                term,
                result,
            });
        });
    }

    /// Handles the outcome of a request sent to a follower.
    pub(super) fn on_event(&mut self, event: Event) {
        match event {
            Event::AppendEntriesResult {
                follower,
                term,
                result,
            } => {
                if term != self.term || self.tracker.is_none() {
                    return;
                }
                match result {
                    Ok(response) if response.term > self.term => {
                        info!(shard = %self.shard, %follower, term = %response.term, "follower reports a newer term");
                        self.step_down(response.term, None);
                    }
                    Ok(response) if response.success => {
                        let matched = response.last_index.min(self.log.last_index());
                        self.record_contact(&follower, |tracker, now| {
                            tracker.record_success(&follower, matched, now);
                        });
                        self.advance_commit();
                        if self.needs_more(&follower) {
                            self.replicate_to(&follower);
                        }
                    }
                    Ok(response) => {
                        trace!(shard = %self.shard, %follower, follower_last = %response.last_index, "append rejected");
                        self.record_contact(&follower, |tracker, now| {
                            tracker.record_rejection(&follower, response.last_index, now);
                        });
                        self.replicate_to(&follower);
                    }
                    Err(e) => {
                        trace!(shard = %self.shard, %follower, error = %e, "append failed");
                        if let Some(tracker) = self.tracker.as_mut() {
                            tracker.record_failure(&follower);
                        }
                    }
                }
            }
            Event::InstallSnapshotResult {
                follower,
                term,
                result,
            } => {
                if term != self.term || self.tracker.is_none() {
                    return;
                }
                match result {
                    Ok(response) if response.term > self.term => {
                        self.step_down(response.term, None);
                    }
                    Ok(response) if response.success => {
                        debug!(shard = %self.shard, %follower, index = %response.last_index, "follower installed snapshot");
                        self.record_contact(&follower, |tracker, now| {
                            tracker.record_success(&follower, response.last_index, now);
                        });
                        self.advance_commit();
                        if self.needs_more(&follower) {
                            self.replicate_to(&follower);
                        }
                    }
                    Ok(_) | Err(_) => {
                        warn!(shard = %self.shard, %follower, "snapshot installation failed");
                        if let Some(tracker) = self.tracker.as_mut() {
                            tracker.record_failure(&follower);
                        }
                    }
                }
            }
        }
    }

    fn record_contact(
        &mut self,
        follower: &MemberName,
        update: impl FnOnce(&mut QuorumTracker, Instant),
    ) {
        let now = Instant::now();
        if let Some(tracker) = self.tracker.as_mut() {
            if tracker.get(follower).is_some() {
                update(tracker, now);
            }
        }
    }

    fn needs_more(&self, follower: &MemberName) -> bool {
        self.tracker
            .as_ref()
            .and_then(|t| t.get(follower))
            .is_some_and(|p| p.next_index <= self.log.last_index())
    }

    // ---- follower side ----

    fn follow(&mut self, term: Term, leader: &MemberName) {
        if term > self.term
            || self.role != ShardRole::Follower
            || self.leader.as_ref() != Some(leader)
        {
            self.step_down(term, Some(leader.clone()));
        }
    }

    pub(super) fn on_append_entries(&mut self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let reject = |actor: &Self, last_index: LogIndex| AppendEntriesResponse {
            term: actor.term,
            success: false,
            last_index,
        };

        if request.term < self.term {
            return reject(self, self.log.last_index());
        }
        self.follow(request.term, &request.leader);

        let prev_index = request.prev_index;
        if prev_index > self.log.last_index() {
            return reject(self, self.log.last_index());
        }
        if prev_index >= self.log.snapshot_index()
            && self.log.term_at(prev_index) != Some(request.prev_term)
        {
            let back = LogIndex::new(prev_index.as_u64().saturating_sub(1));
            return reject(self, back.max(self.log.commit_index()).min(self.log.last_index()));
        }

        let count = request.entries.len() as u64;
        for entry in request.entries {
            if entry.index <= self.log.snapshot_index() {
                continue;
            }
            match self.log.term_at(entry.index) {
                Some(existing) if existing == entry.term => continue,
                Some(_) => {
                    debug!(shard = %self.shard, index = %entry.index, "dropping conflicting entries");
                    if !self.log.truncate_from(entry.index) {
                        error!(shard = %self.shard, index = %entry.index, "leader conflicts with a committed entry");
                        return reject(self, self.log.commit_index());
                    }
                    if let Err(e) = self.compact_journal() {
                        error!(shard = %self.shard, error = %e, "journal rewrite failed");
                        return reject(self, self.log.last_index());
                    }
                }
                None => {}
            }
            if entry.index != self.log.last_index().next() {
                return reject(self, self.log.last_index());
            }
            match self.journal.append(&JournalRecord::Entry(entry.clone())) {
                Ok(size) => self.log.append(entry, size),
                Err(e) => {
                    error!(shard = %self.shard, error = %e, "journal append failed");
                    return reject(self, self.log.last_index());
                }
            }
        }

        let matched = LogIndex::new(prev_index.as_u64() + count);
        self.log
            .set_commit_index(request.leader_commit.min(matched));
        self.advance_commit();

        AppendEntriesResponse {
            term: self.term,
            success: true,
            last_index: matched.max(self.log.commit_index()),
        }
    }

    pub(super) fn on_install_snapshot(
        &mut self,
        request: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        if request.term < self.term {
            return InstallSnapshotResponse {
                term: self.term,
                success: false,
                last_index: self.log.last_index(),
            };
        }
        self.follow(request.term, &request.leader);

        let snapshot = request.snapshot;
        let index = snapshot.last_index;
        let term = snapshot.last_term;
        if index <= self.log.last_applied() {
            return InstallSnapshotResponse {
                term: self.term,
                success: true,
                last_index: self.log.last_applied(),
            };
        }

        if let Err(e) = self.snapshot_store.save(&snapshot) {
            error!(shard = %self.shard, error = %e, "failed to store installed snapshot");
            return InstallSnapshotResponse {
                term: self.term,
                success: false,
                last_index: self.log.last_index(),
            };
        }
        self.state = StateMachine::from_snapshot(snapshot);
        self.log.reset_to_snapshot(index, term);
        if let Err(e) = self.compact_journal() {
            error!(shard = %self.shard, error = %e, "journal rewrite after snapshot install failed");
        }
        self.snapshots_taken += 1;
        info!(shard = %self.shard, member = %self.member, %index, "installed snapshot from leader");

        InstallSnapshotResponse {
            term: self.term,
            success: true,
            last_index: index,
        }
    }
}
