//! The partition task: transaction handling and the apply loop.

use super::command::{Command, Event, Reply};
use super::state::StateMachine;
use super::validator::{is_interested, CommitValidator};
use super::{PartitionSpec, PartitionStatus, ShardRole, ShardStatus};
use crate::cluster::{ClusterMembership, ReplicationTransport};
use crate::commit_queue::{CanCommitDecision, CommitQueue, QueuedTransaction};
use crate::config::DatastoreConfig;
use crate::error::{DatastoreError, DatastoreResult};
use crate::journal::{Journal, JournalRecord};
use crate::replication::quorum::QuorumTracker;
use crate::replication::{LogEntry, Payload, ReplicatedLog, SnapshotPolicy, SnapshotTrigger};
use crate::snapshot::SnapshotStore;
use crate::tree::{DataTree, Modification};
use crate::types::{
    HistoryId, LogIndex, MemberName, ParticipatingShards, ShardName, Term, TransactionId,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

pub(crate) struct PartitionActor {
    pub(super) shard: ShardName,
    pub(super) member: MemberName,
    pub(super) voters: Vec<MemberName>,
    pub(super) config: DatastoreConfig,
    commands: mpsc::Receiver<Command>,
    pub(super) events_tx: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    status: watch::Sender<ShardStatus>,
    pub(super) transport: Arc<dyn ReplicationTransport>,
    membership: Arc<dyn ClusterMembership>,

    pub(super) journal: Journal,
    pub(super) snapshot_store: SnapshotStore,
    pub(super) log: ReplicatedLog,
    policy: SnapshotPolicy,
    pub(super) snapshots_taken: u64,
    pub(super) state: StateMachine,

    pub(super) role: ShardRole,
    pub(super) term: Term,
    pub(super) leader: Option<MemberName>,
    pub(super) tracker: Option<QuorumTracker>,
    leaderless_since: Option<Instant>,
    held: VecDeque<(Instant, Command)>,

    /// Applied tree plus every commit appended but not yet applied.
    tip: DataTree,
    queue: CommitQueue,
    /// Commit entries being replicated, by log index.
    replicating: BTreeMap<LogIndex, (TransactionId, Reply<()>)>,
    can_commit_waiters: HashMap<TransactionId, Reply<()>>,
    validators: Vec<Arc<dyn CommitValidator>>,
    purging_histories: BTreeSet<HistoryId>,
}

impl PartitionActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shard: ShardName,
        member: MemberName,
        spec: PartitionSpec,
        config: DatastoreConfig,
        commands: mpsc::Receiver<Command>,
        status: watch::Sender<ShardStatus>,
        transport: Arc<dyn ReplicationTransport>,
        membership: Arc<dyn ClusterMembership>,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let PartitionSpec {
            voters,
            journal,
            snapshots,
        } = spec;
        let policy = SnapshotPolicy::new(
            config.snapshot_batch_count,
            config.snapshot_data_threshold_bytes,
        );
        Self {
            queue: CommitQueue::new(shard.clone()),
            shard,
            member,
            voters,
            journal: Journal::new(journal, config.sync_journal_on_append),
            snapshot_store: SnapshotStore::new(snapshots),
            config,
            commands,
            events_tx,
            events,
            status,
            transport,
            membership,
            log: ReplicatedLog::new(),
            policy,
            snapshots_taken: 0,
            state: StateMachine::default(),
            role: ShardRole::Follower,
            term: Term::default(),
            leader: None,
            tracker: None,
            leaderless_since: None,
            held: VecDeque::new(),
            tip: DataTree::new(),
            replicating: BTreeMap::new(),
            can_commit_waiters: HashMap::new(),
            validators: Vec::new(),
            purging_histories: BTreeSet::new(),
        }
    }

    pub async fn run(mut self) {
        if let Err(e) = self.recover().await {
            error!(shard = %self.shard, member = %self.member, error = %e, "partition recovery failed");
            return;
        }
        self.leaderless_since = Some(Instant::now());
        self.publish_status();

        if self.voters.len() == 1 && self.voters[0] == self.member {
            let term = self.term.next();
            if let Err(e) = self.become_leader(term, Vec::new()) {
                error!(shard = %self.shard, error = %e, "sole voter failed to take leadership");
            }
        }

        let mut tick = tokio::time::interval(self.config.heartbeat_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        self.stop();
                        break;
                    }
                },
                Some(event) = self.events.recv() => self.on_event(event),
                _ = tick.tick() => self.on_tick(),
            }
        }
        info!(shard = %self.shard, member = %self.member, "partition stopped");
    }

    pub(super) fn handle(&mut self, command: Command) {
        if command.requires_leader() && !self.role.is_leader() {
            self.route_to_leader(command);
            return;
        }

        match command {
            Command::Ready {
                txid,
                shards,
                modifications,
                skipped,
                reply,
            } => {
                let result = self.on_ready(txid, shards, modifications, skipped);
                let _ = reply.send(result);
            }
            Command::CanCommit { txid, reply } => self.on_can_commit(txid, reply),
            Command::Commit { txid, reply } => self.on_commit(txid, reply),
            Command::Abort { txid, reply } => {
                let result = self.on_abort(&txid);
                let _ = reply.send(result);
            }
            Command::Read { path, reply } => {
                let _ = reply.send(Ok(self.state.tree().read(&path)));
            }
            Command::CloseHistory { history, reply } => {
                debug!(shard = %self.shard, %history, "closing history");
                let result = self.propose(Payload::CloseHistory { history }).map(|_| ());
                let _ = reply.send(result);
            }
            Command::RegisterValidator { validator, reply } => {
                debug!(shard = %self.shard, subtree = %validator.subtree(), "registered commit validator");
                self.validators.push(validator);
                let _ = reply.send(Ok(()));
            }
            Command::BecomeLeader {
                term,
                followers,
                reply,
            } => {
                let _ = reply.send(self.become_leader(term, followers));
            }
            Command::BecomeFollower {
                term,
                leader,
                reply,
            } => {
                let result = if term < self.term {
                    Err(self.stale_term(term))
                } else {
                    self.step_down(term, leader);
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Command::AppendEntries { request, reply } => {
                let response = self.on_append_entries(request);
                let _ = reply.send(response);
            }
            Command::InstallSnapshot { request, reply } => {
                let response = self.on_install_snapshot(request);
                let _ = reply.send(response);
            }
            Command::SnapshotNow { reply } => {
                let _ = reply.send(self.take_snapshot(SnapshotTrigger::Requested));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.partition_status());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    // ---- transaction requests (leader) ----

    fn on_ready(
        &mut self,
        txid: TransactionId,
        shards: ParticipatingShards,
        modifications: Vec<Modification>,
        skipped: Vec<Range<u64>>,
    ) -> DatastoreResult<()> {
        self.check_not_isolated()?;

        for range in skipped.into_iter().filter(|range| !range.is_empty()) {
            trace!(shard = %self.shard, history = %txid.history, from = range.start, to = range.end, "recording skipped transactions");
            self.propose(Payload::SkipTransactions {
                history: txid.history.clone(),
                from: range.start,
                to: range.end,
            })?;
        }

        let capacity = self.config.commit_queue_capacity;
        if self.queue.len() + self.replicating.len() >= capacity {
            warn!(shard = %self.shard, %txid, capacity, "commit queue capacity exceeded");
            self.propose(Payload::AbortTransaction { txid: txid.clone() })?;
            return Err(DatastoreError::CommitQueueCapacityExceeded {
                shard: self.shard.clone(),
                txid,
                capacity,
            });
        }

        debug!(shard = %self.shard, %txid, %shards, "transaction readied");
        self.queue.enqueue(QueuedTransaction::new(
            txid,
            shards,
            modifications,
            Instant::now(),
        ))
    }

    fn on_can_commit(&mut self, txid: TransactionId, reply: Reply<()>) {
        if let Err(e) = self.check_not_isolated() {
            let _ = reply.send(Err(e));
            return;
        }
        match self.queue.can_commit(&txid, Instant::now()) {
            Err(e) => {
                let _ = reply.send(Err(e));
            }
            Ok(decision) => {
                self.can_commit_waiters.insert(txid, reply);
                if decision == CanCommitDecision::Proceed {
                    self.process_head();
                }
            }
        }
    }

    /// Validates the head if its `can_commit` is waiting. A head that fails
    /// validation is removed and the next one is tried.
    fn process_head(&mut self) {
        while let Some(txid) = self.queue.promotable_head() {
            let verdict = match self.queue.head() {
                Some(head) => self.validate(head),
                None => break,
            };
            let reply = self.can_commit_waiters.remove(&txid);
            match verdict {
                Ok(()) => {
                    let result = self.queue.can_commit_succeeded(&txid, Instant::now());
                    debug!(shard = %self.shard, %txid, "can_commit succeeded");
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                    break;
                }
                Err(e) => {
                    debug!(shard = %self.shard, %txid, error = %e, "can_commit failed");
                    self.queue.remove(&txid);
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(e));
                    }
                    self.propose_logged(Payload::AbortTransaction { txid });
                }
            }
        }
    }

    fn validate(&self, entry: &QueuedTransaction) -> DatastoreResult<()> {
        let candidate = self.tip.prepare(&entry.modifications)?;
        for validator in &self.validators {
            if is_interested(validator.as_ref(), &entry.modifications) {
                validator.validate(&entry.txid, &entry.modifications, &candidate)?;
            }
        }
        Ok(())
    }

    fn on_commit(&mut self, txid: TransactionId, reply: Reply<()>) {
        if let Err(e) = self.check_not_isolated() {
            let _ = reply.send(Err(e));
            return;
        }
        let entry = match self.queue.take_for_commit(&txid) {
            Ok(entry) => entry,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        // Pre-commit: later can_commit checks see this transaction's effects.
        if let Err(e) = self.tip.apply(&entry.modifications) {
            error!(shard = %self.shard, %txid, error = %e, "validated transaction failed to pre-commit");
            let _ = reply.send(Err(e));
            self.propose_logged(Payload::AbortTransaction { txid });
            self.process_head();
            return;
        }

        let payload = Payload::CommitTransaction {
            txid: txid.clone(),
            modifications: entry.modifications,
        };
        match self.append_entry(payload) {
            Ok(index) => {
                debug!(shard = %self.shard, %txid, %index, "replicating commit");
                self.replicating.insert(index, (txid, reply));
                self.broadcast();
                self.advance_commit();
            }
            Err(e) => {
                let _ = reply.send(Err(e));
                self.rebuild_tip();
            }
        }
        self.process_head();
    }

    fn on_abort(&mut self, txid: &TransactionId) -> DatastoreResult<()> {
        if self.replicating.values().any(|(id, _)| id == txid) {
            return Err(DatastoreError::invalid_operation(format!(
                "transaction {txid} is already committing on shard {}",
                self.shard
            )));
        }
        let Some(entry) = self.queue.remove(txid) else {
            if self.queue.forget_expired(txid) {
                trace!(shard = %self.shard, %txid, "abort of expired transaction");
            } else {
                trace!(shard = %self.shard, %txid, "abort of unknown transaction ignored");
            }
            return Ok(());
        };
        debug!(shard = %self.shard, %txid, state = %entry.state, "transaction aborted");
        if let Some(waiter) = self.can_commit_waiters.remove(txid) {
            let _ = waiter.send(Err(DatastoreError::invalid_operation(format!(
                "transaction {txid} was aborted while waiting for can_commit"
            ))));
        }
        self.propose(Payload::AbortTransaction { txid: txid.clone() })?;
        self.process_head();
        Ok(())
    }

    fn check_not_isolated(&self) -> DatastoreResult<()> {
        if self.role == ShardRole::IsolatedLeader {
            return Err(DatastoreError::IsolatedLeader {
                shard: self.shard.clone(),
                member: self.member.clone(),
            });
        }
        Ok(())
    }

    fn has_pending(&self, history: &HistoryId) -> bool {
        self.queue.txids().any(|txid| &txid.history == history)
            || self
                .replicating
                .values()
                .any(|(txid, _)| &txid.history == history)
    }

    // ---- log and apply ----

    /// Appends an entry to the local log and journal.
    pub(super) fn append_entry(&mut self, payload: Payload) -> DatastoreResult<LogIndex> {
        let entry = LogEntry {
            index: self.log.last_index().next(),
            term: self.term,
            payload,
        };
        let size = self.journal.append(&JournalRecord::Entry(entry.clone()))?;
        let index = entry.index;
        self.log.append(entry, size);
        Ok(index)
    }

    /// Appends and replicates a leader entry.
    fn propose(&mut self, payload: Payload) -> DatastoreResult<LogIndex> {
        let index = self.append_entry(payload)?;
        self.broadcast();
        self.advance_commit();
        Ok(index)
    }

    fn propose_logged(&mut self, payload: Payload) {
        if let Err(e) = self.propose(payload) {
            error!(shard = %self.shard, error = %e, "failed to append entry");
        }
    }

    /// Moves the commit index as far as the quorum allows and applies
    /// everything committed, appending any follow-up entries the leader
    /// owes (purges).
    pub(super) fn advance_commit(&mut self) {
        loop {
            if let Some(tracker) = &self.tracker {
                let index = tracker.quorum_index(self.log.last_index());
                // Only entries of the current term commit by counting.
                if self.log.term_at(index) == Some(self.term) {
                    self.log.set_commit_index(index);
                }
            }

            let followups = self.apply_committed();
            if followups.is_empty() {
                break;
            }
            for payload in followups {
                if let Err(e) = self.append_entry(payload) {
                    error!(shard = %self.shard, error = %e, "failed to append follow-up entry");
                }
            }
            self.broadcast();
        }
    }

    fn apply_committed(&mut self) -> Vec<Payload> {
        let mut followups = Vec::new();
        let mut root_overwrite = false;
        let mut applied = 0usize;

        while let Some(entry) = self.log.next_to_apply().cloned() {
            let result = self.state.apply(&self.shard, &entry);
            self.log.mark_applied(entry.index);
            applied += 1;
            root_overwrite |= entry.payload.is_root_overwrite();
            if self.tracker.is_some() {
                self.after_apply(&entry, result, &mut followups);
            }
        }

        if applied > 0 {
            let marker = JournalRecord::Applied {
                index: self.log.last_applied(),
            };
            if let Err(e) = self.journal.append(&marker) {
                error!(shard = %self.shard, error = %e, "failed to record applied index");
            }
            let trigger = self.policy.evaluate(
                root_overwrite,
                self.log.len() as u64,
                self.log.data_size(),
            );
            if let Some(trigger) = trigger {
                if let Err(e) = self.take_snapshot(trigger) {
                    error!(shard = %self.shard, %trigger, error = %e, "snapshot failed");
                }
            }
        }
        followups
    }

    /// Leader reactions to an applied entry.
    fn after_apply(
        &mut self,
        entry: &LogEntry,
        result: DatastoreResult<()>,
        followups: &mut Vec<Payload>,
    ) {
        match &entry.payload {
            Payload::CommitTransaction { txid, .. } => {
                if let Some((_, reply)) = self.replicating.remove(&entry.index) {
                    debug!(shard = %self.shard, %txid, index = %entry.index, "commit applied");
                    let _ = reply.send(result);
                }
                followups.push(Payload::PurgeTransaction { txid: txid.clone() });
            }
            Payload::AbortTransaction { txid } => {
                followups.push(Payload::PurgeTransaction { txid: txid.clone() });
            }
            Payload::PurgeTransaction { .. } | Payload::CloseHistory { .. } => {
                for history in self.state.frontend().purgeable_histories() {
                    if !self.purging_histories.contains(&history) && !self.has_pending(&history) {
                        debug!(shard = %self.shard, %history, "purging history");
                        self.purging_histories.insert(history.clone());
                        followups.push(Payload::PurgeHistory { history });
                    }
                }
            }
            Payload::PurgeHistory { history } => {
                self.purging_histories.remove(history);
            }
            Payload::SkipTransactions { .. } | Payload::LeaderNoop => {}
        }
    }

    /// Captures a snapshot at the last applied index and trims the log
    /// and journal.
    pub(super) fn take_snapshot(&mut self, trigger: SnapshotTrigger) -> DatastoreResult<LogIndex> {
        let index = self.log.last_applied();
        let term = self
            .log
            .term_at(index)
            .unwrap_or_else(|| self.log.snapshot_term());
        let snapshot = self.state.snapshot(&self.shard, index, term);
        self.snapshot_store.save(&snapshot)?;
        self.log.snapshot_taken(index, term);
        self.compact_journal()?;
        self.snapshots_taken += 1;
        info!(shard = %self.shard, member = %self.member, %index, %trigger, "captured snapshot");
        Ok(index)
    }

    /// Rewrites the journal to match the in-memory log.
    pub(super) fn compact_journal(&mut self) -> DatastoreResult<()> {
        let mut records = Vec::with_capacity(self.log.len() + 2);
        if self.log.snapshot_index() > LogIndex::ZERO {
            records.push(JournalRecord::SnapshotMarker {
                index: self.log.snapshot_index(),
                term: self.log.snapshot_term(),
            });
        }
        let retained = self
            .log
            .entries_from(self.log.snapshot_index().next(), usize::MAX)
            .unwrap_or_default();
        records.extend(retained.into_iter().map(JournalRecord::Entry));
        if self.log.last_applied() > self.log.snapshot_index() {
            records.push(JournalRecord::Applied {
                index: self.log.last_applied(),
            });
        }
        self.journal.compact(records.iter())
    }

    /// Recomputes the tip from the applied tree and unapplied commits.
    fn rebuild_tip(&mut self) {
        let mut tip = self.state.tree().clone();
        let pending = self
            .log
            .entries_from(self.log.last_applied().next(), usize::MAX)
            .unwrap_or_default();
        for entry in pending {
            if let Payload::CommitTransaction { txid, modifications } = entry.payload {
                if let Err(e) = tip.apply(&modifications) {
                    warn!(shard = %self.shard, %txid, error = %e, "pending commit does not apply to tip");
                }
            }
        }
        self.tip = tip;
    }

    // ---- roles ----

    pub(super) fn become_leader(
        &mut self,
        term: Term,
        followers: Vec<MemberName>,
    ) -> DatastoreResult<()> {
        if term < self.term || (term == self.term && self.role.is_leader()) {
            return Err(self.stale_term(term));
        }
        let followers: Vec<MemberName> = followers
            .into_iter()
            .filter(|follower| follower != &self.member)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let voters = followers.len() + 1;
        let now = Instant::now();

        self.term = term;
        self.role = ShardRole::Leader;
        self.leader = Some(self.member.clone());
        self.leaderless_since = None;
        self.tracker = Some(QuorumTracker::new(
            followers,
            self.log.last_index(),
            now,
            self.config.replication_quorum(voters),
            self.config.min_isolated_leader_peer_count(voters),
        ));
        self.purging_histories.clear();
        self.rebuild_tip();
        info!(shard = %self.shard, member = %self.member, %term, voters, "became leader");
        self.publish_status();

        self.append_entry(Payload::LeaderNoop)?;
        for txid in self.unpurged_without_pending_purge() {
            self.append_entry(Payload::PurgeTransaction { txid })?;
        }
        self.broadcast();
        self.advance_commit();
        self.release_held();
        Ok(())
    }

    /// Finished transactions a previous leader never got to purge.
    fn unpurged_without_pending_purge(&self) -> Vec<TransactionId> {
        let pending: HashSet<TransactionId> = self
            .log
            .entries_from(self.log.last_applied().next(), usize::MAX)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| match entry.payload {
                Payload::PurgeTransaction { txid } => Some(txid),
                _ => None,
            })
            .collect();
        self.state
            .frontend()
            .unpurged_transactions()
            .into_iter()
            .filter(|txid| !pending.contains(txid))
            .collect()
    }

    /// Becomes a follower, failing every transaction request this replica
    /// held as leader.
    pub(super) fn step_down(&mut self, term: Term, leader: Option<MemberName>) {
        let was_leader = self.role.is_leader();
        self.term = self.term.max(term);
        self.role = ShardRole::Follower;
        self.tracker = None;
        self.leaderless_since = match leader {
            Some(_) => None,
            None => self.leaderless_since.or_else(|| Some(Instant::now())),
        };
        self.leader = leader;

        if was_leader {
            info!(shard = %self.shard, member = %self.member, term = %self.term, leader = ?self.leader, "stepped down");
            let error = DatastoreError::NotLeader {
                shard: self.shard.clone(),
                member: self.member.clone(),
                leader: self.leader.clone(),
            };
            for entry in self.queue.drain() {
                if let Some(waiter) = self.can_commit_waiters.remove(&entry.txid) {
                    let _ = waiter.send(Err(error.clone()));
                }
            }
            for (_, (_, reply)) in std::mem::take(&mut self.replicating) {
                let _ = reply.send(Err(error.clone()));
            }
            self.can_commit_waiters.clear();
            self.purging_histories.clear();
            self.tip = DataTree::new();
        }
        self.publish_status();
        self.release_held();
    }

    pub(super) fn stale_term(&self, term: Term) -> DatastoreError {
        DatastoreError::invalid_operation(format!(
            "term {term} is not newer than current term {} on shard {}",
            self.term, self.shard
        ))
    }

    /// Forwards, holds or rejects a request only a leader may serve.
    fn route_to_leader(&mut self, command: Command) {
        let now = Instant::now();
        if let Some(leader) = self.leader.clone() {
            if !self.config.follower_forwarding {
                command.fail(DatastoreError::NotLeader {
                    shard: self.shard.clone(),
                    member: self.member.clone(),
                    leader: Some(leader),
                });
                return;
            }
            if self.membership.is_reachable(&self.member, &leader) {
                if let Some(handle) = self.membership.resolve(&leader, &self.shard) {
                    trace!(shard = %self.shard, %leader, command = command.name(), "forwarding to leader");
                    tokio::spawn(async move { handle.forward(command).await });
                    return;
                }
            }
        }

        let leaderless_for = self
            .leaderless_since
            .map(|since| now.saturating_duration_since(since));
        if leaderless_for.is_some_and(|elapsed| elapsed >= self.config.leader_election_timeout) {
            command.fail(self.no_leader());
            return;
        }
        trace!(shard = %self.shard, command = command.name(), "holding request until a leader is known");
        self.held.push_back((now, command));
    }

    /// Re-routes held requests after a role or leader change.
    fn release_held(&mut self) {
        let held: Vec<(Instant, Command)> = self.held.drain(..).collect();
        for (since, command) in held {
            if command.requires_leader() && !self.role.is_leader() && self.leader.is_none() {
                self.held.push_back((since, command));
            } else {
                self.handle(command);
            }
        }
    }

    fn no_leader(&self) -> DatastoreError {
        DatastoreError::NoLeader {
            shard: self.shard.clone(),
        }
    }

    // ---- housekeeping ----

    fn on_tick(&mut self) {
        let now = Instant::now();
        self.expire_held(now);
        if self.tracker.is_some() {
            self.check_isolation(now);
            self.broadcast();
            self.expire_queue_head(now);
        }
    }

    fn expire_held(&mut self, now: Instant) {
        let timeout = self.config.leader_election_timeout;
        while self
            .held
            .front()
            .is_some_and(|(since, _)| now.saturating_duration_since(*since) >= timeout)
        {
            if let Some((_, command)) = self.held.pop_front() {
                debug!(shard = %self.shard, command = command.name(), "no leader within election timeout");
                command.fail(self.no_leader());
            }
        }
    }

    fn check_isolation(&mut self, now: Instant) {
        let Some(tracker) = &self.tracker else {
            return;
        };
        let isolated = tracker.is_isolated(now, self.config.isolated_leader_check_interval);
        match (self.role, isolated) {
            (ShardRole::Leader, true) => {
                warn!(
                    shard = %self.shard,
                    member = %self.member,
                    reachable = tracker.reachable(now, self.config.isolated_leader_check_interval),
                    "leader is isolated from its followers"
                );
                self.role = ShardRole::IsolatedLeader;
                self.publish_status();
            }
            (ShardRole::IsolatedLeader, false) => {
                info!(shard = %self.shard, member = %self.member, "leader regained follower contact");
                self.role = ShardRole::Leader;
                self.publish_status();
            }
            _ => {}
        }
    }

    fn expire_queue_head(&mut self, now: Instant) {
        let timeout = self.config.commit_queue_expiry_timeout;
        let Some((head, idle)) = self.queue.expired_head(now, timeout) else {
            return;
        };
        let txid = head.txid.clone();
        let state = head.state;
        let idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX);
        warn!(shard = %self.shard, %txid, %state, idle_ms, "expiring idle commit queue head");

        let error =
            DatastoreError::timeout(format!("backend timeout in state {state} after {idle_ms}ms"));
        self.queue.expire(&txid, error.clone());
        if let Some(waiter) = self.can_commit_waiters.remove(&txid) {
            let _ = waiter.send(Err(error));
        }
        self.propose_logged(Payload::AbortTransaction { txid });
        self.process_head();
    }

    pub(super) fn publish_status(&self) {
        self.status.send_replace(ShardStatus {
            initialized: true,
            role: self.role,
            term: self.term,
            leader: self.leader.clone(),
        });
    }

    fn partition_status(&self) -> PartitionStatus {
        PartitionStatus {
            shard: self.shard.clone(),
            member: self.member.clone(),
            role: self.role,
            term: self.term,
            leader: self.leader.clone(),
            commit_index: self.log.commit_index(),
            last_applied: self.log.last_applied(),
            snapshot_index: self.log.snapshot_index(),
            snapshots_taken: self.snapshots_taken,
            log_entries: self.log.len(),
            queue_len: self.queue.len(),
            replicating_len: self.replicating.len(),
            live_histories: self.state.frontend().live_histories().cloned().collect(),
            purged_histories: self.state.frontend().purged_histories().cloned().collect(),
            purged_ranges: self
                .state
                .frontend()
                .live_histories()
                .filter_map(|history| {
                    let meta = self.state.frontend().history(history)?;
                    Some((history.clone(), meta.purged().ranges().to_vec()))
                })
                .collect(),
        }
    }

    /// Fails everything still waiting on this partition.
    fn stop(&mut self) {
        let error = DatastoreError::PartitionStopped {
            shard: self.shard.clone(),
            member: self.member.clone(),
        };
        for (_, command) in self.held.drain(..) {
            command.fail(error.clone());
        }
        self.queue.drain().for_each(drop);
        for (_, reply) in self.can_commit_waiters.drain() {
            let _ = reply.send(Err(error.clone()));
        }
        for (_, (_, reply)) in std::mem::take(&mut self.replicating) {
            let _ = reply.send(Err(error.clone()));
        }
        if let Err(e) = self.journal.flush() {
            warn!(shard = %self.shard, error = %e, "journal flush on stop failed");
        }
        self.role = ShardRole::Follower;
        self.leader = None;
        self.tracker = None;
        self.status.send_replace(ShardStatus {
            initialized: false,
            role: ShardRole::Follower,
            term: self.term,
            leader: None,
        });
    }
}
