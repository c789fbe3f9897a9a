//! Replication glue between a partition and its peers.
//!
//! Leadership is assigned from outside (there is no election here). A
//! leader appends entries to its [`ReplicatedLog`], ships them to followers
//! with [`AppendEntriesRequest`]s and commits an entry once a quorum of
//! voters stores it. Heartbeat answers feed the isolated-leader check.

mod log;
mod messages;
mod policy;
pub(crate) mod quorum;

pub use log::{LogEntry, Payload, ReplicatedLog};
pub use messages::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
};
pub use policy::SnapshotTrigger;
pub(crate) use policy::SnapshotPolicy;
