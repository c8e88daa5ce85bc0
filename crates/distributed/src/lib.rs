//! Reduce-side coordination of distributed two-step SQL queries.
//!
//! Architecture role:
//! - resolves which nodes (and partitions) take part in a query
//! - scatters map queries and pulls their paged results
//! - merges pages locally and runs the reduce query on the embedded engine
//! - retries attempts across topology changes
//!
//! Key modules:
//! - [`coordinator`]
//! - [`topology`]
//! - [`merge`]
//! - [`run`]
//! - [`monitor`]
//! - [`messages`] / [`codec`]

pub mod cluster;
pub mod codec;
pub mod coordinator;
pub mod cursor;
pub mod engine;
pub mod merge;
pub mod messages;
pub mod monitor;
pub mod query;
pub mod run;
pub mod topology;

pub use cluster::{
    CacheMode, CacheTopology, ClusterView, LocalMapExecutor, MembershipEvent, Transport,
};
pub use coordinator::{Collaborators, ReduceCoordinator};
pub use cursor::QueryCursor;
pub use engine::{BatchIter, EngineConnection, EngineRows, LocalEngine, merge_table_name};
pub use merge::{MergeKind, MergeStore, Page};
pub use messages::{
    CancelRequest, FailResponse, NextPageRequest, NextPageResponse, QueryMessage, QueryRequest,
};
pub use query::{MapQuery, ParamValue, SqlFragment, TwoStepQuery};
pub use topology::{Participants, Resolution};
