pub mod aggregate;
pub mod app;
pub mod batch;
pub mod config;
pub mod db;
pub mod error;
pub mod explain;
pub mod http;
pub mod jobs;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod persistence;
pub mod poller;
pub mod registry;
pub mod state;
pub mod store;

pub use error::{CollectError, CollectResult};
pub use jobs::{CollectionJob, JobEvent, JobKind, JobStatus, JobTracker};
pub use normalize::{NormalizedQuery, QueryType, classify, normalize};
pub use store::{MemoryStore, SlowQueryStore};
