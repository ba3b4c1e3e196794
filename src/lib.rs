//! Streaming gzip filters for an HTTP accelerating cache
//!
//! Objects are compressed, decompressed or validated while they move between
//! a backend, object storage and a client, one bounded chunk at a time.
//!
//! ```text
//! backend ──► FetchFilter ──► StreamContext ──► storage segments
//! storage ──► DeliveryFilter ──► StreamContext ──► scratch ──► client sink
//! ```

pub mod backend;
pub mod codec;
pub mod config;
pub mod context;
pub mod delivery;
pub mod dst;
pub mod error;
pub mod fetch;
pub mod scratch;
pub mod simulated;
pub mod stats;
pub mod storage;
pub mod view;

pub use backend::{BackendConnection, ReadBackend, ScriptedBackend};
pub use codec::{BitMarkers, CodecEngine, CodecStatus, Direction, FlushMode, GzipEngine, QualityParams};
pub use config::{GzipConfig, TrailingGarbage};
pub use context::{ContextSummary, StepOutput, StreamContext, Teardown};
pub use delivery::{ByteSink, DeliveryFilter, SinkAction, WriteSink};
pub use error::{ConfigError, FilterError};
pub use fetch::{Fetch, FetchFilter, FetchMode, FetchState, Pull};
pub use simulated::{FaultConfig, FaultInjector, FaultStats, SimulatedBackend, SimulatedObject};
pub use storage::{InMemoryObject, ObjectMetadata, ObjectStorage, Segment};
