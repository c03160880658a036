//! Delta Sync Client Core
//!
//! Client-side delta synchronization for a collaborative document runtime:
//! a totally ordered stream of sequenced operations between a client and a
//! document service over two transports (a realtime bidirectional stream
//! and a bounded history endpoint), plus an epoch tracker that binds every
//! request and cached artifact to the server-assigned epoch.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use delta_sync::{ClientDetails, ConnectionMode, DeltaManager};
//! use std::sync::Arc;
//!
//! # async fn run(service: Arc<dyn delta_sync::DocumentService>,
//! #              handler: Arc<dyn delta_sync::OpHandler>) -> Result<(), delta_sync::SyncError> {
//! let manager = DeltaManager::new(service, ClientDetails::new(ConnectionMode::Write), true);
//!
//! // Open the realtime stream and start delivery from sequence 0.
//! let details = manager.connect("DocumentOpen").await?;
//! manager.attach_op_handler(0, 0, handler, true);
//! println!("connected as {}", details.client_id);
//!
//! // Ops flow: stream -> pending content resolution -> in-order apply.
//! // Outbound: submit() batches into flush()-delimited groups.
//! # Ok(())
//! # }
//! ```
//!
//! Delta flow: stream events enter the pending queue (resolving
//! out-of-band content), advance through the inbound queue in strict
//! sequence order into the handler, and acknowledgements feed back through
//! the outbound queue onto the stream. The storage fetcher fills gaps and
//! performs initial catch-up.

mod cache;
mod content;
mod epoch;
mod error;
mod fetcher;
mod latch;
mod limiter;
mod manager;
mod queue;
mod service;
mod types;

pub use cache::{CacheEntry, CachedValue, FileEntry, PersistentCache};
pub use content::{ContentCache, DEFAULT_CONTENT_BUFFER_SIZE};
pub use epoch::{
    EpochTracker, FetchRequest, FetchResult, FetchType, RedeemingEpochTracker, EPOCH_HEADER,
    MAX_URL_LENGTH,
};
pub use error::SyncError;
pub use fetcher::{MAX_BATCH_DELTAS, MAX_FETCH_DELAY, MISSING_FETCH_DELAY};
pub use latch::Deferred;
pub use limiter::{RateLimiter, DEFAULT_CONCURRENT_REQUESTS};
pub use manager::{
    DeltaManager, DeltaManagerEvent, ACK_TIMER_DELAY, DEFAULT_CHUNK_SIZE,
    INITIAL_RECONNECT_DELAY, MAX_RECONNECT_DELAY,
};
pub use queue::MessageQueue;
pub use service::{
    ConnectionEvent, DeltaConnection, DeltaStorage, DocumentService, OpHandler, ProcessOutcome,
};
pub use types::{
    ClientDetails, ConnectionDetails, ConnectionMode, ContentMessage, MessageType,
    OutboundMessage, ParsedSignal, SequencedMessage, SignalMessage, Trace,
};
