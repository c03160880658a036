//! Consumed external interfaces: document service, realtime connection,
//! history storage, and the message handler.
//!
//! The realtime connection surfaces its activity as a channel of
//! [`ConnectionEvent`]s rather than emitter callbacks; the manager owns the
//! receiving end for the lifetime of the connection.

use crate::error::SyncError;
use crate::types::{
    ClientDetails, ConnectionDetails, ConnectionMode, ContentMessage, OutboundMessage,
    ParsedSignal, SequencedMessage, SignalMessage,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Events produced by a live [`DeltaConnection`].
#[derive(Debug)]
pub enum ConnectionEvent {
    /// One or more sequenced messages, in server order.
    Op(Vec<SequencedMessage>),
    /// Out-of-band content attachment.
    OpContent(ContentMessage),
    /// Out-of-band signal.
    Signal(SignalMessage),
    /// Server rejected a write attempt; carries the rejection target.
    Nack(i64),
    /// Connection dropped, with a reason.
    Disconnect(String),
    /// Connection-level error.
    Error(SyncError),
    /// Latency probe response.
    Pong(Duration),
}

/// A live realtime connection to the document service.
#[async_trait]
pub trait DeltaConnection: Send + Sync {
    fn details(&self) -> &ConnectionDetails;

    /// Submit a batch of messages (fire-and-forget).
    fn submit(&self, batch: Vec<OutboundMessage>) -> Result<(), SyncError>;

    /// Submit a batch and wait for the socket-level acknowledgement.
    async fn submit_async(&self, batch: Vec<OutboundMessage>) -> Result<(), SyncError>;

    fn submit_signal(&self, content: String) -> Result<(), SyncError>;

    /// Hand over the event channel. Yields `Some` exactly once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>>;

    fn close(&self);
}

/// Bounded read access to the sequenced op history.
#[async_trait]
pub trait DeltaStorage: Send + Sync {
    /// Fetch ops with exclusive bounds: returns `[from+1 ..= to-1]`.
    /// May return more than requested.
    async fn get(&self, from: u64, to: u64) -> Result<Vec<SequencedMessage>, SyncError>;
}

/// Factory for the two transports.
#[async_trait]
pub trait DocumentService: Send + Sync {
    async fn connect_to_delta_stream(
        &self,
        client: ClientDetails,
        mode: ConnectionMode,
    ) -> Result<Arc<dyn DeltaConnection>, SyncError>;

    async fn connect_to_delta_storage(&self) -> Result<Arc<dyn DeltaStorage>, SyncError>;
}

/// Outcome of applying one sequenced message.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessOutcome {
    /// The handler wants an acknowledgement submitted without waiting for
    /// the ack timer.
    pub immediate_no_op: bool,
}

/// Consumer of processed messages and signals.
///
/// An `Err` from [`process`](OpHandler::process) is fatal for the inbound
/// queue: the manager surfaces it and closes.
pub trait OpHandler: Send + Sync {
    fn process(&self, message: &SequencedMessage) -> Result<ProcessOutcome, SyncError>;

    fn process_signal(&self, signal: ParsedSignal);
}
