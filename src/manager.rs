//! Delta manager: connection lifecycle, in-order delivery, and outbound
//! batching for the sequenced op stream.

use crate::content::{ContentCache, DEFAULT_CONTENT_BUFFER_SIZE};
use crate::error::SyncError;
use crate::fetcher::DeltaFetcher;
use crate::latch::Deferred;
use crate::queue::{ErrorSink, MessageQueue};
use crate::service::{ConnectionEvent, DeltaConnection, DocumentService, OpHandler};
use crate::types::{
    ClientDetails, ConnectionDetails, ConnectionMode, MessageType, OutboundMessage, ParsedSignal,
    SequencedMessage, SignalMessage, Trace,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

/// First reconnect delay; doubles per failed attempt.
pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

/// Cap on the reconnect delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_millis(8000);

/// Delay before a processed message is acknowledged with a no-op.
pub const ACK_TIMER_DELAY: Duration = Duration::from_millis(100);

/// Fallback outbound message size limit when the server advertises none.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// How long the pending stage waits for the content side channel before
/// fetching the single op from storage.
const OP_CONTENT_WAIT: Duration = Duration::from_millis(100);

/// First sequence/MSN distance worth reporting.
const MSN_TELEMETRY_FLOOR: u64 = 30;

/// Growth step between MSN distance reports.
const MSN_TELEMETRY_STEP: u64 = 20;

/// Events observed on the manager.
#[derive(Clone, Debug)]
pub enum DeltaManagerEvent {
    Connect(ConnectionDetails),
    Disconnect(String),
    Error(SyncError),
    Pong(Duration),
    /// Wall time spent applying one message.
    ProcessTime(Duration),
    /// Every submitted op has been observed back in the stream.
    AllSentOpsAckd,
    /// A gap-fill or catch-up pass left no messages parked out of order.
    CaughtUp,
    /// A batch is about to move to the outbound queue.
    PrepareSend(Vec<OutboundMessage>),
    SubmitOp(OutboundMessage),
    /// The reconnect ladder is sleeping before the next attempt.
    ConnectionDelay(Duration),
}

struct ActiveConnection {
    connection: Arc<dyn DeltaConnection>,
    generation: u64,
    /// Filled in once the event dispatch task is running.
    dispatch: Option<JoinHandle<()>>,
}

struct SequenceState {
    /// Sequence number of the last processed message.
    base_seq: u64,
    /// Highest observed minimum sequence number.
    min_seq: u64,
    /// Sequence number of the last message handed to the pipeline.
    last_queued_seq: u64,
    /// Last assigned client sequence number on this connection.
    client_seq: u64,
    /// Highest own client sequence number seen back in the stream.
    client_seq_observed: u64,
    duplicates: u64,
    /// Out-of-order messages parked until the gap fills.
    pending: Vec<SequencedMessage>,
    /// Serializes gap-fill fetches.
    fetching: bool,
    msn_threshold: u64,
}

/// Maintains a totally ordered op stream between a client and the document
/// service.
///
/// Owns the four pipeline queues, the live connection, and all sequence
/// counters; see the crate docs for the data flow.
pub struct DeltaManager {
    core: Arc<Core>,
}

struct Core {
    service: Arc<dyn DocumentService>,
    client: ClientDetails,
    auto_reconnect: bool,
    handler: Mutex<Option<Arc<dyn OpHandler>>>,
    connection: Mutex<Option<ActiveConnection>>,
    connection_generation: AtomicU64,
    pending_connect: Mutex<Option<Arc<Deferred<ConnectionDetails>>>>,
    connection_mode: Mutex<ConnectionMode>,
    seq: Mutex<SequenceState>,
    /// In-process buffer; becomes one outbound batch on flush.
    buffer: Mutex<Vec<OutboundMessage>>,
    inbound_pending: MessageQueue<SequencedMessage>,
    inbound: MessageQueue<SequencedMessage>,
    inbound_signal: MessageQueue<SignalMessage>,
    outbound: MessageQueue<Vec<OutboundMessage>>,
    content_cache: Arc<ContentCache>,
    fetcher: DeltaFetcher,
    events: broadcast::Sender<DeltaManagerEvent>,
    closed: Arc<AtomicBool>,
    in_quorum: AtomicBool,
    ack_timer: Mutex<Option<JoinHandle<()>>>,
}

impl DeltaManager {
    /// Create a manager. All queues start paused; call
    /// [`connect`](Self::connect) and
    /// [`attach_op_handler`](Self::attach_op_handler) to start the flow.
    pub fn new(
        service: Arc<dyn DocumentService>,
        client: ClientDetails,
        auto_reconnect: bool,
    ) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let (events, _) = broadcast::channel(256);

        let core = Arc::new(Core {
            fetcher: DeltaFetcher::new(service.clone(), closed.clone()),
            service,
            client,
            auto_reconnect,
            handler: Mutex::new(None),
            connection: Mutex::new(None),
            connection_generation: AtomicU64::new(0),
            pending_connect: Mutex::new(None),
            connection_mode: Mutex::new(ConnectionMode::Read),
            seq: Mutex::new(SequenceState {
                base_seq: 0,
                min_seq: 0,
                last_queued_seq: 0,
                client_seq: 0,
                client_seq_observed: 0,
                duplicates: 0,
                pending: Vec::new(),
                fetching: false,
                msn_threshold: MSN_TELEMETRY_FLOOR,
            }),
            buffer: Mutex::new(Vec::new()),
            inbound_pending: MessageQueue::new("inbound-pending"),
            inbound: MessageQueue::new("inbound"),
            inbound_signal: MessageQueue::new("inbound-signal"),
            outbound: MessageQueue::new("outbound"),
            content_cache: Arc::new(ContentCache::new(DEFAULT_CONTENT_BUFFER_SIZE)),
            events,
            closed,
            in_quorum: AtomicBool::new(false),
            ack_timer: Mutex::new(None),
        });

        Core::spawn_workers(&core);
        Self { core }
    }

    /// Open (or await the in-flight open of) the realtime stream.
    pub async fn connect(&self, reason: &str) -> Result<ConnectionDetails, SyncError> {
        self.core.connect(reason).await
    }

    /// Queue a message for submission; returns its client sequence number.
    ///
    /// Unbatched submits flush the buffer around themselves so the message
    /// travels alone.
    pub fn submit(
        &self,
        message_type: MessageType,
        contents: Option<Value>,
        batch: bool,
    ) -> Result<u64, SyncError> {
        self.core.submit(message_type, contents, batch)
    }

    /// Send an out-of-band signal over the live connection.
    pub fn submit_signal(&self, content: String) -> Result<(), SyncError> {
        self.core.submit_signal(content)
    }

    /// Move the buffered messages onto the outbound queue as one batch.
    pub fn flush(&self) {
        self.core.flush();
    }

    /// Install the message handler and seed the sequence counters.
    ///
    /// With `resume` the inbound pipelines start and the manager catches up
    /// from `sequence_number`.
    pub fn attach_op_handler(
        &self,
        min_sequence_number: u64,
        sequence_number: u64,
        handler: Arc<dyn OpHandler>,
        resume: bool,
    ) {
        self.core
            .attach_op_handler(min_sequence_number, sequence_number, handler, resume);
    }

    /// Fetch sequenced ops from storage; see [`DeltaStorage::get`] bounds.
    ///
    /// [`DeltaStorage::get`]: crate::service::DeltaStorage::get
    pub async fn get_deltas(
        &self,
        reason: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<SequencedMessage>, SyncError> {
        if self.core.closed() {
            return Err(SyncError::Closed);
        }
        self.core.fetcher.get_deltas(reason, from, to).await
    }

    /// Terminally close the manager. Idempotent.
    pub fn close(&self) {
        self.core.close_core();
    }

    /// Subscribe to manager events.
    pub fn subscribe(&self) -> broadcast::Receiver<DeltaManagerEvent> {
        self.core.events.subscribe()
    }

    /// Quorum membership input; the ack scheduler only runs for in-quorum
    /// write clients.
    pub fn set_in_quorum(&self, in_quorum: bool) {
        self.core.in_quorum.store(in_quorum, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed()
    }

    pub fn connection_mode(&self) -> ConnectionMode {
        *self.core.connection_mode.lock()
    }

    /// Size limit for a single outbound payload.
    pub fn max_message_size(&self) -> usize {
        self.core.max_message_size()
    }

    pub fn base_sequence_number(&self) -> u64 {
        self.core.seq.lock().base_seq
    }

    pub fn last_queued_sequence_number(&self) -> u64 {
        self.core.seq.lock().last_queued_seq
    }

    pub fn minimum_sequence_number(&self) -> u64 {
        self.core.seq.lock().min_seq
    }

    /// Count of discarded already-seen messages.
    pub fn duplicate_count(&self) -> u64 {
        self.core.seq.lock().duplicates
    }

    // Inspection handles for the four pipeline queues.

    pub fn inbound_pending(&self) -> MessageQueue<SequencedMessage> {
        self.core.inbound_pending.clone()
    }

    pub fn inbound(&self) -> MessageQueue<SequencedMessage> {
        self.core.inbound.clone()
    }

    pub fn inbound_signal(&self) -> MessageQueue<SignalMessage> {
        self.core.inbound_signal.clone()
    }

    pub fn outbound(&self) -> MessageQueue<Vec<OutboundMessage>> {
        self.core.outbound.clone()
    }
}

impl Drop for DeltaManager {
    fn drop(&mut self) {
        self.core.close_core();
    }
}

impl Core {
    fn spawn_workers(core: &Arc<Core>) {
        let sink: ErrorSink = {
            let weak = Arc::downgrade(core);
            Arc::new(move |err| {
                if let Some(core) = weak.upgrade() {
                    core.emit(DeltaManagerEvent::Error(err));
                    core.close_core();
                }
            })
        };

        {
            let weak = Arc::downgrade(core);
            core.inbound_pending.spawn_worker(
                move |message| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        match weak.upgrade() {
                            Some(core) => core.process_pending(message).await,
                            None => Ok(()),
                        }
                    })
                },
                sink.clone(),
            );
        }
        {
            let weak = Arc::downgrade(core);
            core.inbound.spawn_worker(
                move |message| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        match weak.upgrade() {
                            Some(core) => core.process_inbound(message),
                            None => Ok(()),
                        }
                    })
                },
                sink.clone(),
            );
        }
        {
            let weak = Arc::downgrade(core);
            core.inbound_signal.spawn_worker(
                move |signal| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        match weak.upgrade() {
                            Some(core) => core.process_signal(signal),
                            None => Ok(()),
                        }
                    })
                },
                sink.clone(),
            );
        }
        {
            let weak = Arc::downgrade(core);
            core.outbound.spawn_worker(
                move |batch| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        match weak.upgrade() {
                            Some(core) => core.process_outbound(batch),
                            None => Ok(()),
                        }
                    })
                },
                sink,
            );
        }
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn emit(&self, event: DeltaManagerEvent) {
        let _ = self.events.send(event);
    }

    fn active(&self) -> bool {
        self.in_quorum.load(Ordering::Acquire)
            && *self.connection_mode.lock() == ConnectionMode::Write
    }

    fn max_message_size(&self) -> usize {
        self.connection
            .lock()
            .as_ref()
            .and_then(|active| active.connection.details().max_message_size)
            .unwrap_or(DEFAULT_CHUNK_SIZE)
    }

    fn connected_client_id(&self) -> Option<String> {
        self.connection
            .lock()
            .as_ref()
            .map(|active| active.connection.details().client_id.clone())
    }

    // ---- connection lifecycle ----

    async fn connect(self: &Arc<Core>, reason: &str) -> Result<ConnectionDetails, SyncError> {
        if self.closed() {
            return Err(SyncError::Closed);
        }
        if let Some(active) = self.connection.lock().as_ref() {
            return Ok(active.connection.details().clone());
        }

        let (deferred, initiate) = {
            let mut pending = self.pending_connect.lock();
            match pending.as_ref() {
                Some(deferred) => (deferred.clone(), false),
                None => {
                    let deferred = Arc::new(Deferred::new());
                    *pending = Some(deferred.clone());
                    (deferred, true)
                }
            }
        };

        if initiate {
            let core = self.clone();
            let reason = reason.to_string();
            let mode = self.client.mode;
            tokio::spawn(async move {
                core.connect_core(&reason, mode).await;
            });
        }

        deferred.wait().await
    }

    /// Runs the reconnect ladder until a connection is established or the
    /// failure is fatal.
    async fn connect_core(self: &Arc<Core>, reason: &str, mode: ConnectionMode) {
        let mut delay = INITIAL_RECONNECT_DELAY;
        loop {
            if self.closed() {
                self.reject_pending_connect(SyncError::Closed);
                return;
            }
            tracing::debug!(reason, %mode, "connecting delta stream");
            match self
                .service
                .connect_to_delta_stream(self.client.clone(), mode)
                .await
            {
                Ok(connection) => {
                    self.setup_connection(connection);
                    return;
                }
                Err(err) => {
                    if !err.can_retry() {
                        tracing::warn!(%err, "delta stream connection failed fatally");
                        self.emit(DeltaManagerEvent::Error(err.clone()));
                        self.reject_pending_connect(err);
                        self.close_core();
                        return;
                    }
                    let wait = err.retry_after().unwrap_or(delay);
                    self.emit(DeltaManagerEvent::ConnectionDelay(wait));
                    tracing::debug!(
                        delay_ms = wait.as_millis() as u64,
                        %err,
                        "connection attempt failed, backing off"
                    );
                    sleep(wait).await;
                    delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                }
            }
        }
    }

    fn setup_connection(self: &Arc<Core>, connection: Arc<dyn DeltaConnection>) {
        if self.closed() {
            connection.close();
            self.reject_pending_connect(SyncError::Closed);
            return;
        }
        let details = connection.details().clone();
        let generation = self.connection_generation.fetch_add(1, Ordering::AcqRel) + 1;

        let Some(mut receiver) = connection.take_events() else {
            let err = SyncError::Invariant("connection event channel already taken".into());
            self.emit(DeltaManagerEvent::Error(err.clone()));
            self.reject_pending_connect(err);
            self.close_core();
            return;
        };

        *self.connection_mode.lock() = details.mode.unwrap_or(ConnectionMode::Write);
        {
            let mut seq = self.seq.lock();
            seq.client_seq = 0;
            seq.client_seq_observed = 0;
        }

        // The slot must be visible before the dispatch task can observe an
        // event, or the generation check would drop the backlog.
        *self.connection.lock() = Some(ActiveConnection {
            connection,
            generation,
            dispatch: None,
        });

        let dispatch = {
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                while let Some(event) = receiver.recv().await {
                    match weak.upgrade() {
                        Some(core) => core.handle_connection_event(generation, event),
                        None => break,
                    }
                }
            })
        };
        {
            let mut slot = self.connection.lock();
            match slot.as_mut() {
                Some(active) if active.generation == generation => {
                    active.dispatch = Some(dispatch);
                }
                // The connection was torn down before the task registered.
                _ => dispatch.abort(),
            }
        }

        self.outbound.resume();

        // Backlog delivered with the join response, contents first so the
        // messages they belong to can resolve.
        for content in details.initial_contents.iter().cloned() {
            self.content_cache.set(content);
        }
        if !details.initial_messages.is_empty() {
            self.enqueue_messages(details.initial_messages.clone());
        }
        for signal in details.initial_signals.iter().cloned() {
            self.inbound_signal.push(signal);
        }

        tracing::info!(client_id = %details.client_id, mode = %details.mode.unwrap_or_default(), "delta stream connected");
        self.resolve_pending_connect(&details);
        self.emit(DeltaManagerEvent::Connect(details));
    }

    fn resolve_pending_connect(&self, details: &ConnectionDetails) {
        if let Some(deferred) = self.pending_connect.lock().take() {
            deferred.resolve(details.clone());
        }
    }

    fn reject_pending_connect(&self, err: SyncError) {
        if let Some(deferred) = self.pending_connect.lock().take() {
            deferred.reject(err);
        }
    }

    fn handle_connection_event(self: &Arc<Core>, generation: u64, event: ConnectionEvent) {
        if self.closed() {
            return;
        }
        // Ignore events from a superseded connection.
        let current = self
            .connection
            .lock()
            .as_ref()
            .map(|active| active.generation);
        if current != Some(generation) {
            return;
        }

        match event {
            ConnectionEvent::Op(messages) => self.enqueue_messages(messages),
            ConnectionEvent::OpContent(content) => self.content_cache.set(content),
            ConnectionEvent::Signal(signal) => self.inbound_signal.push(signal),
            ConnectionEvent::Nack(target) => {
                // Write capability is only regained by rejoining in write
                // mode, so a nack always reconnects.
                tracing::warn!(target, "write rejected, reconnecting in write mode");
                self.teardown_connection("server nack".to_string(), ConnectionMode::Write, true);
            }
            ConnectionEvent::Disconnect(reason) => {
                self.teardown_connection(reason, self.client.mode, self.auto_reconnect);
            }
            ConnectionEvent::Error(err) => {
                let reason = format!("connection error: {err}");
                if self.auto_reconnect && err.can_retry() {
                    self.teardown_connection(reason, self.client.mode, true);
                } else {
                    self.emit(DeltaManagerEvent::Error(err));
                    self.teardown_connection(reason, self.client.mode, false);
                    self.close_core();
                }
            }
            ConnectionEvent::Pong(latency) => self.emit(DeltaManagerEvent::Pong(latency)),
        }
    }

    fn teardown_connection(self: &Arc<Core>, reason: String, mode: ConnectionMode, reconnect: bool) {
        let Some(active) = self.connection.lock().take() else {
            return;
        };
        if let Some(dispatch) = active.dispatch {
            dispatch.abort();
        }

        *self.connection_mode.lock() = ConnectionMode::Read;
        self.outbound.pause();
        self.outbound.clear();

        tracing::info!(reason = %reason, "delta stream disconnected");
        self.emit(DeltaManagerEvent::Disconnect(reason));
        active.connection.close();

        if reconnect && !self.closed() {
            let core = self.clone();
            tokio::spawn(async move {
                core.connect_core("reconnect", mode).await;
            });
        }
    }

    fn close_core(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("closing delta manager");
        self.cancel_ack_timer();
        if let Some(active) = self.connection.lock().take() {
            if let Some(dispatch) = active.dispatch {
                dispatch.abort();
            }
            active.connection.close();
        }
        self.reject_pending_connect(SyncError::Closed);
        self.inbound_pending.close();
        self.inbound.close();
        self.inbound_signal.close();
        self.outbound.close();
        self.buffer.lock().clear();
        self.seq.lock().pending.clear();
    }

    // ---- inbound ordering ----

    fn attach_op_handler(
        self: &Arc<Core>,
        min_sequence_number: u64,
        sequence_number: u64,
        handler: Arc<dyn OpHandler>,
        resume: bool,
    ) {
        tracing::debug!(
            min_seq = min_sequence_number,
            seq = sequence_number,
            resume,
            "attaching op handler"
        );
        *self.handler.lock() = Some(handler);
        let has_pending = {
            let mut seq = self.seq.lock();
            seq.base_seq = sequence_number;
            seq.last_queued_seq = sequence_number;
            seq.min_seq = min_sequence_number;
            !seq.pending.is_empty()
        };
        if resume {
            self.inbound_pending.resume();
            self.inbound.resume();
            self.inbound_signal.resume();
            if has_pending {
                self.catch_up("DocumentOpen", Vec::new());
            } else {
                self.fetch_missing_deltas("DocumentOpen", sequence_number, None);
            }
        }
    }

    fn enqueue_messages(self: &Arc<Core>, messages: Vec<SequencedMessage>) {
        for message in messages {
            let mut seq = self.seq.lock();
            if message.sequence_number <= seq.last_queued_seq {
                seq.duplicates += 1;
                tracing::debug!(
                    seq = message.sequence_number,
                    duplicates = seq.duplicates,
                    "discarding already-queued op"
                );
            } else if message.sequence_number == seq.last_queued_seq + 1 {
                seq.last_queued_seq = message.sequence_number;
                drop(seq);
                self.inbound_pending.push(message);
            } else {
                let from = seq.last_queued_seq;
                let to = message.sequence_number;
                seq.pending.push(message);
                drop(seq);
                tracing::debug!(from, to, "sequence gap detected");
                self.fetch_missing_deltas("OutOfOrderMessage", from, Some(to));
            }
        }
    }

    /// Launch a gap-fill fetch unless one is already running.
    fn fetch_missing_deltas(self: &Arc<Core>, reason: &'static str, from: u64, to: Option<u64>) {
        {
            let mut seq = self.seq.lock();
            if seq.fetching || self.closed() {
                return;
            }
            seq.fetching = true;
        }
        let core = self.clone();
        tokio::spawn(async move {
            let result = core.fetcher.get_deltas(reason, from, to).await;
            core.seq.lock().fetching = false;
            match result {
                Ok(deltas) => core.catch_up(reason, deltas),
                Err(err) => {
                    core.emit(DeltaManagerEvent::Error(err));
                    core.close_core();
                }
            }
        });
    }

    fn catch_up(self: &Arc<Core>, reason: &str, messages: Vec<SequencedMessage>) {
        tracing::debug!(reason, count = messages.len(), "catching up");
        self.enqueue_messages(messages);

        let mut parked = std::mem::take(&mut self.seq.lock().pending);
        parked.sort_by_key(|message| message.sequence_number);
        self.enqueue_messages(parked);

        if self.seq.lock().pending.is_empty() {
            self.emit(DeltaManagerEvent::CaughtUp);
        }
    }

    /// Pending stage: attach out-of-band contents before ordering hand-off.
    async fn process_pending(
        self: &Arc<Core>,
        mut message: SequencedMessage,
    ) -> Result<(), SyncError> {
        if message.message_type == MessageType::Operation && message.contents.is_none() {
            let client_id = message.client_id.clone().ok_or_else(|| {
                SyncError::Invariant("content-bearing op without a client id".into())
            })?;
            let needed = message.client_sequence_number;
            loop {
                match self.content_cache.peek(&client_id) {
                    // Entries below the needed number belong to ops this
                    // client will never see again; drop them.
                    Some(front) if front < needed => {
                        self.content_cache.take(&client_id);
                    }
                    Some(front) if front == needed => {
                        message.contents = self
                            .content_cache
                            .take(&client_id)
                            .map(|content| content.contents);
                        break;
                    }
                    _ => {
                        message.contents = Some(
                            self.fetch_op_content(&client_id, needed, message.sequence_number)
                                .await?,
                        );
                        break;
                    }
                }
            }
        }
        self.inbound.push(message);
        Ok(())
    }

    async fn fetch_op_content(
        &self,
        client_id: &str,
        client_sequence_number: u64,
        sequence_number: u64,
    ) -> Result<Value, SyncError> {
        let waiter = self
            .content_cache
            .wait_for(client_id, client_sequence_number);
        if let Ok(Ok(contents)) = timeout(OP_CONTENT_WAIT, waiter).await {
            return Ok(contents);
        }

        // Side channel never delivered; pull the fully-formed op.
        tracing::debug!(seq = sequence_number, "fetching op content from storage");
        let ops = self
            .fetcher
            .get_deltas("OpContent", sequence_number - 1, Some(sequence_number + 1))
            .await?;
        ops.into_iter()
            .find(|op| op.sequence_number == sequence_number)
            .and_then(|op| op.contents)
            .ok_or_else(|| {
                SyncError::Invariant(format!("op {sequence_number} has no contents in storage"))
            })
    }

    /// Ordering stage: apply one message and schedule acknowledgement.
    fn process_inbound(self: &Arc<Core>, message: SequencedMessage) -> Result<(), SyncError> {
        let start = Instant::now();
        let own_client = self.connected_client_id();

        let mut all_acked = false;
        {
            let mut seq = self.seq.lock();
            if message.sequence_number != seq.base_seq + 1 {
                return Err(SyncError::Invariant(format!(
                    "non-contiguous sequence number {} after {}",
                    message.sequence_number, seq.base_seq
                )));
            }
            if message.minimum_sequence_number < seq.min_seq {
                return Err(SyncError::Invariant(format!(
                    "minimum sequence number regressed from {} to {}",
                    seq.min_seq, message.minimum_sequence_number
                )));
            }
            seq.base_seq = message.sequence_number;
            seq.min_seq = message.minimum_sequence_number;

            let msn_distance = message.sequence_number - message.minimum_sequence_number;
            if msn_distance >= seq.msn_threshold {
                tracing::info!(
                    distance = msn_distance,
                    threshold = seq.msn_threshold,
                    "minimum sequence number window grew"
                );
                seq.msn_threshold += MSN_TELEMETRY_STEP;
            }

            if own_client.is_some() && message.client_id == own_client {
                let acked = message.client_sequence_number;
                if acked < seq.client_seq_observed || acked > seq.client_seq {
                    return Err(SyncError::Invariant(format!(
                        "client sequence acknowledgement drift: observed {acked}, window {}..={}",
                        seq.client_seq_observed, seq.client_seq
                    )));
                }
                seq.client_seq_observed = acked;
                all_acked = acked == seq.client_seq;
            }
        }

        let handler = self
            .handler
            .lock()
            .clone()
            .ok_or_else(|| SyncError::Invariant("message processed before handler attach".into()))?;
        let outcome = handler.process(&message)?;

        if all_acked {
            self.emit(DeltaManagerEvent::AllSentOpsAckd);
        }

        if self.active() {
            if outcome.immediate_no_op {
                // Non-null payload marks the server-requested ack.
                let _ = self.submit(
                    MessageType::NoOp,
                    Some(Value::String(String::new())),
                    false,
                );
            } else if message.message_type != MessageType::NoOp {
                self.arm_ack_timer();
            }
        }

        self.emit(DeltaManagerEvent::ProcessTime(start.elapsed()));
        Ok(())
    }

    fn process_signal(&self, signal: SignalMessage) -> Result<(), SyncError> {
        let content: Value = serde_json::from_str(&signal.content)?;
        let handler = self
            .handler
            .lock()
            .clone()
            .ok_or_else(|| SyncError::Invariant("signal processed before handler attach".into()))?;
        handler.process_signal(ParsedSignal {
            client_id: signal.client_id,
            content,
        });
        Ok(())
    }

    // ---- outbound ----

    fn submit(
        self: &Arc<Core>,
        message_type: MessageType,
        contents: Option<Value>,
        batch: bool,
    ) -> Result<u64, SyncError> {
        if self.closed() {
            return Err(SyncError::Closed);
        }
        self.cancel_ack_timer();

        if let Some(contents) = &contents {
            let size = contents.to_string().len();
            let limit = self.max_message_size();
            if size > limit {
                return Err(SyncError::Fatal {
                    message: format!("message of {size} bytes exceeds the {limit} byte limit"),
                });
            }
        }

        let message = {
            let mut seq = self.seq.lock();
            seq.client_seq += 1;
            let mut message = OutboundMessage {
                client_sequence_number: seq.client_seq,
                reference_sequence_number: seq.base_seq,
                message_type,
                contents,
                data: None,
                metadata: None,
                traces: vec![Trace {
                    service: "client".to_string(),
                    action: "submit".to_string(),
                    timestamp: unix_millis(),
                }],
            };
            // The server inspects system payloads at the top level.
            if message_type.is_system() {
                message.data = message.contents.take();
            }
            message
        };

        let client_sequence_number = message.client_sequence_number;
        self.emit(DeltaManagerEvent::SubmitOp(message.clone()));

        if batch {
            self.buffer.lock().push(message);
        } else {
            self.flush();
            self.buffer.lock().push(message);
            self.flush();
        }
        Ok(client_sequence_number)
    }

    fn flush(&self) {
        let batch: Vec<OutboundMessage> = std::mem::take(&mut *self.buffer.lock());
        if batch.is_empty() {
            return;
        }
        self.emit(DeltaManagerEvent::PrepareSend(batch.clone()));
        self.outbound.push(batch);
    }

    fn process_outbound(&self, batch: Vec<OutboundMessage>) -> Result<(), SyncError> {
        let connection = self
            .connection
            .lock()
            .as_ref()
            .map(|active| active.connection.clone())
            .ok_or_else(|| {
                SyncError::Invariant("outbound queue ran without a live connection".into())
            })?;
        connection.submit(batch)
    }

    fn submit_signal(&self, content: String) -> Result<(), SyncError> {
        if self.closed() {
            return Err(SyncError::Closed);
        }
        let connection = self
            .connection
            .lock()
            .as_ref()
            .map(|active| active.connection.clone())
            .ok_or(SyncError::Transient {
                message: "no live connection for signal".to_string(),
                retry_after: None,
            })?;
        connection.submit_signal(content)
    }

    // ---- acknowledgement scheduler ----

    fn arm_ack_timer(self: &Arc<Core>) {
        let mut slot = self.ack_timer.lock();
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            sleep(ACK_TIMER_DELAY).await;
            if let Some(core) = weak.upgrade() {
                core.fire_ack_timer();
            }
        }));
    }

    fn fire_ack_timer(self: &Arc<Core>) {
        self.ack_timer.lock().take();
        if self.active() && !self.closed() {
            let _ = self.submit(MessageType::NoOp, None, false);
        }
    }

    fn cancel_ack_timer(&self) {
        if let Some(timer) = self.ack_timer.lock().take() {
            timer.abort();
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
