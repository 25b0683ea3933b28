//! Update Queue
//!
//! A node's single ordered channel to the server. [`UpdateQueue::enqueue`]
//! never blocks: it hands the request to a writer task over an unbounded
//! channel. The writer records each request as in flight before sending it,
//! and a reader task matches the server's responses to in-flight requests in
//! FIFO order, since the server answers in request order.
//!
//! The first channel failure closes the queue for good: every in-flight and
//! every still-unsent request is completed with that failure, and later
//! requests are refused.

use crate::completion::{Completion, Outcome, PendingRequest};
use crate::mirror::CacheMirror;
use coherence_core::{
    BindingKey, ChannelError, CoherenceConfig, CoherenceError, CoherenceResult, Key, NodeId,
    ObjectId, ValidationError,
};
use coherence_wire::handshake::encode_hello;
use coherence_wire::{
    CommitBatch, FrameReader, ObjectValue, Request, RequestKind, Response, WireLimits,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

struct Submission {
    sequence: u64,
    request: Request,
    completion: Completion,
}

struct InFlight {
    sequence: u64,
    kind: RequestKind,
    completion: Completion,
}

#[derive(Default)]
struct QueueState {
    failure: Option<ChannelError>,
    in_flight: VecDeque<InFlight>,
}

/// State shared by the queue handle and its two tasks.
struct Shared {
    node_id: NodeId,
    state: Mutex<QueueState>,
    draining: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    mirror: CacheMirror,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Completions run outside the lock, so a poisoned state is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn failure(&self) -> Option<ChannelError> {
        self.lock().failure.clone()
    }

    /// Record a request as in flight, unless the queue has failed.
    fn admit(&self, sequence: u64, kind: RequestKind, completion: Completion) -> bool {
        let refused = {
            let mut state = self.lock();
            match &state.failure {
                Some(error) => Some((completion, error.clone())),
                None => {
                    state.in_flight.push_back(InFlight {
                        sequence,
                        kind,
                        completion,
                    });
                    None
                }
            }
        };
        match refused {
            Some((completion, error)) => {
                self.deliver(sequence, completion, Err(error.into()));
                false
            }
            None => true,
        }
    }

    /// Run a completion. A panicking callback fails the queue.
    fn deliver(&self, sequence: u64, completion: Completion, outcome: Outcome) {
        if completion.complete(outcome).is_err() {
            self.fail(ChannelError::CompletionPanicked { sequence });
        }
    }

    /// Close the queue with `error` and fail everything in flight.
    ///
    /// Only the first failure counts; later calls do nothing.
    fn fail(&self, error: ChannelError) {
        let drained: Vec<InFlight> = {
            let mut state = self.lock();
            if state.failure.is_some() {
                return;
            }
            state.failure = Some(error.clone());
            state.in_flight.drain(..).collect()
        };
        self.shutdown_tx.send_replace(true);
        self.mirror.clear();

        match &error {
            ChannelError::ShutDown { reason } => info!(
                node_id = self.node_id.as_i64(),
                pending = drained.len(),
                reason = %reason,
                "Update queue shut down"
            ),
            _ => error!(
                node_id = self.node_id.as_i64(),
                pending = drained.len(),
                error = %error,
                "Update queue failed"
            ),
        }

        for entry in drained {
            let outcome = Err(CoherenceError::from(error.clone()));
            if entry.completion.complete(outcome).is_err() {
                warn!(
                    node_id = self.node_id.as_i64(),
                    sequence = entry.sequence,
                    kind = entry.kind.as_str(),
                    "Completion panicked while failing queue"
                );
            }
        }
    }
}

// ============================================================================
// UPDATE QUEUE
// ============================================================================

/// Ordered, pipelined request channel from one node to the server.
pub struct UpdateQueue {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Submission>,
    next_sequence: AtomicU64,
    limits: WireLimits,
}

impl UpdateQueue {
    /// Start a queue on an established channel to the server.
    ///
    /// Spawns the writer and reader tasks, so it must be called from within
    /// a Tokio runtime.
    pub fn new<T>(node_id: NodeId, stream: T, limits: WireLimits) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            node_id,
            state: Mutex::new(QueueState::default()),
            draining: AtomicBool::new(false),
            shutdown_tx,
            mirror: CacheMirror::new(),
        });

        tokio::spawn(run_writer(Arc::clone(&shared), rx, write_half));
        tokio::spawn(run_reader(Arc::clone(&shared), read_half, limits));

        Self {
            shared,
            tx,
            next_sequence: AtomicU64::new(0),
            limits,
        }
    }

    /// Announce `node_id` on `stream`, wait for the server to accept it,
    /// then start the queue.
    pub async fn connect<T>(
        node_id: NodeId,
        mut stream: T,
        config: &CoherenceConfig,
    ) -> CoherenceResult<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let limits = WireLimits::from(config);
        stream
            .write_all(&encode_hello(node_id))
            .await
            .map_err(ChannelError::from)?;
        stream.flush().await.map_err(ChannelError::from)?;

        let ack = {
            let mut reader = FrameReader::new(&mut stream, limits);
            Response::read(&mut reader).await?
        };
        match ack {
            Some(response) => response.into_outcome()?,
            None => {
                return Err(ChannelError::EndOfStream {
                    context: "handshake".to_string(),
                }
                .into())
            }
        }

        info!(node_id = node_id.as_i64(), "Update queue connected");
        Ok(Self::new(node_id, stream, limits))
    }

    /// Connect to a server over TCP.
    pub async fn connect_tcp<A: ToSocketAddrs>(
        addr: A,
        node_id: NodeId,
        config: &CoherenceConfig,
    ) -> CoherenceResult<Self> {
        let stream = TcpStream::connect(addr).await.map_err(ChannelError::from)?;
        stream.set_nodelay(true).map_err(ChannelError::from)?;
        Self::connect(node_id, stream, config).await
    }

    pub fn node_id(&self) -> NodeId {
        self.shared.node_id
    }

    /// What this node believes it holds.
    pub fn mirror(&self) -> &CacheMirror {
        &self.shared.mirror
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.lock().failure.is_some()
    }

    /// The failure that closed the queue, if any.
    pub fn failure(&self) -> Option<ChannelError> {
        self.shared.failure()
    }

    /// Requests sent and not yet answered.
    pub fn in_flight(&self) -> usize {
        self.shared.lock().in_flight.len()
    }

    /// Close the queue from the node side, failing outstanding requests.
    pub fn shutdown(&self) {
        self.shared.fail(ChannelError::ShutDown {
            reason: "shut down by node".to_string(),
        });
    }

    /// Wait until the queue is closed.
    pub async fn closed(&self) {
        let mut shutdown = self.shared.shutdown_tx.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                return;
            }
            if shutdown.changed().await.is_err() {
                return;
            }
        }
    }

    // ========================================================================
    // SUBMISSION
    // ========================================================================

    /// Queue `request` behind everything enqueued before it.
    ///
    /// Returns the request's sequence number. `completion` is invoked exactly
    /// once: with the server's answer, or with the failure that prevented
    /// one. When the request is refused here, the completion has already
    /// been invoked with the returned error.
    pub fn enqueue(&self, request: Request, completion: Completion) -> CoherenceResult<u64> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;

        if let Err(e) = check_limits(&request, &self.limits) {
            let error = CoherenceError::from(e);
            self.shared.deliver(sequence, completion, Err(error.clone()));
            return Err(error);
        }
        if let Some(failure) = self.shared.failure() {
            let error = CoherenceError::from(failure);
            self.shared.deliver(sequence, completion, Err(error.clone()));
            return Err(error);
        }

        let kind = request.kind();
        let submission = Submission {
            sequence,
            request,
            completion,
        };
        match self.tx.send(submission) {
            Ok(()) => {
                debug!(
                    node_id = self.shared.node_id.as_i64(),
                    sequence,
                    kind = kind.as_str(),
                    "Enqueued request"
                );
                Ok(sequence)
            }
            Err(mpsc::error::SendError(submission)) => {
                let error = CoherenceError::from(self.shared.failure().unwrap_or(
                    ChannelError::ShutDown {
                        reason: "update queue writer stopped".to_string(),
                    },
                ));
                self.shared
                    .deliver(submission.sequence, submission.completion, Err(error.clone()));
                Err(error)
            }
        }
    }

    /// Queue `request` and return a future of its outcome.
    pub fn submit(&self, request: Request) -> PendingRequest {
        let (completion, pending) = Completion::pending();
        if let Err(e) = self.enqueue(request, completion) {
            debug!(node_id = self.shared.node_id.as_i64(), error = %e, "Request refused");
        }
        pending
    }

    /// Commit a batch and wait for the server's verdict.
    pub async fn commit(&self, batch: CommitBatch) -> CoherenceResult<()> {
        self.submit(Request::Commit(batch)).await
    }

    pub fn evict_object(&self, oid: ObjectId, completion: Completion) -> CoherenceResult<u64> {
        self.shared.mirror.evict(&Key::Object(oid));
        self.enqueue(Request::EvictObject { oid }, completion)
    }

    pub fn downgrade_object(&self, oid: ObjectId, completion: Completion) -> CoherenceResult<u64> {
        self.shared.mirror.downgrade(&Key::Object(oid));
        self.enqueue(Request::DowngradeObject { oid }, completion)
    }

    pub fn evict_binding(&self, key: BindingKey, completion: Completion) -> CoherenceResult<u64> {
        self.shared.mirror.evict(&Key::Binding(key.clone()));
        self.enqueue(Request::EvictBinding { key }, completion)
    }

    pub fn downgrade_binding(
        &self,
        key: BindingKey,
        completion: Completion,
    ) -> CoherenceResult<u64> {
        self.shared.mirror.downgrade(&Key::Binding(key.clone()));
        self.enqueue(Request::DowngradeBinding { key }, completion)
    }
}

impl std::fmt::Debug for UpdateQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateQueue")
            .field("node_id", &self.shared.node_id)
            .field("failure", &self.failure())
            .finish_non_exhaustive()
    }
}

/// Refuse requests the server would reject as malformed frames, which
/// would end the channel.
fn check_limits(request: &Request, limits: &WireLimits) -> Result<(), ValidationError> {
    let check = |field: &str, len: usize, max: usize| {
        if len > max {
            return Err(ValidationError::LimitExceeded {
                field: field.to_string(),
                len,
                max,
            });
        }
        Ok(())
    };

    match request {
        Request::Commit(batch) => {
            check("oids", batch.objects.len(), limits.max_batch_len)?;
            check("names", batch.bindings.len(), limits.max_batch_len)?;
            for write in &batch.objects {
                if let ObjectValue::Store(bytes) = &write.value {
                    check("oid_values", bytes.len(), limits.max_value_len)?;
                }
            }
            for write in &batch.bindings {
                check("names", write.name.len(), limits.max_name_len)?;
            }
        }
        Request::EvictBinding { key } | Request::DowngradeBinding { key } => {
            if let Some(name) = key.as_name() {
                check("name", name.len(), limits.max_name_len)?;
            }
        }
        Request::EvictObject { .. } | Request::DowngradeObject { .. } => {}
    }
    Ok(())
}

// ============================================================================
// TASKS
// ============================================================================

async fn run_writer<W: AsyncWrite + Unpin>(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<Submission>,
    writer: W,
) {
    let mut writer = BufWriter::new(writer);
    let mut shutdown = shared.shutdown_tx.subscribe();

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        let submission = tokio::select! {
            biased;
            changed = shutdown.changed() => match changed {
                Ok(()) => continue,
                Err(_) => break,
            },
            next = rx.recv() => match next {
                Some(submission) => submission,
                None => {
                    // Every handle is gone: finish sending, let responses drain.
                    shared.draining.store(true, Ordering::SeqCst);
                    break;
                }
            },
        };

        let Submission {
            sequence,
            request,
            completion,
        } = submission;
        let frame = request.to_bytes();
        if !shared.admit(sequence, request.kind(), completion) {
            break;
        }

        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            shared.fail(ChannelError::from(e));
            break;
        }
    }

    // Refuse anything still queued; nothing can be sent after this point.
    rx.close();
    let error = shared.failure().unwrap_or(ChannelError::ShutDown {
        reason: "update queue closed".to_string(),
    });
    while let Ok(submission) = rx.try_recv() {
        shared.deliver(
            submission.sequence,
            submission.completion,
            Err(error.clone().into()),
        );
    }

    if let Err(e) = writer.shutdown().await {
        debug!(node_id = shared.node_id.as_i64(), error = %e, "Stream shutdown failed");
    }
}

async fn run_reader<R: AsyncRead + Unpin>(shared: Arc<Shared>, reader: R, limits: WireLimits) {
    let mut reader = FrameReader::new(BufReader::new(reader), limits);
    let mut shutdown = shared.shutdown_tx.subscribe();

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        let next = tokio::select! {
            biased;
            changed = shutdown.changed() => match changed {
                Ok(()) => continue,
                Err(_) => break,
            },
            next = Response::read(&mut reader) => next,
        };

        match next {
            Ok(Some(response)) => {
                let entry = shared.lock().in_flight.pop_front();
                let Some(entry) = entry else {
                    shared.fail(ChannelError::UnexpectedResponse);
                    break;
                };
                debug!(
                    node_id = shared.node_id.as_i64(),
                    sequence = entry.sequence,
                    kind = entry.kind.as_str(),
                    "Request completed"
                );
                shared.deliver(entry.sequence, entry.completion, response.into_outcome());
            }
            Ok(None) => {
                let idle = shared.lock().in_flight.is_empty();
                let error = if idle && shared.draining.load(Ordering::SeqCst) {
                    ChannelError::ShutDown {
                        reason: "update queue closed".to_string(),
                    }
                } else {
                    ChannelError::EndOfStream {
                        context: "response stream".to_string(),
                    }
                };
                shared.fail(error);
                break;
            }
            Err(e) => {
                shared.fail(e);
                break;
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
