//! Flow controller
//!
//! Session → conversation → request hierarchy. Each conversation owns a
//! FIFO of request processors; at most one processor per conversation is
//! ever in flight. Queues re-sort by priority before dispatch, capacity
//! caps reject new work without displacing existing entries, idle sweeps
//! evict expired state, and cancellation propagates downward.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::FlowConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::messages::{CanonicalRequest, CanonicalResponse};
use crate::switching::{Recoverability, classify};

/// Processing status of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorStatus {
    /// Waiting in its conversation's queue
    Pending,
    /// In flight (at most one per conversation)
    Processing,
    /// Finished successfully (terminal)
    Completed,
    /// Finished with an error (terminal)
    Failed,
    /// Cancelled (terminal)
    Aborted,
}

impl ProcessorStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

/// Scheduling priority bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Dispatched first
    High,
    /// Default bucket
    Medium,
    /// Dispatched last
    Low,
}

impl Priority {
    /// Parse the metadata label; unknown labels land in the default bucket.
    #[must_use]
    pub fn parse(label: Option<&str>) -> Self {
        match label {
            Some("high") => Self::High,
            Some("low") => Self::Low,
            _ => Self::Medium,
        }
    }
}

/// Identifiers a request is keyed under.
#[derive(Debug, Clone)]
pub struct RequestIds {
    /// Session id
    pub session_id: String,
    /// Conversation id
    pub conversation_id: String,
    /// Request id
    pub request_id: String,
}

/// One queued or in-flight request.
pub struct RequestProcessor {
    /// Request id
    pub id: String,
    /// Conversation this processor belongs to
    pub conversation_id: String,
    /// Priority bucket
    pub priority: Priority,
    /// FIFO sequence within the conversation
    seq: u64,
    request: CanonicalRequest,
    status: RwLock<ProcessorStatus>,
    created_ms: u64,
    started_ms: AtomicU64,
    completed_ms: AtomicU64,
    retry_count: AtomicU32,
    cancel: CancellationToken,
    responder: Mutex<Option<oneshot::Sender<Result<CanonicalResponse>>>>,
}

impl RequestProcessor {
    fn new(
        id: String,
        conversation_id: String,
        priority: Priority,
        seq: u64,
        request: CanonicalRequest,
        responder: oneshot::Sender<Result<CanonicalResponse>>,
    ) -> Self {
        Self {
            id,
            conversation_id,
            priority,
            seq,
            request,
            status: RwLock::new(ProcessorStatus::Pending),
            created_ms: epoch_millis(),
            started_ms: AtomicU64::new(0),
            completed_ms: AtomicU64::new(0),
            retry_count: AtomicU32::new(0),
            cancel: CancellationToken::new(),
            responder: Mutex::new(Some(responder)),
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ProcessorStatus {
        *self.status.read()
    }

    /// Number of retries performed so far.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Relaxed)
    }

    /// Cancellation token tied to this request's lifetime.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Advance the status, enforcing the allowed transitions:
    /// pending → processing → {completed, failed, aborted}; pending →
    /// aborted. Terminal states never change.
    fn advance(&self, new: ProcessorStatus) -> bool {
        let mut status = self.status.write();
        let allowed = match (*status, new) {
            (ProcessorStatus::Pending, ProcessorStatus::Processing | ProcessorStatus::Aborted) => true,
            (
                ProcessorStatus::Processing,
                ProcessorStatus::Completed | ProcessorStatus::Failed | ProcessorStatus::Aborted,
            ) => true,
            _ => false,
        };
        if allowed {
            *status = new;
            match new {
                ProcessorStatus::Processing => {
                    self.started_ms.store(epoch_millis(), Ordering::Relaxed);
                }
                _ if new.is_terminal() => {
                    self.completed_ms.store(epoch_millis(), Ordering::Relaxed);
                }
                _ => {}
            }
        }
        allowed
    }

    fn respond(&self, result: Result<CanonicalResponse>) {
        if let Some(responder) = self.responder.lock().take() {
            let _ = responder.send(result);
        }
    }

    fn abort(&self, reason: &str) {
        if self.advance(ProcessorStatus::Aborted) {
            self.cancel.cancel();
            self.respond(Err(Error::new(
                ErrorKind::Internal,
                format!("request aborted: {reason}"),
            )
            .with_request_id(self.id.clone())));
        }
    }
}

/// An ordered queue of processors sharing a conversation id.
pub struct Conversation {
    /// Conversation id
    pub id: String,
    queue: Mutex<VecDeque<Arc<RequestProcessor>>>,
    current: Mutex<Option<Arc<RequestProcessor>>>,
    dispatching: AtomicBool,
    next_seq: AtomicU64,
    last_activity_ms: AtomicU64,
}

impl Conversation {
    fn new(id: String) -> Self {
        Self {
            id,
            queue: Mutex::new(VecDeque::new()),
            current: Mutex::new(None),
            dispatching: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(epoch_millis()),
        }
    }

    fn touch(&self) {
        self.last_activity_ms.store(epoch_millis(), Ordering::Relaxed);
    }

    /// Queued (pending) processor count plus the in-flight one.
    fn active_count(&self) -> usize {
        let queued = self.queue.lock().len();
        let current = usize::from(self.current.lock().is_some());
        queued + current
    }

    /// Pop the next processor: highest priority first, FIFO within a
    /// priority bucket.
    fn pop_next(&self) -> Option<Arc<RequestProcessor>> {
        let mut queue = self.queue.lock();
        let best = queue
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| (p.priority, p.seq))
            .map(|(i, _)| i)?;
        queue.remove(best)
    }
}

/// A client session holding conversations.
pub struct Session {
    /// Session id
    pub id: String,
    conversations: DashMap<String, Arc<Conversation>>,
    last_activity_ms: AtomicU64,
}

impl Session {
    fn new(id: String) -> Self {
        Self {
            id,
            conversations: DashMap::new(),
            last_activity_ms: AtomicU64::new(epoch_millis()),
        }
    }

    fn touch(&self) {
        self.last_activity_ms.store(epoch_millis(), Ordering::Relaxed);
    }
}

/// Executes one request end to end (router dispatch + pipeline execution).
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    /// Process the request; the cancellation token is tied to the request's
    /// lifetime.
    async fn execute(
        &self,
        request: CanonicalRequest,
        request_id: &str,
        cancel: CancellationToken,
    ) -> Result<CanonicalResponse>;
}

/// Queue depth snapshot for the stats surface.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct FlowSnapshot {
    /// Live sessions
    pub sessions: usize,
    /// Live conversations
    pub conversations: usize,
    /// Queued (pending) requests
    pub queued_requests: usize,
}

/// Handle returned by [`FlowController::submit`].
#[derive(Debug)]
pub struct Submission {
    /// Resolves with the eventual response
    pub receiver: oneshot::Receiver<Result<CanonicalResponse>>,
    /// Cancels the request (client disconnect propagation)
    pub cancel: CancellationToken,
}

/// Owns all sessions, conversations, and request processors.
pub struct FlowController {
    sessions: DashMap<String, Arc<Session>>,
    config: FlowConfig,
    executor: Arc<dyn RequestExecutor>,
    /// Flow-level retries of a failed processor (beyond in-flight pipeline
    /// switching, which has its own budget).
    max_retries: u32,
}

impl FlowController {
    /// Create the controller.
    #[must_use]
    pub fn new(config: FlowConfig, executor: Arc<dyn RequestExecutor>) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            executor,
            max_retries: 2,
        }
    }

    /// Submit a request; the receiver resolves with the eventual response.
    ///
    /// # Errors
    ///
    /// `QueueFull` when any capacity cap would be exceeded. Existing
    /// entries are never displaced.
    pub fn submit(self: &Arc<Self>, request: CanonicalRequest, ids: &RequestIds) -> Result<Submission> {
        let session = self.session_for(&ids.session_id)?;
        let conversation = self.conversation_for(&session, &ids.conversation_id)?;

        if conversation.active_count() >= self.config.max_requests_per_conversation {
            return Err(queue_full(format!(
                "conversation {} queue is full",
                ids.conversation_id
            )));
        }

        let priority = Priority::parse(request.metadata.priority.as_deref());
        let (tx, rx) = oneshot::channel();
        let processor = Arc::new(RequestProcessor::new(
            ids.request_id.clone(),
            ids.conversation_id.clone(),
            priority,
            conversation.next_seq.fetch_add(1, Ordering::Relaxed),
            request,
            tx,
        ));

        conversation.queue.lock().push_back(Arc::clone(&processor));
        session.touch();
        conversation.touch();

        self.ensure_dispatcher(&conversation);
        Ok(Submission {
            receiver: rx,
            cancel: processor.cancel_token(),
        })
    }

    /// Abort one request wherever it sits in its conversation.
    pub fn cancel_request(&self, session_id: &str, conversation_id: &str, request_id: &str) {
        let Some(conversation) = self
            .sessions
            .get(session_id)
            .and_then(|s| s.conversations.get(conversation_id).map(|c| Arc::clone(&c)))
        else {
            return;
        };
        if let Some(current) = conversation.current.lock().as_ref() {
            if current.id == request_id {
                current.abort("cancelled by client");
                return;
            }
        }
        let target = conversation
            .queue
            .lock()
            .iter()
            .find(|p| p.id == request_id)
            .map(Arc::clone);
        if let Some(processor) = target {
            processor.abort("cancelled by client");
        }
    }

    /// Abort a conversation: every pending processor and the in-flight one.
    pub fn cancel_conversation(&self, session_id: &str, conversation_id: &str) {
        let Some(conversation) = self
            .sessions
            .get(session_id)
            .and_then(|s| s.conversations.get(conversation_id).map(|c| Arc::clone(&c)))
        else {
            return;
        };
        let pending: Vec<Arc<RequestProcessor>> =
            conversation.queue.lock().iter().map(Arc::clone).collect();
        for processor in pending {
            processor.abort("conversation cancelled");
        }
        if let Some(current) = conversation.current.lock().as_ref() {
            current.abort("conversation cancelled");
        }
    }

    /// Queue depth snapshot.
    #[must_use]
    pub fn snapshot(&self) -> FlowSnapshot {
        let mut conversations = 0;
        let mut queued = 0;
        for session in &self.sessions {
            conversations += session.conversations.len();
            for conversation in &session.conversations {
                queued += conversation.queue.lock().len();
            }
        }
        FlowSnapshot {
            sessions: self.sessions.len(),
            conversations,
            queued_requests: queued,
        }
    }

    /// Run the idle-cleanup sweep loop until shutdown.
    pub async fn run_sweeper(
        self: Arc<Self>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.sweep(),
                _ = shutdown.recv() => break,
            }
        }
    }

    /// One cleanup pass: expire idle sessions and conversations, abort
    /// requests that waited longer than the request idle timeout.
    pub fn sweep(&self) {
        let now = epoch_millis();
        let session_cutoff = duration_millis(self.config.session_idle_timeout);
        let conversation_cutoff = duration_millis(self.config.conversation_idle_timeout);
        let request_cutoff = duration_millis(self.config.request_idle_timeout);

        for session in &self.sessions {
            let mut expired_conversations = Vec::new();
            for conversation in &session.conversations {
                // Expire stale pending requests first.
                let stale: Vec<Arc<RequestProcessor>> = conversation
                    .queue
                    .lock()
                    .iter()
                    .filter(|p| now.saturating_sub(p.created_ms) > request_cutoff)
                    .map(Arc::clone)
                    .collect();
                for processor in stale {
                    tracing::debug!(request_id = %processor.id, "Expiring idle request");
                    processor.abort("request idle timeout");
                }
                conversation
                    .queue
                    .lock()
                    .retain(|p| !p.status().is_terminal());

                let idle = now.saturating_sub(conversation.last_activity_ms.load(Ordering::Relaxed));
                let empty = conversation.queue.lock().is_empty()
                    && conversation.current.lock().is_none();
                if empty && idle > conversation_cutoff {
                    expired_conversations.push(conversation.id.clone());
                }
            }
            for id in expired_conversations {
                session.conversations.remove(&id);
                tracing::debug!(session = %session.id, conversation = %id, "Expired idle conversation");
            }
        }

        self.sessions.retain(|id, session| {
            let idle = now.saturating_sub(session.last_activity_ms.load(Ordering::Relaxed));
            let keep = !session.conversations.is_empty() || idle <= session_cutoff;
            if !keep {
                tracing::debug!(session = %id, "Expired idle session");
            }
            keep
        });
    }

    fn session_for(&self, session_id: &str) -> Result<Arc<Session>> {
        if let Some(session) = self.sessions.get(session_id) {
            return Ok(Arc::clone(&session));
        }
        if self.sessions.len() >= self.config.max_sessions {
            return Err(queue_full("session limit reached"));
        }
        Ok(Arc::clone(
            &self
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Session::new(session_id.to_string()))),
        ))
    }

    fn conversation_for(&self, session: &Arc<Session>, conversation_id: &str) -> Result<Arc<Conversation>> {
        if let Some(conversation) = session.conversations.get(conversation_id) {
            return Ok(Arc::clone(&conversation));
        }
        if session.conversations.len() >= self.config.max_conversations_per_session {
            return Err(queue_full(format!(
                "conversation limit reached for session {}",
                session.id
            )));
        }
        Ok(Arc::clone(
            &session
                .conversations
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(Conversation::new(conversation_id.to_string()))),
        ))
    }

    /// Start the per-conversation dispatcher if it is not already running.
    fn ensure_dispatcher(self: &Arc<Self>, conversation: &Arc<Conversation>) {
        if conversation
            .dispatching
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let controller = Arc::clone(self);
        let conversation = Arc::clone(conversation);
        tokio::spawn(async move {
            controller.drive(&conversation).await;
        });
    }

    /// Serial dispatcher: processes the conversation's queue one request at
    /// a time until it drains.
    async fn drive(self: &Arc<Self>, conversation: &Arc<Conversation>) {
        loop {
            let Some(processor) = conversation.pop_next() else {
                conversation.dispatching.store(false, Ordering::Release);
                // A submit may have raced the drain; re-acquire if so.
                if conversation.queue.lock().is_empty()
                    || conversation
                        .dispatching
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                {
                    return;
                }
                continue;
            };

            if processor.status() == ProcessorStatus::Aborted {
                continue;
            }
            if !processor.advance(ProcessorStatus::Processing) {
                continue;
            }
            *conversation.current.lock() = Some(Arc::clone(&processor));
            conversation.touch();

            let result = self.process_with_retries(&processor).await;

            match &result {
                Ok(_) => {
                    processor.advance(ProcessorStatus::Completed);
                }
                Err(e) => {
                    // An abort mid-flight already finalised the processor.
                    if processor.status() != ProcessorStatus::Aborted {
                        tracing::warn!(
                            request_id = %processor.id,
                            error = %e,
                            "Request failed"
                        );
                        processor.advance(ProcessorStatus::Failed);
                    }
                }
            }
            processor.respond(result);
            *conversation.current.lock() = None;
            conversation.touch();
        }
    }

    /// Execute one processor, re-running it with exponential-backoff delay
    /// while the failure classifies as recoverable. The processor stays in
    /// `processing` throughout, which keeps it at the head of its
    /// conversation (the dispatcher is serial).
    async fn process_with_retries(
        self: &Arc<Self>,
        processor: &Arc<RequestProcessor>,
    ) -> Result<CanonicalResponse> {
        loop {
            if processor.cancel.is_cancelled() {
                return Err(Error::internal("request aborted").with_request_id(processor.id.clone()));
            }
            let result = self
                .executor
                .execute(
                    processor.request.clone(),
                    &processor.id,
                    processor.cancel_token(),
                )
                .await;

            let Err(error) = &result else {
                return result;
            };
            let retries = processor.retry_count.load(Ordering::Relaxed);
            if classify(error) != Recoverability::Recoverable || retries >= self.max_retries {
                return result;
            }
            processor.retry_count.fetch_add(1, Ordering::Relaxed);
            let delay = retry_delay(retries);
            tracing::debug!(
                request_id = %processor.id,
                attempt = retries + 1,
                delay_ms = delay.as_millis(),
                "Re-running failed processor after backoff"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = processor.cancel.cancelled() => {
                    return Err(Error::internal("request aborted during retry backoff")
                        .with_request_id(processor.id.clone()));
                }
            }
        }
    }
}

/// Exponential backoff for flow-level retries: 500ms, 1s, 2s, …
fn retry_delay(retries: u32) -> Duration {
    Duration::from_millis(500).saturating_mul(2u32.saturating_pow(retries.min(8)))
}

fn queue_full(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::RateLimit, format!("QueueFull: {}", message.into()))
}

/// Mint a request id when the client did not supply one.
#[must_use]
pub fn generate_request_id() -> String {
    format!("req-{}", Uuid::new_v4())
}

#[allow(clippy::cast_possible_truncation)]
fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[allow(clippy::cast_possible_truncation)]
fn duration_millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{Message, MessageContent, RequestMetadata, Role};
    use std::sync::atomic::AtomicUsize;

    fn request(priority: Option<&str>) -> CanonicalRequest {
        CanonicalRequest {
            model: "default".into(),
            max_tokens: 10,
            messages: vec![Message {
                role: Role::User,
                content: MessageContent::Text("hi".into()),
            }],
            system: None,
            tools: Vec::new(),
            tool_choice: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: Vec::new(),
            stream: false,
            metadata: RequestMetadata {
                priority: priority.map(String::from),
                ..RequestMetadata::default()
            },
        }
    }

    fn ids(request_id: &str) -> RequestIds {
        RequestIds {
            session_id: "s1".into(),
            conversation_id: "c1".into(),
            request_id: request_id.into(),
        }
    }

    /// Executor that records in-flight concurrency and completion order.
    struct ProbeExecutor {
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        order: Mutex<Vec<String>>,
    }

    impl ProbeExecutor {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                order: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RequestExecutor for ProbeExecutor {
        async fn execute(
            &self,
            request: CanonicalRequest,
            request_id: &str,
            _cancel: CancellationToken,
        ) -> Result<CanonicalResponse> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.order.lock().push(request_id.to_string());
            Ok(CanonicalResponse::new(format!("msg_{request_id}"), request.model))
        }
    }

    /// Executor that fails a fixed number of times before succeeding.
    struct FlakyExecutor {
        failures_left: AtomicUsize,
        error: Error,
    }

    #[async_trait]
    impl RequestExecutor for FlakyExecutor {
        async fn execute(
            &self,
            request: CanonicalRequest,
            _request_id: &str,
            _cancel: CancellationToken,
        ) -> Result<CanonicalResponse> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(self.error.clone());
            }
            Ok(CanonicalResponse::new("msg_ok", request.model))
        }
    }

    #[tokio::test]
    async fn same_conversation_requests_are_serialised() {
        let executor = Arc::new(ProbeExecutor::new(Duration::from_millis(50)));
        let controller = Arc::new(FlowController::new(FlowConfig::default(), executor.clone()));

        let rx1 = controller.submit(request(None), &ids("r1")).unwrap().receiver;
        let rx2 = controller.submit(request(None), &ids("r2")).unwrap().receiver;

        let (a, b) = tokio::join!(rx1, rx2);
        a.unwrap().unwrap();
        b.unwrap().unwrap();

        assert_eq!(executor.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(*executor.order.lock(), vec!["r1".to_string(), "r2".to_string()]);
    }

    #[tokio::test]
    async fn different_conversations_run_concurrently() {
        let executor = Arc::new(ProbeExecutor::new(Duration::from_millis(50)));
        let controller = Arc::new(FlowController::new(FlowConfig::default(), executor.clone()));

        let mut ids2 = ids("r2");
        ids2.conversation_id = "c2".into();
        let rx1 = controller.submit(request(None), &ids("r1")).unwrap().receiver;
        let rx2 = controller.submit(request(None), &ids2).unwrap().receiver;

        let (a, b) = tokio::join!(rx1, rx2);
        a.unwrap().unwrap();
        b.unwrap().unwrap();

        assert_eq!(executor.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn high_priority_jumps_the_queue() {
        // Slow first request holds the conversation; the next two queue up
        // and re-sort by priority before dispatch.
        let executor = Arc::new(ProbeExecutor::new(Duration::from_millis(40)));
        let controller = Arc::new(FlowController::new(FlowConfig::default(), executor.clone()));

        let rx1 = controller.submit(request(None), &ids("r1")).unwrap().receiver;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let rx2 = controller.submit(request(Some("low")), &ids("r-low")).unwrap().receiver;
        let rx3 = controller.submit(request(Some("high")), &ids("r-high")).unwrap().receiver;

        let (a, b, c) = tokio::join!(rx1, rx2, rx3);
        a.unwrap().unwrap();
        b.unwrap().unwrap();
        c.unwrap().unwrap();

        let order = executor.order.lock().clone();
        assert_eq!(order[0], "r1");
        assert_eq!(order[1], "r-high");
        assert_eq!(order[2], "r-low");
    }

    #[tokio::test]
    async fn conversation_queue_cap_yields_queue_full() {
        let executor = Arc::new(ProbeExecutor::new(Duration::from_millis(100)));
        let config = FlowConfig {
            max_requests_per_conversation: 2,
            ..FlowConfig::default()
        };
        let controller = Arc::new(FlowController::new(config, executor));

        let _rx1 = controller.submit(request(None), &ids("r1")).unwrap().receiver;
        let _rx2 = controller.submit(request(None), &ids("r2")).unwrap().receiver;
        let err = controller.submit(request(None), &ids("r3")).unwrap_err();
        assert!(err.message.contains("QueueFull"), "{}", err.message);
    }

    #[tokio::test]
    async fn session_cap_yields_queue_full() {
        let executor = Arc::new(ProbeExecutor::new(Duration::ZERO));
        let config = FlowConfig {
            max_sessions: 1,
            ..FlowConfig::default()
        };
        let controller = Arc::new(FlowController::new(config, executor));

        let _rx = controller.submit(request(None), &ids("r1")).unwrap().receiver;
        let mut other = ids("r2");
        other.session_id = "s2".into();
        let err = controller.submit(request(None), &other).unwrap_err();
        assert!(err.message.contains("QueueFull"));
    }

    #[tokio::test]
    async fn recoverable_failures_are_retried_with_backoff() {
        tokio::time::pause();
        let executor = Arc::new(FlakyExecutor {
            failures_left: AtomicUsize::new(1),
            error: Error::from_upstream_status(503, "down"),
        });
        let controller = Arc::new(FlowController::new(FlowConfig::default(), executor));
        let rx = controller.submit(request(None), &ids("r1")).unwrap().receiver;
        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.id, "msg_ok");
    }

    #[tokio::test]
    async fn terminal_failures_are_not_retried() {
        let executor = Arc::new(FlakyExecutor {
            failures_left: AtomicUsize::new(usize::MAX),
            error: Error::from_upstream_status(400, "bad"),
        });
        let controller = Arc::new(FlowController::new(FlowConfig::default(), executor));
        let rx = controller.submit(request(None), &ids("r1")).unwrap().receiver;
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.upstream_status, Some(400));
    }

    #[tokio::test]
    async fn cancel_conversation_aborts_pending_requests() {
        let executor = Arc::new(ProbeExecutor::new(Duration::from_millis(100)));
        let controller = Arc::new(FlowController::new(FlowConfig::default(), executor));

        let _rx1 = controller.submit(request(None), &ids("r1")).unwrap().receiver;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let rx2 = controller.submit(request(None), &ids("r2")).unwrap().receiver;

        controller.cancel_conversation("s1", "c1");
        let err = rx2.await.unwrap().unwrap_err();
        assert!(err.message.contains("aborted"));
    }

    #[tokio::test]
    async fn sweep_expires_idle_pending_requests() {
        let executor = Arc::new(ProbeExecutor::new(Duration::from_secs(10)));
        let config = FlowConfig {
            request_idle_timeout: Duration::ZERO,
            ..FlowConfig::default()
        };
        let controller = Arc::new(FlowController::new(config, executor));

        let _rx1 = controller.submit(request(None), &ids("r1")).unwrap().receiver;
        tokio::time::sleep(Duration::from_millis(10)).await;
        // r2 is stuck behind r1 and has zero idle allowance.
        let rx2 = controller.submit(request(None), &ids("r2")).unwrap().receiver;
        tokio::time::sleep(Duration::from_millis(10)).await;

        controller.sweep();
        let err = rx2.await.unwrap().unwrap_err();
        assert!(err.message.contains("idle timeout"));
    }

    #[tokio::test]
    async fn snapshot_counts_live_state() {
        let executor = Arc::new(ProbeExecutor::new(Duration::from_millis(50)));
        let controller = Arc::new(FlowController::new(FlowConfig::default(), executor));
        let _rx = controller.submit(request(None), &ids("r1")).unwrap().receiver;
        let snap = controller.snapshot();
        assert_eq!(snap.sessions, 1);
        assert_eq!(snap.conversations, 1);
    }

    #[test]
    fn processor_transitions_are_enforced() {
        let (tx, _rx) = oneshot::channel();
        let processor = RequestProcessor::new(
            "r1".into(),
            "c1".into(),
            Priority::Medium,
            0,
            request(None),
            tx,
        );
        assert_eq!(processor.status(), ProcessorStatus::Pending);
        assert!(processor.advance(ProcessorStatus::Processing));
        // No going back.
        assert!(!processor.advance(ProcessorStatus::Processing));
        assert!(processor.advance(ProcessorStatus::Completed));
        // Terminal is terminal.
        assert!(!processor.advance(ProcessorStatus::Aborted));
        assert_eq!(processor.status(), ProcessorStatus::Completed);
    }

    #[test]
    fn pending_can_abort_directly() {
        let (tx, _rx) = oneshot::channel();
        let processor = RequestProcessor::new(
            "r1".into(),
            "c1".into(),
            Priority::Medium,
            0,
            request(None),
            tx,
        );
        assert!(processor.advance(ProcessorStatus::Aborted));
        assert!(!processor.advance(ProcessorStatus::Processing));
    }

    #[test]
    fn priority_parse_defaults_to_medium() {
        assert_eq!(Priority::parse(Some("high")), Priority::High);
        assert_eq!(Priority::parse(Some("low")), Priority::Low);
        assert_eq!(Priority::parse(Some("urgent")), Priority::Medium);
        assert_eq!(Priority::parse(None), Priority::Medium);
    }
}
