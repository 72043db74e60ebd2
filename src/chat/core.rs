use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::openai::{BoxedCompletionBackend, CompletionRequest, StreamEvent};

use super::errors::{ChatError, ERROR_REMEDIATION_HINT};
use super::model_config::ModelConfigState;
use super::models::{ChatMetrics, Role, Transcript, Turn, Usage};
use super::retry::RetryPolicy;
use super::store::{BoxedSessionStore, InMemorySessionStore, SessionRecord};

const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    /// Waiting for the provider to accept the request, including
    /// retries
    Sending,
    Streaming,
    /// The last exchange failed. New messages are refused until the
    /// error is cleared, retried or edited away.
    Error,
}

/// Published while an exchange progresses so a caller can render the
/// answer as it grows.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    TurnStarted { id: String },
    Token { id: String, delta: String },
    TurnFinished { id: String, usage: Option<Usage> },
    Stopped { id: Option<String> },
    Failed { message: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The assistant turn `turn_id` was completed
    Finished { turn_id: String },
    /// Stopped by the user. `turn_id` is the partial answer, if the
    /// stream had started.
    Stopped { turn_id: Option<String> },
    /// Another exchange is in flight, nothing was changed
    Busy,
    /// The session is in the error state, nothing was changed
    Blocked,
}

/// Cancels the exchange in flight. Handles are cheap to clone and can
/// be moved to another task, for example a Ctrl-C listener.
#[derive(Clone, Default)]
pub struct StopHandle {
    token: Arc<Mutex<CancellationToken>>,
}

impl StopHandle {
    /// Stopping when nothing is in flight does nothing.
    pub fn stop(&self) {
        self.token.lock().unwrap_or_else(|e| e.into_inner()).cancel();
    }

    fn reset(&self) -> CancellationToken {
        let mut token = self.token.lock().unwrap_or_else(|e| e.into_inner());
        *token = CancellationToken::new();
        token.clone()
    }
}

/// Owns the conversation and drives every exchange with the model:
/// streaming answers into the transcript, retrying the request,
/// persisting after every change and restoring it on start.
///
/// All operations that talk to the model take `&mut self` so there
/// can only ever be one exchange in flight per session.
///
/// Use `ChatSession::builder()` to construct a `ChatSession`.
pub struct ChatSession {
    backend: BoxedCompletionBackend,
    store: BoxedSessionStore,
    config: ModelConfigState,
    retry: RetryPolicy,
    stream_timeout: Duration,
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
    transcript: Transcript,
    status: SessionStatus,
    error: Option<String>,
    editing: Option<String>,
    completion_times: HashMap<String, f64>,
    stop_handle: StopHandle,
}

impl ChatSession {
    pub fn builder(backend: BoxedCompletionBackend, config: ModelConfigState) -> ChatSessionBuilder {
        ChatSessionBuilder::new(backend, config)
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn config(&self) -> &ModelConfigState {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop_handle.clone()
    }

    /// Seconds it took to generate the assistant turn `id`.
    pub fn completion_time(&self, id: &str) -> Option<f64> {
        self.completion_times.get(id).copied()
    }

    pub fn metrics(&self) -> ChatMetrics {
        let times: Vec<f64> = self.completion_times.values().copied().collect();
        ChatMetrics::from_transcript(&self.transcript, &times)
    }

    fn is_busy(&self) -> bool {
        matches!(self.status, SessionStatus::Sending | SessionStatus::Streaming)
    }

    fn publish(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            // Nobody listening is fine
            let _ = tx.send(event);
        }
    }

    /// Restore the transcript and generation config from the store.
    ///
    /// Flags from an exchange that was interrupted are not carried
    /// over: pending turns are settled with whatever content they
    /// had (or dropped if empty) and a trailing error turn is
    /// dropped so a restored session always starts idle.
    pub async fn load(&mut self) {
        let record = match self.store.load().await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to load chat session, starting empty");
                return;
            }
        };

        let mut turns: Vec<Turn> = record
            .messages
            .into_iter()
            .filter(|t| !(t.pending && t.content.is_empty()))
            .map(|mut t| {
                t.pending = false;
                t
            })
            .collect();
        if turns.last().is_some_and(|t| t.is_error_turn()) {
            turns.pop();
        }

        tracing::info!(turns = turns.len(), "Restored chat session");
        self.transcript.replace_all(turns);
        self.config.set(record.model_config);
        self.status = SessionStatus::Idle;
        self.error = None;
        self.editing = None;
    }

    pub async fn save(&self) -> Result<(), ChatError> {
        let record = SessionRecord::new(self.transcript.to_vec(), self.config.get());
        self.store.save(&record).await
    }

    // Storage failures never reach the user
    async fn persist(&self) {
        if self.transcript.is_empty() {
            return;
        }
        if let Err(err) = self.save().await {
            tracing::warn!(error = %err, "Failed to save chat session");
        }
    }

    /// Send a new user message and stream the answer into the
    /// transcript.
    ///
    /// Returns an error for empty text or an invalid generation
    /// config without touching the transcript. Provider failures are
    /// recorded as an error turn and also returned.
    pub async fn submit(&mut self, text: &str) -> Result<SubmitOutcome, ChatError> {
        if self.is_busy() {
            tracing::debug!("Ignoring submit while an exchange is in flight");
            return Ok(SubmitOutcome::Busy);
        }
        if self.status == SessionStatus::Error || self.error.is_some() {
            return Ok(SubmitOutcome::Blocked);
        }
        if text.trim().is_empty() {
            return Err(ChatError::Validation("message must not be empty".to_string()));
        }
        self.config.get().validate()?;

        self.transcript.push(Turn::new(Role::User, text));
        self.persist().await;
        self.run_exchange().await
    }

    /// Resend the conversation up to the last user turn, dropping any
    /// answer or error after it.
    pub async fn retry_last(&mut self) -> Result<SubmitOutcome, ChatError> {
        if self.is_busy() {
            return Ok(SubmitOutcome::Busy);
        }
        let index = self
            .transcript
            .iter()
            .rposition(|t| t.role == Role::User)
            .ok_or_else(|| ChatError::Validation("Nothing to retry".to_string()))?;
        self.config.get().validate()?;

        self.transcript.truncate_after(index);
        self.error = None;
        self.persist().await;
        self.run_exchange().await
    }

    /// Regenerate from turn `id`. Retrying an answer (or the error
    /// turn) removes it and everything after it, then asks again for
    /// the user turn before it. Retrying a user turn keeps it and
    /// drops everything after it.
    pub async fn retry_message(&mut self, id: &str) -> Result<SubmitOutcome, ChatError> {
        if self.is_busy() {
            return Ok(SubmitOutcome::Busy);
        }
        let index = self
            .transcript
            .position(id)
            .ok_or_else(|| ChatError::Validation(format!("No message with id {}", id)))?;
        let keep = match self.transcript.get(index).map(|t| t.role) {
            Some(Role::User) => index,
            _ => self
                .transcript
                .turns()
                .get(..index)
                .and_then(|turns| turns.iter().rposition(|t| t.role == Role::User))
                .ok_or_else(|| {
                    ChatError::Validation(format!("No user message before {}", id))
                })?,
        };
        self.config.get().validate()?;

        tracing::debug!(id, "Retrying message");
        self.transcript.truncate_after(keep);
        self.error = None;
        self.persist().await;
        self.run_exchange().await
    }

    /// Enter edit mode for a user turn.
    pub fn begin_edit(&mut self, id: &str) -> Result<(), ChatError> {
        self.user_turn_index(id)?;
        self.editing = Some(id.to_string());
        Ok(())
    }

    pub fn cancel_edit(&mut self) {
        self.editing = None;
    }

    /// Id of the turn being edited, if any.
    pub fn editing(&self) -> Option<&str> {
        self.editing.as_deref()
    }

    fn user_turn_index(&self, id: &str) -> Result<usize, ChatError> {
        let index = self
            .transcript
            .position(id)
            .ok_or_else(|| ChatError::Validation(format!("No message with id {}", id)))?;
        match self.transcript.get(index) {
            Some(turn) if turn.role == Role::User => Ok(index),
            _ => Err(ChatError::Validation(
                "Only user messages can be edited".to_string(),
            )),
        }
    }

    /// Replace the content of a user turn, discard everything after it
    /// and regenerate the answer. Leaves edit mode.
    pub async fn edit_message(
        &mut self,
        id: &str,
        content: &str,
    ) -> Result<SubmitOutcome, ChatError> {
        if self.is_busy() {
            return Ok(SubmitOutcome::Busy);
        }
        let index = self.user_turn_index(id)?;
        if content.trim().is_empty() {
            return Err(ChatError::Validation("message must not be empty".to_string()));
        }
        self.config.get().validate()?;

        if let Some(turn) = self.transcript.get_mut(index) {
            turn.content = content.to_string();
        }
        self.transcript.truncate_after(index);
        self.editing = None;
        self.error = None;
        self.persist().await;
        self.run_exchange().await
    }

    /// Remove the error turn and accept new messages again.
    pub async fn clear_error(&mut self) {
        if let Some(index) = self.transcript.iter().position(|t| t.is_error_turn()) {
            self.transcript.truncate_after(index);
            self.transcript.pop();
        }
        self.error = None;
        if self.status == SessionStatus::Error {
            self.status = SessionStatus::Idle;
        }
        self.persist().await;
    }

    /// Start a new conversation, forgetting the stored one.
    pub async fn clear(&mut self) {
        self.transcript.clear();
        self.completion_times.clear();
        self.error = None;
        self.editing = None;
        self.status = SessionStatus::Idle;
        if let Err(err) = self.store.clear().await {
            tracing::warn!(error = %err, "Failed to clear stored chat session");
        }
    }

    /// Cancel the exchange in flight. Returns false when there was
    /// nothing to stop.
    pub fn stop(&self) -> bool {
        if !self.is_busy() {
            return false;
        }
        self.stop_handle.stop();
        true
    }

    /// Start the assistant turn that streamed tokens are appended to.
    pub fn on_stream_start(&mut self) -> String {
        let turn = Turn::pending_assistant();
        let id = turn.id.clone();
        self.transcript.push(turn);
        self.status = SessionStatus::Streaming;
        self.publish(SessionEvent::TurnStarted { id: id.clone() });
        id
    }

    /// Append a delta to the pending assistant turn. Content is only
    /// ever appended, never replaced.
    pub fn on_token(&mut self, delta: &str) {
        let Some(turn) = self
            .transcript
            .last_mut()
            .filter(|t| t.pending && t.role == Role::Assistant)
        else {
            tracing::debug!("Dropping token without a pending turn");
            return;
        };
        turn.content.push_str(delta);
        let id = turn.id.clone();
        self.publish(SessionEvent::Token {
            id,
            delta: delta.to_string(),
        });
    }

    /// Settle the pending turn, record how long it took and the usage
    /// reported by the provider, then persist.
    pub async fn on_finish(&mut self, usage: Option<Usage>) -> Option<String> {
        let finished = self
            .transcript
            .last_mut()
            .filter(|t| t.pending)
            .map(|turn| {
                turn.pending = false;
                turn.usage = usage;
                let elapsed = (Utc::now() - turn.created_at).num_milliseconds().max(0);
                (turn.id.clone(), elapsed as f64 / 1000.0)
            });

        if let Some(usage) = usage {
            self.config.record_usage(usage);
        }
        self.status = SessionStatus::Idle;

        let (id, seconds) = finished?;
        self.completion_times.insert(id.clone(), seconds);
        tracing::info!(id = %id, seconds, "Chat exchange finished");
        self.publish(SessionEvent::TurnFinished {
            id: id.clone(),
            usage,
        });
        self.persist().await;
        Some(id)
    }

    /// Keep whatever was streamed so far as a finished turn.
    pub async fn on_stop(&mut self) -> Option<String> {
        let id = self.transcript.last_mut().filter(|t| t.pending).map(|turn| {
            turn.pending = false;
            turn.id.clone()
        });
        self.status = SessionStatus::Idle;
        tracing::info!(?id, "Chat exchange stopped");
        self.publish(SessionEvent::Stopped { id: id.clone() });
        self.persist().await;
        id
    }

    /// Replace the failed answer with the error turn and block new
    /// messages until the error is dealt with.
    pub async fn on_error(&mut self, err: &ChatError) {
        if self
            .transcript
            .last()
            .is_some_and(|t| t.pending || t.is_error_turn())
        {
            self.transcript.pop();
        }
        let message = err.to_string();
        tracing::error!(error = %message, "Chat exchange failed");
        self.transcript
            .push(Turn::error(&format!("{}{}", message, ERROR_REMEDIATION_HINT)));
        self.error = Some(message.clone());
        self.status = SessionStatus::Error;
        self.publish(SessionEvent::Failed { message });
        self.persist().await;
    }

    async fn run_exchange(&mut self) -> Result<SubmitOutcome, ChatError> {
        let cancel = self.stop_handle.reset();
        let request = CompletionRequest::from_turns(self.transcript.turns(), self.config.get())?;
        self.status = SessionStatus::Sending;

        let backend = &self.backend;
        let request = &request;
        let opened = self
            .retry
            .retry("chat completion", &cancel, || backend.open(request))
            .await;

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(ChatError::Cancelled) => {
                self.on_stop().await;
                return Ok(SubmitOutcome::Stopped { turn_id: None });
            }
            Err(err) => {
                self.on_error(&err).await;
                return Err(err);
            }
        };

        let turn_id = self.on_stream_start();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                next = tokio::time::timeout(self.stream_timeout, stream.next()) => Some(next),
            };

            match next {
                None => {
                    self.on_stop().await;
                    return Ok(SubmitOutcome::Stopped {
                        turn_id: Some(turn_id),
                    });
                }
                Some(Err(_elapsed)) => {
                    let err = ChatError::StreamTimeout(self.stream_timeout);
                    self.on_error(&err).await;
                    return Err(err);
                }
                Some(Ok(Some(Ok(StreamEvent::Token(delta))))) => self.on_token(&delta),
                Some(Ok(Some(Ok(StreamEvent::Finish(usage))))) => {
                    self.on_finish(usage).await;
                    return Ok(SubmitOutcome::Finished { turn_id });
                }
                // Ended without a finish event
                Some(Ok(None)) => {
                    self.on_finish(None).await;
                    return Ok(SubmitOutcome::Finished { turn_id });
                }
                Some(Ok(Some(Err(err)))) => {
                    self.on_error(&err).await;
                    return Err(err);
                }
            }
        }
    }
}

pub struct ChatSessionBuilder {
    backend: BoxedCompletionBackend,
    config: ModelConfigState,
    store: Option<BoxedSessionStore>,
    retry: RetryPolicy,
    stream_timeout: Duration,
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
    transcript: Transcript,
}

impl ChatSessionBuilder {
    pub fn new(backend: BoxedCompletionBackend, config: ModelConfigState) -> Self {
        Self {
            backend,
            config,
            store: None,
            retry: RetryPolicy::default(),
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            tx: None,
            transcript: Transcript::new(),
        }
    }

    pub fn build(self) -> ChatSession {
        ChatSession {
            backend: self.backend,
            // Sessions without a store only live in memory
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemorySessionStore::new())),
            config: self.config,
            retry: self.retry,
            stream_timeout: self.stream_timeout,
            tx: self.tx,
            transcript: self.transcript,
            status: SessionStatus::Idle,
            error: None,
            editing: None,
            completion_times: HashMap::new(),
            stop_handle: StopHandle::default(),
        }
    }

    pub fn store(mut self, store: BoxedSessionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn transcript(mut self, turns: Vec<Turn>) -> Self {
        self.transcript = Transcript::new_with_turns(turns);
        self
    }

    pub fn streaming(mut self, transmitter: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.tx = Some(transmitter);
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::*;
    use crate::chat::model_config::ModelConfig;
    use crate::chat::models::ERROR_TURN_ID;
    use crate::chat::store::SessionStore;
    use crate::openai::{CompletionBackend, CompletionStream, Message};

    type EventSender = mpsc::UnboundedSender<Result<StreamEvent, ChatError>>;

    enum Script {
        Events(Vec<Result<StreamEvent, ChatError>>),
        Fail(ChatError),
        Channel(mpsc::UnboundedReceiver<Result<StreamEvent, ChatError>>),
        // The provider never answers
        Hang,
    }

    struct FakeBackend {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl FakeBackend {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionBackend for FakeBackend {
        async fn open(&self, request: &CompletionRequest) -> Result<CompletionStream, ChatError> {
            self.requests.lock().unwrap().push(request.clone());
            let script = self.scripts.lock().unwrap().pop_front();
            match script {
                Some(Script::Events(events)) => Ok(Box::pin(futures::stream::iter(events))),
                Some(Script::Fail(err)) => Err(err),
                Some(Script::Channel(rx)) => Ok(Box::pin(UnboundedReceiverStream::new(rx))),
                Some(Script::Hang) => futures::future::pending().await,
                None => Err(ChatError::Validation("No scripted response".to_string())),
            }
        }
    }

    fn answer(text: &str) -> Script {
        Script::Events(vec![
            Ok(StreamEvent::Token(text.to_string())),
            Ok(StreamEvent::Finish(Some(Usage::new(3, 2)))),
        ])
    }

    fn channel() -> (EventSender, Script) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Script::Channel(rx))
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(1), 2)
    }

    struct Harness {
        session: ChatSession,
        backend: Arc<FakeBackend>,
        store: Arc<InMemorySessionStore>,
    }

    fn harness(scripts: Vec<Script>, turns: Vec<Turn>) -> Harness {
        let backend = FakeBackend::new(scripts);
        let store = Arc::new(InMemorySessionStore::new());
        let session = ChatSession::builder(
            backend.clone(),
            ModelConfigState::new(ModelConfig::new("test-model")),
        )
        .store(store.clone())
        .retry_policy(fast_retry())
        .transcript(turns)
        .build();
        Harness {
            session,
            backend,
            store,
        }
    }

    fn contents(session: &ChatSession) -> Vec<&str> {
        session
            .transcript()
            .iter()
            .map(|t| t.content.as_str())
            .collect()
    }

    #[tokio::test]
    async fn test_submit_streams_answer_and_persists() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let backend = FakeBackend::new(vec![Script::Events(vec![
            Ok(StreamEvent::Token("Hel".to_string())),
            Ok(StreamEvent::Token("lo".to_string())),
            Ok(StreamEvent::Finish(Some(Usage::new(3, 2)))),
        ])]);
        let store = Arc::new(InMemorySessionStore::new());
        let config = ModelConfigState::new(ModelConfig::new("test-model"));
        let mut session = ChatSession::builder(backend.clone(), config.clone())
            .store(store.clone())
            .streaming(events_tx)
            .build();

        let outcome = session.submit("Hi").await.unwrap();
        let SubmitOutcome::Finished { turn_id } = outcome.clone() else {
            panic!("Expected the exchange to finish, got {:?}", outcome);
        };

        assert_eq!(contents(&session), vec!["Hi", "Hello"]);
        let answer = session.transcript().last().unwrap();
        assert_eq!(answer.id, turn_id);
        assert_eq!(answer.role, Role::Assistant);
        assert!(!answer.pending);
        assert_eq!(answer.usage, Some(Usage::new(3, 2)));
        assert_eq!(session.status(), SessionStatus::Idle);
        assert!(session.completion_time(&turn_id).is_some());
        assert_eq!(config.get().usage, Some(Usage::new(3, 2)));

        assert_eq!(
            backend.requests()[0].messages,
            vec![Message::new(Role::User, "Hi")]
        );

        let stored = store.load().await.unwrap().unwrap();
        assert_eq!(stored.messages, session.transcript().to_vec());
        assert_eq!(stored.model_config.usage, Some(Usage::new(3, 2)));

        let mut events = Vec::new();
        while let Ok(event) = events_rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                SessionEvent::TurnStarted { id: turn_id.clone() },
                SessionEvent::Token { id: turn_id.clone(), delta: "Hel".to_string() },
                SessionEvent::Token { id: turn_id.clone(), delta: "lo".to_string() },
                SessionEvent::TurnFinished { id: turn_id, usage: Some(Usage::new(3, 2)) },
            ]
        );
    }

    #[tokio::test]
    async fn test_tokens_are_appended_in_order() {
        let mut h = harness(vec![], vec![Turn::new(Role::User, "Hi")]);
        h.session.on_stream_start();
        let deltas = ["The", " quick", " brown", "", " fox"];
        let mut expected = String::new();
        for delta in deltas {
            h.session.on_token(delta);
            expected.push_str(delta);
            assert_eq!(h.session.transcript().last().unwrap().content, expected);
        }
        assert!(h.session.transcript().last().unwrap().pending);
    }

    #[tokio::test]
    async fn test_token_without_pending_turn_is_dropped() {
        let mut h = harness(vec![], vec![Turn::new(Role::User, "Hi")]);
        h.session.on_token("stray");
        assert_eq!(contents(&h.session), vec!["Hi"]);
    }

    #[tokio::test]
    async fn test_submit_while_streaming_is_a_noop() {
        let mut h = harness(vec![answer("unused")], vec![Turn::new(Role::User, "Hi")]);
        h.session.on_stream_start();
        let before = h.session.transcript().clone();

        let outcome = h.session.submit("Another").await.unwrap();

        assert_eq!(outcome, SubmitOutcome::Busy);
        assert_eq!(h.session.transcript(), &before);
        assert_eq!(h.session.status(), SessionStatus::Streaming);
        assert!(h.backend.requests().is_empty());
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_text_and_invalid_config() {
        let mut h = harness(vec![answer("unused")], vec![]);
        assert!(matches!(
            h.session.submit("   ").await,
            Err(ChatError::Validation(_))
        ));

        h.session.config().update(|c| c.temperature = 2.5);
        assert!(matches!(
            h.session.submit("Hello").await,
            Err(ChatError::Validation(_))
        ));
        assert!(h.session.transcript().is_empty());
        assert!(h.backend.requests().is_empty());
        assert_eq!(h.session.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_provider_error_is_retried_then_shown_as_error_turn() {
        let mut h = harness(
            vec![
                Script::Fail(ChatError::provider(Some(500), "boom")),
                Script::Fail(ChatError::provider(Some(500), "boom")),
                Script::Fail(ChatError::provider(Some(500), "boom")),
                answer("Recovered"),
            ],
            vec![],
        );

        let result = h.session.submit("Hi").await;
        assert!(matches!(result, Err(ChatError::RetryExhausted { attempts: 3, .. })));
        assert_eq!(h.backend.requests().len(), 3);

        let error_turn = h.session.transcript().last().unwrap();
        assert_eq!(error_turn.id, ERROR_TURN_ID);
        assert!(error_turn.error);
        assert!(error_turn.content.contains("boom"));
        assert!(error_turn.content.ends_with(ERROR_REMEDIATION_HINT));
        assert_eq!(h.session.status(), SessionStatus::Error);
        assert!(h.session.error().is_some());

        // Input stays blocked until the error is cleared
        assert_eq!(h.session.submit("Again").await.unwrap(), SubmitOutcome::Blocked);
        assert_eq!(h.session.transcript().len(), 2);

        h.session.clear_error().await;
        assert_eq!(h.session.status(), SessionStatus::Idle);
        assert_eq!(contents(&h.session), vec!["Hi"]);

        let outcome = h.session.submit("Again").await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Finished { .. }));
        assert_eq!(contents(&h.session), vec!["Hi", "Again", "Recovered"]);
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let mut h = harness(
            vec![
                Script::Fail(ChatError::RateLimitExceeded {
                    message: "slow down".to_string(),
                    retry_after: None,
                }),
                answer("Hello"),
            ],
            vec![],
        );
        let outcome = h.session.submit("Hi").await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Finished { .. }));
        assert_eq!(h.backend.requests().len(), 2);
        assert_eq!(contents(&h.session), vec!["Hi", "Hello"]);
    }

    #[tokio::test]
    async fn test_validation_error_from_provider_is_not_retried() {
        let mut h = harness(
            vec![Script::Fail(ChatError::Validation(
                "frequency_penalty is not supported".to_string(),
            ))],
            vec![],
        );
        let result = h.session.submit("Hi").await;
        assert!(matches!(result, Err(ChatError::Validation(_))));
        assert_eq!(h.backend.requests().len(), 1);
        assert!(h.session.transcript().last().unwrap().is_error_turn());
    }

    #[tokio::test]
    async fn test_stop_keeps_partial_content() {
        let (stream_tx, script) = channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let backend = FakeBackend::new(vec![script]);
        let store = Arc::new(InMemorySessionStore::new());
        let mut session = ChatSession::builder(
            backend.clone(),
            ModelConfigState::new(ModelConfig::new("test-model")),
        )
        .store(store.clone())
        .streaming(events_tx)
        .build();

        stream_tx
            .send(Ok(StreamEvent::Token("partial".to_string())))
            .unwrap();
        let handle = session.stop_handle();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if matches!(event, SessionEvent::Token { .. }) {
                    handle.stop();
                    break;
                }
            }
        });

        let outcome = session.submit("Tell me a story").await.unwrap();
        let SubmitOutcome::Stopped { turn_id: Some(turn_id) } = outcome.clone() else {
            panic!("Expected the exchange to be stopped, got {:?}", outcome);
        };

        let turn = session.transcript().last().unwrap();
        assert_eq!(turn.id, turn_id);
        assert_eq!(turn.content, "partial");
        assert!(!turn.pending);
        assert!(!turn.error);
        assert_eq!(session.status(), SessionStatus::Idle);
        assert!(session.error().is_none());

        let stored = store.load().await.unwrap().unwrap();
        assert_eq!(stored.messages.last().unwrap().content, "partial");
        drop(stream_tx);
    }

    fn stop_after(handle: StopHandle, delay: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.stop();
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_waiting_to_retry() {
        let mut h = harness(
            vec![
                Script::Fail(ChatError::provider(Some(503), "unavailable")),
                answer("too late"),
            ],
            vec![],
        );
        h.session.retry = RetryPolicy::new(3, Duration::from_secs(10), Duration::from_secs(10), 2);
        stop_after(h.session.stop_handle(), Duration::from_secs(1));

        let outcome = h.session.submit("Hi").await.unwrap();

        assert_eq!(outcome, SubmitOutcome::Stopped { turn_id: None });
        assert_eq!(h.backend.requests().len(), 1);
        assert_eq!(h.session.status(), SessionStatus::Idle);
        assert!(h.session.error().is_none());
        assert_eq!(contents(&h.session), vec!["Hi"]);
        assert!(!h.session.transcript().iter().any(|t| t.is_error_turn()));

        let stored = h.store.load().await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 1);
        assert_eq!(stored.messages[0].content, "Hi");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_sending() {
        let mut h = harness(vec![Script::Hang, answer("Hello")], vec![]);
        stop_after(h.session.stop_handle(), Duration::from_secs(1));

        let outcome = h.session.submit("Hi").await.unwrap();

        assert_eq!(outcome, SubmitOutcome::Stopped { turn_id: None });
        assert_eq!(h.session.status(), SessionStatus::Idle);
        assert!(h.session.error().is_none());
        assert_eq!(contents(&h.session), vec!["Hi"]);
        assert!(!h.session.transcript().iter().any(|t| t.is_error_turn()));

        // The session accepts the next message right away
        let outcome = h.session.submit("Hi again").await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Finished { .. }));
        assert_eq!(contents(&h.session), vec!["Hi", "Hi again", "Hello"]);
    }

    #[tokio::test]
    async fn test_saves_land_after_a_record_dated_in_the_future() {
        let mut h = harness(vec![answer("fresh answer")], vec![]);
        let mut skewed = SessionRecord::new(
            vec![Turn::new(Role::User, "old from skewed client")],
            ModelConfig::new("test-model"),
        );
        skewed.timestamp = Utc::now().timestamp_millis() + 3_600_000;
        h.store.save(&skewed).await.unwrap();

        h.session.submit("new question").await.unwrap();

        let stored = h.store.load().await.unwrap().unwrap();
        let stored: Vec<&str> = stored.messages.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(stored, vec!["new question", "fresh answer"]);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_a_noop() {
        let mut h = harness(vec![answer("Hello")], vec![]);
        assert!(!h.session.stop());
        h.session.stop_handle().stop();

        // A stale stop doesn't leak into the next exchange
        let outcome = h.session.submit("Hi").await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Finished { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_timeout_becomes_error_turn() {
        let (stream_tx, script) = channel();
        let mut h = harness(vec![script], vec![]);
        h.session.stream_timeout = Duration::from_secs(30);

        let result = h.session.submit("Hi").await;

        assert!(matches!(result, Err(ChatError::StreamTimeout(_))));
        assert_eq!(h.session.transcript().len(), 2);
        let error_turn = h.session.transcript().last().unwrap();
        assert!(error_turn.is_error_turn());
        assert!(error_turn.content.starts_with("No response received within 30s"));
        assert_eq!(h.session.status(), SessionStatus::Error);
        drop(stream_tx);
    }

    #[tokio::test]
    async fn test_stream_error_replaces_partial_answer() {
        let mut h = harness(
            vec![Script::Events(vec![
                Ok(StreamEvent::Token("Half an ans".to_string())),
                Err(ChatError::provider(None, "connection reset")),
            ])],
            vec![],
        );
        let result = h.session.submit("Hi").await;
        assert!(matches!(result, Err(ChatError::Provider { .. })));
        // Stream errors are not retried
        assert_eq!(h.backend.requests().len(), 1);
        let turns = h.session.transcript().turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].id, ERROR_TURN_ID);
    }

    #[tokio::test]
    async fn test_edit_message_truncates_and_regenerates() {
        let first = Turn::new(Role::User, "one");
        let turns = vec![
            first.clone(),
            Turn::new(Role::Assistant, "answer one"),
            Turn::new(Role::User, "two"),
            Turn::new(Role::Assistant, "answer two"),
        ];
        let mut h = harness(vec![answer("new answer")], turns);

        h.session.begin_edit(&first.id).unwrap();
        assert_eq!(h.session.editing(), Some(first.id.as_str()));

        let outcome = h.session.edit_message(&first.id, "uno").await.unwrap();

        assert!(matches!(outcome, SubmitOutcome::Finished { .. }));
        assert_eq!(contents(&h.session), vec!["uno", "new answer"]);
        assert_eq!(h.session.transcript().get(0).unwrap().id, first.id);
        assert_eq!(h.session.editing(), None);
        assert_eq!(
            h.backend.requests()[0].messages,
            vec![Message::new(Role::User, "uno")]
        );
        let stored = h.store.load().await.unwrap().unwrap();
        assert_eq!(stored.messages[0].content, "uno");
    }

    #[tokio::test]
    async fn test_edit_only_applies_to_user_turns() {
        let reply = Turn::new(Role::Assistant, "answer");
        let mut h = harness(vec![], vec![Turn::new(Role::User, "one"), reply.clone()]);

        assert!(matches!(
            h.session.begin_edit(&reply.id),
            Err(ChatError::Validation(_))
        ));
        assert!(matches!(
            h.session.edit_message(&reply.id, "changed").await,
            Err(ChatError::Validation(_))
        ));
        assert!(matches!(
            h.session.edit_message("missing", "changed").await,
            Err(ChatError::Validation(_))
        ));
        assert_eq!(contents(&h.session), vec!["one", "answer"]);
    }

    #[tokio::test]
    async fn test_cancel_edit() {
        let first = Turn::new(Role::User, "one");
        let mut h = harness(vec![], vec![first.clone()]);
        h.session.begin_edit(&first.id).unwrap();
        h.session.cancel_edit();
        assert_eq!(h.session.editing(), None);
        assert_eq!(contents(&h.session), vec!["one"]);
    }

    #[tokio::test]
    async fn test_retry_message_on_answer() {
        let stale = Turn::new(Role::Assistant, "answer one");
        let turns = vec![
            Turn::new(Role::User, "one"),
            stale.clone(),
            Turn::new(Role::User, "two"),
            Turn::new(Role::Assistant, "answer two"),
        ];
        let mut h = harness(vec![answer("better answer")], turns);

        h.session.retry_message(&stale.id).await.unwrap();

        assert_eq!(contents(&h.session), vec!["one", "better answer"]);
        assert!(h.session.transcript().position(&stale.id).is_none());
        assert_eq!(
            h.backend.requests()[0].messages,
            vec![Message::new(Role::User, "one")]
        );
    }

    #[tokio::test]
    async fn test_retry_message_on_error_turn_recovers() {
        let mut h = harness(
            vec![
                Script::Fail(ChatError::Validation("bad penalty".to_string())),
                answer("Hello"),
            ],
            vec![],
        );
        assert!(h.session.submit("Hi").await.is_err());
        assert_eq!(h.session.status(), SessionStatus::Error);

        let outcome = h.session.retry_message(ERROR_TURN_ID).await.unwrap();

        assert!(matches!(outcome, SubmitOutcome::Finished { .. }));
        assert_eq!(contents(&h.session), vec!["Hi", "Hello"]);
        assert!(h.session.error().is_none());
        assert_eq!(h.session.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_retry_last() {
        let turns = vec![
            Turn::new(Role::User, "one"),
            Turn::new(Role::Assistant, "meh"),
        ];
        let mut h = harness(vec![answer("better")], turns);
        h.session.retry_last().await.unwrap();
        assert_eq!(contents(&h.session), vec!["one", "better"]);

        let mut empty = harness(vec![], vec![]);
        assert!(matches!(
            empty.session.retry_last().await,
            Err(ChatError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_load_normalizes_interrupted_session() {
        let mut partial = Turn::pending_assistant();
        partial.content.push_str("half");
        let mut config = ModelConfig::new("stored-model");
        config.temperature = 1.1;
        let record = SessionRecord::new(
            vec![
                Turn::new(Role::User, "Hi"),
                partial.clone(),
                Turn::new(Role::User, "More"),
                Turn::pending_assistant(),
                Turn::error("boom"),
            ],
            config,
        );

        let mut h = harness(vec![], vec![]);
        h.store.save(&record).await.unwrap();
        h.session.load().await;

        assert_eq!(contents(&h.session), vec!["Hi", "half", "More"]);
        assert!(h.session.transcript().iter().all(|t| !t.pending && !t.error));
        assert_eq!(h.session.config().get().model, "stored-model");
        assert_eq!(h.session.config().get().temperature, 1.1);
        assert_eq!(h.session.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_load_without_record_keeps_defaults() {
        let mut h = harness(vec![], vec![]);
        h.session.load().await;
        assert!(h.session.transcript().is_empty());
        assert_eq!(h.session.config().get().model, "test-model");
    }

    #[tokio::test]
    async fn test_clear_forgets_stored_session() {
        let mut h = harness(vec![answer("Hello")], vec![]);
        h.session.submit("Hi").await.unwrap();
        assert!(h.store.load().await.unwrap().is_some());

        h.session.clear().await;

        assert!(h.session.transcript().is_empty());
        assert!(h.store.load().await.unwrap().is_none());
        assert_eq!(h.session.metrics(), ChatMetrics::default());
    }

    #[tokio::test]
    async fn test_metrics_count_transcript_tokens() {
        let mut h = harness(vec![answer("abcdabcd")], vec![]);
        h.session.submit("abcdabcdabcd").await.unwrap();
        let metrics = h.session.metrics();
        assert_eq!(metrics.total_tokens, 5);
        assert!(metrics.tokens_per_second >= 0.0);
    }
}
