//! The real-time messaging subsystem: persist-then-broadcast dispatch,
//! WebSocket sessions and the conversation history endpoint.
//!
//! Every delivered frame goes to every open connection, the sender
//! included; clients filter by the ids in the payload. The server never
//! binds a connection to an actor.

use std::{
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{CloseFrame, Message as WsMessage, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use gymdesk_core::{OutgoingMessage, PayloadError};
use gymdesk_storage::{MessageRecord, MessageRepository, NewMessage, StoragePool};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{broadcast, RwLock},
    time::timeout,
};
use uuid::Uuid;

#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;
use crate::AppState;

const BROADCAST_CAPACITY: usize = 256;
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("malformed message frame: {0}")]
    Malformed(String),
    #[error("{0}")]
    Invalid(#[from] PayloadError),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl ChatError {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn reason(&self) -> &'static str {
        match self {
            ChatError::Malformed(_) => "malformed",
            ChatError::Invalid(_) => "invalid",
            ChatError::Storage(_) => "storage",
        }
    }
}

/// Append-only message persistence used by the dispatcher.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert_message(&self, message: &NewMessage) -> Result<MessageRecord, ChatError>;
    async fn conversation_between(
        &self,
        actor_a: i64,
        actor_b: i64,
    ) -> Result<Vec<MessageRecord>, ChatError>;
}

#[async_trait]
impl MessageStore for MessageRepository {
    async fn insert_message(&self, message: &NewMessage) -> Result<MessageRecord, ChatError> {
        MessageRepository::insert_message(self, message)
            .await
            .map_err(ChatError::from)
    }

    async fn conversation_between(
        &self,
        actor_a: i64,
        actor_b: i64,
    ) -> Result<Vec<MessageRecord>, ChatError> {
        MessageRepository::conversation_between(self, actor_a, actor_b)
            .await
            .map_err(ChatError::from)
    }
}

#[derive(Default)]
struct InMemoryMessages {
    rows: RwLock<Vec<MessageRecord>>,
    next_id: AtomicI64,
}

#[async_trait]
impl MessageStore for InMemoryMessages {
    async fn insert_message(&self, message: &NewMessage) -> Result<MessageRecord, ChatError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = MessageRecord {
            id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            message: message.message.clone(),
            file_url: message.file_url.clone(),
            voice_url: message.voice_url.clone(),
            timestamp: chrono::Utc::now(),
        };
        self.rows.write().await.push(record.clone());
        Ok(record)
    }

    async fn conversation_between(
        &self,
        actor_a: i64,
        actor_b: i64,
    ) -> Result<Vec<MessageRecord>, ChatError> {
        let rows = self.rows.read().await;
        let mut matched: Vec<_> = rows
            .iter()
            .filter(|row| {
                (row.sender_id == actor_a && row.receiver_id == actor_b)
                    || (row.sender_id == actor_b && row.receiver_id == actor_a)
            })
            .cloned()
            .collect();
        matched.sort_by_key(|row| (row.timestamp, row.id));
        Ok(matched)
    }
}

/// Dispatcher plus connection hub.
///
/// The hub is a single broadcast channel: the contract is unicast-to-all,
/// so there is no per-conversation routing state to keep.
#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn MessageStore>,
    hub: broadcast::Sender<Arc<str>>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

impl ChatService {
    pub fn new_with_pool(pool: StoragePool) -> Self {
        Self::new_internal(MessageRepository::new(pool))
    }

    pub fn new_in_memory() -> Self {
        Self::new_internal(Arc::new(InMemoryMessages::default()))
    }

    fn new_internal(store: Arc<dyn MessageStore>) -> Self {
        let (hub, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            store,
            hub,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsContext>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Validate, persist, then republish the original frame verbatim.
    ///
    /// The row is durable before any connection sees the frame. Delivery
    /// itself is best-effort: a hub send with no subscribers is not an
    /// error, and a crash after the insert leaves the message visible
    /// only through the history endpoint.
    pub async fn submit(&self, raw: &str) -> Result<MessageRecord, ChatError> {
        let result = self.submit_inner(raw).await;
        match &result {
            Ok(_) => self.record_delivered(),
            Err(err) => self.record_rejected(err.reason()),
        }
        result
    }

    async fn submit_inner(&self, raw: &str) -> Result<MessageRecord, ChatError> {
        let payload: OutgoingMessage =
            serde_json::from_str(raw).map_err(|err| ChatError::Malformed(err.to_string()))?;
        payload.validate()?;

        let stored = self.store.insert_message(&NewMessage::from(&payload)).await?;

        let _ = self.hub.send(Arc::from(raw));
        Ok(stored)
    }

    pub async fn history(
        &self,
        actor_a: i64,
        actor_b: i64,
    ) -> Result<Vec<MessageRecord>, ChatError> {
        self.store.conversation_between(actor_a, actor_b).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.hub.subscribe()
    }

    pub async fn open_socket(self: Arc<Self>, ws: WebSocketUpgrade) -> Response {
        ws.on_upgrade(move |socket| self.run_socket(socket))
    }

    async fn run_socket(self: Arc<Self>, mut socket: WebSocket) {
        let connection_id = Uuid::new_v4();
        tracing::info!(%connection_id, "chat connection opened");
        self.socket_opened();

        let mut rx = self.subscribe();

        loop {
            tokio::select! {
                result = rx.recv() => {
                    match result {
                        Ok(frame) => {
                            if timeout(
                                SEND_TIMEOUT,
                                socket.send(WsMessage::Text(frame.to_string().into())),
                            )
                            .await
                            .is_err()
                            {
                                tracing::warn!(%connection_id, "websocket send timeout");
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            let message = format!("lagged by {skipped} messages");
                            let _ = socket
                                .send(WsMessage::Close(Some(CloseFrame {
                                    code: axum::extract::ws::close_code::POLICY,
                                    reason: message.into(),
                                })))
                                .await;
                            break;
                        }
                        Err(_) => break,
                    }
                }
                message = socket.recv() => {
                    match message {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Err(err) = self.submit(text.as_str()).await {
                                tracing::warn!(%connection_id, %err, "message frame rejected");
                                let failure = serde_json::json!({ "error": err.to_string() });
                                if socket
                                    .send(WsMessage::Text(failure.to_string().into()))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            if socket.send(WsMessage::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        _ => {}
                    }
                }
            }
        }

        self.socket_closed();
        tracing::info!(%connection_id, "chat connection closed");
    }

    fn record_delivered(&self) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.messages_delivered_total.inc();
        }
    }

    fn record_rejected(&self, reason: &str) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics
                .messages_rejected_total
                .with_label_values(&[reason])
                .inc();
        }
        #[cfg(not(feature = "metrics"))]
        let _ = reason;
    }

    fn socket_opened(&self) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.open_chat_sockets.inc();
        }
    }

    fn socket_closed(&self) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.open_chat_sockets.dec();
        }
    }
}

#[cfg(feature = "metrics")]
pub fn init_chat_service(
    pool: Option<StoragePool>,
    metrics: Option<Arc<MetricsContext>>,
) -> ChatService {
    let service = match pool {
        Some(pool) => ChatService::new_with_pool(pool),
        None => ChatService::new_in_memory(),
    };
    service.with_metrics(metrics)
}

#[cfg(not(feature = "metrics"))]
pub fn init_chat_service(pool: Option<StoragePool>) -> ChatService {
    match pool {
        Some(pool) => ChatService::new_with_pool(pool),
        None => ChatService::new_in_memory(),
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub data: Vec<MessageRecord>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub async fn conversation_history(
    State(state): State<AppState>,
    Path((actor_a, actor_b)): Path<(i64, i64)>,
) -> Response {
    #[cfg(feature = "metrics")]
    let route = "messages.history";

    match state.chat().history(actor_a, actor_b).await {
        Ok(data) => {
            #[cfg(feature = "metrics")]
            state.record_http_request(route, StatusCode::OK.as_u16());
            (StatusCode::OK, Json(HistoryResponse { data })).into_response()
        }
        Err(err) => {
            tracing::error!(?err, actor_a, actor_b, "failed to read conversation history");
            let status = StatusCode::INTERNAL_SERVER_ERROR;
            #[cfg(feature = "metrics")]
            state.record_http_request(route, status.as_u16());
            (
                status,
                Json(ErrorBody {
                    error: "storage_error".to_string(),
                }),
            )
                .into_response()
        }
    }
}

pub async fn chat_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    state.chat().open_socket(ws).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn insert_message(&self, _message: &NewMessage) -> Result<MessageRecord, ChatError> {
            Err(ChatError::Storage(anyhow::anyhow!("store unreachable")))
        }

        async fn conversation_between(
            &self,
            _actor_a: i64,
            _actor_b: i64,
        ) -> Result<Vec<MessageRecord>, ChatError> {
            Err(ChatError::Storage(anyhow::anyhow!("store unreachable")))
        }
    }

    fn failing_service() -> ChatService {
        ChatService::new_internal(Arc::new(FailingStore))
    }

    const HELLO_FRAME: &str =
        r#"{"sender_id":7,"sender_role":"Member","receiver_id":3,"message":"Hello"}"#;

    #[tokio::test]
    async fn message_is_durable_before_any_delivery() {
        let service = ChatService::new_in_memory();
        let mut rx = service.subscribe();

        let stored = service.submit(HELLO_FRAME).await.expect("submit succeeds");
        assert_eq!(stored.sender_id, 7);
        assert_eq!(stored.receiver_id, 3);
        assert_eq!(stored.message.as_deref(), Some("Hello"));

        // The delivered frame only exists because the insert succeeded.
        let delivered = rx.recv().await.expect("frame delivered");
        assert_eq!(&*delivered, HELLO_FRAME);

        let history = service.history(7, 3).await.expect("history readable");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, stored.id);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_connection() {
        let service = ChatService::new_in_memory();
        let mut rx_a = service.subscribe();
        let mut rx_b = service.subscribe();
        let mut rx_c = service.subscribe();

        service.submit(HELLO_FRAME).await.expect("submit succeeds");

        for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
            let delivered = rx.recv().await.expect("frame delivered");
            assert_eq!(&*delivered, HELLO_FRAME);
        }
    }

    #[tokio::test]
    async fn republished_frame_is_verbatim() {
        // Clients may attach extra fields (their own timestamp, display
        // name); the republished frame preserves them untouched.
        let raw = r#"{"sender_id":"7","sender_role":"member","receiver_id":3,"message":"Hi","timestamp":"client-clock","sender_name":"Dana"}"#;
        let service = ChatService::new_in_memory();
        let mut rx = service.subscribe();

        service.submit(raw).await.expect("submit succeeds");

        let delivered = rx.recv().await.expect("frame delivered");
        assert_eq!(&*delivered, raw);
    }

    #[tokio::test]
    async fn insert_failure_produces_no_delivered_event() {
        let service = failing_service();
        let mut rx_a = service.subscribe();
        let mut rx_b = service.subscribe();

        let err = service.submit(HELLO_FRAME).await.unwrap_err();
        assert!(matches!(err, ChatError::Storage(_)));

        assert!(matches!(rx_a.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(rx_b.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn malformed_frame_is_rejected_without_persistence() {
        let service = ChatService::new_in_memory();
        let mut rx = service.subscribe();

        let err = service.submit("not json").await.unwrap_err();
        assert!(matches!(err, ChatError::Malformed(_)));

        let err = service
            .submit(r#"{"sender_id":"seven","sender_role":"Member","receiver_id":3,"message":"x"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Malformed(_)));

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        let history = service.history(7, 3).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn all_empty_payload_is_rejected() {
        let service = ChatService::new_in_memory();

        let err = service
            .submit(r#"{"sender_id":7,"sender_role":"Member","receiver_id":3}"#)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChatError::Invalid(PayloadError::EmptyPayload)
        ));
    }

    #[tokio::test]
    async fn history_is_symmetric_between_the_pair() {
        let service = ChatService::new_in_memory();
        service.submit(HELLO_FRAME).await.unwrap();
        service
            .submit(r#"{"sender_id":3,"sender_role":"Staff","receiver_id":7,"message":"Hi back"}"#)
            .await
            .unwrap();
        // A message involving a different pair must not leak in.
        service
            .submit(r#"{"sender_id":7,"sender_role":"Member","receiver_id":5,"message":"other"}"#)
            .await
            .unwrap();

        let forward = service.history(7, 3).await.unwrap();
        let reverse = service.history(3, 7).await.unwrap();

        let forward_ids: Vec<i64> = forward.iter().map(|m| m.id).collect();
        let reverse_ids: Vec<i64> = reverse.iter().map(|m| m.id).collect();
        assert_eq!(forward_ids, reverse_ids);
        assert_eq!(forward.len(), 2);
    }

    #[tokio::test]
    async fn history_is_ascending_and_grows_monotonically() {
        let service = ChatService::new_in_memory();
        for text in ["first", "second", "third"] {
            let frame = format!(
                r#"{{"sender_id":7,"sender_role":"Member","receiver_id":3,"message":"{text}"}}"#
            );
            service.submit(&frame).await.unwrap();
        }

        let before = service.history(7, 3).await.unwrap();
        assert!(before
            .windows(2)
            .all(|pair| (pair[0].timestamp, pair[0].id) <= (pair[1].timestamp, pair[1].id)));

        service
            .submit(r#"{"sender_id":3,"sender_role":"Staff","receiver_id":7,"message":"fourth"}"#)
            .await
            .unwrap();

        let after = service.history(7, 3).await.unwrap();
        assert_eq!(after.len(), before.len() + 1);
        let before_ids: Vec<i64> = before.iter().map(|m| m.id).collect();
        let after_ids: Vec<i64> = after.iter().map(|m| m.id).collect();
        assert_eq!(&after_ids[..before_ids.len()], &before_ids[..]);
    }

    #[tokio::test]
    async fn attachment_only_message_is_accepted() {
        let service = ChatService::new_in_memory();
        let mut rx = service.subscribe();

        let frame = r#"{"sender_id":2,"sender_role":"Admin","receiver_id":9,"message":"","file_url":"/uploads/20250101120000000-plan.pdf"}"#;
        let stored = service.submit(frame).await.expect("attachment accepted");
        assert!(stored.message.as_deref().is_some_and(|m| m.is_empty()));
        assert_eq!(
            stored.file_url.as_deref(),
            Some("/uploads/20250101120000000-plan.pdf")
        );

        let delivered = rx.recv().await.unwrap();
        assert_eq!(&*delivered, frame);
    }
}
