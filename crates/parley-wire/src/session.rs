//! Streaming reply sessions against a reply-generation service

use std::{pin::Pin, time::Duration};

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    frame::decode_stream,
};

/// One prior message sent along as context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
}

/// Payload of one outbound reply request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyRequest {
    /// Conversation the reply belongs to
    pub conversation_id: String,
    /// Earlier messages of the conversation, oldest first
    pub messages: Vec<ContextMessage>,
    /// The new user input
    pub prompt: String,
    /// Ask for a detailed rather than concise reply; omitted when off
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub detailed: bool,
}

/// Events produced while a reply streams in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyEvent {
    /// Content fragment to append
    Delta { text: String },
    /// Clean end of the reply
    Done,
    /// The service reported a failure, or the connection was lost
    Error { message: String },
}

impl ReplyEvent {
    /// Check if this event ends the reply (Done or Error)
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplyEvent::Done | ReplyEvent::Error { .. })
    }

    /// Interpret a decoded payload.
    ///
    /// `{"delta": "..."}` is a fragment, `{"done": true}` the terminal marker,
    /// `{"error": "..."}` a service failure. Unknown payloads yield nothing.
    pub fn from_payload(payload: &Value) -> Vec<ReplyEvent> {
        if let Some(message) = payload.get("error").and_then(Value::as_str) {
            return vec![ReplyEvent::Error {
                message: message.to_string(),
            }];
        }

        let mut events = Vec::new();
        if let Some(text) = payload.get("delta").and_then(Value::as_str) {
            events.push(ReplyEvent::Delta {
                text: text.to_string(),
            });
        }
        if payload.get("done").and_then(Value::as_bool) == Some(true) {
            events.push(ReplyEvent::Done);
        }
        events
    }
}

/// A stream of reply events
pub type ReplyEventStream = Pin<Box<dyn Stream<Item = ReplyEvent> + Send>>;

/// A service that streams replies for a request
#[async_trait]
pub trait ReplyService: Send + Sync {
    /// Open a reply stream.
    ///
    /// Fails before producing any event when the service cannot be reached.
    /// Once `cancel` fires the returned stream ends without further events.
    async fn open(&self, request: &ReplyRequest, cancel: CancellationToken)
    -> Result<ReplyEventStream>;
}

/// Timeouts applied to every session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum time to establish the connection
    pub connect_timeout: Duration,
    /// Maximum silence between two chunks of the body
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Reply service reached over HTTP
pub struct HttpReplyService {
    client: reqwest::Client,
    target: String,
    idle_timeout: Duration,
}

impl HttpReplyService {
    /// Create a service posting to `target`
    pub fn new(target: impl Into<String>, config: SessionConfig) -> Result<Self> {
        let target = target.into();
        if target.trim().is_empty() {
            return Err(Error::InvalidConfig("reply service URL is empty".into()));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            client,
            target,
            idle_timeout: config.idle_timeout,
        })
    }

    /// URL requests are posted to
    pub fn target(&self) -> &str {
        &self.target
    }
}

#[async_trait]
impl ReplyService for HttpReplyService {
    async fn open(
        &self,
        request: &ReplyRequest,
        cancel: CancellationToken,
    ) -> Result<ReplyEventStream> {
        open(&self.client, &self.target, request, cancel, self.idle_timeout).await
    }
}

/// Post `request` to `target` and stream the decoded reply.
pub async fn open(
    client: &reqwest::Client,
    target: &str,
    request: &ReplyRequest,
    cancel: CancellationToken,
    idle_timeout: Duration,
) -> Result<ReplyEventStream> {
    let send = client
        .post(target)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .json(request)
        .send();

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Aborted),
        response = send => response?,
    };

    let status = response.status();
    if !status.is_success() {
        // Reading the error body is bounded by the idle timeout and the token.
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Aborted),
            body = tokio::time::timeout(idle_timeout, response.text()) => match body {
                Ok(Ok(body)) => body,
                Ok(Err(e)) => {
                    tracing::debug!("Failed to read error body: {}", e);
                    String::new()
                }
                Err(_) => {
                    tracing::debug!("Gave up reading error body after {:?}", idle_timeout);
                    String::new()
                }
            },
        };
        return Err(Error::status(status.as_u16(), body));
    }

    tracing::debug!(
        "Reply stream opened for conversation {}",
        request.conversation_id
    );

    Ok(Box::pin(create_stream(
        response.bytes_stream(),
        cancel,
        idle_timeout,
    )))
}

fn create_stream<S, B, E>(
    body: S,
    cancel: CancellationToken,
    idle_timeout: Duration,
) -> impl Stream<Item = ReplyEvent>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    // The idle timeout applies to raw chunks, so keep-alive comments that
    // decode to nothing still count as activity.
    let chunks =
        tokio_stream::StreamExt::timeout(body, idle_timeout).map(move |chunk| match chunk {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => Err(format!("connection lost: {}", e)),
            Err(_) => Err(format!("stream idle: timed out after {:?}", idle_timeout)),
        });

    stream! {
        let mut frames = std::pin::pin!(decode_stream(chunks));

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("Reply stream cancelled");
                    return;
                }
                next = frames.next() => next,
            };

            match next {
                None => return,
                Some(Err(message)) => {
                    tracing::debug!("Reply stream ended: {}", message);
                    yield ReplyEvent::Error { message };
                    return;
                }
                Some(Ok(payload)) => {
                    for event in ReplyEvent::from_payload(&payload) {
                        let terminal = event.is_terminal();
                        yield event;
                        if terminal {
                            return;
                        }
                    }
                }
            }
        }
    }
}
