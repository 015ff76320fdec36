use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::editor::EditorImpl;
use crate::extract::Span;

/// How long a request may stay unanswered before it settles as a timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Error string a content script reports when it has no live editor to serve.
pub const EDITOR_UNAVAILABLE: &str = "no supported editor instance found";

// ---- Wire types ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestKind {
    GetSelectionContext,
    GetCurrentLine,
    GetTaskBlock,
    CutRanges,
    ReplaceSelection,
    RestoreCursor,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RequestPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ranges: Option<Vec<Span>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Which backend the request is for. The selection-context probe carries
    /// no target; every follow-up request echoes the backend the probe
    /// resolved, so a broadcast cannot be answered by the wrong script.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<EditorImpl>,
}

impl RequestPayload {
    pub fn for_target(target: EditorImpl) -> Self {
        Self {
            target: Some(target),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeRequest {
    #[serde(rename = "type")]
    pub kind: RequestKind,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<RequestPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeResponse {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BridgeResponse {
    pub fn success(request_id: &str, data: Value) -> Self {
        Self {
            request_id: request_id.to_string(),
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(request_id: &str, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("the editor did not answer in time")]
    Timeout,
    #[error("no bridge channel accepted the request")]
    ChannelUnavailable,
    #[error("no supported editor instance found")]
    EditorUnavailable,
    #[error("{0}")]
    Request(String),
}

// ---- Bridge ----

/// Correlation-ID request/response channel between the orchestrator and the
/// content scripts embedded in the editor views. Requests are broadcast to
/// every registered delivery channel; the first matching response settles the
/// request and later or unknown responses are dropped.
#[derive(Clone, Default)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    channels: Mutex<Vec<mpsc::UnboundedSender<BridgeRequest>>>,
    pending: Mutex<HashMap<String, Pending>>,
    timeout: Duration,
}

/// One in-flight request. A success settles it immediately; failures are
/// held back until every channel that accepted the broadcast has failed, so
/// a dead editor view cannot out-race a live one.
struct Pending {
    resolver: oneshot::Sender<BridgeResponse>,
    expected: Option<usize>,
    failures: usize,
    last_failure: Option<BridgeResponse>,
}

impl Default for BridgeInner {
    fn default() -> Self {
        Self {
            channels: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            timeout: REQUEST_TIMEOUT,
        }
    }
}

impl Bridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                timeout,
                ..Default::default()
            }),
        }
    }

    /// Registers a delivery channel and hands back its receiving end for a
    /// content script to serve. Channels whose receiver has gone away are
    /// pruned on the next send.
    pub fn open_channel(&self) -> mpsc::UnboundedReceiver<BridgeRequest> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .channels
            .lock()
            .expect("bridge channels mutex")
            .push(tx);
        rx
    }

    /// Delivers a response from a content script. Responses whose ID matches
    /// no pending request (stale, duplicate, or from a second script that
    /// answered the same broadcast) are dropped silently. The first success
    /// settles the request; a failure settles it only once every channel
    /// that accepted the broadcast has failed.
    pub fn deliver(&self, response: BridgeResponse) {
        let mut pending = self.inner.pending.lock().expect("bridge pending mutex");

        if response.ok {
            if let Some(entry) = pending.remove(&response.request_id) {
                let _ = entry.resolver.send(response);
            }
            return;
        }

        let settled = match pending.get_mut(&response.request_id) {
            Some(entry) => {
                entry.failures += 1;
                entry.last_failure = Some(response.clone());
                entry
                    .expected
                    .map_or(false, |expected| entry.failures >= expected)
            }
            None => return,
        };
        if settled {
            if let Some(entry) = pending.remove(&response.request_id) {
                let _ = entry.resolver.send(response);
            }
        }
    }

    /// Sends one request and waits for its response. Settles exactly once:
    /// with the response data, a descriptive error from the script, an
    /// immediate channel failure, or a timeout.
    pub async fn request(
        &self,
        kind: RequestKind,
        payload: Option<RequestPayload>,
    ) -> Result<Value, BridgeError> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().expect("bridge pending mutex").insert(
            request_id.clone(),
            Pending {
                resolver: tx,
                expected: None,
                failures: 0,
                last_failure: None,
            },
        );

        let request = BridgeRequest {
            kind,
            request_id: request_id.clone(),
            payload,
        };

        let mut accepted = 0usize;
        {
            let mut channels = self.inner.channels.lock().expect("bridge channels mutex");
            channels.retain(|channel| match channel.send(request.clone()) {
                Ok(()) => {
                    accepted += 1;
                    true
                }
                Err(_) => false,
            });
        }
        if accepted == 0 {
            self.inner
                .pending
                .lock()
                .expect("bridge pending mutex")
                .remove(&request_id);
            return Err(BridgeError::ChannelUnavailable);
        }

        // Arm the everyone-failed settle now that the fan-out width is known;
        // fast failures may already have arrived.
        {
            let mut pending = self.inner.pending.lock().expect("bridge pending mutex");
            let already_failed = match pending.get_mut(&request_id) {
                Some(entry) => {
                    entry.expected = Some(accepted);
                    entry.failures >= accepted
                }
                None => false,
            };
            if already_failed {
                if let Some(entry) = pending.remove(&request_id) {
                    if let Some(failure) = entry.last_failure {
                        let _ = entry.resolver.send(failure);
                    }
                }
            }
        }

        match tokio::time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(response)) => {
                if response.ok {
                    Ok(response.data.unwrap_or(Value::Null))
                } else {
                    let message = response
                        .error
                        .unwrap_or_else(|| "editor request failed".to_string());
                    if message == EDITOR_UNAVAILABLE {
                        Err(BridgeError::EditorUnavailable)
                    } else {
                        Err(BridgeError::Request(message))
                    }
                }
            }
            Ok(Err(_)) => Err(BridgeError::ChannelUnavailable),
            Err(_) => {
                self.inner
                    .pending
                    .lock()
                    .expect("bridge pending mutex")
                    .remove(&request_id);
                Err(BridgeError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = BridgeRequest {
            kind: RequestKind::CutRanges,
            request_id: "abc".to_string(),
            payload: Some(RequestPayload {
                ranges: Some(vec![Span::new(0, 5)]),
                ..Default::default()
            }),
        };
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(
            wire,
            json!({
                "type": "CUT_RANGES",
                "requestId": "abc",
                "payload": { "ranges": [{ "from": 0, "to": 5 }] }
            })
        );
    }

    #[test]
    fn test_response_wire_shape() {
        let ok = BridgeResponse::success("abc", json!({ "updatedDocText": "x" }));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({ "requestId": "abc", "ok": true, "data": { "updatedDocText": "x" } })
        );

        let err = BridgeResponse::failure("abc", "boom");
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({ "requestId": "abc", "ok": false, "error": "boom" })
        );
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let bridge = Bridge::new();
        let mut requests = bridge.open_channel();

        let responder = bridge.clone();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                responder.deliver(BridgeResponse::success(
                    &request.request_id,
                    json!({ "text": "hello" }),
                ));
            }
        });

        let data = bridge
            .request(RequestKind::GetCurrentLine, None)
            .await
            .unwrap();
        assert_eq!(data, json!({ "text": "hello" }));
    }

    #[tokio::test]
    async fn test_request_with_no_channel_fails_immediately() {
        let bridge = Bridge::new();
        let err = bridge
            .request(RequestKind::GetSelectionContext, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ChannelUnavailable));
    }

    #[tokio::test]
    async fn test_request_with_dropped_receiver_fails_immediately() {
        let bridge = Bridge::new();
        drop(bridge.open_channel());
        let err = bridge
            .request(RequestKind::GetSelectionContext, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ChannelUnavailable));
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let bridge = Bridge::with_timeout(Duration::from_millis(30));
        let _requests = bridge.open_channel();
        let err = bridge
            .request(RequestKind::GetSelectionContext, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout));
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_responses_are_dropped() {
        let bridge = Bridge::new();
        let mut requests = bridge.open_channel();

        let responder = bridge.clone();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                responder.deliver(BridgeResponse::failure("not-a-request", "stale"));
                responder.deliver(BridgeResponse::success(&request.request_id, json!(1)));
                responder.deliver(BridgeResponse::success(&request.request_id, json!(2)));
            }
        });

        let data = bridge.request(RequestKind::GetTaskBlock, None).await.unwrap();
        assert_eq!(data, json!(1));
        // A second request still works after the duplicates were dropped.
        let data = bridge.request(RequestKind::GetTaskBlock, None).await.unwrap();
        assert_eq!(data, json!(1));
    }

    #[tokio::test]
    async fn test_broadcast_first_response_wins() {
        let bridge = Bridge::with_timeout(Duration::from_secs(1));

        let mut fast = bridge.open_channel();
        let fast_responder = bridge.clone();
        tokio::spawn(async move {
            while let Some(request) = fast.recv().await {
                fast_responder.deliver(BridgeResponse::success(&request.request_id, json!("fast")));
            }
        });

        let mut slow = bridge.open_channel();
        let slow_responder = bridge.clone();
        tokio::spawn(async move {
            while let Some(request) = slow.recv().await {
                tokio::time::sleep(Duration::from_millis(50)).await;
                slow_responder.deliver(BridgeResponse::success(&request.request_id, json!("slow")));
            }
        });

        let data = bridge
            .request(RequestKind::GetSelectionContext, None)
            .await
            .unwrap();
        assert_eq!(data, json!("fast"));
        // Give the slow script time to deliver its duplicate; it must not panic.
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    #[tokio::test]
    async fn test_failure_waits_for_a_possible_success() {
        let bridge = Bridge::with_timeout(Duration::from_secs(1));

        // A dead view that answers every request with a failure, instantly.
        let mut dead = bridge.open_channel();
        let dead_responder = bridge.clone();
        tokio::spawn(async move {
            while let Some(request) = dead.recv().await {
                dead_responder.deliver(BridgeResponse::failure(
                    &request.request_id,
                    EDITOR_UNAVAILABLE,
                ));
            }
        });

        // A live view that takes a moment to answer successfully.
        let mut live = bridge.open_channel();
        let live_responder = bridge.clone();
        tokio::spawn(async move {
            while let Some(request) = live.recv().await {
                tokio::time::sleep(Duration::from_millis(20)).await;
                live_responder.deliver(BridgeResponse::success(&request.request_id, json!("live")));
            }
        });

        let data = bridge
            .request(RequestKind::GetSelectionContext, None)
            .await
            .unwrap();
        assert_eq!(data, json!("live"));
    }

    #[tokio::test]
    async fn test_all_channels_failing_settles_with_the_failure() {
        let bridge = Bridge::with_timeout(Duration::from_secs(5));
        for _ in 0..2 {
            let mut requests = bridge.open_channel();
            let responder = bridge.clone();
            tokio::spawn(async move {
                while let Some(request) = requests.recv().await {
                    responder.deliver(BridgeResponse::failure(
                        &request.request_id,
                        EDITOR_UNAVAILABLE,
                    ));
                }
            });
        }

        // Settles well before the timeout because every channel failed.
        let start = std::time::Instant::now();
        let err = bridge
            .request(RequestKind::GetSelectionContext, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::EditorUnavailable));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_script_error_maps_to_editor_unavailable() {
        let bridge = Bridge::new();
        let mut requests = bridge.open_channel();

        let responder = bridge.clone();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                responder.deliver(BridgeResponse::failure(&request.request_id, EDITOR_UNAVAILABLE));
            }
        });

        let err = bridge
            .request(RequestKind::GetSelectionContext, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::EditorUnavailable));
    }
}
