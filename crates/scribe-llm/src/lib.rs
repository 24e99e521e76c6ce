mod sse;

use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use scribe_core::{ChatRequest, LlmConfig, StreamCallback, StreamChunk};
use serde_json::{Value, json};
use std::error::Error as StdError;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

pub use sse::{DeltaStream, SseEvent, SseReassembler};

/// Base delay for network/transport error retries (1s, 2s, 4s exponential backoff).
const NETWORK_RETRY_BASE_MS: u64 = 1000;

/// Shared abort flag for one chat turn.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wrap an existing flag, e.g. one a signal handler sets.
impl From<Arc<AtomicBool>> for CancelToken {
    fn from(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }
}

/// Accumulated response text for one turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseBuffer {
    text: String,
}

impl ResponseBuffer {
    pub fn push_delta(&mut self, delta: &str) {
        self.text.push_str(delta);
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    /// The caller cancelled the turn. The text is whatever arrived before.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub text: String,
    pub status: TurnStatus,
}

/// Terminal failure of a chat turn. Every variant keeps the text received
/// before the failure.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("missing API key: set {env} or llm.api_key in settings")]
    MissingApiKey { env: String },
    #[error("{message}")]
    Api {
        status: u16,
        message: String,
        partial: String,
    },
    #[error("{message}")]
    Transport { message: String, partial: String },
}

impl TurnError {
    pub fn partial(&self) -> &str {
        match self {
            Self::MissingApiKey { .. } => "",
            Self::Api { partial, .. } | Self::Transport { partial, .. } => partial,
        }
    }
}

/// Drain a server-sent-event body into a [`TurnOutcome`], invoking `cb` for
/// every delta as it arrives.
pub fn consume_stream<R: Read>(
    reader: R,
    cancel: &CancelToken,
    cb: &StreamCallback,
) -> Result<TurnOutcome, TurnError> {
    let mut buffer = ResponseBuffer::default();
    let mut stream = DeltaStream::new(reader, cancel.clone());
    for delta in stream.by_ref() {
        match delta {
            Ok(text) => {
                buffer.push_delta(&text);
                cb(StreamChunk::ContentDelta(text));
            }
            Err(e) => {
                return Err(TurnError::Transport {
                    message: format!("stream read error: {e}"),
                    partial: buffer.into_string(),
                });
            }
        }
    }

    if stream.is_cancelled() {
        return Ok(TurnOutcome {
            text: buffer.into_string(),
            status: TurnStatus::Cancelled,
        });
    }
    cb(StreamChunk::Done);
    Ok(TurnOutcome {
        text: buffer.into_string(),
        status: TurnStatus::Completed,
    })
}

pub trait ChatClient {
    /// Stream one completion. Returns once the stream ends, fails or is
    /// cancelled through `cancel`.
    fn stream_chat(
        &self,
        req: &ChatRequest,
        cancel: &CancelToken,
        cb: StreamCallback,
    ) -> Result<TurnOutcome, TurnError>;
}

/// OpenAI-compatible streaming client (OpenRouter by default).
#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    cfg: LlmConfig,
    client: Client,
}

impl OpenRouterClient {
    pub fn new(cfg: LlmConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self { cfg, client })
    }

    fn build_payload(&self, req: &ChatRequest) -> Value {
        let mut payload = json!({
            "model": req.model,
            "messages": req.messages,
            "stream": true,
        });
        if let Some(temperature) = req.temperature.or(self.cfg.temperature) {
            payload["temperature"] = json!(temperature);
        }
        payload
    }
}

impl ChatClient for OpenRouterClient {
    fn stream_chat(
        &self,
        req: &ChatRequest,
        cancel: &CancelToken,
        cb: StreamCallback,
    ) -> Result<TurnOutcome, TurnError> {
        let Some(api_key) = self.cfg.resolve_api_key() else {
            return Err(TurnError::MissingApiKey {
                env: self.cfg.api_key_env.clone(),
            });
        };
        let payload = self.build_payload(req);

        let mut last_err: Option<TurnError> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.cfg.max_retries {
            if cancel.is_cancelled() {
                return Ok(TurnOutcome {
                    text: String::new(),
                    status: TurnStatus::Cancelled,
                });
            }
            let response = self
                .client
                .post(&self.cfg.endpoint)
                .bearer_auth(&api_key)
                .header("X-Title", &self.cfg.app_title)
                .json(&payload)
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        // No retries once bytes start flowing.
                        return consume_stream(resp, cancel, &cb);
                    }
                    let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));
                    let body = resp.text().unwrap_or_default();
                    last_err = Some(format_api_error(
                        status,
                        &body,
                        attempt,
                        self.cfg.max_retries,
                    ));
                    if should_retry_status(status) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay_ms(self.cfg.retry_base_ms, attempt, retry_after));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = Some(format_transport_error(&e));
                    if should_retry_transport_error(&e) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay_ms(NETWORK_RETRY_BASE_MS, attempt, None));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| TurnError::Transport {
            message: "chat streaming request failed".to_string(),
            partial: String::new(),
        }))
    }
}

/// Produce a user-friendly error from a non-2xx chat response.
fn format_api_error(status: StatusCode, body: &str, attempt: u8, max_retries: u8) -> TurnError {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(ToString::to_string))
        })
        .unwrap_or_else(|| body.chars().take(200).collect());

    let message = match status {
        StatusCode::UNAUTHORIZED => {
            "Invalid or missing API key (HTTP 401). Check llm.api_key or the configured key env var."
                .to_string()
        }
        StatusCode::TOO_MANY_REQUESTS => format!(
            "Rate limited (HTTP 429). Exhausted {}/{} attempts. Detail: {}",
            attempt + 1,
            max_retries + 1,
            detail
        ),
        StatusCode::INTERNAL_SERVER_ERROR | StatusCode::SERVICE_UNAVAILABLE => format!(
            "Chat server error (HTTP {}). Exhausted {}/{} attempts. Detail: {}",
            status.as_u16(),
            attempt + 1,
            max_retries + 1,
            detail
        ),
        _ => format!("Chat API error (HTTP {}): {}", status.as_u16(), detail),
    };
    TurnError::Api {
        status: status.as_u16(),
        message,
        partial: String::new(),
    }
}

/// Produce a user-friendly error from a transport/network failure.
fn format_transport_error(err: &reqwest::Error) -> TurnError {
    let inner_msg = err
        .source()
        .map(|e| e.to_string())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let is_dns = inner_msg.contains("dns")
        || inner_msg.contains("resolve")
        || inner_msg.contains("no such host")
        || inner_msg.contains("getaddrinfo");

    let message = if err.is_timeout() {
        "Request timed out. Consider raising llm.timeout_seconds.".to_string()
    } else if is_dns {
        "DNS resolution failed for the chat endpoint.".to_string()
    } else if err.is_connect() {
        "Connection refused by the chat endpoint.".to_string()
    } else {
        format!("Network error: {err}")
    };
    TurnError::Transport {
        message,
        partial: String::new(),
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::SERVICE_UNAVAILABLE
    )
}

fn should_retry_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn parse_retry_after_seconds(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    parse_retry_after_http_date(value)
}

fn parse_retry_after_http_date(value: &str) -> Option<u64> {
    let retry_at = DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
                .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        })
        .ok()?;
    let delta = retry_at.signed_duration_since(Utc::now()).num_seconds();
    Some(delta.max(0) as u64)
}

fn retry_delay_ms(base_ms: u64, attempt: u8, retry_after_seconds: Option<u64>) -> Duration {
    if let Some(seconds) = retry_after_seconds {
        return Duration::from_millis(seconds.saturating_mul(1000));
    }
    let exponential = base_ms.saturating_mul(2_u64.saturating_pow(u32::from(attempt)));
    Duration::from_millis(exponential.max(base_ms.max(100)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::ChatMessage;
    use std::io::{Cursor, Write};
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Mutex, mpsc};
    use std::time::Duration as StdDuration;

    const SSE_BODY: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\ndata: [DONE]\n\n";

    fn collecting_callback() -> (StreamCallback, Arc<Mutex<Vec<String>>>) {
        let chunks = Arc::new(Mutex::new(Vec::<String>::new()));
        let chunks_clone = Arc::clone(&chunks);
        let cb: StreamCallback = Arc::new(move |chunk| {
            let label = match chunk {
                StreamChunk::ContentDelta(text) => text,
                StreamChunk::Done => "[DONE]".to_string(),
            };
            chunks_clone.lock().expect("test lock").push(label);
        });
        (cb, chunks)
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "test/model".to_string(),
            messages: vec![ChatMessage::User {
                content: "hello".to_string(),
            }],
            temperature: None,
        }
    }

    #[test]
    fn consume_stream_assembles_text_and_signals_done() {
        let (cb, chunks) = collecting_callback();
        let outcome = consume_stream(
            Cursor::new(SSE_BODY.as_bytes().to_vec()),
            &CancelToken::new(),
            &cb,
        )
        .expect("outcome");
        assert_eq!(outcome.text, "hello");
        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(
            *chunks.lock().expect("test lock"),
            vec!["hel".to_string(), "lo".to_string(), "[DONE]".to_string()]
        );
    }

    /// Yields one frame, then fails like a dropped connection.
    struct BrokenReader {
        sent: bool,
    }

    impl Read for BrokenReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.sent {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "reset",
                ));
            }
            self.sent = true;
            let frame = b"data: {\"choices\":[{\"delta\":{\"content\":\"part\"}}]}\n\n";
            buf[..frame.len()].copy_from_slice(frame);
            Ok(frame.len())
        }
    }

    #[test]
    fn transport_failure_keeps_partial_text() {
        let (cb, _) = collecting_callback();
        let err = consume_stream(BrokenReader { sent: false }, &CancelToken::new(), &cb)
            .expect_err("should fail");
        assert!(matches!(err, TurnError::Transport { .. }));
        assert_eq!(err.partial(), "part");
    }

    #[test]
    fn cancelled_turn_is_not_an_error() {
        let cancel = CancelToken::new();
        let cancel_in_cb = cancel.clone();
        let cb: StreamCallback = Arc::new(move |chunk| {
            if chunk == StreamChunk::ContentDelta("hel".to_string()) {
                cancel_in_cb.cancel();
            }
        });
        let outcome =
            consume_stream(Cursor::new(SSE_BODY.as_bytes().to_vec()), &cancel, &cb).expect("ok");
        assert_eq!(outcome.status, TurnStatus::Cancelled);
        assert_eq!(outcome.text, "hel");
    }

    #[test]
    fn retry_status_classification() {
        assert!(should_retry_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(should_retry_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!should_retry_status(StatusCode::UNAUTHORIZED));
        assert!(!should_retry_status(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn retry_after_parses_seconds_and_http_date() {
        let seconds_header = reqwest::header::HeaderValue::from_static("7");
        assert_eq!(parse_retry_after_seconds(Some(&seconds_header)), Some(7));

        let future = Utc::now() + chrono::Duration::seconds(5);
        let http_date = future.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let date_header = reqwest::header::HeaderValue::from_str(&http_date).expect("header");
        let parsed = parse_retry_after_seconds(Some(&date_header)).expect("parsed");
        assert!(parsed <= 10);
    }

    #[test]
    fn api_error_extracts_nested_message() {
        let err = format_api_error(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"message":"model not found"}}"#,
            0,
            0,
        );
        assert!(err.to_string().contains("model not found"));
        assert!(matches!(err, TurnError::Api { status: 400, .. }));
    }

    #[test]
    fn missing_api_key_is_rejected_before_network_call() {
        let client = OpenRouterClient::new(LlmConfig {
            endpoint: "http://127.0.0.1:9/never".to_string(),
            api_key_env: "SCRIBE_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            api_key: None,
            ..LlmConfig::default()
        })
        .expect("client");
        let (cb, _) = collecting_callback();
        let err = client
            .stream_chat(&request(), &CancelToken::new(), cb)
            .expect_err("no key");
        assert!(matches!(err, TurnError::MissingApiKey { .. }));
    }

    #[derive(Clone)]
    struct MockHttpResponse {
        status: u16,
        content_type: &'static str,
        body: String,
    }

    struct MockServer {
        endpoint: String,
        request_count: Arc<AtomicUsize>,
        stop_tx: Option<mpsc::Sender<()>>,
        handle: Option<thread::JoinHandle<()>>,
    }

    impl Drop for MockServer {
        fn drop(&mut self) {
            if let Some(tx) = self.stop_tx.take() {
                let _ = tx.send(());
            }
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn start_mock_server(responses: Vec<MockHttpResponse>) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        listener
            .set_nonblocking(true)
            .expect("set nonblocking listener");
        let addr = listener.local_addr().expect("addr");
        let request_count = Arc::new(AtomicUsize::new(0));
        let request_count_thread = Arc::clone(&request_count);
        let (tx, rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            loop {
                if rx.try_recv().is_ok() {
                    break;
                }
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        let _ = consume_http_request(&mut stream);
                        let idx = request_count_thread.fetch_add(1, Ordering::SeqCst);
                        let Some(selected) = responses
                            .get(idx)
                            .cloned()
                            .or_else(|| responses.last().cloned())
                        else {
                            break;
                        };
                        let response = format!(
                            "HTTP/1.1 {} X\r\nContent-Type: {}\r\nContent-Length: {}\r\nRetry-After: 0\r\nConnection: close\r\n\r\n{}",
                            selected.status,
                            selected.content_type,
                            selected.body.len(),
                            selected.body
                        );
                        let _ = stream.write_all(response.as_bytes());
                        let _ = stream.flush();
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(StdDuration::from_millis(2));
                    }
                    Err(_) => break,
                }
            }
        });
        MockServer {
            endpoint: format!("http://{addr}/api/v1/chat/completions"),
            request_count,
            stop_tx: Some(tx),
            handle: Some(handle),
        }
    }

    fn consume_http_request(stream: &mut std::net::TcpStream) -> std::io::Result<()> {
        let mut buffer = Vec::new();
        let mut chunk = [0_u8; 1024];
        let mut header_end = None;
        while header_end.is_none() {
            let read = stream.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);
            header_end = buffer
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
                .map(|idx| idx + 4);
        }
        let header_len = header_end.unwrap_or(buffer.len());
        let headers = String::from_utf8_lossy(&buffer[..header_len]).to_string();
        let content_length = headers
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let mut body_len = buffer.len() - header_len;
        while body_len < content_length {
            let read = stream.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            body_len += read;
        }
        Ok(())
    }

    fn client_for(server: &MockServer, env: &str) -> OpenRouterClient {
        OpenRouterClient::new(LlmConfig {
            endpoint: server.endpoint.clone(),
            api_key: Some("test-key".to_string()),
            api_key_env: env.to_string(),
            max_retries: 2,
            retry_base_ms: 1,
            ..LlmConfig::default()
        })
        .expect("client")
    }

    #[test]
    fn stream_chat_retries_transient_status_then_streams() {
        let server = start_mock_server(vec![
            MockHttpResponse {
                status: 503,
                content_type: "application/json",
                body: r#"{"error":"temporarily_unavailable"}"#.to_string(),
            },
            MockHttpResponse {
                status: 200,
                content_type: "text/event-stream",
                body: SSE_BODY.to_string(),
            },
        ]);
        let client = client_for(&server, "SCRIBE_TEST_KEY_RETRY_UNSET");
        let (cb, chunks) = collecting_callback();
        let outcome = client
            .stream_chat(&request(), &CancelToken::new(), cb)
            .expect("stream");
        assert_eq!(outcome.text, "hello");
        assert_eq!(server.request_count.load(Ordering::SeqCst), 2);
        assert_eq!(chunks.lock().expect("test lock").len(), 3);
    }

    #[test]
    fn stream_chat_surfaces_non_retryable_status() {
        let server = start_mock_server(vec![MockHttpResponse {
            status: 401,
            content_type: "application/json",
            body: r#"{"error":{"message":"bad key"}}"#.to_string(),
        }]);
        let client = client_for(&server, "SCRIBE_TEST_KEY_401_UNSET");
        let (cb, _) = collecting_callback();
        let err = client
            .stream_chat(&request(), &CancelToken::new(), cb)
            .expect_err("401");
        assert!(matches!(err, TurnError::Api { status: 401, .. }));
        assert_eq!(server.request_count.load(Ordering::SeqCst), 1);
    }
}
