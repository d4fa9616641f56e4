//! HTTP requests tunnelled through `http-stream1` channels.
//!
//! Each request is one channel.  The open options carry the method, path and
//! headers; the request body follows as data and ends with `done`.  The
//! first message coming back is a JSON response head
//! (`{"status": 200, "reason": "OK", "headers": {...}}`), the remaining
//! messages are the body.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::debug;

use bridgemux_core::{Control, Payload, Problem};

use crate::application::buffer::{BufferCallback, ChannelBuffer};
use crate::application::channel::{Channel, ChannelEvent, ChannelEvents, ChannelOptions};
use crate::application::transport::Transport;
use crate::domain::errors::{ChannelError, HttpError};

pub type Headers = BTreeMap<String, String>;

/// Where the bridge sends the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A unix socket path.
    Unix(String),
    /// A TCP port, on `address` or localhost.
    Port(u16),
}

impl FromStr for Endpoint {
    type Err = HttpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with('/') {
            return Ok(Endpoint::Unix(s.to_owned()));
        }
        s.parse::<u16>()
            .map(Endpoint::Port)
            .map_err(|_| HttpError::InvalidEndpoint(s.to_owned()))
    }
}

/// Settings shared by every request of one [`HttpClient`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpOptions {
    /// Remote address to connect to instead of localhost.
    pub address: Option<String>,
    /// Sent with every request; per-request headers win.
    pub headers: Headers,
    pub binary: bool,
    pub host: Option<String>,
    pub superuser: Option<String>,
    /// TLS settings, passed through verbatim.
    pub tls: Option<Value>,
    pub extra: Map<String, Value>,
}

/// One request.  `body: None` leaves the request body open for
/// [`HttpResponse::input`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub params: Vec<(String, String)>,
    pub headers: Headers,
    pub body: Option<Payload>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    /// The path with `params` appended as a form-encoded query.
    fn target(&self) -> String {
        let path = if self.path.is_empty() { "/" } else { self.path.as_str() };
        if self.params.is_empty() {
            return path.to_owned();
        }
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.params.iter())
            .finish();
        let separator = if path.contains('?') { '&' } else { '?' };
        format!("{path}{separator}{query}")
    }
}

/// Status line and headers of a response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub headers: Headers,
}

impl ResponseHead {
    pub fn is_success(&self) -> bool {
        (200..=299).contains(&self.status)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

fn find_header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

// ── HttpClient ────────────────────────────────────────────────────────────────

struct ClientShared {
    transport: Arc<Transport>,
    endpoint: Option<Endpoint>,
    options: HttpOptions,
    active: Mutex<Vec<(u64, Channel)>>,
    next_request: Mutex<u64>,
}

/// Sends HTTP requests to one endpoint through the bridge.  Cheap to clone.
#[derive(Clone)]
pub struct HttpClient {
    shared: Arc<ClientShared>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("endpoint", &self.shared.endpoint)
            .field("address", &self.shared.options.address)
            .finish()
    }
}

impl HttpClient {
    /// A client for `endpoint`, or for whatever `options.extra` names when
    /// `endpoint` is `None`.
    pub fn new(transport: &Arc<Transport>, endpoint: Option<Endpoint>, options: HttpOptions) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                transport: Arc::clone(transport),
                endpoint,
                options,
                active: Mutex::new(Vec::new()),
                next_request: Mutex::new(0),
            }),
        }
    }

    /// Starts a request.
    pub fn request(&self, request: HttpRequest) -> HttpResponse {
        let shared = &self.shared;
        let options = &shared.options;

        let mut headers = options.headers.clone();
        headers.extend(request.headers.clone());
        let method = if request.method.is_empty() { "GET" } else { request.method.as_str() };

        let mut open = ChannelOptions::new("http-stream1")
            .binary(options.binary)
            .merge(&options.extra)
            .with("method", method)
            .with("path", request.target())
            .with("headers", Value::Object(headers.into_iter().map(|(k, v)| (k, Value::String(v))).collect()));
        open.host = options.host.clone();
        match &shared.endpoint {
            Some(Endpoint::Unix(path)) => open = open.with("unix", path.as_str()),
            Some(Endpoint::Port(port)) => open = open.with("port", *port),
            None => {}
        }
        if let Some(address) = &options.address {
            open = open.with("address", address.as_str()).with("capabilities", vec!["address"]);
        }
        if let Some(superuser) = &options.superuser {
            open = open.with("superuser", superuser.as_str());
        }
        if let Some(tls) = &options.tls {
            open = open.with("tls", tls.clone());
        }

        debug!(target: "bridgemux::http", "http request: {method} {}", request.target());
        let (channel, events) = Channel::open(&shared.transport, open);

        if let Some(body) = request.body {
            if !body.is_empty() {
                channel.send(body);
            }
            channel.done();
        }

        let id = {
            let mut next = shared.next_request.lock().unwrap_or_else(PoisonError::into_inner);
            *next += 1;
            *next
        };
        shared.lock_active().push((id, channel.clone()));

        let (head, _) = watch::channel(None);
        let (result, _) = watch::channel(None);
        let state = Arc::new(RequestState {
            binary: options.binary,
            buffer: Mutex::new(ChannelBuffer::new(options.binary)),
            streamer: Mutex::new(None),
            head,
            result,
        });
        tokio::spawn(pump(Arc::clone(&state), Arc::clone(shared), channel.clone(), events, id));

        HttpResponse { channel, state }
    }

    /// `GET path?params`.
    pub fn get(&self, path: &str, params: &[(&str, &str)], headers: Headers) -> HttpResponse {
        let mut request = HttpRequest::new("GET", path);
        request.params = params.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
        request.headers = headers;
        request.body = Some(Payload::Text(String::new()));
        self.request(request)
    }

    /// `POST path` with a raw body.
    pub fn post(&self, path: &str, body: Option<Payload>, headers: Headers) -> HttpResponse {
        let mut request = HttpRequest::new("POST", path);
        request.headers = headers;
        request.body = Some(body.unwrap_or_else(|| Payload::Text(String::new())));
        self.request(request)
    }

    /// `POST path` with a JSON body; sets `Content-Type` unless given.
    pub fn post_json(&self, path: &str, body: &Value, headers: Headers) -> HttpResponse {
        let mut headers = headers;
        if find_header(&headers, "Content-Type").is_none() {
            headers.insert("Content-Type".to_owned(), "application/json".to_owned());
        }
        self.post(path, Some(Payload::Text(body.to_string())), headers)
    }

    /// Closes every request still running.
    pub fn close(&self, problem: Option<&str>) {
        let active: Vec<Channel> = self.shared.lock_active().drain(..).map(|(_, c)| c).collect();
        for channel in active {
            channel.close(problem);
        }
    }
}

impl ClientShared {
    fn lock_active(&self) -> MutexGuard<'_, Vec<(u64, Channel)>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── HttpResponse ──────────────────────────────────────────────────────────────

struct RequestState {
    binary: bool,
    buffer: Mutex<ChannelBuffer>,
    streamer: Mutex<Option<BufferCallback>>,
    head: watch::Sender<Option<ResponseHead>>,
    result: watch::Sender<Option<Result<Payload, HttpError>>>,
}

impl RequestState {
    fn buffer(&self) -> MutexGuard<'_, ChannelBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands the body to the streaming callback once a 2xx head is in.
    fn install_streamer(&self) {
        let success = self.head.borrow().as_ref().is_some_and(ResponseHead::is_success);
        if !success {
            return;
        }
        let streamer = self.streamer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(streamer) = streamer {
            self.buffer().set_callback(streamer);
        }
    }

    fn finish(&self, outcome: Result<Payload, HttpError>) {
        self.result.send_if_modified(|result| {
            if result.is_some() {
                return false;
            }
            *result = Some(outcome);
            true
        });
    }
}

/// A request in flight.
#[derive(Clone)]
pub struct HttpResponse {
    channel: Channel,
    state: Arc<RequestState>,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse").field("channel", &self.channel.to_string()).finish()
    }
}

impl HttpResponse {
    /// Streams a successful body to `callback` instead of collecting it.
    /// The callback returns how many bytes it consumed.
    pub fn stream(&self, callback: impl FnMut(&Payload) -> usize + Send + 'static) -> &Self {
        let callback: BufferCallback = Box::new(callback);
        *self.state.streamer.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);
        self.state.install_streamer();
        self
    }

    /// Sends more request body.  Unless `stream` is set, the body is ended.
    pub fn input(&self, data: Option<Payload>, stream: bool) -> &Self {
        if let Some(data) = data {
            self.channel.send(data);
        }
        if !stream {
            self.channel.done();
        }
        self
    }

    pub fn close(&self, problem: Option<&str>) {
        debug!(target: "bridgemux::http", "http closing: {problem:?}");
        self.channel.close(problem);
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Waits for the status line and headers.
    ///
    /// # Errors
    ///
    /// Fails if the request ended without a response head.
    pub async fn response(&self) -> Result<ResponseHead, HttpError> {
        let mut head = self.state.head.subscribe();
        let mut result = self.state.result.subscribe();
        loop {
            if let Some(head) = head.borrow_and_update().clone() {
                return Ok(head);
            }
            if let Some(outcome) = result.borrow_and_update().clone() {
                return Err(match outcome {
                    Err(error) => error,
                    Ok(_) => HttpError::InvalidResponse("no response head".to_owned()),
                });
            }
            tokio::select! {
                changed = head.changed() => if changed.is_err() { return Err(disconnected()) },
                changed = result.changed() => if changed.is_err() { return Err(disconnected()) },
            }
        }
    }

    /// Waits for the whole body.
    ///
    /// # Errors
    ///
    /// [`HttpError::Status`] for a non-2xx status, otherwise the channel's
    /// problem or an unparsable response head.
    pub async fn body(&self) -> Result<Payload, HttpError> {
        let mut rx = self.state.result.subscribe();
        rx.wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|result| result.clone())
            .unwrap_or_else(|| Err(disconnected()))
    }

    /// Like [`HttpResponse::body`], decoded as text.
    pub async fn text(&self) -> Result<String, HttpError> {
        Ok(self.body().await?.into_text_lossy())
    }
}

fn disconnected() -> HttpError {
    HttpError::Channel(ChannelError::new(Problem::Disconnected))
}

async fn pump(
    state: Arc<RequestState>,
    client: Arc<ClientShared>,
    channel: Channel,
    mut events: ChannelEvents,
    id: u64,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Message(payload) => {
                if state.head.borrow().is_some() {
                    state.buffer().push(payload);
                    continue;
                }
                match serde_json::from_slice::<ResponseHead>(payload.as_bytes()) {
                    Ok(head) => {
                        debug!(target: "bridgemux::http", "http response: {} {}", head.status, head.reason);
                        state.head.send_replace(Some(head));
                        state.install_streamer();
                    }
                    Err(e) => {
                        state.finish(Err(HttpError::InvalidResponse(e.to_string())));
                        channel.close(Some("protocol-error"));
                    }
                }
            }
            ChannelEvent::Close(options) => {
                client.lock_active().retain(|(active, _)| *active != id);
                state.finish(outcome(&state, &options));
                return;
            }
            ChannelEvent::Ready(_) | ChannelEvent::Control(_) => {}
        }
    }
}

fn outcome(state: &RequestState, options: &Control) -> Result<Payload, HttpError> {
    if let Some(error) = ChannelError::from_close(options) {
        debug!(target: "bridgemux::http", "http problem: {}", error.problem.code());
        return Err(error.into());
    }

    let body = state.buffer().take();
    let head = state.head.borrow().clone();
    match head {
        Some(head) if !head.is_success() => {
            let plain = !state.binary && head.header("Content-Type").is_some_and(|t| t.starts_with("text/plain"));
            let message = if plain { body.clone().into_text_lossy() } else { head.reason.clone() };
            debug!(target: "bridgemux::http", "http status: {}", head.status);
            Err(HttpError::Status {
                status: head.status,
                reason: head.reason,
                message,
                body,
            })
        }
        _ => Ok(body),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ready_transport, settle};
    use serde_json::json;

    #[test]
    fn test_endpoint_parsing() {
        assert_eq!("/run/docker.sock".parse::<Endpoint>().unwrap(), Endpoint::Unix("/run/docker.sock".into()));
        assert_eq!("8080".parse::<Endpoint>().unwrap(), Endpoint::Port(8080));
        assert!(matches!("nope".parse::<Endpoint>(), Err(HttpError::InvalidEndpoint(_))));
    }

    #[test]
    fn test_params_are_form_encoded() {
        let mut request = HttpRequest::new("GET", "/search?x=1");
        request.params = vec![("q".into(), "a b&c".into())];
        assert_eq!(request.target(), "/search?x=1&q=a+b%26c");
        assert_eq!(HttpRequest::new("GET", "").target(), "/");
    }

    #[tokio::test]
    async fn test_get_opens_with_merged_headers_and_resolves_body() {
        // Arrange
        let (transport, mut bridge) = ready_transport().await;
        let options = HttpOptions {
            headers: Headers::from([("X-A".into(), "1".into()), ("X-B".into(), "1".into())]),
            ..HttpOptions::default()
        };
        let client = HttpClient::new(&transport, Some(Endpoint::Port(8080)), options);

        // Act
        let response = client.get("/info", &[("v", "2")], Headers::from([("X-B".into(), "2".into())]));
        let open = bridge.expect_open("http-stream1").await;
        let done = bridge.recv_control().await;
        bridge.send("t:1", r#"{"status": 200, "reason": "OK", "headers": {}}"#);
        bridge.send("t:1", "hel");
        bridge.send("t:1", "lo");
        bridge.send_control(json!({"command": "close", "channel": "t:1"}));

        // Assert
        assert_eq!(open.get_str("method"), Some("GET"));
        assert_eq!(open.get_str("path"), Some("/info?v=2"));
        assert_eq!(open.get("port"), Some(&json!(8080)));
        assert_eq!(open.get("headers"), Some(&json!({"X-A": "1", "X-B": "2"})));
        assert_eq!(done.command.as_str(), "done");
        assert_eq!(response.response().await.unwrap().status, 200);
        assert_eq!(response.text().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_non_success_status_is_error_with_plain_text_message() {
        let (transport, mut bridge) = ready_transport().await;
        let client = HttpClient::new(&transport, Some(Endpoint::Unix("/run/x.sock".into())), HttpOptions::default());

        let response = client.get("/", &[], Headers::new());
        let open = bridge.expect_open("http-stream1").await;
        bridge.send(
            "t:1",
            r#"{"status": 404, "reason": "Not Found", "headers": {"content-type": "text/plain; charset=utf-8"}}"#,
        );
        bridge.send("t:1", "no such thing");
        bridge.send_control(json!({"command": "close", "channel": "t:1"}));

        assert_eq!(open.get_str("unix"), Some("/run/x.sock"));
        let error = response.body().await.unwrap_err();
        assert_eq!(error.status(), Some(404));
        assert_eq!(error.to_string(), "404 no such thing");
    }

    #[tokio::test]
    async fn test_post_json_sets_content_type_and_address_capability() {
        let (transport, mut bridge) = ready_transport().await;
        let options = HttpOptions {
            address: Some("10.0.0.1".into()),
            ..HttpOptions::default()
        };
        let client = HttpClient::new(&transport, Some(Endpoint::Port(80)), options);

        let _response = client.post_json("/api", &json!({"a": 1}), Headers::new());
        let open = bridge.expect_open("http-stream1").await;
        let body = bridge.recv_frame().await;

        assert_eq!(open.get_str("method"), Some("POST"));
        assert_eq!(open.get("headers"), Some(&json!({"Content-Type": "application/json"})));
        assert_eq!(open.get_str("address"), Some("10.0.0.1"));
        assert_eq!(open.get("capabilities"), Some(&json!(["address"])));
        assert_eq!(body.payload, Payload::Text(r#"{"a":1}"#.into()));
    }

    #[tokio::test]
    async fn test_stream_receives_successful_body() {
        // Arrange
        let (transport, mut bridge) = ready_transport().await;
        let client = HttpClient::new(&transport, Some(Endpoint::Port(80)), HttpOptions::default());
        let response = client.get("/events", &[], Headers::new());
        let seen = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&seen);
        response.stream(move |block| {
            sink.lock().unwrap().push_str(block.as_text().unwrap_or_default());
            block.len()
        });

        // Act
        bridge.expect_open("http-stream1").await;
        bridge.send("t:1", r#"{"status": 200, "reason": "OK"}"#);
        bridge.send("t:1", "a");
        bridge.send("t:1", "b");
        settle().await;

        // Assert
        assert_eq!(*seen.lock().unwrap(), "ab");
    }

    #[tokio::test]
    async fn test_close_cancels_active_requests() {
        let (transport, mut bridge) = ready_transport().await;
        let client = HttpClient::new(&transport, Some(Endpoint::Port(80)), HttpOptions::default());
        let response = client.get("/slow", &[], Headers::new());
        bridge.expect_open("http-stream1").await;
        bridge.recv_control().await;

        client.close(Some("cancelled"));

        let close = bridge.recv_control().await;
        assert_eq!(close.problem(), Some("cancelled"));
        let error = response.body().await.unwrap_err();
        assert!(matches!(error, HttpError::Channel(ref e) if e.problem == Problem::Cancelled));
    }

    #[tokio::test]
    async fn test_invalid_head_is_protocol_error() {
        let (transport, mut bridge) = ready_transport().await;
        let client = HttpClient::new(&transport, Some(Endpoint::Port(80)), HttpOptions::default());
        let response = client.get("/", &[], Headers::new());
        bridge.expect_open("http-stream1").await;
        bridge.recv_control().await;

        bridge.send("t:1", "HTTP/1.1 200 OK");

        assert!(matches!(response.body().await, Err(HttpError::InvalidResponse(_))));
        assert_eq!(bridge.recv_control().await.problem(), Some("protocol-error"));
    }
}
