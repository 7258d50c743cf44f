//! In-process doubles for the UPYUN HTTP API.
//!
//! [`FakeTransport`] records every request and hands it to a [`Server`]
//! which decides the reply. Servers are plain closures for simple REST
//! checks, or [`MultipartServer`] / [`ResumableServer`] when a test needs the
//! stateful upload protocols.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde_json::{json, Map, Value};

use upyun::hasher::md5_hex;
use upyun::sign::{decode_policy, policy_signature};
use upyun::{
    Headers, HttpRequest, HttpResponse, Method, MultipartRules, RequestBody, Transport, Upyun,
    UpyunConfig, UpyunResult,
};

pub const BUCKET: &str = "demo";
pub const OPERATOR: &str = "operator";
pub const PASSWORD: &str = "password";
pub const FORM_SECRET: &str = "form-secret";
pub const UPLOAD_ID: &str = "8b4a1f0e-3c1d-4b5e-9f6a-0123456789ab";

/// A request as the server saw it
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub host: String,
    pub uri: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Urlencoded body fields
    pub fn form_fields(&self) -> BTreeMap<String, String> {
        serde_urlencoded::from_bytes(&self.body).expect("urlencoded body")
    }

    /// Multipart parts keyed by field name
    pub fn multipart_parts(&self) -> HashMap<String, FormPart> {
        let boundary = self
            .header("Content-Type")
            .and_then(|ct| multer::parse_boundary(ct).ok())
            .expect("multipart boundary");
        let body = self.body.clone();
        futures::executor::block_on(async move {
            let mut multipart = multer::Multipart::new(
                futures::stream::once(async move { Ok::<Bytes, multer::Error>(body) }),
                boundary,
            );
            let mut parts = HashMap::new();
            while let Some(field) = multipart.next_field().await.expect("multipart field") {
                let name = field.name().unwrap_or_default().to_string();
                let filename = field.file_name().map(str::to_string);
                let data = field.bytes().await.expect("multipart data");
                parts.insert(name.clone(), FormPart { name, filename, data });
            }
            parts
        })
    }

    fn is_multipart(&self) -> bool {
        self.header("Content-Type")
            .is_some_and(|ct| ct.starts_with("multipart/form-data"))
    }
}

/// One field of a multipart body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPart {
    pub name: String,
    pub filename: Option<String>,
    pub data: Bytes,
}

/// What the fake server answers
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub delay: Duration,
}

impl Reply {
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            body: Bytes::from(body.into()),
            ..Self::empty(status)
        }
    }

    pub fn json(status: u16, value: Value) -> Self {
        Self::text(status, value.to_string()).with_header("Content-Type", "application/json")
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

pub trait Server: Send + Sync + 'static {
    fn handle(&self, request: &Recorded) -> Reply;
}

impl<F> Server for F
where
    F: Fn(&Recorded) -> Reply + Send + Sync + 'static,
{
    fn handle(&self, request: &Recorded) -> Reply {
        self(request)
    }
}

/// Transport that never leaves the process
pub struct FakeTransport<S> {
    pub server: S,
    log: Mutex<Vec<Recorded>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl<S: Server> FakeTransport<S> {
    pub fn new(server: S) -> Arc<Self> {
        Arc::new(Self {
            server,
            log: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    /// Most requests ever in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: Server> Transport for FakeTransport<S> {
    async fn send(&self, request: HttpRequest) -> UpyunResult<HttpResponse> {
        let body = match request.body {
            RequestBody::Empty => Bytes::new(),
            RequestBody::Bytes(bytes) => bytes,
            RequestBody::Stream { mut stream, .. } => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                buf.freeze()
            }
        };
        let recorded = Recorded {
            method: request.method,
            host: request.host,
            uri: request.uri,
            headers: request.headers,
            body,
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let reply = self.server.handle(&recorded);
        self.log.lock().unwrap().push(recorded);
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let body = reply.body;
        Ok(HttpResponse {
            status: reply.status,
            reason: reason(reply.status).to_string(),
            headers: reply.headers.into_iter().collect(),
            body: Box::pin(futures::stream::iter(vec![Ok(body)])),
        })
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        _ => "Internal Server Error",
    }
}

/// Client for bucket `demo` with both credentials, wired to `transport`
pub fn client_with<S: Server>(transport: &Arc<FakeTransport<S>>, config: UpyunConfig) -> Upyun {
    Upyun::builder(BUCKET)
        .operator(OPERATOR, PASSWORD)
        .form_secret(FORM_SECRET)
        .config(config)
        .transport(transport.clone() as Arc<dyn Transport>)
        .build()
        .unwrap()
}

/// Deterministic test payload
pub fn payload(len: usize) -> Bytes {
    let mut state = 0x2545_f491_u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect::<Vec<u8>>()
        .into()
}

/// Small blocks so multi-block uploads stay fast
pub fn small_block_rules(block: u64) -> MultipartRules {
    MultipartRules::default()
        .with_block_bounds(1, 64 * 1024 * 1024)
        .with_default_block_size(block)
}

const SAVE_TOKEN: &str = "save-token-1";
const TOKEN_SECRET: &str = "token-secret-1";

#[derive(Default)]
struct MultipartState {
    file_hash: String,
    blocks: Vec<Option<Bytes>>,
    attempts: HashMap<u64, usize>,
    assembled: Option<Bytes>,
    initiated: usize,
    finalized: usize,
}

/// Scripted multipart API: initiate, block uploads, finalize
#[derive(Default)]
pub struct MultipartServer {
    state: Mutex<MultipartState>,
    /// Blocks answered with a 500 this many times before being accepted
    failures: Mutex<HashMap<u64, u32>>,
    always_fail: bool,
    /// Block answered with 200 but never marked as received
    ignored_block: Option<u64>,
    extra_status_entries: usize,
    reverse_delays: bool,
    numeric_status: bool,
}

impl MultipartServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_block(self, index: u64, times: u32) -> Self {
        self.failures.lock().unwrap().insert(index, times);
        self
    }

    pub fn always_failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    pub fn ignoring_block(mut self, index: u64) -> Self {
        self.ignored_block = Some(index);
        self
    }

    /// Initiate reply reports more blocks than requested
    pub fn with_extra_status_entries(mut self, extra: usize) -> Self {
        self.extra_status_entries = extra;
        self
    }

    /// Later blocks answer first
    pub fn with_reverse_delays(mut self) -> Self {
        self.reverse_delays = true;
        self
    }

    /// Block status as 0/1 integers instead of booleans
    pub fn with_numeric_status(mut self) -> Self {
        self.numeric_status = true;
        self
    }

    pub fn assembled(&self) -> Option<Bytes> {
        self.state.lock().unwrap().assembled.clone()
    }

    pub fn attempts(&self, index: u64) -> usize {
        self.state
            .lock()
            .unwrap()
            .attempts
            .get(&index)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_block_attempts(&self) -> usize {
        self.state.lock().unwrap().attempts.values().sum()
    }

    pub fn finalized(&self) -> usize {
        self.state.lock().unwrap().finalized
    }

    pub fn initiated(&self) -> usize {
        self.state.lock().unwrap().initiated
    }

    fn status_json(&self, state: &MultipartState) -> Value {
        let flags: Vec<Value> = state
            .blocks
            .iter()
            .map(|b| {
                if self.numeric_status {
                    json!(b.is_some() as u8)
                } else {
                    json!(b.is_some())
                }
            })
            .collect();
        Value::Array(flags)
    }

    fn rejected(message: &str) -> Reply {
        Reply::json(401, json!({ "error_code": 401, "message": message }))
    }

    fn initiate(&self, policy: &Map<String, Value>, signature: &str) -> Reply {
        if policy_signature(policy, FORM_SECRET).unwrap() != signature {
            return Self::rejected("initiate signature mismatch");
        }
        let blocks = policy["file_blocks"].as_u64().unwrap() as usize;
        let mut state = self.state.lock().unwrap();
        state.initiated += 1;
        state.file_hash = policy["file_hash"].as_str().unwrap().to_string();
        state.blocks = vec![None; blocks + self.extra_status_entries];
        let status = self.status_json(&state);
        Reply::json(
            200,
            json!({
                "save_token": SAVE_TOKEN,
                "token_secret": TOKEN_SECRET,
                "status": status,
                "expired_at": policy["expiration"],
            }),
        )
    }

    fn block(&self, request: &Recorded) -> Reply {
        let parts = request.multipart_parts();
        let policy_text = String::from_utf8_lossy(&parts["policy"].data).into_owned();
        let signature = String::from_utf8_lossy(&parts["signature"].data).into_owned();
        let policy = decode_policy(&policy_text).unwrap();
        if policy_signature(&policy, TOKEN_SECRET).unwrap() != signature {
            return Self::rejected("block signature mismatch");
        }
        assert_eq!(policy["save_token"], SAVE_TOKEN);

        let index = policy["block_index"].as_u64().unwrap();
        let data = parts["file"].data.clone();
        if md5_hex(&data) != policy["block_hash"].as_str().unwrap() {
            return Reply::json(400, json!({ "error_code": 400, "message": "block hash mismatch" }));
        }

        let mut state = self.state.lock().unwrap();
        *state.attempts.entry(index).or_default() += 1;
        let blocks = state.blocks.len() as u64;
        let delay = if self.reverse_delays {
            Duration::from_millis((blocks - index) * 10)
        } else {
            Duration::ZERO
        };

        if self.always_fail {
            return Reply::text(500, "busy").with_header("X-Request-Id", format!("req-{index}"));
        }
        if let Some(left) = self.failures.lock().unwrap().get_mut(&index) {
            if *left > 0 {
                *left -= 1;
                return Reply::text(500, "busy").with_header("X-Request-Id", format!("req-{index}"));
            }
        }

        if self.ignored_block == Some(index) {
            let status = self.status_json(&state);
            return Reply::json(200, json!({ "status": status, "save_token": SAVE_TOKEN }))
                .with_header("X-Request-Id", format!("ack-{index}"));
        }

        state.blocks[index as usize] = Some(data);
        let status = self.status_json(&state);
        Reply::json(200, json!({ "status": status, "save_token": SAVE_TOKEN })).with_delay(delay)
    }

    fn finalize(&self, policy: &Map<String, Value>, signature: &str) -> Reply {
        if policy_signature(policy, TOKEN_SECRET).unwrap() != signature {
            return Self::rejected("finalize signature mismatch");
        }
        let mut state = self.state.lock().unwrap();
        state.finalized += 1;
        let mut whole = BytesMut::new();
        for block in &state.blocks {
            match block {
                Some(data) => whole.extend_from_slice(data),
                None => {
                    return Reply::json(400, json!({ "error_code": 400, "message": "missing blocks" }))
                }
            }
        }
        let whole = whole.freeze();
        if md5_hex(&whole) != state.file_hash {
            return Reply::json(400, json!({ "error_code": 400, "message": "file hash mismatch" }));
        }
        let size = whole.len();
        state.assembled = Some(whole);
        Reply::json(
            200,
            json!({
                "path": "/stored",
                "size": size,
                "mimetype": "application/octet-stream",
                "file_hash": state.file_hash,
                "last_modified": 1_500_000_000,
                "signature": "0123456789abcdef0123456789abcdef",
                "bucket_name": BUCKET,
            }),
        )
    }
}

impl Server for MultipartServer {
    fn handle(&self, request: &Recorded) -> Reply {
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.uri, format!("/{BUCKET}/"));

        if request.is_multipart() {
            return self.block(request);
        }
        let fields = request.form_fields();
        let policy = decode_policy(&fields["policy"]).unwrap();
        let signature = &fields["signature"];
        if policy.contains_key("file_blocks") {
            self.initiate(&policy, signature)
        } else {
            self.finalize(&policy, signature)
        }
    }
}

#[derive(Default)]
struct ResumableState {
    initiated: Option<Headers>,
    parts: BTreeMap<u64, Bytes>,
    part_attempts: usize,
    completed: Option<Bytes>,
    cancelled: bool,
}

/// Scripted resumable REST session
#[derive(Default)]
pub struct ResumableServer {
    state: Mutex<ResumableState>,
    fail_part_once: Mutex<Option<u64>>,
    upload_id: Option<String>,
}

impl ResumableServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_part_once(self, part: u64) -> Self {
        *self.fail_part_once.lock().unwrap() = Some(part);
        self
    }

    /// Answer initiate with this id instead of the default one
    pub fn with_upload_id(mut self, id: &str) -> Self {
        self.upload_id = Some(id.to_string());
        self
    }

    pub fn initiate_headers(&self) -> Option<Headers> {
        self.state.lock().unwrap().initiated.clone()
    }

    pub fn stored_parts(&self) -> Vec<u64> {
        self.state.lock().unwrap().parts.keys().copied().collect()
    }

    pub fn part_attempts(&self) -> usize {
        self.state.lock().unwrap().part_attempts
    }

    pub fn completed(&self) -> Option<Bytes> {
        self.state.lock().unwrap().completed.clone()
    }

    pub fn cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }
}

impl Server for ResumableServer {
    fn handle(&self, request: &Recorded) -> Reply {
        assert!(request
            .header("Authorization")
            .is_some_and(|a| a.starts_with("UPYUN operator:")));
        let mut state = self.state.lock().unwrap();
        let uuid_ok = request.header("X-Upyun-Multi-Uuid") == Some(UPLOAD_ID);

        match (request.method, request.header("X-Upyun-Multi-Stage")) {
            (Method::Put, Some("initiate")) => {
                state.initiated = Some(request.headers.clone());
                let id = self.upload_id.clone().unwrap_or_else(|| UPLOAD_ID.to_string());
                Reply::empty(204).with_header("X-Upyun-Multi-Uuid", id)
            }
            (Method::Put, Some("upload")) if uuid_ok => {
                state.part_attempts += 1;
                let part: u64 = request.header("X-Upyun-Part-Id").unwrap().parse().unwrap();
                let mut fail = self.fail_part_once.lock().unwrap();
                if *fail == Some(part) {
                    *fail = None;
                    return Reply::text(500, "part rejected");
                }
                state.parts.insert(part, request.body.clone());
                Reply::empty(204)
            }
            (Method::Put, Some("complete")) if uuid_ok => {
                let whole: Vec<u8> = state.parts.values().flat_map(|p| p.iter().copied()).collect();
                if request.header("X-Upyun-Multi-Md5") != Some(md5_hex(&whole).as_str()) {
                    return Reply::text(400, "md5 mismatch");
                }
                let size = whole.len();
                state.completed = Some(Bytes::from(whole));
                Reply::empty(204)
                    .with_header("X-Upyun-File-Size", size.to_string())
                    .with_header("X-Upyun-Multi-Uuid", UPLOAD_ID)
            }
            (Method::Get, None) if uuid_ok => {
                let parts: Map<String, Value> = state
                    .parts
                    .iter()
                    .map(|(id, data)| {
                        (id.to_string(), json!({ "size": data.len(), "md5": md5_hex(data) }))
                    })
                    .collect();
                Reply::json(200, json!({ "parts": parts }))
            }
            (Method::Delete, None) if uuid_ok => {
                state.cancelled = true;
                state.parts.clear();
                Reply::empty(204)
            }
            _ => Reply::text(404, "no such upload"),
        }
    }
}
