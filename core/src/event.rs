use crate::alert::RuleAlert;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use uuid::Uuid;

/// Opaque scan identifier. Generated ids are UUIDv4 strings, but ids coming
/// from the instrumentation layer are accepted verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(String);

impl ScanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Default for ScanId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ScanId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ScanId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanEventType {
    PageError,
    ConsoleMessage,
    WorkerCreated,
    Cookie,
    Request,
    Response,
    ResponseError,
    FunctionCall,
    ScriptResponse,
    FileDownload,
    LogMessage,
    Screenshot,
    HtmlSnapshot,
    Active,
    Error,
    Failed,
    Complete,
    RuleAlert,
}

impl ScanEventType {
    pub const ALL: [ScanEventType; 18] = [
        ScanEventType::PageError,
        ScanEventType::ConsoleMessage,
        ScanEventType::WorkerCreated,
        ScanEventType::Cookie,
        ScanEventType::Request,
        ScanEventType::Response,
        ScanEventType::ResponseError,
        ScanEventType::FunctionCall,
        ScanEventType::ScriptResponse,
        ScanEventType::FileDownload,
        ScanEventType::LogMessage,
        ScanEventType::Screenshot,
        ScanEventType::HtmlSnapshot,
        ScanEventType::Active,
        ScanEventType::Error,
        ScanEventType::Failed,
        ScanEventType::Complete,
        ScanEventType::RuleAlert,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ScanEventType::PageError => "page-error",
            ScanEventType::ConsoleMessage => "console-message",
            ScanEventType::WorkerCreated => "worker-created",
            ScanEventType::Cookie => "cookie",
            ScanEventType::Request => "request",
            ScanEventType::Response => "response",
            ScanEventType::ResponseError => "response-error",
            ScanEventType::FunctionCall => "function-call",
            ScanEventType::ScriptResponse => "script-response",
            ScanEventType::FileDownload => "file-download",
            ScanEventType::LogMessage => "log-message",
            ScanEventType::Screenshot => "screenshot",
            ScanEventType::HtmlSnapshot => "html-snapshot",
            ScanEventType::Active => "active",
            ScanEventType::Error => "error",
            ScanEventType::Failed => "failed",
            ScanEventType::Complete => "complete",
            ScanEventType::RuleAlert => "rule-alert",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let needle = value.trim();
        Self::ALL.iter().copied().find(|kind| kind.as_str() == needle)
    }

    /// Markers that drive the scan state machine instead of the scan context.
    pub fn is_lifecycle(self) -> bool {
        matches!(
            self,
            ScanEventType::Active
                | ScanEventType::Error
                | ScanEventType::Failed
                | ScanEventType::Complete
        )
    }
}

impl fmt::Display for ScanEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a persisted event. Unrelated to the `prod`/`test` alert level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Error,
    Warning,
}

impl EventLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            EventLevel::Info => "info",
            EventLevel::Error => "error",
            EventLevel::Warning => "warning",
        }
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw event as delivered by the instrumentation layer. The payload stays
/// untyped until the normalizer checks it against `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawScanEvent {
    #[serde(rename = "scanID", alias = "scan_id")]
    pub scan_id: ScanId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<bool>,
    #[serde(default)]
    pub payload: Value,
}

impl RawScanEvent {
    pub fn new(scan_id: ScanId, kind: ScanEventType, payload: Value) -> Self {
        Self {
            scan_id,
            kind: kind.as_str().to_string(),
            test: None,
            payload,
        }
    }

    pub fn with_test(mut self, test: bool) -> Self {
        self.test = Some(test);
        self
    }
}

pub type Headers = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessage {
    pub message: String,
}

impl EventMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebWorkerCreated {
    pub url: String,
    #[serde(default)]
    pub page: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub expires: f64,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub session: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

impl Cookie {
    /// Identity used for deduplication: a browser overwrites a cookie with the
    /// same name, domain and path.
    pub fn identity(&self) -> String {
        format!("{}@{}{}", self.name, self.domain, self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebCookies {
    pub cookies: Vec<Cookie>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub url: String,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    /// Set by the normalizer: whether the owning request had been seen when
    /// this response was recorded.
    #[serde(default)]
    pub matched_request: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_data: Option<String>,
    #[serde(default, alias = "response", deserialize_with = "one_or_many")]
    pub responses: Vec<WebResponse>,
}

impl WebRequest {
    pub fn correlation_key(&self) -> String {
        correlation_key(self.request_id.as_deref(), &self.url)
    }
}

impl WebResponse {
    pub fn correlation_key(&self) -> String {
        correlation_key(self.request_id.as_deref(), &self.url)
    }
}

/// Requests and responses pair on the browser request id when the
/// instrumentation provides one, otherwise on the URL.
pub fn correlation_key(request_id: Option<&str>, url: &str) -> String {
    match request_id.map(str::trim) {
        Some(id) if !id.is_empty() => format!("id:{id}"),
        _ => format!("url:{url}"),
    }
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetElement {
    #[serde(default)]
    pub tag_name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub rel: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub column: u32,
    #[serde(default)]
    pub function_name: String,
    #[serde(default)]
    pub from_eval: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebFunctionCall {
    pub func: String,
    #[serde(default, deserialize_with = "call_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub func_source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetElement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Trace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prop: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebScript {
    pub url: String,
    #[serde(default)]
    pub page: String,
    #[serde(default)]
    pub server_last_modified: String,
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub redirect: Vec<String>,
    /// Script source as captured; dropped once the digest is computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub first_seen: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDownload {
    pub url: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub headers: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub first_seen: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screenshot {
    /// base64 encoded image
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtmlSnapshot {
    pub url: String,
    #[serde(default)]
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LifecycleMarker {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Closed set of normalized payloads. The variant is the `entry`
/// discriminator, so an entry can never disagree with its payload shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", content = "event", rename_all = "kebab-case")]
pub enum EventPayload {
    PageError(EventMessage),
    ConsoleMessage(EventMessage),
    WorkerCreated(WebWorkerCreated),
    Cookie(WebCookies),
    Request(WebRequest),
    Response(WebResponse),
    ResponseError(EventMessage),
    FunctionCall(WebFunctionCall),
    ScriptResponse(WebScript),
    FileDownload(FileDownload),
    LogMessage(EventMessage),
    Screenshot(Screenshot),
    HtmlSnapshot(HtmlSnapshot),
    Active(LifecycleMarker),
    Error(EventMessage),
    Failed(EventMessage),
    Complete(LifecycleMarker),
    RuleAlert(RuleAlert),
}

impl EventPayload {
    pub fn entry(&self) -> ScanEventType {
        match self {
            EventPayload::PageError(_) => ScanEventType::PageError,
            EventPayload::ConsoleMessage(_) => ScanEventType::ConsoleMessage,
            EventPayload::WorkerCreated(_) => ScanEventType::WorkerCreated,
            EventPayload::Cookie(_) => ScanEventType::Cookie,
            EventPayload::Request(_) => ScanEventType::Request,
            EventPayload::Response(_) => ScanEventType::Response,
            EventPayload::ResponseError(_) => ScanEventType::ResponseError,
            EventPayload::FunctionCall(_) => ScanEventType::FunctionCall,
            EventPayload::ScriptResponse(_) => ScanEventType::ScriptResponse,
            EventPayload::FileDownload(_) => ScanEventType::FileDownload,
            EventPayload::LogMessage(_) => ScanEventType::LogMessage,
            EventPayload::Screenshot(_) => ScanEventType::Screenshot,
            EventPayload::HtmlSnapshot(_) => ScanEventType::HtmlSnapshot,
            EventPayload::Active(_) => ScanEventType::Active,
            EventPayload::Error(_) => ScanEventType::Error,
            EventPayload::Failed(_) => ScanEventType::Failed,
            EventPayload::Complete(_) => ScanEventType::Complete,
            EventPayload::RuleAlert(_) => ScanEventType::RuleAlert,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            EventPayload::PageError(msg)
            | EventPayload::ConsoleMessage(msg)
            | EventPayload::ResponseError(msg)
            | EventPayload::LogMessage(msg)
            | EventPayload::Error(msg)
            | EventPayload::Failed(msg) => Some(msg.message.as_str()),
            EventPayload::Active(marker) | EventPayload::Complete(marker) => {
                marker.message.as_deref()
            }
            EventPayload::RuleAlert(alert) => alert.message.as_deref(),
            _ => None,
        }
    }
}

/// Persisted, normalized form of a scan event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventResult {
    pub scan_id: ScanId,
    pub level: EventLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<bool>,
    pub created_at: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl EventResult {
    pub fn new(scan_id: ScanId, level: EventLevel, test: bool, payload: EventPayload) -> Self {
        Self {
            scan_id,
            level,
            test: test.then_some(true),
            created_at: now_rfc3339(),
            payload,
        }
    }

    pub fn log_message(
        scan_id: ScanId,
        test: bool,
        level: EventLevel,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            scan_id,
            level,
            test,
            EventPayload::LogMessage(EventMessage::new(message)),
        )
    }

    /// `error` entry used to surface failures inside the pipeline itself,
    /// e.g. a rule that could not be evaluated.
    pub fn general_error(scan_id: ScanId, test: bool, message: impl Into<String>) -> Self {
        Self::new(
            scan_id,
            EventLevel::Error,
            test,
            EventPayload::Error(EventMessage::new(message)),
        )
    }

    pub fn entry(&self) -> ScanEventType {
        self.payload.entry()
    }

    pub fn is_test(&self) -> bool {
        self.test.unwrap_or(false)
    }
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        Some(OneOrMany::Many(items)) => Ok(items),
        Some(OneOrMany::One(item)) => Ok(vec![item]),
        None => Ok(Vec::new()),
    }
}

// Older instrumentation sends call arguments as one joined string.
fn call_args<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let args = match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(single)) => vec![single],
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(text) => text,
                other => other.to_string(),
            })
            .collect(),
        Some(other) => vec![other.to_string()],
    };
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_type_names_round_trip_through_parse() {
        for kind in ScanEventType::ALL {
            assert_eq!(ScanEventType::parse(kind.as_str()), Some(kind));
            let encoded = serde_json::to_value(kind).expect("serialize kind");
            assert_eq!(encoded, json!(kind.as_str()));
        }
        assert_eq!(ScanEventType::parse("navigation"), None);
    }

    #[test]
    fn entry_is_derived_from_payload_variant() {
        let result = EventResult::new(
            ScanId::from("scan-1"),
            EventLevel::Error,
            false,
            EventPayload::PageError(EventMessage::new("boom")),
        );
        let encoded = serde_json::to_value(&result).expect("serialize result");
        assert_eq!(encoded["entry"], json!("page-error"));
        assert_eq!(encoded["event"]["message"], json!("boom"));
        assert_eq!(encoded["level"], json!("error"));
        assert!(encoded.get("test").is_none());
    }

    #[test]
    fn request_accepts_single_response_or_list() {
        let single: WebRequest = serde_json::from_value(json!({
            "url": "https://a.test/",
            "response": {"url": "https://a.test/", "status": 200}
        }))
        .expect("single response");
        assert_eq!(single.responses.len(), 1);
        assert_eq!(single.method, "GET");

        let many: WebRequest = serde_json::from_value(json!({
            "url": "https://a.test/",
            "responses": [
                {"url": "https://a.test/", "status": 301},
                {"url": "https://a.test/home", "status": 200}
            ]
        }))
        .expect("response list");
        assert_eq!(many.responses.len(), 2);

        let pending: WebRequest =
            serde_json::from_value(json!({"url": "https://a.test/", "response": null}))
                .expect("pending response");
        assert!(pending.responses.is_empty());
    }

    #[test]
    fn function_call_args_normalize_to_sequence() {
        let joined: WebFunctionCall =
            serde_json::from_value(json!({"func": "eval", "args": "1+1"})).expect("string args");
        assert_eq!(joined.args, vec!["1+1".to_string()]);

        let listed: WebFunctionCall =
            serde_json::from_value(json!({"func": "fetch", "args": ["/x", {"method": "POST"}]}))
                .expect("array args");
        assert_eq!(listed.args[0], "/x");
        assert_eq!(listed.args[1], r#"{"method":"POST"}"#);

        let missing: WebFunctionCall =
            serde_json::from_value(json!({"func": "atob"})).expect("no args");
        assert!(missing.args.is_empty());
    }

    #[test]
    fn correlation_prefers_request_id() {
        assert_eq!(correlation_key(Some("42"), "https://a.test/"), "id:42");
        assert_eq!(correlation_key(Some("  "), "https://a.test/"), "url:https://a.test/");
        assert_eq!(correlation_key(None, "https://a.test/"), "url:https://a.test/");
    }

    #[test]
    fn raw_event_reads_wire_field_names() {
        let raw: RawScanEvent = serde_json::from_value(json!({
            "scanID": "abc",
            "type": "console-message",
            "payload": {"message": "hi"}
        }))
        .expect("raw event");
        assert_eq!(raw.scan_id.as_str(), "abc");
        assert_eq!(raw.kind, "console-message");
        assert_eq!(raw.test, None);
    }
}
