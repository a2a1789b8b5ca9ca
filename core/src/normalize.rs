use crate::alert::RuleAlert;
use crate::artifact::{ArtifactKind, ArtifactMetadata};
use crate::config::{ConfigError, PipelineConfig};
use crate::context::ScanContext;
use crate::event::{
    Cookie, EventLevel, EventMessage, EventPayload, EventResult, FileDownload, HtmlSnapshot,
    LifecycleMarker, RawScanEvent, ScanEventType, Screenshot, WebCookies, WebFunctionCall,
    WebRequest, WebResponse, WebScript, WebWorkerCreated,
};
use crate::lifecycle::ScanState;
use crate::store::{normalize_digest, sha256_hex, ContentStore};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaViolation {
    #[error("unrecognized event type '{0}'")]
    UnknownEventType(String),
    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload { kind: ScanEventType, reason: String },
    #[error("{kind} payload has an empty '{field}' field")]
    EmptyField {
        kind: ScanEventType,
        field: &'static str,
    },
    #[error("{kind} payload carries neither content nor a sha256 digest")]
    MissingDigest { kind: ScanEventType },
    #[error("fired rule-alert '{name}' carries no evidence")]
    MissingEvidence { name: String },
}

/// State change requested by a lifecycle marker event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleSignal {
    pub target: ScanState,
    pub reason: Option<String>,
}

impl LifecycleSignal {
    fn new(target: ScanState, reason: Option<String>) -> Self {
        Self { target, reason }
    }
}

#[derive(Debug, Clone)]
pub struct Normalized {
    /// Exactly one result per raw event: the normalized event, or a
    /// `log-message` describing why it was dropped.
    pub result: EventResult,
    pub lifecycle: Option<LifecycleSignal>,
    pub violation: Option<SchemaViolation>,
}

pub struct Normalizer {
    console_error_patterns: Vec<Regex>,
    store: Arc<ContentStore>,
}

struct Converted {
    level: EventLevel,
    payload: EventPayload,
    lifecycle: Option<LifecycleSignal>,
}

impl Converted {
    fn plain(level: EventLevel, payload: EventPayload) -> Self {
        Self {
            level,
            payload,
            lifecycle: None,
        }
    }
}

impl Normalizer {
    pub fn new(config: &PipelineConfig, store: Arc<ContentStore>) -> Result<Self, ConfigError> {
        Ok(Self {
            console_error_patterns: config.compile_console_patterns()?,
            store,
        })
    }

    /// Never fails: schema violations are logged and turned into a
    /// `log-message` result so the scan keeps going.
    pub fn normalize(&self, raw: &RawScanEvent, test: bool, context: &ScanContext) -> Normalized {
        match self.convert(raw, context) {
            Ok(converted) => Normalized {
                result: EventResult::new(
                    raw.scan_id.clone(),
                    converted.level,
                    test,
                    converted.payload,
                ),
                lifecycle: converted.lifecycle,
                violation: None,
            },
            Err(violation) => {
                warn!(scan_id = %raw.scan_id, entry = %raw.kind, error = %violation, "dropping malformed scan event");
                let message = format!("dropped '{}' event: {violation}", raw.kind);
                Normalized {
                    result: EventResult::log_message(
                        raw.scan_id.clone(),
                        test,
                        EventLevel::Warning,
                        message,
                    ),
                    lifecycle: None,
                    violation: Some(violation),
                }
            }
        }
    }

    fn convert(&self, raw: &RawScanEvent, context: &ScanContext) -> Result<Converted, SchemaViolation> {
        let kind = ScanEventType::parse(&raw.kind)
            .ok_or_else(|| SchemaViolation::UnknownEventType(raw.kind.clone()))?;
        let payload = &raw.payload;

        let converted = match kind {
            ScanEventType::PageError => Converted::plain(
                EventLevel::Error,
                EventPayload::PageError(message_payload(kind, payload)?),
            ),
            ScanEventType::ResponseError => Converted::plain(
                EventLevel::Error,
                EventPayload::ResponseError(message_payload(kind, payload)?),
            ),
            ScanEventType::ConsoleMessage => {
                let message = message_payload(kind, payload)?;
                let level = if self.looks_like_error(&message.message) {
                    EventLevel::Error
                } else {
                    EventLevel::Warning
                };
                Converted::plain(level, EventPayload::ConsoleMessage(message))
            }
            ScanEventType::LogMessage => Converted::plain(
                EventLevel::Info,
                EventPayload::LogMessage(message_payload(kind, payload)?),
            ),
            ScanEventType::WorkerCreated => {
                let worker: WebWorkerCreated = decode(kind, payload)?;
                require(kind, "url", &worker.url)?;
                Converted::plain(EventLevel::Info, EventPayload::WorkerCreated(worker))
            }
            ScanEventType::Cookie => Converted::plain(
                EventLevel::Info,
                EventPayload::Cookie(cookie_payload(kind, payload)?),
            ),
            ScanEventType::Request => {
                let request = self.request(kind, payload, context)?;
                Converted::plain(EventLevel::Info, EventPayload::Request(request))
            }
            ScanEventType::Response => {
                let mut response: WebResponse = decode(kind, payload)?;
                require(kind, "url", &response.url)?;
                response.matched_request = context
                    .exchange(&response.correlation_key())
                    .map(|exchange| exchange.request_seen)
                    .unwrap_or(false);
                if !response.matched_request {
                    debug!(scan_id = %raw.scan_id, url = %response.url, "response arrived before its request");
                }
                let level = if response.status >= 400 {
                    EventLevel::Warning
                } else {
                    EventLevel::Info
                };
                Converted::plain(level, EventPayload::Response(response))
            }
            ScanEventType::FunctionCall => {
                let call: WebFunctionCall = decode(kind, payload)?;
                require(kind, "func", &call.func)?;
                Converted::plain(EventLevel::Info, EventPayload::FunctionCall(call))
            }
            ScanEventType::ScriptResponse => {
                let script = self.script(raw, kind)?;
                Converted::plain(EventLevel::Info, EventPayload::ScriptResponse(script))
            }
            ScanEventType::FileDownload => {
                let file = self.file(raw, kind)?;
                Converted::plain(EventLevel::Info, EventPayload::FileDownload(file))
            }
            ScanEventType::Screenshot => {
                let shot = match payload {
                    Value::String(data) => Screenshot {
                        payload: data.clone(),
                    },
                    other => decode(kind, other)?,
                };
                Converted::plain(EventLevel::Info, EventPayload::Screenshot(shot))
            }
            ScanEventType::HtmlSnapshot => {
                let snapshot: HtmlSnapshot = decode(kind, payload)?;
                require(kind, "url", &snapshot.url)?;
                Converted::plain(EventLevel::Info, EventPayload::HtmlSnapshot(snapshot))
            }
            ScanEventType::Active => {
                let marker = marker_payload(kind, payload)?;
                Converted {
                    level: EventLevel::Info,
                    payload: EventPayload::Active(marker),
                    lifecycle: Some(LifecycleSignal::new(ScanState::Active, None)),
                }
            }
            ScanEventType::Complete => {
                let marker = marker_payload(kind, payload)?;
                let reason = marker.message.clone();
                Converted {
                    level: EventLevel::Info,
                    payload: EventPayload::Complete(marker),
                    lifecycle: Some(LifecycleSignal::new(ScanState::Complete, reason)),
                }
            }
            ScanEventType::Error => {
                let message = message_payload(kind, payload)?;
                let reason = Some(message.message.clone());
                Converted {
                    level: EventLevel::Error,
                    payload: EventPayload::Error(message),
                    lifecycle: Some(LifecycleSignal::new(ScanState::Error, reason)),
                }
            }
            ScanEventType::Failed => {
                let message = match payload {
                    Value::Null => EventMessage::new("scan failed"),
                    Value::Object(fields) if !fields.contains_key("message") => {
                        EventMessage::new("scan failed")
                    }
                    other => message_payload(kind, other)?,
                };
                let reason = Some(message.message.clone());
                Converted {
                    level: EventLevel::Error,
                    payload: EventPayload::Failed(message),
                    lifecycle: Some(LifecycleSignal::new(ScanState::Failed, reason)),
                }
            }
            ScanEventType::RuleAlert => {
                let alert: RuleAlert = decode(kind, payload)?;
                require(kind, "name", &alert.name)?;
                if alert.alert && !alert.has_evidence() {
                    return Err(SchemaViolation::MissingEvidence { name: alert.name });
                }
                Converted::plain(alert.severity(), EventPayload::RuleAlert(alert))
            }
        };

        Ok(converted)
    }

    fn looks_like_error(&self, message: &str) -> bool {
        self.console_error_patterns
            .iter()
            .any(|pattern| pattern.is_match(message))
    }

    fn request(
        &self,
        kind: ScanEventType,
        payload: &Value,
        context: &ScanContext,
    ) -> Result<WebRequest, SchemaViolation> {
        let mut request: WebRequest = decode(kind, payload)?;
        require(kind, "url", &request.url)?;

        // Responses that beat their request here are folded in ahead of any
        // the request itself carries.
        let mut responses: Vec<WebResponse> = context
            .exchange(&request.correlation_key())
            .map(|exchange| exchange.orphan_responses().to_vec())
            .unwrap_or_default();
        responses.append(&mut request.responses);
        for response in &mut responses {
            response.matched_request = true;
        }
        request.responses = responses;
        Ok(request)
    }

    fn script(&self, raw: &RawScanEvent, kind: ScanEventType) -> Result<WebScript, SchemaViolation> {
        let mut script: WebScript = decode(kind, &raw.payload)?;
        require(kind, "url", &script.url)?;
        let content = script.content.take();
        let digest = resolve_digest(kind, content.as_deref(), &script.sha256, &script.url)?;

        let headers = serde_json::to_value(&script.headers).unwrap_or(Value::Null);
        let metadata = ArtifactMetadata::new(raw.scan_id.clone(), ArtifactKind::Script, &script.url)
            .with_headers(headers);
        let outcome = self
            .store
            .put_if_absent(&digest, content.as_deref().map(str::as_bytes), metadata);

        script.sha256 = digest;
        script.first_seen = outcome.is_new;
        Ok(script)
    }

    fn file(&self, raw: &RawScanEvent, kind: ScanEventType) -> Result<FileDownload, SchemaViolation> {
        let mut file: FileDownload = decode(kind, &raw.payload)?;
        require(kind, "url", &file.url)?;
        let content = file.content.take();
        let digest = resolve_digest(kind, content.as_deref(), &file.sha256, &file.url)?;

        let metadata = ArtifactMetadata::new(raw.scan_id.clone(), ArtifactKind::File, &file.url)
            .with_filename(file.filename.clone())
            .with_headers(file.headers.clone());
        let filename = metadata.filename.clone();
        let outcome = self
            .store
            .put_if_absent(&digest, content.as_deref().map(str::as_bytes), metadata);

        file.sha256 = digest;
        file.filename = filename;
        file.first_seen = outcome.is_new;
        Ok(file)
    }
}

fn decode<T: DeserializeOwned>(kind: ScanEventType, payload: &Value) -> Result<T, SchemaViolation> {
    T::deserialize(payload).map_err(|err| SchemaViolation::MalformedPayload {
        kind,
        reason: err.to_string(),
    })
}

fn require(kind: ScanEventType, field: &'static str, value: &str) -> Result<(), SchemaViolation> {
    if value.trim().is_empty() {
        Err(SchemaViolation::EmptyField { kind, field })
    } else {
        Ok(())
    }
}

/// Message-shaped kinds accept a bare string or `{"message": ...}`.
fn message_payload(kind: ScanEventType, payload: &Value) -> Result<EventMessage, SchemaViolation> {
    match payload {
        Value::String(message) => Ok(EventMessage::new(message.clone())),
        Value::Object(_) => decode(kind, payload),
        _ => Err(SchemaViolation::MalformedPayload {
            kind,
            reason: "expected a message string or an object with a 'message' field".to_string(),
        }),
    }
}

fn marker_payload(kind: ScanEventType, payload: &Value) -> Result<LifecycleMarker, SchemaViolation> {
    match payload {
        Value::Null => Ok(LifecycleMarker::default()),
        Value::String(message) => Ok(LifecycleMarker {
            url: None,
            message: Some(message.clone()),
        }),
        other => decode(kind, other),
    }
}

fn cookie_payload(kind: ScanEventType, payload: &Value) -> Result<WebCookies, SchemaViolation> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum CookieShape {
        Jar(WebCookies),
        List(Vec<Cookie>),
        Single(Cookie),
    }

    let cookies = match decode::<CookieShape>(kind, payload)? {
        CookieShape::Jar(jar) => jar.cookies,
        CookieShape::List(cookies) => cookies,
        CookieShape::Single(cookie) => vec![cookie],
    };
    if cookies.iter().any(|cookie| cookie.name.trim().is_empty()) {
        return Err(SchemaViolation::EmptyField {
            kind,
            field: "name",
        });
    }
    Ok(WebCookies { cookies })
}

/// Content, when present, is authoritative; a supplied digest is only used
/// when no content was captured.
fn resolve_digest(
    kind: ScanEventType,
    content: Option<&str>,
    supplied: &str,
    url: &str,
) -> Result<String, SchemaViolation> {
    let supplied = normalize_digest(supplied);
    match content {
        Some(content) => {
            let computed = sha256_hex(content.as_bytes());
            if !supplied.is_empty() && supplied != computed {
                warn!(url = %url, supplied = %supplied, computed = %computed, "supplied sha256 does not match captured content");
            }
            Ok(computed)
        }
        None if !supplied.is_empty() => Ok(supplied),
        None => Err(SchemaViolation::MissingDigest { kind }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ScanId;
    use serde_json::json;

    fn normalizer() -> (Normalizer, Arc<ContentStore>) {
        let store = Arc::new(ContentStore::new());
        let normalizer =
            Normalizer::new(&PipelineConfig::default(), Arc::clone(&store)).expect("normalizer");
        (normalizer, store)
    }

    fn raw(kind: &str, payload: Value) -> RawScanEvent {
        RawScanEvent {
            scan_id: ScanId::from("scan-n"),
            kind: kind.to_string(),
            test: None,
            payload,
        }
    }

    fn context() -> ScanContext {
        ScanContext::new(ScanId::from("scan-n"), false, 16)
    }

    #[test]
    fn every_valid_kind_yields_matching_entry() {
        let (normalizer, _) = normalizer();
        let ctx = context();
        let cases = vec![
            ("page-error", json!({"message": "x"})),
            ("console-message", json!("hello")),
            ("worker-created", json!({"url": "https://a.test/w.js", "page": "https://a.test/"})),
            ("cookie", json!({"cookies": [{"name": "sid", "secure": true}]})),
            ("request", json!({"url": "https://a.test/", "method": "GET"})),
            ("response", json!({"url": "https://a.test/", "status": 200})),
            ("response-error", json!("net::ERR_FAILED")),
            ("function-call", json!({"func": "eval", "args": "1"})),
            ("script-response", json!({"url": "https://a.test/x.js", "sha256": "abc123"})),
            ("file-download", json!({"url": "https://a.test/f.zip", "content": "PK"})),
            ("log-message", json!({"message": "note"})),
            ("screenshot", json!("iVBORw0KGgo=")),
            ("html-snapshot", json!({"url": "https://a.test/", "html": "<html></html>"})),
            ("active", Value::Null),
            ("error", json!("navigation timeout")),
            ("failed", Value::Null),
            ("complete", json!({})),
            ("rule-alert", json!({"alert": true, "name": "upstream", "level": "prod", "context": {"k": 1}})),
        ];
        assert_eq!(cases.len(), ScanEventType::ALL.len());

        for (kind, payload) in cases {
            let normalized = normalizer.normalize(&raw(kind, payload), false, &ctx);
            assert!(normalized.violation.is_none(), "{kind}: {:?}", normalized.violation);
            assert_eq!(normalized.result.entry().as_str(), kind);
        }
    }

    #[test]
    fn console_errors_are_detected_by_pattern() {
        let (normalizer, _) = normalizer();
        let ctx = context();
        let plain = normalizer.normalize(&raw("console-message", json!("loaded widget")), false, &ctx);
        let failing = normalizer.normalize(
            &raw("console-message", json!({"message": "Uncaught ReferenceError: $ is not defined"})),
            false,
            &ctx,
        );
        assert_eq!(plain.result.level, EventLevel::Warning);
        assert_eq!(failing.result.level, EventLevel::Error);
    }

    #[test]
    fn malformed_payload_becomes_log_message() {
        let (normalizer, _) = normalizer();
        let ctx = context();
        let normalized = normalizer.normalize(&raw("request", json!({"method": "GET"})), true, &ctx);
        assert_eq!(normalized.result.entry(), ScanEventType::LogMessage);
        assert!(normalized.result.is_test());
        assert!(matches!(
            normalized.violation,
            Some(SchemaViolation::MalformedPayload { kind: ScanEventType::Request, .. })
        ));

        let unknown = normalizer.normalize(&raw("navigation", json!({})), false, &ctx);
        assert_eq!(
            unknown.violation,
            Some(SchemaViolation::UnknownEventType("navigation".to_string()))
        );
        let message = unknown.result.payload.message().unwrap_or_default();
        assert!(message.contains("navigation"));
    }

    #[test]
    fn script_content_is_hashed_and_deduplicated() {
        let (normalizer, store) = normalizer();
        let ctx = context();
        let body = "window.x = 1;";
        let first = normalizer.normalize(
            &raw("script-response", json!({"url": "https://a.test/x.js", "content": body})),
            false,
            &ctx,
        );
        let second = normalizer.normalize(
            &raw("script-response", json!({"url": "https://mirror.test/x.js", "content": body, "sha256": "bogus"})),
            false,
            &ctx,
        );

        let digest = sha256_hex(body.as_bytes());
        match (&first.result.payload, &second.result.payload) {
            (EventPayload::ScriptResponse(a), EventPayload::ScriptResponse(b)) => {
                assert_eq!(a.sha256, digest);
                assert_eq!(b.sha256, digest);
                assert!(a.first_seen);
                assert!(!b.first_seen);
                assert!(a.content.is_none());
            }
            other => panic!("unexpected payloads {other:?}"),
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn script_without_digest_or_content_is_rejected() {
        let (normalizer, _) = normalizer();
        let normalized = normalizer.normalize(
            &raw("script-response", json!({"url": "https://a.test/x.js"})),
            false,
            &context(),
        );
        assert_eq!(
            normalized.violation,
            Some(SchemaViolation::MissingDigest {
                kind: ScanEventType::ScriptResponse
            })
        );
    }

    #[test]
    fn request_picks_up_orphan_responses() {
        let (normalizer, _) = normalizer();
        let mut ctx = context();

        let response = normalizer.normalize(
            &raw("response", json!({"url": "https://a.test/api", "status": 503, "requestId": "7"})),
            false,
            &ctx,
        );
        assert_eq!(response.result.level, EventLevel::Warning);
        match &response.result.payload {
            EventPayload::Response(r) => assert!(!r.matched_request),
            other => panic!("unexpected payload {other:?}"),
        }
        ctx.record(&response.result);

        let request = normalizer.normalize(
            &raw("request", json!({"url": "https://a.test/api", "requestId": "7", "method": "POST"})),
            false,
            &ctx,
        );
        match &request.result.payload {
            EventPayload::Request(r) => {
                assert_eq!(r.responses.len(), 1);
                assert_eq!(r.responses[0].status, 503);
                assert!(r.responses[0].matched_request);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        ctx.record(&request.result);

        let late = normalizer.normalize(
            &raw("response", json!({"url": "https://a.test/api", "status": 200, "requestId": "7"})),
            false,
            &ctx,
        );
        match &late.result.payload {
            EventPayload::Response(r) => assert!(r.matched_request),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn lifecycle_markers_carry_signals() {
        let (normalizer, _) = normalizer();
        let ctx = context();
        let failed = normalizer.normalize(&raw("failed", json!({"message": "browser crashed"})), false, &ctx);
        assert_eq!(
            failed.lifecycle,
            Some(LifecycleSignal::new(
                ScanState::Failed,
                Some("browser crashed".to_string())
            ))
        );
        let log = normalizer.normalize(&raw("log-message", json!("x")), false, &ctx);
        assert!(log.lifecycle.is_none());
    }

    #[test]
    fn failed_marker_without_message_uses_default_reason() {
        let (normalizer, _) = normalizer();
        let ctx = context();
        for payload in [Value::Null, json!({}), json!({"url": "https://a.test/"})] {
            let failed = normalizer.normalize(&raw("failed", payload.clone()), false, &ctx);
            assert!(failed.violation.is_none(), "{payload}: {:?}", failed.violation);
            assert_eq!(failed.result.entry(), ScanEventType::Failed);
            assert_eq!(
                failed.lifecycle,
                Some(LifecycleSignal::new(ScanState::Failed, Some("scan failed".to_string())))
            );
        }
    }

    #[test]
    fn fired_rule_alert_requires_evidence() {
        let (normalizer, _) = normalizer();
        let ctx = context();
        let bare = normalizer.normalize(
            &raw("rule-alert", json!({"alert": true, "name": "upstream", "level": "prod", "context": {}})),
            false,
            &ctx,
        );
        assert_eq!(
            bare.violation,
            Some(SchemaViolation::MissingEvidence {
                name: "upstream".to_string()
            })
        );
        assert_eq!(bare.result.entry(), ScanEventType::LogMessage);
        assert_eq!(bare.result.level, EventLevel::Warning);

        let quiet = normalizer.normalize(
            &raw("rule-alert", json!({"alert": false, "name": "upstream", "level": "prod"})),
            false,
            &ctx,
        );
        assert!(quiet.violation.is_none());
        assert_eq!(quiet.result.entry(), ScanEventType::RuleAlert);
    }
}
