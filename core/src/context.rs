//! Per-scan accumulated state read by rules.
//!
//! A context is written by exactly one caller at a time, in arrival order,
//! and handed to rules only as a shared borrow.

use crate::event::{Cookie, EventPayload, EventResult, ScanId, WebResponse};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use url::Url;

/// Request/response pairing for one correlation key. Either side may arrive
/// first; responses accumulate (redirect chains produce several).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestExchange {
    pub url: Option<String>,
    pub request_seen: bool,
    pub responses: Vec<WebResponse>,
}

impl RequestExchange {
    /// Responses recorded before the request itself arrived.
    pub fn orphan_responses(&self) -> &[WebResponse] {
        if self.request_seen {
            &[]
        } else {
            &self.responses
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanContext {
    scan_id: ScanId,
    test: bool,
    page_origin: Option<String>,
    request_urls: BTreeSet<String>,
    scripts: BTreeMap<String, BTreeSet<String>>,
    files: BTreeMap<String, BTreeSet<String>>,
    cookies: BTreeMap<String, Cookie>,
    workers: BTreeSet<String>,
    exchanges: HashMap<String, RequestExchange>,
    recent: VecDeque<EventResult>,
    capacity: usize,
    event_count: u64,
}

impl ScanContext {
    pub fn new(scan_id: ScanId, test: bool, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            scan_id,
            test,
            page_origin: None,
            request_urls: BTreeSet::new(),
            scripts: BTreeMap::new(),
            files: BTreeMap::new(),
            cookies: BTreeMap::new(),
            workers: BTreeSet::new(),
            exchanges: HashMap::new(),
            recent: VecDeque::with_capacity(capacity),
            capacity,
            event_count: 0,
        }
    }

    pub fn scan_id(&self) -> &ScanId {
        &self.scan_id
    }

    pub fn is_test(&self) -> bool {
        self.test
    }

    /// The test flag only ever turns on.
    pub(crate) fn mark_test(&mut self) {
        self.test = true;
    }

    /// Folds one normalized event into the context.
    pub fn record(&mut self, result: &EventResult) {
        match &result.payload {
            EventPayload::Request(request) => {
                self.request_urls.insert(request.url.clone());
                let exchange = self.exchanges.entry(request.correlation_key()).or_default();
                exchange.url = Some(request.url.clone());
                if exchange.request_seen {
                    exchange.responses.extend(request.responses.iter().cloned());
                } else {
                    // The normalized request already carries the orphans.
                    exchange.request_seen = true;
                    exchange.responses = request.responses.clone();
                }
            }
            EventPayload::Response(response) => {
                let exchange = self.exchanges.entry(response.correlation_key()).or_default();
                if exchange.url.is_none() {
                    exchange.url = Some(response.url.clone());
                }
                exchange.responses.push(response.clone());
            }
            EventPayload::ScriptResponse(script) => {
                self.scripts
                    .entry(script.sha256.clone())
                    .or_default()
                    .insert(script.url.clone());
                self.adopt_page(&script.page);
            }
            EventPayload::FileDownload(file) => {
                self.files
                    .entry(file.sha256.clone())
                    .or_default()
                    .insert(file.url.clone());
            }
            EventPayload::Cookie(jar) => {
                for cookie in &jar.cookies {
                    self.cookies.insert(cookie.identity(), cookie.clone());
                }
            }
            EventPayload::WorkerCreated(worker) => {
                self.workers.insert(worker.url.clone());
                self.adopt_page(&worker.page);
            }
            EventPayload::HtmlSnapshot(snapshot) => self.adopt_page(&snapshot.url),
            EventPayload::Active(marker) => {
                if let Some(url) = &marker.url {
                    self.adopt_page(url);
                }
            }
            _ => {}
        }

        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(result.clone());
        self.event_count += 1;
    }

    fn adopt_page(&mut self, page: &str) {
        if self.page_origin.is_none() {
            self.page_origin = origin_of(page);
        }
    }

    pub fn page_origin(&self) -> Option<&str> {
        self.page_origin.as_deref()
    }

    /// True when `url` has a known origin that differs from the page origin.
    /// Unknown page origin means nothing is classified as third-party.
    pub fn is_third_party(&self, url: &str) -> bool {
        match (self.page_origin.as_deref(), origin_of(url)) {
            (Some(page), Some(origin)) => page != origin,
            _ => false,
        }
    }

    pub fn request_urls(&self) -> &BTreeSet<String> {
        &self.request_urls
    }

    pub fn script_digests(&self) -> impl Iterator<Item = &str> {
        self.scripts.keys().map(String::as_str)
    }

    /// URLs a script digest was served from.
    pub fn script_urls(&self, digest: &str) -> Option<&BTreeSet<String>> {
        self.scripts.get(digest)
    }

    pub fn script_count(&self) -> usize {
        self.scripts.len()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn third_party_script_origins(&self) -> BTreeSet<String> {
        self.scripts
            .values()
            .flatten()
            .filter(|url| self.is_third_party(url))
            .filter_map(|url| origin_of(url))
            .collect()
    }

    pub fn cookies(&self) -> impl Iterator<Item = &Cookie> {
        self.cookies.values()
    }

    pub fn cookie_count(&self) -> usize {
        self.cookies.len()
    }

    pub fn workers(&self) -> &BTreeSet<String> {
        &self.workers
    }

    pub fn exchange(&self, key: &str) -> Option<&RequestExchange> {
        self.exchanges.get(key)
    }

    /// Oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &EventResult> {
        self.recent.iter()
    }

    pub fn recent_len(&self) -> usize {
        self.recent.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }
}

/// `scheme://host[:port]`, or `None` for unparseable and opaque origins.
pub fn origin_of(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let origin = url.origin();
    if origin.is_tuple() {
        Some(origin.ascii_serialization())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventLevel, EventMessage, WebRequest, WebScript, WebWorkerCreated};
    use proptest::prelude::*;

    fn result(payload: EventPayload) -> EventResult {
        EventResult::new(ScanId::from("ctx"), EventLevel::Info, false, payload)
    }

    fn script(url: &str, page: &str, sha: &str) -> EventResult {
        result(EventPayload::ScriptResponse(WebScript {
            url: url.to_string(),
            page: page.to_string(),
            server_last_modified: String::new(),
            sha256: sha.to_string(),
            headers: Default::default(),
            redirect: Vec::new(),
            content: None,
            first_seen: true,
        }))
    }

    fn response(url: &str, status: u16) -> WebResponse {
        WebResponse {
            request_id: None,
            url: url.to_string(),
            status,
            headers: Default::default(),
            matched_request: false,
        }
    }

    #[test]
    fn origin_ignores_path_and_keeps_port() {
        assert_eq!(origin_of("https://a.test:8443/x.js").as_deref(), Some("https://a.test:8443"));
        assert_eq!(origin_of("https://a.test/x.js").as_deref(), Some("https://a.test"));
        assert_eq!(origin_of("data:text/javascript,1"), None);
        assert_eq!(origin_of("not a url"), None);
    }

    #[test]
    fn third_party_origins_exclude_page_origin() {
        let mut ctx = ScanContext::new(ScanId::from("ctx"), false, 8);
        ctx.record(&script("https://shop.test/app.js", "https://shop.test/", "d1"));
        ctx.record(&script("https://cdn.one.test/a.js", "https://shop.test/", "d2"));
        ctx.record(&script("https://cdn.two.test/b.js", "https://shop.test/", "d3"));
        ctx.record(&script("https://cdn.two.test/c.js", "https://shop.test/", "d4"));

        assert_eq!(ctx.page_origin(), Some("https://shop.test"));
        let origins = ctx.third_party_script_origins();
        assert_eq!(origins.len(), 2);
        assert!(origins.contains("https://cdn.one.test"));
        assert_eq!(ctx.script_count(), 4);
    }

    #[test]
    fn response_before_request_is_kept_as_orphan() {
        let mut ctx = ScanContext::new(ScanId::from("ctx"), false, 8);
        let early = response("https://a.test/api", 302);
        ctx.record(&result(EventPayload::Response(early.clone())));

        let key = early.correlation_key();
        let exchange = ctx.exchange(&key).expect("exchange for orphan");
        assert!(!exchange.request_seen);
        assert_eq!(exchange.orphan_responses().len(), 1);

        ctx.record(&result(EventPayload::Request(WebRequest {
            request_id: None,
            url: "https://a.test/api".to_string(),
            method: "GET".to_string(),
            headers: Default::default(),
            resource_type: "xhr".to_string(),
            post_data: None,
            responses: vec![early],
        })));
        let exchange = ctx.exchange(&key).expect("exchange after request");
        assert!(exchange.request_seen);
        assert_eq!(exchange.responses.len(), 1);
        assert!(exchange.orphan_responses().is_empty());
        assert!(ctx.request_urls().contains("https://a.test/api"));
    }

    #[test]
    fn workers_and_messages_are_tracked() {
        let mut ctx = ScanContext::new(ScanId::from("ctx"), false, 4);
        ctx.record(&result(EventPayload::WorkerCreated(WebWorkerCreated {
            url: "https://a.test/worker.js".to_string(),
            page: "https://a.test/".to_string(),
        })));
        ctx.record(&result(EventPayload::LogMessage(EventMessage::new("note"))));
        assert_eq!(ctx.workers().len(), 1);
        assert_eq!(ctx.event_count(), 2);
        assert_eq!(ctx.page_origin(), Some("https://a.test"));
    }

    proptest! {
        #[test]
        fn recent_events_never_exceed_capacity(capacity in 1usize..16, events in 0usize..64) {
            let mut ctx = ScanContext::new(ScanId::from("ctx"), false, capacity);
            for i in 0..events {
                ctx.record(&result(EventPayload::LogMessage(EventMessage::new(i.to_string()))));
            }
            prop_assert!(ctx.recent_len() <= capacity);
            prop_assert_eq!(ctx.event_count(), events as u64);
            // FIFO: the newest event is always retained.
            if events > 0 {
                let last = ctx.recent().last().and_then(|r| r.payload.message().map(str::to_string));
                prop_assert_eq!(last, Some((events - 1).to_string()));
                let first = ctx.recent().next().and_then(|r| r.payload.message().map(str::to_string));
                prop_assert_eq!(first, Some(events.saturating_sub(capacity).to_string()));
            }
        }
    }
}
