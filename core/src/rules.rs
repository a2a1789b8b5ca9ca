use crate::config::RuleSettings;
use crate::context::{origin_of, ScanContext};
use crate::engine::{RepeatPolicy, Rule, RuleDescriptor, RuleMatch, RuleTrigger};
use crate::event::{now_rfc3339, EventPayload, EventResult, ScanEventType};
use crate::store::normalize_digest;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use url::Url;

pub const CATALOG_VERSION: &str = "1";

pub const BLOCKLISTED_SCRIPT: &str = "third-party-script-from-blocklist";
pub const BLOCKED_DOMAIN_REQUEST: &str = "blocked-domain-request";
pub const INSECURE_COOKIE: &str = "insecure-cookie";
pub const WATCHED_FUNCTION_CALL: &str = "watched-function-call";
pub const EXCESSIVE_THIRD_PARTY_ORIGINS: &str = "excessive-third-party-script-origins";

pub const BUILTIN_RULE_NAMES: [&str; 5] = [
    BLOCKLISTED_SCRIPT,
    BLOCKED_DOMAIN_REQUEST,
    INSECURE_COOKIE,
    WATCHED_FUNCTION_CALL,
    EXCESSIVE_THIRD_PARTY_ORIGINS,
];

// Evidence keeps call arguments short; payloads can be whole scripts.
const MAX_ARG_CHARS: usize = 256;
const MAX_ARGS: usize = 8;

pub fn is_builtin_rule(name: &str) -> bool {
    BUILTIN_RULE_NAMES.contains(&name)
}

/// Every built-in rule, configured from `settings`, regardless of whether it
/// is enabled.
pub fn builtin_rules(settings: &RuleSettings) -> Vec<Box<dyn Rule>> {
    let domains: Vec<String> = settings
        .blocked_domains
        .iter()
        .map(|domain| domain.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|domain| !domain.is_empty())
        .collect();

    vec![
        Box::new(BlocklistedScript {
            digests: settings
                .blocked_script_digests
                .iter()
                .map(|digest| normalize_digest(digest))
                .filter(|digest| !digest.is_empty())
                .collect(),
            domains: domains.clone(),
        }),
        Box::new(BlockedDomainRequest { domains }),
        Box::new(InsecureCookie),
        Box::new(WatchedFunctionCall {
            functions: settings.watched_functions.iter().cloned().collect(),
        }),
        Box::new(ExcessiveThirdPartyOrigins {
            threshold: settings.max_third_party_origins,
        }),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCatalog {
    pub version: String,
    pub generated_at: String,
    pub rules: Vec<RuleDescriptor>,
}

impl RuleCatalog {
    pub fn find(&self, name: &str) -> Option<&RuleDescriptor> {
        self.rules.iter().find(|rule| rule.name == name)
    }
}

pub fn builtin_rule_catalog(settings: &RuleSettings) -> RuleCatalog {
    RuleCatalog {
        version: CATALOG_VERSION.to_string(),
        generated_at: now_rfc3339(),
        rules: builtin_rules(settings)
            .iter()
            .map(|rule| {
                RuleDescriptor::describe(
                    rule.as_ref(),
                    settings.level_for(rule.name()),
                    settings.is_enabled(rule.name()),
                )
            })
            .collect(),
    }
}

/// Blocked domain that `url`'s host equals or sits under. Domains are
/// expected lowercase without a leading dot.
pub fn domain_matches<'a>(url: &str, domains: &'a [String]) -> Option<&'a str> {
    let host = Url::parse(url).ok()?.host_str()?.to_ascii_lowercase();
    domains
        .iter()
        .find(|domain| {
            host == domain.as_str()
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
        .map(String::as_str)
}

struct BlocklistedScript {
    digests: BTreeSet<String>,
    domains: Vec<String>,
}

impl Rule for BlocklistedScript {
    fn name(&self) -> &'static str {
        BLOCKLISTED_SCRIPT
    }

    fn description(&self) -> &'static str {
        "A script whose content digest or host is on the blocklist was loaded by the page."
    }

    fn playbook(&self) -> Option<&'static str> {
        Some("Identify which tag or dependency injects the script, remove it, and rotate any credentials entered on the affected page.")
    }

    fn repeat(&self) -> RepeatPolicy {
        RepeatPolicy::PerKey
    }

    fn applies_to(&self, entry: ScanEventType) -> bool {
        entry == ScanEventType::ScriptResponse
    }

    fn evaluate(&self, event: Option<&EventResult>, context: &ScanContext) -> anyhow::Result<Vec<RuleMatch>> {
        let Some(EventPayload::ScriptResponse(script)) = event.map(|e| &e.payload) else {
            return Ok(Vec::new());
        };

        let matched = if self.digests.contains(&script.sha256) {
            json!({"digest": script.sha256})
        } else if let Some(domain) = domain_matches(&script.url, &self.domains) {
            json!({"domain": domain})
        } else {
            return Ok(Vec::new());
        };

        let found = RuleMatch::keyed(
            script.sha256.as_str(),
            format!("blocklisted script loaded from {}", script.url),
        )
        .with("url", script.url.as_str())
        .with("sha256", script.sha256.as_str())
        .with("page", script.page.as_str())
        .with("third_party", context.is_third_party(&script.url))
        .with("matched", matched)
        .with("redirect", script.redirect.clone());
        Ok(vec![found])
    }
}

struct BlockedDomainRequest {
    domains: Vec<String>,
}

impl Rule for BlockedDomainRequest {
    fn name(&self) -> &'static str {
        BLOCKED_DOMAIN_REQUEST
    }

    fn description(&self) -> &'static str {
        "The page issued a request to a blocked domain."
    }

    fn playbook(&self) -> Option<&'static str> {
        Some("Check the request body for form or payment data and trace the initiating script.")
    }

    fn repeat(&self) -> RepeatPolicy {
        RepeatPolicy::PerKey
    }

    fn applies_to(&self, entry: ScanEventType) -> bool {
        entry == ScanEventType::Request
    }

    fn evaluate(&self, event: Option<&EventResult>, context: &ScanContext) -> anyhow::Result<Vec<RuleMatch>> {
        let Some(EventPayload::Request(request)) = event.map(|e| &e.payload) else {
            return Ok(Vec::new());
        };
        let Some(domain) = domain_matches(&request.url, &self.domains) else {
            return Ok(Vec::new());
        };

        let statuses: Vec<u16> = request.responses.iter().map(|r| r.status).collect();
        let post_length = request.post_data.as_deref().map(str::len).unwrap_or(0);
        let found = RuleMatch::keyed(
            request.url.as_str(),
            format!("{} request to blocked domain {domain}", request.method),
        )
        .with("url", request.url.as_str())
        .with("domain", domain)
        .with("method", request.method.as_str())
        .with("resource_type", request.resource_type.as_str())
        .with("post_data", request.post_data.is_some())
        .with("post_data_length", post_length)
        .with("statuses", statuses)
        .with("third_party", context.is_third_party(&request.url));
        Ok(vec![found])
    }
}

struct InsecureCookie;

impl Rule for InsecureCookie {
    fn name(&self) -> &'static str {
        INSECURE_COOKIE
    }

    fn description(&self) -> &'static str {
        "A cookie was set without the Secure flag."
    }

    fn playbook(&self) -> Option<&'static str> {
        Some("Set the Secure attribute on the cookie, and HttpOnly when scripts do not need it.")
    }

    fn repeat(&self) -> RepeatPolicy {
        RepeatPolicy::PerKey
    }

    fn applies_to(&self, entry: ScanEventType) -> bool {
        entry == ScanEventType::Cookie
    }

    fn evaluate(&self, event: Option<&EventResult>, _context: &ScanContext) -> anyhow::Result<Vec<RuleMatch>> {
        let Some(EventPayload::Cookie(jar)) = event.map(|e| &e.payload) else {
            return Ok(Vec::new());
        };
        let found = jar
            .cookies
            .iter()
            .filter(|cookie| !cookie.secure)
            .map(|cookie| {
                RuleMatch::keyed(
                    cookie.identity(),
                    format!("cookie '{}' set without Secure flag", cookie.name),
                )
                .with("name", cookie.name.as_str())
                .with("domain", cookie.domain.as_str())
                .with("path", cookie.path.as_str())
                .with("http_only", cookie.http_only)
                .with("session", cookie.session)
                .with("same_site", cookie.same_site.clone().map_or(Value::Null, Value::from))
            })
            .collect();
        Ok(found)
    }
}

struct WatchedFunctionCall {
    functions: BTreeSet<String>,
}

impl WatchedFunctionCall {
    // `window.eval` counts as `eval`.
    fn watched(&self, func: &str) -> bool {
        self.functions.contains(func)
            || func
                .rsplit_once('.')
                .is_some_and(|(_, last)| self.functions.contains(last))
    }
}

impl Rule for WatchedFunctionCall {
    fn name(&self) -> &'static str {
        WATCHED_FUNCTION_CALL
    }

    fn description(&self) -> &'static str {
        "A third-party script called a function commonly used for code injection or obfuscation."
    }

    fn repeat(&self) -> RepeatPolicy {
        RepeatPolicy::PerKey
    }

    fn applies_to(&self, entry: ScanEventType) -> bool {
        entry == ScanEventType::FunctionCall
    }

    fn evaluate(&self, event: Option<&EventResult>, context: &ScanContext) -> anyhow::Result<Vec<RuleMatch>> {
        let Some(EventPayload::FunctionCall(call)) = event.map(|e| &e.payload) else {
            return Ok(Vec::new());
        };
        if !self.watched(&call.func) {
            return Ok(Vec::new());
        }
        let Some(trace) = call.trace.as_ref() else {
            return Ok(Vec::new());
        };
        if !context.is_third_party(&trace.script) {
            return Ok(Vec::new());
        }

        let args: Vec<String> = call
            .args
            .iter()
            .take(MAX_ARGS)
            .map(|arg| arg.chars().take(MAX_ARG_CHARS).collect())
            .collect();
        let found = RuleMatch::keyed(
            format!("{}|{}", call.func, trace.script),
            format!("{} called from third-party script {}", call.func, trace.script),
        )
        .with("func", call.func.as_str())
        .with("script", trace.script.as_str())
        .with("origin", origin_of(&trace.script).map_or(Value::Null, Value::from))
        .with("line", trace.line)
        .with("column", trace.column)
        .with("from_eval", trace.from_eval)
        .with("args", args);
        Ok(vec![found])
    }
}

struct ExcessiveThirdPartyOrigins {
    threshold: usize,
}

impl Rule for ExcessiveThirdPartyOrigins {
    fn name(&self) -> &'static str {
        EXCESSIVE_THIRD_PARTY_ORIGINS
    }

    fn description(&self) -> &'static str {
        "The page loaded scripts from more distinct third-party origins than allowed."
    }

    fn trigger(&self) -> RuleTrigger {
        RuleTrigger::Terminal
    }

    fn repeat(&self) -> RepeatPolicy {
        RepeatPolicy::Once
    }

    fn evaluate(&self, _event: Option<&EventResult>, context: &ScanContext) -> anyhow::Result<Vec<RuleMatch>> {
        let origins = context.third_party_script_origins();
        if origins.len() <= self.threshold {
            return Ok(Vec::new());
        }
        let found = RuleMatch::new(format!(
            "{} third-party script origins exceed the limit of {}",
            origins.len(),
            self.threshold
        ))
        .with("count", origins.len())
        .with("threshold", self.threshold)
        .with("page_origin", context.page_origin().map_or(Value::Null, Value::from))
        .with("origins", origins.into_iter().collect::<Vec<_>>());
        Ok(vec![found])
    }
}
