//! Replay Engine: fans a matching request out to every configured target,
//! aggregating the per-target outcomes of each matched rule into a single
//! Failure Record when at least one target errored. Grounded on
//! `services/forwarder`'s fan-out-and-journal shape, generalized from one
//! fixed uplink to N configured HTTP targets.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::flow::ParsedMessage;
use crate::message::MessageHead;
use crate::replay::correlation::{extract_json, extract_xpath};
use crate::replay::failure_log::{FailureLog, FailureRecord};
use crate::replay::rule::ReplayRule;

pub struct ReplayEngine {
    rules: Vec<CompiledRule>,
    client: reqwest::Client,
}

struct CompiledRule {
    rule: ReplayRule,
    fail_log: Option<Arc<FailureLog>>,
}

impl ReplayEngine {
    pub fn new(config: &Config) -> Self {
        let rules = config
            .relays
            .iter()
            .cloned()
            .map(|rule| {
                let fail_log = rule.fail_log_file.as_deref().and_then(|path| {
                    match FailureLog::open(std::path::Path::new(path)) {
                        Ok(log) => Some(Arc::new(log)),
                        Err(e) => {
                            warn!(error = %e, path, "could not open failure log, failures will not be recorded");
                            None
                        }
                    }
                });
                CompiledRule { rule, fail_log }
            })
            .collect();

        ReplayEngine {
            rules,
            client: reqwest::Client::new(),
        }
    }

    /// Evaluate every rule against a parsed request, fan out to each
    /// matching rule's targets, and return the number of rules that matched
    /// (spec §4.5). Responses are not themselves replayed. Rules and their
    /// targets are evaluated sequentially within this one request (spec §5);
    /// concurrency across requests comes from independent Flow Workers.
    pub async fn handle(&self, message: &ParsedMessage) -> usize {
        let MessageHead::Request { method, uri, .. } = &message.head else {
            return 0;
        };

        let mut matched = 0;
        for compiled in &self.rules {
            if !compiled.rule.matches(method, uri) {
                continue;
            }
            matched += 1;
            self.replay_rule(compiled, method, uri, message).await;
        }
        matched
    }

    /// Fan out to every target configured on one matched rule, then emit a
    /// single Failure Record covering every target that errored (spec §4.5
    /// steps 2-5; TESTABLE PROPERTY 4).
    async fn replay_rule(&self, compiled: &CompiledRule, method: &str, uri: &str, message: &ParsedMessage) {
        let mut errors = Vec::new();
        for addr in &compiled.rule.addrs {
            if let Some(err) = self.replay_one(addr, method, uri, message).await {
                errors.push(err);
            }
        }

        if errors.is_empty() {
            return;
        }

        let keys = extract_correlation(&compiled.rule, message);
        let record = FailureRecord::now(keys, errors);
        info!(rule_targets = compiled.rule.addrs.len(), errors = record.errors.len(), "replay failures recorded");

        if let Some(log) = &compiled.fail_log {
            if let Err(e) = log.append(&record) {
                warn!(error = %e, "failed to append replay failure record");
            }
        }
    }

    /// Replay to one target. Returns `Some(error string)` on transport error
    /// or non-2xx status (spec §4.5 step 3's `"write <url> fail:<err>"` /
    /// `"write <url> status:<code>"` formats), `None` on success.
    async fn replay_one(&self, addr: &str, method: &str, uri: &str, message: &ParsedMessage) -> Option<String> {
        let target_url = join_url(addr, uri);
        let reqwest_method = match reqwest::Method::from_bytes(method.as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                warn!(method, "unsupported HTTP method, skipping replay");
                return Some(format!("write {target_url} fail:unsupported method {method}"));
            }
        };

        let mut builder = self.client.request(reqwest_method, &target_url);
        if let MessageHead::Request { headers, .. } = &message.head {
            for (name, value) in headers.iter() {
                if name.eq_ignore_ascii_case("Host") || name.eq_ignore_ascii_case("Content-Length") {
                    continue;
                }
                builder = builder.header(name, value);
            }
        }
        if let Some(body) = &message.body.content {
            builder = builder.body(body.clone());
        }

        match builder.send().await {
            Ok(resp) if resp.status().is_success() => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                debug!(target = %target_url, %status, %body, "replay succeeded");
                None
            }
            Ok(resp) => {
                let status = resp.status();
                warn!(target = %target_url, %status, "replay returned non-2xx");
                Some(format!("write {target_url} status:{}", status.as_u16()))
            }
            Err(e) => {
                warn!(target = %target_url, error = %e, "replay request failed");
                Some(format!("write {target_url} fail:{e}"))
            }
        }
    }
}

/// Target addresses are bare `host:port` (spec §6); the scheme is always
/// `http://` (spec §4.5 step 2).
fn join_url(addr: &str, uri: &str) -> String {
    format!("http://{}{}", addr.trim_end_matches('/'), uri)
}

/// Run every configured extractor against the request body. The request's
/// own `Content-Type` picks the extraction language (spec §4.5 step 4):
/// `application/json` runs each extractor's path as a JSON path,
/// `application/xml` runs it as an XPath expression; anything else yields
/// no keys at all. An extractor that doesn't resolve is simply absent from
/// the record.
fn extract_correlation(rule: &ReplayRule, message: &ParsedMessage) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let Some(body) = &message.body.content else {
        return out;
    };
    let text = match std::str::from_utf8(body) {
        Ok(t) => t,
        Err(_) => return out,
    };
    let content_type = message
        .head
        .headers()
        .get("Content-Type")
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();

    if content_type.contains("application/json") {
        let Ok(json_value) = serde_json::from_str::<serde_json::Value>(text) else {
            return out;
        };
        for extractor in &rule.extractors {
            if let Some(value) = extract_json(&json_value, &extractor.path) {
                out.insert(extractor.key.clone(), value);
            }
        }
    } else if content_type.contains("application/xml") {
        for extractor in &rule.extractors {
            if let Some(value) = extract_xpath(text, &extractor.path) {
                out.insert(extractor.key.clone(), value);
            }
        }
    }
    out
}
