use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::types::{Defect, DefectLevel};

// ── Webhook payloads ─────────────────────────────────────────────────────

/// Result of dispatching on the webhook payload shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedPayload {
    /// `data.issue`: an issue alert.
    Issue(Defect),
    /// `data.event`: a single event with exception frames.
    Event(Defect),
    /// Neither shape is present. Not an error.
    Unrecognized,
}

impl ParsedPayload {
    pub fn into_defect(self) -> Option<Defect> {
        match self {
            Self::Issue(d) | Self::Event(d) => Some(d),
            Self::Unrecognized => None,
        }
    }
}

/// Total parser for tracker webhook bodies. Events win over issues.
pub fn parse_webhook(payload: &Value) -> ParsedPayload {
    let data = payload.get("data");
    if let Some(event) = data.and_then(|d| d.get("event")).filter(|v| non_empty(v)) {
        return ParsedPayload::Event(defect_from_event(payload, event));
    }
    if let Some(issue) = data.and_then(|d| d.get("issue")).filter(|v| non_empty(v)) {
        return ParsedPayload::Issue(defect_from_issue(issue));
    }
    ParsedPayload::Unrecognized
}

fn non_empty(v: &Value) -> bool {
    match v {
        Value::Object(m) => !m.is_empty(),
        Value::Null => false,
        _ => true,
    }
}

fn str_at<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn string_or(v: &Value, key: &str, default: &str) -> String {
    str_at(v, key).unwrap_or(default).to_string()
}

/// Ids arrive as strings from the API but as numbers in some webhook shapes.
fn id_at(v: &Value, key: &str) -> Option<String> {
    match v.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn timestamp_at(v: &Value, key: &str) -> Option<DateTime<Utc>> {
    str_at(v, key)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn count_at(v: &Value, key: &str) -> u64 {
    match v.get(key) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn metadata_of(v: &Value) -> Map<String, Value> {
    v.get("metadata")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// The issue's project is either a slug string or `{ "slug": .. }`.
fn project_slug(v: &Value) -> Option<String> {
    match v.get("project")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(o) => o.get("slug").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn defect_from_issue(issue: &Value) -> Defect {
    let metadata = metadata_of(issue);
    Defect {
        id: id_at(issue, "id").unwrap_or_default(),
        short_id: string_or(issue, "shortId", ""),
        title: string_or(issue, "title", "Unknown error"),
        culprit: string_or(issue, "culprit", "unknown"),
        level: DefectLevel::from_label(str_at(issue, "level").unwrap_or("error")),
        status: string_or(issue, "status", "unresolved"),
        first_seen: timestamp_at(issue, "firstSeen"),
        last_seen: timestamp_at(issue, "lastSeen"),
        occurrence_count: count_at(issue, "count"),
        permalink: string_or(issue, "permalink", ""),
        message: metadata
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        stacktrace: format_issue_stacktrace(issue),
        platform: string_or(issue, "platform", "unknown"),
        project: project_slug(issue).unwrap_or_else(|| "unknown".into()),
        metadata,
    }
}

fn defect_from_event(payload: &Value, event: &Value) -> Defect {
    let id = id_at(event, "issue_id")
        .or_else(|| id_at(event, "event_id"))
        .unwrap_or_default();
    Defect {
        id,
        short_id: String::new(),
        title: string_or(event, "title", "Unknown error"),
        culprit: string_or(event, "culprit", "unknown"),
        level: DefectLevel::from_label(str_at(event, "level").unwrap_or("error")),
        status: "unresolved".into(),
        first_seen: None,
        last_seen: timestamp_at(event, "datetime"),
        occurrence_count: 1,
        permalink: string_or(payload, "url", ""),
        message: string_or(event, "message", ""),
        stacktrace: format_event_stacktrace(event),
        platform: string_or(event, "platform", "unknown"),
        project: str_at(payload, "project_slug")
            .map(str::to_string)
            .or_else(|| project_slug(event))
            .unwrap_or_else(|| "unknown".into()),
        metadata: metadata_of(event),
    }
}

fn frame_field(frame: &Value, key: &str) -> String {
    match frame.get(key) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "?".into(),
    }
}

/// `Type: value` per exception, then one `File .., line .., in ..` per frame.
pub fn format_event_stacktrace(event: &Value) -> String {
    let mut lines = Vec::new();
    let values = event
        .pointer("/exception/values")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for exc in values {
        lines.push(format!(
            "{}: {}",
            str_at(exc, "type").unwrap_or("Exception"),
            exc.get("value").and_then(Value::as_str).unwrap_or_default()
        ));
        let frames = exc
            .pointer("/stacktrace/frames")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for frame in frames {
            lines.push(format!(
                "  File {}, line {}, in {}",
                frame_field(frame, "filename"),
                frame_field(frame, "lineno"),
                frame_field(frame, "function")
            ));
            if let Some(ctx) = str_at(frame, "context_line") {
                lines.push(format!("    {}", ctx.trim()));
            }
        }
    }

    if lines.is_empty() {
        "No stacktrace available".into()
    } else {
        lines.join("\n")
    }
}

/// Issue payloads carry no frames; render the exception and culprit only.
pub fn format_issue_stacktrace(issue: &Value) -> String {
    let metadata = issue.get("metadata").cloned().unwrap_or(Value::Null);
    let mut out = format!(
        "{}: {}",
        str_at(&metadata, "type").unwrap_or("Error"),
        metadata.get("value").and_then(Value::as_str).unwrap_or_default()
    );
    if let Some(culprit) = str_at(issue, "culprit") {
        out.push_str(&format!("\n  at {culprit}"));
    }
    out
}

// ── API issues ───────────────────────────────────────────────────────────

impl Defect {
    /// Normalize one item of the tracker's `/issues/` listing.
    pub fn from_api_issue(item: &Value) -> Result<Self> {
        if id_at(item, "id").is_none() {
            return Err(anyhow!("issue without id: {}", item));
        }
        Ok(defect_from_issue(item))
    }
}

/// Source of unresolved defects for the poll loop.
#[async_trait]
pub trait IssueSource: Send + Sync {
    async fn fetch_unresolved(&self) -> Result<Vec<Defect>>;
}

/// Client for the Sentry REST API.
pub struct SentryClient {
    base_url: String,
    auth_token: String,
    org: String,
    project: String,
    limit: u32,
    http: reqwest::Client,
}

impl SentryClient {
    pub fn new(base_url: &str, auth_token: &str, org: &str, project: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: auth_token.to_string(),
            org: org.to_string(),
            project: project.to_string(),
            limit: 10,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn issues_url(&self) -> String {
        format!(
            "{}/projects/{}/{}/issues/",
            self.base_url, self.org, self.project
        )
    }
}

#[async_trait]
impl IssueSource for SentryClient {
    async fn fetch_unresolved(&self) -> Result<Vec<Defect>> {
        let limit = self.limit.to_string();
        let resp = self
            .http
            .get(self.issues_url())
            .query(&[("query", "is:unresolved"), ("limit", limit.as_str())])
            .bearer_auth(&self.auth_token)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
            .context("sentry issues request")?
            .error_for_status()?;
        let items: Vec<Value> = resp.json().await.context("parse sentry issues")?;
        debug!(count = items.len(), "fetched unresolved issues");

        Ok(items
            .iter()
            .filter_map(|item| match Defect::from_api_issue(item) {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!("skipping malformed issue: {e}");
                    None
                }
            })
            .collect())
    }
}
