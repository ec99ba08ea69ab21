//! Jira webhook payload normalization.
//!
//! Two body shapes are accepted:
//!
//! - the compact form used by scripts and tests:
//!   `{"issue": "ABC-1", "event": "updated"}`, optionally with `"project"`
//! - the full Jira webhook, where `issue` is an object carrying `key` and
//!   `fields.project.key`, and the event name is in `webhookEvent`
//!
//! Both normalize to a [`JiraEvent`], which is what gets queued. The original
//! body travels along in [`JiraEvent::raw`] so evaluators see everything Jira
//! sent.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Value of [`JiraEvent::source`] for every event built here.
pub const JIRA_SOURCE: &str = "Jira";

/// Error type for webhook payload parsing failures.
#[derive(Debug, Error)]
pub enum EventParseError {
    /// Body is not valid JSON, or a field has the wrong type.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// No issue key in either accepted shape.
    #[error("payload has no issue key")]
    MissingIssueKey,

    /// Neither `event` nor `webhookEvent` is present.
    #[error("payload has no event name")]
    MissingEvent,

    /// Project key is empty or contains characters not allowed in a stream key.
    #[error("invalid project key '{0}'")]
    InvalidProjectKey(String),
}

/// A validated Jira event, ready to be appended to its project stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JiraEvent {
    /// Stable identifier: `{project}-{issue}` plus `-{timestamp}` when Jira
    /// supplied one.
    pub work_id: String,
    /// Originating system.
    pub source: String,
    /// Issue key, e.g. `ABC-1`.
    pub issue_key: String,
    /// Project key, e.g. `ABC`. Selects the stream.
    pub project_key: String,
    /// Webhook event name, e.g. `jira:issue_updated`.
    pub event: String,
    /// Jira's `issue_event_type_name`, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_event_type: Option<String>,
    /// Jira's event timestamp in epoch milliseconds, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// The body exactly as decoded.
    pub raw: serde_json::Value,
}

/// A single changed field from the webhook changelog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelogItem {
    pub field: String,
    pub from: Option<String>,
    pub to: Option<String>,
}

// Raw body structure. Everything is optional; required pieces are checked
// explicitly in `JiraEvent::parse`.

#[derive(Debug, Deserialize)]
struct RawBody {
    #[serde(default)]
    issue: Option<RawIssueRef>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default, rename = "webhookEvent")]
    webhook_event: Option<String>,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    issue_event_type_name: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawIssueRef {
    Key(String),
    Object(RawIssue),
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    fields: Option<RawFields>,
}

#[derive(Debug, Deserialize)]
struct RawFields {
    #[serde(default)]
    project: Option<RawProject>,
}

#[derive(Debug, Deserialize)]
struct RawProject {
    #[serde(default)]
    key: Option<String>,
}

impl JiraEvent {
    /// Parses and validates a raw webhook body.
    pub fn parse(body: &[u8]) -> Result<Self, EventParseError> {
        let raw: serde_json::Value = serde_json::from_slice(body)?;
        let parsed: RawBody = serde_json::from_value(raw.clone())?;

        let (issue_key, nested_project) = match parsed.issue {
            Some(RawIssueRef::Key(key)) => (key, None),
            Some(RawIssueRef::Object(issue)) => {
                let project = issue
                    .fields
                    .and_then(|f| f.project)
                    .and_then(|p| p.key);
                (issue.key.unwrap_or_default(), project)
            }
            None => (String::new(), None),
        };
        let issue_key = issue_key.trim().to_string();
        if issue_key.is_empty() {
            return Err(EventParseError::MissingIssueKey);
        }

        let event = parsed
            .event
            .or(parsed.webhook_event)
            .filter(|e| !e.trim().is_empty())
            .ok_or(EventParseError::MissingEvent)?;

        let project_key = parsed
            .project
            .or(nested_project)
            .or_else(|| project_from_issue_key(&issue_key))
            .unwrap_or_default();
        validate_project_key(&project_key)?;

        let work_id = match parsed.timestamp {
            Some(ts) => format!("{}-{}-{}", project_key, issue_key, ts),
            None => format!("{}-{}", project_key, issue_key),
        };

        Ok(Self {
            work_id,
            source: JIRA_SOURCE.to_string(),
            issue_key,
            project_key,
            event,
            issue_event_type: parsed.issue_event_type_name,
            timestamp: parsed.timestamp,
            raw,
        })
    }

    /// Issue summary from a full webhook body.
    pub fn summary(&self) -> Option<&str> {
        self.field_str(&["summary"])
    }

    /// Issue type name (`Bug`, `Story`, ...).
    pub fn issue_type(&self) -> Option<&str> {
        self.field_str(&["issuetype", "name"])
    }

    /// Current workflow status name.
    pub fn status(&self) -> Option<&str> {
        self.field_str(&["status", "name"])
    }

    /// Priority name.
    pub fn priority(&self) -> Option<&str> {
        self.field_str(&["priority", "name"])
    }

    /// Display name of the assignee.
    pub fn assignee(&self) -> Option<&str> {
        self.field_str(&["assignee", "displayName"])
    }

    /// Fields changed by this event, from the webhook changelog.
    pub fn changelog(&self) -> Vec<ChangelogItem> {
        let Some(items) = self.raw.pointer("/changelog/items").and_then(|v| v.as_array()) else {
            return Vec::new();
        };

        items
            .iter()
            .filter_map(|item| {
                let field = item.get("field")?.as_str()?.to_string();
                Some(ChangelogItem {
                    field,
                    from: item.get("fromString").and_then(|v| v.as_str()).map(String::from),
                    to: item.get("toString").and_then(|v| v.as_str()).map(String::from),
                })
            })
            .collect()
    }

    fn field_str(&self, path: &[&str]) -> Option<&str> {
        let mut value = self.raw.get("issue")?.get("fields")?;
        for segment in path {
            value = value.get(*segment)?;
        }
        value.as_str()
    }
}

/// `ABC-123` -> `ABC`. Keys without a `-` have no derivable project.
fn project_from_issue_key(issue_key: &str) -> Option<String> {
    issue_key
        .rsplit_once('-')
        .map(|(project, _)| project.to_string())
}

fn validate_project_key(key: &str) -> Result<(), EventParseError> {
    let valid = !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(EventParseError::InvalidProjectKey(key.to_string()))
    }
}
