//! Domain models for the offline cache and mutation queue.
//!
//! These models are what the engine persists locally and hands to the UI.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::RejectionKind;

/// Collection holding child profiles.
pub const CHILDREN: &str = "children";
/// Collection holding upcoming vaccination reminders.
pub const REMINDERS: &str = "reminders";

/// A cached snapshot of one key with the time it was fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedEntity<T> {
    /// Cache key (resource collection name).
    pub key: String,
    /// The cached value.
    pub value: T,
    /// When the value was fetched from the server.
    pub fetched_at: DateTime<Utc>,
}

impl<T> CachedEntity<T> {
    /// Create a new cache entry.
    pub fn new(key: impl Into<String>, value: T, fetched_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            value,
            fetched_at,
        }
    }

    /// Age of the entry relative to `now`.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.fetched_at
    }

    /// Stale once strictly older than `threshold`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.age(now) > threshold
    }
}

/// Kind of write a queued mutation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOperation {
    /// Insert a new record.
    Create,
    /// Modify an existing record.
    Update,
    /// Remove a record.
    Delete,
}

impl std::fmt::Display for MutationOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

impl FromStr for MutationOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(format!(
                "Unknown operation: {other}. Use create, update, or delete"
            )),
        }
    }
}

/// Lifecycle of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationStatus {
    /// Waiting to be sent.
    Pending,
    /// Currently submitted to the remote backend.
    InFlight,
    /// Accepted by the server (never persisted; applied entries are removed).
    Applied,
    /// Rejected by the server; kept until the caller acknowledges it.
    Failed,
}

impl std::fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InFlight => write!(f, "in-flight"),
            Self::Applied => write!(f, "applied"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A write made locally that still has to reach the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMutation {
    /// Monotonic id, also used as the idempotency key.
    pub id: u64,
    /// Resource collection the write targets (e.g. "children").
    pub resource_type: String,
    /// Kind of write.
    pub operation: MutationOperation,
    /// Record body sent to the server.
    pub payload: Value,
    /// When the write was made locally.
    pub created_at: DateTime<Utc>,
    /// Number of failed submission attempts.
    #[serde(default)]
    pub attempts: u32,
    /// Current lifecycle status.
    pub status: MutationStatus,
    /// Last error reported by the server.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Rejection class when `status` is `Failed`.
    #[serde(default)]
    pub rejection: Option<RejectionKind>,
    /// Installation that queued the write. Empty for entries queued before
    /// installations were identified.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
}

impl QueuedMutation {
    /// Create a new pending mutation.
    pub fn new(
        id: u64,
        resource_type: impl Into<String>,
        operation: MutationOperation,
        payload: Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            resource_type: resource_type.into(),
            operation,
            payload,
            created_at,
            attempts: 0,
            status: MutationStatus::Pending,
            last_error: None,
            rejection: None,
            client_id: String::new(),
        }
    }

    /// Tag the mutation with the installation that queued it.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Key the remote backend uses to deduplicate resubmissions.
    ///
    /// Queue ids restart when local storage is lost, so the key is scoped
    /// by the installation id.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        if self.client_id.is_empty() {
            self.id.to_string()
        } else {
            format!("{}-{}", self.client_id, self.id)
        }
    }

    /// Record id carried in the payload, if any.
    #[must_use]
    pub fn record_id(&self) -> Option<String> {
        match self.payload.get("id")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Short description for status lines ("create children").
    #[must_use]
    pub fn summary(&self) -> String {
        format!("{} {}", self.operation, self.resource_type)
    }
}

/// Current network connectivity as seen by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityState {
    /// Whether the platform reports a connection.
    pub online: bool,
    /// Time of the last observed transition (or of the initial sample).
    pub last_transition_at: DateTime<Utc>,
}

/// Install prompt availability and dismissal history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallPromptState {
    /// A deferred platform prompt is held for this page load.
    pub available: bool,
    /// When the user last dismissed the in-app banner.
    pub dismissed_at: Option<DateTime<Utc>>,
}

/// Scope sent with every collection fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchScope {
    /// Tenant (clinic) the parent belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Parent account whose records are fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

/// Snapshot of every cached collection, handed to the UI.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CachedData {
    /// Collections keyed by name.
    pub collections: BTreeMap<String, CachedEntity<Vec<Value>>>,
}

impl CachedData {
    /// Records of one collection, empty if never fetched.
    #[must_use]
    pub fn collection(&self, name: &str) -> &[Value] {
        self.collections
            .get(name)
            .map_or(&[], |entry| entry.value.as_slice())
    }

    /// Child profiles.
    #[must_use]
    pub fn children(&self) -> &[Value] {
        self.collection(CHILDREN)
    }

    /// Oldest fetch time across collections.
    #[must_use]
    pub fn oldest_fetch(&self) -> Option<DateTime<Utc>> {
        self.collections.values().map(|e| e.fetched_at).min()
    }

    /// Total number of cached records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.collections.values().map(|e| e.value.len()).sum()
    }
}

/// A vaccination reminder with a parsed due date.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reminder {
    /// Day the vaccination is due.
    pub due_date: NaiveDate,
    /// The reminder record as cached.
    pub record: Value,
}

impl Reminder {
    /// Parse a cached reminder record; `None` if it has no usable due date.
    #[must_use]
    pub fn from_record(record: &Value) -> Option<Self> {
        let raw = record
            .get("due_date")
            .or_else(|| record.get("dueDate"))?
            .as_str()?;

        let due_date = DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc).date_naive())
            .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
            .ok()?;

        Some(Self {
            due_date,
            record: record.clone(),
        })
    }

    /// Display title, falling back to the vaccine name.
    #[must_use]
    pub fn title(&self) -> &str {
        self.record
            .get("title")
            .or_else(|| self.record.get("vaccine_name"))
            .and_then(Value::as_str)
            .unwrap_or("Vaccination")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_staleness_boundary() {
        let fetched = Utc::now();
        let entry = CachedEntity::new(CHILDREN, Vec::<Value>::new(), fetched);
        let threshold = Duration::hours(24);

        assert!(!entry.is_stale(fetched + threshold, threshold));
        assert!(entry.is_stale(
            fetched + threshold + Duration::milliseconds(1),
            threshold
        ));
    }

    #[test]
    fn test_operation_parse() {
        assert_eq!(
            "Create".parse::<MutationOperation>().unwrap(),
            MutationOperation::Create
        );
        assert!("upsert".parse::<MutationOperation>().is_err());
    }

    #[test]
    fn test_status_serializes_kebab_case() {
        let json = serde_json::to_string(&MutationStatus::InFlight).unwrap();
        assert_eq!(json, "\"in-flight\"");
    }

    #[test]
    fn test_record_id() {
        let m = QueuedMutation::new(
            7,
            CHILDREN,
            MutationOperation::Update,
            json!({ "id": "c-1", "name": "Emma" }),
            Utc::now(),
        );
        assert_eq!(m.record_id().as_deref(), Some("c-1"));
        assert_eq!(m.idempotency_key(), "7");
        assert_eq!(m.summary(), "update children");

        let m = m.with_client_id("a1b2");
        assert_eq!(m.idempotency_key(), "a1b2-7");
    }

    #[test]
    fn test_reminder_parses_both_date_forms() {
        let a = Reminder::from_record(&json!({ "due_date": "2026-03-01" })).unwrap();
        let b = Reminder::from_record(&json!({ "dueDate": "2026-03-01T09:30:00Z" })).unwrap();
        assert_eq!(a.due_date, b.due_date);
        assert!(Reminder::from_record(&json!({ "title": "MMR" })).is_none());
    }
}
