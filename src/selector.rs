//! Queue selectors: which jobs a worker is allowed to claim.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::job::Job;

/// What a worker is bound to.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueSelector {
    /// Every queue.
    All,
    /// One named queue.
    Queue(String),
    /// Any of a set of named queues.
    Queues(Vec<String>),
    /// Caller-supplied filter.
    Filter(JobFilter),
}

impl QueueSelector {
    /// Validate and compile into the filter handed to the store.
    pub fn into_filter(self) -> Result<JobFilter> {
        match self {
            QueueSelector::All => Ok(JobFilter::default()),
            QueueSelector::Queue(name) => {
                if name.is_empty() {
                    return Err(Error::InvalidArgument("queue name is required".to_string()));
                }
                Ok(JobFilter::queues(vec![name]))
            }
            QueueSelector::Queues(names) => {
                if names.is_empty() || names.iter().any(String::is_empty) {
                    return Err(Error::InvalidArgument(format!(
                        "incorrect queue list: {names:?}"
                    )));
                }
                Ok(JobFilter::queues(names))
            }
            QueueSelector::Filter(filter) => {
                if filter.queues.as_ref().is_some_and(Vec::is_empty) {
                    return Err(Error::InvalidArgument(
                        "filter queue list must not be empty".to_string(),
                    ));
                }
                Ok(filter)
            }
        }
    }

    /// Label used in default worker names and metrics.
    pub fn label(&self) -> String {
        match self {
            QueueSelector::All => "*".to_string(),
            QueueSelector::Queue(name) => name.clone(),
            QueueSelector::Queues(names) => names.join(","),
            QueueSelector::Filter(filter) => {
                serde_json::to_string(filter).unwrap_or_else(|_| "filter".to_string())
            }
        }
    }
}

impl FromStr for QueueSelector {
    type Err = Error;

    /// `*` selects everything, `a,b` a set, anything else a single queue.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidArgument("queue selector is empty".to_string()));
        }
        if s == "*" {
            return Ok(QueueSelector::All);
        }
        if s.contains(',') {
            let names: Vec<String> = s.split(',').map(|n| n.trim().to_string()).collect();
            if names.iter().any(String::is_empty) {
                return Err(Error::InvalidArgument(format!(
                    "incorrect queue argument: {s}"
                )));
            }
            return Ok(QueueSelector::Queues(names));
        }
        Ok(QueueSelector::Queue(s.to_string()))
    }
}

impl From<&str> for QueueSelector {
    fn from(name: &str) -> Self {
        QueueSelector::Queue(name.to_string())
    }
}

impl From<Vec<String>> for QueueSelector {
    fn from(names: Vec<String>) -> Self {
        QueueSelector::Queues(names)
    }
}

impl From<JobFilter> for QueueSelector {
    fn from(filter: JobFilter) -> Self {
        QueueSelector::Filter(filter)
    }
}

/// Predicate over jobs, always conjoined by the store with the status check
/// of the operation using it. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilter {
    /// Job must be in one of these queues.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queues: Option<Vec<String>>,

    /// Job payload must contain this JSON value (Postgres `@>` semantics).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_priority: Option<i32>,
}

impl JobFilter {
    pub fn queues(names: Vec<String>) -> Self {
        Self {
            queues: Some(names),
            ..Self::default()
        }
    }

    pub fn payload_contains(mut self, value: serde_json::Value) -> Self {
        self.payload = Some(value);
        self
    }

    pub fn min_priority(mut self, priority: i32) -> Self {
        self.min_priority = Some(priority);
        self
    }

    /// Evaluate the filter in process.
    pub fn matches(&self, job: &Job) -> bool {
        let in_queue = self
            .queues
            .as_ref()
            .is_none_or(|queues| queues.iter().any(|q| *q == job.queue_name));
        let payload_matches = self
            .payload
            .as_ref()
            .is_none_or(|needle| json_contains(&job.payload, needle));
        let priority_ok = self.min_priority.is_none_or(|min| job.priority >= min);
        in_queue && payload_matches && priority_ok
    }
}

/// JSON containment: objects contain a subset of keys, arrays contain every
/// element of the needle somewhere, scalars compare equal. Only a top-level
/// array also contains a bare scalar it holds.
pub fn json_contains(haystack: &serde_json::Value, needle: &serde_json::Value) -> bool {
    contains(haystack, needle, true)
}

fn contains(haystack: &serde_json::Value, needle: &serde_json::Value, top: bool) -> bool {
    use serde_json::Value;

    match (haystack, needle) {
        (Value::Object(h), Value::Object(n)) => n
            .iter()
            .all(|(k, nv)| h.get(k).is_some_and(|hv| contains(hv, nv, false))),
        (Value::Array(h), Value::Array(n)) => n
            .iter()
            .all(|nv| h.iter().any(|hv| contains(hv, nv, false))),
        (Value::Array(h), scalar) if top && !scalar.is_object() && !scalar.is_array() => {
            h.iter().any(|hv| hv == scalar)
        }
        (h, n) => h == n,
    }
}
