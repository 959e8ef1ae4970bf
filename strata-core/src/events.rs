//! Stack event tailing
//!
//! The provider's event API returns the full history of a stack,
//! newest-first, with no cursor. [`EventLog`] turns repeated fetches of
//! that history into an append-only, chronological, deduplicated log so
//! each event surfaces exactly once per orchestration run.

use crate::provider::StackEvent;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

pub const STACK_RESOURCE_TYPE: &str = "AWS::CloudFormation::Stack";

/// Clock skew allowance when anchoring the watermark.
const WATERMARK_SKEW_SECS: i64 = 5;

const OPERATION_START_STATUSES: [&str; 3] = [
    "CREATE_IN_PROGRESS",
    "UPDATE_IN_PROGRESS",
    "DELETE_IN_PROGRESS",
];

#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<StackEvent>,
    watermark: Option<DateTime<Utc>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[StackEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    /// Fold a fresh newest-first fetch of the stack's event history into
    /// the log. Returns the newly recorded events in chronological order.
    ///
    /// Until the current operation's opening stack-level event shows up,
    /// nothing is recorded; the watermark anchors there (minus skew) and
    /// is set exactly once per run, so history from prior operations never
    /// leaks in.
    pub fn ingest(&mut self, fetched: Vec<StackEvent>) -> Vec<StackEvent> {
        if self.watermark.is_none() {
            self.watermark = fetched
                .iter()
                .find(|e| {
                    e.resource_type == STACK_RESOURCE_TYPE
                        && OPERATION_START_STATUSES.contains(&e.resource_status.as_str())
                })
                .map(|e| e.timestamp - Duration::seconds(WATERMARK_SKEW_SECS));
        }
        let Some(watermark) = self.watermark else {
            return vec![];
        };

        let mut fresh = Vec::new();
        for event in fetched.into_iter().rev() {
            if event.timestamp < watermark {
                continue;
            }
            if self.events.iter().any(|e| e.event_id == event.event_id) {
                continue;
            }
            self.events.push(event.clone());
            fresh.push(event);
        }
        fresh
    }

    /// The most specific failure reason in the log: the last reason
    /// reported for the first resource that failed or triggered a
    /// rollback. Stack-level "Resource creation cancelled" noise loses to
    /// the per-resource reason that preceded it.
    pub fn failure_reason(&self) -> Option<String> {
        let mut latest: HashMap<&str, &str> = HashMap::new();
        for event in &self.events {
            if let Some(reason) = &event.resource_status_reason {
                latest.insert(&event.logical_resource_id, reason);
            }
            if event.resource_status.ends_with("FAILED")
                || event.resource_status.ends_with("ROLLBACK_IN_PROGRESS")
            {
                return latest
                    .get(event.logical_resource_id.as_str())
                    .map(|r| r.to_string());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn event(id: &str, secs: i64, resource: &str, kind: &str, status: &str) -> StackEvent {
        StackEvent {
            event_id: id.to_string(),
            timestamp: at(secs),
            logical_resource_id: resource.to_string(),
            resource_type: kind.to_string(),
            resource_status: status.to_string(),
            resource_status_reason: None,
        }
    }

    fn with_reason(mut e: StackEvent, reason: &str) -> StackEvent {
        e.resource_status_reason = Some(reason.to_string());
        e
    }

    fn start_event(secs: i64) -> StackEvent {
        event("start", secs, "app-dev-db", STACK_RESOURCE_TYPE, "UPDATE_IN_PROGRESS")
    }

    #[test]
    fn no_watermark_until_operation_starts() {
        let mut log = EventLog::new();
        // Only history from the previous operation so far.
        let fresh = log.ingest(vec![event(
            "old",
            -100,
            "app-dev-db",
            STACK_RESOURCE_TYPE,
            "UPDATE_COMPLETE",
        )]);
        assert!(fresh.is_empty());
        assert!(log.watermark().is_none());
    }

    #[test]
    fn watermark_excludes_prior_history() {
        let mut log = EventLog::new();
        let fresh = log.ingest(vec![
            event("e2", 10, "Table", "AWS::DynamoDB::Table", "CREATE_IN_PROGRESS"),
            start_event(0),
            event("old", -60, "Table", "AWS::DynamoDB::Table", "CREATE_COMPLETE"),
        ]);
        // Chronological, and the -60s event stays out.
        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh[0].event_id, "start");
        assert_eq!(fresh[1].event_id, "e2");
        assert_eq!(log.watermark(), Some(at(-WATERMARK_SKEW_SECS)));
    }

    #[test]
    fn watermark_is_set_once() {
        let mut log = EventLog::new();
        log.ingest(vec![start_event(0)]);
        let anchored = log.watermark();
        log.ingest(vec![start_event(50), start_event(0)]);
        assert_eq!(log.watermark(), anchored);
    }

    #[test]
    fn refetches_deduplicate() {
        let mut log = EventLog::new();
        log.ingest(vec![start_event(0)]);
        let fresh = log.ingest(vec![
            event("e2", 5, "Table", "AWS::DynamoDB::Table", "CREATE_IN_PROGRESS"),
            start_event(0),
        ]);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].event_id, "e2");
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn failure_reason_prefers_per_resource_detail() {
        let mut log = EventLog::new();
        log.ingest(vec![
            with_reason(
                event("e3", 20, "app-dev-db", STACK_RESOURCE_TYPE, "UPDATE_ROLLBACK_IN_PROGRESS"),
                "The following resource(s) failed to create: [Table].",
            ),
            with_reason(
                event("e2", 10, "Table", "AWS::DynamoDB::Table", "CREATE_FAILED"),
                "Table already exists",
            ),
            start_event(0),
        ]);
        assert_eq!(log.failure_reason().as_deref(), Some("Table already exists"));
    }

    #[test]
    fn no_failure_no_reason() {
        let mut log = EventLog::new();
        log.ingest(vec![
            event("e2", 10, "Table", "AWS::DynamoDB::Table", "CREATE_COMPLETE"),
            start_event(0),
        ]);
        assert_eq!(log.failure_reason(), None);
    }
}
