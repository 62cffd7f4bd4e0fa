//! Lifecycle events and rollback bookkeeping
//!
//! Every long-running operation reports its progress as a sequence of typed
//! events. An operation opens an [`Event`] on a [`Scope`], registers a
//! rollback step after each side effect, and closes the event with `end`,
//! `skip` or `fail`. Failing an event replays the registered rollback steps
//! in reverse registration order before the error propagates, so a failed
//! start leaves no epairs, firewall rules or mounts behind.
//!
//! Callers either attach an observer closure to stream records as they
//! complete, or collect everything afterwards with [`Scope::into_events`].

use crate::error::{Error, Result};
use std::fmt;
use std::time::{Duration, Instant};

/// Event categories emitted by library operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    JailLaunch,
    JailDestroy,
    JailDependantsStart,
    JailFstabUpdate,
    JailClone,
    JailRename,
    JailExec,
    ReleaseFetch,
    ReleaseDownload,
    ReleaseExtraction,
    ReleaseConfiguration,
    ReleaseUpdatePull,
    ReleaseUpdateDownload,
    ReleaseUpdate,
    ResourceBackup,
    ExportConfig,
    ExportFstab,
    ExportRootDataset,
    ExportOtherDatasets,
    BackupBundle,
    ImportConfig,
    ImportFstab,
    ImportRootDataset,
    ImportOtherDatasets,
    ZfsDatasetRename,
    ZfsDatasetDestroy,
    ZfsSnapshotRename,
    ZfsSnapshotClone,
    ZfsSnapshotRollback,
    TeardownSystemMounts,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Final status of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Done,
    Skipped,
    Failed,
}

/// A finished (or, for observers, in-flight) event notification
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// Event category
    pub event_type: EventType,
    /// Subject of the event (jail name, release name, dataset, ...)
    pub identifier: Option<String>,
    /// Final status
    pub status: EventStatus,
    /// Human-readable detail (step progress, skip reason, error text)
    pub message: Option<String>,
    /// Time since the event began
    pub elapsed: Duration,
    /// Nesting depth below the outermost operation
    pub parent_count: usize,
}

type RollbackStep = Box<dyn FnOnce() -> Result<()>>;

/// An open event with its registered rollback steps
pub struct Event {
    event_type: EventType,
    identifier: Option<String>,
    started_at: Instant,
    parent_count: usize,
    message: Option<String>,
    rollback_steps: Vec<RollbackStep>,
}

impl Event {
    /// Register a rollback step to run if this event (or a later sibling)
    /// fails. Steps run in reverse registration order.
    pub fn add_rollback_step(&mut self, step: impl FnOnce() -> Result<()> + 'static) {
        self.rollback_steps.push(Box::new(step));
    }

    /// Attach or replace the progress message
    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
    }

    /// Emit an intermediate progress notification without closing the event
    pub fn step(&self, scope: &mut Scope, message: impl Into<String>) {
        scope.notify(EventRecord {
            event_type: self.event_type,
            identifier: self.identifier.clone(),
            status: EventStatus::Pending,
            message: Some(message.into()),
            elapsed: self.started_at.elapsed(),
            parent_count: self.parent_count,
        });
    }

    /// Close the event successfully. Rollback steps are dropped.
    pub fn end(self, scope: &mut Scope) {
        scope.close(self, EventStatus::Done, None);
    }

    /// Close the event as skipped
    pub fn skip(self, scope: &mut Scope, reason: impl Into<String>) {
        scope.close(self, EventStatus::Skipped, Some(reason.into()));
    }

    /// Fail the event: run every registered rollback step in reverse order,
    /// then record the failure. Errors inside rollback steps are logged and
    /// do not stop the remaining steps.
    pub fn fail(mut self, scope: &mut Scope, error: &Error) {
        let steps = std::mem::take(&mut self.rollback_steps);
        for step in steps.into_iter().rev() {
            if let Err(e) = step() {
                log::warn!("rollback step failed: {}", e);
            }
        }
        let message = Some(error.to_string());
        scope.close(self, EventStatus::Failed, message);
    }
}

/// Shared context for an operation's event sequence
///
/// Collects finished records and keeps the nesting depth so presentation
/// layers can indent child events under their parent.
pub struct Scope {
    records: Vec<EventRecord>,
    observer: Option<Box<dyn FnMut(&EventRecord)>>,
    depth: usize,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            observer: None,
            depth: 0,
        }
    }

    /// Create a scope that streams every record to `observer` as it is
    /// produced (begin, step and close boundaries)
    pub fn with_observer(observer: impl FnMut(&EventRecord) + 'static) -> Self {
        Self {
            records: Vec::new(),
            observer: Some(Box::new(observer)),
            depth: 0,
        }
    }

    /// Open a new event at the current nesting depth
    pub fn begin(&mut self, event_type: EventType, identifier: Option<String>) -> Event {
        let event = Event {
            event_type,
            identifier,
            started_at: Instant::now(),
            parent_count: self.depth,
            message: None,
            rollback_steps: Vec::new(),
        };
        self.depth += 1;
        self.notify(EventRecord {
            event_type,
            identifier: event.identifier.clone(),
            status: EventStatus::Pending,
            message: None,
            elapsed: Duration::ZERO,
            parent_count: event.parent_count,
        });
        event
    }

    /// Run `body` inside an event: `end` on success, `fail` (with rollback)
    /// on error. The body receives the scope for nested events and the open
    /// event for rollback registration.
    pub fn run<T>(
        &mut self,
        event_type: EventType,
        identifier: Option<String>,
        body: impl FnOnce(&mut Scope, &mut Event) -> Result<T>,
    ) -> Result<T> {
        let mut event = self.begin(event_type, identifier);
        match body(self, &mut event) {
            Ok(value) => {
                event.end(self);
                Ok(value)
            }
            Err(error) => {
                event.fail(self, &error);
                Err(error)
            }
        }
    }

    fn close(&mut self, event: Event, status: EventStatus, message: Option<String>) {
        self.depth = self.depth.saturating_sub(1);
        let record = EventRecord {
            event_type: event.event_type,
            identifier: event.identifier,
            status,
            message: message.or(event.message),
            elapsed: event.started_at.elapsed(),
            parent_count: event.parent_count,
        };
        self.notify(record.clone());
        self.records.push(record);
    }

    fn notify(&mut self, record: EventRecord) {
        if let Some(observer) = self.observer.as_mut() {
            observer(&record);
        }
    }

    /// Records of all closed events, in completion order
    pub fn events(&self) -> &[EventRecord] {
        &self.records
    }

    /// Consume the scope, returning the collected records
    pub fn into_events(self) -> Vec<EventRecord> {
        self.records
    }

    /// True if any closed event failed
    pub fn has_failures(&self) -> bool {
        self.records
            .iter()
            .any(|r| r.status == EventStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_successful_event_drops_rollback() {
        let rolled_back = Rc::new(RefCell::new(false));
        let flag = rolled_back.clone();

        let mut scope = Scope::new();
        let result: Result<()> = scope.run(EventType::JailLaunch, Some("t1".into()), |_, ev| {
            ev.add_rollback_step(move || {
                *flag.borrow_mut() = true;
                Ok(())
            });
            Ok(())
        });

        assert!(result.is_ok());
        assert!(!*rolled_back.borrow());
        assert_eq!(scope.events().len(), 1);
        assert_eq!(scope.events()[0].status, EventStatus::Done);
    }

    #[test]
    fn test_failure_runs_rollback_in_reverse() {
        let order = Rc::new(RefCell::new(Vec::new()));

        let mut scope = Scope::new();
        let o1 = order.clone();
        let o2 = order.clone();
        let result: Result<()> = scope.run(EventType::JailLaunch, Some("t1".into()), |_, ev| {
            ev.add_rollback_step(move || {
                o1.borrow_mut().push(1);
                Ok(())
            });
            ev.add_rollback_step(move || {
                o2.borrow_mut().push(2);
                Ok(())
            });
            Err(Error::JailLaunchFailed {
                jail: "t1".into(),
                reason: "boom".into(),
            })
        });

        assert!(result.is_err());
        assert_eq!(*order.borrow(), vec![2, 1]);
        assert_eq!(scope.events()[0].status, EventStatus::Failed);
    }

    #[test]
    fn test_rollback_error_does_not_stop_remaining_steps() {
        let reached = Rc::new(RefCell::new(false));
        let flag = reached.clone();

        let mut scope = Scope::new();
        let _ = scope.run(
            EventType::JailLaunch,
            None,
            |_, ev| -> Result<()> {
                ev.add_rollback_step(move || {
                    *flag.borrow_mut() = true;
                    Ok(())
                });
                ev.add_rollback_step(|| Err(Error::Zfs("cannot destroy".into())));
                Err(Error::Zfs("boom".into()))
            },
        );

        assert!(*reached.borrow());
    }

    #[test]
    fn test_nested_events_track_parent_count() {
        let mut scope = Scope::new();
        let _: Result<()> = scope.run(EventType::JailLaunch, None, |scope, _| {
            scope.run(EventType::ZfsSnapshotClone, None, |_, _| Ok(()))
        });

        let records = scope.events();
        assert_eq!(records.len(), 2);
        // Child closes first
        assert_eq!(records[0].event_type, EventType::ZfsSnapshotClone);
        assert_eq!(records[0].parent_count, 1);
        assert_eq!(records[1].parent_count, 0);
    }

    #[test]
    fn test_observer_sees_begin_and_close() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();

        let mut scope = Scope::with_observer(move |record| {
            sink.borrow_mut().push(record.status);
        });
        let _: Result<()> = scope.run(EventType::ReleaseFetch, None, |_, _| Ok(()));

        assert_eq!(*seen.borrow(), vec![EventStatus::Pending, EventStatus::Done]);
    }
}
