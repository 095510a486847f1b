//! Leaf process contract: the state machine every long-running operation
//! implements.
//!
//! A [`Process`] is the runtime body of a leaf block — a timed wait, an
//! external command, a notification, a data capture. Wildly different
//! bodies share one lifecycle discipline:
//!
//! ```text
//!            ┌────────── pause ──────────┐
//!            ▼                           │
//!        Paused ── resume ──────────► Normal ──── (forever) ──► WaitingForever
//!            │                           │                          │
//!            └───────── halt ────────────┴────────── halt ──────────┘
//!                                        ▼
//!                                     Halted
//! ```
//!
//! Cancellation is cooperative: control operations flip the mode and fire
//! the signal stored in the outgoing variant; the running body observes the
//! signal at its next suspension point and treats it as ordinary control
//! flow. Events flow out through an [`EventSink`]; a `Termination` event is
//! always the last event a process instance emits.

pub mod mock;
pub mod timer;

use crate::error::{AppResult, LabError};
use crate::eval::{Diagnostics, EvalStack};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Notify;

/// Default buffer size for event channels.
pub const DEFAULT_EVENT_BUFFER: usize = 16;

// =============================================================================
// Points
// =============================================================================

/// A serializable description of exactly where execution is within a
/// program tree.
///
/// Points are the checkpointing contract: every point a program exports can
/// be imported back to resume execution at the same place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Point {
    /// Leaf-specific resume state, e.g. a timer's progress fraction.
    Leaf(Value),
    /// Position within a composite: which child, and where inside it.
    Child {
        /// Child index (sequence position or repeat iteration).
        index: u64,
        /// Position inside the child, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        inner: Option<Box<Point>>,
    },
}

impl Point {
    /// Leaf point recording a progress fraction.
    pub fn progress(progress: f64) -> Self {
        Point::Leaf(serde_json::json!({ "progress": progress }))
    }

    /// Composite point wrapping an inner point.
    pub fn child(index: u64, inner: Option<Point>) -> Self {
        Point::Child {
            index,
            inner: inner.map(Box::new),
        }
    }

    /// Serialize to the wire representation.
    pub fn export(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Extract the progress fraction from a leaf point, if present.
    pub fn as_progress(&self) -> Option<f64> {
        match self {
            Point::Leaf(value) => value.get("progress").and_then(Value::as_f64),
            Point::Child { .. } => None,
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// A report of a process state transition, flowing bottom-up from the
/// process through its enclosing programs to the master.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The process began (or re-began) a unit of work.
    Exec {
        /// Where execution is.
        point: Point,
        /// Expected remaining time for this unit, when known.
        #[serde(default, with = "humantime_serde")]
        eta: Option<Duration>,
        /// Whether a pause request is currently meaningful.
        pausable: bool,
    },
    /// The process came to rest after a pause request.
    Pause {
        /// Where execution stopped.
        point: Point,
    },
    /// The process finished; always the last event of an instance.
    Termination {
        /// Final position.
        point: Point,
    },
    /// A recoverable fault, typically an authoring error.
    Failure {
        /// What went wrong.
        analysis: Diagnostics,
        /// Where it went wrong.
        point: Point,
    },
}

impl Event {
    /// The point this event refers to.
    pub fn point(&self) -> &Point {
        match self {
            Event::Exec { point, .. }
            | Event::Pause { point }
            | Event::Termination { point }
            | Event::Failure { point, .. } => point,
        }
    }

    /// Rewrite the event's point, used by composites to wrap child points
    /// with their own coordinates.
    pub fn map_point(self, f: impl FnOnce(Point) -> Point) -> Event {
        match self {
            Event::Exec {
                point,
                eta,
                pausable,
            } => Event::Exec {
                point: f(point),
                eta,
                pausable,
            },
            Event::Pause { point } => Event::Pause { point: f(point) },
            Event::Termination { point } => Event::Termination { point: f(point) },
            Event::Failure { analysis, point } => Event::Failure {
                analysis,
                point: f(point),
            },
        }
    }
}

/// Sending half of an ordered event channel.
///
/// A closed receiver is not an error from the process's point of view: the
/// consumer has gone away (halt or abort), and the process will observe its
/// own cancellation signal shortly.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
}

impl EventSink {
    /// Create a sink and its receiving end.
    pub fn channel(capacity: usize) -> (EventSink, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (EventSink { tx }, rx)
    }

    /// Emit one event, preserving order.
    pub async fn emit(&self, event: Event) {
        if self.tx.send(event).await.is_err() {
            tracing::trace!("event dropped: receiver closed");
        }
    }
}

// =============================================================================
// Modes
// =============================================================================

/// Tagged process mode carrying the signal used to leave it.
#[derive(Clone, Debug)]
pub enum ProcessMode {
    /// Actively working; `cancel` interrupts the current unit of work.
    Normal {
        /// Fired by pause/halt/jump to interrupt the active unit.
        cancel: Arc<Notify>,
    },
    /// At rest after a pause; `resume` releases it.
    Paused {
        /// Fired by resume/halt to release the wait.
        resume: Arc<Notify>,
    },
    /// Intentionally unbounded wait; only halt releases it.
    WaitingForever {
        /// Fired by halt to release the wait.
        resume: Arc<Notify>,
    },
    /// Terminal.
    Halted,
}

impl ProcessMode {
    fn name(&self) -> &'static str {
        match self {
            ProcessMode::Normal { .. } => "normal",
            ProcessMode::Paused { .. } => "paused",
            ProcessMode::WaitingForever { .. } => "waiting forever",
            ProcessMode::Halted => "halted",
        }
    }
}

/// Discriminant-only view of a [`ProcessMode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessModeKind {
    /// Actively working.
    Normal,
    /// At rest after a pause.
    Paused,
    /// Unbounded wait.
    WaitingForever,
    /// Terminal.
    Halted,
}

/// Shared mode holder enforcing the transition discipline.
///
/// Process bodies read the mode between units of work; control operations
/// transition it and receive the signal to fire. Keeping the checks here
/// means every leaf implementation inherits the same invariants.
#[derive(Debug)]
pub struct ModeCell {
    mode: Mutex<ProcessMode>,
}

impl Default for ModeCell {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeCell {
    /// Create a cell in `Normal` mode with a fresh cancel signal.
    pub fn new() -> Self {
        Self {
            mode: Mutex::new(ProcessMode::Normal {
                cancel: Arc::new(Notify::new()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProcessMode> {
        self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the current mode (signals are shared handles).
    pub fn view(&self) -> ProcessMode {
        self.lock().clone()
    }

    /// Discriminant of the current mode.
    pub fn kind(&self) -> ProcessModeKind {
        match &*self.lock() {
            ProcessMode::Normal { .. } => ProcessModeKind::Normal,
            ProcessMode::Paused { .. } => ProcessModeKind::Paused,
            ProcessMode::WaitingForever { .. } => ProcessModeKind::WaitingForever,
            ProcessMode::Halted => ProcessModeKind::Halted,
        }
    }

    /// Transition `Normal -> Paused`, firing the old cancel signal.
    ///
    /// Pausing an already-paused process is an invariant error and leaves
    /// the mode untouched.
    pub fn request_pause(&self) -> AppResult<()> {
        let mut mode = self.lock();
        match &*mode {
            ProcessMode::Normal { cancel } => {
                let cancel = cancel.clone();
                *mode = ProcessMode::Paused {
                    resume: Arc::new(Notify::new()),
                };
                drop(mode);
                cancel.notify_one();
                Ok(())
            }
            ProcessMode::Paused { .. } => Err(LabError::AlreadyPaused),
            ProcessMode::Halted => Err(LabError::ProcessHalted),
            other => Err(LabError::InvalidTransition {
                op: "pause",
                mode: other.name(),
            }),
        }
    }

    /// Transition `Paused -> Normal`, firing the resume signal.
    pub fn request_resume(&self) -> AppResult<()> {
        let mut mode = self.lock();
        match &*mode {
            ProcessMode::Paused { resume } => {
                let resume = resume.clone();
                *mode = ProcessMode::Normal {
                    cancel: Arc::new(Notify::new()),
                };
                drop(mode);
                resume.notify_one();
                Ok(())
            }
            ProcessMode::Halted => Err(LabError::ProcessHalted),
            _ => Err(LabError::NotPaused),
        }
    }

    /// Transition to `Halted` from any non-terminal mode, firing whichever
    /// signal releases the body.
    pub fn request_halt(&self) -> AppResult<()> {
        let mut mode = self.lock();
        let signal = match &*mode {
            ProcessMode::Normal { cancel } => cancel.clone(),
            ProcessMode::Paused { resume } | ProcessMode::WaitingForever { resume } => {
                resume.clone()
            }
            ProcessMode::Halted => return Err(LabError::ProcessHalted),
        };
        *mode = ProcessMode::Halted;
        drop(mode);
        signal.notify_one();
        Ok(())
    }

    /// Install the unbounded-wait mode, returning the signal to wait on.
    ///
    /// Returns `None` when the cell is already halted, in which case the
    /// body should terminate immediately.
    pub fn enter_wait_forever(&self) -> Option<Arc<Notify>> {
        let mut mode = self.lock();
        match &*mode {
            ProcessMode::Halted => None,
            _ => {
                let resume = Arc::new(Notify::new());
                *mode = ProcessMode::WaitingForever {
                    resume: resume.clone(),
                };
                Some(resume)
            }
        }
    }

    /// Mark natural completion; the terminal mode afterwards is `Halted`.
    pub fn finish(&self) {
        *self.lock() = ProcessMode::Halted;
    }
}

// =============================================================================
// Process trait
// =============================================================================

/// The state-machine contract every leaf operation implements.
///
/// Control methods take `&self`: a process is shared between the task
/// driving [`Process::run`] and the controller issuing pause/resume/halt,
/// with interior state guarded by the implementation.
#[async_trait::async_trait]
pub trait Process: Send + Sync {
    /// Drive the operation, emitting an ordered sequence of events on
    /// `sink` until termination or halt.
    ///
    /// A non-null `point` resumes exactly where the exported state
    /// indicates. The returned future completes after the final event.
    async fn run(
        &self,
        point: Option<Point>,
        stack: &EvalStack,
        sink: &EventSink,
    ) -> AppResult<()>;

    /// Cancel the active unit of work and come to rest. Valid only while
    /// `Normal`.
    async fn pause(&self) -> AppResult<()>;

    /// Release a paused process, recomputing remaining work from preserved
    /// progress. Valid only while `Paused`.
    async fn resume(&self) -> AppResult<()>;

    /// Terminate from any non-terminal mode. A final `Termination` event is
    /// guaranteed once `run` is (or has been) driving the process.
    async fn halt(&self) -> AppResult<()>;

    /// Relocate mid-flight. From `Normal` the active unit restarts at the
    /// new point; from `Paused` the point takes effect on the next resume.
    async fn jump(&self, point: Point) -> AppResult<()>;

    /// Current recoverable state as a leaf point payload.
    fn export(&self) -> Value;

    /// Validate a serialized leaf point.
    fn import_point(&self, data: &Value) -> AppResult<Point>;

    /// Current mode discriminant.
    fn mode(&self) -> ProcessModeKind;
}
