//! Master orchestrator: the single top-level driver of one protocol
//! execution against one chip.
//!
//! The master owns the current position (`{segmentIndex, state}`), drives
//! entry and leave of top-level segments, exposes pause/resume/skip and
//! checkpoint import/export, and maintains an append-only execution log
//! used both for observability and for crash recovery — the last entry's
//! location is re-enterable.
//!
//! A leaf failure never crashes the host: the master captures the leaf's
//! recoverable state, appends a log entry carrying the error, and converts
//! the failure into a paused-with-error condition (`neutral: false`) that a
//! later `resume()` re-enters.

use crate::error::{AppResult, LabError};
use crate::eval::EvalStack;
use crate::process::{Event, EventSink, Point};
use crate::protocol::{Program, Protocol};
use crate::runner::{Chip, PauseOptions};
use crate::settings::EngineSettings;
use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch, Notify};
use uuid::Uuid;

/// Capacity of the observability broadcast channel.
const BROADCAST_BUFFER: usize = 64;

/// One append-only execution log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Error message when this entry records a failure.
    pub error: Option<String>,
    /// Whether this entry records a pause.
    pub paused: bool,
    /// Exported recoverable state of the leaf at this moment.
    pub process_state: Value,
    /// Top-level segment the entry refers to.
    pub segment_index: usize,
    /// Milliseconds since the Unix epoch.
    pub time: i64,
}

/// Wire representation of the master's position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterLocation {
    /// Top-level segment index.
    pub segment_index: usize,
    /// Leaf-specific recoverable state; `Null` when none is captured.
    pub state: Value,
}

struct ActiveSegment {
    epoch: u64,
    program: Arc<dyn Program>,
    cancel: Arc<Notify>,
}

struct MasterState {
    segment_index: usize,
    process_state: Value,
    pause_options: Option<PauseOptions>,
    current: Option<ActiveSegment>,
    log: Vec<LogEntry>,
    epoch: u64,
    started: bool,
    done: bool,
}

struct MasterInner {
    chip: Chip,
    protocol: Protocol,
    state: Mutex<MasterState>,
    events_tx: broadcast::Sender<Event>,
    done_tx: watch::Sender<bool>,
    span: tracing::Span,
    buffer: usize,
}

impl MasterInner {
    fn lock(&self) -> MutexGuard<'_, MasterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append_entry(&self, segment_index: usize, error: Option<String>, paused: bool) {
        let mut state = self.lock();
        let entry = LogEntry {
            error,
            paused,
            process_state: state.process_state.clone(),
            segment_index,
            time: Utc::now().timestamp_millis(),
        };
        state.log.push(entry);
    }

    /// Boxed entry point; breaks the `enter -> spawn -> leave -> enter`
    /// future-type cycle.
    fn enter_boxed(inner: Arc<MasterInner>, resuming: bool) -> BoxFuture<'static, AppResult<()>> {
        Box::pin(Self::enter(inner, resuming))
    }

    /// Enter the current position: inform runners, log, then run the
    /// segment asynchronously.
    async fn enter(inner: Arc<MasterInner>, resuming: bool) -> AppResult<()> {
        let (index, options, resume_state) = {
            let mut state = inner.lock();
            let index = state.segment_index;
            if index >= inner.protocol.segments.len() {
                return Err(LabError::SegmentOutOfRange(index));
            }
            let options = if resuming {
                state.pause_options.take()
            } else {
                None
            };
            (index, options, state.process_state.clone())
        };
        match &options {
            Some(options) => {
                join_all(
                    inner
                        .chip
                        .runners()
                        .iter()
                        .map(|runner| runner.resume_segment(index, options)),
                )
                .await;
            }
            None => {
                join_all(
                    inner
                        .chip
                        .runners()
                        .iter()
                        .map(|runner| runner.enter_segment(index)),
                )
                .await;
            }
        }
        inner.append_entry(index, None, false);
        let block = inner.protocol.segments[index].clone();
        let point = if resume_state.is_null() {
            None
        } else {
            Some(block.import_point(&resume_state)?)
        };
        let program = block.create_program();
        let cancel = Arc::new(Notify::new());
        let epoch = {
            let mut state = inner.lock();
            state.epoch += 1;
            state.current = Some(ActiveSegment {
                epoch: state.epoch,
                program: program.clone(),
                cancel: cancel.clone(),
            });
            state.epoch
        };
        tracing::debug!(parent: &inner.span, segment = index, resuming, "segment entered");
        tokio::spawn(async move {
            let run = Self::run_segment(&inner, program.clone(), point, index);
            tokio::pin!(run);
            let result = tokio::select! {
                result = &mut run => Some(result),
                // Cancelled by pause or skip; the canceller owns the state.
                _ = cancel.notified() => None,
            };
            if let Some(result) = result {
                Self::segment_finished(&inner, epoch, index, program, result).await;
            }
        });
        Ok(())
    }

    /// Run one segment's program, forwarding its events to subscribers
    /// wrapped with the segment index.
    async fn run_segment(
        inner: &Arc<MasterInner>,
        program: Arc<dyn Program>,
        point: Option<Point>,
        index: usize,
    ) -> AppResult<()> {
        let (sink, mut rx) = EventSink::channel(inner.buffer);
        let mut run = Some(Box::pin(async move {
            let stack = EvalStack::new();
            program.run(point, &stack, &sink).await
        }));
        let mut outcome = Ok(());
        loop {
            let mut finished = false;
            if let Some(fut) = run.as_mut() {
                tokio::select! {
                    result = fut.as_mut() => {
                        outcome = result;
                        finished = true;
                    }
                    event = rx.recv() => {
                        if let Some(event) = event {
                            let _ = inner.events_tx.send(
                                event.map_point(|p| Point::child(index as u64, Some(p))),
                            );
                        }
                    }
                }
            } else {
                match rx.recv().await {
                    Some(event) => {
                        let _ = inner
                            .events_tx
                            .send(event.map_point(|p| Point::child(index as u64, Some(p))));
                    }
                    None => break,
                }
            }
            if finished {
                run = None;
            }
        }
        outcome
    }

    /// Natural completion of a segment run: advance on success, pause with
    /// error on failure.
    async fn segment_finished(
        inner: &Arc<MasterInner>,
        epoch: u64,
        index: usize,
        program: Arc<dyn Program>,
        result: AppResult<()>,
    ) {
        {
            let state = inner.lock();
            let valid = state
                .current
                .as_ref()
                .is_some_and(|active| active.epoch == epoch);
            if !valid {
                return;
            }
        }
        match result {
            Ok(()) => Self::leave(inner, index).await,
            Err(error) => {
                tracing::error!(parent: &inner.span, %error, segment = index, "segment failed");
                let options = PauseOptions { neutral: false };
                {
                    let mut state = inner.lock();
                    state.current = None;
                    state.process_state = program.export_point().export();
                    state.pause_options = Some(options);
                }
                inner.append_entry(index, Some(error.to_string()), true);
                join_all(
                    inner
                        .chip
                        .runners()
                        .iter()
                        .map(|runner| runner.pause(&options)),
                )
                .await;
            }
        }
    }

    /// Leave a completed position and advance, entering the next segment or
    /// finishing the protocol.
    async fn leave(inner: &Arc<MasterInner>, index: usize) {
        join_all(
            inner
                .chip
                .runners()
                .iter()
                .map(|runner| runner.leave_segment(index)),
        )
        .await;
        let finished = {
            let mut state = inner.lock();
            state.current = None;
            state.process_state = Value::Null;
            state.segment_index = index + 1;
            if state.segment_index >= inner.protocol.segments.len() {
                state.done = true;
                true
            } else {
                false
            }
        };
        if finished {
            tracing::info!(parent: &inner.span, "protocol complete");
            let _ = inner.done_tx.send(true);
        } else if let Err(error) = Self::enter_boxed(inner.clone(), false).await {
            tracing::error!(parent: &inner.span, %error, "failed to enter next segment");
        }
    }
}

/// Root orchestrator of one protocol execution.
#[derive(Clone)]
pub struct Master {
    inner: Arc<MasterInner>,
}

impl Master {
    /// Create a master over a chip and a loaded protocol.
    pub fn new(chip: Chip, protocol: Protocol, settings: EngineSettings) -> Self {
        let id = Uuid::new_v4();
        let span = tracing::info_span!("master", id = %id, protocol = %protocol.name);
        let (events_tx, _) = broadcast::channel(BROADCAST_BUFFER);
        let (done_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(MasterInner {
                chip,
                protocol,
                state: Mutex::new(MasterState {
                    segment_index: 0,
                    process_state: Value::Null,
                    pause_options: None,
                    current: None,
                    log: Vec::new(),
                    epoch: 0,
                    started: false,
                    done: false,
                }),
                events_tx,
                done_tx,
                span,
                buffer: settings.event_buffer.max(1),
            }),
        }
    }

    /// Notify every runner of protocol start and enter the first position.
    pub async fn start(&self) -> AppResult<()> {
        {
            let mut state = self.inner.lock();
            if state.started {
                return Err(LabError::AlreadyStarted);
            }
            state.started = true;
            if self.inner.protocol.segments.is_empty() {
                state.done = true;
            }
        }
        join_all(
            self.inner
                .chip
                .runners()
                .iter()
                .map(|runner| runner.on_protocol_start()),
        )
        .await;
        if self.inner.lock().done {
            let _ = self.inner.done_tx.send(true);
            return Ok(());
        }
        MasterInner::enter_boxed(self.inner.clone(), false).await
    }

    /// Pause execution; fails if already paused.
    ///
    /// Captures the current leaf's recoverable state, cancels the active
    /// task, and informs every runner with the given options.
    pub async fn pause(&self, options: PauseOptions) -> AppResult<()> {
        let index;
        {
            let mut state = self.inner.lock();
            if state.pause_options.is_some() {
                return Err(LabError::AlreadyPaused);
            }
            if !state.started || state.done {
                return Err(LabError::NotRunning);
            }
            let Some(active) = state.current.take() else {
                return Err(LabError::NotRunning);
            };
            state.epoch += 1;
            index = state.segment_index;
            state.process_state = active.program.export_point().export();
            state.pause_options = Some(options);
            active.cancel.notify_one();
        }
        self.inner.append_entry(index, None, true);
        join_all(
            self.inner
                .chip
                .runners()
                .iter()
                .map(|runner| runner.pause(&options)),
        )
        .await;
        Ok(())
    }

    /// Re-enter the current position with the retained pause options and
    /// captured state; fails if not paused.
    pub async fn resume(&self) -> AppResult<()> {
        {
            let state = self.inner.lock();
            if state.pause_options.is_none() {
                return Err(LabError::NotPaused);
            }
        }
        MasterInner::enter_boxed(self.inner.clone(), true).await
    }

    /// Cancel any active task, force-leave the current position, and land
    /// on the requested segment and state.
    pub async fn skip_segment(&self, index: usize, state: Option<Value>) -> AppResult<()> {
        if index >= self.inner.protocol.segments.len() {
            return Err(LabError::SegmentOutOfRange(index));
        }
        if let Some(state) = &state {
            if !state.is_null() {
                self.inner.protocol.segments[index].import_point(state)?;
            }
        }
        let (old_index, was_paused, started) = {
            let mut state_guard = self.inner.lock();
            let old_index = state_guard.segment_index;
            if let Some(active) = state_guard.current.take() {
                state_guard.epoch += 1;
                active.cancel.notify_one();
            }
            state_guard.segment_index = index;
            state_guard.process_state = state.unwrap_or(Value::Null);
            state_guard.done = false;
            (
                old_index,
                state_guard.pause_options.is_some(),
                state_guard.started,
            )
        };
        if !started {
            // Positioning before start(); the first entry happens there.
            return Ok(());
        }
        join_all(
            self.inner
                .chip
                .runners()
                .iter()
                .map(|runner| runner.leave_segment(old_index)),
        )
        .await;
        if was_paused {
            // Stay paused at the new position; resume() will enter it.
            Ok(())
        } else {
            MasterInner::enter_boxed(self.inner.clone(), false).await
        }
    }

    /// Navigate to an imported location.
    pub async fn set_location(&self, location: MasterLocation) -> AppResult<()> {
        self.skip_segment(location.segment_index, Some(location.state))
            .await
    }

    /// Parse and validate a wire-format location against this protocol.
    pub fn import_location(&self, data: &Value) -> AppResult<MasterLocation> {
        let location: MasterLocation = serde_json::from_value(data.clone())?;
        let segments = &self.inner.protocol.segments;
        let block = segments
            .get(location.segment_index)
            .ok_or(LabError::SegmentOutOfRange(location.segment_index))?;
        if !location.state.is_null() {
            block.import_point(&location.state)?;
        }
        Ok(location)
    }

    /// Current position in wire format.
    pub fn export_location(&self) -> MasterLocation {
        let state = self.inner.lock();
        let leaf_state = match &state.current {
            Some(active) => active.program.export_point().export(),
            None => state.process_state.clone(),
        };
        MasterLocation {
            segment_index: state.segment_index,
            state: leaf_state,
        }
    }

    /// Full observability export: the log plus the static protocol tree.
    pub fn export(&self) -> Value {
        json!({
            "entries": self.log(),
            "protocol": self.inner.protocol.export(),
        })
    }

    /// Copy of the append-only log.
    pub fn log(&self) -> Vec<LogEntry> {
        self.inner.lock().log.clone()
    }

    /// Whether execution is paused.
    pub fn is_paused(&self) -> bool {
        self.inner.lock().pause_options.is_some()
    }

    /// Whether the protocol ran to completion.
    pub fn is_done(&self) -> bool {
        self.inner.lock().done
    }

    /// Subscribe to the event stream; points are wrapped with the segment
    /// index.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events_tx.subscribe()
    }

    /// Completion signal; flips to `true` once the last segment leaves.
    pub fn completed(&self) -> watch::Receiver<bool> {
        self.inner.done_tx.subscribe()
    }
}
