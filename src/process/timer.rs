//! Timed-wait leaf process, the reference implementation of the process
//! contract.
//!
//! A timer waits for a fixed span (or forever) while remaining pausable,
//! resumable, and relocatable. Progress is a fraction in `[0, 1]`; while a
//! waiting segment is in flight its start instant is kept in shared state,
//! so exported progress is always live — accurate even when the driving
//! task is cancelled at an await point and the body never runs again.
//! Every interruption the body does observe folds `elapsed / total` into
//! the stored progress before the mode transition, so repeated
//! pause/resume cycles accumulate without drift beyond floating-point
//! precision.

use crate::error::{AppResult, LabError};
use crate::eval::EvalStack;
use crate::process::{
    Event, EventSink, ModeCell, Point, Process, ProcessMode, ProcessModeKind,
};
use crate::protocol::{Block, Eta, LeafProgram, Program};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// How long a timer waits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerSpan {
    /// Bounded wait.
    Duration(#[serde(with = "humantime_serde")] Duration),
    /// Unbounded wait; terminates only on halt.
    Forever,
}

#[derive(Debug)]
struct TimerState {
    progress: f64,
    /// Start of the in-flight waiting segment, if any.
    started: Option<Instant>,
    /// Jump target awaiting application at the next wake-up.
    pending: Option<f64>,
}

/// A pausable timed wait.
#[derive(Debug)]
pub struct Timer {
    span: TimerSpan,
    cell: ModeCell,
    state: Mutex<TimerState>,
}

impl Timer {
    /// Create a timer for the given span.
    pub fn new(span: TimerSpan) -> Self {
        Self {
            span,
            cell: ModeCell::new(),
            state: Mutex::new(TimerState {
                progress: 0.0,
                started: None,
                pending: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Progress including the elapsed share of any in-flight wait.
    fn live_progress(&self) -> f64 {
        let state = self.lock();
        match (state.started, self.span) {
            (Some(started), TimerSpan::Duration(total)) => {
                if total > Duration::ZERO {
                    let delta = started.elapsed().as_secs_f64() / total.as_secs_f64();
                    (state.progress + delta).min(1.0)
                } else {
                    1.0
                }
            }
            _ => state.progress,
        }
    }

    /// Fold the in-flight wait into stored progress and apply any pending
    /// jump target.
    fn fold_now(&self) {
        let live = self.live_progress();
        let mut state = self.lock();
        state.progress = live;
        state.started = None;
        if let Some(target) = state.pending.take() {
            state.progress = target.clamp(0.0, 1.0);
        }
    }

    fn stored_progress(&self) -> f64 {
        self.lock().progress
    }

    fn parse_progress(data: &Value) -> AppResult<f64> {
        let progress = data
            .get("progress")
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                LabError::InvalidCheckpoint(format!("expected {{\"progress\": ..}}, got {data}"))
            })?;
        if !(0.0..=1.0).contains(&progress) {
            return Err(LabError::InvalidCheckpoint(format!(
                "progress {progress} outside [0, 1]"
            )));
        }
        Ok(progress)
    }

    async fn run_duration(&self, total: Duration, sink: &EventSink) -> AppResult<()> {
        loop {
            match self.cell.view() {
                ProcessMode::Halted => {
                    sink.emit(Event::Termination {
                        point: Point::progress(self.stored_progress()),
                    })
                    .await;
                    return Ok(());
                }
                ProcessMode::Paused { resume } => {
                    sink.emit(Event::Pause {
                        point: Point::progress(self.stored_progress()),
                    })
                    .await;
                    resume.notified().await;
                }
                ProcessMode::WaitingForever { resume } => {
                    // Not reachable for a bounded timer, but harmless: wait
                    // for the releasing signal and re-dispatch.
                    resume.notified().await;
                }
                ProcessMode::Normal { cancel } => {
                    let progress = self.stored_progress();
                    if progress >= 1.0 {
                        self.cell.finish();
                        sink.emit(Event::Termination {
                            point: Point::progress(1.0),
                        })
                        .await;
                        return Ok(());
                    }
                    let remaining = total.mul_f64(1.0 - progress);
                    self.lock().started = Some(Instant::now());
                    sink.emit(Event::Exec {
                        point: Point::progress(progress),
                        eta: Some(remaining),
                        pausable: true,
                    })
                    .await;
                    tokio::select! {
                        _ = sleep(remaining) => {
                            let mut state = self.lock();
                            state.started = None;
                            state.progress = 1.0;
                            if let Some(target) = state.pending.take() {
                                state.progress = target.clamp(0.0, 1.0);
                            }
                        }
                        _ = cancel.notified() => {
                            self.fold_now();
                        }
                    }
                }
            }
        }
    }

    async fn run_forever(&self, sink: &EventSink) -> AppResult<()> {
        let Some(released) = self.cell.enter_wait_forever() else {
            sink.emit(Event::Termination {
                point: Point::progress(self.stored_progress()),
            })
            .await;
            return Ok(());
        };
        sink.emit(Event::Exec {
            point: Point::progress(0.0),
            eta: None,
            pausable: false,
        })
        .await;
        loop {
            released.notified().await;
            if self.cell.kind() == ProcessModeKind::Halted {
                sink.emit(Event::Termination {
                    point: Point::progress(self.stored_progress()),
                })
                .await;
                return Ok(());
            }
        }
    }
}

#[async_trait::async_trait]
impl Process for Timer {
    async fn run(
        &self,
        point: Option<Point>,
        _stack: &EvalStack,
        sink: &EventSink,
    ) -> AppResult<()> {
        if let Some(point) = point {
            let progress = point.as_progress().ok_or_else(|| {
                LabError::InvalidCheckpoint("timer point must carry a progress fraction".into())
            })?;
            self.lock().progress = progress.clamp(0.0, 1.0);
        }
        match self.span {
            TimerSpan::Duration(total) => self.run_duration(total, sink).await,
            TimerSpan::Forever => self.run_forever(sink).await,
        }
    }

    async fn pause(&self) -> AppResult<()> {
        self.cell.request_pause()
    }

    async fn resume(&self) -> AppResult<()> {
        self.cell.request_resume()
    }

    async fn halt(&self) -> AppResult<()> {
        self.cell.request_halt()
    }

    async fn jump(&self, point: Point) -> AppResult<()> {
        let target = point.as_progress().ok_or_else(|| {
            LabError::InvalidCheckpoint("timer point must carry a progress fraction".into())
        })?;
        match self.cell.view() {
            ProcessMode::Normal { cancel } => {
                self.lock().pending = Some(target);
                cancel.notify_one();
                Ok(())
            }
            ProcessMode::Paused { .. } => {
                // Takes effect at the next resume; exported state reflects
                // the target so checkpoints record what a resume will use.
                self.lock().progress = target.clamp(0.0, 1.0);
                Ok(())
            }
            ProcessMode::WaitingForever { .. } => Err(LabError::InvalidTransition {
                op: "jump",
                mode: "waiting forever",
            }),
            ProcessMode::Halted => Err(LabError::ProcessHalted),
        }
    }

    fn export(&self) -> Value {
        json!({ "progress": self.live_progress() })
    }

    fn import_point(&self, data: &Value) -> AppResult<Point> {
        let progress = Self::parse_progress(data)?;
        Ok(Point::progress(progress))
    }

    fn mode(&self) -> ProcessModeKind {
        self.cell.kind()
    }
}

// =============================================================================
// Timer block
// =============================================================================

/// Leaf block instantiating one [`Timer`] per program lifetime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimerBlock {
    /// How long the timer waits.
    pub span: TimerSpan,
}

impl TimerBlock {
    /// Convenience constructor for a bounded timer.
    pub fn duration(duration: Duration) -> Self {
        Self {
            span: TimerSpan::Duration(duration),
        }
    }

    /// Convenience constructor for an unbounded timer.
    pub fn forever() -> Self {
        Self {
            span: TimerSpan::Forever,
        }
    }
}

impl Block for TimerBlock {
    fn create_program(&self) -> Arc<dyn Program> {
        Arc::new(LeafProgram::new(Arc::new(Timer::new(self.span))))
    }

    fn export(&self) -> Value {
        json!({ "type": "timer", "span": self.span })
    }

    fn validate_point(&self, point: &Point) -> AppResult<()> {
        match point {
            Point::Leaf(value) => Timer::parse_progress(value).map(|_| ()),
            Point::Child { .. } => Err(LabError::InvalidCheckpoint(
                "timer point must be a leaf".into(),
            )),
        }
    }

    fn eta(&self) -> Eta {
        match self.span {
            TimerSpan::Duration(duration) => Eta::Finite(duration),
            TimerSpan::Forever => Eta::Forever,
        }
    }
}
