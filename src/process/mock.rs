//! Scripted leaf process for exercising the engine without hardware.
//!
//! Mirrors the role mock instruments play for the instrument traits: tests
//! and the demo binary script a sequence of steps (cancellable work units
//! and induced faults) and drive the full process contract against it.

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
use tokio::time::sleep;

/// One scripted unit of work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockStep {
    /// Wait this long, observing cancellation.
    Work(#[serde(with = "humantime_serde")] Duration),
    /// Fault with this message.
    Fail(String),
}

/// Records which value a script saw for one environment variable, across
/// every process instantiated from the same block.
#[derive(Clone, Debug)]
pub struct MockObserver {
    variable: String,
    seen: Arc<Mutex<Vec<Value>>>,
}

impl MockObserver {
    /// Observe the given variable.
    pub fn new(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Values observed so far, in run order.
    pub fn seen(&self) -> Vec<Value> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, value: Value) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(value);
    }
}

#[derive(Debug)]
struct MockState {
    cursor: usize,
    pending: Option<usize>,
}

/// A leaf process that replays a scripted step list.
#[derive(Debug)]
pub struct MockProcess {
    steps: Vec<MockStep>,
    cell: ModeCell,
    state: Mutex<MockState>,
    observer: Option<MockObserver>,
}

impl MockProcess {
    /// Create a process over the given script.
    pub fn new(steps: Vec<MockStep>) -> Self {
        Self {
            steps,
            cell: ModeCell::new(),
            state: Mutex::new(MockState {
                cursor: 0,
                pending: None,
            }),
            observer: None,
        }
    }

    /// Attach an environment observer.
    pub fn with_observer(mut self, observer: MockObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cursor(&self) -> usize {
        self.lock().cursor
    }

    fn step_point(&self) -> Point {
        Point::Leaf(json!({ "step": self.cursor() }))
    }

    fn parse_step(steps: usize, data: &Value) -> AppResult<usize> {
        let step = data
            .get("step")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                LabError::InvalidCheckpoint(format!("expected {{\"step\": ..}}, got {data}"))
            })?;
        let step = step as usize;
        if step > steps {
            return Err(LabError::InvalidCheckpoint(format!(
                "step {step} beyond script length {steps}"
            )));
        }
        Ok(step)
    }
}

#[async_trait::async_trait]
impl Process for MockProcess {
    async fn run(
        &self,
        point: Option<Point>,
        stack: &EvalStack,
        sink: &EventSink,
    ) -> AppResult<()> {
        if let Some(observer) = &self.observer {
            observer.record(
                stack
                    .lookup(&observer.variable)
                    .cloned()
                    .unwrap_or(Value::Null),
            );
        }
        if let Some(Point::Leaf(data)) = &point {
            self.lock().cursor = Self::parse_step(self.steps.len(), data)?;
        } else if point.is_some() {
            return Err(LabError::InvalidCheckpoint(
                "mock point must be a leaf".into(),
            ));
        }
        loop {
            match self.cell.view() {
                ProcessMode::Halted => {
                    sink.emit(Event::Termination {
                        point: self.step_point(),
                    })
                    .await;
                    return Ok(());
                }
                ProcessMode::Paused { resume } => {
                    sink.emit(Event::Pause {
                        point: self.step_point(),
                    })
                    .await;
                    resume.notified().await;
                }
                ProcessMode::WaitingForever { resume } => {
                    resume.notified().await;
                }
                ProcessMode::Normal { cancel } => {
                    let cursor = self.cursor();
                    let Some(step) = self.steps.get(cursor) else {
                        self.cell.finish();
                        sink.emit(Event::Termination {
                            point: self.step_point(),
                        })
                        .await;
                        return Ok(());
                    };
                    match step {
                        MockStep::Fail(message) => {
                            return Err(LabError::ProcessFault(message.clone()));
                        }
                        MockStep::Work(duration) => {
                            sink.emit(Event::Exec {
                                point: self.step_point(),
                                eta: Some(*duration),
                                pausable: true,
                            })
                            .await;
                            tokio::select! {
                                _ = sleep(*duration) => {
                                    let mut state = self.lock();
                                    state.cursor += 1;
                                    if let Some(target) = state.pending.take() {
                                        state.cursor = target;
                                    }
                                }
                                _ = cancel.notified() => {
                                    // Interrupted units restart from the
                                    // same step after resume.
                                    let mut state = self.lock();
                                    if let Some(target) = state.pending.take() {
                                        state.cursor = target;
                                    }
                                }
                            }
                        }
                    }
                }
            }
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
        let target = match &point {
            Point::Leaf(data) => Self::parse_step(self.steps.len(), data)?,
            Point::Child { .. } => {
                return Err(LabError::InvalidCheckpoint(
                    "mock point must be a leaf".into(),
                ))
            }
        };
        match self.cell.view() {
            ProcessMode::Normal { cancel } => {
                self.lock().pending = Some(target);
                cancel.notify_one();
                Ok(())
            }
            ProcessMode::Paused { .. } => {
                self.lock().cursor = target;
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
        json!({ "step": self.cursor() })
    }

    fn import_point(&self, data: &Value) -> AppResult<Point> {
        let step = Self::parse_step(self.steps.len(), data)?;
        Ok(Point::Leaf(json!({ "step": step })))
    }

    fn mode(&self) -> ProcessModeKind {
        self.cell.kind()
    }
}

/// Leaf block instantiating one [`MockProcess`] per program lifetime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MockBlock {
    /// Script replayed by each instantiated process.
    pub steps: Vec<MockStep>,
    /// Observer handed to every instantiated process.
    #[serde(skip)]
    pub observer: Option<MockObserver>,
}

impl MockBlock {
    /// Block whose process completes after one short unit of work.
    pub fn succeeding(duration: Duration) -> Self {
        Self {
            steps: vec![MockStep::Work(duration)],
            observer: None,
        }
    }

    /// Block whose process faults immediately.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            steps: vec![MockStep::Fail(message.into())],
            observer: None,
        }
    }

    /// Attach an environment observer to every instantiated process.
    pub fn observed(mut self, observer: MockObserver) -> Self {
        self.observer = Some(observer);
        self
    }
}

impl Block for MockBlock {
    fn create_program(&self) -> Arc<dyn Program> {
        let mut process = MockProcess::new(self.steps.clone());
        if let Some(observer) = &self.observer {
            process = process.with_observer(observer.clone());
        }
        Arc::new(LeafProgram::new(Arc::new(process)))
    }

    fn export(&self) -> Value {
        json!({ "type": "mock", "steps": self.steps })
    }

    fn validate_point(&self, point: &Point) -> AppResult<()> {
        match point {
            Point::Leaf(value) => MockProcess::parse_step(self.steps.len(), value).map(|_| ()),
            Point::Child { .. } => Err(LabError::InvalidCheckpoint(
                "mock point must be a leaf".into(),
            )),
        }
    }

    fn eta(&self) -> Eta {
        self.steps
            .iter()
            .fold(Eta::Finite(Duration::ZERO), |eta, step| match step {
                MockStep::Work(duration) => eta.plus(Eta::Finite(*duration)),
                MockStep::Fail(_) => eta.plus(Eta::Unknown),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_validation() {
        let process = MockProcess::new(vec![MockStep::Work(Duration::from_millis(10))]);
        assert!(process.import_point(&json!({ "step": 1 })).is_ok());
        assert!(process.import_point(&json!({ "step": 2 })).is_err());
        assert!(process.import_point(&json!({ "progress": 0.2 })).is_err());
    }

    #[test]
    fn test_eta_sums_work() {
        let block = MockBlock {
            steps: vec![
                MockStep::Work(Duration::from_millis(10)),
                MockStep::Work(Duration::from_millis(20)),
            ],
            observer: None,
        };
        assert_eq!(block.eta(), Eta::Finite(Duration::from_millis(30)));
    }
}
