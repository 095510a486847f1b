//! Repeat composite: runs its child a counted (or unbounded) number of
//! times, binding the iteration index into the child's environment.
//!
//! The repeat count is an expression evaluated when the program starts. An
//! unevaluable count is an authoring fault, not a crash: the program enters
//! a `Failed` mode, emits a `Failure` event carrying the diagnostics, and
//! blocks until halted.

use crate::error::{AppResult, LabError};
use crate::eval::{Count, EvalStack, Expr};
use crate::process::{Event, EventSink, Point};
use crate::protocol::{run_wrapped, Block, Eta, Program};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Composite block repeating a single child.
pub struct RepeatBlock {
    /// Repeat-count expression, evaluated at run time.
    pub count: Expr,
    child: Arc<dyn Block>,
}

impl RepeatBlock {
    /// Create a repeat over the given child.
    pub fn new(count: Expr, child: Arc<dyn Block>) -> Self {
        Self { count, child }
    }
}

impl Block for RepeatBlock {
    fn create_program(&self) -> Arc<dyn Program> {
        Arc::new(RepeatProgram {
            count: self.count.clone(),
            child: self.child.clone(),
            state: Mutex::new(RepeatState::default()),
        })
    }

    fn export(&self) -> Value {
        json!({
            "type": "repeat",
            "count": self.count,
            "child": self.child.export(),
        })
    }

    fn validate_point(&self, point: &Point) -> AppResult<()> {
        match point {
            Point::Child { index, inner } => {
                if let Some(Count::Finite(n)) = self.count.static_count() {
                    if *index >= n {
                        return Err(LabError::InvalidCheckpoint(format!(
                            "iteration {index} beyond repeat count {n}"
                        )));
                    }
                }
                match inner {
                    Some(inner) => self.child.validate_point(inner),
                    None => Ok(()),
                }
            }
            Point::Leaf(_) => Err(LabError::InvalidCheckpoint(
                "repeat point must carry an iteration index".into(),
            )),
        }
    }

    fn eta(&self) -> Eta {
        match self.count.static_count() {
            Some(Count::Finite(n)) => self.child.eta().times(n),
            Some(Count::Forever) => Eta::Forever,
            None => Eta::Unknown,
        }
    }
}

/// Tagged repeat program mode.
enum RepeatMode {
    /// Iterating over child programs.
    Running,
    /// Count evaluation failed; blocked until released by a halt.
    Failed {
        /// Fired by halt to release the wait.
        release: Arc<Notify>,
    },
    /// Halt requested; stop before the next iteration.
    Halting,
}

struct RepeatState {
    mode: RepeatMode,
    iteration: u64,
    current: Option<Arc<dyn Program>>,
    jump_target: Option<(u64, Option<Point>)>,
}

impl Default for RepeatState {
    fn default() -> Self {
        Self {
            mode: RepeatMode::Running,
            iteration: 0,
            current: None,
            jump_target: None,
        }
    }
}

/// Runtime instance of a [`RepeatBlock`].
pub struct RepeatProgram {
    count: Expr,
    child: Arc<dyn Block>,
    state: Mutex<RepeatState>,
}

impl RepeatProgram {
    fn lock(&self) -> MutexGuard<'_, RepeatState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Option<Arc<dyn Program>> {
        self.lock().current.clone()
    }

    fn halting(&self) -> bool {
        matches!(self.lock().mode, RepeatMode::Halting)
    }
}

#[async_trait::async_trait]
impl Program for RepeatProgram {
    async fn run(
        &self,
        point: Option<Point>,
        stack: &EvalStack,
        sink: &EventSink,
    ) -> AppResult<()> {
        let count = match self.count.evaluate(stack) {
            Ok(count) => count,
            Err(diagnostics) => {
                let release = Arc::new(Notify::new());
                {
                    let mut state = self.lock();
                    if matches!(state.mode, RepeatMode::Halting) {
                        return Ok(());
                    }
                    state.mode = RepeatMode::Failed {
                        release: release.clone(),
                    };
                }
                tracing::warn!(%diagnostics, "repeat count evaluation failed");
                let iteration = self.lock().iteration;
                sink.emit(Event::Failure {
                    analysis: diagnostics,
                    point: Point::child(iteration, None),
                })
                .await;
                release.notified().await;
                return Ok(());
            }
        };
        let (mut iteration, mut inner) = match point {
            None => (0, None),
            Some(Point::Child { index, inner }) => (index, inner.map(|b| *b)),
            Some(Point::Leaf(_)) => {
                return Err(LabError::InvalidCheckpoint(
                    "repeat point must carry an iteration index".into(),
                ))
            }
        };
        loop {
            if let Count::Finite(n) = count {
                if iteration >= n {
                    break;
                }
            }
            if self.halting() {
                break;
            }
            let program = self.child.create_program();
            {
                let mut state = self.lock();
                state.iteration = iteration;
                state.current = Some(program.clone());
            }
            let child_stack = stack.child_with("index", json!(iteration));
            let result =
                run_wrapped(program, inner.take(), child_stack, sink.clone(), iteration).await;
            self.lock().current = None;
            result?;
            match self.lock().jump_target.take() {
                Some((target, target_inner)) => {
                    iteration = target;
                    inner = target_inner;
                }
                None => iteration += 1,
            }
        }
        Ok(())
    }

    async fn pause(&self) -> AppResult<()> {
        match self.current() {
            Some(child) => child.pause().await,
            None => Err(LabError::NotRunning),
        }
    }

    async fn resume(&self) -> AppResult<()> {
        match self.current() {
            Some(child) => child.resume().await,
            None => Err(LabError::NotRunning),
        }
    }

    async fn halt(&self) -> AppResult<()> {
        enum HaltAction {
            Release(Arc<Notify>),
            Child(Option<Arc<dyn Program>>),
        }
        let action = {
            let mut state = self.lock();
            match &state.mode {
                RepeatMode::Failed { release } => {
                    let release = release.clone();
                    state.mode = RepeatMode::Halting;
                    HaltAction::Release(release)
                }
                _ => {
                    state.mode = RepeatMode::Halting;
                    HaltAction::Child(state.current.clone())
                }
            }
        };
        match action {
            HaltAction::Release(release) => {
                release.notify_one();
                Ok(())
            }
            HaltAction::Child(Some(child)) => match child.halt().await {
                Err(LabError::ProcessHalted) => Ok(()),
                other => other,
            },
            HaltAction::Child(None) => Ok(()),
        }
    }

    async fn jump(&self, point: Point) -> AppResult<()> {
        let (iteration, inner) = match point {
            Point::Child { index, inner } => (index, inner.map(|b| *b)),
            Point::Leaf(_) => {
                return Err(LabError::InvalidCheckpoint(
                    "repeat point must carry an iteration index".into(),
                ))
            }
        };
        let current = {
            let mut state = self.lock();
            state.jump_target = Some((iteration, inner));
            state.current.clone()
        };
        if let Some(child) = current {
            match child.halt().await {
                Err(LabError::ProcessHalted) => Ok(()),
                other => other,
            }
        } else {
            Ok(())
        }
    }

    fn export_point(&self) -> Point {
        let state = self.lock();
        Point::child(
            state.iteration,
            state.current.as_ref().map(|c| c.export_point()),
        )
    }
}
