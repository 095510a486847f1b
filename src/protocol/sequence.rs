//! Ordered composite: runs its children one after another.

use crate::error::{AppResult, LabError};
use crate::eval::EvalStack;
use crate::process::{EventSink, Point};
use crate::protocol::{run_wrapped, Block, Eta, Program};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Composite block owning an ordered list of children.
pub struct SequenceBlock {
    children: Vec<Arc<dyn Block>>,
}

impl SequenceBlock {
    /// Create a sequence over the given children.
    pub fn new(children: Vec<Arc<dyn Block>>) -> Self {
        Self { children }
    }

    /// Append a child.
    pub fn with_child(mut self, child: Arc<dyn Block>) -> Self {
        self.children.push(child);
        self
    }
}

impl Block for SequenceBlock {
    fn create_program(&self) -> Arc<dyn Program> {
        Arc::new(SequenceProgram {
            children: self.children.clone(),
            state: Mutex::new(SequenceState::default()),
        })
    }

    fn export(&self) -> Value {
        json!({
            "type": "sequence",
            "children": self.children.iter().map(|c| c.export()).collect::<Vec<_>>(),
        })
    }

    fn validate_point(&self, point: &Point) -> AppResult<()> {
        match point {
            Point::Child { index, inner } => {
                let child = self
                    .children
                    .get(*index as usize)
                    .ok_or_else(|| LabError::SegmentOutOfRange(*index as usize))?;
                match inner {
                    Some(inner) => child.validate_point(inner),
                    None => Ok(()),
                }
            }
            Point::Leaf(_) => Err(LabError::InvalidCheckpoint(
                "sequence point must carry a child index".into(),
            )),
        }
    }

    fn eta(&self) -> Eta {
        self.children
            .iter()
            .fold(Eta::Finite(Duration::ZERO), |eta, child| {
                eta.plus(child.eta())
            })
    }
}

#[derive(Default)]
struct SequenceState {
    index: u64,
    current: Option<Arc<dyn Program>>,
    halting: bool,
    jump_target: Option<(u64, Option<Point>)>,
}

/// Runtime instance of a [`SequenceBlock`].
pub struct SequenceProgram {
    children: Vec<Arc<dyn Block>>,
    state: Mutex<SequenceState>,
}

impl SequenceProgram {
    fn lock(&self) -> MutexGuard<'_, SequenceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Option<Arc<dyn Program>> {
        self.lock().current.clone()
    }
}

#[async_trait::async_trait]
impl Program for SequenceProgram {
    async fn run(
        &self,
        point: Option<Point>,
        stack: &EvalStack,
        sink: &EventSink,
    ) -> AppResult<()> {
        let (mut index, mut inner) = match point {
            None => (0, None),
            Some(Point::Child { index, inner }) => (index, inner.map(|b| *b)),
            Some(Point::Leaf(_)) => {
                return Err(LabError::InvalidCheckpoint(
                    "sequence point must carry a child index".into(),
                ))
            }
        };
        while (index as usize) < self.children.len() {
            if self.lock().halting {
                break;
            }
            let program = self.children[index as usize].create_program();
            {
                let mut state = self.lock();
                state.index = index;
                state.current = Some(program.clone());
            }
            let result =
                run_wrapped(program, inner.take(), stack.clone(), sink.clone(), index).await;
            self.lock().current = None;
            result?;
            match self.lock().jump_target.take() {
                Some((target, target_inner)) => {
                    index = target;
                    inner = target_inner;
                }
                None => index += 1,
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
        let current = {
            let mut state = self.lock();
            state.halting = true;
            state.current.clone()
        };
        if let Some(child) = current {
            match child.halt().await {
                // The child finished on its own just before the request.
                Err(LabError::ProcessHalted) => Ok(()),
                other => other,
            }
        } else {
            Ok(())
        }
    }

    async fn jump(&self, point: Point) -> AppResult<()> {
        let (index, inner) = match point {
            Point::Child { index, inner } => (index, inner.map(|b| *b)),
            Point::Leaf(_) => {
                return Err(LabError::InvalidCheckpoint(
                    "sequence point must carry a child index".into(),
                ))
            }
        };
        if index as usize >= self.children.len() {
            return Err(LabError::SegmentOutOfRange(index as usize));
        }
        let current = {
            let mut state = self.lock();
            state.jump_target = Some((index, inner));
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
            state.index,
            state.current.as_ref().map(|c| c.export_point()),
        )
    }
}
