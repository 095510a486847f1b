//! Protocol structure: static blocks and their runtime programs.
//!
//! A [`Block`] is the immutable description of one region of a protocol
//! tree, fixed once a protocol is loaded. A [`Program`] is its runtime
//! instance; program topology mirrors the block tree exactly and lives only
//! as long as one execution of that region (a repeat re-instantiates its
//! child block into a fresh program every iteration).
//!
//! Commands flow top-down (master -> program -> process) and events flow
//! bottom-up, with each composite wrapping child points in its own
//! coordinates on the way up.

pub mod repeat;
pub mod sequence;
pub mod shorthand;

pub use repeat::RepeatBlock;
pub use sequence::SequenceBlock;
pub use shorthand::ShorthandBlock;

use crate::error::{AppResult, LabError};
use crate::eval::EvalStack;
use crate::process::{EventSink, Point, Process, DEFAULT_EVENT_BUFFER};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Expected total duration of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Eta {
    /// Statically known bound.
    Finite(Duration),
    /// Never terminates on its own.
    Forever,
    /// Cannot be determined before run time.
    Unknown,
}

impl Eta {
    /// Compose sequentially: forever dominates, unknown absorbs.
    pub fn plus(self, other: Eta) -> Eta {
        match (self, other) {
            (Eta::Forever, _) | (_, Eta::Forever) => Eta::Forever,
            (Eta::Finite(a), Eta::Finite(b)) => Eta::Finite(a + b),
            _ => Eta::Unknown,
        }
    }

    /// Scale by an iteration count.
    pub fn times(self, count: u64) -> Eta {
        if count == 0 {
            return Eta::Finite(Duration::ZERO);
        }
        match self {
            Eta::Finite(duration) => Eta::Finite(duration.mul_f64(count as f64)),
            other => other,
        }
    }
}

/// Immutable description of one region of a protocol tree.
pub trait Block: Send + Sync {
    /// Instantiate a fresh runtime program for this region.
    fn create_program(&self) -> Arc<dyn Program>;

    /// Serialize the static structure.
    fn export(&self) -> Value;

    /// Check that a point refers to a real position within this region.
    fn validate_point(&self, point: &Point) -> AppResult<()>;

    /// Parse and validate a serialized point.
    fn import_point(&self, data: &Value) -> AppResult<Point> {
        let point: Point = serde_json::from_value(data.clone())?;
        self.validate_point(&point)?;
        Ok(point)
    }

    /// Expected total duration.
    fn eta(&self) -> Eta;
}

/// Runtime instance of a block.
///
/// Control methods take `&self`; a program is shared between the task
/// driving [`Program::run`] and the controller issuing pause/halt.
#[async_trait::async_trait]
pub trait Program: Send + Sync {
    /// Execute this region, emitting events on `sink` until done or halted.
    async fn run(
        &self,
        point: Option<Point>,
        stack: &EvalStack,
        sink: &EventSink,
    ) -> AppResult<()>;

    /// Pause the active leaf under this program.
    async fn pause(&self) -> AppResult<()>;

    /// Resume the paused leaf under this program.
    async fn resume(&self) -> AppResult<()>;

    /// Terminate this program and everything under it.
    async fn halt(&self) -> AppResult<()>;

    /// Relocate execution within this program.
    async fn jump(&self, point: Point) -> AppResult<()>;

    /// Current position, exported for checkpointing.
    fn export_point(&self) -> Point;
}

/// Leaf program wrapping a single process instance.
pub struct LeafProgram {
    process: Arc<dyn Process>,
}

impl LeafProgram {
    /// Wrap a process.
    pub fn new(process: Arc<dyn Process>) -> Self {
        Self { process }
    }
}

#[async_trait::async_trait]
impl Program for LeafProgram {
    async fn run(
        &self,
        point: Option<Point>,
        stack: &EvalStack,
        sink: &EventSink,
    ) -> AppResult<()> {
        self.process.run(point, stack, sink).await
    }

    async fn pause(&self) -> AppResult<()> {
        self.process.pause().await
    }

    async fn resume(&self) -> AppResult<()> {
        self.process.resume().await
    }

    async fn halt(&self) -> AppResult<()> {
        self.process.halt().await
    }

    async fn jump(&self, point: Point) -> AppResult<()> {
        self.process.jump(point).await
    }

    fn export_point(&self) -> Point {
        Point::Leaf(self.process.export())
    }
}

/// Run a child program, wrapping every event point with the child's index
/// before forwarding to the parent sink.
///
/// The child's sender is owned by the run future, so dropping the future on
/// completion closes the relay channel and lets the drain loop finish.
pub(crate) async fn run_wrapped(
    program: Arc<dyn Program>,
    point: Option<Point>,
    stack: EvalStack,
    sink: EventSink,
    index: u64,
) -> AppResult<()> {
    let (child_sink, mut rx) = EventSink::channel(DEFAULT_EVENT_BUFFER);
    let mut run = Some(Box::pin(async move {
        program.run(point, &stack, &child_sink).await
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
                        sink.emit(event.map_point(|p| Point::child(index, Some(p))))
                            .await;
                    }
                }
            }
        } else {
            match rx.recv().await {
                Some(event) => {
                    sink.emit(event.map_point(|p| Point::child(index, Some(p))))
                        .await;
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

// =============================================================================
// Protocol
// =============================================================================

/// A loaded protocol: a named, ordered list of top-level segment blocks.
#[derive(Clone)]
pub struct Protocol {
    /// Display name.
    pub name: String,
    /// Top-level segments, entered in order by the master.
    pub segments: Vec<Arc<dyn Block>>,
}

impl Protocol {
    /// Create an empty protocol.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            segments: Vec::new(),
        }
    }

    /// Append a segment.
    pub fn with_segment(mut self, block: Arc<dyn Block>) -> Self {
        self.segments.push(block);
        self
    }

    /// Serialize the static tree.
    pub fn export(&self) -> Value {
        json!({
            "name": self.name,
            "segments": self.segments.iter().map(|b| b.export()).collect::<Vec<_>>(),
        })
    }

    /// Parse a protocol from its exported representation.
    pub fn import(data: &Value) -> AppResult<Protocol> {
        let name = data
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("unnamed")
            .to_string();
        let segments = data
            .get("segments")
            .and_then(Value::as_array)
            .ok_or_else(|| LabError::InvalidProtocol("missing segments array".into()))?
            .iter()
            .map(import_block)
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Protocol { name, segments })
    }
}

/// Parse a block tree from its exported representation.
///
/// Shorthand wrappers export their child unchanged, so an imported tree
/// contains no shorthand nodes; argument scoping exists only in trees built
/// programmatically.
pub fn import_block(data: &Value) -> AppResult<Arc<dyn Block>> {
    let kind = data
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| LabError::InvalidProtocol(format!("block without type: {data}")))?;
    match kind {
        "timer" => {
            let span = serde_json::from_value(
                data.get("span")
                    .cloned()
                    .ok_or_else(|| LabError::InvalidProtocol("timer without span".into()))?,
            )?;
            Ok(Arc::new(crate::process::timer::TimerBlock { span }))
        }
        "mock" => {
            let steps = serde_json::from_value(
                data.get("steps")
                    .cloned()
                    .ok_or_else(|| LabError::InvalidProtocol("mock without steps".into()))?,
            )?;
            Ok(Arc::new(crate::process::mock::MockBlock {
                steps,
                observer: None,
            }))
        }
        "sequence" => {
            let children = data
                .get("children")
                .and_then(Value::as_array)
                .ok_or_else(|| LabError::InvalidProtocol("sequence without children".into()))?
                .iter()
                .map(import_block)
                .collect::<AppResult<Vec<_>>>()?;
            Ok(Arc::new(SequenceBlock::new(children)))
        }
        "repeat" => {
            let count = serde_json::from_value(
                data.get("count")
                    .cloned()
                    .ok_or_else(|| LabError::InvalidProtocol("repeat without count".into()))?,
            )?;
            let child = import_block(
                data.get("child")
                    .ok_or_else(|| LabError::InvalidProtocol("repeat without child".into()))?,
            )?;
            Ok(Arc::new(RepeatBlock::new(count, child)))
        }
        other => Err(LabError::InvalidProtocol(format!(
            "unknown block type '{other}'"
        ))),
    }
}
