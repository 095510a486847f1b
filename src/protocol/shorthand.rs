//! Pass-through composite wrapping exactly one child with a named argument.
//!
//! A shorthand is transparent for export and checkpointing purposes (its
//! exported tree and points are the child's own, unchanged) but opaque for
//! scoping: the named argument is visible to the wrapped subtree only.

use crate::error::AppResult;
use crate::eval::EvalStack;
use crate::process::{EventSink, Point};
use crate::protocol::{Block, Eta, Program};
use serde_json::Value;
use std::sync::Arc;

/// Argument-injecting wrapper around a single child block.
pub struct ShorthandBlock {
    name: String,
    argument: Value,
    child: Arc<dyn Block>,
}

impl ShorthandBlock {
    /// Wrap `child`, binding `name` to `argument` for its subtree.
    pub fn new(name: impl Into<String>, argument: Value, child: Arc<dyn Block>) -> Self {
        Self {
            name: name.into(),
            argument,
            child,
        }
    }
}

impl Block for ShorthandBlock {
    fn create_program(&self) -> Arc<dyn Program> {
        Arc::new(ShorthandProgram {
            name: self.name.clone(),
            argument: self.argument.clone(),
            program: self.child.create_program(),
        })
    }

    fn export(&self) -> Value {
        self.child.export()
    }

    fn validate_point(&self, point: &Point) -> AppResult<()> {
        self.child.validate_point(point)
    }

    fn eta(&self) -> Eta {
        self.child.eta()
    }
}

/// Runtime instance of a [`ShorthandBlock`].
pub struct ShorthandProgram {
    name: String,
    argument: Value,
    program: Arc<dyn Program>,
}

#[async_trait::async_trait]
impl Program for ShorthandProgram {
    async fn run(
        &self,
        point: Option<Point>,
        stack: &EvalStack,
        sink: &EventSink,
    ) -> AppResult<()> {
        let scoped = stack.child_with(self.name.as_str(), self.argument.clone());
        self.program.run(point, &scoped, sink).await
    }

    async fn pause(&self) -> AppResult<()> {
        self.program.pause().await
    }

    async fn resume(&self) -> AppResult<()> {
        self.program.resume().await
    }

    async fn halt(&self) -> AppResult<()> {
        self.program.halt().await
    }

    async fn jump(&self, point: Point) -> AppResult<()> {
        self.program.jump(point).await
    }

    fn export_point(&self) -> Point {
        self.program.export_point()
    }
}
