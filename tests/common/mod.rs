//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use rust_lab::error::AppResult;
use rust_lab::eval::EvalStack;
use rust_lab::process::{Event, EventSink, Point};
use rust_lab::protocol::Program;
use rust_lab::runner::{PauseOptions, Runner};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// One observed runner notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunnerCall {
    Start,
    Enter(usize),
    Resume(usize, bool),
    Leave(usize),
    Pause(bool),
}

/// Runner that records every notification and mirrors it onto a channel so
/// tests can await transitions instead of polling.
pub struct RecordingRunner {
    calls: Mutex<Vec<RunnerCall>>,
    tx: mpsc::UnboundedSender<RunnerCall>,
}

impl RecordingRunner {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RunnerCall>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                tx,
            }),
            rx,
        )
    }

    pub fn calls(&self) -> Vec<RunnerCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, call: RunnerCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
        let _ = self.tx.send(call);
    }
}

#[async_trait]
impl Runner for RecordingRunner {
    fn namespace(&self) -> &str {
        "recording"
    }

    async fn on_protocol_start(&self) {
        self.record(RunnerCall::Start);
    }

    async fn enter_segment(&self, index: usize) {
        self.record(RunnerCall::Enter(index));
    }

    async fn resume_segment(&self, index: usize, options: &PauseOptions) {
        self.record(RunnerCall::Resume(index, options.neutral));
    }

    async fn leave_segment(&self, index: usize) {
        self.record(RunnerCall::Leave(index));
    }

    async fn pause(&self, options: &PauseOptions) {
        self.record(RunnerCall::Pause(options.neutral));
    }
}

/// Run a program to completion, collecting every event it emits.
pub async fn run_collect(
    program: Arc<dyn Program>,
    point: Option<Point>,
    stack: EvalStack,
) -> (AppResult<()>, Vec<Event>) {
    let (sink, mut rx) = EventSink::channel(16);
    let handle = tokio::spawn(async move { program.run(point, &stack, &sink).await });
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (handle.await.expect("run task panicked"), events)
}
