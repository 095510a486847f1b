//! Device runners: per-device-family collaborators notified of execution
//! transitions.
//!
//! A runner reacts to segment entry, leave, pause and resume for the device
//! family it manages (valves, temperature control, notifications, ...). The
//! master drives every runner on the chip in lockstep; runners never drive
//! the master.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Policy flag attached to a pause, passed through to every runner.
///
/// `neutral: true` means the pause must not disturb device outputs (a user
/// inspection pause; runners hold their last setpoints). `neutral: false`
/// allows runners to apply their configured safe-state actions, used for
/// engine-initiated error pauses where holding outputs may be unsafe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseOptions {
    /// Whether device outputs are left untouched.
    pub neutral: bool,
}

impl Default for PauseOptions {
    fn default() -> Self {
        Self { neutral: true }
    }
}

/// Collaborator notified of execution transitions for one device family.
///
/// All hooks default to no-ops; runners override what they care about.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Namespace identifying the device family (e.g. "valves", "heater").
    fn namespace(&self) -> &str;

    /// The protocol is starting.
    async fn on_protocol_start(&self) {}

    /// Plain entry into a segment.
    async fn enter_segment(&self, _index: usize) {}

    /// Re-entry into a segment after a pause, with the options the pause
    /// carried.
    async fn resume_segment(&self, _index: usize, _options: &PauseOptions) {}

    /// Leaving a segment.
    async fn leave_segment(&self, _index: usize) {}

    /// Execution is pausing.
    async fn pause(&self, _options: &PauseOptions) {}
}

/// The set of runners a protocol executes against.
#[derive(Clone, Default)]
pub struct Chip {
    runners: Vec<Arc<dyn Runner>>,
}

impl Chip {
    /// Create an empty chip.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a runner.
    pub fn with_runner(mut self, runner: Arc<dyn Runner>) -> Self {
        self.runners.push(runner);
        self
    }

    /// All runners, in registration order.
    pub fn runners(&self) -> &[Arc<dyn Runner>] {
        &self.runners
    }

    /// Look a runner up by namespace.
    pub fn runner(&self, namespace: &str) -> Option<&Arc<dyn Runner>> {
        self.runners
            .iter()
            .find(|runner| runner.namespace() == namespace)
    }
}

/// Runner that logs every transition, used by the demo host.
pub struct TracingRunner {
    namespace: String,
}

impl TracingRunner {
    /// Create a logging runner for a namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl Runner for TracingRunner {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn on_protocol_start(&self) {
        tracing::info!(runner = %self.namespace, "protocol start");
    }

    async fn enter_segment(&self, index: usize) {
        tracing::info!(runner = %self.namespace, segment = index, "enter");
    }

    async fn resume_segment(&self, index: usize, options: &PauseOptions) {
        tracing::info!(
            runner = %self.namespace,
            segment = index,
            neutral = options.neutral,
            "resume"
        );
    }

    async fn leave_segment(&self, index: usize) {
        tracing::info!(runner = %self.namespace, segment = index, "leave");
    }

    async fn pause(&self, options: &PauseOptions) {
        tracing::info!(runner = %self.namespace, neutral = options.neutral, "pause");
    }
}
