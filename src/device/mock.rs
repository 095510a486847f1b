//! Scriptable device controller for exercising the adapter without
//! hardware.
//!
//! Tests script per-address outcomes (accept, reject, error, hang) and
//! observe the controller hooks both as a recorded log and as a broadcast
//! stream, which keeps timing-sensitive assertions free of polling.

use crate::device::{Device, DeviceController, DeviceInfo, LossHandle};
use crate::error::{AppResult, LabError};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

/// How a creation attempt at an address behaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MockOutcome {
    /// Create a device.
    Accept,
    /// No device answers (`Ok(None)`).
    Reject,
    /// The attempt itself errors.
    Error,
    /// Never complete; exercises the attempt timeout.
    Hang,
}

/// Observed controller hook invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hook {
    /// `on_connection` fired.
    Connection {
        /// Whether the connection came from a reconnection loop.
        reconnection: bool,
    },
    /// `on_connection_fail` fired.
    ConnectionFail {
        /// Whether the attempt came from a reconnection loop.
        reconnection: bool,
    },
    /// `on_disconnection` fired.
    Disconnection {
        /// Whether the device itself reported the loss.
        lost: bool,
    },
}

/// Simulated device handle.
pub struct MockDevice {
    address: String,
    closed: AtomicBool,
    /// Serializes request/response pairs, one command in flight at a time.
    io: tokio::sync::Mutex<()>,
    loss: LossHandle,
}

impl MockDevice {
    /// Issue a command and wait for its response.
    pub async fn query(&self, command: &str) -> AppResult<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LabError::DeviceDisconnected);
        }
        let _io = self.io.lock().await;
        Ok(format!("ok {command}"))
    }

    /// Simulate the physical connection dropping out from under the driver.
    pub async fn drop_connection(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.loss.lost().await;
    }
}

#[async_trait]
impl Device for MockDevice {
    fn id(&self) -> &str {
        &self.address
    }

    fn nodes(&self) -> Vec<String> {
        vec!["value".to_string(), "enabled".to_string()]
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MockState {
    devices: Vec<DeviceInfo>,
    outcomes: HashMap<String, MockOutcome>,
    remaining_failures: HashMap<String, u32>,
    validate: bool,
    created: Vec<Arc<MockDevice>>,
    hooks: Vec<Hook>,
}

/// Scriptable [`DeviceController`].
pub struct MockController {
    state: Mutex<MockState>,
    hooks_tx: broadcast::Sender<Hook>,
}

impl Default for MockController {
    fn default() -> Self {
        Self::new()
    }
}

impl MockController {
    /// Create a controller with no devices.
    pub fn new() -> Self {
        let (hooks_tx, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(MockState {
                devices: Vec::new(),
                outcomes: HashMap::new(),
                remaining_failures: HashMap::new(),
                validate: true,
                created: Vec::new(),
                hooks: Vec::new(),
            }),
            hooks_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an enumerable device address.
    pub fn add_device(&self, address: impl Into<String>) {
        self.lock().devices.push(DeviceInfo {
            address: address.into(),
            label: None,
        });
    }

    /// Script the outcome for creation attempts at an address.
    pub fn set_outcome(&self, address: impl Into<String>, outcome: MockOutcome) {
        self.lock().outcomes.insert(address.into(), outcome);
    }

    /// Reject this many attempts at an address before accepting.
    pub fn fail_times(&self, address: impl Into<String>, times: u32) {
        self.lock()
            .remaining_failures
            .insert(address.into(), times);
    }

    /// Whether `test_device` passes.
    pub fn set_validate(&self, validate: bool) {
        self.lock().validate = validate;
    }

    /// All hook invocations so far, in order.
    pub fn hook_log(&self) -> Vec<Hook> {
        self.lock().hooks.clone()
    }

    /// Devices created so far, in creation order.
    pub fn created_devices(&self) -> Vec<Arc<MockDevice>> {
        self.lock().created.clone()
    }

    /// Live stream of hook invocations.
    pub fn subscribe_hooks(&self) -> broadcast::Receiver<Hook> {
        self.hooks_tx.subscribe()
    }

    fn record(&self, hook: Hook) {
        self.lock().hooks.push(hook);
        let _ = self.hooks_tx.send(hook);
    }
}

#[async_trait]
impl DeviceController for MockController {
    async fn create_device(
        &self,
        address: &str,
        on_close: LossHandle,
    ) -> Result<Option<Arc<dyn Device>>> {
        let outcome = {
            let mut state = self.lock();
            if let Some(remaining) = state.remaining_failures.get_mut(address) {
                if *remaining > 0 {
                    *remaining -= 1;
                    MockOutcome::Reject
                } else {
                    MockOutcome::Accept
                }
            } else if let Some(outcome) = state.outcomes.get(address) {
                *outcome
            } else if state.devices.iter().any(|info| info.address == address) {
                MockOutcome::Accept
            } else {
                MockOutcome::Reject
            }
        };
        match outcome {
            MockOutcome::Reject => Ok(None),
            MockOutcome::Error => Err(anyhow!("no response from {address}")),
            MockOutcome::Hang => {
                std::future::pending::<()>().await;
                Ok(None)
            }
            MockOutcome::Accept => {
                let device = Arc::new(MockDevice {
                    address: address.to_string(),
                    closed: AtomicBool::new(false),
                    io: tokio::sync::Mutex::new(()),
                    loss: on_close,
                });
                self.lock().created.push(device.clone());
                Ok(Some(device))
            }
        }
    }

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.lock().devices.clone())
    }

    async fn test_device(&self, _device: &Arc<dyn Device>) -> Result<bool> {
        Ok(self.lock().validate)
    }

    async fn on_connection(&self, reconnection: bool) {
        self.record(Hook::Connection { reconnection });
    }

    async fn on_connection_fail(&self, reconnection: bool) {
        self.record(Hook::ConnectionFail { reconnection });
    }

    async fn on_disconnection(&self, lost: bool) {
        self.record(Hook::Disconnection { lost });
    }
}
