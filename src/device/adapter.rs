//! Generic connection-lifecycle supervisor for one logical device.
//!
//! The adapter keeps a device handle alive across physical connect and
//! disconnect cycles, decoupled from business logic:
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──ok──► Connected
//!       ▲                        │ fail              │ loss
//!       └────────────────────────┘                   ▼
//!       ▲                              Disconnected ──► Connecting (reconnecting)
//!       │                                    (when reconnection is enabled)
//!    Stopped ◄── stop() from any state
//! ```
//!
//! Device creation and validation share one bounded timeout; exceeding it is
//! treated identically to a synchronous failure and the candidate is not
//! retried within the same attempt. At most one reconnection loop runs at a
//! time; spawning a new one replaces and cancels the old.

use crate::device::{Device, DeviceController};
use crate::error::{AppResult, LabError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Supervision parameters for one adapter.
#[derive(Clone, Debug)]
pub struct AdapterOptions {
    /// Fixed address to connect to; `None` iterates the controller's
    /// device list instead.
    pub address: Option<String>,
    /// Whether a device-initiated loss starts a reconnection loop.
    pub reconnect: bool,
    /// Bound on device creation plus validation, per candidate.
    pub connect_timeout: Duration,
    /// Sleep between failed reconnection attempts.
    pub retry_interval: Duration,
    /// Whether the reconnection loop waits one interval before its first
    /// attempt.
    pub initial_wait: bool,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            address: None,
            reconnect: true,
            connect_timeout: Duration::from_secs(1),
            retry_interval: Duration::from_secs(1),
            initial_wait: false,
        }
    }
}

impl AdapterOptions {
    /// Pin the adapter to a fixed address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Enable or disable loss-triggered reconnection.
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Adapter lifecycle phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterPhase {
    /// No device attached.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting {
        /// Whether the attempt belongs to a reconnection loop.
        reconnecting: bool,
    },
    /// A validated device is attached.
    Connected,
    /// Terminal; the adapter will not connect again.
    Stopped,
}

struct ReconnectTask {
    id: u64,
    handle: JoinHandle<()>,
}

struct AdapterState {
    phase: AdapterPhase,
    device: Option<Arc<dyn Device>>,
    reconnect_task: Option<ReconnectTask>,
    next_task_id: u64,
}

struct AdapterInner {
    controller: Arc<dyn DeviceController>,
    options: AdapterOptions,
    state: Mutex<AdapterState>,
    /// Serializes whole connection attempts; callbacks fire outside it.
    connect_gate: tokio::sync::Mutex<()>,
    span: tracing::Span,
}

impl AdapterInner {
    fn lock(&self) -> MutexGuard<'_, AdapterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle given to drivers for reporting device-initiated connection loss.
#[derive(Clone)]
pub struct LossHandle {
    inner: Weak<AdapterInner>,
}

impl LossHandle {
    /// Report that the physical connection dropped.
    ///
    /// Safe to call more than once and after `stop()`; only the first report
    /// against a connected adapter has any effect.
    pub async fn lost(&self) {
        if let Some(inner) = self.inner.upgrade() {
            DeviceAdapter::handle_loss(inner).await;
        }
    }
}

/// Connection-lifecycle supervisor for one logical device.
#[derive(Clone)]
pub struct DeviceAdapter {
    inner: Arc<AdapterInner>,
}

impl DeviceAdapter {
    /// Create a supervisor over the given controller.
    pub fn new(
        name: impl Into<String>,
        controller: Arc<dyn DeviceController>,
        options: AdapterOptions,
    ) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(AdapterInner {
                controller,
                options,
                state: Mutex::new(AdapterState {
                    phase: AdapterPhase::Disconnected,
                    device: None,
                    reconnect_task: None,
                    next_task_id: 0,
                }),
                connect_gate: tokio::sync::Mutex::new(()),
                span: tracing::info_span!("adapter", device = %name),
            }),
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> AdapterPhase {
        self.inner.lock().phase
    }

    /// Whether a validated device is attached.
    pub fn connected(&self) -> bool {
        self.phase() == AdapterPhase::Connected
    }

    /// The attached device; fails while not connected.
    pub fn device(&self) -> AppResult<Arc<dyn Device>> {
        let state = self.inner.lock();
        match state.phase {
            AdapterPhase::Connected => {
                state.device.clone().ok_or(LabError::DeviceDisconnected)
            }
            _ => Err(LabError::DeviceDisconnected),
        }
    }

    /// Attempt one connection.
    ///
    /// Tries the configured address, or each enumerated candidate in order
    /// until one succeeds. Returns whether a device is attached; failures of
    /// individual candidates are absorbed and reported through
    /// `on_connection_fail`.
    pub async fn connect(&self) -> AppResult<bool> {
        Self::connect_inner(&self.inner, false).await
    }

    async fn connect_inner(inner: &Arc<AdapterInner>, reconnecting: bool) -> AppResult<bool> {
        let _gate = inner.connect_gate.lock().await;
        {
            let mut state = inner.lock();
            match state.phase {
                AdapterPhase::Stopped => return Err(LabError::AdapterStopped),
                AdapterPhase::Connected => return Ok(true),
                _ => state.phase = AdapterPhase::Connecting { reconnecting },
            }
        }
        let candidates: Vec<String> = match &inner.options.address {
            Some(address) => vec![address.clone()],
            None => match inner.controller.list_devices().await {
                Ok(infos) => infos.into_iter().map(|info| info.address).collect(),
                Err(error) => {
                    tracing::warn!(parent: &inner.span, %error, "device enumeration failed");
                    Vec::new()
                }
            },
        };
        for address in candidates {
            let Some(device) = Self::try_address(inner, &address).await else {
                continue;
            };
            let accepted = {
                let mut state = inner.lock();
                if state.phase == AdapterPhase::Stopped {
                    false
                } else {
                    state.device = Some(device.clone());
                    state.phase = AdapterPhase::Connected;
                    true
                }
            };
            if !accepted {
                let _ = device.close().await;
                return Err(LabError::AdapterStopped);
            }
            tracing::info!(
                parent: &inner.span,
                address = %address,
                reconnection = reconnecting,
                "device connected"
            );
            // The handler may disconnect again; that is honored, and the
            // attempt itself still counts as a success.
            inner.controller.on_connection(reconnecting).await;
            return Ok(true);
        }
        {
            let mut state = inner.lock();
            if state.phase != AdapterPhase::Stopped {
                state.phase = AdapterPhase::Disconnected;
            }
        }
        inner.controller.on_connection_fail(reconnecting).await;
        Ok(false)
    }

    /// One bounded create-and-validate attempt against a single address.
    async fn try_address(inner: &Arc<AdapterInner>, address: &str) -> Option<Arc<dyn Device>> {
        let loss = LossHandle {
            inner: Arc::downgrade(inner),
        };
        let attempt = async {
            let device = match inner.controller.create_device(address, loss).await {
                Ok(Some(device)) => device,
                Ok(None) => return None,
                Err(error) => {
                    tracing::debug!(parent: &inner.span, address, %error, "device creation failed");
                    return None;
                }
            };
            match inner.controller.test_device(&device).await {
                Ok(true) => Some(device),
                Ok(false) => {
                    tracing::debug!(parent: &inner.span, address, "device failed validation");
                    let _ = device.close().await;
                    None
                }
                Err(error) => {
                    tracing::debug!(parent: &inner.span, address, %error, "device validation failed");
                    let _ = device.close().await;
                    None
                }
            }
        };
        match timeout(inner.options.connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(parent: &inner.span, address, "connection attempt timed out");
                None
            }
        }
    }

    /// Start a reconnection loop, replacing any prior one.
    ///
    /// The loop retries the connect procedure every `interval` until it
    /// succeeds or is cancelled; errors inside it are logged, never
    /// propagated.
    pub fn reconnect(&self, initial_wait: bool, interval: Duration) -> AppResult<()> {
        if self.phase() == AdapterPhase::Stopped {
            return Err(LabError::AdapterStopped);
        }
        Self::spawn_reconnect(&self.inner, initial_wait, interval);
        Ok(())
    }

    fn spawn_reconnect(inner: &Arc<AdapterInner>, initial_wait: bool, interval: Duration) {
        let id = {
            let mut state = inner.lock();
            state.next_task_id += 1;
            state.next_task_id
        };
        let weak = Arc::downgrade(inner);
        let handle = tokio::spawn(async move {
            if initial_wait {
                sleep(interval).await;
            }
            loop {
                let Some(inner) = weak.upgrade() else { break };
                match Self::connect_inner(&inner, true).await {
                    Ok(true) => break,
                    Ok(false) => {}
                    // Stopped while we were attempting.
                    Err(_) => break,
                }
                drop(inner);
                sleep(interval).await;
            }
            // The loop always clears its own handle on exit.
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.lock();
                if state
                    .reconnect_task
                    .as_ref()
                    .is_some_and(|task| task.id == id)
                {
                    state.reconnect_task = None;
                }
            }
        });
        let mut state = inner.lock();
        if let Some(previous) = state.reconnect_task.replace(ReconnectTask { id, handle }) {
            previous.handle.abort();
        }
    }

    /// Device-initiated loss: detach, notify once, optionally reconnect.
    async fn handle_loss(inner: Arc<AdapterInner>) {
        let detached = {
            let mut state = inner.lock();
            match state.phase {
                AdapterPhase::Connected => {
                    state.device = None;
                    state.phase = AdapterPhase::Disconnected;
                    true
                }
                _ => false,
            }
        };
        if !detached {
            return;
        }
        tracing::warn!(parent: &inner.span, "device connection lost");
        inner.controller.on_disconnection(true).await;
        if inner.options.reconnect {
            Self::spawn_reconnect(
                &inner,
                inner.options.initial_wait,
                inner.options.retry_interval,
            );
        }
    }

    /// Detach and close any device, cancel any reconnection loop, and enter
    /// the terminal `Stopped` phase.
    pub async fn stop(&self) {
        let (device, task) = {
            let mut state = self.inner.lock();
            state.phase = AdapterPhase::Stopped;
            (state.device.take(), state.reconnect_task.take())
        };
        if let Some(task) = task {
            task.handle.abort();
        }
        if let Some(device) = device {
            if let Err(error) = device.close().await {
                tracing::warn!(parent: &self.inner.span, %error, "device close failed");
            }
            self.inner.controller.on_disconnection(false).await;
        }
        tracing::info!(parent: &self.inner.span, "adapter stopped");
    }
}
