//! Radio lifecycle and event routing.
//!
//! The [`Device`] brings the controller and host stack up, hands the stack an
//! [`EventSink`] for its three callback entry points and runs a dispatcher
//! task that routes every event to the bound [`Server`]. It holds only a weak
//! reference to that server; events arriving while no server is bound are
//! dropped.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::ble::event::{GapEvent, RadioEvent};
use crate::ble::stack::{Controller, EventSink, GattStack, StackResult};
use crate::config::GattConfig;
use crate::error::{Error, Result};
use crate::gatt::server::Server;

/// Lifecycle state of the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceState {
    /// Not brought up.
    #[default]
    Uninitialized,
    /// Brought up and routing events.
    Ready,
    /// A bring-up step failed; `deinit` releases what completed.
    Failed,
    /// The controller was released and cannot be brought up again.
    Retired,
}

impl DeviceState {
    /// Check if the radio is up.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Uninitialized"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed => write!(f, "Failed"),
            Self::Retired => write!(f, "Retired"),
        }
    }
}

/// Bring-up steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitStep {
    /// Persistent storage.
    Storage,
    /// Controller initialization.
    ControllerInit,
    /// Transmit power.
    TxPower,
    /// Controller enable.
    ControllerEnable,
    /// Host stack initialization.
    StackInit,
    /// Host stack enable.
    StackEnable,
    /// GAP callback registration.
    GapCallback,
    /// GATT client callback registration.
    GattcCallback,
    /// GATT server callback registration.
    GattsCallback,
    /// Device name.
    DeviceName,
    /// Pairing I/O capability.
    IoCapability,
}

impl InitStep {
    /// Name of the stack request performing this step.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Storage => "init_storage",
            Self::ControllerInit => "controller_init",
            Self::TxPower => "set_tx_power",
            Self::ControllerEnable => "controller_enable",
            Self::StackInit => "stack_init",
            Self::StackEnable => "stack_enable",
            Self::GapCallback => "register_gap_callback",
            Self::GattcCallback => "register_gattc_callback",
            Self::GattsCallback => "register_gatts_callback",
            Self::DeviceName => "set_device_name",
            Self::IoCapability => "set_io_capability",
        }
    }
}

/// Routes events to the bound server.
struct Router {
    stack: Arc<dyn GattStack>,
    server: RwLock<Weak<Server>>,
}

impl Router {
    fn server(&self) -> Option<Arc<Server>> {
        self.server.read().upgrade().filter(|s| s.is_bound())
    }

    fn dispatch(&self, event: RadioEvent) {
        match event {
            RadioEvent::Gap(event) => {
                if let GapEvent::SecurityRequest { remote } = &event {
                    debug!("Accepting security request");
                    if let Err(code) = self.stack.security_response(remote, true) {
                        error!("security_response failed: {}", code);
                    }
                }
                if let Some(server) = self.server() {
                    server.handle_gap_event(&event);
                }
            }
            RadioEvent::Client(event) => {
                debug!(code = event.code, gattc_if = event.gattc_if, "GATT client event ignored");
            }
            RadioEvent::Server { gatts_if, event } => match self.server() {
                Some(server) => server.handle_event(gatts_if, &event),
                None => trace!(event = event.name(), "No server bound, event dropped"),
            },
        }
    }
}

/// The radio device.
pub struct Device {
    controller: Arc<dyn Controller>,
    stack: Arc<dyn GattStack>,
    config: GattConfig,
    router: Arc<Router>,
    state: RwLock<DeviceState>,
    completed: Mutex<Vec<InitStep>>,
    name: RwLock<Option<String>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    is_running: Arc<AtomicBool>,
}

impl Device {
    /// Create a device with the default configuration.
    pub fn new(controller: Arc<dyn Controller>, stack: Arc<dyn GattStack>) -> Self {
        Self::with_config(controller, stack, GattConfig::default())
    }

    /// Create a device with `config`.
    pub fn with_config(
        controller: Arc<dyn Controller>,
        stack: Arc<dyn GattStack>,
        config: GattConfig,
    ) -> Self {
        Self {
            controller,
            router: Arc::new(Router {
                stack: stack.clone(),
                server: RwLock::new(Weak::new()),
            }),
            stack,
            config,
            state: RwLock::new(DeviceState::Uninitialized),
            completed: Mutex::new(Vec::new()),
            name: RwLock::new(None),
            dispatcher: Mutex::new(None),
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DeviceState {
        *self.state.read()
    }

    /// Name set during bring-up.
    pub fn name(&self) -> Option<String> {
        self.name.read().clone()
    }

    /// The configuration.
    pub fn config(&self) -> &GattConfig {
        &self.config
    }

    /// The GATT stack, for building a [`Server`].
    pub fn stack(&self) -> Arc<dyn GattStack> {
        self.stack.clone()
    }

    /// The bound server, if any.
    pub fn server(&self) -> Option<Arc<Server>> {
        self.router.server()
    }

    /// Bring-up steps completed so far.
    pub fn completed_steps(&self) -> Vec<InitStep> {
        self.completed.lock().clone()
    }

    /// Create a server on this device's stack and configuration.
    pub fn create_server(&self) -> Arc<Server> {
        Server::new(self.stack.clone(), self.config.clone())
    }

    /// Bring the radio up and start routing events.
    ///
    /// Steps run in a fixed order; the first failure stops the sequence and
    /// leaves the device [`Failed`](DeviceState::Failed) with the completed
    /// steps recorded for [`deinit`](Self::deinit).
    ///
    /// # Errors
    ///
    /// - [`Error::ControllerRetired`] once the controller was released
    /// - [`Error::DeviceNotReady`] after a failed bring-up that was not
    ///   released with `deinit`
    /// - [`Error::Stack`] naming the failed step
    pub async fn init(&self, name: &str) -> Result<()> {
        match self.state() {
            DeviceState::Ready => {
                debug!("Device already initialized");
                return Ok(());
            }
            DeviceState::Retired => return Err(Error::ControllerRetired),
            DeviceState::Failed => {
                warn!("Previous bring-up failed; deinit before retrying");
                return Err(Error::DeviceNotReady);
            }
            DeviceState::Uninitialized => {}
        }

        info!(name, "Initializing radio");
        let (sink, rx) = EventSink::channel();
        self.spawn_dispatcher(rx);

        if let Err(e) = self.bring_up(name, sink) {
            error!("Radio bring-up failed: {}", e);
            self.stop_dispatcher();
            *self.state.write() = DeviceState::Failed;
            return Err(e);
        }

        *self.name.write() = Some(name.to_string());
        *self.state.write() = DeviceState::Ready;
        tokio::time::sleep(self.config.settle_delay).await;
        info!("Radio ready");
        Ok(())
    }

    fn bring_up(&self, name: &str, sink: EventSink) -> Result<()> {
        let c = self.controller.as_ref();
        self.step(InitStep::Storage, || c.init_storage())?;
        self.step(InitStep::ControllerInit, || c.controller_init())?;
        self.step(InitStep::TxPower, || c.set_tx_power(self.config.tx_power))?;
        self.step(InitStep::ControllerEnable, || c.controller_enable())?;
        self.step(InitStep::StackInit, || c.stack_init())?;
        self.step(InitStep::StackEnable, || c.stack_enable())?;
        self.step(InitStep::GapCallback, || c.register_gap_callback(sink.clone()))?;
        self.step(InitStep::GattcCallback, || c.register_gattc_callback(sink.clone()))?;
        self.step(InitStep::GattsCallback, || c.register_gatts_callback(sink))?;
        self.step(InitStep::DeviceName, || c.set_device_name(name))?;
        self.step(InitStep::IoCapability, || {
            c.set_io_capability(self.config.io_capability)
        })?;
        Ok(())
    }

    fn step(&self, step: InitStep, f: impl FnOnce() -> StackResult) -> Result<()> {
        trace!(step = step.operation(), "Bring-up step");
        f().map_err(|code| {
            error!(step = step.operation(), "{}", code);
            Error::stack(step.operation(), code)
        })?;
        self.completed.lock().push(step);
        Ok(())
    }

    /// Release the radio, reversing exactly the bring-up steps that
    /// completed: stack disable, stack deinit, controller disable,
    /// controller deinit.
    ///
    /// Releasing the controller retires the device for good.
    ///
    /// # Errors
    ///
    /// Returns the first failing release step; the remaining steps still
    /// run.
    pub fn deinit(&self) -> Result<()> {
        if matches!(
            self.state(),
            DeviceState::Uninitialized | DeviceState::Retired
        ) {
            return Ok(());
        }

        info!("Releasing radio");
        self.stop_dispatcher();
        if let Some(server) = self.router.server() {
            server.set_bound(false);
        }
        *self.router.server.write() = Weak::new();

        let completed = std::mem::take(&mut *self.completed.lock());
        let c = self.controller.as_ref();
        let mut first_error = None;
        let mut retired = false;

        for step in completed.iter().rev() {
            let (operation, result) = match step {
                InitStep::StackEnable => ("stack_disable", c.stack_disable()),
                InitStep::StackInit => ("stack_deinit", c.stack_deinit()),
                InitStep::ControllerEnable => ("controller_disable", c.controller_disable()),
                InitStep::ControllerInit => {
                    retired = true;
                    ("controller_deinit", c.controller_deinit())
                }
                _ => continue,
            };
            if let Err(code) = result {
                error!(operation, "{}", code);
                first_error.get_or_insert(Error::stack(operation, code));
            }
        }

        *self.state.write() = if retired {
            DeviceState::Retired
        } else {
            DeviceState::Uninitialized
        };

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Bind `server` as the receiver of all events.
    ///
    /// # Errors
    ///
    /// - [`Error::DeviceNotReady`] if the radio is not up
    /// - [`Error::ServerAlreadyBound`] if another live server is bound
    pub fn attach_server(&self, server: &Arc<Server>) -> Result<()> {
        if !self.state().is_ready() {
            return Err(Error::DeviceNotReady);
        }

        let mut slot = self.router.server.write();
        if let Some(existing) = slot.upgrade() {
            if existing.is_bound() && !Arc::ptr_eq(&existing, server) {
                return Err(Error::ServerAlreadyBound);
            }
        }
        *slot = Arc::downgrade(server);
        server.set_bound(true);
        Ok(())
    }

    /// Unbind `server` if it is the bound one.
    pub fn detach_server(&self, server: &Arc<Server>) {
        let mut slot = self.router.server.write();
        if slot.upgrade().is_some_and(|s| Arc::ptr_eq(&s, server)) {
            *slot = Weak::new();
        }
        server.set_bound(false);
    }

    /// Route one event as the dispatcher task would.
    pub fn dispatch(&self, event: RadioEvent) {
        self.router.dispatch(event);
    }

    fn spawn_dispatcher(&self, mut rx: mpsc::UnboundedReceiver<RadioEvent>) {
        self.is_running.store(true, Ordering::SeqCst);
        let router = self.router.clone();
        let is_running = self.is_running.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !is_running.load(Ordering::SeqCst) {
                    break;
                }
                router.dispatch(event);
            }
            debug!("Event dispatcher ended");
        });

        *self.dispatcher.lock() = Some(handle);
    }

    fn stop_dispatcher(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.stop_dispatcher();
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("state", &self.state())
            .field("name", &self.name())
            .field("completed", &self.completed.lock().len())
            .finish()
    }
}
