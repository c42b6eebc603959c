//! In-memory radio stack.
//!
//! [`LoopbackStack`] implements both [`GattStack`] and [`Controller`] without
//! hardware. Requests are recorded and answered with the completion events a
//! real stack would emit, handles are allocated from per-service ranges, and
//! a set of peer helpers plays the remote client. Used by the tests and the
//! demo.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::ble::event::{
    AttrHandle, ExecWriteFlag, GapEvent, GattIf, GattStatus, GattcEvent, GattsEvent, PeerAddress,
};
use crate::ble::stack::{
    AdvertisingParams, Controller, EventSink, GattResponse, GattStack, IoCapability, StackError,
    StackResult, TxPower,
};
use crate::ble::uuid::BleUuid;
use crate::gatt::properties::{Permissions, Properties};

/// First interface id handed out.
const FIRST_GATTS_IF: GattIf = 3;
/// First service handle handed out.
const FIRST_HANDLE: AttrHandle = 40;
/// How long [`LoopbackStack::wait_for`] waits.
const WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// A request received by the loopback stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackCall {
    /// `register_app`.
    RegisterApp {
        /// Application id.
        app_id: u16,
    },
    /// `unregister_app`.
    UnregisterApp {
        /// Interface id.
        gatts_if: GattIf,
    },
    /// `create_service`.
    CreateService {
        /// Service UUID.
        uuid: BleUuid,
        /// Reserved handle count.
        num_handles: u16,
    },
    /// `add_characteristic`.
    AddCharacteristic {
        /// Owning service.
        service_handle: AttrHandle,
        /// Characteristic UUID.
        uuid: BleUuid,
        /// Access permissions.
        permissions: Permissions,
        /// Declared properties.
        properties: Properties,
        /// Initial value.
        value: Bytes,
    },
    /// `add_descriptor`.
    AddDescriptor {
        /// Owning service.
        service_handle: AttrHandle,
        /// Descriptor UUID.
        uuid: BleUuid,
        /// Initial value.
        value: Bytes,
    },
    /// `start_service`.
    StartService {
        /// Service handle.
        service_handle: AttrHandle,
    },
    /// `send_response`.
    SendResponse {
        /// Connection id.
        conn_id: u16,
        /// Answered transaction.
        trans_id: u32,
        /// Response status.
        status: GattStatus,
        /// Response payload.
        response: GattResponse,
    },
    /// `send_indicate`.
    SendIndicate {
        /// Connection id.
        conn_id: u16,
        /// Attribute handle.
        handle: AttrHandle,
        /// Pushed bytes.
        value: Bytes,
        /// Indication rather than notification.
        need_confirm: bool,
    },
    /// `set_advertising_data`.
    SetAdvertisingData {
        /// Raw payload.
        payload: Bytes,
        /// Scan response rather than advertisement.
        scan_response: bool,
    },
    /// `start_advertising`.
    StartAdvertising,
    /// `stop_advertising`.
    StopAdvertising,
    /// `security_response`.
    SecurityResponse {
        /// Peer address.
        remote: PeerAddress,
        /// Accepted.
        accept: bool,
    },
    /// Any [`Controller`] request, by operation name.
    Lifecycle(&'static str),
}

/// One entry of the simulated attribute table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Assigned handle.
    pub handle: AttrHandle,
    /// Owning service.
    pub service_handle: AttrHandle,
    /// Attribute UUID.
    pub uuid: BleUuid,
    /// For descriptors, the UUID of the characteristic they follow.
    pub owner: Option<BleUuid>,
}

#[derive(Debug)]
struct ServiceRange {
    uuid: BleUuid,
    end: AttrHandle,
    cursor: AttrHandle,
    last_characteristic: Option<BleUuid>,
}

#[derive(Debug, Default)]
struct LoopbackState {
    calls: Vec<StackCall>,
    gap: Option<EventSink>,
    gattc: Option<EventSink>,
    gatts: Option<EventSink>,
    next_gatts_if: GattIf,
    apps: HashMap<u16, GattIf>,
    next_handle: AttrHandle,
    services: HashMap<AttrHandle, ServiceRange>,
    attributes: Vec<Attribute>,
    failures: HashMap<&'static str, StackError>,
    rejections: HashMap<&'static str, GattStatus>,
    next_trans_id: u32,
    withhold_confirm: bool,
    device_name: Option<String>,
    controller_released: bool,
}

/// An in-memory [`GattStack`] and [`Controller`].
#[derive(Debug)]
pub struct LoopbackStack {
    state: Mutex<LoopbackState>,
    changed: Notify,
}

impl Default for LoopbackStack {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackStack {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoopbackState {
                next_gatts_if: FIRST_GATTS_IF,
                next_handle: FIRST_HANDLE,
                next_trans_id: 1,
                ..Default::default()
            }),
            changed: Notify::new(),
        }
    }

    /// Make the next `operation` request return `code`.
    pub fn fail_next(&self, operation: &'static str, code: StackError) {
        self.state.lock().failures.insert(operation, code);
    }

    /// Make the completion event of the next `operation` request carry
    /// `status`.
    pub fn reject_next(&self, operation: &'static str, status: GattStatus) {
        self.state.lock().rejections.insert(operation, status);
    }

    /// Stop the peer from confirming indications.
    pub fn withhold_confirmations(&self, withhold: bool) {
        self.state.lock().withhold_confirm = withhold;
    }

    /// Every request received so far.
    pub fn calls(&self) -> Vec<StackCall> {
        self.state.lock().calls.clone()
    }

    /// Forget recorded requests.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Number of recorded requests matching `pred`.
    pub fn count(&self, pred: impl Fn(&StackCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// Number of `start_advertising` requests.
    pub fn advertising_starts(&self) -> usize {
        self.count(|c| matches!(c, StackCall::StartAdvertising))
    }

    /// Number of `stop_advertising` requests.
    pub fn advertising_stops(&self) -> usize {
        self.count(|c| matches!(c, StackCall::StopAdvertising))
    }

    /// Responses sent for transaction `trans_id`.
    pub fn responses_to(&self, trans_id: u32) -> Vec<(GattStatus, GattResponse)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                StackCall::SendResponse {
                    trans_id: t,
                    status,
                    response,
                    ..
                } if *t == trans_id => Some((*status, response.clone())),
                _ => None,
            })
            .collect()
    }

    /// Values pushed with notifications or indications.
    pub fn pushed_values(&self) -> Vec<Bytes> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                StackCall::SendIndicate { value, .. } => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    /// The simulated attribute table.
    pub fn attributes(&self) -> Vec<Attribute> {
        self.state.lock().attributes.clone()
    }

    /// Handle of the first characteristic value with `uuid`.
    pub fn handle_of(&self, uuid: &BleUuid) -> Option<AttrHandle> {
        self.state
            .lock()
            .attributes
            .iter()
            .find(|a| a.owner.is_none() && a.uuid == *uuid)
            .map(|a| a.handle)
    }

    /// Handle of descriptor `uuid` following characteristic `owner`.
    pub fn descriptor_handle_of(&self, owner: &BleUuid, uuid: &BleUuid) -> Option<AttrHandle> {
        self.state
            .lock()
            .attributes
            .iter()
            .find(|a| a.owner.as_ref() == Some(owner) && a.uuid == *uuid)
            .map(|a| a.handle)
    }

    /// Name set through the controller.
    pub fn device_name(&self) -> Option<String> {
        self.state.lock().device_name.clone()
    }

    /// Wait until the recorded requests satisfy `pred`. Returns `false`
    /// after one second without success.
    pub async fn wait_for(&self, pred: impl Fn(&[StackCall]) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let changed = self.changed.notified();
            if pred(&self.state.lock().calls) {
                return true;
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return false;
            }
        }
    }

    /// Wait for a response to `trans_id`.
    pub async fn wait_for_response(&self, trans_id: u32) -> Option<(GattStatus, GattResponse)> {
        let found = self
            .wait_for(|calls| {
                calls
                    .iter()
                    .any(|c| matches!(c, StackCall::SendResponse { trans_id: t, .. } if *t == trans_id))
            })
            .await;
        if found {
            self.responses_to(trans_id).into_iter().next()
        } else {
            None
        }
    }

    // Peer side.

    /// A peer connects.
    pub fn connect(&self, conn_id: u16, remote: PeerAddress) {
        self.peer_event(GattsEvent::Connect { conn_id, remote });
    }

    /// A peer disconnects.
    pub fn disconnect(&self, conn_id: u16, remote: PeerAddress) {
        self.peer_event(GattsEvent::Disconnect { conn_id, remote });
    }

    /// A peer reads `handle`. Returns the transaction id.
    pub fn read(&self, conn_id: u16, handle: AttrHandle, is_long: bool) -> u32 {
        let trans_id = self.next_trans_id();
        self.peer_event(GattsEvent::Read {
            conn_id,
            trans_id,
            handle,
            offset: 0,
            is_long,
            need_rsp: true,
        });
        trans_id
    }

    /// A peer writes `value` to `handle` and expects a response.
    pub fn write(&self, conn_id: u16, handle: AttrHandle, value: &[u8]) -> u32 {
        self.send_write(conn_id, handle, 0, value, true, false)
    }

    /// A peer writes `value` to `handle` without expecting a response.
    pub fn write_without_response(&self, conn_id: u16, handle: AttrHandle, value: &[u8]) -> u32 {
        self.send_write(conn_id, handle, 0, value, false, false)
    }

    /// A peer queues a prepared write.
    pub fn prepare_write(&self, conn_id: u16, handle: AttrHandle, offset: u16, value: &[u8]) -> u32 {
        self.send_write(conn_id, handle, offset, value, true, true)
    }

    /// A peer executes or cancels its prepared writes.
    pub fn execute_write(&self, conn_id: u16, flag: ExecWriteFlag) -> u32 {
        let trans_id = self.next_trans_id();
        self.peer_event(GattsEvent::ExecWrite {
            conn_id,
            trans_id,
            flag,
        });
        trans_id
    }

    /// A peer writes the client configuration descriptor at `cccd_handle`.
    pub fn enable_notifications(
        &self,
        conn_id: u16,
        cccd_handle: AttrHandle,
        notify: bool,
        indicate: bool,
    ) -> u32 {
        let bits = u8::from(notify) | (u8::from(indicate) << 1);
        self.write(conn_id, cccd_handle, &[bits, 0])
    }

    /// A peer requests a security procedure.
    pub fn security_request(&self, remote: PeerAddress) {
        let sink = self.state.lock().gap.clone();
        if let Some(sink) = sink {
            sink.gap(GapEvent::SecurityRequest { remote });
        }
    }

    /// Deliver a raw GATT client event.
    pub fn client_event(&self, code: u32) {
        let sink = self.state.lock().gattc.clone();
        if let Some(sink) = sink {
            sink.client(GattcEvent { code, gattc_if: 0 });
        }
    }

    fn send_write(
        &self,
        conn_id: u16,
        handle: AttrHandle,
        offset: u16,
        value: &[u8],
        need_rsp: bool,
        is_prep: bool,
    ) -> u32 {
        let trans_id = self.next_trans_id();
        self.peer_event(GattsEvent::Write {
            conn_id,
            trans_id,
            handle,
            offset,
            need_rsp,
            is_prep,
            value: Bytes::copy_from_slice(value),
        });
        trans_id
    }

    fn next_trans_id(&self) -> u32 {
        let mut state = self.state.lock();
        let id = state.next_trans_id;
        state.next_trans_id = state.next_trans_id.wrapping_add(1);
        id
    }

    /// Deliver an event on the most recently registered interface.
    fn peer_event(&self, event: GattsEvent) {
        let gatts_if = self.current_if();
        let sink = self.state.lock().gatts.clone();
        match sink {
            Some(sink) => sink.server(gatts_if, event),
            None => debug!(event = event.name(), "No server callback registered"),
        }
    }

    // Stack side.

    fn record(&self, call: StackCall, operation: &'static str) -> StackResult {
        trace!(?call, "Loopback request");
        let failure = {
            let mut state = self.state.lock();
            state.calls.push(call);
            state.failures.remove(operation)
        };
        self.changed.notify_waiters();
        match failure {
            Some(code) => Err(code),
            None => Ok(()),
        }
    }

    fn status_for(&self, operation: &'static str) -> GattStatus {
        self.state
            .lock()
            .rejections
            .remove(operation)
            .unwrap_or(GattStatus::OK)
    }

    fn emit_server(&self, gatts_if: GattIf, event: GattsEvent) {
        let sink = self.state.lock().gatts.clone();
        if let Some(sink) = sink {
            sink.server(gatts_if, event);
        }
    }

    fn emit_gap(&self, event: GapEvent) {
        let sink = self.state.lock().gap.clone();
        if let Some(sink) = sink {
            sink.gap(event);
        }
    }

    /// Interface of the most recently registered application.
    fn current_if(&self) -> GattIf {
        self.state
            .lock()
            .apps
            .values()
            .copied()
            .max()
            .unwrap_or(FIRST_GATTS_IF)
    }

    fn lifecycle(&self, operation: &'static str) -> StackResult {
        self.record(StackCall::Lifecycle(operation), operation)
    }
}

impl GattStack for LoopbackStack {
    fn register_app(&self, app_id: u16) -> StackResult {
        self.record(StackCall::RegisterApp { app_id }, "register_app")?;
        let status = self.status_for("register_app");
        let gatts_if = {
            let mut state = self.state.lock();
            let gatts_if = state.next_gatts_if;
            if status.is_ok() {
                state.next_gatts_if = state.next_gatts_if.wrapping_add(1);
                state.apps.insert(app_id, gatts_if);
            }
            gatts_if
        };
        self.emit_server(
            gatts_if,
            GattsEvent::Register {
                status,
                app_id,
                gatts_if,
            },
        );
        Ok(())
    }

    fn unregister_app(&self, gatts_if: GattIf) -> StackResult {
        self.record(StackCall::UnregisterApp { gatts_if }, "unregister_app")?;
        self.state.lock().apps.retain(|_, v| *v != gatts_if);
        Ok(())
    }

    fn create_service(
        &self,
        gatts_if: GattIf,
        uuid: &BleUuid,
        _is_primary: bool,
        num_handles: u16,
    ) -> StackResult {
        self.record(
            StackCall::CreateService {
                uuid: *uuid,
                num_handles,
            },
            "create_service",
        )?;
        let mut status = self.status_for("create_service");
        let service_handle = {
            let mut state = self.state.lock();
            let handle = state.next_handle;
            match handle.checked_add(num_handles) {
                Some(end) if status.is_ok() => {
                    state.next_handle = end;
                    state.services.insert(
                        handle,
                        ServiceRange {
                            uuid: *uuid,
                            end,
                            cursor: handle + 1,
                            last_characteristic: None,
                        },
                    );
                }
                Some(_) => {}
                None => status = GattStatus::NO_RESOURCES,
            }
            handle
        };
        debug!(%uuid, service_handle, num_handles, %status, "Loopback service created");
        self.emit_server(
            gatts_if,
            GattsEvent::ServiceCreated {
                status,
                service_handle,
                service_uuid: *uuid,
            },
        );
        Ok(())
    }

    fn add_characteristic(
        &self,
        service_handle: AttrHandle,
        uuid: &BleUuid,
        permissions: Permissions,
        properties: Properties,
        initial_value: &[u8],
    ) -> StackResult {
        self.record(
            StackCall::AddCharacteristic {
                service_handle,
                uuid: *uuid,
                permissions,
                properties,
                value: Bytes::copy_from_slice(initial_value),
            },
            "add_characteristic",
        )?;
        let mut status = self.status_for("add_characteristic");
        let attr_handle = {
            let mut state = self.state.lock();
            let allocated = match state.services.get_mut(&service_handle) {
                // Declaration plus value.
                Some(range) if status.is_ok() && range.cursor + 2 <= range.end => {
                    let value_handle = range.cursor + 1;
                    range.cursor += 2;
                    range.last_characteristic = Some(*uuid);
                    Some(value_handle)
                }
                Some(_) if status.is_ok() => {
                    status = GattStatus::NO_RESOURCES;
                    None
                }
                Some(_) => None,
                None => {
                    status = GattStatus::INVALID_HANDLE;
                    None
                }
            };
            if let Some(handle) = allocated {
                state.attributes.push(Attribute {
                    handle,
                    service_handle,
                    uuid: *uuid,
                    owner: None,
                });
            }
            allocated.unwrap_or(0)
        };
        self.emit_server(
            self.current_if(),
            GattsEvent::CharacteristicAdded {
                status,
                attr_handle,
                service_handle,
                char_uuid: *uuid,
            },
        );
        Ok(())
    }

    fn add_descriptor(
        &self,
        service_handle: AttrHandle,
        uuid: &BleUuid,
        _permissions: Permissions,
        initial_value: &[u8],
    ) -> StackResult {
        self.record(
            StackCall::AddDescriptor {
                service_handle,
                uuid: *uuid,
                value: Bytes::copy_from_slice(initial_value),
            },
            "add_descriptor",
        )?;
        let mut status = self.status_for("add_descriptor");
        let attr_handle = {
            let mut state = self.state.lock();
            let allocated = match state.services.get_mut(&service_handle) {
                Some(range) if status.is_ok() && range.cursor < range.end => {
                    let handle = range.cursor;
                    range.cursor += 1;
                    Some((handle, range.last_characteristic))
                }
                Some(_) if status.is_ok() => {
                    status = GattStatus::NO_RESOURCES;
                    None
                }
                Some(_) => None,
                None => {
                    status = GattStatus::INVALID_HANDLE;
                    None
                }
            };
            match allocated {
                Some((handle, owner)) => {
                    state.attributes.push(Attribute {
                        handle,
                        service_handle,
                        uuid: *uuid,
                        owner,
                    });
                    handle
                }
                None => 0,
            }
        };
        self.emit_server(
            self.current_if(),
            GattsEvent::DescriptorAdded {
                status,
                attr_handle,
                service_handle,
                descr_uuid: *uuid,
            },
        );
        Ok(())
    }

    fn start_service(&self, service_handle: AttrHandle) -> StackResult {
        self.record(StackCall::StartService { service_handle }, "start_service")?;
        let mut status = self.status_for("start_service");
        if let Some(range) = self.state.lock().services.get(&service_handle) {
            trace!(uuid = %range.uuid, "Loopback service starting");
        } else if status.is_ok() {
            status = GattStatus::INVALID_HANDLE;
        }
        self.emit_server(
            self.current_if(),
            GattsEvent::ServiceStarted {
                status,
                service_handle,
            },
        );
        Ok(())
    }

    fn send_response(
        &self,
        _gatts_if: GattIf,
        conn_id: u16,
        trans_id: u32,
        status: GattStatus,
        response: &GattResponse,
    ) -> StackResult {
        self.record(
            StackCall::SendResponse {
                conn_id,
                trans_id,
                status,
                response: response.clone(),
            },
            "send_response",
        )
    }

    fn send_indicate(
        &self,
        gatts_if: GattIf,
        conn_id: u16,
        handle: AttrHandle,
        value: &[u8],
        need_confirm: bool,
    ) -> StackResult {
        self.record(
            StackCall::SendIndicate {
                conn_id,
                handle,
                value: Bytes::copy_from_slice(value),
                need_confirm,
            },
            "send_indicate",
        )?;
        if need_confirm && !self.state.lock().withhold_confirm {
            let status = self.status_for("confirm");
            self.emit_server(gatts_if, GattsEvent::Confirm { status, conn_id });
        }
        Ok(())
    }

    fn set_advertising_data(&self, payload: &[u8], scan_response: bool) -> StackResult {
        self.record(
            StackCall::SetAdvertisingData {
                payload: Bytes::copy_from_slice(payload),
                scan_response,
            },
            "set_advertising_data",
        )?;
        self.emit_gap(GapEvent::AdvDataSetComplete {
            status: GattStatus::OK,
        });
        Ok(())
    }

    fn start_advertising(&self, _params: &AdvertisingParams) -> StackResult {
        self.record(StackCall::StartAdvertising, "start_advertising")?;
        let status = self.status_for("start_advertising");
        self.emit_gap(GapEvent::AdvStartComplete { status });
        Ok(())
    }

    fn stop_advertising(&self) -> StackResult {
        self.record(StackCall::StopAdvertising, "stop_advertising")?;
        self.emit_gap(GapEvent::AdvStopComplete {
            status: GattStatus::OK,
        });
        Ok(())
    }

    fn security_response(&self, remote: &PeerAddress, accept: bool) -> StackResult {
        self.record(
            StackCall::SecurityResponse {
                remote: *remote,
                accept,
            },
            "security_response",
        )
    }
}

impl Controller for LoopbackStack {
    fn init_storage(&self) -> StackResult {
        self.lifecycle("init_storage")
    }

    fn controller_init(&self) -> StackResult {
        self.lifecycle("controller_init")?;
        if self.state.lock().controller_released {
            return Err(StackError::INVALID_STATE);
        }
        Ok(())
    }

    fn set_tx_power(&self, power: TxPower) -> StackResult {
        trace!(dbm = power.dbm(), "Loopback tx power");
        self.lifecycle("set_tx_power")
    }

    fn controller_enable(&self) -> StackResult {
        self.lifecycle("controller_enable")
    }

    fn stack_init(&self) -> StackResult {
        self.lifecycle("stack_init")
    }

    fn stack_enable(&self) -> StackResult {
        self.lifecycle("stack_enable")
    }

    fn register_gap_callback(&self, sink: EventSink) -> StackResult {
        self.lifecycle("register_gap_callback")?;
        self.state.lock().gap = Some(sink);
        Ok(())
    }

    fn register_gattc_callback(&self, sink: EventSink) -> StackResult {
        self.lifecycle("register_gattc_callback")?;
        self.state.lock().gattc = Some(sink);
        Ok(())
    }

    fn register_gatts_callback(&self, sink: EventSink) -> StackResult {
        self.lifecycle("register_gatts_callback")?;
        self.state.lock().gatts = Some(sink);
        Ok(())
    }

    fn set_device_name(&self, name: &str) -> StackResult {
        self.lifecycle("set_device_name")?;
        self.state.lock().device_name = Some(name.to_string());
        Ok(())
    }

    fn set_io_capability(&self, _capability: IoCapability) -> StackResult {
        self.lifecycle("set_io_capability")
    }

    fn stack_disable(&self) -> StackResult {
        self.lifecycle("stack_disable")
    }

    fn stack_deinit(&self) -> StackResult {
        self.lifecycle("stack_deinit")?;
        let mut state = self.state.lock();
        state.gap = None;
        state.gattc = None;
        state.gatts = None;
        Ok(())
    }

    fn controller_disable(&self) -> StackResult {
        self.lifecycle("controller_disable")
    }

    fn controller_deinit(&self) -> StackResult {
        self.lifecycle("controller_deinit")?;
        self.state.lock().controller_released = true;
        Ok(())
    }
}
