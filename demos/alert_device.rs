//! Smart alert device example
//!
//! Demonstrates the GATT server against the in-memory loopback stack:
//! - Bringing the radio up
//! - Building the alert service and its characteristics
//! - Serving reads, including a computed battery value
//! - Receiving Wi-Fi credentials through writes
//! - Indicating a status change to a subscribed peer
//!
//! Run with: cargo run --example alert_device

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use smart_alert_gatt::ble::{LoopbackStack, StackCall};
use smart_alert_gatt::{
    mask, Callbacks, Descriptor, Device, Result, ALARM_STATE_UUID, ALERT_SERVICE_UUID,
    APPLY_NOW_UUID, BATTERY_STATUS_UUID, DEVICE_STATUS_UUID, DEVICE_UID_UUID,
    FIRMWARE_VERSION_UUID, WLAN_PASSWORD_UUID, WLAN_SSID_UUID,
};

const PEER: [u8; 6] = [0xC0, 0xFF, 0xEE, 0x00, 0x00, 0x01];

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,smart_alert_gatt=info".into()),
        )
        .init();

    println!("Smart Alert Device");
    println!("==================\n");

    let radio = Arc::new(LoopbackStack::new());
    let device = Device::new(radio.clone(), radio.clone());
    device.init("SmartAlert").await?;
    println!("Radio: {} ({:?})", device.state(), device.name());

    let server = device.create_server();
    server.advertising().add_service_uuid(ALERT_SERVICE_UUID);
    let service = server.service_create(ALERT_SERVICE_UUID);

    let uid = service.char_create(DEVICE_UID_UUID);
    uid.set_properties(mask::READ);
    uid.set_value(b"SA-0001-7F3A")?;

    let firmware = service.char_create(FIRMWARE_VERSION_UUID);
    firmware.set_properties(mask::READ);
    firmware.set_value(env!("CARGO_PKG_VERSION").as_bytes())?;

    let status = service.char_create(DEVICE_STATUS_UUID);
    status.set_properties(mask::READ | mask::INDICATE);
    status.desc_add(Descriptor::client_config());
    status.set_value(b"idle")?;

    let alarm = service.char_create(ALARM_STATE_UUID);
    alarm.set_properties(mask::READ | mask::NOTIFY);
    alarm.desc_add(Descriptor::client_config());
    alarm.set_value(&[0])?;

    // Battery level is sampled on demand.
    let battery_level = Arc::new(AtomicU8::new(87));
    let battery = service.char_create(BATTERY_STATUS_UUID);
    battery.set_properties(mask::READ);
    let level = battery_level.clone();
    battery.set_callbacks(Callbacks::new().on_before_read(move |c| {
        let _ = c.set_value(&[level.load(Ordering::SeqCst)]);
    }));

    let ssid = service.char_create(WLAN_SSID_UUID);
    ssid.set_properties(mask::READ | mask::WRITE);
    ssid.set_callbacks(Callbacks::new().on_after_write(|c| {
        println!("  SSID set to {:?}", String::from_utf8_lossy(&c.value()));
    }));

    let password = service.char_create(WLAN_PASSWORD_UUID);
    password.set_properties(mask::WRITE);

    let apply = service.char_create(APPLY_NOW_UUID);
    apply.set_properties(mask::WRITE | mask::WRITE_NR);
    apply.set_callbacks(Callbacks::new().on_after_write(|_| {
        println!("  Apply requested");
    }));

    server.init(&device).await?;
    server.start().await?;

    println!("\n=== Attribute Table ===");
    for characteristic in service.characteristics() {
        println!("  {}", characteristic);
        for descriptor in characteristic.descriptors() {
            println!("    {}", descriptor);
        }
    }

    println!("\n=== Peer Session ===");
    let mut connections = server.subscribe_connections();
    radio.connect(0, PEER);
    if let Ok(event) = connections.recv().await {
        println!("  {} {} (peers: {})", event.remote_string(), event.state, event.connected_count);
    }

    for characteristic in [&uid, &firmware, &battery] {
        let Some(handle) = characteristic.handle() else {
            continue;
        };
        let trans_id = radio.read(0, handle, false);
        if let Some((_, response)) = radio.wait_for_response(trans_id).await {
            let value = response.value().cloned().unwrap_or_default();
            println!("  read {} -> {:?}", characteristic.uuid(), String::from_utf8_lossy(&value));
        }
    }

    if let (Some(ssid_handle), Some(password_handle), Some(apply_handle)) =
        (ssid.handle(), password.handle(), apply.handle())
    {
        let t = radio.write(0, ssid_handle, b"HomeNetwork");
        radio.wait_for_response(t).await;
        let t = radio.write(0, password_handle, b"correct horse battery staple");
        radio.wait_for_response(t).await;
        radio.write_without_response(0, apply_handle, &[1]);
    }

    if let Some(cccd) = status.desc_find(&smart_alert_gatt::CLIENT_CHARACTERISTIC_CONFIG_UUID) {
        if let Some(handle) = cccd.handle() {
            let t = radio.enable_notifications(0, handle, false, true);
            radio.wait_for_response(t).await;
        }
    }

    status.set_value(b"alarm")?;
    status.indicate().await?;
    // Notifications stay disabled for the alarm state, so nothing is sent.
    alarm.set_value(&[1])?;
    alarm.notify().await?;
    println!(
        "  pushed {} value(s): {:?}",
        radio.pushed_values().len(),
        radio.pushed_values()
    );

    radio.disconnect(0, PEER);
    if let Ok(event) = connections.recv().await {
        println!("  {} {} (peers: {})", event.remote_string(), event.state, event.connected_count);
    }

    println!("\n=== Stack Summary ===");
    println!("  advertising starts: {}", radio.advertising_starts());
    println!("  advertising stops:  {}", radio.advertising_stops());
    println!(
        "  responses sent:     {}",
        radio.count(|c| matches!(c, StackCall::SendResponse { .. }))
    );

    server.deinit()?;
    device.deinit()?;
    println!("\nRadio: {}", device.state());

    Ok(())
}
