// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! BLE MQTT proxy relay

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ble_mqtt_proxy::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_mqtt_proxy=info".parse()?),
        )
        .init();

    info!("Starting BLE MQTT proxy v{}...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;
    config.validate()?;
    info!("Configuration loaded from {}", Config::default_path().display());

    run(config).await
}

#[cfg(feature = "bluez")]
async fn run(config: Config) -> Result<()> {
    use ble_mqtt_proxy::bluetooth::bluez::{self, BluezTransport};
    use ble_mqtt_proxy::bluetooth::{BleConnectionState, DeviceInfoKind};
    use ble_mqtt_proxy::mqtt::RumqttClient;
    use ble_mqtt_proxy::{Bridge, BridgeNotification};
    use tokio::sync::mpsc;
    use tracing::{error, warn};

    let Some(adapter) = bluez::default_adapter().await? else {
        error!("No Bluetooth adapter, nothing to do");
        return Ok(());
    };

    let address = match &config.bluetooth.device_address {
        Some(address) => Some(address.parse::<bluer::Address>()?),
        None => {
            bluez::scan(
                &adapter,
                &config.bluetooth.scan_filter,
                config.bluetooth.scan_duration(),
            )
            .await?
        }
    };
    let Some(address) = address else {
        warn!("No device with the MQTT proxy service found");
        return Ok(());
    };

    let (handle, events) = ble_mqtt_proxy::channel();
    let (notify_tx, mut notify_rx) = mpsc::channel::<BridgeNotification>(32);

    let transport = BluezTransport::connect(&adapter, address, handle.clone()).await?;
    let bridge = Bridge::new(config, transport, RumqttClient::new(), events, notify_tx)?;
    let bridge_task = tokio::spawn(bridge.run());

    for kind in [
        DeviceInfoKind::FirmwareVersion,
        DeviceInfoKind::BrokerEndpoint,
        DeviceInfoKind::Mtu,
    ] {
        handle.read_device_info(kind)?;
    }
    match handle.enable_mqtt_proxy() {
        Ok(()) => info!("MQTT proxy enabled on {}", address),
        Err(e) => error!("Cannot enable MQTT proxy: {}", e),
    }

    info!("Ready. Press Ctrl-C to quit.");

    loop {
        tokio::select! {
            Some(notification) = notify_rx.recv() => {
                match notification {
                    BridgeNotification::LinkState(BleConnectionState::Disconnected) => {
                        warn!("Device {} disconnected", address);
                        break;
                    }
                    BridgeNotification::LinkState(state) => info!("Link: {}", state.as_str()),
                    BridgeNotification::MqttState(state) => info!("MQTT: {}", state.as_str()),
                    BridgeNotification::DeviceInfo(device_info) => info!("Device: {:?}", device_info),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    let _ = handle.disable_mqtt_proxy();
    handle.shutdown()?;
    bridge_task.await?;

    info!("Goodbye!");
    Ok(())
}

#[cfg(not(feature = "bluez"))]
async fn run(_config: Config) -> Result<()> {
    tracing::error!("Built without BLE support; rebuild with `--features bluez`");
    Ok(())
}
