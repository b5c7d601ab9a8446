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

//! BlueZ GATT client transport.
//!
//! `bluer` is async while [`GattTransport`] must return immediately, so
//! every operation is handed to a worker task that owns the remote
//! characteristics and reports the outcome through a [`BridgeHandle`].

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, Session};
use futures::{pin_mut, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ble_constants::{CharacteristicId, CharacteristicTable};
use super::transport::{BleConnectionState, GattEvent, GattStatus, GattTransport, TransportError};
use crate::bridge::BridgeHandle;

/// Status reported for operations BlueZ rejected (Android's GATT_ERROR).
const GATT_ERROR: i32 = 0x85;

/// Open a BlueZ session and return the powered default adapter.
///
/// Returns `None` when no adapter is available.
pub async fn default_adapter() -> Result<Option<Adapter>> {
    let session = Session::new().await?;
    let adapter = match session.default_adapter().await {
        Ok(adapter) => adapter,
        Err(e) => {
            warn!("No Bluetooth adapter available: {}", e);
            return Ok(None);
        }
    };
    info!("Using Bluetooth adapter: {}", adapter.name());

    if !adapter.is_powered().await? {
        info!("Powering on Bluetooth adapter...");
        adapter.set_powered(true).await?;
    }

    Ok(Some(adapter))
}

/// Scan for a device advertising one of `filter`.
///
/// Stops at the first match. `None` for `duration` scans until a match is
/// found; otherwise gives up after `duration`.
pub async fn scan(adapter: &Adapter, filter: &[Uuid], duration: Option<Duration>) -> Result<Option<Address>> {
    info!("Scanning for devices advertising {:?}", filter);
    let discover = adapter.discover_devices().await?;
    pin_mut!(discover);

    let search = async {
        while let Some(event) = discover.next().await {
            if let AdapterEvent::DeviceAdded(address) = event {
                let device = adapter.device(address)?;
                let uuids = device.uuids().await?.unwrap_or_default();
                if filter.iter().any(|uuid| uuids.contains(uuid)) {
                    info!("Found device {}", address);
                    return Ok(Some(address));
                }
                debug!("Skipping device {}", address);
            }
        }
        Ok::<Option<Address>, anyhow::Error>(None)
    };

    match duration {
        Some(duration) => match tokio::time::timeout(duration, search).await {
            Ok(result) => result,
            Err(_) => {
                info!("Scan finished after {:?} without a match", duration);
                Ok(None)
            }
        },
        None => search.await,
    }
}

enum Request {
    EnableNotifications(CharacteristicId),
    Write(CharacteristicId, Vec<u8>),
    Read(CharacteristicId),
    Mtu,
    Close,
}

/// [`GattTransport`] backed by a connected BlueZ device.
pub struct BluezTransport {
    requests: mpsc::UnboundedSender<Request>,
    watcher: JoinHandle<()>,
}

impl BluezTransport {
    /// Connect to `address`, resolve the proxy characteristics and start
    /// reporting link events to `handle`.
    pub async fn connect(adapter: &Adapter, address: Address, handle: BridgeHandle) -> Result<Self> {
        let table = CharacteristicTable::new()?;
        let device = adapter.device(address)?;

        handle.link_event(GattEvent::ConnectionStateChanged(BleConnectionState::Connecting))?;
        if !device.is_connected().await? {
            info!("Connecting to {}", address);
            device.connect().await?;
        }
        handle.link_event(GattEvent::ConnectionStateChanged(BleConnectionState::Connected))?;

        let characteristics = discover(&device, &table).await?;
        if !characteristics.contains_key(&CharacteristicId::MqttRx) {
            return Err(anyhow!("device {} does not expose the MQTT proxy service", address));
        }
        info!("Resolved {} characteristics on {}", characteristics.len(), address);

        let watcher = tokio::spawn(watch_connection(device.clone(), handle.clone()));

        let (requests, rx) = mpsc::unbounded_channel();
        // The worker stops once the request sender is dropped.
        tokio::spawn(run_worker(device, characteristics, rx, handle.clone()));

        handle.link_event(GattEvent::ServicesDiscovered)?;

        Ok(Self { requests, watcher })
    }

    fn submit(&self, request: Request) -> Result<(), TransportError> {
        self.requests
            .send(request)
            .map_err(|_| TransportError::WorkerStopped)
    }
}

impl GattTransport for BluezTransport {
    fn write_descriptor(&mut self, characteristic: CharacteristicId, _value: &[u8]) -> Result<(), TransportError> {
        // BlueZ owns the CCCD; starting a notify session writes it.
        self.submit(Request::EnableNotifications(characteristic))
    }

    fn write_characteristic(&mut self, characteristic: CharacteristicId, value: &[u8]) -> Result<(), TransportError> {
        self.submit(Request::Write(characteristic, value.to_vec()))
    }

    fn read_characteristic(&mut self, characteristic: CharacteristicId) -> Result<(), TransportError> {
        self.submit(Request::Read(characteristic))
    }

    fn request_mtu(&mut self, mtu: u16) -> Result<(), TransportError> {
        // BlueZ negotiates the MTU itself during connection; report what it got.
        debug!("MTU {} requested, querying negotiated value", mtu);
        self.submit(Request::Mtu)
    }

    fn close(&mut self) {
        let _ = self.requests.send(Request::Close);
        self.watcher.abort();
    }
}

impl Drop for BluezTransport {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

async fn discover(
    device: &Device,
    table: &CharacteristicTable,
) -> Result<HashMap<CharacteristicId, Characteristic>> {
    let mut characteristics = HashMap::new();
    for service in device.services().await? {
        for characteristic in service.characteristics().await? {
            let uuid = characteristic.uuid().await?;
            if let Some(id) = table.lookup(&uuid) {
                debug!("Found {:?} ({})", id, uuid);
                characteristics.insert(id, characteristic);
            }
        }
    }
    Ok(characteristics)
}

async fn watch_connection(device: Device, handle: BridgeHandle) {
    let events = match device.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("Cannot watch device {}: {}", device.address(), e);
            return;
        }
    };
    pin_mut!(events);

    while let Some(event) = events.next().await {
        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
            info!("Device {} disconnected", device.address());
            let _ = handle.link_event(GattEvent::ConnectionStateChanged(
                BleConnectionState::Disconnected,
            ));
            break;
        }
    }
}

fn status_of<E: std::fmt::Display>(result: &Result<(), E>, what: &str) -> GattStatus {
    match result {
        Ok(()) => GattStatus::Success,
        Err(e) => {
            warn!("{} failed: {}", what, e);
            GattStatus::Failure(GATT_ERROR)
        }
    }
}

async fn run_worker(
    device: Device,
    characteristics: HashMap<CharacteristicId, Characteristic>,
    mut rx: mpsc::UnboundedReceiver<Request>,
    handle: BridgeHandle,
) {
    let mut notifiers: Vec<JoinHandle<()>> = Vec::new();

    while let Some(request) = rx.recv().await {
        let event = match request {
            Request::EnableNotifications(id) => {
                let result = match characteristics.get(&id) {
                    Some(characteristic) => {
                        start_notifications(id, characteristic, handle.clone())
                            .await
                            .map(|task| notifiers.push(task))
                    }
                    None => Err(anyhow!("{:?} not present on device", id)),
                };
                GattEvent::DescriptorWritten {
                    characteristic: id,
                    status: status_of(&result, "Enable notifications"),
                }
            }
            Request::Write(id, value) => {
                let result = match characteristics.get(&id) {
                    Some(characteristic) => characteristic.write(&value).await.map_err(anyhow::Error::from),
                    None => Err(anyhow!("{:?} not present on device", id)),
                };
                GattEvent::CharacteristicWritten {
                    characteristic: id,
                    status: status_of(&result, "Write"),
                }
            }
            Request::Read(id) => {
                let result = match characteristics.get(&id) {
                    Some(characteristic) => characteristic.read().await.map_err(anyhow::Error::from),
                    None => Err(anyhow!("{:?} not present on device", id)),
                };
                match result {
                    Ok(value) => GattEvent::CharacteristicRead {
                        characteristic: id,
                        value,
                        status: GattStatus::Success,
                    },
                    Err(e) => {
                        warn!("Read of {:?} failed: {}", id, e);
                        GattEvent::CharacteristicRead {
                            characteristic: id,
                            value: Vec::new(),
                            status: GattStatus::Failure(GATT_ERROR),
                        }
                    }
                }
            }
            Request::Mtu => {
                let mtu = match characteristics.get(&CharacteristicId::MqttRx) {
                    Some(characteristic) => characteristic.mtu().await.map_err(anyhow::Error::from),
                    None => Err(anyhow!("MQTT RX characteristic not present")),
                };
                match mtu {
                    Ok(mtu) => GattEvent::MtuChanged {
                        mtu: u16::try_from(mtu).unwrap_or(u16::MAX),
                        status: GattStatus::Success,
                    },
                    Err(e) => {
                        warn!("MTU query failed: {}", e);
                        GattEvent::MtuChanged {
                            mtu: 0,
                            status: GattStatus::Failure(GATT_ERROR),
                        }
                    }
                }
            }
            Request::Close => {
                for task in notifiers.drain(..) {
                    task.abort();
                }
                if let Err(e) = device.disconnect().await {
                    warn!("Disconnect from {} failed: {}", device.address(), e);
                }
                break;
            }
        };

        if handle.link_event(event).is_err() {
            debug!("Bridge gone, stopping BLE worker");
            break;
        }
    }

    for task in notifiers {
        task.abort();
    }
}

async fn start_notifications(
    id: CharacteristicId,
    characteristic: &Characteristic,
    handle: BridgeHandle,
) -> Result<JoinHandle<()>> {
    let stream = characteristic.notify().await?;
    Ok(tokio::spawn(async move {
        pin_mut!(stream);
        while let Some(value) = stream.next().await {
            let event = GattEvent::CharacteristicChanged {
                characteristic: id,
                value,
            };
            if handle.link_event(event).is_err() {
                break;
            }
        }
        debug!("Notifications on {:?} ended", id);
    }))
}
