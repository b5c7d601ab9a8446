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

//! Serialized GATT operation queue.
//!
//! BLE stacks only accept one outstanding GATT operation. Commands are
//! dispatched strictly in submission order, one at a time; the head is
//! popped when its completion arrives or when it times out. Failed and
//! timed-out commands are dropped, never retried.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::ble_constants::{CharacteristicId, ServiceId, ENABLE_NOTIFICATION_VALUE};
use super::transport::{GattStatus, GattTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCommandKind {
    WriteDescriptor,
    WriteCharacteristic,
    ReadCharacteristic,
    RequestMtu,
}

/// A single GATT operation against the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// Enable notifications on a characteristic.
    WriteDescriptor(CharacteristicId),
    WriteCharacteristic(CharacteristicId, Vec<u8>),
    ReadCharacteristic(CharacteristicId),
    RequestMtu(u16),
}

impl LinkCommand {
    pub fn kind(&self) -> LinkCommandKind {
        match self {
            Self::WriteDescriptor(_) => LinkCommandKind::WriteDescriptor,
            Self::WriteCharacteristic(..) => LinkCommandKind::WriteCharacteristic,
            Self::ReadCharacteristic(_) => LinkCommandKind::ReadCharacteristic,
            Self::RequestMtu(_) => LinkCommandKind::RequestMtu,
        }
    }

    pub fn characteristic(&self) -> Option<CharacteristicId> {
        match self {
            Self::WriteDescriptor(c) | Self::WriteCharacteristic(c, _) | Self::ReadCharacteristic(c) => {
                Some(*c)
            }
            Self::RequestMtu(_) => None,
        }
    }

    pub fn service(&self) -> Option<ServiceId> {
        self.characteristic().map(|c| c.service())
    }

    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Self::WriteCharacteristic(_, payload) => Some(payload),
            _ => None,
        }
    }

    fn dispatch<T: GattTransport>(&self, transport: &mut T) -> Result<(), TransportError> {
        match self {
            Self::WriteDescriptor(c) => transport.write_descriptor(*c, &ENABLE_NOTIFICATION_VALUE),
            Self::WriteCharacteristic(c, payload) => transport.write_characteristic(*c, payload),
            Self::ReadCharacteristic(c) => transport.read_characteristic(*c),
            Self::RequestMtu(mtu) => transport.request_mtu(*mtu),
        }
    }
}

/// Identifies which operation a transport callback completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub kind: LinkCommandKind,
    pub characteristic: Option<CharacteristicId>,
}

impl Completion {
    pub fn new(kind: LinkCommandKind, characteristic: Option<CharacteristicId>) -> Self {
        Self {
            kind,
            characteristic,
        }
    }

    fn completes(&self, command: &LinkCommand) -> bool {
        self.kind == command.kind() && self.characteristic == command.characteristic()
    }
}

/// FIFO of link commands with at most one in flight.
pub struct LinkScheduler<T> {
    transport: T,
    queue: VecDeque<LinkCommand>,
    /// Deadline of the in-flight head, if one is dispatched.
    in_flight: Option<Instant>,
    timeout: Duration,
    link_ready: bool,
}

impl<T: GattTransport> LinkScheduler<T> {
    pub fn new(transport: T, timeout: Duration) -> Self {
        Self {
            transport,
            queue: VecDeque::new(),
            in_flight: None,
            timeout,
            link_ready: false,
        }
    }

    /// Allow or stop dispatching. Commands only go out on a connected link.
    pub fn set_link_ready(&mut self, ready: bool, now: Instant) {
        self.link_ready = ready;
        if ready {
            self.dispatch_next(now);
        }
    }

    /// Append a command. Returns `false` if it was dropped.
    pub fn enqueue(&mut self, command: LinkCommand, now: Instant) -> bool {
        if !self.link_ready {
            warn!("Link not connected, dropping {:?}", command.kind());
            return false;
        }
        debug!(
            "Enqueue {:?} on {:?} ({} pending)",
            command.kind(),
            command.characteristic(),
            self.queue.len()
        );
        self.queue.push_back(command);
        self.dispatch_next(now);
        true
    }

    /// Handle a transport completion for the in-flight command.
    ///
    /// Completions that do not match the head (late callbacks for a command
    /// that already timed out) are ignored. Returns whether the queue advanced.
    pub fn on_complete(&mut self, completion: Completion, status: GattStatus, now: Instant) -> bool {
        let matches = self.in_flight.is_some()
            && self
                .queue
                .front()
                .is_some_and(|head| completion.completes(head));
        if !matches {
            debug!("Ignoring unexpected completion {:?}", completion);
            return false;
        }
        if let GattStatus::Failure(code) = status {
            warn!(
                "{:?} on {:?} failed with status {}",
                completion.kind, completion.characteristic, code
            );
        }
        self.advance(now);
        true
    }

    /// Force-advance if the in-flight command exceeded its deadline.
    pub fn poll_timeout(&mut self, now: Instant) -> bool {
        match self.in_flight {
            Some(deadline) if now >= deadline => {
                if let Some(head) = self.queue.front() {
                    warn!(
                        "{:?} on {:?} timed out after {:?}",
                        head.kind(),
                        head.characteristic(),
                        self.timeout
                    );
                }
                self.advance(now);
                true
            }
            _ => false,
        }
    }

    /// Deadline of the in-flight command.
    pub fn deadline(&self) -> Option<Instant> {
        self.in_flight
    }

    /// Drop every pending command, including the one in flight.
    pub fn reset(&mut self) {
        if !self.queue.is_empty() {
            debug!("Clearing {} queued link commands", self.queue.len());
        }
        self.queue.clear();
        self.in_flight = None;
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn pending(&self) -> impl Iterator<Item = &LinkCommand> {
        self.queue.iter()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn advance(&mut self, now: Instant) {
        self.queue.pop_front();
        self.in_flight = None;
        self.dispatch_next(now);
    }

    fn dispatch_next(&mut self, now: Instant) {
        while self.in_flight.is_none() && self.link_ready {
            let Some(head) = self.queue.front() else {
                return;
            };
            match head.dispatch(&mut self.transport) {
                Ok(()) => {
                    self.in_flight = Some(now + self.timeout);
                }
                Err(e) => {
                    // A command the transport refuses counts as completed.
                    warn!("Failed to dispatch {:?}: {}", head.kind(), e);
                    self.queue.pop_front();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingTransport {
        dispatched: Vec<LinkCommand>,
        refuse_reads: bool,
        closed: bool,
    }

    impl GattTransport for RecordingTransport {
        fn write_descriptor(&mut self, c: CharacteristicId, _value: &[u8]) -> Result<(), TransportError> {
            self.dispatched.push(LinkCommand::WriteDescriptor(c));
            Ok(())
        }

        fn write_characteristic(&mut self, c: CharacteristicId, value: &[u8]) -> Result<(), TransportError> {
            self.dispatched.push(LinkCommand::WriteCharacteristic(c, value.to_vec()));
            Ok(())
        }

        fn read_characteristic(&mut self, c: CharacteristicId) -> Result<(), TransportError> {
            if self.refuse_reads {
                return Err(TransportError::CharacteristicUnavailable(c));
            }
            self.dispatched.push(LinkCommand::ReadCharacteristic(c));
            Ok(())
        }

        fn request_mtu(&mut self, mtu: u16) -> Result<(), TransportError> {
            self.dispatched.push(LinkCommand::RequestMtu(mtu));
            Ok(())
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    const TIMEOUT: Duration = Duration::from_millis(3000);

    fn ready_scheduler(now: Instant) -> LinkScheduler<RecordingTransport> {
        let mut scheduler = LinkScheduler::new(RecordingTransport::default(), TIMEOUT);
        scheduler.set_link_ready(true, now);
        scheduler
    }

    fn write(n: u8) -> LinkCommand {
        LinkCommand::WriteCharacteristic(CharacteristicId::MqttRx, vec![n])
    }

    fn write_done() -> Completion {
        Completion::new(LinkCommandKind::WriteCharacteristic, Some(CharacteristicId::MqttRx))
    }

    #[test]
    fn test_single_in_flight() {
        let now = Instant::now();
        let mut scheduler = ready_scheduler(now);

        for n in 0..5 {
            scheduler.enqueue(write(n), now);
        }
        assert_eq!(scheduler.transport().dispatched.len(), 1);
        assert!(scheduler.is_in_flight());

        for completed in 1..=5 {
            assert!(scheduler.on_complete(write_done(), GattStatus::Success, now));
            // Dispatched is never more than one ahead of completions
            assert!(scheduler.transport().dispatched.len() <= completed + 1);
        }
        assert!(scheduler.is_empty());
        assert!(!scheduler.is_in_flight());
    }

    #[test]
    fn test_fifo_order() {
        let now = Instant::now();
        let mut scheduler = ready_scheduler(now);

        scheduler.enqueue(LinkCommand::WriteDescriptor(CharacteristicId::MqttTx), now);
        scheduler.enqueue(write(1), now);
        scheduler.enqueue(LinkCommand::ReadCharacteristic(CharacteristicId::MqttTxLarge), now);
        scheduler.enqueue(LinkCommand::RequestMtu(512), now);

        scheduler.on_complete(
            Completion::new(LinkCommandKind::WriteDescriptor, Some(CharacteristicId::MqttTx)),
            GattStatus::Success,
            now,
        );
        scheduler.on_complete(write_done(), GattStatus::Success, now);
        scheduler.on_complete(
            Completion::new(LinkCommandKind::ReadCharacteristic, Some(CharacteristicId::MqttTxLarge)),
            GattStatus::Success,
            now,
        );

        assert_eq!(
            scheduler.transport().dispatched,
            vec![
                LinkCommand::WriteDescriptor(CharacteristicId::MqttTx),
                write(1),
                LinkCommand::ReadCharacteristic(CharacteristicId::MqttTxLarge),
                LinkCommand::RequestMtu(512),
            ]
        );
    }

    #[test]
    fn test_timeout_advances_exactly_at_deadline() {
        let start = Instant::now();
        let mut scheduler = ready_scheduler(start);
        scheduler.enqueue(write(1), start);
        scheduler.enqueue(write(2), start);

        assert_eq!(scheduler.deadline(), Some(start + TIMEOUT));
        assert!(!scheduler.poll_timeout(start + TIMEOUT - Duration::from_millis(1)));
        assert_eq!(scheduler.transport().dispatched.len(), 1);

        assert!(scheduler.poll_timeout(start + TIMEOUT));
        assert_eq!(scheduler.transport().dispatched, vec![write(1), write(2)]);
        assert_eq!(scheduler.deadline(), Some(start + TIMEOUT + TIMEOUT));
    }

    #[test]
    fn test_failed_status_still_advances() {
        let now = Instant::now();
        let mut scheduler = ready_scheduler(now);
        scheduler.enqueue(write(1), now);
        scheduler.enqueue(write(2), now);

        assert!(scheduler.on_complete(write_done(), GattStatus::Failure(133), now));
        assert_eq!(scheduler.transport().dispatched.len(), 2);
    }

    #[test]
    fn test_refused_dispatch_is_skipped() {
        let now = Instant::now();
        let mut scheduler = LinkScheduler::new(
            RecordingTransport {
                refuse_reads: true,
                ..Default::default()
            },
            TIMEOUT,
        );
        scheduler.set_link_ready(true, now);

        scheduler.enqueue(LinkCommand::ReadCharacteristic(CharacteristicId::DeviceMtu), now);
        assert!(scheduler.is_empty());
        assert!(!scheduler.is_in_flight());

        scheduler.enqueue(write(1), now);
        assert_eq!(scheduler.transport().dispatched, vec![write(1)]);
    }

    #[test]
    fn test_unexpected_completion_ignored() {
        let now = Instant::now();
        let mut scheduler = ready_scheduler(now);
        assert!(!scheduler.on_complete(write_done(), GattStatus::Success, now));

        scheduler.enqueue(write(1), now);
        scheduler.enqueue(write(2), now);
        let read_done =
            Completion::new(LinkCommandKind::ReadCharacteristic, Some(CharacteristicId::MqttTxLarge));
        assert!(!scheduler.on_complete(read_done, GattStatus::Success, now));
        assert_eq!(scheduler.len(), 2);
    }

    #[test]
    fn test_not_ready_drops_commands() {
        let now = Instant::now();
        let mut scheduler = LinkScheduler::new(RecordingTransport::default(), TIMEOUT);
        assert!(!scheduler.enqueue(write(1), now));
        assert!(scheduler.is_empty());
        assert!(scheduler.transport().dispatched.is_empty());
    }

    #[test]
    fn test_reset_clears_queue() {
        let now = Instant::now();
        let mut scheduler = ready_scheduler(now);
        for n in 0..3 {
            scheduler.enqueue(write(n), now);
        }
        scheduler.reset();
        scheduler.set_link_ready(false, now);

        assert!(scheduler.is_empty());
        assert!(!scheduler.is_in_flight());
        assert!(!scheduler.on_complete(write_done(), GattStatus::Success, now));
        assert!(!scheduler.poll_timeout(now + TIMEOUT));
        assert_eq!(scheduler.transport().dispatched.len(), 1);
        assert!(!scheduler.transport().closed);
    }

    #[test]
    fn test_command_accessors() {
        let command = LinkCommand::WriteCharacteristic(CharacteristicId::MqttRxLarge, vec![1, 2]);
        assert_eq!(command.kind(), LinkCommandKind::WriteCharacteristic);
        assert_eq!(command.service(), Some(ServiceId::MqttProxy));
        assert_eq!(command.payload(), Some(&[1u8, 2][..]));
        assert_eq!(LinkCommand::RequestMtu(185).characteristic(), None);
        assert_eq!(LinkCommand::ReadCharacteristic(CharacteristicId::DeviceMtu).payload(), None);
    }
}
