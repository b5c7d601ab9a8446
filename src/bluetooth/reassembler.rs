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

//! Chunking of MQTT proxy frames over the negotiated BLE payload size.
//!
//! Outbound frames shorter than the payload limit go to the small RX
//! characteristic in one write. Anything else is sliced into limit-sized
//! writes on the large RX characteristic. Inbound large objects arrive as
//! limit-sized chunks; a shorter chunk ends the object.

use std::collections::VecDeque;

use tracing::{debug, warn};

use super::ble_constants::CharacteristicId;
use super::command_queue::LinkCommand;

/// Split an encoded frame into link writes.
///
/// Returns an empty list when `max_payload` is 0; callers must defer
/// instead of sending in that case.
pub fn chunk_frame(frame: &[u8], max_payload: usize) -> Vec<LinkCommand> {
    if max_payload == 0 {
        return vec![];
    }

    if frame.len() < max_payload {
        return vec![LinkCommand::WriteCharacteristic(
            CharacteristicId::MqttRx,
            frame.to_vec(),
        )];
    }

    frame
        .chunks(max_payload)
        .map(|slice| LinkCommand::WriteCharacteristic(CharacteristicId::MqttRxLarge, slice.to_vec()))
        .collect()
}

/// Result of feeding one inbound chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Object is still growing; issue this read to fetch the next chunk.
    NeedMore(LinkCommand),
    /// Object is complete.
    Complete(Vec<u8>),
}

/// Reassembly buffer for a large object read from the device.
#[derive(Debug, Default)]
pub struct LargeObjectAssembly {
    characteristic: Option<CharacteristicId>,
    buffer: Vec<u8>,
}

impl LargeObjectAssembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk received on `characteristic`.
    pub fn ingest(
        &mut self,
        characteristic: CharacteristicId,
        chunk: &[u8],
        max_payload: usize,
    ) -> ChunkOutcome {
        if let Some(current) = self.characteristic {
            if current != characteristic {
                warn!(
                    "Chunk on {:?} while assembling {:?}, discarding {} buffered bytes",
                    characteristic,
                    current,
                    self.buffer.len()
                );
                self.reset();
            }
        }

        self.characteristic = Some(characteristic);
        self.buffer.extend_from_slice(chunk);

        if max_payload == 0 {
            warn!("Large object chunk before MTU negotiation, finalizing as-is");
            return ChunkOutcome::Complete(self.take());
        }

        if chunk.len() == max_payload {
            debug!("Large object growing: {} bytes so far", self.buffer.len());
            ChunkOutcome::NeedMore(LinkCommand::ReadCharacteristic(characteristic))
        } else {
            debug!("Large object complete: {} bytes", self.buffer.len());
            ChunkOutcome::Complete(self.take())
        }
    }

    pub fn reset(&mut self) {
        self.characteristic = None;
        self.buffer.clear();
    }

    pub fn is_in_progress(&self) -> bool {
        self.characteristic.is_some()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    fn take(&mut self) -> Vec<u8> {
        self.characteristic = None;
        std::mem::take(&mut self.buffer)
    }
}

/// Outbound chunking plus inbound assembly for one link session.
#[derive(Debug, Default)]
pub struct TransferManager {
    max_payload: usize,
    deferred: VecDeque<Vec<u8>>,
    assembly: LargeObjectAssembly,
}

impl TransferManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Store the negotiated payload size and release deferred frames.
    pub fn set_max_payload(&mut self, max_payload: usize) -> Vec<LinkCommand> {
        self.max_payload = max_payload;
        if max_payload == 0 || self.deferred.is_empty() {
            return vec![];
        }

        debug!(
            "Flushing {} deferred frames at max payload {}",
            self.deferred.len(),
            max_payload
        );
        let frames: Vec<Vec<u8>> = self.deferred.drain(..).collect();
        frames
            .iter()
            .flat_map(|frame| chunk_frame(frame, max_payload))
            .collect()
    }

    /// Commands that carry `frame` to the device, or none if it was deferred.
    pub fn outbound(&mut self, frame: Vec<u8>) -> Vec<LinkCommand> {
        if self.max_payload == 0 {
            debug!("MTU not negotiated, deferring {} byte frame", frame.len());
            self.deferred.push_back(frame);
            return vec![];
        }
        chunk_frame(&frame, self.max_payload)
    }

    pub fn inbound(&mut self, characteristic: CharacteristicId, chunk: &[u8]) -> ChunkOutcome {
        self.assembly.ingest(characteristic, chunk, self.max_payload)
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn assembly(&self) -> &LargeObjectAssembly {
        &self.assembly
    }

    /// Forget everything tied to the current link.
    pub fn reset(&mut self) {
        if !self.deferred.is_empty() {
            debug!("Dropping {} deferred frames", self.deferred.len());
        }
        self.max_payload = 0;
        self.deferred.clear();
        self.assembly.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::protocol::{ProxyMessage, Publish, QoS};

    fn write_payload(command: &LinkCommand) -> (CharacteristicId, &[u8]) {
        match command {
            LinkCommand::WriteCharacteristic(c, payload) => (*c, payload.as_slice()),
            other => panic!("expected a write, got {:?}", other),
        }
    }

    #[test]
    fn test_small_frame_single_write() {
        let commands = chunk_frame(b"hello", 20);
        assert_eq!(commands.len(), 1);
        assert_eq!(write_payload(&commands[0]), (CharacteristicId::MqttRx, &b"hello"[..]));
    }

    #[test]
    fn test_frame_equal_to_limit_goes_large() {
        let frame = vec![7u8; 20];
        let commands = chunk_frame(&frame, 20);
        assert_eq!(commands.len(), 1);
        assert_eq!(write_payload(&commands[0]).0, CharacteristicId::MqttRxLarge);
    }

    #[test]
    fn test_large_frame_slices() {
        let frame: Vec<u8> = (0..=255u8).cycle().take(4008).collect();
        let commands = chunk_frame(&frame, 185);

        assert_eq!(commands.len(), 22);
        let mut joined = Vec::new();
        for command in &commands {
            let (characteristic, payload) = write_payload(command);
            assert_eq!(characteristic, CharacteristicId::MqttRxLarge);
            assert!(payload.len() <= 185);
            joined.extend_from_slice(payload);
        }
        assert_eq!(write_payload(&commands[21]).1.len(), 4008 - 21 * 185);
        assert_eq!(joined, frame);
    }

    #[test]
    fn test_zero_limit_produces_nothing() {
        assert!(chunk_frame(b"hello", 0).is_empty());
    }

    #[test]
    fn test_assembly_multi_chunk() {
        let mut assembly = LargeObjectAssembly::new();

        for n in 0..6u8 {
            let outcome = assembly.ingest(CharacteristicId::MqttTxLarge, &[n; 185], 185);
            assert_eq!(
                outcome,
                ChunkOutcome::NeedMore(LinkCommand::ReadCharacteristic(CharacteristicId::MqttTxLarge))
            );
        }
        assert!(assembly.is_in_progress());
        assert_eq!(assembly.buffer_size(), 6 * 185);

        match assembly.ingest(CharacteristicId::MqttTxLarge, &[9; 40], 185) {
            ChunkOutcome::Complete(data) => {
                assert_eq!(data.len(), 6 * 185 + 40);
                assert_eq!(data[0], 0);
                assert_eq!(data[6 * 185], 9);
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert!(!assembly.is_in_progress());
        assert_eq!(assembly.buffer_size(), 0);
    }

    #[test]
    fn test_zero_length_chunk_finalizes() {
        let mut assembly = LargeObjectAssembly::new();
        assembly.ingest(CharacteristicId::MqttTxLarge, &[1; 20], 20);
        assert_eq!(
            assembly.ingest(CharacteristicId::MqttTxLarge, &[], 20),
            ChunkOutcome::Complete(vec![1; 20])
        );
    }

    #[test]
    fn test_zero_limit_finalizes_immediately() {
        let mut assembly = LargeObjectAssembly::new();
        assert_eq!(
            assembly.ingest(CharacteristicId::MqttTxLarge, b"abc", 0),
            ChunkOutcome::Complete(b"abc".to_vec())
        );
    }

    #[test]
    fn test_other_characteristic_discards_partial() {
        let mut assembly = LargeObjectAssembly::new();
        assembly.ingest(CharacteristicId::MqttTxLarge, &[1; 20], 20);
        assert_eq!(
            assembly.ingest(CharacteristicId::ListNetwork, b"xy", 20),
            ChunkOutcome::Complete(b"xy".to_vec())
        );
    }

    #[test]
    fn test_publish_chunk_roundtrip() {
        let max = 20;
        let header_len = 1 + 2 + 5 + 2 + 1;
        let publish = ProxyMessage::Publish(Publish {
            topic: "a/b/c".to_string(),
            msg_id: 42,
            qos: QoS::AtLeastOnce,
            payload: vec![0x5a; 3 * max + 7 - header_len],
        });
        let frame = publish.encode().unwrap();
        assert_eq!(frame.len(), 3 * max + 7);

        let mut assembly = LargeObjectAssembly::new();
        let mut result = None;
        for command in chunk_frame(&frame, max) {
            let (_, slice) = write_payload(&command);
            if let ChunkOutcome::Complete(data) =
                assembly.ingest(CharacteristicId::MqttTxLarge, slice, max)
            {
                result = Some(data);
            }
        }

        assert_eq!(result.as_deref(), Some(frame.as_slice()));
        assert_eq!(ProxyMessage::decode(&frame), Some(publish));
    }

    #[test]
    fn test_manager_defers_until_mtu() {
        let mut manager = TransferManager::new();
        assert!(manager.outbound(b"first".to_vec()).is_empty());
        assert!(manager.outbound(vec![3; 30]).is_empty());
        assert_eq!(manager.deferred_len(), 2);

        let commands = manager.set_max_payload(20);
        assert_eq!(manager.deferred_len(), 0);
        assert_eq!(commands.len(), 3);
        assert_eq!(write_payload(&commands[0]), (CharacteristicId::MqttRx, &b"first"[..]));
        assert_eq!(write_payload(&commands[1]).0, CharacteristicId::MqttRxLarge);
        assert_eq!(write_payload(&commands[2]).1.len(), 10);

        assert_eq!(manager.outbound(b"now".to_vec()).len(), 1);
    }

    #[test]
    fn test_manager_reset() {
        let mut manager = TransferManager::new();
        manager.outbound(b"pending".to_vec());
        manager.set_max_payload(0);
        manager.reset();
        assert_eq!(manager.deferred_len(), 0);
        assert_eq!(manager.max_payload(), 0);

        manager.set_max_payload(20);
        manager.inbound(CharacteristicId::MqttTxLarge, &[1; 20]);
        assert!(manager.assembly().is_in_progress());
        manager.reset();
        assert!(!manager.assembly().is_in_progress());
        assert!(manager.set_max_payload(20).is_empty());
    }
}
