//! Wire codec for the four control messages.
//!
//! Little-endian, unpadded. Sequence numbers travel as 24-bit fields on the
//! wire (RREQ) or full 32-bit fields (RREP, RWAIT); [`read_u24`]/[`write_u24`]
//! bridge the narrower ones to the `u32` the routing table stores.

use crate::address::UnicastAddress;
use crate::error::RoutingError;

fn require(buf: &[u8], len: usize) -> Result<(), RoutingError> {
    if buf.len() < len {
        Err(RoutingError::MalformedBuffer { expected: len, got: buf.len() })
    } else {
        Ok(())
    }
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn read_u24(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], 0])
}

fn write_u24(out: &mut Vec<u8>, value: u32) {
    let bytes = value.to_le_bytes();
    out.extend_from_slice(&bytes[..3]);
}

/// RREQ flags, packed into a single wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RreqFlags {
    /// Gratuitous RREQ.
    pub gratuitous: bool,
    /// Destination-only: intermediate nodes must not reply even with a
    /// fresher route.
    pub destination_only: bool,
    /// `destination_sequence_number` is unknown and absent from the wire.
    pub unknown_seq: bool,
    /// Directed RREQ sent to a known next-hop rather than broadcast.
    pub intermediate: bool,
}

impl RreqFlags {
    fn to_byte(self) -> u8 {
        (self.gratuitous as u8)
            | (self.destination_only as u8) << 1
            | (self.unknown_seq as u8) << 2
            | (self.intermediate as u8) << 3
    }

    fn from_byte(byte: u8) -> Self {
        Self {
            gratuitous: byte & 0b0001 != 0,
            destination_only: byte & 0b0010 != 0,
            unknown_seq: byte & 0b0100 != 0,
            intermediate: byte & 0b1000 != 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RreqMessage {
    pub source_address: UnicastAddress,
    pub destination_address: UnicastAddress,
    pub source_number_of_elements: u16,
    pub hop_count: u8,
    pub rssi: i8,
    pub flags: RreqFlags,
    pub source_sequence_number: u32,
    /// Absent on the wire when `flags.unknown_seq` is set.
    pub destination_sequence_number: Option<u32>,
}

impl RreqMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(15);
        out.extend_from_slice(&self.source_address.to_le_bytes());
        out.extend_from_slice(&self.destination_address.to_le_bytes());
        out.extend_from_slice(&self.source_number_of_elements.to_le_bytes());
        out.push(self.hop_count);
        out.push(self.rssi as u8);
        out.push(self.flags.to_byte());
        write_u24(&mut out, self.source_sequence_number);
        if !self.flags.unknown_seq {
            write_u24(&mut out, self.destination_sequence_number.unwrap_or(0));
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RoutingError> {
        require(buf, 12)?;
        let flags = RreqFlags::from_byte(buf[8]);
        let wire_len = if flags.unknown_seq { 12 } else { 15 };
        require(buf, wire_len)?;
        Ok(Self {
            source_address: read_u16(buf, 0),
            destination_address: read_u16(buf, 2),
            source_number_of_elements: read_u16(buf, 4),
            hop_count: buf[6],
            rssi: buf[7] as i8,
            flags,
            source_sequence_number: read_u24(buf, 9),
            destination_sequence_number: if flags.unknown_seq { None } else { Some(read_u24(buf, 12)) },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RrepMessage {
    pub repairable: bool,
    pub source_address: UnicastAddress,
    pub destination_address: UnicastAddress,
    pub destination_sequence_number: u32,
    pub hop_count: u8,
    pub destination_number_of_elements: u16,
}

impl RrepMessage {
    pub const WIRE_LEN: usize = 12;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_LEN);
        out.push(self.repairable as u8);
        out.extend_from_slice(&self.source_address.to_le_bytes());
        out.extend_from_slice(&self.destination_address.to_le_bytes());
        out.extend_from_slice(&self.destination_sequence_number.to_le_bytes());
        out.push(self.hop_count);
        out.extend_from_slice(&self.destination_number_of_elements.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RoutingError> {
        require(buf, Self::WIRE_LEN)?;
        Ok(Self {
            repairable: buf[0] != 0,
            source_address: read_u16(buf, 1),
            destination_address: read_u16(buf, 3),
            destination_sequence_number: u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]),
            hop_count: buf[9],
            destination_number_of_elements: read_u16(buf, 10),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RwaitMessage {
    pub destination_address: UnicastAddress,
    pub source_address: UnicastAddress,
    pub source_sequence_number: u32,
    pub hop_count: u8,
}

impl RwaitMessage {
    pub const WIRE_LEN: usize = 9;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_LEN);
        out.extend_from_slice(&self.destination_address.to_le_bytes());
        out.extend_from_slice(&self.source_address.to_le_bytes());
        out.extend_from_slice(&self.source_sequence_number.to_le_bytes());
        out.push(self.hop_count);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RoutingError> {
        require(buf, Self::WIRE_LEN)?;
        Ok(Self {
            destination_address: read_u16(buf, 0),
            source_address: read_u16(buf, 2),
            source_sequence_number: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            hop_count: buf[8],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RerrDestination {
    pub destination_address: UnicastAddress,
    pub destination_sequence_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RerrMessage {
    pub destinations: Vec<RerrDestination>,
}

impl RerrMessage {
    const ENTRY_LEN: usize = 5;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.destinations.len() * Self::ENTRY_LEN);
        out.push(self.destinations.len() as u8);
        for dest in &self.destinations {
            out.extend_from_slice(&dest.destination_address.to_le_bytes());
            write_u24(&mut out, dest.destination_sequence_number);
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RoutingError> {
        require(buf, 1)?;
        let count = buf[0] as usize;
        let wire_len = 1 + count * Self::ENTRY_LEN;
        require(buf, wire_len)?;
        let mut destinations = Vec::with_capacity(count);
        for i in 0..count {
            let off = 1 + i * Self::ENTRY_LEN;
            destinations.push(RerrDestination {
                destination_address: read_u16(buf, off),
                destination_sequence_number: read_u24(buf, off + 2),
            });
        }
        Ok(Self { destinations })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rreq_round_trips_with_known_sequence() {
        let msg = RreqMessage {
            source_address: 0x0001,
            destination_address: 0x0003,
            source_number_of_elements: 1,
            hop_count: 2,
            rssi: -60,
            flags: RreqFlags { intermediate: true, ..Default::default() },
            source_sequence_number: 42,
            destination_sequence_number: Some(7),
        };
        let encoded = msg.encode();
        assert_eq!(encoded.len(), 15);
        assert_eq!(RreqMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn rreq_round_trips_with_unknown_sequence() {
        let msg = RreqMessage {
            source_address: 0x0001,
            destination_address: 0x0003,
            source_number_of_elements: 1,
            hop_count: 0,
            rssi: -50,
            flags: RreqFlags { unknown_seq: true, ..Default::default() },
            source_sequence_number: 5,
            destination_sequence_number: None,
        };
        let encoded = msg.encode();
        assert_eq!(encoded.len(), 12);
        assert_eq!(RreqMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn rrep_round_trips() {
        let msg = RrepMessage {
            repairable: false,
            source_address: 0x0001,
            destination_address: 0x0003,
            destination_sequence_number: 99,
            hop_count: 2,
            destination_number_of_elements: 1,
        };
        let encoded = msg.encode();
        assert_eq!(encoded.len(), RrepMessage::WIRE_LEN);
        assert_eq!(RrepMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn rwait_round_trips() {
        let msg = RwaitMessage {
            destination_address: 0x0003,
            source_address: 0x0001,
            source_sequence_number: 17,
            hop_count: 3,
        };
        let encoded = msg.encode();
        assert_eq!(encoded.len(), RwaitMessage::WIRE_LEN);
        assert_eq!(RwaitMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn rerr_round_trips_with_multiple_destinations() {
        let msg = RerrMessage {
            destinations: vec![
                RerrDestination { destination_address: 0x0010, destination_sequence_number: 1 },
                RerrDestination { destination_address: 0x0020, destination_sequence_number: 2 },
            ],
        };
        let encoded = msg.encode();
        assert_eq!(encoded.len(), 1 + 2 * 5);
        assert_eq!(RerrMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let err = RreqMessage::decode(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, RoutingError::MalformedBuffer { .. }));
    }
}
