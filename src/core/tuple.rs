//! Flow identity: directions, five-tuples and traffic categories.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Packet direction relative to the local device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Tx,
    Rx,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Tx => Direction::Rx,
            Direction::Rx => Direction::Tx,
        }
    }

    pub(crate) fn bit(self) -> u8 {
        match self {
            Direction::Tx => 0b01,
            Direction::Rx => 0b10,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Tx => f.write_str("tx"),
            Direction::Rx => f.write_str("rx"),
        }
    }
}

/// Network/transport identity of one direction of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowTuple {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

impl FlowTuple {
    /// The same flow seen from the other direction.
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }

    /// Direction-independent hash: a tuple and its reverse hash identically.
    pub fn bidi_hash(&self) -> u64 {
        let a = (self.src_ip, self.src_port);
        let b = (self.dst_ip, self.dst_port);
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let mut hasher = DefaultHasher::new();
        lo.hash(&mut hasher);
        hi.hash(&mut hasher);
        self.protocol.hash(&mut hasher);
        hasher.finish()
    }
}

/// Number of traffic categories tracked per peer.
pub const TRAFFIC_TYPE_COUNT: usize = 5;

/// Classifier verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficType {
    Streaming,
    Gaming,
    VoiceCall,
    VideoCall,
    Ping,
    /// The classifier could not decide; the flow is not tracked further.
    Unknown,
}

impl TrafficType {
    pub const TRACKED: [TrafficType; TRAFFIC_TYPE_COUNT] = [
        TrafficType::Streaming,
        TrafficType::Gaming,
        TrafficType::VoiceCall,
        TrafficType::VideoCall,
        TrafficType::Ping,
    ];

    /// Per-peer counter slot, `None` for `Unknown`.
    pub fn index(self) -> Option<usize> {
        match self {
            TrafficType::Streaming => Some(0),
            TrafficType::Gaming => Some(1),
            TrafficType::VoiceCall => Some(2),
            TrafficType::VideoCall => Some(3),
            TrafficType::Ping => Some(4),
            TrafficType::Unknown => None,
        }
    }

    /// Bit in the active traffic map sent to firmware.
    pub fn mask_bit(self) -> u32 {
        self.index().map_or(0, |i| 1 << i)
    }
}
