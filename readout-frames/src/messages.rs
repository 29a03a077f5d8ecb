//! Messages exchanged between the readout core and its collaborators:
//! trigger-driven data requests in, fragments and time-sync heartbeats out.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Tag copied into fragment headers to identify the payload layout.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FragmentType {
    Unknown = 0,
    TpcData = 1,
    PdData = 2,
    TriggerPrimitive = 3,
}

/// Subdetector the link belongs to.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemType {
    Invalid = 0,
    Tpc = 1,
    PhotonDetector = 2,
}

/// Error bits carried in a fragment header.
pub mod error_bits {
    /// The requested window is no longer (or was never) in the buffer.
    pub const DATA_NOT_FOUND: u32 = 1 << 0;
    /// The request window was malformed or wider than the handler accepts.
    pub const INVALID_WINDOW: u32 = 1 << 1;
    /// The request was still waiting when the run stopped.
    pub const END_OF_RUN: u32 = 1 << 2;
}

/// A trigger-driven demand for the frames overlapping a timestamp window.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequest {
    pub trigger_number: u64,
    pub trigger_timestamp: u64,
    pub window_begin: u64,
    pub window_end: u64,
    pub run_number: u32,
    pub sequence_number: u32,
}

/// Header of a fragment, echoing the request plus link identity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentHeader {
    pub trigger_number: u64,
    pub trigger_timestamp: u64,
    pub window_begin: u64,
    pub window_end: u64,
    pub run_number: u32,
    pub sequence_number: u32,
    pub detector_id: u32,
    pub link_id: u32,
    pub fragment_type: FragmentType,
    pub system_type: SystemType,
    pub error_bits: u32,
}

/// Response to a data request: header plus the extracted raw bytes.
///
/// During extraction the handler gathers zero-copy `(pointer, length)` pieces
/// into the latency buffer; constructing the fragment performs the single
/// copy into an owned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub header: FragmentHeader,
    pub payload: Vec<u8>,
}

impl Fragment {
    pub fn from_pieces(header: FragmentHeader, pieces: &[&[u8]]) -> Self {
        let total: usize = pieces.iter().map(|p| p.len()).sum();
        let mut payload = Vec::with_capacity(total);
        for piece in pieces {
            payload.extend_from_slice(piece);
        }
        Self { header, payload }
    }

    pub fn empty(mut header: FragmentHeader, error_bits: u32) -> Self {
        header.error_bits |= error_bits;
        Self {
            header,
            payload: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Periodic heartbeat carrying the newest processed DAQ time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSync {
    pub daq_time: u64,
    /// Wall-clock time in microseconds since the UNIX epoch.
    pub system_time: u64,
}

impl TimeSync {
    pub fn new(daq_time: u64) -> Self {
        let system_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self {
            daq_time,
            system_time,
        }
    }
}

/// A candidate hit emitted by the software trigger-primitive stage.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPrimitive {
    pub channel: u16,
    pub end_tick: u16,
    pub charge: u16,
    pub time_over_threshold: u16,
}
