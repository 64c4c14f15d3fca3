//! RTP depacketization (RFC 3550) and H.264/H.265 payload handling.
//!
//! A short-lived [`CodecDetector`] inspects early payloads under both NAL
//! header interpretations until one is decisive; the per-codec
//! [`Depacketizer`] then reassembles Annex-B NAL units for the decoder.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::Codec;

/// Payloads shorter than this are not decisive for detection; tiny
/// parameter-set packets are ambiguous between the two interpretations.
const MIN_DETECT_PAYLOAD: usize = 64;

/// Detection gives up after this many payloads without a verdict.
pub const MAX_DETECT_PACKETS: usize = 50;

const ANNEX_B: [u8; 4] = [0, 0, 0, 1];

#[derive(Error, Debug)]
pub enum RtpError {
    #[error("datagram too short for RTP header: {0} bytes")]
    Truncated(usize),

    #[error("unsupported RTP version {0}")]
    BadVersion(u8),
}

/// Parsed RTP header plus payload view.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn parse(datagram: &[u8]) -> Result<Self, RtpError> {
        if datagram.len() < 12 {
            return Err(RtpError::Truncated(datagram.len()));
        }

        let version = datagram[0] >> 6;
        if version != 2 {
            return Err(RtpError::BadVersion(version));
        }
        let padding = datagram[0] & 0x20 != 0;
        let extension = datagram[0] & 0x10 != 0;
        let csrc_count = (datagram[0] & 0x0F) as usize;

        let marker = datagram[1] & 0x80 != 0;
        let payload_type = datagram[1] & 0x7F;
        let sequence = u16::from_be_bytes([datagram[2], datagram[3]]);
        let timestamp = u32::from_be_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]);
        let ssrc = u32::from_be_bytes([datagram[8], datagram[9], datagram[10], datagram[11]]);

        let mut offset = 12 + csrc_count * 4;
        if datagram.len() < offset {
            return Err(RtpError::Truncated(datagram.len()));
        }
        if extension {
            if datagram.len() < offset + 4 {
                return Err(RtpError::Truncated(datagram.len()));
            }
            let words =
                u16::from_be_bytes([datagram[offset + 2], datagram[offset + 3]]) as usize;
            offset += 4 + words * 4;
            if datagram.len() < offset {
                return Err(RtpError::Truncated(datagram.len()));
            }
        }

        let mut end = datagram.len();
        if padding {
            let pad = datagram[end - 1] as usize;
            if pad > 0 && pad <= end - offset {
                end -= pad;
            }
        }

        Ok(Self {
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            payload: Bytes::copy_from_slice(&datagram[offset..end]),
        })
    }
}

/// Inspect one RTP payload under both codec interpretations.
///
/// H.265: `type = (byte >> 1) & 0x3F` — VCL 0..=31, parameter sets 32..=34,
/// SEI 39; aggregation/fragmentation 48/49 re-check the inner type.
/// H.264: `type = byte & 0x1F` — 1..=23; fragmentation units 28/29 re-check
/// the inner type.
pub fn detect_codec(payload: &[u8]) -> Option<Codec> {
    if payload.len() < MIN_DETECT_PAYLOAD {
        return None;
    }

    let header = payload[0];

    let h265_type = (header >> 1) & 0x3F;
    if h265_type <= 34 || h265_type == 39 {
        return Some(Codec::H265);
    }
    if (h265_type == 48 || h265_type == 49) && payload.len() >= 3 {
        let inner = (payload[2] >> 1) & 0x3F;
        if inner <= 34 || inner == 39 {
            return Some(Codec::H265);
        }
    }

    let h264_type = header & 0x1F;
    if (1..=23).contains(&h264_type) {
        return Some(Codec::H264);
    }
    if h264_type == 28 || h264_type == 29 {
        if payload.len() < 2 {
            return None;
        }
        let inner = payload[1] & 0x1F;
        if (1..=23).contains(&inner) {
            return Some(Codec::H264);
        }
    }

    None
}

/// Accumulates payloads until the codec is decided or the packet limit is
/// reached.
#[derive(Default)]
pub struct CodecDetector {
    inspected: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DetectOutcome {
    Undecided,
    Detected(Codec),
    GaveUp,
}

impl CodecDetector {
    pub fn push(&mut self, payload: &[u8]) -> DetectOutcome {
        if self.inspected >= MAX_DETECT_PACKETS {
            return DetectOutcome::GaveUp;
        }
        self.inspected += 1;
        match detect_codec(payload) {
            Some(codec) => {
                debug!(?codec, packets = self.inspected, "codec detected");
                DetectOutcome::Detected(codec)
            }
            None if self.inspected >= MAX_DETECT_PACKETS => DetectOutcome::GaveUp,
            None => DetectOutcome::Undecided,
        }
    }
}

/// Reassembles Annex-B NAL units out of RTP payloads for one codec.
///
/// Handles single NAL units, fragmentation units (FU-A 28 / H.265 FU 49)
/// with start/end flags and gap reset, and aggregation packets (STAP-A 24 /
/// H.265 AP 48).
pub struct Depacketizer {
    codec: Codec,
    fu_buffer: BytesMut,
    fu_active: bool,
    last_sequence: Option<u16>,
}

impl Depacketizer {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            fu_buffer: BytesMut::new(),
            fu_active: false,
            last_sequence: None,
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Push one RTP packet; returns zero or more complete Annex-B NAL
    /// units.
    pub fn push(&mut self, packet: &RtpPacket) -> Vec<Bytes> {
        // A sequence gap invalidates any fragment under reassembly.
        if let Some(last) = self.last_sequence {
            if packet.sequence.wrapping_sub(last) != 1 && self.fu_active {
                trace!(
                    expected = last.wrapping_add(1),
                    got = packet.sequence,
                    "sequence gap, dropping partial fragment"
                );
                self.fu_buffer.clear();
                self.fu_active = false;
            }
        }
        self.last_sequence = Some(packet.sequence);

        let payload = &packet.payload;
        if payload.is_empty() {
            return Vec::new();
        }

        match self.codec {
            Codec::H264 => self.push_h264(payload),
            Codec::H265 => self.push_h265(payload),
        }
    }

    fn push_h264(&mut self, payload: &[u8]) -> Vec<Bytes> {
        let nal_type = payload[0] & 0x1F;
        match nal_type {
            // STAP-A: u16-length-prefixed NALs after the aggregation byte.
            24 => split_aggregation(&payload[1..]),
            // FU-A: indicator + header + fragment.
            28 => {
                if payload.len() < 2 {
                    return Vec::new();
                }
                let fu_header = payload[1];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                if start {
                    self.fu_buffer.clear();
                    self.fu_buffer.put_slice(&ANNEX_B);
                    // Rebuild the original NAL header from the indicator's
                    // NRI bits and the FU header's type bits.
                    self.fu_buffer
                        .put_u8((payload[0] & 0xE0) | (fu_header & 0x1F));
                    self.fu_active = true;
                }
                if !self.fu_active {
                    return Vec::new();
                }
                self.fu_buffer.put_slice(&payload[2..]);
                if end {
                    self.fu_active = false;
                    return vec![self.fu_buffer.split().freeze()];
                }
                Vec::new()
            }
            1..=23 => vec![annex_b(payload)],
            other => {
                warn!(nal_type = other, "unhandled H.264 payload type");
                Vec::new()
            }
        }
    }

    fn push_h265(&mut self, payload: &[u8]) -> Vec<Bytes> {
        if payload.len() < 2 {
            return Vec::new();
        }
        let nal_type = (payload[0] >> 1) & 0x3F;
        match nal_type {
            // AP: two-byte payload header, then u16-length-prefixed NALs.
            48 => split_aggregation(&payload[2..]),
            // FU: two-byte payload header + FU header + fragment.
            49 => {
                if payload.len() < 3 {
                    return Vec::new();
                }
                let fu_header = payload[2];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                if start {
                    self.fu_buffer.clear();
                    self.fu_buffer.put_slice(&ANNEX_B);
                    let nal_unit_type = fu_header & 0x3F;
                    self.fu_buffer
                        .put_u8((payload[0] & 0x81) | (nal_unit_type << 1));
                    self.fu_buffer.put_u8(payload[1]);
                    self.fu_active = true;
                }
                if !self.fu_active {
                    return Vec::new();
                }
                self.fu_buffer.put_slice(&payload[3..]);
                if end {
                    self.fu_active = false;
                    return vec![self.fu_buffer.split().freeze()];
                }
                Vec::new()
            }
            _ => vec![annex_b(payload)],
        }
    }
}

fn annex_b(nal: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(4 + nal.len());
    out.put_slice(&ANNEX_B);
    out.put_slice(nal);
    out.freeze()
}

fn split_aggregation(mut units: &[u8]) -> Vec<Bytes> {
    let mut out = Vec::new();
    while units.len() >= 2 {
        let len = u16::from_be_bytes([units[0], units[1]]) as usize;
        units = &units[2..];
        if len == 0 || len > units.len() {
            break;
        }
        out.push(annex_b(&units[..len]));
        units = &units[len..];
    }
    out
}
