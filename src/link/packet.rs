//! Framed datagram codec for the link protocol.
//!
//! Every datagram starts with an 8-byte little-endian header
//! `{ type: u32, size: u32 }` where `size` is the meaningful body length.
//! Fixed-size bodies (DisplayPort, command payload area) may be transmitted
//! padded to their full capacity; decoders tolerate both the padded form and
//! a body truncated down to the meaningful prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Wire header length.
pub const HEADER_SIZE: usize = 8;
/// Maximum DisplayPort body.
pub const MAX_DISPLAYPORT_SIZE: usize = 1500;
/// Maximum command payload.
pub const MAX_CMD_SIZE: usize = 256;
/// Maximum detection boxes per packet.
pub const MAX_DETECTION_BOXES: usize = 64;
/// Maximum RC channels per frame.
pub const MAX_RC_CHANNELS: usize = 16;

#[derive(Error, Debug)]
pub enum PacketError {
    #[error("datagram too short for header: {0} bytes")]
    Truncated(usize),

    #[error("unknown packet type {0}")]
    UnknownType(u32),

    #[error("body size {got} exceeds capacity {cap} for {kind}")]
    Oversize {
        kind: &'static str,
        got: usize,
        cap: usize,
    },

    #[error("body shorter than declared size: have {have}, need {need}")]
    ShortBody { have: usize, need: usize },
}

/// Packet kind discriminant as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketType {
    Ack = 0,
    Displayport = 1,
    Detection = 2,
    SysTelemetry = 3,
    Cmd = 4,
    Rc = 5,
}

impl TryFrom<u32> for PacketType {
    type Error = PacketError;

    fn try_from(value: u32) -> Result<Self, PacketError> {
        match value {
            0 => Ok(PacketType::Ack),
            1 => Ok(PacketType::Displayport),
            2 => Ok(PacketType::Detection),
            3 => Ok(PacketType::SysTelemetry),
            4 => Ok(PacketType::Cmd),
            5 => Ok(PacketType::Rc),
            other => Err(PacketError::UnknownType(other)),
        }
    }
}

/// GET/SET/ACK/NACK axis of a command, orthogonal to the sub-command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandId {
    Get = 0,
    Set = 1,
    Ack = 2,
    Nack = 3,
}

impl CommandId {
    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(CommandId::Get),
            1 => Some(CommandId::Set),
            2 => Some(CommandId::Ack),
            3 => Some(CommandId::Nack),
            _ => None,
        }
    }

    /// True for the reply half of the axis.
    pub fn is_reply(self) -> bool {
        matches!(self, CommandId::Ack | CommandId::Nack)
    }
}

/// Flat sub-command namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SubCommand {
    SysInfo = 0,
    Detection = 1,
    FocusMode = 2,
    Fps = 3,
    Bitrate = 4,
    WfbKey = 5,
    Gop = 6,
    PayloadSize = 7,
    Vbr = 8,
    SwitchCameras = 9,
    Codec = 10,
    SavePersistent = 11,
    Brightness = 12,
    Contrast = 13,
    Saturation = 14,
    Sharpness = 15,
    Hdr = 16,
    MirrorFlip = 17,
    RestoreDefault = 18,
    Reboot = 19,
    SetGsIp = 20,
}

impl SubCommand {
    pub fn from_wire(v: u8) -> Option<Self> {
        use SubCommand::*;
        Some(match v {
            0 => SysInfo,
            1 => Detection,
            2 => FocusMode,
            3 => Fps,
            4 => Bitrate,
            5 => WfbKey,
            6 => Gop,
            7 => PayloadSize,
            8 => Vbr,
            9 => SwitchCameras,
            10 => Codec,
            11 => SavePersistent,
            12 => Brightness,
            13 => Contrast,
            14 => Saturation,
            15 => Sharpness,
            16 => Hdr,
            17 => MirrorFlip,
            18 => RestoreDefault,
            19 => Reboot,
            20 => SetGsIp,
            _ => return None,
        })
    }
}

/// One normalized bounding box, coordinates in 0..1 image space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Physical transport carrying the link, tagged in extended telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PhyType {
    Lte = 0,
    Wcdma = 1,
    Wifi = 2,
    Ethernet = 3,
    Unknown = 255,
}

impl PhyType {
    fn from_wire(v: u8) -> Self {
        match v {
            0 => PhyType::Lte,
            1 => PhyType::Wcdma,
            2 => PhyType::Wifi,
            3 => PhyType::Ethernet,
            _ => PhyType::Unknown,
        }
    }
}

/// Per-PHY signal record attached to extended telemetry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PhySignal {
    Lte {
        rssi: i32,
        rsrq: i32,
        rsrp: i32,
        snr: f32,
    },
    Wcdma {
        rssi: i32,
    },
    None,
}

/// System telemetry body. The base form carries only CPU stats; the
/// extended form adds the PHY tag and a per-PHY signal record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SysTelemetry {
    pub cpu_temp_c: f32,
    pub cpu_usage_pct: f32,
    pub phy_type: PhyType,
    pub signal: PhySignal,
}

impl SysTelemetry {
    pub fn basic(cpu_temp_c: f32, cpu_usage_pct: f32) -> Self {
        Self {
            cpu_temp_c,
            cpu_usage_pct,
            phy_type: PhyType::Unknown,
            signal: PhySignal::None,
        }
    }
}

/// A command frame: the GET/SET/ACK/NACK axis, the sub-command id and an
/// opaque payload of at most [`MAX_CMD_SIZE`] bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandFrame {
    pub cmd: CommandId,
    pub subcmd: u8,
    pub data: Bytes,
}

impl CommandFrame {
    pub fn new(cmd: CommandId, subcmd: SubCommand, data: impl Into<Bytes>) -> Self {
        Self {
            cmd,
            subcmd: subcmd as u8,
            data: data.into(),
        }
    }

    /// Typed view of the sub-command id, `None` for ids outside the known
    /// namespace.
    pub fn subcommand(&self) -> Option<SubCommand> {
        SubCommand::from_wire(self.subcmd)
    }
}

/// A decoded link datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Ack,
    Displayport(Bytes),
    Detection(Vec<DetectionBox>),
    SysTelemetry(SysTelemetry),
    Cmd(CommandFrame),
    Rc(Vec<u16>),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Ack => PacketType::Ack,
            Packet::Displayport(_) => PacketType::Displayport,
            Packet::Detection(_) => PacketType::Detection,
            Packet::SysTelemetry(_) => PacketType::SysTelemetry,
            Packet::Cmd(_) => PacketType::Cmd,
            Packet::Rc(_) => PacketType::Rc,
        }
    }

    /// Serialize to a wire datagram. Caps are checked before any byte is
    /// written so an oversize body never reaches the socket.
    pub fn encode(&self) -> Result<Bytes, PacketError> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 64);

        match self {
            Packet::Ack => {
                put_header(&mut buf, PacketType::Ack, 0);
            }
            Packet::Displayport(data) => {
                if data.len() > MAX_DISPLAYPORT_SIZE {
                    return Err(PacketError::Oversize {
                        kind: "displayport",
                        got: data.len(),
                        cap: MAX_DISPLAYPORT_SIZE,
                    });
                }
                put_header(&mut buf, PacketType::Displayport, data.len() as u32);
                // Fixed-size body transmitted at full capacity.
                buf.put_slice(data);
                buf.put_bytes(0, MAX_DISPLAYPORT_SIZE - data.len());
            }
            Packet::Detection(boxes) => {
                if boxes.len() > MAX_DETECTION_BOXES {
                    return Err(PacketError::Oversize {
                        kind: "detection",
                        got: boxes.len(),
                        cap: MAX_DETECTION_BOXES,
                    });
                }
                let body = 1 + boxes.len() * 16;
                put_header(&mut buf, PacketType::Detection, body as u32);
                buf.put_u8(boxes.len() as u8);
                for b in boxes {
                    buf.put_f32_le(b.x);
                    buf.put_f32_le(b.y);
                    buf.put_f32_le(b.width);
                    buf.put_f32_le(b.height);
                }
            }
            Packet::SysTelemetry(t) => {
                let body = telemetry_body_len(t);
                put_header(&mut buf, PacketType::SysTelemetry, body as u32);
                buf.put_f32_le(t.cpu_temp_c);
                buf.put_f32_le(t.cpu_usage_pct);
                if body > 8 {
                    buf.put_u8(t.phy_type as u8);
                    match t.signal {
                        PhySignal::Lte {
                            rssi,
                            rsrq,
                            rsrp,
                            snr,
                        } => {
                            buf.put_i32_le(rssi);
                            buf.put_i32_le(rsrq);
                            buf.put_i32_le(rsrp);
                            buf.put_f32_le(snr);
                        }
                        PhySignal::Wcdma { rssi } => buf.put_i32_le(rssi),
                        PhySignal::None => {}
                    }
                }
            }
            Packet::Cmd(frame) => {
                if frame.data.len() > MAX_CMD_SIZE {
                    return Err(PacketError::Oversize {
                        kind: "command",
                        got: frame.data.len(),
                        cap: MAX_CMD_SIZE,
                    });
                }
                let body = 3 + frame.data.len();
                put_header(&mut buf, PacketType::Cmd, body as u32);
                buf.put_u8(frame.cmd as u8);
                buf.put_u8(frame.subcmd);
                buf.put_u8(frame.data.len() as u8);
                buf.put_slice(&frame.data);
            }
            Packet::Rc(channels) => {
                if channels.len() > MAX_RC_CHANNELS {
                    return Err(PacketError::Oversize {
                        kind: "rc",
                        got: channels.len(),
                        cap: MAX_RC_CHANNELS,
                    });
                }
                let body = 1 + channels.len() * 2;
                put_header(&mut buf, PacketType::Rc, body as u32);
                buf.put_u8(channels.len() as u8);
                for ch in channels {
                    buf.put_u16_le(*ch);
                }
            }
        }

        Ok(buf.freeze())
    }

    /// Parse a received datagram. Datagrams shorter than the header are
    /// rejected; bodies may be padded with slack beyond `header.size` or
    /// truncated down to the meaningful prefix.
    pub fn decode(datagram: &[u8]) -> Result<Packet, PacketError> {
        if datagram.len() < HEADER_SIZE {
            return Err(PacketError::Truncated(datagram.len()));
        }

        let mut buf = datagram;
        let ty = PacketType::try_from(buf.get_u32_le())?;
        let size = buf.get_u32_le() as usize;
        // Meaningful body: declared size, clamped to what actually arrived.
        let body_len = size.min(buf.remaining());
        let mut body = &buf[..body_len];

        match ty {
            PacketType::Ack => Ok(Packet::Ack),
            PacketType::Displayport => {
                if size > MAX_DISPLAYPORT_SIZE {
                    return Err(PacketError::Oversize {
                        kind: "displayport",
                        got: size,
                        cap: MAX_DISPLAYPORT_SIZE,
                    });
                }
                Ok(Packet::Displayport(Bytes::copy_from_slice(body)))
            }
            PacketType::Detection => {
                if body.remaining() < 1 {
                    return Err(PacketError::ShortBody { have: 0, need: 1 });
                }
                let count = body.get_u8() as usize;
                if count > MAX_DETECTION_BOXES {
                    return Err(PacketError::Oversize {
                        kind: "detection",
                        got: count,
                        cap: MAX_DETECTION_BOXES,
                    });
                }
                if body.remaining() < count * 16 {
                    return Err(PacketError::ShortBody {
                        have: body.remaining(),
                        need: count * 16,
                    });
                }
                let mut boxes = Vec::with_capacity(count);
                for _ in 0..count {
                    boxes.push(DetectionBox {
                        x: body.get_f32_le(),
                        y: body.get_f32_le(),
                        width: body.get_f32_le(),
                        height: body.get_f32_le(),
                    });
                }
                Ok(Packet::Detection(boxes))
            }
            PacketType::SysTelemetry => {
                if body.remaining() < 8 {
                    return Err(PacketError::ShortBody {
                        have: body.remaining(),
                        need: 8,
                    });
                }
                let cpu_temp_c = body.get_f32_le();
                let cpu_usage_pct = body.get_f32_le();
                let (phy_type, signal) = if body.has_remaining() {
                    let phy = PhyType::from_wire(body.get_u8());
                    let signal = match phy {
                        PhyType::Lte if body.remaining() >= 16 => PhySignal::Lte {
                            rssi: body.get_i32_le(),
                            rsrq: body.get_i32_le(),
                            rsrp: body.get_i32_le(),
                            snr: body.get_f32_le(),
                        },
                        PhyType::Wcdma if body.remaining() >= 4 => PhySignal::Wcdma {
                            rssi: body.get_i32_le(),
                        },
                        _ => PhySignal::None,
                    };
                    (phy, signal)
                } else {
                    (PhyType::Unknown, PhySignal::None)
                };
                Ok(Packet::SysTelemetry(SysTelemetry {
                    cpu_temp_c,
                    cpu_usage_pct,
                    phy_type,
                    signal,
                }))
            }
            PacketType::Cmd => {
                if body.remaining() < 3 {
                    return Err(PacketError::ShortBody {
                        have: body.remaining(),
                        need: 3,
                    });
                }
                let cmd = CommandId::from_wire(body.get_u8())
                    .ok_or(PacketError::UnknownType(PacketType::Cmd as u32))?;
                let subcmd = body.get_u8();
                let declared = body.get_u8() as usize;
                if declared > MAX_CMD_SIZE {
                    return Err(PacketError::Oversize {
                        kind: "command",
                        got: declared,
                        cap: MAX_CMD_SIZE,
                    });
                }
                // Tolerate the padded 256-byte form as well as the prefix form.
                let take = declared.min(body.remaining());
                if take < declared {
                    return Err(PacketError::ShortBody {
                        have: take,
                        need: declared,
                    });
                }
                let data = Bytes::copy_from_slice(&body[..declared]);
                Ok(Packet::Cmd(CommandFrame { cmd, subcmd, data }))
            }
            PacketType::Rc => {
                if body.remaining() < 1 {
                    return Err(PacketError::ShortBody { have: 0, need: 1 });
                }
                let count = body.get_u8() as usize;
                if count > MAX_RC_CHANNELS {
                    return Err(PacketError::Oversize {
                        kind: "rc",
                        got: count,
                        cap: MAX_RC_CHANNELS,
                    });
                }
                if body.remaining() < count * 2 {
                    return Err(PacketError::ShortBody {
                        have: body.remaining(),
                        need: count * 2,
                    });
                }
                let mut channels = Vec::with_capacity(count);
                for _ in 0..count {
                    channels.push(body.get_u16_le());
                }
                Ok(Packet::Rc(channels))
            }
        }
    }
}

fn put_header(buf: &mut BytesMut, ty: PacketType, size: u32) {
    buf.put_u32_le(ty as u32);
    buf.put_u32_le(size);
}

fn telemetry_body_len(t: &SysTelemetry) -> usize {
    match (t.phy_type, t.signal) {
        (PhyType::Unknown, PhySignal::None) => 8,
        (_, PhySignal::Lte { .. }) => 8 + 1 + 16,
        (_, PhySignal::Wcdma { .. }) => 8 + 1 + 4,
        (_, PhySignal::None) => 8 + 1,
    }
}
