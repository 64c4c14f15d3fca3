//! MSP v1 framing and the DisplayPort sub-protocol.
//!
//! The drone forwards the flight controller's raw MSP byte stream inside
//! DisplayPort link packets; this parser re-frames it
//! (`$M<dir><len><cmd><payload><crc>`, XOR checksum) and interprets the
//! `MSP_DISPLAYPORT` messages that drive the OSD grid.

use tracing::{trace, warn};

/// MSP command id for DisplayPort.
pub const MSP_DISPLAYPORT: u8 = 182;
/// MSP command id for the FC variant string.
pub const MSP_FC_VARIANT: u8 = 2;

const MAX_MSP_PAYLOAD: usize = 255;

/// HD-mode option in `SetOptions`, selecting the grid geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HdOption {
    Sd = 0,
    Hd5018 = 1,
    Hd3016 = 2,
    Hd6022 = 3,
}

impl HdOption {
    fn from_wire(v: u8) -> Self {
        match v {
            1 => HdOption::Hd5018,
            2 => HdOption::Hd3016,
            3 => HdOption::Hd6022,
            _ => HdOption::Sd,
        }
    }
}

/// Actions a DisplayPort stream performs against the OSD.
pub trait DisplayportHandler {
    fn draw_character(&mut self, x: u32, y: u32, glyph: u16);
    fn clear_screen(&mut self);
    fn draw_complete(&mut self);
    fn set_options(&mut self, font: u8, mode: HdOption);
    /// FC variant string, e.g. "BTFL".
    fn fc_variant(&mut self, _variant: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Idle,
    GotDollar,
    GotM,
    Direction,
    Length,
    Command,
    Payload,
}

/// Incremental MSP v1 parser. Bytes may arrive in arbitrary chunks; frames
/// with a bad checksum are dropped silently (the stream is lossy anyway).
pub struct MspParser {
    state: ParseState,
    length: usize,
    command: u8,
    payload: Vec<u8>,
    checksum: u8,
}

impl Default for MspParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MspParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::Idle,
            length: 0,
            command: 0,
            payload: Vec::with_capacity(MAX_MSP_PAYLOAD),
            checksum: 0,
        }
    }

    /// Feed a chunk, dispatching every complete DisplayPort frame.
    pub fn feed(&mut self, data: &[u8], handler: &mut dyn DisplayportHandler) {
        for &byte in data {
            self.feed_byte(byte, handler);
        }
    }

    fn feed_byte(&mut self, byte: u8, handler: &mut dyn DisplayportHandler) {
        match self.state {
            ParseState::Idle => {
                if byte == b'$' {
                    self.state = ParseState::GotDollar;
                }
            }
            ParseState::GotDollar => {
                self.state = if byte == b'M' {
                    ParseState::GotM
                } else {
                    ParseState::Idle
                };
            }
            ParseState::GotM => {
                // '>' FC→OSD, '<' request, '!' error. All carry frames.
                self.state = if byte == b'>' || byte == b'<' || byte == b'!' {
                    ParseState::Direction
                } else {
                    ParseState::Idle
                };
            }
            ParseState::Direction => {
                self.length = byte as usize;
                self.checksum = byte;
                self.state = ParseState::Length;
            }
            ParseState::Length => {
                self.command = byte;
                self.checksum ^= byte;
                self.payload.clear();
                self.state = if self.length == 0 {
                    ParseState::Payload
                } else {
                    ParseState::Command
                };
            }
            ParseState::Command => {
                self.payload.push(byte);
                self.checksum ^= byte;
                if self.payload.len() == self.length {
                    self.state = ParseState::Payload;
                }
            }
            ParseState::Payload => {
                // This byte is the checksum.
                if byte == self.checksum {
                    self.dispatch(handler);
                } else {
                    trace!(
                        command = self.command,
                        expected = self.checksum,
                        got = byte,
                        "MSP checksum mismatch"
                    );
                }
                self.state = ParseState::Idle;
            }
        }
    }

    fn dispatch(&mut self, handler: &mut dyn DisplayportHandler) {
        match self.command {
            MSP_DISPLAYPORT => self.dispatch_displayport(handler),
            MSP_FC_VARIANT => {
                if let Ok(variant) = std::str::from_utf8(&self.payload) {
                    handler.fc_variant(variant.trim_end_matches('\0'));
                }
            }
            other => trace!(command = other, "ignoring MSP command"),
        }
    }

    fn dispatch_displayport(&mut self, handler: &mut dyn DisplayportHandler) {
        let Some(&sub) = self.payload.first() else {
            return;
        };
        match sub {
            0 => {} // heartbeat
            1 => handler.clear_screen(),
            2 => handler.clear_screen(),
            3 => {
                // {row, col, attr, text...}; attr low 2 bits = font page.
                if self.payload.len() < 4 {
                    warn!(len = self.payload.len(), "short DisplayPort write");
                    return;
                }
                let row = self.payload[1] as u32;
                let col = self.payload[2] as u32;
                let page = (self.payload[3] & 0x03) as u16;
                for (i, &ch) in self.payload[4..].iter().enumerate() {
                    if ch == 0 {
                        break;
                    }
                    handler.draw_character(col + i as u32, row, (page << 8) | ch as u16);
                }
            }
            4 => handler.draw_complete(),
            5 => {
                if self.payload.len() >= 3 {
                    handler.set_options(self.payload[1], HdOption::from_wire(self.payload[2]));
                }
            }
            other => trace!(sub = other, "unknown DisplayPort sub-command"),
        }
    }
}

/// Build one MSP v1 frame; shared by tests and the GS-side requests.
pub fn encode_msp(direction: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + payload.len());
    out.push(b'$');
    out.push(b'M');
    out.push(direction);
    out.push(payload.len() as u8);
    out.push(command);
    out.extend_from_slice(payload);
    let mut checksum = payload.len() as u8 ^ command;
    for &b in payload {
        checksum ^= b;
    }
    out.push(checksum);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        chars: Vec<(u32, u32, u16)>,
        clears: u32,
        draws: u32,
        options: Vec<(u8, HdOption)>,
        variant: String,
    }

    impl DisplayportHandler for Recorder {
        fn draw_character(&mut self, x: u32, y: u32, glyph: u16) {
            self.chars.push((x, y, glyph));
        }
        fn clear_screen(&mut self) {
            self.clears += 1;
        }
        fn draw_complete(&mut self) {
            self.draws += 1;
        }
        fn set_options(&mut self, font: u8, mode: HdOption) {
            self.options.push((font, mode));
        }
        fn fc_variant(&mut self, variant: &str) {
            self.variant = variant.to_string();
        }
    }

    fn displayport_write(row: u8, col: u8, attr: u8, text: &[u8]) -> Vec<u8> {
        let mut payload = vec![3, row, col, attr];
        payload.extend_from_slice(text);
        encode_msp(b'>', MSP_DISPLAYPORT, &payload)
    }

    #[test]
    fn test_write_string_draws_characters() {
        let mut parser = MspParser::new();
        let mut recorder = Recorder::default();
        parser.feed(&displayport_write(5, 10, 0, b"ARM"), &mut recorder);

        assert_eq!(
            recorder.chars,
            vec![
                (10, 5, u16::from(b'A')),
                (11, 5, u16::from(b'R')),
                (12, 5, u16::from(b'M'))
            ]
        );
    }

    #[test]
    fn test_attr_selects_font_page() {
        let mut parser = MspParser::new();
        let mut recorder = Recorder::default();
        parser.feed(&displayport_write(0, 0, 0x01, b"\x7B"), &mut recorder);
        assert_eq!(recorder.chars, vec![(0, 0, 0x017B)]);
    }

    #[test]
    fn test_clear_and_draw_complete() {
        let mut parser = MspParser::new();
        let mut recorder = Recorder::default();
        parser.feed(&encode_msp(b'>', MSP_DISPLAYPORT, &[2]), &mut recorder);
        parser.feed(&encode_msp(b'>', MSP_DISPLAYPORT, &[4]), &mut recorder);
        assert_eq!(recorder.clears, 1);
        assert_eq!(recorder.draws, 1);
    }

    #[test]
    fn test_set_options() {
        let mut parser = MspParser::new();
        let mut recorder = Recorder::default();
        parser.feed(&encode_msp(b'>', MSP_DISPLAYPORT, &[5, 0, 1]), &mut recorder);
        assert_eq!(recorder.options, vec![(0, HdOption::Hd5018)]);
    }

    #[test]
    fn test_bad_checksum_dropped() {
        let mut parser = MspParser::new();
        let mut recorder = Recorder::default();
        let mut frame = encode_msp(b'>', MSP_DISPLAYPORT, &[4]);
        *frame.last_mut().unwrap() ^= 0xFF;
        parser.feed(&frame, &mut recorder);
        assert_eq!(recorder.draws, 0);
    }

    #[test]
    fn test_resynchronizes_after_garbage() {
        let mut parser = MspParser::new();
        let mut recorder = Recorder::default();
        let mut stream = vec![0xDE, 0xAD, b'$', 0x00, 0xBE];
        stream.extend_from_slice(&encode_msp(b'>', MSP_DISPLAYPORT, &[4]));
        parser.feed(&stream, &mut recorder);
        assert_eq!(recorder.draws, 1);
    }

    #[test]
    fn test_split_delivery() {
        let mut parser = MspParser::new();
        let mut recorder = Recorder::default();
        let frame = displayport_write(1, 2, 0, b"GPS");
        for chunk in frame.chunks(2) {
            parser.feed(chunk, &mut recorder);
        }
        assert_eq!(recorder.chars.len(), 3);
    }

    #[test]
    fn test_fc_variant() {
        let mut parser = MspParser::new();
        let mut recorder = Recorder::default();
        parser.feed(&encode_msp(b'>', MSP_FC_VARIANT, b"BTFL"), &mut recorder);
        assert_eq!(recorder.variant, "BTFL");
    }

    #[test]
    fn test_nul_terminates_write_text() {
        let mut parser = MspParser::new();
        let mut recorder = Recorder::default();
        parser.feed(&displayport_write(0, 0, 0, b"OK\0junk"), &mut recorder);
        assert_eq!(recorder.chars.len(), 2);
    }
}
