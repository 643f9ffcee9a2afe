//! Frame parser / resynchronizer.
//!
//! Consumes inbound bytes one at a time into a candidate frame and hands every
//! completed frame to a [`FrameSink`]. The candidate buffer survives between
//! calls, so a frame may span any number of chunks. Garbage is dropped locally
//! and never surfaces to callers.

use firmata_shared::protocol::{
    ANALOG_MESSAGE, DIGITAL_MESSAGE, END_SYSEX, REPORT_VERSION, START_SYSEX,
};

/// Receiver of completed frames.
pub trait FrameSink {
    /// A complete 3-byte message whose opcode is version, analog or digital.
    fn short_message(&mut self, frame: [u8; 3]);
    /// A complete SysEx frame, START_SYSEX and END_SYSEX included.
    fn sysex_message(&mut self, frame: &[u8]);
}

/// Opcode of a short message: high nibble for channel messages, the raw byte
/// for system messages.
pub fn short_opcode(first: u8) -> u8 {
    if first < START_SYSEX { first & 0xF0 } else { first }
}

fn is_short_opcode(opcode: u8) -> bool {
    matches!(opcode, REPORT_VERSION | ANALOG_MESSAGE | DIGITAL_MESSAGE)
}

#[derive(Debug, Clone)]
pub struct FrameParser {
    buffer: Vec<u8>,
    version_received: bool,
    max_sysex_len: usize,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl FrameParser {
    pub fn new(max_sysex_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(64),
            version_received: false,
            max_sysex_len,
        }
    }

    /// True once a version report has been dispatched on this connection.
    pub fn version_received(&self) -> bool {
        self.version_received
    }

    /// The in-flight partial frame.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Forget the partial frame and the handshake flag.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.version_received = false;
    }

    pub fn feed<S: FrameSink>(&mut self, chunk: &[u8], sink: &mut S) {
        for &byte in chunk {
            self.push(byte, sink);
        }
    }

    pub fn push<S: FrameSink>(&mut self, byte: u8, sink: &mut S) {
        if self.buffer.is_empty() {
            // keep-alive padding
            if byte == 0 {
                return;
            }
            // stale traffic from a previous run
            if !self.version_received && byte != REPORT_VERSION {
                tracing::trace!("dropping 0x{:02X} before version report", byte);
                return;
            }
        }

        self.buffer.push(byte);
        let first = self.buffer[0];

        if first == START_SYSEX {
            if byte == END_SYSEX {
                if self.version_received {
                    sink.sysex_message(&self.buffer);
                } else {
                    tracing::trace!("discarding {} byte SysEx before version report", self.buffer.len());
                }
                self.buffer.clear();
            } else if byte > 0x7F && self.buffer.len() > 1 {
                tracing::debug!(
                    "abandoning incomplete SysEx ({} bytes), new command 0x{:02X}",
                    self.buffer.len() - 1,
                    byte
                );
                self.buffer.clear();
                self.buffer.push(byte);
            } else if self.buffer.len() > self.max_sysex_len {
                tracing::warn!("dropping unterminated SysEx longer than {} bytes", self.max_sysex_len);
                self.buffer.clear();
            }
            return;
        }

        let opcode = short_opcode(first);
        if !is_short_opcode(opcode) {
            tracing::trace!("discarding garbage starting with 0x{:02X}", first);
            self.buffer.clear();
            return;
        }

        if self.buffer.len() == 3 {
            let frame = [self.buffer[0], self.buffer[1], self.buffer[2]];
            if self.version_received || opcode == REPORT_VERSION {
                self.version_received = true;
                sink.short_message(frame);
            }
            self.buffer.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Collect(Vec<Vec<u8>>);

    impl FrameSink for Collect {
        fn short_message(&mut self, frame: [u8; 3]) {
            self.0.push(frame.to_vec());
        }
        fn sysex_message(&mut self, frame: &[u8]) {
            self.0.push(frame.to_vec());
        }
    }

    fn parse(chunks: &[&[u8]]) -> (FrameParser, Collect) {
        let mut parser = FrameParser::default();
        let mut sink = Collect::default();
        for chunk in chunks {
            parser.feed(chunk, &mut sink);
        }
        (parser, sink)
    }

    #[test]
    fn test_everything_before_version_is_dropped() {
        let (parser, sink) = parse(&[&[0xE0, 0x10, 0x01, 0xF0, 0x6C, 0x7F, 0xF7, 0xF9, 0x02, 0x05]]);
        assert!(parser.version_received());
        assert_eq!(sink.0, vec![vec![0xF9, 0x02, 0x05]]);
    }

    #[test]
    fn test_zero_padding_between_frames() {
        let (_, sink) = parse(&[&[0x00, 0xF9, 0x02, 0x05, 0x00, 0x00, 0x91, 0x01, 0x00]]);
        assert_eq!(sink.0, vec![vec![0xF9, 0x02, 0x05], vec![0x91, 0x01, 0x00]]);
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let (parser, sink) = parse(&[&[0xF9, 0x02], &[0x05, 0xF0, 0x71], &[0x41, 0x00], &[0xF7]]);
        assert_eq!(sink.0.len(), 2);
        assert_eq!(sink.0[1], vec![0xF0, 0x71, 0x41, 0x00, 0xF7]);
        assert!(parser.buffered().is_empty());
    }

    #[test]
    fn test_new_command_abandons_sysex() {
        let (_, sink) = parse(&[&[0xF9, 0x02, 0x05, 0xF0, 0x6C, 0x00, 0xE1, 0x7F, 0x07]]);
        assert_eq!(sink.0, vec![vec![0xF9, 0x02, 0x05], vec![0xE1, 0x7F, 0x07]]);
    }

    #[test]
    fn test_garbage_clears_buffer() {
        let (parser, sink) = parse(&[&[0xF9, 0x02, 0x05, 0x42, 0xC0, 0x13, 0x90, 0x01]]);
        assert_eq!(sink.0.len(), 1);
        assert_eq!(parser.buffered(), &[0x90, 0x01]);
    }

    #[test]
    fn test_oversized_sysex_is_dropped() {
        let mut parser = FrameParser::new(8);
        let mut sink = Collect::default();
        parser.feed(&[0xF9, 0x02, 0x05, 0xF0, 0x71], &mut sink);
        parser.feed(&[0x01; 10], &mut sink);
        parser.feed(&[0xF7], &mut sink);
        assert_eq!(sink.0.len(), 1);
    }

    #[test]
    fn test_reset_requires_new_version() {
        let (mut parser, mut sink) = parse(&[&[0xF9, 0x02, 0x05, 0x90]]);
        parser.reset();
        assert!(parser.buffered().is_empty());
        parser.feed(&[0x90, 0x01, 0x00], &mut sink);
        assert_eq!(sink.0.len(), 1);
    }
}
