//! Wire format shared by every path that pulls audio off the device.
//!
//! Frames arrive either as fixed BLE packets (standard or packed) or as an
//! unaligned TCP byte stream. Both carry the same packed layout, a sequence of
//! `[1 byte length][frame]` records where a zero length means "padding until the
//! next 440-byte block boundary". Anything that does not start with a known
//! codec TOC byte is dropped without error; the next valid frame resyncs.

use tracing::trace;

/// A single codec-encoded audio unit.
pub type Frame = Vec<u8>;

/// TOC bytes the device firmware emits for its Opus configurations.
pub const VALID_TOC_BYTES: [u8; 7] = [0xb8, 0xb0, 0xbc, 0xf8, 0xfc, 0x78, 0x7c];

/// BLE packet whose trailing 80 bytes are one frame.
pub const STANDARD_PACKET_SIZE: usize = 83;
pub const STANDARD_FRAME_SIZE: usize = 80;

/// Fixed block carrying packed `[len][frame]` records, zero padded.
pub const PACKED_PACKET_SIZE: usize = 440;

/// Status bytes sent as single-byte packets on the storage stream.
pub const STATUS_OK: u8 = 0x00;
pub const STATUS_BAD_FILE_SIZE: u8 = 0x03;
pub const STATUS_EMPTY_FILE: u8 = 0x04;
pub const STATUS_END_OF_TRANSMISSION: u8 = 0x64;

/// Returns true when `bytes` is non-empty and starts with an allowed TOC byte.
pub fn is_valid_frame(bytes: &[u8]) -> bool {
    bytes
        .first()
        .map(|toc| VALID_TOC_BYTES.contains(toc))
        .unwrap_or(false)
}

/// Meaning of a single-byte status packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSignal {
    Continue,
    EndOfTransmission,
    BadFileSize,
    EmptyFile,
    /// Unlisted code >= 100. Firmware variants use these to mean "done"; this is
    /// observed behaviour, not a documented part of the protocol.
    UnknownCompletion(u8),
}

impl StatusSignal {
    pub fn from_code(code: u8) -> Self {
        match code {
            STATUS_OK => StatusSignal::Continue,
            STATUS_END_OF_TRANSMISSION => StatusSignal::EndOfTransmission,
            STATUS_BAD_FILE_SIZE => StatusSignal::BadFileSize,
            STATUS_EMPTY_FILE => StatusSignal::EmptyFile,
            code if code >= 100 => StatusSignal::UnknownCompletion(code),
            _ => StatusSignal::Continue,
        }
    }

    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            StatusSignal::EndOfTransmission | StatusSignal::UnknownCompletion(_)
        )
    }
}

/// A chunk received from the BLE storage stream, classified by shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet<'a> {
    Empty,
    Status(StatusSignal),
    Standard(&'a [u8]),
    Packed(&'a [u8]),
    Irregular(&'a [u8]),
}

impl<'a> Packet<'a> {
    pub fn classify(chunk: &'a [u8]) -> Self {
        match chunk.len() {
            0 => Packet::Empty,
            1 => Packet::Status(StatusSignal::from_code(chunk[0])),
            STANDARD_PACKET_SIZE => Packet::Standard(chunk),
            PACKED_PACKET_SIZE => Packet::Packed(chunk),
            _ => Packet::Irregular(chunk),
        }
    }
}

/// Extract the trailing 80-byte frame from a standard packet, if it validates.
pub fn standard_packet_frame(packet: &[u8]) -> Option<&[u8]> {
    if packet.len() != STANDARD_PACKET_SIZE {
        return None;
    }
    let frame = &packet[STANDARD_PACKET_SIZE - STANDARD_FRAME_SIZE..];
    is_valid_frame(frame).then_some(frame)
}

/// Result of one pass of the frame splitter over a buffer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SplitOutcome {
    /// Valid frames in wire order.
    pub frames: Vec<Frame>,
    /// Bytes of the input fully accounted for. Everything past this offset is an
    /// incomplete trailing record.
    pub consumed: usize,
    /// Records that had a length but failed validation.
    pub dropped: usize,
    /// Padding bytes still to skip past the end of the buffer, when a zero
    /// length pointed at a block boundary beyond it.
    pub pending_skip: u64,
}

/// Split a self-contained buffer that starts on a block boundary.
///
/// This is the BLE form: any incomplete trailing record is left unconsumed and
/// the caller discards it.
pub fn split_frames(buf: &[u8]) -> SplitOutcome {
    let mut outcome = SplitOutcome::default();
    scan_records(buf, 0, &mut outcome);
    outcome
}

fn next_block_boundary(position: u64) -> u64 {
    let block = PACKED_PACKET_SIZE as u64;
    position.div_ceil(block) * block
}

/// Walk `[len][frame]` records in `buf`, whose first byte sits at absolute
/// stream position `base`. Padding alignment is computed on absolute positions.
fn scan_records(buf: &[u8], base: u64, outcome: &mut SplitOutcome) {
    let mut offset = 0usize;

    while offset < buf.len() {
        let length = buf[offset] as usize;

        if length == 0 {
            let after_marker = base + offset as u64 + 1;
            let boundary = next_block_boundary(after_marker);
            let relative = boundary - base;
            if relative > buf.len() as u64 {
                outcome.pending_skip = relative - buf.len() as u64;
                offset = buf.len();
                break;
            }
            offset = relative as usize;
            continue;
        }

        let start = offset + 1;
        let end = start + length;
        if end > buf.len() {
            break;
        }

        let frame = &buf[start..end];
        if is_valid_frame(frame) {
            outcome.frames.push(frame.to_vec());
        } else {
            outcome.dropped += 1;
            trace!(toc = frame[0], length, "dropping invalid frame");
        }
        offset = end;
    }

    outcome.consumed = offset;
}

/// Stateful splitter for byte streams with arbitrary chunk boundaries.
///
/// Bytes that do not yet form a complete record are carried over and
/// prepended to the next chunk.
#[derive(Debug, Default)]
pub struct FrameReassembler {
    carry: Vec<u8>,
    /// Absolute stream position of `carry[0]`.
    position: u64,
    skip: u64,
    dropped: usize,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk and return the frames it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut chunk = chunk;
        if self.skip > 0 {
            let skipped = (self.skip as usize).min(chunk.len());
            self.skip -= skipped as u64;
            self.position += skipped as u64;
            chunk = &chunk[skipped..];
        }
        self.carry.extend_from_slice(chunk);
        self.drain()
    }

    /// Run the splitter once more over whatever is buffered and report the
    /// number of trailing bytes that never formed a complete frame.
    pub fn finish(&mut self) -> (Vec<Frame>, usize) {
        let frames = self.drain();
        let leftover = self.carry.len();
        self.carry.clear();
        (frames, leftover)
    }

    /// Bytes currently held back waiting for the rest of a record.
    pub fn carried(&self) -> usize {
        self.carry.len()
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    fn drain(&mut self) -> Vec<Frame> {
        let mut outcome = SplitOutcome::default();
        scan_records(&self.carry, self.position, &mut outcome);

        self.dropped += outcome.dropped;
        if outcome.pending_skip > 0 {
            // Only set once the whole carry was consumed, so it is measured from
            // the start of the next chunk.
            self.skip = outcome.pending_skip;
        }
        self.position += outcome.consumed as u64;
        self.carry.drain(..outcome.consumed);
        outcome.frames
    }
}
