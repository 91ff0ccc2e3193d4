// Padded packet buffer
// Reassembled access units must be followed by the engine's input padding

use bytes::BytesMut;

/// Default trailing padding, matches FFmpeg's AV_INPUT_BUFFER_PADDING_SIZE
pub const INPUT_PADDING: usize = 64;

/// Reusable buffer holding one access unit plus zeroed trailing padding.
///
/// Hosts append the pieces of an access unit, hand it to
/// `DecodeSession::decode_packet`, then `clear()` it for the next one. The
/// allocation is kept across access units.
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    buf: BytesMut,
    len: usize,
    padding: usize,
}

impl PacketBuffer {
    pub fn new(padding: usize) -> Self {
        Self::with_capacity(0, padding)
    }

    pub fn with_capacity(capacity: usize, padding: usize) -> Self {
        let mut buf = BytesMut::with_capacity(capacity + padding);
        buf.resize(padding, 0);
        Self {
            buf,
            len: 0,
            padding,
        }
    }

    /// Append payload bytes, keeping the padding zeroed behind them
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.truncate(self.len);
        self.buf.extend_from_slice(data);
        self.len += data.len();
        self.buf.resize(self.len + self.padding, 0);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.len = 0;
        self.buf.resize(self.padding, 0);
    }

    /// Payload length, padding excluded
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Payload followed by the padding
    pub fn padded(&self) -> &[u8] {
        &self.buf
    }
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new(INPUT_PADDING)
    }
}
