//! Newline framing for device links.
//!
//! Firmware terminates every message with `\n` (some add `\r\n`).  Serial
//! reads return arbitrary slices of the byte stream, so [`LineFramer`]
//! buffers partial input and hands back one complete frame at a time.

/// Largest frame accepted before the buffered bytes are discarded.
pub const MAX_FRAME_BYTES: usize = 4096;

/// Raised when a partial frame grows past [`MAX_FRAME_BYTES`] without a
/// terminator.  The buffered bytes have already been dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOverflow {
    pub discarded: usize,
}

/// Incremental splitter for `\n`-terminated frames.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the link.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete, non-empty frame.
    ///
    /// Returns `Ok(None)` when only a partial frame is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameOverflow> {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut frame: Vec<u8> = self.buf.drain(..=pos).collect();
            frame.pop();
            if frame.last() == Some(&b'\r') {
                frame.pop();
            }
            if !frame.is_empty() {
                return Ok(Some(frame));
            }
        }

        if self.buf.len() > MAX_FRAME_BYTES {
            let discarded = self.buf.len();
            self.buf.clear();
            return Err(FrameOverflow { discarded });
        }
        Ok(None)
    }

    /// Number of bytes waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Frame an outbound message.
    pub fn encode(frame: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(frame.len() + 1);
        out.extend_from_slice(frame);
        out.push(b'\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_split_across_reads_is_reassembled() {
        let mut framer = LineFramer::new();
        framer.push(b"23.");
        assert_eq!(framer.next_frame(), Ok(None));
        framer.push(b"5\n");
        assert_eq!(framer.next_frame(), Ok(Some(b"23.5".to_vec())));
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn several_frames_in_one_read_come_out_in_order() {
        let mut framer = LineFramer::new();
        framer.push(b"a\r\nb\n\nc");
        assert_eq!(framer.next_frame(), Ok(Some(b"a".to_vec())));
        assert_eq!(framer.next_frame(), Ok(Some(b"b".to_vec())));
        // empty line skipped, "c" still partial
        assert_eq!(framer.next_frame(), Ok(None));
        assert_eq!(framer.pending(), 1);
    }

    #[test]
    fn overlong_partial_frame_is_discarded() {
        let mut framer = LineFramer::new();
        framer.push(&vec![b'x'; MAX_FRAME_BYTES + 1]);
        assert_eq!(
            framer.next_frame(),
            Err(FrameOverflow {
                discarded: MAX_FRAME_BYTES + 1
            })
        );
        assert_eq!(framer.pending(), 0);

        framer.push(b"ok\n");
        assert_eq!(framer.next_frame(), Ok(Some(b"ok".to_vec())));
    }

    #[test]
    fn encode_appends_newline() {
        assert_eq!(LineFramer::encode(b"{}"), b"{}\n".to_vec());
    }
}
