use crate::error::Error;
use flate2::{Decompress, FlushDecompress, Status};
use tracing::trace;

/// Marker that terminates every complete zlib-stream message
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Buffers larger than this are released after a message is decoded
const MAX_RETAINED_CAPACITY: usize = 64 * 1024;

/// Decoder for `compress=zlib-stream` transport compression.
///
/// The gateway compresses the whole connection as one zlib stream and
/// sync-flushes after each message, so a message may span several binary
/// frames and every message depends on the dictionary built by the ones
/// before it. One decoder must live for exactly one connection.
pub struct ZlibStreamDecoder {
    inflater: Decompress,
    buffer: Vec<u8>,
    frames: usize,
}

impl Default for ZlibStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ZlibStreamDecoder {
    pub fn new() -> Self {
        Self {
            inflater: Decompress::new(true),
            buffer: Vec::new(),
            frames: 0,
        }
    }

    /// Feed one binary frame.
    ///
    /// Returns the inflated message once the accumulated bytes end with
    /// [`ZLIB_SUFFIX`], or `None` while the message is still incomplete.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.buffer.extend_from_slice(frame);
        self.frames += 1;

        if !self.buffer.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let result = self.inflate();
        trace!(
            "inflated zlib-stream message from {} frame(s), {} compressed bytes",
            self.frames,
            self.buffer.len()
        );

        self.buffer.clear();
        if self.buffer.capacity() > MAX_RETAINED_CAPACITY {
            self.buffer.shrink_to(MAX_RETAINED_CAPACITY);
        }
        self.frames = 0;

        result.map(Some)
    }

    /// Whether a partial message is waiting for more frames
    pub fn is_buffering(&self) -> bool {
        !self.buffer.is_empty()
    }

    fn inflate(&mut self) -> Result<Vec<u8>, Error> {
        let mut output = Vec::with_capacity((self.buffer.len() * 4).max(1024));
        let mut consumed = 0usize;

        loop {
            if output.len() == output.capacity() {
                output.reserve(output.capacity().max(1024));
            }

            let in_before = self.inflater.total_in();
            let out_before = self.inflater.total_out();
            let status = self.inflater.decompress_vec(
                &self.buffer[consumed..],
                &mut output,
                FlushDecompress::Sync,
            )?;
            let read = (self.inflater.total_in() - in_before) as usize;
            let written = self.inflater.total_out() - out_before;
            consumed += read;

            if status == Status::StreamEnd {
                break;
            }

            let output_full = output.len() == output.capacity();
            if consumed >= self.buffer.len() && !output_full {
                break;
            }
            // No progress with room to spare means the input is exhausted
            if read == 0 && written == 0 && !output_full {
                break;
            }
        }

        Ok(output)
    }
}
