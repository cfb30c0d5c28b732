use flate2::{Decompress, FlushDecompress, Status};

use super::error::{GatewayError, Result};

/// Every complete zlib-stream message ends with a sync flush marker.
const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Accumulates binary frames of a zlib-stream transport and inflates them once a
/// whole message has arrived. The inflate context is shared by every message on
/// the connection, so one `Inflater` lives exactly as long as one socket.
pub struct Inflater {
    buffer: Vec<u8>,
    decompress: Decompress,
}

impl Inflater {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            decompress: Decompress::new(true),
        }
    }

    /// Feed one binary frame. Returns the decoded text when the frame completes a
    /// message, `None` while more frames are needed.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<String>> {
        self.buffer.extend_from_slice(chunk);

        if self.buffer.len() < ZLIB_SUFFIX.len() || !self.buffer.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let inflated = self.inflate();
        self.buffer.clear();
        let bytes = match inflated {
            Ok(bytes) => bytes,
            Err(e) => {
                // the shared context is unusable past a bad block
                self.reset();
                return Err(e);
            }
        };

        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| GatewayError::Decode(format!("inflated frame is not UTF-8: {e}")))
    }

    fn inflate(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.buffer.len() * 4 + 64);
        let mut offset = 0;

        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(1024));
            }

            let in_before = self.decompress.total_in();
            let out_before = out.len();
            let status = self
                .decompress
                .decompress_vec(&self.buffer[offset..], &mut out, FlushDecompress::Sync)
                .map_err(|e| GatewayError::Decode(e.to_string()))?;

            let consumed = (self.decompress.total_in() - in_before) as usize;
            offset += consumed;
            let produced = out.len() - out_before;

            let input_drained = offset >= self.buffer.len();
            if matches!(status, Status::StreamEnd) || (input_drained && out.len() < out.capacity()) {
                break;
            }
            // no progress with room to spare means the stream is stuck
            if consumed == 0 && produced == 0 && out.len() < out.capacity() {
                break;
            }
        }

        Ok(out)
    }

    /// Forget buffered bytes and start a fresh inflate context
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.decompress.reset(true);
    }

    /// Bytes waiting for a terminator
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compress, Compression, FlushCompress};

    fn compress_message(compressor: &mut Compress, text: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(text.len() + 128);
        compressor
            .compress_vec(text.as_bytes(), &mut out, FlushCompress::Sync)
            .unwrap();
        out
    }

    #[test]
    fn test_waits_for_suffix() {
        let mut compressor = Compress::new(Compression::default(), true);
        let frame = compress_message(&mut compressor, r#"{"op":11,"d":null}"#);
        assert!(frame.ends_with(&ZLIB_SUFFIX));

        let (head, tail) = frame.split_at(frame.len() / 2);
        let mut inflater = Inflater::new();
        assert_eq!(inflater.push(head).unwrap(), None);
        assert_eq!(inflater.pending(), head.len());

        let text = inflater.push(tail).unwrap().unwrap();
        assert_eq!(text, r#"{"op":11,"d":null}"#);
        assert_eq!(inflater.pending(), 0);
    }

    #[test]
    fn test_context_shared_across_messages() {
        let mut compressor = Compress::new(Compression::default(), true);
        let mut inflater = Inflater::new();

        for i in 0..5 {
            let text = format!(r#"{{"op":0,"s":{i},"t":"MESSAGE_CREATE","d":{{"content":"hello hello hello"}}}}"#);
            let frame = compress_message(&mut compressor, &text);
            assert_eq!(inflater.push(&frame).unwrap().as_deref(), Some(text.as_str()));
        }
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        let mut inflater = Inflater::new();
        let result = inflater.push(&[0x12, 0x34, 0x56, 0x00, 0x00, 0xff, 0xff]);
        assert!(matches!(result, Err(GatewayError::Decode(_))));
        assert_eq!(inflater.pending(), 0);
    }

    #[test]
    fn test_fresh_stream_decodes_after_corruption() {
        let mut inflater = Inflater::new();
        assert!(inflater.push(&[0x78, 0x9c, 0xff, 0xee, 0x00, 0x00, 0xff, 0xff]).is_err());

        let mut compressor = Compress::new(Compression::default(), true);
        let frame = compress_message(&mut compressor, r#"{"op":10,"d":{"heartbeat_interval":45000}}"#);
        assert_eq!(
            inflater.push(&frame).unwrap().as_deref(),
            Some(r#"{"op":10,"d":{"heartbeat_interval":45000}}"#)
        );
    }
}
