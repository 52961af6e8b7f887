/// Incremental UTF-8 decoding for process output streams
///
/// Output arrives in arbitrary chunks, so a multi-byte character may be split
/// across two reads. The decoder holds back an incomplete trailing sequence
/// until the next chunk completes it.
use encoding_rs::{CoderResult, Decoder, UTF_8};

pub struct Utf8Decoder {
    decoder: Decoder,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self {
            decoder: UTF_8.new_decoder_without_bom_handling(),
        }
    }

    /// Decode a chunk, returning all text that is complete so far
    /// Invalid sequences are replaced with U+FFFD
    pub fn write(&mut self, chunk: &[u8]) -> String {
        self.decode(chunk, false)
    }

    /// Flush whatever is still buffered once the stream has ended
    pub fn finish(&mut self) -> String {
        let rest = self.decode(&[], true);
        self.decoder = UTF_8.new_decoder_without_bom_handling();
        rest
    }

    fn decode(&mut self, mut src: &[u8], last: bool) -> String {
        let mut out = String::new();
        loop {
            let needed = self
                .decoder
                .max_utf8_buffer_length(src.len())
                .unwrap_or(src.len().saturating_mul(3).saturating_add(16));
            out.reserve(needed);

            let (result, read, _) = self.decoder.decode_to_string(src, &mut out, last);
            src = &src[read..];
            match result {
                CoderResult::InputEmpty => return out,
                CoderResult::OutputFull => continue,
            }
        }
    }
}

impl Default for Utf8Decoder {
    fn default() -> Self {
        Self::new()
    }
}
