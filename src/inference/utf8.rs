//! UTF-8 reassembly of native text chunks
//!
//! The runtime hands out raw byte chunks that may cut a multi-byte code point
//! in half. Complete characters are decoded immediately; an incomplete tail is
//! carried over to the next chunk.

use thiserror::Error;

/// Bytes left in the carry buffer when the run ended
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{dropped} trailing byte(s) did not form a complete UTF-8 sequence")]
pub struct DecodeError {
    pub dropped: usize,
}

/// Decodes `carry ++ chunk`, returning the complete text and the new carry.
///
/// Only an incomplete sequence at the very end is carried. Bytes that can
/// never become valid UTF-8 are replaced with U+FFFD so one bad token does not
/// stall the rest of the stream.
pub fn feed(carry: &[u8], chunk: &[u8]) -> (String, Vec<u8>) {
    let mut buffer = Vec::with_capacity(carry.len() + chunk.len());
    buffer.extend_from_slice(carry);
    buffer.extend_from_slice(chunk);

    let mut decoded = String::with_capacity(buffer.len());
    let mut rest = buffer.as_slice();

    loop {
        match std::str::from_utf8(rest) {
            Ok(text) => {
                decoded.push_str(text);
                return (decoded, Vec::new());
            }
            Err(error) => {
                let (valid, tail) = rest.split_at(error.valid_up_to());
                // `valid` is exactly the prefix the validator accepted
                decoded.push_str(&String::from_utf8_lossy(valid));

                match error.error_len() {
                    None => return (decoded, tail.to_vec()),
                    Some(len) => {
                        tracing::warn!("Replacing {} invalid UTF-8 byte(s) in native output", len);
                        decoded.push(char::REPLACEMENT_CHARACTER);
                        rest = &tail[len..];
                    }
                }
            }
        }
    }
}

/// Carry buffer owned by a single run
#[derive(Debug, Default)]
pub struct ByteReassembler {
    carry: Vec<u8>,
}

impl ByteReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one native chunk and returns whatever text is now complete
    pub fn push(&mut self, chunk: &[u8]) -> String {
        let (decoded, carry) = feed(&self.carry, chunk);
        self.carry = carry;
        decoded
    }

    /// Number of bytes waiting for the rest of their code point
    pub fn pending(&self) -> usize {
        self.carry.len()
    }

    /// Ends the run. A leftover tail is dropped and reported.
    pub fn finish(&mut self) -> Result<(), DecodeError> {
        let dropped = self.carry.len();
        self.carry.clear();
        if dropped == 0 {
            Ok(())
        } else {
            Err(DecodeError { dropped })
        }
    }
}
