//! Charset handling for the child line protocol.
//!
//! ISO-8859-1 is the default on purpose: it is the only single-byte
//! encoding whose byte↔char mapping is the identity, so arbitrary child
//! output (inline base64 payloads included) round-trips through `String`
//! losslessly. Do not "upgrade" a pool to UTF-8 unless the child is
//! known to emit valid UTF-8.

use std::io;

/// Decoding/encoding applied to a child's standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    /// ISO-8859-1. Lossless for arbitrary byte sequences.
    #[default]
    Latin1,
    /// UTF-8 with lossy decoding (invalid sequences become U+FFFD).
    Utf8,
}

impl Charset {
    /// Decode raw stream bytes into a line string.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Charset::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
            Charset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    /// Encode an instruction for the child's stdin.
    ///
    /// Under `Latin1`, characters above U+00FF are not representable and
    /// produce an `InvalidData` error.
    pub fn encode(&self, text: &str) -> io::Result<Vec<u8>> {
        match self {
            Charset::Latin1 => text
                .chars()
                .map(|c| {
                    u8::try_from(u32::from(c)).map_err(|_| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("character {c:?} is not representable in ISO-8859-1"),
                        )
                    })
                })
                .collect(),
            Charset::Utf8 => Ok(text.as_bytes().to_vec()),
        }
    }
}
