//! Splits the Crypt4GH framing off an encrypted container.
//!
//! The container opens with a fixed preamble (magic bytes, format
//! version, packet count) followed by length-prefixed header packets;
//! the encrypted payload starts right after the last packet. The
//! [`split`] function reads exactly through the header and leaves the
//! reader positioned at the first payload byte, so the caller can stream
//! the remainder elsewhere.
//!
//! The header content is opaque to this worker: packets are collected
//! byte-for-byte, never interpreted.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// The magic bytes opening every Crypt4GH container.
pub const MAGIC: [u8; 8] = *b"crypt4gh";

/// The single container format version this worker accepts.
pub const VERSION: u32 = 1;

/// The length of the container preamble: magic, version, packet count.
const PREAMBLE_LEN: usize = 16;

/// The header of a container, split off the payload.
#[derive(Debug, PartialEq, Eq)]
pub struct SplitHeader {
    /// The preamble bytes read before the packets proper.
    pub beginning: Vec<u8>,
    /// The header packets, verbatim, including their length prefixes.
    pub header: Vec<u8>,
}

impl SplitHeader {
    /// Renders the full header prefix (`beginning` followed by `header`)
    /// as lowercase hex, the form persisted in the database and echoed in
    /// the outbound message.
    pub fn to_hex(&self) -> String {
        let mut prefix = Vec::with_capacity(self.beginning.len() + self.header.len());
        prefix.extend_from_slice(&self.beginning);
        prefix.extend_from_slice(&self.header);

        hex::encode(prefix)
    }
}

/// Represents a rejected or unreadable container header.
#[derive(Debug, Error)]
pub enum HeaderError {
    /// The stream does not open with the Crypt4GH magic bytes.
    #[error("not a Crypt4GH container (bad magic bytes)")]
    BadMagic,

    /// The container declares a format version this worker cannot handle.
    #[error("unsupported Crypt4GH version {0}")]
    UnsupportedVersion(u32),

    /// The stream ended, or a packet length went inconsistent, before the
    /// declared header was complete.
    #[error("Crypt4GH header is truncated")]
    Truncated,

    /// The stream could not be read at all.
    #[error("cannot read the container header")]
    Io(#[from] io::Error),
}

/// Reads the Crypt4GH header off the given reader, leaving the reader
/// positioned at the start of the encrypted payload.
pub async fn split<R>(reader: &mut R) -> Result<SplitHeader, HeaderError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    // The preamble: magic, version, packet count
    let mut beginning = [0u8; PREAMBLE_LEN];
    read_fully(reader, &mut beginning).await?;

    if beginning[0..8] != MAGIC {
        return Err(HeaderError::BadMagic);
    }

    let version = u32::from_le_bytes([beginning[8], beginning[9], beginning[10], beginning[11]]);
    if version != VERSION {
        return Err(HeaderError::UnsupportedVersion(version));
    }

    let packet_count =
        u32::from_le_bytes([beginning[12], beginning[13], beginning[14], beginning[15]]);

    // The packets: each length-prefixed, the length covering its own four
    // bytes
    let mut header = Vec::new();
    for _ in 0..packet_count {
        let mut length_bytes = [0u8; 4];
        read_fully(reader, &mut length_bytes).await?;

        let packet_length = u32::from_le_bytes(length_bytes) as usize;
        if packet_length < 4 {
            return Err(HeaderError::Truncated);
        }

        header.extend_from_slice(&length_bytes);

        let mut packet = vec![0u8; packet_length - 4];
        read_fully(reader, &mut packet).await?;
        header.extend_from_slice(&packet);
    }

    Ok(SplitHeader {
        beginning: beginning.to_vec(),
        header,
    })
}

/// Fills the given buffer, translating a premature EOF into
/// [`Truncated`](HeaderError::Truncated).
async fn read_fully<R>(reader: &mut R, buffer: &mut [u8]) -> Result<(), HeaderError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    reader.read_exact(buffer).await.map_err(|error| {
        if error.kind() == io::ErrorKind::UnexpectedEof {
            HeaderError::Truncated
        } else {
            HeaderError::Io(error)
        }
    })?;

    Ok(())
}
