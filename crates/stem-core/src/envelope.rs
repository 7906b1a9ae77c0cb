//! Envelope - (meta, payload) の転送フォーマット
//!
//! Binary framing used between the process runner and its workers.
//!
//! ```text
//! "#~" | format (4) | meta encoding (2) | meta len (u32 BE) | data len (u32 BE)
//!      | meta bytes | data bytes | "~#"
//! ```
//!
//! Meta is always written as JSON (`JS`). The legacy `..` tag is read as JSON
//! too. Both the sync (`std::io`) and async (`tokio::io`) sides share the same
//! header parsing.
//!
//! # 大きな payload
//! A data section of [`MMAP_THRESHOLD`] bytes or more is not buffered: it is
//! spooled into an anonymous temporary file and memory-mapped from there.
//! Meta is always parsed in memory, so a meta section that large is refused.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::ops::Deref;

use memmap2::Mmap;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const START_MARKER: [u8; 2] = *b"#~";
pub const END_MARKER: [u8; 2] = *b"~#";
pub const DEFAULT_FORMAT: [u8; 4] = *b"DF02";
pub const JSON_ENCODING: [u8; 2] = *b"JS";
const LEGACY_ENCODING: [u8; 2] = *b"..";

/// Data sections at or above this size are memory-mapped instead of buffered.
pub const MMAP_THRESHOLD: usize = 128 * 1024 * 1024;

const HEADER_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("expected marker {expected:?}, found {found:?}")]
    BadMarker { expected: String, found: String },

    #[error("unsupported meta encoding {0:?}")]
    UnsupportedEncoding(String),

    #[error("section of {0} bytes is too large")]
    PayloadTooLarge(usize),

    #[error("envelope meta is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Binary data section, either in memory or mapped from a spool file.
pub enum Payload {
    Bytes(Vec<u8>),
    Mapped(Mmap),
}

impl Payload {
    pub fn is_mapped(&self) -> bool {
        matches!(self, Payload::Mapped(_))
    }

    /// Copies `len` bytes from `input` into an unlinked temporary file and
    /// maps it.
    fn spool(input: &mut impl Read, len: usize) -> Result<Self, EnvelopeError> {
        let mut file = tempfile::tempfile()?;
        let copied = io::copy(&mut input.take(len as u64), &mut file)?;
        check_copied(copied, len)?;
        map(&file)
    }

    async fn spool_async<R>(reader: &mut R, len: usize) -> Result<Self, EnvelopeError>
    where
        R: AsyncRead + Unpin,
    {
        let mut file = tokio::fs::File::from_std(tempfile::tempfile()?);
        let copied = tokio::io::copy(&mut reader.take(len as u64), &mut file).await?;
        check_copied(copied, len)?;
        file.flush().await?;
        map(&file.into_std().await)
    }
}

fn check_copied(copied: u64, len: usize) -> Result<(), EnvelopeError> {
    if copied != len as u64 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("data section ended after {copied} of {len} bytes"),
        )
        .into());
    }
    Ok(())
}

fn map(file: &File) -> Result<Payload, EnvelopeError> {
    // SAFETY: the spool file is anonymous and owned here; nothing else can
    // truncate or write it while the map is alive.
    let mmap = unsafe { Mmap::map(file)? };
    Ok(Payload::Mapped(mmap))
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Bytes(Vec::new())
    }
}

impl Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Payload::Bytes(bytes) => bytes,
            Payload::Mapped(mmap) => mmap,
        }
    }
}

impl AsRef<[u8]> for Payload {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl Clone for Payload {
    /// A clone is always an in-memory copy.
    fn clone(&self) -> Self {
        Payload::Bytes(self.to_vec())
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_mapped() { "Mapped" } else { "Bytes" };
        write!(f, "Payload::{kind}({} bytes)", self.len())
    }
}

/// Metadata plus an opaque binary payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub format: [u8; 4],
    pub meta: Value,
    pub data: Payload,
}

struct Header {
    format: [u8; 4],
    meta_len: usize,
    data_len: usize,
}

fn marker_error(expected: [u8; 2], found: &[u8]) -> EnvelopeError {
    EnvelopeError::BadMarker {
        expected: String::from_utf8_lossy(&expected).into_owned(),
        found: String::from_utf8_lossy(found).into_owned(),
    }
}

fn section_len(len: usize) -> Result<[u8; 4], EnvelopeError> {
    u32::try_from(len)
        .map(u32::to_be_bytes)
        .map_err(|_| EnvelopeError::PayloadTooLarge(len))
}

impl Header {
    fn parse(buf: &[u8; HEADER_LEN]) -> Result<Self, EnvelopeError> {
        if buf[0..2] != START_MARKER {
            return Err(marker_error(START_MARKER, &buf[0..2]));
        }
        let mut format = [0u8; 4];
        format.copy_from_slice(&buf[2..6]);

        let encoding = &buf[6..8];
        if *encoding != JSON_ENCODING && *encoding != LEGACY_ENCODING {
            return Err(EnvelopeError::UnsupportedEncoding(
                String::from_utf8_lossy(encoding).into_owned(),
            ));
        }

        let mut meta_len = [0u8; 4];
        meta_len.copy_from_slice(&buf[8..12]);
        let mut data_len = [0u8; 4];
        data_len.copy_from_slice(&buf[12..16]);

        let meta_len = u32::from_be_bytes(meta_len) as usize;
        if meta_len >= MMAP_THRESHOLD {
            return Err(EnvelopeError::PayloadTooLarge(meta_len));
        }

        Ok(Self {
            format,
            meta_len,
            data_len: u32::from_be_bytes(data_len) as usize,
        })
    }
}

impl Envelope {
    pub fn new(meta: Value, data: impl Into<Payload>) -> Self {
        Self {
            format: DEFAULT_FORMAT,
            meta,
            data: data.into(),
        }
    }

    /// Envelope carrying meta only.
    pub fn meta_only(meta: Value) -> Self {
        Self::new(meta, Payload::default())
    }

    fn assemble(header: Header, meta: &[u8], data: Payload, end: [u8; 2]) -> Result<Self, EnvelopeError> {
        if end != END_MARKER {
            return Err(marker_error(END_MARKER, &end));
        }
        Ok(Self {
            format: header.format,
            meta: serde_json::from_slice(meta)?,
            data,
        })
    }

    pub fn read(input: &mut impl Read) -> Result<Self, EnvelopeError> {
        Self::read_with_threshold(input, MMAP_THRESHOLD)
    }

    /// [`Envelope::read`] with a custom mapping threshold.
    pub fn read_with_threshold(input: &mut impl Read, mmap_threshold: usize) -> Result<Self, EnvelopeError> {
        let mut header = [0u8; HEADER_LEN];
        input.read_exact(&mut header)?;
        let header = Header::parse(&header)?;

        let mut meta = vec![0u8; header.meta_len];
        input.read_exact(&mut meta)?;
        let data = if header.data_len >= mmap_threshold {
            tracing::debug!(len = header.data_len, "mapping envelope data");
            Payload::spool(input, header.data_len)?
        } else {
            let mut data = vec![0u8; header.data_len];
            input.read_exact(&mut data)?;
            Payload::Bytes(data)
        };
        let mut end = [0u8; 2];
        input.read_exact(&mut end)?;

        Self::assemble(header, &meta, data, end)
    }

    fn header(&self, meta: &[u8]) -> Result<[u8; HEADER_LEN], EnvelopeError> {
        if meta.len() >= MMAP_THRESHOLD {
            return Err(EnvelopeError::PayloadTooLarge(meta.len()));
        }
        let mut header = [0u8; HEADER_LEN];
        header[0..2].copy_from_slice(&START_MARKER);
        header[2..6].copy_from_slice(&self.format);
        header[6..8].copy_from_slice(&JSON_ENCODING);
        header[8..12].copy_from_slice(&section_len(meta.len())?);
        header[12..16].copy_from_slice(&section_len(self.data.len())?);
        Ok(header)
    }

    /// Writes the envelope section by section; the data is never copied.
    pub fn write_to(&self, output: &mut impl Write) -> Result<(), EnvelopeError> {
        let meta = serde_json::to_vec(&self.meta)?;
        output.write_all(&self.header(&meta)?)?;
        output.write_all(&meta)?;
        output.write_all(&self.data)?;
        output.write_all(&END_MARKER)?;
        output.flush()?;
        Ok(())
    }

    pub fn from_bytes(mut buffer: &[u8]) -> Result<Self, EnvelopeError> {
        Self::read(&mut buffer)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len() + END_MARKER.len());
        self.write_to(&mut out)?;
        Ok(out)
    }

    pub async fn async_read<R>(reader: &mut R) -> Result<Self, EnvelopeError>
    where
        R: AsyncRead + Unpin,
    {
        Self::async_read_with_threshold(reader, MMAP_THRESHOLD).await
    }

    pub async fn async_read_with_threshold<R>(reader: &mut R, mmap_threshold: usize) -> Result<Self, EnvelopeError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;
        let header = Header::parse(&header)?;

        let mut meta = vec![0u8; header.meta_len];
        reader.read_exact(&mut meta).await?;
        let data = if header.data_len >= mmap_threshold {
            tracing::debug!(len = header.data_len, "mapping envelope data");
            Payload::spool_async(reader, header.data_len).await?
        } else {
            let mut data = vec![0u8; header.data_len];
            reader.read_exact(&mut data).await?;
            Payload::Bytes(data)
        };
        let mut end = [0u8; 2];
        reader.read_exact(&mut end).await?;

        Self::assemble(header, &meta, data, end)
    }

    pub async fn async_write_to<W>(&self, writer: &mut W) -> Result<(), EnvelopeError>
    where
        W: AsyncWrite + Unpin,
    {
        let meta = serde_json::to_vec(&self.meta)?;
        writer.write_all(&self.header(&meta)?).await?;
        writer.write_all(&meta).await?;
        writer.write_all(&self.data).await?;
        writer.write_all(&END_MARKER).await?;
        writer.flush().await?;
        Ok(())
    }
}
