//! SUMP wire protocol: command encoding and response decoding.
//!
//! Commands are either a single opcode byte (short) or an opcode followed by
//! four data bytes in little-endian order (long). Responses are the 4-byte
//! big-endian device id, the metadata record stream and raw sample words.

use crate::metadata::{MetadataKey, MetadataValue};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};

pub const CMD_RESET: u8 = 0x00;
pub const CMD_RUN: u8 = 0x01;
pub const CMD_ID: u8 = 0x02;
pub const CMD_SELFTEST: u8 = 0x03;
pub const CMD_METADATA: u8 = 0x04;

pub const SET_TRIGGER_MASK: u8 = 0xc0;
pub const SET_TRIGGER_VALUE: u8 = 0xc1;
pub const SET_TRIGGER_CONFIG: u8 = 0xc2;
pub const SET_DIVIDER: u8 = 0x80;
pub const SET_SIZE: u8 = 0x81;
pub const SET_FLAGS: u8 = 0x82;

/// Obsolete protocol, "SLA0".
pub const SLA_V0: u32 = 0x534c_4130;
/// Supported protocol, "SLA1".
pub const SLA_V1: u32 = 0x534c_4131;

/// Number of resets sent back to back. A device that is halfway through a
/// long command swallows up to four of them as data.
pub const RESET_REPEAT: usize = 5;

pub const TRIGGER_STAGES: usize = 4;
pub const MAX_GROUPS: usize = 4;

const TYPE_STRING: u8 = 0;
const TYPE_U32: u8 = 1;
const TYPE_U8: u8 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Metadata string for tag 0x{tag:02x} contains non-ASCII data")]
    NonAsciiString { tag: u8 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Whether the record stream is still aligned and reading may go on.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NonAsciiString { .. })
    }
}

/// Why a sample word could not be read.
#[derive(Debug, thiserror::Error)]
pub enum ReadInterrupted {
    #[error("Timed out waiting for sample data")]
    TimedOut,

    #[error("Sample stream ended")]
    EndOfStream,

    #[error("Sample readout cancelled")]
    Cancelled,

    /// The device stopped sending partway through a word.
    #[error("Sample word stalled after {bytes} byte(s)")]
    StalledWord { bytes: usize },

    #[error("IO error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for ReadInterrupted {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::TimedOut,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe => Self::EndOfStream,
            _ => Self::Io(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceId {
    Supported,
    Obsolete,
    Unknown(u32),
}

impl DeviceId {
    pub fn classify(id: u32) -> Self {
        match id {
            SLA_V1 => Self::Supported,
            SLA_V0 => Self::Obsolete,
            other => Self::Unknown(other),
        }
    }
}

/// One step of the metadata record stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataRecord {
    Entry(MetadataKey, MetadataValue),
    /// Tag with an unknown value type. Its value cannot be sized, so nothing
    /// beyond the tag is consumed.
    Skipped { tag: u8 },
    End,
}

pub fn encode_short_command(opcode: u8) -> [u8; 1] {
    [opcode]
}

pub fn encode_long_command(opcode: u8, data: u32) -> [u8; 5] {
    let [b0, b1, b2, b3] = data.to_le_bytes();
    [opcode, b0, b1, b2, b3]
}

/// Opcode offset for a trigger stage: stage `i` uses `base | 4 * i`.
pub fn trigger_opcode(base: u8, stage: usize) -> u8 {
    debug_assert!(stage < TRIGGER_STAGES);
    base | ((4 * stage) as u8 & 0x0c)
}

fn read_u8<R: Read + ?Sized>(reader: &mut R) -> io::Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "metadata stream ended mid-record")
}

pub fn read_device_id<R: Read + ?Sized>(reader: &mut R) -> io::Result<u32> {
    let mut raw = [0u8; 4];
    reader.read_exact(&mut raw)?;
    Ok(u32::from_be_bytes(raw))
}

fn read_string<R: Read + ?Sized>(reader: &mut R, tag: u8) -> Result<String, ProtocolError> {
    let mut raw = Vec::new();
    loop {
        match read_u8(reader)? {
            Some(0) => break,
            Some(b) => raw.push(b),
            None => return Err(eof().into()),
        }
    }
    if !raw.is_ascii() {
        return Err(ProtocolError::NonAsciiString { tag });
    }
    Ok(raw.into_iter().map(char::from).collect())
}

/// Reads the next metadata record. End of stream counts as the terminator.
pub fn read_metadata_record<R: Read + ?Sized>(
    reader: &mut R,
) -> Result<MetadataRecord, ProtocolError> {
    let tag = match read_u8(reader)? {
        None | Some(0) => return Ok(MetadataRecord::End),
        Some(tag) => tag,
    };
    let key = MetadataKey(tag);

    let value = match key.value_type() {
        TYPE_STRING => MetadataValue::Text(read_string(reader, tag)?),
        TYPE_U32 => {
            let mut raw = [0u8; 4];
            reader.read_exact(&mut raw)?;
            MetadataValue::U32(u32::from_be_bytes(raw))
        }
        TYPE_U8 => MetadataValue::U8(read_u8(reader)?.ok_or_else(eof)?),
        other => {
            log::info!("Ignoring unknown metadata type {} (tag 0x{:02x})", other, tag);
            return Ok(MetadataRecord::Skipped { tag });
        }
    };

    log::debug!("Read metadata 0x{:02x} -> {}", tag, value);
    Ok(MetadataRecord::Entry(key, value))
}

/// Read timeouts tolerated between two bytes of the same sample word.
pub const MID_WORD_TIMEOUTS: usize = 10;

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// Reads one sample word: one byte per enabled group among the first
/// `group_count` groups, little-endian by group index. Disabled groups read
/// as zero and consume nothing.
///
/// A timeout before the first byte is returned as [`ReadInterrupted::TimedOut`]
/// with nothing consumed. Once a word has started, up to
/// [`MID_WORD_TIMEOUTS`] timeouts are waited out so the stream stays framed;
/// after that the word fails with [`ReadInterrupted::StalledWord`].
pub fn read_sample_word<R: Read + ?Sized>(
    reader: &mut R,
    enabled_groups: [bool; MAX_GROUPS],
    group_count: usize,
    cancel: &AtomicBool,
) -> Result<u32, ReadInterrupted> {
    let mut value = 0u32;
    let mut consumed = 0;
    let mut timeouts = 0;
    for (group, _) in enabled_groups
        .iter()
        .enumerate()
        .take(group_count.min(MAX_GROUPS))
        .filter(|(_, enabled)| **enabled)
    {
        let byte = loop {
            match read_u8(reader) {
                Ok(Some(byte)) => break byte,
                Ok(None) => return Err(ReadInterrupted::EndOfStream),
                Err(e) if consumed > 0 && is_timeout(&e) => {
                    if cancel.load(Ordering::SeqCst) {
                        return Err(ReadInterrupted::Cancelled);
                    }
                    if timeouts == MID_WORD_TIMEOUTS {
                        return Err(ReadInterrupted::StalledWord { bytes: consumed });
                    }
                    timeouts += 1;
                    log::debug!("Timeout inside sample word at group {}, waiting", group);
                }
                Err(e) => return Err(e.into()),
            }
        };
        if cancel.load(Ordering::SeqCst) {
            return Err(ReadInterrupted::Cancelled);
        }
        consumed += 1;
        value |= u32::from(byte) << (8 * group);
    }
    Ok(value)
}
