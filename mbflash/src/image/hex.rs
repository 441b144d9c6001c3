//! Intel HEX encoding of an embedded MicroPython script.
//!
//! The MicroPython firmware for the micro:bit looks for a user script at a
//! fixed flash address. The script is stored behind a small header:
//!
//! ```text
//! +-----------+-----------+-------------+-------------+----------------+---------+
//! | sig[0]    | sig[1]    | len & 0xFF  | len >> 8    | script bytes   | 0 pad   |
//! | 'M' (77)  | 'P' (80)  |             |             | (len bytes)    | to 16n  |
//! +-----------+-----------+-------------+-------------+----------------+---------+
//! ```
//!
//! The padded block is emitted as 16-byte data records:
//!
//! ```text
//! :LLAAAATTDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDCC
//!  |  |   | |                               +-- checksum
//!  |  |   | +-- payload (LL bytes)
//!  |  |   +-- record type (00 = data)
//!  |  +-- low 16 bits of the address
//!  +-- payload length
//! ```

use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};

/// Default script signature (`"MP"`).
pub const DEFAULT_SIGNATURE: [u8; 2] = *b"MP";

/// Default flash address of the script block.
pub const DEFAULT_FLASH_START: u32 = 0x3E000;

/// Default size of the flash region reserved for header plus script.
pub const DEFAULT_CAPACITY: usize = 0x2000;

/// Size of the script header in bytes.
pub const HEADER_SIZE: usize = 4;

/// Payload size of each emitted data record.
pub const RECORD_DATA_SIZE: usize = 16;

/// Intel HEX record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Data record (00).
    Data,
    /// End of file (01).
    EndOfFile,
    /// Extended segment address (02).
    ExtendedSegmentAddress,
    /// Start segment address (03).
    StartSegmentAddress,
    /// Extended linear address (04).
    ExtendedLinearAddress,
    /// Start linear address (05).
    StartLinearAddress,
}

impl From<RecordType> for u8 {
    fn from(ty: RecordType) -> Self {
        match ty {
            RecordType::Data => 0x00,
            RecordType::EndOfFile => 0x01,
            RecordType::ExtendedSegmentAddress => 0x02,
            RecordType::StartSegmentAddress => 0x03,
            RecordType::ExtendedLinearAddress => 0x04,
            RecordType::StartLinearAddress => 0x05,
        }
    }
}

impl TryFrom<u8> for RecordType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0x00 => Ok(Self::Data),
            0x01 => Ok(Self::EndOfFile),
            0x02 => Ok(Self::ExtendedSegmentAddress),
            0x03 => Ok(Self::StartSegmentAddress),
            0x04 => Ok(Self::ExtendedLinearAddress),
            0x05 => Ok(Self::StartLinearAddress),
            other => Err(other),
        }
    }
}

/// A single Intel HEX record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    /// Low 16 bits of the load address.
    pub address: u16,
    /// Record type.
    pub record_type: RecordType,
    payload: Vec<u8>,
}

impl HexRecord {
    /// Create a data record. Payloads longer than 255 bytes are rejected.
    pub fn data(address: u16, payload: &[u8]) -> Result<Self> {
        if payload.len() > usize::from(u8::MAX) {
            return Err(Error::RecordTooLong { len: payload.len() });
        }
        Ok(Self {
            address,
            record_type: RecordType::Data,
            payload: payload.to_vec(),
        })
    }

    /// Create an extended linear address record for the given upper 16 bits.
    pub fn extended_linear_address(upper: u16) -> Self {
        Self {
            address: 0,
            record_type: RecordType::ExtendedLinearAddress,
            payload: upper.to_be_bytes().to_vec(),
        }
    }

    /// Payload bytes (at most 255).
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length as stored in the record.
    pub fn byte_count(&self) -> u8 {
        u8::try_from(self.payload.len()).unwrap_or(u8::MAX)
    }

    /// Two's complement of the sum of every byte preceding the checksum.
    pub fn checksum(&self) -> u8 {
        let [hi, lo] = self.address.to_be_bytes();
        let sum = [self.byte_count(), hi, lo, u8::from(self.record_type)]
            .iter()
            .chain(&self.payload)
            .fold(0u8, |acc, b| acc.wrapping_add(*b));
        sum.wrapping_neg()
    }

    /// Serialize the record as an upper-case Intel HEX line (without newline).
    pub fn to_line(&self) -> String {
        let [hi, lo] = self.address.to_be_bytes();
        let mut line = String::with_capacity(11 + self.payload.len() * 2);
        line.push(':');
        for byte in [self.byte_count(), hi, lo, u8::from(self.record_type)]
            .iter()
            .chain(&self.payload)
            .chain(std::iter::once(&self.checksum()))
        {
            let _ = write!(line, "{byte:02X}");
        }
        line
    }

    /// Parse one Intel HEX line, verifying length and checksum.
    ///
    /// `line_no` is only used for error reporting.
    pub fn parse(line: &str, line_no: usize) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidHex {
            line: line_no,
            reason: reason.to_string(),
        };

        let digits = line
            .trim_end()
            .strip_prefix(':')
            .ok_or_else(|| invalid("missing ':' start code"))?;

        if !digits
            .bytes()
            .all(|b| b.is_ascii_hexdigit())
        {
            return Err(invalid("non-hexadecimal digit"));
        }
        if digits.len() % 2 != 0 || digits.len() < 10 {
            return Err(invalid("record too short or odd digit count"));
        }

        let bytes = (0..digits.len())
            .step_by(2)
            .map(|i| {
                digits
                    .get(i..i + 2)
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| invalid("non-hexadecimal digit"))
            })
            .collect::<Result<Vec<u8>>>()?;

        let count = usize::from(bytes[0]);
        if bytes.len() != count + 5 {
            return Err(invalid("byte count does not match record length"));
        }
        if bytes
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_add(*b))
            != 0
        {
            return Err(invalid("checksum mismatch"));
        }

        let record_type = RecordType::try_from(bytes[3])
            .map_err(|ty| invalid(&format!("unknown record type {ty:02X}")))?;

        Ok(Self {
            address: u16::from_be_bytes([bytes[1], bytes[2]]),
            record_type,
            payload: bytes[4..4 + count].to_vec(),
        })
    }
}

impl fmt::Display for HexRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// Parameters of the flash region the script is embedded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HexEncoderConfig {
    /// Two-byte signature the firmware looks for.
    pub signature: [u8; 2],
    /// Absolute flash address of the header.
    pub flash_start: u32,
    /// Bytes available for header plus script.
    pub capacity: usize,
    /// Emit extended linear address records ahead of the data records.
    pub segment_record: bool,
}

impl Default for HexEncoderConfig {
    fn default() -> Self {
        Self {
            signature: DEFAULT_SIGNATURE,
            flash_start: DEFAULT_FLASH_START,
            capacity: DEFAULT_CAPACITY,
            segment_record: false,
        }
    }
}

impl HexEncoderConfig {
    /// Set the flash start address.
    #[must_use]
    pub fn with_flash_start(mut self, flash_start: u32) -> Self {
        self.flash_start = flash_start;
        self
    }

    /// Set the region capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Enable or disable extended linear address records.
    #[must_use]
    pub fn with_segment_record(mut self, enabled: bool) -> Self {
        self.segment_record = enabled;
        self
    }

    /// Largest script (in bytes) that fits the region.
    pub fn max_script_len(&self) -> usize {
        self.capacity
            .saturating_sub(HEADER_SIZE)
            .min(usize::from(u16::MAX))
    }
}

/// Encodes scripts into Intel HEX data records.
#[derive(Debug, Clone, Default)]
pub struct HexEncoder {
    config: HexEncoderConfig,
}

impl HexEncoder {
    /// Create an encoder for the given flash region.
    pub fn new(config: HexEncoderConfig) -> Self {
        Self { config }
    }

    /// The flash region parameters.
    pub fn config(&self) -> &HexEncoderConfig {
        &self.config
    }

    /// Build header + script + zero padding, a multiple of 16 bytes long.
    pub fn padded_block(&self, script: &[u8]) -> Result<Vec<u8>> {
        let size = HEADER_SIZE + script.len();
        let too_large = Error::EncodingLimitExceeded {
            size,
            capacity: self.config.capacity,
        };
        if size > self.config.capacity {
            return Err(too_large);
        }
        let len = u16::try_from(script.len()).map_err(|_| too_large)?;

        let pad = (RECORD_DATA_SIZE - size % RECORD_DATA_SIZE) % RECORD_DATA_SIZE;
        let mut block = Vec::with_capacity(size + pad);
        block.extend_from_slice(&self.config.signature);
        let mut len_bytes = [0u8; 2];
        LittleEndian::write_u16(&mut len_bytes, len);
        block.extend_from_slice(&len_bytes);
        block.extend_from_slice(script);
        block.resize(size + pad, 0);

        trace!(
            "Script block: {} script bytes, {} header, {} padding",
            script.len(),
            HEADER_SIZE,
            pad
        );
        Ok(block)
    }

    /// Encode a script into the records that describe its padded block.
    ///
    /// Records hold 16 bytes each, except that a record never straddles a
    /// 64 KiB boundary: it is split there so the next segment starts fresh.
    pub fn records(&self, script: &[u8]) -> Result<Vec<HexRecord>> {
        let block = self.padded_block(script)?;
        let start = self.config.flash_start;
        let last_offset = u32::try_from(block.len() - 1).map_err(|_| self.overflow(block.len()))?;
        if start.checked_add(last_offset).is_none() {
            return Err(self.overflow(block.len()));
        }

        let mut records = Vec::with_capacity(block.len() / RECORD_DATA_SIZE + 2);
        let mut segment: Option<u16> = None;
        let mut offset = 0usize;

        while offset < block.len() {
            let address = start + u32::try_from(offset).map_err(|_| self.overflow(block.len()))?;
            let (upper, lower) = (upper_half(address), lower_half(address));

            if segment != Some(upper) {
                if self.config.segment_record {
                    records.push(HexRecord::extended_linear_address(upper));
                } else if segment.is_some() {
                    return Err(self.overflow(block.len()));
                }
                segment = Some(upper);
            }

            let to_boundary = 0x1_0000 - usize::from(lower);
            let len = RECORD_DATA_SIZE
                .min(block.len() - offset)
                .min(to_boundary);
            records.push(HexRecord::data(lower, &block[offset..offset + len])?);
            offset += len;
        }

        debug!(
            "Encoded {} byte script into {} records at {:#07x}",
            script.len(),
            records.len(),
            start
        );
        Ok(records)
    }

    /// Encode a script into newline-separated Intel HEX lines.
    ///
    /// There is no trailing newline after the last record.
    pub fn encode(&self, script: &[u8]) -> Result<String> {
        Ok(self
            .records(script)?
            .iter()
            .map(HexRecord::to_line)
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Recover the script embedded by this encoder's flash region.
    pub fn decode(&self, hex: &str) -> Result<Vec<u8>> {
        decode_script(hex, &self.config)
    }

    fn overflow(&self, len: usize) -> Error {
        let start = self.config.flash_start;
        Error::SegmentOverflow {
            start,
            end: start.saturating_add(u32::try_from(len).unwrap_or(u32::MAX)),
        }
    }
}

fn upper_half(address: u32) -> u16 {
    u16::try_from(address >> 16).unwrap_or(u16::MAX)
}

fn lower_half(address: u32) -> u16 {
    u16::try_from(address & 0xFFFF).unwrap_or_default()
}

/// Parse Intel HEX text into an absolute address → byte map.
///
/// Honours extended segment and extended linear address records and stops at
/// the first end-of-file record. Blank lines are skipped.
pub fn parse_memory(text: &str) -> Result<BTreeMap<u32, u8>> {
    let mut memory = BTreeMap::new();
    let mut linear_base: u32 = 0;
    let mut segment_base: u32 = 0;

    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record = HexRecord::parse(line, idx + 1)?;
        match record.record_type {
            RecordType::Data => {
                let base = linear_base
                    .wrapping_add(segment_base)
                    .wrapping_add(u32::from(record.address));
                for (i, byte) in record
                    .payload
                    .iter()
                    .enumerate()
                {
                    let offset = u32::try_from(i).unwrap_or_default();
                    memory.insert(base.wrapping_add(offset), *byte);
                }
            },
            RecordType::ExtendedLinearAddress | RecordType::ExtendedSegmentAddress => {
                let [hi, lo] = record.payload.as_slice() else {
                    return Err(Error::InvalidHex {
                        line: idx + 1,
                        reason: "address record must carry 2 bytes".to_string(),
                    });
                };
                let value = u32::from(u16::from_be_bytes([*hi, *lo]));
                if record.record_type == RecordType::ExtendedLinearAddress {
                    linear_base = value << 16;
                    segment_base = 0;
                } else {
                    segment_base = value << 4;
                    linear_base = 0;
                }
            },
            RecordType::EndOfFile => break,
            RecordType::StartSegmentAddress | RecordType::StartLinearAddress => {},
        }
    }

    Ok(memory)
}

/// Extract the script embedded at `config.flash_start` in a hex image.
///
/// Works on a bare encoded block as well as on a complete firmware image.
/// Bare blocks carry no extended address records, so the region is also
/// looked up by its low 16 bits.
pub fn decode_script(text: &str, config: &HexEncoderConfig) -> Result<Vec<u8>> {
    let memory = parse_memory(text)?;

    let read_at = |base: u32| -> Option<Vec<u8>> {
        let header: Vec<u8> = (0..HEADER_SIZE as u32)
            .map(|i| memory.get(&base.wrapping_add(i)).copied())
            .collect::<Option<_>>()?;
        if header[..2] != config.signature {
            return None;
        }
        let len = u32::from(LittleEndian::read_u16(&header[2..4]));
        (0..len)
            .map(|i| {
                memory
                    .get(&base.wrapping_add(HEADER_SIZE as u32 + i))
                    .copied()
            })
            .collect()
    };

    read_at(config.flash_start)
        .or_else(|| read_at(config.flash_start & 0xFFFF))
        .ok_or(Error::ScriptNotFound)
}
