//! Device metadata as reported in response to the METADATA command.
//!
//! Each record is keyed by its full tag byte: bits 7-5 carry the value type and
//! bits 4-0 the key id, so the 32-bit and 8-bit variants of the same property
//! (e.g. probe count `0x20` and `0x40`) are separate keys.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetadataKey(pub u8);

impl MetadataKey {
    pub const DEVICE_NAME: Self = Self(0x01);
    pub const FPGA_VERSION: Self = Self(0x02);
    pub const ANCILLARY_VERSION: Self = Self(0x03);
    pub const PROBE_COUNT: Self = Self(0x20);
    pub const SAMPLE_MEMORY: Self = Self(0x21);
    pub const DYNAMIC_MEMORY: Self = Self(0x22);
    pub const MAX_SAMPLE_RATE: Self = Self(0x23);
    pub const PROTOCOL_VERSION: Self = Self(0x24);
    pub const PROBE_COUNT_SHORT: Self = Self(0x40);
    pub const PROTOCOL_VERSION_SHORT: Self = Self(0x41);

    /// Bits 4-0 of the tag.
    pub fn id(self) -> u8 {
        self.0 & 0x1f
    }

    /// Bits 7-5 of the tag.
    pub fn value_type(self) -> u8 {
        (self.0 & 0xe0) >> 5
    }

    pub fn name(self) -> Option<&'static str> {
        match self {
            Self::DEVICE_NAME => Some("device name"),
            Self::FPGA_VERSION => Some("FPGA firmware version"),
            Self::ANCILLARY_VERSION => Some("ancillary version"),
            Self::PROBE_COUNT | Self::PROBE_COUNT_SHORT => Some("probe count"),
            Self::SAMPLE_MEMORY => Some("sample memory"),
            Self::DYNAMIC_MEMORY => Some("dynamic memory"),
            Self::MAX_SAMPLE_RATE => Some("max sample rate"),
            Self::PROTOCOL_VERSION | Self::PROTOCOL_VERSION_SHORT => Some("protocol version"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Text(String),
    U32(u32),
    U8(u8),
}

impl MetadataValue {
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(v) => Some(*v),
            Self::U8(v) => Some(u32::from(*v)),
            Self::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "\"{}\"", s),
            Self::U32(v) => write!(f, "{} (32-bit)", v),
            Self::U8(v) => write!(f, "{} (8-bit)", v),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceMetadata {
    records: BTreeMap<MetadataKey, MetadataValue>,
}

impl DeviceMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: MetadataKey, value: MetadataValue) {
        self.records.insert(key, value);
    }

    pub fn get(&self, key: MetadataKey) -> Option<&MetadataValue> {
        self.records.get(&key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetadataKey, &MetadataValue)> {
        self.records.iter()
    }

    fn number(&self, keys: &[MetadataKey]) -> Option<u32> {
        keys.iter()
            .find_map(|key| self.get(*key).and_then(MetadataValue::as_u32))
    }

    pub fn device_name(&self) -> Option<&str> {
        self.get(MetadataKey::DEVICE_NAME)
            .and_then(MetadataValue::as_str)
    }

    pub fn fpga_version(&self) -> Option<&str> {
        self.get(MetadataKey::FPGA_VERSION)
            .and_then(MetadataValue::as_str)
    }

    pub fn ancillary_version(&self) -> Option<&str> {
        self.get(MetadataKey::ANCILLARY_VERSION)
            .and_then(MetadataValue::as_str)
    }

    pub fn probe_count(&self) -> Option<u32> {
        self.number(&[MetadataKey::PROBE_COUNT, MetadataKey::PROBE_COUNT_SHORT])
    }

    pub fn sample_memory(&self) -> Option<u32> {
        self.number(&[MetadataKey::SAMPLE_MEMORY])
    }

    pub fn dynamic_memory(&self) -> Option<u32> {
        self.number(&[MetadataKey::DYNAMIC_MEMORY])
    }

    pub fn max_sample_rate(&self) -> Option<u32> {
        self.number(&[MetadataKey::MAX_SAMPLE_RATE])
    }

    pub fn protocol_version(&self) -> Option<u32> {
        self.number(&[
            MetadataKey::PROTOCOL_VERSION,
            MetadataKey::PROTOCOL_VERSION_SHORT,
        ])
    }

    /// Probe count reported by the device, capped at `requested`.
    pub fn probe_count_or(&self, requested: u32) -> u32 {
        self.probe_count()
            .filter(|&n| n > 0)
            .map_or(requested, |n| n.min(requested))
    }

    /// Sample memory depth reported by the device, capped at `requested`.
    pub fn sample_memory_depth_or(&self, requested: u32) -> u32 {
        self.sample_memory()
            .filter(|&n| n > 0)
            .map_or(requested, |n| n.min(requested))
    }
}

impl fmt::Display for DeviceMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.records {
            match key.name() {
                Some(name) => writeln!(f, "{} (0x{:02x}) = {}", name, key.0, value)?,
                None => writeln!(f, "0x{:02x} = {}", key.0, value)?,
            }
        }
        Ok(())
    }
}
