//! Cache Records
//!
//! A cache entry is a set of named values. Value names are well-known
//! identifiers shared between the builders and consumers: the texture
//! description, platform-tiling extended data, the packed mip tail, one
//! value per streaming mip, virtual-texture chunks, and the optional
//! CPU-copy passthrough pair.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::key::ContentHash;

/// Well-known output value identifiers of a texture build
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ValueId {
    /// Canonical post-build texture shape
    Description,
    /// Platform-tiling metadata; all-zero for linear layouts
    ExtendedData,
    /// Packed non-streaming mips
    MipTail,
    /// One streaming mip
    Mip(u8),
    /// One packed virtual-texture chunk
    Chunk(u16),
    /// Virtual-texture tile layout: offset tables and fallback colors
    VirtualTextureLayout,
    /// Unencoded preview copy: shape
    CpuCopyImageInfo,
    /// Unencoded preview copy: pixels
    CpuCopyRawData,
}

impl ValueId {
    /// Stable wire name of this value
    pub fn name(&self) -> String {
        match self {
            Self::Description => "EncodedTextureDescription".to_string(),
            Self::ExtendedData => "EncodedTextureExtendedData".to_string(),
            Self::MipTail => "MipTail".to_string(),
            Self::Mip(index) => format!("Mip{index}"),
            Self::Chunk(index) => format!("Chunk{index}"),
            Self::VirtualTextureLayout => "VirtualTextureLayout".to_string(),
            Self::CpuCopyImageInfo => "CPUCopyImageInfo".to_string(),
            Self::CpuCopyRawData => "CPUCopyRawData".to_string(),
        }
    }

    /// Streaming mips may be fetched existence-only; everything else is
    /// always wanted resident.
    pub fn is_streaming_mip(&self) -> bool {
        matches!(self, Self::Mip(_))
    }
}

/// One named value of a cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheValue {
    /// Hash of the full payload, kept even for skip-data fetches
    pub raw_hash: ContentHash,
    /// Size of the full payload in bytes
    pub raw_size: u64,
    /// Payload bytes; `None` for an existence-only fetch result
    pub data: Option<Vec<u8>>,
}

impl CacheValue {
    /// Wrap payload bytes, recording their hash and size
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            raw_hash: ContentHash::of(&data),
            raw_size: data.len() as u64,
            data: Some(data),
        }
    }

    /// The same value with its payload stripped (existence-only)
    pub fn without_data(&self) -> Self {
        Self {
            raw_hash: self.raw_hash,
            raw_size: self.raw_size,
            data: None,
        }
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Check resident payload bytes against the recorded hash
    pub fn validate(&self) -> bool {
        match &self.data {
            Some(data) => {
                data.len() as u64 == self.raw_size && ContentHash::of(data) == self.raw_hash
            }
            None => true,
        }
    }
}

/// A complete cache entry: named values in a fixed order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    values: BTreeMap<ValueId, CacheValue>,
}

impl CacheRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert payload bytes under a value id
    pub fn insert_data(&mut self, id: ValueId, data: Vec<u8>) {
        self.values.insert(id, CacheValue::new(data));
    }

    pub fn insert(&mut self, id: ValueId, value: CacheValue) {
        self.values.insert(id, value);
    }

    pub fn get(&self, id: &ValueId) -> Option<&CacheValue> {
        self.values.get(id)
    }

    /// Resident payload bytes of a value, if any
    pub fn data(&self, id: &ValueId) -> Option<&[u8]> {
        self.values.get(id).and_then(|v| v.data.as_deref())
    }

    pub fn contains(&self, id: &ValueId) -> bool {
        self.values.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ValueId, &CacheValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Total resident payload bytes
    pub fn resident_size(&self) -> u64 {
        self.values
            .values()
            .filter_map(|v| v.data.as_ref())
            .map(|d| d.len() as u64)
            .sum()
    }

    /// Validate every resident value against its recorded hash
    pub fn validate(&self) -> bool {
        self.values.values().all(CacheValue::validate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_names() {
        assert_eq!(ValueId::Description.name(), "EncodedTextureDescription");
        assert_eq!(ValueId::Mip(7).name(), "Mip7");
        assert_eq!(ValueId::Chunk(3).name(), "Chunk3");
        assert_eq!(ValueId::CpuCopyRawData.name(), "CPUCopyRawData");
    }

    #[test]
    fn test_value_validation() {
        let value = CacheValue::new(vec![1, 2, 3, 4]);
        assert!(value.validate());

        let mut tampered = value.clone();
        tampered.data = Some(vec![9, 9, 9, 9]);
        assert!(!tampered.validate());

        // Existence-only values always validate
        assert!(value.without_data().validate());
    }

    #[test]
    fn test_record_round_trip_through_bincode() {
        let mut record = CacheRecord::new();
        record.insert_data(ValueId::Description, vec![1, 2, 3]);
        record.insert_data(ValueId::Mip(0), vec![4; 128]);
        record.insert(ValueId::Mip(1), CacheValue::new(vec![5; 64]).without_data());

        let bytes = bincode::serialize(&record).unwrap();
        let loaded: CacheRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(loaded, record);
        assert!(loaded.validate());
        assert_eq!(loaded.data(&ValueId::Mip(0)).unwrap().len(), 128);
        assert!(loaded.data(&ValueId::Mip(1)).is_none());
        assert!(loaded.contains(&ValueId::Mip(1)));
    }

    #[test]
    fn test_resident_size_ignores_stripped_values() {
        let mut record = CacheRecord::new();
        record.insert_data(ValueId::MipTail, vec![0; 100]);
        record.insert(ValueId::Mip(0), CacheValue::new(vec![0; 50]).without_data());
        assert_eq!(record.resident_size(), 100);
    }
}
