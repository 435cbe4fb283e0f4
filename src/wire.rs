//! Fixed-width descriptor records as the factorization unit reads them.
//!
//! Each record is 80 bytes with no padding:
//!
//! | offset | size | field              |
//! |--------|------|--------------------|
//! | 0      | 4    | `node_id`          |
//! | 4      | 4    | `parent_id`        |
//! | 8      | 4    | `children_count`   |
//! | 12     | 2    | `total_dim`        |
//! | 14     | 2    | `pivot_dim`        |
//! | 16     | 8    | `data_addr`        |
//! | 24     | 8    | `parent_address`   |
//! | 32     | 8    | `l_factor_addr`    |
//! | 40     | 8    | `u_factor_addr`    |
//! | 48     | 8    | `map_table_addr`   |
//! | 56     | 8    | `contribution_addr`|
//! | 64     | 8    | `piv_vector_addr`  |
//! | 72     | 4    | control bits       |
//! | 76     | 4    | `config_flags`     |
//!
//! A table is a sequence of records followed by the BLAKE3 digest of those
//! records, so host and unit can tell they agree on the same tree.

use serde::{Deserialize, Serialize};

use crate::descriptor::{
    ConfigFlags, ControlFlag, ControlFlags, DensityMode, Geometry, NodeId, RegionHandles,
    RegionId, TaskDescriptor,
};
use crate::error::DescriptorError;

pub const RECORD_LEN: usize = 80;
pub const DIGEST_LEN: usize = 32;

/// `parent_id` of the root on the wire.
pub const ROOT_SENTINEL: u32 = u32::MAX;

const BIT_LEAF: u32 = 1 << 0;
const BIT_ROOT: u32 = 1 << 1;
const BIT_FINISH_INTERRUPT: u32 = 1 << 2;
const BIT_DENSE: u32 = 1 << 3;
const KNOWN_BITS: u32 = BIT_LEAF | BIT_ROOT | BIT_FINISH_INTERRUPT | BIT_DENSE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    #[default]
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WireConfig {
    pub endian: Endian,
}

struct Writer<'a> {
    buf: &'a mut Vec<u8>,
    endian: Endian,
}

impl Writer<'_> {
    fn u16(&mut self, v: u16) {
        match self.endian {
            Endian::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
            Endian::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
        }
    }

    fn u32(&mut self, v: u32) {
        match self.endian {
            Endian::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
            Endian::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
        }
    }

    fn u64(&mut self, v: u64) {
        match self.endian {
            Endian::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
            Endian::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
        }
    }

    fn region(&mut self, region: Option<RegionId>) {
        self.u64(region.map_or(0, RegionId::get));
    }
}

struct Reader<'a> {
    bytes: &'a [u8; RECORD_LEN],
    pos: usize,
    endian: Endian,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u16(&mut self) -> u16 {
        let raw = self.take::<2>();
        match self.endian {
            Endian::Little => u16::from_le_bytes(raw),
            Endian::Big => u16::from_be_bytes(raw),
        }
    }

    fn u32(&mut self) -> u32 {
        let raw = self.take::<4>();
        match self.endian {
            Endian::Little => u32::from_le_bytes(raw),
            Endian::Big => u32::from_be_bytes(raw),
        }
    }

    fn u64(&mut self) -> u64 {
        let raw = self.take::<8>();
        match self.endian {
            Endian::Little => u64::from_le_bytes(raw),
            Endian::Big => u64::from_be_bytes(raw),
        }
    }

    fn region(&mut self) -> Option<RegionId> {
        RegionId::new(self.u64())
    }
}

fn control_bits(descriptor: &TaskDescriptor) -> u32 {
    let flags = &descriptor.flags;
    let mut bits = 0;

    if flags.is_leaf() {
        bits |= BIT_LEAF;
    }
    if flags.is_root() {
        bits |= BIT_ROOT;
    }
    if flags.raises_interrupt() {
        bits |= BIT_FINISH_INTERRUPT;
    }
    if descriptor.density.is_dense() {
        bits |= BIT_DENSE;
    }

    bits
}

/// Appends the record for `descriptor` to `buf`.
pub fn encode_descriptor(descriptor: &TaskDescriptor, wire: WireConfig, buf: &mut Vec<u8>) {
    let mut w = Writer {
        buf,
        endian: wire.endian,
    };
    let regions = &descriptor.regions;

    w.u32(descriptor.node_id.0);
    w.u32(descriptor.parent_id.map_or(ROOT_SENTINEL, |p| p.0));
    w.u32(descriptor.children_count);
    w.u16(descriptor.geometry.total_dim);
    w.u16(descriptor.geometry.pivot_dim);
    w.region(regions.data);
    w.region(regions.parent);
    w.region(regions.l_factor);
    w.region(regions.u_factor);
    w.region(regions.map_table);
    w.region(regions.contribution);
    w.region(regions.piv_vector);
    w.u32(control_bits(descriptor));
    w.u32(descriptor.config.0);
}

/// Decodes one record. `record` is only used to attribute errors.
pub fn decode_descriptor(
    bytes: &[u8; RECORD_LEN],
    wire: WireConfig,
    record: usize,
) -> Result<TaskDescriptor, DescriptorError> {
    let mut r = Reader {
        bytes,
        pos: 0,
        endian: wire.endian,
    };

    let node_id = NodeId(r.u32());
    let parent_id = match r.u32() {
        ROOT_SENTINEL => None,
        id => Some(NodeId(id)),
    };
    let children_count = r.u32();
    let geometry = Geometry::new(r.u16(), r.u16());
    let regions = RegionHandles {
        data: r.region(),
        parent: r.region(),
        l_factor: r.region(),
        u_factor: r.region(),
        map_table: r.region(),
        contribution: r.region(),
        piv_vector: r.region(),
    };

    let bits = r.u32();
    if bits & !KNOWN_BITS != 0 {
        return Err(DescriptorError::UnknownControlBits { record, bits });
    }

    let mut flags = ControlFlags::empty();
    flags.set(ControlFlag::Leaf, bits & BIT_LEAF != 0);
    flags.set(ControlFlag::Root, bits & BIT_ROOT != 0);
    flags.set(ControlFlag::FinishInterrupt, bits & BIT_FINISH_INTERRUPT != 0);

    let density = if bits & BIT_DENSE != 0 {
        DensityMode::Dense
    } else {
        DensityMode::SparseBlock
    };

    let config = ConfigFlags(r.u32());

    Ok(TaskDescriptor {
        node_id,
        parent_id,
        children_count,
        geometry,
        regions,
        flags,
        density,
        config,
    })
}

/// Encodes a whole descriptor table followed by its digest.
pub fn encode_table(descriptors: &[TaskDescriptor], wire: WireConfig) -> Vec<u8> {
    let mut buf = Vec::with_capacity(descriptors.len() * RECORD_LEN + DIGEST_LEN);

    for descriptor in descriptors {
        encode_descriptor(descriptor, wire, &mut buf);
    }

    let digest = blake3::hash(&buf);
    buf.extend_from_slice(digest.as_bytes());
    buf
}

/// Decodes a table produced by [`encode_table`], checking its digest first.
pub fn decode_table(bytes: &[u8], wire: WireConfig) -> Result<Vec<TaskDescriptor>, DescriptorError> {
    if bytes.len() < DIGEST_LEN || (bytes.len() - DIGEST_LEN) % RECORD_LEN != 0 {
        return Err(DescriptorError::Length(bytes.len()));
    }

    let (records, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);
    if blake3::hash(records).as_bytes() != digest {
        return Err(DescriptorError::Checksum);
    }

    records
        .chunks_exact(RECORD_LEN)
        .enumerate()
        .map(|(record, chunk)| {
            let chunk: &[u8; RECORD_LEN] = chunk
                .try_into()
                .map_err(|_| DescriptorError::Length(bytes.len()))?;
            decode_descriptor(chunk, wire, record)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TaskDescriptor {
        let mut descriptor = TaskDescriptor::new(NodeId(3), Some(NodeId(1)), Geometry::new(12, 4));
        descriptor.children_count = 2;
        descriptor.regions.data = RegionId::new(0x10);
        descriptor.regions.parent = RegionId::new(0x01);
        descriptor.regions.map_table = RegionId::new(0x11);
        descriptor.regions.contribution = RegionId::new(0x12);
        descriptor.flags = ControlFlags::empty().with(ControlFlag::FinishInterrupt);
        descriptor.density = DensityMode::SparseBlock;
        descriptor.config = ConfigFlags(0xDEAD_BEEF);
        descriptor
    }

    #[test]
    fn test_record_layout_little_endian() {
        let mut buf = vec![];
        encode_descriptor(&sample(), WireConfig::default(), &mut buf);

        assert_eq!(buf.len(), RECORD_LEN);
        assert_eq!(&buf[0..4], &[3, 0, 0, 0]);
        assert_eq!(&buf[4..8], &[1, 0, 0, 0]);
        assert_eq!(&buf[8..12], &[2, 0, 0, 0]);
        assert_eq!(&buf[12..14], &[12, 0]);
        assert_eq!(&buf[14..16], &[4, 0]);
        assert_eq!(buf[16], 0x10);
        assert_eq!(&buf[32..48], &[0; 16]);
        assert_eq!(&buf[72..76], &[BIT_FINISH_INTERRUPT as u8, 0, 0, 0]);
        assert_eq!(&buf[76..80], &[0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_record_layout_big_endian() {
        let mut buf = vec![];
        let wire = WireConfig { endian: Endian::Big };
        encode_descriptor(&sample(), wire, &mut buf);

        assert_eq!(&buf[0..4], &[0, 0, 0, 3]);
        assert_eq!(&buf[12..14], &[0, 12]);
        assert_eq!(buf[23], 0x10);
        assert_eq!(&buf[76..80], &[0xDE, 0xAD, 0xBE, 0xEF]);

        let bytes: &[u8; RECORD_LEN] = buf.as_slice().try_into().unwrap();
        assert_eq!(decode_descriptor(bytes, wire, 0).unwrap(), sample());
    }

    #[test]
    fn test_root_sentinel() {
        let mut root = TaskDescriptor::new(NodeId(0), None, Geometry::new(4, 4));
        root.flags = ControlFlags::empty().with(ControlFlag::Root);

        let mut buf = vec![];
        encode_descriptor(&root, WireConfig::default(), &mut buf);
        assert_eq!(&buf[4..8], &[0xFF; 4]);
        assert_eq!(buf[72] as u32, BIT_ROOT | BIT_DENSE);

        let bytes: &[u8; RECORD_LEN] = buf.as_slice().try_into().unwrap();
        let decoded = decode_descriptor(bytes, WireConfig::default(), 0).unwrap();
        assert!(decoded.is_root());
        assert!(decoded.flags.is_root());
    }

    #[test]
    fn test_table_digest() {
        let wire = WireConfig::default();
        let table = encode_table(&[sample(), sample()], wire);
        assert_eq!(table.len(), 2 * RECORD_LEN + DIGEST_LEN);
        assert_eq!(decode_table(&table, wire).unwrap().len(), 2);

        let mut corrupted = table.clone();
        corrupted[13] ^= 0xFF;
        assert_eq!(decode_table(&corrupted, wire), Err(DescriptorError::Checksum));
    }

    #[test]
    fn test_table_length() {
        assert_eq!(
            decode_table(&[0; 40], WireConfig::default()),
            Err(DescriptorError::Length(40))
        );
    }

    #[test]
    fn test_unknown_control_bits() {
        let mut buf = vec![];
        encode_descriptor(&sample(), WireConfig::default(), &mut buf);
        buf[75] = 0x80;

        let bytes: &[u8; RECORD_LEN] = buf.as_slice().try_into().unwrap();
        let err = decode_descriptor(bytes, WireConfig::default(), 4).unwrap_err();
        assert!(matches!(err, DescriptorError::UnknownControlBits { record: 4, .. }));
    }
}
