// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! QCOW2 header parsing, validation, and rewriting.
//!
//! The header is the root of every on-disk structure: it names the cluster
//! geometry, the L1 table, the refcount table, and the snapshot directory,
//! and it carries the three feature bitmasks that gate whether an image can
//! be opened at all.

use std::sync::Arc;

use bitflags::bitflags;
use log::warn;

use super::bio::{BinaryIo, SequentialReader, SequentialWriter};
use super::{Error, Result};

// QCOW magic constant that starts the header.
pub(crate) const QCOW_MAGIC: u32 = 0x5146_49fb;
// Default to a cluster size of 2^DEFAULT_CLUSTER_BITS
pub(crate) const DEFAULT_CLUSTER_BITS: u32 = 16;
// Limit clusters to reasonable sizes. Choose the same limits as qemu.
pub(crate) const MIN_CLUSTER_BITS: u32 = 9;
pub(crate) const MAX_CLUSTER_BITS: u32 = 21;
// 16-bit refcounts.
pub(crate) const DEFAULT_REFCOUNT_ORDER: u32 = 4;
const MIN_REFCOUNT_ORDER: u32 = 1;
const MAX_REFCOUNT_ORDER: u32 = 6;

pub(crate) const V2_BARE_HEADER_SIZE: u32 = 72;
pub(crate) const V3_BARE_HEADER_SIZE: u32 = 104;

// Header extension types
const HEADER_EXT_END: u32 = 0x0000_0000;
// Feature name table
const HEADER_EXT_FEATURE_NAME_TABLE: u32 = 0x6803_f857;

// Feature name table entry: type + bit + zero-padded name
const FEATURE_NAME_ENTRY_SIZE: usize = 1 + 1 + 46;
// Feature name table entry type incompatible
const FEAT_TYPE_INCOMPATIBLE: u8 = 0;

bitflags! {
    /// Incompatible feature bits this implementation understands.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IncompatFeatures: u64 {
        const DIRTY = 1 << 0;
        const CORRUPT = 1 << 1;
    }
}

bitflags! {
    /// Autoclear feature bits that survive a rewrite; everything else is
    /// masked out before the header goes back to disk.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AutoclearFeatures: u64 {
        const BITMAPS = 1 << 0;
    }
}

/// A raw header extension, preserved verbatim across rewrites.
#[derive(Clone, Debug)]
pub(crate) struct HeaderExtension {
    pub id: u32,
    pub data: Vec<u8>,
}

/// One entry of the feature name table extension.
#[derive(Clone, Debug)]
pub(crate) struct FeatureName {
    pub ftype: u8,
    pub bit: u8,
    pub name: String,
}

/// Names every set bit in `bits`, preferring the image's feature name table
/// and falling back to the bit number.
fn incompatible_bit_names(bits: u64, names: &[FeatureName]) -> String {
    (0u8..64)
        .filter(|&bit| bits & (1u64 << bit) != 0)
        .map(|bit| {
            names
                .iter()
                .find(|n| n.ftype == FEAT_TYPE_INCOMPATIBLE && n.bit == bit)
                .map(|n| n.name.clone())
                .unwrap_or_else(|| format!("bit {bit}"))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// The in-memory image header.
///
/// Owns the container's binary I/O; every other subsystem reaches the
/// container through here.
#[derive(Debug)]
pub(crate) struct Header {
    pub io: Arc<BinaryIo>,

    pub version: u32,
    pub cluster_bits: u32,
    pub size: u64,
    pub l1_size: u32,
    pub l1_table_offset: u64,
    pub refcount_table_offset: u64,
    pub refcount_table_clusters: u32,
    pub nb_snapshots: u32,
    pub snapshots_offset: u64,

    // v3 entries, synthesized for v2 images
    pub incompatible_features: u64,
    pub compatible_features: u64,
    pub autoclear_features: u64,
    pub refcount_order: u32,
    pub header_size: u32,

    // Post-header entries
    pub extra_header: Vec<u8>,
    pub extensions: Vec<HeaderExtension>,
    pub feature_names: Vec<FeatureName>,
}

impl Header {
    /// Reads and validates the header from the start of the container.
    ///
    /// Images with unknown autoclear bits are rewritten with those bits
    /// cleared before this returns.
    pub fn open(io: Arc<BinaryIo>) -> Result<Header> {
        // Three probe reads establish the reader window before the full
        // header is decoded.
        let magic = io.read_u32(0)?;
        if magic != QCOW_MAGIC {
            return Err(Error::BadMagic);
        }
        let version = io.read_u32(4)?;
        if version != 2 && version != 3 {
            return Err(Error::UnsupportedVersion(version));
        }
        let cluster_bits = io.read_u32(20)?;
        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&cluster_bits) {
            return Err(Error::BadClusterBits(cluster_bits));
        }
        let cluster_size = 1u64 << cluster_bits;

        let mut r = SequentialReader::new(&io, 0, cluster_size);
        r.skip(8)?; // magic + version, validated above
        let backing_file_offset = r.read_u64()?;
        let backing_file_size = r.read_u32()?;
        r.skip(4)?; // cluster_bits, validated above
        let size = r.read_u64()?;
        let crypt_method = r.read_u32()?;
        let l1_size = r.read_u32()?;
        let l1_table_offset = r.read_u64()?;
        let refcount_table_offset = r.read_u64()?;
        let refcount_table_clusters = r.read_u32()?;
        let nb_snapshots = r.read_u32()?;
        let snapshots_offset = r.read_u64()?;

        let (incompatible_features, compatible_features, autoclear_features) = if version == 3 {
            (r.read_u64()?, r.read_u64()?, r.read_u64()?)
        } else {
            (0, 0, 0)
        };
        let refcount_order = if version == 3 {
            r.read_u32()?
        } else {
            DEFAULT_REFCOUNT_ORDER
        };
        let header_size = if version == 3 {
            r.read_u32()?
        } else {
            V2_BARE_HEADER_SIZE
        };

        if !(MIN_REFCOUNT_ORDER..=MAX_REFCOUNT_ORDER).contains(&refcount_order) {
            return Err(Error::BadRefcountOrder(refcount_order));
        }
        if (header_size as u64) < r.position() {
            return Err(Error::HeaderTooLong(header_size));
        }
        if header_size as u64 > cluster_size {
            return Err(Error::HeaderTooLarge);
        }
        let extra_header = r.read_vec((header_size as u64 - r.position()) as usize)?;

        let mut extensions = Vec::new();
        loop {
            let id = r.read_u32()?;
            if id == HEADER_EXT_END {
                break;
            }
            let len = r.read_u32()?;
            let data = r.read_vec(len as usize)?;
            r.align(8)?;
            extensions.push(HeaderExtension { id, data });
        }
        let feature_names = parse_feature_names(&extensions);

        if backing_file_offset != 0 || backing_file_size != 0 {
            return Err(Error::UnsupportedFeature("backing file".to_string()));
        }
        if crypt_method != 0 {
            return Err(Error::UnsupportedFeature("encryption".to_string()));
        }
        if l1_table_offset == 0 {
            return Err(Error::MissingTable);
        }
        if l1_table_offset % cluster_size != 0 {
            return Err(Error::MisalignedTable(l1_table_offset));
        }
        if refcount_table_offset == 0 || refcount_table_clusters == 0 {
            return Err(Error::MissingTable);
        }
        if refcount_table_offset % cluster_size != 0 {
            return Err(Error::MisalignedTable(refcount_table_offset));
        }
        if snapshots_offset % cluster_size != 0 {
            return Err(Error::MisalignedTable(snapshots_offset));
        }
        // The L1 table must be able to map the whole disk.
        let l2_entries = cluster_size / 8;
        if (l1_size as u64) < size.div_ceil(cluster_size * l2_entries) {
            return Err(Error::MissingTable);
        }

        let unknown = incompatible_features & !IncompatFeatures::all().bits();
        if unknown != 0 {
            return Err(Error::UnsupportedFeature(format!(
                "unknown incompatible features: {}",
                incompatible_bit_names(unknown, &feature_names)
            )));
        }
        let incompat = IncompatFeatures::from_bits_truncate(incompatible_features);
        if incompat.contains(IncompatFeatures::CORRUPT) {
            return Err(Error::UnsupportedFeature("corrupt bit is set".to_string()));
        }
        if incompat.contains(IncompatFeatures::DIRTY) {
            return Err(Error::UnsupportedFeature("dirty bit is set".to_string()));
        }

        let mut header = Header {
            io,
            version,
            cluster_bits,
            size,
            l1_size,
            l1_table_offset,
            refcount_table_offset,
            refcount_table_clusters,
            nb_snapshots,
            snapshots_offset,
            incompatible_features,
            compatible_features,
            autoclear_features,
            refcount_order,
            header_size,
            extra_header,
            extensions,
            feature_names,
        };
        // Unknown autoclear bits must not survive an open by software that
        // does not understand them.
        header.autoclear()?;
        Ok(header)
    }

    /// Serializes the in-memory header and writes it in a single call.
    ///
    /// Extensions are re-emitted verbatim; autoclear bits outside the known
    /// set are masked out first.
    pub fn write(&mut self) -> Result<()> {
        self.autoclear_features &= AutoclearFeatures::all().bits();

        let mut w = SequentialWriter::new(&self.io, 0);
        w.write_u32(QCOW_MAGIC);
        w.write_u32(self.version);
        w.write_u64(0); // backing file offset
        w.write_u32(0); // backing file size
        w.write_u32(self.cluster_bits);
        w.write_u64(self.size);
        w.write_u32(0); // crypt method
        w.write_u32(self.l1_size);
        w.write_u64(self.l1_table_offset);
        w.write_u64(self.refcount_table_offset);
        w.write_u32(self.refcount_table_clusters);
        w.write_u32(self.nb_snapshots);
        w.write_u64(self.snapshots_offset);
        if self.version == 3 {
            w.write_u64(self.incompatible_features);
            w.write_u64(self.compatible_features);
            w.write_u64(self.autoclear_features);
            w.write_u32(self.refcount_order);
            w.write_u32(self.header_size);
        }
        w.write_all(&self.extra_header);
        for ext in &self.extensions {
            w.write_u32(ext.id);
            w.write_u32(ext.data.len() as u32);
            w.write_all(&ext.data);
            w.align(8);
        }
        w.write_u32(HEADER_EXT_END);
        w.write_u32(0);

        if w.size() as u64 > self.cluster_size() {
            return Err(Error::HeaderTooLarge);
        }
        w.commit()
    }

    /// Rewrites the header iff the autoclear mask carries unknown bits.
    ///
    /// Called on open and again at the head of every guest write; after the
    /// first rewrite it is a no-op.
    pub fn autoclear(&mut self) -> Result<()> {
        let unknown = self.autoclear_features & !AutoclearFeatures::all().bits();
        if unknown != 0 {
            warn!("clearing unknown autoclear feature bits {unknown:#x}");
            self.write()?;
        }
        Ok(())
    }

    /// Repoints the refcount table and persists the header.
    pub fn set_refcount_table(&mut self, offset: u64, size_clusters: u32) -> Result<()> {
        self.refcount_table_offset = offset;
        self.refcount_table_clusters = size_clusters;
        self.write()
    }

    pub fn io(&self) -> &BinaryIo {
        &self.io
    }

    pub fn cluster_size(&self) -> u64 {
        1u64 << self.cluster_bits
    }

    /// Refcount width in bits.
    pub fn refcount_bits(&self) -> u32 {
        1u32 << self.refcount_order
    }

    /// Number of mapping entries per L2 table.
    pub fn l2_entries(&self) -> u64 {
        self.cluster_size() / 8
    }
}

fn parse_feature_names(extensions: &[HeaderExtension]) -> Vec<FeatureName> {
    let mut names = Vec::new();
    for ext in extensions {
        if ext.id != HEADER_EXT_FEATURE_NAME_TABLE {
            continue;
        }
        for entry in ext.data.chunks_exact(FEATURE_NAME_ENTRY_SIZE) {
            let name_bytes = &entry[2..];
            let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(46);
            names.push(FeatureName {
                ftype: entry[0],
                bit: entry[1],
                name: String::from_utf8_lossy(&name_bytes[..name_len]).to_string(),
            });
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    fn valid_header_v3() -> Vec<u8> {
        vec![
            0x51u8, 0x46, 0x49, 0xfb, // magic
            0x00, 0x00, 0x00, 0x03, // version
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // backing file offset
            0x00, 0x00, 0x00, 0x00, // backing file size
            0x00, 0x00, 0x00, 0x10, // cluster_bits
            0x00, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, // size
            0x00, 0x00, 0x00, 0x00, // crypt method
            0x00, 0x00, 0x01, 0x00, // L1 size
            0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, // L1 table offset
            0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, // refcount table offset
            0x00, 0x00, 0x00, 0x03, // refcount table clusters
            0x00, 0x00, 0x00, 0x00, // nb snapshots
            0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, // snapshots offset
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // incompatible_features
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // compatible_features
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // autoclear_features
            0x00, 0x00, 0x00, 0x04, // refcount_order
            0x00, 0x00, 0x00, 0x68, // header_length
        ]
    }

    fn valid_header_v2() -> Vec<u8> {
        vec![
            0x51u8, 0x46, 0x49, 0xfb, // magic
            0x00, 0x00, 0x00, 0x02, // version
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // backing file offset
            0x00, 0x00, 0x00, 0x00, // backing file size
            0x00, 0x00, 0x00, 0x10, // cluster_bits
            0x00, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, // size
            0x00, 0x00, 0x00, 0x00, // crypt method
            0x00, 0x00, 0x01, 0x00, // L1 size
            0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, // L1 table offset
            0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, // refcount table offset
            0x00, 0x00, 0x00, 0x03, // refcount table clusters
            0x00, 0x00, 0x00, 0x00, // nb snapshots
            0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, // snapshots offset
        ]
    }

    fn io_with_bytes(bytes: &[u8]) -> Arc<BinaryIo> {
        let io = BinaryIo::new(TempFile::new().unwrap().into_file());
        io.write_at(0, bytes).unwrap();
        // Pad past the extension stream so header reads stay in bounds.
        io.zero(bytes.len() as u64, 512).unwrap();
        Arc::new(io)
    }

    fn open_bytes(bytes: &[u8]) -> Result<Header> {
        Header::open(io_with_bytes(bytes))
    }

    #[test]
    fn open_v3() {
        let header = open_bytes(&valid_header_v3()).unwrap();
        assert_eq!(header.version, 3);
        assert_eq!(header.cluster_size(), 0x1_0000);
        assert_eq!(header.size, 0x20_0000_0000);
        assert_eq!(header.refcount_bits(), 16);
        assert_eq!(header.header_size, V3_BARE_HEADER_SIZE);
        assert_eq!(header.l2_entries(), 8192);
    }

    #[test]
    fn open_v2_synthesizes_v3_fields() {
        let header = open_bytes(&valid_header_v2()).unwrap();
        assert_eq!(header.version, 2);
        assert_eq!(header.refcount_order, DEFAULT_REFCOUNT_ORDER);
        assert_eq!(header.header_size, V2_BARE_HEADER_SIZE);
        assert_eq!(header.incompatible_features, 0);
        assert_eq!(header.autoclear_features, 0);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = valid_header_v3();
        bytes[0] = 0x52;
        assert!(matches!(open_bytes(&bytes).unwrap_err(), Error::BadMagic));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut bytes = valid_header_v3();
        bytes[7] = 4;
        assert!(matches!(
            open_bytes(&bytes).unwrap_err(),
            Error::UnsupportedVersion(4)
        ));
    }

    #[test]
    fn rejects_bad_cluster_bits() {
        let mut bytes = valid_header_v3();
        bytes[23] = 22;
        assert!(matches!(
            open_bytes(&bytes).unwrap_err(),
            Error::BadClusterBits(22)
        ));
        bytes[23] = 8;
        assert!(matches!(
            open_bytes(&bytes).unwrap_err(),
            Error::BadClusterBits(8)
        ));
    }

    #[test]
    fn rejects_bad_refcount_order() {
        let mut bytes = valid_header_v3();
        bytes[99] = 7;
        assert!(matches!(
            open_bytes(&bytes).unwrap_err(),
            Error::BadRefcountOrder(7)
        ));
        bytes[99] = 0;
        assert!(matches!(
            open_bytes(&bytes).unwrap_err(),
            Error::BadRefcountOrder(0)
        ));
    }

    #[test]
    fn rejects_backing_file() {
        let mut bytes = valid_header_v3();
        bytes[15] = 0x68; // backing file offset
        match open_bytes(&bytes).unwrap_err() {
            Error::UnsupportedFeature(msg) => assert!(msg.contains("backing file")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rejects_encryption() {
        let mut bytes = valid_header_v3();
        bytes[35] = 1; // crypt method
        match open_bytes(&bytes).unwrap_err() {
            Error::UnsupportedFeature(msg) => assert!(msg.contains("encryption")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rejects_dirty_and_corrupt() {
        let mut bytes = valid_header_v3();
        bytes[79] = 0x01; // incompatible: dirty
        match open_bytes(&bytes).unwrap_err() {
            Error::UnsupportedFeature(msg) => assert!(msg.contains("dirty")),
            other => panic!("unexpected error {other:?}"),
        }
        bytes[79] = 0x02; // incompatible: corrupt
        match open_bytes(&bytes).unwrap_err() {
            Error::UnsupportedFeature(msg) => assert!(msg.contains("corrupt")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unknown_incompatible_bit_named_by_number() {
        let mut bytes = valid_header_v3();
        bytes[79] = 0x10; // incompatible bit 4, no feature name table
        match open_bytes(&bytes).unwrap_err() {
            Error::UnsupportedFeature(msg) => assert!(msg.contains("bit 4"), "message: {msg}"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unknown_incompatible_bit_named_from_table() {
        let mut bytes = valid_header_v3();
        bytes[79] = 0x10;
        // Feature name table with one incompatible entry for bit 4.
        bytes.extend_from_slice(&[0x68, 0x03, 0xf8, 0x57, 0x00, 0x00, 0x00, 0x30]);
        let mut entry = [0u8; FEATURE_NAME_ENTRY_SIZE];
        entry[0] = FEAT_TYPE_INCOMPATIBLE;
        entry[1] = 4;
        entry[2..15].copy_from_slice(b"external data");
        bytes.extend_from_slice(&entry);
        match open_bytes(&bytes).unwrap_err() {
            Error::UnsupportedFeature(msg) => {
                assert!(msg.contains("external data"), "message: {msg}")
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rejects_misaligned_tables() {
        let mut bytes = valid_header_v3();
        bytes[46] = 0x02; // L1 offset no longer cluster aligned
        assert!(matches!(
            open_bytes(&bytes).unwrap_err(),
            Error::MisalignedTable(_)
        ));

        let mut bytes = valid_header_v3();
        bytes[48..56].copy_from_slice(&[0; 8]); // refcount table offset zero
        assert!(matches!(
            open_bytes(&bytes).unwrap_err(),
            Error::MissingTable
        ));
    }

    #[test]
    fn rejects_undersized_l1() {
        let mut bytes = valid_header_v3();
        bytes[38] = 0x00; // L1 size drops below what 128 GiB needs
        bytes[39] = 0xff;
        assert!(matches!(
            open_bytes(&bytes).unwrap_err(),
            Error::MissingTable
        ));
    }

    #[test]
    fn rejects_header_length_inside_v3_block() {
        let mut bytes = valid_header_v3();
        bytes[103] = 0x60; // header_length 0x60 < 104
        assert!(matches!(
            open_bytes(&bytes).unwrap_err(),
            Error::HeaderTooLong(0x60)
        ));
    }

    #[test]
    fn autoclear_cleared_on_open() {
        let mut bytes = valid_header_v3();
        bytes[95] = 0x09; // autoclear: bitmaps (known) + bit 3 (unknown)
        let io = io_with_bytes(&bytes);
        let header = Header::open(Arc::clone(&io)).unwrap();
        assert_eq!(
            header.autoclear_features,
            AutoclearFeatures::BITMAPS.bits()
        );
        // The on-disk mask kept the known bit and dropped the unknown one.
        assert_eq!(io.read_u64(88).unwrap(), 0x01);
    }

    #[test]
    fn write_preserves_unknown_extensions() {
        let mut bytes = valid_header_v3();
        // Unknown extension: id 0x12345678, 5 data bytes, padded to 8.
        bytes.extend_from_slice(&[0x12, 0x34, 0x56, 0x78, 0x00, 0x00, 0x00, 0x05]);
        bytes.extend_from_slice(b"hello");
        bytes.extend_from_slice(&[0, 0, 0]);
        let io = io_with_bytes(&bytes);

        let mut header = Header::open(Arc::clone(&io)).unwrap();
        assert_eq!(header.extensions.len(), 1);
        header.write().unwrap();

        let reread = Header::open(io).unwrap();
        assert_eq!(reread.extensions.len(), 1);
        assert_eq!(reread.extensions[0].id, 0x1234_5678);
        assert_eq!(reread.extensions[0].data, b"hello");
    }

    #[test]
    fn set_refcount_table_rewrites_header() {
        let io = io_with_bytes(&valid_header_v3());
        let mut header = Header::open(Arc::clone(&io)).unwrap();
        header.set_refcount_table(0x20_0000, 4).unwrap();
        let reread = Header::open(io).unwrap();
        assert_eq!(reread.refcount_table_offset, 0x20_0000);
        assert_eq!(reread.refcount_table_clusters, 4);
    }
}
