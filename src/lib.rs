// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Sparse, copy-on-write QCOW2 (v2/v3) virtual disk images over any byte
//! store with positioned reads and writes.
//!
//! [`Qcow2::open`] validates the header and hands out [`Guest`] handles that
//! translate guest byte offsets through the L1/L2 tables, allocating
//! clusters lazily and honoring per-cluster copy-on-write. Reference counts
//! and the refcount table live on disk and are maintained on every
//! allocation; the table grows itself when it runs out of address space.
//!
//! Backing files, encryption, compressed clusters, and snapshot data access
//! are rejected or out of scope; snapshots are parsed for inventory only.

mod bio;
mod guest;
mod header;
mod refcount;
mod snapshot;

use std::io;
use std::sync::{Arc, RwLock};

use remain::sorted;
use thiserror::Error as ThisError;

pub use crate::bio::DiskIo;
use crate::bio::BinaryIo;
pub use crate::guest::Guest;
use crate::guest::Metadata;
use crate::header::Header;
use crate::refcount::Refcounts;
pub use crate::snapshot::Snapshot;

#[sorted]
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Invalid cluster bits: {0}")]
    BadClusterBits(u32),
    #[error("Invalid magic")]
    BadMagic,
    #[error("Invalid mapping entry: {0:#x}")]
    BadMappingEntry(u64),
    #[error("Invalid refcount table entry: {0:#x}")]
    BadRefcountEntry(u64),
    #[error("Invalid refcount order: {0}")]
    BadRefcountOrder(u32),
    #[error("Header does not fit in a cluster")]
    HeaderTooLarge,
    #[error("Declared header length {0} stops inside the header")]
    HeaderTooLong(u32),
    #[error("Container I/O failure")]
    Io(#[source] io::Error),
    #[error("Misaligned table offset: {0:#x}")]
    MisalignedTable(u64),
    #[error("Mapping or refcount table missing or undersized")]
    MissingTable,
    #[error("Guest range {offset}+{length} is out of bounds")]
    OutOfBounds { offset: u64, length: u64 },
    #[error("Refcount for cluster {0} is already at its maximum")]
    RefcountAtMax(u64),
    #[error("Read past the end of the window")]
    ShortRead,
    #[error("Could not reserve a contiguous run for the refcount table")]
    TableGrowthFailed,
    #[error("Refcount for cluster {0} is zero or unallocated")]
    UnderflowOrUnallocated(u64),
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u32),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Geometry for a new image.
#[derive(Clone, Debug)]
pub struct CreateParams {
    /// Format version, 2 or 3.
    pub version: u32,
    /// Guest disk size in bytes.
    pub size: u64,
    /// Cluster size is `1 << cluster_bits`, 9..=21.
    pub cluster_bits: u32,
    /// Refcount width is `1 << refcount_order` bits, 1..=6. Version 2
    /// images are fixed at 16-bit refcounts.
    pub refcount_order: u32,
}

impl Default for CreateParams {
    fn default() -> CreateParams {
        CreateParams {
            version: 3,
            size: 0,
            cluster_bits: header::DEFAULT_CLUSTER_BITS,
            refcount_order: header::DEFAULT_REFCOUNT_ORDER,
        }
    }
}

/// An open QCOW2 image.
///
/// Owns the header (and through it the container); clones of the metadata
/// state are shared with every [`Guest`] handed out.
#[derive(Debug)]
pub struct Qcow2 {
    io: Arc<BinaryIo>,
    pub(crate) meta: Arc<RwLock<Metadata>>,
}

impl Qcow2 {
    /// Opens an existing image.
    pub fn open<D: DiskIo + 'static>(disk: D) -> Result<Qcow2> {
        let io = Arc::new(BinaryIo::new(disk));
        let header = Header::open(Arc::clone(&io))?;
        Ok(Qcow2 {
            io,
            meta: Arc::new(RwLock::new(Metadata {
                header,
                refcounts: Refcounts::new(),
            })),
        })
    }

    /// Formats `disk` as an empty image and opens it.
    ///
    /// Lays down the header, a zeroed L1 table, the refcount table, and the
    /// initial refcount block(s), then references every metadata cluster
    /// through the normal refcount machinery.
    pub fn create<D: DiskIo + 'static>(disk: D, params: &CreateParams) -> Result<Qcow2> {
        if params.version != 2 && params.version != 3 {
            return Err(Error::UnsupportedVersion(params.version));
        }
        if !(header::MIN_CLUSTER_BITS..=header::MAX_CLUSTER_BITS).contains(&params.cluster_bits) {
            return Err(Error::BadClusterBits(params.cluster_bits));
        }
        if !(1..=6).contains(&params.refcount_order)
            || (params.version == 2 && params.refcount_order != header::DEFAULT_REFCOUNT_ORDER)
        {
            return Err(Error::BadRefcountOrder(params.refcount_order));
        }

        let cluster_size = 1u64 << params.cluster_bits;
        let l2_entries = cluster_size / 8;
        let l1_size = params.size.div_ceil(cluster_size * l2_entries).max(1) as u32;
        let l1_clusters = (l1_size as u64 * 8).div_ceil(cluster_size);
        let entries_per_block = cluster_size * 8 / (1u64 << params.refcount_order);

        // Grow the table until it addresses the whole metadata prefix:
        // header, L1, the table itself, and enough refcount blocks to
        // describe all of it.
        let mut table_clusters = 1u64;
        let (table_clusters, block_count, base) = loop {
            let base = 1 + l1_clusters + table_clusters;
            let mut blocks = 1u64;
            while (base + blocks).div_ceil(entries_per_block) > blocks {
                blocks += 1;
            }
            let addressable = table_clusters * (cluster_size / 8) * entries_per_block;
            if base + blocks <= addressable {
                break (table_clusters, blocks, base);
            }
            table_clusters += 1;
        };

        let io = Arc::new(BinaryIo::new(disk));
        let mut header = Header {
            io: Arc::clone(&io),
            version: params.version,
            cluster_bits: params.cluster_bits,
            size: params.size,
            l1_size,
            l1_table_offset: cluster_size,
            refcount_table_offset: (1 + l1_clusters) * cluster_size,
            refcount_table_clusters: table_clusters as u32,
            nb_snapshots: 0,
            snapshots_offset: 0,
            incompatible_features: 0,
            compatible_features: 0,
            autoclear_features: 0,
            refcount_order: params.refcount_order,
            header_size: if params.version == 2 {
                header::V2_BARE_HEADER_SIZE
            } else {
                header::V3_BARE_HEADER_SIZE
            },
            extra_header: Vec::new(),
            extensions: Vec::new(),
            feature_names: Vec::new(),
        };
        header.write()?;
        io.zero(header.l1_table_offset, l1_clusters * cluster_size)?;
        io.zero(
            header.refcount_table_offset,
            table_clusters * cluster_size,
        )?;
        for b in 0..block_count {
            let block_offset = (base + b) * cluster_size;
            io.zero(block_offset, cluster_size)?;
            io.write_u64(header.refcount_table_offset + b * 8, block_offset)?;
        }

        let mut refcounts = Refcounts::new();
        for cluster in 0..base + block_count {
            refcounts.reference_cluster(&mut header, cluster)?;
        }

        Ok(Qcow2 {
            io,
            meta: Arc::new(RwLock::new(Metadata { header, refcounts })),
        })
    }

    /// Returns a guest handle onto the image.
    pub fn guest(&self) -> Guest {
        Guest::new(Arc::clone(&self.io), Arc::clone(&self.meta))
    }

    pub fn cluster_size(&self) -> u64 {
        self.meta.read().unwrap().header.cluster_size()
    }

    pub fn version(&self) -> u32 {
        self.meta.read().unwrap().header.version
    }

    /// Decodes the snapshot directory.
    pub fn snapshots(&self) -> Result<Vec<Snapshot>> {
        let meta = self.meta.read().unwrap();
        snapshot::read_snapshots(&meta.header)
    }

    /// Enumerates every cluster with a nonzero refcount as
    /// `(cluster_index, refcount)` pairs, in index order.
    pub fn used_clusters(&self) -> Result<Vec<(u64, u64)>> {
        let meta = self.meta.read().unwrap();
        meta.refcounts.used_clusters(&meta.header)?.collect()
    }

    /// Releases the image. There are no background workers to join; this
    /// simply drops the handle.
    pub fn close(self) -> Result<()> {
        Ok(())
    }
}
