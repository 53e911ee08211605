// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Cluster reference counting.
//!
//! Refcounts live in a two-level structure: a contiguous table of 64-bit
//! block pointers, and one-cluster refcount blocks densely packed with
//! `1 << refcount_order`-bit counters. The manager resolves counters through
//! that structure, hands out free clusters, and grows the top-level table
//! when it runs out of address space.
//!
//! All persistent state is on disk; the only thing kept in memory is a
//! cursor over the free-cluster sequence.

use log::debug;

use super::header::Header;
use super::{Error, Result};

// Low 9 bits of a refcount table entry are reserved.
const TABLE_ENTRY_VALID: u64 = !0x1ff;

/// Reference count manager for one open image.
///
/// Every operation takes the [`Header`] explicitly; mutating operations that
/// may grow the table take it mutably because growth repoints the table and
/// rewrites the header.
#[derive(Debug)]
pub(crate) struct Refcounts {
    /// Next candidate for the free-cluster scan. `None` until the first
    /// lookup seeds it from a one-pass table scan.
    free_cursor: Option<u64>,
}

impl Refcounts {
    pub fn new() -> Refcounts {
        Refcounts { free_cursor: None }
    }

    /// Number of refcounts packed into one block cluster.
    fn entries_per_block(header: &Header) -> u64 {
        header.cluster_size() * 8 / header.refcount_bits() as u64
    }

    /// Largest cluster index addressable without growing the table.
    pub fn max(header: &Header) -> u64 {
        header.refcount_table_clusters as u64
            * (header.cluster_size() / 8)
            * Self::entries_per_block(header)
    }

    fn refcount_ceiling(header: &Header) -> u64 {
        let bits = header.refcount_bits();
        if bits >= 64 {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        }
    }

    /// Resolves the refcount block holding `idx`, or `None` when the table
    /// does not describe it.
    fn block_for(header: &Header, idx: u64) -> Result<Option<u64>> {
        let table_byte = idx / Self::entries_per_block(header) * 8;
        if table_byte >= header.refcount_table_clusters as u64 * header.cluster_size() {
            return Ok(None);
        }
        let entry = header
            .io()
            .read_u64(header.refcount_table_offset + table_byte)?;
        if entry == 0 {
            return Ok(None);
        }
        if entry & !TABLE_ENTRY_VALID != 0 || entry % header.cluster_size() != 0 {
            return Err(Error::BadRefcountEntry(entry));
        }
        Ok(Some(entry))
    }

    /// Decodes the `slot`-th refcount from a block held in memory.
    fn decode(block: &[u8], bits: u32, slot: u64) -> u64 {
        let bit_off = bits as u64 * slot;
        let byte_off = (bit_off / 8) as usize;
        let nbytes = (bits as usize).div_ceil(8);
        let mut value: u64 = 0;
        for &b in &block[byte_off..byte_off + nbytes] {
            value = value << 8 | b as u64;
        }
        let mask = if bits >= 64 {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        };
        value >> (bit_off % 8) & mask
    }

    /// Reads a single refcount from the block at `block_offset`.
    fn read_refcount(header: &Header, block_offset: u64, slot: u64) -> Result<u64> {
        let bits = header.refcount_bits();
        let bit_off = bits as u64 * slot;
        let nbytes = (bits as usize).div_ceil(8);
        let mut buf = [0u8; 8];
        header
            .io()
            .read_at(block_offset + bit_off / 8, &mut buf[..nbytes])?;
        let mut value: u64 = 0;
        for &b in &buf[..nbytes] {
            value = value << 8 | b as u64;
        }
        let mask = if bits >= 64 {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        };
        Ok(value >> (bit_off % 8) & mask)
    }

    /// Writes a single refcount into the block at `block_offset`.
    ///
    /// Sub-byte widths read-modify-write their byte; whole-byte widths are
    /// written big-endian over the slot.
    fn write_refcount(header: &Header, block_offset: u64, slot: u64, rc: u64) -> Result<()> {
        let bits = header.refcount_bits();
        let bit_off = bits as u64 * slot;
        let offset = block_offset + bit_off / 8;
        if bits < 8 {
            let shift = (bit_off % 8) as u32;
            let mask = ((1u32 << bits) - 1) as u8;
            let mut byte = header.io().read_u8(offset)?;
            byte &= !(mask << shift);
            byte |= (rc as u8 & mask) << shift;
            header.io().write_u8(offset, byte)
        } else {
            let nbytes = (bits / 8) as usize;
            let mut buf = [0u8; 8];
            for i in 0..nbytes {
                buf[nbytes - 1 - i] = (rc >> (8 * i)) as u8;
            }
            header.io().write_at(offset, &buf[..nbytes])
        }
    }

    /// Returns the refcount of cluster `idx`, 0 when undescribed.
    pub fn refcount(header: &Header, idx: u64) -> Result<u64> {
        match Self::block_for(header, idx)? {
            None => Ok(0),
            Some(block) => {
                Self::read_refcount(header, block, idx % Self::entries_per_block(header))
            }
        }
    }

    /// Bumps the refcount of an allocated cluster.
    pub fn increment(&self, header: &Header, idx: u64) -> Result<u64> {
        let block = Self::block_for(header, idx)?.ok_or(Error::UnderflowOrUnallocated(idx))?;
        let slot = idx % Self::entries_per_block(header);
        let rc = Self::read_refcount(header, block, slot)?;
        if rc == 0 {
            return Err(Error::UnderflowOrUnallocated(idx));
        }
        if rc == Self::refcount_ceiling(header) {
            return Err(Error::RefcountAtMax(idx));
        }
        Self::write_refcount(header, block, slot, rc + 1)?;
        Ok(rc + 1)
    }

    /// Drops the refcount of an allocated cluster. A cluster that reaches
    /// zero becomes eligible for reallocation.
    pub fn decrement(&mut self, header: &Header, idx: u64) -> Result<u64> {
        let block = Self::block_for(header, idx)?.ok_or(Error::UnderflowOrUnallocated(idx))?;
        let slot = idx % Self::entries_per_block(header);
        let rc = Self::read_refcount(header, block, slot)?;
        if rc == 0 {
            return Err(Error::UnderflowOrUnallocated(idx));
        }
        Self::write_refcount(header, block, slot, rc - 1)?;
        if rc == 1 {
            // Rewind the scan so the freed cluster can be handed out again.
            if let Some(cursor) = self.free_cursor {
                self.free_cursor = Some(cursor.min(idx));
            }
        }
        Ok(rc - 1)
    }

    /// One-pass scan for the first cluster with refcount zero.
    fn first_free_scan(header: &Header) -> Result<u64> {
        let cluster_size = header.cluster_size();
        let entries_per_block = Self::entries_per_block(header);
        let bits = header.refcount_bits();
        let table_entries = header.refcount_table_clusters as u64 * cluster_size / 8;
        let mut block = vec![0u8; cluster_size as usize];
        for window in 0..table_entries {
            let entry = header
                .io()
                .read_u64(header.refcount_table_offset + window * 8)?;
            if entry == 0 {
                return Ok(window * entries_per_block);
            }
            if entry & !TABLE_ENTRY_VALID != 0 || entry % cluster_size != 0 {
                return Err(Error::BadRefcountEntry(entry));
            }
            header.io().read_at(entry, &mut block)?;
            for slot in 0..entries_per_block {
                if Self::decode(&block, bits, slot) == 0 {
                    return Ok(window * entries_per_block + slot);
                }
            }
        }
        // Every described cluster is in use; the next free one is past the
        // table's reach.
        Ok(Self::max(header))
    }

    /// Pulls the next free cluster off the scan.
    ///
    /// Clusters already handed out this way are never returned again until
    /// a `decrement` rewinds the cursor behind them, which is what keeps an
    /// in-flight run and the refcount blocks allocated to describe it from
    /// colliding.
    fn next_free(&mut self, header: &Header) -> Result<u64> {
        let mut at = match self.free_cursor {
            Some(at) => at,
            None => Self::first_free_scan(header)?,
        };
        while Self::refcount(header, at)? != 0 {
            at += 1;
        }
        self.free_cursor = Some(at + 1);
        Ok(at)
    }

    /// Finds `n` consecutive free clusters and returns the first.
    ///
    /// The run restarts whenever the scan yields a non-adjacent cluster.
    pub fn find_free_run(&mut self, header: &Header, n: u64) -> Result<u64> {
        let mut start = self.next_free(header)?;
        let mut count = 1;
        while count < n {
            let c = self.next_free(header)?;
            if c == start + count {
                count += 1;
            } else {
                start = c;
                count = 1;
            }
        }
        Ok(start)
    }

    /// Reserves `n` consecutive free clusters, sets each refcount to 1, and
    /// returns the index of the first.
    pub fn allocate(&mut self, header: &mut Header, n: u64) -> Result<u64> {
        let start = self.find_free_run(header, n)?;
        for i in 0..n {
            self.reference_cluster(header, start + i)?;
        }
        Ok(start)
    }

    /// Sets the refcount of a fresh cluster to 1, materializing its
    /// refcount block first if needed.
    pub fn reference_cluster(&mut self, header: &mut Header, idx: u64) -> Result<()> {
        let block = self.ensure_block(header, idx)?;
        Self::write_refcount(header, block, idx % Self::entries_per_block(header), 1)
    }

    /// Returns the offset of the refcount block describing `idx`, creating
    /// it (and growing the table) as needed.
    ///
    /// A fresh block must itself be refcounted. When the block lands inside
    /// the window it describes, its own refcount is written directly into
    /// it, which is what terminates the recursion.
    fn ensure_block(&mut self, header: &mut Header, idx: u64) -> Result<u64> {
        let cluster_size = header.cluster_size();
        let entries_per_block = Self::entries_per_block(header);
        let table_byte = idx / entries_per_block * 8;
        if table_byte >= header.refcount_table_clusters as u64 * cluster_size {
            self.grow_table(header, idx)?;
        }
        if let Some(block) = Self::block_for(header, idx)? {
            return Ok(block);
        }

        let block_idx = self.next_free(header)?;
        let block_offset = block_idx * cluster_size;
        header.io().zero(block_offset, cluster_size)?;

        let window_base = idx / entries_per_block * entries_per_block;
        if block_idx >= window_base && block_idx < window_base + entries_per_block {
            // Self-describing: the new block carries its own refcount.
            Self::write_refcount(header, block_offset, block_idx - window_base, 1)?;
        } else {
            self.reference_cluster(header, block_idx)?;
        }

        // The table may have moved if the recursion grew it; recompute the
        // slot from the current header.
        header
            .io()
            .write_u64(header.refcount_table_offset + table_byte, block_offset)?;
        Ok(block_offset)
    }

    /// Grows the refcount table so it can describe `trigger_idx`.
    ///
    /// The new table and the refcount blocks describing it are staged as one
    /// contiguous run; the old table stays authoritative until the header is
    /// repointed, after which its clusters are released.
    fn grow_table(&mut self, header: &mut Header, trigger_idx: u64) -> Result<()> {
        let cluster_size = header.cluster_size();
        let entries_per_block = Self::entries_per_block(header);
        let old_clusters = header.refcount_table_clusters as u64;
        let old_offset = header.refcount_table_offset;

        let new_start = self.next_free(header)?;
        let pre = new_start % entries_per_block;

        // Double the table until it addresses both the trigger and every
        // cluster of its own new layout.
        let mut table_clusters = old_clusters;
        let new_blocks = loop {
            table_clusters *= 2;
            let new_blocks = (pre + table_clusters) / (entries_per_block - 1) + 1;
            let highest = new_start + table_clusters + new_blocks - 1;
            let addressable =
                table_clusters * (cluster_size / 8) * entries_per_block;
            if trigger_idx < addressable && highest < addressable {
                break new_blocks;
            }
        };
        debug!(
            "growing refcount table: {old_clusters} -> {table_clusters} clusters at cluster {new_start}"
        );

        // The rest of the run must be adjacent to the candidate start.
        for i in 1..table_clusters + new_blocks {
            if self.next_free(header)? != new_start + i {
                return Err(Error::TableGrowthFailed);
            }
        }

        // Stage the new table in memory: old entries, zero fill, then the
        // fresh blocks slotted into the first windows that lack one.
        let old_entries = old_clusters * cluster_size / 8;
        let mut table = vec![0u64; (table_clusters * cluster_size / 8) as usize];
        for i in 0..old_entries {
            table[i as usize] = header.io().read_u64(old_offset + i * 8)?;
        }
        let mut window = (new_start / entries_per_block) as usize;
        for b in 0..new_blocks {
            let block_offset = (new_start + table_clusters + b) * cluster_size;
            header.io().zero(block_offset, cluster_size)?;
            while window < table.len() && table[window] != 0 {
                window += 1;
            }
            if window >= table.len() {
                return Err(Error::TableGrowthFailed);
            }
            table[window] = block_offset;
            window += 1;
        }

        // Write the staged table, then describe every cluster it gained,
        // using the staged entries as the source of truth.
        let new_table_offset = new_start * cluster_size;
        let mut bytes = vec![0u8; table.len() * 8];
        for (i, entry) in table.iter().enumerate() {
            bytes[i * 8..i * 8 + 8].copy_from_slice(&entry.to_be_bytes());
        }
        header.io().write_at(new_table_offset, &bytes)?;

        for c in new_start..new_start + table_clusters + new_blocks {
            let block = table[(c / entries_per_block) as usize];
            if block == 0 {
                return Err(Error::TableGrowthFailed);
            }
            Self::write_refcount(header, block, c % entries_per_block, 1)?;
        }

        header.set_refcount_table(new_table_offset, table_clusters as u32)?;

        // The old table is no longer reachable; release its clusters.
        let old_first = old_offset / cluster_size;
        for i in 0..old_clusters {
            self.decrement(header, old_first + i)?;
        }
        Ok(())
    }

    /// Iterates every cluster with a nonzero refcount.
    pub fn used_clusters<'a>(&self, header: &'a Header) -> Result<UsedClusters<'a>> {
        let table_entries = header.refcount_table_clusters as u64 * header.cluster_size() / 8;
        let mut table = Vec::with_capacity(table_entries as usize);
        for i in 0..table_entries {
            table.push(
                header
                    .io()
                    .read_u64(header.refcount_table_offset + i * 8)?,
            );
        }
        Ok(UsedClusters {
            header,
            table,
            entries_per_block: Self::entries_per_block(header),
            window: 0,
            block: None,
            slot: 0,
            done: false,
        })
    }
}

/// Iterator over `(cluster_index, refcount)` for every used cluster.
///
/// Snapshots the table up front, then decodes each referenced block cluster
/// in memory.
pub(crate) struct UsedClusters<'a> {
    header: &'a Header,
    table: Vec<u64>,
    entries_per_block: u64,
    window: usize,
    block: Option<Vec<u8>>,
    slot: u64,
    done: bool,
}

impl Iterator for UsedClusters<'_> {
    type Item = Result<(u64, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let bits = self.header.refcount_bits();
        loop {
            if let Some(block) = &self.block {
                while self.slot < self.entries_per_block {
                    let slot = self.slot;
                    self.slot += 1;
                    let rc = Refcounts::decode(block, bits, slot);
                    if rc != 0 {
                        let idx = self.window as u64 * self.entries_per_block + slot;
                        return Some(Ok((idx, rc)));
                    }
                }
                self.block = None;
                self.window += 1;
            }
            while self.window < self.table.len() && self.table[self.window] == 0 {
                self.window += 1;
            }
            if self.window >= self.table.len() {
                return None;
            }
            let entry = self.table[self.window];
            if entry & !TABLE_ENTRY_VALID != 0 || entry % self.header.cluster_size() != 0 {
                self.done = true;
                return Some(Err(Error::BadRefcountEntry(entry)));
            }
            let mut block = vec![0u8; self.header.cluster_size() as usize];
            if let Err(e) = self.header.io().read_at(entry, &mut block) {
                self.done = true;
                return Some(Err(e));
            }
            self.block = Some(block);
            self.slot = 0;
        }
    }
}
