// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Snapshot directory parsing.
//!
//! Snapshots are inventory only: their records are decoded so callers can
//! list them, but their cluster data is not made readable.

use super::bio::SequentialReader;
use super::header::Header;
use super::{Error, Result};

/// A decoded snapshot record.
#[derive(Clone, Debug)]
pub struct Snapshot {
    l1_table_offset: u64,
    l1_size: u32,
    id: String,
    name: String,
    creation_seconds: u32,
    creation_nanoseconds: u32,
    uptime_nanoseconds: u64,
    vm_state_size: u64,
    guest_size: u64,
    // Extra-area bytes this implementation does not understand, kept so a
    // rewrite can reproduce the record byte for byte.
    unknown_extra: Vec<u8>,
}

impl Snapshot {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn l1_table_offset(&self) -> u64 {
        self.l1_table_offset
    }

    pub fn l1_size(&self) -> u32 {
        self.l1_size
    }

    /// Creation wall-clock time, seconds part.
    pub fn creation_seconds(&self) -> u32 {
        self.creation_seconds
    }

    /// Creation wall-clock time, nanoseconds part.
    pub fn creation_nanoseconds(&self) -> u32 {
        self.creation_nanoseconds
    }

    /// Guest uptime at the time of the snapshot, in nanoseconds.
    pub fn uptime_nanoseconds(&self) -> u64 {
        self.uptime_nanoseconds
    }

    pub fn vm_state_size(&self) -> u64 {
        self.vm_state_size
    }

    /// Guest disk size at the time of the snapshot.
    pub fn guest_size(&self) -> u64 {
        self.guest_size
    }

    pub(crate) fn unknown_extra(&self) -> &[u8] {
        &self.unknown_extra
    }
}

/// Reads all snapshot records named by the header.
pub(crate) fn read_snapshots(header: &Header) -> Result<Vec<Snapshot>> {
    let mut snapshots = Vec::with_capacity(header.nb_snapshots as usize);
    if header.snapshots_offset == 0 {
        return Ok(snapshots);
    }
    let mut r = SequentialReader::new(
        header.io(),
        header.snapshots_offset,
        u64::MAX - header.snapshots_offset,
    );
    for _ in 0..header.nb_snapshots {
        snapshots.push(read_snapshot(header, &mut r)?);
    }
    Ok(snapshots)
}

fn read_snapshot(header: &Header, r: &mut SequentialReader<'_>) -> Result<Snapshot> {
    let l1_table_offset = r.read_u64()?;
    let l1_size = r.read_u32()?;
    let id_size = r.read_u16()?;
    let name_size = r.read_u16()?;
    let creation_seconds = r.read_u32()?;
    let creation_nanoseconds = r.read_u32()?;
    let uptime_nanoseconds = r.read_u64()?;
    let vm_state_size_v2 = r.read_u32()?;
    let extra_size = r.read_u32()?;

    if header.version >= 3 && extra_size < 16 {
        return Err(Error::ShortRead);
    }

    // The extra area carries optional 64-bit overrides; running out of
    // bytes just means the remaining fields keep their defaults.
    let mut extra = r.sub_reader(extra_size as u64)?;
    let mut vm_state_size = vm_state_size_v2 as u64;
    let mut guest_size = header.size;
    if extra.remain() >= 8 {
        vm_state_size = extra.read_u64()?;
    }
    if extra.remain() >= 8 {
        guest_size = extra.read_u64()?;
    }
    let unknown_extra = extra.read_vec(extra.remain() as usize)?;

    let id = String::from_utf8_lossy(&r.read_vec(id_size as usize)?).to_string();
    let name = String::from_utf8_lossy(&r.read_vec(name_size as usize)?).to_string();
    r.align(8)?;

    Ok(Snapshot {
        l1_table_offset,
        l1_size,
        id,
        name,
        creation_seconds,
        creation_nanoseconds,
        uptime_nanoseconds,
        vm_state_size,
        guest_size,
        unknown_extra,
    })
}
