// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! The flows a front-end actually calls: bring the device up, then flash,
//! erase and repair storage addressed through GPT partition names.
//!
//! Everything here is a thin orchestration over the Sahara, Firehose, GPT
//! and sparse engines; no state lives outside the channel it is handed.

use std::io::Cursor;

use log::{debug, error, info, warn};
use pbr::{ProgressBar, Units};

use crate::error::{EdlError, Result};
use crate::gpt::{Gpt, GptHeader, GptPartitionEntry};
use crate::sahara::{SaharaProbe, sahara_probe, sahara_read_serial_number, sahara_upload_loader};
use crate::sparse::Sparse;
use crate::types::EdlChan;
use crate::{
    MAX_ERASE_RANGE_SECTORS, firehose_configure, firehose_erase_storage, firehose_fix_gpt,
    firehose_program_storage, firehose_read_storage, firehose_set_bootable,
};

/// What `erase_lun` keeps by default: the protective MBR, both GPT copies
/// and the calibration data nobody can regenerate
pub const DEFAULT_PRESERVE: [&str; 3] = ["mbr", "gpt", "persist"];

/// Drive the device from wherever it currently is into a configured
/// Firehose session, uploading `programmer` through Sahara if needed
pub fn connect_device<T: EdlChan>(channel: &mut T, programmer: &[u8]) -> Result<()> {
    match sahara_probe(channel)? {
        SaharaProbe::Firehose => info!("device is already running a Firehose loader"),
        SaharaProbe::Sahara => {
            let serial = sahara_read_serial_number(channel)?;
            info!("chip serial number: 0x{serial}");
            sahara_upload_loader(channel, programmer)?;
        }
        SaharaProbe::Wedged => {
            return Err(EdlError::Connection(
                "device answers neither Sahara nor Firehose, reboot it into EDL".to_owned(),
            ));
        }
    }

    firehose_configure(channel)
}

fn read_gpt_at<T: EdlChan>(channel: &mut T, lun: u8, lba: u64) -> Result<Gpt> {
    let sector_size = channel.fh_config().sector_size;

    let mut buf = Cursor::new(Vec::new());
    firehose_read_storage(channel, &mut buf, 1, lun, lba)?;
    let (header, header_crc_mismatch) = GptHeader::parse(buf.get_ref(), lba, lun)?;

    let table_len = header.num_part_entries as u64 * header.part_entry_size as u64;
    let entry_sectors = table_len.div_ceil(sector_size as u64) as usize;
    let mut entry_buf = Cursor::new(Vec::new());
    if entry_sectors > 0 {
        firehose_read_storage(
            channel,
            &mut entry_buf,
            entry_sectors,
            lun,
            header.part_entries_start_lba,
        )?;
    }

    Gpt::from_parts(
        header,
        header_crc_mismatch,
        entry_buf.get_ref(),
        sector_size,
        lun,
    )
}

/// Read and reconcile the partition table of one LUN.
///
/// With an explicit `sector` the caller gets exactly that copy, mismatched
/// CRCs and all. Otherwise the primary at LBA 1 is checked against the
/// backup: a corrupt primary falls back to a clean backup, a disagreement
/// between two clean copies trusts the primary, and two corrupt copies are
/// an error. Nothing is written back; healing is `repair_gpt`'s job.
pub fn read_gpt<T: EdlChan>(channel: &mut T, lun: u8, sector: Option<u64>) -> Result<Gpt> {
    if let Some(lba) = sector {
        return read_gpt_at(channel, lun, lba);
    }

    let primary = read_gpt_at(channel, lun, 1)?;
    let backup = read_gpt_at(channel, lun, primary.header.alternate_lba);

    if !primary.is_corrupt() {
        match &backup {
            Ok(b) if b.header.part_entries_crc32 != primary.header.part_entries_crc32 => {
                warn!("primary and backup GPT entry arrays disagree on LUN {lun}, trusting the primary");
            }
            Ok(_) => {}
            Err(e) => warn!("backup GPT on LUN {lun} is unreadable: {e}"),
        }
        return Ok(primary);
    }

    match backup {
        Ok(b) if !b.is_corrupt() => {
            warn!("primary GPT on LUN {lun} is corrupt, using the backup");
            Ok(b)
        }
        _ => Err(EdlError::gpt(lun, "both GPT copies are corrupt")),
    }
}

/// Locate a named partition across all LUNs
pub fn find_partition<T: EdlChan>(channel: &mut T, name: &str) -> Result<(u8, GptPartitionEntry)> {
    for lun in session_luns(channel) {
        match read_gpt(channel, lun, None) {
            Ok(gpt) => {
                if let Some(part) = gpt.find_partition(name) {
                    return Ok((lun, part.clone()));
                }
            }
            Err(e) => debug!("no usable GPT on LUN {lun}: {e}"),
        }
    }
    Err(EdlError::Flash {
        partition: name.to_owned(),
        reason: "no such partition on any LUN".to_owned(),
    })
}

fn session_luns<T: EdlChan>(channel: &mut T) -> Vec<u8> {
    let cfg = channel.fh_config();
    if cfg.luns.is_empty() {
        (0..cfg.max_lun).collect()
    } else {
        cfg.luns.clone()
    }
}

/// Erase a contiguous sector range, split at the per-command cap
fn erase_range<T: EdlChan>(channel: &mut T, lun: u8, start: u64, end: u64) -> Result<()> {
    let mut sector = start;
    while sector <= end {
        let count = (end - sector + 1).min(MAX_ERASE_RANGE_SECTORS);
        if let Err(e) = firehose_erase_storage(channel, lun, sector, count) {
            error!(
                "erase failed for sectors {sector}..={} on LUN {lun}",
                sector + count - 1
            );
            return Err(e);
        }
        sector += count;
    }
    Ok(())
}

/// Flash an image (raw or sparse) into the named partition
pub fn flash_blob<T: EdlChan>(channel: &mut T, name: &str, blob: &[u8]) -> Result<()> {
    if name == "gpt" {
        warn!("refusing to overwrite the partition table directly, use repairgpt");
        return Ok(());
    }

    let (lun, part) = find_partition(channel, name)?;
    let sector_size = channel.fh_config().sector_size;
    let needed = blob.len().div_ceil(sector_size) as u64;
    if needed > part.sectors() {
        return Err(EdlError::Flash {
            partition: name.to_owned(),
            reason: format!(
                "image needs {needed} sectors but the partition only has {}",
                part.sectors()
            ),
        });
    }

    match Sparse::from(blob)? {
        None => {
            let mut bar = ProgressBar::on(std::io::stderr(), blob.len() as u64);
            bar.set_units(Units::Bytes);
            bar.message(&format!("{name} "));
            let mut cb = |written: usize| {
                bar.set(written as u64);
            };
            firehose_program_storage(channel, blob, name, lun, part.starting_lba, Some(&mut cb))?;
            bar.finish();
        }
        Some(sparse) => {
            info!(
                "sparse image: {} blocks of {} bytes in {} chunks",
                sparse.header.total_blks, sparse.header.blk_sz, sparse.header.total_chunks
            );
            // wipe the whole range first so the holes read back as zeroes
            erase_range(channel, lun, part.starting_lba, part.ending_lba)?;

            let expanded = sparse.header.total_blks as u64 * sparse.header.blk_sz as u64;
            let mut bar = ProgressBar::on(std::io::stderr(), expanded);
            bar.set_units(Units::Bytes);
            bar.message(&format!("{name} "));

            for run in sparse.read() {
                let run = run?;
                if run.offset % sector_size as u64 != 0 {
                    return Err(EdlError::Sparse(format!(
                        "chunk offset {} is not sector-aligned",
                        run.offset
                    )));
                }
                if let Some(data) = run.data {
                    let sector = part.starting_lba + run.offset / sector_size as u64;
                    let mut cb = |written: usize| {
                        bar.set(run.offset + written as u64);
                    };
                    firehose_program_storage(channel, &data, name, lun, sector, Some(&mut cb))?;
                }
                bar.set(run.offset + run.size);
            }
            bar.finish();
        }
    }

    Ok(())
}

/// Erase one named partition
pub fn erase_partition<T: EdlChan>(channel: &mut T, name: &str) -> Result<()> {
    let (lun, part) = find_partition(channel, name)?;
    info!(
        "erasing '{name}' (sectors {}..={} on LUN {lun})",
        part.starting_lba, part.ending_lba
    );
    erase_range(channel, lun, part.starting_lba, part.ending_lba)
}

/// The sector ranges `erase_lun` may touch: everything on the disk minus
/// the preserved pseudo-ranges ("mbr", "gpt") and named partitions,
/// sorted, coalesced and inverted
pub fn erasable_ranges(gpt: &Gpt, preserve: &[&str]) -> Vec<(u64, u64)> {
    let mut protected: Vec<(u64, u64)> = vec![];
    for name in preserve {
        match *name {
            "mbr" => protected.push((0, 0)),
            "gpt" => {
                protected.push((
                    gpt.header.current_lba,
                    gpt.header.first_usable_lba.saturating_sub(1),
                ));
                protected.push((gpt.header.last_usable_lba + 1, gpt.header.alternate_lba));
            }
            name => {
                if let Some(part) = gpt.find_partition(name) {
                    protected.push((part.starting_lba, part.ending_lba));
                }
            }
        }
    }
    protected.sort_unstable();

    let mut merged: Vec<(u64, u64)> = vec![];
    for (start, end) in protected {
        match merged.last_mut() {
            Some(last) if start <= last.1 + 1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }

    let disk_end = gpt.header.alternate_lba;
    let mut erasable = vec![];
    let mut cursor = 0u64;
    for (start, end) in merged {
        if start > cursor {
            erasable.push((cursor, start - 1));
        }
        cursor = cursor.max(end + 1);
    }
    if cursor <= disk_end {
        erasable.push((cursor, disk_end));
    }
    erasable
}

/// Erase everything on a LUN except the preserved ranges
pub fn erase_lun<T: EdlChan>(channel: &mut T, lun: u8, preserve: &[&str]) -> Result<()> {
    let gpt = read_gpt(channel, lun, None)?;
    for (start, end) in erasable_ranges(&gpt, preserve) {
        erase_range(channel, lun, start, end)?;
    }
    Ok(())
}

/// Rewrite both GPT copies of a LUN from a known-good primary image.
///
/// The loader's `<fixgpt>` handler grows the table over the real disk size;
/// the backup copy is then derived from whatever the device ended up with,
/// entry array first, header last.
pub fn repair_gpt<T: EdlChan>(channel: &mut T, lun: u8, primary_blob: &[u8]) -> Result<()> {
    firehose_program_storage(channel, primary_blob, "gpt", lun, 0, None)?;
    firehose_fix_gpt(channel, lun)?;

    let mut alternate = read_gpt(channel, lun, Some(1))?.as_alternate();
    let entries = alternate.build_entries();
    let header = alternate.build_header(Some(&entries))?;

    firehose_program_storage(
        channel,
        &entries,
        "gpt",
        lun,
        alternate.header.part_entries_start_lba,
        None,
    )?;
    firehose_program_storage(channel, &header, "gpt", lun, alternate.header.current_lba, None)?;
    info!("rebuilt both GPT copies on LUN {lun}");
    Ok(())
}

/// Flip every LUN's slotted partitions to `slot` and point the boot LUN at
/// the matching XBL copy
pub fn set_active_slot<T: EdlChan>(channel: &mut T, slot: char) -> Result<()> {
    if !matches!(slot, 'a' | 'b') {
        return Err(EdlError::Validation {
            field: "slot",
            reason: format!("expected 'a' or 'b', got '{slot}'"),
        });
    }

    for lun in session_luns(channel) {
        let mut gpt = match read_gpt(channel, lun, None) {
            Ok(g) => g,
            Err(e) => {
                warn!("skipping LUN {lun}: {e}");
                continue;
            }
        };
        if !gpt
            .entries
            .iter()
            .any(|e| e.is_present() && e.slot_suffix().is_some())
        {
            continue;
        }

        gpt.set_active_slot(slot)?;
        let entries = gpt.build_entries();
        let header = gpt.build_header(Some(&entries))?;
        firehose_program_storage(
            channel,
            &entries,
            "gpt",
            lun,
            gpt.header.part_entries_start_lba,
            None,
        )?;
        firehose_program_storage(channel, &header, "gpt", lun, gpt.header.current_lba, None)?;
        debug!("slot {slot} marked active on LUN {lun}");
    }

    // boot LUN 1 carries the slot-a XBL, LUN 2 the slot-b copy
    firehose_set_bootable(channel, if slot == 'a' { 1 } else { 2 })
}

/// The slot the first slotted LUN considers active
pub fn get_active_slot<T: EdlChan>(channel: &mut T) -> Result<char> {
    for lun in session_luns(channel) {
        match read_gpt(channel, lun, None) {
            Ok(gpt) => {
                if gpt
                    .entries
                    .iter()
                    .any(|e| e.is_present() && e.slot_suffix().is_some())
                {
                    return Ok(gpt.get_active_slot());
                }
            }
            Err(e) => debug!("no usable GPT on LUN {lun}: {e}"),
        }
    }
    Ok('a')
}
