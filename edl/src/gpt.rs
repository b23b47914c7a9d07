// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! GUID Partition Table parsing, emission and A/B slot handling.
//!
//! GPT objects are short-lived value snapshots of one on-device table; they
//! hold no reference to the transport. CRC32 mismatches are reported as
//! status, not errors, so the orchestrator can decide between primary and
//! backup copies (see [`crate::device::read_gpt`]).

use log::warn;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EdlError, Result};

pub const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";
pub const GPT_REVISION_1_0: u32 = 0x0001_0000;
/// Size of the defined header fields; `header_size` may claim up to a full
/// sector beyond this, the rest being reserved zeroes
pub const GPT_HEADER_SIZE: usize = 92;
pub const GPT_ENTRY_SIZE_MIN: usize = 128;

const GPT_HEADER_CRC_RANGE: std::ops::Range<usize> = 16..20;
const GPT_ENTRY_NAME_UTF16_LEN: usize = 36;

// Qualcomm's A/B scheme keeps the slot state in the vendor-defined high
// bits of the entry attributes, starting at bit 48
const AB_FLAG_SHIFT: u32 = 48;
const AB_SLOT_ACTIVE: u64 = 1 << 2;
const AB_BOOT_SUCCESSFUL: u64 = 1 << 6;
const AB_UNBOOTABLE: u64 = 1 << 7;
const AB_TRIES_SHIFT: u32 = 8;
const AB_TRIES_MASK: u64 = 0xF << AB_TRIES_SHIFT;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GptHeader {
    pub signature: [u8; 8],
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub reserved: u32,
    pub current_lba: u64,
    pub alternate_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: [u8; 16],
    pub part_entries_start_lba: u64,
    pub num_part_entries: u32,
    pub part_entry_size: u32,
    pub part_entries_crc32: u32,
}

impl GptHeader {
    /// Parse a header out of a sector read at `read_lba`. Signature and
    /// revision mismatches reject; a failed CRC only flags the result.
    pub fn parse(sector: &[u8], read_lba: u64, lun: u8) -> Result<(Self, bool)> {
        if sector.len() < GPT_HEADER_SIZE {
            return Err(EdlError::gpt(lun, "short header read"));
        }

        let header: GptHeader = bincode::deserialize(&sector[..GPT_HEADER_SIZE])
            .map_err(|e| EdlError::gpt(lun, format!("undecodable header: {e}")))?;

        if header.signature != GPT_SIGNATURE {
            return Err(EdlError::gpt(lun, "signature mismatch"));
        }
        if header.revision != GPT_REVISION_1_0 {
            return Err(EdlError::gpt(
                lun,
                format!("unsupported revision 0x{:08x}", header.revision),
            ));
        }
        let header_size = header.header_size as usize;
        if !(GPT_HEADER_SIZE..=sector.len()).contains(&header_size) {
            return Err(EdlError::gpt(
                lun,
                format!("implausible header size {header_size}"),
            ));
        }

        // The stored CRC is computed with its own field zeroed
        let mut scratch = sector[..header_size].to_vec();
        scratch[GPT_HEADER_CRC_RANGE].fill(0);
        let mismatch = crc32fast::hash(&scratch) != header.header_crc32;
        if mismatch {
            warn!("GPT header CRC32 mismatch on LUN {lun}");
        }

        if header.current_lba != read_lba {
            warn!(
                "GPT header on LUN {lun} claims LBA {} but was read from {read_lba}",
                header.current_lba
            );
        }

        Ok((header, mismatch))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GptPartitionEntry {
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub starting_lba: u64,
    pub ending_lba: u64,
    pub attributes: u64,
    pub name: String,
}

impl GptPartitionEntry {
    fn parse(raw: &[u8]) -> Self {
        let mut type_guid = [0u8; 16];
        type_guid.copy_from_slice(&raw[0..16]);
        let mut unique_guid = [0u8; 16];
        unique_guid.copy_from_slice(&raw[16..32]);

        let starting_lba = u64::from_le_bytes(raw[32..40].try_into().unwrap());
        let ending_lba = u64::from_le_bytes(raw[40..48].try_into().unwrap());
        let attributes = u64::from_le_bytes(raw[48..56].try_into().unwrap());

        let units: Vec<u16> = raw[56..56 + 2 * GPT_ENTRY_NAME_UTF16_LEN]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
        let name = String::from_utf16_lossy(&units[..end]);

        GptPartitionEntry {
            type_guid,
            unique_guid,
            starting_lba,
            ending_lba,
            attributes,
            name,
        }
    }

    fn to_bytes(&self, entry_size: usize) -> Vec<u8> {
        let mut raw = vec![0u8; entry_size];
        raw[0..16].copy_from_slice(&self.type_guid);
        raw[16..32].copy_from_slice(&self.unique_guid);
        raw[32..40].copy_from_slice(&self.starting_lba.to_le_bytes());
        raw[40..48].copy_from_slice(&self.ending_lba.to_le_bytes());
        raw[48..56].copy_from_slice(&self.attributes.to_le_bytes());
        for (i, unit) in self
            .name
            .encode_utf16()
            .take(GPT_ENTRY_NAME_UTF16_LEN - 1)
            .enumerate()
        {
            raw[56 + 2 * i..58 + 2 * i].copy_from_slice(&unit.to_le_bytes());
        }
        raw
    }

    /// An entry slot is in use iff its type GUID is nonzero
    pub fn is_present(&self) -> bool {
        self.type_guid != [0u8; 16]
    }

    pub fn sectors(&self) -> u64 {
        self.ending_lba - self.starting_lba + 1
    }

    /// The `_a`/`_b` suffix letter of slotted partitions
    pub fn slot_suffix(&self) -> Option<char> {
        if self.name.ends_with("_a") {
            Some('a')
        } else if self.name.ends_with("_b") {
            Some('b')
        } else {
            None
        }
    }

    pub fn ab_flags(&self) -> AbFlags {
        AbFlags::from_attributes(self.attributes)
    }
}

/// The decoded slot state of one partition entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AbFlags {
    pub active: bool,
    pub successful: bool,
    pub unbootable: bool,
    pub tries_remaining: u8,
}

impl AbFlags {
    pub fn from_attributes(attributes: u64) -> Self {
        let field = attributes >> AB_FLAG_SHIFT;
        AbFlags {
            active: field & AB_SLOT_ACTIVE != 0,
            successful: field & AB_BOOT_SUCCESSFUL != 0,
            unbootable: field & AB_UNBOOTABLE != 0,
            tries_remaining: ((field & AB_TRIES_MASK) >> AB_TRIES_SHIFT) as u8,
        }
    }

    /// Replace the slot bits of `attributes` with this state
    pub fn apply(&self, attributes: u64) -> u64 {
        let mask = (AB_SLOT_ACTIVE | AB_BOOT_SUCCESSFUL | AB_UNBOOTABLE | AB_TRIES_MASK)
            << AB_FLAG_SHIFT;
        let mut field = 0u64;
        if self.active {
            field |= AB_SLOT_ACTIVE;
        }
        if self.successful {
            field |= AB_BOOT_SUCCESSFUL;
        }
        if self.unbootable {
            field |= AB_UNBOOTABLE;
        }
        field |= ((self.tries_remaining as u64) << AB_TRIES_SHIFT) & AB_TRIES_MASK;
        (attributes & !mask) | (field << AB_FLAG_SHIFT)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GptParseStatus {
    pub header_crc_mismatch: bool,
    pub entries_crc_mismatch: bool,
}

/// One parsed table: header plus its entry array
#[derive(Clone, Debug)]
pub struct Gpt {
    pub header: GptHeader,
    pub entries: Vec<GptPartitionEntry>,
    pub sector_size: usize,
    pub lun: u8,
    pub status: GptParseStatus,
}

impl Gpt {
    /// Assemble a table from a parsed header and the raw entry-array bytes
    pub fn from_parts(
        header: GptHeader,
        header_crc_mismatch: bool,
        entry_bytes: &[u8],
        sector_size: usize,
        lun: u8,
    ) -> Result<Gpt> {
        let num = header.num_part_entries as usize;
        let entry_size = header.part_entry_size as usize;
        if entry_size < GPT_ENTRY_SIZE_MIN {
            return Err(EdlError::gpt(
                lun,
                format!("implausible entry size {entry_size}"),
            ));
        }
        if num > 8192 {
            return Err(EdlError::gpt(lun, format!("implausible entry count {num}")));
        }
        let table_len = num * entry_size;
        if entry_bytes.len() < table_len {
            return Err(EdlError::gpt(lun, "entry array read came up short"));
        }

        let table = &entry_bytes[..table_len];
        let entries_crc_mismatch = crc32fast::hash(table) != header.part_entries_crc32;
        if entries_crc_mismatch {
            warn!("GPT entry array CRC32 mismatch on LUN {lun}");
        }

        let entries = table.chunks_exact(entry_size).map(GptPartitionEntry::parse).collect();

        Ok(Gpt {
            header,
            entries,
            sector_size,
            lun,
            status: GptParseStatus {
                header_crc_mismatch,
                entries_crc_mismatch,
            },
        })
    }

    pub fn is_corrupt(&self) -> bool {
        self.status.header_crc_mismatch || self.status.entries_crc_mismatch
    }

    /// How many sectors the entry array occupies on disk
    pub fn entry_array_sectors(&self) -> u64 {
        let table_len = self.header.num_part_entries as u64 * self.header.part_entry_size as u64;
        table_len.div_ceil(self.sector_size as u64)
    }

    pub fn build_entries(&self) -> Vec<u8> {
        let entry_size = self.header.part_entry_size as usize;
        let mut out = Vec::with_capacity(self.entries.len() * entry_size);
        for e in &self.entries {
            out.extend_from_slice(&e.to_bytes(entry_size));
        }
        out
    }

    /// Serialize the header with fresh CRCs over `entries` (or a freshly
    /// built array). Mutates the stored CRC fields so the object stays in
    /// sync with what goes to disk.
    pub fn build_header(&mut self, entries: Option<&[u8]>) -> Result<Vec<u8>> {
        let built;
        let entries = match entries {
            Some(e) => e,
            None => {
                built = self.build_entries();
                &built
            }
        };

        self.header.part_entries_crc32 = crc32fast::hash(entries);
        self.header.header_crc32 = 0;

        let mut buf = bincode::serialize(&self.header)
            .map_err(|e| EdlError::gpt(self.lun, format!("couldn't serialize the header: {e}")))?;
        let header_size = self.header.header_size as usize;
        if header_size < buf.len() {
            return Err(EdlError::gpt(self.lun, "header size below the fixed fields"));
        }
        buf.resize(header_size, 0);

        let crc = crc32fast::hash(&buf);
        if crc == 0 || self.header.part_entries_crc32 == 0 {
            return Err(EdlError::gpt(self.lun, "refusing to emit a zero CRC32"));
        }
        self.header.header_crc32 = crc;
        buf[GPT_HEADER_CRC_RANGE].copy_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// The backup view of this table: header at the far end of the disk,
    /// entry array tucked right below it, same partitions.
    pub fn as_alternate(&self) -> Gpt {
        let mut header = self.header.clone();
        header.current_lba = self.header.alternate_lba;
        header.alternate_lba = self.header.current_lba;
        header.part_entries_start_lba = self.header.alternate_lba - self.entry_array_sectors();

        Gpt {
            header,
            entries: self.entries.clone(),
            sector_size: self.sector_size,
            lun: self.lun,
            status: GptParseStatus::default(),
        }
    }

    pub fn find_partition(&self, name: &str) -> Option<&GptPartitionEntry> {
        self.entries.iter().find(|e| e.is_present() && e.name == name)
    }

    /// The first slotted partition with its active bit set decides; "a" is
    /// the documented fallback for tables with no slot marks at all
    pub fn get_active_slot(&self) -> char {
        self.entries
            .iter()
            .filter(|e| e.is_present())
            .find_map(|e| {
                let suffix = e.slot_suffix()?;
                e.ab_flags().active.then_some(suffix)
            })
            .unwrap_or('a')
    }

    /// Rewrite the slot bits of every slotted partition. Only the boot
    /// partitions drive the actual slot choice; the remaining slotted
    /// entries are marked as inert mirrors of their counterpart.
    pub fn set_active_slot(&mut self, slot: char) -> Result<()> {
        if !matches!(slot, 'a' | 'b') {
            return Err(EdlError::Validation {
                field: "slot",
                reason: format!("expected 'a' or 'b', got '{slot}'"),
            });
        }

        for entry in self.entries.iter_mut().filter(|e| e.is_present()) {
            let Some(suffix) = entry.slot_suffix() else {
                continue;
            };
            let active = suffix == slot;
            let flags = if entry.name == "boot_a" || entry.name == "boot_b" {
                AbFlags {
                    active,
                    successful: active,
                    unbootable: false,
                    tries_remaining: 0,
                }
            } else {
                AbFlags {
                    active,
                    successful: false,
                    unbootable: true,
                    tries_remaining: 0,
                }
            };
            entry.attributes = flags.apply(entry.attributes);
        }
        Ok(())
    }
}

/// Canonical mixed-endian GUID formatting: the first three groups are
/// little-endian fields, the last two big-endian byte runs
pub fn format_guid(raw: &[u8; 16]) -> String {
    let d1 = u32::from_le_bytes(raw[0..4].try_into().unwrap());
    let d2 = u16::from_le_bytes(raw[4..6].try_into().unwrap());
    let d3 = u16::from_le_bytes(raw[6..8].try_into().unwrap());
    let d4: [u8; 8] = raw[8..16].try_into().unwrap();
    Uuid::from_fields(d1, d2, d3, &d4).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, type_byte: u8, start: u64, end: u64) -> GptPartitionEntry {
        GptPartitionEntry {
            type_guid: [type_byte; 16],
            unique_guid: [0x5a; 16],
            starting_lba: start,
            ending_lba: end,
            attributes: 0,
            name: name.to_owned(),
        }
    }

    fn sample_gpt() -> Gpt {
        let entries = vec![
            entry("boot_a", 0x11, 40, 47),
            entry("boot_b", 0x11, 48, 55),
            entry("system_a", 0x22, 56, 87),
            entry("system_b", 0x22, 88, 119),
            entry("userdata", 0x33, 120, 199),
            entry("persist", 0x44, 200, 215),
            entry("", 0x00, 0, 0),
            entry("", 0x00, 0, 0),
        ];
        let header = GptHeader {
            signature: GPT_SIGNATURE,
            revision: GPT_REVISION_1_0,
            header_size: GPT_HEADER_SIZE as u32,
            header_crc32: 0,
            reserved: 0,
            current_lba: 1,
            alternate_lba: 8191,
            first_usable_lba: 3,
            last_usable_lba: 8189,
            disk_guid: [0xd1; 16],
            part_entries_start_lba: 2,
            num_part_entries: 8,
            part_entry_size: 128,
            part_entries_crc32: 0,
        };
        Gpt {
            header,
            entries,
            sector_size: 4096,
            lun: 4,
            status: GptParseStatus::default(),
        }
    }

    fn pad_to_sector(mut buf: Vec<u8>, sector_size: usize) -> Vec<u8> {
        buf.resize(sector_size, 0);
        buf
    }

    #[test]
    fn header_and_entries_round_trip() {
        let mut gpt = sample_gpt();
        let entries = gpt.build_entries();
        let header_bytes = gpt.build_header(Some(&entries)).unwrap();
        assert_eq!(header_bytes.len(), GPT_HEADER_SIZE);
        assert_ne!(gpt.header.header_crc32, 0);
        assert_ne!(gpt.header.part_entries_crc32, 0);

        let sector = pad_to_sector(header_bytes, 4096);
        let (parsed, mismatch) = GptHeader::parse(&sector, 1, 4).unwrap();
        assert!(!mismatch);
        assert_eq!(parsed, gpt.header);

        let reparsed = Gpt::from_parts(parsed, false, &entries, 4096, 4).unwrap();
        assert!(!reparsed.is_corrupt());
        assert_eq!(reparsed.entries, gpt.entries);
    }

    #[test]
    fn parse_rejects_bad_signature_and_revision() {
        let mut gpt = sample_gpt();
        let bytes = gpt.build_header(None).unwrap();

        let mut bad_sig = pad_to_sector(bytes.clone(), 4096);
        bad_sig[0..8].copy_from_slice(b"NOT PART");
        assert!(GptHeader::parse(&bad_sig, 1, 4).is_err());

        let mut bad_rev = pad_to_sector(bytes, 4096);
        bad_rev[8..12].copy_from_slice(&0x00020000u32.to_le_bytes());
        assert!(GptHeader::parse(&bad_rev, 1, 4).is_err());
    }

    #[test]
    fn corrupted_header_flags_a_crc_mismatch_without_failing() {
        let mut gpt = sample_gpt();
        let bytes = gpt.build_header(None).unwrap();
        let mut sector = pad_to_sector(bytes, 4096);
        // flip a byte inside the disk guid
        sector[57] ^= 0xff;
        let (_, mismatch) = GptHeader::parse(&sector, 1, 4).unwrap();
        assert!(mismatch);
    }

    #[test]
    fn header_size_may_span_the_whole_sector() {
        let mut gpt = sample_gpt();
        gpt.header.header_size = 4096;
        let bytes = gpt.build_header(None).unwrap();
        assert_eq!(bytes.len(), 4096);
        let (parsed, mismatch) = GptHeader::parse(&bytes, 1, 4).unwrap();
        assert!(!mismatch);
        assert_eq!(parsed.header_size, 4096);
    }

    #[test]
    fn active_slot_defaults_to_a_and_toggles() {
        let mut gpt = sample_gpt();
        assert_eq!(gpt.get_active_slot(), 'a');

        gpt.set_active_slot('a').unwrap();
        assert_eq!(gpt.get_active_slot(), 'a');
        let boot_a = gpt.find_partition("boot_a").unwrap();
        assert!(boot_a.ab_flags().active);
        assert!(boot_a.ab_flags().successful);

        gpt.set_active_slot('b').unwrap();
        assert_eq!(gpt.get_active_slot(), 'b');
        let boot_a = gpt.find_partition("boot_a").unwrap();
        assert!(!boot_a.ab_flags().active);
        let system_a = gpt.find_partition("system_a").unwrap();
        assert!(system_a.ab_flags().unbootable);
        assert!(!system_a.ab_flags().successful);
        assert_eq!(system_a.ab_flags().tries_remaining, 0);

        // non-slotted partitions are left alone
        assert_eq!(gpt.find_partition("userdata").unwrap().attributes, 0);

        let header_bytes = gpt.build_header(None).unwrap();
        assert!(!header_bytes.is_empty());
        assert_ne!(gpt.header.header_crc32, 0);
        assert_ne!(gpt.header.part_entries_crc32, 0);
    }

    #[test]
    fn set_active_slot_rejects_garbage() {
        let mut gpt = sample_gpt();
        assert!(matches!(
            gpt.set_active_slot('c'),
            Err(EdlError::Validation { .. })
        ));
    }

    #[test]
    fn slot_bits_land_at_attribute_bit_48_plus() {
        let flags = AbFlags {
            active: true,
            successful: true,
            unbootable: false,
            tries_remaining: 7,
        };
        let attrs = flags.apply(0);
        assert_eq!((attrs >> 50) & 1, 1, "active is bit 50");
        assert_eq!((attrs >> 54) & 1, 1, "successful is bit 54");
        assert_eq!((attrs >> 55) & 1, 0);
        assert_eq!((attrs >> 56) & 0xf, 7, "tries live at bits 56..59");
        assert_eq!(AbFlags::from_attributes(attrs), flags);

        // the low attribute bits survive a rewrite
        let attrs = flags.apply(0x0000_0000_0000_0005);
        assert_eq!(attrs & 0xffff_ffff_ffff, 5);
    }

    #[test]
    fn alternate_header_mirrors_the_primary() {
        let gpt = sample_gpt();
        let alt = gpt.as_alternate();
        assert_eq!(alt.header.current_lba, gpt.header.alternate_lba);
        assert_eq!(alt.header.alternate_lba, gpt.header.current_lba);
        assert_eq!(alt.header.part_entries_start_lba, 8191 - 1);
        assert_eq!(alt.entries, gpt.entries);
    }

    #[test]
    fn entry_names_survive_utf16_round_trips() {
        let gpt = sample_gpt();
        let bytes = gpt.build_entries();
        let parsed = GptPartitionEntry::parse(&bytes[..128]);
        assert_eq!(parsed.name, "boot_a");
        assert_eq!(parsed.starting_lba, 40);
        assert_eq!(parsed.ending_lba, 47);
        assert!(parsed.is_present());
        assert_eq!(parsed.sectors(), 8);

        let empty = GptPartitionEntry::parse(&bytes[6 * 128..7 * 128]);
        assert!(!empty.is_present());
    }

    #[test]
    fn guid_formatting_is_mixed_endian() {
        let raw: [u8; 16] = [
            0x28, 0x73, 0x2a, 0xc1, 0x1f, 0xf8, 0xd2, 0x11, 0xba, 0x4b, 0x00, 0xa0, 0xc9, 0x3e,
            0xc9, 0x3b,
        ];
        assert_eq!(format_guid(&raw), "c12a7328-f81f-11d2-ba4b-00a0c93ec93b");
        assert_eq!(
            format_guid(&[0u8; 16]),
            "00000000-0000-0000-0000-000000000000"
        );
    }
}
