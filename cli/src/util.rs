// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use anyhow::Result;
use itertools::Itertools;
use owo_colors::OwoColorize;

use edl::device::read_gpt;
use edl::firehose_get_storage_info;
use edl::gpt::format_guid;
use edl::types::EdlChan;

pub fn print_partition_tables<T: EdlChan>(channel: &mut T) -> Result<()> {
    for lun in channel.fh_config().luns.clone() {
        let gpt = match read_gpt(channel, lun, None) {
            Ok(g) => g,
            Err(e) => {
                println!("LUN {}: {}", lun, e.to_string().red());
                continue;
            }
        };

        println!(
            "{} {} of {}, disk {}:",
            "LUN".bright_yellow(),
            lun.bright_yellow(),
            channel.fh_config().memory_name.to_string().bright_yellow(),
            format_guid(&gpt.header.disk_guid),
        );
        for (idx, part) in gpt.entries.iter().enumerate().filter(|(_, p)| p.is_present()) {
            let flags = part.ab_flags();
            println!(
                "{:>3}] {}: start_sector = {}, {} kiB, type {}{}",
                idx,
                part.name,
                part.starting_lba,
                part.sectors() as usize * gpt.sector_size / 1024,
                format_guid(&part.type_guid),
                if flags.active { " (active)" } else { "" },
            );
        }
    }

    Ok(())
}

/// Every loader prints its geometry as a JSON blob behind an "INFO: "
/// prefixed log line; dig it out and pretty-print it per LUN
pub fn print_storage_info<T: EdlChan>(channel: &mut T) -> Result<()> {
    for lun in channel.fh_config().luns.clone() {
        let logs = firehose_get_storage_info(channel, lun)?;
        let Some(line) = logs
            .iter()
            .filter_map(|l| l.strip_prefix("INFO: "))
            .find(|l| l.contains("storage_info"))
        else {
            println!("LUN {lun}: the loader didn't volunteer any storage_info");
            continue;
        };

        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(info) => {
                println!("{} {}:", "LUN".bright_yellow(), lun.bright_yellow());
                match info.get("storage_info").and_then(|s| s.as_object()) {
                    Some(obj) => println!(
                        "{}",
                        obj.iter().map(|(k, v)| format!("  {k}: {v}")).format("\n")
                    ),
                    None => println!("  {info}"),
                }
            }
            Err(e) => println!("LUN {lun}: undecodable storage_info ({e})"),
        }
    }

    Ok(())
}
