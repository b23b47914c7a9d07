// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use owo_colors::OwoColorize;

use edl::types::{
    DeviceMsgFilter, EdlBackend, EdlDevice, FirehoseConfiguration, FirehoseMemoryName,
    FirehoseResetMode,
};
use edl::{device, firehose_reset, setup_target_device};

use std::fs;
use std::str::FromStr;

mod util;

#[derive(Debug, Subcommand, PartialEq)]
enum Command {
    /// Erase a partition
    Erase {
        #[arg()]
        name: String,
    },

    /// Write an image (raw or Android sparse) into a partition
    Flash {
        #[arg()]
        name: String,

        #[arg(value_name = "FILE")]
        image: String,
    },

    /// Print which A/B slot is currently active
    GetActiveSlot,

    /// Query the storage geometry of every LUN
    GetStorageInfo,

    /// Print the partition tables
    PrintGpt,

    /// Rewrite both GPT copies of a LUN from a known-good primary image
    RepairGpt {
        #[arg(value_parser = maybe_hex::<u8>)]
        lun: u8,

        #[arg(value_name = "FILE")]
        image: String,
    },

    /// Restart the device
    Reset {
        #[arg(default_value = "system", value_name = "edl/off/system")]
        mode: String,
    },

    /// Mark an A/B slot as active across all LUNs
    SetActiveSlot {
        #[arg(value_name = "a/b")]
        slot: String,
    },
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The signed Firehose programmer for this SoC
    #[arg(short, long, value_name = "FILE")]
    programmer: String,

    /// Defaults to $QDL_LOG_LEVEL, then "info"
    #[arg(long, value_name = "silent/error/warn/info/debug")]
    log_level: Option<String>,

    #[arg(long, value_name = "usb/serial")]
    backend: Option<String>,

    #[arg(short, long, help = "E.g. COM4 on Windows")]
    dev_path: Option<String>,

    // Only applies to the USB backend
    #[arg(long)]
    serial_no: Option<String>,

    #[arg(short, long, default_value = "ufs", value_name = "emmc/ufs/nvme/nand")]
    memory: String,

    #[arg(long)]
    sector_size: Option<usize>,

    #[arg(long, default_value = "6", value_parser = maybe_hex::<u8>)]
    max_lun: u8,

    #[arg(
        long,
        default_value = "false",
        help = "Emulate <erase> by streaming zeroes (for old loaders)"
    )]
    no_fast_erase: bool,

    #[command(subcommand)]
    command: Command,
}

fn init_logging(flag: Option<&str>) -> Result<()> {
    let level = match flag {
        Some(l) => l.to_owned(),
        None => std::env::var("QDL_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned()),
    };
    let filter = match level.as_str() {
        "silent" => "off",
        "error" => "error",
        "warn" => "warn",
        "info" => "info",
        "debug" => "debug",
        other => bail!("Unknown log level '{}' (silent/error/warn/info/debug)", other),
    };

    env_logger::Builder::new()
        .parse_filters(filter)
        .format_timestamp(None)
        .init();
    Ok(())
}

fn default_sector_size(memory: FirehoseMemoryName) -> usize {
    match memory {
        FirehoseMemoryName::Emmc => 512,
        FirehoseMemoryName::Ufs => 4096,
        FirehoseMemoryName::Nvme => 512,
        FirehoseMemoryName::Nand => 2048,
    }
}

fn parse_slot(s: &str) -> Result<char> {
    match s {
        "a" => Ok('a'),
        "b" => Ok('b'),
        _ => bail!("Slot must be 'a' or 'b', not '{}'", s),
    }
}

fn main() -> Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // help and version land on stdout and are not failures
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };
    init_logging(args.log_level.as_deref())?;

    let backend = match args.backend {
        Some(b) => EdlBackend::from_str(&b)?,
        None => EdlBackend::default(),
    };
    let memory = FirehoseMemoryName::from_str(&args.memory)?;

    // Get the MBN programmer binary
    let programmer = fs::read(&args.programmer)
        .with_context(|| format!("Couldn't open the programmer binary {}", args.programmer))?;

    println!(
        "{} {}",
        env!("CARGO_PKG_NAME").green(),
        env!("CARGO_PKG_VERSION").yellow()
    );

    let mut rw_channel = setup_target_device(backend, args.serial_no, args.dev_path)
        .context("Couldn't set up the device")?;
    let mut dev = EdlDevice {
        rw: rw_channel.as_mut(),
        fh_cfg: FirehoseConfiguration {
            memory_name: memory,
            sector_size: args
                .sector_size
                .unwrap_or_else(|| default_sector_size(memory)),
            max_lun: args.max_lun,
            fast_erase: !args.no_fast_erase,
            ..Default::default()
        },
        messages: DeviceMsgFilter::default(),
        reset_on_drop: false,
    };

    device::connect_device(&mut dev, &programmer)?;

    // From here on a host-side failure could strand the device mid-command;
    // arm the reset-on-drop guard until we know we finished cleanly
    dev.reset_on_drop = true;

    match args.command {
        Command::Erase { name } => device::erase_partition(&mut dev, &name)?,
        Command::Flash { name, image } => {
            let blob =
                fs::read(&image).with_context(|| format!("Couldn't open the image {image}"))?;
            device::flash_blob(&mut dev, &name, &blob)?;
        }
        Command::GetActiveSlot => {
            let slot = device::get_active_slot(&mut dev)?;
            println!("Active slot: {}", slot.bright_yellow());
        }
        Command::GetStorageInfo => util::print_storage_info(&mut dev)?,
        Command::PrintGpt => util::print_partition_tables(&mut dev)?,
        Command::RepairGpt { lun, image } => {
            let blob =
                fs::read(&image).with_context(|| format!("Couldn't open the image {image}"))?;
            device::repair_gpt(&mut dev, lun, &blob)?;
        }
        Command::Reset { mode } => {
            let mode = FirehoseResetMode::from_str(&mode)?;
            dev.reset_on_drop = false;
            firehose_reset(&mut dev, &mode, 0)?;
            println!(
                "{} {}",
                "Device reset to".green(),
                mode.to_string().bright_yellow()
            );
            return Ok(());
        }
        Command::SetActiveSlot { slot } => {
            let slot = parse_slot(&slot)?;
            device::set_active_slot(&mut dev, slot)?;
            println!(
                "{} {}",
                "Active slot set to".green(),
                slot.bright_yellow()
            );
        }
    };

    dev.reset_on_drop = false;
    println!("{}", "All went well!".green());

    Ok(())
}
