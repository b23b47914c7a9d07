// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::bail;
use log::{debug, error, info};

/// Byte pipe to a device in EDL mode. Backends only need to move bytes;
/// packetization, ZLPs and budgets are handled a layer up.
pub trait EdlReadWrite: Read + Write {
    fn set_read_timeout(&mut self, _timeout: Duration) -> std::io::Result<()> {
        Ok(())
    }

    fn set_write_timeout(&mut self, _timeout: Duration) -> std::io::Result<()> {
        Ok(())
    }
}

/// What the protocol layers program against: a byte pipe plus the
/// session configuration and the device-message sink.
pub trait EdlChan: Read + Write {
    fn fh_config(&self) -> &FirehoseConfiguration;
    fn mut_fh_config(&mut self) -> &mut FirehoseConfiguration;
    fn msg_filter(&mut self) -> &mut DeviceMsgFilter;
    fn set_read_timeout(&mut self, timeout: Duration) -> std::io::Result<()>;
    fn set_write_timeout(&mut self, timeout: Duration) -> std::io::Result<()>;
}

pub struct EdlDevice<'a> {
    pub rw: &'a mut dyn EdlReadWrite,
    pub fh_cfg: FirehoseConfiguration,
    pub messages: DeviceMsgFilter,
    /// Best-effort reset so a host-side error doesn't strand the target
    /// mid-protocol. Only armed once Firehose is up.
    pub reset_on_drop: bool,
}

impl Read for EdlDevice<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.rw.read(buf)
    }
}

impl Write for EdlDevice<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.rw.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.rw.flush()
    }
}

impl EdlChan for EdlDevice<'_> {
    fn fh_config(&self) -> &FirehoseConfiguration {
        &self.fh_cfg
    }

    fn mut_fh_config(&mut self) -> &mut FirehoseConfiguration {
        &mut self.fh_cfg
    }

    fn msg_filter(&mut self) -> &mut DeviceMsgFilter {
        &mut self.messages
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> std::io::Result<()> {
        self.rw.set_read_timeout(timeout)
    }

    fn set_write_timeout(&mut self, timeout: Duration) -> std::io::Result<()> {
        self.rw.set_write_timeout(timeout)
    }
}

impl Drop for EdlDevice<'_> {
    fn drop(&mut self) {
        if self.reset_on_drop {
            debug!("resetting the device back to EDL");
            let _ = crate::firehose_reset(self, &FirehoseResetMode::ResetToEdl, 0);
        }
    }
}

/// Session-wide Firehose knobs. The defaults mirror what current UFS
/// loaders negotiate; `firehose_configure` sends them to the device.
#[derive(Clone, Debug, PartialEq)]
pub struct FirehoseConfiguration {
    pub memory_name: FirehoseMemoryName,
    pub sector_size: usize,
    pub max_lun: u8,
    /// Populated by a successful `<configure>` handshake
    pub luns: Vec<u8>,
    pub send_buffer_size: usize,
    pub xml_buf_size: usize,
    pub zlp_aware_host: bool,
    pub skip_storage_init: bool,
    pub skip_write: bool,
    pub fast_erase: bool,
}

impl Default for FirehoseConfiguration {
    fn default() -> Self {
        FirehoseConfiguration {
            memory_name: FirehoseMemoryName::Ufs,
            sector_size: 4096,
            max_lun: 6,
            luns: vec![],
            send_buffer_size: 1024 * 1024,
            xml_buf_size: 4096,
            zlp_aware_host: true,
            skip_storage_init: false,
            skip_write: false,
            fast_erase: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirehoseStatus {
    Ack,
    Nak,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirehoseResetMode {
    ResetToEdl,
    PowerOff,
    System,
}

impl FirehoseResetMode {
    /// The `value` attribute the loader expects in `<power>`
    pub fn power_value(&self) -> &'static str {
        match self {
            FirehoseResetMode::ResetToEdl => "reset_to_edl",
            FirehoseResetMode::PowerOff => "off",
            FirehoseResetMode::System => "reset",
        }
    }
}

impl FromStr for FirehoseResetMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "edl" => Ok(FirehoseResetMode::ResetToEdl),
            "off" => Ok(FirehoseResetMode::PowerOff),
            "system" => Ok(FirehoseResetMode::System),
            _ => bail!("Unknown reset mode '{}' (edl/off/system)", s),
        }
    }
}

impl fmt::Display for FirehoseResetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirehoseResetMode::ResetToEdl => write!(f, "edl"),
            FirehoseResetMode::PowerOff => write!(f, "off"),
            FirehoseResetMode::System => write!(f, "system"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirehoseMemoryName {
    Emmc,
    Ufs,
    Nvme,
    Nand,
}

impl FromStr for FirehoseMemoryName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "emmc" => Ok(FirehoseMemoryName::Emmc),
            "ufs" => Ok(FirehoseMemoryName::Ufs),
            "nvme" => Ok(FirehoseMemoryName::Nvme),
            "nand" => Ok(FirehoseMemoryName::Nand),
            _ => bail!("Unknown storage type '{}' (emmc/ufs/nvme/nand)", s),
        }
    }
}

impl fmt::Display for FirehoseMemoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirehoseMemoryName::Emmc => write!(f, "eMMC"),
            FirehoseMemoryName::Ufs => write!(f, "UFS"),
            FirehoseMemoryName::Nvme => write!(f, "NVMe"),
            FirehoseMemoryName::Nand => write!(f, "NAND"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EdlBackend {
    #[default]
    Usb,
    Serial,
}

impl FromStr for EdlBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "usb" => Ok(EdlBackend::Usb),
            "serial" => Ok(EdlBackend::Serial),
            _ => bail!("Unknown backend '{}' (usb/serial)", s),
        }
    }
}

const DEDUP_DEBOUNCE: Duration = Duration::from_millis(100);

/// Forwards `INFO:`/`ERROR:` lines from the device log stream, coalescing
/// the consecutive repeats chatty loaders love to produce.
pub struct DeviceMsgFilter {
    last: Option<String>,
    repeats: u32,
    last_seen: Instant,
}

impl Default for DeviceMsgFilter {
    fn default() -> Self {
        DeviceMsgFilter {
            last: None,
            repeats: 0,
            last_seen: Instant::now(),
        }
    }
}

impl DeviceMsgFilter {
    pub fn push(&mut self, line: &str) {
        let forward = line.starts_with("ERROR:") || line.starts_with("INFO:");
        if !forward {
            debug!("device: {line}");
            return;
        }

        if self.last.as_deref() == Some(line) && self.last_seen.elapsed() < DEDUP_DEBOUNCE {
            self.repeats += 1;
            self.last_seen = Instant::now();
            return;
        }

        self.flush();
        if line.starts_with("ERROR:") {
            error!("device: {line}");
        } else {
            info!("device: {line}");
        }
        self.last = Some(line.to_owned());
        self.last_seen = Instant::now();
    }

    /// Emit the pending repeat summary, if any
    pub fn flush(&mut self) {
        if self.repeats > 0 {
            info!("device: last message repeated {} times", self.repeats);
            self.repeats = 0;
        }
    }
}
