// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use anyhow::{Result, bail};
use serial2::{self, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;

use crate::types::EdlReadWrite;

pub struct EdlSerialChannel {
    serport: SerialPort,
}

impl Write for EdlSerialChannel {
    fn write(&mut self, buf: &[u8]) -> Result<usize, std::io::Error> {
        self.serport.write(buf)
    }

    fn flush(&mut self) -> Result<(), std::io::Error> {
        self.serport.flush()
    }
}

impl Read for EdlSerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        self.serport.read(buf)
    }
}

impl EdlReadWrite for EdlSerialChannel {
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), std::io::Error> {
        self.serport.set_read_timeout(timeout)
    }

    fn set_write_timeout(&mut self, timeout: Duration) -> Result<(), std::io::Error> {
        self.serport.set_write_timeout(timeout)
    }
}

pub fn setup_serial_device(dev_path: Option<String>) -> Result<EdlSerialChannel> {
    let Some(path) = dev_path else {
        bail!("Serial port path unspecified");
    };

    let serport = SerialPort::open(path, |mut settings: serial2::Settings| {
        settings.set_raw();
        settings.set_baud_rate(115200)?;
        Ok(settings)
    })?;

    Ok(EdlSerialChannel { serport })
}
