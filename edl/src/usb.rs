// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use anyhow::{Context, Result, bail};
use nusb::{
    self, Device, DeviceInfo, MaybeFuture,
    io::{EndpointRead, EndpointWrite},
};
use std::{
    io::{Error, ErrorKind, Read, Write},
    time::Duration,
};

use crate::types::EdlReadWrite;

const USB_VID_QCOM: u16 = 0x05c6;
const USB_PID_EDL: u16 = 0x9008;
const INTF_DESC_PROTO_CODES: [u8; 3] = [0x10, 0x11, 0xFF];

pub struct EdlUsbChannel {
    _dev: nusb::Device,
    reader: EndpointRead<nusb::transfer::Bulk>,
    writer: EndpointWrite<nusb::transfer::Bulk>,
}

impl Write for EdlUsbChannel {
    fn write(&mut self, buf: &[u8]) -> Result<usize, std::io::Error> {
        // Ending the transfer after every write gives the short/zero-length
        // packet framing the loader's rawmode parser depends on
        let n = if buf.is_empty() {
            0
        } else {
            self.writer.write(buf)?
        };
        self.writer.submit_end();
        Ok(n)
    }

    fn flush(&mut self) -> Result<(), std::io::Error> {
        self.writer.flush()
    }
}

impl Read for EdlUsbChannel {
    fn read(&mut self, out: &mut [u8]) -> Result<usize, std::io::Error> {
        self.reader.read(out)
    }
}

impl EdlReadWrite for EdlUsbChannel {
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), std::io::Error> {
        self.reader.set_read_timeout(timeout);
        Ok(())
    }

    fn set_write_timeout(&mut self, timeout: Duration) -> Result<(), std::io::Error> {
        self.writer.set_write_timeout(timeout);
        Ok(())
    }
}

fn find_usb_handle_by_sn(
    devices: &mut dyn Iterator<Item = DeviceInfo>,
    serial_no: &str,
) -> Result<Device> {
    // EDL devices advertise the chip serial as an "_SN:xxxx" suffix of the
    // product string
    let mut dev = None;
    for d in devices {
        let matches = d
            .product_string()
            .and_then(|p| p.split_once("_SN:"))
            .is_some_and(|(_, sn)| sn.eq_ignore_ascii_case(serial_no));
        if matches {
            dev = Some(d);
            break;
        }
    }

    match dev {
        Some(d) => Ok(d.open().wait()?),
        None => bail!("Found no devices in EDL mode with serial number {serial_no}"),
    }
}

pub fn setup_usb_device(serial_no: Option<String>) -> Result<EdlUsbChannel> {
    let mut devices = nusb::list_devices()
        .wait()?
        .filter(|d| d.vendor_id() == USB_VID_QCOM && d.product_id() == USB_PID_EDL);

    let dev = match serial_no {
        Some(sn) => find_usb_handle_by_sn(&mut devices, &sn)?,
        None => {
            let Some(d) = devices.next() else {
                bail!("Found no devices in EDL mode")
            };
            d.open().wait()?
        }
    };

    let cfg_desc = dev.active_configuration()?;
    let intf_desc = cfg_desc
        .interface_alt_settings()
        .find(|d| {
            d.class() == 0xFF
                && d.subclass() == 0xFF
                && INTF_DESC_PROTO_CODES.contains(&d.protocol())
                && d.num_endpoints() >= 2
        })
        .ok_or::<anyhow::Error>(Error::from(ErrorKind::NotFound).into())?;

    let in_ep = intf_desc
        .endpoints()
        .find(|e| {
            e.direction() == nusb::transfer::Direction::In
                && e.transfer_type() == nusb::descriptors::TransferType::Bulk
        })
        .ok_or::<anyhow::Error>(Error::from(ErrorKind::NotFound).into())?
        .address();
    let out_ep = intf_desc
        .endpoints()
        .find(|e| {
            e.direction() == nusb::transfer::Direction::Out
                && e.transfer_type() == nusb::descriptors::TransferType::Bulk
        })
        .ok_or::<anyhow::Error>(Error::from(ErrorKind::NotFound).into())?
        .address();

    // Make sure we can actually poke at the device
    let intf = dev
        .detach_and_claim_interface(intf_desc.interface_number())
        .wait()
        .with_context(|| format!("Couldn't claim interface {}", intf_desc.interface_number()))?;

    let mut reader = intf.endpoint(in_ep)?.reader(1024 * 1024);
    let mut writer = intf.endpoint(out_ep)?.writer(1024 * 1024);

    reader.set_read_timeout(Duration::from_secs(10));
    writer.set_write_timeout(Duration::from_secs(10));

    Ok(EdlUsbChannel {
        _dev: dev,
        reader,
        writer,
    })
}
