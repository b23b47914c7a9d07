// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! The Sahara handshake the BootROM speaks before a Firehose loader runs.
//!
//! Sahara is a strictly request/response protocol of little-endian 32-bit
//! word frames. The BootROM drives it: the host mostly answers greetings and
//! serves the memory-read requests through which the chip pulls the
//! programmer binary into SRAM.

use std::io::ErrorKind;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::error::{EdlError, Result};
use crate::types::EdlChan;
use crate::{channel_write, contains_bytes, firehose_xml_setup, read_n};

pub const SAHARA_VERSION: u32 = 2;
pub const SAHARA_MIN_VERSION: u32 = 1;

/// Image ids below this belong to the pre-Firehose boot chain; EDL
/// programmer requests start here
pub const SAHARA_FIREHOSE_IMAGE_ID_MIN: u64 = 0x0C;

const HELLO_FRAME_LEN: u32 = 0x30;
const HELLO_READ_TIMEOUT: Duration = Duration::from_millis(500);
const PROBE_NOP_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const PROBE_NOP_READ_TIMEOUT: Duration = Duration::from_secs(2);
const PACKET_READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Serialize_repr, Deserialize_repr, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SaharaCmd {
    HelloReq = 0x01,
    HelloRsp = 0x02,
    ReadData = 0x03,
    EndOfImageTx = 0x04,
    Done = 0x05,
    DoneRsp = 0x06,
    Reset = 0x07,
    ResetRsp = 0x08,
    MemoryDebug = 0x09,
    MemoryRead = 0x0A,
    CmdReady = 0x0B,
    SwitchMode = 0x0C,
    Execute = 0x0D,
    ExecuteRsp = 0x0E,
    ExecuteData = 0x0F,
    MemoryDebug64 = 0x10,
    MemoryRead64 = 0x11,
    ReadData64 = 0x12,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SaharaMode {
    ImageTxPending = 0x0,
    ImageTxComplete = 0x1,
    MemoryDebug = 0x2,
    Command = 0x3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SaharaCmdModeCmd {
    Nop = 0x00,
    ReadSerialNum = 0x01,
    ReadMsmHwId = 0x02,
    ReadOemPkHash = 0x03,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct SaharaPacketHeader {
    pub cmd: u32,
    pub len: u32,
}

/// HELLO_REQ and HELLO_RSP share this 12-word layout
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct SaharaHello {
    pub cmd: u32,
    pub len: u32,
    pub version: u32,
    pub min_version: u32,
    pub max_cmd_len: u32,
    pub mode: u32,
    pub reserved: [u32; 6],
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct SaharaSwitchMode {
    pub cmd: u32,
    pub len: u32,
    pub mode: u32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct SaharaExecute {
    pub cmd: u32,
    pub len: u32,
    pub client_cmd: u32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct SaharaExecuteRsp {
    pub cmd: u32,
    pub len: u32,
    pub client_cmd: u32,
    pub data_len: u32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct SaharaReadData64 {
    pub cmd: u32,
    pub len: u32,
    pub image_id: u64,
    pub data_offset: u64,
    pub data_len: u64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct SaharaEndOfImageTx {
    pub cmd: u32,
    pub len: u32,
    pub image_id: u32,
    pub status: u32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct SaharaDoneRsp {
    pub cmd: u32,
    pub len: u32,
    pub status: u32,
}

fn sahara_send<T: EdlChan, P: Serialize>(channel: &mut T, pkt: &P) -> Result<()> {
    let buf = bincode::serialize(pkt)
        .map_err(|e| EdlError::sahara(format!("couldn't encode a packet: {e}")))?;
    channel_write(channel, &buf, true)
}

fn sahara_decode<P: DeserializeOwned>(buf: &[u8]) -> Result<P> {
    bincode::deserialize(buf).map_err(|e| EdlError::sahara(format!("malformed frame: {e}")))
}

/// Read one frame; an exceeded budget is a protocol failure here
fn sahara_read_packet<T: EdlChan>(channel: &mut T, timeout: Duration) -> Result<Vec<u8>> {
    channel.set_read_timeout(timeout)?;
    let mut buf = vec![0u8; 4096];
    match channel.read(&mut buf) {
        Ok(0) => Err(EdlError::Timeout(timeout.as_millis() as u64)),
        Ok(n) => {
            buf.truncate(n);
            Ok(buf)
        }
        Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
            Err(EdlError::Timeout(timeout.as_millis() as u64))
        }
        Err(e) => Err(e.into()),
    }
}

/// Read one frame, treating silence as "nothing to classify"
fn sahara_try_read<T: EdlChan>(channel: &mut T, timeout: Duration) -> Result<Vec<u8>> {
    match sahara_read_packet(channel, timeout) {
        Ok(buf) => Ok(buf),
        Err(EdlError::Timeout(_)) => Ok(vec![]),
        Err(e) => Err(e),
    }
}

pub fn sahara_send_hello_rsp<T: EdlChan>(channel: &mut T, mode: SaharaMode) -> Result<()> {
    let rsp = SaharaHello {
        cmd: SaharaCmd::HelloRsp as u32,
        len: HELLO_FRAME_LEN,
        version: SAHARA_VERSION,
        min_version: SAHARA_MIN_VERSION,
        max_cmd_len: 0,
        mode: mode as u32,
        reserved: [0; 6],
    };
    sahara_send(channel, &rsp)
}

/// What the remote end turned out to be speaking
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaharaProbe {
    /// The BootROM greeted us (or is still mid-transfer)
    Sahara,
    /// A Firehose loader is already up
    Firehose,
    /// Nothing sensible came back; the device needs a reboot
    Wedged,
}

fn sahara_classify(buf: &[u8]) -> Option<SaharaProbe> {
    if buf.is_empty() {
        return None;
    }
    if contains_bytes("<?xml", buf) {
        return Some(SaharaProbe::Firehose);
    }
    if buf[0] == SaharaCmd::HelloReq as u8 || buf[0] == SaharaCmd::EndOfImageTx as u8 {
        if let Ok(hdr) = sahara_decode::<SaharaPacketHeader>(buf) {
            if hdr.cmd == SaharaCmd::HelloReq as u32 || hdr.cmd == SaharaCmd::EndOfImageTx as u32 {
                return Some(SaharaProbe::Sahara);
            }
        }
    }
    None
}

/// Figure out which protocol the device is currently speaking. Quiet peers
/// get poked with a Firehose no-op; only a loader answers that.
pub fn sahara_probe<T: EdlChan>(channel: &mut T) -> Result<SaharaProbe> {
    let greeting = sahara_try_read(channel, HELLO_READ_TIMEOUT)?;
    if let Some(kind) = sahara_classify(&greeting) {
        return Ok(kind);
    }

    debug!("no greeting, poking the device with a nop");
    let nop = firehose_xml_setup("nop", &[])?;
    channel.set_write_timeout(PROBE_NOP_WRITE_TIMEOUT)?;
    channel_write(channel, &nop, true)?;

    let answer = sahara_try_read(channel, PROBE_NOP_READ_TIMEOUT)?;
    Ok(sahara_classify(&answer).unwrap_or(SaharaProbe::Wedged))
}

/// Run the command-mode exchange that yields the chip serial number.
/// Assumes the HELLO_REQ greeting was just consumed by a probe.
pub fn sahara_read_serial_number<T: EdlChan>(channel: &mut T) -> Result<String> {
    sahara_send_hello_rsp(channel, SaharaMode::Command)?;

    let pkt = sahara_read_packet(channel, PACKET_READ_TIMEOUT)?;
    let hdr: SaharaPacketHeader = sahara_decode(&pkt)?;
    if hdr.cmd != SaharaCmd::CmdReady as u32 {
        return Err(EdlError::sahara(format!(
            "expected CMD_READY, got 0x{:02x}",
            hdr.cmd
        )));
    }

    sahara_send(
        channel,
        &SaharaExecute {
            cmd: SaharaCmd::Execute as u32,
            len: 12,
            client_cmd: SaharaCmdModeCmd::ReadSerialNum as u32,
        },
    )?;

    let pkt = sahara_read_packet(channel, PACKET_READ_TIMEOUT)?;
    let rsp: SaharaExecuteRsp = sahara_decode(&pkt)?;
    if rsp.cmd != SaharaCmd::ExecuteRsp as u32
        || rsp.client_cmd != SaharaCmdModeCmd::ReadSerialNum as u32
    {
        return Err(EdlError::sahara("unexpected answer to the serial number read"));
    }

    sahara_send(
        channel,
        &SaharaExecute {
            cmd: SaharaCmd::ExecuteData as u32,
            len: 12,
            client_cmd: SaharaCmdModeCmd::ReadSerialNum as u32,
        },
    )?;

    let data = read_n(channel, rsp.data_len as usize, PACKET_READ_TIMEOUT)?;
    if data.len() < 4 {
        return Err(EdlError::sahara("serial number payload too short"));
    }
    let serial = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    Ok(format!("{serial:08x}"))
}

/// Slice `[offset, offset + len)` out of the programmer, zero-padding reads
/// past its end (the BootROM rounds requests up to its page size)
fn programmer_slice_padded(programmer: &[u8], offset: u64, len: u64) -> Vec<u8> {
    let off = offset as usize;
    let n = len as usize;
    let mut out = vec![0u8; n];
    if off < programmer.len() {
        let avail = (programmer.len() - off).min(n);
        out[..avail].copy_from_slice(&programmer[off..off + avail]);
    } else {
        warn!("read past the end of the programmer (offset {offset}), sending zeroes");
    }
    out
}

/// Serve the BootROM's pull of the programmer binary. On success the device
/// boots the programmer and comes back up speaking Firehose.
pub fn sahara_upload_loader<T: EdlChan>(channel: &mut T, programmer: &[u8]) -> Result<()> {
    if programmer.is_empty() {
        return Err(EdlError::Validation {
            field: "programmer",
            reason: "the loader binary is empty".to_owned(),
        });
    }

    // A mode switch makes the BootROM tear the transport down and greet
    // again from scratch
    sahara_send(
        channel,
        &SaharaSwitchMode {
            cmd: SaharaCmd::SwitchMode as u32,
            len: 12,
            mode: SaharaMode::Command as u32,
        },
    )?;
    match sahara_probe(channel)? {
        SaharaProbe::Sahara => {}
        // Someone already got the loader running
        SaharaProbe::Firehose => return Ok(()),
        SaharaProbe::Wedged => {
            return Err(EdlError::sahara(
                "device stopped responding after the mode switch",
            ));
        }
    }
    sahara_send_hello_rsp(channel, SaharaMode::ImageTxPending)?;

    let mut requests = 0u32;
    loop {
        let pkt = sahara_read_packet(channel, PACKET_READ_TIMEOUT)?;
        let hdr: SaharaPacketHeader = sahara_decode(&pkt)?;

        if hdr.cmd == SaharaCmd::ReadData64 as u32 {
            let req: SaharaReadData64 = sahara_decode(&pkt)?;
            if req.image_id < SAHARA_FIREHOSE_IMAGE_ID_MIN {
                return Err(EdlError::sahara(format!(
                    "device requested image 0x{:x}, which is not an EDL loader",
                    req.image_id
                )));
            }
            debug!(
                "serving {} bytes of the programmer at offset {}",
                req.data_len, req.data_offset
            );
            let chunk = programmer_slice_padded(programmer, req.data_offset, req.data_len);
            channel_write(channel, &chunk, true)?;
            requests += 1;
        } else if hdr.cmd == SaharaCmd::EndOfImageTx as u32 {
            let end: SaharaEndOfImageTx = sahara_decode(&pkt)?;
            if end.status != 0 {
                return Err(EdlError::sahara(format!(
                    "transfer ended with status 0x{:x}",
                    end.status
                )));
            }
            if requests == 0 {
                warn!("transfer ended without the device pulling any data");
            }

            sahara_send(
                channel,
                &SaharaPacketHeader {
                    cmd: SaharaCmd::Done as u32,
                    len: 8,
                },
            )?;
            let pkt = sahara_read_packet(channel, PACKET_READ_TIMEOUT)?;
            let done: SaharaDoneRsp = sahara_decode(&pkt)?;
            if done.cmd != SaharaCmd::DoneRsp as u32 {
                return Err(EdlError::sahara("no DONE_RSP after the image transfer"));
            }
            return Ok(());
        } else {
            return Err(EdlError::sahara(format!(
                "unexpected frame 0x{:02x} during the image transfer",
                hdr.cmd
            )));
        }
    }
}

/// Bail out of a half-completed handshake by resetting the target
pub fn sahara_reset<T: EdlChan>(channel: &mut T) -> Result<()> {
    sahara_send(
        channel,
        &SaharaPacketHeader {
            cmd: SaharaCmd::Reset as u32,
            len: 8,
        },
    )?;
    let pkt = sahara_read_packet(channel, PACKET_READ_TIMEOUT)?;
    let hdr: SaharaPacketHeader = sahara_decode(&pkt)?;
    if hdr.cmd != SaharaCmd::ResetRsp as u32 {
        return Err(EdlError::sahara("no RESET_RSP from the device"));
    }
    Ok(())
}
