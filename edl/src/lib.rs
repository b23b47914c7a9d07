// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Host-side driver for Qualcomm SoCs in Emergency Download (EDL) mode.
//!
//! The crate speaks the two chained EDL wire protocols: Sahara, which hands
//! the BootROM a signed Firehose programmer, and Firehose itself, an
//! XML-framed block I/O protocol addressing storage as (LUN, sector) pairs.
//! On top of those sit a GPT engine, an Android sparse-image decoder and the
//! orchestration flows in [`device`].

use std::io::ErrorKind;
use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, warn};
use xmltree::{Element, EmitterConfig, XMLNode};

pub mod device;
pub mod error;
pub mod gpt;
pub mod parsers;
pub mod sahara;
#[cfg(feature = "serial")]
pub mod serial;
pub mod sparse;
#[cfg(test)]
pub(crate) mod testutil;
pub mod types;
#[cfg(feature = "usb")]
pub mod usb;

pub use error::{EdlError, Protocol, Result};
use parsers::{firehose_parser_configure_response, firehose_parser_rawmode};
use types::{EdlBackend, EdlChan, EdlReadWrite, FirehoseResetMode, FirehoseStatus};

/// Biggest single bulk OUT transfer both the BootROM and the loaders accept
pub const USB_MAX_XFER_SIZE: usize = 16384;

/// Longest sector range a single `<erase>` (or its zero-fill fallback) may
/// cover; callers split anything bigger
pub const MAX_ERASE_RANGE_SECTORS: u64 = 512 * 1024;

const XML_READ_BUF_SIZE: usize = 4096;
const RESPONSE_POLL_TIMEOUT: Duration = Duration::from_millis(150);
const RESPONSE_RETRIES: u32 = 3;
const RAWMODE_READ_TIMEOUT: Duration = Duration::from_secs(2);
const XML_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const PROGRAM_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const PROGRESS_EVERY_N_CHUNKS: usize = 10;

/// Substring search over raw transfer buffers
pub fn contains_bytes(needle: &str, haystack: &[u8]) -> bool {
    let needle = needle.as_bytes();
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Wrap a single command element into the `<?xml?><data>` envelope the
/// loader expects, with attributes emitted in insertion order.
pub fn firehose_xml_setup(cmd: &str, args: &[(&str, &str)]) -> Result<Vec<u8>> {
    let mut elem = Element::new(cmd);
    for (k, v) in args {
        elem.attributes.insert((*k).to_owned(), (*v).to_owned());
    }

    let mut data = Element::new("data");
    data.children.push(XMLNode::Element(elem));

    let mut buf = Vec::new();
    data.write_with_config(
        &mut buf,
        EmitterConfig::new()
            .perform_indent(false)
            .write_document_declaration(true),
    )
    .map_err(|e| EdlError::firehose(format!("couldn't serialize the request: {e}")))?;
    Ok(buf)
}

/// The device happily concatenates several XML documents into one transfer
/// (logs first, then the response), which no parser accepts as-is. Split on
/// the declaration; anything before the first one is line noise.
fn split_xml_documents(buf: &[u8]) -> Vec<&[u8]> {
    const DECL: &[u8] = b"<?xml";

    let mut starts = vec![];
    let mut i = 0;
    while i + DECL.len() <= buf.len() {
        if &buf[i..i + DECL.len()] == DECL {
            starts.push(i);
            i += DECL.len();
        } else {
            i += 1;
        }
    }

    let mut docs = vec![];
    for (n, &start) in starts.iter().enumerate() {
        let end = starts.get(n + 1).copied().unwrap_or(buf.len());
        docs.push(&buf[start..end]);
    }
    docs
}

fn parse_xml_documents(buf: &[u8]) -> Vec<Element> {
    split_xml_documents(buf)
        .into_iter()
        .filter_map(|doc| match Element::parse(doc) {
            Ok(e) => Some(e),
            Err(e) => {
                debug!("skipping an unparsable XML fragment: {e}");
                None
            }
        })
        .collect()
}

/// Flatten the attributes of every `<response>` element, later wins
pub fn firehose_response_attrs(buf: &[u8]) -> IndexMap<String, String> {
    let mut attrs = IndexMap::new();
    for doc in parse_xml_documents(buf) {
        for node in &doc.children {
            if let XMLNode::Element(e) = node {
                if e.name.eq_ignore_ascii_case("response") {
                    for (k, v) in &e.attributes {
                        attrs.insert(k.clone(), v.clone());
                    }
                }
            }
        }
    }
    attrs
}

/// Collect the `value` strings of every `<log>` element, in order
pub fn firehose_log_values(buf: &[u8]) -> Vec<String> {
    let mut logs = vec![];
    for doc in parse_xml_documents(buf) {
        for node in &doc.children {
            if let XMLNode::Element(e) = node {
                if e.name.eq_ignore_ascii_case("log") {
                    if let Some(v) = e.attributes.get("value") {
                        logs.push(v.clone());
                    }
                }
            }
        }
    }
    logs
}

/// Push bytes down the pipe in transfer-sized chunks. `wait == false`
/// fire-and-forgets the tail, for peers that never acknowledge it.
pub(crate) fn channel_write<T: EdlChan>(channel: &mut T, buf: &[u8], wait: bool) -> Result<()> {
    for chunk in buf.chunks(USB_MAX_XFER_SIZE) {
        channel.write_all(chunk)?;
    }
    if wait {
        channel.flush()?;
    }
    Ok(())
}

/// Terminate a rawmode chunk; the loader sits on the payload until it sees
/// a short or zero-length packet.
pub(crate) fn channel_write_zlp<T: EdlChan>(channel: &mut T) -> Result<()> {
    channel.write(&[])?;
    Ok(())
}

/// Aggregate reads until exactly `n` bytes arrived
pub(crate) fn read_n<T: EdlChan>(channel: &mut T, n: usize, timeout: Duration) -> Result<Vec<u8>> {
    channel.set_read_timeout(timeout)?;
    let mut buf = vec![0u8; n];
    let mut off = 0;
    while off < n {
        match channel.read(&mut buf[off..]) {
            Ok(0) => return Err(EdlError::Timeout(timeout.as_millis() as u64)),
            Ok(m) => off += m,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                return Err(EdlError::Timeout(timeout.as_millis() as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(buf)
}

/// Poll for a command response, tolerating slow loaders: each empty poll
/// burns one retry, anything read is accumulated until `<response` shows up.
pub fn firehose_wait_for_data<T: EdlChan>(channel: &mut T, retries: u32) -> Result<Vec<u8>> {
    channel.set_read_timeout(RESPONSE_POLL_TIMEOUT)?;
    let mut acc: Vec<u8> = vec![];
    let mut buf = vec![0u8; XML_READ_BUF_SIZE];
    let mut budget = retries;
    while budget > 0 && !contains_bytes("<response", &acc) {
        match channel.read(&mut buf) {
            Ok(0) => budget -= 1,
            Ok(n) => acc.extend_from_slice(&buf[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                budget -= 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(acc)
}

/// One parsed Firehose exchange
#[derive(Debug)]
pub struct FirehoseResponse {
    pub ok: bool,
    pub attrs: IndexMap<String, String>,
    pub logs: Vec<String>,
}

pub(crate) fn parse_firehose_response<T: EdlChan>(channel: &mut T, raw: &[u8]) -> FirehoseResponse {
    debug!("firehose <-- {}", String::from_utf8_lossy(raw));
    let attrs = firehose_response_attrs(raw);

    // A missing value attribute is a log-only transfer, not a NAK
    let ok = match attrs.get("value") {
        None => true,
        Some(v) => v == "ACK" || v == "true",
    };

    let mut logs = vec![];
    if attrs.get("rawmode").map(|v| v == "true") != Some(true) {
        logs = firehose_log_values(raw);
        for line in &logs {
            channel.msg_filter().push(line);
        }
        channel.msg_filter().flush();
    }

    FirehoseResponse { ok, attrs, logs }
}

pub fn firehose_xml_send<T: EdlChan>(
    channel: &mut T,
    cmd: &str,
    args: &[(&str, &str)],
    wait: bool,
) -> Result<FirehoseResponse> {
    let req = firehose_xml_setup(cmd, args)?;
    let limit = channel.fh_config().xml_buf_size;
    if req.len() > limit {
        return Err(EdlError::Validation {
            field: "request",
            reason: format!("{} byte XML exceeds the {} byte limit", req.len(), limit),
        });
    }

    debug!("firehose --> {}", String::from_utf8_lossy(&req));
    channel.set_write_timeout(XML_WRITE_TIMEOUT)?;
    channel_write(channel, &req, wait)?;

    let raw = firehose_wait_for_data(channel, RESPONSE_RETRIES)?;
    Ok(parse_firehose_response(channel, &raw))
}

/// One `<configure>` exchange: send the host capabilities and gather the
/// complete response
fn firehose_configure_once<T: EdlChan>(channel: &mut T) -> Result<FirehoseResponse> {
    let cfg = channel.fh_config().clone();
    if cfg.sector_size == 0 || cfg.send_buffer_size % cfg.sector_size != 0 {
        return Err(EdlError::Validation {
            field: "MaxPayloadSizeToTargetInBytes",
            reason: "must be a nonzero multiple of the sector size".to_owned(),
        });
    }

    let memory = cfg.memory_name.to_string();
    let payload_size = cfg.send_buffer_size.to_string();
    let xml_size = cfg.xml_buf_size.to_string();
    let args = [
        ("MemoryName", memory.as_str()),
        ("ZLPAwareHost", if cfg.zlp_aware_host { "1" } else { "0" }),
        ("SkipStorageInit", if cfg.skip_storage_init { "1" } else { "0" }),
        ("SkipWrite", if cfg.skip_write { "1" } else { "0" }),
        ("MaxPayloadSizeToTargetInBytes", payload_size.as_str()),
        ("MaxXMLSizeInBytes", xml_size.as_str()),
    ];

    // The loader acts on <configure> without acknowledging the transfer
    // itself, so don't wait on the write
    let mut resp = firehose_xml_send(channel, "configure", &args, false)?;

    // Some builds push their log backlog first and the actual response in a
    // separate transfer; it's the one echoing MemoryName back
    if !resp.attrs.contains_key("MemoryName") {
        let raw = firehose_wait_for_data(channel, RESPONSE_RETRIES)?;
        let second = parse_firehose_response(channel, &raw);
        for (k, v) in second.attrs {
            resp.attrs.insert(k, v);
        }
        resp.logs.extend(second.logs);
        resp.ok = match resp.attrs.get("value") {
            None => true,
            Some(v) => v == "ACK" || v == "true",
        };
    }

    Ok(resp)
}

/// Send the host capabilities and verify the loader actually picked them
/// up. A NAK carrying the device's buffer limit gets one retry at that
/// size; the session is only configured once a `<configure>` comes back
/// ACKed with the handler logs in place.
pub fn firehose_configure<T: EdlChan>(channel: &mut T) -> Result<()> {
    let resp = firehose_configure_once(channel)?;
    if firehose_parser_configure_response(channel, &resp)? == FirehoseStatus::Nak {
        // The parser adopted the hinted send-buffer size; re-send and
        // require the retry to stick
        let resp = firehose_configure_once(channel)?;
        if firehose_parser_configure_response(channel, &resp)? != FirehoseStatus::Ack {
            return Err(EdlError::firehose(
                "configure still NAKed after adopting the device's buffer size",
            ));
        }
    }

    let luns = (0..channel.fh_config().max_lun).collect();
    channel.mut_fh_config().luns = luns;
    Ok(())
}

/// Read `num_sectors` starting at `start_sector` into `out`
pub fn firehose_read_storage<T: EdlChan>(
    channel: &mut T,
    out: &mut impl std::io::Write,
    num_sectors: usize,
    lun: u8,
    start_sector: u64,
) -> Result<()> {
    let sector_size = channel.fh_config().sector_size;
    let sector_size_str = sector_size.to_string();
    let num_str = num_sectors.to_string();
    let lun_str = lun.to_string();
    let start_str = start_sector.to_string();
    let args = [
        ("SECTOR_SIZE_IN_BYTES", sector_size_str.as_str()),
        ("num_partition_sectors", num_str.as_str()),
        ("physical_partition_number", lun_str.as_str()),
        ("start_sector", start_str.as_str()),
    ];

    let resp = firehose_xml_send(channel, "read", &args, true)?;
    if !resp.ok {
        return Err(EdlError::firehose(format!(
            "read of sectors {start_sector}+{num_sectors} on LUN {lun} NAKed"
        )));
    }
    if !firehose_parser_rawmode(&resp.attrs) {
        return Err(EdlError::firehose(
            "device didn't enter rawmode for the read data phase",
        ));
    }

    let mut remaining = num_sectors * sector_size;
    let chunk_size = channel.fh_config().send_buffer_size;
    while remaining > 0 {
        let n = remaining.min(chunk_size);
        let buf = read_n(channel, n, RAWMODE_READ_TIMEOUT)?;
        out.write_all(&buf)?;
        remaining -= n;
    }

    // rawmode data is closed out by a second response
    let raw = firehose_wait_for_data(channel, RESPONSE_RETRIES)?;
    let done = parse_firehose_response(channel, &raw);
    if !done.ok {
        return Err(EdlError::firehose("missing ACK after the rawmode read"));
    }
    Ok(())
}

/// Stream `blob` into storage at `(lun, start_sector)`. The final chunk is
/// zero-padded up to a sector boundary; every chunk is closed with a ZLP.
pub fn firehose_program_storage<T: EdlChan>(
    channel: &mut T,
    blob: &[u8],
    label: &str,
    lun: u8,
    start_sector: u64,
    mut on_progress: Option<&mut dyn FnMut(usize)>,
) -> Result<()> {
    let sector_size = channel.fh_config().sector_size;
    let chunk_size = channel.fh_config().send_buffer_size;
    let num_sectors = blob.len().div_ceil(sector_size);
    if num_sectors == 0 {
        return Ok(());
    }

    let sector_size_str = sector_size.to_string();
    let num_str = num_sectors.to_string();
    let lun_str = lun.to_string();
    let start_str = start_sector.to_string();
    let args = [
        ("SECTOR_SIZE_IN_BYTES", sector_size_str.as_str()),
        ("num_partition_sectors", num_str.as_str()),
        ("physical_partition_number", lun_str.as_str()),
        ("start_sector", start_str.as_str()),
    ];

    let resp = firehose_xml_send(channel, "program", &args, true)?;
    if !resp.ok {
        return Err(EdlError::Flash {
            partition: label.to_owned(),
            reason: format!("program request for sector {start_sector} NAKed"),
        });
    }

    channel.set_write_timeout(PROGRAM_WRITE_TIMEOUT)?;
    let mut written = 0;
    for (i, chunk) in blob.chunks(chunk_size).enumerate() {
        let mut tail;
        let chunk = if chunk.len() % sector_size != 0 {
            tail = chunk.to_vec();
            tail.resize(chunk.len().next_multiple_of(sector_size), 0);
            &tail[..]
        } else {
            chunk
        };

        channel_write(channel, chunk, true)?;
        channel_write_zlp(channel)?;

        written += chunk.len();
        if (i + 1) % PROGRESS_EVERY_N_CHUNKS == 0 {
            if let Some(ref mut cb) = on_progress {
                cb(written.min(blob.len()));
            }
        }
    }

    let raw = firehose_wait_for_data(channel, RESPONSE_RETRIES)?;
    let done = parse_firehose_response(channel, &raw);
    if !done.ok {
        return Err(EdlError::Flash {
            partition: label.to_owned(),
            reason: format!("device NAKed the payload at sector {start_sector}"),
        });
    }

    if let Some(ref mut cb) = on_progress {
        cb(blob.len());
    }
    Ok(())
}

/// Erase a sector range, preferring the loader's `<erase>` handler and
/// falling back to zero-filling through `<program>` for builds without one
pub fn firehose_erase_storage<T: EdlChan>(
    channel: &mut T,
    lun: u8,
    start_sector: u64,
    num_sectors: u64,
) -> Result<()> {
    if num_sectors == 0 {
        return Ok(());
    }
    if num_sectors > MAX_ERASE_RANGE_SECTORS {
        return Err(EdlError::Validation {
            field: "num_sectors",
            reason: format!("erase ranges are capped at {MAX_ERASE_RANGE_SECTORS} sectors"),
        });
    }

    let sector_size = channel.fh_config().sector_size;
    let sector_size_str = sector_size.to_string();
    let num_str = num_sectors.to_string();
    let lun_str = lun.to_string();
    let start_str = start_sector.to_string();
    let args = [
        ("SECTOR_SIZE_IN_BYTES", sector_size_str.as_str()),
        ("num_partition_sectors", num_str.as_str()),
        ("physical_partition_number", lun_str.as_str()),
        ("start_sector", start_str.as_str()),
    ];

    if channel.fh_config().fast_erase {
        let resp = firehose_xml_send(channel, "erase", &args, true)?;
        if resp.ok {
            return Ok(());
        }
        warn!("<erase> NAKed by the loader, falling back to zero-fill");
    }

    let resp = firehose_xml_send(channel, "program", &args, true)?;
    if !resp.ok {
        return Err(EdlError::firehose(format!(
            "zero-fill program request for sectors {start_sector}+{num_sectors} NAKed"
        )));
    }

    channel.set_write_timeout(PROGRAM_WRITE_TIMEOUT)?;
    let chunk_size = channel.fh_config().send_buffer_size;
    let zeroes = vec![0u8; chunk_size];
    let mut remaining = num_sectors as usize * sector_size;
    while remaining > 0 {
        let n = remaining.min(chunk_size);
        channel_write(channel, &zeroes[..n], true)?;
        channel_write_zlp(channel)?;
        remaining -= n;
    }

    let raw = firehose_wait_for_data(channel, RESPONSE_RETRIES)?;
    let done = parse_firehose_response(channel, &raw);
    if !done.ok {
        return Err(EdlError::firehose("device NAKed the zero-fill payload"));
    }
    Ok(())
}

/// Mark a physical partition (e.g. a boot LUN) as bootable
pub fn firehose_set_bootable<T: EdlChan>(channel: &mut T, lun: u8) -> Result<()> {
    let lun_str = lun.to_string();
    let resp = firehose_xml_send(channel, "setbootablestoragedrive", &[("value", lun_str.as_str())], true)?;
    if !resp.ok {
        return Err(EdlError::firehose(format!(
            "couldn't mark physical partition {lun} as bootable"
        )));
    }
    Ok(())
}

/// Returns the raw log lines; the interesting one carries a JSON
/// `storage_info` object behind an `INFO: ` prefix
pub fn firehose_get_storage_info<T: EdlChan>(channel: &mut T, lun: u8) -> Result<Vec<String>> {
    let lun_str = lun.to_string();
    let resp = firehose_xml_send(
        channel,
        "getstorageinfo",
        &[("physical_partition_number", lun_str.as_str())],
        true,
    )?;
    if !resp.ok {
        return Err(EdlError::firehose(format!(
            "getstorageinfo NAKed for LUN {lun}"
        )));
    }
    Ok(resp.logs)
}

/// Ask the loader to rewrite a freshly flashed GPT so it covers the whole
/// physical partition
pub fn firehose_fix_gpt<T: EdlChan>(channel: &mut T, lun: u8) -> Result<()> {
    let lun_str = lun.to_string();
    let args = [
        ("physical_partition_number", lun_str.as_str()),
        ("GrowLastPartition", "1"),
    ];
    let resp = firehose_xml_send(channel, "fixgpt", &args, true)?;
    if !resp.ok {
        return Err(EdlError::firehose(format!("fixgpt NAKed for LUN {lun}")));
    }
    Ok(())
}

pub fn firehose_nop<T: EdlChan>(channel: &mut T) -> Result<()> {
    let resp = firehose_xml_send(channel, "nop", &[], true)?;
    if !resp.ok {
        return Err(EdlError::firehose("even the nop got NAKed"));
    }
    Ok(())
}

pub fn firehose_reset<T: EdlChan>(
    channel: &mut T,
    mode: &FirehoseResetMode,
    delay_secs: u32,
) -> Result<()> {
    let delay_str = delay_secs.to_string();
    let args = [
        ("value", mode.power_value()),
        ("DelayInSeconds", delay_str.as_str()),
    ];
    let resp = firehose_xml_send(channel, "power", &args, true)?;
    if !resp.ok {
        return Err(EdlError::firehose(format!(
            "device refused to power-cycle into {mode}"
        )));
    }
    Ok(())
}

/// Open the byte pipe for the selected backend
#[allow(unused_variables)]
pub fn setup_target_device(
    backend: EdlBackend,
    serial_no: Option<String>,
    dev_path: Option<String>,
) -> anyhow::Result<Box<dyn EdlReadWrite>> {
    match backend {
        EdlBackend::Usb => {
            #[cfg(feature = "usb")]
            {
                Ok(Box::new(usb::setup_usb_device(serial_no)?))
            }
            #[cfg(not(feature = "usb"))]
            anyhow::bail!("This build carries no USB support")
        }
        EdlBackend::Serial => {
            #[cfg(feature = "serial")]
            {
                Ok(Box::new(serial::setup_serial_device(dev_path)?))
            }
            #[cfg(not(feature = "serial"))]
            anyhow::bail!("This build carries no serial support")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedChannel;

    #[test]
    fn contains_bytes_finds_inner_match() {
        assert!(contains_bytes("EFI PART", "GPT EFI PART12".as_bytes()));
        assert!(!contains_bytes("a", "".as_bytes()));
    }

    #[test]
    fn xml_setup_wraps_command_in_data_envelope() {
        let buf = firehose_xml_setup("configure", &[("MemoryName", "UFS"), ("ZLPAwareHost", "1")])
            .unwrap();
        let s = String::from_utf8(buf).unwrap();
        assert!(s.starts_with("<?xml"));
        assert!(s.contains("<data>"));
        assert!(s.contains(r#"MemoryName="UFS""#));
        assert!(s.contains(r#"ZLPAwareHost="1""#));
        // attribute order is load-bearing for some loader builds
        assert!(s.find("MemoryName").unwrap() < s.find("ZLPAwareHost").unwrap());
    }

    #[test]
    fn response_attrs_merge_later_wins() {
        let docs = concat!(
            r#"<?xml version="1.0" ?><data><response value="NAK" rawmode="false" /></data>"#,
            r#"<?xml version="1.0" ?><data><response value="ACK" MemoryName="eMMC" /></data>"#,
        );
        let attrs = firehose_response_attrs(docs.as_bytes());
        assert_eq!(attrs.get("value").unwrap(), "ACK");
        assert_eq!(attrs.get("MemoryName").unwrap(), "eMMC");
        assert_eq!(attrs.get("rawmode").unwrap(), "false");
    }

    #[test]
    fn single_response_document_parses() {
        let doc = r#"<?xml version="1.0" ?><data><response value="ACK" MemoryName="eMMC"/></data>"#;
        let attrs = firehose_response_attrs(doc.as_bytes());
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs.get("value").unwrap(), "ACK");
        assert_eq!(attrs.get("MemoryName").unwrap(), "eMMC");
    }

    #[test]
    fn log_stream_keeps_order_across_documents() {
        let mut buf = Vec::new();
        for i in 0..18 {
            buf.extend_from_slice(
                format!(r#"<?xml version="1.0" ?><data><log value="line {i}" /></data>"#)
                    .as_bytes(),
            );
        }
        buf.extend_from_slice(
            br#"<?xml version="1.0" ?><data><response value="ACK" rawmode="false" /></data>"#,
        );

        let logs = firehose_log_values(&buf);
        assert_eq!(logs.len(), 18);
        assert_eq!(logs[0], "line 0");
        assert_eq!(logs[17], "line 17");

        let attrs = firehose_response_attrs(&buf);
        assert_eq!(attrs.get("value").unwrap(), "ACK");
    }

    #[test]
    fn noise_before_first_document_is_ignored() {
        let mut buf = vec![0xffu8, 0x00, 0x13];
        buf.extend_from_slice(br#"<?xml version="1.0" ?><data><response value="ACK" /></data>"#);
        assert_eq!(firehose_response_attrs(&buf).get("value").unwrap(), "ACK");
    }

    #[test]
    fn wait_for_data_gives_up_after_empty_reads() {
        let mut chan = ScriptedChannel::new(vec![]);
        let buf = firehose_wait_for_data(&mut chan, 3).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn wait_for_data_stops_on_response() {
        let mut chan = ScriptedChannel::new(vec![
            br#"<?xml version="1.0" ?><data><log value="INFO: hi" /></data>"#.to_vec(),
            br#"<?xml version="1.0" ?><data><response value="ACK" /></data>"#.to_vec(),
        ]);
        let buf = firehose_wait_for_data(&mut chan, 3).unwrap();
        assert!(contains_bytes("<response", &buf));
    }

    #[test]
    fn oversized_xml_is_rejected_before_hitting_the_wire() {
        let mut chan = ScriptedChannel::new(vec![]);
        let big = "x".repeat(8192);
        let err = firehose_xml_send(&mut chan, "program", &[("label", big.as_str())], true)
            .unwrap_err();
        assert!(matches!(err, EdlError::Validation { .. }));
        assert!(chan.written.is_empty());
    }

    fn configure_response(value: &str, extra_attrs: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(
            br#"<?xml version="1.0" ?><data><log value="INFO: Calling handler for configure" /></data>"#,
        );
        buf.extend_from_slice(
            br#"<?xml version="1.0" ?><data><log value="INFO: Storage type set to value UFS" /></data>"#,
        );
        buf.extend_from_slice(
            format!(
                r#"<?xml version="1.0" ?><data><response value="{value}" MemoryName="UFS" {extra_attrs}/></data>"#
            )
            .as_bytes(),
        );
        buf
    }

    fn count_occurrences(haystack: &[u8], needle: &str) -> usize {
        haystack
            .windows(needle.len())
            .filter(|w| *w == needle.as_bytes())
            .count()
    }

    #[test]
    fn configure_happy_path_populates_luns() {
        let mut chan = ScriptedChannel::new(vec![configure_response("ACK", "")]);
        firehose_configure(&mut chan).unwrap();
        assert_eq!(chan.cfg.luns, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(count_occurrences(&chan.written, "<configure"), 1);
    }

    #[test]
    fn configure_resends_at_the_hinted_buffer_size_and_needs_an_ack() {
        let mut chan = ScriptedChannel::new(vec![
            configure_response("NAK", r#"MaxPayloadSizeToTargetInBytes="131072" "#),
            configure_response("ACK", ""),
        ]);
        firehose_configure(&mut chan).unwrap();

        assert_eq!(chan.cfg.send_buffer_size, 131072);
        assert_eq!(chan.cfg.luns, vec![0, 1, 2, 3, 4, 5]);
        // the retry must go out carrying the adopted size
        assert_eq!(count_occurrences(&chan.written, "<configure"), 2);
        assert!(contains_bytes(
            r#"MaxPayloadSizeToTargetInBytes="131072""#,
            &chan.written
        ));
    }

    #[test]
    fn configure_fails_if_the_retry_naks_again() {
        let mut chan = ScriptedChannel::new(vec![
            configure_response("NAK", r#"MaxPayloadSizeToTargetInBytes="131072" "#),
            configure_response("NAK", r#"MaxPayloadSizeToTargetInBytes="65536" "#),
        ]);
        let err = firehose_configure(&mut chan).unwrap_err();
        assert!(matches!(err, EdlError::Protocol { .. }));
        assert!(chan.cfg.luns.is_empty());
    }

    #[test]
    fn read_storage_round_trips_rawmode() {
        let payload = vec![0xa5u8; 8192];
        let mut chan = ScriptedChannel::new(vec![
            br#"<?xml version="1.0" ?><data><response value="ACK" rawmode="true" /></data>"#
                .to_vec(),
            payload.clone(),
            br#"<?xml version="1.0" ?><data><response value="ACK" rawmode="false" /></data>"#
                .to_vec(),
        ]);
        chan.cfg.sector_size = 4096;

        let mut out = Vec::new();
        firehose_read_storage(&mut chan, &mut out, 2, 0, 16).unwrap();
        assert_eq!(out, payload);
        assert!(contains_bytes("start_sector=\"16\"", &chan.written));
    }

    #[test]
    fn program_pads_the_tail_to_a_sector_boundary() {
        let mut chan = ScriptedChannel::new(vec![
            br#"<?xml version="1.0" ?><data><response value="ACK" rawmode="true" /></data>"#
                .to_vec(),
            br#"<?xml version="1.0" ?><data><response value="ACK" /></data>"#.to_vec(),
        ]);
        chan.cfg.sector_size = 4096;

        let blob = vec![0x11u8; 5000];
        firehose_program_storage(&mut chan, &blob, "test", 0, 0, None).unwrap();

        // request XML + 8192 padded payload bytes
        let payload_start = chan.written.len() - 8192;
        let payload = &chan.written[payload_start..];
        assert_eq!(&payload[..5000], &blob[..]);
        assert!(payload[5000..].iter().all(|&b| b == 0));
        assert!(contains_bytes("num_partition_sectors=\"2\"", &chan.written));
    }

    #[test]
    fn erase_falls_back_to_zero_fill_on_nak() {
        let mut chan = ScriptedChannel::new(vec![
            br#"<?xml version="1.0" ?><data><response value="NAK" /></data>"#.to_vec(),
            br#"<?xml version="1.0" ?><data><response value="ACK" rawmode="true" /></data>"#
                .to_vec(),
            br#"<?xml version="1.0" ?><data><response value="ACK" /></data>"#.to_vec(),
        ]);
        chan.cfg.sector_size = 4096;

        firehose_erase_storage(&mut chan, 0, 8, 2).unwrap();
        // the fallback streams 2 sectors of zeroes
        let payload_start = chan.written.len() - 8192;
        assert!(chan.written[payload_start..].iter().all(|&b| b == 0));
    }
}
