// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

use anstream::println;
use indexmap::IndexMap;
use owo_colors::OwoColorize;

use crate::FirehoseResponse;
use crate::error::{EdlError, Result};
use crate::types::{EdlChan, FirehoseStatus};

// Parsers are kept separate for more flexibility (e.g. log replay analysis)

/// Check "value" for ack/nak (generic)
pub fn firehose_parser_ack_nak(attrs: &IndexMap<String, String>) -> Result<FirehoseStatus> {
    match attrs.get("value").map(|v| v.as_str()) {
        Some("ACK") | Some("true") => Ok(FirehoseStatus::Ack),
        Some("NAK") | Some("false") => Ok(FirehoseStatus::Nak),
        Some(other) => Err(EdlError::firehose(format!(
            "unexpected response value '{other}'"
        ))),
        None => Err(EdlError::firehose("response carries no value attribute")),
    }
}

/// Did the peer switch the channel into the raw data phase?
pub fn firehose_parser_rawmode(attrs: &IndexMap<String, String>) -> bool {
    attrs.get("rawmode").map(|v| v == "true").unwrap_or(false)
}

/// Parse the \<configure\> response and make sure the loader actually ran
/// its configure handler instead of just echoing logs at us.
///
/// A NAK hinting at the biggest buffer the device can take is adopted into
/// the session config and surfaced as [`FirehoseStatus::Nak`]; the session
/// only counts as configured once a re-sent \<configure\> comes back ACKed
/// (see [`crate::firehose_configure`]). A NAK without the hint is fatal.
pub fn firehose_parser_configure_response<T: EdlChan>(
    channel: &mut T,
    resp: &FirehoseResponse,
) -> Result<FirehoseStatus> {
    let status = firehose_parser_ack_nak(&resp.attrs)?;

    if status == FirehoseStatus::Nak {
        // The device can't handle that big of a buffer and tells us the max
        // it can; anything else is a hard failure
        let Some(val) = resp.attrs.get("MaxPayloadSizeToTargetInBytes") else {
            return Err(EdlError::firehose("configure NAKed"));
        };
        let max = val.parse::<usize>().map_err(|_| {
            EdlError::firehose(format!("bogus MaxPayloadSizeToTargetInBytes '{val}'"))
        })?;
        channel.mut_fh_config().send_buffer_size = max;
        println!(
            "Device limited the send buffer to {}kB",
            (max / 1024).bright_yellow()
        );
    }

    if !resp
        .logs
        .iter()
        .any(|l| l.contains("Calling handler for configure"))
    {
        return Err(EdlError::firehose("configure handler never ran"));
    }

    let expected = format!(
        "Storage type set to value {}",
        channel.fh_config().memory_name
    );
    if !resp.logs.iter().any(|l| l.contains(&expected)) {
        return Err(EdlError::firehose(format!(
            "loader didn't confirm the {} storage type",
            channel.fh_config().memory_name
        )));
    }

    Ok(status)
}
