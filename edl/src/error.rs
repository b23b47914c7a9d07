// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::fmt;

use thiserror::Error;

/// Which of the two chained wire protocols misbehaved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Sahara,
    Firehose,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Sahara => write!(f, "Sahara"),
            Protocol::Firehose => write!(f, "Firehose"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EdlError {
    /// The device never made it into a usable Firehose session
    #[error("couldn't reach the device: {0}")]
    Connection(String),

    /// A bulk transfer (or the host-side I/O feeding it) fell over
    #[error("transfer failed")]
    Usb(#[from] std::io::Error),

    /// The peer sent something the protocol state machine can't accept
    #[error("{protocol} protocol violation: {reason}")]
    Protocol { protocol: Protocol, reason: String },

    /// One of the per-call time budgets ran out
    #[error("no answer from the device within {0} ms")]
    Timeout(u64),

    #[error("flashing '{partition}' failed: {reason}")]
    Flash { partition: String, reason: String },

    #[error("bad GPT on LUN {lun}: {reason}")]
    Gpt { lun: u8, reason: String },

    #[error("malformed sparse image: {0}")]
    Sparse(String),

    /// The caller handed us something that never touches the wire
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },
}

impl EdlError {
    pub(crate) fn sahara(reason: impl Into<String>) -> Self {
        EdlError::Protocol {
            protocol: Protocol::Sahara,
            reason: reason.into(),
        }
    }

    pub(crate) fn firehose(reason: impl Into<String>) -> Self {
        EdlError::Protocol {
            protocol: Protocol::Firehose,
            reason: reason.into(),
        }
    }

    pub(crate) fn gpt(lun: u8, reason: impl Into<String>) -> Self {
        EdlError::Gpt {
            lun,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EdlError>;
