// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::collections::VecDeque;
use std::io::{Error, ErrorKind, Read, Write};
use std::time::Duration;

use crate::types::{DeviceMsgFilter, EdlChan, FirehoseConfiguration};

/// In-memory channel replaying a scripted sequence of device transfers.
/// Each entry is one "packet"; an exhausted script reads like a timeout.
pub(crate) struct ScriptedChannel {
    pub reads: VecDeque<Vec<u8>>,
    pub written: Vec<u8>,
    pub cfg: FirehoseConfiguration,
    pub filter: DeviceMsgFilter,
}

impl ScriptedChannel {
    pub fn new(reads: Vec<Vec<u8>>) -> Self {
        ScriptedChannel {
            reads: reads.into(),
            written: vec![],
            cfg: FirehoseConfiguration::default(),
            filter: DeviceMsgFilter::default(),
        }
    }
}

impl Read for ScriptedChannel {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let Some(mut packet) = self.reads.pop_front() else {
            return Err(Error::from(ErrorKind::TimedOut));
        };
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        if n < packet.len() {
            packet.drain(..n);
            self.reads.push_front(packet);
        }
        Ok(n)
    }
}

impl Write for ScriptedChannel {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl EdlChan for ScriptedChannel {
    fn fh_config(&self) -> &FirehoseConfiguration {
        &self.cfg
    }

    fn mut_fh_config(&mut self) -> &mut FirehoseConfiguration {
        &mut self.cfg
    }

    fn msg_filter(&mut self) -> &mut DeviceMsgFilter {
        &mut self.filter
    }

    fn set_read_timeout(&mut self, _timeout: Duration) -> std::io::Result<()> {
        Ok(())
    }

    fn set_write_timeout(&mut self, _timeout: Duration) -> std::io::Result<()> {
        Ok(())
    }
}
