// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Streaming decoder for the Android sparse-image container.
//!
//! A sparse image is a run-length encoding of a disk image: literal Raw
//! runs, 4-byte Fill patterns, Skip holes and advisory Crc32 chunks. The
//! decoder never materializes the whole image; [`Sparse::read`] hands the
//! flasher one `(offset, data-or-hole, size)` run at a time.

use std::borrow::Cow;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{EdlError, Result};

pub const SPARSE_HEADER_MAGIC: u32 = 0xED26_FF3A;
pub const SPARSE_MAJOR_VERSION: u16 = 1;
pub const SPARSE_FILE_HEADER_SIZE: usize = 28;
pub const SPARSE_CHUNK_HEADER_SIZE: usize = 12;

const CHUNK_TYPE_RAW: u16 = 0xCAC1;
const CHUNK_TYPE_FILL: u16 = 0xCAC2;
const CHUNK_TYPE_SKIP: u16 = 0xCAC3;
const CHUNK_TYPE_CRC32: u16 = 0xCAC4;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SparseHeader {
    pub magic: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub file_hdr_sz: u16,
    pub chunk_hdr_sz: u16,
    pub blk_sz: u32,
    pub total_blks: u32,
    pub total_chunks: u32,
    pub image_checksum: u32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_type: u16,
    pub reserved: u16,
    pub chunk_sz: u32,
    pub total_sz: u32,
}

/// A non-owning view over a sparse blob
pub struct Sparse<'a> {
    pub header: SparseHeader,
    blob: &'a [u8],
}

impl<'a> Sparse<'a> {
    /// `Ok(None)` means "not a sparse image, flash it as-is"; an actual
    /// sparse image with a broken structure is an error.
    pub fn from(blob: &'a [u8]) -> Result<Option<Sparse<'a>>> {
        if blob.len() < SPARSE_FILE_HEADER_SIZE {
            return Ok(None);
        }
        let header: SparseHeader = bincode::deserialize(&blob[..SPARSE_FILE_HEADER_SIZE])
            .map_err(|e| EdlError::Sparse(format!("undecodable file header: {e}")))?;
        if header.magic != SPARSE_HEADER_MAGIC {
            return Ok(None);
        }

        if header.major_version != SPARSE_MAJOR_VERSION {
            return Err(EdlError::Sparse(format!(
                "unsupported version {}.{}",
                header.major_version, header.minor_version
            )));
        }
        if (header.file_hdr_sz as usize) < SPARSE_FILE_HEADER_SIZE {
            return Err(EdlError::Sparse(format!(
                "file header claims {} bytes",
                header.file_hdr_sz
            )));
        }
        if (header.chunk_hdr_sz as usize) < SPARSE_CHUNK_HEADER_SIZE {
            return Err(EdlError::Sparse(format!(
                "chunk header claims {} bytes",
                header.chunk_hdr_sz
            )));
        }
        if header.blk_sz == 0 || header.blk_sz % 4 != 0 {
            return Err(EdlError::Sparse(format!(
                "bogus block size {}",
                header.blk_sz
            )));
        }

        Ok(Some(Sparse { header, blob }))
    }

    /// Iterate the raw chunks in file order
    pub fn chunks(&self) -> Chunks<'a> {
        Chunks {
            header: self.header,
            blob: self.blob,
            pos: self.header.file_hdr_sz as usize,
            index: 0,
            done: false,
        }
    }

    /// Iterate the expanded runs: cumulative block-aligned offsets, with
    /// holes for Skip chunks and zero Fill patterns
    pub fn read(&self) -> Runs<'a> {
        Runs {
            chunks: self.chunks(),
            blk_sz: self.header.blk_sz as u64,
            offset: 0,
        }
    }
}

pub struct SparseChunk<'a> {
    pub header: ChunkHeader,
    pub payload: &'a [u8],
}

pub struct Chunks<'a> {
    header: SparseHeader,
    blob: &'a [u8],
    pos: usize,
    index: u32,
    done: bool,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Result<SparseChunk<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.index >= self.header.total_chunks {
            self.done = true;
            if self.pos < self.blob.len() {
                warn!(
                    "{} trailing bytes after the last sparse chunk",
                    self.blob.len() - self.pos
                );
            }
            return None;
        }

        let hdr_sz = self.header.chunk_hdr_sz as usize;
        if self.pos + hdr_sz > self.blob.len() {
            self.done = true;
            return Some(Err(EdlError::Sparse(format!(
                "chunk {} header runs past the image",
                self.index
            ))));
        }

        let header: ChunkHeader =
            match bincode::deserialize(&self.blob[self.pos..self.pos + hdr_sz]) {
                Ok(h) => h,
                Err(e) => {
                    self.done = true;
                    return Some(Err(EdlError::Sparse(format!(
                        "undecodable chunk header: {e}"
                    ))));
                }
            };

        let total_sz = header.total_sz as usize;
        if total_sz < hdr_sz || self.pos + total_sz > self.blob.len() {
            self.done = true;
            return Some(Err(EdlError::Sparse(format!(
                "chunk {} claims {} bytes and overruns the image",
                self.index, total_sz
            ))));
        }

        let payload = &self.blob[self.pos + hdr_sz..self.pos + total_sz];
        self.pos += total_sz;
        self.index += 1;
        Some(Ok(SparseChunk { header, payload }))
    }
}

/// One expanded run. `data == None` is a hole the flasher may skip as long
/// as the underlying range is known to be erased.
pub struct SparseRun<'a> {
    pub offset: u64,
    pub data: Option<Cow<'a, [u8]>>,
    pub size: u64,
}

pub struct Runs<'a> {
    chunks: Chunks<'a>,
    blk_sz: u64,
    offset: u64,
}

impl<'a> Iterator for Runs<'a> {
    type Item = Result<SparseRun<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let chunk = match self.chunks.next()? {
                Ok(c) => c,
                Err(e) => return Some(Err(e)),
            };

            let size = chunk.header.chunk_sz as u64 * self.blk_sz;
            let offset = self.offset;

            match chunk.header.chunk_type {
                CHUNK_TYPE_RAW => {
                    if chunk.payload.len() as u64 != size {
                        return Some(Err(EdlError::Sparse(format!(
                            "raw chunk carries {} bytes instead of {size}",
                            chunk.payload.len()
                        ))));
                    }
                    self.offset += size;
                    return Some(Ok(SparseRun {
                        offset,
                        data: Some(Cow::Borrowed(chunk.payload)),
                        size,
                    }));
                }
                CHUNK_TYPE_FILL => {
                    if chunk.payload.len() != 4 {
                        return Some(Err(EdlError::Sparse(format!(
                            "fill chunk carries a {}-byte pattern",
                            chunk.payload.len()
                        ))));
                    }
                    self.offset += size;
                    // An all-zero pattern is just a hole wearing a costume
                    if chunk.payload == [0, 0, 0, 0] {
                        return Some(Ok(SparseRun {
                            offset,
                            data: None,
                            size,
                        }));
                    }
                    let mut data = Vec::with_capacity(size as usize);
                    while data.len() < size as usize {
                        data.extend_from_slice(chunk.payload);
                    }
                    return Some(Ok(SparseRun {
                        offset,
                        data: Some(Cow::Owned(data)),
                        size,
                    }));
                }
                CHUNK_TYPE_SKIP => {
                    if !chunk.payload.is_empty() {
                        return Some(Err(EdlError::Sparse(
                            "skip chunk carries payload bytes".to_owned(),
                        )));
                    }
                    self.offset += size;
                    return Some(Ok(SparseRun {
                        offset,
                        data: None,
                        size,
                    }));
                }
                // Advisory; contributes no output
                CHUNK_TYPE_CRC32 => continue,
                other => {
                    return Some(Err(EdlError::Sparse(format!(
                        "unknown chunk type 0x{other:04x}"
                    ))));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLK: usize = 4096;

    fn push_chunk(out: &mut Vec<u8>, chunk_type: u16, blocks: u32, payload: &[u8]) {
        let header = ChunkHeader {
            chunk_type,
            reserved: 0,
            chunk_sz: blocks,
            total_sz: (SPARSE_CHUNK_HEADER_SIZE + payload.len()) as u32,
        };
        out.extend_from_slice(&bincode::serialize(&header).unwrap());
        out.extend_from_slice(payload);
    }

    /// 9 blocks in 6 chunks: raw, fill, skip, raw, zero-fill, crc
    fn fixture() -> (Vec<u8>, Vec<u8>) {
        let raw1: Vec<u8> = (0..2 * BLK).map(|i| (i % 253) as u8).collect();
        let raw2: Vec<u8> = (0..2 * BLK).map(|i| (i % 241) as u8).collect();

        let mut blob = bincode::serialize(&SparseHeader {
            magic: SPARSE_HEADER_MAGIC,
            major_version: 1,
            minor_version: 0,
            file_hdr_sz: SPARSE_FILE_HEADER_SIZE as u16,
            chunk_hdr_sz: SPARSE_CHUNK_HEADER_SIZE as u16,
            blk_sz: BLK as u32,
            total_blks: 9,
            total_chunks: 6,
            image_checksum: 0,
        })
        .unwrap();
        push_chunk(&mut blob, CHUNK_TYPE_RAW, 2, &raw1);
        push_chunk(&mut blob, CHUNK_TYPE_FILL, 1, &[0xa5, 0x5a, 0xa5, 0x5a]);
        push_chunk(&mut blob, CHUNK_TYPE_SKIP, 3, &[]);
        push_chunk(&mut blob, CHUNK_TYPE_RAW, 2, &raw2);
        push_chunk(&mut blob, CHUNK_TYPE_FILL, 1, &[0, 0, 0, 0]);
        push_chunk(&mut blob, CHUNK_TYPE_CRC32, 0, &0u32.to_le_bytes());

        let mut raw = Vec::with_capacity(9 * BLK);
        raw.extend_from_slice(&raw1);
        for _ in 0..BLK / 4 {
            raw.extend_from_slice(&[0xa5, 0x5a, 0xa5, 0x5a]);
        }
        raw.extend_from_slice(&vec![0u8; 3 * BLK]);
        raw.extend_from_slice(&raw2);
        raw.extend_from_slice(&vec![0u8; BLK]);
        (blob, raw)
    }

    #[test]
    fn file_header_parses() {
        let (blob, _) = fixture();
        let sparse = Sparse::from(&blob).unwrap().unwrap();
        assert_eq!(sparse.header.magic, SPARSE_HEADER_MAGIC);
        assert_eq!(sparse.header.total_blks, 9);
        assert_eq!(sparse.header.total_chunks, 6);
        assert_eq!(sparse.header.blk_sz, BLK as u32);
        assert_eq!(sparse.header.file_hdr_sz, 28);
        assert_eq!(sparse.header.chunk_hdr_sz, 12);
    }

    #[test]
    fn expansion_matches_the_reference_image() {
        let (blob, reference) = fixture();
        let sparse = Sparse::from(&blob).unwrap().unwrap();

        let mut out = vec![];
        for run in sparse.read() {
            let run = run.unwrap();
            assert_eq!(out.len() as u64, run.offset, "runs are contiguous");
            match run.data {
                Some(data) => {
                    assert_eq!(data.len() as u64, run.size);
                    out.extend_from_slice(&data);
                }
                None => out.extend_from_slice(&vec![0u8; run.size as usize]),
            }
        }

        assert_eq!(out.len(), 9 * BLK);
        assert_eq!(out, reference);
    }

    #[test]
    fn zero_fill_is_a_hole_not_materialized_zeroes() {
        let (blob, _) = fixture();
        let sparse = Sparse::from(&blob).unwrap().unwrap();
        let runs: Vec<_> = sparse.read().map(|r| r.unwrap()).collect();

        // raw, fill, skip, raw, zero-fill; the crc chunk emits nothing
        assert_eq!(runs.len(), 5);
        assert!(runs[2].data.is_none(), "skip is a hole");
        assert!(runs[4].data.is_none(), "zero fill is a hole");
        assert!(runs[1].data.is_some(), "patterned fill is materialized");
        assert_eq!(runs[1].data.as_deref().unwrap()[..4], [0xa5, 0x5a, 0xa5, 0x5a]);
    }

    #[test]
    fn offsets_are_block_aligned_and_gapless() {
        let (blob, _) = fixture();
        let sparse = Sparse::from(&blob).unwrap().unwrap();
        let mut expected = 0u64;
        for run in sparse.read() {
            let run = run.unwrap();
            assert_eq!(run.offset % BLK as u64, 0);
            assert_eq!(run.offset, expected);
            expected = run.offset + run.size;
        }
        assert_eq!(expected, 9 * BLK as u64);
    }

    #[test]
    fn non_sparse_blobs_pass_through_as_none() {
        assert!(Sparse::from(&[0u8; 8]).unwrap().is_none());
        let mut not_sparse = vec![0u8; 64];
        not_sparse[0] = 0x42;
        assert!(Sparse::from(&not_sparse).unwrap().is_none());
    }

    #[test]
    fn truncated_chunks_are_an_error() {
        let (blob, _) = fixture();
        let sparse_err = {
            let cut = &blob[..blob.len() - 2048];
            let sparse = Sparse::from(cut).unwrap().unwrap();
            sparse.read().collect::<Result<Vec<_>>>()
        };
        assert!(matches!(sparse_err, Err(EdlError::Sparse(_))));
    }

    #[test]
    fn unsupported_major_version_is_an_error() {
        let (mut blob, _) = fixture();
        blob[4] = 2;
        assert!(Sparse::from(&blob).is_err());
    }
}
