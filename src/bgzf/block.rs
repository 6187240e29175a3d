//! BGZF frame parsing and the block descriptor handed from the driver
//! thread to a decompression task (spec §3 "BGZF block descriptor",
//! §6 "Wire format framing").

use crate::error::{Error, Result};

/// The minimum size of a BGZF block per the SAM/BAM spec, used as the
/// lower bound for how much readable data the driver needs before it
/// will even attempt to parse a frame header (spec §4.H).
pub const MIN_BLOCK_SIZE: usize = 18 + 8; // smallest possible header + empty deflate stream + trailer
pub const MAX_BLOCK_SIZE: usize = 64 * 1024;

const GZIP_ID1: u8 = 0x1f;
const GZIP_ID2: u8 = 0x8b;
const FLG_FEXTRA: u8 = 0x04;
const BC_SI1: u8 = b'B';
const BC_SI2: u8 = b'C';

/// One parsed BGZF frame: a view of its compressed payload plus the
/// sizes carried in its header (`BSIZE`) and trailer (`ISIZE`).
pub struct BgzfFrame<'a> {
    pub cdata: &'a [u8],
    /// Total on-wire length of this block (`BSIZE + 1`).
    pub total_len: usize,
    /// Uncompressed size from the gzip trailer.
    pub isize_: u32,
}

/// Attempts to parse one BGZF frame header (and locate its trailer) from
/// the start of `data`. Returns `Ok(None)` if `data` doesn't yet contain
/// a complete frame (the driver should read more before retrying).
pub fn parse_frame(data: &[u8]) -> Result<Option<BgzfFrame<'_>>> {
    if data.len() < 12 {
        return Ok(None);
    }
    if data[0] != GZIP_ID1 || data[1] != GZIP_ID2 || data[2] != 8 {
        return Err(Error::Decode("not a gzip member (bad magic/compression method)".into()));
    }
    if data[3] & FLG_FEXTRA == 0 {
        return Err(Error::Decode("BGZF block missing FEXTRA flag".into()));
    }
    let xlen = u16::from_le_bytes([data[10], data[11]]) as usize;
    let extra_end = 12 + xlen;
    if data.len() < extra_end {
        return Ok(None);
    }

    let mut bsize = None;
    let mut i = 12;
    while i + 4 <= extra_end {
        let si1 = data[i];
        let si2 = data[i + 1];
        let slen = u16::from_le_bytes([data[i + 2], data[i + 3]]) as usize;
        if si1 == BC_SI1 && si2 == BC_SI2 && slen == 2 && i + 6 <= extra_end {
            bsize = Some(u16::from_le_bytes([data[i + 4], data[i + 5]]));
        }
        i += 4 + slen;
    }
    let bsize = bsize.ok_or_else(|| Error::Decode("BGZF block missing BC extra subfield".into()))?;
    let total_len = bsize as usize + 1;
    if data.len() < total_len {
        return Ok(None);
    }
    if total_len < extra_end + 8 {
        return Err(Error::Decode("BGZF BSIZE too small for its own header".into()));
    }

    let cdata_end = total_len - 8;
    let cdata = &data[extra_end..cdata_end];
    let isize_ = u32::from_le_bytes(data[total_len - 4..total_len].try_into().unwrap());

    Ok(Some(BgzfFrame { cdata, total_len, isize_ }))
}

/// A compressed block awaiting decompression: a view into the driver's
/// circular buffer, valid for as long as the driver keeps `offset`
/// within its active set (spec §4.H step 3).
pub struct BgzfBlockDescriptor {
    ptr: *const u8,
    compressed_len: usize,
    pub uncompressed_len: u32,
    pub index: u64,
    pub offset: u64,
}

// SAFETY: `ptr` refers to the driver's circular buffer, which the driver
// guarantees stays mapped and unmodified at `offset` until the block's
// consuming task has returned (spec §4.H step 3's offset-lifetime
// tracking). The descriptor is handed to exactly one worker task.
unsafe impl Send for BgzfBlockDescriptor {}

impl BgzfBlockDescriptor {
    /// # Safety
    /// `ptr` must remain valid for `compressed_len` bytes for the entire
    /// lifetime of the returned descriptor.
    pub unsafe fn new(ptr: *const u8, compressed_len: usize, uncompressed_len: u32, index: u64, offset: u64) -> Self {
        BgzfBlockDescriptor { ptr, compressed_len, uncompressed_len, index, offset }
    }

    /// # Safety
    /// The caller must not retain the returned slice past the point the
    /// driver may have released `self.offset` from its circular buffer.
    pub unsafe fn compressed_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, self.compressed_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn make_bgzf_block(payload: &[u8]) -> Vec<u8> {
        let mut cdata = Vec::new();
        {
            let mut enc = DeflateEncoder::new(&mut cdata, Compression::default());
            enc.write_all(payload).unwrap();
            enc.finish().unwrap();
        }
        let bsize = (12 + 6 + cdata.len() + 8 - 1) as u16;
        let mut block = Vec::new();
        block.extend_from_slice(&[GZIP_ID1, GZIP_ID2, 8, FLG_FEXTRA]);
        block.extend_from_slice(&[0, 0, 0, 0]); // MTIME
        block.extend_from_slice(&[0, 0xff]); // XFL, OS
        block.extend_from_slice(&6u16.to_le_bytes()); // XLEN
        block.extend_from_slice(&[BC_SI1, BC_SI2]);
        block.extend_from_slice(&2u16.to_le_bytes()); // SLEN
        block.extend_from_slice(&bsize.to_le_bytes());
        block.extend_from_slice(&cdata);
        block.extend_from_slice(&0u32.to_le_bytes()); // CRC32 (unchecked by parse_frame)
        block.extend_from_slice(&(payload.len() as u32).to_le_bytes()); // ISIZE
        block
    }

    #[test]
    fn parses_a_well_formed_block() {
        let payload = b"some uncompressed BAM-ish bytes";
        let block = make_bgzf_block(payload);
        let frame = parse_frame(&block).unwrap().expect("complete frame");
        assert_eq!(frame.total_len, block.len());
        assert_eq!(frame.isize_, payload.len() as u32);
    }

    #[test]
    fn returns_none_on_truncated_input() {
        let block = make_bgzf_block(b"payload");
        let truncated = &block[..block.len() - 4];
        assert!(parse_frame(truncated).unwrap().is_none());
    }

    #[test]
    fn rejects_non_gzip_input() {
        let garbage = [0u8; 32];
        assert!(parse_frame(&garbage).is_err());
    }
}
