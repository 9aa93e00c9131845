//! DSF and DFF (DSDIFF) input.
//!
//! DSD sources decode to ±1.0 floats at the full DSD rate (2.8224 MHz for
//! DSD64) and run through the normal conversion pipeline; the controller
//! skips the peak pre-pass for them and normalizes against 0.5.
//!
//! Layout facts the readers depend on:
//! - DSF stores per-channel blocks (typically 4096 bytes) interleaved by
//!   block, bits LSB-first within each byte.
//! - DFF stores one byte per channel, channels interleaved byte-wise,
//!   bits MSB-first, with big-endian chunk sizes in an IFF FRM8
//!   container.
//!
//! References: Sony DSF File Format Specification v1.01; Philips DSDIFF
//! Specification v1.5.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{BigEndian as BE, LittleEndian as LE, ReadBytesExt};

use crate::format::SubFormat;
use crate::reader::FileReader;
use crate::{Error, Result};

fn open_err(path: &Path, reason: impl ToString) -> Error {
    Error::InputOpen {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

fn read_err(e: std::io::Error) -> Error {
    Error::InputRead(e.to_string())
}

#[inline]
fn bit_sample(byte: u8, bit: usize, lsb_first: bool) -> f64 {
    let shift = if lsb_first { bit } else { 7 - bit };
    if (byte >> shift) & 1 == 1 {
        1.0
    } else {
        -1.0
    }
}

// ---------------------------------------------------------------------------
// DSF
// ---------------------------------------------------------------------------

pub struct DsfReader {
    file: BufReader<File>,
    channels: u16,
    sample_rate: u32,
    /// Total frames (bits per channel) declared by the header.
    frame_count: u64,
    block_size: usize,
    lsb_first: bool,
    data_start: u64,

    /// One decoded block-round of interleaved frames.
    pending: Vec<f64>,
    pending_pos: usize,
    frames_delivered: u64,
    scratch: Vec<u8>,
}

impl DsfReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| open_err(path, e))?;
        let mut r = BufReader::new(file);

        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).map_err(|e| open_err(path, e))?;
        if &magic != b"DSD " {
            return Err(open_err(path, "missing DSD chunk"));
        }
        let _chunk_size = r.read_u64::<LE>().map_err(|e| open_err(path, e))?;
        let _file_size = r.read_u64::<LE>().map_err(|e| open_err(path, e))?;
        let _metadata_ptr = r.read_u64::<LE>().map_err(|e| open_err(path, e))?;

        let mut fmt = [0u8; 4];
        r.read_exact(&mut fmt).map_err(|e| open_err(path, e))?;
        if &fmt != b"fmt " {
            return Err(open_err(path, "missing fmt chunk"));
        }
        let _fmt_size = r.read_u64::<LE>().map_err(|e| open_err(path, e))?;
        let _version = r.read_u32::<LE>().map_err(|e| open_err(path, e))?;
        let format_id = r.read_u32::<LE>().map_err(|e| open_err(path, e))?;
        if format_id != 0 {
            return Err(open_err(path, "compressed DSF is not supported"));
        }
        let _channel_type = r.read_u32::<LE>().map_err(|e| open_err(path, e))?;
        let channels = r.read_u32::<LE>().map_err(|e| open_err(path, e))?;
        let sample_rate = r.read_u32::<LE>().map_err(|e| open_err(path, e))?;
        let bits_per_sample = r.read_u32::<LE>().map_err(|e| open_err(path, e))?;
        let frame_count = r.read_u64::<LE>().map_err(|e| open_err(path, e))?;
        let block_size = r.read_u32::<LE>().map_err(|e| open_err(path, e))?;
        let _reserved = r.read_u32::<LE>().map_err(|e| open_err(path, e))?;

        let mut data = [0u8; 4];
        r.read_exact(&mut data).map_err(|e| open_err(path, e))?;
        if &data != b"data" {
            return Err(open_err(path, "missing data chunk"));
        }
        let _data_size = r.read_u64::<LE>().map_err(|e| open_err(path, e))?;
        let data_start = r.stream_position().map_err(|e| open_err(path, e))?;

        if channels == 0 || channels > 64 || block_size == 0 {
            return Err(open_err(path, "implausible DSF header"));
        }

        Ok(Self {
            file: r,
            channels: channels as u16,
            sample_rate,
            frame_count,
            block_size: block_size as usize,
            lsb_first: bits_per_sample == 1,
            data_start,
            pending: Vec::new(),
            pending_pos: 0,
            frames_delivered: 0,
            scratch: vec![0u8; block_size as usize],
        })
    }

    /// Load and unpack the next round of per-channel blocks.
    fn refill(&mut self) -> Result<()> {
        self.pending.clear();
        self.pending_pos = 0;

        let remaining = self.frame_count.saturating_sub(self.frames_delivered);
        if remaining == 0 {
            return Ok(());
        }
        let frames_in_round = ((self.block_size * 8) as u64).min(remaining) as usize;

        let channels = self.channels as usize;
        let mut blocks: Vec<Vec<u8>> = Vec::with_capacity(channels);
        for _ in 0..channels {
            let n = read_fully(&mut self.file, &mut self.scratch).map_err(read_err)?;
            if n == 0 {
                return Ok(());
            }
            self.scratch[n..].fill(0);
            blocks.push(self.scratch.clone());
        }

        self.pending.reserve(frames_in_round * channels);
        for frame in 0..frames_in_round {
            let byte = frame / 8;
            let bit = frame % 8;
            for block in &blocks {
                self.pending.push(bit_sample(block[byte], bit, self.lsb_first));
            }
        }
        self.frames_delivered += frames_in_round as u64;
        Ok(())
    }
}

impl FileReader for DsfReader {
    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn frames(&self) -> Option<u64> {
        Some(self.frame_count)
    }

    fn read(&mut self, buf: &mut [f64]) -> Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            if self.pending_pos == self.pending.len() {
                self.refill()?;
                if self.pending.is_empty() {
                    break;
                }
            }
            let available = self.pending.len() - self.pending_pos;
            let take = available.min(buf.len() - written);
            buf[written..written + take]
                .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + take]);
            self.pending_pos += take;
            written += take;
        }
        Ok(written)
    }

    fn rewind(&mut self) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(self.data_start))
            .map_err(read_err)?;
        self.pending.clear();
        self.pending_pos = 0;
        self.frames_delivered = 0;
        Ok(())
    }

    fn sub_format(&self) -> Option<SubFormat> {
        None
    }

    fn describe(&self) -> String {
        format!("1-bit dsd (dsf, {} Hz)", self.sample_rate)
    }

    fn is_dsd(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// DFF
// ---------------------------------------------------------------------------

pub struct DffReader {
    file: BufReader<File>,
    channels: u16,
    sample_rate: u32,
    /// Total frames (bits per channel) derived from the data chunk size.
    frame_count: u64,
    data_start: u64,

    pending: Vec<f64>,
    pending_pos: usize,
    frames_delivered: u64,
}

/// Byte-groups unpacked per refill round.
const DFF_GROUPS_PER_ROUND: usize = 4096;

impl DffReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| open_err(path, e))?;
        let mut r = BufReader::new(file);

        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).map_err(|e| open_err(path, e))?;
        if &magic != b"FRM8" {
            return Err(open_err(path, "missing FRM8 container"));
        }
        let _form_size = r.read_u64::<BE>().map_err(|e| open_err(path, e))?;
        let mut form_type = [0u8; 4];
        r.read_exact(&mut form_type).map_err(|e| open_err(path, e))?;
        if &form_type != b"DSD " {
            return Err(open_err(path, "not a DSD form"));
        }

        let mut channels = 0u16;
        let mut sample_rate = 0u32;

        loop {
            let mut id = [0u8; 4];
            r.read_exact(&mut id)
                .map_err(|_| open_err(path, "no DSD data chunk"))?;
            let size = r.read_u64::<BE>().map_err(|e| open_err(path, e))?;

            match &id {
                b"PROP" => {
                    let mut prop_type = [0u8; 4];
                    r.read_exact(&mut prop_type).map_err(|e| open_err(path, e))?;
                    let mut remaining = size - 4;
                    while remaining >= 12 {
                        let mut sub_id = [0u8; 4];
                        r.read_exact(&mut sub_id).map_err(|e| open_err(path, e))?;
                        let sub_size = r.read_u64::<BE>().map_err(|e| open_err(path, e))?;
                        match &sub_id {
                            b"FS  " => {
                                sample_rate = r.read_u32::<BE>().map_err(|e| open_err(path, e))?;
                                skip(&mut r, sub_size - 4).map_err(|e| open_err(path, e))?;
                            }
                            b"CHNL" => {
                                channels = r.read_u16::<BE>().map_err(|e| open_err(path, e))?;
                                skip(&mut r, sub_size - 2).map_err(|e| open_err(path, e))?;
                            }
                            b"CMPR" => {
                                let mut cmpr = [0u8; 4];
                                r.read_exact(&mut cmpr).map_err(|e| open_err(path, e))?;
                                if &cmpr != b"DSD " {
                                    return Err(open_err(path, "compressed DFF is not supported"));
                                }
                                skip(&mut r, sub_size - 4).map_err(|e| open_err(path, e))?;
                            }
                            _ => skip(&mut r, sub_size).map_err(|e| open_err(path, e))?,
                        }
                        remaining = remaining.saturating_sub(12 + sub_size + sub_size % 2);
                        if sub_size % 2 == 1 {
                            skip(&mut r, 1).map_err(|e| open_err(path, e))?;
                        }
                    }
                    if remaining > 0 {
                        skip(&mut r, remaining).map_err(|e| open_err(path, e))?;
                    }
                }
                b"DSD " => {
                    if channels == 0 || sample_rate == 0 {
                        return Err(open_err(path, "DSD data before properties"));
                    }
                    let data_start = r.stream_position().map_err(|e| open_err(path, e))?;
                    let frame_count = size / u64::from(channels) * 8;
                    return Ok(Self {
                        file: r,
                        channels,
                        sample_rate,
                        frame_count,
                        data_start,
                        pending: Vec::new(),
                        pending_pos: 0,
                        frames_delivered: 0,
                    });
                }
                _ => skip(&mut r, size + size % 2).map_err(|e| open_err(path, e))?,
            }
        }
    }

    fn refill(&mut self) -> Result<()> {
        self.pending.clear();
        self.pending_pos = 0;

        let remaining = self.frame_count.saturating_sub(self.frames_delivered);
        if remaining == 0 {
            return Ok(());
        }
        let channels = self.channels as usize;
        let groups = ((remaining / 8).max(1) as usize).min(DFF_GROUPS_PER_ROUND);

        let mut bytes = vec![0u8; groups * channels];
        let n = read_fully(&mut self.file, &mut bytes).map_err(read_err)?;
        let whole_groups = n / channels;
        if whole_groups == 0 {
            return Ok(());
        }

        let frames = (whole_groups * 8).min(remaining as usize);
        self.pending.reserve(frames * channels);
        for frame in 0..frames {
            let group = frame / 8;
            let bit = frame % 8;
            for ch in 0..channels {
                let byte = bytes[group * channels + ch];
                self.pending.push(bit_sample(byte, bit, false));
            }
        }
        self.frames_delivered += frames as u64;
        Ok(())
    }
}

impl FileReader for DffReader {
    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn frames(&self) -> Option<u64> {
        Some(self.frame_count)
    }

    fn read(&mut self, buf: &mut [f64]) -> Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            if self.pending_pos == self.pending.len() {
                self.refill()?;
                if self.pending.is_empty() {
                    break;
                }
            }
            let available = self.pending.len() - self.pending_pos;
            let take = available.min(buf.len() - written);
            buf[written..written + take]
                .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + take]);
            self.pending_pos += take;
            written += take;
        }
        Ok(written)
    }

    fn rewind(&mut self) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(self.data_start))
            .map_err(read_err)?;
        self.pending.clear();
        self.pending_pos = 0;
        self.frames_delivered = 0;
        Ok(())
    }

    fn sub_format(&self) -> Option<SubFormat> {
        None
    }

    fn describe(&self) -> String {
        format!("1-bit dsd (dff, {} Hz)", self.sample_rate)
    }

    fn is_dsd(&self) -> bool {
        true
    }
}

fn skip<R: Seek>(reader: &mut R, bytes: u64) -> std::io::Result<()> {
    reader.seek(SeekFrom::Current(bytes as i64)).map(|_| ())
}

/// `Read::read` until the buffer is full or EOF; returns bytes read.
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = reader.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Write;
    use tempfile::TempDir;

    /// Minimal DSF file: one channel block round, tiny block size.
    fn write_dsf(path: &Path, channels: u32, block_size: u32, blocks: &[&[u8]], frames: u64) {
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(b"DSD ").unwrap();
        f.write_u64::<LE>(28).unwrap();
        f.write_u64::<LE>(0).unwrap(); // total size, unused by the reader
        f.write_u64::<LE>(0).unwrap(); // no id3

        f.write_all(b"fmt ").unwrap();
        f.write_u64::<LE>(52).unwrap();
        f.write_u32::<LE>(1).unwrap(); // version
        f.write_u32::<LE>(0).unwrap(); // uncompressed
        f.write_u32::<LE>(2).unwrap(); // channel type
        f.write_u32::<LE>(channels).unwrap();
        f.write_u32::<LE>(2_822_400).unwrap();
        f.write_u32::<LE>(1).unwrap(); // 1 = LSB first
        f.write_u64::<LE>(frames).unwrap();
        f.write_u32::<LE>(block_size).unwrap();
        f.write_u32::<LE>(0).unwrap();

        f.write_all(b"data").unwrap();
        let payload: usize = blocks.iter().map(|b| b.len()).sum();
        f.write_u64::<LE>(12 + payload as u64).unwrap();
        for b in blocks {
            f.write_all(b).unwrap();
        }
    }

    #[test]
    fn dsf_unpacks_lsb_first_per_channel_blocks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.dsf");
        // Two channels, 4-byte blocks. Channel 0: 0b0000_0001 then zeros;
        // channel 1: all ones.
        let ch0 = [0b0000_0001u8, 0, 0, 0];
        let ch1 = [0xFFu8, 0xFF, 0xFF, 0xFF];
        write_dsf(&path, 2, 4, &[&ch0, &ch1], 32);

        let mut reader = DsfReader::open(&path).unwrap();
        assert_eq!(reader.channels(), 2);
        assert_eq!(reader.sample_rate(), 2_822_400);
        assert_eq!(reader.frames(), Some(32));
        assert!(reader.is_dsd());

        let mut buf = vec![0.0; 64];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(n, 64);
        // LSB first: frame 0 of channel 0 is bit 0 of 0b0000_0001 = 1.
        assert_eq!(buf[0], 1.0);
        assert_eq!(buf[1], 1.0);
        // Frame 1 of channel 0 is bit 1 = 0 -> -1.0; channel 1 stays 1.0.
        assert_eq!(buf[2], -1.0);
        assert_eq!(buf[3], 1.0);
        assert!(buf.iter().skip(1).step_by(2).all(|&s| s == 1.0));

        // Rewind replays identically.
        reader.rewind().unwrap();
        let mut again = vec![0.0; 64];
        reader.read(&mut again).unwrap();
        assert_eq!(buf, again);
    }

    fn write_dff(path: &Path, channels: u16, data: &[u8]) {
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(b"FRM8").unwrap();
        f.write_u64::<BE>(0).unwrap();
        f.write_all(b"DSD ").unwrap();

        // PROP chunk: FS + CHNL + CMPR
        let chnl_body = 2 + 4 * u64::from(channels);
        let prop_size = 4 + (12 + 4) + (12 + chnl_body) + (12 + 4 + 2 + 2 % 2);
        f.write_all(b"PROP").unwrap();
        f.write_u64::<BE>(prop_size).unwrap();
        f.write_all(b"SND ").unwrap();

        f.write_all(b"FS  ").unwrap();
        f.write_u64::<BE>(4).unwrap();
        f.write_u32::<BE>(2_822_400).unwrap();

        f.write_all(b"CHNL").unwrap();
        f.write_u64::<BE>(chnl_body).unwrap();
        f.write_u16::<BE>(channels).unwrap();
        for i in 0..channels {
            f.write_all(if i == 0 { b"SLFT" } else { b"SRGT" }).unwrap();
        }

        f.write_all(b"CMPR").unwrap();
        f.write_u64::<BE>(6).unwrap();
        f.write_all(b"DSD ").unwrap();
        f.write_u8(1).unwrap();
        f.write_u8(b'x').unwrap(); // description, padded even below
        // (6 is even, no pad)

        f.write_all(b"DSD ").unwrap();
        f.write_u64::<BE>(data.len() as u64).unwrap();
        f.write_all(data).unwrap();
    }

    #[test]
    fn dff_unpacks_msb_first_byte_interleaved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.dff");
        // Stereo: ch0 byte 0b1000_0000, ch1 byte 0x00, then one more pair.
        write_dff(&path, 2, &[0b1000_0000, 0x00, 0xFF, 0xFF]);

        let mut reader = DffReader::open(&path).unwrap();
        assert_eq!(reader.channels(), 2);
        assert_eq!(reader.sample_rate(), 2_822_400);
        assert_eq!(reader.frames(), Some(16));

        let mut buf = vec![0.0; 32];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(n, 32);
        // MSB first: frame 0 of channel 0 is the top bit = 1.
        assert_eq!(buf[0], 1.0);
        assert_eq!(buf[1], -1.0);
        // Remaining 7 frames of the first byte pair: ch0 -1, ch1 -1.
        assert_eq!(buf[2], -1.0);
        // Second byte pair is all ones on both channels.
        assert!(buf[16..].iter().all(|&s| s == 1.0));
    }

    #[test]
    fn open_reader_dispatches_on_magic() {
        let dir = TempDir::new().unwrap();
        // A DSF file with a misleading extension still lands in DsfReader.
        let path = dir.path().join("mystery.bin");
        let ch0 = [0xFFu8; 4];
        write_dsf(&path, 1, 4, &[&ch0], 32);

        let reader = crate::reader::open_reader(&path).unwrap();
        assert!(reader.is_dsd());
    }
}
