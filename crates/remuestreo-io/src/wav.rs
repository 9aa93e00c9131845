//! RIFF/WAVE and RF64 writing, and float WAV read-back.
//!
//! The output side of the converter: PCM (u8/s8/16/24/32) and IEEE float
//! (32/64-bit) sub-formats, RF64 with a `ds64` size chunk for payloads at
//! or past the 32-bit RIFF limit, an optional `PEAK` chunk for float
//! files, LIST-INFO metadata and raw `bext` passthrough, and in-place
//! rewind so the gain/dither pass can rewrite the data chunk without
//! reopening the file.
//!
//! [`FloatWavReader`] reads back the float temp spill bit-exactly.
//!
//! References: RIFF WAVE (Microsoft/IBM, 1991); EBU Tech 3306 (RF64);
//! EBU Tech 3285 (bext).

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};

use crate::format::{MajorFormat, SubFormat};
use crate::{Error, Result};

/// Payload size at which RIFF's 32-bit chunk sizes run out.
pub const RIFF_SIZE_LIMIT: u64 = 1 << 32;

/// Writer options beyond the format itself.
#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    /// Write a `PEAK` chunk for float sub-formats.
    pub peak_chunk: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self { peak_chunk: true }
    }
}

/// Streaming WAV/RF64 writer.
pub struct WavWriter {
    file: BufWriter<File>,
    rf64: bool,
    sub: SubFormat,
    channels: u16,
    sample_rate: u32,

    riff_size_pos: u64,
    ds64_pos: u64,
    peak_pos: u64,
    data_size_pos: u64,
    data_start: u64,

    samples_written: u64,
    /// Per-channel (peak magnitude, frame position).
    peaks: Vec<(f64, u64)>,
    /// Running channel rotation for peak positions.
    next_channel: usize,
    frame_counter: u64,

    tags: Vec<([u8; 4], String)>,
    bext: Option<Vec<u8>>,
    peak_chunk: bool,
    finalized: bool,
}

impl WavWriter {
    /// Create the output file and write the header skeleton.
    ///
    /// `major` must be in the WAV family; anything else is
    /// [`Error::UnsupportedFormat`] (the format tables recognize more
    /// containers than the writer can produce).
    pub fn create<P: AsRef<Path>>(
        path: P,
        major: MajorFormat,
        sub: SubFormat,
        channels: u16,
        sample_rate: u32,
        options: WriterOptions,
    ) -> Result<Self> {
        if !major.is_wav_family() {
            return Err(Error::UnsupportedFormat(format!(
                "cannot encode '{}' output; supported containers: wav, rf64, csv",
                major.name()
            )));
        }
        if sub == SubFormat::Vorbis || sub == SubFormat::PcmS8 {
            return Err(Error::UnsupportedFormat(format!(
                "sub-format '{}' is not valid in a {} container",
                sub.token(),
                major.name()
            )));
        }

        let path = path.as_ref();
        let file = File::create(path).map_err(|e| Error::OutputOpen {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut writer = Self {
            file: BufWriter::new(file),
            rf64: major == MajorFormat::Rf64,
            sub,
            channels,
            sample_rate,
            riff_size_pos: 0,
            ds64_pos: 0,
            peak_pos: 0,
            data_size_pos: 0,
            data_start: 0,
            samples_written: 0,
            peaks: vec![(0.0, 0); channels as usize],
            next_channel: 0,
            frame_counter: 0,
            tags: Vec::new(),
            bext: None,
            peak_chunk: options.peak_chunk && sub.is_float(),
            finalized: false,
        };
        writer.write_header().map_err(write_err)?;
        Ok(writer)
    }

    fn write_header(&mut self) -> io::Result<()> {
        let w = &mut self.file;
        w.write_all(if self.rf64 { b"RF64" } else { b"RIFF" })?;
        self.riff_size_pos = w.stream_position()?;
        w.write_u32::<LE>(if self.rf64 { 0xFFFF_FFFF } else { 0 })?;
        w.write_all(b"WAVE")?;

        if self.rf64 {
            w.write_all(b"ds64")?;
            w.write_u32::<LE>(28)?;
            self.ds64_pos = w.stream_position()?;
            w.write_all(&[0u8; 28])?;
        }

        let bits = (self.sub.bytes_per_sample() * 8) as u16;
        let block_align = self.channels * bits / 8;
        w.write_all(b"fmt ")?;
        w.write_u32::<LE>(16)?;
        w.write_u16::<LE>(if self.sub.is_float() { 3 } else { 1 })?;
        w.write_u16::<LE>(self.channels)?;
        w.write_u32::<LE>(self.sample_rate)?;
        w.write_u32::<LE>(self.sample_rate * u32::from(block_align))?;
        w.write_u16::<LE>(block_align)?;
        w.write_u16::<LE>(bits)?;

        if self.peak_chunk {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0);
            w.write_all(b"PEAK")?;
            w.write_u32::<LE>(8 + 8 * u32::from(self.channels))?;
            w.write_u32::<LE>(1)?;
            w.write_u32::<LE>(now)?;
            self.peak_pos = w.stream_position()?;
            for _ in 0..self.channels {
                w.write_f32::<LE>(0.0)?;
                w.write_u32::<LE>(0)?;
            }
        }

        w.write_all(b"data")?;
        self.data_size_pos = w.stream_position()?;
        w.write_u32::<LE>(if self.rf64 { 0xFFFF_FFFF } else { 0 })?;
        self.data_start = w.stream_position()?;
        Ok(())
    }

    /// Append interleaved samples to the data chunk.
    pub fn write_samples(&mut self, interleaved: &[f64]) -> Result<()> {
        debug_assert!(!self.finalized);
        for &x in interleaved {
            let magnitude = x.abs();
            let (peak, _) = self.peaks[self.next_channel];
            if magnitude > peak {
                self.peaks[self.next_channel] = (magnitude, self.frame_counter);
            }
            self.next_channel += 1;
            if self.next_channel == self.channels as usize {
                self.next_channel = 0;
                self.frame_counter += 1;
            }

            self.encode_sample(x).map_err(write_err)?;
        }
        self.samples_written += interleaved.len() as u64;
        Ok(())
    }

    #[inline]
    fn encode_sample(&mut self, x: f64) -> io::Result<()> {
        let w = &mut self.file;
        match self.sub {
            SubFormat::PcmU8 => {
                let v = ((x * 128.0).round() + 128.0).clamp(0.0, 255.0) as u8;
                w.write_u8(v)
            }
            SubFormat::PcmS8 => {
                let v = (x * 128.0).round().clamp(-128.0, 127.0) as i8;
                w.write_i8(v)
            }
            SubFormat::Pcm16 => {
                let v = (x * 32_768.0).round().clamp(-32_768.0, 32_767.0) as i16;
                w.write_i16::<LE>(v)
            }
            SubFormat::Pcm24 => {
                let v = (x * 8_388_608.0).round().clamp(-8_388_608.0, 8_388_607.0) as i32;
                let b = v.to_le_bytes();
                w.write_all(&b[..3])
            }
            SubFormat::Pcm32 => {
                let v = (x * 2_147_483_648.0)
                    .round()
                    .clamp(-2_147_483_648.0, 2_147_483_647.0) as i32;
                w.write_i32::<LE>(v)
            }
            SubFormat::Float => w.write_f32::<LE>(x as f32),
            SubFormat::Double => w.write_f64::<LE>(x),
            SubFormat::Vorbis => unreachable!("rejected at creation"),
        }
    }

    /// Number of samples written since creation or the last rewind.
    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    /// Seek back to the start of the data chunk for a rewrite pass. The
    /// rewritten pass must produce the same number of samples.
    pub fn rewind(&mut self) -> Result<()> {
        self.file.flush().map_err(write_err)?;
        self.file
            .seek(SeekFrom::Start(self.data_start))
            .map_err(write_err)?;
        self.samples_written = 0;
        self.next_channel = 0;
        self.frame_counter = 0;
        for p in self.peaks.iter_mut() {
            *p = (0.0, 0);
        }
        Ok(())
    }

    /// Attach a LIST-INFO tag, written at finalize.
    pub fn set_string(&mut self, fourcc: [u8; 4], value: &str) {
        if !value.is_empty() {
            self.tags.push((fourcc, value.to_string()));
        }
    }

    /// Attach a raw broadcast-extension chunk, written at finalize.
    pub fn set_bext(&mut self, chunk: Vec<u8>) {
        self.bext = Some(chunk);
    }

    /// Write trailing chunks, patch all sizes, and flush.
    pub fn finalize(mut self) -> Result<()> {
        self.finalize_inner().map_err(write_err)
    }

    fn finalize_inner(&mut self) -> io::Result<()> {
        self.finalized = true;
        let data_bytes = self.samples_written * self.sub.bytes_per_sample();
        if data_bytes % 2 == 1 {
            self.file.write_u8(0)?;
        }

        if !self.tags.is_empty() {
            let body: u32 = self
                .tags
                .iter()
                .map(|(_, v)| 8 + ((v.len() as u32 + 1) + 1) / 2 * 2)
                .sum();
            self.file.write_all(b"LIST")?;
            self.file.write_u32::<LE>(4 + body)?;
            self.file.write_all(b"INFO")?;
            for (fourcc, value) in &self.tags {
                self.file.write_all(fourcc)?;
                self.file.write_u32::<LE>(value.len() as u32 + 1)?;
                self.file.write_all(value.as_bytes())?;
                self.file.write_u8(0)?;
                if (value.len() + 1) % 2 == 1 {
                    self.file.write_u8(0)?;
                }
            }
        }

        if let Some(bext) = self.bext.take() {
            self.file.write_all(b"bext")?;
            self.file.write_u32::<LE>(bext.len() as u32)?;
            self.file.write_all(&bext)?;
            if bext.len() % 2 == 1 {
                self.file.write_u8(0)?;
            }
        }

        let file_len = self.file.stream_position()?;
        if !self.rf64 && file_len - 8 > u64::from(u32::MAX) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "output exceeds the 4 GB RIFF limit; rf64 promotion was required",
            ));
        }

        self.file.seek(SeekFrom::Start(self.data_size_pos))?;
        if self.rf64 {
            self.file.write_u32::<LE>(0xFFFF_FFFF)?;
        } else {
            self.file.write_u32::<LE>(data_bytes as u32)?;
        }

        self.file.seek(SeekFrom::Start(self.riff_size_pos))?;
        if self.rf64 {
            self.file.write_u32::<LE>(0xFFFF_FFFF)?;
        } else {
            self.file.write_u32::<LE>((file_len - 8) as u32)?;
        }

        if self.rf64 {
            self.file.seek(SeekFrom::Start(self.ds64_pos))?;
            self.file.write_u64::<LE>(file_len - 8)?;
            self.file.write_u64::<LE>(data_bytes)?;
            self.file
                .write_u64::<LE>(self.samples_written / u64::from(self.channels))?;
            self.file.write_u32::<LE>(0)?;
        }

        if self.peak_chunk {
            self.file.seek(SeekFrom::Start(self.peak_pos))?;
            let peaks = std::mem::take(&mut self.peaks);
            for (value, position) in peaks {
                self.file.write_f32::<LE>(value as f32)?;
                self.file.write_u32::<LE>(position.min(u64::from(u32::MAX)) as u32)?;
            }
        }

        self.file.flush()
    }
}

fn write_err(e: io::Error) -> Error {
    Error::OutputWrite(e.to_string())
}

/// Reader for float WAV/RF64 files written by [`WavWriter`]; used to
/// recover the temp spill bit-exactly in the gain/dither pass.
pub struct FloatWavReader {
    file: BufReader<File>,
    data_start: u64,
    data_len: u64,
    bytes_read: u64,
    double: bool,
    channels: u16,
    sample_rate: u32,
}

impl FloatWavReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::TempFile(e.to_string()))?;
        let mut reader = BufReader::new(file);

        let mut tag = [0u8; 4];
        reader
            .read_exact(&mut tag)
            .map_err(|e| Error::TempFile(e.to_string()))?;
        let rf64 = &tag == b"RF64";
        if !rf64 && &tag != b"RIFF" {
            return Err(Error::TempFile("not a RIFF/RF64 file".into()));
        }
        parse_float_wav(reader, rf64, path).map_err(|e| Error::TempFile(e.to_string()))
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Total frames in the data chunk.
    pub fn frames(&self) -> u64 {
        let bytes_per = if self.double { 8 } else { 4 };
        self.data_len / bytes_per / u64::from(self.channels.max(1))
    }

    pub fn is_double(&self) -> bool {
        self.double
    }

    /// Read up to `buf.len()` interleaved samples; returns the count, 0
    /// at end of data.
    pub fn read(&mut self, buf: &mut [f64]) -> Result<usize> {
        let bytes_per = if self.double { 8 } else { 4 };
        let remaining = ((self.data_len - self.bytes_read) / bytes_per) as usize;
        let count = buf.len().min(remaining);
        for slot in buf.iter_mut().take(count) {
            *slot = if self.double {
                self.file
                    .read_f64::<LE>()
                    .map_err(|e| Error::TempFile(e.to_string()))?
            } else {
                f64::from(
                    self.file
                        .read_f32::<LE>()
                        .map_err(|e| Error::TempFile(e.to_string()))?,
                )
            };
        }
        self.bytes_read += count as u64 * bytes_per;
        Ok(count)
    }

    pub fn rewind(&mut self) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(self.data_start))
            .map_err(|e| Error::TempFile(e.to_string()))?;
        self.bytes_read = 0;
        Ok(())
    }
}

fn parse_float_wav(
    mut reader: BufReader<File>,
    rf64: bool,
    path: &Path,
) -> io::Result<FloatWavReader> {
    let bad = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());

    let _riff_size = reader.read_u32::<LE>()?;
    let mut wave = [0u8; 4];
    reader.read_exact(&mut wave)?;
    if &wave != b"WAVE" {
        return Err(bad("missing WAVE tag"));
    }

    let mut ds64_data_len: Option<u64> = None;
    let mut channels = 0u16;
    let mut sample_rate = 0u32;
    let mut double = false;
    let mut have_fmt = false;

    loop {
        let mut id = [0u8; 4];
        if reader.read_exact(&mut id).is_err() {
            return Err(bad(&format!("no data chunk in {}", path.display())));
        }
        let size32 = reader.read_u32::<LE>()?;

        match &id {
            b"ds64" => {
                let _riff = reader.read_u64::<LE>()?;
                ds64_data_len = Some(reader.read_u64::<LE>()?);
                reader.seek(SeekFrom::Current(i64::from(size32) - 16))?;
            }
            b"fmt " => {
                let format_tag = reader.read_u16::<LE>()?;
                channels = reader.read_u16::<LE>()?;
                sample_rate = reader.read_u32::<LE>()?;
                let _byte_rate = reader.read_u32::<LE>()?;
                let _block_align = reader.read_u16::<LE>()?;
                let bits = reader.read_u16::<LE>()?;
                if format_tag != 3 {
                    return Err(bad("expected IEEE float sub-format"));
                }
                double = bits == 64;
                have_fmt = true;
                if size32 > 16 {
                    reader.seek(SeekFrom::Current(i64::from(size32) - 16))?;
                }
            }
            b"data" => {
                if !have_fmt {
                    return Err(bad("data chunk before fmt"));
                }
                let data_len = match ds64_data_len {
                    Some(len) if rf64 => len,
                    _ => u64::from(size32),
                };
                let data_start = reader.stream_position()?;
                return Ok(FloatWavReader {
                    file: reader,
                    data_start,
                    data_len,
                    bytes_read: 0,
                    double,
                    channels,
                    sample_rate,
                });
            }
            _ => {
                let skip = u64::from(size32) + u64::from(size32) % 2;
                reader.seek(SeekFrom::Current(skip as i64))?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn testdir() -> TempDir {
        TempDir::new().unwrap()
    }

    #[test]
    fn float_roundtrip_is_bit_exact() {
        let dir = testdir();
        let path = dir.path().join("spill.wav");
        let samples: Vec<f64> = (0..1000).map(|i| ((i as f64) * 0.001).sin() * 0.9).collect();

        let mut w = WavWriter::create(
            &path,
            MajorFormat::Wav,
            SubFormat::Double,
            2,
            48_000,
            WriterOptions { peak_chunk: false },
        )
        .unwrap();
        w.write_samples(&samples).unwrap();
        w.finalize().unwrap();

        let mut r = FloatWavReader::open(&path).unwrap();
        assert_eq!(r.channels(), 2);
        assert_eq!(r.sample_rate(), 48_000);
        let mut back = vec![0.0; 1000];
        assert_eq!(r.read(&mut back).unwrap(), 1000);
        assert_eq!(back, samples);
        assert_eq!(r.read(&mut back).unwrap(), 0);

        r.rewind().unwrap();
        let mut again = vec![0.0; 1000];
        r.read(&mut again).unwrap();
        assert_eq!(again, samples);
    }

    #[test]
    fn f32_spill_preserves_f32_values() {
        let dir = testdir();
        let path = dir.path().join("spill32.wav");
        let samples: Vec<f64> = (0..64).map(|i| f64::from(i as f32 * 0.013 - 0.4)).collect();

        let mut w = WavWriter::create(
            &path,
            MajorFormat::Wav,
            SubFormat::Float,
            1,
            44_100,
            WriterOptions { peak_chunk: false },
        )
        .unwrap();
        w.write_samples(&samples).unwrap();
        w.finalize().unwrap();

        let mut r = FloatWavReader::open(&path).unwrap();
        let mut back = vec![0.0; 64];
        r.read(&mut back).unwrap();
        for (a, b) in samples.iter().zip(back.iter()) {
            assert_eq!(*a as f32, *b as f32);
        }
    }

    #[test]
    fn pcm16_output_is_readable_by_hound() {
        let dir = testdir();
        let path = dir.path().join("out.wav");
        let samples = vec![0.0, 0.5, -0.5, 1.0, -1.0, 0.25];

        let mut w = WavWriter::create(
            &path,
            MajorFormat::Wav,
            SubFormat::Pcm16,
            1,
            44_100,
            WriterOptions::default(),
        )
        .unwrap();
        w.write_samples(&samples).unwrap();
        w.finalize().unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 44_100);
        assert_eq!(spec.bits_per_sample, 16);
        let got: Vec<i16> = reader.into_samples().map(|s| s.unwrap()).collect();
        assert_eq!(got, vec![0, 16_384, -16_384, 32_767, -32_768, 8_192]);
    }

    #[test]
    fn pcm24_output_is_readable_by_hound() {
        let dir = testdir();
        let path = dir.path().join("out24.wav");
        let samples = vec![0.5f64, -0.25];

        let mut w = WavWriter::create(
            &path,
            MajorFormat::Wav,
            SubFormat::Pcm24,
            1,
            48_000,
            WriterOptions::default(),
        )
        .unwrap();
        w.write_samples(&samples).unwrap();
        w.finalize().unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().bits_per_sample, 24);
        let got: Vec<i32> = reader.into_samples().map(|s| s.unwrap()).collect();
        assert_eq!(got, vec![4_194_304, -2_097_152]);
    }

    #[test]
    fn rewind_rewrites_in_place() {
        let dir = testdir();
        let path = dir.path().join("rewrite.wav");

        let mut w = WavWriter::create(
            &path,
            MajorFormat::Wav,
            SubFormat::Float,
            1,
            48_000,
            WriterOptions { peak_chunk: false },
        )
        .unwrap();
        w.write_samples(&[0.1, 0.2, 0.3]).unwrap();
        w.rewind().unwrap();
        w.write_samples(&[0.7, 0.8, 0.9]).unwrap();
        w.finalize().unwrap();

        let mut r = FloatWavReader::open(&path).unwrap();
        let mut back = vec![0.0; 3];
        r.read(&mut back).unwrap();
        assert_eq!(back, vec![0.7, 0.8, 0.9]);
    }

    #[test]
    fn peak_chunk_and_tags_land_in_the_file() {
        let dir = testdir();
        let path = dir.path().join("tagged.wav");

        let mut w = WavWriter::create(
            &path,
            MajorFormat::Wav,
            SubFormat::Float,
            1,
            48_000,
            WriterOptions::default(),
        )
        .unwrap();
        w.set_string(*b"INAM", "test title");
        w.set_string(*b"IART", "test artist");
        w.write_samples(&[0.25, -0.75, 0.5]).unwrap();
        w.finalize().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let find = |needle: &[u8]| bytes.windows(needle.len()).position(|w| w == needle);
        assert!(find(b"PEAK").is_some());
        assert!(find(b"LIST").is_some());
        assert!(find(b"INAM").is_some());
        assert!(find(b"test artist").is_some());

        // Peak value patched to 0.75.
        let peak_at = find(b"PEAK").unwrap();
        let value_at = peak_at + 8 + 8;
        let value = f32::from_le_bytes(bytes[value_at..value_at + 4].try_into().unwrap());
        assert!((value - 0.75).abs() < 1e-6);
    }

    #[test]
    fn rf64_header_carries_64bit_sizes() {
        let dir = testdir();
        let path = dir.path().join("big.rf64");

        let mut w = WavWriter::create(
            &path,
            MajorFormat::Rf64,
            SubFormat::Float,
            2,
            96_000,
            WriterOptions { peak_chunk: false },
        )
        .unwrap();
        w.write_samples(&vec![0.5; 512]).unwrap();
        w.finalize().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"RF64");
        assert_eq!(&bytes[4..8], &0xFFFF_FFFFu32.to_le_bytes());
        assert_eq!(&bytes[12..16], b"ds64");
        let data_len = u64::from_le_bytes(bytes[28..36].try_into().unwrap());
        assert_eq!(data_len, 512 * 4);

        // And the float reader accepts it.
        let mut r = FloatWavReader::open(&path).unwrap();
        let mut back = vec![0.0; 512];
        assert_eq!(r.read(&mut back).unwrap(), 512);
        assert!(back.iter().all(|&x| x == 0.5));
    }

    #[test]
    fn non_wav_majors_are_rejected() {
        let dir = testdir();
        let path = dir.path().join("out.flac");
        let err = WavWriter::create(
            &path,
            MajorFormat::Flac,
            SubFormat::Pcm16,
            1,
            44_100,
            WriterOptions::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }
}
