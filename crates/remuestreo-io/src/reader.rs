//! Input-file reading.
//!
//! [`FileReader`] is the contract between the pipeline controller and the
//! codec backends: interleaved samples as f64, a rewind for the peak
//! pre-pass and clipping retries, and enough format description for the
//! output sub-format to be carried over. Three backends implement it:
//!
//! - [`WavFileReader`]: standard WAV through hound
//! - [`SymphoniaReader`]: FLAC/AIFF/MP3/OGG (and anything else the probe
//!   recognizes) through symphonia
//! - the DSF/DFF readers in [`crate::dsd`]
//!
//! [`open_reader`] dispatches on the file magic first (DSD containers are
//! recognized by content as well as extension), then the extension.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, StandardTagKey, Value};
use symphonia::core::probe::Hint;

use crate::dsd::{DffReader, DsfReader};
use crate::format::SubFormat;
use crate::metadata::{read_wav_metadata, MetaData};
use crate::{Error, Result};

/// Contract every input backend satisfies.
pub trait FileReader: Send {
    fn channels(&self) -> u16;
    fn sample_rate(&self) -> u32;

    /// Total frames per channel, when the container declares it.
    fn frames(&self) -> Option<u64>;

    /// Fill `buf` with interleaved samples in [-1, 1]; returns the number
    /// of samples delivered, 0 at end of file. Always a whole number of
    /// frames.
    fn read(&mut self, buf: &mut [f64]) -> Result<usize>;

    /// Return to the first frame.
    fn rewind(&mut self) -> Result<()>;

    /// The input's sample coding, when it maps onto an output sub-format.
    fn sub_format(&self) -> Option<SubFormat>;

    /// Textual tags and bext carried by the input.
    fn metadata(&self) -> MetaData {
        MetaData::default()
    }

    /// Short human description of the source coding.
    fn describe(&self) -> String;

    /// Whether this is a DSD source (peak pre-pass is skipped and the
    /// normalization target drops to 0.5).
    fn is_dsd(&self) -> bool {
        false
    }
}

/// Open the right backend for a path.
///
/// DSD containers are detected by magic (`DSD ` / `FRM8`) as well as by
/// extension; WAV goes through hound with a symphonia fallback for
/// codings hound does not handle; everything else goes to symphonia.
pub fn open_reader(path: &Path) -> Result<Box<dyn FileReader>> {
    let magic = read_magic(path)?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    if &magic == b"DSD " || ext == "dsf" {
        return Ok(Box::new(DsfReader::open(path)?));
    }
    if &magic == b"FRM8" || ext == "dff" {
        return Ok(Box::new(DffReader::open(path)?));
    }
    if ext == "wav" || ext == "rf64" || &magic == b"RIFF" || &magic == b"RF64" {
        match WavFileReader::open(path) {
            Ok(reader) if reader.spec_supported() => return Ok(Box::new(reader)),
            _ => {}
        }
        // hound covers integer PCM and 32-bit float; 64-bit float and
        // RF64 go through the project's own parser.
        if let Ok(reader) = FloatFileReader::open(path) {
            return Ok(Box::new(reader));
        }
        return Ok(Box::new(SymphoniaReader::open(path)?));
    }
    Ok(Box::new(SymphoniaReader::open(path)?))
}

fn read_magic(path: &Path) -> Result<[u8; 4]> {
    let mut file = File::open(path).map_err(|e| Error::InputOpen {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let mut magic = [0u8; 4];
    // Tiny files simply fall through to extension dispatch.
    let _ = file.read(&mut magic).map_err(|e| Error::InputRead(e.to_string()))?;
    Ok(magic)
}

// ---------------------------------------------------------------------------
// WAV via hound
// ---------------------------------------------------------------------------

pub struct WavFileReader {
    path: PathBuf,
    reader: hound::WavReader<std::io::BufReader<File>>,
    spec: hound::WavSpec,
}

impl WavFileReader {
    pub fn open(path: &Path) -> Result<Self> {
        let reader = hound::WavReader::open(path).map_err(|e| Error::InputOpen {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let spec = reader.spec();
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            spec,
        })
    }

    /// Whether hound can decode this spec (it stops at 32-bit words).
    fn spec_supported(&self) -> bool {
        matches!(
            (self.spec.sample_format, self.spec.bits_per_sample),
            (hound::SampleFormat::Int, 8 | 16 | 24 | 32) | (hound::SampleFormat::Float, 32)
        )
    }
}

impl FileReader for WavFileReader {
    fn channels(&self) -> u16 {
        self.spec.channels
    }

    fn sample_rate(&self) -> u32 {
        self.spec.sample_rate
    }

    fn frames(&self) -> Option<u64> {
        Some(u64::from(self.reader.duration()))
    }

    fn read(&mut self, buf: &mut [f64]) -> Result<usize> {
        let count = match self.spec.sample_format {
            hound::SampleFormat::Float => {
                let mut n = 0;
                for (slot, sample) in buf.iter_mut().zip(self.reader.samples::<f32>()) {
                    *slot = f64::from(sample.map_err(|e| Error::InputRead(e.to_string()))?);
                    n += 1;
                }
                n
            }
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1i64 << (self.spec.bits_per_sample - 1)) as f64;
                let mut n = 0;
                for (slot, sample) in buf.iter_mut().zip(self.reader.samples::<i32>()) {
                    *slot =
                        f64::from(sample.map_err(|e| Error::InputRead(e.to_string()))?) * scale;
                    n += 1;
                }
                n
            }
        };
        Ok(count)
    }

    fn rewind(&mut self) -> Result<()> {
        self.reader = hound::WavReader::open(&self.path).map_err(|e| Error::InputOpen {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn sub_format(&self) -> Option<SubFormat> {
        match (self.spec.sample_format, self.spec.bits_per_sample) {
            (hound::SampleFormat::Int, 8) => Some(SubFormat::PcmU8),
            (hound::SampleFormat::Int, 16) => Some(SubFormat::Pcm16),
            (hound::SampleFormat::Int, 24) => Some(SubFormat::Pcm24),
            (hound::SampleFormat::Int, 32) => Some(SubFormat::Pcm32),
            (hound::SampleFormat::Float, 32) => Some(SubFormat::Float),
            (hound::SampleFormat::Float, 64) => Some(SubFormat::Double),
            _ => None,
        }
    }

    fn metadata(&self) -> MetaData {
        read_wav_metadata(&self.path)
    }

    fn describe(&self) -> String {
        let coding = match self.spec.sample_format {
            hound::SampleFormat::Float => "float",
            hound::SampleFormat::Int => "pcm",
        };
        format!("{}-bit {coding} wav", self.spec.bits_per_sample)
    }
}

// ---------------------------------------------------------------------------
// FLAC/AIFF/... via symphonia
// ---------------------------------------------------------------------------

pub struct SymphoniaReader {
    path: PathBuf,
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    channels: u16,
    sample_rate: u32,
    frames: Option<u64>,
    bits: Option<u32>,
    codec_name: String,
    metadata: MetaData,
    /// Decoded samples not yet handed out.
    pending: Vec<f64>,
    pending_pos: usize,
    eof: bool,
}

impl SymphoniaReader {
    pub fn open(path: &Path) -> Result<Self> {
        let open_err = |reason: String| Error::InputOpen {
            path: path.display().to_string(),
            reason,
        };

        let file = File::open(path).map_err(|e| open_err(e.to_string()))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let mut probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| open_err(format!("unrecognized format ({e})")))?;

        let mut metadata = MetaData::default();
        if let Some(rev) = probed.metadata.get().as_ref().and_then(|m| m.current()) {
            collect_tags(rev.tags(), &mut metadata);
        }
        if let Some(rev) = probed.format.metadata().current() {
            collect_tags(rev.tags(), &mut metadata);
        }

        let format = probed.format;
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| open_err("no audio track".into()))?;

        let params = &track.codec_params;
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| open_err("missing sample rate".into()))?;
        let channels = params
            .channels
            .map(|c| c.count() as u16)
            .ok_or_else(|| open_err("missing channel layout".into()))?;
        let frames = params.n_frames;
        let bits = params.bits_per_sample;
        let track_id = track.id;
        let codec_name = symphonia::default::get_codecs()
            .get_codec(params.codec)
            .map(|d| d.short_name.to_string())
            .unwrap_or_else(|| "unknown".into());

        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| open_err(format!("decoder unavailable ({e})")))?;

        Ok(Self {
            path: path.to_path_buf(),
            format,
            decoder,
            track_id,
            channels,
            sample_rate,
            frames,
            bits,
            codec_name,
            metadata,
            pending: Vec::new(),
            pending_pos: 0,
            eof: false,
        })
    }

    fn decode_more(&mut self) -> Result<()> {
        self.pending.clear();
        self.pending_pos = 0;
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.eof = true;
                    return Ok(());
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.eof = true;
                    return Ok(());
                }
                Err(e) => return Err(Error::InputRead(e.to_string())),
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    interleave_to_f64(&decoded, &mut self.pending);
                    if !self.pending.is_empty() {
                        return Ok(());
                    }
                }
                // Skip corrupt frames, as decoders are documented to allow.
                Err(SymphoniaError::DecodeError(_)) => continue,
                Err(e) => return Err(Error::InputRead(e.to_string())),
            }
        }
    }
}

impl FileReader for SymphoniaReader {
    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn frames(&self) -> Option<u64> {
        self.frames
    }

    fn read(&mut self, buf: &mut [f64]) -> Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            if self.pending_pos == self.pending.len() {
                if self.eof {
                    break;
                }
                self.decode_more()?;
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
        *self = Self::open(&self.path)?;
        Ok(())
    }

    fn sub_format(&self) -> Option<SubFormat> {
        match self.bits {
            Some(8) => Some(SubFormat::PcmS8),
            Some(16) => Some(SubFormat::Pcm16),
            Some(24) => Some(SubFormat::Pcm24),
            Some(32) => Some(SubFormat::Pcm32),
            _ => None,
        }
    }

    fn metadata(&self) -> MetaData {
        self.metadata.clone()
    }

    fn describe(&self) -> String {
        match self.bits {
            Some(bits) => format!("{bits}-bit {}", self.codec_name),
            None => self.codec_name.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Float WAV/RF64 via the project's own parser
// ---------------------------------------------------------------------------

/// Input backend for float WAV files beyond hound's reach: 64-bit float
/// sub-format and RF64 containers.
pub struct FloatFileReader {
    path: PathBuf,
    inner: crate::wav::FloatWavReader,
}

impl FloatFileReader {
    pub fn open(path: &Path) -> Result<Self> {
        let inner = crate::wav::FloatWavReader::open(path).map_err(|e| Error::InputOpen {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            inner,
        })
    }
}

impl FileReader for FloatFileReader {
    fn channels(&self) -> u16 {
        self.inner.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn frames(&self) -> Option<u64> {
        Some(self.inner.frames())
    }

    fn read(&mut self, buf: &mut [f64]) -> Result<usize> {
        self.inner.read(buf).map_err(input_read_err)
    }

    fn rewind(&mut self) -> Result<()> {
        self.inner.rewind().map_err(input_read_err)
    }

    fn sub_format(&self) -> Option<SubFormat> {
        Some(if self.inner.is_double() {
            SubFormat::Double
        } else {
            SubFormat::Float
        })
    }

    fn metadata(&self) -> MetaData {
        read_wav_metadata(&self.path)
    }

    fn describe(&self) -> String {
        format!(
            "{}-bit float wav",
            if self.inner.is_double() { 64 } else { 32 }
        )
    }
}

/// The float parser reports its errors as temp-file problems (its other
/// caller); re-label them for the input path.
fn input_read_err(e: Error) -> Error {
    match e {
        Error::TempFile(message) => Error::InputRead(message),
        other => other,
    }
}

fn collect_tags(tags: &[symphonia::core::meta::Tag], meta: &mut MetaData) {
    for tag in tags {
        let value = match &tag.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match tag.std_key {
            Some(StandardTagKey::TrackTitle) => meta.title = value,
            Some(StandardTagKey::Artist) => meta.artist = value,
            Some(StandardTagKey::Album) => meta.album = value,
            Some(StandardTagKey::Comment) => meta.comment = value,
            Some(StandardTagKey::Copyright) => meta.copyright = value,
            Some(StandardTagKey::Date) => meta.date = value,
            Some(StandardTagKey::Genre) => meta.genre = value,
            Some(StandardTagKey::License) => meta.license = value,
            Some(StandardTagKey::TrackNumber) => meta.track_number = value,
            Some(StandardTagKey::Encoder) => meta.software = value,
            _ => {}
        }
    }
}

fn interleave_to_f64(decoded: &AudioBufferRef<'_>, out: &mut Vec<f64>) {
    macro_rules! interleave {
        ($buf:expr, $convert:expr) => {{
            let buf = $buf;
            let channels = buf.spec().channels.count();
            let frames = buf.frames();
            out.reserve(frames * channels);
            for frame in 0..frames {
                for ch in 0..channels {
                    #[allow(clippy::redundant_closure_call)]
                    out.push($convert(buf.chan(ch)[frame]));
                }
            }
        }};
    }

    match decoded {
        AudioBufferRef::U8(buf) => interleave!(buf, |s: u8| (f64::from(s) - 128.0) / 128.0),
        AudioBufferRef::S8(buf) => interleave!(buf, |s: i8| f64::from(s) / 128.0),
        AudioBufferRef::U16(buf) => {
            interleave!(buf, |s: u16| (f64::from(s) - 32_768.0) / 32_768.0)
        }
        AudioBufferRef::S16(buf) => interleave!(buf, |s: i16| f64::from(s) / 32_768.0),
        AudioBufferRef::U24(buf) => interleave!(buf, |s: symphonia::core::sample::u24| {
            (f64::from(s.inner()) - 8_388_608.0) / 8_388_608.0
        }),
        AudioBufferRef::S24(buf) => interleave!(buf, |s: symphonia::core::sample::i24| {
            f64::from(s.inner()) / 8_388_608.0
        }),
        AudioBufferRef::U32(buf) => interleave!(buf, |s: u32| {
            (f64::from(s) - 2_147_483_648.0) / 2_147_483_648.0
        }),
        AudioBufferRef::S32(buf) => interleave!(buf, |s: i32| f64::from(s) / 2_147_483_648.0),
        AudioBufferRef::F32(buf) => interleave!(buf, |s: f32| f64::from(s)),
        AudioBufferRef::F64(buf) => interleave!(buf, |s: f64| s),
    }
}
