//! The conversion pipeline controller.
//!
//! Drives the whole job: peak pre-pass, gain derivation, the block loop
//! with per-channel fork-join resampling (pass A), the optional
//! float temp-file spill with a cheap gain/dither second pass (pass B),
//! and the clipping-protection retry protocol.
//!
//! Data flow per block: read interleaved -> de-interleave -> resample +
//! gain (+ dither when no temp file) per channel in parallel ->
//! re-interleave -> write. The first block drops the filter group delay;
//! after end of input, zeros are flushed until the output holds exactly
//! `ceil(frames_in * L / M)` frames.
//!
//! Progress and warnings go through the injected [`Reporter`]; the
//! library never prints.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rayon::prelude::*;

use remuestreo_core::{
    dither::headroom_factor, DitherProfile, Ditherer, FilterPhase, Fraction, Resampler,
    ResamplerSpec, Scalar, StageMode,
};

use crate::csv::{CsvFile, CsvSpec, IntegerScaling};
use crate::format::{
    determine_best_sub, needs_rf64, MajorFormat, SubFormat,
};
use crate::metadata::MetaData;
use crate::reader::{open_reader, FileReader};
use crate::wav::{FloatWavReader, WavWriter, WriterOptions};
use crate::{Error, Result};

/// Frames per block in the conversion loop.
pub const BLOCK_FRAMES: usize = 8192;

/// Safety factor applied to the peak-derived gain correction.
const CLIPPING_TRIM: f64 = 0.988;

/// Upper bound on clipping-protection retries.
const MAX_CLIPPING_ATTEMPTS: u32 = 5;

/// Progress/warning sink injected by the caller. Cancellation is polled
/// between blocks only.
pub trait Reporter: Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn progress(&self, percent: u32) {
        let _ = percent;
    }
    fn progress_done(&self) {}
    fn cancelled(&self) -> bool {
        false
    }
}

/// Reporter that swallows everything; used by tests and embedding.
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&self, _message: &str) {}
    fn warn(&self, _message: &str) {}
}

/// Immutable job description, built by the argument layer.
#[derive(Debug, Clone)]
pub struct ConversionInfo {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub output_rate: u32,

    /// Requested `-b` token, if any; resolved against the output
    /// extension and the input's own coding.
    pub bit_format_token: Option<String>,

    pub gain: f64,
    pub normalize: bool,
    pub normalize_amount: f64,
    /// Clipping ceiling; equals `normalize_amount` when normalizing.
    pub limit: f64,

    pub double_precision: bool,

    pub dither: bool,
    pub dither_amount: f64,
    pub dither_profile: DitherProfile,
    pub auto_blank: bool,
    pub seed: Option<u64>,

    pub min_phase: bool,
    /// Nominal cutoff as percent of the target Nyquist.
    pub lpf_cutoff_percent: f64,
    /// Transition width as percent of the target Nyquist.
    pub lpf_transition_percent: f64,

    pub single_stage: bool,
    pub max_stages: usize,
    pub show_stages: bool,

    pub multithreaded: bool,
    pub clipping_protection: bool,
    pub delay_trim: bool,

    pub use_temp_file: bool,
    pub show_temp_file: bool,
    pub temp_dir: Option<PathBuf>,

    pub force_rf64: bool,
    pub peak_chunk: bool,
    pub write_metadata: bool,

    pub flac_compression: Option<u32>,
    pub vorbis_quality: Option<f64>,

    pub quantize_bits: Option<u32>,
    pub csv_scaling: IntegerScaling,
}

impl ConversionInfo {
    /// Job with the stock defaults for everything but the three required
    /// parameters.
    pub fn new(
        input_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
        output_rate: u32,
    ) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
            output_rate,
            bit_format_token: None,
            gain: 1.0,
            normalize: false,
            normalize_amount: 1.0,
            limit: 1.0,
            double_precision: false,
            dither: false,
            dither_amount: 1.0,
            dither_profile: DitherProfile::default_for_rate(output_rate),
            auto_blank: false,
            seed: None,
            min_phase: false,
            lpf_cutoff_percent: 100.0 * (10.0 / 11.0),
            lpf_transition_percent: 100.0 - 100.0 * (10.0 / 11.0),
            single_stage: false,
            max_stages: 3,
            show_stages: false,
            multithreaded: false,
            clipping_protection: true,
            delay_trim: true,
            use_temp_file: true,
            show_temp_file: false,
            temp_dir: None,
            force_rf64: false,
            peak_chunk: true,
            write_metadata: true,
            flac_compression: None,
            vorbis_quality: None,
            quantize_bits: None,
            csv_scaling: IntegerScaling::Pow2Minus1,
        }
    }

    fn csv_output(&self) -> bool {
        extension_of(&self.output_path) == "csv"
    }
}

/// Outcome summary handed back to the caller.
#[derive(Debug, Clone)]
pub struct ConversionResult {
    pub frames_written: u64,
    pub peak_output: f64,
    pub clipping_retries: u32,
    pub channels: u16,
    pub output_rate: u32,
}

/// Run a conversion job, dispatching on pipeline precision.
pub fn convert(ci: &ConversionInfo, reporter: &dyn Reporter) -> Result<ConversionResult> {
    if ci.double_precision {
        run::<f64>(ci, reporter)
    } else {
        run::<f32>(ci, reporter)
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum SinkPlan {
    Wav {
        major: MajorFormat,
        sub: SubFormat,
        metadata: MetaData,
        peak_chunk: bool,
    },
    Csv {
        spec: CsvSpec,
    },
}

enum Sink {
    Wav(WavWriter),
    Csv(CsvFile),
}

impl Sink {
    fn create(
        plan: &SinkPlan,
        path: &Path,
        channels: u16,
        sample_rate: u32,
    ) -> Result<Self> {
        match plan {
            SinkPlan::Wav {
                major,
                sub,
                metadata,
                peak_chunk,
            } => {
                let mut writer = WavWriter::create(
                    path,
                    *major,
                    *sub,
                    channels,
                    sample_rate,
                    WriterOptions {
                        peak_chunk: *peak_chunk,
                    },
                )?;
                metadata.apply_to(&mut writer);
                Ok(Sink::Wav(writer))
            }
            SinkPlan::Csv { spec } => {
                Ok(Sink::Csv(CsvFile::create(path, channels as usize, *spec)?))
            }
        }
    }

    fn write(&mut self, samples: &[f64]) -> Result<()> {
        match self {
            Sink::Wav(w) => w.write_samples(samples),
            Sink::Csv(c) => c.write_samples(samples),
        }
    }

    /// Prepare for a rewrite pass: WAV rewinds in place, CSV starts over.
    fn restart(
        self,
        plan: &SinkPlan,
        path: &Path,
        channels: u16,
        sample_rate: u32,
    ) -> Result<Self> {
        match self {
            Sink::Wav(mut w) => {
                w.rewind()?;
                Ok(Sink::Wav(w))
            }
            Sink::Csv(_) => Sink::create(plan, path, channels, sample_rate),
        }
    }

    fn finalize(self) -> Result<()> {
        match self {
            Sink::Wav(w) => w.finalize(),
            Sink::Csv(c) => c.finalize(),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-channel state
// ---------------------------------------------------------------------------

struct ChannelState<T: Scalar> {
    resampler: Resampler<T>,
    ditherer: Ditherer<T>,
    in_buf: Vec<T>,
    out_buf: Vec<T>,
    produced: usize,
    peak: T,
}

impl<T: Scalar> ChannelState<T> {
    /// Resample the channel's input slice, apply gain, optionally dither,
    /// and track the local peak (the channel-worker step).
    fn run_block(&mut self, gain: T, dither_now: bool) {
        self.produced = {
            let (resampler, in_buf, out_buf) = (&mut self.resampler, &self.in_buf, &mut self.out_buf);
            resampler.process(in_buf, out_buf)
        };
        let mut local_peak = T::ZERO;
        for slot in self.out_buf.iter_mut() {
            let mut sample = *slot * gain;
            if dither_now {
                sample = self.ditherer.dither(sample);
            }
            local_peak = local_peak.max_value(sample.abs());
            *slot = sample;
        }
        self.peak = local_peak;
    }

    fn reset(&mut self) {
        self.resampler.reset();
        self.ditherer.reset();
    }
}

// ---------------------------------------------------------------------------
// The pipeline
// ---------------------------------------------------------------------------

fn run<T: Scalar>(ci: &ConversionInfo, reporter: &dyn Reporter) -> Result<ConversionResult> {
    let mut reader = open_reader(&ci.input_path)?;
    let channels = reader.channels();
    let input_rate = reader.sample_rate();
    if channels == 0 {
        return Err(Error::InputRead("input reports zero channels".into()));
    }

    let fraction = Fraction::from_rates(input_rate, ci.output_rate)?;
    reporter.info(&format!(
        "input: {}, {} channel{} at {} Hz",
        reader.describe(),
        channels,
        if channels == 1 { "" } else { "s" },
        input_rate
    ));
    reporter.info(&format!(
        "conversion ratio: {:.6} ({})",
        fraction.ratio(),
        fraction
    ));

    // Peak pre-pass (skipped for DSD); also pins down the frame count for
    // containers that do not declare one.
    let dsd = reader.is_dsd();
    let (peak_in, input_frames) = if dsd {
        let assumed = if ci.normalize { 0.5 } else { 1.0 };
        let frames = reader.frames().unwrap_or(0);
        (assumed, frames)
    } else {
        reporter.info("scanning input for peaks ...");
        let scan = scan_input(reader.as_mut(), channels)?;
        reporter.info(&format!(
            "peak input sample: {:.6} ({:.2} dBFS) at {}",
            scan.peak,
            dbfs(scan.peak),
            format_position(scan.peak_frame, input_rate)
        ));
        reader.rewind()?;
        (scan.peak, scan.frames)
    };

    if ci.normalize {
        reporter.info(&format!("normalizing to {:.2}", ci.limit));
    }

    // Filter settings echo.
    let target_nyquist = 0.5 * f64::from(input_rate.min(ci.output_rate));
    let transition_hz = target_nyquist * ci.lpf_cutoff_percent / 100.0;
    reporter.info(&format!(
        "lpf transition frequency: {transition_hz:.2} Hz ({:.2} %)",
        ci.lpf_cutoff_percent
    ));
    if ci.min_phase {
        reporter.info("using minimum-phase filters");
    }

    // Output format resolution.
    let metadata = if ci.write_metadata {
        reader.metadata()
    } else {
        MetaData::default()
    };
    let (plan, signal_bits) = resolve_output(ci, reader.as_ref(), fraction, input_frames, &metadata, reporter)?;

    if ci.dither {
        reporter.info(&format!(
            "generating {:.2} bits of {} dither for {}-bit output",
            ci.dither_amount,
            ci.dither_profile.name(),
            signal_bits
        ));
        if ci.auto_blank {
            reporter.info("auto-blanking enabled");
        }
    }

    // Per-channel DSP state.
    let spec = ResamplerSpec {
        fraction,
        input_rate,
        output_rate: ci.output_rate,
        cutoff: ci.lpf_cutoff_percent / 100.0,
        transition: ci.lpf_transition_percent / 100.0,
        phase: if ci.min_phase {
            FilterPhase::Minimum
        } else {
            FilterPhase::Linear
        },
        mode: if ci.single_stage {
            StageMode::Single
        } else {
            StageMode::Multi {
                max_stages: ci.max_stages,
            }
        },
        attenuation_db: remuestreo_core::resampler::DEFAULT_ATTENUATION_DB,
    };

    let seed_base = ci.seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    });

    let mut states: Vec<ChannelState<T>> = Vec::with_capacity(channels as usize);
    for ch in 0..channels {
        let resampler = Resampler::<T>::new(&spec, BLOCK_FRAMES)?;
        let ditherer = Ditherer::<T>::new(
            signal_bits,
            ci.dither_amount,
            ci.dither_profile,
            ci.auto_blank,
            seed_base.wrapping_add(u64::from(ch)),
        );
        let out_cap = resampler.max_output_len(BLOCK_FRAMES);
        states.push(ChannelState {
            resampler,
            ditherer,
            in_buf: Vec::with_capacity(BLOCK_FRAMES),
            out_buf: Vec::with_capacity(out_cap),
            produced: 0,
            peak: T::ZERO,
        });
    }

    if ci.show_stages {
        for (i, stage) in states[0].resampler.stage_plans().iter().enumerate() {
            reporter.info(&format!(
                "stage {}: {}:{} with {} taps ({:.0} Hz -> {:.0} Hz)",
                i + 1,
                stage.l,
                stage.m,
                stage.taps,
                stage.input_rate,
                stage.output_rate
            ));
        }
    }

    // Gain derivation.
    let safe_peak_in = if peak_in > 0.0 { peak_in } else { 1.0 };
    let mut gain = ci.gain
        * states[0].resampler.gain()
        * fraction.numerator as f64
        * if ci.normalize {
            ci.limit / safe_peak_in
        } else {
            ci.limit
        };
    if ci.dither {
        gain *= headroom_factor(signal_bits, ci.dither_amount);
    }

    let group_delay = states[0].resampler.group_delay();
    let expected_frames = input_frames * fraction.numerator / fraction.denominator
        + u64::from(input_frames * fraction.numerator % fraction.denominator != 0);

    // Temp spill decision; failure downgrades with a warning.
    let mut temp = None;
    if ci.use_temp_file {
        match TempSpill::new(ci, &plan, channels) {
            Ok(spill) => {
                if ci.show_temp_file {
                    reporter.info(&format!("temp file: {}", spill.path().display()));
                }
                temp = Some(spill);
            }
            Err(e) => {
                reporter.warn(&format!("{e}; disabling temp file mode"));
            }
        }
    }
    let use_temp = temp.is_some();

    reporter.info(&format!(
        "converting ({}{}) ...",
        if ci.single_stage {
            "single-stage"
        } else {
            "multi-stage"
        },
        if ci.multithreaded {
            ", multi-threaded"
        } else {
            ""
        }
    ));

    // Attempt loop. With a temp file, pass A runs once and retries repeat
    // only the cheap pass B; without one, a retry repeats the whole
    // conversion.
    let mut retries = 0u32;
    let final_peak;
    let frames_written;

    let mut sink = Sink::create(&plan, &ci.output_path, channels, ci.output_rate)?;

    if use_temp {
        let mut spill = temp.expect("temp spill verified above");
        let stats = pass_a(
            ci,
            reader.as_mut(),
            &mut states,
            SinkRef::Temp(&mut spill),
            T::from_f64(gain),
            group_delay,
            expected_frames,
            input_frames,
            channels,
            reporter,
            false,
        )?;
        reporter.info(&format!(
            "peak resampled sample: {:.6} ({:.2} dBFS)",
            stats.peak,
            dbfs(stats.peak)
        ));

        let mut temp_reader = spill.into_reader()?;
        // Output starts at unity gain relative to the spill.
        let mut pass_gain = 1.0f64;
        loop {
            reporter.info("writing to output file ...");
            temp_reader.reader.rewind()?;
            let stats = pass_b(
                ci,
                &mut temp_reader.reader,
                &mut states,
                &mut sink,
                T::from_f64(pass_gain),
                channels,
                reporter,
            )?;
            reporter.info(&format!(
                "peak output sample: {:.6} ({:.2} dBFS)",
                stats.peak,
                dbfs(stats.peak)
            ));

            if ci.clipping_protection && stats.peak > ci.limit && retries < MAX_CLIPPING_ATTEMPTS {
                retries += 1;
                let adjustment = CLIPPING_TRIM * ci.limit / stats.peak;
                pass_gain *= adjustment;
                reporter.info(&format!(
                    "clipping detected; adjusting gain by {:.2} dB",
                    dbfs(adjustment)
                ));
                for state in states.iter_mut() {
                    state.ditherer.adjust_gain(T::from_f64(adjustment));
                    state.ditherer.reset();
                }
                sink = sink.restart(&plan, &ci.output_path, channels, ci.output_rate)?;
                continue;
            }

            final_peak = stats.peak;
            frames_written = stats.frames;
            break;
        }
    } else {
        let mut pass_gain = gain;
        loop {
            let stats = pass_a(
                ci,
                reader.as_mut(),
                &mut states,
                SinkRef::Final(&mut sink),
                T::from_f64(pass_gain),
                group_delay,
                expected_frames,
                input_frames,
                channels,
                reporter,
                ci.dither,
            )?;
            reporter.info(&format!(
                "peak output sample: {:.6} ({:.2} dBFS)",
                stats.peak,
                dbfs(stats.peak)
            ));

            if ci.clipping_protection && stats.peak > ci.limit && retries < MAX_CLIPPING_ATTEMPTS {
                retries += 1;
                let adjustment = CLIPPING_TRIM * ci.limit / stats.peak;
                pass_gain *= adjustment;
                reporter.info(&format!(
                    "clipping detected; re-running with {:.2} dB gain adjustment",
                    dbfs(adjustment)
                ));
                for state in states.iter_mut() {
                    state.ditherer.adjust_gain(T::from_f64(adjustment));
                    state.reset();
                }
                reader.rewind()?;
                sink = sink.restart(&plan, &ci.output_path, channels, ci.output_rate)?;
                continue;
            }

            final_peak = stats.peak;
            frames_written = stats.frames;
            break;
        }
    }

    if ci.clipping_protection && final_peak > ci.limit {
        reporter.warn(&format!(
            "clipping remains after {retries} gain adjustments; output peak {final_peak:.6}"
        ));
    }

    sink.finalize()?;
    reporter.progress_done();

    Ok(ConversionResult {
        frames_written,
        peak_output: final_peak,
        clipping_retries: retries,
        channels,
        output_rate: ci.output_rate,
    })
}

// ---------------------------------------------------------------------------
// Passes
// ---------------------------------------------------------------------------

struct PassStats {
    peak: f64,
    frames: u64,
}

enum SinkRef<'a> {
    Final(&'a mut Sink),
    Temp(&'a mut TempSpill),
}

impl SinkRef<'_> {
    fn write(&mut self, samples: &[f64]) -> Result<()> {
        match self {
            SinkRef::Final(sink) => sink.write(samples),
            SinkRef::Temp(spill) => spill.writer.write_samples(samples),
        }
    }
}

/// Pass A: the resampling pass. Reads the input to EOF, converts every
/// channel per block (in parallel when asked to), interleaves, and writes
/// to the final sink or the temp spill. Drops `group_delay` leading
/// frames and flushes zeros at EOF until `expected_frames` frames exist.
#[allow(clippy::too_many_arguments)]
fn pass_a<T: Scalar>(
    ci: &ConversionInfo,
    reader: &mut dyn FileReader,
    states: &mut [ChannelState<T>],
    mut sink: SinkRef<'_>,
    gain: T,
    group_delay: usize,
    expected_frames: u64,
    input_frames: u64,
    channels: u16,
    reporter: &dyn Reporter,
    dither_now: bool,
) -> Result<PassStats> {
    let nch = channels as usize;
    let mut input_block = vec![0.0f64; BLOCK_FRAMES * nch];
    let mut output_block: Vec<f64> = Vec::new();

    let mut peak = 0.0f64;
    let mut skip_frames = if ci.delay_trim { group_delay as u64 } else { 0 };
    let target_frames = if ci.delay_trim {
        expected_frames
    } else {
        u64::MAX
    };
    let mut written_frames = 0u64;
    let mut read_frames = 0u64;

    let progress_step = (input_frames / 10).max(1);
    let mut next_progress = progress_step;

    loop {
        if reporter.cancelled() {
            return Err(Error::Cancelled);
        }
        let samples_read = reader.read(&mut input_block)?;
        if samples_read == 0 {
            break;
        }
        let frames = samples_read / nch;
        read_frames += frames as u64;

        deinterleave(&input_block[..samples_read], states, nch);
        run_channels(states, gain, dither_now, ci.multithreaded);

        let produced = gather(states, &mut output_block, nch, &mut peak);
        write_skipping(&mut sink, &output_block[..produced * nch], &mut skip_frames, &mut written_frames, target_frames, nch)?;

        if read_frames >= next_progress {
            let percent = (100 * read_frames / input_frames.max(1)).min(99) as u32;
            reporter.progress(percent);
            next_progress += progress_step;
        }
    }

    // Flush the kernel tail with zero input until the output is whole.
    if ci.delay_trim {
        let zero_block = vec![T::ZERO; BLOCK_FRAMES.min(1024)];
        let mut guard = 0;
        while written_frames < target_frames {
            guard += 1;
            if guard > 100_000 {
                return Err(Error::OutputWrite(
                    "tail flush failed to converge".into(),
                ));
            }
            for state in states.iter_mut() {
                state.in_buf.clear();
                state.in_buf.extend_from_slice(&zero_block);
            }
            run_channels(states, gain, dither_now, ci.multithreaded);
            let produced = gather(states, &mut output_block, nch, &mut peak);
            if produced == 0 {
                continue;
            }
            write_skipping(&mut sink, &output_block[..produced * nch], &mut skip_frames, &mut written_frames, target_frames, nch)?;
        }
    }

    Ok(PassStats {
        peak,
        frames: written_frames,
    })
}

/// Pass B: gain, dither, and peak detection over the temp spill. Strictly
/// sequential.
fn pass_b<T: Scalar>(
    ci: &ConversionInfo,
    temp: &mut FloatWavReader,
    states: &mut [ChannelState<T>],
    sink: &mut Sink,
    gain: T,
    channels: u16,
    reporter: &dyn Reporter,
) -> Result<PassStats> {
    let nch = channels as usize;
    let mut block = vec![0.0f64; BLOCK_FRAMES * nch];
    let mut peak = 0.0f64;
    let mut frames = 0u64;

    loop {
        if reporter.cancelled() {
            return Err(Error::Cancelled);
        }
        let n = temp.read(&mut block)?;
        if n == 0 {
            break;
        }
        for (i, slot) in block[..n].iter_mut().enumerate() {
            let ch = i % nch;
            let mut sample = T::from_f64(*slot) * gain;
            if ci.dither {
                sample = states[ch].ditherer.dither(sample);
            }
            let value = sample.to_f64();
            peak = peak.max(value.abs());
            *slot = value;
        }
        sink.write(&block[..n])?;
        frames += (n / nch) as u64;
    }

    Ok(PassStats { peak, frames })
}

fn deinterleave<T: Scalar>(input: &[f64], states: &mut [ChannelState<T>], nch: usize) {
    for (ch, state) in states.iter_mut().enumerate() {
        state.in_buf.clear();
        state
            .in_buf
            .extend(input.iter().skip(ch).step_by(nch).map(|&x| T::from_f64(x)));
    }
}

fn run_channels<T: Scalar>(states: &mut [ChannelState<T>], gain: T, dither_now: bool, parallel: bool) {
    if parallel && states.len() > 1 {
        states
            .par_iter_mut()
            .for_each(|state| state.run_block(gain, dither_now));
    } else {
        for state in states.iter_mut() {
            state.run_block(gain, dither_now);
        }
    }
}

/// Interleave per-channel outputs into `out`; returns the frame count.
fn gather<T: Scalar>(
    states: &[ChannelState<T>],
    out: &mut Vec<f64>,
    nch: usize,
    peak: &mut f64,
) -> usize {
    let produced = states[0].produced;
    debug_assert!(states.iter().all(|s| s.produced == produced));
    for state in states {
        *peak = peak.max(state.peak.to_f64());
    }

    out.clear();
    out.resize(produced * nch, 0.0);
    for (ch, state) in states.iter().enumerate() {
        for (frame, &sample) in state.out_buf.iter().enumerate() {
            out[frame * nch + ch] = sample.to_f64();
        }
    }
    produced
}

/// Write frames, honoring the leading group-delay skip and the expected
/// total frame count.
fn write_skipping(
    sink: &mut SinkRef<'_>,
    samples: &[f64],
    skip_frames: &mut u64,
    written_frames: &mut u64,
    target_frames: u64,
    nch: usize,
) -> Result<()> {
    let mut start = 0usize;
    let frames = (samples.len() / nch) as u64;
    if *skip_frames > 0 {
        let skipped = (*skip_frames).min(frames);
        start = skipped as usize * nch;
        *skip_frames -= skipped;
    }
    if start >= samples.len() {
        return Ok(());
    }
    let available = ((samples.len() - start) / nch) as u64;
    let allowed = available.min(target_frames.saturating_sub(*written_frames));
    if allowed == 0 {
        return Ok(());
    }
    let end = start + allowed as usize * nch;
    sink.write(&samples[start..end])?;
    *written_frames += allowed;
    Ok(())
}

// ---------------------------------------------------------------------------
// Peak pre-pass
// ---------------------------------------------------------------------------

struct ScanResult {
    peak: f64,
    peak_frame: u64,
    frames: u64,
}

fn scan_input(reader: &mut dyn FileReader, channels: u16) -> Result<ScanResult> {
    let nch = channels as usize;
    let mut block = vec![0.0f64; BLOCK_FRAMES * nch];
    let mut peak = 0.0f64;
    let mut peak_sample = 0u64;
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut block)?;
        if n == 0 {
            break;
        }
        for (i, &x) in block[..n].iter().enumerate() {
            if x.abs() > peak {
                peak = x.abs();
                peak_sample = total + i as u64;
            }
        }
        total += n as u64;
    }

    Ok(ScanResult {
        peak,
        peak_frame: peak_sample / nch as u64,
        frames: total / nch as u64,
    })
}

// ---------------------------------------------------------------------------
// Output resolution
// ---------------------------------------------------------------------------

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

/// Decide the concrete output plan and the word length the ditherer
/// targets, mirroring the extension/token/input-sub resolution rules.
fn resolve_output(
    ci: &ConversionInfo,
    reader: &dyn FileReader,
    fraction: Fraction,
    input_frames: u64,
    metadata: &MetaData,
    reporter: &dyn Reporter,
) -> Result<(SinkPlan, u32)> {
    if ci.csv_output() {
        reporter.info("outputting to csv format");
        // Dither word length: the parsed token's width when one is
        // given; otherwise the input's own coding drives the depth
        // table, since CSV has no sub-format of its own.
        let input_bits = reader
            .sub_format()
            .map(|s| s.dither_bits())
            .unwrap_or(16);
        let (mut spec, native) = match &ci.bit_format_token {
            None => (CsvSpec::default(), input_bits),
            Some(token) => match CsvSpec::parse(token) {
                Some(spec) => (spec, spec.bits.min(53)),
                None => {
                    reporter.warn(&format!(
                        "bit format '{token}' not recognised, using defaults"
                    ));
                    (CsvSpec::default(), input_bits)
                }
            },
        };
        spec.scaling = ci.csv_scaling;
        let bits = quantized_bits(ci, native);
        return Ok((SinkPlan::Csv { spec }, bits));
    }

    let out_ext = extension_of(&ci.output_path);
    let mut major = match MajorFormat::from_extension(&out_ext) {
        Some(m) => m,
        None => {
            reporter.warn(&format!(
                "unknown output extension '{out_ext}', writing wav data"
            ));
            MajorFormat::Wav
        }
    };

    let input_sub = reader.sub_format();
    let sub = match &ci.bit_format_token {
        Some(token) => match SubFormat::from_token(token, major) {
            Some(sub) if major.valid_subs().contains(&sub) => {
                reporter.info(&format!("output bit format: {}", sub.token()));
                sub
            }
            Some(sub) => {
                let fallback = input_sub
                    .map(|s| determine_best_sub(s, major))
                    .unwrap_or_else(|| major.default_sub());
                reporter.warn(&format!(
                    "bit format '{}' is not valid for {} output, using '{}'",
                    sub.token(),
                    major.name(),
                    fallback.token()
                ));
                fallback
            }
            None => {
                let fallback = input_sub
                    .map(|s| determine_best_sub(s, major))
                    .unwrap_or_else(|| major.default_sub());
                reporter.warn(&format!(
                    "bit format '{token}' not recognised, using '{}'",
                    fallback.token()
                ));
                fallback
            }
        },
        None => {
            let sub = input_sub
                .map(|s| determine_best_sub(s, major))
                .unwrap_or_else(|| major.default_sub());
            if input_sub != Some(sub) {
                reporter.info(&format!("defaulting to bit format '{}'", sub.token()));
            }
            sub
        }
    };

    // RF64 promotion for the WAV family.
    if major.is_wav_family() {
        let promote = ci.force_rf64
            || needs_rf64(input_frames * u64::from(reader.channels()), sub, fraction);
        if promote && major != MajorFormat::Rf64 {
            reporter.info("switching to rf64 format");
            major = MajorFormat::Rf64;
        }
    } else {
        if ci.flac_compression.is_some() || ci.vorbis_quality.is_some() {
            reporter.warn("compression settings apply only to formats this build cannot encode");
        }
        return Err(Error::UnsupportedFormat(format!(
            "cannot encode '{}' output; supported containers: wav, rf64, csv",
            major.name()
        )));
    }

    if ci.flac_compression.is_some() || ci.vorbis_quality.is_some() {
        reporter.warn("flac/vorbis settings have no effect on wav output");
    }
    if ci.write_metadata && !metadata.is_empty() {
        reporter.info("copying metadata");
        if metadata.has_bext() {
            reporter.info("input carries a broadcast extension (bext) chunk");
        }
    }

    let bits = quantized_bits(ci, sub.dither_bits());
    Ok((
        SinkPlan::Wav {
            major,
            sub,
            metadata: metadata.clone(),
            peak_chunk: ci.peak_chunk,
        },
        bits,
    ))
}

fn quantized_bits(ci: &ConversionInfo, native: u32) -> u32 {
    match ci.quantize_bits {
        Some(q) => q.clamp(1, native.max(1)),
        None => native,
    }
}

// ---------------------------------------------------------------------------
// Temp spill
// ---------------------------------------------------------------------------

struct TempSpill {
    /// Owns the file on disk; dropping it deletes the spill.
    handle: tempfile::TempPath,
    writer: WavWriter,
}

struct TempReader {
    #[allow(dead_code)]
    handle: tempfile::TempPath,
    reader: FloatWavReader,
}

impl TempSpill {
    fn new(ci: &ConversionInfo, plan: &SinkPlan, channels: u16) -> Result<Self> {
        let double = ci.double_precision;
        let builder = match &ci.temp_dir {
            Some(dir) => tempfile::Builder::new()
                .prefix("remuestreo")
                .suffix(".wav")
                .tempfile_in(dir),
            None => tempfile::Builder::new()
                .prefix("remuestreo")
                .suffix(".wav")
                .tempfile(),
        };
        let handle = builder
            .map_err(|e| Error::TempFile(e.to_string()))?
            .into_temp_path();

        // Inherit rf64-ness from the output so a >4 GB spill stays legal.
        let major = match plan {
            SinkPlan::Wav {
                major: MajorFormat::Rf64,
                ..
            } => MajorFormat::Rf64,
            _ => MajorFormat::Wav,
        };
        let sub = if double {
            SubFormat::Double
        } else {
            SubFormat::Float
        };
        let writer = WavWriter::create(
            &handle,
            major,
            sub,
            channels,
            ci.output_rate,
            WriterOptions { peak_chunk: false },
        )
        .map_err(|e| Error::TempFile(e.to_string()))?;

        Ok(Self { handle, writer })
    }

    fn path(&self) -> &Path {
        &self.handle
    }

    fn into_reader(self) -> Result<TempReader> {
        let path = self.handle.to_path_buf();
        self.writer.finalize()?;
        Ok(TempReader {
            reader: FloatWavReader::open(&path)?,
            handle: self.handle,
        })
    }
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

fn dbfs(value: f64) -> f64 {
    20.0 * value.max(1e-30).log10()
}

fn format_position(frame: u64, rate: u32) -> String {
    let seconds = frame as f64 / f64::from(rate.max(1));
    let h = (seconds / 3600.0) as u64;
    let m = ((seconds - h as f64 * 3600.0) / 60.0) as u64;
    let s = seconds - h as f64 * 3600.0 - m as f64 * 60.0;
    format!("{h}:{m:02}:{s:06.3}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_formatting() {
        assert_eq!(format_position(0, 44_100), "0:00:00.000");
        assert_eq!(format_position(44_100, 44_100), "0:00:01.000");
        assert_eq!(format_position(44_100 * 3_661, 44_100), "1:01:01.000");
    }

    #[test]
    fn dbfs_of_full_scale_is_zero() {
        assert!(dbfs(1.0).abs() < 1e-9);
        assert!((dbfs(0.5) + 6.0206).abs() < 1e-3);
    }

    #[test]
    fn quantize_caps_below_native_depth() {
        let mut ci = ConversionInfo::new("a.wav", "b.wav", 48_000);
        assert_eq!(quantized_bits(&ci, 24), 24);
        ci.quantize_bits = Some(12);
        assert_eq!(quantized_bits(&ci, 24), 12);
        ci.quantize_bits = Some(99);
        assert_eq!(quantized_bits(&ci, 24), 24);
        ci.quantize_bits = Some(0);
        assert_eq!(quantized_bits(&ci, 24), 1);
    }

    #[test]
    fn csv_detection_follows_extension() {
        assert!(ConversionInfo::new("a.wav", "b.csv", 48_000).csv_output());
        assert!(!ConversionInfo::new("a.wav", "b.wav", 48_000).csv_output());
    }
}
