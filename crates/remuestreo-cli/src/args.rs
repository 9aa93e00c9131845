//! Command-line surface and its translation into a [`ConversionInfo`].
//!
//! Flag spellings keep their historical mixed-case forms and carry
//! lowercase and hyphenated aliases, so `--flat-tpdf`, `--flattpdf`,
//! `--maxStages` and `--max-stages` all work.
//!
//! Out-of-range values are clamped rather than rejected (compression
//! levels, stage counts, filter percentages), matching the tool's
//! permissive tradition; only missing/contradictory essentials are hard
//! errors.

use std::path::PathBuf;

use clap::Parser;

use remuestreo_core::DitherProfile;
use remuestreo_io::csv::IntegerScaling;
use remuestreo_io::engine::ConversionInfo;

#[derive(Parser, Debug)]
#[command(
    name = "remuestreo",
    version,
    about = "Offline audio sample-rate converter",
    long_about = "Converts audio files between sample rates with band-limited polyphase \
                  filtering, optional normalization, and noise-shaped dither."
)]
pub struct Cli {
    /// Input audio file
    #[arg(short = 'i', value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// Output audio file (.csv extension selects CSV output)
    #[arg(short = 'o', value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output sample rate in Hz
    #[arg(short = 'r', value_name = "RATE")]
    pub rate: Option<u32>,

    /// Output bit format (8|16|24|32|32f|64f|u8|s8; CSV also [us]<n>[fiox])
    #[arg(short = 'b', value_name = "FORMAT")]
    pub bit_format: Option<String>,

    /// Output gain multiplier
    #[arg(long, value_name = "G", default_value_t = 1.0)]
    pub gain: f64,

    /// Normalize to the given level (0 < level <= 1)
    #[arg(short = 'n', value_name = "LEVEL", num_args = 0..=1, default_missing_value = "1.0")]
    pub normalize: Option<f64>,

    /// Dither with the given amplitude in bits RMS
    #[arg(long, value_name = "BITS", num_args = 0..=1, default_missing_value = "1.0")]
    pub dither: Option<f64>,

    /// Noise-shaping profile id (see --showDitherProfiles)
    #[arg(long, value_name = "ID", allow_negative_numbers = true)]
    pub ns: Option<i32>,

    /// Use flat TPDF dither regardless of --ns
    #[arg(long = "flat-tpdf", aliases = ["flattpdf", "flatTPDF"])]
    pub flat_tpdf: bool,

    /// Mute dither during sustained input silence
    #[arg(long, alias = "auto-blank")]
    pub autoblank: bool,

    /// Dither PRNG seed (per-channel seeds derive from it)
    #[arg(long, value_name = "N")]
    pub seed: Option<u64>,

    /// Run the pipeline in 64-bit floats
    #[arg(long = "doubleprecision", aliases = ["double-precision", "doublePrecision"])]
    pub double_precision: bool,

    /// Minimum-phase conversion filters
    #[arg(long = "minphase", alias = "min-phase")]
    pub min_phase: bool,

    /// Filter cutoff as percent of the target Nyquist
    #[arg(long = "lpf-cutoff", alias = "lpfcutoff", value_name = "PERCENT")]
    pub lpf_cutoff: Option<f64>,

    /// Filter transition width as percent of the target Nyquist
    #[arg(long = "lpf-transition", alias = "lpftransition", value_name = "PERCENT")]
    pub lpf_transition: Option<f64>,

    /// Late cutoff with a double-width transition band
    #[arg(long = "relaxedLPF", aliases = ["relaxedlpf", "relaxed-lpf"])]
    pub relaxed_lpf: bool,

    /// Late cutoff with a steep transition band
    #[arg(long = "steepLPF", aliases = ["steeplpf", "steep-lpf"])]
    pub steep_lpf: bool,

    /// Convert channels in parallel
    #[arg(long)]
    pub mt: bool,

    /// Force a single conversion stage
    #[arg(long = "singleStage", aliases = ["singlestage", "single-stage"])]
    pub single_stage: bool,

    /// Allow multi-stage conversion (the default)
    #[arg(long = "multiStage", aliases = ["multistage", "multi-stage"])]
    pub multi_stage: bool,

    /// Stage budget for multi-stage conversion (1-10)
    #[arg(long = "maxStages", aliases = ["maxstages", "max-stages"], value_name = "N")]
    pub max_stages: Option<u32>,

    /// Print the planned stage cascade
    #[arg(long = "showStages", aliases = ["showstages", "show-stages"])]
    pub show_stages: bool,

    /// Keep the clipped result instead of retrying at lower gain
    #[arg(long = "noClippingProtection", aliases = ["noclippingprotection", "no-clipping-protection"])]
    pub no_clipping_protection: bool,

    /// Convert directly instead of spilling to a temp file
    #[arg(long = "noTempFile", aliases = ["notempfile", "no-temp-file"])]
    pub no_temp_file: bool,

    /// Print the temp file path
    #[arg(long = "showTempFile", aliases = ["showtempfile", "show-temp-file"])]
    pub show_temp_file: bool,

    /// Directory for the temp file (default: the OS temp dir)
    #[arg(long = "tempDir", aliases = ["tempdir", "temp-dir"], value_name = "DIR")]
    pub temp_dir: Option<PathBuf>,

    /// Force RF64 output regardless of predicted size
    #[arg(long)]
    pub rf64: bool,

    /// Skip the PEAK chunk on float output
    #[arg(long = "noPeakChunk", aliases = ["nopeakchunk", "no-peak-chunk"])]
    pub no_peak_chunk: bool,

    /// Do not copy metadata to the output
    #[arg(long = "noMetadata", aliases = ["nometadata", "no-metadata"])]
    pub no_metadata: bool,

    /// Keep the filter's leading delay and tail untrimmed
    #[arg(long = "noDelayTrim", aliases = ["nodelaytrim", "no-delay-trim"])]
    pub no_delay_trim: bool,

    /// FLAC compression level 0-8 (formats this build cannot encode)
    #[arg(long = "flacCompression", aliases = ["flaccompression", "flac-compression"], value_name = "LEVEL")]
    pub flac_compression: Option<i64>,

    /// Vorbis quality -1..10 (formats this build cannot encode)
    #[arg(long = "vorbisQuality", aliases = ["vorbisquality", "vorbis-quality"], value_name = "Q", allow_negative_numbers = true)]
    pub vorbis_quality: Option<f64>,

    /// Cap the output word length below the format's native depth
    #[arg(long = "quantize-bits", aliases = ["quantizebits", "quantizeBits"], value_name = "N")]
    pub quantize_bits: Option<u32>,

    /// CSV integers scale by 2^(B-1) with clamping instead of 2^(B-1)-1
    #[arg(long = "pow2clip", alias = "pow2-clip")]
    pub pow2clip: bool,

    /// Print the compiler used to build this binary
    #[arg(long)]
    pub compiler: bool,

    /// Print the codec backends compiled in
    #[arg(long = "codec-version", aliases = ["codecversion", "codecVersion"])]
    pub codec_version: bool,

    /// List valid sub-formats for a file extension
    #[arg(long = "listsubformats", alias = "list-subformats", value_name = "EXT")]
    pub listsubformats: Option<String>,

    /// List the dither noise-shaping profiles
    #[arg(long = "showDitherProfiles", aliases = ["showditherprofiles", "show-dither-profiles"])]
    pub show_dither_profiles: bool,

    /// Write an exponential sweep test signal and exit
    #[arg(long, value_name = "FILE")]
    pub generate: Option<PathBuf>,
}

/// Informational actions that run instead of a conversion.
pub enum GlobalAction {
    Compiler,
    CodecVersion,
    ListSubFormats(String),
    ShowDitherProfiles,
    Generate(PathBuf),
}

impl Cli {
    pub fn global_action(&self) -> Option<GlobalAction> {
        if self.compiler {
            Some(GlobalAction::Compiler)
        } else if self.codec_version {
            Some(GlobalAction::CodecVersion)
        } else if let Some(ext) = &self.listsubformats {
            Some(GlobalAction::ListSubFormats(ext.clone()))
        } else if self.show_dither_profiles {
            Some(GlobalAction::ShowDitherProfiles)
        } else if let Some(path) = &self.generate {
            Some(GlobalAction::Generate(path.clone()))
        } else {
            None
        }
    }

    /// Validate and translate into a job description. Returns the job
    /// plus any notices to surface before conversion starts.
    pub fn into_conversion_info(self) -> Result<(ConversionInfo, Vec<String>), String> {
        let mut notices = Vec::new();

        let input = self
            .input
            .ok_or_else(|| "input filename not specified (use -i)".to_string())?;

        let output = match self.output {
            Some(path) => path,
            None => {
                let derived = converted_name(&input);
                notices.push(format!(
                    "output filename not specified, defaulting to {}",
                    derived.display()
                ));
                derived
            }
        };
        if output == input {
            return Err("input and output filenames cannot be the same".into());
        }

        let rate = self
            .rate
            .ok_or_else(|| "target sample rate not specified (use -r)".to_string())?;
        if rate == 0 {
            return Err("target sample rate must be positive".into());
        }

        let mut ci = ConversionInfo::new(input, output, rate);

        ci.bit_format_token = self.bit_format;
        ci.gain = self.gain;
        ci.double_precision = self.double_precision;

        if let Some(amount) = self.normalize {
            let amount = if amount <= 0.0 { 1.0 } else { amount };
            if amount > 1.0 {
                notices.push(
                    "normalization level greater than 1.0 will clip".to_string(),
                );
            }
            ci.normalize = true;
            ci.normalize_amount = amount;
            ci.limit = amount;
        }

        if let Some(amount) = self.dither {
            ci.dither = true;
            ci.dither_amount = if amount <= 0.0 { 1.0 } else { amount };
        }
        ci.dither_profile = match self.ns {
            Some(id) => DitherProfile::from_id(id.max(0)).unwrap_or_else(|| {
                notices.push(format!("unknown dither profile {id}, using the rate default"));
                DitherProfile::default_for_rate(rate)
            }),
            None => DitherProfile::default_for_rate(rate),
        };
        if self.flat_tpdf {
            ci.dither_profile = DitherProfile::Flat;
        }
        ci.auto_blank = self.autoblank;
        ci.seed = self.seed;

        ci.min_phase = self.min_phase;

        // Filter presets, then custom overrides, then clamping.
        let late_cutoff = 100.0 * (21.0 / 22.0);
        if self.relaxed_lpf {
            ci.lpf_cutoff_percent = late_cutoff;
            ci.lpf_transition_percent = 2.0 * (100.0 - late_cutoff);
        }
        if self.steep_lpf {
            ci.lpf_cutoff_percent = late_cutoff;
            ci.lpf_transition_percent = 100.0 - late_cutoff;
        }
        if let Some(cutoff) = self.lpf_cutoff {
            ci.lpf_cutoff_percent = cutoff;
            ci.lpf_transition_percent = self
                .lpf_transition
                .unwrap_or(100.0 - cutoff);
        } else if let Some(transition) = self.lpf_transition {
            ci.lpf_transition_percent = transition;
        }
        ci.lpf_cutoff_percent = ci.lpf_cutoff_percent.clamp(1.0, 99.9);
        ci.lpf_transition_percent = ci.lpf_transition_percent.clamp(0.1, 400.0);

        // singleStage/multiStage conflict: both -> multi, neither -> multi.
        ci.single_stage = self.single_stage && !self.multi_stage;
        ci.max_stages = self.max_stages.unwrap_or(3).clamp(1, 10) as usize;
        ci.show_stages = self.show_stages;

        ci.multithreaded = self.mt;
        ci.clipping_protection = !self.no_clipping_protection;
        ci.delay_trim = !self.no_delay_trim;

        ci.use_temp_file = !self.no_temp_file;
        ci.show_temp_file = self.show_temp_file;
        ci.temp_dir = self.temp_dir;

        ci.force_rf64 = self.rf64;
        ci.peak_chunk = !self.no_peak_chunk;
        ci.write_metadata = !self.no_metadata;

        ci.flac_compression = self.flac_compression.map(|l| l.clamp(0, 8) as u32);
        ci.vorbis_quality = self.vorbis_quality.map(|q| q.clamp(-1.0, 10.0));

        ci.quantize_bits = self.quantize_bits;
        ci.csv_scaling = if self.pow2clip {
            IntegerScaling::Pow2Clip
        } else {
            IntegerScaling::Pow2Minus1
        };

        Ok((ci, notices))
    }
}

/// `input.flac` -> `input(converted).flac`, used when `-o` is omitted.
fn converted_name(input: &std::path::Path) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    let name = match input.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}(converted).{ext}"),
        None => format!("{stem}(converted)"),
    };
    input.with_file_name(name)
}
