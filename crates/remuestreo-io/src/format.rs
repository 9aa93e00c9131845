//! Output format resolution.
//!
//! Maps user-facing bit-format tokens (`16`, `24`, `32f`, `u8`, ...) and
//! file extensions onto (major, sub) format pairs, decides when a WAV
//! output must be promoted to RF64, and knows which sub-formats each
//! container accepts.
//!
//! The WAV family (wav/wavex/rf64) plus CSV is what the writer can
//! actually produce; the remaining majors are kept in the tables so
//! extension resolution, validity checks and `--listsubformats` behave
//! sensibly, and opening a writer for them reports an unsupported format.

use crate::wav::RIFF_SIZE_LIMIT;
use remuestreo_core::Fraction;

/// Container (major) formats recognized from output extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MajorFormat {
    Wav,
    Wavex,
    Rf64,
    W64,
    Aiff,
    Flac,
    Caf,
    Au,
    Mat,
    Voc,
    Ogg,
}

/// Sample (sub) formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubFormat {
    PcmU8,
    PcmS8,
    Pcm16,
    Pcm24,
    Pcm32,
    Float,
    Double,
    Vorbis,
}

impl MajorFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "wav" => Some(MajorFormat::Wav),
            "rf64" => Some(MajorFormat::Rf64),
            "w64" => Some(MajorFormat::W64),
            "aif" | "aiff" => Some(MajorFormat::Aiff),
            "flac" => Some(MajorFormat::Flac),
            "caf" => Some(MajorFormat::Caf),
            "au" | "snd" => Some(MajorFormat::Au),
            "mat" => Some(MajorFormat::Mat),
            "voc" => Some(MajorFormat::Voc),
            "ogg" | "oga" => Some(MajorFormat::Ogg),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MajorFormat::Wav => "wav",
            MajorFormat::Wavex => "wavex",
            MajorFormat::Rf64 => "rf64",
            MajorFormat::W64 => "w64",
            MajorFormat::Aiff => "aiff",
            MajorFormat::Flac => "flac",
            MajorFormat::Caf => "caf",
            MajorFormat::Au => "au",
            MajorFormat::Mat => "mat",
            MajorFormat::Voc => "voc",
            MajorFormat::Ogg => "ogg",
        }
    }

    /// Sub-formats the container accepts.
    pub fn valid_subs(&self) -> &'static [SubFormat] {
        use SubFormat::*;
        match self {
            MajorFormat::Wav | MajorFormat::Wavex | MajorFormat::Rf64 | MajorFormat::W64 => {
                &[PcmU8, Pcm16, Pcm24, Pcm32, Float, Double]
            }
            MajorFormat::Aiff => &[PcmS8, Pcm16, Pcm24, Pcm32, Float, Double],
            MajorFormat::Flac => &[PcmS8, Pcm16, Pcm24],
            MajorFormat::Caf | MajorFormat::Au => &[PcmS8, Pcm16, Pcm24, Pcm32, Float, Double],
            MajorFormat::Mat => &[PcmU8, Pcm16, Pcm32, Float, Double],
            MajorFormat::Voc => &[PcmU8, Pcm16],
            MajorFormat::Ogg => &[Vorbis],
        }
    }

    /// Canonical sub-format when nothing better can be carried over.
    pub fn default_sub(&self) -> SubFormat {
        match self {
            MajorFormat::Ogg => SubFormat::Vorbis,
            MajorFormat::Voc => SubFormat::Pcm16,
            _ => SubFormat::Pcm16,
        }
    }

    /// Whether the 8-bit PCM flavor for this container is unsigned.
    pub fn uses_unsigned_8bit(&self) -> bool {
        matches!(
            self,
            MajorFormat::Wav
                | MajorFormat::Wavex
                | MajorFormat::Rf64
                | MajorFormat::W64
                | MajorFormat::Mat
                | MajorFormat::Voc
        )
    }

    pub fn is_wav_family(&self) -> bool {
        matches!(
            self,
            MajorFormat::Wav | MajorFormat::Wavex | MajorFormat::Rf64
        )
    }
}

impl SubFormat {
    /// The user-facing token (`-b` argument value).
    pub fn token(&self) -> &'static str {
        match self {
            SubFormat::PcmU8 => "u8",
            SubFormat::PcmS8 => "s8",
            SubFormat::Pcm16 => "16",
            SubFormat::Pcm24 => "24",
            SubFormat::Pcm32 => "32",
            SubFormat::Float => "32f",
            SubFormat::Double => "64f",
            SubFormat::Vorbis => "vorbis",
        }
    }

    /// Resolve a `-b` token. The bare `8` maps to the signedness the
    /// container uses for 8-bit PCM.
    pub fn from_token(token: &str, major: MajorFormat) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "8" => Some(if major.uses_unsigned_8bit() {
                SubFormat::PcmU8
            } else {
                SubFormat::PcmS8
            }),
            "u8" => Some(SubFormat::PcmU8),
            "s8" => Some(SubFormat::PcmS8),
            "16" => Some(SubFormat::Pcm16),
            "24" => Some(SubFormat::Pcm24),
            "32" => Some(SubFormat::Pcm32),
            "32f" => Some(SubFormat::Float),
            "64f" => Some(SubFormat::Double),
            _ => None,
        }
    }

    pub fn bytes_per_sample(&self) -> u64 {
        match self {
            SubFormat::PcmU8 | SubFormat::PcmS8 => 1,
            SubFormat::Pcm16 | SubFormat::Vorbis => 2,
            SubFormat::Pcm24 => 3,
            SubFormat::Pcm32 | SubFormat::Float => 4,
            SubFormat::Double => 8,
        }
    }

    /// Word length used to set the dither LSB for this sub-format.
    pub fn dither_bits(&self) -> u32 {
        match self {
            SubFormat::Pcm24 => 24,
            SubFormat::PcmU8 | SubFormat::PcmS8 => 8,
            SubFormat::Double => 53,
            SubFormat::Float => 21,
            _ => 16,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, SubFormat::Float | SubFormat::Double)
    }
}

/// Resolve an output extension + token pair into a concrete format.
pub fn determine_output_format(out_ext: &str, token: &str) -> Option<(MajorFormat, SubFormat)> {
    let major = MajorFormat::from_extension(out_ext)?;
    let sub = SubFormat::from_token(token, major)?;
    Some((major, sub))
}

/// Carry the input's sub-format to a new container where valid, falling
/// back to the container's default.
pub fn determine_best_sub(input_sub: SubFormat, major: MajorFormat) -> SubFormat {
    if major.valid_subs().contains(&input_sub) {
        input_sub
    } else {
        major.default_sub()
    }
}

/// Predicted output payload in bytes for the RF64 decision.
pub fn predicted_output_bytes(input_samples: u64, sub: SubFormat, fraction: Fraction) -> u64 {
    input_samples * sub.bytes_per_sample() * fraction.numerator / fraction.denominator
}

/// Whether a WAV output must be promoted to RF64: predicted payload at or
/// beyond the 32-bit RIFF size limit.
pub fn needs_rf64(input_samples: u64, sub: SubFormat, fraction: Fraction) -> bool {
    predicted_output_bytes(input_samples, sub, fraction) >= RIFF_SIZE_LIMIT
}

/// Valid sub-format tokens for an extension, for `--listsubformats`.
pub fn list_sub_formats(ext: &str) -> Option<Vec<&'static str>> {
    let major = MajorFormat::from_extension(ext)?;
    Some(major.valid_subs().iter().map(|s| s.token()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_resolve_per_container() {
        assert_eq!(
            determine_output_format("wav", "24"),
            Some((MajorFormat::Wav, SubFormat::Pcm24))
        );
        assert_eq!(
            determine_output_format("wav", "64f"),
            Some((MajorFormat::Wav, SubFormat::Double))
        );
        assert_eq!(determine_output_format("wav", "17"), None);
        assert_eq!(determine_output_format("xyz", "16"), None);
    }

    #[test]
    fn bare_8_follows_container_signedness() {
        for ext in ["wav", "w64", "rf64", "mat", "voc"] {
            assert_eq!(
                determine_output_format(ext, "8").unwrap().1,
                SubFormat::PcmU8,
                "{ext} should take unsigned 8-bit"
            );
        }
        for ext in ["aiff", "flac", "au", "caf"] {
            assert_eq!(
                determine_output_format(ext, "8").unwrap().1,
                SubFormat::PcmS8,
                "{ext} should take signed 8-bit"
            );
        }
    }

    #[test]
    fn best_sub_carries_over_or_defaults() {
        // 24-bit carries from wav to flac.
        assert_eq!(
            determine_best_sub(SubFormat::Pcm24, MajorFormat::Flac),
            SubFormat::Pcm24
        );
        // Double does not fit flac; falls back to its default.
        assert_eq!(
            determine_best_sub(SubFormat::Double, MajorFormat::Flac),
            SubFormat::Pcm16
        );
    }

    #[test]
    fn rf64_promotion_at_the_4g_boundary() {
        let unity = Fraction::from_rates(48_000, 48_000).unwrap();
        // 5 hours of 192 kHz 24-bit stereo downsampled to 48 kHz: the
        // source holds ~6.9G samples, a quarter of which survive, each 3
        // bytes: ~10.4 GB of payload.
        let five_hours_192k_stereo = 5 * 3600 * 192_000 * 2u64;
        let quarter = Fraction::from_rates(192_000, 48_000).unwrap();
        assert!(needs_rf64(five_hours_192k_stereo, SubFormat::Pcm24, quarter));

        // One minute of the same material stays comfortably 32-bit.
        assert!(!needs_rf64(60 * 192_000 * 2, SubFormat::Pcm24, quarter));

        // Boundary: exactly 2^32 bytes promotes.
        assert!(needs_rf64(1 << 32, SubFormat::PcmU8, unity));
        assert!(!needs_rf64((1 << 32) - 1, SubFormat::PcmU8, unity));
    }

    #[test]
    fn listsubformats_matches_tables() {
        let subs = list_sub_formats("flac").unwrap();
        assert_eq!(subs, vec!["s8", "16", "24"]);
        assert!(list_sub_formats("nope").is_none());
    }

    #[test]
    fn dither_bits_table() {
        assert_eq!(SubFormat::Pcm24.dither_bits(), 24);
        assert_eq!(SubFormat::PcmU8.dither_bits(), 8);
        assert_eq!(SubFormat::Double.dither_bits(), 53);
        assert_eq!(SubFormat::Float.dither_bits(), 21);
        assert_eq!(SubFormat::Pcm16.dither_bits(), 16);
        assert_eq!(SubFormat::Pcm32.dither_bits(), 16);
    }
}
