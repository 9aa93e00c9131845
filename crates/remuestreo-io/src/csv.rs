//! CSV sample output.
//!
//! One frame per line, channels comma-separated, numeric rendering
//! controlled by the `-b` token grammar `[u|s]<bits>[f|i|o|x]`:
//! signedness prefix, 1-64 bit width, then floating-point / integer /
//! octal / hexadecimal. The default is 16-bit signed decimal integers.
//!
//! Integer scaling styles: `pow2minus1` multiplies by `2^(B-1) - 1` so
//! full scale always fits; `pow2clip` multiplies by `2^(B-1)` and clamps
//! the positive rail.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Signedness {
    #[default]
    Signed,
    Unsigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NumericBase {
    #[default]
    Decimal,
    Octal,
    Hexadecimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NumericFormat {
    #[default]
    Integer,
    FloatingPoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntegerScaling {
    /// Multiply by `2^(B-1) - 1`.
    #[default]
    Pow2Minus1,
    /// Multiply by `2^(B-1)` and clamp the positive rail.
    Pow2Clip,
}

/// Parsed rendering settings for CSV output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvSpec {
    pub signedness: Signedness,
    pub bits: u32,
    pub base: NumericBase,
    pub format: NumericFormat,
    pub scaling: IntegerScaling,
}

impl Default for CsvSpec {
    fn default() -> Self {
        Self {
            signedness: Signedness::Signed,
            bits: 16,
            base: NumericBase::Decimal,
            format: NumericFormat::Integer,
            scaling: IntegerScaling::Pow2Minus1,
        }
    }
}

impl CsvSpec {
    /// Parse a `[u|s]<bits>[f|i|o|x]` token. Returns `None` for tokens
    /// outside the grammar; missing pieces take their defaults.
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.to_ascii_lowercase();
        let mut spec = CsvSpec::default();
        let mut rest = token.as_str();

        if let Some(stripped) = rest.strip_prefix('u') {
            spec.signedness = Signedness::Unsigned;
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix('s') {
            rest = stripped;
        }

        let digits_end = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits_end > 0 {
            let bits: u32 = rest[..digits_end].parse().ok()?;
            spec.bits = bits.clamp(1, 64);
            rest = &rest[digits_end..];
        }

        match rest {
            "" | "i" => {}
            "f" => spec.format = NumericFormat::FloatingPoint,
            "o" => spec.base = NumericBase::Octal,
            "x" => spec.base = NumericBase::Hexadecimal,
            _ => return None,
        }
        Some(spec)
    }
}

/// CSV output sink.
pub struct CsvFile {
    writer: BufWriter<File>,
    channels: usize,
    spec: CsvSpec,
    line: String,
    column: usize,
}

impl CsvFile {
    pub fn create<P: AsRef<Path>>(path: P, channels: usize, spec: CsvSpec) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| Error::OutputOpen {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            channels: channels.max(1),
            spec,
            line: String::new(),
            column: 0,
        })
    }

    /// Append interleaved samples; a line is emitted whenever a frame
    /// completes, so writes may split frames across calls.
    pub fn write_samples(&mut self, interleaved: &[f64]) -> Result<()> {
        for &x in interleaved {
            if self.column > 0 {
                self.line.push(',');
            }
            render(&mut self.line, x, &self.spec);
            self.column += 1;
            if self.column == self.channels {
                self.line.push('\n');
                self.writer
                    .write_all(self.line.as_bytes())
                    .map_err(|e| Error::OutputWrite(e.to_string()))?;
                self.line.clear();
                self.column = 0;
            }
        }
        Ok(())
    }

    pub fn finalize(mut self) -> Result<()> {
        if self.column > 0 {
            self.line.push('\n');
            self.writer
                .write_all(self.line.as_bytes())
                .map_err(|e| Error::OutputWrite(e.to_string()))?;
        }
        self.writer
            .flush()
            .map_err(|e| Error::OutputWrite(e.to_string()))
    }
}

fn render(out: &mut String, x: f64, spec: &CsvSpec) {
    use std::fmt::Write as _;

    if spec.format == NumericFormat::FloatingPoint {
        let _ = write!(out, "{x}");
        return;
    }

    let half = 2f64.powi(spec.bits as i32 - 1);
    let mut value = match spec.scaling {
        IntegerScaling::Pow2Minus1 => (x * (half - 1.0)).round(),
        IntegerScaling::Pow2Clip => (x * half).round().clamp(-half, half - 1.0),
    };
    if spec.signedness == Signedness::Unsigned {
        value += half;
        value = value.clamp(0.0, 2.0 * half - 1.0);
    }
    let value = value as i128;

    match spec.base {
        NumericBase::Decimal => {
            let _ = write!(out, "{value}");
        }
        NumericBase::Octal => {
            let _ = write!(out, "{value:o}");
        }
        NumericBase::Hexadecimal => {
            let _ = write!(out, "{value:x}");
        }
    }
}
