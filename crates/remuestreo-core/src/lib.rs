//! Remuestreo Core - DSP primitives for offline sample-rate conversion
//!
//! This crate provides the signal-processing building blocks of the
//! converter:
//!
//! - [`Fraction`] for reducing a rate pair to coprime L/M conversion factors
//! - [`FirPrototype`] and the windowed-sinc / minimum-phase designers
//! - [`Resampler`] single- or multi-stage polyphase rational resampler
//! - [`Ditherer`] noise-shaping TPDF quantizer with auto-blanking
//! - [`Scalar`] so the whole pipeline runs in either f32 or f64
//!
//! Nothing in this crate performs file I/O; the pipeline controller in
//! `remuestreo-io` drives these types per channel.
//!
//! ## Example
//!
//! ```rust,ignore
//! use remuestreo_core::{Fraction, Resampler, ResamplerSpec};
//!
//! let fraction = Fraction::from_rates(48_000, 44_100)?;
//! let mut resampler = Resampler::<f64>::new(&ResamplerSpec::with_defaults(fraction, 48_000, 44_100), 8192)?;
//! let produced = resampler.process(&input, &mut output);
//! ```

pub mod dither;
pub mod fir;
pub mod fraction;
pub mod resampler;
pub mod sample;
pub mod sweep;

pub use dither::{DitherProfile, Ditherer};
pub use fir::{design_lowpass, minimum_phase, FilterPhase, FirPrototype};
pub use fraction::{Fraction, RateError};
pub use resampler::{Resampler, ResamplerSpec, StageMode, StagePlan};
pub use sample::Scalar;
pub use sweep::exp_sweep;
