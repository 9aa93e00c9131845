//! remuestreo - offline sample-rate converter CLI.

mod args;

use std::sync::Mutex;

use anyhow::{bail, Context};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use args::{Cli, GlobalAction};
use remuestreo_core::{exp_sweep, DitherProfile};
use remuestreo_io::engine::{convert, Reporter};
use remuestreo_io::format::{list_sub_formats, MajorFormat, SubFormat};
use remuestreo_io::wav::{WavWriter, WriterOptions};

/// Sweep generator defaults: rate, duration, octave span, level.
const SWEEP_RATE: u32 = 44_100;
const SWEEP_SECONDS: f64 = 10.0;
const SWEEP_OCTAVES: u32 = 10;
const SWEEP_LEVEL_DB: f64 = -6.0;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(action) = cli.global_action() {
        return run_global(action);
    }

    let (ci, notices) = match cli.into_conversion_info() {
        Ok(result) => result,
        Err(message) => {
            bail!("{message}");
        }
    };
    for notice in &notices {
        eprintln!("{notice}");
    }

    println!("input file: {}", ci.input_path.display());
    println!("output file: {}", ci.output_path.display());
    if !ci.clipping_protection {
        println!("clipping protection disabled");
    }
    if ci.double_precision {
        println!("using double precision for calculations");
    }

    let reporter = ConsoleReporter::new();
    let result = convert(&ci, &reporter)?;
    reporter.finish();

    println!(
        "done: {} frames, {} channel{} at {} Hz",
        result.frames_written,
        result.channels,
        if result.channels == 1 { "" } else { "s" },
        result.output_rate
    );
    Ok(())
}

fn run_global(action: GlobalAction) -> anyhow::Result<()> {
    match action {
        GlobalAction::Compiler => {
            println!("{}", env!("REMUESTREO_RUSTC_VERSION"));
        }
        GlobalAction::CodecVersion => {
            println!("codec backends: hound (wav), symphonia (flac/aiff/mp3/ogg), native dsf/dff");
        }
        GlobalAction::ListSubFormats(ext) => match list_sub_formats(&ext) {
            Some(tokens) => {
                for token in tokens {
                    println!("{token}");
                }
            }
            None => bail!("file extension '{ext}' unknown"),
        },
        GlobalAction::ShowDitherProfiles => {
            for profile in DitherProfile::all() {
                println!("{} : {}", profile.id(), profile.name());
            }
        }
        GlobalAction::Generate(path) => {
            let sweep = exp_sweep(SWEEP_RATE, SWEEP_SECONDS, SWEEP_OCTAVES, SWEEP_LEVEL_DB);
            let mut writer = WavWriter::create(
                &path,
                MajorFormat::Wav,
                SubFormat::Double,
                1,
                SWEEP_RATE,
                WriterOptions::default(),
            )
            .with_context(|| format!("couldn't create {}", path.display()))?;
            writer.write_samples(&sweep)?;
            writer.finalize()?;
            println!("wrote {} samples to {}", sweep.len(), path.display());
        }
    }
    Ok(())
}

/// Console reporter: informational lines to stdout, warnings to stderr,
/// a progress bar for the block loop.
struct ConsoleReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl ConsoleReporter {
    fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn finish(&self) {
        if let Some(bar) = self.bar.lock().unwrap().take() {
            bar.finish_and_clear();
        }
    }
}

impl Reporter for ConsoleReporter {
    fn info(&self, message: &str) {
        let guard = self.bar.lock().unwrap();
        match guard.as_ref() {
            Some(bar) => bar.println(message),
            None => println!("{message}"),
        }
    }

    fn warn(&self, message: &str) {
        eprintln!("warning: {message}");
    }

    fn progress(&self, percent: u32) {
        let mut guard = self.bar.lock().unwrap();
        let bar = guard.get_or_insert_with(|| {
            let bar = ProgressBar::new(100);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("[{bar:40.cyan/blue}] {pos}%")
                    .expect("static template")
                    .progress_chars("##-"),
            );
            bar
        });
        bar.set_position(u64::from(percent));
    }

    fn progress_done(&self) {
        self.finish();
    }
}
