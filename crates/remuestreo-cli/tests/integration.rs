//! Integration tests for the remuestreo binary.
//!
//! Cover CLI invocation, the informational options, and end-to-end
//! conversions driven exactly the way a user would run them.

use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

fn remuestreo() -> Command {
    Command::new(env!("CARGO_BIN_EXE_remuestreo"))
}

fn write_sine(path: &Path, channels: u16, rate: u32, frames: usize) {
    let spec = hound::WavSpec {
        channels,
        sample_rate: rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for i in 0..frames {
        let s = (2.0 * std::f32::consts::PI * 440.0 * i as f32 / rate as f32).sin() * 0.8;
        for _ in 0..channels {
            writer.write_sample(s).unwrap();
        }
    }
    writer.finalize().unwrap();
}

// ---------------------------------------------------------------------------
// Informational options
// ---------------------------------------------------------------------------

#[test]
fn cli_help_lists_the_core_options() {
    let output = remuestreo().arg("--help").output().expect("run --help");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for needle in ["-i", "-o", "-r", "--dither", "--minphase", "--noTempFile"] {
        assert!(stdout.contains(needle), "help should mention {needle}");
    }
}

#[test]
fn cli_version_works() {
    let output = remuestreo().arg("--version").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("remuestreo"));
}

#[test]
fn cli_compiler_prints_rustc() {
    let output = remuestreo().arg("--compiler").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("rustc"), "got: {stdout}");
}

#[test]
fn cli_shows_dither_profiles() {
    let output = remuestreo().arg("--showDitherProfiles").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("standard"));
    assert!(stdout.contains("wannamaker"));
    // Lowercase alias spelling works too.
    let output = remuestreo().arg("--showditherprofiles").output().unwrap();
    assert!(output.status.success());
}

#[test]
fn cli_lists_subformats_per_extension() {
    let output = remuestreo()
        .args(["--listsubformats", "wav"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for token in ["16", "24", "32f", "64f", "u8"] {
        assert!(stdout.lines().any(|l| l.trim() == token), "missing {token}");
    }

    let output = remuestreo()
        .args(["--listsubformats", "nope"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn cli_generates_a_sweep() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sweep.wav");
    let output = remuestreo()
        .args(["--generate", path.to_str().unwrap()])
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "generate failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(path.exists());

    // The sweep is written as 64-bit float, which hound cannot read;
    // use the project's own float reader.
    let mut reader = remuestreo_io::wav::FloatWavReader::open(&path).unwrap();
    assert_eq!(reader.channels(), 1);
    assert_eq!(reader.sample_rate(), 44_100);

    let mut total = 0usize;
    let mut peak = 0.0f64;
    let mut buf = vec![0.0f64; 65_536];
    loop {
        let n = reader.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        peak = buf[..n].iter().fold(peak, |a, &s| a.max(s.abs()));
        total += n;
    }
    assert!(total > 400_000, "sweep should be ~10 s, got {total} samples");
    let target = 10f64.powf(-6.0 / 20.0);
    assert!((peak - target).abs() < 0.01, "sweep level {peak}");
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

#[test]
fn cli_converts_wav_to_new_rate() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.wav");
    let output = dir.path().join("out.wav");
    write_sine(&input, 2, 44_100, 8_820);

    let result = remuestreo()
        .args([
            "-i",
            input.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
            "-r",
            "48000",
            "-b",
            "24",
        ])
        .output()
        .unwrap();
    assert!(
        result.status.success(),
        "conversion failed: {}",
        String::from_utf8_lossy(&result.stderr)
    );

    let reader = hound::WavReader::open(&output).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, 48_000);
    assert_eq!(spec.channels, 2);
    assert_eq!(spec.bits_per_sample, 24);
    // 8820 frames at 44.1k -> exactly 9600 at 48k.
    assert_eq!(reader.duration(), 9_600);
}

#[test]
fn cli_converts_with_dither_and_options() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.wav");
    let output = dir.path().join("out.wav");
    write_sine(&input, 1, 48_000, 9_600);

    let result = remuestreo()
        .args([
            "-i",
            input.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
            "-r",
            "44100",
            "-b",
            "16",
            "--dither",
            "--seed",
            "42",
            "--mt",
            "--noTempFile",
            "--showStages",
        ])
        .output()
        .unwrap();
    assert!(
        result.status.success(),
        "conversion failed: {}",
        String::from_utf8_lossy(&result.stderr)
    );

    let stdout = String::from_utf8_lossy(&result.stdout);
    assert!(stdout.contains("stage 1:"), "showStages output missing");

    let reader = hound::WavReader::open(&output).unwrap();
    assert_eq!(reader.spec().sample_rate, 44_100);
    assert_eq!(reader.duration(), 8_820);
}

#[test]
fn cli_writes_csv_output() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.wav");
    let output = dir.path().join("out.csv");
    write_sine(&input, 2, 44_100, 500);

    let result = remuestreo()
        .args([
            "-i",
            input.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
            "-r",
            "44100",
            "-b",
            "u16x",
        ])
        .output()
        .unwrap();
    assert!(
        result.status.success(),
        "csv conversion failed: {}",
        String::from_utf8_lossy(&result.stderr)
    );

    let text = std::fs::read_to_string(&output).unwrap();
    let first = text.lines().next().unwrap();
    let fields: Vec<&str> = first.split(',').collect();
    assert_eq!(fields.len(), 2);
    for field in fields {
        let value = u32::from_str_radix(field, 16).unwrap();
        assert!(value <= 65_535);
    }
}

// ---------------------------------------------------------------------------
// Failure modes
// ---------------------------------------------------------------------------

#[test]
fn cli_fails_without_a_rate() {
    let output = remuestreo().args(["-i", "a.wav", "-o", "b.wav"]).output().unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("sample rate"), "got: {stderr}");
}

#[test]
fn cli_fails_when_input_equals_output() {
    let output = remuestreo()
        .args(["-i", "same.wav", "-o", "same.wav", "-r", "48000"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn cli_fails_on_missing_input_file() {
    let dir = TempDir::new().unwrap();
    let output_path = dir.path().join("out.wav");
    let output = remuestreo()
        .args([
            "-i",
            "/no/such/input.wav",
            "-o",
            output_path.to_str().unwrap(),
            "-r",
            "48000",
        ])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("couldn't open input file"),
        "got: {stderr}"
    );
}

#[test]
fn cli_fails_on_unsupported_output_container() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.wav");
    write_sine(&input, 1, 44_100, 100);

    let output = remuestreo()
        .args([
            "-i",
            input.to_str().unwrap(),
            "-o",
            dir.path().join("out.ogg").to_str().unwrap(),
            "-r",
            "48000",
        ])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unsupported format"), "got: {stderr}");
}
