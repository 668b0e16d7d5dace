use assert_cmd::cargo::cargo_bin_cmd;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use slate_lib::io::{write_recording, ContainerKind};
use slate_lib::Recording;
use slate_task::{TaskConfig, TaskKind};
use std::error::Error;
use std::f64::consts::TAU;
use std::fs;
use tempfile::tempdir;

/// Channels share a 50 Hz line component (different gains and phases) on
/// top of a 10 Hz rhythm and broadband noise.
fn noisy_recording(n_channels: usize, fs: f64, seconds: f64, seed: u64) -> Recording {
    let n = (seconds * fs) as usize;
    let mut rng = StdRng::seed_from_u64(seed);
    let channels = (0..n_channels).map(|c| format!("E{}", c + 1)).collect();
    let data = (0..n_channels)
        .map(|c| {
            let line_gain = 8.0 + 2.0 * c as f64;
            let line_phase = rng.gen_range(0.0..TAU);
            let alpha_phase = rng.gen_range(0.0..TAU);
            (0..n)
                .map(|i| {
                    let t = i as f64 / fs;
                    5.0 * (TAU * 10.0 * t + alpha_phase).sin()
                        + line_gain * (TAU * 50.0 * t + line_phase).sin()
                        + rng.gen_range(-2.0..2.0)
                })
                .collect()
        })
        .collect();
    Recording { fs, channels, data }
}

#[test]
fn init_config_writes_a_valid_preset() -> Result<(), Box<dyn Error>> {
    let temp = tempdir()?;
    let path = temp.path().join("line_noise_check.toml");

    let mut cmd = cargo_bin_cmd!("slate");
    cmd.args([
        "init-config",
        "--task",
        "line-noise-check",
        "--out",
        path.to_str().unwrap(),
    ]);
    cmd.assert().success();

    let config = TaskConfig::load(&path)?;
    assert_eq!(config.task, TaskKind::LineNoiseCheck);
    assert!(config.steps.line_noise.is_enabled());
    assert!(config.steps.reject_epochs.is_enabled());
    assert!(!config.steps.source_localization.is_enabled());
    Ok(())
}

#[test]
fn info_reports_channels_and_rate() -> Result<(), Box<dyn Error>> {
    let temp = tempdir()?;
    let tsv = temp.path().join("rest.tsv");
    write_recording(
        &noisy_recording(3, 100.0, 10.0, 7),
        &tsv,
        ContainerKind::Raw,
        None,
    )?;

    let mut cmd = cargo_bin_cmd!("slate");
    cmd.args(["info", "--input", tsv.to_str().unwrap()]);
    let output = cmd.assert().success().get_output().stdout.clone();
    let info: Value = serde_json::from_slice(&output)?;

    assert_eq!(info["fs"], 100.0);
    assert_eq!(info["n_channels"], 3);
    assert_eq!(info["n_samples"], 1000);
    assert_eq!(info["duration_s"], 10.0);
    assert_eq!(info["channels"][0], "E1");
    Ok(())
}

#[test]
fn psd_reports_the_alpha_peak() -> Result<(), Box<dyn Error>> {
    let temp = tempdir()?;
    let tsv = temp.path().join("alpha.tsv");
    let fs = 100.0;
    let mut rng = StdRng::seed_from_u64(11);
    let data = vec![(0..3000)
        .map(|i| {
            let t = i as f64 / fs;
            10.0 * (TAU * 10.0 * t).sin() + rng.gen_range(-0.5..0.5)
        })
        .collect()];
    let recording = Recording {
        fs,
        channels: vec!["Oz".to_string()],
        data,
    };
    write_recording(&recording, &tsv, ContainerKind::Raw, None)?;

    let mut cmd = cargo_bin_cmd!("slate");
    cmd.args(["psd", "--input", tsv.to_str().unwrap(), "--channel", "Oz"]);
    let output = cmd.assert().success().get_output().stdout.clone();
    let summary: Value = serde_json::from_slice(&output)?;

    assert_eq!(summary["channel"], "Oz");
    let bands = summary["band_powers"].as_array().unwrap();
    assert_eq!(bands.len(), 5);
    let power = |name: &str| {
        bands
            .iter()
            .find(|b| b["band"] == name)
            .unwrap_or_else(|| panic!("band {name} missing"))["power_uv2"]
            .as_f64()
            .unwrap()
    };
    assert!(
        power("alpha") > 10.0 * power("delta"),
        "alpha {} should dominate delta {}",
        power("alpha"),
        power("delta")
    );
    Ok(())
}

#[test]
fn run_line_noise_check_end_to_end() -> Result<(), Box<dyn Error>> {
    let temp = tempdir()?;
    let config_path = temp.path().join("check.toml");
    let mut cmd = cargo_bin_cmd!("slate");
    cmd.args([
        "init-config",
        "--task",
        "line-noise-check",
        "--out",
        config_path.to_str().unwrap(),
    ]);
    cmd.assert().success();

    let tsv = temp.path().join("sub-01_rest.tsv");
    write_recording(
        &noisy_recording(10, 250.0, 40.0, 3),
        &tsv,
        ContainerKind::Raw,
        None,
    )?;

    let derivatives = temp.path().join("derivatives");
    let mut cmd = cargo_bin_cmd!("slate");
    cmd.args([
        "run",
        "--config",
        config_path.to_str().unwrap(),
        "--input",
        tsv.to_str().unwrap(),
        "--out",
        derivatives.to_str().unwrap(),
    ]);
    let output = cmd.assert().success().get_output().stdout.clone();
    let summary: Value = serde_json::from_slice(&output)?;
    assert_eq!(summary["task"], "line_noise_check");

    let manifest_path = derivatives.join("sub-01_rest_run_manifest.json");
    assert_eq!(summary["manifest"], manifest_path.to_str().unwrap());
    let manifest: Value = serde_json::from_str(&fs::read_to_string(&manifest_path)?)?;
    let steps = &manifest["steps"];
    assert_eq!(steps["step_line_noise"]["fline"], 50.0);
    assert_eq!(steps["step_epoching"]["n_epochs"], 10);
    assert_eq!(steps["step_reject_epochs"]["epochs_before"], 10);
    let kept = steps["step_reject_epochs"]["epochs_after"].as_u64().unwrap();
    assert!(kept >= 5, "clean epochs should mostly survive, kept {kept}");

    assert!(derivatives
        .join("line_noise/sub-01_rest_linenoise_psd.png")
        .exists());
    assert!(derivatives
        .join("reject_epochs/sub-01_rest_reject_overview.png")
        .exists());
    Ok(())
}
