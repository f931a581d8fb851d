mod common;

use std::fs;
use std::path::Path;
use std::process::Command;
use waveflow::audio::io::WavIo;

const CONFIG: &str = "\
weights_path: model.safetensors
model:
  res_channels: 8
  hidden_channels: 8
  skip_channels: 8
  cdt_channels: 4
  kernel_size: 3
  cycle_size: 3
  n_layer: 4
  n_flow: 6
  squeeze: 8
audio:
  sample_rate: 16000
";

fn run(args: &[&str]) -> String {
    let output = Command::new(env!("CARGO_BIN_EXE_waveflow"))
        .args(args)
        .output()
        .expect("run command");
    assert!(
        output.status.success(),
        "waveflow {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("utf8 stdout")
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf8 path")
}

#[test]
fn cli_info_reports_receptive_field() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = dir.path().join("waveflow.yaml");
    fs::write(&config, CONFIG).expect("write config");

    let stdout = run(&["info", "--config", path_str(&config)]);
    // Dilations 1, 2, 4, 1 with kernel 3.
    assert!(stdout.contains("receptive field (rows): 17"), "{stdout}");
}

#[test]
fn cli_init_synthesize_and_score() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = dir.path().join("waveflow.yaml");
    fs::write(&config, CONFIG).expect("write config");

    let weights = dir.path().join("model.safetensors");
    run(&["init", "--config", path_str(&config), "--output", path_str(&weights)]);
    assert!(weights.exists());

    let conditioning = dir.path().join("mel.safetensors");
    let values: Vec<f32> = (0..4 * 130).map(|i| ((i as f32) * 0.1).sin()).collect();
    common::write_conditioning(&conditioning, &values, vec![4, 130]);

    let audio = dir.path().join("out.wav");
    run(&[
        "synthesize",
        "--config",
        path_str(&config),
        "--conditioning",
        path_str(&conditioning),
        "--output",
        path_str(&audio),
        "--temp",
        "0.5",
        "--fast",
    ]);
    let (samples, sample_rate) = WavIo::read_mono(&audio).expect("read wav");
    assert_eq!(sample_rate, 16000);
    // 130 samples trimmed to a whole number of row pairs of 8 columns.
    assert_eq!(samples.len(), 128);

    let stdout = run(&[
        "score",
        "--config",
        path_str(&config),
        "--input",
        path_str(&audio),
        "--conditioning",
        path_str(&conditioning),
    ]);
    let loss: f32 = stdout.trim().parse().expect("loss value");
    assert!(loss.is_finite());
}
