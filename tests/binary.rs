#[cfg(feature = "binaries")]
mod binary {
  use assert_cmd::Command;
  use rand::distributions::Alphanumeric;
  use rand::{thread_rng, Rng};
  use std::env::temp_dir;
  use std::fs;
  use std::path::PathBuf;

  fn get_tempfile_path(extension: &str) -> PathBuf {
    let mut path = temp_dir();
    let filename =
      thread_rng().sample_iter(&Alphanumeric).take(12).map(char::from).collect::<String>();
    path.push(format!("{}.{}", filename, extension));
    path
  }

  #[cfg(not(windows))]
  fn get_scalenc_command() -> Command {
    let mut cmd = Command::cargo_bin("scalenc").unwrap();
    cmd.env_clear();
    cmd
  }

  #[cfg(windows)]
  fn get_scalenc_command() -> Command {
    Command::cargo_bin("scalenc").unwrap()
  }

  fn read_reports(path: &PathBuf) -> Vec<serde_json::Value> {
    fs::read_to_string(path)
      .unwrap()
      .lines()
      .map(|l| serde_json::from_str(l).unwrap())
      .collect()
  }

  fn total_size(reports: &[serde_json::Value]) -> u64 {
    reports.iter().map(|r| r["bitstream_size"].as_u64().unwrap()).sum()
  }

  #[test]
  fn default_session() {
    let report = get_tempfile_path("json");
    let output = get_tempfile_path("bin");

    get_scalenc_command()
      .arg("--limit")
      .arg("3")
      .arg("-o")
      .arg(&output)
      .arg("-r")
      .arg(&report)
      .assert()
      .success();

    let reports = read_reports(&report);
    assert_eq!(reports.len(), 3);
    for (i, r) in reports.iter().enumerate() {
      assert_eq!(r["status"], "Successful");
      assert_eq!(r["frame_number"].as_u64(), Some(i as u64));
    }
    assert_eq!(reports[0]["frame_type"], "I");
    assert_eq!(reports[1]["frame_type"], "P");
    let written = fs::metadata(&output).unwrap().len();
    assert_eq!(written, total_size(&reports));
  }

  #[test]
  fn tiles_and_bitrate_on_the_command_line() {
    let report = get_tempfile_path("json");

    get_scalenc_command()
      .arg("--limit")
      .arg("2")
      .arg("--tiles")
      .arg("2x1")
      .arg("--bitrate")
      .arg("6000")
      .arg("-r")
      .arg(&report)
      .assert()
      .success();

    let reports = read_reports(&report);
    assert_eq!(reports.len(), 2);
    for r in &reports {
      assert_eq!(r["pipes"].as_u64(), Some(2));
      assert_eq!(r["tiles"].as_array().unwrap().len(), 2);
      assert!(r["passes"].as_u64().unwrap() >= 1);
    }
  }

  #[test]
  fn session_file() {
    let session = get_tempfile_path("toml");
    let report = get_tempfile_path("json");
    fs::write(
      &session,
      r#"
generation = "Gen11"

[encoder]
width = 1280
height = 720
tile_cols = 2

[[frame]]
type = "I"

[[frame]]
type = "P"
refs0 = [0]
engines = 1

[[frame]]
type = "P"
refs0 = [1]
end_of_stream = true
"#,
    )
    .unwrap();

    get_scalenc_command().arg(&session).arg("-r").arg(&report).assert().success();

    let reports = read_reports(&report);
    let pipes: Vec<_> =
      reports.iter().map(|r| r["pipes"].as_u64().unwrap()).collect();
    assert_eq!(pipes, [2, 1, 1]);
    assert!(reports.iter().all(|r| r["status"] == "Successful"));
  }

  #[test]
  fn report_to_stdout() {
    let assert =
      get_scalenc_command().arg("-l").arg("1").arg("-r").arg("-").assert();
    let out = assert.success().get_output().stdout.clone();
    let text = String::from_utf8(out).unwrap();
    let report: serde_json::Value =
      serde_json::from_str(text.trim()).unwrap();
    assert_eq!(report["poc"].as_i64(), Some(0));
  }

  #[test]
  fn invalid_tiles_rejected() {
    get_scalenc_command().arg("--tiles").arg("0x1").assert().failure();
    get_scalenc_command().arg("--tiles").arg("four").assert().failure();
  }

  #[test]
  fn unknown_generation_rejected() {
    get_scalenc_command().arg("--generation").arg("gen9").assert().failure();
  }

  #[test]
  fn missing_session_file() {
    get_scalenc_command()
      .arg(get_tempfile_path("toml"))
      .assert()
      .failure();
  }
}
