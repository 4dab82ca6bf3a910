#![cfg(unix)]

mod common;

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use common::{CameraScript, FakeCamera};
use sscs_node::config::Config;

#[test]
fn sigterm_shuts_the_daemon_down_cleanly() -> anyhow::Result<()> {
    let camera = FakeCamera::spawn(CameraScript {
        delta_frames: 3,
        hang_up: false,
    });
    let dir = tempfile::tempdir()?;

    let mut cfg = Config::default();
    cfg.recorder.url = camera.url();
    cfg.recorder.recordings_dir = dir.path().join("rec");
    cfg.recognizer.thumbs_dir = dir.path().join("thumbs");
    cfg.indexer.index_path = dir.path().join("index.jsonl");
    let cfg_path = dir.path().join("sscs.toml");
    std::fs::write(&cfg_path, toml::to_string(&cfg)?)?;

    let mut child = Command::new(env!("CARGO_BIN_EXE_sscs-node"))
        .arg(&cfg_path)
        .env("RUST_LOG", "warn")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    // a chunk on disk means the handler is installed and the session is up
    let rec = cfg.recorder.recordings_dir.clone();
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline
        && std::fs::read_dir(&rec).map(|d| d.count()).unwrap_or(0) == 0
    {
        std::thread::sleep(Duration::from_millis(20));
    }

    let kill = Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()?;
    assert!(kill.success());

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("daemon ignored SIGTERM");
        }
        std::thread::sleep(Duration::from_millis(20));
    };
    assert!(status.success(), "exit status {:?}", status);

    // the shutdown path ran: the final chunk made it into the index
    let index = std::fs::read_to_string(&cfg.indexer.index_path)?;
    assert!(index.lines().any(|l| l.contains("\"kind\":\"segment\"")));

    assert_eq!(camera.finish().last().map(String::as_str), Some("TEARDOWN"));
    Ok(())
}
