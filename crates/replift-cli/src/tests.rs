use std::fs;
use std::io::{Cursor, Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::sync::Mutex;
use std::thread;

use replift_engine::{CancelFlag, ProgressSink, StageOutcome};

use crate::config::AppConfig;
use crate::download;
use crate::flows;

#[test]
fn parse_config_with_defaults() {
    let config = AppConfig::from_toml_str(
        r#"
app_name = "demo"
base_dir = "/opt/demo"
catalog = "https://updates.example.test/demo/catalog.toml"
"#,
    )
    .expect("config should parse");

    assert_eq!(config.app_name, "demo");
    assert_eq!(config.base_dir, Path::new("/opt/demo"));

    let targets = config.install_targets();
    assert_eq!(targets.base(), Path::new("/opt/demo"));
    assert_eq!(
        config.state_path(),
        Path::new("/opt/demo/.replift/client.state")
    );
    assert_eq!(
        config.uninstall_data_path(),
        Path::new("/opt/demo/.replift/uninstall.dat")
    );
    assert_eq!(
        config.registry_dir(),
        Path::new("/opt/demo/.replift/registry")
    );
    assert_eq!(
        config.handoff_path(),
        Path::new("/opt/demo/.replift/handoff.bin")
    );
}

/// Serves exactly one response on a throwaway port, optionally without a
/// Content-Length header.
fn serve_once(body: &'static [u8], with_length: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener must bind");
    let addr = listener.local_addr().expect("listener address");
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut request = [0u8; 1024];
        let _ = stream.read(&mut request);
        let mut response = String::from("HTTP/1.1 200 OK\r\nConnection: close\r\n");
        if with_length {
            response.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        response.push_str("\r\n");
        let _ = stream.write_all(response.as_bytes());
        let _ = stream.write_all(body);
    });
    format!("http://{addr}/package.zip")
}

struct RecordingSink(Mutex<Vec<i32>>);

impl ProgressSink for RecordingSink {
    fn report(&self, percent: i32, _message: &str) {
        self.0.lock().expect("sink lock").push(percent);
    }
}

#[test]
fn download_without_a_length_holds_progress_at_the_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let body: &'static [u8] = b"payload served without a content length";
    let digest_src = dir.path().join("digest-src");
    fs::write(&digest_src, body).expect("digest source");
    let expected = replift_core::sha256_hex_of_file(&digest_src).expect("digest");

    let url = serve_once(body, false);
    let dest = dir.path().join("package.zip");
    let sink = RecordingSink(Mutex::new(Vec::new()));
    let outcome = download::download_package(&[url], &expected, &dest, &CancelFlag::new(), &sink)
        .expect("download must succeed");

    assert_eq!(outcome, StageOutcome::Completed);
    assert_eq!(fs::read(&dest).expect("downloaded file"), body);
    let reports = sink.0.lock().expect("sink lock");
    assert!(!reports.is_empty());
    assert!(
        reports.iter().all(|percent| *percent >= 0),
        "negative progress is reserved for cancellation"
    );
}

#[test]
fn cancelled_download_reports_the_cancel_marker() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = serve_once(b"never fully read", true);
    let dest = dir.path().join("package.zip");

    let cancel = CancelFlag::new();
    cancel.cancel();
    let sink = RecordingSink(Mutex::new(Vec::new()));
    let outcome = download::download_package(&[url], "unchecked", &dest, &cancel, &sink)
        .expect("cancellation is not an error");

    assert_eq!(outcome, StageOutcome::Cancelled);
    assert!(!dest.exists(), "no archive may appear");
    assert!(
        !dir.path().join("package.zip.part").exists(),
        "the partial download must be cleaned up"
    );
    let reports = sink.0.lock().expect("sink lock");
    assert_eq!(*reports, [-1]);
}

#[test]
fn parse_config_with_explicit_roots() {
    let config = AppConfig::from_toml_str(
        r#"
app_name = "demo"
base_dir = "/opt/demo"
catalog = "/srv/catalog.toml"
system_dir = "/usr/lib/demo"
state_dir = "/var/lib/demo"
scratch_dir = "/var/tmp/demo-update"
"#,
    )
    .expect("config should parse");

    assert_eq!(config.state_path(), Path::new("/var/lib/demo/client.state"));
    assert_eq!(config.scratch_dir(), Path::new("/var/tmp/demo-update"));
    assert_eq!(
        config.install_targets().root(replift_core::TargetClass::System),
        Some(Path::new("/usr/lib/demo"))
    );
}

#[test]
fn config_rejects_empty_fields() {
    AppConfig::from_toml_str(
        r#"
app_name = ""
base_dir = "/opt/demo"
catalog = "x"
"#,
    )
    .expect_err("empty app name must be rejected");

    AppConfig::from_toml_str(
        r#"
app_name = "demo"
base_dir = "/opt/demo"
catalog = "  "
"#,
    )
    .expect_err("empty catalog must be rejected");
}

#[test]
fn make_delta_produces_a_decodable_stream() {
    let dir = tempfile::tempdir().expect("tempdir");
    let original_path = dir.path().join("v1.bin");
    let target_path = dir.path().join("v2.bin");
    let delta_path = dir.path().join("v1-to-v2.delta");

    let original: Vec<u8> = (0u32..20_000).map(|i| (i % 251) as u8).collect();
    let mut target = original.clone();
    target.extend_from_slice(b"new content in v2");
    fs::write(&original_path, &original).expect("write v1");
    fs::write(&target_path, &target).expect("write v2");

    let code = flows::run_make_delta(&original_path, &target_path, &delta_path)
        .expect("make-delta must succeed");
    assert_eq!(code, 0);

    let delta = fs::read(&delta_path).expect("delta must exist");
    let mut decoded = Vec::new();
    replift_core::decode_delta(
        &mut Cursor::new(&original),
        &mut Cursor::new(&delta),
        &mut decoded,
    )
    .expect("delta must decode");
    assert_eq!(decoded, target);
}

#[test]
fn status_reads_a_local_catalog_without_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let catalog_path = dir.path().join("catalog.toml");
    fs::write(
        &catalog_path,
        r#"
app_name = "demo"
latest_version = "2.1.0"
minimum_client_version = "1.0.0"

[[updates]]
urls = ["https://mirror.test/full.zip"]
sha256 = "f00d"
"#,
    )
    .expect("catalog file");

    let config = AppConfig::from_toml_str(&format!(
        r#"
app_name = "demo"
base_dir = "{}"
catalog = "{}"
"#,
        dir.path().display(),
        catalog_path.display()
    ))
    .expect("config should parse");

    let code = flows::run_status(&config, true).expect("status must succeed");
    assert_eq!(code, 0);
}
