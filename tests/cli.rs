//! CLI-surface tests driven through the compiled `multifetch` binary
//! (spec §6 URL validation). The download mechanics themselves (scenarios
//! S1-S6) are exercised directly against the library in `tests/engine.rs`,
//! since they need a plain-HTTP mock server and URL validation requires
//! HTTPS.

use assert_cmd::Command;

#[test]
fn rejects_non_https_url_without_contacting_any_server() {
    let mut cmd = Command::cargo_bin("multifetch").unwrap();
    cmd.arg("http://example.com/file.bin").arg("--quiet");
    cmd.assert().failure();
}

#[test]
fn prints_usage_with_no_arguments() {
    let mut cmd = Command::cargo_bin("multifetch").unwrap();
    cmd.assert().failure();
}
