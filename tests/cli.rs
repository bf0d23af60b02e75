use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

struct Sandbox {
    home: TempDir,
    cwd: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        Self {
            home: TempDir::new().unwrap(),
            cwd: TempDir::new().unwrap(),
        }
    }

    fn perfrun(&self) -> Command {
        let mut cmd = Command::cargo_bin("perfrun").unwrap();
        cmd.current_dir(self.cwd.path())
            .env("HOME", self.home.path())
            .env("XDG_CONFIG_HOME", self.home.path().join(".config"))
            .env_remove("PERFRUN_API_URL")
            .env_remove("PERFRUN_PROJECT")
            .env_remove("PERFRUN_DEVICE_POOL")
            .env_remove("PERFRUN_ENV_FILE")
            .env_remove("PERFRUN_LOG");
        cmd
    }
}

#[test]
fn help_lists_commands() {
    let sandbox = Sandbox::new();
    sandbox
        .perfrun()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("analyze"))
        .stdout(predicate::str::contains("cache"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn config_rejects_zero_batch_size() {
    let sandbox = Sandbox::new();
    sandbox
        .perfrun()
        .args(["config", "set", "max_batch_size", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_batch_size"));
}

#[test]
fn config_set_then_get_and_list() {
    let sandbox = Sandbox::new();
    sandbox
        .perfrun()
        .args(["config", "set", "--global", "max_batch_size", "25"])
        .assert()
        .success();
    sandbox
        .perfrun()
        .args(["config", "set", "--global", "device_pool", "pixel-pool"])
        .assert()
        .success();

    sandbox
        .perfrun()
        .args(["config", "get", "max_batch_size"])
        .assert()
        .success()
        .stdout(predicate::str::diff("25\n"));

    let output = sandbox
        .perfrun()
        .args(["config", "list", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let listed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(listed["device_pool"], "pixel-pool");
    assert_eq!(listed["max_batch_size"], "25");

    assert!(sandbox
        .home
        .path()
        .join(".config/perfrun/config.json")
        .is_file());
}

#[test]
fn unknown_config_key_fails() {
    let sandbox = Sandbox::new();
    sandbox
        .perfrun()
        .args(["config", "set", "bogus", "1"])
        .assert()
        .failure();
}

#[test]
fn cache_clear_removes_snapshot() {
    let sandbox = Sandbox::new();
    let dir = sandbox.cwd.path().join("traces");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(".metrics_cache.json"), "[]").unwrap();

    sandbox
        .perfrun()
        .args(["cache", "clear", "--json"])
        .arg(&dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"cleared\":true"));
    assert!(!dir.join(".metrics_cache.json").exists());

    sandbox
        .perfrun()
        .args(["cache", "show", "--json"])
        .arg(&dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"exists\":false"));
}

#[test]
fn analyze_missing_directory_fails() {
    let sandbox = Sandbox::new();
    sandbox
        .perfrun()
        .args(["analyze", "missing-base", "missing-test"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing-base"));
}

#[test]
fn run_requires_api_url() {
    let sandbox = Sandbox::new();
    sandbox
        .perfrun()
        .args([
            "run",
            "--app",
            "app.apk",
            "--test-package",
            "tests.apk",
            "--test-class",
            "com.example.Startup#cold",
            "-n",
            "10",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("api_url is not configured"));
}

#[cfg(unix)]
fn fake_trace_processor(dir: &Path) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    // Echo the trace file, which holds the query result.
    let script = dir.join("trace_processor_shell");
    fs::write(&script, "#!/bin/sh\ncat \"$3\"\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    script
}

#[cfg(unix)]
fn write_trace(dir: &Path, iteration: u32, bind: i64, render: i64, page_load: i64) {
    fs::create_dir_all(dir).unwrap();
    fs::write(
        dir.join(format!("startup_iter{iteration}.perfetto-trace")),
        format!("\"bind_app_ts\",\"render_ts\",\"page_load_ts\"\n{bind},{render},{page_load}\n"),
    )
    .unwrap();
}

#[cfg(unix)]
#[test]
fn analyze_compares_two_directories() {
    let sandbox = Sandbox::new();
    let tool = fake_trace_processor(sandbox.cwd.path());
    let base = sandbox.cwd.path().join("base");
    let test = sandbox.cwd.path().join("test");
    write_trace(&base.join("run-a"), 1, 0, 50_000_000, 100_000_000);
    write_trace(&base.join("run-a"), 2, 0, 50_000_000, 100_000_000);
    write_trace(&test.join("run-b"), 1, 0, 40_000_000, 90_000_000);
    write_trace(&test.join("run-b"), 2, 0, 40_000_000, 90_000_000);

    let output = sandbox
        .perfrun()
        .arg("analyze")
        .arg(&base)
        .arg(&test)
        .arg("--trace-processor")
        .arg(&tool)
        .arg("--json")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["base"]["records"], 2);
    assert_eq!(report["base"]["from_cache"], false);
    let startup = &report["comparison"]["metrics"][0];
    assert_eq!(startup["metric"], "startup");
    assert_eq!(startup["delta_ms"], -10.0);
    assert!(base.join(".metrics_cache.json").is_file());

    let second = sandbox
        .perfrun()
        .arg("analyze")
        .arg(&base)
        .arg(&test)
        .arg("--trace-processor")
        .arg(&tool)
        .arg("--json")
        .output()
        .unwrap();
    let report: serde_json::Value = serde_json::from_slice(&second.stdout).unwrap();
    assert_eq!(report["test"]["from_cache"], true);
}
