use std::env;
use std::process::Command;

const VERSION_ENV: &str = "PERFRUN_VERSION_STRING";

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn main() {
    let version = env::var(VERSION_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| {
            let pkg = env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".to_string());
            let build = git(&["rev-parse", "--short=12", "HEAD"]).unwrap_or_else(|| "dev".into());
            format!("{pkg}-canary.{build}")
        });
    println!("cargo:rustc-env={VERSION_ENV}={version}");
    println!("cargo:rerun-if-env-changed={VERSION_ENV}");

    let head = git(&["rev-parse", "--git-path", "HEAD"]).unwrap_or_else(|| ".git/HEAD".into());
    println!("cargo:rerun-if-changed={head}");
}
