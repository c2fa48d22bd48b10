//! Stamps the binary with `DOP_VERSION` and `DOP_GIT_SHA`.
//!
//! The release pipeline may set either one; otherwise the package version and
//! the checked-out commit are used.

use std::env;
use std::process::Command;

const STAMPS: [(&str, fn() -> String); 2] = [
    ("DOP_VERSION", package_version),
    ("DOP_GIT_SHA", commit_id),
];

fn main() {
    for (key, fallback) in STAMPS {
        println!("cargo:rerun-if-env-changed={}", key);
        let value = env::var(key)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(fallback);
        println!("cargo:rustc-env={}={}", key, value);
    }
}

fn package_version() -> String {
    env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "unknown".into())
}

/// Short commit id, suffixed with `-dirty` for a modified work tree.
fn commit_id() -> String {
    let Some(sha) = git(&["rev-parse", "--short=8", "HEAD"]) else {
        return "unknown".into();
    };
    match git(&["status", "--porcelain", "--untracked-files=no"]) {
        Some(changes) if !changes.is_empty() => format!("{}-dirty", sha),
        _ => sha,
    }
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}
