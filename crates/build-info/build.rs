use std::env;
use std::process::Command;

use chrono::Utc;

fn main() {
    println!("cargo:rerun-if-env-changed=CODELEXA_BUILD_ID_OVERRIDE");
    println!("cargo:rerun-if-changed=../../.git/HEAD");

    let built_at = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let revision = git_revision().unwrap_or_else(|| "nogit".to_string());
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());

    let build_id = match env::var("CODELEXA_BUILD_ID_OVERRIDE") {
        Ok(value) if !value.trim().is_empty() => value,
        _ => format!("{revision}@{built_at} ({profile})"),
    };

    println!("cargo:rustc-env=CODELEXA_BUILD_ID={build_id}");
    println!("cargo:rustc-env=CODELEXA_BUILD_TIME={built_at}");
    println!("cargo:rustc-env=CODELEXA_BUILD_REV={revision}");
}

fn git_revision() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short=10", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let rev = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!rev.is_empty()).then_some(rev)
}
