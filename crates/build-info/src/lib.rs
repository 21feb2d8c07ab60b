//! Build metadata baked in by `build.rs`, surfaced in startup logs and the
//! diagnostics report.

use once_cell::sync::Lazy;

#[derive(Debug)]
struct BuildInfo {
    id: &'static str,
    built_at: &'static str,
    revision: &'static str,
}

static INFO: Lazy<BuildInfo> = Lazy::new(|| BuildInfo {
    id: option_env!("CODELEXA_BUILD_ID").unwrap_or("unknown"),
    built_at: option_env!("CODELEXA_BUILD_TIME").unwrap_or("unknown"),
    revision: option_env!("CODELEXA_BUILD_REV").unwrap_or("nogit"),
});

/// Full build identifier, e.g. `1a2b3c4d5e@2026-01-01T00:00:00Z (release)`.
pub fn build_id() -> &'static str {
    INFO.id
}

pub fn built_at() -> &'static str {
    INFO.built_at
}

pub fn revision() -> &'static str {
    INFO.revision
}

/// One-line banner for a binary's first log line.
pub fn formatted_banner(package: &str, version: &str) -> String {
    format!("{package} v{version} [{}]", build_id())
}
