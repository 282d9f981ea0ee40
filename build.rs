//! Embeds the build timestamp used as the freshness floor for web updates.
//!
//! Prefers `SOURCE_DATE_EPOCH`, then the commit time of `HEAD`, so that
//! reproducible builds of the same revision share the same floor.

use std::process::Command;

fn main() {
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    println!("cargo:rerun-if-changed=.git/HEAD");

    let timestamp = std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .or_else(git_commit_timestamp)
        .unwrap_or_else(|| {
            println!("cargo:warning=no commit timestamp available, update freshness floor is 0");
            0
        });

    println!("cargo:rustc-env=WEBPATCH_BUILD_TIMESTAMP={}", timestamp);
}

fn git_commit_timestamp() -> Option<i64> {
    let output = Command::new("git")
        .args(["log", "-1", "--format=%ct"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok()?.trim().parse().ok()
}
