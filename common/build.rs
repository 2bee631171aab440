// Resolve the commit hash at build time so the bootnode can report
// `<crate version>-<commit>` in its --version output and startup log.

use std::process::Command;

fn main() {
    let commit_hash = match option_env!("TOS_COMMIT_HASH") {
        Some(hash) if hash.len() >= 7 => hash[0..7].to_string(),
        _ => Command::new("git")
            .args(["rev-parse", "--short", "HEAD"])
            .output()
            .ok()
            .filter(|output| output.status.success())
            .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    };

    let build_version = format!("{}-{}", env!("CARGO_PKG_VERSION"), commit_hash);
    println!("cargo:rerun-if-env-changed=TOS_COMMIT_HASH");
    println!("cargo:rustc-env=BUILD_VERSION={build_version}");
}
