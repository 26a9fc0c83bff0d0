//! Invocation of the external TruffleHog binary against enumerated images.
//! The binary is optional; its absence only disables secret scanning.

use anyhow::{bail, Context, Result};
use std::env;
use std::process::Command;

/// Checks whether `trufflehog` can be found on PATH.
pub fn trufflehog_installed() -> bool {
    let Some(paths) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&paths).any(|dir| dir.join("trufflehog").is_file())
}

/// Runs `trufflehog docker --image=<reference>` and logs the combined output.
pub fn run_trufflehog(reference: &str) -> Result<()> {
    let output = Command::new("trufflehog")
        .arg("docker")
        .arg(format!("--image={reference}"))
        .output()
        .context("failed to launch trufflehog")?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    let combined = combined.trim();

    if !output.status.success() {
        bail!("trufflehog exited with {}: {combined}", output.status);
    }

    log::info!("trufflehog completed for {reference}:\n{combined}");
    Ok(())
}
