use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::fs;

use crate::logging::Logger;

/// Asynchronously ensures that a directory exists, creating it if it does not.
/// This function is idempotent.
pub async fn ensure_directory_exists<P: AsRef<Path>>(path: P, log: &Logger) -> Result<()> {
    let path = path.as_ref();
    if !fs::try_exists(path).await.unwrap_or(false) {
        fs::create_dir_all(path)
            .await
            .with_context(|| format!("Failed to create directory at {:?}", path))?;
        log.info(format_args!("Created directory at: {:?}", path));
    }
    Ok(())
}

/// Makes a string safe to embed in a file name.
pub fn sanitize_file_component(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            ':' | ' ' | '/' | '\\' => '_',
            c => c,
        })
        .collect()
}

/// Formats a duration as `HH:MM:SS`.
pub fn format_hms(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Seconds since the Unix epoch as a float, used for receipt timestamps.
pub fn unix_time_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs_f64()
}
