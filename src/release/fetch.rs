//! HTTP fetching for release assets
//!
//! Provides:
//! - Progress-tracked downloads with SHA256 computed while writing
//! - Retry with exponential backoff
//! - Small text fetches (hash manifests, updater configs)

use crate::error::{Error, Result};
use chrono_machines::{BackoffStrategy, ExponentialBackoff};
use rand::rng;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Retry/backoff configuration for mirror downloads
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_attempts: u8,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            multiplier: 2.0,
            max_attempts: 5,
            jitter_factor: 0.25,
        }
    }
}

fn backoff_from_config(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoff::new()
        .base_delay_ms(config.base_delay_ms)
        .max_delay_ms(config.max_delay_ms)
        .multiplier(config.multiplier)
        .max_attempts(config.max_attempts)
        .jitter_factor(config.jitter_factor)
}

fn get_with_retry(url: &str, retry_config: &RetryConfig) -> Result<ureq::Body> {
    let backoff = backoff_from_config(retry_config);
    let mut rng = rng();
    let mut attempt: u8 = 0;

    loop {
        attempt += 1;
        match ureq::get(url).call() {
            Ok(response) => return Ok(response.into_body()),
            Err(e) => {
                if let Some(delay_ms) = backoff.delay(attempt, &mut rng) {
                    log::warn!(
                        "Download attempt {} for {} failed, retrying in {}ms",
                        attempt,
                        url,
                        delay_ms
                    );
                    thread::sleep(Duration::from_millis(delay_ms));
                } else {
                    return Err(Error::DownloadFailed(format!(
                        "{} after {} attempts: {}",
                        url, attempt, e
                    )));
                }
            }
        }
    }
}

/// Download a file, hashing while writing
///
/// Returns the SHA256 of the downloaded content as lowercase hex.
pub fn download_file(url: &str, dest: &Path, retry_config: &RetryConfig) -> Result<String> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    log::info!("Downloading {}", url);
    let body = get_with_retry(url, retry_config)?;

    let mut file = File::create(dest)?;
    let mut reader = body.into_reader();
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];
    let mut downloaded: u64 = 0;

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| Error::DownloadFailed(format!("read error from {}: {}", url, e)))?;
        if bytes_read == 0 {
            break;
        }
        file.write_all(&buffer[..bytes_read])?;
        hasher.update(&buffer[..bytes_read]);
        downloaded += bytes_read as u64;
    }

    log::debug!("Downloaded {} bytes from {}", downloaded, url);
    Ok(hex::encode(hasher.finalize()))
}

/// Fetch a text file (hash manifest, updater config) into memory
pub fn fetch_text(url: &str, retry_config: &RetryConfig) -> Result<String> {
    let mut body = get_with_retry(url, retry_config)?;
    body.read_to_string()
        .map_err(|e| Error::DownloadFailed(format!("reading body of {}: {}", url, e)))
}

/// Check if a URL exists (HEAD request)
pub fn url_exists(url: &str, retry_config: &RetryConfig) -> bool {
    let backoff = backoff_from_config(retry_config);
    let mut rng = rng();
    let mut attempt: u8 = 0;

    loop {
        attempt += 1;
        match ureq::head(url).call() {
            Ok(_) => return true,
            Err(ureq::Error::StatusCode(404)) => return false,
            Err(_) => {
                if let Some(delay_ms) = backoff.delay(attempt, &mut rng) {
                    thread::sleep(Duration::from_millis(delay_ms));
                } else {
                    return false;
                }
            }
        }
    }
}

/// Compute the SHA256 hash of a local file
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_of_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("asset.txt");
        fs::write(&path, b"hello world\n").unwrap();

        let hash = sha256_file(&path).unwrap();
        assert_eq!(
            hash,
            "a948904f2f0f479b8f8197694b30184b0d2ed1c1cd2a1ec0fb85d299a192a447"
        );
    }

    #[test]
    fn test_default_retry_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert!(config.jitter_factor > 0.0);
    }
}
