// fetch.rs — Fetch-and-persist stage: model artifact download from Hugging Face.
//
// Downloads tokenizer files, architecture config, and safetensors weights for
// the fixed model id into the output directory, creating it if absent. Each
// file is written atomically (.tmp then rename) and its SHA256 is logged as an
// integrity record. Re-running against a populated directory is a no-op.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use sha2::{Digest, Sha256};

use crate::config;

/// Returns the local output directory path (./bge-small-onnx/).
pub fn output_dir() -> PathBuf {
    PathBuf::from(config::model::OUTPUT_DIR)
}

/// Check if all required artifact files exist locally.
pub fn artifacts_exist(dir: &Path) -> bool {
    config::model::ARTIFACT_FILES
        .iter()
        .all(|f| dir.join(f).exists())
}

/// Download all artifact files if not already present. Returns the output
/// directory path. An interrupted run may leave the directory partially
/// populated; that state is not detected or repaired here (missing files are
/// simply fetched again on the next run, present ones kept as-is).
pub fn ensure_artifacts() -> anyhow::Result<PathBuf> {
    let dir = output_dir();

    if artifacts_exist(&dir) {
        log::info!(
            "Model artifacts already present at {}, skipping download",
            dir.display()
        );
        return Ok(dir);
    }

    log::info!(
        "Downloading {} from Hugging Face...",
        config::model::MODEL_ID
    );
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create output dir {}", dir.display()))?;

    for file in config::model::ARTIFACT_FILES {
        let dest = dir.join(file);
        if dest.exists() {
            log::info!("{} already present, skipping", file);
            continue;
        }
        download_file(&artifact_url(file), &dest)?;
    }

    log::info!("Model and tokenizer saved to {}", dir.display());
    Ok(dir)
}

/// Registry URL for one artifact file.
pub fn artifact_url(file: &str) -> String {
    format!("{}/{file}", config::model::REGISTRY_BASE)
}

/// Download a file from URL and write it atomically. The SHA256 of the body is
/// logged so operators can cross-check against the registry's listed hashes
/// (the registry is revision-addressed, so no hashes are pinned in code).
fn download_file(url: &str, dest: &Path) -> anyhow::Result<()> {
    let filename = dest.file_name().unwrap_or_default().to_string_lossy();
    log::info!("Downloading {} from {}", filename, url);

    let resp = ureq::get(url)
        .timeout(std::time::Duration::from_secs(
            config::fetch::DOWNLOAD_TIMEOUT_SECS,
        ))
        .call()
        .with_context(|| format!("failed to download {url}"))?;

    let status = resp.status();
    if status != 200 {
        bail!("HTTP {status} downloading {url}");
    }

    // Read body into memory (the largest file, model.safetensors, is ~130 MB).
    let mut body = Vec::new();
    resp.into_reader()
        .read_to_end(&mut body)
        .with_context(|| format!("failed to read response body for {url}"))?;

    if body.is_empty() {
        bail!("empty response body for {url}");
    }

    let mut hasher = Sha256::new();
    hasher.update(&body);
    let sha = hex::encode(hasher.finalize());
    log::info!("Fetched {} ({} bytes, sha256 {})", filename, body.len(), &sha[..12]);

    write_atomic(dest, &body)
}

/// Write bytes to `dest` via a .tmp sibling and rename, so a crash mid-write
/// never leaves a truncated file under the final name.
pub fn write_atomic(dest: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let tmp_path = dest.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;
    file.write_all(bytes)?;
    file.flush()?;
    drop(file);

    fs::rename(&tmp_path, dest).with_context(|| {
        format!(
            "failed to rename {} -> {}",
            tmp_path.display(),
            dest.display()
        )
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_url() {
        assert_eq!(
            artifact_url("tokenizer.json"),
            "https://huggingface.co/BAAI/bge-small-en-v1.5/resolve/main/tokenizer.json"
        );
    }

    #[test]
    fn test_artifacts_exist_empty_dir() {
        let dir = std::env::temp_dir().join("bge_convert_test_empty");
        let _ = fs::create_dir_all(&dir);
        assert!(!artifacts_exist(&dir));
    }

    #[test]
    fn test_write_atomic_overwrites() {
        let dir = std::env::temp_dir().join("bge_convert_test_atomic");
        fs::create_dir_all(&dir).unwrap();
        let dest = dir.join("out.bin");

        write_atomic(&dest, b"first").unwrap();
        write_atomic(&dest, b"second run").unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"second run");
        // No stale staging file left behind.
        assert!(!dest.with_extension("tmp").exists());
    }
}
