//! Artifact checksums and the manifest file.
//!
//! The manifest describes the non-manifest artifacts; it is written
//! atomically (temp + rename), then hashed itself so the job result can list
//! it alongside the files it describes.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const MANIFEST_FILENAME: &str = "manifest.json";

/// SHA-256 of a file, hex encoded. Hashing is CPU-bound and reads the whole
/// file, so it runs on the blocking pool.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 1024 * 1024];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| std::io::Error::other(e.to_string()))?
}

pub fn checksum_entry(hex_digest: &str) -> String {
    format!("sha256:{hex_digest}")
}

/// Assemble the manifest document for a job's artifacts.
pub fn build_manifest(
    job_id: Uuid,
    provider: &str,
    collection: &str,
    paths: &[PathBuf],
    checksums: &BTreeMap<String, String>,
    metadata: Value,
) -> Value {
    json!({
        "job_id": job_id.to_string(),
        "provider": provider,
        "collection": collection,
        "created_at": Utc::now().to_rfc3339(),
        "paths": paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
        "checksums": checksums,
        "metadata": metadata,
    })
}

/// Write `manifest.json` into the output directory via temp file + rename.
pub async fn write_manifest(output_dir: &Path, manifest: &Value) -> std::io::Result<PathBuf> {
    let final_path = output_dir.join(MANIFEST_FILENAME);
    let tmp_path = output_dir.join(format!("{MANIFEST_FILENAME}.part"));
    let encoded = serde_json::to_vec_pretty(manifest)?;
    tokio::fs::write(&tmp_path, &encoded).await?;
    tokio::fs::rename(&tmp_path, &final_path).await?;
    Ok(final_path)
}
