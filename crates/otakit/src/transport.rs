//! Transport adapter - fetch a bundle archive and lay it out on disk.
//!
//! The transport owns only bytes and files. Bundle records, statuses and
//! events are the download manager's job.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{OtaError, OtaResult};
use crate::PLUGIN_VERSION;

/// Where to get a bundle and how to verify it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub version: String,
    /// Expected SHA-256 of the archive, hex
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    /// SHA-256 of what was fetched, when it could be computed
    pub checksum: Option<String>,
}

/// Progress callback, percent in 0..=100
pub type Progress<'a> = &'a (dyn Fn(u8) + Send + Sync);

#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch `request` and extract it into `dest`, an empty directory
    async fn fetch(
        &self,
        request: &FetchRequest,
        dest: &Path,
        progress: Progress<'_>,
    ) -> OtaResult<FetchOutcome>;
}

/// HTTP(S) download of a zip archive
pub struct HttpTransport {
    client: reqwest::Client,
    scratch_dir: PathBuf,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration, scratch_dir: impl Into<PathBuf>) -> OtaResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("otakit/{}", PLUGIN_VERSION))
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            scratch_dir: scratch_dir.into(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        request: &FetchRequest,
        dest: &Path,
        progress: Progress<'_>,
    ) -> OtaResult<FetchOutcome> {
        info!("Downloading {} from {}", request.version, request.url);

        let mut response = self
            .client
            .get(&request.url)
            .send()
            .await?
            .error_for_status()?;
        let total = response.content_length().filter(|len| *len > 0);

        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let archive = self
            .scratch_dir
            .join(format!("{}.zip", uuid::Uuid::new_v4().simple()));
        // Removes the partial archive on every exit path
        let _cleanup = ScratchFile(archive.clone());

        let mut file = tokio::fs::File::create(&archive).await?;
        let mut hasher = Sha256::new();
        let mut received: u64 = 0;
        progress(0);

        while let Some(chunk) = response.chunk().await? {
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if let Some(total) = total {
                progress(((received.min(total) * 100) / total).min(99) as u8);
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let checksum = hex::encode(hasher.finalize());
        verify_checksum(&request.version, request.checksum.as_deref(), &checksum)?;
        debug!("Received {} bytes for {}, sha256 {}", received, request.version, checksum);

        let version = request.version.clone();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extract_archive(&archive, &dest, &version))
            .await
            .map_err(|e| OtaError::Storage(format!("Extraction task failed: {}", e)))??;

        progress(100);
        Ok(FetchOutcome {
            checksum: Some(checksum),
        })
    }
}

/// Install from the local filesystem: a directory tree or a zip archive.
///
/// `url` is a plain path or a `file://` URL.
#[derive(Debug, Default, Clone)]
pub struct DirectoryTransport;

#[async_trait]
impl Transport for DirectoryTransport {
    async fn fetch(
        &self,
        request: &FetchRequest,
        dest: &Path,
        progress: Progress<'_>,
    ) -> OtaResult<FetchOutcome> {
        let source = PathBuf::from(request.url.strip_prefix("file://").unwrap_or(&request.url));
        if !source.exists() {
            return Err(OtaError::NetworkError(format!(
                "Source {} does not exist",
                source.display()
            )));
        }
        progress(0);

        let version = request.version.clone();
        let expected = request.checksum.clone();
        let dest = dest.to_path_buf();
        let checksum = tokio::task::spawn_blocking(move || -> OtaResult<Option<String>> {
            if source.is_dir() {
                if expected.is_some() {
                    return Err(OtaError::InvalidArgument(
                        "Checksum verification needs an archive, not a directory".into(),
                    ));
                }
                copy_tree(&source, &dest)?;
                Ok(None)
            } else {
                let checksum = sha256_file(&source)?;
                verify_checksum(&version, expected.as_deref(), &checksum)?;
                extract_archive(&source, &dest, &version)?;
                Ok(Some(checksum))
            }
        })
        .await
        .map_err(|e| OtaError::Storage(format!("Install task failed: {}", e)))??;

        progress(100);
        Ok(FetchOutcome { checksum })
    }
}

struct ScratchFile(PathBuf);

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.0) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.0.display(), e);
            }
        }
    }
}

fn verify_checksum(version: &str, expected: Option<&str>, actual: &str) -> OtaResult<()> {
    match expected {
        Some(expected) if !expected.eq_ignore_ascii_case(actual) => Err(OtaError::invalid_bundle(
            version,
            format!("checksum mismatch: expected {}, got {}", expected, actual),
        )),
        _ => Ok(()),
    }
}

pub fn sha256_file(path: &Path) -> OtaResult<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Extract a zip archive into `dest`, rejecting entries that escape it
pub fn extract_archive(archive: &Path, dest: &Path, version: &str) -> OtaResult<()> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| OtaError::invalid_bundle(version, format!("not a zip archive: {}", e)))?;
    fs::create_dir_all(dest)?;

    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| OtaError::invalid_bundle(version, format!("corrupt archive: {}", e)))?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(OtaError::invalid_bundle(
                version,
                format!("unsafe path in archive: {}", entry.name()),
            ));
        };
        if relative.starts_with("__MACOSX") {
            continue;
        }

        let out = dest.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
        } else {
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut target = File::create(&out)?;
            io::copy(&mut entry, &mut target)?;
        }
    }

    flatten_single_root(dest)?;
    Ok(())
}

/// Archives often wrap everything in one top-level folder; hoist its contents
fn flatten_single_root(dest: &Path) -> io::Result<()> {
    let entries: Vec<PathBuf> = fs::read_dir(dest)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    let [root] = entries.as_slice() else {
        return Ok(());
    };
    if !root.is_dir() {
        return Ok(());
    }

    let hoisted = dest.join(".otakit-flatten");
    fs::rename(root, &hoisted)?;
    for child in fs::read_dir(&hoisted)? {
        let child = child?;
        fs::rename(child.path(), dest.join(child.file_name()))?;
    }
    fs::remove_dir(&hoisted)
}

fn copy_tree(source: &Path, dest: &Path) -> OtaResult<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| OtaError::Storage(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| OtaError::Storage(e.to_string()))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
