//! Rule-set fetching: file or HTTP vehicle, md5 dedup, on-disk persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use md5::{Digest, Md5};
use tracing::debug;

use crate::error::{Error, Result};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleKind {
    File,
    Http,
}

impl VehicleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleKind::File => "File",
            VehicleKind::Http => "HTTP",
        }
    }
}

/// Where rule-set bytes come from. Both vehicles share an on-disk path: the
/// file vehicle reads it, the HTTP vehicle caches into it.
#[derive(Debug, Clone)]
pub enum Vehicle {
    File { path: PathBuf },
    Http { url: String, path: PathBuf },
}

impl Vehicle {
    pub fn kind(&self) -> VehicleKind {
        match self {
            Vehicle::File { .. } => VehicleKind::File,
            Vehicle::Http { .. } => VehicleKind::Http,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Vehicle::File { path } | Vehicle::Http { path, .. } => path,
        }
    }

    pub async fn read(&self, name: &str) -> Result<Vec<u8>> {
        match self {
            Vehicle::File { path } => tokio::fs::read(path)
                .await
                .map_err(|e| Error::provider(name, e)),
            Vehicle::Http { url, .. } => {
                let client = reqwest::Client::builder()
                    .timeout(HTTP_TIMEOUT)
                    .build()
                    .map_err(|e| Error::provider(name, e))?;
                let response = client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| Error::provider(name, e))?;
                if !response.status().is_success() {
                    return Err(Error::provider(
                        name,
                        format!("http status {}", response.status()),
                    ));
                }
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| Error::provider(name, e))?;
                Ok(body.to_vec())
            }
        }
    }
}

pub type Parser<T> = Box<dyn Fn(&[u8]) -> Result<T> + Send + Sync>;

/// Loads and refreshes one rule-set, deduplicating by content hash.
pub struct Fetcher<T> {
    name: String,
    vehicle: Vehicle,
    hash: [u8; 16],
    parser: Parser<T>,
}

impl<T> Fetcher<T> {
    pub fn new(name: impl Into<String>, vehicle: Vehicle, parser: Parser<T>) -> Self {
        Self {
            name: name.into(),
            vehicle,
            hash: [0; 16],
            parser,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vehicle_kind(&self) -> VehicleKind {
        self.vehicle.kind()
    }

    /// First load. Prefers the on-disk copy; a stale copy that no longer
    /// parses triggers one re-fetch through the vehicle. Fetched bytes are
    /// persisted so the next start works offline.
    pub async fn initial(&mut self) -> Result<T> {
        let (mut buf, mut has_local) = match tokio::fs::read(self.vehicle.path()).await {
            Ok(buf) => (buf, true),
            Err(_) => (self.vehicle.read(&self.name).await?, false),
        };

        let parsed = match (self.parser)(&buf) {
            Ok(parsed) => parsed,
            Err(e) => {
                if !has_local {
                    return Err(e);
                }
                debug!(provider = %self.name, error = %e, "local rule set invalid, refetching");
                buf = self.vehicle.read(&self.name).await?;
                has_local = false;
                (self.parser)(&buf)?
            }
        };

        if self.vehicle.kind() != VehicleKind::File && !has_local {
            safe_write(self.vehicle.path(), &buf)
                .await
                .map_err(|e| Error::provider(&self.name, e))?;
        }

        self.hash = Md5::digest(&buf).into();
        Ok(parsed)
    }

    /// Refresh. `(None, true)` means the content hash was unchanged.
    pub async fn update(&mut self) -> Result<(Option<T>, bool)> {
        let buf = self.vehicle.read(&self.name).await?;
        let hash: [u8; 16] = Md5::digest(&buf).into();
        if hash == self.hash {
            return Ok((None, true));
        }

        let parsed = (self.parser)(&buf)?;
        if self.vehicle.kind() != VehicleKind::File {
            safe_write(self.vehicle.path(), &buf)
                .await
                .map_err(|e| Error::provider(&self.name, e))?;
        }
        self.hash = hash;
        Ok((Some(parsed), false))
    }
}

async fn safe_write(path: &Path, buf: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, buf).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf8_parser() -> Parser<String> {
        Box::new(|buf| {
            std::str::from_utf8(buf)
                .map(str::to_string)
                .map_err(|e| Error::provider("test", e))
        })
    }

    #[tokio::test]
    async fn initial_reads_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yaml");
        tokio::fs::write(&path, b"content").await.unwrap();

        let mut fetcher = Fetcher::new("test", Vehicle::File { path }, utf8_parser());
        assert_eq!(fetcher.initial().await.unwrap(), "content");
    }

    #[tokio::test]
    async fn update_short_circuits_on_same_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yaml");
        tokio::fs::write(&path, b"content").await.unwrap();

        let mut fetcher = Fetcher::new("test", Vehicle::File { path: path.clone() }, utf8_parser());
        fetcher.initial().await.unwrap();

        let (parsed, same) = fetcher.update().await.unwrap();
        assert!(same);
        assert!(parsed.is_none());

        tokio::fs::write(&path, b"changed").await.unwrap();
        let (parsed, same) = fetcher.update().await.unwrap();
        assert!(!same);
        assert_eq!(parsed.unwrap(), "changed");
    }

    #[tokio::test]
    async fn missing_file_vehicle_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");
        let mut fetcher = Fetcher::new("test", Vehicle::File { path }, utf8_parser());
        assert!(fetcher.initial().await.is_err());
    }
}
