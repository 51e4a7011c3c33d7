//! Conditional retrieval of single mirror files.
//!
//! A file that already exists locally is only transferred again when the
//! mirror does not prove it older (HEAD `Last-Modified` vs local mtime).
//! Bodies land in a temporary file that is renamed over the destination
//! once complete, so readers never observe a partial download. The local
//! mtime is then pinned to the mirror's `Last-Modified`.

use chrono::{DateTime, NaiveDateTime, Utc};
use filetime::FileTime;
use reqwest::header::{HeaderMap, LAST_MODIFIED};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const HTTP_OK: u16 = 200;
const HTTP_NOT_FOUND: u16 = 404;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("unable to build http client")]
    Client(#[source] reqwest::Error),
    #[error("unable to retrieve file from [{url}]")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("[{0}] is not a usable local file url")]
    FileUrl(String),
    #[error("unable to download file [{url}]: status {status}")]
    Status { url: String, status: u16 },
    #[error("error copying data from [{url}] to local file [{}]", .path.display())]
    Body {
        url: String,
        path: PathBuf,
        status: u16,
        #[source]
        source: io::Error,
    },
    #[error("filesystem error at [{}]", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FetchError {
    /// HTTP status of the response that caused the failure, if one arrived.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } | FetchError::Body { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn io(path: &Path, source: io::Error) -> Self {
        FetchError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Downloaded { status: u16, bytes: u64, sha256: String },
    /// Local copy is newer than the mirror's; nothing was transferred.
    Skipped,
}

pub struct RemoteHead {
    pub status: u16,
    pub last_modified: Option<String>,
}

pub struct RemoteBody {
    pub status: u16,
    pub last_modified: Option<String>,
    pub reader: Box<dyn Read + Send>,
}

/// Raw request layer under [`Fetcher`].
pub trait Transport {
    fn head(&self, url: &str) -> Result<RemoteHead, FetchError>;
    fn get(&self, url: &str) -> Result<RemoteBody, FetchError>;
}

/// `http(s)://` through a blocking reqwest client, `file://` straight from disk.
pub struct MirrorTransport {
    client: reqwest::blocking::Client,
}

impl MirrorTransport {
    pub fn new(timeout: Duration, connect_timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("sigupdate/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self { client })
    }
}

impl Transport for MirrorTransport {
    fn head(&self, url: &str) -> Result<RemoteHead, FetchError> {
        if let Some(path) = file_url_path(url)? {
            return file_head(&path);
        }
        let resp = self
            .client
            .head(url)
            .send()
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;
        Ok(RemoteHead {
            status: resp.status().as_u16(),
            last_modified: last_modified(resp.headers()),
        })
    }

    fn get(&self, url: &str) -> Result<RemoteBody, FetchError> {
        if let Some(path) = file_url_path(url)? {
            return file_get(&path);
        }
        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;
        Ok(RemoteBody {
            status: resp.status().as_u16(),
            last_modified: last_modified(resp.headers()),
            reader: Box::new(resp),
        })
    }
}

/// Local path of a `file://` URL, percent-decoded; `None` for other schemes.
fn file_url_path(url: &str) -> Result<Option<PathBuf>, FetchError> {
    if !url.starts_with("file:") {
        return Ok(None);
    }
    let invalid = || FetchError::FileUrl(url.to_string());
    let parsed = reqwest::Url::parse(url).map_err(|_| invalid())?;
    parsed.to_file_path().map(Some).map_err(|_| invalid())
}

fn last_modified(headers: &HeaderMap) -> Option<String> {
    headers
        .get(LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn file_head(path: &Path) -> Result<RemoteHead, FetchError> {
    match fs::metadata(path) {
        Ok(meta) => {
            let modified = meta.modified().map_err(|e| FetchError::io(path, e))?;
            Ok(RemoteHead {
                status: HTTP_OK,
                last_modified: Some(format_http_date(modified)),
            })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(RemoteHead {
            status: HTTP_NOT_FOUND,
            last_modified: None,
        }),
        Err(e) => Err(FetchError::io(path, e)),
    }
}

fn file_get(path: &Path) -> Result<RemoteBody, FetchError> {
    let head = file_head(path)?;
    if head.status != HTTP_OK {
        return Ok(RemoteBody {
            status: head.status,
            last_modified: None,
            reader: Box::new(io::empty()),
        });
    }
    let file = File::open(path).map_err(|e| FetchError::io(path, e))?;
    Ok(RemoteBody {
        status: HTTP_OK,
        last_modified: head.last_modified,
        reader: Box::new(file),
    })
}

pub struct Fetcher<T: Transport> {
    transport: T,
    mirror_url: String,
    scratch_dir: Option<PathBuf>,
}

impl<T: Transport> Fetcher<T> {
    pub fn new(transport: T, mirror_url: impl Into<String>) -> Self {
        Self {
            transport,
            mirror_url: mirror_url.into(),
            scratch_dir: None,
        }
    }

    /// Directory for in-flight downloads. Must share a filesystem with the
    /// destination for the final rename to succeed.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn url_for(&self, file_name: &str) -> String {
        format!("{}/{}", self.mirror_url.trim_end_matches('/'), file_name)
    }

    pub fn fetch(&self, url: &str, local_path: &Path) -> Result<FetchOutcome, FetchError> {
        if local_path.exists() && !self.remote_is_newer(url, local_path)? {
            return Ok(FetchOutcome::Skipped);
        }
        self.transfer(url, local_path)
    }

    fn remote_is_newer(&self, url: &str, local_path: &Path) -> Result<bool, FetchError> {
        let local_mtime = fs::metadata(local_path)
            .and_then(|m| m.modified())
            .map_err(|e| FetchError::io(local_path, e))?;
        let local_mtime = DateTime::<Utc>::from(local_mtime);
        let head = self.transport.head(url)?;
        let remote_mtime = head.last_modified.as_deref().and_then(parse_http_date);
        debug!(%url, local = %local_mtime, remote = ?remote_mtime, "comparing last-modified");

        match remote_mtime {
            Some(remote) if local_mtime > remote => {
                info!(%url, "skipping download because local copy is newer");
                Ok(false)
            }
            Some(_) => Ok(true),
            None => {
                // fail open: without a usable timestamp, refresh
                warn!(
                    %url,
                    status = head.status,
                    header = ?head.last_modified,
                    "error parsing last-modified header, downloading anyway"
                );
                Ok(true)
            }
        }
    }

    fn transfer(&self, url: &str, local_path: &Path) -> Result<FetchOutcome, FetchError> {
        let response = self.transport.get(url)?;
        if response.status != HTTP_OK {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status,
            });
        }
        let status = response.status;

        let mtime = match response.last_modified.as_deref().and_then(parse_http_date) {
            Some(remote) => SystemTime::from(remote),
            None => {
                warn!(%url, header = ?response.last_modified, "error parsing last-modified header, using current time");
                SystemTime::now()
            }
        };

        let scratch = match (&self.scratch_dir, local_path.parent()) {
            (Some(dir), _) => dir.as_path(),
            (None, Some(parent)) if !parent.as_os_str().is_empty() => parent,
            (None, _) => Path::new("."),
        };
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{file_name}-"))
            .suffix(".part")
            .tempfile_in(scratch)
            .map_err(|e| FetchError::io(scratch, e))?;
        debug!(%url, tmp = %tmp.path().display(), "downloading to temporary file");

        let mut reader = response.reader;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 8192];
        let mut bytes = 0u64;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(FetchError::Body {
                        url: url.to_string(),
                        path: local_path.to_path_buf(),
                        status,
                        source,
                    })
                }
            };
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])
                .map_err(|e| FetchError::io(tmp.path(), e))?;
            bytes += n as u64;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| FetchError::io(tmp.path(), e))?;

        tmp.persist(local_path)
            .map_err(|e| FetchError::io(local_path, e.error))?;
        filetime::set_file_mtime(local_path, FileTime::from_system_time(mtime))
            .map_err(|e| FetchError::io(local_path, e))?;

        let sha256 = hex::encode(hasher.finalize());
        info!(
            "Download complete: {} --> {} [{} bytes] sha256={}",
            url,
            local_path.display(),
            bytes,
            sha256
        );
        Ok(FetchOutcome::Downloaded {
            status,
            bytes,
            sha256,
        })
    }
}

/// Parses an HTTP-date in any of the three forms RFC 9110 requires
/// recipients to accept.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }
    const OBSOLETE: [&str; 2] = ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"];
    OBSOLETE
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

pub fn format_http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}
