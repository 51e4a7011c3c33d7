//! Local version discovery through ClamAV's `sigtool`.

use std::ffi::OsStr;
use std::io::{self, Read};
use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const SIGTOOL_EXE: &str = "sigtool";
const VERSION_LABEL: &str = "Version:";
const VALIDATED_MARKER: &str = "Verification OK";
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("the ClamAV executable sigtool was not found in the current directory nor in the system path")]
    NotFound,
    #[error("configured sigtool path does not exist: {0}")]
    MissingExecutable(PathBuf),
    #[error("error running sigtool [{path}]")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("error reading sigtool output")]
    Read(#[source] std::io::Error),
    #[error("sigtool did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("error converting [{value}] to 64-bit integer")]
    BadVersion {
        value: String,
        #[source]
        source: ParseIntError,
    },
    #[error("the file was not reported as validated")]
    NotValidated,
    #[error("no version information was available for file")]
    NoVersion,
    #[error("error waiting for sigtool to exit")]
    Wait(#[source] std::io::Error),
    #[error("sigtool exited with {0}")]
    Exit(ExitStatus),
}

/// Reports the version of a local signature file, failing when the file
/// cannot be validated.
pub trait VersionProbe {
    fn probe(&self, path: &Path) -> Result<i64, ProbeError>;
}

#[derive(Debug, Clone)]
pub struct Sigtool {
    path: PathBuf,
    timeout: Duration,
}

impl Sigtool {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    /// Uses `configured` when given, otherwise searches the working directory
    /// and then `PATH`.
    pub fn locate(configured: Option<&Path>, timeout: Duration) -> Result<Self, ProbeError> {
        let cwd = std::env::current_dir().ok();
        let search_path = std::env::var_os("PATH");
        Self::locate_in(configured, cwd.as_deref(), search_path.as_deref(), timeout)
    }

    fn locate_in(
        configured: Option<&Path>,
        cwd: Option<&Path>,
        search_path: Option<&OsStr>,
        timeout: Duration,
    ) -> Result<Self, ProbeError> {
        let path = match configured {
            Some(p) if p.is_file() => p.to_path_buf(),
            Some(p) => return Err(ProbeError::MissingExecutable(p.to_path_buf())),
            None => find_sigtool(cwd, search_path).ok_or(ProbeError::NotFound)?,
        };
        Ok(Self::new(path, timeout))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VersionProbe for Sigtool {
    fn probe(&self, path: &Path) -> Result<i64, ProbeError> {
        let mut child = Command::new(&self.path)
            .arg("-i")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ProbeError::Spawn {
                path: self.path.clone(),
                source,
            })?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProbeError::Read(io::Error::other("stdout not captured")))?;

        let deadline = Instant::now() + self.timeout;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = Vec::new();
            let res = stdout.read_to_end(&mut buf).map(|_| buf);
            let _ = tx.send(res);
        });

        let output = match rx.recv_timeout(self.timeout) {
            Ok(res) => res,
            Err(RecvTimeoutError::Timeout) => {
                terminate(&mut child);
                return Err(ProbeError::TimedOut(self.timeout));
            }
            Err(RecvTimeoutError::Disconnected) => {
                terminate(&mut child);
                return Err(ProbeError::Read(io::Error::other(
                    "sigtool output reader stopped unexpectedly",
                )));
            }
        };
        // stdout may close well before the process exits
        let status = match wait_until(&mut child, deadline) {
            Ok(Some(status)) => status,
            Ok(None) => {
                terminate(&mut child);
                return Err(ProbeError::TimedOut(self.timeout));
            }
            Err(err) => {
                terminate(&mut child);
                return Err(ProbeError::Wait(err));
            }
        };
        let output = output.map_err(ProbeError::Read)?;
        let text = String::from_utf8_lossy(&output);
        debug!(file = %path.display(), "sigtool output:\n{}", text.trim_end());

        let version = parse_sigtool_output(&text)?;
        if !status.success() {
            return Err(ProbeError::Exit(status));
        }
        Ok(version)
    }
}

/// Extracts the version from `sigtool -i` output. The last `Version:` line
/// wins; the validation marker must be present.
pub fn parse_sigtool_output(output: &str) -> Result<i64, ProbeError> {
    let mut version = None;
    let mut validated = false;
    for line in output.lines() {
        if let Some(rest) = line.strip_prefix(VERSION_LABEL) {
            let value = rest.trim();
            let parsed = value.parse().map_err(|source| ProbeError::BadVersion {
                value: value.to_string(),
                source,
            })?;
            version = Some(parsed);
        }
        if line.starts_with(VALIDATED_MARKER) {
            validated = true;
        }
    }
    if !validated {
        return Err(ProbeError::NotValidated);
    }
    version.ok_or(ProbeError::NoVersion)
}

fn wait_until(child: &mut Child, deadline: Instant) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(EXIT_POLL_INTERVAL.min(deadline - now));
    }
}

fn terminate(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn find_sigtool(cwd: Option<&Path>, search_path: Option<&OsStr>) -> Option<PathBuf> {
    if let Some(local) = cwd.map(|dir| dir.join(SIGTOOL_EXE)) {
        if local.is_file() {
            return Some(local);
        }
    }
    std::env::split_paths(search_path?)
        .map(|dir| dir.join(SIGTOOL_EXE))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = "File: daily.cvd\n\
        Build time: 19 Oct 2026 08:12 +0000\n\
        Version: 25567\n\
        Signatures: 2031876\n\
        Functionality level: 90\n\
        Verification OK.\n";

    #[test]
    fn parses_version_and_marker() {
        assert_eq!(parse_sigtool_output(SAMPLE).unwrap(), 25567);
    }

    #[test]
    fn last_version_line_wins() {
        let out = "Version: 1\nVersion: 2\nVerification OK\n";
        assert_eq!(parse_sigtool_output(out).unwrap(), 2);
    }

    #[test]
    fn missing_marker_is_not_validated() {
        let out = "Version: 25567\n";
        assert!(matches!(
            parse_sigtool_output(out),
            Err(ProbeError::NotValidated)
        ));
    }

    #[test]
    fn missing_version_line() {
        assert!(matches!(
            parse_sigtool_output("Verification OK\n"),
            Err(ProbeError::NoVersion)
        ));
    }

    #[test]
    fn garbage_version() {
        let err = parse_sigtool_output("Version: abc\nVerification OK\n").unwrap_err();
        assert!(matches!(err, ProbeError::BadVersion { ref value, .. } if value == "abc"));
    }

    #[test]
    fn locate_rejects_missing_configured_path() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("sigtool");
        let err = Sigtool::locate(Some(&missing), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ProbeError::MissingExecutable(_)));
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("sigtool");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn probes_with_external_tool() {
        let dir = tempdir().unwrap();
        let tool = write_script(dir.path(), "echo \"Version: 330\"\necho \"Verification OK.\"");
        let sigtool = Sigtool::new(tool, Duration::from_secs(10));
        let version = sigtool.probe(&dir.path().join("bytecode.cvd")).unwrap();
        assert_eq!(version, 330);
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_an_error() {
        let dir = tempdir().unwrap();
        let tool = write_script(dir.path(), "echo \"Version: 330\"\necho \"Verification OK\"\nexit 2");
        let sigtool = Sigtool::new(tool, Duration::from_secs(10));
        let err = sigtool.probe(&dir.path().join("main.cvd")).unwrap_err();
        assert!(matches!(err, ProbeError::Exit(_)));
    }

    #[cfg(unix)]
    #[test]
    fn hung_tool_times_out() {
        let dir = tempdir().unwrap();
        let tool = write_script(dir.path(), "exec sleep 30");
        let sigtool = Sigtool::new(tool, Duration::from_millis(200));
        let err = sigtool.probe(&dir.path().join("main.cvd")).unwrap_err();
        assert!(matches!(err, ProbeError::TimedOut(_)));
    }

    #[cfg(unix)]
    #[test]
    fn tool_that_closes_stdout_and_lingers_times_out() {
        let dir = tempdir().unwrap();
        let tool = write_script(dir.path(), "exec 1>&-\nexec sleep 5");
        let sigtool = Sigtool::new(tool, Duration::from_millis(200));
        let started = Instant::now();
        let err = sigtool.probe(&dir.path().join("main.cvd")).unwrap_err();
        assert!(matches!(err, ProbeError::TimedOut(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    fn search_path(dirs: &[&Path]) -> std::ffi::OsString {
        std::env::join_paths(dirs).unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn locate_searches_path_when_not_configured() {
        let cwd = tempdir().unwrap();
        let empty = tempdir().unwrap();
        let bin = tempdir().unwrap();
        let tool = write_script(bin.path(), "exit 0");
        let path = search_path(&[empty.path(), bin.path()]);

        let found = Sigtool::locate_in(
            None,
            Some(cwd.path()),
            Some(path.as_os_str()),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(found.path(), tool.as_path());
    }

    #[cfg(unix)]
    #[test]
    fn working_directory_copy_wins_over_path() {
        let cwd = tempdir().unwrap();
        let bin = tempdir().unwrap();
        let local = write_script(cwd.path(), "exit 0");
        write_script(bin.path(), "exit 0");
        let path = search_path(&[bin.path()]);

        let found = Sigtool::locate_in(
            None,
            Some(cwd.path()),
            Some(path.as_os_str()),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(found.path(), local.as_path());
    }

    #[cfg(unix)]
    #[test]
    fn configured_path_wins_over_search() {
        let cwd = tempdir().unwrap();
        let other = tempdir().unwrap();
        write_script(cwd.path(), "exit 0");
        let configured = write_script(other.path(), "exit 0");

        let found = Sigtool::locate_in(
            Some(configured.as_path()),
            Some(cwd.path()),
            None,
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(found.path(), configured.as_path());
    }

    #[test]
    fn locate_reports_not_found() {
        let cwd = tempdir().unwrap();
        let empty = tempdir().unwrap();
        let path = search_path(&[empty.path()]);

        let err = Sigtool::locate_in(
            None,
            Some(cwd.path()),
            Some(path.as_os_str()),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, ProbeError::NotFound));
        let err = Sigtool::locate_in(None, None, None, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ProbeError::NotFound));
    }
}
