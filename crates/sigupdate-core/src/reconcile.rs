//! Per-artifact update decisions.
//!
//! A missing or untrusted `.cvd` is replaced outright. Otherwise each missing
//! `.cdiff` between the local and the published version is fetched in order;
//! the first one that cannot be fetched ends the walk and the `.cvd` is
//! downloaded again instead. When the gap is wider than the diff threshold
//! the `.cvd` is refreshed as well.

use crate::fetch::{FetchError, FetchOutcome, Fetcher, Transport};
use crate::probe::VersionProbe;
use crate::version::Artifact;
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, warn};

/// Fetches one mirror file into `local_path`.
pub trait Downloader {
    fn download(&self, file_name: &str, local_path: &Path) -> Result<FetchOutcome, FetchError>;
}

impl<T: Transport> Downloader for Fetcher<T> {
    fn download(&self, file_name: &str, local_path: &Path) -> Result<FetchOutcome, FetchError> {
        let url = self.url_for(file_name);
        self.fetch(&url, local_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileKind {
    /// No local copy existed.
    Initial,
    /// The local copy could not be probed and was replaced.
    Repaired,
    /// Diff walk from a trusted local version.
    Incremental,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub artifact: String,
    pub target_version: i64,
    pub local_version: Option<i64>,
    pub kind: ReconcileKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair_reason: Option<String>,
    pub diffs_downloaded: Vec<i64>,
    pub diffs_present: Vec<i64>,
    pub fallback_at: Option<i64>,
    pub threshold_refresh: bool,
    pub full_downloads: u32,
    pub transfers_skipped: u32,
}

impl ReconcileReport {
    fn new(artifact: &Artifact, kind: ReconcileKind) -> Self {
        Self {
            artifact: artifact.name.clone(),
            target_version: artifact.target_version,
            local_version: None,
            kind,
            repair_reason: None,
            diffs_downloaded: Vec::new(),
            diffs_present: Vec::new(),
            fallback_at: None,
            threshold_refresh: false,
            full_downloads: 0,
            transfers_skipped: 0,
        }
    }

    /// True when nothing was requested from the mirror.
    pub fn is_noop(&self) -> bool {
        self.full_downloads == 0 && self.diffs_downloaded.is_empty()
    }

    fn record(&mut self, outcome: &FetchOutcome) {
        if *outcome == FetchOutcome::Skipped {
            self.transfers_skipped += 1;
        }
    }
}

pub struct Reconciler<'a> {
    probe: &'a dyn VersionProbe,
    downloader: &'a dyn Downloader,
    data_dir: &'a Path,
    diff_threshold: u16,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        probe: &'a dyn VersionProbe,
        downloader: &'a dyn Downloader,
        data_dir: &'a Path,
        diff_threshold: u16,
    ) -> Self {
        Self {
            probe,
            downloader,
            data_dir,
            diff_threshold,
        }
    }

    pub fn reconcile(&self, artifact: &Artifact) -> Result<ReconcileReport> {
        let file_name = artifact.primary_file_name();
        let local_path = self.data_dir.join(&file_name);

        if !local_path.exists() {
            info!(
                "Local copy of [{}] does not exist - initiating download.",
                local_path.display()
            );
            let mut report = ReconcileReport::new(artifact, ReconcileKind::Initial);
            self.full_download(&file_name, &local_path, &mut report)?;
            return Ok(report);
        }
        debug!(
            "Local copy of [{}] already exists - initiating diff based update",
            local_path.display()
        );

        let local_version = match self.probe.probe(&local_path) {
            Ok(version) if version >= 0 => version,
            probed => {
                let reason = match probed {
                    Ok(version) => format!("invalid version {version}"),
                    Err(err) => err.to_string(),
                };
                warn!(
                    file = %local_path.display(),
                    %reason,
                    "problem with local version, the file will be downloaded again"
                );
                let mut report = ReconcileReport::new(artifact, ReconcileKind::Repaired);
                report.repair_reason = Some(reason);
                self.full_download(&file_name, &local_path, &mut report)?;
                return Ok(report);
            }
        };
        debug!("{} current version: {}", file_name, local_version);

        let mut report = ReconcileReport::new(artifact, ReconcileKind::Incremental);
        report.local_version = Some(local_version);

        // no diff can follow i64::MAX
        let pending = local_version
            .checked_add(1)
            .into_iter()
            .flat_map(|first| first..=artifact.target_version);
        for version in pending {
            let diff_name = artifact.diff_file_name(version);
            let diff_path = self.data_dir.join(&diff_name);
            if diff_path.exists() {
                debug!(
                    "Local copy of [{}] already exists, not downloading",
                    diff_path.display()
                );
                report.diffs_present.push(version);
                continue;
            }
            match self.downloader.download(&diff_name, &diff_path) {
                Ok(outcome) => {
                    report.record(&outcome);
                    report.diffs_downloaded.push(version);
                }
                Err(err) => {
                    warn!(
                        diff = %diff_name,
                        error = %err,
                        "problem downloading diff, [{}] will be downloaded again",
                        file_name
                    );
                    report.fallback_at = Some(version);
                    self.full_download(&file_name, &local_path, &mut report)
                        .with_context(|| format!("fallback after missing diff {diff_name}"))?;
                    break;
                }
            }
        }

        let gap = artifact.target_version.saturating_sub(local_version);
        if gap > i64::from(self.diff_threshold) {
            info!(
                gap,
                threshold = self.diff_threshold,
                "Signature has deviated beyond threshold from diffs, downloading [{}] again",
                file_name
            );
            report.threshold_refresh = true;
            self.full_download(&file_name, &local_path, &mut report)?;
        }

        Ok(report)
    }

    fn full_download(
        &self,
        file_name: &str,
        local_path: &Path,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        report.full_downloads += 1;
        let outcome = self
            .downloader
            .download(file_name, local_path)
            .with_context(|| format!("downloading {file_name} to {}", local_path.display()))?;
        report.record(&outcome);
        Ok(())
    }
}
