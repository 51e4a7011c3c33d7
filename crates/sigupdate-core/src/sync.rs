use crate::config::SyncConfig;
use crate::fetch::{Fetcher, MirrorTransport};
use crate::probe::VersionProbe;
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::version::VersionRecord;
use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub record: VersionRecord,
    pub artifacts: Vec<ReconcileReport>,
}

impl SyncSummary {
    pub fn is_noop(&self) -> bool {
        self.artifacts.iter().all(ReconcileReport::is_noop)
    }
}

pub struct SyncRun<'a> {
    reconciler: Reconciler<'a>,
}

impl<'a> SyncRun<'a> {
    pub fn new(reconciler: Reconciler<'a>) -> Self {
        Self { reconciler }
    }

    /// Reconciles every tracked artifact in declared order, stopping at the
    /// first failure.
    pub fn run(&self, record: &VersionRecord) -> Result<SyncSummary> {
        let mut artifacts = Vec::new();
        for artifact in record.artifacts() {
            let report = self
                .reconciler
                .reconcile(&artifact)
                .with_context(|| format!("updating {} signatures", artifact.name))?;
            info!(
                artifact = %report.artifact,
                kind = ?report.kind,
                local = ?report.local_version,
                target = report.target_version,
                diffs = report.diffs_downloaded.len(),
                full_downloads = report.full_downloads,
                "signature reconciled"
            );
            artifacts.push(report);
        }
        Ok(SyncSummary {
            record: record.clone(),
            artifacts,
        })
    }
}

/// Runs a full update against the mirror described by `config`.
pub fn run_sync(
    record: &VersionRecord,
    config: &SyncConfig,
    probe: &dyn VersionProbe,
) -> Result<SyncSummary> {
    let transport = MirrorTransport::new(config.http_timeout(), config.connect_timeout())?;
    let mut fetcher = Fetcher::new(transport, config.mirror_url.clone());
    if let Some(dir) = &config.scratch_dir {
        fetcher = fetcher.with_scratch_dir(dir);
    }
    let reconciler = Reconciler::new(probe, &fetcher, &config.data_dir, config.diff_threshold);
    SyncRun::new(reconciler).run(record)
}
