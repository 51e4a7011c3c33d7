mod dns;
mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use sigupdate_core::config::validate_data_dir;
use sigupdate_core::{run_sync, Sigtool, SyncConfig, VersionRecord};
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{debug, info};

fn long_version() -> &'static str {
    static LONG_VERSION: OnceLock<String> = OnceLock::new();
    LONG_VERSION.get_or_init(|| {
        format!(
            "{}\nLicense        : MIT\nGit Commit Hash: {}\nUTC Build Time : {}",
            env!("CARGO_PKG_VERSION"),
            option_env!("SIGUPDATE_GIT_HASH").unwrap_or("unknown"),
            option_env!("SIGUPDATE_BUILD_TIME").unwrap_or("unknown"),
        )
    })
}

#[derive(Parser, Debug)]
#[command(author, version, long_version = long_version(), about = "ClamAV signature mirror updater", long_about = None)]
struct Cli {
    /// Enable verbose mode with additional debugging information
    #[arg(short, long)]
    verbose: bool,
    /// JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Path to ClamAV data files
    #[arg(short = 'd', long = "data-file-path")]
    data_file_path: Option<PathBuf>,
    /// Number of diffs to download until we redownload the signature files
    #[arg(short = 't', long = "diff-count-threshold")]
    diff_count_threshold: Option<u16>,
    /// URL to download signature updates from
    #[arg(short = 'm', long = "download-mirror-url")]
    download_mirror_url: Option<String>,
    /// Domain whose TXT record publishes the current versions
    #[arg(long)]
    mirror_domain: Option<String>,
    /// Use this version record instead of resolving the mirror domain
    #[arg(long)]
    txt_record: Option<String>,
    /// Path to the sigtool executable
    #[arg(long)]
    sigtool: Option<PathBuf>,
    /// Directory for in-flight downloads
    #[arg(long)]
    scratch_dir: Option<PathBuf>,
    /// Print a JSON summary of the run on stdout
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn into_config(self) -> Result<(SyncConfig, Option<String>, bool)> {
        let mut config = match &self.config {
            Some(path) => SyncConfig::load(path)?,
            None => SyncConfig::default(),
        };
        if let Some(dir) = self.data_file_path {
            config.data_dir = dir;
        }
        if let Some(threshold) = self.diff_count_threshold {
            config.diff_threshold = threshold;
        }
        if let Some(url) = self.download_mirror_url {
            config.mirror_url = url;
        }
        if let Some(domain) = self.mirror_domain {
            config.mirror_domain = domain;
        }
        if let Some(sigtool) = self.sigtool {
            config.sigtool_path = Some(sigtool);
        }
        if let Some(dir) = self.scratch_dir {
            config.scratch_dir = Some(dir);
        }
        Ok((config, self.txt_record, self.json))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;
    let (mut config, txt_record, json) = cli.into_config()?;

    info!("Updating ClamAV signatures");
    config.data_dir = validate_data_dir(&config.data_dir)?;
    debug!("Data file directory: {}", config.data_dir.display());

    let sigtool = Sigtool::locate(config.sigtool_path.as_deref(), config.sigtool_timeout())?;
    debug!(
        "ClamAV executable sigtool found at path: {}",
        sigtool.path().display()
    );

    let txt = match txt_record {
        Some(record) => record,
        None => {
            let record = dns::pull_txt_record(&config.mirror_domain)?;
            debug!("TXT record for [{}]: {}", config.mirror_domain, record);
            record
        }
    };
    let record: VersionRecord = txt
        .parse()
        .with_context(|| format!("invalid version record [{txt}]"))?;
    debug!(?record, "TXT record values parsed");

    let summary = run_sync(&record, &config, &sigtool)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    if summary.is_noop() {
        info!("Signatures already up to date");
    }
    Ok(())
}
