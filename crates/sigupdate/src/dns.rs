use anyhow::{anyhow, Context, Result};
use hickory_resolver::Resolver;

/// First TXT record published for `domain`.
pub fn pull_txt_record(domain: &str) -> Result<String> {
    let resolver = Resolver::from_system_conf().context("loading system resolver configuration")?;
    let lookup = resolver
        .txt_lookup(domain)
        .with_context(|| format!("Unable to resolve TXT record for {domain}"))?;
    let record = lookup
        .iter()
        .next()
        .ok_or_else(|| anyhow!("No TXT records returned for {domain}"))?;
    Ok(record
        .txt_data()
        .iter()
        .map(|chunk| String::from_utf8_lossy(chunk))
        .collect())
}
