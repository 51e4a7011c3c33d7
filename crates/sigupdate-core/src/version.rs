use serde::Serialize;
use std::num::ParseIntError;
use std::str::FromStr;

const MAIN_FIELD: usize = 1;
const DAILY_FIELD: usize = 2;
const SAFEBROWSING_FIELD: usize = 6;
const BYTECODE_FIELD: usize = 7;

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("version record has {found} fields, expected at least {}", BYTECODE_FIELD + 1)]
    TooFewFields { found: usize },
    #[error("error parsing {field} version [{value}]")]
    BadField {
        field: &'static str,
        value: String,
        #[source]
        source: ParseIntError,
    },
}

/// Versions published by the mirror's TXT record,
/// e.g. `0.103.8:62:26800:1675354140:1:90:49192:333`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionRecord {
    pub engine: String,
    pub main: i64,
    pub daily: i64,
    pub safebrowsing: i64,
    pub bytecode: i64,
}

impl VersionRecord {
    /// Tracked signature families in the order they are reconciled.
    pub fn artifacts(&self) -> [Artifact; 3] {
        [
            Artifact::new("main", self.main),
            Artifact::new("daily", self.daily),
            Artifact::new("bytecode", self.bytecode),
        ]
    }
}

impl FromStr for VersionRecord {
    type Err = RecordError;

    fn from_str(record: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = record.trim().split(':').collect();
        if fields.len() <= BYTECODE_FIELD {
            return Err(RecordError::TooFewFields {
                found: fields.len(),
            });
        }
        Ok(Self {
            engine: fields[0].to_string(),
            main: parse_field("main", fields[MAIN_FIELD])?,
            daily: parse_field("daily", fields[DAILY_FIELD])?,
            safebrowsing: parse_field("safe browsing", fields[SAFEBROWSING_FIELD])?,
            bytecode: parse_field("bytecode", fields[BYTECODE_FIELD])?,
        })
    }
}

fn parse_field(field: &'static str, value: &str) -> Result<i64, RecordError> {
    value.trim().parse().map_err(|source| RecordError::BadField {
        field,
        value: value.to_string(),
        source,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub name: String,
    pub target_version: i64,
}

impl Artifact {
    pub fn new(name: impl Into<String>, target_version: i64) -> Self {
        Self {
            name: name.into(),
            target_version,
        }
    }

    pub fn primary_file_name(&self) -> String {
        format!("{}.cvd", self.name)
    }

    pub fn diff_file_name(&self, version: i64) -> String {
        format!("{}-{}.cdiff", self.name, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_published_record() {
        let record: VersionRecord = "0.103.8:60:25567:1675354140:1:90:1:333".parse().unwrap();
        assert_eq!(record.engine, "0.103.8");
        assert_eq!(record.main, 60);
        assert_eq!(record.daily, 25567);
        assert_eq!(record.safebrowsing, 1);
        assert_eq!(record.bytecode, 333);
    }

    #[test]
    fn artifacts_follow_declared_order() {
        let record: VersionRecord = "0.103.8:60:25567:0:1:90:1:333".parse().unwrap();
        let names: Vec<_> = record
            .artifacts()
            .iter()
            .map(|a| (a.name.clone(), a.target_version))
            .collect();
        assert_eq!(
            names,
            vec![
                ("main".to_string(), 60),
                ("daily".to_string(), 25567),
                ("bytecode".to_string(), 333)
            ]
        );
    }

    #[test]
    fn rejects_short_record() {
        let err = "0.103.8:60:25567".parse::<VersionRecord>().unwrap_err();
        assert!(matches!(err, RecordError::TooFewFields { found: 3 }));
    }

    #[test]
    fn rejects_non_numeric_safebrowsing() {
        // unused downstream, but still required
        let err = "0.103.8:60:25567:0:1:90:x:333"
            .parse::<VersionRecord>()
            .unwrap_err();
        assert!(err.to_string().contains("safe browsing"));
    }

    #[test]
    fn file_names() {
        let artifact = Artifact::new("daily", 10);
        assert_eq!(artifact.primary_file_name(), "daily.cvd");
        assert_eq!(artifact.diff_file_name(7), "daily-7.cdiff");
    }
}
