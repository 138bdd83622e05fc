//! Job configuration and the immutable Job Registry.
//!
//! Jobs arrive as loosely typed [`JobSpec`] records (usually from a JSON jobs
//! file) and are validated into [`Job`]s by [`JobRegistryBuilder::add`].
//! Once built, the registry is read-only.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use fscache_worker::{CaptureMode, PathPattern, ScanJob};
use serde::Deserialize;
use thiserror::Error;

use crate::ticker::{Tick, TICKS_PER_CYCLE};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("job {job}: missing required field '{field}'")]
    MissingField { job: String, field: &'static str },

    #[error("job name must not be empty")]
    EmptyName,

    #[error("duplicate job name '{0}'")]
    DuplicateName(String),

    #[error("job {job}: fire second {second} is outside 0..60")]
    FireSecondOutOfRange { job: String, second: i64 },

    #[error("job {job}: fire_seconds must not be empty")]
    EmptyFireSeconds { job: String },

    #[error("job {job}: invalid pattern: {source}")]
    InvalidPattern {
        job: String,
        #[source]
        source: regex::Error,
    },

    #[error("job {job}: {reason}")]
    InvalidCapture { job: String, reason: String },

    #[error("failed to read jobs file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse jobs file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Unvalidated job definition.
///
/// Every field is optional so that a missing one is reported as
/// [`ConfigError::MissingField`] naming the job, not as a generic parse error.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub name: Option<String>,
    pub root: Option<PathBuf>,
    pub pattern: Option<String>,
    pub fire_seconds: Option<Vec<i64>>,
    /// `content` (default) or `metadata`.
    pub capture: Option<String>,
}

impl JobSpec {
    pub fn new(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        pattern: impl Into<String>,
        fire_seconds: impl IntoIterator<Item = i64>,
    ) -> Self {
        Self {
            name: Some(name.into()),
            root: Some(root.into()),
            pattern: Some(pattern.into()),
            fire_seconds: Some(fire_seconds.into_iter().collect()),
            capture: None,
        }
    }

    pub fn with_capture(mut self, capture: CaptureMode) -> Self {
        self.capture = Some(capture.to_string());
        self
    }
}

/// Set of seconds within the minute at which a job fires.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct FireSeconds(u64);

impl FireSeconds {
    pub fn contains(&self, tick: Tick) -> bool {
        self.0 & (1u64 << tick.second()) != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..TICKS_PER_CYCLE).filter(move |s| self.0 & (1u64 << s) != 0)
    }
}

impl fmt::Debug for FireSeconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A validated, immutable job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub name: String,
    pub root: PathBuf,
    pub pattern: PathPattern,
    pub fire_seconds: FireSeconds,
    pub capture: CaptureMode,
}

impl Job {
    pub fn fires_at(&self, tick: Tick) -> bool {
        self.fire_seconds.contains(tick)
    }

    /// The work order handed to a scan worker.
    pub fn scan_job(&self) -> ScanJob {
        ScanJob {
            name: self.name.clone(),
            root: self.root.clone(),
            pattern: self.pattern.clone(),
            capture: self.capture,
        }
    }

    fn from_spec(spec: JobSpec, index: usize) -> Result<Self, ConfigError> {
        let label = match &spec.name {
            Some(name) => format!("'{}'", name),
            None => format!("#{}", index),
        };
        let missing = |field| ConfigError::MissingField {
            job: label.clone(),
            field,
        };

        let name = spec.name.clone().ok_or_else(|| missing("name"))?;
        if name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        let root = spec.root.ok_or_else(|| missing("root"))?;
        let pattern = spec.pattern.ok_or_else(|| missing("pattern"))?;
        let seconds = spec.fire_seconds.ok_or_else(|| missing("fire_seconds"))?;

        let mut fire_seconds = 0u64;
        for second in seconds {
            if !(0..TICKS_PER_CYCLE as i64).contains(&second) {
                return Err(ConfigError::FireSecondOutOfRange {
                    job: label.clone(),
                    second,
                });
            }
            fire_seconds |= 1u64 << second;
        }
        if fire_seconds == 0 {
            return Err(ConfigError::EmptyFireSeconds { job: label.clone() });
        }

        let pattern = PathPattern::new(&pattern).map_err(|source| ConfigError::InvalidPattern {
            job: label.clone(),
            source,
        })?;

        let capture = match spec.capture {
            Some(raw) => raw
                .parse::<CaptureMode>()
                .map_err(|reason| ConfigError::InvalidCapture {
                    job: label.clone(),
                    reason,
                })?,
            None => CaptureMode::default(),
        };

        Ok(Self {
            name,
            root,
            pattern,
            fire_seconds: FireSeconds(fire_seconds),
            capture,
        })
    }
}

/// The configured jobs, fixed before the dispatcher starts serving.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Vec<Job>,
}

impl JobRegistry {
    pub fn builder() -> JobRegistryBuilder {
        JobRegistryBuilder::default()
    }

    /// Parse a JSON array of job objects.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let specs: Vec<JobSpec> = serde_json::from_str(json)?;
        let mut builder = Self::builder();
        for spec in specs {
            builder = builder.add(spec)?;
        }
        Ok(builder.build())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn get(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs whose fire set contains `tick`, in configuration order.
    pub fn due(&self, tick: Tick) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(move |job| job.fires_at(tick))
    }
}

#[derive(Debug, Default)]
pub struct JobRegistryBuilder {
    jobs: Vec<Job>,
    names: HashSet<String>,
}

impl JobRegistryBuilder {
    /// Validate `spec` and add it.
    pub fn add(mut self, spec: JobSpec) -> Result<Self, ConfigError> {
        let job = Job::from_spec(spec, self.jobs.len())?;
        if !self.names.insert(job.name.clone()) {
            return Err(ConfigError::DuplicateName(job.name));
        }
        self.jobs.push(job);
        Ok(self)
    }

    pub fn build(self) -> JobRegistry {
        JobRegistry { jobs: self.jobs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grains() -> JobSpec {
        JobSpec::new("grains", "/var/cache/minions", r".*/data\.p$", [2, 12, 22])
    }

    #[test]
    fn test_builder_accepts_valid_jobs() {
        let registry = JobRegistry::builder()
            .add(grains())
            .unwrap()
            .add(
                JobSpec::new("mine", "/var/cache/mine", r".*\.p$", [5])
                    .with_capture(CaptureMode::Metadata),
            )
            .unwrap()
            .build();

        assert_eq!(registry.len(), 2);
        let mine = registry.get("mine").unwrap();
        assert_eq!(mine.capture, CaptureMode::Metadata);
        assert_eq!(registry.get("grains").unwrap().capture, CaptureMode::Content);
    }

    #[test]
    fn test_due_jobs() {
        let registry = JobRegistry::builder()
            .add(grains())
            .unwrap()
            .add(JobSpec::new("other", "/tmp", ".*", [2, 3]))
            .unwrap()
            .build();

        let at = |s| {
            registry
                .due(Tick::new(s).unwrap())
                .map(|job| job.name.as_str())
                .collect::<Vec<_>>()
        };
        assert_eq!(at(2), vec!["grains", "other"]);
        assert_eq!(at(3), vec!["other"]);
        assert_eq!(at(12), vec!["grains"]);
        assert!(at(59).is_empty());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let err = JobRegistry::builder()
            .add(grains())
            .unwrap()
            .add(grains())
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName(name) if name == "grains"));
    }

    #[test]
    fn test_fire_second_range() {
        for bad in [60, -1, 1000] {
            let err = JobRegistry::builder()
                .add(JobSpec::new("j", "/", ".*", [bad]))
                .unwrap_err();
            assert!(matches!(err, ConfigError::FireSecondOutOfRange { second, .. } if second == bad));
        }
        assert!(JobRegistry::builder().add(JobSpec::new("j", "/", ".*", [0, 59])).is_ok());
    }

    #[test]
    fn test_empty_fire_seconds_rejected() {
        let err = JobRegistry::builder()
            .add(JobSpec::new("j", "/", ".*", []))
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyFireSeconds { .. }));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let err = JobRegistry::builder()
            .add(JobSpec::new("j", "/", "([", [1]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }

    #[test]
    fn test_empty_name_rejected() {
        let err = JobRegistry::builder()
            .add(JobSpec::new("  ", "/", ".*", [1]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyName));
    }

    #[test]
    fn test_duplicate_fire_seconds_collapse() {
        let registry = JobRegistry::builder()
            .add(JobSpec::new("j", "/", ".*", [7, 7, 8]))
            .unwrap()
            .build();
        let job = registry.get("j").unwrap();
        assert_eq!(job.fire_seconds.len(), 2);
        assert_eq!(job.fire_seconds.iter().collect::<Vec<_>>(), vec![7, 8]);
    }

    #[test]
    fn test_json_missing_field_names_the_job() {
        let json = r#"[{"name": "grains", "root": "/var/cache", "fire_seconds": [2]}]"#;
        let err = JobRegistry::from_json_str(json).unwrap_err();
        match err {
            ConfigError::MissingField { job, field } => {
                assert_eq!(job, "'grains'");
                assert_eq!(field, "pattern");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_json_missing_name_uses_position() {
        let json = r#"[{"root": "/", "pattern": ".*", "fire_seconds": [2]}]"#;
        let err = JobRegistry::from_json_str(json).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { job, field: "name" } if job == "#0"));
    }

    #[test]
    fn test_json_full_file() {
        let json = r#"[
            {"name": "grains", "root": "/var/cache/minions", "pattern": ".*/data\\.p$", "fire_seconds": [2, 12, 22]},
            {"name": "mine", "root": "/var/cache/mine", "pattern": ".*", "fire_seconds": [30], "capture": "metadata"}
        ]"#;
        let registry = JobRegistry::from_json_str(json).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("grains").unwrap().pattern.as_str(), r".*/data\.p$");
        assert_eq!(registry.get("mine").unwrap().capture, CaptureMode::Metadata);
    }

    #[test]
    fn test_json_bad_capture() {
        let json = r#"[{"name": "j", "root": "/", "pattern": ".*", "fire_seconds": [1], "capture": "bytes"}]"#;
        assert!(matches!(
            JobRegistry::from_json_str(json),
            Err(ConfigError::InvalidCapture { .. })
        ));
    }

    #[test]
    fn test_json_syntax_error() {
        assert!(matches!(
            JobRegistry::from_json_str("[{"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            JobRegistry::load(&dir.path().join("jobs.json")),
            Err(ConfigError::Read { .. })
        ));
    }
}
