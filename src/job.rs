use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Unique identifier for a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Current state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Dead => "dead",
        }
    }

    pub fn from_db(state: &str) -> Option<Self> {
        match state {
            "pending" => Some(JobState::Pending),
            "processing" => Some(JobState::Processing),
            "completed" => Some(JobState::Completed),
            "dead" => Some(JobState::Dead),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "failed" => Ok(JobState::Dead),
            other => JobState::from_db(other).ok_or_else(|| {
                format!("unknown state '{s}' (expected pending, processing, completed, dead)")
            }),
        }
    }
}

/// A shell-command job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    #[serde(with = "timestamp::option")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    #[serde(with = "timestamp::option")]
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new<S: Into<String>>(command: S) -> Self {
        let now = timestamp::now();
        Self {
            id: JobId::new(),
            command: command.into(),
            state: JobState::Pending,
            attempts: 0,
            max_retries: 3,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
            last_error: None,
            claimed_by: None,
            lease_expires_at: None,
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Merge the fields present in `update` into this snapshot.
    pub fn apply(&mut self, update: &JobUpdate, now: DateTime<Utc>) {
        if let Some(state) = update.state {
            self.state = state;
        }
        if let Some(attempts) = update.attempts {
            self.attempts = attempts;
        }
        if let Some(next_retry_at) = update.next_retry_at {
            self.next_retry_at = next_retry_at;
        }
        if let Some(last_error) = &update.last_error {
            self.last_error = last_error.clone();
        }
        if update.release_lease {
            self.claimed_by = None;
            self.lease_expires_at = None;
        }
        self.updated_at = now;
    }
}

/// What a client submits to create a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub max_retries: Option<i64>,
}

impl JobSpec {
    pub fn new<S: Into<String>>(command: S) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// The claim a guarded write must still find: the job is Processing and
/// held by `worker_id`, optionally with a given attempt count and lease.
#[derive(Debug, Clone, PartialEq)]
pub struct Expectation {
    pub worker_id: String,
    pub attempts: Option<u32>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl Expectation {
    pub fn held_by<S: Into<String>>(worker_id: S) -> Self {
        Self {
            worker_id: worker_id.into(),
            attempts: None,
            lease_expires_at: None,
        }
    }

    /// Pin the claim exactly as observed in `job`. `None` if the job is not
    /// currently held by anyone.
    pub fn of(job: &Job) -> Option<Self> {
        if job.state != JobState::Processing {
            return None;
        }
        Some(Self {
            worker_id: job.claimed_by.clone()?,
            attempts: Some(job.attempts),
            lease_expires_at: job.lease_expires_at,
        })
    }

    /// Whether `job` still carries this claim.
    pub fn matches(&self, job: &Job) -> bool {
        job.state == JobState::Processing
            && job.claimed_by.as_deref() == Some(self.worker_id.as_str())
            && self.attempts.map_or(true, |n| n == job.attempts)
            && self
                .lease_expires_at
                .map_or(true, |at| job.lease_expires_at == Some(at))
    }
}

/// Partial set of job fields to write. `None` leaves a field untouched;
/// `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub state: Option<JobState>,
    pub attempts: Option<u32>,
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    pub last_error: Option<Option<String>>,
    pub release_lease: bool,
    pub expect: Option<Expectation>,
}

impl JobUpdate {
    pub fn state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn next_retry_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    pub fn last_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    pub fn release_lease(mut self) -> Self {
        self.release_lease = true;
        self
    }

    pub fn expecting(mut self, expect: Expectation) -> Self {
        self.expect = Some(expect);
        self
    }
}

/// A job quarantined after exhausting its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    #[serde(flatten)]
    pub job: Job,
    #[serde(with = "timestamp")]
    pub dead_at: DateTime<Utc>,
}

/// Queue counts by state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed_dead: u64,
    pub total: u64,
    pub dlq_total: u64,
}

/// Fixed-precision UTC timestamps (`2024-01-02T03:04:05.000006Z`).
///
/// Every encoded value has the same width, so text order is time order.
pub mod timestamp {
    use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Current time at the stored precision.
    pub fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }

    /// `at + delay` at the stored precision, saturating at the last
    /// instant that still encodes with a four-digit year.
    pub fn add(at: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
        let latest = latest();
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| at.checked_add_signed(d))
            .map_or(latest, |t| t.min(latest))
            .trunc_subsecs(6)
    }

    fn latest() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("9999-12-31T23:59:59.999999Z")
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn format(at: &DateTime<Utc>) -> String {
        at.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn parse(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
    }

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(at))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            at: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match at {
                Some(at) => serializer.serialize_some(&format(at)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|s| parse(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
