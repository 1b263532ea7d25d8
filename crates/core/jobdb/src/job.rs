//! Job row types and mutation descriptors.

use chrono::{DateTime, Duration, Utc};

use crate::{job_id::JobId, state::JobState};

/// A row of the `jobs` relation.
///
/// Nullable columns are represented as `Option`s; dump metadata columns are
/// only populated once the dump stage has published its blob.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct Job {
    /// Unique, server-assigned identifier.
    pub id: JobId,
    /// Cell the volume is dumped from.
    pub src_cell: String,
    /// Cell the volume is restored into.
    pub dst_cell: String,
    /// Name of the volume being synchronized.
    pub volname: String,
    /// Restore queue this job is routed through.
    pub qname: String,
    /// Incremental dump baseline as epoch seconds; 0 means a full dump.
    pub vol_lastupdate: i64,
    /// Data version: bumped by exactly one on every successful mutation.
    pub dv: i64,
    /// Count of failed attempts since the last reset.
    pub errors: i32,
    /// Current pipeline state.
    pub state: JobState,
    /// State the job was in before the most recent failure.
    pub last_good_state: Option<JobState>,
    /// Host that produced the dump blob.
    pub dump_fqdn: Option<String>,
    /// Transport used to fetch the dump blob.
    pub dump_method: Option<String>,
    /// Transport port on the dump host.
    pub dump_port: Option<i32>,
    /// Dump blob name in the dump host's scratch directory.
    pub dump_filename: Option<String>,
    /// Local blob name in the restore host's scratch directory.
    pub restore_filename: Option<String>,
    /// Dump blob checksum, formatted `ALGO:hex`.
    pub dump_checksum: Option<String>,
    /// Dump blob size in bytes.
    pub dump_filesize: Option<i64>,
    /// Host that last updated this row.
    pub status_fqdn: Option<String>,
    /// Creation time.
    pub ctime: DateTime<Utc>,
    /// Last mutation time.
    pub mtime: DateTime<Utc>,
    /// When the last error-limit alert for this job was emitted.
    pub errorlimit_mtime: Option<DateTime<Utc>>,
    /// Seconds added to `mtime` to compute a deadline; `None` means no
    /// deadline.
    pub timeout: Option<i64>,
    /// Short human-readable description of the job's current activity.
    pub description: String,
}

impl Job {
    /// The update context for mutating this row at the version it was read.
    pub fn update_ctx(&self) -> UpdateCtx {
        UpdateCtx {
            id: self.id,
            dv: self.dv,
        }
    }

    /// The job's deadline, if it has one.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.timeout.map(|secs| self.mtime + Duration::seconds(secs))
    }
}

/// In/out context for the optimistic-concurrency update protocol.
///
/// Carries the data version the caller believes to be current. Every
/// successful mutation through the store writes the new version back into
/// `dv`, so the context stays valid for chained updates.
#[derive(Debug, Clone, Copy)]
pub struct UpdateCtx {
    pub id: JobId,
    pub dv: i64,
}

/// A set of column mutations for [`update_job`](crate::JobDb::update_job).
///
/// `None` leaves a column untouched. Nullable columns use a second `Option`
/// layer: `Some(None)` clears the column, `Some(Some(v))` sets it.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub state: Option<JobState>,
    pub last_good_state: Option<Option<JobState>>,
    pub errors: Option<i32>,
    pub errorlimit_mtime: Option<Option<DateTime<Utc>>>,
    pub vol_lastupdate: Option<i64>,
    pub dump_fqdn: Option<Option<String>>,
    pub dump_method: Option<Option<String>>,
    pub dump_port: Option<Option<i32>>,
    pub dump_filename: Option<Option<String>>,
    pub restore_filename: Option<Option<String>>,
    pub dump_checksum: Option<Option<String>>,
    pub dump_filesize: Option<Option<i64>>,
    pub timeout: Option<Option<i64>>,
    pub description: Option<String>,
}

impl JobPatch {
    /// A patch that only moves the job to a new state.
    pub fn to_state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<i64>) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Row-selection filters for job queries.
///
/// All fields are conjunctive; `None` matches everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub id: Option<JobId>,
    pub src_cell: Option<String>,
    pub dst_cells: Option<Vec<String>>,
    pub volname: Option<String>,
    pub qname: Option<String>,
    pub states: Option<Vec<JobState>>,
}

impl JobFilter {
    pub fn by_id(id: JobId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }
}

/// A job enriched with the liveness fields computed at read time.
///
/// This is the read-only view served to operators by `cellcc jobs` and used
/// by the check-server's policy rules.
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobDescription {
    #[serde(flatten)]
    pub job: Job,
    /// Seconds since the last mutation.
    pub stale_seconds: i64,
    /// Seconds since the job was created.
    pub age_seconds: i64,
    /// `mtime + timeout`, if a timeout is set.
    pub deadline: Option<DateTime<Utc>>,
    /// Whether the deadline has passed.
    pub expired: bool,
}

impl JobDescription {
    /// Describe a job relative to the given instant.
    pub fn describe(job: Job, now: DateTime<Utc>) -> Self {
        let deadline = job.deadline();
        Self {
            stale_seconds: (now - job.mtime).num_seconds(),
            age_seconds: (now - job.ctime).num_seconds(),
            expired: deadline.is_some_and(|deadline| now > deadline),
            deadline,
            job,
        }
    }
}

/// Builds `n` synthetic job descriptions for exercising alert plumbing.
///
/// The jobs never touch the database; the IDs are sequential from 1.
pub fn describe_dummy_jobs(n: usize) -> Vec<JobDescription> {
    let now = Utc::now();
    (1..=n as i64)
        .map(|i| {
            let job = Job {
                id: JobId::try_from(i).expect("dummy id is positive"),
                src_cell: "source.example.com".to_string(),
                dst_cell: "dest.example.com".to_string(),
                volname: format!("test.vol.{i}"),
                qname: "default".to_string(),
                vol_lastupdate: 0,
                dv: 1,
                errors: 0,
                state: JobState::New,
                last_good_state: None,
                dump_fqdn: None,
                dump_method: None,
                dump_port: None,
                dump_filename: None,
                restore_filename: None,
                dump_checksum: None,
                dump_filesize: None,
                status_fqdn: None,
                ctime: now,
                mtime: now,
                errorlimit_mtime: None,
                timeout: None,
                description: "test job (not real)".to_string(),
            };
            JobDescription::describe(job, now)
        })
        .collect()
}
