//! Job state machine.
//!
//! Every sync job moves through a fixed pipeline of stages, each with a
//! `START`, `WORK`, and `DONE` state. The state is stored as a `TEXT` column
//! in the database. Job states are a closed set: decoding an unrecognized
//! value is an error, never a silent fallback.

use sqlx::{encode::IsNull, error::BoxDynError, Database, Postgres};

/// The state a sync job is in.
///
/// The `*_START -> *_WORK -> *_DONE` progression is the universal per-stage
/// pattern: `START -> WORK` claims the job for a worker, `WORK -> DONE`
/// publishes completion. A failure in any `*_WORK` state moves the job to
/// [`JobState::Error`], recording the prior state in `last_good_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Sync job created, waiting for a dump-server to pick it up.
    New,
    DumpStart,
    DumpWork,
    DumpDone,
    XferStart,
    XferWork,
    XferDone,
    RestoreStart,
    RestoreWork,
    RestoreDone,
    ReleaseStart,
    ReleaseWork,
    /// Terminal state for sync jobs.
    ReleaseDone,
    /// Deletion job created, waiting for a restore-server to pick it up.
    DeleteNew,
    DeleteDestStart,
    DeleteDestWork,
    /// Terminal state for deletion jobs.
    DeleteDestDone,
    /// A stage failed. The check-server decides whether to retry.
    Error,
}

impl JobState {
    /// Convert the [`JobState`] to its wire/database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::DumpStart => "DUMP_START",
            Self::DumpWork => "DUMP_WORK",
            Self::DumpDone => "DUMP_DONE",
            Self::XferStart => "XFER_START",
            Self::XferWork => "XFER_WORK",
            Self::XferDone => "XFER_DONE",
            Self::RestoreStart => "RESTORE_START",
            Self::RestoreWork => "RESTORE_WORK",
            Self::RestoreDone => "RESTORE_DONE",
            Self::ReleaseStart => "RELEASE_START",
            Self::ReleaseWork => "RELEASE_WORK",
            Self::ReleaseDone => "RELEASE_DONE",
            Self::DeleteNew => "DELETE_NEW",
            Self::DeleteDestStart => "DELETE_DEST_START",
            Self::DeleteDestWork => "DELETE_DEST_WORK",
            Self::DeleteDestDone => "DELETE_DEST_DONE",
            Self::Error => "ERROR",
        }
    }

    /// Check if the state is terminal.
    ///
    /// Jobs in a terminal state are eligible for archival and removal from
    /// the live table.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ReleaseDone | Self::DeleteDestDone)
    }

    /// Check if the state is one of the `*_WORK` states.
    pub fn is_work(&self) -> bool {
        matches!(
            self,
            Self::DumpWork
                | Self::XferWork
                | Self::RestoreWork
                | Self::ReleaseWork
                | Self::DeleteDestWork
        )
    }

    /// The state a failed job is retried from, derived from its
    /// `last_good_state`.
    ///
    /// The five `*_WORK` states map back to their `*_START` state so the
    /// stage is re-claimed from scratch; every other state retries as
    /// itself.
    pub fn retry_state(&self) -> JobState {
        match self {
            Self::DumpWork => Self::DumpStart,
            Self::XferWork => Self::XferStart,
            Self::RestoreWork => Self::RestoreStart,
            Self::ReleaseWork => Self::ReleaseStart,
            Self::DeleteDestWork => Self::DeleteDestStart,
            other => *other,
        }
    }

    /// The `*_WORK` state entered from a `*_START` state, if any.
    pub fn work_state(&self) -> Option<JobState> {
        match self {
            Self::DumpStart => Some(Self::DumpWork),
            Self::XferStart => Some(Self::XferWork),
            Self::RestoreStart => Some(Self::RestoreWork),
            Self::ReleaseStart => Some(Self::ReleaseWork),
            Self::DeleteDestStart => Some(Self::DeleteDestWork),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a string that is not a known job state.
#[derive(Debug, thiserror::Error)]
#[error("Unknown job state: {0:?}")]
pub struct UnknownStateError(pub String);

impl std::str::FromStr for JobState {
    type Err = UnknownStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let state = match s {
            "NEW" => Self::New,
            "DUMP_START" => Self::DumpStart,
            "DUMP_WORK" => Self::DumpWork,
            "DUMP_DONE" => Self::DumpDone,
            "XFER_START" => Self::XferStart,
            "XFER_WORK" => Self::XferWork,
            "XFER_DONE" => Self::XferDone,
            "RESTORE_START" => Self::RestoreStart,
            "RESTORE_WORK" => Self::RestoreWork,
            "RESTORE_DONE" => Self::RestoreDone,
            "RELEASE_START" => Self::ReleaseStart,
            "RELEASE_WORK" => Self::ReleaseWork,
            "RELEASE_DONE" => Self::ReleaseDone,
            "DELETE_NEW" => Self::DeleteNew,
            "DELETE_DEST_START" => Self::DeleteDestStart,
            "DELETE_DEST_WORK" => Self::DeleteDestWork,
            "DELETE_DEST_DONE" => Self::DeleteDestDone,
            "ERROR" => Self::Error,
            other => return Err(UnknownStateError(other.to_string())),
        };
        Ok(state)
    }
}

impl serde::Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for JobState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: &str = serde::Deserialize::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl sqlx::Type<Postgres> for JobState {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("TEXT")
    }
}

impl sqlx::postgres::PgHasArrayType for JobState {
    fn array_type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("TEXT[]")
    }
}

impl<'r> sqlx::Decode<'r, Postgres> for JobState {
    fn decode(value: <Postgres as Database>::ValueRef<'r>) -> Result<Self, BoxDynError> {
        let value: &str = sqlx::Decode::<Postgres>::decode(value)?;
        value.parse().map_err(|err| Box::new(err) as BoxDynError)
    }
}

impl<'q> sqlx::Encode<'q, Postgres> for JobState {
    fn encode_by_ref(
        &self,
        buf: &mut <Postgres as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, BoxDynError> {
        sqlx::Encode::<Postgres>::encode_by_ref(&self.as_str(), buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORK_STATES: [(JobState, JobState); 5] = [
        (JobState::DumpWork, JobState::DumpStart),
        (JobState::XferWork, JobState::XferStart),
        (JobState::RestoreWork, JobState::RestoreStart),
        (JobState::ReleaseWork, JobState::ReleaseStart),
        (JobState::DeleteDestWork, JobState::DeleteDestStart),
    ];

    #[test]
    fn retry_state_maps_work_to_start() {
        for (work, start) in WORK_STATES {
            assert_eq!(work.retry_state(), start, "{work} should retry as {start}");
        }
    }

    #[test]
    fn retry_state_round_trips_through_work_state() {
        // retry_state(work_state(s)) == s for every *_START state.
        for (work, start) in WORK_STATES {
            assert_eq!(start.work_state(), Some(work));
            assert_eq!(work.retry_state(), start);
        }
    }

    #[test]
    fn non_work_states_retry_as_themselves() {
        for state in [
            JobState::New,
            JobState::DumpStart,
            JobState::DumpDone,
            JobState::DeleteNew,
            JobState::Error,
        ] {
            assert_eq!(state.retry_state(), state);
        }
    }

    #[test]
    fn state_strings_round_trip() {
        for state in [
            JobState::New,
            JobState::DumpStart,
            JobState::DumpWork,
            JobState::DumpDone,
            JobState::XferStart,
            JobState::XferWork,
            JobState::XferDone,
            JobState::RestoreStart,
            JobState::RestoreWork,
            JobState::RestoreDone,
            JobState::ReleaseStart,
            JobState::ReleaseWork,
            JobState::ReleaseDone,
            JobState::DeleteNew,
            JobState::DeleteDestStart,
            JobState::DeleteDestWork,
            JobState::DeleteDestDone,
            JobState::Error,
        ] {
            let parsed: JobState = state.as_str().parse().expect("state should parse");
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn unknown_state_is_rejected() {
        let err = "DUMP_MAYBE".parse::<JobState>();
        assert!(err.is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::ReleaseDone.is_terminal());
        assert!(JobState::DeleteDestDone.is_terminal());
        assert!(!JobState::Error.is_terminal());
        assert!(!JobState::DumpDone.is_terminal());
    }
}
