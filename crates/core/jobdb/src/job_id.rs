//! Job ID new-type with validation for job record identifiers.

use sqlx::{encode::IsNull, error::BoxDynError, Database, Postgres};

/// A type-safe identifier for job records.
///
/// [`JobId`] is a new-type wrapper around `i64` that enforces that values are
/// always positive. The database assigns IDs from a sequence, so a zero or
/// negative ID always indicates corrupted input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(i64);

impl JobId {
    /// Convert the [`JobId`] to an `i64`.
    pub fn to_i64(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for JobId {
    type Error = JobIdConvError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value <= 0 {
            Err(JobIdConvError::NonPositive(value))
        } else {
            Ok(Self(value))
        }
    }
}

impl std::str::FromStr for JobId {
    type Err = JobIdFromStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s.parse::<i64>().map_err(JobIdFromStrError::ParseError)?;
        id.try_into().map_err(JobIdFromStrError::NonPositive)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl sqlx::Type<Postgres> for JobId {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <i64 as sqlx::Type<Postgres>>::type_info()
    }
}

impl sqlx::postgres::PgHasArrayType for JobId {
    fn array_type_info() -> sqlx::postgres::PgTypeInfo {
        <i64 as sqlx::postgres::PgHasArrayType>::array_type_info()
    }
}

impl<'r> sqlx::Decode<'r, Postgres> for JobId {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let id = <i64 as sqlx::Decode<Postgres>>::decode(value)?;
        id.try_into().map_err(|err| Box::new(err) as BoxDynError)
    }
}

impl<'q> sqlx::Encode<'q, Postgres> for JobId {
    fn encode_by_ref(
        &self,
        buf: &mut <Postgres as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, BoxDynError> {
        <i64 as sqlx::Encode<'q, Postgres>>::encode_by_ref(&self.0, buf)
    }
}

impl serde::Serialize for JobId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for JobId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = i64::deserialize(deserializer)?;
        id.try_into().map_err(serde::de::Error::custom)
    }
}

/// Errors that can occur when converting an `i64` to a [`JobId`].
#[derive(Debug, thiserror::Error)]
pub enum JobIdConvError {
    /// The provided value is zero or negative.
    #[error("JobId must be positive, got: {0}")]
    NonPositive(i64),
}

/// Errors that can occur when parsing a string as a [`JobId`].
#[derive(Debug, thiserror::Error)]
pub enum JobIdFromStrError {
    /// The string is not a valid `i64`.
    #[error("Invalid number format: {0}")]
    ParseError(#[from] std::num::ParseIntError),
    /// The parsed value is zero or negative.
    #[error(transparent)]
    NonPositive(#[from] JobIdConvError),
}
