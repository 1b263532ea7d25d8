//! Internal SQL operations for the job store.
//!
//! Every mutation follows the optimistic-concurrency protocol: the `UPDATE`
//! carries `WHERE id = ? AND dv = ?` (plus an optional state guard), bumps
//! `dv` by exactly one, and refreshes `mtime` and `status_fqdn`. A row count
//! other than one is a conflict, reported through [`Error::Conflict`].

use sqlx::{Executor, Postgres, QueryBuilder};

use crate::{
    error::Error,
    job::{Job, JobFilter, JobPatch, UpdateCtx},
    job_id::JobId,
    state::JobState,
};

/// Column list shared by every `SELECT` over `jobs`.
const JOB_COLUMNS: &str = "id, src_cell, dst_cell, volname, qname, vol_lastupdate, dv, errors, \
                           state, last_good_state, dump_fqdn, dump_method, dump_port, \
                           dump_filename, restore_filename, dump_checksum, dump_filesize, \
                           status_fqdn, ctime, mtime, errorlimit_mtime, timeout, description";

/// Insert a new job.
///
/// The `(dst_cell, volname)` uniqueness constraint turns a second in-flight
/// job for the same destination volume into [`Error::DuplicateJob`].
pub async fn insert<'c, E>(
    exe: E,
    src_cell: &str,
    dst_cell: &str,
    volname: &str,
    qname: &str,
    state: JobState,
    status_fqdn: &str,
    description: &str,
) -> Result<JobId, Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        INSERT INTO jobs (src_cell, dst_cell, volname, qname, state, status_fqdn,
                          ctime, mtime, description)
        VALUES ($1, $2, $3, $4, $5, $6, now(), now(), $7)
        RETURNING id
    "#};
    sqlx::query_scalar(query)
        .bind(src_cell)
        .bind(dst_cell)
        .bind(volname)
        .bind(qname)
        .bind(state)
        .bind(status_fqdn)
        .bind(description)
        .fetch_one(exe)
        .await
        .map_err(|err| {
            if Error::is_unique_violation(&err) {
                Error::DuplicateJob {
                    dst_cell: dst_cell.to_string(),
                    volname: volname.to_string(),
                }
            } else {
                Error::Database(err)
            }
        })
}

/// Get a job by its ID.
pub async fn get_by_id<'c, E>(exe: E, id: JobId) -> Result<Option<Job>, Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let mut qb = QueryBuilder::<Postgres>::new("SELECT ");
    qb.push(JOB_COLUMNS);
    qb.push(" FROM jobs WHERE id = ");
    qb.push_bind(id);
    qb.build_query_as()
        .fetch_optional(exe)
        .await
        .map_err(Error::Database)
}

/// Fetch all jobs matching the filter, oldest mutation first.
///
/// Daemons process their per-tick work in `mtime` ascending order, so the
/// ordering is part of the contract here, not a cosmetic choice.
pub async fn find<'c, E>(exe: E, filter: &JobFilter) -> Result<Vec<Job>, Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let mut qb = QueryBuilder::<Postgres>::new("SELECT ");
    qb.push(JOB_COLUMNS);
    qb.push(" FROM jobs WHERE TRUE");
    push_filter(&mut qb, filter);
    qb.push(" ORDER BY mtime ASC, id ASC");
    qb.build_query_as()
        .fetch_all(exe)
        .await
        .map_err(Error::Database)
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter) {
    if let Some(id) = filter.id {
        qb.push(" AND id = ");
        qb.push_bind(id);
    }
    if let Some(src_cell) = &filter.src_cell {
        qb.push(" AND src_cell = ");
        qb.push_bind(src_cell.clone());
    }
    if let Some(dst_cells) = &filter.dst_cells {
        qb.push(" AND dst_cell = ANY(");
        qb.push_bind(dst_cells.clone());
        qb.push(")");
    }
    if let Some(volname) = &filter.volname {
        qb.push(" AND volname = ");
        qb.push_bind(volname.clone());
    }
    if let Some(qname) = &filter.qname {
        qb.push(" AND qname = ");
        qb.push_bind(qname.clone());
    }
    if let Some(states) = &filter.states {
        qb.push(" AND state = ANY(");
        qb.push_bind(states.clone());
        qb.push(")");
    }
}

/// Apply a [`JobPatch`] under the dv guard.
///
/// On success the new data version is written back into `ctx`. Zero affected
/// rows means another process mutated the job (or the `from_state` guard did
/// not hold) and surfaces as [`Error::Conflict`].
pub async fn update<'c, E>(
    exe: E,
    ctx: &mut UpdateCtx,
    status_fqdn: &str,
    from_state: Option<JobState>,
    patch: &JobPatch,
) -> Result<(), Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let mut qb =
        QueryBuilder::<Postgres>::new("UPDATE jobs SET dv = dv + 1, mtime = now(), status_fqdn = ");
    qb.push_bind(status_fqdn.to_string());

    if let Some(state) = patch.state {
        qb.push(", state = ");
        qb.push_bind(state);
    }
    if let Some(last_good_state) = patch.last_good_state {
        qb.push(", last_good_state = ");
        qb.push_bind(last_good_state);
    }
    if let Some(errors) = patch.errors {
        qb.push(", errors = ");
        qb.push_bind(errors);
    }
    if let Some(errorlimit_mtime) = patch.errorlimit_mtime {
        qb.push(", errorlimit_mtime = ");
        qb.push_bind(errorlimit_mtime);
    }
    if let Some(vol_lastupdate) = patch.vol_lastupdate {
        qb.push(", vol_lastupdate = ");
        qb.push_bind(vol_lastupdate);
    }
    if let Some(dump_fqdn) = &patch.dump_fqdn {
        qb.push(", dump_fqdn = ");
        qb.push_bind(dump_fqdn.clone());
    }
    if let Some(dump_method) = &patch.dump_method {
        qb.push(", dump_method = ");
        qb.push_bind(dump_method.clone());
    }
    if let Some(dump_port) = patch.dump_port {
        qb.push(", dump_port = ");
        qb.push_bind(dump_port);
    }
    if let Some(dump_filename) = &patch.dump_filename {
        qb.push(", dump_filename = ");
        qb.push_bind(dump_filename.clone());
    }
    if let Some(restore_filename) = &patch.restore_filename {
        qb.push(", restore_filename = ");
        qb.push_bind(restore_filename.clone());
    }
    if let Some(dump_checksum) = &patch.dump_checksum {
        qb.push(", dump_checksum = ");
        qb.push_bind(dump_checksum.clone());
    }
    if let Some(dump_filesize) = patch.dump_filesize {
        qb.push(", dump_filesize = ");
        qb.push_bind(dump_filesize);
    }
    if let Some(timeout) = patch.timeout {
        qb.push(", timeout = ");
        qb.push_bind(timeout);
    }
    if let Some(description) = &patch.description {
        qb.push(", description = ");
        qb.push_bind(description.clone());
    }

    qb.push(" WHERE id = ");
    qb.push_bind(ctx.id);
    qb.push(" AND dv = ");
    qb.push_bind(ctx.dv);
    if let Some(from_state) = from_state {
        qb.push(" AND state = ");
        qb.push_bind(from_state);
    }
    qb.push(" RETURNING dv");

    let new_dv: Option<i64> = qb
        .build_query_scalar()
        .fetch_optional(exe)
        .await
        .map_err(Error::Database)?;

    match new_dv {
        Some(dv) => {
            ctx.dv = dv;
            Ok(())
        }
        None => Err(Error::Conflict {
            id: ctx.id,
            dv: ctx.dv,
        }),
    }
}

/// Move a job to `ERROR` in a single statement.
///
/// Records the prior state in `last_good_state`, bumps `errors`, and clears
/// the deadline, all under the dv and state guards.
pub async fn mark_error<'c, E>(
    exe: E,
    ctx: &mut UpdateCtx,
    status_fqdn: &str,
    from_state: JobState,
    description: &str,
) -> Result<(), Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        UPDATE jobs
        SET dv = dv + 1,
            mtime = now(),
            status_fqdn = $1,
            state = $2,
            last_good_state = $3,
            errors = errors + 1,
            timeout = NULL,
            description = $4
        WHERE id = $5 AND dv = $6 AND state = $3
        RETURNING dv
    "#};
    let new_dv: Option<i64> = sqlx::query_scalar(query)
        .bind(status_fqdn)
        .bind(JobState::Error)
        .bind(from_state)
        .bind(description)
        .bind(ctx.id)
        .bind(ctx.dv)
        .fetch_optional(exe)
        .await
        .map_err(Error::Database)?;

    match new_dv {
        Some(dv) => {
            ctx.dv = dv;
            Ok(())
        }
        None => Err(Error::Conflict {
            id: ctx.id,
            dv: ctx.dv,
        }),
    }
}

/// Copy a job into the `jobshist` archive.
///
/// The projection is an explicit column list so that schema drift between
/// `jobs` and `jobshist` fails loudly instead of silently transposing
/// columns.
pub async fn insert_history<'c, E>(exe: E, id: JobId) -> Result<(), Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        INSERT INTO jobshist (id, src_cell, dst_cell, volname, qname, vol_lastupdate,
                              dv, errors, state, last_good_state, dump_fqdn, dump_method,
                              dump_port, dump_filename, restore_filename, dump_checksum,
                              dump_filesize, status_fqdn, ctime, mtime, errorlimit_mtime,
                              timeout, description)
        SELECT id, src_cell, dst_cell, volname, qname, vol_lastupdate,
               dv, errors, state, last_good_state, dump_fqdn, dump_method,
               dump_port, dump_filename, restore_filename, dump_checksum,
               dump_filesize, status_fqdn, ctime, mtime, errorlimit_mtime,
               timeout, description
        FROM jobs
        WHERE id = $1
    "#};
    let result = sqlx::query(query)
        .bind(id)
        .execute(exe)
        .await
        .map_err(Error::Database)?;

    if result.rows_affected() == 1 {
        Ok(())
    } else {
        Err(Error::NotFound(id))
    }
}

/// Get an archived job from `jobshist` by its original ID.
pub async fn get_history_by_id<'c, E>(exe: E, id: JobId) -> Result<Option<Job>, Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let mut qb = QueryBuilder::<Postgres>::new("SELECT ");
    qb.push(JOB_COLUMNS);
    qb.push(" FROM jobshist WHERE id = ");
    qb.push_bind(id);
    qb.build_query_as()
        .fetch_optional(exe)
        .await
        .map_err(Error::Database)
}

/// Delete a job row outright.
///
/// Returns `true` if a row was deleted.
pub async fn delete<'c, E>(exe: E, id: JobId) -> Result<bool, Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
        .bind(id)
        .execute(exe)
        .await
        .map_err(Error::Database)?;
    Ok(result.rows_affected() == 1)
}

/// Delete a job row under the dv guard.
pub async fn delete_guarded<'c, E>(exe: E, ctx: UpdateCtx) -> Result<(), Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query("DELETE FROM jobs WHERE id = $1 AND dv = $2")
        .bind(ctx.id)
        .bind(ctx.dv)
        .execute(exe)
        .await
        .map_err(Error::Database)?;

    if result.rows_affected() == 1 {
        Ok(())
    } else {
        Err(Error::Conflict {
            id: ctx.id,
            dv: ctx.dv,
        })
    }
}

/// Read the schema version recorded in the `versions` table.
pub async fn schema_version<'c, E>(exe: E) -> Result<Option<i32>, Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar("SELECT version FROM versions LIMIT 1")
        .fetch_optional(exe)
        .await
        .map_err(Error::Database)
}
