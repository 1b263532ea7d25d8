//! In-tree DB integration tests for the optimistic-concurrency protocol

use pgtemp::PgTempDB;

use crate::{Error, JobDb, JobPatch, JobState};

async fn temp_job_db() -> (PgTempDB, JobDb) {
    let temp_db = PgTempDB::new();
    let job_db = JobDb::connect_with_retry(&temp_db.connection_uri(), JobDb::default_pool_size())
        .await
        .expect("Failed to connect to job db");
    (temp_db, job_db)
}

#[tokio::test]
async fn update_increments_dv_by_exactly_one() {
    //* Given
    let (_temp, db) = temp_job_db().await;
    let id = db
        .create_job("src.example", "dst.example", "u.alice", "default", JobState::New)
        .await
        .expect("Failed to create job");
    let job = db.get_job(id).await.expect("query").expect("job exists");
    assert_eq!(job.dv, 0);

    //* When
    let mut ctx = job.update_ctx();
    db.update_job(&mut ctx, None, &JobPatch::to_state(JobState::DumpStart))
        .await
        .expect("Failed to update job");

    //* Then
    assert_eq!(ctx.dv, 1, "dv must advance by exactly one");
    let job = db.get_job(id).await.expect("query").expect("job exists");
    assert_eq!(job.dv, 1);
    assert_eq!(job.state, JobState::DumpStart);
    assert!(job.mtime >= job.ctime);
    assert_eq!(job.status_fqdn.as_deref(), Some(db.host_fqdn()));
}

#[tokio::test]
async fn update_with_stale_dv_is_a_conflict() {
    //* Given
    let (_temp, db) = temp_job_db().await;
    let id = db
        .create_job("src.example", "dst.example", "u.alice", "default", JobState::New)
        .await
        .expect("Failed to create job");
    let job = db.get_job(id).await.expect("query").expect("job exists");

    // Two workers read the job at the same dv.
    let mut ctx_winner = job.update_ctx();
    let mut ctx_loser = job.update_ctx();

    //* When
    db.update_job(&mut ctx_winner, None, &JobPatch::to_state(JobState::DumpStart))
        .await
        .expect("First update should succeed");
    let result = db
        .update_job(&mut ctx_loser, None, &JobPatch::to_state(JobState::DumpStart))
        .await;

    //* Then
    assert!(
        matches!(result, Err(Error::Conflict { .. })),
        "second update from the same dv must lose: {result:?}"
    );
    let job = db.get_job(id).await.expect("query").expect("job exists");
    assert_eq!(job.dv, 1, "the losing update must not mutate the row");
}

#[tokio::test]
async fn update_with_failed_state_guard_is_a_conflict() {
    //* Given
    let (_temp, db) = temp_job_db().await;
    let id = db
        .create_job("src.example", "dst.example", "u.alice", "default", JobState::New)
        .await
        .expect("Failed to create job");
    let job = db.get_job(id).await.expect("query").expect("job exists");
    let mut ctx = job.update_ctx();

    //* When
    let result = db
        .update_job(
            &mut ctx,
            Some(JobState::DumpStart), // job is actually NEW
            &JobPatch::to_state(JobState::DumpWork),
        )
        .await;

    //* Then
    assert!(matches!(result, Err(Error::Conflict { .. })));
    let job = db.get_job(id).await.expect("query").expect("job exists");
    assert_eq!(job.state, JobState::New);
}

#[tokio::test]
async fn patch_sets_and_clears_nullable_columns() {
    //* Given
    let (_temp, db) = temp_job_db().await;
    let id = db
        .create_job("src.example", "dst.example", "u.alice", "default", JobState::New)
        .await
        .expect("Failed to create job");
    let job = db.get_job(id).await.expect("query").expect("job exists");
    let mut ctx = job.update_ctx();

    //* When
    let patch = JobPatch {
        state: Some(JobState::DumpDone),
        dump_fqdn: Some(Some("dump1.example".to_string())),
        dump_method: Some(Some("remctl".to_string())),
        dump_port: Some(Some(4373)),
        dump_filename: Some(Some("u.alice.1.dump".to_string())),
        dump_checksum: Some(Some("sha256:deadbeef".to_string())),
        dump_filesize: Some(Some(4096)),
        timeout: Some(Some(600)),
        description: Some("dump complete".to_string()),
        ..JobPatch::default()
    };
    db.update_job(&mut ctx, Some(JobState::New), &patch)
        .await
        .expect("Failed to set dump metadata");

    let clear = JobPatch {
        dump_filename: Some(None),
        timeout: Some(None),
        ..JobPatch::default()
    };
    db.update_job(&mut ctx, None, &clear)
        .await
        .expect("Failed to clear columns");

    //* Then
    let job = db.get_job(id).await.expect("query").expect("job exists");
    assert_eq!(job.dv, 2);
    assert_eq!(job.dump_fqdn.as_deref(), Some("dump1.example"));
    assert_eq!(job.dump_port, Some(4373));
    assert_eq!(job.dump_filename, None, "cleared column must be NULL");
    assert_eq!(job.timeout, None, "cleared column must be NULL");
    assert_eq!(job.dump_filesize, Some(4096));
}

#[tokio::test]
async fn chained_updates_through_one_ctx_never_conflict() {
    //* Given
    let (_temp, db) = temp_job_db().await;
    let id = db
        .create_job("src.example", "dst.example", "u.alice", "default", JobState::New)
        .await
        .expect("Failed to create job");
    let job = db.get_job(id).await.expect("query").expect("job exists");
    let mut ctx = job.update_ctx();

    //* When
    let mut seen = Vec::new();
    for state in [
        JobState::DumpStart,
        JobState::DumpWork,
        JobState::DumpDone,
    ] {
        db.update_job(&mut ctx, None, &JobPatch::to_state(state))
            .await
            .expect("chained update should succeed");
        seen.push(ctx.dv);
    }

    //* Then
    assert_eq!(seen, vec![1, 2, 3], "dv chain must be strictly sequential");
}
