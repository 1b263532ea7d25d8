//! In-tree DB integration tests for the stage-pickup primitive

use pgtemp::PgTempDB;

use crate::{JobDb, JobFilter, JobState};

async fn temp_job_db() -> (PgTempDB, JobDb) {
    let temp_db = PgTempDB::new();
    let job_db = JobDb::connect_with_retry(&temp_db.connection_uri(), JobDb::default_pool_size())
        .await
        .expect("Failed to connect to job db");
    (temp_db, job_db)
}

fn src_filter(src_cell: &str, dst_cell: &str) -> JobFilter {
    JobFilter {
        src_cell: Some(src_cell.to_string()),
        dst_cells: Some(vec![dst_cell.to_string()]),
        ..JobFilter::default()
    }
}

#[tokio::test]
async fn advance_claims_matching_jobs() {
    //* Given
    let (_temp, db) = temp_job_db().await;
    let id_a = db
        .create_job("src.example", "dst.example", "u.alice", "default", JobState::New)
        .await
        .expect("Failed to create job a");
    let id_b = db
        .create_job("src.example", "dst.example", "u.bob", "default", JobState::New)
        .await
        .expect("Failed to create job b");
    // A job for another source cell must not be touched.
    let id_other = db
        .create_job("other.example", "dst.example", "u.carol", "default", JobState::New)
        .await
        .expect("Failed to create other-cell job");

    //* When
    let advanced = db
        .find_and_advance(
            JobState::New,
            JobState::DumpStart,
            &src_filter("src.example", "dst.example"),
            Some(120),
            "waiting for dump worker",
        )
        .await
        .expect("Failed to advance jobs");

    //* Then
    let ids: Vec<_> = advanced.iter().map(|job| job.id).collect();
    assert!(ids.contains(&id_a));
    assert!(ids.contains(&id_b));
    assert!(!ids.contains(&id_other));
    for job in &advanced {
        assert_eq!(job.state, JobState::DumpStart);
        assert_eq!(job.timeout, Some(120));
        assert_eq!(job.description, "waiting for dump worker");
        assert_eq!(job.dv, 1);
    }
    let other = db.get_job(id_other).await.expect("query").expect("exists");
    assert_eq!(other.state, JobState::New);
}

#[tokio::test]
async fn advance_returns_jobs_already_in_target_state() {
    //* Given
    let (_temp, db) = temp_job_db().await;
    let id_new = db
        .create_job("src.example", "dst.example", "u.alice", "default", JobState::New)
        .await
        .expect("Failed to create new job");

    // Simulate a job another dump-server already advanced.
    let id_started = db
        .create_job("src.example", "dst.example", "u.bob", "default", JobState::New)
        .await
        .expect("Failed to create job");
    let job = db.get_job(id_started).await.expect("query").expect("exists");
    let mut ctx = job.update_ctx();
    db.update_job(
        &mut ctx,
        Some(JobState::New),
        &crate::JobPatch::to_state(JobState::DumpStart),
    )
    .await
    .expect("Failed to pre-advance job");

    //* When
    let advanced = db
        .find_and_advance(
            JobState::New,
            JobState::DumpStart,
            &src_filter("src.example", "dst.example"),
            None,
            "claimed",
        )
        .await
        .expect("Failed to advance jobs");

    //* Then
    let ids: Vec<_> = advanced.iter().map(|job| job.id).collect();
    assert!(
        ids.contains(&id_new) && ids.contains(&id_started),
        "pickup must also return rows other workers transitioned: {ids:?}"
    );
}

#[tokio::test]
async fn advance_orders_jobs_oldest_mutation_first() {
    //* Given
    let (_temp, db) = temp_job_db().await;
    let mut created = Vec::new();
    for vol in ["u.a", "u.b", "u.c"] {
        let id = db
            .create_job("src.example", "dst.example", vol, "default", JobState::New)
            .await
            .expect("Failed to create job");
        created.push(id);
        // Separate mtimes so the ordering is deterministic.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    //* When
    let advanced = db
        .find_and_advance(
            JobState::New,
            JobState::DumpStart,
            &src_filter("src.example", "dst.example"),
            None,
            "claimed",
        )
        .await
        .expect("Failed to advance jobs");

    //* Then
    let ids: Vec<_> = advanced.iter().map(|job| job.id).collect();
    assert_eq!(ids, created, "jobs must come back oldest first");
}

#[tokio::test]
async fn advance_respects_queue_filter() {
    //* Given
    let (_temp, db) = temp_job_db().await;
    let id_default = db
        .create_job("src.example", "dst.example", "u.alice", "default", JobState::New)
        .await
        .expect("Failed to create default-queue job");
    let id_slow = db
        .create_job("src.example", "dst.example", "u.bob", "slow", JobState::New)
        .await
        .expect("Failed to create slow-queue job");

    //* When
    let mut filter = src_filter("src.example", "dst.example");
    filter.qname = Some("slow".to_string());
    let advanced = db
        .find_and_advance(JobState::New, JobState::DumpStart, &filter, None, "claimed")
        .await
        .expect("Failed to advance jobs");

    //* Then
    let ids: Vec<_> = advanced.iter().map(|job| job.id).collect();
    assert_eq!(ids, vec![id_slow]);
    let untouched = db.get_job(id_default).await.expect("query").expect("exists");
    assert_eq!(untouched.state, JobState::New);
}
