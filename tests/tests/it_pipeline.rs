//! End-to-end pipeline scenarios against stubbed cells.
//!
//! These drive the real dump-server, restore-server, and check-server in
//! one-shot mode over a temporary job database, with the admin CLI and the
//! remote-command transport replaced by logging shell stubs.

use dump_server::DumpServerArgs;
use jobdb::JobState;
use restore_server::RestoreServerArgs;
use tests::{CellFixture, TestCells, DST_CELL, DUMP_HOST, DUMP_PAYLOAD, SRC_CELL};

const VOLNAME: &str = "u.alice";

async fn dump_once(cells: &TestCells) {
    dump_server::run(
        cells.source.clone(),
        DumpServerArgs {
            dump_host: DUMP_HOST.to_string(),
            src_cell: SRC_CELL.to_string(),
            dst_cells: Vec::new(),
        },
        true,
    )
    .await
    .expect("dump-server one-shot succeeds");
}

async fn restore_once(cells: &TestCells) {
    restore_server::run(
        cells.source.clone(),
        RestoreServerArgs {
            dst_cell: DST_CELL.to_string(),
        },
        true,
    )
    .await
    .expect("restore-server one-shot succeeds");
}

async fn check_once(cells: &TestCells) {
    check_server::run(cells.source.clone(), true)
        .await
        .expect("check-server one-shot succeeds");
}

#[tokio::test]
async fn happy_sync_runs_the_whole_pipeline() {
    //* Given
    let cells = TestCells::start(CellFixture::default()).await;
    let jobid = cells
        .db
        .create_job(SRC_CELL, DST_CELL, VOLNAME, "default", JobState::New)
        .await
        .expect("create sync job");

    //* When: the source side dumps
    dump_once(&cells).await;

    //* Then: the blob is published
    let job = cells.db.get_job(jobid).await.expect("query").expect("job");
    assert_eq!(job.state, JobState::DumpDone);
    assert_eq!(job.dump_fqdn.as_deref(), Some(DUMP_HOST));
    assert_eq!(job.dump_method.as_deref(), Some("remctl"));
    assert_eq!(job.dump_filesize, Some(DUMP_PAYLOAD.len() as i64));
    let checksum = job.dump_checksum.clone().expect("checksum recorded");
    assert!(checksum.starts_with("sha256:"), "default algorithm: {checksum}");
    assert_eq!(cells.origin_blobs().len(), 1, "blob exists on the origin");

    //* When: the destination side transfers, restores, and releases
    restore_once(&cells).await;

    //* Then
    let job = cells.db.get_job(jobid).await.expect("query").expect("job");
    assert_eq!(job.state, JobState::ReleaseDone);
    assert_eq!(job.dump_filename, None, "origin blob reference cleared");
    assert_eq!(job.restore_filename, None, "local blob reference cleared");
    assert!(cells.origin_blobs().is_empty(), "origin blob removed after transfer");
    assert!(cells.restore_blobs().is_empty(), "local blob removed after restore");
    let calls = cells.calls();
    assert!(calls.iter().any(|call| call.starts_with("restore ")));
    assert!(calls.iter().any(|call| call.starts_with("release ")));

    //* When: the check-server sweeps
    check_once(&cells).await;

    //* Then: the finished job is archived and gone from the live table
    assert!(cells.db.get_job(jobid).await.expect("query").is_none());
    let archived = cells
        .db
        .get_archived_job(jobid)
        .await
        .expect("history query")
        .expect("archive row exists");
    assert_eq!(archived.state, JobState::ReleaseDone);
}

#[tokio::test]
async fn corrupted_transfer_fails_then_retries_clean() {
    //* Given: a published dump whose origin blob gets corrupted
    let cells = TestCells::start(CellFixture::default()).await;
    let jobid = cells
        .db
        .create_job(SRC_CELL, DST_CELL, VOLNAME, "default", JobState::New)
        .await
        .expect("create sync job");
    dump_once(&cells).await;

    let blob_name = cells.origin_blobs().pop().expect("origin blob exists");
    let blob_path = cells.dump_scratch.join(&blob_name);
    let good_bytes = std::fs::read(&blob_path).expect("read blob");
    std::fs::write(&blob_path, b"CORRUPTED!").expect("corrupt blob");

    //* When: the first transfer attempt runs
    restore_once(&cells).await;

    //* Then: checksum verification fails the job
    let job = cells.db.get_job(jobid).await.expect("query").expect("job");
    assert_eq!(job.state, JobState::Error);
    assert_eq!(job.errors, 1);
    assert_eq!(job.last_good_state, Some(JobState::XferWork));
    assert_eq!(job.restore_filename, None, "bad local copy discarded");
    assert!(cells.restore_blobs().is_empty());
    assert_eq!(
        cells.origin_blobs(),
        vec![blob_name.clone()],
        "a failed transfer must not remove the origin blob"
    );

    //* When: one check sweep resets the job, the blob is repaired, and the
    //* restore-server runs again
    check_once(&cells).await;
    let job = cells.db.get_job(jobid).await.expect("query").expect("job");
    assert_eq!(job.state, JobState::XferStart, "reset to re-fetch");
    assert_eq!(job.errors, 1, "a retry does not clear the error count");

    std::fs::write(&blob_path, &good_bytes).expect("repair blob");
    restore_once(&cells).await;

    //* Then: the pipeline completes
    let job = cells.db.get_job(jobid).await.expect("query").expect("job");
    assert_eq!(job.state, JobState::ReleaseDone);
    assert!(cells.origin_blobs().is_empty());
}

#[tokio::test]
async fn skip_unchanged_short_circuits_to_release_done() {
    //* Given: incremental sync enabled and the destination already current
    let fixture = CellFixture {
        src_update: 1000,
        dst_update: Some(1000),
        incremental: true,
        skip_unchanged: true,
        ..CellFixture::default()
    };
    let cells = TestCells::start(fixture).await;
    let jobid = cells
        .db
        .create_job(SRC_CELL, DST_CELL, VOLNAME, "default", JobState::New)
        .await
        .expect("create sync job");

    //* When
    dump_once(&cells).await;

    //* Then: no blob is produced and the job skips straight to done
    let job = cells.db.get_job(jobid).await.expect("query").expect("job");
    assert_eq!(job.state, JobState::ReleaseDone);
    assert_eq!(job.dump_filename, None);
    assert!(cells.origin_blobs().is_empty(), "no dump blob may exist");
    assert!(
        !cells.calls().iter().any(|call| call.starts_with("dump ")),
        "the dump command must never run"
    );
}

#[tokio::test]
async fn newer_destination_fails_the_dump() {
    //* Given: the destination claims data newer than the source
    let fixture = CellFixture {
        src_update: 1000,
        dst_update: Some(2000),
        incremental: true,
        ..CellFixture::default()
    };
    let cells = TestCells::start(fixture).await;
    let jobid = cells
        .db
        .create_job(SRC_CELL, DST_CELL, VOLNAME, "default", JobState::New)
        .await
        .expect("create sync job");

    //* When
    dump_once(&cells).await;

    //* Then
    let job = cells.db.get_job(jobid).await.expect("query").expect("job");
    assert_eq!(job.state, JobState::Error);
    assert_eq!(job.errors, 1);
}

#[tokio::test]
async fn delete_pipeline_removes_sites_replicas_first() {
    //* Given: a volume with one RO replica and a backup clone
    let fixture = CellFixture {
        dst_backup_id: 536870917,
        ro_sites: vec![("fs2.example.test", "/vicepb")],
        ..CellFixture::default()
    };
    let cells = TestCells::start(fixture).await;
    let jobid = cells
        .db
        .create_job(SRC_CELL, DST_CELL, VOLNAME, "default", JobState::DeleteNew)
        .await
        .expect("create delete job");

    //* When
    restore_once(&cells).await;

    //* Then
    let job = cells.db.get_job(jobid).await.expect("query").expect("job");
    assert_eq!(job.state, JobState::DeleteDestDone);

    // Replica removals must precede the authoritative one: RO, then BK,
    // then RW.
    let removes: Vec<String> = cells
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("remove "))
        .collect();
    assert_eq!(removes.len(), 3, "one removal per copy: {removes:?}");
    assert!(removes[0].contains(&format!("{VOLNAME}.readonly")), "{removes:?}");
    assert!(removes[1].contains(&format!("{VOLNAME}.backup")), "{removes:?}");
    assert!(
        removes[2].contains(VOLNAME)
            && !removes[2].contains(".readonly")
            && !removes[2].contains(".backup"),
        "{removes:?}"
    );

    //* When: the check-server sweeps
    check_once(&cells).await;

    //* Then: the delete job is archived
    assert!(cells.db.get_job(jobid).await.expect("query").is_none());
    assert!(cells
        .db
        .get_archived_job(jobid)
        .await
        .expect("history query")
        .is_some());
}
