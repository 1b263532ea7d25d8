//! End-to-end test support: a temporary job database plus stub admin-CLI
//! and transport binaries wired together through a generated config file.
//!
//! The stubs are small shell scripts written into the test's temp
//! directory. The `vos` stub answers `examine`/`size`/`listvldb` from
//! canned values, writes a fixed payload for `dump`, and logs every
//! invocation; the `remctl` stub serves `get-dump`/`remove-dump` straight
//! out of the dump scratch directory. Tests drive the real daemons in
//! one-shot mode against this fake cell pair.

use std::{
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
};

use cellcc_config::ConfigSource;
use jobdb::JobDb;
use pgtemp::PgTempDB;
use tempfile::TempDir;

pub const SRC_CELL: &str = "src.example.test";
pub const DST_CELL: &str = "dst.example.test";
pub const DUMP_HOST: &str = "dump1.example.test";

/// The payload every stubbed dump produces.
pub const DUMP_PAYLOAD: &str = "VOLUMEDATA";

/// Canned behavior for the stubbed cell pair.
#[derive(Debug, Clone)]
pub struct CellFixture {
    /// `updateDate` reported for volumes in the source cell.
    pub src_update: i64,
    /// `updateDate` reported in the destination cell; `None` means the
    /// volume does not exist there.
    pub dst_update: Option<i64>,
    /// `backupID` reported in the destination cell (0 means no backup).
    pub dst_backup_id: u64,
    /// Extra `listvldb` site lines beyond the RW site.
    pub ro_sites: Vec<(&'static str, &'static str)>,
    /// Incremental dump settings for the generated config.
    pub incremental: bool,
    pub skip_unchanged: bool,
}

impl Default for CellFixture {
    fn default() -> Self {
        Self {
            src_update: 1000,
            dst_update: Some(500),
            dst_backup_id: 0,
            ro_sites: Vec::new(),
            incremental: false,
            skip_unchanged: false,
        }
    }
}

/// A running test environment: temp database, stub binaries, config.
pub struct TestCells {
    // Held for their Drop side effects.
    _temp: TempDir,
    _pg: PgTempDB,

    pub db: JobDb,
    pub source: ConfigSource,
    pub dump_scratch: PathBuf,
    pub restore_scratch: PathBuf,
    call_log: PathBuf,
}

impl TestCells {
    pub async fn start(fixture: CellFixture) -> Self {
        let temp = TempDir::new().expect("create temp dir");
        let pg = PgTempDB::new();

        let dump_scratch = temp.path().join("dump-scratch");
        let restore_scratch = temp.path().join("restore-scratch");
        std::fs::create_dir_all(&dump_scratch).expect("create dump scratch");
        std::fs::create_dir_all(&restore_scratch).expect("create restore scratch");
        let call_log = temp.path().join("calls.log");
        std::fs::write(&call_log, "").expect("create call log");

        let vos_stub = write_vos_stub(temp.path(), &fixture, &call_log);
        let remctl_stub = write_remctl_stub(temp.path(), &dump_scratch, &call_log);

        let config = serde_json::json!({
            "db": { "url": pg.connection_uri() },
            "cells": { SRC_CELL: { "dst-cells": [DST_CELL] } },
            "dump": {
                "scratch-dir": &dump_scratch,
                "scratch-min-free": 0,
                "interval": 1,
                "incremental": {
                    "enabled": fixture.incremental,
                    "skip-unchanged": fixture.skip_unchanged,
                },
            },
            "restore": {
                "scratch-dir": &restore_scratch,
                "scratch-min-free": 0,
                "interval": 1,
            },
            "vos": { "command": vos_stub, "localauth": true },
            "remctl": {
                "command": remctl_stub,
                "principal": "host/restore1.example.test@EXAMPLE.TEST",
            },
            "check": { "error-limit": 5 },
            "alerts": { "log": false },
        });
        let config_path = temp.path().join("cellcc.conf");
        std::fs::write(
            &config_path,
            serde_json::to_string_pretty(&config).expect("encode config"),
        )
        .expect("write config");

        let source = ConfigSource::new(Some(config_path), Vec::new());
        let db = JobDb::connect_with_retry(&pg.connection_uri(), JobDb::default_pool_size())
            .await
            .expect("connect to temp job db");

        Self {
            _temp: temp,
            _pg: pg,
            db,
            source,
            dump_scratch,
            restore_scratch,
            call_log,
        }
    }

    /// Every stub invocation so far, one per line.
    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(&self.call_log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Names of the dump blobs currently on the "origin" host.
    pub fn origin_blobs(&self) -> Vec<String> {
        blob_names(&self.dump_scratch)
    }

    /// Names of the dump blobs currently on the "restore" host.
    pub fn restore_blobs(&self) -> Vec<String> {
        blob_names(&self.restore_scratch)
    }
}

fn blob_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .filter(|name| name.ends_with(".dump"))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

fn write_executable(path: &Path, contents: &str) {
    std::fs::write(path, contents).expect("write stub script");
    let mut perms = std::fs::metadata(path).expect("stat stub").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).expect("chmod stub");
}

fn write_vos_stub(dir: &Path, fixture: &CellFixture, call_log: &Path) -> String {
    let dst_examine = match fixture.dst_update {
        Some(update) => format!(
            "echo \"name $id\"; echo \"updateDate {update}\"; echo \"backupID {}\"",
            fixture.dst_backup_id
        ),
        None => "echo 'VLDB: no such entry' >&2; exit 1".to_string(),
    };

    let mut listvldb = String::from("       server fs1.example.test partition /vicepa RW Site\\n");
    for (server, partition) in &fixture.ro_sites {
        listvldb.push_str(&format!(
            "       server {server} partition {partition} RO Site\\n"
        ));
    }

    let script = format!(
        r#"#!/bin/sh
# Stub admin CLI for the end-to-end tests.
cmd="$1"; shift
echo "$cmd $*" >> "{call_log}"

file=""; id=""; cell=""
prev=""
for arg in "$@"; do
    case "$prev" in
        -file) file="$arg" ;;
        -id|-name) id="$arg" ;;
        -cell) cell="$arg" ;;
    esac
    prev="$arg"
done

case "$cmd" in
    examine)
        if [ "$cell" = "{src_cell}" ]; then
            echo "name $id"; echo "updateDate {src_update}"; echo "backupID 0"
        else
            {dst_examine}
        fi
        ;;
    size)
        echo "dump_size: {dump_size}"
        ;;
    dump)
        printf '{payload}' > "$file"
        ;;
    listvldb)
        printf '{listvldb}'
        ;;
    restore|release|remove|create|addsite|offline)
        ;;
    *)
        echo "stub vos: unknown command $cmd" >&2
        exit 1
        ;;
esac
exit 0
"#,
        call_log = call_log.display(),
        src_cell = SRC_CELL,
        src_update = fixture.src_update,
        dst_examine = dst_examine,
        dump_size = DUMP_PAYLOAD.len(),
        payload = DUMP_PAYLOAD,
        listvldb = listvldb,
    );

    let path = dir.join("vos-stub");
    write_executable(&path, &script);
    path.display().to_string()
}

fn write_remctl_stub(dir: &Path, dump_scratch: &Path, call_log: &Path) -> String {
    let script = format!(
        r#"#!/bin/sh
# Stub remote-command client: serves blobs out of the dump scratch dir.
# Invoked as: remctl -p PORT HOST SERVICE SUBCOMMAND [FILE]
sub="$5"; file="$6"
echo "remctl $sub $file" >> "{call_log}"

case "$sub" in
    ping)
        printf 'cellcc remctl: ok\n'
        ;;
    get-dump)
        cat "{dump_scratch}/$file"
        ;;
    remove-dump)
        rm -f "{dump_scratch}/$file"
        ;;
    *)
        echo "stub remctl: unknown subcommand $sub" >&2
        exit 1
        ;;
esac
exit 0
"#,
        call_log = call_log.display(),
        dump_scratch = dump_scratch.display(),
    );

    let path = dir.join("remctl-stub");
    write_executable(&path, &script);
    path.display().to_string()
}
