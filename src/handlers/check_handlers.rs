//! Store-wide consistency check.
//!
//! - database -> `SELECT 1` against the pool
//! - chunks   -> every file's chunks validated against its record

use anyhow::{Result, bail};
use gridfs_store::{FileQuery, GridFs};
use serde::Serialize;
use std::collections::HashMap;

/// Ping the database, then validate every file of the bucket.
///
/// Prints a JSON report on stdout and fails when any check does.
pub async fn check(gridfs: &GridFs) -> Result<()> {
    // 1) Database check
    let database_check = match gridfs.ping().await {
        Ok(()) => (true, None::<String>),
        Err(e) => (false, Some(format!("error: {}", e))),
    };

    // 2) Chunk validation, only meaningful with a reachable database
    let mut failures = Vec::new();
    let mut checked = 0u64;
    let chunks_check = if database_check.0 {
        let walked = validate_all(gridfs, &mut checked, &mut failures).await;
        match walked {
            Ok(()) if failures.is_empty() => (true, None),
            Ok(()) => (
                false,
                Some(format!("{} of {} files failed validation", failures.len(), checked)),
            ),
            Err(e) => (false, Some(format!("error: {}", e))),
        }
    } else {
        (false, Some("skipped: database unavailable".to_string()))
    };

    let overall_ok = database_check.0 && chunks_check.0;

    let mut checks = HashMap::new();
    checks.insert(
        "database",
        CheckStatus {
            ok: database_check.0,
            error: database_check.1,
        },
    );
    checks.insert(
        "chunks",
        CheckStatus {
            ok: chunks_check.0,
            error: chunks_check.1,
        },
    );

    let body = CheckReport {
        status: if overall_ok { "ok".into() } else { "error".into() },
        bucket: gridfs.bucket_name().to_string(),
        files_checked: checked,
        checks,
        failures,
    };
    println!("{}", serde_json::to_string_pretty(&body)?);

    if !overall_ok {
        bail!("bucket `{}` failed its consistency check", gridfs.bucket_name());
    }
    Ok(())
}

async fn validate_all(
    gridfs: &GridFs,
    checked: &mut u64,
    failures: &mut Vec<FileFailure>,
) -> gridfs_store::GridFsResult<()> {
    let mut records = gridfs.file_list(FileQuery::All).await?;
    while let Some(record) = records.next().await? {
        *checked += 1;
        match gridfs.validate(&record.id).await {
            Ok(()) => {}
            Err(e) if e.is_validation() => {
                tracing::warn!(id = %record.id, "validation failed: {}", e);
                failures.push(FileFailure {
                    id: record.id.to_string(),
                    filename: record.filename,
                    error: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct CheckReport {
    status: String,
    bucket: String,
    files_checked: u64,
    checks: HashMap<&'static str, CheckStatus>,
    failures: Vec<FileFailure>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

#[derive(Serialize)]
struct FileFailure {
    id: String,
    filename: Option<String>,
    error: String,
}
