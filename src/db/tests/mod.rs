use super::*;
use crate::Error;
use tempfile::NamedTempFile;

mod counters;
mod migrations;

/// Fresh database in a temp file; keep the file handle alive for the test's duration
async fn test_db() -> (Database, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    (db, temp_file)
}

fn media_record(url: &str, kind: MediaKind) -> NewMediaRecord {
    NewMediaRecord {
        original_url: url.to_string(),
        filename: format!("{}-file", kind),
        media_type: kind,
    }
}
