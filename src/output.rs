//! Atomic file output: every artifact is written to a temporary file in its
//! destination directory and renamed into place only once fully written.

use crate::error::{ReconcileError, Result};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

pub fn write_atomic<F>(path: &Path, stage: &'static str, write: F) -> Result<()>
where
    F: FnOnce(&mut NamedTempFile) -> Result<()>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| ReconcileError::io(stage, dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| ReconcileError::io(stage, dir, e))?;
    write(&mut tmp)?;
    tmp.as_file_mut()
        .flush()
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| ReconcileError::io(stage, path, e))?;
    tmp.persist(path)
        .map_err(|e| ReconcileError::io(stage, path, e.error))?;
    Ok(())
}

pub fn write_bytes_atomic(path: &Path, stage: &'static str, bytes: &[u8]) -> Result<()> {
    write_atomic(path, stage, |tmp| {
        tmp.write_all(bytes)
            .map_err(|e| ReconcileError::io(stage, path, e))
    })
}

/// Writes `rows` as CSV with a header line derived from their serde field names.
pub fn write_csv_atomic<T: Serialize>(path: &Path, stage: &'static str, rows: &[T]) -> Result<()> {
    write_atomic(path, stage, |tmp| {
        let mut writer = csv::Writer::from_writer(tmp.as_file_mut());
        for row in rows {
            writer.serialize(row)?;
        }
        writer
            .flush()
            .map_err(|e| ReconcileError::io(stage, path, e))?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Row {
        #[serde(rename = "Operation")]
        operation: &'static str,
        #[serde(rename = "Fees")]
        fees: i64,
    }

    #[test]
    fn test_csv_written_with_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.csv");
        write_csv_atomic(
            &path,
            "test",
            &[Row { operation: "Avature Crew", fees: 120 }, Row { operation: "Eightfold Crew", fees: -1 }],
        )
        .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "Operation,Fees\nAvature Crew,120\nEightfold Crew,-1\n");
    }

    #[test]
    fn test_failed_write_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let result = write_atomic(&path, "test", |tmp| {
            tmp.write_all(b"partial").unwrap();
            Err(ReconcileError::InvalidConfig("boom".to_string()))
        });
        assert!(result.is_err());
        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_existing_file_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        fs::write(&path, b"old").unwrap();
        write_bytes_atomic(&path, "test", b"new").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
    }
}
