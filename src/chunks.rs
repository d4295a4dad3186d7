use crate::error::Result;
use crate::output::write_csv_atomic;
use crate::utils::sanitize_file_fragment;
use crate::{AuditEntry, FeeRecord};
use crate::aggregator::ProcessedFeeRow;
use log::info;
use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;
use std::path::{Path, PathBuf};

/// A row that can be split by operation and persisted as a chunk.
pub trait ChunkRow: Clone {
    fn operation(&self) -> &str;

    /// Rows with an absent field are not worth persisting.
    fn is_complete(&self) -> bool;
}

impl ChunkRow for FeeRecord {
    fn operation(&self) -> &str {
        &self.operation
    }

    fn is_complete(&self) -> bool {
        !self.operation.trim().is_empty()
            && !self.employee.trim().is_empty()
            && !self.month.trim().is_empty()
    }
}

impl ChunkRow for ProcessedFeeRow {
    fn operation(&self) -> &str {
        &self.operation
    }

    fn is_complete(&self) -> bool {
        !self.operation.trim().is_empty()
            && !self.employee.trim().is_empty()
            && !self.start_date.trim().is_empty()
    }
}

impl ChunkRow for AuditEntry {
    fn operation(&self) -> &str {
        &self.operation
    }

    fn is_complete(&self) -> bool {
        !self.operation.trim().is_empty()
            && !self.employee.trim().is_empty()
            && !self.month.trim().is_empty()
    }
}

/// Groups rows by `key`, keeping the order in which keys were first seen and
/// the original order of rows within each group.
pub fn partition<T, K, F>(rows: &[T], key: F) -> Vec<(K, Vec<T>)>
where
    T: Clone,
    K: Eq + Hash + Clone,
    F: Fn(&T) -> K,
{
    let mut index: HashMap<K, usize> = HashMap::new();
    let mut groups: Vec<(K, Vec<T>)> = Vec::new();
    for row in rows {
        let k = key(row);
        let slot = *index.entry(k.clone()).or_insert_with(|| {
            groups.push((k, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(row.clone());
    }
    groups
}

pub fn partition_by_operation<T: ChunkRow>(rows: &[T]) -> Vec<(String, Vec<T>)> {
    partition(rows, |row| row.operation().trim().to_string())
}

/// Writes one CSV file per operation into `out_dir`, named
/// `{prefix}_{sanitized operation}.csv`. Incomplete rows are left out.
pub fn save_chunks<T>(rows: &[T], out_dir: &Path, prefix: &str) -> Result<Vec<PathBuf>>
where
    T: ChunkRow + Serialize,
{
    let mut written = Vec::new();
    for (operation, chunk) in partition_by_operation(rows) {
        let clean: Vec<T> = chunk.into_iter().filter(ChunkRow::is_complete).collect();
        let path = out_dir.join(format!(
            "{}_{}.csv",
            prefix,
            sanitize_file_fragment(&operation)
        ));
        write_csv_atomic(&path, "chunk persistence", &clean)?;
        info!(
            "Saved chunk for operation '{}' with {} rows to {}",
            operation,
            clean.len(),
            path.display()
        );
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FeeValue;
    use crate::sheet::CellAddress;
    use std::collections::BTreeSet;

    fn record(op: &str, emp: &str, month: &str, fee: i64) -> FeeRecord {
        FeeRecord {
            operation: op.to_string(),
            employee: emp.to_string(),
            month: month.to_string(),
            fee,
        }
    }

    #[test]
    fn test_partition_preserves_first_seen_order() {
        let rows = vec![
            record("Eightfold Crew", "A", "2024-10", 1),
            record("Avature Crew", "B", "2024-10", 2),
            record("Eightfold Crew", "C", "2024-10", 3),
        ];
        let groups = partition_by_operation(&rows);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "Eightfold Crew");
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[0].1[1].employee, "C");
        assert_eq!(groups[1].0, "Avature Crew");
    }

    #[test]
    fn test_partition_then_concat_reconstructs_complete_rows() {
        let rows = vec![
            record("X", "A", "2024-10", 1),
            record("Y", "", "2024-10", 2),
            record("X", "B", "2024-11", 3),
            record("Z", "C", "2024-12", 4),
        ];
        let rebuilt: BTreeSet<(String, String, String, i64)> = partition_by_operation(&rows)
            .into_iter()
            .flat_map(|(_, chunk)| chunk)
            .filter(ChunkRow::is_complete)
            .map(|r| (r.operation, r.employee, r.month, r.fee))
            .collect();
        let expected: BTreeSet<_> = rows
            .iter()
            .filter(|r| r.is_complete())
            .map(|r| (r.operation.clone(), r.employee.clone(), r.month.clone(), r.fee))
            .collect();
        assert_eq!(rebuilt, expected);
        assert_eq!(rebuilt.len(), 3);
    }

    #[test]
    fn test_save_chunks_writes_sanitized_files() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![
            AuditEntry {
                operation: "Avature ext. Careers Portal Crew".to_string(),
                employee: "Bicho, Rita".to_string(),
                month: "2024-10".to_string(),
                cell: CellAddress::new(4, 6),
                fee_before: FeeValue::Missing,
                fee_after: FeeValue::Amount(50),
            },
            AuditEntry {
                operation: "Avature ext. Careers Portal Crew".to_string(),
                employee: String::new(),
                month: "2024-11".to_string(),
                cell: CellAddress::new(4, 7),
                fee_before: FeeValue::Amount(10),
                fee_after: FeeValue::Missing,
            },
        ];
        let written = save_chunks(&rows, dir.path(), "audit").unwrap();
        assert_eq!(written.len(), 1);
        assert!(written[0].ends_with("audit_Avature_ext._Careers_Portal_Crew.csv"));

        let content = std::fs::read_to_string(&written[0]).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Operation,Employee,Month,CellAddress,FeesBefore,FeesAfter",
                "Avature ext. Careers Portal Crew,\"Bicho, Rita\",2024-10,F4,-1,50",
            ]
        );
    }
}
