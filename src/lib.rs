//! # Timesheet Reconciler
//!
//! Reconciles a raw timesheet export (per-employee, per-period fees tagged with
//! a work-package code) against a cost-tracking workbook laid out as an
//! operations x employees x months matrix.
//!
//! ## Core Concepts
//!
//! - **Fee records**: source entries summed per (operation, canonical employee, month),
//!   then rounded half-up to whole currency units
//! - **Cell mappings**: the cells of the target matrix, located by scanning the
//!   label column for operation sections and employee rows
//! - **Audit log**: one before/after entry for every located cell, whether it was
//!   updated or not. `-1` marks a missing value
//!
//! ## Example
//!
//! ```rust,ignore
//! use timesheet_reconciler::*;
//!
//! let reconciler = TimesheetReconciler::new(ReconcilerConfig::default())?;
//! let summary = reconciler.run(&RunPaths::new(
//!     "docs/source_timesheet.xlsx",
//!     "docs/target_sheet.xlsx",
//!     "out",
//! ))?;
//! println!("{} cells updated", summary.updated_cells);
//! ```

pub mod aggregator;
pub mod chunks;
pub mod error;
pub mod identity;
pub mod ingestion;
pub mod output;
pub mod package;
pub mod parser;
pub mod reconcile;
pub mod schema;
pub mod sheet;
pub mod utils;
pub mod xlsx;

pub use aggregator::{Aggregation, ProcessedFeeRow, SourceAggregator};
pub use chunks::{partition, partition_by_operation, save_chunks, ChunkRow};
pub use error::{ReconcileError, Result};
pub use identity::NameNormalizer;
pub use ingestion::{load_source_entries, RawPeriod, SourceEntry};
pub use package::PatchReport;
pub use parser::{HeaderCell, ParsedTarget, TargetSheetParser};
pub use reconcile::{ReconcileStats, ReconciliationEngine};
pub use schema::{ReconcilerConfig, TargetLayout};
pub use sheet::{CellAddress, CellValue, EditTarget, EvaluatedSnapshot, Grid, TargetWorkbook};
pub use utils::*;

use log::{debug, info};
use serde::{Serialize, Serializer};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// A fee as it appears in the audit log. `Missing` is written as `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeValue {
    Amount(i64),
    Missing,
}

impl FeeValue {
    pub const MISSING_SENTINEL: i64 = -1;

    pub fn to_sentinel(self) -> i64 {
        match self {
            FeeValue::Amount(v) => v,
            FeeValue::Missing => Self::MISSING_SENTINEL,
        }
    }

    pub fn amount(self) -> Option<i64> {
        match self {
            FeeValue::Amount(v) => Some(v),
            FeeValue::Missing => None,
        }
    }
}

impl Serialize for FeeValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.to_sentinel())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeeRecord {
    #[serde(rename = "Operation")]
    pub operation: String,
    #[serde(rename = "Employee")]
    pub employee: String,
    /// "YYYY-MM"
    #[serde(rename = "Month")]
    pub month: String,
    #[serde(rename = "Fees")]
    pub fee: i64,
}

/// One located cell of the target matrix with its value before the update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellMapping {
    pub operation: String,
    pub employee: String,
    pub month: String,
    pub cell: CellAddress,
    pub fee_before: FeeValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    #[serde(rename = "Operation")]
    pub operation: String,
    #[serde(rename = "Employee")]
    pub employee: String,
    #[serde(rename = "Month")]
    pub month: String,
    #[serde(rename = "CellAddress")]
    pub cell: CellAddress,
    #[serde(rename = "FeesBefore")]
    pub fee_before: FeeValue,
    #[serde(rename = "FeesAfter")]
    pub fee_after: FeeValue,
}

impl AuditEntry {
    pub fn from_mapping(mapping: &CellMapping, fee_after: FeeValue) -> Self {
        Self {
            operation: mapping.operation.clone(),
            employee: mapping.employee.clone(),
            month: mapping.month.clone(),
            cell: mapping.cell,
            fee_before: mapping.fee_before,
            fee_after,
        }
    }
}

/// Input and output locations for one run.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub source: PathBuf,
    pub source_sheet: Option<String>,
    pub target: PathBuf,
    pub output_dir: PathBuf,
    /// Defaults to `<target stem>_updated.<ext>` next to the target.
    pub updated_target: Option<PathBuf>,
}

impl RunPaths {
    pub fn new(
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source: source.into(),
            source_sheet: None,
            target: target.into(),
            output_dir: output_dir.into(),
            updated_target: None,
        }
    }

    pub fn updated_target_path(&self) -> PathBuf {
        self.updated_target
            .clone()
            .unwrap_or_else(|| updated_path(&self.target))
    }

    pub fn processed_table_path(&self) -> PathBuf {
        self.output_dir.join("processed_timesheet.xlsx")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.output_dir.join("audit_log.csv")
    }

    pub fn processed_chunks_dir(&self) -> PathBuf {
        self.output_dir.join("chunks").join("processed_chunks")
    }

    pub fn audit_chunks_dir(&self) -> PathBuf {
        self.output_dir.join("chunks").join("audit_chunks")
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub source_entries: usize,
    pub unmapped_entries: usize,
    pub unnamed_entries: usize,
    pub fee_records: usize,
    pub cell_mappings: usize,
    pub updated_cells: usize,
    pub missing_cells: usize,
    /// Updated cells whose formula was replaced by a value.
    pub overwritten_formulas: usize,
    pub updated_target: PathBuf,
    pub processed_table: PathBuf,
    pub audit_log: PathBuf,
    pub chunk_files: Vec<PathBuf>,
}

/// Result of reconciling one loaded workbook in memory.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub parsed: ParsedTarget,
    pub audit: Vec<AuditEntry>,
    pub stats: ReconcileStats,
}

pub struct TimesheetReconciler {
    config: ReconcilerConfig,
    normalizer: NameNormalizer,
}

impl TimesheetReconciler {
    pub fn new(config: ReconcilerConfig) -> Result<Self> {
        config.validate()?;
        let normalizer = NameNormalizer::new(&config.name_aliases);
        debug!("Alias table holds {} spellings", normalizer.alias_count());
        Ok(Self { config, normalizer })
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn normalizer(&self) -> &NameNormalizer {
        &self.normalizer
    }

    pub fn aggregate(&self, entries: &[SourceEntry]) -> Result<Aggregation> {
        SourceAggregator::new(&self.config.work_package_to_operation, &self.normalizer)
            .aggregate(entries)
    }

    /// Parses the target's evaluated snapshot. Known sections are the
    /// configured operations plus any operation present in `records`.
    pub fn parse_target(&self, book: &TargetWorkbook, records: &[FeeRecord]) -> ParsedTarget {
        let mut operations: BTreeSet<String> = self.config.operation_labels();
        operations.extend(records.iter().map(|r| r.operation.clone()));

        TargetSheetParser::new(
            &self.normalizer,
            operations,
            &self.config.skip_labels,
            &self.config.terminator_label,
            self.config.target_layout.clone(),
        )
        .parse(book.snapshot())
    }

    /// Parses `book` and writes every matched fee into its edit target.
    pub fn reconcile_workbook(
        &self,
        book: &mut TargetWorkbook,
        records: &[FeeRecord],
    ) -> Result<ReconcileOutcome> {
        let parsed = self.parse_target(book, records);
        let (audit, stats) = ReconciliationEngine::new(&self.normalizer).reconcile(
            book.edit_target_mut(),
            &parsed.mappings,
            records,
        )?;
        Ok(ReconcileOutcome {
            parsed,
            audit,
            stats,
        })
    }

    /// Runs the whole batch: aggregate the source, persist the processed
    /// table, reconcile the target, then persist the updated workbook and
    /// the audit log. Any failure stops the run before the next stage writes.
    pub fn run(&self, paths: &RunPaths) -> Result<RunSummary> {
        let updated_target = paths.updated_target_path();
        if same_file(&updated_target, &paths.target) {
            return Err(ReconcileError::InvalidConfig(format!(
                "updated workbook path {} would overwrite the target",
                updated_target.display()
            )));
        }
        if !is_xlsx_package(&paths.target) {
            return Err(ReconcileError::InvalidConfig(format!(
                "target {} must be an .xlsx or .xlsm workbook",
                paths.target.display()
            )));
        }

        info!("Loading and processing source data...");
        let entries = load_source_entries(&paths.source, paths.source_sheet.as_deref())?;
        let aggregation = self.aggregate(&entries)?;

        let processed: Vec<ProcessedFeeRow> =
            aggregation.records.iter().map(ProcessedFeeRow::from).collect();
        let processed_table = paths.processed_table_path();
        xlsx::write_processed_table(&processed_table, &processed)?;
        let mut chunk_files = save_chunks(&processed, &paths.processed_chunks_dir(), "processed")?;

        info!("Mapping target sheet and updating costs...");
        let mut book = xlsx::read_target_workbook(&paths.target, &self.config.target_layout.sheet_name)?;
        let outcome = self.reconcile_workbook(&mut book, &aggregation.records)?;

        let patch = xlsx::write_updated_workbook(
            &paths.target,
            &updated_target,
            &book,
            self.config.highlight_rgb()?,
        )?;
        info!("Updated workbook saved to {}", updated_target.display());

        let audit_log = paths.audit_log_path();
        output::write_csv_atomic(&audit_log, "audit log", &outcome.audit)?;
        chunk_files.extend(save_chunks(&outcome.audit, &paths.audit_chunks_dir(), "audit")?);

        Ok(RunSummary {
            source_entries: entries.len(),
            unmapped_entries: aggregation.unmapped_entries,
            unnamed_entries: aggregation.unnamed_entries,
            fee_records: aggregation.records.len(),
            cell_mappings: outcome.parsed.mappings.len(),
            updated_cells: outcome.stats.updated,
            missing_cells: outcome.stats.missing,
            overwritten_formulas: patch.replaced_formulas,
            updated_target,
            processed_table,
            audit_log,
            chunk_files,
        })
    }
}

fn is_xlsx_package(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("xlsx") || ext.eq_ignore_ascii_case("xlsm"))
        .unwrap_or(false)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn entry(row: usize, wp: &str, name: &str, month: u32, fees: &str) -> SourceEntry {
        SourceEntry {
            row,
            work_package: wp.to_string(),
            name: Some(name.to_string()),
            period: RawPeriod::Date(NaiveDate::from_ymd_opt(2024, month, 15).unwrap()),
            fees: Some(Decimal::from_str(fees).unwrap()),
        }
    }

    fn workbook() -> TargetWorkbook {
        let mut g = Grid::new();
        let text = |s: &str| CellValue::Text(s.to_string());
        g.set(CellAddress::new(1, 6), text("2024-10"));
        g.set(CellAddress::new(1, 7), text("2024-11"));
        g.set(CellAddress::new(2, 5), text("Avature Crew"));
        g.set(CellAddress::new(3, 5), text("Filipe Pires"));
        g.set(CellAddress::new(3, 6), CellValue::Number(75.0));
        g.set(CellAddress::new(4, 5), text("Total"));
        g.set(CellAddress::new(5, 5), text("Accumulated Total"));
        g.set(CellAddress::new(6, 5), text("Rita Bicho"));
        let sheet = EditTarget::new("Project", g).with_formula(CellAddress::new(3, 7), "=F3*2");
        TargetWorkbook::new(sheet)
    }

    #[test]
    fn test_fee_value_sentinel() {
        assert_eq!(FeeValue::Missing.to_sentinel(), -1);
        assert_eq!(FeeValue::Amount(0).to_sentinel(), 0);
        assert_eq!(FeeValue::Amount(12).amount(), Some(12));
        assert_eq!(serde_json::to_string(&FeeValue::Missing).unwrap(), "-1");
    }

    #[test]
    fn test_end_to_end_in_memory() {
        let reconciler = TimesheetReconciler::new(ReconcilerConfig::default()).unwrap();
        let aggregation = reconciler
            .aggregate(&[entry(2, "001 / Avature Crew  - PM/CM", "Filipe Pires", 10, "120.4")])
            .unwrap();

        let mut book = workbook();
        let outcome = reconciler
            .reconcile_workbook(&mut book, &aggregation.records)
            .unwrap();

        assert_eq!(outcome.parsed.mappings.len(), 2);
        assert_eq!(outcome.audit.len(), outcome.parsed.mappings.len());

        let oct = &outcome.audit[0];
        assert_eq!(oct.cell.to_string(), "F3");
        assert_eq!(oct.fee_before, FeeValue::Amount(75));
        assert_eq!(oct.fee_after, FeeValue::Amount(120));

        // Wrong month: nothing to write, cell keeps its formula.
        let nov = &outcome.audit[1];
        assert_eq!(nov.fee_after, FeeValue::Missing);
        assert_eq!(book.edit_target().formula(CellAddress::new(3, 7)), Some("F3*2"));
        assert!(!book.edit_target().is_highlighted(CellAddress::new(3, 7)));

        // The snapshot still shows the original value.
        assert_eq!(
            book.snapshot().get(CellAddress::new(3, 6)),
            &CellValue::Number(75.0)
        );
    }

    #[test]
    fn test_operations_from_records_open_sections() {
        let mut config = ReconcilerConfig::default();
        config
            .work_package_to_operation
            .insert("900 / Side Quest".to_string(), "Side Quest".to_string());
        let reconciler = TimesheetReconciler::new(config).unwrap();

        let mut g = Grid::new();
        g.set(CellAddress::new(1, 6), CellValue::Text("2024-10".to_string()));
        g.set(CellAddress::new(2, 5), CellValue::Text("Side Quest".to_string()));
        g.set(CellAddress::new(3, 5), CellValue::Text("Jane Doe".to_string()));
        let mut book = TargetWorkbook::new(EditTarget::new("Project", g));

        let records = reconciler
            .aggregate(&[entry(2, "900 / Side Quest", "Jane Doe", 10, "10.5")])
            .unwrap()
            .records;
        let outcome = reconciler.reconcile_workbook(&mut book, &records).unwrap();
        assert_eq!(outcome.audit[0].fee_after, FeeValue::Amount(11));
    }

    #[test]
    fn test_only_xlsx_packages_are_targets() {
        assert!(is_xlsx_package(Path::new("docs/target_sheet.xlsx")));
        assert!(is_xlsx_package(Path::new("docs/Target.XLSM")));
        assert!(!is_xlsx_package(Path::new("docs/target_sheet.ods")));
        assert!(!is_xlsx_package(Path::new("docs/target_sheet")));
    }
}
