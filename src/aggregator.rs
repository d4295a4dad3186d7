use crate::error::{ReconcileError, Result};
use crate::identity::NameNormalizer;
use crate::ingestion::{RawPeriod, SourceEntry};
use crate::utils::{month_key, month_start, parse_period_text, period_label, round_half_up};
use crate::FeeRecord;
use log::{debug, info, warn};
use rust_decimal::Decimal;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

/// Output of one aggregation pass, with the configuration gaps it absorbed.
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    pub records: Vec<FeeRecord>,
    pub unmapped_entries: usize,
    pub unmapped_codes: BTreeSet<String>,
    pub unnamed_entries: usize,
}

/// Row of the processed fee table as persisted for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessedFeeRow {
    #[serde(rename = "Operation")]
    pub operation: String,
    #[serde(rename = "Employee")]
    pub employee: String,
    #[serde(rename = "Period")]
    pub period: String,
    #[serde(rename = "StartDate")]
    pub start_date: String,
    #[serde(rename = "Fees")]
    pub fees: i64,
}

impl From<&FeeRecord> for ProcessedFeeRow {
    fn from(record: &FeeRecord) -> Self {
        let period = month_start(&record.month)
            .map(period_label)
            .unwrap_or_else(|| record.month.clone());
        Self {
            operation: record.operation.clone(),
            employee: record.employee.clone(),
            period,
            start_date: record.month.clone(),
            fees: record.fee,
        }
    }
}

pub struct SourceAggregator<'a> {
    work_package_to_operation: &'a BTreeMap<String, String>,
    trimmed_codes: BTreeMap<String, &'a str>,
    normalizer: &'a NameNormalizer,
}

impl<'a> SourceAggregator<'a> {
    pub fn new(
        work_package_to_operation: &'a BTreeMap<String, String>,
        normalizer: &'a NameNormalizer,
    ) -> Self {
        let trimmed_codes = work_package_to_operation
            .iter()
            .map(|(code, op)| (code.trim().to_string(), op.as_str()))
            .collect();
        Self {
            work_package_to_operation,
            trimmed_codes,
            normalizer,
        }
    }

    pub fn operation_for(&self, work_package: &str) -> Option<&str> {
        self.work_package_to_operation
            .get(work_package)
            .map(String::as_str)
            .or_else(|| self.trimmed_codes.get(work_package.trim()).copied())
            .map(str::trim)
    }

    /// Groups entries by (operation, canonical employee, month), sums the
    /// exact fees, then rounds each sum half-up.
    ///
    /// Unmapped work packages and nameless entries are dropped and counted.
    /// An unparseable period aborts the whole pass.
    pub fn aggregate(&self, entries: &[SourceEntry]) -> Result<Aggregation> {
        let mut aggregation = Aggregation::default();
        let mut sums: BTreeMap<(String, String, String), Decimal> = BTreeMap::new();

        for entry in entries {
            let Some(operation) = self.operation_for(&entry.work_package) else {
                aggregation.unmapped_entries += 1;
                aggregation
                    .unmapped_codes
                    .insert(entry.work_package.trim().to_string());
                continue;
            };

            let month = resolve_month(entry)?;

            let Some(employee) = self.normalizer.normalize(entry.name.as_deref()) else {
                aggregation.unnamed_entries += 1;
                debug!("Source row {} has no employee name, dropped", entry.row);
                continue;
            };

            *sums
                .entry((operation.to_string(), employee, month))
                .or_insert(Decimal::ZERO) += entry.fees.unwrap_or(Decimal::ZERO);
        }

        if aggregation.unmapped_entries > 0 {
            warn!(
                "Number of entries with unmapped work packages: {} ({} distinct codes)",
                aggregation.unmapped_entries,
                aggregation.unmapped_codes.len()
            );
            for code in &aggregation.unmapped_codes {
                debug!("Unmapped work package: '{}'", code);
            }
        }
        if aggregation.unnamed_entries > 0 {
            warn!(
                "Number of entries without an employee name: {}",
                aggregation.unnamed_entries
            );
        }

        let mut records: Vec<FeeRecord> = sums
            .into_iter()
            .map(|((operation, employee, month), total)| FeeRecord {
                operation,
                employee,
                month,
                fee: round_half_up(total),
            })
            .collect();

        records.sort_by(|a, b| {
            (Reverse(&a.operation), &a.employee, &a.month).cmp(&(
                Reverse(&b.operation),
                &b.employee,
                &b.month,
            ))
        });

        info!(
            "Aggregated {} source entries into {} fee records",
            entries.len(),
            records.len()
        );

        aggregation.records = records;
        Ok(aggregation)
    }
}

fn resolve_month(entry: &SourceEntry) -> Result<String> {
    let date = match &entry.period {
        RawPeriod::Date(date) => Some(*date),
        RawPeriod::Text(text) => parse_period_text(text),
        RawPeriod::Missing => None,
    };
    date.map(month_key).ok_or_else(|| ReconcileError::PeriodParse {
        row: entry.row,
        value: match &entry.period {
            RawPeriod::Text(text) => text.clone(),
            RawPeriod::Date(date) => date.to_string(),
            RawPeriod::Missing => String::new(),
        },
    })
}
