use crate::identity::NameNormalizer;
use crate::schema::TargetLayout;
use crate::sheet::{CellAddress, CellValue, EvaluatedSnapshot};
use crate::utils::{month_key, round_half_up_f64};
use crate::{CellMapping, FeeValue};
use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Classification of a header-row cell.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderCell {
    Date(chrono::NaiveDate),
    /// Text starting with four digits, taken to be a "YYYY-MM" prefixed label.
    MonthPrefixed(String),
    Other,
}

impl HeaderCell {
    pub fn classify(value: &CellValue) -> Self {
        match value {
            CellValue::Date(dt) => HeaderCell::Date(dt.date()),
            CellValue::Text(s) => {
                let s = s.trim();
                if s.chars().take(4).filter(char::is_ascii_digit).count() == 4 {
                    HeaderCell::MonthPrefixed(s.chars().take(7).collect())
                } else {
                    HeaderCell::Other
                }
            }
            _ => HeaderCell::Other,
        }
    }

    pub fn month_key(&self) -> Option<String> {
        match self {
            HeaderCell::Date(d) => Some(month_key(*d)),
            HeaderCell::MonthPrefixed(s) => Some(s.clone()),
            HeaderCell::Other => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScanState {
    Preamble,
    InSection(String),
    Terminated,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedTarget {
    /// Month key -> 1-based column.
    pub month_columns: BTreeMap<String, u16>,
    pub mappings: Vec<CellMapping>,
    /// Row at which the terminator label stopped the scan, if it was found.
    pub terminated_at: Option<u32>,
}

pub struct TargetSheetParser<'a> {
    normalizer: &'a NameNormalizer,
    operations: BTreeSet<String>,
    skip_labels: HashSet<String>,
    terminator: String,
    layout: TargetLayout,
}

impl<'a> TargetSheetParser<'a> {
    pub fn new(
        normalizer: &'a NameNormalizer,
        operations: impl IntoIterator<Item = String>,
        skip_labels: &[String],
        terminator: &str,
        layout: TargetLayout,
    ) -> Self {
        Self {
            normalizer,
            operations: operations
                .into_iter()
                .map(|op| op.trim().to_string())
                .filter(|op| !op.is_empty())
                .collect(),
            skip_labels: skip_labels
                .iter()
                .map(|label| label.trim().to_lowercase())
                .collect(),
            terminator: terminator.trim().to_lowercase(),
            layout,
        }
    }

    /// Maps month keys to columns by scanning the header row from the first
    /// month column to the sheet's last column. Blank or non-month cells are
    /// skipped; a repeated month keeps its right-most column. Iteration is in
    /// month order, whatever the order of the header columns.
    pub fn month_columns(&self, sheet: &EvaluatedSnapshot) -> BTreeMap<String, u16> {
        let mut map = BTreeMap::new();
        for col in self.layout.first_month_column..=sheet.max_column() {
            let header = HeaderCell::classify(sheet.value(self.layout.header_row, col));
            if let Some(key) = header.month_key() {
                map.insert(key, col);
            }
        }
        map
    }

    pub fn parse(&self, sheet: &EvaluatedSnapshot) -> ParsedTarget {
        let month_columns = self.month_columns(sheet);
        debug!("Discovered {} month columns", month_columns.len());

        let mut state = ScanState::Preamble;
        let mut mappings = Vec::new();
        let mut terminated_at = None;

        for row in (self.layout.header_row + 1)..=sheet.max_row() {
            let label = sheet.value(row, self.layout.label_column).as_label();

            if let Some(label) = label.as_deref() {
                if label.to_lowercase() == self.terminator {
                    info!("Reached '{}' at row {}. Stopping scan.", label, row);
                    state = ScanState::Terminated;
                    terminated_at = Some(row);
                }
            }
            if state == ScanState::Terminated {
                break;
            }

            if let Some(label) = label.as_deref() {
                if self.operations.contains(label) {
                    debug!("Row {} opens section '{}'", row, label);
                    state = ScanState::InSection(label.to_string());
                    continue;
                }
            }

            let ScanState::InSection(operation) = &state else {
                continue;
            };

            let Some(employee) = self.normalizer.normalize(label.as_deref()) else {
                continue;
            };
            if self.operations.contains(&employee)
                || self.skip_labels.contains(&employee.to_lowercase())
            {
                debug!("Row {} label '{}' is not an employee row", row, employee);
                continue;
            }

            for (month, &col) in &month_columns {
                let cell = CellAddress::new(row, col);
                mappings.push(CellMapping {
                    operation: operation.clone(),
                    employee: employee.clone(),
                    month: month.clone(),
                    cell,
                    fee_before: fee_value(sheet.get(cell)),
                });
            }
        }

        info!(
            "Parsed {} cell mappings across {} month columns",
            mappings.len(),
            month_columns.len()
        );

        ParsedTarget {
            month_columns,
            mappings,
            terminated_at,
        }
    }
}

/// Evaluated cell value as a whole-currency fee. Blank, NaN and non-numeric
/// cells are `Missing`, never zero.
fn fee_value(value: &CellValue) -> FeeValue {
    value
        .as_number()
        .and_then(round_half_up_f64)
        .map(FeeValue::Amount)
        .unwrap_or(FeeValue::Missing)
}
