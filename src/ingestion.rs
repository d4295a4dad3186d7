use crate::error::{ReconcileError, Result};
use crate::sheet::{CellAddress, CellValue, Grid};
use crate::xlsx;
use chrono::NaiveDate;
use log::{debug, info};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;

pub const WORK_PACKAGE_COLUMN: &str = "Work Package";
pub const NAME_COLUMN: &str = "Name";
pub const PERIOD_COLUMN: &str = "Period";
pub const FEES_COLUMN: &str = "Fees";

#[derive(Debug, Clone, PartialEq)]
pub enum RawPeriod {
    Date(NaiveDate),
    Text(String),
    Missing,
}

/// One line of the source timesheet, before any mapping or grouping.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEntry {
    /// 1-based row in the source file, for diagnostics.
    pub row: usize,
    pub work_package: String,
    pub name: Option<String>,
    pub period: RawPeriod,
    pub fees: Option<Decimal>,
}

/// Loads source entries from a spreadsheet (first sheet unless `sheet` is
/// given) or from a CSV file, chosen by extension.
pub fn load_source_entries(path: impl AsRef<Path>, sheet: Option<&str>) -> Result<Vec<SourceEntry>> {
    let path = path.as_ref();
    let is_csv = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);

    let grid = if is_csv {
        read_csv_grid(path)?
    } else {
        xlsx::read_value_grid(path, sheet)?
    };

    let entries = entries_from_grid(&grid, path)?;
    info!("Loaded {} source entries from {}", entries.len(), path.display());
    Ok(entries)
}

/// Reads source entries from a grid whose first row names the columns.
pub fn entries_from_grid(grid: &Grid, path: &Path) -> Result<Vec<SourceEntry>> {
    let work_package_col = find_column(grid, WORK_PACKAGE_COLUMN, path)?;
    let name_col = find_column(grid, NAME_COLUMN, path)?;
    let period_col = find_column(grid, PERIOD_COLUMN, path)?;
    let fees_col = find_column(grid, FEES_COLUMN, path)?;

    let mut entries = Vec::new();
    for row in 2..=grid.max_row() {
        let cells = [work_package_col, name_col, period_col, fees_col]
            .map(|col| grid.value(row, col));
        if cells.iter().all(|c| c.as_label().is_none()) {
            continue;
        }
        let [work_package, name, period, fees] = cells;

        entries.push(SourceEntry {
            row: row as usize,
            work_package: match work_package {
                CellValue::Text(s) => s.clone(),
                other => other.as_label().unwrap_or_default(),
            },
            name: name.as_label(),
            period: match period {
                CellValue::Date(dt) => RawPeriod::Date(dt.date()),
                other => other
                    .as_label()
                    .map(RawPeriod::Text)
                    .unwrap_or(RawPeriod::Missing),
            },
            fees: parse_fee(fees, row as usize)?,
        });
    }

    debug!("Read {} non-empty source rows", entries.len());
    Ok(entries)
}

fn find_column(grid: &Grid, header: &str, path: &Path) -> Result<u16> {
    (1..=grid.max_column())
        .find(|&col| {
            grid.value(1, col)
                .as_label()
                .map(|label| label.eq_ignore_ascii_case(header))
                .unwrap_or(false)
        })
        .ok_or_else(|| ReconcileError::MissingColumn {
            column: header.to_string(),
            path: path.to_path_buf(),
        })
}

fn parse_fee(cell: &CellValue, row: usize) -> Result<Option<Decimal>> {
    match cell {
        CellValue::Empty => Ok(None),
        CellValue::Number(n) if n.is_nan() => Ok(None),
        CellValue::Number(n) => Decimal::from_f64(*n)
            .map(Some)
            .ok_or_else(|| ReconcileError::InvalidFee {
                row,
                value: n.to_string(),
            }),
        CellValue::Text(s) if s.trim().is_empty() => Ok(None),
        CellValue::Text(s) => Decimal::from_str(s.trim())
            .map(Some)
            .map_err(|_| ReconcileError::InvalidFee {
                row,
                value: s.clone(),
            }),
        other => Err(ReconcileError::InvalidFee {
            row,
            value: format!("{:?}", other),
        }),
    }
}

fn read_csv_grid(path: &Path) -> Result<Grid> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;

    let mut grid = Grid::new();
    for (row_idx, record) in reader.records().enumerate() {
        let record = record?;
        for (col_idx, field) in record.iter().enumerate() {
            if field.is_empty() {
                continue;
            }
            grid.set(
                CellAddress::new(row_idx as u32 + 1, col_idx as u16 + 1),
                CellValue::Text(field.to_string()),
            );
        }
    }
    Ok(grid)
}
