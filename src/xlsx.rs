//! Spreadsheet adapter: calamine for reading, rust_xlsxwriter for the
//! processed table, and the package patcher for the updated target.

use crate::aggregator::ProcessedFeeRow;
use crate::error::{ReconcileError, Result};
use crate::output::write_bytes_atomic;
use crate::package::{self, PatchReport};
use crate::sheet::{CellAddress, CellValue, EditTarget, Grid, TargetWorkbook};
use crate::utils::parse_period_text;
use calamine::{open_workbook_auto, Data, Range, Reader, Sheets};
use log::{debug, info};
use rust_xlsxwriter::{Workbook, Worksheet, XlsxError};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

type CalamineBook = Sheets<BufReader<File>>;

fn open(path: &Path, stage: &'static str) -> Result<CalamineBook> {
    if !path.exists() {
        return Err(ReconcileError::io(
            stage,
            path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "file does not exist"),
        ));
    }
    open_workbook_auto(path).map_err(|e| ReconcileError::workbook(stage, path, e))
}

fn data_to_cell_value(data: &Data) -> CellValue {
    match data {
        Data::Empty => CellValue::Empty,
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Float(f) => CellValue::Number(*f),
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(CellValue::Date)
            .unwrap_or(CellValue::Number(dt.as_f64())),
        Data::DateTimeIso(s) => parse_period_text(s)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(CellValue::Date)
            .unwrap_or_else(|| CellValue::Text(s.clone())),
        Data::DurationIso(s) => CellValue::Text(s.clone()),
        Data::Error(e) => CellValue::Error(format!("{:?}", e)),
    }
}

fn range_to_grid(range: &Range<Data>) -> Grid {
    let mut grid = Grid::new();
    let Some((row0, col0)) = range.start() else {
        return grid;
    };
    if let Some((row_end, col_end)) = range.end() {
        grid.extend_bounds(row_end + 1, (col_end + 1) as u16);
    }
    for (r, c, data) in range.cells() {
        if matches!(data, Data::Empty) {
            continue;
        }
        let addr = CellAddress::new(row0 + r as u32 + 1, (col0 as usize + c + 1) as u16);
        grid.set(addr, data_to_cell_value(data));
    }
    grid
}

fn apply_formulas(target: &mut EditTarget, range: &Range<String>) {
    let Some((row0, col0)) = range.start() else {
        return;
    };
    for (r, c, formula) in range.cells() {
        if formula.is_empty() {
            continue;
        }
        let addr = CellAddress::new(row0 + r as u32 + 1, (col0 as usize + c + 1) as u16);
        target.set_formula(addr, formula.as_str());
    }
}

/// Evaluated values of one sheet (the first one when `sheet` is `None`).
pub fn read_value_grid(path: &Path, sheet: Option<&str>) -> Result<Grid> {
    let stage = "source load";
    let mut workbook = open(path, stage)?;
    let names = workbook.sheet_names();
    let name = match sheet {
        Some(name) => name.to_string(),
        None => names.first().cloned().ok_or_else(|| ReconcileError::SheetNotFound {
            name: "<first sheet>".to_string(),
            path: path.to_path_buf(),
        })?,
    };
    if !names.contains(&name) {
        return Err(ReconcileError::SheetNotFound {
            name,
            path: path.to_path_buf(),
        });
    }
    let range = workbook
        .worksheet_range(&name)
        .map_err(|e| ReconcileError::workbook(stage, path, e))?;
    Ok(range_to_grid(&range))
}

/// Loads `target_sheet` as an edit target (cached values plus formula text)
/// with its evaluated snapshot.
pub fn read_target_workbook(path: &Path, target_sheet: &str) -> Result<TargetWorkbook> {
    let stage = "target load";
    let mut workbook = open(path, stage)?;

    if !workbook.sheet_names().iter().any(|name| name == target_sheet) {
        return Err(ReconcileError::SheetNotFound {
            name: target_sheet.to_string(),
            path: path.to_path_buf(),
        });
    }
    let range = workbook
        .worksheet_range(target_sheet)
        .map_err(|e| ReconcileError::workbook(stage, path, e))?;
    let mut target = EditTarget::new(target_sheet, range_to_grid(&range));
    match workbook.worksheet_formula(target_sheet) {
        Ok(formulas) => apply_formulas(&mut target, &formulas),
        Err(e) => debug!("No formulas read for sheet '{}': {}", target_sheet, e),
    }
    info!("Loaded sheet '{}' from {}", target_sheet, path.display());

    Ok(TargetWorkbook::new(target))
}

/// Writes `dest` as a copy of the xlsx file at `source` in which the
/// machine-written cells of `book` carry their new values and the
/// `highlight_rgb` font colour.
pub fn write_updated_workbook(
    source: &Path,
    dest: &Path,
    book: &TargetWorkbook,
    highlight_rgb: u32,
) -> Result<PatchReport> {
    let target = book.edit_target();
    package::patch_workbook(
        source,
        dest,
        &target.name,
        &target.written_cells(),
        highlight_rgb,
    )
}

/// Writes the processed fee table as a single "Processed Data" sheet.
pub fn write_processed_table(path: &Path, rows: &[ProcessedFeeRow]) -> Result<()> {
    let stage = "processed table save";
    let mut workbook = Workbook::new();
    let ws = workbook.add_worksheet();

    let write = |ws: &mut Worksheet| -> std::result::Result<(), XlsxError> {
        ws.set_name("Processed Data")?;
        for (col, (header, width)) in [
            ("Operation", 40),
            ("Employee", 35),
            ("Period", 12),
            ("StartDate", 12),
            ("Fees", 12),
        ]
        .into_iter()
        .enumerate()
        {
            ws.write_string(0, col as u16, header)?;
            ws.set_column_width(col as u16, width)?;
        }
        for (idx, row) in rows.iter().enumerate() {
            let r = idx as u32 + 1;
            ws.write_string(r, 0, &row.operation)?;
            ws.write_string(r, 1, &row.employee)?;
            ws.write_string(r, 2, &row.period)?;
            ws.write_string(r, 3, &row.start_date)?;
            ws.write_number(r, 4, row.fees as f64)?;
        }
        Ok(())
    };
    write(ws).map_err(|e| ReconcileError::workbook(stage, path, e))?;

    let bytes = workbook
        .save_to_buffer()
        .map_err(|e| ReconcileError::workbook(stage, path, e))?;
    write_bytes_atomic(path, stage, &bytes)?;
    info!("Processed data saved to: {}", path.display());
    Ok(())
}
