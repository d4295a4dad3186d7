//! In-memory grid model shared by the parser, the engine and the xlsx adapter.
//!
//! The reconciled sheet of a target workbook is held as two views over the
//! same loaded values:
//! - [`EvaluatedSnapshot`]: read-only cached values (formula results), used to
//!   read the "before" side of every reconciled cell.
//! - [`EditTarget`]: values plus formula text plus highlight marks, the only
//!   thing the reconciliation engine writes to.

use chrono::NaiveDateTime;
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum CellValue {
    #[default]
    Empty,
    Number(f64),
    Text(String),
    Bool(bool),
    Date(NaiveDateTime),
    Error(String),
}

impl CellValue {
    /// Text as it would be read off the label column, trimmed. `None` for
    /// empty cells and cells that trim to nothing.
    pub fn as_label(&self) -> Option<String> {
        let label = match self {
            CellValue::Empty | CellValue::Error(_) => return None,
            CellValue::Text(s) => s.trim().to_string(),
            CellValue::Number(n) => n.to_string(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Date(d) => d.date().to_string(),
        };
        if label.is_empty() {
            None
        } else {
            Some(label)
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) if n.is_finite() => Some(*n),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }
}

/// 1-based spreadsheet coordinate. Displays as A1 notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellAddress {
    pub row: u32,
    pub col: u16,
}

impl CellAddress {
    pub fn new(row: u32, col: u16) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for CellAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", column_letters(self.col), self.row)
    }
}

impl Serialize for CellAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidCellAddress(pub String);

impl fmt::Display for InvalidCellAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid cell address '{}'", self.0)
    }
}

impl std::error::Error for InvalidCellAddress {}

impl FromStr for CellAddress {
    type Err = InvalidCellAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let split = upper
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| InvalidCellAddress(s.to_string()))?;
        let (letters, digits) = upper.split_at(split);
        if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(InvalidCellAddress(s.to_string()));
        }

        let mut col: u32 = 0;
        for c in letters.chars() {
            col = col * 26 + (c as u32 - 'A' as u32 + 1);
            if col > u32::from(u16::MAX) {
                return Err(InvalidCellAddress(s.to_string()));
            }
        }
        let row: u32 = digits
            .parse()
            .map_err(|_| InvalidCellAddress(s.to_string()))?;
        if row == 0 {
            return Err(InvalidCellAddress(s.to_string()));
        }
        Ok(Self::new(row, col as u16))
    }
}

/// Column letters for a 1-based column index (1 = A, 27 = AA).
pub fn column_letters(col: u16) -> String {
    let mut n = u32::from(col);
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Sparse grid of cell values with its physical bounds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Grid {
    cells: BTreeMap<CellAddress, CellValue>,
    max_row: u32,
    max_col: u16,
}

impl Grid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, addr: CellAddress, value: CellValue) {
        self.max_row = self.max_row.max(addr.row);
        self.max_col = self.max_col.max(addr.col);
        self.cells.insert(addr, value);
    }

    /// Widens the physical bounds without storing a cell, for trailing blank
    /// areas a reader reports as part of the used range.
    pub fn extend_bounds(&mut self, row: u32, col: u16) {
        self.max_row = self.max_row.max(row);
        self.max_col = self.max_col.max(col);
    }

    pub fn get(&self, addr: CellAddress) -> &CellValue {
        static EMPTY: CellValue = CellValue::Empty;
        self.cells.get(&addr).unwrap_or(&EMPTY)
    }

    pub fn value(&self, row: u32, col: u16) -> &CellValue {
        self.get(CellAddress::new(row, col))
    }

    pub fn max_row(&self) -> u32 {
        self.max_row
    }

    pub fn max_column(&self) -> u16 {
        self.max_col
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CellAddress, &CellValue)> {
        self.cells.iter()
    }
}

/// Read-only view of evaluated (cached) cell values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluatedSnapshot {
    grid: Grid,
}

impl EvaluatedSnapshot {
    pub fn new(grid: Grid) -> Self {
        Self { grid }
    }

    pub fn value(&self, row: u32, col: u16) -> &CellValue {
        self.grid.value(row, col)
    }

    pub fn get(&self, addr: CellAddress) -> &CellValue {
        self.grid.get(addr)
    }

    pub fn max_row(&self) -> u32 {
        self.grid.max_row()
    }

    pub fn max_column(&self) -> u16 {
        self.grid.max_column()
    }
}

/// Mutable view of one worksheet: values, formula text and highlight marks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EditTarget {
    pub name: String,
    values: Grid,
    formulas: BTreeMap<CellAddress, String>,
    highlighted: BTreeSet<CellAddress>,
}

impl EditTarget {
    pub fn new(name: impl Into<String>, values: Grid) -> Self {
        Self {
            name: name.into(),
            values,
            formulas: BTreeMap::new(),
            highlighted: BTreeSet::new(),
        }
    }

    pub fn with_formula(mut self, addr: CellAddress, formula: impl Into<String>) -> Self {
        self.set_formula(addr, formula);
        self
    }

    pub fn set_formula(&mut self, addr: CellAddress, formula: impl Into<String>) {
        let formula = formula.into();
        let formula = formula.strip_prefix('=').unwrap_or(&formula).to_string();
        if !formula.is_empty() {
            self.formulas.insert(addr, formula);
        }
    }

    /// Overwrites the cell with a machine-computed fee and marks it for
    /// highlighting. Returns the formula the value replaced, if any.
    pub fn write_fee(&mut self, addr: CellAddress, fee: i64) -> Option<String> {
        self.values.set(addr, CellValue::Number(fee as f64));
        self.highlighted.insert(addr);
        self.formulas.remove(&addr)
    }

    pub fn value(&self, addr: CellAddress) -> &CellValue {
        self.values.get(addr)
    }

    pub fn formula(&self, addr: CellAddress) -> Option<&str> {
        self.formulas.get(&addr).map(String::as_str)
    }

    pub fn is_highlighted(&self, addr: CellAddress) -> bool {
        self.highlighted.contains(&addr)
    }

    pub fn highlighted_count(&self) -> usize {
        self.highlighted.len()
    }

    /// Machine-written cells with their new values, in address order.
    pub fn written_cells(&self) -> BTreeMap<CellAddress, f64> {
        self.highlighted
            .iter()
            .filter_map(|addr| self.values.get(*addr).as_number().map(|n| (*addr, n)))
            .collect()
    }
}

/// The reconciled sheet of a target workbook as its two views. Other sheets
/// are never loaded; the package writer copies them from the original file.
#[derive(Debug, Clone)]
pub struct TargetWorkbook {
    snapshot: EvaluatedSnapshot,
    target: EditTarget,
}

impl TargetWorkbook {
    pub fn new(target: EditTarget) -> Self {
        Self {
            snapshot: EvaluatedSnapshot::new(target.values.clone()),
            target,
        }
    }

    pub fn snapshot(&self) -> &EvaluatedSnapshot {
        &self.snapshot
    }

    pub fn edit_target(&self) -> &EditTarget {
        &self.target
    }

    pub fn edit_target_mut(&mut self) -> &mut EditTarget {
        &mut self.target
    }
}
