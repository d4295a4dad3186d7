use calamine::{open_workbook_auto, Data, Reader};
use chrono::NaiveDate;
use rust_xlsxwriter::{Format, Formula, Workbook};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use timesheet_reconciler::*;

fn write_source(path: &Path, rows: &[(&str, &str, NaiveDate, f64)]) {
    let mut workbook = Workbook::new();
    let date_format = Format::new().set_num_format("yyyy-mm-dd");
    let ws = workbook.add_worksheet();
    for (col, header) in ["Work Package", "Name", "Period", "Fees"].iter().enumerate() {
        ws.write_string(0, col as u16, *header).unwrap();
    }
    for (idx, (wp, name, period, fees)) in rows.iter().enumerate() {
        let r = idx as u32 + 1;
        ws.write_string(r, 0, *wp).unwrap();
        ws.write_string(r, 1, *name).unwrap();
        ws.write_datetime_with_format(r, 2, period, &date_format)
            .unwrap();
        ws.write_number(r, 3, *fees).unwrap();
    }
    workbook.save(path).unwrap();
}

/// Project sheet:
///
/// ```text
///    E                    F (2024-10)   G (=EDATE(F1,1))
/// 2  Budget overview (merged E2:G2)
/// 3  Avature Crew
/// 4  Filipe Pires         100           =F4-10  (90)
/// 5  Rita Bicho                         =F4/10  (10)
/// 6  Total                =SUM (100)    =SUM (100)
/// 7  Accumulated Total
/// 8  Filipe Pires         1             1
/// ```
///
/// Month headers are dates, F4 carries a number format and column E a
/// custom width.
fn write_target(path: &Path) {
    let mut workbook = Workbook::new();
    let month = Format::new().set_num_format("yyyy-mm");
    let money = Format::new().set_num_format("0.000").set_bold();
    let banner = Format::new().set_bold();

    let ws = workbook.add_worksheet();
    ws.set_name("Project").unwrap();
    ws.set_column_width(4, 30).unwrap();
    ws.write_string(0, 4, "Label").unwrap();
    ws.write_date_with_format(0, 5, &d(2024, 10, 1), &month)
        .unwrap();
    ws.write_formula_with_format(0, 6, Formula::new("EDATE(F1,1)").set_result("45597"), &month)
        .unwrap();
    ws.merge_range(1, 4, 1, 6, "Budget overview", &banner).unwrap();
    ws.write_string(2, 4, "Avature Crew").unwrap();
    ws.write_string(3, 4, "Filipe Pires").unwrap();
    ws.write_number_with_format(3, 5, 100.0, &money).unwrap();
    ws.write_formula(3, 6, Formula::new("F4-10").set_result("90"))
        .unwrap();
    ws.write_string(4, 4, "Rita Bicho").unwrap();
    ws.write_formula(4, 6, Formula::new("F4/10").set_result("10"))
        .unwrap();
    ws.write_string(5, 4, "Total").unwrap();
    ws.write_formula(5, 5, Formula::new("SUM(F4:F5)").set_result("100"))
        .unwrap();
    ws.write_formula(5, 6, Formula::new("SUM(G4:G5)").set_result("100"))
        .unwrap();
    ws.write_string(6, 4, "Accumulated Total").unwrap();
    ws.write_string(7, 4, "Filipe Pires").unwrap();
    ws.write_number(7, 5, 1.0).unwrap();
    ws.write_number(7, 6, 1.0).unwrap();

    let notes = workbook.add_worksheet();
    notes.set_name("Notes").unwrap();
    notes.write_string(0, 0, "do not touch").unwrap();

    workbook.save(path).unwrap();
}

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn fixture(dir: &Path) -> (PathBuf, PathBuf) {
    let source = dir.join("source_timesheet.xlsx");
    let target = dir.join("target_sheet.xlsx");
    write_source(
        &source,
        &[
            ("001 / Avature Crew  - PM/CM", "Filipe Pires", d(2024, 10, 3), 60.2),
            ("003 / Avature Crew  - Testcenter", "Pires, Filipe", d(2024, 10, 28), 60.4),
            ("003 / Avature Crew  - Testcenter", "Rita Bicho", d(2024, 11, 12), 80.0),
            ("999 / Internal", "Rita Bicho", d(2024, 11, 12), 5.0),
            ("005 / Eightfold Crew - PM/CM", "Claudia Swoboda", d(2024, 11, 2), 33.5),
        ],
    );
    write_target(&target);
    (source, target)
}

fn cell(path: &Path, sheet: &str, row: usize, col: usize) -> Data {
    let mut workbook = open_workbook_auto(path).unwrap();
    let range = workbook.worksheet_range(sheet).unwrap();
    range.get_value((row as u32, col as u32)).cloned().unwrap_or(Data::Empty)
}

/// Raw text of one part of an xlsx package.
fn part(path: &Path, name: &str) -> String {
    let mut archive = zip::ZipArchive::new(fs::File::open(path).unwrap()).unwrap();
    let mut text = String::new();
    archive
        .by_name(name)
        .unwrap()
        .read_to_string(&mut text)
        .unwrap();
    text
}

fn as_f64(data: &Data) -> Option<f64> {
    match data {
        Data::Float(f) => Some(*f),
        Data::Int(i) => Some(*i as f64),
        _ => None,
    }
}

#[test]
fn test_full_run_updates_matching_cells() {
    let dir = tempfile::tempdir().unwrap();
    let (source, target) = fixture(dir.path());
    let out = dir.path().join("out");

    let reconciler = TimesheetReconciler::new(ReconcilerConfig::default()).unwrap();
    let summary = reconciler
        .run(&RunPaths::new(&source, &target, &out))
        .unwrap();

    assert_eq!(summary.source_entries, 5);
    assert_eq!(summary.unmapped_entries, 1);
    assert_eq!(summary.fee_records, 3);
    assert_eq!(summary.cell_mappings, 4);
    assert_eq!(summary.updated_cells, 2);
    assert_eq!(summary.missing_cells, 2);
    assert_eq!(summary.overwritten_formulas, 1);
    assert_eq!(
        summary.updated_target,
        dir.path().join("target_sheet_updated.xlsx")
    );

    // 60.2 + 60.4 = 120.6 rounds to 121; rounding each entry first would give 120.
    let updated = &summary.updated_target;
    assert_eq!(as_f64(&cell(updated, "Project", 3, 5)), Some(121.0));
    assert_eq!(as_f64(&cell(updated, "Project", 4, 6)), Some(80.0));
    // No October record for Rita: the blank cell stays blank.
    assert_eq!(cell(updated, "Project", 4, 5), Data::Empty);
    // Rows after the terminator are never touched.
    assert_eq!(as_f64(&cell(updated, "Project", 7, 5)), Some(1.0));
    assert_eq!(
        cell(updated, "Notes", 0, 0),
        Data::String("do not touch".to_string())
    );

    // The original target is left as it was.
    assert_eq!(as_f64(&cell(&target, "Project", 3, 5)), Some(100.0));

    // The formula header keeps its cached date, and so its month.
    assert!(matches!(cell(updated, "Project", 0, 6), Data::DateTime(_)));
    // G4 was not written and keeps its formula; G5 now holds a value.
    let reread = xlsx::read_target_workbook(updated, "Project").unwrap();
    assert_eq!(
        reread.edit_target().formula(CellAddress::new(4, 7)),
        Some("F4-10")
    );
    assert_eq!(reread.edit_target().formula(CellAddress::new(5, 7)), None);
    assert_eq!(
        reread.edit_target().formula(CellAddress::new(6, 6)),
        Some("SUM(F4:F5)")
    );

    // Formatting of the original package is carried over.
    let sheet_xml = part(updated, "xl/worksheets/sheet1.xml");
    assert!(sheet_xml.contains(r#"<mergeCell ref="E2:G2"/>"#));
    assert!(sheet_xml.contains("<cols>"));
    let styles_xml = part(updated, "xl/styles.xml");
    assert!(styles_xml.contains(r#"formatCode="0.000""#));
    assert!(styles_xml.contains(r#"<color rgb="FFFFA500"/>"#));
    assert!(!part(&target, "xl/styles.xml").contains("FFFFA500"));
    assert_eq!(
        part(updated, "xl/worksheets/sheet2.xml"),
        part(&target, "xl/worksheets/sheet2.xml")
    );

    let audit = fs::read_to_string(&summary.audit_log).unwrap();
    let lines: Vec<&str> = audit.lines().collect();
    assert_eq!(
        lines,
        vec![
            "Operation,Employee,Month,CellAddress,FeesBefore,FeesAfter",
            "Avature Crew,\"Pires, Filipe\",2024-10,F4,100,121",
            "Avature Crew,\"Pires, Filipe\",2024-11,G4,90,-1",
            "Avature Crew,\"Bicho, Rita\",2024-10,F5,-1,-1",
            "Avature Crew,\"Bicho, Rita\",2024-11,G5,10,80",
        ]
    );

    let chunk_names: Vec<String> = summary
        .chunk_files
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        chunk_names,
        vec![
            "processed_Eightfold_Crew.csv",
            "processed_Avature_Crew.csv",
            "audit_Avature_Crew.csv",
        ]
    );

    let processed = fs::read_to_string(out.join("chunks/processed_chunks/processed_Avature_Crew.csv"))
        .unwrap();
    assert!(processed.starts_with("Operation,Employee,Period,StartDate,Fees\n"));
    assert!(processed.contains("Avature Crew,\"Pires, Filipe\",Oct-24,2024-10,121"));

    let processed_table = summary.processed_table;
    assert_eq!(
        cell(&processed_table, "Processed Data", 1, 0),
        Data::String("Eightfold Crew".to_string())
    );
    assert_eq!(as_f64(&cell(&processed_table, "Processed Data", 1, 4)), Some(34.0));
}

#[test]
fn test_run_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (source, target) = fixture(dir.path());
    let reconciler = TimesheetReconciler::new(ReconcilerConfig::default()).unwrap();

    let mut first = RunPaths::new(&source, &target, dir.path().join("out1"));
    first.updated_target = Some(dir.path().join("first.xlsx"));
    let mut second = RunPaths::new(&source, &target, dir.path().join("out2"));
    second.updated_target = Some(dir.path().join("second.xlsx"));

    let a = reconciler.run(&first).unwrap();
    let b = reconciler.run(&second).unwrap();

    assert_eq!(
        fs::read_to_string(&a.audit_log).unwrap(),
        fs::read_to_string(&b.audit_log).unwrap()
    );

    let book_a = xlsx::read_target_workbook(&a.updated_target, "Project").unwrap();
    let book_b = xlsx::read_target_workbook(&b.updated_target, "Project").unwrap();
    assert_eq!(book_a.snapshot(), book_b.snapshot());
}

#[test]
fn test_rerun_on_updated_workbook_finds_every_month() {
    let dir = tempfile::tempdir().unwrap();
    let (source, target) = fixture(dir.path());
    let reconciler = TimesheetReconciler::new(ReconcilerConfig::default()).unwrap();

    let first = reconciler
        .run(&RunPaths::new(&source, &target, dir.path().join("out1")))
        .unwrap();
    let second = reconciler
        .run(&RunPaths::new(
            &source,
            &first.updated_target,
            dir.path().join("out2"),
        ))
        .unwrap();

    assert_eq!(second.cell_mappings, 4);
    assert_eq!(second.overwritten_formulas, 0);
    let audit = fs::read_to_string(&second.audit_log).unwrap();
    let lines: Vec<&str> = audit.lines().skip(1).collect();
    assert_eq!(
        lines,
        vec![
            "Avature Crew,\"Pires, Filipe\",2024-10,F4,121,121",
            "Avature Crew,\"Pires, Filipe\",2024-11,G4,90,-1",
            "Avature Crew,\"Bicho, Rita\",2024-10,F5,-1,-1",
            "Avature Crew,\"Bicho, Rita\",2024-11,G5,80,80",
        ]
    );
}

#[test]
fn test_unparseable_period_aborts_before_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let (_, target) = fixture(dir.path());
    let source = dir.path().join("source.csv");
    fs::write(
        &source,
        "Work Package,Name,Period,Fees\n001 / Avature Crew  - PM/CM,Filipe Pires,03/04/2024,10\n",
    )
    .unwrap();
    let out = dir.path().join("out");

    let reconciler = TimesheetReconciler::new(ReconcilerConfig::default()).unwrap();
    let err = reconciler
        .run(&RunPaths::new(&source, &target, &out))
        .unwrap_err();

    assert!(matches!(err, ReconcileError::PeriodParse { row: 2, .. }));
    assert!(!out.exists());
    assert!(!dir.path().join("target_sheet_updated.xlsx").exists());
}

#[test]
fn test_refuses_to_overwrite_target() {
    let dir = tempfile::tempdir().unwrap();
    let (source, target) = fixture(dir.path());
    let mut paths = RunPaths::new(&source, &target, dir.path().join("out"));
    paths.updated_target = Some(target.clone());

    let reconciler = TimesheetReconciler::new(ReconcilerConfig::default()).unwrap();
    assert!(matches!(
        reconciler.run(&paths),
        Err(ReconcileError::InvalidConfig(_))
    ));
}

#[test]
fn test_missing_target_sheet_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let (source, target) = fixture(dir.path());
    let mut config = ReconcilerConfig::default();
    config.target_layout.sheet_name = "Budget".to_string();

    let reconciler = TimesheetReconciler::new(config).unwrap();
    let err = reconciler
        .run(&RunPaths::new(&source, &target, dir.path().join("out")))
        .unwrap_err();
    assert!(matches!(err, ReconcileError::SheetNotFound { name, .. } if name == "Budget"));
}
