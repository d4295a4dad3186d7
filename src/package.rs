//! In-place update of an xlsx package.
//!
//! The updated workbook is the original zip archive with only the parts that
//! have to change rewritten: the reconciled worksheet (new values on written
//! cells), the stylesheet (a highlighted twin of each cell style in use) and
//! the workbook's calculation settings. Every other part is copied raw, so
//! other sheets, number formats, column widths and merged ranges are kept
//! exactly as they were.

use crate::error::{ReconcileError, Result};
use crate::output::write_bytes_atomic;
use crate::sheet::CellAddress;
use log::{debug, info};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Cursor, Read, Seek, Write};
use std::path::Path;
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const STAGE: &str = "updated workbook save";
const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";
const STYLES_PART: &str = "xl/styles.xml";
const CONTENT_TYPES_PART: &str = "[Content_Types].xml";
const CALC_CHAIN_PART: &str = "xl/calcChain.xml";

#[derive(Debug, Error)]
enum PackageError {
    #[error("malformed {part}: {source}")]
    Xml {
        part: String,
        #[source]
        source: quick_xml::Error,
    },

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Layout(String),
}

type PackageResult<T> = std::result::Result<T, PackageError>;
type XmlResult<T> = std::result::Result<T, quick_xml::Error>;

trait InPart<T> {
    fn in_part(self, part: &str) -> PackageResult<T>;
}

impl<T> InPart<T> for XmlResult<T> {
    fn in_part(self, part: &str) -> PackageResult<T> {
        self.map_err(|source| PackageError::Xml {
            part: part.to_string(),
            source,
        })
    }
}

/// What one package update changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    /// Existing cells whose content was replaced.
    pub replaced_cells: usize,
    /// Cells that had no element in the sheet and were inserted.
    pub inserted_cells: usize,
    /// Replaced cells that held a formula.
    pub replaced_formulas: usize,
    /// Highlighted cell styles added to the stylesheet.
    pub highlight_styles: usize,
}

/// Copies the xlsx package at `source` to `dest`, writing `values` into the
/// worksheet `sheet_name` with a `highlight_rgb` font on every written cell.
pub fn patch_workbook(
    source: &Path,
    dest: &Path,
    sheet_name: &str,
    values: &BTreeMap<CellAddress, f64>,
    highlight_rgb: u32,
) -> Result<PatchReport> {
    let (bytes, report) = build_package(source, sheet_name, values, highlight_rgb)
        .map_err(|e| ReconcileError::workbook(STAGE, source, e))?;
    write_bytes_atomic(dest, STAGE, &bytes)?;
    info!(
        "Patched '{}': {} cells replaced, {} inserted, {} formulas overwritten",
        sheet_name, report.replaced_cells, report.inserted_cells, report.replaced_formulas
    );
    Ok(report)
}

fn build_package(
    source: &Path,
    sheet_name: &str,
    values: &BTreeMap<CellAddress, f64>,
    highlight_rgb: u32,
) -> PackageResult<(Vec<u8>, PatchReport)> {
    let mut archive = ZipArchive::new(File::open(source)?)?;

    let workbook_xml = read_part(&mut archive, WORKBOOK_PART)?;
    let rels_xml = read_part(&mut archive, WORKBOOK_RELS_PART)?;
    let sheet_part = sheet_part_name(&workbook_xml, &rels_xml, sheet_name)?.ok_or_else(|| {
        PackageError::Layout(format!("sheet '{}' is not part of the workbook", sheet_name))
    })?;
    debug!("Sheet '{}' lives in {}", sheet_name, sheet_part);

    let sheet_xml = read_part(&mut archive, &sheet_part)?;
    let styles_xml = read_part(&mut archive, STYLES_PART)?;

    let mut styles = HighlightStyles::parse(&styles_xml, highlight_rgb)?;
    let (sheet_out, mut report) = patch_sheet(&sheet_xml, &sheet_part, values, &mut styles)?;
    report.highlight_styles = styles.added();

    let mut patched: HashMap<String, Vec<u8>> = HashMap::new();
    patched.insert(STYLES_PART.to_string(), styles.render(&styles_xml)?);
    patched.insert(sheet_part, sheet_out);
    patched.insert(WORKBOOK_PART.to_string(), request_full_recalc(&workbook_xml)?);

    // The calculation chain may only list cells that hold formulas. Excel
    // recreates it on the full recalculation requested above.
    let mut dropped: Vec<&str> = Vec::new();
    if report.replaced_formulas > 0 && archive.file_names().any(|n| n == CALC_CHAIN_PART) {
        dropped.push(CALC_CHAIN_PART);
        patched.insert(
            WORKBOOK_RELS_PART.to_string(),
            drop_elements(&rels_xml, WORKBOOK_RELS_PART, b"Relationship", b"Target", |t| {
                t.ends_with("calcChain.xml")
            })?,
        );
        let content_types = read_part(&mut archive, CONTENT_TYPES_PART)?;
        patched.insert(
            CONTENT_TYPES_PART.to_string(),
            drop_elements(&content_types, CONTENT_TYPES_PART, b"Override", b"PartName", |p| {
                p.ends_with("/calcChain.xml")
            })?,
        );
    }

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for index in 0..archive.len() {
        let file = archive.by_index(index)?;
        let name = file.name().to_string();
        if dropped.contains(&name.as_str()) {
            continue;
        }
        match patched.remove(&name) {
            Some(data) => {
                let options =
                    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
                writer.start_file(name, options)?;
                writer.write_all(&data)?;
            }
            None => writer.raw_copy_file(file)?,
        }
    }
    Ok((writer.finish()?.into_inner(), report))
}

fn read_part<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> PackageResult<String> {
    let mut file = archive.by_name(name)?;
    let mut text = String::new();
    file.read_to_string(&mut text)?;
    Ok(text)
}

fn attr(reader: &Reader<&[u8]>, e: &BytesStart, key: &[u8]) -> XmlResult<Option<String>> {
    for a in e.attributes().with_checks(false) {
        let a = a?;
        if a.key.local_name().as_ref() == key {
            return Ok(Some(a.decode_and_unescape_value(reader)?.into_owned()));
        }
    }
    Ok(None)
}

fn numeric_attr(e: &BytesStart, key: &[u8]) -> XmlResult<Option<usize>> {
    for a in e.attributes().with_checks(false) {
        let a = a?;
        if a.key.local_name().as_ref() == key {
            return Ok(std::str::from_utf8(&a.value)
                .ok()
                .and_then(|v| v.trim().parse().ok()));
        }
    }
    Ok(None)
}

/// Copy of `e` with `updates` replacing (or adding) attributes. Other
/// attributes keep their raw, already-escaped values.
fn set_attributes(e: &BytesStart, updates: &[(&str, &str)]) -> XmlResult<BytesStart<'static>> {
    let mut out = e.clone().into_owned();
    out.clear_attributes();
    for a in e.attributes().with_checks(false) {
        let a = a?;
        if updates
            .iter()
            .any(|(key, _)| a.key.local_name().as_ref() == key.as_bytes())
        {
            continue;
        }
        out.push_attribute(a);
    }
    for update in updates {
        out.push_attribute(*update);
    }
    Ok(out)
}

/// Element name `local` with the namespace prefix used by `like`.
fn qualified(like: &BytesStart, local: &str) -> String {
    match like.name().prefix() {
        Some(prefix) => format!("{}:{}", String::from_utf8_lossy(prefix.as_ref()), local),
        None => local.to_string(),
    }
}

/// Resolves a sheet name to its worksheet part through the workbook
/// relationships.
fn sheet_part_name(
    workbook_xml: &str,
    rels_xml: &str,
    sheet_name: &str,
) -> PackageResult<Option<String>> {
    let mut relationship = None;
    let mut reader = Reader::from_str(workbook_xml);
    loop {
        match reader.read_event().in_part(WORKBOOK_PART)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                let name = attr(&reader, &e, b"name").in_part(WORKBOOK_PART)?;
                if name.as_deref() == Some(sheet_name) {
                    relationship = attr(&reader, &e, b"id").in_part(WORKBOOK_PART)?;
                    break;
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    let Some(relationship) = relationship else {
        return Ok(None);
    };

    let mut reader = Reader::from_str(rels_xml);
    loop {
        match reader.read_event().in_part(WORKBOOK_RELS_PART)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                let id = attr(&reader, &e, b"Id").in_part(WORKBOOK_RELS_PART)?;
                if id.as_deref() == Some(relationship.as_str()) {
                    return Ok(attr(&reader, &e, b"Target")
                        .in_part(WORKBOOK_RELS_PART)?
                        .map(|target| resolve_target(&target)));
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Zip entry name of a relationship target taken relative to `xl/`.
fn resolve_target(target: &str) -> String {
    let joined = match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{}", target),
    };
    let mut parts: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

type Element = Vec<Event<'static>>;

/// Every `child` element directly under a `container` element, as owned
/// event sequences from start tag to end tag.
fn collect_elements(xml: &str, container: &[u8], child: &[u8]) -> XmlResult<Vec<Element>> {
    let mut reader = Reader::from_str(xml);
    let mut parents: Vec<Vec<u8>> = Vec::new();
    let mut elements = Vec::new();
    let mut current: Element = Vec::new();
    let mut depth = 0usize;

    loop {
        let event = reader.read_event()?;
        if depth > 0 {
            match &event {
                Event::Start(_) => depth += 1,
                Event::End(_) => depth -= 1,
                Event::Eof => break,
                _ => {}
            }
            current.push(event.into_owned());
            if depth == 0 {
                elements.push(std::mem::take(&mut current));
            }
            continue;
        }

        let under_container = parents.last().map(Vec::as_slice) == Some(container);
        match event {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                if under_container && name == child {
                    depth = 1;
                    current.push(Event::Start(e.into_owned()));
                } else {
                    parents.push(name);
                }
            }
            Event::Empty(e) => {
                if under_container && e.local_name().as_ref() == child {
                    elements.push(vec![Event::Empty(e.into_owned())]);
                }
            }
            Event::End(_) => {
                parents.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(elements)
}

/// Cell formats (`cellXfs`) and fonts of a stylesheet, plus the highlighted
/// twins created for the cells being written.
struct HighlightStyles {
    rgb: u32,
    fonts: Vec<Element>,
    cell_xfs: Vec<Element>,
    new_fonts: Vec<Element>,
    new_xfs: Vec<Element>,
    font_map: HashMap<usize, usize>,
    xf_map: HashMap<usize, usize>,
}

impl HighlightStyles {
    fn parse(styles_xml: &str, rgb: u32) -> PackageResult<Self> {
        let fonts = collect_elements(styles_xml, b"fonts", b"font").in_part(STYLES_PART)?;
        let cell_xfs = collect_elements(styles_xml, b"cellXfs", b"xf").in_part(STYLES_PART)?;
        if fonts.is_empty() || cell_xfs.is_empty() {
            return Err(PackageError::Layout(
                "stylesheet defines no fonts or cell formats".to_string(),
            ));
        }
        Ok(Self {
            rgb,
            fonts,
            cell_xfs,
            new_fonts: Vec::new(),
            new_xfs: Vec::new(),
            font_map: HashMap::new(),
            xf_map: HashMap::new(),
        })
    }

    fn added(&self) -> usize {
        self.new_xfs.len()
    }

    /// Index of the cell format that looks like `style` with the highlight
    /// font colour. Created on first use and shared afterwards.
    fn highlighted(&mut self, style: usize) -> PackageResult<usize> {
        if let Some(&index) = self.xf_map.get(&style) {
            return Ok(index);
        }
        let missing = || PackageError::Layout(format!("cell style {} is not defined", style));

        let xf = self.cell_xfs.get(style).ok_or_else(missing)?;
        let font_id = start_tag(xf)
            .map(|e| numeric_attr(e, b"fontId"))
            .transpose()
            .in_part(STYLES_PART)?
            .flatten()
            .unwrap_or(0);
        let font = self.highlighted_font(font_id)?;

        let xf = self.cell_xfs.get(style).ok_or_else(missing)?;
        let twin = retarget_xf(xf, font).in_part(STYLES_PART)?;
        let index = self.cell_xfs.len() + self.new_xfs.len();
        self.new_xfs.push(twin);
        self.xf_map.insert(style, index);
        Ok(index)
    }

    fn highlighted_font(&mut self, font_id: usize) -> PackageResult<usize> {
        if let Some(&index) = self.font_map.get(&font_id) {
            return Ok(index);
        }
        let font = self
            .fonts
            .get(font_id)
            .ok_or_else(|| PackageError::Layout(format!("font {} is not defined", font_id)))?;
        let recoloured = recolour_font(font, self.rgb);
        let index = self.fonts.len() + self.new_fonts.len();
        self.new_fonts.push(recoloured);
        self.font_map.insert(font_id, index);
        Ok(index)
    }

    /// The stylesheet with the new fonts and cell formats appended and the
    /// container counts updated.
    fn render(&self, styles_xml: &str) -> PackageResult<Vec<u8>> {
        let additions = [
            (b"fonts".as_slice(), self.fonts.len(), self.new_fonts.as_slice()),
            (b"cellXfs".as_slice(), self.cell_xfs.len(), self.new_xfs.as_slice()),
        ];
        append_to_containers(styles_xml, &additions).in_part(STYLES_PART)
    }
}

fn start_tag(element: &Element) -> Option<&BytesStart<'static>> {
    match element.first() {
        Some(Event::Start(e)) | Some(Event::Empty(e)) => Some(e),
        _ => None,
    }
}

/// `font` with any colour replaced by the opaque `rgb` colour.
fn recolour_font(font: &Element, rgb: u32) -> Element {
    let mut out = Vec::with_capacity(font.len() + 2);
    let mut skip_depth = 0usize;

    for event in font {
        if skip_depth > 0 {
            match event {
                Event::Start(_) => skip_depth += 1,
                Event::End(_) => skip_depth -= 1,
                _ => {}
            }
            continue;
        }
        match event {
            Event::Start(e) if out.is_empty() => {
                out.push(event.clone());
                out.push(colour_tag(e, rgb));
            }
            Event::Empty(e) if out.is_empty() => {
                out.push(Event::Start(e.clone()));
                out.push(colour_tag(e, rgb));
                out.push(Event::End(e.to_end().into_owned()));
            }
            Event::Empty(e) if e.local_name().as_ref() == b"color" => {}
            Event::Start(e) if e.local_name().as_ref() == b"color" => skip_depth = 1,
            other => out.push(other.clone()),
        }
    }
    out
}

fn colour_tag(font: &BytesStart, rgb: u32) -> Event<'static> {
    let mut colour = BytesStart::new(qualified(font, "color"));
    colour.push_attribute(("rgb", format!("FF{:06X}", rgb & 0xFF_FFFF).as_str()));
    Event::Empty(colour)
}

/// `xf` pointing at `font_id`, with the font applied.
fn retarget_xf(xf: &Element, font_id: usize) -> XmlResult<Element> {
    let mut out = xf.clone();
    let font = font_id.to_string();
    let updates = [("fontId", font.as_str()), ("applyFont", "1")];
    if let Some(first) = out.first_mut() {
        let replaced = match &*first {
            Event::Start(e) => Event::Start(set_attributes(e, &updates)?),
            Event::Empty(e) => Event::Empty(set_attributes(e, &updates)?),
            other => other.clone(),
        };
        *first = replaced;
    }
    Ok(out)
}

fn append_to_containers(
    xml: &str,
    additions: &[(&[u8], usize, &[Element])],
) -> XmlResult<Vec<u8>> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len() + 1024));

    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) => {
                let addition = additions
                    .iter()
                    .find(|(name, _, _)| e.local_name().as_ref() == *name);
                match addition {
                    Some((_, existing, added)) => {
                        let count = (existing + added.len()).to_string();
                        let tag = set_attributes(&e, &[("count", count.as_str())])?;
                        writer.write_event(Event::Start(tag))?;
                    }
                    None => writer.write_event(Event::Start(e))?,
                }
            }
            Event::End(e) => {
                let addition = additions
                    .iter()
                    .find(|(name, _, _)| e.local_name().as_ref() == *name);
                if let Some((_, _, added)) = addition {
                    for event in added.iter().flatten() {
                        writer.write_event(event)?;
                    }
                }
                writer.write_event(Event::End(e))?;
            }
            other => writer.write_event(other)?,
        }
    }
    Ok(writer.into_inner())
}

/// Streams a worksheet, replacing or inserting the cells in `values`.
struct SheetPatcher<'s> {
    writer: Writer<Vec<u8>>,
    styles: &'s mut HighlightStyles,
    /// Namespace prefix of the sheet's elements, e.g. "x:" or "".
    prefix: String,
    report: PatchReport,
}

impl SheetPatcher<'_> {
    fn name(&self, local: &str) -> String {
        format!("{}{}", self.prefix, local)
    }

    fn write(&mut self, event: Event) -> XmlResult<()> {
        self.writer.write_event(event)
    }

    fn write_cell(&mut self, addr: CellAddress, base_style: usize, value: f64) -> PackageResult<()> {
        let style = self.styles.highlighted(base_style)?.to_string();
        let reference = addr.to_string();
        let text = value.to_string();

        let mut cell = BytesStart::new(self.name("c"));
        cell.push_attribute(("r", reference.as_str()));
        cell.push_attribute(("s", style.as_str()));
        let v = self.name("v");
        let part = "worksheet";
        self.write(Event::Start(cell)).in_part(part)?;
        self.write(Event::Start(BytesStart::new(v.as_str()))).in_part(part)?;
        self.write(Event::Text(BytesText::new(&text))).in_part(part)?;
        self.write(Event::End(BytesEnd::new(v.as_str()))).in_part(part)?;
        self.write(Event::End(BytesEnd::new(self.name("c")))).in_part(part)?;
        Ok(())
    }

    fn insert_cells(&mut self, row: u32, cells: BTreeMap<u16, f64>) -> PackageResult<()> {
        for (col, value) in cells {
            self.write_cell(CellAddress::new(row, col), 0, value)?;
            self.report.inserted_cells += 1;
        }
        Ok(())
    }

    fn insert_rows(&mut self, rows: BTreeMap<u32, BTreeMap<u16, f64>>) -> PackageResult<()> {
        for (row, cells) in rows {
            let mut tag = BytesStart::new(self.name("row"));
            tag.push_attribute(("r", row.to_string().as_str()));
            self.write(Event::Start(tag)).in_part("worksheet")?;
            self.insert_cells(row, cells)?;
            self.write(Event::End(BytesEnd::new(self.name("row"))))
                .in_part("worksheet")?;
        }
        Ok(())
    }
}

/// Entries of `map` with keys below `bound`, removed from `map`.
fn take_before<K: Ord + Copy, V>(map: &mut BTreeMap<K, V>, bound: K) -> BTreeMap<K, V> {
    let rest = map.split_off(&bound);
    std::mem::replace(map, rest)
}

/// Consumes a cell's children up to its end tag. Returns whether the cell
/// held a formula.
fn skip_cell(reader: &mut Reader<&[u8]>, addr: CellAddress, part: &str) -> PackageResult<bool> {
    let mut depth = 1usize;
    let mut formula = false;
    loop {
        let event = reader.read_event().in_part(part)?;
        let tag = match &event {
            Event::Start(e) => {
                depth += 1;
                Some(e)
            }
            Event::Empty(e) => Some(e),
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    return Ok(formula);
                }
                None
            }
            Event::Eof => {
                return Err(PackageError::Layout(format!("cell {} is not terminated", addr)))
            }
            _ => None,
        };
        if let Some(e) = tag.filter(|e| e.local_name().as_ref() == b"f") {
            formula = true;
            let shared = attr(reader, e, b"t").in_part(part)?.as_deref() == Some("shared");
            if shared && attr(reader, e, b"ref").in_part(part)?.is_some() {
                return Err(PackageError::Layout(format!(
                    "cell {} anchors a shared formula used by other cells",
                    addr
                )));
            }
        }
    }
}

fn patch_sheet(
    xml: &str,
    part: &str,
    values: &BTreeMap<CellAddress, f64>,
    styles: &mut HighlightStyles,
) -> PackageResult<(Vec<u8>, PatchReport)> {
    let mut pending: BTreeMap<u32, BTreeMap<u16, f64>> = BTreeMap::new();
    for (addr, value) in values {
        pending.entry(addr.row).or_default().insert(addr.col, *value);
    }

    let mut reader = Reader::from_str(xml);
    let mut out = SheetPatcher {
        writer: Writer::new(Vec::with_capacity(xml.len() + 256)),
        styles,
        prefix: String::new(),
        report: PatchReport::default(),
    };
    let mut row_edits: BTreeMap<u16, f64> = BTreeMap::new();
    let mut row = 0u32;
    let mut next_col = 1u16;

    loop {
        let event = reader.read_event().in_part(part)?;
        match event {
            Event::Eof => break,

            Event::Start(e) if e.local_name().as_ref() == b"sheetData" => {
                out.prefix = qualified(&e, "");
                out.write(Event::Start(e)).in_part(part)?;
            }
            Event::Empty(e) if e.local_name().as_ref() == b"sheetData" => {
                out.prefix = qualified(&e, "");
                let end = e.to_end().into_owned();
                out.write(Event::Start(e)).in_part(part)?;
                out.insert_rows(std::mem::take(&mut pending))?;
                out.write(Event::End(end)).in_part(part)?;
            }
            Event::End(e) if e.local_name().as_ref() == b"sheetData" => {
                out.insert_rows(std::mem::take(&mut pending))?;
                out.write(Event::End(e)).in_part(part)?;
            }

            Event::Start(e) if e.local_name().as_ref() == b"row" => {
                row = numeric_attr(&e, b"r")
                    .in_part(part)?
                    .map(|r| r as u32)
                    .unwrap_or(row + 1);
                next_col = 1;
                out.insert_rows(take_before(&mut pending, row))?;
                row_edits = pending.remove(&row).unwrap_or_default();
                out.write(Event::Start(e)).in_part(part)?;
            }
            Event::Empty(e) if e.local_name().as_ref() == b"row" => {
                row = numeric_attr(&e, b"r")
                    .in_part(part)?
                    .map(|r| r as u32)
                    .unwrap_or(row + 1);
                out.insert_rows(take_before(&mut pending, row))?;
                match pending.remove(&row) {
                    Some(cells) => {
                        let end = e.to_end().into_owned();
                        out.write(Event::Start(e)).in_part(part)?;
                        out.insert_cells(row, cells)?;
                        out.write(Event::End(end)).in_part(part)?;
                    }
                    None => out.write(Event::Empty(e)).in_part(part)?,
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"row" => {
                out.insert_cells(row, std::mem::take(&mut row_edits))?;
                out.write(Event::End(e)).in_part(part)?;
            }

            Event::Start(ref e) | Event::Empty(ref e) if e.local_name().as_ref() == b"c" => {
                let has_body = matches!(event, Event::Start(_));
                let col = match attr(&reader, e, b"r").in_part(part)? {
                    Some(reference) => reference
                        .parse::<CellAddress>()
                        .map_err(|err| PackageError::Layout(err.to_string()))?
                        .col,
                    None => next_col,
                };
                next_col = col.saturating_add(1);
                out.insert_cells(row, take_before(&mut row_edits, col))?;

                match row_edits.remove(&col) {
                    Some(value) => {
                        let addr = CellAddress::new(row, col);
                        let style = numeric_attr(e, b"s").in_part(part)?.unwrap_or(0);
                        if has_body && skip_cell(&mut reader, addr, part)? {
                            out.report.replaced_formulas += 1;
                            debug!("Formula in {} replaced by a value", addr);
                        }
                        out.write_cell(addr, style, value)?;
                        out.report.replaced_cells += 1;
                    }
                    None => out.write(event.clone()).in_part(part)?,
                }
            }

            other => out.write(other).in_part(part)?,
        }
    }

    Ok((out.writer.into_inner(), out.report))
}

/// Asks Excel to recalculate every formula on open, so totals over the
/// written cells are refreshed.
fn request_full_recalc(workbook_xml: &str) -> PackageResult<Vec<u8>> {
    let mut reader = Reader::from_str(workbook_xml);
    let mut writer = Writer::new(Vec::with_capacity(workbook_xml.len() + 32));
    let updates = [("fullCalcOnLoad", "1")];
    let mut found = false;

    loop {
        match reader.read_event().in_part(WORKBOOK_PART)? {
            Event::Eof => break,
            Event::Empty(e) if e.local_name().as_ref() == b"calcPr" => {
                found = true;
                let tag = set_attributes(&e, &updates).in_part(WORKBOOK_PART)?;
                writer.write_event(Event::Empty(tag)).in_part(WORKBOOK_PART)?;
            }
            Event::Start(e) if e.local_name().as_ref() == b"calcPr" => {
                found = true;
                let tag = set_attributes(&e, &updates).in_part(WORKBOOK_PART)?;
                writer.write_event(Event::Start(tag)).in_part(WORKBOOK_PART)?;
            }
            other => writer.write_event(other).in_part(WORKBOOK_PART)?,
        }
    }
    if !found {
        debug!("Workbook has no calculation settings; cached totals are kept as they are");
    }
    Ok(writer.into_inner())
}

/// Copy of `xml` without the empty `element` tags whose `key` attribute
/// satisfies `matches`.
fn drop_elements(
    xml: &str,
    part: &str,
    element: &[u8],
    key: &[u8],
    matches: impl Fn(&str) -> bool,
) -> PackageResult<Vec<u8>> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len()));
    loop {
        match reader.read_event().in_part(part)? {
            Event::Eof => break,
            Event::Empty(e) if e.local_name().as_ref() == element => {
                let value = attr(&reader, &e, key).in_part(part)?;
                if value.as_deref().map(&matches).unwrap_or(false) {
                    debug!("Dropped reference {:?} from {}", value, part);
                    continue;
                }
                writer.write_event(Event::Empty(e)).in_part(part)?;
            }
            other => writer.write_event(other).in_part(part)?,
        }
    }
    Ok(writer.into_inner())
}
