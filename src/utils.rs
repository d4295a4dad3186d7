use chrono::{Datelike, NaiveDate, NaiveDateTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::{Path, PathBuf};

/// Round half up: a fractional part of at least .5 rounds toward +inf,
/// anything below rounds toward -inf. Not banker's rounding.
pub fn round_half_up(value: Decimal) -> i64 {
    (value + dec!(0.5)).floor().to_i64().unwrap_or(if value.is_sign_negative() {
        i64::MIN
    } else {
        i64::MAX
    })
}

/// Same rule for values read off a spreadsheet. Non-finite input yields `None`.
pub fn round_half_up_f64(value: f64) -> Option<i64> {
    if !value.is_finite() {
        return None;
    }
    Some((value + 0.5).floor() as i64)
}

/// "YYYY-MM" key for the month a date falls in.
pub fn month_key(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

/// "Mon-YY" presentation label, e.g. "Oct-24".
pub fn period_label(date: NaiveDate) -> String {
    date.format("%b-%y").to_string()
}

/// First day of the month named by a "YYYY-MM" key.
pub fn month_start(key: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(&format!("{}-01", key.trim()), "%Y-%m-%d").ok()
}

/// Parses a free-text period into a date.
///
/// Accepts ISO dates and datetimes, bare "YYYY-MM", German "DD.MM.YYYY" and
/// "Mon-YY" labels. Slash-separated dates are refused: "01/02/2024" reads as
/// January or February depending on locale.
pub fn parse_period_text(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.is_empty() || text.contains('/') {
        return None;
    }

    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt.date());
        }
    }
    for fmt in ["%Y-%m-%d", "%d.%m.%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(text, fmt) {
            return Some(d);
        }
    }
    if let Some(d) = month_start(text) {
        return Some(d);
    }
    NaiveDate::parse_from_str(&format!("01-{}", text), "%d-%b-%y").ok()
}

/// Makes an operation label usable as a file name fragment.
pub fn sanitize_file_fragment(label: &str) -> String {
    label
        .trim()
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' | ':' => '_',
            other => other,
        })
        .collect()
}

/// "<dir>/<stem>_updated.<ext>" next to the original file.
pub fn updated_path(original: &Path) -> PathBuf {
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "target".to_string());
    let file_name = match original.extension() {
        Some(ext) => format!("{}_updated.{}", stem, ext.to_string_lossy()),
        None => format!("{}_updated", stem),
    };
    original.with_file_name(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_round_half_up() {
        assert_eq!(round_half_up(d("120.4")), 120);
        assert_eq!(round_half_up(d("120.5")), 121);
        assert_eq!(round_half_up(d("121.5")), 122);
        assert_eq!(round_half_up(d("60.6")), 61);
        assert_eq!(round_half_up(d("0")), 0);
        assert_eq!(round_half_up(d("-2.5")), -2);
        assert_eq!(round_half_up(d("-2.6")), -3);
    }

    #[test]
    fn test_round_half_up_f64() {
        assert_eq!(round_half_up_f64(99.5), Some(100));
        assert_eq!(round_half_up_f64(99.49), Some(99));
        assert_eq!(round_half_up_f64(f64::NAN), None);
        assert_eq!(round_half_up_f64(f64::INFINITY), None);
    }

    #[test]
    fn test_month_formatting() {
        let date = NaiveDate::from_ymd_opt(2024, 10, 15).unwrap();
        assert_eq!(month_key(date), "2024-10");
        assert_eq!(period_label(date), "Oct-24");
        assert_eq!(
            month_start("2024-10"),
            NaiveDate::from_ymd_opt(2024, 10, 1)
        );
        assert_eq!(month_start("2024"), None);
    }

    #[test]
    fn test_parse_period_text() {
        let oct15 = NaiveDate::from_ymd_opt(2024, 10, 15);
        assert_eq!(parse_period_text("2024-10-15"), oct15);
        assert_eq!(parse_period_text("2024-10-15 00:00:00"), oct15);
        assert_eq!(parse_period_text("2024-10-15T08:30:00"), oct15);
        assert_eq!(parse_period_text("15.10.2024"), oct15);
        assert_eq!(
            parse_period_text("2024-10"),
            NaiveDate::from_ymd_opt(2024, 10, 1)
        );
        assert_eq!(
            parse_period_text("Oct-24"),
            NaiveDate::from_ymd_opt(2024, 10, 1)
        );
    }

    #[test]
    fn test_parse_period_text_refuses_ambiguous_or_garbage() {
        assert_eq!(parse_period_text("01/02/2024"), None);
        assert_eq!(parse_period_text("next month"), None);
        assert_eq!(parse_period_text(""), None);
        assert_eq!(parse_period_text("2024-13-01"), None);
    }

    #[test]
    fn test_sanitize_file_fragment() {
        assert_eq!(sanitize_file_fragment("Avature Crew"), "Avature_Crew");
        assert_eq!(
            sanitize_file_fragment("Avature ext. Careers Portal Crew"),
            "Avature_ext._Careers_Portal_Crew"
        );
        assert_eq!(sanitize_file_fragment("PM/CM"), "PM_CM");
    }

    #[test]
    fn test_updated_path() {
        assert_eq!(
            updated_path(Path::new("docs/target_sheet.xlsx")),
            PathBuf::from("docs/target_sheet_updated.xlsx")
        );
        assert_eq!(
            updated_path(Path::new("sheet")),
            PathBuf::from("sheet_updated")
        );
    }
}
