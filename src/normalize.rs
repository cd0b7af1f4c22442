use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use chrono::NaiveDate;

use crate::models::NormalizedRecord;

/// Ranked aliases for the account-identifier column in wide sources.
const ID_ALIASES: [&str; 12] = [
    "CUENTA",
    "NIS",
    "SUMINISTRO",
    "CODIGO SUMINISTRO",
    "CODIGO_SUMINISTRO",
    "ID",
    "CLIENTE",
    "NUMERO CUENTA",
    "NUMERO_CUENTA",
    "NIS_RAD",
    "NISRAD",
    "MEDIDOR",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attribute {
    Latitud,
    Longitud,
    TipoUsuario,
    Estrato,
    TipoPoblacion,
    Fpas,
    Trafo,
}

impl Attribute {
    const ALL: [Attribute; 7] = [
        Attribute::Latitud,
        Attribute::Longitud,
        Attribute::TipoUsuario,
        Attribute::Estrato,
        Attribute::TipoPoblacion,
        Attribute::Fpas,
        Attribute::Trafo,
    ];

    fn aliases(self) -> &'static [&'static str] {
        match self {
            Attribute::Latitud => &["LATITUD", "LAT", "LATITUDE"],
            Attribute::Longitud => &["LONGITUD", "LON", "LONG", "LONGITUDE"],
            Attribute::TipoUsuario => &[
                "TIPO USUARIO",
                "TIPO_USUARIO",
                "TIPO DE USUARIO",
                "SEGMENTO",
                "TIPOUSUARIO",
            ],
            Attribute::Estrato => &["ESTRATO", "EST"],
            Attribute::TipoPoblacion => &["TIPO POBLACION", "TIPO_POBLACION", "TIPO DE POBLACION"],
            Attribute::Fpas => &["FPAS"],
            Attribute::Trafo => &[
                "TRAFO",
                "TRANSFORMADOR",
                "ID_TRAFO",
                "COD_TRAFO",
                "CODIGO TRAFO",
                "CODIGO_TRAFO",
            ],
        }
    }

    /// Header name a long-format source uses for this attribute.
    fn canonical(self) -> &'static str {
        match self {
            Attribute::Latitud => "LATITUD",
            Attribute::Longitud => "LONGITUD",
            Attribute::TipoUsuario => "TIPO_USUARIO",
            Attribute::Estrato => "ESTRATO",
            Attribute::TipoPoblacion => "TIPO_POBLACION",
            Attribute::Fpas => "FPAS",
            Attribute::Trafo => "TRAFO",
        }
    }
}

/// A raw tabular source: normalized headers plus string cells.
#[derive(Debug, Clone)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let headers = headers.iter().map(|h| h.trim().to_uppercase()).collect();
        RawTable { headers, rows }
    }
}

fn cell(row: &[String], col: usize) -> &str {
    row.get(col).map_or("", String::as_str)
}

/// Reads a delimited or spreadsheet source into string cells.
pub fn read_table(path: &Path) -> Result<RawTable> {
    let extension = path
        .extension()
        .and_then(OsStr::to_str)
        .map(str::to_lowercase);
    match extension.as_deref() {
        Some("xls" | "xlsx" | "xlsm" | "xlsb" | "ods") => read_spreadsheet(path),
        _ => read_delimited(path),
    }
}

fn read_delimited(path: &Path) -> Result<RawTable> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let text = decode_text(&bytes);
    let header_line = text.lines().next().unwrap_or("");
    let delimiter = sniff_delimiter(header_line);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut headers: Vec<String> = Vec::new();
    let mut rows: Vec<Vec<String>> = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record =
            record.with_context(|| format!("parse row {} of {}", index + 1, path.display()))?;
        let cells: Vec<String> = record.iter().map(str::to_string).collect();
        if index == 0 {
            headers = cells;
        } else {
            rows.push(cells);
        }
    }
    if headers.is_empty() {
        bail!("{} is empty", path.display());
    }
    Ok(RawTable::new(headers, rows))
}

fn read_spreadsheet(path: &Path) -> Result<RawTable> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("open spreadsheet {}", path.display()))?;
    let range = workbook
        .worksheet_range_at(0)
        .with_context(|| format!("{} has no worksheets", path.display()))?
        .with_context(|| format!("read first worksheet of {}", path.display()))?;

    let mut iter = range.rows();
    let headers: Vec<String> = match iter.next() {
        Some(row) => row.iter().map(cell_to_string).collect(),
        None => bail!("{} is empty", path.display()),
    };
    let rows: Vec<Vec<String>> = iter
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect();
    Ok(RawTable::new(headers, rows))
}

fn cell_to_string(data: &Data) -> String {
    match data {
        Data::Empty | Data::Error(_) => String::new(),
        Data::String(s) => s.clone(),
        Data::Bool(b) => b.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => f.to_string(),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
    }
}

fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            // Field exports from legacy systems arrive in Latin-1.
            let (text, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            text.into_owned()
        }
    }
}

fn sniff_delimiter(header_line: &str) -> u8 {
    const CANDIDATES: [u8; 4] = [b';', b',', b'\t', b'|'];
    let mut best = b',';
    let mut best_count = 0;
    for candidate in CANDIDATES {
        let count = header_line.bytes().filter(|&b| b == candidate).count();
        if count > best_count {
            best = candidate;
            best_count = count;
        }
    }
    best
}

/// Turns a raw table into normalized records: direct long layout when
/// the canonical columns are present, otherwise a wide-to-long melt.
pub fn normalize(table: &RawTable) -> Result<Vec<NormalizedRecord>> {
    let column = |name: &str| table.headers.iter().position(|h| h == name);
    match (column("CUENTA"), column("PERIODO"), column("KWH")) {
        (Some(cuenta), Some(periodo), Some(kwh)) => Ok(collect_long(table, cuenta, periodo, kwh)),
        _ => melt_wide(table),
    }
}

fn collect_long(
    table: &RawTable,
    cuenta_col: usize,
    periodo_col: usize,
    kwh_col: usize,
) -> Vec<NormalizedRecord> {
    let attribute_cols: Vec<(Attribute, usize)> = Attribute::ALL
        .iter()
        .filter_map(|&attribute| {
            table
                .headers
                .iter()
                .position(|h| h == attribute.canonical())
                .map(|col| (attribute, col))
        })
        .collect();

    let mut records = Vec::new();
    for row in &table.rows {
        let cuenta = cell(row, cuenta_col).trim();
        if cuenta.is_empty() {
            continue;
        }
        let Some(periodo) = parse_period(cell(row, periodo_col)) else {
            continue;
        };
        let Some(kwh) = parse_number(cell(row, kwh_col)) else {
            continue;
        };
        let mut record = NormalizedRecord {
            cuenta: cuenta.to_string(),
            periodo,
            kwh,
            ..NormalizedRecord::default()
        };
        for &(attribute, col) in &attribute_cols {
            fill_attribute(&mut record, attribute, cell(row, col));
        }
        records.push(record);
    }
    records
}

fn melt_wide(table: &RawTable) -> Result<Vec<NormalizedRecord>> {
    let id_col = detect_id_column(&table.headers);
    let attribute_cols = detect_attribute_columns(&table.headers);

    let period_cols: Vec<(usize, NaiveDate)> = table
        .headers
        .iter()
        .enumerate()
        .filter(|(index, _)| {
            *index != id_col && !attribute_cols.iter().any(|&(_, col)| col == *index)
        })
        .filter_map(|(index, header)| parse_period(header).map(|periodo| (index, periodo)))
        .collect();

    if period_cols.is_empty() {
        bail!("source has no CUENTA/PERIODO/KWH columns and no parseable period headers");
    }

    let mut groups: BTreeMap<(String, NaiveDate), NormalizedRecord> = BTreeMap::new();
    for row in &table.rows {
        let cuenta = cell(row, id_col).trim();
        if cuenta.is_empty() {
            continue;
        }
        for &(period_col, periodo) in &period_cols {
            let Some(kwh) = parse_number(cell(row, period_col)) else {
                continue;
            };
            let record = groups
                .entry((cuenta.to_string(), periodo))
                .or_insert_with(|| NormalizedRecord {
                    cuenta: cuenta.to_string(),
                    periodo,
                    ..NormalizedRecord::default()
                });
            record.kwh += kwh;
            for &(attribute, col) in &attribute_cols {
                fill_attribute(record, attribute, cell(row, col));
            }
        }
    }
    Ok(groups.into_values().collect())
}

fn detect_id_column(headers: &[String]) -> usize {
    ID_ALIASES
        .iter()
        .find_map(|alias| headers.iter().position(|h| h == alias))
        .unwrap_or(0)
}

fn detect_attribute_columns(headers: &[String]) -> Vec<(Attribute, usize)> {
    Attribute::ALL
        .iter()
        .filter_map(|&attribute| {
            attribute
                .aliases()
                .iter()
                .find_map(|alias| headers.iter().position(|h| h == alias))
                .map(|col| (attribute, col))
        })
        .collect()
}

fn fill_attribute(record: &mut NormalizedRecord, attribute: Attribute, raw: &str) {
    match attribute {
        Attribute::Latitud => {
            if record.latitud.is_none() {
                record.latitud = parse_number(raw);
            }
        }
        Attribute::Longitud => {
            if record.longitud.is_none() {
                record.longitud = parse_number(raw);
            }
        }
        Attribute::TipoUsuario => fill_text(&mut record.tipo_usuario, raw),
        Attribute::Estrato => fill_text(&mut record.estrato, raw),
        Attribute::TipoPoblacion => fill_text(&mut record.tipo_poblacion, raw),
        Attribute::Fpas => fill_text(&mut record.fpas, raw),
        Attribute::Trafo => fill_text(&mut record.trafo, raw),
    }
}

fn fill_text(slot: &mut Option<String>, raw: &str) {
    if slot.is_none() {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            *slot = Some(trimmed.to_string());
        }
    }
}

/// Period matchers tried in priority order; the first hit wins.
const PERIOD_STRATEGIES: &[fn(&str) -> Option<NaiveDate>] =
    &[parse_separated, parse_compact, parse_embedded];

/// Parses a header or cell naming a calendar month, normalized to the
/// first day of that month.
pub fn parse_period(raw: &str) -> Option<NaiveDate> {
    let token = clean_token(raw);
    if token.is_empty() {
        return None;
    }
    PERIOD_STRATEGIES
        .iter()
        .find_map(|strategy| strategy(&token))
}

fn clean_token(raw: &str) -> String {
    let upper = raw.trim().to_uppercase();
    let stripped = upper.trim_start_matches(['-', '#', ' ']);
    let mut cleaned = String::with_capacity(stripped.len());
    let mut in_gap = false;
    for ch in stripped.chars() {
        if ch.is_whitespace() {
            if !in_gap {
                cleaned.push('-');
                in_gap = true;
            }
            continue;
        }
        in_gap = false;
        cleaned.push(match ch {
            '\\' => '/',
            '_' | '.' => '-',
            other => other,
        });
    }
    cleaned
}

fn all_digits(part: &str) -> bool {
    !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())
}

fn month_start(year_part: &str, month_part: &str) -> Option<NaiveDate> {
    let year: i32 = year_part.parse().ok()?;
    let month: u32 = month_part.parse().ok()?;
    if (1..=12).contains(&month) {
        NaiveDate::from_ymd_opt(year, month, 1)
    } else {
        None
    }
}

/// `YYYY-MM` or `YYYY-MM-DD` with `-` or `/` separators; the day part
/// is pattern-checked but otherwise ignored.
fn parse_separated(token: &str) -> Option<NaiveDate> {
    let parts: Vec<&str> = token.split(['-', '/']).collect();
    let (year, month, day) = match parts.as_slice() {
        [year, month] => (*year, *month, None),
        [year, month, day] => (*year, *month, Some(*day)),
        _ => return None,
    };
    if year.len() != 4 || !all_digits(year) {
        return None;
    }
    if month.is_empty() || month.len() > 2 || !all_digits(month) {
        return None;
    }
    if let Some(day) = day {
        if day.is_empty() || day.len() > 2 || !all_digits(day) {
            return None;
        }
    }
    month_start(year, month)
}

/// Compact `YYYYMM` or `YYYYMMDD`.
fn parse_compact(token: &str) -> Option<NaiveDate> {
    if !all_digits(token) || !(token.len() == 6 || token.len() == 8) {
        return None;
    }
    month_start(&token[..4], &token[4..6])
}

/// Last resort: the first run of six consecutive digits anywhere in
/// the token, read as `YYYYMM`.
fn parse_embedded(token: &str) -> Option<NaiveDate> {
    let bytes = token.as_bytes();
    for start in 0..bytes.len().saturating_sub(5) {
        let window = &bytes[start..start + 6];
        if window.iter().all(u8::is_ascii_digit) {
            return month_start(&token[start..start + 4], &token[start + 4..start + 6]);
        }
    }
    None
}

/// Parses a quantity that may use either `.` or `,` as the decimal
/// separator, with optional thousands grouping in the other.
pub fn parse_number(raw: &str) -> Option<f64> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }
    let candidate = if compact.contains(',') && compact.contains('.') {
        if compact.rfind(',') > compact.rfind('.') {
            compact.replace('.', "").replace(',', ".")
        } else {
            compact.replace(',', "")
        }
    } else {
        compact.replace(',', ".")
    };
    candidate.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Reads a truthy/falsy label cell. Empty cells are missing; anything
/// unrecognized falls back to a numeric reading, then to the bare `x`
/// mark some field sheets use.
pub fn parse_flag(raw: &str) -> Option<bool> {
    let token = raw.trim().to_lowercase();
    if token.is_empty() {
        return None;
    }
    match token.as_str() {
        "1" | "true" | "t" | "si" | "sí" | "y" | "yes" => Some(true),
        "0" | "false" | "f" | "no" | "n" => Some(false),
        _ => match token.parse::<f64>() {
            Ok(value) if value.is_finite() => Some(value.trunc() != 0.0),
            _ => Some(token == "x"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(year: i32, month: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, 1).unwrap()
    }

    fn table(headers: &[&str], rows: &[&[&str]]) -> RawTable {
        RawTable::new(
            headers.iter().map(|h| h.to_string()).collect(),
            rows.iter()
                .map(|row| row.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
    }

    #[test]
    fn period_parses_separated_forms() {
        assert_eq!(parse_period("2024-5"), Some(date(2024, 5)));
        assert_eq!(parse_period("2024/05"), Some(date(2024, 5)));
        assert_eq!(parse_period("2024-05-17"), Some(date(2024, 5)));
        assert_eq!(parse_period("2023.07"), Some(date(2023, 7)));
        assert_eq!(parse_period("2023_11"), Some(date(2023, 11)));
        assert_eq!(parse_period("2024 03"), Some(date(2024, 3)));
        assert_eq!(parse_period("# 2023-04"), Some(date(2023, 4)));
    }

    #[test]
    fn period_parses_compact_forms() {
        assert_eq!(parse_period("202405"), Some(date(2024, 5)));
        assert_eq!(parse_period("20240517"), Some(date(2024, 5)));
        assert_eq!(parse_period("202413"), None);
    }

    #[test]
    fn period_falls_back_to_embedded_digits() {
        assert_eq!(parse_period("CONSUMO-202401"), Some(date(2024, 1)));
        assert_eq!(parse_period("KWH202312TOTAL"), Some(date(2023, 12)));
        // Only the first digit window is considered.
        assert_eq!(parse_embedded("9202401"), None);
    }

    #[test]
    fn period_rejects_non_dates() {
        assert_eq!(parse_period("CUENTA"), None);
        assert_eq!(parse_period("2024-13"), None);
        assert_eq!(parse_period("2024--01"), None);
        assert_eq!(parse_period("17/05/2024"), None);
        assert_eq!(parse_period(""), None);
    }

    #[test]
    fn number_handles_both_locales() {
        assert_eq!(parse_number("1234"), Some(1234.0));
        assert_eq!(parse_number("12,5"), Some(12.5));
        assert_eq!(parse_number("1.234,56"), Some(1234.56));
        assert_eq!(parse_number("1,234.56"), Some(1234.56));
        assert_eq!(parse_number(" 1 234,5 "), Some(1234.5));
        assert_eq!(parse_number("abc"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn flag_recognizes_spanish_and_english_marks() {
        assert_eq!(parse_flag("SI"), Some(true));
        assert_eq!(parse_flag("sí"), Some(true));
        assert_eq!(parse_flag("yes"), Some(true));
        assert_eq!(parse_flag("NO"), Some(false));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("2.7"), Some(true));
        assert_eq!(parse_flag("0.4"), Some(false));
        assert_eq!(parse_flag("x"), Some(true));
        assert_eq!(parse_flag("maybe"), Some(false));
        assert_eq!(parse_flag("  "), None);
    }

    #[test]
    fn long_layout_passes_through_with_parsing() {
        let source = table(
            &["cuenta", "periodo", "kwh", "LATITUD", "ESTRATO"],
            &[
                &["A-1", "2024-01", "120,5", "4,61", "3"],
                &["A-1", "2024-02", "130", "", ""],
                &["", "2024-03", "99", "", ""],
                &["A-2", "not-a-date", "50", "", ""],
                &["A-2", "2024-01", "n/a", "", ""],
            ],
        );
        let records = normalize(&source).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].cuenta, "A-1");
        assert_eq!(records[0].periodo, date(2024, 1));
        assert!((records[0].kwh - 120.5).abs() < 1e-9);
        assert_eq!(records[0].latitud, Some(4.61));
        assert_eq!(records[0].estrato.as_deref(), Some("3"));
        assert_eq!(records[1].latitud, None);
    }

    #[test]
    fn wide_layout_melts_by_period_header() {
        let source = table(
            &["NIS", "TIPO USUARIO", "202401", "202402"],
            &[
                &["777", "residencial", "100", "110"],
                &["888", "comercial", "1.200,5", ""],
            ],
        );
        let records = normalize(&source).unwrap();
        assert_eq!(records.len(), 3);
        let first = records
            .iter()
            .find(|r| r.cuenta == "777" && r.periodo == date(2024, 1))
            .unwrap();
        assert!((first.kwh - 100.0).abs() < 1e-9);
        assert_eq!(first.tipo_usuario.as_deref(), Some("residencial"));
        let second = records.iter().find(|r| r.cuenta == "888").unwrap();
        assert!((second.kwh - 1200.5).abs() < 1e-9);
    }

    #[test]
    fn wide_layout_sums_duplicate_accounts_and_keeps_first_attribute() {
        let source = table(
            &["CUENTA_X", "ID", "EST", "2024-01"],
            &[
                &["ignored", "A-9", "", "40"],
                &["ignored", "A-9", "5", "60"],
            ],
        );
        let records = normalize(&source).unwrap();
        assert_eq!(records.len(), 1);
        assert!((records[0].kwh - 100.0).abs() < 1e-9);
        assert_eq!(records[0].estrato.as_deref(), Some("5"));
    }

    #[test]
    fn long_and_wide_sources_normalize_alike() {
        let wide = table(
            &["CUENTA", "2023-01", "2023-02", "2023-03"],
            &[&["A-1", "100", "110", "120"], &["A-2", "55,5", "60", "65"]],
        );
        let long = table(
            &["CUENTA", "PERIODO", "KWH"],
            &[
                &["A-1", "202301", "100"],
                &["A-1", "202302", "110"],
                &["A-1", "202303", "120"],
                &["A-2", "2023-01", "55.5"],
                &["A-2", "2023-02", "60"],
                &["A-2", "2023-03", "65"],
            ],
        );
        let mut from_wide: Vec<(String, NaiveDate, f64)> = normalize(&wide)
            .unwrap()
            .into_iter()
            .map(|r| (r.cuenta, r.periodo, r.kwh))
            .collect();
        let mut from_long: Vec<(String, NaiveDate, f64)> = normalize(&long)
            .unwrap()
            .into_iter()
            .map(|r| (r.cuenta, r.periodo, r.kwh))
            .collect();
        from_wide.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
        from_long.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
        assert_eq!(from_wide.len(), from_long.len());
        for (w, l) in from_wide.iter().zip(from_long.iter()) {
            assert_eq!(w.0, l.0);
            assert_eq!(w.1, l.1);
            assert!((w.2 - l.2).abs() < 1e-9);
        }
    }

    #[test]
    fn id_column_falls_back_to_first_when_no_alias_matches() {
        let source = table(
            &["ABONADO", "202401"],
            &[&["A-1", "100"], &["  ", "200"]],
        );
        let records = normalize(&source).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].cuenta, "A-1");
    }

    #[test]
    fn source_without_period_mapping_is_an_error() {
        let source = table(&["CUENTA", "SALDO"], &[&["A-1", "100"]]);
        assert!(normalize(&source).is_err());
    }

    #[test]
    fn delimiter_sniffing_prefers_the_most_frequent_candidate() {
        assert_eq!(sniff_delimiter("cuenta;periodo;kwh"), b';');
        assert_eq!(sniff_delimiter("cuenta,periodo,kwh"), b',');
        assert_eq!(sniff_delimiter("cuenta\tperiodo\tkwh"), b'\t');
        assert_eq!(sniff_delimiter("cuenta|periodo|kwh"), b'|');
        assert_eq!(sniff_delimiter("cuenta"), b',');
    }

    #[test]
    fn headers_are_trimmed_and_uppercased() {
        let source = table(&[" Cuenta ", "Periodo", "kWh"], &[]);
        assert_eq!(source.headers, vec!["CUENTA", "PERIODO", "KWH"]);
    }
}
