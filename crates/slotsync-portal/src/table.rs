//! Results-table extraction.
//!
//! Column order on the portal is not stable, so each row is classified cell by
//! cell from the shape of its content. Header text, or a static layout when
//! there is no header, only breaks ties.

use chrono::NaiveDate;
use scraper::{ElementRef, Html};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use slotsync_core::dates::{looks_like_time, normalize_time, parse_date};

use crate::dom::{attr, collapse, digits, element_text, fold, is_visible, select, select_within, tag, text_matches};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    Time,
    Document,
    Name,
    Phone,
    Email,
    Date,
    ProcessType,
    Category,
    Status,
}

/// Column order assumed when the table has no usable header.
pub const STATIC_LAYOUT: &[ColumnRole] = &[
    ColumnRole::Time,
    ColumnRole::Document,
    ColumnRole::Name,
    ColumnRole::Phone,
    ColumnRole::Email,
    ColumnRole::ProcessType,
    ColumnRole::Category,
];

const HEADER_KEYWORDS: &[(ColumnRole, &[&str])] = &[
    (ColumnRole::Time, &["hora", "horario"]),
    (ColumnRole::Document, &["cpf", "documento"]),
    (ColumnRole::Name, &["nome", "requerente", "titular", "cidadao"]),
    (ColumnRole::Phone, &["telefone", "celular", "fone", "contato"]),
    (ColumnRole::Email, &["email", "mail"]),
    (ColumnRole::Date, &["data", "dia"]),
    (ColumnRole::ProcessType, &["processo", "tipo", "servico"]),
    (ColumnRole::Category, &["categoria", "classe"]),
    (ColumnRole::Status, &["situacao", "status"]),
];

const STATUS_WORDS: &[&str] = &[
    "agendado",
    "confirmado",
    "cancelado",
    "disponivel",
    "livre",
    "reservado",
    "ocupado",
    "atendido",
    "remarcado",
    "pendente",
];

const NO_RESULTS_MARKERS: &[&str] = &[
    "nenhum registro",
    "nenhum agendamento",
    "nenhum resultado",
    "nao ha agendamentos",
    "nao existem agendamentos",
    "nao foram encontrad",
    "sem agendamentos",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedRow {
    pub date: NaiveDate,
    /// `HH:MM:SS`.
    pub time: String,
    /// Exactly eleven digits.
    pub document_number: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub process_type: Option<String>,
    pub category: Option<String>,
    pub status_hint: Option<String>,
    /// Portal-side row identifier, when the markup carries one.
    pub slot_token: Option<String>,
}

impl ScrapedRow {
    /// Raw field map in the portal's own vocabulary, ready for payload normalization.
    pub fn raw_payload(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("nome".into(), Value::String(self.name.clone()));
        map.insert("cpf".into(), Value::String(self.document_number.clone()));
        let optional = [
            ("telefone", &self.phone),
            ("email", &self.email),
            ("processo", &self.process_type),
            ("categoria", &self.category),
            ("situacao", &self.status_hint),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                map.insert(key.into(), Value::String(value.clone()));
            }
        }
        map
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    MissingTime,
    MissingDocument,
    InvalidDocument { digits: usize },
    InvalidName { value: String },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::MissingTime => f.write_str("no time cell"),
            RejectReason::MissingDocument => f.write_str("no document number"),
            RejectReason::InvalidDocument { digits } => {
                write!(f, "document number must have 11 digits, found {digits}")
            }
            RejectReason::InvalidName { value } => {
                write!(f, "name '{value}' needs three letters and no digits")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRow {
    pub row_index: usize,
    pub reason: RejectReason,
    pub cells: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultsOutcome {
    Table,
    NoResults,
    /// The date was not offered by the portal's selection list.
    DateUnavailable,
}

/// Everything extracted for one queried date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayExtraction {
    pub date: NaiveDate,
    pub outcome: ResultsOutcome,
    pub rows: Vec<ScrapedRow>,
    pub rejected: Vec<RejectedRow>,
}

impl DayExtraction {
    pub fn empty(date: NaiveDate, outcome: ResultsOutcome) -> Self {
        Self {
            date,
            outcome,
            rows: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultsProbe {
    Table,
    NoResults,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Shape {
    Empty,
    Time,
    Date,
    Email,
    /// `ddd.ddd.ddd-dd`
    FormattedDocument,
    Phone,
    Digits(usize),
    Status,
    Text,
}

fn is_formatted_document(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() == 14
        && bytes[3] == b'.'
        && bytes[7] == b'.'
        && bytes[11] == b'-'
        && digits(text).len() == 11
}

fn shape(text: &str) -> Shape {
    let text = text.trim();
    if text.is_empty() {
        return Shape::Empty;
    }
    if looks_like_time(text) {
        return Shape::Time;
    }
    if parse_date(text).is_ok() {
        return Shape::Date;
    }
    if text.contains('@') && !text.contains(' ') {
        return Shape::Email;
    }
    let has_letters = text.chars().any(char::is_alphabetic);
    let digit_count = digits(text).len();
    if !has_letters && digit_count > 0 {
        if is_formatted_document(text) {
            return Shape::FormattedDocument;
        }
        if text.contains(['(', ')', ' ', '-']) {
            return Shape::Phone;
        }
        return Shape::Digits(digit_count);
    }
    let folded = fold(text);
    if STATUS_WORDS.contains(&folded.as_str()) {
        return Shape::Status;
    }
    Shape::Text
}

fn header_role(text: &str) -> Option<ColumnRole> {
    HEADER_KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| text_matches(text, w)))
        .map(|(role, _)| *role)
}

/// Field assignment for one row, by cell index.
#[derive(Debug, Default)]
struct RowAssignment {
    time: Option<usize>,
    document: Option<usize>,
    name: Option<usize>,
    phone: Option<usize>,
    email: Option<usize>,
    status: Option<usize>,
    process_type: Option<usize>,
    category: Option<usize>,
}

/// `from_header` marks a layout read from the table's own header row; its
/// Document column is then authoritative.
fn classify_row(cells: &[String], layout: &[Option<ColumnRole>], from_header: bool) -> RowAssignment {
    let shapes: Vec<Shape> = cells.iter().map(|c| shape(c)).collect();
    let mut claimed = vec![false; cells.len()];
    let position_of = |role: ColumnRole| layout.iter().position(|r| *r == Some(role));
    let mut out = RowAssignment::default();

    let claim = |idx: Option<usize>, claimed: &mut Vec<bool>| {
        if let Some(i) = idx {
            claimed[i] = true;
        }
        idx
    };

    let time = shapes.iter().position(|s| *s == Shape::Time).or_else(|| {
        position_of(ColumnRole::Time)
            .filter(|i| cells.get(*i).and_then(|c| normalize_time(c)).is_some())
    });
    out.time = claim(time, &mut claimed);

    let email = shapes.iter().position(|s| *s == Shape::Email);
    out.email = claim(email, &mut claimed);

    let date = shapes.iter().position(|s| *s == Shape::Date);
    claim(date, &mut claimed);

    let status = shapes
        .iter()
        .enumerate()
        .position(|(i, s)| *s == Shape::Status && !claimed[i])
        .or_else(|| {
            position_of(ColumnRole::Status)
                .filter(|i| !claimed.get(*i).copied().unwrap_or(true) && shapes[*i] != Shape::Empty)
        });
    out.status = claim(status, &mut claimed);

    let doc_candidates: Vec<usize> = shapes
        .iter()
        .enumerate()
        .filter(|(i, s)| {
            !claimed[*i] && matches!(s, Shape::FormattedDocument | Shape::Digits(11))
        })
        .map(|(i, _)| i)
        .collect();
    let header_document = position_of(ColumnRole::Document).filter(|_| from_header);
    let document = match (header_document, doc_candidates.as_slice()) {
        (Some(p), candidates) => candidates.contains(&p).then_some(p),
        (None, []) => None,
        (None, [only]) => Some(*only),
        (None, many) => many
            .iter()
            .copied()
            .find(|i| shapes[*i] == Shape::FormattedDocument)
            .or_else(|| position_of(ColumnRole::Document).filter(|p| many.contains(p)))
            .or(Some(many[0])),
    };
    out.document = claim(document, &mut claimed);

    let phone_candidates: Vec<usize> = shapes
        .iter()
        .enumerate()
        .filter(|(i, s)| {
            !claimed[*i] && matches!(s, Shape::Phone | Shape::Digits(8..=13))
        })
        .map(|(i, _)| i)
        .collect();
    let phone = position_of(ColumnRole::Phone)
        .filter(|p| phone_candidates.contains(p))
        .or_else(|| phone_candidates.first().copied());
    out.phone = claim(phone, &mut claimed);

    let texts: Vec<usize> = shapes
        .iter()
        .enumerate()
        .filter(|(i, s)| !claimed[*i] && **s == Shape::Text)
        .map(|(i, _)| i)
        .collect();
    let name = match texts.as_slice() {
        [] => None,
        [only] => Some(*only),
        many => position_of(ColumnRole::Name)
            .filter(|p| many.contains(p))
            .or_else(|| {
                many.iter()
                    .copied()
                    .max_by_key(|i| (cells[*i].chars().filter(|c| c.is_alphabetic()).count(), usize::MAX - *i))
            }),
    };
    out.name = claim(name, &mut claimed);

    let mut rest: Vec<usize> = texts.into_iter().filter(|i| !claimed[*i]).collect();
    for role in [ColumnRole::ProcessType, ColumnRole::Category] {
        let Some(p) = position_of(role).filter(|p| rest.contains(p)) else {
            continue;
        };
        rest.retain(|i| *i != p);
        match role {
            ColumnRole::ProcessType => out.process_type = Some(p),
            _ => out.category = Some(p),
        }
    }
    let mut rest = rest.into_iter();
    if out.process_type.is_none() {
        out.process_type = rest.next();
    }
    if out.category.is_none() {
        out.category = rest.next();
    }
    out
}

fn valid_name(name: &str) -> bool {
    name.chars().filter(|c| c.is_alphabetic()).count() >= 3 && !name.chars().any(|c| c.is_ascii_digit())
}

fn closest_table<'a>(el: ElementRef<'a>) -> Option<ElementRef<'a>> {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|a| tag(*a) == "table")
}

fn own_rows<'a>(table: ElementRef<'a>) -> Vec<ElementRef<'a>> {
    select_within(table, "tr")
        .into_iter()
        .filter(|tr| closest_table(*tr).is_some_and(|t| t.id() == table.id()))
        .collect()
}

fn row_cells(tr: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    tr.children()
        .filter_map(ElementRef::wrap)
        .filter(|c| matches!(tag(*c), "td" | "th"))
        .collect()
}

fn cell_texts(tr: ElementRef<'_>) -> Vec<String> {
    row_cells(tr).into_iter().map(element_text).collect()
}

/// Index of the header row and the role each header cell names.
fn header_layout(rows: &[ElementRef<'_>]) -> Option<(usize, Vec<Option<ColumnRole>>)> {
    for (idx, tr) in rows.iter().enumerate() {
        let cells = row_cells(*tr);
        if cells.is_empty() {
            continue;
        }
        let texts: Vec<String> = cells.iter().map(|c| element_text(*c)).collect();
        let roles: Vec<Option<ColumnRole>> = texts.iter().map(|t| header_role(t)).collect();
        let named = roles.iter().filter(|r| r.is_some()).count();
        let all_th = cells.iter().all(|c| tag(*c) == "th");
        let looks_like_data = texts.iter().any(|t| shape(t) == Shape::Time);
        if (all_th && named >= 1) || (named >= 2 && !looks_like_data) {
            return Some((idx, roles));
        }
        // Only the leading rows may be headers.
        if idx >= 1 {
            break;
        }
    }
    None
}

fn time_rows(rows: &[ElementRef<'_>]) -> usize {
    rows.iter()
        .filter(|tr| cell_texts(**tr).iter().any(|t| shape(t) == Shape::Time))
        .count()
}

/// The table most likely to hold appointment rows.
pub fn find_results_table(doc: &Html) -> Option<ElementRef<'_>> {
    select(doc, "table")
        .into_iter()
        .filter(|t| is_visible(*t))
        .filter_map(|table| {
            let rows = own_rows(table);
            let header_hits = header_layout(&rows)
                .map(|(_, roles)| {
                    roles
                        .iter()
                        .filter(|r| matches!(r, Some(ColumnRole::Time | ColumnRole::Document | ColumnRole::Name)))
                        .count()
                })
                .unwrap_or(0);
            let data = time_rows(&rows);
            (header_hits >= 2 || data > 0).then_some((table, data, header_hits))
        })
        .max_by_key(|(_, data, header_hits)| (*data, *header_hits))
        .map(|(table, _, _)| table)
}

fn has_no_results_marker(doc: &Html) -> bool {
    select(doc, "td, span, div, p, li, label, strong, b, h3, h4")
        .into_iter()
        .filter(|el| is_visible(*el))
        .map(element_text)
        .filter(|text| text.len() <= 200)
        .any(|text| {
            let folded = fold(&text);
            NO_RESULTS_MARKERS.iter().any(|m| folded.contains(m))
        })
}

/// Poll-time classification of a results frame.
pub fn probe_results(html: &str) -> ResultsProbe {
    let doc = Html::parse_document(html);
    if has_no_results_marker(&doc) {
        ResultsProbe::NoResults
    } else if find_results_table(&doc).is_some() {
        ResultsProbe::Table
    } else {
        ResultsProbe::Pending
    }
}

const TOKEN_ATTRS: &[&str] = &["data-slot-id", "data-id", "data-key", "data-ri", "data-rk"];

fn row_token(tr: ElementRef<'_>) -> Option<String> {
    TOKEN_ATTRS
        .iter()
        .find_map(|a| attr(tr, a))
        .map(str::to_string)
        .or_else(|| {
            select_within(tr, "input[type=hidden]")
                .into_iter()
                .find_map(|input| attr(input, "value").map(str::to_string))
        })
}

fn text_at(cells: &[String], idx: Option<usize>) -> Option<String> {
    idx.and_then(|i| cells.get(i))
        .map(|c| collapse(c))
        .filter(|c| !c.is_empty())
}

fn build_row(
    date: NaiveDate,
    cells: &[String],
    layout: &[Option<ColumnRole>],
    from_header: bool,
    slot_token: Option<String>,
) -> Result<ScrapedRow, RejectReason> {
    let assignment = classify_row(cells, layout, from_header);

    let time = assignment
        .time
        .and_then(|i| normalize_time(&cells[i]))
        .ok_or(RejectReason::MissingTime)?;

    let document_number = match assignment.document {
        Some(i) => digits(&cells[i]),
        None => {
            let seen = layout
                .iter()
                .position(|r| *r == Some(ColumnRole::Document))
                .and_then(|i| cells.get(i))
                .map(|c| digits(c).len())
                .unwrap_or(0);
            return Err(if seen == 0 {
                RejectReason::MissingDocument
            } else {
                RejectReason::InvalidDocument { digits: seen }
            });
        }
    };

    let name = text_at(cells, assignment.name).unwrap_or_default();
    if !valid_name(&name) {
        return Err(RejectReason::InvalidName { value: name });
    }

    Ok(ScrapedRow {
        date,
        time,
        document_number,
        name,
        phone: text_at(cells, assignment.phone),
        email: text_at(cells, assignment.email).map(|e| e.to_lowercase()),
        process_type: text_at(cells, assignment.process_type),
        category: text_at(cells, assignment.category),
        status_hint: text_at(cells, assignment.status),
        slot_token,
    })
}

/// Extract every appointment row for `date` from a results document.
pub fn parse_results(html: &str, date: NaiveDate) -> DayExtraction {
    let doc = Html::parse_document(html);
    if has_no_results_marker(&doc) {
        return DayExtraction::empty(date, ResultsOutcome::NoResults);
    }
    let Some(table) = find_results_table(&doc) else {
        return DayExtraction::empty(date, ResultsOutcome::NoResults);
    };

    let rows = own_rows(table);
    let (header_idx, layout) = match header_layout(&rows) {
        Some((idx, roles)) => (Some(idx), roles),
        None => (None, STATIC_LAYOUT.iter().copied().map(Some).collect()),
    };

    let mut extraction = DayExtraction::empty(date, ResultsOutcome::Table);
    for (row_index, tr) in rows.iter().enumerate() {
        if Some(row_index) == header_idx {
            continue;
        }
        let cells = cell_texts(*tr);
        let filled = cells.iter().filter(|c| !c.trim().is_empty()).count();
        if filled < 2 {
            continue;
        }
        match build_row(date, &cells, &layout, header_idx.is_some(), row_token(*tr)) {
            Ok(row) => extraction.rows.push(row),
            Err(reason) => extraction.rejected.push(RejectedRow {
                row_index,
                reason,
                cells,
            }),
        }
    }
    extraction
}
