//! Deterministic slot identity and payload hashing.
//!
//! Re-observing the same physical slot must always produce the same
//! `external_uid`, and cosmetic payload differences must never change the
//! content hash.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::dates::{fold_accents, format_iso, normalize_time, parse_date};
use crate::SlotStatus;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_code(value: &str) -> String {
    collapse_whitespace(value).to_uppercase()
}

fn normalize_date_text(value: &str) -> String {
    parse_date(value)
        .map(format_iso)
        .unwrap_or_else(|_| value.trim().to_string())
}

/// Hash over `unit|service|date|HH:MM:SS|token` with every part normalized first.
pub fn make_external_uid(
    unit: &str,
    service: &str,
    date: &str,
    time: &str,
    slot_token: Option<&str>,
) -> String {
    let time = normalize_time(time).unwrap_or_else(|| time.trim().to_string());
    let token = slot_token.map(collapse_whitespace).unwrap_or_default();
    let canonical = [
        normalize_code(unit),
        normalize_code(service),
        normalize_date_text(date),
        time,
        token,
    ]
    .join("|");
    sha256_hex(canonical.as_bytes())
}

fn canonicalize(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(Value::String(collapse_whitespace(s))),
        Value::Array(items) => Some(Value::Array(items.iter().filter_map(canonicalize).collect())),
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> = map
                .iter()
                .filter_map(|(k, v)| canonicalize(v).map(|v| (k, v)))
                .collect();
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), v);
            }
            Some(Value::Object(out))
        }
        other => Some(other.clone()),
    }
}

/// Hash over a key-sorted, null-stripped, whitespace-collapsed JSON projection.
pub fn hash_payload(payload: &Value) -> String {
    let canonical = canonicalize(payload).unwrap_or(Value::Null);
    sha256_hex(canonical.to_string().as_bytes())
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPayload {
    pub payload: Value,
    pub status: SlotStatus,
}

const FIELD_ALIASES: &[(&str, &[&str])] = &[
    (
        "holder_name",
        &["holdername", "name", "nome", "nomecompleto", "titular", "requerente"],
    ),
    (
        "document_number",
        &["documentnumber", "document", "cpf", "documento", "doc", "nrdocumento"],
    ),
    ("phone", &["phone", "telefone", "celular", "fone", "tel"]),
    ("email", &["email", "mail", "correioeletronico"]),
    (
        "process_type",
        &["processtype", "process", "processo", "tipoprocesso", "tipo", "servico"],
    ),
    ("category", &["category", "categoria", "classe"]),
];

const STATUS_KEYS: &[&str] = &["status", "situacao", "estado"];

fn fold_key(key: &str) -> String {
    fold_accents(key)
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

fn canonical_field(key: &str) -> Option<&'static str> {
    let folded = fold_key(key);
    FIELD_ALIASES
        .iter()
        .find(|(_, aliases)| aliases.contains(&folded.as_str()))
        .map(|(canonical, _)| *canonical)
}

fn digits_only(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn status_from_marker(value: &str) -> SlotStatus {
    let folded = fold_accents(value.trim()).to_ascii_lowercase();
    match folded.as_str() {
        "booked" | "agendado" | "confirmado" | "ocupado" | "reservado" | "marcado" => {
            SlotStatus::Booked
        }
        "removed" | "cancelado" | "excluido" => SlotStatus::Removed,
        _ => SlotStatus::Available,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Map heterogeneous raw field names onto the canonical payload shape.
///
/// Unknown keys are kept under `extra`. Status defaults to `available` unless a
/// raw status marker says otherwise.
pub fn normalize_slot_payload(raw: &Map<String, Value>) -> NormalizedPayload {
    let mut fields: BTreeMap<&'static str, Value> = BTreeMap::new();
    let mut extra: BTreeMap<String, Value> = BTreeMap::new();
    let mut status = SlotStatus::Available;

    for (key, value) in raw {
        if value.is_null() {
            continue;
        }
        if STATUS_KEYS.contains(&fold_key(key).as_str()) {
            if let Some(text) = scalar_text(value) {
                status = status_from_marker(&text);
            }
            continue;
        }
        let Some(canonical) = canonical_field(key) else {
            extra.insert(key.clone(), value.clone());
            continue;
        };
        let normalized = match (canonical, scalar_text(value)) {
            ("document_number" | "phone", Some(text)) => Value::String(digits_only(&text)),
            ("email", Some(text)) => Value::String(text.trim().to_lowercase()),
            (_, Some(text)) => Value::String(collapse_whitespace(&text)),
            (_, None) => value.clone(),
        };
        if normalized.as_str().is_some_and(str::is_empty) {
            continue;
        }
        fields.entry(canonical).or_insert(normalized);
    }

    let mut payload = Map::new();
    for (key, value) in fields {
        payload.insert(key.to_string(), value);
    }
    if !extra.is_empty() {
        let mut extra_map = Map::new();
        for (key, value) in extra {
            extra_map.insert(key, value);
        }
        payload.insert("extra".to_string(), Value::Object(extra_map));
    }

    NormalizedPayload {
        payload: Value::Object(payload),
        status,
    }
}
