//! Date, weekday and time helpers for the portal's pt-BR formats.

use chrono::{Datelike, NaiveDate, Weekday};

use crate::SyncError;

pub fn format_iso(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// `dd/mm/yyyy`, as rendered by the portal's selection lists.
pub fn format_br(date: NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}

/// `ddmmyyyy`, as typed into the portal's masked date input.
pub fn format_digits(date: NaiveDate) -> String {
    date.format("%d%m%Y").to_string()
}

/// Accepts ISO (`2025-11-04`) or pt-BR (`04/11/2025`) dates.
pub fn parse_date(value: &str) -> Result<NaiveDate, SyncError> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%d/%m/%Y"))
        .map_err(|_| SyncError::InvalidRequest(format!("unrecognized date '{value}'")))
}

pub fn fold_accents(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'A',
            'é' | 'ê' | 'è' | 'ë' => 'e',
            'É' | 'Ê' | 'È' | 'Ë' => 'E',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'O',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
            'ç' => 'c',
            'Ç' => 'C',
            other => other,
        })
        .collect()
}

pub fn parse_work_day(value: &str) -> Option<Weekday> {
    let folded = fold_accents(value.trim()).to_ascii_lowercase();
    let name = folded.trim_end_matches("-feira").trim_end_matches(" feira");
    match name {
        "domingo" | "dom" | "sunday" | "sun" => Some(Weekday::Sun),
        "segunda" | "seg" | "monday" | "mon" => Some(Weekday::Mon),
        "terca" | "ter" | "tuesday" | "tue" => Some(Weekday::Tue),
        "quarta" | "qua" | "wednesday" | "wed" => Some(Weekday::Wed),
        "quinta" | "qui" | "thursday" | "thu" => Some(Weekday::Thu),
        "sexta" | "sex" | "friday" | "fri" => Some(Weekday::Fri),
        "sabado" | "sab" | "saturday" | "sat" => Some(Weekday::Sat),
        _ => None,
    }
}

pub fn parse_work_days<S: AsRef<str>>(values: &[S]) -> Result<Vec<Weekday>, SyncError> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        let value = value.as_ref();
        let day = parse_work_day(value)
            .ok_or_else(|| SyncError::InvalidRequest(format!("unknown work day '{value}'")))?;
        if !out.contains(&day) {
            out.push(day);
        }
    }
    Ok(out)
}

pub fn work_day_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Sun => "domingo",
        Weekday::Mon => "segunda",
        Weekday::Tue => "terca",
        Weekday::Wed => "quarta",
        Weekday::Thu => "quinta",
        Weekday::Fri => "sexta",
        Weekday::Sat => "sabado",
    }
}

/// Calendar dates inside `[start, end]` whose weekday is one of `work_days`, ascending.
pub fn dates_in_window(start: NaiveDate, end: NaiveDate, work_days: &[Weekday]) -> Vec<NaiveDate> {
    start
        .iter_days()
        .take_while(|day| *day <= end)
        .filter(|day| work_days.contains(&day.weekday()))
        .collect()
}

/// Coerce loosely formatted times (`9:5`, `09h05`, `9`) to `HH:MM:SS`.
pub fn normalize_time(value: &str) -> Option<String> {
    let cleaned = value.trim().to_ascii_lowercase();
    if cleaned.is_empty() {
        return None;
    }
    let parts = cleaned
        .split([':', 'h'])
        .map(str::trim)
        .collect::<Vec<_>>();
    if parts.len() > 3 {
        return None;
    }

    let mut numbers = [0u32; 3];
    for (idx, part) in parts.iter().enumerate() {
        if part.is_empty() {
            if idx == 0 {
                return None;
            }
            continue;
        }
        if part.len() > 2 || !part.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        numbers[idx] = part.parse().ok()?;
    }

    let [hour, minute, second] = numbers;
    if hour > 23 || minute > 59 || second > 59 {
        return None;
    }
    Some(format!("{hour:02}:{minute:02}:{second:02}"))
}

pub fn looks_like_time(value: &str) -> bool {
    let trimmed = value.trim();
    (trimmed.contains(':') || trimmed.to_ascii_lowercase().contains('h'))
        && trimmed.len() <= 8
        && normalize_time(trimmed).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn formats_both_portal_date_shapes() {
        let date = d(2025, 11, 4);
        assert_eq!(format_br(date), "04/11/2025");
        assert_eq!(format_digits(date), "04112025");
        assert_eq!(format_iso(date), "2025-11-04");
        assert_eq!(parse_date("04/11/2025").unwrap(), date);
        assert_eq!(parse_date(" 2025-11-04 ").unwrap(), date);
        assert!(parse_date("11-04-2025").is_err());
    }

    #[test]
    fn work_day_names_accept_accents_and_suffixes() {
        assert_eq!(parse_work_day("terca"), Some(Weekday::Tue));
        assert_eq!(parse_work_day("Terça-feira"), Some(Weekday::Tue));
        assert_eq!(parse_work_day("SÁBADO"), Some(Weekday::Sat));
        assert_eq!(parse_work_day("wed"), Some(Weekday::Wed));
        assert_eq!(parse_work_day("funday"), None);
        assert!(parse_work_days(&["terca", "feriado"]).is_err());
        assert_eq!(
            parse_work_days(&["quarta", "Quarta"]).unwrap(),
            vec![Weekday::Wed]
        );
    }

    #[test]
    fn window_keeps_only_requested_weekdays() {
        let dates = dates_in_window(d(2025, 11, 3), d(2025, 11, 14), &[Weekday::Tue, Weekday::Wed]);
        assert_eq!(
            dates,
            vec![d(2025, 11, 4), d(2025, 11, 5), d(2025, 11, 11), d(2025, 11, 12)]
        );
        assert!(dates_in_window(d(2025, 11, 14), d(2025, 11, 3), &[Weekday::Tue]).is_empty());
        let last = NaiveDate::MAX;
        let every_day = [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ];
        let tail = dates_in_window(last - chrono::Days::new(6), last, &every_day);
        assert_eq!(tail.len(), 7);
        assert_eq!(tail.last(), Some(&last));
    }

    #[test]
    fn times_are_coerced_to_full_clock() {
        assert_eq!(normalize_time("9:5").as_deref(), Some("09:05:00"));
        assert_eq!(normalize_time("09:05:00").as_deref(), Some("09:05:00"));
        assert_eq!(normalize_time("14h30").as_deref(), Some("14:30:00"));
        assert_eq!(normalize_time("8").as_deref(), Some("08:00:00"));
        assert_eq!(normalize_time("25:00"), None);
        assert_eq!(normalize_time("ab:cd"), None);
        assert!(looks_like_time("08:30"));
        assert!(!looks_like_time("12345678909"));
    }
}
