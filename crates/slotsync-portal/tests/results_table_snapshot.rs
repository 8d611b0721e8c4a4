// Results-page fixtures parsed through the public extraction API.

use chrono::NaiveDate;
use slotsync_portal::{parse_results, probe_results, ResultsOutcome, ResultsProbe};

fn fixture(name: &str) -> String {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    std::fs::read_to_string(root.join("fixtures/portal").join(name)).expect("fixture")
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 11, 4).expect("date")
}

#[test]
fn headed_results_table_extracts_valid_rows() {
    let html = fixture("results.html");
    assert_eq!(probe_results(&html), ResultsProbe::Table);

    let extraction = parse_results(&html, day());
    assert_eq!(extraction.outcome, ResultsOutcome::Table);
    let names: Vec<&str> = extraction.rows.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(
        names,
        ["MARIA APARECIDA DA SILVA", "JOSE CARLOS PEREIRA", "Carla Mendes"]
    );
    let jose = &extraction.rows[1];
    assert_eq!(jose.time, "08:20:00");
    assert_eq!(jose.document_number, "98765432100");
    assert_eq!(jose.email, None);
    assert_eq!(jose.process_type.as_deref(), Some("Renovação"));
    assert_eq!(jose.category.as_deref(), Some("AB"));
    assert_eq!(extraction.rejected.len(), 2);
}

#[test]
fn headerless_table_is_classified_by_cell_shape() {
    let html = fixture("results_shuffled.html");
    let extraction = parse_results(&html, day());

    assert_eq!(extraction.rows.len(), 2);
    let joao = &extraction.rows[0];
    assert_eq!(joao.time, "14:30:00");
    assert_eq!(joao.name, "João Pereira dos Santos");
    assert_eq!(joao.document_number, "12345678909");
    assert_eq!(joao.email.as_deref(), Some("joao@example.com"));
    assert_eq!(joao.slot_token.as_deref(), Some("a81"));
    assert_eq!(extraction.rows[1].status_hint.as_deref(), Some("Cancelado"));
}

#[test]
fn empty_message_is_no_results() {
    let html = fixture("results_empty.html");
    assert_eq!(probe_results(&html), ResultsProbe::NoResults);
    let extraction = parse_results(&html, day());
    assert_eq!(extraction.outcome, ResultsOutcome::NoResults);
    assert!(extraction.rows.is_empty());
}
