//! Shared result-formatter for the client and standalone display paths
//! (spec §4.11). FTS vs semantic results are told apart by inspecting the
//! first result's shape — a `match_text` key means FTS, a `payload` key
//! means semantic — rather than threading a result-kind tag through the
//! wire protocol. Keeping the formatter in one place is what stops the two
//! display paths drifting out of sync.

use serde_json::Value;

pub enum ResultKind {
    Fts,
    Semantic,
    Empty,
}

pub fn detect_kind(results: &[Value]) -> ResultKind {
    match results.first() {
        Some(Value::Object(map)) if map.contains_key("match_text") => ResultKind::Fts,
        Some(Value::Object(map)) if map.contains_key("payload") => ResultKind::Semantic,
        _ => ResultKind::Empty,
    }
}

pub fn format_results(results: &[Value]) -> String {
    match detect_kind(results) {
        ResultKind::Fts => results.iter().map(format_fts_row).collect::<Vec<_>>().join("\n"),
        ResultKind::Semantic => results
            .iter()
            .map(format_semantic_row)
            .collect::<Vec<_>>()
            .join("\n"),
        ResultKind::Empty => "no results".to_string(),
    }
}

fn format_fts_row(row: &Value) -> String {
    let path = row.get("path").and_then(Value::as_str).unwrap_or("");
    let line = row.get("line").and_then(Value::as_u64).unwrap_or(0);
    let snippet = row.get("snippet").and_then(Value::as_str).unwrap_or("");
    if snippet.is_empty() {
        format!("{path}:{line}")
    } else {
        format!("{path}:{line}: {snippet}")
    }
}

fn format_semantic_row(row: &Value) -> String {
    let path = row
        .get("payload")
        .and_then(|p| p.get("path"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let score = row.get("score").and_then(Value::as_f64).unwrap_or(0.0);
    format!("{path} ({score:.3})")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_fts_shape_by_match_text_key() {
        let results = vec![json!({
            "path": "a.rs", "line": 1, "column": 0,
            "match_text": "x", "snippet": "fn x()",
        })];
        assert!(matches!(detect_kind(&results), ResultKind::Fts));
    }

    #[test]
    fn detects_semantic_shape_by_payload_key() {
        let results = vec![json!({"payload": {"path": "a.rs"}, "score": 0.9})];
        assert!(matches!(detect_kind(&results), ResultKind::Semantic));
    }

    #[test]
    fn empty_results_format_as_no_results() {
        assert_eq!(format_results(&[]), "no results");
    }

    #[test]
    fn fts_row_without_snippet_omits_trailing_colon() {
        let results = vec![json!({
            "path": "a.rs", "line": 3, "column": 0,
            "match_text": "x", "snippet": "",
        })];
        assert_eq!(format_results(&results), "a.rs:3");
    }
}
