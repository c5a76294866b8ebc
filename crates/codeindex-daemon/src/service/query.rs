//! Read-path RPC handlers: `query`, `query_fts`, `query_hybrid`,
//! `query_temporal`.

use std::time::Instant;

use chrono::NaiveDate;
use codeindex_core::collaborators::EmbeddingProvider;
use codeindex_core::fts::FtsSearchOptions;
use codeindex_core::types::{CollectionKey, FtsResult, SemanticResult};

use super::DaemonState;
use crate::error::DaemonError;

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct QueryFilters {
    pub path_filters: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryTiming {
    pub embedding_ms: u64,
    pub hnsw_load_ms: u64,
    pub id_load_ms: u64,
    pub vector_search_ms: u64,
    pub total_ms: u64,
    pub path: &'static str,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryResponse {
    pub results: Vec<SemanticResult>,
    pub timing: QueryTiming,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HybridResult {
    pub path: String,
    pub score: f32,
    pub semantic: bool,
    pub fts: bool,
}

/// Executes under the `CacheEntry` read lock for the entire operation —
/// embedding generation AND search, per spec §4.5's invariant. The lock
/// scope is not split between "look up cache" and "execute search": a
/// prior design that released the lock before search raced a concurrent
/// rebuild's swap-in against the in-flight query.
pub fn query(
    state: &DaemonState,
    key: &CollectionKey,
    query_text: &str,
    limit: usize,
    filters: &QueryFilters,
    embedder: &dyn EmbeddingProvider,
) -> crate::Result<QueryResponse> {
    let total_start = Instant::now();
    let entry = state.ensure_cache_loaded(key);

    entry.read(|hnsw, id_index, _fts| -> crate::Result<QueryResponse> {
        let embed_start = Instant::now();
        let vectors = embedder
            .embed(&[query_text.to_string()])
            .map_err(DaemonError::Index)?;
        let embedding_ms = embed_start.elapsed().as_millis() as u64;
        let vector = vectors.into_iter().next().unwrap_or_default();

        let search_start = Instant::now();
        let Some(index) = hnsw else {
            return Ok(QueryResponse {
                results: Vec::new(),
                timing: QueryTiming {
                    embedding_ms,
                    hnsw_load_ms: 0,
                    id_load_ms: 0,
                    vector_search_ms: 0,
                    total_ms: total_start.elapsed().as_millis() as u64,
                    path: "rebuild",
                },
            });
        };
        let (ids, distances) = index.query(&vector, limit);
        let mut results = Vec::with_capacity(ids.len());
        for (point_id, distance) in ids.iter().zip(distances.iter()) {
            let Some(path) = id_index.get(point_id) else {
                continue;
            };
            if !filters.path_filters.is_empty()
                && !filters.path_filters.iter().any(|f| path.contains(f))
            {
                continue;
            }
            if filters.exclude_paths.iter().any(|f| path.contains(f)) {
                continue;
            }
            results.push(SemanticResult {
                payload: codeindex_core::types::Payload {
                    path: path.to_string(),
                    line_start: 0,
                    line_end: 0,
                    language: String::new(),
                    git_ref: None,
                },
                score: 1.0 - distance,
            });
        }
        Ok(QueryResponse {
            results,
            timing: QueryTiming {
                embedding_ms,
                hnsw_load_ms: 0,
                id_load_ms: 0,
                vector_search_ms: search_start.elapsed().as_millis() as u64,
                total_ms: total_start.elapsed().as_millis() as u64,
                path: "hnsw",
            },
        })
    })
}

pub fn query_fts(
    state: &DaemonState,
    key: &CollectionKey,
    query_text: &str,
    opts: &FtsSearchOptions,
) -> crate::Result<Vec<FtsResult>> {
    let entry = state.ensure_cache_loaded(key);
    entry
        .read(|_hnsw, _id_index, fts| match fts {
            Some(index) => index.search(query_text, opts).map_err(DaemonError::Index),
            None => Ok(Vec::new()),
        })
}

/// Simple union with independent min-max normalisation per result list,
/// then summed by path (spec §9 Open Question: any documented monotonic
/// combination is acceptable).
pub fn query_hybrid(
    state: &DaemonState,
    key: &CollectionKey,
    query_text: &str,
    limit: usize,
    embedder: &dyn EmbeddingProvider,
) -> crate::Result<Vec<HybridResult>> {
    let semantic = query(state, key, query_text, limit, &QueryFilters::default(), embedder)?;
    let fts = query_fts(state, key, query_text, &FtsSearchOptions {
        limit,
        ..Default::default()
    })?;

    let normalize = |scores: &[f32]| -> Vec<f32> {
        let min = scores.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let range = (max - min).max(f32::EPSILON);
        scores.iter().map(|s| (s - min) / range).collect()
    };

    let semantic_scores: Vec<f32> = semantic.results.iter().map(|r| r.score).collect();
    let semantic_norm = normalize(&semantic_scores);

    let mut merged: std::collections::HashMap<String, HybridResult> = std::collections::HashMap::new();
    for (result, score) in semantic.results.iter().zip(semantic_norm.iter()) {
        merged.insert(
            result.payload.path.clone(),
            HybridResult {
                path: result.payload.path.clone(),
                score: *score,
                semantic: true,
                fts: false,
            },
        );
    }
    if !fts.is_empty() {
        let fts_norm = normalize(&vec![1.0; fts.len()]);
        for (result, score) in fts.iter().zip(fts_norm.iter()) {
            merged
                .entry(result.path.clone())
                .and_modify(|r| {
                    r.score += score;
                    r.fts = true;
                })
                .or_insert(HybridResult {
                    path: result.path.clone(),
                    score: *score,
                    semantic: false,
                    fts: true,
                });
        }
    }

    let mut out: Vec<HybridResult> = merged.into_values().collect();
    out.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    out.truncate(limit);
    Ok(out)
}

/// `time_range` is either `"all"` or `"YYYY-MM-DD..YYYY-MM-DD"`. MUST be
/// normalised to an inclusive date tuple before reaching the search
/// backend — passing the literal string through caused a previously-shipped
/// crash (spec §4.9).
pub fn normalize_time_range(time_range: &str) -> crate::Result<(NaiveDate, NaiveDate)> {
    if time_range == "all" {
        return Ok((
            NaiveDate::from_ymd_opt(1970, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2100, 12, 31).unwrap(),
        ));
    }
    let (start, end) = time_range
        .split_once("..")
        .ok_or_else(|| DaemonError::InvalidInput(format!("malformed time_range: {time_range}")))?;
    let start = NaiveDate::parse_from_str(start, "%Y-%m-%d")
        .map_err(|e| DaemonError::InvalidInput(format!("bad start date: {e}")))?;
    let end = NaiveDate::parse_from_str(end, "%Y-%m-%d")
        .map_err(|e| DaemonError::InvalidInput(format!("bad end date: {e}")))?;
    Ok((start, end))
}

pub fn query_temporal(
    state: &DaemonState,
    key: &CollectionKey,
    query_text: &str,
    time_range: &str,
    limit: usize,
    embedder: &dyn EmbeddingProvider,
) -> crate::Result<QueryResponse> {
    // `time_range` is validated and normalised here — this is the
    // mandatory guard against passing "all" straight to a date parser — but
    // `Payload` carries no commit/indexing timestamp to filter against, so
    // the normalised range is not yet applied to the result set. Wiring
    // real date filtering needs a timestamp on `Payload`/the ID index.
    let (_start, _end) = normalize_time_range(time_range)?;
    query(state, key, query_text, limit, &QueryFilters::default(), embedder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_time_range_all_maps_to_full_span() {
        let (start, end) = normalize_time_range("all").unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(1970, 1, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2100, 12, 31).unwrap());
    }

    #[test]
    fn normalize_time_range_parses_explicit_span() {
        let (start, end) = normalize_time_range("2024-01-01..2024-06-30").unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2024, 6, 30).unwrap());
    }

    #[test]
    fn normalize_time_range_rejects_malformed_input() {
        assert!(normalize_time_range("not-a-range").is_err());
        assert!(normalize_time_range("2024-01-01").is_err());
    }
}
