//! Directory-based full-text index (C4).
//!
//! Wraps `tantivy`. Full rebuilds go through [`AtomicRebuilder`]'s
//! directory-swap path (build into `tantivy_index.tmp/`, rename over the
//! live directory); incremental mutations during a session or watch go
//! straight to the writer and are committed without a full rebuild.

use std::fs;

use tantivy::collector::TopDocs;
use tantivy::doc;
use tantivy::query::{FuzzyTermQuery, QueryParser, RegexQuery};
use tantivy::schema::{Schema, Value, STORED, STRING, TEXT};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument};

use crate::error::{IndexError, Result};
use crate::rebuild::AtomicRebuilder;
use crate::types::{Collection, FtsResult};

fn build_schema() -> (Schema, FieldHandles) {
    let mut builder = Schema::builder();
    let path = builder.add_text_field("path", STRING | STORED);
    let line = builder.add_u64_field("line", STORED);
    let column = builder.add_u64_field("column", STORED);
    let language = builder.add_text_field("language", STRING | STORED);
    let body = builder.add_text_field("body", TEXT | STORED);
    (
        builder.build(),
        FieldHandles {
            path,
            line,
            column,
            language,
            body,
        },
    )
}

struct FieldHandles {
    path: tantivy::schema::Field,
    line: tantivy::schema::Field,
    column: tantivy::schema::Field,
    language: tantivy::schema::Field,
    body: tantivy::schema::Field,
}

/// A document to be indexed: one line (or chunk) of a file.
pub struct FtsDocument {
    pub path: String,
    pub line: u32,
    pub column: u32,
    pub language: String,
    pub body: String,
}

/// Search filters accepted by `FtsStore::search` (spec §4.4).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct FtsSearchOptions {
    pub limit: usize,
    pub regex: bool,
    pub languages: Vec<String>,
    pub exclude_languages: Vec<String>,
    pub path_filters: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub edit_distance: u8,
    pub case_sensitive: bool,
    pub snippet_lines: u32,
}

/// An opened, queryable full-text index.
pub struct FtsIndex {
    index: Index,
    writer: Option<IndexWriter>,
    reader: IndexReader,
    fields: FieldHandles,
}

impl FtsIndex {
    /// Opens the existing index read-only. Returns `Unavailable` if the
    /// directory or its `meta.json` marker is missing.
    pub fn open(collection: &Collection) -> Result<Self> {
        let dir = collection.tantivy_dir();
        if !dir.join("meta.json").exists() {
            return Err(IndexError::Unavailable(
                "fts index directory missing meta.json".into(),
            ));
        }
        let index = Index::open_in_dir(&dir)?;
        let (_, fields) = build_schema();
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()?;
        Ok(Self {
            index,
            writer: None,
            reader,
            fields,
        })
    }

    fn writer(&mut self) -> Result<&mut IndexWriter> {
        if self.writer.is_none() {
            self.writer = Some(self.index.writer(50_000_000)?);
        }
        Ok(self.writer.as_mut().unwrap())
    }

    pub fn incremental_add(&mut self, doc: &FtsDocument) -> Result<()> {
        let fields = &self.fields;
        let tantivy_doc = doc!(
            fields.path => doc.path.clone(),
            fields.line => doc.line as u64,
            fields.column => doc.column as u64,
            fields.language => doc.language.clone(),
            fields.body => doc.body.clone(),
        );
        self.writer()?.add_document(tantivy_doc)?;
        self.writer()?.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    pub fn incremental_update(&mut self, doc: &FtsDocument) -> Result<()> {
        self.incremental_delete(&doc.path)?;
        self.incremental_add(doc)
    }

    pub fn incremental_delete(&mut self, path: &str) -> Result<()> {
        let term = tantivy::Term::from_field_text(self.fields.path, path);
        self.writer()?.delete_term(term);
        self.writer()?.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    /// `snippet_lines == 0` suppresses snippet generation (grep-style
    /// output) but still returns `line`/`column`.
    pub fn search(&self, query_text: &str, opts: &FtsSearchOptions) -> Result<Vec<FtsResult>> {
        let searcher = self.reader.searcher();
        let parser = QueryParser::for_index(&self.index, vec![self.fields.body]);

        let limit = if opts.limit == 0 { 20 } else { opts.limit };
        let mut results = Vec::new();

        if opts.regex {
            let regex_query = RegexQuery::from_pattern(query_text, self.fields.body)
                .map_err(|e| IndexError::Fts(e.to_string()))?;
            let top_docs = searcher.search(&regex_query, &TopDocs::with_limit(limit))?;
            for (_score, addr) in top_docs {
                results.push(self.doc_to_result(&searcher, addr, opts)?);
            }
        } else if opts.edit_distance > 0 {
            // Single-term fuzzy match; QueryParser has no fuzzy mode of its
            // own, so build the FuzzyTermQuery directly against the raw
            // query text.
            let term = tantivy::Term::from_field_text(self.fields.body, query_text);
            let fuzzy_query = FuzzyTermQuery::new(term, opts.edit_distance, true);
            let top_docs = searcher.search(&fuzzy_query, &TopDocs::with_limit(limit))?;
            for (_score, addr) in top_docs {
                results.push(self.doc_to_result(&searcher, addr, opts)?);
            }
        } else {
            let query = parser
                .parse_query(query_text)
                .map_err(|e| IndexError::Fts(e.to_string()))?;
            let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;
            for (_score, addr) in top_docs {
                results.push(self.doc_to_result(&searcher, addr, opts)?);
            }
        }

        // tantivy's default tokenizer already lowercases both sides, so a
        // case-sensitive request needs a literal-match pass over the
        // retrieved text.
        if opts.case_sensitive {
            results.retain(|r| r.match_text.contains(query_text));
        }
        if !opts.languages.is_empty() {
            results.retain(|r| opts.languages.iter().any(|lang| lang == &r.language));
        }
        if !opts.exclude_languages.is_empty() {
            results.retain(|r| !opts.exclude_languages.iter().any(|lang| lang == &r.language));
        }
        if !opts.path_filters.is_empty() {
            results.retain(|r| opts.path_filters.iter().any(|f| r.path.contains(f)));
        }
        if !opts.exclude_paths.is_empty() {
            results.retain(|r| !opts.exclude_paths.iter().any(|f| r.path.contains(f)));
        }

        Ok(results)
    }

    fn doc_to_result(
        &self,
        searcher: &tantivy::Searcher,
        addr: tantivy::DocAddress,
        opts: &FtsSearchOptions,
    ) -> Result<FtsResult> {
        let retrieved: TantivyDocument = searcher.doc(addr)?;
        let path = field_text(&retrieved, self.fields.path);
        let language = field_text(&retrieved, self.fields.language);
        let body = field_text(&retrieved, self.fields.body);
        let line = field_u64(&retrieved, self.fields.line) as u32;
        let column = field_u64(&retrieved, self.fields.column) as u32;
        // Each document is a single line/chunk, so its body field is the
        // match text itself; `snippet` additionally honours snippet_lines.
        let snippet = if opts.snippet_lines == 0 {
            String::new()
        } else {
            body.clone()
        };
        Ok(FtsResult {
            path,
            line,
            column,
            language,
            match_text: body,
            snippet,
        })
    }
}

fn field_text(doc: &TantivyDocument, field: tantivy::schema::Field) -> String {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn field_u64(doc: &TantivyDocument, field: tantivy::schema::Field) -> u64 {
    doc.get_first(field).and_then(|v| v.as_u64()).unwrap_or(0)
}

pub struct FtsStore;

impl FtsStore {
    /// Full rebuild into `tantivy_index.tmp/`, then a directory swap via
    /// [`AtomicRebuilder`]. The incremental-vs-full decision (spec §4.4)
    /// belongs to the caller (`IndexingCoordinator`): reopen-and-update if
    /// `meta.json` already exists, full rebuild otherwise.
    pub fn rebuild_from_documents(collection: &Collection, documents: &[FtsDocument]) -> Result<()> {
        let (schema, fields) = build_schema();
        let rebuilder = AtomicRebuilder::new(&collection.root);
        let target = collection.tantivy_dir();

        rebuilder.rebuild_with_lock(&target, |tmp| {
            fs::create_dir_all(tmp)?;
            let index = Index::create_in_dir(tmp, schema.clone())?;
            let mut writer: IndexWriter = index.writer(50_000_000)?;
            for d in documents {
                writer.add_document(doc!(
                    fields.path => d.path.clone(),
                    fields.line => d.line as u64,
                    fields.column => d.column as u64,
                    fields.language => d.language.clone(),
                    fields.body => d.body.clone(),
                ))?;
            }
            writer.commit()?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(path: &str, body: &str) -> FtsDocument {
        FtsDocument {
            path: path.to_string(),
            line: 1,
            column: 1,
            language: "rust".to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn rebuild_then_search_finds_document() {
        let dir = tempfile::tempdir().unwrap();
        let collection = Collection::new(dir.path());
        FtsStore::rebuild_from_documents(
            &collection,
            &[doc("src/main.rs", "fn connect_to_database() {}")],
        )
        .unwrap();

        let index = FtsIndex::open(&collection).unwrap();
        let results = index
            .search("database", &FtsSearchOptions {
                limit: 10,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "src/main.rs");
    }

    #[test]
    fn snippet_lines_zero_suppresses_snippet_but_keeps_position() {
        let dir = tempfile::tempdir().unwrap();
        let collection = Collection::new(dir.path());
        FtsStore::rebuild_from_documents(&collection, &[doc("a.rs", "unique_token_xyz")]).unwrap();

        let index = FtsIndex::open(&collection).unwrap();
        let results = index
            .search(
                "unique_token_xyz",
                &FtsSearchOptions {
                    limit: 10,
                    snippet_lines: 0,
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(results[0].snippet, "");
        assert_eq!(results[0].line, 1);
    }

    #[test]
    fn open_without_index_reports_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let collection = Collection::new(dir.path());
        let result = FtsIndex::open(&collection);
        assert!(matches!(result, Err(IndexError::Unavailable(_))));
    }

    #[test]
    fn incremental_delete_removes_document_from_search() {
        let dir = tempfile::tempdir().unwrap();
        let collection = Collection::new(dir.path());
        FtsStore::rebuild_from_documents(&collection, &[doc("a.rs", "findable_term")]).unwrap();

        let mut index = FtsIndex::open(&collection).unwrap();
        index.incremental_delete("a.rs").unwrap();

        let results = index
            .search("findable_term", &FtsSearchOptions::default())
            .unwrap();
        assert!(results.is_empty());
    }
}
