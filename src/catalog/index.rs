//! Rankable search index over downstream tool catalogs.
//!
//! The index is rebuilt whenever a catalog changes and is deterministic given
//! identical input: entries are stored sorted by `(server, tool)` and ranking
//! ties break lexicographically on the same key, so repeated identical
//! queries always return identical output.

use std::collections::HashSet;

use super::types::{SearchHit, ToolDescriptor};

/// Words too common to carry signal in tool search.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "that", "the", "this", "to", "with",
];

/// Lower-case, strip punctuation, drop stopwords.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter_map(|word| {
            let word = word.to_lowercase();
            if word.is_empty() || STOPWORDS.contains(&word.as_str()) {
                None
            } else {
                Some(word)
            }
        })
        .collect()
}

/// Collect property names from a JSON schema, descending into nested
/// `properties` objects.
fn schema_property_tokens(schema: &serde_json::Value, out: &mut Vec<String>) {
    let Some(properties) = schema.get("properties").and_then(|v| v.as_object()) else {
        return;
    };
    for (name, sub_schema) in properties {
        out.extend(tokenize(name));
        schema_property_tokens(sub_schema, out);
    }
}

/// Derived, rankable view of one tool.
#[derive(Debug, Clone)]
struct IndexEntry {
    server: String,
    tool: String,
    description: String,
    name_tokens: HashSet<String>,
    description_tokens: HashSet<String>,
    schema_tokens: HashSet<String>,
}

impl IndexEntry {
    fn from_descriptor(descriptor: &ToolDescriptor) -> Self {
        let mut schema_tokens = Vec::new();
        schema_property_tokens(&descriptor.input_schema, &mut schema_tokens);

        Self {
            server: descriptor.server.clone(),
            tool: descriptor.name.clone(),
            description: descriptor.description.clone(),
            name_tokens: tokenize(&descriptor.name).into_iter().collect(),
            description_tokens: tokenize(&descriptor.description).into_iter().collect(),
            schema_tokens: schema_tokens.into_iter().collect(),
        }
    }

    /// score = 3 x name overlap + 1 x description overlap + 1 x schema overlap.
    fn score(&self, query_tokens: &[String]) -> u32 {
        let mut score = 0;
        for token in query_tokens {
            if self.name_tokens.contains(token) {
                score += 3;
            }
            if self.description_tokens.contains(token) {
                score += 1;
            }
            if self.schema_tokens.contains(token) {
                score += 1;
            }
        }
        score
    }

    fn to_hit(&self, score: u32) -> SearchHit {
        SearchHit {
            server: self.server.clone(),
            tool: self.tool.clone(),
            description: self.description.clone(),
            score,
        }
    }
}

/// Token index over one or many servers' catalogs.
pub struct CatalogIndex {
    entries: Vec<IndexEntry>,
}

impl CatalogIndex {
    /// Build from descriptors. Deterministic: entries end up sorted by
    /// `(server, tool)` regardless of input order.
    pub fn build<'a>(descriptors: impl IntoIterator<Item = &'a ToolDescriptor>) -> Self {
        let mut entries: Vec<IndexEntry> = descriptors
            .into_iter()
            .map(IndexEntry::from_descriptor)
            .collect();
        entries.sort_by(|a, b| (&a.server, &a.tool).cmp(&(&b.server, &b.tool)));
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ranked free-text search. An empty (or all-stopword) query means "no
    /// filter": the full catalog is returned in index order with score 0.
    pub fn search(&self, query: &str, max_results: usize) -> Vec<SearchHit> {
        let query_tokens = tokenize(query);

        if query_tokens.is_empty() {
            return self
                .entries
                .iter()
                .take(max_results)
                .map(|entry| entry.to_hit(0))
                .collect();
        }

        let mut hits: Vec<SearchHit> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let score = entry.score(&query_tokens);
                (score > 0).then(|| entry.to_hit(score))
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| (&a.server, &a.tool).cmp(&(&b.server, &b.tool)))
        });
        hits.truncate(max_results);
        hits
    }
}
