//! Plugin search.
//!
//! A read-only projection over the plugin registry, rebuilt from a registry
//! snapshot on every query so purged plugins can never show up. Matches are
//! ranked in tiers; the optional fuzzy tier uses nucleo over plugin names.

use std::cmp::Reverse;

use nucleo::pattern::{CaseMatching, Normalization, Pattern};
use nucleo::{Config as NucleoConfig, Matcher, Utf32Str};
use serde::{Deserialize, Serialize};

use super::Plugin;

/// How a plugin matched a query. Earlier variants rank higher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    ExactId,
    NamePrefix,
    Keyword,
    Description,
    Fuzzy,
}

/// Search tuning, taken from the `[search]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    /// Add a fuzzy tier below the exact tiers.
    pub fuzzy: bool,
    /// Cap on returned hits.
    pub max_results: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { fuzzy: true, max_results: 50 }
    }
}

/// One search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub plugin: Plugin,
    pub kind: MatchKind,
    /// Fuzzy score within the fuzzy tier, 0 otherwise.
    pub score: u32,
}

/// Search over a set of plugins.
pub struct SearchIndex<'a> {
    plugins: &'a [Plugin],
    options: SearchOptions,
}

impl<'a> SearchIndex<'a> {
    pub fn new(plugins: &'a [Plugin], options: SearchOptions) -> Self {
        Self { plugins, options }
    }

    /// Rank plugins against `query`.
    ///
    /// An empty query returns every plugin, newest install first.
    pub fn search(&self, query: &str) -> Vec<SearchHit> {
        let query = query.trim();
        let mut hits: Vec<SearchHit> = if query.is_empty() {
            self.plugins
                .iter()
                .map(|plugin| SearchHit { plugin: plugin.clone(), kind: MatchKind::ExactId, score: 0 })
                .collect()
        } else {
            let mut fuzzy = self.options.fuzzy.then(|| FuzzyScorer::new(query));
            self.plugins
                .iter()
                .filter_map(|plugin| classify(plugin, query, fuzzy.as_mut()))
                .collect()
        };

        hits.sort_by_key(|hit| (hit.kind, Reverse(hit.score), Reverse(hit.plugin.installed_at)));
        hits.truncate(self.options.max_results);
        hits
    }
}

fn classify(plugin: &Plugin, query: &str, fuzzy: Option<&mut FuzzyScorer>) -> Option<SearchHit> {
    let info = &plugin.manifest.info;
    let lowered = query.to_lowercase();

    let kind = if info.id == query {
        Some(MatchKind::ExactId)
    } else if info.name.to_lowercase().starts_with(&lowered) {
        Some(MatchKind::NamePrefix)
    } else if info.keywords.iter().any(|k| k.eq_ignore_ascii_case(query)) {
        Some(MatchKind::Keyword)
    } else if info.description.to_lowercase().contains(&lowered) {
        Some(MatchKind::Description)
    } else {
        None
    };

    if let Some(kind) = kind {
        return Some(SearchHit { plugin: plugin.clone(), kind, score: 0 });
    }

    let score = fuzzy?.score(&info.name)?;
    Some(SearchHit { plugin: plugin.clone(), kind: MatchKind::Fuzzy, score })
}

struct FuzzyScorer {
    matcher: Matcher,
    pattern: Pattern,
    buf: Vec<char>,
}

impl FuzzyScorer {
    fn new(query: &str) -> Self {
        Self {
            matcher: Matcher::new(NucleoConfig::DEFAULT),
            pattern: Pattern::parse(query, CaseMatching::Smart, Normalization::Smart),
            buf: Vec::new(),
        }
    }

    fn score(&mut self, haystack: &str) -> Option<u32> {
        let haystack = Utf32Str::new(haystack, &mut self.buf);
        self.pattern.score(haystack, &mut self.matcher)
    }
}
