//! Read path
//!
//! Equality matchers are translated into label ids through the
//! [`LabelResolver`] (never creating anything) and pushed down to the store as
//! a series selector. The remaining matchers are applied to the candidate
//! series afterwards. A label a series does not carry matches as the empty
//! string, as in PromQL.

use regex::Regex;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::resolver::LabelResolver;
use crate::store::{SeriesSelector, Store};
use crate::types::{
    Label, LabelMatcher, Labels, MatchType, Query, QueryResult, ReadRequest, ReadResponse,
};

/// A matcher ready to evaluate against a label set
enum Predicate {
    Equal(String, String),
    NotEqual(String, String),
    Regex(String, Regex),
    NotRegex(String, Regex),
}

impl Predicate {
    fn compile(matcher: &LabelMatcher) -> Result<Self> {
        let name = matcher.name.clone();
        Ok(match matcher.kind {
            MatchType::Equal => Predicate::Equal(name, matcher.value.clone()),
            MatchType::NotEqual => Predicate::NotEqual(name, matcher.value.clone()),
            MatchType::Regex => Predicate::Regex(name, anchored(&matcher.value)?),
            MatchType::NotRegex => Predicate::NotRegex(name, anchored(&matcher.value)?),
        })
    }

    fn matches(&self, labels: &Labels) -> bool {
        match self {
            Predicate::Equal(name, value) => labels.get(name).unwrap_or("") == value,
            Predicate::NotEqual(name, value) => labels.get(name).unwrap_or("") != value,
            Predicate::Regex(name, re) => re.is_match(labels.get(name).unwrap_or("")),
            Predicate::NotRegex(name, re) => !re.is_match(labels.get(name).unwrap_or("")),
        }
    }
}

/// Matchers are full-string matches
fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", pattern))
        .map_err(|e| Error::InvalidQuery(format!("bad regex {:?}: {}", pattern, e)))
}

/// Answers read requests from the store
#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<dyn Store>,
    resolver: LabelResolver,
}

impl QueryEngine {
    /// `store` should be the read-role handle; the resolver shares the label cache with ingestion
    pub fn new(store: Arc<dyn Store>, resolver: LabelResolver) -> Self {
        Self { store, resolver }
    }

    /// Answer every query; `results[i]` belongs to `queries[i]`
    pub async fn read(&self, request: Option<ReadRequest>) -> Result<ReadResponse> {
        let Some(request) = request else {
            return Ok(ReadResponse::default());
        };
        let mut results = Vec::with_capacity(request.queries.len());
        for query in &request.queries {
            results.push(self.query(query).await?);
        }
        Ok(ReadResponse { results })
    }

    /// Answer a single query
    pub async fn query(&self, query: &Query) -> Result<QueryResult> {
        let predicates = query
            .matchers
            .iter()
            .map(Predicate::compile)
            .collect::<Result<Vec<_>>>()?;

        // Only non-empty equalities can be pushed down; `job=""` selects series without `job`
        let pushed: Vec<Label> = query
            .matchers
            .iter()
            .filter(|m| m.kind == MatchType::Equal && !m.value.is_empty())
            .map(|m| Label::new(m.name.clone(), m.value.clone()))
            .collect();

        let mut label_ids = Vec::with_capacity(pushed.len());
        for id in self.resolver.lookup(&pushed).await? {
            match id {
                Some(id) => label_ids.push(id),
                // never written, so nothing can match
                None => return Ok(QueryResult::default()),
            }
        }

        let selector = SeriesSelector {
            label_ids,
            start_ms: query.start_ms,
            end_ms: query.end_ms,
        };
        let candidates = self.store.query_series(&selector).await?;
        let scanned = candidates.len();
        let timeseries: Vec<_> = candidates
            .into_iter()
            .filter(|ts| predicates.iter().all(|p| p.matches(&ts.labels)))
            .collect();

        debug!(scanned, matched = timeseries.len(), "query evaluated");
        Ok(QueryResult { timeseries })
    }
}
