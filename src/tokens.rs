//! Token-usage aggregation over model-reported counters.
//!
//! Counters are recorded on events as `meta.tokens`; sources that group
//! events by message attach them to exactly one event per message, and the
//! aggregator additionally dedups on `(source_id, message_id)` so a counter
//! can never be summed twice. Pricing comes from the caller; unknown model
//! ids are surfaced rather than silently priced at zero.

use anyhow::Result;
use std::collections::{BTreeMap, HashSet};

use crate::config::ModelPrice;
use crate::store::query::QueryFilters;
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TokenTotals {
    pub input: i64,
    pub output: i64,
    pub cache_read: i64,
    pub cache_write: i64,
    pub cost: f64,
}

impl TokenTotals {
    fn add(&mut self, other: &TokenTotals) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
        self.cost += other.cost;
    }
}

#[derive(Debug, Default)]
pub struct TokenStats {
    pub totals: TokenTotals,
    pub by_day: BTreeMap<String, TokenTotals>,
    pub by_session: BTreeMap<String, TokenTotals>,
    pub by_model: BTreeMap<String, TokenTotals>,
    /// Model ids seen on events but absent from the pricing map.
    pub unknown_models: Vec<String>,
}

/// Roll up token counters matching the filters.
pub fn token_stats(
    store: &Store,
    filters: &QueryFilters,
    pricing: &BTreeMap<String, ModelPrice>,
) -> Result<TokenStats> {
    let events = store.events_with_tokens(filters)?;

    let mut stats = TokenStats::default();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut unknown: HashSet<String> = HashSet::new();

    for event in events {
        let Some(meta) = event.meta() else { continue };
        let Some(tokens) = meta.get("tokens") else { continue };

        let message_key = meta
            .get("message_id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| event.event_id.clone());
        if !seen.insert((event.source_id.clone(), message_key)) {
            continue;
        }

        let mut totals = TokenTotals {
            input: tokens.get("input").and_then(|v| v.as_i64()).unwrap_or(0),
            output: tokens.get("output").and_then(|v| v.as_i64()).unwrap_or(0),
            cache_read: tokens.get("cache_read").and_then(|v| v.as_i64()).unwrap_or(0),
            cache_write: tokens.get("cache_write").and_then(|v| v.as_i64()).unwrap_or(0),
            cost: 0.0,
        };

        let model = meta.get("model").and_then(|v| v.as_str());
        match model.and_then(|m| pricing.get(m).map(|p| (m, p))) {
            Some((_, price)) => {
                totals.cost = totals.input as f64 * price.input / 1_000_000.0
                    + totals.output as f64 * price.output / 1_000_000.0
                    + totals.cache_read as f64 * price.cache_read / 1_000_000.0
                    + totals.cache_write as f64 * price.cache_write / 1_000_000.0;
            }
            None => {
                if let Some(m) = model {
                    unknown.insert(m.to_string());
                }
            }
        }

        stats.totals.add(&totals);

        let day = event.event_ts.chars().take(10).collect::<String>();
        stats.by_day.entry(day).or_default().add(&totals);
        if let Some(session) = &event.session_id {
            stats.by_session.entry(session.clone()).or_default().add(&totals);
        }
        if let Some(model) = model {
            stats.by_model.entry(model.to_string()).or_default().add(&totals);
        }
    }

    stats.unknown_models = unknown.into_iter().collect();
    stats.unknown_models.sort();
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Cursor;
    use crate::store::test_support::{make_event, store_with_source};
    use crate::store::{SourceRow, StoredEvent};

    fn token_event(
        source: &SourceRow,
        seq: f64,
        message_id: &str,
        model: &str,
        input: i64,
        output: i64,
    ) -> StoredEvent {
        let mut event = make_event(source, seq, "assistant_message", "reply");
        event.meta_json = Some(
            serde_json::json!({
                "message_id": message_id,
                "model": model,
                "tokens": {"input": input, "output": output, "cache_read": 0, "cache_write": 0},
            })
            .to_string(),
        );
        event
    }

    fn pricing() -> BTreeMap<String, ModelPrice> {
        let mut map = BTreeMap::new();
        map.insert(
            "claude-opus-4-6".to_string(),
            ModelPrice {
                input: 15.0,
                output: 75.0,
                cache_read: 1.5,
                cache_write: 18.75,
            },
        );
        map
    }

    #[test]
    fn totals_and_rollups() {
        let (mut store, source) = store_with_source();
        let events = vec![
            token_event(&source, 1.0, "m1", "claude-opus-4-6", 1000, 100),
            token_event(&source, 2.0, "m2", "claude-opus-4-6", 2000, 200),
        ];
        let cursor = Cursor {
            source_id: source.source_id.clone(),
            ..Default::default()
        };
        store.commit_batch(&events, &cursor).unwrap();

        let stats = token_stats(&store, &QueryFilters::default(), &pricing()).unwrap();
        assert_eq!(stats.totals.input, 3000);
        assert_eq!(stats.totals.output, 300);
        let expected_cost = 3000.0 * 15.0 / 1e6 + 300.0 * 75.0 / 1e6;
        assert!((stats.totals.cost - expected_cost).abs() < 1e-9);
        assert_eq!(stats.by_model["claude-opus-4-6"].input, 3000);
        assert_eq!(stats.by_session["ses_test"].output, 300);
        assert_eq!(stats.by_day["2025-03-01"].input, 3000);
        assert!(stats.unknown_models.is_empty());
    }

    #[test]
    fn message_tokens_counted_once() {
        let (mut store, source) = store_with_source();
        // Two events from the same message both carrying counters.
        let events = vec![
            token_event(&source, 1.0, "m1", "claude-opus-4-6", 500, 50),
            token_event(&source, 2.0, "m1", "claude-opus-4-6", 500, 50),
        ];
        let cursor = Cursor {
            source_id: source.source_id.clone(),
            ..Default::default()
        };
        store.commit_batch(&events, &cursor).unwrap();

        let stats = token_stats(&store, &QueryFilters::default(), &pricing()).unwrap();
        assert_eq!(stats.totals.input, 500);
        assert_eq!(stats.totals.output, 50);
    }

    #[test]
    fn unknown_models_are_surfaced() {
        let (mut store, source) = store_with_source();
        let events = vec![token_event(&source, 1.0, "m1", "mystery-model", 100, 10)];
        let cursor = Cursor {
            source_id: source.source_id.clone(),
            ..Default::default()
        };
        store.commit_batch(&events, &cursor).unwrap();

        let stats = token_stats(&store, &QueryFilters::default(), &pricing()).unwrap();
        assert_eq!(stats.unknown_models, vec!["mystery-model".to_string()]);
        assert_eq!(stats.totals.input, 100);
        assert_eq!(stats.totals.cost, 0.0);
    }
}
