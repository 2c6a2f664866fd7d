//! Stats command implementation

use anyhow::Result;
use std::collections::BTreeMap;

use super::FilterArgs;
use crate::config::Config;
use crate::store::Store;
use crate::tokens::{token_stats, TokenTotals};

pub fn run(store: &Store, config: &Config, filters: &FilterArgs, by: &str) -> Result<()> {
    let pricing: BTreeMap<String, crate::config::ModelPrice> =
        config.pricing.clone().into_iter().collect();
    let stats = token_stats(store, &filters.to_query(), &pricing)?;

    println!("Totals");
    print_row("all", &stats.totals);

    let rollup = match by {
        "day" => &stats.by_day,
        "session" => &stats.by_session,
        _ => &stats.by_model,
    };
    if !rollup.is_empty() {
        println!("\nBy {by}");
        for (key, totals) in rollup {
            print_row(key, totals);
        }
    }

    if !stats.unknown_models.is_empty() {
        println!(
            "\n⚠ No pricing for: {} (add them under `pricing:` in recall.yaml)",
            stats.unknown_models.join(", ")
        );
    }
    Ok(())
}

fn print_row(label: &str, totals: &TokenTotals) {
    println!(
        "  {:<28} in {:>10}  out {:>9}  cache r/w {:>9}/{:<9} ${:.4}",
        label, totals.input, totals.output, totals.cache_read, totals.cache_write, totals.cost
    );
}
