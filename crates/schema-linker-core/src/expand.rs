//! Foreign-key graph expansion.
//!
//! Joins usually need tables the query never names: "total sales per
//! customer" retrieves `orders` but the join needs `customers`. Expansion
//! walks the declared foreign keys outward from the retrieved tables for a
//! bounded number of hops. Edges are followed in both directions.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::schema::SchemaGraph;

/// Undirected table adjacency built once from a [`SchemaGraph`].
#[derive(Debug, Clone, Default)]
pub struct ForeignKeyExpander {
    adjacency: BTreeMap<String, BTreeSet<String>>,
}

impl ForeignKeyExpander {
    pub fn new(graph: &SchemaGraph) -> Self {
        let mut adjacency: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for fk in graph.foreign_keys() {
            adjacency
                .entry(fk.table.clone())
                .or_default()
                .insert(fk.referenced_table.clone());
            adjacency
                .entry(fk.referenced_table.clone())
                .or_default()
                .insert(fk.table.clone());
        }
        Self { adjacency }
    }

    pub fn neighbors(&self, table: &str) -> impl Iterator<Item = &str> {
        self.adjacency
            .get(table)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Breadth-first distances from the seed set, up to `max_hops`.
    ///
    /// Seeds are at distance 0. A table is reported at the first hop that
    /// reaches it.
    pub fn hop_distances<'a, I>(&self, seeds: I, max_hops: usize) -> BTreeMap<String, usize>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut distances: BTreeMap<String, usize> = BTreeMap::new();
        let mut frontier: VecDeque<String> = VecDeque::new();
        for seed in seeds {
            if distances.insert(seed.clone(), 0).is_none() {
                frontier.push_back(seed.clone());
            }
        }

        while let Some(table) = frontier.pop_front() {
            let hop = distances[&table];
            if hop >= max_hops {
                continue;
            }
            for next in self.neighbors(&table) {
                if !distances.contains_key(next) {
                    distances.insert(next.to_string(), hop + 1);
                    frontier.push_back(next.to_string());
                }
            }
        }

        distances
    }

    /// Seed tables plus every table within `max_hops` foreign-key hops.
    pub fn expand(&self, seeds: &BTreeSet<String>, max_hops: usize) -> BTreeSet<String> {
        self.hop_distances(seeds, max_hops).into_keys().collect()
    }
}

/// Expand `seeds` over the foreign keys of `graph`.
///
/// `max_hops = 0` returns exactly the seed set.
pub fn expand(seeds: &BTreeSet<String>, graph: &SchemaGraph, max_hops: usize) -> BTreeSet<String> {
    ForeignKeyExpander::new(graph).expand(seeds, max_hops)
}
