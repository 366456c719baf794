//! P-store: an inverted-index search store.
//!
//! Token strings are interned to uids through a small two-column N-store,
//! postings record which documents mention a token, and a compressed
//! counter blob per document records how often each token occurs.
//! Retrieval scans a single posting list, the one with the smallest
//! estimated size among the query's tokens, then re-checks every candidate
//! against its counter so results only ever contain documents matching
//! all keywords.

use std::collections::{BTreeMap, HashMap};

use rand::seq::SliceRandom;
use uuid::Uuid;

use crate::db::{range, Transaction};
use crate::engine::Engine;
use crate::error::{CResult, Error};
use crate::nstore::{binding, val, var, Bindings, NStore};
use crate::tuple::{next_prefix, pack, unpack, Value};

/// Environment variable capping the number of candidates scored per
/// search; a seed posting list larger than this is sampled down.
pub const SAMPLE_COUNT_VAR: &str = "TUPLEKV_PSTORE_SAMPLE_COUNT";

const DEFAULT_SAMPLE_COUNT: usize = 1337;

fn sample_count() -> usize {
    std::env::var(SAMPLE_COUNT_VAR)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(DEFAULT_SAMPLE_COUNT)
}

/// An inverted-index store under a keyspace prefix.
pub struct PStore {
    name: String,
    /// string token <-> token uid, both directions queryable
    tokens: NStore,
    prefix_index: Vec<Value>,
    prefix_counters: Vec<Value>,
}

impl PStore {
    pub fn new(name: &str, prefix: &[Value]) -> Self {
        let mut prefix_tokens = prefix.to_vec();
        prefix_tokens.push(Value::Bytes(vec![0x01]));
        let mut prefix_index = prefix.to_vec();
        prefix_index.push(Value::Bytes(vec![0x02]));
        let mut prefix_counters = prefix.to_vec();
        prefix_counters.push(Value::Bytes(vec![0x03]));
        PStore {
            name: name.to_string(),
            tokens: NStore::new(&format!("{}/tokens", name), &prefix_tokens, 2),
            prefix_index,
            prefix_counters,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn posting_prefix(&self, token: Uuid) -> Vec<u8> {
        pack(&[Value::Tuple(self.prefix_index.clone()), token.into()])
    }

    fn counter_key(&self, document: &Value) -> Vec<u8> {
        pack(&[Value::Tuple(self.prefix_counters.clone()), document.clone()])
    }

    /// The interned uid for a token string, if it has one.
    async fn token<E: Engine>(&self, tx: &Transaction<E>, string: &str) -> CResult<Option<Uuid>> {
        let mut select = self.tokens.select(tx, &[val(string), var("uid")], Bindings::new())?;
        match select.next().await? {
            Some(bindings) => Ok(Some(binding(&bindings, "uid")?.as_uuid()?)),
            None => Ok(None),
        }
    }

    /// Indexes a document: interns unseen tokens, overwrites the
    /// document's counter blob and writes one posting per token.
    pub async fn index<E: Engine>(
        &self,
        tx: &Transaction<E>,
        document: &Value,
        counter: &HashMap<String, i64>,
    ) -> CResult<()> {
        let mut counts: BTreeMap<Uuid, i64> = BTreeMap::new();
        for (string, count) in counter {
            let token = match self.token(tx, string).await? {
                Some(token) => token,
                None => {
                    let token = Uuid::new_v4();
                    self.tokens.add(tx, &[string.as_str().into(), token.into()], b"")?;
                    token
                }
            };
            counts.insert(token, *count);
        }

        let pairs: Vec<Value> = counts
            .iter()
            .map(|(token, count)| Value::Tuple(vec![(*token).into(), (*count).into()]))
            .collect();
        tx.set(&self.counter_key(document), &zstd::encode_all(&pack(&pairs)[..], 0)?)?;

        for token in counts.keys() {
            let key =
                pack(&[Value::Tuple(self.prefix_index.clone()), (*token).into(), document.clone()]);
            tx.set(&key, b"")?;
        }
        Ok(())
    }

    /// Ranked retrieval: documents matching every keyword, highest
    /// summed count first, at most `limit` of them. Unknown keywords
    /// short-circuit to an empty result.
    pub async fn search<E: Engine>(
        &self,
        tx: &Transaction<E>,
        keywords: &[&str],
        limit: usize,
    ) -> CResult<Vec<(Value, i64)>> {
        let mut tokens = Vec::with_capacity(keywords.len());
        for keyword in keywords {
            match self.token(tx, keyword).await? {
                Some(token) => tokens.push(token),
                // an unknown keyword has no postings, so nothing matches
                None => return Ok(Vec::new()),
            }
        }
        let Some(mut seed) = tokens.first().copied() else {
            return Ok(Vec::new());
        };

        // the smallest posting list drives the scan
        let mut smallest = i64::MAX;
        for token in &tokens {
            let start = self.posting_prefix(*token);
            let size = tx.estimated_size_bytes(&start, &next_prefix(&start)?).await?;
            if size < smallest {
                smallest = size;
                seed = *token;
            }
        }

        let start = self.posting_prefix(seed);
        let mut scan = range(tx, start.clone(), next_prefix(&start)?);
        let mut candidates = Vec::new();
        while let Some((key, _)) = scan.next().await? {
            let mut values = unpack(&key)?;
            if values.len() != 3 {
                return Err(Error::InvalidData(format!(
                    "{}: malformed posting key",
                    self.name
                )));
            }
            candidates.push(values.swap_remove(2));
        }

        // bound the scoring work for very common seed tokens
        let cap = sample_count();
        if candidates.len() >= cap {
            let mut rng = rand::thread_rng();
            let sampled: Vec<Value> = candidates.choose_multiple(&mut rng, cap).cloned().collect();
            candidates = sampled;
        }

        let mut hits = Vec::new();
        'candidates: for candidate in candidates {
            let blob = tx.get(&self.counter_key(&candidate)).await?.ok_or_else(|| {
                Error::InvalidData(format!(
                    "{}: counter should be in database: document={:?}",
                    self.name, candidate
                ))
            })?;
            let counts = decode_counter(&zstd::decode_all(&blob[..])?)?;
            let mut score = 0;
            for token in &tokens {
                match counts.get(token) {
                    Some(count) => score += count,
                    None => continue 'candidates,
                }
            }
            hits.push((candidate, score));
        }

        hits.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(limit);
        Ok(hits)
    }
}

fn decode_counter(packed: &[u8]) -> CResult<BTreeMap<Uuid, i64>> {
    let mut out = BTreeMap::new();
    for value in unpack(packed)? {
        let Value::Tuple(pair) = value else {
            return Err(Error::InvalidData("malformed counter entry".to_string()));
        };
        match pair.as_slice() {
            [token, count] => out.insert(token.as_uuid()?, count.as_int()?),
            _ => return Err(Error::InvalidData("malformed counter entry".to_string())),
        };
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::{open, transactional, Database};
    use crate::engine::memory::Memory;

    fn counter(pairs: &[(&str, i64)]) -> HashMap<String, i64> {
        pairs.iter().map(|(token, count)| (token.to_string(), *count)).collect()
    }

    async fn seed_documents(db: &Database<Memory>, store: &PStore) -> CResult<()> {
        transactional(db, async |tx: &Transaction<Memory>| {
            store
                .index(
                    tx,
                    &Value::Int(0),
                    &counter(&[("foundationdb", 1), ("okvs", 2), ("database", 42)]),
                )
                .await?;
            store
                .index(tx, &Value::Int(1), &counter(&[("sqlite", 1), ("sql", 2), ("database", 3)]))
                .await?;
            store.index(tx, &Value::Int(2), &counter(&[("spam", 42)])).await
        })
        .await
    }

    #[tokio::test]
    async fn scored_retrieval() -> CResult<()> {
        let db = open("pstore-search")?;
        let store = PStore::new("search", &[Value::Text("search".to_string())]);
        seed_documents(&db, &store).await?;

        let search = async |keywords: Vec<&str>| {
            transactional(&db, async |tx: &Transaction<Memory>| {
                store.search(tx, &keywords, 10).await
            })
            .await
        };

        assert_eq!(search(vec!["foundationdb"]).await?, vec![(Value::Int(0), 1)]);
        assert_eq!(search(vec!["spam"]).await?, vec![(Value::Int(2), 42)]);
        assert_eq!(
            search(vec!["database"]).await?,
            vec![(Value::Int(0), 42), (Value::Int(1), 3)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn all_keywords_must_match() -> CResult<()> {
        let db = open("pstore-precision")?;
        let store = PStore::new("precision", &[Value::Text("precision".to_string())]);
        seed_documents(&db, &store).await?;

        let out = transactional(&db, async |tx: &Transaction<Memory>| {
            store.search(tx, &["database", "okvs"], 10).await
        })
        .await?;
        // document 1 has "database" but not "okvs", so only 0 scores
        assert_eq!(out, vec![(Value::Int(0), 44)]);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_keywords_return_nothing() -> CResult<()> {
        let db = open("pstore-unknown")?;
        let store = PStore::new("unknown", &[Value::Text("unknown".to_string())]);
        seed_documents(&db, &store).await?;

        let out = transactional(&db, async |tx: &Transaction<Memory>| {
            store.search(tx, &["database", "nosuchtoken"], 10).await
        })
        .await?;
        assert_eq!(out, Vec::new());
        Ok(())
    }

    #[tokio::test]
    async fn limit_caps_results() -> CResult<()> {
        let db = open("pstore-limit")?;
        let store = PStore::new("limit", &[Value::Text("limit".to_string())]);
        seed_documents(&db, &store).await?;

        let out = transactional(&db, async |tx: &Transaction<Memory>| {
            store.search(tx, &["database"], 1).await
        })
        .await?;
        assert_eq!(out, vec![(Value::Int(0), 42)]);
        Ok(())
    }

    #[tokio::test]
    async fn reindexing_overwrites_the_counter() -> CResult<()> {
        let db = open("pstore-reindex")?;
        let store = PStore::new("reindex", &[Value::Text("reindex".to_string())]);
        transactional(&db, async |tx: &Transaction<Memory>| {
            store.index(tx, &Value::Int(9), &counter(&[("alpha", 1)])).await
        })
        .await?;
        transactional(&db, async |tx: &Transaction<Memory>| {
            store.index(tx, &Value::Int(9), &counter(&[("alpha", 5), ("beta", 2)])).await
        })
        .await?;

        let out = transactional(&db, async |tx: &Transaction<Memory>| {
            store.search(tx, &["alpha", "beta"], 10).await
        })
        .await?;
        assert_eq!(out, vec![(Value::Int(9), 7)]);
        Ok(())
    }

    #[test]
    #[serial_test::serial]
    fn sample_count_reads_environment() {
        std::env::remove_var(SAMPLE_COUNT_VAR);
        assert_eq!(sample_count(), DEFAULT_SAMPLE_COUNT);
        std::env::set_var(SAMPLE_COUNT_VAR, "5");
        assert_eq!(sample_count(), 5);
        std::env::set_var(SAMPLE_COUNT_VAR, "not-a-number");
        assert_eq!(sample_count(), DEFAULT_SAMPLE_COUNT);
        std::env::remove_var(SAMPLE_COUNT_VAR);
    }
}
