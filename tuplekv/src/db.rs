//! Engine adapter and transaction harness.
//!
//! `Database` hands out `Transaction`s; `transactional` drives a body
//! through the engine's retry protocol; `Range` is the lazy batched range
//! scan every store is built on. A transaction also carries a keyed `vars`
//! map (lifetime of the transaction) that higher layers use to stash
//! context across nested calls and retries.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};

use log::debug;

use crate::engine::memory::Memory;
use crate::engine::{Engine, EngineTransaction, KeySelector, MutationType, RangeOptions};
use crate::error::{CResult, Error};
use crate::tuple::Value;

/// A handle to an engine, shared and cheap to clone.
pub struct Database<E: Engine> {
    engine: Arc<E>,
}

impl<E: Engine> Clone for Database<E> {
    fn clone(&self) -> Self {
        Database { engine: self.engine.clone() }
    }
}

impl<E: Engine> Database<E> {
    pub fn new(engine: E) -> Self {
        Database { engine: Arc::new(engine) }
    }

    pub fn begin(&self) -> CResult<Transaction<E>> {
        Ok(Transaction { inner: self.engine.begin()?, vars: Mutex::new(HashMap::new()) })
    }
}

/// Process-wide cache of named in-memory databases, created once under a
/// mutex and shared by configuration key.
static DATABASES: OnceLock<Mutex<HashMap<String, Database<Memory>>>> = OnceLock::new();

/// Opens the in-memory database registered under `name`, creating it on
/// first use. Every caller passing the same name shares one keyspace.
pub fn open(name: &str) -> CResult<Database<Memory>> {
    let mut cache = DATABASES.get_or_init(|| Mutex::new(HashMap::new())).lock()?;
    Ok(cache.entry(name.to_string()).or_insert_with(|| Database::new(Memory::new())).clone())
}

/// One interactive transaction. Mutations buffer locally until `commit`;
/// reads observe the transaction's read version plus its own writes.
pub struct Transaction<E: Engine> {
    inner: E::Transaction,
    vars: Mutex<HashMap<String, Value>>,
}

impl<E: Engine> Transaction<E> {
    pub async fn get(&self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        self.inner.get(key, false).await
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> CResult<()> {
        self.inner.set(key, value)
    }

    pub fn clear(&self, key: &[u8]) -> CResult<()> {
        self.inner.clear(key)
    }

    pub fn clear_range(&self, begin: &[u8], end: &[u8]) -> CResult<()> {
        self.inner.clear_range(begin, end)
    }

    pub fn atomic_op(&self, op: MutationType, key: &[u8], param: &[u8]) -> CResult<()> {
        self.inner.atomic_op(op, key, param)
    }

    pub fn add(&self, key: &[u8], param: &[u8]) -> CResult<()> {
        self.atomic_op(MutationType::Add, key, param)
    }

    pub fn bit_and(&self, key: &[u8], param: &[u8]) -> CResult<()> {
        self.atomic_op(MutationType::BitAnd, key, param)
    }

    pub fn bit_or(&self, key: &[u8], param: &[u8]) -> CResult<()> {
        self.atomic_op(MutationType::BitOr, key, param)
    }

    pub fn bit_xor(&self, key: &[u8], param: &[u8]) -> CResult<()> {
        self.atomic_op(MutationType::BitXor, key, param)
    }

    pub fn max(&self, key: &[u8], param: &[u8]) -> CResult<()> {
        self.atomic_op(MutationType::Max, key, param)
    }

    pub fn min(&self, key: &[u8], param: &[u8]) -> CResult<()> {
        self.atomic_op(MutationType::Min, key, param)
    }

    pub fn byte_min(&self, key: &[u8], param: &[u8]) -> CResult<()> {
        self.atomic_op(MutationType::ByteMin, key, param)
    }

    pub fn byte_max(&self, key: &[u8], param: &[u8]) -> CResult<()> {
        self.atomic_op(MutationType::ByteMax, key, param)
    }

    pub fn set_versionstamped_key(&self, key: &[u8], param: &[u8]) -> CResult<()> {
        self.atomic_op(MutationType::SetVersionstampedKey, key, param)
    }

    pub fn set_versionstamped_value(&self, key: &[u8], param: &[u8]) -> CResult<()> {
        self.atomic_op(MutationType::SetVersionstampedValue, key, param)
    }

    pub async fn read_version(&self) -> CResult<i64> {
        self.inner.read_version().await
    }

    pub fn set_read_version(&self, version: i64) -> CResult<()> {
        self.inner.set_read_version(version)
    }

    pub async fn estimated_size_bytes(&self, begin: &[u8], end: &[u8]) -> CResult<i64> {
        self.inner.estimated_size_bytes(begin, end).await
    }

    pub async fn commit(&self) -> CResult<()> {
        self.inner.commit().await
    }

    pub async fn on_error(&self, code: i32) -> CResult<()> {
        self.inner.on_error(code).await
    }

    /// Stashes a transaction-scoped variable. Survives retries, since the
    /// harness reuses the transaction across them.
    pub fn var_set(&self, name: &str, value: Value) -> CResult<()> {
        self.vars.lock()?.insert(name.to_string(), value);
        Ok(())
    }

    pub fn var_get(&self, name: &str) -> CResult<Option<Value>> {
        Ok(self.vars.lock()?.get(name).cloned())
    }
}

/// Runs `body` in a fresh transaction, committing on success and retrying
/// from scratch whenever the engine reports a recoverable error. Fatal
/// errors, and engine errors `on_error` refuses, surface to the caller.
///
/// The body must be idempotent: a retry re-executes it in full. Nested
/// operations compose by taking the live `&Transaction` directly, which
/// runs them exactly once inside the enclosing retry loop.
pub async fn transactional<E, F, T>(db: &Database<E>, body: F) -> CResult<T>
where
    E: Engine,
    F: AsyncFn(&Transaction<E>) -> CResult<T>,
{
    let tx = db.begin()?;
    loop {
        let err = match body(&tx).await {
            Ok(out) => match tx.commit().await {
                Ok(()) => return Ok(out),
                Err(err) => err,
            },
            Err(err) => err,
        };
        match err {
            Error::Engine { code, message } => {
                debug!("retrying transaction after engine error {}: {}", code, message);
                if tx.on_error(code).await.is_err() {
                    return Err(Error::Engine { code, message });
                }
            }
            err => return Err(err),
        }
    }
}

/// A lazy range scan: each suspension fetches one batch from the engine,
/// continuing from the last key seen. Keys and values are owned copies.
pub struct Range<'a, E: Engine> {
    tx: &'a Transaction<E>,
    begin: KeySelector,
    end: KeySelector,
    options: RangeOptions,
    buffer: VecDeque<(Vec<u8>, Vec<u8>)>,
    exhausted: bool,
}

/// Scans between two packed keys, in one keyspace order or the other.
/// `start <= end` scans `[start, end)` ascending; `start > end` scans
/// `(end, start]` descending, so the greater endpoint is included and the
/// lesser excluded.
pub fn range<'a, E: Engine>(
    tx: &'a Transaction<E>,
    start: Vec<u8>,
    end: Vec<u8>,
) -> Range<'a, E> {
    if start <= end {
        range_selectors(tx, KeySelector::gte(start), KeySelector::gte(end), RangeOptions::default())
    } else {
        let options = RangeOptions { reverse: true, ..RangeOptions::default() };
        range_selectors(tx, KeySelector::gt(end), KeySelector::gt(start), options)
    }
}

/// Scans between two explicit key selectors with full control over limit,
/// streaming mode, snapshot isolation and direction.
pub fn range_selectors<'a, E: Engine>(
    tx: &'a Transaction<E>,
    begin: KeySelector,
    end: KeySelector,
    options: RangeOptions,
) -> Range<'a, E> {
    Range { tx, begin, end, options, buffer: VecDeque::new(), exhausted: false }
}

impl<'a, E: Engine> Range<'a, E> {
    /// The next key-value pair, fetching a batch when the buffer runs dry.
    pub async fn next(&mut self) -> CResult<Option<(Vec<u8>, Vec<u8>)>> {
        if let Some(pair) = self.buffer.pop_front() {
            return Ok(Some(pair));
        }
        if self.exhausted {
            return Ok(None);
        }

        let batch = self.tx.inner.get_range(&self.begin, &self.end, &self.options).await?;
        self.options.iteration += 1;
        let last = match batch.pairs.last() {
            Some((key, _)) => key.clone(),
            None => {
                self.exhausted = true;
                return Ok(None);
            }
        };
        // continue strictly past what this batch covered
        if self.options.reverse {
            self.end = KeySelector::gte(last);
        } else {
            self.begin = KeySelector::gt(last);
        }
        if self.options.limit > 0 {
            self.options.limit -= batch.pairs.len().min(self.options.limit);
            if self.options.limit == 0 {
                self.exhausted = true;
            }
        }
        if !batch.more {
            self.exhausted = true;
        }
        self.buffer.extend(batch.pairs);
        Ok(self.buffer.pop_front())
    }

    /// Drains the scan into a vector.
    pub async fn collect(mut self) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        while let Some(pair) = self.next().await? {
            out.push(pair);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::tuple::{next_prefix, pack, unpack};

    fn number_key(number: i64) -> Vec<u8> {
        pack(&[Value::Int(number)])
    }

    fn number_value(number: i64) -> Vec<u8> {
        pack(&[Value::Text(number.to_string())])
    }

    async fn populate(db: &Database<Memory>, count: i64) -> CResult<()> {
        transactional(db, async |tx: &Transaction<Memory>| {
            for number in 0..count {
                tx.set(&number_key(number), &number_value(number))?;
            }
            Ok(())
        })
        .await
    }

    #[tokio::test]
    async fn scan_forward() -> CResult<()> {
        let db = open("db-scan-forward")?;
        populate(&db, 10).await?;

        let rows = transactional(&db, async |tx: &Transaction<Memory>| {
            range(tx, number_key(1), number_key(8)).collect().await
        })
        .await?;

        let keys: CResult<Vec<i64>> =
            rows.iter().map(|(key, _)| unpack(key)?[0].as_int()).collect();
        assert_eq!(keys?, (1..8).collect::<Vec<_>>());
        for (number, (_, value)) in (1..8).zip(&rows) {
            assert_eq!(unpack(value)?[0].as_text()?, number.to_string());
        }
        Ok(())
    }

    #[tokio::test]
    async fn scan_reverse() -> CResult<()> {
        let db = open("db-scan-reverse")?;
        populate(&db, 11).await?;

        // descending from 8 down to, but not including, 4
        let rows = transactional(&db, async |tx: &Transaction<Memory>| {
            range(tx, number_key(8), number_key(4)).collect().await
        })
        .await?;

        let keys: CResult<Vec<i64>> =
            rows.iter().map(|(key, _)| unpack(key)?[0].as_int()).collect();
        assert_eq!(keys?, vec![8, 7, 6, 5]);
        Ok(())
    }

    #[tokio::test]
    async fn scan_prefix_bound() -> CResult<()> {
        let db = open("db-scan-prefix")?;
        transactional(&db, async |tx: &Transaction<Memory>| {
            tx.set(b"\x00\x01", &pack(&[Value::Int(1)]))?;
            tx.set(b"\x00\x02", &pack(&[Value::Int(2)]))?;
            tx.set(b"\x00\x03", &pack(&[Value::Int(3)]))?;
            tx.set(b"\x01\x42", &pack(&[Value::Int(42)]))?;
            Ok(())
        })
        .await?;

        let everything = transactional(&db, async |tx: &Transaction<Memory>| {
            range(tx, b"".to_vec(), b"\xff".to_vec()).collect().await
        })
        .await?;
        assert_eq!(everything.len(), 4);

        let under_zero = transactional(&db, async |tx: &Transaction<Memory>| {
            range(tx, b"\x00".to_vec(), next_prefix(b"\x00")?).collect().await
        })
        .await?;
        assert_eq!(under_zero.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn retries_conflicts() -> CResult<()> {
        let db = open("db-retries")?;
        transactional(&db, async |tx: &Transaction<Memory>| tx.set(b"k", b"0")).await?;

        let attempts = AtomicUsize::new(0);
        let out = transactional(&db, async |tx: &Transaction<Memory>| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            let seen = tx.get(b"k").await?;
            if attempt == 0 {
                // a competing writer invalidates our read before we commit
                let other = db.begin()?;
                other.set(b"k", b"1")?;
                other.commit().await?;
            }
            tx.set(b"done", b"yes")?;
            Ok(seen)
        })
        .await?;

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(out, Some(b"1".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn fatal_errors_bypass_retry() -> CResult<()> {
        let db = open("db-fatal")?;
        let attempts = AtomicUsize::new(0);
        let out: CResult<()> = transactional(&db, async |_tx: &Transaction<Memory>| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::InvalidInput("nope".to_string()))
        })
        .await;
        assert_eq!(out, Err(Error::InvalidInput("nope".to_string())));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn read_version_and_vars() -> CResult<()> {
        let db = open("db-misc")?;
        transactional(&db, async |tx: &Transaction<Memory>| {
            assert!(tx.read_version().await? >= 0);
            tx.var_set("who", Value::Text("me".to_string()))?;
            assert_eq!(tx.var_get("who")?, Some(Value::Text("me".to_string())));
            assert_eq!(tx.var_get("nobody")?, None);
            Ok(())
        })
        .await
    }

    #[tokio::test]
    async fn atomic_helpers() -> CResult<()> {
        let db = open("db-atomic")?;
        transactional(&db, async |tx: &Transaction<Memory>| {
            tx.add(b"n", &1i64.to_le_bytes())?;
            tx.add(b"n", &41i64.to_le_bytes())?;
            tx.byte_max(b"b", b"aa")?;
            tx.byte_max(b"b", b"ab")?;
            Ok(())
        })
        .await?;
        transactional(&db, async |tx: &Transaction<Memory>| {
            assert_eq!(tx.get(b"n").await?, Some(42i64.to_le_bytes().to_vec()));
            assert_eq!(tx.get(b"b").await?, Some(b"ab".to_vec()));
            Ok(())
        })
        .await
    }
}
