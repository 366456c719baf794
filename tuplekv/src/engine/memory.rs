//! An in-memory engine satisfying the `Engine` contract.
//!
//! State is a versioned ordered map: every key holds its historical
//! versions, and a transaction reads the latest version at or below its
//! read version. Transactions are optimistic: reads record conflict
//! ranges, mutations buffer locally with read-your-own-writes, and commit
//! validates the read set against writes committed since the read version,
//! failing with the retryable `not_committed` code (1020) on overlap.
//! `on_error` resets the transaction for the harness to retry.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};

use crate::engine::{
    Engine, EngineTransaction, KeySelector, MutationType, RangeBatch, RangeOptions, StreamingMode,
    RETRYABLE,
};
use crate::error::{CResult, Error};
use crate::tuple::split_versionstamp_offset;
use crate::{MAX_SIZE_KEY, MAX_SIZE_TRANSACTION, MAX_SIZE_VALUE};

/// The shared engine, cheap to clone. All state lives behind one mutex;
/// transactions take it briefly per operation and never across awaits.
#[derive(Clone, Default)]
pub struct Memory {
    shared: Arc<Mutex<Shared>>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Engine for Memory {
    type Transaction = MemoryTransaction;

    fn begin(&self) -> CResult<Self::Transaction> {
        Ok(MemoryTransaction { shared: self.shared.clone(), state: Mutex::new(TxState::default()) })
    }
}

#[derive(Default)]
struct Shared {
    /// Version of the latest committed write transaction.
    version: i64,
    /// Per-key version history, oldest first. A `None` value is a tombstone.
    data: BTreeMap<Vec<u8>, Vec<(i64, Option<Vec<u8>>)>>,
    /// Committed write ranges, for read-set validation.
    commits: Vec<(i64, Vec<(Vec<u8>, Vec<u8>)>)>,
}

impl Shared {
    fn visible(&self, key: &[u8], version: i64) -> Option<Vec<u8>> {
        let cells = self.data.get(key)?;
        cells.iter().rev().find(|(v, _)| *v <= version).and_then(|(_, value)| value.clone())
    }
}

#[derive(Default)]
struct TxState {
    read_version: Option<i64>,
    retries: u32,
    finished: bool,
    /// Read conflict ranges, as half-open byte ranges.
    reads: Vec<(Vec<u8>, Vec<u8>)>,
    /// Buffered writes; `None` clears the key.
    overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    /// Cleared ranges, masking committed state below the overlay.
    cleared: Vec<(Vec<u8>, Vec<u8>)>,
    /// Versionstamped mutations, resolved at commit once the version is known.
    stamped: Vec<(MutationType, Vec<u8>, Vec<u8>)>,
    write_bytes: usize,
}

impl TxState {
    fn pin(&mut self, shared: &Shared) -> i64 {
        *self.read_version.get_or_insert(shared.version)
    }

    fn check_live(&self) -> CResult<()> {
        if self.finished {
            return Err(Error::engine(2017));
        }
        Ok(())
    }

    /// The value this transaction observes for a key: its own buffered
    /// writes first, then the committed state at its read version.
    fn effective(&self, shared: &Shared, version: i64, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(entry) = self.overlay.get(key) {
            return entry.clone();
        }
        if self.cleared.iter().any(|(b, e)| in_range(key, b, e)) {
            return None;
        }
        shared.visible(key, version)
    }

    /// The transaction's full view of the keyspace, for range reads.
    fn view(&self, shared: &Shared, version: i64) -> BTreeMap<Vec<u8>, Vec<u8>> {
        let mut view = BTreeMap::new();
        for (key, cells) in &shared.data {
            if self.cleared.iter().any(|(b, e)| in_range(key, b, e)) {
                continue;
            }
            if let Some((_, Some(value))) = cells.iter().rev().find(|(v, _)| *v <= version) {
                view.insert(key.clone(), value.clone());
            }
        }
        for (key, entry) in &self.overlay {
            match entry {
                Some(value) => view.insert(key.clone(), value.clone()),
                None => view.remove(key),
            };
        }
        view
    }
}

pub struct MemoryTransaction {
    shared: Arc<Mutex<Shared>>,
    state: Mutex<TxState>,
}

impl EngineTransaction for MemoryTransaction {
    async fn get(&self, key: &[u8], snapshot: bool) -> CResult<Option<Vec<u8>>> {
        let shared = self.shared.lock()?;
        let mut state = self.state.lock()?;
        state.check_live()?;
        let version = state.pin(&shared);
        if !snapshot {
            let range = point_range(key);
            state.reads.push(range);
        }
        Ok(state.effective(&shared, version, key))
    }

    async fn get_range(
        &self,
        begin: &KeySelector,
        end: &KeySelector,
        options: &RangeOptions,
    ) -> CResult<RangeBatch> {
        let shared = self.shared.lock()?;
        let mut state = self.state.lock()?;
        state.check_live()?;
        let version = state.pin(&shared);

        let view = state.view(&shared, version);
        let keys: Vec<&Vec<u8>> = view.keys().collect();
        let len = keys.len() as i64;
        let begin_index = resolve(&keys, begin).clamp(0, len) as usize;
        let end_index = resolve(&keys, end).clamp(0, len) as usize;

        if !options.snapshot {
            // conservative conflict range over the selector keys
            let mut low = begin.key.clone();
            let mut high = push_zero(&end.key);
            if high < low {
                std::mem::swap(&mut low, &mut high);
            }
            state.reads.push((low, high));
        }

        if begin_index >= end_index {
            return Ok(RangeBatch::default());
        }

        let mut rows: Vec<(Vec<u8>, Vec<u8>)> = keys[begin_index..end_index]
            .iter()
            .map(|key| ((*key).clone(), view[*key].clone()))
            .collect();
        if options.reverse {
            rows.reverse();
        }

        let mut allowed = rows.len();
        if options.limit > 0 {
            allowed = allowed.min(options.limit);
        }
        let mut take = allowed.min(batch_rows(options.mode, options.iteration));
        if options.target_bytes > 0 {
            let mut bytes = 0;
            for (index, (key, value)) in rows.iter().take(take).enumerate() {
                bytes += key.len() + value.len();
                if bytes >= options.target_bytes {
                    take = index + 1;
                    break;
                }
            }
        }

        rows.truncate(take);
        Ok(RangeBatch { more: take < allowed, pairs: rows })
    }

    fn set(&self, key: &[u8], value: &[u8]) -> CResult<()> {
        let mut state = self.state.lock()?;
        state.check_live()?;
        check_key(key)?;
        if value.len() > MAX_SIZE_VALUE {
            return Err(Error::engine(2103));
        }
        state.write_bytes += key.len() + value.len();
        state.overlay.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn clear(&self, key: &[u8]) -> CResult<()> {
        let mut state = self.state.lock()?;
        state.check_live()?;
        check_key(key)?;
        state.write_bytes += key.len();
        state.overlay.insert(key.to_vec(), None);
        Ok(())
    }

    fn clear_range(&self, begin: &[u8], end: &[u8]) -> CResult<()> {
        let mut state = self.state.lock()?;
        state.check_live()?;
        if begin >= end {
            return Ok(());
        }
        state.write_bytes += begin.len() + end.len();
        let buffered: Vec<Vec<u8>> = state
            .overlay
            .range(begin.to_vec()..end.to_vec())
            .map(|(key, _)| key.clone())
            .collect();
        for key in buffered {
            state.overlay.insert(key, None);
        }
        state.cleared.push((begin.to_vec(), end.to_vec()));
        Ok(())
    }

    fn atomic_op(&self, op: MutationType, key: &[u8], param: &[u8]) -> CResult<()> {
        let shared = self.shared.lock()?;
        let mut state = self.state.lock()?;
        state.check_live()?;
        state.write_bytes += key.len() + param.len();
        match op {
            MutationType::SetVersionstampedKey | MutationType::SetVersionstampedValue => {
                state.stamped.push((op, key.to_vec(), param.to_vec()));
            }
            _ => {
                check_key(key)?;
                let version = state.pin(&shared);
                // atomic mutations read the current value without adding
                // a read conflict
                let current = state.effective(&shared, version, key);
                let next = apply_atomic(op, current.as_deref(), param);
                state.overlay.insert(key.to_vec(), Some(next));
            }
        }
        Ok(())
    }

    async fn read_version(&self) -> CResult<i64> {
        let shared = self.shared.lock()?;
        let mut state = self.state.lock()?;
        state.check_live()?;
        Ok(state.pin(&shared))
    }

    fn set_read_version(&self, version: i64) -> CResult<()> {
        let mut state = self.state.lock()?;
        state.check_live()?;
        state.read_version = Some(version);
        Ok(())
    }

    async fn estimated_size_bytes(&self, begin: &[u8], end: &[u8]) -> CResult<i64> {
        let shared = self.shared.lock()?;
        let mut state = self.state.lock()?;
        state.check_live()?;
        let version = state.pin(&shared);
        if begin >= end {
            return Ok(0);
        }
        let mut size = 0;
        for (key, cells) in shared.data.range(begin.to_vec()..end.to_vec()) {
            if let Some((_, Some(value))) = cells.iter().rev().find(|(v, _)| *v <= version) {
                size += (key.len() + value.len()) as i64;
            }
        }
        Ok(size)
    }

    async fn commit(&self) -> CResult<()> {
        let mut shared = self.shared.lock()?;
        let mut state = self.state.lock()?;
        state.check_live()?;
        if state.write_bytes > MAX_SIZE_TRANSACTION {
            return Err(Error::engine(2101));
        }

        if let Some(read_version) = state.read_version {
            for (version, writes) in shared.commits.iter().rev() {
                if *version <= read_version {
                    break;
                }
                for write in writes {
                    if state.reads.iter().any(|read| overlaps(read, write)) {
                        return Err(Error::engine(1020));
                    }
                }
            }
        }

        state.finished = true;
        if state.overlay.is_empty() && state.cleared.is_empty() && state.stamped.is_empty() {
            // read-only transactions commit without a version
            return Ok(());
        }

        shared.version += 1;
        let version = shared.version;
        let mut stamp = [0u8; 10];
        BigEndian::write_i64(&mut stamp[..8], version);

        let mut writes = Vec::new();
        for (begin, end) in &state.cleared {
            let keys: Vec<Vec<u8>> = shared
                .data
                .range(begin.clone()..end.clone())
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                if let Some(cells) = shared.data.get_mut(&key) {
                    cells.push((version, None));
                }
            }
            writes.push((begin.clone(), end.clone()));
        }
        for (key, entry) in std::mem::take(&mut state.overlay) {
            writes.push(point_range(&key));
            shared.data.entry(key).or_default().push((version, entry));
        }
        for (op, key, param) in std::mem::take(&mut state.stamped) {
            let (key, value) = match op {
                MutationType::SetVersionstampedKey => {
                    let (template, offset) = split_versionstamp_offset(&key)?;
                    let mut key = template.to_vec();
                    key[offset..offset + 10].copy_from_slice(&stamp);
                    (key, param)
                }
                MutationType::SetVersionstampedValue => {
                    let (template, offset) = split_versionstamp_offset(&param)?;
                    let mut value = template.to_vec();
                    value[offset..offset + 10].copy_from_slice(&stamp);
                    (key, value)
                }
                _ => unreachable!("only versionstamped mutations are deferred"),
            };
            check_key(&key)?;
            writes.push(point_range(&key));
            shared.data.entry(key).or_default().push((version, Some(value)));
        }
        shared.commits.push((version, writes));
        Ok(())
    }

    async fn on_error(&self, code: i32) -> CResult<()> {
        if !RETRYABLE.contains(&code) {
            return Err(Error::engine(code));
        }
        let retries = {
            let mut state = self.state.lock()?;
            let retries = state.retries + 1;
            *state = TxState { retries, ..TxState::default() };
            retries
        };
        let backoff = Duration::from_millis(1 << retries.min(6)).min(Duration::from_millis(100));
        tokio::time::sleep(backoff).await;
        Ok(())
    }
}

fn check_key(key: &[u8]) -> CResult<()> {
    if key.len() > MAX_SIZE_KEY {
        return Err(Error::engine(2102));
    }
    Ok(())
}

fn in_range(key: &[u8], begin: &[u8], end: &[u8]) -> bool {
    begin <= key && key < end
}

fn overlaps(a: &(Vec<u8>, Vec<u8>), b: &(Vec<u8>, Vec<u8>)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

fn point_range(key: &[u8]) -> (Vec<u8>, Vec<u8>) {
    (key.to_vec(), push_zero(key))
}

fn push_zero(key: &[u8]) -> Vec<u8> {
    let mut out = key.to_vec();
    out.push(0x00);
    out
}

/// Index of the key a selector points at, on the transaction's view of the
/// keyspace. May fall outside `[0, len)`; callers clamp.
fn resolve(keys: &[&Vec<u8>], selector: &KeySelector) -> i64 {
    let base = keys.partition_point(|key| {
        if selector.or_equal {
            key.as_slice() <= selector.key.as_slice()
        } else {
            key.as_slice() < selector.key.as_slice()
        }
    }) as i64
        - 1;
    base + selector.offset
}

fn batch_rows(mode: StreamingMode, iteration: usize) -> usize {
    match mode {
        StreamingMode::WantAll | StreamingMode::Serial | StreamingMode::Exact => usize::MAX,
        StreamingMode::Iterator => 256usize << iteration.saturating_sub(1).min(4),
        StreamingMode::Small => 256,
        StreamingMode::Medium => 1024,
        StreamingMode::Large => 4096,
    }
}

fn apply_atomic(op: MutationType, current: Option<&[u8]>, param: &[u8]) -> Vec<u8> {
    let Some(current) = current else {
        // a missing operand behaves as if the parameter had been stored
        return param.to_vec();
    };
    let operand = |index: usize| *current.get(index).unwrap_or(&0);
    match op {
        MutationType::Add => {
            let mut out = Vec::with_capacity(param.len());
            let mut carry = 0u16;
            for (index, byte) in param.iter().enumerate() {
                let sum = operand(index) as u16 + *byte as u16 + carry;
                out.push(sum as u8);
                carry = sum >> 8;
            }
            out
        }
        MutationType::BitAnd => param.iter().enumerate().map(|(i, b)| operand(i) & b).collect(),
        MutationType::BitOr => param.iter().enumerate().map(|(i, b)| operand(i) | b).collect(),
        MutationType::BitXor => param.iter().enumerate().map(|(i, b)| operand(i) ^ b).collect(),
        MutationType::Max | MutationType::Min => {
            // unsigned little-endian comparison at the parameter's width
            let resized: Vec<u8> = (0..param.len()).map(operand).collect();
            let current_wins = match resized.iter().rev().cmp(param.iter().rev()) {
                std::cmp::Ordering::Greater => op == MutationType::Max,
                std::cmp::Ordering::Less => op == MutationType::Min,
                std::cmp::Ordering::Equal => true,
            };
            if current_wins {
                resized
            } else {
                param.to_vec()
            }
        }
        MutationType::ByteMin => std::cmp::min(current, param).to_vec(),
        MutationType::ByteMax => std::cmp::max(current, param).to_vec(),
        MutationType::SetVersionstampedKey | MutationType::SetVersionstampedValue => {
            unreachable!("versionstamped mutations are deferred to commit")
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn pairs(batch: RangeBatch) -> Vec<(Vec<u8>, Vec<u8>)> {
        batch.pairs
    }

    async fn scan_all(tx: &MemoryTransaction, begin: &[u8], end: &[u8]) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let options = RangeOptions { mode: StreamingMode::WantAll, ..RangeOptions::default() };
        Ok(pairs(
            tx.get_range(&KeySelector::gte(begin.to_vec()), &KeySelector::gte(end.to_vec()), &options)
                .await?,
        ))
    }

    #[tokio::test]
    async fn point_ops() -> CResult<()> {
        let engine = Memory::new();

        let tx = engine.begin()?;
        assert_eq!(tx.get(b"a", false).await?, None);
        tx.set(b"a", &[1])?;
        assert_eq!(tx.get(b"a", false).await?, Some(vec![1]));
        tx.commit().await?;

        let tx = engine.begin()?;
        assert_eq!(tx.get(b"a", false).await?, Some(vec![1]));
        tx.clear(b"a")?;
        assert_eq!(tx.get(b"a", false).await?, None);
        tx.commit().await?;

        let tx = engine.begin()?;
        assert_eq!(tx.get(b"a", false).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn clear_range_masks_and_buffers() -> CResult<()> {
        let engine = Memory::new();

        let tx = engine.begin()?;
        tx.set(b"a", &[1])?;
        tx.set(b"b", &[2])?;
        tx.set(b"c", &[3])?;
        tx.commit().await?;

        let tx = engine.begin()?;
        tx.set(b"b2", &[4])?;
        tx.clear_range(b"b", b"c")?;
        assert_eq!(tx.get(b"b", false).await?, None);
        assert_eq!(tx.get(b"b2", false).await?, None);
        // a write after the clear wins over it
        tx.set(b"b3", &[5])?;
        assert_eq!(tx.get(b"b3", false).await?, Some(vec![5]));
        assert_eq!(
            scan_all(&tx, b"a", b"z").await?,
            vec![(b"a".to_vec(), vec![1]), (b"b3".to_vec(), vec![5]), (b"c".to_vec(), vec![3])],
        );
        tx.commit().await?;

        let tx = engine.begin()?;
        assert_eq!(
            scan_all(&tx, b"a", b"z").await?,
            vec![(b"a".to_vec(), vec![1]), (b"b3".to_vec(), vec![5]), (b"c".to_vec(), vec![3])],
        );
        Ok(())
    }

    #[tokio::test]
    async fn selectors() -> CResult<()> {
        let engine = Memory::new();
        let tx = engine.begin()?;
        for key in [b"a", b"b", b"c", b"d"] {
            tx.set(key, &[0])?;
        }
        tx.commit().await?;

        let tx = engine.begin()?;
        let options = RangeOptions::default();

        // [b, d)
        let batch = tx
            .get_range(&KeySelector::gte(b"b".to_vec()), &KeySelector::gte(b"d".to_vec()), &options)
            .await?;
        assert_eq!(
            batch.pairs.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            vec![b"b".to_vec(), b"c".to_vec()],
        );

        // (a, d] via gt on both ends
        let batch = tx
            .get_range(&KeySelector::gt(b"a".to_vec()), &KeySelector::gt(b"d".to_vec()), &options)
            .await?;
        assert_eq!(
            batch.pairs.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()],
        );

        // lt/lte resolve to the predecessor side
        let batch = tx
            .get_range(&KeySelector::lte(b"b".to_vec()), &KeySelector::lt(b"d".to_vec()), &options)
            .await?;
        assert_eq!(
            batch.pairs.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            vec![b"b".to_vec()],
        );

        // reverse with a limit
        let reversed = RangeOptions { reverse: true, limit: 2, ..RangeOptions::default() };
        let batch = tx
            .get_range(&KeySelector::gte(b"a".to_vec()), &KeySelector::gte(b"z".to_vec()), &reversed)
            .await?;
        assert_eq!(
            batch.pairs.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            vec![b"d".to_vec(), b"c".to_vec()],
        );
        Ok(())
    }

    #[tokio::test]
    async fn conflict_detection() -> CResult<()> {
        let engine = Memory::new();

        let tx = engine.begin()?;
        tx.set(b"a", &[1])?;
        tx.commit().await?;

        let tx1 = engine.begin()?;
        assert_eq!(tx1.get(b"a", false).await?, Some(vec![1]));

        let tx2 = engine.begin()?;
        tx2.set(b"a", &[2])?;
        tx2.commit().await?;

        tx1.set(b"b", &[1])?;
        assert_eq!(tx1.commit().await, Err(Error::engine(1020)));

        // on_error resets the transaction and the retry succeeds
        tx1.on_error(1020).await?;
        assert_eq!(tx1.get(b"a", false).await?, Some(vec![2]));
        tx1.set(b"b", &[1])?;
        tx1.commit().await?;

        // non-retryable codes surface
        let tx = engine.begin()?;
        assert_eq!(tx.on_error(2102).await, Err(Error::engine(2102)));
        Ok(())
    }

    #[tokio::test]
    async fn snapshot_reads_do_not_conflict() -> CResult<()> {
        let engine = Memory::new();

        let tx1 = engine.begin()?;
        assert_eq!(tx1.get(b"a", true).await?, None);

        let tx2 = engine.begin()?;
        tx2.set(b"a", &[2])?;
        tx2.commit().await?;

        tx1.set(b"b", &[1])?;
        tx1.commit().await?;
        Ok(())
    }

    #[tokio::test]
    async fn write_only_transactions_never_conflict() -> CResult<()> {
        let engine = Memory::new();

        let tx1 = engine.begin()?;
        tx1.set(b"a", &[1])?;
        let tx2 = engine.begin()?;
        tx2.set(b"a", &[2])?;
        tx2.commit().await?;
        tx1.commit().await?;

        let tx = engine.begin()?;
        assert_eq!(tx.get(b"a", false).await?, Some(vec![1]));
        Ok(())
    }

    #[tokio::test]
    async fn atomic_mutations() -> CResult<()> {
        let engine = Memory::new();

        let tx = engine.begin()?;
        tx.atomic_op(MutationType::Add, b"n", &[1, 0])?;
        tx.atomic_op(MutationType::Add, b"n", &[0xff, 0])?;
        assert_eq!(tx.get(b"n", false).await?, Some(vec![0x00, 0x01]));

        tx.set(b"m", &[0b1100])?;
        tx.atomic_op(MutationType::BitAnd, b"m", &[0b1010])?;
        assert_eq!(tx.get(b"m", false).await?, Some(vec![0b1000]));
        tx.atomic_op(MutationType::BitOr, b"m", &[0b0001])?;
        assert_eq!(tx.get(b"m", false).await?, Some(vec![0b1001]));
        tx.atomic_op(MutationType::BitXor, b"m", &[0b1111])?;
        assert_eq!(tx.get(b"m", false).await?, Some(vec![0b0110]));

        tx.set(b"x", &[5, 1])?;
        tx.atomic_op(MutationType::Max, b"x", &[0, 2])?;
        assert_eq!(tx.get(b"x", false).await?, Some(vec![0, 2]));
        tx.atomic_op(MutationType::Min, b"x", &[1, 1])?;
        assert_eq!(tx.get(b"x", false).await?, Some(vec![1, 1]));

        tx.set(b"y", &[2])?;
        tx.atomic_op(MutationType::ByteMax, b"y", &[1, 9])?;
        assert_eq!(tx.get(b"y", false).await?, Some(vec![2]));
        tx.atomic_op(MutationType::ByteMin, b"y", &[1, 9])?;
        assert_eq!(tx.get(b"y", false).await?, Some(vec![1, 9]));
        Ok(())
    }

    #[tokio::test]
    async fn versionstamped_keys() -> CResult<()> {
        let engine = Memory::new();

        let tx = engine.begin()?;
        // key template: prefix byte, 10-byte placeholder, then the
        // little-endian offset of the placeholder
        let mut template = vec![0x07];
        template.extend_from_slice(&[0xff; 10]);
        template.extend_from_slice(&1u32.to_le_bytes());
        tx.atomic_op(MutationType::SetVersionstampedKey, &template, b"payload")?;
        tx.commit().await?;

        let tx = engine.begin()?;
        let rows = scan_all(&tx, &[0x07], &[0x08]).await?;
        assert_eq!(rows.len(), 1);
        let (key, value) = &rows[0];
        assert_eq!(value, b"payload");
        assert_eq!(key.len(), 11);
        let mut version = [0u8; 10];
        BigEndian::write_i64(&mut version[..8], 1);
        assert_eq!(&key[1..], &version);
        Ok(())
    }

    #[tokio::test]
    async fn size_limits() -> CResult<()> {
        let engine = Memory::new();
        let tx = engine.begin()?;
        assert_eq!(tx.set(&vec![0; MAX_SIZE_KEY + 1], &[1]), Err(Error::engine(2102)));
        assert_eq!(tx.set(b"k", &vec![0; MAX_SIZE_VALUE + 1]), Err(Error::engine(2103)));
        tx.set(b"k", &vec![0; MAX_SIZE_VALUE])?;
        Ok(())
    }

    #[tokio::test]
    async fn versions_and_estimates() -> CResult<()> {
        let engine = Memory::new();

        let tx = engine.begin()?;
        let before = tx.read_version().await?;
        tx.set(b"a", &vec![7; 100])?;
        tx.commit().await?;

        // read-only commits do not bump the version
        let tx = engine.begin()?;
        let after = tx.read_version().await?;
        assert_eq!(after, before + 1);
        tx.commit().await?;

        let tx = engine.begin()?;
        assert_eq!(tx.read_version().await?, after);
        let size = tx.estimated_size_bytes(b"", b"\xff").await?;
        assert_eq!(size, 101);
        Ok(())
    }
}
