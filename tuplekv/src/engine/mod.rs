//! The contract the layered stores consume from an ordered transactional
//! key-value engine, and an in-memory implementation of it.
//!
//! The engine owns persistence, serializability and conflict detection;
//! everything above it only assumes this trait surface: snapshot reads,
//! buffered mutations, atomic commits, key-selector range reads, atomic
//! mutations, range size estimation and retryable error codes recovered
//! through `on_error`.

pub mod memory;

use crate::error::CResult;

/// Engine status codes the transaction harness may recover from by
/// resetting the transaction and retrying the body.
pub const RETRYABLE: &[i32] = &[1007, 1009, 1020, 1021];

/// Batch sizing hints for range reads. `Iterator` grows batches across
/// successive iterations of the same scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamingMode {
    WantAll = -2,
    Iterator = -1,
    Exact = 0,
    Small = 1,
    Medium = 2,
    Large = 3,
    Serial = 4,
}

/// Atomic mutation opcodes. Integer operands are little-endian two's
/// complement; the versionstamped pair splices the 10-byte commit stamp
/// into the key or value at a trailing 4-byte little-endian offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationType {
    Add = 2,
    BitAnd = 6,
    BitOr = 7,
    BitXor = 8,
    Max = 12,
    Min = 13,
    SetVersionstampedKey = 14,
    SetVersionstampedValue = 15,
    ByteMin = 16,
    ByteMax = 17,
}

/// A displacement specification resolved by the engine to a concrete key:
/// the key `offset` positions past the last key that is less than
/// (or equal to, when `or_equal`) the reference key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySelector {
    pub key: Vec<u8>,
    pub or_equal: bool,
    pub offset: i64,
}

impl KeySelector {
    /// The last key strictly before `key`.
    pub fn lt(key: Vec<u8>) -> Self {
        KeySelector { key, or_equal: false, offset: 0 }
    }

    /// The last key at or before `key`.
    pub fn lte(key: Vec<u8>) -> Self {
        KeySelector { key, or_equal: true, offset: 0 }
    }

    /// The first key strictly after `key`.
    pub fn gt(key: Vec<u8>) -> Self {
        KeySelector { key, or_equal: true, offset: 1 }
    }

    /// The first key at or after `key`.
    pub fn gte(key: Vec<u8>) -> Self {
        KeySelector { key, or_equal: false, offset: 1 }
    }
}

/// Options for one `get_range` call.
#[derive(Clone, Debug)]
pub struct RangeOptions {
    /// Maximum rows for the whole scan; 0 means unlimited.
    pub limit: usize,
    /// Soft byte budget per batch; 0 means engine default.
    pub target_bytes: usize,
    pub mode: StreamingMode,
    /// 1-based batch counter, fed back on each continuation.
    pub iteration: usize,
    /// Snapshot reads skip read-conflict tracking.
    pub snapshot: bool,
    pub reverse: bool,
}

impl Default for RangeOptions {
    fn default() -> Self {
        RangeOptions {
            limit: 0,
            target_bytes: 0,
            mode: StreamingMode::Iterator,
            iteration: 1,
            snapshot: false,
            reverse: false,
        }
    }
}

/// One batch of a range read. `more` reports whether the scan has further
/// rows past this batch.
#[derive(Clone, Debug, Default)]
pub struct RangeBatch {
    pub pairs: Vec<(Vec<u8>, Vec<u8>)>,
    pub more: bool,
}

/// An ordered key-value engine with interactive serializable transactions.
pub trait Engine: Send + Sync {
    type Transaction: EngineTransaction;

    /// Begins a fresh transaction against the current state.
    fn begin(&self) -> CResult<Self::Transaction>;
}

/// A single engine transaction. Reads suspend on engine round-trips;
/// mutations buffer locally and take effect at commit. Reads observe the
/// transaction's own buffered writes.
#[allow(async_fn_in_trait)]
pub trait EngineTransaction {
    async fn get(&self, key: &[u8], snapshot: bool) -> CResult<Option<Vec<u8>>>;

    async fn get_range(
        &self,
        begin: &KeySelector,
        end: &KeySelector,
        options: &RangeOptions,
    ) -> CResult<RangeBatch>;

    fn set(&self, key: &[u8], value: &[u8]) -> CResult<()>;

    fn clear(&self, key: &[u8]) -> CResult<()>;

    fn clear_range(&self, begin: &[u8], end: &[u8]) -> CResult<()>;

    fn atomic_op(&self, op: MutationType, key: &[u8], param: &[u8]) -> CResult<()>;

    async fn read_version(&self) -> CResult<i64>;

    fn set_read_version(&self, version: i64) -> CResult<()>;

    async fn estimated_size_bytes(&self, begin: &[u8], end: &[u8]) -> CResult<i64>;

    async fn commit(&self) -> CResult<()>;

    /// Decides whether the given engine error is recoverable. On success
    /// the transaction has been reset and the caller may retry its body;
    /// on failure the caller must surface the original error.
    async fn on_error(&self, code: i32) -> CResult<()>;
}
