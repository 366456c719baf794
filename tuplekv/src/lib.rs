//! `tuplekv` is a family of storage abstractions layered on one ordered
//! key-value engine with serializable interactive transactions: an
//! order-preserving tuple codec, a transaction harness with bounded
//! retries, and five stores built from them — n-ary tuples with
//! pattern-match queries ([`nstore`]), versioned tuples with change sets
//! ([`vnstore`]), content-addressed blobs ([`bstore`]), attribute-value
//! records ([`eavstore`]) and an inverted search index ([`pstore`]).
//!
//! ## Getting started
//!
//! ```rust
//! use tuplekv::nstore::{val, var, Bindings, NStore};
//! use tuplekv::{open, transactional, CResult, Value};
//! use uuid::Uuid;
//!
//! fn main() -> CResult<()> {
//!     let runtime = tokio::runtime::Runtime::new()?;
//!     runtime.block_on(run())
//! }
//!
//! async fn run() -> CResult<()> {
//!     let db = open("getting-started")?;
//!     let triples = NStore::new("triples", &[Value::Int(42)], 3);
//!
//!     let subject = Uuid::new_v4();
//!     transactional(&db, async |tx| {
//!         triples.add(tx, &[subject.into(), "title".into(), "hyper.dev".into()], b"")
//!     })
//!     .await?;
//!
//!     let bindings = transactional(&db, async |tx| {
//!         triples
//!             .select(tx, &[var("subject"), val("title"), val("hyper.dev")], Bindings::new())?
//!             .all()
//!             .await
//!     })
//!     .await?;
//!
//!     assert_eq!(bindings[0]["subject"], Value::Uuid(subject));
//!     Ok(())
//! }
//! ```

pub mod bstore;
pub mod db;
pub mod eavstore;
pub mod engine;
pub mod error;
pub mod nstore;
pub mod pstore;
pub mod tuple;
pub mod vnstore;

/// Hard limit on the bytes buffered by one transaction.
pub const MAX_SIZE_TRANSACTION: usize = 10_000_000;

/// Hard limit on a single key.
pub const MAX_SIZE_KEY: usize = 10_000;

/// Hard limit on a single value. B-store chunks blobs to respect it.
pub const MAX_SIZE_VALUE: usize = 100_000;

pub use db::{open, range, range_selectors, transactional, Database, Range, Transaction};
pub use error::{CResult, Error};
pub use tuple::{
    has_incomplete_versionstamp, next_prefix, pack, pack_with_versionstamp, unpack, Value,
    Versionstamp,
};
