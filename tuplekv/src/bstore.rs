//! B-store: content-addressed blobs, chunked to fit the engine's value
//! limit and deduplicated by digest.

use blake2::{Blake2b512, Digest};
use uuid::Uuid;

use crate::db::{range, Transaction};
use crate::engine::Engine;
use crate::error::{CResult, Error};
use crate::tuple::{next_prefix, pack, Value};
use crate::MAX_SIZE_VALUE;

pub struct BStore {
    name: String,
    prefix_hash: Vec<Value>,
    prefix_blob: Vec<Value>,
}

impl BStore {
    pub fn new(name: &str, prefix: &[Value]) -> Self {
        let mut prefix_hash = prefix.to_vec();
        prefix_hash.push(Value::Bytes(vec![0x01]));
        let mut prefix_blob = prefix.to_vec();
        prefix_blob.push(Value::Bytes(vec![0x02]));
        BStore { name: name.to_string(), prefix_hash, prefix_blob }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn hash_key(&self, digest: &[u8]) -> Vec<u8> {
        pack(&[Value::Tuple(self.prefix_hash.clone()), Value::Bytes(digest.to_vec())])
    }

    fn blob_prefix(&self, uid: Uuid) -> Vec<u8> {
        pack(&[Value::Tuple(self.prefix_blob.clone()), uid.into()])
    }

    /// Stores a blob and returns its uid; a blob already present is not
    /// written again. The digest entry is the witness, so retries and
    /// concurrent writers converge on one uid per content.
    pub async fn get_or_create<E: Engine>(&self, tx: &Transaction<E>, blob: &[u8]) -> CResult<Uuid> {
        let digest = Blake2b512::digest(blob);
        let key = self.hash_key(&digest);
        if let Some(existing) = tx.get(&key).await? {
            return Ok(Uuid::from_slice(&existing)?);
        }
        let uid = Uuid::new_v4();
        tx.set(&key, uid.as_bytes())?;
        for (index, chunk) in blob.chunks(MAX_SIZE_VALUE).enumerate() {
            let chunk_key =
                pack(&[Value::Tuple(self.prefix_blob.clone()), uid.into(), Value::Int(index as i64)]);
            tx.set(&chunk_key, chunk)?;
        }
        Ok(uid)
    }

    /// Reassembles a blob from its chunks, in chunk order.
    pub async fn get<E: Engine>(&self, tx: &Transaction<E>, uid: Uuid) -> CResult<Vec<u8>> {
        let start = self.blob_prefix(uid);
        let mut scan = range(tx, start.clone(), next_prefix(&start)?);
        let mut out = Vec::new();
        while let Some((_, value)) = scan.next().await? {
            out.extend_from_slice(&value);
        }
        if out.is_empty() {
            return Err(Error::InvalidData(format!(
                "{}: blob should be in database: uid={}",
                self.name, uid
            )));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::{open, transactional};
    use crate::engine::memory::Memory;

    #[tokio::test]
    async fn round_trip_small() -> CResult<()> {
        let db = open("bstore-small")?;
        let store = BStore::new("small", &[Value::Text("small".to_string())]);

        let uid = transactional(&db, async |tx: &Transaction<Memory>| {
            store.get_or_create(tx, b"hello").await
        })
        .await?;
        let out = transactional(&db, async |tx: &Transaction<Memory>| {
            store.get(tx, uid).await
        })
        .await?;
        assert_eq!(out, b"hello");
        Ok(())
    }

    #[tokio::test]
    async fn chunks_large_blobs_and_deduplicates() -> CResult<()> {
        let db = open("bstore-large")?;
        let store = BStore::new("large", &[Value::Text("large".to_string())]);

        // two full chunks
        let blob: Vec<u8> = [0xbe, 0xef].repeat(MAX_SIZE_VALUE);
        let uid = transactional(&db, async |tx: &Transaction<Memory>| {
            store.get_or_create(tx, &blob).await
        })
        .await?;

        let out = transactional(&db, async |tx: &Transaction<Memory>| {
            store.get(tx, uid).await
        })
        .await?;
        assert_eq!(out, blob);

        // the same content resolves to the same uid, not a new copy
        let again = transactional(&db, async |tx: &Transaction<Memory>| {
            store.get_or_create(tx, &blob).await
        })
        .await?;
        assert_eq!(again, uid);
        Ok(())
    }

    #[tokio::test]
    async fn distinct_content_gets_distinct_uids() -> CResult<()> {
        let db = open("bstore-distinct")?;
        let store = BStore::new("distinct", &[Value::Text("distinct".to_string())]);

        let (a, b) = transactional(&db, async |tx: &Transaction<Memory>| {
            Ok((store.get_or_create(tx, b"one").await?, store.get_or_create(tx, b"two").await?))
        })
        .await?;
        assert_ne!(a, b);
        Ok(())
    }

    #[tokio::test]
    async fn missing_blob_is_an_error() -> CResult<()> {
        let db = open("bstore-missing")?;
        let store = BStore::new("missing", &[Value::Text("missing".to_string())]);

        let out = transactional(&db, async |tx: &Transaction<Memory>| {
            store.get(tx, Uuid::from_bytes([9; 16])).await
        })
        .await;
        assert!(matches!(out, Err(Error::InvalidData(_))));
        Ok(())
    }
}
