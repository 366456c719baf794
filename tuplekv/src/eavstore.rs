//! EAV-store: one dictionary per uid, with a secondary index on
//! (attribute, value) for reverse lookups.

use std::collections::HashMap;

use uuid::Uuid;

use crate::db::{range, Range, Transaction};
use crate::engine::Engine;
use crate::error::{CResult, Error};
use crate::tuple::{next_prefix, pack, unpack, Value};

pub struct EavStore {
    name: String,
    prefix_data: Vec<Value>,
    prefix_index: Vec<Value>,
}

impl EavStore {
    pub fn new(name: &str, prefix: &[Value]) -> Self {
        let mut prefix_data = prefix.to_vec();
        prefix_data.push(Value::Bytes(vec![0x01]));
        let mut prefix_index = prefix.to_vec();
        prefix_index.push(Value::Bytes(vec![0x02]));
        EavStore { name: name.to_string(), prefix_data, prefix_index }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn data_key(&self, uid: Uuid, attribute: &str) -> Vec<u8> {
        pack(&[Value::Tuple(self.prefix_data.clone()), uid.into(), attribute.into()])
    }

    fn data_prefix(&self, uid: Uuid) -> Vec<u8> {
        pack(&[Value::Tuple(self.prefix_data.clone()), uid.into()])
    }

    fn index_key(&self, attribute: &str, value: &Value, uid: Uuid) -> Vec<u8> {
        pack(&[
            Value::Tuple(self.prefix_index.clone()),
            attribute.into(),
            value.clone(),
            uid.into(),
        ])
    }

    /// Stores a record as one data entry and one index entry per
    /// attribute. A fresh uid is generated unless one is supplied.
    pub fn create<E: Engine>(
        &self,
        tx: &Transaction<E>,
        record: &HashMap<String, Value>,
        uid: Option<Uuid>,
    ) -> CResult<Uuid> {
        let uid = uid.unwrap_or_else(Uuid::new_v4);
        for (attribute, value) in record {
            tx.set(&self.data_key(uid, attribute), &pack(&[value.clone()]))?;
            tx.set(&self.index_key(attribute, value, uid), b"")?;
        }
        Ok(uid)
    }

    /// The record stored under a uid; empty when unknown.
    pub async fn get<E: Engine>(
        &self,
        tx: &Transaction<E>,
        uid: Uuid,
    ) -> CResult<HashMap<String, Value>> {
        let start = self.data_prefix(uid);
        let mut scan = range(tx, start.clone(), next_prefix(&start)?);
        let mut out = HashMap::new();
        while let Some((key, value)) = scan.next().await? {
            let mut parts = unpack(&key)?;
            if parts.len() != 3 {
                return Err(Error::InvalidData(format!("{}: malformed data key", self.name)));
            }
            let attribute = parts.swap_remove(2);
            let mut unpacked = unpack(&value)?;
            if unpacked.len() != 1 {
                return Err(Error::InvalidData(format!("{}: malformed data value", self.name)));
            }
            out.insert(attribute.as_text()?.to_string(), unpacked.swap_remove(0));
        }
        Ok(out)
    }

    /// Removes a record: its index entries one by one, then the data
    /// range. Unknown uids are a no-op.
    pub async fn remove<E: Engine>(&self, tx: &Transaction<E>, uid: Uuid) -> CResult<()> {
        let record = self.get(tx, uid).await?;
        for (attribute, value) in &record {
            tx.clear(&self.index_key(attribute, value, uid))?;
        }
        let start = self.data_prefix(uid);
        tx.clear_range(&start, &next_prefix(&start)?)
    }

    /// Replaces a record wholesale.
    pub async fn update<E: Engine>(
        &self,
        tx: &Transaction<E>,
        uid: Uuid,
        record: &HashMap<String, Value>,
    ) -> CResult<()> {
        self.remove(tx, uid).await?;
        self.create(tx, record, Some(uid))?;
        Ok(())
    }

    /// Yields the uids of records whose attribute has the given value.
    pub fn query<'a, E: Engine>(
        &self,
        tx: &'a Transaction<E>,
        attribute: &str,
        value: &Value,
    ) -> CResult<Matches<'a, E>> {
        let start = pack(&[
            Value::Tuple(self.prefix_index.clone()),
            attribute.into(),
            value.clone(),
        ]);
        let end = next_prefix(&start)?;
        Ok(Matches { name: self.name.clone(), range: range(tx, start, end) })
    }
}

/// Lazy uids from an index scan.
pub struct Matches<'a, E: Engine> {
    name: String,
    range: Range<'a, E>,
}

impl<'a, E: Engine> Matches<'a, E> {
    pub async fn next(&mut self) -> CResult<Option<Uuid>> {
        let Some((key, _)) = self.range.next().await? else {
            return Ok(None);
        };
        let parts = unpack(&key)?;
        match parts.as_slice() {
            [_, _, _, uid] => uid.as_uuid().map(Some),
            _ => Err(Error::InvalidData(format!("{}: malformed index key", self.name))),
        }
    }

    pub async fn all(mut self) -> CResult<Vec<Uuid>> {
        let mut out = Vec::new();
        while let Some(uid) = self.next().await? {
            out.push(uid);
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

    fn record(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(attribute, value)| (attribute.to_string(), value.clone())).collect()
    }

    #[tokio::test]
    async fn round_trip() -> CResult<()> {
        let db = open("eavstore-round-trip")?;
        let store = EavStore::new("round-trip", &[Value::Text("round-trip".to_string())]);
        let expected = record(&[
            ("title", Value::Text("hyper.dev".to_string())),
            ("visits", Value::Int(42)),
            ("draft", Value::Bool(false)),
        ]);

        let uid = transactional(&db, async |tx: &Transaction<Memory>| {
            store.create(tx, &expected, None)
        })
        .await?;
        let out =
            transactional(&db, async |tx: &Transaction<Memory>| store.get(tx, uid).await).await?;
        assert_eq!(out, expected);
        Ok(())
    }

    #[tokio::test]
    async fn query_by_attribute_value() -> CResult<()> {
        let db = open("eavstore-query")?;
        let store = EavStore::new("query", &[Value::Text("query".to_string())]);

        let (a, b) = transactional(&db, async |tx: &Transaction<Memory>| {
            let a = store.create(tx, &record(&[("kind", Value::Text("post".into()))]), None)?;
            let b = store.create(tx, &record(&[("kind", Value::Text("post".into()))]), None)?;
            store.create(tx, &record(&[("kind", Value::Text("page".into()))]), None)?;
            Ok((a, b))
        })
        .await?;

        let mut uids = transactional(&db, async |tx: &Transaction<Memory>| {
            store.query(tx, "kind", &Value::Text("post".into()))?.all().await
        })
        .await?;
        uids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(uids, expected);
        Ok(())
    }

    #[tokio::test]
    async fn remove_clears_data_and_index() -> CResult<()> {
        let db = open("eavstore-remove")?;
        let store = EavStore::new("remove", &[Value::Text("remove".to_string())]);

        let uid = transactional(&db, async |tx: &Transaction<Memory>| {
            store.create(tx, &record(&[("kind", Value::Text("post".into()))]), None)
        })
        .await?;
        transactional(&db, async |tx: &Transaction<Memory>| store.remove(tx, uid).await).await?;

        let out =
            transactional(&db, async |tx: &Transaction<Memory>| store.get(tx, uid).await).await?;
        assert_eq!(out, HashMap::new());
        let uids = transactional(&db, async |tx: &Transaction<Memory>| {
            store.query(tx, "kind", &Value::Text("post".into()))?.all().await
        })
        .await?;
        assert_eq!(uids, Vec::<Uuid>::new());
        Ok(())
    }

    #[tokio::test]
    async fn update_replaces_the_record() -> CResult<()> {
        let db = open("eavstore-update")?;
        let store = EavStore::new("update", &[Value::Text("update".to_string())]);

        let uid = transactional(&db, async |tx: &Transaction<Memory>| {
            store.create(tx, &record(&[("status", Value::Text("draft".into()))]), None)
        })
        .await?;
        transactional(&db, async |tx: &Transaction<Memory>| {
            store
                .update(
                    tx,
                    uid,
                    &record(&[
                        ("status", Value::Text("published".into())),
                        ("visits", Value::Int(1)),
                    ]),
                )
                .await
        })
        .await?;

        let out =
            transactional(&db, async |tx: &Transaction<Memory>| store.get(tx, uid).await).await?;
        assert_eq!(
            out,
            record(&[("status", Value::Text("published".into())), ("visits", Value::Int(1))])
        );
        // the old index entry is gone
        let stale = transactional(&db, async |tx: &Transaction<Memory>| {
            store.query(tx, "status", &Value::Text("draft".into()))?.all().await
        })
        .await?;
        assert_eq!(stale, Vec::<Uuid>::new());
        Ok(())
    }
}
