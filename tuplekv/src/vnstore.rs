//! VN-store: a versioned N-store with explicit change sets.
//!
//! Tuples carry two extra tail positions, the change that wrote them and
//! an alive flag, so nothing is ever overwritten in place: a deletion is
//! one more tuple with the flag down. Change sets become visible when
//! applied, which assigns them a monotonic significance stamp; the row
//! with the largest stamp decides a tuple's current state.

use std::collections::HashMap;

use log::warn;
use uuid::Uuid;

use crate::db::Transaction;
use crate::engine::Engine;
use crate::error::{CResult, Error};
use crate::nstore::{bind, binding, var, Bindings, NStore, Select, Term};
use crate::tuple::Value;

/// Transaction variable holding the active change id, so nested calls and
/// harness retries observe it.
const ACTIVE_CHANGE: &str = "vnstore.change";

/// Internal binding names for the two tail positions.
const CHANGE_BINDING: &str = "__change";
const ALIVE_BINDING: &str = "__alive";

/// A fresh significance stamp: time-ordered, strictly increasing within
/// this process.
///
/// Uses uuid's own process-wide v7 context internally, which keeps stamps
/// monotonic even within one millisecond.
fn significance_stamp() -> Uuid {
    Uuid::now_v7()
}

/// A versioned tuple store. `items` names the visible positions; the
/// backing N-store has two more.
pub struct VnStore {
    name: String,
    items: Vec<String>,
    changes: NStore,
    tuples: NStore,
}

impl VnStore {
    pub fn new(name: &str, prefix: &[Value], items: &[&str]) -> Self {
        let mut changes_prefix = prefix.to_vec();
        changes_prefix.push(Value::Text("changes".to_string()));
        let mut tuples_prefix = prefix.to_vec();
        tuples_prefix.push(Value::Text("tuples".to_string()));
        VnStore {
            name: name.to_string(),
            items: items.iter().map(|item| item.to_string()).collect(),
            // a change has three fields: type, significance, message
            changes: NStore::new(&format!("{}/changes", name), &changes_prefix, 3),
            tuples: NStore::new(&format!("{}/tuples", name), &tuples_prefix, items.len() + 2),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn check_arity(&self, count: usize) -> CResult<()> {
        if count != self.items.len() {
            return Err(Error::InvalidInput(format!(
                "{} expects {} items, got {}",
                self.name,
                self.items.len(),
                count
            )));
        }
        Ok(())
    }

    fn active_change<E: Engine>(&self, tx: &Transaction<E>) -> CResult<Uuid> {
        tx.var_get(ACTIVE_CHANGE)?
            .ok_or_else(|| {
                Error::InvalidInput(format!("{}: no active change in this transaction", self.name))
            })?
            .as_uuid()
    }

    /// Starts a new change set and makes it the transaction's active one.
    /// Until applied, everything written under it is invisible.
    pub fn change_create<E: Engine>(&self, tx: &Transaction<E>) -> CResult<Uuid> {
        let change = Uuid::new_v4();
        tx.var_set(ACTIVE_CHANGE, Value::Uuid(change))?;
        self.changes.add(tx, &[change.into(), "type".into(), "change".into()], b"")?;
        self.changes.add(tx, &[change.into(), "significance".into(), Value::Nil], b"")?;
        self.changes.add(tx, &[change.into(), "message".into(), Value::Nil], b"")?;
        Ok(change)
    }

    /// Re-binds an existing change as the transaction's active one. Must
    /// be called inside a retried body before further mutations.
    pub fn change_continue<E: Engine>(&self, tx: &Transaction<E>, change: Uuid) -> CResult<()> {
        tx.var_set(ACTIVE_CHANGE, Value::Uuid(change))
    }

    /// Replaces the change's descriptive message.
    pub async fn change_message<E: Engine>(
        &self,
        tx: &Transaction<E>,
        change: Uuid,
        message: &str,
    ) -> CResult<()> {
        let pattern = vec![Term::Value(change.into()), Term::Value("message".into()), var("message")];
        let existing = self.changes.select(tx, &pattern, Bindings::new())?.all().await?;
        for bindings in existing {
            let previous = binding(&bindings, "message")?;
            self.changes.remove(tx, &[change.into(), "message".into(), previous])?;
        }
        self.changes.add(tx, &[change.into(), "message".into(), message.into()], b"")?;
        Ok(())
    }

    /// Applies a change set: assigns its significance stamp, making its
    /// tuples visible to reads. Applying twice is a no-op.
    pub async fn change_apply<E: Engine>(&self, tx: &Transaction<E>, change: Uuid) -> CResult<()> {
        let unapplied =
            self.changes.get(tx, &[change.into(), "significance".into(), Value::Nil]).await?;
        if unapplied.is_none() {
            warn!("{}: change {} was already applied", self.name, change);
            return Ok(());
        }
        self.changes.remove(tx, &[change.into(), "significance".into(), Value::Nil])?;
        // time-ordered stamps give a total order across applied changes
        let stamp = significance_stamp();
        self.changes.add(tx, &[change.into(), "significance".into(), stamp.into()], b"")?;
        Ok(())
    }

    /// The significance stamp of a change, None while unapplied.
    async fn significance<E: Engine>(
        &self,
        tx: &Transaction<E>,
        change: Uuid,
    ) -> CResult<Option<Uuid>> {
        let pattern =
            vec![Term::Value(change.into()), Term::Value("significance".into()), var("stamp")];
        let mut select = self.changes.select(tx, &pattern, Bindings::new())?;
        while let Some(bindings) = select.next().await? {
            if let Value::Uuid(stamp) = binding(&bindings, "stamp")? {
                return Ok(Some(stamp));
            }
        }
        Ok(None)
    }

    /// The change's fields (`type`, `significance`, `message`), or None
    /// for an unknown change id.
    pub async fn change_get<E: Engine>(
        &self,
        tx: &Transaction<E>,
        change: Uuid,
    ) -> CResult<Option<HashMap<String, Value>>> {
        let pattern = vec![Term::Value(change.into()), var("key"), var("value")];
        let rows = self.changes.select(tx, &pattern, Bindings::new())?.all().await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let mut out = HashMap::new();
        for bindings in rows {
            let key = binding(&bindings, "key")?;
            out.insert(key.as_text()?.to_string(), binding(&bindings, "value")?);
        }
        Ok(Some(out))
    }

    /// Every recorded change set with its fields.
    pub async fn change_list<E: Engine>(
        &self,
        tx: &Transaction<E>,
    ) -> CResult<Vec<(Uuid, HashMap<String, Value>)>> {
        let pattern = vec![var("uid"), Term::Value("type".into()), Term::Value("change".into())];
        let rows = self.changes.select(tx, &pattern, Bindings::new())?.all().await?;
        let mut out = Vec::new();
        for bindings in rows {
            let uid = binding(&bindings, "uid")?.as_uuid()?;
            if let Some(fields) = self.change_get(tx, uid).await? {
                out.push((uid, fields));
            }
        }
        Ok(out)
    }

    /// The tuples one change set touched, each bound to its item names
    /// plus an `alive` flag.
    pub async fn change_tuples<E: Engine>(
        &self,
        tx: &Transaction<E>,
        change: Uuid,
    ) -> CResult<Vec<Bindings>> {
        let mut pattern: Vec<Term> = self.items.iter().map(|item| var(item)).collect();
        pattern.push(Term::Value(change.into()));
        pattern.push(var("alive"));
        self.tuples.select(tx, &pattern, Bindings::new())?.all().await
    }

    /// Writes a tuple under the active change, alive.
    pub fn add<E: Engine>(&self, tx: &Transaction<E>, items: &[Value], value: &[u8]) -> CResult<bool> {
        self.check_arity(items.len())?;
        let change = self.active_change(tx)?;
        let mut row = items.to_vec();
        row.push(change.into());
        row.push(true.into());
        self.tuples.add(tx, &row, value)?;
        Ok(true)
    }

    /// Writes a tombstone for a tuple under the active change. Returns
    /// false, writing nothing, when the tuple is not currently visible.
    pub async fn remove<E: Engine>(&self, tx: &Transaction<E>, items: &[Value]) -> CResult<bool> {
        self.check_arity(items.len())?;
        if !self.ask(tx, items).await? {
            return Ok(false);
        }
        let change = self.active_change(tx)?;
        let mut row = items.to_vec();
        row.push(change.into());
        row.push(false.into());
        self.tuples.add(tx, &row, b"")?;
        Ok(true)
    }

    /// Whether a tuple is currently visible: among all rows ever written
    /// for it, the one with the latest applied stamp decides. Unapplied
    /// changes do not participate.
    pub async fn ask<E: Engine>(&self, tx: &Transaction<E>, items: &[Value]) -> CResult<bool> {
        self.check_arity(items.len())?;
        let mut pattern: Vec<Term> = items.iter().cloned().map(Term::Value).collect();
        pattern.push(var(CHANGE_BINDING));
        pattern.push(var(ALIVE_BINDING));
        let mut select = self.tuples.select(tx, &pattern, Bindings::new())?;

        let mut latest = Uuid::nil();
        let mut alive = false;
        while let Some(bindings) = select.next().await? {
            let change = binding(&bindings, CHANGE_BINDING)?.as_uuid()?;
            let row_alive = binding(&bindings, ALIVE_BINDING)?.as_bool()?;
            if let Some(stamp) = self.significance(tx, change).await? {
                if stamp > latest {
                    latest = stamp;
                    alive = row_alive;
                }
            }
        }
        Ok(alive)
    }

    /// Yields bindings for the currently visible tuples matching a
    /// pattern; superseded and tombstoned rows are filtered out.
    pub fn select<'a, E: Engine>(
        &'a self,
        tx: &'a Transaction<E>,
        pattern: &[Term],
        seed: Bindings,
    ) -> CResult<VnSelect<'a, E>> {
        self.check_arity(pattern.len())?;
        for term in pattern {
            if let Term::Variable(name) = term {
                if name == CHANGE_BINDING || name == ALIVE_BINDING {
                    return Err(Error::InvalidInput(format!(
                        "{}: variable name {} is reserved",
                        self.name, name
                    )));
                }
            }
        }
        let mut inner_pattern = pattern.to_vec();
        inner_pattern.push(var(CHANGE_BINDING));
        inner_pattern.push(var(ALIVE_BINDING));
        Ok(VnSelect {
            store: self,
            tx,
            pattern: pattern.to_vec(),
            inner: self.tuples.select(tx, &inner_pattern, seed)?,
        })
    }

    /// Composes an upstream query with one more pattern.
    pub fn where_<'a, E: Engine>(
        &'a self,
        upstream: VnQuery<'a, E>,
        pattern: Vec<Term>,
    ) -> CResult<VnQuery<'a, E>> {
        self.check_arity(pattern.len())?;
        let mut query = upstream;
        query.patterns.push(pattern);
        Ok(query)
    }

    /// A chain of patterns over the visible state, evaluated left to right.
    pub fn query<'a, E: Engine>(
        &'a self,
        tx: &'a Transaction<E>,
        patterns: Vec<Vec<Term>>,
    ) -> CResult<VnQuery<'a, E>> {
        for pattern in &patterns {
            self.check_arity(pattern.len())?;
        }
        Ok(VnQuery { store: self, tx, patterns, stack: Vec::new(), started: false })
    }
}

/// Lazy bindings over the visible tuples matching one pattern.
pub struct VnSelect<'a, E: Engine> {
    store: &'a VnStore,
    tx: &'a Transaction<E>,
    pattern: Vec<Term>,
    inner: Select<'a, E>,
}

impl<'a, E: Engine> VnSelect<'a, E> {
    pub async fn next(&mut self) -> CResult<Option<Bindings>> {
        loop {
            let Some(mut bindings) = self.inner.next().await? else {
                return Ok(None);
            };
            // tombstones are never part of the visible state
            if !binding(&bindings, ALIVE_BINDING)?.as_bool()? {
                continue;
            }
            // a row from an older change may be superseded by a later
            // tombstone; re-verify against the full history
            let bound = bind(&self.pattern, &bindings);
            let items: Vec<Value> = bound
                .into_iter()
                .map(|term| match term {
                    Term::Value(value) => Ok(value),
                    Term::Variable(name) => {
                        Err(Error::Internal(format!("variable {} unbound after select", name)))
                    }
                })
                .collect::<CResult<_>>()?;
            if !self.store.ask(self.tx, &items).await? {
                continue;
            }
            bindings.remove(CHANGE_BINDING);
            bindings.remove(ALIVE_BINDING);
            return Ok(Some(bindings));
        }
    }

    pub async fn all(mut self) -> CResult<Vec<Bindings>> {
        let mut out = Vec::new();
        while let Some(bindings) = self.next().await? {
            out.push(bindings);
        }
        Ok(out)
    }
}

/// Lazy evaluation of a pattern chain over the visible state.
pub struct VnQuery<'a, E: Engine> {
    store: &'a VnStore,
    tx: &'a Transaction<E>,
    patterns: Vec<Vec<Term>>,
    stack: Vec<VnSelect<'a, E>>,
    started: bool,
}

impl<'a, E: Engine> VnQuery<'a, E> {
    pub async fn next(&mut self) -> CResult<Option<Bindings>> {
        if !self.started {
            self.started = true;
            if self.patterns.is_empty() {
                return Ok(None);
            }
            let select = self.store.select(self.tx, &self.patterns[0], Bindings::new())?;
            self.stack.push(select);
        }
        loop {
            let depth = self.stack.len();
            let Some(top) = self.stack.last_mut() else {
                return Ok(None);
            };
            let next = top.next().await?;
            match next {
                Some(bindings) if depth == self.patterns.len() => return Ok(Some(bindings)),
                Some(bindings) => {
                    let bound = bind(&self.patterns[depth], &bindings);
                    let select = self.store.select(self.tx, &bound, bindings)?;
                    self.stack.push(select);
                }
                None => {
                    self.stack.pop();
                }
            }
        }
    }

    pub async fn all(mut self) -> CResult<Vec<Bindings>> {
        let mut out = Vec::new();
        while let Some(bindings) = self.next().await? {
            out.push(bindings);
        }
        Ok(out)
    }
}
