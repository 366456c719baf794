//! N-store: an n-ary tuple store answering pattern-match queries in one
//! range scan.
//!
//! Each tuple is indexed under a small set of position permutations chosen
//! so that, whatever subset of positions a query grounds, some permutation
//! leads with exactly those positions. A pattern then becomes a single
//! prefix scan over that permutation's subspace: 3 permutations suffice
//! for arity 3, 6 for arity 4.

use std::collections::HashMap;

use crate::db::{range, Range, Transaction};
use crate::engine::Engine;
use crate::error::{CResult, Error};
use crate::tuple::{next_prefix, pack, unpack, Value};

/// Variable bindings produced by pattern queries, keyed by variable name.
pub type Bindings = HashMap<String, Value>;

/// One position of a query pattern: a concrete value or a named variable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Term {
    Value(Value),
    Variable(String),
}

/// A named pattern variable.
pub fn var(name: &str) -> Term {
    Term::Variable(name.to_string())
}

/// A concrete pattern value.
pub fn val(value: impl Into<Value>) -> Term {
    Term::Value(value.into())
}

impl From<Value> for Term {
    fn from(value: Value) -> Self {
        Term::Value(value)
    }
}

/// Reads a binding a select is guaranteed to have produced.
pub(crate) fn binding(bindings: &Bindings, name: &str) -> CResult<Value> {
    bindings
        .get(name)
        .cloned()
        .ok_or_else(|| Error::Internal(format!("missing binding for {}", name)))
}

/// Substitutes bound variables into a pattern, leaving unbound ones as is.
pub(crate) fn bind(pattern: &[Term], bindings: &Bindings) -> Vec<Term> {
    pattern
        .iter()
        .map(|term| match term {
            Term::Variable(name) => match bindings.get(name) {
                Some(value) => Term::Value(value.clone()),
                None => term.clone(),
            },
            term => term.clone(),
        })
        .collect()
}

/// An n-ary tuple store under a keyspace prefix.
pub struct NStore {
    name: String,
    prefix: Vec<Value>,
    n: usize,
    indices: Vec<Vec<usize>>,
}

impl NStore {
    /// Creates a store for `n`-tuples under `prefix`. The covering index
    /// permutations are computed once here.
    pub fn new(name: &str, prefix: &[Value], n: usize) -> Self {
        NStore {
            name: name.to_string(),
            prefix: prefix.to_vec(),
            n,
            indices: covering_indices(n),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.n
    }

    fn check_arity(&self, count: usize) -> CResult<()> {
        if count != self.n {
            return Err(Error::InvalidInput(format!(
                "{} expects {} items, got {}",
                self.name, self.n, count
            )));
        }
        Ok(())
    }

    fn key(&self, subspace: usize, items: &[&Value]) -> Vec<u8> {
        let mut values = self.prefix.clone();
        values.push(Value::Int(subspace as i64));
        values.extend(items.iter().map(|item| (*item).clone()));
        pack(&values)
    }

    /// Stores a tuple, writing one key per index permutation. Idempotent.
    pub fn add<E: Engine>(
        &self,
        tx: &Transaction<E>,
        items: &[Value],
        value: &[u8],
    ) -> CResult<()> {
        self.check_arity(items.len())?;
        for (subspace, index) in self.indices.iter().enumerate() {
            let permuted: Vec<&Value> = index.iter().map(|i| &items[*i]).collect();
            tx.set(&self.key(subspace, &permuted), value)?;
        }
        Ok(())
    }

    /// Removes a tuple from every index permutation. Idempotent.
    pub fn remove<E: Engine>(&self, tx: &Transaction<E>, items: &[Value]) -> CResult<()> {
        self.check_arity(items.len())?;
        for (subspace, index) in self.indices.iter().enumerate() {
            let permuted: Vec<&Value> = index.iter().map(|i| &items[*i]).collect();
            tx.clear(&self.key(subspace, &permuted))?;
        }
        Ok(())
    }

    /// The value stored with a fully ground tuple, or None if absent.
    pub async fn get<E: Engine>(
        &self,
        tx: &Transaction<E>,
        items: &[Value],
    ) -> CResult<Option<Vec<u8>>> {
        self.check_arity(items.len())?;
        // the first index is always the identity permutation
        let ordered: Vec<&Value> = items.iter().collect();
        tx.get(&self.key(0, &ordered)).await
    }

    /// Yields bindings matching a pattern, in one range scan over the
    /// lowest-numbered permutation that leads with the ground positions.
    pub fn select<'a, E: Engine>(
        &'a self,
        tx: &'a Transaction<E>,
        pattern: &[Term],
        seed: Bindings,
    ) -> CResult<Select<'a, E>> {
        self.check_arity(pattern.len())?;
        let ground: Vec<usize> = pattern
            .iter()
            .enumerate()
            .filter(|(_, term)| matches!(term, Term::Value(_)))
            .map(|(position, _)| position)
            .collect();
        let (subspace, index) = self
            .indices
            .iter()
            .enumerate()
            .find(|(_, index)| is_permutation_prefix(&ground, index))
            .ok_or_else(|| {
                Error::Internal(format!(
                    "{}: no index covers ground positions {:?}",
                    self.name, ground
                ))
            })?;

        let mut head = self.prefix.clone();
        head.push(Value::Int(subspace as i64));
        for position in index {
            if let Term::Value(value) = &pattern[*position] {
                head.push(value.clone());
            }
        }
        let start = pack(&head);
        let end = next_prefix(&start)?;

        let mut inverse = vec![0; index.len()];
        for (slot, position) in index.iter().enumerate() {
            inverse[*position] = slot;
        }

        Ok(Select {
            store: self,
            pattern: pattern.to_vec(),
            inverse,
            seed,
            range: range(tx, start, end),
        })
    }

    /// Composes an upstream query with one more pattern: each upstream
    /// binding is substituted into the pattern and selected with that
    /// binding as the seed.
    pub fn where_<'a, E: Engine>(
        &'a self,
        upstream: Query<'a, E>,
        pattern: Vec<Term>,
    ) -> CResult<Query<'a, E>> {
        self.check_arity(pattern.len())?;
        let mut query = upstream;
        query.patterns.push(pattern);
        Ok(query)
    }

    /// A chain of patterns evaluated left to right, equivalent to folding
    /// `where_` over `select` of the first pattern.
    pub fn query<'a, E: Engine>(
        &'a self,
        tx: &'a Transaction<E>,
        patterns: Vec<Vec<Term>>,
    ) -> CResult<Query<'a, E>> {
        for pattern in &patterns {
            self.check_arity(pattern.len())?;
        }
        Ok(Query { store: self, tx, patterns, stack: Vec::new(), started: false })
    }
}

/// Lazy bindings from one pattern scan.
pub struct Select<'a, E: Engine> {
    store: &'a NStore,
    pattern: Vec<Term>,
    /// Maps tuple position to its slot in the scanned permutation.
    inverse: Vec<usize>,
    seed: Bindings,
    range: Range<'a, E>,
}

impl<'a, E: Engine> Select<'a, E> {
    pub async fn next(&mut self) -> CResult<Option<Bindings>> {
        let Some((key, _)) = self.range.next().await? else {
            return Ok(None);
        };
        let values = unpack(&key)?;
        let skip = self.store.prefix.len() + 1;
        if values.len() != skip + self.store.n {
            return Err(Error::Internal(format!(
                "{}: indexed row has {} elements",
                self.store.name,
                values.len()
            )));
        }
        let permuted = &values[skip..];
        let mut bindings = self.seed.clone();
        for (position, term) in self.pattern.iter().enumerate() {
            if let Term::Variable(name) = term {
                bindings.insert(name.clone(), permuted[self.inverse[position]].clone());
            }
        }
        Ok(Some(bindings))
    }

    pub async fn all(mut self) -> CResult<Vec<Bindings>> {
        let mut out = Vec::new();
        while let Some(bindings) = self.next().await? {
            out.push(bindings);
        }
        Ok(out)
    }
}

/// Lazy evaluation of a pattern chain: a stack of nested selects, one per
/// pattern, advanced depth first so upstream order is preserved.
pub struct Query<'a, E: Engine> {
    store: &'a NStore,
    tx: &'a Transaction<E>,
    patterns: Vec<Vec<Term>>,
    stack: Vec<Select<'a, E>>,
    started: bool,
}

impl<'a, E: Engine> Query<'a, E> {
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

/// True when the leading `|ground|` positions of `index` are exactly the
/// ground positions, in any order.
fn is_permutation_prefix(ground: &[usize], index: &[usize]) -> bool {
    let head = &index[..ground.len()];
    ground.iter().all(|position| head.contains(position))
}

/// Computes a covering set of index permutations for arity `n`: every
/// nonempty subset of positions is the head of at least one permutation.
/// One permutation is derived per size-⌊n/2⌋ combination by repeatedly
/// pulling marked/unmarked adjacent pairs to the edges; the first
/// combination always yields the identity.
fn covering_indices(n: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    for marks in combinations(n, n / 2) {
        let mut leading = Vec::new();
        let mut trailing = Vec::new();
        let mut line: Vec<(usize, bool)> =
            (0..n).map(|position| (position, marks.contains(&position))).collect();
        loop {
            let pair = (0..line.len().saturating_sub(1)).find(|&i| !line[i].1 && line[i + 1].1);
            let Some(i) = pair else { break };
            leading.push(line[i + 1].0);
            trailing.push(line[i].0);
            line.remove(i + 1);
            line.remove(i);
        }
        let mut index = leading;
        index.extend(line.into_iter().map(|(position, _)| position));
        index.extend(trailing);
        out.push(index);
    }
    out
}

/// All size-`k` combinations of `0..n`, in lexicographic order.
fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
    fn recurse(start: usize, n: usize, k: usize, current: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if current.len() == k {
            out.push(current.clone());
            return;
        }
        for candidate in start..n {
            current.push(candidate);
            recurse(candidate + 1, n, k, current, out);
            current.pop();
        }
    }
    let mut out = Vec::new();
    recurse(0, n, k, &mut Vec::new(), &mut out);
    out
}
