use crate::error::CacheError;
use crate::token::{kind, Token, TokenKind};
use crate::values::{Redshift, Wavenumber};
use std::cmp::Ordering;
use std::collections::{btree_map, BTreeMap};
use std::fmt;
use std::iter::FusedIterator;

/// Values a configuration database can order its records by.
pub trait OrderedValue: Clone {
    fn ordering_value(&self) -> f64;
}

impl OrderedValue for Redshift {
    fn ordering_value(&self) -> f64 {
        self.0
    }
}

impl OrderedValue for Wavenumber {
    fn ordering_value(&self) -> f64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
struct SortKey(f64);

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// In-memory set of token/value records for one configuration dimension.
///
/// Records are kept in ascending value order; ties are broken by token id. Tokens are unique,
/// values need not be. Iteration is double ended, so `iter().rev()` visits the largest value
/// first, which is what time integrations starting from an early epoch need.
pub struct ConfigDatabase<K: TokenKind, V: OrderedValue> {
    by_value: BTreeMap<(SortKey, u32), V>,
    by_token: BTreeMap<u32, SortKey>,
    marker: std::marker::PhantomData<fn() -> K>,
}

pub type RedshiftDatabase = ConfigDatabase<kind::Redshift, Redshift>;
pub type WavenumberDatabase = ConfigDatabase<kind::Wavenumber, Wavenumber>;
pub type UvCutoffDatabase = ConfigDatabase<kind::UvCutoff, Wavenumber>;
pub type IrCutoffDatabase = ConfigDatabase<kind::IrCutoff, Wavenumber>;
pub type IrResumDatabase = ConfigDatabase<kind::IrResum, Wavenumber>;

impl<K: TokenKind, V: OrderedValue> ConfigDatabase<K, V> {
    pub fn new() -> Self {
        ConfigDatabase { by_value: BTreeMap::new(), by_token: BTreeMap::new(), marker: std::marker::PhantomData }
    }

    /// Inserts a record under an existing token. Fails if the token is already present.
    pub fn add(&mut self, token: Token<K>, value: V) -> Result<Token<K>, CacheError> {
        if self.by_token.contains_key(&token.id()) {
            return Err(CacheError::database(format!("{:?} already present in configuration database", token)));
        }
        let key = SortKey(value.ordering_value());
        self.by_token.insert(token.id(), key);
        self.by_value.insert((key, token.id()), value);
        Ok(token)
    }

    /// Inserts a value under the next unused token id. Fails once the id space is exhausted.
    pub fn push(&mut self, value: V) -> Result<Token<K>, CacheError> {
        let next = match self.by_token.keys().next_back() {
            Some(last) => last.checked_add(1).ok_or_else(|| CacheError::database("configuration database token ids exhausted"))?,
            None => 0,
        };
        let key = SortKey(value.ordering_value());
        self.by_token.insert(next, key);
        self.by_value.insert((key, next), value);
        Ok(Token::new(next))
    }

    pub fn lookup(&self, token: Token<K>) -> Result<&V, CacheError> {
        self.by_token
            .get(&token.id())
            .and_then(|key| self.by_value.get(&(*key, token.id())))
            .ok_or_else(|| CacheError::not_found(format!("{:?} not present in configuration database", token)))
    }

    pub fn contains(&self, token: Token<K>) -> bool {
        self.by_token.contains_key(&token.id())
    }

    pub fn len(&self) -> usize {
        self.by_value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_value.is_empty()
    }

    pub fn iter(&self) -> RecordIter<'_, K, V> {
        RecordIter { inner: self.by_value.iter(), marker: std::marker::PhantomData }
    }

    pub fn first(&self) -> Option<(Token<K>, &V)> {
        self.iter().next()
    }

    pub fn last(&self) -> Option<(Token<K>, &V)> {
        self.iter().next_back()
    }

    pub fn tokens(&self) -> Vec<Token<K>> {
        self.iter().map(|(t, _)| t).collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.iter().map(|(_, v)| v.clone()).collect()
    }

    /// Records whose token passes the filter, in the same order.
    pub fn subset(&self, mut keep: impl FnMut(Token<K>) -> bool) -> Self {
        let mut out = ConfigDatabase::new();
        for ((key, id), value) in self.by_value.iter() {
            if keep(Token::new(*id)) {
                out.by_token.insert(*id, *key);
                out.by_value.insert((*key, *id), value.clone());
            }
        }
        out
    }
}

impl<K: TokenKind, V: OrderedValue> Default for ConfigDatabase<K, V> {
    fn default() -> Self {
        ConfigDatabase::new()
    }
}

impl<K: TokenKind, V: OrderedValue> Clone for ConfigDatabase<K, V> {
    fn clone(&self) -> Self {
        ConfigDatabase { by_value: self.by_value.clone(), by_token: self.by_token.clone(), marker: std::marker::PhantomData }
    }
}

impl<K: TokenKind, V: OrderedValue + fmt::Debug> fmt::Debug for ConfigDatabase<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K: TokenKind, V: OrderedValue> FromIterator<(Token<K>, V)> for ConfigDatabase<K, V> {
    /// Later duplicates of a token are ignored.
    fn from_iter<I: IntoIterator<Item = (Token<K>, V)>>(iter: I) -> Self {
        let mut db = ConfigDatabase::new();
        for (token, value) in iter {
            let _ = db.add(token, value);
        }
        db
    }
}

impl<'a, K: TokenKind, V: OrderedValue> IntoIterator for &'a ConfigDatabase<K, V> {
    type Item = (Token<K>, &'a V);
    type IntoIter = RecordIter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Yields `(token, value)` in ascending value order, or descending when reversed.
pub struct RecordIter<'a, K: TokenKind, V> {
    inner: btree_map::Iter<'a, (SortKey, u32), V>,
    marker: std::marker::PhantomData<fn() -> K>,
}

impl<'a, K: TokenKind, V> Iterator for RecordIter<'a, K, V> {
    type Item = (Token<K>, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|((_, id), v)| (Token::new(*id), v))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<K: TokenKind, V> DoubleEndedIterator for RecordIter<'_, K, V> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(|((_, id), v)| (Token::new(*id), v))
    }
}

impl<K: TokenKind, V> ExactSizeIterator for RecordIter<'_, K, V> {}

impl<K: TokenKind, V> FusedIterator for RecordIter<'_, K, V> {}

/// `n` evenly spaced samples over `[lo, hi]`, both ends included.
pub fn linear_samples(lo: f64, hi: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![lo],
        _ => (0..n).map(|i| lo + (hi - lo) * i as f64 / (n - 1) as f64).collect(),
    }
}

/// `n` logarithmically spaced samples over `[lo, hi]`; both bounds must be positive.
pub fn log_samples(lo: f64, hi: f64, n: usize) -> Vec<f64> {
    linear_samples(lo.ln(), hi.ln(), n).into_iter().map(f64::exp).collect()
}
