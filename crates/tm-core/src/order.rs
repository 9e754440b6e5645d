//! Comparator combinators.
//!
//! Small building blocks for composing orderings: compare by a projected
//! key, compare real-valued sort keys, chain comparators lexicographically,
//! and reverse them. Sibling order for tasks is built from these in
//! [`crate::model::task::sibling_order`].

use std::cmp::Ordering;

/// A boxed comparator, for building lists of heterogeneous comparators.
pub type Comparator<'a, T> = Box<dyn Fn(&T, &T) -> Ordering + 'a>;

/// Compare by a totally ordered key.
pub fn by_key<T, K, F>(key: F) -> impl Fn(&T, &T) -> Ordering
where
    F: Fn(&T) -> K,
    K: Ord,
{
    move |a, b| key(a).cmp(&key(b))
}

/// Compare by a borrowed key (strings, slices) without cloning it.
pub fn by_ref_key<T, K, F>(key: F) -> impl Fn(&T, &T) -> Ordering
where
    F: for<'a> Fn(&'a T) -> &'a K,
    K: Ord + ?Sized,
{
    move |a, b| key(a).cmp(key(b))
}

/// Compare by an optional real-valued key. Missing keys sort first; present
/// keys use IEEE total ordering so the comparator is total even for NaN.
pub fn by_real_key<T, F>(key: F) -> impl Fn(&T, &T) -> Ordering
where
    F: Fn(&T) -> Option<f64>,
{
    move |a, b| compare_real(key(a), key(b))
}

/// Total order on optional reals: `None < Some(_)`, then `f64::total_cmp`.
#[must_use]
pub fn compare_real(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.total_cmp(&y),
    }
}

/// Use `second` to break ties left by `first`.
pub fn then<T, A, B>(first: A, second: B) -> impl Fn(&T, &T) -> Ordering
where
    A: Fn(&T, &T) -> Ordering,
    B: Fn(&T, &T) -> Ordering,
{
    move |a, b| first(a, b).then_with(|| second(a, b))
}

/// Lexicographic composition of any number of comparators. An empty list
/// considers everything equal.
pub fn lexicographic<'a, T: 'a>(comparators: Vec<Comparator<'a, T>>) -> impl Fn(&T, &T) -> Ordering + 'a {
    move |a, b| {
        comparators
            .iter()
            .map(|cmp| cmp(a, b))
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

/// Flip a comparator.
pub fn reversed<T, F>(cmp: F) -> impl Fn(&T, &T) -> Ordering
where
    F: Fn(&T, &T) -> Ordering,
{
    move |a, b| cmp(b, a)
}
