//! User-key ordering.
//!
//! A [`Comparator`] supplies the total order on user keys, an optional split
//! of a key into `prefix || suffix` for versioned keys, and a separate total
//! order on the suffix subspace. The suffix order is its own order, not byte
//! order: range-key masking and `seek_prefix_ge` depend on it.

use std::cmp::Ordering;

/// A total order on user keys. Supplied as a `'static` table of function
/// pointers so it can be captured by ordered containers and persisted by
/// name in the manifest.
pub struct Comparator {
    /// Persisted in the manifest and validated on reopen.
    pub name: &'static str,

    /// Strict weak order on whole user keys. Must agree with equality.
    pub compare: fn(&[u8], &[u8]) -> Ordering,

    /// Length of the prefix of `key`; the remainder is the suffix. None for
    /// comparators without versioned keys.
    pub split: Option<fn(&[u8]) -> usize>,

    /// Total order on suffixes. For versioned keys this usually orders
    /// newer versions first; it is unrelated to byte order.
    pub compare_suffixes: fn(&[u8], &[u8]) -> Ordering,
}

impl Comparator {
    #[inline]
    pub fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.compare)(a, b)
    }

    #[inline]
    pub fn cmp_suffixes(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.compare_suffixes)(a, b)
    }

    /// The prefix of `key` per the split function; the whole key when no
    /// split is configured.
    pub fn prefix<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        match self.split {
            Some(split) => &key[..split(key)],
            None => key,
        }
    }

    /// The suffix of `key` per the split function; empty when no split is
    /// configured.
    pub fn suffix<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        match self.split {
            Some(split) => &key[split(key)..],
            None => &[],
        }
    }

    /// The immediate upper bound of all keys sharing `prefix`: the shortest
    /// byte string greater than every key with that prefix, or None when the
    /// prefix is all 0xff.
    pub fn prefix_successor(&self, prefix: &[u8]) -> Option<Vec<u8>> {
        let mut succ = prefix.to_vec();
        while let Some(last) = succ.last_mut() {
            if *last < 0xff {
                *last += 1;
                return Some(succ);
            }
            succ.pop();
        }
        None
    }
}

impl std::fmt::Debug for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comparator").field("name", &self.name).finish()
    }
}

fn bytewise_compare(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// The default comparator: plain byte order, no prefix/suffix split.
pub static BYTEWISE: Comparator = Comparator {
    name: "cinder.bytewise",
    compare: bytewise_compare,
    split: None,
    compare_suffixes: bytewise_compare,
};

fn versioned_split(key: &[u8]) -> usize {
    key.iter().position(|&b| b == b'@').unwrap_or(key.len())
}

fn versioned_compare(a: &[u8], b: &[u8]) -> Ordering {
    let (pa, pb) = (&a[..versioned_split(a)], &b[..versioned_split(b)]);
    pa.cmp(pb)
        .then_with(|| versioned_compare_suffixes(&a[pa.len()..], &b[pb.len()..]))
}

fn suffix_version(suffix: &[u8]) -> u64 {
    // "@<n>"; malformed suffixes order as version 0.
    std::str::from_utf8(suffix.get(1..).unwrap_or(&[]))
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn versioned_compare_suffixes(a: &[u8], b: &[u8]) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        // An unsuffixed key orders before any suffixed form of its prefix.
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        // Higher versions are newer and order first.
        (false, false) => suffix_version(b).cmp(&suffix_version(a)),
    }
}

/// A comparator for `prefix@version` keys: prefixes in byte order, versions
/// descending so newer versions order first. Used by tests and the command
/// driver.
pub static VERSIONED: Comparator = Comparator {
    name: "cinder.versioned",
    compare: versioned_compare,
    split: Some(versioned_split),
    compare_suffixes: versioned_compare_suffixes,
};
