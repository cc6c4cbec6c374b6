//! Interned sparsity patterns.
//!
//! A [`Sparsity`] is an immutable descriptor of a matrix's nonzero pattern in
//! compressed-column layout. Patterns are interned in a global registry, so
//! two handles describing the same structure share one allocation and can be
//! compared by pointer. Slot allocation keys on exactly this identity.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, Weak};

/// Compressed-column pattern data. Never constructed outside the registry.
#[derive(Debug)]
struct SparsityInner {
    nrow: usize,
    ncol: usize,
    /// Column offsets, length `ncol + 1`.
    colind: Vec<u32>,
    /// Row index of each nonzero, grouped by column, strictly increasing
    /// within a column.
    row: Vec<u32>,
}

type RegistryKey = (usize, usize, Vec<u32>, Vec<u32>);

fn registry() -> &'static Mutex<HashMap<RegistryKey, Weak<SparsityInner>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<RegistryKey, Weak<SparsityInner>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// An interned, immutable nonzero pattern.
///
/// Cheap to clone. Structural equality coincides with pointer equality
/// because of interning.
#[derive(Clone)]
pub struct Sparsity(Arc<SparsityInner>);

impl Sparsity {
    /// Intern a pattern given in compressed-column form.
    ///
    /// # Panics
    ///
    /// Panics if `colind` has the wrong length, offsets are not monotone,
    /// or a row index is out of range or out of order within its column.
    pub fn new(nrow: usize, ncol: usize, colind: Vec<u32>, row: Vec<u32>) -> Self {
        assert_eq!(colind.len(), ncol + 1, "colind must have ncol+1 entries");
        assert_eq!(*colind.last().unwrap() as usize, row.len());
        for c in 0..ncol {
            assert!(colind[c] <= colind[c + 1], "colind must be monotone");
            let col = &row[colind[c] as usize..colind[c + 1] as usize];
            for w in col.windows(2) {
                assert!(w[0] < w[1], "row indices must be strictly increasing");
            }
            for &r in col {
                assert!((r as usize) < nrow, "row index out of range");
            }
        }

        let key = (nrow, ncol, colind, row);
        let mut reg = registry().lock().unwrap();
        if let Some(existing) = reg.get(&key).and_then(Weak::upgrade) {
            return Sparsity(existing);
        }
        let inner = Arc::new(SparsityInner {
            nrow: key.0,
            ncol: key.1,
            colind: key.2.clone(),
            row: key.3.clone(),
        });
        reg.insert(key, Arc::downgrade(&inner));
        Sparsity(inner)
    }

    /// Fully dense pattern.
    pub fn dense(nrow: usize, ncol: usize) -> Self {
        let mut colind = Vec::with_capacity(ncol + 1);
        let mut row = Vec::with_capacity(nrow * ncol);
        colind.push(0);
        for _ in 0..ncol {
            for r in 0..nrow {
                row.push(r as u32);
            }
            colind.push(row.len() as u32);
        }
        Sparsity::new(nrow, ncol, colind, row)
    }

    /// Pattern with no nonzeros.
    pub fn empty(nrow: usize, ncol: usize) -> Self {
        Sparsity::new(nrow, ncol, vec![0; ncol + 1], Vec::new())
    }

    /// Dense 1x1 pattern.
    pub fn scalar() -> Self {
        Sparsity::dense(1, 1)
    }

    /// Pattern from a list of `(row, col)` coordinates. Duplicates collapse.
    pub fn from_coords(nrow: usize, ncol: usize, coords: &[(usize, usize)]) -> Self {
        let mut sorted: Vec<(usize, usize)> = coords.iter().map(|&(r, c)| (c, r)).collect();
        sorted.sort_unstable();
        sorted.dedup();
        let mut colind = vec![0u32; ncol + 1];
        let mut row = Vec::with_capacity(sorted.len());
        for &(c, r) in &sorted {
            assert!(r < nrow && c < ncol, "coordinate out of range");
            colind[c + 1] += 1;
            row.push(r as u32);
        }
        for c in 0..ncol {
            colind[c + 1] += colind[c];
        }
        Sparsity::new(nrow, ncol, colind, row)
    }

    /// Pattern with a single nonzero.
    pub fn unit(nrow: usize, ncol: usize, r: usize, c: usize) -> Self {
        Sparsity::from_coords(nrow, ncol, &[(r, c)])
    }

    /// Number of rows.
    pub fn nrow(&self) -> usize {
        self.0.nrow
    }

    /// Number of columns.
    pub fn ncol(&self) -> usize {
        self.0.ncol
    }

    /// `(nrow, ncol)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.0.nrow, self.0.ncol)
    }

    /// Number of structural nonzeros.
    pub fn nnz(&self) -> usize {
        self.0.row.len()
    }

    /// Total number of entries, dense.
    pub fn numel(&self) -> usize {
        self.0.nrow * self.0.ncol
    }

    /// Whether every entry is structurally present.
    pub fn is_dense(&self) -> bool {
        self.nnz() == self.numel()
    }

    /// Whether the pattern is a dense 1x1.
    pub fn is_scalar(&self) -> bool {
        self.0.nrow == 1 && self.0.ncol == 1 && self.nnz() == 1
    }

    /// Column offsets, length `ncol + 1`.
    pub fn colind(&self) -> &[u32] {
        &self.0.colind
    }

    /// Row index of each nonzero.
    pub fn row(&self) -> &[u32] {
        &self.0.row
    }

    /// `(row, col)` of each nonzero, in storage order.
    pub fn coords(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::with_capacity(self.nnz());
        for c in 0..self.0.ncol {
            for k in self.0.colind[c] as usize..self.0.colind[c + 1] as usize {
                out.push((self.0.row[k] as usize, c));
            }
        }
        out
    }

    /// Storage index of entry `(r, c)`, if structurally present.
    pub fn find(&self, r: usize, c: usize) -> Option<usize> {
        let lo = self.0.colind[c] as usize;
        let hi = self.0.colind[c + 1] as usize;
        let col = &self.0.row[lo..hi];
        col.binary_search(&(r as u32)).ok().map(|k| lo + k)
    }

    /// Whether every nonzero of `self` is also a nonzero of `other`.
    pub fn is_subset(&self, other: &Sparsity) -> bool {
        if self.shape() != other.shape() {
            return false;
        }
        if Sparsity::same(self, other) {
            return true;
        }
        self.coords().iter().all(|&(r, c)| other.find(r, c).is_some())
    }

    /// Structural union of two patterns of equal shape.
    ///
    /// # Panics
    ///
    /// Panics if the shapes differ.
    pub fn union(&self, other: &Sparsity) -> Sparsity {
        assert_eq!(self.shape(), other.shape(), "union of mismatched shapes");
        if Sparsity::same(self, other) {
            return self.clone();
        }
        let mut coords = self.coords();
        coords.extend(other.coords());
        Sparsity::from_coords(self.0.nrow, self.0.ncol, &coords)
    }

    /// Pointer identity. This is the key used for work-slot reuse.
    pub fn same(a: &Sparsity, b: &Sparsity) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Stable address of the interned pattern, usable as a map key.
    pub fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Short human-readable description, e.g. `2x3 (4 nz)`.
    pub fn describe(&self) -> String {
        format!("{}x{} ({} nz)", self.0.nrow, self.0.ncol, self.nnz())
    }
}

impl PartialEq for Sparsity {
    fn eq(&self, other: &Self) -> bool {
        // Interning makes structural equality a pointer comparison.
        Sparsity::same(self, other)
    }
}

impl Eq for Sparsity {}

impl fmt::Debug for Sparsity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sparsity({})", self.describe())
    }
}

impl fmt::Display for Sparsity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_gives_pointer_identity() {
        let a = Sparsity::dense(2, 3);
        let b = Sparsity::dense(2, 3);
        assert!(Sparsity::same(&a, &b));
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn distinct_patterns_distinct_keys() {
        let a = Sparsity::dense(2, 2);
        let b = Sparsity::unit(2, 2, 0, 0);
        assert!(!Sparsity::same(&a, &b));
        assert_ne!(a, b);
    }

    #[test]
    fn find_and_union() {
        let a = Sparsity::unit(3, 2, 1, 0);
        let b = Sparsity::unit(3, 2, 2, 1);
        let u = a.union(&b);
        assert_eq!(u.nnz(), 2);
        assert_eq!(u.find(1, 0), Some(0));
        assert_eq!(u.find(2, 1), Some(1));
        assert_eq!(u.find(0, 0), None);
        assert!(a.is_subset(&u));
        assert!(b.is_subset(&u));
    }

    #[test]
    fn dense_layout() {
        let d = Sparsity::dense(2, 2);
        assert!(d.is_dense());
        assert_eq!(d.colind(), &[0, 2, 4]);
        assert_eq!(d.row(), &[0, 1, 0, 1]);
        assert_eq!(d.find(1, 1), Some(3));
    }
}
