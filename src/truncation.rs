use std::collections::BTreeMap;

use faer::sparse::{SparseColMat, Triplet};
use ndarray::{ArrayD, Axis, IxDyn};

use crate::bspline::RefinementTransfer;
use crate::error::{AccessError, StructuralError};
use crate::hierarchy::{Hierarchy, IndexBox};
use crate::tensor::TensorBasis;

/// How one active basis function is represented.
///
/// `Native` functions evaluate directly through their native-level tensor
/// basis. `Truncated` functions carry a sparse coefficient vector over the
/// flat tensor indices of their presentation level, stored as one column of
/// the per-level coefficient matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presentation {
    Native,
    Truncated { level: usize, col: usize },
}

/// Sparse representation of a truncated function: sorted flat indices at
/// the presentation level with their coefficients.
#[derive(Clone, Copy, Debug)]
pub struct SparseCoefs<'a> {
    level: usize,
    indices: &'a [usize],
    values: &'a [f64],
}

impl SparseCoefs<'_> {
    #[inline]
    pub fn presentation_level(&self) -> usize {
        self.level
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.indices
            .iter()
            .copied()
            .zip(self.values.iter().copied())
    }

    /// Coefficient of presentation-level function `flat` (zero when absent).
    #[inline]
    pub fn value_at(&self, flat: usize) -> f64 {
        match self.indices.binary_search(&flat) {
            Ok(pos) => self.values[pos],
            Err(_) => 0.0,
        }
    }
}

/// Truncated hierarchical B-spline basis: a level hierarchy plus the cached
/// sparse presentations of every truncated function.
///
/// The cache is recomputed from scratch by every successful [`refine`]
/// (`TruncatedBasis::refine`) call and is read-only afterwards, so a fully
/// built basis can be evaluated from many threads concurrently.
#[derive(Clone, Debug)]
pub struct TruncatedBasis {
    hierarchy: Hierarchy,
    presentations: Vec<Presentation>,
    level_coefs: BTreeMap<usize, SparseColMat<usize, f64>>,
    num_truncated: usize,
}

impl TruncatedBasis {
    pub fn new(basis: TensorBasis) -> Result<Self, StructuralError> {
        let hierarchy = Hierarchy::new(basis)?;
        let cache = PresentationCache::build(&hierarchy)?;
        Ok(Self {
            hierarchy,
            presentations: cache.presentations,
            level_coefs: cache.level_coefs,
            num_truncated: cache.num_truncated,
        })
    }

    #[inline]
    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.hierarchy.dim()
    }

    #[inline]
    pub fn max_level(&self) -> usize {
        self.hierarchy.max_level()
    }

    #[inline]
    pub fn num_functions(&self) -> usize {
        self.hierarchy.num_functions()
    }

    /// Native levels with functions that may be non-zero at `point`.
    pub fn active_levels_at(&self, point: &[f64]) -> Result<Vec<usize>, AccessError> {
        self.hierarchy.active_levels_at(point)
    }

    /// Marks `region` active at `target` and recomputes the presentation
    /// cache. Either the whole call applies or nothing changes.
    pub fn refine(&mut self, region: &IndexBox, target: usize) -> Result<(), StructuralError> {
        let mut next = self.hierarchy.clone();
        next.refine(region, target)?;
        let cache = PresentationCache::build(&next)?;
        self.hierarchy = next;
        self.presentations = cache.presentations;
        self.level_coefs = cache.level_coefs;
        self.num_truncated = cache.num_truncated;
        Ok(())
    }

    /// Applies an ordered sequence of `(target_level, box)` refinements.
    pub fn refine_boxes(&mut self, boxes: &[(usize, IndexBox)]) -> Result<(), StructuralError> {
        for (target, region) in boxes {
            self.refine(region, *target)?;
        }
        Ok(())
    }

    /// Number of basis functions with a truncated representation.
    #[inline]
    pub fn num_truncated(&self) -> usize {
        self.num_truncated
    }

    pub fn is_truncated(&self, id: usize) -> Result<bool, AccessError> {
        self.check_id(id)?;
        Ok(matches!(
            self.presentations[id],
            Presentation::Truncated { .. }
        ))
    }

    /// Sparse representation of basis function `id` at its presentation
    /// level. Fails for ids without one (native functions).
    pub fn coefs(&self, id: usize) -> Result<SparseCoefs<'_>, AccessError> {
        self.check_id(id)?;
        match self.presentations[id] {
            Presentation::Native => Err(AccessError::NotTruncated { id }),
            Presentation::Truncated { level, col } => Ok(self.column_coefs(level, col)),
        }
    }

    /// Level at which `id` is evaluated: its presentation level when
    /// truncated, its native level otherwise.
    pub(crate) fn evaluation_level(&self, id: usize, native_level: usize) -> usize {
        match self.presentations[id] {
            Presentation::Native => native_level,
            Presentation::Truncated { level, .. } => level,
        }
    }

    pub(crate) fn presentation(&self, id: usize) -> Presentation {
        self.presentations[id]
    }

    /// Sparse column of the per-level coefficient matrix; callers pass a
    /// `(level, col)` pair taken from a `Presentation::Truncated`.
    pub(crate) fn column_coefs(&self, level: usize, col: usize) -> SparseCoefs<'_> {
        let mat = &self.level_coefs[&level];
        let (symbolic, values) = mat.parts();
        let col_ptr = symbolic.col_ptr();
        let row_idx = symbolic.row_idx();
        let start = col_ptr[col];
        let end = col_ptr[col + 1];
        SparseCoefs {
            level,
            indices: &row_idx[start..end],
            values: &values[start..end],
        }
    }

    fn check_id(&self, id: usize) -> Result<(), AccessError> {
        if id >= self.num_functions() {
            return Err(AccessError::IdOutOfRange {
                id,
                len: self.num_functions(),
            });
        }
        Ok(())
    }
}

struct PresentationCache {
    presentations: Vec<Presentation>,
    level_coefs: BTreeMap<usize, SparseColMat<usize, f64>>,
    num_truncated: usize,
}

impl PresentationCache {
    /// Computes the sparse representation of every active function whose
    /// support overlaps a finer refined region: refine its coefficient
    /// block one level at a time by exact knot insertion, zero the
    /// coefficients of functions active at the finer level, and continue
    /// while deeper cells still overlap the remaining non-zero support.
    fn build(h: &Hierarchy) -> Result<Self, StructuralError> {
        let dim = h.dim();
        let max_level = h.max_level();
        let mut presentations = vec![Presentation::Native; h.num_functions()];
        let mut level_triplets: BTreeMap<usize, Vec<Triplet<usize, usize, f64>>> = BTreeMap::new();
        let mut level_cols: BTreeMap<usize, usize> = BTreeMap::new();
        let mut num_truncated = 0usize;

        // Per-direction two-scale transfers between consecutive levels.
        let transfers: Vec<Vec<RefinementTransfer>> = (0..max_level)
            .map(|l| {
                (0..dim)
                    .map(|k| {
                        h.basis(l)
                            .component(k)
                            .transfer_to(h.basis(l + 1).component(k))
                    })
                    .collect()
            })
            .collect();

        let mut id = 0usize;
        for level in 0..=max_level {
            for &flat in h.active_flats(level) {
                let current = id;
                id += 1;

                if !h.support_overlaps_finer(level, flat) {
                    continue;
                }

                let mut lvl = level;
                let mut lo = h.basis(level).tensor_index(flat);
                let mut block = ArrayD::from_elem(IxDyn(&vec![1usize; dim]), 1.0);
                let mut zeroed_any = false;

                loop {
                    let fine = lvl + 1;
                    for axis in 0..dim {
                        let (new_block, new_lo) = apply_axis_transfer(
                            &block,
                            lo[axis],
                            axis,
                            &transfers[lvl][axis],
                            current,
                        )?;
                        block = new_block;
                        lo[axis] = new_lo;
                    }
                    truncate_block(h, fine, &mut block, &lo, &mut zeroed_any);
                    lvl = fine;
                    if lvl == max_level || !block_overlaps_finer(h, lvl, &block, &lo) {
                        break;
                    }
                }

                if !zeroed_any {
                    continue;
                }

                let fine_basis = h.basis(lvl);
                let strides = fine_basis.strides();
                let col = level_cols.entry(lvl).or_insert(0);
                let triplets = level_triplets.entry(lvl).or_default();
                let mut any = false;
                for (idx, &v) in block.indexed_iter() {
                    if v == 0.0 {
                        continue;
                    }
                    let mut fine_flat = 0usize;
                    for k in 0..dim {
                        fine_flat += (lo[k] + idx[k]) * strides[k];
                    }
                    triplets.push(Triplet::new(fine_flat, *col, v));
                    any = true;
                }
                if !any {
                    return Err(StructuralError::FullTruncation { id: current });
                }
                presentations[current] = Presentation::Truncated { level: lvl, col: *col };
                *col += 1;
                num_truncated += 1;
            }
        }

        let mut level_coefs = BTreeMap::new();
        for (lvl, triplets) in &level_triplets {
            let ncols = level_cols[lvl];
            let nrows = h.basis(*lvl).total_size();
            let mat = SparseColMat::try_new_from_triplets(nrows, ncols, triplets)
                .map_err(|err| StructuralError::PresentationAssembly(format!("{err:?}")))?;
            level_coefs.insert(*lvl, mat);
        }

        Ok(Self {
            presentations,
            level_coefs,
            num_truncated,
        })
    }
}

/// Applies the banded two-scale transfer along one axis of the working
/// block, returning the refined block and its new lower offset.
fn apply_axis_transfer(
    block: &ArrayD<f64>,
    lo: usize,
    axis: usize,
    transfer: &RefinementTransfer,
    id: usize,
) -> Result<(ArrayD<f64>, usize), StructuralError> {
    let size = block.shape()[axis];
    let hi = lo + size - 1;
    let (jlo, jhi) = transfer.fine_range(lo, hi).ok_or_else(|| {
        StructuralError::PresentationAssembly(format!(
            "no fine functions overlap the support of basis function {id}"
        ))
    })?;

    let mut new_shape = block.shape().to_vec();
    new_shape[axis] = jhi - jlo + 1;
    let mut out = ArrayD::zeros(IxDyn(&new_shape));

    for j in jlo..=jhi {
        let (start, weights) = transfer.row(j);
        for (offset, &w) in weights.iter().enumerate() {
            let col = start + offset;
            if w == 0.0 || col < lo || col > hi {
                continue;
            }
            out.index_axis_mut(Axis(axis), j - jlo)
                .zip_mut_with(&block.index_axis(Axis(axis), col - lo), |o, &b| {
                    *o += w * b;
                });
        }
    }

    Ok((out, jlo))
}

/// Zeroes block coefficients whose associated fine-level function is active
/// in the adaptive mesh.
fn truncate_block(
    h: &Hierarchy,
    level: usize,
    block: &mut ArrayD<f64>,
    lo: &[usize],
    zeroed_any: &mut bool,
) {
    let strides = h.basis(level).strides();
    let dim = lo.len();
    for (idx, v) in block.indexed_iter_mut() {
        if *v == 0.0 {
            continue;
        }
        let mut flat = 0usize;
        for k in 0..dim {
            flat += (lo[k] + idx[k]) * strides[k];
        }
        if h.is_active(level, flat) {
            *v = 0.0;
            *zeroed_any = true;
        }
    }
}

/// Does any non-zero coefficient of the block sit on a function whose
/// support still overlaps cells deeper than `level`?
fn block_overlaps_finer(h: &Hierarchy, level: usize, block: &ArrayD<f64>, lo: &[usize]) -> bool {
    let strides = h.basis(level).strides();
    let dim = lo.len();
    for (idx, &v) in block.indexed_iter() {
        if v == 0.0 {
            continue;
        }
        let mut flat = 0usize;
        for k in 0..dim {
            flat += (lo[k] + idx[k]) * strides[k];
        }
        if h.support_overlaps_finer(level, flat) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bspline::BsplineBasis;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn cubic_1d() -> TensorBasis {
        let knots = array![0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 4.0, 4.0, 4.0];
        TensorBasis::new(vec![BsplineBasis::new(3, knots).expect("valid knots")])
    }

    #[test]
    fn unrefined_basis_has_no_truncated_functions() {
        let basis = TruncatedBasis::new(cubic_1d()).expect("1d basis");
        assert_eq!(basis.num_truncated(), 0);
        for id in 0..basis.num_functions() {
            assert!(!basis.is_truncated(id).expect("id in range"));
        }
    }

    #[test]
    fn refining_one_interval_truncates_exactly_the_overlapping_functions() {
        let mut basis = TruncatedBasis::new(cubic_1d()).expect("1d basis");
        // Parameter interval [2, 3] on the level-1 grid of 8 cells.
        basis
            .refine(&IndexBox::new(vec![4], vec![6]), 1)
            .expect("single-level refinement");

        // Coarse functions whose support intersects the open interval
        // (2, 3) are ids 2..=5; ids 0, 1, 6 and all fine functions stay
        // native.
        assert_eq!(basis.num_truncated(), 4);
        for id in 0..7 {
            let expect = (2..=5).contains(&id);
            assert_eq!(basis.is_truncated(id).expect("id in range"), expect);
        }
        for id in 7..basis.num_functions() {
            assert!(!basis.is_truncated(id).expect("id in range"));
        }
    }

    #[test]
    fn coefs_on_native_function_is_an_access_error() {
        let mut basis = TruncatedBasis::new(cubic_1d()).expect("1d basis");
        basis
            .refine(&IndexBox::new(vec![4], vec![6]), 1)
            .expect("single-level refinement");
        assert!(matches!(
            basis.coefs(0),
            Err(AccessError::NotTruncated { id: 0 })
        ));
        assert!(matches!(
            basis.coefs(basis.num_functions()),
            Err(AccessError::IdOutOfRange { .. })
        ));
        let coefs = basis.coefs(2).expect("id 2 is truncated");
        assert_eq!(coefs.presentation_level(), 1);
        assert!(!coefs.is_empty());
    }

    #[test]
    fn truncation_zeroes_exactly_the_active_fine_coefficients() {
        let mut basis = TruncatedBasis::new(cubic_1d()).expect("1d basis");
        basis
            .refine(&IndexBox::new(vec![4], vec![6]), 1)
            .expect("single-level refinement");

        let fine_active = basis.hierarchy().active_flats(1).to_vec();
        for id in 2..=5 {
            let coefs = basis.coefs(id).expect("truncated id");
            for &fine in &fine_active {
                assert_abs_diff_eq!(coefs.value_at(fine), 0.0, epsilon = 0.0);
            }
            assert!(coefs.iter().any(|(_, v)| v != 0.0));
        }
    }

    #[test]
    fn failed_refine_leaves_the_cache_untouched() {
        let mut basis = TruncatedBasis::new(cubic_1d()).expect("1d basis");
        basis
            .refine(&IndexBox::new(vec![4], vec![6]), 1)
            .expect("valid refinement");
        let before = basis.num_truncated();
        assert!(basis.refine(&IndexBox::new(vec![0], vec![4]), 2).is_err());
        assert_eq!(basis.num_truncated(), before);
        assert_eq!(basis.max_level(), 1);
    }

    #[test]
    fn multi_level_refinement_deepens_presentations() {
        let mut basis = TruncatedBasis::new(cubic_1d()).expect("1d basis");
        basis
            .refine_boxes(&[
                (1, IndexBox::new(vec![2], vec![6])),
                (2, IndexBox::new(vec![6], vec![8])),
            ])
            .expect("two-level refinement");
        assert_eq!(basis.max_level(), 2);
        // Level-1 functions overlapping the level-2 interval [1.5, 2] are
        // presented at level 2.
        let deepest = (0..basis.num_functions())
            .filter_map(|id| basis.coefs(id).ok())
            .map(|c| c.presentation_level())
            .max();
        assert_eq!(deepest, Some(2));
    }

    #[test]
    fn refinement_fully_covering_a_support_is_rejected() {
        let mut basis = TruncatedBasis::new(cubic_1d()).expect("1d basis");
        basis
            .refine(&IndexBox::new(vec![2], vec![6]), 1)
            .expect("single-level refinement");
        let before = basis.num_truncated();

        // The level-2 interval [1.5, 2.5] covers the full support [1, 3] of
        // an interior level-1 function; truncation would zero every one of
        // its coefficients.
        let result = basis.refine(&IndexBox::new(vec![6], vec![10]), 2);
        assert!(matches!(
            result,
            Err(StructuralError::FullTruncation { .. })
        ));
        assert_eq!(basis.max_level(), 1);
        assert_eq!(basis.num_truncated(), before);
    }
}
