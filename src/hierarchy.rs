use ndarray::{ArrayD, ArrayViewD, IxDyn, SliceInfoElem};

use crate::error::{AccessError, StructuralError};
use crate::tensor::TensorBasis;

/// Axis-aligned box in cell-index space, half-open per direction:
/// cells `low[k] .. high[k]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexBox {
    pub low: Vec<usize>,
    pub high: Vec<usize>,
}

impl IndexBox {
    pub fn new(low: Vec<usize>, high: Vec<usize>) -> Self {
        Self { low, high }
    }
}

/// One candidate basis function at a query point.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Candidate {
    pub id: usize,
    pub level: usize,
    pub flat: usize,
}

/// Nested sequence of dyadically refined tensor-product levels together
/// with the adaptive mesh: a cell-level raster at the finest grid and the
/// per-level sets of active basis functions.
///
/// A tensor function of level `l` is active exactly when its support
/// contains at least one cell carrying level `l`. Global ids enumerate the
/// active functions level by level, flat index ascending within a level.
#[derive(Clone, Debug)]
pub struct Hierarchy {
    bases: Vec<TensorBasis>,
    /// Level of every cell of the finest grid. Each cell belongs to exactly
    /// one level, so levels partition the index domain.
    cell_levels: ArrayD<usize>,
    /// Per level, the sorted flat indices of active functions.
    active: Vec<Vec<usize>>,
    /// Global id offset per level; `offsets[l]..offsets[l + 1]` are the ids
    /// native to level `l`.
    offsets: Vec<usize>,
}

impl Hierarchy {
    pub fn new(basis: TensorBasis) -> Result<Self, StructuralError> {
        if basis.dim() == 0 {
            return Err(StructuralError::NoDirections);
        }
        let cells = basis.cells();
        let cell_levels = ArrayD::zeros(IxDyn(&cells));
        let total = basis.total_size();
        let mut hierarchy = Self {
            bases: vec![basis],
            cell_levels,
            active: vec![(0..total).collect()],
            offsets: vec![0, total],
        };
        hierarchy.rebuild_active();
        Ok(hierarchy)
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.bases[0].dim()
    }

    /// Deepest level currently present.
    #[inline]
    pub fn max_level(&self) -> usize {
        self.bases.len() - 1
    }

    #[inline]
    pub fn basis(&self, level: usize) -> &TensorBasis {
        &self.bases[level]
    }

    /// Total number of active basis functions across all levels.
    #[inline]
    pub fn num_functions(&self) -> usize {
        *self.offsets.last().unwrap_or(&0)
    }

    /// Cells per direction of the finest grid; refinement boxes and the
    /// domain decomposition are expressed in this index space.
    pub fn finest_cells(&self) -> Vec<usize> {
        self.bases[self.max_level()].cells()
    }

    pub(crate) fn cell_levels(&self) -> ArrayViewD<'_, usize> {
        self.cell_levels.view()
    }

    /// Native level and flat tensor index of a global id.
    pub fn function(&self, id: usize) -> Result<(usize, usize), AccessError> {
        if id >= self.num_functions() {
            return Err(AccessError::IdOutOfRange {
                id,
                len: self.num_functions(),
            });
        }
        let level = self.offsets.partition_point(|&o| o <= id) - 1;
        Ok((level, self.active[level][id - self.offsets[level]]))
    }

    /// Global id of an active function, if `flat` is active at `level`.
    pub fn global_id(&self, level: usize, flat: usize) -> Option<usize> {
        self.active[level]
            .binary_search(&flat)
            .ok()
            .map(|pos| self.offsets[level] + pos)
    }

    #[inline]
    pub fn is_active(&self, level: usize, flat: usize) -> bool {
        self.active[level].binary_search(&flat).is_ok()
    }

    pub(crate) fn active_flats(&self, level: usize) -> &[usize] {
        &self.active[level]
    }

    /// Marks `region` active at `target`. The box is interpreted in the
    /// cell-index space of the finest level after accounting for `target`
    /// (the grid of `max(max_level, target)`). The call either applies fully
    /// or leaves the hierarchy untouched.
    pub fn refine(&mut self, region: &IndexBox, target: usize) -> Result<(), StructuralError> {
        let dim = self.dim();
        if region.low.len() != dim || region.high.len() != dim {
            return Err(StructuralError::BoxDimensionMismatch {
                expected: dim,
                got: region.low.len().max(region.high.len()),
            });
        }
        if target == 0 || target > self.max_level() + 1 {
            return Err(StructuralError::LevelOutOfRange {
                requested: target,
                max_level: self.max_level(),
            });
        }

        let grows = target > self.max_level();
        let scale = if grows { 2usize } else { 1 };
        let finest = self.finest_cells();

        for k in 0..dim {
            if region.low[k] >= region.high[k] {
                return Err(StructuralError::EmptyBox {
                    low: region.low.clone(),
                    high: region.high.clone(),
                });
            }
            if region.high[k] > finest[k] * scale {
                return Err(StructuralError::BoxOutOfDomain {
                    low: region.low.clone(),
                    high: region.high.clone(),
                    cells: finest.iter().map(|&c| c * scale).collect(),
                });
            }
        }

        // Coarsest level currently overlapping the box, checked on the
        // current grid before any mutation.
        let current_lo: Vec<usize> = region.low.iter().map(|&l| l / scale).collect();
        let current_hi: Vec<usize> = region.high.iter().map(|&h| h.div_ceil(scale)).collect();
        let slice = box_slice(&current_lo, &current_hi);
        let coarsest = self
            .cell_levels
            .slice(slice.as_slice())
            .iter()
            .copied()
            .min()
            .unwrap_or(0);
        if coarsest + 1 != target {
            return Err(StructuralError::LevelJump {
                requested: target,
                coarsest,
            });
        }

        // All checks passed; mutate.
        if grows {
            let next = self.bases[self.max_level()].dyadic_refine();
            self.bases.push(next);
            let new_shape: Vec<usize> = self.cell_levels.shape().iter().map(|&c| c * 2).collect();
            let old = self.cell_levels.clone();
            self.cell_levels = ArrayD::from_shape_fn(IxDyn(&new_shape), |idx| {
                let coarse: Vec<usize> = (0..dim).map(|k| idx[k] / 2).collect();
                old[IxDyn(&coarse)]
            });
        }

        let slice = box_slice(&region.low, &region.high);
        self.cell_levels
            .slice_mut(slice.as_slice())
            .map_inplace(|c| *c = (*c).max(target));

        self.rebuild_active();
        Ok(())
    }

    /// Finest-grid cell box (inclusive per direction) covered by the
    /// support of function `flat` at `level`.
    pub(crate) fn support_box_finest(&self, level: usize, flat: usize) -> (Vec<usize>, Vec<usize>) {
        let basis = &self.bases[level];
        let tensor = basis.tensor_index(flat);
        let shift = self.max_level() - level;
        let mut lo = Vec::with_capacity(basis.dim());
        let mut hi = Vec::with_capacity(basis.dim());
        for (k, &i) in tensor.iter().enumerate() {
            let (clo, chi) = basis.component(k).support_cells(i);
            lo.push(clo << shift);
            hi.push(((chi + 1) << shift) - 1);
        }
        (lo, hi)
    }

    /// Does the support of `flat` at `level` contain any cell deeper than
    /// `level`?
    pub(crate) fn support_overlaps_finer(&self, level: usize, flat: usize) -> bool {
        let (lo, hi) = self.support_box_finest(level, flat);
        let hi_open: Vec<usize> = hi.iter().map(|&h| h + 1).collect();
        let slice = box_slice(&lo, &hi_open);
        self.cell_levels
            .slice(slice.as_slice())
            .iter()
            .any(|&c| c > level)
    }

    /// Validates dimension and domain membership of a query point.
    pub fn check_point(&self, point: &[f64]) -> Result<(), AccessError> {
        if point.len() != self.dim() {
            return Err(AccessError::DimensionMismatch {
                expected: self.dim(),
                got: point.len(),
            });
        }
        for (dir, &x) in point.iter().enumerate() {
            let (min, max) = self.bases[0].component(dir).domain();
            if !(x >= min && x <= max) {
                return Err(AccessError::PointOutOfDomain {
                    dir,
                    value: x,
                    min,
                    max,
                });
            }
        }
        Ok(())
    }

    /// All active functions whose support covers `point`, ascending by
    /// global id.
    pub(crate) fn candidates_at(&self, point: &[f64]) -> Result<Vec<Candidate>, AccessError> {
        self.check_point(point)?;
        let dim = self.dim();
        let mut out = Vec::new();
        for level in 0..=self.max_level() {
            let basis = &self.bases[level];
            let strides = basis.strides();
            let mut first = Vec::with_capacity(dim);
            let mut counts = Vec::with_capacity(dim);
            for k in 0..dim {
                first.push(basis.component(k).first_active(point[k]));
                counts.push(basis.component(k).degree() + 1);
            }
            let n: usize = counts.iter().product();
            let mut idx = vec![0usize; dim];
            for _ in 0..n {
                let mut flat = 0usize;
                for k in 0..dim {
                    flat += (first[k] + idx[k]) * strides[k];
                }
                if let Some(id) = self.global_id(level, flat) {
                    out.push(Candidate { id, level, flat });
                }
                for k in 0..dim {
                    idx[k] += 1;
                    if idx[k] < counts[k] {
                        break;
                    }
                    idx[k] = 0;
                }
            }
        }
        Ok(out)
    }

    /// Native levels with at least one active function covering `point`.
    pub fn active_levels_at(&self, point: &[f64]) -> Result<Vec<usize>, AccessError> {
        let candidates = self.candidates_at(point)?;
        let mut levels: Vec<usize> = Vec::new();
        for c in candidates {
            if levels.last() != Some(&c.level) {
                levels.push(c.level);
            }
        }
        Ok(levels)
    }

    fn rebuild_active(&mut self) {
        let dim = self.dim();
        let max_level = self.max_level();
        let mut active = Vec::with_capacity(max_level + 1);
        for level in 0..=max_level {
            let basis = &self.bases[level];
            let mut flats = Vec::new();
            let sizes: Vec<usize> = (0..dim).map(|k| basis.size(k)).collect();
            let total: usize = sizes.iter().product();
            let mut tensor = vec![0usize; dim];
            for flat in 0..total {
                let shift = max_level - level;
                let mut lo = Vec::with_capacity(dim);
                let mut hi_open = Vec::with_capacity(dim);
                for k in 0..dim {
                    let (clo, chi) = basis.component(k).support_cells(tensor[k]);
                    lo.push(clo << shift);
                    hi_open.push((chi + 1) << shift);
                }
                let slice = box_slice(&lo, &hi_open);
                if self
                    .cell_levels
                    .slice(slice.as_slice())
                    .iter()
                    .any(|&c| c == level)
                {
                    flats.push(flat);
                }
                for k in 0..dim {
                    tensor[k] += 1;
                    if tensor[k] < sizes[k] {
                        break;
                    }
                    tensor[k] = 0;
                }
            }
            active.push(flats);
        }

        let mut offsets = Vec::with_capacity(max_level + 2);
        offsets.push(0);
        for flats in &active {
            offsets.push(offsets.last().copied().unwrap_or(0) + flats.len());
        }
        self.active = active;
        self.offsets = offsets;
    }
}

fn box_slice(lo: &[usize], hi_open: &[usize]) -> Vec<SliceInfoElem> {
    lo.iter()
        .zip(hi_open.iter())
        .map(|(&l, &h)| SliceInfoElem::Slice {
            start: l as isize,
            end: Some(h as isize),
            step: 1,
        })
        .collect()
}
