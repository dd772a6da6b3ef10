use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayView2, ArrayViewMut1, Axis};

use crate::error::AccessError;
use crate::hierarchy::Candidate;
use crate::tensor::{TensorBand, TensorScratch};
use crate::truncation::{Presentation, TruncatedBasis};

/// Padding value in [`ActiveFunctions::ids`] for slots past the per-point
/// active count.
pub const NO_FUNCTION: usize = usize::MAX;

/// Active basis functions per query point, in ascending global id order.
///
/// `ids` has one column per point and as many rows as the largest per-point
/// count; unused slots hold [`NO_FUNCTION`]. Row `slot` of an evaluation
/// matrix corresponds to the function in `ids[[slot, j]]`.
#[derive(Clone, Debug)]
pub struct ActiveFunctions {
    pub ids: Array2<usize>,
    pub counts: Vec<usize>,
}

const PAR_THRESHOLD: usize = 256;
const CHUNK_SIZE: usize = 256;

impl TruncatedBasis {
    /// Global ids of the basis functions that may be non-zero at each query
    /// point. `points` holds one point per row.
    pub fn active_functions(
        &self,
        points: ArrayView2<f64>,
    ) -> Result<ActiveFunctions, AccessError> {
        let candidates = self.collect_candidates(points)?;
        let n_points = candidates.len();
        let counts: Vec<usize> = candidates.iter().map(Vec::len).collect();
        let max_count = counts.iter().copied().max().unwrap_or(0);
        let mut ids = Array2::from_elem((max_count, n_points), NO_FUNCTION);
        for (j, cands) in candidates.iter().enumerate() {
            for (slot, c) in cands.iter().enumerate() {
                ids[[slot, j]] = c.id;
            }
        }
        Ok(ActiveFunctions { ids, counts })
    }

    /// Evaluates all active functions at every query point, one column per
    /// point. Row block `slot * ncomp .. (slot + 1) * ncomp` holds the
    /// components of the function in slot `slot` of [`active_functions`]
    /// (`TruncatedBasis::active_functions`); `ncomp` is 1 for values, `d`
    /// for gradients, and `d (d + 1) / 2` for second derivatives (pure
    /// derivatives first, then mixed pairs).
    pub fn evaluate(
        &self,
        points: ArrayView2<f64>,
        order: usize,
    ) -> Result<Array2<f64>, AccessError> {
        check_order(order)?;
        let candidates = self.collect_candidates(points)?;
        let ncomp = self.hierarchy().basis(0).num_components(order);
        let max_count = candidates.iter().map(Vec::len).max().unwrap_or(0);
        let mut out = Array2::zeros((max_count * ncomp, points.nrows()));

        let mut scratch = TensorScratch::new(self.hierarchy().basis(0).max_degree());
        let mut point = Vec::with_capacity(self.dim());
        for (j, mut col) in out.axis_iter_mut(Axis(1)).enumerate() {
            point.clear();
            point.extend(points.row(j).iter());
            for (slot, c) in candidates[j].iter().enumerate() {
                let level = self.evaluation_level(c.id, c.level);
                let band = self.hierarchy().basis(level).band(&point, order, &mut scratch);
                self.write_components(c, &band, ncomp, slot, &mut col);
            }
        }
        Ok(out)
    }

    /// Same results as [`evaluate`] (`TruncatedBasis::evaluate`), bit for
    /// bit, but caches the tensor band of each level once per point and
    /// processes large point sets in parallel.
    pub fn evaluate_fast(
        &self,
        points: ArrayView2<f64>,
        order: usize,
    ) -> Result<Array2<f64>, AccessError> {
        check_order(order)?;
        let candidates = self.collect_candidates(points)?;
        let ncomp = self.hierarchy().basis(0).num_components(order);
        let max_count = candidates.iter().map(Vec::len).max().unwrap_or(0);
        let mut out = Array2::zeros((max_count * ncomp, points.nrows()));

        let n_points = points.nrows();
        let n_levels = self.max_level() + 1;
        let degree = self.hierarchy().basis(0).max_degree();

        if n_points >= PAR_THRESHOLD {
            out.axis_chunks_iter_mut(Axis(1), CHUNK_SIZE)
                .into_par_iter()
                .enumerate()
                .for_each(|(chunk, mut cols)| {
                    let mut scratch = TensorScratch::new(degree);
                    let mut bands: Vec<Option<TensorBand>> = vec![None; n_levels];
                    let mut point = Vec::with_capacity(self.dim());
                    for (local, mut col) in cols.axis_iter_mut(Axis(1)).enumerate() {
                        let j = chunk * CHUNK_SIZE + local;
                        point.clear();
                        point.extend(points.row(j).iter());
                        self.fill_cached_column(
                            &candidates[j],
                            &point,
                            order,
                            ncomp,
                            &mut scratch,
                            &mut bands,
                            &mut col,
                        );
                    }
                });
        } else {
            let mut scratch = TensorScratch::new(degree);
            let mut bands: Vec<Option<TensorBand>> = vec![None; n_levels];
            let mut point = Vec::with_capacity(self.dim());
            for (j, mut col) in out.axis_iter_mut(Axis(1)).enumerate() {
                point.clear();
                point.extend(points.row(j).iter());
                self.fill_cached_column(
                    &candidates[j],
                    &point,
                    order,
                    ncomp,
                    &mut scratch,
                    &mut bands,
                    &mut col,
                );
            }
        }
        Ok(out)
    }

    fn collect_candidates(
        &self,
        points: ArrayView2<f64>,
    ) -> Result<Vec<Vec<Candidate>>, AccessError> {
        let mut all = Vec::with_capacity(points.nrows());
        let mut point = Vec::with_capacity(self.dim());
        for row in points.outer_iter() {
            point.clear();
            point.extend(row.iter());
            all.push(self.hierarchy().candidates_at(&point)?);
        }
        Ok(all)
    }

    fn fill_cached_column(
        &self,
        candidates: &[Candidate],
        point: &[f64],
        order: usize,
        ncomp: usize,
        scratch: &mut TensorScratch,
        bands: &mut [Option<TensorBand>],
        col: &mut ArrayViewMut1<f64>,
    ) {
        for slot in bands.iter_mut() {
            *slot = None;
        }
        for (slot, c) in candidates.iter().enumerate() {
            let level = self.evaluation_level(c.id, c.level);
            let band = bands[level].get_or_insert_with(|| {
                self.hierarchy().basis(level).band(point, order, scratch)
            });
            self.write_components(c, band, ncomp, slot, col);
        }
    }

    /// Writes the `ncomp` components of one candidate into its row block.
    /// Native functions read straight off the band; truncated functions
    /// contract their sparse presentation coefficients against it.
    fn write_components(
        &self,
        c: &Candidate,
        band: &TensorBand,
        ncomp: usize,
        slot: usize,
        col: &mut ArrayViewMut1<f64>,
    ) {
        let base = slot * ncomp;
        match self.presentation(c.id) {
            Presentation::Native => {
                if let Some(pos) = band.position(c.flat) {
                    for comp in 0..ncomp {
                        col[base + comp] = band.comps[[pos, comp]];
                    }
                }
            }
            Presentation::Truncated { level, col: column } => {
                let coefs = self.column_coefs(level, column);
                for (pos, &flat) in band.flats.iter().enumerate() {
                    let w = coefs.value_at(flat);
                    if w != 0.0 {
                        for comp in 0..ncomp {
                            col[base + comp] += w * band.comps[[pos, comp]];
                        }
                    }
                }
            }
        }
    }
}

fn check_order(order: usize) -> Result<(), AccessError> {
    if order > 2 {
        return Err(AccessError::UnsupportedOrder(order));
    }
    Ok(())
}
