use crate::error::StructuralError;
use ndarray::{Array1, ArrayView1};

/// Reusable buffers for the Cox-de Boor recurrence. Reused across points to
/// avoid re-allocating the three working vectors on every evaluation.
#[derive(Clone, Debug)]
pub(crate) struct DeBoorScratch {
    left: Vec<f64>,
    right: Vec<f64>,
    n: Vec<f64>,
}

impl DeBoorScratch {
    #[inline]
    pub(crate) fn new(degree: usize) -> Self {
        let len = degree + 1;
        Self {
            left: vec![0.0; len],
            right: vec![0.0; len],
            n: vec![0.0; len],
        }
    }

    #[inline]
    fn ensure_degree(&mut self, degree: usize) {
        let len = degree + 1;
        if self.left.len() != len {
            self.left.resize(len, 0.0);
            self.right.resize(len, 0.0);
            self.n.resize(len, 0.0);
        }
    }
}

/// Buffers for band evaluation of values and derivatives. The lower-degree
/// buffers hold intermediate bases used by the derivative recurrences.
#[derive(Clone, Debug)]
pub(crate) struct BandScratch {
    deboor: DeBoorScratch,
    lower: Vec<f64>,
    lower_deboor: DeBoorScratch,
    lower_lower: Vec<f64>,
    lower_lower_deboor: DeBoorScratch,
}

impl BandScratch {
    pub(crate) fn new(degree: usize) -> Self {
        let lower = degree.saturating_sub(1);
        let lower_lower = degree.saturating_sub(2);
        Self {
            deboor: DeBoorScratch::new(degree),
            lower: vec![0.0; lower + 1],
            lower_deboor: DeBoorScratch::new(lower),
            lower_lower: vec![0.0; lower_lower + 1],
            lower_lower_deboor: DeBoorScratch::new(lower_lower),
        }
    }
}

/// Locates the knot span containing `x`, with boundary spans selected for
/// points at (or beyond) the ends of the domain.
#[inline]
fn find_span(x: f64, degree: usize, knots: &[f64]) -> usize {
    let num_basis = knots.len() - degree - 1;
    if x >= knots[num_basis] {
        num_basis - 1
    } else if x < knots[degree] {
        degree
    } else {
        let mut span = degree;
        while span < num_basis && x >= knots[span + 1] {
            span += 1;
        }
        span
    }
}

/// Evaluates the `degree + 1` potentially non-zero basis values at `x` into
/// `values` and returns the index of the first one. Numerically stable
/// Cox-de Boor recurrence (Algorithm A2.2, "The NURBS Book").
#[inline]
fn value_band(
    x: f64,
    degree: usize,
    knots: &[f64],
    values: &mut [f64],
    scratch: &mut DeBoorScratch,
) -> usize {
    debug_assert_eq!(values.len(), degree + 1);

    scratch.ensure_degree(degree);
    scratch.n.fill(0.0);
    scratch.left.fill(0.0);
    scratch.right.fill(0.0);

    let mu = find_span(x, degree, knots);

    let left = &mut scratch.left;
    let right = &mut scratch.right;
    let n = &mut scratch.n;

    n[0] = 1.0;

    for d in 1..=degree {
        left[d] = x - knots[mu + 1 - d];
        right[d] = knots[mu + d] - x;

        let mut saved = 0.0;

        for r in 0..d {
            let den = right[r + 1] + left[d - r];
            let temp = if den.abs() > 1e-12 { n[r] / den } else { 0.0 };

            n[r] = saved + right[r + 1] * temp;
            saved = left[d - r] * temp;
        }
        n[d] = saved;
    }

    values.copy_from_slice(n);
    mu - degree
}

/// First-derivative band via the lower-degree basis:
/// B'_{i,p}(x) = p * ( B_{i,p-1}(x)/(t_{i+p}-t_i) - B_{i+1,p-1}(x)/(t_{i+p+1}-t_{i+1}) ).
/// `lower_values` receives the degree-(p-1) band as a side effect.
fn derivative_band_with_lower(
    x: f64,
    degree: usize,
    knots: &[f64],
    values: &mut [f64],
    scratch: &mut DeBoorScratch,
    lower_values: &mut [f64],
    lower_scratch: &mut DeBoorScratch,
) -> usize {
    let start = value_band(x, degree, knots, values, scratch);
    if degree == 0 {
        values.fill(0.0);
        return start;
    }

    let lower_degree = degree - 1;
    let lower_support = lower_degree + 1;
    debug_assert_eq!(lower_values.len(), lower_support);

    let start_lower = value_band(x, lower_degree, knots, lower_values, lower_scratch);

    values.fill(0.0);
    for offset in 0..=degree {
        let i = start + offset;
        let left_idx = i as isize - start_lower as isize;
        let right_idx = (i + 1) as isize - start_lower as isize;
        let left = if left_idx >= 0 && (left_idx as usize) < lower_support {
            lower_values[left_idx as usize]
        } else {
            0.0
        };
        let right = if right_idx >= 0 && (right_idx as usize) < lower_support {
            lower_values[right_idx as usize]
        } else {
            0.0
        };
        let denom_left = knots[i + degree] - knots[i];
        let denom_right = knots[i + degree + 1] - knots[i + 1];
        let left_term = if denom_left.abs() > 1e-12 {
            left / denom_left
        } else {
            0.0
        };
        let right_term = if denom_right.abs() > 1e-12 {
            right / denom_right
        } else {
            0.0
        };
        values[offset] = (degree as f64) * (left_term - right_term);
    }

    start
}

/// A univariate B-spline basis on a clamped, non-decreasing knot vector.
#[derive(Clone, Debug)]
pub struct BsplineBasis {
    degree: usize,
    knots: Array1<f64>,
    /// Distinct knot values spanning the domain; consecutive pairs bound the
    /// index cells of this level.
    breaks: Vec<f64>,
}

impl BsplineBasis {
    pub fn new(degree: usize, knots: Array1<f64>) -> Result<Self, StructuralError> {
        if degree < 1 {
            return Err(StructuralError::InvalidDegree(degree));
        }
        let required = 2 * (degree + 1);
        if knots.len() < required {
            return Err(StructuralError::InsufficientKnots {
                degree,
                required,
                provided: knots.len(),
            });
        }
        if knots.iter().any(|k| !k.is_finite()) {
            return Err(StructuralError::InvalidKnotVector(
                "knot vector contains non-finite (NaN or Infinity) values".to_string(),
            ));
        }
        for i in 0..knots.len() - 1 {
            if knots[i] > knots[i + 1] {
                return Err(StructuralError::InvalidKnotVector(
                    "knot vector is not non-decreasing".to_string(),
                ));
            }
        }
        let num_basis = knots.len() - degree - 1;
        if knots[degree] >= knots[num_basis] {
            return Err(StructuralError::InvalidKnotVector(
                "knot vector has an empty parametric domain".to_string(),
            ));
        }
        let breaks = compute_breaks(&knots, degree, num_basis);
        Ok(Self {
            degree,
            knots,
            breaks,
        })
    }

    #[inline]
    pub fn degree(&self) -> usize {
        self.degree
    }

    #[inline]
    pub fn num_basis(&self) -> usize {
        self.knots.len() - self.degree - 1
    }

    #[inline]
    pub fn knots(&self) -> ArrayView1<'_, f64> {
        self.knots.view()
    }

    /// Parametric domain `[t_p, t_{n}]`.
    #[inline]
    pub fn domain(&self) -> (f64, f64) {
        (self.knots[self.degree], self.knots[self.num_basis()])
    }

    /// Number of index cells (non-empty knot spans) at this level.
    #[inline]
    pub fn num_cells(&self) -> usize {
        self.breaks.len() - 1
    }

    #[inline]
    pub fn breaks(&self) -> &[f64] {
        &self.breaks
    }

    /// Index of the first basis function that is non-zero at `x`.
    #[inline]
    pub fn first_active(&self, x: f64) -> usize {
        find_span(x, self.degree, self.knots.as_slice().unwrap_or(&[])) - self.degree
    }

    /// Index of the cell containing `x` (points on an interior cell boundary
    /// belong to the cell on their right; the domain end belongs to the last
    /// cell).
    #[inline]
    pub fn cell_of(&self, x: f64) -> usize {
        let idx = self.breaks.partition_point(|&b| b <= x);
        if idx == 0 {
            0
        } else {
            (idx - 1).min(self.num_cells() - 1)
        }
    }

    /// Inclusive cell range covered by the support of basis function `i`.
    pub fn support_cells(&self, i: usize) -> (usize, usize) {
        let t_lo = self.knots[i];
        let t_hi = self.knots[i + self.degree + 1];
        let lo = self.breaks.partition_point(|&b| b < t_lo);
        let hi = self.breaks.partition_point(|&b| b < t_hi);
        let last = self.num_cells() - 1;
        (lo.min(last), hi.saturating_sub(1).min(last))
    }

    pub(crate) fn value_band_into(
        &self,
        x: f64,
        values: &mut [f64],
        scratch: &mut BandScratch,
    ) -> usize {
        value_band(
            x,
            self.degree,
            self.knots_slice(),
            values,
            &mut scratch.deboor,
        )
    }

    pub(crate) fn deriv_band_into(
        &self,
        x: f64,
        values: &mut [f64],
        scratch: &mut BandScratch,
    ) -> usize {
        let lower = self.degree.saturating_sub(1);
        if scratch.lower.len() != lower + 1 {
            scratch.lower.resize(lower + 1, 0.0);
        }
        derivative_band_with_lower(
            x,
            self.degree,
            self.knots_slice(),
            values,
            &mut scratch.deboor,
            &mut scratch.lower,
            &mut scratch.lower_deboor,
        )
    }

    pub(crate) fn deriv2_band_into(
        &self,
        x: f64,
        values: &mut [f64],
        scratch: &mut BandScratch,
    ) -> usize {
        let degree = self.degree;
        let knots = self.knots_slice();
        let start = value_band(x, degree, knots, values, &mut scratch.deboor);
        if degree < 2 {
            values.fill(0.0);
            return start;
        }

        let lower_degree = degree - 1;
        let lower_support = lower_degree + 1;
        if scratch.lower.len() != lower_support {
            scratch.lower.resize(lower_support, 0.0);
        }
        let lower_lower_support = lower_degree;
        if scratch.lower_lower.len() != lower_lower_support {
            scratch.lower_lower.resize(lower_lower_support, 0.0);
        }

        // scratch.lower receives B'_{i,p-1}; applying the derivative
        // recurrence once more yields the second derivative of degree p.
        let start_lower = derivative_band_with_lower(
            x,
            lower_degree,
            knots,
            &mut scratch.lower,
            &mut scratch.lower_deboor,
            &mut scratch.lower_lower,
            &mut scratch.lower_lower_deboor,
        );

        values.fill(0.0);
        for offset in 0..=degree {
            let i = start + offset;
            let left_idx = i as isize - start_lower as isize;
            let right_idx = (i + 1) as isize - start_lower as isize;
            let left = if left_idx >= 0 && (left_idx as usize) < lower_support {
                scratch.lower[left_idx as usize]
            } else {
                0.0
            };
            let right = if right_idx >= 0 && (right_idx as usize) < lower_support {
                scratch.lower[right_idx as usize]
            } else {
                0.0
            };
            let denom_left = knots[i + degree] - knots[i];
            let denom_right = knots[i + degree + 1] - knots[i + 1];
            let left_term = if denom_left.abs() > 1e-12 {
                left / denom_left
            } else {
                0.0
            };
            let right_term = if denom_right.abs() > 1e-12 {
                right / denom_right
            } else {
                0.0
            };
            values[offset] = (degree as f64) * (left_term - right_term);
        }

        start
    }

    /// The next dyadic refinement level: the midpoint of every non-empty
    /// knot span is inserted once, existing multiplicities are preserved.
    pub fn dyadic_refine(&self) -> BsplineBasis {
        let old = self.knots_slice();
        let mut knots = Vec::with_capacity(old.len() + self.num_cells());
        for i in 0..old.len() - 1 {
            knots.push(old[i]);
            if old[i + 1] > old[i] {
                knots.push(0.5 * (old[i] + old[i + 1]));
            }
        }
        knots.push(old[old.len() - 1]);
        let knots = Array1::from_vec(knots);
        let num_basis = knots.len() - self.degree - 1;
        let breaks = compute_breaks(&knots, self.degree, num_basis);
        BsplineBasis {
            degree: self.degree,
            knots,
            breaks,
        }
    }

    /// Exact degree-preserving knot-insertion transfer onto `fine`, whose
    /// knot vector must contain this basis' knots (as dyadic refinements
    /// do). Row `j` holds the weights expressing fine function `j` in the
    /// expansion of the coarse functions `start..=start+p`:
    /// `B_i = sum_j rows[j][i - start_j] * Bfine_j`.
    pub fn transfer_to(&self, fine: &BsplineBasis) -> RefinementTransfer {
        let p = self.degree;
        let coarse = self.knots_slice();
        let tau = fine.knots_slice();
        let mut rows = Vec::with_capacity(fine.num_basis());

        for j in 0..fine.num_basis() {
            let mu = find_span(tau[j], p, coarse);
            let mut n = vec![0.0; p + 1];
            n[0] = 1.0;

            // The de Boor recurrence with the evaluation abscissa replaced
            // by the fine knot tau[j + stage] at each stage (Oslo algorithm I).
            for stage in 1..=p {
                let x = tau[j + stage];
                let mut saved = 0.0;
                for q in 0..stage {
                    let den = coarse[mu + q + 1] - coarse[mu + q + 1 - stage];
                    let temp = if den.abs() > 1e-12 { n[q] / den } else { 0.0 };
                    n[q] = saved + (coarse[mu + q + 1] - x) * temp;
                    saved = (x - coarse[mu + q + 1 - stage]) * temp;
                }
                n[stage] = saved;
            }

            rows.push(TransferRow {
                start: mu - p,
                weights: n,
            });
        }

        RefinementTransfer {
            rows,
            num_coarse: self.num_basis(),
        }
    }

    #[inline]
    fn knots_slice(&self) -> &[f64] {
        self.knots.as_slice().unwrap_or(&[])
    }
}

fn compute_breaks(knots: &Array1<f64>, degree: usize, num_basis: usize) -> Vec<f64> {
    let mut breaks: Vec<f64> = Vec::new();
    for &k in knots.iter().take(num_basis + 1).skip(degree) {
        if breaks.last().map_or(true, |&b| k > b) {
            breaks.push(k);
        }
    }
    breaks
}

/// Banded knot-insertion matrix from a coarse level onto one of its
/// refinements. One row per fine basis function.
#[derive(Clone, Debug)]
pub struct RefinementTransfer {
    rows: Vec<TransferRow>,
    num_coarse: usize,
}

#[derive(Clone, Debug)]
struct TransferRow {
    start: usize,
    weights: Vec<f64>,
}

impl RefinementTransfer {
    #[inline]
    pub fn num_fine(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn num_coarse(&self) -> usize {
        self.num_coarse
    }

    /// Weights of fine row `j` over coarse columns `start..start + weights.len()`.
    #[inline]
    pub fn row(&self, j: usize) -> (usize, &[f64]) {
        let row = &self.rows[j];
        (row.start, &row.weights)
    }

    /// Inclusive range of fine rows whose band intersects the coarse column
    /// range `[lo, hi]`, or `None` when no row does.
    pub fn fine_range(&self, lo: usize, hi: usize) -> Option<(usize, usize)> {
        let mut first = None;
        let mut last = None;
        for (j, row) in self.rows.iter().enumerate() {
            let row_hi = row.start + row.weights.len() - 1;
            if row.start <= hi && row_hi >= lo {
                if first.is_none() {
                    first = Some(j);
                }
                last = Some(j);
            }
        }
        first.zip(last)
    }

    /// Applies the transfer to a full coarse coefficient vector.
    pub fn apply(&self, coarse: &[f64]) -> Vec<f64> {
        debug_assert_eq!(coarse.len(), self.num_coarse);
        let mut fine = vec![0.0; self.rows.len()];
        for (j, row) in self.rows.iter().enumerate() {
            let mut acc = 0.0;
            for (offset, &w) in row.weights.iter().enumerate() {
                acc += w * coarse[row.start + offset];
            }
            fine[j] = acc;
        }
        fine
    }
}
