use std::collections::{BTreeMap, HashSet};

use ndarray::IxDyn;

use crate::error::{DecomposeError, NumericalDegeneracy, StructuralError};
use crate::hierarchy::{Hierarchy, IndexBox};
use crate::truncation::TruncatedBasis;

type Vertex = [usize; 2];

/// Closed axis-aligned boundary loop in finest-grid index coordinates. The
/// first vertex is the lexicographically smallest and is not repeated at the
/// end; consecutive vertices always differ in exactly one coordinate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Polyline {
    pub vertices: Vec<Vertex>,
}

/// One connected piece of a level's cell set: its outer boundary loop
/// (counter-clockwise), the holes punched by finer levels (clockwise), and
/// the bounding box of the outer loop.
#[derive(Clone, Debug)]
pub struct Region {
    pub bounds: IndexBox,
    pub outer: Polyline,
    pub holes: Vec<Polyline>,
}

/// All regions belonging to one level.
#[derive(Clone, Debug)]
pub struct LevelPartition {
    pub level: usize,
    pub regions: Vec<Region>,
}

/// Partition of the index domain by level. Every finest-grid cell belongs
/// to exactly one level, so the level partitions tile the domain.
#[derive(Clone, Debug)]
pub struct DomainDecomposition {
    /// Finest-grid cells per direction; all coordinates refer to this grid.
    pub cells: Vec<usize>,
    pub levels: Vec<LevelPartition>,
}

impl TruncatedBasis {
    /// Decomposes the 2D index domain into per-level regions with explicit
    /// outer and hole boundary loops.
    pub fn decompose_domain(&self) -> Result<DomainDecomposition, DecomposeError> {
        decompose(self.hierarchy())
    }
}

pub fn decompose(h: &Hierarchy) -> Result<DomainDecomposition, DecomposeError> {
    if h.dim() != 2 {
        return Err(StructuralError::UnsupportedDimension { dim: h.dim() }.into());
    }
    let cells = h.finest_cells();
    let (nx, ny) = (cells[0], cells[1]);
    let raster = h.cell_levels();

    let mut claimed = 0usize;
    let mut levels = Vec::with_capacity(h.max_level() + 1);
    for level in 0..=h.max_level() {
        let mut visited = vec![false; nx * ny];
        let mut regions = Vec::new();
        for y0 in 0..ny {
            for x0 in 0..nx {
                if visited[y0 * nx + x0] || raster[IxDyn(&[x0, y0])] != level {
                    continue;
                }
                // Flood-fill one 4-connected component of this level.
                let mut component = Vec::new();
                let mut stack = vec![(x0, y0)];
                visited[y0 * nx + x0] = true;
                while let Some((x, y)) = stack.pop() {
                    component.push((x, y));
                    let mut push = |cx: usize, cy: usize, visited: &mut Vec<bool>| {
                        if !visited[cy * nx + cx] && raster[IxDyn(&[cx, cy])] == level {
                            visited[cy * nx + cx] = true;
                            stack.push((cx, cy));
                        }
                    };
                    if x > 0 {
                        push(x - 1, y, &mut visited);
                    }
                    if x + 1 < nx {
                        push(x + 1, y, &mut visited);
                    }
                    if y > 0 {
                        push(x, y - 1, &mut visited);
                    }
                    if y + 1 < ny {
                        push(x, y + 1, &mut visited);
                    }
                }
                claimed += component.len();
                regions.extend(trace_component(&component, level)?);
            }
        }
        levels.push(LevelPartition { level, regions });
    }

    if claimed != nx * ny {
        return Err(StructuralError::UncoveredCells {
            count: nx * ny - claimed,
        }
        .into());
    }
    Ok(DomainDecomposition { cells, levels })
}

/// Traces the boundary of one cell component into regions: collect the
/// directed boundary edges (component on the left), stitch them into closed
/// loops, merge collinear runs, split self-touching loops at their first
/// repeated vertex, and classify loops by orientation.
fn trace_component(
    component: &[(usize, usize)],
    level: usize,
) -> Result<Vec<Region>, DecomposeError> {
    let members: HashSet<(usize, usize)> = component.iter().copied().collect();

    // Directed boundary edges, keyed by start vertex with sorted targets so
    // stitching is deterministic.
    let mut edges: BTreeMap<Vertex, Vec<Vertex>> = BTreeMap::new();
    for &(x, y) in component {
        if y == 0 || !members.contains(&(x, y - 1)) {
            edges.entry([x, y]).or_default().push([x + 1, y]);
        }
        if !members.contains(&(x + 1, y)) {
            edges.entry([x + 1, y]).or_default().push([x + 1, y + 1]);
        }
        if !members.contains(&(x, y + 1)) {
            edges.entry([x + 1, y + 1]).or_default().push([x, y + 1]);
        }
        if x == 0 || !members.contains(&(x - 1, y)) {
            edges.entry([x, y + 1]).or_default().push([x, y]);
        }
    }
    for targets in edges.values_mut() {
        targets.sort_unstable();
    }

    // Stitch loops, always starting from the smallest vertex that still has
    // an unused edge and following the smallest outgoing edge.
    let mut loops: Vec<Vec<Vertex>> = Vec::new();
    loop {
        let start = match edges.iter().find(|(_, targets)| !targets.is_empty()) {
            Some((&start, _)) => start,
            None => break,
        };
        let mut cycle = vec![start];
        let mut current = start;
        loop {
            let next = match edges.get_mut(&current) {
                Some(targets) if !targets.is_empty() => targets.remove(0),
                _ => return Err(NumericalDegeneracy::OpenPolyline { level }.into()),
            };
            if next == start {
                break;
            }
            cycle.push(next);
            current = next;
        }
        let merged = merge_collinear(cycle);
        split_at_repeats(merged, level, &mut loops)?;
    }

    // Orientation separates outers (counter-clockwise) from holes.
    let mut regions: Vec<Region> = Vec::new();
    let mut holes: Vec<Vec<Vertex>> = Vec::new();
    for cycle in loops {
        let cycle = rotate_to_min(cycle);
        if signed_area2(&cycle) > 0 {
            regions.push(Region {
                bounds: bounding_box(&cycle),
                outer: Polyline { vertices: cycle },
                holes: Vec::new(),
            });
        } else {
            holes.push(cycle);
        }
    }
    if regions.is_empty() && !component.is_empty() {
        return Err(NumericalDegeneracy::UnresolvedCycle { level }.into());
    }

    // Each hole belongs to the smallest outer whose bounding box contains it.
    for hole in holes {
        let hole_box = bounding_box(&hole);
        let mut best: Option<usize> = None;
        for (i, region) in regions.iter().enumerate() {
            if !box_contains(&region.bounds, &hole_box) {
                continue;
            }
            let better = match best {
                None => true,
                Some(j) => box_area(&regions[i].bounds) < box_area(&regions[j].bounds),
            };
            if better {
                best = Some(i);
            }
        }
        match best {
            Some(i) => regions[i].holes.push(Polyline { vertices: hole }),
            None => return Err(NumericalDegeneracy::UnresolvedCycle { level }.into()),
        }
    }
    Ok(regions)
}

/// Drops every vertex that continues the direction of its predecessor.
fn merge_collinear(cycle: Vec<Vertex>) -> Vec<Vertex> {
    let n = cycle.len();
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let prev = cycle[(i + n - 1) % n];
        let cur = cycle[i];
        let next = cycle[(i + 1) % n];
        let straight = (prev[0] == cur[0] && cur[0] == next[0])
            || (prev[1] == cur[1] && cur[1] == next[1]);
        if !straight {
            out.push(cur);
        }
    }
    out
}

/// Splits a loop at its first repeated vertex into two closed loops and
/// recurses until every loop is simple.
fn split_at_repeats(
    cycle: Vec<Vertex>,
    level: usize,
    out: &mut Vec<Vec<Vertex>>,
) -> Result<(), DecomposeError> {
    let mut seen: BTreeMap<Vertex, usize> = BTreeMap::new();
    for (i, &v) in cycle.iter().enumerate() {
        if let Some(&j) = seen.get(&v) {
            let inner = cycle[j..i].to_vec();
            let mut rest = cycle[..j].to_vec();
            rest.extend_from_slice(&cycle[i..]);
            if inner.len() < 4 || rest.len() < 4 {
                return Err(NumericalDegeneracy::UnresolvedCycle { level }.into());
            }
            split_at_repeats(inner, level, out)?;
            return split_at_repeats(rest, level, out);
        }
        seen.insert(v, i);
    }
    if cycle.len() < 4 {
        return Err(NumericalDegeneracy::UnresolvedCycle { level }.into());
    }
    out.push(cycle);
    Ok(())
}

fn rotate_to_min(mut cycle: Vec<Vertex>) -> Vec<Vertex> {
    if let Some((pos, _)) = cycle.iter().enumerate().min_by_key(|&(_, v)| *v) {
        cycle.rotate_left(pos);
    }
    cycle
}

/// Twice the signed area; positive for counter-clockwise loops.
fn signed_area2(cycle: &[Vertex]) -> i64 {
    let n = cycle.len();
    let mut acc = 0i64;
    for i in 0..n {
        let a = cycle[i];
        let b = cycle[(i + 1) % n];
        acc += a[0] as i64 * b[1] as i64 - b[0] as i64 * a[1] as i64;
    }
    acc
}

fn bounding_box(cycle: &[Vertex]) -> IndexBox {
    let mut low = [usize::MAX; 2];
    let mut high = [0usize; 2];
    for v in cycle {
        for k in 0..2 {
            low[k] = low[k].min(v[k]);
            high[k] = high[k].max(v[k]);
        }
    }
    IndexBox::new(low.to_vec(), high.to_vec())
}

fn box_contains(outer: &IndexBox, inner: &IndexBox) -> bool {
    (0..2).all(|k| outer.low[k] <= inner.low[k] && inner.high[k] <= outer.high[k])
}

fn box_area(b: &IndexBox) -> usize {
    (0..2).map(|k| b.high[k] - b.low[k]).product()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bspline::BsplineBasis;
    use crate::tensor::TensorBasis;
    use ndarray::array;

    fn square_basis() -> TruncatedBasis {
        let knots = array![0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 4.0, 4.0, 4.0];
        let b = BsplineBasis::new(3, knots).expect("valid knots");
        TruncatedBasis::new(TensorBasis::new(vec![b.clone(), b])).expect("2d basis")
    }

    #[test]
    fn unrefined_domain_is_one_rectangle() {
        let basis = square_basis();
        let dd = basis.decompose_domain().expect("2d decomposition");
        assert_eq!(dd.cells, vec![4, 4]);
        assert_eq!(dd.levels.len(), 1);
        let regions = &dd.levels[0].regions;
        assert_eq!(regions.len(), 1);
        assert_eq!(
            regions[0].outer.vertices,
            vec![[0, 0], [4, 0], [4, 4], [0, 4]]
        );
        assert!(regions[0].holes.is_empty());
        assert_eq!(regions[0].bounds, IndexBox::new(vec![0, 0], vec![4, 4]));
    }

    #[test]
    fn refined_block_punches_a_hole_in_the_coarse_level() {
        let mut basis = square_basis();
        basis
            .refine(&IndexBox::new(vec![2, 2], vec![6, 6]), 1)
            .expect("single-level refinement");
        let dd = basis.decompose_domain().expect("2d decomposition");
        assert_eq!(dd.cells, vec![8, 8]);
        assert_eq!(dd.levels.len(), 2);

        let coarse = &dd.levels[0].regions;
        assert_eq!(coarse.len(), 1);
        assert_eq!(
            coarse[0].outer.vertices,
            vec![[0, 0], [8, 0], [8, 8], [0, 8]]
        );
        assert_eq!(coarse[0].holes.len(), 1);
        // Hole loops run clockwise.
        assert_eq!(
            coarse[0].holes[0].vertices,
            vec![[2, 2], [2, 6], [6, 6], [6, 2]]
        );

        let fine = &dd.levels[1].regions;
        assert_eq!(fine.len(), 1);
        assert_eq!(fine[0].outer.vertices, vec![[2, 2], [6, 2], [6, 6], [2, 6]]);
        assert!(fine[0].holes.is_empty());
    }

    #[test]
    fn diagonally_touching_holes_are_split_apart() {
        let mut basis = square_basis();
        basis
            .refine(&IndexBox::new(vec![2, 2], vec![4, 4]), 1)
            .expect("first block");
        basis
            .refine(&IndexBox::new(vec![4, 4], vec![6, 6]), 1)
            .expect("second block");
        let dd = basis.decompose_domain().expect("2d decomposition");

        // The two fine blocks touch only at the corner vertex (4, 4); they
        // are separate fine regions and separate holes of the coarse region.
        let fine = &dd.levels[1].regions;
        assert_eq!(fine.len(), 2);
        let coarse = &dd.levels[0].regions;
        assert_eq!(coarse.len(), 1);
        assert_eq!(coarse[0].holes.len(), 2);
        let mut hole_boxes: Vec<IndexBox> = coarse[0]
            .holes
            .iter()
            .map(|h| bounding_box(&h.vertices))
            .collect();
        hole_boxes.sort_by(|a, b| a.low.cmp(&b.low));
        assert_eq!(hole_boxes[0], IndexBox::new(vec![2, 2], vec![4, 4]));
        assert_eq!(hole_boxes[1], IndexBox::new(vec![4, 4], vec![6, 6]));
        // Every hole loop is simple.
        for hole in &coarse[0].holes {
            let mut vertices = hole.vertices.clone();
            vertices.sort_unstable();
            vertices.dedup();
            assert_eq!(vertices.len(), hole.vertices.len());
        }
    }

    #[test]
    fn non_planar_hierarchies_are_rejected() {
        let knots = array![0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 4.0, 4.0, 4.0];
        let b = BsplineBasis::new(3, knots).expect("valid knots");
        let line = TruncatedBasis::new(TensorBasis::new(vec![b])).expect("1d basis");
        assert!(matches!(
            line.decompose_domain(),
            Err(DecomposeError::Structural(
                StructuralError::UnsupportedDimension { dim: 1 }
            ))
        ));
    }
}
