use ndarray::array;
use thbspline::{BsplineBasis, IndexBox, Polyline, Region, TensorBasis, TruncatedBasis};

fn square_basis() -> TruncatedBasis {
    let knots = array![0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 4.0, 4.0, 4.0];
    let b = BsplineBasis::new(3, knots).expect("valid knot vector");
    TruncatedBasis::new(TensorBasis::new(vec![b.clone(), b])).expect("2d basis")
}

/// Area enclosed by a closed axis-aligned loop, by the shoelace formula.
fn loop_area(poly: &Polyline) -> i64 {
    let v = &poly.vertices;
    let n = v.len();
    let mut acc = 0i64;
    for i in 0..n {
        let a = v[i];
        let b = v[(i + 1) % n];
        acc += a[0] as i64 * b[1] as i64 - b[0] as i64 * a[1] as i64;
    }
    acc / 2
}

/// Is the cell center (cx, cy) inside the closed axis-aligned loop?
/// Even-odd crossing count of a ray in +x direction; half-integer centers
/// never sit on an integer edge.
fn center_inside(cycle: &[[usize; 2]], cx: f64, cy: f64) -> bool {
    let n = cycle.len();
    let mut crossings = 0usize;
    for i in 0..n {
        let a = cycle[i];
        let b = cycle[(i + 1) % n];
        if a[0] != b[0] {
            continue;
        }
        let x = a[0] as f64;
        let ylo = a[1].min(b[1]) as f64;
        let yhi = a[1].max(b[1]) as f64;
        if x > cx && ylo < cy && cy < yhi {
            crossings += 1;
        }
    }
    crossings % 2 == 1
}

/// Does the region (outer loop minus its holes) cover the cell (x, y)?
fn region_covers_cell(region: &Region, x: usize, y: usize) -> bool {
    let (cx, cy) = (x as f64 + 0.5, y as f64 + 0.5);
    center_inside(&region.outer.vertices, cx, cy)
        && region
            .holes
            .iter()
            .all(|h| !center_inside(&h.vertices, cx, cy))
}

#[test]
fn single_refined_box_splits_into_annulus_and_square() {
    let mut basis = square_basis();
    basis
        .refine(&IndexBox::new(vec![2, 2], vec![6, 6]), 1)
        .expect("single-level refinement");

    let dd = basis.decompose_domain().expect("2d decomposition");
    assert_eq!(dd.cells, vec![8, 8]);
    assert_eq!(dd.levels.len(), 2);
    assert_eq!(dd.levels[0].level, 0);
    assert_eq!(dd.levels[1].level, 1);

    // The coarse level covers the whole domain minus the refined square.
    let coarse = &dd.levels[0].regions;
    assert_eq!(coarse.len(), 1);
    assert_eq!(
        coarse[0].outer.vertices,
        vec![[0, 0], [8, 0], [8, 8], [0, 8]]
    );
    assert_eq!(coarse[0].holes.len(), 1);
    assert_eq!(
        coarse[0].holes[0].vertices,
        vec![[2, 2], [2, 6], [6, 6], [6, 2]]
    );
    // Outer loops are counter-clockwise, holes clockwise.
    assert!(loop_area(&coarse[0].outer) > 0);
    assert!(loop_area(&coarse[0].holes[0]) < 0);

    let fine = &dd.levels[1].regions;
    assert_eq!(fine.len(), 1);
    assert_eq!(fine[0].outer.vertices, vec![[2, 2], [6, 2], [6, 6], [2, 6]]);
    assert!(fine[0].holes.is_empty());
    assert_eq!(fine[0].bounds, IndexBox::new(vec![2, 2], vec![6, 6]));
}

#[test]
fn nested_refinement_produces_an_annular_middle_level() {
    let mut basis = square_basis();
    basis
        .refine_boxes(&[
            (1, IndexBox::new(vec![2, 2], vec![6, 6])),
            (2, IndexBox::new(vec![6, 6], vec![8, 8])),
        ])
        .expect("two-level refinement");

    let dd = basis.decompose_domain().expect("2d decomposition");
    assert_eq!(dd.cells, vec![16, 16]);
    assert_eq!(dd.levels.len(), 3);

    let coarse = &dd.levels[0].regions;
    assert_eq!(coarse.len(), 1);
    assert_eq!(
        coarse[0].outer.vertices,
        vec![[0, 0], [16, 0], [16, 16], [0, 16]]
    );
    assert_eq!(coarse[0].holes.len(), 1);

    // The middle level is an annulus around the deepest box.
    let middle = &dd.levels[1].regions;
    assert_eq!(middle.len(), 1);
    assert_eq!(
        middle[0].outer.vertices,
        vec![[4, 4], [12, 4], [12, 12], [4, 12]]
    );
    assert_eq!(middle[0].holes.len(), 1);
    assert_eq!(
        middle[0].holes[0].vertices,
        vec![[6, 6], [6, 8], [8, 8], [8, 6]]
    );

    let deep = &dd.levels[2].regions;
    assert_eq!(deep.len(), 1);
    assert_eq!(
        deep[0].outer.vertices,
        vec![[6, 6], [8, 6], [8, 8], [6, 8]]
    );

    // Levels tile the domain: rasterizing every region (outer minus holes)
    // onto the finest grid claims each cell exactly once.
    let mut claims = vec![0u32; 16 * 16];
    for level in &dd.levels {
        for region in &level.regions {
            for y in 0..16 {
                for x in 0..16 {
                    if region_covers_cell(region, x, y) {
                        claims[y * 16 + x] += 1;
                    }
                }
            }
        }
    }
    assert!(claims.iter().all(|&c| c == 1), "domain tiling has a gap or overlap");
}

#[test]
fn disjoint_boxes_become_separate_regions() {
    let mut basis = square_basis();
    basis
        .refine_boxes(&[
            (1, IndexBox::new(vec![0, 0], vec![2, 2])),
            (1, IndexBox::new(vec![6, 6], vec![8, 8])),
        ])
        .expect("two disjoint boxes");

    let dd = basis.decompose_domain().expect("2d decomposition");
    let fine = &dd.levels[1].regions;
    assert_eq!(fine.len(), 2);
    let mut bounds: Vec<IndexBox> = fine.iter().map(|r| r.bounds.clone()).collect();
    bounds.sort_by(|a, b| a.low.cmp(&b.low));
    assert_eq!(bounds[0], IndexBox::new(vec![0, 0], vec![2, 2]));
    assert_eq!(bounds[1], IndexBox::new(vec![6, 6], vec![8, 8]));

    // Boxes touching the domain corner are not holes of the coarse region.
    let coarse = &dd.levels[0].regions;
    assert_eq!(coarse.len(), 1);
    assert!(coarse[0].holes.is_empty());
}

#[test]
fn decomposition_is_deterministic() {
    let build = || {
        let mut basis = square_basis();
        basis
            .refine_boxes(&[
                (1, IndexBox::new(vec![2, 2], vec![4, 4])),
                (1, IndexBox::new(vec![4, 4], vec![6, 6])),
            ])
            .expect("two touching boxes");
        basis.decompose_domain().expect("2d decomposition")
    };
    let a = build();
    let b = build();
    assert_eq!(a.cells, b.cells);
    for (la, lb) in a.levels.iter().zip(b.levels.iter()) {
        assert_eq!(la.regions.len(), lb.regions.len());
        for (ra, rb) in la.regions.iter().zip(lb.regions.iter()) {
            assert_eq!(ra.outer, rb.outer);
            assert_eq!(ra.holes, rb.holes);
        }
    }
}
