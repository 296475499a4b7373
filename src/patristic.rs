//! Patristic distances from a topology, and OLS branch-length estimation
//! from a topology plus a pairwise distance vector.
//!
//! Both computations share the same Euler-tour bookkeeping: leaves are laid
//! out in postorder and each node records the interval of that layout its
//! subtree spans, so "every leaf pair split by this node" is a product of two
//! contiguous ranges. Distances then follow from
//! `d(a, b) = fromroot[a] + fromroot[b] - 2·fromroot[mrca(a, b)]`, and the
//! Bryant–Waddell `delta` accumulation for OLS uses the same intervals to
//! stay in O(n²) overall.

use crate::distmatrix::{DistanceMatrix, triangular_index};
use crate::error::{PhyloError, Result};
use crate::topology::Topology;

/// The rescalings `patristic_vectors` can emit simultaneously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatristicMode {
    /// Nodal distance: every branch longer than the tolerance counts 1.
    Nodal,
    /// Branch lengths divided by their mean (tree length becomes `nnodes`).
    MeanScaled,
    /// Raw branch lengths.
    Raw,
    /// Divided by the number of nodes.
    PerNodeCount,
    /// Divided by the tree length (tree length becomes 1).
    TreeLength,
    /// Divided by the shortest above-tolerance branch.
    ShortestBranch,
}

/// Leaves in postorder (`idx`) plus, per node id, the interval of `idx`
/// positions its subtree covers.
pub(crate) struct LeafIntervals {
    pub idx: Vec<usize>,
    pub i_l: Vec<usize>,
    pub i_r: Vec<usize>,
}

/// Builds the Euler-tour leaf intervals. The traversal must be current.
pub(crate) fn leaf_intervals(tree: &Topology) -> LeafIntervals {
    let mut iv = LeafIntervals {
        idx: vec![0; tree.nleaves],
        i_l: vec![0; tree.nnodes],
        i_r: vec![0; tree.nnodes],
    };
    let mut j = 0;
    for &p in &tree.postorder {
        let (l, r) = (tree.nodes[p].left as usize, tree.nodes[p].right as usize);
        for child in [l, r] {
            if !tree.nodes[child].internal {
                iv.idx[j] = child;
                iv.i_l[child] = j;
                iv.i_r[child] = j;
                j += 1;
            }
        }
        iv.i_l[p] = iv.i_l[l];
        iv.i_r[p] = iv.i_r[r];
    }
    iv
}

fn require_traversal(tree: &Topology) -> Result<()> {
    if tree.traversal_updated {
        Ok(())
    } else {
        Err(PhyloError::MissingData("patristic computation on a stale traversal; refresh the topology first".into()))
    }
}

/// Distance of every node from the root: nodal (level) when `blen` is
/// absent, summed edge lengths otherwise. Written in preorder.
fn distances_from_root(tree: &Topology, blen: Option<&[f64]>, fromroot: &mut [f64]) {
    match blen {
        None => {
            for node in &tree.nodes {
                fromroot[node.id] = node.level as f64;
            }
        }
        Some(blen) => {
            fromroot[tree.root] = 0.0;
            for &id in tree.postorder[..tree.nleaves - 2].iter().rev() {
                fromroot[id] = fromroot[tree.nodes[id].up as usize] + blen[id];
            }
            for id in 0..tree.nleaves {
                fromroot[id] = fromroot[tree.nodes[id].up as usize] + blen[id];
            }
        }
    }
}

/// Fills one triangle of `dist` with leaf-to-leaf path lengths: nodal
/// distances when `blen` is `None`, edge sums otherwise. Writes the upper
/// triangle when `use_upper` is set, the lower one otherwise; the opposite
/// triangle is left untouched.
pub fn fill_distance_matrix_from_topology(
    dist: &mut DistanceMatrix,
    tree: &Topology,
    blen: Option<&[f64]>,
    use_upper: bool,
) -> Result<()> {
    require_traversal(tree)?;
    if dist.size != tree.nleaves {
        return Err(PhyloError::ShapeMismatch(format!(
            "distance matrix size {} differs from topology leaf count {}",
            dist.size, tree.nleaves
        )));
    }
    if let Some(blen) = blen {
        if blen.len() != tree.nnodes {
            return Err(PhyloError::ShapeMismatch("branch length vector does not cover every node".into()));
        }
    }
    if dist.fromroot.len() != tree.nnodes {
        dist.fromroot = vec![0.0; tree.nnodes];
    }

    let mut fromroot = std::mem::take(&mut dist.fromroot);
    distances_from_root(tree, blen, &mut fromroot);
    let iv = leaf_intervals(tree);

    for i in 0..tree.nleaves {
        if use_upper {
            for j in i..tree.nleaves {
                dist.d[i][j] = 0.0;
            }
        } else {
            for j in 0..=i {
                dist.d[i][j] = 0.0;
            }
        }
    }
    for &p in &tree.postorder {
        let (l, r) = (tree.nodes[p].left as usize, tree.nodes[p].right as usize);
        for j in iv.i_l[l]..=iv.i_r[l] {
            for k in iv.i_l[r]..=iv.i_r[r] {
                let (mut row, mut col) = (iv.idx[j], iv.idx[k]);
                if (row > col) == use_upper {
                    std::mem::swap(&mut row, &mut col);
                }
                dist.d[row][col] = fromroot[row] + fromroot[col] - 2.0 * fromroot[p];
            }
        }
    }
    dist.fromroot = fromroot;
    dist.idx = iv.idx;
    dist.i_l = iv.i_l;
    dist.i_r = iv.i_r;
    Ok(())
}

/// Per-node root distances under one rescaling mode; returns the scale used.
fn rescale_distances_from_root(
    tree: &Topology,
    blen: &[f64],
    mode: PatristicMode,
    tolerance: f64,
    fromroot: &mut [f64],
) -> f64 {
    let scale = match mode {
        PatristicMode::Nodal | PatristicMode::Raw => 1.0,
        PatristicMode::MeanScaled => {
            let mut s: f64 = (0..tree.nnodes).map(|i| blen[i]).sum::<f64>() / tree.nnodes as f64;
            if s < 1e-12 {
                s = 1e-12;
            }
            s
        }
        PatristicMode::PerNodeCount => tree.nnodes as f64,
        PatristicMode::TreeLength => {
            let mut s: f64 = (0..tree.nnodes).map(|i| blen[i]).sum();
            if s < 1e-12 {
                s = 1e-12;
            }
            s
        }
        PatristicMode::ShortestBranch => {
            let mut s = 1e9;
            for i in 0..tree.nnodes {
                if blen[i] > tolerance && blen[i] < s {
                    s = blen[i];
                }
            }
            if s > 1e8 { 1.0 } else { s }
        }
    };
    let edge = |id: usize| -> f64 {
        match mode {
            PatristicMode::Nodal => {
                if blen[id] > tolerance {
                    1.0
                } else {
                    0.0
                }
            }
            _ => blen[id] / scale,
        }
    };
    fromroot[tree.root] = 0.0;
    for &id in tree.postorder[..tree.nleaves - 2].iter().rev() {
        fromroot[id] = fromroot[tree.nodes[id].up as usize] + edge(id);
    }
    for id in 0..tree.nleaves {
        fromroot[id] = fromroot[tree.nodes[id].up as usize] + edge(id);
    }
    scale
}

/// Emits one packed patristic vector (`triangular_index` layout) per
/// requested mode, all in a single pass over the tree, plus the scaling
/// factor each mode divided by. At most six modes; branch lengths required.
pub fn patristic_vectors(
    tree: &Topology,
    modes: &[PatristicMode],
    tolerance: f64,
) -> Result<(Vec<Vec<f64>>, Vec<f64>)> {
    require_traversal(tree)?;
    if modes.len() > 6 {
        return Err(PhyloError::OutOfRange(format!("{} patristic rescalings requested, at most 6", modes.len())));
    }
    let blen = tree
        .blength
        .as_deref()
        .ok_or_else(|| PhyloError::MissingData("patristic rescalings need branch lengths".into()))?;
    let tolerance = tolerance.max(1e-15);
    let n_pairs = tree.nleaves * (tree.nleaves - 1) / 2;

    let mut fromroot = vec![vec![0.0; tree.nnodes]; modes.len()];
    let mut scaling = vec![1.0; modes.len()];
    for (m, &mode) in modes.iter().enumerate() {
        scaling[m] = rescale_distances_from_root(tree, blen, mode, tolerance, &mut fromroot[m]);
    }

    let iv = leaf_intervals(tree);
    let mut dist = vec![vec![0.0; n_pairs]; modes.len()];
    for &p in &tree.postorder {
        let (l, r) = (tree.nodes[p].left as usize, tree.nodes[p].right as usize);
        for j in iv.i_l[l]..=iv.i_r[l] {
            for k in iv.i_l[r]..=iv.i_r[r] {
                let (mut row, mut col) = (iv.idx[j], iv.idx[k]);
                if row > col {
                    std::mem::swap(&mut row, &mut col);
                }
                let onedim = triangular_index(row, col);
                for m in 0..modes.len() {
                    dist[m][onedim] = fromroot[m][row] + fromroot[m][col] - 2.0 * fromroot[m][p];
                }
            }
        }
    }
    Ok((dist, scaling))
}

/// Bryant–Waddell `delta` accumulation (eqs. 9-10 of the fast OLS paper):
/// for each node, the sum of leaf-pair distances crossing it, built by the
/// fast matrix-multiplication recursion over the leaf intervals. Root-child
/// slots end up holding the delta of the *opposite* side of the root edge,
/// which is what the closed forms below consume.
fn fast_multiplication_delta(tree: &Topology, iv: &LeafIntervals, dist: &[f64]) -> Vec<f64> {
    let mut delta = vec![0.0; tree.nnodes];
    for i in 1..tree.nleaves {
        for j in 0..i {
            let d = dist[triangular_index(j, i)];
            delta[i] += d;
            delta[j] += d;
        }
    }
    let root_left = tree.nodes[tree.root].left as usize;
    let root_right = tree.nodes[tree.root].right as usize;
    for &p in &tree.postorder {
        if p == root_left {
            continue;
        }
        let (l, r) = (tree.nodes[p].left as usize, tree.nodes[p].right as usize);
        delta[p] = delta[l] + delta[r];
        for j in iv.i_l[l]..=iv.i_r[l] {
            for k in iv.i_l[r]..=iv.i_r[r] {
                let (mut row, mut col) = (iv.idx[j], iv.idx[k]);
                if row > col {
                    std::mem::swap(&mut row, &mut col);
                }
                delta[p] -= 2.0 * dist[triangular_index(row, col)];
            }
        }
    }
    delta[root_left] = delta[root_right];
    delta
}

/// Closed-form OLS branch lengths from the `delta` vector. The two children
/// of the root share a single edge, so each receives half of its length.
fn ols_branch_lengths_from_delta(tree: &Topology, delta: &mut [f64]) -> Vec<f64> {
    let n = tree.nleaves as f64;
    let mut blen = vec![0.0; tree.nnodes];
    let nodes = &tree.nodes;
    let ones = |id: usize| nodes[id].split.n_ones() as f64;

    for i in 0..tree.nleaves {
        let up = nodes[i].up as usize;
        let sister = nodes[i].sister as usize;
        if up != tree.root {
            let n_j = ones(sister);
            let n_k = n - n_j - 1.0;
            let tmp = (1.0 + n_j - n_k) * delta[sister] + (1.0 - n_j + n_k) * delta[up];
            blen[i] = (n * delta[i] - tmp) / (4.0 * n_j * n_k);
        } else {
            // the root edge: half here, half to the sister branch
            let (sl, sr) = (nodes[sister].left as usize, nodes[sister].right as usize);
            let n_j = ones(sl);
            let n_k = ones(sr);
            let tmp = (1.0 + n_j - n_k) * delta[sl] + (1.0 - n_j + n_k) * delta[sr];
            blen[i] = (n * delta[i] - tmp) / (8.0 * n_j * n_k);
            blen[sister] = blen[i];
            delta[tree.root] = delta[i];
        }
    }
    for idx in 0..tree.nleaves.saturating_sub(3) {
        let p = tree.postorder[idx];
        let up = nodes[p].up as usize;
        let sister = nodes[p].sister as usize;
        let (l, r) = (nodes[p].left as usize, nodes[p].right as usize);
        let n_l = ones(l);
        let n_m = ones(r);
        if up != tree.root {
            let n_j = ones(sister);
            let n_k = n - n_j - n_l - n_m;
            let mut tmp = (2.0 * n_k - n) * delta[sister] + (2.0 * n_j - n) * delta[up];
            blen[p] = ((n_k + n_j) / (n_k * n_j)) * tmp;
            tmp = (2.0 * n_l - n) * delta[r] + (2.0 * n_m - n) * delta[l];
            blen[p] += ((n_l + n_m) / (n_l * n_m)) * tmp;
            tmp = n / n_m + n / n_l + n / n_j + n / n_k - 4.0;
            blen[p] += tmp * delta[p];
            blen[p] /= 4.0 * (n_j + n_k) * (n_l + n_m);
        } else {
            // root child whose sister is internal: shared root edge again
            let (sl, sr) = (nodes[sister].left as usize, nodes[sister].right as usize);
            let n_j = ones(sl);
            let n_k = ones(sr);
            let mut tmp = (2.0 * n_k - n) * delta[sl] + (2.0 * n_j - n) * delta[sr];
            blen[p] = ((n_k + n_j) / (n_k * n_j)) * tmp;
            tmp = (2.0 * n_l - n) * delta[r] + (2.0 * n_m - n) * delta[l];
            blen[p] += ((n_l + n_m) / (n_l * n_m)) * tmp;
            tmp = n / n_m + n / n_l + n / n_j + n / n_k - 4.0;
            blen[p] += tmp * delta[p];
            blen[p] /= 8.0 * (n_j + n_k) * (n_l + n_m);
            blen[sister] = blen[p];
        }
    }
    correct_negative_branch_lengths(tree, &mut blen);
    blen
}

/// Clamps negative estimates to zero, moving their magnitude onto the parent
/// edge; whatever accumulates on the root is handed to both its children.
fn correct_negative_branch_lengths(tree: &Topology, blen: &mut [f64]) {
    for &p in &tree.postorder {
        let (l, r) = (tree.nodes[p].left as usize, tree.nodes[p].right as usize);
        for child in [l, r] {
            if blen[child] < f64::MIN_POSITIVE {
                blen[p] -= blen[child];
                blen[child] = 0.0;
            }
        }
    }
    if blen[tree.root] > 0.0 {
        let (l, r) = (tree.nodes[tree.root].left as usize, tree.nodes[tree.root].right as usize);
        blen[l] += blen[tree.root];
        blen[r] += blen[tree.root];
        blen[tree.root] = 0.0;
    }
}

/// Estimates OLS branch lengths for `tree` from a packed pairwise distance
/// vector and stores them in `tree.blength`.
pub fn estimate_branch_lengths_from_distances(tree: &mut Topology, dist: &[f64]) -> Result<()> {
    require_traversal(tree)?;
    if tree.nleaves < 3 {
        return Err(PhyloError::OutOfRange("OLS branch lengths need at least 3 leaves".into()));
    }
    let n_pairs = tree.nleaves * (tree.nleaves - 1) / 2;
    if dist.len() != n_pairs {
        return Err(PhyloError::ShapeMismatch(format!(
            "distance vector has {} entries, topology needs {n_pairs}",
            dist.len()
        )));
    }
    let iv = leaf_intervals(tree);
    let mut delta = fast_multiplication_delta(tree, &iv, dist);
    tree.blength = Some(ols_branch_lengths_from_delta(tree, &mut delta));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Topology;

    fn packed(dist: &DistanceMatrix) -> Vec<f64> {
        let mut out = vec![0.0; dist.size * (dist.size - 1) / 2];
        for j in 1..dist.size {
            for i in 0..j {
                out[triangular_index(i, j)] = dist.d[i][j];
            }
        }
        out
    }

    #[test]
    fn nodal_distances_on_balanced_quartet() {
        let tree = Topology::from_newick("((A,B),(C,D));", None).unwrap();
        let mut dist = DistanceMatrix::new_for_topology(4).unwrap();
        fill_distance_matrix_from_topology(&mut dist, &tree, None, true).unwrap();
        assert_eq!(dist.d[0][1], 2.0); // A-B through one cherry node
        assert_eq!(dist.d[0][2], 4.0); // A-C through the root
        assert_eq!(dist.d[2][3], 2.0);
    }

    #[test]
    fn edge_sum_distances_are_additive() {
        let tree = Topology::from_newick("((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6);", None).unwrap();
        let blen = tree.blength.clone().unwrap();
        let mut dist = DistanceMatrix::new_for_topology(4).unwrap();
        fill_distance_matrix_from_topology(&mut dist, &tree, Some(&blen), true).unwrap();
        assert!((dist.d[0][1] - 0.3).abs() < 1e-12);
        assert!((dist.d[0][2] - 1.4).abs() < 1e-12);
        assert!((dist.d[1][3] - 1.6).abs() < 1e-12);
        assert!((dist.d[2][3] - 0.9).abs() < 1e-12);
    }

    #[test]
    fn lower_triangle_fill_leaves_upper_untouched() {
        let tree = Topology::from_newick("((A,B),C);", None).unwrap();
        let mut dist = DistanceMatrix::new_for_topology(3).unwrap();
        fill_distance_matrix_from_topology(&mut dist, &tree, None, false).unwrap();
        assert_eq!(dist.d[1][0], 2.0);
        assert_eq!(dist.d[0][1], crate::distmatrix::DIST_MAX_SENTINEL);
    }

    #[test]
    fn stale_traversal_is_refused() {
        let mut tree = Topology::from_newick("((A,B),C);", None).unwrap();
        tree.traversal_updated = false;
        let mut dist = DistanceMatrix::new_for_topology(3).unwrap();
        assert!(fill_distance_matrix_from_topology(&mut dist, &tree, None, true).is_err());
    }

    #[test]
    fn patristic_vector_modes_agree_on_scaling() {
        let tree = Topology::from_newick("((A:1,B:1):1,(C:1,D:1):1);", None).unwrap();
        let (dists, scaling) = patristic_vectors(
            &tree,
            &[PatristicMode::Raw, PatristicMode::TreeLength, PatristicMode::Nodal],
            1e-12,
        )
        .unwrap();
        let k = triangular_index(0, 2); // A-C crosses four edges of length 1
        assert!((dists[0][k] - 4.0).abs() < 1e-12);
        // tree length is 6 (root edge has length 0 in this encoding)
        assert!((dists[1][k] - 4.0 / scaling[1]).abs() < 1e-12);
        assert!((dists[2][k] - 4.0).abs() < 1e-12); // four above-tolerance edges
        assert_eq!(scaling[0], 1.0);
    }

    #[test]
    fn too_many_modes_is_out_of_range() {
        let tree = Topology::from_newick("((A:1,B:1):1,C:1);", None).unwrap();
        let modes = [PatristicMode::Raw; 7];
        assert!(patristic_vectors(&tree, &modes, 1e-12).is_err());
    }

    #[test]
    fn ols_recovers_additive_branch_lengths() {
        let mut tree = Topology::from_newick("((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6);", None).unwrap();
        let blen = tree.blength.clone().unwrap();
        let mut dist = DistanceMatrix::new_for_topology(4).unwrap();
        fill_distance_matrix_from_topology(&mut dist, &tree, Some(&blen), true).unwrap();
        let vec = packed(&dist);

        estimate_branch_lengths_from_distances(&mut tree, &vec).unwrap();
        let est = tree.blength.as_ref().unwrap();
        let id = |name: &str| tree.taxlabel.index_of(name).unwrap();
        assert!((est[id("A")] - 0.1).abs() < 1e-9);
        assert!((est[id("B")] - 0.2).abs() < 1e-9);
        assert!((est[id("C")] - 0.4).abs() < 1e-9);
        assert!((est[id("D")] - 0.5).abs() < 1e-9);
        // the 0.3 + 0.6 root path is one unrooted edge, split evenly
        let root_left = tree.nodes[tree.root].left as usize;
        let root_right = tree.nodes[tree.root].right as usize;
        assert!((est[root_left] - 0.45).abs() < 1e-9);
        assert!((est[root_right] - 0.45).abs() < 1e-9);
    }

    #[test]
    fn ols_on_five_leaves_is_nonnegative_and_fits_pendants() {
        let newick = "(((A:0.2,B:0.3):0.25,C:0.9):0.15,(D:0.6,E:0.1):0.35);";
        let mut tree = Topology::from_newick(newick, None).unwrap();
        let blen = tree.blength.clone().unwrap();
        let mut dist = DistanceMatrix::new_for_topology(5).unwrap();
        fill_distance_matrix_from_topology(&mut dist, &tree, Some(&blen), true).unwrap();
        let vec = packed(&dist);
        estimate_branch_lengths_from_distances(&mut tree, &vec).unwrap();
        let est = tree.blength.as_ref().unwrap();
        for name in ["A", "B", "C", "D", "E"] {
            let id = tree.taxlabel.index_of(name).unwrap();
            assert!((est[id] - blen[id]).abs() < 1e-9, "pendant edge {name} not recovered");
        }
        for id in 0..tree.nnodes {
            assert!(est[id] >= 0.0);
        }
    }
}
