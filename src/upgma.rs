//! Agglomerative tree builders over a pairwise distance matrix: UPGMA (and
//! its single-linkage variant) and BIONJ. Both read the upper triangle only
//! and write the resulting topology, including branch lengths, into a
//! caller-provided `Topology` shell.
//!
//! The active-row bookkeeping follows the usual swap-with-tail scheme: `idx`
//! maps active slots to matrix rows, `idxtree` maps them to tree node ids,
//! and a merged pair keeps living on the first partner's matrix row. UPGMA
//! additionally caches each row's minimum; a cached minimum pointing at a
//! slot that was touched by the merge is recomputed lazily on the next pass.

use crate::distmatrix::DistanceMatrix;
use crate::error::{PhyloError, Result};
use crate::topology::Topology;

fn check_shell(tree: &Topology, dist: &DistanceMatrix) -> Result<()> {
    if tree.nleaves != dist.size {
        return Err(PhyloError::ShapeMismatch(format!(
            "distance matrix of size {} against a {}-leaf topology",
            dist.size, tree.nleaves
        )));
    }
    Ok(())
}

/// UPGMA (mean linkage) or single linkage over the upper triangle of `dist`.
/// The matrix is consumed as scratch: merged rows are overwritten with
/// cluster distances. Child branch lengths are `dst/2 - height(child)`,
/// clamped to a tiny positive value, which makes the output ultrametric.
pub fn upgma_from_distance_matrix(
    tree: &mut Topology,
    dist: &mut DistanceMatrix,
    single_linkage: bool,
) -> Result<()> {
    check_shell(tree, dist)?;
    let n = tree.nleaves;
    let mut blength = tree.blength.take().unwrap_or_else(|| vec![0.0; tree.nnodes]);

    let mut n_idx = n;
    let mut parent = n;
    let mut idx: Vec<usize> = (0..n).collect();
    let mut idxtree: Vec<usize> = (0..n).collect();
    let mut gsize = vec![1.0f64; n]; // leaves below each active row
    let mut height = vec![0.0f64; n]; // ultrametric distance from the tips
    let mut dst_by_row = vec![1.0e35f64; n];
    let mut min_by_row = vec![0usize; n];

    for j in 1..n {
        for i in 0..j {
            if dist.d[i][j] < dst_by_row[i] {
                dst_by_row[i] = dist.d[i][j];
                min_by_row[i] = j;
            }
        }
    }

    while n_idx > 2 {
        // globally minimal cached row minimum
        let mut dst_row = 1.0e35;
        let mut min_row = 0;
        let mut min_col = 0;
        for slot in 0..n_idx {
            if idx[slot] < dist.size - 1 && dst_by_row[idx[slot]] < dst_row {
                dst_row = dst_by_row[idx[slot]];
                min_row = slot;
                min_col = min_by_row[idx[slot]];
            }
        }
        if dst_row < 1.0e-35 {
            dst_row = 1.0e-35;
        }

        let (i, j) = (min_row, min_col);
        let tree_i = idxtree[i];
        let tree_j = idxtree[j];
        idxtree[i] = parent;
        n_idx -= 1;
        idxtree[j] = idxtree[n_idx];
        tree.create_parent_from_children(parent, tree_i, tree_j);
        parent += 1;

        let gs1 = (dst_row / 2.0 - height[idx[i]]).max(1.0e-35);
        let gs2 = (dst_row / 2.0 - height[idx[j]]).max(1.0e-35);
        blength[tree_i] = gs1;
        blength[tree_j] = gs2;
        height[idx[i]] = dst_row / 2.0;

        let idx_i = idx[i];
        let idx_j = idx[j];
        idx[j] = idx[n_idx];

        dst_by_row[idx_i] = 1.0e35;
        let gs_total = gsize[idx_i] + gsize[idx_j];
        for t in 0..n_idx {
            let row;
            let col;
            let idx_col;
            if single_linkage {
                let new_dist =
                    if idx[t] < idx_j { dist.d[idx[t]][idx_j] } else { dist.d[idx_j][idx[t]] };
                if idx[t] < idx_i {
                    row = idx[t];
                    col = idx_i;
                    idx_col = min_row;
                } else {
                    col = idx[t];
                    row = idx_i;
                    idx_col = t;
                }
                if row < col && new_dist < dist.d[row][col] {
                    dist.d[row][col] = new_dist;
                }
            } else {
                let new_dist = if idx[t] < idx_j {
                    gsize[idx_j] * dist.d[idx[t]][idx_j]
                } else {
                    gsize[idx_j] * dist.d[idx_j][idx[t]]
                };
                if idx[t] < idx_i {
                    row = idx[t];
                    col = idx_i;
                    idx_col = min_row;
                } else {
                    col = idx[t];
                    row = idx_i;
                    idx_col = t;
                }
                if row < col {
                    dist.d[row][col] = (new_dist + gsize[idx_i] * dist.d[row][col]) / gs_total;
                }
            }

            if dist.d[row][col] < dst_by_row[row] {
                dst_by_row[row] = dist.d[row][col];
                min_by_row[row] = idx_col;
            }

            // rows whose cached minimum pointed at a merged slot go stale
            if idx[t] < dist.size - 1
                && (min_by_row[idx[t]] == min_row || min_by_row[idx[t]] == min_col || min_by_row[idx[t]] >= n_idx)
            {
                dst_by_row[idx[t]] = 1.0e35;
                for slot in 0..n_idx {
                    let col2 = idx[slot];
                    if col2 > idx[t] && dist.d[idx[t]][col2] < dst_by_row[idx[t]] {
                        dst_by_row[idx[t]] = dist.d[idx[t]][col2];
                        min_by_row[idx[t]] = slot;
                    }
                }
            }
        }
        gsize[idx_i] += gsize[idx_j];
    }

    tree.create_parent_from_children(parent, idxtree[0], idxtree[1]);
    tree.root = parent;
    let dst_row = if idx[0] < idx[1] { dist.d[idx[0]][idx[1]] } else { dist.d[idx[1]][idx[0]] };
    blength[idxtree[0]] = dst_row / 2.0 - height[idx[0]];
    blength[idxtree[1]] = dst_row / 2.0 - height[idx[1]];

    tree.blength = Some(blength);
    tree.update_traversal()
}

/// BIONJ over the upper triangle of `dist`. The working `delta` matrix keeps
/// dissimilarities above the diagonal, variances below it, and the active
/// row sums on the diagonal (recomputed each round).
pub fn bionj_from_distance_matrix(tree: &mut Topology, dist: &DistanceMatrix) -> Result<()> {
    check_shell(tree, dist)?;
    let n = tree.nleaves;
    if n < 3 {
        return Err(PhyloError::OutOfRange("BIONJ needs at least 3 taxa".into()));
    }
    let mut blength = tree.blength.take().unwrap_or_else(|| vec![0.0; tree.nnodes]);

    let mut delta = vec![vec![0.0f64; n]; n];
    for i in 0..n {
        for j in i + 1..n {
            delta[i][j] = dist.d[i][j];
            delta[j][i] = dist.d[i][j]; // initial variances equal distances
        }
    }

    let mut n_idx = n;
    let mut parent = n;
    let mut idx: Vec<usize> = (0..n).collect();
    let mut idxtree: Vec<usize> = (0..n).collect();

    while n_idx > 2 {
        // row sums live on the diagonal
        for i in 0..n_idx {
            delta[idx[i]][idx[i]] = 0.0;
            for j in 0..n_idx {
                if i != j {
                    delta[idx[i]][idx[i]] +=
                        if idx[i] < idx[j] { delta[idx[i]][idx[j]] } else { delta[idx[j]][idx[i]] };
                }
            }
        }

        // minimise Q_ij = (n-2)·d(i,j) - S_i - S_j
        let mut q_min = 1.0e64;
        let mut b1 = 0;
        let mut b2 = 0;
        for i in 0..n_idx {
            for j in 0..i {
                let (i1, i2) = if idx[i] < idx[j] { (i, j) } else { (j, i) };
                let q = (n_idx - 2) as f64 * delta[idx[i1]][idx[i2]]
                    - delta[idx[i1]][idx[i1]]
                    - delta[idx[i2]][idx[i2]];
                if q < q_min - 1.0e-8 {
                    q_min = q;
                    b1 = i1;
                    b2 = i2;
                }
            }
        }

        let diff_1_2 = (delta[idx[b1]][idx[b1]] - delta[idx[b2]][idx[b2]]) / (n_idx - 2) as f64;
        let blen_1 = 0.5 * (delta[idx[b1]][idx[b2]] + diff_1_2);
        let blen_2 = 0.5 * (delta[idx[b1]][idx[b2]] - diff_1_2);

        // Gascuel's variance-weighted mixing coefficient
        let var_1_2 = delta[idx[b2]][idx[b1]];
        let lambda = if var_1_2 < 1.0e-12 {
            0.5
        } else {
            let mut acc = 0.0;
            for i in 0..n_idx {
                if i != b1 && i != b2 {
                    acc += if idx[i] < idx[b1] { delta[idx[b1]][idx[i]] } else { delta[idx[i]][idx[b1]] };
                    acc -= if idx[i] < idx[b2] { delta[idx[b2]][idx[i]] } else { delta[idx[i]][idx[b2]] };
                }
            }
            0.5 + acc / (2.0 * (n_idx - 2) as f64 * var_1_2)
        }
        .clamp(0.0, 1.0);

        // fold b2 into b1: new distances above, new variances below
        for i in 0..n_idx {
            if i != b1 && i != b2 {
                let (i1, i2) = if idx[b1] < idx[i] { (b1, i) } else { (i, b1) };
                let d_b2_i =
                    if idx[b2] < idx[i] { delta[idx[b2]][idx[i]] } else { delta[idx[i]][idx[b2]] };
                delta[idx[i1]][idx[i2]] = lambda * (delta[idx[i1]][idx[i2]] - blen_1)
                    + (1.0 - lambda) * (d_b2_i - blen_2);

                let v_b2_i =
                    if idx[b2] < idx[i] { delta[idx[i]][idx[b2]] } else { delta[idx[b2]][idx[i]] };
                delta[idx[i2]][idx[i1]] = lambda * (delta[idx[i2]][idx[i1]] - (1.0 - lambda) * var_1_2)
                    + (1.0 - lambda) * v_b2_i;
            }
        }

        tree.create_parent_from_children(parent, idxtree[b1], idxtree[b2]);
        blength[idxtree[b1]] = blen_1;
        blength[idxtree[b2]] = blen_2;
        idxtree[b1] = parent;
        n_idx -= 1;
        idxtree[b2] = idxtree[n_idx];
        parent += 1;
        idx[b2] = idx[n_idx];
    }

    tree.create_parent_from_children(parent, idxtree[0], idxtree[1]);
    tree.root = parent;
    let last = if idx[0] < idx[1] { delta[idx[0]][idx[1]] } else { delta[idx[1]][idx[0]] };
    blength[idxtree[0]] = last;
    blength[idxtree[1]] = last;

    tree.blength = Some(blength);
    tree.update_traversal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::LabelCatalog;
    use crate::distmatrix::triangular_index;
    use crate::patristic::fill_distance_matrix_from_topology;
    use crate::topology::Topology;
    use std::sync::Arc;

    fn shell(labels: &[&str]) -> Topology {
        let cat = Arc::new(LabelCatalog::from_labels(labels.iter().copied()).unwrap());
        Topology::new(labels.len(), cat).unwrap()
    }

    fn square(labels: usize, entries: &[(usize, usize, f64)]) -> DistanceMatrix {
        let mut dist = DistanceMatrix::new_square(labels).unwrap();
        for &(i, j, v) in entries {
            dist.d[i.min(j)][i.max(j)] = v;
        }
        dist
    }

    #[test]
    fn upgma_recovers_balanced_quartet() {
        let mut tree = shell(&["A", "B", "C", "D"]);
        let mut dist = square(
            4,
            &[(0, 1, 2.0), (0, 2, 4.0), (0, 3, 4.0), (1, 2, 4.0), (1, 3, 4.0), (2, 3, 2.0)],
        );
        upgma_from_distance_matrix(&mut tree, &mut dist, false).unwrap();

        let expected = Topology::from_newick("((A,B),(C,D));", Some(Arc::clone(&tree.taxlabel))).unwrap();
        assert!(Topology::is_equal_unrooted(&tree, &expected, true).unwrap());

        let blen = tree.blength.as_ref().unwrap();
        for leaf in 0..4 {
            assert!((blen[leaf] - 1.0).abs() < 1e-12);
        }
        let root = &tree.nodes[tree.root];
        assert!((blen[root.left as usize] - 1.0).abs() < 1e-12);
        assert!((blen[root.right as usize] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn upgma_output_is_ultrametric() {
        let mut tree = shell(&["A", "B", "C", "D", "E"]);
        let mut dist = square(
            5,
            &[
                (0, 1, 2.0),
                (0, 2, 6.0),
                (0, 3, 9.0),
                (0, 4, 9.0),
                (1, 2, 6.0),
                (1, 3, 9.0),
                (1, 4, 9.0),
                (2, 3, 9.0),
                (2, 4, 9.0),
                (3, 4, 3.0),
            ],
        );
        upgma_from_distance_matrix(&mut tree, &mut dist, false).unwrap();
        let blen = tree.blength.clone().unwrap();

        // both children of every internal node reach the tips at the same
        // depth: height(p) is well defined
        let mut node_height = vec![0.0f64; tree.nnodes];
        for &p in &tree.postorder {
            let (l, r) = (tree.nodes[p].left as usize, tree.nodes[p].right as usize);
            let via_left = node_height[l] + blen[l];
            let via_right = node_height[r] + blen[r];
            assert!((via_left - via_right).abs() < 1e-9, "node {p} is not ultrametric");
            node_height[p] = via_left;
        }

        // an ultrametric input is recovered exactly
        let mut patristic = DistanceMatrix::new_for_topology(5).unwrap();
        fill_distance_matrix_from_topology(&mut patristic, &tree, Some(&blen), true).unwrap();
        assert!((patristic.upper(0, 1) - 2.0).abs() < 1e-9);
        assert!((patristic.upper(0, 2) - 6.0).abs() < 1e-9);
        assert!((patristic.upper(0, 3) - 9.0).abs() < 1e-9);
        assert!((patristic.upper(3, 4) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn single_linkage_uses_minimum_cluster_distance() {
        let mut tree_sl = shell(&["A", "B", "C"]);
        let mut dist = square(3, &[(0, 1, 1.0), (0, 2, 10.0), (1, 2, 2.0)]);
        upgma_from_distance_matrix(&mut tree_sl, &mut dist, true).unwrap();
        let blen = tree_sl.blength.as_ref().unwrap();
        // chaining: d({A,B}, C) = min(10, 2) = 2, so C hangs at height 1
        assert!((blen[2] - 1.0).abs() < 1e-12);

        let mut tree_up = shell(&["A", "B", "C"]);
        let mut dist = square(3, &[(0, 1, 1.0), (0, 2, 10.0), (1, 2, 2.0)]);
        upgma_from_distance_matrix(&mut tree_up, &mut dist, false).unwrap();
        let blen = tree_up.blength.as_ref().unwrap();
        // mean linkage: d({A,B}, C) = 6, so C hangs at height 3
        assert!((blen[2] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn bionj_recovers_additive_quartet() {
        // distances generated by ((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6)
        let source = Topology::from_newick("((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6);", None).unwrap();
        let blen = source.blength.clone().unwrap();
        let mut dist = DistanceMatrix::new_for_topology(4).unwrap();
        fill_distance_matrix_from_topology(&mut dist, &source, Some(&blen), true).unwrap();

        let mut tree = shell(&["A", "B", "C", "D"]);
        bionj_from_distance_matrix(&mut tree, &dist).unwrap();
        assert!(Topology::is_equal_unrooted(&tree, &source, true).unwrap());

        let est = tree.blength.as_ref().unwrap();
        let id = |name: &str| tree.taxlabel.index_of(name).unwrap();
        assert!((est[id("A")] - 0.1).abs() < 1e-6);
        assert!((est[id("B")] - 0.2).abs() < 1e-6);
        assert!((est[id("D")] - 0.5).abs() < 1e-6);
        // the two internal edges 0.3 + 0.6 fuse into one unrooted edge
        let ab_node = tree
            .postorder
            .iter()
            .copied()
            .find(|&p| {
                let v = tree.nodes[p].split.to_index_vector(4);
                v == vec![id("A"), id("B")]
            })
            .unwrap();
        assert!((est[ab_node] - 0.9).abs() < 1e-6);
    }

    #[test]
    fn bionj_branch_lengths_are_finite_on_noisy_input() {
        let mut tree = shell(&["A", "B", "C", "D", "E"]);
        let mut dist = DistanceMatrix::new_square(5).unwrap();
        let noisy = [
            (0usize, 1usize, 0.31),
            (0, 2, 1.42),
            (0, 3, 1.55),
            (0, 4, 1.21),
            (1, 2, 1.48),
            (1, 3, 1.61),
            (1, 4, 1.27),
            (2, 3, 0.92),
            (2, 4, 1.12),
            (3, 4, 1.05),
        ];
        for (i, j, v) in noisy {
            dist.d[i][j] = v;
        }
        bionj_from_distance_matrix(&mut tree, &dist).unwrap();
        for &b in tree.blength.as_ref().unwrap() {
            assert!(b.is_finite());
        }
        assert!(tree.traversal_updated);
    }

    #[test]
    fn size_mismatch_is_refused() {
        let mut tree = shell(&["A", "B", "C"]);
        let mut dist = DistanceMatrix::new_square(4).unwrap();
        assert!(upgma_from_distance_matrix(&mut tree, &mut dist, false).is_err());
        assert!(bionj_from_distance_matrix(&mut tree, &dist).is_err());
    }

    #[test]
    fn species_matrix_pipeline_builds_a_species_tree() {
        use crate::distmatrix::SpDistMatrix;
        use crate::patristic::{PatristicMode, patristic_vectors};

        // two loci over four species, each locus sampling three of them
        let gene1 = Topology::from_newick("((A_g1:1,B_g1:1):1,C_g1:4);", None).unwrap();
        let sp1 = [0usize, 1, 2];
        let gene2 = Topology::from_newick("((C_g2:1,D_g2:1):1,A_g2:4);", None).unwrap();
        let sp2 = [0usize, 2, 3];

        let mut global = SpDistMatrix::new(4).unwrap();
        global.zero_all(true);
        let mut locals = Vec::new();
        for (gene, sp_id) in [(&gene1, &sp1), (&gene2, &sp2)] {
            let (dists, _) = patristic_vectors(gene, &[PatristicMode::Raw], 1e-12).unwrap();
            let mut local = SpDistMatrix::new(4).unwrap();
            local.fill_from_gene_vector(&dists[0], sp_id).unwrap();
            global.update_from(&local).unwrap();
            locals.push(local);
        }
        global.finalise();
        assert_eq!(global.n_missing, 1); // B and D never met

        // within-locus gaps are patched from the global summary; the pair
        // absent everywhere keeps the sentinel value
        let mut local = locals.swap_remove(0);
        local.complete_missing_from_global(&global).unwrap();
        let bd = crate::distmatrix::triangular_index(1, 3);
        assert_eq!(local.min[bd], crate::distmatrix::SPDIST_ABSENT);

        let mut square = DistanceMatrix::new_square(4).unwrap();
        local.copy_to_square_upper(&mut square, false).unwrap();

        let mut tree = shell(&["A", "B", "C", "D"]);
        upgma_from_distance_matrix(&mut tree, &mut square, false).unwrap();
        let expected = Topology::from_newick("((A,B),(C,D));", Some(Arc::clone(&tree.taxlabel))).unwrap();
        assert!(Topology::is_equal_unrooted(&tree, &expected, true).unwrap());
    }

    #[test]
    fn packed_distance_vector_matches_matrix_layout() {
        // guard for the (i<j) upper-triangle convention shared with patristic
        assert_eq!(triangular_index(0, 1), 0);
        assert_eq!(triangular_index(0, 2), 1);
        assert_eq!(triangular_index(1, 2), 2);
    }
}
