//! Pairwise distance matrices: the square working form used by the tree
//! builders and patristic routines, and the packed per-species-pair form
//! accumulated across loci.
//!
//! Square-form conventions vary by caller (the upper triangle usually holds
//! minima, the lower triangle means), so every fill routine documents the
//! side it writes. Fresh matrices carry accumulation sentinels: `-1e35` below
//! the diagonal (for maxima), `+1e35` above (for minima).

use crate::error::{PhyloError, Result};

/// Sentinel written into the upper triangle of a fresh matrix, suitable as
/// the identity for minimum accumulation.
pub const DIST_MAX_SENTINEL: f64 = 1.0e35;
/// Lower-triangle counterpart, identity for maximum accumulation.
pub const DIST_MIN_SENTINEL: f64 = -1.0e35;
/// Value a finalised species matrix assigns to pairs never observed
/// together in any locus (just above the rescaled maximum of 1).
pub const SPDIST_ABSENT: f64 = 1.0001;

/// Index of pair `(i, j)` with `i < j` in a packed upper-triangular vector.
#[inline]
pub fn triangular_index(i: usize, j: usize) -> usize {
    debug_assert!(i < j);
    j * (j - 1) / 2 + i
}

/// Square pairwise distance matrix, with optional per-node scratch used by
/// the patristic fill (`fromroot` plus the Euler-tour leaf intervals).
#[derive(Debug, Clone)]
pub struct DistanceMatrix {
    pub size: usize,
    pub d: Vec<Vec<f64>>,
    /// Distance from the root to each node, filled by the patristic pass.
    pub(crate) fromroot: Vec<f64>,
    /// Leaves in postorder; `i_l`/`i_r` give, per node id, the interval of
    /// `idx` positions spanned by the leaves below it.
    pub(crate) idx: Vec<usize>,
    pub(crate) i_l: Vec<usize>,
    pub(crate) i_r: Vec<usize>,
}

impl DistanceMatrix {
    /// Fresh square matrix: zero diagonal, `-1e35` below, `+1e35` above.
    pub fn new_square(size: usize) -> Result<Self> {
        if size < 2 {
            return Err(PhyloError::OutOfRange(format!("distance matrix needs size >= 2, got {size}")));
        }
        let mut d = vec![vec![0.0; size]; size];
        for (i, row) in d.iter_mut().enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                if j < i {
                    *v = DIST_MIN_SENTINEL;
                } else if j > i {
                    *v = DIST_MAX_SENTINEL;
                }
            }
        }
        Ok(DistanceMatrix { size, d, fromroot: Vec::new(), idx: Vec::new(), i_l: Vec::new(), i_r: Vec::new() })
    }

    /// Square matrix with the patristic scratch pre-allocated for a topology
    /// over `nleaves` leaves.
    pub fn new_for_topology(nleaves: usize) -> Result<Self> {
        let mut dist = DistanceMatrix::new_square(nleaves)?;
        let nnodes = 2 * nleaves - 1;
        dist.fromroot = vec![0.0; nnodes];
        dist.idx = vec![0; nleaves];
        dist.i_l = vec![0; nnodes];
        dist.i_r = vec![0; nnodes];
        Ok(dist)
    }

    /// Resets the lower triangle to zero (mean accumulation) and the upper
    /// to `+1e35` (minimum accumulation).
    pub fn zero_lower(&mut self) {
        for i in 1..self.size {
            for j in 0..i {
                self.d[i][j] = 0.0;
                self.d[j][i] = DIST_MAX_SENTINEL;
            }
        }
    }

    /// Swaps the upper and lower triangles in place.
    pub fn transpose(&mut self) {
        for i in 1..self.size {
            for j in 0..i {
                let tmp = self.d[i][j];
                self.d[i][j] = self.d[j][i];
                self.d[j][i] = tmp;
            }
        }
    }

    /// Upper-triangle entry for the unordered pair `{i, j}`.
    #[inline]
    pub fn upper(&self, i: usize, j: usize) -> f64 {
        if i < j { self.d[i][j] } else { self.d[j][i] }
    }
}

/// Packed per-species-pair distance summary, accumulated across loci:
/// `mean` carries within-locus means (averaged across loci on `finalise`),
/// `min` within-locus minima (also averaged across loci), `count` how many
/// loci contributed to each pair.
#[derive(Debug, Clone)]
pub struct SpDistMatrix {
    pub size: usize,
    pub mean: Vec<f64>,
    pub min: Vec<f64>,
    pub count: Vec<u32>,
    pub species_present: Vec<bool>,
    pub n_missing: usize,
}

impl SpDistMatrix {
    pub fn new(n_species: usize) -> Result<Self> {
        if n_species < 2 {
            return Err(PhyloError::OutOfRange(format!("species matrix needs size >= 2, got {n_species}")));
        }
        let n_pairs = n_species * (n_species - 1) / 2;
        Ok(SpDistMatrix {
            size: n_species,
            mean: vec![0.0; n_pairs],
            min: vec![f64::MAX; n_pairs],
            count: vec![0; n_pairs],
            species_present: vec![false; n_species],
            n_missing: n_pairs,
        })
    }

    fn n_pairs(&self) -> usize {
        self.size * (self.size - 1) / 2
    }

    /// Clears all accumulators. A global (across-loci) matrix starts its
    /// `min` at zero because locals only ever add into it; a local matrix
    /// starts at `f64::MAX` for within-locus minimisation.
    pub fn zero_all(&mut self, is_global: bool) {
        let min_value = if is_global { 0.0 } else { f64::MAX };
        self.n_missing = self.n_pairs();
        for k in 0..self.n_pairs() {
            self.mean[k] = 0.0;
            self.min[k] = min_value;
            self.count[k] = 0;
        }
        self.species_present.iter_mut().for_each(|p| *p = false);
    }

    /// Marks which species this gene family carries and returns how many
    /// distinct species that is.
    pub fn prepare_from_gene_species_map(&mut self, sp_id: &[usize]) -> Result<usize> {
        self.species_present.iter_mut().for_each(|p| *p = false);
        for &sp in sp_id {
            if sp >= self.size {
                return Err(PhyloError::OutOfRange(format!("species id {sp} out of range for {} species", self.size)));
            }
            self.species_present[sp] = true;
        }
        Ok(self.species_present.iter().filter(|&&p| p).count())
    }

    /// Projects a gene-leaf pairwise distance vector (packed upper triangle)
    /// onto species pairs, recording per-pair minima and means. Pairs of
    /// leaves mapped to the same species are skipped.
    pub fn fill_from_gene_vector(&mut self, gdist: &[f64], sp_id: &[usize]) -> Result<()> {
        let n_gene = sp_id.len();
        if gdist.len() != n_gene * (n_gene - 1) / 2 {
            return Err(PhyloError::ShapeMismatch(format!(
                "gene distance vector has {} entries for {n_gene} leaves",
                gdist.len()
            )));
        }
        for k in 0..self.n_pairs() {
            self.mean[k] = 0.0;
            self.min[k] = f64::MAX;
            self.count[k] = 0;
        }
        self.prepare_from_gene_species_map(sp_id)?;

        for j in 1..n_gene {
            for i in 0..j {
                if sp_id[i] == sp_id[j] {
                    continue;
                }
                let (row, col) = if sp_id[i] < sp_id[j] { (sp_id[i], sp_id[j]) } else { (sp_id[j], sp_id[i]) };
                let idx_s = triangular_index(row, col);
                let g = gdist[triangular_index(i, j)];
                if g < self.min[idx_s] {
                    self.min[idx_s] = g;
                }
                self.mean[idx_s] += g;
                self.count[idx_s] += 1;
            }
        }
        for k in 0..self.n_pairs() {
            if self.count[k] > 0 {
                self.mean[k] /= self.count[k] as f64;
            }
        }
        Ok(())
    }

    /// Adds a per-locus matrix into this across-loci accumulator; only pairs
    /// of species present in the locus contribute. `count` then holds the
    /// number of loci seen per pair.
    pub fn update_from(&mut self, local: &SpDistMatrix) -> Result<()> {
        if self.size != local.size {
            return Err(PhyloError::ShapeMismatch(
                "species distance matrices have different sizes within and across loci".into(),
            ));
        }
        for j in 1..self.size {
            for i in 0..j {
                if local.species_present[i] && local.species_present[j] {
                    let k = triangular_index(i, j);
                    self.mean[k] += local.mean[k];
                    self.min[k] += local.min[k];
                    self.count[k] += 1;
                }
            }
        }
        for i in 0..self.size {
            self.species_present[i] |= local.species_present[i];
        }
        Ok(())
    }

    /// Averages the accumulated per-locus values, rescales both summaries to
    /// `[0, 1]` and stamps pairs never observed with the `1.0001` sentinel.
    pub fn finalise(&mut self) {
        let mut max_mean = f64::MIN_POSITIVE;
        let mut max_min = f64::MIN_POSITIVE;
        for k in 0..self.n_pairs() {
            if self.count[k] > 0 {
                self.n_missing -= 1;
                self.mean[k] /= self.count[k] as f64;
                self.min[k] /= self.count[k] as f64; // min is within locus; across loci we average
                max_mean = max_mean.max(self.mean[k]);
                max_min = max_min.max(self.min[k]);
                self.count[k] = 1;
            }
        }
        for k in 0..self.n_pairs() {
            if self.count[k] > 0 {
                self.mean[k] /= max_mean;
                self.min[k] /= max_min;
            }
        }
        if self.n_missing > 0 {
            for k in 0..self.n_pairs() {
                if self.count[k] == 0 {
                    self.mean[k] = SPDIST_ABSENT;
                    self.min[k] = SPDIST_ABSENT;
                }
            }
        }
    }

    /// Fills this matrix's unobserved pairs from a (finalised) global one.
    pub fn complete_missing_from_global(&mut self, global: &SpDistMatrix) -> Result<()> {
        if self.size != global.size {
            return Err(PhyloError::ShapeMismatch("local and global species matrices differ in size".into()));
        }
        for k in 0..self.n_pairs() {
            if self.count[k] == 0 {
                self.mean[k] = global.mean[k];
                self.min[k] = global.min[k];
                self.count[k] = global.count[k];
                if self.count[k] > 0 {
                    self.n_missing -= 1;
                }
            }
        }
        for i in 0..self.size {
            if !self.species_present[i] {
                self.species_present[i] = global.species_present[i];
            }
        }
        Ok(())
    }

    /// Copies the packed values into the upper triangle of a square matrix,
    /// which is the side UPGMA and BIONJ read.
    pub fn copy_to_square_upper(&self, dist: &mut DistanceMatrix, use_means: bool) -> Result<()> {
        if self.size != dist.size {
            return Err(PhyloError::ShapeMismatch(
                "square matrix and species matrix have different sizes".into(),
            ));
        }
        let source = if use_means { &self.mean } else { &self.min };
        for j in 1..self.size {
            for i in 0..j {
                dist.d[i][j] = source[triangular_index(i, j)];
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn square_sentinels() {
        let m = DistanceMatrix::new_square(3).unwrap();
        assert_eq!(m.d[0][0], 0.0);
        assert_eq!(m.d[0][2], DIST_MAX_SENTINEL);
        assert_eq!(m.d[2][0], DIST_MIN_SENTINEL);
    }

    #[test]
    fn transpose_swaps_triangles() {
        let mut m = DistanceMatrix::new_square(3).unwrap();
        m.d[0][1] = 7.0;
        m.d[1][0] = -3.0;
        m.transpose();
        assert_eq!(m.d[1][0], 7.0);
        assert_eq!(m.d[0][1], -3.0);
    }

    #[test]
    fn triangular_indexing_matches_loop_order() {
        let mut seen = vec![false; 6];
        for j in 1..4 {
            for i in 0..j {
                seen[triangular_index(i, j)] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn gene_vector_projection_records_min_and_mean() {
        // two gene copies of species 0 plus one each of species 1 and 2
        let sp_id = [0, 0, 1, 2];
        // pairs in (i,j) upper order: (0,1)=0.2 same-species, (0,2)=1.0,
        // (1,2)=2.0, (0,3)=4.0, (1,3)=6.0, (2,3)=3.0
        let mut gdist = vec![0.0; 6];
        gdist[triangular_index(0, 1)] = 0.2;
        gdist[triangular_index(0, 2)] = 1.0;
        gdist[triangular_index(1, 2)] = 2.0;
        gdist[triangular_index(0, 3)] = 4.0;
        gdist[triangular_index(1, 3)] = 6.0;
        gdist[triangular_index(2, 3)] = 3.0;

        let mut sp = SpDistMatrix::new(3).unwrap();
        sp.fill_from_gene_vector(&gdist, &sp_id).unwrap();
        let k01 = triangular_index(0, 1);
        assert_eq!(sp.min[k01], 1.0);
        assert!((sp.mean[k01] - 1.5).abs() < 1e-12);
        assert_eq!(sp.count[k01], 2);
        let k12 = triangular_index(1, 2);
        assert_eq!(sp.min[k12], 3.0);
        assert_eq!(sp.count[k12], 1);
    }

    #[test]
    fn finalise_rescales_and_marks_absent_pairs() {
        let mut global = SpDistMatrix::new(3).unwrap();
        global.zero_all(true);
        let mut local = SpDistMatrix::new(3).unwrap();
        local.mean[triangular_index(0, 1)] = 2.0;
        local.min[triangular_index(0, 1)] = 1.0;
        local.count[triangular_index(0, 1)] = 1;
        local.species_present[0] = true;
        local.species_present[1] = true;
        global.update_from(&local).unwrap();
        global.finalise();
        assert_eq!(global.mean[triangular_index(0, 1)], 1.0);
        assert_eq!(global.min[triangular_index(0, 1)], 1.0);
        assert_eq!(global.mean[triangular_index(0, 2)], SPDIST_ABSENT);
        assert_eq!(global.n_missing, 2);
    }

    #[test]
    fn copy_to_square_reads_back() {
        let mut sp = SpDistMatrix::new(3).unwrap();
        sp.zero_all(true);
        sp.min[triangular_index(0, 1)] = 0.5;
        sp.min[triangular_index(0, 2)] = 0.7;
        sp.min[triangular_index(1, 2)] = 0.9;
        let mut m = DistanceMatrix::new_square(3).unwrap();
        sp.copy_to_square_upper(&mut m, false).unwrap();
        assert_eq!(m.d[0][1], 0.5);
        assert_eq!(m.d[1][2], 0.9);
        assert_eq!(m.d[1][0], DIST_MIN_SENTINEL); // lower triangle untouched
    }
}
