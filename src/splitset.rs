//! Split-set engine: RF distance, Hungarian-matched H-distance and the
//! iterative approximate-SPR estimator between a gene tree and a species
//! tree.
//!
//! Species-tree bipartitions are re-coded over *gene* leaves through the
//! `sp0` vector (one bitset per species listing the gene leaves mapped to
//! it), which makes the engine work unchanged on multrees: a species carried
//! by several gene copies becomes a multifurcation-like split, and species
//! absent from the gene family simply contribute empty bits. The internal
//! species splits live in the same pool directly after the `sp_nleaves` leaf
//! codings, so writing the coding of species node `id` lands at s-split
//! position `id - sp_nleaves`.
//!
//! The dSPR loop alternates three moves until one side runs out of splits:
//! common cherries are compressed into single leaves (shrinking every split's
//! logical width in lockstep), the remaining disagreement is matched
//! edge-to-edge by the Hungarian solver, and the smallest disagreeing subtree
//! is pruned. Each prune is one estimated SPR; `spr_extra` counts prunes that
//! straddle both sides of a gene edge, the signature of two swapped SPRs.

use crate::bitset::Split;
use crate::error::{PhyloError, Result};
use crate::hungarian::Hungarian;
use crate::topology::Topology;

/// Scratch state and outputs of the gene-vs-species split comparison.
/// After any of the `dspr_gene_species*` calls the caller may read
/// `{rf, hdist, hdist_reduced, spr, spr_extra}`. The commonly used
/// approximate SPR estimate is `spr + spr_extra / 2`, left to the caller.
#[derive(Debug, Clone)]
pub struct SplitSet {
    size: usize,
    sp_nleaves: usize,
    original_bits: usize,
    cur_bits: usize,
    /// `[0, sp_nleaves)`: per-species gene-leaf codings; the rest is the
    /// s-split working area.
    sp: Vec<Split>,
    g_split: Vec<Split>,
    agree: Vec<Split>,
    disagree: Vec<Split>,
    prune: Split,
    pub n_g: usize,
    pub n_s: usize,
    pub n_agree: usize,
    pub n_disagree: usize,
    matched: bool,
    pub rf: i32,
    pub hdist: i32,
    pub hdist_reduced: i32,
    pub spr: i32,
    pub spr_extra: i32,
    h: Hungarian,
}

/// Sorts `b[..*nb]` into the canonical increasing order and drops adjacent
/// duplicates, rotating removed entries past the live region so their
/// buffers stay available.
fn dedup_splits(b: &mut [Split], nb: &mut usize) {
    if *nb < 2 {
        return;
    }
    b[..*nb].sort_by(|x, y| x.cmp_increasing(y));
    for i in (1..*nb).rev() {
        if b[i] == b[i - 1] {
            b[i..*nb].rotate_left(1);
            *nb -= 1;
        }
    }
}

impl SplitSet {
    /// Allocates split pools for a `gene_nleaves`-leaf gene tree against a
    /// `sp_nleaves`-leaf species tree. Every split is coded over gene
    /// leaves.
    pub fn new(gene_nleaves: usize, sp_nleaves: usize) -> Result<Self> {
        if gene_nleaves < 2 || sp_nleaves < 2 {
            return Err(PhyloError::OutOfRange(format!(
                "split set needs at least 2 leaves on each side, got {gene_nleaves} and {sp_nleaves}"
            )));
        }
        let size = gene_nleaves - 1;
        // species splits before pruning absent leaves, plus the multree
        // cherry additions, never exceed this
        let spsize = if gene_nleaves > sp_nleaves { 2 * sp_nleaves + gene_nleaves } else { 3 * sp_nleaves };
        Ok(SplitSet {
            size,
            sp_nleaves,
            original_bits: gene_nleaves,
            cur_bits: gene_nleaves,
            sp: (0..spsize).map(|_| Split::new(gene_nleaves)).collect(),
            g_split: (0..size).map(|_| Split::new(gene_nleaves)).collect(),
            agree: (0..size).map(|_| Split::new(gene_nleaves)).collect(),
            disagree: Vec::new(),
            prune: Split::new(gene_nleaves),
            n_g: 0,
            n_s: 0,
            n_agree: 0,
            n_disagree: 0,
            matched: false,
            rf: 0,
            hdist: 0,
            hdist_reduced: 0,
            spr: 0,
            spr_extra: 0,
            h: Hungarian::new(size),
        })
    }

    /// Builds the engine for a reconciled pair: `sp_id[leaf]` gives the
    /// species of each gene leaf, and seeds the per-species leaf codings.
    pub fn new_from_gene_species(gene: &Topology, species: &Topology, sp_id: &[usize]) -> Result<Self> {
        if sp_id.len() != gene.nleaves {
            return Err(PhyloError::ShapeMismatch(format!(
                "species map covers {} leaves, gene tree has {}",
                sp_id.len(),
                gene.nleaves
            )));
        }
        let mut set = SplitSet::new(gene.nleaves, species.nleaves)?;
        let mut sp_count = vec![0usize; species.nleaves];
        for (leaf, &sp) in sp_id.iter().enumerate() {
            if sp >= species.nleaves {
                return Err(PhyloError::OutOfRange(format!("species id {sp} out of range")));
            }
            set.sp[sp].set(leaf);
            sp_count[sp] += 1;
        }
        // not-yet-reduced split counts, available to max-distance estimates
        let sp_size = sp_count.iter().filter(|&&c| c > 0).count();
        set.n_g = gene.nleaves.saturating_sub(3);
        set.n_s = sp_size.saturating_sub(3) + sp_count.iter().filter(|&&c| c > 1).count();
        Ok(set)
    }

    /// Index of s-split `i` inside the shared pool.
    #[inline]
    fn s(&self, i: usize) -> usize {
        self.sp_nleaves + i
    }

    /// Rebuilds both split lists at full width: species internal codings in
    /// postorder, flipped small, deduplicated and extended with multree
    /// cherries; gene internal splits flipped small. Stale traversals are
    /// refreshed first.
    pub fn prepare(&mut self, gene: &mut Topology, species: &mut Topology) -> Result<()> {
        if !gene.traversal_updated {
            gene.update_traversal()?;
        }
        if !species.traversal_updated {
            species.update_traversal()?;
        }
        if gene.nleaves != self.original_bits || species.nleaves != self.sp_nleaves {
            return Err(PhyloError::ShapeMismatch("split set was allocated for different trees".into()));
        }
        self.cur_bits = self.original_bits;

        for i in 0..self.sp_nleaves - 1 {
            let k = self.s(i);
            self.sp[k].resize(self.original_bits);
            self.sp[k].zero();
        }
        for i in 0..species.nleaves - 1 {
            let p = species.postorder[i];
            let l = species.nodes[p].left as usize;
            let r = species.nodes[p].right as usize;
            // p is internal, so its coding slot sits past both children's
            let (head, tail) = self.sp.split_at_mut(p);
            tail[0].or_of(&head[l], &head[r], true);
        }
        self.n_s = species.nleaves - 1;
        // species absent from the gene leave empty or trivial codings behind
        let mut i = 0;
        while i < self.n_s {
            let k = self.s(i);
            self.sp[k].flip_to_smaller_set();
            if self.sp[k].n_ones() < 2 {
                self.n_s -= 1;
                let k2 = self.s(self.n_s);
                self.sp.swap(k, k2);
            } else {
                i += 1;
            }
        }
        let spn = self.sp_nleaves;
        dedup_splits(&mut self.sp[spn..], &mut self.n_s);
        for leaf in 0..self.sp_nleaves {
            if self.sp[leaf].n_ones() > 1 {
                // several gene copies: the species becomes a cherry-like split
                let (head, tail) = self.sp.split_at_mut(spn);
                let slot = &mut tail[self.n_s];
                slot.copy_from(&head[leaf]);
                slot.flip_to_smaller_set();
                self.n_s += 1;
            }
        }
        dedup_splits(&mut self.sp[spn..], &mut self.n_s);

        self.n_g = gene.nleaves.saturating_sub(3);
        for i in 0..self.n_g {
            self.g_split[i].copy_from(&gene.nodes[gene.postorder[i]].split);
            self.g_split[i].flip_to_smaller_set();
        }
        Ok(())
    }

    /// Moves every bipartition present in both lists into `agree`, shrinking
    /// both lists by swap-removal.
    fn create_agreement_list(&mut self) {
        let mut g = 0;
        'genes: while g < self.n_g {
            for s in 0..self.n_s {
                if self.g_split[g] == self.sp[self.s(s)] {
                    self.agree[self.n_agree].copy_from(&self.g_split[g]);
                    self.n_agree += 1;
                    self.n_g -= 1;
                    self.g_split.swap(g, self.n_g);
                    self.n_s -= 1;
                    let (a, b) = (self.s(s), self.s(self.n_s));
                    self.sp.swap(a, b);
                    continue 'genes; // re-examine the swapped-in split
                }
            }
            g += 1;
        }
        self.remove_agree_edges_g();
        self.remove_agree_edges_s();
    }

    fn remove_agree_edges_g(&mut self) {
        let mut i = 0;
        while i < self.n_g {
            if (0..self.n_agree).any(|a| self.g_split[i] == self.agree[a]) {
                self.n_g -= 1;
                self.g_split.swap(i, self.n_g);
            } else {
                i += 1;
            }
        }
    }

    fn remove_agree_edges_s(&mut self) {
        let mut i = 0;
        while i < self.n_s {
            if (0..self.n_agree).any(|a| self.sp[self.s(i)] == self.agree[a]) {
                self.n_s -= 1;
                let (x, y) = (self.s(i), self.s(self.n_s));
                self.sp.swap(x, y);
            } else {
                i += 1;
            }
        }
    }

    /// Copies bit `from` into bit `to` in every live split of every list.
    fn replace_bit_all(&mut self, to: usize, from: usize) {
        if from <= to {
            return;
        }
        for i in 0..self.n_agree {
            self.agree[i].replace_bit(to, from);
        }
        for i in 0..self.n_g {
            self.g_split[i].replace_bit(to, from);
        }
        for i in 0..self.n_s {
            let k = self.s(i);
            self.sp[k].replace_bit(to, from);
        }
    }

    /// Every agreed cherry means its two leaves are indistinguishable from
    /// here on: one of them is overwritten with the last leaf and the width
    /// shrinks by one, repeatedly until no two-leaf agreement remains.
    fn compress_agreement(&mut self) {
        let mut i = 0;
        while i < self.n_agree {
            if self.agree[i].n_ones() != 2 {
                i += 1;
                continue;
            }
            let pair = self.agree[i].to_index_vector(2);
            let last = self.cur_bits - 1;
            if pair[1] < last {
                self.replace_bit_all(pair[1], last);
            }
            self.cur_bits -= 1;
            for j in 0..self.n_agree {
                self.agree[j].resize(self.cur_bits);
            }
            let mut j = 0;
            while j < self.n_agree {
                self.agree[j].flip_to_smaller_set();
                if self.agree[j].n_ones() < 2 {
                    self.n_agree -= 1;
                    self.agree.swap(j, self.n_agree);
                } else {
                    j += 1;
                }
            }
            i = 0; // agreement shrank, start over
        }
        for j in 0..self.n_g {
            self.g_split[j].resize(self.cur_bits);
        }
        for j in 0..self.n_s {
            let k = self.s(j);
            self.sp[k].resize(self.cur_bits);
        }
    }

    fn ensure_disagree(&mut self, needed: usize) {
        debug_assert!(needed <= self.size * self.size);
        while self.disagree.len() < needed {
            self.disagree.push(Split::new(self.original_bits));
        }
    }

    /// Full gene × species disagreement matrix: the flipped XOR of every
    /// remaining pair.
    fn create_disagreement_list(&mut self) {
        self.ensure_disagree(self.n_g * self.n_s);
        for g in 0..self.n_g {
            for s in 0..self.n_s {
                let k = g * self.n_s + s;
                self.disagree[k].xor_of(&self.g_split[g], &self.sp[self.sp_nleaves + s], true);
                self.disagree[k].flip_to_smaller_set();
            }
        }
        self.n_disagree = self.n_g * self.n_s;
    }

    /// Hungarian matching over disagreement popcounts; the matched pairs
    /// replace the full matrix as the new disagreement list. The very first
    /// matching of a run also records `hdist_reduced`.
    fn assign_match(&mut self) {
        let max_n = self.n_g.max(self.n_s);
        if max_n == 0 {
            return;
        }
        self.h.reset();
        for g in 0..self.n_g {
            for s in 0..self.n_s {
                let cost = self.disagree[g * self.n_s + s].n_ones() as i64;
                self.h.update_cost(g, s, cost);
            }
        }
        self.h.solve(max_n);
        let n_s = self.n_s;
        self.n_disagree = 0;
        for g in 0..max_n {
            if g < self.n_g && self.h.col_mate[g] < n_s {
                // matchings outside the live range went to dummy edges
                let s = self.h.col_mate[g];
                let k = self.n_disagree;
                self.disagree[k].xor_of(&self.g_split[g], &self.sp[self.sp_nleaves + s], true);
                self.disagree[k].flip_to_smaller_set();
                self.n_disagree += 1;
            }
        }
        if self.matched {
            self.hdist_reduced = (self.h.initial_cost + self.h.final_cost) as i32;
            self.matched = false;
        }
    }

    /// Picks the subtree to prune: the smallest disagreement, upgraded to any
    /// disagreement that coincides with (or complements) an agreed split.
    /// Also detects prunes lying across both sides of some gene edge, which
    /// signal a pair of swapped SPRs.
    fn find_small_disagreement(&mut self) {
        self.prune.copy_from(&self.disagree[0]);
        if self.prune.n_ones() < 2 {
            return;
        }
        let mut dis = Split::new(self.original_bits);
        'search: for d in 0..self.n_disagree {
            for a in 0..self.n_agree {
                let nd = self.disagree[d].n_ones();
                let na = self.agree[a].n_ones();
                if nd == na || nd == self.cur_bits - na {
                    dis.xor_of(&self.disagree[d], &self.agree[a], true);
                    if dis.n_ones() == 0 {
                        self.prune.copy_from(&self.disagree[d]);
                        break 'search;
                    } else if dis.n_ones() == self.cur_bits {
                        self.prune.not_of(&self.disagree[d]);
                        break 'search;
                    }
                }
            }
        }
        for d in 0..self.n_g {
            if !self.g_split[d].contains(&self.prune) {
                dis.not_of(&self.g_split[d]);
                if !dis.contains(&self.prune) {
                    self.spr_extra += 1;
                    break;
                }
            }
        }
    }

    /// Deletes every pruned leaf from every split by moving surviving top
    /// bits into the freed positions, then shrinks the width accordingly.
    fn remove_small_disagreement(&mut self) {
        let size = self.cur_bits;
        let n_prune = self.prune.n_ones();
        if n_prune == 0 {
            // a pair became identical mid-iteration; the next agreement
            // pass will absorb it
            return;
        }
        let index = self.prune.to_index_vector(n_prune);
        let keep = size - n_prune;

        let mut k = 0;
        let mut j = n_prune - 1;
        let mut i = size - 1;
        while i >= keep {
            if index[k] >= keep {
                break;
            }
            if i == index[j] {
                j = j.wrapping_sub(1);
            } else {
                self.replace_bit_all(index[k], i);
                k += 1;
            }
            if i == 0 {
                break;
            }
            i -= 1;
        }

        self.cur_bits = keep;
        for idx in 0..self.n_g {
            self.g_split[idx].resize(keep);
        }
        for idx in 0..self.n_s {
            let s = self.s(idx);
            self.sp[s].resize(keep);
        }
        for idx in 0..self.n_agree {
            self.agree[idx].resize(keep);
        }
    }

    /// Re-canonicalises every list and drops splits that became trivial.
    fn minimize_subtrees(&mut self) {
        let mut i = 0;
        while i < self.n_s {
            let k = self.s(i);
            self.sp[k].flip_to_smaller_set();
            if self.sp[k].n_ones() < 2 {
                self.n_s -= 1;
                let (x, y) = (self.s(i), self.s(self.n_s));
                self.sp.swap(x, y);
            } else {
                i += 1;
            }
        }
        let mut i = 0;
        while i < self.n_g {
            self.g_split[i].flip_to_smaller_set();
            if self.g_split[i].n_ones() < 2 {
                self.n_g -= 1;
                self.g_split.swap(i, self.n_g);
            } else {
                i += 1;
            }
        }
        let mut i = 0;
        while i < self.n_agree {
            self.agree[i].flip_to_smaller_set();
            if self.agree[i].n_ones() < 2 {
                self.n_agree -= 1;
                self.agree.swap(i, self.n_agree);
            } else {
                i += 1;
            }
        }
    }

    /// RF and Hungarian H-distance on the freshly prepared lists. With
    /// `exit_at_rf` only the agreement pruning runs.
    fn rf_and_hdist(&mut self, exit_at_rf: bool) -> i32 {
        self.hdist_reduced = 0;
        self.hdist = 0;
        self.rf = 0;
        self.spr = 0;
        self.spr_extra = 0;
        self.n_agree = 0;
        self.n_disagree = 0;
        self.create_agreement_list();
        // no cherry compression here: RF counts the raw symmetric difference
        self.rf = (self.n_g + self.n_s) as i32;
        if exit_at_rf {
            return self.rf;
        }
        if self.rf == 0 {
            return 0;
        }
        self.matched = true;
        self.create_disagreement_list();
        self.assign_match();
        self.hdist = self.hdist_reduced;
        self.hdist
    }

    /// The iterative prune-and-regraft estimator on prepared lists.
    fn dspr_lowlevel(&mut self) -> i32 {
        self.matched = true;
        self.hdist_reduced = 0;
        self.spr = 0;
        self.spr_extra = 0;
        self.n_agree = 0;
        self.n_disagree = 0;
        loop {
            self.create_agreement_list();
            self.compress_agreement();
            if self.n_g == 0 || self.n_s == 0 {
                return self.spr;
            }
            self.create_disagreement_list();
            self.assign_match();
            dedup_splits(&mut self.disagree, &mut self.n_disagree);
            self.find_small_disagreement();
            self.spr += 1;
            self.remove_small_disagreement();
            self.minimize_subtrees();
            if self.n_g == 0 || self.n_s == 0 {
                return self.spr;
            }
        }
    }

    /// Full pipeline: RF and H-distance on the original trees first, then a
    /// fresh preparation and the dSPR loop on the reduced ones. Returns the
    /// SPR estimate (0 when the trees already agree).
    pub fn dspr_gene_species(&mut self, gene: &mut Topology, species: &mut Topology) -> Result<i32> {
        self.prepare(gene, species)?;
        self.rf_and_hdist(false);
        if self.rf == 0 {
            return Ok(0);
        }
        self.prepare(gene, species)?;
        Ok(self.dspr_lowlevel())
    }

    /// RF distance only.
    pub fn dspr_gene_species_rf(&mut self, gene: &mut Topology, species: &mut Topology) -> Result<i32> {
        self.prepare(gene, species)?;
        Ok(self.rf_and_hdist(true))
    }

    /// RF plus H-distance, no SPR loop.
    pub fn dspr_gene_species_hdist(&mut self, gene: &mut Topology, species: &mut Topology) -> Result<i32> {
        self.prepare(gene, species)?;
        Ok(self.rf_and_hdist(false))
    }
}
