//! LCA-based gene-tree / species-tree reconciliation: duplications, losses
//! and deep coalescences, minimised over every possible rooting of the gene
//! tree.
//!
//! The DP runs twice over the gene tree: a postorder pass maps each node's
//! subtree onto the species tree (`map_d`, with partial duplication and loss
//! counts), then the tree is "flipped" and a preorder pass computes the same
//! quantities for everything *above* each edge (`map_u`, treating `up` and
//! `sister` as the children). Any edge can then act as a virtual root by
//! combining its two sides in O(1), and the reported triple is taken at the
//! edge minimising duplications (ties broken by losses), so
//! `ndcos == nloss - 2·ndups + size_diff` always refers to one rooting.
//!
//! Loss arithmetic needs species-tree levels that skip species absent from
//! the gene family: `prepare_for_loss_calculation` writes per-node scratch
//! (`mid[2]` effective cardinality, `mid[3]` active/pruned/pass-through flag,
//! `mid[4]` active level, with pass-through nodes inheriting the parent
//! level).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::catalog::LabelCatalog;
use crate::error::{PhyloError, Result};
use crate::splitset::SplitSet;
use crate::topology::Topology;

static SPECIES_TREE_TOKEN: AtomicU64 = AtomicU64::new(1);

/// A species topology plus its lazily filled MRCA cache (triangular over all
/// node ids). Leaves are canonicalised to lexicographic label order on
/// construction, so species leaf id equals catalog position.
#[derive(Debug)]
pub struct SpeciesTree {
    pub topo: Topology,
    mrca: Vec<i32>,
    token: u64,
}

impl SpeciesTree {
    pub fn new(mut topo: Topology) -> Result<Self> {
        topo.sort_leaves_by_label()?;
        topo.update_traversal()?;
        Self::with_leaf_order(topo)
    }

    /// Keeps the caller's leaf order; the catalog must already equal the
    /// intended species indexing.
    pub fn with_leaf_order(topo: Topology) -> Result<Self> {
        if !topo.traversal_updated {
            return Err(PhyloError::MissingData("species tree needs a fresh traversal".into()));
        }
        let n_mrca = topo.nnodes * (topo.nnodes - 1) / 2;
        Ok(SpeciesTree {
            topo,
            mrca: vec![-1; n_mrca],
            token: SPECIES_TREE_TOKEN.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Identity of this species tree instance, used by gene trees to notice
    /// they were last reconciled against somebody else.
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn clear_mrca(&mut self) {
        self.mrca.iter_mut().for_each(|m| *m = -1);
    }

    /// Most recent common ancestor of nodes `i` and `j`, cached per pair.
    /// The climb starts at the shallower node and walks up until its split
    /// contains the deeper node's split (or leaf bit).
    pub fn mrca(&mut self, i: usize, j: usize) -> Result<usize> {
        if i == j {
            return Ok(i);
        }
        let (hi, lo) = if i > j { (i, j) } else { (j, i) };
        let index = hi * (hi - 1) / 2 + lo;
        if self.mrca[index] >= 0 {
            return Ok(self.mrca[index] as usize);
        }

        // start the climb from the node closer to the root
        let (deep, shallow) =
            if self.topo.nodes[i].level > self.topo.nodes[j].level { (i, j) } else { (j, i) };
        let mut p = shallow as i32;
        if self.topo.nodes[deep].internal {
            while p >= 0 && !self.topo.nodes[p as usize].split.contains(&self.topo.nodes[deep].split) {
                p = self.topo.nodes[p as usize].up;
            }
        } else {
            while p >= 0 && !self.topo.nodes[p as usize].split.is_bit_set(deep) {
                p = self.topo.nodes[p as usize].up;
            }
        }
        if p < 0 {
            return Err(PhyloError::InvariantViolated(format!(
                "no MRCA found for species nodes {i} and {j}; root or bipartition state is corrupt"
            )));
        }
        self.mrca[index] = p;
        Ok(p as usize)
    }
}

/// Maps each gene leaf to a species index by searching species names inside
/// gene names, case-insensitively and longest species name first, so that
/// e.g. "ecoli" cannot shadow "ecoliII". Every gene leaf must match.
pub fn map_gene_leaves_to_species(gene: &LabelCatalog, species: &LabelCatalog) -> Result<Vec<usize>> {
    let mut sp_order: Vec<usize> = (0..species.len()).collect();
    sp_order.sort_by_key(|&i| std::cmp::Reverse(species.label(i).len()));
    let gene_lc: Vec<String> = gene.iter().map(str::to_lowercase).collect();

    let mut sp_id = vec![usize::MAX; gene.len()];
    let mut unmapped: Vec<usize> = (0..gene.len()).collect();
    for &sp in &sp_order {
        let sp_lc = species.label(sp).to_lowercase();
        let mut k = 0;
        while k < unmapped.len() {
            let g = unmapped[k];
            if gene_lc[g].contains(&sp_lc) {
                sp_id[g] = sp;
                unmapped.swap_remove(k);
            } else {
                k += 1;
            }
        }
    }
    if !unmapped.is_empty() {
        let names: Vec<&str> = unmapped.iter().map(|&g| gene.label(g)).collect();
        return Err(PhyloError::ShapeMismatch(format!(
            "gene leaves without a recognisable species name: {names:?}"
        )));
    }
    Ok(sp_id)
}

/// Per-gene-tree reconciliation state: the leaf→species map, the per-node
/// LCA maps and partial counts for both orientations, and the final triple.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub sp_id: Vec<usize>,
    pub sp_count: Vec<u32>,
    /// Number of distinct species present in the gene family.
    pub sp_size: usize,
    /// `2·(gene leaves - sp_size)`, the deep-coalescence offset.
    pub size_diff: i32,
    map_d: Vec<usize>,
    map_u: Vec<usize>,
    ndup_d: Vec<i32>,
    ndup_u: Vec<i32>,
    nlos_d: Vec<i32>,
    nlos_u: Vec<i32>,
    pub ndups: i32,
    pub nloss: i32,
    pub ndcos: i32,
    sptree_token: Option<u64>,
}

impl Reconciliation {
    pub fn new(gene_nleaves: usize, sp_nleaves: usize, sp_id: Vec<usize>) -> Result<Self> {
        if sp_id.len() != gene_nleaves {
            return Err(PhyloError::ShapeMismatch(format!(
                "species map covers {} leaves, gene tree has {gene_nleaves}",
                sp_id.len()
            )));
        }
        let mut sp_count = vec![0u32; sp_nleaves];
        for &sp in &sp_id {
            if sp >= sp_nleaves {
                return Err(PhyloError::OutOfRange(format!("species id {sp} out of range for {sp_nleaves} species")));
            }
            sp_count[sp] += 1;
        }
        let sp_size = sp_count.iter().filter(|&&c| c > 0).count();
        let nnodes = 2 * gene_nleaves - 1;
        Ok(Reconciliation {
            sp_id,
            sp_count,
            sp_size,
            size_diff: 2 * (gene_nleaves as i32 - sp_size as i32),
            map_d: vec![0; nnodes],
            map_u: vec![0; nnodes],
            ndup_d: vec![0; nnodes],
            ndup_u: vec![0; nnodes],
            nlos_d: vec![0; nnodes],
            nlos_u: vec![0; nnodes],
            ndups: -1,
            nloss: -1,
            ndcos: -1,
            sptree_token: None,
        })
    }
}

/// Writes the species-tree `mid` scratch for loss counting: `mid[2]` is the
/// count of gene leaves below each node, `mid[3]` flags the node pruned (0),
/// active (1) or a single-child pass-through (0xffff), and `mid[4]` is the
/// root distance counting active nodes only (pass-throughs inherit their
/// parent's value).
fn prepare_for_loss_calculation(species: &mut Topology, sp_count: &[u32]) {
    let s = species.nleaves;
    for i in 0..s {
        species.nodes[i].mid[2] = sp_count[i] as i32;
    }
    for i in 0..s - 1 {
        let p = species.postorder[i];
        let c_l = species.nodes[species.nodes[p].left as usize].mid[2];
        let c_r = species.nodes[species.nodes[p].right as usize].mid[2];
        species.nodes[p].mid[2] = c_l + c_r;
        species.nodes[p].mid[3] = if c_l == 0 && c_r == 0 {
            0
        } else if c_l > 0 && c_r > 0 {
            1
        } else {
            0xffff
        };
    }
    let root = species.root;
    species.nodes[root].mid[4] = if species.nodes[root].mid[3] == 1 { 0 } else { -1 };
    for i in (0..s.saturating_sub(2)).rev() {
        let p = species.postorder[i];
        let up_level = species.nodes[species.nodes[p].up as usize].mid[4];
        species.nodes[p].mid[4] = if species.nodes[p].mid[3] == 1 { up_level + 1 } else { up_level };
    }
    for i in 0..s {
        if species.nodes[i].mid[2] > 0 {
            species.nodes[i].mid[4] = species.nodes[species.nodes[i].up as usize].mid[4] + 1;
        }
    }
}

/// Runs the full reconciliation of `gene` against `sptree`, leaving the
/// result in `rec.{ndups, nloss, ndcos}`. The species-tree MRCA cache is
/// invalidated if its traversal went stale since the last run.
pub fn reconcile(gene: &mut Topology, rec: &mut Reconciliation, sptree: &mut SpeciesTree) -> Result<()> {
    if !gene.traversal_updated {
        gene.update_traversal()?;
    }
    if !sptree.topo.traversal_updated {
        sptree.clear_mrca();
        sptree.topo.update_traversal()?;
    }
    if rec.sp_count.len() != sptree.topo.nleaves {
        return Err(PhyloError::ShapeMismatch("reconciliation was allocated against a different species tree size".into()));
    }
    if rec.sptree_token != Some(sptree.token()) {
        rec.sptree_token = Some(sptree.token());
    }
    for leaf in 0..gene.nleaves {
        rec.map_d[leaf] = rec.sp_id[leaf];
        rec.ndup_d[leaf] = 0;
        rec.nlos_d[leaf] = 0;
    }
    prepare_for_loss_calculation(&mut sptree.topo, &rec.sp_count);

    let level = |sp: &SpeciesTree, node: usize| sp.topo.nodes[node].mid[4];

    // postorder: map every gene subtree onto the species tree
    for i in 0..gene.nleaves - 1 {
        let g_id = gene.postorder[i];
        let l = gene.nodes[g_id].left as usize;
        let r = gene.nodes[g_id].right as usize;
        let ml = rec.map_d[l];
        let mr = rec.map_d[r];
        let map = sptree.mrca(ml, mr)?;
        rec.map_d[g_id] = map;
        rec.ndup_d[g_id] = rec.ndup_d[l] + rec.ndup_d[r];
        rec.nlos_d[g_id] = rec.nlos_d[l] + rec.nlos_d[r];
        if map == ml || map == mr {
            rec.ndup_d[g_id] += 1;
            if ml != mr {
                // losses span the species path down to the deeper child map
                let other = if ml == map { mr } else { ml };
                rec.nlos_d[g_id] += level(sptree, other) - level(sptree, map);
            }
        } else {
            rec.nlos_d[g_id] += level(sptree, ml) + level(sptree, mr) - 2 * level(sptree, map) - 2;
        }
    }

    reconcile_unrooted(gene, rec, sptree)
}

/// The flipped pass plus the virtual-root scan.
fn reconcile_unrooted(gene: &Topology, rec: &mut Reconciliation, sptree: &mut SpeciesTree) -> Result<()> {
    let r_left = gene.nodes[gene.root].left as usize;
    let r_right = gene.nodes[gene.root].right as usize;

    // the root edge is shared: each root child sees the other side as "up"
    rec.map_u[r_left] = rec.map_d[r_right];
    rec.map_u[r_right] = rec.map_d[r_left];
    rec.ndup_u[r_left] = rec.ndup_d[r_right];
    rec.ndup_u[r_right] = rec.ndup_d[r_left];
    rec.nlos_u[r_left] = rec.nlos_d[r_right];
    rec.nlos_u[r_right] = rec.nlos_d[r_left];

    let level = |sp: &SpeciesTree, node: usize| sp.topo.nodes[node].mid[4];

    // preorder over the remaining internal nodes, then the leaves: same DP
    // with (up, sister) in place of (left, right)
    let mut order: Vec<usize> = Vec::with_capacity(gene.nnodes - 3);
    for i in (0..gene.nleaves.saturating_sub(2)).rev() {
        order.push(gene.postorder[i]);
    }
    order.extend(0..gene.nleaves);
    for g_id in order {
        if g_id == r_left || g_id == r_right {
            continue;
        }
        let up = gene.nodes[g_id].up as usize;
        let sister = gene.nodes[g_id].sister as usize;
        let map_up = rec.map_u[up];
        let map_sister = rec.map_d[sister];
        let map = sptree.mrca(map_up, map_sister)?;
        rec.map_u[g_id] = map;
        rec.ndup_u[g_id] = rec.ndup_u[up] + rec.ndup_d[sister];
        rec.nlos_u[g_id] = rec.nlos_u[up] + rec.nlos_d[sister];
        if map == map_up || map == map_sister {
            rec.ndup_u[g_id] += 1;
            if map_up != map_sister {
                let other = if map_sister == map { map_up } else { map_sister };
                rec.nlos_u[g_id] += level(sptree, other) - level(sptree, map);
            }
        } else {
            rec.nlos_u[g_id] +=
                level(sptree, map_sister) + level(sptree, map_up) - 2 * level(sptree, map) - 2;
        }
    }

    // every edge is a candidate root; r_right duplicates r_left's edge
    let mut best: Option<(i32, i32, i32)> = None;
    for g_id in 0..gene.nnodes {
        if g_id == r_right || g_id == gene.root {
            continue;
        }
        let mu = rec.map_u[g_id];
        let md = rec.map_d[g_id];
        let map_root = sptree.mrca(mu, md)?;
        let mut dups = rec.ndup_u[g_id] + rec.ndup_d[g_id];
        if map_root == mu || map_root == md {
            dups += 1;
        }
        let mut loss = rec.nlos_u[g_id] + rec.nlos_d[g_id];
        if map_root == mu && map_root != md {
            loss += level(sptree, md) - level(sptree, map_root);
        } else if map_root != mu && map_root == md {
            loss += level(sptree, mu) - level(sptree, map_root);
        } else if map_root != mu && map_root != md {
            loss += level(sptree, mu) + level(sptree, md) - 2 * level(sptree, map_root) - 2;
        }
        let coal = loss - 2 * dups + rec.size_diff;
        if best.is_none_or(|(bd, bl, _)| (dups, loss) < (bd, bl)) {
            best = Some((dups, loss, coal));
        }
    }
    let (dups, loss, coal) = best.ok_or_else(|| {
        PhyloError::InvariantViolated("virtual-root scan found no candidate edge".into())
    })?;
    rec.ndups = dups;
    rec.nloss = loss;
    rec.ndcos = coal;
    Ok(())
}

/// Which split-based distances to compute alongside a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsprLevel {
    RfOnly,
    Hdist,
    Full,
}

/// A gene tree bundled with its reconciliation state, its split-distance
/// engine, and the last computed distance vector
/// `[dups, losses, deep coalescences, rf, hdist, spr + spr_extra]`.
#[derive(Debug)]
pub struct GeneTree {
    pub topo: Topology,
    pub rec: Reconciliation,
    pub split: SplitSet,
    pub distance: [i32; 6],
    /// Running minima (first six) and maxima (last six) across the species
    /// trees this gene tree has been scored against.
    pub minmax: [i32; 12],
}

pub const DISTANCE_NAMES: [(&str, &str); 6] = [
    ("dup", "duplication"),
    ("los", "loss"),
    ("dco", "deep coalescence"),
    ("rfd", "RF"),
    ("hdi", "Hungarian"),
    ("spr", "approx. SPR"),
];

impl GeneTree {
    /// Binds a gene topology to a species tree: leaf names are mapped to
    /// species, and the reconciliation and split-set state are allocated.
    pub fn new(topo: Topology, sptree: &SpeciesTree) -> Result<Self> {
        let sp_id = map_gene_leaves_to_species(&topo.taxlabel, &sptree.topo.taxlabel)?;
        let rec = Reconciliation::new(topo.nleaves, sptree.topo.nleaves, sp_id)?;
        let split = SplitSet::new_from_gene_species(&topo, &sptree.topo, &rec.sp_id)?;
        let mut minmax = [i32::MAX; 12];
        minmax[6..].fill(i32::MIN);
        Ok(GeneTree { topo, rec, split, distance: [0; 6], minmax })
    }

    /// Reconciles against `sptree` and returns `(ndups, nloss, ndcos)`.
    pub fn reconcile(&mut self, sptree: &mut SpeciesTree) -> Result<(i32, i32, i32)> {
        reconcile(&mut self.topo, &mut self.rec, sptree)?;
        Ok((self.rec.ndups, self.rec.nloss, self.rec.ndcos))
    }

    /// Split-based distances at the requested level.
    pub fn dspr(&mut self, sptree: &mut SpeciesTree, level: DsprLevel) -> Result<i32> {
        match level {
            DsprLevel::RfOnly => self.split.dspr_gene_species_rf(&mut self.topo, &mut sptree.topo),
            DsprLevel::Hdist => self.split.dspr_gene_species_hdist(&mut self.topo, &mut sptree.topo),
            DsprLevel::Full => self.split.dspr_gene_species(&mut self.topo, &mut sptree.topo),
        }
    }

    /// All six distances against one species tree, also folded into the
    /// running min/max bands.
    pub fn distances(&mut self, sptree: &mut SpeciesTree) -> Result<[i32; 6]> {
        self.reconcile(sptree)?;
        self.dspr(sptree, DsprLevel::Full)?;
        self.distance = [
            self.rec.ndups,
            self.rec.nloss,
            self.rec.ndcos,
            self.split.rf,
            self.split.hdist,
            self.split.spr + self.split.spr_extra,
        ];
        for k in 0..6 {
            self.minmax[k] = self.minmax[k].min(self.distance[k]);
            self.minmax[k + 6] = self.minmax[k + 6].max(self.distance[k]);
        }
        Ok(self.distance)
    }
}

/// Convenience constructor for the common case of one gene tree and one
/// species tree built from the same label space.
pub fn new_genetree_speciestree_pair(gene: Topology, species: Topology) -> Result<(GeneTree, SpeciesTree)> {
    let sptree = SpeciesTree::new(species)?;
    let gtree = GeneTree::new(gene, &sptree)?;
    Ok((gtree, sptree))
}
