//! Rooted binary topology with cached splits and postorder traversal.
//!
//! # Overview
//! Nodes live in a flat `Vec` and refer to each other by id, so every
//! traversal is plain integer iteration: leaves occupy ids `[0, nleaves)`
//! (the id doubles as the leaf's bit position in splits), internal nodes
//! occupy `[nleaves, 2·nleaves-1)`, and the root always carries the largest
//! id. `postorder` lists internal nodes only, children before parents, root
//! last.
//!
//! The traversal-derived state (`level`, `split`, `sister`, `postorder`) is
//! rebuilt by [`Topology::update_traversal`]; any structural edit flips
//! `traversal_updated` off, and the algorithmic modules refuse to run on a
//! stale topology instead of silently rebuilding mid-algorithm.
//!
//! Trees enter the crate through the [`TreeSource`] trait (node ids, leaf
//! labels, child lists, optional edge lengths), implemented here for
//! `phylotree::tree::Tree`; [`TreeShape`] flattens any source into the
//! id-array form `Topology` is built from. Node ids assigned by a source
//! are never used as bit positions; only catalog positions are (leaf names
//! are what identify taxa across trees, source ids differ from file to
//! file).

use std::sync::Arc;

use phylotree::tree::Tree as PhyloTree;

use crate::bitset::Split;
use crate::catalog::LabelCatalog;
use crate::error::{PhyloError, Result};

/// Sentinel for an absent node reference.
pub const NONE: i32 = -1;

/// One node of a topology. `mid` is a small scratch area written by the
/// reconciliation pass (subtree cardinality, active/dummy flag and active
/// level); it carries no meaning outside a reconciliation run.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: usize,
    pub up: i32,
    pub left: i32,
    pub right: i32,
    pub sister: i32,
    pub level: i32,
    pub mid: [i32; 5],
    pub internal: bool,
    pub split: Split,
}

impl Node {
    fn new(id: usize, nleaves: usize) -> Self {
        let mut split = Split::new(nleaves);
        let internal = id >= nleaves;
        if !internal {
            split.set(id);
        }
        Node { id, up: NONE, left: NONE, right: NONE, sister: NONE, level: 0, mid: [0; 5], internal, split }
    }
}

/// A rooted binary tree over `nleaves` labelled leaves.
#[derive(Debug, Clone)]
pub struct Topology {
    pub nleaves: usize,
    pub nnodes: usize,
    pub nodes: Vec<Node>,
    /// Internal node ids, children before parents, root last; length
    /// `nleaves - 1`. Valid only while `traversal_updated` holds.
    pub postorder: Vec<usize>,
    pub root: usize,
    pub blength: Option<Vec<f64>>,
    pub taxlabel: Arc<LabelCatalog>,
    pub traversal_updated: bool,
}

impl Topology {
    /// Allocates an unlinked topology: leaves carry their singleton splits,
    /// internal nodes wait for [`Topology::create_parent_from_children`].
    pub fn new(nleaves: usize, taxlabel: Arc<LabelCatalog>) -> Result<Self> {
        if nleaves < 2 {
            return Err(PhyloError::OutOfRange(format!("topology needs at least 2 leaves, got {nleaves}")));
        }
        if taxlabel.len() != nleaves {
            return Err(PhyloError::ShapeMismatch(format!(
                "label catalog has {} entries for a {nleaves}-leaf topology",
                taxlabel.len()
            )));
        }
        let nnodes = 2 * nleaves - 1;
        let nodes = (0..nnodes).map(|id| Node::new(id, nleaves)).collect();
        Ok(Topology {
            nleaves,
            nnodes,
            nodes,
            postorder: Vec::new(),
            root: nnodes - 1,
            blength: None,
            taxlabel,
            traversal_updated: false,
        })
    }

    /// Allocates the branch-length vector (indexed by node id) if absent.
    pub fn ensure_blength(&mut self) {
        if self.blength.is_none() {
            self.blength = Some(vec![0.0; self.nnodes]);
        }
    }

    /// Links `left_id` and `right_id` under `parent_id` and invalidates the
    /// traversal.
    pub fn create_parent_from_children(&mut self, parent_id: usize, left_id: usize, right_id: usize) {
        self.nodes[parent_id].left = left_id as i32;
        self.nodes[parent_id].right = right_id as i32;
        self.nodes[parent_id].internal = true;
        self.nodes[left_id].up = parent_id as i32;
        self.nodes[right_id].up = parent_id as i32;
        self.traversal_updated = false;
    }

    /// Recomputes every node's sister pointer from its parent's children.
    pub fn update_sisters(&mut self) {
        for id in 0..self.nnodes {
            if !self.nodes[id].internal {
                continue;
            }
            let (l, r) = (self.nodes[id].left, self.nodes[id].right);
            if l >= 0 && r >= 0 {
                self.nodes[l as usize].sister = r;
                self.nodes[r as usize].sister = l;
            }
        }
        self.nodes[self.root].sister = NONE;
    }

    /// Rebuilds `postorder`, levels, sisters and cached splits. Each internal
    /// node is visited after both children; the root comes last. After this,
    /// `split[p] == split[p.left] | split[p.right]` holds everywhere.
    pub fn update_traversal(&mut self) -> Result<()> {
        self.update_sisters();
        self.nodes[self.root].level = 0;
        self.nodes[self.root].up = NONE;

        let mut post = Vec::with_capacity(self.nleaves - 1);
        let mut stack = vec![(self.root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                post.push(id);
                continue;
            }
            let node = &self.nodes[id];
            if !node.internal {
                continue;
            }
            let (l, r) = (node.left, node.right);
            if l < 0 || r < 0 {
                return Err(PhyloError::InvariantViolated(format!("internal node {id} misses a child")));
            }
            let level = node.level + 1;
            self.nodes[l as usize].level = level;
            self.nodes[r as usize].level = level;
            stack.push((id, true));
            stack.push((r as usize, false));
            stack.push((l as usize, false));
        }
        if post.len() != self.nleaves - 1 {
            return Err(PhyloError::InvariantViolated(format!(
                "postorder reached {} internal nodes, expected {}",
                post.len(),
                self.nleaves - 1
            )));
        }

        for &id in &post {
            let (l, r) = (self.nodes[id].left as usize, self.nodes[id].right as usize);
            let mut s = std::mem::replace(&mut self.nodes[id].split, Split::new(0));
            s.or_of(&self.nodes[l].split, &self.nodes[r].split, true);
            self.nodes[id].split = s;
        }

        self.postorder = post;
        self.traversal_updated = true;
        Ok(())
    }

    fn require_traversal(&self) -> Result<()> {
        if self.traversal_updated {
            Ok(())
        } else {
            Err(PhyloError::MissingData("topology traversal is stale; call update_traversal first".into()))
        }
    }

    /// Internal splits except the root's (which always spans every leaf),
    /// cloned. Canonicalised and stripped of trivial entries when `canonical`
    /// is set, for unrooted comparison.
    fn internal_splits(&self, canonical: bool) -> Vec<Split> {
        let mut out: Vec<Split> = self
            .postorder
            .iter()
            .filter(|&&id| id != self.root)
            .map(|&id| self.nodes[id].split.clone())
            .collect();
        if canonical {
            out.iter_mut().for_each(Split::flip_to_smaller_set);
            out.retain(|s| s.n_ones() >= 2);
        }
        out.sort_by(|a, b| a.cmp_increasing(b));
        if canonical {
            out.dedup();
        }
        out
    }

    /// Rooted equality: same multiset of internal splits. Both traversals
    /// must be up to date; no rebuilding happens here.
    pub fn is_equal(a: &Topology, b: &Topology) -> Result<bool> {
        a.require_traversal()?;
        b.require_traversal()?;
        if !a.taxlabel.same_labels(&b.taxlabel) {
            return Err(PhyloError::ShapeMismatch("topologies compared across different label catalogs".into()));
        }
        if a.nleaves != b.nleaves {
            return Ok(false);
        }
        Ok(a.internal_splits(false) == b.internal_splits(false))
    }

    /// Unrooted equality: the sets of canonical (`flip_to_smaller_set`)
    /// non-trivial bipartitions are compared. With `compare_splits` the split
    /// vectors are compared outright; otherwise a 32-bit hash of each set is
    /// compared first and only verified on agreement.
    pub fn is_equal_unrooted(a: &Topology, b: &Topology, compare_splits: bool) -> Result<bool> {
        a.require_traversal()?;
        b.require_traversal()?;
        if !a.taxlabel.same_labels(&b.taxlabel) {
            return Err(PhyloError::ShapeMismatch("topologies compared across different label catalogs".into()));
        }
        if a.nleaves != b.nleaves {
            return Ok(false);
        }
        let sa = a.internal_splits(true);
        let sb = b.internal_splits(true);
        if !compare_splits {
            let ha = sa.iter().fold(0u32, |acc, s| acc.wrapping_add(s.hash32()));
            let hb = sb.iter().fold(0u32, |acc, s| acc.wrapping_add(s.hash32()));
            if ha != hb || sa.len() != sb.len() {
                return Ok(false);
            }
        }
        Ok(sa == sb)
    }

    /// Applies a leaf permutation: leaf `i` becomes leaf `perm[i]` (and takes
    /// bit position `perm[i]` in every split). A fresh catalog is produced so
    /// other trees sharing the old one are unaffected. Traversal-derived
    /// state is invalidated.
    pub fn reorder_leaves(&mut self, perm: &[usize]) -> Result<()> {
        if perm.len() != self.nleaves {
            return Err(PhyloError::ShapeMismatch(format!(
                "permutation of length {} for {} leaves",
                perm.len(),
                self.nleaves
            )));
        }
        let mut seen = vec![false; self.nleaves];
        for &p in perm {
            if p >= self.nleaves || seen[p] {
                return Err(PhyloError::OutOfRange("leaf reordering is not a permutation".into()));
            }
            seen[p] = true;
        }

        let old_leaves: Vec<Node> = self.nodes[..self.nleaves].to_vec();
        for (old_id, mut node) in old_leaves.into_iter().enumerate() {
            let new_id = perm[old_id];
            node.id = new_id;
            node.split = {
                let mut s = Split::new(self.nleaves);
                s.set(new_id);
                s
            };
            self.nodes[new_id] = node;
        }
        for id in self.nleaves..self.nnodes {
            let l = self.nodes[id].left;
            if l >= 0 && (l as usize) < self.nleaves {
                self.nodes[id].left = perm[l as usize] as i32;
            }
            let r = self.nodes[id].right;
            if r >= 0 && (r as usize) < self.nleaves {
                self.nodes[id].right = perm[r as usize] as i32;
            }
        }
        if let Some(bl) = &mut self.blength {
            let old: Vec<f64> = bl[..self.nleaves].to_vec();
            for (old_id, v) in old.into_iter().enumerate() {
                bl[perm[old_id]] = v;
            }
        }
        let mut labels = vec![String::new(); self.nleaves];
        for (old_id, label) in self.taxlabel.iter().enumerate() {
            labels[perm[old_id]] = label.to_string();
        }
        self.taxlabel = Arc::new(LabelCatalog::from_labels(labels)?);
        self.traversal_updated = false;
        Ok(())
    }

    /// Reorders leaves so that labels appear in lexicographic order; species
    /// trees are canonicalised this way so leaf id equals species index.
    pub fn sort_leaves_by_label(&mut self) -> Result<()> {
        let mut order: Vec<usize> = (0..self.nleaves).collect();
        order.sort_by(|&a, &b| self.taxlabel.label(a).cmp(self.taxlabel.label(b)));
        let mut perm = vec![0usize; self.nleaves];
        for (rank, &old_id) in order.iter().enumerate() {
            perm[old_id] = rank;
        }
        self.reorder_leaves(&perm)
    }

    /// Serialises to Newick. Branch lengths are included when present; with
    /// `show_ids` every node additionally carries its integer id.
    pub fn to_newick(&self, show_ids: bool) -> String {
        let mut out = String::new();
        self.write_newick_node(self.root, show_ids, &mut out);
        out.push(';');
        out
    }

    fn write_newick_node(&self, id: usize, show_ids: bool, out: &mut String) {
        let node = &self.nodes[id];
        if node.internal {
            out.push('(');
            self.write_newick_node(node.left as usize, show_ids, out);
            out.push(',');
            self.write_newick_node(node.right as usize, show_ids, out);
            out.push(')');
            if show_ids {
                out.push_str(&id.to_string());
            }
        } else {
            out.push_str(self.taxlabel.label(id));
            if show_ids {
                out.push_str(&format!("_{id}"));
            }
        }
        if let Some(bl) = &self.blength {
            if id != self.root {
                out.push_str(&format!(":{}", bl[id]));
            }
        }
    }

    /// Builds a topology from the narrow tree-source form. With a caller
    /// catalog, leaf bit positions follow it (labels must match exactly);
    /// otherwise a fresh catalog is made from the shape's leaf order.
    pub fn from_shape(shape: &TreeShape, catalog: Option<Arc<LabelCatalog>>) -> Result<Self> {
        let n = shape.nleaves;
        let catalog = match catalog {
            Some(cat) => {
                if cat.len() != n {
                    return Err(PhyloError::ShapeMismatch(format!(
                        "catalog has {} labels, tree has {n} leaves",
                        cat.len()
                    )));
                }
                cat
            }
            None => Arc::new(LabelCatalog::from_labels(shape.names.iter().cloned())?),
        };
        // shape leaf id -> topology leaf id (catalog position)
        let mut leafmap = vec![0usize; n];
        let mut taken = vec![false; n];
        for (shape_id, name) in shape.names.iter().enumerate() {
            let id = catalog.index_of(name).ok_or_else(|| {
                PhyloError::ShapeMismatch(format!("leaf \"{name}\" is absent from the label catalog"))
            })?;
            if taken[id] {
                return Err(PhyloError::ShapeMismatch(format!("leaf label \"{name}\" appears twice")));
            }
            taken[id] = true;
            leafmap[shape_id] = id;
        }

        let remap = |id: i32| -> i32 {
            if id >= 0 && (id as usize) < n { leafmap[id as usize] as i32 } else { id }
        };

        let mut topo = Topology::new(n, catalog)?;
        for shape_id in 0..shape.up.len() {
            let id = remap(shape_id as i32) as usize;
            topo.nodes[id].up = remap(shape.up[shape_id]);
            topo.nodes[id].left = remap(shape.left[shape_id]);
            topo.nodes[id].right = remap(shape.right[shape_id]);
        }
        if let Some(bl) = &shape.blength {
            let mut blength = vec![0.0; topo.nnodes];
            for shape_id in 0..bl.len() {
                blength[remap(shape_id as i32) as usize] = bl[shape_id];
            }
            topo.blength = Some(blength);
        }
        topo.update_traversal()?;
        Ok(topo)
    }

    /// Parses a Newick string through the external tree source and builds a
    /// topology, sharing `catalog` when given.
    pub fn from_newick(newick: &str, catalog: Option<Arc<LabelCatalog>>) -> Result<Self> {
        let tree = PhyloTree::from_newick(newick).map_err(|e| PhyloError::Parse(e.to_string()))?;
        Topology::from_shape(&TreeShape::from_source(&tree)?, catalog)
    }
}

/// The narrow interface the core consumes trees through: node ids in the
/// source's own id space, leaf labels, child lists and optional edge
/// lengths. Any parser or in-memory representation can feed the crate by
/// implementing this; the shipped implementation covers
/// `phylotree::tree::Tree`.
pub trait TreeSource {
    /// Ids of the leaf nodes.
    fn leaves(&self) -> Vec<usize>;
    /// Id of the root node.
    fn root(&self) -> Result<usize>;
    /// Children of a node, empty for leaves.
    fn children(&self, id: usize) -> Result<Vec<usize>>;
    /// Label of a node, expected on every leaf.
    fn name(&self, id: usize) -> Result<Option<String>>;
    /// Length of the edge above a node, when the source carries lengths.
    fn parent_edge(&self, id: usize) -> Result<Option<f64>>;
}

impl TreeSource for PhyloTree {
    fn leaves(&self) -> Vec<usize> {
        self.get_leaves()
    }

    fn root(&self) -> Result<usize> {
        Ok(self.get_root()?)
    }

    fn children(&self, id: usize) -> Result<Vec<usize>> {
        Ok(self.get(&id)?.children.clone())
    }

    fn name(&self, id: usize) -> Result<Option<String>> {
        Ok(self.get(&id)?.name.clone())
    }

    fn parent_edge(&self, id: usize) -> Result<Option<f64>> {
        Ok(self.get(&id)?.parent_edge)
    }
}

/// A tree source flattened into id arrays: leaf names, parent and child
/// pointers over ids `[0, 2n-1)` with leaves first, and optionally the
/// length of the edge above each node. `up[root] == -1`.
#[derive(Debug, Clone)]
pub struct TreeShape {
    pub nleaves: usize,
    pub up: Vec<i32>,
    pub left: Vec<i32>,
    pub right: Vec<i32>,
    /// Leaf id → label, alphabetical when produced by `from_source`.
    pub names: Vec<String>,
    pub blength: Option<Vec<f64>>,
}

impl TreeShape {
    /// Extracts the shape of any [`TreeSource`]. Leaves are assigned ids in
    /// alphabetical label order; internal nodes are numbered in postorder so
    /// the root naturally gets the largest id. Only rooted binary trees are
    /// accepted.
    pub fn from_source<S: TreeSource + ?Sized>(tree: &S) -> Result<Self> {
        let mut leaves: Vec<(usize, String)> = Vec::new();
        for leaf_id in tree.leaves() {
            let name = tree
                .name(leaf_id)?
                .ok_or_else(|| PhyloError::MissingData(format!("leaf node {leaf_id} has no name")))?;
            leaves.push((leaf_id, name));
        }
        leaves.sort_by(|a, b| a.1.cmp(&b.1));
        let n = leaves.len();
        if n < 2 {
            return Err(PhyloError::ShapeMismatch(format!("tree has {n} leaves, need at least 2")));
        }
        let nnodes = 2 * n - 1;
        let mut shape = TreeShape {
            nleaves: n,
            up: vec![NONE; nnodes],
            left: vec![NONE; nnodes],
            right: vec![NONE; nnodes],
            names: leaves.iter().map(|(_, name)| name.clone()).collect(),
            blength: None,
        };

        let mut src_to_shape: std::collections::HashMap<usize, usize> =
            leaves.iter().enumerate().map(|(shape_id, &(src_id, _))| (src_id, shape_id)).collect();

        let root = tree.root()?;
        let mut next_internal = n;
        let mut edges: Vec<(usize, f64)> = Vec::new(); // (shape id, parent edge)
        let mut any_blen = false;
        let mut stack = vec![(root, false)];
        while let Some((src_id, expanded)) = stack.pop() {
            let children = tree.children(src_id)?;
            if children.is_empty() {
                let shape_id = src_to_shape[&src_id];
                let edge = tree.parent_edge(src_id)?;
                edges.push((shape_id, edge.unwrap_or(0.0)));
                any_blen |= edge.is_some();
                continue;
            }
            if children.len() != 2 {
                return Err(PhyloError::ShapeMismatch(format!(
                    "node {src_id} has {} children; only rooted binary trees are supported",
                    children.len()
                )));
            }
            if !expanded {
                stack.push((src_id, true));
                stack.push((children[1], false));
                stack.push((children[0], false));
                continue;
            }
            let shape_id = next_internal;
            next_internal += 1;
            src_to_shape.insert(src_id, shape_id);
            let l = src_to_shape[&children[0]];
            let r = src_to_shape[&children[1]];
            shape.left[shape_id] = l as i32;
            shape.right[shape_id] = r as i32;
            shape.up[l] = shape_id as i32;
            shape.up[r] = shape_id as i32;
            let edge = tree.parent_edge(src_id)?;
            edges.push((shape_id, edge.unwrap_or(0.0)));
            any_blen |= edge.is_some();
        }
        if next_internal != nnodes {
            return Err(PhyloError::ShapeMismatch("tree is not a full binary tree over its leaves".into()));
        }
        if any_blen {
            let mut bl = vec![0.0; nnodes];
            for (shape_id, edge) in edges {
                bl[shape_id] = edge;
            }
            shape.blength = Some(bl);
        }
        Ok(shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topo(newick: &str) -> Topology {
        Topology::from_newick(newick, None).unwrap()
    }

    #[test]
    fn leaves_take_alphabetical_bit_positions() {
        let t = topo("((B,D),(C,A));");
        assert_eq!(t.nleaves, 4);
        assert_eq!(t.taxlabel.index_of("A"), Some(0));
        assert_eq!(t.taxlabel.index_of("D"), Some(3));
        assert_eq!(t.root, 6);
        assert!(t.traversal_updated);
    }

    #[test]
    fn postorder_visits_children_first() {
        let t = topo("(((A,B),C),D);");
        assert_eq!(t.postorder.len(), 3);
        assert_eq!(*t.postorder.last().unwrap(), t.root);
        for &id in &t.postorder {
            let node = &t.nodes[id];
            let pos = t.postorder.iter().position(|&x| x == id).unwrap();
            for child in [node.left, node.right] {
                if t.nodes[child as usize].internal {
                    let cpos = t.postorder.iter().position(|&x| x == child as usize).unwrap();
                    assert!(cpos < pos);
                }
            }
        }
    }

    #[test]
    fn internal_splits_are_union_of_children() {
        let t = topo("((A,B),((C,D),E));");
        for &id in &t.postorder {
            let node = &t.nodes[id];
            let l = &t.nodes[node.left as usize].split;
            let r = &t.nodes[node.right as usize].split;
            let mut union = Split::new(t.nleaves);
            union.or_of(l, r, true);
            assert_eq!(node.split, union);
            assert_eq!(node.split.n_ones(), l.n_ones() + r.n_ones());
        }
        assert_eq!(t.nodes[t.root].split.n_ones(), t.nleaves);
    }

    #[test]
    fn sisters_and_levels() {
        let t = topo("((A,B),C);");
        let root = &t.nodes[t.root];
        let (l, r) = (root.left as usize, root.right as usize);
        assert_eq!(t.nodes[l].sister, r as i32);
        assert_eq!(t.nodes[r].sister, l as i32);
        assert_eq!(root.level, 0);
        assert_eq!(t.nodes[l].level, 1);
        assert_eq!(t.nodes[r].level, 1);
    }

    #[test]
    fn rooted_equality_ignores_child_order() {
        let a = topo("((A,B),(C,D));");
        let cat = a.taxlabel.clone();
        let b = Topology::from_newick("((D,C),(B,A));", Some(cat.clone())).unwrap();
        let c = Topology::from_newick("((A,C),(B,D));", Some(cat)).unwrap();
        assert!(Topology::is_equal(&a, &b).unwrap());
        assert!(!Topology::is_equal(&a, &c).unwrap());
    }

    #[test]
    fn unrooted_equality_sees_through_the_root() {
        // same unrooted tree, rooted on different edges
        let a = topo("((A,B),(C,D));");
        let cat = a.taxlabel.clone();
        let b = Topology::from_newick("(A,(B,(C,D)));", Some(cat.clone())).unwrap();
        let c = Topology::from_newick("((A,C),(B,D));", Some(cat)).unwrap();
        assert!(!Topology::is_equal(&a, &b).unwrap());
        assert!(Topology::is_equal_unrooted(&a, &b, true).unwrap());
        assert!(Topology::is_equal_unrooted(&a, &b, false).unwrap());
        assert!(!Topology::is_equal_unrooted(&a, &c, true).unwrap());
        assert!(!Topology::is_equal_unrooted(&a, &c, false).unwrap());
    }

    #[test]
    fn equality_requires_fresh_traversal() {
        let a = topo("((A,B),(C,D));");
        let mut b = a.clone();
        b.traversal_updated = false;
        assert!(Topology::is_equal(&a, &b).is_err());
    }

    #[test]
    fn reorder_roundtrip_preserves_equality() {
        let a = topo("((A,B),(C,D));");
        let mut b = a.clone();
        let perm = [2, 0, 3, 1];
        let mut inverse = [0usize; 4];
        for (i, &p) in perm.iter().enumerate() {
            inverse[p] = i;
        }
        b.reorder_leaves(&perm).unwrap();
        b.update_traversal().unwrap();
        assert!(!a.taxlabel.same_labels(&b.taxlabel));
        b.reorder_leaves(&inverse).unwrap();
        b.update_traversal().unwrap();
        assert!(Topology::is_equal(&a, &b).unwrap());
    }

    #[test]
    fn sort_leaves_is_canonical() {
        let mut t = topo("((A,B),C);");
        t.reorder_leaves(&[2, 0, 1]).unwrap();
        t.sort_leaves_by_label().unwrap();
        assert_eq!(t.taxlabel.index_of("A"), Some(0));
        assert_eq!(t.taxlabel.index_of("C"), Some(2));
    }

    #[test]
    fn newick_roundtrip() {
        let t = topo("((A:1,B:2):0.5,(C:1,D:1):0.5);");
        let s = t.to_newick(false);
        let back = Topology::from_newick(&s, Some(t.taxlabel.clone())).unwrap();
        assert!(Topology::is_equal(&t, &back).unwrap());
        assert_eq!(t.blength.as_ref().unwrap()[t.taxlabel.index_of("B").unwrap()], 2.0);
    }

    /// A tree source that is not a parser at all: plain id arrays.
    struct ArraySource {
        children: Vec<Vec<usize>>,
        names: Vec<Option<String>>,
        edges: Vec<Option<f64>>,
        root: usize,
    }

    impl TreeSource for ArraySource {
        fn leaves(&self) -> Vec<usize> {
            (0..self.children.len()).filter(|&id| self.children[id].is_empty()).collect()
        }
        fn root(&self) -> Result<usize> {
            Ok(self.root)
        }
        fn children(&self, id: usize) -> Result<Vec<usize>> {
            Ok(self.children[id].clone())
        }
        fn name(&self, id: usize) -> Result<Option<String>> {
            Ok(self.names[id].clone())
        }
        fn parent_edge(&self, id: usize) -> Result<Option<f64>> {
            Ok(self.edges[id])
        }
    }

    #[test]
    fn any_tree_source_feeds_the_same_topology() {
        // ((A:1,B:2):0.5,C:3) expressed as raw arrays, ids 0..5 with the
        // cherry at 3 and the root at 4
        let src = ArraySource {
            children: vec![vec![], vec![], vec![], vec![0, 1], vec![3, 2]],
            names: vec![
                Some("A".to_string()),
                Some("B".to_string()),
                Some("C".to_string()),
                None,
                None,
            ],
            edges: vec![Some(1.0), Some(2.0), Some(3.0), Some(0.5), None],
            root: 4,
        };
        let shape = TreeShape::from_source(&src).unwrap();
        let from_arrays = Topology::from_shape(&shape, None).unwrap();

        let parsed = Topology::from_newick("((A:1,B:2):0.5,C:3);", None).unwrap();
        assert!(Topology::is_equal(&from_arrays, &parsed).unwrap());
        let blen = from_arrays.blength.as_ref().unwrap();
        assert_eq!(blen[from_arrays.taxlabel.index_of("B").unwrap()], 2.0);
        assert_eq!(blen[from_arrays.taxlabel.index_of("C").unwrap()], 3.0);
    }

    #[test]
    fn multifurcations_are_rejected() {
        assert!(Topology::from_newick("(A,B,C,D);", None).is_err());
    }

    #[test]
    fn duplicate_leaf_names_are_rejected() {
        assert!(Topology::from_newick("((A,A),B);", None).is_err());
    }
}
