//! OPTICS density-based ordering and flat-cluster extraction over an
//! abstract pairwise distance source.
//!
//! # Overview
//! The algorithm first materialises the ε-neighbourhood graph in CSR form
//! (`va_i`/`va_n` index a flat edge array sorted by distance per point),
//! then walks the points by reachability: each processed point updates the
//! reachability of its unprocessed neighbours in a binary min-heap, and the
//! heap's minimum is expanded next. The resulting `order` / `core_distance`
//! / `reach_distance` arrays describe the reachability plot; `assign` cuts
//! it into flat clusters at any height below ε.
//!
//! Graph construction is the one data-parallel region of the crate: the
//! rayon path computes each point's edge block independently and reduces
//! only the running maximum distance, producing exactly the same graph as
//! the serial sweep.
//!
//! Every point carries its heap position (`pq_pos`) so decrease-key is
//! O(log n); the `pq[i].pq_pos == i` invariant is checked after each sift
//! and surfaces as `InvariantViolated` instead of corrupting the ordering.

use std::sync::Mutex;

use rayon::prelude::*;

use crate::error::{PhyloError, Result};

/// A symmetric, deterministic pairwise distance source: `get(i, j)` must
/// equal `get(j, i)` and be zero on the diagonal.
pub trait DistanceGenerator {
    fn n_samples(&self) -> usize;
    fn get(&self, i: usize, j: usize) -> f64;
}

/// Memoising adapter over a pairwise distance function that may produce
/// several distances per pair; `which_distance` selects the one reported.
/// Each pair is computed at most once per `reset`.
pub struct CachedDistance<F>
where
    F: Fn(usize, usize, &mut [f64]),
{
    n_samples: usize,
    n_distances: usize,
    which: usize,
    func: F,
    cache: Mutex<CacheInner>,
}

struct CacheInner {
    cached: Vec<bool>,
    dist: Vec<f64>,
}

impl<F> CachedDistance<F>
where
    F: Fn(usize, usize, &mut [f64]),
{
    /// `func(i, j, out)` fills `out` (length `n_distances`) for a pair with
    /// `i < j`.
    pub fn new(n_samples: usize, n_distances: usize, func: F) -> Result<Self> {
        if n_samples < 1 || n_distances < 1 {
            return Err(PhyloError::OutOfRange("cached distance needs at least one sample and one distance".into()));
        }
        let n_pairs = n_samples * (n_samples - 1) / 2;
        Ok(CachedDistance {
            n_samples,
            n_distances,
            which: 0,
            func,
            cache: Mutex::new(CacheInner { cached: vec![false; n_pairs], dist: vec![0.0; n_pairs * n_distances] }),
        })
    }

    pub fn set_which_distance(&mut self, which: usize) -> Result<()> {
        if which >= self.n_distances {
            return Err(PhyloError::OutOfRange(format!(
                "distance selector {which} out of range, generator holds {}",
                self.n_distances
            )));
        }
        self.which = which;
        Ok(())
    }

    /// Forgets every cached pair, e.g. after the underlying data changed.
    pub fn reset(&mut self) {
        let inner = self.cache.get_mut().unwrap_or_else(|e| e.into_inner());
        inner.cached.iter_mut().for_each(|c| *c = false);
        inner.dist.iter_mut().for_each(|d| *d = 0.0);
    }
}

impl<F> DistanceGenerator for CachedDistance<F>
where
    F: Fn(usize, usize, &mut [f64]),
{
    fn n_samples(&self) -> usize {
        self.n_samples
    }

    fn get(&self, i: usize, j: usize) -> f64 {
        if i == j {
            return 0.0;
        }
        let (i, j) = if i < j { (i, j) } else { (j, i) };
        let idx = j * (j - 1) / 2 + i;
        let mut inner = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.cached[idx] {
            let start = idx * self.n_distances;
            (self.func)(i, j, &mut inner.dist[start..start + self.n_distances]);
            inner.cached[idx] = true;
        }
        inner.dist[idx * self.n_distances + self.which]
    }
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    id: usize,
    distance: f64,
}

#[derive(Debug, Clone, Copy)]
struct Point {
    core_dist: f64,
    reach_dist: f64,
    processed: bool,
    pq_pos: i32,
}

/// OPTICS state and outputs. The result arrays (`order`, `core_distance`,
/// `reach_distance`, `core`) follow *processing order*; `cluster` is indexed
/// by point id.
#[derive(Debug)]
pub struct Goptics {
    pub epsilon: f64,
    pub min_points: usize,
    n_samples: usize,
    pub order: Vec<usize>,
    pub cluster: Vec<i32>,
    pub core: Vec<bool>,
    pub core_distance: Vec<f64>,
    pub reach_distance: Vec<f64>,
    pub max_distance: f64,
    pub n_clusters: usize,
    n_order: usize,
    va_i: Vec<usize>,
    va_n: Vec<usize>,
    ea: Vec<Edge>,
}

fn by_distance(a: &Edge, b: &Edge) -> std::cmp::Ordering {
    a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal)
}

impl Goptics {
    pub fn new(n_samples: usize, min_points: usize, epsilon: f64) -> Result<Self> {
        if n_samples < 1 {
            return Err(PhyloError::OutOfRange("OPTICS needs at least one sample".into()));
        }
        if min_points < 1 || min_points > n_samples {
            return Err(PhyloError::OutOfRange(format!(
                "min_points = {min_points} outside [1, {n_samples}]"
            )));
        }
        if !(epsilon > 0.0) {
            return Err(PhyloError::OutOfRange(format!("epsilon = {epsilon} must be positive")));
        }
        Ok(Goptics {
            epsilon,
            min_points,
            n_samples,
            order: Vec::new(),
            cluster: vec![-1; n_samples],
            core: vec![false; n_samples],
            core_distance: vec![0.0; n_samples],
            reach_distance: vec![f64::INFINITY; n_samples],
            max_distance: -1.0,
            n_clusters: 0,
            n_order: 0,
            va_i: vec![0; n_samples],
            va_n: vec![0; n_samples],
            ea: Vec::new(),
        })
    }

    fn check_source<G: DistanceGenerator + ?Sized>(&self, dg: &G) -> Result<()> {
        if dg.n_samples() != self.n_samples {
            return Err(PhyloError::ShapeMismatch(format!(
                "distance source has {} samples, OPTICS was sized for {}",
                dg.n_samples(),
                self.n_samples
            )));
        }
        Ok(())
    }

    /// Serial ε-graph construction followed by the reachability ordering.
    pub fn run<G: DistanceGenerator + ?Sized>(&mut self, dg: &G) -> Result<()> {
        self.check_source(dg)?;
        self.generate_graph(dg);
        self.expand_all()
    }

    /// Same ordering, with the graph built one point-row per rayon task.
    pub fn run_parallel<G: DistanceGenerator + Sync + ?Sized>(&mut self, dg: &G) -> Result<()> {
        self.check_source(dg)?;
        self.generate_graph_parallel(dg);
        self.expand_all()
    }

    fn generate_graph<G: DistanceGenerator + ?Sized>(&mut self, dg: &G) {
        let n = self.n_samples;
        self.max_distance = -1.0;
        let mut num_edges = 0usize;
        for j in 1..n {
            for i in 0..j {
                let de = dg.get(i, j);
                if de > self.max_distance {
                    self.max_distance = de;
                }
                if de <= self.epsilon {
                    num_edges += 2;
                }
            }
        }
        let mut ea = Vec::with_capacity(num_edges);
        for i in 0..n {
            self.va_i[i] = ea.len();
            self.va_n[i] = 0;
            for j in 0..n {
                if i != j {
                    let de = dg.get(i, j);
                    if de <= self.epsilon {
                        ea.push(Edge { id: j, distance: de });
                        self.va_n[i] += 1;
                    }
                }
            }
            ea[self.va_i[i]..].sort_by(by_distance);
        }
        self.ea = ea;
    }

    fn generate_graph_parallel<G: DistanceGenerator + Sync + ?Sized>(&mut self, dg: &G) {
        let n = self.n_samples;
        let epsilon = self.epsilon;
        let rows: Vec<(f64, Vec<Edge>)> = (0..n)
            .into_par_iter()
            .map(|i| {
                let mut local_max = -1.0f64;
                let mut edges = Vec::new();
                for j in 0..n {
                    if i != j {
                        let de = dg.get(j, i);
                        if de > local_max {
                            local_max = de;
                        }
                        if de <= epsilon {
                            edges.push(Edge { id: j, distance: de });
                        }
                    }
                }
                edges.sort_by(by_distance);
                (local_max, edges)
            })
            .collect();

        self.max_distance = rows.iter().fold(-1.0f64, |acc, (m, _)| acc.max(*m));
        let mut ea = Vec::with_capacity(rows.iter().map(|(_, e)| e.len()).sum());
        for (i, (_, edges)) in rows.into_iter().enumerate() {
            self.va_i[i] = ea.len();
            self.va_n[i] = edges.len();
            ea.extend(edges);
        }
        self.ea = ea;
    }

    fn expand_all(&mut self) -> Result<()> {
        let n = self.n_samples;
        self.n_order = 0;
        self.order = Vec::with_capacity(n);
        self.core_distance = vec![0.0; n];
        self.reach_distance = vec![f64::INFINITY; n];
        self.core = vec![false; n];
        self.cluster = vec![-1; n];
        self.n_clusters = 0;

        let mut points =
            vec![Point { core_dist: 0.0, reach_dist: f64::INFINITY, processed: false, pq_pos: -1 }; n];
        let mut heap = MinHeap { pq: Vec::with_capacity(n) };

        for start in 0..n {
            if points[start].processed {
                continue;
            }
            let mut current = start;
            loop {
                points[current].processed = true;
                self.set_core_dist(current, &mut points);
                self.record(current, &points);
                if points[current].core_dist.is_finite() {
                    self.update_seeds(current, &mut points, &mut heap)?;
                }
                match heap.pop(&mut points)? {
                    Some(next) => current = next,
                    None => break,
                }
            }
        }
        Ok(())
    }

    fn set_core_dist(&self, id: usize, points: &mut [Point]) {
        points[id].core_dist = if self.min_points == 1 {
            0.0
        } else if self.va_n[id] >= self.min_points - 1 {
            // the point itself is not its own neighbour, hence the -2
            self.ea[self.va_i[id] + self.min_points - 2].distance
        } else {
            f64::INFINITY
        };
    }

    fn record(&mut self, id: usize, points: &[Point]) {
        self.order.push(id);
        let mut core_d = points[id].core_dist;
        let mut reach_d = points[id].reach_dist;
        // cosmetic cap so plots have no infinities
        if reach_d > self.max_distance {
            reach_d = 2.0 * self.max_distance;
        }
        if core_d > self.max_distance {
            core_d = 2.0 * self.max_distance;
        }
        self.core_distance[self.n_order] = core_d;
        self.reach_distance[self.n_order] = reach_d;
        self.core[self.n_order] = points[id].core_dist < self.epsilon;
        self.n_order += 1;
    }

    fn update_seeds(&self, id: usize, points: &mut [Point], heap: &mut MinHeap) -> Result<()> {
        let cdist = points[id].core_dist;
        for k in self.va_i[id]..self.va_i[id] + self.va_n[id] {
            let edge = self.ea[k];
            if points[edge.id].processed {
                continue;
            }
            let newreach = cdist.max(edge.distance);
            if points[edge.id].reach_dist.is_infinite() {
                points[edge.id].reach_dist = newreach;
                heap.insert(points, edge.id)?;
            } else if newreach < points[edge.id].reach_dist {
                points[edge.id].reach_dist = newreach;
                let pos = points[edge.id].pq_pos;
                heap.promote(points, pos as usize)?;
            }
        }
        Ok(())
    }

    /// Flat clusters from the reachability plot: a new cluster starts at
    /// every reachability jump above `cluster_eps` whose point is core at
    /// that radius; points with neither are noise (`-1`).
    pub fn assign(&mut self, cluster_eps: f64) {
        let cluster_eps = cluster_eps.min(0.999 * self.epsilon);
        let mut cluster = -1i32;
        for j in 0..self.n_order {
            let id = self.order[j];
            if self.reach_distance[j] > cluster_eps {
                if self.core_distance[j] <= cluster_eps {
                    cluster += 1;
                    self.cluster[id] = cluster;
                } else {
                    self.cluster[id] = -1;
                }
            } else {
                self.cluster[id] = cluster;
            }
        }
        self.n_clusters = (cluster + 1) as usize;
    }
}

/// Binary min-heap keyed by reachability, with back-pointers into the point
/// array so decrease-key finds its entry in O(1).
struct MinHeap {
    pq: Vec<usize>,
}

impl MinHeap {
    fn insert(&mut self, points: &mut [Point], id: usize) -> Result<()> {
        self.pq.push(id);
        let pos = self.pq.len() - 1;
        points[id].pq_pos = pos as i32;
        self.promote(points, pos)
    }

    fn promote(&mut self, points: &mut [Point], mut child: usize) -> Result<()> {
        while child > 0 {
            let parent = (child - 1) / 2;
            if points[self.pq[parent]].reach_dist <= points[self.pq[child]].reach_dist {
                break;
            }
            self.pq.swap(child, parent);
            points[self.pq[child]].pq_pos = child as i32;
            points[self.pq[parent]].pq_pos = parent as i32;
            child = parent;
        }
        if points[self.pq[child]].pq_pos != child as i32 {
            return Err(PhyloError::InvariantViolated("heap position desynchronised during sift-up".into()));
        }
        Ok(())
    }

    fn demote(&mut self, points: &mut [Point], mut parent: usize) -> Result<()> {
        loop {
            let mut child = 2 * parent + 1;
            if child >= self.pq.len() {
                break;
            }
            if child + 1 < self.pq.len()
                && points[self.pq[child]].reach_dist > points[self.pq[child + 1]].reach_dist
            {
                child += 1;
            }
            if points[self.pq[parent]].reach_dist <= points[self.pq[child]].reach_dist {
                break;
            }
            self.pq.swap(parent, child);
            points[self.pq[child]].pq_pos = child as i32;
            points[self.pq[parent]].pq_pos = parent as i32;
            parent = child;
        }
        if !self.pq.is_empty() && points[self.pq[parent]].pq_pos != parent as i32 {
            return Err(PhyloError::InvariantViolated("heap position desynchronised during sift-down".into()));
        }
        Ok(())
    }

    fn pop(&mut self, points: &mut [Point]) -> Result<Option<usize>> {
        if self.pq.is_empty() {
            return Ok(None);
        }
        let top = self.pq[0];
        let last = self.pq.len() - 1;
        self.pq.swap(0, last);
        self.pq.pop();
        if !self.pq.is_empty() {
            points[self.pq[0]].pq_pos = 0;
            self.demote(points, 0)?;
        }
        points[top].pq_pos = -1;
        Ok(Some(top))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LineDistance {
        positions: Vec<f64>,
    }

    impl DistanceGenerator for LineDistance {
        fn n_samples(&self) -> usize {
            self.positions.len()
        }
        fn get(&self, i: usize, j: usize) -> f64 {
            (self.positions[i] - self.positions[j]).abs()
        }
    }

    fn two_blobs() -> LineDistance {
        LineDistance { positions: vec![0.0, 1.0, 2.0, 10.0, 11.0, 12.0] }
    }

    #[test]
    fn two_line_blobs_make_two_clusters() {
        let dg = two_blobs();
        let mut gop = Goptics::new(6, 2, 5.0).unwrap();
        gop.run(&dg).unwrap();
        gop.assign(3.0);

        assert_eq!(gop.n_clusters, 2);
        assert_eq!(gop.order[..3], [0, 1, 2]);
        assert_eq!(&gop.cluster[..3], &[0, 0, 0]);
        assert_eq!(&gop.cluster[3..], &[1, 1, 1]);
        // every point has a neighbour at distance 1, so all are core
        for j in 0..6 {
            assert!(gop.core_distance[j] <= 1.0 || gop.core_distance[j] == 2.0 * gop.max_distance);
            assert!(gop.core[j]);
        }
        assert_eq!(gop.max_distance, 12.0);
        // the two infinite reachabilities (blob seeds) are capped at 2·max
        let capped = gop.reach_distance.iter().filter(|&&r| r == 24.0).count();
        assert_eq!(capped, 2);
    }

    #[test]
    fn parallel_graph_matches_serial() {
        let dg = two_blobs();
        let mut serial = Goptics::new(6, 2, 5.0).unwrap();
        serial.run(&dg).unwrap();
        let mut parallel = Goptics::new(6, 2, 5.0).unwrap();
        parallel.run_parallel(&dg).unwrap();

        assert_eq!(serial.va_i, parallel.va_i);
        assert_eq!(serial.va_n, parallel.va_n);
        assert_eq!(serial.order, parallel.order);
        assert_eq!(serial.max_distance, parallel.max_distance);
        for j in 0..6 {
            assert_eq!(serial.reach_distance[j], parallel.reach_distance[j]);
            assert_eq!(serial.core_distance[j], parallel.core_distance[j]);
        }
    }

    #[test]
    fn noise_points_get_minus_one() {
        // an isolated point far from a dense blob, epsilon excludes it
        let dg = LineDistance { positions: vec![0.0, 1.0, 2.0, 100.0] };
        let mut gop = Goptics::new(4, 2, 5.0).unwrap();
        gop.run(&dg).unwrap();
        gop.assign(3.0);
        assert_eq!(gop.n_clusters, 1);
        assert_eq!(gop.cluster[3], -1);
        assert_eq!(&gop.cluster[..3], &[0, 0, 0]);
    }

    #[test]
    fn min_points_bounds_are_enforced() {
        assert!(Goptics::new(4, 0, 1.0).is_err());
        assert!(Goptics::new(4, 5, 1.0).is_err());
        assert!(Goptics::new(4, 4, 1.0).is_ok());
        assert!(Goptics::new(4, 2, 0.0).is_err());
    }

    #[test]
    fn min_points_one_makes_every_point_core_at_zero() {
        // with min_points = 1 a point is core by itself: no neighbour is
        // consulted for the core distance
        let dg = two_blobs();
        let mut gop = Goptics::new(6, 1, 5.0).unwrap();
        gop.run(&dg).unwrap();
        for j in 0..6 {
            assert_eq!(gop.core_distance[j], 0.0);
            assert!(gop.core[j]);
        }
        gop.assign(3.0);
        assert_eq!(gop.n_clusters, 2);
        assert_eq!(&gop.cluster[..3], &[0, 0, 0]);
        assert_eq!(&gop.cluster[3..], &[1, 1, 1]);

        // an isolated point stays core and seeds its own cluster
        let lone = LineDistance { positions: vec![0.0, 1.0, 50.0] };
        let mut gop = Goptics::new(3, 1, 5.0).unwrap();
        gop.run(&lone).unwrap();
        gop.assign(3.0);
        assert_eq!(gop.n_clusters, 2);
        assert_eq!(gop.cluster[2], 1);
    }

    #[test]
    fn higher_min_points_raises_core_distances() {
        let dg = two_blobs();
        let mut loose = Goptics::new(6, 2, 5.0).unwrap();
        loose.run(&dg).unwrap();
        let mut strict = Goptics::new(6, 3, 5.0).unwrap();
        strict.run(&dg).unwrap();
        for j in 0..6 {
            assert!(strict.core_distance[j] >= loose.core_distance[j]);
        }
    }

    #[test]
    fn cluster_eps_is_clipped_below_epsilon() {
        let dg = two_blobs();
        let mut gop = Goptics::new(6, 2, 5.0).unwrap();
        gop.run(&dg).unwrap();
        // far above epsilon: clipped to 0.999·epsilon, still two clusters
        gop.assign(1.0e9);
        assert_eq!(gop.n_clusters, 2);
    }

    #[test]
    fn cached_distance_computes_each_pair_once() {
        let calls = Mutex::new(0usize);
        let dg = CachedDistance::new(4, 2, |i, j, out| {
            *calls.lock().unwrap() += 1;
            out[0] = (j - i) as f64;
            out[1] = 10.0 * (j - i) as f64;
        })
        .unwrap();
        for _ in 0..3 {
            for i in 0..4 {
                for j in 0..4 {
                    let d = dg.get(i, j);
                    assert_eq!(d, (i as f64 - j as f64).abs());
                }
            }
        }
        assert_eq!(*calls.lock().unwrap(), 6); // one call per unordered pair

        let mut dg = dg;
        dg.set_which_distance(1).unwrap();
        assert_eq!(dg.get(2, 0), 20.0);
        assert!(dg.set_which_distance(2).is_err());
    }

    #[test]
    fn optics_over_a_cached_generator() {
        let positions: [f64; 6] = [0.0, 1.0, 2.0, 10.0, 11.0, 12.0];
        let dg = CachedDistance::new(6, 1, move |i, j, out| {
            out[0] = (positions[i] - positions[j]).abs();
        })
        .unwrap();
        let mut gop = Goptics::new(6, 2, 5.0).unwrap();
        gop.run_parallel(&dg).unwrap();
        gop.assign(3.0);
        assert_eq!(gop.n_clusters, 2);
    }
}
