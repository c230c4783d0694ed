//! Hierarchical point index for pair counting.
//!
//! Points are bucketed into tessellation cells; a cell over capacity splits
//! into its four children. Each node caches its total weight, so an annulus
//! query can prune nodes entirely outside the bounds and absorb nodes
//! entirely inside without visiting individual points. Only the boundary
//! shell descends to exact per-point tests.

use std::collections::HashMap;

use tracing::debug;

use crate::bins::AngularBin;
use crate::catalog::SkyPoint;
use crate::error::{Error, Result};
use crate::footprint::{Footprint, Regionation};
use crate::geom::sphere::{angular_distance, sin2_angular_separation};
use crate::healpix::{Pixel, RESOLUTION_MAX};

/// Bucket size a node tolerates before splitting.
pub const DEFAULT_NODE_CAPACITY: usize = 200;

struct TreeNode {
    pixel: Pixel,
    center: [f64; 3],
    bounding_radius: f64,
    /// Total point weight in the subtree.
    weight: f64,
    count: u32,
    /// Non-empty once the node has split; at most four.
    children: Vec<TreeNode>,
    /// Leaf bucket; drained into children on split.
    points: Vec<SkyPoint>,
}

impl TreeNode {
    fn new(pixel: Pixel) -> Self {
        TreeNode {
            pixel,
            center: pixel.center(),
            bounding_radius: pixel.bounding_radius(),
            weight: 0.0,
            count: 0,
            children: Vec::new(),
            points: Vec::new(),
        }
    }

    fn insert(&mut self, point: SkyPoint, capacity: usize) {
        self.weight += point.weight;
        self.count += 1;

        if !self.children.is_empty() {
            self.child_for(&point).insert(point, capacity);
            return;
        }

        self.points.push(point);
        if self.points.len() > capacity && self.pixel.resolution < RESOLUTION_MAX {
            let points = std::mem::take(&mut self.points);
            for p in points {
                let child = self.child_for(&p);
                child.insert(p, capacity);
            }
        }
    }

    fn child_for(&mut self, point: &SkyPoint) -> &mut TreeNode {
        let child_pix = Pixel::from_point(point.unit, self.pixel.resolution * 2);
        if let Some(i) = self.children.iter().position(|c| c.pixel.id == child_pix.id) {
            return &mut self.children[i];
        }
        self.children.push(TreeNode::new(child_pix));
        self.children.last_mut().unwrap()
    }

    /// Accumulate weighted pairs between `point` and the subtree's points
    /// whose separation lies in [theta_min, theta_max) radians.
    fn accumulate_pairs(
        &self,
        point: &SkyPoint,
        theta_min: f64,
        theta_max: f64,
        bin: &mut AngularBin,
        region_a: Option<u16>,
        region_b: Option<u16>,
    ) {
        let d = angular_distance(point.unit, self.center);
        let min_sep = (d - self.bounding_radius).max(0.0);
        let max_sep = d + self.bounding_radius;

        if min_sep >= theta_max || max_sep < theta_min {
            return;
        }
        if min_sep >= theta_min && max_sep < theta_max {
            // Node fully inside the annulus: take its weight wholesale.
            bin.add_to_weight(point.weight * self.weight, region_a, region_b);
            return;
        }

        if !self.children.is_empty() {
            for child in &self.children {
                child.accumulate_pairs(point, theta_min, theta_max, bin, region_a, region_b);
            }
        } else {
            for q in &self.points {
                // sin² folds separations beyond 90° back into range; bins
                // never extend past 90°, so the far hemisphere is excluded
                // via the dot product.
                let dot = point.unit[0] * q.unit[0]
                    + point.unit[1] * q.unit[1]
                    + point.unit[2] * q.unit[2];
                if dot < 0.0 {
                    continue;
                }
                let s2 = sin2_angular_separation(point.unit, q.unit);
                if bin.within_sin2_bounds(s2) {
                    bin.add_to_weight(point.weight * q.weight, region_a, region_b);
                }
            }
        }
    }
}

/// Weighted points indexed for annulus pair queries.
///
/// Root cells sit at the index resolution; insertion is online. Queries
/// accumulate into an [`AngularBin`]'s scratch weight, which the caller
/// drains with the bin's `move_weight_to_*` methods.
pub struct PointIndex {
    resolution: u32,
    capacity: usize,
    roots: HashMap<u64, TreeNode>,
    n_points: usize,
    total_weight: f64,
    regions: Option<Regionation>,
}

impl PointIndex {
    pub fn new(resolution: u32, capacity: usize) -> Self {
        PointIndex {
            resolution,
            capacity: capacity.max(1),
            roots: HashMap::new(),
            n_points: 0,
            total_weight: 0.0,
            regions: None,
        }
    }

    /// Index an entire catalog, reporting the number of rejected points.
    pub fn build(resolution: u32, capacity: usize, catalog: &[SkyPoint]) -> (Self, usize) {
        let mut index = PointIndex::new(resolution, capacity);
        let mut rejected = 0;
        for p in catalog {
            if !index.add_point(p) {
                rejected += 1;
            }
        }
        if rejected > 0 {
            debug!(rejected, total = catalog.len(), "points rejected by the index");
        }
        (index, rejected)
    }

    /// Insert one point. Returns false for unusable coordinates.
    pub fn add_point(&mut self, point: &SkyPoint) -> bool {
        if !point.unit.iter().all(|c| c.is_finite()) || !point.weight.is_finite() {
            return false;
        }
        let root_pix = Pixel::from_point(point.unit, self.resolution);
        let node = self
            .roots
            .entry(root_pix.id)
            .or_insert_with(|| TreeNode::new(root_pix));
        node.insert(*point, self.capacity);
        self.n_points += 1;
        self.total_weight += point.weight;
        true
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn n_points(&self) -> usize {
        self.n_points
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn is_empty(&self) -> bool {
        self.n_points == 0
    }

    /// Adopt the footprint's regionation for region-aware queries. The
    /// index resolution must not be coarser than the regionation, so that
    /// every node lies in exactly one region.
    pub fn initialize_regions(&mut self, footprint: &Footprint) -> Result<()> {
        let Some(regionation) = footprint.regionation() else {
            return Err(Error::RegionInit("footprint has no regions".into()));
        };
        if self.resolution < regionation.resolution() {
            return Err(Error::RegionInit(format!(
                "index resolution {} is coarser than the regionation at {}",
                self.resolution,
                regionation.resolution()
            )));
        }
        self.regions = Some(regionation.clone());
        Ok(())
    }

    pub fn n_region(&self) -> u16 {
        self.regions.as_ref().map_or(0, |r| r.n_region())
    }

    /// Sum w_p · w_q over every catalog point p and indexed point q whose
    /// separation falls inside the bin, into the bin's scratch weight.
    pub fn find_weighted_pairs(&self, catalog: &[SkyPoint], bin: &mut AngularBin) {
        self.pairs_impl(catalog, bin, None);
    }

    /// Region-aware variant: every contribution is tagged with the regions
    /// of its two members so the bin's leave-one-out tallies stay exact.
    pub fn find_weighted_pairs_with_regions(
        &self,
        catalog: &[SkyPoint],
        bin: &mut AngularBin,
    ) -> Result<()> {
        if self.regions.is_none() {
            return Err(Error::RegionInit("point index has no regions".into()));
        }
        self.pairs_impl(catalog, bin, self.regions.as_ref());
        Ok(())
    }

    fn pairs_impl(
        &self,
        catalog: &[SkyPoint],
        bin: &mut AngularBin,
        regions: Option<&Regionation>,
    ) {
        let theta_min = bin.theta_min().to_radians();
        let theta_max = bin.theta_max().to_radians();

        for point in catalog {
            let region_a = regions.and_then(|r| r.region_of_point(point));
            for root in self.roots.values() {
                let region_b = regions.and_then(|r| r.region_of_pixel(root.pixel));
                root.accumulate_pairs(point, theta_min, theta_max, bin, region_a, region_b);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Random weighted points in a cap around (60°, 0°).
    fn random_catalog(n: usize, seed: u64) -> Vec<SkyPoint> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let ra = 60.0 + rng.gen_range(-3.0..3.0);
                let dec = rng.gen_range(-3.0..3.0);
                SkyPoint::new(ra, dec, rng.gen_range(0.5..2.0))
            })
            .collect()
    }

    fn brute_force_pairs(catalog: &[SkyPoint], tree_points: &[SkyPoint], bin: &AngularBin) -> f64 {
        let mut sum = 0.0;
        for p in catalog {
            for q in tree_points {
                if bin.within_sin2_bounds(sin2_angular_separation(p.unit, q.unit)) {
                    sum += p.weight * q.weight;
                }
            }
        }
        sum
    }

    #[test]
    fn build_accounting() {
        let catalog = random_catalog(500, 1);
        let (index, rejected) = PointIndex::build(16, 50, &catalog);
        assert_eq!(rejected, 0);
        assert_eq!(index.n_points(), 500);
        assert_relative_eq!(
            index.total_weight(),
            catalog.iter().map(|p| p.weight).sum::<f64>(),
            max_relative = 1e-12
        );
    }

    #[test]
    fn non_finite_point_rejected() {
        let mut index = PointIndex::new(16, 10);
        let mut bad = SkyPoint::new(0.0, 0.0, 1.0);
        bad.unit[0] = f64::NAN;
        assert!(!index.add_point(&bad));
        assert!(index.is_empty());
    }

    #[test]
    fn pair_sums_match_brute_force() {
        let catalog = random_catalog(300, 2);
        let others = random_catalog(300, 3);
        // Small capacity forces deep splits.
        let (index, _) = PointIndex::build(8, 8, &catalog);

        for (lo, hi) in [(0.05, 0.2), (0.2, 1.0), (1.0, 3.0), (2.5, 8.0)] {
            let mut bin = AngularBin::new(lo, hi);
            index.find_weighted_pairs(&others, &mut bin);
            bin.move_weight_to_gal_gal();

            let expected = brute_force_pairs(&others, &catalog, &bin);
            assert_relative_eq!(bin.gal_gal(), expected, max_relative = 1e-9);
        }
    }

    #[test]
    fn bulk_and_split_paths_agree() {
        let catalog = random_catalog(400, 4);
        let (deep, _) = PointIndex::build(8, 4, &catalog);
        let (flat, _) = PointIndex::build(8, 10_000, &catalog);

        let mut bin_deep = AngularBin::new(0.3, 2.0);
        let mut bin_flat = AngularBin::new(0.3, 2.0);
        deep.find_weighted_pairs(&catalog, &mut bin_deep);
        flat.find_weighted_pairs(&catalog, &mut bin_flat);
        bin_deep.move_weight_to_gal_gal();
        bin_flat.move_weight_to_gal_gal();

        assert_relative_eq!(bin_deep.gal_gal(), bin_flat.gal_gal(), max_relative = 1e-9);
        assert!(bin_deep.gal_gal() > 0.0);
    }

    #[test]
    fn self_pairs_stay_out_of_offset_bins() {
        let catalog = random_catalog(100, 5);
        let (index, _) = PointIndex::build(8, 20, &catalog);
        let mut bin = AngularBin::new(0.1, 1.0);
        index.find_weighted_pairs(&catalog, &mut bin);
        bin.move_weight_to_gal_gal();
        // Zero-separation self pairs sit below theta_min.
        let expected = brute_force_pairs(&catalog, &catalog, &bin);
        assert_relative_eq!(bin.gal_gal(), expected, max_relative = 1e-9);
    }

    #[test]
    fn region_tallies_match_brute_force() {
        let mut footprint = Footprint::disk(60.0, 0.0, 3.0, 128);
        footprint.initialize_regions(6);
        let mut rng = StdRng::seed_from_u64(6);
        let catalog = footprint.generate_random_points(400, false, &mut rng);

        let tree_resolution = footprint.region_resolution().max(16);
        let (mut index, _) = PointIndex::build(tree_resolution, 16, &catalog);
        index.initialize_regions(&footprint).unwrap();
        assert_eq!(index.n_region(), 6);

        let mut bin = AngularBin::new(0.2, 1.5);
        bin.initialize_regions(6);
        index
            .find_weighted_pairs_with_regions(&catalog, &mut bin)
            .unwrap();
        bin.move_weight_to_gal_gal();

        // Brute force with the same two-member exclusion rule. An indexed
        // point shares its root's region, so region-of-point is the node
        // label seen by the query.
        let mut total = 0.0;
        let mut excl = vec![0.0; 6];
        for p in &catalog {
            let ra = footprint.region_of_point(p);
            for q in &catalog {
                let rb = footprint.region_of_point(q);
                if bin.within_sin2_bounds(sin2_angular_separation(p.unit, q.unit)) {
                    let w = p.weight * q.weight;
                    total += w;
                    for (k, acc) in excl.iter_mut().enumerate() {
                        let k = Some(k as u16);
                        if k != ra && k != rb {
                            *acc += w;
                        }
                    }
                }
            }
        }

        assert_relative_eq!(bin.gal_gal(), total, max_relative = 1e-9);
        for k in 0..6 {
            assert_relative_eq!(
                bin.gal_gal_region(k),
                excl[k as usize],
                max_relative = 1e-9
            );
        }
    }

    #[test]
    fn region_query_without_regions_fails() {
        let catalog = random_catalog(50, 7);
        let (index, _) = PointIndex::build(16, 20, &catalog);
        let mut bin = AngularBin::new(0.1, 1.0);
        assert!(index
            .find_weighted_pairs_with_regions(&catalog, &mut bin)
            .is_err());
    }

    #[test]
    fn regionation_coarser_than_index_fails() {
        let mut footprint = Footprint::disk(60.0, 0.0, 3.0, 128);
        footprint.initialize_regions(6);
        let reg_resolution = footprint.region_resolution();
        assert!(reg_resolution > 4);

        let catalog = random_catalog(50, 8);
        let (mut index, _) = PointIndex::build(4, 20, &catalog);
        assert!(index.initialize_regions(&footprint).is_err());
    }
}
