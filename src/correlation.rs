//! The correlation engine: orchestrates the pixel and pair sweeps.
//!
//! Small angular scales are counted pair-by-pair through a [`PointIndex`];
//! large scales go through [`ScalarField`] overdensity products, measured
//! once per resolution on successively coarser aggregates. Random catalogs
//! drawn from the footprint normalize the pair counts, and footprint
//! regionation turns every accumulator into a set of jack-knife samples.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::bins::Binning;
use crate::catalog::SkyPoint;
use crate::error::Result;
use crate::footprint::Footprint;
use crate::healpix::RESOLUTION_MIN;
use crate::scalar_field::{FieldKind, SampleOptions, ScalarField};
use crate::tree::{PointIndex, DEFAULT_NODE_CAPACITY};

/// Angular correlation estimator over a binning scheme.
///
/// The engine owns the bins and a seedable random generator; footprints and
/// catalogs are borrowed per call. Results accumulate in the bins and are
/// read back through [`Self::binning`] or the output writers.
pub struct CorrelationEngine {
    binning: Binning,
    rng: StdRng,
    min_unmasked_fraction: f64,
    tree_capacity: usize,
    regionation_resolution: u32,
    n_region: u16,
}

impl CorrelationEngine {
    pub fn new(binning: Binning) -> Self {
        CorrelationEngine {
            binning,
            rng: StdRng::from_entropy(),
            min_unmasked_fraction: 1.0e-7,
            tree_capacity: DEFAULT_NODE_CAPACITY,
            regionation_resolution: 0,
            n_region: 0,
        }
    }

    /// Seed the random-catalog generator for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_tree_capacity(mut self, capacity: usize) -> Self {
        self.tree_capacity = capacity.max(1);
        self
    }

    pub fn binning(&self) -> &Binning {
        &self.binning
    }

    pub fn binning_mut(&mut self) -> &mut Binning {
        &mut self.binning
    }

    pub fn n_region(&self) -> u16 {
        self.n_region
    }

    fn sample_options(&self, use_weighted_randoms: bool) -> SampleOptions {
        SampleOptions {
            min_unmasked_fraction: self.min_unmasked_fraction,
            intensity_from_footprint: false,
            weight_from_footprint: use_weighted_randoms,
        }
    }

    /// Whether this call should run the region-aware kernels.
    fn regions_active(&self, footprint: &Footprint) -> bool {
        footprint.region_count() > 0 && self.binning.n_region() == footprint.region_count()
    }

    // -----------------------------------------------------------------------
    // Top-level operations
    // -----------------------------------------------------------------------

    /// Auto-correlation of one catalog over one footprint.
    pub fn auto_correlate(
        &mut self,
        footprint: &Footprint,
        catalog: &[SkyPoint],
        random_iterations: u32,
        use_weighted_randoms: bool,
    ) -> Result<()> {
        if !self.binning.manual_break() {
            self.binning
                .auto_max_resolution(catalog.len(), footprint.area());
        }
        if !self.binning.pixel_range().is_empty() {
            self.find_pixel_auto_correlation(footprint, catalog, use_weighted_randoms)?;
        }
        if !self.binning.pair_range().is_empty() {
            self.find_pair_auto_correlation(
                footprint,
                catalog,
                random_iterations,
                use_weighted_randoms,
            )?;
        }
        Ok(())
    }

    /// Cross-correlation of two catalogs over their footprints.
    pub fn cross_correlate(
        &mut self,
        footprint_a: &Footprint,
        footprint_b: &Footprint,
        catalog_a: &[SkyPoint],
        catalog_b: &[SkyPoint],
        random_iterations: u32,
        use_weighted_randoms: bool,
    ) -> Result<()> {
        if !self.binning.manual_break() {
            let n_eff = ((catalog_a.len() as f64) * (catalog_b.len() as f64)).sqrt() as usize;
            let area = footprint_a.area().min(footprint_b.area());
            self.binning.auto_max_resolution(n_eff, area);
        }
        if !self.binning.pixel_range().is_empty() {
            self.find_pixel_cross_correlation(
                footprint_a,
                footprint_b,
                catalog_a,
                catalog_b,
                use_weighted_randoms,
            )?;
        }
        if !self.binning.pair_range().is_empty() {
            self.find_pair_cross_correlation(
                footprint_a,
                footprint_b,
                catalog_a,
                catalog_b,
                random_iterations,
                use_weighted_randoms,
            )?;
        }
        Ok(())
    }

    /// Auto-correlation with jack-knife regionation. Requests `n_regions`
    /// sub-areas (0 picks twice the bin count); the footprint's achieved
    /// split is adopted.
    pub fn auto_correlate_with_regions(
        &mut self,
        footprint: &mut Footprint,
        catalog: &[SkyPoint],
        random_iterations: u32,
        n_regions: u16,
        use_weighted_randoms: bool,
    ) -> Result<()> {
        if !self.binning.manual_break() {
            self.binning
                .auto_max_resolution(catalog.len(), footprint.area());
        }
        self.setup_regions(footprint, n_regions);

        if !self.binning.pixel_range().is_empty() {
            self.find_pixel_auto_correlation(footprint, catalog, use_weighted_randoms)?;
        }
        if !self.binning.pair_range().is_empty() {
            self.find_pair_auto_correlation(
                footprint,
                catalog,
                random_iterations,
                use_weighted_randoms,
            )?;
        }
        Ok(())
    }

    /// Cross-correlation with jack-knife regionation, on footprint A's split.
    pub fn cross_correlate_with_regions(
        &mut self,
        footprint_a: &mut Footprint,
        footprint_b: &Footprint,
        catalog_a: &[SkyPoint],
        catalog_b: &[SkyPoint],
        random_iterations: u32,
        n_regions: u16,
        use_weighted_randoms: bool,
    ) -> Result<()> {
        if !self.binning.manual_break() {
            let n_eff = ((catalog_a.len() as f64) * (catalog_b.len() as f64)).sqrt() as usize;
            let area = footprint_a.area().min(footprint_b.area());
            self.binning.auto_max_resolution(n_eff, area);
        }
        self.setup_regions(footprint_a, n_regions);

        if !self.binning.pixel_range().is_empty() {
            self.find_pixel_cross_correlation(
                footprint_a,
                footprint_b,
                catalog_a,
                catalog_b,
                use_weighted_randoms,
            )?;
        }
        if !self.binning.pair_range().is_empty() {
            self.find_pair_cross_correlation(
                footprint_a,
                footprint_b,
                catalog_a,
                catalog_b,
                random_iterations,
                use_weighted_randoms,
            )?;
        }
        Ok(())
    }

    fn setup_regions(&mut self, footprint: &mut Footprint, n_regions: u16) {
        let requested = if n_regions == 0 {
            (2 * self.binning.n_bins()).min(u16::MAX as usize) as u16
        } else {
            n_regions
        };
        info!(requested, "regionating for jack-knife errors");

        let achieved = if footprint.region_count() > 0 {
            footprint.region_count()
        } else {
            footprint.initialize_regions(requested)
        };
        if achieved != requested {
            warn!(requested, achieved, "adopting the footprint's region count");
        }

        self.regionation_resolution = footprint.region_resolution();
        self.n_region = achieved;
        self.binning.initialize_regions(achieved);

        if !self.binning.pixel_range().is_empty() {
            if self.regionation_resolution > self.binning.max_resolution() {
                warn!(
                    regionation = self.regionation_resolution,
                    max_resolution = self.binning.max_resolution(),
                    "regionation finer than the pixel estimator allows; \
                     falling back to pair counts for every bin"
                );
                self.binning.use_only_pairs();
            } else if self.regionation_resolution > self.binning.min_resolution() {
                self.binning.set_min_resolution(self.regionation_resolution);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Pixel sweep
    // -----------------------------------------------------------------------

    /// Run only the pixel estimator for the auto-correlation.
    pub fn find_pixel_auto_correlation(
        &mut self,
        footprint: &Footprint,
        catalog: &[SkyPoint],
        use_weighted_randoms: bool,
    ) -> Result<()> {
        let resolution = self.binning.max_resolution();
        if resolution == 0 {
            return Ok(());
        }
        info!(resolution, "sampling density field from the footprint");

        let with_regions = self.regions_active(footprint);
        let options = self.sample_options(use_weighted_randoms);
        let mut field =
            ScalarField::from_footprint(footprint, resolution, FieldKind::Density, &options);
        if with_regions {
            field.init_regions(footprint)?;
        }

        self.fill_field(&mut field, footprint, catalog);
        self.pixel_sweep_auto(&mut field, footprint, with_regions)
    }

    fn fill_field(&self, field: &mut ScalarField, footprint: &Footprint, catalog: &[SkyPoint]) {
        let mut outside = 0usize;
        let mut unplaced = 0usize;
        for p in catalog {
            if footprint.contains(p) {
                if !field.add_point(p) {
                    unplaced += 1;
                }
            } else {
                outside += 1;
            }
        }
        if outside > 0 {
            warn!(
                outside,
                total = catalog.len(),
                "catalog points fall outside the footprint"
            );
        }
        if unplaced > 0 {
            warn!(
                unplaced,
                total = catalog.len() - outside,
                "filtered points failed to land in a field pixel"
            );
        }
    }

    fn pixel_sweep_auto(
        &mut self,
        field: &mut ScalarField,
        footprint: &Footprint,
        with_regions: bool,
    ) -> Result<()> {
        let min_resolution = self.binning.min_resolution();

        let bins = self.binning.bins_at_resolution_mut(field.resolution());
        if with_regions {
            field.auto_correlate_bins_with_regions(bins)?;
        } else {
            field.auto_correlate_bins(bins)?;
        }

        let mut resolution = field.resolution() / 2;
        while resolution >= min_resolution.max(RESOLUTION_MIN) {
            let range = self.binning.resolution_range(resolution);
            if !range.is_empty() {
                info!(resolution, "correlating aggregated field");
                let mut coarse = ScalarField::aggregate(field, resolution)?;
                let bins = &mut self.binning.bins_mut()[range];
                if with_regions {
                    coarse.init_regions(footprint)?;
                    coarse.auto_correlate_bins_with_regions(bins)?;
                } else {
                    coarse.auto_correlate_bins(bins)?;
                }
            }
            resolution /= 2;
        }
        Ok(())
    }

    /// Run only the pixel estimator for the cross-correlation.
    pub fn find_pixel_cross_correlation(
        &mut self,
        footprint_a: &Footprint,
        footprint_b: &Footprint,
        catalog_a: &[SkyPoint],
        catalog_b: &[SkyPoint],
        use_weighted_randoms: bool,
    ) -> Result<()> {
        let resolution = self.binning.max_resolution();
        if resolution == 0 {
            return Ok(());
        }
        info!(resolution, "sampling density fields from both footprints");

        let with_regions = self.regions_active(footprint_a);
        let options = self.sample_options(use_weighted_randoms);
        let mut field_a =
            ScalarField::from_footprint(footprint_a, resolution, FieldKind::Density, &options);
        let mut field_b =
            ScalarField::from_footprint(footprint_b, resolution, FieldKind::Density, &options);
        if with_regions {
            field_a.init_regions(footprint_a)?;
        }

        self.fill_field(&mut field_a, footprint_a, catalog_a);
        self.fill_field(&mut field_b, footprint_b, catalog_b);

        let min_resolution = self.binning.min_resolution();

        let bins = self.binning.bins_at_resolution_mut(resolution);
        if with_regions {
            field_a.cross_correlate_bins_with_regions(&mut field_b, bins)?;
        } else {
            field_a.cross_correlate_bins(&mut field_b, bins)?;
        }

        let mut coarse_resolution = resolution / 2;
        while coarse_resolution >= min_resolution.max(RESOLUTION_MIN) {
            let range = self.binning.resolution_range(coarse_resolution);
            if !range.is_empty() {
                info!(resolution = coarse_resolution, "cross-correlating aggregated fields");
                let mut coarse_a = ScalarField::aggregate(&field_a, coarse_resolution)?;
                let mut coarse_b = ScalarField::aggregate(&field_b, coarse_resolution)?;
                let bins = &mut self.binning.bins_mut()[range];
                if with_regions {
                    coarse_a.init_regions(footprint_a)?;
                    coarse_a.cross_correlate_bins_with_regions(&mut coarse_b, bins)?;
                } else {
                    coarse_a.cross_correlate_bins(&mut coarse_b, bins)?;
                }
            }
            coarse_resolution /= 2;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pair sweep
    // -----------------------------------------------------------------------

    fn tree_resolution(&self) -> u32 {
        self.binning
            .min_resolution()
            .max(self.regionation_resolution)
            .max(RESOLUTION_MIN)
    }

    fn build_index(
        &self,
        footprint: &Footprint,
        catalog: &[SkyPoint],
        with_regions: bool,
    ) -> Result<(PointIndex, usize)> {
        let mut index = PointIndex::new(self.tree_resolution(), self.tree_capacity);
        let mut outside = 0usize;
        let mut failed = 0usize;
        for p in catalog {
            if footprint.contains(p) {
                if !index.add_point(p) {
                    failed += 1;
                }
            } else {
                outside += 1;
            }
        }
        info!(
            indexed = index.n_points(),
            outside,
            failed,
            total = catalog.len(),
            "built point index"
        );
        if with_regions {
            index.initialize_regions(footprint)?;
        }
        Ok((index, outside + failed))
    }

    /// Run only the pair estimator for the auto-correlation.
    pub fn find_pair_auto_correlation(
        &mut self,
        footprint: &Footprint,
        catalog: &[SkyPoint],
        random_iterations: u32,
        use_weighted_randoms: bool,
    ) -> Result<()> {
        let with_regions = self.regions_active(footprint);

        // Galaxy-galaxy
        {
            let (index, _) = self.build_index(footprint, catalog, with_regions)?;
            for bin in self.binning.pair_bins_mut() {
                if with_regions {
                    index.find_weighted_pairs_with_regions(catalog, bin)?;
                } else {
                    index.find_weighted_pairs(catalog, bin);
                }
                bin.move_weight_to_gal_gal();
            }
        }

        for bin in self.binning.pair_bins_mut() {
            bin.reset_gal_rand();
            bin.reset_rand_gal();
            bin.reset_rand_rand();
        }

        for iteration in 0..random_iterations {
            info!(iteration, "random catalog iteration");
            let randoms = footprint.generate_random_points(
                catalog.len(),
                use_weighted_randoms,
                &mut self.rng,
            );
            let (index, _) = self.build_index(footprint, &randoms, with_regions)?;

            // Galaxy-random; the symmetric sum also serves as random-galaxy.
            for bin in self.binning.pair_bins_mut() {
                if with_regions {
                    index.find_weighted_pairs_with_regions(catalog, bin)?;
                } else {
                    index.find_weighted_pairs(catalog, bin);
                }
                bin.move_weight_to_gal_rand(true);
            }

            // Random-random
            for bin in self.binning.pair_bins_mut() {
                if with_regions {
                    index.find_weighted_pairs_with_regions(&randoms, bin)?;
                } else {
                    index.find_weighted_pairs(&randoms, bin);
                }
                bin.move_weight_to_rand_rand();
            }
        }

        self.finish_random_counts(random_iterations);
        Ok(())
    }

    /// Run only the pair estimator for the cross-correlation.
    pub fn find_pair_cross_correlation(
        &mut self,
        footprint_a: &Footprint,
        footprint_b: &Footprint,
        catalog_a: &[SkyPoint],
        catalog_b: &[SkyPoint],
        random_iterations: u32,
        use_weighted_randoms: bool,
    ) -> Result<()> {
        let with_regions = self.regions_active(footprint_a);

        let (index_a, _) = self.build_index(footprint_a, catalog_a, with_regions)?;
        for bin in self.binning.pair_bins_mut() {
            if with_regions {
                index_a.find_weighted_pairs_with_regions(catalog_b, bin)?;
            } else {
                index_a.find_weighted_pairs(catalog_b, bin);
            }
            bin.move_weight_to_gal_gal();
        }

        for bin in self.binning.pair_bins_mut() {
            bin.reset_gal_rand();
            bin.reset_rand_gal();
            bin.reset_rand_rand();
        }

        for iteration in 0..random_iterations {
            info!(iteration, "random catalog iteration");
            let randoms_a = footprint_a.generate_random_points(
                catalog_a.len(),
                use_weighted_randoms,
                &mut self.rng,
            );
            let randoms_b = footprint_b.generate_random_points(
                catalog_b.len(),
                use_weighted_randoms,
                &mut self.rng,
            );

            // Galaxy-random
            for bin in self.binning.pair_bins_mut() {
                if with_regions {
                    index_a.find_weighted_pairs_with_regions(&randoms_b, bin)?;
                } else {
                    index_a.find_weighted_pairs(&randoms_b, bin);
                }
                bin.move_weight_to_gal_rand(false);
            }

            let (random_index, _) = self.build_index(footprint_a, &randoms_a, with_regions)?;

            // Random-galaxy
            for bin in self.binning.pair_bins_mut() {
                if with_regions {
                    random_index.find_weighted_pairs_with_regions(catalog_b, bin)?;
                } else {
                    random_index.find_weighted_pairs(catalog_b, bin);
                }
                bin.move_weight_to_rand_gal();
            }

            // Random-random
            for bin in self.binning.pair_bins_mut() {
                if with_regions {
                    random_index.find_weighted_pairs_with_regions(&randoms_b, bin)?;
                } else {
                    random_index.find_weighted_pairs(&randoms_b, bin);
                }
                bin.move_weight_to_rand_rand();
            }
        }

        self.finish_random_counts(random_iterations);
        Ok(())
    }

    /// Normalize the random counts to one iteration and flag degenerate bins.
    fn finish_random_counts(&mut self, random_iterations: u32) {
        if random_iterations > 0 {
            let k = random_iterations as f64;
            for bin in self.binning.pair_bins_mut() {
                bin.rescale_gal_rand(k);
                bin.rescale_rand_gal(k);
                bin.rescale_rand_rand(k);
            }
        }
        for i in self.binning.pair_range() {
            let bin = &self.binning.bins()[i];
            if bin.rand_rand() == 0.0 {
                warn!(
                    theta = bin.theta(),
                    "empty random-random count; w(theta) is undefined for this bin"
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Covariance
    // -----------------------------------------------------------------------

    /// Jack-knife covariance matrix over the bins.
    ///
    /// With N regions, cov(a, b) = (N-1)²/N² · Σ_k (w_k(a) - w̄(a)) ·
    /// (w_k(b) - w̄(b)) over the leave-one-out estimates. Without a common
    /// regionation only the diagonal is populated, with each bin's Poisson
    /// variance.
    pub fn covariance(&self) -> Array2<f64> {
        let bins = self.binning.bins();
        let n = bins.len();
        let mut cov = Array2::zeros((n, n));

        for a in 0..n {
            for b in 0..n {
                let bin_a = &bins[a];
                let bin_b = &bins[b];
                cov[[a, b]] = if bin_a.n_region() > 0 && bin_a.n_region() == bin_b.n_region() {
                    let n_region = bin_a.n_region();
                    let nr = n_region as f64;
                    let mean_a = bin_a.mean_wtheta();
                    let mean_b = bin_b.mean_wtheta();
                    let sum: f64 = (0..n_region)
                        .map(|k| (bin_a.wtheta_region(k) - mean_a) * (bin_b.wtheta_region(k) - mean_b))
                        .sum();
                    (nr - 1.0) * (nr - 1.0) / (nr * nr) * sum
                } else if a == b {
                    bin_a.poisson_variance()
                } else {
                    0.0
                };
            }
        }
        cov
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bins::Binning;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn disk() -> Footprint {
        Footprint::disk(60.0, 0.0, 3.0, 128)
    }

    fn uniform_catalog(footprint: &Footprint, n: usize, seed: u64) -> Vec<SkyPoint> {
        let mut rng = StdRng::seed_from_u64(seed);
        footprint.generate_random_points(n, false, &mut rng)
    }

    fn test_binning() -> Binning {
        Binning::log_spaced(0.05, 5.0, 4.0).unwrap()
    }

    #[test]
    fn uniform_catalog_is_unclustered() {
        let footprint = disk();
        let catalog = uniform_catalog(&footprint, 5000, 21);

        let mut engine = CorrelationEngine::new(test_binning()).with_seed(42);
        engine.auto_correlate(&footprint, &catalog, 1, false).unwrap();

        let mut pair_bins = 0;
        let mut pixel_bins = 0;
        for bin in engine.binning().bins() {
            if bin.resolution() == 0 {
                pair_bins += 1;
                assert!(bin.gal_gal() > 0.0 || bin.theta_max() < 0.1);
                if bin.rand_rand() > 0.0 && bin.gal_gal() > 0.0 {
                    let band = (5.0 / bin.gal_gal().sqrt()).max(0.1);
                    assert!(
                        bin.wtheta().abs() < band,
                        "pair bin at {} deg: w = {} exceeds {band}",
                        bin.theta(),
                        bin.wtheta()
                    );
                }
            } else {
                pixel_bins += 1;
                assert!(bin.pixel_weight() > 0.0, "pixel bin at {} empty", bin.theta());
                let band = (5.0 * bin.poisson_variance().sqrt()).max(0.1);
                assert!(
                    bin.wtheta().abs() < band,
                    "pixel bin at {} deg: w = {} exceeds {band}",
                    bin.theta(),
                    bin.wtheta()
                );
            }
        }
        assert!(pair_bins > 0, "no pair bins were exercised");
        assert!(pixel_bins > 0, "no pixel bins were exercised");
    }

    #[test]
    fn injected_cluster_shows_up_at_small_scales() {
        let footprint = disk();
        let mut catalog = uniform_catalog(&footprint, 2000, 22);
        // Pile extra points into a 0.1 degree cap at the center.
        let mut rng = StdRng::seed_from_u64(23);
        let clump = Footprint::disk(60.0, 0.0, 0.1, 2048);
        catalog.extend(clump.generate_random_points(600, false, &mut rng));

        let mut engine = CorrelationEngine::new(test_binning()).with_seed(43);
        engine.auto_correlate(&footprint, &catalog, 1, false).unwrap();

        let mut saw_clustered_bin = false;
        for bin in engine.binning().bins() {
            if bin.theta_max() <= 0.15 && bin.rand_rand() > 0.0 {
                assert!(
                    bin.wtheta() > 1.0,
                    "clustered bin at {} deg reported w = {}",
                    bin.theta(),
                    bin.wtheta()
                );
                saw_clustered_bin = true;
            }
            if bin.theta_min() >= 1.0 && !bin.wtheta().is_nan() {
                assert!(
                    bin.wtheta().abs() < 0.5,
                    "large-scale bin at {} deg contaminated: w = {}",
                    bin.theta(),
                    bin.wtheta()
                );
            }
        }
        assert!(saw_clustered_bin);
    }

    #[test]
    fn regionated_run_populates_jackknife() {
        let mut footprint = disk();
        let catalog = uniform_catalog(&footprint, 3000, 24);

        let mut engine = CorrelationEngine::new(test_binning()).with_seed(44);
        engine
            .auto_correlate_with_regions(&mut footprint, &catalog, 2, 10, false)
            .unwrap();

        assert_eq!(engine.n_region(), 10);
        for bin in engine.binning().bins() {
            assert_eq!(bin.n_region(), 10);
            assert!(bin.mean_wtheta().is_finite());
            assert!(bin.mean_wtheta_error().is_finite());
        }

        let cov = engine.covariance();
        let n = engine.binning().n_bins();
        assert_eq!(cov.shape(), &[n, n]);
        for a in 0..n {
            assert!(cov[[a, a]] >= 0.0);
            for b in 0..n {
                assert!(
                    (cov[[a, b]] - cov[[b, a]]).abs() < 1e-12,
                    "covariance not symmetric at ({a}, {b})"
                );
            }
        }
    }

    #[test]
    fn covariance_defaults_to_poisson_diagonal() {
        let footprint = disk();
        let catalog = uniform_catalog(&footprint, 2000, 25);

        let mut engine = CorrelationEngine::new(test_binning()).with_seed(45);
        engine.auto_correlate(&footprint, &catalog, 1, false).unwrap();

        let cov = engine.covariance();
        let n = engine.binning().n_bins();
        for a in 0..n {
            for b in 0..n {
                if a == b {
                    let expected = engine.binning().bins()[a].poisson_variance();
                    if expected.is_nan() {
                        assert!(cov[[a, a]].is_nan());
                    } else {
                        assert!((cov[[a, a]] - expected).abs() < 1e-12);
                    }
                } else {
                    assert_eq!(cov[[a, b]], 0.0);
                }
            }
        }
    }

    #[test]
    fn cross_of_independent_catalogs_is_flat() {
        let footprint = disk();
        let catalog_a = uniform_catalog(&footprint, 2500, 26);
        let catalog_b = uniform_catalog(&footprint, 2500, 27);

        let mut engine = CorrelationEngine::new(test_binning()).with_seed(46);
        engine
            .cross_correlate(&footprint, &footprint, &catalog_a, &catalog_b, 1, false)
            .unwrap();

        for bin in engine.binning().bins() {
            if bin.wtheta().is_nan() {
                continue;
            }
            let band = if bin.resolution() == 0 {
                (5.0 / bin.gal_gal().max(1.0).sqrt()).max(0.15)
            } else {
                (5.0 * bin.poisson_variance().sqrt()).max(0.15)
            };
            assert!(
                bin.wtheta().abs() < band,
                "cross bin at {} deg: w = {} exceeds {band}",
                bin.theta(),
                bin.wtheta()
            );
        }
    }

    #[test]
    fn pair_only_mode_skips_the_pixel_sweep() {
        let footprint = disk();
        let catalog = uniform_catalog(&footprint, 1500, 28);

        let mut binning = Binning::log_spaced(0.1, 2.0, 4.0).unwrap();
        binning.assign_resolutions();
        binning.use_only_pairs();

        let mut engine = CorrelationEngine::new(binning).with_seed(47);
        engine.auto_correlate(&footprint, &catalog, 1, false).unwrap();

        for bin in engine.binning().bins() {
            assert_eq!(bin.resolution(), 0);
            assert_eq!(bin.pixel_weight(), 0.0);
            assert!(bin.gal_gal() > 0.0);
            assert!(bin.rand_rand() > 0.0);
        }
        assert!(engine.binning().pixel_range().is_empty());
    }

    #[test]
    fn zero_random_iterations_leave_sentinel() {
        let footprint = disk();
        let catalog = uniform_catalog(&footprint, 800, 29);

        let mut binning = Binning::log_spaced(0.1, 2.0, 4.0).unwrap();
        binning.use_only_pairs();
        let mut engine = CorrelationEngine::new(binning).with_seed(48);
        engine.auto_correlate(&footprint, &catalog, 0, false).unwrap();

        for bin in engine.binning().bins() {
            assert!(bin.gal_gal() > 0.0);
            assert_eq!(bin.rand_rand(), 0.0);
            assert!(bin.wtheta().is_nan());
        }
    }
}
