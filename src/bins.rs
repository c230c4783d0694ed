//! Angular bins and the binning scheme.
//!
//! An [`AngularBin`] is a half-open annulus [θ_min, θ_max) on the sphere
//! holding the pair-count and pixel-product accumulators for one scale. A
//! [`Binning`] is the ordered set of bins spanning the measured range,
//! split at a resolution break: small scales are counted pair-by-pair,
//! large scales through the pixelized field estimator.

use std::ops::Range;

use tracing::info;

use crate::error::{Error, Result};
use crate::healpix::{pixel_diagonal_deg, RESOLUTION_MAX, RESOLUTION_MIN};

/// `a >= b` up to floating-point slack.
fn double_ge(a: f64, b: f64) -> bool {
    a > b || (a - b).abs() < 1.0e-10
}

/// Additive tally with jack-knife leave-one-out accumulators.
///
/// `regions[k]` holds the sum over contributions that touch neither member
/// region k; subtracting nothing further, it IS the leave-one-out sample.
#[derive(Debug, Clone, Default)]
pub struct RegionTally {
    total: f64,
    regions: Vec<f64>,
}

impl RegionTally {
    fn init_regions(&mut self, n: u16) {
        self.total = 0.0;
        self.regions = vec![0.0; n as usize];
    }

    fn drop_regions(&mut self) {
        self.regions.clear();
    }

    /// Add a contribution whose two members lie in regions `a` and `b`
    /// (`None` when regionation is off or a member is unassigned).
    fn add(&mut self, value: f64, a: Option<u16>, b: Option<u16>) {
        self.total += value;
        for (k, acc) in self.regions.iter_mut().enumerate() {
            let k = Some(k as u16);
            if k != a && k != b {
                *acc += value;
            }
        }
    }

    /// Add another tally's contents without clearing it.
    fn absorb(&mut self, other: &RegionTally) {
        self.total += other.total;
        for (acc, v) in self.regions.iter_mut().zip(&other.regions) {
            *acc += v;
        }
    }

    fn reset(&mut self) {
        self.total = 0.0;
        for acc in &mut self.regions {
            *acc = 0.0;
        }
    }

    fn scale(&mut self, factor: f64) {
        self.total *= factor;
        for acc in &mut self.regions {
            *acc *= factor;
        }
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn region(&self, k: u16) -> f64 {
        self.regions[k as usize]
    }
}

/// One annulus [θ_min, θ_max) with its accumulators. Angles in degrees.
#[derive(Debug, Clone)]
pub struct AngularBin {
    theta_min: f64,
    theta_max: f64,
    theta: f64,
    sin2theta_min: f64,
    sin2theta_max: f64,
    /// Pixel resolution the bin is measured at; 0 selects the pair estimator.
    resolution: u32,
    n_region: u16,
    gal_gal: RegionTally,
    gal_rand: RegionTally,
    rand_gal: RegionTally,
    rand_rand: RegionTally,
    pixel_wtheta: RegionTally,
    pixel_weight: RegionTally,
    /// Scratch the pair queries fill; `move_weight_to_*` drains it.
    weight: RegionTally,
}

impl AngularBin {
    /// Bin over [theta_min, theta_max) degrees; the representative angle is
    /// the geometric mean of the edges.
    pub fn new(theta_min: f64, theta_max: f64) -> Self {
        let theta = 10.0_f64.powf(0.5 * (theta_min.log10() + theta_max.log10()));
        AngularBin {
            theta_min,
            theta_max,
            theta,
            sin2theta_min: theta_min.to_radians().sin().powi(2),
            sin2theta_max: theta_max.to_radians().sin().powi(2),
            resolution: 0,
            n_region: 0,
            gal_gal: RegionTally::default(),
            gal_rand: RegionTally::default(),
            rand_gal: RegionTally::default(),
            rand_rand: RegionTally::default(),
            pixel_wtheta: RegionTally::default(),
            pixel_weight: RegionTally::default(),
            weight: RegionTally::default(),
        }
    }

    pub fn theta_min(&self) -> f64 {
        self.theta_min
    }

    pub fn theta_max(&self) -> f64 {
        self.theta_max
    }

    /// Representative angular scale, degrees.
    pub fn theta(&self) -> f64 {
        self.theta
    }

    pub fn set_theta(&mut self, theta: f64) {
        self.theta = theta;
    }

    pub fn sin2_theta_min(&self) -> f64 {
        self.sin2theta_min
    }

    pub fn sin2_theta_max(&self) -> f64 {
        self.sin2theta_max
    }

    pub fn within_sin2_bounds(&self, sin2theta: f64) -> bool {
        sin2theta >= self.sin2theta_min && sin2theta < self.sin2theta_max
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn set_resolution(&mut self, resolution: u32) {
        self.resolution = resolution;
    }

    /// Coarsest resolution whose pixels are strictly smaller than the inner
    /// edge of the bin, so that adjacent-pixel neighbours cannot masquerade
    /// as in-bin pairs. Clamped to the supported range.
    pub fn assign_resolution(&mut self) {
        self.resolution = resolution_for_scale(self.theta_min);
    }

    pub fn n_region(&self) -> u16 {
        self.n_region
    }

    /// Allocate per-region accumulators, clearing any previous results.
    pub fn initialize_regions(&mut self, n: u16) {
        self.n_region = n;
        for tally in self.tallies_mut() {
            tally.init_regions(n);
        }
    }

    pub fn clear_regions(&mut self) {
        self.n_region = 0;
        for tally in self.tallies_mut() {
            tally.drop_regions();
        }
    }

    fn tallies_mut(&mut self) -> [&mut RegionTally; 7] {
        [
            &mut self.gal_gal,
            &mut self.gal_rand,
            &mut self.rand_gal,
            &mut self.rand_rand,
            &mut self.pixel_wtheta,
            &mut self.pixel_weight,
            &mut self.weight,
        ]
    }

    // -----------------------------------------------------------------------
    // Accumulation
    // -----------------------------------------------------------------------

    /// Pair-query scratch: weighted pair sum, optionally tagged with the
    /// regions of its two members.
    pub fn add_to_weight(&mut self, value: f64, region_a: Option<u16>, region_b: Option<u16>) {
        self.weight.add(value, region_a, region_b);
    }

    /// Pixel-estimator contribution: product numerator and weight denominator.
    pub fn add_to_pixel_wtheta(
        &mut self,
        dwtheta: f64,
        dweight: f64,
        region_a: Option<u16>,
        region_b: Option<u16>,
    ) {
        self.pixel_wtheta.add(dwtheta, region_a, region_b);
        self.pixel_weight.add(dweight, region_a, region_b);
    }

    pub fn move_weight_to_gal_gal(&mut self) {
        self.gal_gal.absorb(&self.weight);
        self.weight.reset();
    }

    /// Drain the scratch into the galaxy-random count. In the
    /// auto-correlation the two cross terms are the same sum, so the weight
    /// can be mirrored into random-galaxy at the same time.
    pub fn move_weight_to_gal_rand(&mut self, mirror_to_rand_gal: bool) {
        self.gal_rand.absorb(&self.weight);
        if mirror_to_rand_gal {
            self.rand_gal.absorb(&self.weight);
        }
        self.weight.reset();
    }

    pub fn move_weight_to_rand_gal(&mut self) {
        self.rand_gal.absorb(&self.weight);
        self.weight.reset();
    }

    pub fn move_weight_to_rand_rand(&mut self) {
        self.rand_rand.absorb(&self.weight);
        self.weight.reset();
    }

    pub fn reset_weight(&mut self) {
        self.weight.reset();
    }

    pub fn reset_gal_rand(&mut self) {
        self.gal_rand.reset();
    }

    pub fn reset_rand_gal(&mut self) {
        self.rand_gal.reset();
    }

    pub fn reset_rand_rand(&mut self) {
        self.rand_rand.reset();
    }

    pub fn reset_pixel_wtheta(&mut self) {
        self.pixel_wtheta.reset();
        self.pixel_weight.reset();
    }

    pub fn rescale_gal_rand(&mut self, iterations: f64) {
        self.gal_rand.scale(1.0 / iterations);
    }

    pub fn rescale_rand_gal(&mut self, iterations: f64) {
        self.rand_gal.scale(1.0 / iterations);
    }

    pub fn rescale_rand_rand(&mut self, iterations: f64) {
        self.rand_rand.scale(1.0 / iterations);
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    pub fn gal_gal(&self) -> f64 {
        self.gal_gal.total()
    }

    pub fn gal_rand(&self) -> f64 {
        self.gal_rand.total()
    }

    pub fn rand_gal(&self) -> f64 {
        self.rand_gal.total()
    }

    pub fn rand_rand(&self) -> f64 {
        self.rand_rand.total()
    }

    /// Pixel-estimator numerator: weighted sum of overdensity products.
    pub fn pixel_wtheta(&self) -> f64 {
        self.pixel_wtheta.total()
    }

    /// Pixel-estimator denominator: weighted sum of pixel weight products.
    pub fn pixel_weight(&self) -> f64 {
        self.pixel_weight.total()
    }

    pub fn gal_gal_region(&self, k: u16) -> f64 {
        self.gal_gal.region(k)
    }

    pub fn gal_rand_region(&self, k: u16) -> f64 {
        self.gal_rand.region(k)
    }

    pub fn rand_gal_region(&self, k: u16) -> f64 {
        self.rand_gal.region(k)
    }

    pub fn rand_rand_region(&self, k: u16) -> f64 {
        self.rand_rand.region(k)
    }

    pub fn pixel_wtheta_region(&self, k: u16) -> f64 {
        self.pixel_wtheta.region(k)
    }

    pub fn pixel_weight_region(&self, k: u16) -> f64 {
        self.pixel_weight.region(k)
    }

    /// The correlation estimate for this bin.
    ///
    /// Pair bins use Landy–Szalay, (GG - GR - RG + RR) / RR, and return NaN
    /// when the random-random count is empty. Pixel bins divide the
    /// overdensity-product numerator by the weight denominator; the field
    /// mean is zero after overdensity conversion, so no further subtraction
    /// applies.
    pub fn wtheta(&self) -> f64 {
        if self.resolution == 0 {
            let rr = self.rand_rand.total();
            if rr > 0.0 {
                (self.gal_gal.total() - self.gal_rand.total() - self.rand_gal.total() + rr) / rr
            } else {
                f64::NAN
            }
        } else {
            let den = self.pixel_weight.total();
            if den > 0.0 {
                self.pixel_wtheta.total() / den
            } else {
                f64::NAN
            }
        }
    }

    /// Leave-one-out estimate omitting region `k`.
    pub fn wtheta_region(&self, k: u16) -> f64 {
        if self.resolution == 0 {
            let rr = self.rand_rand.region(k);
            if rr > 0.0 {
                (self.gal_gal.region(k) - self.gal_rand.region(k) - self.rand_gal.region(k) + rr)
                    / rr
            } else {
                f64::NAN
            }
        } else {
            let den = self.pixel_weight.region(k);
            if den > 0.0 {
                self.pixel_wtheta.region(k) / den
            } else {
                f64::NAN
            }
        }
    }

    /// Mean of the leave-one-out estimates.
    pub fn mean_wtheta(&self) -> f64 {
        if self.n_region == 0 {
            return f64::NAN;
        }
        (0..self.n_region).map(|k| self.wtheta_region(k)).sum::<f64>() / self.n_region as f64
    }

    /// Jack-knife error on [`Self::mean_wtheta`]: the square root of the
    /// leave-one-out variance, scaled by (N - 1) / N.
    pub fn mean_wtheta_error(&self) -> f64 {
        if self.n_region == 0 {
            return f64::NAN;
        }
        let n = self.n_region as f64;
        let mean = self.mean_wtheta();
        let sum_sq: f64 = (0..self.n_region)
            .map(|k| {
                let d = self.wtheta_region(k) - mean;
                d * d
            })
            .sum();
        (n - 1.0) / n * sum_sq.sqrt()
    }

    /// Shot-noise variance of the estimate, 1 over the accumulated weight.
    pub fn poisson_variance(&self) -> f64 {
        let den = if self.resolution == 0 {
            self.gal_gal.total()
        } else {
            self.pixel_weight.total()
        };
        if den > 0.0 {
            1.0 / den
        } else {
            f64::NAN
        }
    }
}

/// Coarsest power-of-two resolution whose pixel diagonal is strictly below
/// `theta_deg`, clamped to the supported range.
pub fn resolution_for_scale(theta_deg: f64) -> u32 {
    let mut resolution = RESOLUTION_MIN;
    while pixel_diagonal_deg(resolution) >= theta_deg && resolution < RESOLUTION_MAX {
        resolution *= 2;
    }
    resolution
}

/// Ordered angular bins with the pixel/pair estimator split.
///
/// Bins are sorted by increasing θ_min, which makes assigned resolutions
/// non-increasing: the pair-estimator bins (resolution 0) form the leading
/// sub-range `[0, split)`, the pixel bins the trailing `[split, n)` in
/// descending-resolution order.
pub struct Binning {
    bins: Vec<AngularBin>,
    split: usize,
    min_resolution: u32,
    max_resolution: u32,
    manual_break: bool,
    n_region: u16,
}

impl Binning {
    /// Logarithmic binning: steps of 10^(1/bins_per_decade) starting from
    /// the decade below `theta_min`, keeping bins whose inner edge lies in
    /// [theta_min, theta_max).
    pub fn log_spaced(theta_min: f64, theta_max: f64, bins_per_decade: f64) -> Result<Self> {
        if !(theta_min > 0.0 && theta_max > theta_min && bins_per_decade > 0.0) {
            return Err(Error::InvalidBinning(format!(
                "log spacing needs 0 < theta_min < theta_max and positive bins per decade \
                 (got {theta_min}, {theta_max}, {bins_per_decade})"
            )));
        }
        if theta_max > 90.0 {
            return Err(Error::InvalidBinning(format!(
                "sin²θ bin bounds are monotone only below 90 degrees (theta_max = {theta_max})"
            )));
        }

        let mut bins = Vec::new();
        let mut unit = theta_min.log10().floor() * bins_per_decade;
        loop {
            let lower = 10.0_f64.powf(unit / bins_per_decade);
            if double_ge(lower, theta_max) {
                break;
            }
            if double_ge(lower, theta_min) {
                bins.push(AngularBin::new(
                    lower,
                    10.0_f64.powf((unit + 1.0) / bins_per_decade),
                ));
            }
            unit += 1.0;
        }
        Self::from_bins(bins)
    }

    /// Linear binning: `n_bins` equal-width annuli over [theta_min, theta_max).
    pub fn linear(n_bins: usize, theta_min: f64, theta_max: f64) -> Result<Self> {
        if n_bins == 0 || !(theta_min >= 0.0 && theta_max > theta_min) {
            return Err(Error::InvalidBinning(format!(
                "linear spacing needs at least one bin and theta_min < theta_max \
                 (got {n_bins}, {theta_min}, {theta_max})"
            )));
        }
        if theta_max > 90.0 {
            return Err(Error::InvalidBinning(format!(
                "sin²θ bin bounds are monotone only below 90 degrees (theta_max = {theta_max})"
            )));
        }

        let dtheta = (theta_max - theta_min) / n_bins as f64;
        let bins = (0..n_bins)
            .map(|i| {
                let lower = theta_min + i as f64 * dtheta;
                let upper = theta_min + (i + 1) as f64 * dtheta;
                let mut bin = AngularBin::new(lower.max(f64::MIN_POSITIVE), upper);
                bin.set_theta(0.5 * (lower + upper));
                bin
            })
            .collect();
        Self::from_bins(bins)
    }

    fn from_bins(bins: Vec<AngularBin>) -> Result<Self> {
        if bins.is_empty() {
            return Err(Error::InvalidBinning(
                "angular range produced no bins".into(),
            ));
        }
        let mut binning = Binning {
            bins,
            split: 0,
            min_resolution: 0,
            max_resolution: 0,
            manual_break: false,
            n_region: 0,
        };
        binning.assign_resolutions();
        Ok(binning)
    }

    /// Assign every bin its pixel resolution and mark all bins pixel-based.
    pub fn assign_resolutions(&mut self) {
        for bin in &mut self.bins {
            bin.assign_resolution();
        }
        self.split = 0;
        self.recompute_resolution_bounds();
    }

    fn recompute_resolution_bounds(&mut self) {
        let pixel = &self.bins[self.split..];
        self.min_resolution = pixel.iter().map(AngularBin::resolution).min().unwrap_or(0);
        self.max_resolution = pixel.iter().map(AngularBin::resolution).max().unwrap_or(0);
    }

    /// Cap the pixel estimator at `cap`; bins needing finer pixels move to
    /// the pair estimator. A bin exactly at the cap stays pixel-based.
    pub fn set_max_resolution(&mut self, cap: u32, manual: bool) {
        for bin in &mut self.bins {
            bin.assign_resolution();
        }
        self.split = self
            .bins
            .iter()
            .position(|b| b.resolution() <= cap)
            .unwrap_or(self.bins.len());
        for bin in &mut self.bins[..self.split] {
            bin.set_resolution(0);
        }
        self.recompute_resolution_bounds();
        if manual {
            self.manual_break = true;
        }
    }

    /// Pick the estimator break from the catalog size and survey area.
    pub fn auto_max_resolution(&mut self, n_obj: usize, area_deg2: f64) {
        let cap = if area_deg2 > 500.0 {
            // Large survey limit
            if n_obj < 500_000 {
                64
            } else if n_obj < 2_000_000 {
                128
            } else if n_obj < 10_000_000 {
                256
            } else {
                512
            }
        } else {
            // Small survey limit
            if n_obj < 500_000 {
                256
            } else if n_obj < 2_000_000 {
                512
            } else if n_obj < 10_000_000 {
                1024
            } else {
                2048
            }
        };
        info!(cap, n_obj, area_deg2, "auto-selected maximum pixel resolution");
        self.set_max_resolution(cap, false);
    }

    /// Raise any pixel bin below `resolution` up to it.
    pub fn set_min_resolution(&mut self, resolution: u32) {
        for bin in &mut self.bins[self.split..] {
            if bin.resolution() < resolution {
                bin.set_resolution(resolution);
            }
        }
        self.recompute_resolution_bounds();
    }

    /// Route every bin through the pair estimator.
    pub fn use_only_pairs(&mut self) {
        for bin in &mut self.bins {
            bin.set_resolution(0);
        }
        self.split = self.bins.len();
        self.recompute_resolution_bounds();
        self.manual_break = true;
    }

    /// Route every bin through the pixel estimator.
    pub fn use_only_pixels(&mut self) {
        self.assign_resolutions();
    }

    pub fn manual_break(&self) -> bool {
        self.manual_break
    }

    // -----------------------------------------------------------------------
    // Access
    // -----------------------------------------------------------------------

    pub fn n_bins(&self) -> usize {
        self.bins.len()
    }

    pub fn bins(&self) -> &[AngularBin] {
        &self.bins
    }

    pub fn bins_mut(&mut self) -> &mut [AngularBin] {
        &mut self.bins
    }

    /// Index range of pair-estimator bins.
    pub fn pair_range(&self) -> Range<usize> {
        0..self.split
    }

    /// Index range of pixel-estimator bins.
    pub fn pixel_range(&self) -> Range<usize> {
        self.split..self.bins.len()
    }

    pub fn pair_bins_mut(&mut self) -> &mut [AngularBin] {
        &mut self.bins[..self.split]
    }

    /// Index range of the pixel bins measured at exactly `resolution`.
    /// The pixel sub-range is sorted by descending resolution.
    pub fn resolution_range(&self, resolution: u32) -> Range<usize> {
        let pixel = &self.bins[self.split..];
        let lo = pixel.partition_point(|b| b.resolution() > resolution);
        let hi = pixel.partition_point(|b| b.resolution() >= resolution);
        (self.split + lo)..(self.split + hi)
    }

    pub fn bins_at_resolution_mut(&mut self, resolution: u32) -> &mut [AngularBin] {
        let range = self.resolution_range(resolution);
        &mut self.bins[range]
    }

    /// Smallest assigned pixel resolution (0 when no pixel bins remain).
    pub fn min_resolution(&self) -> u32 {
        self.min_resolution
    }

    /// Largest assigned pixel resolution (0 when no pixel bins remain).
    pub fn max_resolution(&self) -> u32 {
        self.max_resolution
    }

    pub fn theta_min(&self) -> f64 {
        self.bins[0].theta_min()
    }

    pub fn theta_max(&self) -> f64 {
        self.bins[self.bins.len() - 1].theta_max()
    }

    /// Bin containing a given sin²θ, by binary search on the sorted edges.
    pub fn find_bin(&self, sin2theta: f64) -> Option<usize> {
        let idx = self.bins.partition_point(|b| b.sin2_theta_min() <= sin2theta);
        if idx == 0 {
            return None;
        }
        let idx = idx - 1;
        self.bins[idx].within_sin2_bounds(sin2theta).then_some(idx)
    }

    pub fn initialize_regions(&mut self, n: u16) {
        self.n_region = n;
        for bin in &mut self.bins {
            bin.initialize_regions(n);
        }
    }

    pub fn clear_regions(&mut self) {
        self.n_region = 0;
        for bin in &mut self.bins {
            bin.clear_regions();
        }
    }

    pub fn n_region(&self) -> u16 {
        self.n_region
    }
}
