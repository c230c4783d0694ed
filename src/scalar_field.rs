//! Uniform-resolution sampling of a scalar quantity over a footprint.
//!
//! Where a footprint describes survey geometry, a scalar field carries data
//! over that geometry: a projected galaxy density, a pure scalar like a
//! temperature map, or a point-sampled quantity. The field supports
//! aggregation to coarser resolutions, conversion to fractional
//! overdensity, and the pixel-pair correlation kernels the estimator
//! is built on.

use std::collections::HashMap;

use tracing::warn;

use crate::bins::AngularBin;
use crate::catalog::SkyPoint;
use crate::error::{Error, Result};
use crate::footprint::Footprint;
use crate::geom::sphere::{angular_distance, sin2_angular_separation};
use crate::healpix::{pixel_area_deg2, pixel_diagonal_deg, Pixel};

/// How point insertions update a pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// The intensity is a field value; re-insertion overwrites.
    Scalar,
    /// The intensity accumulates point weights (a projected density).
    Density,
    /// The intensity accumulates per-point sampled values.
    Sampled,
}

/// One sampled cell.
#[derive(Debug, Clone)]
pub struct ScalarPixel {
    id: u64,
    center: [f64; 3],
    intensity: f64,
    n_points: u32,
    /// Correlation weight (the coverage fraction unless sampling options
    /// said otherwise).
    weight: f64,
    /// Fraction of the pixel inside the footprint.
    unmasked: f64,
}

impl ScalarPixel {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn intensity(&self) -> f64 {
        self.intensity
    }

    pub fn n_points(&self) -> u32 {
        self.n_points
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn unmasked(&self) -> f64 {
        self.unmasked
    }
}

/// Options for sampling a field from a footprint.
#[derive(Debug, Clone)]
pub struct SampleOptions {
    /// Pixels with a smaller unmasked fraction are dropped.
    pub min_unmasked_fraction: f64,
    /// Seed the intensity from the footprint weight (forces [`FieldKind::Scalar`]).
    pub intensity_from_footprint: bool,
    /// Use the footprint weight as the correlation weight instead of the
    /// unmasked fraction.
    pub weight_from_footprint: bool,
}

impl Default for SampleOptions {
    fn default() -> Self {
        SampleOptions {
            min_unmasked_fraction: 1.0e-7,
            intensity_from_footprint: false,
            weight_from_footprint: false,
        }
    }
}

#[derive(Debug, Clone)]
struct FieldRegions {
    n_region: u16,
    /// Parallel to the pixel vector.
    labels: Vec<u16>,
}

/// A scalar quantity sampled at one resolution over a footprint.
pub struct ScalarField {
    resolution: u32,
    kind: FieldKind,
    /// Sorted by pixel id.
    pixels: Vec<ScalarPixel>,
    area: f64,
    min_unmasked: f64,
    mean_intensity: f64,
    mean_cached: bool,
    overdensity: bool,
    use_local_mean: bool,
    /// Per-region mean intensity, filled when local means are in use.
    local_mean: Vec<f64>,
    regions: Option<FieldRegions>,
}

impl ScalarField {
    /// Sample a blank field over a footprint at the given resolution.
    pub fn from_footprint(
        footprint: &Footprint,
        resolution: u32,
        kind: FieldKind,
        options: &SampleOptions,
    ) -> Self {
        let mut kind = kind;
        if options.intensity_from_footprint && kind != FieldKind::Scalar {
            warn!("footprint-weight intensities force a scalar field");
            kind = FieldKind::Scalar;
        }

        let mut pixels = Vec::new();
        for c in footprint.coverage(resolution) {
            if c.unmasked < options.min_unmasked_fraction {
                continue;
            }
            let pix = Pixel {
                id: c.id,
                resolution,
            };
            pixels.push(ScalarPixel {
                id: c.id,
                center: pix.center(),
                intensity: if options.intensity_from_footprint {
                    c.weight
                } else {
                    0.0
                },
                n_points: 0,
                weight: if options.weight_from_footprint {
                    c.weight
                } else {
                    c.unmasked
                },
                unmasked: c.unmasked,
            });
        }

        let area = pixels.iter().map(|p| p.unmasked).sum::<f64>() * pixel_area_deg2(resolution);
        ScalarField {
            resolution,
            kind,
            pixels,
            area,
            min_unmasked: options.min_unmasked_fraction,
            mean_intensity: 0.0,
            mean_cached: false,
            overdensity: false,
            use_local_mean: false,
            local_mean: Vec::new(),
            regions: None,
        }
    }

    /// Build a coarser view of `source` by combining children into their
    /// ancestors at `resolution`.
    ///
    /// Aggregation always works on raw values; an overdensity source is
    /// read back through its cached mean. The result is a raw field with no
    /// region labels.
    pub fn aggregate(source: &ScalarField, resolution: u32) -> Result<ScalarField> {
        if resolution >= source.resolution || !resolution.is_power_of_two() {
            return Err(Error::InvalidAggregation {
                from: source.resolution,
                to: resolution,
            });
        }

        let levels = source.resolution.trailing_zeros() - resolution.trailing_zeros();
        let shift = 2 * levels;
        let n_children = 4u64.pow(levels) as f64;
        let child_area = pixel_area_deg2(source.resolution);
        let coarse_area = pixel_area_deg2(resolution);

        let mut pixels: Vec<ScalarPixel> = Vec::new();
        let mut start = 0;
        while start < source.pixels.len() {
            let coarse_id = source.pixels[start].id >> shift;
            let mut end = start;
            while end < source.pixels.len() && source.pixels[end].id >> shift == coarse_id {
                end += 1;
            }

            let group = &source.pixels[start..end];
            let sum_u_area: f64 = group.iter().map(|p| p.unmasked).sum::<f64>() * child_area;
            let n_points: u32 = group.iter().map(|p| p.n_points).sum();

            let (intensity, weight) = match source.kind {
                FieldKind::Scalar => {
                    let num: f64 = (start..end)
                        .map(|i| {
                            source.raw_intensity(i) * source.pixels[i].unmasked * child_area
                        })
                        .sum();
                    let intensity = if sum_u_area > 0.0 { num / sum_u_area } else { 0.0 };
                    let weight = group.iter().map(|p| p.weight).sum::<f64>() / group.len() as f64;
                    (intensity, weight)
                }
                FieldKind::Density | FieldKind::Sampled => {
                    let intensity: f64 = (start..end).map(|i| source.raw_intensity(i)).sum();
                    (intensity, sum_u_area / coarse_area)
                }
            };

            let unmasked = group.iter().map(|p| p.unmasked).sum::<f64>() / n_children;
            if unmasked >= source.min_unmasked {
                let pix = Pixel {
                    id: coarse_id,
                    resolution,
                };
                pixels.push(ScalarPixel {
                    id: coarse_id,
                    center: pix.center(),
                    intensity,
                    n_points,
                    weight,
                    unmasked,
                });
            }
            start = end;
        }

        let area = pixels.iter().map(|p| p.unmasked).sum::<f64>() * coarse_area;
        Ok(ScalarField {
            resolution,
            kind: source.kind,
            pixels,
            area,
            min_unmasked: source.min_unmasked,
            mean_intensity: 0.0,
            mean_cached: false,
            overdensity: false,
            use_local_mean: false,
            local_mean: Vec::new(),
            regions: None,
        })
    }

    /// Intensity of pixel `i` with any overdensity conversion undone.
    fn raw_intensity(&self, i: usize) -> f64 {
        let p = &self.pixels[i];
        if !self.overdensity {
            return p.intensity;
        }
        let expected = self.expected_intensity(i);
        p.intensity * expected + expected
    }

    /// Mean-field intensity expected in pixel `i` given its coverage.
    fn expected_intensity(&self, i: usize) -> f64 {
        let p = &self.pixels[i];
        let mu = if self.use_local_mean {
            let regions = self.regions.as_ref().expect("local mean requires regions");
            self.local_mean[regions.labels[i] as usize]
        } else {
            self.mean_intensity
        };
        mu * p.unmasked * pixel_area_deg2(self.resolution)
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Unmasked area covered by the field, square degrees.
    pub fn area(&self) -> f64 {
        self.area
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn pixels(&self) -> &[ScalarPixel] {
        &self.pixels
    }

    /// Total raw intensity over the field.
    pub fn intensity(&self) -> f64 {
        (0..self.pixels.len()).map(|i| self.raw_intensity(i)).sum()
    }

    pub fn n_points(&self) -> u64 {
        self.pixels.iter().map(|p| p.n_points as u64).sum()
    }

    /// Intensity per unit unmasked area.
    pub fn density(&self) -> f64 {
        self.intensity() / self.area
    }

    /// Points per unit unmasked area.
    pub fn point_density(&self) -> f64 {
        self.n_points() as f64 / self.area
    }

    pub fn is_overdensity(&self) -> bool {
        self.overdensity
    }

    // -----------------------------------------------------------------------
    // Point insertion
    // -----------------------------------------------------------------------

    /// Add a catalog point, using its weight as the inserted value.
    /// Returns false when the point lands outside the field.
    pub fn add_point(&mut self, point: &SkyPoint) -> bool {
        self.add(point, point.weight)
    }

    /// Add a point carrying an explicit value.
    pub fn add(&mut self, point: &SkyPoint, value: f64) -> bool {
        let pix = Pixel::from_point(point.unit, self.resolution);
        let Ok(i) = self.pixels.binary_search_by_key(&pix.id, |p| p.id) else {
            return false;
        };
        let p = &mut self.pixels[i];
        match self.kind {
            FieldKind::Scalar => {
                p.intensity = value;
                p.n_points = 1;
            }
            FieldKind::Density | FieldKind::Sampled => {
                p.intensity += value;
                p.n_points += 1;
            }
        }
        self.mean_cached = false;
        true
    }

    // -----------------------------------------------------------------------
    // Overdensity lifecycle
    // -----------------------------------------------------------------------

    /// Cache the mean intensity per unit area (globally, and per region when
    /// local means are enabled).
    pub fn calculate_mean_intensity(&mut self) {
        if self.mean_cached {
            return;
        }
        let total: f64 = self.pixels.iter().map(|p| p.intensity).sum();
        self.mean_intensity = if self.area > 0.0 { total / self.area } else { 0.0 };

        if self.use_local_mean {
            let regions = self.regions.as_ref().expect("local mean requires regions");
            let pix_area = pixel_area_deg2(self.resolution);
            let mut intensity = vec![0.0; regions.n_region as usize];
            let mut area = vec![0.0; regions.n_region as usize];
            for (p, &label) in self.pixels.iter().zip(&regions.labels) {
                intensity[label as usize] += p.intensity;
                area[label as usize] += p.unmasked * pix_area;
            }
            self.local_mean = intensity
                .iter()
                .zip(&area)
                .map(|(i, a)| if *a > 0.0 { i / a } else { 0.0 })
                .collect();
        }
        self.mean_cached = true;
    }

    pub fn mean_intensity(&mut self) -> f64 {
        self.calculate_mean_intensity();
        self.mean_intensity
    }

    /// Replace intensities with fractional overdensities,
    /// (I - μ·a) / (μ·a) for the pixel's effective area a. A second call is
    /// a no-op.
    pub fn convert_to_overdensity(&mut self) {
        if self.overdensity {
            return;
        }
        self.calculate_mean_intensity();
        for i in 0..self.pixels.len() {
            let expected = self.expected_intensity(i);
            let p = &mut self.pixels[i];
            p.intensity = if expected > 0.0 {
                (p.intensity - expected) / expected
            } else {
                0.0
            };
        }
        self.overdensity = true;
    }

    /// Undo [`Self::convert_to_overdensity`]. A no-op on a raw field.
    pub fn convert_from_overdensity(&mut self) {
        if !self.overdensity {
            return;
        }
        for i in 0..self.pixels.len() {
            let expected = self.expected_intensity(i);
            self.pixels[i].intensity = self.pixels[i].intensity * expected + expected;
        }
        self.overdensity = false;
    }

    /// Measure overdensities against per-region means instead of the global
    /// one. Requires region labels; an overdensity field is converted back
    /// to raw values first so the change of reference takes effect.
    pub fn use_local_mean_intensity(&mut self, enable: bool) -> Result<()> {
        if enable && self.regions.is_none() {
            return Err(Error::NoRegions);
        }
        if enable != self.use_local_mean {
            self.convert_from_overdensity();
            self.use_local_mean = enable;
            self.mean_cached = false;
        }
        Ok(())
    }

    pub fn using_local_mean_intensity(&self) -> bool {
        self.use_local_mean
    }

    // -----------------------------------------------------------------------
    // Regions
    // -----------------------------------------------------------------------

    /// Copy region labels from a regionated footprint. The field resolution
    /// must not be coarser than the regionation.
    pub fn init_regions(&mut self, footprint: &Footprint) -> Result<()> {
        let Some(regionation) = footprint.regionation() else {
            return Err(Error::RegionInit("footprint has no regions".into()));
        };
        if self.resolution < regionation.resolution() {
            return Err(Error::RegionInit(format!(
                "field resolution {} is coarser than the regionation at {}",
                self.resolution,
                regionation.resolution()
            )));
        }
        let mut labels = Vec::with_capacity(self.pixels.len());
        for p in &self.pixels {
            let pix = Pixel {
                id: p.id,
                resolution: self.resolution,
            };
            let label = regionation.region_of_pixel(pix).ok_or_else(|| {
                Error::RegionInit(format!("field pixel {} outside the regionated area", p.id))
            })?;
            labels.push(label);
        }
        self.regions = Some(FieldRegions {
            n_region: regionation.n_region(),
            labels,
        });
        Ok(())
    }

    pub fn n_region(&self) -> u16 {
        self.regions.as_ref().map_or(0, |r| r.n_region)
    }

    // -----------------------------------------------------------------------
    // Correlation kernels
    // -----------------------------------------------------------------------

    /// Auto-correlate the field into a single bin.
    pub fn auto_correlate(&mut self, bin: &mut AngularBin) -> Result<()> {
        self.auto_correlate_bins(std::slice::from_mut(bin))
    }

    /// Auto-correlate the field into every bin at this field's resolution,
    /// in one pass over the pixel pairs.
    ///
    /// The field is converted to overdensity first if it has not been
    /// already; the bins' pixel tallies are reset before accumulation.
    pub fn auto_correlate_bins(&mut self, bins: &mut [AngularBin]) -> Result<()> {
        self.correlate_impl(None, bins, false)
    }

    /// Auto-correlation with the N_region + 1 jack-knife tallies.
    pub fn auto_correlate_bins_with_regions(&mut self, bins: &mut [AngularBin]) -> Result<()> {
        self.correlate_impl(None, bins, true)
    }

    pub fn auto_correlate_with_regions(&mut self, bin: &mut AngularBin) -> Result<()> {
        self.auto_correlate_bins_with_regions(std::slice::from_mut(bin))
    }

    /// Cross-correlate with another field at the same resolution, over the
    /// intersection of their pixel sets.
    pub fn cross_correlate(&mut self, other: &mut ScalarField, bin: &mut AngularBin) -> Result<()> {
        self.cross_correlate_bins(other, std::slice::from_mut(bin))
    }

    pub fn cross_correlate_bins(
        &mut self,
        other: &mut ScalarField,
        bins: &mut [AngularBin],
    ) -> Result<()> {
        self.check_cross(other)?;
        other.convert_to_overdensity();
        self.correlate_impl(Some(other), bins, false)
    }

    pub fn cross_correlate_bins_with_regions(
        &mut self,
        other: &mut ScalarField,
        bins: &mut [AngularBin],
    ) -> Result<()> {
        self.check_cross(other)?;
        other.convert_to_overdensity();
        self.correlate_impl(Some(other), bins, true)
    }

    pub fn cross_correlate_with_regions(
        &mut self,
        other: &mut ScalarField,
        bin: &mut AngularBin,
    ) -> Result<()> {
        self.cross_correlate_bins_with_regions(other, std::slice::from_mut(bin))
    }

    fn check_cross(&self, other: &ScalarField) -> Result<()> {
        if self.resolution != other.resolution {
            return Err(Error::ResolutionMismatch {
                a: self.resolution,
                b: other.resolution,
            });
        }
        Ok(())
    }

    fn correlate_impl(
        &mut self,
        other: Option<&ScalarField>,
        bins: &mut [AngularBin],
        with_regions: bool,
    ) -> Result<()> {
        for bin in bins.iter_mut() {
            if bin.resolution() != self.resolution {
                return Err(Error::BinResolutionMismatch {
                    bin: bin.resolution(),
                    field: self.resolution,
                });
            }
            bin.reset_pixel_wtheta();
        }
        if bins.is_empty() {
            return Ok(());
        }
        self.convert_to_overdensity();

        let labels = if with_regions {
            let regions = self
                .regions
                .as_ref()
                .ok_or_else(|| Error::RegionInit("field has no region labels".into()))?;
            Some(&regions.labels)
        } else {
            None
        };

        // Working set: one entry per pixel (auto) or per pixel shared by
        // both fields (cross).
        struct Item {
            id: u64,
            center: [f64; 3],
            int_a: f64,
            w_a: f64,
            int_b: f64,
            w_b: f64,
            region: Option<u16>,
        }

        let items: Vec<Item> = match other {
            None => self
                .pixels
                .iter()
                .enumerate()
                .map(|(i, p)| Item {
                    id: p.id,
                    center: p.center,
                    int_a: p.intensity,
                    w_a: p.weight,
                    int_b: p.intensity,
                    w_b: p.weight,
                    region: labels.map(|l| l[i]),
                })
                .collect(),
            Some(b) => {
                let mut items = Vec::new();
                let mut j = 0;
                for (i, p) in self.pixels.iter().enumerate() {
                    while j < b.pixels.len() && b.pixels[j].id < p.id {
                        j += 1;
                    }
                    if j < b.pixels.len() && b.pixels[j].id == p.id {
                        items.push(Item {
                            id: p.id,
                            center: p.center,
                            int_a: p.intensity,
                            w_a: p.weight,
                            int_b: b.pixels[j].intensity,
                            w_b: b.pixels[j].weight,
                            region: labels.map(|l| l[i]),
                        });
                    }
                }
                items
            }
        };

        let theta_max = bins.iter().map(AngularBin::theta_max).fold(0.0, f64::max);

        // Per-pair accumulation: both ordered directions for distinct
        // pixels, one term on the diagonal.
        for_each_candidate_pair(&items, |i| i.id, self.resolution, theta_max, |p, q| {
            let (a, b) = (&items[p], &items[q]);
            // Far-hemisphere pairs would alias under sin²; bins stop at 90°.
            let dot = a.center[0] * b.center[0]
                + a.center[1] * b.center[1]
                + a.center[2] * b.center[2];
            if dot < 0.0 {
                return;
            }
            let s2 = sin2_angular_separation(a.center, b.center);
            let idx = bins.partition_point(|bin| bin.sin2_theta_min() <= s2);
            if idx == 0 {
                return;
            }
            let bin = &mut bins[idx - 1];
            if !bin.within_sin2_bounds(s2) {
                return;
            }
            let mut num = a.int_a * b.int_b * a.w_a * b.w_b;
            let mut den = a.w_a * b.w_b;
            if p != q {
                num += b.int_a * a.int_b * b.w_a * a.w_b;
                den += b.w_a * a.w_b;
            }
            bin.add_to_pixel_wtheta(num, den, a.region, b.region);
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Local statistics
    // -----------------------------------------------------------------------

    fn local_pixels(
        &self,
        center: &SkyPoint,
        theta_max_deg: f64,
        theta_min_deg: f64,
    ) -> impl Iterator<Item = &ScalarPixel> + '_ {
        let lo = theta_min_deg.max(0.0).to_radians();
        let hi = theta_max_deg.to_radians();
        let unit = center.unit;
        self.pixels.iter().filter(move |p| {
            let d = angular_distance(unit, p.center);
            d >= lo && d < hi
        })
    }

    /// Unmasked area (deg²) of pixels whose center falls within the annulus.
    pub fn find_local_area(&self, center: &SkyPoint, theta_max: f64, theta_min: f64) -> f64 {
        self.local_pixels(center, theta_max, theta_min)
            .map(|p| p.unmasked)
            .sum::<f64>()
            * pixel_area_deg2(self.resolution)
    }

    /// Summed intensity within the annulus.
    pub fn find_local_intensity(&self, center: &SkyPoint, theta_max: f64, theta_min: f64) -> f64 {
        self.local_pixels(center, theta_max, theta_min)
            .map(|p| p.intensity)
            .sum()
    }

    /// Intensity per unmasked area within the annulus.
    pub fn find_local_density(&self, center: &SkyPoint, theta_max: f64, theta_min: f64) -> f64 {
        let area = self.find_local_area(center, theta_max, theta_min);
        if area > 0.0 {
            self.find_local_intensity(center, theta_max, theta_min) / area
        } else {
            0.0
        }
    }

    /// Point count per unmasked area within the annulus.
    pub fn find_local_point_density(
        &self,
        center: &SkyPoint,
        theta_max: f64,
        theta_min: f64,
    ) -> f64 {
        let area = self.find_local_area(center, theta_max, theta_min);
        if area > 0.0 {
            let count: u64 = self
                .local_pixels(center, theta_max, theta_min)
                .map(|p| p.n_points as u64)
                .sum();
            count as f64 / area
        } else {
            0.0
        }
    }
}

/// Visit every unordered pixel pair (p <= q) that could fall within
/// `theta_max_deg` of each other, including the diagonal.
///
/// Pixels are grouped under a coarse ancestor sized well above the search
/// radius; only a cell and its neighbours can then hold partners, which
/// turns the quadratic sweep into a neighbourhood walk. Very wide searches
/// fall back to the full pair loop (they only occur at coarse resolutions,
/// where fields are small).
fn for_each_candidate_pair<T>(
    items: &[T],
    id_of: impl Fn(&T) -> u64,
    resolution: u32,
    theta_max_deg: f64,
    mut visit: impl FnMut(usize, usize),
) {
    let n = items.len();

    // Finest grouping resolution whose pixels dwarf the search radius.
    let mut coarse = 1u32;
    while coarse < resolution && pixel_diagonal_deg(coarse * 2) >= 4.0 * theta_max_deg {
        coarse *= 2;
    }

    if coarse == 1 && pixel_diagonal_deg(1) < 4.0 * theta_max_deg {
        // Radius too wide for adjacency to bound the search.
        for p in 0..n {
            for q in p..n {
                visit(p, q);
            }
        }
        return;
    }

    let shift = 2 * (resolution.trailing_zeros() - coarse.trailing_zeros());
    let mut buckets: HashMap<u64, Vec<usize>> = HashMap::new();
    for (idx, item) in items.iter().enumerate() {
        buckets.entry(id_of(item) >> shift).or_default().push(idx);
    }

    for (&cell_id, members) in &buckets {
        for (a, &p) in members.iter().enumerate() {
            for &q in &members[a..] {
                visit(p, q);
            }
        }
        let cell = Pixel {
            id: cell_id,
            resolution: coarse,
        };
        for nb in cell.neighbours() {
            if let Some(others) = buckets.get(&nb.id) {
                for &p in members {
                    for &q in others {
                        if q > p {
                            visit(p, q);
                        }
                    }
                }
            }
        }
    }
}
