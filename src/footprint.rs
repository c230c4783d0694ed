//! Survey footprint: the region of sky a catalog was drawn from.
//!
//! A footprint is a set of equal-resolution coverage pixels, each carrying
//! the fraction of its area inside the survey (`unmasked`) and a per-area
//! weight. It answers containment and coverage queries, generates random
//! catalogs matching its geometry, and can be split into contiguous
//! equal-area regions for jack-knife resampling.

use std::collections::HashMap;

use rand::Rng;
use tracing::{info, warn};

use crate::catalog::SkyPoint;
use crate::geom::sphere::{angular_distance, radec_to_xyz};
use crate::healpix::{pixel_area_deg2, Pixel, RESOLUTION_MIN};

/// One coverage cell of a footprint.
#[derive(Debug, Clone, Copy)]
pub struct CoveragePixel {
    pub id: u64,
    /// Fraction of the pixel area inside the survey, in (0, 1].
    pub unmasked: f64,
    /// Per-area weight (uniform surveys use 1).
    pub weight: f64,
}

/// Region assignment over a footprint, at its own (coarse) resolution.
#[derive(Debug, Clone)]
pub struct Regionation {
    resolution: u32,
    n_region: u16,
    assignment: HashMap<u64, u16>,
}

impl Regionation {
    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn n_region(&self) -> u16 {
        self.n_region
    }

    /// Region of a pixel at resolution >= the regionation resolution.
    pub fn region_of_pixel(&self, pixel: Pixel) -> Option<u16> {
        if pixel.resolution < self.resolution {
            return None;
        }
        let coarse = pixel.ancestor_at(self.resolution);
        self.assignment.get(&coarse.id).copied()
    }

    pub fn region_of_point(&self, point: &SkyPoint) -> Option<u16> {
        self.region_of_pixel(Pixel::from_point(point.unit, self.resolution))
    }
}

/// An arbitrary spherical survey region at a fixed sampling resolution.
pub struct Footprint {
    resolution: u32,
    /// Sorted by pixel id.
    pixels: Vec<CoveragePixel>,
    area: f64,
    regions: Option<Regionation>,
}

impl Footprint {
    /// Footprint from an explicit coverage list. Pixels with no unmasked
    /// area are dropped; of duplicate ids, the first entry wins.
    pub fn from_pixels(resolution: u32, mut pixels: Vec<CoveragePixel>) -> Self {
        pixels.retain(|p| p.unmasked > 0.0);
        pixels.sort_by_key(|p| p.id);
        pixels.dedup_by_key(|p| p.id);
        let area = pixels.iter().map(|p| p.unmasked).sum::<f64>() * pixel_area_deg2(resolution);
        Footprint {
            resolution,
            pixels,
            area,
            regions: None,
        }
    }

    /// Circular footprint: every pixel whose center lies within
    /// `radius_deg` of (ra_deg, dec_deg), fully unmasked, unit weight.
    pub fn disk(ra_deg: f64, dec_deg: f64, radius_deg: f64, resolution: u32) -> Self {
        let center = radec_to_xyz(ra_deg.to_radians(), dec_deg.to_radians());
        let radius = radius_deg.to_radians();

        fn collect(pix: Pixel, center: [f64; 3], radius: f64, resolution: u32, out: &mut Vec<u64>) {
            let d = angular_distance(pix.center(), center);
            if d - pix.bounding_radius() > radius {
                return;
            }
            if pix.resolution == resolution {
                if d <= radius {
                    out.push(pix.id);
                }
                return;
            }
            for child in pix.children() {
                collect(child, center, radius, resolution, out);
            }
        }

        let mut ids = Vec::new();
        for base in 0..12 {
            collect(
                Pixel {
                    id: base,
                    resolution: 1,
                },
                center,
                radius,
                resolution,
                &mut ids,
            );
        }

        let pixels = ids
            .into_iter()
            .map(|id| CoveragePixel {
                id,
                unmasked: 1.0,
                weight: 1.0,
            })
            .collect();
        Footprint::from_pixels(resolution, pixels)
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    /// Total unmasked area in square degrees.
    pub fn area(&self) -> f64 {
        self.area
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn pixels(&self) -> &[CoveragePixel] {
        &self.pixels
    }

    fn find(&self, id: u64) -> Option<&CoveragePixel> {
        self.pixels
            .binary_search_by_key(&id, |p| p.id)
            .ok()
            .map(|i| &self.pixels[i])
    }

    /// Whether a point lands in a covered pixel.
    pub fn contains(&self, point: &SkyPoint) -> bool {
        let pix = Pixel::from_point(point.unit, self.resolution);
        self.find(pix.id).is_some()
    }

    /// Index range of footprint pixels descending from `pixel` (which must be
    /// at a resolution <= the footprint's).
    fn descendant_range(&self, pixel: Pixel) -> std::ops::Range<usize> {
        let ids = pixel.descendant_id_range(self.resolution);
        let lo = self.pixels.partition_point(|p| p.id < ids.start);
        let hi = self.pixels.partition_point(|p| p.id < ids.end);
        lo..hi
    }

    /// Fraction of `pixel`'s area inside the footprint, at any resolution.
    pub fn unmasked_fraction(&self, pixel: Pixel) -> f64 {
        if pixel.resolution >= self.resolution {
            let coarse = pixel.ancestor_at(self.resolution);
            return self.find(coarse.id).map_or(0.0, |p| p.unmasked);
        }
        let scale = 4u64.pow(
            self.resolution.trailing_zeros() - pixel.resolution.trailing_zeros(),
        ) as f64;
        let range = self.descendant_range(pixel);
        self.pixels[range].iter().map(|p| p.unmasked).sum::<f64>() / scale
    }

    /// Mean weight of the footprint over `pixel`, weighted by unmasked area.
    pub fn average_weight(&self, pixel: Pixel) -> f64 {
        if pixel.resolution >= self.resolution {
            let coarse = pixel.ancestor_at(self.resolution);
            return self.find(coarse.id).map_or(0.0, |p| p.weight);
        }
        let range = self.descendant_range(pixel);
        let mut num = 0.0;
        let mut den = 0.0;
        for p in &self.pixels[range] {
            num += p.weight * p.unmasked;
            den += p.unmasked;
        }
        if den > 0.0 {
            num / den
        } else {
            0.0
        }
    }

    /// The footprint's coverage re-expressed at another resolution.
    ///
    /// Coarser targets aggregate descendants; finer targets expand each
    /// pixel into children inheriting its unmasked fraction and weight.
    pub fn coverage(&self, resolution: u32) -> Vec<CoveragePixel> {
        if resolution == self.resolution {
            return self.pixels.clone();
        }
        if resolution < self.resolution {
            let levels = self.resolution.trailing_zeros() - resolution.trailing_zeros();
            let scale = 4u64.pow(levels) as f64;
            let mut out: Vec<CoveragePixel> = Vec::new();
            for p in &self.pixels {
                let coarse_id = p.id >> (2 * levels);
                match out.last_mut() {
                    Some(last) if last.id == coarse_id => {
                        last.unmasked += p.unmasked / scale;
                        last.weight += p.weight * p.unmasked;
                    }
                    _ => out.push(CoveragePixel {
                        id: coarse_id,
                        unmasked: p.unmasked / scale,
                        weight: p.weight * p.unmasked,
                    }),
                }
            }
            // Second pass: weight accumulated as Σ w·u, normalize by Σ u.
            for c in &mut out {
                let total_u = c.unmasked * scale;
                if total_u > 0.0 {
                    c.weight /= total_u;
                }
            }
            out
        } else {
            let levels = resolution.trailing_zeros() - self.resolution.trailing_zeros();
            let n_children = 4u64.pow(levels);
            let mut out = Vec::with_capacity(self.pixels.len() * n_children as usize);
            for p in &self.pixels {
                let start = p.id << (2 * levels);
                for k in 0..n_children {
                    out.push(CoveragePixel {
                        id: start + k,
                        unmasked: p.unmasked,
                        weight: p.weight,
                    });
                }
            }
            out
        }
    }

    /// Generate `n` random points distributed over the unmasked area.
    ///
    /// Pixels are drawn with probability proportional to their unmasked
    /// area; the position is uniform within the pixel (a partially masked
    /// pixel spreads its unmasked area over the whole cell, since the
    /// footprint carries no sub-pixel geometry). When `use_weighted` is set
    /// each point carries the weight of the pixel it landed in, otherwise
    /// weight 1.
    pub fn generate_random_points(
        &self,
        n: usize,
        use_weighted: bool,
        rng: &mut impl Rng,
    ) -> Vec<SkyPoint> {
        if self.pixels.is_empty() {
            return Vec::new();
        }
        let mut cumulative = Vec::with_capacity(self.pixels.len());
        let mut total = 0.0;
        for p in &self.pixels {
            total += p.unmasked;
            cumulative.push(total);
        }

        let mut points = Vec::with_capacity(n);
        for _ in 0..n {
            let r = rng.gen::<f64>() * total;
            let idx = cumulative.partition_point(|&c| c <= r).min(self.pixels.len() - 1);
            let p = &self.pixels[idx];
            let unit = Pixel {
                id: p.id,
                resolution: self.resolution,
            }
            .random_point_in(rng);
            let weight = if use_weighted { p.weight } else { 1.0 };
            points.push(SkyPoint { unit, weight });
        }
        points
    }

    /// Split the footprint into `n` contiguous regions of roughly equal
    /// unmasked area, at the coarsest resolution that can tell them apart.
    ///
    /// Returns the achieved region count, which may be smaller than the
    /// request when the footprint does not cover enough coarse pixels. A
    /// second call is a no-op returning the cached count.
    pub fn initialize_regions(&mut self, n: u16) -> u16 {
        if let Some(r) = &self.regions {
            warn!(
                existing = r.n_region,
                requested = n,
                "footprint already regionated; keeping existing assignment"
            );
            return r.n_region;
        }
        if n == 0 || self.pixels.is_empty() {
            return 0;
        }

        // Prefer the coarsest split that still leaves several pixels per
        // region, so region areas stay balanced.
        let mut resolution = RESOLUTION_MIN.min(self.resolution);
        let mut coarse = self.coverage(resolution);
        while coarse.len() < 4 * n as usize && resolution < self.resolution {
            resolution *= 2;
            coarse = self.coverage(resolution);
        }

        let n_actual = (n as usize).min(coarse.len()) as u16;
        if n_actual < n {
            warn!(
                requested = n,
                achieved = n_actual,
                "footprint too small for requested region count"
            );
        }

        let total: f64 = coarse.iter().map(|p| p.unmasked).sum();
        let mut assignment = HashMap::with_capacity(coarse.len());
        let mut cum = 0.0;
        for p in &coarse {
            let mid = cum + 0.5 * p.unmasked;
            let region = ((mid / total * n_actual as f64) as u16).min(n_actual - 1);
            assignment.insert(p.id, region);
            cum += p.unmasked;
        }

        info!(
            n_region = n_actual,
            resolution, "footprint regionated"
        );
        self.regions = Some(Regionation {
            resolution,
            n_region: n_actual,
            assignment,
        });
        n_actual
    }

    pub fn clear_regions(&mut self) {
        self.regions = None;
    }

    /// Number of active regions (0 when not regionated).
    pub fn region_count(&self) -> u16 {
        self.regions.as_ref().map_or(0, |r| r.n_region)
    }

    /// Resolution of the region assignment (0 when not regionated).
    pub fn region_resolution(&self) -> u32 {
        self.regions.as_ref().map_or(0, |r| r.resolution)
    }

    pub fn regionation(&self) -> Option<&Regionation> {
        self.regions.as_ref()
    }

    pub fn region_of_pixel(&self, pixel: Pixel) -> Option<u16> {
        self.regions.as_ref().and_then(|r| r.region_of_pixel(pixel))
    }

    pub fn region_of_point(&self, point: &SkyPoint) -> Option<u16> {
        self.regions.as_ref().and_then(|r| r.region_of_point(point))
    }
}
