//! Survey footprints: the [`Footprint`] trait the correlation engine works
//! against and [`PixelMap`], a pixelized implementation of it.

use crate::convert;
use crate::error::{Error, Result};
use crate::pixel::{self, PixelId};
use crate::point::{Position, WeightedPoint};
use log::warn;
use rand::{Rng, RngCore};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// One cell of a footprint: how much of it is unmasked and the survey weight
/// it carries.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct CoveragePixel {
    /// Cell identifier.
    pub pixel: PixelId,
    /// Unmasked fraction of the cell, in `(0, 1]`.
    pub unmasked: f64,
    /// Survey weight of the cell.
    pub weight: f64,
}

/// A survey footprint on the sphere.
///
/// The engine only ever sees footprints through this trait: it asks for
/// coverage at a chosen resolution, for random points drawn from the covered
/// area, and for the jack-knife regionation state.
pub trait Footprint {
    /// Returns the effective (unmasked) area in square degrees.
    fn area_deg2(&self) -> f64;

    /// Returns whether `position` falls on the covered area.
    fn contains(&self, position: &Position) -> bool;

    /// Returns the survey weight at `position`, zero outside the footprint.
    fn weight(&self, position: &Position) -> f64;

    /// Returns the coverage resampled to the given resolution, in stripe
    /// order.
    fn pixels(&self, resolution: u32) -> Vec<CoveragePixel>;

    /// Returns the number of regions, zero before regionation.
    fn region_count(&self) -> usize;

    /// Returns the resolution at which regions are defined, zero before
    /// regionation.
    fn region_resolution(&self) -> u32;

    /// Splits the footprint into `n` regions of roughly equal area and
    /// returns the number actually created. Calling it again with the same
    /// `n` reuses the cached assignment.
    ///
    /// # Errors
    ///
    /// Returns an error when `n` is zero.
    fn initialize_regions(&mut self, n: usize) -> Result<usize>;

    /// Returns the region containing `pixel`, resolving cells finer than the
    /// regionation resolution through their ancestors. `None` for cells off
    /// the footprint, coarser than the regionation, or before regionation.
    fn region(&self, pixel: PixelId) -> Option<u32>;

    /// Returns the region containing `position`.
    fn region_of(&self, position: &Position) -> Option<u32> {
        let resolution = self.region_resolution();
        if resolution == 0 {
            return None;
        }
        self.region(PixelId::from_position(resolution, position))
    }

    /// Draws `n` random points uniformly over the covered area. With
    /// `use_weighted` each point carries the weight of the cell it was drawn
    /// from, otherwise unit weight.
    fn generate_random_points(
        &self,
        n: usize,
        use_weighted: bool,
        rng: &mut dyn RngCore,
    ) -> Vec<WeightedPoint>;
}

#[derive(Clone, Debug)]
struct RegionMap {
    resolution: u32,
    requested: usize,
    count: usize,
    labels: FxHashMap<PixelId, u32>,
}

/// A footprint stored as a set of cells at one native resolution.
#[derive(Clone, Debug)]
pub struct PixelMap {
    resolution: u32,
    pixels: Vec<CoveragePixel>,
    index: FxHashMap<PixelId, usize>,
    area: f64,
    // cumulative effective area, for inverse-CDF sampling
    cdf: Vec<f64>,
    regions: Option<RegionMap>,
}

impl PixelMap {
    /// Constructor from raw coverage. All cells must share `resolution` and
    /// have unmasked fractions in `(0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns an error when the coverage is empty, a cell has the wrong
    /// resolution or an invalid unmasked fraction, or a cell appears twice.
    pub fn new(resolution: u32, mut pixels: Vec<CoveragePixel>) -> Result<Self> {
        if !pixel::valid_resolution(resolution) {
            return Err(Error::General(format!(
                "unsupported map resolution {resolution}"
            )));
        }
        if pixels.is_empty() {
            return Err(Error::General("footprint has no coverage".to_owned()));
        }
        for p in &pixels {
            if p.pixel.resolution() != resolution {
                return Err(Error::General(format!(
                    "coverage cell at resolution {} in a map of resolution {resolution}",
                    p.pixel.resolution()
                )));
            }
            if !(p.unmasked > 0.0 && p.unmasked <= 1.0) {
                return Err(Error::General(format!(
                    "unmasked fraction {} outside (0, 1]",
                    p.unmasked
                )));
            }
        }

        pixels.sort_by(|lhs, rhs| lhs.pixel.cmp(&rhs.pixel));

        let mut index = FxHashMap::default();
        for (i, p) in pixels.iter().enumerate() {
            if index.insert(p.pixel, i).is_some() {
                return Err(Error::General("duplicate coverage cell".to_owned()));
            }
        }

        let cell_area = pixel::pixel_area_deg2(resolution);
        let mut area = 0.0;
        let cdf = pixels
            .iter()
            .map(|p| {
                area += p.unmasked * cell_area;
                area
            })
            .collect();

        Ok(Self {
            resolution,
            pixels,
            index,
            area,
            cdf,
            regions: None,
        })
    }

    /// Constructor for a spherical cap of the given radius. Partially covered
    /// cells get their unmasked fraction from a 4×4 sub-grid of sample
    /// points.
    ///
    /// # Errors
    ///
    /// Returns an error for a non-positive radius or when no cell overlaps
    /// the cap.
    pub fn from_cap(
        center: &Position,
        radius_deg: f64,
        resolution: u32,
        weight: f64,
    ) -> Result<Self> {
        if !(radius_deg > 0.0 && radius_deg < 90.0) {
            return Err(Error::General(format!(
                "cap radius {radius_deg} outside (0, 90) degrees"
            )));
        }
        if !pixel::valid_resolution(resolution) {
            return Err(Error::General(format!(
                "unsupported map resolution {resolution}"
            )));
        }

        let dec_c = center.dec_deg();
        let ra_c = center.ra_deg();
        let z_lo = (dec_c - radius_deg).max(-90.0).to_radians().sin();
        let z_hi = (dec_c + radius_deg).min(90.0).to_radians().sin();
        let n_cols = pixel::cols(resolution);
        let col_width = 360.0 / convert::f64_from_u32(n_cols);

        let cos_radius = radius_deg.to_radians().cos();
        let (sin_dec_c, cos_dec_c) = dec_c.to_radians().sin_cos();

        let mut pixels = Vec::new();
        for y in pixel::row_of_z(resolution, z_lo)..=pixel::row_of_z(resolution, z_hi) {
            let row = PixelId::new(resolution, 0, y);
            let (row_z_lo, row_z_hi) = row.z_bounds();
            let dec_lo = row_z_lo.clamp(-1.0, 1.0).asin().to_degrees();
            let dec_hi = row_z_hi.clamp(-1.0, 1.0).asin().to_degrees();
            let dec_near = dec_c.clamp(dec_lo, dec_hi).to_radians();

            // azimuth half-width of the cap at the row declination closest to
            // the cap center, padded by two cells
            let denominator = cos_dec_c * dec_near.cos();
            let numerator = cos_radius - sin_dec_c * dec_near.sin();
            let ratio = if denominator.abs() < 1e-12 {
                -1.0
            } else {
                numerator / denominator
            };
            if ratio >= 1.0 {
                continue;
            }
            let half_width = ratio.max(-1.0).acos().to_degrees() + 2.0 * col_width;

            let x_c = i64::from(pixel::col_of_ra(resolution, ra_c));
            #[allow(clippy::cast_possible_truncation)]
            let span = (half_width / col_width).ceil() as i64;
            let columns: Vec<u32> = if 2 * span + 1 >= i64::from(n_cols) {
                (0..n_cols).collect()
            } else {
                (-span..=span)
                    .map(|dx| {
                        #[allow(clippy::cast_possible_truncation)]
                        #[allow(clippy::cast_sign_loss)]
                        let x = (x_c + dx).rem_euclid(i64::from(n_cols)) as u32;
                        x
                    })
                    .collect()
            };

            for x in columns {
                let candidate = PixelId::new(resolution, x, y);
                let unmasked = cap_coverage(&candidate, center, radius_deg);
                if unmasked > 0.0 {
                    pixels.push(CoveragePixel {
                        pixel: candidate,
                        unmasked,
                        weight,
                    });
                }
            }
        }

        Self::new(resolution, pixels)
    }

    /// Returns the native resolution of the coverage.
    #[must_use]
    pub const fn resolution(&self) -> u32 {
        self.resolution
    }

    /// Returns the number of covered cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    /// Returns whether the map has no coverage.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Returns the coverage at the native resolution.
    #[must_use]
    pub fn coverage(&self) -> &[CoveragePixel] {
        &self.pixels
    }
}

/// Unmasked fraction of `candidate` with respect to a cap, from a 4×4 grid of
/// sample points.
fn cap_coverage(candidate: &PixelId, center: &Position, radius_deg: f64) -> f64 {
    let (z_lo, z_hi) = candidate.z_bounds();
    let (ra_lo, ra_hi) = candidate.ra_bounds();

    let mut inside = 0u32;
    for i in 0..4 {
        for j in 0..4 {
            let ra = ra_lo + (ra_hi - ra_lo) * (f64::from(i) + 0.5) / 4.0;
            let z = z_lo + (z_hi - z_lo) * (f64::from(j) + 0.5) / 4.0;
            if center.angular_distance_deg(&Position::from_ra_z(ra, z)) <= radius_deg {
                inside += 1;
            }
        }
    }

    f64::from(inside) / 16.0
}

impl Footprint for PixelMap {
    fn area_deg2(&self) -> f64 {
        self.area
    }

    fn contains(&self, position: &Position) -> bool {
        self.index
            .contains_key(&PixelId::from_position(self.resolution, position))
    }

    fn weight(&self, position: &Position) -> f64 {
        self.index
            .get(&PixelId::from_position(self.resolution, position))
            .map_or(0.0, |&i| self.pixels[i].weight)
    }

    fn pixels(&self, resolution: u32) -> Vec<CoveragePixel> {
        assert!(pixel::valid_resolution(resolution));

        match resolution.cmp(&self.resolution) {
            std::cmp::Ordering::Equal => self.pixels.clone(),
            std::cmp::Ordering::Greater => {
                // subdivide: children inherit the parent coverage
                let factor = resolution / self.resolution;
                let mut out = Vec::with_capacity(self.pixels.len() * (factor * factor) as usize);
                for p in &self.pixels {
                    for dy in 0..factor {
                        for dx in 0..factor {
                            out.push(CoveragePixel {
                                pixel: PixelId::new(
                                    resolution,
                                    p.pixel.x() * factor + dx,
                                    p.pixel.y() * factor + dy,
                                ),
                                unmasked: p.unmasked,
                                weight: p.weight,
                            });
                        }
                    }
                }
                out.sort_by(|lhs, rhs| lhs.pixel.cmp(&rhs.pixel));
                out
            }
            std::cmp::Ordering::Less => {
                // aggregate: effective areas add, weights combine area-weighted
                let child_area = pixel::pixel_area_deg2(self.resolution);
                let coarse_area = pixel::pixel_area_deg2(resolution);
                let mut acc: FxHashMap<PixelId, (f64, f64)> = FxHashMap::default();
                for p in &self.pixels {
                    let entry = acc.entry(p.pixel.parent(resolution)).or_insert((0.0, 0.0));
                    let a = p.unmasked * child_area;
                    entry.0 += a;
                    entry.1 += p.weight * a;
                }
                let mut out: Vec<CoveragePixel> = acc
                    .into_iter()
                    .map(|(id, (covered, weighted))| CoveragePixel {
                        pixel: id,
                        unmasked: covered / coarse_area,
                        weight: weighted / covered,
                    })
                    .collect();
                out.sort_by(|lhs, rhs| lhs.pixel.cmp(&rhs.pixel));
                out
            }
        }
    }

    fn region_count(&self) -> usize {
        self.regions.as_ref().map_or(0, |r| r.count)
    }

    fn region_resolution(&self) -> u32 {
        self.regions.as_ref().map_or(0, |r| r.resolution)
    }

    fn initialize_regions(&mut self, n: usize) -> Result<usize> {
        if n == 0 {
            return Err(Error::General("cannot regionate into zero regions".to_owned()));
        }
        if let Some(regions) = &self.regions {
            if regions.requested == n {
                return Ok(regions.count);
            }
        }

        // coarsest resolution with a comfortable number of cells per region
        let mut resolution = pixel::HPIX_RESOLUTION;
        while resolution < self.resolution && self.pixels(resolution).len() < 4 * n {
            resolution *= 2;
        }

        let cells = self.pixels(resolution);
        let cell_area = pixel::pixel_area_deg2(resolution);
        let total: f64 = cells.iter().map(|p| p.unmasked * cell_area).sum();
        let n_f64 = convert::f64_from_usize(n);

        // walk the stripe-ordered cells, cutting at equal-area boundaries
        let mut labels = FxHashMap::default();
        let mut raw = Vec::with_capacity(cells.len());
        let mut cum = 0.0;
        for p in &cells {
            let a = p.unmasked * cell_area;
            let label = ((cum + 0.5 * a) / total * n_f64).floor();
            #[allow(clippy::cast_possible_truncation)]
            #[allow(clippy::cast_sign_loss)]
            let label = (label.max(0.0) as u32).min(u32::try_from(n - 1).unwrap_or(u32::MAX));
            raw.push(label);
            cum += a;
        }

        // compress to consecutive labels in case a large cell swallowed one
        let mut remap: FxHashMap<u32, u32> = FxHashMap::default();
        for (p, &label) in cells.iter().zip(&raw) {
            let next = u32::try_from(remap.len()).unwrap_or(u32::MAX);
            let compact = *remap.entry(label).or_insert(next);
            labels.insert(p.pixel, compact);
        }
        let count = remap.len();
        if count < n {
            warn!("regionation produced {count} of {n} requested regions");
        }

        self.regions = Some(RegionMap {
            resolution,
            requested: n,
            count,
            labels,
        });
        Ok(count)
    }

    fn region(&self, pixel: PixelId) -> Option<u32> {
        let regions = self.regions.as_ref()?;
        if pixel.resolution() < regions.resolution {
            return None;
        }
        regions.labels.get(&pixel.parent(regions.resolution)).copied()
    }

    fn generate_random_points(
        &self,
        n: usize,
        use_weighted: bool,
        rng: &mut dyn RngCore,
    ) -> Vec<WeightedPoint> {
        let mut points = Vec::with_capacity(n);
        for _ in 0..n {
            let r = rng.gen::<f64>() * self.area;
            let i = self.cdf.partition_point(|&c| c <= r).min(self.pixels.len() - 1);
            let p = &self.pixels[i];

            // uniform in z and azimuth is uniform on the sphere; coverage
            // structure below the cell scale is not resolved
            let (z_lo, z_hi) = p.pixel.z_bounds();
            let (ra_lo, ra_hi) = p.pixel.ra_bounds();
            let z = rng.gen_range(z_lo..z_hi);
            let ra = rng.gen_range(ra_lo..ra_hi);

            let weight = if use_weighted { p.weight } else { 1.0 };
            points.push(WeightedPoint::from_position(
                Position::from_ra_z(ra, z),
                weight,
            ));
        }
        points
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    fn disk() -> PixelMap {
        PixelMap::from_cap(&Position::from_radec_deg(60.0, 0.0), 3.0, 32, 1.0).unwrap()
    }

    #[test]
    fn cap_area_and_containment() {
        let map = disk();
        let expected = std::f64::consts::PI * 9.0;

        // sub-sampled coverage reproduces the cap area to a few percent
        assert!((map.area_deg2() - expected).abs() < 0.1 * expected);
        assert!(map.contains(&Position::from_radec_deg(60.0, 0.0)));
        assert!(!map.contains(&Position::from_radec_deg(60.0, 10.0)));
        assert!(map.weight(&Position::from_radec_deg(60.0, 0.0)) > 0.0);
    }

    #[test]
    fn resampling_conserves_area() {
        let map = disk();
        let fine_area: f64 = map
            .pixels(128)
            .iter()
            .map(|p| p.unmasked * pixel::pixel_area_deg2(128))
            .sum();
        let coarse_area: f64 = map
            .pixels(8)
            .iter()
            .map(|p| p.unmasked * pixel::pixel_area_deg2(8))
            .sum();

        assert!((fine_area - map.area_deg2()).abs() < 1e-9 * map.area_deg2());
        assert!((coarse_area - map.area_deg2()).abs() < 1e-9 * map.area_deg2());
    }

    #[test]
    fn random_points_stay_inside() {
        let map = disk();
        let mut rng = Pcg64::seed_from_u64(11);

        let points = map.generate_random_points(2000, false, &mut rng);
        assert_eq!(points.len(), 2000);
        for p in &points {
            assert!(map.contains(&p.position));
            assert!((p.weight - 1.0).abs() < f64::EPSILON);
        }

        let weighted = map.generate_random_points(10, true, &mut rng);
        for p in &weighted {
            assert!((p.weight - 1.0).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn regionation_balances_area() {
        let mut map = disk();
        let count = map.initialize_regions(10).unwrap();

        assert_eq!(count, 10);
        assert_eq!(map.region_count(), 10);
        assert!(map.region_resolution() >= pixel::HPIX_RESOLUTION);
        assert!(map.region_resolution() <= map.resolution());

        // repeated initialization with the same request is cached
        assert_eq!(map.initialize_regions(10).unwrap(), 10);

        // every covered cell resolves to a region, through its ancestor
        for p in map.coverage() {
            assert!(map.region(p.pixel).is_some());
            assert!(map.region(p.pixel).unwrap() < 10);
        }

        // region areas are balanced to within a factor of a few
        let cell_area = pixel::pixel_area_deg2(map.region_resolution());
        let mut areas = vec![0.0; 10];
        for p in map.pixels(map.region_resolution()) {
            let region = map.region(p.pixel).unwrap() as usize;
            areas[region] += p.unmasked * cell_area;
        }
        let mean = map.area_deg2() / 10.0;
        for a in areas {
            assert!(a > 0.2 * mean && a < 3.0 * mean);
        }
    }

    #[test]
    fn regionation_rejects_zero() {
        let mut map = disk();
        assert!(map.initialize_regions(0).is_err());
    }
}
