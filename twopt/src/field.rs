//! Uniform-resolution sampling of a scalar quantity over a footprint,
//! together with the pair-sum correlation kernels of the pixel estimator.

use crate::bin::AngularBin;
use crate::convert;
use crate::error::{Error, Result};
use crate::map::Footprint;
use crate::pixel::{self, PixelId};
use crate::point::{Position, WeightedPoint};
use bitflags::bitflags;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Cells with a smaller unmasked fraction are dropped when sampling a
/// footprint.
pub const DEFAULT_MIN_UNMASKED_FRACTION: f64 = 1.0e-7;

/// How intensities react to point insertion.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum FieldKind {
    /// The intensity is a field value, overwritten on re-insertion.
    Scalar,
    /// The intensity accumulates point weights.
    Density,
    /// The intensity accumulates per-point values.
    Sampled,
}

bitflags! {
    /// Lifecycle state of a [`ScalarField`].
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct FieldStatus: u8 {
        /// Intensities are in overdensity form.
        const OVERDENSITY = 1;
        /// The mean intensity (global or per region) is cached.
        const MEAN_CACHED = 1 << 1;
        /// Overdensity conversion uses per-region means.
        const LOCAL_MEAN = 1 << 2;
    }
}

/// One sampled cell of a [`ScalarField`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FieldPixel {
    pixel: PixelId,
    center: Position,
    intensity: f64,
    points: u32,
    weight: f64,
    unmasked: f64,
    region: Option<u32>,
}

impl FieldPixel {
    /// Returns the cell identifier.
    #[must_use]
    pub const fn pixel(&self) -> PixelId {
        self.pixel
    }

    /// Returns the intensity.
    #[must_use]
    pub const fn intensity(&self) -> f64 {
        self.intensity
    }

    /// Returns the number of points added to this cell.
    #[must_use]
    pub const fn points(&self) -> u32 {
        self.points
    }

    /// Returns the cell weight.
    #[must_use]
    pub const fn weight(&self) -> f64 {
        self.weight
    }

    /// Returns the unmasked fraction.
    #[must_use]
    pub const fn unmasked(&self) -> f64 {
        self.unmasked
    }

    /// Returns the region label, if regions are attached.
    #[must_use]
    pub const fn region(&self) -> Option<u32> {
        self.region
    }
}

/// A mapping from cells at one resolution to sampled intensities.
#[derive(Clone, Debug)]
pub struct ScalarField {
    kind: FieldKind,
    resolution: u32,
    pixels: Vec<FieldPixel>,
    area: f64,
    total_intensity: f64,
    total_points: u64,
    mean_intensity: f64,
    local_mean: Vec<f64>,
    n_region: usize,
    status: FieldStatus,
}

impl ScalarField {
    /// Samples a footprint at the given resolution. `Scalar` cells carry the
    /// footprint's survey weight, `Density` and `Sampled` cells their
    /// unmasked fraction; with `use_map_weight` a `Scalar` field also starts
    /// its intensities from the survey weights instead of zero.
    ///
    /// # Errors
    ///
    /// Returns an error for an unsupported resolution or when no cell
    /// survives the unmasked-fraction cut.
    pub fn from_footprint(
        footprint: &impl Footprint,
        resolution: u32,
        kind: FieldKind,
        use_map_weight: bool,
        min_unmasked_fraction: f64,
    ) -> Result<Self> {
        if !pixel::valid_resolution(resolution) {
            return Err(Error::General(format!(
                "unsupported field resolution {resolution}"
            )));
        }

        let cell_area = pixel::pixel_area_deg2(resolution);
        let mut area = 0.0;
        let mut total_intensity = 0.0;
        let pixels: Vec<FieldPixel> = footprint
            .pixels(resolution)
            .into_iter()
            .filter(|p| p.unmasked >= min_unmasked_fraction)
            .map(|p| {
                let intensity = if use_map_weight && kind == FieldKind::Scalar {
                    p.weight
                } else {
                    0.0
                };
                area += p.unmasked * cell_area;
                total_intensity += intensity;
                FieldPixel {
                    pixel: p.pixel,
                    center: p.pixel.center(),
                    intensity,
                    points: 0,
                    weight: if kind == FieldKind::Scalar {
                        p.weight
                    } else {
                        p.unmasked
                    },
                    unmasked: p.unmasked,
                    region: None,
                }
            })
            .collect();

        if pixels.is_empty() {
            return Err(Error::General(
                "footprint sampling produced no cells".to_owned(),
            ));
        }

        Ok(Self {
            kind,
            resolution,
            pixels,
            area,
            total_intensity,
            total_points: 0,
            mean_intensity: 0.0,
            local_mean: Vec::new(),
            n_region: 0,
            status: FieldStatus::empty(),
        })
    }

    /// Returns the sampling resolution.
    #[must_use]
    pub const fn resolution(&self) -> u32 {
        self.resolution
    }

    /// Returns the field kind.
    #[must_use]
    pub const fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Returns the number of sampled cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    /// Returns whether the field has no cells.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Returns the sampled cells, in stripe order.
    #[must_use]
    pub fn pixels(&self) -> &[FieldPixel] {
        &self.pixels
    }

    /// Returns the effective area in square degrees.
    #[must_use]
    pub const fn area(&self) -> f64 {
        self.area
    }

    /// Returns the total raw intensity.
    #[must_use]
    pub const fn total_intensity(&self) -> f64 {
        self.total_intensity
    }

    /// Returns the number of points added to the field.
    #[must_use]
    pub const fn total_points(&self) -> u64 {
        self.total_points
    }

    /// Returns the lifecycle status flags.
    #[must_use]
    pub const fn status(&self) -> FieldStatus {
        self.status
    }

    /// Returns whether the intensities are in overdensity form.
    #[must_use]
    pub const fn is_overdensity(&self) -> bool {
        self.status.contains(FieldStatus::OVERDENSITY)
    }

    /// Returns the mean raw intensity per effective area, caching it.
    pub fn mean_intensity(&mut self) -> f64 {
        if !self.status.contains(FieldStatus::MEAN_CACHED) {
            self.mean_intensity = self.total_intensity / self.area;
            self.status.insert(FieldStatus::MEAN_CACHED);
        }
        self.mean_intensity
    }

    /// Adds a point with its own weight as value, see [`Self::add_value`].
    pub fn add(&mut self, point: &WeightedPoint) -> bool {
        self.add_value(point, point.weight)
    }

    /// Adds a point to the cell containing it. `Scalar` fields overwrite the
    /// intensity with `value`, `Density` fields accumulate the point weight,
    /// `Sampled` fields accumulate `value`. Returns `false` when the point
    /// does not fall on a sampled cell.
    pub fn add_value(&mut self, point: &WeightedPoint, value: f64) -> bool {
        let id = PixelId::from_position(self.resolution, &point.position);
        let Ok(index) = self.pixels.binary_search_by(|p| p.pixel.cmp(&id)) else {
            return false;
        };

        let cell = &mut self.pixels[index];
        match self.kind {
            FieldKind::Scalar => {
                self.total_intensity += value - cell.intensity;
                cell.intensity = value;
            }
            FieldKind::Density => {
                cell.intensity += point.weight;
                cell.points += 1;
                self.total_intensity += point.weight;
                self.total_points += 1;
            }
            FieldKind::Sampled => {
                cell.intensity += value;
                cell.points += 1;
                self.total_intensity += value;
                self.total_points += 1;
            }
        }
        self.status.remove(FieldStatus::MEAN_CACHED);
        true
    }

    /// Copies region labels from the footprint into every cell.
    ///
    /// # Errors
    ///
    /// Returns an error when the footprint has no regions or is regionated
    /// finer than this field is sampled.
    pub fn init_regions(&mut self, footprint: &impl Footprint) -> Result<()> {
        if footprint.region_count() == 0 {
            return Err(Error::NoRegions);
        }
        if footprint.region_resolution() > self.resolution {
            return Err(Error::General(format!(
                "regionation at resolution {} is finer than the field at {}",
                footprint.region_resolution(),
                self.resolution
            )));
        }

        for cell in &mut self.pixels {
            cell.region = footprint.region(cell.pixel);
        }
        self.n_region = footprint.region_count();
        Ok(())
    }

    /// Returns the number of attached regions, zero when none.
    #[must_use]
    pub const fn n_region(&self) -> usize {
        self.n_region
    }

    /// Switches the overdensity conversion between the global mean and
    /// per-region means.
    ///
    /// # Errors
    ///
    /// Returns an error when enabling without regions or on a converted
    /// field.
    pub fn use_local_mean(&mut self, enable: bool) -> Result<()> {
        if self.status.contains(FieldStatus::OVERDENSITY) {
            return Err(Error::General(
                "cannot change the mean mode of a converted field".to_owned(),
            ));
        }
        if enable && self.n_region == 0 {
            return Err(Error::NoRegions);
        }
        self.status.set(FieldStatus::LOCAL_MEAN, enable);
        self.status.remove(FieldStatus::MEAN_CACHED);
        Ok(())
    }

    /// Converts the intensities to overdensities, `(I − μ·a) / (μ·a)` with
    /// the mean intensity density `μ` and the cell's effective area `a`.
    /// Idempotent: converting a converted field is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error when the field mean is not positive.
    pub fn convert_to_overdensity(&mut self) -> Result<()> {
        if self.status.contains(FieldStatus::OVERDENSITY) {
            return Ok(());
        }

        let cell_area = pixel::pixel_area_deg2(self.resolution);
        let mean = self.total_intensity / self.area;
        if !(mean > 0.0) {
            return Err(Error::General(format!(
                "cannot convert a field with mean intensity {mean}"
            )));
        }
        self.mean_intensity = mean;

        if self.status.contains(FieldStatus::LOCAL_MEAN) {
            let mut totals = vec![0.0; self.n_region];
            let mut areas = vec![0.0; self.n_region];
            for cell in &self.pixels {
                if let Some(region) = cell.region {
                    totals[region as usize] += cell.intensity;
                    areas[region as usize] += cell.unmasked * cell_area;
                }
            }
            self.local_mean = totals
                .iter()
                .zip(&areas)
                .map(|(&total, &area)| if area > 0.0 { total / area } else { mean })
                .collect();
        }

        for index in 0..self.pixels.len() {
            let expected = self.expected_cell_intensity(index);
            let cell = &mut self.pixels[index];
            cell.intensity = (cell.intensity - expected) / expected;
        }
        self.status.insert(FieldStatus::OVERDENSITY | FieldStatus::MEAN_CACHED);
        Ok(())
    }

    /// Undoes [`Self::convert_to_overdensity`] using the cached means. A
    /// no-op on a raw field.
    ///
    /// # Errors
    ///
    /// Returns an error when the cached means have been invalidated.
    pub fn convert_from_overdensity(&mut self) -> Result<()> {
        if !self.status.contains(FieldStatus::OVERDENSITY) {
            return Ok(());
        }
        if !self.status.contains(FieldStatus::MEAN_CACHED) {
            return Err(Error::General(
                "mean intensity cache was invalidated while converted".to_owned(),
            ));
        }

        for index in 0..self.pixels.len() {
            let expected = self.expected_cell_intensity(index);
            let cell = &mut self.pixels[index];
            cell.intensity = cell.intensity.mul_add(expected, expected);
        }
        self.status.remove(FieldStatus::OVERDENSITY);
        Ok(())
    }

    fn expected_cell_intensity(&self, index: usize) -> f64 {
        let cell = &self.pixels[index];
        let cell_area = pixel::pixel_area_deg2(self.resolution);
        let mean = if self.status.contains(FieldStatus::LOCAL_MEAN) {
            cell.region
                .map_or(self.mean_intensity, |r| self.local_mean[r as usize])
        } else {
            self.mean_intensity
        };
        mean * cell.unmasked * cell_area
    }

    /// Aggregates the field to a coarser resolution. `Scalar` intensities
    /// combine area-weighted, `Density` and `Sampled` intensities add.
    ///
    /// # Errors
    ///
    /// Returns an error on a converted field or for an invalid target
    /// resolution.
    pub fn downsample(&self, resolution: u32) -> Result<Self> {
        if self.status.contains(FieldStatus::OVERDENSITY) {
            return Err(Error::General(
                "aggregation operates on raw intensities".to_owned(),
            ));
        }
        if !pixel::valid_resolution(resolution) || resolution >= self.resolution {
            return Err(Error::General(format!(
                "cannot aggregate a field at resolution {} to {resolution}",
                self.resolution
            )));
        }

        struct Aggregate {
            intensity: f64,
            weighted_intensity: f64,
            weight: f64,
            covered: f64,
            points: u32,
            children: u32,
            region: Option<u32>,
        }

        let child_area = pixel::pixel_area_deg2(self.resolution);
        let coarse_area = pixel::pixel_area_deg2(resolution);
        let mut groups: FxHashMap<PixelId, Aggregate> = FxHashMap::default();
        for cell in &self.pixels {
            let group = groups
                .entry(cell.pixel.parent(resolution))
                .or_insert(Aggregate {
                    intensity: 0.0,
                    weighted_intensity: 0.0,
                    weight: 0.0,
                    covered: 0.0,
                    points: 0,
                    children: 0,
                    region: None,
                });
            let covered = cell.unmasked * child_area;
            group.intensity += cell.intensity;
            group.weighted_intensity += cell.intensity * covered;
            group.weight += cell.weight;
            group.covered += covered;
            group.points += cell.points;
            group.children += 1;
            // all children of a coarse cell share their region ancestor
            if group.region.is_none() {
                group.region = cell.region;
            }
        }

        let mut area = 0.0;
        let mut total_intensity = 0.0;
        let mut pixels: Vec<FieldPixel> = groups
            .into_iter()
            .map(|(id, group)| {
                let unmasked = group.covered / coarse_area;
                let (intensity, weight) = match self.kind {
                    FieldKind::Scalar => (
                        group.weighted_intensity / group.covered,
                        group.weight / convert::f64_from_u32(group.children),
                    ),
                    FieldKind::Density | FieldKind::Sampled => (group.intensity, unmasked),
                };
                area += group.covered;
                total_intensity += intensity;
                FieldPixel {
                    pixel: id,
                    center: id.center(),
                    intensity,
                    points: group.points,
                    weight,
                    unmasked,
                    region: group.region,
                }
            })
            .collect();
        pixels.sort_by(|lhs, rhs| lhs.pixel.cmp(&rhs.pixel));

        Ok(Self {
            kind: self.kind,
            resolution,
            pixels,
            area,
            total_intensity,
            total_points: self.total_points,
            mean_intensity: 0.0,
            local_mean: Vec::new(),
            n_region: self.n_region,
            status: self.status & FieldStatus::LOCAL_MEAN,
        })
    }

    fn check_bin(&self, bin: &AngularBin) -> Result<()> {
        if bin.resolution() == self.resolution {
            Ok(())
        } else {
            Err(Error::BinResolutionMismatch {
                bin: bin.resolution(),
                field: self.resolution,
            })
        }
    }

    /// Accumulates the auto-correlation pair sums of this field into the
    /// bin's pixel estimator. Ordered cell pairs count twice, the self pair
    /// once.
    ///
    /// # Errors
    ///
    /// Returns an error when the bin is assigned a different resolution.
    pub fn auto_correlate(&self, bin: &mut AngularBin) -> Result<()> {
        self.check_bin(bin)?;

        let s2_min = bin.sin2_theta_min();
        let s2_max = bin.sin2_theta_max();
        let theta_max = bin.theta_max();
        let pixels = &self.pixels;
        let decs: Vec<f64> = pixels.iter().map(|p| p.center.dec_deg()).collect();

        let (num, den) = (0..pixels.len())
            .into_par_iter()
            .map(|i| {
                let pi = &pixels[i];
                let mut num = 0.0;
                let mut den = 0.0;
                for j in i..pixels.len() {
                    // cells are stripe-ordered: declination differences only
                    // grow, and they bound the separation from below
                    if decs[j] - decs[i] > theta_max {
                        break;
                    }
                    let pj = &pixels[j];
                    let s2 = pi.center.sin2_angular_distance(&pj.center);
                    if s2 >= s2_min && s2 < s2_max {
                        let f = if i == j { 1.0 } else { 2.0 };
                        let ww = f * pi.weight * pj.weight;
                        num += ww * pi.intensity * pj.intensity;
                        den += ww;
                    }
                }
                (num, den)
            })
            .reduce(|| (0.0, 0.0), |lhs, rhs| (lhs.0 + rhs.0, lhs.1 + rhs.1));

        bin.add_pixel_wtheta(num, den);
        Ok(())
    }

    /// Region-aware variant of [`Self::auto_correlate`], filling the
    /// leave-one-out replicas.
    ///
    /// # Errors
    ///
    /// Returns an error when the bin resolution disagrees or the region
    /// layouts do not match.
    pub fn auto_correlate_with_regions(&self, bin: &mut AngularBin) -> Result<()> {
        self.check_bin(bin)?;
        if self.n_region == 0 {
            return Err(Error::NoRegions);
        }
        if bin.n_region() != self.n_region {
            return Err(Error::General(format!(
                "bin has {} region replicas, field has {}",
                bin.n_region(),
                self.n_region
            )));
        }

        let s2_min = bin.sin2_theta_min();
        let s2_max = bin.sin2_theta_max();
        let theta_max = bin.theta_max();
        let decs: Vec<f64> = self.pixels.iter().map(|p| p.center.dec_deg()).collect();

        for i in 0..self.pixels.len() {
            let pi = &self.pixels[i];
            for j in i..self.pixels.len() {
                if decs[j] - decs[i] > theta_max {
                    break;
                }
                let pj = &self.pixels[j];
                let s2 = pi.center.sin2_angular_distance(&pj.center);
                if s2 >= s2_min && s2 < s2_max {
                    let f = if i == j { 1.0 } else { 2.0 };
                    let ww = f * pi.weight * pj.weight;
                    bin.add_pixel_wtheta_regions(
                        ww * pi.intensity * pj.intensity,
                        ww,
                        pi.region,
                        pj.region,
                    );
                }
            }
        }
        Ok(())
    }

    fn matched_indices(&self, other: &Self) -> Vec<(usize, usize)> {
        let mut matched = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.pixels.len() && j < other.pixels.len() {
            match self.pixels[i].pixel.cmp(&other.pixels[j].pixel) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    matched.push((i, j));
                    i += 1;
                    j += 1;
                }
            }
        }
        matched
    }

    /// Accumulates the cross-correlation pair sums over the cells both
    /// fields cover.
    ///
    /// # Errors
    ///
    /// Returns an error when the fields are sampled at different resolutions
    /// or the bin is assigned another one.
    pub fn cross_correlate(&self, other: &Self, bin: &mut AngularBin) -> Result<()> {
        if self.resolution != other.resolution {
            return Err(Error::ResolutionMismatch {
                lhs: self.resolution,
                rhs: other.resolution,
            });
        }
        self.check_bin(bin)?;

        let s2_min = bin.sin2_theta_min();
        let s2_max = bin.sin2_theta_max();
        let theta_max = bin.theta_max();
        let matched = self.matched_indices(other);
        let decs: Vec<f64> = matched
            .iter()
            .map(|&(i, _)| self.pixels[i].center.dec_deg())
            .collect();
        let matched = &matched;

        let (num, den) = (0..matched.len())
            .into_par_iter()
            .map(|a| {
                let (ia, ja) = matched[a];
                let lhs_a = &self.pixels[ia];
                let rhs_a = &other.pixels[ja];
                let mut num = 0.0;
                let mut den = 0.0;
                for b in a..matched.len() {
                    if decs[b] - decs[a] > theta_max {
                        break;
                    }
                    let (ib, jb) = matched[b];
                    let lhs_b = &self.pixels[ib];
                    let rhs_b = &other.pixels[jb];
                    let s2 = lhs_a.center.sin2_angular_distance(&lhs_b.center);
                    if s2 >= s2_min && s2 < s2_max {
                        if a == b {
                            num += lhs_a.intensity * rhs_a.intensity * lhs_a.weight * rhs_a.weight;
                            den += lhs_a.weight * rhs_a.weight;
                        } else {
                            num += lhs_a.intensity * rhs_b.intensity * lhs_a.weight * rhs_b.weight
                                + lhs_b.intensity * rhs_a.intensity * lhs_b.weight * rhs_a.weight;
                            den += lhs_a.weight * rhs_b.weight + lhs_b.weight * rhs_a.weight;
                        }
                    }
                }
                (num, den)
            })
            .reduce(|| (0.0, 0.0), |lhs, rhs| (lhs.0 + rhs.0, lhs.1 + rhs.1));

        bin.add_pixel_wtheta(num, den);
        Ok(())
    }

    /// Region-aware variant of [`Self::cross_correlate`].
    ///
    /// # Errors
    ///
    /// Returns an error when resolutions disagree or the region layouts do
    /// not match.
    pub fn cross_correlate_with_regions(&self, other: &Self, bin: &mut AngularBin) -> Result<()> {
        if self.resolution != other.resolution {
            return Err(Error::ResolutionMismatch {
                lhs: self.resolution,
                rhs: other.resolution,
            });
        }
        self.check_bin(bin)?;
        if self.n_region == 0 {
            return Err(Error::NoRegions);
        }
        if bin.n_region() != self.n_region {
            return Err(Error::General(format!(
                "bin has {} region replicas, field has {}",
                bin.n_region(),
                self.n_region
            )));
        }

        let s2_min = bin.sin2_theta_min();
        let s2_max = bin.sin2_theta_max();
        let theta_max = bin.theta_max();
        let matched = self.matched_indices(other);
        let decs: Vec<f64> = matched
            .iter()
            .map(|&(i, _)| self.pixels[i].center.dec_deg())
            .collect();

        for a in 0..matched.len() {
            let (ia, ja) = matched[a];
            let lhs_a = &self.pixels[ia];
            let rhs_a = &other.pixels[ja];
            for b in a..matched.len() {
                if decs[b] - decs[a] > theta_max {
                    break;
                }
                let (ib, jb) = matched[b];
                let lhs_b = &self.pixels[ib];
                let rhs_b = &other.pixels[jb];
                let s2 = lhs_a.center.sin2_angular_distance(&lhs_b.center);
                if s2 >= s2_min && s2 < s2_max {
                    let (num, den) = if a == b {
                        (
                            lhs_a.intensity * rhs_a.intensity * lhs_a.weight * rhs_a.weight,
                            lhs_a.weight * rhs_a.weight,
                        )
                    } else {
                        (
                            lhs_a.intensity * rhs_b.intensity * lhs_a.weight * rhs_b.weight
                                + lhs_b.intensity * rhs_a.intensity * lhs_b.weight * rhs_a.weight,
                            lhs_a.weight * rhs_b.weight + lhs_b.weight * rhs_a.weight,
                        )
                    };
                    bin.add_pixel_wtheta_regions(num, den, lhs_a.region, lhs_b.region);
                }
            }
        }
        Ok(())
    }

    fn local_sums(&self, center: &Position, theta_min: f64, theta_max: f64) -> (f64, f64, f64) {
        let s2_min = crate::bin::sin2_deg(theta_min);
        let s2_max = crate::bin::sin2_deg(theta_max);
        let cell_area = pixel::pixel_area_deg2(self.resolution);

        let mut area = 0.0;
        let mut intensity = 0.0;
        let mut points = 0.0;
        for cell in &self.pixels {
            let s2 = center.sin2_angular_distance(&cell.center);
            if s2 >= s2_min && s2 < s2_max {
                area += cell.unmasked * cell_area;
                intensity += cell.intensity;
                points += f64::from(cell.points);
            }
        }
        (area, intensity, points)
    }

    /// Returns the effective area of the cells whose centers fall into the
    /// annulus `[theta_min, theta_max)` around `center`.
    #[must_use]
    pub fn local_area(&self, center: &Position, theta_min: f64, theta_max: f64) -> f64 {
        self.local_sums(center, theta_min, theta_max).0
    }

    /// Returns the summed intensity of the cells in the annulus.
    #[must_use]
    pub fn local_intensity(&self, center: &Position, theta_min: f64, theta_max: f64) -> f64 {
        self.local_sums(center, theta_min, theta_max).1
    }

    /// Returns the mean intensity per effective area in the annulus, zero
    /// when no cell qualifies.
    #[must_use]
    pub fn local_density(&self, center: &Position, theta_min: f64, theta_max: f64) -> f64 {
        let (area, intensity, _) = self.local_sums(center, theta_min, theta_max);
        if area > 0.0 {
            intensity / area
        } else {
            0.0
        }
    }

    /// Returns the point density per square degree in the annulus, zero when
    /// no cell qualifies.
    #[must_use]
    pub fn local_point_density(&self, center: &Position, theta_min: f64, theta_max: f64) -> f64 {
        let (area, _, points) = self.local_sums(center, theta_min, theta_max);
        if area > 0.0 {
            points / area
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{CoveragePixel, PixelMap};
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    fn disk() -> PixelMap {
        PixelMap::from_cap(&Position::from_radec_deg(60.0, 0.0), 3.0, 32, 1.0).unwrap()
    }

    fn density_with_randoms(map: &PixelMap, n: usize, seed: u64) -> ScalarField {
        let mut field = ScalarField::from_footprint(
            map,
            32,
            FieldKind::Density,
            false,
            DEFAULT_MIN_UNMASKED_FRACTION,
        )
        .unwrap();
        let mut rng = Pcg64::seed_from_u64(seed);
        for point in map.generate_random_points(n, false, &mut rng) {
            assert!(field.add(&point));
        }
        field
    }

    #[test]
    fn sampling_and_point_addition() {
        let map = disk();
        let mut field = density_with_randoms(&map, 1000, 3);

        assert_eq!(field.total_points(), 1000);
        assert!((field.total_intensity() - 1000.0).abs() < 1e-9);
        assert!((field.area() - map.area_deg2()).abs() < 1e-9 * map.area_deg2());

        // off the footprint
        let outside = WeightedPoint::new(60.0, 45.0, 1.0);
        assert!(!field.add(&outside));
        assert_eq!(field.total_points(), 1000);

        assert!((field.mean_intensity() - 1000.0 / field.area()).abs() < 1e-9);
    }

    #[test]
    fn overdensity_is_idempotent_and_invertible() {
        let map = disk();
        let mut field = density_with_randoms(&map, 2000, 5);
        let raw: Vec<f64> = field.pixels().iter().map(FieldPixel::intensity).collect();

        field.convert_to_overdensity().unwrap();
        assert!(field.is_overdensity());
        let converted: Vec<f64> = field.pixels().iter().map(FieldPixel::intensity).collect();

        // a second conversion is a no-op
        field.convert_to_overdensity().unwrap();
        for (lhs, rhs) in field.pixels().iter().zip(&converted) {
            assert!((lhs.intensity() - rhs).abs() < 1e-12);
        }

        // the overdensity field has zero area-weighted mean
        let cell_area = pixel::pixel_area_deg2(field.resolution());
        let weighted: f64 = field
            .pixels()
            .iter()
            .map(|p| p.intensity() * p.unmasked() * cell_area)
            .sum();
        assert!(weighted.abs() < 1e-9 * field.total_intensity());

        field.convert_from_overdensity().unwrap();
        assert!(!field.is_overdensity());
        for (lhs, rhs) in field.pixels().iter().zip(&raw) {
            assert!((lhs.intensity() - rhs).abs() < 1e-9);
        }
    }

    #[test]
    fn downsampling_conserves_density_totals() {
        let map = disk();
        let mut field = density_with_randoms(&map, 2000, 7);
        let coarse = field.downsample(8).unwrap();

        assert_eq!(coarse.resolution(), 8);
        assert!(coarse.len() < field.len());
        assert!((coarse.total_intensity() - field.total_intensity()).abs() < 1e-9 * 2000.0);
        assert!((coarse.area() - field.area()).abs() < 1e-9 * field.area());
        assert_eq!(coarse.total_points(), field.total_points());

        // aggregation refuses converted fields
        field.convert_to_overdensity().unwrap();
        assert!(field.downsample(8).is_err());
    }

    #[test]
    fn scalar_downsampling_matches_resampling() {
        let map = disk();
        let fine =
            ScalarField::from_footprint(&map, 32, FieldKind::Scalar, true, 1.0e-7).unwrap();
        let aggregated = fine.downsample(16).unwrap();
        let resampled =
            ScalarField::from_footprint(&map, 16, FieldKind::Scalar, true, 1.0e-7).unwrap();

        assert_eq!(aggregated.len(), resampled.len());
        assert!(
            (aggregated.total_intensity() - resampled.total_intensity()).abs()
                < 1e-9 * resampled.total_intensity()
        );

        // the survey weight propagates through aggregation on its own, not as
        // a copy of the coverage fraction, so the uniform unit weight survives
        // even in partially covered boundary cells
        for (lhs, rhs) in aggregated.pixels().iter().zip(resampled.pixels()) {
            assert_eq!(lhs.pixel(), rhs.pixel());
            assert!((lhs.weight() - 1.0).abs() < 1e-12);
            assert!((rhs.weight() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn auto_correlation_kernel_counts_cell_pairs() {
        // two cells in the same stripe, a known distance apart
        let lhs = PixelId::new(16, 0, 104);
        let rhs = PixelId::new(16, 2, 104);
        let map = PixelMap::new(
            16,
            vec![
                CoveragePixel {
                    pixel: lhs,
                    unmasked: 1.0,
                    weight: 1.0,
                },
                CoveragePixel {
                    pixel: rhs,
                    unmasked: 1.0,
                    weight: 1.0,
                },
            ],
        )
        .unwrap();
        let mut field =
            ScalarField::from_footprint(&map, 16, FieldKind::Scalar, false, 1.0e-7).unwrap();
        assert!(field.add_value(&WeightedPoint::from_position(lhs.center(), 1.0), 3.0));
        assert!(field.add_value(&WeightedPoint::from_position(rhs.center(), 1.0), 5.0));

        let separation = lhs.center().angular_distance_deg(&rhs.center());
        let mut bin = AngularBin::new(separation - 0.1, separation + 0.1);
        bin.set_resolution(16);
        field.auto_correlate(&mut bin).unwrap();

        // one unordered pair, counted twice; the self pairs fall below the
        // lower edge
        assert!((bin.pixel_wtheta_num() - 2.0 * 3.0 * 5.0).abs() < 1e-9);
        assert!((bin.pixel_weight_den() - 2.0).abs() < 1e-9);

        // a bin elsewhere stays empty
        let mut empty = AngularBin::new(separation + 0.2, separation + 0.4);
        empty.set_resolution(16);
        field.auto_correlate(&mut empty).unwrap();
        assert!(empty.pixel_weight_den().abs() < 1e-12);
    }

    #[test]
    fn cross_correlation_requires_matching_resolutions() {
        let map = disk();
        let fine =
            ScalarField::from_footprint(&map, 32, FieldKind::Density, false, 1.0e-7).unwrap();
        let coarse = fine.downsample(16).unwrap();
        let mut bin = AngularBin::new(1.0, 2.0);
        bin.set_resolution(32);

        assert!(matches!(
            fine.cross_correlate(&coarse, &mut bin),
            Err(Error::ResolutionMismatch { .. })
        ));

        // and the bin must match the fields
        let mut mismatched = AngularBin::new(1.0, 2.0);
        mismatched.set_resolution(16);
        let other =
            ScalarField::from_footprint(&map, 32, FieldKind::Density, false, 1.0e-7).unwrap();
        assert!(matches!(
            fine.cross_correlate(&other, &mut mismatched),
            Err(Error::BinResolutionMismatch { .. })
        ));
    }

    #[test]
    fn cross_correlation_of_field_with_itself_matches_auto() {
        let map = disk();
        let mut field = density_with_randoms(&map, 1500, 9);
        field.convert_to_overdensity().unwrap();

        let mut auto_bin = AngularBin::new(0.5, 1.0);
        auto_bin.set_resolution(32);
        field.auto_correlate(&mut auto_bin).unwrap();

        let mut cross_bin = AngularBin::new(0.5, 1.0);
        cross_bin.set_resolution(32);
        field.cross_correlate(&field.clone(), &mut cross_bin).unwrap();

        assert!(
            (auto_bin.pixel_wtheta_num() - cross_bin.pixel_wtheta_num()).abs()
                < 1e-9 * auto_bin.pixel_wtheta_num().abs().max(1.0)
        );
        assert!(
            (auto_bin.pixel_weight_den() - cross_bin.pixel_weight_den()).abs()
                < 1e-9 * auto_bin.pixel_weight_den()
        );
    }

    #[test]
    fn region_kernel_all_matches_plain_kernel() {
        let mut map = disk();
        map.initialize_regions(4).unwrap();
        let mut field = density_with_randoms(&map, 1500, 13);
        field.init_regions(&map).unwrap();
        field.convert_to_overdensity().unwrap();

        let mut plain = AngularBin::new(0.5, 1.0);
        plain.set_resolution(32);
        field.auto_correlate(&mut plain).unwrap();

        let mut regioned = AngularBin::new(0.5, 1.0);
        regioned.set_resolution(32);
        regioned.init_regions(field.n_region());
        field.auto_correlate_with_regions(&mut regioned).unwrap();

        assert!(
            (plain.pixel_wtheta_num() - regioned.pixel_wtheta_num()).abs()
                < 1e-9 * plain.pixel_wtheta_num().abs().max(1.0)
        );
        // every leave-one-out replica misses some pair weight
        for region in 0..field.n_region() {
            let (_, den) = regioned.pixel_wtheta_region(region);
            assert!(den < regioned.pixel_weight_den());
            assert!(den > 0.0);
        }
    }

    #[test]
    fn local_mean_requires_regions() {
        let map = disk();
        let mut field = density_with_randoms(&map, 500, 17);
        assert!(matches!(
            field.use_local_mean(true),
            Err(Error::NoRegions)
        ));

        let mut map = map;
        map.initialize_regions(4).unwrap();
        field.init_regions(&map).unwrap();
        field.use_local_mean(true).unwrap();
        field.convert_to_overdensity().unwrap();
        field.convert_from_overdensity().unwrap();
        assert!((field.total_intensity() - 500.0).abs() < 1e-9 * 500.0);
    }

    #[test]
    fn local_statistics() {
        let map = disk();
        let field = density_with_randoms(&map, 1000, 19);
        let center = Position::from_radec_deg(60.0, 0.0);

        let area = field.local_area(&center, 0.01, 1.0);
        assert!(area > 0.0 && area < field.area());
        assert!(field.local_point_density(&center, 0.01, 1.0) > 0.0);
        assert!(field.local_density(&center, 0.01, 1.0) > 0.0);

        // far outside the footprint nothing qualifies
        assert!(field.local_area(&center, 20.0, 30.0).abs() < 1e-12);
        assert!(field.local_density(&center, 20.0, 30.0).abs() < 1e-12);
    }
}
