//! Angular bins and the binning policy that splits them between the pixel and
//! the pair estimator.

use crate::convert;
use crate::error::{Error, Result};
use crate::pixel::{self, HPIX_RESOLUTION, MAX_PIXEL_RESOLUTION};
use float_cmp::approx_eq;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::ops::Range;

/// Returns `sin²θ` for an angle in degrees.
#[must_use]
pub fn sin2_deg(theta_deg: f64) -> f64 {
    let s = theta_deg.to_radians().sin();
    s * s
}

/// Per-region replicas of the bin accumulators. Replica `r` holds the sums
/// over all pairs that do not touch region `r`, so that it directly yields
/// the leave-one-out estimate.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
struct RegionAccumulators {
    gal_gal: Vec<f64>,
    gal_rand: Vec<f64>,
    rand_gal: Vec<f64>,
    rand_rand: Vec<f64>,
    pixel_wtheta_num: Vec<f64>,
    pixel_weight_den: Vec<f64>,
    weight: Vec<f64>,
}

impl RegionAccumulators {
    fn new(n: usize) -> Self {
        Self {
            gal_gal: vec![0.0; n],
            gal_rand: vec![0.0; n],
            rand_gal: vec![0.0; n],
            rand_rand: vec![0.0; n],
            pixel_wtheta_num: vec![0.0; n],
            pixel_weight_den: vec![0.0; n],
            weight: vec![0.0; n],
        }
    }
}

/// Adds `value` to every replica except those a pair touches.
fn add_excluding(replicas: &mut [f64], value: f64, first: Option<u32>, second: Option<u32>) {
    for (r, slot) in replicas.iter_mut().enumerate() {
        let r = u32::try_from(r).unwrap_or(u32::MAX);
        if first != Some(r) && second != Some(r) {
            *slot += value;
        }
    }
}

fn landy_szalay(gal_gal: f64, gal_rand: f64, rand_gal: f64, rand_rand: f64) -> f64 {
    if rand_rand > 0.0 {
        (gal_gal - gal_rand - rand_gal + rand_rand) / rand_rand
    } else {
        f64::NAN
    }
}

/// One half-open annulus `[θ_min, θ_max)` together with its accumulators.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AngularBin {
    theta_min: f64,
    theta_max: f64,
    theta: f64,
    sin2_theta_min: f64,
    sin2_theta_max: f64,
    // assigned pixel resolution, zero for pair-based bins
    resolution: u32,
    gal_gal: f64,
    gal_rand: f64,
    rand_gal: f64,
    rand_rand: f64,
    pixel_wtheta_num: f64,
    pixel_weight_den: f64,
    // scratch filled by tree queries, drained by the move_weight_* calls
    weight: f64,
    regions: Option<RegionAccumulators>,
}

impl AngularBin {
    /// Constructor.
    ///
    /// # Panics
    ///
    /// Panics unless `0 < theta_min < theta_max <= 90`.
    #[must_use]
    pub fn new(theta_min: f64, theta_max: f64) -> Self {
        // the sin²θ distance tests are injective only below 90 degrees
        assert!(theta_min > 0.0);
        assert!(theta_min < theta_max);
        assert!(theta_max <= 90.0);

        Self {
            theta_min,
            theta_max,
            theta: (theta_min * theta_max).sqrt(),
            sin2_theta_min: sin2_deg(theta_min),
            sin2_theta_max: sin2_deg(theta_max),
            resolution: 0,
            gal_gal: 0.0,
            gal_rand: 0.0,
            rand_gal: 0.0,
            rand_rand: 0.0,
            pixel_wtheta_num: 0.0,
            pixel_weight_den: 0.0,
            weight: 0.0,
            regions: None,
        }
    }

    /// Returns the lower edge in degrees.
    #[must_use]
    pub const fn theta_min(&self) -> f64 {
        self.theta_min
    }

    /// Returns the upper edge in degrees.
    #[must_use]
    pub const fn theta_max(&self) -> f64 {
        self.theta_max
    }

    /// Returns the representative angle, the geometric mean of the edges.
    #[must_use]
    pub const fn theta(&self) -> f64 {
        self.theta
    }

    /// Returns `sin²` of the lower edge.
    #[must_use]
    pub const fn sin2_theta_min(&self) -> f64 {
        self.sin2_theta_min
    }

    /// Returns `sin²` of the upper edge.
    #[must_use]
    pub const fn sin2_theta_max(&self) -> f64 {
        self.sin2_theta_max
    }

    /// Returns the assigned pixel resolution, zero for pair-based bins.
    #[must_use]
    pub const fn resolution(&self) -> u32 {
        self.resolution
    }

    pub(crate) fn set_resolution(&mut self, resolution: u32) {
        self.resolution = resolution;
    }

    /// Returns whether this bin is measured with the pixel estimator.
    #[must_use]
    pub const fn uses_pixels(&self) -> bool {
        self.resolution > 0
    }

    /// Returns whether this bin is measured with the pair estimator.
    #[must_use]
    pub const fn uses_pairs(&self) -> bool {
        self.resolution == 0
    }

    /// Returns whether a separation with the given `sin²θ` falls into this
    /// bin.
    #[must_use]
    pub fn within(&self, sin2_theta: f64) -> bool {
        sin2_theta >= self.sin2_theta_min && sin2_theta < self.sin2_theta_max
    }

    /// Allocates `n` per-region replicas of all accumulators, clearing any
    /// previous region state.
    pub fn init_regions(&mut self, n: usize) {
        self.regions = if n == 0 {
            None
        } else {
            Some(RegionAccumulators::new(n))
        };
    }

    /// Returns the number of region replicas, zero when regionation is off.
    #[must_use]
    pub fn n_region(&self) -> usize {
        self.regions.as_ref().map_or(0, |r| r.gal_gal.len())
    }

    /// Adds one pixel-pair contribution to the pixel estimator sums.
    pub fn add_pixel_wtheta(&mut self, num: f64, den: f64) {
        self.pixel_wtheta_num += num;
        self.pixel_weight_den += den;
    }

    /// Region-aware variant of [`Self::add_pixel_wtheta`]: the contribution
    /// also enters every replica whose region the pair does not touch.
    pub fn add_pixel_wtheta_regions(
        &mut self,
        num: f64,
        den: f64,
        first: Option<u32>,
        second: Option<u32>,
    ) {
        self.pixel_wtheta_num += num;
        self.pixel_weight_den += den;
        if let Some(regions) = &mut self.regions {
            add_excluding(&mut regions.pixel_wtheta_num, num, first, second);
            add_excluding(&mut regions.pixel_weight_den, den, first, second);
        }
    }

    /// Adds pair weight to the scratch accumulator.
    pub fn add_weight(&mut self, weight: f64) {
        self.weight += weight;
    }

    /// Region-aware variant of [`Self::add_weight`].
    pub fn add_weight_regions(&mut self, weight: f64, first: Option<u32>, second: Option<u32>) {
        self.weight += weight;
        if let Some(regions) = &mut self.regions {
            add_excluding(&mut regions.weight, weight, first, second);
        }
    }

    fn drain_weight(&mut self) -> (f64, Vec<f64>) {
        let weight = std::mem::take(&mut self.weight);
        let replicas = self
            .regions
            .as_mut()
            .map(|r| std::mem::replace(&mut r.weight, vec![0.0; r.gal_gal.len()]))
            .unwrap_or_default();
        (weight, replicas)
    }

    /// Moves the scratch weight into the galaxy-galaxy accumulator.
    pub fn move_weight_to_gal_gal(&mut self) {
        let (weight, replicas) = self.drain_weight();
        self.gal_gal += weight;
        if let Some(regions) = &mut self.regions {
            for (slot, w) in regions.gal_gal.iter_mut().zip(&replicas) {
                *slot += w;
            }
        }
    }

    /// Moves the scratch weight into the galaxy-random accumulator. With
    /// `symmetric` the same weight also enters random-galaxy, which is the
    /// auto-correlation convention.
    pub fn move_weight_to_gal_rand(&mut self, symmetric: bool) {
        let (weight, replicas) = self.drain_weight();
        self.gal_rand += weight;
        if symmetric {
            self.rand_gal += weight;
        }
        if let Some(regions) = &mut self.regions {
            for (slot, w) in regions.gal_rand.iter_mut().zip(&replicas) {
                *slot += w;
            }
            if symmetric {
                for (slot, w) in regions.rand_gal.iter_mut().zip(&replicas) {
                    *slot += w;
                }
            }
        }
    }

    /// Moves the scratch weight into the random-galaxy accumulator.
    pub fn move_weight_to_rand_gal(&mut self) {
        let (weight, replicas) = self.drain_weight();
        self.rand_gal += weight;
        if let Some(regions) = &mut self.regions {
            for (slot, w) in regions.rand_gal.iter_mut().zip(&replicas) {
                *slot += w;
            }
        }
    }

    /// Moves the scratch weight into the random-random accumulator.
    pub fn move_weight_to_rand_rand(&mut self) {
        let (weight, replicas) = self.drain_weight();
        self.rand_rand += weight;
        if let Some(regions) = &mut self.regions {
            for (slot, w) in regions.rand_rand.iter_mut().zip(&replicas) {
                *slot += w;
            }
        }
    }

    /// Rescales the random accumulators, used to average over random
    /// iterations.
    pub fn rescale_rand(&mut self, factor: f64) {
        self.gal_rand *= factor;
        self.rand_gal *= factor;
        self.rand_rand *= factor;
        if let Some(regions) = &mut self.regions {
            for slot in regions
                .gal_rand
                .iter_mut()
                .chain(regions.rand_gal.iter_mut())
                .chain(regions.rand_rand.iter_mut())
            {
                *slot *= factor;
            }
        }
    }

    /// Clears all accumulators, keeping edges, resolution and the region
    /// layout.
    pub fn reset(&mut self) {
        let n = self.n_region();
        self.gal_gal = 0.0;
        self.gal_rand = 0.0;
        self.rand_gal = 0.0;
        self.rand_rand = 0.0;
        self.pixel_wtheta_num = 0.0;
        self.pixel_weight_den = 0.0;
        self.weight = 0.0;
        self.init_regions(n);
    }

    /// Returns the galaxy-galaxy pair weight.
    #[must_use]
    pub const fn gal_gal(&self) -> f64 {
        self.gal_gal
    }

    /// Returns the galaxy-random pair weight.
    #[must_use]
    pub const fn gal_rand(&self) -> f64 {
        self.gal_rand
    }

    /// Returns the random-galaxy pair weight.
    #[must_use]
    pub const fn rand_gal(&self) -> f64 {
        self.rand_gal
    }

    /// Returns the random-random pair weight.
    #[must_use]
    pub const fn rand_rand(&self) -> f64 {
        self.rand_rand
    }

    /// Returns the pixel estimator numerator.
    #[must_use]
    pub const fn pixel_wtheta_num(&self) -> f64 {
        self.pixel_wtheta_num
    }

    /// Returns the pixel estimator denominator.
    #[must_use]
    pub const fn pixel_weight_den(&self) -> f64 {
        self.pixel_weight_den
    }

    /// Returns the weighted pixel-pair ratio `num / den`, `NaN` when the
    /// denominator vanished.
    #[must_use]
    pub fn pixel_ratio(&self) -> f64 {
        if self.pixel_weight_den > 0.0 {
            self.pixel_wtheta_num / self.pixel_weight_den
        } else {
            f64::NAN
        }
    }

    /// Returns the pixel estimate of w(θ). The engine runs the kernels on
    /// overdensity-converted fields, where the weighted pair product directly
    /// estimates w, so this is [`Self::pixel_ratio`] itself.
    #[must_use]
    pub fn pixel_wtheta(&self) -> f64 {
        self.pixel_ratio()
    }

    /// Returns `num / den − 1`, the estimate of w(θ) when the kernels were
    /// run on raw intensities, whose pair ratio estimates `1 + w` instead.
    #[must_use]
    pub fn pixel_wtheta_from_intensities(&self) -> f64 {
        self.pixel_ratio() - 1.0
    }

    /// Returns the Landy–Szalay estimate of w(θ) from the pair accumulators,
    /// `NaN` when the bin is flagged.
    #[must_use]
    pub fn pair_wtheta(&self) -> f64 {
        landy_szalay(self.gal_gal, self.gal_rand, self.rand_gal, self.rand_rand)
    }

    /// Returns w(θ) from whichever estimator this bin is assigned to.
    #[must_use]
    pub fn wtheta(&self) -> f64 {
        if self.uses_pixels() {
            self.pixel_wtheta()
        } else {
            self.pair_wtheta()
        }
    }

    /// Returns whether the estimate is unusable because the random-random
    /// weight vanished.
    #[must_use]
    pub fn flagged(&self) -> bool {
        self.uses_pairs() && self.rand_rand <= 0.0
    }

    /// Returns the galaxy-galaxy pair weight of the given leave-one-out
    /// replica.
    ///
    /// # Panics
    ///
    /// Panics if regions have not been initialized or `region` is out of
    /// range.
    #[must_use]
    pub fn gal_gal_region(&self, region: usize) -> f64 {
        self.regions.as_ref().expect("regions not initialized").gal_gal[region]
    }

    /// Returns the random-random pair weight of the given leave-one-out
    /// replica.
    ///
    /// # Panics
    ///
    /// Panics if regions have not been initialized or `region` is out of
    /// range.
    #[must_use]
    pub fn rand_rand_region(&self, region: usize) -> f64 {
        self.regions.as_ref().expect("regions not initialized").rand_rand[region]
    }

    /// Returns the pixel estimator sums of the given leave-one-out replica.
    ///
    /// # Panics
    ///
    /// Panics if regions have not been initialized or `region` is out of
    /// range.
    #[must_use]
    pub fn pixel_wtheta_region(&self, region: usize) -> (f64, f64) {
        let regions = self.regions.as_ref().expect("regions not initialized");
        (
            regions.pixel_wtheta_num[region],
            regions.pixel_weight_den[region],
        )
    }

    /// Returns the leave-one-out estimate of w(θ) for the given region.
    ///
    /// # Panics
    ///
    /// Panics if regions have not been initialized or `region` is out of
    /// range.
    #[must_use]
    pub fn wtheta_region(&self, region: usize) -> f64 {
        let regions = self.regions.as_ref().expect("regions not initialized");
        if self.uses_pixels() {
            if regions.pixel_weight_den[region] > 0.0 {
                regions.pixel_wtheta_num[region] / regions.pixel_weight_den[region]
            } else {
                f64::NAN
            }
        } else {
            landy_szalay(
                regions.gal_gal[region],
                regions.gal_rand[region],
                regions.rand_gal[region],
                regions.rand_rand[region],
            )
        }
    }

    /// Returns the mean of the leave-one-out estimates.
    ///
    /// # Panics
    ///
    /// Panics if regions have not been initialized.
    #[must_use]
    pub fn mean_wtheta_regions(&self) -> f64 {
        let n = self.n_region();
        assert!(n > 0, "regions not initialized");
        (0..n).map(|r| self.wtheta_region(r)).sum::<f64>() / convert::f64_from_usize(n)
    }

    /// Returns the jack-knife variance of w(θ) over the region replicas.
    ///
    /// # Panics
    ///
    /// Panics if regions have not been initialized.
    #[must_use]
    pub fn jackknife_variance(&self) -> f64 {
        let n = self.n_region();
        assert!(n > 0, "regions not initialized");
        let n_f64 = convert::f64_from_usize(n);
        let mean = self.mean_wtheta_regions();
        let norm = (n_f64 - 1.0).powi(2) / n_f64.powi(2);
        norm * (0..n)
            .map(|r| (self.wtheta_region(r) - mean).powi(2))
            .sum::<f64>()
    }

    /// Returns the Poisson variance of the estimate, used when no region
    /// information is available.
    #[must_use]
    pub fn poisson_variance(&self) -> f64 {
        if self.uses_pixels() {
            if self.pixel_weight_den > 0.0 {
                1.0 / self.pixel_weight_den
            } else {
                f64::NAN
            }
        } else if self.gal_gal > 0.0 {
            (1.0 + self.pair_wtheta()).powi(2) / self.gal_gal
        } else {
            f64::NAN
        }
    }

    /// Compares the bin edges of two bins within the given ulps.
    #[must_use]
    pub fn edges_approx_eq(&self, other: &Self, ulps: i64) -> bool {
        approx_eq!(f64, self.theta_min, other.theta_min, ulps = ulps)
            && approx_eq!(f64, self.theta_max, other.theta_max, ulps = ulps)
    }
}

/// Returns the coarsest resolution whose cell scale resolves separations of
/// `theta_min` degrees, or zero when even the finest cells are too coarse.
#[must_use]
pub fn find_resolution(theta_min: f64) -> u32 {
    let mut resolution = HPIX_RESOLUTION;
    while resolution <= MAX_PIXEL_RESOLUTION {
        if pixel::pixel_scale_deg(resolution) < theta_min {
            return resolution;
        }
        resolution *= 2;
    }
    0
}

/// Returns the maximum pixel resolution appropriate for a catalog of
/// `n_points` points on `area_deg2` square degrees. Bins that would need a
/// finer resolution are measured with the pair estimator instead.
#[must_use]
pub fn auto_max_resolution(n_points: f64, area_deg2: f64) -> u32 {
    if area_deg2 > 500.0 {
        if n_points < 5.0e5 {
            64
        } else if n_points < 2.0e6 {
            128
        } else if n_points < 1.0e7 {
            256
        } else {
            512
        }
    } else if n_points < 5.0e5 {
        256
    } else if n_points < 2.0e6 {
        512
    } else if n_points < 1.0e7 {
        1024
    } else {
        2048
    }
}

/// An ordered sequence of [`AngularBin`]s, split into a pair-based prefix
/// (small angles) and a pixel-based suffix (large angles).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AngularBinning {
    bins: Vec<AngularBin>,
    pair: Range<usize>,
    pixel: Range<usize>,
}

impl AngularBinning {
    /// Constructor for logarithmic bins. Left edges start at the decade below
    /// `theta_min` and advance by `10^(1/bins_per_decade)`; a bin is kept
    /// when its left edge lies in `[theta_min, theta_max)`.
    ///
    /// # Errors
    ///
    /// Returns an error for non-positive or reversed limits, a zero bin
    /// density, or when no bin survives.
    pub fn log_spaced(theta_min: f64, theta_max: f64, bins_per_decade: u32) -> Result<Self> {
        if !(theta_min > 0.0 && theta_min < theta_max && theta_max <= 90.0) {
            return Err(Error::General(format!(
                "invalid angular limits ({theta_min}, {theta_max})"
            )));
        }
        if bins_per_decade == 0 {
            return Err(Error::General("need at least one bin per decade".to_owned()));
        }

        let base = theta_min.log10().floor();
        let per_decade = convert::f64_from_u32(bins_per_decade);
        let mut bins = Vec::new();
        for k in 0.. {
            let left = 10.0f64.powf(base + convert::f64_from_u32(k) / per_decade);
            let right = 10.0f64.powf(base + convert::f64_from_u32(k + 1) / per_decade);
            if left >= theta_max || approx_eq!(f64, left, theta_max, ulps = 4) {
                break;
            }
            if left >= theta_min || approx_eq!(f64, left, theta_min, ulps = 4) {
                bins.push(AngularBin::new(left, right));
            }
        }

        Self::from_bins(bins)
    }

    /// Constructor for `n` equal-width bins between `theta_min` and
    /// `theta_max`.
    ///
    /// # Errors
    ///
    /// Returns an error for non-positive or reversed limits or `n == 0`.
    pub fn linear_spaced(n: usize, theta_min: f64, theta_max: f64) -> Result<Self> {
        if !(theta_min > 0.0 && theta_min < theta_max && theta_max <= 90.0) {
            return Err(Error::General(format!(
                "invalid angular limits ({theta_min}, {theta_max})"
            )));
        }
        if n == 0 {
            return Err(Error::General("need at least one bin".to_owned()));
        }

        let width = (theta_max - theta_min) / convert::f64_from_usize(n);
        let bins = (0..n)
            .map(|i| {
                let left = convert::f64_from_usize(i).mul_add(width, theta_min);
                AngularBin::new(left, left + width)
            })
            .collect();

        Self::from_bins(bins)
    }

    fn from_bins(bins: Vec<AngularBin>) -> Result<Self> {
        if bins.is_empty() {
            return Err(Error::General("binning contains no bins".to_owned()));
        }
        if !bins
            .iter()
            .tuple_windows()
            .all(|(lhs, rhs)| lhs.theta_min() < rhs.theta_min())
        {
            return Err(Error::General(
                "bin edges are not strictly increasing".to_owned(),
            ));
        }

        let len = bins.len();
        let mut binning = Self {
            bins,
            pair: 0..len,
            pixel: len..len,
        };
        binning.assign_resolutions();
        Ok(binning)
    }

    /// Assigns each bin the coarsest resolution that resolves its lower edge
    /// and recomputes the estimator split.
    pub fn assign_resolutions(&mut self) {
        for bin in &mut self.bins {
            bin.set_resolution(find_resolution(bin.theta_min()));
        }
        self.recompute_ranges();
    }

    fn recompute_ranges(&mut self) {
        let split = self
            .bins
            .iter()
            .position(AngularBin::uses_pixels)
            .unwrap_or(self.bins.len());
        self.pair = 0..split;
        self.pixel = split..self.bins.len();
    }

    /// Reclassifies every pixel bin finer than `cap` as pair-based. A bin
    /// exactly at `cap` stays pixel-based.
    pub fn apply_max_resolution(&mut self, cap: u32) {
        for bin in &mut self.bins[self.pixel.clone()] {
            if bin.resolution() > cap {
                bin.set_resolution(0);
            }
        }
        self.recompute_ranges();
    }

    /// Raises every pixel bin coarser than `resolution` to `resolution`,
    /// which couples the binning to the regionation scale.
    pub fn set_min_resolution(&mut self, resolution: u32) {
        for bin in &mut self.bins[self.pixel.clone()] {
            if bin.resolution() < resolution {
                bin.set_resolution(resolution);
            }
        }
    }

    /// Reclassifies every bin as pair-based.
    pub fn use_only_pairs(&mut self) {
        for bin in &mut self.bins {
            bin.set_resolution(0);
        }
        self.recompute_ranges();
    }

    /// Returns the number of bins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    /// Returns whether the binning is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Returns all bins.
    #[must_use]
    pub fn bins(&self) -> &[AngularBin] {
        &self.bins
    }

    /// Returns all bins mutably.
    pub fn bins_mut(&mut self) -> &mut [AngularBin] {
        &mut self.bins
    }

    /// Returns the index range of the pair-based bins.
    #[must_use]
    pub fn pair_range(&self) -> Range<usize> {
        self.pair.clone()
    }

    /// Returns the index range of the pixel-based bins.
    #[must_use]
    pub fn pixel_range(&self) -> Range<usize> {
        self.pixel.clone()
    }

    /// Returns the index range of the pixel bins assigned exactly the given
    /// resolution. The pixel sub-range is sorted by descending resolution, so
    /// this is a binary search.
    #[must_use]
    pub fn resolution_range(&self, resolution: u32) -> Range<usize> {
        let pixels = &self.bins[self.pixel.clone()];
        let start = pixels.partition_point(|bin| bin.resolution() > resolution);
        let end = pixels.partition_point(|bin| bin.resolution() >= resolution);
        self.pixel.start + start..self.pixel.start + end
    }

    /// Returns the smallest resolution over the pixel bins, zero when there
    /// are none.
    #[must_use]
    pub fn min_resolution(&self) -> u32 {
        self.bins[self.pixel.clone()]
            .iter()
            .map(AngularBin::resolution)
            .min()
            .unwrap_or(0)
    }

    /// Returns the largest resolution over the pixel bins, zero when there
    /// are none.
    #[must_use]
    pub fn max_resolution(&self) -> u32 {
        self.bins[self.pixel.clone()]
            .iter()
            .map(AngularBin::resolution)
            .max()
            .unwrap_or(0)
    }

    /// Returns the index of the bin containing a separation with the given
    /// `sin²θ`.
    #[must_use]
    pub fn find_bin(&self, sin2_theta: f64) -> Option<usize> {
        let index = self
            .bins
            .partition_point(|bin| bin.sin2_theta_min() <= sin2_theta);
        if index == 0 {
            return None;
        }
        self.bins[index - 1].within(sin2_theta).then_some(index - 1)
    }

    /// Allocates `n` region replicas on every bin.
    pub fn init_regions(&mut self, n: usize) {
        for bin in &mut self.bins {
            bin.init_regions(n);
        }
    }

    /// Clears all accumulators on every bin.
    pub fn reset(&mut self) {
        for bin in &mut self.bins {
            bin.reset();
        }
    }

    /// Serializes the binning, including all accumulators, into a compressed
    /// stream. Pair counts are expensive; this allows resuming or merging
    /// measurements offline.
    ///
    /// # Errors
    ///
    /// Returns an error when serialization or the underlying writer fails.
    pub fn write(&self, writer: impl Write) -> Result<()> {
        let mut encoder = lz4_flex::frame::FrameEncoder::new(writer);
        bincode::serialize_into(&mut encoder, self)
            .map_err(|err| Error::General(format!("failed to serialize binning: {err}")))?;
        encoder
            .finish()
            .map(|_| ())
            .map_err(|err| Error::General(format!("failed to finish compressed stream: {err}")))
    }

    /// Deserializes a binning written by [`Self::write`].
    ///
    /// # Errors
    ///
    /// Returns an error when the stream is corrupt or truncated.
    pub fn read(reader: impl Read) -> Result<Self> {
        let decoder = lz4_flex::frame::FrameDecoder::new(reader);
        bincode::deserialize_from(decoder)
            .map_err(|err| Error::General(format!("failed to deserialize binning: {err}")))
    }
}
