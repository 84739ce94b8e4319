//! The correlation engine: resolution selection, the multi-resolution pixel
//! sweep, the pair sweep with its random-catalog iterations, and the
//! jack-knife covariance.

use crate::bin::{self, AngularBin, AngularBinning};
use crate::convert;
use crate::error::Result;
use crate::field::{FieldKind, ScalarField, DEFAULT_MIN_UNMASKED_FRACTION};
use crate::map::Footprint;
use crate::pixel::HPIX_RESOLUTION;
use crate::point::WeightedPoint;
use crate::tree::{PointIndex, DEFAULT_NODE_CAPACITY};
use log::warn;
use ndarray::Array2;
use rand::SeedableRng;
use rand_pcg::Pcg64;
use rayon::prelude::*;
use std::borrow::Cow;

/// Fans the pair queries for a set of bins out over a thread pool. Every bin
/// owns its accumulators, so the queries are independent and the additive
/// reductions commute.
fn query_pairs(
    tree: &PointIndex,
    catalog: &[WeightedPoint],
    bins: &mut [AngularBin],
    regions: bool,
) -> Result<()> {
    if regions {
        bins.par_iter_mut()
            .map(|bin| tree.find_weighted_pairs_with_regions(catalog, bin))
            .collect::<Result<Vec<()>>>()
            .map(|_| ())
    } else {
        bins.par_iter_mut()
            .for_each(|bin| tree.find_weighted_pairs(catalog, bin));
        Ok(())
    }
}

fn stamp_regions(
    footprint: &impl Footprint,
    catalog: &[WeightedPoint],
) -> Vec<WeightedPoint> {
    catalog
        .iter()
        .map(|point| {
            point
                .clone()
                .with_region(footprint.region_of(&point.position))
        })
        .collect()
}

fn build_index(
    resolution: u32,
    capacity: usize,
    catalog: &[WeightedPoint],
) -> PointIndex {
    let mut tree = PointIndex::with_capacity(resolution, capacity);
    let mut rejected = 0usize;
    for point in catalog {
        if !tree.add(point) {
            rejected += 1;
        }
    }
    if rejected > 0 {
        warn!(
            "point index rejected {rejected} of {} points",
            catalog.len()
        );
    }
    tree
}

/// Measures angular correlation functions into an [`AngularBinning`].
///
/// The engine owns the binning and a seeded random generator, so repeated
/// runs with the same seed and inputs are reproducible.
pub struct CorrelationEngine {
    binning: AngularBinning,
    rng: Pcg64,
    manual_break: bool,
    min_unmasked_fraction: f64,
    node_capacity: usize,
}

impl CorrelationEngine {
    /// Constructor.
    #[must_use]
    pub fn new(binning: AngularBinning, seed: u64) -> Self {
        Self {
            binning,
            rng: Pcg64::seed_from_u64(seed),
            manual_break: false,
            min_unmasked_fraction: DEFAULT_MIN_UNMASKED_FRACTION,
            node_capacity: DEFAULT_NODE_CAPACITY,
        }
    }

    /// Returns the binning with its accumulators.
    #[must_use]
    pub const fn binning(&self) -> &AngularBinning {
        &self.binning
    }

    /// Consumes the engine and returns the binning.
    #[must_use]
    pub fn into_binning(self) -> AngularBinning {
        self.binning
    }

    /// Fixes the estimator break manually instead of deriving it from the
    /// catalog size and footprint area.
    pub fn set_max_resolution(&mut self, resolution: u32) {
        self.binning.apply_max_resolution(resolution);
        self.manual_break = true;
    }

    /// Overrides the unmasked-fraction cut applied when sampling footprints.
    pub fn set_min_unmasked_fraction(&mut self, fraction: f64) {
        self.min_unmasked_fraction = fraction;
    }

    /// Overrides the bucket capacity of the point indexes.
    ///
    /// # Panics
    ///
    /// Panics when `capacity` is zero.
    pub fn set_node_capacity(&mut self, capacity: usize) {
        assert!(capacity > 0);
        self.node_capacity = capacity;
    }

    /// Clears all accumulators, keeping the binning layout.
    pub fn reset(&mut self) {
        self.binning.reset();
    }

    fn select_break(&mut self, n_effective: f64, area_deg2: f64) {
        if !self.manual_break && !self.binning.pixel_range().is_empty() {
            self.binning
                .apply_max_resolution(bin::auto_max_resolution(n_effective, area_deg2));
        }
    }

    /// Measures the auto-correlation of `catalog` on `footprint`, averaging
    /// the random terms over `k_rand` freshly generated random catalogs.
    ///
    /// # Errors
    ///
    /// Returns an error when a sweep fails, see [`crate::error::Error`].
    pub fn auto_correlate<F: Footprint>(
        &mut self,
        footprint: &F,
        catalog: &[WeightedPoint],
        k_rand: usize,
        use_weighted_randoms: bool,
    ) -> Result<()> {
        self.select_break(
            convert::f64_from_usize(catalog.len()),
            footprint.area_deg2(),
        );
        self.pixel_sweep(footprint, catalog, false)?;
        self.pair_sweep(footprint, catalog, k_rand, use_weighted_randoms, false)
    }

    /// Region-aware variant of [`Self::auto_correlate`]: regionates the
    /// footprint into `n_regions` jack-knife regions and fills the
    /// leave-one-out replicas. Returns the region count actually achieved.
    ///
    /// # Errors
    ///
    /// Returns an error when regionation or a sweep fails.
    pub fn auto_correlate_with_regions<F: Footprint>(
        &mut self,
        footprint: &mut F,
        catalog: &[WeightedPoint],
        k_rand: usize,
        use_weighted_randoms: bool,
        n_regions: usize,
    ) -> Result<usize> {
        let n_region = footprint.initialize_regions(n_regions)?;
        self.select_break(
            convert::f64_from_usize(catalog.len()),
            footprint.area_deg2(),
        );
        self.couple_regionation(footprint.region_resolution());
        self.binning.init_regions(n_region);

        self.pixel_sweep(footprint, catalog, true)?;
        self.pair_sweep(footprint, catalog, k_rand, use_weighted_randoms, true)?;
        Ok(n_region)
    }

    /// Measures the cross-correlation of two catalogs on their footprints.
    ///
    /// # Errors
    ///
    /// Returns an error when a sweep fails.
    pub fn cross_correlate<F: Footprint, G: Footprint>(
        &mut self,
        lhs_footprint: &F,
        rhs_footprint: &G,
        lhs_catalog: &[WeightedPoint],
        rhs_catalog: &[WeightedPoint],
        k_rand: usize,
        use_weighted_randoms: bool,
    ) -> Result<()> {
        let n_effective = (convert::f64_from_usize(lhs_catalog.len())
            * convert::f64_from_usize(rhs_catalog.len()))
        .sqrt();
        let area = lhs_footprint.area_deg2().min(rhs_footprint.area_deg2());
        self.select_break(n_effective, area);

        self.pixel_sweep_cross(
            lhs_footprint,
            rhs_footprint,
            lhs_catalog,
            rhs_catalog,
            false,
        )?;
        self.pair_sweep_cross(
            lhs_footprint,
            rhs_footprint,
            lhs_catalog,
            rhs_catalog,
            k_rand,
            use_weighted_randoms,
            false,
        )
    }

    /// Region-aware variant of [`Self::cross_correlate`]. Regions are
    /// defined on the first footprint and applied to both catalogs; pairs
    /// outside its regionated area count towards every replica.
    ///
    /// # Errors
    ///
    /// Returns an error when regionation or a sweep fails.
    #[allow(clippy::too_many_arguments)]
    pub fn cross_correlate_with_regions<F: Footprint, G: Footprint>(
        &mut self,
        lhs_footprint: &mut F,
        rhs_footprint: &G,
        lhs_catalog: &[WeightedPoint],
        rhs_catalog: &[WeightedPoint],
        k_rand: usize,
        use_weighted_randoms: bool,
        n_regions: usize,
    ) -> Result<usize> {
        let n_region = lhs_footprint.initialize_regions(n_regions)?;
        let n_effective = (convert::f64_from_usize(lhs_catalog.len())
            * convert::f64_from_usize(rhs_catalog.len()))
        .sqrt();
        let area = lhs_footprint.area_deg2().min(rhs_footprint.area_deg2());
        self.select_break(n_effective, area);
        self.couple_regionation(lhs_footprint.region_resolution());
        self.binning.init_regions(n_region);

        self.pixel_sweep_cross(
            lhs_footprint,
            rhs_footprint,
            lhs_catalog,
            rhs_catalog,
            true,
        )?;
        self.pair_sweep_cross(
            lhs_footprint,
            rhs_footprint,
            lhs_catalog,
            rhs_catalog,
            k_rand,
            use_weighted_randoms,
            true,
        )?;
        Ok(n_region)
    }

    /// Couples the binning to the regionation scale: pixel bins may not be
    /// coarser than the regions, and regions finer than the finest pixel bin
    /// force the pair estimator everywhere.
    fn couple_regionation(&mut self, region_resolution: u32) {
        if self.binning.pixel_range().is_empty() {
            return;
        }
        if region_resolution > self.binning.max_resolution() {
            warn!(
                "regionation at resolution {region_resolution} exceeds the maximum pixel \
                 resolution {}; falling back to pair counts for every bin",
                self.binning.max_resolution()
            );
            self.binning.use_only_pairs();
        } else {
            self.binning.set_min_resolution(region_resolution);
        }
    }

    fn pixel_sweep<F: Footprint>(
        &mut self,
        footprint: &F,
        catalog: &[WeightedPoint],
        regions: bool,
    ) -> Result<()> {
        if self.binning.pixel_range().is_empty() {
            return Ok(());
        }
        let max_resolution = self.binning.max_resolution();
        let min_resolution = self.binning.min_resolution();

        let mut field = ScalarField::from_footprint(
            footprint,
            max_resolution,
            FieldKind::Density,
            false,
            self.min_unmasked_fraction,
        )?;
        if regions {
            field.init_regions(footprint)?;
        }
        let mut outside = 0usize;
        for point in catalog {
            if !field.add(point) {
                outside += 1;
            }
        }
        if outside > 0 {
            warn!(
                "{outside} of {} catalog points fell outside the footprint",
                catalog.len()
            );
        }

        let mut resolution = max_resolution;
        loop {
            field.convert_to_overdensity()?;
            let range = self.binning.resolution_range(resolution);
            for angular_bin in &mut self.binning.bins_mut()[range] {
                if regions {
                    field.auto_correlate_with_regions(angular_bin)?;
                } else {
                    field.auto_correlate(angular_bin)?;
                }
            }

            let next = resolution / 2;
            if next < min_resolution || next < HPIX_RESOLUTION {
                break;
            }
            field.convert_from_overdensity()?;
            field = field.downsample(next)?;
            resolution = next;
        }
        Ok(())
    }

    fn pixel_sweep_cross<F: Footprint, G: Footprint>(
        &mut self,
        lhs_footprint: &F,
        rhs_footprint: &G,
        lhs_catalog: &[WeightedPoint],
        rhs_catalog: &[WeightedPoint],
        regions: bool,
    ) -> Result<()> {
        if self.binning.pixel_range().is_empty() {
            return Ok(());
        }
        let max_resolution = self.binning.max_resolution();
        let min_resolution = self.binning.min_resolution();

        let mut lhs_field = ScalarField::from_footprint(
            lhs_footprint,
            max_resolution,
            FieldKind::Density,
            false,
            self.min_unmasked_fraction,
        )?;
        let mut rhs_field = ScalarField::from_footprint(
            rhs_footprint,
            max_resolution,
            FieldKind::Density,
            false,
            self.min_unmasked_fraction,
        )?;
        if regions {
            lhs_field.init_regions(lhs_footprint)?;
            rhs_field.init_regions(lhs_footprint)?;
        }

        let mut outside = 0usize;
        for point in lhs_catalog {
            if !lhs_field.add(point) {
                outside += 1;
            }
        }
        for point in rhs_catalog {
            if !rhs_field.add(point) {
                outside += 1;
            }
        }
        if outside > 0 {
            warn!("{outside} catalog points fell outside their footprints");
        }

        let mut resolution = max_resolution;
        loop {
            lhs_field.convert_to_overdensity()?;
            rhs_field.convert_to_overdensity()?;
            let range = self.binning.resolution_range(resolution);
            for angular_bin in &mut self.binning.bins_mut()[range] {
                if regions {
                    lhs_field.cross_correlate_with_regions(&rhs_field, angular_bin)?;
                } else {
                    lhs_field.cross_correlate(&rhs_field, angular_bin)?;
                }
            }

            let next = resolution / 2;
            if next < min_resolution || next < HPIX_RESOLUTION {
                break;
            }
            lhs_field.convert_from_overdensity()?;
            rhs_field.convert_from_overdensity()?;
            lhs_field = lhs_field.downsample(next)?;
            rhs_field = rhs_field.downsample(next)?;
            resolution = next;
        }
        Ok(())
    }

    fn pair_sweep<F: Footprint>(
        &mut self,
        footprint: &F,
        catalog: &[WeightedPoint],
        k_rand: usize,
        use_weighted_randoms: bool,
        regions: bool,
    ) -> Result<()> {
        if self.binning.pair_range().is_empty() || catalog.is_empty() {
            return Ok(());
        }
        let tree_resolution = self
            .binning
            .min_resolution()
            .max(footprint.region_resolution())
            .max(HPIX_RESOLUTION);
        let node_capacity = self.node_capacity;
        let Self { binning, rng, .. } = self;
        let pair_range = binning.pair_range();

        let catalog: Cow<[WeightedPoint]> = if regions {
            Cow::Owned(stamp_regions(footprint, catalog))
        } else {
            Cow::Borrowed(catalog)
        };

        let mut tree = build_index(tree_resolution, node_capacity, &catalog);
        if regions {
            tree.initialize_regions(footprint)?;
        }
        query_pairs(
            &tree,
            &catalog,
            &mut binning.bins_mut()[pair_range.clone()],
            regions,
        )?;
        for angular_bin in &mut binning.bins_mut()[pair_range.clone()] {
            angular_bin.move_weight_to_gal_gal();
        }
        drop(tree);

        for _ in 0..k_rand {
            let mut randoms =
                footprint.generate_random_points(catalog.len(), use_weighted_randoms, &mut *rng);
            if regions {
                for point in &mut randoms {
                    point.region = footprint.region_of(&point.position);
                }
            }
            let mut random_tree = build_index(tree_resolution, node_capacity, &randoms);
            if regions {
                random_tree.initialize_regions(footprint)?;
            }

            query_pairs(
                &random_tree,
                &catalog,
                &mut binning.bins_mut()[pair_range.clone()],
                regions,
            )?;
            for angular_bin in &mut binning.bins_mut()[pair_range.clone()] {
                // the same sum serves both mixed terms of a symmetric
                // auto-correlation
                angular_bin.move_weight_to_gal_rand(true);
            }

            query_pairs(
                &random_tree,
                &randoms,
                &mut binning.bins_mut()[pair_range.clone()],
                regions,
            )?;
            for angular_bin in &mut binning.bins_mut()[pair_range.clone()] {
                angular_bin.move_weight_to_rand_rand();
            }
        }

        if k_rand > 0 {
            let factor = convert::f64_from_usize(k_rand).recip();
            for angular_bin in &mut binning.bins_mut()[pair_range] {
                angular_bin.rescale_rand(factor);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn pair_sweep_cross<F: Footprint, G: Footprint>(
        &mut self,
        lhs_footprint: &F,
        rhs_footprint: &G,
        lhs_catalog: &[WeightedPoint],
        rhs_catalog: &[WeightedPoint],
        k_rand: usize,
        use_weighted_randoms: bool,
        regions: bool,
    ) -> Result<()> {
        if self.binning.pair_range().is_empty()
            || lhs_catalog.is_empty()
            || rhs_catalog.is_empty()
        {
            return Ok(());
        }
        let tree_resolution = self
            .binning
            .min_resolution()
            .max(lhs_footprint.region_resolution())
            .max(HPIX_RESOLUTION);
        let node_capacity = self.node_capacity;
        let Self { binning, rng, .. } = self;
        let pair_range = binning.pair_range();

        let lhs_catalog: Cow<[WeightedPoint]> = if regions {
            Cow::Owned(stamp_regions(lhs_footprint, lhs_catalog))
        } else {
            Cow::Borrowed(lhs_catalog)
        };
        let rhs_catalog: Cow<[WeightedPoint]> = if regions {
            Cow::Owned(stamp_regions(lhs_footprint, rhs_catalog))
        } else {
            Cow::Borrowed(rhs_catalog)
        };

        let mut tree = build_index(tree_resolution, node_capacity, &rhs_catalog);
        if regions {
            tree.initialize_regions(lhs_footprint)?;
        }
        query_pairs(
            &tree,
            &lhs_catalog,
            &mut binning.bins_mut()[pair_range.clone()],
            regions,
        )?;
        for angular_bin in &mut binning.bins_mut()[pair_range.clone()] {
            angular_bin.move_weight_to_gal_gal();
        }

        for _ in 0..k_rand {
            let mut lhs_randoms = lhs_footprint.generate_random_points(
                lhs_catalog.len(),
                use_weighted_randoms,
                &mut *rng,
            );
            let mut rhs_randoms = rhs_footprint.generate_random_points(
                rhs_catalog.len(),
                use_weighted_randoms,
                &mut *rng,
            );
            if regions {
                for point in lhs_randoms.iter_mut().chain(rhs_randoms.iter_mut()) {
                    point.region = lhs_footprint.region_of(&point.position);
                }
            }
            let mut random_tree = build_index(tree_resolution, node_capacity, &rhs_randoms);
            if regions {
                random_tree.initialize_regions(lhs_footprint)?;
            }

            query_pairs(
                &random_tree,
                &lhs_catalog,
                &mut binning.bins_mut()[pair_range.clone()],
                regions,
            )?;
            for angular_bin in &mut binning.bins_mut()[pair_range.clone()] {
                angular_bin.move_weight_to_gal_rand(false);
            }

            query_pairs(
                &tree,
                &lhs_randoms,
                &mut binning.bins_mut()[pair_range.clone()],
                regions,
            )?;
            for angular_bin in &mut binning.bins_mut()[pair_range.clone()] {
                angular_bin.move_weight_to_rand_gal();
            }

            query_pairs(
                &random_tree,
                &lhs_randoms,
                &mut binning.bins_mut()[pair_range.clone()],
                regions,
            )?;
            for angular_bin in &mut binning.bins_mut()[pair_range.clone()] {
                angular_bin.move_weight_to_rand_rand();
            }
        }

        if k_rand > 0 {
            let factor = convert::f64_from_usize(k_rand).recip();
            for angular_bin in &mut binning.bins_mut()[pair_range] {
                angular_bin.rescale_rand(factor);
            }
        }
        Ok(())
    }

    /// Returns w(θ) for every bin, from whichever estimator each bin is
    /// assigned to.
    #[must_use]
    pub fn wtheta(&self) -> Vec<f64> {
        self.binning.bins().iter().map(AngularBin::wtheta).collect()
    }

    /// Returns the covariance matrix over the bins. With a consistent
    /// regionation this is the jack-knife covariance
    /// `(N−1)²/N² · Σ_r (w_r(a) − w̄(a)) (w_r(b) − w̄(b))`; otherwise only
    /// the diagonal is populated, with each bin's Poisson variance.
    #[must_use]
    pub fn covariance(&self) -> Array2<f64> {
        let bins = self.binning.bins();
        let n_bins = bins.len();
        let mut covariance = Array2::zeros((n_bins, n_bins));

        let n_region = bins.first().map_or(0, AngularBin::n_region);
        let consistent =
            n_region >= 2 && bins.iter().all(|angular_bin| angular_bin.n_region() == n_region);
        if consistent {
            let n = convert::f64_from_usize(n_region);
            let norm = (n - 1.0).powi(2) / n.powi(2);
            let replicas: Vec<Vec<f64>> = bins
                .iter()
                .map(|angular_bin| {
                    (0..n_region)
                        .map(|region| angular_bin.wtheta_region(region))
                        .collect()
                })
                .collect();
            let means: Vec<f64> = replicas
                .iter()
                .map(|w| w.iter().sum::<f64>() / n)
                .collect();

            for a in 0..n_bins {
                for b in a..n_bins {
                    let sum: f64 = (0..n_region)
                        .map(|r| (replicas[a][r] - means[a]) * (replicas[b][r] - means[b]))
                        .sum();
                    covariance[[a, b]] = norm * sum;
                    covariance[[b, a]] = norm * sum;
                }
            }
        } else {
            for (a, angular_bin) in bins.iter().enumerate() {
                covariance[[a, a]] = angular_bin.poisson_variance();
            }
        }
        covariance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::PixelMap;
    use crate::point::Position;

    fn small_survey(n: usize, seed: u64) -> (PixelMap, Vec<WeightedPoint>) {
        let map = PixelMap::from_cap(&Position::from_radec_deg(60.0, 0.0), 2.0, 16, 1.0).unwrap();
        let mut rng = Pcg64::seed_from_u64(seed);
        let catalog = map.generate_random_points(n, false, &mut rng);
        (map, catalog)
    }

    #[test]
    fn pixel_only_auto_correlation_runs() {
        let (map, catalog) = small_survey(400, 41);
        let binning = AngularBinning::log_spaced(0.3, 3.0, 3).unwrap();
        let mut engine = CorrelationEngine::new(binning, 1);

        engine.auto_correlate(&map, &catalog, 1, false).unwrap();

        assert!(engine.binning().pair_range().is_empty());
        for angular_bin in engine.binning().bins() {
            assert!(angular_bin.pixel_weight_den() > 0.0);
            assert!(angular_bin.wtheta().is_finite());
        }
    }

    #[test]
    fn pair_only_auto_correlation_runs() {
        let (map, catalog) = small_survey(400, 43);
        let mut binning = AngularBinning::log_spaced(0.3, 3.0, 3).unwrap();
        binning.use_only_pairs();
        let mut engine = CorrelationEngine::new(binning, 2);

        engine.auto_correlate(&map, &catalog, 2, false).unwrap();

        for angular_bin in engine.binning().bins() {
            assert!(angular_bin.uses_pairs());
            assert!(angular_bin.gal_gal() > 0.0);
            assert!(angular_bin.rand_rand() > 0.0);
            assert!(!angular_bin.flagged());
            assert!(angular_bin.wtheta().is_finite());
        }
    }

    #[test]
    fn covariance_falls_back_to_poisson_diagonal() {
        let (map, catalog) = small_survey(400, 47);
        let mut binning = AngularBinning::log_spaced(0.3, 3.0, 3).unwrap();
        binning.use_only_pairs();
        let mut engine = CorrelationEngine::new(binning, 3);
        engine.auto_correlate(&map, &catalog, 1, false).unwrap();

        let covariance = engine.covariance();
        let n = engine.binning().len();
        assert_eq!(covariance.dim(), (n, n));
        for a in 0..n {
            for b in 0..n {
                if a == b {
                    assert!(covariance[[a, a]] > 0.0);
                } else {
                    assert!(covariance[[a, b]].abs() < f64::EPSILON);
                }
            }
        }
    }

    #[test]
    fn cross_correlation_with_regions_runs() {
        let (mut map, lhs) = small_survey(300, 59);
        let rhs_map = map.clone();
        let mut rng = Pcg64::seed_from_u64(61);
        let rhs = rhs_map.generate_random_points(300, false, &mut rng);

        let binning = AngularBinning::log_spaced(0.3, 3.0, 3).unwrap();
        let mut engine = CorrelationEngine::new(binning, 6);
        let n_region = engine
            .cross_correlate_with_regions(&mut map, &rhs_map, &lhs, &rhs, 1, false, 4)
            .unwrap();

        assert_eq!(n_region, 4);
        assert!(engine.binning().pair_range().is_empty());
        for angular_bin in engine.binning().bins() {
            assert_eq!(angular_bin.n_region(), 4);
            assert!(angular_bin.pixel_weight_den() > 0.0);
            for region in 0..4 {
                assert!(angular_bin.wtheta_region(region).is_finite());
            }
        }
    }

    #[test]
    fn manual_break_survives_selection() {
        let (map, catalog) = small_survey(200, 53);
        let binning = AngularBinning::log_spaced(0.05, 3.0, 3).unwrap();
        let mut engine = CorrelationEngine::new(binning, 4);
        engine.set_max_resolution(32);

        engine.auto_correlate(&map, &catalog, 1, false).unwrap();
        assert_eq!(engine.binning().max_resolution(), 32);
        assert!(!engine.binning().pair_range().is_empty());
    }
}
