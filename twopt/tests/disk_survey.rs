#![allow(missing_docs)]

use rand::SeedableRng;
use rand_pcg::Pcg64;
use std::io::Cursor;
use twopt::bin::{sin2_deg, AngularBinning};
use twopt::engine::CorrelationEngine;
use twopt::map::{Footprint, PixelMap};
use twopt::output::{write_covariance, write_wtheta};
use twopt::point::{Position, WeightedPoint};

const DISK_CENTER_RA: f64 = 60.0;
const DISK_CENTER_DEC: f64 = 0.0;
const DISK_RADIUS: f64 = 2.0;
const MAP_RESOLUTION: u32 = 32;
const CATALOG_SIZE: usize = 4000;

fn disk() -> PixelMap {
    PixelMap::from_cap(
        &Position::from_radec_deg(DISK_CENTER_RA, DISK_CENTER_DEC),
        DISK_RADIUS,
        MAP_RESOLUTION,
        1.0,
    )
    .unwrap()
}

fn uniform_catalog(map: &PixelMap, n: usize, seed: u64) -> Vec<WeightedPoint> {
    let mut rng = Pcg64::seed_from_u64(seed);
    map.generate_random_points(n, false, &mut rng)
}

fn binning() -> AngularBinning {
    AngularBinning::log_spaced(0.01, 5.0, 4).unwrap()
}

#[test]
fn uniform_catalog_is_unclustered() {
    let map = disk();
    let catalog = uniform_catalog(&map, CATALOG_SIZE, 101);
    let mut engine = CorrelationEngine::new(binning(), 1);
    engine.auto_correlate(&map, &catalog, 2, false).unwrap();

    // the auto break keeps both estimators busy
    assert!(!engine.binning().pair_range().is_empty());
    assert!(!engine.binning().pixel_range().is_empty());

    for bin in &engine.binning().bins()[engine.binning().pair_range()] {
        assert!(bin.gal_gal() > 0.0);
        assert!(bin.rand_rand() > 0.0);
        assert!(!bin.flagged());
        // a uniform catalog stays within a generous shot-noise band
        let band = 10.0 / bin.gal_gal().sqrt() + 0.1;
        assert!(
            bin.wtheta().abs() < band,
            "pair bin at {}: w = {}",
            bin.theta(),
            bin.wtheta()
        );
    }
    for bin in &engine.binning().bins()[engine.binning().pixel_range()] {
        assert!(bin.pixel_weight_den() > 0.0);
        assert!(
            bin.wtheta().abs() < 0.25,
            "pixel bin at {}: w = {}",
            bin.theta(),
            bin.wtheta()
        );
    }

    // the result table has one row per bin, with the column count of the
    // bin's estimator
    let mut buffer = Vec::new();
    assert!(write_wtheta(engine.binning(), &mut buffer));
    let text = String::from_utf8(buffer).unwrap();
    assert_eq!(text.lines().count(), engine.binning().len());
    for (line, bin) in text.lines().zip(engine.binning().bins()) {
        let columns = line.split_whitespace().count();
        assert_eq!(columns, if bin.uses_pairs() { 6 } else { 4 });
    }
}

#[test]
fn injected_clump_produces_small_scale_clustering() {
    let map = disk();
    let mut catalog = uniform_catalog(&map, CATALOG_SIZE, 103);

    // pile 400 extra points into a 0.1 degree cap at the disk center
    let clump_map = PixelMap::from_cap(
        &Position::from_radec_deg(DISK_CENTER_RA, DISK_CENTER_DEC),
        0.1,
        MAP_RESOLUTION,
        1.0,
    )
    .unwrap();
    let mut rng = Pcg64::seed_from_u64(105);
    catalog.extend(clump_map.generate_random_points(400, false, &mut rng));

    let mut engine = CorrelationEngine::new(binning(), 5);
    engine.auto_correlate(&map, &catalog, 2, false).unwrap();

    // strong positive signal where the clump lives
    let small = engine.binning().find_bin(sin2_deg(0.12)).unwrap();
    assert!(
        engine.binning().bins()[small].wtheta() > 1.0,
        "w(0.12 deg) = {}",
        engine.binning().bins()[small].wtheta()
    );
    let tiny = engine.binning().find_bin(sin2_deg(0.03)).unwrap();
    assert!(engine.binning().bins()[tiny].wtheta() > 1.0);

    // scales well beyond the clump stay flat
    for bin in engine.binning().bins() {
        if bin.theta_min() >= 1.0 {
            assert!(
                bin.wtheta().abs() < 0.3,
                "bin at {}: w = {}",
                bin.theta(),
                bin.wtheta()
            );
        }
    }
}

#[test]
fn jackknife_regions_yield_symmetric_covariance() {
    let mut map = disk();
    let catalog = uniform_catalog(&map, CATALOG_SIZE, 107);
    let mut engine = CorrelationEngine::new(binning(), 7);
    let n_region = engine
        .auto_correlate_with_regions(&mut map, &catalog, 2, false, 10)
        .unwrap();

    assert_eq!(n_region, 10);
    assert_eq!(map.region_count(), 10);
    for bin in engine.binning().bins() {
        assert_eq!(bin.n_region(), 10);
        for region in 0..10 {
            assert!(bin.wtheta_region(region).is_finite());
        }
        assert!(bin.jackknife_variance() >= 0.0);
    }

    let covariance = engine.covariance();
    let n = engine.binning().len();
    assert_eq!(covariance.dim(), (n, n));
    for a in 0..n {
        assert!(covariance[[a, a]] >= 0.0);
        for b in 0..n {
            assert!((covariance[[a, b]] - covariance[[b, a]]).abs() < 1e-12);
        }
    }

    // region mode rows carry the jack-knife mean and error
    let mut buffer = Vec::new();
    assert!(write_wtheta(engine.binning(), &mut buffer));
    for line in String::from_utf8(buffer).unwrap().lines() {
        assert_eq!(line.split_whitespace().count(), 3);
    }

    // the covariance table is the full row-major triple list
    let mut buffer = Vec::new();
    assert!(write_covariance(engine.binning(), &covariance, &mut buffer));
    assert_eq!(String::from_utf8(buffer).unwrap().lines().count(), n * n);
}

#[test]
fn independent_catalogs_do_not_cross_correlate() {
    let map = disk();
    let lhs = uniform_catalog(&map, CATALOG_SIZE, 109);
    let rhs = uniform_catalog(&map, CATALOG_SIZE, 111);

    let mut engine = CorrelationEngine::new(binning(), 9);
    engine
        .cross_correlate(&map, &map, &lhs, &rhs, 2, false)
        .unwrap();

    for bin in engine.binning().bins() {
        assert!(
            bin.wtheta().abs() < 0.5,
            "bin at {}: w = {}",
            bin.theta(),
            bin.wtheta()
        );
    }
}

#[test]
fn identical_seeds_reproduce_the_measurement() {
    let map = disk();
    let catalog = uniform_catalog(&map, 1500, 113);

    let run = |seed| {
        let mut engine = CorrelationEngine::new(binning(), seed);
        engine.auto_correlate(&map, &catalog, 2, false).unwrap();
        engine.wtheta()
    };

    let first = run(21);
    let second = run(21);
    for (lhs, rhs) in first.iter().zip(&second) {
        assert!((lhs - rhs).abs() < 1e-9);
    }
}

#[test]
fn checkpoint_preserves_the_measurement() {
    let map = disk();
    let catalog = uniform_catalog(&map, 1500, 115);
    let mut engine = CorrelationEngine::new(binning(), 11);
    engine.auto_correlate(&map, &catalog, 1, false).unwrap();

    let mut buffer = Vec::new();
    engine.binning().write(&mut buffer).unwrap();
    let restored = AngularBinning::read(Cursor::new(buffer)).unwrap();

    assert_eq!(restored.len(), engine.binning().len());
    for (lhs, rhs) in engine.binning().bins().iter().zip(restored.bins()) {
        assert!(lhs.edges_approx_eq(rhs, 2));
        assert!((lhs.wtheta() - rhs.wtheta()).abs() < 1e-12 || lhs.wtheta().is_nan());
        assert!((lhs.gal_gal() - rhs.gal_gal()).abs() < f64::EPSILON);
        assert!((lhs.pixel_wtheta_num() - rhs.pixel_wtheta_num()).abs() < f64::EPSILON);
    }
}
