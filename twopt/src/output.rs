//! Plain-text result sinks for w(θ) tables and covariance matrices.

use crate::bin::AngularBinning;
use ndarray::Array2;
use std::io::Write;

// six significant digits
fn sig(value: f64) -> String {
    format!("{value:.5e}")
}

/// Writes one whitespace-separated row per bin. Regionated bins report the
/// mean leave-one-out estimate and its jack-knife error; otherwise pixel bins
/// report the estimator sums and pair bins the four pair counts. Returns
/// whether every row was written.
pub fn write_wtheta<W: Write>(binning: &AngularBinning, writer: &mut W) -> bool {
    for angular_bin in binning.bins() {
        let row = if angular_bin.n_region() > 0 {
            format!(
                "{}  {}  {}",
                sig(angular_bin.theta()),
                sig(angular_bin.mean_wtheta_regions()),
                sig(angular_bin.jackknife_variance().sqrt())
            )
        } else if angular_bin.uses_pixels() {
            format!(
                "{}  {}  {}  {}",
                sig(angular_bin.theta()),
                sig(angular_bin.wtheta()),
                sig(angular_bin.pixel_wtheta_num()),
                sig(angular_bin.pixel_weight_den())
            )
        } else {
            format!(
                "{}  {}  {}  {}  {}  {}",
                sig(angular_bin.theta()),
                sig(angular_bin.wtheta()),
                sig(angular_bin.gal_gal()),
                sig(angular_bin.gal_rand()),
                sig(angular_bin.rand_gal()),
                sig(angular_bin.rand_rand())
            )
        };
        if writeln!(writer, "{row}").is_err() {
            return false;
        }
    }
    true
}

/// Writes the covariance row-major, one `θ_a θ_b cov(a, b)` triple per line.
/// Returns whether every triple was written; a matrix that does not match
/// the binning writes nothing.
pub fn write_covariance<W: Write>(
    binning: &AngularBinning,
    covariance: &Array2<f64>,
    writer: &mut W,
) -> bool {
    if covariance.dim() != (binning.len(), binning.len()) {
        return false;
    }
    for (a, lhs) in binning.bins().iter().enumerate() {
        for (b, rhs) in binning.bins().iter().enumerate() {
            let row = format!(
                "{}  {}  {}",
                sig(lhs.theta()),
                sig(rhs.theta()),
                sig(covariance[[a, b]])
            );
            if writeln!(writer, "{row}").is_err() {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated_binning() -> AngularBinning {
        let mut binning = AngularBinning::log_spaced(0.01, 1.0, 2).unwrap();
        // split the bins over both estimators
        binning.apply_max_resolution(128);
        assert!(!binning.pair_range().is_empty());
        assert!(!binning.pixel_range().is_empty());
        for angular_bin in binning.bins_mut() {
            angular_bin.add_weight(10.0);
            angular_bin.move_weight_to_gal_gal();
            angular_bin.add_weight(9.0);
            angular_bin.move_weight_to_gal_rand(true);
            angular_bin.add_weight(8.0);
            angular_bin.move_weight_to_rand_rand();
            angular_bin.add_pixel_wtheta(4.0, 2.0);
        }
        binning
    }

    #[test]
    fn wtheta_rows_match_estimator_kind() {
        let binning = populated_binning();
        let mut buffer = Vec::new();
        assert!(write_wtheta(&binning, &mut buffer));

        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), binning.len());
        for (line, angular_bin) in lines.iter().zip(binning.bins()) {
            let columns = line.split_whitespace().count();
            if angular_bin.uses_pixels() {
                assert_eq!(columns, 4);
            } else {
                assert_eq!(columns, 6);
            }
            // six significant digits in scientific notation
            assert!(line.split_whitespace().all(|field| field.contains('e')));
        }
    }

    #[test]
    fn wtheta_rows_in_region_mode() {
        let mut binning = populated_binning();
        binning.init_regions(4);
        for angular_bin in binning.bins_mut() {
            for region in 0..4 {
                angular_bin.add_weight_regions(5.0, Some(region), Some(region));
            }
            angular_bin.move_weight_to_gal_gal();
            angular_bin.add_weight_regions(4.0, None, None);
            angular_bin.move_weight_to_rand_rand();
            angular_bin.add_pixel_wtheta_regions(4.0, 2.0, None, None);
        }

        let mut buffer = Vec::new();
        assert!(write_wtheta(&binning, &mut buffer));
        let text = String::from_utf8(buffer).unwrap();
        for line in text.lines() {
            assert_eq!(line.split_whitespace().count(), 3);
        }
    }

    #[test]
    fn covariance_triples() {
        let binning = populated_binning();
        let n = binning.len();
        let covariance = Array2::from_shape_fn((n, n), |(a, b)| if a == b { 1.0 } else { 0.1 });

        let mut buffer = Vec::new();
        assert!(write_covariance(&binning, &covariance, &mut buffer));
        let text = String::from_utf8(buffer).unwrap();
        assert_eq!(text.lines().count(), n * n);

        // mismatched dimensions are refused
        let bad = Array2::zeros((n + 1, n + 1));
        let mut buffer = Vec::new();
        assert!(!write_covariance(&binning, &bad, &mut buffer));
    }
}
