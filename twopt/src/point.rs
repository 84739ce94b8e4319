//! Positions on the unit sphere and weighted catalog points.

use serde::{Deserialize, Serialize};

/// A direction on the unit sphere, stored as a unit vector.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Position {
    x: f64,
    y: f64,
    z: f64,
}

impl Position {
    /// Constructor from equatorial coordinates in degrees. Right ascension is
    /// reduced into `[0, 360)`, declination must lie in `[-90, 90]`.
    ///
    /// # Panics
    ///
    /// Panics if `dec_deg` lies outside `[-90, 90]`.
    #[must_use]
    pub fn from_radec_deg(ra_deg: f64, dec_deg: f64) -> Self {
        assert!((-90.0..=90.0).contains(&dec_deg));

        let ra = ra_deg.rem_euclid(360.0).to_radians();
        let dec = dec_deg.to_radians();
        let cos_dec = dec.cos();

        Self {
            x: cos_dec * ra.cos(),
            y: cos_dec * ra.sin(),
            z: dec.sin(),
        }
    }

    /// Constructor from an azimuth in degrees and `z = sin(dec)`.
    ///
    /// # Panics
    ///
    /// Panics if `z` lies outside `[-1, 1]`.
    #[must_use]
    pub fn from_ra_z(ra_deg: f64, z: f64) -> Self {
        assert!((-1.0..=1.0).contains(&z));

        let ra = ra_deg.rem_euclid(360.0).to_radians();
        let sin_theta = (1.0 - z * z).max(0.0).sqrt();

        Self {
            x: sin_theta * ra.cos(),
            y: sin_theta * ra.sin(),
            z,
        }
    }

    /// Constructor from an arbitrary non-zero vector, which is normalized.
    ///
    /// # Panics
    ///
    /// Panics if the vector has zero or non-finite norm.
    #[must_use]
    pub fn from_vector(x: f64, y: f64, z: f64) -> Self {
        let norm = x.hypot(y).hypot(z);
        assert!(norm.is_finite() && norm > 0.0);

        Self {
            x: x / norm,
            y: y / norm,
            z: z / norm,
        }
    }

    /// Returns the right ascension in degrees, in `[0, 360)`.
    #[must_use]
    pub fn ra_deg(&self) -> f64 {
        self.y.atan2(self.x).to_degrees().rem_euclid(360.0)
    }

    /// Returns the declination in degrees.
    #[must_use]
    pub fn dec_deg(&self) -> f64 {
        self.z.clamp(-1.0, 1.0).asin().to_degrees()
    }

    /// Returns the `z` component, `sin(dec)`.
    #[must_use]
    pub const fn z(&self) -> f64 {
        self.z
    }

    /// Scalar product with another direction.
    #[must_use]
    pub fn dot(&self, other: &Self) -> f64 {
        self.z
            .mul_add(other.z, self.x.mul_add(other.x, self.y * other.y))
    }

    /// Returns `sin²θ` of the angular separation to `other` for separations
    /// up to 90 degrees, and `2 − sin²θ` beyond. The reflection keeps the
    /// value monotone in the separation, so annulus tests against `sin²`
    /// bounds below 90 degrees never alias far pairs; it is cheap because it
    /// avoids inverse trigonometry.
    #[must_use]
    pub fn sin2_angular_distance(&self, other: &Self) -> f64 {
        let cos_theta = self.dot(other);
        let sin2 = (1.0 - cos_theta * cos_theta).max(0.0);
        if cos_theta < 0.0 {
            2.0 - sin2
        } else {
            sin2
        }
    }

    /// Returns the angular separation to `other` in degrees.
    #[must_use]
    pub fn angular_distance_deg(&self, other: &Self) -> f64 {
        self.dot(other).clamp(-1.0, 1.0).acos().to_degrees()
    }
}

/// A catalog entry: a direction together with a weight and, once regionation
/// has been initialized, the region the point falls into.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct WeightedPoint {
    /// Direction of the point.
    pub position: Position,
    /// Statistical weight.
    pub weight: f64,
    /// Region label, `None` until regions are attached.
    pub region: Option<u32>,
}

impl WeightedPoint {
    /// Constructor from equatorial coordinates in degrees.
    #[must_use]
    pub fn new(ra_deg: f64, dec_deg: f64, weight: f64) -> Self {
        Self::from_position(Position::from_radec_deg(ra_deg, dec_deg), weight)
    }

    /// Constructor from a [`Position`].
    #[must_use]
    pub const fn from_position(position: Position, weight: f64) -> Self {
        Self {
            position,
            weight,
            region: None,
        }
    }

    /// Returns the same point carrying the given region label.
    #[must_use]
    pub fn with_region(mut self, region: Option<u32>) -> Self {
        self.region = region;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn radec_roundtrip() {
        let pos = Position::from_radec_deg(123.456, -54.321);

        assert_approx_eq!(f64, pos.ra_deg(), 123.456, epsilon = 1e-12);
        assert_approx_eq!(f64, pos.dec_deg(), -54.321, epsilon = 1e-12);

        // negative right ascensions are reduced into [0, 360)
        let pos = Position::from_radec_deg(-90.0, 10.0);
        assert_approx_eq!(f64, pos.ra_deg(), 270.0, epsilon = 1e-12);
    }

    #[test]
    fn angular_distances() {
        let north = Position::from_radec_deg(0.0, 90.0);
        let equator = Position::from_radec_deg(0.0, 0.0);
        let anti = Position::from_radec_deg(180.0, 0.0);

        assert_approx_eq!(f64, north.angular_distance_deg(&equator), 90.0);
        assert_approx_eq!(f64, equator.angular_distance_deg(&anti), 180.0);
        assert_approx_eq!(f64, north.sin2_angular_distance(&equator), 1.0);

        // symmetry
        let a = Position::from_radec_deg(10.0, 20.0);
        let b = Position::from_radec_deg(11.0, 21.0);
        assert_approx_eq!(
            f64,
            a.angular_distance_deg(&b),
            b.angular_distance_deg(&a)
        );

        // beyond 90 degrees the value keeps growing instead of folding back
        let far = Position::from_radec_deg(170.0, 0.0);
        assert!(equator.sin2_angular_distance(&far) > 1.0);

        // one-degree separation along the equator
        let c = Position::from_radec_deg(1.0, 0.0);
        assert_approx_eq!(
            f64,
            equator.angular_distance_deg(&c),
            1.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn from_vector_normalizes() {
        let pos = Position::from_vector(0.0, 0.0, 2.5);
        assert_approx_eq!(f64, pos.z(), 1.0);
        assert_approx_eq!(f64, pos.dec_deg(), 90.0);
    }
}
