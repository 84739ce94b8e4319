//! Hierarchical spatial index over weighted points, answering weighted
//! pair-count queries for angular annuli.

use crate::bin::AngularBin;
use crate::error::{Error, Result};
use crate::map::Footprint;
use crate::pixel::{self, PixelId, MAX_PIXEL_RESOLUTION};
use crate::point::WeightedPoint;
use rustc_hash::FxHashMap;

/// Points per leaf before it splits into children.
pub const DEFAULT_NODE_CAPACITY: usize = 200;

enum Contents {
    Leaf(Vec<WeightedPoint>),
    Nodes(Vec<Node>),
}

struct Node {
    pixel: PixelId,
    center: crate::point::Position,
    bound_radius: f64,
    weight: f64,
    count: usize,
    region: Option<u32>,
    contents: Contents,
}

impl Node {
    fn empty(pixel: PixelId) -> Self {
        Self {
            pixel,
            center: pixel.center(),
            bound_radius: pixel.bound_radius_deg(),
            weight: 0.0,
            count: 0,
            region: None,
            contents: Contents::Leaf(Vec::new()),
        }
    }

    fn insert(&mut self, point: WeightedPoint, capacity: usize) {
        self.weight += point.weight;
        self.count += 1;

        if let Contents::Leaf(points) = &mut self.contents {
            points.push(point);
            let needs_split =
                points.len() > capacity && self.pixel.resolution() < MAX_PIXEL_RESOLUTION;
            if needs_split {
                self.split(capacity);
            }
            return;
        }
        self.insert_into_children(point, capacity);
    }

    fn split(&mut self, capacity: usize) {
        let points = match std::mem::replace(&mut self.contents, Contents::Nodes(Vec::new())) {
            Contents::Leaf(points) => points,
            Contents::Nodes(_) => unreachable!(),
        };
        for point in points {
            self.insert_into_children(point, capacity);
        }
    }

    fn insert_into_children(&mut self, point: WeightedPoint, capacity: usize) {
        let id = PixelId::from_position(self.pixel.resolution() * 2, &point.position);
        let region = self.region;
        let Contents::Nodes(children) = &mut self.contents else {
            unreachable!()
        };
        if let Some(child) = children.iter_mut().find(|child| child.pixel == id) {
            child.insert(point, capacity);
        } else {
            let mut child = Self::empty(id);
            child.region = region;
            child.insert(point, capacity);
            children.push(child);
        }
    }

    fn stamp_regions(&mut self, footprint: &impl Footprint) {
        self.region = footprint.region(self.pixel);
        match &mut self.contents {
            Contents::Leaf(points) => {
                for point in points {
                    point.region = footprint.region_of(&point.position);
                }
            }
            Contents::Nodes(children) => {
                for child in children {
                    child.stamp_regions(footprint);
                }
            }
        }
    }

    fn accumulate(&self, point: &WeightedPoint, annulus: &Annulus, sum: &mut f64) {
        let separation = self.center.angular_distance_deg(&point.position);
        let near = (separation - self.bound_radius).max(0.0);
        let far = separation + self.bound_radius;
        if far < annulus.theta_min || near >= annulus.theta_max {
            return;
        }
        if near >= annulus.theta_min && far < annulus.theta_max {
            // every point in this node is inside the annulus
            *sum += point.weight * self.weight;
            return;
        }
        match &self.contents {
            Contents::Leaf(points) => {
                for other in points {
                    let s2 = point.position.sin2_angular_distance(&other.position);
                    if s2 >= annulus.sin2_theta_min && s2 < annulus.sin2_theta_max {
                        *sum += point.weight * other.weight;
                    }
                }
            }
            Contents::Nodes(children) => {
                for child in children {
                    child.accumulate(point, annulus, sum);
                }
            }
        }
    }

    fn accumulate_regions(&self, point: &WeightedPoint, annulus: &Annulus, bin: &mut AngularBin) {
        let separation = self.center.angular_distance_deg(&point.position);
        let near = (separation - self.bound_radius).max(0.0);
        let far = separation + self.bound_radius;
        if far < annulus.theta_min || near >= annulus.theta_max {
            return;
        }
        if near >= annulus.theta_min && far < annulus.theta_max && self.region.is_some() {
            bin.add_weight_regions(point.weight * self.weight, point.region, self.region);
            return;
        }
        match &self.contents {
            Contents::Leaf(points) => {
                for other in points {
                    let s2 = point.position.sin2_angular_distance(&other.position);
                    if s2 >= annulus.sin2_theta_min && s2 < annulus.sin2_theta_max {
                        bin.add_weight_regions(
                            point.weight * other.weight,
                            point.region,
                            other.region,
                        );
                    }
                }
            }
            Contents::Nodes(children) => {
                for child in children {
                    child.accumulate_regions(point, annulus, bin);
                }
            }
        }
    }
}

struct Annulus {
    theta_min: f64,
    theta_max: f64,
    sin2_theta_min: f64,
    sin2_theta_max: f64,
}

impl Annulus {
    fn from_bin(bin: &AngularBin) -> Self {
        Self {
            theta_min: bin.theta_min(),
            theta_max: bin.theta_max(),
            sin2_theta_min: bin.sin2_theta_min(),
            sin2_theta_max: bin.sin2_theta_max(),
        }
    }
}

/// Hierarchical index over weighted points. Base nodes live at a fixed
/// resolution; leaves exceeding the bucket capacity split into up to four
/// children one resolution finer.
pub struct PointIndex {
    resolution: u32,
    capacity: usize,
    nodes: FxHashMap<PixelId, Node>,
    points: usize,
    weight: f64,
    n_region: usize,
}

impl PointIndex {
    /// Constructor with the default bucket capacity.
    ///
    /// # Panics
    ///
    /// Panics for an unsupported resolution.
    #[must_use]
    pub fn new(resolution: u32) -> Self {
        Self::with_capacity(resolution, DEFAULT_NODE_CAPACITY)
    }

    /// Constructor with an explicit bucket capacity.
    ///
    /// # Panics
    ///
    /// Panics for an unsupported resolution or a zero capacity.
    #[must_use]
    pub fn with_capacity(resolution: u32, capacity: usize) -> Self {
        assert!(pixel::valid_resolution(resolution));
        assert!(capacity > 0);

        Self {
            resolution,
            capacity,
            nodes: FxHashMap::default(),
            points: 0,
            weight: 0.0,
            n_region: 0,
        }
    }

    /// Returns the base-node resolution.
    #[must_use]
    pub const fn resolution(&self) -> u32 {
        self.resolution
    }

    /// Returns the number of indexed points.
    #[must_use]
    pub const fn points(&self) -> usize {
        self.points
    }

    /// Returns the summed weight of the indexed points.
    #[must_use]
    pub const fn total_weight(&self) -> f64 {
        self.weight
    }

    /// Returns the number of attached regions, zero when none.
    #[must_use]
    pub const fn n_region(&self) -> usize {
        self.n_region
    }

    /// Inserts a point, returning `false` when it cannot be placed.
    pub fn add(&mut self, point: &WeightedPoint) -> bool {
        if !point.weight.is_finite() {
            return false;
        }
        let id = PixelId::from_position(self.resolution, &point.position);
        self.nodes
            .entry(id)
            .or_insert_with(|| Node::empty(id))
            .insert(point.clone(), self.capacity);
        self.points += 1;
        self.weight += point.weight;
        true
    }

    /// Copies region labels from the footprint into every node and every
    /// stored point.
    ///
    /// # Errors
    ///
    /// Returns an error when the footprint has no regions.
    pub fn initialize_regions(&mut self, footprint: &impl Footprint) -> Result<()> {
        if footprint.region_count() == 0 {
            return Err(Error::NoRegions);
        }
        self.n_region = footprint.region_count();
        for node in self.nodes.values_mut() {
            node.stamp_regions(footprint);
        }
        Ok(())
    }

    /// Accumulates the weighted pair count between `catalog` and the indexed
    /// points, for separations within the bin's annulus, into the bin's
    /// scratch weight. Nodes entirely inside the annulus contribute their
    /// cached weight without descent.
    pub fn find_weighted_pairs(&self, catalog: &[WeightedPoint], bin: &mut AngularBin) {
        let annulus = Annulus::from_bin(bin);
        let mut sum = 0.0;
        for point in catalog {
            for node in self.nodes.values() {
                node.accumulate(point, &annulus, &mut sum);
            }
        }
        bin.add_weight(sum);
    }

    /// Region-aware variant of [`Self::find_weighted_pairs`], filling the
    /// leave-one-out replicas of the scratch weight.
    ///
    /// # Errors
    ///
    /// Returns an error when regions are missing or the layouts disagree.
    pub fn find_weighted_pairs_with_regions(
        &self,
        catalog: &[WeightedPoint],
        bin: &mut AngularBin,
    ) -> Result<()> {
        if self.n_region == 0 {
            return Err(Error::NoRegions);
        }
        if bin.n_region() != self.n_region {
            return Err(Error::General(format!(
                "bin has {} region replicas, index has {}",
                bin.n_region(),
                self.n_region
            )));
        }

        let annulus = Annulus::from_bin(bin);
        for point in catalog {
            for node in self.nodes.values() {
                node.accumulate_regions(point, &annulus, bin);
            }
        }
        Ok(())
    }
}
