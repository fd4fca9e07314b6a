//! Scan point generation
//!
//! A [`CompoundGenerator`] nests [`LineGenerator`]s: the first generator is the
//! slowest axis and the last one varies fastest. Each point carries the demand
//! position of every axis, the lower/upper bounds the fastest axis sweeps
//! through while the detectors expose, and the duration of the point.
//!
//! ```text
//! CompoundGenerator [y: 0..1 (2), x: 1..2 (3)], duration 0.5
//!   point 0: y=0, x=1.0     point 3: y=1, x=1.0
//!   point 1: y=0, x=1.5     point 4: y=1, x=1.5
//!   point 2: y=0, x=2.0     point 5: y=1, x=2.0
//! ```
//!
//! [`RemainingPoints`] pairs a generator with how far through it a scan has
//! got, so a fly scan can resume from the middle.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{FlyError, FlyResult};

/// Evenly spaced positions along one axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineGenerator {
    /// Axis (motor) name
    pub axis: String,
    /// Engineering units of the positions
    pub units: String,
    /// First position
    pub start: f64,
    /// Last position
    pub stop: f64,
    /// Number of positions
    pub size: usize,
    /// Reverse direction on every other pass of the enclosing generators
    #[serde(default)]
    pub alternate: bool,
}

impl LineGenerator {
    /// Line from `start` to `stop` inclusive in `size` points.
    pub fn new(
        axis: impl Into<String>,
        units: impl Into<String>,
        start: f64,
        stop: f64,
        size: usize,
    ) -> Self {
        Self {
            axis: axis.into(),
            units: units.into(),
            start,
            stop,
            size,
            alternate: false,
        }
    }

    /// Snake back and forth instead of flying back to the start.
    pub fn alternating(mut self) -> Self {
        self.alternate = true;
        self
    }

    /// Distance between neighbouring positions.
    pub fn step(&self) -> f64 {
        if self.size < 2 {
            0.0
        } else {
            (self.stop - self.start) / (self.size - 1) as f64
        }
    }

    /// Position at `index`, which may be fractional for bounds.
    pub fn position(&self, index: f64) -> f64 {
        self.start + self.step() * index
    }
}

/// Single point of a scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    /// Index within the generator
    pub index: usize,
    /// Demand position of every axis
    pub positions: BTreeMap<String, f64>,
    /// Position at the start of the point
    pub lower: BTreeMap<String, f64>,
    /// Position at the end of the point
    pub upper: BTreeMap<String, f64>,
    /// Exposure duration in seconds, 0 if not fixed
    pub duration: f64,
}

/// Consecutive points laid out axis by axis.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Points {
    /// Index of each point within the generator
    pub indexes: Vec<usize>,
    /// Positions per axis
    pub positions: BTreeMap<String, Vec<f64>>,
    /// Lower bounds per axis
    pub lower: BTreeMap<String, Vec<f64>>,
    /// Upper bounds per axis
    pub upper: BTreeMap<String, Vec<f64>>,
    /// Duration of each point
    pub duration: Vec<f64>,
}

impl Points {
    /// Number of points.
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    /// True if there are no points.
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    fn push(&mut self, point: Point) {
        self.indexes.push(point.index);
        for (axis, value) in point.positions {
            self.positions.entry(axis).or_default().push(value);
        }
        for (axis, value) in point.lower {
            self.lower.entry(axis).or_default().push(value);
        }
        for (axis, value) in point.upper {
            self.upper.entry(axis).or_default().push(value);
        }
        self.duration.push(point.duration);
    }
}

/// Nested line generators making up a full scan.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompoundGenerator {
    /// Generators from slowest to fastest
    pub generators: Vec<LineGenerator>,
    /// Fixed duration of every point in seconds
    #[serde(default)]
    pub duration: Option<f64>,
}

impl CompoundGenerator {
    /// Scan over `generators` with a fixed point `duration`.
    pub fn new(generators: Vec<LineGenerator>, duration: f64) -> Self {
        Self {
            generators,
            duration: Some(duration),
        }
    }

    /// Check the generator describes a scan that can be run.
    pub fn validate(&self) -> FlyResult<()> {
        if self.generators.is_empty() {
            return Err(FlyError::Points("no generators to scan".into()));
        }
        let mut seen = BTreeSet::new();
        for generator in &self.generators {
            if generator.size == 0 {
                return Err(FlyError::Points(format!(
                    "generator for axis '{}' has no points",
                    generator.axis
                )));
            }
            if !seen.insert(generator.axis.as_str()) {
                return Err(FlyError::Points(format!(
                    "axis '{}' appears in more than one generator",
                    generator.axis
                )));
            }
        }
        if let Some(duration) = self.duration {
            if duration.is_nan() || duration <= 0.0 {
                return Err(FlyError::Points(format!(
                    "duration must be positive, got {duration}"
                )));
            }
        }
        Ok(())
    }

    /// Total number of points.
    pub fn size(&self) -> usize {
        self.generators.iter().map(|g| g.size).product()
    }

    /// Axis names from slowest to fastest.
    pub fn axes(&self) -> Vec<String> {
        self.generators.iter().map(|g| g.axis.clone()).collect()
    }

    /// Units of each axis.
    pub fn units(&self) -> BTreeMap<String, String> {
        self.generators
            .iter()
            .map(|g| (g.axis.clone(), g.units.clone()))
            .collect()
    }

    /// Point `n` of the scan.
    pub fn get_point(&self, n: usize) -> FlyResult<Point> {
        let size = self.size();
        if n >= size {
            return Err(FlyError::Points(format!(
                "point {n} requested from a scan of {size} points"
            )));
        }

        let mut point = Point {
            index: n,
            positions: BTreeMap::new(),
            lower: BTreeMap::new(),
            upper: BTreeMap::new(),
            duration: self.duration.unwrap_or(0.0),
        };
        let fastest = self.generators.len().saturating_sub(1);
        let mut inner = 1;
        for (i, generator) in self.generators.iter().enumerate().rev() {
            let mut index = (n / inner) % generator.size;
            let pass = n / (inner * generator.size);
            let reversed = generator.alternate && pass % 2 == 1;
            if reversed {
                index = generator.size - 1 - index;
            }
            let position = generator.position(index as f64);
            let (lower, upper) = if i == fastest {
                let half = if reversed { 0.5 } else { -0.5 };
                (
                    generator.position(index as f64 + half),
                    generator.position(index as f64 - half),
                )
            } else {
                (position, position)
            };
            point.positions.insert(generator.axis.clone(), position);
            point.lower.insert(generator.axis.clone(), lower);
            point.upper.insert(generator.axis.clone(), upper);
            inner *= generator.size;
        }
        Ok(point)
    }

    /// Points `start..end` of the scan.
    pub fn get_points(&self, start: usize, end: usize) -> FlyResult<Points> {
        if start > end || end > self.size() {
            return Err(FlyError::Points(format!(
                "points {start}..{end} requested from a scan of {} points",
                self.size()
            )));
        }
        let mut points = Points::default();
        for n in start..end {
            points.push(self.get_point(n)?);
        }
        Ok(points)
    }

    /// JSON description, as stored in the device configuration.
    pub fn to_json(&self) -> FlyResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A generator together with how many of its points have been done.
#[derive(Debug, Clone)]
pub struct RemainingPoints {
    generator: Arc<CompoundGenerator>,
    completed: usize,
}

impl RemainingPoints {
    /// Points of `generator` after the first `completed`.
    pub fn new(generator: Arc<CompoundGenerator>, completed: usize) -> Self {
        Self {
            generator,
            completed,
        }
    }

    /// The generator being worked through.
    pub fn generator(&self) -> &Arc<CompoundGenerator> {
        &self.generator
    }

    /// Points handed out so far, including those done before this was made.
    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Next point, without consuming it.
    pub fn peek_point(&self) -> FlyResult<Point> {
        self.generator.get_point(self.completed)
    }

    /// Up to `num` further points, consuming them.
    pub fn get_points(&mut self, num: usize) -> FlyResult<Points> {
        let end = (self.completed + num).min(self.generator.size());
        let points = self.generator.get_points(self.completed, end)?;
        self.completed = end;
        Ok(points)
    }

    /// Duration shared by every point. Errors for variable duration scans.
    pub fn constant_duration(&self) -> FlyResult<f64> {
        self.generator
            .duration
            .ok_or_else(|| FlyError::Points("scan point generator has variable duration".into()))
    }

    /// Points not yet handed out.
    pub fn remaining(&self) -> usize {
        self.generator.size().saturating_sub(self.completed)
    }

    /// Total points in the scan.
    pub fn size(&self) -> usize {
        self.generator.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> CompoundGenerator {
        CompoundGenerator::new(
            vec![
                LineGenerator::new("t1y", "mm", 0.0, 1.0, 2),
                LineGenerator::new("t1x", "mm", 1.0, 2.0, 3),
            ],
            0.5,
        )
    }

    #[test]
    fn test_compound_ordering() {
        let g = grid();
        assert_eq!(g.size(), 6);
        assert_eq!(g.axes(), vec!["t1y", "t1x"]);

        let p = g.get_point(4).unwrap();
        assert_eq!(p.positions["t1y"], 1.0);
        assert_eq!(p.positions["t1x"], 1.5);
        assert_eq!(p.duration, 0.5);
        // Only the fastest axis sweeps
        assert_eq!(p.lower["t1x"], 1.25);
        assert_eq!(p.upper["t1x"], 1.75);
        assert_eq!(p.lower["t1y"], 1.0);
        assert_eq!(p.upper["t1y"], 1.0);
    }

    #[test]
    fn test_get_points_slices() {
        let points = grid().get_points(2, 5).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points.indexes, vec![2, 3, 4]);
        assert_eq!(points.positions["t1x"], vec![2.0, 1.0, 1.5]);
        assert_eq!(points.positions["t1y"], vec![0.0, 1.0, 1.0]);
        assert_eq!(points.duration, vec![0.5; 3]);
        assert!(grid().get_points(4, 7).is_err());
        assert!(grid().get_point(6).is_err());
    }

    #[test]
    fn test_alternating_inner_axis() {
        let g = CompoundGenerator::new(
            vec![
                LineGenerator::new("y", "mm", 0.0, 1.0, 2),
                LineGenerator::new("x", "mm", 0.0, 2.0, 3).alternating(),
            ],
            0.1,
        );
        let xs = g.get_points(0, 6).unwrap().positions["x"].clone();
        assert_eq!(xs, vec![0.0, 1.0, 2.0, 2.0, 1.0, 0.0]);
        let back = g.get_point(4).unwrap();
        assert_eq!(back.lower["x"], 1.5);
        assert_eq!(back.upper["x"], 0.5);
    }

    #[test]
    fn test_single_point_line() {
        let line = LineGenerator::new("x", "mm", 3.0, 5.0, 1);
        assert_eq!(line.step(), 0.0);
        assert_eq!(line.position(0.0), 3.0);
    }

    #[test]
    fn test_validation() {
        assert!(grid().validate().is_ok());
        let dup = CompoundGenerator::new(
            vec![
                LineGenerator::new("x", "mm", 0.0, 1.0, 2),
                LineGenerator::new("x", "mm", 0.0, 1.0, 2),
            ],
            0.1,
        );
        assert!(dup.validate().is_err());
        let empty = CompoundGenerator::new(vec![LineGenerator::new("x", "mm", 0.0, 1.0, 0)], 0.1);
        assert!(empty.validate().is_err());
        let bad_duration =
            CompoundGenerator::new(vec![LineGenerator::new("x", "mm", 0.0, 1.0, 2)], -1.0);
        assert!(bad_duration.validate().is_err());
    }

    #[test]
    fn test_no_generators_rejected() {
        let none = CompoundGenerator::new(vec![], 0.1);
        assert_eq!(none.size(), 1);
        assert!(matches!(none.validate(), Err(FlyError::Points(_))));
        assert!(CompoundGenerator::default().validate().is_err());
    }

    #[test]
    fn test_json_roundtrip_preserves_generator() {
        let g = grid();
        let json = g.to_json().unwrap();
        let back: CompoundGenerator = serde_json::from_str(&json).unwrap();
        assert_eq!(back, g);
    }

    #[test]
    fn test_remaining_points() {
        let mut remaining = RemainingPoints::new(Arc::new(grid()), 1);
        assert_eq!(remaining.remaining(), 5);
        assert_eq!(remaining.peek_point().unwrap().index, 1);
        let batch = remaining.get_points(4).unwrap();
        assert_eq!(batch.indexes, vec![1, 2, 3, 4]);
        assert_eq!(remaining.remaining(), 1);
        let last = remaining.get_points(4).unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(remaining.remaining(), 0);
        assert_eq!(remaining.constant_duration().unwrap(), 0.5);

        let variable = RemainingPoints::new(Arc::new(CompoundGenerator::default()), 0);
        assert!(variable.constant_duration().is_err());
    }
}
