//! Synthetic world, map and scan matcher for driving the filter end to end.
//!
//! This module provides:
//! - [Room]: a polygonal world made of wall segments, and ray casting against it
//! - [LaserScan]: range readings simulated from a pose with Gaussian range noise
//! - [sample_odometry]: noisy odometry used as the motion model
//! - [PointGridMap]: a sparse occupancy map counting endpoint hits per cell
//! - [GridScanMatcher]: a hill-climbing [ScanMatcher] over [PointGridMap]
//! - [Simulation]: a robot driving a closed loop in a room, producing ground truth and scans
//! - [ScenarioRunner]: runs the filter against a [Simulation] and reports its accuracy
//!
//! None of this is meant to be a production mapper. It is deliberately simple so the filter's behavior can be
//! checked against ground truth.
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;

use log::trace;
use nalgebra::{Point2, Vector2};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::Pose2D;
use crate::config::{FilterConfig, read_config_file, write_config_file};
use crate::error::{Result, SlamError};
use crate::filter::{GridSlamFilter, StepOutcome};
use crate::matcher::{MatchResult, ScanMatcher};

/// A wall segment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Wall {
    pub start: Point2<f64>,
    pub end: Point2<f64>,
}
impl Wall {
    pub fn new(start: Point2<f64>, end: Point2<f64>) -> Self {
        Wall { start, end }
    }
    /// Distance along the unit ray `origin + t * direction` to this wall, if the ray hits it.
    pub fn ray_intersection(&self, origin: &Point2<f64>, direction: &Vector2<f64>) -> Option<f64> {
        let edge = self.end - self.start;
        let denom = direction.perp(&edge);
        if denom.abs() < 1e-12 {
            return None;
        }
        let offset = self.start - origin;
        let t = offset.perp(&edge) / denom;
        let s = offset.perp(direction) / denom;
        (t > 0.0 && (0.0..=1.0).contains(&s)).then_some(t)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Room {
    pub walls: Vec<Wall>,
}
impl Room {
    /// Axis-aligned rectangular room with its lower left corner at the origin.
    pub fn rectangle(width: f64, height: f64) -> Self {
        let mut room = Room::default();
        room.add_box(Point2::new(0.0, 0.0), Point2::new(width, height));
        room
    }
    /// Add the four walls of an axis-aligned box.
    pub fn add_box(&mut self, min: Point2<f64>, max: Point2<f64>) {
        let corners = [
            min,
            Point2::new(max.x, min.y),
            max,
            Point2::new(min.x, max.y),
        ];
        for i in 0..4 {
            self.walls.push(Wall::new(corners[i], corners[(i + 1) % 4]));
        }
    }
    /// Distance from `origin` along `angle` to the nearest wall, or `max_range` when nothing is hit.
    pub fn raycast(&self, origin: &Point2<f64>, angle: f64, max_range: f64) -> f64 {
        let direction = Vector2::new(angle.cos(), angle.sin());
        self.walls
            .iter()
            .filter_map(|wall| wall.ray_intersection(origin, &direction))
            .fold(max_range, f64::min)
    }
}

/// Planar laser range finder model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LidarConfig {
    pub beams: usize,
    /// Total field of view in radians, centered on the heading.
    pub field_of_view: f64,
    pub max_range: f64,
    /// Standard deviation of the range noise in meters.
    pub range_sigma: f64,
}
impl Default for LidarConfig {
    fn default() -> Self {
        LidarConfig {
            beams: 90,
            field_of_view: std::f64::consts::TAU,
            max_range: 8.0,
            range_sigma: 0.01,
        }
    }
}

/// One laser scan. Beam angles are relative to the robot heading.
#[derive(Clone, Debug, PartialEq)]
pub struct LaserScan {
    pub angles: Vec<f64>,
    pub ranges: Vec<f64>,
    pub max_range: f64,
}
impl LaserScan {
    /// Simulate a scan of `room` taken from `pose`.
    pub fn simulate<G: Rng>(room: &Room, pose: &Pose2D, config: &LidarConfig, rng: &mut G) -> Result<Self> {
        let noise = Normal::new(0.0, config.range_sigma)
            .map_err(|e| SlamError::Config(format!("invalid range noise: {e}")))?;
        let origin = Point2::new(pose.x, pose.y);
        let beams = config.beams.max(1);
        let increment = config.field_of_view / beams as f64;
        let start = -config.field_of_view / 2.0;
        let mut angles = Vec::with_capacity(beams);
        let mut ranges = Vec::with_capacity(beams);
        for i in 0..beams {
            let angle = start + i as f64 * increment;
            let range = room.raycast(&origin, pose.theta + angle, config.max_range);
            let measured = if range < config.max_range {
                (range + noise.sample(rng)).clamp(0.0, config.max_range)
            } else {
                config.max_range
            };
            angles.push(angle);
            ranges.push(measured);
        }
        Ok(LaserScan {
            angles,
            ranges,
            max_range: config.max_range,
        })
    }
    /// Beam endpoints in the sensor frame, skipping max-range readings.
    pub fn points(&self) -> Vec<Point2<f64>> {
        self.angles
            .iter()
            .zip(&self.ranges)
            .filter(|&(_, &r)| r > 0.0 && r < self.max_range)
            .map(|(a, r)| Point2::new(r * a.cos(), r * a.sin()))
            .collect()
    }
}

/// Odometry noise, applied per unit of motion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OdometryNoise {
    /// Translation standard deviation per meter traveled.
    pub translation: f64,
    /// Rotation standard deviation per radian turned.
    pub rotation: f64,
    /// Rotation standard deviation per meter traveled.
    pub drift: f64,
}
impl Default for OdometryNoise {
    fn default() -> Self {
        OdometryNoise {
            translation: 0.05,
            rotation: 0.02,
            drift: 0.01,
        }
    }
}

/// Sample a pose prior by applying a noisy version of the body-frame motion `delta` to `pose`.
pub fn sample_odometry<G: Rng>(
    pose: &Pose2D,
    delta: &Pose2D,
    noise: &OdometryNoise,
    rng: &mut G,
) -> Pose2D {
    let distance = delta.x.hypot(delta.y);
    let turn = delta.theta.abs();
    let mut gaussian = |sigma: f64| match Normal::new(0.0, sigma) {
        Ok(normal) if sigma > 0.0 => normal.sample(&mut *rng),
        _ => 0.0,
    };
    let noisy = Pose2D::new(
        delta.x + gaussian(noise.translation * distance),
        delta.y + gaussian(noise.translation * distance),
        delta.theta + gaussian(noise.rotation * turn + noise.drift * distance),
    );
    pose.compose(&noisy)
}

/// Integer cell coordinates.
pub type Cell = (i32, i32);

/// Sparse occupancy map that counts scan endpoint hits per cell.
///
/// The active area is the set of cells the next registration will touch; it is owned by the map so that every
/// particle tracks its own.
#[derive(Clone, Debug, PartialEq)]
pub struct PointGridMap {
    resolution: f64,
    hits: HashMap<Cell, u32>,
    active_area: Option<HashSet<Cell>>,
    scans: usize,
}
impl PointGridMap {
    pub fn new(resolution: f64) -> Self {
        PointGridMap {
            resolution,
            hits: HashMap::new(),
            active_area: None,
            scans: 0,
        }
    }
    pub fn resolution(&self) -> f64 {
        self.resolution
    }
    pub fn cell(&self, point: &Point2<f64>) -> Cell {
        (
            (point.x / self.resolution).floor() as i32,
            (point.y / self.resolution).floor() as i32,
        )
    }
    pub fn cell_center(&self, cell: Cell) -> Point2<f64> {
        Point2::new(
            (cell.0 as f64 + 0.5) * self.resolution,
            (cell.1 as f64 + 0.5) * self.resolution,
        )
    }
    pub fn is_occupied(&self, cell: Cell) -> bool {
        self.hits.contains_key(&cell)
    }
    pub fn hits(&self, cell: Cell) -> u32 {
        self.hits.get(&cell).copied().unwrap_or(0)
    }
    pub fn occupied_cells(&self) -> usize {
        self.hits.len()
    }
    /// Number of scans registered into the map.
    pub fn scans(&self) -> usize {
        self.scans
    }
    pub fn active_area(&self) -> Option<&HashSet<Cell>> {
        self.active_area.as_ref()
    }
    /// Distance from `point` to the nearest occupied cell center within `radius` cells.
    pub fn nearest_occupied(&self, point: &Point2<f64>, radius: i32) -> Option<f64> {
        let (cx, cy) = self.cell(point);
        let mut best: Option<f64> = None;
        for dx in -radius..=radius {
            for dy in -radius..=radius {
                let cell = (cx + dx, cy + dy);
                if self.is_occupied(cell) {
                    let d = (self.cell_center(cell) - point).norm();
                    best = Some(best.map_or(d, |b| b.min(d)));
                }
            }
        }
        best
    }
}

/// Tuning of [GridScanMatcher].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridMatcherConfig {
    /// Map cell size in meters.
    pub resolution: f64,
    /// Initial translation step of the pose search.
    pub linear_step: f64,
    /// Initial rotation step of the pose search.
    pub angular_step: f64,
    /// Number of times the search steps are halved.
    pub refinements: usize,
    /// Maximum number of accepted moves per refinement level.
    pub iterations: usize,
    /// Width of the Gaussian used to score endpoint to cell distances.
    pub score_sigma: f64,
    /// Width of the Gaussian used for the observation likelihood.
    pub likelihood_sigma: f64,
    /// Neighborhood, in cells, searched for an occupied cell around each endpoint.
    pub kernel_size: i32,
}
impl Default for GridMatcherConfig {
    fn default() -> Self {
        GridMatcherConfig {
            resolution: 0.05,
            linear_step: 0.05,
            angular_step: 0.05,
            refinements: 4,
            iterations: 10,
            score_sigma: 0.05,
            likelihood_sigma: 0.075,
            kernel_size: 1,
        }
    }
}

/// Hill-climbing scan matcher over [PointGridMap].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GridScanMatcher {
    pub config: GridMatcherConfig,
}
impl GridScanMatcher {
    pub fn new(config: GridMatcherConfig) -> Self {
        GridScanMatcher { config }
    }

    /// Map with the configured resolution.
    pub fn empty_map(&self) -> PointGridMap {
        PointGridMap::new(self.config.resolution)
    }

    /// Endpoint distance used when no occupied cell is in range.
    fn miss_distance(&self, map: &PointGridMap) -> f64 {
        (self.config.kernel_size as f64 + 1.0) * map.resolution()
    }

    /// `(score, log_likelihood)` of the given sensor-frame points at `pose`.
    fn evaluate(&self, map: &PointGridMap, pose: &Pose2D, points: &[Point2<f64>]) -> (f64, f64) {
        let score_var = self.config.score_sigma * self.config.score_sigma;
        let likelihood_var = self.config.likelihood_sigma * self.config.likelihood_sigma;
        let miss = self.miss_distance(map);
        let mut score = 0.0;
        let mut log_likelihood = 0.0;
        for point in points {
            let world = pose.transform_point(point);
            let d = match map.nearest_occupied(&world, self.config.kernel_size) {
                Some(d) => {
                    score += (-d * d / score_var).exp();
                    d
                }
                None => miss,
            };
            log_likelihood -= d * d / (2.0 * likelihood_var);
        }
        (score, log_likelihood)
    }

    fn valid_points(reading: &LaserScan) -> Result<Vec<Point2<f64>>> {
        let points = reading.points();
        if points.is_empty() {
            return Err(SlamError::Matcher("scan has no valid beams".into()));
        }
        Ok(points)
    }
}

impl ScanMatcher for GridScanMatcher {
    type Map = PointGridMap;
    type Reading = LaserScan;

    fn optimize(&self, pose: &Pose2D, map: &PointGridMap, reading: &LaserScan) -> Result<MatchResult> {
        let points = Self::valid_points(reading)?;
        let mut best = *pose;
        let (mut best_score, _) = self.evaluate(map, &best, &points);
        let mut linear = self.config.linear_step;
        let mut angular = self.config.angular_step;
        for _ in 0..=self.config.refinements {
            for _ in 0..self.config.iterations {
                let moves = [
                    Pose2D::new(linear, 0.0, 0.0),
                    Pose2D::new(-linear, 0.0, 0.0),
                    Pose2D::new(0.0, linear, 0.0),
                    Pose2D::new(0.0, -linear, 0.0),
                    Pose2D::new(0.0, 0.0, angular),
                    Pose2D::new(0.0, 0.0, -angular),
                ];
                let candidate = moves
                    .iter()
                    .map(|m| {
                        let p = Pose2D::new(best.x + m.x, best.y + m.y, best.theta + m.theta);
                        (p, self.evaluate(map, &p, &points).0)
                    })
                    .max_by(|a, b| a.1.total_cmp(&b.1));
                match candidate {
                    Some((p, score)) if score > best_score => {
                        best = p;
                        best_score = score;
                    }
                    _ => break,
                }
            }
            linear /= 2.0;
            angular /= 2.0;
        }
        trace!("matched {pose} -> {best} (score {best_score:.3})");
        Ok(MatchResult {
            pose: best,
            score: best_score,
        })
    }

    fn likelihood_and_score(
        &self,
        map: &PointGridMap,
        pose: &Pose2D,
        reading: &LaserScan,
    ) -> Result<(f64, f64)> {
        let points = Self::valid_points(reading)?;
        Ok(self.evaluate(map, pose, &points))
    }

    fn invalidate_active_area(&self, map: &mut PointGridMap) {
        map.active_area = None;
    }

    fn compute_active_area(&self, map: &mut PointGridMap, pose: &Pose2D, reading: &LaserScan) {
        let cells: HashSet<Cell> = reading
            .points()
            .iter()
            .map(|p| map.cell(&pose.transform_point(p)))
            .collect();
        map.active_area = Some(cells);
    }

    fn register_scan(&self, map: &mut PointGridMap, _pose: &Pose2D, _reading: &LaserScan) -> Result<()> {
        let cells = map
            .active_area
            .take()
            .ok_or_else(|| SlamError::MapUpdate("active area was not computed".into()))?;
        for cell in cells {
            *map.hits.entry(cell).or_insert(0) += 1;
        }
        map.scans += 1;
        Ok(())
    }
}

/// Parameters of a synthetic run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub room_width: f64,
    pub room_height: f64,
    /// Side length of the square loop driven by the robot.
    pub loop_size: f64,
    /// Distance traveled between scans.
    pub step_length: f64,
    /// Seed of the sensor and odometry noise.
    pub seed: u64,
    pub lidar: LidarConfig,
    pub odometry: OdometryNoise,
}
impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            room_width: 6.0,
            room_height: 4.0,
            loop_size: 2.0,
            step_length: 0.1,
            seed: 7,
            lidar: LidarConfig::default(),
            odometry: OdometryNoise::default(),
        }
    }
}

/// A robot driving a square loop inside a room with a pillar.
#[derive(Clone, Debug)]
pub struct Simulation {
    pub config: SimulationConfig,
    pub room: Room,
    truth: Pose2D,
    moves: Vec<Pose2D>,
    step: usize,
    rng: StdRng,
}
impl Simulation {
    pub fn new(config: SimulationConfig) -> Self {
        let mut room = Room::rectangle(config.room_width, config.room_height);
        let center = Point2::new(config.room_width / 2.0, config.room_height / 2.0);
        room.add_box(
            center + Vector2::new(-0.2, -0.2),
            center + Vector2::new(0.2, 0.2),
        );
        let per_side = (config.loop_size / config.step_length).round().max(1.0) as usize;
        let mut moves = Vec::with_capacity(4 * per_side);
        for _ in 0..4 {
            moves.extend(std::iter::repeat_n(Pose2D::new(config.step_length, 0.0, 0.0), per_side - 1));
            moves.push(Pose2D::new(config.step_length, 0.0, std::f64::consts::FRAC_PI_2));
        }
        let start = Pose2D::new(
            (config.room_width - config.loop_size) / 2.0,
            (config.room_height - config.loop_size) / 2.0,
            0.0,
        );
        Simulation {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            room,
            truth: start,
            moves,
            step: 0,
        }
    }
    /// Ground-truth pose of the robot.
    pub fn truth(&self) -> Pose2D {
        self.truth
    }
    /// Number of motion steps in one loop.
    pub fn loop_length(&self) -> usize {
        self.moves.len()
    }
    /// Scan at the current ground-truth pose.
    pub fn scan(&mut self) -> Result<LaserScan> {
        LaserScan::simulate(&self.room, &self.truth, &self.config.lidar, &mut self.rng)
    }
    /// Advance the robot by one commanded motion and return that motion.
    pub fn advance(&mut self) -> Pose2D {
        let delta = self.moves[self.step % self.moves.len()];
        self.truth = self.truth.compose(&delta);
        self.step += 1;
        delta
    }
}

/// Everything needed for a synthetic run of the filter.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Number of scans to process. 0 drives exactly one loop.
    pub steps: usize,
    pub filter: FilterConfig,
    pub matcher: GridMatcherConfig,
    pub simulation: SimulationConfig,
}
impl ScenarioConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        read_config_file(path)
    }
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        write_config_file(self, path)
    }
}

/// Accuracy summary of a synthetic run, measured on the best particle.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScenarioReport {
    pub steps: u64,
    pub resamples: usize,
    /// Position error of the best particle after the last step.
    pub final_error: f64,
    pub mean_error: f64,
    pub max_error: f64,
    /// Position error of pure odometry integration after the last step.
    pub odometry_error: f64,
    pub particles: usize,
    pub tree_nodes: usize,
}

/// Drives a [GridSlamFilter] with scans and odometry from a [Simulation].
pub struct ScenarioRunner {
    pub simulation: Simulation,
    pub filter: GridSlamFilter<GridScanMatcher>,
    steps: usize,
    odometry: Pose2D,
    rng: StdRng,
    resamples: usize,
    errors: Vec<f64>,
}
impl ScenarioRunner {
    pub fn new(config: &ScenarioConfig) -> Result<Self> {
        let simulation = Simulation::new(config.simulation.clone());
        let matcher = GridScanMatcher::new(config.matcher.clone());
        let map = matcher.empty_map();
        let start = simulation.truth();
        let filter = GridSlamFilter::new(config.filter.clone(), matcher, start, map)?;
        let steps = match config.steps {
            0 => simulation.loop_length() + 1,
            n => n,
        };
        Ok(ScenarioRunner {
            rng: StdRng::seed_from_u64(config.simulation.seed.wrapping_add(1)),
            simulation,
            filter,
            steps,
            odometry: start,
            resamples: 0,
            errors: Vec::new(),
        })
    }

    /// Number of scans [ScenarioRunner::run] processes.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Move the robot (except before the first scan), sample the motion model and process one scan.
    pub fn step(&mut self) -> Result<StepOutcome> {
        if self.filter.step_count() > 0 {
            let delta = self.simulation.advance();
            let noise = &self.simulation.config.odometry;
            let rng = &mut self.rng;
            self.odometry = sample_odometry(&self.odometry, &delta, noise, rng);
            self.filter
                .propagate(|_, pose| *pose = sample_odometry(pose, &delta, noise, &mut *rng));
        }
        let scan = self.simulation.scan()?;
        let outcome = self.filter.step(scan)?;
        if outcome.resampled {
            self.resamples += 1;
        }
        if let Some(best) = self.filter.best_particle_index() {
            let error = self.filter.particles()[best]
                .pose
                .distance(&self.simulation.truth());
            self.errors.push(error);
        }
        Ok(outcome)
    }

    pub fn run(&mut self) -> Result<ScenarioReport> {
        for _ in 0..self.steps {
            self.step()?;
        }
        Ok(self.report())
    }

    pub fn report(&self) -> ScenarioReport {
        let count = self.errors.len().max(1) as f64;
        ScenarioReport {
            steps: self.filter.step_count(),
            resamples: self.resamples,
            final_error: self.errors.last().copied().unwrap_or(0.0),
            mean_error: self.errors.iter().sum::<f64>() / count,
            max_error: self.errors.iter().copied().fold(0.0, f64::max),
            odometry_error: self.odometry.distance(&self.simulation.truth()),
            particles: self.filter.len(),
            tree_nodes: self.filter.tree().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn scan_from(pose: &Pose2D) -> LaserScan {
        let config = LidarConfig {
            range_sigma: 0.0,
            ..LidarConfig::default()
        };
        let room = Simulation::new(SimulationConfig::default()).room;
        let mut rng = StdRng::seed_from_u64(1);
        LaserScan::simulate(&room, pose, &config, &mut rng).unwrap()
    }

    fn mapped(pose: &Pose2D, scan: &LaserScan) -> PointGridMap {
        let matcher = GridScanMatcher::default();
        let mut map = matcher.empty_map();
        matcher.compute_active_area(&mut map, pose, scan);
        matcher.register_scan(&mut map, pose, scan).unwrap();
        map
    }

    #[test]
    fn raycast_hits_nearest_wall() {
        let room = Room::rectangle(4.0, 2.0);
        let origin = Point2::new(1.0, 1.0);
        assert_approx_eq!(room.raycast(&origin, 0.0, 10.0), 3.0, 1e-12);
        assert_approx_eq!(room.raycast(&origin, std::f64::consts::PI, 10.0), 1.0, 1e-12);
        assert_approx_eq!(room.raycast(&origin, std::f64::consts::FRAC_PI_2, 10.0), 1.0, 1e-12);
        assert_approx_eq!(room.raycast(&origin, 0.0, 2.0), 2.0, 1e-12);
    }

    #[test]
    fn max_range_beams_are_not_points() {
        let room = Room::rectangle(20.0, 20.0);
        let config = LidarConfig {
            beams: 4,
            max_range: 2.0,
            range_sigma: 0.0,
            ..LidarConfig::default()
        };
        let pose = Pose2D::new(1.0, 10.0, 0.0);
        let scan = LaserScan::simulate(&room, &pose, &config, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(scan.ranges.len(), 4);
        // Only the beam pointing back at the near wall returns.
        assert_eq!(scan.points().len(), 1);
    }

    #[test]
    fn odometry_without_noise_composes_motion() {
        let noise = OdometryNoise {
            translation: 0.0,
            rotation: 0.0,
            drift: 0.0,
        };
        let pose = Pose2D::new(1.0, 2.0, std::f64::consts::FRAC_PI_2);
        let delta = Pose2D::new(0.5, 0.0, 0.1);
        let prior = sample_odometry(&pose, &delta, &noise, &mut StdRng::seed_from_u64(0));
        assert_eq!(prior, pose.compose(&delta));
    }

    #[test]
    fn odometry_noise_spreads_samples() {
        let pose = Pose2D::default();
        let delta = Pose2D::new(1.0, 0.0, 0.0);
        let mut rng = StdRng::seed_from_u64(9);
        let samples: Vec<Pose2D> = (0..200)
            .map(|_| sample_odometry(&pose, &delta, &OdometryNoise::default(), &mut rng))
            .collect();
        let mean_x = samples.iter().map(|p| p.x).sum::<f64>() / 200.0;
        assert!((mean_x - 1.0).abs() < 0.02);
        assert!(samples.iter().any(|p| p.theta != 0.0));
    }

    #[test]
    fn registration_requires_active_area() {
        let matcher = GridScanMatcher::default();
        let pose = Pose2D::new(2.0, 1.0, 0.0);
        let scan = scan_from(&pose);
        let mut map = matcher.empty_map();
        assert!(matches!(
            matcher.register_scan(&mut map, &pose, &scan),
            Err(SlamError::MapUpdate(_))
        ));

        matcher.compute_active_area(&mut map, &pose, &scan);
        let active = map.active_area().unwrap().len();
        matcher.register_scan(&mut map, &pose, &scan).unwrap();
        assert_eq!(map.occupied_cells(), active);
        assert_eq!(map.scans(), 1);
        assert!(map.active_area().is_none());
    }

    #[test]
    fn invalidation_clears_active_area() {
        let matcher = GridScanMatcher::default();
        let pose = Pose2D::new(2.0, 1.0, 0.0);
        let scan = scan_from(&pose);
        let mut map = matcher.empty_map();
        matcher.compute_active_area(&mut map, &pose, &scan);
        matcher.invalidate_active_area(&mut map);
        assert!(map.active_area().is_none());
    }

    #[test]
    fn cloned_maps_are_independent() {
        let pose = Pose2D::new(2.0, 1.0, 0.0);
        let scan = scan_from(&pose);
        let original = mapped(&pose, &scan);
        let mut copy = original.clone();
        let matcher = GridScanMatcher::default();
        let other = Pose2D::new(2.5, 1.5, 0.3);
        matcher.compute_active_area(&mut copy, &other, &scan);
        matcher.register_scan(&mut copy, &other, &scan).unwrap();
        assert_eq!(original.scans(), 1);
        assert_eq!(copy.scans(), 2);
        assert!(copy.occupied_cells() > original.occupied_cells());
    }

    #[test]
    fn true_pose_scores_best() {
        let truth = Pose2D::new(2.0, 1.0, 0.0);
        let scan = scan_from(&truth);
        let map = mapped(&truth, &scan);
        let matcher = GridScanMatcher::default();
        let (score_true, ll_true) = matcher.likelihood_and_score(&map, &truth, &scan).unwrap();
        let off = Pose2D::new(2.1, 0.95, 0.05);
        let (score_off, ll_off) = matcher.likelihood_and_score(&map, &off, &scan).unwrap();
        assert!(score_true > score_off);
        assert!(ll_true > ll_off);
    }

    #[test]
    fn optimize_recovers_perturbed_pose() {
        let truth = Pose2D::new(2.0, 1.0, 0.0);
        let scan = scan_from(&truth);
        let map = mapped(&truth, &scan);
        let matcher = GridScanMatcher::default();
        let start = Pose2D::new(2.04, 0.97, 0.0);
        let result = matcher.optimize(&start, &map, &scan).unwrap();
        assert!(result.pose.distance(&truth) < start.distance(&truth));
        assert!(result.pose.theta.abs() < 0.05);
        assert!(result.score > 0.0);
    }

    #[test]
    fn empty_map_gives_zero_score() {
        let pose = Pose2D::new(2.0, 1.0, 0.0);
        let scan = scan_from(&pose);
        let matcher = GridScanMatcher::default();
        let result = matcher.optimize(&pose, &matcher.empty_map(), &scan).unwrap();
        assert_eq!(result.score, 0.0);
        assert_eq!(result.pose, pose);
    }

    #[test]
    fn scan_without_returns_cannot_be_matched() {
        let scan = LaserScan {
            angles: vec![0.0, 1.0],
            ranges: vec![5.0, 5.0],
            max_range: 5.0,
        };
        let matcher = GridScanMatcher::default();
        let err = matcher
            .optimize(&Pose2D::default(), &matcher.empty_map(), &scan)
            .unwrap_err();
        assert!(matches!(err, SlamError::Matcher(_)));
    }

    #[test]
    fn simulation_closes_the_loop() {
        let mut sim = Simulation::new(SimulationConfig::default());
        let start = sim.truth();
        for _ in 0..sim.loop_length() {
            sim.advance();
        }
        assert!(sim.truth().distance(&start) < 1e-9);
        assert_approx_eq!(sim.truth().theta, start.theta, 1e-9);
        assert!(!sim.scan().unwrap().points().is_empty());
    }
}
