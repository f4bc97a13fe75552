//! Particle-filter core for Rao-Blackwellized occupancy-grid SLAM
//!
//! This crate implements the per-scan orchestration of a grid-based Rao-Blackwellized particle filter (RBPF) SLAM
//! estimator. Each particle pairs a pose trajectory with its own occupancy map, so that the map posterior can be
//! computed exactly given the trajectory (Rao-Blackwellization) while the trajectory itself is sampled. The filter
//! evolves its population one laser scan at a time:
//!
//! 1. every particle's odometry prior is corrected by scan matching against its own map and the observation
//!    likelihood is accumulated into its log weight,
//! 2. the log weights are normalized into a probability vector and the effective sample size is computed,
//! 3. depending on the effective sample size the population is either resampled (with a shared ancestry tree
//!    recording which hypotheses descended from which) or simply extended by one trajectory node per particle.
//!
//! The crate does not implement a scan matcher or an occupancy grid. Those are consumed through the
//! [matcher::ScanMatcher] trait so that any grid/matcher pair can be plugged in. A small synthetic implementation
//! lives in [sim] for exercising the filter end to end.
//!
//! This crate is primarily built off of the following dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): pose and point geometry.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): resampling
//!   and simulation noise.
//! - [`rayon`](https://crates.io/crates/rayon): per-particle parallelism inside each filter phase.
//! - [`serde`](https://crates.io/crates/serde) and [`csv`](https://crates.io/crates/csv): configuration files and
//!   step traces.
//! - [`log`](https://crates.io/crates/log): diagnostics.
//!
//! ## Crate overview
//!
//! - [tree]: the shared, reference-counted ancestry (genealogy) tree of trajectory nodes.
//! - [particle]: the particle type and the resampling index providers.
//! - [weights]: log-domain weight normalization and effective sample size.
//! - [matcher]: the scan matcher / map collaborator contract.
//! - [filter]: the per-scan filter pipeline.
//! - [trace]: the step event side channel (logging and CSV step traces).
//! - [config]: filter configuration and configuration files.
//! - [sim]: a synthetic world, map and matcher for simulations and tests.
//!
//! ## Pose convention
//!
//! Poses are planar: $(x, y, \theta)$ in meters and radians, with $\theta$ measured counter-clockwise from the
//! world $x$ axis and kept in $(-\pi, \pi]$. A pose maps points from the robot frame into the world frame:
//!
//! $$
//! p^w = R(\theta) p^r + t
//! $$
//!
//! ## Weights
//!
//! Particle weights are always log-likelihoods. `weight` accumulates since the particle was last created by a
//! resampling (or initialization) and is what the normalizer consumes. `weight_sum` accumulates over the whole life
//! of the lineage and is used to pick the best particle. Probability-domain weights only ever exist in the output of
//! [weights::normalize_log_weights].
pub mod config;
pub mod error;
pub mod filter;
pub mod matcher;
pub mod particle;
pub mod sim;
pub mod trace;
pub mod tree;
pub mod weights;

use nalgebra::{Isometry2, Point2, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

pub use config::FilterConfig;
pub use error::{Result, SlamError};
pub use filter::{FilterPhase, GridSlamFilter, StepOutcome};
pub use matcher::{MatchResult, ScanMatcher};
pub use particle::{Particle, ResamplingStrategy};
pub use tree::{AncestryTree, NodeId, PruningPolicy};

/// Planar robot pose (position in meters, heading in radians).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose2D {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}
impl Display for Pose2D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pose2D {{ x: {:.3} m, y: {:.3} m, theta: {:.2} deg }}",
            self.x,
            self.y,
            self.theta.to_degrees()
        )
    }
}
impl From<Vector3<f64>> for Pose2D {
    fn from(v: Vector3<f64>) -> Self {
        Pose2D::new(v[0], v[1], v[2])
    }
}
impl From<Pose2D> for Vector3<f64> {
    fn from(pose: Pose2D) -> Self {
        Vector3::new(pose.x, pose.y, pose.theta)
    }
}
impl Pose2D {
    /// Create a pose; the heading is wrapped into $(-\pi, \pi]$.
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Pose2D {
            x,
            y,
            theta: wrap_to_pi(theta),
        }
    }
    pub fn translation(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }
    pub fn to_isometry(&self) -> Isometry2<f64> {
        Isometry2::new(self.translation(), self.theta)
    }
    /// Map a point from the robot frame into the world frame.
    pub fn transform_point(&self, point: &Point2<f64>) -> Point2<f64> {
        self.to_isometry() * point
    }
    /// Apply a motion expressed in this pose's own frame.
    ///
    /// # Example
    /// ```rust
    /// use gridslam::Pose2D;
    /// use std::f64::consts::FRAC_PI_2;
    /// let pose = Pose2D::new(1.0, 0.0, FRAC_PI_2);
    /// let moved = pose.compose(&Pose2D::new(2.0, 0.0, 0.0));
    /// assert!((moved.x - 1.0).abs() < 1e-12);
    /// assert!((moved.y - 2.0).abs() < 1e-12);
    /// ```
    pub fn compose(&self, delta: &Pose2D) -> Pose2D {
        let (sin, cos) = self.theta.sin_cos();
        Pose2D::new(
            self.x + cos * delta.x - sin * delta.y,
            self.y + sin * delta.x + cos * delta.y,
            self.theta + delta.theta,
        )
    }
    /// Relative motion that takes `self` to `other`, expressed in the frame of `self`.
    pub fn between(&self, other: &Pose2D) -> Pose2D {
        let (sin, cos) = self.theta.sin_cos();
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        Pose2D::new(
            cos * dx + sin * dy,
            -sin * dx + cos * dy,
            other.theta - self.theta,
        )
    }
    /// Euclidean distance between the positions of two poses.
    pub fn distance(&self, other: &Pose2D) -> f64 {
        (self.translation() - other.translation()).norm()
    }
}

/// Wrap an angle to the range $(-\pi, \pi]$ radians
///
/// # Example
/// ```rust
/// use gridslam::wrap_to_pi;
/// use std::f64::consts::PI;
/// let wrapped = wrap_to_pi(3.0 * PI / 2.0);
/// assert!((wrapped + PI / 2.0).abs() < 1e-12);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    let two_pi = 2.0 * std::f64::consts::PI;
    let wrapped = (angle + std::f64::consts::PI).rem_euclid(two_pi) - std::f64::consts::PI;
    if wrapped == -std::f64::consts::PI {
        std::f64::consts::PI
    } else {
        wrapped
    }
}
