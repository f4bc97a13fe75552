//! Scan matcher and map collaborator contract.
//!
//! The filter never inspects a map or a reading. Everything it needs is expressed by [ScanMatcher]: correcting a
//! pose against a particle's own map, scoring an observation, tracking the region of a map that a scan will touch
//! (the *active area*) and committing a scan into a map.
//!
//! The active area is stored with the map rather than in the matcher, because every particle owns an independent
//! map and particles are processed concurrently. Matchers are shared between worker threads and must therefore be
//! [Sync]; all map mutation goes through `&mut Self::Map`.
use crate::Pose2D;
use crate::error::Result;

/// Outcome of a scan-matching optimization.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MatchResult {
    /// Pose that best explains the reading in the given map.
    pub pose: Pose2D,
    /// Match quality; compared against the filter's minimum score.
    pub score: f64,
}

pub trait ScanMatcher: Sync {
    /// Per-particle map. Cloned when a particle is duplicated by resampling; clones must be observably independent.
    type Map: Clone + Send + Sync;
    /// A single sensor reading.
    type Reading: Send + Sync;

    /// Search for the pose that best aligns `reading` with `map`, starting from `pose`.
    ///
    /// # Errors
    /// Returns [crate::SlamError::Matcher] when no score can be produced at all. A poor match is not an error; it is
    /// reported through a low score.
    fn optimize(&self, pose: &Pose2D, map: &Self::Map, reading: &Self::Reading) -> Result<MatchResult>;

    /// Evaluate `reading` at `pose` in `map`.
    ///
    /// # Returns
    /// `(score, log_likelihood)`.
    fn likelihood_and_score(
        &self,
        map: &Self::Map,
        pose: &Pose2D,
        reading: &Self::Reading,
    ) -> Result<(f64, f64)>;

    /// Forget the active area previously marked in `map`.
    fn invalidate_active_area(&self, map: &mut Self::Map);

    /// Mark the region of `map` that `reading` taken from `pose` will update.
    fn compute_active_area(&self, map: &mut Self::Map, pose: &Pose2D, reading: &Self::Reading);

    /// Commit `reading` taken from `pose` into `map`.
    ///
    /// # Errors
    /// Returns [crate::SlamError::MapUpdate] when the map cannot absorb the scan.
    fn register_scan(&self, map: &mut Self::Map, pose: &Pose2D, reading: &Self::Reading) -> Result<()>;
}
