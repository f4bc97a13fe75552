//! Rao-Blackwellized grid SLAM particle filter.
//!
//! [GridSlamFilter] runs one filter step per laser scan as a strict three-phase pipeline:
//!
//! 1. **Matching**: every particle's pose prior is corrected against the particle's own map and the observation
//!    log-likelihood is added to its weights. Particles are independent, so this runs on the rayon pool when
//!    [FilterConfig::parallel] is set.
//! 2. **Normalizing**: the log weights are normalized (see [crate::weights]) and the effective sample size $N_{eff}$
//!    is computed.
//! 3. **Resample decision**: if $N_{eff} < \tau N$ the population is resampled and the ancestry tree grows one
//!    child per selected particle, otherwise every particle's lineage is extended by one node. Either way the scan
//!    is registered into every surviving map.
//!
//! Each phase consumes the complete output of the previous one. The caller only ever observes the particle set
//! between steps.
//!
//! Failure semantics: a collaborator error during matching or degenerate weights leave the filter exactly as it was
//! before the step. An error while registering scans happens after particles were modified, so the filter is marked
//! poisoned and refuses further steps.
use std::fmt::{self, Debug};
use std::sync::Arc;

use log::{debug, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;

use crate::Pose2D;
use crate::config::FilterConfig;
use crate::error::{Result, SlamError};
use crate::matcher::ScanMatcher;
use crate::particle::Particle;
use crate::trace::{StepEvent, StepObserver};
use crate::tree::{AncestryTree, TrajectoryPoint};
use crate::weights::{NormalizedWeights, normalize_log_weights, observation_gain};

/// Last state reached by the step state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterPhase {
    /// No step has run yet.
    Initialized,
    Matching,
    Normalizing,
    ResampleDecision,
    /// The last step resampled the population.
    Resampled,
    /// The last step extended every lineage without resampling.
    Extended,
}

/// Summary of a completed step.
#[derive(Clone, Debug, PartialEq)]
pub struct StepOutcome {
    /// 1-based index of the step.
    pub step: u64,
    pub resampled: bool,
    pub neff: f64,
    pub mean_score: f64,
    /// Particles whose scan-match correction was rejected.
    pub rejected: usize,
    /// Resample source indexes; empty when the step did not resample.
    pub indexes: Vec<usize>,
    /// Particle count after the step.
    pub particles: usize,
}

/// Result of scan matching a single particle, computed before anything is committed.
struct MatchUpdate {
    pose: Pose2D,
    score: f64,
    likelihood: f64,
    accepted: bool,
}

pub struct GridSlamFilter<S: ScanMatcher> {
    config: FilterConfig,
    matcher: S,
    particles: Vec<Particle<S::Map>>,
    tree: AncestryTree<S::Reading>,
    weights: Vec<f64>,
    neff: f64,
    indexes: Vec<usize>,
    rng: StdRng,
    observers: Vec<Box<dyn StepObserver>>,
    step: u64,
    phase: FilterPhase,
    poisoned: bool,
}

impl<S: ScanMatcher> Debug for GridSlamFilter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min_weight = self.weights.iter().copied().fold(f64::INFINITY, f64::min);
        let max_weight = self.weights.iter().copied().fold(0.0, f64::max);
        let best = self.best_particle_index().map(|i| self.particles[i].pose);
        f.debug_struct("GridSlamFilter")
            .field("step", &self.step)
            .field("phase", &self.phase)
            .field("num_particles", &self.particles.len())
            .field("effective_particles", &self.neff)
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            )
            .field("tree_nodes", &self.tree.len())
            .field("best_pose", &best)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl<S: ScanMatcher> GridSlamFilter<S> {
    /// Create `config.num_particles` identical particles at `initial_pose`, each with a copy of `initial_map` and
    /// its own root node in the ancestry tree.
    pub fn new(config: FilterConfig, matcher: S, initial_pose: Pose2D, initial_map: S::Map) -> Result<Self> {
        config.validate()?;
        let n = config.num_particles;
        let mut tree = AncestryTree::new(config.pruning);
        let particles: Vec<Particle<S::Map>> = (0..n)
            .map(|i| Particle::new(initial_pose, initial_map.clone(), tree.insert_root(initial_pose), i))
            .collect();
        info!(
            "initialized {n} particles at {initial_pose} ({} resampling, {:?} pruning)",
            config.resampling_strategy, config.pruning
        );
        Ok(GridSlamFilter {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            matcher,
            particles,
            tree,
            weights: vec![1.0 / n as f64; n],
            neff: n as f64,
            indexes: Vec::new(),
            observers: Vec::new(),
            step: 0,
            phase: FilterPhase::Initialized,
            poisoned: false,
        })
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }
    pub fn matcher(&self) -> &S {
        &self.matcher
    }
    pub fn particles(&self) -> &[Particle<S::Map>] {
        &self.particles
    }
    pub fn len(&self) -> usize {
        self.particles.len()
    }
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }
    pub fn tree(&self) -> &AncestryTree<S::Reading> {
        &self.tree
    }
    /// Normalized weights of the current particles, in particle order. Uniform right after a resample.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }
    pub fn neff(&self) -> f64 {
        self.neff
    }
    /// Source indexes of the last resampling.
    pub fn last_indexes(&self) -> &[usize] {
        &self.indexes
    }
    pub fn step_count(&self) -> u64 {
        self.step
    }
    pub fn phase(&self) -> FilterPhase {
        self.phase
    }
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Register an observer for step events.
    pub fn add_observer<O: StepObserver + 'static>(&mut self, observer: O) {
        self.observers.push(Box::new(observer));
    }

    /// Apply the motion model: `motion(index, pose)` replaces each particle's pose with its prior for the next scan.
    pub fn propagate<F: FnMut(usize, &mut Pose2D)>(&mut self, mut motion: F) {
        for (i, particle) in self.particles.iter_mut().enumerate() {
            motion(i, &mut particle.pose);
        }
    }

    /// Process one scan, resampling to the configured target size (or the current size) when needed.
    pub fn step(&mut self, reading: impl Into<Arc<S::Reading>>) -> Result<StepOutcome> {
        let target = self.config.target_particles.unwrap_or(self.particles.len());
        self.step_with_target(reading, target)
    }

    /// Process one scan; if the step resamples, the new population has `target` particles.
    pub fn step_with_target(
        &mut self,
        reading: impl Into<Arc<S::Reading>>,
        target: usize,
    ) -> Result<StepOutcome> {
        if self.poisoned {
            return Err(SlamError::Poisoned);
        }
        if self.particles.is_empty() {
            return Err(SlamError::EmptyParticleSet);
        }
        if target == 0 {
            return Err(SlamError::Config("resample target must be positive".into()));
        }
        let reading = reading.into();
        let step = self.step + 1;

        self.phase = FilterPhase::Matching;
        let updates = self.scan_match(&reading)?;
        let n = self.particles.len();
        let rejected = updates.iter().filter(|u| !u.accepted).count();
        let mean_score = updates.iter().map(|u| u.score).sum::<f64>() / n as f64;

        self.phase = FilterPhase::Normalizing;
        let log_weights: Vec<f64> = self
            .particles
            .iter()
            .zip(&updates)
            .map(|(p, u)| p.weight + u.likelihood)
            .collect();
        let normalized =
            normalize_log_weights(&log_weights, observation_gain(self.config.obs_sigma_gain, n))?;
        assert_eq!(normalized.len(), n, "normalized weights do not match particles");

        self.commit_matches(updates, &reading);
        self.emit(StepEvent::MatchCompleted {
            step,
            mean_score,
            rejected,
            particles: n,
        });
        self.emit(StepEvent::WeightsNormalized {
            step,
            neff: normalized.neff,
        });

        self.phase = FilterPhase::ResampleDecision;
        let resampled = normalized.needs_resampling(self.config.resample_threshold);
        let result = if resampled {
            self.resample(&normalized, reading, target)
        } else {
            self.extend(reading)
        };
        if let Err(e) = result {
            warn!("step {step} failed after particles were updated: {e}");
            self.poisoned = true;
            return Err(e);
        }

        self.neff = normalized.neff;
        self.weights = if resampled {
            let n = self.particles.len();
            vec![1.0 / n as f64; n]
        } else {
            normalized.weights
        };
        if resampled {
            self.phase = FilterPhase::Resampled;
            self.emit(StepEvent::Resampled {
                step,
                indexes: self.indexes.clone(),
            });
        } else {
            self.phase = FilterPhase::Extended;
            self.emit(StepEvent::Extended {
                step,
                particles: self.particles.len(),
            });
        }
        self.step = step;
        Ok(StepOutcome {
            step,
            resampled,
            neff: self.neff,
            mean_score,
            rejected,
            indexes: if resampled { self.indexes.clone() } else { Vec::new() },
            particles: self.particles.len(),
        })
    }

    /// Index of the particle with the highest lifetime log weight.
    pub fn best_particle_index(&self) -> Option<usize> {
        self.particles
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.weight_sum.total_cmp(&b.weight_sum))
            .map(|(i, _)| i)
    }

    /// Trajectory of particle `index`, root first.
    pub fn trajectory(&self, index: usize) -> Vec<TrajectoryPoint<S::Reading>> {
        self.tree.trajectory(self.particles[index].node)
    }

    pub fn trajectories(&self) -> Vec<Vec<TrajectoryPoint<S::Reading>>> {
        self.particles
            .iter()
            .map(|p| self.tree.trajectory(p.node))
            .collect()
    }

    pub fn best_trajectory(&self) -> Option<Vec<TrajectoryPoint<S::Reading>>> {
        self.best_particle_index().map(|i| self.trajectory(i))
    }

    /// Shut the filter down and return every particle's trajectory.
    pub fn into_trajectories(self) -> Vec<Vec<TrajectoryPoint<S::Reading>>> {
        self.trajectories()
    }

    /// Normalize the current particle weights and propagate them through the ancestry tree, so that every node's
    /// `accumulated_weight` holds the probability mass of the particles descending from it.
    pub fn update_tree_weights(&mut self) -> Result<()> {
        let n = self.particles.len();
        let log_weights: Vec<f64> = self.particles.iter().map(|p| p.weight).collect();
        let normalized =
            normalize_log_weights(&log_weights, observation_gain(self.config.obs_sigma_gain, n))?;
        let leaves: Vec<_> = self.particles.iter().map(|p| p.node).collect();
        self.tree.propagate_weights(&leaves, &normalized.weights);
        self.neff = normalized.neff;
        self.weights = normalized.weights;
        Ok(())
    }

    fn emit(&mut self, event: StepEvent) {
        for observer in self.observers.iter_mut() {
            observer.on_event(&event);
        }
    }

    fn scan_match(&self, reading: &S::Reading) -> Result<Vec<MatchUpdate>> {
        let matcher = &self.matcher;
        let minimum_score = self.config.minimum_score;
        let evaluate = |particle: &Particle<S::Map>| -> Result<MatchUpdate> {
            let matched = matcher.optimize(&particle.pose, &particle.map, reading)?;
            let accepted = matched.score > minimum_score;
            let pose = if accepted { matched.pose } else { particle.pose };
            let (_, likelihood) = matcher.likelihood_and_score(&particle.map, &pose, reading)?;
            Ok(MatchUpdate {
                pose,
                score: matched.score,
                likelihood,
                accepted,
            })
        };
        if self.config.parallel {
            self.particles.par_iter().map(&evaluate).collect()
        } else {
            self.particles.iter().map(&evaluate).collect()
        }
    }

    fn commit_matches(&mut self, updates: Vec<MatchUpdate>, reading: &S::Reading) {
        for (i, (particle, update)) in self.particles.iter_mut().zip(updates).enumerate() {
            if !update.accepted {
                debug!(
                    "scan matching failed for particle {i} (score {:.3}), using odometry pose {}",
                    update.score, particle.pose
                );
            }
            particle.pose = update.pose;
            particle.weight += update.likelihood;
            particle.weight_sum += update.likelihood;
        }
        refresh_active_areas(&self.matcher, &mut self.particles, reading, self.config.parallel);
    }

    /// Branch A: rebuild the population from resample indexes.
    fn resample(
        &mut self,
        normalized: &NormalizedWeights,
        reading: Arc<S::Reading>,
        target: usize,
    ) -> Result<()> {
        let indexes = self
            .config
            .resampling_strategy
            .indexes(&normalized.weights, target, &mut self.rng);
        assert_eq!(indexes.len(), target, "resampler returned the wrong count");
        info!(
            "resampling: neff {:.2} < {:.2}, {} -> {} particles",
            normalized.neff,
            self.config.resample_threshold * self.particles.len() as f64,
            self.particles.len(),
            target
        );

        let source = &self.particles;
        let duplicate = |&i: &usize| {
            let p = &source[i];
            Particle {
                pose: p.pose,
                weight: 0.0,
                weight_sum: p.weight_sum,
                map: p.map.clone(),
                node: p.node,
                previous_index: i,
            }
        };
        let mut next: Vec<Particle<S::Map>> = if self.config.parallel {
            indexes.par_iter().map(&duplicate).collect()
        } else {
            indexes.iter().map(&duplicate).collect()
        };
        register_scans(&self.matcher, &mut next, &reading, self.config.parallel)?;

        // Single writer: every tree mutation happens here, after all fallible work.
        for particle in next.iter_mut() {
            particle.node =
                self.tree
                    .insert_child(particle.node, particle.pose, 0.0, Some(reading.clone()));
        }
        let mut freed = 0;
        let mut dropped = 0;
        let mut selected = indexes.iter().peekable();
        for (i, old) in self.particles.drain(..).enumerate() {
            let mut multiplicity = 0;
            while selected.next_if_eq(&&i).is_some() {
                multiplicity += 1;
            }
            if multiplicity == 0 {
                dropped += 1;
            }
            freed += self.tree.release(old.node);
        }
        debug!(
            "dropped {dropped} particles, freed {freed} ancestry nodes ({} live)",
            self.tree.len()
        );
        self.particles = next;
        self.indexes = indexes;
        Ok(())
    }

    /// Branch B: extend every lineage by one node.
    fn extend(&mut self, reading: Arc<S::Reading>) -> Result<()> {
        register_scans(&self.matcher, &mut self.particles, &reading, self.config.parallel)?;
        for (i, particle) in self.particles.iter_mut().enumerate() {
            let leaf = self
                .tree
                .insert_child(particle.node, particle.pose, 0.0, Some(reading.clone()));
            self.tree.release(particle.node);
            particle.node = leaf;
            particle.previous_index = i;
        }
        Ok(())
    }
}

fn refresh_active_area<S: ScanMatcher>(
    matcher: &S,
    particle: &mut Particle<S::Map>,
    reading: &S::Reading,
) {
    matcher.invalidate_active_area(&mut particle.map);
    matcher.compute_active_area(&mut particle.map, &particle.pose, reading);
}

/// Recompute every particle's active area around its corrected pose.
fn refresh_active_areas<S: ScanMatcher>(
    matcher: &S,
    particles: &mut [Particle<S::Map>],
    reading: &S::Reading,
    parallel: bool,
) {
    let work = |particle: &mut Particle<S::Map>| refresh_active_area(matcher, particle, reading);
    if parallel {
        particles.par_iter_mut().for_each(work);
    } else {
        particles.iter_mut().for_each(work);
    }
}

/// Refresh every particle's active area and register the scan into its map.
fn register_scans<S: ScanMatcher>(
    matcher: &S,
    particles: &mut [Particle<S::Map>],
    reading: &S::Reading,
    parallel: bool,
) -> Result<()> {
    let work = |particle: &mut Particle<S::Map>| -> Result<()> {
        refresh_active_area(matcher, particle, reading);
        matcher.register_scan(&mut particle.map, &particle.pose, reading)
    };
    if parallel {
        particles.par_iter_mut().try_for_each(work)
    } else {
        particles.iter_mut().try_for_each(work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::MatchResult;
    use crate::tree::PruningPolicy;
    use assert_approx_eq::assert_approx_eq;
    use rand::Rng;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Map that only records what the filter did to it.
    #[derive(Clone, Debug, Default)]
    struct RecordingMap {
        registered: Vec<Pose2D>,
        active_area: Option<Pose2D>,
        invalidations: usize,
    }

    /// Reading carrying the log-likelihood of each particle slot (particle poses are placed at `x = slot`).
    #[derive(Debug)]
    struct ScriptedScan {
        likelihoods: Vec<f64>,
        score: f64,
    }
    impl ScriptedScan {
        fn new(likelihoods: Vec<f64>) -> Self {
            ScriptedScan {
                likelihoods,
                score: 1.0,
            }
        }
    }

    #[derive(Default)]
    struct ScriptedMatcher {
        correction: Pose2D,
        fail_optimize: AtomicBool,
        fail_register: AtomicBool,
    }
    impl ScanMatcher for ScriptedMatcher {
        type Map = RecordingMap;
        type Reading = ScriptedScan;

        fn optimize(&self, pose: &Pose2D, _map: &RecordingMap, reading: &ScriptedScan) -> Result<MatchResult> {
            if self.fail_optimize.load(Ordering::SeqCst) {
                return Err(SlamError::Matcher("no correspondences".into()));
            }
            Ok(MatchResult {
                pose: pose.compose(&self.correction),
                score: reading.score,
            })
        }
        fn likelihood_and_score(
            &self,
            _map: &RecordingMap,
            pose: &Pose2D,
            reading: &ScriptedScan,
        ) -> Result<(f64, f64)> {
            let slot = pose.x.round() as usize;
            Ok((reading.score, reading.likelihoods[slot]))
        }
        fn invalidate_active_area(&self, map: &mut RecordingMap) {
            map.active_area = None;
            map.invalidations += 1;
        }
        fn compute_active_area(&self, map: &mut RecordingMap, pose: &Pose2D, _reading: &ScriptedScan) {
            map.active_area = Some(*pose);
        }
        fn register_scan(&self, map: &mut RecordingMap, pose: &Pose2D, _reading: &ScriptedScan) -> Result<()> {
            if self.fail_register.load(Ordering::SeqCst) {
                return Err(SlamError::MapUpdate("grid full".into()));
            }
            map.registered.push(*pose);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct EventLog(Arc<Mutex<Vec<StepEvent>>>);
    impl StepObserver for EventLog {
        fn on_event(&mut self, event: &StepEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn filter_with(config: FilterConfig, matcher: ScriptedMatcher) -> GridSlamFilter<ScriptedMatcher> {
        let mut filter =
            GridSlamFilter::new(config, matcher, Pose2D::default(), RecordingMap::default()).unwrap();
        filter.propagate(|i, pose| pose.x = i as f64);
        filter
    }

    fn filter(n: usize) -> GridSlamFilter<ScriptedMatcher> {
        let config = FilterConfig {
            num_particles: n,
            ..FilterConfig::default()
        };
        filter_with(config, ScriptedMatcher::default())
    }

    /// Log-likelihoods whose normalized weights under the filter gain are exactly `weights`.
    fn likelihoods_for(weights: &[f64], obs_sigma_gain: f64) -> Vec<f64> {
        let n = weights.len() as f64;
        weights.iter().map(|w| w.ln() * obs_sigma_gain * n).collect()
    }

    fn one_hot(n: usize, hot: usize) -> Vec<f64> {
        (0..n)
            .map(|i| if i == hot { 0.0 } else { f64::NEG_INFINITY })
            .collect()
    }

    #[test]
    fn rejected_match_keeps_prior_pose_bit_identical() {
        let config = FilterConfig {
            num_particles: 3,
            minimum_score: 5.0,
            ..FilterConfig::default()
        };
        let matcher = ScriptedMatcher {
            correction: Pose2D::new(0.3, -0.2, 0.1),
            ..ScriptedMatcher::default()
        };
        let mut filter = filter_with(config, matcher);
        filter.propagate(|i, pose| {
            *pose = Pose2D::new(i as f64 + 0.1, 1.0 / 3.0, 0.7);
        });
        let priors: Vec<Pose2D> = filter.particles().iter().map(|p| p.pose).collect();

        let mut scan = ScriptedScan::new(vec![0.0; 3]);
        scan.score = 5.0;
        let outcome = filter.step(scan).unwrap();

        assert_eq!(outcome.rejected, 3);
        for (particle, prior) in filter.particles().iter().zip(&priors) {
            assert_eq!(particle.pose.x.to_bits(), prior.x.to_bits());
            assert_eq!(particle.pose.y.to_bits(), prior.y.to_bits());
            assert_eq!(particle.pose.theta.to_bits(), prior.theta.to_bits());
        }
    }

    #[test]
    fn accepted_match_adopts_corrected_pose() {
        let config = FilterConfig {
            num_particles: 2,
            minimum_score: 0.5,
            ..FilterConfig::default()
        };
        let correction = Pose2D::new(0.0, 0.25, 0.0);
        let matcher = ScriptedMatcher {
            correction,
            ..ScriptedMatcher::default()
        };
        let mut filter = filter_with(config, matcher);
        let outcome = filter.step(ScriptedScan::new(vec![0.0; 2])).unwrap();
        assert_eq!(outcome.rejected, 0);
        assert_approx_eq!(outcome.mean_score, 1.0);
        for (i, particle) in filter.particles().iter().enumerate() {
            assert_approx_eq!(particle.pose.x, i as f64);
            assert_approx_eq!(particle.pose.y, 0.25);
            assert_eq!(particle.map.registered, vec![particle.pose]);
        }
    }

    #[test]
    fn likelihood_accumulates_into_both_weights() {
        let mut filter = filter(3);
        filter.step(ScriptedScan::new(vec![-2.0; 3])).unwrap();
        filter.step(ScriptedScan::new(vec![-2.0; 3])).unwrap();
        for particle in filter.particles() {
            assert_approx_eq!(particle.weight, -4.0);
            assert_approx_eq!(particle.weight_sum, -4.0);
        }

        // Collapse onto slot 1: the per-step weight resets, the lifetime sum survives.
        let outcome = filter.step(ScriptedScan::new(one_hot(3, 1))).unwrap();
        assert!(outcome.resampled);
        for particle in filter.particles() {
            assert_eq!(particle.previous_index, 1);
            assert_eq!(particle.weight, 0.0);
            assert_approx_eq!(particle.weight_sum, -4.0);
        }
    }

    #[test]
    fn uniform_weights_extend_every_lineage() {
        let mut filter = filter(5);
        let leaves_before: Vec<_> = filter.particles().iter().map(|p| p.node).collect();
        let nodes_before = filter.tree().len();

        let outcome = filter.step(ScriptedScan::new(vec![-1.0; 5])).unwrap();

        assert!(!outcome.resampled);
        assert!(outcome.indexes.is_empty());
        assert_approx_eq!(outcome.neff, 5.0, 1e-9);
        assert_eq!(filter.len(), 5);
        assert_eq!(filter.tree().len(), nodes_before + 5);
        assert_eq!(filter.phase(), FilterPhase::Extended);
        let mut leaves: Vec<_> = filter.particles().iter().map(|p| p.node).collect();
        for (i, (particle, old)) in filter.particles().iter().zip(&leaves_before).enumerate() {
            let node = filter.tree().get(particle.node).unwrap();
            assert_eq!(node.parent(), Some(*old));
            assert_eq!(node.pose, particle.pose);
            assert!(node.reading.is_some());
            assert_eq!(particle.previous_index, i);
            assert_eq!(particle.map.registered.len(), 1);
            assert!(particle.map.active_area.is_some());
        }
        leaves.sort();
        leaves.dedup();
        assert_eq!(leaves.len(), 5);
    }

    #[test]
    fn spread_scenario_does_not_resample() {
        let weights = [0.4, 0.3, 0.2, 0.1];
        let mut filter = filter(4);
        let outcome = filter
            .step(ScriptedScan::new(likelihoods_for(&weights, 3.0)))
            .unwrap();
        assert_approx_eq!(outcome.neff, 1.0 / 0.3, 1e-9);
        assert!(!outcome.resampled);
        for (w, expected) in filter.weights().iter().zip(weights) {
            assert_approx_eq!(*w, expected, 1e-12);
        }
    }

    #[test]
    fn concentrated_scenario_resamples_towards_dominant_particle() {
        let weights = [0.97, 0.01, 0.01, 0.01];
        let mut filter = filter(4);
        let outcome = filter
            .step(ScriptedScan::new(likelihoods_for(&weights, 3.0)))
            .unwrap();
        assert!(outcome.neff < 2.0);
        assert!(outcome.resampled);
        assert_eq!(filter.phase(), FilterPhase::Resampled);
        assert_eq!(outcome.indexes.len(), 4);
        assert!(outcome.indexes.windows(2).all(|w| w[0] <= w[1]));
        let from_first = filter
            .particles()
            .iter()
            .filter(|p| p.previous_index == 0)
            .count();
        assert!(from_first >= 3);
    }

    #[test]
    fn resampling_follows_threshold_across_distributions() {
        let mut rng = StdRng::seed_from_u64(17);
        for trial in 0..40 {
            let n = rng.random_range(2..12);
            let spread = rng.random_range(0.0..60.0);
            let likelihoods: Vec<f64> = (0..n).map(|_| -rng.random::<f64>() * spread).collect();
            let mut filter = filter(n);
            let outcome = filter.step(ScriptedScan::new(likelihoods)).unwrap();
            assert!(outcome.neff >= 1.0 && outcome.neff <= n as f64, "trial {trial}");
            assert_eq!(
                outcome.resampled,
                outcome.neff < 0.5 * n as f64,
                "trial {trial}: neff {}",
                outcome.neff
            );
            assert_approx_eq!(filter.weights().iter().sum::<f64>(), 1.0, 1e-12);
        }
    }

    #[test]
    fn resample_honours_adaptive_target() {
        let mut filter = filter(4);
        let outcome = filter
            .step_with_target(ScriptedScan::new(one_hot(4, 2)), 7)
            .unwrap();
        assert!(outcome.resampled);
        assert_eq!(outcome.particles, 7);
        assert_eq!(filter.len(), 7);
        assert!(filter.particles().iter().all(|p| p.previous_index < 4));
        assert_eq!(filter.weights().len(), filter.len());
        for w in filter.weights() {
            assert_approx_eq!(*w, 1.0 / 7.0, 1e-12);
        }

        let config = FilterConfig {
            num_particles: 4,
            target_particles: Some(2),
            ..FilterConfig::default()
        };
        let mut filter = filter_with(config, ScriptedMatcher::default());
        filter.step(ScriptedScan::new(one_hot(4, 0))).unwrap();
        assert_eq!(filter.len(), 2);
    }

    #[test]
    fn resampled_particles_own_fresh_leaves_and_maps() {
        let mut filter = filter(4);
        let old_leaf = filter.particles()[3].node;
        filter.step(ScriptedScan::new(one_hot(4, 3))).unwrap();
        let leaves: Vec<_> = filter.particles().iter().map(|p| p.node).collect();
        for (i, particle) in filter.particles().iter().enumerate() {
            assert_eq!(filter.tree().get(particle.node).unwrap().parent(), Some(old_leaf));
            assert!(leaves[..i].iter().all(|&other| other != particle.node));
            assert_eq!(particle.map.registered.len(), 1);
        }
        assert_eq!(filter.tree().get(old_leaf).unwrap().references(), 4);
    }

    #[test]
    fn ancestry_depth_grows_by_one_per_step() {
        let mut filter = filter(4);
        let scans = [
            vec![-1.0; 4],
            one_hot(4, 1),
            vec![-1.0; 4],
            one_hot(4, 1),
            vec![-3.0; 4],
        ];
        for (step, likelihoods) in scans.into_iter().enumerate() {
            filter.step(ScriptedScan::new(likelihoods)).unwrap();
            for particle in filter.particles() {
                assert_eq!(filter.tree().depth(particle.node), step + 1);
            }
            assert_eq!(filter.step_count(), step as u64 + 1);
        }
    }

    #[test]
    fn deep_pruning_reclaims_dropped_lineages() {
        let mut filter = filter(4);
        filter.step(ScriptedScan::new(vec![-1.0; 4])).unwrap();
        assert_eq!(filter.tree().len(), 8);
        filter.step(ScriptedScan::new(one_hot(4, 0))).unwrap();
        // root 0, its first-step child and four fresh leaves.
        assert_eq!(filter.tree().len(), 6);
        assert_eq!(filter.tree().unreferenced(), 0);
    }

    #[test]
    fn shallow_pruning_frees_only_dropped_leaves() {
        let config = FilterConfig {
            num_particles: 4,
            pruning: PruningPolicy::Shallow,
            ..FilterConfig::default()
        };
        let mut filter = filter_with(config, ScriptedMatcher::default());
        filter.step(ScriptedScan::new(vec![-1.0; 4])).unwrap();
        filter.step(ScriptedScan::new(one_hot(4, 0))).unwrap();
        assert_eq!(filter.tree().len(), 9);
        assert_eq!(filter.tree().unreferenced(), 3);
    }

    #[test]
    fn matcher_failure_leaves_filter_untouched() {
        let mut filter = filter(3);
        filter.step(ScriptedScan::new(vec![-1.0, -2.0, -3.0])).unwrap();
        let before: Vec<(Pose2D, f64, f64)> = filter
            .particles()
            .iter()
            .map(|p| (p.pose, p.weight, p.weight_sum))
            .collect();
        let nodes = filter.tree().len();

        filter.matcher().fail_optimize.store(true, Ordering::SeqCst);
        let err = filter.step(ScriptedScan::new(vec![0.0; 3])).unwrap_err();
        assert!(matches!(err, SlamError::Matcher(_)));

        let after: Vec<(Pose2D, f64, f64)> = filter
            .particles()
            .iter()
            .map(|p| (p.pose, p.weight, p.weight_sum))
            .collect();
        assert_eq!(before, after);
        assert_eq!(filter.tree().len(), nodes);
        assert_eq!(filter.step_count(), 1);
        assert!(!filter.is_poisoned());

        filter.matcher().fail_optimize.store(false, Ordering::SeqCst);
        assert!(filter.step(ScriptedScan::new(vec![0.0; 3])).is_ok());
    }

    #[test]
    fn degenerate_likelihoods_are_reported() {
        let mut filter = filter(2);
        let err = filter
            .step(ScriptedScan::new(vec![f64::NAN, 0.0]))
            .unwrap_err();
        assert!(matches!(err, SlamError::DegenerateWeights(_)));
        assert!(filter.particles().iter().all(|p| p.weight == 0.0));
    }

    #[test]
    fn map_update_failure_poisons_the_filter() {
        let mut filter = filter(3);
        filter.matcher().fail_register.store(true, Ordering::SeqCst);
        let err = filter.step(ScriptedScan::new(vec![0.0; 3])).unwrap_err();
        assert!(matches!(err, SlamError::MapUpdate(_)));
        assert!(filter.is_poisoned());

        filter.matcher().fail_register.store(false, Ordering::SeqCst);
        let err = filter.step(ScriptedScan::new(vec![0.0; 3])).unwrap_err();
        assert!(matches!(err, SlamError::Poisoned));
    }

    #[test]
    fn matched_poses_refresh_active_areas_before_registration() {
        let config = FilterConfig {
            num_particles: 3,
            parallel: false,
            ..FilterConfig::default()
        };
        let matcher = ScriptedMatcher {
            correction: Pose2D::new(0.0, 0.5, 0.0),
            ..ScriptedMatcher::default()
        };
        let mut filter = filter_with(config, matcher);
        let before: Vec<usize> = filter.particles().iter().map(|p| p.map.invalidations).collect();
        filter.matcher().fail_register.store(true, Ordering::SeqCst);
        filter.step(ScriptedScan::new(vec![0.0; 3])).unwrap_err();

        // Registration stops at the first particle; the others only saw the post-match refresh.
        for (particle, before) in filter.particles().iter().zip(before).skip(1) {
            assert_eq!(particle.map.invalidations, before + 1);
            assert_eq!(particle.map.active_area, Some(particle.pose));
            assert_approx_eq!(particle.pose.y, 0.5);
            assert!(particle.map.registered.is_empty());
        }
    }

    #[test]
    fn observers_see_phases_in_order() {
        let mut filter = filter(4);
        let log = EventLog::default();
        filter.add_observer(log.clone());
        filter.step(ScriptedScan::new(vec![0.0; 4])).unwrap();
        filter.step(ScriptedScan::new(one_hot(4, 2))).unwrap();

        let events = log.0.lock().unwrap();
        assert_eq!(events.len(), 6);
        assert!(matches!(events[0], StepEvent::MatchCompleted { step: 1, .. }));
        assert!(matches!(events[1], StepEvent::WeightsNormalized { step: 1, .. }));
        assert!(matches!(events[2], StepEvent::Extended { step: 1, particles: 4 }));
        assert!(matches!(events[5], StepEvent::Resampled { step: 2, ref indexes } if indexes == &vec![2, 2, 2, 2]));
    }

    #[test]
    fn trajectories_and_best_particle() {
        let mut filter = filter(3);
        filter.step(ScriptedScan::new(vec![-5.0, -1.0, -9.0])).unwrap();
        filter.step(ScriptedScan::new(vec![-5.0, -1.0, -9.0])).unwrap();
        assert_eq!(filter.best_particle_index(), Some(1));

        let best = filter.best_trajectory().unwrap();
        assert_eq!(best.len(), 3);
        assert!(best[0].reading.is_none());
        assert!(best[1..].iter().all(|p| p.reading.is_some()));
        assert_eq!(best.last().unwrap().node, filter.particles()[1].node);
        assert_approx_eq!(best.last().unwrap().pose.x, 1.0);

        let all = filter.into_trajectories();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|t| t.len() == 3));
    }

    #[test]
    fn tree_weights_sum_to_one_at_roots() {
        let mut filter = filter(4);
        filter.step(ScriptedScan::new(vec![-1.0, -2.0, -3.0, -4.0])).unwrap();
        filter.update_tree_weights().unwrap();
        let root_mass: f64 = filter
            .particles()
            .iter()
            .map(|p| filter.tree().trajectory(p.node)[0].accumulated_weight)
            .sum();
        assert_approx_eq!(root_mass, 1.0, 1e-12);
        assert_approx_eq!(filter.weights().iter().sum::<f64>(), 1.0, 1e-12);
    }

    #[test]
    fn sequential_and_parallel_runs_agree() {
        let run = |parallel: bool| {
            let config = FilterConfig {
                num_particles: 6,
                parallel,
                ..FilterConfig::default()
            };
            let mut filter = filter_with(config, ScriptedMatcher::default());
            filter
                .step(ScriptedScan::new(vec![-1.0, -40.0, -2.0, -80.0, -3.0, -90.0]))
                .unwrap();
            filter
                .step(ScriptedScan::new(vec![-1.0, -40.0, -2.0, -80.0, -3.0, -90.0]))
                .unwrap();
            filter
                .particles()
                .iter()
                .map(|p| (p.pose, p.previous_index))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(true), run(false));
    }

    #[test]
    fn empty_configuration_is_rejected() {
        let config = FilterConfig {
            num_particles: 0,
            ..FilterConfig::default()
        };
        let result = GridSlamFilter::new(
            config,
            ScriptedMatcher::default(),
            Pose2D::default(),
            RecordingMap::default(),
        );
        assert!(matches!(result, Err(SlamError::Config(_))));
    }
}
