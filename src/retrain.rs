//! Retraining Loop
//!
//! Trains a [`LearnedCostModel`] on grouped benchmark samples. For every
//! learning rate and epoch, each pipeline becomes one batch: the model is
//! reset, given the pipeline features, and fed up to `BATCH_CAPACITY`
//! schedules (a random window when there are more). Training pipelines are
//! backpropagated; validation pipelines are only evaluated.
//!
//! Each epoch produces an [`EpochReport`] with:
//! - mean training loss
//! - R² between predicted and measured throughput relative to the fastest
//!   schedule of each pipeline
//! - single-shot efficiency: how fast the schedule the model ranks best is,
//!   relative to the true best
//! - the worst misprediction seen while training

use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::cost_model::{CostModel, LearnedCostModel};
use crate::kernel::ThroughputKernel;
use crate::network::BATCH_CAPACITY;
use crate::samples::{PipelineSamples, SampleSet};

/// Stop once the mean training loss drops below this
pub const CONVERGED_LOSS: f32 = 1e-5;

/// Configuration for a retraining run
#[derive(Clone, Debug)]
pub struct RetrainConfig {
    /// Epochs per learning rate
    pub epochs: usize,

    /// Learning rates, run one after another
    pub rates: Vec<f32>,

    /// Core count passed to the model with every pipeline
    pub num_cores: usize,

    /// Seed for batch window selection; `None` derives one from the clock
    pub seed: Option<u64>,
}

impl Default for RetrainConfig {
    fn default() -> Self {
        RetrainConfig {
            epochs: 1,
            rates: vec![0.0001],
            num_cores: 32,
            seed: None,
        }
    }
}

/// The schedule with the largest runtime/prediction ratio in an epoch
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct WorstMiss {
    pub ratio: f32,
    pub pipeline_hash: u64,
    pub schedule_hash: u64,
    pub path: String,
}

/// Statistics for one epoch; serialized as one JSON line by the CLI
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct EpochReport {
    pub learning_rate: f32,
    pub epoch: usize,
    /// Mean loss over training batches; `None` with no training pipelines
    pub loss: Option<f32>,
    pub train_r2: Option<f64>,
    pub validation_r2: Option<f64>,
    pub train_single_shot: Option<f64>,
    pub validation_single_shot: Option<f64>,
    pub worst_miss: Option<WorstMiss>,
}

/// Running sums for R² of relative throughput
#[derive(Default)]
struct Correlation {
    n: f64,
    sum_actual: f64,
    sum2_actual: f64,
    sum_predicted: f64,
    sum2_predicted: f64,
    sum_product: f64,
}

impl Correlation {
    fn add(&mut self, predicted: f64, actual: f64) {
        self.n += 1.0;
        self.sum_actual += actual;
        self.sum2_actual += actual * actual;
        self.sum_predicted += predicted;
        self.sum2_predicted += predicted * predicted;
        self.sum_product += predicted * actual;
    }

    fn r2(&self) -> Option<f64> {
        if self.n == 0.0 {
            return None;
        }
        let covariance = self.n * self.sum_product - self.sum_predicted * self.sum_actual;
        let predicted_variance = self.n * self.sum2_predicted - self.sum_predicted * self.sum_predicted;
        let actual_variance = self.n * self.sum2_actual - self.sum_actual * self.sum_actual;
        let r = covariance * covariance / (predicted_variance * actual_variance);
        r.is_finite().then_some(r)
    }
}

/// Per-pass accumulators
#[derive(Default)]
struct PassStats {
    correlation: Correlation,
    single_shot_sum: f64,
    single_shot_count: usize,
}

impl PassStats {
    fn single_shot(&self) -> Option<f64> {
        (self.single_shot_count > 0).then(|| self.single_shot_sum / self.single_shot_count as f64)
    }

    /// Fold in the latest predictions of one pipeline
    fn record(&mut self, pipeline: &PipelineSamples) {
        let Some(reference) = pipeline.fastest() else {
            return;
        };
        let best = f64::from(reference.best_runtime());

        let mut best_predicted = f64::INFINITY;
        let mut runtime_of_best_predicted = None;
        for sched in pipeline.schedules.values() {
            let predicted = sched.prediction.get().unwrap_or(0.0);
            if predicted == 0.0 {
                continue;
            }
            let actual = f64::from(sched.best_runtime());
            self.correlation.add(best / predicted, best / actual);
            if predicted < best_predicted {
                best_predicted = predicted;
                runtime_of_best_predicted = Some(actual);
            }
        }
        if let Some(actual) = runtime_of_best_predicted {
            self.single_shot_sum += best / actual;
            self.single_shot_count += 1;
        }
    }
}

/// Run one batch per pipeline; returns the summed loss and batch count
#[allow(clippy::too_many_arguments)]
fn run_pass<K: ThroughputKernel>(
    model: &mut LearnedCostModel<K>,
    set: &SampleSet,
    train: bool,
    learning_rate: f32,
    num_cores: usize,
    rng: &mut StdRng,
    stats: &mut PassStats,
    worst: &mut Option<WorstMiss>,
) -> (f32, usize) {
    let mut loss_sum = 0f32;
    let mut batches = 0;

    for (&pipeline_hash, pipeline) in &set.pipelines {
        if pipeline.schedules.is_empty() {
            continue;
        }
        model.reset();
        model.set_pipeline_features(&pipeline.features, num_cores);

        let count = pipeline.schedules.len();
        let batch_size = count.min(BATCH_CAPACITY);
        let first = if count > BATCH_CAPACITY {
            rng.gen_range(0..count - BATCH_CAPACITY)
        } else {
            0
        };

        let window: Vec<_> = pipeline.schedules.iter().skip(first).take(batch_size).collect();
        let mut runtimes = Vec::with_capacity(batch_size);
        for &(_, sched) in &window {
            model
                .enqueue(pipeline.num_stages, sched.prediction.clone())
                .copy_from(&sched.features);
            runtimes.push(sched.best_runtime());
        }

        if train {
            let loss = model.backprop(&runtimes, learning_rate);
            loss_sum += loss;
            batches += 1;

            for &(&schedule_hash, sched) in &window {
                let predicted = sched.prediction.get().unwrap_or(0.0) as f32;
                let ratio = sched.best_runtime() / (predicted + 1e-10);
                if worst.as_ref().map_or(true, |w| ratio > w.ratio) {
                    *worst = Some(WorstMiss {
                        ratio,
                        pipeline_hash,
                        schedule_hash,
                        path: sched.path.display().to_string(),
                    });
                }
            }
        } else {
            model.evaluate_costs();
        }

        stats.record(pipeline);
    }
    (loss_sum, batches)
}

/// Train `model` on `training`, evaluating `validation` alongside
///
/// Weights are saved through [`LearnedCostModel::save_weights`] after every
/// epoch. Returns one report per epoch actually run.
pub fn retrain<K: ThroughputKernel>(
    model: &mut LearnedCostModel<K>,
    training: &SampleSet,
    validation: &SampleSet,
    config: &RetrainConfig,
) -> Vec<EpochReport> {
    let seed = config.seed.unwrap_or_else(|| {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    });
    info!(
        "Iterating over {} pipelines ({} validation) using seed = {}",
        training.pipelines.len(),
        validation.pipelines.len(),
        seed
    );
    let mut rng = StdRng::seed_from_u64(seed);
    let mut reports = Vec::new();

    for &learning_rate in &config.rates {
        for epoch in 0..config.epochs {
            let mut worst = None;
            let mut v_stats = PassStats::default();
            run_pass(
                model,
                validation,
                false,
                learning_rate,
                config.num_cores,
                &mut rng,
                &mut v_stats,
                &mut worst,
            );
            let mut t_stats = PassStats::default();
            let (loss_sum, batches) = run_pass(
                model,
                training,
                true,
                learning_rate,
                config.num_cores,
                &mut rng,
                &mut t_stats,
                &mut worst,
            );

            let report = EpochReport {
                learning_rate,
                epoch,
                loss: (batches > 0).then(|| loss_sum / batches as f32),
                train_r2: t_stats.correlation.r2(),
                validation_r2: v_stats.correlation.r2(),
                train_single_shot: t_stats.single_shot(),
                validation_single_shot: v_stats.single_shot(),
                worst_miss: worst,
            };
            info!(
                "Rate {} epoch {}: loss {:?}, R^2 {:?} / {:?}, single-shot {:?} / {:?}",
                learning_rate,
                epoch,
                report.loss,
                report.train_r2,
                report.validation_r2,
                report.train_single_shot,
                report.validation_single_shot
            );
            model.save_weights();

            let converged = report.loss.map_or(false, |l| l < CONVERGED_LOSS);
            reports.push(report);
            if converged {
                info!("Zero loss, returning early");
                return reports;
            }
        }
    }
    reports
}
