//! Learned Cost Model
//!
//! [`LearnedCostModel`] owns the weights, the optimizer state and the feature
//! queue. Callers describe one pipeline, enqueue candidate schedules with a
//! [`CostSlot`] each, and read predicted runtimes from the slots once the
//! batch is evaluated, either explicitly or when the queue fills up.
//!
//! # Usage
//!
//! ```no_run
//! use schedcost::{CostModel, CostModelConfig, CostSlot, LearnedCostModel, Tensor};
//!
//! let mut model = LearnedCostModel::new(CostModelConfig::from_env());
//! model.set_pipeline_features(&Tensor::zeros(&[40, 7, 3]), 16);
//! let slot = CostSlot::new();
//! let mut features = model.enqueue(3, slot.clone());
//! features.set(0, 0, 1.0);
//! model.evaluate_costs();
//! println!("predicted {:?} s", slot.get());
//! ```

use log::{debug, error, info};

use crate::config::CostModelConfig;
use crate::kernel::{KernelOutput, NativeKernel, ThroughputKernel};
use crate::network::{BATCH_CAPACITY, HEAD1_H, HEAD1_W};
use crate::predictor::BatchView;
use crate::queue::{CostSlot, FeatureQueue, QueueState, ScheduleFeaturesMut};
use crate::tensor::Tensor;
use crate::trainer::{self, OptimizerState};
use crate::weights::{self, Weights};

/// The interface a schedule search uses to rank candidates
pub trait CostModel {
    /// Describe the pipeline all following schedules belong to
    ///
    /// `features` must have shape `[40, 7, max_stages]`.
    fn set_pipeline_features(&mut self, features: &Tensor, num_cores: usize);

    /// Queue one schedule; its predicted runtime (seconds) lands in `slot`
    fn enqueue(&mut self, num_stages: usize, slot: CostSlot) -> ScheduleFeaturesMut<'_>;

    /// Evaluate everything queued and write the results
    fn evaluate_costs(&mut self);

    /// Drop queued schedules without evaluating them
    fn reset(&mut self);
}

/// Cost model backed by the learned network
pub struct LearnedCostModel<K: ThroughputKernel = NativeKernel> {
    config: CostModelConfig,
    kernel: K,
    weights: Weights,
    optimizer: Option<OptimizerState>,
    pipeline: Option<Tensor>,
    max_stages: usize,
    num_cores: usize,
    num_stages: usize,
    queue: FeatureQueue,
}

impl LearnedCostModel<NativeKernel> {
    /// Create a model with the weights `config` asks for
    pub fn new(config: CostModelConfig) -> Self {
        let weights = config.initial_weights();
        Self::with_kernel(config, weights, NativeKernel)
    }

    /// Create a model around already-loaded weights
    pub fn from_weights(weights: Weights) -> Self {
        Self::with_kernel(CostModelConfig::default(), weights, NativeKernel)
    }
}

impl<K: ThroughputKernel> LearnedCostModel<K> {
    pub fn with_kernel(config: CostModelConfig, weights: Weights, kernel: K) -> Self {
        LearnedCostModel {
            config,
            kernel,
            weights,
            optimizer: None,
            pipeline: None,
            max_stages: 0,
            num_cores: 1,
            num_stages: 0,
            queue: FeatureQueue::new(BATCH_CAPACITY),
        }
    }

    pub fn config(&self) -> &CostModelConfig {
        &self.config
    }

    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    /// Adam state; `None` until the first [`LearnedCostModel::backprop`]
    pub fn optimizer_state(&self) -> Option<&OptimizerState> {
        self.optimizer.as_ref()
    }

    pub fn queue_state(&self) -> QueueState {
        self.queue.state()
    }

    /// Number of queued schedules
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Stage count used for the current batch
    pub fn num_stages(&self) -> usize {
        self.num_stages
    }

    /// Train on the queued schedules and write their predictions
    ///
    /// `runtimes[i]` is the measured runtime of the i-th queued schedule, in
    /// any consistent unit. Weights are updated in place. The queue is left as
    /// is so the caller can inspect or re-train on the same batch.
    ///
    /// # Returns
    /// The total loss of the batch, before the update.
    ///
    /// # Panics
    /// On an empty queue, too few runtimes, a runtime that is not positive,
    /// or a non-finite prediction.
    pub fn backprop(&mut self, runtimes: &[f32], learning_rate: f32) -> f32 {
        let n = self.queue.len();
        assert!(n > 0, "backprop called with an empty queue");
        assert!(
            runtimes.len() >= n,
            "backprop needs {} runtimes, got {}",
            n,
            runtimes.len()
        );
        let runtimes = &runtimes[..n];
        if let Some(i) = runtimes.iter().position(|&r| !(r > 0.0)) {
            error!("Runtime of schedule {} is {}; runtimes must be positive", i, runtimes[i]);
            panic!("non-positive runtime for schedule {}", i);
        }

        let Some(pipeline) = self.pipeline.as_ref() else {
            error!("backprop called before set_pipeline_features");
            panic!("backprop before pipeline features");
        };
        let batch = BatchView {
            pipeline,
            schedules: self.queue.schedules(),
            stage_capacity: self.queue.stage_capacity(),
            batch_size: n,
            num_stages: self.num_stages,
            num_cores: self.num_cores,
        };

        let optimizer = self.optimizer.get_or_insert_with(OptimizerState::new);
        let reference = trainer::fastest_index(runtimes);
        let output = self.kernel.train(
            &batch,
            &self.weights,
            learning_rate,
            optimizer.timestep,
            reference,
            runtimes,
            &mut optimizer.updates,
        );
        check_finite(&output, &self.weights, &batch);

        optimizer.commit(&mut self.weights);
        optimizer.timestep += 1;

        for (slot, &p) in self.queue.slots().iter().zip(&output.predictions) {
            slot.set(f64::from(p));
        }
        debug!(
            "Trained on {} schedules (step {}): loss {}",
            n, optimizer.timestep, output.loss
        );
        output.loss
    }

    /// Persist the current weights to the configured output path
    ///
    /// # Panics
    /// If writing fails.
    pub fn save_weights(&self) {
        let Some(path) = &self.config.weights_out else {
            debug!("No weights output path configured; not saving");
            return;
        };
        if !weights::save_path(&self.weights, path) {
            error!("Unable to save weights to {}", path.display());
            panic!("failed to save weights to {}", path.display());
        }
        info!("Saved weights to {}", path.display());
    }
}

/// Abort with a diagnostic if any prediction is NaN or infinite
fn check_finite(output: &KernelOutput, weights: &Weights, batch: &BatchView<'_>) {
    if let Some(i) = output.predictions.iter().position(|p| !p.is_finite()) {
        error!("Prediction for schedule {} is {}", i, output.predictions[i]);
        let cause = trainer::diagnose_non_finite(weights, batch)
            .unwrap_or_else(|| "no non-finite input found".to_string());
        panic!("non-finite prediction for schedule {}: {}", i, cause);
    }
}

impl<K: ThroughputKernel> CostModel for LearnedCostModel<K> {
    fn set_pipeline_features(&mut self, features: &Tensor, num_cores: usize) {
        let shape = features.shape();
        if shape.len() != 3 || shape[0] != HEAD1_W || shape[1] != HEAD1_H {
            error!(
                "Pipeline features must have shape [{}, {}, stages], got {:?}",
                HEAD1_W, HEAD1_H, shape
            );
            panic!("bad pipeline feature shape {:?}", shape);
        }
        self.max_stages = shape[2];
        self.num_cores = num_cores;
        self.pipeline = Some(features.clone());
    }

    fn enqueue(&mut self, num_stages: usize, slot: CostSlot) -> ScheduleFeaturesMut<'_> {
        if self.pipeline.is_none() {
            error!("enqueue called before set_pipeline_features");
            panic!("enqueue before pipeline features");
        }
        if num_stages > self.max_stages {
            error!(
                "Schedule has {} stages but the pipeline has only {}",
                num_stages, self.max_stages
            );
            panic!("too many stages: {} > {}", num_stages, self.max_stages);
        }

        if self.queue.state() == QueueState::Full {
            self.evaluate_costs();
        }
        self.queue.reserve_stages(self.max_stages);

        if !self.queue.is_empty() && num_stages != self.num_stages {
            debug!(
                "Stage count changed mid-batch from {} to {}",
                self.num_stages, num_stages
            );
        }
        self.num_stages = num_stages;
        self.queue.push(num_stages, slot)
    }

    fn evaluate_costs(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let Some(pipeline) = self.pipeline.as_ref() else {
            return;
        };
        let batch = BatchView {
            pipeline,
            schedules: self.queue.schedules(),
            stage_capacity: self.queue.stage_capacity(),
            batch_size: self.queue.len(),
            num_stages: self.num_stages,
            num_cores: self.num_cores,
        };
        let output = self.kernel.infer(&batch, &self.weights);
        check_finite(&output, &self.weights, &batch);

        for (slot, &p) in self.queue.slots().iter().zip(&output.predictions) {
            slot.set(f64::from(p));
        }
        debug!("Evaluated {} schedules", self.queue.len());
        self.queue.clear();
    }

    fn reset(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::HEAD2_W;

    fn model_with_pipeline(stages: usize) -> LearnedCostModel {
        let mut model = LearnedCostModel::from_weights(Weights::baseline());
        model.set_pipeline_features(&Tensor::filled(&[HEAD1_W, HEAD1_H, stages], 0.5), 4);
        model
    }

    #[test]
    #[should_panic(expected = "enqueue before pipeline features")]
    fn test_enqueue_requires_pipeline() {
        let mut model = LearnedCostModel::from_weights(Weights::baseline());
        model.enqueue(1, CostSlot::new());
    }

    #[test]
    #[should_panic(expected = "too many stages")]
    fn test_enqueue_rejects_extra_stages() {
        let mut model = model_with_pipeline(2);
        model.enqueue(3, CostSlot::new());
    }

    #[test]
    #[should_panic(expected = "bad pipeline feature shape")]
    fn test_pipeline_shape_checked() {
        let mut model = LearnedCostModel::from_weights(Weights::baseline());
        model.set_pipeline_features(&Tensor::zeros(&[HEAD1_W, 6, 2]), 4);
    }

    #[test]
    #[should_panic(expected = "non-positive runtime")]
    fn test_backprop_rejects_zero_runtime() {
        let mut model = model_with_pipeline(1);
        model.enqueue(1, CostSlot::new());
        model.enqueue(1, CostSlot::new());
        model.backprop(&[1.0, 0.0], 1e-3);
    }

    #[test]
    fn test_evaluate_on_empty_queue_is_a_no_op() {
        let mut model = model_with_pipeline(1);
        model.evaluate_costs();
        assert_eq!(model.queue_state(), QueueState::Empty);
    }

    #[test]
    fn test_last_stage_count_wins() {
        let mut model = model_with_pipeline(4);
        model.enqueue(4, CostSlot::new());
        model.enqueue(2, CostSlot::new());
        assert_eq!(model.num_stages(), 2);
        assert_eq!(model.pending(), 2);
    }

    #[test]
    fn test_backprop_keeps_queue_and_writes_slots() {
        let mut model = model_with_pipeline(2);
        let slots: Vec<CostSlot> = (0..3).map(|_| CostSlot::new()).collect();
        for (i, slot) in slots.iter().enumerate() {
            let mut f = model.enqueue(2, slot.clone());
            for s in 0..2 {
                for feat in 0..HEAD2_W {
                    f.set(s, feat, (1 + (i + feat + s) % 5) as f32);
                }
            }
        }
        let loss = model.backprop(&[2.0, 1.0, 3.0], 1e-3);
        assert!(loss.is_finite());
        assert_eq!(model.pending(), 3);
        assert!(slots.iter().all(|s| s.get().is_some()));
        assert_eq!(model.optimizer_state().map(|o| o.timestep), Some(1));
    }
}
