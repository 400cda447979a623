//! Numeric Kernel Seam
//!
//! The orchestrator reaches the numeric code only through
//! [`ThroughputKernel`], which has one inference entry point and one training
//! entry point. [`NativeKernel`] is the scalar CPU implementation.

use crate::network::WeightSet;
use crate::predictor::{self, BatchView};
use crate::tensor::Tensor;
use crate::trainer;
use crate::weights::Weights;

/// What a kernel call produces
#[derive(Debug, Clone, PartialEq)]
pub struct KernelOutput {
    /// One predicted runtime per batch item
    pub predictions: Vec<f32>,
    /// Total loss; always 0 for inference
    pub loss: f32,
}

/// Forward and training passes over a batch
pub trait ThroughputKernel {
    /// Predict every item of the batch
    fn infer(&self, batch: &BatchView<'_>, weights: &Weights) -> KernelOutput;

    /// Predict, compute the loss, and write all four Adam slots of every
    /// tensor in `updates`
    ///
    /// `reference` indexes the item whose runtime normalizes the batch.
    /// `timestep` is the number of training calls completed before this one.
    #[allow(clippy::too_many_arguments)]
    fn train(
        &self,
        batch: &BatchView<'_>,
        weights: &Weights,
        learning_rate: f32,
        timestep: u32,
        reference: usize,
        runtimes: &[f32],
        updates: &mut WeightSet<Tensor>,
    ) -> KernelOutput;
}

/// Scalar CPU implementation with hand-derived gradients
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeKernel;

impl ThroughputKernel for NativeKernel {
    fn infer(&self, batch: &BatchView<'_>, weights: &Weights) -> KernelOutput {
        KernelOutput {
            predictions: predictor::predict(weights, batch),
            loss: 0.0,
        }
    }

    fn train(
        &self,
        batch: &BatchView<'_>,
        weights: &Weights,
        learning_rate: f32,
        timestep: u32,
        reference: usize,
        runtimes: &[f32],
        updates: &mut WeightSet<Tensor>,
    ) -> KernelOutput {
        let result = trainer::loss_and_gradients(weights, batch, reference, runtimes);
        trainer::apply_adam(weights, &result.gradients, updates, learning_rate, timestep);
        KernelOutput {
            predictions: result.predictions,
            loss: result.loss,
        }
    }
}
