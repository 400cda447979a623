//! Training: Loss, Gradients and Adam
//!
//! The loss compares *relative throughput* rather than absolute runtime.
//! Both predictions and measured runtimes are divided by the runtime of the
//! fastest schedule in the batch, so multiplying every runtime by a constant
//! leaves the loss unchanged:
//!
//! ```text
//! loss_i = (1 / max(p_i * scale, 1e-10) - 1 / (r_i * scale))^2
//!        + 1e-5 * Σ_{c,s} max(0, -stage2[c][s])
//! ```
//!
//! Gradients are derived by hand. The network is small and the cost is
//! linear in the relu'd coefficients, so the backward pass is a handful of
//! loops mirroring the forward pass in [`crate::predictor`].

use log::{debug, error};

use crate::network::{WeightId, WeightSet, CONV1_CHANNELS, HEAD1_CHANNELS, HEAD1_H, HEAD1_W, HEAD2_CHANNELS, HEAD2_W};
use crate::predictor::{self, sigmoid, BatchView, StageTrace, COST_SCALE};
use crate::tensor::Tensor;
use crate::weights::Weights;

/// Weight on the penalty for negative coefficients
pub const REGULARIZATION: f32 = 1e-5;
/// Predictions below this (relative to the fastest runtime) are clamped
pub const MIN_RELATIVE_PREDICTION: f32 = 1e-10;

pub const ADAM_BETA1: f32 = 0.9;
pub const ADAM_BETA2: f32 = 0.999;
pub const ADAM_EPSILON: f32 = 1e-5;

/// Index of the smallest runtime; ties go to the lowest index
pub fn fastest_index(runtimes: &[f32]) -> usize {
    let mut best = 0;
    for (i, &r) in runtimes.iter().enumerate() {
        if r < runtimes[best] {
            best = i;
        }
    }
    best
}

/// Result of one forward + backward sweep over a batch
#[derive(Debug, Clone)]
pub struct LossAndGradients {
    pub loss: f32,
    pub predictions: Vec<f32>,
    pub gradients: WeightSet<Tensor>,
}

/// Total loss and its gradient with respect to every weight
///
/// `reference` is the item whose runtime normalizes the batch, normally
/// [`fastest_index`] of `runtimes`.
pub fn loss_and_gradients(
    weights: &Weights,
    batch: &BatchView<'_>,
    reference: usize,
    runtimes: &[f32],
) -> LossAndGradients {
    let ns = batch.num_stages;
    let embedding = predictor::embed_pipeline(weights, batch.pipeline, ns);
    let mut grads = WeightSet::zeros();
    // d loss / d head1[s][k], summed over the batch
    let mut d_head1 = vec![[0f32; HEAD1_CHANNELS]; ns];
    let mut predictions = Vec::with_capacity(batch.batch_size);
    let mut loss = 0f32;

    let scale = 1.0 / runtimes[reference.min(batch.batch_size.saturating_sub(1))];

    for n in 0..batch.batch_size {
        let stages = predictor::trace_item(weights, &embedding, batch, n);
        let prediction = predictor::prediction_of(&stages);
        predictions.push(prediction);

        let p = prediction * scale;
        let r = runtimes[n] * scale;
        let diff = 1.0 / p.max(MIN_RELATIVE_PREDICTION) - 1.0 / r;
        let negativity: f32 = stages.iter().map(StageTrace::negativity).sum();
        loss += diff * diff + REGULARIZATION * negativity;

        let d_prediction = if p > MIN_RELATIVE_PREDICTION {
            2.0 * diff * (-1.0 / (p * p)) * scale
        } else {
            0.0
        };

        for (s, trace) in stages.iter().enumerate() {
            backward_stage(
                weights,
                &embedding[s],
                trace,
                d_prediction,
                &mut grads,
                &mut d_head1[s],
            );
        }
    }

    // Algorithm embedding is shared by all items
    let pipeline = batch.pipeline.data();
    let h1f = weights.head1_filter.data();
    for (s, dh) in d_head1.iter().enumerate() {
        for (c, &d) in dh.iter().enumerate() {
            grads.head1_bias.data_mut()[c] += d;
            if d == 0.0 {
                continue;
            }
            for y in 0..HEAD1_H {
                for x in 0..HEAD1_W {
                    let i = c + HEAD1_CHANNELS * (x + HEAD1_W * y);
                    let sq = sigmoid(h1f[i]);
                    grads.head1_filter.data_mut()[i] +=
                        d * pipeline[x + HEAD1_W * (y + HEAD1_H * s)] * sq * (1.0 - sq);
                }
            }
        }
    }

    LossAndGradients {
        loss,
        predictions,
        gradients: grads,
    }
}

/// Backpropagate one (item, stage) pair into the conv1 and head2 gradients,
/// accumulating the head1 gradient for the stage into `d_head1`.
fn backward_stage(
    weights: &Weights,
    head1: &[f32; HEAD1_CHANNELS],
    trace: &StageTrace,
    d_prediction: f32,
    grads: &mut WeightSet<Tensor>,
    d_head1: &mut [f32; HEAD1_CHANNELS],
) {
    let cf = weights.conv1_filter.data();

    let mut d_stage2 = [0f32; CONV1_CHANNELS];
    for (c, g) in d_stage2.iter_mut().enumerate() {
        let v = trace.stage2[c];
        if v > 0.0 {
            *g += d_prediction * COST_SCALE * trace.multipliers[c];
        } else if v < 0.0 {
            *g -= REGULARIZATION;
        }
    }

    {
        let cb = grads.conv1_bias.data_mut();
        for c in 0..CONV1_CHANNELS {
            cb[c] += d_stage2[c];
        }
    }
    {
        let gcf = grads.conv1_filter.data_mut();
        for (c, &g) in d_stage2.iter().enumerate() {
            if g == 0.0 {
                continue;
            }
            for (k, &h) in head1.iter().enumerate() {
                gcf[c + CONV1_CHANNELS * k] += g * h;
            }
            for (k, &h) in trace.head2.iter().enumerate() {
                gcf[c + CONV1_CHANNELS * (HEAD1_CHANNELS + k)] += g * h;
            }
        }
    }

    for k in 0..HEAD2_CHANNELS {
        if trace.head2_pre[k] <= 0.0 {
            continue;
        }
        let col = CONV1_CHANNELS * (HEAD1_CHANNELS + k);
        let d: f32 = (0..CONV1_CHANNELS).map(|c| cf[c + col] * d_stage2[c]).sum();
        grads.head2_bias.data_mut()[k] += d;
        let h2f = grads.head2_filter.data_mut();
        for f in 0..HEAD2_W {
            h2f[k + HEAD2_CHANNELS * f] += d * trace.norm[f];
        }
    }

    for (k, dh) in d_head1.iter_mut().enumerate() {
        let col = CONV1_CHANNELS * k;
        *dh += (0..CONV1_CHANNELS).map(|c| cf[c + col] * d_stage2[c]).sum::<f32>();
    }
}

/// The four per-element slots kept by the optimizer for each weight tensor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdamSlot {
    NewWeight = 0,
    FirstMoment = 1,
    SecondMoment = 2,
    LossGradient = 3,
}

impl AdamSlot {
    pub const COUNT: usize = 4;
}

/// One Adam update of a single element
///
/// Returns `(new_weight, first_moment, second_moment)`. `timestep` counts
/// completed training calls, so the first call uses bias corrections for
/// step 1.
pub fn adam_step(
    weight: f32,
    first_moment: f32,
    second_moment: f32,
    gradient: f32,
    learning_rate: f32,
    timestep: u32,
) -> (f32, f32, f32) {
    let m = ADAM_BETA1 * first_moment + (1.0 - ADAM_BETA1) * gradient;
    let v = ADAM_BETA2 * second_moment + (1.0 - ADAM_BETA2) * gradient * gradient;
    let step = timestep as i32 + 1;
    let m_correction = 1.0 / (1.0 - ADAM_BETA1.powi(step));
    let v_correction = 1.0 / (1.0 - ADAM_BETA2.powi(step));
    let update = learning_rate * m * m_correction / ((v * v_correction).sqrt() + ADAM_EPSILON);
    (weight - update, m, v)
}

/// Adam state for every weight tensor
///
/// Each tensor has the weight's shape plus a trailing extent of 4 holding the
/// [`AdamSlot`]s. The trailing dimension is the slowest, so each slot is a
/// contiguous run the size of the weight tensor.
#[derive(Clone, Debug)]
pub struct OptimizerState {
    pub updates: WeightSet<Tensor>,
    pub timestep: u32,
}

impl OptimizerState {
    pub fn new() -> Self {
        OptimizerState {
            updates: WeightSet::from_fn(|id| {
                let mut shape = id.shape().to_vec();
                shape.push(AdamSlot::COUNT);
                Tensor::zeros(&shape)
            }),
            timestep: 0,
        }
    }

    /// One slot of one tensor, laid out like the weight itself
    pub fn slot(&self, id: WeightId, slot: AdamSlot) -> &[f32] {
        slot_of(&self.updates[id], slot)
    }

    /// Copy every tensor's `NewWeight` slot into `weights`
    pub fn commit(&self, weights: &mut Weights) {
        weights.for_each_mut(|id, w| {
            let fresh = self.slot(id, AdamSlot::NewWeight);
            w.data_mut().copy_from_slice(fresh);
        });
    }
}

impl Default for OptimizerState {
    fn default() -> Self {
        Self::new()
    }
}

fn slot_of(update: &Tensor, slot: AdamSlot) -> &[f32] {
    let n = update.len() / AdamSlot::COUNT;
    let start = slot as usize * n;
    &update.data()[start..start + n]
}

/// Run Adam over every element, filling all four slots of `updates`
///
/// Moments are read from `updates` and written back; the live `weights` are
/// only read.
pub fn apply_adam(
    weights: &Weights,
    gradients: &WeightSet<Tensor>,
    updates: &mut WeightSet<Tensor>,
    learning_rate: f32,
    timestep: u32,
) {
    updates.for_each_mut(|id, update| {
        let w = weights[id].data();
        let g = gradients[id].data();
        let n = w.len();
        let data = update.data_mut();
        let (new_weight, rest) = data.split_at_mut(n);
        let (first, rest) = rest.split_at_mut(n);
        let (second, grad_slot) = rest.split_at_mut(n);
        for i in 0..n {
            let (nw, m, v) = adam_step(w[i], first[i], second[i], g[i], learning_rate, timestep);
            new_weight[i] = nw;
            first[i] = m;
            second[i] = v;
            grad_slot[i] = g[i];
        }
    });
}

/// Log the first non-finite input that could explain a bad prediction
///
/// Checks pipeline features, then schedule features, then each weight tensor.
/// Returns a description of the offender, if one was found.
pub fn diagnose_non_finite(weights: &Weights, batch: &BatchView<'_>) -> Option<String> {
    if let Some((coords, v)) = batch.pipeline.first_non_finite() {
        let msg = format!("pipeline feature {:?} is {}", coords, v);
        error!("{}", msg);
        return Some(msg);
    }
    for n in 0..batch.batch_size {
        for s in 0..batch.num_stages {
            if let Some(f) = batch.stage(n, s).iter().position(|v| !v.is_finite()) {
                let msg = format!(
                    "schedule feature {} of item {} stage {} is {}",
                    f,
                    n,
                    s,
                    batch.stage(n, s)[f]
                );
                error!("{}", msg);
                return Some(msg);
            }
        }
    }
    for (id, t) in weights.iter() {
        if let Some((coords, v)) = t.first_non_finite() {
            let msg = format!("weight {}{:?} is {}", id, coords, v);
            error!("{}", msg);
            return Some(msg);
        }
    }
    debug!("No non-finite inputs or weights found");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fastest_index_ties_go_low() {
        assert_eq!(fastest_index(&[3.0, 1.0, 1.0, 2.0]), 1);
        assert_eq!(fastest_index(&[5.0]), 0);
        assert_eq!(fastest_index(&[2.0, 2.0]), 0);
    }

    /// Adam at t=0 and t=1 against a manual computation
    #[test]
    fn test_adam_matches_manual_steps() {
        let lr = 0.01f32;
        let (w1, m1, v1) = adam_step(1.0, 0.0, 0.0, 0.5, lr, 0);
        assert!((m1 - 0.05).abs() < 1e-7);
        assert!((v1 - 0.00025).abs() < 1e-7);
        // Bias-corrected: m_hat = 0.5, v_hat = 0.25
        let expected = 1.0 - lr * 0.5 / (0.5 + 1e-5);
        assert!((w1 - expected).abs() < 1e-6, "{} vs {}", w1, expected);

        let (w2, m2, v2) = adam_step(w1, m1, v1, -0.25, lr, 1);
        let m = 0.9 * 0.05 - 0.1 * 0.25;
        let v = 0.999 * 0.00025 + 0.001 * 0.0625;
        assert!((m2 - m).abs() < 1e-7);
        assert!((v2 - v).abs() < 1e-7);
        let m_hat = m / (1.0 - 0.81);
        let v_hat = v / (1.0 - 0.999f32 * 0.999);
        let expected = w1 - lr * m_hat / (v_hat.sqrt() + 1e-5);
        assert!((w2 - expected).abs() < 1e-6, "{} vs {}", w2, expected);
    }

    #[test]
    fn test_zero_gradient_is_a_no_op() {
        let (w, m, v) = adam_step(0.3, 0.0, 0.0, 0.0, 0.1, 0);
        assert_eq!((w, m, v), (0.3, 0.0, 0.0));
    }

    #[test]
    fn test_apply_adam_fills_all_slots() {
        let weights = Weights::filled(1.0);
        let gradients = Weights::filled(0.5);
        let mut state = OptimizerState::new();
        apply_adam(&weights, &gradients, &mut state.updates, 0.01, 0);
        for id in WeightId::ALL {
            assert!(state.slot(id, AdamSlot::LossGradient).iter().all(|&g| g == 0.5));
            assert!(state.slot(id, AdamSlot::FirstMoment).iter().all(|&m| (m - 0.05).abs() < 1e-7));
            assert!(state.slot(id, AdamSlot::NewWeight).iter().all(|&w| w < 1.0));
        }
        let mut live = weights.clone();
        state.commit(&mut live);
        assert_eq!(live.head1_bias.data(), state.slot(WeightId::Head1Bias, AdamSlot::NewWeight));
    }

    #[test]
    fn test_diagnose_finds_pipeline_nan_first() {
        let weights = Weights::filled(f32::NAN);
        let mut pipeline = Tensor::zeros(&[HEAD1_W, HEAD1_H, 1]);
        pipeline.set(&[3, 2, 0], f32::NAN);
        let schedules = vec![0f32; HEAD2_W];
        let batch = BatchView {
            pipeline: &pipeline,
            schedules: &schedules,
            stage_capacity: 1,
            batch_size: 1,
            num_stages: 1,
            num_cores: 1,
        };
        let msg = diagnose_non_finite(&weights, &batch).unwrap();
        assert!(msg.contains("pipeline feature [3, 2, 0]"), "{}", msg);
    }

    #[test]
    fn test_diagnose_falls_through_to_weights() {
        let mut weights = Weights::filled(0.0);
        weights.head2_bias.set(&[5], f32::INFINITY);
        let pipeline = Tensor::zeros(&[HEAD1_W, HEAD1_H, 1]);
        let schedules = vec![1f32; HEAD2_W];
        let batch = BatchView {
            pipeline: &pipeline,
            schedules: &schedules,
            stage_capacity: 1,
            batch_size: 1,
            num_stages: 1,
            num_cores: 1,
        };
        let msg = diagnose_non_finite(&weights, &batch).unwrap();
        assert!(msg.starts_with("weight head2_bias[5]"), "{}", msg);
    }
}
