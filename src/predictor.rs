//! Forward Pass
//!
//! Turns a batch of feature vectors into predicted runtimes (seconds).
//!
//! The network does not predict runtime directly. It predicts 32 non-negative
//! coefficients per stage, and the runtime of a stage is the dot product of
//! those coefficients with hand-engineered cost multipliers derived from the
//! raw schedule features (compute, load, store, malloc, parallelism and
//! working-set terms). The cost is therefore linear in the coefficients,
//! which keeps the backward pass simple.
//!
//! Every function here is pure; [`StageTrace`] keeps the intermediate values
//! the trainer needs for gradients.

use crate::featurization::StageFeatures;
use crate::network::{
    CONV1_CHANNELS, HEAD1_CHANNELS, HEAD1_H, HEAD1_W, HEAD2_CHANNELS, HEAD2_W,
};
use crate::tensor::Tensor;
use crate::weights::Weights;

/// Seconds per unit of modelled cost
pub const COST_SCALE: f32 = 1e-9;

/// Read-only view of one batch of queued features
#[derive(Clone, Copy, Debug)]
pub struct BatchView<'a> {
    /// Pipeline features, shape `[HEAD1_W, HEAD1_H, max_stages]`
    pub pipeline: &'a Tensor,
    /// Item-major schedule features; item `n`, stage `s`, feature `f` lives at
    /// `n * HEAD2_W * stage_capacity + f + HEAD2_W * s`
    pub schedules: &'a [f32],
    pub stage_capacity: usize,
    pub batch_size: usize,
    pub num_stages: usize,
    pub num_cores: usize,
}

impl<'a> BatchView<'a> {
    /// All stage blocks of item `n`
    pub fn item(&self, n: usize) -> &'a [f32] {
        let stride = HEAD2_W * self.stage_capacity;
        &self.schedules[n * stride..(n + 1) * stride]
    }

    /// Raw features of item `n` at stage `s`
    pub fn stage(&self, n: usize, s: usize) -> &'a [f32] {
        &self.item(n)[s * HEAD2_W..(s + 1) * HEAD2_W]
    }
}

/// Intermediate values of one (item, stage) pair
#[derive(Clone, Debug)]
pub struct StageTrace {
    /// `ln(1 + raw)` of each schedule feature
    pub norm: [f32; HEAD2_W],
    /// Schedule embedding before the relu
    pub head2_pre: [f32; HEAD2_CHANNELS],
    pub head2: [f32; HEAD2_CHANNELS],
    /// Coefficients before the relu
    pub stage2: [f32; CONV1_CHANNELS],
    pub multipliers: [f32; CONV1_CHANNELS],
    /// Modelled cost of the stage, before `COST_SCALE`
    pub cost: f32,
}

impl StageTrace {
    pub fn coefficient(&self, c: usize) -> f32 {
        self.stage2[c].max(0.0)
    }

    /// `Σ max(0, -stage2)`, the penalty for negative coefficients
    pub fn negativity(&self) -> f32 {
        self.stage2.iter().map(|v| (-v).max(0.0)).sum()
    }
}

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Algorithm embedding per stage
///
/// `head1[s][c] = head1_bias[c] + Σ sigmoid(head1_filter[c,x,y]) * pipeline[x,y,s]`.
/// It depends only on the pipeline, so a batch computes it once.
pub fn embed_pipeline(
    weights: &Weights,
    pipeline: &Tensor,
    num_stages: usize,
) -> Vec<[f32; HEAD1_CHANNELS]> {
    let filter = weights.head1_filter.data();
    let bias = weights.head1_bias.data();
    let squashed: Vec<f32> = filter.iter().map(|&v| sigmoid(v)).collect();
    let features = pipeline.data();

    (0..num_stages)
        .map(|s| {
            let mut out = [0f32; HEAD1_CHANNELS];
            for (c, o) in out.iter_mut().enumerate() {
                let mut acc = bias[c];
                for y in 0..HEAD1_H {
                    for x in 0..HEAD1_W {
                        acc += squashed[c + HEAD1_CHANNELS * (x + HEAD1_W * y)]
                            * features[x + HEAD1_W * (y + HEAD1_H * s)];
                    }
                }
                *o = acc;
            }
            out
        })
        .collect()
}

/// Hand-engineered cost multipliers for one stage
///
/// Entry `c` is what coefficient `c` gets multiplied by. Indices 4 and 28..32
/// are unused and stay zero.
pub fn cost_multipliers(f: &StageFeatures, stage: usize, num_cores: usize) -> [f32; CONV1_CHANNELS] {
    let mut m = [0f32; CONV1_CHANNELS];
    let ip = f.inner_parallelism;
    let op = f.outer_parallelism;

    // Compute, rounded up by how evenly tasks fill the cores
    let num_tasks = (ip * op).max(1.0);
    let tasks_per_core = num_tasks / (num_cores as f32).max(1.0);
    let idle_core_wastage = tasks_per_core.ceil() / tasks_per_core.max(1.0);
    let compute = if f.inlined_calls == 0.0 { 0 } else { 2 };
    m[compute] = f.vector_size * f.num_vectors * idle_core_wastage;
    m[compute + 1] = f.num_scalars * idle_core_wastage;

    // Loads
    m[5] = f.num_realizations * f.unique_lines_read_per_realization;
    m[6] = f.num_realizations * f.unique_bytes_read_per_realization;
    m[7] = f.num_vectors * f.vector_loads_per_vector;
    m[8] = f.num_scalars * f.scalar_loads_per_scalar;
    m[9] = f.num_vectors * f.scalar_loads_per_vector;
    m[10] = f.num_scalars * f.unique_bytes_read_per_vector;
    m[11] = f.num_vectors * f.unique_bytes_read_per_vector;
    m[12] = f.num_scalars * f.unique_lines_read_per_vector;
    m[13] = f.num_vectors * f.unique_lines_read_per_vector;
    m[14] = num_tasks * f.unique_bytes_read_per_task;
    m[15] = num_tasks * f.unique_lines_read_per_task;

    // Stores. Trained weight files expect the store term to be counted twice.
    let innermost = f.innermost_bytes_at_task.max(1.0);
    let lines_written = ip * (f.bytes_at_task / innermost);
    let (alpha, beta) = if ip > 1.0 {
        (16, 19)
    } else if stage == 0 {
        (17, 20)
    } else {
        (18, 21)
    };
    m[alpha] = 2.0 * f.num_realizations * lines_written;
    m[beta] = 2.0 * f.num_realizations * f.bytes_at_realization;
    if ip > 1.0 {
        m[22] = 2.0 * (f.num_vectors + f.num_scalars) / innermost;
    }
    let threads_per_page_fault = ip.min(4096.0 / innermost);
    m[23] = 2.0 * f.bytes_at_production * threads_per_page_fault * ip * op;

    m[24] = f.num_realizations;
    if ip > 1.0 {
        m[25] = f.num_productions;
    }
    m[26] = f.num_productions * (ip - 1.0);
    m[27] = f.working_set;
    m
}

/// Run one stage of one item through the network
pub fn trace_stage(
    weights: &Weights,
    head1: &[f32; HEAD1_CHANNELS],
    raw: &[f32],
    stage: usize,
    num_cores: usize,
) -> StageTrace {
    let h2f = weights.head2_filter.data();
    let h2b = weights.head2_bias.data();
    let cf = weights.conv1_filter.data();
    let cb = weights.conv1_bias.data();

    let mut norm = [0f32; HEAD2_W];
    for (n, &r) in norm.iter_mut().zip(raw) {
        *n = r.ln_1p();
    }

    let mut head2_pre = [0f32; HEAD2_CHANNELS];
    let mut head2 = [0f32; HEAD2_CHANNELS];
    for c in 0..HEAD2_CHANNELS {
        let mut acc = h2b[c];
        for (f, &v) in norm.iter().enumerate() {
            acc += h2f[c + HEAD2_CHANNELS * f] * v;
        }
        head2_pre[c] = acc;
        head2[c] = acc.max(0.0);
    }

    let mut stage2 = [0f32; CONV1_CHANNELS];
    for (c, out) in stage2.iter_mut().enumerate() {
        let mut acc = cb[c];
        for (k, &v) in head1.iter().enumerate() {
            acc += cf[c + CONV1_CHANNELS * k] * v;
        }
        for (k, &v) in head2.iter().enumerate() {
            acc += cf[c + CONV1_CHANNELS * (HEAD1_CHANNELS + k)] * v;
        }
        *out = acc;
    }

    let multipliers = cost_multipliers(&StageFeatures::unpack(raw), stage, num_cores);
    let cost = stage2
        .iter()
        .zip(&multipliers)
        .map(|(s, m)| s.max(0.0) * m)
        .sum();

    StageTrace {
        norm,
        head2_pre,
        head2,
        stage2,
        multipliers,
        cost,
    }
}

/// Trace every stage of item `n`
pub fn trace_item(
    weights: &Weights,
    embedding: &[[f32; HEAD1_CHANNELS]],
    batch: &BatchView<'_>,
    n: usize,
) -> Vec<StageTrace> {
    (0..batch.num_stages)
        .map(|s| trace_stage(weights, &embedding[s], batch.stage(n, s), s, batch.num_cores))
        .collect()
}

/// Predicted runtime from a traced item
pub fn prediction_of(stages: &[StageTrace]) -> f32 {
    stages.iter().map(|t| COST_SCALE * t.cost).sum()
}

/// Predicted runtime for every item of the batch
pub fn predict(weights: &Weights, batch: &BatchView<'_>) -> Vec<f32> {
    let embedding = embed_pipeline(weights, batch.pipeline, batch.num_stages);
    (0..batch.batch_size)
        .map(|n| prediction_of(&trace_item(weights, &embedding, batch, n)))
        .collect()
}

/// Predicted seconds split by cost term
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize)]
pub struct CostBreakdown {
    pub compute: f32,
    pub load: f32,
    pub store: f32,
    pub malloc: f32,
    pub parallelism: f32,
    pub working_set: f32,
}

impl CostBreakdown {
    pub fn of(trace: &StageTrace) -> Self {
        let term = |range: std::ops::Range<usize>| -> f32 {
            range
                .map(|c| trace.coefficient(c) * trace.multipliers[c])
                .sum::<f32>()
                * COST_SCALE
        };
        CostBreakdown {
            compute: term(0..4),
            load: term(5..16),
            store: term(16..24),
            malloc: term(24..25),
            parallelism: term(25..27),
            working_set: term(27..28),
        }
    }

    pub fn total(&self) -> f32 {
        self.compute + self.load + self.store + self.malloc + self.parallelism + self.working_set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(values: &[(usize, f32)]) -> StageFeatures {
        let mut raw = [0f32; HEAD2_W];
        for &(i, v) in values {
            raw[i] = v;
        }
        StageFeatures::unpack(&raw)
    }

    #[test]
    fn test_compute_terms_switch_on_inlining() {
        // vector_size=4, num_vectors=10, num_scalars=3, single task
        let plain = features(&[(22, 4.0), (24, 10.0), (25, 3.0)]);
        let m = cost_multipliers(&plain, 1, 1);
        assert_eq!((m[0], m[1], m[2], m[3]), (40.0, 3.0, 0.0, 0.0));

        let inlined = features(&[(17, 1.0), (22, 4.0), (24, 10.0), (25, 3.0)]);
        let m = cost_multipliers(&inlined, 1, 1);
        assert_eq!((m[0], m[1], m[2], m[3]), (0.0, 0.0, 40.0, 3.0));
    }

    #[test]
    fn test_idle_core_wastage() {
        // 6 tasks on 4 cores: ceil(1.5) / 1.5
        let f = features(&[(9, 2.0), (10, 3.0), (25, 3.0)]);
        let m = cost_multipliers(&f, 0, 4);
        assert!((m[1] - 3.0 * 2.0 / 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_false_sharing_and_page_fault_terms() {
        // ip=8, op=2, bytes_at_production=3, num_vectors=10, num_scalars=6
        let parallel = |innermost: f32| {
            features(&[
                (9, 8.0),
                (10, 2.0),
                (12, 3.0),
                (24, 10.0),
                (25, 6.0),
                (30, innermost),
            ])
        };

        let m = cost_multipliers(&parallel(4.0), 1, 4);
        assert_eq!(m[22], 2.0 * 16.0 / 4.0);
        // 4096 / 4 pages leave all 8 inner threads faulting
        assert_eq!(m[23], 2.0 * 3.0 * 8.0 * 16.0);

        // 4096 / 1024 clamps the faulting threads to 4
        let m = cost_multipliers(&parallel(1024.0), 1, 4);
        assert_eq!(m[22], 2.0 * 16.0 / 1024.0);
        assert_eq!(m[23], 2.0 * 3.0 * 4.0 * 16.0);

        // Serial loops never false-share; a zero innermost size counts as one byte
        let serial = features(&[(9, 1.0), (10, 2.0), (12, 3.0), (24, 10.0), (25, 6.0)]);
        let m = cost_multipliers(&serial, 1, 4);
        assert_eq!(m[22], 0.0);
        assert_eq!(m[23], 2.0 * 3.0 * 1.0 * 2.0);
    }

    #[test]
    fn test_store_coefficient_selection() {
        let serial = features(&[(0, 1.0), (9, 1.0), (11, 5.0)]);
        assert_eq!(cost_multipliers(&serial, 0, 1)[20], 10.0);
        assert_eq!(cost_multipliers(&serial, 3, 1)[21], 10.0);

        let parallel = features(&[(0, 1.0), (9, 2.0), (11, 5.0)]);
        let m = cost_multipliers(&parallel, 0, 1);
        assert_eq!(m[19], 10.0);
        assert_eq!(m[20], 0.0);
    }

    #[test]
    fn test_unused_coefficients_stay_zero() {
        let raw: Vec<f32> = (0..HEAD2_W).map(|i| 1.0 + i as f32).collect();
        let m = cost_multipliers(&StageFeatures::unpack(&raw), 2, 8);
        assert_eq!(m[4], 0.0);
        assert!(m[28..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_breakdown_sums_to_stage_cost() {
        let mut weights = Weights::filled(0.1);
        weights.head1_filter.fill(0.0);
        let pipeline = Tensor::filled(&[HEAD1_W, HEAD1_H, 2], 1.0);
        let schedules: Vec<f32> = (0..HEAD2_W * 2).map(|i| 1.0 + (i % 5) as f32).collect();
        let batch = BatchView {
            pipeline: &pipeline,
            schedules: &schedules,
            stage_capacity: 2,
            batch_size: 1,
            num_stages: 2,
            num_cores: 4,
        };
        let embedding = embed_pipeline(&weights, &pipeline, 2);
        let stages = trace_item(&weights, &embedding, &batch, 0);
        let total: f32 = stages.iter().map(|t| CostBreakdown::of(t).total()).sum();
        let predicted = prediction_of(&stages);
        assert!(predicted > 0.0);
        assert!((total - predicted).abs() <= 1e-4 * predicted);
    }
}
