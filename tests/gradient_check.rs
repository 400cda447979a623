//! Compare hand-derived gradients with central finite differences.
//!
//! Weights, features and runtimes are chosen so that every relu is active
//! and no coefficient is negative; the loss is smooth around the point.
//! The penalty on negative coefficients is checked separately.

use schedcost::network::{WeightId, CONV1_CHANNELS, HEAD1_H, HEAD1_W, HEAD2_W};
use schedcost::predictor::{self, BatchView};
use schedcost::trainer::{self, fastest_index, REGULARIZATION};
use schedcost::{Tensor, Weights};

const STAGES: usize = 3;
const CORES: usize = 4;

fn patterned_weights() -> Weights {
    let mut w = Weights::zeros();
    w.for_each_mut(|_, t| {
        for (i, v) in t.data_mut().iter_mut().enumerate() {
            *v = 0.02 + 0.01 * ((i * 7) % 11) as f32;
        }
    });
    w
}

fn pipeline() -> Tensor {
    let mut p = Tensor::zeros(&[HEAD1_W, HEAD1_H, STAGES]);
    for s in 0..STAGES {
        for y in 0..HEAD1_H {
            for x in 0..HEAD1_W {
                p.set(&[x, y, s], ((x + 3 * y + 5 * s) % 9) as f32 * 0.25);
            }
        }
    }
    p
}

fn schedules(items: usize) -> Vec<f32> {
    let mut out = vec![0f32; items * HEAD2_W * STAGES];
    for n in 0..items {
        for s in 0..STAGES {
            for f in 0..HEAD2_W {
                out[n * HEAD2_W * STAGES + f + HEAD2_W * s] = (1 + (n * 31 + f * 7 + s * 3) % 17) as f32;
            }
        }
    }
    out
}

fn loss_at(weights: &Weights, pipeline: &Tensor, schedules: &[f32], runtimes: &[f32]) -> f32 {
    let batch = BatchView {
        pipeline,
        schedules,
        stage_capacity: STAGES,
        batch_size: runtimes.len(),
        num_stages: STAGES,
        num_cores: CORES,
    };
    trainer::loss_and_gradients(weights, &batch, fastest_index(runtimes), runtimes).loss
}

#[test]
fn test_gradients_match_finite_differences() {
    let weights = patterned_weights();
    let pipeline = pipeline();
    let schedules = schedules(2);
    let batch = BatchView {
        pipeline: &pipeline,
        schedules: &schedules,
        stage_capacity: STAGES,
        batch_size: 2,
        num_stages: STAGES,
        num_cores: CORES,
    };

    // Runtimes relative to the untrained predictions keep the loss moderate
    let predictions = trainer::loss_and_gradients(&weights, &batch, 0, &[1.0, 1.0]).predictions;
    let runtimes = [predictions[0] * 2.0, predictions[1] * 0.5];
    let analytic = trainer::loss_and_gradients(&weights, &batch, fastest_index(&runtimes), &runtimes);
    assert!(analytic.loss.is_finite() && analytic.loss > 0.0);

    for id in WeightId::ALL {
        let step = match id {
            WeightId::Head1Filter => 0.25,
            WeightId::Head1Bias => 0.5,
            WeightId::Head2Filter => 0.1,
            WeightId::Head2Bias => 0.5,
            WeightId::Conv1Filter => 1e-3,
            WeightId::Conv1Bias => 0.1,
        };

        // Check the element with the largest gradient in each tensor
        let grad = analytic.gradients[id].data();
        let (index, &expected) = grad
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
            .unwrap();
        assert!(expected != 0.0, "{} has an all-zero gradient", id);

        let mut plus = weights.clone();
        plus[id].data_mut()[index] += step;
        let mut minus = weights.clone();
        minus[id].data_mut()[index] -= step;
        let numeric = (loss_at(&plus, &pipeline, &schedules, &runtimes)
            - loss_at(&minus, &pipeline, &schedules, &runtimes))
            / (2.0 * step);

        let relative = ((numeric - expected) / expected).abs();
        assert!(
            relative < 0.05,
            "{}[{}]: analytic {} vs numeric {} ({:.2}% off)",
            id,
            index,
            expected,
            numeric,
            relative * 100.0
        );
    }
}

#[test]
fn test_loss_is_zero_when_predictions_match_runtimes() {
    let weights = patterned_weights();
    let pipeline = pipeline();
    let schedules = schedules(3);
    let batch = BatchView {
        pipeline: &pipeline,
        schedules: &schedules,
        stage_capacity: STAGES,
        batch_size: 3,
        num_stages: STAGES,
        num_cores: CORES,
    };
    let predictions = trainer::loss_and_gradients(&weights, &batch, 0, &[1.0; 3]).predictions;

    let exact = trainer::loss_and_gradients(&weights, &batch, fastest_index(&predictions), &predictions);
    assert!(exact.loss.abs() < 1e-6, "loss {}", exact.loss);
}

#[test]
fn test_negative_coefficients_are_penalized() {
    let mut weights = patterned_weights();
    for b in &mut weights[WeightId::Conv1Bias].data_mut()[..16] {
        *b = -1000.0;
    }
    let pipeline = pipeline();
    let schedules = schedules(2);
    let batch = BatchView {
        pipeline: &pipeline,
        schedules: &schedules,
        stage_capacity: STAGES,
        batch_size: 2,
        num_stages: STAGES,
        num_cores: CORES,
    };

    // Runtimes equal to the predictions leave only the penalty in the loss
    let predictions = trainer::loss_and_gradients(&weights, &batch, 0, &[1.0, 1.0]).predictions;
    assert!(predictions.iter().all(|&p| p > 0.0), "{:?}", predictions);
    let result = trainer::loss_and_gradients(&weights, &batch, fastest_index(&predictions), &predictions);

    let embedding = predictor::embed_pipeline(&weights, &pipeline, STAGES);
    let mut penalty = 0f32;
    let mut negative = [0usize; CONV1_CHANNELS];
    for n in 0..2 {
        for trace in predictor::trace_item(&weights, &embedding, &batch, n) {
            for (c, &v) in trace.stage2.iter().enumerate() {
                if v < 0.0 {
                    penalty -= v;
                    negative[c] += 1;
                }
            }
        }
    }
    assert!(negative[..16].iter().all(|&k| k == 2 * STAGES), "{:?}", negative);
    assert!(negative[16..].iter().all(|&k| k == 0), "{:?}", negative);

    let expected_loss = REGULARIZATION * penalty;
    assert!(
        ((result.loss - expected_loss) / expected_loss).abs() < 1e-4,
        "loss {} vs penalty {}",
        result.loss,
        expected_loss
    );

    // Each negative coefficient pulls its bias up by the regularization weight
    let grad = result.gradients[WeightId::Conv1Bias].data();
    for c in 0..CONV1_CHANNELS {
        let expected = -REGULARIZATION * negative[c] as f32;
        assert!(
            (grad[c] - expected).abs() < 1e-9,
            "conv1_bias[{}]: {} vs {}",
            c,
            grad[c],
            expected
        );
    }

    // The coefficient stays negative across the step, so the loss is linear in it
    let step = 10.0;
    let mut plus = weights.clone();
    plus[WeightId::Conv1Bias].data_mut()[0] += step;
    let mut minus = weights.clone();
    minus[WeightId::Conv1Bias].data_mut()[0] -= step;
    let numeric = (loss_at(&plus, &pipeline, &schedules, &predictions)
        - loss_at(&minus, &pipeline, &schedules, &predictions))
        / (2.0 * step);
    assert!(
        ((numeric - grad[0]) / grad[0]).abs() < 0.01,
        "analytic {} vs numeric {}",
        grad[0],
        numeric
    );
}
