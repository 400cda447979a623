//! schedcost: Learned Throughput Cost Model for Loop Schedules
//!
//! This library predicts the runtime of candidate loop schedules so that an
//! autoscheduler can rank far more candidates than it could ever benchmark:
//! 1. Describe a pipeline with per-stage algorithm features
//! 2. Queue candidate schedules with their per-stage schedule features
//! 3. Evaluate the batch and read predicted runtimes from caller-owned slots
//! 4. Optionally train on measured runtimes to refine the weights
//!
//! # Core Flow
//! ```text
//! pipeline features ─┐
//!                    ├─ FeatureQueue ─ ThroughputKernel ─ predictions ─ CostSlots
//! schedule features ─┘         │               │
//!                           backprop ── Adam ── Weights ── .weights file / legacy dir
//! ```
//!
//! # Module Organization
//!
//! ## Model
//! - [`network`]: Architecture constants, [`WeightId`] and [`WeightSet`]
//! - [`tensor`]: Dense f32 tensors with first-extent-fastest layout
//! - [`featurization`]: Named view of the 39 per-stage schedule features
//! - [`predictor`]: Forward pass and hand-engineered cost terms
//! - [`trainer`]: Relative-throughput loss, gradients and Adam
//! - [`kernel`]: The inference/training seam ([`ThroughputKernel`])
//!
//! ## Orchestration
//! - [`queue`]: Fixed-capacity feature queue and [`CostSlot`]s
//! - [`cost_model`]: [`LearnedCostModel`], the entry point for searches
//! - [`config`]: Configuration and environment surface
//!
//! ## Persistence and Training Data
//! - [`weights`]: Binary and legacy weight formats, embedded baseline
//! - [`samples`]: `.sample` file parsing and grouping
//! - [`retrain`]: Offline retraining loop with per-epoch reports
//! - [`error`]: Recoverable error types

// ============================================================================
// Model
// ============================================================================

pub mod featurization; // Named schedule features
pub mod kernel; // Inference/training seam
pub mod network; // Fixed architecture
pub mod predictor; // Forward pass
pub mod tensor;
pub mod trainer; // Loss, gradients, Adam

// ============================================================================
// Orchestration
// ============================================================================

pub mod config;
pub mod cost_model;
pub mod queue;

// ============================================================================
// Persistence and Training Data
// ============================================================================

pub mod error;
pub mod retrain;
pub mod samples; // .sample ingestion
pub mod weights; // .weights files and legacy directories

pub use config::CostModelConfig;
pub use cost_model::{CostModel, LearnedCostModel};
pub use error::{SampleError, WeightsError};
pub use kernel::{KernelOutput, NativeKernel, ThroughputKernel};
pub use network::{WeightId, WeightSet};
pub use queue::{CostSlot, QueueState, ScheduleFeaturesMut};
pub use tensor::Tensor;
pub use weights::Weights;
