//! Feature Queue
//!
//! Schedules are evaluated in batches. The queue holds the schedule features
//! of up to `capacity` items together with the caller's result slot for each
//! one, and moves through three states:
//!
//! ```text
//! Empty --enqueue--> Filling --enqueue (capacity reached)--> Full
//!   ^                   |                                     |
//!   +------- flush / reset -------------------------------------+
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error};

use crate::featurization::StageFeatures;
use crate::network::HEAD2_W;

/// Caller-owned handle the model writes a predicted runtime into
///
/// Clones share the same cell, so the caller keeps one clone and hands the
/// other to [`crate::CostModel::enqueue`].
#[derive(Clone, Debug, Default)]
pub struct CostSlot(Arc<Mutex<Option<f64>>>);

impl CostSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, cost: f64) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(cost);
    }

    /// The last value written, if any
    pub fn get(&self) -> Option<f64> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn take(&self) -> Option<f64> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueState {
    Empty,
    Filling,
    Full,
}

/// Writable schedule features of one queued item
///
/// Stage `s`, feature `f` lives at `f + HEAD2_W * s`. The block starts zeroed.
#[derive(Debug)]
pub struct ScheduleFeaturesMut<'a> {
    data: &'a mut [f32],
    num_stages: usize,
}

impl<'a> ScheduleFeaturesMut<'a> {
    pub fn num_stages(&self) -> usize {
        self.num_stages
    }

    pub fn set(&mut self, stage: usize, feature: usize, value: f32) {
        assert!(stage < self.num_stages && feature < HEAD2_W);
        self.data[feature + HEAD2_W * stage] = value;
    }

    pub fn get(&self, stage: usize, feature: usize) -> f32 {
        self.data[feature + HEAD2_W * stage]
    }

    /// Raw features of one stage
    pub fn stage_mut(&mut self, stage: usize) -> &mut [f32] {
        assert!(stage < self.num_stages);
        &mut self.data[HEAD2_W * stage..HEAD2_W * (stage + 1)]
    }

    pub fn set_stage(&mut self, stage: usize, features: &StageFeatures) {
        self.stage_mut(stage).copy_from_slice(&features.pack());
    }

    /// Fill from a `[HEAD2_W, num_stages]` buffer
    pub fn copy_from(&mut self, raw: &[f32]) {
        let n = HEAD2_W * self.num_stages;
        self.data[..n].copy_from_slice(&raw[..n]);
    }
}

/// Fixed-capacity batch of schedule features and their result slots
#[derive(Debug)]
pub struct FeatureQueue {
    capacity: usize,
    stage_capacity: usize,
    schedules: Vec<f32>,
    slots: Vec<CostSlot>,
}

impl FeatureQueue {
    /// An unallocated queue; storage is sized on first use
    pub fn new(capacity: usize) -> Self {
        FeatureQueue {
            capacity,
            stage_capacity: 0,
            schedules: Vec::new(),
            slots: Vec::with_capacity(capacity),
        }
    }

    pub fn state(&self) -> QueueState {
        match self.slots.len() {
            0 => QueueState::Empty,
            n if n >= self.capacity => QueueState::Full,
            _ => QueueState::Filling,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stage_capacity(&self) -> usize {
        self.stage_capacity
    }

    /// Make room for items with up to `stages` stages
    ///
    /// # Panics
    /// If storage must grow while items are pending.
    pub fn reserve_stages(&mut self, stages: usize) {
        if !self.schedules.is_empty() && stages <= self.stage_capacity {
            return;
        }
        if !self.is_empty() {
            error!(
                "Cannot grow the feature queue from {} to {} stages with {} items pending",
                self.stage_capacity,
                stages,
                self.len()
            );
            panic!("feature queue reallocated with pending items");
        }
        debug!(
            "Allocating feature queue: {} items x {} stages",
            self.capacity, stages
        );
        self.stage_capacity = stages;
        self.schedules = vec![0.0; self.capacity * HEAD2_W * stages];
    }

    /// Append an item and return its zeroed feature block
    ///
    /// # Panics
    /// If the queue is full or `num_stages` exceeds the stage capacity.
    pub fn push(&mut self, num_stages: usize, slot: CostSlot) -> ScheduleFeaturesMut<'_> {
        assert!(self.state() != QueueState::Full, "push onto a full feature queue");
        assert!(num_stages <= self.stage_capacity);
        let stride = HEAD2_W * self.stage_capacity;
        let start = self.slots.len() * stride;
        self.slots.push(slot);
        let data = &mut self.schedules[start..start + stride];
        data.iter_mut().for_each(|v| *v = 0.0);
        ScheduleFeaturesMut { data, num_stages }
    }

    /// All pending items' features, item-major
    pub fn schedules(&self) -> &[f32] {
        let stride = HEAD2_W * self.stage_capacity;
        &self.schedules[..self.len() * stride]
    }

    pub fn slots(&self) -> &[CostSlot] {
        &self.slots
    }

    /// Drop every pending item without writing results
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}
