//! Network Architecture
//!
//! The cost model is a fixed, small network. Every shape here is a
//! compile-time constant and stays the same for the lifetime of the process;
//! weight files are validated against these shapes on load.
//!
//! ```text
//! pipeline features [W1,H1,s] ──σ(head1)──▶ algorithm embedding [C1,s] ─┐
//!                                                                      ├─ conv1 ─ relu ─▶ 32 coefficients/stage
//! schedule features [W2,s] ─log1p─ head2 ─ relu ─▶ schedule emb. [C2,s] ┘
//! ```

use std::fmt;
use std::ops::{Index, IndexMut};

use crate::tensor::Tensor;

/// Channels produced by the algorithm (pipeline) embedding
pub const HEAD1_CHANNELS: usize = 8;
/// Pipeline feature window width
pub const HEAD1_W: usize = 40;
/// Pipeline feature window height
pub const HEAD1_H: usize = 7;

/// Channels produced by the schedule embedding
pub const HEAD2_CHANNELS: usize = 24;
/// Schedule features per stage
pub const HEAD2_W: usize = 39;

/// Learned cost coefficients per stage
pub const CONV1_CHANNELS: usize = 32;

/// Schedules evaluated per batch
pub const BATCH_CAPACITY: usize = 1024;

/// The six weight tensors, in file order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WeightId {
    Head1Filter,
    Head1Bias,
    Head2Filter,
    Head2Bias,
    Conv1Filter,
    Conv1Bias,
}

impl WeightId {
    /// All tensors in the fixed order used by every file format and PRNG stream
    pub const ALL: [WeightId; 6] = [
        WeightId::Head1Filter,
        WeightId::Head1Bias,
        WeightId::Head2Filter,
        WeightId::Head2Bias,
        WeightId::Conv1Filter,
        WeightId::Conv1Bias,
    ];

    pub fn name(self) -> &'static str {
        match self {
            WeightId::Head1Filter => "head1_filter",
            WeightId::Head1Bias => "head1_bias",
            WeightId::Head2Filter => "head2_filter",
            WeightId::Head2Bias => "head2_bias",
            WeightId::Conv1Filter => "conv1_filter",
            WeightId::Conv1Bias => "conv1_bias",
        }
    }

    /// File name in the legacy one-file-per-tensor directory layout
    pub fn legacy_file_name(self) -> &'static str {
        match self {
            WeightId::Head1Filter => "head1_conv1_weight.data",
            WeightId::Head1Bias => "head1_conv1_bias.data",
            WeightId::Head2Filter => "head2_conv1_weight.data",
            WeightId::Head2Bias => "head2_conv1_bias.data",
            WeightId::Conv1Filter => "trunk_conv1_weight.data",
            WeightId::Conv1Bias => "trunk_conv1_bias.data",
        }
    }

    /// Architecture-fixed shape
    pub fn shape(self) -> &'static [usize] {
        match self {
            WeightId::Head1Filter => &[HEAD1_CHANNELS, HEAD1_W, HEAD1_H],
            WeightId::Head1Bias => &[HEAD1_CHANNELS],
            WeightId::Head2Filter => &[HEAD2_CHANNELS, HEAD2_W],
            WeightId::Head2Bias => &[HEAD2_CHANNELS],
            WeightId::Conv1Filter => &[CONV1_CHANNELS, HEAD1_CHANNELS + HEAD2_CHANNELS],
            WeightId::Conv1Bias => &[CONV1_CHANNELS],
        }
    }

    pub fn num_elements(self) -> usize {
        self.shape().iter().product()
    }
}

impl fmt::Display for WeightId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One value per weight tensor
///
/// Used for the weights themselves (`WeightSet<Tensor>`), their gradients,
/// and the per-tensor optimizer state.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightSet<T> {
    pub head1_filter: T,
    pub head1_bias: T,
    pub head2_filter: T,
    pub head2_bias: T,
    pub conv1_filter: T,
    pub conv1_bias: T,
}

impl<T> WeightSet<T> {
    /// Build a set by calling `f` once per tensor, in file order
    pub fn from_fn(mut f: impl FnMut(WeightId) -> T) -> Self {
        WeightSet {
            head1_filter: f(WeightId::Head1Filter),
            head1_bias: f(WeightId::Head1Bias),
            head2_filter: f(WeightId::Head2Filter),
            head2_bias: f(WeightId::Head2Bias),
            conv1_filter: f(WeightId::Conv1Filter),
            conv1_bias: f(WeightId::Conv1Bias),
        }
    }

    /// Fallible variant of [`WeightSet::from_fn`]; stops at the first error
    pub fn try_from_fn<E>(mut f: impl FnMut(WeightId) -> Result<T, E>) -> Result<Self, E> {
        Ok(WeightSet {
            head1_filter: f(WeightId::Head1Filter)?,
            head1_bias: f(WeightId::Head1Bias)?,
            head2_filter: f(WeightId::Head2Filter)?,
            head2_bias: f(WeightId::Head2Bias)?,
            conv1_filter: f(WeightId::Conv1Filter)?,
            conv1_bias: f(WeightId::Conv1Bias)?,
        })
    }

    /// Tensors paired with their ids, in file order
    pub fn iter(&self) -> impl Iterator<Item = (WeightId, &T)> {
        WeightId::ALL.into_iter().map(move |id| (id, &self[id]))
    }

    /// Visit each tensor mutably, in file order
    pub fn for_each_mut(&mut self, mut f: impl FnMut(WeightId, &mut T)) {
        for id in WeightId::ALL {
            f(id, &mut self[id]);
        }
    }
}

impl WeightSet<Tensor> {
    /// Every tensor zero-filled at its architecture shape
    pub fn zeros() -> Self {
        Self::from_fn(|id| Tensor::zeros(id.shape()))
    }

    /// Every element of every tensor set to `value`
    pub fn filled(value: f32) -> Self {
        Self::from_fn(|id| Tensor::filled(id.shape(), value))
    }

    pub fn total_elements(&self) -> usize {
        self.iter().map(|(_, t)| t.len()).sum()
    }

    /// Bitwise comparison of every tensor
    pub fn bits_eq_all(&self, other: &Self) -> bool {
        self.iter().all(|(id, t)| t.bits_eq(&other[id]))
    }
}

impl<T> Index<WeightId> for WeightSet<T> {
    type Output = T;

    fn index(&self, id: WeightId) -> &T {
        match id {
            WeightId::Head1Filter => &self.head1_filter,
            WeightId::Head1Bias => &self.head1_bias,
            WeightId::Head2Filter => &self.head2_filter,
            WeightId::Head2Bias => &self.head2_bias,
            WeightId::Conv1Filter => &self.conv1_filter,
            WeightId::Conv1Bias => &self.conv1_bias,
        }
    }
}

impl<T> IndexMut<WeightId> for WeightSet<T> {
    fn index_mut(&mut self, id: WeightId) -> &mut T {
        match id {
            WeightId::Head1Filter => &mut self.head1_filter,
            WeightId::Head1Bias => &mut self.head1_bias,
            WeightId::Head2Filter => &mut self.head2_filter,
            WeightId::Head2Bias => &mut self.head2_bias,
            WeightId::Conv1Filter => &mut self.conv1_filter,
            WeightId::Conv1Bias => &mut self.conv1_bias,
        }
    }
}
