//! Schedule Feature Layout
//!
//! The feature extractor writes `HEAD2_W` floats per stage, in the order of
//! the fields below. That order is a contract with the extractor: reordering
//! fields here silently corrupts every prediction.

use crate::network::HEAD2_W;

/// Hand-engineered per-stage features, unpacked from the raw vector
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StageFeatures {
    // Counts of realizations/productions and points computed
    pub num_realizations: f32,
    pub num_productions: f32,
    pub points_computed_per_realization: f32,
    pub points_computed_per_production: f32,
    pub points_computed_total: f32,
    pub points_computed_minimum: f32,

    // Loop structure
    pub innermost_loop_extent: f32,
    pub innermost_pure_loop_extent: f32,
    pub unrolled_loop_extent: f32,

    // Parallelism
    pub inner_parallelism: f32,
    pub outer_parallelism: f32,

    // Bytes touched at each level
    pub bytes_at_realization: f32,
    pub bytes_at_production: f32,
    pub bytes_at_root: f32,
    pub innermost_bytes_at_realization: f32,
    pub innermost_bytes_at_production: f32,
    pub innermost_bytes_at_root: f32,

    pub inlined_calls: f32,

    pub unique_bytes_read_per_realization: f32,
    pub unique_lines_read_per_realization: f32,
    pub allocation_bytes_read_per_realization: f32,

    pub working_set: f32,

    // Vectorization and load mix
    pub vector_size: f32,
    pub native_vector_size: f32,
    pub num_vectors: f32,
    pub num_scalars: f32,
    pub vector_loads_per_vector: f32,
    pub scalar_loads_per_vector: f32,
    pub scalar_loads_per_scalar: f32,

    // Per-task traffic
    pub bytes_at_task: f32,
    pub innermost_bytes_at_task: f32,
    pub unique_bytes_read_per_vector: f32,
    pub unique_lines_read_per_vector: f32,
    pub unique_bytes_read_per_task: f32,
    pub unique_lines_read_per_task: f32,

    // Working set at each level
    pub working_set_at_task: f32,
    pub working_set_at_production: f32,
    pub working_set_at_realization: f32,
    pub working_set_at_root: f32,
}

impl StageFeatures {
    /// Unpack one stage's raw feature vector
    ///
    /// # Panics
    /// If `raw` is shorter than `HEAD2_W`.
    pub fn unpack(raw: &[f32]) -> Self {
        assert!(
            raw.len() >= HEAD2_W,
            "stage feature vector has {} entries, need {}",
            raw.len(),
            HEAD2_W
        );
        let mut it = raw.iter().copied();
        let mut next = || it.next().unwrap_or_default();
        StageFeatures {
            num_realizations: next(),
            num_productions: next(),
            points_computed_per_realization: next(),
            points_computed_per_production: next(),
            points_computed_total: next(),
            points_computed_minimum: next(),
            innermost_loop_extent: next(),
            innermost_pure_loop_extent: next(),
            unrolled_loop_extent: next(),
            inner_parallelism: next(),
            outer_parallelism: next(),
            bytes_at_realization: next(),
            bytes_at_production: next(),
            bytes_at_root: next(),
            innermost_bytes_at_realization: next(),
            innermost_bytes_at_production: next(),
            innermost_bytes_at_root: next(),
            inlined_calls: next(),
            unique_bytes_read_per_realization: next(),
            unique_lines_read_per_realization: next(),
            allocation_bytes_read_per_realization: next(),
            working_set: next(),
            vector_size: next(),
            native_vector_size: next(),
            num_vectors: next(),
            num_scalars: next(),
            vector_loads_per_vector: next(),
            scalar_loads_per_vector: next(),
            scalar_loads_per_scalar: next(),
            bytes_at_task: next(),
            innermost_bytes_at_task: next(),
            unique_bytes_read_per_vector: next(),
            unique_lines_read_per_vector: next(),
            unique_bytes_read_per_task: next(),
            unique_lines_read_per_task: next(),
            working_set_at_task: next(),
            working_set_at_production: next(),
            working_set_at_realization: next(),
            working_set_at_root: next(),
        }
    }

    /// Inverse of [`StageFeatures::unpack`]
    pub fn pack(&self) -> [f32; HEAD2_W] {
        [
            self.num_realizations,
            self.num_productions,
            self.points_computed_per_realization,
            self.points_computed_per_production,
            self.points_computed_total,
            self.points_computed_minimum,
            self.innermost_loop_extent,
            self.innermost_pure_loop_extent,
            self.unrolled_loop_extent,
            self.inner_parallelism,
            self.outer_parallelism,
            self.bytes_at_realization,
            self.bytes_at_production,
            self.bytes_at_root,
            self.innermost_bytes_at_realization,
            self.innermost_bytes_at_production,
            self.innermost_bytes_at_root,
            self.inlined_calls,
            self.unique_bytes_read_per_realization,
            self.unique_lines_read_per_realization,
            self.allocation_bytes_read_per_realization,
            self.working_set,
            self.vector_size,
            self.native_vector_size,
            self.num_vectors,
            self.num_scalars,
            self.vector_loads_per_vector,
            self.scalar_loads_per_vector,
            self.scalar_loads_per_scalar,
            self.bytes_at_task,
            self.innermost_bytes_at_task,
            self.unique_bytes_read_per_vector,
            self.unique_lines_read_per_vector,
            self.unique_bytes_read_per_task,
            self.unique_lines_read_per_task,
            self.working_set_at_task,
            self.working_set_at_production,
            self.working_set_at_realization,
            self.working_set_at_root,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_contract() {
        let raw: Vec<f32> = (0..HEAD2_W).map(|i| i as f32).collect();
        let f = StageFeatures::unpack(&raw);
        assert_eq!(f.num_realizations, 0.0);
        assert_eq!(f.inner_parallelism, 9.0);
        assert_eq!(f.outer_parallelism, 10.0);
        assert_eq!(f.inlined_calls, 17.0);
        assert_eq!(f.working_set, 21.0);
        assert_eq!(f.num_vectors, 24.0);
        assert_eq!(f.innermost_bytes_at_task, 30.0);
        assert_eq!(f.working_set_at_root, 38.0);
        assert_eq!(f.pack().to_vec(), raw);
    }
}
