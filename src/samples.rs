//! Training Samples
//!
//! A benchmarking run writes one `.sample` file per measured schedule. The
//! file is a little-endian f32 stream:
//!
//! ```text
//! per stage: HEAD2_W schedule features, then (HEAD1_W + 1) * HEAD1_H pipeline features
//! runtime in milliseconds
//! pipeline id (i32 bits)
//! schedule id (i32 bits)
//! ```
//!
//! The first `HEAD1_H` floats of each pipeline block are a column the model
//! does not use and are skipped.
//!
//! Samples are grouped by a hash of their pipeline features, and identical
//! schedules within a pipeline are merged so that repeated measurements
//! count once, with their fastest runtime first.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use rayon::prelude::*;

use crate::error::SampleError;
use crate::network::{HEAD1_H, HEAD1_W, HEAD2_W};
use crate::queue::CostSlot;
use crate::tensor::Tensor;

/// Floats per stage in a sample file
pub const FEATURES_PER_STAGE: usize = HEAD2_W + (HEAD1_W + 1) * HEAD1_H;

/// Files with at least this many floats are rejected
pub const MAX_SAMPLE_FLOATS: usize = 10 * 1024 * 1024;

/// Runtimes outside this range (ms) are treated as measurement failures
pub const MIN_RUNTIME_MS: f32 = 0.1;
pub const MAX_RUNTIME_MS: f32 = 100_000.0;

/// Schedule features above this indicate an overflow during extraction
pub const MAX_SCHEDULE_FEATURE: f32 = 1e14;

/// Fold a run of floats into a hash, boost `hash_combine` style
pub fn hash_floats(mut h: u64, values: &[f32]) -> u64 {
    for v in values {
        // The constant is added in 32 bits before widening
        let bits = u64::from(v.to_bits().wrapping_add(0x9e37_79b9));
        h ^= bits.wrapping_add(h << 6).wrapping_add(h >> 2);
    }
    h
}

/// One decoded `.sample` file
#[derive(Debug, Clone)]
pub struct RawSample {
    pub path: PathBuf,
    pub num_stages: usize,
    /// Shape `[HEAD1_W, HEAD1_H, num_stages]`
    pub pipeline_features: Tensor,
    /// `[HEAD2_W, num_stages]`, feature-fastest
    pub schedule_features: Vec<f32>,
    pub runtime_ms: f32,
    pub pipeline_id: i32,
    pub schedule_id: i32,
    pub pipeline_hash: u64,
    pub schedule_hash: u64,
}

/// Decode and validate the contents of a `.sample` file
///
/// # Errors
/// Returns a [`SampleError`] naming why the file cannot be used for training.
pub fn parse_sample(path: &Path, bytes: &[u8]) -> Result<RawSample, SampleError> {
    let floats: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    let path_buf = path.to_path_buf();

    if floats.len() >= MAX_SAMPLE_FLOATS {
        return Err(SampleError::TooLarge {
            path: path_buf,
            floats: floats.len(),
        });
    }
    if floats.len() < 3 || (floats.len() - 3) % FEATURES_PER_STAGE != 0 {
        return Err(SampleError::Truncated {
            path: path_buf,
            floats: floats.len(),
        });
    }
    let num_features = floats.len() - 3;
    let num_stages = num_features / FEATURES_PER_STAGE;

    let runtime_ms = floats[num_features];
    if !(MIN_RUNTIME_MS..=MAX_RUNTIME_MS).contains(&runtime_ms) {
        return Err(SampleError::ImplausibleRuntime {
            path: path_buf,
            runtime: runtime_ms,
        });
    }
    let pipeline_id = floats[num_features + 1].to_bits() as i32;
    let schedule_id = floats[num_features + 2].to_bits() as i32;

    let mut pipeline_features = Tensor::zeros(&[HEAD1_W, HEAD1_H, num_stages]);
    let mut schedule_features = vec![0f32; HEAD2_W * num_stages];
    let mut pipeline_hash = 0;
    let mut schedule_hash = 0;

    for s in 0..num_stages {
        let block = &floats[s * FEATURES_PER_STAGE..(s + 1) * FEATURES_PER_STAGE];
        let (schedule, pipeline) = block.split_at(HEAD2_W);
        pipeline_hash = hash_floats(pipeline_hash, pipeline);
        schedule_hash = hash_floats(schedule_hash, schedule);

        for (f, &v) in schedule.iter().enumerate() {
            if v < 0.0 || v > MAX_SCHEDULE_FEATURE || v.is_nan() {
                return Err(SampleError::BadScheduleFeature {
                    path: path_buf,
                    stage: s,
                    feature: f,
                    value: v,
                });
            }
            schedule_features[f + HEAD2_W * s] = v;
        }

        for x in 0..HEAD1_W {
            for y in 0..HEAD1_H {
                let v = pipeline[(x + 1) * HEAD1_H + y];
                if v < 0.0 || v.is_nan() {
                    warn!(
                        "Negative or NaN pipeline feature {} {} {} = {} in {}",
                        x,
                        y,
                        s,
                        v,
                        path.display()
                    );
                }
                pipeline_features.set(&[x, y, s], v);
            }
        }
    }

    Ok(RawSample {
        path: path_buf,
        num_stages,
        pipeline_features,
        schedule_features,
        runtime_ms,
        pipeline_id,
        schedule_id,
        pipeline_hash,
        schedule_hash,
    })
}

/// Read and decode one `.sample` file
pub fn read_sample(path: &Path) -> Result<RawSample, SampleError> {
    if path.extension().map_or(true, |ext| ext != "sample") {
        return Err(SampleError::NotASample(path.to_path_buf()));
    }
    let bytes = fs::read(path).map_err(|source| SampleError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_sample(path, &bytes)
}

/// Encode a sample in the on-disk layout
///
/// `schedule_features` is `[HEAD2_W, num_stages]`; `pipeline_features` has
/// shape `[HEAD1_W, HEAD1_H, num_stages]`. The unused pipeline column is
/// written as zeros.
pub fn encode_sample(
    schedule_features: &[f32],
    pipeline_features: &Tensor,
    runtime_ms: f32,
    pipeline_id: i32,
    schedule_id: i32,
) -> Vec<u8> {
    let num_stages = pipeline_features.extent(2);
    let mut floats = Vec::with_capacity(num_stages * FEATURES_PER_STAGE + 3);
    for s in 0..num_stages {
        floats.extend_from_slice(&schedule_features[HEAD2_W * s..HEAD2_W * (s + 1)]);
        floats.extend(std::iter::repeat(0.0).take(HEAD1_H));
        for x in 0..HEAD1_W {
            for y in 0..HEAD1_H {
                floats.push(pipeline_features.get(&[x, y, s]));
            }
        }
    }
    floats.push(runtime_ms);
    floats.push(f32::from_bits(pipeline_id as u32));
    floats.push(f32::from_bits(schedule_id as u32));
    floats.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// One unique schedule of a pipeline
#[derive(Debug, Clone)]
pub struct ScheduleSample {
    pub path: PathBuf,
    pub schedule_id: i32,
    /// Every measurement, fastest first
    pub runtimes: Vec<f32>,
    /// `[HEAD2_W, num_stages]`
    pub features: Vec<f32>,
    /// Latest prediction from the model being trained
    pub prediction: CostSlot,
}

impl ScheduleSample {
    pub fn best_runtime(&self) -> f32 {
        self.runtimes[0]
    }
}

/// All unique schedules measured for one pipeline
#[derive(Debug, Clone)]
pub struct PipelineSamples {
    pub pipeline_id: i32,
    pub pipeline_hash: u64,
    pub num_stages: usize,
    pub features: Tensor,
    pub schedules: BTreeMap<u64, ScheduleSample>,
    pub fastest_schedule_hash: u64,
    pub fastest_runtime: f32,
}

impl PipelineSamples {
    pub fn fastest(&self) -> Option<&ScheduleSample> {
        self.schedules.get(&self.fastest_schedule_hash)
    }

    /// Summed squared deviations of repeated runtimes and their degrees of freedom
    fn repeat_variance(&self) -> (f64, usize) {
        let mut sum = 0.0;
        let mut dof = 0;
        for sched in self.schedules.values().filter(|s| s.runtimes.len() > 1) {
            let n = sched.runtimes.len();
            let mean = sched.runtimes.iter().map(|&r| f64::from(r)).sum::<f64>() / n as f64;
            sum += sched
                .runtimes
                .iter()
                .map(|&r| (f64::from(r) - mean).powi(2))
                .sum::<f64>();
            dof += n - 1;
        }
        (sum, dof)
    }

    /// Pooled standard deviation of repeated measurements, in ms
    ///
    /// `None` when no schedule of this pipeline was measured more than once.
    pub fn noise_level(&self) -> Option<f64> {
        let (sum, dof) = self.repeat_variance();
        (dof > 0).then(|| (sum / dof as f64).sqrt())
    }
}

/// The fastest sample seen while loading
#[derive(Debug, Clone, PartialEq)]
pub struct BestSample {
    pub runtime_ms: f32,
    pub schedule_id: i32,
    pub path: PathBuf,
}

impl BestSample {
    pub fn summary(&self) -> String {
        format!(
            "Best runtime is {} msec, from schedule id {} in file {}",
            self.runtime_ms,
            self.schedule_id,
            self.path.display()
        )
    }

    /// The `.schedule.h` written next to the `.sample` file
    pub fn schedule_source(&self) -> PathBuf {
        self.path.with_extension("schedule.h")
    }

    /// Write the summary line to `out`, replacing its contents
    pub fn write_summary(&self, out: &Path) -> Result<(), SampleError> {
        fs::write(out, format!("{}\n", self.summary())).map_err(|source| SampleError::Io {
            path: out.to_path_buf(),
            source,
        })
    }

    /// Copy the schedule source of the best sample to `out`
    pub fn copy_schedule(&self, out: &Path) -> Result<(), SampleError> {
        let source_path = self.schedule_source();
        let text = fs::read(&source_path).map_err(|source| SampleError::Io {
            path: source_path.clone(),
            source,
        })?;
        fs::write(out, text).map_err(|source| SampleError::Io {
            path: out.to_path_buf(),
            source,
        })
    }
}

/// Samples grouped by pipeline
#[derive(Debug, Default, Clone)]
pub struct SampleSet {
    pub pipelines: BTreeMap<u64, PipelineSamples>,
    pub num_read: usize,
    pub num_unique: usize,
    /// Pooled noise over every pipeline, see [`PipelineSamples::noise_level`]
    pub noise_level: Option<f64>,
    /// Fastest sample across all pipelines; stays here after a validation split
    pub best: Option<BestSample>,
}

impl SampleSet {
    /// Add one sample, merging it with an identical schedule if present
    ///
    /// Returns `false` if the sample collides with a different pipeline.
    pub fn insert(&mut self, sample: RawSample) -> bool {
        let ps = self
            .pipelines
            .entry(sample.pipeline_hash)
            .or_insert_with(|| PipelineSamples {
                pipeline_id: sample.pipeline_id,
                pipeline_hash: sample.pipeline_hash,
                num_stages: sample.num_stages,
                features: sample.pipeline_features.clone(),
                schedules: BTreeMap::new(),
                fastest_schedule_hash: sample.schedule_hash,
                fastest_runtime: f32::INFINITY,
            });
        if ps.num_stages != sample.num_stages {
            warn!(
                "Hash collision: pipelines with {} and {} stages both hash to {}",
                ps.num_stages, sample.num_stages, sample.pipeline_hash
            );
            return false;
        }

        let runtime = sample.runtime_ms;
        match ps.schedules.get_mut(&sample.schedule_hash) {
            Some(existing) => {
                if runtime < existing.runtimes[0] {
                    let previous = existing.runtimes[0];
                    existing.runtimes.push(previous);
                    existing.runtimes[0] = runtime;
                    existing.path = sample.path;
                } else {
                    existing.runtimes.push(runtime);
                }
            }
            None => {
                ps.schedules.insert(
                    sample.schedule_hash,
                    ScheduleSample {
                        path: sample.path,
                        schedule_id: sample.schedule_id,
                        runtimes: vec![runtime],
                        features: sample.schedule_features,
                        prediction: CostSlot::new(),
                    },
                );
                self.num_unique += 1;
            }
        }
        if runtime < ps.fastest_runtime {
            ps.fastest_runtime = runtime;
            ps.fastest_schedule_hash = sample.schedule_hash;
        }
        self.num_read += 1;
        true
    }

    /// Move a fixed subset of pipelines into a validation set
    ///
    /// Only applies when there are more than 16 pipelines. Membership depends
    /// on the pipeline hash alone, so it is stable across runs.
    pub fn split_validation(&mut self) -> SampleSet {
        let mut validation = SampleSet::default();
        if self.pipelines.len() <= 16 {
            return validation;
        }
        let held_out: Vec<u64> = self
            .pipelines
            .keys()
            .copied()
            .filter(|h| h & 7 == 0)
            .collect();
        for h in held_out {
            if let Some(p) = self.pipelines.remove(&h) {
                validation.num_unique += p.schedules.len();
                self.num_unique -= p.schedules.len();
                validation.pipelines.insert(h, p);
            }
        }
        validation
    }

    pub fn num_schedules(&self) -> usize {
        self.pipelines.values().map(|p| p.schedules.len()).sum()
    }
}

/// Parse sample files in parallel and group them
///
/// Files that fail validation are logged and skipped. Grouping happens in
/// input order, so the result does not depend on thread scheduling.
pub fn load_samples(paths: &[PathBuf]) -> SampleSet {
    let parsed: Vec<Result<RawSample, SampleError>> =
        paths.par_iter().map(|p| read_sample(p)).collect();

    let mut set = SampleSet::default();
    let mut best: Option<BestSample> = None;
    for result in parsed {
        match result {
            Ok(sample) => {
                if best.as_ref().map_or(true, |b| sample.runtime_ms < b.runtime_ms) {
                    best = Some(BestSample {
                        runtime_ms: sample.runtime_ms,
                        schedule_id: sample.schedule_id,
                        path: sample.path.clone(),
                    });
                }
                set.insert(sample);
            }
            Err(e) => warn!("Skipping sample: {}", e),
        }
        if set.num_read > 0 && set.num_read % 10_000 == 0 {
            debug!("Samples loaded: {} ({} unique)", set.num_read, set.num_unique);
        }
    }

    let mut pooled = (0.0, 0);
    for (hash, ps) in &set.pipelines {
        let (sum, dof) = ps.repeat_variance();
        if let Some(noise) = ps.noise_level() {
            info!("Noise level of pipeline {:#x}: {}", hash, noise);
        }
        pooled.0 += sum;
        pooled.1 += dof;
    }
    set.noise_level = (pooled.1 > 0).then(|| (pooled.0 / pooled.1 as f64).sqrt());

    info!(
        "Loaded {} samples ({} unique) across {} pipelines",
        set.num_read,
        set.num_unique,
        set.pipelines.len()
    );
    if let Some(b) = &best {
        info!("{}", b.summary());
    }
    set.best = best;
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(stages: usize, salt: f32) -> Tensor {
        let mut t = Tensor::zeros(&[HEAD1_W, HEAD1_H, stages]);
        for (i, v) in t.data_mut().iter_mut().enumerate() {
            *v = salt + (i % 5) as f32;
        }
        t
    }

    #[test]
    fn test_decode_layout() {
        let p = pipeline(2, 1.0);
        let sched: Vec<f32> = (0..2 * HEAD2_W).map(|i| i as f32).collect();
        let bytes = encode_sample(&sched, &p, 12.5, 7, -3);
        assert_eq!(bytes.len(), (2 * FEATURES_PER_STAGE + 3) * 4);

        let s = parse_sample(Path::new("a.sample"), &bytes).unwrap();
        assert_eq!(s.num_stages, 2);
        assert_eq!(s.runtime_ms, 12.5);
        assert_eq!((s.pipeline_id, s.schedule_id), (7, -3));
        assert_eq!(s.schedule_features, sched);
        assert!(s.pipeline_features.bits_eq(&p));
    }

    #[test]
    fn test_rejects_truncated_file() {
        let bytes = encode_sample(&vec![1.0; HEAD2_W], &pipeline(1, 0.0), 5.0, 0, 0);
        let err = parse_sample(Path::new("t.sample"), &bytes[..bytes.len() - 8]).unwrap_err();
        assert!(matches!(err, SampleError::Truncated { .. }), "{}", err);
    }

    #[test]
    fn test_rejects_implausible_runtime() {
        for runtime in [0.05, 200_000.0, f32::NAN] {
            let bytes = encode_sample(&vec![1.0; HEAD2_W], &pipeline(1, 0.0), runtime, 0, 0);
            let err = parse_sample(Path::new("r.sample"), &bytes).unwrap_err();
            assert!(matches!(err, SampleError::ImplausibleRuntime { .. }), "{}", err);
        }
    }

    #[test]
    fn test_rejects_bad_schedule_feature() {
        let mut sched = vec![1.0; HEAD2_W];
        sched[4] = -1.0;
        let bytes = encode_sample(&sched, &pipeline(1, 0.0), 5.0, 0, 0);
        match parse_sample(Path::new("f.sample"), &bytes) {
            Err(SampleError::BadScheduleFeature { stage, feature, .. }) => {
                assert_eq!((stage, feature), (0, 4));
            }
            other => panic!("unexpected {:?}", other.map(|s| s.path)),
        }
    }

    #[test]
    fn test_duplicate_schedules_merge_fastest_first() {
        let p = pipeline(1, 0.0);
        let sched = vec![2.0; HEAD2_W];
        let mut set = SampleSet::default();
        for (i, rt) in [5.0f32, 3.0, 4.0].iter().enumerate() {
            let bytes = encode_sample(&sched, &p, *rt, 1, i as i32);
            set.insert(parse_sample(Path::new("d.sample"), &bytes).unwrap());
        }
        assert_eq!(set.num_read, 3);
        assert_eq!(set.num_unique, 1);
        let ps = set.pipelines.values().next().unwrap();
        let only = ps.schedules.values().next().unwrap();
        assert_eq!(only.runtimes, vec![3.0, 5.0, 4.0]);
        assert_eq!(ps.fastest_runtime, 3.0);
    }

    #[test]
    fn test_validation_split_needs_many_pipelines() {
        let mut set = SampleSet::default();
        for k in 0..40 {
            let bytes = encode_sample(&vec![1.0; HEAD2_W], &pipeline(1, k as f32 * 0.37), 5.0, k, 0);
            set.insert(parse_sample(Path::new("v.sample"), &bytes).unwrap());
        }
        let total = set.pipelines.len();
        let validation = set.split_validation();
        assert_eq!(set.pipelines.len() + validation.pipelines.len(), total);
        assert!(validation.pipelines.keys().all(|h| h & 7 == 0));
        assert!(set.pipelines.keys().all(|h| h & 7 != 0));

        let mut small = SampleSet::default();
        let bytes = encode_sample(&vec![1.0; HEAD2_W], &pipeline(1, 0.0), 5.0, 0, 0);
        small.insert(parse_sample(Path::new("s.sample"), &bytes).unwrap());
        assert!(small.split_validation().pipelines.is_empty());
        assert_eq!(small.pipelines.len(), 1);
    }

    #[test]
    fn test_noise_level_pools_repeats() {
        let p = pipeline(1, 0.0);
        let mut set = SampleSet::default();
        // Schedule a measured at 2, 4 and 6; schedule b at 3 and 5; schedule c once
        let runs = [(1.0, 2.0), (1.0, 4.0), (1.0, 6.0), (2.0, 3.0), (2.0, 5.0), (3.0, 9.0)];
        for (value, rt) in runs {
            let bytes = encode_sample(&vec![value; HEAD2_W], &p, rt, 0, 0);
            set.insert(parse_sample(Path::new("n.sample"), &bytes).unwrap());
        }
        let ps = set.pipelines.values().next().unwrap();
        // (8 + 2) / (2 + 1)
        let expected = (10.0f64 / 3.0).sqrt();
        assert!((ps.noise_level().unwrap() - expected).abs() < 1e-12);

        let mut single = SampleSet::default();
        let bytes = encode_sample(&vec![1.0; HEAD2_W], &p, 5.0, 0, 0);
        single.insert(parse_sample(Path::new("o.sample"), &bytes).unwrap());
        assert_eq!(single.pipelines.values().next().unwrap().noise_level(), None);
    }

    #[test]
    fn test_best_sample_schedule_source_sits_beside_it() {
        let best = BestSample {
            runtime_ms: 1.5,
            schedule_id: 4,
            path: PathBuf::from("/tmp/run/batch_3_4.sample"),
        };
        assert_eq!(best.schedule_source(), PathBuf::from("/tmp/run/batch_3_4.schedule.h"));
        assert_eq!(
            best.summary(),
            "Best runtime is 1.5 msec, from schedule id 4 in file /tmp/run/batch_3_4.sample"
        );
    }

    #[test]
    fn test_hash_depends_on_order() {
        assert_ne!(hash_floats(0, &[1.0, 2.0]), hash_floats(0, &[2.0, 1.0]));
        assert_eq!(hash_floats(0, &[]), 0);
    }
}
