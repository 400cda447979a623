//! Weight Persistence
//!
//! Model weights can be stored in two formats:
//!
//! 1. **Binary file** (`*.weights`): one self-describing little-endian stream
//!    ```text
//!    u32 magic (0x68776631)
//!    u32 tensor_count
//!    per tensor: u32 dim_count, dim_count x u32 extent, product(extents) x f32
//!    ```
//! 2. **Legacy directory**: one headerless f32 dump per tensor, named by
//!    [`WeightId::legacy_file_name`]. Shapes are implied by the architecture.
//!
//! Loading never touches the live weights until the whole stream has parsed
//! and validated, so a failed load leaves the previous weights in place.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::WeightsError;
use crate::network::{WeightId, WeightSet};
use crate::tensor::Tensor;

/// The live model parameters
pub type Weights = WeightSet<Tensor>;

/// First four bytes of every binary weights file
pub const WEIGHTS_MAGIC: u32 = 0x6877_6631;

/// Weights compiled into the binary, in the legacy per-tensor layout
const BASELINE: [(WeightId, &[u8]); 6] = [
    (
        WeightId::Head1Filter,
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/weights/baseline/head1_conv1_weight.data")),
    ),
    (
        WeightId::Head1Bias,
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/weights/baseline/head1_conv1_bias.data")),
    ),
    (
        WeightId::Head2Filter,
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/weights/baseline/head2_conv1_weight.data")),
    ),
    (
        WeightId::Head2Bias,
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/weights/baseline/head2_conv1_bias.data")),
    ),
    (
        WeightId::Conv1Filter,
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/weights/baseline/trunk_conv1_weight.data")),
    ),
    (
        WeightId::Conv1Bias,
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/weights/baseline/trunk_conv1_bias.data")),
    ),
];

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, WeightsError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_tensor<R: Read>(reader: &mut R, id: WeightId) -> Result<Tensor, WeightsError> {
    let expected = id.shape();
    let dims = read_u32(reader)? as usize;
    if dims != expected.len() {
        return Err(WeightsError::DimensionCount {
            tensor: id,
            expected: expected.len(),
            found: dims,
        });
    }
    for (dim, &want) in expected.iter().enumerate() {
        let extent = read_u32(reader)? as usize;
        if extent != want {
            return Err(WeightsError::Extent {
                tensor: id,
                dim,
                expected: want,
                found: extent,
            });
        }
    }

    let mut bytes = vec![0u8; id.num_elements() * 4];
    reader.read_exact(&mut bytes)?;
    Tensor::from_le_bytes(expected, &bytes)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("bad tensor {}", id)).into())
}

impl WeightSet<Tensor> {
    /// Parse a binary weights stream into a fresh set
    ///
    /// # Errors
    /// Any magic, count, rank or extent mismatch, and short reads.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self, WeightsError> {
        let magic = read_u32(reader)?;
        if magic != WEIGHTS_MAGIC {
            return Err(WeightsError::BadMagic {
                expected: WEIGHTS_MAGIC,
                found: magic,
            });
        }
        let count = read_u32(reader)?;
        if count as usize != WeightId::ALL.len() {
            return Err(WeightsError::TensorCount {
                expected: WeightId::ALL.len() as u32,
                found: count,
            });
        }
        WeightSet::try_from_fn(|id| read_tensor(reader, id))
    }

    /// Serialize as a binary weights stream
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<(), WeightsError> {
        writer.write_all(&WEIGHTS_MAGIC.to_le_bytes())?;
        writer.write_all(&(WeightId::ALL.len() as u32).to_le_bytes())?;
        for (_, tensor) in self.iter() {
            writer.write_all(&(tensor.dimensions() as u32).to_le_bytes())?;
            for &extent in tensor.shape() {
                writer.write_all(&(extent as u32).to_le_bytes())?;
            }
            writer.write_all(&tensor.to_le_bytes())?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Replace the weights from a binary stream; on failure nothing changes
    pub fn load<R: Read>(&mut self, reader: &mut R) -> bool {
        match Self::read(reader) {
            Ok(loaded) => {
                *self = loaded;
                true
            }
            Err(e) => {
                debug!("Rejected weights stream: {}", e);
                false
            }
        }
    }

    pub fn load_from_file(&mut self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        match File::open(path) {
            Ok(f) => {
                let ok = self.load(&mut BufReader::new(f));
                if ok {
                    info!("Loaded weights from {}", path.display());
                }
                ok
            }
            Err(e) => {
                debug!("Cannot open {}: {}", path.display(), e);
                false
            }
        }
    }

    pub fn save<W: Write>(&self, writer: &mut W) -> bool {
        match self.write(writer) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to write weights: {}", e);
                false
            }
        }
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        match File::create(path) {
            Ok(f) => self.save(&mut BufWriter::new(f)),
            Err(e) => {
                error!("Cannot create {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Parse a legacy per-tensor directory into a fresh set
    ///
    /// # Errors
    /// Returns `WeightsError::ByteLength` if any file's size does not match
    /// its tensor's architecture shape.
    pub fn read_dir(dir: impl AsRef<Path>) -> Result<Self, WeightsError> {
        let dir = dir.as_ref();
        WeightSet::try_from_fn(|id| {
            let path = dir.join(id.legacy_file_name());
            let bytes = fs::read(&path)?;
            let expected = id.num_elements() * 4;
            if bytes.len() != expected {
                return Err(WeightsError::ByteLength {
                    path,
                    expected,
                    found: bytes.len(),
                });
            }
            Tensor::from_le_bytes(id.shape(), &bytes).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, format!("bad tensor {}", id)).into()
            })
        })
    }

    /// Write a legacy per-tensor directory, creating it if needed
    pub fn write_dir(&self, dir: impl AsRef<Path>) -> Result<(), WeightsError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        for (id, tensor) in self.iter() {
            fs::write(dir.join(id.legacy_file_name()), tensor.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn load_from_dir(&mut self, dir: impl AsRef<Path>) -> bool {
        let dir = dir.as_ref();
        match Self::read_dir(dir) {
            Ok(loaded) => {
                *self = loaded;
                info!("Loaded weights from legacy directory {}", dir.display());
                true
            }
            Err(e) => {
                debug!("Rejected weights directory {}: {}", dir.display(), e);
                false
            }
        }
    }

    pub fn save_to_dir(&self, dir: impl AsRef<Path>) -> bool {
        let dir = dir.as_ref();
        match self.write_dir(dir) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to write weights to {}: {}", dir.display(), e);
                false
            }
        }
    }

    /// Overwrite every element with `uniform(-0.5, 0.5)`
    ///
    /// Tensors are filled in file order from a single stream, so the same seed
    /// always yields the same weights.
    pub fn randomize(&mut self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        self.for_each_mut(|_, tensor| {
            for v in tensor.data_mut() {
                *v = rng.gen_range(-0.5f32..0.5f32);
            }
        });
    }

    /// Weights compiled into the binary
    ///
    /// # Panics
    /// If an embedded tensor has the wrong byte length. That is a build defect,
    /// not a runtime condition.
    pub fn baseline() -> Self {
        WeightSet::from_fn(|id| {
            let bytes = BASELINE
                .iter()
                .find(|(bid, _)| *bid == id)
                .map(|(_, b)| *b)
                .unwrap_or_default();
            let expected = id.num_elements() * 4;
            if bytes.len() != expected {
                error!(
                    "Embedded weights for {} are {} bytes, expected {}",
                    id,
                    bytes.len(),
                    expected
                );
                panic!("corrupt embedded weights for {}", id);
            }
            Tensor::from_le_bytes(id.shape(), bytes)
                .unwrap_or_else(|| panic!("corrupt embedded weights for {}", id))
        })
    }
}

/// Load weights from `path`, picking the format from its suffix
///
/// A path ending in `.weights` is read as a binary file; anything else is
/// treated as a legacy directory.
pub fn load_path(weights: &mut Weights, path: &Path) -> bool {
    if is_binary_path(path) {
        weights.load_from_file(path)
    } else {
        warn!(
            "Loading weights from a directory ({}) is deprecated; convert it to a .weights file",
            path.display()
        );
        weights.load_from_dir(path)
    }
}

/// Save weights to `path`, picking the format from its suffix
pub fn save_path(weights: &Weights, path: &Path) -> bool {
    if is_binary_path(path) {
        weights.save_to_file(path)
    } else {
        weights.save_to_dir(path)
    }
}

pub fn is_binary_path(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "weights")
}
