//! Seeded generation of the smoke test dataset.
//!
//! Every value is drawn from a [ChaCha8Rng], whose output stream is fixed for a given seed on every
//! platform. Changing the order in which values are drawn changes the dataset, so the draw order
//! (matrix rows, then the port when seeded port selection is used) is part of the contract.

use std::io::{
    BufReader,
    BufWriter,
    Read,
    Write,
};
use std::ops::Range;
use std::path::Path;

use rand::{
    Rng,
    SeedableRng,
};
use rand_chacha::ChaCha8Rng;

use crate::error::Error;

/// Size of the `.bin` header: point count and dimensionality, both little-endian `u32`.
const BIN_HEADER_LEN: usize = 8;

/// A row-major matrix of `f32` vectors with uniform values in `[0, 1)`.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatrix {
    rows: usize,
    dims: usize,
    data: Vec<f32>,
}

impl VectorMatrix {
    pub fn from_vec(rows: usize, dims: usize, data: Vec<f32>) -> Result<Self, Error> {
        if dims == 0 {
            return Err(Error::InvalidDataset("vectors must have at least one dimension".to_owned()));
        }
        if rows.checked_mul(dims) != Some(data.len()) {
            return Err(Error::InvalidDataset(format!(
                "{} values cannot form a {rows}x{dims} matrix",
                data.len()
            )));
        }
        Ok(Self { rows, dims, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn row(&self, index: usize) -> Option<&[f32]> {
        (index < self.rows).then(|| &self.data[index * self.dims..(index + 1) * self.dims])
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dims)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Serializes into DiskANN's `.bin` layout: `u32` point count, `u32` dimensionality, then the
    /// values row by row, all little-endian.
    pub fn write_bin<W: Write>(&self, writer: W) -> Result<(), Error> {
        let rows = u32::try_from(self.rows)
            .map_err(|_err| Error::InvalidDataset(format!("{} rows do not fit in a .bin header", self.rows)))?;
        let dims = u32::try_from(self.dims)
            .map_err(|_err| Error::InvalidDataset(format!("{} dims do not fit in a .bin header", self.dims)))?;

        let mut writer = BufWriter::new(writer);
        writer.write_all(&rows.to_le_bytes())?;
        writer.write_all(&dims.to_le_bytes())?;
        for value in &self.data {
            writer.write_all(&value.to_le_bytes())?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn write_bin_file(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let file = std::fs::File::create(path)?;
        self.write_bin(file)
    }

    /// Parses a matrix written by [VectorMatrix::write_bin], rejecting truncated or oversized input.
    pub fn read_bin<R: Read>(reader: R) -> Result<Self, Error> {
        let mut reader = BufReader::new(reader);
        let mut header = [0_u8; BIN_HEADER_LEN];
        reader.read_exact(&mut header)?;
        let rows = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let dims = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

        let mut body = Vec::new();
        reader.read_to_end(&mut body)?;
        let expected = rows
            .checked_mul(dims)
            .and_then(|n| n.checked_mul(std::mem::size_of::<f32>()))
            .ok_or_else(|| Error::InvalidDataset(format!("{rows}x{dims} overflows")))?;
        if body.len() != expected {
            return Err(Error::InvalidDataset(format!(
                "header declares {rows}x{dims} vectors ({expected} bytes) but body has {} bytes",
                body.len()
            )));
        }

        let data = body
            .chunks_exact(std::mem::size_of::<f32>())
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::from_vec(rows, dims, data)
    }

    pub fn read_bin_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = std::fs::File::open(path)?;
        Self::read_bin(file)
    }
}

/// A seeded source of vectors and port numbers.
#[derive(Debug, Clone)]
pub struct DatasetGenerator {
    rng: ChaCha8Rng,
}

impl DatasetGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn matrix(&mut self, rows: usize, dims: usize) -> Result<VectorMatrix, Error> {
        let len = rows
            .checked_mul(dims)
            .ok_or_else(|| Error::InvalidDataset(format!("{rows}x{dims} overflows")))?;
        let data = (0..len).map(|_| self.rng.random::<f32>()).collect();
        VectorMatrix::from_vec(rows, dims, data)
    }

    pub fn vector(&mut self, dims: usize) -> Vec<f32> {
        (0..dims).map(|_| self.rng.random::<f32>()).collect()
    }

    /// Draws a port from `range`. Nothing checks that the port is free.
    pub fn port(&mut self, range: Range<u16>) -> u16 {
        self.rng.random_range(range)
    }
}

/// The vectors an index is built from plus the query vector sent to the server.
///
/// The query is drawn from a fresh generator with the same seed, so it is the first row of the
/// matrix and its nearest neighbour is point 0.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    seed: u64,
    vectors: VectorMatrix,
    query: Vec<f32>,
}

impl Dataset {
    pub fn generate(seed: u64, rows: usize, dims: usize) -> Result<Self, Error> {
        let vectors = DatasetGenerator::new(seed).matrix(rows, dims)?;
        let query = DatasetGenerator::new(seed).vector(dims);
        Ok(Self { seed, vectors, query })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn vectors(&self) -> &VectorMatrix {
        &self.vectors
    }

    pub fn query(&self) -> &[f32] {
        &self.query
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{
        DEFAULT_SEED,
        DEFAULT_VECTOR_COUNT,
        DEFAULT_VECTOR_DIMS,
        SEEDED_PORT_RANGE,
    };

    fn bits(values: &[f32]) -> Vec<u32> {
        values.iter().map(|v| v.to_bits()).collect()
    }

    #[test]
    fn test_generation_is_bit_identical() {
        let a = Dataset::generate(DEFAULT_SEED, DEFAULT_VECTOR_COUNT, DEFAULT_VECTOR_DIMS).unwrap();
        let b = Dataset::generate(DEFAULT_SEED, DEFAULT_VECTOR_COUNT, DEFAULT_VECTOR_DIMS).unwrap();
        assert_eq!(bits(a.vectors().as_slice()), bits(b.vectors().as_slice()));
        assert_eq!(bits(a.query()), bits(b.query()));

        let mut one = DatasetGenerator::new(DEFAULT_SEED);
        let mut two = DatasetGenerator::new(DEFAULT_SEED);
        for _ in 0..3 {
            assert_eq!(bits(&one.vector(7)), bits(&two.vector(7)));
        }
        assert_eq!(one.port(SEEDED_PORT_RANGE), two.port(SEEDED_PORT_RANGE));
    }

    #[test]
    fn test_different_seed_differs() {
        let a = Dataset::generate(DEFAULT_SEED, 10, 8).unwrap();
        let b = Dataset::generate(DEFAULT_SEED + 1, 10, 8).unwrap();
        assert_ne!(bits(a.vectors().as_slice()), bits(b.vectors().as_slice()));
    }

    #[test]
    fn test_shape_and_range() {
        let dataset = Dataset::generate(DEFAULT_SEED, DEFAULT_VECTOR_COUNT, DEFAULT_VECTOR_DIMS).unwrap();
        let vectors = dataset.vectors();
        assert_eq!(vectors.rows(), DEFAULT_VECTOR_COUNT);
        assert_eq!(vectors.dims(), DEFAULT_VECTOR_DIMS);
        assert_eq!(vectors.iter_rows().count(), DEFAULT_VECTOR_COUNT);
        assert_eq!(dataset.query().len(), DEFAULT_VECTOR_DIMS);
        assert!(vectors.as_slice().iter().all(|v| (0.0..1.0).contains(v)));
        assert!(vectors.row(DEFAULT_VECTOR_COUNT).is_none());
    }

    #[test]
    fn test_query_is_first_row() {
        let dataset = Dataset::generate(DEFAULT_SEED, 4, 16).unwrap();
        assert_eq!(dataset.vectors().row(0).unwrap(), dataset.query());
    }

    #[test]
    fn test_seeded_port_in_range() {
        let mut generator = DatasetGenerator::new(DEFAULT_SEED);
        generator.matrix(DEFAULT_VECTOR_COUNT, DEFAULT_VECTOR_DIMS).unwrap();
        let port = generator.port(SEEDED_PORT_RANGE);
        assert!(SEEDED_PORT_RANGE.contains(&port));
    }

    #[test]
    fn test_bin_layout() {
        let matrix = VectorMatrix::from_vec(2, 3, vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5]).unwrap();
        let mut bytes = Vec::new();
        matrix.write_bin(&mut bytes).unwrap();

        assert_eq!(bytes.len(), 8 + 6 * 4);
        assert_eq!(&bytes[0..4], &2_u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &3_u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &0.0_f32.to_le_bytes());
        assert_eq!(&bytes[28..32], &2.5_f32.to_le_bytes());

        assert_eq!(VectorMatrix::read_bin(bytes.as_slice()).unwrap(), matrix);
    }

    #[test]
    fn test_read_bin_rejects_truncated_body() {
        let matrix = VectorMatrix::from_vec(2, 2, vec![1.0; 4]).unwrap();
        let mut bytes = Vec::new();
        matrix.write_bin(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(
            VectorMatrix::read_bin(bytes.as_slice()),
            Err(Error::InvalidDataset(_))
        ));
    }

    #[test]
    fn test_invalid_shapes() {
        assert!(VectorMatrix::from_vec(2, 0, vec![]).is_err());
        assert!(VectorMatrix::from_vec(2, 3, vec![0.0; 5]).is_err());
        assert!(DatasetGenerator::new(1).matrix(usize::MAX, 2).is_err());
    }
}
