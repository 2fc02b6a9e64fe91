//! Dense row-major tensors and their on-disk form.
//!
//! Estimator state is persisted as one JSON file per tensor plus a single
//! `axes.txt` sidecar listing the job (or group) names in index order, so a
//! saved folder can be inspected and reloaded across runs.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A dense `rows x cols` matrix stored row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: Copy> Tensor<T> {
    /// A `rows x cols` tensor with every cell set to `value`.
    pub fn filled(rows: usize, cols: usize, value: T) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> T {
        self.data[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: T) {
        self.data[row * self.cols + col] = value;
    }

    pub fn row(&self, row: usize) -> &[T] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }
}

/// Serialize `value` as JSON into `folder/name.json`, creating the folder if
/// needed.
pub fn save_json<T: Serialize>(folder: &Path, name: &str, value: &T) -> Result<()> {
    fs::create_dir_all(folder)
        .with_context(|| format!("cannot create estimator folder {}", folder.display()))?;
    let path = folder.join(format!("{name}.json"));
    let file = File::create(&path)
        .with_context(|| format!("cannot create tensor file {}", path.display()))?;
    serde_json::to_writer(BufWriter::new(file), value)
        .with_context(|| format!("cannot serialize tensor {}", path.display()))?;
    Ok(())
}

/// Load `folder/name.json` back into a value of type `T`.
pub fn load_json<T: DeserializeOwned>(folder: &Path, name: &str) -> Result<T> {
    let path = folder.join(format!("{name}.json"));
    let file =
        File::open(&path).with_context(|| format!("cannot open tensor file {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("cannot parse tensor {}", path.display()))
}

/// Write the index → name mapping, one name per line in index order.
pub fn save_axes(folder: &Path, names: &[String]) -> Result<()> {
    fs::create_dir_all(folder)
        .with_context(|| format!("cannot create estimator folder {}", folder.display()))?;
    let path = folder.join("axes.txt");
    let mut file = BufWriter::new(
        File::create(&path).with_context(|| format!("cannot create {}", path.display()))?,
    );
    for name in names {
        writeln!(file, "{name}").with_context(|| format!("cannot write {}", path.display()))?;
    }
    Ok(())
}

/// Check a reloaded tensor against the expected shape.
pub fn expect_shape<T: Copy>(tensor: &Tensor<T>, rows: usize, cols: usize) -> Result<()> {
    if tensor.rows() != rows || tensor.cols() != cols {
        bail!(
            "tensor shape {}x{} does not match the current job index ({}x{})",
            tensor.rows(),
            tensor.cols(),
            rows,
            cols
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filled_tensor_reads_back_cells() {
        let mut t = Tensor::filled(2, 3, 0.0f64);
        t.set(0, 1, 4.5);
        t.set(1, 2, -1.0);

        assert_eq!(t.get(0, 1), 4.5);
        assert_eq!(t.get(1, 2), -1.0);
        assert_eq!(t.get(0, 0), 0.0);
        assert_eq!(t.row(1), &[0.0, 0.0, -1.0]);
    }

    #[test]
    fn json_round_trip_is_bit_identical() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = Tensor::filled(3, 3, 1.0f64);
        t.set(0, 2, 13.0 / 3.0);
        t.set(2, 1, 0.1 + 0.2); // deliberately not representable exactly

        save_json(dir.path(), "average", &t).unwrap();
        let back: Tensor<f64> = load_json(dir.path(), "average").unwrap();

        assert_eq!(t, back);
    }

    #[test]
    fn axes_file_lists_names_in_order(){
        let dir = tempfile::tempdir().unwrap();
        let names = vec!["KMeans".to_string(), "Sort".to_string(), "WordCount".to_string()];
        save_axes(dir.path(), &names).unwrap();

        let content = std::fs::read_to_string(dir.path().join("axes.txt")).unwrap();
        assert_eq!(content, "KMeans\nSort\nWordCount\n");
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let t = Tensor::filled(2, 2, 0.0f64);
        assert!(expect_shape(&t, 2, 2).is_ok());
        assert!(expect_shape(&t, 3, 3).is_err());
    }
}
