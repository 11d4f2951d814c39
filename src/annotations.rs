//! Validated items × annotators grid of categorical codes.
//!
//! Cells hold a dense class index in `[0, K-1]` or [`MISSING`]. The matrix is
//! built once and never mutated by model code; likelihood evaluation works on
//! the derived [`PatternCounts`], which collapse identical rows.

use std::collections::{BTreeSet, HashMap};
use std::io::BufRead;

use crate::error::ModelError;

/// Sentinel for "annotator did not label this item".
pub const MISSING: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationMatrix {
    nitems: usize,
    nannotators: usize,
    nclasses: usize,
    cells: Vec<i32>,
}

impl AnnotationMatrix {
    /// Build from rows of cells. Every row must have the same width and every
    /// cell must be [`MISSING`] or a class index below `nclasses`.
    pub fn new(rows: Vec<Vec<i32>>, nclasses: usize) -> Result<Self, ModelError> {
        let nitems = rows.len();
        let nannotators = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut cells = Vec::with_capacity(nitems * nannotators);
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != nannotators {
                return Err(ModelError::InvalidAnnotations(format!(
                    "row {i} has {} cells, expected {nannotators}",
                    row.len()
                )));
            }
            cells.extend(row);
        }
        Self::from_cells(nitems, nannotators, nclasses, cells)
    }

    /// Build from a row-major cell buffer.
    pub fn from_cells(
        nitems: usize,
        nannotators: usize,
        nclasses: usize,
        cells: Vec<i32>,
    ) -> Result<Self, ModelError> {
        if nclasses == 0 {
            return Err(ModelError::InvalidDimension {
                what: "nclasses",
                value: 0,
            });
        }
        if nitems == 0 {
            return Err(ModelError::InvalidDimension {
                what: "nitems",
                value: 0,
            });
        }
        if nannotators == 0 {
            return Err(ModelError::InvalidDimension {
                what: "nannotators",
                value: 0,
            });
        }
        if cells.len() != nitems * nannotators {
            return Err(ModelError::shape(
                format!("{} cells", nitems * nannotators),
                format!("{} cells", cells.len()),
            ));
        }
        if let Some((idx, bad)) = cells
            .iter()
            .enumerate()
            .find(|(_, &v)| v != MISSING && (v < 0 || v as usize >= nclasses))
        {
            return Err(ModelError::InvalidAnnotations(format!(
                "cell ({}, {}) = {bad} is outside [0, {}] and is not the missing sentinel",
                idx / nannotators,
                idx % nannotators,
                nclasses - 1
            )));
        }
        Ok(Self {
            nitems,
            nannotators,
            nclasses,
            cells,
        })
    }

    pub fn nitems(&self) -> usize {
        self.nitems
    }

    pub fn nannotators(&self) -> usize {
        self.nannotators
    }

    pub fn nclasses(&self) -> usize {
        self.nclasses
    }

    pub fn row(&self, item: usize) -> &[i32] {
        let start = item * self.nannotators;
        &self.cells[start..start + self.nannotators]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[i32]> {
        self.cells.chunks(self.nannotators)
    }

    /// Class index at `(item, annotator)`, or `None` when missing.
    pub fn get(&self, item: usize, annotator: usize) -> Option<usize> {
        let v = self.cells[item * self.nannotators + annotator];
        if v == MISSING {
            None
        } else {
            Some(v as usize)
        }
    }

    pub fn observed_per_annotator(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.nannotators];
        for row in self.rows() {
            for (j, &v) in row.iter().enumerate() {
                if v != MISSING {
                    counts[j] += 1;
                }
            }
        }
        counts
    }

    pub fn empty_rows(&self) -> Vec<usize> {
        self.rows()
            .enumerate()
            .filter(|(_, row)| row.iter().all(|&v| v == MISSING))
            .map(|(i, _)| i)
            .collect()
    }

    /// Reject data no model can be fitted on: all-missing rows, or an
    /// annotator without a single observation.
    pub fn ensure_fit_ready(&self) -> Result<(), ModelError> {
        let empty = self.empty_rows();
        if let Some(first) = empty.first() {
            return Err(ModelError::DegenerateData(format!(
                "{} item(s) have no annotations (first: row {first})",
                empty.len()
            )));
        }
        if let Some(j) = self.observed_per_annotator().iter().position(|&c| c == 0) {
            return Err(ModelError::DegenerateData(format!(
                "annotator {j} has no observations"
            )));
        }
        Ok(())
    }

    /// Copy of the matrix with all-missing rows dropped.
    pub fn without_empty_rows(&self) -> Result<Self, ModelError> {
        let rows: Vec<Vec<i32>> = self
            .rows()
            .filter(|row| row.iter().any(|&v| v != MISSING))
            .map(|row| row.to_vec())
            .collect();
        if rows.is_empty() {
            return Err(ModelError::DegenerateData(
                "every item is missing all annotations".to_string(),
            ));
        }
        let nitems = rows.len();
        let cells = rows.into_iter().flatten().collect();
        Self::from_cells(nitems, self.nannotators, self.nclasses, cells)
    }

    /// Empirical frequency of each class over all observed cells.
    pub fn class_frequencies(&self) -> Result<Vec<f64>, ModelError> {
        let mut counts = vec![0.0; self.nclasses];
        let mut total = 0.0;
        for &v in &self.cells {
            if v != MISSING {
                counts[v as usize] += 1.0;
                total += 1.0;
            }
        }
        if total == 0.0 {
            return Err(ModelError::DegenerateData(
                "no observed annotations".to_string(),
            ));
        }
        counts.iter_mut().for_each(|c| *c /= total);
        Ok(counts)
    }

    /// Unique row patterns with their multiplicities, in first-seen order.
    pub fn pattern_counts(&self) -> PatternCounts {
        let mut index: HashMap<&[i32], usize> = HashMap::new();
        let mut patterns: Vec<(Vec<i32>, usize)> = Vec::new();
        for row in self.rows() {
            match index.get(row) {
                Some(&p) => patterns[p].1 += 1,
                None => {
                    index.insert(row, patterns.len());
                    patterns.push((row.to_vec(), 1));
                }
            }
        }
        PatternCounts {
            nannotators: self.nannotators,
            patterns,
        }
    }

    /// Stable content hash, used to key stored best runs.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.nitems as u64).to_le_bytes());
        hasher.update(&(self.nannotators as u64).to_le_bytes());
        hasher.update(&(self.nclasses as u64).to_le_bytes());
        for v in &self.cells {
            hasher.update(&v.to_le_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Row patterns with multiplicities. Immutable once derived.
#[derive(Debug, Clone)]
pub struct PatternCounts {
    nannotators: usize,
    patterns: Vec<(Vec<i32>, usize)>,
}

impl PatternCounts {
    pub fn nannotators(&self) -> usize {
        self.nannotators
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[i32], f64)> {
        self.patterns.iter().map(|(p, c)| (p.as_slice(), *c as f64))
    }

    pub fn total(&self) -> usize {
        self.patterns.iter().map(|(_, c)| c).sum()
    }
}

/// Bijection between raw annotation codes and dense class indices.
///
/// Codes are sorted ascending, so index `i` is the `i`-th smallest raw code
/// and `index_of(value_of(i)) == Some(i)` for every index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeMap {
    values: Vec<i64>,
}

impl CodeMap {
    pub fn from_values(values: impl IntoIterator<Item = i64>) -> Self {
        let set: BTreeSet<i64> = values.into_iter().collect();
        Self {
            values: set.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn index_of(&self, value: i64) -> Option<usize> {
        self.values.binary_search(&value).ok()
    }

    pub fn value_of(&self, index: usize) -> Option<i64> {
        self.values.get(index).copied()
    }

    pub fn values(&self) -> &[i64] {
        &self.values
    }
}

/// Parse whitespace- or comma-separated integer rows.
///
/// Raw cells equal to `missing_raw` become [`MISSING`]; all other raw codes
/// are remapped to dense indices through the returned [`CodeMap`]. Blank
/// lines and lines starting with `#` are skipped.
pub fn load_annotations<R: BufRead>(
    reader: R,
    missing_raw: i64,
) -> Result<(AnnotationMatrix, CodeMap), ModelError> {
    let mut raw_rows: Vec<Vec<i64>> = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| {
            ModelError::InvalidAnnotations(format!("read error at line {}: {e}", lineno + 1))
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let row = trimmed
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|tok| !tok.is_empty())
            .map(|tok| {
                tok.parse::<i64>().map_err(|_| {
                    ModelError::InvalidAnnotations(format!(
                        "line {}: '{tok}' is not an integer",
                        lineno + 1
                    ))
                })
            })
            .collect::<Result<Vec<i64>, ModelError>>()?;
        if let Some(first) = raw_rows.first() {
            if first.len() != row.len() {
                return Err(ModelError::InvalidAnnotations(format!(
                    "line {} has {} cells, expected {}",
                    lineno + 1,
                    row.len(),
                    first.len()
                )));
            }
        }
        raw_rows.push(row);
    }
    if raw_rows.is_empty() {
        return Err(ModelError::InvalidDimension {
            what: "nitems",
            value: 0,
        });
    }

    let codes = CodeMap::from_values(
        raw_rows
            .iter()
            .flatten()
            .copied()
            .filter(|&v| v != missing_raw),
    );
    if codes.is_empty() {
        return Err(ModelError::DegenerateData(
            "file contains only missing values".to_string(),
        ));
    }

    let rows = raw_rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|v| {
                    if v == missing_raw {
                        MISSING
                    } else {
                        // Every non-missing raw value is in the map by construction.
                        codes.index_of(v).map(|i| i as i32).unwrap_or(MISSING)
                    }
                })
                .collect()
        })
        .collect();
    let matrix = AnnotationMatrix::new(rows, codes.len())?;
    Ok((matrix, codes))
}
