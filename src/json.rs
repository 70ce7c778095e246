//! Per-paper JSON export of regression inputs.
//!
//! One document per paper collects every replicated table with its outcome,
//! the full regressor matrix (base columns, then fixed-effect columns, then
//! instruments) stored column by column, and index lists into that matrix.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::data::{default_labels, hstack};
use crate::error::{ReplicationError, Result};
use crate::selection::ColumnSelection;

/// One regression in the exported document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableEntry {
    pub table_id: String,
    pub column: u32,
    /// 1 when the treatment is binary.
    pub binary: u8,
    pub model: String,
    /// 1 when the interest coefficient is an elasticity.
    pub elasticity: u8,
    #[serde(rename = "FEs")]
    pub fes: Vec<usize>,
    #[serde(rename = "IVs")]
    pub ivs: Vec<usize>,
    pub interest: Vec<usize>,
    pub y: Vec<f64>,
    /// Regressors as a list of columns.
    #[serde(rename = "X")]
    pub x: Vec<Vec<f64>>,
}

/// The exported document for one paper.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonDocument {
    pub paper_id: String,
    pub tables: Vec<TableEntry>,
}

impl JsonDocument {
    /// Reads a previously saved document.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| ReplicationError::io(path, err))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Raw arrays for one table, prior to concatenation.
#[derive(Clone, Debug)]
pub struct TableInput {
    table_id: String,
    column: u32,
    y: DVector<f64>,
    x: DMatrix<f64>,
    interest: ColumnSelection,
    fe: Option<DMatrix<f64>>,
    fe_indices: Vec<usize>,
    z: Option<DMatrix<f64>>,
    iv_indices: Vec<usize>,
    binary: bool,
    model: String,
    elasticity: bool,
}

impl TableInput {
    /// Starts a table entry; `interest` holds positions in the concatenated matrix.
    pub fn new(
        table_id: impl Into<String>,
        column: u32,
        y: DVector<f64>,
        x: DMatrix<f64>,
        interest: impl Into<ColumnSelection>,
    ) -> Self {
        Self {
            table_id: table_id.into(),
            column,
            y,
            x,
            interest: interest.into(),
            fe: None,
            fe_indices: Vec::new(),
            z: None,
            iv_indices: Vec::new(),
            binary: false,
            model: "log-linear".to_string(),
            elasticity: false,
        }
    }

    /// Appends fixed-effect columns; `indices` point into the concatenated matrix.
    pub fn fixed_effects(mut self, fe: DMatrix<f64>, indices: Vec<usize>) -> Self {
        self.fe = Some(fe);
        self.fe_indices = indices;
        self
    }

    /// Appends instrument columns; `indices` point into the concatenated matrix.
    pub fn instruments(mut self, z: DMatrix<f64>, indices: Vec<usize>) -> Self {
        self.z = Some(z);
        self.iv_indices = indices;
        self
    }

    pub fn binary(mut self, binary: bool) -> Self {
        self.binary = binary;
        self
    }

    /// Model label, e.g. `log-linear`, `linear` or `exponential`.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn elasticity(mut self, elasticity: bool) -> Self {
        self.elasticity = elasticity;
        self
    }

    fn into_entry(self) -> Result<TableEntry> {
        let n = self.y.len();
        if self.x.nrows() != n {
            return Err(ReplicationError::dimension_mismatch(
                "X rows",
                n,
                self.x.nrows(),
            ));
        }

        let mut full = self.x;
        for (context, block) in [("fixed effect rows", &self.fe), ("z rows", &self.z)] {
            if let Some(block) = block {
                if block.nrows() != n {
                    return Err(ReplicationError::dimension_mismatch(
                        context,
                        n,
                        block.nrows(),
                    ));
                }
                full = hstack(&full, block);
            }
        }

        let ncols = full.ncols();
        let positions = default_labels("x", ncols);
        let interest = self.interest.resolve("interest", &positions)?;
        for (context, indices) in [("FEs", &self.fe_indices), ("IVs", &self.iv_indices)] {
            if let Some(&position) = indices.iter().find(|&&index| index >= ncols) {
                return Err(ReplicationError::ColumnOutOfRange {
                    context,
                    position,
                    ncols,
                });
            }
        }

        Ok(TableEntry {
            table_id: self.table_id,
            column: self.column,
            binary: u8::from(self.binary),
            model: self.model,
            elasticity: u8::from(self.elasticity),
            fes: self.fe_indices,
            ivs: self.iv_indices,
            interest,
            y: self.y.iter().copied().collect(),
            x: full
                .column_iter()
                .map(|column| column.iter().copied().collect())
                .collect(),
        })
    }
}

/// Accumulates table entries for one paper and writes them as one document.
#[derive(Clone, Debug)]
pub struct ReplicationJsonBuilder {
    paper_id: String,
    tables: Vec<TableEntry>,
    output_dir: PathBuf,
    checkpoint: bool,
}

impl ReplicationJsonBuilder {
    /// Builder writing under the default output directory.
    pub fn new(paper_id: impl Into<String>) -> Self {
        Self::with_settings(paper_id, &Settings::default())
    }

    /// Builder writing under `settings.output`.
    pub fn with_settings(paper_id: impl Into<String>, settings: &Settings) -> Self {
        Self {
            paper_id: paper_id.into(),
            tables: Vec::new(),
            output_dir: settings.output.clone(),
            checkpoint: false,
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Rewrite the document after every `add_table` so a crash loses nothing.
    pub fn with_checkpointing(mut self, checkpoint: bool) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn paper_id(&self) -> &str {
        &self.paper_id
    }

    pub fn tables(&self) -> &[TableEntry] {
        &self.tables
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Concatenates the table's arrays and appends the entry.
    pub fn add_table(&mut self, input: TableInput) -> Result<&TableEntry> {
        let entry = input.into_entry()?;
        log::debug!(
            "paper {}: added table {} column {} ({} obs, {} regressors)",
            self.paper_id,
            entry.table_id,
            entry.column,
            entry.y.len(),
            entry.x.len()
        );
        self.tables.push(entry);
        if self.checkpoint {
            self.save(None)?;
        }
        let last = self.tables.len() - 1;
        Ok(&self.tables[last])
    }

    /// Writes the document to `<output_dir>/<filename>`, defaulting to `<paper_id>.json`.
    pub fn save(&self, filename: Option<&str>) -> Result<PathBuf> {
        fs::create_dir_all(&self.output_dir)
            .map_err(|err| ReplicationError::io(&self.output_dir, err))?;
        let name = filename
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.json", self.paper_id));
        let path = self.output_dir.join(name);

        let bytes = serde_json::to_vec_pretty(&self.document())?;
        let staging = path.with_extension("json.partial");
        fs::write(&staging, bytes).map_err(|err| ReplicationError::io(&staging, err))?;
        fs::rename(&staging, &path).map_err(|err| ReplicationError::io(&path, err))?;

        log::info!("JSON output saved to: {}", path.display());
        Ok(path)
    }

    /// The document as it would be saved.
    pub fn document(&self) -> JsonDocument {
        JsonDocument {
            paper_id: self.paper_id.clone(),
            tables: self.tables.clone(),
        }
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }

    /// Overview of the accumulated tables.
    pub fn summary(&self) -> JsonSummary<'_> {
        JsonSummary { builder: self }
    }
}

/// Display adapter listing the tables held by a builder.
pub struct JsonSummary<'a> {
    builder: &'a ReplicationJsonBuilder,
}

impl fmt::Display for JsonSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Paper ID: {}", self.builder.paper_id)?;
        writeln!(f, "Number of tables: {}", self.builder.tables.len())?;
        for (i, table) in self.builder.tables.iter().enumerate() {
            writeln!(
                f,
                "  Table {}: {}, Column {}",
                i + 1,
                table.table_id,
                table.column
            )?;
            writeln!(f, "    - Model: {}", table.model)?;
            writeln!(f, "    - N obs: {}", table.y.len())?;
            writeln!(f, "    - N variables: {}", table.x.len())?;
            writeln!(f, "    - Fixed Effects indices: {:?}", table.fes)?;
            writeln!(f, "    - Interest variable indices: {:?}", table.interest)?;
        }
        Ok(())
    }
}

/// Result of [`create_json_output`].
#[derive(Clone, Debug)]
pub enum JsonOutput {
    Saved(PathBuf),
    Document(JsonDocument),
}

/// Builds a single-table document, saving it when `save` is set.
pub fn create_json_output(
    paper_id: impl Into<String>,
    input: TableInput,
    settings: &Settings,
    save: bool,
    filename: Option<&str>,
) -> Result<JsonOutput> {
    let mut builder = ReplicationJsonBuilder::with_settings(paper_id, settings);
    builder.add_table(input)?;
    if save {
        builder.save(filename).map(JsonOutput::Saved)
    } else {
        Ok(JsonOutput::Document(builder.document()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(table_id: &str, n: usize) -> TableInput {
        let y = DVector::from_fn(n, |i, _| i as f64 + 1.0);
        let x = DMatrix::from_fn(n, 3, |i, j| (i * 3 + j) as f64);
        TableInput::new(table_id, 1, y, x, 1usize)
    }

    #[test]
    fn concatenates_fixed_effects_then_instruments() {
        let n = 4;
        let fe = DMatrix::from_element(n, 2, 1.0);
        let z = DMatrix::from_element(n, 1, 2.0);
        let mut builder = ReplicationJsonBuilder::new("004");
        let entry = builder
            .add_table(
                input("3.B", n)
                    .fixed_effects(fe, vec![3, 4])
                    .instruments(z, vec![5]),
            )
            .unwrap();
        assert_eq!(entry.x.len(), 6);
        assert_eq!(entry.fes, vec![3, 4]);
        assert_eq!(entry.ivs, vec![5]);
        assert_eq!(entry.interest, vec![1]);
        assert_eq!(entry.x[3], vec![1.0; 4]);
        assert_eq!(entry.x[5], vec![2.0; 4]);
        assert_eq!(entry.x[0], vec![0.0, 3.0, 6.0, 9.0]);
    }

    #[test]
    fn rejects_index_past_concatenated_matrix() {
        let mut builder = ReplicationJsonBuilder::new("004");
        let result = builder.add_table(
            input("3.B", 4).fixed_effects(DMatrix::from_element(4, 1, 1.0), vec![4]),
        );
        assert!(matches!(
            result,
            Err(ReplicationError::ColumnOutOfRange { position: 4, ncols: 4, .. })
        ));
        assert!(builder.tables().is_empty());
    }

    #[test]
    fn rejects_misaligned_fixed_effects() {
        let mut builder = ReplicationJsonBuilder::new("004");
        let result =
            builder.add_table(input("3.B", 4).fixed_effects(DMatrix::from_element(3, 1, 1.0), vec![3]));
        assert!(matches!(
            result,
            Err(ReplicationError::DimensionMismatch { context: "fixed effect rows", .. })
        ));
    }

    #[test]
    fn flags_serialize_as_integers() {
        let mut builder = ReplicationJsonBuilder::new("004");
        builder
            .add_table(input("2", 2).binary(true).elasticity(true).model("linear"))
            .unwrap();
        let value = serde_json::to_value(builder.document()).unwrap();
        let table = &value["tables"][0];
        assert_eq!(table["binary"], 1);
        assert_eq!(table["elasticity"], 1);
        assert_eq!(table["model"], "linear");
        assert!(table["FEs"].as_array().unwrap().is_empty());
        assert_eq!(table["X"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn summary_lists_tables() {
        let mut builder = ReplicationJsonBuilder::new("004");
        builder.add_table(input("2", 3)).unwrap();
        let text = builder.summary().to_string();
        assert!(text.contains("Number of tables: 1"));
        assert!(text.contains("N obs: 3"));
        builder.clear();
        assert!(builder.tables().is_empty());
    }

    #[test]
    fn floats_reload_bit_for_bit() {
        let y = DVector::from_vec(vec![1.2525804067516717, 0.1 + 0.2, 1.0 / 3.0]);
        let x = DMatrix::from_fn(3, 1, |i, _| (i as f64 + 0.7).ln());
        let mut builder = ReplicationJsonBuilder::new("004");
        builder.add_table(TableInput::new("1", 1, y, x, 0usize)).unwrap();

        let text = serde_json::to_string(&builder.document()).unwrap();
        let reloaded: JsonDocument = serde_json::from_str(&text).unwrap();
        assert_eq!(reloaded, builder.document());
    }

    #[test]
    fn unsaved_output_returns_document() {
        let output =
            create_json_output("004", input("2", 2), &Settings::default(), false, None).unwrap();
        match output {
            JsonOutput::Document(document) => assert_eq!(document.tables.len(), 1),
            JsonOutput::Saved(path) => panic!("unexpected save to {}", path.display()),
        }
    }
}
