//! On-disk result bundles.
//!
//! A bundle lives at `<root>/<paper_id>/<table_id>/<panel_identifier>/` and
//! holds `metadata.json` plus CSV dumps of `y`, `X` and, when present, `z`,
//! cluster groups and weights. Each CSV has a header row of column labels and
//! one row per observation, with floats written in shortest round-trip form.
//!
//! Writes are staged in a sibling directory and renamed into place, so a
//! bundle is either complete or absent. There is no locking: two processes
//! saving the same key concurrently may race.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nalgebra::{DMatrix, DVector};

use crate::data::ReplicationData;
use crate::error::{ReplicationError, Result};
use crate::metadata::{MetadataDocument, ValidatedMetadata};

pub const METADATA_FILE: &str = "metadata.json";
pub const Y_FILE: &str = "y.csv";
pub const X_FILE: &str = "X.csv";
pub const Z_FILE: &str = "z.csv";
pub const CLUSTER_FILE: &str = "cluster.csv";
pub const WEIGHTS_FILE: &str = "weights.csv";

/// A labelled numeric table read back from a bundle.
#[derive(Clone, Debug, PartialEq)]
pub struct Columns {
    pub labels: Vec<String>,
    pub values: DMatrix<f64>,
}

/// A persisted replication read back from disk.
#[derive(Clone, Debug)]
pub struct ResultBundle {
    pub path: PathBuf,
    pub metadata: MetadataDocument,
    pub y: Columns,
    pub x: Columns,
    pub z: Option<Columns>,
    pub cluster: Option<Vec<String>>,
    pub weights: Option<DVector<f64>>,
}

impl ResultBundle {
    /// Deterministic bundle directory for a metadata key.
    pub fn path_for(root: &Path, metadata: &ValidatedMetadata) -> PathBuf {
        root.join(path_component(&metadata.paper_id))
            .join(path_component(&metadata.table_id))
            .join(path_component(&metadata.panel_identifier))
    }

    /// Writes a bundle, refusing to replace an existing one unless `overwrite` is set.
    pub fn write(
        root: &Path,
        metadata: &ValidatedMetadata,
        document: &MetadataDocument,
        data: &ReplicationData,
        overwrite: bool,
    ) -> Result<PathBuf> {
        let target = Self::path_for(root, metadata);
        let exists = target.join(METADATA_FILE).exists();
        if exists && !overwrite {
            return Err(ReplicationError::ResultExists { path: target });
        }

        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.to_path_buf());
        fs::create_dir_all(&parent).map_err(|err| ReplicationError::io(&parent, err))?;

        let staging = sibling(&target, "staging");
        fs::create_dir_all(&staging).map_err(|err| ReplicationError::io(&staging, err))?;
        if let Err(err) = write_contents(&staging, document, data) {
            let _ = fs::remove_dir_all(&staging);
            return Err(err);
        }

        if target.exists() {
            let retired = sibling(&target, "replaced");
            fs::rename(&target, &retired).map_err(|err| {
                let _ = fs::remove_dir_all(&staging);
                ReplicationError::io(&target, err)
            })?;
            if let Err(err) = fs::rename(&staging, &target) {
                let _ = fs::rename(&retired, &target);
                let _ = fs::remove_dir_all(&staging);
                return Err(ReplicationError::io(&target, err));
            }
            if let Err(err) = fs::remove_dir_all(&retired) {
                log::warn!(
                    "could not remove replaced bundle {}: {err}",
                    retired.display()
                );
            }
        } else {
            fs::rename(&staging, &target).map_err(|err| {
                let _ = fs::remove_dir_all(&staging);
                ReplicationError::io(&target, err)
            })?;
        }

        log::info!("replication result saved to {}", target.display());
        Ok(target)
    }

    /// Reads a bundle directory back into memory.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let metadata_path = dir.join(METADATA_FILE);
        let text = fs::read_to_string(&metadata_path)
            .map_err(|err| ReplicationError::io(&metadata_path, err))?;
        let metadata: MetadataDocument = serde_json::from_str(&text)?;

        let y = read_columns(&dir.join(Y_FILE))?;
        let x = read_columns(&dir.join(X_FILE))?;
        let z_path = dir.join(Z_FILE);
        let z = if z_path.exists() {
            Some(read_columns(&z_path)?)
        } else {
            None
        };
        let cluster_path = dir.join(CLUSTER_FILE);
        let cluster = if cluster_path.exists() {
            Some(read_labels(&cluster_path)?)
        } else {
            None
        };
        let weights_path = dir.join(WEIGHTS_FILE);
        let weights = if weights_path.exists() {
            let table = read_columns(&weights_path)?;
            Some(table.values.column(0).into_owned())
        } else {
            None
        };

        Ok(Self {
            path: dir.to_path_buf(),
            metadata,
            y,
            x,
            z,
            cluster,
            weights,
        })
    }
}

fn write_contents(dir: &Path, document: &MetadataDocument, data: &ReplicationData) -> Result<()> {
    let metadata_path = dir.join(METADATA_FILE);
    let json = serde_json::to_vec_pretty(document)?;
    fs::write(&metadata_path, json).map_err(|err| ReplicationError::io(&metadata_path, err))?;

    let y = DMatrix::from_column_slice(data.y().len(), 1, data.y().as_slice());
    write_columns(&dir.join(Y_FILE), &[data.y_label().to_string()], &y)?;
    write_columns(&dir.join(X_FILE), data.x_labels(), data.x())?;
    if let Some(z) = data.instruments() {
        write_columns(&dir.join(Z_FILE), data.instrument_labels(), z)?;
    }
    if let Some(groups) = data.cluster() {
        let mut writer = csv::Writer::from_path(dir.join(CLUSTER_FILE))?;
        writer.write_record(["cluster"])?;
        for label in groups.labels() {
            writer.write_record([label])?;
        }
        writer.flush().map_err(|err| ReplicationError::io(dir, err))?;
    }
    if let Some(weights) = data.weights() {
        let w = DMatrix::from_column_slice(weights.len(), 1, weights.as_slice());
        write_columns(&dir.join(WEIGHTS_FILE), &["weight".to_string()], &w)?;
    }
    Ok(())
}

fn write_columns(path: &Path, labels: &[String], values: &DMatrix<f64>) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(labels)?;
    for row in values.row_iter() {
        writer.write_record(row.iter().map(|value| value.to_string()))?;
    }
    writer.flush().map_err(|err| ReplicationError::io(path, err))
}

fn read_columns(path: &Path) -> Result<Columns> {
    let mut reader = csv::Reader::from_path(path)?;
    let labels: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let ncols = labels.len();
    let mut values = Vec::new();
    let mut nrows = 0usize;
    for record in reader.records() {
        let record = record?;
        if record.len() != ncols {
            return Err(ReplicationError::MalformedBundle {
                path: path.to_path_buf(),
                detail: format!("row {nrows} has {} fields, expected {ncols}", record.len()),
            });
        }
        for field in record.iter() {
            let value = field
                .parse::<f64>()
                .map_err(|err| ReplicationError::MalformedBundle {
                    path: path.to_path_buf(),
                    detail: format!("row {nrows}: `{field}` is not a number ({err})"),
                })?;
            values.push(value);
        }
        nrows += 1;
    }
    Ok(Columns {
        labels,
        values: DMatrix::from_row_slice(nrows, ncols, &values),
    })
}

fn read_labels(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut labels = Vec::new();
    for record in reader.records() {
        let record = record?;
        labels.push(record.get(0).unwrap_or_default().to_string());
    }
    Ok(labels)
}

/// Keeps a metadata value usable as a single directory name.
fn path_component(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            other => other,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{cleaned}"),
        _ => cleaned,
    }
}

fn sibling(target: &Path, tag: &str) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.{tag}-{}-{nanos}", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_components_cannot_escape_root() {
        let metadata = ValidatedMetadata {
            paper_id: "..".into(),
            table_id: "3/B".into(),
            panel_identifier: "col 1".into(),
            model_type: "OLS".into(),
            comments: String::new(),
        };
        let path = ResultBundle::path_for(Path::new("out"), &metadata);
        assert_eq!(path, Path::new("out").join("_..").join("3_B").join("col 1"));
    }

    #[test]
    fn columns_round_trip_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("X.csv");
        let values = DMatrix::from_row_slice(2, 2, &[0.1, 1.0 / 3.0, -2.5e-12, 7.0]);
        let labels = vec!["a".to_string(), "b".to_string()];
        write_columns(&path, &labels, &values).unwrap();

        let table = read_columns(&path).unwrap();
        assert_eq!(table.labels, labels);
        assert_eq!(table.values, values);
    }

    #[test]
    fn non_numeric_field_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("y.csv");
        fs::write(&path, "y\n1.0\nabc\n").unwrap();
        assert!(matches!(
            read_columns(&path),
            Err(ReplicationError::MalformedBundle { .. })
        ));
    }
}
