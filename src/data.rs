//! Regression inputs and the validation that guards them.

use std::collections::{BTreeSet, HashMap};

use nalgebra::{DMatrix, DVector};

use crate::error::{ReplicationError, Result};

/// Outcome, regressors and the optional per-observation arrays of one regression.
///
/// Every array is row-aligned: `y`, `X`, `z`, cluster groups and weights all
/// have exactly [`observation_count`](Self::observation_count) rows.
#[derive(Clone, Debug)]
pub struct ReplicationData {
    y: DVector<f64>,
    y_label: String,
    x: DMatrix<f64>,
    x_labels: Vec<String>,
    z: Option<DMatrix<f64>>,
    z_labels: Vec<String>,
    cluster: Option<ClusterGroups>,
    weights: Option<DVector<f64>>,
    fe_columns: Vec<usize>,
}

impl ReplicationData {
    /// Number of observations.
    pub fn observation_count(&self) -> usize {
        self.y.len()
    }

    /// Number of regressors, including expanded fixed-effect dummies.
    pub fn regressor_count(&self) -> usize {
        self.x.ncols()
    }

    pub fn y(&self) -> &DVector<f64> {
        &self.y
    }

    pub fn y_label(&self) -> &str {
        &self.y_label
    }

    pub fn x(&self) -> &DMatrix<f64> {
        &self.x
    }

    pub fn x_labels(&self) -> &[String] {
        &self.x_labels
    }

    /// Instrument matrix (`z`), if the design is instrumented.
    pub fn instruments(&self) -> Option<&DMatrix<f64>> {
        self.z.as_ref()
    }

    pub fn instrument_labels(&self) -> &[String] {
        &self.z_labels
    }

    pub fn cluster(&self) -> Option<&ClusterGroups> {
        self.cluster.as_ref()
    }

    pub fn weights(&self) -> Option<&DVector<f64>> {
        self.weights.as_ref()
    }

    /// Positions in `X` of dummies generated from categorical fixed effects.
    pub fn fixed_effect_columns(&self) -> &[usize] {
        &self.fe_columns
    }

    /// Replaces identifier columns of `X` with drop-first dummies of their values.
    ///
    /// Returns the expanded data and, for every original column, its position
    /// in the new `X` (`None` for absorbed columns). Kept columns retain their
    /// relative order; the new dummies are appended after them.
    pub fn absorb_fixed_effects(&self, columns: &[usize]) -> Result<(Self, Vec<Option<usize>>)> {
        let k = self.x.ncols();
        if let Some(&position) = columns.iter().find(|&&col| col >= k) {
            return Err(ReplicationError::ColumnOutOfRange {
                context: "fixed effects",
                position,
                ncols: k,
            });
        }

        let kept: Vec<usize> = (0..k).filter(|col| !columns.contains(col)).collect();
        let mut positions = vec![None; k];
        for (new, &old) in kept.iter().enumerate() {
            positions[old] = Some(new);
        }

        let mut x = self.x.select_columns(kept.iter());
        let mut x_labels: Vec<String> = kept.iter().map(|&col| self.x_labels[col].clone()).collect();
        let mut fe_columns: Vec<usize> = self
            .fe_columns
            .iter()
            .filter_map(|&col| positions[col])
            .collect();

        for &col in columns {
            let levels = self
                .x
                .column(col)
                .iter()
                .map(|&value| level_key(value))
                .collect::<Result<Vec<_>>>()?;
            let (dummies, names) = expand_dummies(&self.x_labels[col], &levels);
            let start = x.ncols();
            x = hstack(&x, &dummies);
            fe_columns.extend(start..x.ncols());
            x_labels.extend(names);
        }

        let expanded = Self {
            x,
            x_labels,
            fe_columns,
            ..self.clone()
        };
        Ok((expanded, positions))
    }
}

/// Per-observation cluster membership with a dense integer coding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterGroups {
    labels: Vec<String>,
    codes: Vec<usize>,
    count: usize,
}

impl ClusterGroups {
    /// Codes groups in order of first appearance.
    pub fn new(labels: Vec<String>) -> Self {
        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut codes = Vec::with_capacity(labels.len());
        for label in &labels {
            let next = index.len();
            codes.push(*index.entry(label.as_str()).or_insert(next));
        }
        let count = index.len();
        Self {
            labels,
            codes,
            count,
        }
    }

    /// Group label of every observation.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Dense group code (`0..group_count`) of every observation.
    pub fn codes(&self) -> &[usize] {
        &self.codes
    }

    pub fn group_count(&self) -> usize {
        self.count
    }

    /// Distinct group labels, sorted.
    pub fn distinct(&self) -> Vec<String> {
        self.labels
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Clone, Debug)]
struct CategoricalEffect {
    name: String,
    levels: Vec<String>,
}

/// Builder that validates row alignment before constructing [`ReplicationData`].
#[derive(Debug)]
pub struct ReplicationDataBuilder {
    y: DVector<f64>,
    y_label: Option<String>,
    x: DMatrix<f64>,
    x_labels: Option<Vec<String>>,
    z: Option<DMatrix<f64>>,
    z_labels: Option<Vec<String>>,
    cluster: Option<Vec<String>>,
    weights: Option<DVector<f64>>,
    categorical: Vec<CategoricalEffect>,
}

impl ReplicationDataBuilder {
    /// Start from the outcome (in levels) and the design matrix.
    pub fn new(y: DVector<f64>, x: DMatrix<f64>) -> Self {
        Self {
            y,
            y_label: None,
            x,
            x_labels: None,
            z: None,
            z_labels: None,
            cluster: None,
            weights: None,
            categorical: Vec::new(),
        }
    }

    /// Names the outcome. Defaults to `y`.
    pub fn outcome_label(mut self, label: impl Into<String>) -> Self {
        self.y_label = Some(label.into());
        self
    }

    /// Names the columns of `X`. Defaults to `x0`, `x1`, ...
    pub fn labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.x_labels = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the instrument matrix (`z`).
    pub fn instruments(mut self, z: DMatrix<f64>) -> Self {
        self.z = Some(z);
        self
    }

    /// Names the columns of `z`. Defaults to `z0`, `z1`, ...
    pub fn instrument_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.z_labels = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the cluster membership of every observation.
    pub fn cluster<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.cluster = Some(groups.into_iter().map(|g| g.to_string()).collect());
        self
    }

    /// Sets non-negative observation weights.
    pub fn weights(mut self, weights: DVector<f64>) -> Self {
        self.weights = Some(weights);
        self
    }

    /// Appends drop-first dummies for a categorical fixed effect to `X`.
    ///
    /// Levels are sorted lexically; the first level is the omitted category.
    pub fn categorical_fixed_effect<I, S>(mut self, name: impl Into<String>, levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.categorical.push(CategoricalEffect {
            name: name.into(),
            levels: levels.into_iter().map(|l| l.to_string()).collect(),
        });
        self
    }

    /// Finalizes construction after validating shapes and weights.
    pub fn build(self) -> Result<ReplicationData> {
        let n = self.y.len();
        if n == 0 {
            return Err(ReplicationError::dimension_mismatch("observations", 1, 0));
        }
        if self.x.nrows() != n {
            return Err(ReplicationError::dimension_mismatch(
                "X rows",
                n,
                self.x.nrows(),
            ));
        }

        let mut x_labels = match self.x_labels {
            Some(labels) => {
                if labels.len() != self.x.ncols() {
                    return Err(ReplicationError::dimension_mismatch(
                        "X labels",
                        self.x.ncols(),
                        labels.len(),
                    ));
                }
                labels
            }
            None => default_labels("x", self.x.ncols()),
        };

        let z_labels = match &self.z {
            Some(z) => {
                if z.nrows() != n {
                    return Err(ReplicationError::dimension_mismatch("z rows", n, z.nrows()));
                }
                match self.z_labels {
                    Some(labels) if labels.len() != z.ncols() => {
                        return Err(ReplicationError::dimension_mismatch(
                            "z labels",
                            z.ncols(),
                            labels.len(),
                        ));
                    }
                    Some(labels) => labels,
                    None => default_labels("z", z.ncols()),
                }
            }
            None => Vec::new(),
        };

        let cluster = match self.cluster {
            Some(groups) => {
                if groups.len() != n {
                    return Err(ReplicationError::dimension_mismatch(
                        "cluster length",
                        n,
                        groups.len(),
                    ));
                }
                Some(ClusterGroups::new(groups))
            }
            None => None,
        };

        if let Some(weights) = &self.weights {
            if weights.len() != n {
                return Err(ReplicationError::dimension_mismatch(
                    "weights length",
                    n,
                    weights.len(),
                ));
            }
            for (index, weight) in weights.iter().enumerate() {
                if !weight.is_finite() || *weight < 0.0 {
                    return Err(ReplicationError::InvalidWeight {
                        index,
                        weight: *weight,
                    });
                }
            }
        }

        let mut x = self.x;
        let mut fe_columns = Vec::new();
        for effect in &self.categorical {
            if effect.levels.len() != n {
                return Err(ReplicationError::dimension_mismatch(
                    "fixed effect length",
                    n,
                    effect.levels.len(),
                ));
            }
            let (dummies, names) = expand_dummies(&effect.name, &effect.levels);
            let start = x.ncols();
            x = hstack(&x, &dummies);
            fe_columns.extend(start..x.ncols());
            x_labels.extend(names);
        }

        Ok(ReplicationData {
            y: self.y,
            y_label: self.y_label.unwrap_or_else(|| "y".to_string()),
            x,
            x_labels,
            z: self.z,
            z_labels,
            cluster,
            weights: self.weights,
            fe_columns,
        })
    }
}

pub(crate) fn default_labels(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{prefix}{i}")).collect()
}

/// Column-concatenates two matrices with the same number of rows.
pub(crate) fn hstack(left: &DMatrix<f64>, right: &DMatrix<f64>) -> DMatrix<f64> {
    debug_assert_eq!(left.nrows(), right.nrows());
    let mut out = DMatrix::<f64>::zeros(left.nrows(), left.ncols() + right.ncols());
    out.columns_mut(0, left.ncols()).copy_from(left);
    out.columns_mut(left.ncols(), right.ncols()).copy_from(right);
    out
}

/// Level name of an identifier value; integral values print without a fraction.
fn level_key(value: f64) -> Result<String> {
    if !value.is_finite() {
        return Err(ReplicationError::NumericalError {
            context: "fixed-effect identifier column",
        });
    }
    if value.fract() == 0.0 && value.abs() < 1e15 {
        Ok(format!("{}", value as i64))
    } else {
        Ok(value.to_string())
    }
}

fn expand_dummies(name: &str, levels: &[String]) -> (DMatrix<f64>, Vec<String>) {
    let distinct: Vec<&String> = levels.iter().collect::<BTreeSet<_>>().into_iter().collect();
    let kept = &distinct[distinct.len().min(1)..];
    let mut dummies = DMatrix::<f64>::zeros(levels.len(), kept.len());
    for (row, level) in levels.iter().enumerate() {
        if let Some(col) = kept.iter().position(|candidate| *candidate == level) {
            dummies[(row, col)] = 1.0;
        }
    }
    let names = kept.iter().map(|level| format!("{name}_{level}")).collect();
    (dummies, names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn design() -> (DVector<f64>, DMatrix<f64>) {
        let y = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let x = DMatrix::from_row_slice(4, 2, &[1.0, 0.5, 1.0, 1.5, 1.0, 2.5, 1.0, 3.0]);
        (y, x)
    }

    #[test]
    fn builder_assigns_default_labels() {
        let (y, x) = design();
        let data = ReplicationDataBuilder::new(y, x).build().unwrap();
        assert_eq!(data.x_labels(), &["x0".to_string(), "x1".to_string()]);
        assert_eq!(data.y_label(), "y");
        assert!(data.instruments().is_none());
    }

    #[test]
    fn builder_rejects_misaligned_cluster() {
        let (y, x) = design();
        let result = ReplicationDataBuilder::new(y, x).cluster(["a", "b"]).build();
        assert!(matches!(
            result,
            Err(ReplicationError::DimensionMismatch {
                context: "cluster length",
                expected: 4,
                found: 2
            })
        ));
    }

    #[test]
    fn builder_rejects_negative_weight() {
        let (y, x) = design();
        let weights = DVector::from_vec(vec![1.0, 1.0, -0.5, 1.0]);
        let result = ReplicationDataBuilder::new(y, x).weights(weights).build();
        assert!(matches!(
            result,
            Err(ReplicationError::InvalidWeight { index: 2, .. })
        ));
    }

    #[test]
    fn categorical_effect_expands_drop_first() {
        let (y, x) = design();
        let data = ReplicationDataBuilder::new(y, x)
            .labels(["const", "price"])
            .categorical_fixed_effect("region", ["north", "south", "east", "south"])
            .build()
            .unwrap();
        assert_eq!(data.regressor_count(), 4);
        assert_eq!(data.fixed_effect_columns(), &[2, 3]);
        assert_eq!(data.x_labels()[2], "region_north");
        assert_eq!(data.x_labels()[3], "region_south");
        assert_eq!(data.x()[(2, 2)], 0.0);
        assert_eq!(data.x()[(3, 3)], 1.0);
    }

    #[test]
    fn identifier_column_is_replaced_by_dummies() {
        let y = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let x = DMatrix::from_row_slice(
            4,
            3,
            &[1.0, 7.0, 0.5, 1.0, 3.0, 1.5, 1.0, 7.0, 2.5, 1.0, 12.0, 3.0],
        );
        let data = ReplicationDataBuilder::new(y, x)
            .labels(["const", "cell_id", "price"])
            .build()
            .unwrap();
        let (expanded, positions) = data.absorb_fixed_effects(&[1]).unwrap();
        assert_eq!(positions, vec![Some(0), None, Some(1)]);
        // Levels sort lexically: "12", "3", "7"; "12" is omitted.
        assert_eq!(
            expanded.x_labels(),
            &["const", "price", "cell_id_3", "cell_id_7"].map(String::from)
        );
        assert_eq!(expanded.fixed_effect_columns(), &[2, 3]);
        let column = |j: usize| expanded.x().column(j).iter().copied().collect::<Vec<_>>();
        assert_eq!(column(3), vec![1.0, 0.0, 1.0, 0.0]);
        assert_eq!(column(2), vec![0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn non_finite_identifier_is_rejected() {
        let (y, mut x) = design();
        x[(2, 1)] = f64::NAN;
        let data = ReplicationDataBuilder::new(y, x).build().unwrap();
        assert!(matches!(
            data.absorb_fixed_effects(&[1]),
            Err(ReplicationError::NumericalError { .. })
        ));
    }

    #[test]
    fn cluster_codes_follow_first_appearance() {
        let groups = ClusterGroups::new(vec!["b".into(), "a".into(), "b".into()]);
        assert_eq!(groups.codes(), &[0, 1, 0]);
        assert_eq!(groups.group_count(), 2);
        assert_eq!(groups.distinct(), vec!["a".to_string(), "b".to_string()]);
    }
}
