//! Column identifiers for interest variables, fixed effects and endogenous regressors.
//!
//! Callers name regressors either by position or by label, one at a time or as
//! a list. Every call site resolves through [`ColumnSelection::resolve`], which
//! produces canonical zero-based positions in order of appearance.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ReplicationError, Result};

/// A single regressor, named by position or by label.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnRef {
    Position(usize),
    Label(String),
}

impl ColumnRef {
    fn resolve(&self, context: &'static str, labels: &[String]) -> Result<usize> {
        match self {
            ColumnRef::Position(position) => {
                if *position < labels.len() {
                    Ok(*position)
                } else {
                    Err(ReplicationError::ColumnOutOfRange {
                        context,
                        position: *position,
                        ncols: labels.len(),
                    })
                }
            }
            ColumnRef::Label(label) => labels
                .iter()
                .position(|candidate| candidate == label)
                .ok_or_else(|| ReplicationError::UnknownColumn {
                    context,
                    label: label.clone(),
                }),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnRef::Position(position) => write!(f, "{position}"),
            ColumnRef::Label(label) => f.write_str(label),
        }
    }
}

impl From<usize> for ColumnRef {
    fn from(value: usize) -> Self {
        ColumnRef::Position(value)
    }
}

impl From<&str> for ColumnRef {
    fn from(value: &str) -> Self {
        ColumnRef::Label(value.to_string())
    }
}

impl From<String> for ColumnRef {
    fn from(value: String) -> Self {
        ColumnRef::Label(value)
    }
}

/// One regressor or an ordered list of regressors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnSelection {
    One(ColumnRef),
    Many(Vec<ColumnRef>),
}

impl ColumnSelection {
    /// Builds a list selection from anything convertible into column references.
    pub fn many<I, C>(columns: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<ColumnRef>,
    {
        ColumnSelection::Many(columns.into_iter().map(Into::into).collect())
    }

    /// The selection as a list, preserving caller order.
    pub fn to_list(&self) -> Vec<ColumnRef> {
        match self {
            ColumnSelection::One(column) => vec![column.clone()],
            ColumnSelection::Many(columns) => columns.clone(),
        }
    }

    /// Number of columns named.
    pub fn len(&self) -> usize {
        match self {
            ColumnSelection::One(_) => 1,
            ColumnSelection::Many(columns) => columns.len(),
        }
    }

    /// Whether the selection names no columns at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves every reference against `labels`, returning positions in caller order.
    ///
    /// Duplicated references collapse to their first occurrence.
    pub fn resolve(&self, context: &'static str, labels: &[String]) -> Result<Vec<usize>> {
        let mut positions = Vec::with_capacity(self.len());
        for column in self.to_list() {
            let position = column.resolve(context, labels)?;
            if !positions.contains(&position) {
                positions.push(position);
            }
        }
        Ok(positions)
    }
}

impl From<ColumnRef> for ColumnSelection {
    fn from(value: ColumnRef) -> Self {
        ColumnSelection::One(value)
    }
}

impl From<usize> for ColumnSelection {
    fn from(value: usize) -> Self {
        ColumnSelection::One(value.into())
    }
}

impl From<&str> for ColumnSelection {
    fn from(value: &str) -> Self {
        ColumnSelection::One(value.into())
    }
}

impl From<String> for ColumnSelection {
    fn from(value: String) -> Self {
        ColumnSelection::One(value.into())
    }
}

impl From<Vec<ColumnRef>> for ColumnSelection {
    fn from(value: Vec<ColumnRef>) -> Self {
        ColumnSelection::Many(value)
    }
}

impl From<Vec<usize>> for ColumnSelection {
    fn from(value: Vec<usize>) -> Self {
        ColumnSelection::many(value)
    }
}

impl From<Vec<&str>> for ColumnSelection {
    fn from(value: Vec<&str>) -> Self {
        ColumnSelection::many(value)
    }
}

impl From<Vec<String>> for ColumnSelection {
    fn from(value: Vec<String>) -> Self {
        ColumnSelection::many(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<String> {
        ["const", "price", "income"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn mixed_references_resolve_in_order() {
        let selection = ColumnSelection::Many(vec!["income".into(), 1usize.into()]);
        assert_eq!(selection.resolve("X", &labels()).unwrap(), vec![2, 1]);
    }

    #[test]
    fn unknown_label_is_reported() {
        let selection = ColumnSelection::from("wage");
        let err = selection.resolve("X", &labels()).unwrap_err();
        assert!(matches!(err, ReplicationError::UnknownColumn { ref label, .. } if label == "wage"));
    }

    #[test]
    fn position_past_end_is_rejected() {
        let selection = ColumnSelection::from(3usize);
        assert!(matches!(
            selection.resolve("X", &labels()),
            Err(ReplicationError::ColumnOutOfRange { position: 3, ncols: 3, .. })
        ));
    }

    #[test]
    fn serializes_untagged() {
        let selection = ColumnSelection::Many(vec![1usize.into(), "price".into()]);
        let json = serde_json::to_string(&selection.to_list()).unwrap();
        assert_eq!(json, r#"[1,"price"]"#);
    }
}
