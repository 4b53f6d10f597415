//! # Option Store
//!
//! Parameters flow into a training run, and results flow out of it, through a
//! tree of named options. Every value is one variant of the closed `OptValue`
//! enum; nested groups are `OptionList`s addressed with dotted paths such as
//! `paramsel.rank_max` or `split.Xva`.
//!
//! Typed accessors pattern-match on the stored variant and fail with
//! `OptionError::TypeMismatch` when the caller asks for the wrong kind. That
//! condition is a programming error, so callers propagate it instead of
//! trying to recover.

use crate::aggregate::Aggregate;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Discriminant of an `OptValue`, used in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptKind {
    String,
    StringList,
    Number,
    NumberList,
    Function,
    Matrix,
    Vector,
    List,
}

impl fmt::Display for OptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::StringList => "string list",
            Self::Number => "number",
            Self::NumberList => "number list",
            Self::Function => "function",
            Self::Matrix => "matrix",
            Self::Vector => "vector",
            Self::List => "option list",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptionError {
    #[error("Option '{path}' is not set.")]
    Missing { path: String },

    #[error("Option '{path}' holds a {found}, but a {expected} was requested.")]
    TypeMismatch {
        path: String,
        expected: OptKind,
        found: OptKind,
    },

    #[error("Option '{path}' holds a {found}, not an option list, so nothing can be nested under it.")]
    NotAList { path: String, found: OptKind },

    #[error("Option '{path}' must be a non-negative integer, but was {value}.")]
    InvalidCount { path: String, value: f64 },
}

/// A single option value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptValue {
    String(String),
    StringList(Vec<String>),
    Number(f64),
    NumberList(Vec<f64>),
    Function(Aggregate),
    Matrix(Array2<f64>),
    Vector(Array1<f64>),
    List(OptionList),
}

impl OptValue {
    pub fn kind(&self) -> OptKind {
        match self {
            Self::String(_) => OptKind::String,
            Self::StringList(_) => OptKind::StringList,
            Self::Number(_) => OptKind::Number,
            Self::NumberList(_) => OptKind::NumberList,
            Self::Function(_) => OptKind::Function,
            Self::Matrix(_) => OptKind::Matrix,
            Self::Vector(_) => OptKind::Vector,
            Self::List(_) => OptKind::List,
        }
    }
}

impl From<f64> for OptValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for OptValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for OptValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<String>> for OptValue {
    fn from(value: Vec<String>) -> Self {
        Self::StringList(value)
    }
}

impl From<Vec<f64>> for OptValue {
    fn from(value: Vec<f64>) -> Self {
        Self::NumberList(value)
    }
}

impl From<Aggregate> for OptValue {
    fn from(value: Aggregate) -> Self {
        Self::Function(value)
    }
}

impl From<Array2<f64>> for OptValue {
    fn from(value: Array2<f64>) -> Self {
        Self::Matrix(value)
    }
}

impl From<Array1<f64>> for OptValue {
    fn from(value: Array1<f64>) -> Self {
        Self::Vector(value)
    }
}

impl From<OptionList> for OptValue {
    fn from(value: OptionList) -> Self {
        Self::List(value)
    }
}

/// A named group of options. Lists nest to form the option tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionList {
    name: String,
    #[serde(default)]
    entries: BTreeMap<String, OptValue>,
}

impl OptionList {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OptValue)> {
        self.entries.iter()
    }

    /// Adds a direct child, returning the value it replaced.
    pub fn add_opt(&mut self, name: impl Into<String>, value: impl Into<OptValue>) -> Option<OptValue> {
        self.entries.insert(name.into(), value.into())
    }

    /// Removes a direct child.
    pub fn remove_opt(&mut self, name: &str) -> Option<OptValue> {
        self.entries.remove(name)
    }

    /// Returns the direct child list `name`, creating it (or replacing a
    /// non-list value) when needed.
    pub fn ensure_list(&mut self, name: &str) -> &mut OptionList {
        let entry = self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| OptValue::List(OptionList::new(name)));
        if !matches!(entry, OptValue::List(_)) {
            *entry = OptValue::List(OptionList::new(name));
        }
        match entry {
            OptValue::List(list) => list,
            _ => unreachable!("entry was just made a list"),
        }
    }

    pub fn has_opt(&self, path: &str) -> bool {
        self.get_opt(path).is_ok()
    }

    /// Looks up a value by dotted path.
    pub fn get_opt(&self, path: &str) -> Result<&OptValue, OptionError> {
        let (parent, leaf) = split_path(path);
        let list = match parent {
            Some(parent_path) => self.get_opt_as_list(parent_path)?,
            None => self,
        };
        list.entries.get(leaf).ok_or_else(|| OptionError::Missing {
            path: path.to_string(),
        })
    }

    pub fn get_opt_mut(&mut self, path: &str) -> Result<&mut OptValue, OptionError> {
        let (parent, leaf) = split_path(path);
        let list = match parent {
            Some(parent_path) => self.get_opt_as_list_mut(parent_path)?,
            None => self,
        };
        list.entries.get_mut(leaf).ok_or_else(|| OptionError::Missing {
            path: path.to_string(),
        })
    }

    /// Writes `value` at `path`. Every list on the way must already exist.
    pub fn set_opt(&mut self, path: &str, value: impl Into<OptValue>) -> Result<Option<OptValue>, OptionError> {
        let (parent, leaf) = split_path(path);
        let list = match parent {
            Some(parent_path) => self.get_opt_as_list_mut(parent_path)?,
            None => self,
        };
        Ok(list.add_opt(leaf, value))
    }

    pub fn get_opt_as_list(&self, path: &str) -> Result<&OptionList, OptionError> {
        let mut current = self;
        let mut walked = String::new();
        for segment in path.split('.') {
            let next = current.entries.get(segment).ok_or_else(|| OptionError::Missing {
                path: join_path(&walked, segment),
            })?;
            match next {
                OptValue::List(list) => current = list,
                other => {
                    return Err(OptionError::TypeMismatch {
                        path: join_path(&walked, segment),
                        expected: OptKind::List,
                        found: other.kind(),
                    });
                }
            }
            walked = join_path(&walked, segment);
        }
        Ok(current)
    }

    pub fn get_opt_as_list_mut(&mut self, path: &str) -> Result<&mut OptionList, OptionError> {
        let mut current = self;
        let mut walked = String::new();
        for segment in path.split('.') {
            let here = join_path(&walked, segment);
            let next = current
                .entries
                .get_mut(segment)
                .ok_or_else(|| OptionError::Missing { path: here.clone() })?;
            match next {
                OptValue::List(list) => current = list,
                other => {
                    return Err(OptionError::NotAList {
                        path: here,
                        found: other.kind(),
                    });
                }
            }
            walked = here;
        }
        Ok(current)
    }

    pub fn get_opt_as_number(&self, path: &str) -> Result<f64, OptionError> {
        match self.get_opt(path)? {
            OptValue::Number(value) => Ok(*value),
            other => Err(mismatch(path, OptKind::Number, other)),
        }
    }

    /// Reads a number that must be a non-negative integer, e.g. a rank.
    pub fn get_opt_as_count(&self, path: &str) -> Result<usize, OptionError> {
        let value = self.get_opt_as_number(path)?;
        if !value.is_finite() || value < 0.0 || value.fract() != 0.0 {
            return Err(OptionError::InvalidCount {
                path: path.to_string(),
                value,
            });
        }
        Ok(value as usize)
    }

    pub fn get_opt_as_string(&self, path: &str) -> Result<&str, OptionError> {
        match self.get_opt(path)? {
            OptValue::String(value) => Ok(value),
            other => Err(mismatch(path, OptKind::String, other)),
        }
    }

    pub fn get_opt_as_string_list(&self, path: &str) -> Result<&[String], OptionError> {
        match self.get_opt(path)? {
            OptValue::StringList(value) => Ok(value),
            other => Err(mismatch(path, OptKind::StringList, other)),
        }
    }

    pub fn get_opt_as_number_list(&self, path: &str) -> Result<&[f64], OptionError> {
        match self.get_opt(path)? {
            OptValue::NumberList(value) => Ok(value),
            other => Err(mismatch(path, OptKind::NumberList, other)),
        }
    }

    pub fn get_opt_as_function(&self, path: &str) -> Result<Aggregate, OptionError> {
        match self.get_opt(path)? {
            OptValue::Function(value) => Ok(*value),
            other => Err(mismatch(path, OptKind::Function, other)),
        }
    }

    pub fn get_opt_as_matrix(&self, path: &str) -> Result<&Array2<f64>, OptionError> {
        match self.get_opt(path)? {
            OptValue::Matrix(value) => Ok(value),
            other => Err(mismatch(path, OptKind::Matrix, other)),
        }
    }

    pub fn get_opt_as_vector(&self, path: &str) -> Result<&Array1<f64>, OptionError> {
        match self.get_opt(path)? {
            OptValue::Vector(value) => Ok(value),
            other => Err(mismatch(path, OptKind::Vector, other)),
        }
    }
}

fn mismatch(path: &str, expected: OptKind, found: &OptValue) -> OptionError {
    OptionError::TypeMismatch {
        path: path.to_string(),
        expected,
        found: found.kind(),
    }
}

fn split_path(path: &str) -> (Option<&str>, &str) {
    match path.rsplit_once('.') {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, path),
    }
}

fn join_path(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{prefix}.{segment}")
    }
}
