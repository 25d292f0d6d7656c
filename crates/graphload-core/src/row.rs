//! Result rows addressed by the column aliases a compiled statement selects.

use std::collections::HashMap;

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;

/// One row of a load statement's result.
///
/// Loaders only ever read columns by the aliases they generated (`id_0_`,
/// `name_1_`), so the row keeps an alias index instead of positional
/// accessors. Alias lookup ignores ASCII case.
#[derive(Debug, Clone)]
pub struct Row {
    values: Vec<Value>,
    by_alias: HashMap<String, usize>,
}

impl Row {
    /// Pair selected aliases with their values; extra values are dropped.
    pub fn new(aliases: Vec<String>, values: Vec<Value>) -> Self {
        let by_alias = aliases
            .into_iter()
            .take(values.len())
            .enumerate()
            .map(|(index, alias)| (alias.to_ascii_lowercase(), index))
            .collect();
        Self { values, by_alias }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, alias: &str) -> Option<&Value> {
        self.by_alias
            .get(&alias.to_ascii_lowercase())
            .and_then(|&index| self.values.get(index))
    }

    /// Read a column that the compiled query promised to select.
    ///
    /// A missing column means the statement and the row layout disagree,
    /// which is reported as a type error naming the alias.
    pub fn require(&self, alias: &str) -> Result<&Value> {
        self.get(alias).ok_or_else(|| {
            Error::Type(TypeError {
                expected: "selected column",
                actual: format!("column '{alias}' not found in row"),
                column: Some(alias.to_string()),
            })
        })
    }
}
