//! SQL text fragments with their parameter slots.

use std::sync::OnceLock;

use graphload_core::{
    CollectionPersister, ElementDescriptor, EntityPersister, FilterMapping, LoadQueryInfluencers,
    MappingMetamodel,
};
use regex::Regex;

use crate::alias::{CollectionAliases, EntityAliases, secondary_table_alias};

/// Source of one bound parameter, in textual order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParameterSlot {
    /// Column `column_index` of the `batch_index`-th key
    Key {
        batch_index: usize,
        column_index: usize,
    },
    /// Parameter of an enabled filter
    Filter { filter: String, parameter: String },
    /// Value of the `index`-th natural-id property
    NaturalId { index: usize },
    /// Parameter inherited from an originating query
    Inherited(usize),
}

/// SQL text plus the slots of its `?` markers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlFragment {
    pub text: String,
    pub slots: Vec<ParameterSlot>,
}

impl SqlFragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            slots: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    pub fn push_str(&mut self, text: &str) {
        self.text.push_str(text);
    }

    pub fn append(&mut self, other: SqlFragment) {
        self.text.push_str(&other.text);
        self.slots.extend(other.slots);
    }

    /// Append `other` joined by ` and `; empty fragments are elided.
    pub fn and(&mut self, other: SqlFragment) {
        if other.is_empty() {
            return;
        }
        if !self.is_empty() {
            self.text.push_str(" and ");
        }
        self.append(other);
    }

    /// Wrap in parentheses unless empty.
    pub fn parenthesized(self) -> SqlFragment {
        if self.is_empty() {
            return self;
        }
        SqlFragment {
            text: format!("({})", self.text),
            slots: self.slots,
        }
    }
}

fn parameter_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r":([A-Za-z_][A-Za-z0-9_]*)").ok())
        .as_ref()
}

/// Replace `{alias}` in a mapped template.
pub fn render_template(template: &str, alias: &str) -> String {
    template.replace("{alias}", alias)
}

/// Render the enabled filters among `mappings` against `alias`. Named
/// parameters (`:since`) become `?` markers with filter slots.
pub fn filter_fragment(
    metamodel: &MappingMetamodel,
    mappings: &[FilterMapping],
    alias: &str,
    influencers: &LoadQueryInfluencers,
) -> SqlFragment {
    let mut out = SqlFragment::new();
    for mapping in mappings {
        if !influencers.is_filter_enabled(&mapping.name) {
            continue;
        }
        let condition = match (&mapping.condition, metamodel.filter_definition(&mapping.name)) {
            (Some(condition), _) => condition.clone(),
            (None, Some(definition)) => definition.default_condition.clone(),
            (None, None) => continue,
        };
        let rendered = render_template(&condition, alias);
        let Some(pattern) = parameter_pattern() else {
            tracing::warn!(filter = %mapping.name, "Filter parameter pattern unavailable");
            out.and(SqlFragment::text(rendered));
            continue;
        };
        let mut fragment = SqlFragment::new();
        let mut last = 0;
        for captures in pattern.captures_iter(&rendered) {
            let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            fragment.text.push_str(&rendered[last..whole.start()]);
            fragment.text.push('?');
            fragment.slots.push(ParameterSlot::Filter {
                filter: mapping.name.clone(),
                parameter: name.as_str().to_string(),
            });
            last = whole.end();
        }
        fragment.text.push_str(&rendered[last..]);
        out.and(fragment);
    }
    out
}

/// Columns of an entity reference: identifier, discriminator, then
/// every property column of the hierarchy.
pub fn entity_select_fragment(
    persister: &EntityPersister,
    aliases: &EntityAliases,
    table_alias: &str,
) -> String {
    let mut columns: Vec<String> = persister
        .id_columns
        .iter()
        .zip(&aliases.identifier)
        .map(|(c, a)| format!("{table_alias}.{c} as {a}"))
        .collect();
    if let (Some(column), Some(alias)) = (&persister.discriminator_column, &aliases.discriminator)
    {
        if aliases.column(0, column).is_none() {
            columns.push(format!("{table_alias}.{column} as {alias}"));
        }
    }
    for (table, column, alias) in aliases.columns() {
        let qualifier = secondary_table_alias(table_alias, table);
        columns.push(format!("{qualifier}.{column} as {alias}"));
    }
    columns.join(", ")
}

/// Columns of a collection reference: key, index and element. A
/// many-to-many element is read through the joined element entity when
/// `element_alias` is given.
pub fn collection_select_fragment(
    metamodel: &MappingMetamodel,
    persister: &CollectionPersister,
    aliases: &CollectionAliases,
    table_alias: &str,
    element_alias: Option<&str>,
) -> String {
    let mut columns: Vec<String> = persister
        .key_columns
        .iter()
        .zip(&aliases.key)
        .map(|(c, a)| format!("{table_alias}.{c} as {a}"))
        .collect();
    if let (Some(column), Some(alias)) = (&persister.index_column, &aliases.index) {
        columns.push(format!("{table_alias}.{column} as {alias}"));
    }
    let element_columns: Vec<(String, String)> = match &persister.element {
        ElementDescriptor::Basic { column } => vec![(table_alias.to_string(), column.clone())],
        ElementDescriptor::OneToMany { entity } => metamodel
            .entity(entity)
            .map(|p| p.id_columns.clone())
            .unwrap_or_default()
            .into_iter()
            .map(|c| (table_alias.to_string(), c))
            .collect(),
        ElementDescriptor::ManyToMany { entity, columns } => match element_alias {
            Some(element_alias) => metamodel
                .entity(entity)
                .map(|p| p.id_columns.clone())
                .unwrap_or_default()
                .into_iter()
                .map(|c| (element_alias.to_string(), c))
                .collect(),
            None => columns
                .iter()
                .map(|c| (table_alias.to_string(), c.clone()))
                .collect(),
        },
    };
    for ((qualifier, column), alias) in element_columns.iter().zip(&aliases.element) {
        columns.push(format!("{qualifier}.{column} as {alias}"));
    }
    columns.join(", ")
}

/// Joins for an entity's secondary tables.
pub fn secondary_table_joins(persister: &EntityPersister, table_alias: &str) -> String {
    let mut out = String::new();
    for (i, secondary) in persister.secondary_tables.iter().enumerate() {
        let alias = secondary_table_alias(table_alias, i + 1);
        let keyword = if secondary.optional {
            "left outer join"
        } else {
            "inner join"
        };
        let on: Vec<String> = persister
            .id_columns
            .iter()
            .zip(&secondary.key_columns)
            .map(|(id, key)| format!("{table_alias}.{id}={alias}.{key}"))
            .collect();
        out.push_str(&format!(
            " {keyword} {} {alias} on {}",
            secondary.table,
            on.join(" and ")
        ));
    }
    out
}
