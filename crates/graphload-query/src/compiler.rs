//! Compiles a load plan into one SQL statement plus its row layout.

use std::sync::Arc;

use graphload_core::{
    CollectionKind, CollectionPersister, Error, LoadPlan, LoadQueryInfluencers, LockOptions,
    MappingMetamodel, NodeId, NodeKind, PlanErrorKind, Result,
};

use crate::alias::AliasResolutionContext;
use crate::association::{JoinType, build_associations, collection_on_condition, render_joins};
use crate::dialect::Dialect;
use crate::fragment::{
    ParameterSlot, SqlFragment, collection_select_fragment, entity_select_fragment,
    filter_fragment, render_template, secondary_table_joins,
};

/// How the root rows are restricted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum RootRestriction {
    /// Identifier for entity roots, collection key for collection roots
    #[default]
    Key,
    /// Natural-id columns of an entity root
    NaturalId,
    /// Collection keys drawn from an originating query's owner ids
    Subselect {
        id_select: String,
        parameter_count: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    pub batch_size: usize,
    pub lock: LockOptions,
    /// Caller ordering appended after mapped orderings
    pub order_by: Option<String>,
    pub restriction: RootRestriction,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            batch_size: 1,
            lock: LockOptions::default(),
            order_by: None,
            restriction: RootRestriction::Key,
        }
    }
}

impl CompileOptions {
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn lock(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }

    pub fn order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    /// The caller's ORDER BY, unless blank.
    fn caller_ordering(&self) -> Option<&str> {
        self.order_by
            .as_deref()
            .map(str::trim)
            .filter(|order| !order.is_empty())
    }

    pub fn restriction(mut self, restriction: RootRestriction) -> Self {
        self.restriction = restriction;
        self
    }
}

/// Owner-id select of an entity query, kept for subselect fetching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubselectSource {
    /// `select a.id from t a where ...` with `?` markers
    pub sql: String,
    pub slots: Vec<ParameterSlot>,
}

/// A compiled, reusable load statement.
#[derive(Debug, Clone)]
pub struct CompiledLoadQuery {
    pub sql: String,
    pub slots: Vec<ParameterSlot>,
    pub batch_size: usize,
    pub plan: Arc<LoadPlan>,
    pub aliases: Arc<AliasResolutionContext>,
    pub root: NodeId,
    pub lock: LockOptions,
    pub subselect_source: Option<SubselectSource>,
}

impl CompiledLoadQuery {
    /// Number of key slots per batch entry.
    pub fn key_arity(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, ParameterSlot::Key { batch_index: 0, .. }))
            .count()
    }
}

pub struct LoadQueryCompiler<'a> {
    metamodel: &'a MappingMetamodel,
    influencers: &'a LoadQueryInfluencers,
    dialect: Dialect,
    use_sql_comments: bool,
}

impl<'a> LoadQueryCompiler<'a> {
    pub fn new(
        metamodel: &'a MappingMetamodel,
        influencers: &'a LoadQueryInfluencers,
        dialect: Dialect,
    ) -> Self {
        Self {
            metamodel,
            influencers,
            dialect,
            use_sql_comments: false,
        }
    }

    pub fn use_sql_comments(mut self, enabled: bool) -> Self {
        self.use_sql_comments = enabled;
        self
    }

    pub fn compile(&self, plan: LoadPlan, options: &CompileOptions) -> Result<CompiledLoadQuery> {
        let [root] = plan.returns() else {
            return Err(Error::plan(
                PlanErrorKind::MalformedTree,
                format!("expected exactly one return, found {}", plan.returns().len()),
            ));
        };
        let root = *root;
        self.check_bag_fetches(&plan)?;

        let mut aliases = AliasResolutionContext::new();
        let (mut sql, subselect_source, comment) = match &plan.node(root).kind {
            NodeKind::EntityReturn { entity } => {
                aliases.resolve_entity_reference(self.metamodel, &plan, root)?;
                let associations =
                    build_associations(self.metamodel, &plan, &mut aliases, self.influencers)?;
                self.entity_statement(&plan, root, entity, &aliases, &associations, options)?
            }
            NodeKind::CollectionReturn { role } => {
                aliases.resolve_collection_reference(self.metamodel, &plan, root)?;
                let associations =
                    build_associations(self.metamodel, &plan, &mut aliases, self.influencers)?;
                let (sql, comment) =
                    self.collection_statement(&plan, root, role, &aliases, &associations, options)?;
                (sql, None, comment)
            }
            other => {
                return Err(Error::plan(
                    PlanErrorKind::MalformedTree,
                    format!("{:?} cannot be a return", other),
                ));
            }
        };

        if self.use_sql_comments {
            sql.text = self.dialect.apply_comment(&sql.text, &comment);
        }
        let rendered = self.dialect.render_placeholders(&sql.text);
        tracing::debug!(sql = %rendered, params = sql.slots.len(), "Compiled load query");
        Ok(CompiledLoadQuery {
            sql: rendered,
            slots: sql.slots,
            batch_size: options.batch_size.max(1),
            plan: Arc::new(plan),
            aliases: Arc::new(aliases),
            root,
            lock: options.lock.clone(),
            subselect_source,
        })
    }

    fn check_bag_fetches(&self, plan: &LoadPlan) -> Result<()> {
        let mut bags = 0;
        for node in plan.walk() {
            if let NodeKind::CollectionFetch { role, .. } = &plan.node(node).kind {
                if plan.is_joined(node) && self.metamodel.collection(role)?.kind == CollectionKind::Bag
                {
                    bags += 1;
                }
            }
        }
        if bags > 1 {
            return Err(Error::unsupported(
                "multiple bag fetches",
                "cannot simultaneously join fetch more than one bag",
            ));
        }
        Ok(())
    }

    fn select_list(&self, plan: &LoadPlan, aliases: &AliasResolutionContext) -> Result<String> {
        let mut columns = Vec::new();
        for node in plan.walk() {
            if !plan.is_joined(node) {
                continue;
            }
            match &plan.node(node).kind {
                kind if kind.is_entity_reference() => {
                    let Some(entity_aliases) = aliases.entity(node) else {
                        continue;
                    };
                    let entity = kind.entity().unwrap_or_default();
                    let persister = self.metamodel.entity(entity)?;
                    columns.push(entity_select_fragment(
                        persister,
                        &entity_aliases.columns,
                        &entity_aliases.table_alias,
                    ));
                }
                kind => {
                    let Some(collection_aliases) = aliases.collection(node) else {
                        continue;
                    };
                    let role = kind.role().unwrap_or_default();
                    let persister = self.metamodel.collection(role)?;
                    let element_alias = plan
                        .element_of(node)
                        .and_then(|e| aliases.entity(e))
                        .map(|e| e.table_alias.as_str());
                    columns.push(collection_select_fragment(
                        self.metamodel,
                        persister,
                        &collection_aliases.columns,
                        &collection_aliases.table_alias,
                        element_alias,
                    ));
                }
            }
        }
        Ok(columns.join(", "))
    }

    fn entity_statement(
        &self,
        plan: &LoadPlan,
        root: NodeId,
        entity: &str,
        aliases: &AliasResolutionContext,
        associations: &[crate::association::JoinableAssociation],
        options: &CompileOptions,
    ) -> Result<(SqlFragment, Option<SubselectSource>, String)> {
        let persister = self.metamodel.entity(entity)?;
        let root_aliases = aliases.entity(root).ok_or_else(|| {
            Error::plan(PlanErrorKind::MalformedTree, "root entity was not resolved")
        })?;
        let alias = root_aliases.table_alias.as_str();

        let (restriction, comment) = match &options.restriction {
            RootRestriction::Key => (
                key_restriction(&qualify(alias, &persister.id_columns), options.batch_size),
                format!("load {}", persister.entity_name),
            ),
            RootRestriction::NaturalId => {
                let mut columns = Vec::new();
                for index in &persister.natural_id {
                    let property = &persister.properties[*index];
                    if property.is_association() {
                        return Err(Error::unsupported(
                            "natural id association",
                            format!(
                                "natural id property {}.{} is an association",
                                persister.entity_name, property.name
                            ),
                        ));
                    }
                    columns.extend(property.columns().iter().cloned());
                }
                if columns.is_empty() {
                    return Err(Error::plan(
                        PlanErrorKind::InvalidArgument,
                        format!("{} has no natural id", persister.entity_name),
                    ));
                }
                (
                    natural_id_restriction(&qualify(alias, &columns)),
                    format!("load {} by natural id", persister.entity_name),
                )
            }
            RootRestriction::Subselect { .. } => {
                return Err(Error::plan(
                    PlanErrorKind::InvalidArgument,
                    "subselect restrictions apply to collection roots",
                ));
            }
        };

        let mut where_clause = restriction.clone();
        if let Some(mapped) = &persister.where_clause {
            where_clause.and(SqlFragment::text(format!("({})", render_template(mapped, alias))));
        }

        let mut sql = SqlFragment::text(format!(
            "select {} from {} {}",
            self.select_list(plan, aliases)?,
            persister.table,
            alias
        ));
        sql.push_str(&secondary_table_joins(persister, alias));
        sql.append(render_joins(
            self.metamodel,
            associations,
            self.influencers,
            self.dialect,
        )?);
        sql.push_str(" where ");
        sql.append(where_clause.clone());

        let mut orderings = association_orderings(associations);
        if let Some(extra) = options.caller_ordering() {
            orderings.push(extra.to_string());
        }
        if !orderings.is_empty() {
            sql.push_str(" order by ");
            sql.push_str(&orderings.join(", "));
        }
        sql.push_str(&self.dialect.lock_clause(&options.lock, alias));

        let subselect = SubselectSource {
            sql: format!(
                "select {} from {} {} where {}",
                qualify(alias, &persister.id_columns).join(", "),
                persister.table,
                alias,
                where_clause.text
            ),
            slots: where_clause.slots,
        };
        Ok((sql, Some(subselect), comment))
    }

    fn collection_statement(
        &self,
        plan: &LoadPlan,
        root: NodeId,
        role: &str,
        aliases: &AliasResolutionContext,
        associations: &[crate::association::JoinableAssociation],
        options: &CompileOptions,
    ) -> Result<(SqlFragment, String)> {
        let collection = self.metamodel.collection(role)?;
        let root_aliases = aliases.collection(root).ok_or_else(|| {
            Error::plan(PlanErrorKind::MalformedTree, "root collection was not resolved")
        })?;
        let alias = root_aliases.table_alias.as_str();
        let element_alias = plan
            .element_of(root)
            .and_then(|e| aliases.entity(e))
            .map(|e| e.table_alias.clone());

        let mut sql = SqlFragment::text(format!(
            "select {} from {} {}",
            self.select_list(plan, aliases)?,
            collection.table,
            alias
        ));
        if collection.is_one_to_many() {
            if let Some(entity) = collection.element.entity() {
                sql.push_str(&secondary_table_joins(self.metamodel.entity(entity)?, alias));
            }
        }
        sql.append(render_joins(
            self.metamodel,
            associations,
            self.influencers,
            self.dialect,
        )?);

        let mut where_clause = collection_on_condition(self.metamodel, collection, alias, self.influencers)?;
        if let (true, Some(element_alias)) = (collection.is_many_to_many(), &element_alias) {
            where_clause.and(filter_fragment(
                self.metamodel,
                &collection.many_to_many_filters,
                element_alias,
                self.influencers,
            ));
        }
        let key_columns = qualify(alias, &collection.key_columns);
        let (restriction, comment) = match &options.restriction {
            RootRestriction::Key => (
                key_restriction(&key_columns, options.batch_size),
                format!("load collection {}", collection.role),
            ),
            RootRestriction::Subselect {
                id_select,
                parameter_count,
            } => (
                subselect_restriction(&key_columns, id_select, *parameter_count),
                format!("load collection {} by subselect", collection.role),
            ),
            RootRestriction::NaturalId => {
                return Err(Error::plan(
                    PlanErrorKind::InvalidArgument,
                    "natural-id restrictions apply to entity roots",
                ));
            }
        };
        where_clause.and(restriction);
        sql.push_str(" where ");
        sql.append(where_clause);

        let mut orderings = Vec::new();
        if let Some(order) = &collection.order_by {
            orderings.push(render_template(order, alias));
        }
        if let (Some(order), Some(element_alias)) = (&collection.many_to_many_order_by, &element_alias)
        {
            orderings.push(render_template(order, element_alias));
        }
        orderings.extend(association_orderings(associations));
        if let Some(extra) = options.caller_ordering() {
            orderings.push(extra.to_string());
        }
        if !orderings.is_empty() {
            sql.push_str(" order by ");
            sql.push_str(&orderings.join(", "));
        }
        sql.push_str(&self.dialect.lock_clause(&options.lock, alias));
        Ok((sql, comment))
    }
}

fn qualify(alias: &str, columns: &[String]) -> Vec<String> {
    columns.iter().map(|c| format!("{alias}.{c}")).collect()
}

/// `c = ?`, `c in (?, ?)`, `(c1 = ? and c2 = ?)` or a disjunction of those.
pub fn key_restriction(columns: &[String], batch_size: usize) -> SqlFragment {
    let batch_size = batch_size.max(1);
    let mut out = SqlFragment::new();
    if let [column] = columns {
        if batch_size == 1 {
            out.push_str(&format!("{column} = ?"));
        } else {
            out.push_str(&format!(
                "{column} in ({})",
                vec!["?"; batch_size].join(", ")
            ));
        }
        out.slots = (0..batch_size)
            .map(|batch_index| ParameterSlot::Key {
                batch_index,
                column_index: 0,
            })
            .collect();
        return out;
    }
    let tuple = format!(
        "({})",
        columns
            .iter()
            .map(|c| format!("{c} = ?"))
            .collect::<Vec<_>>()
            .join(" and ")
    );
    let text = vec![tuple; batch_size].join(" or ");
    out.text = if batch_size > 1 {
        format!("({text})")
    } else {
        text
    };
    for batch_index in 0..batch_size {
        for column_index in 0..columns.len() {
            out.slots.push(ParameterSlot::Key {
                batch_index,
                column_index,
            });
        }
    }
    out
}

fn natural_id_restriction(columns: &[String]) -> SqlFragment {
    SqlFragment {
        text: columns
            .iter()
            .map(|c| format!("{c} = ?"))
            .collect::<Vec<_>>()
            .join(" and "),
        slots: (0..columns.len())
            .map(|index| ParameterSlot::NaturalId { index })
            .collect(),
    }
}

fn subselect_restriction(columns: &[String], id_select: &str, parameter_count: usize) -> SqlFragment {
    let lhs = if let [column] = columns {
        column.clone()
    } else {
        format!("({})", columns.join(", "))
    };
    SqlFragment {
        text: format!("{lhs} in ({id_select})"),
        slots: (0..parameter_count).map(ParameterSlot::Inherited).collect(),
    }
}

/// Orderings of outer-joined collections, and of many-to-many elements
/// right after their bridge.
fn association_orderings(associations: &[crate::association::JoinableAssociation]) -> Vec<String> {
    let mut out = Vec::new();
    let mut previous: Option<&crate::association::JoinableAssociation> = None;
    for association in associations {
        if association.join_type == JoinType::LeftOuter {
            if let Some(collection) = association.joinable.as_collection() {
                if let Some(order) = &collection.order_by {
                    out.push(render_template(order, &association.aliases.rhs_alias));
                }
            } else if let Some(prev) = previous.filter(|p| association.is_many_to_many_element_of(p)) {
                if let Some(order) = prev
                    .joinable
                    .as_collection()
                    .and_then(|c: &Arc<CollectionPersister>| c.many_to_many_order_by.as_ref())
                {
                    out.push(render_template(order, &association.aliases.rhs_alias));
                }
            }
        }
        previous = Some(association);
    }
    out
}
