//! Shape of generated statements and reuse of compiled ones.

mod common;

use std::collections::HashSet;

use asupersync::runtime::RuntimeBuilder;
use graphload::prelude::*;
use graphload::testing::ScriptedConnection;
use graphload::{
    CompileOptions, Dialect, LoadPlanBuilder, LoadQueryCompiler, LoadQueryInfluencers,
    ParameterSlot, RootRestriction,
};
use regex::Regex;

use common::{engine, shop, unwrap_outcome};

fn compile(
    metamodel: &MappingMetamodel,
    entity: &str,
    options: &CompileOptions,
) -> graphload::CompiledLoadQuery {
    let influencers = LoadQueryInfluencers::new();
    let plan = LoadPlanBuilder::new(metamodel, &influencers)
        .build_entity_plan(entity)
        .expect("entity plan");
    LoadQueryCompiler::new(metamodel, &influencers, Dialect::Ansi)
        .compile(plan, options)
        .expect("compiled statement")
}

#[test]
fn table_and_column_aliases_are_unique() {
    let mm = shop();
    let compiled = compile(&mm, "Customer", &CompileOptions::default().batch_size(2));

    let column_aliases: Vec<String> = Regex::new(r" as (\w+)")
        .unwrap()
        .captures_iter(&compiled.sql)
        .map(|c| c[1].to_string())
        .collect();
    let distinct: HashSet<&String> = column_aliases.iter().collect();
    assert!(column_aliases.len() > 3, "{}", compiled.sql);
    assert_eq!(distinct.len(), column_aliases.len(), "{}", compiled.sql);

    let table_aliases: Vec<String> = Regex::new(r"\b(?:from|join) \w+ (\w+)")
        .unwrap()
        .captures_iter(&compiled.sql)
        .map(|c| c[1].to_string())
        .collect();
    let distinct: HashSet<&String> = table_aliases.iter().collect();
    assert_eq!(table_aliases.len(), 2, "{}", compiled.sql);
    assert_eq!(distinct.len(), table_aliases.len());
}

#[test]
fn key_restriction_has_one_marker_per_key() {
    let mm = shop();
    let single = compile(&mm, "Customer", &CompileOptions::default());
    assert!(single.sql.contains("where customer0_.id = ?"), "{}", single.sql);
    assert_eq!(single.key_arity(), 1);

    let batched = compile(&mm, "Customer", &CompileOptions::default().batch_size(4));
    assert!(
        batched.sql.contains("where customer0_.id in (?, ?, ?, ?)"),
        "{}",
        batched.sql
    );
    let expected: Vec<ParameterSlot> = (0..4)
        .map(|batch_index| ParameterSlot::Key {
            batch_index,
            column_index: 0,
        })
        .collect();
    assert_eq!(batched.slots, expected);

    let by_natural_id = compile(
        &mm,
        "Product",
        &CompileOptions::default().restriction(RootRestriction::NaturalId),
    );
    assert!(by_natural_id.sql.contains("where product0_.sku = ?"), "{}", by_natural_id.sql);
    assert_eq!(by_natural_id.slots, vec![ParameterSlot::NaturalId { index: 0 }]);
}

#[test]
fn orderings_merge_in_join_order_then_caller_order() {
    let mm = MappingMetamodel::builder()
        .entity(
            EntityPersister::builder("Customer", "customers")
                .id("id", "id")
                .basic("name", "name")
                .collection("orders", "Customer.orders")
                .collection("tags", "Customer.tags")
                .build(),
        )
        .entity(
            EntityPersister::builder("Order", "orders")
                .id("id", "id")
                .basic("total", "total")
                .build(),
        )
        .collection(
            CollectionPersister::one_to_many(
                "Customer.orders",
                "Customer",
                "Order",
                "orders",
                vec!["customer_id".into()],
            )
            .order_by("{alias}.total desc")
            .fetch(FetchStrategy::JOIN)
            .build(),
        )
        .collection(
            CollectionPersister::basic(
                "Customer.tags",
                "Customer",
                "customer_tags",
                vec!["customer_id".into()],
                "tag",
            )
            .order_by("{alias}.tag")
            .fetch(FetchStrategy::JOIN)
            .build(),
        )
        .build()
        .unwrap();

    let compiled = compile(
        &mm,
        "Customer",
        &CompileOptions::default().order_by("customer0_.name"),
    );
    let (_, ordering) = compiled
        .sql
        .split_once(" order by ")
        .expect("order by clause");
    let terms: Vec<&str> = ordering.split(", ").collect();
    assert_eq!(terms.len(), 3, "{}", compiled.sql);
    assert!(terms[0].ends_with(".total desc"), "{}", compiled.sql);
    assert!(terms[1].ends_with(".tag"), "{}", compiled.sql);
    assert_eq!(terms[2], "customer0_.name");

    for blank in ["", "   "] {
        let compiled = compile(&mm, "Customer", &CompileOptions::default().order_by(blank));
        let (_, ordering) = compiled
            .sql
            .split_once(" order by ")
            .expect("order by clause");
        let terms: Vec<&str> = ordering.split(", ").collect();
        assert_eq!(terms.len(), 2, "{}", compiled.sql);
        assert!(terms.iter().all(|t| !t.trim().is_empty()), "{}", compiled.sql);
    }

    let product = compile(&shop(), "Product", &CompileOptions::default().order_by(" "));
    assert!(!product.sql.contains(" order by"), "{}", product.sql);
    assert!(product.sql.ends_with("product0_.id = ?"), "{}", product.sql);
}

#[test]
fn statements_are_reused_until_a_filter_shapes_them() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let engine = engine(LoaderSettings::default());
        let conn = ScriptedConnection::new();
        let mut session = engine.factory().open_session(conn.clone());

        for id in [1, 2] {
            unwrap_outcome(
                engine
                    .get(&cx, &mut session, "Customer", id, LoadOptions::new())
                    .await,
            );
        }
        assert_eq!(engine.compile_count(), 1);

        let mut other = engine.factory().open_session(conn.clone());
        unwrap_outcome(
            engine
                .get(&cx, &mut other, "Customer", 3, LoadOptions::new())
                .await,
        );
        assert_eq!(engine.compile_count(), 1, "sessions share compiled statements");

        session
            .enable_filter("active")
            .expect("active filter")
            .set_parameter("flag", true);
        for id in [4, 5] {
            unwrap_outcome(
                engine
                    .get(&cx, &mut session, "Customer", id, LoadOptions::new())
                    .await,
            );
        }
        assert_eq!(engine.compile_count(), 3, "filtered statements are compiled per load");

        session.disable_filter("active");
        unwrap_outcome(
            engine
                .get(&cx, &mut session, "Customer", 6, LoadOptions::new())
                .await,
        );
        assert_eq!(engine.compile_count(), 3);

        let statements = conn.executed();
        assert_eq!(statements.len(), 6);
        assert_eq!(statements[0].sql, statements[5].sql);
    });
}
