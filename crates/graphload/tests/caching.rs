//! Shared cache reads and writes, and natural-id resolution.

mod common;

use asupersync::runtime::RuntimeBuilder;
use graphload::prelude::*;
use graphload::testing::ScriptedConnection;

use common::{engine, expect_err, product, unwrap_outcome};

fn scripted_product() -> ScriptedConnection {
    let conn = ScriptedConnection::new();
    conn.respond("from products", vec![product(1, "sku-1", "Lamp")]);
    conn
}

#[test]
fn cached_state_matches_the_database_row() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let engine = engine(LoaderSettings::default().statistics(true));

        let db_conn = scripted_product();
        let mut first = engine.factory().open_session(db_conn.clone());
        let from_db = unwrap_outcome(
            engine
                .load(&cx, &mut first, "Product", 1, LoadOptions::new())
                .await,
        );
        assert_eq!(db_conn.statement_count(), 1);

        let cache_conn = ScriptedConnection::new();
        let mut second = engine.factory().open_session(cache_conn.clone());
        let from_cache = unwrap_outcome(
            engine
                .load(&cx, &mut second, "Product", 1, LoadOptions::new())
                .await,
        );
        assert_eq!(cache_conn.statement_count(), 0);
        assert!(!from_cache.ptr_eq(&from_db));
        assert!(from_cache.is_initialized());
        assert_eq!(from_cache.entity_name(), from_db.entity_name());
        for property in ["sku", "title"] {
            assert_eq!(from_cache.get(property), from_db.get(property), "{property}");
        }

        let stats = engine.factory().statistics().snapshot();
        let region = stats.region("products");
        assert_eq!((region.misses, region.puts, region.hits), (1, 1, 1));
        assert_eq!(stats.statements, 1);
    });
}

#[test]
fn ignore_mode_bypasses_the_cache() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let engine = engine(LoaderSettings::default().statistics(true));

        let conn = scripted_product();
        let mut first = engine.factory().open_session(conn.clone());
        unwrap_outcome(
            engine
                .load(
                    &cx,
                    &mut first,
                    "Product",
                    1,
                    LoadOptions::new().cache_mode(CacheMode::Ignore),
                )
                .await,
        );
        assert_eq!(first.cache_mode(), CacheMode::Normal, "per-call mode is restored");

        let conn = ScriptedConnection::new();
        let mut second = engine.factory().open_session(conn.clone());
        let missing = unwrap_outcome(
            engine
                .get(&cx, &mut second, "Product", 1, LoadOptions::new())
                .await,
        );
        assert!(missing.is_none(), "nothing was cached");
        assert_eq!(conn.statement_count(), 1);
        assert_eq!(engine.factory().statistics().snapshot().region("products").puts, 0);
    });
}

#[test]
fn natural_id_resolves_once_per_session() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let engine = engine(LoaderSettings::default().statistics(true));
        let conn = scripted_product();
        let mut session = engine.factory().open_session(conn.clone());

        let lamp = unwrap_outcome(
            engine
                .load_by_natural_id(
                    &cx,
                    &mut session,
                    "Product",
                    vec![Value::from("sku-1")],
                    LoadOptions::new(),
                )
                .await,
        )
        .expect("product by sku");
        assert_eq!(lamp.id(), Identifier::from(1));

        let statements = conn.executed();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].sql.contains("product0_.sku = ?"), "{}", statements[0].sql);
        assert_eq!(statements[0].params, vec![Value::from("sku-1")]);

        let again = unwrap_outcome(
            engine
                .load_by_natural_id(
                    &cx,
                    &mut session,
                    "Product",
                    vec![Value::from("sku-1")],
                    LoadOptions::new(),
                )
                .await,
        )
        .expect("product by sku again");
        assert!(again.ptr_eq(&lamp));
        assert_eq!(conn.statement_count(), 1);
        assert_eq!(engine.factory().statistics().snapshot().natural_id_queries, 1);

        let err = expect_err(
            engine
                .load_by_natural_id(
                    &cx,
                    &mut session,
                    "Product",
                    vec![Value::from("sku-1"), Value::from("extra")],
                    LoadOptions::new(),
                )
                .await,
        );
        assert!(err.is_plan_error());

        let err = expect_err(
            engine
                .load_by_natural_id(
                    &cx,
                    &mut session,
                    "Customer",
                    vec![Value::from("Ada")],
                    LoadOptions::new(),
                )
                .await,
        );
        assert!(err.is_plan_error());
    });
}
