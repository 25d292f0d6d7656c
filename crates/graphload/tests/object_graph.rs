//! Materializing entity graphs: instance identity, cycles and one-to-ones.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use asupersync::runtime::RuntimeBuilder;
use graphload::prelude::*;
use graphload::testing::ScriptedConnection;
use graphload::{EntityStatus, Identifier};

use common::{customer, customer_with_order, engine, expect_err, ids, unwrap_outcome};

fn scripted_customer_one() -> ScriptedConnection {
    let conn = ScriptedConnection::new();
    conn.respond(
        "from customers",
        vec![
            customer_with_order(1, "Ada", 10, 70),
            customer_with_order(1, "Ada", 11, 30),
        ],
    );
    conn
}

#[test]
fn back_references_resolve_to_the_loading_instance() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let engine = engine(LoaderSettings::default());
        let conn = scripted_customer_one();
        let mut session = engine.factory().open_session(conn.clone());

        let ada = unwrap_outcome(
            engine
                .get(&cx, &mut session, "Customer", 1, LoadOptions::new())
                .await,
        )
        .expect("customer 1");

        assert_eq!(conn.statement_count(), 1);
        assert_eq!(ada.get("name"), Some(Value::from("Ada")));

        let orders = ada.collection("orders").expect("orders collection");
        assert!(orders.is_initialized());
        let mut order_ids: Vec<Identifier> = orders.entities().iter().map(EntityRef::id).collect();
        order_ids.sort_by_key(ToString::to_string);
        assert_eq!(order_ids, ids(&[10, 11]));

        for order in orders.entities() {
            let owner = order.association("customer").expect("order customer");
            assert!(owner.ptr_eq(&ada), "a.orders[*].customer must be a itself");
            let round_trip = owner.collection("orders").expect("orders again");
            assert!(round_trip.ptr_eq(&orders));
        }
    });
}

#[test]
fn one_instance_per_row_within_a_session() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let engine = engine(LoaderSettings::default());
        let conn = scripted_customer_one();
        let mut session = engine.factory().open_session(conn.clone());

        let first = unwrap_outcome(
            engine
                .load(&cx, &mut session, "Customer", 1, LoadOptions::new())
                .await,
        );
        let second = unwrap_outcome(
            engine
                .load(&cx, &mut session, "Customer", 1_i64, LoadOptions::new())
                .await,
        );
        assert!(first.ptr_eq(&second));

        let order = unwrap_outcome(
            engine
                .load(&cx, &mut session, "Order", 10, LoadOptions::new())
                .await,
        );
        let owner = order.association("customer").expect("order customer");
        assert!(owner.ptr_eq(&first));
        assert_eq!(conn.statement_count(), 1, "later loads come from the session");

        // A fresh session reads the row again into a new instance.
        let other_conn = scripted_customer_one();
        let mut other = engine.factory().open_session(other_conn.clone());
        let elsewhere = unwrap_outcome(
            engine
                .load(&cx, &mut other, "Customer", 1, LoadOptions::new())
                .await,
        );
        assert!(!elsewhere.ptr_eq(&first));
        assert_eq!(other_conn.statement_count(), 1);
    });
}

#[test]
fn missing_rows_are_none_or_not_found() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let engine = engine(LoaderSettings::default());
        let mut session = engine.factory().open_session(ScriptedConnection::new());

        let missing = unwrap_outcome(
            engine
                .get(&cx, &mut session, "Customer", 404, LoadOptions::new())
                .await,
        );
        assert!(missing.is_none());

        let err = expect_err(
            engine
                .load(&cx, &mut session, "Customer", 404, LoadOptions::new())
                .await,
        );
        assert!(err.is_not_found());
    });
}

#[test]
fn read_only_loads_and_after_load_actions() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let engine = engine(LoaderSettings::default());
        let conn = scripted_customer_one();
        let mut session = engine.factory().open_session(conn);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let options = LoadOptions::new().read_only(true).after_load(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let ada = unwrap_outcome(
            engine
                .load(&cx, &mut session, "Customer", 1, options)
                .await,
        );

        assert_eq!(seen.load(Ordering::SeqCst), 3, "customer and both orders");
        assert!(ada.is_read_only());
        let key = session.entity_key("Customer", 1).expect("customer key");
        let entry = session
            .persistence_context()
            .get_entry(&key)
            .expect("customer entry");
        assert_eq!(entry.status, EntityStatus::ReadOnly);
        for order in ada.collection("orders").expect("orders").entities() {
            assert!(order.is_read_only());
        }
    });
}

#[test]
fn multi_load_keeps_request_order() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let engine = engine(LoaderSettings::default());
        let conn = ScriptedConnection::new();
        conn.respond("from customers", vec![customer(1, "Ada", 1), customer(2, "Grace", 1)]);
        let mut session = engine.factory().open_session(conn.clone());

        let found = unwrap_outcome(
            engine
                .multi_load(
                    &cx,
                    &mut session,
                    "Customer",
                    &ids(&[2, 99, 1]),
                    LoadOptions::new().batch_size(3),
                )
                .await,
        );
        assert_eq!(conn.statement_count(), 1);
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].as_ref().map(EntityRef::id), Some(Identifier::from(2)));
        assert!(found[1].is_none());
        assert_eq!(found[2].as_ref().map(EntityRef::id), Some(Identifier::from(1)));

        // Managed ids are answered by the session; only 99 is queried again.
        let unordered = unwrap_outcome(
            engine
                .multi_load(
                    &cx,
                    &mut session,
                    "Customer",
                    &ids(&[2, 99, 1]),
                    LoadOptions::new().ordered_return(false),
                )
                .await,
        );
        assert_eq!(unordered.len(), 2);
        assert!(unordered.iter().all(Option::is_some));
        let last = conn.executed().pop().expect("second statement");
        assert_eq!(last.params, vec![Value::from(99)]);
    });
}

#[test]
fn missing_optional_one_to_one_is_nulled() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let engine = engine(LoaderSettings::default());
        let conn = ScriptedConnection::new();
        conn.respond(
            "from accounts",
            vec![graphload::testing::record([
                ("accounts.id", Value::from(1)),
                ("accounts.login", Value::from("ada")),
            ])],
        );
        let mut session = engine.factory().open_session(conn.clone());

        let account = unwrap_outcome(
            engine
                .load(&cx, &mut session, "Account", 1, LoadOptions::new())
                .await,
        );
        assert_eq!(conn.statement_count(), 2, "account, then its settings row");
        assert_eq!(conn.statements_matching("from account_settings").len(), 1);
        assert!(account.association("settings").is_none());

        let key = session.entity_key("Account", 1).expect("account key");
        assert!(session.persistence_context().is_property_null(&key, "settings"));
        assert!(!session.contains("Settings", 1));
    });
}

#[test]
fn sessions_of_another_factory_are_rejected() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let engine = engine(LoaderSettings::default());
        let other = common::engine(LoaderSettings::default());
        let mut session = other.factory().open_session(ScriptedConnection::new());

        let err = expect_err(
            engine
                .get(&cx, &mut session, "Customer", 1, LoadOptions::new())
                .await,
        );
        assert!(matches!(err, Error::Config(_)), "{err}");
    });
}
