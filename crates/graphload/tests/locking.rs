//! Lock upgrades, database snapshots and subclass resolution.

mod common;

use asupersync::runtime::RuntimeBuilder;
use graphload::prelude::*;
use graphload::testing::{ScriptedConnection, record};
use graphload::{WrongClassError, WrongClassErrorKind};

use common::{customer, engine, expect_err, ids, unwrap_outcome};

#[test]
fn changed_version_under_a_pessimistic_lock_is_stale() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let engine = engine(LoaderSettings::default().statistics(true));
        let conn = ScriptedConnection::new();
        conn.respond("from customers", vec![customer(1, "Ada", 1)])
            .respond("from customers", vec![customer(1, "Ada", 2)]);
        let mut session = engine.factory().open_session(conn.clone());

        unwrap_outcome(
            engine
                .load(&cx, &mut session, "Customer", 1, LoadOptions::new())
                .await,
        );
        let err = expect_err(
            engine
                .load(
                    &cx,
                    &mut session,
                    "Customer",
                    1,
                    LoadOptions::new().lock_mode(LockMode::PessimisticWrite),
                )
                .await,
        );
        assert!(err.is_stale_state(), "{err}");

        let statements = conn.executed();
        assert_eq!(statements.len(), 2);
        assert!(statements[1].sql.contains(" for update"), "{}", statements[1].sql);
        assert_eq!(
            engine.factory().statistics().snapshot().optimistic_failures,
            1
        );
    });
}

#[test]
fn matching_version_upgrades_the_entry_lock() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let engine = engine(LoaderSettings::default());
        let conn = ScriptedConnection::new();
        conn.respond_always("from customers", vec![customer(1, "Ada", 4)]);
        let mut session = engine.factory().open_session(conn.clone());

        let ada = unwrap_outcome(
            engine
                .load(&cx, &mut session, "Customer", 1, LoadOptions::new())
                .await,
        );
        let locked = unwrap_outcome(
            engine
                .load(
                    &cx,
                    &mut session,
                    "Customer",
                    1,
                    LoadOptions::new().lock_mode(LockMode::PessimisticWrite),
                )
                .await,
        );
        assert!(locked.ptr_eq(&ada));
        assert_eq!(conn.statement_count(), 2);

        let key = session.entity_key("Customer", 1).expect("customer key");
        let entry = session
            .persistence_context()
            .get_entry(&key)
            .expect("customer entry");
        assert_eq!(entry.lock_mode, LockMode::PessimisticWrite);

        // A weaker request leaves the held lock alone and reads nothing.
        unwrap_outcome(
            engine
                .load(
                    &cx,
                    &mut session,
                    "Customer",
                    1,
                    LoadOptions::new().lock_mode(LockMode::Read),
                )
                .await,
        );
        assert_eq!(conn.statement_count(), 2);
    });
}

#[test]
fn missing_row_under_a_pessimistic_lock_is_stale() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let engine = engine(LoaderSettings::default());
        let conn = ScriptedConnection::new();
        conn.respond("from customers", vec![customer(1, "Ada", 1)]);
        let mut session = engine.factory().open_session(conn.clone());

        unwrap_outcome(
            engine
                .load(&cx, &mut session, "Customer", 1, LoadOptions::new())
                .await,
        );
        let err = expect_err(
            engine
                .get(
                    &cx,
                    &mut session,
                    "Customer",
                    1,
                    LoadOptions::new().lock_mode(LockMode::PessimisticWrite),
                )
                .await,
        );
        assert!(err.is_stale_state(), "{err}");
    });
}

#[test]
fn snapshot_reads_columns_without_managing_the_row() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let engine = engine(LoaderSettings::default());
        let conn = ScriptedConnection::new();
        conn.respond("from customers", vec![customer(1, "Ada", 3)]);
        let mut session = engine.factory().open_session(conn.clone());

        let snapshot = unwrap_outcome(engine.load_snapshot(&cx, &mut session, "Customer", 1).await)
            .expect("snapshot row");
        let persister = engine
            .factory()
            .metamodel()
            .entity("Customer")
            .expect("customer mapping");
        assert_eq!(snapshot.len(), persister.properties.len());
        let at = |name: &str| {
            let index = persister.property_index(name).expect("mapped property");
            snapshot[index].clone()
        };
        assert_eq!(at("name"), Value::from("Ada"));
        assert_eq!(at("version"), Value::from(3));
        assert_eq!(at("orders"), Value::Null);

        assert_eq!(session.persistence_context().entity_count(), 0);
        assert!(!session.contains("Customer", 1));

        let missing = unwrap_outcome(engine.load_snapshot(&cx, &mut session, "Customer", 2).await);
        assert!(missing.is_none());
    });
}

fn scripted_cat() -> ScriptedConnection {
    let conn = ScriptedConnection::new();
    conn.respond_always(
        "from animals",
        vec![record([
            ("animals.id", Value::from(1)),
            ("animals.kind", Value::from("cat")),
            ("animals.name", Value::from("Tom")),
            ("animals.lives", Value::from(9)),
        ])],
    );
    conn
}

#[test]
fn rows_of_another_subclass_are_rejected() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let engine = engine(LoaderSettings::default());

        let mut fresh = engine.factory().open_session(scripted_cat());
        let err = expect_err(
            engine
                .get(&cx, &mut fresh, "Dog", 1, LoadOptions::new())
                .await,
        );
        assert!(
            matches!(
                err,
                Error::WrongClass(WrongClassError {
                    kind: WrongClassErrorKind::NotASubtype,
                    ..
                })
            ),
            "{err}"
        );

        let mut session = engine.factory().open_session(scripted_cat());
        let tom = unwrap_outcome(
            engine
                .load(&cx, &mut session, "Animal", 1, LoadOptions::new())
                .await,
        );
        assert_eq!(tom.entity_name(), "Cat");
        assert_eq!(tom.get("lives"), Some(Value::from(9)));

        let err = expect_err(
            engine
                .get(&cx, &mut session, "Dog", 1, LoadOptions::new())
                .await,
        );
        assert!(
            matches!(
                err,
                Error::WrongClass(WrongClassError {
                    kind: WrongClassErrorKind::InconsistentReturnClass,
                    ..
                })
            ),
            "{err}"
        );

        let key = session.entity_key("Animal", 1).expect("animal key");
        assert!(!session.contains("Animal", 1), "inconsistent instance is evicted");
        assert!(session.persistence_context().get_entry(&key).is_none());
        assert!(session.persistence_context().get_proxy(&key).is_none());

        let cat = unwrap_outcome(
            engine
                .load(&cx, &mut session, "Cat", 1, LoadOptions::new())
                .await,
        );
        assert!(!cat.ptr_eq(&tom), "the row is read again");
        assert_eq!(cat.get("lives"), Some(Value::from(9)));
    });
}

#[test]
fn multi_load_upgrades_locks_of_managed_entities() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let engine = engine(LoaderSettings::default());
        let conn = ScriptedConnection::new();
        conn.respond_always("from customers", vec![customer(1, "Ada", 2)]);
        let mut session = engine.factory().open_session(conn.clone());

        let ada = unwrap_outcome(
            engine
                .load(&cx, &mut session, "Customer", 1, LoadOptions::new())
                .await,
        );
        let found = unwrap_outcome(
            engine
                .multi_load(
                    &cx,
                    &mut session,
                    "Customer",
                    &ids(&[1]),
                    LoadOptions::new().lock_mode(LockMode::PessimisticWrite),
                )
                .await,
        );
        assert!(found[0].as_ref().is_some_and(|c| c.ptr_eq(&ada)));

        let statements = conn.executed();
        assert_eq!(statements.len(), 2);
        assert!(statements[1].sql.contains(" for update"), "{}", statements[1].sql);
        let key = session.entity_key("Customer", 1).expect("customer key");
        let entry = session
            .persistence_context()
            .get_entry(&key)
            .expect("customer entry");
        assert_eq!(entry.lock_mode, LockMode::PessimisticWrite);
    });
}
