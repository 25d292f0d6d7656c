#![allow(dead_code)]

use graphload::testing::{Record, record};
use graphload::{
    CollectionPersister, EntityPersister, Error, FetchStrategy, FetchStyle, FetchTiming,
    LoadEngine, LoaderSettings, MappingMetamodel, Outcome, SessionFactory, Value,
};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

/// Customers with joined orders, a cached product catalogue, authors whose
/// books are fetched by subselect, parts with lazily batched suppliers,
/// accounts with an optional one-to-one and a single-table animal
/// hierarchy.
pub fn shop() -> MappingMetamodel {
    MappingMetamodel::builder()
        .entity(
            EntityPersister::builder("Customer", "customers")
                .id("id", "id")
                .basic("name", "name")
                .version("version", "version")
                .collection("orders", "Customer.orders")
                .filter("active", None)
                .build(),
        )
        .entity(
            EntityPersister::builder("Order", "orders")
                .id("id", "id")
                .basic("total", "total")
                .many_to_one("customer", "Customer", "customer_id", FetchStrategy::JOIN)
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
        .filter("active", "{alias}.active = :flag", &["flag"])
        .entity(
            EntityPersister::builder("Product", "products")
                .id("id", "id")
                .basic("sku", "sku")
                .basic("title", "title")
                .natural_id(&["sku"])
                .cacheable("products")
                .build(),
        )
        .entity(
            EntityPersister::builder("Author", "authors")
                .id("id", "id")
                .basic("name", "name")
                .collection("books", "Author.books")
                .build(),
        )
        .entity(
            EntityPersister::builder("Book", "books")
                .id("id", "id")
                .basic("title", "title")
                .build(),
        )
        .collection(
            CollectionPersister::one_to_many(
                "Author.books",
                "Author",
                "Book",
                "books",
                vec!["author_id".into()],
            )
            .fetch(FetchStrategy::new(FetchTiming::Delayed, FetchStyle::Subselect))
            .build(),
        )
        .entity(
            EntityPersister::builder("Part", "parts")
                .id("id", "id")
                .basic("name", "name")
                .many_to_one("supplier", "Supplier", "supplier_id", FetchStrategy::LAZY_SELECT)
                .build(),
        )
        .entity(
            EntityPersister::builder("Supplier", "suppliers")
                .id("id", "id")
                .basic("name", "name")
                .batch_size(3)
                .build(),
        )
        .entity(
            EntityPersister::builder("Account", "accounts")
                .id("id", "id")
                .basic("login", "login")
                .one_to_one("settings", "Settings", false, FetchStrategy::LAZY_SELECT)
                .build(),
        )
        .entity(
            EntityPersister::builder("Settings", "account_settings")
                .id("id", "id")
                .basic("theme", "theme")
                .build(),
        )
        .entity(
            EntityPersister::builder("Animal", "animals")
                .id("id", "id")
                .basic("name", "name")
                .discriminator("kind", "animal")
                .build(),
        )
        .entity(
            EntityPersister::subclass("Dog", "Animal")
                .discriminator_value("dog")
                .basic("breed", "breed")
                .build(),
        )
        .entity(
            EntityPersister::subclass("Cat", "Animal")
                .discriminator_value("cat")
                .basic("lives", "lives")
                .build(),
        )
        .build()
        .expect("shop metamodel")
}

pub fn engine(settings: LoaderSettings) -> LoadEngine {
    LoadEngine::new(SessionFactory::new(shop(), settings).expect("session factory"))
}

pub fn customer(id: i32, name: &str, version: i32) -> Record {
    record([
        ("customers.id", Value::from(id)),
        ("customers.name", Value::from(name)),
        ("customers.version", Value::from(version)),
    ])
}

/// A customer row joined to one of its orders.
pub fn customer_with_order(id: i32, name: &str, order_id: i32, total: i32) -> Record {
    customer(id, name, 1)
        .set("orders.id", order_id)
        .set("orders.total", total)
        .set("orders.customer_id", id)
}

pub fn product(id: i32, sku: &str, title: &str) -> Record {
    record([
        ("products.id", Value::from(id)),
        ("products.sku", Value::from(sku)),
        ("products.title", Value::from(title)),
    ])
}

pub fn author(id: i32, name: &str) -> Record {
    record([
        ("authors.id", Value::from(id)),
        ("authors.name", Value::from(name)),
    ])
}

pub fn book(id: i32, author_id: i32, title: &str) -> Record {
    record([
        ("books.id", Value::from(id)),
        ("books.author_id", Value::from(author_id)),
        ("books.title", Value::from(title)),
    ])
}

pub fn part(id: i32, supplier_id: i32) -> Record {
    record([
        ("parts.id", Value::from(id)),
        ("parts.name", Value::from(format!("part-{id}"))),
        ("parts.supplier_id", Value::from(supplier_id)),
    ])
}

pub fn supplier(id: i32) -> Record {
    record([
        ("suppliers.id", Value::from(id)),
        ("suppliers.name", Value::from(format!("supplier-{id}"))),
    ])
}

pub fn ids(values: &[i32]) -> Vec<graphload::Identifier> {
    values.iter().copied().map(graphload::Identifier::from).collect()
}
