//! Keys identifying managed entities and collections.

use std::fmt;

use graphload_core::{Identifier, MappingMetamodel, Result};

/// Uniquely identifies an entity instance within a persistence context.
///
/// The entity part is always the hierarchy's root entity name, so a
/// subclass instance and a superclass reference to the same row share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub entity: String,
    pub id: Identifier,
    pub tenant: Option<String>,
}

impl EntityKey {
    /// Build a key from an already-resolved root entity name.
    pub fn new(root_entity: impl Into<String>, id: Identifier) -> Self {
        Self {
            entity: root_entity.into(),
            id,
            tenant: None,
        }
    }

    /// Build a key for any entity of a hierarchy, normalizing to its root.
    pub fn for_entity(metamodel: &MappingMetamodel, entity: &str, id: Identifier) -> Result<Self> {
        let persister = metamodel.entity(entity)?;
        Ok(Self::new(persister.root_entity_name.clone(), id))
    }

    #[must_use]
    pub fn with_tenant(mut self, tenant: Option<String>) -> Self {
        self.tenant = tenant;
        self
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

/// Identifies a collection by role and owner key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    pub role: String,
    pub key: Identifier,
    pub tenant: Option<String>,
}

impl CollectionKey {
    pub fn new(role: impl Into<String>, key: Identifier) -> Self {
        Self {
            role: role.into(),
            key,
            tenant: None,
        }
    }

    #[must_use]
    pub fn with_tenant(mut self, tenant: Option<String>) -> Self {
        self.tenant = tenant;
        self
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.role, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphload_core::{EntityPersister, Value};
    use std::collections::HashSet;

    #[test]
    fn subclass_keys_normalize_to_root() {
        let mm = MappingMetamodel::builder()
            .entity(
                EntityPersister::builder("Payment", "payments")
                    .id("id", "id")
                    .discriminator("kind", "P")
                    .build(),
            )
            .entity(
                EntityPersister::subclass("CardPayment", "Payment")
                    .discriminator_value("C")
                    .build(),
            )
            .build()
            .unwrap();
        let a = EntityKey::for_entity(&mm, "CardPayment", Identifier::from(Value::Int(7))).unwrap();
        let b = EntityKey::for_entity(&mm, "Payment", Identifier::from(Value::BigInt(7))).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "Payment#7");
    }

    #[test]
    fn tenant_separates_keys() {
        let base = EntityKey::new("Customer", Identifier::from(Value::Int(1)));
        let tenant = base.clone().with_tenant(Some("acme".into()));
        let set: HashSet<_> = [base, tenant].into_iter().collect();
        assert_eq!(set.len(), 2);
    }
}
