//! Shared (second-level) entity cache.
//!
//! Entities are cached per region in disassembled form: basic values are
//! kept as-is, to-one associations as `(root entity, id)` references and
//! collections as placeholders that are re-created uninitialized on
//! assembly. Immutable entities may instead be cached by reference when
//! [`LoaderSettings::direct_reference_entries`](crate::LoaderSettings) is on.

use std::collections::HashMap;

use graphload_core::{EntityPersister, Error, Identifier, Result, Value};
use serde::{Deserialize, Serialize};

use crate::entity::{EntityRef, PropertyValue};

/// One property in cache form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DisassembledValue {
    Unfetched,
    Basic(Value),
    /// Root entity name and identifier of the target, or `None` for null.
    Entity(Option<(String, Identifier)>),
    Collection,
}

/// Disassemble a resolved property array.
///
/// Must not be called while holding a lock on an instance the state refers
/// to, since association targets are read-locked to obtain their keys.
pub fn disassemble(state: &[PropertyValue]) -> Vec<DisassembledValue> {
    state
        .iter()
        .map(|value| match value {
            PropertyValue::Unfetched => DisassembledValue::Unfetched,
            PropertyValue::Basic(v) => DisassembledValue::Basic(v.clone()),
            PropertyValue::Entity(None) => DisassembledValue::Entity(None),
            PropertyValue::Entity(Some(target)) => {
                let target = target.read();
                DisassembledValue::Entity(Some((
                    target.persister.root_entity_name.clone(),
                    target.id.clone(),
                )))
            }
            PropertyValue::Collection(_) | PropertyValue::Array(_) => DisassembledValue::Collection,
        })
        .collect()
}

/// Cache form of an entity's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardCacheEntry {
    /// Concrete entity name.
    pub subclass: String,
    pub version: Option<Value>,
    pub state: Vec<DisassembledValue>,
}

impl StandardCacheEntry {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serde(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serde(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub enum CacheEntry {
    Standard(StandardCacheEntry),
    /// The managed instance itself, for immutable entities.
    Reference(EntityRef),
}

impl CacheEntry {
    pub fn version(&self) -> Option<Value> {
        match self {
            CacheEntry::Standard(entry) => entry.version.clone(),
            CacheEntry::Reference(instance) => instance.read().version().cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub entity: String,
    pub id: Identifier,
    pub tenant: Option<String>,
}

/// Region-partitioned entity cache shared by all sessions of a factory.
#[derive(Debug, Default)]
pub struct SecondLevelCache {
    regions: HashMap<String, HashMap<CacheKey, CacheEntry>>,
}

impl SecondLevelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate_cache_key(
        persister: &EntityPersister,
        id: &Identifier,
        tenant: Option<&str>,
    ) -> CacheKey {
        CacheKey {
            entity: persister.root_entity_name.clone(),
            id: id.clone(),
            tenant: tenant.map(str::to_string),
        }
    }

    pub fn get(&self, region: &str, key: &CacheKey) -> Option<CacheEntry> {
        self.regions.get(region)?.get(key).cloned()
    }

    /// Store an entry; returns whether the region changed.
    ///
    /// With `minimal_puts` an existing entry is never overwritten. An entry
    /// carrying the same version as the cached one is skipped either way.
    pub fn put(&mut self, region: &str, key: CacheKey, entry: CacheEntry, minimal_puts: bool) -> bool {
        let region = self.regions.entry(region.to_string()).or_default();
        if let Some(existing) = region.get(&key) {
            if minimal_puts {
                return false;
            }
            if let (Some(old), Some(new)) = (existing.version(), entry.version()) {
                if old.same_identity(&new) {
                    return false;
                }
            }
        }
        region.insert(key, entry);
        true
    }

    pub fn contains(&self, region: &str, key: &CacheKey) -> bool {
        self.regions.get(region).is_some_and(|r| r.contains_key(key))
    }

    pub fn evict(&mut self, region: &str, key: &CacheKey) -> bool {
        self.regions
            .get_mut(region)
            .is_some_and(|r| r.remove(key).is_some())
    }

    pub fn evict_region(&mut self, region: &str) {
        self.regions.remove(region);
    }

    pub fn region_size(&self, region: &str) -> usize {
        self.regions.get(region).map_or(0, HashMap::len)
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persister() -> EntityPersister {
        EntityPersister::builder("Country", "countries")
            .id("code", "code")
            .basic("name", "name")
            .version("version", "version")
            .cacheable("reference")
            .build()
    }

    fn entry(version: i64) -> CacheEntry {
        CacheEntry::Standard(StandardCacheEntry {
            subclass: "Country".into(),
            version: Some(Value::BigInt(version)),
            state: vec![
                DisassembledValue::Basic(Value::from("Norway")),
                DisassembledValue::Basic(Value::BigInt(version)),
            ],
        })
    }

    #[test]
    fn put_and_get_by_generated_key() {
        let p = persister();
        let mut cache = SecondLevelCache::new();
        let key = SecondLevelCache::generate_cache_key(&p, &Identifier::from("NO"), None);
        assert!(cache.put("reference", key.clone(), entry(1), false));
        assert!(matches!(cache.get("reference", &key), Some(CacheEntry::Standard(_))));
        assert!(cache.get("other", &key).is_none());
        let tenant_key = SecondLevelCache::generate_cache_key(&p, &Identifier::from("NO"), Some("t1"));
        assert!(cache.get("reference", &tenant_key).is_none());
    }

    #[test]
    fn minimal_puts_and_same_version_skip() {
        let p = persister();
        let mut cache = SecondLevelCache::new();
        let key = SecondLevelCache::generate_cache_key(&p, &Identifier::from("NO"), None);
        cache.put("reference", key.clone(), entry(1), false);
        assert!(!cache.put("reference", key.clone(), entry(2), true));
        assert!(!cache.put("reference", key.clone(), entry(1), false));
        assert!(cache.put("reference", key.clone(), entry(2), false));
        assert_eq!(cache.region_size("reference"), 1);
        assert!(cache.evict("reference", &key));
        assert!(!cache.contains("reference", &key));
    }

    #[test]
    fn standard_entries_serialize() {
        let CacheEntry::Standard(standard) = entry(4) else {
            unreachable!()
        };
        let json = standard.to_json().unwrap();
        assert_eq!(StandardCacheEntry::from_json(&json).unwrap(), standard);
    }
}
