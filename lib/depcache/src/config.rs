//! Content-addressed configuration identities.
//!
//! A table configuration is any `Serialize` value. Its canonical form is the
//! compact JSON rendering with every object's keys sorted, so two values that
//! serialize to the same fields map to the same hash regardless of field order
//! or identity. The [`ConfigRegistry`] assigns each distinct hash a small
//! integer rowid, stored in the shared `config` table.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value as Json};
use tracing::debug;

use crate::column::ScalarType;
use crate::store::{ColumnDef, RowStore, TableSchema};
use crate::{DepcacheError, RowId, Value};

pub const CONFIG_TABLE: &str = "config";
pub const CONFIG_ROWID: &str = "config_rowid";
pub const CONFIG_HASHID: &str = "config_hashid";

/// Length of the hex digest kept as a config's hash id.
const HASHID_LEN: usize = 32;

/// Render `config` in canonical form.
pub fn canonicalize<T: Serialize + ?Sized>(config: &T) -> Result<String, DepcacheError> {
    let json = serde_json::to_value(config)
        .map_err(|e| DepcacheError::ConfigEncoding(e.to_string()))?;
    let canonical = sort_keys(json)?;
    serde_json::to_string(&canonical).map_err(|e| DepcacheError::ConfigEncoding(e.to_string()))
}

fn sort_keys(json: Json) -> Result<Json, DepcacheError> {
    Ok(match json {
        Json::Object(map) => {
            let mut entries: Vec<(String, Json)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::with_capacity(entries.len());
            for (key, value) in entries {
                sorted.insert(key, sort_keys(value)?);
            }
            Json::Object(sorted)
        }
        Json::Array(items) => Json::Array(
            items
                .into_iter()
                .map(sort_keys)
                .collect::<Result<_, _>>()?,
        ),
        other => other,
    })
}

/// Compute the hash id of a canonical config string.
///
/// Blake3-256, hex encoded and truncated to 128 bits.
pub fn compute_hashid(canonical: &str) -> String {
    let hash = blake3::hash(canonical.as_bytes());
    let mut hex = hash.to_hex().to_string();
    hex.truncate(HASHID_LEN);
    hex
}

/// A canonicalized table configuration.
///
/// Compute functions read parameters from [`TableConfig::value`]; the engine
/// keys rows by [`TableConfig::hashid`].
#[derive(Debug, Clone, PartialEq)]
pub struct TableConfig {
    value: Json,
    canonical: String,
    hashid: String,
}

impl TableConfig {
    pub fn new<T: Serialize + ?Sized>(config: &T) -> Result<Self, DepcacheError> {
        let canonical = canonicalize(config)?;
        let value = serde_json::from_str(&canonical)
            .map_err(|e| DepcacheError::ConfigEncoding(e.to_string()))?;
        let hashid = compute_hashid(&canonical);
        Ok(Self {
            value,
            canonical,
            hashid,
        })
    }

    /// The config with no parameters (`{}`).
    pub fn empty() -> Self {
        let canonical = "{}".to_string();
        Self {
            value: Json::Object(Map::new()),
            hashid: compute_hashid(&canonical),
            canonical,
        }
    }

    pub fn value(&self) -> &Json {
        &self.value
    }

    /// Look up a top-level parameter.
    pub fn get(&self, key: &str) -> Option<&Json> {
        self.value.get(key)
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn hashid(&self) -> &str {
        &self.hashid
    }
}

/// A config as known to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigKey {
    pub rowid: RowId,
    pub hashid: String,
}

/// Shared registry mapping config hashes to config rowids.
///
/// One registry serves every cache table of a store; hand it to tables as an
/// `Arc`. Lookups are memoized in-process since entries are never removed.
pub struct ConfigRegistry {
    store: Arc<dyn RowStore>,
    by_hash: RwLock<HashMap<String, RowId>>,
}

impl ConfigRegistry {
    /// Open the registry, creating the config table if needed.
    pub async fn open(store: Arc<dyn RowStore>) -> Result<Self, DepcacheError> {
        let exists = store
            .has_table(CONFIG_TABLE)
            .await
            .map_err(|e| DepcacheError::store(CONFIG_TABLE, "has_table", e))?;
        if !exists {
            store
                .add_table(&Self::schema())
                .await
                .map_err(|e| DepcacheError::store(CONFIG_TABLE, "add_table", e))?;
        }
        Ok(Self {
            store,
            by_hash: RwLock::new(HashMap::new()),
        })
    }

    pub fn schema() -> TableSchema {
        TableSchema {
            name: CONFIG_TABLE.to_string(),
            columns: vec![ColumnDef::new(CONFIG_HASHID, ScalarType::Text).not_null()],
            superkey: vec![CONFIG_HASHID.to_string()],
            depends_on: Vec::new(),
            docstr: "table for algo configurations".to_string(),
        }
    }

    /// Return the rowid for `config`, adding it if this hash is new.
    pub async fn intern(&self, config: &TableConfig) -> Result<ConfigKey, DepcacheError> {
        let hashid = config.hashid();
        if let Some(rowid) = self.by_hash.read().get(hashid).copied() {
            return Ok(ConfigKey {
                rowid,
                hashid: hashid.to_string(),
            });
        }

        let columns = [CONFIG_HASHID.to_string()];
        let rowid = self
            .store
            .insert_unique(
                CONFIG_TABLE,
                &columns,
                vec![Value::String(hashid.to_string())],
                &columns,
            )
            .await
            .map_err(|e| DepcacheError::store(CONFIG_TABLE, "intern", e))?;
        debug!(config = config.canonical(), hashid, rowid, "interned config");

        self.by_hash.write().insert(hashid.to_string(), rowid);
        Ok(ConfigKey {
            rowid,
            hashid: hashid.to_string(),
        })
    }

    /// Hash ids of the given config rowids (`None` for unknown rowids).
    pub async fn hashid_of(&self, rowids: &[RowId]) -> Result<Vec<Option<String>>, DepcacheError> {
        let rows = self
            .store
            .get_by_id(CONFIG_TABLE, &[CONFIG_HASHID.to_string()], rowids)
            .await
            .map_err(|e| DepcacheError::store(CONFIG_TABLE, "hashid_of", e))?;
        Ok(rows
            .into_iter()
            .map(|row| {
                row.and_then(|mut values| match values.pop() {
                    Some(Value::String(hashid)) => Some(hashid),
                    _ => None,
                })
            })
            .collect())
    }

    /// Config rowids of the given hash ids (`None` for unknown hashes).
    pub async fn rowid_of(&self, hashids: &[&str]) -> Result<Vec<Option<RowId>>, DepcacheError> {
        let params: Vec<Vec<Value>> = hashids.iter().map(|h| vec![Value::from(*h)]).collect();
        let rows = self
            .store
            .get_where(
                CONFIG_TABLE,
                &[CONFIG_ROWID.to_string()],
                &params,
                &[CONFIG_HASHID.to_string()],
            )
            .await
            .map_err(|e| DepcacheError::store(CONFIG_TABLE, "rowid_of", e))?;
        Ok(rows
            .into_iter()
            .map(|row| row.and_then(|values| values.first().and_then(Value::as_int)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::MemoryStore;

    #[derive(Serialize)]
    struct ThumbConfig {
        thumbsize: u32,
        draw_annots: bool,
    }

    #[derive(Serialize)]
    struct ThumbConfigReordered {
        draw_annots: bool,
        thumbsize: u32,
    }

    #[test]
    fn test_canonical_form_sorts_keys() {
        let a = canonicalize(&json!({"b": 1, "a": {"d": [1, {"z": 0, "y": 1}], "c": null}}))
            .unwrap();
        assert_eq!(a, r#"{"a":{"c":null,"d":[1,{"y":1,"z":0}]},"b":1}"#);
    }

    #[test]
    fn test_equal_fields_give_equal_hash() {
        let a = TableConfig::new(&ThumbConfig {
            thumbsize: 221,
            draw_annots: false,
        })
        .unwrap();
        let b = TableConfig::new(&ThumbConfigReordered {
            draw_annots: false,
            thumbsize: 221,
        })
        .unwrap();
        let c = TableConfig::new(&json!({"thumbsize": 221, "draw_annots": false})).unwrap();
        assert_eq!(a.hashid(), b.hashid());
        assert_eq!(a.hashid(), c.hashid());
        assert_eq!(a.hashid().len(), 32);

        let d = TableConfig::new(&json!({"thumbsize": 222, "draw_annots": false})).unwrap();
        assert_ne!(a.hashid(), d.hashid());
    }

    #[test]
    fn test_non_string_keys_rejected() {
        let mut map = BTreeMap::new();
        map.insert((1, 2), "pair");
        let err = TableConfig::new(&map).unwrap_err();
        assert!(matches!(err, DepcacheError::ConfigEncoding(_)));
    }

    #[test]
    fn test_empty_config() {
        let empty = TableConfig::empty();
        assert_eq!(empty.hashid(), TableConfig::new(&json!({})).unwrap().hashid());
    }

    #[tokio::test]
    async fn test_intern_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let registry = ConfigRegistry::open(store.clone()).await.unwrap();
        let a = registry
            .intern(&TableConfig::new(&json!({"thumbsize": 221})).unwrap())
            .await
            .unwrap();
        let b = registry
            .intern(&TableConfig::new(&json!({"thumbsize": 221})).unwrap())
            .await
            .unwrap();
        let c = registry
            .intern(&TableConfig::new(&json!({"thumbsize": 128})).unwrap())
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a.rowid, c.rowid);
        assert_eq!(store.row_count(CONFIG_TABLE), 2);

        // A second registry over the same store sees the same ids.
        let other = ConfigRegistry::open(store.clone()).await.unwrap();
        let again = other
            .intern(&TableConfig::new(&json!({"thumbsize": 221})).unwrap())
            .await
            .unwrap();
        assert_eq!(again, a);
    }

    #[tokio::test]
    async fn test_lookup_both_directions() {
        let store = Arc::new(MemoryStore::new());
        let registry = ConfigRegistry::open(store).await.unwrap();
        let key = registry.intern(&TableConfig::empty()).await.unwrap();

        let hashids = registry.hashid_of(&[key.rowid, 99]).await.unwrap();
        assert_eq!(hashids, vec![Some(key.hashid.clone()), None]);

        let rowids = registry.rowid_of(&[&key.hashid, "missing"]).await.unwrap();
        assert_eq!(rowids, vec![Some(key.rowid), None]);
    }
}
