use convo_shared::{Key, Kind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

/// A document the store can persist.
///
/// The key is not part of the stored body: the store sets it after loading
/// and after allocating an ID for a new entity.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: Kind;

    fn key(&self) -> Option<Key>;

    fn set_key(&mut self, key: Key);

    /// Queryable properties. Multi-valued properties repeat the name.
    fn index(&self) -> Vec<(&'static str, String)>;
}

/// Best-effort decode for fields whose stored shape changed over time: a
/// value that no longer matches the field's type loads as the default instead
/// of failing the whole document.
pub fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match serde_json::from_value(value) {
        Ok(parsed) => Ok(parsed),
        Err(e) => {
            tracing::debug!(error = %e, "skipping mismatched legacy field");
            Ok(T::default())
        }
    }
}

pub(crate) fn index_keys<'a>(
    property: &'static str,
    keys: &'a [Key],
) -> impl Iterator<Item = (&'static str, String)> + 'a {
    keys.iter().map(move |k| (property, k.encode()))
}
