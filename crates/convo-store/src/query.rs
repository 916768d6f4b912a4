use convo_shared::{Key, Kind};

use crate::entity::Entity;

/// Equality query over the property index. Results come back in ascending ID
/// order; callers sort by anything else themselves.
#[derive(Debug, Clone)]
pub struct Query {
    pub(crate) kind: Kind,
    pub(crate) filters: Vec<(String, String)>,
    pub(crate) limit: Option<usize>,
}

impl Query {
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            filters: Vec::new(),
            limit: None,
        }
    }

    pub fn of<E: Entity>() -> Self {
        Self::new(E::KIND)
    }

    pub fn filter(mut self, property: &str, value: impl Into<String>) -> Self {
        self.filters.push((property.to_string(), value.into()));
        self
    }

    pub fn filter_key(self, property: &str, key: Key) -> Self {
        self.filter(property, key.encode())
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }
}
