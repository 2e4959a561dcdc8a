use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

pub const DEFAULT_REQUIRED_FIELDS: &[&str] =
    &["product_name", "price", "dimensions", "weight", "material"];

/// Ordered, duplicate-free list of the fields every correspondent must fill.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct FieldSchema {
    fields: Vec<String>,
}

impl FieldSchema {
    pub fn new<I, S>(fields: I) -> Result<Self, DomainError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = BTreeSet::new();
        let mut ordered = Vec::new();

        for field in fields {
            let field = field.into().trim().to_string();
            if field.is_empty() {
                return Err(DomainError::InvalidSchema("field names must not be blank".to_string()));
            }
            if !seen.insert(field.clone()) {
                return Err(DomainError::InvalidSchema(format!("duplicate field `{field}`")));
            }
            ordered.push(field);
        }

        if ordered.is_empty() {
            return Err(DomainError::InvalidSchema(
                "at least one required field must be configured".to_string(),
            ));
        }

        Ok(Self { fields: ordered })
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.iter().any(|candidate| candidate == field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Default for FieldSchema {
    fn default() -> Self {
        Self { fields: DEFAULT_REQUIRED_FIELDS.iter().map(|field| field.to_string()).collect() }
    }
}

impl TryFrom<Vec<String>> for FieldSchema {
    type Error = DomainError;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FieldSchema> for Vec<String> {
    fn from(value: FieldSchema) -> Self {
        value.fields
    }
}
