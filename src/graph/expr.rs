//! Attribute expressions.
//!
//! An attribute value is either a literal or a whole-value reference of the
//! form `${<type>.<name>.<attribute>}`. References may sit anywhere inside
//! lists and maps. There is no string interpolation.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::is_valid_identifier;
use crate::provider::Attributes;

/// A reference to another resource's attribute.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reference {
    /// Address of the referenced resource (`type.name`).
    pub resource: String,
    /// Attribute path on the referenced resource; nested keys are dot separated.
    pub attribute: String,
}

impl Reference {
    /// Parses `type.name.attribute[.key...]`.
    fn parse(inner: &str) -> Result<Self, String> {
        let mut parts = inner.splitn(3, '.');
        let (Some(ty), Some(name), Some(attribute)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(format!(
                "reference '${{{inner}}}' must have the form type.name.attribute"
            ));
        };

        if !is_valid_identifier(ty) || !is_valid_identifier(name) {
            return Err(format!("reference '${{{inner}}}' names an invalid resource"));
        }
        if attribute.split('.').any(str::is_empty) {
            return Err(format!("reference '${{{inner}}}' has an empty attribute key"));
        }

        Ok(Self {
            resource: format!("{ty}.{name}"),
            attribute: attribute.to_string(),
        })
    }

    /// Returns the top-level attribute key.
    #[must_use]
    pub fn root_attribute(&self) -> &str {
        self.attribute
            .split_once('.')
            .map_or(self.attribute.as_str(), |(root, _)| root)
    }

    /// Looks the attribute path up in concrete attributes.
    ///
    /// `id` resolves to the provider identifier unless the attributes carry
    /// their own `id`.
    #[must_use]
    pub fn lookup(&self, provider_id: Option<&str>, attributes: &Attributes) -> Option<Value> {
        let mut keys = self.attribute.split('.');
        let root = keys.next()?;

        let mut current = match attributes.get(root) {
            Some(value) => value.clone(),
            None if root == "id" => Value::String(provider_id?.to_string()),
            None => return None,
        };

        for key in keys {
            current = match current {
                Value::Object(mut map) => map.remove(key)?,
                Value::Array(mut items) => {
                    let index: usize = key.parse().ok()?;
                    if index >= items.len() {
                        return None;
                    }
                    items.swap_remove(index)
                }
                _ => return None,
            };
        }

        Some(current)
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${{{}.{}}}", self.resource, self.attribute)
    }
}

/// A value that may not be known until apply time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// The concrete value.
    Known(Value),
    /// The value depends on something not yet applied.
    Unknown,
}

/// An attribute expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// A literal value without references.
    Literal(Value),
    /// A whole-value reference.
    Reference(Reference),
    /// A list containing at least one reference.
    List(Vec<Expr>),
    /// A map containing at least one reference.
    Map(BTreeMap<String, Expr>),
}

impl Expr {
    /// Parses a configuration value.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if a string looks like a
    /// reference but is malformed, or uses interpolation.
    pub fn parse(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(s) => Self::parse_string(s),
            Value::Array(items) => {
                let parsed = items.iter().map(Self::parse).collect::<Result<Vec<_>, _>>()?;
                if parsed.iter().all(|e| matches!(e, Self::Literal(_))) {
                    Ok(Self::Literal(value.clone()))
                } else {
                    Ok(Self::List(parsed))
                }
            }
            Value::Object(map) => {
                let parsed = map
                    .iter()
                    .map(|(k, v)| Self::parse(v).map(|e| (k.clone(), e)))
                    .collect::<Result<BTreeMap<_, _>, _>>()?;
                if parsed.values().all(|e| matches!(e, Self::Literal(_))) {
                    Ok(Self::Literal(value.clone()))
                } else {
                    Ok(Self::Map(parsed))
                }
            }
            _ => Ok(Self::Literal(value.clone())),
        }
    }

    fn parse_string(s: &str) -> Result<Self, String> {
        if let Some(inner) = s.strip_prefix("${").and_then(|r| r.strip_suffix('}'))
            && !inner.contains("${")
            && !inner.contains('}')
        {
            return Reference::parse(inner).map(Self::Reference);
        }

        if s.contains("${") {
            return Err(format!(
                "'{s}' embeds a reference; only whole-value references are supported"
            ));
        }

        Ok(Self::Literal(Value::String(s.to_string())))
    }

    /// Returns every reference in the expression, in document order.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(reference) => out.push(reference),
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(map) => {
                for item in map.values() {
                    item.collect_references(out);
                }
            }
        }
    }

    /// Resolves the expression; any unknown reference makes the whole value unknown.
    pub fn resolve<F>(&self, lookup: &F) -> Resolved
    where
        F: Fn(&Reference) -> Resolved,
    {
        match self {
            Self::Literal(value) => Resolved::Known(value.clone()),
            Self::Reference(reference) => lookup(reference),
            Self::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match item.resolve(lookup) {
                        Resolved::Known(value) => values.push(value),
                        Resolved::Unknown => return Resolved::Unknown,
                    }
                }
                Resolved::Known(Value::Array(values))
            }
            Self::Map(map) => {
                let mut values = serde_json::Map::new();
                for (key, item) in map {
                    match item.resolve(lookup) {
                        Resolved::Known(value) => {
                            values.insert(key.clone(), value);
                        }
                        Resolved::Unknown => return Resolved::Unknown,
                    }
                }
                Resolved::Known(Value::Object(values))
            }
        }
    }
}
