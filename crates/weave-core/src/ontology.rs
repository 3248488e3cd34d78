//! Entity label schemas and the runtime registry for custom labels.
//!
//! The built-in labels are statically declared; callers may register
//! additional labels at startup. Everything the LLM returns is validated
//! against these schemas before it reaches the graph.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{Result, WeaveError};

/// The value shape an attribute is allowed to take.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttrKind {
    Text,
    Number,
    Bool,
    Timestamp,
}

impl AttrKind {
    /// Coerce a string produced by the extraction pass into a typed
    /// JSON value, or reject it.
    pub fn coerce(self, raw: &str) -> Option<Value> {
        match self {
            AttrKind::Text => Some(Value::String(raw.to_string())),
            AttrKind::Number => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            AttrKind::Bool => match raw.trim().to_lowercase().as_str() {
                "true" | "yes" => Some(Value::Bool(true)),
                "false" | "no" => Some(Value::Bool(false)),
                _ => None,
            },
            AttrKind::Timestamp => chrono::DateTime::parse_from_rfc3339(raw.trim())
                .ok()
                .map(|t| Value::String(t.to_rfc3339())),
        }
    }

    /// Check an already-typed value against this kind.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            AttrKind::Text => value.is_string(),
            AttrKind::Number => value.is_number(),
            AttrKind::Bool => value.is_boolean(),
            AttrKind::Timestamp => value
                .as_str()
                .map(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
                .unwrap_or(false),
        }
    }
}

/// One attribute slot of a label schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeSpec {
    pub name: String,
    pub kind: AttrKind,
    pub description: String,
}

/// The fixed attribute record for one entity label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelSchema {
    pub name: String,
    pub description: String,
    pub attributes: Vec<AttributeSpec>,
}

impl LabelSchema {
    pub fn new(name: &str, description: &str) -> Self {
        LabelSchema {
            name: name.to_string(),
            description: description.to_string(),
            attributes: Vec::new(),
        }
    }

    pub fn attr(mut self, name: &str, kind: AttrKind, description: &str) -> Self {
        self.attributes.push(AttributeSpec {
            name: name.to_string(),
            kind,
            description: description.to_string(),
        });
        self
    }

    fn spec(&self, name: &str) -> Option<&AttributeSpec> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// The full set of labels the extraction pass may emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ontology {
    labels: HashMap<String, LabelSchema>,
}

impl Ontology {
    /// The labels shipped with Weave. Callers extend this set with
    /// `register` for domain-specific labels.
    pub fn builtin() -> Self {
        let mut ontology = Ontology {
            labels: HashMap::new(),
        };
        let defaults = [
            LabelSchema::new("Person", "A human individual")
                .attr("role", AttrKind::Text, "Current role or title")
                .attr("location", AttrKind::Text, "Where the person is based"),
            LabelSchema::new("Organization", "A company, team, or institution")
                .attr("industry", AttrKind::Text, "Primary industry or domain")
                .attr("location", AttrKind::Text, "Headquarters or main location"),
            LabelSchema::new("Location", "A physical or geographic place"),
            LabelSchema::new("Event", "Something that happened at a point in time")
                .attr("occurred_at", AttrKind::Timestamp, "When the event happened"),
            LabelSchema::new("Document", "A document, article, or written artifact")
                .attr("url", AttrKind::Text, "Canonical URL if known"),
            LabelSchema::new("Product", "A product, service, or system")
                .attr("version", AttrKind::Text, "Version identifier if relevant"),
            LabelSchema::new("Topic", "An abstract subject or concept"),
        ];
        for schema in defaults {
            ontology.labels.insert(schema.name.clone(), schema);
        }
        ontology
    }

    /// Register a custom label. Rejects collisions with existing labels.
    pub fn register(&mut self, schema: LabelSchema) -> Result<()> {
        if schema.name.trim().is_empty() {
            return Err(WeaveError::Validation(
                "Label name must not be empty".to_string(),
            ));
        }
        if self.labels.contains_key(&schema.name) {
            return Err(WeaveError::Validation(format!(
                "Label '{}' is already registered",
                schema.name
            )));
        }
        self.labels.insert(schema.name.clone(), schema);
        Ok(())
    }

    pub fn contains(&self, label: &str) -> bool {
        self.labels.contains_key(label)
    }

    pub fn schema(&self, label: &str) -> Option<&LabelSchema> {
        self.labels.get(label)
    }

    pub fn label_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.labels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Validate and coerce a raw attribute list from the extraction
    /// pass into the typed bag stored on the entity. Unknown attribute
    /// names and uncoercible values are dropped; one bad attribute
    /// never discards the entity.
    pub fn coerce_attributes(
        &self,
        label: &str,
        raw: &[(String, String)],
    ) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        let Some(schema) = self.labels.get(label) else {
            return out;
        };
        for (name, value) in raw {
            if let Some(spec) = schema.spec(name) {
                if let Some(typed) = spec.kind.coerce(value) {
                    out.insert(name.clone(), typed);
                }
            }
        }
        out
    }

    /// Check a stored attribute bag against a label schema. Used at the
    /// store boundary when mutations supply attributes directly.
    pub fn validate_attributes(&self, label: &str, attrs: &HashMap<String, Value>) -> Result<()> {
        let Some(schema) = self.labels.get(label) else {
            return Err(WeaveError::Validation(format!("Unknown label '{}'", label)));
        };
        for (name, value) in attrs {
            match schema.spec(name) {
                Some(spec) if spec.kind.accepts(value) => {}
                Some(spec) => {
                    return Err(WeaveError::Validation(format!(
                        "Attribute '{}' of label '{}' must be {:?}",
                        name, label, spec.kind
                    )));
                }
                None => {
                    return Err(WeaveError::Validation(format!(
                        "Label '{}' has no attribute '{}'",
                        label, name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Render the ontology for the extraction prompt.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for name in self.label_names() {
            let schema = &self.labels[name];
            out.push_str(&format!("- {}: {}", schema.name, schema.description));
            if !schema.attributes.is_empty() {
                let attrs: Vec<String> = schema
                    .attributes
                    .iter()
                    .map(|a| format!("{} ({:?})", a.name, a.kind))
                    .collect();
                out.push_str(&format!(" (attributes: {})", attrs.join(", ")));
            }
            out.push('\n');
        }
        out
    }
}

impl Default for Ontology {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_labels_present() {
        let ontology = Ontology::builtin();
        assert!(ontology.contains("Person"));
        assert!(ontology.contains("Organization"));
        assert!(!ontology.contains("Spaceship"));
    }

    #[test]
    fn register_rejects_duplicates() {
        let mut ontology = Ontology::builtin();
        assert!(ontology
            .register(LabelSchema::new("Service", "A running service"))
            .is_ok());
        assert!(ontology
            .register(LabelSchema::new("Service", "Again"))
            .is_err());
    }

    #[test]
    fn coerce_drops_unknown_and_mistyped() {
        let ontology = Ontology::builtin();
        let raw = vec![
            ("role".to_string(), "engineer".to_string()),
            ("shoe_size".to_string(), "44".to_string()),
        ];
        let attrs = ontology.coerce_attributes("Person", &raw);
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs["role"], Value::String("engineer".into()));
    }

    #[test]
    fn timestamp_coercion() {
        assert!(AttrKind::Timestamp.coerce("2024-03-01T00:00:00Z").is_some());
        assert!(AttrKind::Timestamp.coerce("next tuesday").is_none());
    }

    #[test]
    fn validate_attributes_checks_types() {
        let ontology = Ontology::builtin();
        let mut attrs = HashMap::new();
        attrs.insert("role".to_string(), Value::String("cto".into()));
        assert!(ontology.validate_attributes("Person", &attrs).is_ok());

        attrs.insert("role".to_string(), Value::Bool(true));
        assert!(ontology.validate_attributes("Person", &attrs).is_err());
    }
}
