use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestUserMessage, CreateChatCompletionRequestArgs, ResponseFormat,
        ResponseFormatJsonSchema,
    },
    Client,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::WeaveConfig;
use crate::embedding::classify_openai_error;
use crate::error::{Result, WeaveError};
use crate::llm::client::{
    CandidateEntity, CandidateFact, EntityExtractionOutcome, EntityExtractionRequest,
    FactExtractionOutcome, FactExtractionRequest, LlmClient,
};
use crate::llm::prompts;
use crate::ontology::Ontology;

// Wire shapes for the structured-output response format. Strings stand
// in for optional fields ("" = absent) so the strict-mode schema stays
// flat.

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct WireAttribute {
    name: String,
    value: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct WireEntity {
    name: String,
    label: String,
    attributes: Vec<WireAttribute>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct WireEntityList {
    entities: Vec<WireEntity>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct WireFact {
    source_name: String,
    target_name: String,
    relation_name: String,
    fact: String,
    valid_at: String,
    invalid_at: String,
    negates: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct WireFactList {
    facts: Vec<WireFact>,
}

/// Rewrite a schemars-generated schema for OpenAI strict mode: every
/// object must declare all properties required and forbid extras, and
/// `$ref` entries must stand alone.
fn normalize_schema_for_strict(schema: &mut serde_json::Value) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };

    if obj.contains_key("$ref") {
        obj.retain(|k, _| k == "$ref");
        return;
    }

    // Option<T> shows up as anyOf [T, null]; unwrap it.
    if let Some(any_of) = obj.get("anyOf").and_then(|v| v.as_array()).cloned() {
        let non_null: Vec<&serde_json::Value> = any_of
            .iter()
            .filter(|v| v.get("type").and_then(|t| t.as_str()) != Some("null"))
            .collect();
        if non_null.len() == 1 {
            let inner = non_null[0].clone();
            obj.clear();
            obj.extend(inner.as_object().cloned().unwrap_or_default());
            normalize_schema_for_strict(schema);
            return;
        }
    }

    if let Some(props) = obj.get("properties").and_then(|p| p.as_object()) {
        let keys: Vec<serde_json::Value> = props
            .keys()
            .map(|k| serde_json::Value::String(k.clone()))
            .collect();
        obj.insert("required".to_string(), serde_json::Value::Array(keys));
        obj.insert(
            "additionalProperties".to_string(),
            serde_json::Value::Bool(false),
        );
    }
    if let Some(props) = obj.get_mut("properties").and_then(|p| p.as_object_mut()) {
        for value in props.values_mut() {
            normalize_schema_for_strict(value);
        }
    }
    if let Some(items) = obj.get_mut("items") {
        normalize_schema_for_strict(items);
    }
    for defs_key in ["$defs", "definitions"] {
        if let Some(defs) = obj.get_mut(defs_key).and_then(|d| d.as_object_mut()) {
            for value in defs.values_mut() {
                normalize_schema_for_strict(value);
            }
        }
    }
}

/// Accepts RFC 3339 timestamps or bare dates; anything else is treated
/// as absent rather than failing the item.
fn parse_wire_time(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Extraction client for any OpenAI-compatible chat endpoint, using
/// strict JSON-schema structured output.
pub struct OpenAiLlmClient {
    client: Client<OpenAIConfig>,
    model: String,
    ontology: Ontology,
}

impl OpenAiLlmClient {
    pub fn new(config: &WeaveConfig) -> Self {
        let provider = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_provider_base_url);
        OpenAiLlmClient {
            client: Client::with_config(provider),
            model: config.llm_model.clone(),
            ontology: config.ontology.clone(),
        }
    }

    async fn generate<T>(&self, schema_name: &str, system: String, user: String) -> Result<T>
    where
        T: DeserializeOwned + JsonSchema,
    {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage::from(system)),
            ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage::from(user)),
        ];

        let schema = schemars::schema_for!(T);
        let mut schema = serde_json::to_value(&schema)
            .map_err(|e| WeaveError::Internal(format!("schema serialization failed: {}", e)))?;
        normalize_schema_for_strict(&mut schema);

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .response_format(ResponseFormat::JsonSchema {
                json_schema: ResponseFormatJsonSchema {
                    description: None,
                    name: schema_name.to_string(),
                    schema: Some(schema),
                    strict: Some(true),
                },
            })
            .build()
            .map_err(classify_openai_error)?;

        let content = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(classify_openai_error)?
            .choices
            .into_iter()
            .find_map(|c| c.message.content)
            .ok_or_else(|| WeaveError::BadLlmOutput("empty completion".to_string()))?;

        serde_json::from_str(&content)
            .map_err(|e| WeaveError::BadLlmOutput(format!("unparseable completion: {}", e)))
    }
}

#[async_trait]
impl LlmClient for OpenAiLlmClient {
    async fn extract_entities(
        &self,
        request: EntityExtractionRequest<'_>,
    ) -> Result<EntityExtractionOutcome> {
        let system = prompts::entity_extraction_system(&request);
        let user = prompts::entity_extraction_user(&request);
        let wire: WireEntityList = self.generate("entity_extraction", system, user).await?;

        let mut outcome = EntityExtractionOutcome::default();
        for entity in wire.entities {
            let name = entity.name.trim();
            if name.is_empty() || !self.ontology.contains(&entity.label) {
                outcome.dropped += 1;
                continue;
            }
            let raw: Vec<(String, String)> = entity
                .attributes
                .into_iter()
                .map(|a| (a.name, a.value))
                .collect();
            let attributes = self.ontology.coerce_attributes(&entity.label, &raw);
            outcome.entities.push(CandidateEntity {
                name: name.to_string(),
                label: entity.label,
                attributes,
            });
        }
        Ok(outcome)
    }

    async fn extract_facts(
        &self,
        request: FactExtractionRequest<'_>,
    ) -> Result<FactExtractionOutcome> {
        let system = prompts::fact_extraction_system();
        let user = prompts::fact_extraction_user(&request);
        let wire: WireFactList = self.generate("fact_extraction", system, user).await?;

        let known: Vec<&str> = request
            .entities
            .iter()
            .map(|e| e.canonical_name.as_str())
            .collect();

        let mut outcome = FactExtractionOutcome::default();
        for fact in wire.facts {
            let source = fact.source_name.trim();
            let target = fact.target_name.trim();
            let relation = fact.relation_name.trim();
            if source.is_empty()
                || target.is_empty()
                || relation.is_empty()
                || fact.fact.trim().is_empty()
                || !known.contains(&source)
                || !known.contains(&target)
            {
                outcome.dropped += 1;
                continue;
            }
            let valid_at = parse_wire_time(&fact.valid_at);
            let invalid_at = parse_wire_time(&fact.invalid_at);
            if let (Some(valid), Some(invalid)) = (valid_at, invalid_at) {
                if valid > invalid {
                    outcome.dropped += 1;
                    continue;
                }
            }
            outcome.facts.push(CandidateFact {
                source_name: source.to_string(),
                target_name: target.to_string(),
                relation_name: relation.to_string(),
                fact: fact.fact.trim().to_string(),
                valid_at,
                invalid_at,
                negates: fact.negates,
            });
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_schema_requires_all_fields() {
        let schema = schemars::schema_for!(WireFactList);
        let mut schema = serde_json::to_value(&schema).unwrap();
        normalize_schema_for_strict(&mut schema);

        fn check(value: &serde_json::Value) {
            let Some(obj) = value.as_object() else { return };
            if let Some(props) = obj.get("properties").and_then(|p| p.as_object()) {
                let required: Vec<&str> = obj
                    .get("required")
                    .and_then(|r| r.as_array())
                    .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
                    .unwrap_or_default();
                for key in props.keys() {
                    assert!(required.contains(&key.as_str()), "{} not required", key);
                }
                assert_eq!(obj.get("additionalProperties"), Some(&serde_json::Value::Bool(false)));
            }
            for v in obj.values() {
                check(v);
            }
        }
        check(&schema);
    }

    #[test]
    fn wire_time_accepts_dates_and_timestamps() {
        assert!(parse_wire_time("2024-03-01T12:00:00Z").is_some());
        let parsed = parse_wire_time("2024-03-01").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-03-01T00:00:00+00:00");
        assert!(parse_wire_time("").is_none());
        assert!(parse_wire_time("last spring").is_none());
    }
}
