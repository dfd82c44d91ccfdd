//! Schema contract validation.
//!
//! Schemas are resolved through an injected [`SchemaLoader`] (the only
//! point of this stage that may suspend) and compiled once per process,
//! keyed by the exact ref string. Two refs that name the same schema via
//! different paths compile twice; that avoids resolving filesystem
//! identity and is acceptable for correctness. Cache writes are
//! first-writer-wins under concurrent compilation of the same ref.

#![deny(unsafe_code)]

use async_trait::async_trait;
use jsonschema::{Draft, JSONSchema};
use policy::ContractConfig;
use serde_json::Value;
use shield_core::context::RequestContext;
use shield_core::decision::{RuleHit, Severity};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use thiserror::Error;

/// Hit id for a body that fails its schema (or a schema that cannot be
/// resolved or compiled).
pub const RULE_SCHEMA_INVALID: &str = "contract.schema.invalid";
/// Hit id for a strict contract backed by a permissive schema.
pub const RULE_REJECT_UNKNOWN: &str = "contract.reject_unknown_fields";

/// Errors a schema loader may report.
#[derive(Debug, Error)]
pub enum SchemaLoadError {
    /// No schema exists under the ref.
    #[error("schema '{0}' not found")]
    NotFound(String),
    /// The loader failed to fetch or parse the schema.
    #[error("schema load failed: {0}")]
    Load(String),
}

/// Capability resolving a schema ref to a JSON Schema document. Loaders
/// own their fetch strategy and any raw-document caching; the PDP caches
/// only compiled validators.
#[async_trait]
pub trait SchemaLoader: Send + Sync {
    /// Resolve `schema_ref` to a schema document.
    async fn load(&self, schema_ref: &str) -> Result<Value, SchemaLoadError>;
}

/// A compiled validator plus the resolved document it came from.
pub struct CompiledSchema {
    raw: Value,
    validator: JSONSchema,
}

impl CompiledSchema {
    /// Compile a resolved schema document (Draft 7).
    pub fn compile(raw: Value) -> Result<Self, String> {
        let validator = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&raw)
            .map_err(|e| e.to_string())?;
        Ok(Self { raw, validator })
    }

    /// Validate an instance; on failure returns all errors joined with "; ".
    pub fn validate(&self, instance: &Value) -> Result<(), String> {
        match self.validator.validate(instance) {
            Ok(()) => Ok(()),
            Err(errors) => Err(errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ")),
        }
    }

    /// Whether every object level reachable through `properties`/`items`
    /// sets `additionalProperties: false`.
    #[must_use]
    pub fn rejects_unknown_fields(&self) -> bool {
        rejects_unknown(&self.raw)
    }
}

fn rejects_unknown(schema: &Value) -> bool {
    let Value::Object(map) = schema else {
        return true;
    };
    let object_typed = map.contains_key("properties")
        || map.get("type").and_then(Value::as_str) == Some("object")
        || map
            .get("type")
            .and_then(Value::as_array)
            .is_some_and(|types| types.iter().any(|t| t.as_str() == Some("object")));
    if object_typed && map.get("additionalProperties") != Some(&Value::Bool(false)) {
        return false;
    }
    if let Some(props) = map.get("properties").and_then(Value::as_object) {
        if !props.values().all(rejects_unknown) {
            return false;
        }
    }
    match map.get("items") {
        Some(Value::Array(items)) => items.iter().all(rejects_unknown),
        Some(other) => rejects_unknown(other),
        None => true,
    }
}

static COMPILED: OnceLock<RwLock<HashMap<String, Arc<CompiledSchema>>>> = OnceLock::new();

fn cache() -> &'static RwLock<HashMap<String, Arc<CompiledSchema>>> {
    COMPILED.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Number of compiled validators held by the process; test hook.
#[must_use]
pub fn cached_validator_count() -> usize {
    cache().read().expect("schema cache lock poisoned").len()
}

/// Resolve and compile a ref, reusing the process-wide cache.
pub async fn compile_ref(
    loader: &dyn SchemaLoader,
    schema_ref: &str,
) -> Result<Arc<CompiledSchema>, String> {
    if let Some(found) =
        cache().read().expect("schema cache lock poisoned").get(schema_ref).cloned()
    {
        return Ok(found);
    }
    let raw = loader.load(schema_ref).await.map_err(|e| e.to_string())?;
    let compiled = Arc::new(
        CompiledSchema::compile(raw)
            .map_err(|e| format!("schema '{schema_ref}' failed to compile: {e}"))?,
    );
    let mut entries = cache().write().expect("schema cache lock poisoned");
    Ok(entries.entry(schema_ref.to_string()).or_insert(compiled).clone())
}

/// Run the schema contract stage for one route.
///
/// Capability failures (no loader injected, load or compile error) emit a
/// critical hit and the pipeline continues; validation failures emit a
/// high hit aggregating every error.
pub async fn run_contract_stage(
    contract: &ContractConfig,
    loader: Option<&dyn SchemaLoader>,
    ctx: &RequestContext,
) -> Vec<RuleHit> {
    let Some(schema_ref) = contract.request_schema_ref.as_deref() else {
        return Vec::new();
    };
    let Some(loader) = loader else {
        return vec![RuleHit::with_message(
            RULE_SCHEMA_INVALID,
            Severity::Critical,
            format!("no schema loader configured for '{schema_ref}'"),
        )];
    };
    let compiled = match compile_ref(loader, schema_ref).await {
        Ok(compiled) => compiled,
        Err(message) => {
            return vec![RuleHit::with_message(RULE_SCHEMA_INVALID, Severity::Critical, message)]
        }
    };

    let mut hits = Vec::new();
    let null = Value::Null;
    let sample = ctx.request.body.json.as_ref().map_or(&null, |j| &j.sample);
    if let Err(errors) = compiled.validate(sample) {
        hits.push(RuleHit::with_message(RULE_SCHEMA_INVALID, Severity::High, errors));
    }
    if contract.reject_unknown_fields && !compiled.rejects_unknown_fields() {
        hits.push(RuleHit::with_message(
            RULE_REJECT_UNKNOWN,
            Severity::Med,
            format!("'{schema_ref}' does not set additionalProperties=false at every object level"),
        ));
    }
    hits
}
