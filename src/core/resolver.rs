//! Template resolution and late binding of output references.
//!
//! Resolves `{{params.key}}` and `{{stack.field}}` templates inside string
//! literals before diffing, and replaces `{ ref: ... }` values with concrete
//! provider outputs right before a provider call. Unknown variables and
//! missing outputs are errors, never silent defaults.

use super::error::{ExecError, PlanError};
use super::types::*;
use rustc_hash::FxHashMap;

/// Outputs known to the executor, keyed by `Resource` or `stack::Resource`.
pub type OutputIndex = FxHashMap<String, Outputs>;

/// Resolve all template variables in a string.
pub fn resolve_template(template: &str, stack: &Stack) -> Result<String, String> {
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(open) = result[start..].find("{{") {
        let open = start + open;
        let close = result[open..]
            .find("}}")
            .ok_or_else(|| format!("unclosed template at position {}", open))?;
        let close = open + close + 2;
        let key = result[open + 2..close - 2].trim();

        let value = if let Some(param_key) = key.strip_prefix("params.") {
            stack
                .params
                .get(param_key)
                .map(value_to_template_string)
                .ok_or_else(|| format!("unknown param: {}", param_key))?
        } else if let Some(field) = key.strip_prefix("stack.") {
            let value = match field {
                "name" => Some(stack.name.clone()),
                "region" => stack.region.clone(),
                "account" => stack.account.clone(),
                "prefix" => stack.prefix.clone(),
                _ => return Err(format!("unknown stack field: {}", field)),
            };
            value.ok_or_else(|| format!("stack field '{}' is not set", field))?
        } else {
            return Err(format!("unknown template variable: {}", key));
        };

        result.replace_range(open..close, &value);
        start = open + value.len();
    }

    Ok(result)
}

fn resolve_value(value: &PropertyValue, stack: &Stack) -> Result<PropertyValue, String> {
    Ok(match value {
        PropertyValue::Literal(serde_json::Value::String(s)) => {
            PropertyValue::Literal(serde_json::Value::String(resolve_template(s, stack)?))
        }
        PropertyValue::List(items) => PropertyValue::List(
            items
                .iter()
                .map(|v| resolve_value(v, stack))
                .collect::<Result<_, _>>()?,
        ),
        PropertyValue::Map(map) => PropertyValue::Map(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), resolve_value(v, stack)?)))
                .collect::<Result<_, String>>()?,
        ),
        other => other.clone(),
    })
}

/// Resolve all templates in a resource's string literals.
pub fn resolve_resource_templates(resource: &Resource, stack: &Stack) -> Result<Resource, PlanError> {
    let mut resolved = resource.clone();
    for (key, value) in resolved.properties.iter_mut() {
        *value = resolve_value(value, stack).map_err(|message| PlanError::Template {
            resource: resource.id.clone(),
            message: format!("property '{}': {}", key, message),
        })?;
    }
    Ok(resolved)
}

/// A copy of the stack with every property template resolved.
pub fn resolve_stack_templates(stack: &Stack) -> Result<Stack, PlanError> {
    let mut resolved = stack.clone();
    resolved.resources = stack
        .resources
        .iter()
        .map(|r| resolve_resource_templates(r, stack))
        .collect::<Result<_, _>>()?;
    Ok(resolved)
}

fn bind_value(
    resource_id: &str,
    value: &PropertyValue,
    outputs: &OutputIndex,
) -> Result<serde_json::Value, ExecError> {
    match value {
        PropertyValue::Ref(r) => outputs
            .get(&r.target_key())
            .and_then(|o| o.get(&r.attribute))
            .cloned()
            .ok_or_else(|| ExecError::MissingOutput {
                resource: resource_id.to_string(),
                reference: r.to_string(),
            }),
        PropertyValue::List(items) => Ok(serde_json::Value::Array(
            items
                .iter()
                .map(|v| bind_value(resource_id, v, outputs))
                .collect::<Result<_, _>>()?,
        )),
        PropertyValue::Map(map) => Ok(serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), bind_value(resource_id, v, outputs)?)))
                .collect::<Result<_, ExecError>>()?,
        )),
        PropertyValue::Literal(v) => Ok(v.clone()),
    }
}

/// Replace every reference with the concrete output value.
pub fn bind_references(resource: &Resource, outputs: &OutputIndex) -> Result<Properties, ExecError> {
    resource
        .properties
        .iter()
        .map(|(k, v)| Ok((k.clone(), bind_value(&resource.id, v, outputs)?)))
        .collect()
}
