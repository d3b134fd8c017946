//! Template rendering for template-based outbound sends.
//!
//! The delivery manager treats rendered output as opaque content; `PlaceholderRenderer`
//! is the default `{{name}}` substitution engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A stored message template with named placeholders (`{{first_name}}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub name: String,
    pub body: String,
}

/// Rendered template: display text plus the provider parameter list, in placeholder order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedTemplate {
    pub rendered_text: String,
    pub wire_parameters: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("missing value for template variable: {0}")]
    MissingVariable(String),
    #[error("unterminated placeholder in template {0}")]
    Unterminated(String),
}

/// Pure render function: same template and values always give the same output.
pub trait TemplateRenderer: Send + Sync {
    fn render(
        &self,
        template: &Template,
        values: &HashMap<String, String>,
    ) -> Result<RenderedTemplate, TemplateError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderRenderer;

impl TemplateRenderer for PlaceholderRenderer {
    fn render(
        &self,
        template: &Template,
        values: &HashMap<String, String>,
    ) -> Result<RenderedTemplate, TemplateError> {
        let mut out = String::with_capacity(template.body.len());
        let mut wire_parameters = Vec::new();
        let mut rest = template.body.as_str();
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| TemplateError::Unterminated(template.name.clone()))?;
            let name = after[..end].trim();
            let value = values
                .get(name)
                .ok_or_else(|| TemplateError::MissingVariable(name.to_string()))?;
            out.push_str(value);
            wire_parameters.push(serde_json::json!({ "type": "text", "text": value }));
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(RenderedTemplate {
            rendered_text: out,
            wire_parameters,
        })
    }
}
