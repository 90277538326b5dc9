//! Template resolution.
//!
//! Templates are looked up by name and rendered with `{{ key }}`
//! placeholders. Unknown placeholders are left untouched so a missing
//! variable shows up in the delivered text instead of vanishing.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::{Error, Result};

/// Rendered template content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedTemplate {
    pub subject: Option<String>,
    pub body: String,
}

/// Resolves a named template with variables.
#[async_trait]
pub trait TemplateResolver: Send + Sync {
    /// Fails with [`Error::TemplateNotFound`] if the template is missing or
    /// inactive.
    async fn resolve(
        &self,
        name: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<RenderedTemplate>;
}

/// A stored template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateDefinition {
    pub name: String,
    pub subject: Option<String>,
    pub body: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl TemplateDefinition {
    pub fn new(name: impl Into<String>, subject: Option<&str>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subject: subject.map(str::to_string),
            body: body.into(),
            active: true,
        }
    }
}

/// Template resolver backed by an in-memory map.
#[derive(Debug, Default)]
pub struct InMemoryTemplateResolver {
    templates: RwLock<HashMap<String, TemplateDefinition>>,
}

impl InMemoryTemplateResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(self, template: TemplateDefinition) -> Self {
        self.insert(template);
        self
    }

    pub fn insert(&self, template: TemplateDefinition) {
        self.templates.write().insert(template.name.clone(), template);
    }

    /// Activate or deactivate a template. Returns false if it does not exist.
    pub fn set_active(&self, name: &str, active: bool) -> bool {
        match self.templates.write().get_mut(name) {
            Some(template) => {
                template.active = active;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, name: &str) -> Option<TemplateDefinition> {
        self.templates.write().remove(name)
    }

    /// Load templates from a JSON array of [`TemplateDefinition`]s. A later
    /// entry replaces an earlier one with the same name.
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = tokio::fs::read(path.as_ref()).await?;
        let templates: Vec<TemplateDefinition> = serde_json::from_slice(&data)?;
        let resolver = Self::new();
        for template in templates {
            if template.name.trim().is_empty() {
                return Err(Error::config(format!(
                    "template with empty name in {}",
                    path.as_ref().display()
                )));
            }
            resolver.insert(template);
        }
        Ok(resolver)
    }

    pub fn len(&self) -> usize {
        self.templates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.read().is_empty()
    }
}

#[async_trait]
impl TemplateResolver for InMemoryTemplateResolver {
    async fn resolve(
        &self,
        name: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<RenderedTemplate> {
        let template = self
            .templates
            .read()
            .get(name)
            .filter(|t| t.active)
            .cloned()
            .ok_or_else(|| Error::TemplateNotFound(name.to_string()))?;

        Ok(RenderedTemplate {
            subject: template.subject.as_deref().map(|s| render(s, variables)),
            body: render(&template.body, variables),
        })
    }
}

/// Substitute `{{ key }}` placeholders.
pub fn render(template: &str, variables: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match variables.get(key) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[start..start + 2 + end + 2]),
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_placeholders() {
        let rendered = render("Hi {{name}}, code {{ code }}.", &vars(&[("name", "Ada"), ("code", "42")]));
        assert_eq!(rendered, "Hi Ada, code 42.");
    }

    #[test]
    fn test_render_keeps_unknown_and_unclosed() {
        assert_eq!(render("Hi {{ who }}", &vars(&[])), "Hi {{ who }}");
        assert_eq!(render("broken {{ name", &vars(&[("name", "x")])), "broken {{ name");
    }

    #[tokio::test]
    async fn test_resolve_active_template() {
        let resolver = InMemoryTemplateResolver::new().with_template(TemplateDefinition::new(
            "welcome",
            Some("Welcome {{name}}"),
            "Hello {{name}}!",
        ));

        let rendered = resolver
            .resolve("welcome", &vars(&[("name", "Ada")]))
            .await
            .unwrap();
        assert_eq!(rendered.subject.as_deref(), Some("Welcome Ada"));
        assert_eq!(rendered.body, "Hello Ada!");
    }

    #[tokio::test]
    async fn test_missing_or_inactive_template() {
        let resolver = InMemoryTemplateResolver::new()
            .with_template(TemplateDefinition::new("reset", None, "Reset link"));

        let err = resolver.resolve("nope", &vars(&[])).await.unwrap_err();
        assert!(matches!(err, Error::TemplateNotFound(name) if name == "nope"));

        assert!(resolver.set_active("reset", false));
        assert!(resolver.resolve("reset", &vars(&[])).await.is_err());
        assert!(resolver.set_active("reset", true));
        assert!(resolver.resolve("reset", &vars(&[])).await.is_ok());
    }

    #[tokio::test]
    async fn test_load_templates_from_json_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("templates.json");
        std::fs::write(
            &path,
            r#"[
                {"name": "welcome", "subject": "Hi {{name}}", "body": "Welcome, {{name}}."},
                {"name": "retired", "subject": null, "body": "old", "active": false}
            ]"#,
        )
        .unwrap();

        let resolver = InMemoryTemplateResolver::from_json_file(&path).await.unwrap();
        assert_eq!(resolver.len(), 2);
        let rendered = resolver
            .resolve("welcome", &vars(&[("name", "Ada")]))
            .await
            .unwrap();
        assert_eq!(rendered.subject.as_deref(), Some("Hi Ada"));
        assert_eq!(rendered.body, "Welcome, Ada.");
        assert!(matches!(
            resolver.resolve("retired", &vars(&[])).await,
            Err(Error::TemplateNotFound(_))
        ));

        std::fs::write(&path, r#"[{"name": " ", "body": "x"}]"#).unwrap();
        assert!(matches!(
            InMemoryTemplateResolver::from_json_file(&path).await,
            Err(Error::Configuration(_))
        ));
        assert!(
            InMemoryTemplateResolver::from_json_file(dir.path().join("missing.json"))
                .await
                .is_err()
        );
    }
}
