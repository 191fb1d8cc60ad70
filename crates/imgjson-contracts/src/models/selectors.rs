use super::registry::{Capability, ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    /// Resolves `requested` for `capability`, or the first capable model with
    /// a human-readable reason for the substitution.
    pub fn select(
        &self,
        requested: Option<&str>,
        capability: Capability,
    ) -> Result<ModelSelection, String> {
        let requested = requested.map(str::trim).filter(|value| !value.is_empty());
        if let Some(model) = requested.and_then(|name| self.registry.ensure(name, capability)) {
            return Ok(ModelSelection {
                model: model.clone(),
                requested: requested.map(str::to_string),
                fallback_reason: None,
            });
        }

        let Some(model) = self.registry.by_capability(capability).first().copied() else {
            return Err(format!(
                "No models available for capability '{}'.",
                capability.as_str()
            ));
        };
        let fallback_reason = match requested {
            Some(name) => format!(
                "Requested model '{name}' unavailable for capability '{}'.",
                capability.as_str()
            ),
            None => "No model specified; using default.".to_string(),
        };
        Ok(ModelSelection {
            model: model.clone(),
            requested: requested.map(str::to_string),
            fallback_reason: Some(fallback_reason),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::models::{Capability, ModelRegistry, ModelSelector, ModelSpec};

    fn selector() -> ModelSelector {
        ModelSelector::new(Some(ModelRegistry::from_specs(vec![
            ModelSpec::new("vision-a", "dryrun", &[Capability::Text, Capability::Vision]),
            ModelSpec::new("image-a", "dryrun", &[Capability::Image]),
        ])))
    }

    #[test]
    fn selects_requested_model_when_capable() {
        let selection = selector().select(Some("image-a"), Capability::Image).unwrap();
        assert_eq!(selection.model.name, "image-a");
        assert_eq!(selection.fallback_reason, None);
    }

    #[test]
    fn falls_back_when_requested_model_lacks_capability() {
        let selection = selector().select(Some("image-a"), Capability::Vision).unwrap();
        assert_eq!(selection.model.name, "vision-a");
        assert_eq!(selection.requested.as_deref(), Some("image-a"));
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("Requested model 'image-a' unavailable for capability 'vision'.")
        );
    }

    #[test]
    fn blank_request_uses_default_with_explanation() {
        let selection = selector().select(Some("  "), Capability::Text).unwrap();
        assert_eq!(selection.model.name, "vision-a");
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("No model specified; using default.")
        );
    }

    #[test]
    fn errors_when_no_model_has_capability() {
        let err = selector()
            .select(Some("image-a"), Capability::Edit)
            .err()
            .unwrap_or_default();
        assert_eq!(err, "No models available for capability 'edit'.");
    }
}
