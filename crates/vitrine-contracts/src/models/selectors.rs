use super::registry::{ModelRegistry, ModelSpec};

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

    /// Resolves `requested` for `capability`, skipping models that cannot
    /// take `input_images` inline images in one request.
    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
        input_images: usize,
    ) -> Result<ModelSelection, String> {
        let fits = |model: &ModelSpec| model.max_input_images >= input_images;
        let fallback_reason = match requested {
            Some(name) => match self.registry.ensure(name, capability) {
                Some(model) if fits(&model) => {
                    return Ok(ModelSelection {
                        model,
                        requested: Some(name.to_string()),
                        fallback_reason: None,
                    });
                }
                Some(model) => format!(
                    "Requested model '{name}' accepts at most {} input images; {input_images} needed.",
                    model.max_input_images
                ),
                None => {
                    format!("Requested model '{name}' unavailable for capability '{capability}'.")
                }
            },
            None => "No model specified; using default.".to_string(),
        };

        let candidates = self.registry.by_capability(capability);
        if candidates.is_empty() {
            return Err(format!(
                "No models available for capability '{capability}'."
            ));
        }
        let Some(model) = candidates.into_iter().find(|model| fits(model)) else {
            return Err(format!(
                "No '{capability}' model accepts {input_images} input images."
            ));
        };
        Ok(ModelSelection {
            model,
            requested: requested.map(str::to_string),
            fallback_reason: Some(fallback_reason),
        })
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use crate::models::{ModelRegistry, ModelSelector, ModelSpec, EDIT_CAPABILITY};

    fn edit_model(name: &str) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            provider: "dryrun".to_string(),
            capabilities: vec![EDIT_CAPABILITY.to_string()],
            max_input_images: 4,
        }
    }

    #[test]
    fn requested_model_is_used_when_available() {
        let selection = ModelSelector::new(None)
            .select(Some("gemini-3-pro-image-preview"), EDIT_CAPABILITY, 2)
            .unwrap();
        assert_eq!(selection.model.name, "gemini-3-pro-image-preview");
        assert_eq!(selection.model.provider, "gemini");
        assert!(selection.fallback_reason.is_none());
    }

    #[test]
    fn selector_falls_back_when_requested_model_unavailable() {
        let mut models = IndexMap::new();
        models.insert("edit-fallback".to_string(), edit_model("edit-fallback"));
        let selection = ModelSelector::new(Some(ModelRegistry::new(Some(models))))
            .select(Some("missing"), EDIT_CAPABILITY, 2)
            .unwrap();
        assert_eq!(selection.model.name, "edit-fallback");
        assert_eq!(selection.requested.as_deref(), Some("missing"));
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("Requested model 'missing' unavailable for capability 'edit'.")
        );
    }

    #[test]
    fn selector_without_request_uses_default_with_explanation() {
        let selection = ModelSelector::new(None)
            .select(None, EDIT_CAPABILITY, 2)
            .unwrap();
        assert_eq!(selection.model.name, "gemini-2.5-flash-image");
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("No model specified; using default.")
        );
    }

    #[test]
    fn selector_errors_when_no_models_for_capability() {
        let mut models = IndexMap::new();
        let mut text_only = edit_model("text-only");
        text_only.capabilities = vec!["text".to_string()];
        models.insert("text-only".to_string(), text_only);
        let err = ModelSelector::new(Some(ModelRegistry::new(Some(models))))
            .select(Some("text-only"), EDIT_CAPABILITY, 2)
            .err()
            .unwrap_or_default();
        assert_eq!(err, "No models available for capability 'edit'.");
    }

    #[test]
    fn selector_skips_models_with_too_few_input_slots() {
        let mut models = IndexMap::new();
        let mut small = edit_model("small");
        small.max_input_images = 2;
        models.insert("small".to_string(), small);
        models.insert("large".to_string(), edit_model("large"));
        let selector = ModelSelector::new(Some(ModelRegistry::new(Some(models))));

        let selection = selector
            .select(Some("small"), EDIT_CAPABILITY, 4)
            .unwrap();
        assert_eq!(selection.model.name, "large");
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("Requested model 'small' accepts at most 2 input images; 4 needed.")
        );

        let err = selector
            .select(None, EDIT_CAPABILITY, 5)
            .err()
            .unwrap_or_default();
        assert_eq!(err, "No 'edit' model accepts 5 input images.");
    }
}
