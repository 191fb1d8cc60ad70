use indexmap::IndexMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Text,
    Vision,
    Image,
    Edit,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Vision => "vision",
            Self::Image => "image",
            Self::Edit => "edit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<Capability>,
}

impl ModelSpec {
    pub fn new(name: &str, provider: &str, capabilities: &[Capability]) -> Self {
        Self {
            name: name.to_string(),
            provider: provider.to_string(),
            capabilities: capabilities.to_vec(),
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Known models in preference order; the first capable model is the default.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn from_specs(specs: Vec<ModelSpec>) -> Self {
        Self {
            models: specs
                .into_iter()
                .map(|spec| (spec.name.clone(), spec))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    /// Adds or replaces a model, keeping its original position on replace.
    pub fn register(&mut self, spec: ModelSpec) {
        self.models.insert(spec.name.clone(), spec);
    }

    pub fn by_capability(&self, capability: Capability) -> Vec<&ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: Capability) -> Option<&ModelSpec> {
        self.get(name).filter(|model| model.supports(capability))
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    use Capability::{Edit, Image, Text, Vision};

    [
        ModelSpec::new("gpt-4.1-mini", "openai", &[Text, Vision]),
        ModelSpec::new("gpt-4.1", "openai", &[Text, Vision]),
        ModelSpec::new("gpt-4o-mini", "openai", &[Text, Vision]),
        ModelSpec::new("gpt-image-1", "openai", &[Image, Edit]),
        ModelSpec::new("gpt-image-1-mini", "openai", &[Image, Edit]),
        ModelSpec::new("dryrun-text-1", "dryrun", &[Text, Vision]),
        ModelSpec::new("dryrun-image-1", "dryrun", &[Image, Edit]),
    ]
    .into_iter()
    .map(|spec| (spec.name.clone(), spec))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::{Capability, ModelRegistry, ModelSpec};

    #[test]
    fn default_registry_prefers_openai_models() {
        let registry = ModelRegistry::new(None);
        assert_eq!(registry.by_capability(Capability::Vision)[0].name, "gpt-4.1-mini");
        assert_eq!(registry.by_capability(Capability::Edit)[0].name, "gpt-image-1");
        assert!(registry.ensure("gpt-image-1", Capability::Text).is_none());
        assert_eq!(
            registry
                .ensure("dryrun-image-1", Capability::Image)
                .map(|spec| spec.provider.as_str()),
            Some("dryrun")
        );
    }

    #[test]
    fn register_replaces_in_place() {
        let mut registry = ModelRegistry::from_specs(vec![
            ModelSpec::new("a", "openai", &[Capability::Text]),
            ModelSpec::new("b", "openai", &[Capability::Text]),
        ]);
        registry.register(ModelSpec::new("a", "dryrun", &[Capability::Text]));
        let names: Vec<&str> = registry.list().map(|spec| spec.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(registry.get("a").map(|spec| spec.provider.as_str()), Some("dryrun"));
    }
}
