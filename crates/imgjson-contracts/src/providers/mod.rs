use std::collections::BTreeMap;
use std::sync::Arc;

pub trait NamedProvider {
    fn name(&self) -> &str;
}

/// Providers keyed by name. `P` is usually a trait object so that one
/// `Arc` can be registered in several registries.
pub struct ProviderRegistry<P: NamedProvider + ?Sized> {
    providers: BTreeMap<String, Arc<P>>,
}

impl<P: NamedProvider + ?Sized> Default for ProviderRegistry<P> {
    fn default() -> Self {
        Self {
            providers: BTreeMap::new(),
        }
    }
}

impl<P: NamedProvider + ?Sized> ProviderRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider`, replacing any provider with the same name.
    pub fn register(&mut self, provider: Arc<P>) {
        self.providers
            .insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<&P> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{NamedProvider, ProviderRegistry};

    trait Greeter: NamedProvider {
        fn greet(&self) -> String;
    }

    struct Dummy {
        name: &'static str,
        greeting: &'static str,
    }

    impl NamedProvider for Dummy {
        fn name(&self) -> &str {
            self.name
        }
    }

    impl Greeter for Dummy {
        fn greet(&self) -> String {
            self.greeting.to_string()
        }
    }

    #[test]
    fn registry_lists_sorted_names_and_replaces_duplicates() {
        let mut registry: ProviderRegistry<dyn Greeter> = ProviderRegistry::new();
        registry.register(Arc::new(Dummy {
            name: "z",
            greeting: "first",
        }));
        registry.register(Arc::new(Dummy {
            name: "a",
            greeting: "hi",
        }));
        registry.register(Arc::new(Dummy {
            name: "z",
            greeting: "second",
        }));
        assert_eq!(registry.names(), vec!["a", "z"]);
        assert_eq!(registry.get("z").map(|p| p.greet()).as_deref(), Some("second"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn one_provider_can_back_two_registries() {
        trait Other: NamedProvider {}
        impl Other for Dummy {}

        let shared = Arc::new(Dummy {
            name: "shared",
            greeting: "hello",
        });
        let mut greeters: ProviderRegistry<dyn Greeter> = ProviderRegistry::new();
        let mut others: ProviderRegistry<dyn Other> = ProviderRegistry::new();
        greeters.register(shared.clone());
        others.register(shared);
        assert!(greeters.get("shared").is_some());
        assert!(others.get("shared").is_some());
    }
}
