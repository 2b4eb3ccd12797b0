use indexmap::IndexMap;

use super::{CAPABILITY_EDIT, CAPABILITY_TEXT, CAPABILITY_VISION};

const CLAUDE: &[&str] = &[CAPABILITY_VISION, CAPABILITY_TEXT];
const EDITOR: &[&str] = &[CAPABILITY_EDIT];

/// Built-in models as `(name, provider, capabilities, max_output_tokens)`.
/// Order is preference order when no model is requested.
const BUILTIN: &[(&str, &str, &[&str], Option<u64>)] = &[
    ("claude-sonnet-4-5", "anthropic", CLAUDE, Some(2048)),
    ("claude-opus-4-1", "anthropic", CLAUDE, Some(2048)),
    ("claude-haiku-4-5", "anthropic", CLAUDE, Some(1024)),
    ("fal-ai/nano-banana/edit", "fal", EDITOR, None),
    ("fal-ai/flux-pro/kontext", "fal", EDITOR, None),
    ("fal-ai/qwen-image-edit", "fal", EDITOR, None),
    ("dryrun-vision-1", "dryrun", CLAUDE, Some(1024)),
    ("dryrun-edit-1", "dryrun", EDITOR, None),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    pub max_output_tokens: Option<u64>,
}

impl ModelSpec {
    pub fn new(name: &str, provider: &str, capabilities: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            provider: provider.to_string(),
            capabilities: capabilities.iter().map(|cap| cap.to_string()).collect(),
            max_output_tokens: None,
        }
    }

    pub fn with_max_output_tokens(mut self, limit: Option<u64>) -> Self {
        self.max_output_tokens = limit;
        self
    }

    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|cap| cap == capability)
    }

    pub fn is_dryrun(&self) -> bool {
        self.provider == "dryrun"
    }
}

/// Known models keyed by name, in preference order.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        let models = BUILTIN
            .iter()
            .map(|(name, provider, caps, limit)| {
                let spec = ModelSpec::new(name, provider, caps).with_max_output_tokens(*limit);
                (spec.name.clone(), spec)
            })
            .collect();
        Self { models }
    }
}

impl ModelRegistry {
    /// Uses `models` when given, otherwise the built-in table.
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        match models {
            Some(models) => Self { models },
            None => Self::default(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    /// Models that can serve `capability`, real backends before dryrun ones.
    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        let (mut real, dryrun): (Vec<ModelSpec>, Vec<ModelSpec>) = self
            .models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .partition(|model| !model.is_dryrun());
        real.extend(dryrun);
        real
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        self.get(name)
            .filter(|model| model.supports(capability))
            .cloned()
    }

    /// Adds `name` under `provider` if the table does not know it yet, so
    /// configuration can name a newer model id.
    pub fn register_custom(&mut self, name: &str, provider: &str, capabilities: &[&str]) {
        self.models
            .entry(name.to_string())
            .or_insert_with(|| ModelSpec::new(name, provider, capabilities));
    }
}
