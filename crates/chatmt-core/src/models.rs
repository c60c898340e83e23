//! Model resolution: maps a `model_name` string to the provider adapter and
//! connection details that should serve it. Resolution order: the static
//! table, then the character's embedded binding, then a synthesized
//! "local" entry for anything that looks like a filesystem path or a
//! known local-model suffix.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{CoreError, CoreResult};
use crate::model::EmbeddedModelBinding;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Google,
    Local,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    pub provider: ProviderKind,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model_identifier: String,
    #[serde(default)]
    pub supports_images: bool,
}

/// The static `model_name -> ModelEntry` table, loaded once at startup
/// from the service's TOML configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelCatalog {
    #[serde(default)]
    pub models: HashMap<String, ModelEntry>,
    /// Connection details used to synthesize a `Local` entry for model
    /// names that resolve to neither the static table nor a character
    /// binding.
    pub local_runtime: Option<ModelEntry>,
}

fn looks_like_local_model(name: &str) -> bool {
    name.contains('/') || name.ends_with(".gguf") || name.contains(':') && !name.starts_with("gpt")
}

impl ModelCatalog {
    /// Resolves `model_name` to a usable entry. `character_binding` lets a
    /// character pin its own model without a static table entry.
    /// `allow_local_runtime_synthesis` mirrors the generate request's
    /// `resolve_local_runtime_model` flag.
    pub fn resolve(
        &self,
        model_name: &str,
        character_binding: Option<&EmbeddedModelBinding>,
        allow_local_runtime_synthesis: bool,
    ) -> CoreResult<ModelEntry> {
        if let Some(entry) = self.models.get(model_name) {
            return Ok(entry.clone());
        }

        if let Some(binding) = character_binding {
            if binding.model_name.as_deref() == Some(model_name) {
                if let Some(identifier) = &binding.model_identifier {
                    let provider = match binding.model_provider.as_deref() {
                        Some("google") => ProviderKind::Google,
                        Some("local") => ProviderKind::Local,
                        _ => ProviderKind::OpenAi,
                    };
                    if let Some(base) = self.local_runtime.as_ref().filter(|_| provider == ProviderKind::Local) {
                        return Ok(ModelEntry {
                            provider,
                            base_url: base.base_url.clone(),
                            api_key: base.api_key.clone(),
                            model_identifier: identifier.clone(),
                            supports_images: binding.model_supports_images.unwrap_or(false),
                        });
                    }
                    return Ok(ModelEntry {
                        provider,
                        base_url: self.models.values().next().map(|e| e.base_url.clone()).unwrap_or_default(),
                        api_key: None,
                        model_identifier: identifier.clone(),
                        supports_images: binding.model_supports_images.unwrap_or(false),
                    });
                }
            }
        }

        if allow_local_runtime_synthesis && looks_like_local_model(model_name) {
            if let Some(local) = &self.local_runtime {
                return Ok(ModelEntry {
                    provider: ProviderKind::Local,
                    base_url: local.base_url.clone(),
                    api_key: local.api_key.clone(),
                    model_identifier: model_name.to_string(),
                    supports_images: false,
                });
            }
        }

        Err(CoreError::bad_request(format!("unknown model '{model_name}'")))
    }
}
