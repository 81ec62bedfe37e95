//! Outbound model selection.

use crate::body::RequestBody;
use crate::provider::Provider;

/// Model to send to `provider`. An explicit route override wins outright;
/// otherwise the provider's model classes are consulted.
pub fn select_model(
    provider: &Provider,
    body: &RequestBody,
    model_override: Option<&str>,
) -> String {
    match model_override {
        Some(model) => model.to_string(),
        None => map_model(provider, body.model(), body.thinking_enabled()).to_string(),
    }
}

/// Map `original` onto the provider's model classes:
/// reasoning (when thinking), then haiku, opus, sonnet by substring,
/// then the default model, else `original` untouched.
pub fn map_model<'a>(provider: &'a Provider, original: &'a str, thinking: bool) -> &'a str {
    let models = provider.models();

    if thinking {
        if let Some(reasoning) = configured(&models.reasoning) {
            return reasoning;
        }
    }

    let lowered = original.to_ascii_lowercase();
    let by_family = [
        ("haiku", &models.haiku),
        ("opus", &models.opus),
        ("sonnet", &models.sonnet),
    ];
    for (family, model) in by_family {
        if lowered.contains(family) {
            if let Some(model) = configured(model) {
                return model;
            }
        }
    }

    configured(&models.default).unwrap_or(original)
}

fn configured(model: &Option<String>) -> Option<&str> {
    model.as_deref().filter(|m| !m.is_empty())
}
