//! Settings management

use serde::{Deserialize, Serialize};

/// Bridge settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Name used to tag log output for this context.
    pub context_name: String,
    /// Panic on use-after-dispose instead of returning an error. On by
    /// default in debug builds.
    pub strict_disposal: bool,
    /// Run a collection pass before the engine is torn down.
    pub collect_on_dispose: bool,
    /// Log script exceptions when no error handler is installed.
    pub report_unhandled_exceptions: bool,
}

impl BridgeSettings {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            context_name: "main".to_string(),
            strict_disposal: cfg!(debug_assertions),
            collect_on_dispose: true,
            report_unhandled_exceptions: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let settings = BridgeSettings::from_json(r#"{ "strict_disposal": true }"#).unwrap();
        assert!(settings.strict_disposal);
        assert_eq!(settings.context_name, "main");
        assert!(settings.collect_on_dispose);
    }

    #[test]
    fn test_strict_disposal_follows_build_profile() {
        assert_eq!(BridgeSettings::default().strict_disposal, cfg!(debug_assertions));
        let settings = BridgeSettings::from_json(r#"{ "context_name": "editor" }"#).unwrap();
        assert_eq!(settings.strict_disposal, cfg!(debug_assertions));
    }
}
