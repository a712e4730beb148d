//! Identity file loading (§6 "Identity file"): an optional YAML
//! customization layered on a fixed base identity string.

use std::path::Path;

use serde::Deserialize;
use tokio::fs;
use tracing::warn;

/// The bot's fixed base identity, sent as part of the identity prompt
/// whenever a session is new and context was not restored. Customization
/// fields are appended after this, never replacing it.
pub const BASE_IDENTITY: &str = "\
You are a persistent general assistant. You maintain memory of past \
conversations in this channel and have access to tools for reading and \
writing files, running commands, and managing long-running tasks.";

/// Optional customization loaded from `identity.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Identity {
    /// Optional display name for the bot persona.
    #[serde(default)]
    pub name: Option<String>,
    /// Optional role description.
    #[serde(default)]
    pub role: Option<String>,
    /// Boundaries the bot should observe.
    #[serde(default)]
    pub boundaries: Vec<String>,
    /// Personality traits to color responses.
    #[serde(default)]
    pub traits: Vec<String>,
}

impl Identity {
    /// Whether this identity carries no customization beyond the base.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.role.is_none() && self.boundaries.is_empty() && self.traits.is_empty()
    }

    /// Render the full identity prompt: the base identity, plus any
    /// customization fields, in a stable order.
    #[must_use]
    pub fn render_prompt(&self) -> String {
        let mut prompt = BASE_IDENTITY.to_owned();

        if let Some(name) = &self.name {
            prompt.push_str(&format!("\n\nYour name is {name}."));
        }
        if let Some(role) = &self.role {
            prompt.push_str(&format!("\n\nYour role: {role}"));
        }
        if !self.traits.is_empty() {
            prompt.push_str(&format!("\n\nYour traits: {}.", self.traits.join(", ")));
        }
        if !self.boundaries.is_empty() {
            prompt.push_str("\n\nBoundaries you must observe:\n");
            for boundary in &self.boundaries {
                prompt.push_str(&format!("- {boundary}\n"));
            }
        }

        prompt
    }
}

/// Load the identity file at `path`.
///
/// Missing file → [`Identity::default`] (base identity only). Parse error
/// → warn and fall back to [`Identity::default`]. A file that parses but
/// is entirely empty customization-wise also falls back to base identity
/// behavior through [`Identity::render_prompt`] — this is the source
/// behavior and is preserved deliberately (see `DESIGN.md`).
pub async fn load_identity(path: &Path) -> Identity {
    match fs::read_to_string(path).await {
        Ok(contents) => match serde_yaml::from_str::<Identity>(&contents) {
            Ok(identity) => identity,
            Err(err) => {
                warn!(%err, path = %path.display(), "identity: parse error, using base identity");
                Identity::default()
            }
        },
        Err(_) => Identity::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_identity_renders_base_only() {
        let identity = Identity::default();
        assert_eq!(identity.render_prompt(), BASE_IDENTITY);
        assert!(identity.is_empty());
    }

    #[test]
    fn customized_identity_appends_sections() {
        let identity = Identity {
            name: Some("Kai".into()),
            role: Some("release engineer".into()),
            boundaries: vec!["never force-push main".into()],
            traits: vec!["terse".into(), "direct".into()],
        };
        let prompt = identity.render_prompt();
        assert!(prompt.contains("Your name is Kai."));
        assert!(prompt.contains("release engineer"));
        assert!(prompt.contains("never force-push main"));
        assert!(!identity.is_empty());
    }

    #[tokio::test]
    async fn missing_file_falls_back_to_default() {
        let identity = load_identity(Path::new("/nonexistent/identity.yaml")).await;
        assert!(identity.is_empty());
    }

    #[tokio::test]
    async fn invalid_yaml_falls_back_to_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("identity.yaml");
        fs::write(&path, "name: [unterminated").await.expect("write");
        let identity = load_identity(&path).await;
        assert!(identity.is_empty());
    }
}
