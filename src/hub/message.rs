//! Browser message protocol.
//!
//! Every frame is a JSON object tagged by `type`:
//!
//! - `connected`: handshake accepted
//! - `build`: `{component, success, errors[], duration_ms, cache_hit}`
//! - `removed`: a component disappeared
//! - `reload`: the client should reload everything
//! - `ping`: keep-alive

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::core::{Diagnostic, Priority};
use crate::registry::{BuildSummary, RegistryEvent};

/// Longest error message kept when a frame has to be shrunk.
const TRUNCATED_MESSAGE_LEN: usize = 512;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HubMessage {
    Connected {
        version: String,
    },
    Build {
        component: String,
        success: bool,
        errors: Vec<Diagnostic>,
        duration_ms: u64,
        cache_hit: bool,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        circuit_open: bool,
    },
    Removed {
        component: String,
    },
    Reload {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Ping {
        ts: u64,
    },
}

impl HubMessage {
    pub fn connected() -> Self {
        Self::Connected {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn ping() -> Self {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self::Ping { ts }
    }

    pub fn reload(reason: impl Into<String>) -> Self {
        Self::Reload {
            reason: Some(reason.into()),
        }
    }

    pub fn build(summary: &BuildSummary) -> Self {
        Self::Build {
            component: summary.component.clone(),
            success: summary.success,
            errors: summary.errors.clone(),
            duration_ms: summary.duration.as_millis() as u64,
            cache_hit: summary.cache_hit,
            circuit_open: summary.circuit_open,
        }
    }

    /// The browser-facing message for a registry event, if any. Additions
    /// and updates are announced by the build that follows them.
    pub fn from_event(event: &RegistryEvent) -> Option<Self> {
        match event {
            RegistryEvent::BuildFinished(summary) => Some(Self::build(summary)),
            RegistryEvent::Removed(component) => Some(Self::Removed {
                component: component.name.clone(),
            }),
            RegistryEvent::Cleared => Some(Self::reload("component registry cleared")),
            RegistryEvent::Added(_) | RegistryEvent::Updated { .. } => None,
        }
    }

    /// Failures, reloads and the handshake may overtake everything else and
    /// are never dropped under pressure.
    pub fn priority(&self) -> Priority {
        match self {
            Self::Connected { .. } | Self::Reload { .. } => Priority::Urgent,
            Self::Build { success: false, .. } => Priority::Urgent,
            Self::Build { .. } | Self::Removed { .. } | Self::Ping { .. } => Priority::Normal,
        }
    }

    pub fn component(&self) -> Option<&str> {
        match self {
            Self::Build { component, .. } | Self::Removed { component } => Some(component),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Build { success: false, .. })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Serialize within `max` bytes, shortening error messages and then
    /// dropping trailing errors if needed. `None` if it cannot fit.
    pub fn to_json_within(&self, max: usize) -> Option<String> {
        let json = self.to_json();
        if json.len() <= max {
            return Some(json);
        }

        let mut shrunk = self.clone();
        let Self::Build { errors, .. } = &mut shrunk else {
            return None;
        };
        for error in errors.iter_mut() {
            truncate(&mut error.message, TRUNCATED_MESSAGE_LEN);
        }

        loop {
            let json = shrunk.to_json();
            if json.len() <= max {
                return Some(json);
            }
            let Self::Build { errors, .. } = &mut shrunk else {
                return None;
            };
            if errors.len() <= 1 {
                return None;
            }
            errors.pop();
        }
    }
}

fn truncate(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push('…');
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn failure(errors: usize, len: usize) -> HubMessage {
        HubMessage::build(&BuildSummary {
            component: "ui.Button".into(),
            success: false,
            errors: (0..errors)
                .map(|i| Diagnostic::error(format!("{i}{}", "x".repeat(len))))
                .collect(),
            duration: Duration::from_millis(12),
            cache_hit: false,
            circuit_open: false,
        })
    }

    #[test]
    fn test_build_frame_shape() {
        let json = failure(1, 3).to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "build");
        assert_eq!(value["component"], "ui.Button");
        assert_eq!(value["success"], false);
        assert_eq!(value["errors"][0]["severity"], "error");
        assert_eq!(value["duration_ms"], 12);
        assert!(value.get("circuit_open").is_none());
    }

    #[test]
    fn test_connected_and_reload_frames() {
        let json = HubMessage::connected().to_json();
        assert!(json.starts_with(r#"{"type":"connected","version":"#));
        assert_eq!(
            HubMessage::Reload { reason: None }.to_json(),
            r#"{"type":"reload"}"#
        );
    }

    #[test]
    fn test_priority() {
        assert_eq!(failure(1, 1).priority(), Priority::Urgent);
        assert_eq!(HubMessage::ping().priority(), Priority::Normal);
        assert_eq!(
            HubMessage::Removed {
                component: "A".into()
            }
            .priority(),
            Priority::Normal
        );
    }

    #[test]
    fn test_oversized_frame_is_shrunk() {
        let message = failure(20, 2_000);
        assert!(message.to_json().len() > 4_096);
        let json = message.to_json_within(4_096).unwrap();
        assert!(json.len() <= 4_096);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(!value["errors"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_unshrinkable_frame() {
        assert!(HubMessage::reload("x".repeat(100)).to_json_within(16).is_none());
    }
}
