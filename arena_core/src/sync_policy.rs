//! Sync Policy Registry - which properties cross the network, and who may predict them.
//!
//! Policy is data, not runtime state. A registry is validated once when the
//! World is built and then shared read-only (`Arc<SyncPolicyRegistry>`) by
//! the server, the replay driver and client-side prediction, so every
//! participant agrees on the networked property set without negotiation.
//!
//! ```text
//!   component kind ──► SyncDescriptor
//!                        ├─ client_predicted   (client may simulate ahead)
//!                        ├─ ignore_prediction  (always take the server value)
//!                        └─ synchronized_properties
//!                             "character" ─► ["health"]
//! ```

use crate::component::ComponentKind;
use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Networking policy for one component type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDescriptor {
    /// An interactive client may apply local commands to these properties
    #[serde(default)]
    pub client_predicted: bool,

    /// Always overwritten from the authoritative snapshot, never predicted
    #[serde(default)]
    pub ignore_prediction: bool,

    /// Component-type name -> ordered list of transmitted property names
    #[serde(default)]
    pub synchronized_properties: BTreeMap<String, Vec<String>>,
}

static LOCAL_ONLY: SyncDescriptor = SyncDescriptor {
    client_predicted: false,
    ignore_prediction: false,
    synchronized_properties: BTreeMap::new(),
};

impl SyncDescriptor {
    /// Synchronizes `properties` of `kind`; no prediction flags set.
    pub fn for_component(kind: ComponentKind, properties: &[&str]) -> Self {
        let mut synchronized_properties = BTreeMap::new();
        synchronized_properties.insert(
            kind.name().to_string(),
            properties.iter().map(|p| p.to_string()).collect(),
        );
        Self {
            client_predicted: false,
            ignore_prediction: false,
            synchronized_properties,
        }
    }

    /// Marks the descriptor as client-predicted.
    pub fn predicted(mut self) -> Self {
        self.client_predicted = true;
        self
    }

    /// Marks the descriptor as always-authoritative.
    pub fn authoritative(mut self) -> Self {
        self.ignore_prediction = true;
        self
    }

    /// True if a client may touch this component locally.
    pub fn allows_prediction(&self) -> bool {
        self.client_predicted && !self.ignore_prediction
    }
}

/// Immutable map from component kind to its [`SyncDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPolicyRegistry {
    descriptors: BTreeMap<ComponentKind, SyncDescriptor>,
}

impl SyncPolicyRegistry {
    /// Starts a new registry.
    pub fn builder() -> SyncPolicyBuilder {
        SyncPolicyBuilder {
            descriptors: BTreeMap::new(),
        }
    }

    /// Validates and builds a registry from `(kind, descriptor)` pairs.
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = (ComponentKind, SyncDescriptor)>,
    ) -> Result<Self> {
        descriptors
            .into_iter()
            .fold(Self::builder(), |builder, (kind, descriptor)| {
                builder.register(kind, descriptor)
            })
            .build()
    }

    /// The registry used by the built-in arena scene.
    ///
    /// Own movement is predicted; hit points and score are the server's alone;
    /// weapons never leave the server.
    pub fn arena_default() -> Self {
        let descriptors = BTreeMap::from([
            (
                ComponentKind::Transform,
                SyncDescriptor::for_component(ComponentKind::Transform, &["pos", "rot"])
                    .predicted(),
            ),
            (
                ComponentKind::Dynamic,
                SyncDescriptor::for_component(ComponentKind::Dynamic, &["speed"]).predicted(),
            ),
            (
                ComponentKind::State,
                SyncDescriptor::for_component(ComponentKind::State, &["state"]).predicted(),
            ),
            (
                ComponentKind::Character,
                SyncDescriptor::for_component(ComponentKind::Character, &["health", "max_health"])
                    .authoritative(),
            ),
            (
                ComponentKind::Score,
                SyncDescriptor::for_component(ComponentKind::Score, &["team", "score"])
                    .authoritative(),
            ),
        ]);
        Self { descriptors }
    }

    /// Returns the descriptor for `kind`. Unregistered kinds are local-only.
    pub fn describe(&self, kind: ComponentKind) -> &SyncDescriptor {
        self.descriptors.get(&kind).unwrap_or(&LOCAL_ONLY)
    }

    /// Ordered list of transmitted properties of `kind` (empty if none).
    pub fn synchronized_properties(&self, kind: ComponentKind) -> &[String] {
        self.describe(kind)
            .synchronized_properties
            .get(kind.name())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_synchronized(&self, kind: ComponentKind, property: &str) -> bool {
        self.synchronized_properties(kind)
            .iter()
            .any(|p| p == property)
    }

    /// True if an interactive client may predict `kind` locally.
    pub fn is_predicted(&self, kind: ComponentKind) -> bool {
        self.describe(kind).allows_prediction()
    }

    /// Iterates over registered descriptors.
    pub fn iter(&self) -> impl Iterator<Item = (&ComponentKind, &SyncDescriptor)> {
        self.descriptors.iter()
    }
}

/// Accumulates descriptors and validates them on [`build`](Self::build).
pub struct SyncPolicyBuilder {
    descriptors: BTreeMap<ComponentKind, SyncDescriptor>,
}

impl SyncPolicyBuilder {
    pub fn register(mut self, kind: ComponentKind, descriptor: SyncDescriptor) -> Self {
        self.descriptors.insert(kind, descriptor);
        self
    }

    /// Validates every descriptor and freezes the registry.
    ///
    /// # Errors
    /// `ConfigurationInvalid` when a descriptor lists another component type,
    /// names a property its component does not have, or repeats a property.
    pub fn build(mut self) -> Result<SyncPolicyRegistry> {
        for (kind, descriptor) in self.descriptors.iter_mut() {
            for (type_name, properties) in &descriptor.synchronized_properties {
                if type_name != kind.name() {
                    return Err(SessionError::config(format!(
                        "descriptor for '{}' lists properties of '{}'",
                        kind, type_name
                    )));
                }
                for (i, property) in properties.iter().enumerate() {
                    if !kind.has_property(property) {
                        return Err(SessionError::config(format!(
                            "'{}' has no property '{}'",
                            kind, property
                        )));
                    }
                    if properties[..i].contains(property) {
                        return Err(SessionError::config(format!(
                            "'{}.{}' listed twice",
                            kind, property
                        )));
                    }
                }
            }

            if descriptor.client_predicted && descriptor.ignore_prediction {
                warn!(component = %kind, "both prediction flags set, ignore_prediction wins");
                descriptor.client_predicted = false;
            }
        }

        Ok(SyncPolicyRegistry {
            descriptors: self.descriptors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_kind_is_local_only() {
        let registry = SyncPolicyRegistry::arena_default();
        let weapon = registry.describe(ComponentKind::Weapon);
        assert!(weapon.synchronized_properties.is_empty());
        assert!(!registry.is_predicted(ComponentKind::Weapon));
        assert!(!registry.is_synchronized(ComponentKind::Weapon, "damage"));
    }

    #[test]
    fn test_arena_default_flags() {
        let registry = SyncPolicyRegistry::arena_default();
        assert!(registry.is_predicted(ComponentKind::Transform));
        assert!(!registry.is_predicted(ComponentKind::Character));
        assert!(registry.describe(ComponentKind::Character).ignore_prediction);
        assert_eq!(
            registry.synchronized_properties(ComponentKind::Character),
            &["health".to_string(), "max_health".to_string()]
        );
        // max_speed is server-local
        assert!(!registry.is_synchronized(ComponentKind::Character, "max_speed"));
    }

    #[test]
    fn test_ignore_prediction_overrides_client_predicted() {
        let registry = SyncPolicyRegistry::builder()
            .register(
                ComponentKind::Score,
                SyncDescriptor::for_component(ComponentKind::Score, &["score"])
                    .predicted()
                    .authoritative(),
            )
            .build()
            .unwrap();

        let descriptor = registry.describe(ComponentKind::Score);
        assert!(descriptor.ignore_prediction);
        assert!(!descriptor.client_predicted);
        assert!(!registry.is_predicted(ComponentKind::Score));
    }

    #[test]
    fn test_unknown_property_is_configuration_error() {
        let result = SyncPolicyRegistry::builder()
            .register(
                ComponentKind::Character,
                SyncDescriptor::for_component(ComponentKind::Character, &["mana"]),
            )
            .build();
        assert!(matches!(result, Err(SessionError::ConfigurationInvalid(_))));
    }

    #[test]
    fn test_foreign_component_key_is_configuration_error() {
        let descriptor = SyncDescriptor::for_component(ComponentKind::Transform, &["pos"]);
        let result = SyncPolicyRegistry::from_descriptors([(ComponentKind::Dynamic, descriptor)]);
        assert!(matches!(result, Err(SessionError::ConfigurationInvalid(_))));
    }

    #[test]
    fn test_duplicate_property_is_configuration_error() {
        let descriptor = SyncDescriptor::for_component(ComponentKind::Transform, &["pos", "pos"]);
        let result = SyncPolicyRegistry::from_descriptors([(ComponentKind::Transform, descriptor)]);
        assert!(result.is_err());
    }
}
