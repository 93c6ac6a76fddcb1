//! Lablet definitions: the immutable specification an instance is stamped from

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ControlError, ControlResult};

/// Unique identifier for a lablet definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DefinitionId(pub Uuid);

impl DefinitionId {
    /// Generate a new definition ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from string
    pub fn parse_str(s: &str) -> ControlResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ControlError::ContractViolation(format!("invalid definition id: {}", e)))
    }
}

impl Default for DefinitionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DefinitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// License kind a worker carries and a definition may require
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseKind {
    Enterprise,
    Education,
    Community,
}

impl std::fmt::Display for LicenseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LicenseKind::Enterprise => "enterprise",
            LicenseKind::Education => "education",
            LicenseKind::Community => "community",
        };
        write!(f, "{}", s)
    }
}

/// Transport kind of an externally exposed port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Udp,
}

/// A named port in the definition's port template.
///
/// The symbolic name is resolved into a concrete integer port at assignment
/// time and substituted into the lab artifact as `${PORT_<NAME>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    pub transport: TransportKind,
}

impl PortSpec {
    /// The placeholder string this port appears as inside lab artifacts.
    pub fn placeholder(&self) -> String {
        format!("${{PORT_{}}}", self.name.to_uppercase())
    }
}

/// Reference to the opaque lab artifact in the object store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub uri: String,
    pub content_hash: String,
}

/// Resource requirements of a single lablet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu_cores: u32,
    pub memory_gib: u32,
    pub storage_gib: u32,
    #[serde(default)]
    pub nested_virt: bool,
    /// Image-family predicate a hosting worker must match, if any
    #[serde(default)]
    pub image_family: Option<String>,
}

/// Reference an instance holds to its definition, pinned at creation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionRef {
    pub name: String,
    pub version: String,
}

impl std::fmt::Display for DefinitionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Immutable specification of a lablet.
///
/// Created by external clients and never mutated; a new semantic version
/// yields a new record. Instances reference a definition by (name, version).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabletDefinition {
    pub id: DefinitionId,
    pub name: String,
    pub version: String,
    pub artifact: ArtifactRef,
    /// Cached artifact content, refreshed by the sync operation
    #[serde(default)]
    pub artifact_content: Option<serde_json::Value>,
    pub resources: ResourceRequirements,
    pub license_affinity: BTreeSet<LicenseKind>,
    pub node_count: u32,
    pub port_template: Vec<PortSpec>,
    #[serde(default)]
    pub grading_ruleset: Option<String>,
    pub max_session_secs: u64,
    #[serde(default)]
    pub warm_pool_depth: u32,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deprecated: bool,
}

impl LabletDefinition {
    /// Reference used by instances to pin this definition.
    pub fn reference(&self) -> DefinitionRef {
        DefinitionRef {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }

    /// Validate structural requirements before the record is accepted.
    pub fn validate(&self) -> ControlResult<()> {
        if self.name.is_empty() {
            return Err(ControlError::ContractViolation(
                "definition name cannot be empty".to_string(),
            ));
        }
        if self.version.is_empty() {
            return Err(ControlError::ContractViolation(
                "definition version cannot be empty".to_string(),
            ));
        }
        if self.license_affinity.is_empty() {
            return Err(ControlError::ContractViolation(format!(
                "definition {} declares no license affinity",
                self.name
            )));
        }
        if self.node_count == 0 {
            return Err(ControlError::ContractViolation(format!(
                "definition {} declares zero nodes",
                self.name
            )));
        }
        let mut seen = BTreeSet::new();
        for port in &self.port_template {
            if !seen.insert(port.name.as_str()) {
                return Err(ControlError::ContractViolation(format!(
                    "duplicate port name {} in definition {}",
                    port.name, self.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> LabletDefinition {
        LabletDefinition {
            id: DefinitionId::new(),
            name: "routing-basics".to_string(),
            version: "1.2.0".to_string(),
            artifact: ArtifactRef {
                uri: "s3://labs/routing-basics-1.2.0.json".to_string(),
                content_hash: "sha256:abcd".to_string(),
            },
            artifact_content: None,
            resources: ResourceRequirements {
                cpu_cores: 4,
                memory_gib: 8,
                storage_gib: 20,
                nested_virt: true,
                image_family: None,
            },
            license_affinity: [LicenseKind::Enterprise].into_iter().collect(),
            node_count: 3,
            port_template: vec![
                PortSpec {
                    name: "serial_1".to_string(),
                    transport: TransportKind::Tcp,
                },
                PortSpec {
                    name: "vnc_1".to_string(),
                    transport: TransportKind::Tcp,
                },
            ],
            grading_ruleset: None,
            max_session_secs: 7200,
            warm_pool_depth: 0,
            owner: "alice".to_string(),
            created_at: Utc::now(),
            deprecated: false,
        }
    }

    #[test]
    fn placeholder_uses_uppercase_port_name() {
        let spec = PortSpec {
            name: "serial_1".to_string(),
            transport: TransportKind::Tcp,
        };
        assert_eq!(spec.placeholder(), "${PORT_SERIAL_1}");
    }

    #[test]
    fn validate_rejects_duplicate_port_names() {
        let mut def = definition();
        def.port_template.push(PortSpec {
            name: "serial_1".to_string(),
            transport: TransportKind::Udp,
        });
        assert!(def.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_definition() {
        assert!(definition().validate().is_ok());
    }
}
