use std::fmt;

use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const POLICY_GROUP: &str = "policy.open-cluster-management.io";
pub const CLUSTER_NAMESPACE_LABEL: &str = "policy.open-cluster-management.io/cluster-namespace";
pub const CLUSTER_NAME_LABEL: &str = "policy.open-cluster-management.io/cluster-name";
pub const PARENT_POLICY_LABEL: &str = "policy.open-cluster-management.io/policy";
pub const POLICY_TYPE_LABEL: &str = "policy.open-cluster-management.io/policy-type";

#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[kube(
    group = "policy.open-cluster-management.io",
    version = "v1",
    kind = "Policy",
    plural = "policies",
    namespaced,
    status = "PolicyStatus",
    shortname = "plc"
)]
#[serde(rename_all = "camelCase")]
#[schemars(extend("x-kubernetes-preserve-unknown-fields" = true))]
pub struct PolicySpec {
    /// Default remediation for every template that does not set its own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation_action: Option<RemediationAction>,
    /// A disabled policy has no templates expanded
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, rename = "policy-templates")]
    pub policy_templates: Vec<PolicyTemplate>,
    /// Hub fields this addon does not interpret (dependencies,
    /// copyPolicyMetadata, ...). Replicated and compared like the rest.
    #[serde(flatten)]
    #[schemars(skip)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[schemars(extend("x-kubernetes-preserve-unknown-fields" = true))]
pub struct PolicyTemplate {
    /// Embedded object of any kind
    pub object_definition: RawExtension,
    #[serde(flatten)]
    #[schemars(skip)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RemediationAction {
    #[serde(alias = "Enforce")]
    Enforce,
    #[serde(alias = "Inform")]
    Inform,
}

impl RemediationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemediationAction::Enforce => "enforce",
            RemediationAction::Inform => "inform",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enforce" | "Enforce" => Some(RemediationAction::Enforce),
            "inform" | "Inform" => Some(RemediationAction::Inform),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
pub enum ComplianceState {
    Compliant,
    NonCompliant,
    Pending,
}

impl ComplianceState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Compliant" => Some(ComplianceState::Compliant),
            "NonCompliant" => Some(ComplianceState::NonCompliant),
            "Pending" => Some(ComplianceState::Pending),
            _ => None,
        }
    }
}

impl fmt::Display for ComplianceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComplianceState::Compliant => "Compliant",
            ComplianceState::NonCompliant => "NonCompliant",
            ComplianceState::Pending => "Pending",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    #[serde(default, rename = "compliant", skip_serializing_if = "Option::is_none")]
    pub compliance_state: Option<ComplianceState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<DetailsPerTemplate>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DetailsPerTemplate {
    #[serde(default, rename = "compliant", skip_serializing_if = "Option::is_none")]
    pub compliance_state: Option<ComplianceState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_meta: Option<TemplateMeta>,
    /// Oldest first; the last entry is the current one
    #[serde(default)]
    pub history: Vec<ComplianceHistory>,
}

impl DetailsPerTemplate {
    pub fn last_message(&self) -> Option<&str> {
        self.history.last().map(|h| h.message.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMeta {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceHistory {
    /// RFC 3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
}

impl PolicyStatus {
    /// NonCompliant wins over Pending, Pending over Compliant; unset when no
    /// template reported anything yet.
    pub fn rollup(&self) -> Option<ComplianceState> {
        let states: Vec<ComplianceState> = self
            .details
            .iter()
            .filter_map(|d| d.compliance_state)
            .collect();
        if states.is_empty() {
            None
        } else if states.contains(&ComplianceState::NonCompliant) {
            Some(ComplianceState::NonCompliant)
        } else if states.contains(&ComplianceState::Pending) || states.len() < self.details.len() {
            Some(ComplianceState::Pending)
        } else {
            Some(ComplianceState::Compliant)
        }
    }
}
