//! Which embedded template kinds the addon is willing to expand.

use std::collections::BTreeMap;

use crate::crds::policy::{POLICY_GROUP, POLICY_TYPE_LABEL};

pub const GATEKEEPER_TEMPLATES_GROUP: &str = "templates.gatekeeper.sh";
pub const GATEKEEPER_CONSTRAINTS_GROUP: &str = "constraints.gatekeeper.sh";

/// (group, kind); an empty kind admits every kind in the group.
const POLICY_ALLOW_LIST: &[(&str, &str)] = &[
    (GATEKEEPER_TEMPLATES_GROUP, "ConstraintTemplate"),
    (GATEKEEPER_CONSTRAINTS_GROUP, ""),
];

/// Kinds the platform used to host and no longer does.
const REMOVED_KINDS: &[(&str, &str)] = &[(POLICY_GROUP, "IamPolicy")];

pub fn is_allowed_policy(group: &str, kind: &str) -> bool {
    POLICY_ALLOW_LIST
        .iter()
        .any(|(g, k)| *g == group && (k.is_empty() || *k == kind))
}

pub fn is_removed_kind(group: &str, kind: &str) -> bool {
    REMOVED_KINDS.iter().any(|(g, k)| *g == group && *k == kind)
}

/// Policy CRDs in the policy group carry `policy-type=template` and are
/// accepted without an allow-list entry; an object may also carry the label
/// itself.
pub fn has_template_marker(group: &str, labels: Option<&BTreeMap<String, String>>) -> bool {
    group == POLICY_GROUP
        || labels
            .and_then(|l| l.get(POLICY_TYPE_LABEL))
            .is_some_and(|v| v == "template")
}

/// Allowed when the kind is allow-listed or carries the template marker.
pub fn classify(group: &str, kind: &str, labels: Option<&BTreeMap<String, String>>) -> bool {
    is_allowed_policy(group, kind) || has_template_marker(group, labels)
}
