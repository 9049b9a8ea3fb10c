use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("duplicate names used for templates in the policy")]
    DuplicateTemplateNames,
    #[error("invalid policy template: {0}")]
    InvalidTemplate(String),
    #[error("policy template kind {kind} in group {group} is not an expected policy template kind")]
    UnrecognizedTemplateKind { group: String, kind: String },
    #[error("the resource version was not found: {gvk}: {source}")]
    NoVersionedResource {
        gvk: String,
        #[source]
        source: Box<ReconcileError>,
    },
    #[error(
        "an unexpected error occurred while filling in default fields for the {kind}: {source}"
    )]
    Defaulting {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("reconcile canceled")]
    Canceled,
    #[error("status sync channel closed")]
    StatusSyncClosed,
    #[error("{}", join_errors(.0))]
    Aggregate(Vec<ReconcileError>),
}

impl ReconcileError {
    /// True for a 404 from the API server or a store reporting the object missing.
    pub fn is_not_found(&self) -> bool {
        match self {
            ReconcileError::NotFound(_) => true,
            ReconcileError::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, ReconcileError::Canceled)
    }

    /// Joins collected errors; a single error is returned as-is.
    pub fn aggregate(mut errs: Vec<ReconcileError>) -> Option<ReconcileError> {
        match errs.len() {
            0 => None,
            1 => errs.pop(),
            _ => Some(ReconcileError::Aggregate(errs)),
        }
    }
}

fn join_errors(errs: &[ReconcileError]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
