//! Error types for the devpod pipeline.
//!
//! Every step returns [`Result`]; only `main` turns an [`Error`] into a
//! process exit code.

use thiserror::Error;

use crate::registry::InspectError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that abort a devpod run.
#[derive(Debug, Error)]
pub enum Error {
    /// The positional target named a kind we cannot clone.
    #[error("unrecognized resource type: {0:?}, see --help for info. Only standard kubernetes types are supported")]
    UnrecognizedResource(String),

    #[error("missing resource name in target {0:?}")]
    MissingName(String),

    /// Kubeconfig could not be read or turned into a client configuration.
    #[error("failed to load kubeconfig: {0}")]
    Kubeconfig(String),

    #[error("no namespace given and {0}")]
    MissingNamespace(String),

    /// The source object does not exist; there is nothing to clone.
    #[error("unable to find {kind} {name:?} in namespace {namespace:?}, cannot create devpod")]
    SourceNotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    /// Any cluster read or write that is not an expected not-found.
    #[error("failed to {action} {kind} {name:?} in namespace {namespace:?}: {source}")]
    Api {
        action: &'static str,
        kind: &'static str,
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    /// The devpod exists and could not be updated, and `--force` was not given.
    #[error("failed to {verb} devpod {name:?} in namespace {namespace:?}: {source}\nYou can use --force to delete it and re-create")]
    Conflict {
        verb: &'static str,
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("{kind} {name:?} has no selector match-labels to disambiguate the devpod with")]
    NoSelectorLabels { kind: &'static str, name: String },

    /// Image inspection failed while `--strict-images` was set.
    #[error("failed to inspect image {image:?} of container {container:?}: {source}")]
    Inspect {
        container: String,
        image: String,
        #[source]
        source: InspectError,
    },
}

impl Error {
    pub(crate) fn api(
        action: &'static str,
        kind: &'static str,
        namespace: &str,
        name: &str,
        source: kube::Error,
    ) -> Self {
        Error::Api {
            action,
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
            source,
        }
    }
}

/// True for a `404` answer from the API server.
pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}
