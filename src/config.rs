//! Kubeconfig loading and namespace selection.

use std::path::Path;

use kube::config::{KubeConfigOptions, Kubeconfig};

use crate::error::{Error, Result};

/// Reads the kubeconfig from `path`, or from `KUBECONFIG` and the default
/// location when no path is given.
pub fn read_kubeconfig(path: Option<&Path>) -> Result<Kubeconfig> {
    let kubeconfig = match path {
        Some(path) => Kubeconfig::read_from(path),
        None => Kubeconfig::read(),
    };

    kubeconfig.map_err(|e| Error::Kubeconfig(e.to_string()))
}

pub async fn client_config(kubeconfig: Kubeconfig) -> Result<kube::Config> {
    kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::Kubeconfig(e.to_string()))
}

/// The explicit namespace if given, otherwise the current context's.
pub fn resolve_namespace(explicit: Option<String>, kubeconfig: &Kubeconfig) -> Result<String> {
    if let Some(namespace) = explicit.filter(|namespace| !namespace.is_empty()) {
        return Ok(namespace);
    }

    let current = kubeconfig.current_context.as_deref().ok_or_else(|| {
        Error::MissingNamespace("the kubeconfig has no current context".to_string())
    })?;

    let context = kubeconfig
        .contexts
        .iter()
        .find(|context| context.name == current)
        .ok_or_else(|| {
            Error::MissingNamespace(format!(
                "current context {current:?} is not defined in the kubeconfig"
            ))
        })?;

    context
        .context
        .as_ref()
        .and_then(|context| context.namespace.clone())
        .filter(|namespace| !namespace.is_empty())
        .ok_or_else(|| Error::MissingNamespace(format!("context {current:?} sets no namespace")))
}
