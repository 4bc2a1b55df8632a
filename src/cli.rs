use std::{fmt, path::PathBuf, str::FromStr};

use clap::Parser;

use crate::{error::Error, registry::DEFAULT_TRANSPORT};

/// Clone a Deployment into a suspended "devpod" you can exec into and debug.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Resource to clone, as `[kind/]name`. The kind defaults to `deployment`.
    pub target: String,

    /// The namespace scope for this request, defaults to the current context's.
    #[arg(short, long, env = "DEVPOD_NAMESPACE")]
    pub namespace: Option<String>,

    /// Path to the kubeconfig file. KUBECONFIG and ~/.kube/config are used if absent.
    #[arg(long, env = "DEVPOD_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Remove an old devpod if it cannot be updated in place.
    #[arg(short, long, env = "DEVPOD_FORCE")]
    pub force: bool,

    /// Transport prefix used when looking up remote container information.
    #[arg(long, env = "DEVPOD_SKOPEO_TRANSPORT", default_value = DEFAULT_TRANSPORT)]
    pub skopeo_transport: String,

    /// Abort instead of continuing when an image cannot be inspected.
    #[arg(long, env = "DEVPOD_STRICT_IMAGES")]
    pub strict_images: bool,
}

/// Kinds of workload that can be turned into a devpod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Deployment,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Deployment => "deployment",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deployment" | "deployments" | "deploy" | "dp" => Ok(ResourceKind::Deployment),
            other => Err(Error::UnrecognizedResource(other.to_string())),
        }
    }
}

/// The positional `[kind/]name` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub kind: ResourceKind,
    pub name: String,
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = match s.split_once('/') {
            Some((kind, name)) => (kind.parse()?, name),
            None => (ResourceKind::Deployment, s),
        };

        if name.is_empty() {
            return Err(Error::MissingName(s.to_string()));
        }

        Ok(Target {
            kind,
            name: name.to_string(),
        })
    }
}
