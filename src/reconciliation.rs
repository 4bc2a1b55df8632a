use async_trait::async_trait;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::ConfigMap};
use kube::{Resource, ResourceExt as _};
use tracing::{debug, info, warn};

use crate::{
    cli::ResourceKind,
    cluster::ObjectApi,
    error::{Error, Result},
    transform::{InspectionFailure, Transformer},
};

pub const DEVPOD_SUFFIX: &str = "-devpod";

/// Label and annotation key stamped on everything we create.
pub const MARKER_KEY: &str = "devpod";
pub const MARKER_LABEL: &str = "devpod";
pub const MARKER_ANNOTATION: &str = "Created by devpod";

pub fn devpod_name(name: &str) -> String {
    format!("{name}{DEVPOD_SUFFIX}")
}

/// A source object and the devpod left behind by an earlier run, if any.
pub struct Fetched<K> {
    pub source: K,
    pub existing: Option<K>,
}

/// The devpod object and its scripts, ready to be written.
pub struct Replica<K> {
    pub object: K,
    pub config_map: ConfigMap,
    pub failures: Vec<InspectionFailure>,
    /// Whether a devpod already existed, which decides create vs. update.
    pub existing: bool,
}

/// Outcome of a successful run.
#[derive(Debug)]
pub struct Applied {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
    pub failures: Vec<InspectionFailure>,
}

impl Applied {
    /// A ready-to-paste command that opens a shell in the devpod.
    pub fn exec_command(&self) -> String {
        format!(
            "kubectl exec -it -n {:?} {}/{:?} -- sh",
            self.namespace, self.kind, self.name
        )
    }
}

/// Everything needed to clone one kind of workload. Supporting another kind
/// means adding an implementation, not another branch in the pipeline.
#[async_trait]
pub trait ResourceAdapter: Send + Sync {
    type Object: Resource + Send + Sync;

    fn kind(&self) -> ResourceKind;

    fn namespace(&self) -> &str;

    /// Reads the source object, failing if it does not exist, and the devpod
    /// from a previous run if there is one.
    async fn fetch(&self, name: &str) -> Result<Fetched<Self::Object>>;

    async fn build_replica(
        &self,
        fetched: Fetched<Self::Object>,
        transformer: &Transformer<'_>,
    ) -> Result<Replica<Self::Object>>;

    /// Writes the script config map, then the devpod itself.
    async fn reconcile(&self, replica: Replica<Self::Object>, force: bool)
        -> Result<Self::Object>;
}

/// Runs the whole fetch, build and apply sequence for `name`.
pub async fn create_devpod<A: ResourceAdapter>(
    adapter: &A,
    name: &str,
    transformer: &Transformer<'_>,
    force: bool,
) -> Result<Applied> {
    info!(
        "creating devpod for {} {}/{name}",
        adapter.kind(),
        adapter.namespace()
    );

    let fetched = adapter.fetch(name).await?;
    let mut replica = adapter.build_replica(fetched, transformer).await?;
    let failures = std::mem::take(&mut replica.failures);
    let applied = adapter.reconcile(replica, force).await?;

    Ok(Applied {
        kind: adapter.kind(),
        namespace: adapter.namespace().to_string(),
        name: applied.name_any(),
        failures,
    })
}

pub struct DeploymentAdapter<D, C> {
    deployments: D,
    config_maps: C,
    namespace: String,
}

impl<D, C> DeploymentAdapter<D, C>
where
    D: ObjectApi<Deployment>,
    C: ObjectApi<ConfigMap>,
{
    pub fn new(deployments: D, config_maps: C, namespace: impl Into<String>) -> Self {
        DeploymentAdapter {
            deployments,
            config_maps,
            namespace: namespace.into(),
        }
    }

    async fn reconcile_config_map(&self, mut config_map: ConfigMap) -> Result<()> {
        let name = config_map.name_any();

        let existing = self
            .config_maps
            .get_opt(&name)
            .await
            .map_err(|e| Error::api("check for", "configmap", &self.namespace, &name, e))?;

        match existing {
            Some(existing) => {
                info!("updating configmap {}/{name}", self.namespace);
                config_map.metadata.uid = existing.metadata.uid;
                self.config_maps
                    .replace(&name, &config_map)
                    .await
                    .map_err(|e| Error::api("update", "configmap", &self.namespace, &name, e))?;
            }
            None => {
                info!("creating configmap {}/{name}", self.namespace);
                self.config_maps
                    .create(&config_map)
                    .await
                    .map_err(|e| Error::api("create", "configmap", &self.namespace, &name, e))?;
            }
        }

        Ok(())
    }

    async fn reconcile_deployment(
        &self,
        mut deployment: Deployment,
        existing: bool,
        force: bool,
    ) -> Result<Deployment> {
        let name = deployment.name_any();

        let (verb, result) = if existing {
            info!("updating deployment {}/{name}", self.namespace);
            ("update", self.deployments.replace(&name, &deployment).await)
        } else {
            info!("creating deployment {}/{name}", self.namespace);
            ("create", self.deployments.create(&deployment).await)
        };

        let error = match result {
            Ok(applied) => return Ok(applied),
            Err(error) if !force => {
                return Err(Error::Conflict {
                    verb,
                    namespace: self.namespace.clone(),
                    name,
                    source: error,
                })
            }
            Err(error) => error,
        };

        warn!(
            "failed to {verb} devpod {}/{name} ({error}), \
             removing and re-creating since --force was set",
            self.namespace
        );

        deployment.metadata.uid = None;

        self.deployments
            .delete(&name)
            .await
            .map_err(|e| Error::api("delete", "deployment", &self.namespace, &name, e))?;

        self.deployments
            .create(&deployment)
            .await
            .map_err(|e| Error::api("re-create", "deployment", &self.namespace, &name, e))
    }
}

#[async_trait]
impl<D, C> ResourceAdapter for DeploymentAdapter<D, C>
where
    D: ObjectApi<Deployment>,
    C: ObjectApi<ConfigMap>,
{
    type Object = Deployment;

    fn kind(&self) -> ResourceKind {
        ResourceKind::Deployment
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn fetch(&self, name: &str) -> Result<Fetched<Deployment>> {
        let source = self
            .deployments
            .get_opt(name)
            .await
            .map_err(|e| Error::api("get", "deployment", &self.namespace, name, e))?
            .ok_or_else(|| Error::SourceNotFound {
                kind: "deployment",
                namespace: self.namespace.clone(),
                name: name.to_string(),
            })?;

        let devpod = devpod_name(name);
        let existing = self
            .deployments
            .get_opt(&devpod)
            .await
            .map_err(|e| Error::api("search for", "deployment", &self.namespace, &devpod, e))?;

        match &existing {
            Some(found) => debug!(
                "found existing devpod {}/{devpod} with uid {:?}",
                self.namespace,
                found.uid()
            ),
            None => debug!("no devpod {}/{devpod} yet", self.namespace),
        }

        Ok(Fetched { source, existing })
    }

    async fn build_replica(
        &self,
        fetched: Fetched<Deployment>,
        transformer: &Transformer<'_>,
    ) -> Result<Replica<Deployment>> {
        let name = fetched.source.name_any();
        let mut deployment = devpod_deployment(fetched.source, fetched.existing.as_ref())?;

        let template = deployment
            .spec
            .as_mut()
            .map(|spec| &mut spec.template)
            .ok_or_else(|| Error::NoSelectorLabels {
                kind: "deployment",
                name: name.clone(),
            })?;

        let transformed = transformer
            .transform(
                &template.spec.take().unwrap_or_default(),
                ResourceKind::Deployment,
                &self.namespace,
                &name,
            )
            .await?;
        template.spec = Some(transformed.pod_spec);

        Ok(Replica {
            object: deployment,
            config_map: transformed.config_map,
            failures: transformed.failures,
            existing: fetched.existing.is_some(),
        })
    }

    async fn reconcile(&self, replica: Replica<Deployment>, force: bool) -> Result<Deployment> {
        // The scripts must exist before the pods that mount them.
        self.reconcile_config_map(replica.config_map).await?;
        self.reconcile_deployment(replica.object, replica.existing, force)
            .await
    }
}

/// Renames `source` to its devpod identity and disambiguates its selector so
/// the devpod's pods never match the original's.
///
/// The uid of `existing` is carried over so the object can be updated in
/// place; without one the uid is cleared, which forces a create.
pub fn devpod_deployment(
    mut source: Deployment,
    existing: Option<&Deployment>,
) -> Result<Deployment> {
    let name = source.name_any();
    let no_labels = || Error::NoSelectorLabels {
        kind: "deployment",
        name: name.clone(),
    };

    let metadata = &mut source.metadata;
    metadata.name = Some(devpod_name(&name));
    metadata.uid = existing.and_then(|existing| existing.metadata.uid.clone());
    metadata.resource_version = None;
    metadata.managed_fields = None;
    metadata.creation_timestamp = None;
    metadata.generation = None;
    metadata.self_link = None;
    source.status = None;

    let spec = source.spec.as_mut().ok_or_else(no_labels)?;
    let match_labels = spec
        .selector
        .match_labels
        .as_mut()
        .filter(|labels| !labels.is_empty())
        .ok_or_else(no_labels)?;

    // BTreeMap keys are sorted, so this is the smallest one and stable across runs.
    let (key, value) = match_labels
        .iter()
        .next()
        .map(|(key, value)| (key.clone(), format!("{value}{DEVPOD_SUFFIX}")))
        .ok_or_else(no_labels)?;

    debug!("disambiguating devpod of {name} on selector label {key}={value}");

    match_labels.insert(key.clone(), value.clone());
    match_labels.insert(MARKER_KEY.to_string(), MARKER_LABEL.to_string());

    let template_metadata = spec.template.metadata.get_or_insert_with(Default::default);
    let labels = template_metadata.labels.get_or_insert_with(Default::default);
    labels.insert(key, value);
    labels.insert(MARKER_KEY.to_string(), MARKER_LABEL.to_string());
    template_metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(MARKER_KEY.to_string(), MARKER_ANNOTATION.to_string());

    spec.replicas = Some(1);
    spec.template
        .spec
        .get_or_insert_with(Default::default)
        .termination_grace_period_seconds = Some(1);

    Ok(source)
}
