//! Rewrites a pod template into sleeping placeholders.
//!
//! Every container keeps its image but runs `sh -c '... sleep infinity'`
//! instead of its real entrypoint. The real invocation is written to a shell
//! script per container, collected in a config map that is mounted at
//! [`SCRIPT_MOUNT_PATH`].

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, PodSpec, Volume, VolumeMount,
};
use kube::core::ObjectMeta;
use tracing::{debug, warn};

use crate::{
    cli::ResourceKind,
    command::{self, DerivedCommand},
    error::{Error, Result},
    registry::{ImageInfo, ImageInspector, InspectError},
};

pub const SCRIPT_VOLUME: &str = "devpod-init";
pub const SCRIPT_MOUNT_PATH: &str = "/devpod";

pub fn config_map_name(name: &str) -> String {
    format!("{name}-devpod-init")
}

fn script_name(index: usize, container: &str) -> String {
    format!("{index}_{container}.sh")
}

/// An image that could not be inspected; its container was rewritten with
/// empty image metadata.
#[derive(Debug)]
pub struct InspectionFailure {
    pub container: String,
    pub image: String,
    pub error: InspectError,
}

#[derive(Debug)]
pub struct Transformed {
    pub pod_spec: PodSpec,
    pub config_map: ConfigMap,
    pub failures: Vec<InspectionFailure>,
}

pub struct Transformer<'a> {
    inspector: &'a dyn ImageInspector,
    transport: &'a str,
    strict: bool,
}

impl<'a> Transformer<'a> {
    /// `transport` is prepended to each container image to form the reference
    /// handed to `inspector`. With `strict`, the first failed inspection aborts.
    pub fn new(inspector: &'a dyn ImageInspector, transport: &'a str, strict: bool) -> Self {
        Transformer {
            inspector,
            transport,
            strict,
        }
    }

    /// Builds the placeholder pod spec and the script config map for the
    /// workload `kind namespace/name`. `pod` itself is left untouched.
    pub async fn transform(
        &self,
        pod: &PodSpec,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Transformed> {
        let config_map_name = config_map_name(name);

        let mut scripts = BTreeMap::new();
        let mut containers = Vec::with_capacity(pod.containers.len());
        let mut failures = Vec::new();

        for (index, container) in pod.containers.iter().enumerate() {
            let image = container.image.clone().unwrap_or_default();

            let reference = format!("{}{image}", self.transport);
            let info = match self.inspector.inspect(&reference).await {
                Ok(info) => info,
                Err(error) if self.strict => {
                    return Err(Error::Inspect {
                        container: container.name.clone(),
                        image,
                        source: error,
                    })
                }
                Err(error) => {
                    warn!(
                        "could not inspect image {image:?} of container {}, \
                         continuing without image defaults: {error}",
                        container.name
                    );
                    failures.push(InspectionFailure {
                        container: container.name.clone(),
                        image,
                        error,
                    });
                    ImageInfo::default()
                }
            };

            let derived = command::derive(
                container.command.as_deref().unwrap_or_default(),
                container.args.as_deref().unwrap_or_default(),
                &info.entrypoint,
                &info.cmd,
            );

            let working_dir = container
                .working_dir
                .as_deref()
                .filter(|dir| !dir.is_empty())
                .or(Some(info.working_dir.as_str()).filter(|dir| !dir.is_empty()));

            let filename = script_name(index, &container.name);
            debug!(
                "container {} runs {:?}, stored as {filename}",
                container.name,
                derived.invocation()
            );

            scripts.insert(filename.clone(), render_script(working_dir, &derived));
            containers.push(placeholder(container, kind, namespace, name, &filename));
        }

        let mut volumes: Vec<Volume> = pod
            .volumes
            .iter()
            .flatten()
            .filter(|volume| volume.name != SCRIPT_VOLUME)
            .cloned()
            .collect();
        volumes.push(Volume {
            name: SCRIPT_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(config_map_name.clone()),
                default_mode: Some(0o755),
                ..ConfigMapVolumeSource::default()
            }),
            ..Volume::default()
        });

        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(config_map_name),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            data: Some(scripts),
            ..Default::default()
        };

        Ok(Transformed {
            pod_spec: PodSpec {
                containers,
                volumes: Some(volumes),
                ..pod.clone()
            },
            config_map,
            failures,
        })
    }
}

/// The generated script: interpreter line, optional `cd`, provenance
/// comments, then the original invocation.
pub fn render_script(working_dir: Option<&str>, derived: &DerivedCommand) -> String {
    let mut script = String::from("#!/bin/sh\n\n");

    if let Some(dir) = working_dir {
        script.push_str(&format!("echo 'Setting WorkingDir via: cd {dir}';\n"));
        script.push_str(&format!("cd {dir};\n\n"));
    }

    for provenance in &derived.provenance {
        script.push_str(&format!("{provenance}\n"));
    }

    script.push_str(&format!("\n{}\n", derived.invocation()));
    script
}

fn banner(kind: ResourceKind, namespace: &str, name: &str, filename: &str) -> String {
    format!(
        r#"echo "Welcome to DEVPOD"
echo "This is a copy of the {kind} {namespace}/{name}"
echo "All it does is just sleep forever and ever"
echo ""
echo "The original entrypoint was combined and placed in: {SCRIPT_MOUNT_PATH}/{filename}"

sleep infinity"#
    )
}

fn placeholder(
    container: &Container,
    kind: ResourceKind,
    namespace: &str,
    name: &str,
    filename: &str,
) -> Container {
    let mut volume_mounts: Vec<VolumeMount> = container
        .volume_mounts
        .iter()
        .flatten()
        .filter(|mount| mount.name != SCRIPT_VOLUME && mount.mount_path != SCRIPT_MOUNT_PATH)
        .cloned()
        .collect();
    volume_mounts.push(VolumeMount {
        name: SCRIPT_VOLUME.to_string(),
        mount_path: SCRIPT_MOUNT_PATH.to_string(),
        read_only: Some(true),
        ..VolumeMount::default()
    });

    Container {
        command: Some(vec!["sh".to_string(), "-c".to_string()]),
        args: Some(vec![banner(kind, namespace, name, filename)]),
        volume_mounts: Some(volume_mounts),
        // Nothing serves the original health checks or hooks while sleeping.
        liveness_probe: None,
        readiness_probe: None,
        startup_probe: None,
        lifecycle: None,
        ..container.clone()
    }
}
