use std::process::ExitCode;

use clap::Parser;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::ConfigMap};
use kube::{Api, Client};
use tracing_subscriber::EnvFilter;

mod cli;
mod cluster;
mod command;
mod config;
mod error;
mod reconciliation;
mod registry;
mod transform;

use cli::{Args, ResourceKind, Target};
use error::{Error, Result};
use reconciliation::{create_devpod, Applied, DeploymentAdapter};
use registry::RegistryInspector;
use transform::Transformer;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("kube_devpod=info")),
        )
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(applied) => {
            for failure in &applied.failures {
                eprintln!(
                    "WARNING: could not inspect image {:?} of container {:?}, \
                     its script only records the pod spec's command: {}",
                    failure.image, failure.container, failure.error
                );
            }

            println!(
                "SUCCESS: Created {}/{}, to access run:",
                applied.namespace, applied.name
            );
            println!(" {}", applied.exec_command());
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("ERROR: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<Applied> {
    let target: Target = args.target.parse()?;

    let kubeconfig = config::read_kubeconfig(args.kubeconfig.as_deref())?;
    let namespace = config::resolve_namespace(args.namespace, &kubeconfig)?;
    let client = Client::try_from(config::client_config(kubeconfig).await?)
        .map_err(|e| Error::Kubeconfig(e.to_string()))?;

    let inspector = RegistryInspector::default();
    let transformer = Transformer::new(&inspector, &args.skopeo_transport, args.strict_images);

    match target.kind {
        ResourceKind::Deployment => {
            let adapter = DeploymentAdapter::new(
                Api::<Deployment>::namespaced(client.clone(), &namespace),
                Api::<ConfigMap>::namespaced(client, &namespace),
                namespace,
            );
            create_devpod(&adapter, &target.name, &transformer, args.force).await
        }
    }
}
