//! Test infrastructure provisioning
//!
//! Creates, in order: the ConfigMap holding the messages to replay, the
//! simulation pod impersonating the reference pod, the shared log aggregator
//! and finally the slices. Names derive from the FlowTest UID, so a second
//! attempt for the same FlowTest collides instead of duplicating resources.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, Pod, PodSpec, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use plumber_common::crd::{FlowTest, FlowTestPhase, FlowTestStatus};
use plumber_common::labels::{aggregator_labels, ownership_labels, Owner};
use plumber_common::{Error, Result, AGGREGATOR_NAME};

use crate::client::KubeClient;
use crate::config::{ControllerConfig, Image};
use crate::pipeline::PipelineKind;
use crate::slicer::{deploy_slices, plan_slices};

/// ConfigMap key holding the replayed lines
pub const SIMULATION_LOG_KEY: &str = "simulation.log";
/// Path the simulator reads its lines from
pub const SIMULATION_LOG_PATH: &str = "/simulation.log";
/// Volume name of the mounted ConfigMap
const CONFIG_VOLUME: &str = "config-volume";
/// `app.kubernetes.io/name` of the simulation pod and its ConfigMap
const SIMULATION_NAME: &str = "pod-simulation";
/// Aggregator container name
const AGGREGATOR_CONTAINER: &str = "log-output";
/// Aggregator listen port
const AGGREGATOR_PORT: i32 = 80;
/// Named aggregator port the Service targets
const AGGREGATOR_PORT_NAME: &str = "http";

/// Name of a FlowTest's ConfigMap
pub fn config_map_name(uid: &str) -> String {
    format!("{uid}-configmap")
}

/// Name of a FlowTest's simulation pod
pub fn simulation_pod_name(uid: &str) -> String {
    format!("{uid}-simulation")
}

/// Replay file content: one message per line, every line newline-terminated
pub fn simulation_log(messages: &[String]) -> String {
    messages.iter().map(|m| format!("{m}\n")).collect()
}

/// Immutable ConfigMap carrying the sent messages
pub fn build_config_map(flow_test: &FlowTest, owner: Owner<'_>) -> ConfigMap {
    let log = simulation_log(&flow_test.spec.sent_messages);
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name(owner.uid)),
            namespace: Some(flow_test.spec.reference_pod.namespace.clone()),
            labels: Some(ownership_labels(SIMULATION_NAME, Some(owner), &[])),
            ..Default::default()
        },
        binary_data: Some(BTreeMap::from([(
            SIMULATION_LOG_KEY.to_string(),
            ByteString(log.into_bytes()),
        )])),
        immutable: Some(true),
        ..Default::default()
    }
}

/// Labels the simulation pod is selected by in filter slices
pub fn simulation_selector_labels(owner: Owner<'_>) -> BTreeMap<String, String> {
    ownership_labels(SIMULATION_NAME, Some(owner), &[])
}

/// Pod replaying the messages under the reference pod's identity
///
/// The container name, node selector and labels are copied so the logging
/// pipeline sees records the way it would see the reference pod's. Only the
/// first container is impersonated.
pub fn build_simulation_pod(
    flow_test: &FlowTest,
    owner: Owner<'_>,
    reference: &Pod,
    image: &Image,
) -> Result<Pod> {
    let reference_spec = reference.spec.as_ref();
    let containers = reference_spec.map(|s| s.containers.as_slice()).unwrap_or_default();
    let Some(first) = containers.first() else {
        return Err(Error::validation_for(
            owner.name,
            format!("reference pod {} has no containers", reference.name_any()),
        ));
    };
    if containers.len() > 1 {
        warn!(
            flowtest = %owner.name,
            pod = %reference.name_any(),
            containers = containers.len(),
            "reference pod has several containers, simulating only the first"
        );
    }

    let labels = ownership_labels(SIMULATION_NAME, Some(owner), &[reference.labels()]);

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(simulation_pod_name(owner.uid)),
            namespace: Some(flow_test.spec.reference_pod.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: first.name.clone(),
                image: Some(image.reference()),
                image_pull_policy: Some(image.pull_policy.clone()),
                command: Some(vec!["pod-simulator".to_string()]),
                args: Some(vec!["-log-dir".to_string(), SIMULATION_LOG_PATH.to_string()]),
                volume_mounts: Some(vec![VolumeMount {
                    name: CONFIG_VOLUME.to_string(),
                    mount_path: SIMULATION_LOG_PATH.to_string(),
                    sub_path: Some(SIMULATION_LOG_KEY.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: CONFIG_VOLUME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: config_map_name(owner.uid),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            node_selector: reference_spec.and_then(|s| s.node_selector.clone()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Shared aggregator pod
pub fn build_aggregator_pod(config: &ControllerConfig) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(AGGREGATOR_NAME.to_string()),
            namespace: Some(config.aggregator_namespace.clone()),
            labels: Some(aggregator_labels(AGGREGATOR_NAME)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: AGGREGATOR_CONTAINER.to_string(),
                image: Some(config.aggregator_image.reference()),
                image_pull_policy: Some(config.aggregator_image.pull_policy.clone()),
                ports: Some(vec![ContainerPort {
                    name: Some(AGGREGATOR_PORT_NAME.to_string()),
                    container_port: AGGREGATOR_PORT,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Service in front of the shared aggregator pod
pub fn build_aggregator_service(config: &ControllerConfig) -> Service {
    let labels = aggregator_labels(AGGREGATOR_NAME);
    Service {
        metadata: ObjectMeta {
            name: Some(AGGREGATOR_NAME.to_string()),
            namespace: Some(config.aggregator_namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some(AGGREGATOR_PORT_NAME.to_string()),
                port: AGGREGATOR_PORT,
                target_port: Some(IntOrString::String(AGGREGATOR_PORT_NAME.to_string())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Treat AlreadyExists as success; the aggregator is shared between tests
fn tolerate_existing(result: Result<()>, what: &str) -> Result<()> {
    match result {
        Err(e) if e.is_already_exists() => {
            debug!(object = what, "shared aggregator object already exists");
            Ok(())
        }
        other => other,
    }
}

/// Create the shared aggregator pod and service
///
/// Creation is attempted unconditionally; losing a creation race to another
/// FlowTest is the expected way of finding it already running.
pub async fn ensure_aggregator(kube: &dyn KubeClient, config: &ControllerConfig) -> Result<()> {
    tolerate_existing(kube.create_pod(&build_aggregator_pod(config)).await, "pod")?;
    tolerate_existing(
        kube.create_service(&build_aggregator_service(config)).await,
        "service",
    )?;
    Ok(())
}

/// Provision everything a FlowTest needs
///
/// On success the returned status holds the freshly allocated tracking
/// arrays, already persisted while the phase was still `Created`.
pub async fn provision(
    flow_test: &FlowTest,
    kube: &dyn KubeClient,
    config: &ControllerConfig,
) -> Result<FlowTestStatus> {
    let name = flow_test.name_any();
    let owner = flow_test
        .owner()
        .ok_or_else(|| Error::validation_for(&name, "FlowTest has no UID yet"))?;
    let kind = PipelineKind::of(flow_test)?;
    let pod_ref = &flow_test.spec.reference_pod;
    let flow_ref = &flow_test.spec.reference_flow;

    let reference_pod = kube
        .get_pod(&pod_ref.namespace, &pod_ref.name)
        .await?
        .ok_or_else(|| {
            Error::validation_for(
                &name,
                format!("reference pod {}/{} not found", pod_ref.namespace, pod_ref.name),
            )
        })?;

    let simulation_pod =
        build_simulation_pod(flow_test, owner, &reference_pod, &config.simulator_image)?;
    kube.create_config_map(&build_config_map(flow_test, owner)).await?;
    kube.create_pod(&simulation_pod).await?;
    ensure_aggregator(kube, config).await?;

    let reference = kube
        .get_flow(kind, &flow_ref.namespace, &flow_ref.name)
        .await?
        .ok_or_else(|| {
            Error::validation_for(
                &name,
                format!("reference {kind} {}/{} not found", flow_ref.namespace, flow_ref.name),
            )
        })?;

    let status = FlowTestStatus::allocated(
        FlowTestPhase::Created,
        reference.matches().len(),
        reference.filters().len(),
    );
    kube.patch_status(flow_test, &status).await?;

    let slices = plan_slices(
        &reference,
        owner,
        &simulation_selector_labels(owner),
        &config.aggregator_base_url(),
    )?;
    deploy_slices(kube, &slices).await?;

    info!(
        flowtest = %name,
        reference = %reference.name(),
        slices = slices.len(),
        "provisioned flow test"
    );
    Ok(status)
}
