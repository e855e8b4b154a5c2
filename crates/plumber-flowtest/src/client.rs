//! Kubernetes client abstraction for the FlowTest controller
//!
//! Every API call the controller makes goes through [`KubeClient`] so the
//! state machine can be exercised against mocks and an in-memory cluster.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use plumber_common::crd::{ClusterFlow, ClusterOutput, Flow, FlowTest, FlowTestStatus, Output};
use plumber_common::kube_utils::is_not_found;
use plumber_common::{Error, Result, FIELD_MANAGER};

use crate::pipeline::{PipelineFlow, PipelineKind, PipelineOutput};

/// Kinds of objects the controller creates and later deletes by label
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OwnedKind {
    /// core/v1 Pod
    Pod,
    /// core/v1 ConfigMap
    ConfigMap,
    /// core/v1 Service
    Service,
    /// logging Flow
    Flow,
    /// logging ClusterFlow
    ClusterFlow,
    /// logging Output
    Output,
    /// logging ClusterOutput
    ClusterOutput,
}

impl std::fmt::Display for OwnedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Trait abstracting the Kubernetes operations of the FlowTest controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Merge-patch the status subresource of a FlowTest
    ///
    /// Empty tracking arrays are omitted from the patch and left untouched.
    async fn patch_status(&self, flow_test: &FlowTest, status: &FlowTestStatus) -> Result<()>;

    /// Add a finalizer to a FlowTest (no-op if present)
    async fn add_finalizer(&self, flow_test: &FlowTest, finalizer: &str) -> Result<()>;

    /// Remove a finalizer from a FlowTest (no-op if absent)
    async fn remove_finalizer(&self, flow_test: &FlowTest, finalizer: &str) -> Result<()>;

    /// List every FlowTest in the cluster
    async fn list_flow_tests(&self) -> Result<Vec<FlowTest>>;

    /// Get a Pod, `None` if it does not exist
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Get a Flow or ClusterFlow, `None` if it does not exist
    async fn get_flow(
        &self,
        kind: PipelineKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PipelineFlow>>;

    /// Create a ConfigMap
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<()>;

    /// Create a Pod
    async fn create_pod(&self, pod: &Pod) -> Result<()>;

    /// Create a Service
    async fn create_service(&self, service: &Service) -> Result<()>;

    /// Create a Flow or ClusterFlow
    async fn create_flow(&self, flow: &PipelineFlow) -> Result<()>;

    /// Create an Output or ClusterOutput
    async fn create_output(&self, output: &PipelineOutput) -> Result<()>;

    /// List flows of `kind` in all namespaces matching a label selector
    async fn list_flows(&self, kind: PipelineKind, selector: &str) -> Result<Vec<PipelineFlow>>;

    /// Delete a flow; an already-deleted flow is not an error
    async fn delete_flow(&self, flow: &PipelineFlow) -> Result<()>;

    /// Mark a flow inactive through its status subresource
    async fn deactivate_flow(&self, flow: &PipelineFlow) -> Result<()>;

    /// Delete every object of `kind` matching a label selector, in all namespaces
    ///
    /// Returns how many objects were deleted. Objects vanishing between list
    /// and delete are skipped.
    async fn delete_labeled(&self, kind: OwnedKind, selector: &str) -> Result<usize>;
}

/// Treat a 404 on a list as "nothing there"
///
/// A logging-operator CRD that is not installed answers list calls with 404.
fn missing_as_empty<T>(listed: Result<Vec<T>>, plural: &str) -> Result<Vec<T>> {
    match listed {
        Err(e) if e.is_not_found() => {
            debug!(resource = plural, "resource type not served, nothing to list");
            Ok(Vec::new())
        }
        other => other,
    }
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn flow_tests(&self, flow_test: &FlowTest) -> Result<Api<FlowTest>> {
        let namespace = flow_test.namespace().ok_or_else(|| {
            Error::validation_for(flow_test.name_any(), "FlowTest has no namespace")
        })?;
        Ok(Api::namespaced(self.client.clone(), &namespace))
    }

    async fn set_finalizers(&self, flow_test: &FlowTest, finalizers: Vec<String>) -> Result<()> {
        let api = self.flow_tests(flow_test)?;
        let patch = json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(
            &flow_test.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn create<K>(&self, obj: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned
            + Serialize,
    {
        let namespace = obj
            .namespace()
            .ok_or_else(|| Error::internal_with_context("create", "object has no namespace"))?;
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), obj).await?;
        debug!(kind = %K::kind(&()), name = %obj.name_any(), namespace = %namespace, "created");
        Ok(())
    }

    async fn get_opt<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_all<K>(&self, selector: &str) -> Result<Vec<K>>
    where
        K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let listed = api
            .list(&ListParams::default().labels(selector))
            .await
            .map(|list| list.items)
            .map_err(Error::from);
        missing_as_empty(listed, K::plural(&()).as_ref())
    }

    async fn delete_one<K>(&self, obj: &K) -> Result<bool>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let Some(namespace) = obj.namespace() else {
            return Ok(false);
        };
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        match api.delete(&obj.name_any(), &DeleteParams::default()).await {
            Ok(_) => {
                debug!(
                    kind = %K::kind(&()),
                    name = %obj.name_any(),
                    namespace = %namespace,
                    "deleted"
                );
                Ok(true)
            }
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_matching<K>(&self, selector: &str) -> Result<usize>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let mut deleted = 0;
        for obj in self.list_all::<K>(selector).await? {
            if self.delete_one(&obj).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn patch_flow_status<K>(&self, obj: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let namespace = obj
            .namespace()
            .ok_or_else(|| Error::internal_with_context("deactivate", "flow has no namespace"))?;
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        let patch = json!({"status": {"active": false}});
        api.patch_status(
            &obj.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn patch_status(&self, flow_test: &FlowTest, status: &FlowTestStatus) -> Result<()> {
        let api = self.flow_tests(flow_test)?;
        let patch = json!({ "status": status });
        api.patch_status(
            &flow_test.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn add_finalizer(&self, flow_test: &FlowTest, finalizer: &str) -> Result<()> {
        let current = self.flow_tests(flow_test)?.get(&flow_test.name_any()).await?;
        let mut finalizers = current.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        self.set_finalizers(flow_test, finalizers).await
    }

    async fn remove_finalizer(&self, flow_test: &FlowTest, finalizer: &str) -> Result<()> {
        let current = match self.flow_tests(flow_test)?.get(&flow_test.name_any()).await {
            Ok(ft) => ft,
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let finalizers = current.metadata.finalizers.unwrap_or_default();
        if !finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        let remaining: Vec<String> = finalizers.into_iter().filter(|f| f != finalizer).collect();
        self.set_finalizers(flow_test, remaining).await
    }

    async fn list_flow_tests(&self) -> Result<Vec<FlowTest>> {
        let api: Api<FlowTest> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.get_opt(namespace, name).await
    }

    async fn get_flow(
        &self,
        kind: PipelineKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PipelineFlow>> {
        Ok(match kind {
            PipelineKind::Flow => self
                .get_opt::<Flow>(namespace, name)
                .await?
                .map(PipelineFlow::Flow),
            PipelineKind::ClusterFlow => self
                .get_opt::<ClusterFlow>(namespace, name)
                .await?
                .map(PipelineFlow::ClusterFlow),
        })
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        self.create(config_map).await
    }

    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        self.create(pod).await
    }

    async fn create_service(&self, service: &Service) -> Result<()> {
        self.create(service).await
    }

    async fn create_flow(&self, flow: &PipelineFlow) -> Result<()> {
        match flow {
            PipelineFlow::Flow(f) => self.create(f).await,
            PipelineFlow::ClusterFlow(f) => self.create(f).await,
        }
    }

    async fn create_output(&self, output: &PipelineOutput) -> Result<()> {
        match output {
            PipelineOutput::Output(o) => self.create(o).await,
            PipelineOutput::ClusterOutput(o) => self.create(o).await,
        }
    }

    async fn list_flows(&self, kind: PipelineKind, selector: &str) -> Result<Vec<PipelineFlow>> {
        Ok(match kind {
            PipelineKind::Flow => self
                .list_all::<Flow>(selector)
                .await?
                .into_iter()
                .map(PipelineFlow::Flow)
                .collect(),
            PipelineKind::ClusterFlow => self
                .list_all::<ClusterFlow>(selector)
                .await?
                .into_iter()
                .map(PipelineFlow::ClusterFlow)
                .collect(),
        })
    }

    async fn delete_flow(&self, flow: &PipelineFlow) -> Result<()> {
        match flow {
            PipelineFlow::Flow(f) => self.delete_one(f).await?,
            PipelineFlow::ClusterFlow(f) => self.delete_one(f).await?,
        };
        Ok(())
    }

    async fn deactivate_flow(&self, flow: &PipelineFlow) -> Result<()> {
        match flow {
            PipelineFlow::Flow(f) => self.patch_flow_status(f).await,
            PipelineFlow::ClusterFlow(f) => self.patch_flow_status(f).await,
        }
    }

    async fn delete_labeled(&self, kind: OwnedKind, selector: &str) -> Result<usize> {
        match kind {
            OwnedKind::Pod => self.delete_matching::<Pod>(selector).await,
            OwnedKind::ConfigMap => self.delete_matching::<ConfigMap>(selector).await,
            OwnedKind::Service => self.delete_matching::<Service>(selector).await,
            OwnedKind::Flow => self.delete_matching::<Flow>(selector).await,
            OwnedKind::ClusterFlow => self.delete_matching::<ClusterFlow>(selector).await,
            OwnedKind::Output => self.delete_matching::<Output>(selector).await,
            OwnedKind::ClusterOutput => self.delete_matching::<ClusterOutput>(selector).await,
        }
    }
}
