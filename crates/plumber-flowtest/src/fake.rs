//! In-memory cluster used by multi-step controller tests
//!
//! Behaves like a tiny API server: creates conflict on existing names, lists
//! honour equality label selectors and status patches merge.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::core::ErrorResponse;
use kube::ResourceExt;

use plumber_common::crd::{FlowStatus, FlowTest, FlowTestStatus};
use plumber_common::{Error, Result};

use crate::client::{KubeClient, OwnedKind};
use crate::pipeline::{PipelineFlow, PipelineKind, PipelineOutput};

type Key = (String, String);
type KindKey = (PipelineKind, String, String);

#[derive(Default)]
struct State {
    flow_tests: BTreeMap<String, FlowTest>,
    pods: BTreeMap<Key, Pod>,
    config_maps: BTreeMap<Key, ConfigMap>,
    services: BTreeMap<Key, Service>,
    flows: BTreeMap<KindKey, PipelineFlow>,
    outputs: BTreeMap<KindKey, PipelineOutput>,
    fail_deletes: bool,
}

#[derive(Default)]
pub struct FakeKube {
    state: Mutex<State>,
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::from(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn key_of<K: ResourceExt>(obj: &K) -> Key {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

fn insert_new<V: Clone>(map: &mut BTreeMap<Key, V>, key: Key, value: &V) -> Result<()> {
    if map.contains_key(&key) {
        return Err(api_error(409, "AlreadyExists", format!("{} already exists", key.1)));
    }
    map.insert(key, value.clone());
    Ok(())
}

fn remove_labeled<V, F>(map: &mut BTreeMap<Key, V>, selector: &str, labels: F) -> usize
where
    F: Fn(&V) -> BTreeMap<String, String>,
{
    let before = map.len();
    map.retain(|_, v| !selector_matches(selector, &labels(v)));
    before - map.len()
}

impl FakeKube {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("fake state mutex poisoned")
    }

    pub fn add_flow_test(&self, ft: FlowTest) {
        self.lock().flow_tests.insert(ft.name_any(), ft);
    }

    pub fn flow_test(&self, name: &str) -> FlowTest {
        self.lock()
            .flow_tests
            .get(name)
            .cloned()
            .expect("flow test should exist in fake")
    }

    pub fn update_flow_test(&self, name: &str, f: impl FnOnce(&mut FlowTest)) {
        let mut state = self.lock();
        let ft = state
            .flow_tests
            .get_mut(name)
            .expect("flow test should exist in fake");
        f(ft);
    }

    pub fn add_pod(&self, pod: Pod) {
        self.lock().pods.insert(key_of(&pod), pod);
    }

    pub fn add_flow(&self, flow: PipelineFlow) {
        let key = (
            flow.kind(),
            flow.namespace().unwrap_or_default(),
            flow.name(),
        );
        self.lock().flows.insert(key, flow);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.lock().fail_deletes = fail;
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.lock().pods.keys().map(|(_, n)| n.clone()).collect()
    }

    pub fn config_map_names(&self) -> Vec<String> {
        self.lock().config_maps.keys().map(|(_, n)| n.clone()).collect()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.lock().services.keys().map(|(_, n)| n.clone()).collect()
    }

    /// Names of every flow carrying a label, i.e. not a hand-made reference
    pub fn slice_flow_names(&self) -> Vec<String> {
        self.lock()
            .flows
            .values()
            .filter(|f| !f.labels().is_empty())
            .map(|f| f.name())
            .collect()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.lock().outputs.values().map(|o| o.name()).collect()
    }

    pub fn outputs(&self) -> Vec<PipelineOutput> {
        self.lock().outputs.values().cloned().collect()
    }
}

#[async_trait]
impl KubeClient for FakeKube {
    async fn patch_status(&self, flow_test: &FlowTest, status: &FlowTestStatus) -> Result<()> {
        let mut state = self.lock();
        let stored = state
            .flow_tests
            .get_mut(&flow_test.name_any())
            .ok_or_else(|| api_error(404, "NotFound", flow_test.name_any()))?;
        let current = stored.status.get_or_insert_with(Default::default);
        if status.status.is_some() {
            current.status = status.status;
        }
        if !status.match_status.is_empty() {
            current.match_status = status.match_status.clone();
        }
        if !status.filter_status.is_empty() {
            current.filter_status = status.filter_status.clone();
        }
        Ok(())
    }

    async fn add_finalizer(&self, flow_test: &FlowTest, finalizer: &str) -> Result<()> {
        let mut state = self.lock();
        let stored = state
            .flow_tests
            .get_mut(&flow_test.name_any())
            .ok_or_else(|| api_error(404, "NotFound", flow_test.name_any()))?;
        let finalizers = stored.metadata.finalizers.get_or_insert_with(Vec::new);
        if !finalizers.iter().any(|f| f == finalizer) {
            finalizers.push(finalizer.to_string());
        }
        Ok(())
    }

    async fn remove_finalizer(&self, flow_test: &FlowTest, finalizer: &str) -> Result<()> {
        let mut state = self.lock();
        if let Some(stored) = state.flow_tests.get_mut(&flow_test.name_any()) {
            if let Some(finalizers) = stored.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != finalizer);
            }
        }
        Ok(())
    }

    async fn list_flow_tests(&self) -> Result<Vec<FlowTest>> {
        Ok(self.lock().flow_tests.values().cloned().collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self
            .lock()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_flow(
        &self,
        kind: PipelineKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PipelineFlow>> {
        Ok(self
            .lock()
            .flows
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        insert_new(&mut self.lock().config_maps, key_of(config_map), config_map)
    }

    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        insert_new(&mut self.lock().pods, key_of(pod), pod)
    }

    async fn create_service(&self, service: &Service) -> Result<()> {
        insert_new(&mut self.lock().services, key_of(service), service)
    }

    async fn create_flow(&self, flow: &PipelineFlow) -> Result<()> {
        let key = (flow.kind(), flow.namespace().unwrap_or_default(), flow.name());
        let mut state = self.lock();
        if state.flows.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", flow.name()));
        }
        state.flows.insert(key, flow.clone());
        Ok(())
    }

    async fn create_output(&self, output: &PipelineOutput) -> Result<()> {
        let kind = match output {
            PipelineOutput::Output(_) => PipelineKind::Flow,
            PipelineOutput::ClusterOutput(_) => PipelineKind::ClusterFlow,
        };
        let key = (kind, output.namespace().unwrap_or_default(), output.name());
        let mut state = self.lock();
        if state.outputs.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", output.name()));
        }
        state.outputs.insert(key, output.clone());
        Ok(())
    }

    async fn list_flows(&self, kind: PipelineKind, selector: &str) -> Result<Vec<PipelineFlow>> {
        Ok(self
            .lock()
            .flows
            .iter()
            .filter(|((k, _, _), f)| *k == kind && selector_matches(selector, f.labels()))
            .map(|(_, f)| f.clone())
            .collect())
    }

    async fn delete_flow(&self, flow: &PipelineFlow) -> Result<()> {
        let mut state = self.lock();
        if state.fail_deletes {
            return Err(api_error(500, "InternalError", "injected".to_string()));
        }
        state
            .flows
            .remove(&(flow.kind(), flow.namespace().unwrap_or_default(), flow.name()));
        Ok(())
    }

    async fn deactivate_flow(&self, flow: &PipelineFlow) -> Result<()> {
        let mut state = self.lock();
        let key = (flow.kind(), flow.namespace().unwrap_or_default(), flow.name());
        let inactive = Some(FlowStatus {
            active: Some(false),
        });
        match state.flows.get_mut(&key) {
            Some(PipelineFlow::Flow(f)) => f.status = inactive,
            Some(PipelineFlow::ClusterFlow(f)) => f.status = inactive,
            None => return Err(api_error(404, "NotFound", flow.name())),
        }
        Ok(())
    }

    async fn delete_labeled(&self, kind: OwnedKind, selector: &str) -> Result<usize> {
        let mut state = self.lock();
        if state.fail_deletes {
            return Err(api_error(500, "InternalError", "injected".to_string()));
        }
        let removed = match kind {
            OwnedKind::Pod => remove_labeled(&mut state.pods, selector, |p| p.labels().clone()),
            OwnedKind::ConfigMap => {
                remove_labeled(&mut state.config_maps, selector, |c| c.labels().clone())
            }
            OwnedKind::Service => {
                remove_labeled(&mut state.services, selector, |s| s.labels().clone())
            }
            OwnedKind::Flow | OwnedKind::ClusterFlow => {
                let wanted = if kind == OwnedKind::Flow {
                    PipelineKind::Flow
                } else {
                    PipelineKind::ClusterFlow
                };
                let before = state.flows.len();
                state
                    .flows
                    .retain(|(k, _, _), f| *k != wanted || !selector_matches(selector, f.labels()));
                before - state.flows.len()
            }
            OwnedKind::Output | OwnedKind::ClusterOutput => {
                let wanted = if kind == OwnedKind::Output {
                    PipelineKind::Flow
                } else {
                    PipelineKind::ClusterFlow
                };
                let before = state.outputs.len();
                state.outputs.retain(|(k, _, _), o| {
                    let labels = match o {
                        PipelineOutput::Output(o) => o.labels().clone(),
                        PipelineOutput::ClusterOutput(o) => o.labels().clone(),
                    };
                    *k != wanted || !selector_matches(selector, &labels)
                });
                before - state.outputs.len()
            }
        };
        Ok(removed)
    }
}
