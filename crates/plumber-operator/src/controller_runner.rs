//! Controller runner - builds the controller futures the binary drives
//!
//! Returns boxed futures so `main` only has to join them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use plumber_common::crd::FlowTest;
use plumber_flowtest::{error_policy, reconcile, Context, ControllerConfig};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the FlowTest controller future
///
/// Progress between phases is driven by requeues, so only FlowTests are
/// watched.
pub fn build_flowtest_controllers(
    client: Client,
    config: ControllerConfig,
) -> anyhow::Result<Vec<Pin<Box<dyn Future<Output = ()> + Send>>>> {
    let ctx = Arc::new(
        Context::builder(client.clone())
            .config(config)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build controller context: {}", e))?,
    );
    let flow_tests: Api<FlowTest> = Api::all(client);

    tracing::info!("- FlowTest controller");

    Ok(vec![Box::pin(
        Controller::new(
            flow_tests,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("FlowTest")),
    )])
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
