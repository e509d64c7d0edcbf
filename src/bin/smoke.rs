//! Manual smoke test for the scheduling loop against the in-memory store
//! (§A "Crate shape"). Plans a two-step flow, starts it, and ticks the
//! orchestrator to completion using a dispatcher that always succeeds.
//!
//! Run with: cargo run --bin smoke

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use argyll::bus::InMemoryEventHub;
use argyll::events::FlowEvent;
use argyll::executor::{EventExecutor, ExecutorConfig};
use argyll::memo::LruMemoCache;
use argyll::model::step::{AttributeSpec, AttributeType, HttpConfig, Step, StepType, WorkConfig};
use argyll::model::FlowState;
use argyll::orchestrator::FlowOrchestrator;
use argyll::persistence::InMemoryEventStore;
use argyll::work::{DispatchError, DispatchRequest, StepDispatcher, WorkRunner, WorkerPoolConfig};

struct EchoDispatcher;

#[async_trait]
impl StepDispatcher for EchoDispatcher {
    async fn dispatch(
        &self,
        request: DispatchRequest,
        _timeout: Duration,
    ) -> Result<BTreeMap<String, Value>, DispatchError> {
        tracing::info!(step_id = %request.metadata.step_id, "dispatching");
        let output_name = match request.metadata.step_id.as_str() {
            "fetch" => "out",
            _ => "notified",
        };
        Ok(BTreeMap::from([(output_name.to_string(), Value::String("ok".to_string()))]))
    }
}

fn catalog() -> BTreeMap<String, Step> {
    let fetch = Step {
        id: "fetch".to_string(),
        name: "fetch".to_string(),
        step_type: StepType::Sync {
            http: HttpConfig {
                endpoint: "http://localhost/fetch".to_string(),
                timeout: Duration::from_secs(5),
            },
        },
        attributes: BTreeMap::from([("out".to_string(), AttributeSpec::output(AttributeType::String))]),
        predicate: None,
        work_config: WorkConfig::default(),
        memoizable: false,
        labels: BTreeMap::new(),
    };
    let notify = Step {
        id: "notify".to_string(),
        name: "notify".to_string(),
        step_type: StepType::Sync {
            http: HttpConfig {
                endpoint: "http://localhost/notify".to_string(),
                timeout: Duration::from_secs(5),
            },
        },
        attributes: BTreeMap::from([
            ("out".to_string(), AttributeSpec::required(AttributeType::String)),
            ("notified".to_string(), AttributeSpec::output(AttributeType::String)),
        ]),
        predicate: None,
        work_config: WorkConfig::default(),
        memoizable: false,
        labels: BTreeMap::new(),
    };
    BTreeMap::from([("fetch".to_string(), fetch.clone()), ("notify".to_string(), notify)])
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Ok(path) = dotenvy::dotenv() {
        tracing::info!(?path, "loaded .env");
    }

    let executor_config = ExecutorConfig::from_env();
    let worker_config = WorkerPoolConfig::from_env();

    let hub = Arc::new(InMemoryEventHub::new());
    let executor = Arc::new(EventExecutor::with_config(InMemoryEventStore::new(), executor_config).with_flow_hub(hub.clone()));
    let work_runner = Arc::new(WorkRunner::with_config(
        executor.clone(),
        hub,
        Arc::new(EchoDispatcher),
        Arc::new(LruMemoCache::new(64)),
        worker_config,
    ));
    let orchestrator = FlowOrchestrator::new(executor.clone(), work_runner);

    let catalog = catalog();
    let goals = vec!["notify".to_string()];
    let init = BTreeMap::new();
    let plan = argyll::plan(&goals, &init, &catalog).context("planning the smoke flow failed")?;

    let flow_id = argyll::FlowId::now_v7();
    executor
        .exec_flow(flow_id, || FlowState::new(flow_id, Utc::now()), |_| {
            Ok(vec![FlowEvent::FlowStarted {
                plan: plan.clone(),
                init: init.clone(),
            }])
        })
        .await
        .context("starting the smoke flow failed")?;

    let mut state = FlowState::new(flow_id, Utc::now());
    for tick in 0..10 {
        state = orchestrator
            .tick(flow_id, Utc::now())
            .await
            .context("tick failed")?;
        tracing::info!(tick, status = ?state.status, "ticked flow");
        if state.status.is_terminal() {
            break;
        }
    }

    println!("final status: {:?}", state.status);
    Ok(())
}
