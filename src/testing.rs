//! In-memory stand-ins for the cloud services, shared by the unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::endpoint::{
    EndpointConfigSpec, EndpointState, EndpointStatus, HostingPlatform, MetricAlarm, ModelSpec,
    ScalableTarget, ScalingPlatform, StepScalingPolicy, TargetTrackingPolicy,
};
use crate::runtime::{AsyncInvocation, AsyncInvoker};
use crate::storage::{ObjectStore, S3Location, StorageError, StorageResult};

struct StoredObject {
    body: Bytes,
    /// Heads that still report the object missing.
    hidden_for: usize,
}

#[derive(Default)]
struct StoreState {
    objects: HashMap<S3Location, StoredObject>,
    head_calls: usize,
    fail_heads_after: Option<usize>,
    fail_deletes: bool,
    deletes: HashMap<S3Location, usize>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    pub fn get(&self, location: &S3Location) -> Option<Bytes> {
        let state = self.state.lock().unwrap();
        state.objects.get(location).map(|object| object.body.clone())
    }

    pub fn head_calls(&self) -> usize {
        self.state.lock().unwrap().head_calls
    }

    /// Successful deletes of `location`.
    pub fn deletes_of(&self, location: &S3Location) -> usize {
        let state = self.state.lock().unwrap();
        state.deletes.get(location).copied().unwrap_or_default()
    }

    /// Heads after the first `n` fail with something other than "not found".
    pub fn fail_heads_after(&self, n: usize) {
        self.state.lock().unwrap().fail_heads_after = Some(n);
    }

    pub fn fail_deletes(&self) {
        self.state.lock().unwrap().fail_deletes = true;
    }

    /// Stores an object that `head_object` only reports after `misses` lookups.
    pub fn insert_hidden(&self, location: S3Location, body: Bytes, misses: usize) {
        self.state.lock().unwrap().objects.insert(
            location,
            StoredObject {
                body,
                hidden_for: misses,
            },
        );
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_object(
        &self,
        location: &S3Location,
        body: Bytes,
        _content_type: &str,
    ) -> StorageResult<()> {
        self.insert_hidden(location.clone(), body, 0);
        Ok(())
    }

    async fn head_object(&self, location: &S3Location) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        state.head_calls += 1;
        if state
            .fail_heads_after
            .is_some_and(|n| state.head_calls > n)
        {
            return Err(anyhow!("access denied").into());
        }
        match state.objects.get_mut(location) {
            Some(object) if object.hidden_for == 0 => Ok(()),
            Some(object) => {
                object.hidden_for -= 1;
                Err(StorageError::NotFound(location.clone()))
            }
            None => Err(StorageError::NotFound(location.clone())),
        }
    }

    async fn get_object(&self, location: &S3Location) -> StorageResult<Bytes> {
        self.get(location)
            .ok_or_else(|| StorageError::NotFound(location.clone()))
    }

    async fn delete_object(&self, location: &S3Location) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_deletes {
            return Err(anyhow!("delete refused for {location}").into());
        }
        state.objects.remove(location);
        *state.deletes.entry(location.clone()).or_default() += 1;
        Ok(())
    }

    async fn upload_file(&self, path: &Path, location: &S3Location) -> StorageResult<()> {
        let body = tokio::fs::read(path)
            .await
            .map_err(|e| anyhow!("failed to read {}: {e}", path.display()))?;
        self.insert_hidden(location.clone(), Bytes::from(body), 0);
        Ok(())
    }
}

#[derive(Default)]
struct InvokerState {
    calls: Vec<S3Location>,
    timeouts: Vec<Duration>,
}

/// Accepts every invocation; optionally "completes" it by writing the result into a store.
#[derive(Clone, Default)]
pub struct FakeInvoker {
    state: Arc<Mutex<InvokerState>>,
    completion: Option<(MemoryStore, Bytes, usize)>,
}

impl FakeInvoker {
    pub fn completing_with(
        mut self,
        store: MemoryStore,
        body: impl Into<Bytes>,
        misses: usize,
    ) -> Self {
        self.completion = Some((store, body.into(), misses));
        self
    }

    pub fn calls(&self) -> Vec<S3Location> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn timeouts(&self) -> Vec<Duration> {
        self.state.lock().unwrap().timeouts.clone()
    }
}

#[async_trait]
impl AsyncInvoker for FakeInvoker {
    async fn invoke_async(
        &self,
        _endpoint_name: &str,
        input: &S3Location,
        timeout: Duration,
    ) -> Result<AsyncInvocation> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.push(input.clone());
            state.timeouts.push(timeout);
        }

        let inference_id = Uuid::new_v4().to_string();
        let output = S3Location::new("mahitm-genai", format!("sdxl-output/{inference_id}.out"));
        let failure =
            S3Location::new("mahitm-genai", format!("sdxl-failures/{inference_id}-error.out"));
        if let Some((store, body, misses)) = &self.completion {
            store.insert_hidden(output.clone(), body.clone(), *misses);
        }

        Ok(AsyncInvocation {
            inference_id,
            output_location: output,
            failure_location: Some(failure),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostingCall {
    CreateModel(String),
    CreateEndpointConfig(String),
    CreateEndpoint(String),
    DescribeEndpoint(String),
    DeleteEndpoint(String),
    DeleteEndpointConfig(String),
    DeleteModel(String),
}

#[derive(Default)]
struct HostingState {
    calls: Vec<HostingCall>,
    failing: HashSet<HostingCall>,
    statuses: VecDeque<String>,
    endpoint_exists: bool,
    models: Vec<ModelSpec>,
    endpoint_configs: Vec<EndpointConfigSpec>,
}

/// Records hosting calls. `describe_endpoint` replays scripted statuses
/// (`"gone"` meaning no endpoint) and otherwise reflects create/delete calls.
#[derive(Clone, Default)]
pub struct RecordingHosting {
    state: Arc<Mutex<HostingState>>,
}

impl RecordingHosting {
    pub fn calls(&self) -> Vec<HostingCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn fail(&self, call: HostingCall) {
        self.state.lock().unwrap().failing.insert(call);
    }

    pub fn script_statuses<'a>(&self, statuses: impl IntoIterator<Item = &'a str>) {
        let mut state = self.state.lock().unwrap();
        state.statuses.extend(statuses.into_iter().map(String::from));
    }

    pub fn last_model(&self) -> Option<ModelSpec> {
        self.state.lock().unwrap().models.last().cloned()
    }

    pub fn last_endpoint_config(&self) -> Option<EndpointConfigSpec> {
        self.state.lock().unwrap().endpoint_configs.last().cloned()
    }

    fn record(&self, call: HostingCall) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let failing = state.failing.contains(&call);
        state.calls.push(call.clone());
        if failing {
            bail!("{call:?} rejected");
        }
        Ok(())
    }
}

#[async_trait]
impl HostingPlatform for RecordingHosting {
    async fn create_model(&self, model: &ModelSpec) -> Result<()> {
        self.record(HostingCall::CreateModel(model.name.clone()))?;
        self.state.lock().unwrap().models.push(model.clone());
        Ok(())
    }

    async fn create_endpoint_config(&self, config: &EndpointConfigSpec) -> Result<()> {
        self.record(HostingCall::CreateEndpointConfig(config.name.clone()))?;
        self.state.lock().unwrap().endpoint_configs.push(config.clone());
        Ok(())
    }

    async fn create_endpoint(&self, endpoint_name: &str, _config_name: &str) -> Result<()> {
        self.record(HostingCall::CreateEndpoint(endpoint_name.to_string()))?;
        self.state.lock().unwrap().endpoint_exists = true;
        Ok(())
    }

    async fn describe_endpoint(&self, endpoint_name: &str) -> Result<Option<EndpointState>> {
        self.record(HostingCall::DescribeEndpoint(endpoint_name.to_string()))?;
        let mut state = self.state.lock().unwrap();
        let status = match state.statuses.pop_front() {
            Some(status) => status,
            None if state.endpoint_exists => "InService".to_string(),
            None => return Ok(None),
        };
        let endpoint = match status.as_str() {
            "gone" => None,
            "InService" => Some(EndpointState {
                status: EndpointStatus::InService,
                failure_reason: None,
            }),
            "Failed" => Some(EndpointState {
                status: EndpointStatus::Failed,
                failure_reason: Some("image pull failed".to_string()),
            }),
            other => Some(EndpointState {
                status: EndpointStatus::Transitioning(other.to_string()),
                failure_reason: None,
            }),
        };
        Ok(endpoint)
    }

    async fn delete_endpoint(&self, endpoint_name: &str) -> Result<()> {
        self.record(HostingCall::DeleteEndpoint(endpoint_name.to_string()))?;
        self.state.lock().unwrap().endpoint_exists = false;
        Ok(())
    }

    async fn delete_endpoint_config(&self, config_name: &str) -> Result<()> {
        self.record(HostingCall::DeleteEndpointConfig(config_name.to_string()))
    }

    async fn delete_model(&self, model_name: &str) -> Result<()> {
        self.record(HostingCall::DeleteModel(model_name.to_string()))
    }
}

#[derive(Default)]
struct ScalingState {
    fail_registration: bool,
    registered: Vec<ScalableTarget>,
    tracking: Vec<String>,
    steps: Vec<String>,
    alarms: Vec<MetricAlarm>,
}

#[derive(Clone, Default)]
pub struct RecordingScaling {
    state: Arc<Mutex<ScalingState>>,
}

impl RecordingScaling {
    pub fn fail_registration(&self) {
        self.state.lock().unwrap().fail_registration = true;
    }

    pub fn registered(&self) -> Vec<ScalableTarget> {
        self.state.lock().unwrap().registered.clone()
    }

    pub fn tracking_policies(&self) -> Vec<String> {
        self.state.lock().unwrap().tracking.clone()
    }

    pub fn step_policies(&self) -> Vec<String> {
        self.state.lock().unwrap().steps.clone()
    }

    pub fn alarms(&self) -> Vec<MetricAlarm> {
        self.state.lock().unwrap().alarms.clone()
    }
}

#[async_trait]
impl ScalingPlatform for RecordingScaling {
    async fn register_scalable_target(&self, target: &ScalableTarget) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_registration {
            bail!("ValidationException: endpoint {} not found", target.resource_id);
        }
        state.registered.push(target.clone());
        Ok(())
    }

    async fn put_target_tracking_policy(
        &self,
        _target: &ScalableTarget,
        policy: &TargetTrackingPolicy,
    ) -> Result<()> {
        self.state.lock().unwrap().tracking.push(policy.name.clone());
        Ok(())
    }

    async fn put_step_scaling_policy(
        &self,
        _target: &ScalableTarget,
        policy: &StepScalingPolicy,
    ) -> Result<String> {
        self.state.lock().unwrap().steps.push(policy.name.clone());
        Ok(format!("arn:aws:autoscaling:policy/{}", policy.name))
    }

    async fn put_metric_alarm(&self, alarm: &MetricAlarm) -> Result<()> {
        self.state.lock().unwrap().alarms.push(alarm.clone());
        Ok(())
    }
}
