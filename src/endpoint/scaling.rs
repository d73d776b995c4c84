use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{error, info};

use super::{EndpointManager, HostingPlatform};
use crate::config::{EndpointConfig, ScalingConfig, ScalingTarget};

pub const SERVICE_NAMESPACE: &str = "sagemaker";
pub const SCALABLE_DIMENSION: &str = "sagemaker:variant:DesiredInstanceCount";
pub const METRIC_NAMESPACE: &str = "AWS/SageMaker";

pub const TARGET_TRACKING_POLICY: &str = "AsyncScaleToZeroPolicy";
pub const STEP_POLICY: &str = "HasBacklogWithoutCapacity-ScalingPolicy";
pub const BACKLOG_ALARM: &str = "HasBacklogWithoutCapacity-Alarm";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalableTarget {
    pub resource_id: String,
    pub min_capacity: i32,
    pub max_capacity: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackedMetric {
    Custom {
        metric_name: String,
        namespace: String,
        dimensions: Vec<(String, String)>,
        statistic: String,
    },
    Predefined {
        metric_type: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetTrackingPolicy {
    pub name: String,
    pub metric: TrackedMetric,
    pub target_value: f64,
    pub scale_in_cooldown: Option<Duration>,
    pub scale_out_cooldown: Option<Duration>,
}

/// Bounds are relative to the alarm threshold; `None` is unbounded.
#[derive(Debug, Clone, PartialEq)]
pub struct StepAdjustment {
    pub lower_bound: Option<f64>,
    pub upper_bound: Option<f64>,
    pub scaling_adjustment: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepScalingPolicy {
    pub name: String,
    pub adjustment_type: String,
    pub metric_aggregation_type: String,
    pub cooldown: Duration,
    pub steps: Vec<StepAdjustment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricAlarm {
    pub name: String,
    pub metric_name: String,
    pub namespace: String,
    pub statistic: String,
    pub dimensions: Vec<(String, String)>,
    pub period: Duration,
    pub evaluation_periods: i32,
    pub datapoints_to_alarm: i32,
    pub threshold: f64,
    pub comparison_operator: String,
    pub treat_missing_data: String,
    pub alarm_actions: Vec<String>,
}

/// Autoscaling and alarm operations of the managed platform.
#[async_trait]
pub trait ScalingPlatform: Send + Sync {
    async fn register_scalable_target(&self, target: &ScalableTarget) -> Result<()>;

    async fn put_target_tracking_policy(
        &self,
        target: &ScalableTarget,
        policy: &TargetTrackingPolicy,
    ) -> Result<()>;

    /// Returns the policy ARN, which alarms use as their action.
    async fn put_step_scaling_policy(
        &self,
        target: &ScalableTarget,
        policy: &StepScalingPolicy,
    ) -> Result<String>;

    async fn put_metric_alarm(&self, alarm: &MetricAlarm) -> Result<()>;
}

/// Everything `autoscale` registers, before any call is made.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPlan {
    pub target: ScalableTarget,
    pub tracking: TargetTrackingPolicy,
    /// The alarm's actions are filled in once the step policy ARN is known.
    pub wake_from_zero: Option<(StepScalingPolicy, MetricAlarm)>,
}

impl ScalingPlan {
    pub fn new(endpoint: &EndpointConfig, scaling: &ScalingConfig) -> Self {
        let endpoint_dimension = vec![("EndpointName".to_string(), endpoint.endpoint_name.clone())];

        let (metric, target_value) = match scaling.target {
            ScalingTarget::Backlog { target_value } => (
                TrackedMetric::Custom {
                    metric_name: "ApproximateBacklogSizePerInstance".to_string(),
                    namespace: METRIC_NAMESPACE.to_string(),
                    dimensions: endpoint_dimension.clone(),
                    statistic: "Average".to_string(),
                },
                target_value,
            ),
            ScalingTarget::InvocationsPerInstance { target_value } => (
                TrackedMetric::Predefined {
                    metric_type: "SageMakerVariantInvocationsPerInstance".to_string(),
                },
                target_value,
            ),
        };

        let wake_from_zero = scaling.scale_from_zero.then(|| {
            let policy = StepScalingPolicy {
                name: STEP_POLICY.to_string(),
                adjustment_type: "ChangeInCapacity".to_string(),
                metric_aggregation_type: "Average".to_string(),
                cooldown: scaling.step_cooldown,
                steps: vec![StepAdjustment {
                    lower_bound: Some(0.0),
                    upper_bound: None,
                    scaling_adjustment: 1,
                }],
            };
            let alarm = MetricAlarm {
                name: BACKLOG_ALARM.to_string(),
                metric_name: "HasBacklogWithoutCapacity".to_string(),
                namespace: METRIC_NAMESPACE.to_string(),
                statistic: "Average".to_string(),
                dimensions: endpoint_dimension,
                period: scaling.alarm_period,
                evaluation_periods: scaling.alarm_evaluation_periods,
                datapoints_to_alarm: scaling.alarm_evaluation_periods,
                threshold: 1.0,
                comparison_operator: "GreaterThanOrEqualToThreshold".to_string(),
                treat_missing_data: "missing".to_string(),
                alarm_actions: Vec::new(),
            };
            (policy, alarm)
        });

        Self {
            target: ScalableTarget {
                resource_id: endpoint.resource_id(),
                min_capacity: scaling.min_capacity,
                max_capacity: scaling.max_capacity,
            },
            tracking: TargetTrackingPolicy {
                name: TARGET_TRACKING_POLICY.to_string(),
                metric,
                target_value,
                scale_in_cooldown: scaling.scale_in_cooldown,
                scale_out_cooldown: scaling.scale_out_cooldown,
            },
            wake_from_zero,
        }
    }
}

impl<H: HostingPlatform, A: ScalingPlatform> EndpointManager<H, A> {
    /// Registers the variant as a scalable target and attaches the policies.
    pub async fn autoscale(&self) -> Result<()> {
        let plan = ScalingPlan::new(&self.endpoint, &self.scaling);
        let target = &plan.target;

        self.scaling_platform
            .register_scalable_target(target)
            .await
            .with_context(|| format!("failed to register scalable target {}", target.resource_id))?;
        info!(
            min = target.min_capacity,
            max = target.max_capacity,
            "Registered scalable target {}", target.resource_id
        );

        self.scaling_platform
            .put_target_tracking_policy(target, &plan.tracking)
            .await
            .with_context(|| format!("failed to put scaling policy {}", plan.tracking.name))?;
        info!(target_value = plan.tracking.target_value, "Put scaling policy {}", plan.tracking.name);

        if let Some((policy, mut alarm)) = plan.wake_from_zero {
            let arn = self
                .scaling_platform
                .put_step_scaling_policy(target, &policy)
                .await
                .with_context(|| format!("failed to put scaling policy {}", policy.name))?;
            info!("Put scaling policy {} ({arn})", policy.name);

            alarm.alarm_actions = vec![arn];
            self.scaling_platform
                .put_metric_alarm(&alarm)
                .await
                .with_context(|| format!("failed to put alarm {}", alarm.name))?;
            info!("Put alarm {}", alarm.name);
        }

        Ok(())
    }

    /// Like [`Self::autoscale`], but a failure only leaves autoscaling unconfigured.
    pub async fn autoscale_best_effort(&self) -> bool {
        match self.autoscale().await {
            Ok(()) => true,
            Err(e) => {
                error!("Autoscaling left unconfigured: {e:#}");
                false
            }
        }
    }
}
