use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_applicationautoscaling::error::DisplayErrorContext;
use aws_sdk_applicationautoscaling::types::{
    AdjustmentType, CustomizedMetricSpecification, MetricAggregationType, MetricDimension,
    MetricStatistic, MetricType, PolicyType, PredefinedMetricSpecification, ScalableDimension,
    ServiceNamespace, StepAdjustment, StepScalingPolicyConfiguration,
    TargetTrackingScalingPolicyConfiguration,
};
use aws_sdk_cloudwatch::types::{ComparisonOperator, Dimension, Statistic};

use super::seconds;
use crate::endpoint::{
    MetricAlarm, ScalableTarget, ScalingPlatform, StepScalingPolicy, TargetTrackingPolicy,
    TrackedMetric, SCALABLE_DIMENSION, SERVICE_NAMESPACE,
};

/// Application Auto Scaling for the policies, CloudWatch for the alarm.
#[derive(Clone)]
pub struct AwsScaling {
    autoscaling: aws_sdk_applicationautoscaling::Client,
    cloudwatch: aws_sdk_cloudwatch::Client,
}

impl AwsScaling {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            autoscaling: aws_sdk_applicationautoscaling::Client::new(config),
            cloudwatch: aws_sdk_cloudwatch::Client::new(config),
        }
    }

    async fn put_policy(
        &self,
        target: &ScalableTarget,
        name: &str,
        policy_type: &str,
        tracking: Option<TargetTrackingScalingPolicyConfiguration>,
        step: Option<StepScalingPolicyConfiguration>,
    ) -> Result<String> {
        let output = self
            .autoscaling
            .put_scaling_policy()
            .policy_name(name)
            .service_namespace(ServiceNamespace::from(SERVICE_NAMESPACE))
            .resource_id(&target.resource_id)
            .scalable_dimension(ScalableDimension::from(SCALABLE_DIMENSION))
            .policy_type(PolicyType::from(policy_type))
            .set_target_tracking_scaling_policy_configuration(tracking)
            .set_step_scaling_policy_configuration(step)
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(e)))?;
        let arn: Option<&str> = output.policy_arn().into();
        Ok(arn
            .with_context(|| format!("no ARN returned for policy {name}"))?
            .to_string())
    }
}

fn alarm_dimensions(alarm: &MetricAlarm) -> Vec<Dimension> {
    alarm
        .dimensions
        .iter()
        .map(|(name, value)| Dimension::builder().name(name).value(value).build())
        .collect()
}

#[async_trait]
impl ScalingPlatform for AwsScaling {
    async fn register_scalable_target(&self, target: &ScalableTarget) -> Result<()> {
        self.autoscaling
            .register_scalable_target()
            .service_namespace(ServiceNamespace::from(SERVICE_NAMESPACE))
            .resource_id(&target.resource_id)
            .scalable_dimension(ScalableDimension::from(SCALABLE_DIMENSION))
            .min_capacity(target.min_capacity)
            .max_capacity(target.max_capacity)
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn put_target_tracking_policy(
        &self,
        target: &ScalableTarget,
        policy: &TargetTrackingPolicy,
    ) -> Result<()> {
        let mut config =
            TargetTrackingScalingPolicyConfiguration::builder().target_value(policy.target_value);
        config = match &policy.metric {
            TrackedMetric::Custom {
                metric_name,
                namespace,
                dimensions,
                statistic,
            } => {
                let dimensions = dimensions
                    .iter()
                    .map(|(name, value)| MetricDimension::builder().name(name).value(value).build())
                    .collect::<Result<Vec<_>, _>>()?;
                config.customized_metric_specification(
                    CustomizedMetricSpecification::builder()
                        .metric_name(metric_name)
                        .namespace(namespace)
                        .set_dimensions(Some(dimensions))
                        .statistic(MetricStatistic::from(statistic.as_str()))
                        .build(),
                )
            }
            TrackedMetric::Predefined { metric_type } => config.predefined_metric_specification(
                PredefinedMetricSpecification::builder()
                    .predefined_metric_type(MetricType::from(metric_type.as_str()))
                    .build()?,
            ),
        };
        if let Some(cooldown) = policy.scale_in_cooldown {
            config = config.scale_in_cooldown(seconds(cooldown));
        }
        if let Some(cooldown) = policy.scale_out_cooldown {
            config = config.scale_out_cooldown(seconds(cooldown));
        }

        self.put_policy(target, &policy.name, "TargetTrackingScaling", Some(config.build()?), None)
            .await?;
        Ok(())
    }

    async fn put_step_scaling_policy(
        &self,
        target: &ScalableTarget,
        policy: &StepScalingPolicy,
    ) -> Result<String> {
        let steps = policy
            .steps
            .iter()
            .map(|step| {
                StepAdjustment::builder()
                    .set_metric_interval_lower_bound(step.lower_bound)
                    .set_metric_interval_upper_bound(step.upper_bound)
                    .scaling_adjustment(step.scaling_adjustment)
                    .build()
            })
            .collect::<Result<Vec<_>, _>>()?;
        let config = StepScalingPolicyConfiguration::builder()
            .adjustment_type(AdjustmentType::from(policy.adjustment_type.as_str()))
            .metric_aggregation_type(MetricAggregationType::from(
                policy.metric_aggregation_type.as_str(),
            ))
            .cooldown(seconds(policy.cooldown))
            .set_step_adjustments(Some(steps))
            .build();

        self.put_policy(target, &policy.name, "StepScaling", None, Some(config))
            .await
    }

    async fn put_metric_alarm(&self, alarm: &MetricAlarm) -> Result<()> {
        self.cloudwatch
            .put_metric_alarm()
            .alarm_name(&alarm.name)
            .metric_name(&alarm.metric_name)
            .namespace(&alarm.namespace)
            .statistic(Statistic::from(alarm.statistic.as_str()))
            .set_dimensions(Some(alarm_dimensions(alarm)))
            .period(seconds(alarm.period))
            .evaluation_periods(alarm.evaluation_periods)
            .datapoints_to_alarm(alarm.datapoints_to_alarm)
            .threshold(alarm.threshold)
            .comparison_operator(ComparisonOperator::from(alarm.comparison_operator.as_str()))
            .treat_missing_data(&alarm.treat_missing_data)
            .set_alarm_actions(Some(alarm.alarm_actions.clone()))
            .send()
            .await
            .map_err(|e| anyhow!("{}", aws_sdk_cloudwatch::error::DisplayErrorContext(e)))?;
        Ok(())
    }
}
