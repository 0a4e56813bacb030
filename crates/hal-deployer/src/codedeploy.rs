//! CodeDeploy deployment health.
//!
//! Provider failures never escape the checker: they are reported as the
//! `Invalid` sentinel so a poller can keep polling.

use chrono::{DateTime, Utc};
use hal_core::Result;
use hal_core::health::{
    CodeDeployHealth, CodeDeployStatus, Diagnostics, InstanceHealth, InstancesHealth, LifecycleEvent,
};
use hal_executor::aws::{query, query_all, query_str};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::api::CodeDeployApi;
use crate::format::{format_duration, format_time, header_rows, parse_time, render_table};

const SUMMARY_WIDTHS: [usize; 7] = [20, 20, 15, 30, 30, 20, 20];
const SUMMARY_HEADERS: [&str; 7] = [
    "Instance ID",
    "Type",
    "Status",
    "Start Time",
    "End Time",
    "Duration",
    "Most Recent Event",
];
const EVENT_WIDTHS: [usize; 5] = [20, 20, 30, 30, 20];
const EVENT_HEADERS: [&str; 5] = ["Event Name", "Status", "Start", "End", "Duration"];

#[derive(Clone)]
pub struct CodeDeployHealthChecker {
    api: Arc<dyn CodeDeployApi>,
    utc_offset: i32,
}

impl CodeDeployHealthChecker {
    pub fn new(api: Arc<dyn CodeDeployApi>) -> Self {
        Self { api, utc_offset: 0 }
    }

    /// Offset in seconds east of UTC used for rendered timestamps.
    pub fn with_utc_offset(mut self, utc_offset: i32) -> Self {
        self.utc_offset = utc_offset;
        self
    }

    /// Health of the most recent deployment to a group.
    pub async fn last_deployment_health(&self, application: &str, group: &str) -> CodeDeployHealth {
        match self.last_deployment_id(application, group).await {
            Ok(id) => self.deployment_health(&id).await,
            Err(status) => CodeDeployHealth::new(status),
        }
    }

    /// Most recent deployment to a group, with per-instance detail.
    pub async fn last_deployment_instances_health(&self, application: &str, group: &str) -> CodeDeployHealth {
        match self.last_deployment_id(application, group).await {
            Ok(id) => self.deployment_instances_health(&id).await,
            Err(status) => CodeDeployHealth::new(status),
        }
    }

    /// The newest deployment id, or the status to report when there is none.
    async fn last_deployment_id(
        &self,
        application: &str,
        group: &str,
    ) -> std::result::Result<String, CodeDeployStatus> {
        let listing = self.api.list_deployments(application, group).await.map_err(|e| {
            warn!(application, group, error = %e, "Could not list CodeDeploy deployments");
            CodeDeployStatus::Invalid
        })?;

        match query_str(&listing, "$.deployments[0]") {
            Ok(Some(id)) => Ok(id),
            Ok(None) => Err(CodeDeployStatus::Missing),
            Err(_) => Err(CodeDeployStatus::Invalid),
        }
    }

    pub async fn deployment_health(&self, id: &str) -> CodeDeployHealth {
        match self.api.get_deployment(id).await {
            Ok(deployment) => read_deployment(&deployment),
            Err(e) => {
                warn!(deployment = id, error = %e, "Could not read CodeDeploy deployment");
                CodeDeployHealth::new(CodeDeployStatus::Invalid)
            }
        }
    }

    /// Deployment health plus per-instance lifecycle detail.
    ///
    /// Instances are only fetched once the deployment has started. When the
    /// instance calls fail the deployment record is returned without them.
    pub async fn deployment_instances_health(&self, id: &str) -> CodeDeployHealth {
        let mut health = self.deployment_health(id).await;
        if !health.status.has_instances() {
            return health;
        }

        match self.instances(id).await {
            Ok(instances) => health.instances = instances,
            Err(e) => warn!(deployment = id, error = %e, "Could not read CodeDeploy instances"),
        }
        health
    }

    async fn instances(&self, id: &str) -> Result<Option<InstancesHealth>> {
        let listing = self.api.list_deployment_instances(id).await?;
        let ids: Vec<String> = query_all(&listing, "$.instancesList[*]")?
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        if ids.is_empty() {
            return Ok(None);
        }

        let details = self.api.batch_get_deployment_instances(id, &ids).await?;
        let error_message = query_str(&details, "$.errorMessage")?.filter(|m| !m.is_empty());
        let raw = query_all(&details, "$.instancesSummary[*]")?;

        let instances: Vec<InstanceHealth> = raw.iter().map(read_instance).collect();
        let summary = self.render_summary(&instances, error_message.as_deref());
        let detailed = self.render_detailed(&raw, &instances, error_message.as_deref());

        Ok(Some(InstancesHealth {
            ids,
            error_message,
            instances,
            summary,
            detailed,
        }))
    }

    fn render_summary(&self, instances: &[InstanceHealth], error_message: Option<&str>) -> String {
        let mut rows = header_rows(&SUMMARY_HEADERS, &SUMMARY_WIDTHS);
        for instance in instances {
            rows.push(vec![
                instance.short_id.clone(),
                instance.display_type.clone(),
                instance.status.clone(),
                format_time(instance.start, self.utc_offset),
                format_time(instance.end, self.utc_offset),
                instance.duration.clone(),
                instance.last_finished_event.clone().unwrap_or_default(),
            ]);
        }

        let mut output = Vec::new();
        if let Some(err) = error_message {
            output.push(format!("Error message: {err}\n"));
        }
        output.push(render_table(&rows, &SUMMARY_WIDTHS));
        output.join("\n")
    }

    fn render_detailed(&self, raw: &[Value], instances: &[InstanceHealth], error_message: Option<&str>) -> String {
        let mut output = Vec::new();
        if let Some(err) = error_message {
            output.push(format!("Error message: {err}\n"));
        }

        for (raw, instance) in raw.iter().zip(instances) {
            let instance_type = raw
                .get("instanceType")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .unwrap_or("Original");

            let mut rows = header_rows(&EVENT_HEADERS, &EVENT_WIDTHS);
            for event in &instance.events {
                rows.push(vec![
                    event.name.clone(),
                    event.status.clone(),
                    format_time(event.start, self.utc_offset),
                    format_time(event.end, self.utc_offset),
                    event.duration.clone(),
                ]);
            }

            let mut log = format!(
                ">>>> Instance ID: {}\n>>>> Status: {} (Type: {instance_type})\n>>>> Last Update: {}\n\n{}\n",
                instance.id,
                instance.status,
                format_time(instance.last_updated, self.utc_offset),
                render_table(&rows, &EVENT_WIDTHS),
            );
            for event in &instance.events {
                if let Some(d) = &event.diagnostics {
                    log.push_str(&format!(
                        "\n{} event failed! {}\n\nScript: {}\nError Code: {}\n\n{}\n",
                        event.name, d.message, d.script_name, d.error_code, d.log_tail
                    ));
                }
            }
            output.push(log);
        }

        output.join("\n")
    }
}

fn read_deployment(deployment: &Value) -> CodeDeployHealth {
    let status = match query_str(deployment, "$.deploymentInfo.status") {
        Ok(Some(status)) => CodeDeployStatus::from_provider(&status),
        _ => CodeDeployStatus::Invalid,
    };
    CodeDeployHealth {
        status,
        overview: query(deployment, "$.deploymentInfo.deploymentOverview").ok().flatten(),
        error: query(deployment, "$.deploymentInfo.errorInformation").ok().flatten(),
        instances: None,
    }
}

fn text(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn read_event(event: &Value) -> LifecycleEvent {
    let status = text(event, "status").unwrap_or_else(|| "Unknown".to_string());
    let start = parse_time(event.get("startTime"));
    let end = parse_time(event.get("endTime"));

    let diagnostics = (status == "Failed").then(|| {
        let d = event.get("diagnostics").cloned().unwrap_or(Value::Null);
        Diagnostics {
            message: text(&d, "message").unwrap_or_default(),
            script_name: text(&d, "scriptName").unwrap_or_default(),
            error_code: text(&d, "errorCode").unwrap_or_default(),
            log_tail: text(&d, "logTail").unwrap_or_default(),
        }
    });

    LifecycleEvent {
        name: text(event, "lifecycleEventName").unwrap_or_else(|| "Unknown".to_string()),
        status,
        start,
        end,
        duration: format_duration(start, end),
        diagnostics,
    }
}

fn read_instance(instance: &Value) -> InstanceHealth {
    let id = text(instance, "instanceId").unwrap_or_default();
    let short_id = id.rsplit('/').next().unwrap_or_default().to_string();
    let display_type = match instance.get("instanceType").and_then(Value::as_str) {
        Some("Green") => "Replacement (Green)",
        Some(t) if !t.is_empty() => "Original (Blue)",
        _ => "Original",
    };

    let events: Vec<LifecycleEvent> = instance
        .get("lifecycleEvents")
        .and_then(Value::as_array)
        .map(|events| events.iter().map(read_event).collect())
        .unwrap_or_default();

    let last_updated = parse_time(instance.get("lastUpdatedAt"));
    let start: Option<DateTime<Utc>> = events.first().and_then(|e| e.start).or(last_updated);
    let end = events.last().and_then(|e| e.end);
    let last_finished_event = events
        .iter()
        .rev()
        .find(|e| e.status == "Succeeded" || e.status == "Failed")
        .map(|e| e.name.clone());

    InstanceHealth {
        id,
        short_id,
        display_type: display_type.to_string(),
        status: text(instance, "status").unwrap_or_else(|| "Unknown".to_string()),
        last_updated,
        start,
        end,
        duration: format_duration(start, end),
        last_finished_event,
        events,
    }
}
