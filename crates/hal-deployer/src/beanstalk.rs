//! Elastic Beanstalk environment health.

use hal_core::health::{BeanstalkEnvironmentHealth, BeanstalkHealth, BeanstalkStatus};
use hal_executor::aws::{query, query_str};
use std::sync::Arc;
use tracing::warn;

use crate::api::ElasticBeanstalkApi;

#[derive(Clone)]
pub struct BeanstalkHealthChecker {
    api: Arc<dyn ElasticBeanstalkApi>,
}

impl BeanstalkHealthChecker {
    pub fn new(api: Arc<dyn ElasticBeanstalkApi>) -> Self {
        Self { api }
    }

    /// Status and health color of one environment.
    ///
    /// An environment the provider does not report is `Missing`; a failed
    /// call is `Unknown`. Both come back with a `Grey` health.
    pub async fn environment_health(&self, application: &str, environment: &str) -> BeanstalkEnvironmentHealth {
        let response = match self.api.describe_environments(application, environment).await {
            Ok(response) => response,
            Err(e) => {
                warn!(application, environment, error = %e, "Could not describe Elastic Beanstalk environment");
                return grey(BeanstalkStatus::Unknown);
            }
        };

        match query(&response, "$.Environments[0]") {
            Ok(Some(env)) => BeanstalkEnvironmentHealth {
                status: query_str(&env, "$.Status")
                    .ok()
                    .flatten()
                    .map(|s| BeanstalkStatus::from_provider(&s))
                    .unwrap_or(BeanstalkStatus::Unknown),
                health: query_str(&env, "$.Health")
                    .ok()
                    .flatten()
                    .map(|h| BeanstalkHealth::from_provider(&h))
                    .unwrap_or(BeanstalkHealth::Grey),
            },
            Ok(None) => grey(BeanstalkStatus::Missing),
            Err(_) => grey(BeanstalkStatus::Unknown),
        }
    }
}

fn grey(status: BeanstalkStatus) -> BeanstalkEnvironmentHealth {
    BeanstalkEnvironmentHealth {
        status,
        health: BeanstalkHealth::Grey,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hal_core::{Error, Result};
    use serde_json::{Value, json};

    struct FakeBeanstalk(Option<Value>);

    #[async_trait]
    impl ElasticBeanstalkApi for FakeBeanstalk {
        async fn describe_environments(&self, _application: &str, _environment: &str) -> Result<Value> {
            self.0.clone().ok_or_else(|| Error::Provider("InvalidClientTokenId".to_string()))
        }

        async fn create_application_version(
            &self,
            _application: &str,
            _label: &str,
            _bucket: &str,
            _key: &str,
            _description: &str,
        ) -> Result<Value> {
            Ok(Value::Null)
        }

        async fn update_environment(&self, _application: &str, _environment: &str, _label: &str) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    async fn health(response: Option<Value>) -> BeanstalkEnvironmentHealth {
        BeanstalkHealthChecker::new(Arc::new(FakeBeanstalk(response)))
            .environment_health("app", "e-abc123")
            .await
    }

    #[tokio::test]
    async fn test_ready_environment() {
        let h = health(Some(json!({"Environments": [{"Status": "Ready", "Health": "Green"}]}))).await;
        assert!(h.is_ready());
    }

    #[tokio::test]
    async fn test_missing_environment() {
        let h = health(Some(json!({"Environments": []}))).await;
        assert_eq!(h.status, BeanstalkStatus::Missing);
        assert_eq!(h.health, BeanstalkHealth::Grey);
    }

    #[tokio::test]
    async fn test_provider_error_is_unknown() {
        let h = health(None).await;
        assert_eq!(h.status, BeanstalkStatus::Unknown);
        assert_eq!(h.health, BeanstalkHealth::Grey);
    }

    #[tokio::test]
    async fn test_partial_record_defaults() {
        let h = health(Some(json!({"Environments": [{"Status": "Updating"}]}))).await;
        assert_eq!(h.status, BeanstalkStatus::Updating);
        assert_eq!(h.health, BeanstalkHealth::Grey);
    }
}
