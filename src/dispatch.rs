//! Dispatch table: routes a queue message's declared `function_type` to a
//! concrete HTTP base URL and shared secret, and performs the outbound call.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::Config;

/// Header carrying the shared secret on trigger calls.
pub const SECRET_HEADER: &str = "x-api-secret";

/// Selects which dispatch entry a message is routed through. Absent on the
/// wire means the default entry.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FunctionType {
    Edge,
    Worker,
}

#[derive(Clone, Debug)]
pub struct Target {
    pub base_url: Url,
    pub secret: String,
}

/// Classified result of one dispatch call. Transport failures are values,
/// not errors, so one message's failure never aborts a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Status(u16),
    TimedOut,
    Unreachable,
    /// No table entry for the message's declared `function_type`.
    NoTarget,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Status(code) if (200..300).contains(code))
    }
}

#[derive(Clone)]
pub struct DispatchTable {
    default: Target,
    worker: Option<Target>,
    timeout: Duration,
}

impl DispatchTable {
    /// Build the table from config. With no configured dispatch URL the
    /// table points back at this service's own trigger endpoints.
    pub fn from_config(config: &Config) -> eyre::Result<Self> {
        let base_url = match &config.dispatch_url {
            Some(url) => url.clone(),
            None => Url::parse(&format!("http://{}", config.listen_addr()))?,
        };

        let default = Target {
            base_url,
            secret: config.api_secret.clone(),
        };

        let worker = config.worker_dispatch_url.as_ref().map(|url| Target {
            base_url: url.clone(),
            secret: config.api_secret.clone(),
        });

        Ok(Self {
            default,
            worker,
            timeout: Duration::from_secs(config.dispatch_timeout_secs()),
        })
    }

    pub fn target(&self, function_type: Option<FunctionType>) -> Option<&Target> {
        match function_type {
            None | Some(FunctionType::Edge) => Some(&self.default),
            Some(FunctionType::Worker) => self.worker.as_ref(),
        }
    }

    /// `POST {base_url}/triggers/{function_name}` with the message payload.
    /// Bounded by the configured deadline; a timeout or connect failure
    /// yields a synthetic failure outcome.
    pub async fn call(
        &self,
        http: &reqwest::Client,
        function_name: &str,
        function_type: Option<FunctionType>,
        payload: &serde_json::Value,
    ) -> DispatchOutcome {
        let Some(target) = self.target(function_type) else {
            tracing::error!(
                function_name,
                ?function_type,
                "no dispatch target configured for function type"
            );
            return DispatchOutcome::NoTarget;
        };

        let url = match target.base_url.join(&format!("triggers/{function_name}")) {
            Ok(url) => url,
            Err(err) => {
                tracing::error!(function_name, %err, "invalid trigger url");
                return DispatchOutcome::Unreachable;
            }
        };

        match http
            .post(url)
            .header(SECRET_HEADER, &target.secret)
            .json(payload)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(res) => DispatchOutcome::Status(res.status().as_u16()),
            Err(err) if err.is_timeout() => DispatchOutcome::TimedOut,
            Err(err) => {
                tracing::warn!(function_name, %err, "dispatch transport failure");
                DispatchOutcome::Unreachable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_classification() {
        assert!(DispatchOutcome::Status(200).is_success());
        assert!(DispatchOutcome::Status(204).is_success());
        assert!(!DispatchOutcome::Status(302).is_success());
        assert!(!DispatchOutcome::Status(500).is_success());
        assert!(!DispatchOutcome::TimedOut.is_success());
        assert!(!DispatchOutcome::Unreachable.is_success());
        assert!(!DispatchOutcome::NoTarget.is_success());
    }

    #[test]
    fn worker_falls_back_to_nothing_when_unconfigured() {
        let table = DispatchTable::from_config(&Config::default()).unwrap();

        assert!(table.target(None).is_some());
        assert!(table.target(Some(FunctionType::Edge)).is_some());
        assert!(table.target(Some(FunctionType::Worker)).is_none());
    }
}
