//! Typed wrappers for the scheduler's RPC methods.

use crate::error::CallError;
use crate::session::SessionHandle;
use schedwatch_core::{BuildInformation, ExperimentReference, ExperimentSnapshot, ResourceId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Tail window used by the job output viewer.
pub const DEFAULT_VIEW_POSITION: i64 = -4096;
pub const DEFAULT_VIEW_SIZE: u64 = 4096;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InvalidateRequest {
    pub ids: Vec<ResourceId>,
    #[serde(rename = "keep-done")]
    pub keep_done: bool,
    pub recursive: bool,
    pub restart: bool,
}

impl InvalidateRequest {
    /// Restart request as issued by the job action menu; `done` jobs are only
    /// re-run when `rerun_done` is set.
    pub fn restart(id: ResourceId, rerun_done: bool) -> Self {
        Self {
            ids: vec![id],
            keep_done: !rerun_done,
            recursive: true,
            restart: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ViewFileRequest {
    pub uri: String,
    /// Negative positions count from the end of the file.
    pub position: i64,
    pub size: u64,
}

impl ViewFileRequest {
    pub fn tail(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            position: DEFAULT_VIEW_POSITION,
            size: DEFAULT_VIEW_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl SessionHandle {
    /// Subscribes this connection to push notifications.
    pub async fn listen(&self) -> Result<(), CallError> {
        self.call("listen", json!({})).await.map(|_| ())
    }

    /// Known experiments, most recent first.
    pub async fn latest_experiments(&self) -> Result<Vec<ExperimentReference>, CallError> {
        self.typed_call("experiments.latest-names", json!({})).await
    }

    pub async fn experiment_resources(
        &self,
        identifier: &str,
        timestamp: i64,
    ) -> Result<ExperimentSnapshot, CallError> {
        self.typed_call(
            "experiments.resources",
            json!({"identifier": identifier, "timestamp": timestamp}),
        )
        .await
    }

    pub async fn resource_information(&self, id: &ResourceId) -> Result<Value, CallError> {
        self.call("getResourceInformation", json!({"id": id})).await
    }

    /// Returns the number of invalidated jobs.
    pub async fn invalidate(&self, request: &InvalidateRequest) -> Result<u64, CallError> {
        self.typed_call("invalidate", to_params(request)?).await
    }

    /// The store is updated by the server's removal event, not by this call.
    pub async fn remove(&self, id: &ResourceId, recursive: bool) -> Result<u64, CallError> {
        self.typed_call("remove", json!({"id": id, "recursive": recursive}))
            .await
    }

    pub async fn kill(&self, jobs: &[ResourceId]) -> Result<u64, CallError> {
        self.typed_call("kill", json!({"jobs": jobs})).await
    }

    /// Named filesystem locations of a job.
    pub async fn paths(&self, id: &ResourceId) -> Result<BTreeMap<String, String>, CallError> {
        self.typed_call("paths", json!({"id": id})).await
    }

    pub async fn view_file(&self, request: &ViewFileRequest) -> Result<String, CallError> {
        self.typed_call("view-file", to_params(request)?).await
    }

    pub async fn resource_path(
        &self,
        id: &ResourceId,
        stream: OutputStream,
    ) -> Result<String, CallError> {
        self.typed_call("resource-path", json!({"id": id, "type": stream}))
            .await
    }

    pub async fn build_information(&self) -> Result<BuildInformation, CallError> {
        self.typed_call("buildInformation", json!({})).await
    }

    pub async fn hostname(&self) -> Result<String, CallError> {
        self.typed_call("hostname", json!({})).await
    }

    async fn typed_call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, CallError> {
        let result = self.call(method, params).await?;
        decode_result(method, result)
    }
}

fn to_params<T: Serialize>(params: &T) -> Result<Value, CallError> {
    serde_json::to_value(params).map_err(|err| CallError::Decode(err.to_string()))
}

fn decode_result<T: DeserializeOwned>(method: &str, result: Value) -> Result<T, CallError> {
    serde_json::from_value(result).map_err(|err| CallError::Decode(format!("{method}: {err}")))
}
