//! Thin operator client for `dispatchd` (`SPEC_FULL.md` §2: "Thin operator
//! CLI (`dispatch`) talking to the daemon over HTTP"). No business logic
//! lives here; every subcommand is a direct translation to one REST call.

use dispatch_protocol::RunKind;
use dispatch_protocol::SessionSummary;
use dispatch_protocol::Workspace;
use serde_json::Value;

/// Base URL plus bearer token for one daemon.
pub struct DaemonClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl DaemonClient {
    pub fn new(base_url: String, token: String) -> Self {
        DaemonClient {
            http: reqwest::Client::new(),
            base_url,
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn check(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let message = body.get("message").and_then(Value::as_str).unwrap_or("request failed");
        anyhow::bail!("{status}: {message}")
    }

    pub async fn create_session(
        &self,
        kind: RunKind,
        workspace_path: &str,
        metadata: Value,
    ) -> anyhow::Result<SessionSummary> {
        let body = serde_json::json!({
            "kind": kind,
            "workspacePath": workspace_path,
            "metadata": metadata,
        });
        let response = self
            .http
            .post(self.url("/sessions"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn resume_session(&self, session_id: &str) -> anyhow::Result<SessionSummary> {
        let body = serde_json::json!({
            "kind": "claude",
            "workspacePath": "",
            "resume": true,
            "sessionId": session_id,
        });
        let response = self
            .http
            .post(self.url("/sessions"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn list_sessions(&self) -> anyhow::Result<Vec<SessionSummary>> {
        let response = self.http.get(self.url("/sessions")).bearer_auth(&self.token).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn close_session(&self, run_id: &str) -> anyhow::Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/sessions?runId={run_id}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn session_history(&self, run_id: &str, from_seq: i64, limit: i64) -> anyhow::Result<Value> {
        let response = self
            .http
            .get(self.url(&format!("/sessions/{run_id}/history?fromSeq={from_seq}&limit={limit}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn create_workspace(&self, path: &str, name: Option<String>) -> anyhow::Result<Workspace> {
        let body = serde_json::json!({ "path": path, "name": name });
        let response = self
            .http
            .post(self.url("/workspaces"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn list_workspaces(&self) -> anyhow::Result<Vec<Workspace>> {
        let response = self.http.get(self.url("/workspaces")).bearer_auth(&self.token).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn healthz(&self) -> anyhow::Result<Value> {
        let response = self.http.get(self.url("/healthz")).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_base_and_path_without_double_slash() {
        let client = DaemonClient::new("http://127.0.0.1:7777/".to_string(), "tok".to_string());
        assert_eq!(client.url("/sessions"), "http://127.0.0.1:7777/sessions");
    }
}
