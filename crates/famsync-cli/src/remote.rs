//! JSON-over-HTTP adapter for the shared document store.

use std::time::Duration;

use famsync_core::{format_rfc3339, CursorField, FamsyncError};
use famsync_sync::{RemoteDocument, RemotePath, RemoteStore, SyncResult};
use time::OffsetDateTime;
use tracing::debug;

/// `PUT <base>/<path>/<id>` stores a document; `GET <base>/<path>` with
/// `field` and `after` query parameters lists newer ones.
pub struct HttpRemoteStore {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpRemoteStore {
    #[must_use]
    pub fn new(base_url: &str, timeout_ms: u64) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(timeout_ms))
            .build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
        }
    }

    fn collection_url(&self, path: &RemotePath) -> String {
        format!("{}/{path}", self.base_url)
    }
}

fn http_failure(method: &str, url: &str, err: ureq::Error) -> FamsyncError {
    match err {
        ureq::Error::Status(code, _) => {
            FamsyncError::SyncFailure(format!("{method} {url} returned http status {code}"))
        }
        ureq::Error::Transport(err) => {
            FamsyncError::SyncFailure(format!("http transport failure for {method} {url}: {err}"))
        }
    }
}

impl RemoteStore for HttpRemoteStore {
    fn set_document(&self, path: &RemotePath, document: &RemoteDocument) -> SyncResult<()> {
        let url = format!("{}/{}", self.collection_url(path), document.id);
        self.agent
            .request("PUT", &url)
            .set("content-type", "application/json")
            .send_json(document)
            .map_err(|err| http_failure("PUT", &url, err))?;
        debug!(url = %url, "stored remote document");
        Ok(())
    }

    fn query_after(
        &self,
        path: &RemotePath,
        field: CursorField,
        after: OffsetDateTime,
    ) -> SyncResult<Vec<RemoteDocument>> {
        let url = self.collection_url(path);
        let after = format_rfc3339(after)?;
        let response = self
            .agent
            .request("GET", &url)
            .query("field", field.as_str())
            .query("after", &after)
            .call()
            .map_err(|err| http_failure("GET", &url, err))?;
        let documents: Vec<RemoteDocument> = response.into_json().map_err(|err| {
            FamsyncError::SyncFailure(format!("invalid document list from {url}: {err}"))
        })?;
        debug!(url = %url, count = documents.len(), "queried remote documents");
        Ok(documents)
    }
}
