use crate::{error::JobError, scheduler::ScheduledJob};
use async_trait::async_trait;
use reqwest::Client;
use smol_str::SmolStr;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Default per-request timeout of an [`HttpRefreshJob`].
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(60);

/// Periodic upstream refresh: a GET of a fixed URL whose response body is ignored.
///
/// A non-success status is an application error; failing to get a response at all is
/// unexpected.
#[derive(Debug, Clone)]
pub struct HttpRefreshJob {
    name: SmolStr,
    url: Url,
    query: Vec<(String, String)>,
    timeout: Duration,
    client: Client,
}

impl HttpRefreshJob {
    pub fn new(name: impl Into<SmolStr>, url: Url) -> Self {
        Self {
            name: name.into(),
            url,
            query: Vec::new(),
            timeout: DEFAULT_REFRESH_TIMEOUT,
            client: Client::new(),
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl ScheduledJob for HttpRefreshJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> Result<(), JobError> {
        debug!(job = %self.name, url = %self.url, "sending refresh request");

        let response = self
            .client
            .get(self.url.clone())
            .query(&self.query)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|error| JobError::Unexpected(format!("request failed: {error}")))?;

        if let Err(error) = response.error_for_status_ref() {
            return Err(JobError::App(format!("refresh rejected: {error}")));
        }

        info!(job = %self.name, status = %response.status(), "refresh completed");
        Ok(())
    }
}
