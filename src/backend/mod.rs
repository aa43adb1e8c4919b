//! Remote archives behind one capability set.

pub mod ena;
pub mod ncbi;

use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;

use crate::domain::{Accession, ArchiveSource, Project, Run, Sample};
use crate::error::HarvestError;

pub use ena::EnaBackend;
pub use ncbi::NcbiBackend;

/// What the scheduler hands to one worker for this archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitGranularity {
    /// Each eligible sequence-read file is transferred on its own.
    Files,
    /// The whole run is one unit; the retrieval tool splits files itself.
    Runs,
}

/// Resolution of the accession hierarchy against one archive.
///
/// Implementations never return errors: failures are logged and surface as
/// `None` or an empty list, which callers treat as "nothing found".
pub trait ArchiveBackend: Send + Sync {
    fn source(&self) -> ArchiveSource;

    fn unit_granularity(&self) -> UnitGranularity;

    fn resolve_project(&self, accession: &Accession) -> Option<Project>;

    /// One remote round trip, archive-defined order.
    fn list_samples(&self, project: &Project) -> Vec<Sample>;

    /// One remote round trip, archive-defined order.
    fn list_runs(&self, sample: &Sample) -> Vec<Run>;

    /// Best effort; the same project may appear once per matching keyword.
    fn search(&self, keywords: &[String]) -> Vec<Project>;
}

const BASE_DELAY_MS: u64 = 200;

#[derive(Clone)]
pub(crate) struct HttpSession {
    client: Client,
    archive: &'static str,
    max_retries: u32,
}

impl HttpSession {
    pub(crate) fn new(
        archive: &'static str,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("seqharvest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::http(archive, err))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| HarvestError::http(archive, err))?;
        Ok(Self {
            client,
            archive,
            max_retries,
        })
    }

    pub(crate) fn get_text(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<String, HarvestError> {
        let response = self.send_with_retries(|| self.client.get(url).query(query))?;
        let response = self.handle_status(url, response)?;
        response
            .text()
            .map_err(|err| HarvestError::payload(self.archive, err))
    }

    pub(crate) fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Value, HarvestError> {
        let response = self.send_with_retries(|| self.client.get(url).query(query))?;
        let response = self.handle_status(url, response)?;
        response
            .json()
            .map_err(|err| HarvestError::payload(self.archive, err))
    }

    fn handle_status(&self, url: &str, response: Response) -> Result<Response, HarvestError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        if status == 404 {
            return Err(HarvestError::NotFound(url.to_string()));
        }
        let message = response
            .text()
            .unwrap_or_else(|_| format!("{} request failed", self.archive));
        Err(HarvestError::RemoteStatus {
            archive: self.archive.to_string(),
            status,
            message,
        })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, HarvestError>
    where
        F: FnMut() -> RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < self.max_retries && is_retryable_status(status) {
                        backoff(attempt);
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < self.max_retries && is_retryable_error(&err) {
                        backoff(attempt);
                        attempt += 1;
                        continue;
                    }
                    return Err(HarvestError::http(self.archive, err));
                }
            }
        }
    }
}

fn backoff(attempt: u32) {
    let delay = BASE_DELAY_MS * (u64::from(attempt) + 1);
    thread::sleep(Duration::from_millis(delay));
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

pub(crate) fn parse_count(value: Option<&str>) -> Option<u64> {
    value.and_then(|raw| raw.trim().parse().ok())
}
