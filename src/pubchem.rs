use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::domain::sanitize_with_fallback;
use crate::error::GrimError;
use crate::retry::RetryPolicy;

const PUG_REST_BASE: &str = "https://pubchem.ncbi.nlm.nih.gov/rest/pug/compound";
const FILENAME_FALLBACK: &str = "unknown_compound";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(PathBuf),
    NotFound,
}

/// Structure source keyed by compound name.
pub trait StructureRegistry: Send + Sync {
    /// Downloads the best available SDF for `name` into `destination`.
    fn lookup(&self, name: &str, destination: &Path) -> Result<Lookup, GrimError>;
    fn exists(&self, name: &str) -> Result<bool, GrimError>;
}

#[derive(Debug, Deserialize)]
struct CidResponse {
    #[serde(rename = "IdentifierList")]
    identifier_list: Option<IdentifierList>,
}

#[derive(Debug, Deserialize)]
struct IdentifierList {
    #[serde(rename = "CID", default)]
    cid: Vec<u64>,
}

/// Four tries in all, 200 ms apart and doubling.
fn default_http_retry() -> RetryPolicy {
    RetryPolicy::new(4, Duration::from_millis(200), 2.0)
}

#[derive(Clone)]
pub struct PubchemHttpClient {
    client: Client,
    base: String,
    retry: RetryPolicy,
}

impl PubchemHttpClient {
    pub fn new() -> Result<Self, GrimError> {
        Self::with_base(PUG_REST_BASE)
    }

    pub fn with_base(base: &str) -> Result<Self, GrimError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("grimperium/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| GrimError::PubchemHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| GrimError::PubchemHttp(err.to_string()))?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            retry: default_http_retry(),
        })
    }

    /// Policy for busy responses (429, 5xx) and connection errors.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn cids_url(&self, name: &str) -> Result<Url, GrimError> {
        self.url(&["name", name, "cids", "JSON"])
    }

    pub fn sdf_url(&self, cid: u64, record_type: &str) -> Result<Url, GrimError> {
        let mut url = self.url(&["cid", &cid.to_string(), "SDF"])?;
        url.query_pairs_mut().append_pair("record_type", record_type);
        Ok(url)
    }

    fn url(&self, segments: &[&str]) -> Result<Url, GrimError> {
        let mut url =
            Url::parse(&self.base).map_err(|err| GrimError::PubchemHttp(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| GrimError::PubchemHttp(format!("invalid base url {}", self.base)))?
            .extend(segments);
        Ok(url)
    }

    /// Compound ids matching `name`, best match first. Empty when PubChem
    /// knows no such name.
    pub fn cids(&self, name: &str) -> Result<Vec<u64>, GrimError> {
        let url = self.cids_url(name)?;
        let response = self.send_with_retries(|| self.client.get(url.clone()))?;
        if response.status().as_u16() == 404 {
            debug!(name, "no compound ids");
            return Ok(Vec::new());
        }
        let response = Self::handle_status(response)?;
        let body: CidResponse = response
            .json()
            .map_err(|err| GrimError::PubchemHttp(err.to_string()))?;
        Ok(body
            .identifier_list
            .map(|list| list.cid)
            .unwrap_or_default())
    }

    fn fetch_sdf(&self, cid: u64, record_type: &str) -> Result<Option<String>, GrimError> {
        let url = self.sdf_url(cid, record_type)?;
        let response = self.send_with_retries(|| self.client.get(url.clone()))?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let response = Self::handle_status(response)?;
        let text = response
            .text()
            .map_err(|err| GrimError::PubchemHttp(err.to_string()))?;
        Ok((!text.trim().is_empty()).then_some(text))
    }

    fn handle_status(response: Response) -> Result<Response, GrimError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "PubChem request failed".to_string());
        Err(GrimError::PubchemStatus { status, message })
    }

    /// Sends the request built by `make_req`, retrying per `self.retry`. A
    /// response that stays busy is returned as is for `handle_status`.
    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, GrimError>
    where
        F: FnMut() -> RequestBuilder,
    {
        let outcome = self.retry.run_if(
            "PubChem request",
            |_| match make_req().send() {
                Ok(response) if is_retryable_status(response.status().as_u16()) => {
                    Err(Transient::Busy(response))
                }
                Ok(response) => Ok(response),
                Err(err) => Err(Transient::Transport(err)),
            },
            |failure| match failure {
                Transient::Busy(_) => true,
                Transient::Transport(err) => is_retryable_error(err),
            },
        );
        match outcome {
            Ok(response) | Err(Transient::Busy(response)) => Ok(response),
            Err(Transient::Transport(err)) => Err(GrimError::PubchemHttp(err.to_string())),
        }
    }
}

enum Transient {
    Busy(Response),
    Transport(reqwest::Error),
}

impl fmt::Display for Transient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transient::Busy(response) => write!(f, "PubChem busy ({})", response.status()),
            Transient::Transport(err) => write!(f, "{err}"),
        }
    }
}

impl StructureRegistry for PubchemHttpClient {
    fn lookup(&self, name: &str, destination: &Path) -> Result<Lookup, GrimError> {
        fs::create_dir_all(destination).map_err(|err| GrimError::Filesystem(err.to_string()))?;

        info!("searching PubChem for compound: {name}");
        let Some(cid) = self.cids(name)?.first().copied() else {
            warn!("no compounds found in PubChem for name: {name}");
            return Ok(Lookup::NotFound);
        };
        info!(cid, "found compound {name}");

        let sdf = match self.fetch_sdf(cid, "3d") {
            Ok(Some(sdf)) => sdf,
            Ok(None) | Err(_) => {
                warn!(cid, "no 3D structure for {name}, trying 2D");
                match self.fetch_sdf(cid, "2d")? {
                    Some(sdf) => sdf,
                    None => {
                        warn!(cid, "no structure data available for {name}");
                        return Ok(Lookup::NotFound);
                    }
                }
            }
        };

        let path = destination.join(sdf_file_name(name));
        fs::write(&path, sdf).map_err(|err| GrimError::Filesystem(err.to_string()))?;
        let path = std::path::absolute(&path).unwrap_or(path);
        info!(path = %path.display(), "downloaded SDF");
        Ok(Lookup::Found(path))
    }

    fn exists(&self, name: &str) -> Result<bool, GrimError> {
        Ok(!self.cids(name)?.is_empty())
    }
}

/// `<sanitized name>.sdf`.
pub fn sdf_file_name(name: &str) -> String {
    format!("{}.sdf", sanitize_with_fallback(name, FILENAME_FALLBACK))
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_escape_compound_names() {
        let client = PubchemHttpClient::new().unwrap();
        assert_eq!(
            client.cids_url("acetic acid").unwrap().as_str(),
            "https://pubchem.ncbi.nlm.nih.gov/rest/pug/compound/name/acetic%20acid/cids/JSON"
        );
        assert_eq!(
            client.sdf_url(702, "3d").unwrap().as_str(),
            "https://pubchem.ncbi.nlm.nih.gov/rest/pug/compound/cid/702/SDF?record_type=3d"
        );
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(sdf_file_name("acetic acid"), "acetic_acid.sdf");
        assert_eq!(sdf_file_name("///"), "unknown_compound.sdf");
    }
}
