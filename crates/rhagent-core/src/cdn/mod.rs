//! Content distribution network: published user keys and signature checks.

use reqwest::blocking::Client;
use thiserror::Error;
use tracing::debug;

use crate::config::CdnSection;
use crate::identity::IdentityError;

mod signature;

pub use signature::verify_signature;

/// CDN client errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CdnError {
    /// The request could not be completed.
    #[error("request to {url} failed: {message}")]
    Transport {
        /// Requested URL.
        url: String,
        /// Failure description.
        message: String,
    },

    /// The CDN answered with a failure status.
    #[error("{url} returned status {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// The response body is not a JSON array of strings.
    #[error("invalid key list from {url}: {source}")]
    Decode {
        /// Requested URL.
        url: String,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// gpg could not be run during verification.
    #[error(transparent)]
    Gpg(#[from] IdentityError),

    /// Staging files for verification failed.
    #[error("I/O error during signature verification: {0}")]
    Io(#[from] std::io::Error),
}

/// Client for the CDN REST API.
pub struct CdnClient {
    base_url: String,
    client: Client,
}

impl CdnClient {
    /// # Errors
    ///
    /// Returns [`CdnError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: &CdnSection) -> Result<Self, CdnError> {
        let base_url = config.kurjun_url();
        let client = Client::builder()
            .danger_accept_invalid_certs(config.allow_insecure)
            .connect_timeout(config.timeout())
            .timeout(config.timeout())
            .build()
            .map_err(|e| CdnError::Transport {
                url: base_url.clone(),
                message: e.to_string(),
            })?;
        Ok(Self { base_url, client })
    }

    /// URL of the user key listing.
    #[must_use]
    pub fn keys_url(&self) -> String {
        format!("{}/auth/keys", self.base_url)
    }

    /// Armored public keys published by `owner`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, the status is not a success
    /// or the body is not a JSON array of strings.
    pub fn user_public_keys(&self, owner: &str) -> Result<Vec<String>, CdnError> {
        let url = self.keys_url();
        debug!(url = %url, owner = %owner, "Fetching user public keys");

        let transport = |e: reqwest::Error| CdnError::Transport {
            url: url.clone(),
            message: e.to_string(),
        };
        let response = self
            .client
            .get(&url)
            .query(&[("user", owner)])
            .send()
            .map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(CdnError::Status {
                url,
                status: status.as_u16(),
            });
        }
        let body = response.bytes().map_err(transport)?;
        decode_keys(&body).map_err(|source| CdnError::Decode { url, source })
    }
}

fn decode_keys(body: &[u8]) -> Result<Vec<String>, serde_json::Error> {
    serde_json::from_slice(body)
}
