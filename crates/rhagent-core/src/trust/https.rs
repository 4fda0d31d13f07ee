//! HTTPS transport to the management authority.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use super::{AuthorityTransport, TrustError};
use crate::config::ManagementSection;

/// [`AuthorityTransport`] over `reqwest`'s blocking client.
pub struct HttpsAuthority {
    key_url: String,
    verify_url: String,
    key_client: Client,
    verify_client: Client,
}

fn client(allow_insecure: bool, timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .danger_accept_invalid_certs(allow_insecure)
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()
}

impl HttpsAuthority {
    /// # Errors
    ///
    /// Returns [`TrustError::Transport`] if an HTTP client cannot be built.
    pub fn new(config: &ManagementSection) -> Result<Self, TrustError> {
        let key_url = config.public_key_url();
        let verify_url = config.verify_url();

        let key_client = client(config.allow_insecure, config.key_timeout()).map_err(|e| {
            TrustError::Transport {
                url: key_url.clone(),
                message: e.to_string(),
            }
        })?;
        let verify_client =
            client(config.allow_insecure, config.verify_timeout()).map_err(|e| {
                TrustError::Transport {
                    url: verify_url.clone(),
                    message: e.to_string(),
                }
            })?;

        Ok(Self {
            key_url,
            verify_url,
            key_client,
            verify_client,
        })
    }
}

impl AuthorityTransport for HttpsAuthority {
    fn fetch_public_key(&self) -> Result<Vec<u8>, TrustError> {
        let transport = |e: reqwest::Error| TrustError::Transport {
            url: self.key_url.clone(),
            message: e.to_string(),
        };

        debug!(url = %self.key_url, "Fetching authority public key");
        let body = self
            .key_client
            .get(&self.key_url)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .map_err(transport)?
            .bytes()
            .map_err(transport)?;
        if body.is_empty() {
            return Err(TrustError::Transport {
                url: self.key_url.clone(),
                message: "empty public key".to_string(),
            });
        }
        Ok(body.to_vec())
    }

    fn submit_token(&self, ciphertext: Vec<u8>) -> Result<u16, TrustError> {
        debug!(url = %self.verify_url, bytes = ciphertext.len(), "Submitting container token");
        let response = self
            .verify_client
            .post(&self.verify_url)
            .header(CONTENT_TYPE, "text/plain")
            .body(ciphertext)
            .send()
            .map_err(|e| TrustError::Transport {
                url: self.verify_url.clone(),
                message: e.to_string(),
            })?;
        Ok(response.status().as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::severity::Severity;

    fn unreachable_authority() -> ManagementSection {
        ManagementSection {
            host: "127.0.0.1".to_string(),
            port: 1,
            verify_port: 1,
            key_timeout_secs: 2,
            verify_timeout_secs: 2,
            ..ManagementSection::default()
        }
    }

    #[test]
    fn test_urls_come_from_config() {
        let authority = HttpsAuthority::new(&unreachable_authority()).unwrap();
        assert_eq!(
            authority.key_url,
            "https://127.0.0.1:1/rest/v1/security/keyman/getpublickeyring"
        );
        assert_eq!(
            authority.verify_url,
            "https://127.0.0.1:1/rest/v1/registration/verify/container-token"
        );
    }

    #[test]
    fn test_unreachable_authority_is_fatal_transport_error() {
        let authority = HttpsAuthority::new(&unreachable_authority()).unwrap();

        let err = authority.submit_token(b"ciphertext".to_vec()).unwrap_err();
        assert!(matches!(err, TrustError::Transport { .. }));
        assert_eq!(err.severity(), Severity::Fatal);

        assert!(matches!(
            authority.fetch_public_key(),
            Err(TrustError::Transport { .. })
        ));
    }
}
