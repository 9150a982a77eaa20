//! Control-plane HTTP client
//!
//! Talks JSON over HTTPS to the remote gateway: fetches its public key,
//! verifies ours, and reports the host mapping once at startup. Bearer-token
//! auth; certificate verification can be switched off by operator flag.

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::mapping::HostMapping;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Serialize)]
struct HostConfigurationRequest {
    #[serde(rename = "MappedOrder")]
    mapped_order: usize,
    #[serde(rename = "Host")]
    host: String,
}

#[derive(Debug, Serialize)]
struct BrokerConfigurationRequest {
    #[serde(rename = "Hosts")]
    hosts: Vec<HostConfigurationRequest>,
    #[serde(rename = "MappedPrefix")]
    mapped_prefix: String,
}

#[derive(Debug, Deserialize)]
struct BrokerKeysResponse {
    #[serde(rename = "ApiiroGatewayPublicKey")]
    gateway_public_key: String,
}

pub struct GatewayClient {
    client: reqwest::Client,
    domain: String,
    token: String,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig) -> Result<Option<Self>> {
        let Some(domain) = config.domain.clone() else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.skip_tls_verify)
            .build()
            .map_err(|e| Error::Gateway(e.to_string()))?;
        Ok(Some(Self {
            client,
            domain,
            token: config.token.clone(),
        }))
    }

    fn url(&self, path: &str) -> String {
        format!("https://{}/rest-api/v1.0/broker/{}", self.domain, path)
    }

    /// Fetch the gateway's tunnel public key (base64).
    pub async fn server_public_key(&self) -> Result<String> {
        let response = self
            .client
            .get(self.url("keys"))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::Gateway(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::Gateway(e.to_string()))?;

        let keys: BrokerKeysResponse = response
            .json()
            .await
            .map_err(|e| Error::Gateway(format!("bad keys response: {}", e)))?;
        if keys.gateway_public_key.is_empty() {
            return Err(Error::Gateway("response missing gateway public key".into()));
        }
        Ok(keys.gateway_public_key)
    }

    /// Ask the gateway to accept our public key.
    pub async fn verify_client_public_key(&self, public_key: &str) -> Result<()> {
        debug!("verifying client public key with gateway");
        self.client
            .get(self.url("verify"))
            .query(&[("publicKey", public_key)])
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::Gateway(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::Gateway(e.to_string()))?;
        Ok(())
    }

    /// Report the installed host mapping. Indexes are the 1-based alias
    /// slots, prefix in dotted form with trailing dot.
    pub async fn put_configuration(&self, mappings: &[HostMapping], prefix: &str) -> Result<()> {
        let body = BrokerConfigurationRequest {
            hosts: mappings
                .iter()
                .enumerate()
                .map(|(idx, mapping)| HostConfigurationRequest {
                    mapped_order: idx + 1,
                    host: mapping.host.clone(),
                })
                .collect(),
            mapped_prefix: prefix.to_string(),
        };
        debug!("reporting configuration: {}", serde_json::to_string(&body).unwrap_or_default());

        let response = self
            .client
            .put(self.url("configuration"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Gateway(e.to_string()))?;
        info!("gateway configuration response: {}", response.status());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_body_uses_wire_field_names() {
        let body = BrokerConfigurationRequest {
            hosts: vec![
                HostConfigurationRequest { mapped_order: 1, host: "a.example".into() },
                HostConfigurationRequest { mapped_order: 2, host: "b.example".into() },
            ],
            mapped_prefix: "10.9.8.".into(),
        };
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(
            json,
            r#"{"Hosts":[{"MappedOrder":1,"Host":"a.example"},{"MappedOrder":2,"Host":"b.example"}],"MappedPrefix":"10.9.8."}"#
        );
    }

    #[test]
    fn keys_response_parses_wire_field() {
        let parsed: BrokerKeysResponse =
            serde_json::from_str(r#"{"ApiiroGatewayPublicKey":"AAAA"}"#).unwrap();
        assert_eq!(parsed.gateway_public_key, "AAAA");
    }

    #[test]
    fn client_disabled_without_domain() {
        let config = GatewayConfig::default();
        assert!(GatewayClient::new(&config).unwrap().is_none());
    }
}
