//! Gateway activation
//!
//! A freshly booted appliance hands out its activation key over HTTP on
//! port 80, as a redirect whose `Location` carries `activationKey=...`.

use crate::error::{AwsError, Result};
use reqwest::redirect::Policy;
use std::time::Duration;

/// Parameters for the activation request
#[derive(Debug, Clone)]
pub struct ActivationRequest<'a> {
    pub appliance_ip: &'a str,
    pub region: &'a str,
    pub gateway_type: &'a str,
    /// DNS name of the private endpoint, when activating through one
    pub endpoint_dns: Option<&'a str>,
}

impl ActivationRequest<'_> {
    pub fn url(&self) -> String {
        let mut url = format!(
            "http://{}/?activationRegion={}&gatewayType={}",
            self.appliance_ip, self.region, self.gateway_type
        );
        if let Some(dns) = self.endpoint_dns {
            url.push_str("&vpcEndpoint=");
            url.push_str(dns);
        }
        url
    }
}

/// Fetch the activation key from the appliance
pub async fn fetch_activation_key(request: &ActivationRequest<'_>) -> Result<String> {
    let client = reqwest::Client::builder()
        .redirect(Policy::none())
        .timeout(Duration::from_secs(30))
        .build()?;

    let url = request.url();
    tracing::debug!(%url, "Requesting activation key");
    let response = client.get(&url).send().await?;

    if let Some(location) = response.headers().get(reqwest::header::LOCATION) {
        let location = location
            .to_str()
            .map_err(|e| AwsError::Activation(format!("invalid Location header: {}", e)))?;
        return parse_activation_key(location).ok_or_else(|| {
            AwsError::Activation(format!("no activationKey in redirect to {}", location))
        });
    }

    Err(AwsError::Activation(format!(
        "appliance at {} answered {} without a redirect",
        request.appliance_ip,
        response.status()
    )))
}

/// Extract `activationKey` from a redirect target
pub fn parse_activation_key(location: &str) -> Option<String> {
    let query = location.split_once('?')?.1;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "activationKey")
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}
