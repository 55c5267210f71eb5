//! RouterOS REST API driver.
//!
//! Every command is applied as find-then-change: the matching entries are
//! listed first and only created or deleted when the router's state differs,
//! so replaying a batch is a no-op.

use std::time::Duration;

use async_trait::async_trait;
use netgate_core::config::RouterConfig;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{CommandError, DriverError, DriverReport, RouterCommand, RouterDriver};

const ADDRESS_LIST: &str = "/ip/firewall/address-list";
const IP_BINDING: &str = "/ip/hotspot/ip-binding";
const HOTSPOT_HOST: &str = "/ip/hotspot/host";
const HOTSPOT_ACTIVE: &str = "/ip/hotspot/active";
const IDENTITY: &str = "/system/identity";

/// Entry returned by a RouterOS print call; only the id matters here.
#[derive(Debug, Deserialize)]
struct Entry {
    #[serde(rename = ".id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct Identity {
    name: String,
}

/// Driver for routers exposing the RouterOS v7 REST API.
#[derive(Debug, Clone)]
pub struct RestDriver {
    http: reqwest::Client,
}

impl RestDriver {
    pub fn new() -> Result<Self, DriverError> {
        // Err only means a provider was already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http })
    }

    fn url(router: &RouterConfig, path: &str) -> String {
        format!("{}{path}", router.base_url())
    }

    /// Print request for the entries under `path` matching `filter`.
    fn find_request(
        &self,
        router: &RouterConfig,
        path: &str,
        filter: &[(&str, &str)],
    ) -> reqwest::RequestBuilder {
        self.http
            .get(Self::url(router, path))
            .query(filter)
            .basic_auth(&router.username, Some(&router.password))
            .timeout(Self::timeout(router))
    }

    fn timeout(router: &RouterConfig) -> Duration {
        Duration::from_millis(router.timeout_ms.max(1))
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, DriverError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        let message = body
            .get("detail")
            .or_else(|| body.get("message"))
            .and_then(Value::as_str)
            .map_or_else(
                || status.canonical_reason().unwrap_or("Unknown").to_string(),
                str::to_string,
            );
        Err(DriverError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn find(
        &self,
        router: &RouterConfig,
        path: &str,
        filter: &[(&str, &str)],
    ) -> Result<Vec<Entry>, DriverError> {
        let resp = self.find_request(router, path, filter).send().await?;
        Ok(Self::check_status(resp).await?.json().await?)
    }

    async fn create(
        &self,
        router: &RouterConfig,
        path: &str,
        body: &Value,
    ) -> Result<(), DriverError> {
        let resp = self
            .http
            .put(Self::url(router, path))
            .basic_auth(&router.username, Some(&router.password))
            .timeout(Self::timeout(router))
            .json(body)
            .send()
            .await?;
        Self::check_status(resp).await?;
        Ok(())
    }

    async fn delete(&self, router: &RouterConfig, path: &str, id: &str) -> Result<(), DriverError> {
        let resp = self
            .http
            .delete(format!("{}{path}/{id}", router.base_url()))
            .basic_auth(&router.username, Some(&router.password))
            .timeout(Self::timeout(router))
            .send()
            .await?;
        match Self::check_status(resp).await {
            // Removed concurrently: the desired state already holds.
            Err(DriverError::Api { status: 404, .. }) | Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn ensure(
        &self,
        router: &RouterConfig,
        path: &str,
        filter: &[(&str, &str)],
        body: Value,
    ) -> Result<(), DriverError> {
        if self.find(router, path, filter).await?.is_empty() {
            self.create(router, path, &body).await?;
        } else {
            debug!(router_id = %router.id, path, "Entry already present");
        }
        Ok(())
    }

    async fn remove_all(
        &self,
        router: &RouterConfig,
        path: &str,
        filter: &[(&str, &str)],
    ) -> Result<(), DriverError> {
        for entry in self.find(router, path, filter).await? {
            self.delete(router, path, &entry.id).await?;
        }
        Ok(())
    }

    async fn apply(&self, router: &RouterConfig, cmd: &RouterCommand) -> Result<(), DriverError> {
        match cmd {
            RouterCommand::EnsureAddressList {
                list,
                address,
                comment,
            } => {
                self.ensure(
                    router,
                    ADDRESS_LIST,
                    &[("list", list), ("address", address)],
                    json!({ "list": list, "address": address, "comment": comment }),
                )
                .await
            }
            RouterCommand::RemoveAddressList { list, address } => {
                self.remove_all(router, ADDRESS_LIST, &[("list", list), ("address", address)])
                    .await
            }
            RouterCommand::EnsureBypassBinding { mac, address } => {
                self.ensure(
                    router,
                    IP_BINDING,
                    &[("mac-address", mac), ("type", "bypassed")],
                    json!({ "mac-address": mac, "address": address, "type": "bypassed" }),
                )
                .await
            }
            RouterCommand::RemoveBinding { mac } => {
                self.remove_all(router, IP_BINDING, &[("mac-address", mac)])
                    .await
            }
            RouterCommand::RemoveHost { mac } => {
                self.remove_all(router, HOTSPOT_HOST, &[("mac-address", mac)])
                    .await
            }
            RouterCommand::RemoveActive { mac, address } => {
                if let Some(mac) = mac {
                    self.remove_all(router, HOTSPOT_ACTIVE, &[("mac-address", mac)])
                        .await?;
                }
                if let Some(address) = address {
                    self.remove_all(router, HOTSPOT_ACTIVE, &[("address", address)])
                        .await?;
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl RouterDriver for RestDriver {
    async fn execute(&self, router: &RouterConfig, commands: &[RouterCommand]) -> DriverReport {
        let mut errors = Vec::new();
        for cmd in commands {
            if let Err(e) = self.apply(router, cmd).await {
                warn!(router_id = %router.id, command = %cmd, error = %e, "Router command failed");
                errors.push(CommandError {
                    cmd: cmd.to_string(),
                    message: e.to_string(),
                });
            }
        }
        DriverReport::from_errors(errors)
    }

    async fn identity(&self, router: &RouterConfig) -> Result<String, DriverError> {
        let resp = self
            .http
            .get(Self::url(router, IDENTITY))
            .basic_auth(&router.username, Some(&router.password))
            .timeout(Self::timeout(router))
            .send()
            .await?;
        let identity: Identity = Self::check_status(resp).await?.json().await?;
        Ok(identity.name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn router() -> RouterConfig {
        RouterConfig::new("R1", "10.10.0.1")
    }

    #[test]
    fn find_request_carries_filters() {
        let driver = RestDriver::new().unwrap();
        let request = driver
            .find_request(
                &router(),
                ADDRESS_LIST,
                &[("list", "paid_clients"), ("address", "10.0.0.5")],
            )
            .build()
            .unwrap();
        assert_eq!(
            request.url().as_str(),
            "http://10.10.0.1/rest/ip/firewall/address-list?list=paid_clients&address=10.0.0.5"
        );
    }

    #[test]
    fn filter_values_are_encoded() {
        let driver = RestDriver::new().unwrap();
        let request = driver
            .find_request(&router(), IP_BINDING, &[("mac-address", "a b&c")])
            .build()
            .unwrap();
        assert_eq!(request.url().query(), Some("mac-address=a+b%26c"));
    }

    #[test]
    fn plain_paths_have_no_query() {
        assert_eq!(
            RestDriver::url(&router(), IDENTITY),
            "http://10.10.0.1/rest/system/identity"
        );
    }
}
