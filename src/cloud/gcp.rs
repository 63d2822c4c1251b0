//! GCP implementation of the provider seam.
//!
//! Talks to the `compute/v1` and `dns/v1` REST surfaces directly with a
//! blocking client; authentication is the service-account JWT assertion
//! flow. Mutating calls are polled to operation completion so that a
//! returned `Ok` means the resource actually changed state.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::{region_of, Address, CloudError, CloudProvider, Instance, InstanceSpec, Volume};

const COMPUTE_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const OP_POLL_INTERVAL: Duration = Duration::from_secs(2);
const OP_TIMEOUT: Duration = Duration::from_secs(600);

/// Fields of the service-account credentials JSON the provider needs
#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    project_id: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Serialize)]
struct TokenClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

struct CachedToken {
    value: String,
    expires_at: i64,
}

pub struct GcpProvider {
    http: reqwest::blocking::Client,
    project: String,
    client_email: String,
    token_uri: String,
    signing_key: EncodingKey,
    token: Mutex<Option<CachedToken>>,
}

impl From<reqwest::Error> for CloudError {
    fn from(e: reqwest::Error) -> Self {
        CloudError::Transport(e.to_string())
    }
}

impl GcpProvider {
    /// Build a provider from a service-account credentials file.
    ///
    /// Uses a blocking HTTP client internally, so construct it (and call
    /// every method) off the async runtime.
    pub fn from_credentials_file(path: &std::path::Path) -> Result<Self, CloudError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CloudError::Auth(format!("cannot read credentials: {e}")))?;
        let key: ServiceAccountKey = serde_json::from_str(&text)
            .map_err(|e| CloudError::Auth(format!("malformed credentials: {e}")))?;
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| CloudError::Auth(format!("bad service-account key: {e}")))?;
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            project: key.project_id,
            client_email: key.client_email,
            token_uri: key.token_uri,
            signing_key,
            token: Mutex::new(None),
        })
    }

    fn access_token(&self) -> Result<String, CloudError> {
        let now = chrono::Utc::now().timestamp();
        let mut cache = self.token.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = cache.as_ref() {
            if token.expires_at - 60 > now {
                return Ok(token.value.clone());
            }
        }

        let claims = TokenClaims {
            iss: &self.client_email,
            scope: COMPUTE_SCOPE,
            aud: &self.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key)
            .map_err(|e| CloudError::Auth(e.to_string()))?;
        let response = self
            .http
            .post(self.token_uri.as_str())
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(CloudError::Auth(format!("token endpoint {status}: {body}")));
        }
        let token: TokenResponse = response.json()?;
        let value = token.access_token.clone();
        *cache = Some(CachedToken {
            value: token.access_token,
            expires_at: now + token.expires_in,
        });
        Ok(value)
    }

    fn compute_url(&self, tail: &str) -> String {
        format!(
            "https://compute.googleapis.com/compute/v1/projects/{}/{}",
            self.project, tail
        )
    }

    fn dns_url(&self, zone: &str, tail: &str) -> String {
        format!(
            "https://dns.googleapis.com/dns/v1/projects/{}/managedZones/{}{}",
            self.project, zone, tail
        )
    }

    fn get(&self, url: &str) -> Result<Value, CloudError> {
        let token = self.access_token()?;
        debug!("GET {}", url);
        let response = self.http.get(url).bearer_auth(token).send()?;
        check_response(response)
    }

    fn post(&self, url: &str, body: &Value) -> Result<Value, CloudError> {
        let token = self.access_token()?;
        debug!("POST {}", url);
        let response = self.http.post(url).bearer_auth(token).json(body).send()?;
        check_response(response)
    }

    fn delete(&self, url: &str) -> Result<Value, CloudError> {
        let token = self.access_token()?;
        debug!("DELETE {}", url);
        let response = self.http.delete(url).bearer_auth(token).send()?;
        check_response(response)
    }

    /// Poll an operation until DONE, surfacing any recorded error
    fn wait_op(&self, op_url: String) -> Result<(), CloudError> {
        let deadline = std::time::Instant::now() + OP_TIMEOUT;
        loop {
            let op = self.get(&op_url)?;
            if op["status"] == "DONE" {
                if let Some(errors) = op["error"]["errors"].as_array() {
                    let message = errors
                        .iter()
                        .filter_map(|e| e["message"].as_str())
                        .collect::<Vec<_>>()
                        .join("; ");
                    return Err(map_op_error(&message));
                }
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                return Err(CloudError::Api {
                    status: 0,
                    message: format!("operation did not finish: {op_url}"),
                });
            }
            std::thread::sleep(OP_POLL_INTERVAL);
        }
    }

    /// Run a zone/region-scoped mutation and wait for its operation
    fn mutate(&self, url: &str, body: Option<&Value>, op_scope: &str) -> Result<(), CloudError> {
        let op = match body {
            Some(body) => self.post(url, body)?,
            None => self.delete(url)?,
        };
        let op_name = op["name"].as_str().ok_or_else(|| CloudError::Api {
            status: 0,
            message: "mutation returned no operation".to_string(),
        })?;
        self.wait_op(self.compute_url(&format!("{op_scope}/operations/{op_name}")))
    }
}

fn region_scope(region: &str) -> String {
    format!("regions/{region}")
}

fn zone_scope(zone: &str) -> String {
    format!("zones/{zone}")
}

fn check_response(response: reqwest::blocking::Response) -> Result<Value, CloudError> {
    let status = response.status();
    if status.is_success() {
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        return Ok(response.json()?);
    }
    let body: Value = response.json().unwrap_or(Value::Null);
    let message = body["error"]["message"]
        .as_str()
        .unwrap_or("request failed")
        .to_string();
    match status.as_u16() {
        404 => Err(CloudError::NotFound),
        409 => Err(CloudError::AlreadyExists),
        code => Err(map_api_error(code, message)),
    }
}

fn map_api_error(status: u16, message: String) -> CloudError {
    if is_in_use_message(&message) {
        CloudError::InUse
    } else if message.contains("already exists") {
        CloudError::AlreadyExists
    } else {
        CloudError::Api { status, message }
    }
}

fn map_op_error(message: &str) -> CloudError {
    if message.contains("notFound") || message.contains("was not found") {
        CloudError::NotFound
    } else {
        map_api_error(0, message.to_string())
    }
}

fn is_in_use_message(message: &str) -> bool {
    message.contains("already being used")
        || message.contains("already attached")
        || message.contains("in use")
}

impl CloudProvider for GcpProvider {
    fn get_address(&self, region: &str, name: &str) -> Result<Address, CloudError> {
        let v = self.get(&self.compute_url(&format!("regions/{region}/addresses/{name}")))?;
        Ok(Address {
            name: name.to_string(),
            address: v["address"].as_str().unwrap_or_default().to_string(),
        })
    }

    fn create_address(&self, region: &str, name: &str) -> Result<Address, CloudError> {
        self.mutate(
            &self.compute_url(&format!("regions/{region}/addresses")),
            Some(&json!({ "name": name })),
            &region_scope(region),
        )?;
        self.get_address(region, name)
    }

    fn delete_address(&self, region: &str, name: &str) -> Result<(), CloudError> {
        self.mutate(
            &self.compute_url(&format!("regions/{region}/addresses/{name}")),
            None,
            &region_scope(region),
        )
    }

    fn create_dns_record(
        &self,
        zone: &str,
        name: &str,
        ttl: u32,
        ip: &str,
    ) -> Result<(), CloudError> {
        let change = json!({
            "additions": [{
                "name": name,
                "type": "A",
                "ttl": ttl,
                "rrdatas": [ip],
            }]
        });
        self.post(&self.dns_url(zone, "/changes"), &change)?;
        Ok(())
    }

    fn delete_dns_record(&self, zone: &str, name: &str) -> Result<(), CloudError> {
        let listing = self.get(&self.dns_url(zone, &format!("/rrsets?name={name}&type=A")))?;
        let rrset = listing["rrsets"]
            .as_array()
            .and_then(|sets| sets.first())
            .ok_or(CloudError::NotFound)?
            .clone();
        self.post(&self.dns_url(zone, "/changes"), &json!({ "deletions": [rrset] }))?;
        Ok(())
    }

    fn get_volume(&self, zone: &str, name: &str) -> Result<Volume, CloudError> {
        let v = self.get(&self.compute_url(&format!("zones/{zone}/disks/{name}")))?;
        let size_gb = v["sizeGb"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .or_else(|| v["sizeGb"].as_u64())
            .unwrap_or(0);
        Ok(Volume {
            name: name.to_string(),
            size_gb,
            ssd: v["type"].as_str().is_some_and(|t| t.ends_with("pd-ssd")),
        })
    }

    fn create_volume(
        &self,
        zone: &str,
        name: &str,
        size_gb: u64,
        ssd: bool,
    ) -> Result<Volume, CloudError> {
        let disk_type = if ssd { "pd-ssd" } else { "pd-standard" };
        let body = json!({
            "name": name,
            "sizeGb": size_gb.to_string(),
            "type": self.compute_url(&format!("zones/{zone}/diskTypes/{disk_type}")),
        });
        self.mutate(
            &self.compute_url(&format!("zones/{zone}/disks")),
            Some(&body),
            &zone_scope(zone),
        )?;
        self.get_volume(zone, name)
    }

    fn delete_volume(&self, zone: &str, name: &str) -> Result<(), CloudError> {
        self.mutate(
            &self.compute_url(&format!("zones/{zone}/disks/{name}")),
            None,
            &zone_scope(zone),
        )
    }

    fn get_instance(&self, zone: &str, name: &str) -> Result<Instance, CloudError> {
        let v = self.get(&self.compute_url(&format!("zones/{zone}/instances/{name}")))?;
        Ok(Instance {
            name: name.to_string(),
            running: v["status"] == "RUNNING",
        })
    }

    fn create_instance(&self, zone: &str, spec: &InstanceSpec) -> Result<Instance, CloudError> {
        let region = region_of(zone);
        let mut interface = json!({
            "network": format!("global/networks/{}", spec.network),
            "accessConfigs": [{
                "type": "ONE_TO_ONE_NAT",
                "name": "External NAT",
                "natIP": spec.external_ip,
            }],
        });
        if let Some(subnet) = &spec.subnetwork {
            interface["subnetwork"] = json!(format!("regions/{region}/subnetworks/{subnet}"));
        }
        let body = json!({
            "name": spec.name,
            "machineType": format!("zones/{zone}/machineTypes/{}", spec.machine_type),
            "disks": [{
                "boot": true,
                "autoDelete": true,
                "initializeParams": { "sourceImage": spec.boot_image },
            }],
            "networkInterfaces": [interface],
        });
        self.mutate(
            &self.compute_url(&format!("zones/{zone}/instances")),
            Some(&body),
            &zone_scope(zone),
        )?;
        self.get_instance(zone, &spec.name)
    }

    fn delete_instance(&self, zone: &str, name: &str) -> Result<(), CloudError> {
        self.mutate(
            &self.compute_url(&format!("zones/{zone}/instances/{name}")),
            None,
            &zone_scope(zone),
        )
    }

    fn attach_volume(&self, zone: &str, instance: &str, volume: &str) -> Result<(), CloudError> {
        let body = json!({
            "source": self.compute_url(&format!("zones/{zone}/disks/{volume}")),
            "deviceName": volume,
            "autoDelete": false,
        });
        self.mutate(
            &self.compute_url(&format!("zones/{zone}/instances/{instance}/attachDisk")),
            Some(&body),
            &zone_scope(zone),
        )
    }

    fn set_tags(&self, zone: &str, instance: &str, tags: &[String]) -> Result<(), CloudError> {
        let current = self.get(&self.compute_url(&format!("zones/{zone}/instances/{instance}")))?;
        let body = json!({
            "items": tags,
            "fingerprint": current["tags"]["fingerprint"],
        });
        self.mutate(
            &self.compute_url(&format!("zones/{zone}/instances/{instance}/setTags")),
            Some(&body),
            &zone_scope(zone),
        )
    }

    fn set_metadata(
        &self,
        zone: &str,
        instance: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), CloudError> {
        let current = self.get(&self.compute_url(&format!("zones/{zone}/instances/{instance}")))?;
        let items: Vec<Value> = metadata
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect();
        let body = json!({
            "items": items,
            "fingerprint": current["metadata"]["fingerprint"],
        });
        self.mutate(
            &self.compute_url(&format!("zones/{zone}/instances/{instance}/setMetadata")),
            Some(&body),
            &zone_scope(zone),
        )
    }

    fn start_instance(&self, zone: &str, name: &str) -> Result<(), CloudError> {
        self.mutate(
            &self.compute_url(&format!("zones/{zone}/instances/{name}/start")),
            Some(&Value::Object(Default::default())),
            &zone_scope(zone),
        )
    }

    fn stop_instance(&self, zone: &str, name: &str) -> Result<(), CloudError> {
        self.mutate(
            &self.compute_url(&format!("zones/{zone}/instances/{name}/stop")),
            Some(&Value::Object(Default::default())),
            &zone_scope(zone),
        )
    }
}
