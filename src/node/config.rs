//! Per-node configuration resolution.
//!
//! A node's effective config is a deep merge of four layers, highest
//! precedence first: the user overlay, the app-wide global overlay, any
//! templates those layers reference, and a fixed skeleton. Generated
//! secrets (validator key, TLS key) live in an auxiliary store that is only
//! ever added to, so a node keeps its identity across re-resolves.

use std::collections::HashSet;
use std::path::Path;

use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::crypto;
use crate::error::ControllerError;
use crate::util::{resolve_path, try_read_json, write_json};

pub const CONFIG_USER: &str = "config.user.json";
pub const CONFIG_AUX: &str = "config.aux.json";
pub const CONFIG_FULL: &str = "config.full.json";
pub const FILES_DIR: &str = "files";
pub const RNODE_CONF_FILE: &str = "rnode.conf";
pub const TLS_KEY_FILE: &str = "node.key.pem";

/// Secrets injected from the aux store
const VALIDATOR_KEY_PATH: &[&str] = &["rnode_conf", "casper", "validator-private-key"];
const TLS_KEY_PATH: &[&str] = &["rnode_tls_key"];

/// Lowest-precedence layer: the defaults every node starts from
fn skeleton() -> Value {
    json!({
        "rnode_conf": {
            "server": {
                "port": 40400,
                "port-kademlia": 40404,
            },
            "grpc": {
                "port-external": 40401,
            },
        },
        "hostname_suffix": ".",
        "hostname_ttl": 300,
        "resources_name_prefix": "",
        "templates": [],
        "timeout_heartbeat": 300,
        "timeout_start_rnode": 300,
        "timeout_start_host": 300,
        "host_metadata": {},
        "compute_timeout": 600,
    })
}

// ---------------------------------------------------------------------------
// JSON tree helpers

/// Merge `part` into `acc`: objects merge key-wise, anything else (arrays
/// included) replaces the accumulated value.
pub(crate) fn deep_merge(acc: &mut Value, part: &Value) {
    match (acc, part) {
        (Value::Object(acc_map), Value::Object(part_map)) => {
            for (key, value) in part_map {
                match acc_map.get_mut(key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        acc_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

pub(crate) fn get_path<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for key in path {
        current = current.as_object()?.get(*key)?;
    }
    Some(current)
}

/// Like `get_path` but treating an explicit `null` as absent
pub(crate) fn value_at<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    get_path(root, path).filter(|v| !v.is_null())
}

/// Set a value at a dotted path, creating (or replacing) intermediate
/// objects along the way.
pub(crate) fn set_path(root: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *root = value;
        return;
    };
    let mut current = root;
    for key in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = current
            .as_object_mut()
            .expect("just made an object")
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    current
        .as_object_mut()
        .expect("just made an object")
        .insert(last.to_string(), value);
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Resolved config accessors

/// The merged, derived per-node configuration. Opaque tree plus the typed
/// accessors the supervisor and controller need.
#[derive(Debug, Clone)]
pub struct NodeConfig(Value);

impl NodeConfig {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn raw(&self) -> &Value {
        &self.0
    }

    fn u64_or(&self, key: &str, default: u64) -> u64 {
        self.0[key].as_u64().unwrap_or(default)
    }

    pub fn timeout_heartbeat(&self) -> u64 {
        self.u64_or("timeout_heartbeat", 300)
    }

    pub fn timeout_start_rnode(&self) -> u64 {
        self.u64_or("timeout_start_rnode", 300)
    }

    pub fn timeout_start_host(&self) -> u64 {
        self.u64_or("timeout_start_host", 300)
    }

    pub fn hostname(&self) -> Option<&str> {
        self.0["hostname"].as_str()
    }

    pub fn rnode_addr(&self) -> Option<String> {
        self.0["rnode_addr"].as_str().map(String::from)
    }

    pub fn rnode_package_url(&self) -> Option<String> {
        self.0["rnode_package_url"].as_str().map(String::from)
    }
}

// ---------------------------------------------------------------------------
// Resolution

#[derive(Debug)]
pub struct LoadedConfig {
    pub config: NodeConfig,
    /// Fresh `cookie_exec`, present only when a full resolve ran
    pub fresh_cookie: Option<String>,
}

/// Load a node's config.
///
/// Fast path: with no explicit overlay and a persisted `config.full.json`,
/// the persisted config is read back verbatim. Anything else runs a full
/// resolve and rewrites the persisted artifacts.
pub fn load(
    app: &AppConfig,
    data_dir: &Path,
    name: &str,
    user: Option<Value>,
) -> Result<LoadedConfig, ControllerError> {
    let full_path = data_dir.join(CONFIG_FULL);
    if user.is_none() {
        if let Some(value) = try_read_json(&full_path)? {
            debug!(node = %name, "loaded persisted config");
            return Ok(LoadedConfig {
                config: NodeConfig::new(value),
                fresh_cookie: None,
            });
        }
    }
    resolve_and_persist(app, data_dir, name, user)
}

fn resolve_and_persist(
    app: &AppConfig,
    data_dir: &Path,
    name: &str,
    user: Option<Value>,
) -> Result<LoadedConfig, ControllerError> {
    let user_overlay = match user {
        Some(value) => value,
        None => try_read_json(&data_dir.join(CONFIG_USER))?.unwrap_or_else(|| json!({})),
    };

    let layers = vec![
        user_overlay.clone(),
        app.node_config_global.clone(),
        skeleton(),
    ];
    let layers = expand_templates(app, layers)?;

    // Fold from lowest precedence so earlier layers win on conflicts.
    let mut config = Value::Object(Map::new());
    for part in layers.iter().rev() {
        deep_merge(&mut config, part);
    }

    let aux_path = data_dir.join(CONFIG_AUX);
    let mut aux = try_read_json(&aux_path)?.unwrap_or_else(|| json!({}));

    ensure_secret(&mut config, &mut aux, VALIDATOR_KEY_PATH, || {
        Ok(Value::String(crypto::generate_validator_key_hex()))
    })?;
    ensure_secret(&mut config, &mut aux, TLS_KEY_PATH, || {
        Ok(Value::String(crypto::generate_tls_keypair()?.0))
    })?;

    derive_fields(&mut config, name)?;

    std::fs::create_dir_all(data_dir)?;
    if matches!(&user_overlay, Value::Object(map) if !map.is_empty()) {
        write_json(&data_dir.join(CONFIG_USER), &user_overlay)?;
    }
    write_json(&aux_path, &aux)?;
    write_json(&data_dir.join(CONFIG_FULL), &config)?;

    let files_dir = data_dir.join(FILES_DIR);
    std::fs::create_dir_all(&files_dir)?;
    let rnode_conf = get_path(&config, &["rnode_conf"])
        .cloned()
        .unwrap_or_else(|| json!({}));
    write_json(&files_dir.join(RNODE_CONF_FILE), &rnode_conf)?;
    let tls_key = value_at(&config, TLS_KEY_PATH)
        .and_then(Value::as_str)
        .ok_or_else(|| ControllerError::ConfigInvalid("rnode_tls_key is not a string".to_string()))?;
    std::fs::write(files_dir.join(TLS_KEY_FILE), tls_key)?;

    debug!(node = %name, "config resolved and persisted");
    Ok(LoadedConfig {
        config: NodeConfig::new(config),
        fresh_cookie: Some(Uuid::new_v4().to_string()),
    })
}

/// Expand `templates: [...]` references breadth-first, inserting each
/// template directly after the layer that referenced it. A name already
/// expanded once is never expanded again, so reference cycles terminate.
fn expand_templates(app: &AppConfig, mut layers: Vec<Value>) -> Result<Vec<Value>, ControllerError> {
    let mut expanded: HashSet<String> = HashSet::new();
    let mut i = 0;
    while i < layers.len() {
        let names: Vec<String> = layers[i]["templates"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        for tpl_name in names {
            if expanded.insert(tpl_name.clone()) {
                let template = load_template(app, &tpl_name)?;
                layers.insert(i + 1, template);
            }
        }
        i += 1;
    }
    Ok(layers)
}

fn load_template(app: &AppConfig, name: &str) -> Result<Value, ControllerError> {
    let path = resolve_path(&app.templates_dir(), &format!("{name}.json"))
        .map_err(|_| ControllerError::TemplateNotFound(name.to_string()))?;
    try_read_json(&path)?.ok_or_else(|| ControllerError::TemplateNotFound(name.to_string()))
}

/// Fill a secret at `path`: prefer the merged config, then the aux store,
/// then generate fresh material and record it in the aux store.
fn ensure_secret(
    config: &mut Value,
    aux: &mut Value,
    path: &[&str],
    generate: impl FnOnce() -> Result<Value, ControllerError>,
) -> Result<(), ControllerError> {
    if value_at(config, path).is_some() {
        return Ok(());
    }
    if let Some(existing) = value_at(aux, path).cloned() {
        set_path(config, path, existing);
        return Ok(());
    }
    let fresh = generate()?;
    set_path(config, path, fresh.clone());
    set_path(aux, path, fresh);
    Ok(())
}

fn derive_fields(config: &mut Value, name: &str) -> Result<(), ControllerError> {
    if value_at(config, &["rnode_id"]).is_none() {
        let pem = value_at(config, TLS_KEY_PATH)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ControllerError::ConfigInvalid("rnode_tls_key is not a string".to_string())
            })?;
        let node_id = crypto::node_id_of(pem)?;
        set_path(config, &["rnode_id"], Value::String(node_id));
    }

    if value_at(config, &["resources_name"]).is_none() {
        let prefix = value_at(config, &["resources_name_prefix"])
            .and_then(Value::as_str)
            .unwrap_or("");
        set_path(
            config,
            &["resources_name"],
            Value::String(format!("{prefix}{name}")),
        );
    }

    if value_at(config, &["hostname"]).is_none() {
        let suffix = value_at(config, &["hostname_suffix"])
            .and_then(Value::as_str)
            .unwrap_or(".");
        set_path(
            config,
            &["hostname"],
            Value::String(format!("{name}{suffix}")),
        );
    }
    // The DNS layer requires a fully-qualified name, dot included.
    if let Some(hostname) = value_at(config, &["hostname"]).and_then(Value::as_str) {
        if !hostname.ends_with('.') {
            let fixed = format!("{hostname}.");
            set_path(config, &["hostname"], Value::String(fixed));
        }
    }

    if value_at(config, &["rnode_addr"]).is_none() {
        let node_id = value_at(config, &["rnode_id"])
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let hostname = value_at(config, &["hostname"])
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let port = value_at(config, &["rnode_conf", "server", "port"])
            .map(scalar_text)
            .unwrap_or_default();
        let kademlia_port = value_at(config, &["rnode_conf", "server", "port-kademlia"])
            .map(scalar_text)
            .unwrap_or_default();
        let addr =
            format!("rnode://{node_id}@{hostname}?protocol={port}&discovery={kademlia_port}");
        set_path(config, &["rnode_addr"], Value::String(addr));
    }
    Ok(())
}
