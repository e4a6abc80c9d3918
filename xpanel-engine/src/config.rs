//! Engine config generation.
//!
//! Translates the enabled inbound set into the engine's native JSON config:
//! one inbound block per declaration plus a loopback API inbound for stats,
//! a `freedom` direct outbound, a `blackhole` blocked outbound, and a small
//! routing rule set. The write path is generate → marshal → temp file →
//! rename over the live path; the caller restarts the engine afterwards.

use std::path::Path;

use serde_json::{Value, json};
use xpanel_core::{Error, Protocol, Result};
use xpanel_store::Inbound;

use crate::EngineOptions;

/// Tag under which an inbound is declared to the engine; stats come back
/// keyed by it.
pub fn inbound_tag(id: i64) -> String {
    format!("inbound-{id}")
}

pub fn parse_inbound_tag(tag: &str) -> Option<i64> {
    tag.strip_prefix("inbound-")?.parse().ok()
}

pub fn generate(inbounds: &[Inbound], opts: &EngineOptions) -> Result<Value> {
    let mut blocks = vec![api_inbound(opts.api_port)];
    for inbound in inbounds.iter().filter(|i| i.enabled) {
        blocks.push(inbound_block(inbound)?);
    }

    let mut rules = vec![
        json!({"type": "field", "inboundTag": ["api"], "outboundTag": "api"}),
        json!({"type": "field", "ip": ["geoip:private"], "outboundTag": "blocked"}),
    ];
    if opts.route_cn_direct {
        rules.push(json!({"type": "field", "ip": ["geoip:cn"], "outboundTag": "direct"}));
        rules.push(json!({"type": "field", "domain": ["geosite:cn"], "outboundTag": "direct"}));
    }

    Ok(json!({
        "log": {"loglevel": "warning"},
        "api": {"tag": "api", "services": ["StatsService"]},
        "stats": {},
        "policy": {
            "system": {"statsInboundUplink": true, "statsInboundDownlink": true}
        },
        "inbounds": blocks,
        "outbounds": [
            {"tag": "direct", "protocol": "freedom", "settings": {}},
            {"tag": "blocked", "protocol": "blackhole", "settings": {}}
        ],
        "routing": {"domainStrategy": "AsIs", "rules": rules}
    }))
}

/// Loopback inbound the traffic engine polls for counters.
fn api_inbound(api_port: u16) -> Value {
    json!({
        "tag": "api",
        "listen": "127.0.0.1",
        "port": api_port,
        "protocol": "dokodemo-door",
        "settings": {"address": "127.0.0.1"}
    })
}

fn inbound_block(inbound: &Inbound) -> Result<Value> {
    let settings = protocol_settings(inbound)?;
    let mut block = json!({
        "tag": inbound_tag(inbound.id),
        "listen": "0.0.0.0",
        "port": inbound.port,
        "protocol": inbound.protocol.as_str(),
        "settings": settings,
    });
    if let Some(stream) = stream_settings(inbound) {
        block["streamSettings"] = stream;
    }
    Ok(block)
}

fn str_field<'a>(settings: &'a Value, key: &str) -> Option<&'a str> {
    settings.get(key).and_then(Value::as_str)
}

fn require_str<'a>(inbound: &'a Inbound, key: &str) -> Result<&'a str> {
    match inbound.settings.get(key).and_then(Value::as_str) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::bad_request(format!(
            "inbound '{}' ({}) is missing required setting '{key}'",
            inbound.name, inbound.protocol
        ))),
    }
}

/// Protocol-specific settings block, mapped from the opaque settings blob.
fn protocol_settings(inbound: &Inbound) -> Result<Value> {
    let s = &inbound.settings;
    let block = match inbound.protocol {
        Protocol::Vmess => {
            let id = require_str(inbound, "id")?;
            json!({"clients": [{"id": id, "alterId": s.get("alter_id").and_then(Value::as_i64).unwrap_or(0)}]})
        }
        Protocol::Vless => {
            let id = require_str(inbound, "id")?;
            json!({"clients": [{"id": id}], "decryption": "none"})
        }
        Protocol::Trojan => {
            let password = require_str(inbound, "password")?;
            json!({"clients": [{"password": password}]})
        }
        Protocol::Shadowsocks => {
            let password = require_str(inbound, "password")?;
            let method = str_field(s, "method").unwrap_or("aes-256-gcm");
            json!({"method": method, "password": password, "network": "tcp,udp"})
        }
        Protocol::DokodemoDoor => {
            let address = require_str(inbound, "address")?;
            json!({
                "address": address,
                "port": s.get("target_port").and_then(Value::as_u64).unwrap_or(0),
                "network": str_field(s, "network").unwrap_or("tcp")
            })
        }
        Protocol::Socks => json!({
            "auth": str_field(s, "auth").unwrap_or("noauth"),
            "udp": s.get("udp").and_then(Value::as_bool).unwrap_or(true)
        }),
        Protocol::Http => json!({
            "allowTransparent": s.get("allow_transparent").and_then(Value::as_bool).unwrap_or(false)
        }),
    };
    Ok(block)
}

/// Transport/TLS block when the declaration carries one.
fn stream_settings(inbound: &Inbound) -> Option<Value> {
    let s = &inbound.settings;
    let network = str_field(s, "network");
    let tls = s.get("tls").and_then(Value::as_bool).unwrap_or(false);
    if network.is_none() && !tls {
        return None;
    }

    let mut stream = json!({"network": network.unwrap_or("tcp")});
    if network == Some("ws") {
        stream["wsSettings"] = json!({
            "path": str_field(s, "path").unwrap_or("/"),
            "headers": {"Host": str_field(s, "host").unwrap_or("")}
        });
    }
    if tls {
        stream["security"] = json!("tls");
        stream["tlsSettings"] = json!({
            "serverName": str_field(s, "sni").unwrap_or(""),
            "certificates": [{
                "certificateFile": str_field(s, "cert_file").unwrap_or(""),
                "keyFile": str_field(s, "key_file").unwrap_or("")
            }]
        });
    }
    Some(stream)
}

/// Marshal and atomically install the config at `path`.
pub async fn write_config(config: &Value, path: &Path) -> Result<()> {
    let serialized = serde_json::to_string_pretty(config)
        .map_err(|e| Error::internal(format!("config marshal: {e}")))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serialized.as_bytes()).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Custom configs are used verbatim but must at least be well-formed JSON.
pub async fn validate_custom_config(path: &Path) -> Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|_| Error::not_found("custom config file"))?;
    serde_json::from_str::<Value>(&raw)
        .map_err(|e| Error::bad_request(format!("custom config is not valid JSON: {e}")))?;
    Ok(())
}
