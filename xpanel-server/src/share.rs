//! Share URI generation.
//!
//! Each client-facing wire protocol maps to its canonical single-line URI.
//! Query values use form encoding (space becomes `+`), fragments use percent
//! encoding; the host defaults to the declaration's own settings and falls
//! back to the hostname the panel was reached on.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde_json::{Value, json};
use url::form_urlencoded::byte_serialize;
use xpanel_core::{Error, Protocol, Result};
use xpanel_store::Inbound;

fn form_encode(value: &str) -> String {
    byte_serialize(value.as_bytes()).collect()
}

fn str_setting<'a>(inbound: &'a Inbound, key: &str) -> Option<&'a str> {
    inbound.settings.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Address clients should dial: explicit `host`, then `sni`, then where the
/// panel itself was reached.
fn connect_host<'a>(inbound: &'a Inbound, fallback: &'a str) -> &'a str {
    str_setting(inbound, "host")
        .or_else(|| str_setting(inbound, "sni"))
        .unwrap_or(fallback)
}

pub fn share_uri(inbound: &Inbound, fallback_host: &str) -> Result<String> {
    match inbound.protocol {
        Protocol::Shadowsocks => shadowsocks_uri(inbound, fallback_host),
        Protocol::Trojan => trojan_uri(inbound, fallback_host),
        Protocol::Vmess => vmess_uri(inbound, fallback_host),
        Protocol::Vless => vless_uri(inbound, fallback_host),
        other => Err(Error::bad_request(format!(
            "protocol '{other}' has no share URI form"
        ))),
    }
}

/// `ss://base64(method:password)@host:port#name`
fn shadowsocks_uri(inbound: &Inbound, fallback_host: &str) -> Result<String> {
    let password = str_setting(inbound, "password")
        .ok_or_else(|| Error::bad_request("shadowsocks inbound has no password"))?;
    let method = str_setting(inbound, "method").unwrap_or("aes-256-gcm");
    let credential = B64.encode(format!("{method}:{password}"));
    Ok(format!(
        "ss://{credential}@{}:{}#{}",
        connect_host(inbound, fallback_host),
        inbound.port,
        urlencoding::encode(&inbound.name),
    ))
}

/// `trojan://password@host:port?security=tls&sni=…[&allowInsecure=…][&path=…]#name`
fn trojan_uri(inbound: &Inbound, fallback_host: &str) -> Result<String> {
    let password = str_setting(inbound, "password")
        .ok_or_else(|| Error::bad_request("trojan inbound has no password"))?;
    let host = connect_host(inbound, fallback_host);

    let mut query = format!("security=tls&sni={}", form_encode(str_setting(inbound, "sni").unwrap_or(host)));
    if let Some(allow) = inbound.settings.get("allowInsecure").and_then(Value::as_bool) {
        query.push_str(&format!("&allowInsecure={allow}"));
    }
    if let Some(path) = str_setting(inbound, "path") {
        query.push_str(&format!("&path={}", form_encode(path)));
    }

    Ok(format!(
        "trojan://{}@{host}:{}?{query}#{}",
        form_encode(password),
        inbound.port,
        urlencoding::encode(&inbound.name),
    ))
}

/// `vmess://base64(json)` with the conventional v2 field set.
fn vmess_uri(inbound: &Inbound, fallback_host: &str) -> Result<String> {
    let id = str_setting(inbound, "id")
        .ok_or_else(|| Error::bad_request("vmess inbound has no client id"))?;
    let tls = inbound.settings.get("tls").and_then(Value::as_bool).unwrap_or(false);
    let payload = json!({
        "v": "2",
        "ps": inbound.name,
        "add": connect_host(inbound, fallback_host),
        "port": inbound.port,
        "id": id,
        "aid": inbound.settings.get("alter_id").and_then(Value::as_i64).unwrap_or(0),
        "net": str_setting(inbound, "network").unwrap_or("tcp"),
        "type": "none",
        "host": str_setting(inbound, "host").unwrap_or(""),
        "path": str_setting(inbound, "path").unwrap_or(""),
        "tls": if tls { "tls" } else { "" },
        "scy": str_setting(inbound, "security").unwrap_or("auto"),
    });
    let encoded = B64.encode(serde_json::to_vec(&payload).map_err(|e| Error::internal(e.to_string()))?);
    Ok(format!("vmess://{encoded}"))
}

/// `vless://uuid@host:port?encryption=none[&security=tls&sni=…][&type=…[&path=…&host=…]]#name`
fn vless_uri(inbound: &Inbound, fallback_host: &str) -> Result<String> {
    let id = str_setting(inbound, "id")
        .ok_or_else(|| Error::bad_request("vless inbound has no client id"))?;
    let host = connect_host(inbound, fallback_host);

    let mut query = String::from("encryption=none");
    if inbound.settings.get("tls").and_then(Value::as_bool).unwrap_or(false) {
        query.push_str(&format!(
            "&security=tls&sni={}",
            form_encode(str_setting(inbound, "sni").unwrap_or(host))
        ));
    }
    if let Some(network) = str_setting(inbound, "network") {
        query.push_str(&format!("&type={network}"));
        if let Some(path) = str_setting(inbound, "path") {
            query.push_str(&format!("&path={}", form_encode(path)));
        }
        if let Some(ws_host) = str_setting(inbound, "host") {
            query.push_str(&format!("&host={}", form_encode(ws_host)));
        }
    }

    Ok(format!(
        "vless://{id}@{host}:{}?{query}#{}",
        inbound.port,
        urlencoding::encode(&inbound.name),
    ))
}

/// The same link rendered as an SVG QR code.
pub fn share_qr_svg(link: &str) -> Result<String> {
    let code = qrcode::QrCode::new(link.as_bytes())
        .map_err(|e| Error::internal(format!("qr encode: {e}")))?;
    Ok(code
        .render::<qrcode::render::svg::Color<'_>>()
        .min_dimensions(256, 256)
        .build())
}
