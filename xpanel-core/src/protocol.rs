use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Closed set of wire-protocol tags an inbound can declare.
///
/// The tag selects both the engine-side protocol block and the share-URI
/// scheme; it is stored as its lowercase string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    #[serde(rename = "dokodemo-door")]
    DokodemoDoor,
    Socks,
    Http,
}

impl Protocol {
    pub const ALL: [Protocol; 7] = [
        Protocol::Vmess,
        Protocol::Vless,
        Protocol::Trojan,
        Protocol::Shadowsocks,
        Protocol::DokodemoDoor,
        Protocol::Socks,
        Protocol::Http,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::DokodemoDoor => "dokodemo-door",
            Protocol::Socks => "socks",
            Protocol::Http => "http",
        }
    }

    /// Whether a client share URI exists for this protocol. Inward-only
    /// protocols (dokodemo-door, socks, http) have no canonical URI form.
    pub fn has_share_uri(&self) -> bool {
        matches!(
            self,
            Protocol::Vmess | Protocol::Vless | Protocol::Trojan | Protocol::Shadowsocks
        )
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vmess" => Ok(Protocol::Vmess),
            "vless" => Ok(Protocol::Vless),
            "trojan" => Ok(Protocol::Trojan),
            "shadowsocks" => Ok(Protocol::Shadowsocks),
            "dokodemo-door" => Ok(Protocol::DokodemoDoor),
            "socks" => Ok(Protocol::Socks),
            "http" => Ok(Protocol::Http),
            other => Err(Error::bad_request(format!("unknown protocol '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_str() {
        for p in Protocol::ALL {
            assert_eq!(p.as_str().parse::<Protocol>().unwrap(), p);
        }
    }

    #[test]
    fn serde_uses_lowercase_tags() {
        assert_eq!(serde_json::to_string(&Protocol::Trojan).unwrap(), "\"trojan\"");
        assert_eq!(
            serde_json::to_string(&Protocol::DokodemoDoor).unwrap(),
            "\"dokodemo-door\""
        );
        let p: Protocol = serde_json::from_str("\"vmess\"").unwrap();
        assert_eq!(p, Protocol::Vmess);
    }

    #[test]
    fn unknown_tag_is_bad_request() {
        let err = "wireguard".parse::<Protocol>().unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn share_uri_only_for_client_protocols() {
        assert!(Protocol::Trojan.has_share_uri());
        assert!(!Protocol::DokodemoDoor.has_share_uri());
        assert!(!Protocol::Http.has_share_uri());
    }
}
