//! Counter source backed by the child engine's loopback stats API.
//!
//! The generated config declares a `dokodemo-door` API inbound with the
//! stats service enabled; the panel polls it over HTTP and maps the
//! `inbound>>>inbound-<id>>>>traffic>>>uplink` counter names back onto
//! inbound ids. Cumulative values; delta math happens in the traffic engine.

use async_trait::async_trait;
use serde::Deserialize;
use xpanel_core::{Error, Result};
use xpanel_traffic::{CounterSample, TrafficSource};

use crate::config::parse_inbound_tag;

pub struct XrayStatsSource {
    client: reqwest::Client,
    endpoint: String,
}

impl XrayStatsSource {
    pub fn new(api_port: u16) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(2))
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .expect("static client config"),
            endpoint: format!("http://127.0.0.1:{api_port}/stats"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(default)]
    stat: Vec<StatEntry>,
}

#[derive(Debug, Deserialize)]
struct StatEntry {
    name: String,
    #[serde(default)]
    value: i64,
}

#[async_trait]
impl TrafficSource for XrayStatsSource {
    async fn snapshot(&self) -> Result<Vec<CounterSample>> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| Error::upstream(format!("engine stats api: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::upstream(format!(
                "engine stats api answered {}",
                response.status()
            )));
        }
        let body: StatsResponse = response
            .json()
            .await
            .map_err(|e| Error::upstream(format!("engine stats decode: {e}")))?;
        Ok(collect(body))
    }
}

fn collect(body: StatsResponse) -> Vec<CounterSample> {
    use std::collections::HashMap;
    let mut by_inbound: HashMap<i64, (i64, i64)> = HashMap::new();

    for entry in body.stat {
        // Counter names look like "inbound>>>inbound-3>>>traffic>>>uplink".
        let mut parts = entry.name.split(">>>");
        let (Some("inbound"), Some(tag), Some("traffic"), Some(direction)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let Some(id) = parse_inbound_tag(tag) else {
            continue;
        };
        let counters = by_inbound.entry(id).or_default();
        match direction {
            "uplink" => counters.0 = entry.value,
            "downlink" => counters.1 = entry.value,
            _ => {}
        }
    }

    let mut samples: Vec<CounterSample> = by_inbound
        .into_iter()
        .map(|(inbound_id, (upstream, downstream))| CounterSample {
            inbound_id,
            upstream,
            downstream,
        })
        .collect();
    samples.sort_by_key(|s| s.inbound_id);
    samples
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_uplink_downlink_pairs() {
        let body: StatsResponse = serde_json::from_str(
            r#"{"stat": [
                {"name": "inbound>>>inbound-3>>>traffic>>>uplink", "value": 120},
                {"name": "inbound>>>inbound-3>>>traffic>>>downlink", "value": 340},
                {"name": "inbound>>>inbound-9>>>traffic>>>uplink", "value": 7},
                {"name": "inbound>>>api>>>traffic>>>uplink", "value": 999},
                {"name": "outbound>>>direct>>>traffic>>>uplink", "value": 5},
                {"name": "garbage"}
            ]}"#,
        )
        .unwrap();

        let samples = collect(body);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].inbound_id, 3);
        assert_eq!(samples[0].upstream, 120);
        assert_eq!(samples[0].downstream, 340);
        assert_eq!(samples[1].inbound_id, 9);
        assert_eq!(samples[1].upstream, 7);
        assert_eq!(samples[1].downstream, 0);
    }

    #[test]
    fn empty_body_yields_no_samples() {
        let body: StatsResponse = serde_json::from_str("{}").unwrap();
        assert!(collect(body).is_empty());
    }

    #[tokio::test]
    async fn unreachable_api_is_upstream_failure() {
        let source = XrayStatsSource::new(1);
        let err = source.snapshot().await.unwrap_err();
        assert_eq!(err.status(), 502);
    }
}
