//! # IP Enrichment
//!
//! Geo/ASN lookup for event source addresses. Private, loopback and
//! link-local addresses are skipped outright. The default strategy is a
//! local offline lookup against MaxMind City/ASN databases; when those are
//! not configured an optional remote provider can be used behind a
//! per-minute rate limit. Failures never block the pipeline: the stage
//! returns `Unknown` and moves on. Results are cached for four hours.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use maxminddb::geoip2;
use sentinel_core::cache::CacheService;
use sentinel_core::config::EnrichmentConfig;
use sentinel_core::error::{Error, ErrorCode, Result};
use sentinel_core::metrics::PipelineMetrics;
use sentinel_core::types::IpEnrichment;
use std::collections::HashSet;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct IpEnricher {
    city_reader: Option<maxminddb::Reader<Vec<u8>>>,
    asn_reader: Option<maxminddb::Reader<Vec<u8>>>,
    high_risk_countries: HashSet<String>,
    high_risk_asns: HashSet<u32>,
    remote_endpoint: Option<String>,
    remote_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    client: reqwest::Client,
    cache: Arc<CacheService>,
    metrics: PipelineMetrics,
}

impl IpEnricher {
    pub fn new(
        config: &EnrichmentConfig,
        cache: Arc<CacheService>,
        metrics: PipelineMetrics,
    ) -> Self {
        let city_reader = config.city_db_path.as_ref().and_then(|path| {
            maxminddb::Reader::open_readfile(path)
                .map_err(|e| warn!(path, error = %e, "city database unavailable"))
                .ok()
        });
        let asn_reader = config.asn_db_path.as_ref().and_then(|path| {
            maxminddb::Reader::open_readfile(path)
                .map_err(|e| warn!(path, error = %e, "asn database unavailable"))
                .ok()
        });

        let rpm = NonZeroU32::new(config.remote_requests_per_minute.max(1))
            .unwrap_or(NonZeroU32::MIN);

        Self {
            city_reader,
            asn_reader,
            high_risk_countries: config
                .high_risk_countries
                .iter()
                .map(|c| c.to_uppercase())
                .collect(),
            high_risk_asns: config.high_risk_asns.iter().copied().collect(),
            remote_endpoint: config.remote_endpoint.clone(),
            remote_limiter: RateLimiter::direct(Quota::per_minute(rpm)),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            cache,
            metrics,
        }
    }

    /// Enrich one address. Returns `None` for private/loopback/link-local
    /// addresses (nothing to look up), `Unknown` on lookup failure.
    pub async fn enrich(&self, ip: &str) -> Option<IpEnrichment> {
        let addr: IpAddr = match ip.parse() {
            Ok(addr) => addr,
            Err(_) => {
                debug!(ip, "unparseable address, skipping enrichment");
                return None;
            }
        };
        if is_non_routable(&addr) {
            return None;
        }

        if let Some(cached) = self.cache.ip_enrichment.get(ip) {
            self.metrics
                .cache_hits
                .with_label_values(&["ip_enrichment"])
                .inc();
            return Some(cached);
        }
        self.metrics
            .cache_misses
            .with_label_values(&["ip_enrichment"])
            .inc();

        let enrichment = match self.lookup(addr).await {
            Ok(enrichment) => enrichment,
            Err(e) => {
                debug!(ip, error = %e, "enrichment lookup failed, returning unknown");
                IpEnrichment::unknown()
            }
        };

        self.cache.ip_enrichment.put(ip.to_string(), enrichment.clone());
        Some(enrichment)
    }

    async fn lookup(&self, addr: IpAddr) -> Result<IpEnrichment> {
        if self.city_reader.is_some() || self.asn_reader.is_some() {
            return Ok(self.lookup_local(addr));
        }
        if self.remote_endpoint.is_some() {
            return self.lookup_remote(addr).await;
        }
        Ok(IpEnrichment::unknown())
    }

    fn lookup_local(&self, addr: IpAddr) -> IpEnrichment {
        let mut enrichment = IpEnrichment::unknown();

        if let Some(reader) = &self.city_reader {
            if let Ok(result) = reader.lookup(addr) {
                if let Ok(Some(city)) = result.decode::<geoip2::City>() {
                    enrichment.country = city.country.iso_code.map(str::to_owned);
                    enrichment.city = city.city.names.english.map(str::to_owned);
                }
            }
        }

        if let Some(reader) = &self.asn_reader {
            if let Ok(result) = reader.lookup(addr) {
                if let Ok(Some(asn)) = result.decode::<geoip2::Asn>() {
                    enrichment.asn = asn.autonomous_system_number;
                    enrichment.organization =
                        asn.autonomous_system_organization.map(str::to_owned);
                }
            }
        }

        enrichment.is_high_risk = self.score_high_risk(&enrichment);
        enrichment
    }

    async fn lookup_remote(&self, addr: IpAddr) -> Result<IpEnrichment> {
        let endpoint = self
            .remote_endpoint
            .as_ref()
            .ok_or_else(|| Error::new(ErrorCode::EnrichmentUnavailable, "no remote endpoint"))?;

        if self.remote_limiter.check().is_err() {
            return Err(Error::new(
                ErrorCode::RateLimited,
                "remote enrichment budget exhausted for this minute",
            ));
        }

        let url = format!("{}/{}", endpoint.trim_end_matches('/'), addr);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::new(ErrorCode::EnrichmentUnavailable, e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::new(
                ErrorCode::EnrichmentUnavailable,
                format!("remote enrichment returned {}", response.status()),
            ));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::new(ErrorCode::EnrichmentUnavailable, e.to_string()))?;

        let mut enrichment = IpEnrichment {
            country: body
                .get("country_code")
                .and_then(|v| v.as_str())
                .map(str::to_owned),
            city: body.get("city").and_then(|v| v.as_str()).map(str::to_owned),
            asn: body.get("asn").and_then(|v| v.as_u64()).map(|v| v as u32),
            organization: body.get("org").and_then(|v| v.as_str()).map(str::to_owned),
            is_high_risk: false,
        };
        enrichment.is_high_risk = self.score_high_risk(&enrichment);
        Ok(enrichment)
    }

    fn score_high_risk(&self, enrichment: &IpEnrichment) -> bool {
        let country_risk = enrichment
            .country
            .as_ref()
            .map(|c| self.high_risk_countries.contains(&c.to_uppercase()))
            .unwrap_or(false);
        let asn_risk = enrichment
            .asn
            .map(|asn| self.high_risk_asns.contains(&asn))
            .unwrap_or(false);
        country_risk || asn_risk
    }
}

/// Addresses with no public routing are never looked up.
fn is_non_routable(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fe80::/10 link-local and fc00::/7 unique-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::config::{CacheConfig, MetricsConfig};
    use sentinel_core::metrics::MetricsRegistry;

    fn enricher(config: EnrichmentConfig) -> IpEnricher {
        let cache = Arc::new(CacheService::new(&CacheConfig::default()));
        let registry = MetricsRegistry::new(MetricsConfig {
            enabled: false,
            namespace: "test".into(),
        });
        IpEnricher::new(&config, cache, PipelineMetrics::new(&registry))
    }

    fn offline_config() -> EnrichmentConfig {
        EnrichmentConfig {
            city_db_path: None,
            asn_db_path: None,
            high_risk_countries: vec!["KP".into(), "ir".into()],
            high_risk_asns: vec![64512],
            remote_endpoint: None,
            remote_requests_per_minute: 45,
        }
    }

    #[tokio::test]
    async fn private_and_loopback_addresses_are_skipped() {
        let enricher = enricher(offline_config());
        assert!(enricher.enrich("10.0.0.5").await.is_none());
        assert!(enricher.enrich("192.168.1.10").await.is_none());
        assert!(enricher.enrich("127.0.0.1").await.is_none());
        assert!(enricher.enrich("169.254.8.8").await.is_none());
        assert!(enricher.enrich("fe80::1").await.is_none());
        assert!(enricher.enrich("::1").await.is_none());
    }

    #[tokio::test]
    async fn unparseable_input_is_skipped() {
        let enricher = enricher(offline_config());
        assert!(enricher.enrich("not-an-ip").await.is_none());
    }

    #[tokio::test]
    async fn public_address_without_databases_is_unknown() {
        let enricher = enricher(offline_config());
        let enrichment = enricher.enrich("203.0.113.45").await.unwrap();
        assert!(enrichment.is_unknown());
        assert!(!enrichment.is_high_risk);
    }

    #[test]
    fn high_risk_scoring_matches_country_and_asn() {
        let enricher = enricher(offline_config());

        let country_hit = IpEnrichment {
            country: Some("kp".into()),
            ..IpEnrichment::unknown()
        };
        assert!(enricher.score_high_risk(&country_hit));

        let asn_hit = IpEnrichment {
            asn: Some(64512),
            ..IpEnrichment::unknown()
        };
        assert!(enricher.score_high_risk(&asn_hit));

        let clean = IpEnrichment {
            country: Some("SE".into()),
            asn: Some(3301),
            ..IpEnrichment::unknown()
        };
        assert!(!enricher.score_high_risk(&clean));
    }

    #[tokio::test]
    async fn cached_result_is_served() {
        let enricher = enricher(offline_config());
        let first = enricher.enrich("198.51.100.7").await.unwrap();
        let second = enricher.enrich("198.51.100.7").await.unwrap();
        assert_eq!(first, second);
        assert!(enricher.cache.ip_enrichment.len() == 1);
    }
}
