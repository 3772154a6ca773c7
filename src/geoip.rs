use std::net::IpAddr;

use async_trait::async_trait;
use serde::Serialize;

/// Geographic and ownership metadata for one address. Every field is
/// optional; lookups degrade to an empty record rather than failing a
/// node's flush.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GeoInfo {
    pub country_code: Option<String>,
    pub country_name: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timezone: Option<String>,
    pub isp: Option<String>,
    pub org: Option<String>,
    pub asn: Option<String>,
    pub asn_org: Option<String>,
}

#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> GeoInfo;
}

/// Used when no geo database is configured.
pub struct DisabledGeoLookup;

#[async_trait]
impl GeoLookup for DisabledGeoLookup {
    async fn lookup(&self, _ip: IpAddr) -> GeoInfo {
        GeoInfo::default()
    }
}
