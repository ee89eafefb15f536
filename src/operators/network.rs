//! Network operators (`@ipMatch` family, `@rbl`, `@geoLookup`).

use super::dns::{self, RecordType};
use super::pattern::data_lines;
use super::traits::{GeoResolver, Operator, OperatorContext, OperatorOptions};
use crate::error::{Error, Result};
use crate::variables::VariableName;
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::debug;

/// Parse an address or CIDR; bare addresses become host networks.
fn parse_network(s: &str) -> Result<IpNetwork> {
    let invalid = |message: String| Error::InvalidIp {
        value: s.to_string(),
        message,
    };
    if s.contains('/') {
        return s.parse::<IpNetwork>().map_err(|e| invalid(e.to_string()));
    }
    let ip = s.parse::<IpAddr>().map_err(|e| invalid(e.to_string()))?;
    let net = match ip {
        IpAddr::V4(v4) => Ipv4Network::new(v4, 32).map(IpNetwork::V4),
        IpAddr::V6(v6) => Ipv6Network::new(v6, 128).map(IpNetwork::V6),
    };
    net.map_err(|e| invalid(e.to_string()))
}

/// IP match operator (`@ipMatch`, `@ipMatchFromFile`, `@ipMatchFromDataset`).
///
/// The result only depends on whether the address falls in the set, not on
/// the order networks were listed in.
pub struct IpMatchOperator {
    name: &'static str,
    networks: Vec<IpNetwork>,
}

impl IpMatchOperator {
    fn build<'s>(name: &'static str, items: impl Iterator<Item = &'s str>) -> Result<Self> {
        let networks = items.map(parse_network).collect::<Result<Vec<_>>>()?;
        Ok(Self { name, networks })
    }

    /// Comma and/or whitespace separated addresses and CIDRs.
    pub fn new(list: &str) -> Result<Self> {
        Self::build(
            "ipMatch",
            list.split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty()),
        )
    }

    /// One address or CIDR per line.
    pub fn from_file(opts: &OperatorOptions) -> Result<Self> {
        let mut networks = Vec::new();
        for file in opts.argument.split_whitespace() {
            let path = opts.resolve_path(file);
            let content = std::fs::read_to_string(&path)
                .map_err(|source| Error::RuleFileLoad { path, source })?;
            networks.extend(Self::build("ipMatchFromFile", data_lines(&content))?.networks);
        }
        Ok(Self {
            name: "ipMatchFromFile",
            networks,
        })
    }

    /// Addresses from a `SecDataset`.
    pub fn from_dataset(opts: &OperatorOptions) -> Result<Self> {
        let name = opts.argument.trim();
        let items = opts
            .datasets
            .get(name)
            .ok_or_else(|| Error::InvalidOperatorArgument {
                operator: "ipMatchFromDataset".to_string(),
                message: format!("unknown dataset '{}'", name),
            })?;
        Self::build("ipMatchFromDataset", items.iter().map(|s| s.trim()))
    }

    fn contains(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|net| net.contains(ip))
    }
}

impl Operator for IpMatchOperator {
    fn evaluate(&self, _ctx: &mut OperatorContext<'_>, value: &str) -> bool {
        value
            .trim()
            .parse::<IpAddr>()
            .map_or(false, |ip| self.contains(ip))
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Real-time blocklist lookup (`@rbl zone`).
///
/// Queries `A` for the reversed IPv4 address under the zone; a listed
/// address also has its `TXT` record stored in `TX.httpbl_msg`. Lookups
/// time out after 500 ms and count as not listed.
pub struct RblOperator {
    zone: String,
    nameserver: Option<SocketAddr>,
}

impl RblOperator {
    /// Create a lookup against `zone`.
    pub fn new(opts: &OperatorOptions) -> Result<Self> {
        let zone = opts.argument.trim().trim_matches('.').to_string();
        if zone.is_empty() {
            return Err(Error::InvalidOperatorArgument {
                operator: "rbl".to_string(),
                message: "missing zone".to_string(),
            });
        }
        Ok(Self {
            zone,
            nameserver: opts.nameserver.or_else(dns::system_nameserver),
        })
    }

    fn query_name(&self, value: &str) -> Option<String> {
        match value.trim().parse::<IpAddr>().ok()? {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                Some(format!("{}.{}.{}.{}.{}", o[3], o[2], o[1], o[0], self.zone))
            }
            IpAddr::V6(_) => None,
        }
    }
}

impl Operator for RblOperator {
    fn evaluate(&self, ctx: &mut OperatorContext<'_>, value: &str) -> bool {
        let (Some(server), Some(name)) = (self.nameserver, self.query_name(value)) else {
            return false;
        };
        if ctx.cancel.is_cancelled() {
            return false;
        }
        match dns::query(server, &name, RecordType::A) {
            Ok(records) if !records.is_empty() => {}
            Ok(_) => return false,
            Err(e) => {
                debug!(query = %name, error = %e, "rbl lookup failed");
                return false;
            }
        }
        if !ctx.cancel.is_cancelled() {
            match dns::query(server, &name, RecordType::Txt) {
                Ok(txt) => {
                    let msg = txt.iter().map(|r| dns::txt_to_string(r)).collect::<Vec<_>>().join(" ");
                    ctx.variables.tx_mut().set_one("httpbl_msg", msg);
                }
                Err(e) => debug!(query = %name, error = %e, "rbl TXT lookup failed"),
            }
        }
        true
    }

    fn name(&self) -> &'static str {
        "rbl"
    }
}

/// Geo lookup (`@geoLookup`): fills the `GEO` collection for the address.
pub struct GeoLookupOperator {
    resolver: Option<Arc<dyn GeoResolver>>,
}

impl GeoLookupOperator {
    /// Create from the configured resolver.
    pub fn new(opts: &OperatorOptions) -> Self {
        Self {
            resolver: opts.geo.clone(),
        }
    }
}

impl Operator for GeoLookupOperator {
    fn evaluate(&self, ctx: &mut OperatorContext<'_>, value: &str) -> bool {
        let Some(resolver) = &self.resolver else {
            debug!("@geoLookup without a geo database");
            return false;
        };
        let Ok(ip) = value.trim().parse::<IpAddr>() else {
            return false;
        };
        let Some(fields) = resolver.lookup(ip) else {
            return false;
        };
        let geo = ctx.variables.map_mut(VariableName::Geo);
        geo.clear();
        for (k, v) in fields {
            geo.set_one(k, v);
        }
        true
    }

    fn name(&self) -> &'static str {
        "geoLookup"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::traits::testing::{eval, eval_with};
    use crate::variables::TransactionVariables;
    use std::collections::HashMap;

    #[test]
    fn test_ip_match_single_and_cidr() {
        let op = IpMatchOperator::new("127.0.0.1, 192.168.0.0/24").unwrap();
        assert!(eval(&op, "127.0.0.1"));
        assert!(eval(&op, "192.168.0.1"));
        assert!(eval(&op, "192.168.0.253"));
        assert!(!eval(&op, "127.0.0.2"));
        assert!(!eval(&op, "192.168.1.1"));
        assert!(!eval(&op, "not-an-ip"));
    }

    #[test]
    fn test_ip_match_order_independent() {
        let a = IpMatchOperator::new("10.0.0.0/8 192.168.0.0/16 ::1").unwrap();
        let b = IpMatchOperator::new("::1,192.168.0.0/16,10.0.0.0/8").unwrap();
        for ip in ["10.1.2.3", "192.168.9.9", "172.16.0.1", "::1", "::2"] {
            assert_eq!(eval(&a, ip), eval(&b, ip), "{}", ip);
        }
        assert!(eval(&a, "::1"));
        assert!(!eval(&a, "::2"));
    }

    #[test]
    fn test_ip_match_invalid() {
        assert!(matches!(IpMatchOperator::new("300.1.1.1"), Err(Error::InvalidIp { .. })));
    }

    #[test]
    fn test_ip_match_from_dataset() {
        let mut datasets = HashMap::new();
        datasets.insert("office".to_string(), vec!["10.0.0.0/24".to_string()]);
        let opts = OperatorOptions {
            argument: "office".to_string(),
            datasets: Arc::new(datasets),
            ..Default::default()
        };
        let op = IpMatchOperator::from_dataset(&opts).unwrap();
        assert!(eval(&op, "10.0.0.7"));
        assert!(!eval(&op, "10.0.1.7"));
    }

    #[test]
    fn test_rbl_query_name() {
        let opts = OperatorOptions::new("zen.example.");
        let op = RblOperator::new(&opts).unwrap();
        assert_eq!(op.query_name("1.2.3.4").as_deref(), Some("4.3.2.1.zen.example"));
        assert_eq!(op.query_name("::1"), None);
        assert!(RblOperator::new(&OperatorOptions::new("")).is_err());
    }

    #[test]
    fn test_rbl_times_out_quietly() {
        // Nothing answers on this socket; the lookup must give up.
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let opts = OperatorOptions {
            argument: "zen.example".to_string(),
            nameserver: Some(silent.local_addr().unwrap()),
            ..Default::default()
        };
        let op = RblOperator::new(&opts).unwrap();
        let started = std::time::Instant::now();
        assert!(!eval(&op, "1.2.3.4"));
        assert!(started.elapsed() < std::time::Duration::from_secs(3));
    }

    struct FixedGeo;

    impl GeoResolver for FixedGeo {
        fn lookup(&self, addr: IpAddr) -> Option<HashMap<String, String>> {
            if addr.is_loopback() {
                return None;
            }
            let mut m = HashMap::new();
            m.insert("COUNTRY_CODE".to_string(), "CL".to_string());
            Some(m)
        }
    }

    #[test]
    fn test_geo_lookup() {
        let opts = OperatorOptions {
            geo: Some(Arc::new(FixedGeo)),
            ..Default::default()
        };
        let op = GeoLookupOperator::new(&opts);
        let mut vars = TransactionVariables::new();
        assert!(eval_with(&op, &mut vars, "200.1.1.1", false));
        assert_eq!(vars.map(VariableName::Geo).first("country_code"), Some("CL"));
        assert!(!eval_with(&op, &mut vars, "127.0.0.1", false));
        assert!(!eval(&GeoLookupOperator::new(&OperatorOptions::default()), "200.1.1.1"));
    }
}
