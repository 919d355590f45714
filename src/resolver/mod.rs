//! Best-effort enrichment facade.
//!
//! Reverse DNS, MAC vendor, service name and geolocation lookups,
//! consulted by decoders. Every call returns immediately with a cached
//! answer or "unknown"; refinement happens on a background thread.
//! Lookup failures never propagate, they only degrade answers.

use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::ResolverConfig;
use crate::core::layers::format_mac;

/// Geolocation answer
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GeoInfo {
    pub country: String,
    pub city: String,
    pub asn: u32,
}

/// Well-known service names by (port, proto)
const SERVICES: &[(u16, &str, &str)] = &[
    (20, "tcp", "ftp-data"),
    (21, "tcp", "ftp"),
    (22, "tcp", "ssh"),
    (23, "tcp", "telnet"),
    (25, "tcp", "smtp"),
    (53, "tcp", "domain"),
    (53, "udp", "domain"),
    (67, "udp", "bootps"),
    (68, "udp", "bootpc"),
    (80, "tcp", "http"),
    (110, "tcp", "pop3"),
    (123, "udp", "ntp"),
    (143, "tcp", "imap"),
    (161, "udp", "snmp"),
    (443, "tcp", "https"),
    (445, "tcp", "microsoft-ds"),
    (465, "tcp", "smtps"),
    (587, "tcp", "submission"),
    (993, "tcp", "imaps"),
    (995, "tcp", "pop3s"),
    (3306, "tcp", "mysql"),
    (5432, "tcp", "postgresql"),
    (6379, "tcp", "redis"),
    (8080, "tcp", "http-alt"),
];

struct Caches {
    rdns: Mutex<LruCache<IpAddr, Option<String>>>,
    geo: Mutex<LruCache<IpAddr, Option<GeoInfo>>>,
}

/// The enrichment facade. Cheap to share via `Arc`.
pub struct Resolver {
    cfg: ResolverConfig,
    caches: Arc<Caches>,
    vendors: HashMap<String, String>,
    jobs: Option<Sender<IpAddr>>,
    worker: Option<JoinHandle<()>>,
}

impl Resolver {
    pub fn new(cfg: ResolverConfig) -> Self {
        let capacity = NonZeroUsize::new(cfg.cache_size.max(1))
            .expect("cache size clamped to >= 1");
        let caches = Arc::new(Caches {
            rdns: Mutex::new(LruCache::new(capacity)),
            geo: Mutex::new(LruCache::new(capacity)),
        });

        let vendors = cfg
            .mac_db
            .as_ref()
            .map(|path| load_vendor_db(path))
            .unwrap_or_default();

        let (jobs, worker) = if cfg.reverse_dns {
            match spawn_rdns_worker(caches.clone()) {
                Some((tx, handle)) => (Some(tx), Some(handle)),
                None => (None, None),
            }
        } else {
            (None, None)
        };

        Self {
            cfg,
            caches,
            vendors,
            jobs,
            worker,
        }
    }

    /// Reverse DNS name for an address: cached answer or unknown, with a
    /// background lookup scheduled on the first miss.
    pub fn reverse_dns(&self, ip: IpAddr) -> Option<String> {
        if !self.cfg.reverse_dns {
            return None;
        }

        let mut cache = self.caches.rdns.lock();
        if let Some(answer) = cache.get(&ip) {
            return answer.clone();
        }
        // mark pending so the job is scheduled only once
        cache.put(ip, None);
        drop(cache);

        if let Some(jobs) = &self.jobs {
            // best effort: a full queue just drops the refinement
            let _ = jobs.try_send(ip);
        }
        None
    }

    /// Vendor for a MAC address from the loaded OUI table.
    pub fn mac_vendor(&self, mac: &[u8; 6]) -> Option<String> {
        if self.vendors.is_empty() {
            return None;
        }
        let prefix = format_mac(mac)[..8].to_string();
        self.vendors.get(&prefix).cloned()
    }

    /// Well-known service name for a port/protocol pair.
    pub fn service(&self, port: u16, proto: &str) -> Option<&'static str> {
        SERVICES
            .iter()
            .find(|(p, pr, _)| *p == port && *pr == proto)
            .map(|(_, _, name)| *name)
    }

    /// Geolocation is advisory and answers unknown unless a database is
    /// configured (none bundled).
    pub fn geoloc(&self, ip: IpAddr) -> Option<GeoInfo> {
        if self.cfg.geolocation_db.is_none() {
            return None;
        }
        self.caches.geo.lock().get(&ip).cloned().flatten()
    }

    /// Stop the background worker. Called once at shutdown.
    pub fn shutdown(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn load_vendor_db(path: &std::path::Path) -> HashMap<String, String> {
    let mut vendors = HashMap::new();
    match std::fs::read_to_string(path) {
        Ok(content) => {
            for line in content.lines() {
                let mut parts = line.splitn(2, '\t');
                if let (Some(prefix), Some(vendor)) =
                    (parts.next(), parts.next())
                {
                    vendors.insert(
                        prefix.trim().to_lowercase(),
                        vendor.trim().to_string(),
                    );
                }
            }
            debug!("loaded {} MAC vendor prefixes", vendors.len());
        }
        Err(e) => warn!("failed to load MAC vendor db: {}", e),
    }
    vendors
}

fn spawn_rdns_worker(
    caches: Arc<Caches>,
) -> Option<(Sender<IpAddr>, JoinHandle<()>)> {
    let resolver = trust_dns_resolver::Resolver::from_system_conf()
        .or_else(|_| {
            trust_dns_resolver::Resolver::new(
                trust_dns_resolver::config::ResolverConfig::default(),
                trust_dns_resolver::config::ResolverOpts::default(),
            )
        })
        .map_err(|e| warn!("reverse DNS unavailable: {}", e))
        .ok()?;

    let (tx, rx) = bounded::<IpAddr>(1024);
    let handle = std::thread::Builder::new()
        .name("resolver".into())
        .spawn(move || {
            for ip in rx {
                let answer = resolver
                    .reverse_lookup(ip)
                    .ok()
                    .and_then(|response| {
                        response.iter().next().map(|name| {
                            name.to_string().trim_end_matches('.').to_string()
                        })
                    });
                if let Some(name) = answer {
                    caches.rdns.lock().put(ip, Some(name));
                }
            }
        })
        .ok()?;

    Some((tx, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_lookup() {
        let resolver = Resolver::new(ResolverConfig::default());
        assert_eq!(resolver.service(110, "tcp"), Some("pop3"));
        assert_eq!(resolver.service(53, "udp"), Some("domain"));
        assert_eq!(resolver.service(110, "udp"), None);
        assert_eq!(resolver.service(54321, "tcp"), None);
    }

    #[test]
    fn test_reverse_dns_disabled_is_unknown() {
        let resolver = Resolver::new(ResolverConfig::default());
        assert_eq!(resolver.reverse_dns("8.8.8.8".parse().unwrap()), None);
    }

    #[test]
    fn test_mac_vendor_from_db() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("oui.tsv");
        std::fs::write(&db, "00:1b:21\tIntel Corporate\n").unwrap();

        let cfg = ResolverConfig {
            mac_db: Some(db),
            ..Default::default()
        };
        let resolver = Resolver::new(cfg);
        let mac = [0x00, 0x1b, 0x21, 0xaa, 0xbb, 0xcc];
        assert_eq!(
            resolver.mac_vendor(&mac).as_deref(),
            Some("Intel Corporate")
        );
        assert_eq!(resolver.mac_vendor(&[9, 9, 9, 9, 9, 9]), None);
    }

    #[test]
    fn test_geoloc_without_db_is_unknown() {
        let resolver = Resolver::new(ResolverConfig::default());
        assert_eq!(resolver.geoloc("1.1.1.1".parse().unwrap()), None);
    }
}
