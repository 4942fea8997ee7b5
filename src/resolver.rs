//! The DNS resolver collaborator interface (§6 "DNS resolver").
//!
//! The actual DNS protocol codec and `/etc/hosts` parsing are out of scope here — this
//! core only specifies the shape callers resolve against: `get_ip_address`, `get_port`,
//! and friends, all asynchronous via a callback rather than a blocking return. The
//! default implementation answers from the platform's own resolver (`getaddrinfo`
//! through `std::net::ToSocketAddrs`) run on a detached thread per lookup, with results
//! cached for a configurable TTL in the same cache the rest of the crate uses elsewhere
//! ([`crate::plus::ttl_cache::TtlCache`]).

use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::plus::ttl_cache::TtlCache;

pub type IpAddressCallback = dyn Fn(io::Result<Vec<IpAddr>>) + Send + Sync;
pub type PortCallback = dyn Fn(io::Result<u16>) + Send + Sync;

/// Per-call resolution options.
#[derive(Debug, Clone, Copy)]
pub struct ResolverOptions {
    pub ipv4: bool,
    pub ipv6: bool,
    pub ttl: Duration,
}

impl Default for ResolverOptions {
    fn default() -> ResolverOptions {
        ResolverOptions {
            ipv4: true,
            ipv6: true,
            ttl: Duration::from_secs(60),
        }
    }
}

/// The resolver collaborator interface: domain-to-address and service-to-port lookup.
/// Every method invokes its callback exactly once, possibly from a thread other than
/// the caller's.
pub trait Resolver: Send + Sync {
    fn get_ip_address(&self, domain: &str, options: ResolverOptions, callback: Arc<IpAddressCallback>);
    fn get_port(&self, service: &str, options: ResolverOptions, callback: Arc<PortCallback>);
}

/// Resolves through the platform's own resolver, caching answers by domain name.
pub struct SystemResolver {
    cache: Arc<Mutex<TtlCache<String, Vec<IpAddr>>>>,
}

impl SystemResolver {
    pub fn new(capacity: usize) -> SystemResolver {
        SystemResolver {
            cache: Arc::new(Mutex::new(TtlCache::new(capacity))),
        }
    }

    fn lookup(domain: &str, options: ResolverOptions) -> io::Result<Vec<IpAddr>> {
        let addrs = (domain, 0u16).to_socket_addrs()?;
        let mut result: Vec<IpAddr> = addrs
            .map(|addr| addr.ip())
            .filter(|ip| match ip {
                IpAddr::V4(_) => options.ipv4,
                IpAddr::V6(_) => options.ipv6,
            })
            .collect();
        result.dedup();
        if result.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no matching address family"));
        }
        Ok(result)
    }
}

impl Default for SystemResolver {
    fn default() -> SystemResolver {
        SystemResolver::new(256)
    }
}

impl Resolver for SystemResolver {
    fn get_ip_address(&self, domain: &str, options: ResolverOptions, callback: Arc<IpAddressCallback>) {
        if let Some(cached) = self.cache.lock().unwrap().get(domain) {
            callback(Ok(cached.clone()));
            return;
        }

        let domain = domain.to_string();
        let cache = self.cache.clone();
        thread::spawn(move || {
            let result = SystemResolver::lookup(&domain, options);
            if let Ok(addrs) = &result {
                cache.lock().unwrap().insert(domain, addrs.clone(), options.ttl);
            }
            callback(result);
        });
    }

    fn get_port(&self, service: &str, _options: ResolverOptions, callback: Arc<PortCallback>) {
        match well_known_port(service) {
            Some(port) => callback(Ok(port)),
            None => callback(Err(io::Error::new(io::ErrorKind::NotFound, "unknown service"))),
        }
    }
}

/// A handful of well-known TCP service names, enough to exercise the interface without
/// parsing `/etc/services`.
fn well_known_port(service: &str) -> Option<u16> {
    match service {
        "http" => Some(80),
        "https" => Some(443),
        "ssh" => Some(22),
        "ftp" => Some(21),
        "smtp" => Some(25),
        "dns" | "domain" => Some(53),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn get_port_resolves_well_known_services() {
        let resolver = SystemResolver::default();
        let (tx, rx) = mpsc::channel();
        resolver.get_port(
            "http",
            ResolverOptions::default(),
            Arc::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        assert_eq!(rx.recv().unwrap().unwrap(), 80);
    }

    #[test]
    fn get_port_rejects_unknown_service() {
        let resolver = SystemResolver::default();
        let (tx, rx) = mpsc::channel();
        resolver.get_port(
            "not-a-real-service",
            ResolverOptions::default(),
            Arc::new(move |result| {
                let _ = tx.send(result.is_err());
            }),
        );
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn get_ip_address_resolves_and_caches_localhost() {
        let resolver = SystemResolver::default();
        let (tx, rx) = mpsc::channel();
        resolver.get_ip_address(
            "localhost",
            ResolverOptions::default(),
            Arc::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let addrs = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert!(!addrs.is_empty());
        assert!(resolver.cache.lock().unwrap().contains_key("localhost"));
    }
}
