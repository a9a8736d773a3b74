use std::{
    fmt::{Display, Formatter},
    sync::{
        RwLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use base64::{Engine, engine::general_purpose::STANDARD};
#[cfg(test)]
use mockall::automock;

use crate::error::ServerError;

// Opaque backend address handed to a balancer. The raw listener address is
// kept base64-encoded as the host of a scheme-less placeholder URL, so
// addresses that aren't valid hostnames (IPv6 literals, socket paths) don't
// have to satisfy URL host syntax.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct BackendUrl {
    host: String,
}

impl BackendUrl {
    pub fn encode(address: &str) -> Self {
        BackendUrl {
            host: STANDARD.encode(address),
        }
    }

    // Recover the exact listener address this URL was encoded from.
    pub fn decode(&self) -> Result<String, ServerError> {
        let bytes = STANDARD
            .decode(&self.host)
            .map_err(|_| ServerError::InvalidBackendEncoding)?;
        String::from_utf8(bytes).map_err(|_| ServerError::InvalidBackendEncoding)
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Display for BackendUrl {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "//{}", self.host)
    }
}

// Balancer capability consumed by the alias registry. The selection policy is
// up to the implementation; it must tolerate upserts from concurrent
// registration sequences.
#[cfg_attr(test, automock)]
pub trait Balancer: Send + Sync {
    // Add a backend, or refresh it if already present.
    fn upsert_server(&self, url: BackendUrl) -> color_eyre::Result<()>;

    // Remove a backend. Removing an unknown backend is not an error.
    fn remove_server(&self, url: &BackendUrl) -> color_eyre::Result<()>;

    // Pick the backend to serve the next incoming connection.
    fn next_server(&self) -> Option<BackendUrl>;
}

// Constructs one balancer per alias. Fallible, as balancer backends may have
// their own setup requirements.
#[cfg_attr(test, automock)]
pub trait BalancerFactory: Send + Sync {
    fn create(&self) -> color_eyre::Result<Box<dyn Balancer>>;
}

// Default balancer, cycling through backends in registration order.
#[derive(Default)]
pub struct RoundRobinBalancer {
    servers: RwLock<Vec<BackendUrl>>,
    next: AtomicUsize,
}

impl Balancer for RoundRobinBalancer {
    fn upsert_server(&self, url: BackendUrl) -> color_eyre::Result<()> {
        let mut servers = self.servers.write().unwrap();
        if !servers.contains(&url) {
            servers.push(url);
        }
        Ok(())
    }

    fn remove_server(&self, url: &BackendUrl) -> color_eyre::Result<()> {
        self.servers.write().unwrap().retain(|server| server != url);
        Ok(())
    }

    fn next_server(&self) -> Option<BackendUrl> {
        let servers = self.servers.read().unwrap();
        if servers.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % servers.len();
        Some(servers[index].clone())
    }
}

#[derive(Default)]
pub struct RoundRobinFactory;

impl BalancerFactory for RoundRobinFactory {
    fn create(&self) -> color_eyre::Result<Box<dyn Balancer>> {
        Ok(Box::new(RoundRobinBalancer::default()))
    }
}

#[cfg(test)]
mod backend_url_tests {
    use super::BackendUrl;

    #[test]
    fn round_trips_addresses_that_are_not_valid_hostnames() {
        for address in ["127.0.0.1:3000", "[::1]:8080", "/run/backend.sock"] {
            let url = BackendUrl::encode(address);
            assert_eq!(url.decode().unwrap(), address);
        }
    }

    #[test]
    fn hides_the_raw_address_from_the_host_field() {
        let url = BackendUrl::encode("[::1]:8080");
        assert!(!url.host().contains(':'));
        assert!(!url.host().contains('['));
    }

    #[test]
    fn displays_with_empty_scheme_and_path() {
        let url = BackendUrl::encode("127.0.0.1:3000");
        assert_eq!(url.to_string(), format!("//{}", url.host()));
    }

    #[test]
    fn rejects_tampered_encodings() {
        let url = BackendUrl {
            host: "not a base64 host".into(),
        };
        assert!(url.decode().is_err());
    }
}
