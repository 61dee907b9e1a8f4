//! The TLS certificate cache (spec.md §4.7): a grow-only, fingerprint-
//! keyed store of self-signed certificates minted on demand.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use md5::{Digest, Md5};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rcgen::{CertificateParams, DistinguishedName, DnType, Ia5String, KeyPair, SanType, SerialNumber};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::warn;

use crate::error::{Error, Result};

const PREWARM_TARGET: usize = 8;
const RSA_BITS: usize = 2048;

/// `MD5(common_name || sort(ips) || sort(dns_names))`, hex-encoded
/// (spec.md §4.7).
fn cache_key(cn: &str, ips: &[Ipv4Addr], dns_names: &[String]) -> String {
    let mut ips_sorted: Vec<String> = ips.iter().map(|ip| ip.to_string()).collect();
    ips_sorted.sort();
    let mut names_sorted = dns_names.to_vec();
    names_sorted.sort();

    let mut hasher = Md5::new();
    hasher.update(cn.as_bytes());
    hasher.update(ips_sorted.join(",").as_bytes());
    hasher.update(names_sorted.join(",").as_bytes());
    format!("{:x}", hasher.finalize())
}

fn random_alnum(len: usize) -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(len).map(char::from).collect()
}

fn generate_rsa_keypair() -> KeyPair {
    let mut rng = rand::rngs::OsRng;
    let key = RsaPrivateKey::new(&mut rng, RSA_BITS).expect("rsa keygen");
    let der = key.to_pkcs8_der().expect("pkcs8 encode");
    KeyPair::from_der(der.as_bytes()).expect("rcgen keypair from pkcs8 der")
}

/// Keyed cache of minted self-signed certificates. A small pool of
/// pre-generated RSA key pairs amortises the otherwise-expensive 2048-
/// bit keygen off the hot path (spec.md §4.7: "a pre-warmed generator").
pub struct TlsCertCache {
    cache: DashMap<String, Arc<CertifiedKey>>,
    key_pairs: Mutex<VecDeque<KeyPair>>,
}

impl TlsCertCache {
    pub fn new() -> Arc<Self> {
        let this = Arc::new(Self {
            cache: DashMap::new(),
            key_pairs: Mutex::new(VecDeque::new()),
        });
        let prewarm = Arc::clone(&this);
        tokio::task::spawn_blocking(move || prewarm.prewarm(PREWARM_TARGET));
        this
    }

    fn prewarm(&self, n: usize) {
        let mut pairs = Vec::with_capacity(n);
        for _ in 0..n {
            pairs.push(generate_rsa_keypair());
        }
        let mut guard = self.key_pairs.lock().expect("tls key pair pool mutex poisoned");
        guard.extend(pairs);
    }

    fn take_key_pair(&self) -> KeyPair {
        let popped = {
            let mut guard = self.key_pairs.lock().expect("tls key pair pool mutex poisoned");
            guard.pop_front()
        };
        popped.unwrap_or_else(generate_rsa_keypair)
    }

    /// Returns the cached certificate for `(cn, ips, dns_names)`, minting
    /// and inserting one if absent. The cache never evicts within a
    /// process lifetime.
    pub fn get_or_mint(&self, cn: &str, ips: &[Ipv4Addr], dns_names: &[String]) -> Result<Arc<CertifiedKey>> {
        let key = cache_key(cn, ips, dns_names);
        if let Some(existing) = self.cache.get(&key) {
            return Ok(existing.clone());
        }
        let minted = Arc::new(self.mint(cn, ips, dns_names)?);
        Ok(self.cache.entry(key).or_insert(minted).clone())
    }

    fn mint(&self, cn: &str, ips: &[Ipv4Addr], dns_names: &[String]) -> Result<CertifiedKey> {
        let mut san = Vec::with_capacity(ips.len() + dns_names.len());
        for ip in ips {
            san.push(SanType::IpAddress(IpAddr::V4(*ip)));
        }
        for name in dns_names {
            let ia5 = Ia5String::try_from(name.clone()).map_err(|e| Error::Tls(e.to_string()))?;
            san.push(SanType::DnsName(ia5));
        }

        let mut params = CertificateParams::new(Vec::new()).map_err(|e| Error::Tls(e.to_string()))?;
        params.subject_alt_names = san;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        dn.push(DnType::CountryName, random_alnum(20));
        dn.push(DnType::OrganizationName, random_alnum(20));
        dn.push(DnType::OrganizationalUnitName, random_alnum(20));
        dn.push(DnType::LocalityName, random_alnum(20));
        dn.push(DnType::StateOrProvinceName, random_alnum(20));
        params.distinguished_name = dn;
        params.serial_number = Some(SerialNumber::from_slice(random_alnum(30).as_bytes()));

        let key_pair = self.take_key_pair();
        let cert = params.self_signed(&key_pair).map_err(|e| Error::Tls(e.to_string()))?;

        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&PrivateKeyDer::Pkcs8(key_der))
            .map_err(|e| Error::Tls(e.to_string()))?;

        Ok(CertifiedKey::new(vec![cert_der], signing_key))
    }
}

impl Default for TlsCertCache {
    fn default() -> Self {
        warn!("TlsCertCache::default constructs without pre-warming; prefer TlsCertCache::new");
        Self {
            cache: DashMap::new(),
            key_pairs: Mutex::new(VecDeque::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_invariant_under_permutation() {
        let ips_a = [Ipv4Addr::new(10, 0, 0, 20), Ipv4Addr::new(10, 0, 0, 30)];
        let ips_b = [Ipv4Addr::new(10, 0, 0, 30), Ipv4Addr::new(10, 0, 0, 20)];
        let names_a = vec!["a.example".to_string(), "b.example".to_string()];
        let names_b = vec!["b.example".to_string(), "a.example".to_string()];

        assert_eq!(cache_key("host.example", &ips_a, &names_a), cache_key("host.example", &ips_b, &names_b));
    }

    #[test]
    fn cache_key_differs_on_cn() {
        let ips = [Ipv4Addr::new(10, 0, 0, 20)];
        assert_ne!(cache_key("a", &ips, &[]), cache_key("b", &ips, &[]));
    }
}
