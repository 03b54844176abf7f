// Licensed under the Apache-2.0 license

use bkps_error::{BkpsError, BkpsResult, ErrorKind};
use openssl::asn1::Asn1Time;
use openssl::x509::{X509Crl, X509};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Source of certificates and CRLs published by the distribution point.
pub trait DistributionPoint: Send + Sync {
    /// Raw bytes behind `url`, or None when the object is not published
    /// or cannot be downloaded.
    fn try_get_bytes(&self, url: &str) -> Option<Vec<u8>>;
}

/// Distribution point content held in memory.
#[derive(Default)]
pub struct InMemoryDistributionPoint {
    files: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<String>>,
}

impl InMemoryDistributionPoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, url: impl Into<String>, bytes: Vec<u8>) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(url.into(), bytes);
        }
    }

    pub fn withdraw(&self, url: &str) {
        if let Ok(mut files) = self.files.lock() {
            files.remove(url);
        }
    }

    /// Urls requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl DistributionPoint for InMemoryDistributionPoint {
    fn try_get_bytes(&self, url: &str) -> Option<Vec<u8>> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(url.to_string());
        }
        self.files.lock().ok()?.get(url).cloned()
    }
}

/// Local mirror of the distribution point. The url path below `main_path`
/// maps onto the directory.
pub struct MirrorDistributionPoint {
    main_path: String,
    root: PathBuf,
}

impl MirrorDistributionPoint {
    pub fn new(main_path: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            main_path: main_path.into(),
            root: root.into(),
        }
    }
}

impl DistributionPoint for MirrorDistributionPoint {
    fn try_get_bytes(&self, url: &str) -> Option<Vec<u8>> {
        let relative = url.strip_prefix(&self.main_path)?.trim_start_matches('/');
        let path = self.root.join(relative);
        match std::fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::debug!("Failed to read {}: {e}", path.display());
                None
            }
        }
    }
}

/// Mapper and validity check for one kind of cached object.
pub trait CacheObject: Clone + Send {
    const NAME: &'static str;

    fn parse(bytes: &[u8]) -> BkpsResult<Self>;

    fn is_valid(&self) -> bool;
}

/// DER certificate downloaded from the distribution point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpCertificate(pub Vec<u8>);

/// DER CRL downloaded from the distribution point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpCrl(pub Vec<u8>);

fn not_passed(time: Option<&openssl::asn1::Asn1TimeRef>) -> bool {
    let Some(time) = time else {
        return true;
    };
    match Asn1Time::days_from_now(0).and_then(|now| now.compare(time)) {
        Ok(ordering) => ordering != Ordering::Greater,
        Err(_) => false,
    }
}

impl CacheObject for DpCertificate {
    const NAME: &'static str = "certificate";

    fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        X509::from_der(bytes).map_err(|e| {
            BkpsError::new(
                ErrorKind::CERTIFICATE_PARSE_FAILED,
                "Failed to parse certificate from distribution point.",
            )
            .with_source(e)
        })?;
        Ok(Self(bytes.to_vec()))
    }

    fn is_valid(&self) -> bool {
        X509::from_der(&self.0).is_ok_and(|cert| not_passed(Some(cert.not_after())))
    }
}

impl CacheObject for DpCrl {
    const NAME: &'static str = "CRL";

    fn parse(bytes: &[u8]) -> BkpsResult<Self> {
        X509Crl::from_der(bytes).map_err(|e| {
            BkpsError::new(
                ErrorKind::CERTIFICATE_PARSE_FAILED,
                "Failed to parse CRL from distribution point.",
            )
            .with_source(e)
        })?;
        Ok(Self(bytes.to_vec()))
    }

    fn is_valid(&self) -> bool {
        X509Crl::from_der(&self.0).is_ok_and(|crl| not_passed(crl.next_update()))
    }
}

/// Distribution point downloads behind a url keyed cache.
pub struct CacheFetcher<T: CacheObject> {
    connector: Arc<dyn DistributionPoint>,
    cache: Mutex<HashMap<String, T>>,
}

impl<T: CacheObject> CacheFetcher<T> {
    pub fn new(connector: Arc<dyn DistributionPoint>) -> Self {
        Self {
            connector,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Valid cached object for `url`, otherwise a fresh download.
    pub fn fetch(&self, url: &str) -> Option<T> {
        self.find_valid_in_cache(url)
            .or_else(|| self.download_and_save(url))
    }

    /// Always downloads. The cache is still refreshed.
    pub fn fetch_skip_cache(&self, url: &str) -> Option<T> {
        if self.find_valid_in_cache(url).is_some() {
            log::debug!("Found valid data in cache, but fresh content shall be retrieved from url: {url}");
        }
        self.download_and_save(url)
    }

    fn find_valid_in_cache(&self, url: &str) -> Option<T> {
        let cache = self.cache.lock().ok()?;
        cache.get(url).filter(|obj| obj.is_valid()).cloned()
    }

    fn download_and_save(&self, url: &str) -> Option<T> {
        log::debug!("Downloading {} from url: {url}", T::NAME);
        let bytes = self.connector.try_get_bytes(url)?;
        let obj = match T::parse(&bytes) {
            Ok(obj) => obj,
            Err(e) => {
                log::warn!("Downloaded {} is invalid: {e}", T::NAME);
                return None;
            }
        };
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(url.to_string(), obj.clone());
        }
        Some(obj)
    }
}
