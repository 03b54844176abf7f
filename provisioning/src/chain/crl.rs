// Licensed under the Apache-2.0 license

use bkps_error::{raise_err, BkpsResult};
use std::collections::BTreeMap;

/// Source of the CRL published under a distribution point url.
pub trait CrlProvider {
    fn get_crl(&self, crl_url: &str) -> BkpsResult<&[u8]>;
}

/// Serves CRLs prefetched together with the chain.
///
/// Device certificates embed urls of the production distribution point.
/// When the service is configured with another distribution point, a CRL
/// is matched by file name instead, so both L0 and L1 CRLs must be
/// published there under their production file names.
pub struct PrePopulatedCrlProvider<'a> {
    cached_crls: &'a BTreeMap<String, Vec<u8>>,
}

impl<'a> PrePopulatedCrlProvider<'a> {
    pub fn new(cached_crls: &'a BTreeMap<String, Vec<u8>>) -> Self {
        Self { cached_crls }
    }

    fn find_by_filename(&self, crl_url: &str) -> Option<(&'a String, &'a Vec<u8>)> {
        let filename = crl_url.rsplit('/').next().filter(|name| !name.is_empty())?;
        log::debug!("Looking for cached URL to CRL with the same filename: {crl_url}");
        self.cached_crls
            .iter()
            .find(|(url, _)| url.rsplit('/').next() == Some(filename))
    }
}

impl CrlProvider for PrePopulatedCrlProvider<'_> {
    fn get_crl(&self, crl_url: &str) -> BkpsResult<&[u8]> {
        if let Some(crl) = self.cached_crls.get(crl_url) {
            log::debug!("Using cached CRL: {crl_url}");
            return Ok(crl);
        }
        match self.find_by_filename(crl_url) {
            Some((url, crl)) => {
                log::warn!("CRL {crl_url} is not cached, using {url} with the same file name.");
                Ok(crl)
            }
            None => raise_err!(CRL_NOT_FOUND, "CRL not found: {crl_url}"),
        }
    }
}
