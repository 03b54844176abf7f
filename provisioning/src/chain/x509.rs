// Licensed under the Apache-2.0 license

//! Certificate field extraction on DER input.

use bkps_error::{BkpsError, BkpsResult, ErrorKind};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{DistributionPointName, GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

const CA_ISSUERS_OID: &str = "1.3.6.1.5.5.7.48.2";

fn parse(der: &[u8]) -> BkpsResult<X509Certificate<'_>> {
    match X509Certificate::from_der(der) {
        Ok((_, cert)) => Ok(cert),
        Err(e) => Err(BkpsError::new(
            ErrorKind::CERTIFICATE_PARSE_FAILED,
            format!("Failed to parse certificate: {e}"),
        )),
    }
}

/// The leading certificate of `blob` without trailing padding.
pub fn leading_certificate(blob: &[u8]) -> BkpsResult<Vec<u8>> {
    match X509Certificate::from_der(blob) {
        Ok((rest, _)) => Ok(blob[..blob.len() - rest.len()].to_vec()),
        Err(e) => Err(BkpsError::new(
            ErrorKind::CERTIFICATE_PARSE_FAILED,
            format!("Failed to parse certificate from device: {e}"),
        )),
    }
}

/// Splits concatenated DER certificates.
pub fn split_certificates(mut bytes: &[u8]) -> BkpsResult<Vec<Vec<u8>>> {
    let mut certs = Vec::new();
    while !bytes.is_empty() {
        let (rest, _) = X509Certificate::from_der(bytes).map_err(|e| {
            BkpsError::new(
                ErrorKind::CERTIFICATE_PARSE_FAILED,
                format!("Failed to parse certificate {} of chain: {e}", certs.len()),
            )
        })?;
        let len = bytes.len() - rest.len();
        certs.push(bytes[..len].to_vec());
        bytes = rest;
    }
    Ok(certs)
}

pub fn subject(der: &[u8]) -> BkpsResult<String> {
    Ok(parse(der)?.subject().to_string())
}

pub fn is_self_issued(der: &[u8]) -> BkpsResult<bool> {
    let cert = parse(der)?;
    Ok(cert.subject().as_raw() == cert.issuer().as_raw())
}

pub fn subject_key_identifier(der: &[u8]) -> BkpsResult<Option<Vec<u8>>> {
    let cert = parse(der)?;
    for ext in cert.extensions() {
        if let ParsedExtension::SubjectKeyIdentifier(ski) = ext.parsed_extension() {
            return Ok(Some(ski.0.to_vec()));
        }
    }
    Ok(None)
}

pub fn authority_key_identifier(der: &[u8]) -> BkpsResult<Option<Vec<u8>>> {
    let cert = parse(der)?;
    for ext in cert.extensions() {
        if let ParsedExtension::AuthorityKeyIdentifier(aki) = ext.parsed_extension() {
            return Ok(aki.key_identifier.as_ref().map(|id| id.0.to_vec()));
        }
    }
    Ok(None)
}

/// Dotted OIDs of the extended key usages outside the well known set.
pub fn extended_key_usages(der: &[u8]) -> BkpsResult<Vec<String>> {
    let cert = parse(der)?;
    let mut oids = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::ExtendedKeyUsage(eku) = ext.parsed_extension() {
            oids.extend(eku.other.iter().map(|oid| oid.to_id_string()));
        }
    }
    Ok(oids)
}

pub fn crl_distribution_points(der: &[u8]) -> BkpsResult<Vec<String>> {
    let cert = parse(der)?;
    let mut urls = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::CRLDistributionPoints(points) = ext.parsed_extension() {
            for point in points.points.iter() {
                if let Some(DistributionPointName::FullName(names)) = &point.distribution_point {
                    urls.extend(names.iter().filter_map(uri));
                }
            }
        }
    }
    Ok(urls)
}

/// Issuer certificate urls from the authority information access extension.
pub fn ca_issuers(der: &[u8]) -> BkpsResult<Vec<String>> {
    let cert = parse(der)?;
    let mut urls = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() {
            urls.extend(
                aia.accessdescs
                    .iter()
                    .filter(|desc| desc.access_method.to_id_string() == CA_ISSUERS_OID)
                    .filter_map(|desc| uri(&desc.access_location)),
            );
        }
    }
    Ok(urls)
}

fn uri(name: &GeneralName) -> Option<String> {
    match name {
        GeneralName::URI(uri) => Some(uri.to_string()),
        _ => None,
    }
}
