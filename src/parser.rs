// Streaming certificate parser
//
// Pulls DNS names out of raw DER-encoded certificates without retaining
// the certificate bytes. Structured X.509 parsing is attempted first; on
// failure a heuristic token scan over the raw bytes recovers plausible
// domain names. The parser owns no state beyond configuration and is
// trivially thread-safe.

use crate::error::CtError;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use x509_parser::prelude::*;

/// Minimum plausible DER certificate length
const MIN_CERT_LEN: usize = 100;

/// Maximum accepted DER certificate length (100 KiB)
const MAX_CERT_LEN: usize = 100 * 1024;

/// Leading tag byte of a DER SEQUENCE
const DER_SEQUENCE_TAG: u8 = 0x30;

/// Default cap on extracted names per certificate
const DEFAULT_MAX_NAMES: usize = 100;

/// Separators used by the heuristic fallback scan
const SCAN_SEPARATORS: [char; 8] = ['\0', '\n', '\r', '\t', ' ', ',', ';', '|'];

/// The distilled view of one logged certificate.
///
/// Built transiently per entry and handed to event consumers; certificate
/// bytes are never kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertRecord {
    /// CT log the entry came from
    pub log_url: String,
    /// Entry index within the log
    pub index: u64,
    /// Leaf timestamp
    pub timestamp: DateTime<Utc>,
    /// Subject common name, when present
    pub common_name: Option<String>,
    /// Validated, lowercased, deduplicated DNS names
    pub dns_names: Vec<String>,
}

/// Streaming certificate parser
pub struct EntryParser {
    max_names: usize,
}

impl EntryParser {
    /// Create a parser with the default name cap
    pub fn new() -> Self {
        Self {
            max_names: DEFAULT_MAX_NAMES,
        }
    }

    /// Override the per-certificate name cap
    pub fn with_max_names(max_names: usize) -> Self {
        Self {
            max_names: max_names.max(1),
        }
    }

    /// Parse one raw DER certificate into a [`CertRecord`].
    ///
    /// Fails only the basic sanity checks (length, leading tag); a
    /// certificate that defeats structured parsing still yields a record
    /// via the fallback scan, possibly with no names.
    pub fn parse(
        &self,
        der: &[u8],
        index: u64,
        timestamp: DateTime<Utc>,
        log_url: &str,
    ) -> Result<CertRecord> {
        self.check_der(der)?;

        let (common_name, candidates) = match X509Certificate::from_der(der) {
            Ok((_, cert)) => Self::extract_structured(&cert),
            Err(_) => (None, self.scan_raw(der)),
        };

        let mut seen = HashSet::new();
        let mut dns_names = Vec::new();
        for name in candidates {
            let name = name.trim().to_ascii_lowercase();
            if !is_valid_dns_name(&name) {
                continue;
            }
            if seen.insert(name.clone()) {
                dns_names.push(name);
                if dns_names.len() >= self.max_names {
                    break;
                }
            }
        }

        let common_name = common_name.or_else(|| dns_names.first().cloned());

        Ok(CertRecord {
            log_url: log_url.to_string(),
            index,
            timestamp,
            common_name,
            dns_names,
        })
    }

    fn check_der(&self, der: &[u8]) -> Result<()> {
        if der.len() < MIN_CERT_LEN {
            return Err(CtError::Parse {
                message: format!("certificate too small: {} bytes", der.len()),
            });
        }
        if der.len() > MAX_CERT_LEN {
            return Err(CtError::Parse {
                message: format!("certificate too large: {} bytes", der.len()),
            });
        }
        if der[0] != DER_SEQUENCE_TAG {
            return Err(CtError::Parse {
                message: "not a DER-encoded certificate".to_string(),
            });
        }
        Ok(())
    }

    /// Extract the CN and candidate names from a parsed certificate.
    ///
    /// SAN DNS entries come first; the subject CN is appended only when
    /// the certificate is not a CA and the CN is not already listed.
    fn extract_structured(cert: &X509Certificate<'_>) -> (Option<String>, Vec<String>) {
        let mut names = Vec::new();

        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for general_name in &san.value.general_names {
                if let GeneralName::DNSName(dns) = general_name {
                    names.push(dns.to_string());
                }
            }
        }

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);

        let is_ca = cert
            .basic_constraints()
            .ok()
            .flatten()
            .map(|bc| bc.value.ca)
            .unwrap_or(false);

        if let Some(cn) = &common_name {
            if !is_ca && !names.iter().any(|n| n.eq_ignore_ascii_case(cn)) {
                names.push(cn.clone());
            }
        }

        (common_name, names)
    }

    /// Heuristic fallback for certificates that defeat structured parsing:
    /// split the raw bytes on common separators and keep tokens that look
    /// like DNS names.
    fn scan_raw(&self, der: &[u8]) -> Vec<String> {
        let text = String::from_utf8_lossy(der);
        let mut names = Vec::new();
        for sep in SCAN_SEPARATORS {
            for token in text.split(sep) {
                let token = token.trim();
                if is_valid_dns_name(&token.to_ascii_lowercase()) {
                    names.push(token.to_string());
                }
            }
        }
        names
    }
}

impl Default for EntryParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a candidate DNS name: contains a dot, length 4-253, charset
/// `[a-zA-Z0-9.-]`, final label 2-6 characters
pub fn is_valid_dns_name(name: &str) -> bool {
    let name = name.trim();
    if name.len() < 4 || name.len() > 253 {
        return false;
    }
    if !name.contains('.') {
        return false;
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return false;
    }

    let tld = match name.rsplit('.').next() {
        Some(label) => label,
        None => return false,
    };
    (2..=6).contains(&tld.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(names: &[&str]) -> Vec<u8> {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let key = rcgen::generate_simple_self_signed(names).unwrap();
        key.cert.der().to_vec()
    }

    #[test]
    fn test_rejects_short_input() {
        let parser = EntryParser::new();
        let err = parser
            .parse(&[0x30, 0x01, 0x02], 0, Utc::now(), "https://log.test/")
            .unwrap_err();
        assert!(matches!(err, CtError::Parse { .. }));
    }

    #[test]
    fn test_rejects_wrong_leading_tag() {
        let parser = EntryParser::new();
        let data = vec![0xffu8; 200];
        let err = parser
            .parse(&data, 0, Utc::now(), "https://log.test/")
            .unwrap_err();
        assert!(matches!(err, CtError::Parse { .. }));
    }

    #[test]
    fn test_rejects_oversized_input() {
        let parser = EntryParser::new();
        let mut data = vec![0u8; MAX_CERT_LEN + 1];
        data[0] = DER_SEQUENCE_TAG;
        assert!(parser
            .parse(&data, 0, Utc::now(), "https://log.test/")
            .is_err());
    }

    #[test]
    fn test_extracts_san_names() {
        let der = self_signed(&["api.example.com", "mail.other.test"]);
        let parser = EntryParser::new();
        let record = parser
            .parse(&der, 42, Utc::now(), "https://log.test/")
            .unwrap();

        assert_eq!(record.index, 42);
        assert!(record.dns_names.contains(&"api.example.com".to_string()));
        assert!(record.dns_names.contains(&"mail.other.test".to_string()));
    }

    #[test]
    fn test_names_lowercased_and_deduplicated() {
        let der = self_signed(&["API.Example.com", "api.example.com"]);
        let parser = EntryParser::new();
        let record = parser
            .parse(&der, 0, Utc::now(), "https://log.test/")
            .unwrap();

        let count = record
            .dns_names
            .iter()
            .filter(|n| *n == "api.example.com")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_name_cap() {
        let names: Vec<String> = (0..20).map(|i| format!("host{}.example.com", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let der = self_signed(&refs);

        let parser = EntryParser::with_max_names(5);
        let record = parser
            .parse(&der, 0, Utc::now(), "https://log.test/")
            .unwrap();
        assert_eq!(record.dns_names.len(), 5);
    }

    #[test]
    fn test_fallback_scan() {
        // Valid leading tag but garbage structure: the raw scan should
        // still find the embedded host name.
        let mut data = vec![0u8; 80];
        data[0] = DER_SEQUENCE_TAG;
        data[1] = 0x82;
        data.extend_from_slice(b"\x00api.example.com\x00");
        data.extend_from_slice(&[0xeeu8; 40]);

        let parser = EntryParser::new();
        let record = parser
            .parse(&data, 7, Utc::now(), "https://log.test/")
            .unwrap();
        assert!(record.dns_names.contains(&"api.example.com".to_string()));
    }

    #[test]
    fn test_common_name_defaults_to_first_name() {
        let der = self_signed(&["first.example.com", "second.example.com"]);
        let parser = EntryParser::new();
        let record = parser
            .parse(&der, 0, Utc::now(), "https://log.test/")
            .unwrap();

        assert!(record.common_name.is_some());
    }

    #[test]
    fn test_dns_name_validation() {
        assert!(is_valid_dns_name("a.io"));
        assert!(is_valid_dns_name("api.example.com"));
        assert!(is_valid_dns_name("xn--bcher-kva.de"));

        assert!(!is_valid_dns_name("io"));
        assert!(!is_valid_dns_name("a.b")); // too short
        assert!(!is_valid_dns_name("exa mple.com"));
        assert!(!is_valid_dns_name("example.x")); // 1-char TLD
        assert!(!is_valid_dns_name("example.toolong7")); // 8-char TLD
        assert!(!is_valid_dns_name("*.example.com")); // wildcard label
        assert!(!is_valid_dns_name(&"a".repeat(300)));
    }
}
