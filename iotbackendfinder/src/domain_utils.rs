use std::net::IpAddr;

/// Normalize a domain observed in a dataset for matching.
///
/// Lowercases, trims whitespace, strips the trailing root dot that DNSDB
/// rrnames carry and the leading `*.` of wildcard certificate names.
pub fn normalize_domain(domain: &str) -> String {
    let mut normalized = domain.trim().to_lowercase();

    while normalized.ends_with('.') {
        normalized.pop();
    }

    if let Some(stripped) = normalized.strip_prefix("*.") {
        normalized = stripped.to_string();
    }

    normalized
}

/// True when `domain` equals `suffix` or ends with `.` + `suffix`.
/// Both arguments are expected to be normalized.
pub fn has_label_suffix(domain: &str, suffix: &str) -> bool {
    if suffix.is_empty() {
        return false;
    }
    if domain == suffix {
        return true;
    }
    domain.len() > suffix.len()
        && domain.ends_with(suffix)
        && domain.as_bytes()[domain.len() - suffix.len() - 1] == b'.'
}

/// Check if a string is an IPv4 or IPv6 literal
pub fn is_ip_address(value: &str) -> bool {
    value.trim().parse::<IpAddr>().is_ok()
}

/// Extract the common name from an X.509 distinguished name such as
/// `C=US, O=Example, CN=device.example.com`.
pub fn common_name_from_dn(dn: &str) -> Option<String> {
    dn.split(',')
        .map(str::trim)
        .find_map(|part| {
            let (key, value) = part.split_once('=')?;
            if key.trim().eq_ignore_ascii_case("cn") {
                let value = value.trim();
                (!value.is_empty()).then(|| value.to_string())
            } else {
                None
            }
        })
}
