//! MAC address normalization
//!
//! Every MAC the system compares or looks up goes through [`normalize_mac`]
//! first, so `AA-BB-CC-DD-EE-FF`, `aa:bb:cc:dd:ee:ff` and the BSD `arp`
//! short form `a:b:c:d:e:f` all collapse to the same key.

/// Normalize a MAC address to lowercase colon-hex.
///
/// Single-digit octets are zero-padded and `-`/`.` separators become `:`.
/// Input that does not split into octets is returned trimmed and lowercased.
pub fn normalize_mac(mac: &str) -> String {
    let lowered = mac.trim().to_lowercase().replace(['-', '.'], ":");
    if !lowered.contains(':') {
        return lowered;
    }
    lowered
        .split(':')
        .map(|octet| {
            if octet.len() == 1 {
                format!("0{}", octet)
            } else {
                octet.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(":")
}

/// True when the string is a well-formed six-octet colon-hex MAC after normalization
pub fn is_valid_mac(mac: &str) -> bool {
    let normalized = normalize_mac(mac);
    let octets: Vec<&str> = normalized.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

/// True for the all-zero placeholder some tools print for unresolved entries
pub fn is_zero_mac(mac: &str) -> bool {
    normalize_mac(mac)
        .split(':')
        .all(|o| o.chars().all(|c| c == '0'))
}
