//! Device name normalization used to fold interfaces into one logical device

use once_cell::sync::Lazy;
use regex::Regex;

static DOMAIN_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\.(local|lan|home|directory|tail[a-f0-9]{5}\.ts\.net)$").expect("valid regex")
});

static ANNOTATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*[\(\[].*?[\)\]]").expect("valid regex"));

static OVERLAY_DECORATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[\s\-–—]*\b(tailscale|ts)\b[\s\-–—]*").expect("valid regex")
});

static EXTRA_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}").expect("valid regex"));

/// Reduce a display name to the base name shared by all of a device's interfaces.
///
/// `"nas.local"`, `"NAS (wired)"` and `"NAS - Tailscale"` all reduce to `"NAS"`
/// (modulo case, which callers compare separately).
pub fn base_name(name: &str) -> String {
    let name = DOMAIN_SUFFIX.replace(name, "");
    let name = ANNOTATION.replace_all(&name, "");
    let name = OVERLAY_DECORATION.replace_all(&name, " ");
    let name = EXTRA_SPACE.replace_all(&name, " ");
    name.trim().to_string()
}

/// True for a bare dotted-quad such as `"192.168.1.20"`
pub fn is_dotted_quad(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_domain_suffix() {
        assert_eq!(base_name("nas.local"), "nas");
        assert_eq!(base_name("printer.LAN"), "printer");
        assert_eq!(base_name("laptop.tail1a2b3.ts.net"), "laptop");
    }

    #[test]
    fn test_strips_annotations() {
        assert_eq!(base_name("NAS (wired)"), "NAS");
        assert_eq!(base_name("Desk PC [old] (5GHz)"), "Desk PC");
    }

    #[test]
    fn test_strips_overlay_decoration() {
        assert_eq!(base_name("NAS - Tailscale"), "NAS");
        assert_eq!(base_name("ts laptop"), "laptop");
        // "ts" only matches as a whole word
        assert_eq!(base_name("Tsunami"), "Tsunami");
    }

    #[test]
    fn test_dotted_quad() {
        assert!(is_dotted_quad("192.168.1.20"));
        assert!(!is_dotted_quad("nas.local"));
        assert!(!is_dotted_quad("1.2.3"));
    }
}
