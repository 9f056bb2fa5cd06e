// SPDX-License-Identifier: AGPL-3.0-or-later
//! MAC vendor prefixes and default router nicknames

/// (OUI prefix, vendor) pairs, prefixes upper case
const OUI_VENDORS: &[(&str, &str)] = &[
    ("94:83:C4", "GL.iNet"),
    ("E4:95:6E", "GL.iNet"),
    ("50:C7:BF", "TP-Link"),
    ("EC:08:6B", "TP-Link"),
    ("C0:4A:00", "TP-Link"),
    ("A0:40:A0", "Netgear"),
    ("9C:3D:CF", "Netgear"),
    ("00:14:BF", "Linksys"),
    ("24:A4:3C", "Ubiquiti"),
    ("78:8A:20", "Ubiquiti"),
];

/// Vendor for a MAC address, if the prefix is known
pub fn vendor(mac: &str) -> Option<&'static str> {
    let upper = mac.to_ascii_uppercase();
    OUI_VENDORS
        .iter()
        .find(|(prefix, _)| upper.starts_with(prefix))
        .map(|(_, name)| *name)
}

/// Default nickname: vendor plus the last two octets, e.g. `GL.iNet 2A:1B`
pub fn nickname(mac: &str) -> String {
    let octets: Vec<String> = mac.split(':').map(|o| o.to_ascii_uppercase()).collect();
    let suffix = match octets.as_slice() {
        [.., a, b] => format!("{}:{}", a, b),
        _ => mac.to_string(),
    };
    format!("{} {}", vendor(mac).unwrap_or("Router"), suffix)
}

/// Normalize a MAC to lower-case colon form; `None` if malformed
pub fn normalize_mac(mac: &str) -> Option<String> {
    let octets: Vec<&str> = mac.trim().split(|c| c == ':' || c == '-').collect();
    if octets.len() != 6
        || octets
            .iter()
            .any(|o| o.len() != 2 || !o.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return None;
    }
    Some(octets.join(":").to_ascii_lowercase())
}

/// The all-zero MAC the kernel reports for incomplete neighbour entries
pub fn is_zero_mac(mac: &str) -> bool {
    mac.split(':').all(|o| o.chars().all(|c| c == '0'))
}
