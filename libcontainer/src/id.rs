//! Container id generation and the deterministic names/addresses derived
//! from it.

/// A fresh 128-bit identifier rendered as 32 lowercase hex characters.
pub fn generate_id() -> String {
    let mut bytes = [0u8; 16];
    for b in bytes.iter_mut() {
        *b = fastrand::u8(..);
    }
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// `veth` + first 8 hex chars of the id, truncated to 13 characters (the
/// kernel's `IFNAMSIZ - 1` limit). The container-side peer appends `_c`.
pub fn veth_host_name(id: &str) -> String {
    let short = &id[..id.len().min(8)];
    let mut name = format!("veth{short}");
    name.truncate(13);
    name
}

pub fn veth_peer_name(id: &str) -> String {
    format!("{}_c", veth_host_name(id))
}

/// `(first 6 hex chars of id parsed as a u32) % 250 + 2`, then linearly
/// probed against `in_use` to avoid colliding with an address already on
/// the host, wrapping into `[2, 254]` and giving up after 250 candidates
/// (falling back to 2 if every candidate is taken).
pub fn derive_ip_suffix(id: &str, in_use: impl Fn(u8) -> bool) -> u8 {
    let prefix = &id[..id.len().min(6)];
    let raw = u32::from_str_radix(prefix, 16).unwrap_or(0);
    let base = (raw % 250) as u8 + 2;

    let mut candidate = base;
    for _ in 0..250 {
        if !in_use(candidate) {
            return candidate;
        }
        candidate = if candidate >= 254 { 2 } else { candidate + 1 };
    }
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_id_is_32_hex_chars() {
        let id = generate_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn veth_name_never_exceeds_13_chars() {
        for _ in 0..100 {
            let id = generate_id();
            assert!(veth_host_name(&id).len() <= 13);
        }
    }

    #[test]
    fn ip_suffix_matches_spec_example() {
        // id = "abcdef0123456789...", 0xabcdef % 250 + 2
        let id = "abcdef0123456789";
        let suffix = derive_ip_suffix(id, |_| false);
        let expected = (0xabcdefu32 % 250) as u8 + 2;
        assert_eq!(suffix, expected);
    }

    #[test]
    fn ip_suffix_probes_past_collisions() {
        let id = "abcdef0123456789";
        let base = (0xabcdefu32 % 250) as u8 + 2;
        let suffix = derive_ip_suffix(id, |c| c == base);
        assert_ne!(suffix, base);
        assert!((2..=254).contains(&suffix));
    }

    #[test]
    fn ip_suffix_falls_back_to_2_when_everything_taken() {
        let id = "abcdef0123456789";
        let suffix = derive_ip_suffix(id, |_| true);
        assert_eq!(suffix, 2);
    }
}
