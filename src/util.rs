//! Small shared helpers: name validation, size units, MAC generation.

use crate::error::{Error, Result};
use rand::Rng;

/// Bytes in one GiB.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Maximum length of entity names (VMs, pools, volumes, snapshots, images).
pub const MAX_NAME_LEN: usize = 64;

/// Maximum length of a guest target device name (`vda`, `sdb`, `hdc` ...).
pub const MAX_TARGET_DEV_LEN: usize = 16;

/// Locally administered prefix used by QEMU/KVM for guest NICs.
pub const MAC_PREFIX: [u8; 3] = [0x52, 0x54, 0x00];

/// Validate an entity name.
///
/// Names are used as URL path segments and as hypervisor object names, so
/// they are restricted to `[A-Za-z0-9._-]`, must not start with `.` or `-`,
/// and are at most [`MAX_NAME_LEN`] characters.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation(format!("{} name cannot be empty", kind)));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::validation(format!(
            "{} name '{}' exceeds {} characters",
            kind, name, MAX_NAME_LEN
        )));
    }
    if name.starts_with('.') || name.starts_with('-') {
        return Err(Error::validation(format!(
            "{} name '{}' must not start with '.' or '-'",
            kind, name
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(Error::validation(format!(
            "{} name '{}' contains invalid character '{}'",
            kind, name, c
        )));
    }
    Ok(())
}

/// Validate a guest target device name such as `vda` or `sdb1`.
pub fn validate_target_dev(target: &str) -> Result<()> {
    let mut chars = target.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_lowercase()
                && target.len() <= MAX_TARGET_DEV_LEN
                && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "invalid target device '{}': expected lowercase letters and digits, starting with a letter",
            target
        )))
    }
}

/// Convert whole GiB to bytes, rejecting zero and overflow.
pub fn gib_to_bytes(size_gb: u64) -> Result<u64> {
    if size_gb == 0 {
        return Err(Error::validation("size must be at least 1 GiB"));
    }
    size_gb
        .checked_mul(GIB)
        .ok_or_else(|| Error::validation(format!("size {} GiB is too large", size_gb)))
}

/// Generate a random MAC address in the `52:54:00` range.
pub fn random_mac() -> String {
    let mut rng = rand::thread_rng();
    let tail: [u8; 3] = rng.gen();
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        MAC_PREFIX[0], MAC_PREFIX[1], MAC_PREFIX[2], tail[0], tail[1], tail[2]
    )
}

/// Generate a MAC address not present in `taken`.
pub fn unique_mac<'a>(taken: impl Iterator<Item = &'a str> + Clone) -> String {
    loop {
        let mac = random_mac();
        if !taken.clone().any(|t| t.eq_ignore_ascii_case(&mac)) {
            return mac;
        }
    }
}
