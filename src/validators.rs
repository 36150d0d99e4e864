//! Name validation for kernel objects
//!
//! Fragment file names double as kernel object names (ipsets, tunnels) and
//! fragment contents name interfaces. The kernel enforces length limits that
//! would otherwise surface as opaque tool errors halfway through a pass.

/// Maximum ipset name length (`IPSET_MAXNAMELEN` - 1)
pub const MAX_IPSET_NAME_LEN: usize = 31;

/// Maximum interface name length (`IFNAMSIZ` - 1)
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Validates an ipset name.
///
/// # Errors
///
/// Returns `Err` if:
/// - Name is empty or longer than 31 bytes
/// - Name contains whitespace or control characters
///
/// # Examples
///
/// ```
/// use applyd::validators::validate_ipset_name;
///
/// assert!(validate_ipset_name("blocklist-v4").is_ok());
/// assert!(validate_ipset_name("has space").is_err());
/// ```
pub fn validate_ipset_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Set name cannot be empty".to_string());
    }
    if name.len() > MAX_IPSET_NAME_LEN {
        return Err(format!(
            "Set name too long (max {MAX_IPSET_NAME_LEN} characters)"
        ));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("Set name contains whitespace or control characters".to_string());
    }
    Ok(())
}

/// Validates an interface (or tunnel) name.
///
/// Mirrors the kernel's `dev_valid_name()`.
///
/// # Errors
///
/// Returns `Err` if:
/// - Name is empty, `.` or `..`
/// - Name exceeds 15 characters
/// - Name contains `/`, `:` or whitespace
pub fn validate_interface_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Interface name cannot be empty".to_string());
    }
    if name == "." || name == ".." {
        return Err("Interface name cannot be '.' or '..'".to_string());
    }
    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(format!(
            "Interface name too long (max {MAX_INTERFACE_NAME_LEN} characters)"
        ));
    }
    if name
        .chars()
        .any(|c| c == '/' || c == ':' || c.is_whitespace() || c.is_control())
    {
        return Err("Interface name contains invalid characters".to_string());
    }
    Ok(())
}
