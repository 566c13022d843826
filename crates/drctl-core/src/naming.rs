use crate::error::{DrError, Result};

/// NAA prefix the array vendor puts in front of a volume serial to form the
/// SCSI canonical name the hypervisor reports.
pub const CANONICAL_PREFIX: &str = "naa.624a9370";

/// Directory under which an ESXi host exposes raw disk devices.
pub const DEVICE_DIR: &str = "/vmfs/devices/disks/";

/// Canonical device name for an array serial: prefix + lowercased serial,
/// as ESXi reports it.
pub fn canonical_name(serial: &str) -> String {
    format!("{}{}", CANONICAL_PREFIX, serial.to_ascii_lowercase())
}

/// Host device path for a canonical name. ESXi lowercases device names.
pub fn device_path(canonical: &str) -> String {
    format!("{}{}", DEVICE_DIR, canonical.to_ascii_lowercase())
}

/// Recover the serial from a canonical name, if it carries the vendor prefix.
pub fn serial_from_canonical(canonical: &str) -> Option<&str> {
    canonical
        .strip_prefix(CANONICAL_PREFIX)
        .filter(|s| !s.is_empty())
}

/// Definition file name the hypervisor gives a VM's `.vmx`.
pub fn vmx_file_name(vm_name: &str) -> String {
    format!("{}.vmx", vm_name)
}

/// Datastore-qualified folder path: `[datastore] folder`.
pub fn folder_path(datastore: &str, folder: &str) -> String {
    format!("[{}] {}", datastore, folder)
}

/// Validate an array volume or snapshot name: 1-63 chars, alphanumeric plus
/// `-`, `_`, `.`, `:`, starting with an alphanumeric. Snapshot names use `.`
/// and `:` as separators (`pgroup.snap-1.vol`).
pub fn validate_volume_name(name: &str, kind: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        return Err(DrError::invalid(format!(
            "{} name must be 1-63 characters, got {}",
            kind,
            name.len()
        )));
    }
    if !name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        return Err(DrError::invalid(format!(
            "{} name must start with a letter or digit: {:?}",
            kind, name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(DrError::invalid(format!(
            "{} name must be alphanumeric plus '-', '_', '.', ':': {:?}",
            kind, name
        )));
    }
    Ok(())
}

/// Validate an array serial: 1-32 hex digits.
pub fn validate_serial(serial: &str) -> Result<()> {
    if serial.is_empty() || serial.len() > 32 {
        return Err(DrError::invalid(format!(
            "serial must be 1-32 characters, got {}",
            serial.len()
        )));
    }
    if !serial.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(DrError::invalid(format!(
            "serial must be hexadecimal: {:?}",
            serial
        )));
    }
    Ok(())
}

/// Validate a hypervisor object name (VM, datastore, port group). These are
/// free-form in vSphere, so only emptiness, length, and control characters
/// are rejected.
pub fn validate_display_name(name: &str, kind: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(DrError::invalid(format!("{} name must not be empty", kind)));
    }
    if name.len() > 80 {
        return Err(DrError::invalid(format!(
            "{} name must be at most 80 characters, got {}",
            kind,
            name.len()
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(DrError::invalid(format!(
            "{} name must not contain control characters: {:?}",
            kind, name
        )));
    }
    Ok(())
}

/// Validate a datastore path to a VM definition file: `[ds] dir/name.vmx`.
pub fn validate_vmx_path(path: &str) -> Result<()> {
    if !path.starts_with('[') || !path.contains("] ") {
        return Err(DrError::invalid(format!(
            "VMX path must be datastore-qualified ('[ds] dir/file.vmx'): {:?}",
            path
        )));
    }
    if !path.ends_with(".vmx") {
        return Err(DrError::invalid(format!(
            "VMX path must end in .vmx: {:?}",
            path
        )));
    }
    if path.chars().any(char::is_control) {
        return Err(DrError::invalid(format!(
            "VMX path must not contain control characters: {:?}",
            path
        )));
    }
    Ok(())
}
