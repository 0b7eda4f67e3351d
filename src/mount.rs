//! Target-partition selection and mounting.
//!
//! Neither the partition index nor the block-device name of the Android
//! data partition is stable across emulator products, versions, or even
//! reattachments of the same image. Selection is therefore an ordered
//! candidate pipeline with verification:
//!
//! 1. a product-specific probe for a well-known device node,
//! 2. the largest partition on the secondary disk,
//! 3. a static list of legacy guesses,
//!
//! trying each until one both mounts and verifies as an actual mount point.

use crate::error::{Error, Result};
use crate::session::GuestExec;

/// Which emulator product produced the target disk image.
///
/// Affects the primary mount heuristic; everything else treats products
/// identically.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TargetKind {
    /// LDPlayer images reliably expose system/data as `/dev/vdb2`.
    LdPlayer,
    /// MEmu.
    Memu,
    /// BlueStacks.
    BlueStacks,
    /// Anything else; only the generic heuristics apply.
    #[default]
    Unknown,
}

impl TargetKind {
    /// Parse a product identifier as reported by the emulator-detection
    /// layer (case-insensitive).
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "LDPLAYER" => TargetKind::LdPlayer,
            "MEMU" => TargetKind::Memu,
            "BLUESTACKS" => TargetKind::BlueStacks,
            _ => TargetKind::Unknown,
        }
    }

    /// The well-known device node for this product, if it has one.
    fn preferred_device(&self) -> Option<&'static str> {
        match self {
            TargetKind::LdPlayer => Some("/dev/vdb2"),
            _ => None,
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetKind::LdPlayer => write!(f, "LDPLAYER"),
            TargetKind::Memu => write!(f, "MEMU"),
            TargetKind::BlueStacks => write!(f, "BLUESTACKS"),
            TargetKind::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Result of a successful `mount_target`.
#[derive(Debug, Clone)]
pub struct MountOutcome {
    /// The device that mounted and verified.
    pub device: String,
    /// Whether the mounted filesystem carries Android root markers
    /// (`/app` or `/system`). A mount without markers is returned anyway;
    /// callers use this flag to warn.
    pub markers_present: bool,
}

/// Mount the target Android filesystem at `mount_point`.
///
/// Candidates are tried strictly in order: product probe, then largest
/// partition, then the static `fallback` tail. The first candidate that
/// both mounts and verifies via `mountpoint -q` wins. A failed root-marker
/// check does not undo the mount; it only clears `markers_present`.
pub fn mount_target(
    exec: &mut dyn GuestExec,
    kind: &TargetKind,
    mount_point: &str,
    fallback: &[String],
) -> Result<MountOutcome> {
    // Idempotent reset of the mount point.
    exec.exec(&format!("mkdir -p {}", mount_point))?;
    exec.exec(&format!("umount {} 2>/dev/null || true", mount_point))?;

    let candidates = build_candidates(exec, kind, fallback);

    for device in &candidates {
        tracing::info!(device, mount_point, "trying mount candidate");
        exec.exec(&format!(
            "mount -t ext4 -o rw,noatime {} {} 2>&1",
            device, mount_point
        ))?;

        // The mount command's output is unreliable; only `mountpoint`
        // counts as verification.
        let check = exec.exec(&format!(
            "mountpoint -q {} && echo OK || echo FAIL",
            mount_point
        ))?;
        if check.trim() != "OK" {
            continue;
        }

        let markers = exec.exec(&format!(
            "if [ -d {m}/app ] || [ -d {m}/system ]; then echo CHECK_OK; else echo CHECK_FAIL; fi",
            m = mount_point
        ))?;
        let markers_present = markers.contains("CHECK_OK");
        if markers_present {
            tracing::info!(device, "target partition mounted");
        } else {
            tracing::warn!(
                device,
                "mounted partition does not look like an Android system image"
            );
        }

        return Ok(MountOutcome {
            device: device.clone(),
            markers_present,
        });
    }

    Err(Error::MountFailed {
        candidates,
        mount_point: mount_point.to_string(),
    })
}

/// Build the ordered, deduplicated candidate list.
fn build_candidates(
    exec: &mut dyn GuestExec,
    kind: &TargetKind,
    fallback: &[String],
) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();

    if let Some(device) = kind.preferred_device() {
        match probe_device(exec, device) {
            Ok(true) => {
                tracing::info!(%kind, device, "product probe hit");
                candidates.push(device.to_string());
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(%kind, error = %e, "product probe failed"),
        }
    }

    // Partition numbering is unreliable; partition size is not. Only
    // enumerate when the product probe produced nothing.
    if candidates.is_empty() {
        match largest_partition(exec) {
            Ok(Some(device)) => {
                tracing::info!(device, "largest-partition heuristic selected");
                candidates.push(device);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "partition enumeration failed"),
        }
    }

    for device in fallback {
        if !candidates.contains(device) {
            candidates.push(device.clone());
        }
    }
    candidates
}

/// Remount the target filesystem read-write (best-effort).
pub fn remount_rw(exec: &mut dyn GuestExec, mount_point: &str) -> Result<String> {
    exec.exec(&format!("mount -o remount,rw {} 2>&1 || true", mount_point))
}

/// Remount the target filesystem read-only (best-effort).
pub fn remount_ro(exec: &mut dyn GuestExec, mount_point: &str) -> Result<String> {
    exec.exec(&format!("mount -o remount,ro {} 2>&1 || true", mount_point))
}

/// Whether `device` exists as a block device in the guest.
fn probe_device(exec: &mut dyn GuestExec, device: &str) -> Result<bool> {
    let out = exec.exec(&format!("test -b {} && echo YES || echo NO", device))?;
    Ok(out.trim() == "YES")
}

/// Pick the largest partition on the secondary disk, by byte count.
fn largest_partition(exec: &mut dyn GuestExec) -> Result<Option<String>> {
    let raw = exec.exec(
        "lsblk -rn -b -o NAME,SIZE,TYPE /dev/vdb 2>/dev/null || \
         lsblk -rn -b -o NAME,SIZE,TYPE /dev/sdb 2>/dev/null",
    )?;

    let mut best: Option<(String, u64)> = None;
    for line in raw.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields[2] != "part" {
            continue;
        }
        let Ok(size) = fields[1].parse::<u64>() else {
            continue;
        };
        if best.as_ref().map_or(true, |(_, max)| size > *max) {
            best = Some((fields[0].to_string(), size));
        }
    }

    Ok(best.map(|(name, size)| {
        tracing::debug!(name, size, "largest partition");
        if name.starts_with('/') {
            name
        } else {
            format!("/dev/{}", name)
        }
    }))
}
