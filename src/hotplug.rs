//! Disk hotplug into a running worker VM.
//!
//! Attaching a disk is a host-side monitor command pair followed by a
//! guest-side discovery race: the guest kernel surfaces the new device
//! whenever it gets around to it, under a name nobody controls. The
//! coordinator turns that race into a bounded synchronous wait by diffing
//! before/after snapshots of the guest's disk set on a fixed poll schedule.

use crate::error::{Error, Result};
use crate::monitor::ControlChannel;
use crate::retry::RetryPolicy;
use crate::session::GuestExec;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Poll interval for guest device discovery.
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(1);

/// Discovery attempts before giving up with `DiskNotDetected`.
const DISCOVERY_ATTEMPTS: u32 = 6;

/// Lists "real" disks only; partitions, loop devices and optical drives
/// are filtered out when parsing.
const LIST_DISKS_CMD: &str = "lsblk -dn -o NAME,TYPE";

/// Guest disk format hint passed to the monitor's `drive_add`.
///
/// Chosen from the host file's extension; QEMU probing is not trusted for
/// hotplugged images, so unrecognized extensions get the safe default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    Raw,
    Qcow2,
    Vmdk,
    Vpc,
    Vhdx,
    Vdi,
}

impl DiskFormat {
    /// Map a host path's extension to a format hint. Unknown → `Raw`.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "qcow2" => DiskFormat::Qcow2,
            "vmdk" => DiskFormat::Vmdk,
            "vhd" => DiskFormat::Vpc,
            "vhdx" => DiskFormat::Vhdx,
            "vdi" => DiskFormat::Vdi,
            _ => DiskFormat::Raw,
        }
    }
}

impl std::fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Vpc => "vpc",
            DiskFormat::Vhdx => "vhdx",
            DiskFormat::Vdi => "vdi",
        };
        f.write_str(s)
    }
}

/// One mounted (or attempted) volume belonging to a hotplugged disk.
#[derive(Debug, Clone)]
pub struct PartitionMount {
    /// Guest device name, e.g. `sda1`.
    pub device: String,
    /// Guest mount path under the handle's mount root.
    pub mount_path: String,
    /// Whether this volume actually mounted and verified.
    pub mounted: bool,
}

/// Record of one attached disk, keyed by its deterministic id.
#[derive(Debug, Clone)]
pub struct HotplugHandle {
    /// Deterministic id derived from the host path; doubles as the
    /// monitor-side drive id.
    pub id: String,
    /// The host image file that was attached.
    pub host_path: PathBuf,
    /// Guest disk name discovered by the snapshot diff, e.g. `sda`.
    pub guest_device: String,
    /// Guest directory all of this disk's volumes mount under.
    pub mount_root: String,
    /// Per-volume mount results, successes and failures both.
    pub partition_mounts: Vec<PartitionMount>,
}

impl HotplugHandle {
    /// The volumes that actually mounted.
    pub fn mounted(&self) -> impl Iterator<Item = &PartitionMount> {
        self.partition_mounts.iter().filter(|p| p.mounted)
    }
}

/// FNV-1a over the path text; stable across runs so the same image always
/// gets the same drive id.
fn handle_id(path: &Path) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in path.to_string_lossy().as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("hp{:016x}", hash)
}

/// Run one cleanup step; failures are logged and swallowed so the next
/// step still runs.
fn best_effort(what: &str, step: impl FnOnce() -> Result<String>) {
    match step() {
        Ok(out) => tracing::debug!(what, out = out.as_str(), "cleanup step"),
        Err(e) => tracing::warn!(what, error = %e, "cleanup step failed, continuing"),
    }
}

/// Snapshot the guest's set of real disk devices.
///
/// `BTreeSet` keeps the diff ordered, so "first new device" is
/// deterministic even if several appear in one poll.
fn list_disks(exec: &mut dyn GuestExec) -> Result<BTreeSet<String>> {
    let raw = exec.exec(LIST_DISKS_CMD)?;
    let mut disks = BTreeSet::new();
    for line in raw.lines() {
        let mut fields = line.split_whitespace();
        let (Some(name), Some(kind)) = (fields.next(), fields.next()) else {
            continue;
        };
        if kind != "disk" {
            continue;
        }
        if ["loop", "sr", "ram", "fd", "zram"]
            .iter()
            .any(|p| name.starts_with(p))
        {
            continue;
        }
        disks.insert(name.to_string());
    }
    Ok(disks)
}

/// Partition names of one guest disk, e.g. `["sda1", "sda2"]`.
fn list_partitions(exec: &mut dyn GuestExec, disk: &str) -> Result<Vec<String>> {
    let raw = exec.exec(&format!("lsblk -rn -o NAME,TYPE /dev/{} 2>/dev/null", disk))?;
    let mut parts = Vec::new();
    for line in raw.lines() {
        let mut fields = line.split_whitespace();
        let (Some(name), Some(kind)) = (fields.next(), fields.next()) else {
            continue;
        };
        if kind == "part" {
            parts.push(name.to_string());
        }
    }
    Ok(parts)
}

/// Coordinator for attach/eject of secondary disks.
pub struct HotplugCoordinator {
    hotplug_root: String,
    discovery: RetryPolicy,
    handles: Mutex<HashMap<String, HotplugHandle>>,
}

impl HotplugCoordinator {
    /// Create a coordinator mounting under `hotplug_root`.
    pub fn new(hotplug_root: impl Into<String>) -> Self {
        Self::with_policy(
            hotplug_root,
            RetryPolicy::new(DISCOVERY_INTERVAL, DISCOVERY_ATTEMPTS),
        )
    }

    /// Override the discovery schedule (tests use a zero interval).
    pub fn with_policy(hotplug_root: impl Into<String>, discovery: RetryPolicy) -> Self {
        Self {
            hotplug_root: hotplug_root.into(),
            discovery,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a previously attached handle.
    pub fn handle(&self, id: &str) -> Option<HotplugHandle> {
        self.handles.lock().get(id).cloned()
    }

    /// Ids of all currently attached disks.
    pub fn attached_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handles.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The id `attach` would assign to this host path.
    pub fn id_for(&self, host_path: &Path) -> String {
        handle_id(host_path)
    }

    /// Attach a host disk image, discover it in the guest, and mount its
    /// volumes.
    ///
    /// Mount failures on individual partitions are recorded, not fatal;
    /// only zero successful mounts is an error, and that path detaches the
    /// device again before returning.
    pub fn attach(
        &self,
        chan: &dyn ControlChannel,
        exec: &mut dyn GuestExec,
        host_path: &Path,
    ) -> Result<HotplugHandle> {
        if !host_path.is_file() {
            return Err(Error::InvalidPath {
                path: host_path.to_path_buf(),
            });
        }

        let id = handle_id(host_path);

        // Ids are unique among attached handles. A second attach of the
        // same path would reuse the live attachment's drive id, and its
        // failure cleanup would then detach the live device; reuse the
        // existing handle instead of issuing any monitor traffic.
        if let Some(existing) = self.handles.lock().get(&id) {
            tracing::info!(id, path = %host_path.display(), "disk already attached, reusing handle");
            return Ok(existing.clone());
        }

        let format = DiskFormat::from_path(host_path);
        tracing::info!(id, path = %host_path.display(), %format, "attaching disk");

        let before = list_disks(exec)?;

        let resp = chan.command(&format!(
            "drive_add 0 file={},format={},if=none,id={}",
            host_path.display(),
            format,
            id
        ))?;
        tracing::debug!(id, resp = resp.as_str(), "drive_add");
        let resp = chan.command(&format!("device_add scsi-hd,drive={},id=dev_{}", id, id))?;
        tracing::debug!(id, resp = resp.as_str(), "device_add");

        let discovered = self.discovery.run(|attempt| match list_disks(exec) {
            Ok(after) => {
                let new = after.difference(&before).next().cloned();
                if new.is_none() {
                    tracing::debug!(id, attempt, "no new guest disk yet");
                }
                new
            }
            Err(e) => {
                tracing::debug!(id, attempt, error = %e, "disk snapshot failed");
                None
            }
        });

        let Some(device) = discovered else {
            self.detach_device(chan, &id);
            return Err(Error::DiskNotDetected {
                path: host_path.to_path_buf(),
                attempts: self.discovery.max_attempts,
            });
        };
        tracing::info!(id, device, "guest discovered hotplugged disk");

        let volumes = match list_partitions(exec, &device) {
            Ok(parts) if !parts.is_empty() => parts,
            Ok(_) => {
                // Unpartitioned image; mount the disk itself.
                vec![device.clone()]
            }
            Err(e) => {
                tracing::warn!(id, device, error = %e, "partition listing failed, mounting whole disk");
                vec![device.clone()]
            }
        };

        let mount_root = format!("{}/{}", self.hotplug_root, id);
        let mut partition_mounts = Vec::with_capacity(volumes.len());
        for volume in &volumes {
            let mount_path = format!("{}/{}", mount_root, volume);
            let mounted = self.mount_volume(exec, volume, &mount_path);
            partition_mounts.push(PartitionMount {
                device: volume.clone(),
                mount_path,
                mounted,
            });
        }

        if partition_mounts.iter().all(|p| !p.mounted) {
            self.unmount_tree(exec, &mount_root);
            self.detach_device(chan, &id);
            return Err(Error::NoMountableVolumes { device });
        }

        let handle = HotplugHandle {
            id: id.clone(),
            host_path: host_path.to_path_buf(),
            guest_device: device,
            mount_root,
            partition_mounts,
        };
        self.handles.lock().insert(id, handle.clone());
        Ok(handle)
    }

    /// Detach a disk and clean up its guest mounts.
    ///
    /// Every step is best-effort: a half-broken guest must not be able to
    /// stop host-side cleanup. The mount root is derivable from the id
    /// alone, so the guest sweep also runs for handles this process never
    /// attached (a previous invocation's attachment, for instance).
    pub fn eject(&self, chan: &dyn ControlChannel, exec: &mut dyn GuestExec, id: &str) {
        tracing::info!(id, "ejecting disk");
        let mount_root = match self.handles.lock().remove(id) {
            Some(handle) => handle.mount_root,
            None => {
                tracing::debug!(id, "no in-memory handle, sweeping derived mount root");
                format!("{}/{}", self.hotplug_root, id)
            }
        };
        self.unmount_tree(exec, &mount_root);
        self.detach_device(chan, id);
    }

    fn mount_volume(&self, exec: &mut dyn GuestExec, volume: &str, mount_path: &str) -> bool {
        let attempt = (|| -> Result<bool> {
            exec.exec(&format!("mkdir -p {}", mount_path))?;
            exec.exec(&format!("mount /dev/{} {} 2>&1", volume, mount_path))?;
            let check =
                exec.exec(&format!("mountpoint -q {} && echo OK || echo FAIL", mount_path))?;
            Ok(check.contains("OK"))
        })();
        match attempt {
            Ok(true) => {
                tracing::info!(volume, mount_path, "volume mounted");
                true
            }
            Ok(false) => {
                tracing::warn!(volume, mount_path, "volume did not mount");
                false
            }
            Err(e) => {
                tracing::warn!(volume, mount_path, error = %e, "volume mount errored");
                false
            }
        }
    }

    /// Unmount everything mounted under `mount_root` and remove the
    /// directories, from the guest's own mount table rather than any
    /// in-memory record.
    fn unmount_tree(&self, exec: &mut dyn GuestExec, mount_root: &str) {
        best_effort("umount tree", || {
            exec.exec(&format!(
                "for m in $(grep -o ' {root}/[^ ]*' /proc/mounts | cut -c2- | sort -r); \
                 do umount $m 2>/dev/null; done",
                root = mount_root
            ))
        });
        best_effort("rmdir tree", || {
            exec.exec(&format!(
                "rmdir {root}/* {root} 2>/dev/null || true",
                root = mount_root
            ))
        });
    }

    fn detach_device(&self, chan: &dyn ControlChannel, id: &str) {
        best_effort("device_del", || chan.command(&format!("device_del dev_{}", id)));
        best_effort("drive_del", || chan.command(&format!("drive_del {}", id)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::io::Write;

    struct FakeChannel {
        log: RefCell<Vec<String>>,
    }

    impl FakeChannel {
        fn new() -> Self {
            Self {
                log: RefCell::new(Vec::new()),
            }
        }
        fn log(&self) -> Vec<String> {
            self.log.borrow().clone()
        }
    }

    impl ControlChannel for FakeChannel {
        fn command(&self, cmd: &str) -> Result<String> {
            self.log.borrow_mut().push(cmd.to_string());
            Ok("OK".to_string())
        }
    }

    struct ScriptedGuest<F: FnMut(&str) -> Result<String>> {
        log: Vec<String>,
        respond: F,
    }

    impl<F: FnMut(&str) -> Result<String>> GuestExec for ScriptedGuest<F> {
        fn exec(&mut self, cmd: &str) -> Result<String> {
            self.log.push(cmd.to_string());
            (self.respond)(cmd)
        }
    }

    fn fast_coordinator() -> HotplugCoordinator {
        HotplugCoordinator::with_policy("/mnt/hotplug", RetryPolicy::new(Duration::ZERO, 6))
    }

    fn temp_image(name: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"not a real disk")
            .unwrap();
        (dir, path)
    }

    #[test]
    fn test_format_hint_from_extension() {
        assert_eq!(DiskFormat::from_path(Path::new("a.qcow2")), DiskFormat::Qcow2);
        assert_eq!(DiskFormat::from_path(Path::new("a.VMDK")), DiskFormat::Vmdk);
        assert_eq!(DiskFormat::from_path(Path::new("a.vhd")), DiskFormat::Vpc);
        assert_eq!(DiskFormat::from_path(Path::new("a.vhdx")), DiskFormat::Vhdx);
        assert_eq!(DiskFormat::from_path(Path::new("a.vdi")), DiskFormat::Vdi);
        assert_eq!(DiskFormat::from_path(Path::new("a.img")), DiskFormat::Raw);
        assert_eq!(DiskFormat::from_path(Path::new("noext")), DiskFormat::Raw);
        assert_eq!(DiskFormat::Vpc.to_string(), "vpc");
    }

    #[test]
    fn test_handle_id_is_deterministic_and_path_sensitive() {
        let a = handle_id(Path::new("/images/one.qcow2"));
        let b = handle_id(Path::new("/images/one.qcow2"));
        let c = handle_id(Path::new("/images/two.qcow2"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("hp"));
    }

    #[test]
    fn test_attach_missing_host_file_is_invalid_path() {
        let coord = fast_coordinator();
        let chan = FakeChannel::new();
        let mut guest = ScriptedGuest {
            log: Vec::new(),
            respond: |_| Ok(String::new()),
        };

        let err = coord
            .attach(&chan, &mut guest, Path::new("/nonexistent/disk.qcow2"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPath { .. }));
        assert!(chan.log().is_empty(), "no monitor traffic for a bad path");
    }

    #[test]
    fn test_attach_mounts_all_partitions() {
        let (_dir, image) = temp_image("apps.qcow2");
        let coord = fast_coordinator();
        let chan = FakeChannel::new();

        let mut disk_polls = 0;
        let mut guest = ScriptedGuest {
            log: Vec::new(),
            respond: move |cmd: &str| {
                if cmd == LIST_DISKS_CMD {
                    disk_polls += 1;
                    // New disk appears on the second snapshot (first poll).
                    return Ok(if disk_polls == 1 {
                        "vda disk\nsr0 rom\nloop0 loop".to_string()
                    } else {
                        "vda disk\nsda disk\nsr0 rom\nloop0 loop".to_string()
                    });
                }
                if cmd.starts_with("lsblk -rn -o NAME,TYPE /dev/sda") {
                    return Ok("sda disk\nsda1 part\nsda2 part".to_string());
                }
                if cmd.starts_with("mountpoint -q") {
                    return Ok("OK".to_string());
                }
                Ok(String::new())
            },
        };

        let handle = coord.attach(&chan, &mut guest, &image).unwrap();
        assert_eq!(handle.guest_device, "sda");
        assert_eq!(handle.partition_mounts.len(), 2);
        assert!(handle.partition_mounts.iter().all(|p| p.mounted));
        assert_eq!(handle.mounted().count(), 2);
        assert_eq!(
            handle.partition_mounts[0].mount_path,
            format!("/mnt/hotplug/{}/sda1", handle.id)
        );

        let monitor = chan.log();
        assert_eq!(monitor.len(), 2);
        assert!(monitor[0].starts_with("drive_add 0 file="));
        assert!(monitor[0].contains("format=qcow2"));
        assert!(monitor[1].starts_with("device_add scsi-hd,drive="));

        assert_eq!(coord.attached_ids(), vec![handle.id.clone()]);
        assert_eq!(coord.handle(&handle.id).unwrap().guest_device, "sda");
    }

    #[test]
    fn test_attach_unpartitioned_disk_mounts_whole_device() {
        let (_dir, image) = temp_image("blob.img");
        let coord = fast_coordinator();
        let chan = FakeChannel::new();

        let mut disk_polls = 0;
        let mut guest = ScriptedGuest {
            log: Vec::new(),
            respond: move |cmd: &str| {
                if cmd == LIST_DISKS_CMD {
                    disk_polls += 1;
                    return Ok(if disk_polls == 1 {
                        "vda disk".to_string()
                    } else {
                        "vda disk\nsdb disk".to_string()
                    });
                }
                if cmd.starts_with("lsblk -rn -o NAME,TYPE /dev/sdb") {
                    return Ok("sdb disk".to_string());
                }
                if cmd.starts_with("mountpoint -q") {
                    return Ok("OK".to_string());
                }
                Ok(String::new())
            },
        };

        let handle = coord.attach(&chan, &mut guest, &image).unwrap();
        assert_eq!(handle.partition_mounts.len(), 1);
        assert_eq!(handle.partition_mounts[0].device, "sdb");
        assert!(handle.partition_mounts[0].mounted);
        assert!(guest
            .log
            .iter()
            .any(|c| c.starts_with("mount /dev/sdb ")));
    }

    #[test]
    fn test_attach_times_out_when_no_disk_appears() {
        let (_dir, image) = temp_image("ghost.vhd");
        let coord = fast_coordinator();
        let chan = FakeChannel::new();

        let mut guest = ScriptedGuest {
            log: Vec::new(),
            respond: |cmd: &str| {
                if cmd == LIST_DISKS_CMD {
                    return Ok("vda disk".to_string());
                }
                Ok(String::new())
            },
        };

        let err = coord.attach(&chan, &mut guest, &image).unwrap_err();
        assert!(matches!(err, Error::DiskNotDetected { attempts: 6, .. }));

        // Before-snapshot plus six polls, and nothing else touched the guest.
        let snapshots = guest.log.iter().filter(|c| *c == LIST_DISKS_CMD).count();
        assert_eq!(snapshots, 7);
        assert!(!guest.log.iter().any(|c| c.starts_with("mount ")));

        // Failed attach must detach what it added.
        let monitor = chan.log();
        assert!(monitor.iter().any(|c| c.starts_with("device_del dev_hp")));
        assert!(monitor.iter().any(|c| c.starts_with("drive_del hp")));
        assert!(coord.attached_ids().is_empty());
    }

    #[test]
    fn test_attach_with_zero_mountable_volumes_cleans_up() {
        let (_dir, image) = temp_image("bad.qcow2");
        let coord = fast_coordinator();
        let chan = FakeChannel::new();

        let mut disk_polls = 0;
        let mut guest = ScriptedGuest {
            log: Vec::new(),
            respond: move |cmd: &str| {
                if cmd == LIST_DISKS_CMD {
                    disk_polls += 1;
                    return Ok(if disk_polls == 1 {
                        "vda disk".to_string()
                    } else {
                        "vda disk\nsda disk".to_string()
                    });
                }
                if cmd.starts_with("lsblk -rn -o NAME,TYPE /dev/sda") {
                    return Ok("sda disk\nsda1 part".to_string());
                }
                if cmd.starts_with("mountpoint -q") {
                    return Ok("FAIL".to_string());
                }
                Ok(String::new())
            },
        };

        let err = coord.attach(&chan, &mut guest, &image).unwrap_err();
        assert!(matches!(err, Error::NoMountableVolumes { .. }));

        assert!(guest.log.iter().any(|c| c.contains("/proc/mounts")));
        let monitor = chan.log();
        assert!(monitor.iter().any(|c| c.starts_with("device_del ")));
        assert!(coord.attached_ids().is_empty());
    }

    #[test]
    fn test_one_partition_failing_does_not_abort_the_rest() {
        let (_dir, image) = temp_image("mixed.qcow2");
        let coord = fast_coordinator();
        let chan = FakeChannel::new();

        let mut disk_polls = 0;
        let mut guest = ScriptedGuest {
            log: Vec::new(),
            respond: move |cmd: &str| {
                if cmd == LIST_DISKS_CMD {
                    disk_polls += 1;
                    return Ok(if disk_polls == 1 {
                        "vda disk".to_string()
                    } else {
                        "vda disk\nsda disk".to_string()
                    });
                }
                if cmd.starts_with("lsblk -rn -o NAME,TYPE /dev/sda") {
                    return Ok("sda disk\nsda1 part\nsda2 part".to_string());
                }
                if cmd.starts_with("mountpoint -q") {
                    // Only the second partition's mount verifies.
                    return Ok(if cmd.contains("/sda1") {
                        "FAIL".to_string()
                    } else {
                        "OK".to_string()
                    });
                }
                Ok(String::new())
            },
        };

        let handle = coord.attach(&chan, &mut guest, &image).unwrap();
        assert_eq!(handle.partition_mounts.len(), 2);
        assert!(!handle.partition_mounts[0].mounted);
        assert!(handle.partition_mounts[1].mounted);
        assert_eq!(handle.mounted().count(), 1);
    }

    #[test]
    fn test_eject_unmounts_and_detaches() {
        let (_dir, image) = temp_image("apps.qcow2");
        let coord = fast_coordinator();
        let chan = FakeChannel::new();

        let mut disk_polls = 0;
        let mut guest = ScriptedGuest {
            log: Vec::new(),
            respond: move |cmd: &str| {
                if cmd == LIST_DISKS_CMD {
                    disk_polls += 1;
                    return Ok(if disk_polls == 1 {
                        "vda disk".to_string()
                    } else {
                        "vda disk\nsda disk".to_string()
                    });
                }
                if cmd.starts_with("lsblk -rn -o NAME,TYPE /dev/sda") {
                    return Ok("sda disk\nsda1 part".to_string());
                }
                if cmd.starts_with("mountpoint -q") {
                    return Ok("OK".to_string());
                }
                Ok(String::new())
            },
        };

        let handle = coord.attach(&chan, &mut guest, &image).unwrap();
        coord.eject(&chan, &mut guest, &handle.id);

        // The sweep reads the guest mount table under the handle's root.
        assert!(guest
            .log
            .iter()
            .any(|c| c.contains("/proc/mounts") && c.contains(&handle.mount_root)));
        assert!(guest
            .log
            .iter()
            .any(|c| c.starts_with(&format!("rmdir {}", handle.mount_root))));

        let monitor = chan.log();
        assert_eq!(
            monitor.last().unwrap(),
            &format!("drive_del {}", handle.id)
        );
        assert!(monitor
            .iter()
            .any(|c| c == &format!("device_del dev_{}", handle.id)));
        assert!(coord.attached_ids().is_empty());
    }

    #[test]
    fn test_eject_unknown_id_sweeps_derived_mount_root() {
        let coord = fast_coordinator();
        let chan = FakeChannel::new();
        let mut guest = ScriptedGuest {
            log: Vec::new(),
            respond: |_| Ok(String::new()),
        };

        coord.eject(&chan, &mut guest, "hp0000000000000000");

        // Without an in-memory handle the mount root comes from the id.
        assert!(guest
            .log
            .iter()
            .any(|c| c.contains("/proc/mounts") && c.contains("/mnt/hotplug/hp0000000000000000")));
        assert!(guest
            .log
            .iter()
            .any(|c| c.starts_with("rmdir /mnt/hotplug/hp0000000000000000")));
        let monitor = chan.log();
        assert_eq!(monitor[0], "device_del dev_hp0000000000000000");
        assert_eq!(monitor[1], "drive_del hp0000000000000000");
    }

    #[test]
    fn test_eject_from_fresh_coordinator_cleans_guest_mounts() {
        // Attach and eject happen in different CLI invocations, so the
        // ejecting coordinator has never seen the handle.
        let (_dir, image) = temp_image("apps.qcow2");
        let attacher = fast_coordinator();
        let ejector = fast_coordinator();
        let chan = FakeChannel::new();

        let mut disk_polls = 0;
        let mut guest = ScriptedGuest {
            log: Vec::new(),
            respond: move |cmd: &str| {
                if cmd == LIST_DISKS_CMD {
                    disk_polls += 1;
                    return Ok(if disk_polls == 1 {
                        "vda disk".to_string()
                    } else {
                        "vda disk\nsda disk".to_string()
                    });
                }
                if cmd.starts_with("lsblk -rn -o NAME,TYPE /dev/sda") {
                    return Ok("sda disk\nsda1 part".to_string());
                }
                if cmd.starts_with("mountpoint -q") {
                    return Ok("OK".to_string());
                }
                Ok(String::new())
            },
        };

        let handle = attacher.attach(&chan, &mut guest, &image).unwrap();
        ejector.eject(&chan, &mut guest, &handle.id);

        assert!(guest
            .log
            .iter()
            .any(|c| c.contains("/proc/mounts") && c.contains(&handle.mount_root)));
        assert!(guest
            .log
            .iter()
            .any(|c| c.starts_with(&format!("rmdir {}", handle.mount_root))));
        assert_eq!(
            chan.log().last().unwrap(),
            &format!("drive_del {}", handle.id)
        );
    }

    #[test]
    fn test_reattach_same_path_reuses_live_handle() {
        let (_dir, image) = temp_image("apps.qcow2");
        let coord = fast_coordinator();
        let chan = FakeChannel::new();

        let mut disk_polls = 0;
        let mut guest = ScriptedGuest {
            log: Vec::new(),
            respond: move |cmd: &str| {
                if cmd == LIST_DISKS_CMD {
                    disk_polls += 1;
                    return Ok(if disk_polls == 1 {
                        "vda disk".to_string()
                    } else {
                        "vda disk\nsda disk".to_string()
                    });
                }
                if cmd.starts_with("lsblk -rn -o NAME,TYPE /dev/sda") {
                    return Ok("sda disk\nsda1 part".to_string());
                }
                if cmd.starts_with("mountpoint -q") {
                    return Ok("OK".to_string());
                }
                Ok(String::new())
            },
        };

        let first = coord.attach(&chan, &mut guest, &image).unwrap();
        let second = coord.attach(&chan, &mut guest, &image).unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.guest_device, first.guest_device);
        assert_eq!(second.mounted().count(), 1);

        // One drive_add/device_add pair total; the live device was never
        // detached.
        let monitor = chan.log();
        assert_eq!(monitor.len(), 2);
        assert!(!monitor.iter().any(|c| c.starts_with("device_del")));
        assert_eq!(coord.attached_ids(), vec![first.id.clone()]);
        assert_eq!(
            coord.handle(&first.id).unwrap().mounted().count(),
            1,
            "registered handle must still report its mounts"
        );
    }

    #[test]
    fn test_guest_error_during_mount_is_recorded_not_fatal() {
        let (_dir, image) = temp_image("half.qcow2");
        let coord = fast_coordinator();
        let chan = FakeChannel::new();

        let mut disk_polls = 0;
        let mut guest = ScriptedGuest {
            log: Vec::new(),
            respond: move |cmd: &str| {
                if cmd == LIST_DISKS_CMD {
                    disk_polls += 1;
                    return Ok(if disk_polls == 1 {
                        "vda disk".to_string()
                    } else {
                        "vda disk\nsda disk".to_string()
                    });
                }
                if cmd.starts_with("lsblk -rn -o NAME,TYPE /dev/sda") {
                    return Ok("sda disk\nsda1 part\nsda2 part".to_string());
                }
                if cmd.starts_with("mount /dev/sda1") {
                    return Err(Error::connect("channel dropped"));
                }
                if cmd.starts_with("mountpoint -q") {
                    return Ok("OK".to_string());
                }
                Ok(String::new())
            },
        };

        let handle = coord.attach(&chan, &mut guest, &image).unwrap();
        assert!(!handle.partition_mounts[0].mounted);
        assert!(handle.partition_mounts[1].mounted);
    }
}
