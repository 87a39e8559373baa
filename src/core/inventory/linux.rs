//! Linux block-device discovery via `lsblk`, `findmnt` and sysfs.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;

use super::{DriveProvider, Partition, PhysicalPort, PortLink};
use crate::core::models::{Drive, UsbSpeed};
use crate::core::progress::human_size;

const BY_PATH_DIR: &str = "/dev/disk/by-path";

pub struct LinuxInventory;

#[derive(Debug, Deserialize)]
struct LsblkReport {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LsblkDevice {
    name: String,
    size: Option<u64>,
    #[serde(rename = "type")]
    kind: String,
    mountpoint: Option<String>,
    mountpoints: Option<Vec<Option<String>>>,
    vendor: Option<String>,
    model: Option<String>,
    serial: Option<String>,
    tran: Option<String>,
    rm: bool,
    hotplug: bool,
    fstype: Option<String>,
    children: Option<Vec<LsblkDevice>>,
}

async fn run_lsblk(args: &[&str]) -> Result<LsblkReport> {
    let output = Command::new("lsblk")
        .args(args)
        .output()
        .await
        .context("spawning lsblk")?;
    if !output.status.success() {
        bail!(
            "lsblk exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    serde_json::from_slice(&output.stdout).context("parsing lsblk JSON")
}

/// The whole-disk node behind `/`, e.g. `/dev/sda1` -> `/dev/sda`.
async fn root_device() -> String {
    let output = match Command::new("findmnt")
        .args(["-n", "-o", "SOURCE", "/"])
        .output()
        .await
    {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim().to_string(),
        _ => return String::new(),
    };
    strip_partition_suffix(&output)
}

fn strip_partition_suffix(source: &str) -> String {
    let re = Regex::new(r"^(/dev/(?:sd[a-z]+|vd[a-z]+|nvme\d+n\d+|mmcblk\d+))").unwrap();
    match re.captures(source) {
        Some(c) => c[1].to_string(),
        None => source.to_string(),
    }
}

/// Map device node -> by-path symlink.
fn by_path_map() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(entries) = std::fs::read_dir(BY_PATH_DIR) else {
        return map;
    };
    for entry in entries.flatten() {
        if let Ok(target) = std::fs::canonicalize(entry.path()) {
            map.insert(
                target.to_string_lossy().to_string(),
                entry.path().to_string_lossy().to_string(),
            );
        }
    }
    map
}

fn mountpoints_of(device: &LsblkDevice) -> Vec<String> {
    let mut mounts = Vec::new();
    let mut push = |mp: &Option<String>| {
        if let Some(mp) = mp {
            if !mp.is_empty() && !mounts.contains(mp) {
                mounts.push(mp.clone());
            }
        }
    };
    push(&device.mountpoint);
    if let Some(list) = &device.mountpoints {
        for mp in list {
            push(mp);
        }
    }
    for child in device.children.as_deref().unwrap_or_default() {
        push(&child.mountpoint);
        if let Some(list) = &child.mountpoints {
            for mp in list {
                push(mp);
            }
        }
    }
    mounts
}

fn drives_from_report(
    report: &LsblkReport,
    root_dev: &str,
    by_path: &HashMap<String, String>,
) -> Vec<Drive> {
    let mut drives = Vec::new();
    for dev in &report.blockdevices {
        if dev.kind != "disk" {
            continue;
        }
        let device_path = format!("/dev/{}", dev.name);
        let removable = dev.rm || dev.hotplug;
        let mounts = mountpoints_of(dev);
        let is_system = device_path == root_dev
            || mounts
                .iter()
                .any(|m| m == "/" || m.starts_with("/boot"));
        let size = dev.size.unwrap_or(0);
        let port = by_path.get(&device_path).cloned();
        let usb_speed = match (&port, dev.tran.as_deref()) {
            (Some(p), Some("usb")) => usb_speed_for_port(p),
            _ => UsbSpeed::Unknown,
        };

        let clean = |s: &Option<String>| {
            s.as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        drives.push(Drive {
            device_path,
            by_path: port,
            model: clean(&dev.model),
            serial: clean(&dev.serial),
            vendor: clean(&dev.vendor),
            size_bytes: size,
            size_human: human_size(size),
            removable,
            mounted: !mounts.is_empty(),
            mountpoints: mounts,
            usb_speed,
            is_system,
        });
    }
    drives
}

/// USB generation for a by-path entry: the path string sometimes encodes it
/// directly; otherwise the advertised speed comes from sysfs.
fn usb_speed_for_port(port_path: &str) -> UsbSpeed {
    let lower = port_path.to_lowercase();
    if lower.contains("usb3") || lower.contains("usbv3") {
        return UsbSpeed::Usb3;
    }
    if lower.contains("usb2") || lower.contains("usbv2") {
        return UsbSpeed::Usb2;
    }
    match sysfs_speed_mbps(port_path) {
        Some(mbps) if mbps >= 10_000 => UsbSpeed::Usb32,
        Some(mbps) if mbps >= 5_000 => UsbSpeed::Usb3,
        Some(mbps) if mbps >= 480 => UsbSpeed::Usb2,
        _ => UsbSpeed::Unknown,
    }
}

fn sysfs_speed_mbps(port_path: &str) -> Option<u64> {
    let re = Regex::new(r"usb[v23]*-(\d+):(\d+(?:\.\d+)*)").unwrap();
    let caps = re.captures(port_path)?;
    let sysfs = format!("/sys/bus/usb/devices/{}-{}/speed", &caps[1], &caps[2]);
    std::fs::read_to_string(sysfs)
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
}

/// Short operator-facing name, e.g.
/// `pci-0000:00:14.0-usb-0:3:1.0-scsi-0:0:0:0` -> `USB 0:3`.
fn port_alias(port_path: &str) -> String {
    let name = Path::new(port_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| port_path.to_string());
    let re = Regex::new(r"usb[v23]*-(\d+:\d+(?:\.\d+)?)").unwrap();
    if let Some(caps) = re.captures(&name) {
        return format!("USB {}", &caps[1]);
    }
    if name.len() > 20 {
        name[name.len() - 20..].to_string()
    } else {
        name
    }
}

fn is_partition_link(name: &str) -> bool {
    let re = Regex::new(r"-part\d+$").unwrap();
    re.is_match(name)
}

#[async_trait]
impl DriveProvider for LinuxInventory {
    async fn list_drives(&self, only_removable: bool) -> Result<Vec<Drive>> {
        let report = run_lsblk(&[
            "-J",
            "-b",
            "-o",
            "NAME,SIZE,TYPE,MOUNTPOINT,MOUNTPOINTS,VENDOR,MODEL,SERIAL,TRAN,RM,HOTPLUG",
        ])
        .await?;
        let root = root_device().await;
        let by_path = by_path_map();
        let mut drives = drives_from_report(&report, &root, &by_path);
        if only_removable {
            drives.retain(|d| d.removable);
        }
        Ok(drives)
    }

    async fn list_ports(&self) -> Result<Vec<PortLink>> {
        let mut ports = Vec::new();
        let Ok(entries) = std::fs::read_dir(BY_PATH_DIR) else {
            return Ok(ports);
        };
        for entry in entries.flatten() {
            if let Ok(target) = std::fs::canonicalize(entry.path()) {
                ports.push(PortLink {
                    port_path: entry.path().to_string_lossy().to_string(),
                    device: target.to_string_lossy().to_string(),
                });
            }
        }
        ports.sort_by(|a, b| a.port_path.cmp(&b.port_path));
        Ok(ports)
    }

    async fn list_physical_ports(&self) -> Result<Vec<PhysicalPort>> {
        let drives = self.list_drives(false).await?;
        let drive_by_port: HashMap<&str, &Drive> = drives
            .iter()
            .filter_map(|d| d.by_path.as_deref().map(|p| (p, d)))
            .collect();

        let mut result = Vec::new();
        let Ok(entries) = std::fs::read_dir(BY_PATH_DIR) else {
            return Ok(result);
        };
        let mut links: Vec<_> = entries.flatten().collect();
        links.sort_by_key(|e| e.path());

        for entry in links {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_partition_link(&name) {
                continue;
            }
            let port_path = entry.path().to_string_lossy().to_string();
            let target = std::fs::canonicalize(entry.path())
                .map(|t| t.to_string_lossy().to_string())
                .unwrap_or_default();

            let drive = drive_by_port.get(port_path.as_str()).copied().or_else(|| {
                drives.iter().find(|d| d.device_path == target)
            });

            result.push(PhysicalPort {
                alias: port_alias(&port_path),
                usb_speed: usb_speed_for_port(&port_path),
                device_path: drive.map(|d| d.device_path.clone()),
                device_model: drive.and_then(|d| d.model.clone()),
                device_size: drive.map(|d| d.size_human.clone()),
                device_serial: drive.and_then(|d| d.serial.clone()),
                device_vendor: drive.and_then(|d| d.vendor.clone()),
                removable: drive.map(|d| d.removable).unwrap_or(false),
                is_system: drive.map(|d| d.is_system).unwrap_or(false),
                occupied: drive.is_some(),
                port_path,
            });
        }
        Ok(result)
    }

    async fn partitions(&self, device_path: &str) -> Result<Vec<Partition>> {
        let report = run_lsblk(&["-J", "-o", "NAME,FSTYPE,MOUNTPOINT,TYPE", device_path]).await?;
        let mut parts = Vec::new();
        for dev in &report.blockdevices {
            for child in dev.children.as_deref().unwrap_or_default() {
                if child.kind == "part" {
                    parts.push(Partition {
                        name: child.name.clone(),
                        fstype: child.fstype.clone(),
                        mountpoint: child.mountpoint.clone().filter(|m| !m.is_empty()),
                    });
                }
            }
        }
        Ok(parts)
    }
}
