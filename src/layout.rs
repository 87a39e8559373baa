//! Operator grid layout, persisted as `data/layout.json`.
//!
//! A layout is a small grid of cells, each bound to one stable USB
//! topology path so a re-plugged card lands back in the same cell.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::models::UsbSpeed;

const LAYOUT_FILE: &str = "layout.json";

fn default_true() -> bool {
    true
}

fn default_schema_version() -> u32 {
    1
}

fn default_cell_size() -> String {
    "normal".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortCell {
    pub cell_id: String,
    #[serde(default)]
    pub label: String,
    /// Stable `/dev/disk/by-path` identifier; empty means unbound.
    #[serde(default)]
    pub port_path: String,
    #[serde(default)]
    pub usb_hint: UsbSpeed,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub rows: u32,
    pub cols: u32,
    #[serde(default = "default_cell_size")]
    pub cell_size: String,
    #[serde(default)]
    pub cells: Vec<PortCell>,
}

impl LayoutConfig {
    /// 2 rows by 4 columns, cells `A1`..`B4`, nothing bound yet.
    pub fn default_grid() -> Self {
        let (rows, cols) = (2u32, 4u32);
        let mut cells = Vec::new();
        for row in 0..rows {
            for col in 0..cols {
                let name = format!("{}{}", (b'A' + row as u8) as char, col + 1);
                cells.push(PortCell {
                    cell_id: name.clone(),
                    label: name,
                    port_path: String::new(),
                    usb_hint: UsbSpeed::Unknown,
                    enabled: true,
                });
            }
        }
        Self {
            schema_version: default_schema_version(),
            rows,
            cols,
            cell_size: default_cell_size(),
            cells,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut cell_ids = std::collections::HashSet::new();
        let mut ports = std::collections::HashSet::new();
        for cell in &self.cells {
            if !cell_ids.insert(cell.cell_id.as_str()) {
                bail!("duplicate cell_id '{}'", cell.cell_id);
            }
            if !cell.port_path.is_empty() && !ports.insert(cell.port_path.as_str()) {
                bail!(
                    "cells must not share a port: '{}' is bound twice",
                    cell.port_path
                );
            }
        }
        Ok(())
    }
}

pub struct LayoutStore {
    path: PathBuf,
}

impl LayoutStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(LAYOUT_FILE),
        }
    }

    /// Load the layout, writing the default grid on first use. A corrupt
    /// file is logged and replaced by the default in memory, not on disk.
    pub fn load(&self) -> Result<LayoutConfig> {
        if !self.path.exists() {
            let layout = LayoutConfig::default_grid();
            self.save(&layout)?;
            return Ok(layout);
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        match serde_json::from_str::<LayoutConfig>(&raw) {
            Ok(layout) => Ok(layout),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "layout file unreadable, using default grid");
                Ok(LayoutConfig::default_grid())
            }
        }
    }

    pub fn save(&self, layout: &LayoutConfig) -> Result<()> {
        layout.validate()?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(layout)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("writing {}", self.path.display()))?;
        info!(cells = layout.cells.len(), "layout saved");
        Ok(())
    }

    pub fn import(&self, raw: &[u8]) -> Result<LayoutConfig> {
        let layout: LayoutConfig = serde_json::from_slice(raw).context("parsing layout JSON")?;
        self.save(&layout)?;
        Ok(layout)
    }

    pub fn export_bytes(&self) -> Result<Vec<u8>> {
        let layout = self.load()?;
        Ok(serde_json::to_vec_pretty(&layout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_grid_is_two_by_four() {
        let layout = LayoutConfig::default_grid();
        assert_eq!(layout.cells.len(), 8);
        assert_eq!(layout.cells[0].cell_id, "A1");
        assert_eq!(layout.cells[7].cell_id, "B4");
        assert!(layout.cells.iter().all(|c| c.enabled));
        layout.validate().unwrap();
    }

    #[test]
    fn first_load_writes_the_default() {
        let dir = tempdir().unwrap();
        let store = LayoutStore::new(dir.path());
        let layout = store.load().unwrap();
        assert_eq!(layout, LayoutConfig::default_grid());
        assert!(dir.path().join("layout.json").exists());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = LayoutStore::new(dir.path());
        let mut layout = LayoutConfig::default_grid();
        layout.cells[0].port_path = "pci-0000:00:14.0-usb-0:3:1.0".to_string();
        layout.cells[0].usb_hint = UsbSpeed::Usb3;
        layout.cells[1].enabled = false;

        store.save(&layout).unwrap();
        assert_eq!(store.load().unwrap(), layout);
    }

    #[test]
    fn export_then_import_yields_equal_layout() {
        let dir = tempdir().unwrap();
        let store = LayoutStore::new(dir.path());
        let mut layout = LayoutConfig::default_grid();
        layout.cells[2].label = "top right".to_string();
        store.save(&layout).unwrap();

        let exported = store.export_bytes().unwrap();
        let imported = store.import(&exported).unwrap();
        assert_eq!(imported, layout);
    }

    #[test]
    fn duplicate_port_binding_is_rejected() {
        let dir = tempdir().unwrap();
        let store = LayoutStore::new(dir.path());
        let mut layout = LayoutConfig::default_grid();
        layout.cells[0].port_path = "usb-0:1".to_string();
        layout.cells[1].port_path = "usb-0:1".to_string();
        assert!(store.save(&layout).is_err());
    }

    #[test]
    fn corrupt_file_falls_back_to_default() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("layout.json"), b"{not json").unwrap();
        let store = LayoutStore::new(dir.path());
        assert_eq!(store.load().unwrap(), LayoutConfig::default_grid());
    }
}
