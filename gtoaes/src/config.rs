//! Startup configuration: listening ports, the geographic site, and the
//! per-group GWAC unit layout.
//!
//! Read once from an XML file; every key has a compiled default so a partial
//! file works. `gtoaes -d` writes the defaults back out for bootstrapping a
//! new installation.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Units driven by one GWAC mount endpoint when a group is not listed in
/// the configuration.
pub const DEFAULT_GROUP_UNITS: usize = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("parse {path}: {source}")]
    Parse {
        path: String,
        source: quick_xml::DeError,
    },

    #[error("write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("serialize configuration: {0}")]
    Serialize(#[from] quick_xml::DeError),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "Network")]
    pub network: Network,
    #[serde(rename = "GeoSite")]
    pub site: GeoSite,
    #[serde(rename = "Gwac")]
    pub gwac: GwacLayout,
}

/// One `<... port="..."/>` element per listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Network {
    #[serde(rename = "Client")]
    pub client: Endpoint,
    #[serde(rename = "MountGWAC")]
    pub mount_gwac: Endpoint,
    #[serde(rename = "CameraGWAC")]
    pub camera_gwac: Endpoint,
    #[serde(rename = "FocusGWAC")]
    pub focus_gwac: Endpoint,
    #[serde(rename = "MountGFT")]
    pub mount_gft: Endpoint,
    #[serde(rename = "CameraGFT")]
    pub camera_gft: Endpoint,
}

impl Default for Network {
    fn default() -> Self {
        Self {
            client: Endpoint { port: 5010 },
            mount_gwac: Endpoint { port: 5011 },
            camera_gwac: Endpoint { port: 5012 },
            focus_gwac: Endpoint { port: 5013 },
            mount_gft: Endpoint { port: 5014 },
            camera_gft: Endpoint { port: 5015 },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(rename = "@port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoSite {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "Coords")]
    pub coords: Coords,
}

impl Default for GeoSite {
    fn default() -> Self {
        Self {
            name: "Xinglong".into(),
            coords: Coords::default(),
        }
    }
}

/// East longitude and north latitude positive, degrees; altitude meters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coords {
    #[serde(rename = "@lon")]
    pub lon: f64,
    #[serde(rename = "@lat")]
    pub lat: f64,
    #[serde(rename = "@alt")]
    pub alt: f64,
}

impl Default for Coords {
    fn default() -> Self {
        Self {
            lon: 117.57454,
            lat: 40.39593,
            alt: 900.0,
        }
    }
}

/// How many units each GWAC mount endpoint multiplexes, per group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GwacLayout {
    #[serde(rename = "Group")]
    pub groups: Vec<Group>,
}

impl Default for GwacLayout {
    fn default() -> Self {
        Self {
            groups: vec![Group {
                gid: "001".into(),
                units: DEFAULT_GROUP_UNITS,
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    #[serde(rename = "@gid")]
    pub gid: String,
    #[serde(rename = "@units")]
    pub units: usize,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        quick_xml::de::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let xml = quick_xml::se::to_string_with_root("gtoaes", self)?;
        std::fs::write(path, xml).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    /// Units `[1..=N]` addressed by a GWAC status frame for `gid`.
    pub fn group_units(&self, gid: &str) -> usize {
        self.gwac
            .groups
            .iter()
            .find(|g| g.gid.eq_ignore_ascii_case(gid))
            .map(|g| g.units)
            .unwrap_or(DEFAULT_GROUP_UNITS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_all_ports() {
        let cfg = Config::default();
        assert_eq!(cfg.network.client.port, 5010);
        assert_eq!(cfg.network.mount_gwac.port, 5011);
        assert_eq!(cfg.network.camera_gwac.port, 5012);
        assert_eq!(cfg.network.focus_gwac.port, 5013);
        assert_eq!(cfg.network.mount_gft.port, 5014);
        assert_eq!(cfg.network.camera_gft.port, 5015);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gtoaes.xml");
        let mut cfg = Config::default();
        cfg.network.client.port = 6010;
        cfg.site.name = "TestSite".into();
        cfg.gwac.groups.push(Group {
            gid: "002".into(),
            units: 6,
        });
        cfg.save(&path).unwrap();

        let back = Config::load(&path).unwrap();
        assert_eq!(back.network.client.port, 6010);
        assert_eq!(back.site.name, "TestSite");
        assert_eq!(back.group_units("002"), 6);
    }

    #[test]
    fn unlisted_group_uses_default_units() {
        let cfg = Config::default();
        assert_eq!(cfg.group_units("001"), 5);
        assert_eq!(cfg.group_units("009"), DEFAULT_GROUP_UNITS);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gtoaes.xml");
        std::fs::write(
            &path,
            "<gtoaes><Network><Client port=\"7000\"/></Network></gtoaes>",
        )
        .unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.network.client.port, 7000);
        assert_eq!(cfg.network.mount_gwac.port, 5011);
        assert_eq!(cfg.site.name, "Xinglong");
    }
}
