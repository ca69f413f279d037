//! Named asset descriptors shared by scenarios
//!
//! The registry is built once (from YAML or in code) and handed to every
//! scenario by reference.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use super::descriptor::AssetDescriptor;
use crate::common::{Error, Result};

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(transparent)]
pub struct AssetRegistry {
    assets: BTreeMap<String, AssetDescriptor>,
}

impl AssetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a registry from a YAML mapping of `name: {url, sha256}`
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        serde_yaml::from_str(&content).map_err(|e| {
            Error::ConfigParse(format!("asset registry '{}': {}", path.display(), e))
        })
    }

    pub fn insert(&mut self, name: impl Into<String>, descriptor: AssetDescriptor) {
        self.assets.insert(name.into(), descriptor);
    }

    /// Look up an asset by name
    pub fn get(&self, name: &str) -> Result<&AssetDescriptor> {
        self.assets.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.assets.keys().map(String::as_str).collect();
            Error::Config(format!(
                "Unknown asset '{}'. Known assets: {}",
                name,
                if known.is_empty() {
                    "(none)".to_string()
                } else {
                    known.join(", ")
                }
            ))
        })
    }

    /// Merge another registry; entries in `other` win on name clashes
    pub fn extend(&mut self, other: &AssetRegistry) {
        for (name, descriptor) in &other.assets {
            self.assets.insert(name.clone(), descriptor.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AssetDescriptor)> {
        self.assets.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
kernel_4_5_0:
  url: http://snapshot.debian.org/archive/debian/20160601T041800Z/pool/main/l/linux/linux-image-4.5.0-2-4kc-malta_4.5.5-1_mips.deb
  sha256: 526b17d5889840888b76fc2c36a0ebde182c9b1410a3a1e68203c3b160eb2027
initrd:
  url: https://github.com/groeck/linux-build-test/raw/8584a59ed9e5eb5ee7ca91f6d74bbb06619205b8/rootfs/mips/rootfs.cpio.gz
  sha256: dcfe3a7fe3200da3a00d176b95caaa086495eb158f2bff64afc67d7e1eb2cddc
"#;

    #[test]
    fn test_parse_registry() {
        let registry: AssetRegistry = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(registry.len(), 2);
        let initrd = registry.get("initrd").unwrap();
        assert_eq!(initrd.file_name(), "rootfs.cpio.gz");
    }

    #[test]
    fn test_unknown_asset_lists_known_names() {
        let registry: AssetRegistry = serde_yaml::from_str(YAML).unwrap();
        let err = registry.get("kernel").unwrap_err().to_string();
        assert!(err.contains("initrd"));
        assert!(err.contains("kernel_4_5_0"));
    }

    #[test]
    fn test_extend_overrides() {
        let mut base: AssetRegistry = serde_yaml::from_str(YAML).unwrap();
        let mut local = AssetRegistry::new();
        local.insert(
            "initrd",
            AssetDescriptor::new("http://mirror/rootfs.cpio.gz", &"0".repeat(64)).unwrap(),
        );
        base.extend(&local);
        assert_eq!(base.len(), 2);
        assert_eq!(base.get("initrd").unwrap().url, "http://mirror/rootfs.cpio.gz");
    }
}
