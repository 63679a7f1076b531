use anyhow::{bail, format_err, Error};

use ccache_types::ChunkId;

/// The cache's `config` file: a 4-field scalar record. This is
/// deliberately hand-rolled rather than built on `pbs-config`'s
/// `SectionConfig`/schema machinery — that system is designed for
/// user-facing, schema-validated, multi-section API configuration, and is
/// a poor fit for a single internal control file with four scalar
/// fields written only by this crate itself (see DESIGN.md).
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub version: u32,
    pub repository_id: [u8; 32],
    pub manifest_id: Option<ChunkId>,
    pub timestamp: Option<String>,
}

impl CacheConfig {
    pub fn new(repository_id: [u8; 32]) -> Self {
        CacheConfig {
            version: 1,
            repository_id,
            manifest_id: None,
            timestamp: None,
        }
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut version = None;
        let mut repository_id = None;
        let mut manifest_id = None;
        let mut timestamp = None;
        let mut in_cache_section = false;

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') {
                in_cache_section = line == "[cache]";
                continue;
            }
            if !in_cache_section {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format_err!("malformed config line: {:?}", raw_line))?;
            let value = value.trim();
            match key.trim() {
                "version" => version = Some(value.parse::<u32>()?),
                "repository" => {
                    let mut bytes = [0u8; 32];
                    hex::decode_to_slice(value, &mut bytes)
                        .map_err(|err| format_err!("invalid repository id: {}", err))?;
                    repository_id = Some(bytes);
                }
                "manifest" => {
                    manifest_id = if value.is_empty() {
                        None
                    } else {
                        Some(ChunkId::from_hex(value)?)
                    };
                }
                "timestamp" => {
                    timestamp = if value.is_empty() {
                        None
                    } else {
                        Some(value.to_string())
                    };
                }
                _ => {}
            }
        }

        let version = version.ok_or_else(|| format_err!("config missing 'version'"))?;
        if version != 1 {
            bail!("unsupported cache config version {}", version);
        }

        Ok(CacheConfig {
            version,
            repository_id: repository_id
                .ok_or_else(|| format_err!("config missing 'repository'"))?,
            manifest_id,
            timestamp,
        })
    }

    pub fn to_ini_string(&self) -> String {
        format!(
            "[cache]\nversion={}\nrepository={}\nmanifest={}\ntimestamp={}\n",
            self.version,
            hex::encode(self.repository_id),
            self.manifest_id.map(|id| id.to_hex()).unwrap_or_default(),
            self.timestamp.clone().unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut config = CacheConfig::new([0x11u8; 32]);
        config.manifest_id = Some(ChunkId::from_bytes([0x22u8; 32]));
        config.timestamp = Some("2024-01-01T00:00:00".to_string());

        let text = config.to_ini_string();
        let reparsed = CacheConfig::parse(&text).unwrap();

        assert_eq!(reparsed.version, 1);
        assert_eq!(reparsed.repository_id, [0x11u8; 32]);
        assert_eq!(reparsed.manifest_id, config.manifest_id);
        assert_eq!(reparsed.timestamp, config.timestamp);
    }

    #[test]
    fn test_empty_manifest_and_timestamp() {
        let config = CacheConfig::new([0xaau8; 32]);
        let text = config.to_ini_string();
        let reparsed = CacheConfig::parse(&text).unwrap();
        assert!(reparsed.manifest_id.is_none());
        assert!(reparsed.timestamp.is_none());
    }
}
