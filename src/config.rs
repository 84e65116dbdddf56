//! Configuration management for cryptfs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Mount configuration
    pub mount: MountConfig,

    /// Content codec configuration
    pub codec: CodecConfig,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Directory holding the encrypted files
    pub backing_root: PathBuf,

    /// Mount point path
    pub mount_point: PathBuf,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Allow root to access the mount
    pub allow_root: bool,

    /// Unmount automatically when the process exits
    pub auto_unmount: bool,

    /// Let a second open of an already-open file share its buffer
    pub shared_opens: bool,

    /// Filesystem name shown in the mount table
    pub fs_name: String,
}

/// Codec selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// Content stored as-is
    Identity,
    /// Content stored byte-reversed
    Reverse,
    /// AES-256-GCM with an Argon2id password key
    Aes256Gcm,
}

/// Codec configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub kind: CodecKind,

    /// Argon2 memory cost in KiB
    pub argon2_memory_kib: u32,

    /// Argon2 time cost (iterations)
    pub argon2_iterations: u32,

    /// Argon2 parallelism
    pub argon2_parallelism: u32,

    /// Salt for key derivation (generated by `init`)
    #[serde(with = "hex_serde", default)]
    pub salt: Vec<u8>,

    /// Sealed known value used to reject a wrong password
    #[serde(with = "hex_serde", default)]
    pub verifier: Vec<u8>,
}

impl std::str::FromStr for CodecKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "identity" | "none" => Ok(CodecKind::Identity),
            "reverse" => Ok(CodecKind::Reverse),
            "aes256gcm" | "aes" => Ok(CodecKind::Aes256Gcm),
            other => Err(Error::InvalidConfig(format!("Unknown codec: {}", other))),
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            backing_root: PathBuf::new(),
            mount_point: PathBuf::from("/mnt/cryptfs"),
            allow_other: false,
            allow_root: false,
            auto_unmount: true,
            shared_opens: false,
            fs_name: "cryptfs".to_string(),
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig {
            kind: CodecKind::Identity,
            argon2_memory_kib: 65536, // 64 MiB
            argon2_iterations: 3,
            argon2_parallelism: 4,
            salt: Vec::new(),
            verifier: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(root) = std::env::var("CRYPTFS_BACKING_ROOT") {
            let root = root.trim();
            if !root.is_empty() {
                self.mount.backing_root = PathBuf::from(root);
            }
        }

        if let Ok(mount_point) = std::env::var("CRYPTFS_MOUNT_POINT") {
            let mount_point = mount_point.trim();
            if !mount_point.is_empty() {
                self.mount.mount_point = PathBuf::from(mount_point);
            }
        }

        if let Ok(kind) = std::env::var("CRYPTFS_CODEC") {
            if !kind.trim().is_empty() {
                self.codec.kind = kind.parse()?;
            }
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.mount.backing_root.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("Backing root is required".to_string()));
        }

        if self.mount.backing_root == self.mount.mount_point {
            return Err(Error::InvalidConfig(
                "Mount point must differ from the backing root".to_string(),
            ));
        }

        if self.codec.argon2_memory_kib == 0
            || self.codec.argon2_iterations == 0
            || self.codec.argon2_parallelism == 0
        {
            return Err(Error::InvalidConfig(
                "Argon2 parameters must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Validate and additionally check the backing root exists
    pub fn validate_for_mount(&self) -> Result<()> {
        self.validate()?;
        if !self.mount.backing_root.is_dir() {
            return Err(Error::InvalidConfig(format!(
                "Backing root {:?} is not a directory",
                self.mount.backing_root
            )));
        }
        Ok(())
    }
}

/// Hex serialization for byte arrays
mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
