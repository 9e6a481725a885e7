//! Domain primitive types and the argument/reply payloads of every
//! privileged operation.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StockadeError};

/// Unique identifier for a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ContainerId {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name under which an engine variant is registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EngineName(String);

impl EngineName {
    /// Creates an engine name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EngineName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Arguments of the `Mount` operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountArgs {
    /// Mount source; empty means none.
    pub source: String,
    /// Mount target.
    pub target: PathBuf,
    /// Filesystem type; empty means none.
    #[serde(default)]
    pub filesystem: String,
    /// Raw `MS_*` flag bitmask.
    #[serde(default)]
    pub flags: u64,
    /// Filesystem-specific data string; empty means none.
    #[serde(default)]
    pub data: String,
    /// Symbolic flag names (`bind`, `rec`, `ro`, ...) OR-ed into `flags`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Strategy used to switch the root filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChrootMethod {
    /// `pivot_root(2)` followed by a lazy detach of the old root.
    Pivot,
    /// Move the new root onto `/`, then chroot.
    Move,
    /// Plain `chroot(2)` without mount namespace isolation.
    Chroot,
}

impl fmt::Display for ChrootMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pivot => write!(f, "pivot"),
            Self::Move => write!(f, "move"),
            Self::Chroot => write!(f, "chroot"),
        }
    }
}

impl FromStr for ChrootMethod {
    type Err = StockadeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pivot" => Ok(Self::Pivot),
            "move" => Ok(Self::Move),
            "chroot" => Ok(Self::Chroot),
            other => Err(StockadeError::Config {
                message: format!("unknown root switch method: {other}"),
            }),
        }
    }
}

/// Arguments of the `Chroot` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChrootArgs {
    /// New root directory, or `.` for the current directory.
    pub root: PathBuf,
    /// Root switch strategy.
    pub method: ChrootMethod,
}

/// Loop device parameters applied with `LOOP_SET_STATUS64`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopInfo {
    /// Byte offset of the filesystem inside the backing file.
    #[serde(default)]
    pub offset: u64,
    /// Maximum size in bytes, 0 for the whole file.
    #[serde(default)]
    pub size_limit: u64,
    /// Detach the device automatically on last close.
    #[serde(default)]
    pub autoclear: bool,
    /// Expose the device read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Arguments of the `LoopDevice` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopArgs {
    /// Image path, or `/proc/self/fd/N` to adopt an open descriptor.
    pub image: String,
    /// `open(2)` access flags for the image and the loop device.
    pub mode: i32,
    /// Number of loop devices to scan.
    pub max_devices: u32,
    /// Reuse a device already bound to the same image.
    #[serde(default)]
    pub shared: bool,
    /// Device parameters.
    #[serde(default)]
    pub info: LoopInfo,
}

/// Reply of the `LoopDevice` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopReply {
    /// Index `N` of the attached `/dev/loopN`.
    pub index: u32,
}

/// Arguments of the `Decrypt` operation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptArgs {
    /// Key material fed to the unlocker.
    pub key: Vec<u8>,
    /// Loop device holding the encrypted filesystem.
    pub loop_device: PathBuf,
    /// PID whose IPC namespace hosts the crypt service; `<= 0` stays put.
    #[serde(default)]
    pub master_pid: i32,
}

impl fmt::Debug for CryptArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptArgs")
            .field("key", &format_args!("<{} bytes>", self.key.len()))
            .field("loop_device", &self.loop_device)
            .field("master_pid", &self.master_pid)
            .finish()
    }
}

/// Reply of the `Decrypt` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptReply {
    /// Path of the mapped, unlocked device.
    pub device: PathBuf,
}

/// Arguments of the `Mkdir` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MkdirArgs {
    /// Directory to create.
    pub path: PathBuf,
    /// Exact permission bits of the new directory.
    pub mode: u32,
}

/// Arguments of the `SetHostname` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostnameArgs {
    /// New hostname.
    pub hostname: String,
}

/// Arguments of the `SetFsId` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetFsIdArgs {
    /// Filesystem user id.
    pub uid: u32,
    /// Filesystem group id.
    pub gid: u32,
}

/// Arguments of the `Chdir` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChdirArgs {
    /// New working directory.
    pub dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chroot_method_parses_known_names() {
        assert_eq!("pivot".parse::<ChrootMethod>().unwrap(), ChrootMethod::Pivot);
        assert_eq!("move".parse::<ChrootMethod>().unwrap(), ChrootMethod::Move);
        assert_eq!("chroot".parse::<ChrootMethod>().unwrap(), ChrootMethod::Chroot);
    }

    #[test]
    fn chroot_method_rejects_unknown_name() {
        let err = "switch".parse::<ChrootMethod>().unwrap_err();
        assert!(matches!(err, StockadeError::Config { .. }));
    }

    #[test]
    fn crypt_args_debug_hides_key() {
        let args = CryptArgs {
            key: b"hunter2".to_vec(),
            loop_device: PathBuf::from("/dev/loop3"),
            master_pid: 0,
        };
        let rendered = format!("{args:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<7 bytes>"));
    }

    #[test]
    fn loop_args_defaults_optional_fields() {
        let args: LoopArgs =
            serde_json::from_str(r#"{"image":"/img.sif","mode":0,"max_devices":8}"#).unwrap();
        assert!(!args.shared);
        assert_eq!(args.info, LoopInfo::default());
    }

    #[test]
    fn generated_container_ids_differ() {
        assert_ne!(ContainerId::generate(), ContainerId::generate());
    }
}
