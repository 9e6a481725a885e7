//! Wire messages of the privileged operation server.
//!
//! Each frame carries one JSON document. Requests are adjacently tagged
//! `{"method": ..., "args": ...}`; responses `{"status": ..., "payload": ...}`.

use serde::{Deserialize, Serialize};
use stockade_common::error::{ErrorKind, StockadeError};
use stockade_common::types::{
    ChdirArgs, ChrootArgs, CryptArgs, CryptReply, HostnameArgs, LoopArgs, LoopReply, MkdirArgs,
    MountArgs, SetFsIdArgs,
};

/// One privileged operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args")]
pub enum Request {
    /// Mount a filesystem.
    Mount(MountArgs),
    /// Unlock an encrypted loop device.
    Decrypt(CryptArgs),
    /// Create a directory with an exact mode.
    Mkdir(MkdirArgs),
    /// Switch the root filesystem.
    Chroot(ChrootArgs),
    /// Attach an image to a loop device.
    LoopDevice(LoopArgs),
    /// Set the hostname.
    SetHostname(HostnameArgs),
    /// Durably change the filesystem identity.
    SetFsId(SetFsIdArgs),
    /// Change the working directory.
    Chdir(ChdirArgs),
}

impl Request {
    /// Returns the wire name of the operation.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::Mount(_) => "Mount",
            Self::Decrypt(_) => "Decrypt",
            Self::Mkdir(_) => "Mkdir",
            Self::Chroot(_) => "Chroot",
            Self::LoopDevice(_) => "LoopDevice",
            Self::SetHostname(_) => "SetHostname",
            Self::SetFsId(_) => "SetFsId",
            Self::Chdir(_) => "Chdir",
        }
    }
}

/// Successful operation result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    /// Operation without a result value.
    Unit,
    /// Mapped device of an unlocked image.
    Crypt(CryptReply),
    /// Index of the attached loop device.
    Loop(LoopReply),
}

/// Error reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error class.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl From<&StockadeError> for RemoteError {
    fn from(error: &StockadeError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl From<RemoteError> for StockadeError {
    fn from(error: RemoteError) -> Self {
        Self::Remote {
            kind: error.kind,
            message: error.message,
        }
    }
}

/// Explicit outcome of every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "payload", rename_all = "snake_case")]
pub enum Response {
    /// The operation succeeded.
    Ok(Reply),
    /// The operation failed.
    Error(RemoteError),
}

impl Response {
    /// Builds an error response.
    #[must_use]
    pub fn error(error: &StockadeError) -> Self {
        Self::Error(error.into())
    }

    /// Converts the response back into a result.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::Remote`] for an error response.
    pub fn into_result(self) -> Result<Reply, StockadeError> {
        match self {
            Self::Ok(reply) => Ok(reply),
            Self::Error(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use serde_json::json;
    use stockade_common::types::ChrootMethod;

    use super::*;

    #[test]
    fn requests_are_tagged_by_method() {
        let request = Request::Chroot(ChrootArgs {
            root: PathBuf::from("/rootfs"),
            method: ChrootMethod::Pivot,
        });
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"method": "Chroot", "args": {"root": "/rootfs", "method": "pivot"}})
        );
        assert_eq!(request.method(), "Chroot");
    }

    #[test]
    fn mount_request_defaults_optional_fields() {
        let request: Request = serde_json::from_value(json!({
            "method": "Mount",
            "args": {"source": "proc", "target": "/proc"}
        }))
        .unwrap();
        let Request::Mount(args) = request else {
            panic!("expected a mount request");
        };
        assert_eq!(args.flags, 0);
        assert!(args.filesystem.is_empty());
    }

    #[test]
    fn unknown_method_is_rejected() {
        let parsed = serde_json::from_value::<Request>(json!({"method": "Reboot", "args": {}}));
        assert!(parsed.is_err());
    }

    #[test]
    fn responses_carry_status_and_payload() {
        let ok = Response::Ok(Reply::Loop(LoopReply { index: 3 }));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"status": "ok", "payload": {"loop": {"index": 3}}})
        );

        let unit = Response::Ok(Reply::Unit);
        assert_eq!(
            serde_json::to_value(&unit).unwrap(),
            json!({"status": "ok", "payload": "unit"})
        );
    }

    #[test]
    fn error_responses_keep_the_class() {
        let error = StockadeError::RootSwitch {
            step: "pivot_root",
            message: "EINVAL".into(),
        };
        let response = Response::error(&error);
        assert_eq!(
            serde_json::to_value(&response).unwrap()["payload"]["kind"],
            json!("root_switch")
        );

        let back = response.into_result().unwrap_err();
        assert_eq!(back.kind(), ErrorKind::RootSwitch);
        assert!(back.to_string().contains("pivot_root"));
    }

    #[test]
    fn unsafe_errors_stay_unsafe_across_the_wire() {
        let error = StockadeError::IdentityRestore {
            message: "fsuid stuck at 0".into(),
        };
        let back = Response::error(&error).into_result().unwrap_err();
        assert!(back.is_unsafe());
    }
}
