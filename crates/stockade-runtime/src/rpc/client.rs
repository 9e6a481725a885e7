//! Supervisor side of the privileged server connection.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use stockade_common::error::{Result, StockadeError};
use stockade_common::types::{
    ChdirArgs, ChrootArgs, ChrootMethod, CryptArgs, HostnameArgs, LoopArgs, MkdirArgs, MountArgs,
    SetFsIdArgs,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::protocol::{Reply, Request, Response};

/// Issues blocking calls to a [`PrivilegedServer`](super::PrivilegedServer).
#[derive(Debug)]
pub struct PrivilegedClient<S> {
    framed: Framed<S, LengthDelimitedCodec>,
}

impl<S> PrivilegedClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a connected stream.
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
        }
    }

    /// Sends `request` and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns transport errors or the remote error.
    pub async fn call(&mut self, request: &Request) -> Result<Reply> {
        let payload = serde_json::to_vec(request)?;
        self.framed
            .send(Bytes::from(payload))
            .await
            .map_err(|e| StockadeError::Transport {
                message: format!("sending {}: {e}", request.method()),
            })?;

        let frame = self
            .framed
            .next()
            .await
            .ok_or_else(|| StockadeError::Transport {
                message: format!("server closed the connection during {}", request.method()),
            })?
            .map_err(|e| StockadeError::Transport {
                message: format!("reading {} response: {e}", request.method()),
            })?;
        let response: Response = serde_json::from_slice(&frame)?;
        response.into_result()
    }

    /// Mounts a filesystem.
    ///
    /// # Errors
    ///
    /// Returns transport or remote errors.
    pub async fn mount(&mut self, args: MountArgs) -> Result<()> {
        self.call_unit(&Request::Mount(args)).await
    }

    /// Unlocks an encrypted loop device and returns the mapped node.
    ///
    /// # Errors
    ///
    /// Returns transport or remote errors.
    pub async fn decrypt(&mut self, args: CryptArgs) -> Result<PathBuf> {
        match self.call(&Request::Decrypt(args)).await? {
            Reply::Crypt(reply) => Ok(reply.device),
            other => Err(unexpected("Decrypt", &other)),
        }
    }

    /// Creates a directory with an exact mode.
    ///
    /// # Errors
    ///
    /// Returns transport or remote errors.
    pub async fn mkdir(&mut self, path: &Path, mode: u32) -> Result<()> {
        self.call_unit(&Request::Mkdir(MkdirArgs {
            path: path.to_path_buf(),
            mode,
        }))
        .await
    }

    /// Switches the root filesystem.
    ///
    /// # Errors
    ///
    /// Returns transport or remote errors.
    pub async fn chroot(&mut self, root: &Path, method: ChrootMethod) -> Result<()> {
        self.call_unit(&Request::Chroot(ChrootArgs {
            root: root.to_path_buf(),
            method,
        }))
        .await
    }

    /// Attaches an image and returns the loop device index.
    ///
    /// # Errors
    ///
    /// Returns transport or remote errors.
    pub async fn loop_device(&mut self, args: LoopArgs) -> Result<u32> {
        match self.call(&Request::LoopDevice(args)).await? {
            Reply::Loop(reply) => Ok(reply.index),
            other => Err(unexpected("LoopDevice", &other)),
        }
    }

    /// Sets the container hostname.
    ///
    /// # Errors
    ///
    /// Returns transport or remote errors.
    pub async fn set_hostname(&mut self, hostname: &str) -> Result<()> {
        self.call_unit(&Request::SetHostname(HostnameArgs {
            hostname: hostname.to_owned(),
        }))
        .await
    }

    /// Durably sets the server's filesystem identity.
    ///
    /// # Errors
    ///
    /// Returns transport or remote errors.
    pub async fn set_fs_id(&mut self, uid: u32, gid: u32) -> Result<()> {
        self.call_unit(&Request::SetFsId(SetFsIdArgs { uid, gid })).await
    }

    /// Changes the server's working directory.
    ///
    /// # Errors
    ///
    /// Returns transport or remote errors.
    pub async fn chdir(&mut self, dir: &Path) -> Result<()> {
        self.call_unit(&Request::Chdir(ChdirArgs {
            dir: dir.to_path_buf(),
        }))
        .await
    }

    async fn call_unit(&mut self, request: &Request) -> Result<()> {
        match self.call(request).await? {
            Reply::Unit => Ok(()),
            other => Err(unexpected(request.method(), &other)),
        }
    }
}

fn unexpected(method: &str, reply: &Reply) -> StockadeError {
    StockadeError::Transport {
        message: format!("unexpected reply to {method}: {reply:?}"),
    }
}
