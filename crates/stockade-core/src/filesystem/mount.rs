//! Mount utilities for container filesystem setup.
//!
//! Mounts are issued verbatim on behalf of the supervisor; this module
//! adds no policy beyond translating the wire representation.

use nix::mount::MsFlags;
use stockade_common::error::{Result, StockadeError};
use stockade_common::types::MountArgs;

/// Performs `mount(2)` with the given arguments.
///
/// Empty `source`, `filesystem` and `data` strings are passed as NULL.
/// Symbolic `options` are added to the raw flags.
///
/// # Errors
///
/// Returns [`StockadeError::Config`] for an unknown option name, or
/// [`StockadeError::Mount`] carrying the kernel error together with the
/// source and target.
pub fn mount(args: &MountArgs) -> Result<()> {
    let raw = args.flags | parse_mount_flags(&args.options)?;
    let flags = MsFlags::from_bits_truncate(raw as libc::c_ulong);
    let source = non_empty(&args.source);
    let filesystem = non_empty(&args.filesystem);
    let data = non_empty(&args.data);

    nix::mount::mount(source, &args.target, filesystem, flags, data).map_err(|e| {
        StockadeError::Mount {
            spec: args.source.clone(),
            target: args.target.clone(),
            message: e.to_string(),
        }
    })?;

    tracing::debug!(
        source = %args.source,
        target = %args.target.display(),
        filesystem = %args.filesystem,
        flags = ?flags,
        "mounted"
    );
    Ok(())
}

/// Translates symbolic flag names into a raw `MS_*` bitmask.
///
/// Accepted names: `ro`, `nosuid`, `nodev`, `noexec`, `remount`, `bind`,
/// `rec`, `move`, `private`, `slave`, `shared`, `unbindable`, `relatime`,
/// `strictatime`.
///
/// # Errors
///
/// Returns [`StockadeError::Config`] on an unknown name.
pub fn parse_mount_flags<S: AsRef<str>>(names: &[S]) -> Result<u64> {
    let mut flags = MsFlags::empty();
    for name in names {
        flags |= match name.as_ref() {
            "ro" => MsFlags::MS_RDONLY,
            "nosuid" => MsFlags::MS_NOSUID,
            "nodev" => MsFlags::MS_NODEV,
            "noexec" => MsFlags::MS_NOEXEC,
            "remount" => MsFlags::MS_REMOUNT,
            "bind" => MsFlags::MS_BIND,
            "rec" => MsFlags::MS_REC,
            "move" => MsFlags::MS_MOVE,
            "private" => MsFlags::MS_PRIVATE,
            "slave" => MsFlags::MS_SLAVE,
            "shared" => MsFlags::MS_SHARED,
            "unbindable" => MsFlags::MS_UNBINDABLE,
            "relatime" => MsFlags::MS_RELATIME,
            "strictatime" => MsFlags::MS_STRICTATIME,
            other => {
                return Err(StockadeError::Config {
                    message: format!("unknown mount flag: {other}"),
                });
            }
        };
    }
    Ok(u64::from(flags.bits()))
}

fn non_empty(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}
