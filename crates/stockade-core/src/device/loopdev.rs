//! Loop device attachment.
//!
//! Images are attached to the first free `/dev/loopN` below the requested
//! bound. Loop control nodes usually belong to the `disk` group, so the
//! attachment itself runs inside an fs identity escalation bracket.

use std::fs::{File, OpenOptions};
use std::mem::ManuallyDrop;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::stat::{Mode, SFlag, makedev, mknod};
use nix::unistd::Uid;
use stockade_common::constants::{INHERITED_FD_PREFIX, LOOP_DEVICE_DIR, LOOP_MAJOR};
use stockade_common::error::{Result, StockadeError};
use stockade_common::types::{LoopArgs, LoopInfo, LoopReply};

use crate::identity::{self, FsIdentity};

const LO_FLAGS_READ_ONLY: u32 = 1;
const LO_FLAGS_AUTOCLEAR: u32 = 4;
const LO_NAME_SIZE: usize = 64;

/// Kernel `struct loop_info64`.
#[repr(C)]
#[derive(Clone, Copy)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; 32],
    lo_init: [u64; 2],
}

impl LoopInfo64 {
    const fn zeroed() -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; 32],
            lo_init: [0; 2],
        }
    }

    fn from_info(info: &LoopInfo, file_name: &str) -> Self {
        let mut raw = Self::zeroed();
        raw.lo_offset = info.offset;
        raw.lo_sizelimit = info.size_limit;
        if info.read_only {
            raw.lo_flags |= LO_FLAGS_READ_ONLY;
        }
        if info.autoclear {
            raw.lo_flags |= LO_FLAGS_AUTOCLEAR;
        }
        let name = file_name.as_bytes();
        let len = name.len().min(LO_NAME_SIZE - 1);
        raw.lo_file_name[..len].copy_from_slice(&name[..len]);
        raw
    }
}

mod sys {
    use super::LoopInfo64;

    nix::ioctl_write_int_bad!(
        /// `LOOP_SET_FD`: binds a backing file to the loop device.
        loop_set_fd,
        0x4C00
    );
    nix::ioctl_none_bad!(
        /// `LOOP_CLR_FD`: unbinds the loop device.
        loop_clr_fd,
        0x4C01
    );
    nix::ioctl_write_ptr_bad!(
        /// `LOOP_SET_STATUS64`: applies offset, size limit and flags.
        loop_set_status64,
        0x4C04,
        LoopInfo64
    );
    nix::ioctl_read_bad!(
        /// `LOOP_GET_STATUS64`: reads the binding of the loop device.
        loop_get_status64,
        0x4C05,
        LoopInfo64
    );
}

/// Where the image to attach comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// An already-open descriptor of this process.
    Inherited(RawFd),
    /// A filesystem path to open.
    Path(PathBuf),
}

impl ImageSource {
    /// Parses an image reference.
    ///
    /// `/proc/self/fd/N` with a decimal `N` adopts descriptor `N` without
    /// any path lookup; anything else is a path.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::Config`] if the descriptor suffix is not a
    /// decimal number that fits a descriptor.
    pub fn parse(reference: &str) -> Result<Self> {
        let Some(suffix) = reference.strip_prefix(INHERITED_FD_PREFIX) else {
            return Ok(Self::Path(PathBuf::from(reference)));
        };
        let invalid = || StockadeError::Config {
            message: format!("invalid image file descriptor in {reference:?}"),
        };
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let fd: u32 = suffix.parse().map_err(|_| invalid())?;
        let fd = RawFd::try_from(fd).map_err(|_| invalid())?;
        Ok(Self::Inherited(fd))
    }

    /// Opens the image.
    ///
    /// An inherited descriptor is borrowed, never closed.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::Device`] if the inherited descriptor is not
    /// open, or [`StockadeError::Io`] if the path cannot be opened.
    pub fn open(&self, mode: i32) -> Result<ImageHandle> {
        match self {
            Self::Inherited(fd) => {
                // SAFETY: F_GETFD only inspects the descriptor table.
                if unsafe { libc::fcntl(*fd, libc::F_GETFD) } < 0 {
                    return Err(StockadeError::Device {
                        message: format!("image descriptor {fd} is not open: {}", Errno::last()),
                    });
                }
                // SAFETY: the descriptor is open and the ManuallyDrop wrapper
                // guarantees this handle never closes it.
                let file = ManuallyDrop::new(unsafe { File::from_raw_fd(*fd) });
                Ok(ImageHandle::Inherited(file))
            }
            Self::Path(path) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(is_writable(mode))
                    .custom_flags(mode & !libc::O_ACCMODE)
                    .open(path)
                    .map_err(|e| StockadeError::Io {
                        path: path.clone(),
                        source: e,
                    })?;
                Ok(ImageHandle::Owned(file))
            }
        }
    }

    fn display_name(&self) -> String {
        match self {
            Self::Inherited(fd) => format!("{INHERITED_FD_PREFIX}{fd}"),
            Self::Path(path) => path.display().to_string(),
        }
    }
}

/// An open image, either owned or borrowed from the descriptor table.
#[derive(Debug)]
pub enum ImageHandle {
    /// Opened from a path; closed on drop.
    Owned(File),
    /// Adopted descriptor; left open on drop.
    Inherited(ManuallyDrop<File>),
}

impl ImageHandle {
    /// Returns the underlying file.
    #[must_use]
    pub fn file(&self) -> &File {
        match self {
            Self::Owned(file) => file,
            Self::Inherited(file) => file,
        }
    }
}

/// Loop device allocation parameters.
#[derive(Debug, Clone, Copy)]
pub struct LoopDevice {
    /// Number of `/dev/loopN` indexes to scan.
    pub max_devices: u32,
    /// Reuse a device already bound to the same image.
    pub shared: bool,
    /// Parameters applied to the device.
    pub info: LoopInfo,
}

impl LoopDevice {
    /// Attaches `image` to a loop device and returns its index.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::Device`] if no device could be bound.
    pub fn attach(&self, image: &File, name: &str, mode: i32) -> Result<u32> {
        if self.shared {
            if let Some(index) = self.find_shared(image)? {
                tracing::info!(index, image = name, "reusing shared loop device");
                return Ok(index);
            }
        }

        let writable = is_writable(mode);
        for index in 0..self.max_devices {
            let path = device_path(index);
            ensure_node(index, &path)?;

            let device = match OpenOptions::new().read(true).write(writable).open(&path) {
                Ok(device) => device,
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) => continue,
                Err(e) => {
                    return Err(StockadeError::Device {
                        message: format!("cannot open {}: {e}", path.display()),
                    });
                }
            };

            // SAFETY: both descriptors stay open for the duration of the call.
            match unsafe { sys::loop_set_fd(device.as_raw_fd(), image.as_raw_fd()) } {
                Ok(_) => {}
                Err(Errno::EBUSY) => continue,
                Err(e) => {
                    return Err(StockadeError::Device {
                        message: format!("LOOP_SET_FD on {} failed: {e}", path.display()),
                    });
                }
            }

            let status = LoopInfo64::from_info(&self.info, name);
            // SAFETY: `status` is a fully initialised loop_info64 that
            // outlives the call.
            if let Err(e) = unsafe { sys::loop_set_status64(device.as_raw_fd(), &status) } {
                // SAFETY: the device was bound by this call.
                let _ = unsafe { sys::loop_clr_fd(device.as_raw_fd()) };
                return Err(StockadeError::Device {
                    message: format!("LOOP_SET_STATUS64 on {} failed: {e}", path.display()),
                });
            }

            tracing::info!(index, image = name, "image attached to loop device");
            return Ok(index);
        }

        Err(StockadeError::Device {
            message: format!("no loop devices available (scanned {})", self.max_devices),
        })
    }

    fn find_shared(&self, image: &File) -> Result<Option<u32>> {
        let meta = image.metadata().map_err(|e| StockadeError::Device {
            message: format!("cannot stat image: {e}"),
        })?;

        for index in 0..self.max_devices {
            let Ok(device) = File::open(device_path(index)) else {
                continue;
            };
            let mut status = LoopInfo64::zeroed();
            // SAFETY: `status` is a valid, writable loop_info64. Unbound
            // devices fail with ENXIO and are skipped.
            if unsafe { sys::loop_get_status64(device.as_raw_fd(), &mut status) }.is_err() {
                continue;
            }
            let read_only = status.lo_flags & LO_FLAGS_READ_ONLY != 0;
            if status.lo_device == meta.dev()
                && status.lo_inode == meta.ino()
                && status.lo_offset == self.info.offset
                && status.lo_sizelimit == self.info.size_limit
                && read_only == self.info.read_only
            {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }
}

/// Attaches the image described by `args`, escalating to fsuid 0 and the
/// `disk` group for the attachment only.
///
/// # Errors
///
/// Returns request, device, or identity restoration errors.
pub fn attach_image(args: &LoopArgs) -> Result<LoopReply> {
    let source = ImageSource::parse(&args.image)?;
    let image = source.open(args.mode)?;
    let device = LoopDevice {
        max_devices: args.max_devices,
        shared: args.shared,
        info: args.info,
    };
    let name = source.display_name();

    let target = FsIdentity {
        uid: Uid::from_raw(0),
        gid: identity::disk_gid(),
    };
    let index = identity::with_escalated(target, || device.attach(image.file(), &name, args.mode))?;
    Ok(LoopReply { index })
}

/// Returns the node path of loop device `index`.
#[must_use]
pub fn device_path(index: u32) -> PathBuf {
    Path::new(LOOP_DEVICE_DIR).join(format!("loop{index}"))
}

fn ensure_node(index: u32, path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    let dev = makedev(LOOP_MAJOR, u64::from(index));
    match mknod(path, SFlag::S_IFBLK, Mode::from_bits_truncate(0o660), dev) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(e) => Err(StockadeError::Device {
            message: format!("cannot create {}: {e}", path.display()),
        }),
    }
}

const fn is_writable(mode: i32) -> bool {
    mode & libc::O_ACCMODE == libc::O_RDWR
}
