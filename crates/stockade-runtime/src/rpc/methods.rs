//! The privileged operation catalogue.
//!
//! Every engine exposes a [`Methods`] implementation through the registry.
//! [`HostMethods`] performs the operations on the running host and funnels
//! everything that touches per-thread kernel state through the affinity
//! executor.

use stockade_common::error::Result;
use stockade_common::types::{
    ChdirArgs, ChrootArgs, CryptArgs, CryptReply, HostnameArgs, LoopArgs, LoopReply, MkdirArgs,
    MountArgs, SetFsIdArgs,
};
use stockade_core::affinity::AffinityExecutor;
use stockade_core::device;
use stockade_core::filesystem::{dir, mount, root_switch};
use stockade_core::identity::FsIdentity;
use stockade_core::namespace::uts;

use super::protocol::{Reply, Request};

/// Operations callable over the privileged server.
pub trait Methods: Send + Sync {
    /// Mounts a filesystem.
    ///
    /// # Errors
    ///
    /// Returns the kernel error with source and target context.
    fn mount(&self, executor: &AffinityExecutor, args: MountArgs) -> Result<()>;

    /// Unlocks an encrypted device and returns its mapped node.
    ///
    /// # Errors
    ///
    /// Returns device or namespace errors.
    fn decrypt(&self, executor: &AffinityExecutor, args: CryptArgs) -> Result<CryptReply>;

    /// Creates a directory with an exact mode.
    ///
    /// # Errors
    ///
    /// Returns the `mkdir(2)` error.
    fn mkdir(&self, executor: &AffinityExecutor, args: MkdirArgs) -> Result<()>;

    /// Switches the root filesystem.
    ///
    /// # Errors
    ///
    /// Returns the failed step.
    fn chroot(&self, executor: &AffinityExecutor, args: ChrootArgs) -> Result<()>;

    /// Attaches an image to a loop device.
    ///
    /// # Errors
    ///
    /// Returns request, device or identity restoration errors.
    fn loop_device(&self, executor: &AffinityExecutor, args: LoopArgs) -> Result<LoopReply>;

    /// Sets the hostname.
    ///
    /// # Errors
    ///
    /// Returns validation or `sethostname(2)` errors.
    fn set_hostname(&self, executor: &AffinityExecutor, args: HostnameArgs) -> Result<()>;

    /// Durably sets the filesystem identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refused the identity.
    fn set_fs_id(&self, executor: &AffinityExecutor, args: SetFsIdArgs) -> Result<()>;

    /// Changes the working directory.
    ///
    /// # Errors
    ///
    /// Returns the `chdir(2)` error.
    fn chdir(&self, executor: &AffinityExecutor, args: ChdirArgs) -> Result<()>;
}

/// Routes a decoded request to the matching method.
///
/// # Errors
///
/// Returns whatever the method returned.
pub fn dispatch(
    methods: &dyn Methods,
    executor: &AffinityExecutor,
    request: Request,
) -> Result<Reply> {
    match request {
        Request::Mount(args) => methods.mount(executor, args).map(|()| Reply::Unit),
        Request::Decrypt(args) => methods.decrypt(executor, args).map(Reply::Crypt),
        Request::Mkdir(args) => methods.mkdir(executor, args).map(|()| Reply::Unit),
        Request::Chroot(args) => methods.chroot(executor, args).map(|()| Reply::Unit),
        Request::LoopDevice(args) => methods.loop_device(executor, args).map(Reply::Loop),
        Request::SetHostname(args) => methods.set_hostname(executor, args).map(|()| Reply::Unit),
        Request::SetFsId(args) => methods.set_fs_id(executor, args).map(|()| Reply::Unit),
        Request::Chdir(args) => methods.chdir(executor, args).map(|()| Reply::Unit),
    }
}

/// Operations performed directly on the host kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostMethods;

impl Methods for HostMethods {
    fn mount(&self, executor: &AffinityExecutor, args: MountArgs) -> Result<()> {
        executor.run(move || mount::mount(&args))
    }

    fn decrypt(&self, _executor: &AffinityExecutor, args: CryptArgs) -> Result<CryptReply> {
        // Runs on its own discarded thread; see `device::crypt::unlock`.
        device::unlock(args)
    }

    fn mkdir(&self, executor: &AffinityExecutor, args: MkdirArgs) -> Result<()> {
        executor.run(move || dir::make_dir(&args.path, args.mode))
    }

    fn chroot(&self, executor: &AffinityExecutor, args: ChrootArgs) -> Result<()> {
        executor.run(move || root_switch::switch_root(&args.root, args.method))
    }

    fn loop_device(&self, executor: &AffinityExecutor, args: LoopArgs) -> Result<LoopReply> {
        executor.run(move || device::attach_image(&args))
    }

    fn set_hostname(&self, executor: &AffinityExecutor, args: HostnameArgs) -> Result<()> {
        // UTS membership is per thread once the worker unshared it.
        executor.run(move || uts::set_hostname(&args.hostname))
    }

    fn set_fs_id(&self, executor: &AffinityExecutor, args: SetFsIdArgs) -> Result<()> {
        executor.run(move || FsIdentity::from_raw(args.uid, args.gid).apply())
    }

    fn chdir(&self, executor: &AffinityExecutor, args: ChdirArgs) -> Result<()> {
        executor.run(move || dir::change_dir(&args.dir))
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use stockade_common::error::StockadeError;
    use stockade_common::types::ChrootMethod;

    use super::*;

    #[test]
    fn mkdir_runs_on_the_worker() {
        let executor = AffinityExecutor::spawn().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("made");

        let reply = dispatch(
            &HostMethods,
            &executor,
            Request::Mkdir(MkdirArgs {
                path: path.clone(),
                mode: 0o750,
            }),
        )
        .unwrap();

        assert_eq!(reply, Reply::Unit);
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o750);
    }

    #[test]
    fn chdir_changes_only_the_worker() {
        let executor = AffinityExecutor::spawn().unwrap();
        // Give the worker its own cwd so the test process is unaffected.
        executor
            .run(|| stockade_core::namespace::create_namespaces(&Default::default()))
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let before = std::env::current_dir().unwrap();

        let _ = dispatch(
            &HostMethods,
            &executor,
            Request::Chdir(ChdirArgs {
                dir: dir.path().to_path_buf(),
            }),
        )
        .unwrap();

        let worker_cwd = executor.submit(|| std::env::current_dir().unwrap()).unwrap();
        assert_eq!(worker_cwd, dir.path().canonicalize().unwrap());
        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[test]
    fn bad_root_is_root_switch_error() {
        let executor = AffinityExecutor::spawn().unwrap();
        let err = dispatch(
            &HostMethods,
            &executor,
            Request::Chroot(ChrootArgs {
                root: "/nonexistent/rootfs".into(),
                method: ChrootMethod::Chroot,
            }),
        )
        .unwrap_err();
        assert!(matches!(err, StockadeError::RootSwitch { .. }));
    }

    #[test]
    fn invalid_hostname_is_config_error() {
        let executor = AffinityExecutor::spawn().unwrap();
        let err = dispatch(
            &HostMethods,
            &executor,
            Request::SetHostname(HostnameArgs {
                hostname: String::new(),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, StockadeError::Config { .. }));
    }

    #[test]
    fn malformed_image_reference_is_config_error() {
        let executor = AffinityExecutor::spawn().unwrap();
        let err = dispatch(
            &HostMethods,
            &executor,
            Request::LoopDevice(LoopArgs {
                image: "/proc/self/fd/abc".into(),
                mode: 0,
                max_devices: 8,
                shared: false,
                info: Default::default(),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, StockadeError::Config { .. }));
    }

    #[test]
    fn current_identity_can_be_reapplied() {
        let executor = AffinityExecutor::spawn().unwrap();
        let current = executor.submit(FsIdentity::current).unwrap();
        let reply = dispatch(
            &HostMethods,
            &executor,
            Request::SetFsId(SetFsIdArgs {
                uid: current.uid.as_raw(),
                gid: current.gid.as_raw(),
            }),
        )
        .unwrap();
        assert_eq!(reply, Reply::Unit);
    }
}
