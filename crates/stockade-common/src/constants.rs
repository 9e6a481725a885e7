//! System-wide constants and default paths.

/// Default base directory for Stockade runtime state.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/stockade";

/// Default location of the runtime configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/stockade/stockade.json";

/// Image reference prefix meaning "adopt this already-open descriptor".
pub const INHERITED_FD_PREFIX: &str = "/proc/self/fd/";

/// Directory holding loop block device nodes.
pub const LOOP_DEVICE_DIR: &str = "/dev";

/// Kernel major number of loop block devices.
pub const LOOP_MAJOR: u64 = 7;

/// Default upper bound on loop device indexes scanned per attachment.
pub const DEFAULT_MAX_LOOP_DEVICES: u32 = 256;

/// Group owning the loop device nodes on most distributions.
pub const DISK_GROUP: &str = "disk";

/// Directory where device-mapper exposes unlocked devices.
pub const DEVICE_MAPPER_DIR: &str = "/dev/mapper";

/// Prefix of device-mapper names created by the crypt unlocker.
pub const CRYPT_NAME_PREFIX: &str = "stockade-crypt-";

/// Binary used to unlock encrypted devices.
pub const CRYPTSETUP_BIN: &str = "cryptsetup";

/// Maximum hostname length accepted by the kernel.
pub const HOST_NAME_MAX: usize = 64;

/// Search path exported to build scripts.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Home directory of build scripts.
pub const BUILD_HOME: &str = "/root";

/// Prefix of environment variables forwarded into build scripts.
pub const BUILD_ENV_PREFIX: &str = "STOCKADEENV_";

/// Variables forwarded verbatim into build scripts.
pub const BUILD_PASSTHROUGH_ENV: [&str; 2] = ["STOCKADE_ROOTFS", "STOCKADE_ENVIRONMENT"];

/// Exit code of an image build whose scripts failed.
pub const BUILD_FAILURE_EXIT_CODE: i32 = 255;
