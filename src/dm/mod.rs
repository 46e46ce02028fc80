//! Device Lifecycle
//!
//! [`DeviceMapper`] drives the kernel through the documented lifecycle of a
//! mapped device:
//!
//! ```text
//!   create ──► load ──► resume ──► (active) ──► suspend ──► resume ...
//!     │                                │
//!     └──────────────► remove ◄────────┘
//! ```
//!
//! Each operation is a single control call. The kernel owns the device
//! state; nothing is cached here, so the same name may be driven from
//! several handles or processes.
//!
//! # Example
//!
//! ```no_run
//! use devmap::{DeviceMapper, DmFlags, LinearTarget, Target};
//!
//! let dm = DeviceMapper::new();
//! let table = vec![Target::from(LinearTarget::new(0, 2048, "/dev/loop0", 0))];
//! dm.create_and_load("scratch", "scratch-uuid", DmFlags::empty(), &table)?;
//! println!("{:?}", dm.info_by_name("scratch")?.state());
//! dm.remove("scratch")?;
//! # Ok::<(), devmap::Error>(())
//! ```

pub mod abi;
pub mod channel;
pub mod info;

pub use abi::{Command, DmFlags};
pub use channel::{ControlChannel, KernelControl};
pub use info::{DevNo, DeviceInfo, DeviceState, ListItem, Version};

use tracing::{debug, info, instrument, warn};

use crate::config::ControlConfig;
use crate::error::{Error, Result};
use crate::target::Target;
use abi::{Header, Request, HEADER_SIZE, UDEV_PRIMARY_EVENT};

/// Growth factor applied to the list buffer after each overflow.
const LIST_BUFFER_GROWTH: usize = 4;

// =============================================================================
// Device Mapper Handle
// =============================================================================

/// Handle for issuing lifecycle operations over a control channel.
#[derive(Debug, Clone)]
pub struct DeviceMapper<C: ControlChannel = KernelControl> {
    channel: C,
    config: ControlConfig,
}

impl DeviceMapper<KernelControl> {
    /// Talk to the kernel through the default control node.
    pub fn new() -> Self {
        Self::with_config(ControlConfig::default())
    }

    pub fn with_config(config: ControlConfig) -> Self {
        Self {
            channel: KernelControl::new(&config.control_path),
            config,
        }
    }
}

impl Default for DeviceMapper<KernelControl> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ControlChannel> DeviceMapper<C> {
    /// Use a custom transport with default tuning.
    pub fn with_channel(channel: C) -> Self {
        Self {
            channel,
            config: ControlConfig::default(),
        }
    }

    /// Use a custom transport and tuning. The config's control path is ignored.
    pub fn with_channel_and_config(channel: C, config: ControlConfig) -> Self {
        Self { channel, config }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Encode `request`, issue it and hand back the response buffer.
    fn call(&self, command: Command, request: &Request<'_>) -> Result<zeroize::Zeroizing<Vec<u8>>> {
        let mut buffer = request.encode();
        debug!(
            %command,
            device = request.name,
            targets = request.targets.len(),
            flags = ?request.flags,
            size = buffer.len(),
            "issuing control call"
        );
        self.channel.ioctl(command, &mut buffer)?;
        Ok(buffer)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Register a new device with no table.
    ///
    /// # Errors
    ///
    /// `EBUSY` if a device with the same name or UUID exists.
    #[instrument(skip(self), level = "debug")]
    pub fn create(&self, name: &str, uuid: &str) -> Result<()> {
        self.call(
            Command::DevCreate,
            &Request {
                name,
                uuid,
                ..Default::default()
            },
        )?;
        info!(device = name, "created device");
        Ok(())
    }

    /// Stage `targets` as the inactive table of `name`.
    ///
    /// Only [`DmFlags::READONLY`] is honored from `flags`. Tables holding
    /// raw crypt keys are marked so the kernel wipes its copy of the
    /// buffer; ours is zeroized on drop.
    #[instrument(skip(self, targets), fields(targets = targets.len()), level = "debug")]
    pub fn load(&self, name: &str, flags: DmFlags, targets: &[Target]) -> Result<()> {
        let mut flags = flags & DmFlags::READONLY;
        if targets.iter().any(Target::carries_secret) {
            flags |= DmFlags::SECURE_DATA;
        }
        self.call(
            Command::TableLoad,
            &Request {
                name,
                flags,
                targets,
                ..Default::default()
            },
        )?;
        info!(device = name, targets = targets.len(), "loaded table");
        Ok(())
    }

    /// Suspend I/O on the live table.
    #[instrument(skip(self), level = "debug")]
    pub fn suspend(&self, name: &str) -> Result<()> {
        self.call(
            Command::DevSuspend,
            &Request {
                name,
                flags: DmFlags::SUSPEND,
                ..Default::default()
            },
        )?;
        info!(device = name, "suspended device");
        Ok(())
    }

    /// Activate the staged table, or resume a suspended device.
    #[instrument(skip(self), level = "debug")]
    pub fn resume(&self, name: &str) -> Result<()> {
        self.call(
            Command::DevSuspend,
            &Request {
                name,
                event_nr: UDEV_PRIMARY_EVENT,
                ..Default::default()
            },
        )?;
        info!(device = name, "resumed device");
        Ok(())
    }

    /// Tear down the device.
    #[instrument(skip(self), level = "debug")]
    pub fn remove(&self, name: &str) -> Result<()> {
        self.call(
            Command::DevRemove,
            &Request {
                name,
                event_nr: UDEV_PRIMARY_EVENT,
                ..Default::default()
            },
        )?;
        info!(device = name, "removed device");
        Ok(())
    }

    /// Create, load and activate in one step.
    ///
    /// If loading fails the freshly created device is removed again (best
    /// effort) and the load error is returned. A failed resume leaves the
    /// device in place for the caller to inspect.
    #[instrument(skip(self, targets), fields(targets = targets.len()))]
    pub fn create_and_load(
        &self,
        name: &str,
        uuid: &str,
        flags: DmFlags,
        targets: &[Target],
    ) -> Result<()> {
        self.create(name, uuid)?;
        if let Err(err) = self.load(name, flags, targets) {
            warn!(device = name, error = %err, "table load failed, removing device");
            if let Err(remove_err) = self.remove(name) {
                warn!(device = name, error = %remove_err, "rollback remove failed");
            }
            return Err(err);
        }
        self.resume(name)
    }

    // =========================================================================
    // Unsupported Operations
    // =========================================================================

    /// Send a message to a target. Not supported.
    pub fn message(&self, _name: &str, _sector: u64, _message: &str) -> Result<()> {
        Err(Error::NotImplemented("target message"))
    }

    /// Rename a device. Not supported.
    pub fn rename(&self, _old_name: &str, _new_name: &str) -> Result<()> {
        Err(Error::NotImplemented("device rename"))
    }

    /// Assign a UUID to a device. Not supported.
    pub fn set_uuid(&self, _name: &str, _uuid: &str) -> Result<()> {
        Err(Error::NotImplemented("set uuid"))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Enumerate all mapped devices.
    ///
    /// Starts with the configured buffer and quadruples it each time the
    /// kernel reports the result did not fit, up to the configured limit.
    #[instrument(skip(self), level = "debug")]
    pub fn list(&self) -> Result<Vec<ListItem>> {
        let limit = self.config.list_buffer_limit.max(HEADER_SIZE);
        let mut size = self.config.list_buffer_size.clamp(HEADER_SIZE, limit);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let buffer = self.call(
                Command::ListDevices,
                &Request {
                    min_size: size,
                    ..Default::default()
                },
            )?;
            let header = Header::decode(&buffer)?;
            if !header.flags.contains(DmFlags::BUFFER_FULL) {
                let records = abi::decode_name_list(&buffer, &header)?;
                debug!(devices = records.len(), attempts, "listed devices");
                return Ok(records.into_iter().map(ListItem::from).collect());
            }
            if size >= limit {
                return Err(Error::ListBufferExhausted { limit, attempts });
            }
            size = size.saturating_mul(LIST_BUFFER_GROWTH).min(limit);
            debug!(size, "device list did not fit, growing buffer");
        }
    }

    /// Status of the device called `name`.
    #[instrument(skip(self), level = "debug")]
    pub fn info_by_name(&self, name: &str) -> Result<DeviceInfo> {
        self.status(&Request {
            name,
            ..Default::default()
        })
    }

    /// Status of the device with number `devno`.
    #[instrument(skip(self), level = "debug")]
    pub fn info_by_devno(&self, devno: DevNo) -> Result<DeviceInfo> {
        self.status(&Request {
            dev: devno.to_kernel(),
            ..Default::default()
        })
    }

    fn status(&self, request: &Request<'_>) -> Result<DeviceInfo> {
        let buffer = self.call(Command::DevStatus, request)?;
        Ok(DeviceInfo::from(Header::decode(&buffer)?))
    }

    /// Interface version implemented by the running kernel.
    pub fn version(&self) -> Result<Version> {
        let buffer = self.call(Command::Version, &Request::default())?;
        let version = Version::from(Header::decode(&buffer)?.version);
        debug!(%version, "kernel interface version");
        Ok(version)
    }
}

// =============================================================================
// Convenience Functions
// =============================================================================
//
// One-shot wrappers over a default `DeviceMapper`.

/// See [`DeviceMapper::create`].
pub fn create(name: &str, uuid: &str) -> Result<()> {
    DeviceMapper::new().create(name, uuid)
}

/// See [`DeviceMapper::create_and_load`].
pub fn create_and_load(name: &str, uuid: &str, flags: DmFlags, targets: &[Target]) -> Result<()> {
    DeviceMapper::new().create_and_load(name, uuid, flags, targets)
}

/// See [`DeviceMapper::load`].
pub fn load(name: &str, flags: DmFlags, targets: &[Target]) -> Result<()> {
    DeviceMapper::new().load(name, flags, targets)
}

/// See [`DeviceMapper::suspend`].
pub fn suspend(name: &str) -> Result<()> {
    DeviceMapper::new().suspend(name)
}

/// See [`DeviceMapper::resume`].
pub fn resume(name: &str) -> Result<()> {
    DeviceMapper::new().resume(name)
}

/// See [`DeviceMapper::remove`].
pub fn remove(name: &str) -> Result<()> {
    DeviceMapper::new().remove(name)
}

/// See [`DeviceMapper::message`].
pub fn message(name: &str, sector: u64, message: &str) -> Result<()> {
    DeviceMapper::new().message(name, sector, message)
}

/// See [`DeviceMapper::rename`].
pub fn rename(old_name: &str, new_name: &str) -> Result<()> {
    DeviceMapper::new().rename(old_name, new_name)
}

/// See [`DeviceMapper::set_uuid`].
pub fn set_uuid(name: &str, uuid: &str) -> Result<()> {
    DeviceMapper::new().set_uuid(name, uuid)
}

/// See [`DeviceMapper::list`].
pub fn list() -> Result<Vec<ListItem>> {
    DeviceMapper::new().list()
}

/// See [`DeviceMapper::info_by_name`].
pub fn info_by_name(name: &str) -> Result<DeviceInfo> {
    DeviceMapper::new().info_by_name(name)
}

/// See [`DeviceMapper::info_by_devno`].
pub fn info_by_devno(major: u32, minor: u32) -> Result<DeviceInfo> {
    DeviceMapper::new().info_by_devno(DevNo::new(major, minor))
}

/// See [`DeviceMapper::version`].
pub fn get_version() -> Result<Version> {
    DeviceMapper::new().version()
}

#[cfg(test)]
mod tests {
    use super::abi::tests::name_list_response;
    use super::*;
    use crate::target::{CryptKey, CryptTarget, LinearTarget};
    use assert_matches::assert_matches;
    use std::cell::RefCell;

    /// One control call as seen by the fake kernel.
    #[derive(Debug, Clone)]
    struct Call {
        command: Command,
        header: Header,
        len: usize,
    }

    type Responder = Box<dyn Fn(Command, &mut [u8]) -> Result<()>>;

    /// Channel that records requests and lets each test script responses.
    struct FakeKernel {
        calls: RefCell<Vec<Call>>,
        respond: Responder,
    }

    impl FakeKernel {
        fn new(respond: impl Fn(Command, &mut [u8]) -> Result<()> + 'static) -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                respond: Box::new(respond),
            }
        }

        fn accepting() -> Self {
            Self::new(|_, _| Ok(()))
        }

        fn commands(&self) -> Vec<Command> {
            self.calls.borrow().iter().map(|c| c.command).collect()
        }
    }

    impl ControlChannel for FakeKernel {
        fn ioctl(&self, command: Command, buffer: &mut [u8]) -> Result<()> {
            self.calls.borrow_mut().push(Call {
                command,
                header: Header::decode(buffer)?,
                len: buffer.len(),
            });
            (self.respond)(command, buffer)
        }
    }

    fn rejected(command: Command, errno: i32) -> Error {
        Error::Ioctl {
            command,
            device: "vol".to_string(),
            errno,
        }
    }

    fn set_flags(buffer: &mut [u8], flags: DmFlags) {
        buffer[28..32].copy_from_slice(&flags.bits().to_ne_bytes());
    }

    fn linear_table() -> Vec<Target> {
        vec![Target::from(LinearTarget::new(0, 8, "/dev/loop0", 0))]
    }

    #[test]
    fn test_create_sends_name_and_uuid() {
        let dm = DeviceMapper::with_channel(FakeKernel::accepting());
        dm.create("vol", "uuid-1").unwrap();

        let calls = dm.channel().calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].command, Command::DevCreate);
        assert_eq!(calls[0].header.name, "vol");
        assert_eq!(calls[0].header.uuid, "uuid-1");
        assert_eq!(calls[0].header.flags, DmFlags::empty());
    }

    #[test]
    fn test_load_masks_flags() {
        let dm = DeviceMapper::with_channel(FakeKernel::accepting());
        dm.load(
            "vol",
            DmFlags::READONLY | DmFlags::SUSPEND | DmFlags::NOFLUSH,
            &linear_table(),
        )
        .unwrap();

        let calls = dm.channel().calls.borrow();
        assert_eq!(calls[0].command, Command::TableLoad);
        assert_eq!(calls[0].header.flags, DmFlags::READONLY);
        assert_eq!(calls[0].header.target_count, 1);
    }

    #[test]
    fn test_load_marks_raw_keys_secure() {
        let dm = DeviceMapper::with_channel(FakeKernel::accepting());
        let table = vec![Target::from(CryptTarget::new(
            0,
            8,
            "/dev/loop0",
            CryptKey::raw(vec![0xab; 64]),
        ))];
        dm.load("secure", DmFlags::empty(), &table).unwrap();

        let calls = dm.channel().calls.borrow();
        assert_eq!(calls[0].header.flags, DmFlags::SECURE_DATA);
    }

    #[test]
    fn test_udev_cookie_only_on_resume_and_remove() {
        let dm = DeviceMapper::with_channel(FakeKernel::accepting());
        dm.create("vol", "").unwrap();
        dm.suspend("vol").unwrap();
        dm.resume("vol").unwrap();
        dm.remove("vol").unwrap();

        let calls = dm.channel().calls.borrow();
        let events: Vec<u32> = calls.iter().map(|c| c.header.event_nr).collect();
        assert_eq!(events, vec![0, 0, UDEV_PRIMARY_EVENT, UDEV_PRIMARY_EVENT]);
        assert_eq!(calls[1].header.flags, DmFlags::SUSPEND);
        assert_eq!(calls[2].header.flags, DmFlags::empty());
        assert_eq!(UDEV_PRIMARY_EVENT, 0x0040_0000);
    }

    #[test]
    fn test_create_and_load_happy_path() {
        let dm = DeviceMapper::with_channel(FakeKernel::accepting());
        dm.create_and_load("vol", "u", DmFlags::empty(), &linear_table())
            .unwrap();
        assert_eq!(
            dm.channel().commands(),
            vec![Command::DevCreate, Command::TableLoad, Command::DevSuspend]
        );
    }

    #[test]
    fn test_create_and_load_rolls_back_failed_load() {
        let dm = DeviceMapper::with_channel(FakeKernel::new(|command, _| match command {
            Command::TableLoad => Err(rejected(command, libc::EINVAL)),
            _ => Ok(()),
        }));

        let err = dm
            .create_and_load("vol", "u", DmFlags::empty(), &linear_table())
            .unwrap_err();
        assert_matches!(
            err,
            Error::Ioctl { command: Command::TableLoad, errno, .. } if errno == libc::EINVAL
        );
        assert_eq!(
            dm.channel().commands(),
            vec![Command::DevCreate, Command::TableLoad, Command::DevRemove]
        );
    }

    #[test]
    fn test_create_and_load_keeps_load_error_when_rollback_fails() {
        let dm = DeviceMapper::with_channel(FakeKernel::new(|command, _| match command {
            Command::TableLoad => Err(rejected(command, libc::EINVAL)),
            Command::DevRemove => Err(rejected(command, libc::EBUSY)),
            _ => Ok(()),
        }));

        let err = dm
            .create_and_load("vol", "u", DmFlags::empty(), &linear_table())
            .unwrap_err();
        assert_eq!(err.errno(), Some(libc::EINVAL));
    }

    #[test]
    fn test_create_failure_skips_everything_else() {
        let dm = DeviceMapper::with_channel(FakeKernel::new(|command, _| match command {
            Command::DevCreate => Err(rejected(command, libc::EBUSY)),
            _ => Ok(()),
        }));
        assert!(dm
            .create_and_load("vol", "u", DmFlags::empty(), &linear_table())
            .is_err());
        assert_eq!(dm.channel().commands(), vec![Command::DevCreate]);
    }

    #[test]
    fn test_resume_failure_does_not_remove() {
        let dm = DeviceMapper::with_channel(FakeKernel::new(|command, _| match command {
            Command::DevSuspend => Err(rejected(command, libc::ENXIO)),
            _ => Ok(()),
        }));
        assert!(dm
            .create_and_load("vol", "u", DmFlags::empty(), &linear_table())
            .is_err());
        assert_eq!(
            dm.channel().commands(),
            vec![Command::DevCreate, Command::TableLoad, Command::DevSuspend]
        );
    }

    #[test]
    fn test_unsupported_operations() {
        let dm = DeviceMapper::with_channel(FakeKernel::accepting());
        assert!(dm.message("vol", 0, "hello").unwrap_err().is_not_implemented());
        assert!(dm.rename("vol", "vol2").unwrap_err().is_not_implemented());
        assert!(dm.set_uuid("vol", "u").unwrap_err().is_not_implemented());
        assert!(dm.channel().calls.borrow().is_empty());
    }

    #[test]
    fn test_list_decodes_devices() {
        let dm = DeviceMapper::with_channel(FakeKernel::new(|_, buffer| {
            let response =
                name_list_response(&[(0xfd00, "alpha", 1), (0xfd01, "beta", 2)], buffer.len());
            buffer.copy_from_slice(&response);
            Ok(())
        }));

        let devices = dm.list().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "alpha");
        assert_eq!(devices[0].devno, DevNo::new(253, 0));
        assert_eq!(devices[1].event_nr, Some(2));
        assert_eq!(dm.channel().calls.borrow()[0].len, 16 * 1024);
    }

    #[test]
    fn test_list_grows_until_it_fits() {
        let dm = DeviceMapper::with_channel(FakeKernel::new(|_, buffer| {
            if buffer.len() < 256 * 1024 {
                set_flags(buffer, DmFlags::BUFFER_FULL);
            } else {
                let response = name_list_response(&[(0xfd00, "big", 0)], buffer.len());
                buffer.copy_from_slice(&response);
            }
            Ok(())
        }));

        assert_eq!(dm.list().unwrap().len(), 1);
        let sizes: Vec<usize> = dm.channel().calls.borrow().iter().map(|c| c.len).collect();
        assert_eq!(sizes, vec![16 * 1024, 64 * 1024, 256 * 1024]);
    }

    #[test]
    fn test_list_gives_up_after_ceiling() {
        let dm = DeviceMapper::with_channel(FakeKernel::new(|_, buffer| {
            set_flags(buffer, DmFlags::BUFFER_FULL);
            Ok(())
        }));

        assert_matches!(
            dm.list(),
            Err(Error::ListBufferExhausted { limit: 1048576, attempts: 4 })
        );
        let sizes: Vec<usize> = dm.channel().calls.borrow().iter().map(|c| c.len).collect();
        assert_eq!(sizes, vec![16 * 1024, 64 * 1024, 256 * 1024, 1024 * 1024]);
    }

    #[test]
    fn test_list_honors_configured_buffer_sizes() {
        let config = ControlConfig {
            list_buffer_size: 4096,
            list_buffer_limit: 32 * 1024,
            ..ControlConfig::default()
        };
        let dm = DeviceMapper::with_channel_and_config(
            FakeKernel::new(|_, buffer| {
                set_flags(buffer, DmFlags::BUFFER_FULL);
                Ok(())
            }),
            config.clone(),
        );
        assert_eq!(dm.config(), &config);

        assert_matches!(
            dm.list(),
            Err(Error::ListBufferExhausted { limit: 32768, attempts: 3 })
        );
        let sizes: Vec<usize> = dm.channel().calls.borrow().iter().map(|c| c.len).collect();
        assert_eq!(sizes, vec![4096, 16 * 1024, 32 * 1024]);
    }

    #[test]
    fn test_list_empty() {
        let dm = DeviceMapper::with_channel(FakeKernel::new(|_, buffer| {
            let response = name_list_response(&[], buffer.len());
            buffer.copy_from_slice(&response);
            Ok(())
        }));
        assert!(dm.list().unwrap().is_empty());
    }

    #[test]
    fn test_info_by_name_reports_state() {
        let dm = DeviceMapper::with_channel(FakeKernel::new(|_, buffer| {
            set_flags(buffer, DmFlags::ACTIVE_PRESENT);
            buffer[40..48].copy_from_slice(&DevNo::new(253, 3).to_kernel().to_ne_bytes());
            buffer[20..24].copy_from_slice(&2u32.to_ne_bytes());
            Ok(())
        }));

        let info = dm.info_by_name("vol").unwrap();
        assert_eq!(info.name, "vol");
        assert_eq!(info.devno, DevNo::new(253, 3));
        assert_eq!(info.target_count, 2);
        assert_eq!(info.state(), DeviceState::Active);
        assert_eq!(dm.channel().calls.borrow()[0].command, Command::DevStatus);
    }

    #[test]
    fn test_info_by_devno_addresses_by_number() {
        let dm = DeviceMapper::with_channel(FakeKernel::accepting());
        dm.info_by_devno(DevNo::new(253, 9)).unwrap();

        let calls = dm.channel().calls.borrow();
        assert_eq!(calls[0].header.name, "");
        assert_eq!(calls[0].header.dev, DevNo::new(253, 9).to_kernel());
    }

    #[test]
    fn test_version_reads_header() {
        let dm = DeviceMapper::with_channel(FakeKernel::new(|_, buffer| {
            buffer[4..8].copy_from_slice(&48u32.to_ne_bytes());
            buffer[8..12].copy_from_slice(&1u32.to_ne_bytes());
            Ok(())
        }));
        assert_eq!(dm.version().unwrap().to_string(), "4.48.1");
        assert_eq!(dm.channel().calls.borrow()[0].header.version, [4, 0, 0]);
    }

    #[test]
    fn test_channel_error_propagates() {
        let dm = DeviceMapper::with_channel(FakeKernel::new(|command, _| {
            Err(rejected(command, libc::ENXIO))
        }));
        assert_eq!(dm.resume("vol").unwrap_err().errno(), Some(libc::ENXIO));
    }
}
