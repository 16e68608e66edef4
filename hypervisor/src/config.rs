//! The module containing various constants that may be modified by developers.

use crate::logger::UartComPort;

/// The logging level.
pub const LOGGING_LEVEL: log::LevelFilter = log::LevelFilter::Debug;

/// The COM port to be used for UART logging.
pub const UART_PORT: UartComPort = UartComPort::Com1;

/// Upper bound of the exponential backoff used by [`crate::spinlock::SpinLock::lock`],
/// in pause instructions per round.
pub const SPINLOCK_MAX_WAIT: u32 = 65536;

/// The number of external interrupts a core can hold back while the guest is
/// not interruptible or a hook single-step is in flight.
pub const PENDING_INTERRUPTS_BUFFER_CAPACITY: usize = 64;

/// Size of the stack each core runs its VM-exit handler on.
pub const HOST_STACK_SIZE: usize = 0x8000;

/// VPID tag written to every VMCS. Zero is reserved for VMX root operation.
pub const VPID_TAG: u16 = 1;

/// The span of guest-physical memory covered by the EPT identity map (512 GiB).
pub const EPT_SUPPORTED_PHYSICAL_WIDTH: u64 = 512 * 1024 * 1024 * 1024;
