//! Linux POSIX capability sets as an explicit, in-memory state machine.
//!
//! A [`CapSession`] binds one target (the current process, another
//! pid, or an executable file), loads its capability state, mutates the
//! in-memory bits, and commits them back to the kernel or to the file's
//! `security.capability` extended attribute. [`StateStack`] snapshots
//! and restores the live process state around privileged sections.
//!
//! ```no_run
//! use capng::{Action, CapSession, Capability, CapabilityType, Destination, Select};
//!
//! fn main() -> Result<(), capng::CapError> {
//!     let mut session = CapSession::new();
//!     session.caps_process()?;
//!     if !session.have_capability(CapabilityType::EFFECTIVE, Capability::by_name("net_bind_service")?) {
//!         session.update(
//!             Action::Add,
//!             CapabilityType::EFFECTIVE | CapabilityType::PERMITTED,
//!             Capability::by_name("net_bind_service")?,
//!         )?;
//!         session.apply(Select::CAPS)?;
//!     }
//!     println!(
//!         "{}",
//!         capng::print::caps_text(
//!             Destination::Buffer,
//!             session.capability_set(),
//!             CapabilityType::EFFECTIVE
//!         )
//!     );
//!     Ok(())
//! }
//! ```
//!
//! Process capability state is shared by every thread; callers that
//! mutate from several threads must serialize their bind→mutate→apply
//! sequences themselves. No subscriber or logger is installed by the
//! library; diagnostics go through `tracing`.

pub mod backend;
pub mod cap;
pub mod error;
pub mod fcaps;
pub mod print;
pub mod session;
pub mod set;
pub mod state;
pub mod target;

pub use backend::{Backend, KernelBackend, ProcessState};
pub use cap::Capability;
pub use error::CapError;
pub use fcaps::FileCaps;
pub use print::Destination;
pub use session::CapSession;
pub use set::{Action, CapabilitySet, CapabilityType, ChangeIdFlags, QueryResult, Select};
pub use state::{StateGuard, StateStack};
pub use target::Target;
