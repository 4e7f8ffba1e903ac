//! Haltalk Client - HAL protocol clients over the socket layer
//!
//! Four clients share a shape: open a Dealer or Subscriber against a bridge
//! URL, dispatch inbound JSON messages by their integer `type` field, and
//! surface state changes and diagnostics as events:
//! - [`Halrcmd`] - command channel with a ping/keepalive liveness check
//! - [`Halrcomp`] - shadow table of a remote component's pins
//! - [`Halgroup`] - shadow table of a signal group
//! - [`Logger`] - backend log stream

pub mod diagnostics;
pub mod halgroup;
pub mod halrcmd;
pub mod halrcomp;
pub mod logger;
pub mod remote;

pub use diagnostics::ProtocolStats;
pub use halgroup::{Halgroup, HalgroupEvent};
pub use halrcmd::{Halrcmd, HalrcmdEvent, PING_INTERVAL};
pub use halrcomp::{Halrcomp, HalrcompEvent};
pub use logger::{Logger, LoggerEvent, LOG_TOPIC};
pub use remote::RemoteConfig;
