//! Default multi-port TCP transfer engine.
//!
//! ```text
//! +--------------+   port N   +--------------+
//! |  TcpSender   | ---------> | TcpReceiver  |
//! | (root scan / |   port N+1 | (writes root,|
//! |  item list)  | ---------> |  .wdt.log)   |
//! +--------------+    ...     +--------------+
//! ```
//!
//! Both roles poll their abort checker between frames; neither is ever
//! interrupted from outside.

pub mod filter;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod transfer_log;

pub use filter::PathFilter;
pub use receiver::TcpReceiver;
pub use sender::TcpSender;
pub use transfer_log::{TransferLogManager, TransferLogWriter};

use crate::config::DEFAULT_LOG_NAME;
use crate::role::{ReceiverSpec, RoleFactory, SenderSpec};

/// Builds TCP roles for the dispatcher.
#[derive(Debug, Clone)]
pub struct TcpEngine {
    log_name: String,
}

impl TcpEngine {
    pub fn new(log_name: impl Into<String>) -> Self {
        Self {
            log_name: log_name.into(),
        }
    }
}

impl Default for TcpEngine {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_NAME)
    }
}

impl RoleFactory for TcpEngine {
    type Sender = TcpSender;
    type Receiver = TcpReceiver;
    type Log = TransferLogManager;

    fn sender(&self, spec: SenderSpec) -> TcpSender {
        TcpSender::new(spec)
    }

    fn receiver(&self, spec: ReceiverSpec) -> TcpReceiver {
        TcpReceiver::new(spec)
    }

    fn transfer_log(&self) -> TransferLogManager {
        TransferLogManager::new(self.log_name.clone())
    }
}
