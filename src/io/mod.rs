//! I/O layer - Generic abstractions for process management and transport
//!
//! - **Transport**: raw bidirectional text exchange over pipes or sockets
//! - **Process**: external process lifecycle management with stdio integration
//!
//! Both the language-server connection and the debug-adapter connection are
//! built on these.

pub mod process;
pub mod transport;

pub use process::{
    ChildProcessManager, ProcessError, ProcessExitEvent, ProcessExitHandler, ProcessManager,
    ProcessState, StderrMonitor, StopMode,
};
#[cfg(test)]
pub use transport::MockTransport;
pub use transport::{StreamTransport, StreamTransportError, Transport};
