//! Instrument command/response transport.
//!
//! An [`InstrumentChannel`] is a bidirectional pipe to exactly one instrument. It does not
//! know anything about what the commands mean; it only moves them and their answers.
//!
//! Implementations must serialise all three operations on the underlying connection:
//! the Siglent oscilloscope's command interpreter corrupts its own state when it sees
//! interleaved traffic, so there can never be two exchanges in flight at once.
//!
//! - [`tcp::TcpChannel`]: raw-socket SCPI over TCP (port 5025 on Siglent instruments)
//! - [`mock::MockChannel`]: scripted replies and a call log, for tests
//! - [`sim::SimulatedBench`]: a generator/oscilloscope pair wired to a simulated RC filter

use crate::error::InstrumentResult;
use async_trait::async_trait;

pub mod mock;
pub mod sim;
pub mod tcp;

pub use mock::{CallLog, MockChannel, MockReply};
pub use sim::{SimGenerator, SimScope, SimulatedBench};
pub use tcp::TcpChannel;

/// Command/response transport to one instrument.
///
/// # Contract
/// - `send` writes a command that produces no response
/// - `ask` writes a query and returns the textual response without its line terminator
/// - `ask_raw` writes a query and returns the undecoded response bytes without the
///   line terminator, for responses that are not valid text
/// - `ask` and `ask_raw` fail with `ProtocolTimeout` when no response arrives in time
#[async_trait]
pub trait InstrumentChannel: Send + Sync {
    /// Send a command without expecting a response.
    async fn send(&self, command: &str) -> InstrumentResult<()>;

    /// Send a query and return the decoded, trimmed response line.
    async fn ask(&self, query: &str) -> InstrumentResult<String>;

    /// Send a query and return the raw response payload.
    async fn ask_raw(&self, query: &str) -> InstrumentResult<Vec<u8>>;

    /// Human readable description used in log output.
    fn describe(&self) -> String {
        "instrument".to_string()
    }
}

#[async_trait]
impl<T: InstrumentChannel + ?Sized> InstrumentChannel for Box<T> {
    async fn send(&self, command: &str) -> InstrumentResult<()> {
        (**self).send(command).await
    }

    async fn ask(&self, query: &str) -> InstrumentResult<String> {
        (**self).ask(query).await
    }

    async fn ask_raw(&self, query: &str) -> InstrumentResult<Vec<u8>> {
        (**self).ask_raw(query).await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
