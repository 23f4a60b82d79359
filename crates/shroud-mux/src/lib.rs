//! shroud-mux: Session multiplexing for the shroud tunnel
//!
//! A [`Session`] spreads many ordered, independently closable logical
//! [`Stream`]s over one or more physical connections. Every frame is passed
//! through the session's obfuscation codec before it touches the wire, and
//! the physical links are fanned out by an internal switchboard under the
//! throughput policy of a shared [`Valve`].
//!
//! ```text
//!  open_stream() / accept()
//!          │
//!    ┌─────▼─────┐   frames    ┌─────────────┐   records   ┌───────────┐
//!    │  Session  │◄──────────►│ switchboard │◄──────────►│ conn 1..n │
//!    │ (streams) │            │   (Valve)   │            └───────────┘
//!    └───────────┘            └─────────────┘
//! ```

pub mod session;
pub mod stream;
mod switchboard;
pub mod valve;

pub use session::Session;
pub use stream::Stream;
pub use valve::Valve;

pub use shroud_core::{MuxConfig, SessionError, StreamError};
