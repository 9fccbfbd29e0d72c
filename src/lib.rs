//! # sondestream
//!
//! `sondestream` keeps a live subscription to the SondeHub radiosonde feed,
//! an MQTT broker reached over WebSockets, and hands every received message
//! to a callback. Topics can be added and removed while the stream runs, and
//! the subscription survives connection loss.
//!
//! ## Core Modules
//!
//! - `resolver`: the discovery call returning the current broker address.
//! - `transport`: the broker seam (`Connector` / `Session`) and its MQTT implementation.
//! - `stream`: the `StreamManager`, which owns the topic set, reconnects and dispatches messages.
//! - `relay`: a WebSocket server fanning the feed out to browsers.
//! - `config`: layered settings from file and environment.
//! - `utils`: error type and logging set-up.
//!
//! ```no_run
//! use sondestream::{StreamManager, StreamOptions};
//!
//! # async fn run() -> sondestream::Result<()> {
//! let options = StreamOptions::default().with_topics(["T1234567"]);
//! let manager = StreamManager::start(options, |message| {
//!     println!("{}", String::from_utf8_lossy(&message.payload));
//! })
//! .await?;
//!
//! manager.add_topic("T7654321").await?;
//! manager.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod relay;
pub mod resolver;
pub mod stream;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use stream::{ConnectionState, Message, StreamManager, StreamOptions};
pub use utils::error::{Result, StreamError};
