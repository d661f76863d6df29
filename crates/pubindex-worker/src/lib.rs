//! pubindex worker
//!
//! Consumes publication notifications from a message queue and turns each
//! one into search index entries:
//!
//! 1. **copy** the referenced files into a durable staging area
//! 2. **extract** file metadata and a schema.org description
//! 3. **assemble** ingest documents
//! 4. **submit** them to the search index, recording task ids in a ledger
//! 5. **notify** the portal of the task id (best effort)
//!
//! # Example
//!
//! ```no_run
//! use pubindex_worker::config::Settings;
//! use pubindex_worker::message::Message;
//! use pubindex_worker::pipeline::Controller;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load(None)?;
//!     let controller = Controller::from_settings(&settings)?;
//!
//!     let message = Message::from_slice(br#"{"uuid":"r1","path":"/data/dem.tif","type":"single"}"#)?;
//!     let outcome = controller.process(&message).await;
//!     println!("{}", outcome);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod consumer;
pub mod error;
pub mod ledger;
pub mod message;
pub mod pipeline;
pub mod stages;
pub mod watch;

pub use error::{NotifyError, StageError, TransportError, ValidationError};
pub use message::{Message, PublicationKind};
pub use pipeline::{Controller, Outcome};
