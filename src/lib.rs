//! # lsp-link
//!
//! An asynchronous Language Server Protocol client engine. It owns the
//! child server process (gopls, clangd, ...), frames and parses the
//! JSON-RPC stream over its standard pipes, correlates out-of-order
//! responses, cancels superseded requests, and dispatches inbound traffic
//! to registered handlers - while transporting all method payloads as
//! opaque JSON.
//!
//! Layers, leaves first:
//!
//! - [`rpc`]: the JSON-RPC envelope and the Content-Length wire framing
//! - [`io`]: child-process ownership and raw byte transport
//! - [`client`]: request registry, dispatch and the session facade
//!
//! ```no_run
//! use lsp_link::{Client, ServerConfig};
//! use serde_json::json;
//! # async fn run() -> Result<(), lsp_link::ClientError> {
//! let client = Client::new(ServerConfig::new(vec!["gopls".into()]));
//! client.register_handler("textDocument/hover", |message| {
//!     println!("hover answered: {:?}", message.result());
//!     Ok(None)
//! });
//! client.run_server().await?;
//! client.initialize(std::path::Path::new("/project"), json!({})).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod io;
pub mod logging;
pub mod rpc;
pub mod testing;

#[cfg(test)]
mod test_utils;

pub use client::{Client, ClientError, ServerConfig, SessionState};
pub use io::{Transport, TransportError};
pub use rpc::{ErrorObject, Message, MessageError};
