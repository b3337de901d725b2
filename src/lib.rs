#![deny(unsafe_code)]

//! Bidirectional RPC over length-prefixed s-expression frames.
//!
//! Both endpoints of a connection register methods and call each other;
//! calls carry correlation uids and replies come back as deferred
//! completions. Frames are a 6-hex-digit byte length followed by one UTF-8
//! s-expression ending in a newline.
//!
//! Everything runs on a single-threaded cooperative runtime — see
//! [`runtime`] for the entry point, [`deferred`] for the continuation
//! engine, and [`manager`] for the RPC surface.
//!
//! ```no_run
//! use epc::prelude::*;
//!
//! fn main() -> std::io::Result<()> {
//!     epc::runtime::run_local(async {
//!         let server = EpcServer::start(0, |peer| {
//!             peer.define_method(Method::new("echo", |args| {
//!                 Ok(MethodOutcome::Value(args.into_iter().next().unwrap_or(Sexp::Nil)))
//!             }));
//!         })
//!         .await?;
//!
//!         let client = EpcManager::connect(&format!("127.0.0.1:{}", server.port())).await?;
//!         let reply = client.call_sync("echo", vec![Sexp::string("hi")]).await;
//!         assert_eq!(reply, Ok(Sexp::string("hi")));
//!
//!         client.stop();
//!         server.stop();
//!         Ok(())
//!     })?
//! }
//! ```

pub mod channel;
pub mod deferred;
pub mod error;
pub mod framing;
pub mod manager;
pub mod runtime;
pub mod server;
pub mod sexp;
pub mod wire;

pub use channel::{EventChannel, EventKey};
pub use deferred::{Deferred, Step};
pub use error::EpcError;
pub use manager::{live_managers, EpcManager, Method, MethodOutcome, Role};
pub use server::EpcServer;
pub use sexp::Sexp;
pub use wire::Message;

/// The handful of names almost every user needs.
pub mod prelude {
    pub use crate::deferred::{Deferred, Step};
    pub use crate::error::EpcError;
    pub use crate::manager::{EpcManager, Method, MethodOutcome};
    pub use crate::server::EpcServer;
    pub use crate::sexp::Sexp;
}
