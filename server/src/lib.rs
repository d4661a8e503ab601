//! Completion-based HTTP/1.x server library.
//!
//! The dispatcher drives a single completion ring for accepts and
//! reads; each connection is a [`Session`] carrying one HTTP/1 stream,
//! and every parsed request becomes a [`Transaction`] executed on a
//! bounded worker pool. Handler writes travel through per-stream
//! sub-rings so they never contend with the accept/read path.
//!
//! ```no_run
//! use server::{Router, Serve, BodySize};
//!
//! let router = Router::new().route("/", |tx, _args| {
//!     tx.reset_response(protocol_http::StatusCode::OK);
//!     let mut body = tx.write_body_start(BodySize::Sized(12), "text/plain")?;
//!     body.write(b"Hello World!")?;
//!     body.close()?;
//!     Ok(())
//! });
//!
//! let serve = Serve::start(router).unwrap();
//! println!("listening on {}", serve.addr());
//! serve.stop().unwrap();
//! ```

pub mod config;
pub mod logging;

mod body;
mod dispatch;
mod error;
mod event;
mod router;
mod session;
mod shared;
mod stream;
mod transaction;
mod worker;

pub use body::{BodyReader, BodySize, BodyWriter, Optimise};
pub use config::Config;
pub use dispatch::{BoundServer, Serve, Server, StopHandle};
pub use error::ServerError;
pub use router::{Handler, HandlerError, Matcher, PathPattern, Router};
pub use transaction::Transaction;

// Re-exported so handlers can name status codes and cookies without a
// separate dependency.
pub use protocol_http::{SameSite, SetCookie, StatusCode};
