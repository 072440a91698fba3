//! A server-side HTTP/2 connection multiplexer.
//!
//! This library owns the lifecycle of a single HTTP/2 connection on top of
//! an already-established duplex byte stream: it consumes inbound frames,
//! multiplexes concurrent request/response streams over the one transport,
//! applies HTTP/2 flow control with weighted prioritization along the
//! RFC 7540 priority tree, and dispatches completed requests to an
//! application handler running on worker tasks.
//!
//! It deliberately does **not** terminate TLS, negotiate ALPN, or perform
//! the HTTP/1.1 upgrade dance; the caller hands in a transport that is
//! ready for the HTTP/2 handshake (see [`server::Builder::upgrade`] for the
//! post-upgrade handoff). Header compression is likewise a collaborator
//! rather than a component: connections drive any codec implementing the
//! [`hpack`] contracts, with a literal-only codec built in.
//!
//! # Getting started
//!
//! ```no_run
//! use http::Response;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), h2mux::Error> {
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8443").await?;
//!
//!     loop {
//!         let (socket, _peer) = listener.accept().await?;
//!         tokio::spawn(async move {
//!             let served = h2mux::server::Builder::new()
//!                 .serve(socket, |request, responder| async move {
//!                     tracing::info!("{} {}", request.method(), request.uri());
//!                     let response = Response::builder().status(200).body(()).unwrap();
//!                     let _ = responder.send_response(response, true).await;
//!                 })
//!                 .await;
//!             if let Err(err) = served {
//!                 tracing::debug!("connection ended: {err}");
//!             }
//!         });
//!     }
//! }
//! ```
//!
//! # Flow control
//!
//! Response bodies are paced by the peer: [`SendBody::send_data`] suspends
//! whenever neither the stream window nor the connection window has credit,
//! and resumes when WINDOW_UPDATE frames arrive. When several streams are
//! waiting, fresh connection credit is split between them in proportion to
//! their weights in the priority tree.
//!
//! Request bodies advertise credit back to the peer as the application
//! consumes them through [`RecvBody::data`].

macro_rules! proto_err {
    (conn: $($msg:tt)+) => {
        tracing::debug!("connection error PROTOCOL_ERROR -- {};", format_args!($($msg)+))
    };
    (stream: $($msg:tt)+) => {
        tracing::debug!("stream error PROTOCOL_ERROR -- {};", format_args!($($msg)+))
    };
}

mod codec;
mod error;
mod frame;
pub mod hpack;
mod proto;
pub mod server;
mod share;

pub use crate::error::{Error, Reason, UserError};
pub use crate::share::{RecvBody, Responder, SendBody};
