mod flow_control;
mod prioritize;
mod state;
mod store;
mod stream;
#[allow(clippy::module_inception)]
mod streams;

pub use self::store::Key;
pub use self::streams::{Config, ConnState, RecvHeaders, Streams};

use self::flow_control::FlowControl;
