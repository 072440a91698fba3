mod framed_read;
mod framed_write;

pub use self::framed_read::{FramedRead, Read};
pub use self::framed_write::{FramedWrite, WriteHandle, WriteJob, channel};
