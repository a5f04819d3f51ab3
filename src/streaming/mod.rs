mod handlers;
mod prep;
mod server;

pub use prep::{encode_placeholder, prepare_frame_for_streaming};
pub use server::{ServerState, StreamServer};
