//! Link abstraction, the shared link table and the UDP transport.

pub mod interface;
pub mod table;
pub mod transport;
pub mod util;
