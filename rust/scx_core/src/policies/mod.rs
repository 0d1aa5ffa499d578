//! Reference policies bundled with the core.

mod simple;

pub use simple::ScxSimple;
pub use simple::SHARED_DSQ;
