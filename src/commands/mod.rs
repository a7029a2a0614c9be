//! CLI commands implementation

pub mod indexes;
pub mod init;
pub mod queue;
pub mod search;
pub mod status;
pub mod sync;

pub use indexes::*;
pub use init::*;
pub use queue::*;
pub use search::*;
pub use status::*;
pub use sync::*;
