pub mod dispatcher;
pub mod inbox;
pub mod push;

pub use dispatcher::*;
pub use inbox::*;
pub use push::*;
