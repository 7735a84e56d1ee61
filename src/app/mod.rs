pub mod dispatcher;
pub mod messages;
pub mod stdio;

pub use dispatcher::Dispatcher;
pub use stdio::Outbound;
