pub mod bus;
pub mod error;
pub mod topic;

pub use bus::{EventBus, PubSub, SharedPubSub};
pub use error::{FusionError, Result};
pub use topic::{Route, Topics};
