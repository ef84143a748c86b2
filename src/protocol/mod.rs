pub mod events;
pub mod incoming;
pub mod outgoing;
pub mod stats;
pub mod tracks;

pub use events::*;
pub use incoming::*;
pub use outgoing::*;
pub use stats::*;
pub use tracks::*;
