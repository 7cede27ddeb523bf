//! Runtime processors for the built-in node kinds.

pub mod choice;
pub mod multicast;
pub mod pipeline;
pub mod simple;
pub mod throttle;
pub mod try_catch;

pub use choice::{ChoiceProcessor, FilterProcessor};
pub use multicast::{MulticastMode, MulticastProcessor};
pub use pipeline::Pipeline;
pub use simple::{SendProcessor, SetBodyProcessor, SetHeaderProcessor, StopProcessor};
pub use throttle::{ThrottleOptions, ThrottleProcessor, ThrottleRate};
pub use try_catch::{CatchClause, TryProcessor};
