//! Lead store integration.

pub mod store {
    pub use crate::store::*;
}

pub mod event_stream {
    pub use crate::event_stream::*;
}

pub mod snapshot {
    pub use crate::snapshot::*;
}

pub mod adapter {
    pub use crate::adapter::*;
}
