// Domain-layer modules and shared errors/models
pub mod engine {
    pub use crate::engine::*;
}

pub mod filter {
    pub use crate::filter::*;
}

pub mod stats {
    pub use crate::stats::*;
}

pub mod service {
    pub use crate::service::*;
}

pub mod models {
    pub use crate::models::*;
}

pub mod errors {
    pub use crate::errors::*;
}
