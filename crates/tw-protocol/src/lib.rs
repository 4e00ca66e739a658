pub mod errors;
pub mod identity;
pub mod jobs;
pub mod provisioning;
pub mod shadows;
pub mod topics;
pub mod tunnels;

pub use errors::*;
pub use identity::*;
pub use jobs::*;
pub use provisioning::*;
pub use shadows::*;
pub use tunnels::*;
