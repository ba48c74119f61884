pub mod event;
pub mod factory;
pub mod gate;
pub mod job;

pub use event::CheckEvent;
pub use factory::create_client;
pub use gate::{GateState, UploadGate};
pub use job::{CheckOutcome, CheckStatus, ShellJob};
