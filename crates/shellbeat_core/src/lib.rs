pub mod config;
pub mod error;
pub mod upload;
pub mod validator;

pub use config::{MonitorConfig, ShellbeatConfig, TargetKind};
pub use error::{ShellError, ValidationError};
pub use upload::UploadSpec;
pub use validator::{OutputCheck, OutputValidator};
