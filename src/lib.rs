pub mod browser;
pub mod config;
pub mod error;
pub mod extensions;
pub mod flow;
pub mod mail;
pub mod retry;
pub mod server;

// Re-export commonly used items
pub use browser::bridge;
pub use browser::ChromeDriver;
pub use config::{default_user_agent, BrowserLaunchConfig, HeadlessMode};
pub use error::{EngineError, Result};
pub use extensions::ExtensionProvisioner;
pub use flow::{
    Clearance, CookieSet, FlowConfig, FlowDriver, FlowMachine, Registration, SessionState,
};
pub use mail::{CodeMailbox, GuerrillaMailbox};
pub use retry::{run_bounded, run_once, RetryPolicy};
