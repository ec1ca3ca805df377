pub mod bridge;
pub mod chrome;

pub use chrome::ChromeDriver;
