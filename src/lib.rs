pub mod cache;
pub mod clock;
pub mod config;
pub mod duration;
pub mod login;
pub mod notify;
pub mod otp;
pub mod portal;
pub mod relay;
pub mod session;
