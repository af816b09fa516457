//! Background runtime services.

pub mod poller;

pub use poller::TaskPoller;
