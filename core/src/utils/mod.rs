/// Utility modules
pub mod event_bus;
