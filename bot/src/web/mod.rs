pub mod app_state;
pub mod control;
pub mod router;
