pub mod constraints;
pub mod contingent_roles;
pub mod persists;
pub mod servers;
pub mod users;
