pub mod access;
pub mod delegations;
pub mod health;
pub mod jobs;
pub mod resources;
pub mod users;
