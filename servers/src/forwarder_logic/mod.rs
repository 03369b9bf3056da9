pub mod health;
pub mod runtime;
pub mod shutdown;
