pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod profile;
pub mod state;
pub mod supervisor;
pub mod terminal;
pub mod trigger;

#[cfg(test)]
pub(crate) mod test_support;
