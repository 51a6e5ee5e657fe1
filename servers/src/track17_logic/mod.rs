pub mod config;
pub mod logger;
pub mod routes;
pub mod scheduler;
pub mod state;

#[cfg(test)]
mod test_support;
