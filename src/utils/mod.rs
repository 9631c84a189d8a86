pub mod encryption;
pub mod id;
pub mod signing;
