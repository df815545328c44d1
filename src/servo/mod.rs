pub mod device;
pub mod error;
pub mod network;
pub mod protocol;
pub mod sim;

#[cfg(test)]
mod tests;
